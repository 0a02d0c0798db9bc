//
// Copyright 2019-2022 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! # BridgeRTC -- A Conference Bridge Calling Interface
//!
//! This crate implements the signaling core of a call that routes its
//! media through a conference bridge (a server-side relay): the data
//! model tying a [Call](core::call::Call) to its
//! [CallPeer](core::call_peer::CallPeer)s and to the set of channels
//! allocated on the bridge, and the protocol logic that allocates,
//! updates, and expires those channels while keeping local bookkeeping
//! consistent.
//!
//! Media processing, wire encoding, and UI concerns live behind the
//! traits in [core::platform].

#[macro_use]
extern crate log;

pub mod common;

pub mod error;

/// Core, platform independent functionality.
pub mod core {
    pub mod call;
    pub mod call_manager;
    pub mod call_peer;
    pub mod conference;
    pub mod events;
    pub mod media;
    pub mod platform;
    pub mod signaling;
}

#[cfg(any(test, feature = "sim"))]
/// Simulation implementations of the platform traits, for tests.
pub mod sim;
