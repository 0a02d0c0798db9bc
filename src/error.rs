//
// Copyright 2019-2022 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Common error codes.

use thiserror::Error;

use crate::common::CallId;

/// Platform independent error conditions.
///
/// Ordinary negotiation failures (timeouts, error replies from the
/// bridge) are *not* represented here; they surface as `None` results.
/// These variants cover invariant and contract violations.
#[derive(Error, Debug)]
pub enum BridgeRtcError {
    // Project wide common error codes
    #[error("Mutex poisoned: {0}")]
    MutexPoisoned(String),
    #[error("Expecting non-none option value in: {0}, var: {1}")]
    OptionValueNotSet(String, String),

    // Call Manager error codes
    #[error("CallId not found in call_map: {0}")]
    CallIdNotFound(CallId),
    #[error("Call peer not found, session: {0}")]
    PeerNotFound(String),

    // Conference state error codes
    #[error("Conference id mismatch: have {current}, response carried {response}")]
    ConferenceIdMismatch { current: String, response: String },
    #[error("No conference has been established for this call")]
    ConferenceNotEstablished,
    #[error("No conference content for media type: {0}")]
    ContentNotFound(String),

    // Stream connector contract error codes
    #[error("Channel has no id assigned")]
    ChannelIdMissing,
    #[error("Channel {0} is not the uplink channel of its content")]
    ChannelNotUplink(String),
}
