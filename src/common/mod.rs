//
// Copyright 2019-2022 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Common types used throughout the library.

use std::fmt;
use std::sync::{Mutex, MutexGuard};

use static_assertions::const_assert_eq;
use strum_macros::EnumIter;

use crate::error::BridgeRtcError;

/// Common Result type, using `anyhow::Error` for Error.
pub type Result<T> = anyhow::Result<T>;

/// Unique call identification number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CallId {
    id: u64,
}

impl CallId {
    pub fn new(id: u64) -> Self {
        Self { id }
    }

    pub fn random() -> Self {
        Self::new(rand::random())
    }

    pub fn as_u64(self) -> u64 {
        self.id
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x{:x}", self.id)
    }
}

impl From<u64> for CallId {
    fn from(item: u64) -> Self {
        CallId::new(item)
    }
}

/// Generate a random session identifier for a peer's signaling session.
pub fn random_session_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}

/// The type of a media stream within a call or a conference content.
///
/// The ordinal is used as a table index by the per-media-type caches,
/// so the variant order is part of the contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, EnumIter)]
pub enum MediaType {
    Audio = 0,
    Video,
}

/// Number of `MediaType` variants, for ordinal-indexed tables.
pub const MEDIA_TYPE_COUNT: usize = 2;
const_assert_eq!(MediaType::Video as usize + 1, MEDIA_TYPE_COUNT);

impl MediaType {
    /// The wire name of the media type, also used as the content name
    /// of the corresponding conference content.
    pub fn as_str(self) -> &'static str {
        match self {
            MediaType::Audio => "audio",
            MediaType::Video => "video",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "audio" => Some(MediaType::Audio),
            "video" => Some(MediaType::Video),
            _ => None,
        }
    }

    pub fn ordinal(self) -> usize {
        self as usize
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The negotiated flow direction of one media stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MediaDirection {
    Inactive,
    SendOnly,
    RecvOnly,
    SendRecv,
}

impl fmt::Display for MediaDirection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The call direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallDirection {
    /// Incoming call.
    InComing,

    /// Outgoing call.
    OutGoing,
}

impl fmt::Display for CallDirection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Tracks the signaling state of a call peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallPeerState {
    /// Peer object exists but no signaling has happened yet.
    Idle,

    /// Outgoing only: the session-initiate is being prepared.
    InitiatingCall,

    /// Outgoing only: the session-initiate is on its way; the user
    /// hears ringing while addresses are harvested and the request is
    /// sent.
    Connecting,

    /// Incoming only: the offer was accepted for processing and the
    /// user is being alerted.
    IncomingCall,

    /// The session is established.
    Connected,

    /// The session ended normally.
    Disconnected,

    /// The session ended because of an error; the reason string on the
    /// peer says why.
    Failed,
}

impl CallPeerState {
    /// Returns `true` if no further signaling can happen for the peer.
    pub fn is_terminal(self) -> bool {
        matches!(self, CallPeerState::Disconnected | CallPeerState::Failed)
    }
}

impl fmt::Display for CallPeerState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Wrapper around `std::sync::Mutex` that carries a human readable
/// label and converts poisoning into a `BridgeRtcError` instead of
/// exposing the poison guard to callers.
pub struct CallMutex<T: ?Sized> {
    /// Human readable label for the mutex, used in the poison error.
    label: String,
    mutex: Mutex<T>,
}

impl<T> CallMutex<T> {
    pub fn new(t: T, label: &str) -> CallMutex<T> {
        CallMutex {
            label: label.to_string(),
            mutex: Mutex::new(t),
        }
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, T>> {
        match self.mutex.lock() {
            Ok(guard) => Ok(guard),
            Err(_) => Err(BridgeRtcError::MutexPoisoned(self.label.clone()).into()),
        }
    }
}
