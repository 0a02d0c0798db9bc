//
// Copyright 2019-2022 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! The messages we exchange over the signaling channel to establish a
//! session with a remote party. Wire encoding is the transport's
//! business; the core only deals in these structured values.

use std::fmt;

use crate::common::{MediaDirection, MediaType};
use crate::core::conference::PayloadType;

/// An encryption method a party can advertise for its media streams.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncryptionMethod {
    Zrtp,
    SdesSrtp,
    DtlsSrtp,
}

impl fmt::Display for EncryptionMethod {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// One media stream description within an offer or answer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MediaDescription {
    pub media_type: MediaType,
    pub direction: MediaDirection,
    pub payload_types: Vec<PayloadType>,
    /// Encryption methods the sender advertises for this stream.
    pub encryption: Vec<EncryptionMethod>,
}

impl MediaDescription {
    pub fn new(media_type: MediaType, direction: MediaDirection) -> Self {
        Self {
            media_type,
            direction,
            payload_types: Vec::new(),
            encryption: Vec::new(),
        }
    }
}

/// Attended-transfer hint carried by a session-initiate: the attendant
/// at `from` is handing its session `sid` over to `to`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferInfo {
    pub sid: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
}

/// The offer that starts a session.
#[derive(Clone, Debug)]
pub struct SessionInitiate {
    pub sid: String,
    /// Origin address of the message.
    pub from: String,
    /// The initiating party; may be absent, in which case `from` is
    /// taken as the remote party.
    pub initiator: Option<String>,
    pub contents: Vec<MediaDescription>,
    pub transfer: Option<TransferInfo>,
    /// Present when the sender declared whether it acts as conference
    /// focus.
    pub conference_focus: Option<bool>,
}

impl SessionInitiate {
    pub fn remote_party(&self) -> &str {
        self.initiator.as_deref().unwrap_or(&self.from)
    }
}

impl fmt::Display for SessionInitiate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "session-initiate: sid: {}, contents: {}",
            self.sid,
            self.contents.len()
        )
    }
}

/// The answer accepting a session.
#[derive(Clone, Debug)]
pub struct SessionAccept {
    pub sid: String,
    pub contents: Vec<MediaDescription>,
}

/// Why a session is being terminated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal hangup.
    Success,
    /// The local party declined the session.
    Decline,
    /// A security requirement (e.g. mandatory encryption) was not met.
    SecurityError,
    /// Any other error.
    GeneralError,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Ends a session, with a reason and an optional human readable text.
#[derive(Clone, Debug)]
pub struct SessionTerminate {
    pub sid: String,
    pub reason: TerminationReason,
    pub text: Option<String>,
}
