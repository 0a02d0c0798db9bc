//
// Copyright 2019-2022 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Traits at the boundary toward the host environment: the signaling
//! transport, the media layer's socket factory, and the auto-answer
//! policy. The host constructs concrete implementations and hands them
//! to [`CallManager::new`](crate::core::call_manager::CallManager::new).

use std::collections::HashMap;
use std::time::Duration;

use crate::common::{MediaDirection, MediaType, Result};
use crate::core::call::Call;
use crate::core::conference::{ConferenceDescriptor, RelayAddress};
use crate::core::media::StreamConnector;
use crate::core::signaling::{SessionAccept, SessionInitiate, SessionTerminate};

/// What came back from a correlated conference request.
#[derive(Clone, Debug)]
pub enum ConferenceReply {
    /// A well-formed conference description.
    Conference(ConferenceDescriptor),
    /// The bridge answered with an error.
    Error(String),
    /// The correlated reply was not a conference description at all.
    Unexpected,
}

/// Send/receive primitive toward the signaling network.
///
/// `request_conference` is the single blocking operation in the core:
/// it must correlate exactly one reply and resolve within
/// `reply_timeout`, returning `None` on timeout. Everything else is
/// fire-and-forget or plain sends.
pub trait SignalingTransport: Send + Sync {
    /// Our own address on the signaling network.
    fn local_address(&self) -> String;

    /// The conference bridge configured for this account, if any.
    fn configured_relay(&self) -> Option<RelayAddress>;

    /// Upper bound on the wait in `request_conference`.
    fn reply_timeout(&self) -> Duration;

    /// Sends a conference request and blocks for the correlated reply.
    fn request_conference(
        &self,
        to: &RelayAddress,
        request: ConferenceDescriptor,
    ) -> Option<ConferenceReply>;

    /// Sends a conference set-type message with no reply correlation.
    fn set_conference(&self, to: &RelayAddress, request: ConferenceDescriptor);

    fn send_session_initiate(&self, to: &str, initiate: SessionInitiate) -> Result<()>;
    fn send_session_accept(&self, to: &str, accept: SessionAccept) -> Result<()>;
    fn send_session_terminate(&self, to: &str, terminate: SessionTerminate) -> Result<()>;

    /// Tells a connected peer whether we act as conference focus.
    fn send_conference_info(&self, to: &str, is_focus: bool) -> Result<()>;

    /// Tells a peer that local video streaming was started or stopped.
    fn send_video_content_modify(&self, to: &str, allowed: bool) -> Result<()>;
}

/// Allocates the RTP/RTCP socket pair for one media type. Supplied by
/// the media layer; may fail, in which case no connector is cached.
pub trait StreamConnectorFactory {
    fn create_stream_connector(&self) -> Option<StreamConnector>;
}

/// Decides whether and how to answer an incoming call without user
/// interaction, given the per-media-type directions the offer carried.
pub trait AutoAnswerPolicy: Send + Sync {
    fn auto_answer(&self, call: &Call, directions: &HashMap<MediaType, MediaDirection>);
}

/// Account-level options the core reads, handed down explicitly at
/// construction instead of being looked up in a global registry.
#[derive(Clone, Debug)]
pub struct CallConfig {
    /// Reject incoming sessions whose offer advertises no encryption.
    pub require_encryption: bool,
    /// Whether local video may be transmitted at all.
    pub local_video_allowed: bool,
    /// Whether peers are made aware of remote-input (desktop sharing)
    /// events.
    pub remote_input_aware: bool,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            require_encryption: false,
            local_video_allowed: true,
            remote_input_aware: false,
        }
    }
}
