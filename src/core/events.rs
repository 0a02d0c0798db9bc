//
// Copyright 2019-2022 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Call lifecycle events delivered to the application.
//!
//! Events flow through a bounded channel per
//! [`CallManager`](crate::core::call_manager::CallManager); whoever
//! drives the UI or telephony management consumes the stream. Sending
//! never blocks signaling work: a full queue drops the event with a
//! log line.

use std::collections::HashMap;
use std::fmt;

use futures::channel::mpsc;

use crate::common::{CallId, CallPeerState, MediaDirection, MediaType};

/// Capacity of the event channel; matches the depth used for the
/// internal signaling queues.
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Clone, Debug)]
pub enum CallEvent {
    /// An outgoing call got its first peer.
    CallInitiated { call_id: CallId },

    /// An incoming call got its first peer. The directions say which
    /// media the offer carried, so the UI can pick an audio- or
    /// video-oriented incoming-call affordance.
    CallReceived {
        call_id: CallId,
        directions: HashMap<MediaType, MediaDirection>,
    },

    /// A peer moved to a new signaling state.
    PeerStateChanged {
        call_id: CallId,
        peer_address: String,
        state: CallPeerState,
        reason: Option<String>,
    },
}

impl fmt::Display for CallEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CallEvent::CallInitiated { call_id } => write!(f, "CallInitiated({})", call_id),
            CallEvent::CallReceived { call_id, .. } => write!(f, "CallReceived({})", call_id),
            CallEvent::PeerStateChanged { call_id, state, .. } => {
                write!(f, "PeerStateChanged({}, {})", call_id, state)
            }
        }
    }
}

/// Receiving half handed to the application.
pub type EventStream = mpsc::Receiver<CallEvent>;

/// Sending half shared by the calls of one manager.
#[derive(Clone)]
pub struct EventSender {
    sender: mpsc::Sender<CallEvent>,
}

impl EventSender {
    pub fn send(&self, event: CallEvent) {
        let mut sender = self.sender.clone();
        if sender.is_closed() {
            // The application went away; nothing to notify.
            debug!("send(): event stream is closed while sending: {}", event);
            return;
        }
        if let Err(e) = sender.try_send(event) {
            warn!("send(): dropping event: {}", e);
        }
    }
}

pub fn event_channel() -> (EventSender, EventStream) {
    let (sender, receiver) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    (EventSender { sender }, receiver)
}
