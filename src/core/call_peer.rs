//
// Copyright 2019-2022 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! One remote party in a call, with its signaling state machine.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::common::{
    CallDirection, CallId, CallMutex, CallPeerState, Result,
};
use crate::core::conference::ConferenceDescriptor;
use crate::core::events::{CallEvent, EventSender};
use crate::core::media::PeerMediaHandler;
use crate::core::platform::SignalingTransport;
use crate::core::signaling::{
    EncryptionMethod, MediaDescription, SessionAccept, SessionInitiate, SessionTerminate,
    TerminationReason,
};

/// A remote party of a [`Call`](crate::core::call::Call).
///
/// Cheaply cloneable; all mutable state lives behind shared interior
/// mutability, so every clone observes the same peer.
#[derive(Clone)]
pub struct CallPeer {
    /// The call this peer belongs to.
    call_id: CallId,
    /// The peer's address on the signaling network.
    address: String,
    /// The signaling session identifier.
    sid: String,
    direction: CallDirection,
    state: Arc<CallMutex<CallPeerState>>,
    /// Human readable reason recorded with terminal states.
    state_reason: Arc<CallMutex<Option<String>>>,
    /// Whether the remote party declared itself a conference focus.
    conference_focus: Arc<AtomicBool>,
    media_handler: Arc<PeerMediaHandler>,
    /// The media descriptions the remote party offered.
    remote_contents: Arc<CallMutex<Vec<MediaDescription>>>,
    /// The subset of bridge channels allocated on behalf of this peer,
    /// kept so they can be expired when the peer leaves.
    conference_channels: Arc<CallMutex<Option<ConferenceDescriptor>>>,
    transport: Arc<dyn SignalingTransport>,
    events: EventSender,
}

impl fmt::Display for CallPeer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = match self.state() {
            Ok(v) => format!("{}", v),
            Err(_) => "unavailable".to_string(),
        };
        write!(
            f,
            "peer: {}, sid: {}, direction: {}, state: {}",
            self.address, self.sid, self.direction, state
        )
    }
}

impl fmt::Debug for CallPeer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl CallPeer {
    pub fn new(
        call_id: CallId,
        address: String,
        sid: String,
        direction: CallDirection,
        transport: Arc<dyn SignalingTransport>,
        events: EventSender,
    ) -> Self {
        Self {
            call_id,
            address,
            sid,
            direction,
            state: Arc::new(CallMutex::new(CallPeerState::Idle, "state")),
            state_reason: Arc::new(CallMutex::new(None, "state_reason")),
            conference_focus: Arc::new(AtomicBool::new(false)),
            media_handler: Arc::new(PeerMediaHandler::new()),
            remote_contents: Arc::new(CallMutex::new(Vec::new(), "remote_contents")),
            conference_channels: Arc::new(CallMutex::new(None, "conference_channels")),
            transport,
            events,
        }
    }

    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn sid(&self) -> &str {
        &self.sid
    }

    pub fn direction(&self) -> CallDirection {
        self.direction
    }

    pub fn media_handler(&self) -> &Arc<PeerMediaHandler> {
        &self.media_handler
    }

    pub fn state(&self) -> Result<CallPeerState> {
        Ok(*self.state.lock()?)
    }

    pub fn state_reason(&self) -> Result<Option<String>> {
        Ok(self.state_reason.lock()?.clone())
    }

    /// Updates the signaling state and notifies the application.
    pub fn set_state(&self, new_state: CallPeerState) -> Result<()> {
        self.transition(new_state, None)
    }

    pub fn set_state_with_reason(&self, new_state: CallPeerState, reason: &str) -> Result<()> {
        self.transition(new_state, Some(reason.to_string()))
    }

    fn transition(&self, new_state: CallPeerState, reason: Option<String>) -> Result<()> {
        {
            let mut state = self.state.lock()?;
            if *state == new_state {
                return Ok(());
            }
            info!(
                "transition(): peer: {}, {} -> {}",
                self.address, *state, new_state
            );
            *state = new_state;
            *self.state_reason.lock()? = reason.clone();
        }
        self.events.send(CallEvent::PeerStateChanged {
            call_id: self.call_id,
            peer_address: self.address.clone(),
            state: new_state,
            reason,
        });
        Ok(())
    }

    pub fn is_conference_focus(&self) -> bool {
        self.conference_focus.load(Ordering::SeqCst)
    }

    pub fn set_conference_focus(&self, focus: bool) {
        self.conference_focus.store(focus, Ordering::SeqCst);
    }

    pub fn remote_contents(&self) -> Result<Vec<MediaDescription>> {
        Ok(self.remote_contents.lock()?.clone())
    }

    /// Validates an incoming offer and absorbs what it advertises.
    ///
    /// A malformed offer (no contents, or a content without payload
    /// types) moves the peer to `Failed`; the caller checks the state
    /// afterwards rather than receiving an error.
    pub fn process_session_initiate(&self, initiate: &SessionInitiate) -> Result<()> {
        if initiate.contents.is_empty() {
            self.set_state_with_reason(
                CallPeerState::Failed,
                "offer contained no media descriptions",
            )?;
            return Ok(());
        }
        for content in &initiate.contents {
            if content.payload_types.is_empty() {
                self.set_state_with_reason(
                    CallPeerState::Failed,
                    &format!("offer contained no payload types for {}", content.media_type),
                )?;
                return Ok(());
            }
        }

        let mut encryption: Vec<EncryptionMethod> = Vec::new();
        for content in &initiate.contents {
            for method in &content.encryption {
                if !encryption.contains(method) {
                    encryption.push(*method);
                }
            }
        }
        self.media_handler
            .set_advertised_encryption_methods(encryption)?;

        *self.remote_contents.lock()? = initiate.contents.clone();
        Ok(())
    }

    /// Answers an incoming session by echoing the offered contents.
    pub fn answer(&self) -> Result<()> {
        let accept = SessionAccept {
            sid: self.sid.clone(),
            contents: self.remote_contents()?,
        };
        self.transport.send_session_accept(&self.address, accept)?;
        self.set_state(CallPeerState::Connected)
    }

    /// Ends the session with the given reason. A no-op once the peer
    /// reached a terminal state.
    pub fn hangup(&self, reason: TerminationReason, text: Option<String>) -> Result<()> {
        if self.state()?.is_terminal() {
            return Ok(());
        }
        let terminate = SessionTerminate {
            sid: self.sid.clone(),
            reason,
            text,
        };
        self.transport
            .send_session_terminate(&self.address, terminate)?;
        self.set_state(CallPeerState::Disconnected)
    }

    /// Records the channel subset allocated for this peer, merging
    /// with whatever earlier allocations recorded.
    pub fn record_conference_channels(&self, allocated: &ConferenceDescriptor) -> Result<()> {
        let mut channels = self.conference_channels.lock()?;
        match channels.as_mut() {
            None => *channels = Some(allocated.clone()),
            Some(existing) => {
                if existing.id().is_none() {
                    if let Some(id) = allocated.id() {
                        existing.set_id(id);
                    }
                }
                for content in allocated.contents() {
                    let existing_content = existing.get_or_create_content(content.name());
                    for channel in content.channels() {
                        let already_known = channel
                            .id
                            .as_deref()
                            .map(|id| existing_content.channel_by_id(id).is_some())
                            .unwrap_or(false);
                        if !already_known {
                            existing_content.add_channel(channel.clone());
                        }
                    }
                }
            }
        }
        Ok(())
    }

    pub fn conference_channels(&self) -> Result<Option<ConferenceDescriptor>> {
        Ok(self.conference_channels.lock()?.clone())
    }

    /// Takes the recorded channels, e.g. to expire them on departure.
    pub fn take_conference_channels(&self) -> Result<Option<ConferenceDescriptor>> {
        Ok(self.conference_channels.lock()?.take())
    }

    /// Reconciles a bridge-originated conference update against the
    /// channels recorded for this peer: bridge-side expiry drops the
    /// channel, otherwise announced transport info is refreshed.
    pub fn process_conference_update(&self, update: &ConferenceDescriptor) -> Result<()> {
        let mut channels = self.conference_channels.lock()?;
        let recorded = match channels.as_mut() {
            Some(recorded) => recorded,
            None => return Ok(()),
        };

        for content_update in update.contents() {
            let content = match recorded.content_mut(content_update.name()) {
                Some(content) => content,
                None => continue,
            };
            for channel_update in content_update.channels() {
                let channel_id = match channel_update.id.as_deref() {
                    Some(id) => id,
                    None => continue,
                };
                if content.channel_by_id(channel_id).is_none() {
                    continue;
                }
                if channel_update.expire == Some(0) {
                    info!(
                        "process_conference_update(): peer: {}, bridge expired channel: {}",
                        self.address, channel_id
                    );
                    content.remove_channel_by_id(channel_id);
                } else if let Some(transport) = &channel_update.transport {
                    if let Some(channel) = content.channel_by_id_mut(channel_id) {
                        channel.transport = Some(transport.clone());
                    }
                }
            }
        }
        Ok(())
    }
}
