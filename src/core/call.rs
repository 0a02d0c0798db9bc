//
// Copyright 2019-2022 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! A call and the bridge conference it owns.
//!
//! The `Call` aggregates its peers, keeps the authoritative record of
//! the channels allocated on the conference bridge, and runs the
//! allocation and expiry exchanges against it. Peers ask the call for
//! channels; the call keeps the bookkeeping consistent across peers
//! and partially failing exchanges.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use strum::IntoEnumIterator;

use crate::common::{
    random_session_id, CallDirection, CallId, CallMutex, CallPeerState, MediaDirection, MediaType,
    Result, MEDIA_TYPE_COUNT,
};
use crate::core::call_manager::CallManager;
use crate::core::call_peer::CallPeer;
use crate::core::conference::{ChannelDescriptor, ConferenceDescriptor, ContentDescriptor};
use crate::core::events::CallEvent;
use crate::core::media::{MediaHandler, StreamConnector};
use crate::core::platform::{ConferenceReply, StreamConnectorFactory};
use crate::core::signaling::{
    MediaDescription, SessionInitiate, SessionTerminate, TerminationReason,
};
use crate::error::BridgeRtcError;

/// Map of incoming-offer media directions, defaulting every media type
/// to inactive.
fn offered_directions(contents: &[MediaDescription]) -> HashMap<MediaType, MediaDirection> {
    let mut directions = HashMap::new();
    for media_type in MediaType::iter() {
        directions.insert(media_type, MediaDirection::Inactive);
    }
    for content in contents {
        directions.insert(content.media_type, content.direction);
    }
    directions
}

/// Represents a call between the local party and one or more remote
/// peers, optionally routed through a conference bridge.
///
/// Cheaply cloneable; clones share all state.
#[derive(Clone)]
pub struct Call {
    call_id: CallId,
    direction: CallDirection,
    /// Whether the call's media runs through a conference bridge. Only
    /// bridge-mediated calls ever allocate channels.
    relay_mediated: bool,
    call_manager: CallManager,
    /// The authoritative record of the bridge conference, absent until
    /// the first successful allocation. Its mutex is the serialization
    /// domain for every state mutating conference exchange.
    conference: Arc<CallMutex<Option<ConferenceDescriptor>>>,
    peers: Arc<CallMutex<Vec<CallPeer>>>,
    /// The media handler state shared by every peer that joined the
    /// bridge conference; created on first allocation.
    shared_media_handler: Arc<CallMutex<Option<Arc<MediaHandler>>>>,
    /// One connector slot per media type, indexed by ordinal.
    stream_connectors: Arc<CallMutex<[Option<Arc<StreamConnector>>; MEDIA_TYPE_COUNT]>>,
    /// Whether the local party acts as the focus of a multi-party
    /// conference.
    conference_focus: Arc<AtomicBool>,
    local_video_allowed: Arc<AtomicBool>,
}

impl fmt::Display for Call {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "call_id: {}, direction: {}, relay_mediated: {}",
            self.call_id, self.direction, self.relay_mediated
        )
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl Call {
    pub fn new(
        call_id: CallId,
        direction: CallDirection,
        relay_mediated: bool,
        call_manager: CallManager,
    ) -> Self {
        info!("new(): call_id: {}", call_id);
        let local_video_allowed = call_manager.config().local_video_allowed;
        Self {
            call_id,
            direction,
            relay_mediated,
            call_manager,
            conference: Arc::new(CallMutex::new(None, "conference")),
            peers: Arc::new(CallMutex::new(Vec::new(), "peers")),
            shared_media_handler: Arc::new(CallMutex::new(None, "shared_media_handler")),
            stream_connectors: Arc::new(CallMutex::new(
                Default::default(),
                "stream_connectors",
            )),
            conference_focus: Arc::new(AtomicBool::new(false)),
            local_video_allowed: Arc::new(AtomicBool::new(local_video_allowed)),
        }
    }

    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    pub fn direction(&self) -> CallDirection {
        self.direction
    }

    pub fn is_relay_mediated(&self) -> bool {
        self.relay_mediated
    }

    pub fn is_conference_focus(&self) -> bool {
        self.conference_focus.load(Ordering::SeqCst)
    }

    pub fn peer_count(&self) -> Result<usize> {
        Ok(self.peers.lock()?.len())
    }

    pub fn peers(&self) -> Result<Vec<CallPeer>> {
        Ok(self.peers.lock()?.clone())
    }

    pub fn find_peer_by_session(&self, sid: &str) -> Result<Option<CallPeer>> {
        Ok(self
            .peers
            .lock()?
            .iter()
            .find(|peer| peer.sid() == sid)
            .cloned())
    }

    /// A copy of the current conference state, for inspection.
    pub fn conference_state(&self) -> Result<Option<ConferenceDescriptor>> {
        Ok(self.conference.lock()?.clone())
    }

    fn add_peer(&self, peer: CallPeer) -> Result<()> {
        self.peers.lock()?.push(peer);
        Ok(())
    }

    /// Allocates bridge channels for the given media descriptions on
    /// behalf of `peer`.
    ///
    /// Returns the subset of the conference relevant to the caller:
    /// for each requested content, its local (uplink) channel plus the
    /// remote channels the bridge just allocated. `Ok(None)` means no
    /// channels could be allocated and the caller may fall back to
    /// direct media; only a conference-id divergence is an error.
    pub fn allocate_conference_channels(
        &self,
        peer: &CallPeer,
        requests: &[MediaDescription],
    ) -> Result<Option<ConferenceDescriptor>> {
        if !self.relay_mediated {
            return Ok(None);
        }

        // Every peer of a bridge conference must funnel media through
        // the one shared handler state. A peer that still runs streams
        // on a private handler cannot be folded in.
        let peer_handler = peer.media_handler();
        let peer_inner = peer_handler.media_handler()?;
        let already_shared = match self.shared_media_handler.lock()?.as_ref() {
            Some(handler) => Arc::ptr_eq(handler, &peer_inner),
            None => false,
        };
        if !already_shared {
            for media_type in MediaType::iter() {
                if peer_handler.has_stream(media_type)? {
                    info!(
                        "allocate_conference_channels(): peer {} already has a {} stream, refusing",
                        peer.address(),
                        media_type
                    );
                    return Ok(None);
                }
            }
        }

        let transport = self.call_manager.transport();
        let mut conference = self.conference.lock()?;

        let relay = match conference.as_ref().and_then(|c| c.relay_address().cloned()) {
            Some(relay) => relay,
            None => match transport.configured_relay() {
                Some(relay) => relay,
                None => {
                    info!("allocate_conference_channels(): no bridge configured");
                    return Ok(None);
                }
            },
        };

        let mut request = ConferenceDescriptor::new();
        if let Some(id) = conference.as_ref().and_then(|c| c.id()) {
            request.set_id(id);
        }
        for description in requests {
            let content_name = description.media_type.as_str();
            // The local channel carries the uplink for the whole call;
            // request one only while the content has none.
            let local_channel_needed =
                match conference.as_ref().and_then(|c| c.content(content_name)) {
                    Some(content) => content.channel_count() == 0,
                    None => true,
                };
            let content_request = request.get_or_create_content(content_name);
            if local_channel_needed {
                content_request.add_channel(ChannelDescriptor::offering(
                    description.payload_types.clone(),
                ));
            }
            content_request.add_channel(ChannelDescriptor::offering(
                description.payload_types.clone(),
            ));
        }

        let response = match transport.request_conference(&relay, request) {
            Some(ConferenceReply::Conference(response)) => response,
            Some(ConferenceReply::Error(text)) => {
                info!(
                    "allocate_conference_channels(): bridge returned an error: {}",
                    text
                );
                return Ok(None);
            }
            Some(ConferenceReply::Unexpected) => {
                info!("allocate_conference_channels(): reply is not a conference description");
                return Ok(None);
            }
            None => {
                info!(
                    "allocate_conference_channels(): no reply within {:?}",
                    transport.reply_timeout()
                );
                return Ok(None);
            }
        };

        // Fold the response into the conference record: adopt it
        // wholesale the first time, append afterwards. Channels only
        // ever accumulate here; the bridge never implicitly removes.
        match conference.as_mut() {
            None => {
                let mut adopted = response.clone();
                if adopted.relay_address().is_none() {
                    adopted.set_relay_address(relay.clone());
                }
                *conference = Some(adopted);
            }
            Some(state) => {
                let current_id = state.id().map(str::to_string);
                let response_id = response.id().map(str::to_string);
                match (current_id, response_id) {
                    (None, Some(response_id)) => state.set_id(&response_id),
                    (None, None) => {}
                    (Some(current), response_id) => {
                        if response_id.as_deref() != Some(current.as_str()) {
                            return Err(BridgeRtcError::ConferenceIdMismatch {
                                current,
                                response: response_id
                                    .unwrap_or_else(|| "<none>".to_string()),
                            }
                            .into());
                        }
                    }
                }
                for content_response in response.contents() {
                    let content = state.get_or_create_content(content_response.name());
                    for channel_response in content_response.channels() {
                        content.add_channel(channel_response.clone());
                    }
                }
            }
        }

        let merged = conference.as_ref().ok_or_else(|| {
            BridgeRtcError::OptionValueNotSet(
                "allocate_conference_channels()".to_string(),
                "conference".to_string(),
            )
        })?;

        // The result is a subset of the whole conference record: the
        // contents the caller asked for, each with its local channel
        // and the remote channels from this response.
        let mut result = ConferenceDescriptor::new();
        if let Some(id) = merged.id() {
            result.set_id(id);
        }
        for description in requests {
            let content_name = description.media_type.as_str();
            let content_response = match response.content(content_name) {
                Some(content) => content,
                None => continue,
            };
            let mut content_result = ContentDescriptor::new(content_name);

            // The local channel may stem from an earlier exchange, but
            // the current caller still needs to know about it.
            let local_channel = merged
                .content(content_name)
                .and_then(|content| content.channel(0))
                .cloned();
            let local_channel_id = local_channel
                .as_ref()
                .and_then(|channel| channel.id.clone());
            if let Some(local_channel) = local_channel {
                content_result.add_channel(local_channel);
            }

            for channel_response in content_response.channels() {
                let is_local = match (&local_channel_id, &channel_response.id) {
                    (Some(local_id), Some(response_id)) => local_id == response_id,
                    _ => false,
                };
                if !is_local {
                    content_result.add_channel(channel_response.clone());
                }
            }
            result.add_content(content_result);
        }

        drop(conference);

        let shared_handler = {
            let mut shared = self.shared_media_handler.lock()?;
            match shared.as_ref() {
                Some(handler) => Arc::clone(handler),
                None => {
                    let handler = Arc::new(MediaHandler::new());
                    *shared = Some(Arc::clone(&handler));
                    handler
                }
            }
        };
        peer_handler.set_media_handler(shared_handler)?;
        peer.record_conference_channels(&result)?;

        Ok(Some(result))
    }

    /// Expires the bridge channels named by `conference` on behalf of
    /// `peer` and prunes them from the conference record.
    ///
    /// Fire-and-forget: no reply is awaited. Channels that are already
    /// gone are lookup misses, not errors, and a descriptor for a
    /// different conference id is ignored entirely.
    pub fn expire_conference_channels(
        &self,
        peer: &CallPeer,
        conference: &ConferenceDescriptor,
    ) -> Result<()> {
        let mut guard = self.conference.lock()?;
        let state = match guard.as_mut() {
            Some(state) => state,
            None => return Ok(()),
        };
        let conference_id = match (state.id(), conference.id()) {
            (Some(current), Some(requested)) if current == requested => current.to_string(),
            _ => {
                // The request concerns a superseded conference.
                return Ok(());
            }
        };

        let mut request = ConferenceDescriptor::new();
        request.set_id(&conference_id);
        for content in conference.contents() {
            let state_content = match state.content(content.name()) {
                Some(state_content) => state_content,
                None => continue,
            };
            for channel in content.channels() {
                let channel_id = match channel.id.as_deref() {
                    Some(id) => id,
                    None => continue,
                };
                if state_content.channel_by_id(channel_id).is_some() {
                    request
                        .get_or_create_content(content.name())
                        .add_channel(ChannelDescriptor::expired(channel_id));
                }
            }
        }

        // Prune what the request expires from the conference record.
        // A content left with exactly one channel holds only the
        // uplink, which must not outlive its remote channels.
        let content_names: Vec<String> = request
            .contents()
            .iter()
            .map(|content| content.name().to_string())
            .collect();
        for content_name in content_names {
            let channel_ids: Vec<String> = request
                .content(&content_name)
                .map(|content| {
                    content
                        .channels()
                        .iter()
                        .filter_map(|channel| channel.id.clone())
                        .collect()
                })
                .unwrap_or_default();
            let state_content = match state.content_mut(&content_name) {
                Some(state_content) => state_content,
                None => continue,
            };
            let mut expired_uplink = None;
            for channel_id in channel_ids {
                state_content.remove_channel_by_id(&channel_id);
                if state_content.channel_count() == 1 {
                    if let Some(uplink_id) = state_content
                        .channel(0)
                        .and_then(|channel| channel.id.clone())
                    {
                        info!(
                            "expire_conference_channels(): peer {} took the last remote channel of {}, expiring uplink {}",
                            peer.address(),
                            content_name,
                            uplink_id
                        );
                        state_content.remove_channel_by_id(&uplink_id);
                        expired_uplink = Some(uplink_id);
                    }
                    break;
                }
            }
            if let Some(uplink_id) = expired_uplink {
                if let Some(content_request) = request.content_mut(&content_name) {
                    content_request.add_channel(ChannelDescriptor::expired(&uplink_id));
                }
            }
        }

        match state.relay_address().cloned() {
            Some(relay) => self.call_manager.transport().set_conference(&relay, request),
            None => warn!("expire_conference_channels(): conference has no relay address"),
        }
        Ok(())
    }

    /// Handles a conference update pushed by the bridge.
    ///
    /// Returns `false` when the update concerns some other call (no
    /// conference here, or a different id) and must be offered to the
    /// remaining call instances. Returns `true` once handled; the
    /// update has then been stripped of the call-scoped uplink
    /// channels and forwarded to every peer, and must not be
    /// reprocessed elsewhere.
    pub fn process_conference_update(&self, update: &mut ConferenceDescriptor) -> Result<bool> {
        {
            let guard = self.conference.lock()?;
            let state = match guard.as_ref() {
                Some(state) => state,
                None => return Ok(false),
            };
            match (state.id(), update.id()) {
                (Some(current), Some(updated)) if current == updated => {}
                _ => return Ok(false),
            }

            // The uplink channels are call-scoped bookkeeping, not
            // peer state; drop them before peers see the update.
            for media_type in MediaType::iter() {
                let content_name = media_type.as_str();
                let local_id = match state
                    .content(content_name)
                    .and_then(|content| content.local_channel_id())
                {
                    Some(local_id) => local_id.to_string(),
                    None => continue,
                };
                if let Some(content_update) = update.content_mut(content_name) {
                    content_update.remove_channel_by_id(&local_id);
                }
            }
        }

        for peer in self.peers.lock()?.iter() {
            peer.process_conference_update(update)?;
        }
        Ok(true)
    }

    /// Returns the connector for the uplink channel of `media_type`,
    /// creating and caching it on first use.
    ///
    /// Only the local (index 0) channel of an established content may
    /// be asked for; anything else is a caller bug and fails loudly.
    pub fn create_stream_connector(
        &self,
        media_type: MediaType,
        channel: &ChannelDescriptor,
        factory: &dyn StreamConnectorFactory,
    ) -> Result<Option<Arc<StreamConnector>>> {
        let channel_id = channel
            .id
            .as_deref()
            .ok_or(BridgeRtcError::ChannelIdMissing)?;
        {
            let conference = self.conference.lock()?;
            let state = conference
                .as_ref()
                .ok_or(BridgeRtcError::ConferenceNotEstablished)?;
            let content = state
                .content(media_type.as_str())
                .ok_or_else(|| BridgeRtcError::ContentNotFound(media_type.to_string()))?;
            if content.local_channel_id() != Some(channel_id) {
                return Err(BridgeRtcError::ChannelNotUplink(channel_id.to_string()).into());
            }
        }

        let mut connectors = self.stream_connectors.lock()?;
        let slot = &mut connectors[media_type.ordinal()];
        if let Some(connector) = slot.as_ref() {
            return Ok(Some(Arc::clone(connector)));
        }
        match factory.create_stream_connector() {
            Some(connector) => {
                let connector = Arc::new(connector);
                *slot = Some(Arc::clone(&connector));
                Ok(Some(connector))
            }
            None => {
                warn!(
                    "create_stream_connector(): factory produced no connector for {}",
                    media_type
                );
                Ok(None)
            }
        }
    }

    /// Evicts the cached connector of one media type.
    pub fn close_stream_connector(&self, media_type: MediaType) -> Result<()> {
        if self.stream_connectors.lock()?[media_type.ordinal()]
            .take()
            .is_some()
        {
            info!("close_stream_connector(): {} connector closed", media_type);
        }
        Ok(())
    }

    /// Evicts every cached connector; part of call teardown.
    pub fn close_stream_connectors(&self) -> Result<()> {
        for media_type in MediaType::iter() {
            self.close_stream_connector(media_type)?;
        }
        Ok(())
    }

    /// Creates a peer for `callee` and sends it a session-initiate.
    ///
    /// The peer is reported ringing (`Connecting`) before the send, so
    /// the user hears progress while addresses are harvested; a send
    /// failure is guaranteed to move the peer to `Failed`.
    pub fn initiate_session(
        &self,
        callee: &str,
        contents: Vec<MediaDescription>,
    ) -> Result<CallPeer> {
        info!("initiate_session(): callee: {}", callee);
        let transport = self.call_manager.transport();
        let peer = CallPeer::new(
            self.call_id,
            callee.to_string(),
            random_session_id(),
            CallDirection::OutGoing,
            Arc::clone(&transport),
            self.call_manager.events().clone(),
        );
        self.add_peer(peer.clone())?;
        peer.set_state(CallPeerState::InitiatingCall)?;

        // The first peer makes the call itself news.
        if self.peer_count()? == 1 {
            self.call_manager.events().send(CallEvent::CallInitiated {
                call_id: self.call_id,
            });
        }

        let media_handler = peer.media_handler();
        media_handler.set_local_video_enabled(self.local_video_allowed.load(Ordering::SeqCst));
        media_handler.set_remote_input_aware(self.call_manager.config().remote_input_aware);

        peer.set_state(CallPeerState::Connecting)?;

        let initiate = SessionInitiate {
            sid: peer.sid().to_string(),
            from: transport.local_address(),
            initiator: Some(transport.local_address()),
            contents,
            transfer: None,
            conference_focus: None,
        };
        let sent = transport.send_session_initiate(peer.address(), initiate);
        if let Err(send_error) = sent {
            // The peer must never be left stuck in Connecting.
            if let Err(state_error) =
                peer.set_state_with_reason(CallPeerState::Failed, "failed to send session-initiate")
            {
                error!("initiate_session(): could not fail peer: {}", state_error);
            }
            return Err(send_error);
        }
        Ok(peer)
    }

    /// Processes an incoming session-initiate, creating the peer.
    ///
    /// Returns `Ok(None)` when the offer was rejected (malformed, or
    /// encryption policy unmet) or when an attended-transfer answer
    /// failed; the session is terminated toward the remote party in
    /// the reject cases.
    pub fn process_session_initiate(&self, initiate: SessionInitiate) -> Result<Option<CallPeer>> {
        info!("process_session_initiate(): {}", initiate);
        let transport = self.call_manager.transport();
        let peer = CallPeer::new(
            self.call_id,
            initiate.remote_party().to_string(),
            initiate.sid.clone(),
            CallDirection::InComing,
            Arc::clone(&transport),
            self.call_manager.events().clone(),
        );
        self.add_peer(peer.clone())?;

        // Attended transfer is best effort: a failure inspecting the
        // hint must not abort normal incoming-call handling.
        let attendant = match self.detect_attended_transfer(&initiate) {
            Ok(attendant) => attendant,
            Err(e) => {
                error!(
                    "process_session_initiate(): transfer inspection failed: {}",
                    e
                );
                None
            }
        };

        if let Some(is_focus) = initiate.conference_focus {
            peer.set_conference_focus(is_focus);
        }

        // Make sure the offer looks alright before alerting anyone.
        peer.process_session_initiate(&initiate)?;

        if self.call_manager.config().require_encryption
            && peer
                .media_handler()
                .advertised_encryption_methods()?
                .is_empty()
        {
            let reason_text = "encryption is required but the remote party offered none";
            let terminate = SessionTerminate {
                sid: initiate.sid.clone(),
                reason: TerminationReason::SecurityError,
                text: Some(reason_text.to_string()),
            };
            if let Err(e) = transport.send_session_terminate(peer.address(), terminate) {
                error!(
                    "process_session_initiate(): failed to send security reject: {}",
                    e
                );
            }
            peer.set_state_with_reason(CallPeerState::Failed, reason_text)?;
            return Ok(None);
        }

        if peer.state()? == CallPeerState::Failed {
            return Ok(None);
        }

        peer.set_state(CallPeerState::IncomingCall)?;

        if let Some(attendant) = attendant {
            // Answer before hanging up on the attendant, so there is
            // no window with zero connected parties.
            let answered = match peer.answer() {
                Ok(()) => Some(peer.clone()),
                Err(e) => {
                    info!(
                        "process_session_initiate(): failed to answer transferred call: {}",
                        e
                    );
                    None
                }
            };
            if let Err(e) = attendant.hangup(TerminationReason::Success, None) {
                error!(
                    "process_session_initiate(): failed to hang up on attendant as part of session transfer: {}",
                    e
                );
            }
            return Ok(answered);
        }

        let directions = offered_directions(&initiate.contents);
        if self.peer_count()? == 1 {
            self.call_manager.events().send(CallEvent::CallReceived {
                call_id: self.call_id,
                directions: directions.clone(),
            });
        }
        self.call_manager
            .auto_answer_policy()
            .auto_answer(self, &directions);

        Ok(Some(peer))
    }

    /// Looks for a live attendant session referenced by the offer's
    /// transfer hint, checking that the hint names the attendant as
    /// origin and us as destination.
    fn detect_attended_transfer(&self, initiate: &SessionInitiate) -> Result<Option<CallPeer>> {
        let transfer = match &initiate.transfer {
            Some(transfer) => transfer,
            None => return Ok(None),
        };
        let sid = match &transfer.sid {
            Some(sid) => sid,
            None => return Ok(None),
        };
        let attendant = match self.call_manager.find_call_by_session(sid)? {
            Some((_, attendant)) => attendant,
            None => return Ok(None),
        };
        let local_address = self.call_manager.transport().local_address();
        if transfer.from.as_deref() == Some(attendant.address())
            && transfer.to.as_deref() == Some(local_address.as_str())
        {
            info!(
                "detect_attended_transfer(): transfer from attendant {}",
                attendant.address()
            );
            Ok(Some(attendant))
        } else {
            Ok(None)
        }
    }

    /// Hangs up one peer, releasing its bridge channels and dropping
    /// it from the call.
    pub fn hangup_peer(&self, peer: &CallPeer, reason: TerminationReason) -> Result<()> {
        info!("hangup_peer(): {}", peer);
        peer.hangup(reason, None)?;
        if let Some(channels) = peer.take_conference_channels()? {
            self.expire_conference_channels(peer, &channels)?;
        }
        self.peers.lock()?.retain(|p| p.sid() != peer.sid());
        Ok(())
    }

    /// Declares or revokes the local party as conference focus,
    /// informing every connected peer when the answer changes.
    pub fn set_conference_focus(&self, focus: bool) -> Result<()> {
        let old = self.conference_focus.swap(focus, Ordering::SeqCst);
        if old == focus {
            return Ok(());
        }
        let transport = self.call_manager.transport();
        for peer in self.peers.lock()?.iter() {
            if peer.state()? == CallPeerState::Connected {
                if let Err(e) = transport.send_conference_info(peer.address(), focus) {
                    error!(
                        "set_conference_focus(): failed to notify {}: {}",
                        peer.address(),
                        e
                    );
                }
            }
        }
        Ok(())
    }

    /// Starts or stops local video streaming toward every peer.
    pub fn modify_video_content(&self, allowed: bool) -> Result<()> {
        info!(
            "modify_video_content(): {} local video streaming",
            if allowed { "start" } else { "stop" }
        );
        self.local_video_allowed.store(allowed, Ordering::SeqCst);
        let transport = self.call_manager.transport();
        for peer in self.peers.lock()?.iter() {
            transport.send_video_content_modify(peer.address(), allowed)?;
            peer.media_handler().set_local_video_enabled(allowed);
        }
        Ok(())
    }

    /// Ends the call: hangs up the remaining peers, expires whatever
    /// channels are still allocated, and drops the conference record
    /// and cached connectors.
    pub fn terminate(&self) -> Result<()> {
        info!("terminate(): call_id: {}", self.call_id);
        let peers = self.peers.lock()?.clone();
        for peer in &peers {
            if !peer.state()?.is_terminal() {
                if let Err(e) = peer.hangup(TerminationReason::Success, None) {
                    error!("terminate(): failed to hang up {}: {}", peer.address(), e);
                }
            }
        }

        let mut conference = self.conference.lock()?;
        if let Some(state) = conference.take() {
            match state.relay_address() {
                Some(relay) => {
                    let mut request = ConferenceDescriptor::new();
                    if let Some(id) = state.id() {
                        request.set_id(id);
                    }
                    for content in state.contents() {
                        for channel in content.channels() {
                            if let Some(id) = channel.id.as_deref() {
                                request
                                    .get_or_create_content(content.name())
                                    .add_channel(ChannelDescriptor::expired(id));
                            }
                        }
                    }
                    if request.channel_count() > 0 {
                        self.call_manager.transport().set_conference(relay, request);
                    }
                }
                None => {
                    warn!("terminate(): conference has no relay address, nothing to expire")
                }
            }
        }
        drop(conference);

        self.close_stream_connectors()?;
        *self.shared_media_handler.lock()? = None;
        self.peers.lock()?.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::core::conference::{PayloadType, RelayAddress};
    use crate::core::platform::CallConfig;
    use crate::sim::{SimAutoAnswer, SimConnectorFactory, SimTransport};

    use super::*;

    struct TestContext {
        transport: Arc<SimTransport>,
        call: Call,
    }

    fn setup_bridge_call() -> TestContext {
        let transport = Arc::new(SimTransport::new(
            "alice@example.com",
            Some(RelayAddress::new("bridge.example.com")),
        ));
        let (manager, _event_stream) = CallManager::new(
            CallConfig::default(),
            transport.clone(),
            Arc::new(SimAutoAnswer::new()),
        );
        let call = manager.create_outgoing_call(true).unwrap();
        TestContext { transport, call }
    }

    fn audio_request() -> MediaDescription {
        let mut description = MediaDescription::new(MediaType::Audio, MediaDirection::SendRecv);
        description
            .payload_types
            .push(PayloadType::new(111, "opus", 48000));
        description
    }

    fn reply(id: &str, contents: &[(&str, &[&str])]) -> ConferenceReply {
        let mut conference = ConferenceDescriptor::new();
        conference.set_id(id);
        for (content_name, channel_ids) in contents {
            let content = conference.get_or_create_content(content_name);
            for channel_id in *channel_ids {
                content.add_channel(ChannelDescriptor {
                    id: Some(channel_id.to_string()),
                    ..Default::default()
                });
            }
        }
        ConferenceReply::Conference(conference)
    }

    fn channel_ids(conference: &ConferenceDescriptor, content_name: &str) -> Vec<String> {
        conference
            .content(content_name)
            .map(|content| {
                content
                    .channels()
                    .iter()
                    .filter_map(|channel| channel.id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn expire_request(id: &str, content_name: &str, channel_id: &str) -> ConferenceDescriptor {
        let mut conference = ConferenceDescriptor::new();
        conference.set_id(id);
        conference
            .get_or_create_content(content_name)
            .add_channel(ChannelDescriptor {
                id: Some(channel_id.to_string()),
                ..Default::default()
            });
        conference
    }

    #[test]
    fn first_allocation_adopts_bridge_response() {
        let ctx = setup_bridge_call();
        let peer = ctx
            .call
            .initiate_session("bob@example.com", vec![audio_request()])
            .unwrap();

        ctx.transport
            .add_conference_reply(Some(reply("conf1", &[("audio", &["localCh", "remoteCh1"])])));
        let result = ctx
            .call
            .allocate_conference_channels(&peer, &[audio_request()])
            .unwrap()
            .unwrap();

        assert_eq!(Some("conf1"), result.id());
        assert_eq!(vec!["localCh", "remoteCh1"], channel_ids(&result, "audio"));

        let state = ctx.call.conference_state().unwrap().unwrap();
        assert_eq!(Some("conf1"), state.id());
        assert_eq!(vec!["localCh", "remoteCh1"], channel_ids(&state, "audio"));

        // The request carried both a local and a remote channel entry.
        let requests = ctx.transport.conference_requests();
        assert_eq!(1, requests.len());
        assert_eq!(None, requests[0].id());
        assert_eq!(2, requests[0].content("audio").unwrap().channel_count());
    }

    #[test]
    fn local_channel_is_never_rerequested() {
        let ctx = setup_bridge_call();
        let peer1 = ctx
            .call
            .initiate_session("bob@example.com", vec![audio_request()])
            .unwrap();
        let peer2 = ctx
            .call
            .initiate_session("carol@example.com", vec![audio_request()])
            .unwrap();

        ctx.transport
            .add_conference_reply(Some(reply("conf1", &[("audio", &["localCh", "remoteCh1"])])));
        ctx.call
            .allocate_conference_channels(&peer1, &[audio_request()])
            .unwrap()
            .unwrap();

        ctx.transport
            .add_conference_reply(Some(reply("conf1", &[("audio", &["remoteCh2"])])));
        let result = ctx
            .call
            .allocate_conference_channels(&peer2, &[audio_request()])
            .unwrap()
            .unwrap();

        // The second caller sees the uplink plus only its own remote.
        assert_eq!(vec!["localCh", "remoteCh2"], channel_ids(&result, "audio"));

        // Channels accumulate in the conference record.
        let state = ctx.call.conference_state().unwrap().unwrap();
        assert_eq!(
            vec!["localCh", "remoteCh1", "remoteCh2"],
            channel_ids(&state, "audio")
        );

        // The second request reused the conference id and asked for a
        // single (remote) channel.
        let requests = ctx.transport.conference_requests();
        assert_eq!(2, requests.len());
        assert_eq!(Some("conf1"), requests[1].id());
        assert_eq!(1, requests[1].content("audio").unwrap().channel_count());
    }

    #[test]
    fn result_contains_only_requested_contents() {
        let ctx = setup_bridge_call();
        let peer = ctx
            .call
            .initiate_session("bob@example.com", vec![audio_request()])
            .unwrap();

        // The bridge volunteers a video content nobody asked about.
        ctx.transport.add_conference_reply(Some(reply(
            "conf1",
            &[("audio", &["localCh", "remoteCh1"]), ("video", &["vCh"])],
        )));
        let result = ctx
            .call
            .allocate_conference_channels(&peer, &[audio_request()])
            .unwrap()
            .unwrap();

        assert!(result.content("audio").is_some());
        assert!(result.content("video").is_none());
    }

    #[test]
    fn conference_id_divergence_is_fatal() {
        let ctx = setup_bridge_call();
        let peer = ctx
            .call
            .initiate_session("bob@example.com", vec![audio_request()])
            .unwrap();

        ctx.transport
            .add_conference_reply(Some(reply("conf1", &[("audio", &["localCh", "remoteCh1"])])));
        ctx.call
            .allocate_conference_channels(&peer, &[audio_request()])
            .unwrap()
            .unwrap();

        ctx.transport
            .add_conference_reply(Some(reply("conf2", &[("audio", &["remoteCh2"])])));
        let error = ctx
            .call
            .allocate_conference_channels(&peer, &[audio_request()])
            .unwrap_err();
        match error.downcast_ref::<BridgeRtcError>() {
            Some(BridgeRtcError::ConferenceIdMismatch { current, response }) => {
                assert_eq!("conf1", current);
                assert_eq!("conf2", response);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn negotiation_failures_yield_no_channels() {
        let ctx = setup_bridge_call();
        let peer = ctx
            .call
            .initiate_session("bob@example.com", vec![audio_request()])
            .unwrap();

        // Timeout: no reply scripted.
        assert!(ctx
            .call
            .allocate_conference_channels(&peer, &[audio_request()])
            .unwrap()
            .is_none());

        ctx.transport
            .add_conference_reply(Some(ConferenceReply::Error("internal".to_string())));
        assert!(ctx
            .call
            .allocate_conference_channels(&peer, &[audio_request()])
            .unwrap()
            .is_none());

        ctx.transport
            .add_conference_reply(Some(ConferenceReply::Unexpected));
        assert!(ctx
            .call
            .allocate_conference_channels(&peer, &[audio_request()])
            .unwrap()
            .is_none());

        assert!(ctx.call.conference_state().unwrap().is_none());
    }

    #[test]
    fn allocation_is_a_no_op_without_a_bridge() {
        // A call that never was bridge-mediated.
        let transport = Arc::new(SimTransport::new(
            "alice@example.com",
            Some(RelayAddress::new("bridge.example.com")),
        ));
        let (manager, _event_stream) = CallManager::new(
            CallConfig::default(),
            transport.clone(),
            Arc::new(SimAutoAnswer::new()),
        );
        let call = manager.create_outgoing_call(false).unwrap();
        let peer = call
            .initiate_session("bob@example.com", vec![audio_request()])
            .unwrap();
        assert!(call
            .allocate_conference_channels(&peer, &[audio_request()])
            .unwrap()
            .is_none());
        assert!(transport.conference_requests().is_empty());

        // A bridge-mediated call without any bridge configured.
        let transport = Arc::new(SimTransport::new("alice@example.com", None));
        let (manager, _event_stream) = CallManager::new(
            CallConfig::default(),
            transport.clone(),
            Arc::new(SimAutoAnswer::new()),
        );
        let call = manager.create_outgoing_call(true).unwrap();
        let peer = call
            .initiate_session("bob@example.com", vec![audio_request()])
            .unwrap();
        assert!(call
            .allocate_conference_channels(&peer, &[audio_request()])
            .unwrap()
            .is_none());
        assert!(transport.conference_requests().is_empty());
    }

    #[test]
    fn peer_with_private_streams_is_refused() {
        let ctx = setup_bridge_call();
        let peer1 = ctx
            .call
            .initiate_session("bob@example.com", vec![audio_request()])
            .unwrap();
        let peer2 = ctx
            .call
            .initiate_session("carol@example.com", vec![audio_request()])
            .unwrap();

        ctx.transport
            .add_conference_reply(Some(reply("conf1", &[("audio", &["localCh", "remoteCh1"])])));
        ctx.call
            .allocate_conference_channels(&peer1, &[audio_request()])
            .unwrap()
            .unwrap();

        // peer2 streams on its private handler; folding it into the
        // conference would split the media state.
        peer2
            .media_handler()
            .media_handler()
            .unwrap()
            .set_stream(MediaType::Audio, true)
            .unwrap();
        assert!(ctx
            .call
            .allocate_conference_channels(&peer2, &[audio_request()])
            .unwrap()
            .is_none());
        assert_eq!(1, ctx.transport.conference_requests().len());
    }

    #[test]
    fn allocation_rebinds_peers_to_one_shared_handler() {
        let ctx = setup_bridge_call();
        let peer1 = ctx
            .call
            .initiate_session("bob@example.com", vec![audio_request()])
            .unwrap();
        let peer2 = ctx
            .call
            .initiate_session("carol@example.com", vec![audio_request()])
            .unwrap();

        ctx.transport
            .add_conference_reply(Some(reply("conf1", &[("audio", &["localCh", "remoteCh1"])])));
        ctx.call
            .allocate_conference_channels(&peer1, &[audio_request()])
            .unwrap()
            .unwrap();
        ctx.transport
            .add_conference_reply(Some(reply("conf1", &[("audio", &["remoteCh2"])])));
        ctx.call
            .allocate_conference_channels(&peer2, &[audio_request()])
            .unwrap()
            .unwrap();

        let handler1 = peer1.media_handler().media_handler().unwrap();
        let handler2 = peer2.media_handler().media_handler().unwrap();
        assert!(Arc::ptr_eq(&handler1, &handler2));
    }

    #[test]
    fn expiring_the_last_remote_channel_expires_the_uplink_too() {
        let ctx = setup_bridge_call();
        let peer = ctx
            .call
            .initiate_session("bob@example.com", vec![audio_request()])
            .unwrap();

        ctx.transport
            .add_conference_reply(Some(reply("conf1", &[("audio", &["localCh", "remoteCh1"])])));
        ctx.call
            .allocate_conference_channels(&peer, &[audio_request()])
            .unwrap()
            .unwrap();
        ctx.transport
            .add_conference_reply(Some(reply("conf1", &[("audio", &["remoteCh2"])])));
        ctx.call
            .allocate_conference_channels(&peer, &[audio_request()])
            .unwrap()
            .unwrap();

        // Expiring one of two remotes leaves the uplink alone.
        ctx.call
            .expire_conference_channels(&peer, &expire_request("conf1", "audio", "remoteCh1"))
            .unwrap();
        let state = ctx.call.conference_state().unwrap().unwrap();
        assert_eq!(vec!["localCh", "remoteCh2"], channel_ids(&state, "audio"));

        let sets = ctx.transport.conference_sets();
        assert_eq!(1, sets.len());
        assert_eq!(vec!["remoteCh1"], channel_ids(&sets[0], "audio"));
        assert!(sets[0]
            .content("audio")
            .unwrap()
            .channels()
            .iter()
            .all(|channel| channel.expire == Some(0)));

        // Expiring the last remote takes the uplink with it.
        ctx.call
            .expire_conference_channels(&peer, &expire_request("conf1", "audio", "remoteCh2"))
            .unwrap();
        let state = ctx.call.conference_state().unwrap().unwrap();
        assert_eq!(0, state.content("audio").unwrap().channel_count());

        let sets = ctx.transport.conference_sets();
        assert_eq!(2, sets.len());
        assert_eq!(vec!["remoteCh2", "localCh"], channel_ids(&sets[1], "audio"));
    }

    #[test]
    fn expiry_ignores_other_conferences_and_unknown_channels() {
        let ctx = setup_bridge_call();
        let peer = ctx
            .call
            .initiate_session("bob@example.com", vec![audio_request()])
            .unwrap();

        ctx.transport
            .add_conference_reply(Some(reply("conf1", &[("audio", &["localCh", "remoteCh1"])])));
        ctx.call
            .allocate_conference_channels(&peer, &[audio_request()])
            .unwrap()
            .unwrap();

        // Wrong conference id: nothing happens, nothing is sent.
        ctx.call
            .expire_conference_channels(&peer, &expire_request("stale", "audio", "remoteCh1"))
            .unwrap();
        let state = ctx.call.conference_state().unwrap().unwrap();
        assert_eq!(vec!["localCh", "remoteCh1"], channel_ids(&state, "audio"));
        assert!(ctx.transport.conference_sets().is_empty());

        // Unknown channel: a lookup miss, not an error.
        ctx.call
            .expire_conference_channels(&peer, &expire_request("conf1", "audio", "ghost"))
            .unwrap();
        let state = ctx.call.conference_state().unwrap().unwrap();
        assert_eq!(vec!["localCh", "remoteCh1"], channel_ids(&state, "audio"));
    }

    #[test]
    fn conference_update_strips_uplink_and_reaches_peers() {
        let ctx = setup_bridge_call();
        let peer = ctx
            .call
            .initiate_session("bob@example.com", vec![audio_request()])
            .unwrap();

        ctx.transport
            .add_conference_reply(Some(reply("conf1", &[("audio", &["localCh", "remoteCh1"])])));
        ctx.call
            .allocate_conference_channels(&peer, &[audio_request()])
            .unwrap()
            .unwrap();

        let mut update = ConferenceDescriptor::new();
        update.set_id("conf1");
        {
            let content = update.get_or_create_content("audio");
            content.add_channel(ChannelDescriptor {
                id: Some("localCh".to_string()),
                ..Default::default()
            });
            content.add_channel(ChannelDescriptor::expired("remoteCh1"));
        }
        assert!(ctx.call.process_conference_update(&mut update).unwrap());

        // The uplink entry was stripped before the peers saw it.
        assert_eq!(vec!["remoteCh1"], channel_ids(&update, "audio"));

        // The peer dropped its bridge-expired channel.
        let recorded = peer.conference_channels().unwrap().unwrap();
        assert_eq!(vec!["localCh"], channel_ids(&recorded, "audio"));
    }

    #[test]
    fn conference_update_for_other_conferences_is_not_handled() {
        let ctx = setup_bridge_call();
        let mut update = ConferenceDescriptor::new();
        update.set_id("conf1");

        // No conference state yet.
        assert!(!ctx.call.process_conference_update(&mut update).unwrap());

        let peer = ctx
            .call
            .initiate_session("bob@example.com", vec![audio_request()])
            .unwrap();
        ctx.transport
            .add_conference_reply(Some(reply("conf1", &[("audio", &["localCh"])])));
        ctx.call
            .allocate_conference_channels(&peer, &[audio_request()])
            .unwrap()
            .unwrap();

        let mut other = ConferenceDescriptor::new();
        other.set_id("conf2");
        assert!(!ctx.call.process_conference_update(&mut other).unwrap());
    }

    #[test]
    fn connector_contract_violations_fail_loudly() {
        let ctx = setup_bridge_call();
        let factory = SimConnectorFactory::new();
        let local = ChannelDescriptor {
            id: Some("localCh".to_string()),
            ..Default::default()
        };

        // No conference yet.
        let error = ctx
            .call
            .create_stream_connector(MediaType::Audio, &local, &factory)
            .unwrap_err();
        assert!(matches!(
            error.downcast_ref::<BridgeRtcError>(),
            Some(BridgeRtcError::ConferenceNotEstablished)
        ));

        let peer = ctx
            .call
            .initiate_session("bob@example.com", vec![audio_request()])
            .unwrap();
        ctx.transport
            .add_conference_reply(Some(reply("conf1", &[("audio", &["localCh", "remoteCh1"])])));
        ctx.call
            .allocate_conference_channels(&peer, &[audio_request()])
            .unwrap()
            .unwrap();

        // A channel without an id.
        let error = ctx
            .call
            .create_stream_connector(MediaType::Audio, &ChannelDescriptor::default(), &factory)
            .unwrap_err();
        assert!(matches!(
            error.downcast_ref::<BridgeRtcError>(),
            Some(BridgeRtcError::ChannelIdMissing)
        ));

        // A media type with no content.
        let error = ctx
            .call
            .create_stream_connector(MediaType::Video, &local, &factory)
            .unwrap_err();
        assert!(matches!(
            error.downcast_ref::<BridgeRtcError>(),
            Some(BridgeRtcError::ContentNotFound(_))
        ));

        // A remote channel is never a connector target.
        let remote = ChannelDescriptor {
            id: Some("remoteCh1".to_string()),
            ..Default::default()
        };
        let error = ctx
            .call
            .create_stream_connector(MediaType::Audio, &remote, &factory)
            .unwrap_err();
        assert!(matches!(
            error.downcast_ref::<BridgeRtcError>(),
            Some(BridgeRtcError::ChannelNotUplink(_))
        ));

        assert_eq!(0, factory.created_count());
    }

    #[test]
    fn connector_is_cached_until_closed() {
        let ctx = setup_bridge_call();
        let peer = ctx
            .call
            .initiate_session("bob@example.com", vec![audio_request()])
            .unwrap();
        ctx.transport
            .add_conference_reply(Some(reply("conf1", &[("audio", &["localCh", "remoteCh1"])])));
        ctx.call
            .allocate_conference_channels(&peer, &[audio_request()])
            .unwrap()
            .unwrap();

        let factory = SimConnectorFactory::new();
        let local = ChannelDescriptor {
            id: Some("localCh".to_string()),
            ..Default::default()
        };

        let first = ctx
            .call
            .create_stream_connector(MediaType::Audio, &local, &factory)
            .unwrap()
            .unwrap();
        let second = ctx
            .call
            .create_stream_connector(MediaType::Audio, &local, &factory)
            .unwrap()
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(1, factory.created_count());

        ctx.call.close_stream_connector(MediaType::Audio).unwrap();
        ctx.call
            .create_stream_connector(MediaType::Audio, &local, &factory)
            .unwrap()
            .unwrap();
        assert_eq!(2, factory.created_count());

        // A failing factory leaves the slot empty.
        ctx.call.close_stream_connector(MediaType::Audio).unwrap();
        factory.set_fail(true);
        assert!(ctx
            .call
            .create_stream_connector(MediaType::Audio, &local, &factory)
            .unwrap()
            .is_none());
    }

    #[test]
    fn terminate_expires_remaining_channels() {
        let ctx = setup_bridge_call();
        let peer = ctx
            .call
            .initiate_session("bob@example.com", vec![audio_request()])
            .unwrap();
        ctx.transport
            .add_conference_reply(Some(reply("conf1", &[("audio", &["localCh", "remoteCh1"])])));
        ctx.call
            .allocate_conference_channels(&peer, &[audio_request()])
            .unwrap()
            .unwrap();

        ctx.call.terminate().unwrap();

        assert!(ctx.call.conference_state().unwrap().is_none());
        assert_eq!(0, ctx.call.peer_count().unwrap());
        let sets = ctx.transport.conference_sets();
        assert_eq!(1, sets.len());
        assert_eq!(vec!["localCh", "remoteCh1"], channel_ids(&sets[0], "audio"));
    }
}
