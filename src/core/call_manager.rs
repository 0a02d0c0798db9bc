//
// Copyright 2019-2022 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! The context object that owns the active calls.
//!
//! The manager carries everything the calls need from the host —
//! configuration, transport, policies, the event channel — and the
//! registry of live calls, constructed once at bootstrap and handed
//! down explicitly.

use std::collections::HashMap;
use std::sync::Arc;

use crate::common::{CallDirection, CallId, CallMutex, Result};
use crate::core::call::Call;
use crate::core::call_peer::CallPeer;
use crate::core::events::{event_channel, EventSender, EventStream};
use crate::core::platform::{AutoAnswerPolicy, CallConfig, SignalingTransport};
use crate::core::signaling::SessionInitiate;
use crate::error::BridgeRtcError;

/// Owns the active calls and the collaborators they share.
///
/// Cheaply cloneable; each `Call` keeps a clone as its way back to the
/// transport, configuration, and sibling calls.
#[derive(Clone)]
pub struct CallManager {
    config: CallConfig,
    transport: Arc<dyn SignalingTransport>,
    auto_answer_policy: Arc<dyn AutoAnswerPolicy>,
    events: EventSender,
    call_map: Arc<CallMutex<HashMap<CallId, Call>>>,
}

impl CallManager {
    /// Creates a manager and the event stream the application should
    /// consume.
    pub fn new(
        config: CallConfig,
        transport: Arc<dyn SignalingTransport>,
        auto_answer_policy: Arc<dyn AutoAnswerPolicy>,
    ) -> (Self, EventStream) {
        let (events, event_stream) = event_channel();
        let manager = Self {
            config,
            transport,
            auto_answer_policy,
            events,
            call_map: Arc::new(CallMutex::new(HashMap::new(), "call_map")),
        };
        (manager, event_stream)
    }

    pub fn config(&self) -> &CallConfig {
        &self.config
    }

    pub fn transport(&self) -> Arc<dyn SignalingTransport> {
        Arc::clone(&self.transport)
    }

    pub fn auto_answer_policy(&self) -> Arc<dyn AutoAnswerPolicy> {
        Arc::clone(&self.auto_answer_policy)
    }

    pub fn events(&self) -> &EventSender {
        &self.events
    }

    /// Creates and registers an outgoing call. `relay_mediated` says
    /// whether its media runs through the conference bridge.
    pub fn create_outgoing_call(&self, relay_mediated: bool) -> Result<Call> {
        let call_id = CallId::random();
        let call = Call::new(
            call_id,
            CallDirection::OutGoing,
            relay_mediated,
            self.clone(),
        );
        self.call_map.lock()?.insert(call_id, call.clone());
        Ok(call)
    }

    /// Handles an incoming session-initiate by creating a call for it
    /// and processing the offer. Incoming calls start with direct
    /// media; they join a bridge only when the local party organizes
    /// one.
    pub fn received_session_initiate(&self, initiate: SessionInitiate) -> Result<Option<CallPeer>> {
        let call_id = CallId::random();
        let call = Call::new(call_id, CallDirection::InComing, false, self.clone());
        self.call_map.lock()?.insert(call_id, call.clone());
        call.process_session_initiate(initiate)
    }

    pub fn call(&self, call_id: CallId) -> Result<Call> {
        match self.call_map.lock()?.get(&call_id) {
            Some(call) => Ok(call.clone()),
            None => Err(BridgeRtcError::CallIdNotFound(call_id).into()),
        }
    }

    /// Finds the live call/peer pair owning the given signaling
    /// session, e.g. the attendant session referenced by a transfer.
    pub fn find_call_by_session(&self, sid: &str) -> Result<Option<(Call, CallPeer)>> {
        for call in self.call_map.lock()?.values() {
            if let Some(peer) = call.find_peer_by_session(sid)? {
                return Ok(Some((call.clone(), peer)));
            }
        }
        Ok(None)
    }

    /// Ends a call and drops it from the registry.
    pub fn terminate_call(&self, call_id: CallId) -> Result<()> {
        let call = match self.call_map.lock()?.remove(&call_id) {
            Some(call) => call,
            None => return Err(BridgeRtcError::CallIdNotFound(call_id).into()),
        };
        call.terminate()
    }

    pub fn call_count(&self) -> Result<usize> {
        Ok(self.call_map.lock()?.len())
    }
}
