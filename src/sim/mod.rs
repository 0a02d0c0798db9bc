//
// Copyright 2019-2022 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Simulation implementations of the platform traits.
//!
//! `SimTransport` plays the signaling network and the bridge: replies
//! to conference requests are scripted ahead of time and every sent
//! message is recorded for inspection, in order.

use std::collections::{HashMap, VecDeque};
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::anyhow;

use crate::common::{MediaDirection, MediaType, Result};
use crate::core::call::Call;
use crate::core::conference::{ConferenceDescriptor, RelayAddress};
use crate::core::media::StreamConnector;
use crate::core::platform::{
    AutoAnswerPolicy, ConferenceReply, SignalingTransport, StreamConnectorFactory,
};
use crate::core::signaling::{SessionAccept, SessionInitiate, SessionTerminate};

/// Everything a `SimTransport` ever sent, in send order.
#[derive(Clone, Debug)]
pub enum SimMessage {
    ConferenceRequest(RelayAddress, ConferenceDescriptor),
    ConferenceSet(RelayAddress, ConferenceDescriptor),
    SessionInitiate(String, SessionInitiate),
    SessionAccept(String, SessionAccept),
    SessionTerminate(String, SessionTerminate),
    ConferenceInfo(String, bool),
    VideoContentModify(String, bool),
}

/// Simulation implementation of `SignalingTransport`.
pub struct SimTransport {
    local_address: String,
    relay: Option<RelayAddress>,
    /// Scripted replies to conference requests; an empty queue
    /// simulates a timeout.
    conference_replies: Mutex<VecDeque<Option<ConferenceReply>>>,
    messages: Mutex<Vec<SimMessage>>,
    /// When set, every session-level send fails.
    fail_sends: AtomicBool,
}

impl SimTransport {
    pub fn new(local_address: &str, relay: Option<RelayAddress>) -> Self {
        Self {
            local_address: local_address.to_string(),
            relay,
            conference_replies: Mutex::new(VecDeque::new()),
            messages: Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
        }
    }

    /// Scripts the reply to the next conference request. `None`
    /// simulates a timeout.
    pub fn add_conference_reply(&self, reply: Option<ConferenceReply>) {
        self.conference_replies.lock().unwrap().push_back(reply);
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn messages(&self) -> Vec<SimMessage> {
        self.messages.lock().unwrap().clone()
    }

    fn record(&self, message: SimMessage) {
        self.messages.lock().unwrap().push(message);
    }

    fn check_send(&self, what: &str) -> Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            Err(anyhow!("simulated send failure: {}", what))
        } else {
            Ok(())
        }
    }

    /// The conference requests sent so far (correlated exchanges only).
    pub fn conference_requests(&self) -> Vec<ConferenceDescriptor> {
        self.messages()
            .into_iter()
            .filter_map(|message| match message {
                SimMessage::ConferenceRequest(_, request) => Some(request),
                _ => None,
            })
            .collect()
    }

    /// The fire-and-forget conference messages sent so far.
    pub fn conference_sets(&self) -> Vec<ConferenceDescriptor> {
        self.messages()
            .into_iter()
            .filter_map(|message| match message {
                SimMessage::ConferenceSet(_, request) => Some(request),
                _ => None,
            })
            .collect()
    }

    pub fn session_terminates(&self) -> Vec<(String, SessionTerminate)> {
        self.messages()
            .into_iter()
            .filter_map(|message| match message {
                SimMessage::SessionTerminate(to, terminate) => Some((to, terminate)),
                _ => None,
            })
            .collect()
    }

    pub fn session_accepts(&self) -> Vec<(String, SessionAccept)> {
        self.messages()
            .into_iter()
            .filter_map(|message| match message {
                SimMessage::SessionAccept(to, accept) => Some((to, accept)),
                _ => None,
            })
            .collect()
    }

    pub fn session_initiates(&self) -> Vec<(String, SessionInitiate)> {
        self.messages()
            .into_iter()
            .filter_map(|message| match message {
                SimMessage::SessionInitiate(to, initiate) => Some((to, initiate)),
                _ => None,
            })
            .collect()
    }
}

impl SignalingTransport for SimTransport {
    fn local_address(&self) -> String {
        self.local_address.clone()
    }

    fn configured_relay(&self) -> Option<RelayAddress> {
        self.relay.clone()
    }

    fn reply_timeout(&self) -> Duration {
        Duration::from_millis(50)
    }

    fn request_conference(
        &self,
        to: &RelayAddress,
        request: ConferenceDescriptor,
    ) -> Option<ConferenceReply> {
        self.record(SimMessage::ConferenceRequest(to.clone(), request));
        self.conference_replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(None)
    }

    fn set_conference(&self, to: &RelayAddress, request: ConferenceDescriptor) {
        self.record(SimMessage::ConferenceSet(to.clone(), request));
    }

    fn send_session_initiate(&self, to: &str, initiate: SessionInitiate) -> Result<()> {
        self.check_send("session-initiate")?;
        self.record(SimMessage::SessionInitiate(to.to_string(), initiate));
        Ok(())
    }

    fn send_session_accept(&self, to: &str, accept: SessionAccept) -> Result<()> {
        self.check_send("session-accept")?;
        self.record(SimMessage::SessionAccept(to.to_string(), accept));
        Ok(())
    }

    fn send_session_terminate(&self, to: &str, terminate: SessionTerminate) -> Result<()> {
        self.check_send("session-terminate")?;
        self.record(SimMessage::SessionTerminate(to.to_string(), terminate));
        Ok(())
    }

    fn send_conference_info(&self, to: &str, is_focus: bool) -> Result<()> {
        self.check_send("conference-info")?;
        self.record(SimMessage::ConferenceInfo(to.to_string(), is_focus));
        Ok(())
    }

    fn send_video_content_modify(&self, to: &str, allowed: bool) -> Result<()> {
        self.check_send("video-content-modify")?;
        self.record(SimMessage::VideoContentModify(to.to_string(), allowed));
        Ok(())
    }
}

/// Simulation connector factory binding loopback socket pairs.
pub struct SimConnectorFactory {
    fail: AtomicBool,
    created: AtomicUsize,
}

impl SimConnectorFactory {
    pub fn new() -> Self {
        Self {
            fail: AtomicBool::new(false),
            created: AtomicUsize::new(0),
        }
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Number of connectors handed out so far.
    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl Default for SimConnectorFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamConnectorFactory for SimConnectorFactory {
    fn create_stream_connector(&self) -> Option<StreamConnector> {
        if self.fail.load(Ordering::SeqCst) {
            return None;
        }
        let rtp = UdpSocket::bind("127.0.0.1:0").ok()?;
        let rtcp = UdpSocket::bind("127.0.0.1:0").ok()?;
        self.created.fetch_add(1, Ordering::SeqCst);
        Some(StreamConnector::new(rtp, rtcp))
    }
}

/// Auto-answer policy that only records what it was asked.
pub struct SimAutoAnswer {
    invocations: Mutex<Vec<HashMap<MediaType, MediaDirection>>>,
}

impl SimAutoAnswer {
    pub fn new() -> Self {
        Self {
            invocations: Mutex::new(Vec::new()),
        }
    }

    pub fn invocations(&self) -> Vec<HashMap<MediaType, MediaDirection>> {
        self.invocations.lock().unwrap().clone()
    }
}

impl Default for SimAutoAnswer {
    fn default() -> Self {
        Self::new()
    }
}

impl AutoAnswerPolicy for SimAutoAnswer {
    fn auto_answer(&self, _call: &Call, directions: &HashMap<MediaType, MediaDirection>) {
        self.invocations.lock().unwrap().push(directions.clone());
    }
}
