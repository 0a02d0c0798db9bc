//
// Copyright 2019-2022 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Media-layer state as seen from the signaling core.
//!
//! For a bridge conference to work, every peer of the call must funnel
//! its media through one shared [`MediaHandler`]; a peer starts out
//! with a private handler and is rebound to the call's shared one when
//! its channels are allocated. The rebind is one-way for the lifetime
//! of the peer.

use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::common::{CallMutex, MediaType, Result, MEDIA_TYPE_COUNT};
use crate::core::signaling::EncryptionMethod;

/// Per-media-type stream state shared by all peers of a bridge
/// conference. The signaling core only needs presence; the streams
/// themselves live in the media layer.
pub struct MediaHandler {
    streams: CallMutex<[bool; MEDIA_TYPE_COUNT]>,
}

impl MediaHandler {
    pub fn new() -> Self {
        Self {
            streams: CallMutex::new([false; MEDIA_TYPE_COUNT], "streams"),
        }
    }

    pub fn has_stream(&self, media_type: MediaType) -> Result<bool> {
        Ok(self.streams.lock()?[media_type.ordinal()])
    }

    /// Records that the media layer started or stopped a stream.
    pub fn set_stream(&self, media_type: MediaType, active: bool) -> Result<()> {
        self.streams.lock()?[media_type.ordinal()] = active;
        Ok(())
    }
}

impl Default for MediaHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// The media-facing side of one call peer.
///
/// Holds the handler the peer's streams run through (private until the
/// peer joins a bridge conference), the local media options configured
/// at session setup, and whatever encryption methods the remote party
/// advertised in its offer.
pub struct PeerMediaHandler {
    handler: CallMutex<Arc<MediaHandler>>,
    local_video_enabled: AtomicBool,
    remote_input_aware: AtomicBool,
    advertised_encryption: CallMutex<Vec<EncryptionMethod>>,
}

impl PeerMediaHandler {
    pub fn new() -> Self {
        Self {
            handler: CallMutex::new(Arc::new(MediaHandler::new()), "handler"),
            local_video_enabled: AtomicBool::new(false),
            remote_input_aware: AtomicBool::new(false),
            advertised_encryption: CallMutex::new(Vec::new(), "advertised_encryption"),
        }
    }

    /// The handler the peer's media currently runs through.
    pub fn media_handler(&self) -> Result<Arc<MediaHandler>> {
        Ok(Arc::clone(&*self.handler.lock()?))
    }

    /// Rebinds the peer onto a shared handler.
    pub fn set_media_handler(&self, handler: Arc<MediaHandler>) -> Result<()> {
        *self.handler.lock()? = handler;
        Ok(())
    }

    pub fn has_stream(&self, media_type: MediaType) -> Result<bool> {
        self.media_handler()?.has_stream(media_type)
    }

    pub fn set_local_video_enabled(&self, enabled: bool) {
        self.local_video_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn local_video_enabled(&self) -> bool {
        self.local_video_enabled.load(Ordering::SeqCst)
    }

    pub fn set_remote_input_aware(&self, aware: bool) {
        self.remote_input_aware.store(aware, Ordering::SeqCst);
    }

    pub fn remote_input_aware(&self) -> bool {
        self.remote_input_aware.load(Ordering::SeqCst)
    }

    pub fn advertised_encryption_methods(&self) -> Result<Vec<EncryptionMethod>> {
        Ok(self.advertised_encryption.lock()?.clone())
    }

    pub fn set_advertised_encryption_methods(
        &self,
        methods: Vec<EncryptionMethod>,
    ) -> Result<()> {
        *self.advertised_encryption.lock()? = methods;
        Ok(())
    }
}

impl Default for PeerMediaHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// The socket pair used to exchange RTP and RTCP with the bridge for
/// one media type. Created by the media layer's factory, cached and
/// owned by the `Call`.
#[derive(Debug)]
pub struct StreamConnector {
    rtp: UdpSocket,
    rtcp: UdpSocket,
}

impl StreamConnector {
    pub fn new(rtp: UdpSocket, rtcp: UdpSocket) -> Self {
        Self { rtp, rtcp }
    }

    pub fn rtp_socket(&self) -> &UdpSocket {
        &self.rtp
    }

    pub fn rtcp_socket(&self) -> &UdpSocket {
        &self.rtcp
    }
}
