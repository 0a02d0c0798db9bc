//
// Copyright 2019-2022 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Descriptor model for a bridge-side conference.
//!
//! A conference is subdivided into contents, one per media type, and
//! each content holds an ordered list of channels. By convention the
//! channel at index 0 of a content is the local (uplink) channel; the
//! rest belong to remote peers. The same types describe requests sent
//! to the bridge, its replies, and the authoritative state a `Call`
//! keeps between exchanges.

use std::fmt;

/// Address of the conference bridge on the signaling network.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RelayAddress(String);

impl RelayAddress {
    pub fn new(address: &str) -> Self {
        Self(address.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RelayAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One RTP payload format offered for, or accepted on, a channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PayloadType {
    pub id: u8,
    pub name: String,
    pub clock_rate: u32,
}

impl PayloadType {
    pub fn new(id: u8, name: &str, clock_rate: u32) -> Self {
        Self {
            id,
            name: name.to_string(),
            clock_rate,
        }
    }
}

/// The transport triple the bridge announces for a channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelTransport {
    pub host: String,
    pub rtp_port: u16,
    pub rtcp_port: u16,
}

/// One bridge-side media endpoint within a content.
///
/// The id is assigned by the bridge and stays `None` on request
/// entries that ask for a new channel. `expire` of 0 releases the
/// channel.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct ChannelDescriptor {
    pub id: Option<String>,
    pub expire: Option<u32>,
    pub transport: Option<ChannelTransport>,
    pub payload_types: Vec<PayloadType>,
}

impl ChannelDescriptor {
    /// A request entry asking the bridge for a new channel supporting
    /// the given payload types.
    pub fn offering(payload_types: Vec<PayloadType>) -> Self {
        Self {
            payload_types,
            ..Default::default()
        }
    }

    /// A request entry releasing the channel with the given id.
    pub fn expired(id: &str) -> Self {
        Self {
            id: Some(id.to_string()),
            expire: Some(0),
            ..Default::default()
        }
    }

    pub fn id_matches(&self, id: &str) -> bool {
        self.id.as_deref() == Some(id)
    }
}

/// A conference subdivision for one media type.
///
/// Invariant: the channel at index 0, when present, is the local
/// (uplink) channel. A content with zero channels is logically absent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContentDescriptor {
    name: String,
    channels: Vec<ChannelDescriptor>,
}

impl ContentDescriptor {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            channels: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn channels(&self) -> &[ChannelDescriptor] {
        &self.channels
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn channel(&self, index: usize) -> Option<&ChannelDescriptor> {
        self.channels.get(index)
    }

    pub fn channel_by_id(&self, id: &str) -> Option<&ChannelDescriptor> {
        self.channels.iter().find(|channel| channel.id_matches(id))
    }

    pub fn channel_by_id_mut(&mut self, id: &str) -> Option<&mut ChannelDescriptor> {
        self.channels
            .iter_mut()
            .find(|channel| channel.id_matches(id))
    }

    /// Appends a channel; channels only accumulate here, removal is
    /// always by id.
    pub fn add_channel(&mut self, channel: ChannelDescriptor) {
        self.channels.push(channel);
    }

    pub fn remove_channel_by_id(&mut self, id: &str) -> Option<ChannelDescriptor> {
        let index = self
            .channels
            .iter()
            .position(|channel| channel.id_matches(id))?;
        Some(self.channels.remove(index))
    }

    /// The id of the local (uplink) channel, if one is present and the
    /// bridge has assigned it an id.
    pub fn local_channel_id(&self) -> Option<&str> {
        self.channel(0).and_then(|channel| channel.id.as_deref())
    }
}

/// A bridge conference: an id, the relay that hosts it, and one
/// content per active media type.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct ConferenceDescriptor {
    id: Option<String>,
    relay_address: Option<RelayAddress>,
    contents: Vec<ContentDescriptor>,
}

impl ConferenceDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn set_id(&mut self, id: &str) {
        self.id = Some(id.to_string());
    }

    pub fn relay_address(&self) -> Option<&RelayAddress> {
        self.relay_address.as_ref()
    }

    pub fn set_relay_address(&mut self, relay_address: RelayAddress) {
        self.relay_address = Some(relay_address);
    }

    pub fn contents(&self) -> &[ContentDescriptor] {
        &self.contents
    }

    pub fn content(&self, name: &str) -> Option<&ContentDescriptor> {
        self.contents.iter().find(|content| content.name() == name)
    }

    pub fn content_mut(&mut self, name: &str) -> Option<&mut ContentDescriptor> {
        self.contents
            .iter_mut()
            .find(|content| content.name() == name)
    }

    pub fn add_content(&mut self, content: ContentDescriptor) {
        self.contents.push(content);
    }

    pub fn get_or_create_content(&mut self, name: &str) -> &mut ContentDescriptor {
        let index = match self.contents.iter().position(|c| c.name() == name) {
            Some(index) => index,
            None => {
                self.contents.push(ContentDescriptor::new(name));
                self.contents.len() - 1
            }
        };
        &mut self.contents[index]
    }

    /// Total number of channels across all contents.
    pub fn channel_count(&self) -> usize {
        self.contents
            .iter()
            .map(ContentDescriptor::channel_count)
            .sum()
    }
}

impl fmt::Display for ConferenceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "conference: {}, contents: {}",
            self.id.as_deref().unwrap_or("<unallocated>"),
            self.contents.len()
        )
    }
}
