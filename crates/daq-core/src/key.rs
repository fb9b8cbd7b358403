//! Buffer routing keys.
//!
//! Decoders address their output through a [`BufferKey`]. Hardware channels
//! behind a stream demultiplexer are identified by a [`ChannelKey`], which
//! packs reversibly into the `Id` variant.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Key routing decoded rows to a buffer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BufferKey {
    /// Sentinel for decoders without per-channel variation.
    Any,
    /// Hardware channel key.
    Id(u64),
    /// Online-filter summary key for one stream.
    Summary(u32),
    Name(String),
}

impl BufferKey {
    pub fn is_any(&self) -> bool {
        matches!(self, BufferKey::Any)
    }
}

impl fmt::Display for BufferKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferKey::Any => f.write_str("*"),
            BufferKey::Id(id) => write!(f, "{}", id),
            BufferKey::Summary(stream) => write!(f, "summary_{}", stream),
            BufferKey::Name(name) => f.write_str(name),
        }
    }
}

impl From<u64> for BufferKey {
    fn from(id: u64) -> Self {
        BufferKey::Id(id)
    }
}

impl From<&str> for BufferKey {
    fn from(name: &str) -> Self {
        if name == "*" {
            BufferKey::Any
        } else {
            BufferKey::Name(name.to_string())
        }
    }
}

/// A hardware channel behind a stream demultiplexer.
///
/// Packs as `stream_id << 32 | card_address << 16 | input`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelKey {
    pub stream_id: u16,
    pub card_address: u16,
    pub input: u16,
}

impl ChannelKey {
    pub fn new(stream_id: u16, card_address: u16, input: u16) -> Self {
        Self {
            stream_id,
            card_address,
            input,
        }
    }

    pub fn pack(self) -> u64 {
        (u64::from(self.stream_id) << 32)
            | (u64::from(self.card_address) << 16)
            | u64::from(self.input)
    }

    pub fn unpack(packed: u64) -> Self {
        Self {
            stream_id: ((packed >> 32) & 0xffff) as u16,
            card_address: ((packed >> 16) & 0xffff) as u16,
            input: (packed & 0xffff) as u16,
        }
    }
}

impl From<ChannelKey> for BufferKey {
    fn from(key: ChannelKey) -> Self {
        BufferKey::Id(key.pack())
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:0x{:04x}:{}",
            self.stream_id, self.card_address, self.input
        )
    }
}
