//! Envelope packets carrying FCIO payloads.
//!
//! ```text
//! word 0   [31:18] data id   [17:0] packet length in words, header included
//! word 1   reserved
//! word 2   stream id
//! word 3.. payload
//! ```

use crate::words::{WordView, WORD_BYTES};
use bytes::BufMut;
use daq_core::PacketError;

pub const HEADER_WORDS: usize = 3;
pub const LENGTH_MASK: u32 = 0x3_ffff;
pub const DATA_ID_SHIFT: u32 = 18;

/// A parsed envelope borrowing its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope<'a> {
    pub data_id: u32,
    pub stream_id: u32,
    pub payload: &'a [u8],
}

impl<'a> Envelope<'a> {
    pub fn parse(packet: &'a [u8]) -> Result<Self, PacketError> {
        let words = WordView::new(packet)?;
        if words.len() < HEADER_WORDS {
            return Err(PacketError::EnvelopeTooShort {
                words: words.len(),
                header: HEADER_WORDS,
            });
        }
        let word0 = words.word(0)?;
        let declared = declared_words(word0);
        if declared != words.len() {
            return Err(PacketError::EnvelopeLength {
                declared,
                actual: words.len(),
            });
        }
        Ok(Self {
            data_id: word0 >> DATA_ID_SHIFT,
            stream_id: words.word(2)?,
            payload: words.tail(HEADER_WORDS),
        })
    }

    /// Build an envelope around `payload`, NUL-padding it to whole words.
    pub fn encode(data_id: u32, stream_id: u32, payload: &[u8]) -> Vec<u8> {
        let payload_words = payload.len().div_ceil(WORD_BYTES);
        let total = HEADER_WORDS + payload_words;
        let mut out = Vec::with_capacity(total * WORD_BYTES);
        out.put_u32_le((data_id << DATA_ID_SHIFT) | (total as u32 & LENGTH_MASK));
        out.put_u32_le(0);
        out.put_u32_le(stream_id);
        out.put_slice(payload);
        out.put_bytes(0, payload_words * WORD_BYTES - payload.len());
        out
    }
}

/// Packet length in words announced by `word0`.
pub fn declared_words(word0: u32) -> usize {
    (word0 & LENGTH_MASK) as usize
}
