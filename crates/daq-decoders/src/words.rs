//! Little-endian word access over packet bytes.

use bytes::{Buf, BufMut};
use daq_core::PacketError;

/// Bytes per 32-bit word.
pub const WORD_BYTES: usize = 4;

/// A word-aligned, read-only view of a packet.
#[derive(Debug, Clone, Copy)]
pub struct WordView<'a> {
    bytes: &'a [u8],
}

impl<'a> WordView<'a> {
    /// Fails with `Misaligned` when `bytes` is not a whole number of words.
    pub fn new(bytes: &'a [u8]) -> Result<Self, PacketError> {
        if bytes.len() % WORD_BYTES != 0 {
            return Err(PacketError::Misaligned { len: bytes.len() });
        }
        Ok(Self { bytes })
    }

    /// Length in words.
    pub fn len(&self) -> usize {
        self.bytes.len() / WORD_BYTES
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Word `index`, or `Truncated` past the end.
    pub fn word(&self, index: usize) -> Result<u32, PacketError> {
        let start = index * WORD_BYTES;
        let mut word = self.bytes.get(start..start + WORD_BYTES).ok_or(PacketError::Truncated {
            needed: index + 1,
            available: self.len(),
        })?;
        Ok(word.get_u32_le())
    }

    /// Everything from word `index` on.
    pub fn tail(&self, index: usize) -> &'a [u8] {
        self.bytes.get(index * WORD_BYTES..).unwrap_or_default()
    }
}

/// Number of 16-bit values in `bytes`.
pub fn u16_len(bytes: &[u8]) -> usize {
    bytes.len() / 2
}

/// 16-bit little-endian samples of `bytes`.
pub fn u16_samples(bytes: &[u8]) -> impl ExactSizeIterator<Item = u16> + '_ {
    bytes.chunks_exact(2).map(|mut pair| pair.get_u16_le())
}

/// `(word >> shift) & mask`.
#[inline]
pub fn bits(word: u32, shift: u32, mask: u32) -> u32 {
    (word >> shift) & mask
}

/// Serialize words little-endian.
pub fn words_to_bytes(words: &[u32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(words.len() * WORD_BYTES);
    for &word in words {
        out.put_u32_le(word);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_view() {
        let bytes = words_to_bytes(&[0x1234_5678, 0xdead_beef]);
        let view = WordView::new(&bytes).unwrap();
        assert_eq!(view.len(), 2);
        assert_eq!(view.word(1).unwrap(), 0xdead_beef);
        assert_eq!(
            view.word(2),
            Err(PacketError::Truncated {
                needed: 3,
                available: 2
            })
        );
        assert_eq!(view.tail(1), &bytes[4..]);
        assert!(view.tail(3).is_empty());
    }

    #[test]
    fn test_misaligned() {
        assert_eq!(WordView::new(&[0; 6]).unwrap_err(), PacketError::Misaligned { len: 6 });
    }

    #[test]
    fn test_u16_samples_and_bits() {
        let bytes = words_to_bytes(&[0x0002_0001]);
        assert_eq!(u16_samples(&bytes).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(u16_len(&bytes), 2);
        assert_eq!(bits(0xabcd_1234, 4, 0xfff), 0x123);
    }
}
