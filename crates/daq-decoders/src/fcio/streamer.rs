//! Reading envelope packets back to back from a byte stream.

use super::demux::FcDemux;
use super::envelope::{declared_words, HEADER_WORDS};
use super::reader::RecordReader;
use crate::streamer::{read_exact_or_eof, PacketSource};
use crate::words::WORD_BYTES;
use anyhow::{bail, Context, Result};
use daq_core::limits::MAX_PACKET_WORDS;
use daq_core::DecodeSettings;
use daq_storage::{GarbageSink, RawBufferLibrary};
use std::io::Read;
use tracing::debug;

/// Feeds envelopes from `reader` through an [`FcDemux`].
pub struct FcStreamer<R, Rd> {
    reader: R,
    demux: FcDemux<Rd>,
    packet_id: u32,
    bytes_read: u64,
    packet: Vec<u8>,
}

impl<R: Read, Rd: RecordReader + Default> FcStreamer<R, Rd> {
    pub fn new(reader: R, settings: &DecodeSettings) -> Result<Self> {
        let demux = FcDemux::new(settings).context("Failed to set up FCIO decoders")?;
        Ok(Self::with_demux(reader, demux))
    }

    pub fn with_demux(reader: R, demux: FcDemux<Rd>) -> Self {
        Self {
            reader,
            demux,
            packet_id: 0,
            bytes_read: 0,
            packet: Vec::new(),
        }
    }

    pub fn demux(&self) -> &FcDemux<Rd> {
        &self.demux
    }

    pub fn packets_read(&self) -> u32 {
        self.packet_id
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn close(self) -> R {
        debug!(packets = self.packet_id, bytes = self.bytes_read, "Closed FCIO stream");
        self.reader
    }
}

impl<R: Read, Rd: RecordReader + Default> PacketSource for FcStreamer<R, Rd> {
    fn read_packet(&mut self, library: &mut RawBufferLibrary) -> Result<bool> {
        let mut head = [0u8; WORD_BYTES];
        let more = read_exact_or_eof(&mut self.reader, &mut head)
            .with_context(|| format!("Failed to read envelope at byte {}", self.bytes_read))?;
        if !more {
            return Ok(false);
        }
        let words = declared_words(u32::from_le_bytes(head));
        if !(HEADER_WORDS..=MAX_PACKET_WORDS).contains(&words) {
            bail!(
                "Envelope at byte {} declares {} words, cannot resynchronize",
                self.bytes_read,
                words
            );
        }

        self.packet.clear();
        self.packet.extend_from_slice(&head);
        self.packet.resize(words * WORD_BYTES, 0);
        self.reader
            .read_exact(&mut self.packet[WORD_BYTES..])
            .with_context(|| format!("Truncated envelope at byte {}", self.bytes_read))?;
        self.bytes_read += self.packet.len() as u64;

        self.demux
            .decode_packet(&self.packet, library, self.packet_id)
            .with_context(|| format!("Failed to open stream from packet {}", self.packet_id))?;
        self.packet_id += 1;
        Ok(true)
    }

    fn garbage_sinks(&mut self) -> Vec<&mut GarbageSink> {
        self.demux.garbage_sinks()
    }
}
