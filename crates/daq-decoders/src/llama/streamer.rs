//! Reading a llamaDAQ file event by event.

use super::event::{fch_id_of, LlamaEventDecoder, EVENT_DECODER_NAME};
use super::header::{LlamaHeader, LlamaHeaderDecoder, HEADER_DECODER_NAME};
use crate::decoder::PacketDecoder;
use crate::faults::PacketFaults;
use crate::streamer::{prepare_buffers, read_exact_or_eof, PacketSource};
use crate::words::WORD_BYTES;
use anyhow::{bail, Context, Result};
use daq_core::limits::MAX_PACKET_WORDS;
use daq_core::{BufferKey, DecodeSettings};
use daq_storage::{GarbageSink, RawBufferLibrary};
use std::io::Read;
use tracing::{debug, info, warn};

/// Streams SIS3316 events from a llamaDAQ file into a buffer library.
///
/// The header is read at [`LlamaStreamer::open`]. Each event's length comes
/// from the configuration of the channel named in its first word.
pub struct LlamaStreamer<R> {
    reader: R,
    header_decoder: LlamaHeaderDecoder,
    event_decoder: LlamaEventDecoder,
    packet_id: u32,
    bytes_read: u64,
    packet: Vec<u8>,
}

impl<R: Read> LlamaStreamer<R> {
    /// Read the file header, allocate the buffers of both decoders and store
    /// the channel configuration rows.
    pub fn open(mut reader: R, library: &mut RawBufferLibrary, settings: &DecodeSettings) -> Result<Self> {
        let mut header_decoder =
            LlamaHeaderDecoder::new(PacketFaults::from_settings(HEADER_DECODER_NAME, settings)?);
        let header = header_decoder
            .decode_header(&mut reader)
            .context("Failed to read llamaDAQ file header")?
            .clone();
        let event_decoder = LlamaEventDecoder::new(
            &header.channels,
            PacketFaults::from_settings(EVENT_DECODER_NAME, settings)?,
        );

        prepare_buffers(library, &header_decoder, settings.buffer_size)
            .context("Failed to allocate header buffers")?;
        prepare_buffers(library, &event_decoder, settings.buffer_size)
            .context("Failed to allocate event buffers")?;
        if let Some(list) = library.get(EVENT_DECODER_NAME).filter(|l| l.name() == EVENT_DECODER_NAME) {
            for buffer in list.iter().filter(|b| b.table.is_none()) {
                warn!(buffer = %buffer.out_name, "No channel in the file matches the buffer's keys");
            }
        }

        let mut streamer = Self {
            reader,
            header_decoder,
            event_decoder,
            packet_id: 0,
            bytes_read: header.encoded_len() as u64,
            packet: Vec::new(),
        };
        match library.get_mut(HEADER_DECODER_NAME).filter(|l| l.name() == HEADER_DECODER_NAME) {
            Some(list) => {
                streamer.header_decoder.decode_packet(&header, list, 0);
            }
            None => streamer.header_decoder.faults_mut().unrouted(&BufferKey::Any),
        }
        info!(channels = header.channels.len(), "Opened llamaDAQ stream");
        Ok(streamer)
    }

    pub fn header(&self) -> Option<&LlamaHeader> {
        self.header_decoder.header()
    }

    pub fn event_decoder(&self) -> &LlamaEventDecoder {
        &self.event_decoder
    }

    pub fn packets_read(&self) -> u32 {
        self.packet_id
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Give back the reader.
    pub fn close(self) -> R {
        debug!(packets = self.packet_id, bytes = self.bytes_read, "Closed llamaDAQ stream");
        self.reader
    }

    /// Event length in words for the channel named by `word0`.
    fn event_words(&self, word0: u32) -> Result<usize> {
        let fch_id = fch_id_of(word0);
        let Some(config) = self.header().and_then(|h| h.channel(fch_id)) else {
            bail!(
                "Event at byte {} names fch id 0x{:03x}, which is not in the file header",
                self.bytes_read,
                fch_id
            );
        };
        let words = config.event_length as usize;
        if !(2..=MAX_PACKET_WORDS).contains(&words) {
            bail!("Channel 0x{:03x} has an unusable event length of {} words", fch_id, words);
        }
        Ok(words)
    }
}

impl<R: Read> PacketSource for LlamaStreamer<R> {
    fn read_packet(&mut self, library: &mut RawBufferLibrary) -> Result<bool> {
        let mut head = [0u8; WORD_BYTES];
        let more = read_exact_or_eof(&mut self.reader, &mut head)
            .with_context(|| format!("Failed to read event at byte {}", self.bytes_read))?;
        if !more {
            return Ok(false);
        }
        let words = self.event_words(u32::from_le_bytes(head))?;

        self.packet.clear();
        self.packet.extend_from_slice(&head);
        self.packet.resize(words * WORD_BYTES, 0);
        self.reader
            .read_exact(&mut self.packet[WORD_BYTES..])
            .with_context(|| format!("Truncated event at byte {}", self.bytes_read))?;
        self.bytes_read += self.packet.len() as u64;

        match library.get_mut(EVENT_DECODER_NAME).filter(|l| l.name() == EVENT_DECODER_NAME) {
            Some(list) => {
                self.event_decoder.decode_packet(&self.packet[..], list, self.packet_id);
            }
            None => {
                let key = BufferKey::Id(u64::from(fch_id_of(u32::from_le_bytes(head))));
                self.event_decoder.faults_mut().unrouted(&key);
            }
        }
        self.packet_id += 1;
        Ok(true)
    }

    fn garbage_sinks(&mut self) -> Vec<&mut GarbageSink> {
        [
            self.header_decoder.faults_mut().garbage_mut(),
            self.event_decoder.faults_mut().garbage_mut(),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}
