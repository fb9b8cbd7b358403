//! Envelope demultiplexing.
//!
//! [`FcDemux::decode_packet`] takes one envelope. A configuration envelope
//! opens (or re-arms) its stream, teaches every sub-decoder the stream's
//! layout and allocates whatever buffers the layout makes describable. A data
//! envelope is loaded into its stream's reader and every record in it is
//! dispatched to the sub-decoder of its kind.

use super::config::{FcConfigDecoder, CONFIG_DECODER_NAME};
use super::envelope::Envelope;
use super::event::{FcEventDecoder, EVENT_DECODER_NAME};
use super::eventheader::{FcEventHeaderDecoder, EVENT_HEADER_DECODER_NAME};
use super::fspconfig::{FspConfigDecoder, FSP_CONFIG_DECODER_NAME};
use super::reader::RecordReader;
use super::records::RecordTag;
use super::registry::{RegistryError, StreamLayout, StreamRegistry};
use super::status::{FcStatusDecoder, STATUS_DECODER_NAME};
use super::FcRecord;
use crate::decoder::PacketDecoder;
use crate::faults::PacketFaults;
use crate::streamer::prepare_buffers;
use daq_core::{BufferKey, ConfigError, DecodeSettings, SchemaError};
use daq_storage::{GarbageSink, RawBufferLibrary, RawBufferList};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Fault bookkeeping name for envelope level rejections.
pub const DEMUX_NAME: &str = "fcio";

/// Envelope data ids of the four FCIO packet kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FcDataIds {
    pub config: u32,
    pub status: u32,
    pub event_header: u32,
    pub event: u32,
}

impl Default for FcDataIds {
    fn default() -> Self {
        Self {
            config: 1,
            status: 2,
            event_header: 3,
            event: 4,
        }
    }
}

/// The decoding side of one FCIO session: stream registry plus sub-decoders.
#[derive(Debug)]
pub struct FcDemux<R> {
    ids: FcDataIds,
    registry: StreamRegistry<R>,
    config_decoder: FcConfigDecoder,
    status_decoder: FcStatusDecoder,
    header_decoder: FcEventHeaderDecoder,
    event_decoder: FcEventDecoder,
    fsp_config_decoder: FspConfigDecoder,
    faults: PacketFaults,
    buffer_size: usize,
}

impl<R: RecordReader + Default> FcDemux<R> {
    pub fn new(settings: &DecodeSettings) -> Result<Self, SchemaError> {
        Ok(Self {
            ids: FcDataIds::default(),
            registry: StreamRegistry::new(),
            config_decoder: FcConfigDecoder::new(PacketFaults::from_settings(CONFIG_DECODER_NAME, settings)?),
            status_decoder: FcStatusDecoder::new(PacketFaults::from_settings(STATUS_DECODER_NAME, settings)?),
            header_decoder: FcEventHeaderDecoder::new(PacketFaults::from_settings(
                EVENT_HEADER_DECODER_NAME,
                settings,
            )?),
            event_decoder: FcEventDecoder::new(PacketFaults::from_settings(EVENT_DECODER_NAME, settings)?),
            fsp_config_decoder: FspConfigDecoder::new(PacketFaults::from_settings(FSP_CONFIG_DECODER_NAME, settings)?),
            faults: PacketFaults::from_settings(DEMUX_NAME, settings)?,
            buffer_size: settings.buffer_size,
        })
    }

    pub fn with_data_ids(mut self, ids: FcDataIds) -> Self {
        self.ids = ids;
        self
    }

    pub fn data_ids(&self) -> FcDataIds {
        self.ids
    }

    pub fn registry(&self) -> &StreamRegistry<R> {
        &self.registry
    }

    pub fn config_decoder(&self) -> &FcConfigDecoder {
        &self.config_decoder
    }

    pub fn status_decoder(&self) -> &FcStatusDecoder {
        &self.status_decoder
    }

    pub fn event_header_decoder(&self) -> &FcEventHeaderDecoder {
        &self.header_decoder
    }

    pub fn event_decoder(&self) -> &FcEventDecoder {
        &self.event_decoder
    }

    pub fn fsp_config_decoder(&self) -> &FspConfigDecoder {
        &self.fsp_config_decoder
    }

    /// Envelope level rejections.
    pub fn faults(&self) -> &PacketFaults {
        &self.faults
    }

    /// Packets rejected by the demultiplexer and all sub-decoders.
    pub fn total_rejected(&self) -> u64 {
        self.faults.total_rejected()
            + self.config_decoder.faults().total_rejected()
            + self.status_decoder.faults().total_rejected()
            + self.header_decoder.faults().total_rejected()
            + self.event_decoder.faults().total_rejected()
            + self.fsp_config_decoder.faults().total_rejected()
    }

    pub fn garbage_sinks(&mut self) -> Vec<&mut GarbageSink> {
        [
            self.faults.garbage_mut(),
            self.config_decoder.faults_mut().garbage_mut(),
            self.status_decoder.faults_mut().garbage_mut(),
            self.header_decoder.faults_mut().garbage_mut(),
            self.event_decoder.faults_mut().garbage_mut(),
            self.fsp_config_decoder.faults_mut().garbage_mut(),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    /// Decode one envelope into `library`. Returns whether a buffer is now full.
    ///
    /// Malformed envelopes and records are rejected through the fault policy.
    /// Only a configuration that cannot be turned into buffers is an error.
    pub fn decode_packet(
        &mut self,
        packet: &[u8],
        library: &mut RawBufferLibrary,
        packet_id: u32,
    ) -> Result<bool, ConfigError> {
        let envelope = match Envelope::parse(packet) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.faults.reject(&BufferKey::Any, packet_id, packet, &e);
                return Ok(false);
            }
        };

        if envelope.data_id == self.ids.config {
            return self.open_stream(&envelope, packet, library, packet_id);
        }
        if ![self.ids.status, self.ids.event_header, self.ids.event].contains(&envelope.data_id) {
            debug!(data_id = envelope.data_id, packet_id, "Skipping envelope with unhandled data id");
            return Ok(false);
        }

        let open = match self.registry.get_mut(envelope.stream_id) {
            Ok(open) => open,
            Err(e) => {
                self.faults.reject(&BufferKey::Any, packet_id, packet, &e);
                return Ok(false);
            }
        };
        if let Err(e) = open.reader.load(envelope.payload) {
            self.faults.reject(&open.layout.header_key(), packet_id, packet, &e);
            return Ok(false);
        }

        let stream_id = open.layout.stream_id;
        let header_key = open.layout.header_key();
        let mut full = false;
        loop {
            let tag = match open.reader.next_record() {
                Ok(Some(tag)) => tag,
                Ok(None) => break,
                Err(e) => {
                    self.faults.reject(&open.layout.header_key(), packet_id, packet, &e);
                    break;
                }
            };
            let reader = &open.reader;
            match tag {
                RecordTag::Status => {
                    let Some(status) = reader.status() else {
                        continue;
                    };
                    let Some(list) = decoder_list(library, STATUS_DECODER_NAME) else {
                        self.status_decoder.faults_mut().unrouted(&header_key);
                        continue;
                    };
                    let record = FcRecord {
                        stream_id,
                        data: status,
                        summary: reader.fsp_status(),
                        raw: packet,
                    };
                    full |= self.status_decoder.decode_packet(&record, list, packet_id);
                }
                RecordTag::EventHeader => {
                    let Some(event) = reader.event() else {
                        continue;
                    };
                    let Some(list) = decoder_list(library, EVENT_HEADER_DECODER_NAME) else {
                        self.header_decoder.faults_mut().unrouted(&header_key);
                        continue;
                    };
                    let record = FcRecord {
                        stream_id,
                        data: event,
                        summary: reader.fsp_event(),
                        raw: packet,
                    };
                    full |= self.header_decoder.decode_packet(&record, list, packet_id);
                }
                RecordTag::Event | RecordTag::SparseEvent => {
                    let Some(event) = reader.event() else {
                        continue;
                    };
                    let Some(list) = decoder_list(library, EVENT_DECODER_NAME) else {
                        self.event_decoder.faults_mut().unrouted(&header_key);
                        continue;
                    };
                    let record = FcRecord {
                        stream_id,
                        data: event,
                        summary: reader.fsp_event(),
                        raw: packet,
                    };
                    full |= self.event_decoder.decode_packet(&record, list, packet_id);
                }
                RecordTag::Config | RecordTag::Other(_) => {
                    debug!(stream_id, ?tag, packet_id, "Ignoring record");
                }
            }
        }
        Ok(full)
    }

    fn open_stream(
        &mut self,
        envelope: &Envelope<'_>,
        packet: &[u8],
        library: &mut RawBufferLibrary,
        packet_id: u32,
    ) -> Result<bool, ConfigError> {
        let layout: StreamLayout = match self.registry.open(envelope.stream_id, envelope.payload) {
            Ok(layout) => layout.clone(),
            Err(RegistryError::Reader(e)) => {
                self.faults.reject(&BufferKey::Any, packet_id, packet, &e);
                return Ok(false);
            }
            Err(RegistryError::Config(e)) => return Err(e),
        };

        self.config_decoder.insert_layout(&layout);
        self.status_decoder.insert_layout(layout.clone());
        self.header_decoder.insert_layout(layout.clone());
        self.event_decoder.insert_layout(layout.clone());
        self.fsp_config_decoder.insert_layout(layout.clone());

        let size = self.buffer_size;
        let allocated = prepare_buffers(library, &self.config_decoder, size)?
            + prepare_buffers(library, &self.status_decoder, size)?
            + prepare_buffers(library, &self.header_decoder, size)?
            + prepare_buffers(library, &self.event_decoder, size)?
            + prepare_buffers(library, &self.fsp_config_decoder, size)?;
        info!(stream_id = layout.stream_id, buffers = allocated, "Allocated stream buffers");

        let Ok(open) = self.registry.get_mut(envelope.stream_id) else {
            return Ok(false);
        };
        let mut full = false;
        if let Some(config) = open.reader.config() {
            match decoder_list(library, CONFIG_DECODER_NAME) {
                Some(list) => {
                    let record = FcRecord {
                        stream_id: layout.stream_id,
                        data: config,
                        summary: None,
                        raw: packet,
                    };
                    full |= self.config_decoder.decode_packet(&record, list, packet_id);
                }
                None => self.config_decoder.faults_mut().unrouted(&BufferKey::Any),
            }
        }

        let fsp_config = open.reader.fsp_config().filter(|_| layout.fsp_enabled);
        if let Some(fsp_config) = fsp_config {
            match decoder_list(library, FSP_CONFIG_DECODER_NAME) {
                Some(list) => {
                    let record = FcRecord {
                        stream_id: layout.stream_id,
                        data: fsp_config,
                        summary: None,
                        raw: packet,
                    };
                    full |= self.fsp_config_decoder.decode_packet(&record, list, packet_id);
                }
                None => self.fsp_config_decoder.faults_mut().unrouted(&layout.summary_key()),
            }
        }
        Ok(full)
    }
}

/// The list bound to `name`. An unbound wildcard list is not written to.
fn decoder_list<'a>(library: &'a mut RawBufferLibrary, name: &str) -> Option<&'a mut RawBufferList> {
    library.get_mut(name).filter(|list| list.name() == name)
}
