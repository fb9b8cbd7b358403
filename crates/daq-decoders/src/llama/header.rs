//! llamaDAQ file header.
//!
//! A file starts with a 16-byte header followed by one 88-byte configuration
//! record per open SIS3316 channel:
//!
//! ```text
//! u32[0]  magic 0x4972414c
//! u16[2]  version patch     u16[3] version minor     u16[4] version major
//! u16[5]  channel config length (88)
//! u32[3]  number of open channels
//! ```
//!
//! The channel configurations decide the event layout of every channel, so
//! they are parsed before any event and handed to the event decoder.

use crate::decoder::{route, write_row, PacketDecoder, Route};
use crate::faults::PacketFaults;
use bytes::{Buf, BufMut};
use daq_core::{BufferKey, DType, PacketError, SchemaError};
use daq_storage::{FieldSpec, RawBufferList, Schema, SchemaSource, Table};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;
use thiserror::Error;
use tracing::{info, warn};

pub const MAGIC: u32 = 0x4972_414c;
pub const FILE_HEADER_BYTES: usize = 16;
pub const CHANNEL_CONFIG_BYTES: usize = 88;

/// Buffer list name of the header decoder.
pub const HEADER_DECODER_NAME: &str = "llama_header";

const FLAG_14_BIT: u32 = 0x1;
const FLAG_OPEN: u32 = 0x2;

#[derive(Error, Debug)]
pub enum HeaderError {
    #[error("failed to read header: {0}")]
    Io(#[from] std::io::Error),

    #[error("not a llamaDAQ file, magic word is 0x{found:08x}")]
    BadMagic { found: u32 },

    #[error("unsupported channel configuration length {length}, expected 88")]
    ConfigLength { length: u16 },

    #[error("duplicate channel configuration for FADC {fadc} channel {channel}")]
    DuplicateChannel { fadc: u32, channel: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Configuration of one open channel.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub fadc: u32,
    pub channel: u32,
    pub adc_14bit: bool,
    pub open: bool,
    pub adc_offset: u32,
    /// MHz.
    pub sample_freq: f64,
    pub gain: f64,
    pub format_bits: u32,
    pub sample_start_index: u32,
    pub sample_pretrigger: u32,
    pub avg_sample_pretrigger: u32,
    pub avg_mode: u32,
    pub sample_length: u32,
    pub avg_sample_length: u32,
    pub maw_buffer_length: u32,
    /// Event length in 32-bit words.
    pub event_length: u32,
    pub event_header_length: u32,
    pub accum6_offset: u32,
    pub accum2_offset: u32,
    pub maw3_offset: u32,
    pub energy_offset: u32,
}

impl ChannelConfig {
    /// Combined FADC and channel index, as found in event word 0.
    pub fn fch_id(&self) -> u32 {
        (self.fadc << 4) | self.channel
    }

    /// Parse one 88-byte record.
    pub fn parse(mut record: &[u8]) -> Self {
        let fadc = record.get_u32_le();
        let channel = record.get_u32_le();
        let flags = record.get_u32_le();
        let adc_offset = record.get_u32_le();
        let sample_freq = record.get_f64_le();
        let gain = record.get_f64_le();
        Self {
            fadc,
            channel,
            adc_14bit: flags & FLAG_14_BIT != 0,
            open: flags & FLAG_OPEN != 0,
            adc_offset,
            sample_freq,
            gain,
            format_bits: record.get_u32_le(),
            sample_start_index: record.get_u32_le(),
            sample_pretrigger: record.get_u32_le(),
            avg_sample_pretrigger: record.get_u32_le(),
            avg_mode: record.get_u32_le(),
            sample_length: record.get_u32_le(),
            avg_sample_length: record.get_u32_le(),
            maw_buffer_length: record.get_u32_le(),
            event_length: record.get_u32_le(),
            event_header_length: record.get_u32_le(),
            accum6_offset: record.get_u32_le(),
            accum2_offset: record.get_u32_le(),
            maw3_offset: record.get_u32_le(),
            energy_offset: record.get_u32_le(),
        }
    }

    /// The 88-byte record for this configuration.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(CHANNEL_CONFIG_BYTES);
        let flags = u32::from(self.adc_14bit) * FLAG_14_BIT + u32::from(self.open) * FLAG_OPEN;
        out.put_u32_le(self.fadc);
        out.put_u32_le(self.channel);
        out.put_u32_le(flags);
        out.put_u32_le(self.adc_offset);
        out.put_f64_le(self.sample_freq);
        out.put_f64_le(self.gain);
        for word in [
            self.format_bits,
            self.sample_start_index,
            self.sample_pretrigger,
            self.avg_sample_pretrigger,
            self.avg_mode,
            self.sample_length,
            self.avg_sample_length,
            self.maw_buffer_length,
            self.event_length,
            self.event_header_length,
            self.accum6_offset,
            self.accum2_offset,
            self.maw3_offset,
            self.energy_offset,
        ] {
            out.put_u32_le(word);
        }
        out
    }

    /// Raw sample spacing in ns, rounded to the nearest integer.
    pub fn dt_raw_ns(&self) -> f64 {
        if self.sample_freq > 0.0 {
            (1000.0 / self.sample_freq + 0.5).floor()
        } else {
            0.0
        }
    }

    /// Averaged sample spacing in ns.
    pub fn dt_aux_ns(&self) -> f64 {
        self.dt_raw_ns() * 2f64.powi(self.avg_mode as i32 + 1)
    }
}

/// Parsed file header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlamaHeader {
    pub version: Version,
    pub config_length: u16,
    pub n_channels_open: u32,
    /// Channel configurations by fch id.
    pub channels: BTreeMap<u32, ChannelConfig>,
}

impl LlamaHeader {
    pub fn new(version: Version, channels: impl IntoIterator<Item = ChannelConfig>) -> Self {
        let channels: BTreeMap<u32, ChannelConfig> = channels.into_iter().map(|c| (c.fch_id(), c)).collect();
        Self {
            version,
            config_length: CHANNEL_CONFIG_BYTES as u16,
            n_channels_open: channels.len() as u32,
            channels,
        }
    }

    /// Read the file header and all channel configurations.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, HeaderError> {
        let mut head = [0u8; FILE_HEADER_BYTES];
        reader.read_exact(&mut head)?;
        let mut buf = &head[..];
        let magic = buf.get_u32_le();
        if magic != MAGIC {
            return Err(HeaderError::BadMagic { found: magic });
        }
        let patch = buf.get_u16_le();
        let minor = buf.get_u16_le();
        let major = buf.get_u16_le();
        let config_length = buf.get_u16_le();
        let n_channels_open = buf.get_u32_le();
        if usize::from(config_length) != CHANNEL_CONFIG_BYTES {
            return Err(HeaderError::ConfigLength { length: config_length });
        }

        let mut channels = BTreeMap::new();
        let mut record = [0u8; CHANNEL_CONFIG_BYTES];
        for _ in 0..n_channels_open {
            reader.read_exact(&mut record)?;
            let config = ChannelConfig::parse(&record);
            if !config.open {
                warn!(fadc = config.fadc, channel = config.channel, "Channel in configuration is marked as not open");
            }
            if channels.contains_key(&config.fch_id()) {
                return Err(HeaderError::DuplicateChannel {
                    fadc: config.fadc,
                    channel: config.channel,
                });
            }
            channels.insert(config.fch_id(), config);
        }

        Ok(Self {
            version: Version { major, minor, patch },
            config_length,
            n_channels_open,
            channels,
        })
    }

    /// Bytes taken by the header in the file.
    pub fn encoded_len(&self) -> usize {
        FILE_HEADER_BYTES + CHANNEL_CONFIG_BYTES * self.channels.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.put_u32_le(MAGIC);
        out.put_u16_le(self.version.patch);
        out.put_u16_le(self.version.minor);
        out.put_u16_le(self.version.major);
        out.put_u16_le(self.config_length);
        out.put_u32_le(self.channels.len() as u32);
        for config in self.channels.values() {
            out.extend_from_slice(&config.encode());
        }
        out
    }

    pub fn channel(&self, fch_id: u32) -> Option<&ChannelConfig> {
        self.channels.get(&fch_id)
    }
}

// =============================================================================
// Header decoder
// =============================================================================

/// Stores the channel configurations as a table, one row per channel.
#[derive(Debug)]
pub struct LlamaHeaderDecoder {
    header: Option<LlamaHeader>,
    faults: PacketFaults,
}

impl LlamaHeaderDecoder {
    pub fn new(faults: PacketFaults) -> Self {
        Self { header: None, faults }
    }

    /// Read the header from `reader` and keep it.
    pub fn decode_header<R: Read>(&mut self, reader: &mut R) -> Result<&LlamaHeader, HeaderError> {
        let header = LlamaHeader::read_from(reader)?;
        info!(
            version = %header.version,
            channels = header.n_channels_open,
            "Read llamaDAQ header"
        );
        Ok(self.header.insert(header))
    }

    pub fn header(&self) -> Option<&LlamaHeader> {
        self.header.as_ref()
    }
}

impl SchemaSource for LlamaHeaderDecoder {
    fn name(&self) -> &str {
        HEADER_DECODER_NAME
    }

    fn schema(&self, _key: &BufferKey) -> Result<Schema, SchemaError> {
        if self.header.is_none() {
            return Err(SchemaError::SchemaNotBuilt {
                decoder: HEADER_DECODER_NAME.to_string(),
            });
        }
        let mut schema = Schema::new()
            .with_field("fch_id", FieldSpec::scalar(DType::U32))
            .with_field("fadc", FieldSpec::scalar(DType::U32))
            .with_field("channel", FieldSpec::scalar(DType::U32))
            .with_field("adc_14bit", FieldSpec::scalar(DType::Bool))
            .with_field("open", FieldSpec::scalar(DType::Bool))
            .with_field("adc_offset", FieldSpec::scalar(DType::U32).with_attr("units", "adc"))
            .with_field("sample_freq", FieldSpec::scalar(DType::F64).with_attr("units", "MHz"))
            .with_field("gain", FieldSpec::scalar(DType::F64));
        for name in U32_CONFIG_FIELDS {
            schema.insert(name, FieldSpec::scalar(DType::U32));
        }
        Ok(schema)
    }

    fn max_rows_per_packet(&self) -> usize {
        self.header.as_ref().map_or(1, |h| h.channels.len().max(1))
    }
}

const U32_CONFIG_FIELDS: [&str; 14] = [
    "format_bits",
    "sample_start_index",
    "sample_pretrigger",
    "avg_sample_pretrigger",
    "avg_mode",
    "sample_length",
    "avg_sample_length",
    "MAW_buffer_length",
    "event_length",
    "event_header_length",
    "accum6_offset",
    "accum2_offset",
    "MAW3_offset",
    "energy_offset",
];

fn store_channel(table: &mut Table, row: usize, config: &ChannelConfig) -> Result<(), PacketError> {
    table.set_if_present("fch_id", row, config.fch_id())?;
    table.set_if_present("fadc", row, config.fadc)?;
    table.set_if_present("channel", row, config.channel)?;
    table.set_if_present("adc_14bit", row, config.adc_14bit)?;
    table.set_if_present("open", row, config.open)?;
    table.set_if_present("adc_offset", row, config.adc_offset)?;
    table.set_if_present("sample_freq", row, config.sample_freq)?;
    table.set_if_present("gain", row, config.gain)?;
    let words = [
        config.format_bits,
        config.sample_start_index,
        config.sample_pretrigger,
        config.avg_sample_pretrigger,
        config.avg_mode,
        config.sample_length,
        config.avg_sample_length,
        config.maw_buffer_length,
        config.event_length,
        config.event_header_length,
        config.accum6_offset,
        config.accum2_offset,
        config.maw3_offset,
        config.energy_offset,
    ];
    for (name, value) in U32_CONFIG_FIELDS.iter().zip(words) {
        table.set_if_present(name, row, value)?;
    }
    Ok(())
}

impl PacketDecoder<LlamaHeader> for LlamaHeaderDecoder {
    fn decode_packet(&mut self, header: &LlamaHeader, buffers: &mut RawBufferList, packet_id: u32) -> bool {
        let key = BufferKey::Any;
        let Route::Buffer(buffer) = route(buffers, &key) else {
            self.faults.unrouted(&key);
            return false;
        };
        let mut full = false;
        for config in header.channels.values() {
            match write_row(buffer, |table, row| store_channel(table, row, config)) {
                Ok(is_full) => full |= is_full,
                Err(e) => self.faults.reject(&key, packet_id, &config.encode(), &e),
            }
        }
        full
    }

    fn faults(&self) -> &PacketFaults {
        &self.faults
    }

    fn faults_mut(&mut self) -> &mut PacketFaults {
        &mut self.faults
    }
}
