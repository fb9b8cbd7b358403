//! Error types for the decoding pipeline.
//!
//! Errors are split by the stage that raises them, because the stages have
//! different failure semantics:
//!
//! - **[`SchemaError`]**: a field description cannot be compiled into a table,
//!   or a decoder was asked for a schema it cannot produce. Fatal at setup.
//! - **[`ConfigError`]**: the buffer library configuration is inconsistent
//!   (duplicate keys, malformed ranges, missing template keywords, capacity
//!   below the fill-safety margin). Fatal at setup.
//! - **[`PacketError`]**: one packet is corrupt or cannot be stored. Never
//!   fatal; the packet is rejected and handled by the corruption policy. Every
//!   variant carries a stable numeric [`PacketError::code`] that is stored
//!   alongside garbage records.
//! - **[`StorageError`]**: a column access does not match the table layout.
//!
//! Application edges (file loading, output stores, streamers) wrap these in
//! `anyhow::Error` with context.

use crate::key::BufferKey;
use thiserror::Error;

// =============================================================================
// Schema Errors
// =============================================================================

/// Failures compiling a schema into a table, or looking one up.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchemaError {
    /// Every field must name its element type.
    #[error("field '{field}' has no dtype")]
    MissingDType { field: String },

    /// A structural kind requires an attribute that is absent.
    #[error("field '{field}' of kind '{datatype}' requires attribute '{attribute}'")]
    MissingAttribute {
        field: String,
        datatype: String,
        attribute: String,
    },

    /// An attribute is present but has the wrong type or an invalid value.
    #[error("field '{field}' attribute '{attribute}' is invalid: {reason}")]
    InvalidAttribute {
        field: String,
        attribute: String,
        reason: String,
    },

    /// The structural kind is not one the table compiler knows.
    #[error("field '{field}' has unsupported datatype '{datatype}'")]
    UnsupportedSchema { field: String, datatype: String },

    /// The hardware configuration needed to build the schema was not seen yet.
    #[error("decoder '{decoder}' has not seen the configuration its schema depends on")]
    SchemaNotBuilt { decoder: String },

    /// The configuration is known but does not contain the key.
    #[error("decoder '{decoder}' has no schema for key {key}")]
    UnknownKey { decoder: String, key: BufferKey },
}

// =============================================================================
// Configuration Errors
// =============================================================================

/// Setup-time inconsistencies in the buffer library configuration.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("list '{list}' contains a buffer with an empty name")]
    EmptyBufferName { list: String },

    #[error("buffer '{buffer}' in list '{list}' has no key_list")]
    MissingKeyList { list: String, buffer: String },

    /// A `[a, b]` key range with `a > b`.
    #[error("buffer '{buffer}' in list '{list}' has malformed key range [{start}, {end}]")]
    MalformedRange {
        list: String,
        buffer: String,
        start: i64,
        end: i64,
    },

    /// A key entry that cannot name a buffer key.
    #[error("buffer '{buffer}' in list '{list}' has invalid key '{key}'")]
    InvalidKey {
        list: String,
        buffer: String,
        key: String,
    },

    /// Two buffers of one list claim the same key.
    #[error("key {key} is routed to more than one buffer in list '{list}'")]
    DuplicateKey { list: String, key: BufferKey },

    /// A `{keyword}` in a template has no value.
    #[error("template '{template}' references unknown keyword '{keyword}'")]
    MissingKeyword { template: String, keyword: String },

    /// The template itself could not be parsed.
    #[error("template '{template}' is malformed: {reason}")]
    Template { template: String, reason: String },

    /// A buffer's keys belong to more than one key group of its decoder.
    #[error("buffer '{buffer}' mixes keys from different schema groups of decoder '{decoder}'")]
    KeysSpanGroups { decoder: String, buffer: String },

    #[error("buffer '{buffer}' capacity {capacity} is below its fill-safety margin {fill_safety}")]
    CapacityBelowSafety {
        buffer: String,
        capacity: usize,
        fill_safety: usize,
    },

    /// A stream configuration that cannot be registered.
    #[error("stream {stream_id} cannot be opened: {reason}")]
    InvalidStream { stream_id: u32, reason: String },

    #[error(transparent)]
    Schema(#[from] SchemaError),
}

// =============================================================================
// Packet Errors
// =============================================================================

/// Reasons a single packet is rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// The event trailer tag nibble is neither "no average" nor "average follows".
    #[error("bad trailer tag 0x{tag:x}")]
    BadTrailerTag { tag: u32 },

    /// The averaged-data header word has the wrong tag nibble.
    #[error("bad averaged-data tag 0x{tag:x}")]
    BadAverageTag { tag: u32 },

    #[error("sample count mismatch: header announces {expected} 16-bit words, packet holds {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("packet truncated: needed {needed} words, got {available}")]
    Truncated { needed: usize, available: usize },

    /// MAW test data is not supported.
    #[error("packet carries MAW test data")]
    MawTestData,

    #[error("{samples} samples exceed waveform length {capacity}")]
    WaveformOverflow { samples: usize, capacity: usize },

    /// The destination buffer has no free row.
    #[error("buffer for key {key} is at capacity {capacity}")]
    BufferOverflow { key: BufferKey, capacity: usize },

    /// The byte payload is not a whole number of 32-bit words.
    #[error("payload of {len} bytes is not word aligned")]
    Misaligned { len: usize },

    #[error("envelope of {words} words is shorter than its {header} word header")]
    EnvelopeTooShort { words: usize, header: usize },

    #[error("envelope declares {declared} words but holds {actual}")]
    EnvelopeLength { declared: usize, actual: usize },

    /// Record for a stream that was never opened by a configuration packet.
    #[error("stream {stream_id} is not open")]
    UnknownStream { stream_id: u32 },

    /// The sub-record reader failed.
    #[error("record reader failed: {0}")]
    Reader(String),

    #[error("row write failed: {0}")]
    Storage(#[from] StorageError),

    #[error("trace index {index} is not in the stream's trace map")]
    UnknownTrace { index: u16 },
}

impl PacketError {
    /// Stable numeric code stored with garbage records.
    pub fn code(&self) -> u32 {
        match self {
            PacketError::BadTrailerTag { .. } => 1,
            PacketError::BadAverageTag { .. } => 2,
            PacketError::LengthMismatch { .. } => 3,
            PacketError::Truncated { .. } => 4,
            PacketError::MawTestData => 5,
            PacketError::WaveformOverflow { .. } => 6,
            PacketError::BufferOverflow { .. } => 7,
            PacketError::Misaligned { .. } => 8,
            PacketError::EnvelopeTooShort { .. } => 9,
            PacketError::EnvelopeLength { .. } => 10,
            PacketError::UnknownStream { .. } => 11,
            PacketError::Reader(_) => 12,
            PacketError::Storage(_) => 13,
            PacketError::UnknownTrace { .. } => 14,
        }
    }
}

// =============================================================================
// Storage Errors
// =============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("row {row} is out of range for capacity {capacity}")]
    RowOutOfRange { row: usize, capacity: usize },

    #[error("table has no field '{field}'")]
    FieldNotFound { field: String },

    #[error("field '{field}' is not a {expected} column")]
    WrongKind { field: String, expected: &'static str },

    /// More elements than a fixed-width row holds.
    #[error("{len} elements do not fit a row of width {width}")]
    RowTooLong { len: usize, width: usize },
}
