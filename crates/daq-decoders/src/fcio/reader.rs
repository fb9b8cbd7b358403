//! Sub-record readers.
//!
//! The FCIO record format itself is owned by an external reader. The
//! demultiplexer only needs the [`RecordReader`] surface: open a stream from
//! its configuration payload, point it at a data payload, then step through
//! the records it contains.
//!
//! [`ScriptedReader`] is a reader over JSON payloads. It drives the decoders
//! in tests and lets recorded record sequences be replayed.

use super::records::{FcConfig, FcEvent, FcStatus, FspConfig, FspEvent, FspStatus, RecordTag};
use daq_core::PacketError;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Reader state for one stream.
pub trait RecordReader {
    /// Start the stream from a configuration payload.
    fn open(&mut self, payload: &[u8]) -> Result<(), PacketError>;

    /// Replace the configuration of an open stream.
    fn rearm(&mut self, payload: &[u8]) -> Result<(), PacketError>;

    fn is_open(&self) -> bool;

    /// Position the reader before the first record of a data payload.
    fn load(&mut self, payload: &[u8]) -> Result<(), PacketError>;

    /// Advance to the next record. `None` once the payload is exhausted.
    fn next_record(&mut self) -> Result<Option<RecordTag>, PacketError>;

    fn config(&self) -> Option<&FcConfig>;

    /// Online-filter setup of the stream, if the filter is configured.
    fn fsp_config(&self) -> Option<&FspConfig>;

    /// The current record, when it is a status record.
    fn status(&self) -> Option<&FcStatus>;

    /// The current record, when it is an event header, event or sparse event.
    fn event(&self) -> Option<&FcEvent>;

    fn fsp_event(&self) -> Option<&FspEvent>;

    fn fsp_status(&self) -> Option<&FspStatus>;
}

/// One record of a [`ScriptedReader`] data payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tag", content = "record", rename_all = "snake_case")]
pub enum ScriptedRecord {
    Status {
        status: FcStatus,
        fsp: Option<FspStatus>,
    },
    EventHeader {
        event: FcEvent,
        fsp: Option<FspEvent>,
    },
    Event {
        event: FcEvent,
        fsp: Option<FspEvent>,
    },
    SparseEvent {
        event: FcEvent,
        fsp: Option<FspEvent>,
    },
    Other(u32),
}

impl ScriptedRecord {
    pub fn tag(&self) -> RecordTag {
        match self {
            ScriptedRecord::Status { .. } => RecordTag::Status,
            ScriptedRecord::EventHeader { .. } => RecordTag::EventHeader,
            ScriptedRecord::Event { .. } => RecordTag::Event,
            ScriptedRecord::SparseEvent { .. } => RecordTag::SparseEvent,
            ScriptedRecord::Other(tag) => RecordTag::Other(*tag),
        }
    }
}

/// Reader over JSON payloads.
///
/// A configuration payload is an [`FcConfig`]; a data payload is a list of
/// [`ScriptedRecord`]. Payloads are NUL-padded to whole words.
#[derive(Debug, Default)]
pub struct ScriptedReader {
    config: Option<FcConfig>,
    pending: VecDeque<ScriptedRecord>,
    current: Option<ScriptedRecord>,
}

impl ScriptedReader {
    fn parse_config(payload: &[u8]) -> Result<FcConfig, PacketError> {
        serde_json::from_slice(trim_padding(payload)).map_err(|e| PacketError::Reader(e.to_string()))
    }
}

impl RecordReader for ScriptedReader {
    fn open(&mut self, payload: &[u8]) -> Result<(), PacketError> {
        self.config = Some(Self::parse_config(payload)?);
        self.pending.clear();
        self.current = None;
        Ok(())
    }

    fn rearm(&mut self, payload: &[u8]) -> Result<(), PacketError> {
        self.open(payload)
    }

    fn is_open(&self) -> bool {
        self.config.is_some()
    }

    fn load(&mut self, payload: &[u8]) -> Result<(), PacketError> {
        if self.config.is_none() {
            return Err(PacketError::Reader("data payload before configuration".to_string()));
        }
        let records: Vec<ScriptedRecord> =
            serde_json::from_slice(trim_padding(payload)).map_err(|e| PacketError::Reader(e.to_string()))?;
        self.pending = records.into();
        self.current = None;
        Ok(())
    }

    fn next_record(&mut self) -> Result<Option<RecordTag>, PacketError> {
        self.current = self.pending.pop_front();
        Ok(self.current.as_ref().map(ScriptedRecord::tag))
    }

    fn config(&self) -> Option<&FcConfig> {
        self.config.as_ref()
    }

    fn fsp_config(&self) -> Option<&FspConfig> {
        self.config.as_ref().and_then(|config| config.fsp.as_ref())
    }

    fn status(&self) -> Option<&FcStatus> {
        match &self.current {
            Some(ScriptedRecord::Status { status, .. }) => Some(status),
            _ => None,
        }
    }

    fn event(&self) -> Option<&FcEvent> {
        match &self.current {
            Some(
                ScriptedRecord::EventHeader { event, .. }
                | ScriptedRecord::Event { event, .. }
                | ScriptedRecord::SparseEvent { event, .. },
            ) => Some(event),
            _ => None,
        }
    }

    fn fsp_event(&self) -> Option<&FspEvent> {
        match &self.current {
            Some(
                ScriptedRecord::EventHeader { fsp, .. }
                | ScriptedRecord::Event { fsp, .. }
                | ScriptedRecord::SparseEvent { fsp, .. },
            ) => fsp.as_ref(),
            _ => None,
        }
    }

    fn fsp_status(&self) -> Option<&FspStatus> {
        match &self.current {
            Some(ScriptedRecord::Status { fsp, .. }) => fsp.as_ref(),
            _ => None,
        }
    }
}

fn trim_padding(payload: &[u8]) -> &[u8] {
    let end = payload.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    &payload[..end]
}

fn pad_to_words(mut bytes: Vec<u8>) -> Vec<u8> {
    let padded = bytes.len().div_ceil(4) * 4;
    bytes.resize(padded, 0);
    bytes
}

/// Configuration payload for a [`ScriptedReader`].
pub fn config_payload(config: &FcConfig) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(config).map(pad_to_words)
}

/// Data payload for a [`ScriptedReader`].
pub fn data_payload(records: &[ScriptedRecord]) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(records).map(pad_to_words)
}
