//! Storage for packets that could not be decoded.
//!
//! Each garbage row holds the packet's raw bytes, its packet id and the
//! numeric code of the error that rejected it.

use crate::schema::{FieldSpec, Schema};
use crate::table::Table;
use daq_core::{DType, SchemaError};
use tracing::warn;

/// Object name used when the garbage table is written out.
pub const GARBAGE_NAME: &str = "garbage";

/// Fixed-capacity garbage table with its own cursor.
#[derive(Debug, Clone)]
pub struct GarbageSink {
    table: Table,
    loc: usize,
    dropped: u64,
}

impl GarbageSink {
    pub fn new(capacity: usize, packet_size_guess: usize) -> Result<Self, SchemaError> {
        let table = Self::schema(packet_size_guess).allocate(capacity)?;
        Ok(Self {
            table,
            loc: 0,
            dropped: 0,
        })
    }

    /// Layout of the garbage table.
    pub fn schema(packet_size_guess: usize) -> Schema {
        Schema::new()
            .with_field("packets", FieldSpec::ragged(DType::U8, Some(packet_size_guess)))
            .with_field("packet_id", FieldSpec::scalar(DType::U32))
            .with_field("garbage_code", FieldSpec::scalar(DType::U32))
    }

    /// Store one rejected packet. Returns `false` when the table is full and
    /// the packet was dropped.
    pub fn put(&mut self, packet: &[u8], packet_id: u32, code: u32) -> bool {
        if self.is_full() {
            self.dropped += 1;
            if self.dropped == 1 {
                warn!(packet_id, code, "Garbage table full, dropping rejected packets");
            }
            return false;
        }
        let row = self.loc;
        let stored = self
            .table
            .ragged_mut("packets")
            .and_then(|packets| packets.set_row(row, packet.iter().copied()))
            .and_then(|_| self.table.set("packet_id", row, packet_id))
            .and_then(|_| self.table.set("garbage_code", row, code));
        match stored {
            Ok(()) => {
                self.loc += 1;
                true
            }
            Err(e) => {
                warn!(packet_id, error = %e, "Failed to store garbage packet");
                self.dropped += 1;
                false
            }
        }
    }

    pub fn is_full(&self) -> bool {
        self.loc >= self.table.size()
    }

    /// Rows currently stored.
    pub fn len(&self) -> usize {
        self.loc
    }

    pub fn is_empty(&self) -> bool {
        self.loc == 0
    }

    /// Packets that did not fit since the sink was created.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    pub fn clear(&mut self) {
        self.loc = 0;
    }
}
