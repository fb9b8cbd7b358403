//! The decoder contract.
//!
//! A decoder has two faces:
//!
//! - [`DataDecoder`]: what it writes. Key groups and per-key schemas, plus the
//!   compilation of a schema into a table. Consulted once, at allocation.
//! - [`PacketDecoder`]: how it writes. One call per packet, one row (or up to
//!   `max_rows_per_packet`) per destination buffer.
//!
//! `decode_packet` never fails. A packet that cannot be stored is handed to the
//! decoder's [`PacketFaults`] and the destination cursor stays where it was.
//!
//! # Example
//!
//! ```rust,ignore
//! list.allocate_from(&decoder, settings.buffer_size)?;
//! let full = decoder.decode_packet(packet, &mut list, packet_id);
//! if full {
//!     write_and_clear(list.iter_mut().filter(|b| b.is_full()), &mut store)?;
//! }
//! ```

use crate::faults::PacketFaults;
use daq_core::{BufferKey, PacketError, SchemaError};
use daq_storage::{RawBuffer, RawBufferList, SchemaSource, Table};

/// Schema side of a decoder.
///
/// Every [`SchemaSource`] is a data decoder; this trait adds the table
/// compilation on top.
pub trait DataDecoder: SchemaSource {
    /// Compile `schema(key)` into a table of `size` rows.
    fn allocate(&self, key: &BufferKey, size: usize) -> Result<Table, SchemaError> {
        self.schema(key)?.allocate(size)
    }
}

impl<T: SchemaSource + ?Sized> DataDecoder for T {}

/// Packet side of a decoder, generic over the input it consumes.
pub trait PacketDecoder<I: ?Sized>: DataDecoder {
    /// Decode `input` into `buffers`. Returns whether a destination buffer is
    /// now full.
    fn decode_packet(&mut self, input: &I, buffers: &mut RawBufferList, packet_id: u32) -> bool;

    fn faults(&self) -> &PacketFaults;

    fn faults_mut(&mut self) -> &mut PacketFaults;
}

/// Outcome of routing a key to its buffer.
pub(crate) enum Route<'a> {
    Buffer(&'a mut RawBuffer),
    Unrouted,
}

/// The allocated buffer for `key`, if any.
pub(crate) fn route<'a>(buffers: &'a mut RawBufferList, key: &BufferKey) -> Route<'a> {
    match buffers.buffer_for_mut(key) {
        Some(buffer) if buffer.table.is_some() => Route::Buffer(buffer),
        _ => Route::Unrouted,
    }
}

/// Write one row at the cursor of `buffer` and advance it.
///
/// The cursor only moves when `write` succeeds. Returns whether the buffer is
/// full afterwards.
pub(crate) fn write_row<F>(buffer: &mut RawBuffer, write: F) -> Result<bool, PacketError>
where
    F: FnOnce(&mut Table, usize) -> Result<(), PacketError>,
{
    let row = buffer.claim_row()?;
    match buffer.table.as_mut() {
        Some(table) => write(table, row)?,
        None => {
            return Err(PacketError::BufferOverflow {
                key: buffer.key_list.first().cloned().unwrap_or(BufferKey::Any),
                capacity: 0,
            })
        }
    }
    buffer.commit_row();
    Ok(buffer.is_full())
}

/// Store `samples` into row `row` of waveform `name`, if the table has it.
pub(crate) fn write_waveform<I>(table: &mut Table, name: &str, row: usize, samples: I) -> Result<(), PacketError>
where
    I: ExactSizeIterator<Item = u16>,
{
    if !table.contains(name) {
        return Ok(());
    }
    let waveform = table.waveform_mut(name)?;
    let capacity = waveform.wf_len();
    if samples.len() > capacity {
        return Err(PacketError::WaveformOverflow {
            samples: samples.len(),
            capacity,
        });
    }
    waveform.values.set_row(row, samples)?;
    Ok(())
}
