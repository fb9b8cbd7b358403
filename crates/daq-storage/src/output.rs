//! Handing filled buffers to an output store.
//!
//! The on-disk encoding lives behind [`OutputStore`]. This module only knows
//! how `out_stream` splits into destination and group, and when a buffer's
//! cursor is reset.

use crate::buffer::{RawBuffer, RawBufferLibrary};
use crate::garbage::{GarbageSink, GARBAGE_NAME};
use crate::table::Table;
use anyhow::{Context, Result};
use tracing::{debug, trace};

/// Group used when `out_stream` has no `:group` part.
pub const DEFAULT_GROUP: &str = "/";

/// Sink for filled tables.
pub trait OutputStore {
    /// Write the first `n_rows` rows of `table` as object `name` under
    /// `group` of `destination`.
    fn write(
        &mut self,
        table: &Table,
        name: &str,
        destination: &str,
        group: &str,
        n_rows: usize,
        append: bool,
    ) -> Result<()>;
}

/// Split `destination[:group]` at the first `:`.
pub fn split_out_stream(out_stream: &str) -> (&str, &str) {
    match out_stream.split_once(':') {
        Some((destination, group)) if !group.is_empty() => (destination, group),
        Some((destination, _)) => (destination, DEFAULT_GROUP),
        None => (out_stream, DEFAULT_GROUP),
    }
}

/// Write every non-empty buffer and reset its cursor.
///
/// Buffers with an empty destination are not written, but their cursor is
/// still reset. Returns the number of buffers written.
pub fn write_and_clear<'a, I>(buffers: I, store: &mut dyn OutputStore) -> Result<usize>
where
    I: IntoIterator<Item = &'a mut RawBuffer>,
{
    let mut written = 0;
    for buffer in buffers {
        if buffer.loc == 0 {
            continue;
        }
        let (destination, group) = split_out_stream(&buffer.out_stream);
        if destination.is_empty() {
            trace!(buffer = %buffer.out_name, rows = buffer.loc, "No destination, discarding rows");
        } else if let Some(table) = buffer.table.as_ref() {
            store
                .write(table, &buffer.out_name, destination, group, buffer.loc, true)
                .with_context(|| {
                    format!("Failed to write '{}' to {}:{}", buffer.out_name, destination, group)
                })?;
            debug!(buffer = %buffer.out_name, destination, group, rows = buffer.loc, "Wrote buffer");
            written += 1;
        }
        buffer.clear();
    }
    Ok(written)
}

/// Write and reset the buffers of `library`; only the full ones unless `all`.
pub fn flush_library(library: &mut RawBufferLibrary, store: &mut dyn OutputStore, all: bool) -> Result<usize> {
    let buffers = library
        .iter_mut()
        .flat_map(|list| list.iter_mut())
        .filter(|b| all || b.is_full());
    write_and_clear(buffers, store)
}

/// Write the garbage table, if it holds anything, and reset it.
pub fn write_garbage(
    sink: &mut GarbageSink,
    store: &mut dyn OutputStore,
    destination: &str,
    group: &str,
) -> Result<()> {
    if sink.is_empty() {
        return Ok(());
    }
    store
        .write(sink.table(), GARBAGE_NAME, destination, group, sink.len(), true)
        .with_context(|| format!("Failed to write garbage to {}", destination))?;
    sink.clear();
    Ok(())
}

/// One call recorded by [`MemoryStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRecord {
    pub name: String,
    pub destination: String,
    pub group: String,
    pub n_rows: usize,
    pub append: bool,
    pub table: Table,
}

/// In-memory store that keeps a copy of every write.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    pub writes: Vec<WriteRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total rows written for `name` at `destination`.
    pub fn rows_written(&self, destination: &str, name: &str) -> usize {
        self.writes
            .iter()
            .filter(|w| w.destination == destination && w.name == name)
            .map(|w| w.n_rows)
            .sum()
    }
}

impl OutputStore for MemoryStore {
    fn write(
        &mut self,
        table: &Table,
        name: &str,
        destination: &str,
        group: &str,
        n_rows: usize,
        append: bool,
    ) -> Result<()> {
        self.writes.push(WriteRecord {
            name: name.to_string(),
            destination: destination.to_string(),
            group: group.to_string(),
            n_rows,
            append,
            table: table.clone(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::RawBufferList;
    use crate::schema::{FieldSpec, Schema};
    use daq_core::{BufferKey, DType};

    fn buffer(out_stream: &str, name: &str, loc: usize) -> RawBuffer {
        let table = Schema::new()
            .with_field("x", FieldSpec::scalar(DType::U16))
            .allocate(4)
            .unwrap();
        let mut b = RawBuffer::new(vec![BufferKey::Name(name.into())], out_stream, name).with_table(table);
        b.loc = loc;
        b
    }

    #[test]
    fn test_split_out_stream() {
        assert_eq!(split_out_stream("run.lh5:/raw/geds"), ("run.lh5", "/raw/geds"));
        assert_eq!(split_out_stream("run.lh5"), ("run.lh5", "/"));
        assert_eq!(split_out_stream("run.lh5:"), ("run.lh5", "/"));
        assert_eq!(split_out_stream(""), ("", "/"));
    }

    #[test]
    fn test_write_and_clear() {
        let mut buffers = vec![
            buffer("a.lh5:/raw", "a", 3),
            buffer("b.lh5", "b", 0),
            buffer("", "c", 2),
        ];
        let mut store = MemoryStore::new();
        let written = write_and_clear(buffers.iter_mut(), &mut store).unwrap();
        assert_eq!(written, 1);
        assert_eq!(store.writes.len(), 1);
        let w = &store.writes[0];
        assert_eq!((w.destination.as_str(), w.group.as_str(), w.n_rows), ("a.lh5", "/raw", 3));
        assert!(w.append);
        assert!(buffers.iter().all(|b| b.loc == 0));
    }

    #[test]
    fn test_flush_library_only_full() {
        let mut library = RawBufferLibrary::new();
        library.insert(
            RawBufferList::new("dec", vec![buffer("f.lh5", "full", 4), buffer("f.lh5", "partial", 1)])
                .unwrap(),
        );
        let mut store = MemoryStore::new();
        assert_eq!(flush_library(&mut library, &mut store, false).unwrap(), 1);
        assert_eq!(store.rows_written("f.lh5", "full"), 4);
        assert_eq!(store.rows_written("f.lh5", "partial"), 0);
        assert_eq!(flush_library(&mut library, &mut store, true).unwrap(), 1);
        assert_eq!(store.rows_written("f.lh5", "partial"), 1);
    }

    #[test]
    fn test_write_garbage() {
        let mut sink = GarbageSink::new(4, 8).unwrap();
        let mut store = MemoryStore::new();
        write_garbage(&mut sink, &mut store, "g.lh5", "/").unwrap();
        assert!(store.writes.is_empty());
        sink.put(&[1, 2], 5, 1);
        write_garbage(&mut sink, &mut store, "g.lh5", "/").unwrap();
        assert_eq!(store.rows_written("g.lh5", GARBAGE_NAME), 1);
        assert!(sink.is_empty());
    }
}
