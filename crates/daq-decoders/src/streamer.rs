//! Driving a packet source through decode and flush.
//!
//! A [`PacketSource`] decodes one packet per call into a
//! [`RawBufferLibrary`]. [`ChunkedStream`] repeats that until the configured
//! [`ChunkMode`] says a chunk is complete, then hands buffers to an
//! [`OutputStore`]:
//!
//! | Mode | Chunk ends | Flushed |
//! |------|------------|---------|
//! | `AnyFull` | a buffer is full | every buffer with data |
//! | `OnlyFull` | a buffer is full | only the full buffers |
//! | `SinglePacket` | after every packet | every buffer with data |
//!
//! Whatever is left is flushed when the source is exhausted.

use anyhow::Result;
use daq_core::{ChunkMode, ConfigError};
use daq_storage::output::{flush_library, split_out_stream, write_garbage};
use daq_storage::{GarbageSink, OutputStore, RawBufferLibrary, SchemaSource};
use std::io::{self, Read};
use tracing::{debug, info};

/// Something that decodes packets into a library.
pub trait PacketSource {
    /// Decode the next packet. `Ok(false)` once the source is exhausted.
    fn read_packet(&mut self, library: &mut RawBufferLibrary) -> Result<bool>;

    /// Garbage tables of the source's decoders.
    fn garbage_sinks(&mut self) -> Vec<&mut GarbageSink> {
        Vec::new()
    }
}

/// Counters of a finished [`ChunkedStream::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub packets: u64,
    pub chunks: u64,
    pub buffers_written: usize,
}

pub struct ChunkedStream<S> {
    source: S,
    library: RawBufferLibrary,
    mode: ChunkMode,
    garbage_out: Option<String>,
    stats: StreamStats,
}

impl<S: PacketSource> ChunkedStream<S> {
    pub fn new(source: S, library: RawBufferLibrary, mode: ChunkMode) -> Self {
        Self {
            source,
            library,
            mode,
            garbage_out: None,
            stats: StreamStats::default(),
        }
    }

    /// Write garbage tables to `out_stream` (`destination[:group]`) after each chunk.
    pub fn with_garbage_output(mut self, out_stream: impl Into<String>) -> Self {
        self.garbage_out = Some(out_stream.into());
        self
    }

    pub fn library(&self) -> &RawBufferLibrary {
        &self.library
    }

    pub fn library_mut(&mut self) -> &mut RawBufferLibrary {
        &mut self.library
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    pub fn stats(&self) -> StreamStats {
        self.stats
    }

    /// Read packets until the chunk is complete. Returns `false` once the
    /// source is exhausted.
    pub fn read_chunk(&mut self) -> Result<bool> {
        loop {
            if !self.source.read_packet(&mut self.library)? {
                return Ok(false);
            }
            self.stats.packets += 1;
            let done = match self.mode {
                ChunkMode::SinglePacket => true,
                ChunkMode::AnyFull | ChunkMode::OnlyFull => any_allocated_full(&self.library),
            };
            if done {
                self.stats.chunks += 1;
                return Ok(true);
            }
        }
    }

    /// Flush according to the chunk mode.
    pub fn flush_chunk(&mut self, store: &mut dyn OutputStore) -> Result<usize> {
        let all = self.mode != ChunkMode::OnlyFull;
        let written = flush_library(&mut self.library, store, all)?;
        self.stats.buffers_written += written;
        self.flush_garbage(store)?;
        Ok(written)
    }

    /// Read the whole source, flushing after every chunk and at the end.
    pub fn run(&mut self, store: &mut dyn OutputStore) -> Result<StreamStats> {
        while self.read_chunk()? {
            let written = self.flush_chunk(store)?;
            debug!(chunk = self.stats.chunks, buffers = written, "Flushed chunk");
        }
        self.stats.buffers_written += flush_library(&mut self.library, store, true)?;
        self.flush_garbage(store)?;
        info!(
            packets = self.stats.packets,
            chunks = self.stats.chunks,
            buffers = self.stats.buffers_written,
            "Stream exhausted"
        );
        Ok(self.stats)
    }

    pub fn into_parts(self) -> (S, RawBufferLibrary) {
        (self.source, self.library)
    }

    fn flush_garbage(&mut self, store: &mut dyn OutputStore) -> Result<()> {
        let Some(out_stream) = self.garbage_out.as_deref() else {
            return Ok(());
        };
        let (destination, group) = split_out_stream(out_stream);
        for sink in self.source.garbage_sinks() {
            write_garbage(sink, store, destination, group)?;
        }
        Ok(())
    }
}

/// Unallocated buffers have no capacity and would always read as full.
fn any_allocated_full(library: &RawBufferLibrary) -> bool {
    library
        .iter()
        .flat_map(|list| list.iter())
        .any(|b| b.table.is_some() && b.is_full())
}

/// Bind `decoder`'s wildcard lists and keys, then allocate what it can describe.
pub fn prepare_buffers(library: &mut RawBufferLibrary, decoder: &dyn SchemaSource, size: usize) -> Result<usize, ConfigError> {
    library.resolve_wildcards(decoder)?;
    match library.get_mut(decoder.name()) {
        Some(list) if list.name() == decoder.name() => list.allocate_pending(decoder, size),
        _ => Ok(0),
    }
}

/// Fill `buf`, or return `false` on a clean end of input before its first byte.
pub(crate) fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("stream ended {} bytes into a {} byte read", filled, buf.len()),
                ))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}
