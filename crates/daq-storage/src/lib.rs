//! `daq-storage`
//!
//! Columnar buffers for decoded digitizer data.
//!
//! Decoders describe their output with a [`Schema`]; the schema compiles into
//! a pre-sized [`Table`] held by a [`RawBuffer`]. Buffers are grouped into a
//! [`RawBufferList`] per decoder, keyed by [`daq_core::BufferKey`], and lists
//! into a [`RawBufferLibrary`] built from configuration by the key-list
//! compiler in [`config`].

pub mod buffer;
pub mod config;
pub mod garbage;
pub mod output;
pub mod schema;
pub mod table;

pub use buffer::{RawBuffer, RawBufferLibrary, RawBufferList, SchemaSource};
pub use config::{build_library, expand_list_config, load_library_config, Keywords, LibraryConfig};
pub use garbage::GarbageSink;
pub use output::{write_and_clear, MemoryStore, OutputStore};
pub use schema::{FieldSpec, Schema};
pub use table::{Array, Column, ColumnData, FixedArray, RaggedArray, Table, WaveformTable};
