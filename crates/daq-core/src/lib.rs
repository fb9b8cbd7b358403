//! `daq-core`
//!
//! Core types shared by the raw-data decoding crates.
//!
//! This crate provides the vocabulary every other crate in the workspace speaks:
//! column element types, the keys that address logical readout channels, the
//! error taxonomy, runtime settings and the tracing setup.
//!
//! ## Key Types
//!
//! - [`DType`]: element type of a decoded column (`uint16`, `float64`, ...)
//! - [`Scalar`]: a single decoded value, cast into the column type on write
//! - [`BufferKey`]: tagged key routing decoded rows to a buffer
//! - [`ChannelKey`]: reversible packing of (stream id, card address, input)
//! - [`error`]: configuration, schema, packet and storage errors
//!
//! ## Example
//!
//! ```rust
//! use daq_core::{BufferKey, ChannelKey};
//!
//! let key = ChannelKey::new(3, 0x0010, 5);
//! let routed: BufferKey = key.into();
//! assert_eq!(routed, BufferKey::Id(key.pack()));
//! assert_eq!(ChannelKey::unpack(key.pack()), key);
//! ```

pub mod dtype;
pub mod error;
pub mod key;
pub mod limits;
pub mod settings;
pub mod telemetry;

pub use dtype::{DType, Scalar};
pub use error::{ConfigError, PacketError, SchemaError, StorageError};
pub use key::{BufferKey, ChannelKey};
pub use settings::{ChunkMode, CorruptionPolicy, DecodeSettings};
