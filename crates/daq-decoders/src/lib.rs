//! `daq-decoders`
//!
//! Packet parsers that fill [`daq_storage`] buffers.
//!
//! Every decoder implements the same contract ([`decoder::PacketDecoder`]):
//! it describes its output per key and writes one row per packet into the
//! buffer its key routes to. Malformed packets never abort decoding; they are
//! handed to the decoder's [`faults::PacketFaults`].
//!
//! ## Hardware families
//!
//! - [`llama`]: SIS3316 digitizers read out by llamaDAQ. A file header of
//!   channel configurations followed by fixed-length channel events.
//! - [`fcio`]: FlashCam FCIO streams carried in envelope packets. One
//!   stateful reader per stream, several record kinds per envelope.
//!
//! ## Streaming
//!
//! [`streamer::ChunkedStream`] drives any [`streamer::PacketSource`] through
//! decode and flush:
//!
//! ```rust,ignore
//! let source = LlamaStreamer::open(file, &mut library, &settings)?;
//! let mut stream = ChunkedStream::new(source, library, settings.chunk_mode);
//! stream.run(&mut store)?;
//! ```

pub mod decoder;
pub mod faults;
pub mod fcio;
pub mod llama;
pub mod streamer;
pub mod words;

pub use decoder::{DataDecoder, PacketDecoder};
pub use faults::PacketFaults;
pub use fcio::{FcDemux, FcStreamer};
pub use llama::{LlamaEventDecoder, LlamaHeaderDecoder, LlamaStreamer};
pub use streamer::{prepare_buffers, ChunkedStream, PacketSource, StreamStats};
