//! SIS3316 digitizer data as recorded by llamaDAQ.
//!
//! A file is a [`header::LlamaHeader`] followed by a sequence of channel
//! events. [`streamer::LlamaStreamer`] reads both and routes events into
//! buffers keyed by fch id.

pub mod event;
pub mod header;
pub mod streamer;

pub use event::{channel_schema, LlamaEvent, LlamaEventDecoder, EVENT_DECODER_NAME};
pub use header::{ChannelConfig, LlamaHeader, LlamaHeaderDecoder, Version, HEADER_DECODER_NAME};
pub use streamer::LlamaStreamer;
