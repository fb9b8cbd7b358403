//! Shared defaults and hard limits.
//!
//! Centralizing these keeps buffer sizing consistent between the settings
//! loader, the buffer library and the decoders.

// =============================================================================
// Buffer Sizing
// =============================================================================

/// Default number of rows per buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Default fill-safety margin for decoders writing one row per packet.
pub const DEFAULT_FILL_SAFETY: usize = 1;

/// Default number of rows in the garbage table.
pub const DEFAULT_GARBAGE_CAPACITY: usize = 256;

/// Expected packet size in bytes, used to size the garbage byte arena.
pub const DEFAULT_PACKET_SIZE_GUESS: usize = 1024;

// =============================================================================
// Protocol Limits
// =============================================================================

/// Maximum number of channels in one FC stream event.
pub const MAX_CHANNELS: usize = 2304;

/// Maximum accepted packet payload in 32-bit words.
pub const MAX_PACKET_WORDS: usize = 1 << 18;
