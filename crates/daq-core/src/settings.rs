//! Decode session settings.
//!
//! Settings are layered with `figment`:
//! 1. Built-in defaults
//! 2. An optional settings file (TOML, JSON or YAML, chosen by extension)
//! 3. Environment variables prefixed with `DAQ_` (e.g. `DAQ_BUFFER_SIZE=4096`)
//!
//! The merged result is checked with `serde_valid` before it is returned.
//!
//! # Example
//! ```no_run
//! use daq_core::settings::DecodeSettings;
//! use std::path::Path;
//!
//! # fn main() -> anyhow::Result<()> {
//! let settings = DecodeSettings::load(Path::new("config/decode.toml"))?;
//! println!("rows per buffer: {}", settings.buffer_size);
//! # Ok(())
//! # }
//! ```

use crate::limits;
use anyhow::{bail, Context, Result};
use figment::{
    providers::{Env, Format, Json, Serialized, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use serde_valid::Validate;
use std::path::Path;
use tracing::debug;

/// Environment prefix for setting overrides.
pub const ENV_PREFIX: &str = "DAQ_";

/// What happens to a packet that fails to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorruptionPolicy {
    /// Count the rejection per key and warn once per newly seen key.
    #[default]
    SkipAndCount,
    /// Store the raw bytes, packet id and error code in the garbage table.
    Garbage,
}

/// When a streamer hands buffers to the output store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkMode {
    /// Once any buffer is full, flush every buffer holding data.
    #[default]
    AnyFull,
    /// Once any buffer is full, flush only the full ones.
    OnlyFull,
    /// Flush after every packet.
    SinglePacket,
}

/// Settings for one decode session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct DecodeSettings {
    /// Rows per buffer when the library configuration gives no size.
    #[validate(minimum = 1)]
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    #[serde(default)]
    pub corruption_policy: CorruptionPolicy,

    /// Rows in the garbage table.
    #[validate(minimum = 1)]
    #[serde(default = "default_garbage_capacity")]
    pub garbage_capacity: usize,

    /// Expected packet size in bytes, sizes the garbage byte arena.
    #[validate(minimum = 4)]
    #[serde(default = "default_packet_size_guess")]
    pub packet_size_guess: usize,

    #[serde(default)]
    pub chunk_mode: ChunkMode,
}

fn default_buffer_size() -> usize {
    limits::DEFAULT_BUFFER_SIZE
}

fn default_garbage_capacity() -> usize {
    limits::DEFAULT_GARBAGE_CAPACITY
}

fn default_packet_size_guess() -> usize {
    limits::DEFAULT_PACKET_SIZE_GUESS
}

impl Default for DecodeSettings {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            corruption_policy: CorruptionPolicy::default(),
            garbage_capacity: default_garbage_capacity(),
            packet_size_guess: default_packet_size_guess(),
            chunk_mode: ChunkMode::default(),
        }
    }
}

impl DecodeSettings {
    /// Figment with defaults, the optional file, then environment overrides.
    pub fn figment(path: Option<&Path>) -> Result<Figment> {
        let mut figment = Figment::from(Serialized::defaults(DecodeSettings::default()));
        if let Some(path) = path {
            figment = merge_file(figment, path)?;
        }
        Ok(figment.merge(Env::prefixed(ENV_PREFIX)))
    }

    /// Load settings from a file plus environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "Loading decode settings");
        Self::extract(Self::figment(Some(path))?)
            .with_context(|| format!("Failed to load settings from {}", path.display()))
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self> {
        Self::extract(Self::figment(None)?)
    }

    fn extract(figment: Figment) -> Result<Self> {
        let settings: DecodeSettings = figment.extract()?;
        if let Err(errors) = settings.validate() {
            bail!("Settings validation failed: {}", errors);
        }
        Ok(settings)
    }
}

/// Merge a configuration file into `figment`, picking the format by extension.
pub fn merge_file(figment: Figment, path: &Path) -> Result<Figment> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    let figment = match ext.as_deref() {
        Some("toml") => figment.merge(Toml::file(path)),
        Some("json") => figment.merge(Json::file(path)),
        Some("yaml") | Some("yml") => figment.merge(Yaml::file(path)),
        _ => bail!("Unsupported config format: {}", path.display()),
    };
    Ok(figment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    fn write_temp(suffix: &str, contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    #[serial]
    fn test_defaults() {
        let settings = DecodeSettings::from_env().unwrap();
        assert_eq!(settings.buffer_size, 8192);
        assert_eq!(settings.garbage_capacity, 256);
        assert_eq!(settings.packet_size_guess, 1024);
        assert_eq!(settings.corruption_policy, CorruptionPolicy::SkipAndCount);
        assert_eq!(settings.chunk_mode, ChunkMode::AnyFull);
    }

    #[test]
    #[serial]
    fn test_load_toml_file() {
        let file = write_temp(
            ".toml",
            "buffer_size = 100\ncorruption_policy = \"garbage\"\nchunk_mode = \"only_full\"\n",
        );
        let settings = DecodeSettings::load(file.path()).unwrap();
        assert_eq!(settings.buffer_size, 100);
        assert_eq!(settings.corruption_policy, CorruptionPolicy::Garbage);
        assert_eq!(settings.chunk_mode, ChunkMode::OnlyFull);
        assert_eq!(settings.garbage_capacity, 256);
    }

    #[test]
    #[serial]
    fn test_load_yaml_file() {
        let file = write_temp(".yaml", "garbage_capacity: 16\nchunk_mode: single_packet\n");
        let settings = DecodeSettings::load(file.path()).unwrap();
        assert_eq!(settings.garbage_capacity, 16);
        assert_eq!(settings.chunk_mode, ChunkMode::SinglePacket);
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        let file = write_temp(".json", r#"{"buffer_size": 100}"#);
        std::env::set_var("DAQ_BUFFER_SIZE", "64");
        let settings = DecodeSettings::load(file.path());
        std::env::remove_var("DAQ_BUFFER_SIZE");
        assert_eq!(settings.unwrap().buffer_size, 64);
    }

    #[test]
    #[serial]
    fn test_zero_buffer_size_is_rejected() {
        let file = write_temp(".toml", "buffer_size = 0\n");
        assert!(DecodeSettings::load(file.path()).is_err());
    }

    #[test]
    fn test_unknown_extension_is_rejected() {
        let file = write_temp(".ini", "buffer_size = 1\n");
        assert!(DecodeSettings::load(file.path()).is_err());
    }
}
