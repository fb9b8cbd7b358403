//! Bookkeeping for packets a decoder could not store.
//!
//! A rejected packet never aborts decoding. Depending on the
//! [`CorruptionPolicy`] it is either counted per key, with a warning the first
//! time a key is rejected, or copied into a [`GarbageSink`].

use daq_core::{BufferKey, CorruptionPolicy, DecodeSettings, PacketError, SchemaError};
use daq_storage::GarbageSink;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Rejection and routing counters of one decoder.
#[derive(Debug, Clone)]
pub struct PacketFaults {
    decoder: String,
    policy: CorruptionPolicy,
    rejected: BTreeMap<BufferKey, u64>,
    unrouted: BTreeMap<BufferKey, u64>,
    garbage: Option<GarbageSink>,
}

impl PacketFaults {
    pub fn new(decoder: impl Into<String>, policy: CorruptionPolicy) -> Self {
        Self {
            decoder: decoder.into(),
            policy,
            rejected: BTreeMap::new(),
            unrouted: BTreeMap::new(),
            garbage: None,
        }
    }

    /// Policy and garbage sizing taken from `settings`.
    pub fn from_settings(decoder: impl Into<String>, settings: &DecodeSettings) -> Result<Self, SchemaError> {
        let faults = Self::new(decoder, settings.corruption_policy);
        if settings.corruption_policy == CorruptionPolicy::Garbage {
            let sink = GarbageSink::new(settings.garbage_capacity, settings.packet_size_guess)?;
            return Ok(faults.with_garbage(sink));
        }
        Ok(faults)
    }

    pub fn with_garbage(mut self, sink: GarbageSink) -> Self {
        self.garbage = Some(sink);
        self
    }

    pub fn policy(&self) -> CorruptionPolicy {
        self.policy
    }

    /// Handle a rejected packet addressed to `key`.
    pub fn reject(&mut self, key: &BufferKey, packet_id: u32, raw: &[u8], error: &PacketError) {
        let count = self.rejected.entry(key.clone()).or_insert(0);
        *count += 1;
        match (self.policy, self.garbage.as_mut()) {
            (CorruptionPolicy::Garbage, Some(sink)) => {
                debug!(
                    decoder = %self.decoder,
                    key = %key,
                    packet_id,
                    code = error.code(),
                    error = %error,
                    "Packet moved to garbage"
                );
                sink.put(raw, packet_id, error.code());
            }
            _ => {
                if *count == 1 {
                    warn!(
                        decoder = %self.decoder,
                        key = %key,
                        packet_id,
                        code = error.code(),
                        error = %error,
                        "Rejecting packet"
                    );
                }
            }
        }
    }

    /// Count a packet whose key has no buffer.
    pub fn unrouted(&mut self, key: &BufferKey) {
        let count = self.unrouted.entry(key.clone()).or_insert(0);
        *count += 1;
        if *count == 1 {
            debug!(decoder = %self.decoder, key = %key, "No buffer for key, skipping");
        }
    }

    pub fn rejected(&self, key: &BufferKey) -> u64 {
        self.rejected.get(key).copied().unwrap_or(0)
    }

    pub fn total_rejected(&self) -> u64 {
        self.rejected.values().sum()
    }

    pub fn unrouted_count(&self, key: &BufferKey) -> u64 {
        self.unrouted.get(key).copied().unwrap_or(0)
    }

    pub fn total_unrouted(&self) -> u64 {
        self.unrouted.values().sum()
    }

    pub fn garbage(&self) -> Option<&GarbageSink> {
        self.garbage.as_ref()
    }

    pub fn garbage_mut(&mut self) -> Option<&mut GarbageSink> {
        self.garbage.as_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use daq_core::Scalar;
    use tracing_test::traced_test;

    #[traced_test]
    #[test]
    fn test_skip_and_count_warns_once_per_key() {
        let mut faults = PacketFaults::new("llama_event", CorruptionPolicy::SkipAndCount);
        let key = BufferKey::Id(16);
        faults.reject(&key, 0, &[], &PacketError::MawTestData);
        faults.reject(&key, 1, &[], &PacketError::MawTestData);
        faults.reject(&BufferKey::Id(17), 2, &[], &PacketError::MawTestData);
        assert_eq!(faults.rejected(&key), 2);
        assert_eq!(faults.total_rejected(), 3);
        assert!(faults.garbage().is_none());
        logs_assert(|lines: &[&str]| {
            match lines.iter().filter(|l| l.contains("Rejecting packet")).count() {
                2 => Ok(()),
                n => Err(format!("expected 2 warnings, got {}", n)),
            }
        });
    }

    #[test]
    fn test_garbage_policy_stores_packet() {
        let settings = DecodeSettings {
            corruption_policy: CorruptionPolicy::Garbage,
            garbage_capacity: 4,
            packet_size_guess: 8,
            ..Default::default()
        };
        let mut faults = PacketFaults::from_settings("llama_event", &settings).unwrap();
        let error = PacketError::BadTrailerTag { tag: 0x5 };
        faults.reject(&BufferKey::Id(16), 9, &[1, 2, 3, 4], &error);
        let sink = faults.garbage().unwrap();
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.table().scalar("garbage_code", 0).unwrap(), Scalar::UInt(1));
        assert_eq!(sink.table().scalar("packet_id", 0).unwrap(), Scalar::UInt(9));
    }

    #[test]
    fn test_unrouted_counts() {
        let mut faults = PacketFaults::new("fc_event", CorruptionPolicy::SkipAndCount);
        faults.unrouted(&BufferKey::Id(3));
        faults.unrouted(&BufferKey::Id(3));
        assert_eq!(faults.unrouted_count(&BufferKey::Id(3)), 2);
        assert_eq!(faults.total_unrouted(), 2);
        assert_eq!(faults.total_rejected(), 0);
    }
}
