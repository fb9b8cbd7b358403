//! Open streams of one decoding session.
//!
//! Every stream is opened by its configuration packet. The registry keeps the
//! stream's reader, which holds the record state between packets, and the
//! [`StreamLayout`] harvested from the configuration: which channel keys the
//! stream produces and how large its traces are.

use super::reader::RecordReader;
use super::records::FcConfig;
use daq_core::{BufferKey, ChannelKey, ConfigError, PacketError};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{info, warn};

/// Master card request id; the remaining cards follow at `CARD_REQID_BASE + i`.
pub const MASTER_REQID: u16 = 0;
pub const CARD_REQID_BASE: u16 = 0x2000;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error(transparent)]
    Reader(#[from] PacketError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Channel layout of one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamLayout {
    pub stream_id: u16,
    /// Channel key per trace index.
    pub trace_keys: Vec<ChannelKey>,
    /// Distinct card addresses, in trace map order.
    pub card_addresses: Vec<u16>,
    pub n_cards: usize,
    pub wf_len: usize,
    pub fsp_enabled: bool,
}

impl StreamLayout {
    pub fn from_config(config: &FcConfig) -> Result<Self, ConfigError> {
        let stream_id = match u16::try_from(config.stream_id) {
            Ok(0) => {
                return Err(ConfigError::InvalidStream {
                    stream_id: 0,
                    reason: "stream id 0 is reserved".to_string(),
                })
            }
            Ok(id) => id,
            Err(_) => {
                return Err(ConfigError::InvalidStream {
                    stream_id: config.stream_id,
                    reason: "stream id does not fit 16 bits".to_string(),
                })
            }
        };

        let mut trace_keys = Vec::with_capacity(config.tracemap.len());
        let mut card_addresses = Vec::new();
        for &entry in &config.tracemap {
            let key = ChannelKey::new(stream_id, (entry >> 16) as u16, (entry & 0xffff) as u16);
            if trace_keys.contains(&key) {
                warn!(stream_id, key = %key, "Trace map names a channel twice");
            }
            if !card_addresses.contains(&key.card_address) {
                card_addresses.push(key.card_address);
            }
            trace_keys.push(key);
        }

        Ok(Self {
            stream_id,
            trace_keys,
            card_addresses,
            n_cards: config.n_cards() as usize,
            wf_len: config.eventsamples as usize,
            fsp_enabled: config.fsp_enabled,
        })
    }

    pub fn n_adc(&self) -> usize {
        self.trace_keys.len()
    }

    pub fn trace_key(&self, index: u16) -> Option<ChannelKey> {
        self.trace_keys.get(usize::from(index)).copied()
    }

    /// Distinct trace keys, as buffer keys.
    pub fn channel_keys(&self) -> Vec<BufferKey> {
        let mut keys: Vec<BufferKey> = Vec::with_capacity(self.trace_keys.len());
        for key in &self.trace_keys {
            let key = BufferKey::from(*key);
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        keys
    }

    /// Key of a card's status row.
    pub fn status_key(&self, reqid: u16) -> BufferKey {
        ChannelKey::new(self.stream_id, reqid, 0).into()
    }

    /// Master status key followed by one key per card.
    pub fn status_keys(&self) -> Vec<BufferKey> {
        std::iter::once(MASTER_REQID)
            .chain((0..self.n_cards).map(|i| CARD_REQID_BASE + i as u16))
            .map(|reqid| self.status_key(reqid))
            .collect()
    }

    /// Key of the stream-wide rows (configuration, event headers).
    pub fn header_key(&self) -> BufferKey {
        ChannelKey::new(self.stream_id, 0, 0).into()
    }

    /// Key of the online-filter rows.
    pub fn summary_key(&self) -> BufferKey {
        BufferKey::Summary(u32::from(self.stream_id))
    }
}

/// Layouts by stream id.
#[derive(Debug, Clone, Default)]
pub struct StreamLayouts {
    layouts: BTreeMap<u16, StreamLayout>,
}

impl StreamLayouts {
    pub fn insert(&mut self, layout: StreamLayout) {
        self.layouts.insert(layout.stream_id, layout);
    }

    pub fn get(&self, stream_id: u16) -> Option<&StreamLayout> {
        self.layouts.get(&stream_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &StreamLayout> {
        self.layouts.values()
    }

    pub fn is_empty(&self) -> bool {
        self.layouts.is_empty()
    }

    /// Layout of the stream a key belongs to.
    pub fn for_key(&self, key: &BufferKey) -> Option<&StreamLayout> {
        match key {
            BufferKey::Id(packed) => self.get(ChannelKey::unpack(*packed).stream_id),
            BufferKey::Summary(stream_id) => u16::try_from(*stream_id).ok().and_then(|id| self.get(id)),
            BufferKey::Any => self.iter().next(),
            BufferKey::Name(_) => None,
        }
    }

    /// Largest trace count over all streams.
    pub fn max_adc(&self) -> usize {
        self.iter().map(StreamLayout::n_adc).max().unwrap_or(0)
    }
}

/// Reader and layout of an open stream.
#[derive(Debug)]
pub struct OpenStream<R> {
    pub reader: R,
    pub layout: StreamLayout,
}

/// Streams of one session, by the stream id of their envelopes.
#[derive(Debug)]
pub struct StreamRegistry<R> {
    streams: BTreeMap<u32, OpenStream<R>>,
}

impl<R> Default for StreamRegistry<R> {
    fn default() -> Self {
        Self {
            streams: BTreeMap::new(),
        }
    }
}

impl<R: RecordReader + Default> StreamRegistry<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a stream from its configuration payload.
    ///
    /// An already open stream is re-armed with the new configuration.
    pub fn open(&mut self, stream_id: u32, payload: &[u8]) -> Result<&StreamLayout, RegistryError> {
        let reader = match self.streams.remove(&stream_id) {
            Some(mut open) => {
                warn!(stream_id, "Stream already open, continuing with the new configuration");
                open.reader.rearm(payload)?;
                open.reader
            }
            None => {
                let mut reader = R::default();
                reader.open(payload)?;
                reader
            }
        };
        let Some(config) = reader.config() else {
            return Err(PacketError::Reader("no configuration after open".to_string()).into());
        };
        if config.stream_id != stream_id {
            warn!(
                stream_id,
                config_stream_id = config.stream_id,
                "Envelope stream id does not match the configuration"
            );
        }
        let layout = StreamLayout::from_config(config)?;
        info!(
            stream_id = layout.stream_id,
            adcs = layout.n_adc(),
            cards = layout.n_cards,
            fsp = layout.fsp_enabled,
            "Opened FCIO stream"
        );
        let open = self.streams.entry(stream_id).or_insert(OpenStream { reader, layout });
        Ok(&open.layout)
    }

    pub fn get_mut(&mut self, stream_id: u32) -> Result<&mut OpenStream<R>, PacketError> {
        self.streams
            .get_mut(&stream_id)
            .ok_or(PacketError::UnknownStream { stream_id })
    }

    pub fn is_open(&self, stream_id: u32) -> bool {
        self.streams.contains_key(&stream_id)
    }

    pub fn close(&mut self, stream_id: u32) -> Option<OpenStream<R>> {
        self.streams.remove(&stream_id)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fcio::reader::{config_payload, ScriptedReader};
    use tracing_test::traced_test;

    fn config(stream_id: u32) -> FcConfig {
        FcConfig {
            stream_id,
            eventsamples: 8,
            mastercards: 1,
            adccards: 2,
            tracemap: vec![0x0010_0000, 0x0010_0001, 0x0011_0000],
            ..Default::default()
        }
    }

    #[test]
    fn test_layout_from_config() {
        let layout = StreamLayout::from_config(&config(3)).unwrap();
        assert_eq!(layout.n_adc(), 3);
        assert_eq!(layout.n_cards, 3);
        assert_eq!(layout.wf_len, 8);
        assert_eq!(layout.card_addresses, vec![0x10, 0x11]);
        assert_eq!(layout.trace_key(2), Some(ChannelKey::new(3, 0x11, 0)));
        assert_eq!(layout.trace_key(3), None);
        assert_eq!(layout.channel_keys()[1], BufferKey::Id((3 << 32) | (0x10 << 16) | 1));
        assert_eq!(
            layout.status_keys(),
            vec![
                BufferKey::Id(3 << 32),
                BufferKey::Id((3 << 32) | (0x2000 << 16)),
                BufferKey::Id((3 << 32) | (0x2001 << 16)),
                BufferKey::Id((3 << 32) | (0x2002 << 16)),
            ]
        );
        assert_eq!(layout.summary_key(), BufferKey::Summary(3));
    }

    #[test]
    fn test_stream_id_zero_is_rejected() {
        assert!(matches!(
            StreamLayout::from_config(&config(0)),
            Err(ConfigError::InvalidStream { stream_id: 0, .. })
        ));
        assert!(matches!(
            StreamLayout::from_config(&config(70_000)),
            Err(ConfigError::InvalidStream { stream_id: 70_000, .. })
        ));
    }

    #[test]
    fn test_layouts_by_key() {
        let mut layouts = StreamLayouts::default();
        layouts.insert(StreamLayout::from_config(&config(3)).unwrap());
        assert_eq!(layouts.for_key(&BufferKey::Id(3 << 32)).unwrap().stream_id, 3);
        assert_eq!(layouts.for_key(&BufferKey::Summary(3)).unwrap().stream_id, 3);
        assert!(layouts.for_key(&BufferKey::Id(4 << 32)).is_none());
        assert_eq!(layouts.max_adc(), 3);
    }

    #[traced_test]
    #[test]
    fn test_reopen_rearms_stream() {
        let mut registry = StreamRegistry::<ScriptedReader>::new();
        registry.open(3, &config_payload(&config(3)).unwrap()).unwrap();
        assert!(registry.is_open(3));

        let mut updated = config(3);
        updated.eventsamples = 16;
        let layout = registry.open(3, &config_payload(&updated).unwrap()).unwrap();
        assert_eq!(layout.wf_len, 16);
        assert_eq!(registry.len(), 1);
        assert!(logs_contain("Stream already open"));

        assert!(matches!(registry.get_mut(4), Err(PacketError::UnknownStream { stream_id: 4 })));
        assert!(registry.close(3).is_some());
        assert!(registry.is_empty());
    }
}
