//! Online-filter configuration rows.
//!
//! Written once per stream that runs the filter, keyed by the stream's
//! summary key.

use super::fsp::{fsp_config_schema, store_fsp_config};
use super::records::FspConfig;
use super::registry::{StreamLayout, StreamLayouts};
use super::FcRecord;
use crate::decoder::{route, write_row, PacketDecoder, Route};
use crate::faults::PacketFaults;
use daq_core::{BufferKey, SchemaError};
use daq_storage::{RawBufferList, Schema, SchemaSource};

pub const FSP_CONFIG_DECODER_NAME: &str = "fsp_config";

#[derive(Debug)]
pub struct FspConfigDecoder {
    layouts: StreamLayouts,
    faults: PacketFaults,
}

impl FspConfigDecoder {
    pub fn new(faults: PacketFaults) -> Self {
        Self {
            layouts: StreamLayouts::default(),
            faults,
        }
    }

    /// Track `layout`. Streams without the filter produce no rows.
    pub fn insert_layout(&mut self, layout: StreamLayout) {
        self.layouts.insert(layout);
    }

    fn filtered(&self) -> impl Iterator<Item = &StreamLayout> {
        self.layouts.iter().filter(|l| l.fsp_enabled)
    }
}

impl SchemaSource for FspConfigDecoder {
    fn name(&self) -> &str {
        FSP_CONFIG_DECODER_NAME
    }

    fn key_groups(&self) -> Vec<Vec<BufferKey>> {
        let keys: Vec<BufferKey> = self.filtered().map(StreamLayout::summary_key).collect();
        if keys.is_empty() {
            return vec![vec![BufferKey::Any]];
        }
        vec![keys]
    }

    fn schema(&self, key: &BufferKey) -> Result<Schema, SchemaError> {
        let n_traces = self.filtered().map(StreamLayout::n_adc).max();
        let Some(n_traces) = n_traces else {
            return Err(SchemaError::SchemaNotBuilt {
                decoder: FSP_CONFIG_DECODER_NAME.to_string(),
            });
        };
        match key {
            BufferKey::Any => Ok(fsp_config_schema(n_traces)),
            BufferKey::Summary(_) if self.layouts.for_key(key).is_some_and(|l| l.fsp_enabled) => {
                Ok(fsp_config_schema(n_traces))
            }
            _ => Err(SchemaError::UnknownKey {
                decoder: FSP_CONFIG_DECODER_NAME.to_string(),
                key: key.clone(),
            }),
        }
    }
}

impl<'a> PacketDecoder<FcRecord<'a, FspConfig>> for FspConfigDecoder {
    fn decode_packet(&mut self, record: &FcRecord<'a, FspConfig>, buffers: &mut RawBufferList, packet_id: u32) -> bool {
        let key = BufferKey::Summary(u32::from(record.stream_id));
        let Route::Buffer(buffer) = route(buffers, &key) else {
            self.faults.unrouted(&key);
            return false;
        };
        match write_row(buffer, |table, row| store_fsp_config(table, row, packet_id, record.stream_id, record.data)) {
            Ok(full) => full,
            Err(e) => {
                self.faults.reject(&key, packet_id, record.raw, &e);
                false
            }
        }
    }

    fn faults(&self) -> &PacketFaults {
        &self.faults
    }

    fn faults_mut(&mut self) -> &mut PacketFaults {
        &mut self.faults
    }
}
