//! Stream configuration rows.

use super::records::FcConfig;
use super::registry::StreamLayout;
use super::FcRecord;
use crate::decoder::{route, write_row, PacketDecoder, Route};
use crate::faults::PacketFaults;
use daq_core::{BufferKey, DType, PacketError, SchemaError};
use daq_storage::{FieldSpec, RawBufferList, Schema, SchemaSource, Table};

pub const CONFIG_DECODER_NAME: &str = "fc_config";

const U32_FIELDS: [&str; 10] = [
    "nsamples",
    "nadcs",
    "ntriggers",
    "adcbits",
    "sumlength",
    "blprecision",
    "mastercards",
    "triggercards",
    "adccards",
    "gps",
];

/// One row per configuration packet.
#[derive(Debug)]
pub struct FcConfigDecoder {
    max_traces: usize,
    faults: PacketFaults,
}

impl FcConfigDecoder {
    pub fn new(faults: PacketFaults) -> Self {
        Self { max_traces: 0, faults }
    }

    /// Size the trace map column for `layout`.
    pub fn insert_layout(&mut self, layout: &StreamLayout) {
        self.max_traces = self.max_traces.max(layout.n_adc());
    }
}

impl SchemaSource for FcConfigDecoder {
    fn name(&self) -> &str {
        CONFIG_DECODER_NAME
    }

    fn schema(&self, _key: &BufferKey) -> Result<Schema, SchemaError> {
        let mut schema = Schema::new()
            .with_field("packet_id", FieldSpec::scalar(DType::U32))
            .with_field("fcid", FieldSpec::scalar(DType::U16));
        for name in U32_FIELDS {
            schema.insert(name, FieldSpec::scalar(DType::U32));
        }
        schema.insert("fsp_enabled", FieldSpec::scalar(DType::Bool));
        schema.insert(
            "tracemap",
            FieldSpec::ragged(DType::U32, Some(self.max_traces.max(1))),
        );
        Ok(schema)
    }
}

fn store_config(table: &mut Table, row: usize, packet_id: u32, stream_id: u16, config: &FcConfig) -> Result<(), PacketError> {
    table.set("packet_id", row, packet_id)?;
    table.set_if_present("fcid", row, stream_id)?;
    let values = [
        config.eventsamples,
        config.adcs,
        config.triggers,
        config.adcbits,
        config.sumlength,
        config.blprecision,
        config.mastercards,
        config.triggercards,
        config.adccards,
        config.gps,
    ];
    for (name, value) in U32_FIELDS.iter().zip(values) {
        table.set_if_present(name, row, value)?;
    }
    table.set_if_present("fsp_enabled", row, config.fsp_enabled)?;
    if table.contains("tracemap") {
        table.ragged_mut("tracemap")?.set_row(row, config.tracemap.iter().copied())?;
    }
    Ok(())
}

impl<'a> PacketDecoder<FcRecord<'a, FcConfig>> for FcConfigDecoder {
    fn decode_packet(&mut self, record: &FcRecord<'a, FcConfig>, buffers: &mut RawBufferList, packet_id: u32) -> bool {
        let key = BufferKey::Any;
        let Route::Buffer(buffer) = route(buffers, &key) else {
            self.faults.unrouted(&key);
            return false;
        };
        match write_row(buffer, |table, row| store_config(table, row, packet_id, record.stream_id, record.data)) {
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
