//! Event headers: one row per event, without waveforms.
//!
//! The row carries the event timing and, as ragged columns, the index,
//! baseline and energy of every trace in the event. Streams running the
//! online filter also get the filter's event summary, keyed
//! `BufferKey::Summary(stream_id)`.

use super::fsp::{fsp_event_schema, write_fsp_event};
use super::records::{FcEvent, FcTrace, FspEvent};
use super::registry::{StreamLayout, StreamLayouts};
use super::FcRecord;
use crate::decoder::{route, write_row, PacketDecoder, Route};
use crate::faults::PacketFaults;
use daq_core::{BufferKey, DType, PacketError, SchemaError};
use daq_storage::{FieldSpec, RawBufferList, Schema, SchemaSource, Table};

pub const EVENT_HEADER_DECODER_NAME: &str = "fc_eventheader";

/// Columns shared by event headers and traces.
pub(crate) fn event_schema() -> Schema {
    Schema::new()
        .with_field("packet_id", FieldSpec::scalar(DType::U32))
        .with_field("fcid", FieldSpec::scalar(DType::U16))
        .with_field("event_type", FieldSpec::scalar(DType::I32))
        .with_field("eventnumber", FieldSpec::scalar(DType::I32))
        .with_field("timestamp", FieldSpec::scalar(DType::F64).with_attr("units", "s"))
        .with_field("runtime", FieldSpec::scalar(DType::F64).with_attr("units", "s"))
        .with_field("deadtime", FieldSpec::scalar(DType::F64).with_attr("units", "s"))
        .with_field("ts_pps", FieldSpec::scalar(DType::I32))
        .with_field("ts_ticks", FieldSpec::scalar(DType::I32))
        .with_field("ts_maxticks", FieldSpec::scalar(DType::I32))
        .with_field("numtraces", FieldSpec::scalar(DType::U32))
}

pub(crate) fn store_event(
    table: &mut Table,
    row: usize,
    packet_id: u32,
    stream_id: u16,
    event: &FcEvent,
) -> Result<(), PacketError> {
    table.set("packet_id", row, packet_id)?;
    table.set_if_present("fcid", row, stream_id)?;
    table.set_if_present("event_type", row, event.event_type)?;
    table.set_if_present("eventnumber", row, event.event_number)?;
    table.set_if_present("timestamp", row, event.timestamp.seconds())?;
    table.set_if_present("runtime", row, event.run_time)?;
    table.set_if_present("deadtime", row, event.deadtime)?;
    table.set_if_present("ts_pps", row, event.timestamp.pps)?;
    table.set_if_present("ts_ticks", row, event.timestamp.ticks)?;
    table.set_if_present("ts_maxticks", row, event.timestamp.max_ticks)?;
    table.set_if_present("numtraces", row, event.traces.len() as u32)?;
    Ok(())
}

fn header_schema(n_adc: usize) -> Schema {
    let guess = Some(n_adc.max(1));
    event_schema()
        .with_field("tracelist", FieldSpec::ragged(DType::U16, guess))
        .with_field("baseline", FieldSpec::ragged(DType::U16, guess))
        .with_field("daqenergy", FieldSpec::ragged(DType::U16, guess))
}

fn store_header(table: &mut Table, row: usize, packet_id: u32, stream_id: u16, event: &FcEvent) -> Result<(), PacketError> {
    store_event(table, row, packet_id, stream_id, event)?;
    let columns: [(&str, fn(&FcTrace) -> u16); 3] = [
        ("tracelist", |t| t.index),
        ("baseline", |t| t.baseline),
        ("daqenergy", |t| t.daq_energy),
    ];
    for (name, value) in columns {
        if table.contains(name) {
            table.ragged_mut(name)?.set_row(row, event.traces.iter().map(value))?;
        }
    }
    Ok(())
}

#[derive(Debug)]
pub struct FcEventHeaderDecoder {
    layouts: StreamLayouts,
    faults: PacketFaults,
}

impl FcEventHeaderDecoder {
    pub fn new(faults: PacketFaults) -> Self {
        Self {
            layouts: StreamLayouts::default(),
            faults,
        }
    }

    pub fn insert_layout(&mut self, layout: StreamLayout) {
        self.layouts.insert(layout);
    }
}

impl SchemaSource for FcEventHeaderDecoder {
    fn name(&self) -> &str {
        EVENT_HEADER_DECODER_NAME
    }

    /// Header keys of every stream, then the summary keys.
    fn key_groups(&self) -> Vec<Vec<BufferKey>> {
        if self.layouts.is_empty() {
            return vec![vec![BufferKey::Any]];
        }
        let mut groups = vec![self.layouts.iter().map(StreamLayout::header_key).collect()];
        let summaries: Vec<BufferKey> = self
            .layouts
            .iter()
            .filter(|l| l.fsp_enabled)
            .map(StreamLayout::summary_key)
            .collect();
        if !summaries.is_empty() {
            groups.push(summaries);
        }
        groups
    }

    fn schema(&self, key: &BufferKey) -> Result<Schema, SchemaError> {
        if self.layouts.is_empty() {
            return Err(SchemaError::SchemaNotBuilt {
                decoder: EVENT_HEADER_DECODER_NAME.to_string(),
            });
        }
        match self.layouts.for_key(key) {
            Some(layout) if matches!(key, BufferKey::Any) || *key == layout.header_key() => {
                Ok(header_schema(self.layouts.max_adc()))
            }
            Some(layout) if matches!(key, BufferKey::Summary(_)) && layout.fsp_enabled => Ok(fsp_event_schema()),
            _ => Err(SchemaError::UnknownKey {
                decoder: EVENT_HEADER_DECODER_NAME.to_string(),
                key: key.clone(),
            }),
        }
    }
}

impl<'a> PacketDecoder<FcRecord<'a, FcEvent, FspEvent>> for FcEventHeaderDecoder {
    fn decode_packet(
        &mut self,
        record: &FcRecord<'a, FcEvent, FspEvent>,
        buffers: &mut RawBufferList,
        packet_id: u32,
    ) -> bool {
        let Some(layout) = self.layouts.get(record.stream_id) else {
            let error = PacketError::UnknownStream {
                stream_id: u32::from(record.stream_id),
            };
            self.faults.reject(&BufferKey::Any, packet_id, record.raw, &error);
            return false;
        };
        let key = layout.header_key();
        let mut full = false;
        match route(buffers, &key) {
            Route::Buffer(buffer) => {
                match write_row(buffer, |table, row| store_header(table, row, packet_id, record.stream_id, record.data)) {
                    Ok(is_full) => full = is_full,
                    Err(e) => self.faults.reject(&key, packet_id, record.raw, &e),
                }
            }
            Route::Unrouted => self.faults.unrouted(&key),
        }

        if let (true, Some(fsp)) = (layout.fsp_enabled, record.summary) {
            let key = layout.summary_key();
            full |= write_fsp_event(&mut self.faults, buffers, &key, packet_id, record.raw, fsp);
        }
        full
    }

    fn faults(&self) -> &PacketFaults {
        &self.faults
    }

    fn faults_mut(&mut self) -> &mut PacketFaults {
        &mut self.faults
    }
}
