//! Traces: one row per trace, keyed by the channel that recorded it.
//!
//! Event and sparse event records share this decoder. A sparse event simply
//! carries fewer traces. The online-filter event attached to a record lands in
//! the stream's summary buffer.

use super::eventheader::{event_schema, store_event};
use super::fsp::{fsp_event_schema, write_fsp_event};
use super::records::{FcEvent, FcTrace, FspEvent};
use super::registry::{StreamLayout, StreamLayouts};
use super::{FcRecord, FC_SAMPLE_DT_NS};
use crate::decoder::{route, write_row, write_waveform, PacketDecoder, Route};
use crate::faults::PacketFaults;
use daq_core::{BufferKey, ChannelKey, DType, PacketError, SchemaError};
use daq_storage::{FieldSpec, RawBufferList, Schema, SchemaSource, Table};
use tracing::trace;

pub const EVENT_DECODER_NAME: &str = "fc_event";

fn trace_schema(wf_len: usize) -> Schema {
    let mut schema = event_schema()
        .with_field("board_id", FieldSpec::scalar(DType::U16))
        .with_field("fc_input", FieldSpec::scalar(DType::U16))
        .with_field("channel", FieldSpec::scalar(DType::U16))
        .with_field("baseline", FieldSpec::scalar(DType::U16))
        .with_field("daqenergy", FieldSpec::scalar(DType::U16));
    if wf_len > 0 {
        schema.insert("waveform", FieldSpec::waveform(DType::U16, wf_len, FC_SAMPLE_DT_NS));
    }
    schema
}

struct TraceRow<'r> {
    packet_id: u32,
    stream_id: u16,
    key: ChannelKey,
    event: &'r FcEvent,
    trace: &'r FcTrace,
}

impl TraceRow<'_> {
    fn store(&self, table: &mut Table, row: usize) -> Result<(), PacketError> {
        store_event(table, row, self.packet_id, self.stream_id, self.event)?;
        table.set_if_present("board_id", row, self.key.card_address)?;
        table.set_if_present("fc_input", row, self.key.input)?;
        table.set_if_present("channel", row, self.trace.index)?;
        table.set_if_present("baseline", row, self.trace.baseline)?;
        table.set_if_present("daqenergy", row, self.trace.daq_energy)?;
        write_waveform(table, "waveform", row, self.trace.samples.iter().copied())
    }
}

#[derive(Debug)]
pub struct FcEventDecoder {
    layouts: StreamLayouts,
    faults: PacketFaults,
}

impl FcEventDecoder {
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

impl SchemaSource for FcEventDecoder {
    fn name(&self) -> &str {
        EVENT_DECODER_NAME
    }

    /// One group per stream, since streams may differ in trace length, and
    /// one group for the summary keys.
    fn key_groups(&self) -> Vec<Vec<BufferKey>> {
        if self.layouts.is_empty() {
            return vec![vec![BufferKey::Any]];
        }
        let mut groups: Vec<Vec<BufferKey>> = self
            .layouts
            .iter()
            .map(StreamLayout::channel_keys)
            .filter(|keys| !keys.is_empty())
            .collect();
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
                decoder: EVENT_DECODER_NAME.to_string(),
            });
        }
        let known = self.layouts.for_key(key).and_then(|layout| match key {
            BufferKey::Any => Some(trace_schema(layout.wf_len)),
            BufferKey::Summary(_) if layout.fsp_enabled => Some(fsp_event_schema()),
            BufferKey::Id(packed) if layout.trace_keys.contains(&ChannelKey::unpack(*packed)) => {
                Some(trace_schema(layout.wf_len))
            }
            _ => None,
        });
        known.ok_or_else(|| SchemaError::UnknownKey {
            decoder: EVENT_DECODER_NAME.to_string(),
            key: key.clone(),
        })
    }

    /// A buffer listing every channel of a stream takes one row per trace.
    fn max_rows_per_packet(&self) -> usize {
        self.layouts.max_adc().max(1)
    }
}

impl<'a> PacketDecoder<FcRecord<'a, FcEvent, FspEvent>> for FcEventDecoder {
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
        let event = record.data;
        let mut full = false;
        for fc_trace in &event.traces {
            let Some(channel) = layout.trace_key(fc_trace.index) else {
                let error = PacketError::UnknownTrace { index: fc_trace.index };
                self.faults.reject(&layout.header_key(), packet_id, record.raw, &error);
                continue;
            };
            let key = BufferKey::from(channel);
            let Route::Buffer(buffer) = route(buffers, &key) else {
                self.faults.unrouted(&key);
                continue;
            };
            let row = TraceRow {
                packet_id,
                stream_id: layout.stream_id,
                key: channel,
                event,
                trace: fc_trace,
            };
            match write_row(buffer, |table, i| row.store(table, i)) {
                Ok(is_full) => {
                    if is_full {
                        trace!(key = %key, packet_id, "Buffer full");
                    }
                    full |= is_full;
                }
                Err(e) => self.faults.reject(&key, packet_id, record.raw, &e),
            }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fcio::records::FcConfig;
    use daq_core::{CorruptionPolicy, Scalar};
    use daq_storage::RawBuffer;

    fn layout(stream_id: u32, eventsamples: u32) -> StreamLayout {
        StreamLayout::from_config(&FcConfig {
            stream_id,
            eventsamples,
            adccards: 1,
            tracemap: vec![0x0010_0000, 0x0010_0001, 0x0010_0002],
            fsp_enabled: true,
            ..Default::default()
        })
        .unwrap()
    }

    fn decoder() -> FcEventDecoder {
        let mut decoder = FcEventDecoder::new(PacketFaults::new(EVENT_DECODER_NAME, CorruptionPolicy::SkipAndCount));
        decoder.insert_layout(layout(1, 4));
        decoder
    }

    fn trace(index: u16, samples: Vec<u16>) -> FcTrace {
        FcTrace {
            index,
            baseline: 1000 + index,
            daq_energy: 10 * index,
            samples,
        }
    }

    #[test]
    fn test_key_groups_per_stream() {
        let mut decoder = decoder();
        decoder.insert_layout(layout(2, 0));
        let groups = decoder.key_groups();
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].len(), 3);
        assert_eq!(groups[2], vec![BufferKey::Summary(1), BufferKey::Summary(2)]);
        assert_eq!(decoder.max_rows_per_packet(), 3);

        let with_waveform = decoder.schema(&groups[0][0]).unwrap();
        assert!(with_waveform.contains("waveform"));
        let without = decoder.schema(&groups[1][0]).unwrap();
        assert!(!without.contains("waveform"));
        assert!(decoder.schema(&BufferKey::Summary(1)).unwrap().contains("obs_ct_max"));
    }

    #[test]
    fn test_traces_fan_out_by_channel() {
        let mut decoder = decoder();
        let layout = layout(1, 4);
        let keys = layout.channel_keys();
        let mut list = RawBufferList::new(
            EVENT_DECODER_NAME,
            vec![
                RawBuffer::new(keys[..2].to_vec(), "", "ch0_1"),
                RawBuffer::new(keys[2..].to_vec(), "", "ch2"),
                RawBuffer::new(vec![layout.summary_key()], "", "fsp"),
            ],
        )
        .unwrap();
        list.allocate_from(&decoder, 8).unwrap();

        let event = FcEvent {
            event_number: 3,
            traces: vec![trace(2, vec![1, 2, 3, 4]), trace(0, vec![5, 6]), trace(7, vec![])],
            ..Default::default()
        };
        let fsp = FspEvent {
            is_written: true,
            obs_ct_trace_idx: vec![2],
            obs_ct_max: vec![900],
            ..Default::default()
        };
        let record = FcRecord {
            stream_id: 1,
            data: &event,
            summary: Some(&fsp),
            raw: &[],
        };
        assert!(!decoder.decode_packet(&record, &mut list, 11));

        let ch2 = list.buffer_for(&keys[2]).unwrap();
        assert_eq!(ch2.loc, 1);
        let table = ch2.table.as_ref().unwrap();
        assert_eq!(table.scalar("channel", 0).unwrap(), Scalar::UInt(2));
        assert_eq!(table.scalar("fc_input", 0).unwrap(), Scalar::UInt(2));
        assert_eq!(table.scalar("board_id", 0).unwrap(), Scalar::UInt(0x10));
        assert_eq!(table.scalar("numtraces", 0).unwrap(), Scalar::UInt(3));
        assert_eq!(table.waveform("waveform").unwrap().values.row::<u16>(0).unwrap(), &[1, 2, 3, 4]);

        let ch0 = list.buffer_for(&keys[0]).unwrap();
        assert_eq!(ch0.loc, 1);
        assert_eq!(ch0.table.as_ref().unwrap().scalar("baseline", 0).unwrap(), Scalar::UInt(1000));

        let summary = list.buffer_for(&BufferKey::Summary(1)).unwrap();
        assert_eq!(summary.loc, 1);

        assert_eq!(decoder.faults().rejected(&layout.header_key()), 1);
    }

    #[test]
    fn test_oversized_trace_is_rejected() {
        let mut decoder = decoder();
        let layout = layout(1, 4);
        let mut list = RawBufferList::new(
            EVENT_DECODER_NAME,
            vec![RawBuffer::new(layout.channel_keys(), "", "all")],
        )
        .unwrap();
        list.allocate_from(&decoder, 8).unwrap();
        let event = FcEvent {
            traces: vec![trace(0, vec![0; 5]), trace(1, vec![0; 4])],
            ..Default::default()
        };
        let record = FcRecord {
            stream_id: 1,
            data: &event,
            summary: None,
            raw: &[],
        };
        decoder.decode_packet(&record, &mut list, 0);
        let all = list.buffer_for(&layout.channel_keys()[0]).unwrap();
        assert_eq!(all.loc, 1);
        assert_eq!(all.table.as_ref().unwrap().scalar("channel", 0).unwrap(), Scalar::UInt(1));
        assert_eq!(decoder.faults().rejected(&layout.channel_keys()[0]), 1);
    }
}
