//! Card status rows.
//!
//! A status record holds one entry per card. Each becomes a row in the buffer
//! of the card's key, `ChannelKey(stream, reqid, 0)`. With the online filter
//! enabled the filter's status row goes to the stream's summary key.

use super::fsp::{fsp_status_schema, store_fsp_status};
use super::records::{FcCardStatus, FcStatus, FspStatus};
use super::registry::{StreamLayout, StreamLayouts};
use super::FcRecord;
use crate::decoder::{route, write_row, PacketDecoder, Route};
use crate::faults::PacketFaults;
use daq_core::{BufferKey, DType, PacketError, SchemaError};
use daq_storage::{FieldSpec, RawBufferList, Schema, SchemaSource, Table};

pub const STATUS_DECODER_NAME: &str = "fc_status";

/// Other error counters per card.
pub const N_OTHER_ERRORS: usize = 5;

#[derive(Debug)]
pub struct FcStatusDecoder {
    layouts: StreamLayouts,
    faults: PacketFaults,
}

impl FcStatusDecoder {
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

fn card_schema() -> Schema {
    let seconds = |dtype| FieldSpec::scalar(dtype).with_attr("units", "s");
    Schema::new()
        .with_field("packet_id", FieldSpec::scalar(DType::U32))
        .with_field("fcid", FieldSpec::scalar(DType::U16))
        .with_field("status", FieldSpec::scalar(DType::I32))
        .with_field("fpga_time", seconds(DType::F64))
        .with_field("server_time", seconds(DType::F64))
        .with_field("fpga_start_time", seconds(DType::F64))
        .with_field("id", FieldSpec::scalar(DType::U16))
        .with_field("card_status", FieldSpec::scalar(DType::I32))
        .with_field("eventnumber", FieldSpec::scalar(DType::I32))
        .with_field("ts_pps", FieldSpec::scalar(DType::I32))
        .with_field("ts_ticks", FieldSpec::scalar(DType::I32))
        .with_field("ts_maxticks", FieldSpec::scalar(DType::I32))
        .with_field("n_total_errors", FieldSpec::scalar(DType::U32))
        .with_field("n_environment_errors", FieldSpec::scalar(DType::U32))
        .with_field("n_cti_errors", FieldSpec::scalar(DType::U32))
        .with_field("n_link_errors", FieldSpec::scalar(DType::U32))
        .with_field("n_other_errors", FieldSpec::fixed(DType::U32, N_OTHER_ERRORS))
        .with_field("environment", FieldSpec::ragged(DType::I32, None))
        .with_field("cti_links", FieldSpec::ragged(DType::U32, None))
        .with_field("link_states", FieldSpec::ragged(DType::U32, None))
}

fn store_card(
    table: &mut Table,
    row: usize,
    packet_id: u32,
    stream_id: u16,
    status: &FcStatus,
    card: &FcCardStatus,
) -> Result<(), PacketError> {
    table.set("packet_id", row, packet_id)?;
    table.set_if_present("fcid", row, stream_id)?;
    table.set_if_present("status", row, status.status)?;
    table.set_if_present("fpga_time", row, status.fpga_time)?;
    table.set_if_present("server_time", row, status.server_time)?;
    table.set_if_present("fpga_start_time", row, status.fpga_start_time)?;
    table.set_if_present("id", row, card.reqid)?;
    table.set_if_present("card_status", row, card.status)?;
    table.set_if_present("eventnumber", row, card.event_number)?;
    table.set_if_present("ts_pps", row, card.timestamp.pps)?;
    table.set_if_present("ts_ticks", row, card.timestamp.ticks)?;
    table.set_if_present("ts_maxticks", row, card.timestamp.max_ticks)?;
    table.set_if_present("n_total_errors", row, card.total_errors)?;
    table.set_if_present("n_environment_errors", row, card.env_errors)?;
    table.set_if_present("n_cti_errors", row, card.cti_errors)?;
    table.set_if_present("n_link_errors", row, card.link_errors)?;
    if table.contains("n_other_errors") {
        let n = card.other_errors.len().min(N_OTHER_ERRORS);
        table.fixed_mut("n_other_errors")?.set_row(row, card.other_errors[..n].iter().copied())?;
    }
    for (name, values) in [("cti_links", &card.cti_links), ("link_states", &card.link_states)] {
        if table.contains(name) {
            table.ragged_mut(name)?.set_row(row, values.iter().copied())?;
        }
    }
    if table.contains("environment") {
        table.ragged_mut("environment")?.set_row(row, card.environment.iter().copied())?;
    }
    Ok(())
}

impl SchemaSource for FcStatusDecoder {
    fn name(&self) -> &str {
        STATUS_DECODER_NAME
    }

    /// Card keys of every stream, then the summary keys.
    fn key_groups(&self) -> Vec<Vec<BufferKey>> {
        if self.layouts.is_empty() {
            return vec![vec![BufferKey::Any]];
        }
        let cards: Vec<BufferKey> = self.layouts.iter().flat_map(StreamLayout::status_keys).collect();
        let summaries: Vec<BufferKey> = self
            .layouts
            .iter()
            .filter(|l| l.fsp_enabled)
            .map(StreamLayout::summary_key)
            .collect();
        let mut groups = vec![cards];
        if !summaries.is_empty() {
            groups.push(summaries);
        }
        groups
    }

    fn schema(&self, key: &BufferKey) -> Result<Schema, SchemaError> {
        if self.layouts.is_empty() {
            return Err(SchemaError::SchemaNotBuilt {
                decoder: STATUS_DECODER_NAME.to_string(),
            });
        }
        let known = self.layouts.for_key(key).and_then(|layout| match key {
            BufferKey::Any => Some(card_schema()),
            BufferKey::Summary(_) if layout.fsp_enabled => Some(fsp_status_schema()),
            BufferKey::Id(_) if layout.status_keys().contains(key) => Some(card_schema()),
            _ => None,
        });
        known.ok_or_else(|| SchemaError::UnknownKey {
            decoder: STATUS_DECODER_NAME.to_string(),
            key: key.clone(),
        })
    }

    /// Every card of the largest stream plus the filter row.
    fn max_rows_per_packet(&self) -> usize {
        self.layouts.iter().map(|l| l.n_cards + 1).max().unwrap_or(1)
    }
}

impl<'a> PacketDecoder<FcRecord<'a, FcStatus, FspStatus>> for FcStatusDecoder {
    fn decode_packet(
        &mut self,
        record: &FcRecord<'a, FcStatus, FspStatus>,
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
        let status = record.data;
        let mut full = false;
        for card in &status.cards {
            let key = layout.status_key(card.reqid);
            match route(buffers, &key) {
                Route::Buffer(buffer) => {
                    match write_row(buffer, |table, row| {
                        store_card(table, row, packet_id, layout.stream_id, status, card)
                    }) {
                        Ok(is_full) => full |= is_full,
                        Err(e) => self.faults.reject(&key, packet_id, record.raw, &e),
                    }
                }
                Route::Unrouted => self.faults.unrouted(&key),
            }
        }

        if let (true, Some(fsp)) = (layout.fsp_enabled, record.summary) {
            let key = layout.summary_key();
            match route(buffers, &key) {
                Route::Buffer(buffer) => {
                    match write_row(buffer, |table, row| store_fsp_status(table, row, packet_id, fsp)) {
                        Ok(is_full) => full |= is_full,
                        Err(e) => self.faults.reject(&key, packet_id, record.raw, &e),
                    }
                }
                Route::Unrouted => self.faults.unrouted(&key),
            }
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
    use crate::fcio::records::{FcConfig, FcTimestamp};
    use daq_core::{ChannelKey, CorruptionPolicy, Scalar};
    use daq_storage::RawBuffer;

    fn layout(fsp_enabled: bool) -> StreamLayout {
        StreamLayout::from_config(&FcConfig {
            stream_id: 5,
            mastercards: 1,
            adccards: 1,
            tracemap: vec![0x0010_0000],
            fsp_enabled,
            ..Default::default()
        })
        .unwrap()
    }

    fn decoder(fsp_enabled: bool) -> FcStatusDecoder {
        let mut decoder = FcStatusDecoder::new(PacketFaults::new(STATUS_DECODER_NAME, CorruptionPolicy::SkipAndCount));
        decoder.insert_layout(layout(fsp_enabled));
        decoder
    }

    fn status() -> FcStatus {
        let card = |reqid| FcCardStatus {
            reqid,
            event_number: 12,
            timestamp: FcTimestamp {
                pps: 3,
                ticks: 10,
                max_ticks: 99,
            },
            other_errors: vec![1, 2, 3, 4, 5, 6],
            environment: vec![-40, 3300],
            link_states: vec![1; 4],
            ..Default::default()
        };
        FcStatus {
            status: 1,
            fpga_time: 2.5,
            cards: vec![card(0), card(0x2000)],
            ..Default::default()
        }
    }

    #[test]
    fn test_key_groups_and_rows_per_packet() {
        let decoder = decoder(true);
        let groups = decoder.key_groups();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].len(), 3);
        assert_eq!(groups[1], vec![BufferKey::Summary(5)]);
        assert_eq!(decoder.max_rows_per_packet(), 3);
        assert!(decoder.schema(&BufferKey::Summary(5)).unwrap().contains("n_read_events"));
        assert!(matches!(
            decoder.schema(&ChannelKey::new(5, 0x10, 0).into()),
            Err(SchemaError::UnknownKey { .. })
        ));
        assert!(matches!(
            FcStatusDecoder::new(PacketFaults::new(STATUS_DECODER_NAME, CorruptionPolicy::SkipAndCount))
                .schema(&BufferKey::Any),
            Err(SchemaError::SchemaNotBuilt { .. })
        ));
    }

    #[test]
    fn test_one_row_per_card_and_summary() {
        let mut decoder = decoder(true);
        let layout = layout(true);
        let mut list = RawBufferList::new(
            STATUS_DECODER_NAME,
            vec![
                RawBuffer::new(layout.status_keys(), "", "status"),
                RawBuffer::new(vec![layout.summary_key()], "", "fsp_status"),
            ],
        )
        .unwrap();
        list.allocate_from(&decoder, 8).unwrap();

        let status = status();
        let fsp = FspStatus {
            n_read_events: 9,
            ..Default::default()
        };
        let record = FcRecord {
            stream_id: 5,
            data: &status,
            summary: Some(&fsp),
            raw: &[],
        };
        assert!(!decoder.decode_packet(&record, &mut list, 4));

        let cards = list.buffer_for(&layout.status_key(0)).unwrap();
        assert_eq!(cards.loc, 2);
        let table = cards.table.as_ref().unwrap();
        assert_eq!(table.scalar("id", 1).unwrap(), Scalar::UInt(0x2000));
        assert_eq!(table.scalar("fpga_time", 0).unwrap(), Scalar::Float(2.5));
        assert_eq!(table.fixed("n_other_errors").unwrap().row::<u32>(0).unwrap(), &[1, 2, 3, 4, 5]);
        assert_eq!(table.ragged("environment").unwrap().row::<i32>(1).unwrap(), &[-40, 3300]);

        let summary = list.buffer_for(&BufferKey::Summary(5)).unwrap();
        assert_eq!(summary.loc, 1);
        let table = summary.table.as_ref().unwrap();
        assert_eq!(table.scalar("n_read_events", 0).unwrap(), Scalar::Int(9));
    }

    #[test]
    fn test_summary_skipped_without_filter() {
        let mut decoder = decoder(false);
        let layout = layout(false);
        let mut list = RawBufferList::new(
            STATUS_DECODER_NAME,
            vec![RawBuffer::new(vec![layout.status_key(0)], "", "master")],
        )
        .unwrap();
        list.allocate_from(&decoder, 8).unwrap();
        let status = status();
        let fsp = FspStatus::default();
        let record = FcRecord {
            stream_id: 5,
            data: &status,
            summary: Some(&fsp),
            raw: &[],
        };
        decoder.decode_packet(&record, &mut list, 0);
        assert_eq!(list.buffer_for(&layout.status_key(0)).unwrap().loc, 1);
        assert_eq!(decoder.faults().unrouted_count(&layout.status_key(0x2000)), 1);
        assert_eq!(decoder.faults().unrouted_count(&BufferKey::Summary(5)), 0);
    }
}
