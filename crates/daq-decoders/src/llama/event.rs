//! SIS3316 event packets as written by llamaDAQ.
//!
//! One packet is one channel event in 32-bit little-endian words:
//!
//! ```text
//! word 0   [31:16] timestamp high   [15:4] fch id   [3:0] format bits
//! word 1   timestamp low
//! bit 0    7 words  peak high value/index, information, accumulators 1-6
//! bit 1    2 words  accumulators 7, 8
//! bit 2    3 words  MAW max, MAW before trigger, MAW after trigger
//! bit 3    2 words  start energy, max energy
//! trailer  [31:28] tag  [27] MAW test  [26] status  [25:0] raw sample words
//! (avg)    [31:28] 0xE  [23:16] count/status  [15:0] averaged sample words
//! samples  16-bit raw samples, then 16-bit averaged samples
//! ```

use super::header::ChannelConfig;
use crate::decoder::{route, write_row, write_waveform, PacketDecoder, Route};
use crate::faults::PacketFaults;
use crate::words::{bits, u16_len, u16_samples, WordView};
use daq_core::{BufferKey, DType, PacketError, SchemaError};
use daq_storage::{FieldSpec, RawBufferList, Schema, SchemaSource, Table};
use std::collections::BTreeMap;
use tracing::debug;

/// Buffer list name of the event decoder.
pub const EVENT_DECODER_NAME: &str = "llama_event";

const TAG_MASK: u32 = 0xf000_0000;
const TAG_NO_AVERAGE: u32 = 0xe000_0000;
const TAG_AVERAGE: u32 = 0xa000_0000;
const RAW_LENGTH_MASK: u32 = 0x03ff_ffff;
const STATUS_FLAG: u32 = 1 << 26;
const MAW_TEST_FLAG: u32 = 1 << 27;

/// Channel id encoded in event word 0.
pub fn fch_id_of(word0: u32) -> u32 {
    bits(word0, 4, 0xfff)
}

/// Format bit 0 group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeakAccumulators {
    pub peak_high_value: u32,
    pub peak_high_index: u32,
    pub information: u32,
    pub sums: [u32; 6],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Maw {
    pub max: u32,
    pub before: u32,
    pub after: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Energy {
    pub start: u32,
    pub max: u32,
}

/// A fully validated event. Parsing never touches a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlamaEvent<'a> {
    pub fch_id: u32,
    pub timestamp: u64,
    pub format_bits: u32,
    pub peak: Option<PeakAccumulators>,
    pub sums_7_8: Option<[u32; 2]>,
    pub maw: Option<Maw>,
    pub energy: Option<Energy>,
    pub status_flag: bool,
    pub avg_count_status: Option<u32>,
    raw: &'a [u8],
    avg: &'a [u8],
}

impl<'a> LlamaEvent<'a> {
    pub fn parse(packet: &'a [u8]) -> Result<Self, PacketError> {
        let words = WordView::new(packet)?;
        let w0 = words.word(0)?;
        let w1 = words.word(1)?;
        let timestamp = (u64::from(w0 & 0xffff_0000) << 16) | u64::from(w1);
        let format_bits = w0 & 0xf;
        let mut offset = 2;

        let peak = if format_bits & 0x1 != 0 {
            let first = words.word(offset)?;
            let second = words.word(offset + 1)?;
            let mut sums = [second & 0x00ff_ffff, 0, 0, 0, 0, 0];
            for (i, sum) in sums.iter_mut().enumerate().skip(1) {
                *sum = words.word(offset + 1 + i)?;
            }
            offset += 7;
            Some(PeakAccumulators {
                peak_high_value: first & 0xffff,
                peak_high_index: first >> 16,
                information: second >> 24,
                sums,
            })
        } else {
            None
        };

        let sums_7_8 = if format_bits & 0x2 != 0 {
            let sums = [words.word(offset)?, words.word(offset + 1)?];
            offset += 2;
            Some(sums)
        } else {
            None
        };

        let maw = if format_bits & 0x4 != 0 {
            let maw = Maw {
                max: words.word(offset)?,
                before: words.word(offset + 1)?,
                after: words.word(offset + 2)?,
            };
            offset += 3;
            Some(maw)
        } else {
            None
        };

        let energy = if format_bits & 0x8 != 0 {
            let energy = Energy {
                start: words.word(offset)?,
                max: words.word(offset + 1)?,
            };
            offset += 2;
            Some(energy)
        } else {
            None
        };

        let trailer = words.word(offset)?;
        offset += 1;
        let raw_words = (trailer & RAW_LENGTH_MASK) as usize;
        let (avg_words, avg_count_status) = match trailer & TAG_MASK {
            TAG_NO_AVERAGE => (0, None),
            TAG_AVERAGE => {
                let avg = words.word(offset)?;
                if avg & TAG_MASK != TAG_NO_AVERAGE {
                    return Err(PacketError::BadAverageTag { tag: avg >> 28 });
                }
                offset += 1;
                ((avg & 0xffff) as usize, Some(bits(avg, 16, 0xff)))
            }
            tag => return Err(PacketError::BadTrailerTag { tag: tag >> 28 }),
        };
        if trailer & MAW_TEST_FLAG != 0 {
            return Err(PacketError::MawTestData);
        }

        let samples = words.tail(offset);
        let expected = 2 * raw_words + 2 * avg_words;
        let actual = u16_len(samples);
        if expected != actual {
            return Err(PacketError::LengthMismatch { expected, actual });
        }
        let (raw, avg) = samples.split_at(raw_words * 4);

        Ok(Self {
            fch_id: fch_id_of(w0),
            timestamp,
            format_bits,
            peak,
            sums_7_8,
            maw,
            energy,
            status_flag: trailer & STATUS_FLAG != 0,
            avg_count_status,
            raw,
            avg,
        })
    }

    pub fn raw_samples(&self) -> impl ExactSizeIterator<Item = u16> + 'a {
        u16_samples(self.raw)
    }

    pub fn avg_samples(&self) -> impl ExactSizeIterator<Item = u16> + 'a {
        u16_samples(self.avg)
    }

    /// Store this event as row `row`. Columns missing from `table` are skipped.
    fn store(&self, table: &mut Table, row: usize, packet_id: u32) -> Result<(), PacketError> {
        table.set_if_present("packet_id", row, packet_id)?;
        table.set_if_present("fch_id", row, self.fch_id)?;
        table.set_if_present("timestamp", row, self.timestamp)?;
        if let Some(peak) = &self.peak {
            table.set_if_present("peakHighValue", row, peak.peak_high_value)?;
            table.set_if_present("peakHighIndex", row, peak.peak_high_index)?;
            table.set_if_present("information", row, peak.information)?;
            for (name, sum) in ACC_SUMS.iter().zip(peak.sums) {
                table.set_if_present(name, row, sum)?;
            }
        }
        if let Some([acc7, acc8]) = self.sums_7_8 {
            table.set_if_present("accSum7", row, acc7)?;
            table.set_if_present("accSum8", row, acc8)?;
        }
        if let Some(maw) = &self.maw {
            table.set_if_present("mawMax", row, maw.max)?;
            table.set_if_present("mawBefore", row, maw.before)?;
            table.set_if_present("mawAfter", row, maw.after)?;
        }
        if let Some(energy) = &self.energy {
            table.set_if_present("startEnergy", row, energy.start)?;
            table.set_if_present("maxEnergy", row, energy.max)?;
        }
        write_waveform(table, "waveform", row, self.raw_samples())?;
        write_waveform(table, "auxwaveform", row, self.avg_samples())?;
        Ok(())
    }
}

const ACC_SUMS: [&str; 6] = ["accSum1", "accSum2", "accSum3", "accSum4", "accSum5", "accSum6"];

fn adc(dtype: DType) -> FieldSpec {
    FieldSpec::scalar(dtype).with_attr("units", "adc")
}

/// Output layout of one channel, derived from its configuration.
pub fn channel_schema(config: &ChannelConfig) -> Schema {
    let mut schema = Schema::new()
        .with_field("packet_id", FieldSpec::scalar(DType::U32))
        .with_field("fch_id", FieldSpec::scalar(DType::U32))
        .with_field("timestamp", FieldSpec::scalar(DType::U64).with_attr("units", "clock_ticks"));
    if config.sample_length > 0 {
        schema.insert(
            "waveform",
            FieldSpec::waveform(DType::U16, config.sample_length as usize, config.dt_raw_ns()),
        );
    }
    if config.avg_sample_length > 0 && config.avg_mode > 0 {
        // Averaged samples are historically called the aux waveform.
        schema.insert(
            "auxwaveform",
            FieldSpec::waveform(DType::U16, config.avg_sample_length as usize, config.dt_aux_ns()),
        );
    }
    if config.format_bits & 0x1 != 0 {
        schema.insert("peakHighValue", adc(DType::U32));
        schema.insert("peakHighIndex", adc(DType::U32));
        schema.insert("information", FieldSpec::scalar(DType::U32));
        for name in ACC_SUMS {
            schema.insert(name, adc(DType::U32));
        }
    }
    if config.format_bits & 0x2 != 0 {
        schema.insert("accSum7", adc(DType::U32));
        schema.insert("accSum8", adc(DType::U32));
    }
    if config.format_bits & 0x4 != 0 {
        schema.insert("mawMax", adc(DType::U32));
        schema.insert("mawBefore", adc(DType::U32));
        schema.insert("mawAfter", adc(DType::U32));
    }
    if config.format_bits & 0x8 != 0 {
        schema.insert("startEnergy", adc(DType::U32));
        schema.insert("maxEnergy", adc(DType::U32));
    }
    schema
}

/// Decodes SIS3316 events into per-channel buffers keyed by fch id.
#[derive(Debug)]
pub struct LlamaEventDecoder {
    schemas: BTreeMap<u32, Schema>,
    faults: PacketFaults,
}

impl LlamaEventDecoder {
    /// Build the per-channel schemas once from the header's channel configurations.
    pub fn new(channels: &BTreeMap<u32, ChannelConfig>, faults: PacketFaults) -> Self {
        let schemas = channels
            .iter()
            .map(|(&fch, config)| (fch, channel_schema(config)))
            .collect();
        Self { schemas, faults }
    }

    pub fn fch_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.schemas.keys().copied()
    }
}

impl SchemaSource for LlamaEventDecoder {
    fn name(&self) -> &str {
        EVENT_DECODER_NAME
    }

    /// Channels with identical layouts share a group.
    fn key_groups(&self) -> Vec<Vec<BufferKey>> {
        let mut groups: Vec<(&Schema, Vec<BufferKey>)> = Vec::new();
        for (&fch, schema) in &self.schemas {
            let key = BufferKey::Id(u64::from(fch));
            match groups.iter_mut().find(|(s, _)| *s == schema) {
                Some((_, keys)) => keys.push(key),
                None => groups.push((schema, vec![key])),
            }
        }
        if groups.is_empty() {
            return vec![vec![BufferKey::Any]];
        }
        groups.into_iter().map(|(_, keys)| keys).collect()
    }

    fn schema(&self, key: &BufferKey) -> Result<Schema, SchemaError> {
        let found = match key {
            BufferKey::Any => self.schemas.values().next(),
            BufferKey::Id(fch) => u32::try_from(*fch).ok().and_then(|fch| self.schemas.get(&fch)),
            _ => None,
        };
        match found {
            Some(schema) => Ok(schema.clone()),
            None if self.schemas.is_empty() => Err(SchemaError::SchemaNotBuilt {
                decoder: EVENT_DECODER_NAME.to_string(),
            }),
            None => Err(SchemaError::UnknownKey {
                decoder: EVENT_DECODER_NAME.to_string(),
                key: key.clone(),
            }),
        }
    }
}

impl PacketDecoder<[u8]> for LlamaEventDecoder {
    fn decode_packet(&mut self, packet: &[u8], buffers: &mut RawBufferList, packet_id: u32) -> bool {
        let event = match LlamaEvent::parse(packet) {
            Ok(event) => event,
            Err(e) => {
                let key = packet
                    .get(..4)
                    .and_then(|w| w.try_into().ok())
                    .map_or(BufferKey::Any, |w: [u8; 4]| {
                        BufferKey::Id(u64::from(fch_id_of(u32::from_le_bytes(w))))
                    });
                self.faults.reject(&key, packet_id, packet, &e);
                return false;
            }
        };
        let key = BufferKey::Id(u64::from(event.fch_id));
        let Route::Buffer(buffer) = route(buffers, &key) else {
            self.faults.unrouted(&key);
            return false;
        };
        match write_row(buffer, |table, row| event.store(table, row, packet_id)) {
            Ok(full) => {
                if full {
                    debug!(key = %key, packet_id, "Buffer full");
                }
                full
            }
            Err(e) => {
                self.faults.reject(&key, packet_id, packet, &e);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::words::words_to_bytes;
    use daq_core::{CorruptionPolicy, Scalar};
    use daq_storage::RawBuffer;

    fn config(format_bits: u32) -> ChannelConfig {
        ChannelConfig {
            fadc: 1,
            channel: 0,
            open: true,
            sample_freq: 125.0,
            format_bits,
            sample_length: 4,
            avg_sample_length: 2,
            avg_mode: 1,
            ..Default::default()
        }
    }

    fn word0(format_bits: u32) -> u32 {
        0x0012_0000 | (0x10 << 4) | format_bits
    }

    /// Packet with the given header words, raw sample pairs and optional averaged pairs.
    fn packet(format_bits: u32, groups: &[u32], raw: &[u32], avg: Option<&[u32]>) -> Vec<u8> {
        let mut words = vec![word0(format_bits), 0x3456_789a];
        words.extend_from_slice(groups);
        match avg {
            None => words.push(TAG_NO_AVERAGE | raw.len() as u32),
            Some(avg) => {
                words.push(TAG_AVERAGE | raw.len() as u32);
                words.push(TAG_NO_AVERAGE | (3 << 16) | avg.len() as u32);
            }
        }
        words.extend_from_slice(raw);
        words.extend_from_slice(avg.unwrap_or_default());
        words_to_bytes(&words)
    }

    fn decoder(format_bits: u32) -> (LlamaEventDecoder, RawBufferList) {
        let channels = BTreeMap::from([(16, config(format_bits))]);
        let decoder = LlamaEventDecoder::new(&channels, PacketFaults::new(EVENT_DECODER_NAME, CorruptionPolicy::SkipAndCount));
        let mut list = RawBufferList::new(
            EVENT_DECODER_NAME,
            vec![RawBuffer::new(vec![BufferKey::Id(16)], "", "ch016")],
        )
        .unwrap();
        list.allocate_from(&decoder, 4).unwrap();
        (decoder, list)
    }

    #[test]
    fn test_parse_minimal_event() {
        let bytes = packet(0, &[], &[0x0002_0001, 0x0004_0003], None);
        let event = LlamaEvent::parse(&bytes).unwrap();
        assert_eq!(event.fch_id, 0x10);
        assert_eq!(event.timestamp, 0x0012_3456_789a);
        assert!(event.peak.is_none() && event.maw.is_none() && event.energy.is_none());
        assert_eq!(event.raw_samples().collect::<Vec<_>>(), vec![1, 2, 3, 4]);
        assert_eq!(event.avg_samples().len(), 0);
    }

    #[test]
    fn test_parse_all_groups() {
        let groups = [
            0x0007_0abc, // peak index 7, value 0xabc
            0x5100_0011, // information 0x51, acc1 0x11
            2, 3, 4, 5, 6, // acc2..6
            7, 8, // acc7, acc8
            100, 101, 102, // MAW
            200, 201, // energy
        ];
        let bytes = packet(0xf, &groups, &[0x0002_0001], Some(&[0x0009_0008]));
        let event = LlamaEvent::parse(&bytes).unwrap();
        let peak = event.peak.unwrap();
        assert_eq!(peak.peak_high_value, 0xabc);
        assert_eq!(peak.peak_high_index, 7);
        assert_eq!(peak.information, 0x51);
        assert_eq!(peak.sums, [0x11, 2, 3, 4, 5, 6]);
        assert_eq!(event.sums_7_8, Some([7, 8]));
        assert_eq!(event.maw, Some(Maw { max: 100, before: 101, after: 102 }));
        assert_eq!(event.energy, Some(Energy { start: 200, max: 201 }));
        assert_eq!(event.avg_count_status, Some(3));
        assert_eq!(event.avg_samples().collect::<Vec<_>>(), vec![8, 9]);
    }

    #[test]
    fn test_parse_rejections() {
        let mut words = vec![word0(0), 0, 0x5000_0000];
        assert_eq!(
            LlamaEvent::parse(&words_to_bytes(&words)),
            Err(PacketError::BadTrailerTag { tag: 0x5 })
        );

        words[2] = TAG_AVERAGE;
        words.push(0x1000_0000);
        assert_eq!(
            LlamaEvent::parse(&words_to_bytes(&words)),
            Err(PacketError::BadAverageTag { tag: 0x1 })
        );

        let maw_test = [word0(0), 0, TAG_NO_AVERAGE | MAW_TEST_FLAG];
        assert_eq!(LlamaEvent::parse(&words_to_bytes(&maw_test)), Err(PacketError::MawTestData));

        let short = [word0(0), 0, TAG_NO_AVERAGE | 2, 0];
        assert_eq!(
            LlamaEvent::parse(&words_to_bytes(&short)),
            Err(PacketError::LengthMismatch { expected: 4, actual: 2 })
        );

        let truncated = [word0(0x1), 0, 0];
        assert!(matches!(
            LlamaEvent::parse(&words_to_bytes(&truncated)),
            Err(PacketError::Truncated { .. })
        ));
    }

    #[test]
    fn test_schema_follows_channel_config() {
        let plain = channel_schema(&config(0));
        let names: Vec<&str> = plain.iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["packet_id", "fch_id", "timestamp", "waveform", "auxwaveform"]);
        assert_eq!(plain.get("waveform").unwrap().attr("dt").unwrap().as_f64(), Some(8.0));
        assert_eq!(plain.get("auxwaveform").unwrap().attr("dt").unwrap().as_f64(), Some(32.0));

        let full = channel_schema(&config(0xf));
        for name in ["accSum1", "accSum8", "mawAfter", "maxEnergy", "peakHighIndex"] {
            assert!(full.contains(name), "missing {}", name);
        }

        let mut no_avg = config(0);
        no_avg.avg_mode = 0;
        assert!(!channel_schema(&no_avg).contains("auxwaveform"));
    }

    #[test]
    fn test_decode_selector_zero_and_full() {
        let (mut plain, mut list) = decoder(0);
        assert!(!plain.decode_packet(&packet(0, &[], &[0x0002_0001], None), &mut list, 5));
        let table = list.buffer_for(&BufferKey::Id(16)).unwrap().table.as_ref().unwrap();
        assert_eq!(table.scalar("packet_id", 0).unwrap(), Scalar::UInt(5));
        assert_eq!(table.scalar("timestamp", 0).unwrap(), Scalar::UInt(0x0012_3456_789a));
        assert!(!table.contains("accSum1"));
        assert_eq!(table.waveform("waveform").unwrap().values.row::<u16>(0).unwrap(), &[1, 2, 0, 0]);

        let (mut full, mut list) = decoder(0xf);
        let groups = [0x0007_0abc, 0x5100_0011, 2, 3, 4, 5, 6, 7, 8, 100, 101, 102, 200, 201];
        full.decode_packet(&packet(0xf, &groups, &[0x0002_0001], Some(&[0x0009_0008])), &mut list, 6);
        let table = list.buffer_for(&BufferKey::Id(16)).unwrap().table.as_ref().unwrap();
        assert_eq!(table.scalar("accSum1", 0).unwrap(), Scalar::UInt(0x11));
        assert_eq!(table.scalar("accSum6", 0).unwrap(), Scalar::UInt(6));
        assert_eq!(table.scalar("maxEnergy", 0).unwrap(), Scalar::UInt(201));
        assert_eq!(table.waveform("auxwaveform").unwrap().values.row::<u16>(0).unwrap(), &[8, 9]);
    }

    #[test]
    fn test_bad_packet_leaves_cursor() {
        let (mut decoder, mut list) = decoder(0);
        let bad = words_to_bytes(&[word0(0), 0, 0x5000_0000]);
        assert!(!decoder.decode_packet(&bad, &mut list, 1));
        assert_eq!(list.buffer_for(&BufferKey::Id(16)).unwrap().loc, 0);
        assert_eq!(decoder.faults().rejected(&BufferKey::Id(16)), 1);

        let too_long = packet(0, &[], &[1, 2, 3], None);
        assert!(!decoder.decode_packet(&too_long, &mut list, 2));
        assert_eq!(list.buffer_for(&BufferKey::Id(16)).unwrap().loc, 0);
        assert_eq!(decoder.faults().rejected(&BufferKey::Id(16)), 2);
    }

    #[test]
    fn test_unrouted_channel() {
        let (mut decoder, mut list) = decoder(0);
        let mut bytes = packet(0, &[], &[], None);
        // fch 0x20
        bytes[0] = 0x00;
        bytes[1] = 0x02;
        assert!(!decoder.decode_packet(&bytes, &mut list, 0));
        assert_eq!(decoder.faults().unrouted_count(&BufferKey::Id(0x20)), 1);
    }

    #[test]
    fn test_fill_reports_full() {
        let (mut decoder, mut list) = decoder(0);
        let bytes = packet(0, &[], &[0x0002_0001], None);
        let fulls: Vec<bool> = (0..4).map(|i| decoder.decode_packet(&bytes, &mut list, i)).collect();
        assert_eq!(fulls, vec![false, false, false, true]);
        assert_eq!(list.clear_full(), 1);
        assert_eq!(list.buffer_for(&BufferKey::Id(16)).unwrap().loc, 0);
    }

    #[test]
    fn test_key_groups_share_identical_layouts() {
        let channels = BTreeMap::from([(16, config(0)), (17, config(0)), (18, config(0x1))]);
        let decoder = LlamaEventDecoder::new(&channels, PacketFaults::new(EVENT_DECODER_NAME, CorruptionPolicy::SkipAndCount));
        assert_eq!(
            decoder.key_groups(),
            vec![vec![BufferKey::Id(16), BufferKey::Id(17)], vec![BufferKey::Id(18)]]
        );
        assert!(matches!(
            decoder.schema(&BufferKey::Id(99)),
            Err(SchemaError::UnknownKey { .. })
        ));
    }
}
