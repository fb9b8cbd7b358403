//! A llamaDAQ file decoded through a buffer library loaded from a config file.

use daq_core::{BufferKey, ChunkMode, DecodeSettings, Scalar};
use daq_decoders::llama::{ChannelConfig, LlamaHeader, Version, EVENT_DECODER_NAME, HEADER_DECODER_NAME};
use daq_decoders::words::words_to_bytes;
use daq_decoders::{ChunkedStream, LlamaStreamer, PacketDecoder, PacketSource};
use daq_storage::{
    build_library, load_library_config, Keywords, MemoryStore, RawBuffer, RawBufferLibrary, RawBufferList,
};
use std::io::{Cursor, Write};

const RAW_WORDS: u32 = 2;
/// Words added by format bits 0 to 3.
const FULL_FORMAT_WORDS: u32 = 7 + 2 + 3 + 2;

fn channel(channel: u32, format_bits: u32) -> ChannelConfig {
    let groups = if format_bits == 0xf { FULL_FORMAT_WORDS } else { 0 };
    ChannelConfig {
        fadc: 1,
        channel,
        open: true,
        sample_freq: 125.0,
        format_bits,
        sample_length: 2 * RAW_WORDS,
        event_length: 2 + groups + 1 + RAW_WORDS,
        ..Default::default()
    }
}

fn header() -> LlamaHeader {
    LlamaHeader::new(
        Version {
            major: 1,
            minor: 2,
            patch: 0,
        },
        [channel(0, 0xf), channel(1, 0)],
    )
}

fn full_event(timestamp: u32) -> Vec<u32> {
    let mut words = vec![(16 << 4) | 0xf, timestamp];
    // peak index 3, value 500; information 2, accumulator 1 = 10
    words.extend([(3 << 16) | 500, (2 << 24) | 10, 20, 30, 40, 50, 60]);
    words.extend([70, 80]);
    words.extend([900, 100, 200]);
    words.extend([11, 12]);
    words.push(0xe000_0000 | RAW_WORDS);
    words.extend([0x0002_0001, 0x0004_0003]);
    words
}

fn bare_event(timestamp: u32) -> Vec<u32> {
    vec![17 << 4, timestamp, 0xe000_0000 | RAW_WORDS, 0x0006_0005, 0x0008_0007]
}

fn file() -> Vec<u8> {
    let mut bytes = header().encode();
    for event in [full_event(100), bare_event(101), full_event(102)] {
        bytes.extend(words_to_bytes(&event));
    }
    bytes
}

fn library_from_file() -> RawBufferLibrary {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("buffers.toml");
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(
        file,
        r#"
[llama_event."ch{{key:0>3}}"]
key_list = ["*"]
out_stream = "{{file_key}}.lh5:/ch{{key}}"

["*"."{{name}}"]
key_list = ["*"]
out_stream = "{{file_key}}_{{name}}.lh5"
"#
    )
    .unwrap();
    let config = load_library_config(&path).unwrap();
    let keywords = Keywords::from([("file_key".to_string(), "run7".to_string())]);
    build_library(&config, &keywords).unwrap()
}

#[test]
fn test_events_route_to_channel_buffers() {
    let mut library = library_from_file();
    let settings = DecodeSettings {
        buffer_size: 4,
        ..Default::default()
    };
    let streamer = LlamaStreamer::open(Cursor::new(file()), &mut library, &settings).unwrap();

    let events = library.get(EVENT_DECODER_NAME).unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events.buffer_for(&BufferKey::Id(16)).unwrap().out_name, "ch016");
    let header_list = library.get(HEADER_DECODER_NAME).unwrap();
    assert_eq!(header_list.name(), HEADER_DECODER_NAME);
    assert_eq!(header_list.buffer_for(&BufferKey::Any).unwrap().loc, 2);

    let mut stream = ChunkedStream::new(streamer, library, ChunkMode::AnyFull);
    let mut store = MemoryStore::new();
    let stats = stream.run(&mut store).unwrap();
    assert_eq!(stats.packets, 3);

    assert_eq!(store.rows_written("run7.lh5", "ch016"), 2);
    assert_eq!(store.rows_written("run7.lh5", "ch017"), 1);
    assert_eq!(store.rows_written("run7_llama_header.lh5", "llama_header"), 2);

    let ch16 = store.writes.iter().find(|w| w.name == "ch016").unwrap();
    assert_eq!(ch16.group, "/ch16");
    assert_eq!(ch16.table.scalar("timestamp", 1).unwrap(), Scalar::UInt(102));
    assert_eq!(ch16.table.scalar("peakHighValue", 0).unwrap(), Scalar::UInt(500));
    assert_eq!(ch16.table.scalar("peakHighIndex", 0).unwrap(), Scalar::UInt(3));
    assert_eq!(ch16.table.scalar("information", 0).unwrap(), Scalar::UInt(2));
    assert_eq!(ch16.table.scalar("accSum1", 0).unwrap(), Scalar::UInt(10));
    assert_eq!(ch16.table.scalar("accSum8", 0).unwrap(), Scalar::UInt(80));
    assert_eq!(ch16.table.scalar("mawMax", 0).unwrap(), Scalar::UInt(900));
    assert_eq!(ch16.table.scalar("maxEnergy", 0).unwrap(), Scalar::UInt(12));

    let ch17 = store.writes.iter().find(|w| w.name == "ch017").unwrap();
    assert!(!ch17.table.contains("mawMax"));
    assert_eq!(
        ch17.table.waveform("waveform").unwrap().values.row::<u16>(0).unwrap(),
        &[5, 6, 7, 8]
    );
    assert_eq!(stream.source().event_decoder().faults().total_rejected(), 0);
}

#[test]
fn test_buffer_for_absent_channel_stays_unallocated() {
    let mut library = library_from_file();
    // A list of its own, naming a channel the file does not have.
    library.insert(
        RawBufferList::new(
            EVENT_DECODER_NAME,
            vec![
                RawBuffer::new(vec![BufferKey::Id(16)], "run7.lh5", "ch016"),
                RawBuffer::new(vec![BufferKey::Id(99)], "run7.lh5", "ch099"),
            ],
        )
        .unwrap(),
    );
    let settings = DecodeSettings {
        buffer_size: 4,
        ..Default::default()
    };
    let mut streamer = LlamaStreamer::open(Cursor::new(file()), &mut library, &settings).unwrap();
    while streamer.read_packet(&mut library).unwrap() {}

    let events = library.get(EVENT_DECODER_NAME).unwrap();
    assert!(events.buffer_for(&BufferKey::Id(99)).unwrap().table.is_none());
    assert_eq!(events.buffer_for(&BufferKey::Id(16)).unwrap().loc, 2);
    assert_eq!(streamer.event_decoder().faults().unrouted_count(&BufferKey::Id(17)), 1);
}
