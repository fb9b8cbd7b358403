//! FlashCam FCIO streams wrapped in envelope packets.
//!
//! An envelope carries either the configuration of a stream or a data payload
//! holding one or more FCIO records. [`FcDemux`] keeps one reader per stream,
//! steps through the records of each data payload and hands every record to
//! the sub-decoder of its kind:
//!
//! | record                 | decoder               | keys                         |
//! |------------------------|-----------------------|------------------------------|
//! | configuration          | [`FcConfigDecoder`]   | `Any`                        |
//! | status                 | [`FcStatusDecoder`]   | one per card, summary        |
//! | event header           | [`FcEventHeaderDecoder`] | `ChannelKey(stream, 0, 0)`, summary |
//! | event, sparse event    | [`FcEventDecoder`]    | one per trace, summary       |
//! | filter configuration   | [`FspConfigDecoder`]  | summary                      |

pub mod config;
pub mod demux;
pub mod envelope;
pub mod event;
pub mod eventheader;
pub mod fsp;
pub mod fspconfig;
pub mod reader;
pub mod records;
pub mod registry;
pub mod status;
pub mod streamer;

pub use config::{FcConfigDecoder, CONFIG_DECODER_NAME};
pub use demux::{FcDataIds, FcDemux};
pub use envelope::Envelope;
pub use event::{FcEventDecoder, EVENT_DECODER_NAME};
pub use eventheader::{FcEventHeaderDecoder, EVENT_HEADER_DECODER_NAME};
pub use fspconfig::{FspConfigDecoder, FSP_CONFIG_DECODER_NAME};
pub use reader::{RecordReader, ScriptedReader, ScriptedRecord};
pub use records::{FcConfig, FcEvent, FcStatus, FspConfig, FspEvent, FspStatus, RecordTag};
pub use registry::{StreamLayout, StreamRegistry};
pub use status::{FcStatusDecoder, STATUS_DECODER_NAME};
pub use streamer::FcStreamer;

/// Sampling period of FlashCam ADCs.
pub const FC_SAMPLE_DT_NS: f64 = 16.0;

/// One record handed to a sub-decoder.
///
/// `summary` is the online-filter data attached to the record, `raw` the
/// envelope the record came from.
#[derive(Debug)]
pub struct FcRecord<'a, T, S = ()> {
    pub stream_id: u16,
    pub data: &'a T,
    pub summary: Option<&'a S>,
    pub raw: &'a [u8],
}
