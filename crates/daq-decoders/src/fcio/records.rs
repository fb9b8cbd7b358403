//! Record values produced by a [`RecordReader`](super::reader::RecordReader).
//!
//! These mirror what an FCIO reader exposes after each `next_record` call:
//! the stream configuration, card status, events with their traces and the
//! online-filter (FSP) results that may accompany events and status.

use serde::{Deserialize, Serialize};

/// Kind of the record a reader is positioned on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordTag {
    Config,
    Status,
    EventHeader,
    Event,
    SparseEvent,
    /// Any record the decoders do not handle.
    Other(u32),
}

/// Stream configuration, sent once when a stream starts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FcConfig {
    pub stream_id: u32,
    pub adcs: u32,
    pub triggers: u32,
    /// Samples per trace.
    pub eventsamples: u32,
    pub adcbits: u32,
    pub sumlength: u32,
    pub blprecision: u32,
    pub mastercards: u32,
    pub triggercards: u32,
    pub adccards: u32,
    pub gps: u32,
    /// One entry per trace index: `card_address << 16 | input`.
    pub tracemap: Vec<u32>,
    #[serde(default)]
    pub fsp_enabled: bool,
    /// Online-filter setup, present when the filter runs on this stream.
    #[serde(default)]
    pub fsp: Option<FspConfig>,
}

impl FcConfig {
    pub fn n_cards(&self) -> u32 {
        self.mastercards + self.triggercards + self.adccards
    }
}

/// Hardware time as pulse-per-second count plus clock ticks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FcTimestamp {
    pub pps: i32,
    pub ticks: i32,
    pub max_ticks: i32,
}

impl FcTimestamp {
    pub fn seconds(&self) -> f64 {
        f64::from(self.pps) + f64::from(self.ticks) / (f64::from(self.max_ticks) + 1.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FcTrace {
    /// Position in the stream's trace map.
    pub index: u16,
    pub baseline: u16,
    pub daq_energy: u16,
    #[serde(default)]
    pub samples: Vec<u16>,
}

/// An event, or an event header when the traces carry no samples.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FcEvent {
    pub event_type: i32,
    pub event_number: i32,
    pub timestamp: FcTimestamp,
    /// Seconds since the start of the run.
    pub run_time: f64,
    /// Accumulated dead time in seconds.
    pub deadtime: f64,
    pub traces: Vec<FcTrace>,
}

/// Status of one card.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FcCardStatus {
    pub reqid: u16,
    pub status: i32,
    pub event_number: i32,
    pub timestamp: FcTimestamp,
    pub total_errors: u32,
    pub env_errors: u32,
    pub cti_errors: u32,
    pub link_errors: u32,
    pub other_errors: Vec<u32>,
    /// Temperatures, voltages and currents, in card-specific order.
    pub environment: Vec<i32>,
    pub cti_links: Vec<u32>,
    pub link_states: Vec<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FcStatus {
    pub status: i32,
    pub fpga_time: f64,
    pub server_time: f64,
    pub fpga_start_time: f64,
    pub cards: Vec<FcCardStatus>,
}

/// Online-filter decision for one event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FspEvent {
    pub is_written: bool,
    pub is_extended: bool,
    pub is_consecutive: bool,
    pub is_hwm_prescaled: bool,
    pub is_hwm_multiplicity: bool,
    pub is_wps_sum: bool,
    pub is_wps_coincident_sum: bool,
    pub is_wps_prescaled: bool,
    pub is_ct_multiplicity: bool,
    pub obs_wps_sum_value: f32,
    pub obs_wps_sum_offset: u16,
    pub obs_wps_sum_multiplicity: u16,
    pub obs_wps_max_peak_value: f32,
    pub obs_wps_max_peak_offset: u16,
    pub obs_hwm_multiplicity: u16,
    pub obs_hwm_max_value: u16,
    pub obs_hwm_min_value: u16,
    /// Channels over threshold, as reported by the filter.
    pub obs_ct_multiplicity: u32,
    /// The first `obs_ct_multiplicity` entries are valid.
    pub obs_ct_trace_idx: Vec<u16>,
    pub obs_ct_max: Vec<u16>,
    pub obs_evt_nconsecutive: i32,
}

/// Seconds plus nanoseconds, as the filter configures its time windows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FspDuration {
    pub seconds: i64,
    pub nanoseconds: i64,
}

impl FspDuration {
    pub fn as_nanos(&self) -> i64 {
        self.seconds * 1_000_000_000 + self.nanoseconds
    }
}

/// Traces one filter stage looks at.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FspTraceMap {
    pub format: i32,
    /// Mapped trace indices.
    pub map: Vec<i32>,
    pub enabled: Vec<i32>,
}

/// Windowed peak sum stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FspWpsConfig {
    pub tracemap: FspTraceMap,
    pub gains: Vec<f32>,
    pub thresholds: Vec<f32>,
    pub lowpass: Vec<f32>,
    pub shaping_widths: Vec<i32>,
    pub margin_front: Vec<i32>,
    pub margin_back: Vec<i32>,
    pub start_sample: Vec<i32>,
    pub stop_sample: Vec<i32>,
    pub max_margin_front: i32,
    pub max_margin_back: i32,
    pub apply_gain_scaling: i32,
    pub sum_window_size: i32,
    pub sum_window_start_sample: i32,
    pub sum_window_stop_sample: i32,
    pub sub_event_sum_threshold: f32,
}

/// Hardware majority stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FspHwmConfig {
    pub tracemap: FspTraceMap,
    pub fpga_energy_threshold_adc: Vec<u16>,
}

/// Channel threshold stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FspCtConfig {
    pub tracemap: FspTraceMap,
    pub thresholds: Vec<u16>,
}

/// Trigger logic combining the stages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FspTriggerConfig {
    pub hwm_min_multiplicity: i32,
    pub hwm_prescale_ratio: i32,
    pub wps_prescale_ratio: i32,
    pub wps_coincident_sum_threshold: f32,
    pub wps_sum_threshold: f32,
    pub wps_prescale_rate: f32,
    pub hwm_prescale_rate: f32,
    pub wps_ref_flags_hwm: i64,
    pub wps_ref_flags_ct: i64,
    pub wps_ref_flags_wps: i64,
    pub wps_ref_map_idx: Vec<i32>,
    pub enabled_flags_trigger: i64,
    pub enabled_flags_event: i64,
    pub pre_trigger_window: FspDuration,
    pub post_trigger_window: FspDuration,
}

/// Online-filter configuration of a stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FspConfig {
    pub buffer_max_states: i32,
    pub buffer_window: FspDuration,
    pub trigger: FspTriggerConfig,
    pub wps: FspWpsConfig,
    pub hwm: FspHwmConfig,
    pub ct: FspCtConfig,
}

/// Online-filter throughput counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FspStatus {
    pub start_time: f64,
    pub log_time: f64,
    pub dt_logtime: f64,
    pub runtime: f64,
    pub n_read_events: i32,
    pub n_written_events: i32,
    pub n_discarded_events: i32,
    pub dt_n_read_events: i32,
    pub dt_n_written_events: i32,
    pub dt_n_discarded_events: i32,
    pub dt: f64,
    pub dt_rate_read_events: f64,
    pub dt_rate_write_events: f64,
    pub dt_rate_discard_events: f64,
    pub avg_rate_read_events: f64,
    pub avg_rate_write_events: f64,
    pub avg_rate_discard_events: f64,
}
