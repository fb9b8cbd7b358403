//! Online-filter (FSP) summary tables.
//!
//! Streams with the filter enabled attach an [`FspEvent`] to every event and
//! event header, and an [`FspStatus`] to every status record. Each lands in
//! the buffer keyed `BufferKey::Summary(stream_id)` of the list of the record
//! it came with. The filter's [`FspConfig`] is written once per stream open.

use super::records::{FspConfig, FspEvent, FspStatus};
use crate::decoder::{route, write_row, Route};
use crate::faults::PacketFaults;
use daq_core::limits::MAX_CHANNELS;
use daq_core::{BufferKey, DType, PacketError, Scalar};
use daq_storage::{FieldSpec, RawBufferList, Schema, Table};

const EVENT_FLAGS: [&str; 9] = [
    "is_written",
    "is_extended",
    "is_consecutive",
    "is_hwm_prescaled",
    "is_hwm_multiplicity",
    "is_wps_sum",
    "is_wps_coincident_sum",
    "is_wps_prescaled",
    "is_ct_multiplicity",
];

pub fn fsp_event_schema() -> Schema {
    let mut schema = Schema::new().with_field("packet_id", FieldSpec::scalar(DType::U32));
    for flag in EVENT_FLAGS {
        schema.insert(flag, FieldSpec::scalar(DType::Bool));
    }
    schema
        .with_field("obs_wps_sum_value", FieldSpec::scalar(DType::F32))
        .with_field("obs_wps_sum_offset", FieldSpec::scalar(DType::U16))
        .with_field("obs_wps_sum_multiplicity", FieldSpec::scalar(DType::U16))
        .with_field("obs_wps_max_peak_value", FieldSpec::scalar(DType::F32))
        .with_field("obs_wps_max_peak_offset", FieldSpec::scalar(DType::U16))
        .with_field("obs_hwm_multiplicity", FieldSpec::scalar(DType::U16))
        .with_field("obs_hwm_max_value", FieldSpec::scalar(DType::U16))
        .with_field("obs_hwm_min_value", FieldSpec::scalar(DType::U16))
        .with_field("obs_ct_multiplicity", FieldSpec::scalar(DType::U32))
        .with_field("obs_ct_trace_idx", FieldSpec::ragged(DType::U16, Some(MAX_CHANNELS)))
        .with_field("obs_ct_max", FieldSpec::ragged(DType::U16, Some(MAX_CHANNELS)))
        .with_field("obs_evt_nconsecutive", FieldSpec::scalar(DType::I32))
}

pub fn store_fsp_event(table: &mut Table, row: usize, packet_id: u32, fsp: &FspEvent) -> Result<(), PacketError> {
    table.set("packet_id", row, packet_id)?;
    let flags = [
        fsp.is_written,
        fsp.is_extended,
        fsp.is_consecutive,
        fsp.is_hwm_prescaled,
        fsp.is_hwm_multiplicity,
        fsp.is_wps_sum,
        fsp.is_wps_coincident_sum,
        fsp.is_wps_prescaled,
        fsp.is_ct_multiplicity,
    ];
    for (name, value) in EVENT_FLAGS.iter().zip(flags) {
        table.set_if_present(name, row, value)?;
    }
    table.set_if_present("obs_wps_sum_value", row, fsp.obs_wps_sum_value)?;
    table.set_if_present("obs_wps_sum_offset", row, fsp.obs_wps_sum_offset)?;
    table.set_if_present("obs_wps_sum_multiplicity", row, fsp.obs_wps_sum_multiplicity)?;
    table.set_if_present("obs_wps_max_peak_value", row, fsp.obs_wps_max_peak_value)?;
    table.set_if_present("obs_wps_max_peak_offset", row, fsp.obs_wps_max_peak_offset)?;
    table.set_if_present("obs_hwm_multiplicity", row, fsp.obs_hwm_multiplicity)?;
    table.set_if_present("obs_hwm_max_value", row, fsp.obs_hwm_max_value)?;
    table.set_if_present("obs_hwm_min_value", row, fsp.obs_hwm_min_value)?;
    table.set_if_present("obs_evt_nconsecutive", row, fsp.obs_evt_nconsecutive)?;
    table.set_if_present("obs_ct_multiplicity", row, fsp.obs_ct_multiplicity)?;

    // Ragged rows hold only the entries the multiplicity marks valid.
    let n_ct = (fsp.obs_ct_multiplicity as usize)
        .min(fsp.obs_ct_trace_idx.len())
        .min(fsp.obs_ct_max.len());
    if table.contains("obs_ct_trace_idx") {
        table
            .ragged_mut("obs_ct_trace_idx")?
            .set_row(row, fsp.obs_ct_trace_idx[..n_ct].iter().copied())?;
    }
    if table.contains("obs_ct_max") {
        table.ragged_mut("obs_ct_max")?.set_row(row, fsp.obs_ct_max[..n_ct].iter().copied())?;
    }
    Ok(())
}

/// Write `fsp` as the next row of `key`'s buffer.
///
/// Returns whether that buffer is now full. A missing buffer is counted as
/// unrouted, a failed write rejects the packet.
pub(crate) fn write_fsp_event(
    faults: &mut PacketFaults,
    buffers: &mut RawBufferList,
    key: &BufferKey,
    packet_id: u32,
    raw: &[u8],
    fsp: &FspEvent,
) -> bool {
    let Route::Buffer(buffer) = route(buffers, key) else {
        faults.unrouted(key);
        return false;
    };
    match write_row(buffer, |table, row| store_fsp_event(table, row, packet_id, fsp)) {
        Ok(full) => full,
        Err(e) => {
            faults.reject(key, packet_id, raw, &e);
            false
        }
    }
}

const STATUS_F64: [&str; 4] = ["start_time", "log_time", "dt_logtime", "runtime"];
const STATUS_I32: [&str; 6] = [
    "n_read_events",
    "n_written_events",
    "n_discarded_events",
    "dt_n_read_events",
    "dt_n_written_events",
    "dt_n_discarded_events",
];
const STATUS_RATES: [&str; 7] = [
    "dt",
    "dt_rate_read_events",
    "dt_rate_write_events",
    "dt_rate_discard_events",
    "avg_rate_read_events",
    "avg_rate_write_events",
    "avg_rate_discard_events",
];

pub fn fsp_status_schema() -> Schema {
    let mut schema = Schema::new().with_field("packet_id", FieldSpec::scalar(DType::U32));
    for name in STATUS_F64 {
        schema.insert(name, FieldSpec::scalar(DType::F64).with_attr("units", "s"));
    }
    for name in STATUS_I32 {
        schema.insert(name, FieldSpec::scalar(DType::I32));
    }
    for name in STATUS_RATES {
        schema.insert(name, FieldSpec::scalar(DType::F64));
    }
    schema
}

pub fn store_fsp_status(table: &mut Table, row: usize, packet_id: u32, fsp: &FspStatus) -> Result<(), PacketError> {
    table.set("packet_id", row, packet_id)?;
    let times = [fsp.start_time, fsp.log_time, fsp.dt_logtime, fsp.runtime];
    for (name, value) in STATUS_F64.iter().zip(times) {
        table.set_if_present(name, row, value)?;
    }
    let counts = [
        fsp.n_read_events,
        fsp.n_written_events,
        fsp.n_discarded_events,
        fsp.dt_n_read_events,
        fsp.dt_n_written_events,
        fsp.dt_n_discarded_events,
    ];
    for (name, value) in STATUS_I32.iter().zip(counts) {
        table.set_if_present(name, row, value)?;
    }
    let rates = [
        fsp.dt,
        fsp.dt_rate_read_events,
        fsp.dt_rate_write_events,
        fsp.dt_rate_discard_events,
        fsp.avg_rate_read_events,
        fsp.avg_rate_write_events,
        fsp.avg_rate_discard_events,
    ];
    for (name, value) in STATUS_RATES.iter().zip(rates) {
        table.set_if_present(name, row, value)?;
    }
    Ok(())
}

// =============================================================================
// Filter configuration
// =============================================================================

const CONFIG_I32: [&str; 10] = [
    "buffer_max_states",
    "trg_hwm_min_multiplicity",
    "trg_hwm_prescale_ratio",
    "trg_wps_prescale_ratio",
    "dsp_wps_dsp_max_margin_front",
    "dsp_wps_dsp_max_margin_back",
    "dsp_wps_apply_gain_scaling",
    "dsp_wps_sum_window_size",
    "dsp_wps_sum_window_start_sample",
    "dsp_wps_sum_window_stop_sample",
];
const CONFIG_I64: [&str; 8] = [
    "buffer_window_nsec",
    "trg_wps_ref_flags_hwm",
    "trg_wps_ref_flags_ct",
    "trg_wps_ref_flags_wps",
    "trg_enabled_write_flags_trigger",
    "trg_enabled_write_flags_event",
    "trg_pre_trigger_window_nsec",
    "trg_post_trigger_window_nsec",
];
const CONFIG_F32: [&str; 5] = [
    "trg_wps_coincident_sum_threshold",
    "trg_wps_sum_threshold",
    "trg_wps_prescale_rate",
    "trg_hwm_prescale_rate",
    "dsp_wps_sub_event_sum_threshold",
];
const STAGES: [&str; 3] = ["wps", "hwm", "ct"];
const WPS_I32_LISTS: [&str; 6] = [
    "dsp_wps_shaping_widths",
    "dsp_wps_margin_front",
    "dsp_wps_margin_back",
    "dsp_wps_start_sample",
    "dsp_wps_stop_sample",
    "trg_wps_ref_map_idx",
];
const WPS_F32_LISTS: [&str; 3] = ["dsp_wps_gains", "dsp_wps_thresholds", "dsp_wps_lowpass"];

/// One row per stream; per-trace settings are ragged, sized by `n_traces`.
pub fn fsp_config_schema(n_traces: usize) -> Schema {
    let guess = Some(n_traces.max(1));
    let mut schema = Schema::new()
        .with_field("packet_id", FieldSpec::scalar(DType::U32))
        .with_field("fcid", FieldSpec::scalar(DType::U16));
    for name in CONFIG_I32 {
        schema.insert(name, FieldSpec::scalar(DType::I32));
    }
    for name in CONFIG_I64 {
        let spec = FieldSpec::scalar(DType::I64);
        let spec = if name.ends_with("_nsec") { spec.with_attr("units", "ns") } else { spec };
        schema.insert(name, spec);
    }
    for name in CONFIG_F32 {
        schema.insert(name, FieldSpec::scalar(DType::F32));
    }
    for stage in STAGES {
        schema.insert(format!("dsp_{}_tracemap_format", stage), FieldSpec::scalar(DType::I32));
        schema.insert(format!("dsp_{}_tracemap_indices", stage), FieldSpec::ragged(DType::I32, guess));
        schema.insert(format!("dsp_{}_tracemap_enabled", stage), FieldSpec::ragged(DType::I32, guess));
    }
    for name in WPS_I32_LISTS {
        schema.insert(name, FieldSpec::ragged(DType::I32, guess));
    }
    for name in WPS_F32_LISTS {
        schema.insert(name, FieldSpec::ragged(DType::F32, guess));
    }
    schema
        .with_field("dsp_hwm_fpga_energy_threshold_adc", FieldSpec::ragged(DType::U16, guess))
        .with_field("dsp_ct_thresholds", FieldSpec::ragged(DType::U16, guess))
}

fn set_list<T>(table: &mut Table, name: &str, row: usize, values: &[T]) -> Result<(), PacketError>
where
    T: Copy + Into<Scalar>,
{
    if table.contains(name) {
        table.ragged_mut(name)?.set_row(row, values.iter().copied())?;
    }
    Ok(())
}

pub fn store_fsp_config(
    table: &mut Table,
    row: usize,
    packet_id: u32,
    stream_id: u16,
    fsp: &FspConfig,
) -> Result<(), PacketError> {
    let (trg, wps) = (&fsp.trigger, &fsp.wps);
    table.set("packet_id", row, packet_id)?;
    table.set_if_present("fcid", row, stream_id)?;

    let ints = [
        fsp.buffer_max_states,
        trg.hwm_min_multiplicity,
        trg.hwm_prescale_ratio,
        trg.wps_prescale_ratio,
        wps.max_margin_front,
        wps.max_margin_back,
        wps.apply_gain_scaling,
        wps.sum_window_size,
        wps.sum_window_start_sample,
        wps.sum_window_stop_sample,
    ];
    for (name, value) in CONFIG_I32.iter().zip(ints) {
        table.set_if_present(name, row, value)?;
    }
    let longs = [
        fsp.buffer_window.as_nanos(),
        trg.wps_ref_flags_hwm,
        trg.wps_ref_flags_ct,
        trg.wps_ref_flags_wps,
        trg.enabled_flags_trigger,
        trg.enabled_flags_event,
        trg.pre_trigger_window.as_nanos(),
        trg.post_trigger_window.as_nanos(),
    ];
    for (name, value) in CONFIG_I64.iter().zip(longs) {
        table.set_if_present(name, row, value)?;
    }
    let floats = [
        trg.wps_coincident_sum_threshold,
        trg.wps_sum_threshold,
        trg.wps_prescale_rate,
        trg.hwm_prescale_rate,
        wps.sub_event_sum_threshold,
    ];
    for (name, value) in CONFIG_F32.iter().zip(floats) {
        table.set_if_present(name, row, value)?;
    }

    for (stage, map) in STAGES.iter().zip([&wps.tracemap, &fsp.hwm.tracemap, &fsp.ct.tracemap]) {
        table.set_if_present(&format!("dsp_{}_tracemap_format", stage), row, map.format)?;
        set_list(table, &format!("dsp_{}_tracemap_indices", stage), row, &map.map)?;
        set_list(table, &format!("dsp_{}_tracemap_enabled", stage), row, &map.enabled)?;
    }
    let int_lists = [
        &wps.shaping_widths,
        &wps.margin_front,
        &wps.margin_back,
        &wps.start_sample,
        &wps.stop_sample,
        &trg.wps_ref_map_idx,
    ];
    for (name, values) in WPS_I32_LISTS.iter().zip(int_lists) {
        set_list(table, name, row, values)?;
    }
    for (name, values) in WPS_F32_LISTS.iter().zip([&wps.gains, &wps.thresholds, &wps.lowpass]) {
        set_list(table, name, row, values)?;
    }
    set_list(table, "dsp_hwm_fpga_energy_threshold_adc", row, &fsp.hwm.fpga_energy_threshold_adc)?;
    set_list(table, "dsp_ct_thresholds", row, &fsp.ct.thresholds)
}
