// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! The declarative hardware-mapping document and its validated in-memory
//! form.
//!
//! The document is a nested key-value tree: top-level entries are either
//! bookkeeping keys (`backend`, `latency_corrections`,
//! `distortion_corrections`) or named instruments dispatched on their
//! `instrument_type` tag. Everything is validated once, here; later stages
//! consume the typed model and never look at raw JSON again.

use std::collections::HashMap;

use indexmap::IndexMap;
use q1asm::NanoSeconds;
use serde::Deserialize;
use serde_json::Value;

use crate::corrections::{DistortionCorrection, DistortionCorrectionRaw};
use crate::device_traits::InstrumentType;
use crate::schedule::PortClock;
use crate::timing::to_grid_time;
use crate::{Error, Result};

const MIXER_AMP_RATIO_MIN: f64 = 0.5;
const MIXER_AMP_RATIO_MAX: f64 = 2.0;
const MIXER_PHASE_ERROR_MAX_DEG: f64 = 45.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotMode {
    Complex,
    Real,
    Digital,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotDirection {
    Output,
    Input,
}

/// Parsed identity of a physical I/O slot, e.g. `complex_output_0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotId {
    pub mode: SlotMode,
    pub direction: SlotDirection,
    pub index: u8,
}

impl SlotId {
    pub fn parse(name: &str) -> Option<SlotId> {
        let (head, index) = name.rsplit_once('_')?;
        let index: u8 = index.parse().ok()?;
        let (mode, direction) = match head {
            "complex_output" => (SlotMode::Complex, SlotDirection::Output),
            "complex_input" => (SlotMode::Complex, SlotDirection::Input),
            "real_output" => (SlotMode::Real, SlotDirection::Output),
            "real_input" => (SlotMode::Real, SlotDirection::Input),
            "digital_output" => (SlotMode::Digital, SlotDirection::Output),
            _ => return None,
        };
        Some(SlotId {
            mode,
            direction,
            index,
        })
    }

    pub fn name(&self) -> String {
        let head = match (self.mode, self.direction) {
            (SlotMode::Complex, SlotDirection::Output) => "complex_output",
            (SlotMode::Complex, SlotDirection::Input) => "complex_input",
            (SlotMode::Real, SlotDirection::Output) => "real_output",
            (SlotMode::Real, SlotDirection::Input) => "real_input",
            (SlotMode::Digital, _) => "digital_output",
        };
        format!("{head}_{}", self.index)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct PortClockConfigRaw {
    port: String,
    clock: String,
    interm_freq: Option<f64>,
    mixer_amp_ratio: Option<f64>,
    mixer_phase_error_deg: Option<f64>,
    #[serde(default)]
    init_offset_awg_path_0: f64,
    #[serde(default)]
    init_offset_awg_path_1: f64,
    init_gain_awg_path_0: Option<f64>,
    init_gain_awg_path_1: Option<f64>,
    instruction_generated_pulses_enabled: Option<bool>,
}

/// Validated sequencer-level configuration for one port-clock.
#[derive(Debug, Clone, PartialEq)]
pub struct PortClockConfig {
    pub portclock: PortClock,
    pub interm_freq: Option<f64>,
    pub mixer_amp_ratio: f64,
    pub mixer_phase_error_deg: f64,
    pub init_offset_awg_path_0: f64,
    pub init_offset_awg_path_1: f64,
    pub init_gain_awg_path_0: f64,
    pub init_gain_awg_path_1: f64,
    /// Legacy flag, mutually exclusive with stitched pulses on the same
    /// port-clock.
    pub instruction_generated_pulses_enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct SlotConfigRaw {
    lo_name: Option<String>,
    lo_freq: Option<f64>,
    interm_freq: Option<f64>,
    downconverter_freq: Option<f64>,
    mix_lo: Option<bool>,
    #[serde(rename = "dc_mixer_offset_I")]
    dc_mixer_offset_i: Option<f64>,
    #[serde(rename = "dc_mixer_offset_Q")]
    dc_mixer_offset_q: Option<f64>,
    #[serde(rename = "input_gain_I")]
    input_gain_i: Option<i64>,
    #[serde(rename = "input_gain_Q")]
    input_gain_q: Option<i64>,
    input_gain: Option<i64>,
    input_gain_0: Option<i64>,
    input_gain_1: Option<i64>,
    output_att: Option<u32>,
    input_att: Option<u32>,
    #[serde(default)]
    marker_debug_mode_enable: bool,
    #[serde(default)]
    portclock_configs: Vec<PortClockConfigRaw>,
}

/// Validated configuration of one I/O slot.
#[derive(Debug, Clone)]
pub struct OutputSlot {
    pub id: SlotId,
    pub lo_name: Option<String>,
    pub lo_freq: Option<f64>,
    pub interm_freq: Option<f64>,
    pub downconverter_freq: Option<f64>,
    pub mix_lo: bool,
    pub dc_mixer_offset_i: Option<f64>,
    pub dc_mixer_offset_q: Option<f64>,
    pub output_att: Option<u32>,
    pub input_att: Option<u32>,
    pub marker_debug_mode_enable: bool,
    pub portclocks: Vec<PortClockConfig>,
}

#[derive(Debug, Deserialize)]
struct ModuleRaw {
    instrument_type: InstrumentType,
    sequence_to_file: Option<bool>,
    #[serde(flatten)]
    slots: IndexMap<String, Value>,
}

/// Validated configuration of one cluster module.
#[derive(Debug, Clone)]
pub struct ModuleConfig {
    pub name: String,
    pub instrument_type: InstrumentType,
    /// Overrides the cluster-level flag when set.
    pub sequence_to_file: Option<bool>,
    pub slots: Vec<OutputSlot>,
    /// Input gains in dB, merged across slots.
    pub input_gain_0: Option<i64>,
    pub input_gain_1: Option<i64>,
}

impl ModuleConfig {
    /// Declared port-clocks in slot-then-list order. This order defines the
    /// sequencer index assignment.
    pub fn declared_portclocks(&self) -> impl Iterator<Item = (&OutputSlot, &PortClockConfig)> {
        self.slots
            .iter()
            .flat_map(|slot| slot.portclocks.iter().map(move |pc| (slot, pc)))
    }
}

#[derive(Debug, Deserialize)]
struct ClusterRaw {
    #[allow(dead_code)]
    instrument_type: String,
    sequence_to_file: Option<bool>,
    #[serde(flatten)]
    modules: IndexMap<String, Value>,
}

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub name: String,
    /// Whether compiled programs are additionally written to disk.
    pub sequence_to_file: bool,
    pub modules: IndexMap<String, ModuleConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LocalOscillatorRaw {
    #[allow(dead_code)]
    instrument_type: String,
    frequency: Option<f64>,
    power: Option<f64>,
}

/// A named external local oscillator shared by the slots referencing it.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalOscillatorConfig {
    pub name: String,
    pub frequency: Option<f64>,
    pub power: Option<f64>,
}

/// The validated hardware-mapping model. Immutable for the duration of a
/// compilation run.
#[derive(Debug, Clone, Default)]
pub struct HardwareConfig {
    pub clusters: IndexMap<String, ClusterConfig>,
    pub local_oscillators: IndexMap<String, LocalOscillatorConfig>,
    /// Per port-clock program start delays, validated onto the grid.
    pub latency_corrections: HashMap<String, NanoSeconds>,
    pub distortion_corrections: HashMap<String, DistortionCorrection>,
}

impl std::str::FromStr for HardwareConfig {
    type Err = Error;

    fn from_str(document: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(document)
            .map_err(|e| Error::Config(format!("hardware config is not valid JSON: {e}")))?;
        Self::from_value(&value)
    }
}

impl HardwareConfig {
    pub fn from_value(document: &Value) -> Result<Self> {
        let root = document
            .as_object()
            .ok_or_else(|| Error::Config("hardware config root must be an object".to_string()))?;

        let mut config = HardwareConfig::default();

        for (key, entry) in root {
            match key.as_str() {
                "backend" => {
                    // Dispatch trigger for the compilation framework; its
                    // value is not interpreted here.
                }
                "latency_corrections" => {
                    config.latency_corrections = parse_latency_corrections(entry)?;
                }
                "distortion_corrections" => {
                    config.distortion_corrections = parse_distortion_corrections(entry)?;
                }
                name => {
                    let instrument_type = entry
                        .get("instrument_type")
                        .and_then(Value::as_str)
                        .ok_or_else(|| {
                            Error::Config(format!(
                                "instrument '{name}' is missing the 'instrument_type' key"
                            ))
                        })?;
                    match instrument_type {
                        "Cluster" => {
                            let cluster = parse_cluster(name, entry)?;
                            config.clusters.insert(name.to_string(), cluster);
                        }
                        "LocalOscillator" => {
                            let raw: LocalOscillatorRaw =
                                deserialize_entry(name, entry.clone())?;
                            config.local_oscillators.insert(
                                name.to_string(),
                                LocalOscillatorConfig {
                                    name: name.to_string(),
                                    frequency: raw.frequency,
                                    power: raw.power,
                                },
                            );
                        }
                        other => {
                            return Err(Error::Config(format!(
                                "instrument '{name}' has unsupported instrument_type '{other}'; \
                                 modules must be nested inside a Cluster"
                            )));
                        }
                    }
                }
            }
        }

        config.validate_cross_module_uniqueness()?;
        Ok(config)
    }

    /// Cluster-wide uniqueness: the same port-clock pair may not be declared
    /// by two different modules.
    fn validate_cross_module_uniqueness(&self) -> Result<()> {
        let mut owners: HashMap<&PortClock, String> = HashMap::new();
        for cluster in self.clusters.values() {
            for module in cluster.modules.values() {
                for (_, pc) in module.declared_portclocks() {
                    if let Some(first) = owners.get(&pc.portclock) {
                        return Err(Error::AmbiguousPortClock {
                            portclock: pc.portclock.to_string(),
                            first: first.clone(),
                            second: module.name.clone(),
                        });
                    }
                    owners.insert(&pc.portclock, module.name.clone());
                }
            }
        }
        Ok(())
    }

    pub fn local_oscillator(&self, name: &str) -> Option<&LocalOscillatorConfig> {
        self.local_oscillators.get(name)
    }
}

fn deserialize_entry<T: serde::de::DeserializeOwned>(name: &str, value: Value) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|e| Error::Config(format!("invalid configuration of '{name}': {e}")))
}

fn parse_latency_corrections(entry: &Value) -> Result<HashMap<String, NanoSeconds>> {
    let raw: HashMap<String, f64> = deserialize_entry("latency_corrections", entry.clone())?;
    let mut corrections = HashMap::with_capacity(raw.len());
    for (key, delay) in raw {
        // Grid alignment is enforced here, at validation time, never
        // silently rounded later.
        let delay_ns = to_grid_time(delay, &format!("latency correction of '{key}'"))?;
        corrections.insert(key, delay_ns);
    }
    Ok(corrections)
}

fn parse_distortion_corrections(entry: &Value) -> Result<HashMap<String, DistortionCorrection>> {
    let raw: HashMap<String, DistortionCorrectionRaw> =
        deserialize_entry("distortion_corrections", entry.clone())?;
    let mut corrections = HashMap::with_capacity(raw.len());
    for (key, raw_correction) in raw {
        let correction = DistortionCorrection::validate(&key, raw_correction)?;
        corrections.insert(key, correction);
    }
    Ok(corrections)
}

fn parse_cluster(name: &str, entry: &Value) -> Result<ClusterConfig> {
    let raw: ClusterRaw = deserialize_entry(name, entry.clone())?;
    let mut modules = IndexMap::new();
    for (module_name, module_value) in raw.modules {
        if !module_value.is_object() {
            return Err(Error::Config(format!(
                "entry '{module_name}' of cluster '{name}' is not a module definition"
            )));
        }
        let module = parse_module(&module_name, &module_value)?;
        modules.insert(module_name, module);
    }
    Ok(ClusterConfig {
        name: name.to_string(),
        sequence_to_file: raw.sequence_to_file.unwrap_or(true),
        modules,
    })
}

fn parse_module(name: &str, entry: &Value) -> Result<ModuleConfig> {
    let raw: ModuleRaw = deserialize_entry(name, entry.clone())?;
    let traits = raw.instrument_type.traits();

    let mut module = ModuleConfig {
        name: name.to_string(),
        instrument_type: raw.instrument_type,
        sequence_to_file: raw.sequence_to_file,
        slots: Vec::new(),
        input_gain_0: None,
        input_gain_1: None,
    };

    let mut declared: Vec<PortClock> = Vec::new();
    for (slot_name, slot_value) in &raw.slots {
        if !traits.valid_ios.contains(&slot_name.as_str()) {
            return Err(Error::Config(format!(
                "'{slot_name}' of {name} ({}) is not a valid name of an input/output. \
                 Supported names: {:?}",
                raw.instrument_type.as_str(),
                traits.valid_ios
            )));
        }
        let id = SlotId::parse(slot_name).ok_or_else(|| {
            Error::Config(format!("malformed slot name '{slot_name}' of {name}"))
        })?;
        let slot_raw: SlotConfigRaw = deserialize_entry(slot_name, slot_value.clone())?;
        merge_input_gains(&mut module, name, slot_name, &id, &slot_raw)?;
        let slot = validate_slot(name, id, slot_raw, raw.instrument_type)?;
        for pc in &slot.portclocks {
            if declared.contains(&pc.portclock) {
                return Err(Error::Config(format!(
                    "port-clock '{}' is assigned to multiple portclock_configs of {name}. \
                     When using the same port-clock for output and input, assigning only \
                     the output suffices",
                    pc.portclock
                )));
            }
            declared.push(pc.portclock.clone());
        }
        module.slots.push(slot);
    }

    if declared.len() > traits.max_sequencers {
        return Err(Error::TooManySequencers {
            module: name.to_string(),
            count: declared.len(),
            max: traits.max_sequencers,
        });
    }
    Ok(module)
}

fn merge_input_gains(
    module: &mut ModuleConfig,
    module_name: &str,
    slot_name: &str,
    id: &SlotId,
    raw: &SlotConfigRaw,
) -> Result<()> {
    let (gain_0, gain_1) = match id.mode {
        SlotMode::Complex => (raw.input_gain_i, raw.input_gain_q),
        // The scalar `input_gain` form predates the per-path fields.
        SlotMode::Real => match raw.input_gain {
            Some(gain) => (Some(gain), Some(gain)),
            None => (raw.input_gain_0, raw.input_gain_1),
        },
        SlotMode::Digital => (None, None),
    };
    for (field, value, merged) in [
        ("in0_gain", gain_0, &mut module.input_gain_0),
        ("in1_gain", gain_1, &mut module.input_gain_1),
    ] {
        if let Some(value) = value {
            match merged {
                Some(previous) if *previous != value => {
                    return Err(Error::Config(format!(
                        "overwriting gain of {slot_name} of module {module_name} to \
                         {field}: {value}. It was previously set to {field}: {previous}"
                    )));
                }
                _ => *merged = Some(value),
            }
        }
    }
    Ok(())
}

fn validate_slot(
    module_name: &str,
    id: SlotId,
    raw: SlotConfigRaw,
    instrument_type: InstrumentType,
) -> Result<OutputSlot> {
    let traits = instrument_type.traits();
    if traits.is_rf && raw.lo_name.is_some() {
        return Err(Error::Config(format!(
            "'{}' of {module_name}: RF modules use their internal LO; 'lo_name' is not valid",
            id.name()
        )));
    }
    if !traits.is_rf && raw.lo_freq.is_some() {
        return Err(Error::Config(format!(
            "'{}' of {module_name}: 'lo_freq' is only valid on RF modules; \
             use 'lo_name' to reference an external LocalOscillator",
            id.name()
        )));
    }
    for (field, offset) in [
        ("dc_mixer_offset_I", raw.dc_mixer_offset_i),
        ("dc_mixer_offset_Q", raw.dc_mixer_offset_q),
    ] {
        if let Some(offset) = offset
            && offset.abs() > traits.mixer_dc_offset_range
        {
            return Err(Error::Config(format!(
                "'{field}' of '{}' of {module_name} is {offset} V, outside the permitted \
                 range of +-{} V",
                id.name(),
                traits.mixer_dc_offset_range
            )));
        }
    }
    if let Some(freq) = raw.downconverter_freq
        && freq <= 0.0
    {
        return Err(Error::Config(format!(
            "'downconverter_freq' of '{}' of {module_name} must be positive, got {freq:e}",
            id.name()
        )));
    }

    let mut portclocks = Vec::with_capacity(raw.portclock_configs.len());
    for pc_raw in raw.portclock_configs {
        portclocks.push(validate_portclock_config(module_name, &id, pc_raw)?);
    }
    Ok(OutputSlot {
        id,
        lo_name: raw.lo_name,
        lo_freq: raw.lo_freq,
        interm_freq: raw.interm_freq,
        downconverter_freq: raw.downconverter_freq,
        mix_lo: raw.mix_lo.unwrap_or(true),
        dc_mixer_offset_i: raw.dc_mixer_offset_i,
        dc_mixer_offset_q: raw.dc_mixer_offset_q,
        output_att: raw.output_att,
        input_att: raw.input_att,
        marker_debug_mode_enable: raw.marker_debug_mode_enable,
        portclocks,
    })
}

fn validate_portclock_config(
    module_name: &str,
    slot: &SlotId,
    raw: PortClockConfigRaw,
) -> Result<PortClockConfig> {
    let portclock = PortClock::new(raw.port, raw.clock);
    let context = format!("'{portclock}' in '{}' of {module_name}", slot.name());

    let mixer_amp_ratio = raw.mixer_amp_ratio.unwrap_or(1.0);
    if !(MIXER_AMP_RATIO_MIN..=MIXER_AMP_RATIO_MAX).contains(&mixer_amp_ratio) {
        return Err(Error::Config(format!(
            "mixer_amp_ratio of {context} must lie in [{MIXER_AMP_RATIO_MIN}, \
             {MIXER_AMP_RATIO_MAX}], got {mixer_amp_ratio}"
        )));
    }
    let mixer_phase_error_deg = raw.mixer_phase_error_deg.unwrap_or(0.0);
    if mixer_phase_error_deg.abs() > MIXER_PHASE_ERROR_MAX_DEG {
        return Err(Error::Config(format!(
            "mixer_phase_error_deg of {context} must lie in \
             [-{MIXER_PHASE_ERROR_MAX_DEG}, {MIXER_PHASE_ERROR_MAX_DEG}], \
             got {mixer_phase_error_deg}"
        )));
    }
    let init_gain_awg_path_0 = raw.init_gain_awg_path_0.unwrap_or(1.0);
    let init_gain_awg_path_1 = raw.init_gain_awg_path_1.unwrap_or(1.0);
    for (field, value) in [
        ("init_offset_awg_path_0", raw.init_offset_awg_path_0),
        ("init_offset_awg_path_1", raw.init_offset_awg_path_1),
        ("init_gain_awg_path_0", init_gain_awg_path_0),
        ("init_gain_awg_path_1", init_gain_awg_path_1),
    ] {
        if !(-1.0..=1.0).contains(&value) {
            return Err(Error::Config(format!(
                "{field} of {context} must lie in [-1.0, 1.0], got {value}"
            )));
        }
    }
    let instruction_generated_pulses_enabled =
        raw.instruction_generated_pulses_enabled.unwrap_or(false);
    if raw.instruction_generated_pulses_enabled.is_some() {
        log::warn!(
            "support for the instruction_generated_pulses_enabled configuration field \
             is deprecated; long square, ramp and staircase pulses are synthesized \
             from instructions regardless ({context})"
        );
    }
    Ok(PortClockConfig {
        portclock,
        interm_freq: raw.interm_freq,
        mixer_amp_ratio,
        mixer_phase_error_deg,
        init_offset_awg_path_0: raw.init_offset_awg_path_0,
        init_offset_awg_path_1: raw.init_offset_awg_path_1,
        init_gain_awg_path_0,
        init_gain_awg_path_1,
        instruction_generated_pulses_enabled,
    })
}
