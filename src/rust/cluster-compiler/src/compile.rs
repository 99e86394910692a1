// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! The compilation entry point: schedule plus hardware config in, one
//! program artifact per used sequencer out.
//!
//! Allocation and the cross-slot LO consistency pass are global and run
//! first; everything after that is per sequencer and independent.

use std::collections::HashMap;
use std::path::PathBuf;

use indexmap::IndexMap;
use q1asm::program::Program;

use crate::allocator::{self, AllocatedSequencer};
use crate::corrections::{FilterRegistry, correct_waveform};
use crate::emitter::{self, SequencerArtifact, SequencerSettings};
use crate::frequency::{self, Frequencies, LoFrequencyRegistry, ResolvedFrequencies};
use crate::generator;
use crate::hardware_config::HardwareConfig;
use crate::schedule::{PortClock, Schedule};
use crate::timeline;
use crate::{Error, Result};

/// Programmatic post-processing of one sequencer's generated program,
/// applied before the artifact is built. Hooks cannot be expressed in the
/// declarative config document, so they are injected here, keyed by
/// port-clock.
pub trait ProgramHook: Send + Sync {
    fn apply(&self, program: &mut Program) -> Result<()>;
}

pub struct CompileOptions {
    /// Where artifacts are written when file output is enabled. `None`
    /// disables file output regardless of the config flags.
    pub output_dir: Option<PathBuf>,
    pub filter_registry: FilterRegistry,
    /// Hooks keyed by `"<port>-<clock>"`.
    pub program_hooks: HashMap<String, Box<dyn ProgramHook>>,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            output_dir: None,
            filter_registry: FilterRegistry::with_builtins(),
            program_hooks: HashMap::new(),
        }
    }
}

#[derive(Debug)]
pub struct CompiledSequencer {
    pub portclock: PortClock,
    pub module: String,
    pub seq_index: usize,
    pub frequencies: ResolvedFrequencies,
    pub artifact: SequencerArtifact,
    pub artifact_path: Option<PathBuf>,
    /// Per-slot analog settings for the driver layer.
    pub output_att: Option<u32>,
    pub input_att: Option<u32>,
    pub dc_mixer_offset_i: Option<f64>,
    pub dc_mixer_offset_q: Option<f64>,
}

/// Settings for one external LO, resolved across all referencing slots.
#[derive(Debug, Clone, PartialEq)]
pub struct LoSettings {
    pub frequency: f64,
    pub power: Option<f64>,
}

/// Input gain settings of one module, in dB.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModuleSettings {
    pub input_gain_0: Option<i64>,
    pub input_gain_1: Option<i64>,
}

#[derive(Debug)]
pub struct CompilationOutput {
    pub schedule_name: String,
    pub sequencers: Vec<CompiledSequencer>,
    pub local_oscillators: IndexMap<String, LoSettings>,
    pub modules: IndexMap<String, ModuleSettings>,
}

pub fn compile(
    schedule: &Schedule,
    config: &HardwareConfig,
    options: &CompileOptions,
) -> Result<CompilationOutput> {
    let used = schedule.used_portclocks();
    let allocations = allocator::allocate(&used, config)?;

    // The LO consistency pass needs every sequencer's resolution before any
    // program is finalized.
    let mut lo_registry = LoFrequencyRegistry::new();
    let mut internal_lo_registry = LoFrequencyRegistry::new();
    let mut resolved = Vec::with_capacity(allocations.len());
    for allocation in &allocations {
        let frequencies = resolve_sequencer(
            allocation,
            schedule,
            config,
            &mut lo_registry,
            &mut internal_lo_registry,
        )?;
        resolved.push(frequencies);
    }

    let mut sequencers = Vec::with_capacity(allocations.len());
    for (allocation, frequencies) in allocations.iter().zip(resolved) {
        let sequencer = compile_sequencer(allocation, frequencies, schedule, config, options)?;
        sequencers.push(sequencer);
    }

    let mut local_oscillators = IndexMap::new();
    for (name, lo) in &config.local_oscillators {
        let frequency = lo_registry.get(name).or(lo.frequency);
        if let Some(frequency) = frequency {
            local_oscillators.insert(
                name.clone(),
                LoSettings {
                    frequency,
                    power: lo.power,
                },
            );
        }
    }

    let mut modules = IndexMap::new();
    for allocation in &allocations {
        for cluster in config.clusters.values() {
            if let Some(module) = cluster.modules.get(&allocation.module) {
                modules.insert(
                    allocation.module.clone(),
                    ModuleSettings {
                        input_gain_0: module.input_gain_0,
                        input_gain_1: module.input_gain_1,
                    },
                );
            }
        }
    }

    Ok(CompilationOutput {
        schedule_name: schedule.name.clone(),
        sequencers,
        local_oscillators,
        modules,
    })
}

fn resolve_sequencer(
    allocation: &AllocatedSequencer,
    schedule: &Schedule,
    config: &HardwareConfig,
    lo_registry: &mut LoFrequencyRegistry,
    internal_lo_registry: &mut LoFrequencyRegistry,
) -> Result<ResolvedFrequencies> {
    let portclock = allocation.portclock.to_string();
    let clock = schedule
        .clock_frequency(&allocation.portclock.clock)
        .ok_or_else(|| Error::UnresolvedFrequency {
            portclock: portclock.clone(),
            reason: format!(
                "the schedule defines no clock resource named '{}'",
                allocation.portclock.clock
            ),
        })?;
    let traits = allocation.instrument_type.traits();
    let slot = &allocation.slot;

    // An RF output has one internal LO; all sequencers driving the same
    // slot of the same module must agree on its frequency.
    let internal_lo = format!("{}.{}", allocation.module, slot.id.name());
    let lo = if traits.is_rf {
        slot.lo_freq
            .or_else(|| internal_lo_registry.get(&internal_lo))
    } else if let Some(lo_name) = &slot.lo_name {
        let lo = config.local_oscillator(lo_name).ok_or_else(|| {
            Error::Config(format!(
                "'{}' of {} references unknown LocalOscillator '{lo_name}'",
                slot.id.name(),
                allocation.module
            ))
        })?;
        lo.frequency.or_else(|| lo_registry.get(lo_name))
    } else {
        None
    };
    let interm = match (allocation.config.interm_freq, slot.interm_freq) {
        (Some(portclock_if), Some(slot_if)) if !frequency::is_close(portclock_if, slot_if) => {
            return Err(Error::FrequencyConflict {
                portclock,
                reason: format!(
                    "interm_freq is {portclock_if:e} at the port-clock level but \
                     {slot_if:e} at the slot level"
                ),
            });
        }
        (portclock_if, slot_if) => portclock_if.or(slot_if),
    };

    let frequencies = frequency::resolve(
        &portclock,
        Frequencies { clock, lo, interm },
        slot.downconverter_freq,
        slot.mix_lo,
        traits.is_rf,
        slot.lo_name.is_some(),
    )?;
    if traits.is_rf {
        internal_lo_registry.assign(&internal_lo, frequencies.lo, &portclock)?;
    } else if let Some(lo_name) = &slot.lo_name {
        lo_registry.assign(lo_name, frequencies.lo, &portclock)?;
    }
    Ok(frequencies)
}

fn compile_sequencer(
    allocation: &AllocatedSequencer,
    frequencies: ResolvedFrequencies,
    schedule: &Schedule,
    config: &HardwareConfig,
    options: &CompileOptions,
) -> Result<CompiledSequencer> {
    let portclock = &allocation.portclock;
    let key = portclock.to_string();

    let timeline = timeline::project(portclock, schedule, allocation.slot.id.mode)?;
    let latency_ns = config.latency_corrections.get(&key).copied().unwrap_or(0);
    let mut generated = generator::generate(allocation, &timeline, schedule.repetitions, latency_ns)?;

    if let Some(hook) = options.program_hooks.get(&key) {
        hook.apply(&mut generated.program)?;
    }

    if let Some(correction) = config.distortion_corrections.get(&key) {
        for entry in generated.waveforms.waveforms_mut() {
            entry.data = correct_waveform(&entry.data, correction, &options.filter_registry)?;
        }
    }

    let settings = SequencerSettings {
        port: portclock.port.clone(),
        clock: portclock.clock.clone(),
        seq_index: allocation.seq_index,
        modulation_freq: frequencies.interm,
        lo_freq: frequencies.lo,
        rf_freq: frequencies.clock,
        mixer_corr_gain_ratio: allocation.config.mixer_amp_ratio,
        mixer_corr_phase_offset_degree: allocation.config.mixer_phase_error_deg,
        init_offset_awg_path_0: allocation.config.init_offset_awg_path_0,
        init_offset_awg_path_1: allocation.config.init_offset_awg_path_1,
        init_gain_awg_path_0: allocation.config.init_gain_awg_path_0,
        init_gain_awg_path_1: allocation.config.init_gain_awg_path_1,
    };
    let artifact = emitter::build_artifact(&generated, &frequencies, settings);

    let artifact_path = match (&options.output_dir, allocation.sequence_to_file) {
        (Some(output_dir), true) => Some(emitter::write_artifact(
            output_dir,
            &portclock.port,
            &portclock.clock,
            &artifact,
        )?),
        _ => None,
    };

    Ok(CompiledSequencer {
        portclock: portclock.clone(),
        module: allocation.module.clone(),
        seq_index: allocation.seq_index,
        frequencies,
        artifact,
        artifact_path,
        output_att: allocation.slot.output_att,
        input_att: allocation.slot.input_att,
        dc_mixer_offset_i: allocation.slot.dc_mixer_offset_i,
        dc_mixer_offset_q: allocation.slot.dc_mixer_offset_q,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::{ClockResource, Operation, OperationKind, PulseShape};
    use serde_json::json;

    fn qcm_config() -> HardwareConfig {
        HardwareConfig::from_value(&json!({
            "backend": "cluster_compiler.compile",
            "cluster0": {
                "instrument_type": "Cluster",
                "cluster0_module1": {
                    "instrument_type": "QCM",
                    "complex_output_0": {
                        "portclock_configs": [
                            {"port": "q0:mw", "clock": "q0.01"}
                        ]
                    }
                }
            }
        }))
        .unwrap()
    }

    fn square_schedule(port: &str, clock: &str, clock_freq: f64) -> Schedule {
        let mut schedule = Schedule::new("demo");
        schedule.add_clock_resource(ClockResource {
            name: clock.to_string(),
            frequency: clock_freq,
        });
        schedule.add_operation(
            0.0,
            Operation {
                name: "x90".to_string(),
                port: port.to_string(),
                clock: clock.to_string(),
                kind: OperationKind::Pulse(PulseShape::Square {
                    amp: 0.5,
                    duration: 100e-9,
                }),
            },
        );
        schedule
    }

    #[test]
    fn test_baseband_compilation_end_to_end() {
        let schedule = square_schedule("q0:mw", "q0.01", 8e9);
        let output = compile(&schedule, &qcm_config(), &CompileOptions::default()).unwrap();
        assert_eq!(output.sequencers.len(), 1);
        let sequencer = &output.sequencers[0];
        // No LO referenced: direct drive at the clock frequency.
        assert_eq!(sequencer.frequencies.lo, 0.0);
        assert_eq!(sequencer.frequencies.interm, 8e9);
        assert_eq!(sequencer.seq_index, 0);
        assert!(sequencer.artifact.program.contains("play"));
        assert!(sequencer.artifact_path.is_none());
    }

    #[test]
    fn test_unknown_clock_resource() {
        let mut schedule = square_schedule("q0:mw", "q0.01", 8e9);
        schedule.clocks.clear();
        assert!(matches!(
            compile(&schedule, &qcm_config(), &CompileOptions::default()),
            Err(Error::UnresolvedFrequency { .. })
        ));
    }

    #[test]
    fn test_shared_lo_divergence_is_a_conflict() {
        let config = HardwareConfig::from_value(&json!({
            "lo0": {"instrument_type": "LocalOscillator", "frequency": null, "power": 13},
            "cluster0": {
                "instrument_type": "Cluster",
                "cluster0_module1": {
                    "instrument_type": "QCM",
                    "complex_output_0": {
                        "lo_name": "lo0",
                        "portclock_configs": [
                            {"port": "q0:mw", "clock": "q0.01", "interm_freq": 200e6}
                        ]
                    },
                    "complex_output_1": {
                        "lo_name": "lo0",
                        "portclock_configs": [
                            {"port": "q1:mw", "clock": "q1.01", "interm_freq": 200e6}
                        ]
                    }
                }
            }
        }))
        .unwrap();
        let mut schedule = square_schedule("q0:mw", "q0.01", 5.2e9);
        schedule.add_clock_resource(ClockResource {
            name: "q1.01".to_string(),
            frequency: 5.2000001e9,
        });
        schedule.add_operation(
            200e-9,
            Operation {
                name: "x90_q1".to_string(),
                port: "q1:mw".to_string(),
                clock: "q1.01".to_string(),
                kind: OperationKind::Pulse(PulseShape::Square {
                    amp: 0.5,
                    duration: 100e-9,
                }),
            },
        );
        assert!(matches!(
            compile(&schedule, &config, &CompileOptions::default()),
            Err(Error::FrequencyConflict { .. })
        ));
    }

    #[test]
    fn test_resolved_lo_is_reported_for_the_driver() {
        let config = HardwareConfig::from_value(&json!({
            "lo0": {"instrument_type": "LocalOscillator", "frequency": null, "power": 13},
            "cluster0": {
                "instrument_type": "Cluster",
                "cluster0_module1": {
                    "instrument_type": "QCM",
                    "complex_output_0": {
                        "lo_name": "lo0",
                        "portclock_configs": [
                            {"port": "q0:mw", "clock": "q0.01", "interm_freq": 200e6}
                        ]
                    }
                }
            }
        }))
        .unwrap();
        let schedule = square_schedule("q0:mw", "q0.01", 5.2e9);
        let output = compile(&schedule, &config, &CompileOptions::default()).unwrap();
        assert_eq!(
            output.local_oscillators.get("lo0"),
            Some(&LoSettings {
                frequency: 5e9,
                power: Some(13.0),
            })
        );
    }

    #[test]
    fn test_latency_correction_is_applied() {
        let config = HardwareConfig::from_value(&json!({
            "latency_corrections": {"q4:mw-q4.01": 8e-9},
            "cluster0": {
                "instrument_type": "Cluster",
                "cluster0_module1": {
                    "instrument_type": "QCM",
                    "complex_output_0": {
                        "portclock_configs": [
                            {"port": "q4:mw", "clock": "q4.01"}
                        ]
                    }
                }
            }
        }))
        .unwrap();
        let schedule = square_schedule("q4:mw", "q4.01", 6e9);
        let output = compile(&schedule, &config, &CompileOptions::default()).unwrap();
        assert!(
            output.sequencers[0]
                .artifact
                .program
                .contains("# latency correction")
        );
    }

    #[test]
    fn test_distortion_correction_clips_the_waveform() {
        let config = HardwareConfig::from_value(&json!({
            "distortion_corrections": {
                "q0:fl-cl0.baseband": {
                    "filter_func": "lfilter",
                    "input_var_name": "x",
                    "kwargs": {"b": [1.0], "a": 1},
                    "clipping_values": [-0.1, 0.1]
                }
            },
            "cluster0": {
                "instrument_type": "Cluster",
                "cluster0_module1": {
                    "instrument_type": "QCM",
                    "real_output_0": {
                        "portclock_configs": [
                            {"port": "q0:fl", "clock": "cl0.baseband"}
                        ]
                    }
                }
            }
        }))
        .unwrap();
        let schedule = square_schedule("q0:fl", "cl0.baseband", 0.0);
        let output = compile(&schedule, &config, &CompileOptions::default()).unwrap();
        let waveform = output.sequencers[0].artifact.waveforms.values().next().unwrap();
        assert!(waveform.data.iter().all(|&s| s == 0.1));
    }

    fn qcm_rf_shared_output_config() -> HardwareConfig {
        HardwareConfig::from_value(&json!({
            "cluster0": {
                "instrument_type": "Cluster",
                "cluster0_module2": {
                    "instrument_type": "QCM_RF",
                    "complex_output_0": {
                        "portclock_configs": [
                            {"port": "q0:mw", "clock": "q0.01", "interm_freq": 200e6},
                            {"port": "q1:mw", "clock": "q1.01", "interm_freq": 200e6}
                        ]
                    }
                }
            }
        }))
        .unwrap()
    }

    fn two_qubit_schedule(q1_clock_freq: f64) -> Schedule {
        let mut schedule = square_schedule("q0:mw", "q0.01", 5.2e9);
        schedule.add_clock_resource(ClockResource {
            name: "q1.01".to_string(),
            frequency: q1_clock_freq,
        });
        schedule.add_operation(
            200e-9,
            Operation {
                name: "x90_q1".to_string(),
                port: "q1:mw".to_string(),
                clock: "q1.01".to_string(),
                kind: OperationKind::Pulse(PulseShape::Square {
                    amp: 0.5,
                    duration: 100e-9,
                }),
            },
        );
        schedule
    }

    #[test]
    fn test_rf_internal_lo_divergence_is_a_conflict() {
        // Both sequencers share complex_output_0 and solve their own LO; the
        // second one would need the internal LO at 6 GHz instead of 5 GHz.
        let schedule = two_qubit_schedule(6.2e9);
        assert!(matches!(
            compile(
                &schedule,
                &qcm_rf_shared_output_config(),
                &CompileOptions::default()
            ),
            Err(Error::FrequencyConflict { .. })
        ));
    }

    #[test]
    fn test_rf_internal_lo_shared_consistently() {
        let schedule = two_qubit_schedule(5.2e9);
        let output = compile(
            &schedule,
            &qcm_rf_shared_output_config(),
            &CompileOptions::default(),
        )
        .unwrap();
        assert_eq!(output.sequencers[0].frequencies.lo, 5e9);
        assert_eq!(output.sequencers[1].frequencies.lo, 5e9);
    }

    #[test]
    fn test_conflicting_interm_freq_levels() {
        let config = HardwareConfig::from_value(&json!({
            "lo0": {"instrument_type": "LocalOscillator", "frequency": 5e9, "power": 13},
            "cluster0": {
                "instrument_type": "Cluster",
                "cluster0_module1": {
                    "instrument_type": "QCM",
                    "complex_output_0": {
                        "lo_name": "lo0",
                        "interm_freq": 100e6,
                        "portclock_configs": [
                            {"port": "q0:mw", "clock": "q0.01", "interm_freq": 200e6}
                        ]
                    }
                }
            }
        }))
        .unwrap();
        let schedule = square_schedule("q0:mw", "q0.01", 5.2e9);
        assert!(matches!(
            compile(&schedule, &config, &CompileOptions::default()),
            Err(Error::FrequencyConflict { .. })
        ));
    }

    #[test]
    fn test_program_hook_runs_for_its_portclock() {
        struct Tag;
        impl ProgramHook for Tag {
            fn apply(&self, program: &mut Program) -> Result<()> {
                program.emit_with_comment(q1asm::Instruction::SetMarker { mask: 0 }, "hook");
                Ok(())
            }
        }
        let mut options = CompileOptions::default();
        options
            .program_hooks
            .insert("q0:mw-q0.01".to_string(), Box::new(Tag));
        let schedule = square_schedule("q0:mw", "q0.01", 8e9);
        let output = compile(&schedule, &qcm_config(), &options).unwrap();
        assert!(output.sequencers[0].artifact.program.contains("# hook"));
    }

    #[test]
    fn test_sequence_to_file_writes_an_artifact() {
        let schedule = square_schedule("q0:mw", "q0.01", 8e9);
        let dir = std::env::temp_dir().join(format!("cluster-compiler-{}", uuid::Uuid::new_v4()));
        let options = CompileOptions {
            output_dir: Some(dir.clone()),
            ..Default::default()
        };
        let output = compile(&schedule, &qcm_config(), &options).unwrap();
        let path = output.sequencers[0].artifact_path.as_ref().unwrap();
        assert!(path.exists());
        assert!(path.parent().unwrap().ends_with("schedules"));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_module_file_flag_overrides_cluster() {
        let config = HardwareConfig::from_value(&json!({
            "cluster0": {
                "instrument_type": "Cluster",
                "cluster0_module1": {
                    "instrument_type": "QCM",
                    "sequence_to_file": false,
                    "complex_output_0": {
                        "portclock_configs": [
                            {"port": "q0:mw", "clock": "q0.01"}
                        ]
                    }
                }
            }
        }))
        .unwrap();
        let schedule = square_schedule("q0:mw", "q0.01", 8e9);
        let dir = std::env::temp_dir().join(format!("cluster-compiler-{}", uuid::Uuid::new_v4()));
        let options = CompileOptions {
            output_dir: Some(dir.clone()),
            ..Default::default()
        };
        let output = compile(&schedule, &config, &options).unwrap();
        assert!(output.sequencers[0].artifact_path.is_none());
        assert!(!dir.exists());
    }
}
