// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Serialization of compiled sequencer programs into the upload artifact.
//!
//! One artifact per sequencer: the rendered program text, the waveform
//! dictionary, the acquisition declarations and the resolved settings the
//! driver layer applies to the physical instrument. Artifacts optionally
//! land on disk under `<output_dir>/schedules/` with a collision-free name.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use indexmap::IndexMap;
use serde::Serialize;
use uuid::Uuid;

use crate::frequency::ResolvedFrequencies;
use crate::generator::GeneratedProgram;
use crate::utils::sanitize_filename;
use crate::Result;

#[derive(Debug, Serialize)]
pub struct WaveformArtifact {
    pub data: Vec<f64>,
    pub index: u32,
}

#[derive(Debug, Serialize)]
pub struct AcquisitionArtifact {
    pub num_bins: u32,
    pub index: u32,
}

/// Settings the driver applies to the sequencer before upload.
#[derive(Debug, Clone, Serialize)]
pub struct SequencerSettings {
    pub port: String,
    pub clock: String,
    pub seq_index: usize,
    /// NCO frequency, i.e. the resolved intermediate frequency.
    pub modulation_freq: f64,
    pub lo_freq: f64,
    pub rf_freq: f64,
    pub mixer_corr_gain_ratio: f64,
    pub mixer_corr_phase_offset_degree: f64,
    pub init_offset_awg_path_0: f64,
    pub init_offset_awg_path_1: f64,
    pub init_gain_awg_path_0: f64,
    pub init_gain_awg_path_1: f64,
}

/// The complete upload artifact of one sequencer.
#[derive(Debug, Serialize)]
pub struct SequencerArtifact {
    pub program: String,
    pub waveforms: IndexMap<String, WaveformArtifact>,
    pub acquisitions: IndexMap<String, AcquisitionArtifact>,
    pub settings: SequencerSettings,
}

pub fn build_artifact(
    generated: &GeneratedProgram,
    frequencies: &ResolvedFrequencies,
    settings: SequencerSettings,
) -> SequencerArtifact {
    debug_assert_eq!(settings.modulation_freq, frequencies.interm);
    let mut waveforms = IndexMap::new();
    for entry in generated.waveforms.waveforms() {
        waveforms.insert(
            entry.name.clone(),
            WaveformArtifact {
                data: entry.data.clone(),
                index: entry.index,
            },
        );
    }
    let mut acquisitions = IndexMap::new();
    for (index, (&channel, &num_bins)) in generated.acquisitions.iter().enumerate() {
        acquisitions.insert(
            channel.to_string(),
            AcquisitionArtifact {
                num_bins,
                index: index as u32,
            },
        );
    }
    SequencerArtifact {
        program: generated.program.to_string(),
        waveforms,
        acquisitions,
        settings,
    }
}

/// Artifact filename: millisecond timestamp, six random hex characters, then
/// the sanitized port and clock. Repeated compilations of the same
/// port-clock within one millisecond still get distinct names.
pub fn artifact_filename(port: &str, clock: &str) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "{millis}-{}_{}_{}.json",
        &suffix[..6],
        sanitize_filename(port),
        sanitize_filename(clock)
    )
}

/// Write one artifact under `<output_dir>/schedules/`, returning its path.
pub fn write_artifact(
    output_dir: &Path,
    port: &str,
    clock: &str,
    artifact: &SequencerArtifact,
) -> Result<PathBuf> {
    let schedules_dir = output_dir.join("schedules");
    fs::create_dir_all(&schedules_dir)
        .with_context(|| format!("creating {}", schedules_dir.display()))?;
    let path = schedules_dir.join(artifact_filename(port, clock));
    let serialized = serde_json::to_string_pretty(artifact)
        .context("serializing sequencer artifact")?;
    fs::write(&path, serialized).with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::AllocatedSequencer;
    use crate::device_traits::InstrumentType;
    use crate::generator;
    use crate::hardware_config::{OutputSlot, PortClockConfig, SlotId, SlotMode};
    use crate::schedule::{Operation, OperationKind, PortClock, PulseShape, Schedule};
    use crate::timeline;

    fn generated_program() -> GeneratedProgram {
        let portclock = PortClock::new("q0:mw", "q0.01");
        let sequencer = AllocatedSequencer {
            portclock: portclock.clone(),
            cluster: "cluster0".to_string(),
            module: "cluster0_module1".to_string(),
            instrument_type: InstrumentType::Qcm,
            seq_index: 0,
            slot: OutputSlot {
                id: SlotId::parse("complex_output_0").unwrap(),
                lo_name: None,
                lo_freq: None,
                interm_freq: None,
                downconverter_freq: None,
                mix_lo: true,
                dc_mixer_offset_i: None,
                dc_mixer_offset_q: None,
                output_att: None,
                input_att: None,
                marker_debug_mode_enable: false,
                portclocks: Vec::new(),
            },
            config: PortClockConfig {
                portclock: portclock.clone(),
                interm_freq: None,
                mixer_amp_ratio: 1.0,
                mixer_phase_error_deg: 0.0,
                init_offset_awg_path_0: 0.0,
                init_offset_awg_path_1: 0.0,
                init_gain_awg_path_0: 1.0,
                init_gain_awg_path_1: 1.0,
                instruction_generated_pulses_enabled: false,
            },
            sequence_to_file: true,
            max_instructions: 16384,
        };
        let mut schedule = Schedule::new("test");
        schedule.add_operation(
            0.0,
            Operation {
                name: "x90".to_string(),
                port: "q0:mw".to_string(),
                clock: "q0.01".to_string(),
                kind: OperationKind::Pulse(PulseShape::Square {
                    amp: 0.5,
                    duration: 100e-9,
                }),
            },
        );
        let tl = timeline::project(&portclock, &schedule, SlotMode::Complex).unwrap();
        generator::generate(&sequencer, &tl, 1, 0).unwrap()
    }

    fn settings() -> SequencerSettings {
        SequencerSettings {
            port: "q0:mw".to_string(),
            clock: "q0.01".to_string(),
            seq_index: 0,
            modulation_freq: 8e9,
            lo_freq: 0.0,
            rf_freq: 8e9,
            mixer_corr_gain_ratio: 1.0,
            mixer_corr_phase_offset_degree: 0.0,
            init_offset_awg_path_0: 0.0,
            init_offset_awg_path_1: 0.0,
            init_gain_awg_path_0: 1.0,
            init_gain_awg_path_1: 1.0,
        }
    }

    #[test]
    fn test_artifact_structure() {
        let generated = generated_program();
        let frequencies = ResolvedFrequencies {
            clock: 8e9,
            lo: 0.0,
            interm: 8e9,
        };
        let artifact = build_artifact(&generated, &frequencies, settings());
        assert_eq!(artifact.waveforms.len(), 2);
        assert!(artifact.program.contains("wait_sync"));

        let value = serde_json::to_value(&artifact).unwrap();
        assert!(value["program"].is_string());
        assert!(value["waveforms"].is_object());
        assert_eq!(value["settings"]["modulation_freq"], 8e9);
        let first = value["waveforms"].as_object().unwrap().values().next().unwrap();
        assert_eq!(first["index"], 0);
        assert_eq!(first["data"].as_array().unwrap().len(), 100);
    }

    #[test]
    fn test_filename_encodes_port_and_clock() {
        let name = artifact_filename("q0:mw", "q0.01");
        assert!(name.ends_with("_q0_mw_q0.01.json"));
        assert!(name.contains('-'));
        assert_ne!(artifact_filename("q0:mw", "q0.01"), name);
    }

    #[test]
    fn test_write_artifact() {
        let generated = generated_program();
        let frequencies = ResolvedFrequencies {
            clock: 8e9,
            lo: 0.0,
            interm: 8e9,
        };
        let artifact = build_artifact(&generated, &frequencies, settings());
        let dir = std::env::temp_dir().join(format!("cluster-compiler-{}", Uuid::new_v4()));
        let path = write_artifact(&dir, "q0:mw", "q0.01", &artifact).unwrap();
        assert!(path.exists());
        let contents = fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert!(value["program"].as_str().unwrap().contains("stop"));
        fs::remove_dir_all(&dir).unwrap();
    }
}
