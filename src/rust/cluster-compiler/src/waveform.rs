// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Waveform sampling and the per-sequencer deduplicated waveform table.
//!
//! Identity in the table is the shape's parameter tuple, not its sampled
//! data: two operations with identical parameters share one entry no matter
//! how they were constructed. Float parameters participate in hashing via
//! their normalized bit patterns.

use indexmap::IndexMap;
use q1asm::NanoSeconds;
use q1asm::instructions::WaveIndex;
use sha1::{Digest, Sha1};

use crate::constants::{MAX_SAMPLE_SIZE_WAVEFORMS, SAMPLING_RATE};
use crate::schedule::PulseShape;
use crate::timing::length_to_samples;
use crate::utils::normalize_f64;
use crate::{Error, Result};

/// Hashable identity of a sampled waveform.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WaveformSignature {
    Square {
        amp: u64,
        duration: NanoSeconds,
    },
    Ramp {
        amp: u64,
        duration: NanoSeconds,
    },
    Gaussian {
        amp: u64,
        sigma: u64,
        duration: NanoSeconds,
    },
    /// Numerical data has no compact parameter form; identity is a digest
    /// over the normalized sample bits.
    Numerical {
        digest: [u8; 20],
    },
}

impl WaveformSignature {
    pub fn from_shape(shape: &PulseShape, duration_ns: NanoSeconds) -> Self {
        match shape {
            PulseShape::Square { amp, .. } => WaveformSignature::Square {
                amp: normalize_f64(*amp),
                duration: duration_ns,
            },
            PulseShape::Ramp { amp, .. } => WaveformSignature::Ramp {
                amp: normalize_f64(*amp),
                duration: duration_ns,
            },
            PulseShape::Gaussian { amp, sigma, .. } => WaveformSignature::Gaussian {
                amp: normalize_f64(*amp),
                sigma: normalize_f64(*sigma),
                duration: duration_ns,
            },
            PulseShape::Numerical { samples, .. } => {
                let mut hasher = Sha1::new();
                for sample in samples {
                    hasher.update(normalize_f64(sample.re).to_le_bytes());
                    hasher.update(normalize_f64(sample.im).to_le_bytes());
                }
                WaveformSignature::Numerical {
                    digest: hasher.finalize().into(),
                }
            }
        }
    }

    /// Stable human-readable name with a short digest suffix, used as the
    /// key in the emitted waveform dictionary.
    pub fn signature_string(&self) -> String {
        let (kind, description) = match self {
            WaveformSignature::Square { amp, duration } => {
                ("square", format!("{amp:016x}_{duration}"))
            }
            WaveformSignature::Ramp { amp, duration } => ("ramp", format!("{amp:016x}_{duration}")),
            WaveformSignature::Gaussian {
                amp,
                sigma,
                duration,
            } => ("gaussian", format!("{amp:016x}_{sigma:016x}_{duration}")),
            WaveformSignature::Numerical { digest } => ("numerical", hex_string(digest)),
        };
        let mut hasher = Sha1::new();
        hasher.update(kind.as_bytes());
        hasher.update(description.as_bytes());
        let digest: [u8; 20] = hasher.finalize().into();
        format!("{kind}_{}", &hex_string(&digest)[..8])
    }
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Sample a pulse envelope at the instrument rate, split into the two output
/// paths.
pub fn sample_shape(shape: &PulseShape) -> (Vec<f64>, Vec<f64>) {
    let num_samples = length_to_samples(shape.duration(), SAMPLING_RATE);
    match shape {
        PulseShape::Square { amp, .. } => (vec![*amp; num_samples], vec![0.0; num_samples]),
        PulseShape::Ramp { amp, .. } => {
            let path0 = (0..num_samples)
                .map(|i| amp * (i as f64) / (num_samples as f64))
                .collect();
            (path0, vec![0.0; num_samples])
        }
        PulseShape::Gaussian {
            amp,
            sigma,
            duration,
        } => {
            let dt = 1.0 / SAMPLING_RATE;
            let mid = (duration - dt) / 2.0;
            let path0 = (0..num_samples)
                .map(|i| {
                    let t = i as f64 * dt;
                    amp * (-((t - mid) * (t - mid)) / (2.0 * sigma * sigma)).exp()
                })
                .collect();
            (path0, vec![0.0; num_samples])
        }
        PulseShape::Numerical { samples, .. } => (
            samples.iter().map(|s| s.re).collect(),
            samples.iter().map(|s| s.im).collect(),
        ),
    }
}

#[derive(Debug, Clone)]
pub struct WaveformEntry {
    pub name: String,
    pub data: Vec<f64>,
    pub index: WaveIndex,
}

/// Deduplicated waveform storage of one sequencer, bounded by the
/// per-channel sample memory.
#[derive(Debug)]
pub struct WaveformTable {
    portclock: String,
    entries: IndexMap<WaveformSignature, (WaveIndex, WaveIndex)>,
    waveforms: Vec<WaveformEntry>,
    total_samples: usize,
}

impl WaveformTable {
    pub fn new<S: Into<String>>(portclock: S) -> Self {
        WaveformTable {
            portclock: portclock.into(),
            entries: IndexMap::new(),
            waveforms: Vec::new(),
            total_samples: 0,
        }
    }

    /// Indices of the two paths of `signature`, sampling and storing the
    /// waveform on first use.
    pub fn get_or_insert(
        &mut self,
        signature: WaveformSignature,
        shape: &PulseShape,
    ) -> Result<(WaveIndex, WaveIndex)> {
        if let Some(&indices) = self.entries.get(&signature) {
            return Ok(indices);
        }
        let (path0, path1) = sample_shape(shape);
        let requested = self.total_samples + path0.len() + path1.len();
        if requested > MAX_SAMPLE_SIZE_WAVEFORMS {
            return Err(Error::WaveformMemoryExceeded {
                portclock: self.portclock.clone(),
                requested,
                limit: MAX_SAMPLE_SIZE_WAVEFORMS,
            });
        }
        let pair_index = self.entries.len() as WaveIndex;
        let indices = (2 * pair_index, 2 * pair_index + 1);
        let name = signature.signature_string();
        self.total_samples = requested;
        self.waveforms.push(WaveformEntry {
            name: format!("{name}_i"),
            data: path0,
            index: indices.0,
        });
        self.waveforms.push(WaveformEntry {
            name: format!("{name}_q"),
            data: path1,
            index: indices.1,
        });
        self.entries.insert(signature, indices);
        Ok(indices)
    }

    pub fn total_samples(&self) -> usize {
        self.total_samples
    }

    pub fn waveforms(&self) -> &[WaveformEntry] {
        &self.waveforms
    }

    pub fn waveforms_mut(&mut self) -> &mut [WaveformEntry] {
        &mut self.waveforms
    }

    pub fn is_empty(&self) -> bool {
        self.waveforms.is_empty()
    }
}
