// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Frequency resolution for the up-conversion identity `f_RF = f_IF + f_LO`.
//!
//! Every sequencer must end the compilation with all three frequencies
//! known and consistent. The target RF frequency comes from the schedule's
//! clock resource; LO and IF come from the hardware config, from an external
//! LocalOscillator instrument, or are solved from the identity. An LO may be
//! shared by several sequencers, either as an external instrument referenced
//! from multiple slots or as the internal oscillator of an RF output driven
//! by multiple port-clocks, so solved LO frequencies go through a registry
//! that detects contradictions.

use indexmap::IndexMap;

use crate::{Error, Result};

const REL_TOLERANCE: f64 = 1e-9;

/// Floating-point frequency equality with a relative tolerance, mirroring
/// how the configs are authored (two ways of writing the same frequency must
/// not be flagged as a conflict, 5e9 vs 5.0000001e9 must be).
pub fn is_close(a: f64, b: f64) -> bool {
    (a - b).abs() <= REL_TOLERANCE * a.abs().max(b.abs())
}

/// Knowns and unknowns of one sequencer's frequency identity.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Frequencies {
    /// Target RF frequency from the schedule's clock resource.
    pub clock: f64,
    pub lo: Option<f64>,
    pub interm: Option<f64>,
}

/// Fully resolved frequencies of one sequencer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedFrequencies {
    pub clock: f64,
    pub lo: f64,
    pub interm: f64,
}

/// Resolve the identity for one sequencer.
///
/// `has_external_lo` distinguishes a baseband slot that references a
/// LocalOscillator instrument from one that drives its output directly: only
/// the latter may default to `f_LO = 0`.
pub fn resolve(
    portclock: &str,
    freqs: Frequencies,
    downconverter_freq: Option<f64>,
    mix_lo: bool,
    is_rf: bool,
    has_external_lo: bool,
) -> Result<ResolvedFrequencies> {
    let clock = effective_clock_frequency(portclock, freqs.clock, downconverter_freq)?;

    if !mix_lo {
        // The LO is parked on the target frequency and the mixer identity
        // does not apply. The IF, when given, is programmed as-is.
        return Ok(ResolvedFrequencies {
            clock,
            lo: clock,
            interm: freqs.interm.unwrap_or(0.0),
        });
    }

    match (freqs.lo, freqs.interm) {
        (Some(lo), Some(interm)) => {
            if !is_close(lo + interm, clock) {
                return Err(Error::FrequencyConflict {
                    portclock: portclock.to_string(),
                    reason: format!(
                        "both the LO and intermediate frequencies are fixed, but \
                         {lo:e} + {interm:e} does not equal the target frequency {clock:e}"
                    ),
                });
            }
            Ok(ResolvedFrequencies { clock, lo, interm })
        }
        (Some(lo), None) => Ok(ResolvedFrequencies {
            clock,
            lo,
            interm: clock - lo,
        }),
        (None, Some(interm)) => Ok(ResolvedFrequencies {
            clock,
            lo: clock - interm,
            interm,
        }),
        (None, None) => {
            if is_rf || has_external_lo {
                Err(Error::UnresolvedFrequency {
                    portclock: portclock.to_string(),
                    reason: "neither the LO nor the intermediate frequency is specified; \
                             fix at least one of them"
                        .to_string(),
                })
            } else {
                // Direct baseband drive: no LO in the signal path.
                Ok(ResolvedFrequencies {
                    clock,
                    lo: 0.0,
                    interm: clock,
                })
            }
        }
    }
}

fn effective_clock_frequency(
    portclock: &str,
    clock: f64,
    downconverter_freq: Option<f64>,
) -> Result<f64> {
    let Some(downconverter_freq) = downconverter_freq else {
        return Ok(clock);
    };
    if downconverter_freq < 0.0 {
        return Err(Error::FrequencyConflict {
            portclock: portclock.to_string(),
            reason: format!("downconverter frequency must be positive, got {downconverter_freq:e}"),
        });
    }
    if downconverter_freq < clock {
        return Err(Error::FrequencyConflict {
            portclock: portclock.to_string(),
            reason: format!(
                "downconverter frequency {downconverter_freq:e} must exceed the clock \
                 frequency {clock:e}"
            ),
        });
    }
    Ok(downconverter_freq - clock)
}

/// Collects the frequency each LO must be programmed to. Two sequencers
/// sharing one LO must agree on its frequency.
#[derive(Debug, Default)]
pub struct LoFrequencyRegistry {
    frequencies: IndexMap<String, f64>,
}

impl LoFrequencyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign(&mut self, lo_name: &str, frequency: f64, portclock: &str) -> Result<()> {
        match self.frequencies.get(lo_name) {
            Some(&existing) if !is_close(existing, frequency) => Err(Error::FrequencyConflict {
                portclock: portclock.to_string(),
                reason: format!(
                    "LO '{lo_name}' is already required to run at {existing:e} Hz, \
                     but this sequencer needs it at {frequency:e} Hz"
                ),
            }),
            _ => {
                self.frequencies.insert(lo_name.to_string(), frequency);
                Ok(())
            }
        }
    }

    pub fn get(&self, lo_name: &str) -> Option<f64> {
        self.frequencies.get(lo_name).copied()
    }
}
