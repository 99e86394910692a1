// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Hardware compilation backend for a cluster of pulse-sequencing modules.
//!
//! Takes an absolutely-timed schedule of operations bound to named ports and
//! clocks plus a declarative hardware-mapping document, and produces one
//! self-contained program (instruction stream + waveform table) per
//! sequencer, together with the frequency and correction parameters the
//! physical instrument must be configured with.

pub mod allocator;
pub mod compile;
pub mod constants;
pub mod corrections;
pub mod device_traits;
pub mod emitter;
pub mod frequency;
pub mod generator;
pub mod hardware_config;
pub mod schedule;
pub mod stitched;
pub mod timeline;
pub mod timing;
pub(crate) mod utils;
pub mod waveform;

pub use compile::{CompileOptions, compile};
pub use schedule::{Operation, PortClock, Schedule};
pub use stitched::StitchedPulseBuilder;

/// Compilation-time errors. All abort the run; there is no partial output.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid hardware config: {0}")]
    Config(String),
    #[error("frequency conflict for '{portclock}': {reason}")]
    FrequencyConflict { portclock: String, reason: String },
    #[error("cannot resolve frequencies for '{portclock}': {reason}")]
    UnresolvedFrequency { portclock: String, reason: String },
    #[error("port-clock '{portclock}' is not declared by any module in the hardware config")]
    PortClockNotFound { portclock: String },
    #[error("port-clock '{portclock}' is declared by both '{first}' and '{second}'")]
    AmbiguousPortClock {
        portclock: String,
        first: String,
        second: String,
    },
    #[error(
        "module '{module}' uses {count} port-clock combinations, exceeding its {max} sequencers"
    )]
    TooManySequencers {
        module: String,
        count: usize,
        max: usize,
    },
    #[error(
        "operation '{operation}' on '{portclock}' carries quadrature content \
         but is routed to a real output"
    )]
    ComplexOnRealOutput { operation: String, portclock: String },
    #[error("time {value:e} s of {context} is not a multiple of the {grid_time_ns} ns grid")]
    GridAlignment {
        value: f64,
        context: String,
        grid_time_ns: u64,
    },
    #[error(
        "operation '{operation}' on '{portclock}' starts at {start} ns, \
         before the previous operation ends at {previous_end} ns"
    )]
    OverlapConflict {
        operation: String,
        portclock: String,
        start: u64,
        previous_end: u64,
    },
    #[error(
        "stitched-pulse element at {start:e} s overlaps another waveform-bearing \
         element of the same stitch"
    )]
    BuilderOverlap { start: f64 },
    #[error(
        "waveform memory exceeded for '{portclock}': {requested} samples requested, \
         {limit} available"
    )]
    WaveformMemoryExceeded {
        portclock: String,
        requested: usize,
        limit: usize,
    },
    #[error("no synthesis rule for operation '{operation}' on '{portclock}'")]
    UnsupportedShape { operation: String, portclock: String },
    #[error(
        "incomplete distortion correction for '{key}': 'filter_func', \
         'input_var_name' and 'kwargs' must all be present"
    )]
    MissingFilterParameters { key: String },
    #[error(transparent)]
    Assembly(#[from] q1asm::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
