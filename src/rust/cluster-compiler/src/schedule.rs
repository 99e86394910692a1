// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! The absolutely-timed schedule consumed by the backend.
//!
//! Schedules are produced by the gate-to-pulse front end; this module only
//! defines the shape of the data, it performs no scheduling itself.

use std::collections::HashMap;
use std::fmt;

use num_complex::Complex64;

/// Identity of one signal route: a port bound to a modulation clock.
///
/// At most one sequencer per module owns a given port-clock pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PortClock {
    pub port: String,
    pub clock: String,
}

impl PortClock {
    pub fn new<P: Into<String>, C: Into<String>>(port: P, clock: C) -> Self {
        PortClock {
            port: port.into(),
            clock: clock.into(),
        }
    }
}

impl fmt::Display for PortClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.port, self.clock)
    }
}

/// A named clock with a known frequency, supplying the target RF frequency
/// of the port-clock pairs that reference it.
#[derive(Debug, Clone, PartialEq)]
pub struct ClockResource {
    pub name: String,
    pub frequency: f64,
}

/// Parametrized analog pulse envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum PulseShape {
    Square {
        amp: f64,
        duration: f64,
    },
    Ramp {
        amp: f64,
        duration: f64,
        /// Step count used when the ramp is synthesized as an offset
        /// staircase instead of a sampled waveform.
        num_steps: Option<usize>,
    },
    Gaussian {
        amp: f64,
        sigma: f64,
        duration: f64,
    },
    Numerical {
        samples: Vec<Complex64>,
        duration: f64,
    },
}

impl PulseShape {
    pub fn duration(&self) -> f64 {
        match self {
            PulseShape::Square { duration, .. }
            | PulseShape::Ramp { duration, .. }
            | PulseShape::Gaussian { duration, .. }
            | PulseShape::Numerical { duration, .. } => *duration,
        }
    }

    /// Whether the sampled waveform has a non-zero quadrature component.
    pub fn has_quadrature(&self) -> bool {
        match self {
            PulseShape::Numerical { samples, .. } => samples.iter().any(|s| s.im != 0.0),
            _ => false,
        }
    }
}

/// One element of a stitched pulse: either a pulse envelope or a bare
/// voltage offset.
#[derive(Debug, Clone, PartialEq)]
pub enum StitchElement {
    Pulse(PulseShape),
    Offset {
        path0: f64,
        path1: f64,
        /// `None` holds until the end of the stitch.
        duration: Option<f64>,
    },
}

impl StitchElement {
    pub fn duration(&self) -> f64 {
        match self {
            StitchElement::Pulse(shape) => shape.duration(),
            StitchElement::Offset { duration, .. } => duration.unwrap_or(0.0),
        }
    }
}

/// An ordered composite of pulses and offsets with resolved relative start
/// times, treated as one indivisible operation by the timeline projector.
#[derive(Debug, Clone, PartialEq)]
pub struct StitchedPulse {
    /// Elements with their start times relative to the stitch start, in the
    /// order they were added.
    pub elements: Vec<(f64, StitchElement)>,
    /// Maximum end time over all elements.
    pub duration: f64,
}

impl StitchedPulse {
    pub fn has_quadrature(&self) -> bool {
        self.elements.iter().any(|(_, element)| match element {
            StitchElement::Pulse(shape) => shape.has_quadrature(),
            StitchElement::Offset { .. } => false,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OperationKind {
    Pulse(PulseShape),
    /// DC voltage level on the two output paths. Holds for `duration`, or
    /// until the end of the timeline when `duration` is `None`.
    VoltageOffset {
        path0: f64,
        path1: f64,
        duration: Option<f64>,
    },
    Acquisition {
        channel: u32,
        bin_index: u32,
        duration: f64,
    },
    /// Digital marker pulse. Matched to a sequencer by port alone.
    Marker { mask: u8, duration: f64 },
    Stitched(StitchedPulse),
}

/// A single schedulable operation addressed to a port-clock pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub name: String,
    pub port: String,
    /// Empty for digital marker operations.
    pub clock: String,
    pub kind: OperationKind,
}

impl Operation {
    pub fn duration(&self) -> f64 {
        match &self.kind {
            OperationKind::Pulse(shape) => shape.duration(),
            OperationKind::VoltageOffset { duration, .. } => duration.unwrap_or(0.0),
            OperationKind::Acquisition { duration, .. } => *duration,
            OperationKind::Marker { duration, .. } => *duration,
            OperationKind::Stitched(stitch) => stitch.duration,
        }
    }

    /// Real-time I/O operations occupy their sequencer for their duration;
    /// bare offsets do not.
    pub fn is_real_time_io(&self) -> bool {
        !matches!(self.kind, OperationKind::VoltageOffset { .. })
    }

    pub fn is_acquisition(&self) -> bool {
        matches!(self.kind, OperationKind::Acquisition { .. })
    }

    pub fn portclock(&self) -> PortClock {
        PortClock::new(self.port.clone(), self.clock.clone())
    }
}

/// One entry of the schedule: an operation with its absolute start time.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledOperation {
    /// Absolute start time in seconds, assigned by the upstream scheduler.
    pub start_time: f64,
    pub operation: Operation,
}

/// A validated, absolutely-timed schedule plus its clock resources.
#[derive(Debug, Clone, Default)]
pub struct Schedule {
    pub name: String,
    pub repetitions: u64,
    pub operations: Vec<ScheduledOperation>,
    pub clocks: HashMap<String, ClockResource>,
}

impl Schedule {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Schedule {
            name: name.into(),
            repetitions: 1,
            operations: Vec::new(),
            clocks: HashMap::new(),
        }
    }

    pub fn add_clock_resource(&mut self, clock: ClockResource) {
        self.clocks.insert(clock.name.clone(), clock);
    }

    pub fn add_operation(&mut self, start_time: f64, operation: Operation) {
        self.operations.push(ScheduledOperation {
            start_time,
            operation,
        });
    }

    pub fn clock_frequency(&self, clock: &str) -> Option<f64> {
        self.clocks.get(clock).map(|c| c.frequency)
    }

    /// End time of the last operation; the span every sequencer program must
    /// cover so the cluster stays synchronized.
    pub fn total_duration(&self) -> f64 {
        self.operations
            .iter()
            .map(|op| op.start_time + op.operation.duration())
            .fold(0.0, f64::max)
    }

    /// Distinct port-clock pairs referenced by the operations, in first-use
    /// order. Marker operations carry an empty clock and are keyed on port
    /// alone downstream; they do not contribute a pair here.
    pub fn used_portclocks(&self) -> Vec<PortClock> {
        let mut seen = Vec::new();
        for entry in &self.operations {
            if entry.operation.clock.is_empty() {
                continue;
            }
            let portclock = entry.operation.portclock();
            if !seen.contains(&portclock) {
                seen.push(portclock);
            }
        }
        seen
    }
}
