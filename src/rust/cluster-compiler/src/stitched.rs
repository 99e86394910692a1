// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Builder for composite operations made of pulses and bare voltage offsets.
//!
//! The builder keeps an explicit cursor: plain `add_*` calls append at the
//! cursor and advance it by the element's duration, while the `*_at`
//! variants place an element at an explicit offset from the stitch start and
//! leave the cursor untouched. An out-of-order insertion therefore never
//! shifts where subsequent appends land.

use crate::schedule::{Operation, OperationKind, PulseShape, StitchElement, StitchedPulse};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct StitchedPulseBuilder {
    name: String,
    port: String,
    clock: String,
    cursor: f64,
    elements: Vec<(f64, StitchElement)>,
}

impl StitchedPulseBuilder {
    pub fn new<P: Into<String>, C: Into<String>>(port: P, clock: C) -> Self {
        StitchedPulseBuilder {
            name: "stitched_pulse".to_string(),
            port: port.into(),
            clock: clock.into(),
            cursor: 0.0,
            elements: Vec::new(),
        }
    }

    pub fn with_name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = name.into();
        self
    }

    /// Append a pulse at the cursor and advance the cursor past it.
    pub fn add_pulse(mut self, shape: PulseShape) -> Self {
        let start = self.cursor;
        self.cursor += shape.duration();
        self.elements.push((start, StitchElement::Pulse(shape)));
        self
    }

    /// Place a pulse at an explicit offset from the stitch start. The cursor
    /// stays where it was.
    pub fn add_pulse_at(mut self, rel_time: f64, shape: PulseShape) -> Self {
        self.elements.push((rel_time, StitchElement::Pulse(shape)));
        self
    }

    /// Append a voltage offset at the cursor. With a duration, the cursor
    /// advances past it; without one, the offset holds until the end of the
    /// stitch and the cursor stays put.
    pub fn add_voltage_offset(mut self, path0: f64, path1: f64, duration: Option<f64>) -> Self {
        let start = self.cursor;
        self.cursor += duration.unwrap_or(0.0);
        self.elements.push((
            start,
            StitchElement::Offset {
                path0,
                path1,
                duration,
            },
        ));
        self
    }

    /// Place a voltage offset at an explicit offset from the stitch start,
    /// leaving the cursor untouched.
    pub fn add_voltage_offset_at(
        mut self,
        rel_time: f64,
        path0: f64,
        path1: f64,
        duration: Option<f64>,
    ) -> Self {
        self.elements.push((
            rel_time,
            StitchElement::Offset {
                path0,
                path1,
                duration,
            },
        ));
        self
    }

    /// Finalize into one indivisible operation.
    ///
    /// Elements may overlap in time as long as at most one of any
    /// overlapping group carries a waveform; two concurrent pulses on the
    /// same sequencer cannot be played.
    pub fn build(self) -> Result<Operation> {
        let pulses: Vec<(f64, f64)> = self
            .elements
            .iter()
            .filter_map(|(start, element)| match element {
                StitchElement::Pulse(shape) => Some((*start, *start + shape.duration())),
                StitchElement::Offset { .. } => None,
            })
            .collect();
        for (i, &(start_a, end_a)) in pulses.iter().enumerate() {
            for &(start_b, end_b) in &pulses[i + 1..] {
                if start_a < end_b && start_b < end_a {
                    return Err(Error::BuilderOverlap {
                        start: start_a.max(start_b),
                    });
                }
            }
        }
        let duration = self
            .elements
            .iter()
            .map(|(start, element)| start + element.duration())
            .fold(0.0, f64::max);
        Ok(Operation {
            name: self.name,
            port: self.port,
            clock: self.clock,
            kind: OperationKind::Stitched(StitchedPulse {
                elements: self.elements,
                duration,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(amp: f64, duration: f64) -> PulseShape {
        PulseShape::Square { amp, duration }
    }

    #[test]
    fn test_cursor_survives_out_of_order_insertion() {
        let d1 = 100e-9;
        let d2 = 500e-9;
        let d3 = 200e-9;
        let op = StitchedPulseBuilder::new("q0:mw", "q0.01")
            .add_pulse(square(0.5, d1))
            .add_voltage_offset_at(0.0, 0.1, 0.1, Some(d2))
            .add_pulse(square(0.3, d3))
            .build()
            .unwrap();
        let OperationKind::Stitched(stitch) = &op.kind else {
            panic!("expected a stitched operation");
        };
        // The second pulse starts right after the first one.
        assert_eq!(stitch.elements[2].0, d1);
        assert!((stitch.duration - (d2).max(d1 + d3)).abs() < 1e-15);
    }

    #[test]
    fn test_open_ended_offset_does_not_advance_cursor() {
        let op = StitchedPulseBuilder::new("q0:fl", "cl0.baseband")
            .add_voltage_offset(0.2, 0.0, None)
            .add_pulse(square(0.5, 40e-9))
            .build()
            .unwrap();
        let OperationKind::Stitched(stitch) = &op.kind else {
            panic!("expected a stitched operation");
        };
        assert_eq!(stitch.elements[1].0, 0.0);
        assert!((stitch.duration - 40e-9).abs() < 1e-15);
    }

    #[test]
    fn test_two_concurrent_pulses_rejected() {
        let result = StitchedPulseBuilder::new("q0:mw", "q0.01")
            .add_pulse(square(0.5, 100e-9))
            .add_pulse_at(50e-9, square(0.3, 100e-9))
            .build();
        assert!(matches!(result, Err(Error::BuilderOverlap { .. })));
    }

    #[test]
    fn test_adjacent_pulses_are_legal() {
        let result = StitchedPulseBuilder::new("q0:mw", "q0.01")
            .add_pulse(square(0.5, 100e-9))
            .add_pulse_at(100e-9, square(0.3, 100e-9))
            .build();
        assert!(result.is_ok());
    }

    #[test]
    fn test_pulse_over_offset_is_legal() {
        let result = StitchedPulseBuilder::new("q0:fl", "cl0.baseband")
            .add_voltage_offset(0.2, 0.2, Some(1e-6))
            .add_pulse_at(200e-9, square(0.5, 100e-9))
            .build();
        assert!(result.is_ok());
    }
}
