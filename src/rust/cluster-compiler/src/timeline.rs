// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Projection of the schedule onto a single sequencer.
//!
//! Selects the operations addressed to one port-clock pair (digital marker
//! operations match on port alone), pins every start time and duration onto
//! the hardware grid, and validates the result as one linear timeline for
//! code generation.

use q1asm::NanoSeconds;

use crate::hardware_config::SlotMode;
use crate::schedule::{Operation, OperationKind, PortClock, Schedule};
use crate::timing::to_grid_time;
use crate::{Error, Result};

/// One operation pinned to the grid.
#[derive(Debug, Clone)]
pub struct TimelineEntry {
    pub start: NanoSeconds,
    pub duration: NanoSeconds,
    pub operation: Operation,
}

/// The ordered timeline of one sequencer.
#[derive(Debug, Clone)]
pub struct Timeline {
    pub entries: Vec<TimelineEntry>,
    /// Duration of the whole schedule, not just this sequencer's last
    /// operation; every program must span it to keep the cluster
    /// synchronized.
    pub total_duration: NanoSeconds,
}

/// Project the schedule onto the sequencer owning `portclock`.
///
/// Operations are ordered by start time, ties broken by schedule insertion
/// order. Two real-time operations may touch but not overlap; an
/// acquisition runs concurrently with output and is only checked against
/// other acquisitions. Bare voltage offsets occupy no sequencer time.
pub fn project(
    portclock: &PortClock,
    schedule: &Schedule,
    slot_mode: SlotMode,
) -> Result<Timeline> {
    let mut entries = Vec::new();
    for scheduled in &schedule.operations {
        let op = &scheduled.operation;
        let matches = if matches!(op.kind, OperationKind::Marker { .. }) {
            op.port == portclock.port
        } else {
            op.port == portclock.port && op.clock == portclock.clock
        };
        if !matches {
            continue;
        }
        if slot_mode == SlotMode::Real && has_quadrature(op) {
            return Err(Error::ComplexOnRealOutput {
                operation: op.name.clone(),
                portclock: portclock.to_string(),
            });
        }
        let context = format!("start time of '{}'", op.name);
        let start = to_grid_time(scheduled.start_time, &context)?;
        let duration = match &op.kind {
            // Open-ended offsets are resolved by the generator.
            OperationKind::VoltageOffset { duration: None, .. } => 0,
            _ => to_grid_time(op.duration(), &format!("duration of '{}'", op.name))?,
        };
        entries.push(TimelineEntry {
            start,
            duration,
            operation: op.clone(),
        });
    }
    entries.sort_by_key(|entry| entry.start);

    validate_no_overlap(portclock, &entries)?;

    let total_duration = to_grid_time(schedule.total_duration(), "schedule duration")?;
    Ok(Timeline {
        entries,
        total_duration,
    })
}

fn has_quadrature(op: &Operation) -> bool {
    match &op.kind {
        OperationKind::Pulse(shape) => shape.has_quadrature(),
        OperationKind::Stitched(stitch) => stitch.has_quadrature(),
        _ => false,
    }
}

fn validate_no_overlap(portclock: &PortClock, entries: &[TimelineEntry]) -> Result<()> {
    let mut last_output_end: Option<NanoSeconds> = None;
    let mut last_acquisition_end: Option<NanoSeconds> = None;
    for entry in entries {
        let op = &entry.operation;
        if !op.is_real_time_io() {
            continue;
        }
        let lane = if op.is_acquisition() {
            &mut last_acquisition_end
        } else {
            &mut last_output_end
        };
        if let Some(previous_end) = lane
            && entry.start < *previous_end
        {
            return Err(Error::OverlapConflict {
                operation: op.name.clone(),
                portclock: portclock.to_string(),
                start: entry.start,
                previous_end: *previous_end,
            });
        }
        *lane = Some(entry.start + entry.duration);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::PulseShape;
    use num_complex::Complex64;

    fn pulse(name: &str, port: &str, clock: &str, shape: PulseShape) -> Operation {
        Operation {
            name: name.to_string(),
            port: port.to_string(),
            clock: clock.to_string(),
            kind: OperationKind::Pulse(shape),
        }
    }

    fn square(duration: f64) -> PulseShape {
        PulseShape::Square {
            amp: 0.5,
            duration,
        }
    }

    #[test]
    fn test_projection_filters_and_orders() {
        let mut schedule = Schedule::new("test");
        schedule.add_operation(100e-9, pulse("late", "q0:mw", "q0.01", square(40e-9)));
        schedule.add_operation(0.0, pulse("early", "q0:mw", "q0.01", square(40e-9)));
        schedule.add_operation(0.0, pulse("other", "q1:mw", "q1.01", square(40e-9)));

        let portclock = PortClock::new("q0:mw", "q0.01");
        let timeline = project(&portclock, &schedule, SlotMode::Complex).unwrap();
        assert_eq!(timeline.entries.len(), 2);
        assert_eq!(timeline.entries[0].operation.name, "early");
        assert_eq!(timeline.entries[1].start, 100);
        assert_eq!(timeline.total_duration, 140);
    }

    #[test]
    fn test_marker_matches_on_port_alone() {
        let mut schedule = Schedule::new("test");
        schedule.add_operation(
            0.0,
            Operation {
                name: "trigger".to_string(),
                port: "q0:mw".to_string(),
                clock: String::new(),
                kind: OperationKind::Marker {
                    mask: 0b0001,
                    duration: 40e-9,
                },
            },
        );
        schedule.add_operation(40e-9, pulse("pulse", "q0:mw", "q0.01", square(40e-9)));
        let portclock = PortClock::new("q0:mw", "q0.01");
        let timeline = project(&portclock, &schedule, SlotMode::Complex).unwrap();
        assert_eq!(timeline.entries.len(), 2);
    }

    #[test]
    fn test_adjacent_operations_are_legal() {
        let mut schedule = Schedule::new("test");
        schedule.add_operation(0.0, pulse("first", "q0:mw", "q0.01", square(40e-9)));
        schedule.add_operation(40e-9, pulse("second", "q0:mw", "q0.01", square(40e-9)));
        let portclock = PortClock::new("q0:mw", "q0.01");
        assert!(project(&portclock, &schedule, SlotMode::Complex).is_ok());
    }

    #[test]
    fn test_overlap_is_rejected() {
        let mut schedule = Schedule::new("test");
        schedule.add_operation(0.0, pulse("first", "q0:mw", "q0.01", square(40e-9)));
        schedule.add_operation(36e-9, pulse("second", "q0:mw", "q0.01", square(40e-9)));
        let portclock = PortClock::new("q0:mw", "q0.01");
        assert!(matches!(
            project(&portclock, &schedule, SlotMode::Complex),
            Err(Error::OverlapConflict {
                start: 36,
                previous_end: 40,
                ..
            })
        ));
    }

    #[test]
    fn test_acquisition_may_overlap_output() {
        let mut schedule = Schedule::new("test");
        schedule.add_operation(0.0, pulse("readout", "q0:res", "q0.ro", square(400e-9)));
        schedule.add_operation(
            100e-9,
            Operation {
                name: "acquire".to_string(),
                port: "q0:res".to_string(),
                clock: "q0.ro".to_string(),
                kind: OperationKind::Acquisition {
                    channel: 0,
                    bin_index: 0,
                    duration: 200e-9,
                },
            },
        );
        let portclock = PortClock::new("q0:res", "q0.ro");
        assert!(project(&portclock, &schedule, SlotMode::Complex).is_ok());
    }

    #[test]
    fn test_quadrature_on_real_output() {
        let mut schedule = Schedule::new("test");
        schedule.add_operation(
            0.0,
            pulse(
                "iq",
                "q0:fl",
                "cl0.baseband",
                PulseShape::Numerical {
                    samples: vec![Complex64::new(0.1, 0.2); 4],
                    duration: 4e-9,
                },
            ),
        );
        let portclock = PortClock::new("q0:fl", "cl0.baseband");
        assert!(matches!(
            project(&portclock, &schedule, SlotMode::Real),
            Err(Error::ComplexOnRealOutput { .. })
        ));
        assert!(project(&portclock, &schedule, SlotMode::Complex).is_ok());
    }

    #[test]
    fn test_misaligned_start_rejected() {
        let mut schedule = Schedule::new("test");
        schedule.add_operation(5e-9, pulse("off-grid", "q0:mw", "q0.01", square(40e-9)));
        let portclock = PortClock::new("q0:mw", "q0.01");
        assert!(matches!(
            project(&portclock, &schedule, SlotMode::Complex),
            Err(Error::GridAlignment { .. })
        ));
    }
}
