// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Code generation: one sequencer's projected timeline becomes an
//! instruction stream plus a waveform table.
//!
//! The timeline is first expanded into a flat list of timed events (plays,
//! parameter changes, acquisitions), then emitted linearly with wait fills.
//! Long square pulses are chunked into repeated plays and long ramps become
//! offset staircases, so neither ever enters the waveform memory whole.

use anyhow::anyhow;
use indexmap::IndexMap;
use q1asm::NanoSeconds;
use q1asm::instructions::{
    Instruction, Register, WaveIndex, expand_from_normalised_range,
};
use q1asm::program::Program;

use crate::allocator::AllocatedSequencer;
use crate::constants::{
    DEFAULT_STAIRCASE_NUM_STEPS, GRID_TIME, IMMEDIATE_SZ_GAIN, IMMEDIATE_SZ_OFFSET,
    PULSE_STITCHING_DURATION_NS,
};
use crate::device_traits::InstrumentType;
use crate::hardware_config::SlotMode;
use crate::schedule::{Operation, OperationKind, PulseShape, StitchElement};
use crate::timeline::Timeline;
use crate::timing::to_grid_time;
use crate::waveform::{WaveformSignature, WaveformTable};
use crate::{Error, Result};

/// The compiled output of one sequencer, before corrections and emission.
#[derive(Debug)]
pub struct GeneratedProgram {
    pub program: Program,
    pub waveforms: WaveformTable,
    /// Acquisition channel to number of bins used.
    pub acquisitions: IndexMap<u32, u32>,
}

/// Timed events of the loop body. Parameter events take no sequencer time;
/// real-time events occupy it until their truncated post-duration elapses.
#[derive(Debug)]
enum Event {
    Play {
        index_path0: WaveIndex,
        index_path1: WaveIndex,
        duration: NanoSeconds,
    },
    Acquire {
        channel: u32,
        bin_index: u32,
        duration: NanoSeconds,
    },
    SetOffset {
        path0: i32,
        path1: i32,
    },
    SetMarker {
        mask: u8,
    },
}

impl Event {
    /// Parameter events sort before real-time events at the same timestamp
    /// so they are latched by the play/acquire issued there.
    fn rank(&self) -> u8 {
        match self {
            Event::SetOffset { .. } | Event::SetMarker { .. } => 0,
            Event::Play { .. } | Event::Acquire { .. } => 1,
        }
    }
}

pub fn generate(
    sequencer: &AllocatedSequencer,
    timeline: &Timeline,
    repetitions: u64,
    latency_ns: NanoSeconds,
) -> Result<GeneratedProgram> {
    let traits = sequencer.instrument_type.traits();
    let portclock = sequencer.portclock.to_string();

    if !traits.supports_acquisition
        && timeline
            .entries
            .iter()
            .any(|entry| entry.operation.is_acquisition())
    {
        return Err(Error::Config(format!(
            "{} ({}) does not support acquisitions, but the schedule requires one on {portclock}",
            sequencer.module,
            sequencer.instrument_type.as_str()
        )));
    }
    if sequencer.config.instruction_generated_pulses_enabled
        && timeline
            .entries
            .iter()
            .any(|entry| matches!(entry.operation.kind, OperationKind::Stitched(_)))
    {
        return Err(Error::Config(format!(
            "instruction_generated_pulses_enabled is set for {portclock}, which cannot be \
             combined with stitched pulses; remove the legacy flag"
        )));
    }

    let mut table = WaveformTable::new(portclock.clone());
    let mut events: Vec<(NanoSeconds, Event)> = Vec::new();
    let mut acquisitions: IndexMap<u32, u32> = IndexMap::new();
    for entry in &timeline.entries {
        expand_operation(
            entry.start,
            entry.duration,
            &entry.operation,
            &portclock,
            traits.default_marker,
            timeline.total_duration,
            &mut table,
            &mut events,
            &mut acquisitions,
        )?;
    }
    events.sort_by_key(|(time, event)| (*time, event.rank()));

    let mut program = Program::new();
    program.emit_with_comment(
        Instruction::SetMarker {
            mask: traits.default_marker,
        },
        "set markers to their default state",
    );
    program.emit_with_comment(
        Instruction::WaitSync {
            duration: GRID_TIME,
        },
        "align sequencers across the cluster",
    );
    let config = &sequencer.config;
    if config.init_offset_awg_path_0 != 0.0 || config.init_offset_awg_path_1 != 0.0 {
        program.emit_with_comment(
            Instruction::SetAwgOffset {
                path0: expand_from_normalised_range(
                    config.init_offset_awg_path_0,
                    IMMEDIATE_SZ_OFFSET,
                    "set_awg_offs",
                )?,
                path1: expand_from_normalised_range(
                    config.init_offset_awg_path_1,
                    IMMEDIATE_SZ_OFFSET,
                    "set_awg_offs",
                )?,
            },
            "initial output offsets",
        );
    }
    if config.init_gain_awg_path_0 != 1.0 || config.init_gain_awg_path_1 != 1.0 {
        program.emit_with_comment(
            Instruction::SetAwgGain {
                path0: expand_from_normalised_range(
                    config.init_gain_awg_path_0,
                    IMMEDIATE_SZ_GAIN,
                    "set_awg_gain",
                )?,
                path1: expand_from_normalised_range(
                    config.init_gain_awg_path_1,
                    IMMEDIATE_SZ_GAIN,
                    "set_awg_gain",
                )?,
            },
            "initial path gains",
        );
    }
    program.emit(Instruction::UpdateParameters {
        duration: GRID_TIME,
    });
    if latency_ns > 0 {
        program.auto_wait_with_comment(latency_ns, Some("latency correction"))?;
    }
    let repetitions = u32::try_from(repetitions)
        .map_err(|_| Error::Config(format!("repetition count {repetitions} exceeds u32")))?;
    program.emit(Instruction::Move {
        value: repetitions,
        register: Register(0),
    });
    program.emit_labeled("start", Instruction::ResetPhase);
    program.emit(Instruction::UpdateParameters {
        duration: GRID_TIME,
    });

    emit_body(&mut program, &events, timeline.total_duration, sequencer)?;

    program.emit(Instruction::Loop {
        register: Register(0),
        label: "start".to_string(),
    });
    program.emit(Instruction::Stop);

    if program.num_instructions() > sequencer.max_instructions {
        log::warn!(
            "program for {portclock} counts {} instructions, exceeding the {} supported \
             by {} ({}); the upload will be rejected by the instrument",
            program.num_instructions(),
            sequencer.max_instructions,
            sequencer.module,
            sequencer.instrument_type.as_str()
        );
    }
    Ok(GeneratedProgram {
        program,
        waveforms: table,
        acquisitions,
    })
}

fn emit_body(
    program: &mut Program,
    events: &[(NanoSeconds, Event)],
    total: NanoSeconds,
    sequencer: &AllocatedSequencer,
) -> Result<()> {
    let debug_markers = sequencer.slot.marker_debug_mode_enable;
    let default_marker = sequencer.instrument_type.traits().default_marker;
    let body_start = program.elapsed_time();
    for (i, (time, event)) in events.iter().enumerate() {
        let cursor = program.elapsed_time() - body_start;
        if *time > cursor {
            program.auto_wait(*time - cursor)?;
        }
        // Concurrent real-time issue slots serialize: an event overtaken by
        // the previous instruction issues one grid step later.
        let issue = (program.elapsed_time() - body_start).max(*time);
        let next_time = events[i + 1..]
            .iter()
            .map(|(t, _)| *t)
            .find(|t| *t > *time);
        match event {
            Event::Play {
                index_path0,
                index_path1,
                duration,
            } => {
                let post = post_duration(*time, *duration, issue, next_time);
                if debug_markers {
                    program.emit(Instruction::SetMarker {
                        mask: debug_marker(sequencer, false),
                    });
                }
                program.emit(Instruction::Play {
                    index_path0: *index_path0,
                    index_path1: *index_path1,
                    duration: post,
                });
                if debug_markers {
                    program.emit(Instruction::SetMarker {
                        mask: default_marker,
                    });
                    program.emit(Instruction::UpdateParameters {
                        duration: GRID_TIME,
                    });
                }
            }
            Event::Acquire {
                channel,
                bin_index,
                duration,
            } => {
                let post = post_duration(*time, *duration, issue, next_time);
                if debug_markers {
                    program.emit(Instruction::SetMarker {
                        mask: debug_marker(sequencer, true),
                    });
                }
                program.emit(Instruction::Acquire {
                    channel: *channel,
                    bin_index: *bin_index,
                    duration: post,
                });
                if debug_markers {
                    program.emit(Instruction::SetMarker {
                        mask: default_marker,
                    });
                    program.emit(Instruction::UpdateParameters {
                        duration: GRID_TIME,
                    });
                }
            }
            Event::SetOffset { path0, path1 } => {
                program.emit(Instruction::SetAwgOffset {
                    path0: *path0,
                    path1: *path1,
                });
                emit_latch(program, events, i, *time, total);
            }
            Event::SetMarker { mask } => {
                program.emit(Instruction::SetMarker { mask: *mask });
                emit_latch(program, events, i, *time, total);
            }
        }
    }
    let cursor = program.elapsed_time() - body_start;
    if cursor > total {
        return Err(anyhow!(
            "generated program for {} runs {} ns past the schedule end",
            sequencer.portclock,
            cursor - total
        )
        .into());
    }
    program.auto_wait(total - cursor)?;
    Ok(())
}

/// How long a real-time instruction blocks before the next one issues: up to
/// its nominal duration, shortened when another event is due earlier.
fn post_duration(
    time: NanoSeconds,
    duration: NanoSeconds,
    issue: NanoSeconds,
    next_time: Option<NanoSeconds>,
) -> NanoSeconds {
    let target_end = time + duration;
    let until = match next_time {
        Some(next) if next < target_end => next,
        _ => target_end,
    };
    until.saturating_sub(issue).max(GRID_TIME)
}

/// Marker bitmask raised around a play or acquire when marker debug mode is
/// enabled on the slot. Baseband modules raise the bits of the driven
/// outputs; RF modules keep their path-enable bits high and raise the bit of
/// the driven output shifted past them.
fn debug_marker(sequencer: &AllocatedSequencer, is_acquisition: bool) -> u8 {
    let slot = &sequencer.slot.id;
    match sequencer.instrument_type {
        InstrumentType::Qcm => match slot.mode {
            SlotMode::Complex => 0b0011 << (2 * slot.index),
            _ => 1 << slot.index,
        },
        InstrumentType::Qrm => {
            if is_acquisition {
                0b1100
            } else {
                0b0011
            }
        }
        InstrumentType::QcmRf => {
            let traits = sequencer.instrument_type.traits();
            (1 << (slot.index + 2)) | traits.default_marker
        }
        InstrumentType::QrmRf => {
            if is_acquisition {
                0b1011
            } else {
                0b0111
            }
        }
    }
}

/// Latch a parameter change. Skipped when a following event at the same
/// timestamp latches it implicitly, or when the schedule has no room left.
fn emit_latch(
    program: &mut Program,
    events: &[(NanoSeconds, Event)],
    index: usize,
    time: NanoSeconds,
    total: NanoSeconds,
) {
    let deferred = events
        .get(index + 1)
        .is_some_and(|(next_time, _)| *next_time == time);
    if !deferred && time + GRID_TIME <= total {
        program.emit(Instruction::UpdateParameters {
            duration: GRID_TIME,
        });
    }
}

#[allow(clippy::too_many_arguments)]
fn expand_operation(
    start: NanoSeconds,
    duration: NanoSeconds,
    op: &Operation,
    portclock: &str,
    default_marker: u8,
    total: NanoSeconds,
    table: &mut WaveformTable,
    events: &mut Vec<(NanoSeconds, Event)>,
    acquisitions: &mut IndexMap<u32, u32>,
) -> Result<()> {
    match &op.kind {
        OperationKind::Pulse(shape) => {
            expand_pulse(start, duration, shape, &op.name, portclock, table, events)
        }
        OperationKind::VoltageOffset {
            path0,
            path1,
            duration: hold,
        } => {
            events.push((start, offset_event(*path0, *path1)?));
            let release = match hold {
                Some(_) => start + duration,
                None => total,
            };
            events.push((release, Event::SetOffset { path0: 0, path1: 0 }));
            Ok(())
        }
        OperationKind::Acquisition {
            channel, bin_index, ..
        } => {
            let bins = acquisitions.entry(*channel).or_insert(0);
            *bins = (*bins).max(bin_index + 1);
            events.push((
                start,
                Event::Acquire {
                    channel: *channel,
                    bin_index: *bin_index,
                    duration,
                },
            ));
            Ok(())
        }
        OperationKind::Marker { mask, .. } => {
            events.push((start, Event::SetMarker { mask: *mask }));
            events.push((
                start + duration,
                Event::SetMarker {
                    mask: default_marker,
                },
            ));
            Ok(())
        }
        OperationKind::Stitched(stitch) => {
            let mut open_offset = false;
            for (rel_time, element) in &stitch.elements {
                let context = format!("element of '{}'", op.name);
                let element_start = start + to_grid_time(*rel_time, &context)?;
                match element {
                    StitchElement::Pulse(shape) => {
                        let pulse_duration = to_grid_time(shape.duration(), &context)?;
                        expand_pulse(
                            element_start,
                            pulse_duration,
                            shape,
                            &op.name,
                            portclock,
                            table,
                            events,
                        )?;
                    }
                    StitchElement::Offset {
                        path0,
                        path1,
                        duration: hold,
                    } => {
                        events.push((element_start, offset_event(*path0, *path1)?));
                        match hold {
                            Some(hold) => {
                                let hold_ns = to_grid_time(*hold, &context)?;
                                events.push((
                                    element_start + hold_ns,
                                    Event::SetOffset { path0: 0, path1: 0 },
                                ));
                            }
                            None => open_offset = true,
                        }
                    }
                }
            }
            if open_offset {
                // Open-ended offsets release when the stitch ends.
                events.push((start + duration, Event::SetOffset { path0: 0, path1: 0 }));
            }
            Ok(())
        }
    }
}

fn offset_event(path0: f64, path1: f64) -> Result<Event> {
    Ok(Event::SetOffset {
        path0: expand_from_normalised_range(path0, IMMEDIATE_SZ_OFFSET, "set_awg_offs")?,
        path1: expand_from_normalised_range(path1, IMMEDIATE_SZ_OFFSET, "set_awg_offs")?,
    })
}

fn expand_pulse(
    start: NanoSeconds,
    duration: NanoSeconds,
    shape: &PulseShape,
    op_name: &str,
    portclock: &str,
    table: &mut WaveformTable,
    events: &mut Vec<(NanoSeconds, Event)>,
) -> Result<()> {
    if duration == 0 {
        return Err(Error::UnsupportedShape {
            operation: op_name.to_string(),
            portclock: portclock.to_string(),
        });
    }
    match shape {
        PulseShape::Square { amp, .. } if duration > PULSE_STITCHING_DURATION_NS => {
            expand_square_chunks(start, duration, *amp, table, events)
        }
        PulseShape::Ramp { amp, num_steps, .. } if duration > PULSE_STITCHING_DURATION_NS => {
            expand_staircase(start, duration, *amp, *num_steps, op_name, events)
        }
        _ => {
            let signature = WaveformSignature::from_shape(shape, duration);
            let (index_path0, index_path1) = table.get_or_insert(signature, shape)?;
            events.push((
                start,
                Event::Play {
                    index_path0,
                    index_path1,
                    duration,
                },
            ));
            Ok(())
        }
    }
}

/// A long square pulse as repeated plays of one fixed-size chunk plus a
/// remainder chunk, deduplicated like any other waveform.
fn expand_square_chunks(
    start: NanoSeconds,
    duration: NanoSeconds,
    amp: f64,
    table: &mut WaveformTable,
    events: &mut Vec<(NanoSeconds, Event)>,
) -> Result<()> {
    let chunk = PULSE_STITCHING_DURATION_NS;
    let full_chunks = duration / chunk;
    let remainder = duration % chunk;

    let chunk_shape = PulseShape::Square {
        amp,
        duration: chunk as f64 * 1e-9,
    };
    let chunk_signature = WaveformSignature::from_shape(&chunk_shape, chunk);
    let (index_path0, index_path1) = table.get_or_insert(chunk_signature, &chunk_shape)?;
    for k in 0..full_chunks {
        events.push((
            start + k * chunk,
            Event::Play {
                index_path0,
                index_path1,
                duration: chunk,
            },
        ));
    }
    if remainder > 0 {
        let rem_shape = PulseShape::Square {
            amp,
            duration: remainder as f64 * 1e-9,
        };
        let rem_signature = WaveformSignature::from_shape(&rem_shape, remainder);
        let (index_path0, index_path1) = table.get_or_insert(rem_signature, &rem_shape)?;
        events.push((
            start + full_chunks * chunk,
            Event::Play {
                index_path0,
                index_path1,
                duration: remainder,
            },
        ));
    }
    Ok(())
}

/// A long ramp as a staircase of offset levels, ending back at zero.
fn expand_staircase(
    start: NanoSeconds,
    duration: NanoSeconds,
    amp: f64,
    num_steps: Option<usize>,
    op_name: &str,
    events: &mut Vec<(NanoSeconds, Event)>,
) -> Result<()> {
    let num_steps = num_steps.unwrap_or(DEFAULT_STAIRCASE_NUM_STEPS).max(1) as NanoSeconds;
    let step = duration / num_steps;
    if step * num_steps != duration || step % GRID_TIME != 0 {
        return Err(Error::GridAlignment {
            value: duration as f64 * 1e-9,
            context: format!("staircase step duration of '{op_name}'"),
            grid_time_ns: GRID_TIME,
        });
    }
    for k in 0..num_steps {
        let level = amp * (k + 1) as f64 / num_steps as f64;
        events.push((
            start + k * step,
            Event::SetOffset {
                path0: expand_from_normalised_range(level, IMMEDIATE_SZ_OFFSET, "set_awg_offs")?,
                path1: 0,
            },
        ));
    }
    events.push((start + duration, Event::SetOffset { path0: 0, path1: 0 }));
    Ok(())
}
