// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! The subset of the sequence-processor instruction set used by the compiler.
//!
//! Real-time instructions carry their duration as an immediate; the program
//! builder accounts for it when tracking elapsed time.

use std::fmt;

use crate::{Error, NanoSeconds, Result};

/// Index into a sequencer's waveform table.
pub type WaveIndex = u32;

/// Largest immediate accepted by `wait`, `play` and `acquire`.
pub const MAX_WAIT_TIME: NanoSeconds = 65532;

/// Shortest representable real-time duration.
pub const MIN_WAIT_TIME: NanoSeconds = 4;

/// A sequence-processor register, rendered as `R<n>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Register(pub u8);

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "R{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    /// Drive the marker outputs with the given bitmask.
    SetMarker { mask: u8 },
    /// Block until all sequencers in the cluster reach their sync point.
    WaitSync { duration: NanoSeconds },
    /// Latch previously set offset/gain/marker parameters onto the outputs.
    UpdateParameters { duration: NanoSeconds },
    /// Reset the NCO phase.
    ResetPhase,
    Wait { duration: NanoSeconds },
    Play {
        index_path0: WaveIndex,
        index_path1: WaveIndex,
        duration: NanoSeconds,
    },
    SetAwgOffset { path0: i32, path1: i32 },
    SetAwgGain { path0: i32, path1: i32 },
    Acquire {
        channel: u32,
        bin_index: u32,
        duration: NanoSeconds,
    },
    Move { value: u32, register: Register },
    Loop { register: Register, label: String },
    Stop,
}

impl Instruction {
    /// Real-time duration of the instruction, zero for classical ones.
    pub fn duration(&self) -> NanoSeconds {
        match self {
            Instruction::WaitSync { duration }
            | Instruction::UpdateParameters { duration }
            | Instruction::Wait { duration }
            | Instruction::Play { duration, .. }
            | Instruction::Acquire { duration, .. } => *duration,
            _ => 0,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::SetMarker { mask } => write!(f, "set_mrk {mask}"),
            Instruction::WaitSync { duration } => write!(f, "wait_sync {duration}"),
            Instruction::UpdateParameters { duration } => write!(f, "upd_param {duration}"),
            Instruction::ResetPhase => write!(f, "reset_ph"),
            Instruction::Wait { duration } => write!(f, "wait {duration}"),
            Instruction::Play {
                index_path0,
                index_path1,
                duration,
            } => write!(f, "play {index_path0},{index_path1},{duration}"),
            Instruction::SetAwgOffset { path0, path1 } => {
                write!(f, "set_awg_offs {path0},{path1}")
            }
            Instruction::SetAwgGain { path0, path1 } => {
                write!(f, "set_awg_gain {path0},{path1}")
            }
            Instruction::Acquire {
                channel,
                bin_index,
                duration,
            } => write!(f, "acquire {channel},{bin_index},{duration}"),
            Instruction::Move { value, register } => write!(f, "move {value},{register}"),
            Instruction::Loop { register, label } => write!(f, "loop {register},@{label}"),
            Instruction::Stop => write!(f, "stop"),
        }
    }
}

/// Convert a value from the normalised range [-1.0, 1.0] to a signed
/// immediate of the given bit width.
///
/// Offsets and gains are expressed in the normalised range by the schedule
/// and expanded to hardware units here.
pub fn expand_from_normalised_range(value: f64, bits: u32, param: &'static str) -> Result<i32> {
    let half_range = (1i64 << (bits - 1)) as f64;
    if !(-1.0..=1.0).contains(&value) {
        return Err(Error::ImmediateOutOfRange {
            param,
            value: (value * half_range) as i64,
            bits,
        });
    }
    // Full negative scale is representable, full positive scale saturates
    // one code below.
    let immediate = (value * half_range) as i64;
    let immediate = immediate.min(half_range as i64 - 1);
    Ok(immediate as i32)
}
