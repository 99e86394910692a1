// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

pub mod instructions;
pub mod program;

pub use instructions::{Instruction, Register, WaveIndex};
pub use program::Program;

/// Time in nanoseconds, the unit of all sequencer timing.
pub type NanoSeconds = u64;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error(
        "value {value} for '{param}' is out of range of a {bits}-bit immediate"
    )]
    ImmediateOutOfRange {
        param: &'static str,
        value: i64,
        bits: u32,
    },
    #[error("wait of {duration} ns is shorter than the minimal wait of {min} ns")]
    WaitTooShort { duration: NanoSeconds, min: NanoSeconds },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
