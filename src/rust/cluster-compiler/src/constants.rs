// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Hardware constants shared across the compilation stages.

use q1asm::NanoSeconds;

/// Minimum time quantum of the sequence processors. Every instruction start
/// and duration must be an integer multiple of this.
pub const GRID_TIME: NanoSeconds = 4;

/// Sample rate of the arbitrary waveform generators, in samples per second.
pub const SAMPLING_RATE: f64 = 1e9;

/// Total number of waveform samples that fit in one sequencer's memory.
pub const MAX_SAMPLE_SIZE_WAVEFORMS: usize = 16384;

/// Square pulses longer than this are synthesized from repeated `play`
/// instructions of a fixed chunk instead of being sampled whole.
pub const PULSE_STITCHING_DURATION: f64 = 1e-6;

/// `PULSE_STITCHING_DURATION` expressed on the instruction timing grid.
pub const PULSE_STITCHING_DURATION_NS: NanoSeconds = 1_000;

/// Number of offset steps a long ramp is synthesized with, unless the
/// operation specifies its own step count.
pub const DEFAULT_STAIRCASE_NUM_STEPS: usize = 10;

/// Bit width of the `set_awg_offs` immediates.
pub const IMMEDIATE_SZ_OFFSET: u32 = 16;

/// Bit width of the `set_awg_gain` immediates.
pub const IMMEDIATE_SZ_GAIN: u32 = 16;

/// Instruction-count ceilings per module family. Exceeding them does not
/// fail the compilation but is reported, matching instrument behavior of
/// rejecting the upload.
pub const MAX_NUMBER_OF_INSTRUCTIONS_QCM: usize = 16384;
pub const MAX_NUMBER_OF_INSTRUCTIONS_QRM: usize = 12288;
