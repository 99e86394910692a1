// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Conversion between schedule time (seconds) and the instruction grid.

use q1asm::NanoSeconds;

use crate::constants::GRID_TIME;
use crate::{Error, Result};

/// Tolerance, in nanoseconds, below which a time is considered to lie on an
/// integer nanosecond. Absorbs the float noise of repeated additions of
/// schedule times.
const ROUNDING_TOLERANCE_NS: f64 = 1e-4;

/// Convert a time in seconds to nanoseconds, requiring it to be a
/// non-negative integer multiple of the hardware grid.
///
/// `context` names the offending operation or configuration entry in the
/// error.
pub fn to_grid_time(time: f64, context: &str) -> Result<NanoSeconds> {
    let time_ns = time * 1e9;
    let rounded = time_ns.round();
    if (time_ns - rounded).abs() > ROUNDING_TOLERANCE_NS
        || rounded < 0.0
        || (rounded as u64) % GRID_TIME != 0
    {
        return Err(Error::GridAlignment {
            value: time,
            context: context.to_string(),
            grid_time_ns: GRID_TIME,
        });
    }
    Ok(rounded as NanoSeconds)
}

/// Number of AWG samples covering a duration at the given sampling rate.
pub fn length_to_samples(duration: f64, sampling_rate: f64) -> usize {
    (duration * sampling_rate).round() as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_grid_time() {
        assert_eq!(to_grid_time(0.0, "t").unwrap(), 0);
        assert_eq!(to_grid_time(8e-9, "t").unwrap(), 8);
        assert_eq!(to_grid_time(1e-6, "t").unwrap(), 1000);
        // 120 ns reached through float accumulation
        assert_eq!(to_grid_time(3.0 * 40e-9, "t").unwrap(), 120);
    }

    #[test]
    fn test_to_grid_time_rejects_off_grid() {
        assert!(matches!(
            to_grid_time(5e-9, "t"),
            Err(Error::GridAlignment { .. })
        ));
        assert!(matches!(
            to_grid_time(4e-9 + 1e-9, "t"),
            Err(Error::GridAlignment { .. })
        ));
        assert!(matches!(
            to_grid_time(2.5e-9, "t"),
            Err(Error::GridAlignment { .. })
        ));
    }

    #[test]
    fn test_length_to_samples() {
        assert_eq!(length_to_samples(0.0, 1e9), 0);
        assert_eq!(length_to_samples(1e-6, 1e9), 1000);
        assert_eq!(length_to_samples(12e-9, 1e9), 12);
    }
}
