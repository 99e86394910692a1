// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Static per-module-type properties of the cluster hardware.

use serde::Deserialize;

use crate::constants::{MAX_NUMBER_OF_INSTRUCTIONS_QCM, MAX_NUMBER_OF_INSTRUCTIONS_QRM};

pub struct DeviceTraits {
    /// Independent sequencer channels per module.
    pub max_sequencers: usize,
    pub supports_acquisition: bool,
    pub is_rf: bool,
    /// Permitted range of the DC mixer offsets, in volts (symmetric).
    pub mixer_dc_offset_range: f64,
    /// Marker bitmask applied at program start. RF modules use the marker
    /// bits to enable their output paths.
    pub default_marker: u8,
    /// Slot names the hardware config may declare for this module type.
    pub valid_ios: &'static [&'static str],
    pub max_instructions: usize,
}

pub const QCM_TRAITS: DeviceTraits = DeviceTraits {
    max_sequencers: 6,
    supports_acquisition: false,
    is_rf: false,
    mixer_dc_offset_range: 2.5,
    default_marker: 0,
    valid_ios: &[
        "complex_output_0",
        "complex_output_1",
        "real_output_0",
        "real_output_1",
        "real_output_2",
        "real_output_3",
        "digital_output_0",
        "digital_output_1",
        "digital_output_2",
        "digital_output_3",
    ],
    max_instructions: MAX_NUMBER_OF_INSTRUCTIONS_QCM,
};

pub const QRM_TRAITS: DeviceTraits = DeviceTraits {
    max_sequencers: 6,
    supports_acquisition: true,
    is_rf: false,
    mixer_dc_offset_range: 0.5,
    default_marker: 0,
    valid_ios: &[
        "complex_output_0",
        "complex_input_0",
        "real_output_0",
        "real_output_1",
        "real_input_0",
        "real_input_1",
        "digital_output_0",
        "digital_output_1",
        "digital_output_2",
        "digital_output_3",
    ],
    max_instructions: MAX_NUMBER_OF_INSTRUCTIONS_QRM,
};

pub const QCM_RF_TRAITS: DeviceTraits = DeviceTraits {
    max_sequencers: 6,
    supports_acquisition: false,
    is_rf: true,
    mixer_dc_offset_range: 84e-3,
    default_marker: 0b0011,
    valid_ios: &[
        "complex_output_0",
        "complex_output_1",
        "digital_output_0",
        "digital_output_1",
    ],
    max_instructions: MAX_NUMBER_OF_INSTRUCTIONS_QCM,
};

pub const QRM_RF_TRAITS: DeviceTraits = DeviceTraits {
    max_sequencers: 6,
    supports_acquisition: true,
    is_rf: true,
    mixer_dc_offset_range: 84e-3,
    default_marker: 0b0011,
    valid_ios: &[
        "complex_output_0",
        "complex_input_0",
        "digital_output_0",
        "digital_output_1",
    ],
    max_instructions: MAX_NUMBER_OF_INSTRUCTIONS_QRM,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub enum InstrumentType {
    #[serde(rename = "QCM")]
    Qcm,
    #[serde(rename = "QRM")]
    Qrm,
    #[serde(rename = "QCM_RF")]
    QcmRf,
    #[serde(rename = "QRM_RF")]
    QrmRf,
}

impl InstrumentType {
    pub const fn traits(&self) -> &'static DeviceTraits {
        match self {
            InstrumentType::Qcm => &QCM_TRAITS,
            InstrumentType::Qrm => &QRM_TRAITS,
            InstrumentType::QcmRf => &QCM_RF_TRAITS,
            InstrumentType::QrmRf => &QRM_RF_TRAITS,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstrumentType::Qcm => "QCM",
            InstrumentType::Qrm => "QRM",
            InstrumentType::QcmRf => "QCM_RF",
            InstrumentType::QrmRf => "QRM_RF",
        }
    }
}

impl std::str::FromStr for InstrumentType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<InstrumentType, Self::Err> {
        match s {
            "QCM" => Ok(InstrumentType::Qcm),
            "QRM" => Ok(InstrumentType::Qrm),
            "QCM_RF" => Ok(InstrumentType::QcmRf),
            "QRM_RF" => Ok(InstrumentType::QrmRf),
            _ => Err(crate::Error::Config(format!(
                "unsupported instrument_type '{s}'. Supported types are: QCM, QRM, QCM_RF, QRM_RF"
            ))),
        }
    }
}
