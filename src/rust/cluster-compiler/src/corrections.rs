// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Signal-conditioning corrections applied after waveform generation.
//!
//! Distortion corrections run a configured filter over the sampled waveform
//! of a port-clock before it enters the waveform table, then clip it.
//! Filters are resolved through an explicit registry injected into the
//! compilation, never by reflective name lookup.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

use crate::{Error, Result};

pub type FilterKwargs = serde_json::Map<String, Value>;

/// Distortion-correction entry as it appears in the hardware config, before
/// completeness validation.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DistortionCorrectionRaw {
    pub filter_func: Option<String>,
    pub input_var_name: Option<String>,
    pub kwargs: Option<FilterKwargs>,
    pub clipping_values: Option<Vec<f64>>,
}

/// A validated distortion correction for one port-clock (or baseband tag).
#[derive(Debug, Clone, PartialEq)]
pub struct DistortionCorrection {
    pub filter_func: String,
    /// Parameter name the waveform array is bound to when the filter is
    /// invoked. Retained for artifact reporting; the registry call binds the
    /// waveform positionally.
    pub input_var_name: String,
    pub kwargs: FilterKwargs,
    pub clipping_values: Option<[f64; 2]>,
}

impl DistortionCorrection {
    /// Validate a raw entry keyed by `key` in the hardware config.
    pub fn validate(key: &str, raw: DistortionCorrectionRaw) -> Result<Self> {
        let (Some(filter_func), Some(input_var_name), Some(kwargs)) =
            (raw.filter_func, raw.input_var_name, raw.kwargs)
        else {
            return Err(Error::MissingFilterParameters {
                key: key.to_string(),
            });
        };
        let clipping_values = match raw.clipping_values {
            None => None,
            Some(values) => {
                let [low, high] = values.as_slice() else {
                    return Err(Error::Config(format!(
                        "clipping_values for '{key}' should contain two values, min and max, \
                         got {values:?}"
                    )));
                };
                Some([*low, *high])
            }
        };
        Ok(DistortionCorrection {
            filter_func,
            input_var_name,
            kwargs,
            clipping_values,
        })
    }
}

/// A pure waveform transform; output must have the same length as the input.
pub trait DistortionFilter: Send + Sync {
    fn apply(&self, samples: &[f64], kwargs: &FilterKwargs) -> Result<Vec<f64>>;
}

/// Explicit mapping from filter identifier to transform.
#[derive(Default)]
pub struct FilterRegistry {
    filters: HashMap<String, Box<dyn DistortionFilter>>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in filters. Currently only
    /// `lfilter`, a direct-form FIR filter taking its coefficients from the
    /// `b` kwarg.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("lfilter", FirFilter);
        registry
    }

    pub fn register<S: Into<String>, F: DistortionFilter + 'static>(
        &mut self,
        name: S,
        filter: F,
    ) {
        self.filters.insert(name.into(), Box::new(filter));
    }

    pub fn get(&self, name: &str) -> Option<&dyn DistortionFilter> {
        self.filters.get(name).map(|f| f.as_ref())
    }
}

/// FIR filter: `y[n] = sum_k b[k] * x[n-k]`. The `a` kwarg, when present,
/// must denote the identity denominator.
pub struct FirFilter;

fn kwarg_coefficients(kwargs: &FilterKwargs, name: &str) -> Result<Vec<f64>> {
    let values = kwargs
        .get(name)
        .ok_or_else(|| Error::Config(format!("FIR filter requires the '{name}' kwarg")))?
        .as_array()
        .ok_or_else(|| Error::Config(format!("FIR filter kwarg '{name}' must be an array")))?;
    values
        .iter()
        .map(|value| {
            value.as_f64().ok_or_else(|| {
                Error::Config(format!(
                    "FIR filter kwarg '{name}' contains a non-numeric entry: {value}"
                ))
            })
        })
        .collect()
}

impl DistortionFilter for FirFilter {
    fn apply(&self, samples: &[f64], kwargs: &FilterKwargs) -> Result<Vec<f64>> {
        if let Some(a) = kwargs.get("a") {
            let identity = a.as_f64() == Some(1.0)
                || a.as_array().is_some_and(|values| {
                    values.len() == 1 && values[0].as_f64() == Some(1.0)
                });
            if !identity {
                return Err(Error::Config(
                    "FIR filter only supports an identity denominator ('a' = 1)".to_string(),
                ));
            }
        }
        let b = kwarg_coefficients(kwargs, "b")?;
        let mut out = vec![0.0; samples.len()];
        for (n, value) in out.iter_mut().enumerate() {
            *value = b
                .iter()
                .enumerate()
                .take(n + 1)
                .map(|(k, bk)| bk * samples[n - k])
                .sum();
        }
        Ok(out)
    }
}

/// Apply the configured correction to one sampled waveform path.
pub fn correct_waveform(
    samples: &[f64],
    correction: &DistortionCorrection,
    registry: &FilterRegistry,
) -> Result<Vec<f64>> {
    let filter = registry.get(&correction.filter_func).ok_or_else(|| {
        Error::Config(format!(
            "no distortion filter registered under '{}'",
            correction.filter_func
        ))
    })?;
    let mut corrected = filter.apply(samples, &correction.kwargs)?;
    if corrected.len() != samples.len() {
        return Err(Error::Config(format!(
            "distortion filter '{}' changed the waveform length from {} to {}",
            correction.filter_func,
            samples.len(),
            corrected.len()
        )));
    }
    if let Some([low, high]) = correction.clipping_values {
        for sample in &mut corrected {
            *sample = sample.clamp(low, high);
        }
    }
    Ok(corrected)
}
