// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Assignment of the schedule's port-clock pairs to physical sequencers.
//!
//! Sequencer indices are deterministic: within a module, declared port-clocks
//! are visited in slot-then-list order and each one the schedule actually
//! uses claims the next free index. Re-running the same schedule against the
//! same config therefore always produces the same hardware mapping.

use crate::hardware_config::{HardwareConfig, OutputSlot, PortClockConfig};
use crate::schedule::PortClock;
use crate::{Error, Result};

/// One sequencer claimed by the schedule, with everything later stages need
/// to know about where it lives.
#[derive(Debug, Clone)]
pub struct AllocatedSequencer {
    pub portclock: PortClock,
    pub cluster: String,
    pub module: String,
    pub instrument_type: crate::device_traits::InstrumentType,
    /// Index of the sequencer within its module.
    pub seq_index: usize,
    pub slot: OutputSlot,
    pub config: PortClockConfig,
    /// Whether the compiled program is also written to disk, after applying
    /// the module-level override.
    pub sequence_to_file: bool,
    /// Module-level instruction ceiling for the generated program.
    pub max_instructions: usize,
}

/// Allocate a sequencer for every port-clock the schedule uses, returned in
/// the schedule's first-use order.
pub fn allocate(
    used_portclocks: &[PortClock],
    config: &HardwareConfig,
) -> Result<Vec<AllocatedSequencer>> {
    let mut allocations: Vec<AllocatedSequencer> = Vec::with_capacity(used_portclocks.len());

    for cluster in config.clusters.values() {
        for module in cluster.modules.values() {
            let traits = module.instrument_type.traits();
            let mut used_in_module = 0;
            for (slot, pc) in module.declared_portclocks() {
                if !used_portclocks.contains(&pc.portclock) {
                    continue;
                }
                if used_in_module >= traits.max_sequencers {
                    return Err(Error::TooManySequencers {
                        module: module.name.clone(),
                        count: used_in_module + 1,
                        max: traits.max_sequencers,
                    });
                }
                allocations.push(AllocatedSequencer {
                    portclock: pc.portclock.clone(),
                    cluster: cluster.name.clone(),
                    module: module.name.clone(),
                    instrument_type: module.instrument_type,
                    seq_index: used_in_module,
                    slot: slot.clone(),
                    config: pc.clone(),
                    sequence_to_file: module.sequence_to_file.unwrap_or(cluster.sequence_to_file),
                    max_instructions: traits.max_instructions,
                });
                used_in_module += 1;
            }
        }
    }

    // Cross-module ambiguity was already rejected when the config was
    // validated, so each used pair maps to at most one allocation here.
    let mut ordered = Vec::with_capacity(used_portclocks.len());
    for portclock in used_portclocks {
        let allocation = allocations
            .iter()
            .find(|a| &a.portclock == portclock)
            .ok_or_else(|| Error::PortClockNotFound {
                portclock: portclock.to_string(),
            })?;
        ordered.push(allocation.clone());
    }
    Ok(ordered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn two_module_config() -> HardwareConfig {
        let doc = json!({
            "cluster0": {
                "instrument_type": "Cluster",
                "cluster0_module1": {
                    "instrument_type": "QCM",
                    "sequence_to_file": false,
                    "complex_output_0": {
                        "portclock_configs": [
                            {"port": "q0:mw", "clock": "q0.01"},
                            {"port": "q1:mw", "clock": "q1.01"}
                        ]
                    },
                    "complex_output_1": {
                        "portclock_configs": [
                            {"port": "q2:mw", "clock": "q2.01"}
                        ]
                    }
                },
                "cluster0_module3": {
                    "instrument_type": "QRM",
                    "complex_input_0": {
                        "portclock_configs": [
                            {"port": "q0:res", "clock": "q0.ro"}
                        ]
                    }
                }
            }
        });
        HardwareConfig::from_value(&doc).unwrap()
    }

    #[test]
    fn test_indices_follow_declaration_order_of_used_pairs() {
        let config = two_module_config();
        // q1:mw is used but q0:mw is not, so q1:mw claims index 0.
        let used = vec![
            PortClock::new("q2:mw", "q2.01"),
            PortClock::new("q1:mw", "q1.01"),
        ];
        let allocations = allocate(&used, &config).unwrap();
        assert_eq!(allocations.len(), 2);
        // Returned in schedule order, indexed in declaration order.
        assert_eq!(allocations[0].portclock, PortClock::new("q2:mw", "q2.01"));
        assert_eq!(allocations[0].seq_index, 1);
        assert_eq!(allocations[1].portclock, PortClock::new("q1:mw", "q1.01"));
        assert_eq!(allocations[1].seq_index, 0);
    }

    #[test]
    fn test_unknown_portclock() {
        let config = two_module_config();
        let used = vec![PortClock::new("q9:mw", "q9.01")];
        assert!(matches!(
            allocate(&used, &config),
            Err(Error::PortClockNotFound { portclock }) if portclock == "q9:mw-q9.01"
        ));
    }

    #[test]
    fn test_module_override_of_sequence_to_file() {
        let config = two_module_config();
        let used = vec![
            PortClock::new("q0:mw", "q0.01"),
            PortClock::new("q0:res", "q0.ro"),
        ];
        let allocations = allocate(&used, &config).unwrap();
        assert!(!allocations[0].sequence_to_file);
        assert!(allocations[1].sequence_to_file);
    }

    #[test]
    fn test_indices_are_per_module() {
        let config = two_module_config();
        let used = vec![
            PortClock::new("q0:mw", "q0.01"),
            PortClock::new("q0:res", "q0.ro"),
        ];
        let allocations = allocate(&used, &config).unwrap();
        assert_eq!(allocations[0].seq_index, 0);
        assert_eq!(allocations[1].seq_index, 0);
        assert_eq!(allocations[1].module, "cluster0_module3");
    }
}
