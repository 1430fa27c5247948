//! Per-process CPU and memory sampling.

use gamectl_core::{ResourceSnapshot, now_ms};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// Stateful sampler over the running instances.
///
/// Kept alive across ticks because CPU percentages are deltas between
/// consecutive refreshes; a fresh `System` per tick would always read 0.
pub struct ResourceSampler {
    system: System,
}

impl ResourceSampler {
    #[must_use]
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }

    /// Sample the given `(instance_id, pid)` pairs. PIDs that disappeared
    /// between the registry read and the refresh are skipped; the exit-watch
    /// handles their lifecycle.
    pub fn sample(&mut self, targets: &[(String, u32)]) -> Vec<(String, ResourceSnapshot)> {
        let pids: Vec<Pid> = targets.iter().map(|(_, pid)| Pid::from_u32(*pid)).collect();
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&pids),
            true,
            ProcessRefreshKind::nothing().with_cpu().with_memory(),
        );

        targets
            .iter()
            .filter_map(|(id, pid)| {
                self.system.process(Pid::from_u32(*pid)).map(|process| {
                    (
                        id.clone(),
                        ResourceSnapshot {
                            cpu_percent: process.cpu_usage(),
                            memory_bytes: process.memory(),
                            sampled_at_ms: now_ms(),
                        },
                    )
                })
            })
            .collect()
    }
}

impl Default for ResourceSampler {
    fn default() -> Self {
        Self::new()
    }
}
