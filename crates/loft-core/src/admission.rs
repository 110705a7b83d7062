use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use loft_domain::{EnvironmentId, ResourceLimits};
use sysinfo::{Disks, System};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::OrchError;

/// Point-in-time view of the host, refreshed on a timer. Admission reads
/// this cache only, so request latency never depends on the OS.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostSnapshot {
    pub total_cpus: f64,
    pub cpu_used_percent: f64,
    pub memory_total_mib: f64,
    pub memory_used_percent: f64,
    pub disk_used_percent: f64,
}

#[derive(Debug, Default)]
struct Committed {
    by_environment: HashMap<EnvironmentId, ResourceLimits>,
}

impl Committed {
    fn totals(&self) -> (f64, f64) {
        let cpu = self.by_environment.values().map(|l| l.cpu_cores).sum();
        let mem = self.by_environment.values().map(|l| l.memory_mib as f64).sum();
        (cpu, mem)
    }
}

/// Admission control: a create is admitted iff the committed template limits
/// of all live environments plus the request stay under the configured share
/// of the host, and the host's disk is under its cap.
pub struct ResourceGuard {
    cpu_cap_pct: f64,
    mem_cap_pct: f64,
    disk_cap_pct: f64,
    snapshot: Mutex<HostSnapshot>,
    committed: Mutex<Committed>,
}

impl ResourceGuard {
    pub fn new(cpu_cap_pct: f64, mem_cap_pct: f64, disk_cap_pct: f64) -> Self {
        Self {
            cpu_cap_pct,
            mem_cap_pct,
            disk_cap_pct,
            snapshot: Mutex::new(HostSnapshot::default()),
            committed: Mutex::new(Committed::default()),
        }
    }

    /// Seed the committed ledger from the repository at startup.
    pub fn warm(&self, live: impl IntoIterator<Item = (EnvironmentId, ResourceLimits)>) {
        let mut committed = self.committed.lock().expect("committed ledger poisoned");
        for (id, limits) in live {
            committed.by_environment.insert(id, limits);
        }
    }

    /// Replace the cached host view. Called by the refresh task and by tests.
    pub fn update_snapshot(&self, snapshot: HostSnapshot) {
        *self.snapshot.lock().expect("snapshot poisoned") = snapshot;
    }

    pub fn snapshot(&self) -> HostSnapshot {
        *self.snapshot.lock().expect("snapshot poisoned")
    }

    /// Probe the OS and refresh the cache.
    pub fn refresh_from_host(&self) {
        let mut system = System::new_all();
        system.refresh_all();
        // cpu usage needs two measurements a short interval apart
        std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
        system.refresh_cpu_usage();

        let total_mem = system.total_memory() as f64;
        let used_mem = system.used_memory() as f64;

        let disks = Disks::new_with_refreshed_list();
        let (mut disk_total, mut disk_free) = (0u64, 0u64);
        for disk in disks.list() {
            disk_total += disk.total_space();
            disk_free += disk.available_space();
        }
        let disk_used_percent = if disk_total > 0 {
            (disk_total - disk_free) as f64 / disk_total as f64 * 100.0
        } else {
            0.0
        };

        self.update_snapshot(HostSnapshot {
            total_cpus: system.cpus().len() as f64,
            cpu_used_percent: system.global_cpu_usage() as f64,
            memory_total_mib: total_mem / 1024.0 / 1024.0,
            memory_used_percent: if total_mem > 0.0 { used_mem / total_mem * 100.0 } else { 0.0 },
            disk_used_percent,
        });
    }

    /// Periodically re-probe the host until shutdown.
    pub fn spawn_refresh(
        self: std::sync::Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let guard = self.clone();
                        // sysinfo probing blocks; keep it off the runtime
                        let joined = tokio::task::spawn_blocking(move || {
                            guard.refresh_from_host();
                        })
                        .await;
                        if let Err(e) = joined {
                            warn!(error = %e, "host snapshot refresh failed");
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        })
    }

    /// Check the request against caps; does not commit anything.
    pub fn admit(&self, requested: &ResourceLimits) -> Result<(), OrchError> {
        let committed = self.committed.lock().expect("committed ledger poisoned");
        self.check(&committed, requested)
    }

    /// Atomic admit-and-commit: the check and the ledger insert happen under
    /// one lock, so racing creates can never jointly exceed the caps.
    pub fn try_commit(
        &self,
        id: EnvironmentId,
        requested: ResourceLimits,
    ) -> Result<(), OrchError> {
        let mut committed = self.committed.lock().expect("committed ledger poisoned");
        self.check(&committed, &requested)?;
        committed.by_environment.insert(id, requested);
        Ok(())
    }

    fn check(&self, committed: &Committed, requested: &ResourceLimits) -> Result<(), OrchError> {
        let snapshot = self.snapshot();
        let (committed_cpu, committed_mem) = committed.totals();

        let cpu_budget = snapshot.total_cpus * self.cpu_cap_pct / 100.0;
        if committed_cpu + requested.cpu_cores > cpu_budget {
            return Err(OrchError::InsufficientResources(format!(
                "cpu: committed {committed_cpu:.1} + requested {:.1} exceeds budget {cpu_budget:.1} cores",
                requested.cpu_cores
            )));
        }

        let mem_budget = snapshot.memory_total_mib * self.mem_cap_pct / 100.0;
        if committed_mem + requested.memory_mib as f64 > mem_budget {
            return Err(OrchError::InsufficientResources(format!(
                "memory: committed {committed_mem:.0} MiB + requested {} MiB exceeds budget {mem_budget:.0} MiB",
                requested.memory_mib
            )));
        }

        if snapshot.disk_used_percent > self.disk_cap_pct {
            return Err(OrchError::InsufficientResources(format!(
                "disk: host at {:.0}%, cap {:.0}%",
                snapshot.disk_used_percent, self.disk_cap_pct
            )));
        }

        debug!(
            committed_cpu,
            committed_mem,
            requested_cpu = requested.cpu_cores,
            requested_mem = requested.memory_mib,
            "admission granted"
        );
        Ok(())
    }

    /// Record an admitted environment's limits in the committed ledger.
    pub fn commit(&self, id: EnvironmentId, limits: ResourceLimits) {
        let mut committed = self.committed.lock().expect("committed ledger poisoned");
        committed.by_environment.insert(id, limits);
    }

    /// Return an environment's share to the pool (teardown or failed create).
    pub fn release(&self, id: &EnvironmentId) {
        let mut committed = self.committed.lock().expect("committed ledger poisoned");
        committed.by_environment.remove(id);
    }

    pub fn committed_totals(&self) -> (f64, f64) {
        self.committed.lock().expect("committed ledger poisoned").totals()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> ResourceGuard {
        let guard = ResourceGuard::new(80.0, 80.0, 85.0);
        guard.update_snapshot(HostSnapshot {
            total_cpus: 10.0,
            cpu_used_percent: 10.0,
            memory_total_mib: 16_384.0,
            memory_used_percent: 30.0,
            disk_used_percent: 40.0,
        });
        guard
    }

    fn limits(cpu: f64, mem: u32) -> ResourceLimits {
        ResourceLimits { cpu_cores: cpu, memory_mib: mem }
    }

    #[test]
    fn admits_within_caps() {
        let guard = guard();
        assert!(guard.admit(&limits(2.0, 2048)).is_ok());
    }

    #[test]
    fn admission_is_monotonic_under_commitment() {
        // 80% of 10 cpus = 8 cores of budget; each env asks for 2
        let guard = guard();
        let mut admitted = 0;
        loop {
            let request = limits(2.0, 1024);
            if guard.admit(&request).is_err() {
                break;
            }
            guard.commit(EnvironmentId::random(), request);
            admitted += 1;
            assert!(admitted <= 4, "admitted past the cpu budget");
        }
        assert_eq!(admitted, 4);
        let (cpu, _) = guard.committed_totals();
        assert!(cpu <= 8.0);
    }

    #[test]
    fn memory_cap_is_enforced() {
        let guard = guard();
        // budget = 80% of 16 GiB ≈ 13107 MiB
        assert!(guard.admit(&limits(0.5, 13_000)).is_ok());
        guard.commit(EnvironmentId::random(), limits(0.5, 13_000));
        assert!(guard.admit(&limits(0.5, 256)).is_err());
    }

    #[test]
    fn full_disk_blocks_admission() {
        let guard = guard();
        let mut snapshot = guard.snapshot();
        snapshot.disk_used_percent = 90.0;
        guard.update_snapshot(snapshot);
        assert!(guard.admit(&limits(0.5, 128)).is_err());
    }

    #[test]
    fn release_returns_capacity() {
        let guard = guard();
        let id = EnvironmentId::random();
        guard.commit(id, limits(8.0, 1024));
        assert!(guard.admit(&limits(1.0, 128)).is_err());
        guard.release(&id);
        assert!(guard.admit(&limits(1.0, 128)).is_ok());
    }
}
