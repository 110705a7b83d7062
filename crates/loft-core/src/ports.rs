use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use loft_domain::{EnvironmentId, PortLease};
use loft_store::Repository;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::OrchError;

/// Hands out unique host ports from a configured contiguous range.
///
/// The durable truth is the lease table; the free set here is a cache warmed
/// from it at startup. `reserve` writes the leases first and mutates the
/// cache only after the write succeeds, so a failed transaction leaves no
/// in-memory residue.
pub struct PortAllocator {
    range: (u16, u16),
    repo: Arc<dyn Repository>,
    free: Mutex<BTreeSet<u16>>,
}

impl PortAllocator {
    /// Build the allocator and warm the free set from persisted leases.
    pub async fn new(
        range: (u16, u16),
        repo: Arc<dyn Repository>,
    ) -> Result<Self, OrchError> {
        let mut free: BTreeSet<u16> = (range.0..=range.1).collect();
        for lease in repo.list_port_leases().await? {
            free.remove(&lease.host_port);
        }
        info!(
            lo = range.0,
            hi = range.1,
            free = free.len(),
            "port allocator warmed from lease table"
        );
        Ok(Self { range, repo, free: Mutex::new(free) })
    }

    pub fn range(&self) -> (u16, u16) {
        self.range
    }

    /// Reserve `count` ports for an environment, lowest free first.
    pub async fn reserve(
        &self,
        environment_id: EnvironmentId,
        count: usize,
    ) -> Result<Vec<u16>, OrchError> {
        if count == 0 {
            return Ok(vec![]);
        }
        let mut free = self.free.lock().await;
        if free.len() < count {
            return Err(OrchError::NoFreePorts);
        }
        let ports: Vec<u16> = free.iter().take(count).copied().collect();

        let now = Utc::now();
        let leases: Vec<PortLease> = ports
            .iter()
            .map(|&host_port| PortLease { host_port, environment_id, leased_at: now })
            .collect();
        self.repo.insert_port_leases(&leases).await?;

        for port in &ports {
            free.remove(port);
        }
        debug!(environment_id = %environment_id, ?ports, "ports reserved");
        Ok(ports)
    }

    /// Release every lease held by an environment.
    pub async fn release(&self, environment_id: EnvironmentId) -> Result<(), OrchError> {
        let mut free = self.free.lock().await;
        let held: Vec<u16> = self
            .repo
            .list_port_leases()
            .await?
            .into_iter()
            .filter(|l| l.environment_id == environment_id)
            .map(|l| l.host_port)
            .collect();
        self.repo.delete_port_leases(&environment_id).await?;
        for port in held {
            if port >= self.range.0 && port <= self.range.1 {
                free.insert(port);
            }
        }
        debug!(environment_id = %environment_id, "ports released");
        Ok(())
    }

    pub async fn free_count(&self) -> usize {
        self.free.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loft_store::InMemoryStore;

    async fn allocator(lo: u16, hi: u16) -> (PortAllocator, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let alloc = PortAllocator::new((lo, hi), store.clone()).await.unwrap();
        (alloc, store)
    }

    #[tokio::test]
    async fn reserve_hands_out_lowest_first() {
        let (alloc, _) = allocator(8000, 8010).await;
        let env = EnvironmentId::random();
        let ports = alloc.reserve(env, 3).await.unwrap();
        assert_eq!(ports, vec![8000, 8001, 8002]);
    }

    #[tokio::test]
    async fn exhaustion_and_reuse_after_release() {
        let (alloc, _) = allocator(8000, 8001).await;
        let env_a = EnvironmentId::random();
        let env_b = EnvironmentId::random();
        let env_c = EnvironmentId::random();

        assert_eq!(alloc.reserve(env_a, 1).await.unwrap(), vec![8000]);
        assert_eq!(alloc.reserve(env_b, 1).await.unwrap(), vec![8001]);
        assert!(matches!(alloc.reserve(env_c, 1).await, Err(OrchError::NoFreePorts)));

        alloc.release(env_a).await.unwrap();
        // the freed low port comes back first
        assert_eq!(alloc.reserve(env_c, 1).await.unwrap(), vec![8000]);
    }

    #[tokio::test]
    async fn warm_start_excludes_persisted_leases() {
        let (alloc, store) = allocator(8000, 8002).await;
        let env = EnvironmentId::random();
        alloc.reserve(env, 2).await.unwrap();

        // a fresh allocator over the same store must not re-issue 8000/8001
        let rewarmed = PortAllocator::new((8000, 8002), store).await.unwrap();
        let ports = rewarmed.reserve(EnvironmentId::random(), 1).await.unwrap();
        assert_eq!(ports, vec![8002]);
    }

    #[tokio::test]
    async fn leases_survive_in_store_until_release() {
        let (alloc, store) = allocator(8000, 8005).await;
        let env = EnvironmentId::random();
        alloc.reserve(env, 2).await.unwrap();
        assert_eq!(store.list_port_leases().await.unwrap().len(), 2);

        alloc.release(env).await.unwrap();
        assert!(store.list_port_leases().await.unwrap().is_empty());
        assert_eq!(alloc.free_count().await, 6);
    }

    #[tokio::test]
    async fn oversized_request_fails_without_partial_grant() {
        let (alloc, store) = allocator(8000, 8001).await;
        let env = EnvironmentId::random();
        assert!(matches!(alloc.reserve(env, 3).await, Err(OrchError::NoFreePorts)));
        assert!(store.list_port_leases().await.unwrap().is_empty());
        assert_eq!(alloc.free_count().await, 2);
    }
}
