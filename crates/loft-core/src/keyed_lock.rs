use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use loft_domain::EnvironmentId;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One logical mutex per environment id.
///
/// Mutating operations acquire the environment's lock before reading its row,
/// giving linearisable semantics per environment while operations on
/// different environments run in parallel. Read-only queries never come here.
#[derive(Default)]
pub struct KeyedLocks {
    inner: Mutex<HashMap<EnvironmentId, Arc<AsyncMutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, id: EnvironmentId) -> OwnedMutexGuard<()> {
        let entry = {
            let mut map = self.inner.lock().expect("keyed lock map poisoned");
            map.entry(id).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
        };
        entry.lock_owned().await
    }

    /// Drop the lock entry for a destroyed environment. Harmless if another
    /// task re-creates it; the entry is only a rendezvous point.
    pub fn forget(&self, id: &EnvironmentId) {
        let mut map = self.inner.lock().expect("keyed lock map poisoned");
        map.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_serialises() {
        let locks = Arc::new(KeyedLocks::new());
        let id = EnvironmentId::random();
        let concurrent = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let concurrent = concurrent.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                let _guard = locks.lock(id).await;
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                concurrent.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_keys_run_in_parallel() {
        let locks = Arc::new(KeyedLocks::new());
        let a = locks.lock(EnvironmentId::random()).await;
        // a second environment is not blocked by the first guard
        let b = tokio::time::timeout(
            Duration::from_millis(50),
            locks.lock(EnvironmentId::random()),
        )
        .await;
        assert!(b.is_ok());
        drop(a);
    }
}
