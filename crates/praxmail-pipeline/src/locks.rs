//! Per-email logical locks. Operations against the same email id are
//! serialized so state transitions stay linearizable per email, while
//! distinct emails proceed in parallel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use praxmail_core::types::RowId;
use tokio::sync::OwnedMutexGuard;

#[derive(Default)]
pub struct EmailLocks {
    inner: Mutex<HashMap<RowId, Arc<tokio::sync::Mutex<()>>>>,
}

impl EmailLocks {
    /// Take (or create) the lock for one email. The guard releases on drop.
    pub async fn acquire(&self, email_id: RowId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = match self.inner.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            Arc::clone(map.entry(email_id).or_default())
        };
        lock.lock_owned().await
    }

    /// Drop entries nobody holds. Called once per pipeline tick to keep
    /// the map short-lived.
    pub fn prune(&self) {
        let mut map = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.retain(|_, lock| Arc::strong_count(lock) > 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_id_is_exclusive() {
        let locks = Arc::new(EmailLocks::default());
        let guard = locks.acquire(1).await;
        let contender = Arc::clone(&locks);
        let pending = tokio::spawn(async move { contender.acquire(1).await });
        tokio::task::yield_now().await;
        assert!(!pending.is_finished(), "second acquire must wait");
        drop(guard);
        pending.await.unwrap();
    }

    #[tokio::test]
    async fn different_ids_are_independent() {
        let locks = EmailLocks::default();
        let _a = locks.acquire(1).await;
        let _b = locks.acquire(2).await;
    }

    #[tokio::test]
    async fn prune_drops_idle_entries() {
        let locks = EmailLocks::default();
        {
            let _guard = locks.acquire(1).await;
            locks.prune();
            assert_eq!(locks.inner.lock().unwrap().len(), 1, "held entry survives");
        }
        locks.prune();
        assert!(locks.inner.lock().unwrap().is_empty());
    }
}
