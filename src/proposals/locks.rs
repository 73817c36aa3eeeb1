//! Per-RFP mutual exclusion for recommendation updates.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

/// Lock table keyed by RFP id.
///
/// Every write that can change which proposal of an RFP is recommended runs
/// while holding that RFP's entry. Entries nobody holds or waits on are
/// dropped on the next acquire.
#[derive(Debug, Clone, Default)]
pub struct RecommendationLocks {
    inner: Arc<Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>>,
}

impl RecommendationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `rfp_id`.
    pub async fn acquire(&self, rfp_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut table = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            table.retain(|id, lock| *id == rfp_id || Arc::strong_count(lock) > 1);
            Arc::clone(table.entry(rfp_id).or_default())
        };
        lock.lock_owned().await
    }

    /// Number of RFPs with a live entry.
    pub fn tracked(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn same_rfp_is_serialized() {
        let locks = RecommendationLocks::new();
        let rfp = Uuid::new_v4();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let inside = Arc::clone(&inside);
            let max_seen = Arc::clone(&max_seen);
            tasks.push(tokio::spawn(async move {
                let _guard = locks.acquire(rfp).await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_rfps_do_not_block() {
        let locks = RecommendationLocks::new();
        let _a = locks.acquire(Uuid::new_v4()).await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.acquire(Uuid::new_v4())).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn idle_entries_are_pruned() {
        let locks = RecommendationLocks::new();
        for _ in 0..5 {
            let _guard = locks.acquire(Uuid::new_v4()).await;
        }
        let _held = locks.acquire(Uuid::new_v4()).await;
        assert_eq!(locks.tracked(), 1);
    }
}
