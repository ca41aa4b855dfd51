use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Per-user mutual exclusion for read-modify-write cycles.
///
/// Entries are never evicted; one empty mutex per user ever seen is cheap
/// next to the record itself.
#[derive(Clone, Default)]
pub struct UserLocks {
    locks: Arc<DashMap<i64, Arc<Mutex<()>>>>,
}

impl UserLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits at most `timeout` for the user's lock. `None` on timeout.
    pub async fn acquire(&self, user_id: i64, timeout: Duration) -> Option<OwnedMutexGuard<()>> {
        let mutex = self.locks.entry(user_id).or_default().clone();
        match tokio::time::timeout(timeout, mutex.lock_owned()).await {
            Ok(guard) => Some(guard),
            Err(_) => {
                log::warn!("Timed out after {:?} waiting for lock of user {}", timeout, user_id);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_same_user_is_serialized() {
        let locks = UserLocks::new();
        let guard = locks.acquire(1, Duration::from_secs(1)).await.unwrap();
        assert!(locks.acquire(1, Duration::from_millis(20)).await.is_none());
        drop(guard);
        assert!(locks.acquire(1, Duration::from_millis(20)).await.is_some());
    }

    #[tokio::test]
    async fn test_different_users_do_not_block() {
        let locks = UserLocks::new();
        let _a = locks.acquire(1, Duration::from_secs(1)).await.unwrap();
        assert!(locks.acquire(2, Duration::from_millis(20)).await.is_some());
    }
}
