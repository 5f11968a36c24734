use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::domain::{AccountId, CourseId};

/// Slots that are no longer held are pruned once the table grows past this size
const PRUNE_THRESHOLD: usize = 1024;

type Slot = Arc<Mutex<()>>;

/// Keyed async locks serializing enrollment attempts per (account, course) pair
#[derive(Debug, Default)]
pub struct EnrollmentLocks {
    slots: StdMutex<HashMap<(AccountId, CourseId), Slot>>,
}

/// Held for the whole validate-then-mutate sequence of one enrollment
#[derive(Debug)]
pub struct EnrollmentGuard {
    _guard: OwnedMutexGuard<()>,
}

impl EnrollmentLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, account: AccountId, course: CourseId) -> EnrollmentGuard {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            if slots.len() >= PRUNE_THRESHOLD {
                slots.retain(|_, slot| Arc::strong_count(slot) > 1);
            }
            slots.entry((account, course)).or_default().clone()
        };

        EnrollmentGuard {
            _guard: slot.lock_owned().await,
        }
    }

    /// Number of tracked key slots
    pub fn tracked(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_is_serialized() {
        let locks = Arc::new(EnrollmentLocks::new());
        let first = locks.acquire(AccountId(1), CourseId(1)).await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire(AccountId(1), CourseId(1)).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(first);
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .expect("contender should acquire after release")
            .unwrap();
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_block() {
        let locks = EnrollmentLocks::new();
        let _a = locks.acquire(AccountId(1), CourseId(1)).await;
        let _b = locks.acquire(AccountId(1), CourseId(2)).await;
        let _c = locks.acquire(AccountId(2), CourseId(1)).await;
        assert_eq!(locks.tracked(), 3);
    }
}
