use crate::domain::purchase::PurchaseId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Slot = Arc<AsyncMutex<()>>;

/// Keyed exclusive scopes, one per purchase.
///
/// Two events for the same purchase serialize; events for different purchases
/// never wait on each other. A key's entry is dropped once nobody holds or
/// awaits it, so the table only grows with in-flight purchases.
#[derive(Default, Clone)]
pub struct PurchaseLocks {
    slots: Arc<Mutex<HashMap<PurchaseId, Slot>>>,
}

/// Holds a purchase's scope until dropped.
pub struct PurchaseGuard {
    id: PurchaseId,
    guard: Option<OwnedMutexGuard<()>>,
    slots: Arc<Mutex<HashMap<PurchaseId, Slot>>>,
}

impl PurchaseLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, id: PurchaseId) -> PurchaseGuard {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
            Arc::clone(slots.entry(id).or_default())
        };
        let guard = slot.lock_owned().await;
        PurchaseGuard {
            id,
            guard: Some(guard),
            slots: Arc::clone(&self.slots),
        }
    }

    /// Number of purchases currently held or awaited.
    pub fn in_use(&self) -> usize {
        self.slots.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

impl Drop for PurchaseGuard {
    fn drop(&mut self) {
        let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        // Release first so the count below only sees other holders and waiters.
        drop(self.guard.take());
        if let Some(slot) = slots.get(&self.id)
            && Arc::strong_count(slot) == 1
        {
            slots.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_purchase_is_exclusive() {
        let locks = PurchaseLocks::new();
        let id = PurchaseId::new();

        let first = locks.acquire(id).await;
        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire(id).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(first);
        contender.await.unwrap();
        assert_eq!(locks.in_use(), 0);
    }

    #[tokio::test]
    async fn test_different_purchases_do_not_block() {
        let locks = PurchaseLocks::new();
        let _a = locks.acquire(PurchaseId::new()).await;
        let b = tokio::time::timeout(Duration::from_millis(50), locks.acquire(PurchaseId::new())).await;
        assert!(b.is_ok());
        assert_eq!(locks.in_use(), 2);
    }
}
