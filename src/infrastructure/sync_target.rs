use crate::domain::ports::SyncTarget;
use crate::domain::sync::EntityChange;
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;

/// Stand-in for the remote system of record that records changes in the log.
///
/// Keeps the delivered keys so a re-delivery is acknowledged without being
/// logged twice, the way the real remote end dedups by key.
#[derive(Default)]
pub struct LogSyncTarget {
    seen: Mutex<HashSet<String>>,
}

impl LogSyncTarget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delivered(&self) -> usize {
        self.seen.lock().map(|seen| seen.len()).unwrap_or_default()
    }
}

#[async_trait]
impl SyncTarget for LogSyncTarget {
    async fn push(&self, change: &EntityChange) -> Result<()> {
        let first = match self.seen.lock() {
            Ok(mut seen) => seen.insert(change.key()),
            Err(poisoned) => poisoned.into_inner().insert(change.key()),
        };
        if first {
            tracing::info!(
                entity = %change.entity,
                id = %change.id,
                version = change.version,
                "synced change"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::customer::{Customer, CustomerId};

    #[tokio::test]
    async fn test_redelivery_is_idempotent() {
        let target = LogSyncTarget::new();
        let change = EntityChange::customer(&Customer::new(CustomerId::new("1"), None)).unwrap();

        target.push(&change).await.unwrap();
        target.push(&change).await.unwrap();
        assert_eq!(target.delivered(), 1);
    }
}
