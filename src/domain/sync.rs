use super::customer::Customer;
use super::purchase::Purchase;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Customer,
    Purchase,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Customer => f.write_str("customer"),
            EntityKind::Purchase => f.write_str("purchase"),
        }
    }
}

/// A committed entity state to mirror to the external system of record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityChange {
    pub entity: EntityKind,
    pub id: String,
    pub version: u64,
    pub snapshot: serde_json::Value,
    pub changed_at: DateTime<Utc>,
}

impl EntityChange {
    pub fn customer(customer: &Customer) -> Result<Self, serde_json::Error> {
        Ok(Self {
            entity: EntityKind::Customer,
            id: customer.id.to_string(),
            version: customer.version,
            snapshot: serde_json::to_value(customer)?,
            changed_at: Utc::now(),
        })
    }

    pub fn purchase(purchase: &Purchase) -> Result<Self, serde_json::Error> {
        Ok(Self {
            entity: EntityKind::Purchase,
            id: purchase.id.to_string(),
            version: purchase.version,
            snapshot: serde_json::to_value(purchase)?,
            changed_at: purchase.updated_at,
        })
    }

    /// Remote idempotency key: re-delivering the same key is a no-op there.
    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.entity, self.id, self.version)
    }
}

/// A change that exhausted its delivery attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub change: EntityChange,
    pub attempts: usize,
    pub last_error: String,
    pub failed_at: DateTime<Utc>,
}
