use super::money::Balance;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque external identity of a customer (e.g. the messenger user id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CustomerId(pub String);

impl CustomerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CustomerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum CustomerStatus {
    Active,
    Deactivated,
}

/// A customer of the bot.
///
/// Customers are created on first contact and never deleted. `referred_by` only
/// names the inviting customer; it does not own it.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Customer {
    pub id: CustomerId,
    /// Money credited to the customer (paid purchases and referral commission).
    pub balance: Balance,
    /// Subscription months the customer is entitled to.
    pub entitled_months: u32,
    pub referred_by: Option<CustomerId>,
    pub status: CustomerStatus,
    /// Bumped on every committed mutation; used as the sync idempotency key.
    pub version: u64,
    pub created_at: DateTime<Utc>,
}

impl Customer {
    pub fn new(id: CustomerId, referred_by: Option<CustomerId>) -> Self {
        Self {
            id,
            balance: Balance::ZERO,
            entitled_months: 0,
            referred_by,
            status: CustomerStatus::Active,
            version: 0,
            created_at: Utc::now(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == CustomerStatus::Active
    }

    /// Applies a credit: money to the balance and months to the entitlement.
    pub fn credit(&mut self, amount: Balance, months: u32) {
        self.balance += amount;
        self.entitled_months = self.entitled_months.saturating_add(months);
        self.version += 1;
    }

    pub fn deactivate(&mut self) {
        if self.status != CustomerStatus::Deactivated {
            self.status = CustomerStatus::Deactivated;
            self.version += 1;
        }
    }
}
