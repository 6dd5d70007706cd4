use super::customer::{Customer, CustomerId};
use super::event::{DedupKey, PaymentEvent, Provider, RawNotification};
use super::money::Balance;
use super::purchase::{Purchase, PurchaseId, PurchaseState};
use super::referral::ReferralAccrual;
use super::sync::{DeadLetter, EntityChange, EntityKind};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait CustomerStore: Send + Sync {
    /// Inserts a customer unless one with the same id exists. Returns whether it was inserted.
    async fn insert_customer(&self, customer: Customer) -> Result<bool>;
    async fn get_customer(&self, id: &CustomerId) -> Result<Option<Customer>>;
    async fn deactivate_customer(&self, id: &CustomerId) -> Result<Option<Customer>>;
    async fn all_customers(&self) -> Result<Vec<Customer>>;
}

#[async_trait]
pub trait PurchaseStore: Send + Sync {
    /// Fails with `ValidationError` if the provider's external id is already taken.
    async fn insert_purchase(&self, purchase: Purchase) -> Result<()>;
    async fn get_purchase(&self, id: PurchaseId) -> Result<Option<Purchase>>;
    async fn find_by_external_id(
        &self,
        provider: Provider,
        external_id: &str,
    ) -> Result<Option<Purchase>>;
}

#[async_trait]
pub trait ReferralStore: Send + Sync {
    async fn accruals_for(&self, referrer: &CustomerId) -> Result<Vec<ReferralAccrual>>;
}

/// Payment events that matched no purchase, kept for operator review.
#[async_trait]
pub trait UnmatchedStore: Send + Sync {
    /// Redeliveries of the same notification are kept once.
    async fn record_unmatched(&self, event: PaymentEvent) -> Result<()>;
    async fn unmatched(&self) -> Result<Vec<PaymentEvent>>;
}

/// Snapshots of everything a transaction wrote, as committed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Committed {
    pub purchases: Vec<Purchase>,
    pub customers: Vec<Customer>,
    pub accruals: Vec<ReferralAccrual>,
}

/// One atomic unit of work against the customer, purchase and referral stores.
///
/// Nothing is visible to other readers until `commit`. Dropping the transaction
/// without committing discards it.
#[async_trait]
pub trait StoreTransaction: Send {
    async fn purchase_by_external_id(
        &mut self,
        provider: Provider,
        external_id: &str,
    ) -> Result<Option<Purchase>>;
    async fn customer(&mut self, id: &CustomerId) -> Result<Option<Customer>>;
    async fn update_purchase_state(
        &mut self,
        id: PurchaseId,
        state: PurchaseState,
        at: DateTime<Utc>,
    ) -> Result<Purchase>;
    async fn credit_customer(
        &mut self,
        id: &CustomerId,
        amount: Balance,
        months: u32,
    ) -> Result<Customer>;
    async fn referral_accrual_exists(
        &mut self,
        referrer: &CustomerId,
        purchase: PurchaseId,
    ) -> Result<bool>;
    async fn create_referral_accrual(&mut self, accrual: ReferralAccrual) -> Result<()>;
    async fn is_processed(&mut self, key: &DedupKey) -> Result<bool>;
    async fn mark_processed(&mut self, key: DedupKey) -> Result<()>;
    /// Fails with `TransactionConflict` if anything read was changed by another commit.
    async fn commit(self: Box<Self>) -> Result<Committed>;
    async fn rollback(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait TransactionalStore: CustomerStore + PurchaseStore + ReferralStore + UnmatchedStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>>;
}

pub type StoreHandle = Arc<dyn TransactionalStore>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub kind: EntityKind,
    pub id: String,
}

impl CacheKey {
    pub fn customer(id: &CustomerId) -> Self {
        Self {
            kind: EntityKind::Customer,
            id: id.to_string(),
        }
    }

    pub fn purchase(id: PurchaseId) -> Self {
        Self {
            kind: EntityKind::Purchase,
            id: id.to_string(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Best-effort memoization of entity snapshots.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &CacheKey) -> Result<Option<serde_json::Value>>;
    async fn set(&self, key: CacheKey, value: serde_json::Value, ttl: Duration) -> Result<()>;
    async fn invalidate(&self, key: &CacheKey) -> Result<()>;
    /// Counter that every `invalidate` of `key` advances.
    async fn generation(&self, key: &CacheKey) -> Result<u64>;
    /// Stores `value` only if `key` has not been invalidated since `generation`
    /// was read. Returns whether it was stored.
    async fn set_if_current(
        &self,
        key: CacheKey,
        value: serde_json::Value,
        ttl: Duration,
        generation: u64,
    ) -> Result<bool>;
}

pub type CacheHandle = Arc<dyn Cache>;

/// Durable queue of changes awaiting delivery, plus the dead-letter record.
#[async_trait]
pub trait SyncOutbox: Send + Sync {
    async fn push_pending(&self, change: EntityChange) -> Result<()>;
    async fn remove_pending(&self, key: &str) -> Result<()>;
    async fn pending(&self) -> Result<Vec<EntityChange>>;
    /// Records the dead letter and drops the change from the pending set.
    async fn push_dead_letter(&self, letter: DeadLetter) -> Result<()>;
    async fn dead_letters(&self) -> Result<Vec<DeadLetter>>;
}

pub type OutboxHandle = Arc<dyn SyncOutbox>;

/// The external system of record. Deliveries must be idempotent by `EntityChange::key`.
#[async_trait]
pub trait SyncTarget: Send + Sync {
    async fn push(&self, change: &EntityChange) -> Result<()>;
}

pub type SyncTargetHandle = Arc<dyn SyncTarget>;

/// Translates one provider's notifications into `PaymentEvent`s. Pure.
pub trait PaymentAdapter: Send + Sync {
    fn provider(&self) -> Provider;
    fn normalize(&self, raw: &RawNotification) -> Result<PaymentEvent>;
}

pub type AdapterBox = Box<dyn PaymentAdapter>;
