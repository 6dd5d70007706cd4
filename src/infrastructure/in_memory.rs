use super::write_set::WriteSet;
use crate::domain::customer::{Customer, CustomerId};
use crate::domain::event::{DedupKey, PaymentEvent, Provider};
use crate::domain::money::Balance;
use crate::domain::ports::{
    Committed, CustomerStore, PurchaseStore, ReferralStore, StoreTransaction, SyncOutbox,
    TransactionalStore, UnmatchedStore,
};
use crate::domain::purchase::{Purchase, PurchaseId, PurchaseState};
use crate::domain::referral::ReferralAccrual;
use crate::domain::sync::{DeadLetter, EntityChange};
use crate::error::{ReconcileError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct Tables {
    customers: HashMap<CustomerId, Customer>,
    purchases: HashMap<PurchaseId, Purchase>,
    by_external: HashMap<(Provider, String), PurchaseId>,
    accruals: HashMap<(CustomerId, PurchaseId), ReferralAccrual>,
    processed: HashSet<DedupKey>,
    unmatched: BTreeMap<DedupKey, PaymentEvent>,
}

/// A thread-safe in-memory store for customers, purchases and referral accruals.
///
/// All tables sit behind one `Arc<RwLock<..>>` so a commit applies its whole
/// write set under a single write lock. Ideal for tests and short replays where
/// persistence is not required.
#[derive(Default, Clone)]
pub struct InMemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryStore {
    /// Creates a new, empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of notifications recorded as processed.
    pub async fn processed_count(&self) -> usize {
        self.tables.read().await.processed.len()
    }
}

#[async_trait]
impl CustomerStore for InMemoryStore {
    async fn insert_customer(&self, customer: Customer) -> Result<bool> {
        let mut tables = self.tables.write().await;
        if tables.customers.contains_key(&customer.id) {
            return Ok(false);
        }
        tables.customers.insert(customer.id.clone(), customer);
        Ok(true)
    }

    async fn get_customer(&self, id: &CustomerId) -> Result<Option<Customer>> {
        let tables = self.tables.read().await;
        Ok(tables.customers.get(id).cloned())
    }

    async fn deactivate_customer(&self, id: &CustomerId) -> Result<Option<Customer>> {
        let mut tables = self.tables.write().await;
        Ok(tables.customers.get_mut(id).map(|customer| {
            customer.deactivate();
            customer.clone()
        }))
    }

    async fn all_customers(&self) -> Result<Vec<Customer>> {
        let tables = self.tables.read().await;
        let mut customers: Vec<Customer> = tables.customers.values().cloned().collect();
        customers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(customers)
    }
}

#[async_trait]
impl PurchaseStore for InMemoryStore {
    async fn insert_purchase(&self, purchase: Purchase) -> Result<()> {
        let mut tables = self.tables.write().await;
        let key = (purchase.provider, purchase.external_id.clone());
        if tables.by_external.contains_key(&key) {
            return Err(ReconcileError::ValidationError(format!(
                "{} transaction {} already has a purchase",
                purchase.provider, purchase.external_id
            )));
        }
        tables.by_external.insert(key, purchase.id);
        tables.purchases.insert(purchase.id, purchase);
        Ok(())
    }

    async fn get_purchase(&self, id: PurchaseId) -> Result<Option<Purchase>> {
        let tables = self.tables.read().await;
        Ok(tables.purchases.get(&id).cloned())
    }

    async fn find_by_external_id(
        &self,
        provider: Provider,
        external_id: &str,
    ) -> Result<Option<Purchase>> {
        let tables = self.tables.read().await;
        Ok(tables
            .by_external
            .get(&(provider, external_id.to_string()))
            .and_then(|id| tables.purchases.get(id))
            .cloned())
    }
}

#[async_trait]
impl ReferralStore for InMemoryStore {
    async fn accruals_for(&self, referrer: &CustomerId) -> Result<Vec<ReferralAccrual>> {
        let tables = self.tables.read().await;
        Ok(tables
            .accruals
            .values()
            .filter(|a| &a.referrer == referrer)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl UnmatchedStore for InMemoryStore {
    async fn record_unmatched(&self, event: PaymentEvent) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.unmatched.entry(event.dedup_key()).or_insert(event);
        Ok(())
    }

    async fn unmatched(&self) -> Result<Vec<PaymentEvent>> {
        Ok(self.tables.read().await.unmatched.values().cloned().collect())
    }
}

#[async_trait]
impl TransactionalStore for InMemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        Ok(Box::new(InMemoryTransaction {
            tables: Arc::clone(&self.tables),
            writes: WriteSet::default(),
        }))
    }
}

/// Optimistic transaction over `InMemoryStore`.
///
/// Reads go straight to the shared tables; writes are buffered and validated
/// against the committed versions when `commit` takes the write lock.
pub struct InMemoryTransaction {
    tables: Arc<RwLock<Tables>>,
    writes: WriteSet,
}

#[async_trait]
impl StoreTransaction for InMemoryTransaction {
    async fn purchase_by_external_id(
        &mut self,
        provider: Provider,
        external_id: &str,
    ) -> Result<Option<Purchase>> {
        if let Some(staged) = self.writes.staged_by_external(provider, external_id) {
            return Ok(Some(staged));
        }
        let tables = self.tables.read().await;
        let purchase = tables
            .by_external
            .get(&(provider, external_id.to_string()))
            .and_then(|id| tables.purchases.get(id))
            .cloned();
        if let Some(p) = &purchase {
            self.writes.observe(p);
        }
        Ok(purchase)
    }

    async fn customer(&mut self, id: &CustomerId) -> Result<Option<Customer>> {
        let committed = self.tables.read().await.customers.get(id).cloned();
        Ok(committed.map(|c| self.writes.project(c)))
    }

    async fn update_purchase_state(
        &mut self,
        id: PurchaseId,
        state: PurchaseState,
        at: DateTime<Utc>,
    ) -> Result<Purchase> {
        let current = match self.writes.purchases.get(&id) {
            Some(staged) => staged.clone(),
            None => self
                .tables
                .read()
                .await
                .purchases
                .get(&id)
                .cloned()
                .ok_or_else(|| ReconcileError::ValidationError(format!("unknown purchase {id}")))?,
        };
        Ok(self.writes.stage_state(current, state, at))
    }

    async fn credit_customer(
        &mut self,
        id: &CustomerId,
        amount: Balance,
        months: u32,
    ) -> Result<Customer> {
        let committed = self
            .tables
            .read()
            .await
            .customers
            .get(id)
            .cloned()
            .ok_or_else(|| ReconcileError::ValidationError(format!("unknown customer {id}")))?;
        Ok(self.writes.stage_credit(committed, amount, months))
    }

    async fn referral_accrual_exists(
        &mut self,
        referrer: &CustomerId,
        purchase: PurchaseId,
    ) -> Result<bool> {
        if self.writes.has_accrual(referrer, purchase) {
            return Ok(true);
        }
        let tables = self.tables.read().await;
        Ok(tables
            .accruals
            .contains_key(&(referrer.clone(), purchase)))
    }

    async fn create_referral_accrual(&mut self, accrual: ReferralAccrual) -> Result<()> {
        self.writes.accruals.push(accrual);
        Ok(())
    }

    async fn is_processed(&mut self, key: &DedupKey) -> Result<bool> {
        if self.writes.has_processed(key) {
            return Ok(true);
        }
        Ok(self.tables.read().await.processed.contains(key))
    }

    async fn mark_processed(&mut self, key: DedupKey) -> Result<()> {
        self.writes.processed.push(key);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<Committed> {
        let InMemoryTransaction { tables, writes } = *self;
        let mut tables = tables.write().await;

        // Validate everything before touching anything.
        for id in writes.purchases.keys() {
            let current = tables.purchases.get(id).map(|p| p.version);
            writes.check_version(*id, current)?;
        }
        for key in &writes.processed {
            if tables.processed.contains(key) {
                return Err(ReconcileError::TransactionConflict(format!(
                    "notification {key} already processed"
                )));
            }
        }
        for accrual in &writes.accruals {
            if tables
                .accruals
                .contains_key(&(accrual.referrer.clone(), accrual.purchase))
            {
                return Err(ReconcileError::TransactionConflict(format!(
                    "accrual for {} on purchase {} already exists",
                    accrual.referrer, accrual.purchase
                )));
            }
        }
        for id in writes.credits.keys() {
            if !tables.customers.contains_key(id) {
                return Err(ReconcileError::TransactionConflict(format!(
                    "customer {id} disappeared"
                )));
            }
        }

        let mut committed = Committed::default();
        for (id, purchase) in writes.purchases {
            tables.purchases.insert(id, purchase.clone());
            committed.purchases.push(purchase);
        }
        for (id, (amount, months)) in writes.credits {
            if let Some(customer) = tables.customers.get_mut(&id) {
                customer.credit(amount, months);
                committed.customers.push(customer.clone());
            }
        }
        for accrual in writes.accruals {
            tables.accruals.insert(
                (accrual.referrer.clone(), accrual.purchase),
                accrual.clone(),
            );
            committed.accruals.push(accrual);
        }
        tables.processed.extend(writes.processed);

        Ok(committed)
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct OutboxTables {
    pending: BTreeMap<String, EntityChange>,
    dead: Vec<DeadLetter>,
}

/// In-memory sync outbox. Pending changes survive only as long as the process.
#[derive(Default, Clone)]
pub struct InMemoryOutbox {
    tables: Arc<RwLock<OutboxTables>>,
}

impl InMemoryOutbox {
    /// Creates a new, empty outbox.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SyncOutbox for InMemoryOutbox {
    async fn push_pending(&self, change: EntityChange) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.pending.insert(change.key(), change);
        Ok(())
    }

    async fn remove_pending(&self, key: &str) -> Result<()> {
        self.tables.write().await.pending.remove(key);
        Ok(())
    }

    async fn pending(&self) -> Result<Vec<EntityChange>> {
        Ok(self.tables.read().await.pending.values().cloned().collect())
    }

    async fn push_dead_letter(&self, letter: DeadLetter) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.pending.remove(&letter.change.key());
        tables.dead.push(letter);
        Ok(())
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        Ok(self.tables.read().await.dead.clone())
    }
}
