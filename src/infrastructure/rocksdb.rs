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
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, Direction, IteratorMode, Options, WriteBatch};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Column Family for customer records.
pub const CF_CUSTOMERS: &str = "customers";
/// Column Family for purchase records.
pub const CF_PURCHASES: &str = "purchases";
/// Column Family mapping `provider:external_id` to a purchase id.
pub const CF_PURCHASE_REFS: &str = "purchase_refs";
/// Column Family for referral accruals, keyed `referrer\0purchase`.
pub const CF_REFERRALS: &str = "referrals";
/// Column Family for processed notification keys.
pub const CF_PROCESSED: &str = "processed";
/// Column Family for payment events that matched no purchase.
pub const CF_UNMATCHED: &str = "unmatched";
/// Column Family for changes awaiting sync delivery.
pub const CF_SYNC_PENDING: &str = "sync_pending";
/// Column Family for changes that exhausted delivery.
pub const CF_SYNC_DEAD: &str = "sync_dead";

const COLUMN_FAMILIES: [&str; 8] = [
    CF_CUSTOMERS,
    CF_PURCHASES,
    CF_PURCHASE_REFS,
    CF_REFERRALS,
    CF_PROCESSED,
    CF_UNMATCHED,
    CF_SYNC_PENDING,
    CF_SYNC_DEAD,
];

/// A persistent store implementation using RocksDB.
///
/// Every entity kind lives in its own Column Family. Transactions buffer their
/// writes and commit them as one `WriteBatch` while holding the store-wide
/// commit lock, after re-checking the versions they read.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<DB>,
    commit_lock: Arc<Mutex<()>>,
}

fn internal(msg: String) -> ReconcileError {
    ReconcileError::InternalError(Box::new(std::io::Error::other(msg)))
}

fn cf<'a>(db: &'a DB, name: &str) -> Result<&'a ColumnFamily> {
    db.cf_handle(name)
        .ok_or_else(|| internal(format!("{name} column family not found")))
}

fn get_json<T: DeserializeOwned>(db: &DB, name: &str, key: &[u8]) -> Result<Option<T>> {
    match db.get_cf(cf(db, name)?, key)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

fn put_json<T: Serialize>(batch: &mut WriteBatch, db: &DB, name: &str, key: &[u8], value: &T) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    batch.put_cf(cf(db, name)?, key, bytes);
    Ok(())
}

fn scan_json<T: DeserializeOwned>(db: &DB, name: &str, prefix: &[u8]) -> Result<Vec<T>> {
    let mut items = Vec::new();
    let iter = db.iterator_cf(cf(db, name)?, IteratorMode::From(prefix, Direction::Forward));
    for item in iter {
        let (key, value) = item.map_err(|e| internal(format!("RocksDB iteration error: {e}")))?;
        if !key.starts_with(prefix) {
            break;
        }
        items.push(serde_json::from_slice(&value)?);
    }
    Ok(items)
}

fn ref_key(provider: Provider, external_id: &str) -> Vec<u8> {
    format!("{provider}:{external_id}").into_bytes()
}

fn accrual_key(referrer: &CustomerId, purchase: PurchaseId) -> Vec<u8> {
    format!("{referrer}\0{purchase}").into_bytes()
}

fn find_purchase(db: &DB, provider: Provider, external_id: &str) -> Result<Option<Purchase>> {
    let Some(id) = db.get_cf(cf(db, CF_PURCHASE_REFS)?, ref_key(provider, external_id))? else {
        return Ok(None);
    };
    get_json(db, CF_PURCHASES, &id)
}

impl RocksDBStore {
    /// Opens or creates a RocksDB instance at the specified path.
    ///
    /// Ensures that every required column family exists.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let descriptors = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect::<Vec<_>>();
        let db = DB::open_cf_descriptors(&opts, path, descriptors)?;

        Ok(Self {
            db: Arc::new(db),
            commit_lock: Arc::new(Mutex::new(())),
        })
    }
}

#[async_trait]
impl CustomerStore for RocksDBStore {
    async fn insert_customer(&self, customer: Customer) -> Result<bool> {
        let _guard = self.commit_lock.lock().await;
        let key = customer.id.as_str().as_bytes();
        if self.db.get_pinned_cf(cf(&self.db, CF_CUSTOMERS)?, key)?.is_some() {
            return Ok(false);
        }
        let mut batch = WriteBatch::default();
        put_json(&mut batch, &self.db, CF_CUSTOMERS, key, &customer)?;
        self.db.write(batch)?;
        Ok(true)
    }

    async fn get_customer(&self, id: &CustomerId) -> Result<Option<Customer>> {
        get_json(&self.db, CF_CUSTOMERS, id.as_str().as_bytes())
    }

    async fn deactivate_customer(&self, id: &CustomerId) -> Result<Option<Customer>> {
        let _guard = self.commit_lock.lock().await;
        let Some(mut customer) = get_json::<Customer>(&self.db, CF_CUSTOMERS, id.as_str().as_bytes())? else {
            return Ok(None);
        };
        customer.deactivate();
        let mut batch = WriteBatch::default();
        put_json(&mut batch, &self.db, CF_CUSTOMERS, id.as_str().as_bytes(), &customer)?;
        self.db.write(batch)?;
        Ok(Some(customer))
    }

    async fn all_customers(&self) -> Result<Vec<Customer>> {
        scan_json(&self.db, CF_CUSTOMERS, b"")
    }
}

#[async_trait]
impl PurchaseStore for RocksDBStore {
    async fn insert_purchase(&self, purchase: Purchase) -> Result<()> {
        let _guard = self.commit_lock.lock().await;
        let reference = ref_key(purchase.provider, &purchase.external_id);
        if self
            .db
            .get_pinned_cf(cf(&self.db, CF_PURCHASE_REFS)?, &reference)?
            .is_some()
        {
            return Err(ReconcileError::ValidationError(format!(
                "{} transaction {} already has a purchase",
                purchase.provider, purchase.external_id
            )));
        }
        let id = purchase.id.to_string();
        let mut batch = WriteBatch::default();
        batch.put_cf(cf(&self.db, CF_PURCHASE_REFS)?, &reference, id.as_bytes());
        put_json(&mut batch, &self.db, CF_PURCHASES, id.as_bytes(), &purchase)?;
        self.db.write(batch)?;
        Ok(())
    }

    async fn get_purchase(&self, id: PurchaseId) -> Result<Option<Purchase>> {
        get_json(&self.db, CF_PURCHASES, id.to_string().as_bytes())
    }

    async fn find_by_external_id(
        &self,
        provider: Provider,
        external_id: &str,
    ) -> Result<Option<Purchase>> {
        find_purchase(&self.db, provider, external_id)
    }
}

#[async_trait]
impl ReferralStore for RocksDBStore {
    async fn accruals_for(&self, referrer: &CustomerId) -> Result<Vec<ReferralAccrual>> {
        scan_json(&self.db, CF_REFERRALS, format!("{referrer}\0").as_bytes())
    }
}

#[async_trait]
impl UnmatchedStore for RocksDBStore {
    async fn record_unmatched(&self, event: PaymentEvent) -> Result<()> {
        let key = event.dedup_key().to_string();
        let _guard = self.commit_lock.lock().await;
        if self.db.get_pinned_cf(cf(&self.db, CF_UNMATCHED)?, &key)?.is_some() {
            return Ok(());
        }
        let mut batch = WriteBatch::default();
        put_json(&mut batch, &self.db, CF_UNMATCHED, key.as_bytes(), &event)?;
        self.db.write(batch)?;
        Ok(())
    }

    async fn unmatched(&self) -> Result<Vec<PaymentEvent>> {
        scan_json(&self.db, CF_UNMATCHED, b"")
    }
}

#[async_trait]
impl TransactionalStore for RocksDBStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        Ok(Box::new(RocksDBTransaction {
            db: Arc::clone(&self.db),
            commit_lock: Arc::clone(&self.commit_lock),
            writes: WriteSet::default(),
        }))
    }
}

/// Optimistic transaction over `RocksDBStore`.
pub struct RocksDBTransaction {
    db: Arc<DB>,
    commit_lock: Arc<Mutex<()>>,
    writes: WriteSet,
}

#[async_trait]
impl StoreTransaction for RocksDBTransaction {
    async fn purchase_by_external_id(
        &mut self,
        provider: Provider,
        external_id: &str,
    ) -> Result<Option<Purchase>> {
        if let Some(staged) = self.writes.staged_by_external(provider, external_id) {
            return Ok(Some(staged));
        }
        let purchase = find_purchase(&self.db, provider, external_id)?;
        if let Some(p) = &purchase {
            self.writes.observe(p);
        }
        Ok(purchase)
    }

    async fn customer(&mut self, id: &CustomerId) -> Result<Option<Customer>> {
        let committed: Option<Customer> = get_json(&self.db, CF_CUSTOMERS, id.as_str().as_bytes())?;
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
            None => get_json::<Purchase>(&self.db, CF_PURCHASES, id.to_string().as_bytes())?
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
        let committed = get_json::<Customer>(&self.db, CF_CUSTOMERS, id.as_str().as_bytes())?
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
        Ok(self
            .db
            .get_pinned_cf(cf(&self.db, CF_REFERRALS)?, accrual_key(referrer, purchase))?
            .is_some())
    }

    async fn create_referral_accrual(&mut self, accrual: ReferralAccrual) -> Result<()> {
        self.writes.accruals.push(accrual);
        Ok(())
    }

    async fn is_processed(&mut self, key: &DedupKey) -> Result<bool> {
        if self.writes.has_processed(key) {
            return Ok(true);
        }
        Ok(self
            .db
            .get_pinned_cf(cf(&self.db, CF_PROCESSED)?, key.to_string())?
            .is_some())
    }

    async fn mark_processed(&mut self, key: DedupKey) -> Result<()> {
        self.writes.processed.push(key);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<Committed> {
        let RocksDBTransaction {
            db,
            commit_lock,
            writes,
        } = *self;
        let _guard = commit_lock.lock().await;

        for id in writes.purchases.keys() {
            let current: Option<Purchase> = get_json(&db, CF_PURCHASES, id.to_string().as_bytes())?;
            writes.check_version(*id, current.map(|p| p.version))?;
        }
        for key in &writes.processed {
            if db.get_pinned_cf(cf(&db, CF_PROCESSED)?, key.to_string())?.is_some() {
                return Err(ReconcileError::TransactionConflict(format!(
                    "notification {key} already processed"
                )));
            }
        }
        for accrual in &writes.accruals {
            let key = accrual_key(&accrual.referrer, accrual.purchase);
            if db.get_pinned_cf(cf(&db, CF_REFERRALS)?, key)?.is_some() {
                return Err(ReconcileError::TransactionConflict(format!(
                    "accrual for {} on purchase {} already exists",
                    accrual.referrer, accrual.purchase
                )));
            }
        }

        let mut batch = WriteBatch::default();
        let mut committed = Committed::default();
        for (id, purchase) in writes.purchases {
            put_json(&mut batch, &db, CF_PURCHASES, id.to_string().as_bytes(), &purchase)?;
            committed.purchases.push(purchase);
        }
        for (id, (amount, months)) in writes.credits {
            let mut customer = get_json::<Customer>(&db, CF_CUSTOMERS, id.as_str().as_bytes())?
                .ok_or_else(|| {
                    ReconcileError::TransactionConflict(format!("customer {id} disappeared"))
                })?;
            customer.credit(amount, months);
            put_json(&mut batch, &db, CF_CUSTOMERS, id.as_str().as_bytes(), &customer)?;
            committed.customers.push(customer);
        }
        for accrual in writes.accruals {
            let key = accrual_key(&accrual.referrer, accrual.purchase);
            put_json(&mut batch, &db, CF_REFERRALS, &key, &accrual)?;
            committed.accruals.push(accrual);
        }
        for key in &writes.processed {
            batch.put_cf(cf(&db, CF_PROCESSED)?, key.to_string(), b"");
        }
        db.write(batch)?;

        Ok(committed)
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl SyncOutbox for RocksDBStore {
    async fn push_pending(&self, change: EntityChange) -> Result<()> {
        let mut batch = WriteBatch::default();
        put_json(&mut batch, &self.db, CF_SYNC_PENDING, change.key().as_bytes(), &change)?;
        self.db.write(batch)?;
        Ok(())
    }

    async fn remove_pending(&self, key: &str) -> Result<()> {
        self.db.delete_cf(cf(&self.db, CF_SYNC_PENDING)?, key)?;
        Ok(())
    }

    async fn pending(&self) -> Result<Vec<EntityChange>> {
        scan_json(&self.db, CF_SYNC_PENDING, b"")
    }

    async fn push_dead_letter(&self, letter: DeadLetter) -> Result<()> {
        let key = letter.change.key();
        let dead_key = format!("{}:{key}", letter.failed_at.timestamp_micros());
        let mut batch = WriteBatch::default();
        batch.delete_cf(cf(&self.db, CF_SYNC_PENDING)?, &key);
        put_json(&mut batch, &self.db, CF_SYNC_DEAD, dead_key.as_bytes(), &letter)?;
        self.db.write(batch)?;
        Ok(())
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        scan_json(&self.db, CF_SYNC_DEAD, b"")
    }
}
