use super::dispatcher::{DispatcherHandle, SyncDispatcher};
use super::engine::{Outcome, ReconciliationEngine};
use crate::config::Settings;
use crate::domain::customer::{Customer, CustomerId};
use crate::domain::event::{PaymentEvent, Provider, RawNotification};
use crate::domain::ports::{
    AdapterBox, CacheHandle, CacheKey, OutboxHandle, StoreHandle, SyncTargetHandle,
};
use crate::domain::purchase::{NewPurchase, Purchase, PurchaseId};
use crate::domain::referral::ReferralPolicy;
use crate::domain::sync::{DeadLetter, EntityChange};
use crate::error::{ReconcileError, Result};
use crate::infrastructure::cache::TtlCache;
use crate::interfaces::providers::{CryptoPayAdapter, YooKassaAdapter};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Reply to a provider's webhook delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acknowledgement {
    /// Processed, or already processed. The provider can stop redelivering.
    Accepted,
    /// Transient failure. The provider should redeliver.
    RetryLater,
    /// Will never succeed as delivered.
    Rejected(String),
}

/// Composition root: routes webhooks to adapters and the engine, and serves
/// customer and purchase intake and read projections.
pub struct Orchestrator {
    adapters: HashMap<Provider, AdapterBox>,
    engine: ReconciliationEngine,
    store: StoreHandle,
    cache: CacheHandle,
    cache_ttl: Duration,
    dispatcher: DispatcherHandle,
}

impl Orchestrator {
    pub fn new(
        adapters: Vec<AdapterBox>,
        engine: ReconciliationEngine,
        store: StoreHandle,
        cache: CacheHandle,
        cache_ttl: Duration,
        dispatcher: DispatcherHandle,
    ) -> Self {
        Self {
            adapters: adapters.into_iter().map(|a| (a.provider(), a)).collect(),
            engine,
            store,
            cache,
            cache_ttl,
            dispatcher,
        }
    }

    /// Wires the default stack: both provider adapters, a `TtlCache`, and a
    /// dispatcher whose worker starts immediately. Needs a running Tokio runtime.
    pub fn from_settings(
        settings: &Settings,
        store: StoreHandle,
        outbox: OutboxHandle,
        target: SyncTargetHandle,
    ) -> Self {
        let cache: CacheHandle = Arc::new(TtlCache::new(settings.cache.capacity));
        let dispatcher = SyncDispatcher::start(outbox, target, settings.sync.clone());
        let engine = ReconciliationEngine::new(
            Arc::clone(&store),
            Arc::clone(&cache),
            Arc::clone(&dispatcher),
            ReferralPolicy::new(settings.referral.percent),
            settings.engine.clone(),
        );
        let adapters: Vec<AdapterBox> = vec![
            Box::new(CryptoPayAdapter::new(
                settings.providers.crypto_pay_token.as_deref(),
            )),
            Box::new(YooKassaAdapter::new(
                settings.providers.yookassa_secret.as_deref(),
            )),
        ];
        Self::new(
            adapters,
            engine,
            store,
            cache,
            settings.cache.ttl(),
            dispatcher,
        )
    }

    /// Handles one inbound webhook end to end.
    pub async fn handle(&self, raw: &RawNotification) -> Acknowledgement {
        match self.process(raw).await {
            Ok(_) => Acknowledgement::Accepted,
            Err(e) if e.is_retryable() => {
                warn!(provider = %raw.provider, error = %e, "notification deferred");
                Acknowledgement::RetryLater
            }
            Err(e) => {
                warn!(provider = %raw.provider, error = %e, "notification rejected");
                Acknowledgement::Rejected(e.to_string())
            }
        }
    }

    /// Like `handle`, but returns the engine outcome or the error itself.
    pub async fn process(&self, raw: &RawNotification) -> Result<Outcome> {
        let adapter = self
            .adapters
            .get(&raw.provider)
            .ok_or(ReconcileError::UnsupportedProvider(raw.provider))?;
        let event = adapter.normalize(raw)?;
        let result = self.engine.reconcile(&event).await;
        if let Err(ReconcileError::OrphanEvent { .. }) = &result
            && let Err(e) = self.store.record_unmatched(event.clone()).await
        {
            error!(
                provider = %event.provider,
                external_id = %event.external_id,
                error = %e,
                "unmatched payment event could not be recorded"
            );
        }
        result
    }

    /// First contact. Returns `false` if the customer already existed; the
    /// stored referrer is never overwritten.
    pub async fn register_customer(
        &self,
        id: CustomerId,
        referred_by: Option<CustomerId>,
    ) -> Result<bool> {
        let referred_by = referred_by.filter(|r| r != &id);
        let inserted = self.store.insert_customer(Customer::new(id.clone(), referred_by)).await?;
        if inserted {
            info!(customer = %id, "customer registered");
        }
        Ok(inserted)
    }

    /// Opens a payment intent in `Initiated` state.
    pub async fn open_purchase(&self, intent: NewPurchase) -> Result<Purchase> {
        if intent.months == 0 {
            return Err(ReconcileError::ValidationError(
                "purchase must cover at least one month".into(),
            ));
        }
        if intent.external_id.trim().is_empty() {
            return Err(ReconcileError::ValidationError(
                "purchase needs the provider's transaction id".into(),
            ));
        }
        if self.store.get_customer(&intent.customer).await?.is_none() {
            return Err(ReconcileError::ValidationError(format!(
                "unknown customer {}",
                intent.customer
            )));
        }
        let purchase = Purchase::open(intent);
        self.store.insert_purchase(purchase.clone()).await?;
        info!(
            purchase_id = %purchase.id,
            customer = %purchase.customer,
            provider = %purchase.provider,
            external_id = %purchase.external_id,
            "purchase opened"
        );
        Ok(purchase)
    }

    /// Marks a customer deactivated and mirrors the change.
    pub async fn deactivate_customer(&self, id: &CustomerId) -> Result<Option<Customer>> {
        let Some(customer) = self.store.deactivate_customer(id).await? else {
            return Ok(None);
        };
        if let Err(e) = self.cache.invalidate(&CacheKey::customer(id)).await {
            warn!(customer = %id, error = %e, "cache invalidation failed");
        }
        self.dispatcher
            .enqueue(EntityChange::customer(&customer)?)
            .await?;
        Ok(Some(customer))
    }

    pub async fn customer_view(&self, id: &CustomerId) -> Result<Option<Customer>> {
        let key = CacheKey::customer(id);
        self.read_through(key, self.store.get_customer(id)).await
    }

    pub async fn purchase_view(&self, id: PurchaseId) -> Result<Option<Purchase>> {
        let key = CacheKey::purchase(id);
        self.read_through(key, self.store.get_purchase(id)).await
    }

    /// Serves `key` from the cache, or runs `load` and caches its result.
    ///
    /// The key's generation is read before loading; if a commit invalidates the
    /// key meanwhile, the loaded snapshot is returned but not cached.
    async fn read_through<T, F>(&self, key: CacheKey, load: F) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: Future<Output = Result<Option<T>>>,
    {
        match self.cache.get(&key).await {
            Ok(Some(hit)) => match serde_json::from_value(hit) {
                Ok(value) => return Ok(Some(value)),
                Err(e) => warn!(%key, error = %e, "undecodable cache entry ignored"),
            },
            Ok(None) => {}
            Err(e) => warn!(%key, error = %e, "cache read failed"),
        }

        let generation = match self.cache.generation(&key).await {
            Ok(generation) => Some(generation),
            Err(e) => {
                warn!(%key, error = %e, "cache read failed");
                None
            }
        };
        let loaded = load.await?;
        if let (Some(value), Some(generation)) = (&loaded, generation) {
            let cached = match serde_json::to_value(value) {
                Ok(json) => {
                    self.cache
                        .set_if_current(key.clone(), json, self.cache_ttl, generation)
                        .await
                }
                Err(e) => Err(e.into()),
            };
            match cached {
                Ok(true) => {}
                Ok(false) => debug!(%key, "snapshot superseded while loading, not cached"),
                Err(e) => warn!(%key, error = %e, "cache write failed"),
            }
        }
        Ok(loaded)
    }

    pub async fn all_customers(&self) -> Result<Vec<Customer>> {
        self.store.all_customers().await
    }

    /// Events that matched no purchase, kept for operator review.
    pub async fn unmatched(&self) -> Result<Vec<PaymentEvent>> {
        self.store.unmatched().await
    }

    pub async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        self.dispatcher.dead_letters().await
    }

    /// Waits up to `timeout` for queued changes to be delivered, then stops
    /// the dispatcher. Whatever is still pending stays in the outbox.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        let drained = self.dispatcher.drain(timeout).await?;
        if !drained {
            let pending = self.dispatcher.pending().await?.len();
            error!(pending, "sync queue not drained before shutdown");
        }
        self.dispatcher.shutdown().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::money::Amount;
    use crate::domain::ports::{Cache, CustomerStore};
    use crate::domain::purchase::PurchaseState;
    use crate::infrastructure::in_memory::{InMemoryOutbox, InMemoryStore};
    use crate::infrastructure::sync_target::LogSyncTarget;
    use rust_decimal_macros::dec;

    fn orchestrator(store: &InMemoryStore) -> Orchestrator {
        Orchestrator::from_settings(
            &Settings::default(),
            Arc::new(store.clone()),
            Arc::new(InMemoryOutbox::new()),
            Arc::new(LogSyncTarget::new()),
        )
    }

    fn intent(external_id: &str) -> NewPurchase {
        NewPurchase {
            customer: CustomerId::new("alice"),
            amount: Amount::new(dec!(350)).unwrap(),
            currency: "RUB".into(),
            provider: Provider::Fiat,
            months: 3,
            external_id: external_id.into(),
        }
    }

    #[tokio::test]
    async fn test_register_customer_is_idempotent() {
        let store = InMemoryStore::new();
        let orch = orchestrator(&store);
        let alice = CustomerId::new("alice");

        assert!(orch.register_customer(alice.clone(), Some(alice.clone())).await.unwrap());
        assert!(
            !orch
                .register_customer(alice.clone(), Some(CustomerId::new("bob")))
                .await
                .unwrap()
        );

        let stored = store.get_customer(&alice).await.unwrap().unwrap();
        assert_eq!(stored.referred_by, None);
    }

    #[tokio::test]
    async fn test_open_purchase_validation() {
        let store = InMemoryStore::new();
        let orch = orchestrator(&store);

        assert!(matches!(
            orch.open_purchase(intent("pay-1")).await,
            Err(ReconcileError::ValidationError(_))
        ));

        orch.register_customer(CustomerId::new("alice"), None).await.unwrap();
        let purchase = orch.open_purchase(intent("pay-1")).await.unwrap();
        assert_eq!(purchase.state, PurchaseState::Initiated);

        assert!(matches!(
            orch.open_purchase(intent("pay-1")).await,
            Err(ReconcileError::ValidationError(_))
        ));
        let mut zero_months = intent("pay-2");
        zero_months.months = 0;
        assert!(orch.open_purchase(zero_months).await.is_err());
    }

    #[tokio::test]
    async fn test_customer_view_reads_through_cache() {
        let store = InMemoryStore::new();
        let orch = orchestrator(&store);
        let alice = CustomerId::new("alice");
        orch.register_customer(alice.clone(), None).await.unwrap();

        assert!(orch.customer_view(&alice).await.unwrap().unwrap().is_active());

        // Behind the orchestrator's back: the cached snapshot is still served.
        store.deactivate_customer(&alice).await.unwrap();
        assert!(orch.customer_view(&alice).await.unwrap().unwrap().is_active());

        orch.deactivate_customer(&alice).await.unwrap();
        assert!(!orch.customer_view(&alice).await.unwrap().unwrap().is_active());
        assert!(orch.customer_view(&CustomerId::new("nobody")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_orphan_leaves_cache_untouched_and_is_recorded() {
        let store = InMemoryStore::new();
        let orch = orchestrator(&store);
        let alice = CustomerId::new("alice");
        orch.register_customer(alice.clone(), None).await.unwrap();
        let purchase = orch.open_purchase(intent("pay-1")).await.unwrap();
        orch.customer_view(&alice).await.unwrap();
        orch.purchase_view(purchase.id).await.unwrap();

        let keys = [CacheKey::customer(&alice), CacheKey::purchase(purchase.id)];
        let mut generations = Vec::new();
        for key in &keys {
            generations.push(orch.cache.generation(key).await.unwrap());
        }

        let body = br#"{"event": "payment.succeeded", "object": {"id": "pay-404", "status": "succeeded", "amount": {"value": "350.00", "currency": "RUB"}}}"#;
        let ack = orch
            .handle(&RawNotification::new(Provider::Fiat, body.to_vec()))
            .await;
        assert!(matches!(ack, Acknowledgement::Rejected(_)));

        for (key, generation) in keys.iter().zip(generations) {
            assert!(orch.cache.get(key).await.unwrap().is_some());
            assert_eq!(orch.cache.generation(key).await.unwrap(), generation);
        }

        // A second orchestrator over the same store still sees the orphan.
        let restarted = orchestrator(&store);
        let unmatched = restarted.unmatched().await.unwrap();
        assert_eq!(unmatched.len(), 1);
        assert_eq!(unmatched[0].external_id, "pay-404");
    }

    #[tokio::test]
    async fn test_unregistered_provider_is_rejected() {
        let store = InMemoryStore::new();
        let full = orchestrator(&store);
        let orch = Orchestrator::new(
            vec![Box::new(CryptoPayAdapter::new(None))],
            full.engine,
            Arc::new(store.clone()),
            Arc::new(TtlCache::default()),
            Duration::from_secs(60),
            full.dispatcher,
        );

        let ack = orch
            .handle(&RawNotification::new(Provider::Fiat, b"{}".to_vec()))
            .await;
        assert!(matches!(ack, Acknowledgement::Rejected(reason) if reason.contains("fiat")));
    }
}
