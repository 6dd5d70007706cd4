#![allow(dead_code)]

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use subsettle::application::orchestrator::Orchestrator;
use subsettle::config::Settings;
use subsettle::domain::customer::CustomerId;
use subsettle::domain::event::{Provider, RawNotification};
use subsettle::domain::money::Amount;
use subsettle::domain::ports::{OutboxHandle, SyncTarget, SyncTargetHandle};
use subsettle::domain::purchase::{NewPurchase, Purchase};
use subsettle::domain::sync::{EntityChange, EntityKind};
use subsettle::error::ReconcileError;
use subsettle::infrastructure::in_memory::{InMemoryOutbox, InMemoryStore};
use subsettle::infrastructure::sync_target::LogSyncTarget;

pub struct Stack {
    pub store: InMemoryStore,
    pub outbox: Arc<InMemoryOutbox>,
    pub orchestrator: Arc<Orchestrator>,
}

/// Remote end that records what it receives, or refuses everything while `down`.
#[derive(Default)]
pub struct RecordingTarget {
    down: AtomicBool,
    received: Mutex<Vec<EntityChange>>,
}

impl RecordingTarget {
    pub fn down() -> Arc<Self> {
        let target = Self::default();
        target.down.store(true, Ordering::SeqCst);
        Arc::new(target)
    }

    pub fn received(&self) -> Vec<EntityChange> {
        self.received.lock().unwrap().clone()
    }

    pub fn received_of(&self, entity: EntityKind) -> Vec<EntityChange> {
        self.received()
            .into_iter()
            .filter(|c| c.entity == entity)
            .collect()
    }
}

#[async_trait]
impl SyncTarget for RecordingTarget {
    async fn push(&self, change: &EntityChange) -> subsettle::error::Result<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(ReconcileError::DeliveryFailure {
                key: change.key(),
                reason: "connection refused".into(),
            });
        }
        self.received.lock().unwrap().push(change.clone());
        Ok(())
    }
}

pub fn fast_settings() -> Settings {
    let mut settings = Settings::default();
    settings.engine.retry_min_delay_ms = 1;
    settings.engine.retry_max_delay_ms = 5;
    settings.engine.max_attempts = 10;
    settings.sync.min_delay_ms = 1;
    settings.sync.max_delay_ms = 5;
    settings.sync.sweep_interval_ms = 20;
    settings
}

pub fn stack() -> Stack {
    stack_with(fast_settings(), Arc::new(LogSyncTarget::new()))
}

pub fn stack_with(settings: Settings, target: SyncTargetHandle) -> Stack {
    let store = InMemoryStore::new();
    let outbox = Arc::new(InMemoryOutbox::new());
    let handle: OutboxHandle = outbox.clone();
    let orchestrator = Orchestrator::from_settings(&settings, Arc::new(store.clone()), handle, target);
    Stack {
        store,
        outbox,
        orchestrator: Arc::new(orchestrator),
    }
}

pub async fn customer(orch: &Orchestrator, id: &str, referred_by: Option<&str>) {
    orch.register_customer(CustomerId::new(id), referred_by.map(CustomerId::new))
        .await
        .unwrap();
}

pub async fn fiat_purchase(orch: &Orchestrator, customer: &str, external_id: &str, amount: Decimal) -> Purchase {
    orch.open_purchase(NewPurchase {
        customer: CustomerId::new(customer),
        amount: Amount::new(amount).unwrap(),
        currency: "RUB".into(),
        provider: Provider::Fiat,
        months: 1,
        external_id: external_id.into(),
    })
    .await
    .unwrap()
}

pub async fn crypto_purchase(orch: &Orchestrator, customer: &str, invoice_id: u64, amount: Decimal) -> Purchase {
    orch.open_purchase(NewPurchase {
        customer: CustomerId::new(customer),
        amount: Amount::new(amount).unwrap(),
        currency: "USDT".into(),
        provider: Provider::Crypto,
        months: 12,
        external_id: invoice_id.to_string(),
    })
    .await
    .unwrap()
}

/// A fiat processor webhook for payment `id`.
pub fn fiat_notification(id: &str, status: &str, amount: &str) -> RawNotification {
    let body = serde_json::json!({
        "type": "notification",
        "event": format!("payment.{status}"),
        "object": {
            "id": id,
            "status": status,
            "amount": {"value": amount, "currency": "RUB"},
            "created_at": "2025-03-01T12:00:00.000Z"
        }
    });
    RawNotification::new(Provider::Fiat, serde_json::to_vec(&body).unwrap())
}

/// A crypto processor webhook for invoice `id`.
pub fn crypto_notification(id: u64, status: &str, amount: &str) -> RawNotification {
    let body = serde_json::json!({
        "update_id": id,
        "update_type": "invoice_paid",
        "request_date": "2025-01-01T10:00:00Z",
        "payload": {
            "invoice_id": id,
            "status": status,
            "amount": amount,
            "asset": "USDT"
        }
    });
    RawNotification::new(Provider::Crypto, serde_json::to_vec(&body).unwrap())
}
