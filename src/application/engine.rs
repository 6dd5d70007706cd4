use super::dispatcher::DispatcherHandle;
use super::locks::PurchaseLocks;
use crate::config::EngineSettings;
use crate::domain::customer::Customer;
use crate::domain::event::PaymentEvent;
use crate::domain::ports::{CacheHandle, CacheKey, Committed, StoreHandle, StoreTransaction};
use crate::domain::purchase::{Purchase, PurchaseId, PurchaseState, Transition};
use crate::domain::referral::ReferralPolicy;
use crate::domain::sync::EntityChange;
use crate::error::{ReconcileError, Result};
use backon::{BackoffBuilder, ExponentialBuilder};
use chrono::Utc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// What reconciling one payment event did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The purchase moved from `from` to `to` and all side effects committed.
    Applied {
        purchase: PurchaseId,
        from: PurchaseState,
        to: PurchaseState,
    },
    /// The event was already applied, or the purchase is terminal.
    Duplicate {
        purchase: PurchaseId,
        state: PurchaseState,
    },
    /// The event does not advance the purchase.
    Stale {
        purchase: PurchaseId,
        state: PurchaseState,
    },
}

/// Drives purchases through their state machine from normalized payment events.
///
/// Each event runs in one store transaction inside the purchase's exclusive
/// scope: the dedup check, the state change, the customer credit, the
/// referral accrual and the dedup record commit together or not at all.
/// Cache invalidation happens before the scope is released; sync enqueueing
/// after.
pub struct ReconciliationEngine {
    store: StoreHandle,
    cache: CacheHandle,
    dispatcher: DispatcherHandle,
    locks: PurchaseLocks,
    policy: ReferralPolicy,
    settings: EngineSettings,
}

impl ReconciliationEngine {
    pub fn new(
        store: StoreHandle,
        cache: CacheHandle,
        dispatcher: DispatcherHandle,
        policy: ReferralPolicy,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            cache,
            dispatcher,
            locks: PurchaseLocks::new(),
            policy,
            settings,
        }
    }

    /// Reconciles one event, re-running it on timeouts and conflicts.
    ///
    /// Once the attempts are used up the last retryable error is returned so the
    /// provider redelivers later.
    #[tracing::instrument(
        name = "engine.reconcile",
        skip_all,
        fields(provider = %event.provider, external_id = %event.external_id, status = %event.status)
    )]
    pub async fn reconcile(&self, event: &PaymentEvent) -> Result<Outcome> {
        let max_attempts = self.settings.max_attempts.max(1);
        let backoff = ExponentialBuilder::default()
            .with_min_delay(self.settings.retry_min_delay())
            .with_max_delay(self.settings.retry_max_delay())
            .with_max_times(max_attempts - 1)
            .with_jitter()
            .build();

        let mut last_error = None;
        for (attempt, delay) in std::iter::once(Duration::ZERO).chain(backoff).enumerate() {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
            }
            match self.reconcile_once(event).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_retryable() => {
                    warn!(attempt = attempt + 1, max_attempts, error = %e, "reconciliation attempt failed");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            ReconcileError::TransactionConflict("no reconciliation attempt was made".into())
        }))
    }

    async fn reconcile_once(&self, event: &PaymentEvent) -> Result<Outcome> {
        let Some(purchase) = self
            .store
            .find_by_external_id(event.provider, &event.external_id)
            .await?
        else {
            error!("payment event matches no purchase");
            return Err(ReconcileError::OrphanEvent {
                provider: event.provider,
                external_id: event.external_id.clone(),
            });
        };

        let guard = self.locks.acquire(purchase.id).await;

        let timeout = self.settings.transaction_timeout();
        let (outcome, committed) = tokio::time::timeout(timeout, self.run_transaction(event))
            .await
            .map_err(|_| ReconcileError::TransactionTimeout(timeout))??;

        self.invalidate(&committed).await;
        drop(guard);

        if let Outcome::Applied { to, .. } = outcome
            && to.is_mirrored()
        {
            self.enqueue_sync(&committed).await;
        }
        Ok(outcome)
    }

    async fn run_transaction(&self, event: &PaymentEvent) -> Result<(Outcome, Committed)> {
        let mut tx = self.store.begin().await?;
        let outcome = match self.stage(tx.as_mut(), event).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "rollback failed");
                }
                return Err(e);
            }
        };

        match outcome {
            Outcome::Applied { purchase, from, to } => {
                let committed = tx.commit().await?;
                info!(purchase_id = %purchase, %from, %to, "purchase transitioned");
                Ok((outcome, committed))
            }
            _ => {
                tx.rollback().await?;
                Ok((outcome, Committed::default()))
            }
        }
    }

    /// Stages the event's effects in `tx`. Nothing is written unless the caller commits.
    async fn stage(&self, tx: &mut dyn StoreTransaction, event: &PaymentEvent) -> Result<Outcome> {
        let key = event.dedup_key();
        let purchase = tx
            .purchase_by_external_id(event.provider, &event.external_id)
            .await?
            .ok_or_else(|| ReconcileError::OrphanEvent {
                provider: event.provider,
                external_id: event.external_id.clone(),
            })?;

        if tx.is_processed(&key).await? {
            debug!(purchase_id = %purchase.id, %key, "notification already processed");
            return Ok(Outcome::Duplicate {
                purchase: purchase.id,
                state: purchase.state,
            });
        }

        let from = purchase.state;
        let to = match from.on(event.status) {
            Transition::Apply(to) => to,
            Transition::Duplicate => {
                debug!(purchase_id = %purchase.id, state = %from, "purchase already settled");
                return Ok(Outcome::Duplicate {
                    purchase: purchase.id,
                    state: from,
                });
            }
            Transition::Stale => {
                warn!(purchase_id = %purchase.id, state = %from, "stale notification ignored");
                return Ok(Outcome::Stale {
                    purchase: purchase.id,
                    state: from,
                });
            }
        };

        purchase.validate_payment(event)?;
        tx.update_purchase_state(purchase.id, to, Utc::now()).await?;

        if to.credits_customer() {
            let customer = tx.customer(&purchase.customer).await?.ok_or_else(|| {
                ReconcileError::ValidationError(format!(
                    "purchase {} belongs to unknown customer {}",
                    purchase.id, purchase.customer
                ))
            })?;
            tx.credit_customer(&customer.id, purchase.amount.into(), purchase.months)
                .await?;
            self.accrue_referral(tx, &customer, &purchase).await?;
        }

        tx.mark_processed(key).await?;
        Ok(Outcome::Applied {
            purchase: purchase.id,
            from,
            to,
        })
    }

    async fn accrue_referral(
        &self,
        tx: &mut dyn StoreTransaction,
        customer: &Customer,
        purchase: &Purchase,
    ) -> Result<()> {
        let Some(referrer) = &customer.referred_by else {
            return Ok(());
        };
        if referrer == &customer.id {
            warn!(customer = %customer.id, "self-referral ignored");
            return Ok(());
        }
        match tx.customer(referrer).await? {
            Some(r) if r.is_active() => {}
            Some(_) => {
                warn!(%referrer, purchase_id = %purchase.id, "referrer deactivated, no commission");
                return Ok(());
            }
            None => {
                warn!(%referrer, purchase_id = %purchase.id, "referrer not found, no commission");
                return Ok(());
            }
        }
        if tx.referral_accrual_exists(referrer, purchase.id).await? {
            debug!(%referrer, purchase_id = %purchase.id, "commission already accrued");
            return Ok(());
        }
        let Some(accrual) = self
            .policy
            .accrue(referrer.clone(), purchase.id, purchase.amount)
        else {
            return Ok(());
        };
        tx.credit_customer(referrer, accrual.commission, 0).await?;
        debug!(%referrer, commission = %accrual.commission, "referral commission accrued");
        tx.create_referral_accrual(accrual).await
    }

    async fn invalidate(&self, committed: &Committed) {
        let keys = committed
            .purchases
            .iter()
            .map(|p| CacheKey::purchase(p.id))
            .chain(committed.customers.iter().map(|c| CacheKey::customer(&c.id)));
        for key in keys {
            if let Err(e) = self.cache.invalidate(&key).await {
                warn!(%key, error = %e, "cache invalidation failed");
            }
        }
    }

    async fn enqueue_sync(&self, committed: &Committed) {
        let changes = committed
            .purchases
            .iter()
            .map(EntityChange::purchase)
            .chain(committed.customers.iter().map(EntityChange::customer));
        for change in changes {
            let queued = match change {
                Ok(change) => self.dispatcher.enqueue(change).await,
                Err(e) => Err(e.into()),
            };
            if let Err(e) = queued {
                error!(error = %e, "committed change could not be queued for sync");
            }
        }
    }
}
