use crate::config::SyncSettings;
use crate::domain::ports::{OutboxHandle, SyncTargetHandle};
use crate::domain::sync::{DeadLetter, EntityChange};
use crate::error::{ReconcileError, Result};
use backon::{BackoffBuilder, ExponentialBuilder};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

pub type DispatcherHandle = Arc<SyncDispatcher>;

/// At-least-once propagation of committed changes to the external system of record.
///
/// Every change is written to the outbox before it is queued, so a full queue
/// or a restart never loses it: the worker replays the outbox on start and
/// sweeps it periodically. Delivery is retried with exponential backoff and
/// dead-lettered when attempts run out.
pub struct SyncDispatcher {
    sender: mpsc::Sender<EntityChange>,
    outbox: OutboxHandle,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SyncDispatcher {
    /// Spawns the delivery worker and returns its handle.
    pub fn start(outbox: OutboxHandle, target: SyncTargetHandle, settings: SyncSettings) -> DispatcherHandle {
        let (sender, receiver) = mpsc::channel(settings.queue_capacity.max(1));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let worker = SyncWorker {
            receiver,
            outbox: Arc::clone(&outbox),
            target,
            settings,
            shutdown: shutdown_rx,
        };
        let handle = tokio::spawn(worker.run());
        Arc::new(Self {
            sender,
            outbox,
            shutdown,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Records `change` as pending and hands it to the worker.
    ///
    /// Returns once the change is in the outbox; never waits for delivery.
    pub async fn enqueue(&self, change: EntityChange) -> Result<()> {
        let key = change.key();
        self.outbox.push_pending(change.clone()).await?;
        match self.sender.try_send(change) {
            Ok(()) => debug!(%key, "sync change queued"),
            Err(TrySendError::Full(_)) => {
                debug!(%key, "sync queue full, change left for the next sweep")
            }
            Err(TrySendError::Closed(_)) => {
                warn!(%key, "sync worker stopped, change kept in the outbox")
            }
        }
        Ok(())
    }

    pub async fn pending(&self) -> Result<Vec<EntityChange>> {
        self.outbox.pending().await
    }

    pub async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        self.outbox.dead_letters().await
    }

    /// Waits until the outbox has nothing pending. Returns `false` on timeout.
    pub async fn drain(&self, timeout: Duration) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.outbox.pending().await?.is_empty() {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Stops the worker. Retries in flight are abandoned and their changes
    /// stay pending for the next start.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        if let Some(handle) = self.worker.lock().await.take()
            && let Err(e) = handle.await
        {
            error!(error = %e, "sync worker panicked");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Delivered,
    DeadLettered,
    Cancelled,
}

struct SyncWorker {
    receiver: mpsc::Receiver<EntityChange>,
    outbox: OutboxHandle,
    target: SyncTargetHandle,
    settings: SyncSettings,
    shutdown: watch::Receiver<bool>,
}

impl SyncWorker {
    async fn run(mut self) {
        info!("sync worker started");
        if self.sweep().await == Delivery::Cancelled {
            return;
        }

        let mut ticker = tokio::time::interval(self.settings.sweep_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            if *self.shutdown.borrow() {
                break;
            }
            let outcome = tokio::select! {
                biased;
                _ = self.shutdown.changed() => Delivery::Cancelled,
                received = self.receiver.recv() => match received {
                    Some(change) => self.deliver(change).await,
                    None => Delivery::Cancelled,
                },
                _ = ticker.tick() => self.sweep().await,
            };
            if outcome == Delivery::Cancelled {
                break;
            }
        }
        info!("sync worker stopped");
    }

    /// Delivers everything pending in the outbox, each entity's versions in order.
    async fn sweep(&mut self) -> Delivery {
        // Anything still queued is also pending; the scan below covers it.
        while self.receiver.try_recv().is_ok() {}

        let mut pending = match self.outbox.pending().await {
            Ok(pending) => pending,
            Err(e) => {
                error!(error = %e, "failed to read sync outbox");
                return Delivery::Delivered;
            }
        };
        if !pending.is_empty() {
            debug!(count = pending.len(), "sweeping sync outbox");
        }
        // Outbox keys order versions as text, so 10 would come before 9.
        pending.sort_by(|a, b| (a.entity, &a.id, a.version).cmp(&(b.entity, &b.id, b.version)));
        for change in pending {
            if self.deliver(change).await == Delivery::Cancelled {
                return Delivery::Cancelled;
            }
        }
        Delivery::Delivered
    }

    #[tracing::instrument(name = "sync.deliver", skip_all, fields(key = %change.key()))]
    async fn deliver(&mut self, change: EntityChange) -> Delivery {
        let max_attempts = self.settings.max_attempts.max(1);
        let backoff = ExponentialBuilder::default()
            .with_min_delay(self.settings.min_delay())
            .with_max_delay(self.settings.max_delay())
            .with_max_times(max_attempts - 1)
            .with_jitter()
            .build();

        let mut last_error = String::new();
        let mut attempts = 0;
        for (attempt, delay) in std::iter::once(Duration::ZERO).chain(backoff).enumerate() {
            if *self.shutdown.borrow() {
                return Delivery::Cancelled;
            }
            if attempt > 0 {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.shutdown.changed() => return Delivery::Cancelled,
                }
            }
            attempts = attempt + 1;

            match self.target.push(&change).await {
                Ok(()) => {
                    if let Err(e) = self.outbox.remove_pending(&change.key()).await {
                        error!(error = %e, "delivered change could not be cleared from the outbox");
                    }
                    debug!(attempt = attempts, "sync change delivered");
                    return Delivery::Delivered;
                }
                Err(e) => {
                    warn!(attempt = attempts, max_attempts, error = %e, "sync delivery failed");
                    last_error = e.to_string();
                }
            }
        }

        let failure = ReconcileError::DeliveryFailure {
            key: change.key(),
            reason: last_error.clone(),
        };
        error!(attempts, error = %failure, "sync change dead-lettered");
        let letter = DeadLetter {
            change,
            attempts,
            last_error,
            failed_at: Utc::now(),
        };
        if let Err(e) = self.outbox.push_dead_letter(letter).await {
            error!(error = %e, "failed to record dead letter");
        }
        Delivery::DeadLettered
    }
}
