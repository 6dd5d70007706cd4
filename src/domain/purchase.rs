use super::customer::CustomerId;
use super::event::{PaymentEvent, PaymentStatus, Provider};
use super::money::Amount;
use crate::error::ReconcileError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PurchaseId(pub Uuid);

impl PurchaseId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PurchaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PurchaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle of a purchase.
///
/// `Confirmed`, `Failed` and `Expired` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PurchaseState {
    Initiated,
    Pending,
    Confirmed,
    Failed,
    Expired,
}

/// What applying a payment status to a purchase state does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Move to the given state.
    Apply(PurchaseState),
    /// The purchase is already terminal; the event changes nothing.
    Duplicate,
    /// The purchase is live but the event does not advance it.
    Stale,
}

impl PurchaseState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PurchaseState::Confirmed | PurchaseState::Failed | PurchaseState::Expired
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PurchaseState::Initiated => "initiated",
            PurchaseState::Pending => "pending",
            PurchaseState::Confirmed => "confirmed",
            PurchaseState::Failed => "failed",
            PurchaseState::Expired => "expired",
        }
    }

    /// The transition table.
    pub fn on(self, status: PaymentStatus) -> Transition {
        use PaymentStatus as S;
        use PurchaseState as P;

        if self.is_terminal() {
            return Transition::Duplicate;
        }
        match (self, status) {
            (P::Initiated, S::Pending) => Transition::Apply(P::Pending),
            (P::Pending, S::Pending) => Transition::Stale,
            (_, S::Confirmed) => Transition::Apply(P::Confirmed),
            (_, S::Failed) => Transition::Apply(P::Failed),
            (_, S::Expired) => Transition::Apply(P::Expired),
            _ => Transition::Stale,
        }
    }

    /// Entering this state credits the customer and accrues referral commission.
    pub fn credits_customer(&self) -> bool {
        *self == PurchaseState::Confirmed
    }

    /// Entering this state is mirrored to the external system of record.
    pub fn is_mirrored(&self) -> bool {
        self.is_terminal()
    }
}

impl fmt::Display for PurchaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One attempted payment for a subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Purchase {
    pub id: PurchaseId,
    pub customer: CustomerId,
    pub amount: Amount,
    pub currency: String,
    pub provider: Provider,
    /// Subscription months bought.
    pub months: u32,
    pub state: PurchaseState,
    /// Transaction id assigned by the provider; unique per provider.
    pub external_id: String,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parameters for opening a payment intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPurchase {
    pub customer: CustomerId,
    pub amount: Amount,
    pub currency: String,
    pub provider: Provider,
    pub months: u32,
    pub external_id: String,
}

impl Purchase {
    pub fn open(intent: NewPurchase) -> Self {
        let now = Utc::now();
        Self {
            id: PurchaseId::new(),
            customer: intent.customer,
            amount: intent.amount,
            currency: intent.currency,
            provider: intent.provider,
            months: intent.months,
            state: PurchaseState::Initiated,
            external_id: intent.external_id,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Checks that a confirming event paid exactly this purchase.
    pub fn validate_payment(&self, event: &PaymentEvent) -> Result<(), ReconcileError> {
        if event.status != PaymentStatus::Confirmed {
            return Ok(());
        }
        if !event.currency.eq_ignore_ascii_case(&self.currency) {
            return Err(ReconcileError::AmountMismatch {
                purchase: self.id.to_string(),
                detail: format!("currency {} != {}", event.currency, self.currency),
            });
        }
        if event.amount != self.amount.value() {
            return Err(ReconcileError::AmountMismatch {
                purchase: self.id.to_string(),
                detail: format!("amount {} != {}", event.amount, self.amount),
            });
        }
        Ok(())
    }

    pub fn set_state(&mut self, state: PurchaseState, at: DateTime<Utc>) {
        self.state = state;
        self.updated_at = at;
        self.version += 1;
    }
}
