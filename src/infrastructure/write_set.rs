use crate::domain::customer::{Customer, CustomerId};
use crate::domain::event::{DedupKey, Provider};
use crate::domain::money::Balance;
use crate::domain::purchase::{Purchase, PurchaseId, PurchaseState};
use crate::domain::referral::ReferralAccrual;
use crate::error::{ReconcileError, Result};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};

/// Writes buffered by a store transaction until it commits.
///
/// Purchases carry the version they were read at so a commit can detect a
/// concurrent writer. Customer credits are kept as deltas and folded into
/// whatever version is current at commit time.
#[derive(Debug, Default)]
pub(crate) struct WriteSet {
    pub read_versions: HashMap<PurchaseId, u64>,
    pub purchases: HashMap<PurchaseId, Purchase>,
    pub credits: BTreeMap<CustomerId, (Balance, u32)>,
    pub accruals: Vec<ReferralAccrual>,
    pub processed: Vec<DedupKey>,
}

impl WriteSet {
    /// Returns the transaction's own copy of a purchase if it already staged one.
    pub fn staged_by_external(&self, provider: Provider, external_id: &str) -> Option<Purchase> {
        self.purchases
            .values()
            .find(|p| p.provider == provider && p.external_id == external_id)
            .cloned()
    }

    pub fn observe(&mut self, purchase: &Purchase) {
        self.read_versions
            .entry(purchase.id)
            .or_insert(purchase.version);
    }

    pub fn stage_state(
        &mut self,
        mut purchase: Purchase,
        state: PurchaseState,
        at: DateTime<Utc>,
    ) -> Purchase {
        self.observe(&purchase);
        purchase.set_state(state, at);
        self.purchases.insert(purchase.id, purchase.clone());
        purchase
    }

    /// The customer as this transaction would leave it.
    pub fn project(&self, mut customer: Customer) -> Customer {
        if let Some((amount, months)) = self.credits.get(&customer.id) {
            customer.credit(*amount, *months);
        }
        customer
    }

    pub fn stage_credit(&mut self, customer: Customer, amount: Balance, months: u32) -> Customer {
        let entry = self
            .credits
            .entry(customer.id.clone())
            .or_insert((Balance::ZERO, 0));
        entry.0 += amount;
        entry.1 = entry.1.saturating_add(months);
        self.project(customer)
    }

    pub fn has_accrual(&self, referrer: &CustomerId, purchase: PurchaseId) -> bool {
        self.accruals
            .iter()
            .any(|a| &a.referrer == referrer && a.purchase == purchase)
    }

    pub fn has_processed(&self, key: &DedupKey) -> bool {
        self.processed.contains(key)
    }

    /// Checks a staged purchase against the version currently committed.
    pub fn check_version(&self, id: PurchaseId, current: Option<u64>) -> Result<()> {
        let read = self.read_versions.get(&id).copied();
        if read.is_some() && read == current {
            Ok(())
        } else {
            Err(ReconcileError::TransactionConflict(format!(
                "purchase {id} changed since read ({read:?} -> {current:?})"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::money::Amount;
    use crate::domain::purchase::NewPurchase;
    use rust_decimal_macros::dec;

    fn purchase() -> Purchase {
        Purchase::open(NewPurchase {
            customer: CustomerId::new("1"),
            amount: Amount::new(dec!(100)).unwrap(),
            currency: "RUB".into(),
            provider: Provider::Fiat,
            months: 3,
            external_id: "pay-1".into(),
        })
    }

    #[test]
    fn test_credits_accumulate_as_one_delta() {
        let mut ws = WriteSet::default();
        let customer = Customer::new(CustomerId::new("1"), None);

        ws.stage_credit(customer.clone(), Balance::new(dec!(100)), 3);
        let projected = ws.stage_credit(customer, Balance::new(dec!(5)), 0);

        assert_eq!(projected.balance, Balance::new(dec!(105)));
        assert_eq!(projected.entitled_months, 3);
        assert_eq!(projected.version, 1);
    }

    #[test]
    fn test_version_check_detects_concurrent_commit() {
        let mut ws = WriteSet::default();
        let p = purchase();
        let staged = ws.stage_state(p.clone(), PurchaseState::Confirmed, Utc::now());

        assert_eq!(staged.version, 1);
        assert!(ws.check_version(p.id, Some(0)).is_ok());
        assert!(matches!(
            ws.check_version(p.id, Some(1)),
            Err(ReconcileError::TransactionConflict(_))
        ));
        assert!(ws.staged_by_external(Provider::Fiat, "pay-1").is_some());
        assert!(ws.staged_by_external(Provider::Crypto, "pay-1").is_none());
    }
}
