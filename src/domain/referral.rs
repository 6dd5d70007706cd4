use super::customer::CustomerId;
use super::money::{Amount, Balance};
use super::purchase::PurchaseId;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Commission owed to a referrer for one confirmed purchase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferralAccrual {
    pub referrer: CustomerId,
    pub purchase: PurchaseId,
    pub commission: Balance,
    pub applied: bool,
    pub created_at: DateTime<Utc>,
}

/// How much of a purchase goes to the referrer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReferralPolicy {
    pub percent: Decimal,
}

impl ReferralPolicy {
    pub fn new(percent: Decimal) -> Self {
        Self { percent }
    }

    pub fn commission(&self, amount: Amount) -> Balance {
        amount.percent(self.percent)
    }

    /// Builds the accrual for `purchase`, or `None` when the commission is zero.
    pub fn accrue(
        &self,
        referrer: CustomerId,
        purchase: PurchaseId,
        amount: Amount,
    ) -> Option<ReferralAccrual> {
        let commission = self.commission(amount);
        if commission.is_zero() {
            return None;
        }
        Some(ReferralAccrual {
            referrer,
            purchase,
            commission,
            applied: true,
            created_at: Utc::now(),
        })
    }
}
