use crate::error::ReconcileError;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign};

/// Decimal places kept for credited money.
pub const MONEY_SCALE: u32 = 2;

/// Accumulated money owned by a customer.
///
/// Wraps `rust_decimal::Decimal` so balances and payment amounts cannot be mixed
/// up in signatures.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
pub struct Balance(pub Decimal);

/// A strictly positive amount charged for a purchase.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Amount(Decimal);

impl Amount {
    pub fn new(value: Decimal) -> Result<Self, ReconcileError> {
        if value > Decimal::ZERO {
            Ok(Self(value))
        } else {
            Err(ReconcileError::ValidationError(
                "Amount must be positive".to_string(),
            ))
        }
    }

    pub fn value(&self) -> Decimal {
        self.0
    }

    /// `percent` of this amount, rounded to cents with midpoints away from zero.
    pub fn percent(&self, percent: Decimal) -> Balance {
        let share = self.0 * percent / Decimal::ONE_HUNDRED;
        Balance(share.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero))
    }
}

impl TryFrom<Decimal> for Amount {
    type Error = ReconcileError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Amount> for Decimal {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

impl From<Amount> for Balance {
    fn from(amount: Amount) -> Self {
        Self(amount.0)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Balance {
    pub const ZERO: Self = Self(Decimal::ZERO);

    pub fn new(amount: Decimal) -> Self {
        Self(amount)
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl Add for Balance {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl AddAssign for Balance {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl fmt::Display for Balance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.normalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_balance_arithmetic() {
        let mut b1 = Balance::new(dec!(10.0));
        let b2 = Balance::new(dec!(5.0));
        assert_eq!(b1 + b2, Balance::new(dec!(15.0)));
        b1 += b2;
        assert_eq!(b1, Balance::new(dec!(15.0)));
    }

    #[test]
    fn test_amount_validation() {
        assert!(Amount::new(dec!(1.0)).is_ok());
        assert!(matches!(
            Amount::new(dec!(0.0)),
            Err(ReconcileError::ValidationError(_))
        ));
        assert!(matches!(
            Amount::new(dec!(-1.0)),
            Err(ReconcileError::ValidationError(_))
        ));
    }

    #[test]
    fn test_amount_deserialization_rejects_non_positive() {
        assert!(serde_json::from_str::<Amount>("\"12.50\"").is_ok());
        assert!(serde_json::from_str::<Amount>("\"0\"").is_err());
    }

    #[test]
    fn test_percent_rounds_to_cents() {
        let amount = Amount::new(dec!(153.00)).unwrap();
        assert_eq!(amount.percent(dec!(5)), Balance::new(dec!(7.65)));

        let odd = Amount::new(dec!(0.10)).unwrap();
        // 0.005 rounds away from zero
        assert_eq!(odd.percent(dec!(5)), Balance::new(dec!(0.01)));
    }

    #[test]
    fn test_balance_display_is_normalized() {
        assert_eq!(Balance::new(dec!(100.00)).to_string(), "100");
        assert_eq!(Balance::new(dec!(7.50)).to_string(), "7.5");
    }
}
