use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Payment gateway a notification came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Cryptocurrency processor.
    Crypto,
    /// Fiat card processor.
    Fiat,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Crypto => "crypto",
            Provider::Fiat => "fiat",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "crypto" => Ok(Provider::Crypto),
            "fiat" => Ok(Provider::Fiat),
            other => Err(format!("unknown provider '{other}'")),
        }
    }
}

/// Provider-agnostic payment status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Confirmed,
    Failed,
    Expired,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Confirmed => "confirmed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalized notification of a payment status change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentEvent {
    pub provider: Provider,
    pub external_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub status: PaymentStatus,
    pub occurred_at: DateTime<Utc>,
}

impl PaymentEvent {
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            provider: self.provider,
            external_id: self.external_id.clone(),
            status: self.status,
        }
    }
}

/// Identity of one delivered fact: a given payment reaching a given status.
///
/// Including the status lets `pending` and later `confirmed` notifications for
/// the same payment both be applied while provider retries of either collapse.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DedupKey {
    pub provider: Provider,
    pub external_id: String,
    pub status: PaymentStatus,
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.provider, self.external_id, self.status)
    }
}

/// An inbound webhook exactly as received: provider identity, headers, body.
#[derive(Debug, Clone, PartialEq)]
pub struct RawNotification {
    pub provider: Provider,
    /// Header names are stored lowercased.
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl RawNotification {
    pub fn new(provider: Provider, body: impl Into<Vec<u8>>) -> Self {
        Self {
            provider,
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_dedup_key_distinguishes_status() {
        let mut event = PaymentEvent {
            provider: Provider::Fiat,
            external_id: "pay-1".into(),
            amount: dec!(100),
            currency: "RUB".into(),
            status: PaymentStatus::Pending,
            occurred_at: Utc::now(),
        };
        let pending = event.dedup_key();
        event.status = PaymentStatus::Confirmed;
        let confirmed = event.dedup_key();

        assert_ne!(pending, confirmed);
        assert_eq!(confirmed.to_string(), "fiat:pay-1:confirmed");
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let raw = RawNotification::new(Provider::Crypto, b"{}".to_vec())
            .with_header("Crypto-Pay-API-Signature", "abc");
        assert_eq!(raw.header("crypto-pay-api-signature"), Some("abc"));
        assert_eq!(raw.header("CRYPTO-PAY-API-SIGNATURE"), Some("abc"));
        assert_eq!(raw.header("missing"), None);
    }

    #[test]
    fn test_provider_parse() {
        assert_eq!("crypto".parse::<Provider>(), Ok(Provider::Crypto));
        assert_eq!("fiat".parse::<Provider>(), Ok(Provider::Fiat));
        assert!("paypal".parse::<Provider>().is_err());
    }
}
