//! Adapters that turn provider webhooks into `PaymentEvent`s.
//!
//! Each adapter only parses and validates; none of them touches a store.

pub mod crypto_pay;
pub mod yookassa;

pub use crypto_pay::CryptoPayAdapter;
pub use yookassa::YooKassaAdapter;

use crate::domain::event::RawNotification;
use crate::error::{ReconcileError, Result};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use std::str::FromStr;

fn malformed(msg: impl Into<String>) -> ReconcileError {
    ReconcileError::MalformedNotification(msg.into())
}

pub(crate) fn parse_body<T: DeserializeOwned>(raw: &RawNotification) -> Result<T> {
    serde_json::from_slice(&raw.body)
        .map_err(|e| malformed(format!("{} body is not valid JSON: {e}", raw.provider)))
}

pub(crate) fn required<T>(value: Option<T>, field: &str) -> Result<T> {
    value.ok_or_else(|| malformed(format!("missing {field}")))
}

/// Providers send amounts as decimal strings; a bare JSON number is accepted too.
pub(crate) fn parse_amount(value: &serde_json::Value) -> Result<Decimal> {
    let parsed = match value {
        serde_json::Value::String(s) => Decimal::from_str(s.trim()).ok(),
        serde_json::Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        _ => None,
    };
    match parsed {
        Some(amount) if amount > Decimal::ZERO => Ok(amount),
        _ => Err(malformed(format!("invalid amount {value}"))),
    }
}

/// Transaction ids arrive as strings or integers depending on the provider.
pub(crate) fn parse_id(value: &serde_json::Value) -> Result<String> {
    match value {
        serde_json::Value::String(s) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        _ => Err(malformed(format!("invalid transaction id {value}"))),
    }
}
