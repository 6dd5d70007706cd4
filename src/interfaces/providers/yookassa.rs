use super::{parse_amount, parse_body, parse_id, required};
use crate::domain::event::{PaymentEvent, PaymentStatus, Provider, RawNotification};
use crate::domain::ports::PaymentAdapter;
use crate::error::{ReconcileError, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use subtle::ConstantTimeEq;

pub const SECRET_HEADER: &str = "x-webhook-secret";

#[derive(Debug, Deserialize)]
struct Notification {
    event: Option<String>,
    object: Option<PaymentObject>,
}

#[derive(Debug, Deserialize)]
struct PaymentObject {
    id: Option<serde_json::Value>,
    status: Option<String>,
    amount: Option<MonetaryAmount>,
    created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct MonetaryAmount {
    value: Option<serde_json::Value>,
    currency: Option<String>,
}

/// Adapter for the fiat processor's payment notifications.
#[derive(Debug, Clone, Default)]
pub struct YooKassaAdapter {
    secret: Option<String>,
}

impl YooKassaAdapter {
    pub fn new(secret: Option<&str>) -> Self {
        Self {
            secret: secret.map(str::to_string),
        }
    }

    fn verify(&self, raw: &RawNotification) -> Result<()> {
        let Some(secret) = &self.secret else {
            return Ok(());
        };
        let presented = raw.header(SECRET_HEADER).unwrap_or_default();
        if bool::from(presented.as_bytes().ct_eq(secret.as_bytes())) {
            Ok(())
        } else {
            Err(ReconcileError::InvalidSignature(Provider::Fiat))
        }
    }

    fn map_status(status: &str) -> Result<PaymentStatus> {
        match status {
            "pending" | "waiting_for_capture" => Ok(PaymentStatus::Pending),
            "succeeded" => Ok(PaymentStatus::Confirmed),
            "canceled" => Ok(PaymentStatus::Failed),
            "expired" => Ok(PaymentStatus::Expired),
            other => Err(ReconcileError::UnknownStatus {
                provider: Provider::Fiat,
                status: other.to_string(),
            }),
        }
    }
}

impl PaymentAdapter for YooKassaAdapter {
    fn provider(&self) -> Provider {
        Provider::Fiat
    }

    fn normalize(&self, raw: &RawNotification) -> Result<PaymentEvent> {
        self.verify(raw)?;
        let notification: Notification = parse_body(raw)?;

        // Refund objects reuse the payment status words; they are not payments.
        if let Some(event) = notification.event.as_deref()
            && !event.starts_with("payment.")
        {
            return Err(ReconcileError::UnknownStatus {
                provider: Provider::Fiat,
                status: event.to_string(),
            });
        }

        let object = required(notification.object, "object")?;
        let external_id = parse_id(&required(object.id, "object.id")?)?;
        let amount = required(object.amount, "object.amount")?;
        let value = parse_amount(&required(amount.value, "object.amount.value")?)?;
        let currency = required(amount.currency, "object.amount.currency")?;
        let status = Self::map_status(&required(object.status, "object.status")?)?;

        Ok(PaymentEvent {
            provider: Provider::Fiat,
            external_id,
            amount: value,
            currency,
            status,
            occurred_at: object.created_at.unwrap_or_else(Utc::now),
        })
    }
}
