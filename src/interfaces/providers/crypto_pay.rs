use super::{parse_amount, parse_body, parse_id, required};
use crate::domain::event::{PaymentEvent, PaymentStatus, Provider, RawNotification};
use crate::domain::ports::PaymentAdapter;
use crate::error::{ReconcileError, Result};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "crypto-pay-api-signature";

#[derive(Debug, Deserialize)]
struct Update {
    request_date: Option<DateTime<Utc>>,
    payload: Option<Invoice>,
}

#[derive(Debug, Deserialize)]
struct Invoice {
    invoice_id: Option<serde_json::Value>,
    status: Option<String>,
    amount: Option<serde_json::Value>,
    asset: Option<String>,
    fiat: Option<String>,
    paid_at: Option<DateTime<Utc>>,
}

/// Adapter for the cryptocurrency processor's invoice webhooks.
///
/// With an API token configured, the body must carry a valid
/// `crypto-pay-api-signature`: hex HMAC-SHA256 of the raw body keyed with
/// SHA-256 of the token.
#[derive(Debug, Clone, Default)]
pub struct CryptoPayAdapter {
    secret: Option<Vec<u8>>,
}

impl CryptoPayAdapter {
    pub fn new(api_token: Option<&str>) -> Self {
        Self {
            secret: api_token.map(|token| Sha256::digest(token.as_bytes()).to_vec()),
        }
    }

    /// Signs `body` the way the processor does. Used for replaying captured webhooks.
    pub fn sign(api_token: &str, body: &[u8]) -> Result<String> {
        let secret = Sha256::digest(api_token.as_bytes());
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&secret)
            .map_err(|e| ReconcileError::InternalError(Box::new(std::io::Error::other(e.to_string()))))?;
        Mac::update(&mut mac, body);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn verify(&self, raw: &RawNotification) -> Result<()> {
        let Some(secret) = &self.secret else {
            return Ok(());
        };
        let signature = raw
            .header(SIGNATURE_HEADER)
            .and_then(|h| hex::decode(h.trim()).ok())
            .ok_or(ReconcileError::InvalidSignature(Provider::Crypto))?;
        let mut mac = <HmacSha256 as Mac>::new_from_slice(secret)
            .map_err(|_| ReconcileError::InvalidSignature(Provider::Crypto))?;
        Mac::update(&mut mac, &raw.body);
        mac.verify_slice(&signature)
            .map_err(|_| ReconcileError::InvalidSignature(Provider::Crypto))
    }

    fn map_status(status: &str) -> Result<PaymentStatus> {
        match status {
            "active" => Ok(PaymentStatus::Pending),
            "paid" => Ok(PaymentStatus::Confirmed),
            "expired" => Ok(PaymentStatus::Expired),
            other => Err(ReconcileError::UnknownStatus {
                provider: Provider::Crypto,
                status: other.to_string(),
            }),
        }
    }
}

impl PaymentAdapter for CryptoPayAdapter {
    fn provider(&self) -> Provider {
        Provider::Crypto
    }

    fn normalize(&self, raw: &RawNotification) -> Result<PaymentEvent> {
        self.verify(raw)?;
        let update: Update = parse_body(raw)?;
        let invoice = required(update.payload, "payload")?;

        let external_id = parse_id(&required(invoice.invoice_id, "payload.invoice_id")?)?;
        let amount = parse_amount(&required(invoice.amount, "payload.amount")?)?;
        let status = Self::map_status(&required(invoice.status, "payload.status")?)?;
        let currency = required(invoice.asset.or(invoice.fiat), "payload.asset")?;

        Ok(PaymentEvent {
            provider: Provider::Crypto,
            external_id,
            amount,
            currency,
            status,
            occurred_at: invoice
                .paid_at
                .or(update.request_date)
                .unwrap_or_else(Utc::now),
        })
    }
}
