use crate::domain::customer::CustomerId;
use crate::domain::event::{Provider, RawNotification};
use crate::domain::purchase::NewPurchase;
use crate::error::{ReconcileError, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::io::BufRead;

/// One line of a replay journal.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum JournalRecord {
    /// First contact with a customer.
    Customer {
        id: CustomerId,
        #[serde(default)]
        referred_by: Option<CustomerId>,
    },
    /// A payment intent opened with a provider.
    Purchase(NewPurchase),
    /// A webhook as the provider delivered it.
    Notification {
        provider: Provider,
        #[serde(default)]
        headers: HashMap<String, String>,
        body: serde_json::Value,
    },
    Deactivate {
        id: CustomerId,
    },
}

impl JournalRecord {
    /// Rebuilds the raw webhook of a `notification` record.
    ///
    /// A string body is taken byte for byte so recorded signatures still
    /// verify; any other JSON value is re-serialized.
    pub fn into_notification(self) -> Option<Result<RawNotification>> {
        let JournalRecord::Notification {
            provider,
            headers,
            body,
        } = self
        else {
            return None;
        };
        let bytes = match body {
            serde_json::Value::String(s) => Ok(s.into_bytes()),
            other => serde_json::to_vec(&other).map_err(ReconcileError::from),
        };
        Some(bytes.map(|body| {
            headers
                .iter()
                .fold(RawNotification::new(provider, body), |raw, (name, value)| {
                    raw.with_header(name, value.clone())
                })
        }))
    }
}

/// Reads a JSON-lines journal.
///
/// Blank lines and lines starting with `#` are skipped. Each item carries its
/// 1-based line number.
pub struct JournalReader<R: BufRead> {
    source: R,
}

impl<R: BufRead> JournalReader<R> {
    pub fn new(source: R) -> Self {
        Self { source }
    }

    pub fn records(self) -> impl Iterator<Item = (usize, Result<JournalRecord>)> {
        self.source
            .lines()
            .enumerate()
            .filter_map(|(index, line)| {
                let line_no = index + 1;
                let parsed = match line {
                    Ok(line) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() || trimmed.starts_with('#') {
                            return None;
                        }
                        serde_json::from_str(trimmed).map_err(|e| {
                            ReconcileError::ValidationError(format!("line {line_no}: {e}"))
                        })
                    }
                    Err(e) => Err(ReconcileError::from(e)),
                };
                Some((line_no, parsed))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_reads_each_record_kind() {
        let data = r#"
{"kind": "customer", "id": "alice"}
{"kind": "customer", "id": "bob", "referred_by": "alice"}
# opened from the bot
{"kind": "purchase", "customer": "bob", "amount": "100.00", "currency": "RUB", "provider": "fiat", "months": 1, "external_id": "pay-1"}
{"kind": "notification", "provider": "fiat", "body": {"event": "payment.succeeded"}}
{"kind": "deactivate", "id": "alice"}
"#;
        let records: Vec<_> = JournalReader::new(data.as_bytes()).records().collect();
        assert_eq!(records.len(), 5);

        assert_eq!(
            records[1].1.as_ref().unwrap(),
            &JournalRecord::Customer {
                id: CustomerId::new("bob"),
                referred_by: Some(CustomerId::new("alice")),
            }
        );
        let (line, purchase) = &records[2];
        assert_eq!(*line, 5);
        match purchase.as_ref().unwrap() {
            JournalRecord::Purchase(p) => {
                assert_eq!(p.amount.value(), dec!(100));
                assert_eq!(p.provider, Provider::Fiat);
                assert_eq!(p.months, 1);
            }
            other => panic!("unexpected record {other:?}"),
        }
        assert!(matches!(
            records[4].1.as_ref().unwrap(),
            JournalRecord::Deactivate { .. }
        ));
    }

    #[test]
    fn test_bad_lines_are_reported_with_line_numbers() {
        let data = "{\"kind\": \"customer\", \"id\": \"a\"}\nnot json\n{\"kind\": \"purchase\", \"customer\": \"a\", \"amount\": \"-5\", \"currency\": \"RUB\", \"provider\": \"fiat\", \"months\": 1, \"external_id\": \"x\"}";
        let records: Vec<_> = JournalReader::new(data.as_bytes()).records().collect();

        assert!(records[0].1.is_ok());
        assert_eq!(records[1].0, 2);
        assert!(matches!(records[1].1, Err(ReconcileError::ValidationError(_))));
        assert!(records[2].1.is_err());
    }

    #[test]
    fn test_notification_body_bytes() {
        let verbatim = JournalRecord::Notification {
            provider: Provider::Crypto,
            headers: HashMap::from([("Crypto-Pay-API-Signature".to_string(), "ab".to_string())]),
            body: serde_json::Value::String("{\"a\":1}".into()),
        };
        let raw = verbatim.into_notification().unwrap().unwrap();
        assert_eq!(raw.body, b"{\"a\":1}");
        assert_eq!(raw.header("crypto-pay-api-signature"), Some("ab"));

        let structured = JournalRecord::Notification {
            provider: Provider::Fiat,
            headers: HashMap::new(),
            body: serde_json::json!({"a": 1}),
        };
        let raw = structured.into_notification().unwrap().unwrap();
        assert_eq!(raw.body, b"{\"a\":1}");

        let customer = JournalRecord::Customer {
            id: CustomerId::new("a"),
            referred_by: None,
        };
        assert!(customer.into_notification().is_none());
    }
}
