use assert_cmd::cargo_bin;
use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::io::Write;
use std::process::Command;

#[test]
fn test_cli_end_to_end() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::new(cargo_bin!());
    cmd.arg("tests/fixtures/journal.jsonl");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains(
            "customer,balance,entitled_months,referred_by,active",
        ))
        // Own crypto purchase plus 5% of bob's payment
        .stdout(predicate::str::contains("alice,22.5,12,,true"))
        // Credited once despite the redelivered confirmation
        .stdout(predicate::str::contains("bob,200,1,alice,true"))
        // The notification for an unknown payment
        .stderr(predicate::str::contains("Notification rejected"))
        .stderr(predicate::str::contains("Unmatched fiat payment pay-404"));

    Ok(())
}

#[test]
fn test_cli_reports_bad_lines_and_keeps_going() {
    let mut journal = tempfile::NamedTempFile::new().unwrap();
    writeln!(journal, r#"{{"kind": "customer", "id": "carol"}}"#).unwrap();
    writeln!(journal, "this is not json").unwrap();
    writeln!(
        journal,
        r#"{{"kind": "purchase", "customer": "nobody", "amount": "1", "currency": "RUB", "provider": "fiat", "months": 1, "external_id": "x"}}"#
    )
    .unwrap();
    writeln!(journal, r#"{{"kind": "deactivate", "id": "carol"}}"#).unwrap();

    let mut cmd = Command::new(cargo_bin!("subsettle"));
    cmd.arg(journal.path());

    cmd.assert()
        .success()
        .stderr(predicate::str::contains("Error at line 2"))
        .stderr(predicate::str::contains("unknown customer nobody"))
        .stdout(predicate::str::contains("carol,0,0,,false"));
}

#[test]
fn test_cli_signed_crypto_webhook() {
    let body = r#"{"update_type":"invoice_paid","payload":{"invoice_id":9,"status":"paid","amount":"3","asset":"TON"}}"#;
    let signature = subsettle::interfaces::providers::CryptoPayAdapter::sign("1234:AAA", body.as_bytes()).unwrap();

    let mut config = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(config, "[providers]\ncrypto_pay_token = \"1234:AAA\"").unwrap();

    let mut journal = tempfile::NamedTempFile::new().unwrap();
    writeln!(journal, r#"{{"kind": "customer", "id": "dave"}}"#).unwrap();
    writeln!(
        journal,
        r#"{{"kind": "purchase", "customer": "dave", "amount": "3", "currency": "TON", "provider": "crypto", "months": 1, "external_id": "9"}}"#
    )
    .unwrap();
    // Forged first, then the genuine delivery.
    let record = |sig: &str| {
        serde_json::json!({
            "kind": "notification",
            "provider": "crypto",
            "headers": {"crypto-pay-api-signature": sig},
            "body": body,
        })
    };
    writeln!(journal, "{}", record("00ff")).unwrap();
    writeln!(journal, "{}", record(&signature)).unwrap();

    let mut cmd = Command::new(cargo_bin!("subsettle"));
    cmd.arg(journal.path()).arg("--config").arg(config.path());

    cmd.assert()
        .success()
        .stderr(predicate::str::contains("signature"))
        .stdout(predicate::str::contains("dave,3,1,,true"));
}
