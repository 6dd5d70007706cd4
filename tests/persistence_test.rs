#![cfg(feature = "storage-rocksdb")]

use assert_cmd::cargo_bin;
use std::io::Write;
use std::process::Command;
use tempfile::tempdir;

const CONFIRMED: &str = r#"{"kind": "notification", "provider": "fiat", "body": {"event": "payment.succeeded", "object": {"id": "pay-1", "status": "succeeded", "amount": {"value": "100.00", "currency": "RUB"}}}}"#;

#[test]
fn test_rocksdb_persistence_recovery() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("test_db");

    // 1. First run: register, open and confirm a purchase
    let mut journal1 = tempfile::NamedTempFile::new().unwrap();
    writeln!(journal1, r#"{{"kind": "customer", "id": "1"}}"#).unwrap();
    writeln!(
        journal1,
        r#"{{"kind": "purchase", "customer": "1", "amount": "100.00", "currency": "RUB", "provider": "fiat", "months": 1, "external_id": "pay-1"}}"#
    )
    .unwrap();
    writeln!(journal1, "{CONFIRMED}").unwrap();

    let mut cmd1 = Command::new(cargo_bin!("subsettle"));
    cmd1.arg(journal1.path()).arg("--db-path").arg(&db_path);

    let output1 = cmd1.output().expect("Failed to execute command");
    assert!(output1.status.success());
    let stdout1 = String::from_utf8_lossy(&output1.stdout);
    assert!(stdout1.contains("1,100,1,,true"));

    // 2. Second run: the provider redelivers the confirmation
    let mut journal2 = tempfile::NamedTempFile::new().unwrap();
    writeln!(journal2, "{CONFIRMED}").unwrap();

    let mut cmd2 = Command::new(cargo_bin!("subsettle"));
    cmd2.arg(journal2.path()).arg("--db-path").arg(&db_path);

    let output2 = cmd2.output().expect("Failed to execute command");
    assert!(output2.status.success());
    let stdout2 = String::from_utf8_lossy(&output2.stdout);

    // Recovered, and not credited a second time
    assert!(stdout2.contains("1,100,1,,true"));
}

#[test]
fn test_unmatched_payment_survives_restart() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("test_db");

    // 1. First run: a confirmation for a payment nobody opened
    let mut journal1 = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        journal1,
        r#"{{"kind": "notification", "provider": "fiat", "body": {{"event": "payment.succeeded", "object": {{"id": "pay-404", "status": "succeeded", "amount": {{"value": "1.00", "currency": "RUB"}}}}}}}}"#
    )
    .unwrap();

    let output1 = Command::new(cargo_bin!("subsettle"))
        .arg(journal1.path())
        .arg("--db-path")
        .arg(&db_path)
        .output()
        .expect("Failed to execute command");
    assert!(output1.status.success());
    assert!(String::from_utf8_lossy(&output1.stderr).contains("Unmatched fiat payment pay-404"));

    // 2. Second run with nothing new to replay
    let mut journal2 = tempfile::NamedTempFile::new().unwrap();
    writeln!(journal2, "# nothing new").unwrap();

    let output2 = Command::new(cargo_bin!("subsettle"))
        .arg(journal2.path())
        .arg("--db-path")
        .arg(&db_path)
        .output()
        .expect("Failed to execute command");
    assert!(output2.status.success());
    let stderr2 = String::from_utf8_lossy(&output2.stderr);
    assert!(stderr2.contains("Unmatched fiat payment pay-404 (confirmed, 1.00 RUB)"));
}
