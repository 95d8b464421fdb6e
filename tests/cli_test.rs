use assert_cmd::cargo_bin;
use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::io::Write;
use std::process::Command;

#[test]
fn test_cli_generate() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::new(cargo_bin!());
    cmd.args(["generate", "--student", "student-1", "--concept", "tuition", "--amount", "5000.00"]);

    let output = cmd.output()?;
    assert!(output.status.success());
    let response: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    let reference = response["reference"].as_str().unwrap();
    assert!(reference.starts_with("SPEI"));
    assert_eq!(reference.len(), 16);
    assert_eq!(response["amount"], "5000.00");
    assert!(response["pendingPaymentId"].is_string());
    assert!(response["expirationTimestamp"].is_string());

    Ok(())
}

#[test]
fn test_cli_generate_rejects_zero_amount() {
    let mut cmd = Command::new(cargo_bin!());
    cmd.args(["generate", "--student", "s", "--concept", "c", "--amount", "0"]);

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Validation error"));
}

#[test]
fn test_cli_statement_with_unknown_references() {
    let mut cmd = Command::new(cargo_bin!());
    cmd.arg("reconcile-statement").arg("tests/fixtures/statement.csv");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains(
            "reference,code,payment_id,requires_manual_review",
        ))
        .stdout(predicate::str::contains(
            "SPEI000000000197,REFERENCE_NOT_FOUND,,false",
        ))
        .stdout(predicate::str::contains(
            "SPEI000000000393,REFERENCE_NOT_FOUND,,false",
        ));
}

#[test]
fn test_cli_statement_reports_refused_rows() {
    let mut cmd = Command::new(cargo_bin!());
    cmd.args([
        "reconcile-statement",
        "tests/fixtures/statement.csv",
        "--actor",
        "clerk-1",
        "--role",
        "staff",
    ]);

    cmd.assert()
        .failure()
        .stdout(predicate::str::contains(
            "SPEI000000000197,UNAUTHORIZED,,false",
        ))
        .stdout(predicate::str::contains(
            "SPEI000000000393,UNAUTHORIZED,,false",
        ))
        .stderr(predicate::str::contains("3 statement row(s) were not reconciled"));
}

#[test]
fn test_cli_reconcile_requires_privileged_actor() {
    let mut cmd = Command::new(cargo_bin!());
    cmd.args([
        "reconcile",
        "--reference",
        "SPEI000000000197",
        "--amount",
        "10",
        "--actor",
        "clerk-1",
        "--role",
        "staff",
    ]);

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Unauthorized"));

    let mut cmd = Command::new(cargo_bin!());
    cmd.args([
        "reconcile",
        "--reference",
        "SPEI000000000197",
        "--amount",
        "10",
        "--actor",
        "finance-1",
        "--role",
        "finance",
    ]);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("REFERENCE_NOT_FOUND"));
}

#[test]
fn test_cli_webhook_credentials() {
    let mut unsigned = Command::new(cargo_bin!());
    unsigned.arg("webhook").arg("tests/fixtures/webhook.json");
    unsigned
        .assert()
        .success()
        .stdout(predicate::str::contains("UNAUTHORIZED"));

    let mut config = tempfile::NamedTempFile::new().unwrap();
    writeln!(config, "webhook_api_keys = [\"bank-key-1\"]").unwrap();

    let mut keyed = Command::new(cargo_bin!());
    keyed
        .arg("--config")
        .arg(config.path())
        .arg("webhook")
        .arg("tests/fixtures/webhook.json")
        .arg("--api-key")
        .arg("bank-key-1");
    keyed
        .assert()
        .success()
        .stdout(predicate::str::contains("REFERENCE_NOT_FOUND"));
}

#[test]
fn test_cli_rejects_unknown_settings() {
    let mut config = tempfile::NamedTempFile::new().unwrap();
    writeln!(config, "reference_validity = 3").unwrap();

    let mut cmd = Command::new(cargo_bin!());
    cmd.arg("--config").arg(config.path()).arg("sweep");
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Configuration error"));
}

#[test]
fn test_cli_sweep_and_status() {
    let mut sweep = Command::new(cargo_bin!());
    sweep.arg("sweep");
    sweep
        .assert()
        .success()
        .stdout(predicate::str::contains("\"scanned\": 0"));

    let mut status = Command::new(cargo_bin!());
    status.args(["status", "SPEI000000000197"]);
    status
        .assert()
        .failure()
        .stderr(predicate::str::contains("Not found"));
}

#[test]
fn test_cli_webhook_secret_flag() {
    let body = std::fs::read("tests/fixtures/webhook.json").unwrap();
    let signature = spei_settlement::application::webhook::sign("cli-secret", &body).unwrap();

    let mut cmd = Command::new(cargo_bin!());
    cmd.args(["--webhook-secret", "cli-secret", "webhook", "tests/fixtures/webhook.json"])
        .arg("--signature")
        .arg(&signature);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("REFERENCE_NOT_FOUND"));
}
