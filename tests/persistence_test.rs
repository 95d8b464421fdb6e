#![cfg(feature = "storage-rocksdb")]

use assert_cmd::cargo_bin;
use std::path::Path;
use std::process::Command;
use tempfile::tempdir;

fn run(db_path: &Path, args: &[&str]) -> serde_json::Value {
    let output = Command::new(cargo_bin!("spei-settlement"))
        .arg("--db-path")
        .arg(db_path)
        .args(args)
        .output()
        .expect("Failed to execute command");
    assert!(
        output.status.success(),
        "{}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("stdout is not JSON")
}

#[test]
fn test_rocksdb_persistence_recovery() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("test_db");

    // 1. Issue a reference
    let issued = run(
        &db_path,
        &["generate", "--student", "s-1", "--concept", "tuition", "--amount", "5000.00"],
    );
    let reference = issued["reference"].as_str().unwrap().to_string();

    // 2. A later process settles it
    let settled = run(&db_path, &["reconcile", "--reference", &reference, "--amount", "5000"]);
    assert_eq!(settled["code"], "PAYMENT_PROCESSED");

    // 3. The state and receipt survived both restarts
    let status = run(&db_path, &["status", &reference]);
    assert_eq!(status["status"], "paid");
    assert!(status["receiptUrl"].is_string());

    // 4. A replay is recognised
    let again = run(&db_path, &["reconcile", "--reference", &reference, "--amount", "5000.00"]);
    assert_eq!(again["code"], "ALREADY_PAID");

    // 5. The sequence keeps counting
    let next = run(
        &db_path,
        &["generate", "--student", "s-2", "--concept", "tuition", "--amount", "10"],
    );
    assert_ne!(next["reference"], issued["reference"]);
}
