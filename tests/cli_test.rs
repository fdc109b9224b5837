use assert_cmd::cargo_bin;
use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::process::Command;
use tempfile::tempdir;

mod common;

const HEADER: &[&str] = &["op", "at", "id", "customer", "plan", "amount", "currency", "method", "flag"];

#[test]
fn test_cli_end_to_end() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let input = dir.path().join("commands.csv");
    common::write_commands(
        &input,
        HEADER,
        &[
            &["plans", "2024-04-01T00:00:00Z"],
            &["process_payment", "", "", "cus_1", "", "125.50", "USD", "card"],
            &["subscribe", "", "", "cus_1", "plan_premium"],
            &["refund", "", "pmt_missing"],
            &["bill", "2024-05-01T00:00:00Z"],
        ],
    )?;

    let mut cmd = Command::new(cargo_bin!("paylifecycle"));
    cmd.arg(&input);

    cmd.assert()
        .success()
        .stdout(predicate::str::contains(r#""line":1,"op":"plans","ok":true"#))
        .stdout(predicate::str::contains(r#""status":"succeeded""#))
        .stdout(predicate::str::contains(r#""plan_id":"plan_premium""#))
        .stdout(predicate::str::contains(r#""code":"paylifecycle::not_found""#))
        .stdout(predicate::str::contains(r#""line":5,"op":"bill","ok":true"#))
        .stderr(predicate::str::contains("Error processing command on line 4"));

    Ok(())
}

#[test]
fn test_cli_skips_unreadable_rows() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let input = dir.path().join("commands.csv");
    common::write_commands(
        &input,
        HEADER,
        &[
            &["teleport", "", "", "cus_1"],
            &["plans", "2024-04-01T00:00:00Z"],
        ],
    )?;

    let mut cmd = Command::new(cargo_bin!("paylifecycle"));
    cmd.arg(&input);

    cmd.assert()
        .success()
        .stdout(predicate::str::contains(r#""line":2,"op":"plans","ok":true"#))
        .stdout(predicate::str::contains(r#""line":1"#).not())
        .stderr(predicate::str::contains("Error reading command on line 1"));

    Ok(())
}

#[test]
fn test_cli_missing_input_fails() {
    let mut cmd = Command::new(cargo_bin!("paylifecycle"));
    cmd.arg("does/not/exist.csv");
    cmd.assert().failure();
}
