use std::io::Write;

use assert_cmd::Command;
use predicates::prelude::*;

const VALID: &str = r#"
[server]
host = "https://example.testrail.io"
username = "ci@example.com"
api_key = "secret"

[project]
name = "Checkout"
suite_name = "Regression"

[upload]
batch_size = 25
auto_create = "no"
"#;

fn config_file(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

fn railsync() -> Command {
    let mut cmd = Command::cargo_bin("railsync").unwrap();
    cmd.env_remove("RAILSYNC_PASSWORD")
        .env_remove("RAILSYNC_API_KEY")
        .env_remove("RAILSYNC_TOKEN");
    cmd
}

#[test]
fn test_help_lists_subcommands() {
    railsync()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("upload"))
        .stdout(predicate::str::contains("validate"))
        .stdout(predicate::str::contains("init"));
}

#[test]
fn test_validate_prints_settings() {
    let file = config_file(VALID);
    railsync()
        .arg("--config")
        .arg(file.path())
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid!"))
        .stdout(predicate::str::contains("Batch size: 25"))
        .stdout(predicate::str::contains("Auto create: no"));
}

#[test]
fn test_validate_rejects_small_batch() {
    let file = config_file(&VALID.replace("batch_size = 25", "batch_size = 1"));
    railsync()
        .arg("--config")
        .arg(file.path())
        .arg("validate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("batch_size"));
}

#[test]
fn test_validate_requires_credentials() {
    let file = config_file(&VALID.replace("api_key = \"secret\"", ""));
    railsync()
        .arg("--config")
        .arg(file.path())
        .arg("validate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("No credentials configured"));
}

#[test]
fn test_init_writes_config_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("railsync.toml");

    railsync()
        .arg("--config")
        .arg(&path)
        .args(["init", "--project", "Checkout"])
        .assert()
        .success();
    let written = std::fs::read_to_string(&path).unwrap();
    assert!(written.contains("name = \"Checkout\""));

    railsync()
        .arg("--config")
        .arg(&path)
        .arg("init")
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
}

#[test]
fn test_upload_rejects_malformed_input_before_network() {
    let file = config_file(VALID);
    let mut input = tempfile::NamedTempFile::new().unwrap();
    input.write_all(b"{ not json").unwrap();

    railsync()
        .arg("--config")
        .arg(file.path())
        .arg("upload")
        .arg("--input")
        .arg(input.path())
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Failed to parse input model"));
}

#[test]
fn test_upload_rejects_duplicate_sections_as_fatal() {
    let file = config_file(VALID);
    let mut input = tempfile::NamedTempFile::new().unwrap();
    input
        .write_all(br#"{"sections": [{"name": "A"}, {"name": "A"}]}"#)
        .unwrap();

    railsync()
        .arg("--config")
        .arg(file.path())
        .arg("upload")
        .arg("--input")
        .arg(input.path())
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Invalid input model"));
}

#[test]
fn test_upload_rejects_invalid_config_as_fatal() {
    let file = config_file(VALID);
    let mut input = tempfile::NamedTempFile::new().unwrap();
    input.write_all(br#"{"sections": []}"#).unwrap();

    railsync()
        .arg("--config")
        .arg(file.path())
        .arg("upload")
        .arg("--input")
        .arg(input.path())
        .args(["--batch-size", "1"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("batch_size"));
}

#[test]
fn test_upload_missing_config_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let mut input = tempfile::NamedTempFile::new().unwrap();
    input.write_all(br#"{"sections": []}"#).unwrap();

    railsync()
        .arg("--config")
        .arg(dir.path().join("missing.toml"))
        .arg("upload")
        .arg("--input")
        .arg(input.path())
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Failed to load config"));
}
