#![cfg(feature = "cli")]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

fn unique_temp_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "brickcomm-cli-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
    dir
}

fn brickcomm(config: Option<&Path>, args: &[&str]) -> Output {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_brickcomm"));
    cmd.arg("--log-level").arg("error").arg("--format").arg("json");
    cmd.env_remove("BRICKCOMM_CONFIG");
    if let Some(config) = config {
        cmd.arg("--config").arg(config);
    }
    cmd.args(args).output().expect("brickcomm should run")
}

/// Engine config pointing the settings file into `dir`.
fn config_with_settings(dir: &Path) -> PathBuf {
    let config = dir.join("engine.json");
    let settings = dir.join("settings.json");
    let body = serde_json::json!({ "settings_path": settings });
    std::fs::write(&config, body.to_string()).expect("config should be writable");
    config
}

#[test]
fn unknown_device_name_is_usage_error() {
    let output = brickcomm(None, &["echo", "nobody", "hi"]);
    assert_eq!(output.status.code(), Some(64));
    assert!(String::from_utf8_lossy(&output.stderr).contains("unknown device"));
}

#[test]
fn out_of_range_address_fails() {
    let output = brickcomm(None, &["echo", "00:00:00:00:00:99", "hi"]);
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn pairing_without_pin_fails() {
    let output = brickcomm(None, &["echo", "00:11:22:33:44:55", "hi"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("rejected"));
}

#[test]
fn bad_timeout_is_usage_error() {
    let output = brickcomm(None, &["echo", "rover", "hi", "--timeout", "0s"]);
    assert_eq!(output.status.code(), Some(64));
}

#[test]
fn pin_set_needs_settings_path() {
    let output = brickcomm(None, &["pin", "--set", "4321"]);
    assert_eq!(output.status.code(), Some(64));
}

#[test]
fn pin_set_persists() {
    let dir = unique_temp_dir("pin");
    let config = config_with_settings(&dir);

    let output = brickcomm(Some(&config), &["pin", "--set", "4321"]);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let output = brickcomm(Some(&config), &["pin"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let pin: serde_json::Value = serde_json::from_str(stdout.trim()).expect("pin should emit json");
    assert_eq!(pin["pin"], "4321");

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn oversized_pin_is_usage_error() {
    let dir = unique_temp_dir("long-pin");
    let config = config_with_settings(&dir);

    let output = brickcomm(Some(&config), &["pin", "--set", "12345678901234567"]);
    assert_eq!(output.status.code(), Some(64));
    assert!(!dir.join("settings.json").exists());

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn malformed_config_is_invalid_data() {
    let dir = unique_temp_dir("bad-config");
    let config = dir.join("engine.json");
    std::fs::write(&config, "{ not json").expect("config should be writable");

    let output = brickcomm(Some(&config), &["info"]);
    assert_eq!(output.status.code(), Some(60));

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn missing_config_fails() {
    let dir = unique_temp_dir("no-config");
    let output = brickcomm(Some(&dir.join("absent.json")), &["info"]);
    assert_eq!(output.status.code(), Some(1));
    let _ = std::fs::remove_dir_all(&dir);
}
