#![allow(missing_docs)]
// Binary smoke tests: CLI surface and config validation.

use assert_cmd::Command;

#[test]
fn test_help_lists_subcommands() {
    let output = Command::cargo_bin("armitage")
        .expect("binary")
        .arg("--help")
        .output()
        .expect("run");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("start"));
    assert!(stdout.contains("check-config"));
}

#[test]
fn test_check_config_with_overrides() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config_path = dir.path().join("armitage.toml");
    std::fs::write(
        &config_path,
        format!(
            "[runtime]\ndata_dir = \"{}\"\n\n[queue]\nsoft_cap = 123\n",
            dir.path().join("data").display()
        ),
    )
    .expect("write config");

    let output = Command::cargo_bin("armitage")
        .expect("binary")
        .arg("check-config")
        .arg("--config")
        .arg(&config_path)
        .output()
        .expect("run");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("configuration OK"));
    assert!(stdout.contains("123"));
}

#[test]
fn test_check_config_rejects_bad_toml() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config_path = dir.path().join("broken.toml");
    std::fs::write(&config_path, "[queue\nsoft_cap = nope").expect("write config");

    let output = Command::cargo_bin("armitage")
        .expect("binary")
        .arg("check-config")
        .arg("--config")
        .arg(&config_path)
        .output()
        .expect("run");
    assert!(!output.status.success());
}
