//! Binary-level checks: flag parsing and `--print-token`.

use assert_cmd::Command;
use tempfile::TempDir;

use chowkidar_agent::auth::{TokenAuthority, KEY_FILE_NAME};

fn agent(home: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("chowkidar_agent").unwrap();
    cmd.env("HOME", home.path())
        .env_remove("CHOWKIDAR_SECRET_KEY")
        .env("CHOWKIDAR_LOG", "warn");
    cmd
}

#[test]
fn print_token_signs_with_the_given_secret() {
    let home = TempDir::new().unwrap();
    let out = agent(&home)
        .args(["--print-token", "--server-name", "cli-host"])
        .env("CHOWKIDAR_SECRET_KEY", "a-secret-that-is-long-enough-for-hs256")
        .output()
        .unwrap();
    assert!(out.status.success());

    let token = String::from_utf8(out.stdout).unwrap().trim().to_string();
    assert_eq!(token.split('.').count(), 3);

    let auth = TokenAuthority::new(
        "a-secret-that-is-long-enough-for-hs256",
        std::time::Duration::from_secs(3600),
        "cli-host",
    );
    let claims = auth.validate(&token).unwrap();
    assert_eq!(claims.server_name, "cli-host");
    // explicit secret never touches the key file
    assert!(!home.path().join(KEY_FILE_NAME).exists());
}

#[test]
fn print_token_creates_key_file_once() {
    let home = TempDir::new().unwrap();
    let first = agent(&home).arg("--print-token").output().unwrap();
    assert!(first.status.success());

    let key = home.path().join(KEY_FILE_NAME);
    let secret = std::fs::read_to_string(&key).unwrap();
    assert!(secret.starts_with("chowkidar-"));

    let second = agent(&home).arg("--print-token").output().unwrap();
    assert!(second.status.success());
    assert_eq!(std::fs::read_to_string(&key).unwrap(), secret);

    let auth = TokenAuthority::new(
        secret.trim(),
        std::time::Duration::from_secs(60),
        "chowkidar-agent",
    );
    let token = String::from_utf8(second.stdout).unwrap();
    assert!(auth.validate(token.trim()).is_ok());
}

#[test]
fn help_lists_flags() {
    let home = TempDir::new().unwrap();
    let out = agent(&home).arg("--help").output().unwrap();
    assert!(out.status.success());
    let text = String::from_utf8_lossy(&out.stdout);
    for flag in ["--print-token", "--port", "--bind-addr", "--hub-tick-ms"] {
        assert!(text.contains(flag), "missing {flag}");
    }
}

#[test]
fn bad_port_is_rejected() {
    let home = TempDir::new().unwrap();
    agent(&home).args(["--port", "not-a-port"]).assert().failure();
}
