use assert_cmd::Command;
use predicates::str::{contains, starts_with};
use std::path::Path;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const MANIFEST: &str = r#"
id = "org.example.files"
executable = "/nonexistent/files-helper"
idle_timeout_secs = 30

[[actions]]
name = "org.example.read"
policy = "yes"

[[actions]]
name = "org.example.write"
message = "Writing system files requires authentication"

[[actions]]
name = "org.example.erase"
"#;

const POLICY: &str = r#"
[defaults]
"org.example.*" = "auth_admin_keep"
"org.example.read" = "yes"
"org.example.erase" = "no"
"#;

fn elevate_dir() -> TempDir {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join("helpers")).unwrap();
    std::fs::write(dir.path().join("helpers").join("org.example.files.toml"), MANIFEST).unwrap();
    std::fs::write(dir.path().join("policy.toml"), POLICY).unwrap();
    std::fs::write(dir.path().join("broker.toml"), "watch_policy = false\n").unwrap();
    dir
}

fn elevate(dir: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("elevate"));
    cmd.env("ELEVATE_DIR", dir)
        .env("NO_COLOR", "1")
        .env_remove("ELEVATE_SOCKET")
        .env_remove("ELEVATE_CONFIG")
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_cli_help() {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("elevate"));
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(contains("privileged actions"));
}

#[test]
fn test_cli_version() {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("elevate"));
    cmd.arg("--version").assert().success();
}

#[test]
fn test_cli_completions() {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("elevate"));
    cmd.args(["completions", "bash"])
        .assert()
        .success()
        .stdout(starts_with("_elevate"));
}

#[test]
fn test_policy_check_reports_decision() {
    let dir = elevate_dir();

    elevate(dir.path())
        .args(["policy", "check", "org.example.read"])
        .assert()
        .success()
        .stdout(contains("authorized"))
        .stdout(contains("policy entry 'org.example.read'"));

    elevate(dir.path())
        .args(["policy", "check", "org.example.write", "--uid", "1000"])
        .assert()
        .success()
        .stdout(contains("auth_required"))
        .stdout(contains("remembered"));

    elevate(dir.path())
        .args(["policy", "check", "org.example.missing"])
        .assert()
        .success()
        .stdout(contains("invalid"));
}

#[test]
fn test_policy_check_json() {
    let dir = elevate_dir();

    elevate(dir.path())
        .args(["--format", "json", "policy", "check", "org.example.erase"])
        .assert()
        .success()
        .stdout(contains("\"status\": \"denied\""));
}

#[test]
fn test_policy_list_shows_entries_and_defaults() {
    let dir = elevate_dir();

    elevate(dir.path())
        .args(["policy", "list"])
        .assert()
        .success()
        .stdout(contains("org.example.*"))
        .stdout(contains("auth_admin_keep"))
        .stdout(contains("Helper defaults"));
}

#[test]
fn test_policy_list_fails_on_broken_store() {
    let dir = elevate_dir();
    std::fs::write(dir.path().join("policy.toml"), "[defaults\n").unwrap();

    elevate(dir.path())
        .args(["policy", "list"])
        .assert()
        .failure()
        .stderr(contains("unreadable"));
}

#[test]
fn test_helpers_list() {
    let dir = elevate_dir();

    elevate(dir.path())
        .args(["helpers", "list"])
        .assert()
        .success()
        .stdout(contains("org.example.files"))
        .stdout(contains("org.example.write"))
        .stdout(contains("30s"));

    elevate(dir.path())
        .args(["--format", "json", "helpers", "list"])
        .assert()
        .success()
        .stdout(contains("\"id\": \"org.example.files\""));
}

#[test]
fn test_exec_without_broker_suggests_starting_it() {
    let dir = elevate_dir();

    elevate(dir.path())
        .args(["exec", "org.example.read"])
        .assert()
        .failure()
        .stderr(contains("failed to connect to broker"))
        .stderr(contains("elevate broker start"));
}

#[test]
fn test_exec_rejects_malformed_argument() {
    let dir = elevate_dir();

    elevate(dir.path())
        .args(["exec", "org.example.read", "--arg", "novalue"])
        .assert()
        .failure()
        .stderr(contains("expected KEY=VALUE"));
}

#[test]
fn test_broker_status_when_stopped() {
    let dir = elevate_dir();

    elevate(dir.path())
        .args(["broker", "status"])
        .assert()
        .success()
        .stdout(contains("not running"))
        .stdout(contains("unreachable"));

    elevate(dir.path())
        .args(["broker", "stop"])
        .assert()
        .success()
        .stdout(contains("Broker not running"));
}

fn wait_for(path: &Path) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !path.exists() {
        assert!(Instant::now() < deadline, "{} never appeared", path.display());
        std::thread::sleep(Duration::from_millis(50));
    }
}

#[test]
fn test_foreground_broker_serves_exec() {
    let dir = elevate_dir();
    let mut broker = std::process::Command::new(assert_cmd::cargo::cargo_bin!("elevate"))
        .args(["broker", "start", "--foreground"])
        .env("ELEVATE_DIR", dir.path())
        .env("NO_COLOR", "1")
        .env_remove("ELEVATE_SOCKET")
        .env_remove("ELEVATE_CONFIG")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .unwrap();
    wait_for(&dir.path().join("broker.sock"));
    wait_for(&dir.path().join("broker.pid"));

    elevate(dir.path())
        .args(["broker", "status"])
        .assert()
        .success()
        .stdout(contains("running (PID"))
        .stdout(contains("(reachable)"));

    elevate(dir.path())
        .args(["exec", "org.example.read", "--authorize-only"])
        .assert()
        .success()
        .stdout(contains("Action completed"));

    elevate(dir.path())
        .args(["exec", "org.example.erase"])
        .assert()
        .failure()
        .stderr(contains("was not authorized"));

    // No prompt agent is configured, so authentication cannot succeed.
    elevate(dir.path())
        .args(["--format", "json", "exec", "org.example.write", "--authorize-only"])
        .assert()
        .failure()
        .stdout(contains("\"status\": \"authorization_denied\""));

    elevate(dir.path())
        .args(["exec", "org.example.unknown"])
        .assert()
        .failure()
        .stderr(contains("elevate helpers list"));

    elevate(dir.path())
        .args(["broker", "reload"])
        .assert()
        .success()
        .stdout(contains("Sent reload signal"));

    // Reap the broker as soon as it exits so stop sees it gone.
    let waiter = std::thread::spawn(move || broker.wait());
    elevate(dir.path())
        .args(["broker", "stop"])
        .assert()
        .success()
        .stdout(contains("Broker stopped"));

    let status = waiter.join().unwrap().unwrap();
    assert!(status.success(), "broker exited with {status}");
    assert!(!dir.path().join("broker.sock").exists());
    assert!(!dir.path().join("broker.pid").exists());
}
