use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn kbm_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_kbm"))
}

fn setup_test_env(url: &str) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let config_content = format!(
        r#"[index]
url = "{}"
name = "qa"
timeout_secs = 2

[snapshot]
dir = "{}/backups"
"#,
        url,
        root.display()
    );

    let config_path = config_dir.join("kbm.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_kbm(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = kbm_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .arg("--progress")
        .arg("off")
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run kbm binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

// Nothing listens on port 1, so every connection is refused.
const DEAD_URL: &str = "http://127.0.0.1:1";

#[test]
fn test_help_lists_commands() {
    let output = Command::new(kbm_binary()).arg("--help").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for cmd in ["ping", "search", "purge", "backup", "review", "apply"] {
        assert!(stdout.contains(cmd), "help is missing {}", cmd);
    }
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_kbm(&tmp.path().join("absent.toml"), &["ping"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"), "stderr: {}", stderr);
}

#[test]
fn test_invalid_config_fails() {
    let (tmp, config_path) = setup_test_env(DEAD_URL);
    fs::write(
        &config_path,
        "[index]\nurl = \"localhost:9200\"\nname = \"qa\"\n",
    )
    .unwrap();
    let (_, stderr, success) = run_kbm(&config_path, &["ping"]);
    assert!(!success);
    assert!(stderr.contains("index.url must start with"), "stderr: {}", stderr);
    drop(tmp);
}

#[test]
fn test_ping_unreachable_index() {
    let (_tmp, config_path) = setup_test_env(DEAD_URL);
    let (_, stderr, success) = run_kbm(&config_path, &["ping"]);
    assert!(!success);
    assert!(stderr.contains("not modified"), "stderr: {}", stderr);
}

#[test]
fn test_backup_unreachable_writes_nothing() {
    let (tmp, config_path) = setup_test_env(DEAD_URL);
    let (_, stderr, success) = run_kbm(&config_path, &["backup"]);
    assert!(!success);
    assert!(stderr.contains("the index was not modified"), "stderr: {}", stderr);
    assert!(!tmp.path().join("backups").exists());
}

#[test]
fn test_review_unreachable_aborts() {
    let (_tmp, config_path) = setup_test_env(DEAD_URL);
    let (_, stderr, success) = run_kbm(&config_path, &["review", "--value", "TODO"]);
    assert!(!success);
    assert!(stderr.contains("not modified"), "stderr: {}", stderr);
}

#[test]
fn test_review_without_sentinel_fails() {
    let (_tmp, config_path) = setup_test_env(DEAD_URL);
    let (_, stderr, success) = run_kbm(&config_path, &["review"]);
    assert!(!success);
    assert!(stderr.contains("no sentinel value"), "stderr: {}", stderr);
}

#[test]
fn test_apply_missing_session_fails() {
    let (tmp, config_path) = setup_test_env(DEAD_URL);
    let session = tmp.path().join("missing.session.json");
    let (_, _, success) = run_kbm(&config_path, &["apply", session.to_str().unwrap()]);
    assert!(!success);
}
