use predicates::prelude::PredicateBooleanExt;
use predicates::str::contains;

fn write_config(tmp: &std::path::Path, source: &std::path::Path) -> std::path::PathBuf {
    let config_path = tmp.join("rgeorepd.toml");
    std::fs::write(
        &config_path,
        format!(
            r#"
source_directory = {source:?}
exec = "true"
flags = ""
metadata_directory = {meta:?}
status_file = {status:?}
diagnostic_log_directory = {diag:?}
propagation_delay_ms = 0
sync_period_s = 1
"#,
            source = source,
            meta = tmp.join("meta"),
            status = tmp.join("run").join("status"),
            diag = tmp.join("log"),
        ),
    )
    .unwrap();
    config_path
}

fn setup() -> (tempfile::TempDir, std::path::PathBuf) {
    let tmp = tempfile::tempdir().unwrap();
    let source = tmp.path().join("tree");
    std::fs::create_dir(&source).unwrap();
    std::fs::write(source.join("a.txt"), "0123456789").unwrap();
    let config_path = write_config(tmp.path(), &source);
    (tmp, config_path)
}

#[test]
fn check_help() {
    let mut cmd = assert_cmd::Command::cargo_bin("rgeorepd").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(contains("--seed").and(contains("--dry-run")));
}

#[test]
fn check_version() {
    let mut cmd = assert_cmd::Command::cargo_bin("rgeorepd").unwrap();
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(contains("rgeorepd"));
}

#[test]
fn missing_source_directory_fails() {
    let tmp = tempfile::tempdir().unwrap();
    let config_path = write_config(tmp.path(), &tmp.path().join("nonexistent"));
    let mut cmd = assert_cmd::Command::cargo_bin("rgeorepd").unwrap();
    cmd.args(["--config", config_path.to_str().unwrap(), "--oneshot"])
        .assert()
        .failure()
        .stdout(contains("does not exist"));
}

#[test]
fn oneshot_advances_and_persists_the_clock() {
    let (tmp, config_path) = setup();
    let mut cmd = assert_cmd::Command::cargo_bin("rgeorepd").unwrap();
    cmd.args(["--config", config_path.to_str().unwrap(), "--oneshot"])
        .assert()
        .success();
    let persisted =
        std::fs::read_to_string(tmp.path().join("meta").join("last_rctime.dat")).unwrap();
    assert_ne!(persisted, "0.0\n");
    // snapshot removed, not-running published
    let snap_dir = tmp.path().join("tree").join(".snap");
    assert_eq!(std::fs::read_dir(&snap_dir).unwrap().count(), 0);
    assert_eq!(
        std::fs::read_to_string(tmp.path().join("run").join("status")).unwrap(),
        "1\n"
    );
}

#[test]
fn corrupt_clock_file_recovers_with_a_warning() {
    let (tmp, config_path) = setup();
    let clock_path = tmp.path().join("meta").join("last_rctime.dat");
    std::fs::create_dir_all(clock_path.parent().unwrap()).unwrap();
    std::fs::write(&clock_path, "certainly not a timestamp\n").unwrap();
    let mut cmd = assert_cmd::Command::cargo_bin("rgeorepd").unwrap();
    cmd.args(["--config", config_path.to_str().unwrap(), "--oneshot"])
        .assert()
        .success()
        .stdout(contains("corrupt"));
    // the clock came back as a valid timestamp
    let persisted = std::fs::read_to_string(&clock_path).unwrap();
    persisted
        .trim()
        .parse::<f64>()
        .expect("clock file must hold a numeric timestamp again");
}

#[test]
fn dry_run_leaves_the_clock_alone() {
    let (tmp, config_path) = setup();
    let mut cmd = assert_cmd::Command::cargo_bin("rgeorepd").unwrap();
    cmd.args(["--config", config_path.to_str().unwrap(), "--dry-run"])
        .assert()
        .success();
    assert_eq!(
        std::fs::read_to_string(tmp.path().join("meta").join("last_rctime.dat")).unwrap(),
        "0.0\n"
    );
}

#[test]
fn set_last_change_time_primes_without_snapshotting() {
    let (tmp, config_path) = setup();
    let mut cmd = assert_cmd::Command::cargo_bin("rgeorepd").unwrap();
    cmd.args([
        "--config",
        config_path.to_str().unwrap(),
        "--set-last-change-time",
    ])
    .assert()
    .success();
    let persisted =
        std::fs::read_to_string(tmp.path().join("meta").join("last_rctime.dat")).unwrap();
    assert_ne!(persisted, "0.0\n");
    assert!(!tmp.path().join("tree").join(".snap").exists());
}

#[test]
fn sigterm_shuts_down_cleanly() {
    let (tmp, config_path) = setup();
    // prime the clock so the loop has nothing to do but sleep
    let mut cmd = assert_cmd::Command::cargo_bin("rgeorepd").unwrap();
    cmd.args([
        "--config",
        config_path.to_str().unwrap(),
        "--set-last-change-time",
    ])
    .assert()
    .success();

    let mut child = std::process::Command::new(assert_cmd::cargo::cargo_bin("rgeorepd"))
        .args(["--config", config_path.to_str().unwrap()])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .unwrap();
    std::thread::sleep(std::time::Duration::from_millis(500));
    assert_cmd::Command::new("kill")
        .args(["-TERM", &child.id().to_string()])
        .assert()
        .success();

    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    let status = loop {
        if let Some(status) = child.try_wait().unwrap() {
            break status;
        }
        if std::time::Instant::now() > deadline {
            child.kill().unwrap();
            panic!("daemon did not exit after SIGTERM");
        }
        std::thread::sleep(std::time::Duration::from_millis(100));
    };
    assert!(status.success());
    // cleanup published not-running
    assert_eq!(
        std::fs::read_to_string(tmp.path().join("run").join("status")).unwrap(),
        "1\n"
    );
}
