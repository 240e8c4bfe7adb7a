//! Integration tests for the tsmigrate binary: config file, env overrides, CLI flags, precedence,
//! and an end-to-end run.

use std::path::Path;
use std::process::Command;

use tsmigrate::batch::Batch;
use tsmigrate::{BlockWriter, Labels, Sample};

/// Run tsmigrate in a subprocess with the given args and env. Returns (success, stdout, stderr).
fn run_tsmigrate(
    args: &[&str],
    env_extra: &[(&str, &str)],
    cwd: Option<&Path>,
) -> (bool, String, String) {
    let exe = env!("CARGO_BIN_EXE_tsmigrate");
    let mut cmd = Command::new(exe);
    cmd.args(args);
    cmd.env_remove("RUST_LOG");
    for (k, v) in env_extra {
        cmd.env(k, v);
    }
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    let out = cmd.output().expect("run tsmigrate");
    let stdout = String::from_utf8_lossy(&out.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&out.stderr).into_owned();
    (out.status.success(), stdout, stderr)
}

fn validate(args: &[&str], env_extra: &[(&str, &str)]) -> (bool, String, String) {
    let mut all = vec!["--validate-config", "--no-config"];
    all.extend_from_slice(args);
    run_tsmigrate(&all, env_extra, None)
}

#[test]
fn validate_config_prints_defaults() {
    let (ok, stdout, stderr) = validate(&["--snapshot-path", "/snap"], &[]);
    assert!(ok, "stderr: {}", stderr);
    let max_line = format!("max_timestamp={}", i64::MAX);
    for line in [
        "snapshot_path=/snap",
        "label_key=",
        "external_labels={}",
        "min_timestamp=0",
        max_line.as_str(),
        "log_level=debug",
        "output=-",
        "batch_mode=per-chunk",
        "label_collision=append",
    ] {
        assert!(
            stdout.lines().any(|l| l == line),
            "missing {:?} in stdout: {}",
            line,
            stdout
        );
    }
}

#[test]
fn snapshot_path_is_required() {
    let (ok, _stdout, stderr) = validate(&[], &[]);
    assert!(!ok);
    assert!(stderr.contains("snapshot_path is required"), "stderr: {}", stderr);
}

#[test]
fn env_overrides_defaults() {
    let (ok, stdout, stderr) = validate(
        &[],
        &[
            ("PROM_TS_SNAPSHOT_PATH", "/env/snap"),
            ("PROM_TS_LABEL_KEY", "job"),
            ("PROM_TS_MIN_TIMESTAMP", "1000"),
            ("PROM_TS_EXTERNAL_LABELS", r#"{"env":"prod"}"#),
        ],
    );
    assert!(ok, "stderr: {}", stderr);
    assert!(stdout.contains("snapshot_path=/env/snap"), "stdout: {}", stdout);
    assert!(stdout.contains("label_key=job"), "stdout: {}", stdout);
    assert!(stdout.contains("min_timestamp=1000"), "stdout: {}", stdout);
    assert!(
        stdout.contains(r#"external_labels={"env":"prod"}"#),
        "stdout: {}",
        stdout
    );
}

#[test]
fn env_strings_are_not_reinterpreted_as_numbers() {
    let (ok, stdout, stderr) = validate(
        &[],
        &[
            ("PROM_TS_SNAPSHOT_PATH", "007"),
            ("PROM_TS_LABEL_KEY", "true"),
            ("PROM_TS_LABEL_VALUE", "0123"),
            ("PROM_TS_MAX_TIMESTAMP", "-5"),
        ],
    );
    assert!(ok, "stderr: {}", stderr);
    for line in [
        "snapshot_path=007",
        "label_key=true",
        "label_value=0123",
        "max_timestamp=-5",
    ] {
        assert!(stdout.lines().any(|l| l == line), "missing {:?} in stdout: {}", line, stdout);
    }

    let (ok, stdout, stderr) = validate(
        &["--snapshot-path", "/snap"],
        &[("PROM_TS_LABEL_VALUE", "1.10")],
    );
    assert!(ok, "stderr: {}", stderr);
    assert!(stdout.lines().any(|l| l == "label_value=1.10"), "stdout: {}", stdout);
}

#[test]
fn env_timestamp_must_be_an_integer() {
    let (ok, _stdout, stderr) = validate(
        &["--snapshot-path", "/snap"],
        &[("PROM_TS_MIN_TIMESTAMP", "soon")],
    );
    assert!(!ok);
    assert!(stderr.contains("config error"), "stderr: {}", stderr);
}

#[test]
fn log_level_is_case_insensitive_everywhere() {
    let (ok, stdout, stderr) = validate(
        &["--snapshot-path", "/snap"],
        &[("PROM_TS_LOG_LEVEL", "INFO")],
    );
    assert!(ok, "stderr: {}", stderr);
    assert!(stdout.lines().any(|l| l == "log_level=info"), "stdout: {}", stdout);

    let dir = tempfile::tempdir().expect("tempdir");
    let config_path = dir.path().join("levels.toml");
    std::fs::write(&config_path, "snapshot_path = \"/snap\"\nlog_level = \"Warn\"\n")
        .expect("write config");
    let (ok, stdout, stderr) = run_tsmigrate(
        &["--validate-config", "--config", config_path.to_str().unwrap()],
        &[],
        None,
    );
    assert!(ok, "stderr: {}", stderr);
    assert!(stdout.lines().any(|l| l == "log_level=warn"), "stdout: {}", stdout);

    let (ok, stdout, stderr) = validate(&["--snapshot-path", "/snap", "--log-level", "ERROR"], &[]);
    assert!(ok, "stderr: {}", stderr);
    assert!(stdout.lines().any(|l| l == "log_level=error"), "stdout: {}", stdout);
}

#[test]
fn cli_overrides_env() {
    let (ok, stdout, _) = validate(
        &["--snapshot-path", "/cli/snap", "--max-timestamp", "5"],
        &[
            ("PROM_TS_SNAPSHOT_PATH", "/env/snap"),
            ("PROM_TS_MAX_TIMESTAMP", "9"),
        ],
    );
    assert!(ok);
    assert!(stdout.contains("snapshot_path=/cli/snap"), "CLI should win: {}", stdout);
    assert!(stdout.contains("max_timestamp=5"), "CLI should win: {}", stdout);
}

#[test]
fn file_is_overridden_by_env_and_cli() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config_path = dir.path().join("migrate.toml");
    std::fs::write(
        &config_path,
        r#"
snapshot_path = "/file/snap"
label_key = "job"
label_value = "file"
log_level = "warn"
batch_mode = "per-series"
"#,
    )
    .expect("write config");
    let (ok, stdout, stderr) = run_tsmigrate(
        &[
            "--validate-config",
            "--config",
            config_path.to_str().unwrap(),
            "--label-value",
            "cli",
        ],
        &[("PROM_TS_LOG_LEVEL", "info")],
        None,
    );
    assert!(ok, "stderr: {}", stderr);
    assert!(stdout.contains("snapshot_path=/file/snap"), "stdout: {}", stdout);
    assert!(stdout.contains("label_value=cli"), "stdout: {}", stdout);
    assert!(stdout.contains("log_level=info"), "stdout: {}", stdout);
    assert!(stdout.contains("batch_mode=per-series"), "stdout: {}", stdout);
}

#[test]
fn default_config_file_is_picked_up_from_working_directory() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(
        dir.path().join("tsmigrate.toml"),
        "snapshot_path = \"/default/file\"\n",
    )
    .expect("write config");

    let (ok, stdout, _) = run_tsmigrate(&["--validate-config"], &[], Some(dir.path()));
    assert!(ok);
    assert!(stdout.contains("snapshot_path=/default/file"), "stdout: {}", stdout);

    let (ok, _, stderr) = run_tsmigrate(&["--validate-config", "--no-config"], &[], Some(dir.path()));
    assert!(!ok, "--no-config must skip tsmigrate.toml");
    assert!(stderr.contains("snapshot_path is required"), "stderr: {}", stderr);
}

#[test]
fn explicit_config_missing_file_fails() {
    let (ok, _stdout, stderr) = run_tsmigrate(
        &["--validate-config", "--config", "/nonexistent/tsmigrate.toml"],
        &[],
        None,
    );
    assert!(!ok, "missing config file with explicit --config should fail");
    assert!(stderr.contains("config file not found"), "stderr: {}", stderr);
}

#[test]
fn invalid_external_labels_fail() {
    let (ok, _stdout, stderr) = validate(
        &["--snapshot-path", "/snap", "--external-labels", r#"{"env":1}"#],
        &[],
    );
    assert!(!ok);
    assert!(stderr.contains("external labels"), "stderr: {}", stderr);
}

#[test]
fn invalid_batch_mode_in_file_fails() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config_path = dir.path().join("bad.toml");
    std::fs::write(
        &config_path,
        "snapshot_path = \"/snap\"\nbatch_mode = \"per-block\"\n",
    )
    .expect("write config");
    let (ok, _stdout, stderr) = run_tsmigrate(
        &["--validate-config", "--config", config_path.to_str().unwrap()],
        &[],
        None,
    );
    assert!(!ok);
    assert!(
        stderr.contains("unknown variant") || stderr.contains("per-block"),
        "stderr: {}",
        stderr
    );
}

#[test]
fn end_to_end_run_writes_json_lines() {
    let snapshot = tempfile::tempdir().expect("tempdir");
    let mut w = BlockWriter::create(snapshot.path().join("01")).unwrap();
    w.add_series(
        Labels::from_pairs(&[("job", "x")]),
        &[
            vec![Sample::new(100, 1.0), Sample::new(200, f64::NAN)],
            vec![Sample::new(300, 5.0), Sample::new(400, f64::INFINITY)],
        ],
    )
    .unwrap();
    w.add_series(Labels::from_pairs(&[("job", "y")]), &[vec![Sample::new(100, 2.0)]])
        .unwrap();
    w.finish().unwrap();

    let out_dir = tempfile::tempdir().expect("tempdir");
    let output = out_dir.path().join("out.jsonl");
    let (ok, _stdout, stderr) = run_tsmigrate(
        &[
            "--no-config",
            "--snapshot-path",
            snapshot.path().to_str().unwrap(),
            "--label-key",
            "job",
            "--label-value",
            "x",
            "--min-timestamp",
            "100",
            "--max-timestamp",
            "300",
            "--external-labels",
            r#"{"env":"prod"}"#,
            "--output",
            output.to_str().unwrap(),
            "--log-level",
            "info",
        ],
        &[],
        None,
    );
    assert!(ok, "stderr: {}", stderr);
    assert!(stderr.contains("migration finished"), "stderr: {}", stderr);

    let written = std::fs::read_to_string(&output).unwrap();
    let batches: Vec<Batch> = written
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    let labels = Labels::from_pairs(&[("job", "x"), ("env", "prod")]);
    assert_eq!(
        batches,
        vec![
            Batch {
                labels: labels.clone(),
                samples: vec![Sample::new(100, 1.0)],
            },
            Batch {
                labels,
                samples: vec![Sample::new(300, 5.0)],
            },
        ]
    );
}

#[test]
fn fatal_error_exits_non_zero() {
    let (ok, _stdout, stderr) = run_tsmigrate(
        &[
            "--no-config",
            "--snapshot-path",
            "/nonexistent/snapshot",
            "--log-level",
            "error",
        ],
        &[],
        None,
    );
    assert!(!ok);
    assert!(stderr.contains("migration aborted"), "stderr: {}", stderr);
}
