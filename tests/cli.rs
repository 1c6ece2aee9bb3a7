use std::fs;
use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn coinfer(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("coinfer").expect("coinfer binary");
    cmd.current_dir(dir)
        .env("XDG_CONFIG_HOME", dir.join("config"))
        .env("TMPDIR", dir.join("tmp-home"))
        .env_remove("COINFER_AUTH_TOKEN")
        .env_remove("COINFER_SERVER_ENDPOINT")
        .env_remove("COINFER_ENV_FILE")
        .env_remove("COINFER_LOG_LEVEL")
        .env_remove("RUST_LOG")
        .env("NO_COLOR", "1");
    cmd
}

fn workflow(settings: &str) -> TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::write(dir.path().join("workflow.yaml"), settings).expect("write workflow.yaml");
    dir
}

#[test]
fn help_lists_commands() {
    let dir = tempfile::tempdir().expect("tempdir");
    coinfer(dir.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("sample"))
        .stdout(predicate::str::contains("login"))
        .stdout(predicate::str::contains("clean"));
}

#[test]
fn version_is_reported() {
    let dir = tempfile::tempdir().expect("tempdir");
    coinfer(dir.path())
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::starts_with("coinfer "));
}

#[cfg(unix)]
#[test]
fn offline_sample_runs_command_with_run_environment() {
    let dir = workflow(
        r#"
sampling:
  sync: "off"
  command:
    - sh
    - -c
    - echo sync=$COINFER_SYNC; echo data=$COINFER_MCMC_DATA_PATH; mkdir -p "$COINFER_MCMC_DATA_PATH"
"#,
    );
    let data_dir = dir.path().join("mcmcdata");

    coinfer(dir.path())
        .arg("sample")
        .assert()
        .success()
        .stderr(predicate::str::contains("-->sync=FALSE"))
        .stderr(predicate::str::is_match("-->data=/.*mcmcdata").expect("regex"));
    assert!(data_dir.is_dir());
}

#[cfg(unix)]
#[test]
fn offline_sample_reports_json_summary() {
    let dir = workflow("sampling:\n  sync: false\n  command: [\"true\"]\n");

    coinfer(dir.path())
        .args(["sample", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""status":"SAMPLE_FIN""#));
}

#[cfg(unix)]
#[test]
fn failing_sampler_exits_non_zero() {
    let dir = workflow("sampling:\n  sync: \"off\"\n  command: [sh, -c, exit 4]\n");

    coinfer(dir.path())
        .arg("sample")
        .assert()
        .failure()
        .stderr(predicate::str::contains("ERR"));
}

#[test]
fn syncing_sample_without_token_prints_login_prompt() {
    let dir = workflow(
        r#"
sampling:
  sync: coinfer
coinfer:
  endpoint: http://127.0.0.1:9
  workflow_id: wf
"#,
    );

    coinfer(dir.path())
        .arg("sample")
        .assert()
        .success()
        .stdout(predicate::str::contains("coinfer login --token"));
}

#[test]
fn clean_removes_generated_directories() {
    let dir = workflow(
        r#"
sampling:
  mcmc_data:
    directory: draws
analysis:
  output_dir: report
"#,
    );
    for sub in ["draws/exp1", "report", "tmp", "model"] {
        fs::create_dir_all(dir.path().join(sub)).expect("create dir");
    }

    coinfer(dir.path())
        .arg("clean")
        .assert()
        .success()
        .stderr(predicate::str::contains("Removed 3 directories"));

    assert!(!dir.path().join("draws").exists());
    assert!(!dir.path().join("report").exists());
    assert!(!dir.path().join("tmp").exists());
    assert!(dir.path().join("model").is_dir());
}

#[test]
fn explicit_env_file_must_exist() {
    let dir = tempfile::tempdir().expect("tempdir");
    coinfer(dir.path())
        .args(["clean", "--env-file", "missing.env"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("missing.env"));
}
