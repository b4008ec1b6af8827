use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;
use std::time::Duration;

fn cargo_bin() -> Command {
    let mut cmd = Command::cargo_bin("bfm").unwrap();
    cmd.timeout(Duration::from_secs(5))
        .env("BFM_CONFIG", "/nonexistent/bfm.toml")
        .env_remove("BFM_MAX_STEPS")
        .env_remove("BFM_TIMEOUT_MS");
    cmd
}

fn program_file(content: &str) -> tempfile::NamedTempFile {
    let mut tf = tempfile::NamedTempFile::new().expect("tempfile");
    write!(tf, "{}", content).unwrap();
    tf
}

fn infinite_bf() -> &'static str {
    "+[]" // increments to 1, then [] spins forever
}

#[test]
fn max_steps_flag_aborts_runaway_program() {
    let tf = program_file(infinite_bf());
    cargo_bin()
        .args(["--max-steps", "1000"])
        .arg(tf.path())
        .assert()
        .code(1)
        .stderr(predicate::str::contains("step limit exceeded (1000)").and(predicate::str::contains("after 1000 cycles")))
        .stdout(predicate::str::contains("Result").not());
}

#[test]
fn max_steps_env_is_a_fallback() {
    let tf = program_file(infinite_bf());
    cargo_bin()
        .env("BFM_MAX_STEPS", "50")
        .arg(tf.path())
        .assert()
        .code(1)
        .stderr(predicate::str::contains("step limit exceeded (50)"));
}

#[test]
fn flag_beats_env() {
    let tf = program_file("+++");
    cargo_bin()
        .env("BFM_MAX_STEPS", "1")
        .args(["--max-steps", "10"])
        .arg(tf.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("Finished in 3 cycles."));
}

#[test]
fn timeout_aborts_runaway_program() {
    let tf = program_file(infinite_bf());
    cargo_bin()
        .env("BFM_TIMEOUT_MS", "100")
        .arg(tf.path())
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Execution aborted").and(predicate::str::contains("timeout")))
        .stdout(predicate::str::contains("Execution aborted").not());
}

#[test]
fn program_within_limits_is_unaffected() {
    let tf = program_file("++[-].");
    cargo_bin()
        .args(["--max-steps", "100", "--timeout", "2000", "--no-stream"])
        .arg(tf.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("Result: [0]").and(predicate::str::contains("Finished in 8 cycles.")));
}
