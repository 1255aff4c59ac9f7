//! Run the `imgscript` binary and check its output and exit codes.

use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Output, Stdio};

// ── Helpers ───────────────────────────────────────────────────────────────────

fn binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_imgscript"))
}

fn run(args: &[&str]) -> Output {
    Command::new(binary())
        .args(["--no-user"])
        .args(args)
        .env_remove("IMGSCRIPT_PATH")
        .env_remove("IMGSCRIPT_USER")
        .output()
        .unwrap_or_else(|e| panic!("cannot run {}: {e}", binary().display()))
}

fn stdout(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).into_owned()
}

fn stderr(out: &Output) -> String {
    String::from_utf8_lossy(&out.stderr).into_owned()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[test]
fn script_from_arguments() {
    let out = run(&["(0)", "repeat", "3", "add", "1", "done", "echo", "{0,^}"]);
    assert_eq!(out.status.code(), Some(0));
    assert_eq!(stdout(&out), "3\n");
}

#[test]
fn argument_with_spaces_is_one_item() {
    let out = run(&["echo", "hello world"]);
    assert_eq!(stdout(&out), "hello world\n");
}

#[test]
fn script_from_stdin() {
    let mut child = Command::new(binary())
        .arg("--no-user")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .unwrap();
    child
        .stdin
        .take()
        .unwrap()
        .write_all(b"x=4\necho $x\n")
        .unwrap();
    let out = child.wait_with_output().unwrap();
    assert_eq!(out.status.code(), Some(0));
    assert_eq!(stdout(&out), "4\n");
}

#[test]
fn command_file_is_loaded() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("lib.ims");
    std::fs::write(&file, "#@cli twice : echo twice\ntwice :\n  echo $1 echo $1\n").unwrap();
    let out = run(&["--commands", file.to_str().unwrap(), "twice", "hi"]);
    assert_eq!(out.status.code(), Some(0));
    assert_eq!(stdout(&out), "hi\nhi\n");
}

#[test]
fn uncaught_error_exits_with_one() {
    let out = run(&["echo", "before", "error", "boom"]);
    assert_eq!(out.status.code(), Some(1));
    assert_eq!(stdout(&out), "before\n");
    assert!(stderr(&out).contains("boom"));
}

#[test]
fn quit_exits_cleanly() {
    let out = run(&["echo", "a", "quit", "echo", "b"]);
    assert_eq!(out.status.code(), Some(0));
    assert_eq!(stdout(&out), "a\n");
}

#[test]
fn bad_usage_exits_with_two() {
    let out = run(&["--verbosity"]);
    assert_eq!(out.status.code(), Some(2));
    let out = run(&["--frobnicate"]);
    assert_eq!(out.status.code(), Some(2));
}

#[test]
fn missing_command_file_is_an_error() {
    let out = run(&["--commands", "/nonexistent/lib.ims", "echo", "x"]);
    assert_eq!(out.status.code(), Some(1));
}
