use assert_cmd::Command;
use predicates::prelude::*;
use std::path::PathBuf;

fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

/// `printloop` with logs and config kept out of the real home directory.
fn printloop() -> Command {
    let home = std::env::temp_dir().join("printloop-cli-tests");
    std::fs::create_dir_all(&home).unwrap();
    let mut cmd = Command::cargo_bin("printloop").unwrap();
    cmd.env("HOME", &home)
        .env_remove("PRINTLOOP_CONNECT")
        .env_remove("RUST_LOG")
        .args(["--config", "/nonexistent/printloop.json"]);
    cmd
}

#[test]
fn test_help_exits_zero() {
    printloop()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("printloop"));
}

#[test]
fn test_check_prints_expanded_calls() {
    let assert = printloop()
        .args(["check", fixture_path("square.lp").to_str().unwrap()])
        .assert()
        .success();

    let stdout = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    assert!(stdout.contains("lp.start(200)"));
    assert!(stdout.contains("lp.moveto({x:20,y:20,z:0.2,speed:80})"));
    assert!(stdout.contains("lp.draw().turn(90)"));
    assert!(stdout.contains("lp.retract().up(10)"));
    // Comments are not statements.
    assert!(!stdout.contains("square"));
}

#[test]
fn test_check_reports_parse_errors() {
    printloop()
        .args(["check", fixture_path("broken.lp").to_str().unwrap()])
        .assert()
        .code(2)
        .stdout(predicate::str::contains("lp.up(1)"))
        .stderr(predicate::str::contains("parse error at line 2"));
}

#[test]
fn test_check_json_output() {
    let assert = printloop()
        .args(["--format", "json", "check", fixture_path("broken.lp").to_str().unwrap()])
        .assert()
        .code(2);

    let stdout = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    let items: Vec<serde_json::Value> = stdout
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(items.len(), 3);
    assert_eq!(items[0]["call"], "lp.moveto({x:20,y:20})");
    assert_eq!(items[1]["line"], 2);
    assert!(items[1]["error"].is_string());
}

#[test]
fn test_dry_run_prints_gcode() {
    printloop()
        .args(["run", fixture_path("square.lp").to_str().unwrap(), "--dry-run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("G28\nG92 E0\nM106 S0\nM104 S200"))
        .stdout(predicate::str::contains("G0 X20 Y20 Z0.2 F4800"))
        .stdout(predicate::str::contains("G1 X40 Y20 Z0.2 E0.6652 F1800"))
        .stdout(predicate::str::contains("G0 X20 Y20 Z10.2 F4800"));
}

#[test]
fn test_run_continues_past_bad_line() {
    printloop()
        .args(["run", fixture_path("broken.lp").to_str().unwrap(), "--dry-run"])
        .assert()
        .code(2)
        .stdout(predicate::str::contains("G0 X20 Y20 Z0 F3000\nG0 X20 Y20 Z1 F3000"));
}

#[test]
fn test_unknown_method_is_a_runtime_error() {
    printloop()
        .args(["run", fixture_path("unknown_method.lp").to_str().unwrap(), "--dry-run"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("has no method `fly`"));
}

#[test]
fn test_run_reads_stdin() {
    printloop()
        .args(["run", "--dry-run"])
        .write_stdin("# upto 5 | gcode \"M105\"\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("G0 X0 Y0 Z5 F3000\nM105"));
}

#[test]
fn test_connection_refused_exits_one() {
    printloop()
        .args(["run", fixture_path("square.lp").to_str().unwrap(), "--connect", "127.0.0.1:1"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Connection error"));
}

#[test]
fn test_nonexistent_script() {
    printloop()
        .args(["check", "/nonexistent/script.lp"])
        .assert()
        .code(4);
}

#[test]
fn test_live_mode_meta_commands() {
    printloop()
        .args(["live", "--dry-run"])
        .write_stdin("# moveto x: 5\n:every bump 1000 # up 1\n:once cue 60000 # up 9\n:tasks\n:stop bump\n:nope\n:quit\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("G0 X5 Y0 Z0 F3000"))
        .stdout(predicate::str::contains("task bump every 1000 ms"))
        .stdout(predicate::str::contains("task cue once in 60000 ms"))
        .stdout(predicate::str::contains("cue once in 60000 ms, fired 0 times"))
        .stdout(predicate::str::contains("task bump stopped"))
        .stderr(predicate::str::contains("unknown command `:nope`"));
}
