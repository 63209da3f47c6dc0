use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::Path,
    process::{Command, Output},
    thread,
    time::Duration,
};

fn bus(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_bus"))
        .args(args)
        .output()
        .unwrap()
}

fn path_arg(path: &Path) -> &str {
    path.to_str().unwrap()
}

#[test]
fn create_broadcast_wait_remove() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bus");
    let out = dir.path().join("out");

    assert!(bus(&["create", path_arg(&path)]).status.success());
    assert_eq!(bus(&["create", "-x", path_arg(&path)]).status.code(), Some(1));

    let command = format!("printf '%s' \"$msg\" > '{}'", out.display());
    let mut waiter = Command::new(env!("CARGO_BIN_EXE_bus"))
        .args(["wait", path_arg(&path), &command])
        .spawn()
        .unwrap();

    // broadcasts before the waiter registered reach nobody, so keep sending
    for _ in 0..100 {
        if waiter.try_wait().unwrap().is_some() {
            break;
        }
        assert!(bus(&["broadcast", path_arg(&path), "hello"]).status.success());
        thread::sleep(Duration::from_millis(50));
    }
    assert!(waiter.wait().unwrap().success());
    assert_eq!(fs::read_to_string(&out).unwrap(), "hello");

    assert!(bus(&["remove", path_arg(&path)]).status.success());
    assert!(!path.exists());
}

#[test]
fn generated_path_is_printed() {
    let dir = tempfile::tempdir().unwrap();
    let output = Command::new(env!("CARGO_BIN_EXE_bus"))
        .arg("create")
        .env("XDG_RUNTIME_DIR", dir.path())
        .output()
        .unwrap();
    assert!(output.status.success());

    let printed = String::from_utf8(output.stdout).unwrap();
    let path = Path::new(printed.trim_end());
    assert!(path.starts_with(dir.path().join("bus")));
    assert!(bus(&["remove", path_arg(path)]).status.success());
}

#[test]
fn chmod_changes_file_mode() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bus");
    assert!(bus(&["create", path_arg(&path)]).status.success());

    assert!(bus(&["chmod", "+g", path_arg(&path)]).status.success());
    let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
    assert_eq!(mode, 0o640);

    assert!(bus(&["remove", path_arg(&path)]).status.success());
}

#[test]
fn exit_codes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bus");

    assert_eq!(bus(&["frobnicate"]).status.code(), Some(2));
    assert_eq!(bus(&["chmod", "+q", path_arg(&path)]).status.code(), Some(2));
    assert_eq!(bus(&["chgrp", "a:b", path_arg(&path)]).status.code(), Some(2));
    assert_eq!(bus(&["remove", path_arg(&path)]).status.code(), Some(1));
    assert_eq!(bus(&["broadcast", path_arg(&path), "x"]).status.code(), Some(1));
}

#[test]
fn listen_runs_command_per_broadcast() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bus");
    let out = dir.path().join("out");
    assert!(bus(&["create", path_arg(&path)]).status.success());

    let command = format!("printf '%s\\n' \"$msg\" >> '{}'", out.display());
    let mut listener = Command::new(env!("CARGO_BIN_EXE_bus"))
        .args(["listen", path_arg(&path), &command])
        .spawn()
        .unwrap();

    let received = |out: &Path| fs::read_to_string(out).unwrap_or_default();
    for _ in 0..100 {
        if !received(&out).is_empty() {
            break;
        }
        assert!(bus(&["broadcast", path_arg(&path), "ping"]).status.success());
        thread::sleep(Duration::from_millis(50));
    }
    assert!(received(&out).contains("ping"));

    // the listener is registered now, so every broadcast reaches it
    for message in ["one", "two", "three"] {
        assert!(bus(&["broadcast", path_arg(&path), message]).status.success());
    }

    let mut lines = Vec::new();
    for _ in 0..100 {
        lines = received(&out)
            .lines()
            .filter(|line| *line != "ping")
            .map(str::to_owned)
            .collect();
        if lines.len() == 3 {
            break;
        }
        thread::sleep(Duration::from_millis(20));
    }
    lines.sort();
    assert_eq!(lines, ["one", "three", "two"]);
    assert!(listener.try_wait().unwrap().is_none());

    listener.kill().unwrap();
    listener.wait().unwrap();
    assert!(bus(&["remove", path_arg(&path)]).status.success());
}
