//! Binary surface: version, help and config failures

use std::io::Write;
use std::process::Command;

fn yuki_frame() -> Command {
    Command::new(env!("CARGO_BIN_EXE_yuki-frame"))
}

#[test]
fn test_version() {
    let output = yuki_frame().arg("--version").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Yuki-Frame"));
}

#[test]
fn test_help() {
    let output = yuki_frame().arg("--help").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Usage:"));
    assert!(stdout.contains("--config"));
}

#[test]
fn test_missing_config_fails() {
    let output = yuki_frame()
        .args(["--config", "/nonexistent/yuki-frame.conf"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Failed"));
}

#[test]
fn test_invalid_config_fails() {
    let mut file = tempfile::Builder::new().suffix(".conf").tempfile().unwrap();
    writeln!(file, "[tool.broken]\nautostart = maybe").unwrap();

    let output = yuki_frame()
        .args(["--config", file.path().to_str().unwrap()])
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Failed to load configuration"));
}

#[test]
fn test_invalid_default_config_fails() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("yuki-frame.conf"), "[tool.a]\ncommand = cat\nautostart = maybe\n").unwrap();

    let output = yuki_frame().current_dir(dir.path()).output().unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Failed to load configuration"));
}

#[test]
fn test_unknown_key_warning_reaches_stderr() {
    let dir = tempfile::tempdir().unwrap();
    let conf = dir.path().join("bad.conf");
    std::fs::write(&conf, "[framework]\nmax_tools = 0\ncolour = blue\n[tool.a]\ncommand = cat\n").unwrap();

    let output = yuki_frame()
        .env_remove("RUST_LOG")
        .args(["--config", conf.to_str().unwrap()])
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("ignoring unknown framework key 'colour'"));
}

#[cfg(unix)]
#[test]
fn test_sighup_reloads_then_sigterm_stops() {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;
    use std::process::Stdio;
    use std::thread::sleep;
    use std::time::Duration;

    let dir = tempfile::tempdir().unwrap();
    let conf = dir.path().join("yuki-frame.conf");
    let base = "[framework]\ncontrol_host = 127.0.0.1\ncontrol_port = 0\nstop_timeout_ms = 500\n\n";
    std::fs::write(&conf, format!("{}[tool.a]\ncommand = cat\nautostart = true\n", base)).unwrap();

    let child = yuki_frame()
        .env_remove("RUST_LOG")
        .args(["--config", conf.to_str().unwrap()])
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    let pid = Pid::from_raw(child.id() as i32);
    sleep(Duration::from_millis(500));

    std::fs::write(&conf, format!("{}[tool.b]\ncommand = cat\nautostart = true\n", base)).unwrap();
    kill(pid, Signal::SIGHUP).unwrap();
    sleep(Duration::from_millis(1000));
    kill(pid, Signal::SIGTERM).unwrap();

    let output = child.wait_with_output().unwrap();
    assert!(output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Configuration reloaded: 1 added, 0 updated, 1 removed"));
}
