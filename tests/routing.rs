//! End-to-end routing tests with real child processes
//!
//! Tools are small `sh` scripts; receivers append their stdin to a file so the
//! test can observe exactly what was delivered.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;
use yuki_frame::Framework;
use yuki_frame::config::Config;
use yuki_frame::supervisor::ToolState;

fn framework_section() -> &'static str {
    "[framework]\ncontrol_host = 127.0.0.1\ncontrol_port = 0\nstop_timeout_ms = 500\n\n"
}

/// Command that copies its stdin to `path`
fn sink(path: &Path) -> String {
    format!("sh -c \"exec cat > '{}'\"", path.display())
}

/// Command that emits `lines` and then copies its stdin to `path`
fn emitter(lines: &[&str], path: &Path) -> String {
    let echoes: Vec<String> = lines.iter().map(|l| format!("echo '{}'", l)).collect();
    format!("sh -c \"{}; exec cat > '{}'\"", echoes.join("; "), path.display())
}

async fn wait_for_contents(path: &PathBuf, expected: &str) -> String {
    let mut last = String::new();
    for _ in 0..300 {
        last = fs::read_to_string(path).unwrap_or_default();
        if last == expected {
            return last;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    last
}

async fn start(ini: &str) -> Framework {
    let config = Config::from_ini(ini).unwrap();
    config.validate().unwrap();
    let mut framework = Framework::new(config);
    framework.start().await.unwrap();
    framework
}

#[tokio::test]
async fn test_message_reaches_subscriber_only() {
    let dir = TempDir::new().unwrap();
    let a_out = dir.path().join("a.out");
    let b_out = dir.path().join("b.out");

    let ini = format!(
        "{}[tool.A]\ncommand = {}\nautostart = true\n\n[tool.B]\ncommand = {}\nautostart = true\nsubscriptions = MESSAGE\n",
        framework_section(),
        emitter(&["MESSAGE|A|hello"], &a_out),
        sink(&b_out),
    );
    let mut framework = start(&ini).await;

    let delivered = wait_for_contents(&b_out, "MESSAGE|A|hello\n").await;
    assert_eq!(delivered, "MESSAGE|A|hello\n");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fs::read_to_string(&a_out).unwrap_or_default(), "");

    let a = framework.supervisor().status("A").await.unwrap();
    let b = framework.supervisor().status("B").await.unwrap();
    assert_eq!(a.events_sent, 1);
    assert_eq!(b.events_received, 1);

    framework.shutdown().await;
}

#[tokio::test]
async fn test_per_source_order_and_payload_delimiters() {
    let dir = TempDir::new().unwrap();
    let a_out = dir.path().join("a.out");
    let b_out = dir.path().join("b.out");

    let lines = ["STATUS|A|1", "STATUS|A|cpu=3|mem=40", "STATUS|A|3"];
    let ini = format!(
        "{}[tool.A]\ncommand = {}\nautostart = true\n\n[tool.B]\ncommand = {}\nautostart = true\nsubscriptions = STATUS\n",
        framework_section(),
        emitter(&lines, &a_out),
        sink(&b_out),
    );
    let mut framework = start(&ini).await;

    let expected = "STATUS|A|1\nSTATUS|A|cpu=3|mem=40\nSTATUS|A|3\n";
    assert_eq!(wait_for_contents(&b_out, expected).await, expected);

    framework.shutdown().await;
}

#[tokio::test]
async fn test_malformed_lines_never_delivered() {
    let dir = TempDir::new().unwrap();
    let a_out = dir.path().join("a.out");
    let monitor_out = dir.path().join("monitor.out");

    let ini = format!(
        "{}[tool.A]\ncommand = {}\nautostart = true\n\n[tool.monitor]\ncommand = {}\nautostart = true\nsubscriptions = *\n",
        framework_section(),
        emitter(&["just some text", "", "ALERT|A|disk full"], &a_out),
        sink(&monitor_out),
    );
    let mut framework = start(&ini).await;

    let expected = "ALERT|A|disk full\n";
    assert_eq!(wait_for_contents(&monitor_out, expected).await, expected);
    assert!(framework.supervisor().status("A").await.unwrap().state.is_live());

    framework.shutdown().await;
}

#[tokio::test]
async fn test_wildcard_does_not_loop_back() {
    let dir = TempDir::new().unwrap();
    let monitor_out = dir.path().join("monitor.out");
    let b_out = dir.path().join("b.out");

    let ini = format!(
        "{}[tool.monitor]\ncommand = {}\nautostart = true\nsubscriptions = *\n\n[tool.B]\ncommand = {}\nautostart = true\nsubscriptions = STATUS\n",
        framework_section(),
        emitter(&["STATUS|monitor|ok"], &monitor_out),
        sink(&b_out),
    );
    let mut framework = start(&ini).await;

    assert_eq!(wait_for_contents(&b_out, "STATUS|monitor|ok\n").await, "STATUS|monitor|ok\n");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fs::read_to_string(&monitor_out).unwrap_or_default(), "");

    framework.shutdown().await;
}

#[tokio::test]
async fn test_echo_chain() {
    let dir = TempDir::new().unwrap();
    let sender_out = dir.path().join("sender.out");
    let collector_out = dir.path().join("collector.out");

    let echo = "sh -c 'while read line; do echo \"ECHO|echo|$line\"; done'";
    let ini = format!(
        "{}[tool.sender]\ncommand = {}\nautostart = true\n\n[tool.echo]\ncommand = {}\nautostart = true\nsubscriptions = MESSAGE\n\n[tool.collector]\ncommand = {}\nautostart = true\nsubscriptions = ECHO\n",
        framework_section(),
        emitter(&["MESSAGE|sender|ping"], &sender_out),
        echo,
        sink(&collector_out),
    );
    let mut framework = start(&ini).await;

    let expected = "ECHO|echo|MESSAGE|sender|ping\n";
    assert_eq!(wait_for_contents(&collector_out, expected).await, expected);

    framework.shutdown().await;
}

#[tokio::test]
async fn test_autostart_and_manual_tools() {
    let ini = format!(
        "{}[tool.one]\ncommand = cat\nautostart = true\n\n[tool.two]\ncommand = cat\nautostart = true\n\n[tool.three]\ncommand = cat\nautostart = false\n",
        framework_section(),
    );
    let mut framework = start(&ini).await;
    let sup = framework.supervisor();

    assert_eq!(sup.status("one").await.unwrap().state, ToolState::Running);
    assert_eq!(sup.status("two").await.unwrap().state, ToolState::Running);
    assert_eq!(sup.status("three").await.unwrap().state, ToolState::Stopped);

    let three = sup.start("three").await.unwrap();
    assert_eq!(three.state, ToolState::Running);

    framework.shutdown().await;
}

#[tokio::test]
async fn test_crashed_tool_receives_nothing() {
    let dir = TempDir::new().unwrap();
    let a_out = dir.path().join("a.out");

    let ini = format!(
        "{}[tool.A]\ncommand = {}\nautostart = true\n\n[tool.dies]\ncommand = sh -c 'exit 2'\nautostart = true\nsubscriptions = MESSAGE\n",
        framework_section(),
        sink(&a_out),
    );
    let mut framework = start(&ini).await;
    let sup = framework.supervisor();

    let mut state = ToolState::Running;
    for _ in 0..200 {
        state = sup.status("dies").await.unwrap().state;
        if state == ToolState::Crashed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(state, ToolState::Crashed);
    assert!(!framework.router().is_attached("dies"));

    let origin_stats = yuki_frame::supervisor::ToolStats::new();
    let delivered = framework.router().route("A", "MESSAGE|A|late", &origin_stats);
    assert!(delivered.is_empty());

    framework.shutdown().await;
}

#[tokio::test]
async fn test_restart_after_crash_resumes_delivery() {
    let dir = TempDir::new().unwrap();
    let out = dir.path().join("flaky.out");

    let flaky = format!(
        "sh -c 'while read -r line; do if [ \"$line\" = \"MESSAGE|A|die\" ]; then exit 3; fi; echo \"$line\" >> \"{}\"; done'",
        out.display()
    );
    let ini = format!(
        "{}[tool.flaky]\ncommand = {}\nautostart = true\nsubscriptions = MESSAGE\n",
        framework_section(),
        flaky,
    );
    let mut framework = start(&ini).await;
    let sup = framework.supervisor();
    let router = framework.router();
    let stats = yuki_frame::supervisor::ToolStats::new();

    assert_eq!(router.route("A", "MESSAGE|A|one", &stats), vec!["flaky"]);
    assert_eq!(wait_for_contents(&out, "MESSAGE|A|one\n").await, "MESSAGE|A|one\n");

    router.route("A", "MESSAGE|A|die", &stats);
    let mut state = ToolState::Running;
    for _ in 0..200 {
        state = sup.status("flaky").await.unwrap().state;
        if state == ToolState::Crashed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(state, ToolState::Crashed);
    assert!(router.route("A", "MESSAGE|A|lost", &stats).is_empty());

    let restarted = sup.restart("flaky").await.unwrap();
    assert_eq!(restarted.state, ToolState::Running);
    assert!(router.is_attached("flaky"));

    assert_eq!(router.route("A", "MESSAGE|A|two", &stats), vec!["flaky"]);
    assert_eq!(router.route("A", "MESSAGE|A|three", &stats), vec!["flaky"]);
    let expected = "MESSAGE|A|one\nMESSAGE|A|two\nMESSAGE|A|three\n";
    assert_eq!(wait_for_contents(&out, expected).await, expected);

    framework.shutdown().await;
}
