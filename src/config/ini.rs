//! Reader for the INI dialect used by `yuki-frame.conf`.
//!
//! ```text
//! [framework]
//! log_level = INFO
//!
//! [tool.receiver]
//! command = python3 tools/receiver.py
//! autostart = true
//! subscriptions = MESSAGE
//! ```

use std::collections::HashSet;
use std::str::FromStr;

use log::warn;

use super::framework::FrameworkConfig;
use super::tool::{ToolDefinition, parse_subscriptions};
use super::Config;
use crate::error::{FrameError, Result};

enum Section {
    None,
    Framework,
    Tool(usize),
    Ignored,
}

/// Parse INI text into a `Config`. Tool order follows the file.
pub fn parse(content: &str) -> Result<Config> {
    let mut framework = FrameworkConfig::default();
    let mut tools: Vec<ToolDefinition> = Vec::new();
    let mut seen = HashSet::new();
    let mut section = Section::None;

    for (idx, raw) in content.lines().enumerate() {
        let lineno = idx + 1;
        let line = raw.trim();

        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if let Some(rest) = line.strip_prefix('[') {
            let name = rest
                .strip_suffix(']')
                .ok_or_else(|| err(lineno, "unterminated section header"))?
                .trim();
            section = match name {
                "framework" | "core" => Section::Framework,
                _ => match name.strip_prefix("tool.").or_else(|| name.strip_prefix("tool:")) {
                    Some(tool_name) => {
                        let tool_name = tool_name.trim();
                        if !seen.insert(tool_name.to_string()) {
                            return Err(err(lineno, &format!("duplicate tool '{}'", tool_name)));
                        }
                        // Command is filled in by the `command` key
                        tools.push(ToolDefinition::new(tool_name, ""));
                        Section::Tool(tools.len() - 1)
                    }
                    None => {
                        warn!("config line {}: ignoring unknown section [{}]", lineno, name);
                        Section::Ignored
                    }
                },
            };
            continue;
        }

        let (key, value) = line
            .split_once('=')
            .map(|(k, v)| (k.trim(), v.trim()))
            .ok_or_else(|| err(lineno, "expected 'key = value'"))?;

        match section {
            Section::None => return Err(err(lineno, "key outside of any section")),
            Section::Ignored => {}
            Section::Framework => apply_framework_key(&mut framework, key, value, lineno)?,
            Section::Tool(i) => apply_tool_key(&mut tools[i], key, value, lineno)?,
        }
    }

    Ok(Config { framework, tools })
}

fn apply_framework_key(fw: &mut FrameworkConfig, key: &str, value: &str, lineno: usize) -> Result<()> {
    match key {
        "log_file" => fw.log_file = non_empty(value).map(Into::into),
        "log_level" => fw.log_level = value.parse().map_err(|e: FrameError| err(lineno, &e.to_string()))?,
        "max_tools" => fw.max_tools = number(value, lineno)?,
        "control_host" => fw.control_host = value.to_string(),
        "control_port" => fw.control_port = number(value, lineno)?,
        "max_clients" => fw.max_clients = number(value, lineno)?,
        "session_idle_timeout_secs" => fw.session_idle_timeout_secs = number(value, lineno)?,
        "stop_timeout_ms" => fw.stop_timeout_ms = number(value, lineno)?,
        "restart_delay_ms" => fw.restart_delay_ms = number(value, lineno)?,
        "default_queue_size" | "message_queue_size" => fw.default_queue_size = number(value, lineno)?,
        "pid_file" => fw.pid_file = non_empty(value).map(Into::into),
        _ => warn!("config line {}: ignoring unknown framework key '{}'", lineno, key),
    }
    Ok(())
}

fn apply_tool_key(tool: &mut ToolDefinition, key: &str, value: &str, lineno: usize) -> Result<()> {
    match key {
        "command" => tool.command = value.to_string(),
        "description" => tool.description = value.to_string(),
        "autostart" => tool.autostart = boolean(value, lineno)?,
        "subscriptions" | "subscribe" => tool.subscriptions = parse_subscriptions(value),
        "restart_on_crash" => tool.restart_on_crash = boolean(value, lineno)?,
        "max_restarts" => tool.max_restarts = number(value, lineno)?,
        "max_queue_size" => tool.max_queue_size = Some(number(value, lineno)?),
        "queue_policy" => tool.queue_policy = value.parse().map_err(|e: FrameError| err(lineno, &e.to_string()))?,
        _ => warn!(
            "config line {}: ignoring unknown key '{}' for tool '{}'",
            lineno, key, tool.name
        ),
    }
    Ok(())
}

fn non_empty(value: &str) -> Option<&str> {
    if value.is_empty() { None } else { Some(value) }
}

fn number<T: FromStr>(value: &str, lineno: usize) -> Result<T> {
    value
        .parse()
        .map_err(|_| err(lineno, &format!("invalid number '{}'", value)))
}

fn boolean(value: &str, lineno: usize) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(err(lineno, &format!("invalid boolean '{}'", value))),
    }
}

fn err(lineno: usize, msg: &str) -> FrameError {
    FrameError::Config(format!("line {}: {}", lineno, msg))
}
