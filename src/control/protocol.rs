//! Control commands and framed responses
//!
//! Every response is zero or more body lines followed by a terminator line
//! holding a single `.`. Body lines starting with `.` get one extra `.`
//! prepended on the wire.

use std::fmt;
use std::str::FromStr;

use crate::error::FrameError;

/// Line that ends every response
pub const TERMINATOR: &str = ".";

/// Longest accepted command line, in bytes
pub const MAX_COMMAND_LENGTH: usize = 4096;

/// A parsed control command. Keywords are case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    List,
    Status(String),
    Start(String),
    Stop(String),
    Restart(String),
    Subscribe { tool: String, event_type: String },
    Unsubscribe { tool: String, event_type: String },
    Shutdown,
    Help,
    Quit,
    Uptime,
    Version,
}

impl ControlCommand {
    pub fn keyword(&self) -> &'static str {
        match self {
            Self::List => "list",
            Self::Status(_) => "status",
            Self::Start(_) => "start",
            Self::Stop(_) => "stop",
            Self::Restart(_) => "restart",
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
            Self::Shutdown => "shutdown",
            Self::Help => "help",
            Self::Quit => "quit",
            Self::Uptime => "uptime",
            Self::Version => "version",
        }
    }
}

fn usage(text: &str) -> FrameError {
    FrameError::Protocol(format!("Usage: {}", text))
}

fn one_arg(args: &[&str], text: &str) -> Result<String, FrameError> {
    match args {
        [name] => Ok((*name).to_string()),
        _ => Err(usage(text)),
    }
}

fn two_args(args: &[&str], text: &str) -> Result<(String, String), FrameError> {
    match args {
        [tool, event_type] => Ok(((*tool).to_string(), (*event_type).to_string())),
        _ => Err(usage(text)),
    }
}

fn no_args(args: &[&str], text: &str) -> Result<(), FrameError> {
    if args.is_empty() { Ok(()) } else { Err(usage(text)) }
}

impl FromStr for ControlCommand {
    type Err = FrameError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let Some(keyword) = words.next() else {
            return Err(FrameError::Protocol("Empty command".to_string()));
        };
        let args: Vec<&str> = words.collect();

        let command = match keyword.to_ascii_lowercase().as_str() {
            "list" => no_args(&args, "list").map(|_| Self::List)?,
            "status" => Self::Status(one_arg(&args, "status <tool>")?),
            "start" => Self::Start(one_arg(&args, "start <tool>")?),
            "stop" => Self::Stop(one_arg(&args, "stop <tool>")?),
            "restart" => Self::Restart(one_arg(&args, "restart <tool>")?),
            "subscribe" => {
                let (tool, event_type) = two_args(&args, "subscribe <tool> <event_type>")?;
                Self::Subscribe { tool, event_type }
            }
            "unsubscribe" => {
                let (tool, event_type) = two_args(&args, "unsubscribe <tool> <event_type>")?;
                Self::Unsubscribe { tool, event_type }
            }
            "shutdown" => no_args(&args, "shutdown").map(|_| Self::Shutdown)?,
            "help" => Self::Help,
            "quit" | "exit" => Self::Quit,
            "uptime" => no_args(&args, "uptime").map(|_| Self::Uptime)?,
            "version" => no_args(&args, "version").map(|_| Self::Version)?,
            _ => {
                return Err(FrameError::Protocol(format!(
                    "Unknown command '{}'\nType 'help' for available commands",
                    keyword
                )));
            }
        };
        Ok(command)
    }
}

/// Body of one control response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    lines: Vec<String>,
}

impl Response {
    /// Response whose body is `text`, one line per `\n`
    pub fn new(text: impl AsRef<str>) -> Self {
        Self {
            lines: text.as_ref().lines().map(str::to_string).collect(),
        }
    }

    pub fn from_lines(lines: Vec<String>) -> Self {
        Self { lines }
    }

    pub fn error(message: impl fmt::Display) -> Self {
        Self::new(format!("Error: {}", message))
    }

    /// Error response for a failed operation, worded for the console
    pub fn from_error(err: &FrameError) -> Self {
        match err {
            FrameError::Protocol(message) => Self::error(message),
            FrameError::ToolNotFound(name) => Self::error(format!("Tool '{}' not found in configuration", name)),
            FrameError::InvalidState(message) => Self::error(message),
            other => Self::error(other),
        }
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn push(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }

    pub fn is_error(&self) -> bool {
        self.lines.first().is_some_and(|l| l.starts_with("Error:"))
    }

    /// Body joined with newlines
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.text())
    }
}
