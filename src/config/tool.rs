//! Tool definitions as loaded from configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::{FrameError, Result};

/// Wildcard subscription matching every event type.
pub const WILDCARD: &str = "*";

/// What to do when a destination queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuePolicy {
    /// Reject the incoming event, keep what is queued
    #[default]
    DropNewest,
    /// Evict the oldest queued event to make room
    DropOldest,
}

impl FromStr for QueuePolicy {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drop_newest" | "newest" => Ok(Self::DropNewest),
            "drop_oldest" | "oldest" => Ok(Self::DropOldest),
            other => Err(FrameError::Config(format!("Unknown queue policy: {}", other))),
        }
    }
}

impl fmt::Display for QueuePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DropNewest => write!(f, "drop_newest"),
            Self::DropOldest => write!(f, "drop_oldest"),
        }
    }
}

/// A configured tool. Replaced only by a configuration reload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Unique name, the stable identity of the tool across restarts
    #[serde(default)]
    pub name: String,
    /// Command line, split shell-style into program and arguments
    pub command: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub autostart: bool,
    /// Event types this tool receives; `*` means all
    #[serde(default)]
    pub subscriptions: BTreeSet<String>,
    #[serde(default)]
    pub restart_on_crash: bool,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    /// Per-destination queue capacity; falls back to the framework default
    #[serde(default)]
    pub max_queue_size: Option<usize>,
    #[serde(default)]
    pub queue_policy: QueuePolicy,
}

fn default_max_restarts() -> u32 {
    3
}

impl ToolDefinition {
    /// Create a definition with defaults for everything but name and command
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            description: String::new(),
            autostart: false,
            subscriptions: BTreeSet::new(),
            restart_on_crash: false,
            max_restarts: default_max_restarts(),
            max_queue_size: None,
            queue_policy: QueuePolicy::default(),
        }
    }

    pub fn with_autostart(mut self, autostart: bool) -> Self {
        self.autostart = autostart;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Add a subscription
    pub fn subscribe(mut self, event_type: impl Into<String>) -> Self {
        self.subscriptions.insert(event_type.into());
        self
    }

    pub fn with_restart_on_crash(mut self, max_restarts: u32) -> Self {
        self.restart_on_crash = true;
        self.max_restarts = max_restarts;
        self
    }

    pub fn with_queue(mut self, size: usize, policy: QueuePolicy) -> Self {
        self.max_queue_size = Some(size);
        self.queue_policy = policy;
        self
    }

    /// Queue capacity, falling back to the framework default
    pub fn queue_size(&self, default: usize) -> usize {
        self.max_queue_size.unwrap_or(default)
    }

    /// Split `command` into program and arguments
    pub fn argv(&self) -> Result<Vec<String>> {
        let argv = shell_words::split(&self.command).map_err(|e| FrameError::Spawn {
            tool: self.name.clone(),
            reason: format!("Cannot parse command '{}': {}", self.command, e),
        })?;
        if argv.is_empty() {
            return Err(FrameError::Spawn {
                tool: self.name.clone(),
                reason: "Empty command".to_string(),
            });
        }
        Ok(argv)
    }

    /// Check the definition is usable
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(FrameError::Config("Tool name must not be empty".to_string()));
        }
        if self.name.contains(|c: char| c.is_whitespace() || c == '|') {
            return Err(FrameError::Config(format!(
                "Tool name '{}' must not contain whitespace or '|'",
                self.name
            )));
        }
        if self.command.trim().is_empty() {
            return Err(FrameError::Config(format!("Tool '{}' has no command", self.name)));
        }
        if self.max_queue_size == Some(0) {
            return Err(FrameError::Config(format!(
                "Tool '{}' max_queue_size must be at least 1",
                self.name
            )));
        }
        Ok(())
    }
}

/// Parse a comma-separated subscription list, ignoring blanks
pub fn parse_subscriptions(value: &str) -> BTreeSet<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
