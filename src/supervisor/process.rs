//! Tool process state and per-tool statistics

use std::fmt;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use chrono::{DateTime, TimeZone, Utc};

/// Lifecycle state of a tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
}

impl ToolState {
    /// A live OS process exists (or is being created/torn down)
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
            Self::Crashed => "CRASHED",
        }
    }
}

impl fmt::Display for ToolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Event counters, shared between the supervisor entry and the router tasks.
/// They survive restarts of the tool.
#[derive(Debug, Default)]
pub struct ToolStats {
    events_sent: AtomicU64,
    events_received: AtomicU64,
    events_dropped: AtomicU64,
    malformed_lines: AtomicU64,
    last_activity_ms: AtomicI64,
}

impl ToolStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// The tool emitted a well-formed event
    pub fn record_sent(&self) {
        self.events_sent.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    /// An event was written to the tool's input
    pub fn record_received(&self) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
    }

    /// An event for this tool was dropped by its queue
    pub fn record_dropped(&self) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.malformed_lines.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    /// Mark output activity now
    pub fn touch(&self) {
        self.last_activity_ms.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn events_sent(&self) -> u64 {
        self.events_sent.load(Ordering::Relaxed)
    }

    pub fn events_received(&self) -> u64 {
        self.events_received.load(Ordering::Relaxed)
    }

    pub fn events_dropped(&self) -> u64 {
        self.events_dropped.load(Ordering::Relaxed)
    }

    pub fn malformed_lines(&self) -> u64 {
        self.malformed_lines.load(Ordering::Relaxed)
    }

    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        match self.last_activity_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Utc.timestamp_millis_opt(ms).single(),
        }
    }
}

/// How a tool process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub summary: String,
}

impl From<&ExitStatus> for ExitInfo {
    fn from(status: &ExitStatus) -> Self {
        Self {
            code: status.code(),
            summary: status.to_string(),
        }
    }
}

impl ExitInfo {
    /// Exit status could not be collected
    pub fn unknown(reason: impl Into<String>) -> Self {
        Self {
            code: None,
            summary: reason.into(),
        }
    }
}

/// Point-in-time view of one tool, safe to hand out of the supervisor lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolProcess {
    pub name: String,
    pub command: String,
    pub description: String,
    pub state: ToolState,
    pub pid: Option<u32>,
    pub autostart: bool,
    pub restart_on_crash: bool,
    pub restart_count: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
    pub last_exit: Option<ExitInfo>,
    pub events_sent: u64,
    pub events_received: u64,
    pub events_dropped: u64,
}

/// A state change, published to the lifecycle coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolTransition {
    pub tool: String,
    pub from: ToolState,
    pub to: ToolState,
    pub pid: Option<u32>,
}
