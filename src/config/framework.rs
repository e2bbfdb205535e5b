//! Framework-wide settings (the `[framework]` section).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{FrameError, Result};

/// Log verbosity as written in the configuration file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    /// Map onto the `log` crate's filter
    pub fn to_filter(self) -> log::LevelFilter {
        match self {
            Self::Trace => log::LevelFilter::Trace,
            Self::Debug => log::LevelFilter::Debug,
            Self::Info => log::LevelFilter::Info,
            Self::Warn => log::LevelFilter::Warn,
            Self::Error | Self::Fatal => log::LevelFilter::Error,
        }
    }
}

impl FromStr for LogLevel {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "TRACE" => Ok(Self::Trace),
            "DEBUG" => Ok(Self::Debug),
            "INFO" => Ok(Self::Info),
            "WARN" | "WARNING" => Ok(Self::Warn),
            "ERROR" => Ok(Self::Error),
            "FATAL" => Ok(Self::Fatal),
            other => Err(FrameError::Config(format!("Unknown log level: {}", other))),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Trace => "TRACE",
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
            Self::Fatal => "FATAL",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameworkConfig {
    /// Log destination; stderr when unset
    pub log_file: Option<PathBuf>,
    pub log_level: LogLevel,
    pub max_tools: usize,
    pub control_host: String,
    pub control_port: u16,
    pub max_clients: usize,
    /// Idle control sessions are closed after this many seconds (0 = never)
    pub session_idle_timeout_secs: u64,
    /// Grace period between SIGTERM and SIGKILL
    pub stop_timeout_ms: u64,
    pub restart_delay_ms: u64,
    pub default_queue_size: usize,
    pub pid_file: Option<PathBuf>,
}

impl Default for FrameworkConfig {
    fn default() -> Self {
        Self {
            log_file: None,
            log_level: LogLevel::Info,
            max_tools: 50,
            control_host: "localhost".to_string(),
            control_port: 9999,
            max_clients: 16,
            session_idle_timeout_secs: 300,
            stop_timeout_ms: 2000,
            restart_delay_ms: 1000,
            default_queue_size: 1000,
            pid_file: None,
        }
    }
}

impl FrameworkConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn session_idle_timeout(&self) -> Option<Duration> {
        match self.session_idle_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// `host:port` string for the control listener
    pub fn control_addr(&self) -> String {
        format!("{}:{}", self.control_host, self.control_port)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_tools == 0 {
            return Err(FrameError::Config("max_tools must be > 0".to_string()));
        }
        if self.max_clients == 0 {
            return Err(FrameError::Config("max_clients must be > 0".to_string()));
        }
        if self.default_queue_size == 0 {
            return Err(FrameError::Config("default_queue_size must be > 0".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_framework_defaults() {
        let config = FrameworkConfig::default();
        assert_eq!(config.control_addr(), "localhost:9999");
        assert_eq!(config.stop_timeout(), Duration::from_secs(2));
        assert_eq!(config.max_tools, 50);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_idle_timeout_zero_disables() {
        let config = FrameworkConfig {
            session_idle_timeout_secs: 0,
            ..Default::default()
        };
        assert!(config.session_idle_timeout().is_none());
    }

    #[test]
    fn test_log_level_parse() {
        assert_eq!("debug".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!("FATAL".parse::<LogLevel>().unwrap().to_filter(), log::LevelFilter::Error);
        assert!("LOUD".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_max_tools() {
        let config = FrameworkConfig {
            max_tools: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
