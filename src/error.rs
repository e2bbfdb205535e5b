//! Error types for Yuki-Frame
//!
//! Centralized error handling using thiserror. Only `Config` is fatal, and
//! only at startup; everything else is isolated to one tool or one session.

use thiserror::Error;

/// All error types that can occur in the framework
#[derive(Debug, Error)]
pub enum FrameError {
    /// Configuration file missing or malformed
    #[error("Config error: {0}")]
    Config(String),

    /// Tool command could not be launched
    #[error("Failed to spawn tool '{tool}': {reason}")]
    Spawn { tool: String, reason: String },

    /// Line from a tool that is not `TYPE|sender[|payload]`
    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    /// Destination queue is full, event dropped for that destination
    #[error("Queue full for tool '{tool}'")]
    Backpressure { tool: String },

    /// Tool name not present in the configuration
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    /// Operation not valid for the tool's current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Malformed control command
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Control client connection failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML configuration error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Result type alias for framework operations
pub type Result<T> = std::result::Result<T, FrameError>;
