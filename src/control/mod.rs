//! Control Socket - TCP administrative interface
//!
//! This module provides:
//! - Command parsing and response framing
//! - Line codecs for both ends of the connection
//! - The command handler backed by the supervisor and registry
//! - The TCP server and a client

pub mod client;
pub mod codec;
pub mod handler;
pub mod protocol;
pub mod server;

pub use client::ControlClient;
pub use codec::{CommandLine, ControlCodec, ResponseCodec};
pub use handler::{CommandHandler, ControlHandler, SHUTDOWN_MESSAGE};
pub use protocol::{ControlCommand, MAX_COMMAND_LENGTH, Response, TERMINATOR};
pub use server::{ControlServer, ControlServerConfig};
