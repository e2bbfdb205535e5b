//! Yuki-Frame - event routing and process supervision
//!
//! Launches configured tool processes, routes `TYPE|sender|payload` lines
//! between them by subscription, and serves a TCP control protocol.

pub mod cli;
pub mod config;
pub mod control;
pub mod error;
pub mod event;
pub mod framework;
pub mod lines;
pub mod registry;
pub mod router;
pub mod supervisor;

pub use error::{FrameError, Result};
pub use framework::Framework;
