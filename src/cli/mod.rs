//! CLI module for yuki-frame: command-line flags for the framework binary.

pub mod commands;

pub use commands::Cli;
