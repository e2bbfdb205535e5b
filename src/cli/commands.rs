//! CLI definition using clap.

use clap::Parser;
use std::path::PathBuf;

/// Yuki-Frame - event routing and process supervision for line-protocol tools
#[derive(Parser, Debug)]
#[command(name = "Yuki-Frame", bin_name = "yuki-frame")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Config file path (INI, or YAML with a .yml/.yaml extension)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,

    /// Override the control socket port
    #[arg(short, long)]
    pub port: Option<u16>,
}

impl Cli {
    pub fn is_debug(&self) -> bool {
        self.debug
    }
}
