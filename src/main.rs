use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use log::{LevelFilter, info};
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use yuki_frame::Framework;
use yuki_frame::cli::Cli;
use yuki_frame::config::{Config, FrameworkConfig};

/// Log destination that can be redirected once the config names a log file
#[derive(Clone)]
struct LogSink(Arc<Mutex<Box<dyn Write + Send>>>);

impl LogSink {
    fn stderr() -> Self {
        Self(Arc::new(Mutex::new(Box::new(io::stderr()))))
    }

    fn redirect(&self, target: Box<dyn Write + Send>) -> Result<()> {
        let mut current = self.0.lock().map_err(|_| eyre::eyre!("log sink poisoned"))?;
        *current = target;
        Ok(())
    }
}

impl Write for LogSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().map_err(|_| io::Error::other("log sink poisoned"))?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.lock().map_err(|_| io::Error::other("log sink poisoned"))?.flush()
    }
}

fn rust_log_set() -> bool {
    std::env::var_os("RUST_LOG").is_some()
}

/// Setup logging before anything else runs, writing to stderr
fn setup_logging(cli: &Cli) -> LogSink {
    let sink = LogSink::stderr();

    // RUST_LOG wins over the configured level; otherwise the max level gates output
    env_logger::Builder::new()
        .filter_level(LevelFilter::Trace)
        .parse_default_env()
        .target(env_logger::Target::Pipe(Box::new(sink.clone())))
        .init();

    if !rust_log_set() {
        log::set_max_level(if cli.is_debug() { LevelFilter::Debug } else { LevelFilter::Info });
    }
    sink
}

/// Apply `[framework]` log settings once the config is loaded
fn apply_log_config(cli: &Cli, config: &FrameworkConfig, sink: &LogSink) -> Result<()> {
    if !rust_log_set() && !cli.is_debug() {
        log::set_max_level(config.log_level.to_filter());
    }

    if let Some(log_file) = &config.log_file {
        if let Some(parent) = log_file.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).context("Failed to create log directory")?;
        }
        let target = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("Failed to open log file")?;
        sink.redirect(Box::new(target))?;
        info!("Logging to {}", log_file.display());
    }
    Ok(())
}

fn print_banner(config: &Config) {
    println!(
        "{} {}",
        "Yuki-Frame".bold().cyan(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  {} {}", "Tools configured:".green(), config.tools.len());
    let autostart = config.tools.iter().filter(|t| t.autostart).count();
    println!("  {} {}", "Autostart:".green(), autostart);
}

async fn run_framework(config: Config, config_path: Option<PathBuf>) -> Result<()> {
    let mut framework = Framework::new(config).with_config_path(config_path);

    let addr = match framework.start().await {
        Ok(addr) => addr,
        Err(e) => {
            framework.shutdown().await;
            return Err(e).context("Failed to start framework");
        }
    };
    println!("  {} {}", "Control socket:".green(), addr);
    println!("{}", "Press Ctrl+C to stop".dimmed());

    framework.wait_for_shutdown().await;
    framework.shutdown().await;
    Ok(())
}

fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Setup logging first
    let sink = setup_logging(&cli);

    // Load configuration
    let mut config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    if let Some(port) = cli.port {
        config.framework.control_port = port;
    }

    apply_log_config(&cli, &config.framework, &sink).context("Failed to setup logging")?;
    info!("Starting with config from: {:?}", cli.config);

    print_banner(&config);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    runtime.block_on(run_framework(config, cli.config.clone()))?;

    println!("{}", "Yuki-Frame shutdown complete".green());
    Ok(())
}
