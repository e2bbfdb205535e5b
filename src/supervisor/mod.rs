//! Process Supervisor
//!
//! Owns the lifecycle of every tool's child process. Each spawn gets a watcher
//! task that waits on the child and reports its exit on a channel; the reap
//! loop turns those reports into `Stopped` or `Crashed` transitions. A
//! generation number per spawn keeps late reports from an old process from
//! touching the entry of its replacement.

pub mod process;

pub use process::{ExitInfo, ToolProcess, ToolState, ToolStats, ToolTransition};

use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use log::{debug, error, info, warn};
use tokio::process::{Child, Command};
use tokio::sync::{RwLock, broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::config::{FrameworkConfig, ToolDefinition};
use crate::error::{FrameError, Result};
use crate::router::{QueueSpec, Router, ToolPipes};

/// How long to wait for a process to go away after SIGKILL
const KILL_GRACE: Duration = Duration::from_secs(1);

const TRANSITION_CAPACITY: usize = 256;

/// Supervisor tunables
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Grace period between SIGTERM and SIGKILL
    pub stop_timeout: Duration,
    /// Delay before an automatic restart after a crash
    pub restart_delay: Duration,
    /// Queue capacity for tools without their own `max_queue_size`
    pub default_queue_size: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self::from(&FrameworkConfig::default())
    }
}

impl From<&FrameworkConfig> for SupervisorConfig {
    fn from(config: &FrameworkConfig) -> Self {
        Self {
            stop_timeout: config.stop_timeout(),
            restart_delay: config.restart_delay(),
            default_queue_size: config.default_queue_size,
        }
    }
}

struct ToolEntry {
    def: ToolDefinition,
    state: ToolState,
    pid: Option<u32>,
    generation: u64,
    started_at: Option<DateTime<Utc>>,
    stop_requested: bool,
    restart_count: u32,
    last_exit: Option<ExitInfo>,
    stats: Arc<ToolStats>,
    exit_rx: Option<watch::Receiver<Option<ExitInfo>>>,
    kill_tx: Option<oneshot::Sender<()>>,
}

impl ToolEntry {
    fn new(def: ToolDefinition) -> Self {
        Self {
            def,
            state: ToolState::Stopped,
            pid: None,
            generation: 0,
            started_at: None,
            stop_requested: false,
            restart_count: 0,
            last_exit: None,
            stats: Arc::new(ToolStats::new()),
            exit_rx: None,
            kill_tx: None,
        }
    }

    fn snapshot(&self) -> ToolProcess {
        ToolProcess {
            name: self.def.name.clone(),
            command: self.def.command.clone(),
            description: self.def.description.clone(),
            state: self.state,
            pid: self.pid,
            autostart: self.def.autostart,
            restart_on_crash: self.def.restart_on_crash,
            restart_count: self.restart_count,
            started_at: self.started_at,
            last_activity: self.stats.last_activity(),
            last_exit: self.last_exit.clone(),
            events_sent: self.stats.events_sent(),
            events_received: self.stats.events_received(),
            events_dropped: self.stats.events_dropped(),
        }
    }
}

#[derive(Default)]
struct ToolTable {
    entries: HashMap<String, ToolEntry>,
    /// Configuration order, used for listing
    order: Vec<String>,
}

impl ToolTable {
    fn register(&mut self, def: ToolDefinition) {
        match self.entries.get_mut(&def.name) {
            Some(entry) if !entry.state.is_live() => entry.def = def,
            Some(_) => {}
            None => {
                self.order.push(def.name.clone());
                self.entries.insert(def.name.clone(), ToolEntry::new(def));
            }
        }
    }

    fn get_mut(&mut self, name: &str) -> Result<&mut ToolEntry> {
        self.entries
            .get_mut(name)
            .ok_or_else(|| FrameError::ToolNotFound(name.to_string()))
    }
}

/// What a reload changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadSummary {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
}

struct ExitNotice {
    name: String,
    generation: u64,
    info: ExitInfo,
}

pub struct Supervisor {
    table: RwLock<ToolTable>,
    router: Arc<Router>,
    config: SupervisorConfig,
    exit_tx: mpsc::UnboundedSender<ExitNotice>,
    exit_rx: Mutex<Option<mpsc::UnboundedReceiver<ExitNotice>>>,
    transitions: broadcast::Sender<ToolTransition>,
    cancel: CancellationToken,
}

impl Supervisor {
    /// Create a supervisor with every definition registered as `Stopped`
    pub fn new(
        defs: &[ToolDefinition],
        router: Arc<Router>,
        config: SupervisorConfig,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let mut table = ToolTable::default();
        for def in defs {
            table.register(def.clone());
        }
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let (transitions, _) = broadcast::channel(TRANSITION_CAPACITY);

        Arc::new(Self {
            table: RwLock::new(table),
            router,
            config,
            exit_tx,
            exit_rx: Mutex::new(Some(exit_rx)),
            transitions,
            cancel,
        })
    }

    /// Receive every state transition from now on
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<ToolTransition> {
        self.transitions.subscribe()
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Register `def` (if new) and start it
    pub async fn spawn(&self, def: ToolDefinition) -> Result<ToolProcess> {
        def.validate()?;
        let name = def.name.clone();
        self.table.write().await.register(def);
        self.start(&name).await
    }

    /// Start a configured tool that is not currently running
    pub async fn start(&self, name: &str) -> Result<ToolProcess> {
        let mut table = self.table.write().await;
        let entry = table.get_mut(name)?;
        if entry.state.is_live() {
            return Err(FrameError::InvalidState(format!(
                "Tool '{}' is already {}",
                name, entry.state
            )));
        }
        self.launch(entry)?;
        Ok(entry.snapshot())
    }

    /// Ask a tool to exit, force-killing it after `timeout`
    pub async fn stop(&self, name: &str, timeout: Duration) -> Result<ToolProcess> {
        let (mut exit_rx, generation) = {
            let mut table = self.table.write().await;
            let entry = table.get_mut(name)?;
            match entry.state {
                ToolState::Stopped => return Ok(entry.snapshot()),
                ToolState::Crashed => {
                    self.set_state(entry, ToolState::Stopped);
                    return Ok(entry.snapshot());
                }
                ToolState::Starting | ToolState::Running => {
                    entry.stop_requested = true;
                    self.set_state(entry, ToolState::Stopping);
                    let terminated = entry.pid.is_some_and(send_terminate);
                    if !terminated {
                        if let Some(kill_tx) = entry.kill_tx.take() {
                            let _ = kill_tx.send(());
                        }
                    }
                }
                ToolState::Stopping => {}
            }
            match entry.exit_rx.clone() {
                Some(rx) => (rx, entry.generation),
                None => {
                    self.set_state(entry, ToolState::Stopped);
                    return Ok(entry.snapshot());
                }
            }
        };

        let exited = tokio::time::timeout(timeout, exit_rx.wait_for(Option::is_some))
            .await
            .is_ok();
        if !exited {
            warn!("Tool {} did not exit within {:?}, killing", name, timeout);
            let kill_tx = self.table.write().await.get_mut(name)?.kill_tx.take();
            if let Some(kill_tx) = kill_tx {
                let _ = kill_tx.send(());
            }
            if tokio::time::timeout(KILL_GRACE, exit_rx.wait_for(Option::is_some))
                .await
                .is_err()
            {
                error!("Tool {} still not reaped after kill", name);
            }
        }

        let last_exit = exit_rx.borrow().clone();
        let mut table = self.table.write().await;
        let entry = table.get_mut(name)?;
        if entry.generation == generation && entry.state == ToolState::Stopping {
            entry.pid = None;
            entry.last_exit = last_exit.or_else(|| Some(ExitInfo::unknown("killed")));
            self.set_state(entry, ToolState::Stopped);
        }
        Ok(entry.snapshot())
    }

    /// Stop (if running) and start again
    pub async fn restart(&self, name: &str) -> Result<ToolProcess> {
        self.stop(name, self.config.stop_timeout).await?;
        self.start(name).await
    }

    pub async fn status(&self, name: &str) -> Result<ToolProcess> {
        let table = self.table.read().await;
        table
            .entries
            .get(name)
            .map(ToolEntry::snapshot)
            .ok_or_else(|| FrameError::ToolNotFound(name.to_string()))
    }

    /// Snapshots of every configured tool, in configuration order
    pub async fn list(&self) -> Vec<ToolProcess> {
        let table = self.table.read().await;
        table
            .order
            .iter()
            .filter_map(|name| table.entries.get(name))
            .map(ToolEntry::snapshot)
            .collect()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.table.read().await.entries.contains_key(name)
    }

    /// Names of tools marked for autostart, in configuration order
    pub async fn autostart_tools(&self) -> Vec<String> {
        let table = self.table.read().await;
        table
            .order
            .iter()
            .filter(|name| table.entries.get(*name).is_some_and(|e| e.def.autostart))
            .cloned()
            .collect()
    }

    /// Stop every live tool concurrently
    pub async fn stop_all(&self, timeout: Duration) {
        let live: Vec<String> = {
            let table = self.table.read().await;
            table
                .order
                .iter()
                .filter(|name| table.entries.get(*name).is_some_and(|e| e.state.is_live()))
                .cloned()
                .collect()
        };
        if live.is_empty() {
            return;
        }

        info!("Stopping {} tools", live.len());
        let results = join_all(live.iter().map(|name| self.stop(name, timeout))).await;
        for (name, result) in live.iter().zip(results) {
            if let Err(e) = result {
                warn!("Failed to stop {}: {}", name, e);
            }
        }
    }

    /// Apply a new definition set.
    ///
    /// Tools missing from `defs` are stopped and forgotten. New tools are
    /// registered and started if marked autostart. Changed definitions of
    /// existing tools take effect on their next start.
    pub async fn reload(&self, defs: &[ToolDefinition]) -> ReloadSummary {
        let wanted: HashSet<&str> = defs.iter().map(|d| d.name.as_str()).collect();
        let removed: Vec<String> = {
            let table = self.table.read().await;
            table
                .order
                .iter()
                .filter(|name| !wanted.contains(name.as_str()))
                .cloned()
                .collect()
        };
        for name in &removed {
            if let Err(e) = self.stop(name, self.config.stop_timeout).await {
                warn!("Failed to stop removed tool {}: {}", name, e);
            }
        }

        let mut summary = ReloadSummary::default();
        let mut autostart = Vec::new();
        {
            let mut table = self.table.write().await;
            let mut order: Vec<String> = defs.iter().map(|d| d.name.clone()).collect();
            for name in removed {
                // Started again while the others were stopping
                if table.entries.get(&name).is_some_and(|e| e.state.is_live()) {
                    warn!("Removed tool {} is running again, keeping it", name);
                    order.push(name);
                    continue;
                }
                table.entries.remove(&name);
                summary.removed.push(name);
            }

            for def in defs {
                match table.entries.get_mut(&def.name) {
                    Some(entry) if entry.def != *def => {
                        entry.def = def.clone();
                        summary.updated.push(def.name.clone());
                    }
                    Some(_) => {}
                    None => {
                        table.entries.insert(def.name.clone(), ToolEntry::new(def.clone()));
                        summary.added.push(def.name.clone());
                        if def.autostart {
                            autostart.push(def.name.clone());
                        }
                    }
                }
            }
            table.order = order;
        }

        for name in autostart {
            if let Err(e) = self.start(&name).await {
                warn!("Autostart of {} failed: {}", name, e);
            }
        }
        summary
    }

    /// Collect exit reports until cancelled. Run once per supervisor.
    pub async fn reap_loop(self: Arc<Self>) {
        let rx = self.exit_rx.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(mut rx) = rx else {
            warn!("Reap loop already running");
            return;
        };

        debug!("Reap loop started");
        loop {
            let notice = tokio::select! {
                _ = self.cancel.cancelled() => break,
                notice = rx.recv() => match notice {
                    Some(notice) => notice,
                    None => break,
                },
            };
            self.handle_exit(notice).await;
        }
        debug!("Reap loop finished");
    }

    async fn handle_exit(self: &Arc<Self>, notice: ExitNotice) {
        let mut table = self.table.write().await;
        let Some(entry) = table.entries.get_mut(&notice.name) else {
            return;
        };
        if entry.generation != notice.generation || !entry.state.is_live() {
            debug!("Ignoring stale exit of {} ({})", notice.name, notice.info.summary);
            return;
        }

        entry.pid = None;
        entry.kill_tx = None;
        entry.last_exit = Some(notice.info.clone());

        if entry.stop_requested {
            info!("Tool {} exited: {}", notice.name, notice.info.summary);
            self.set_state(entry, ToolState::Stopped);
            return;
        }

        error!("Tool {} crashed: {}", notice.name, notice.info.summary);
        self.set_state(entry, ToolState::Crashed);

        if !entry.def.restart_on_crash {
            return;
        }
        if entry.restart_count >= entry.def.max_restarts {
            warn!(
                "Tool {} reached max restarts ({}), leaving it crashed",
                notice.name, entry.def.max_restarts
            );
            return;
        }

        entry.restart_count += 1;
        info!(
            "Restarting {} in {:?} (attempt {}/{})",
            notice.name, self.config.restart_delay, entry.restart_count, entry.def.max_restarts
        );
        let this = Arc::clone(self);
        let generation = entry.generation;
        tokio::spawn(async move {
            tokio::select! {
                _ = this.cancel.cancelled() => {}
                _ = tokio::time::sleep(this.config.restart_delay) => {
                    this.restart_crashed(&notice.name, generation).await;
                }
            }
        });
    }

    async fn restart_crashed(&self, name: &str, generation: u64) {
        let mut table = self.table.write().await;
        let Ok(entry) = table.get_mut(name) else {
            return;
        };
        // Someone started or stopped it meanwhile
        if entry.generation != generation || entry.state != ToolState::Crashed {
            return;
        }
        if let Err(e) = self.launch(entry) {
            error!("Automatic restart of {} failed: {}", name, e);
        }
    }

    /// Spawn the process for `entry` and hand its pipes to the router.
    /// Called with the table lock held.
    fn launch(&self, entry: &mut ToolEntry) -> Result<()> {
        let name = entry.def.name.clone();
        self.set_state(entry, ToolState::Starting);

        let mut child = match entry.def.argv().and_then(|argv| spawn_child(&name, &argv)) {
            Ok(child) => child,
            Err(e) => {
                error!("{}", e);
                self.set_state(entry, ToolState::Stopped);
                return Err(e);
            }
        };

        let pid = child.id();
        let pipes = ToolPipes {
            stdin: child.stdin.take(),
            stdout: child.stdout.take(),
            stderr: child.stderr.take(),
        };

        let (exit_watch, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel();
        entry.generation += 1;
        entry.pid = pid;
        entry.started_at = Some(Utc::now());
        entry.stop_requested = false;
        entry.exit_rx = Some(exit_rx);
        entry.kill_tx = Some(kill_tx);

        tokio::spawn(watch_child(
            child,
            name.clone(),
            entry.generation,
            kill_rx,
            exit_watch,
            self.exit_tx.clone(),
        ));

        let capacity = entry.def.queue_size(self.config.default_queue_size);
        self.router.attach(
            &name,
            pipes,
            QueueSpec::new(capacity, entry.def.queue_policy),
            Arc::clone(&entry.stats),
        );

        self.set_state(entry, ToolState::Running);
        info!("Started tool {} (pid {})", name, pid.map_or_else(|| "?".to_string(), |p| p.to_string()));
        Ok(())
    }

    fn set_state(&self, entry: &mut ToolEntry, to: ToolState) {
        let from = entry.state;
        if from == to {
            return;
        }
        entry.state = to;
        if matches!(to, ToolState::Stopping | ToolState::Stopped | ToolState::Crashed) {
            self.router.detach(&entry.def.name);
        }
        // No receivers is fine
        let _ = self.transitions.send(ToolTransition {
            tool: entry.def.name.clone(),
            from,
            to,
            pid: entry.pid,
        });
    }
}

fn spawn_child(name: &str, argv: &[String]) -> Result<Child> {
    let (program, args) = argv.split_first().ok_or_else(|| FrameError::Spawn {
        tool: name.to_string(),
        reason: "empty command".to_string(),
    })?;

    Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| FrameError::Spawn {
            tool: name.to_string(),
            reason: e.to_string(),
        })
}

async fn watch_child(
    mut child: Child,
    name: String,
    generation: u64,
    kill_rx: oneshot::Receiver<()>,
    exited: watch::Sender<Option<ExitInfo>>,
    notify: mpsc::UnboundedSender<ExitNotice>,
) {
    let waited = tokio::select! {
        status = child.wait() => Some(status),
        Ok(()) = kill_rx => None,
    };
    let status = match waited {
        Some(status) => status,
        None => {
            debug!("Force killing {}", name);
            if let Err(e) = child.start_kill() {
                debug!("Kill of {} failed: {}", name, e);
            }
            child.wait().await
        }
    };

    let info = match status {
        Ok(status) => ExitInfo::from(&status),
        Err(e) => ExitInfo::unknown(e.to_string()),
    };
    exited.send_replace(Some(info.clone()));
    let _ = notify.send(ExitNotice { name, generation, info });
}

/// Send SIGTERM. Returns false when the signal could not be delivered.
#[cfg(unix)]
fn send_terminate(pid: u32) -> bool {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), Signal::SIGTERM) {
        Ok(()) => true,
        Err(e) => {
            debug!("SIGTERM to {} failed: {}", pid, e);
            false
        }
    }
}

#[cfg(not(unix))]
fn send_terminate(_pid: u32) -> bool {
    false
}
