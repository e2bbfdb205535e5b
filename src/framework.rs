//! Lifecycle Coordinator
//!
//! Startup order: reap loop, autostart tools, router, control socket.
//! Shutdown order: control socket, tools (SIGTERM, grace period, SIGKILL),
//! router, everything else.
//! SIGHUP re-reads the configuration and applies tool and subscription changes.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::control::{ControlHandler, ControlServer, ControlServerConfig};
use crate::error::Result;
use crate::registry::SubscriptionRegistry;
use crate::router::Router;
use crate::supervisor::{ReloadSummary, Supervisor, SupervisorConfig, ToolState, ToolTransition};

pub struct Framework {
    config: Config,
    /// File the configuration came from; `None` means the default search
    config_path: Option<PathBuf>,
    registry: Arc<SubscriptionRegistry>,
    router: Arc<Router>,
    supervisor: Arc<Supervisor>,
    /// Cancelled when anyone asks the framework to stop
    shutdown: CancellationToken,
    /// Stops the control listener
    listener_cancel: CancellationToken,
    /// Parent of every router and supervisor task
    runtime_cancel: CancellationToken,
    control_task: Option<JoinHandle<Result<()>>>,
    control_addr: Option<SocketAddr>,
    stopped: bool,
}

impl Framework {
    pub fn new(config: Config) -> Self {
        let runtime_cancel = CancellationToken::new();
        let registry = Arc::new(SubscriptionRegistry::from_definitions(&config.tools));
        let router = Router::new(Arc::clone(&registry), runtime_cancel.child_token());
        let supervisor = Supervisor::new(
            &config.tools,
            Arc::clone(&router),
            SupervisorConfig::from(&config.framework),
            runtime_cancel.child_token(),
        );

        Self {
            config,
            config_path: None,
            registry,
            router,
            supervisor,
            shutdown: CancellationToken::new(),
            listener_cancel: CancellationToken::new(),
            runtime_cancel,
            control_task: None,
            control_addr: None,
            stopped: false,
        }
    }

    /// Where `reload` reads the configuration from
    pub fn with_config_path(mut self, path: Option<PathBuf>) -> Self {
        self.config_path = path;
        self
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Token that requests shutdown when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Address the control socket is bound to, once started
    pub fn control_addr(&self) -> Option<SocketAddr> {
        self.control_addr
    }

    /// Bring everything up. Returns the bound control address.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        if let Some(path) = &self.config.framework.pid_file {
            write_pid_file(path);
        }

        tokio::spawn(log_transitions(
            self.supervisor.subscribe_transitions(),
            self.runtime_cancel.clone(),
        ));
        tokio::spawn(Arc::clone(&self.supervisor).reap_loop());

        let autostart = self.supervisor.autostart_tools().await;
        info!("Starting {} autostart tools", autostart.len());
        for name in autostart {
            if let Err(e) = self.supervisor.start(&name).await {
                warn!("Autostart of {} failed: {}", name, e);
            }
        }

        self.router.start();

        let server = ControlServer::bind(ControlServerConfig::from(&self.config.framework)).await?;
        let addr = server.local_addr()?;
        let handler = Arc::new(ControlHandler::new(
            Arc::clone(&self.supervisor),
            Arc::clone(&self.registry),
            self.shutdown.clone(),
        ));
        self.control_task = Some(tokio::spawn(server.run(handler, self.listener_cancel.clone())));
        self.control_addr = Some(addr);

        info!("Framework started, control socket on {}", addr);
        Ok(addr)
    }

    /// Wait until shutdown is requested by a client or a signal. SIGHUP
    /// reloads the configuration and keeps waiting.
    pub async fn wait_for_shutdown(&mut self) {
        let shutdown = self.shutdown.clone();
        let mut hangup = Hangup::new();
        loop {
            let reload = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested");
                    false
                }
                _ = wait_for_signal() => false,
                _ = hangup.recv() => true,
            };
            if !reload {
                break;
            }
            info!("Received SIGHUP, reloading configuration");
            if let Err(e) = self.reload().await {
                error!("Reload failed, keeping current configuration: {}", e);
            }
        }
    }

    /// Re-read the configuration file and apply tool and subscription
    /// changes. `[framework]` settings only apply after a restart. Runtime
    /// `subscribe`/`unsubscribe` changes are replaced by the file's.
    pub async fn reload(&mut self) -> Result<ReloadSummary> {
        let config = Config::load(self.config_path.as_ref())?;

        self.registry.load(&config.tools);
        let summary = self.supervisor.reload(&config.tools).await;
        self.config.tools = config.tools;

        info!(
            "Configuration reloaded: {} added, {} updated, {} removed",
            summary.added.len(),
            summary.updated.len(),
            summary.removed.len()
        );
        Ok(summary)
    }

    /// Start, serve until asked to stop, then shut down
    pub async fn run(mut self) -> Result<()> {
        if let Err(e) = self.start().await {
            self.shutdown().await;
            return Err(e);
        }
        self.wait_for_shutdown().await;
        self.shutdown().await;
        Ok(())
    }

    /// Coordinated shutdown. Safe to call more than once.
    pub async fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        info!("Shutting down framework");

        self.shutdown.cancel();
        self.listener_cancel.cancel();
        if let Some(task) = self.control_task.take() {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Control server error: {}", e),
                Err(e) => warn!("Control server task failed: {}", e),
            }
        }

        self.supervisor.stop_all(self.config.framework.stop_timeout()).await;
        self.router.stop();
        self.runtime_cancel.cancel();

        if let Some(path) = &self.config.framework.pid_file {
            remove_pid_file(path);
        }
        info!("Yuki-Frame shutdown complete");
    }
}

async fn log_transitions(mut rx: tokio::sync::broadcast::Receiver<ToolTransition>, cancel: CancellationToken) {
    loop {
        let transition = tokio::select! {
            _ = cancel.cancelled() => break,
            t = rx.recv() => t,
        };
        match transition {
            Ok(t) if t.to == ToolState::Crashed => {
                error!("Tool {} state {} -> {}", t.tool, t.from, t.to);
            }
            Ok(t) => match t.pid {
                Some(pid) => info!("Tool {} state {} -> {} (pid {})", t.tool, t.from, t.to, pid),
                None => info!("Tool {} state {} -> {}", t.tool, t.from, t.to),
            },
            Err(RecvError::Lagged(n)) => warn!("Missed {} tool transitions", n),
            Err(RecvError::Closed) => break,
        }
    }
}

/// SIGHUP listener; never fires where SIGHUP does not exist
#[cfg(unix)]
struct Hangup(Option<tokio::signal::unix::Signal>);

#[cfg(unix)]
impl Hangup {
    fn new() -> Self {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::hangup()) {
            Ok(sig) => Self(Some(sig)),
            Err(e) => {
                warn!("Cannot listen for SIGHUP: {}", e);
                Self(None)
            }
        }
    }

    async fn recv(&mut self) {
        if let Some(sig) = self.0.as_mut() {
            if sig.recv().await.is_some() {
                return;
            }
            self.0 = None;
        }
        std::future::pending().await
    }
}

#[cfg(not(unix))]
struct Hangup;

#[cfg(not(unix))]
impl Hangup {
    fn new() -> Self {
        Self
    }

    async fn recv(&mut self) {
        std::future::pending().await
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                _ = term.recv() => info!("Received SIGTERM"),
            }
        }
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            info!("Received SIGINT");
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Received Ctrl-C");
}

fn write_pid_file(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Err(e) = fs::create_dir_all(parent) {
            warn!("Cannot create {}: {}", parent.display(), e);
        }
    }
    match fs::write(path, format!("{}\n", std::process::id())) {
        Ok(()) => debug!("Wrote pid file {}", path.display()),
        Err(e) => warn!("Cannot write pid file {}: {}", path.display(), e),
    }
}

fn remove_pid_file(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        debug!("Cannot remove pid file {}: {}", path.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FrameworkConfig, ToolDefinition};

    fn config(tools: Vec<ToolDefinition>) -> Config {
        Config {
            framework: FrameworkConfig {
                control_host: "127.0.0.1".to_string(),
                control_port: 0,
                stop_timeout_ms: 500,
                ..Default::default()
            },
            tools,
        }
    }

    #[tokio::test]
    async fn test_start_binds_and_autostarts() {
        let mut framework = Framework::new(config(vec![
            ToolDefinition::new("auto", "cat").with_autostart(true),
            ToolDefinition::new("manual", "cat"),
        ]));
        let addr = framework.start().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(framework.control_addr(), Some(addr));

        let sup = Arc::clone(framework.supervisor());
        assert_eq!(sup.status("auto").await.unwrap().state, ToolState::Running);
        assert_eq!(sup.status("manual").await.unwrap().state, ToolState::Stopped);

        framework.shutdown().await;
        assert_eq!(sup.status("auto").await.unwrap().state, ToolState::Stopped);
        assert!(!framework.router().is_running());
    }

    #[tokio::test]
    async fn test_autostart_failure_is_not_fatal() {
        let mut framework = Framework::new(config(vec![
            ToolDefinition::new("broken", "/nonexistent/tool").with_autostart(true),
        ]));
        framework.start().await.unwrap();
        let status = framework.supervisor().status("broken").await.unwrap();
        assert_eq!(status.state, ToolState::Stopped);
        framework.shutdown().await;
    }

    #[tokio::test]
    async fn test_pid_file_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("run").join("yuki-frame.pid");
        let mut cfg = config(vec![]);
        cfg.framework.pid_file = Some(pid_file.clone());

        let mut framework = Framework::new(cfg);
        framework.start().await.unwrap();
        let contents = fs::read_to_string(&pid_file).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());

        framework.shutdown().await;
        assert!(!pid_file.exists());
    }

    #[tokio::test]
    async fn test_run_returns_after_shutdown_request() {
        let framework = Framework::new(config(vec![ToolDefinition::new("auto", "cat").with_autostart(true)]));
        let token = framework.shutdown_token();
        let supervisor = Arc::clone(framework.supervisor());
        let handle = tokio::spawn(framework.run());

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        token.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(supervisor.status("auto").await.unwrap().state, ToolState::Stopped);
    }

    #[tokio::test]
    async fn test_reload_applies_tool_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("yuki-frame.conf");
        let base = "[framework]\ncontrol_host = 127.0.0.1\ncontrol_port = 0\nstop_timeout_ms = 500\n\n";
        fs::write(&path, format!("{}[tool.old]\ncommand = cat\nautostart = true\n", base)).unwrap();

        let config = Config::load_from_file(&path).unwrap();
        let mut framework = Framework::new(config).with_config_path(Some(path.clone()));
        framework.start().await.unwrap();

        fs::write(
            &path,
            format!(
                "{}[tool.new]\ncommand = cat\nautostart = true\nsubscriptions = ALERT\n",
                base
            ),
        )
        .unwrap();
        let summary = framework.reload().await.unwrap();
        assert_eq!(summary.added, vec!["new"]);
        assert_eq!(summary.removed, vec!["old"]);

        let sup = Arc::clone(framework.supervisor());
        assert_eq!(sup.status("new").await.unwrap().state, ToolState::Running);
        assert!(sup.status("old").await.is_err());
        assert!(framework.registry().subscribers_of("ALERT").contains("new"));

        framework.shutdown().await;
    }

    #[tokio::test]
    async fn test_reload_with_invalid_file_keeps_running_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("yuki-frame.conf");
        let base = "[framework]\ncontrol_host = 127.0.0.1\ncontrol_port = 0\nstop_timeout_ms = 500\n\n";
        fs::write(&path, format!("{}[tool.a]\ncommand = cat\nautostart = true\n", base)).unwrap();

        let config = Config::load_from_file(&path).unwrap();
        let mut framework = Framework::new(config).with_config_path(Some(path.clone()));
        framework.start().await.unwrap();

        fs::write(&path, "[tool.a]\nautostart = maybe\n").unwrap();
        assert!(framework.reload().await.is_err());
        let status = framework.supervisor().status("a").await.unwrap();
        assert_eq!(status.state, ToolState::Running);

        framework.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_token_ends_wait() {
        let mut framework = Framework::new(config(vec![]));
        framework.start().await.unwrap();

        framework.shutdown_token().cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), framework.wait_for_shutdown())
            .await
            .unwrap();
        framework.shutdown().await;
        framework.shutdown().await;
    }
}
