//! Executes control commands against the supervisor and registry

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use log::info;
use tokio_util::sync::CancellationToken;

use super::protocol::{ControlCommand, Response};
use crate::config::WILDCARD;
use crate::error::FrameError;
use crate::registry::SubscriptionRegistry;
use crate::supervisor::{Supervisor, ToolProcess};

/// Marker phrase consoles look for after `shutdown`
pub const SHUTDOWN_MESSAGE: &str = "Shutting down framework...";

const HELP_TEXT: &str = "\
Available commands:
  list                          List all tools and their status
  status <tool>                 Show detailed status of a tool
  start <tool>                  Start a tool
  stop <tool>                   Stop a tool
  restart <tool>                Restart a tool
  subscribe <tool> <type>       Route events of <type> to a tool
  unsubscribe <tool> <type>     Stop routing events of <type> to a tool
  uptime                        Show framework uptime
  version                       Show framework version
  shutdown                      Shut down the framework
  help                          Show this help
  quit                          Close this session";

/// Seam between the control server and whatever executes commands
pub trait CommandHandler: Send + Sync {
    fn handle(&self, command: ControlCommand) -> impl Future<Output = Response> + Send;
}

pub struct ControlHandler {
    supervisor: Arc<Supervisor>,
    registry: Arc<SubscriptionRegistry>,
    started: Instant,
    shutdown: CancellationToken,
}

impl ControlHandler {
    /// `shutdown` is cancelled when a client issues the shutdown command
    pub fn new(supervisor: Arc<Supervisor>, registry: Arc<SubscriptionRegistry>, shutdown: CancellationToken) -> Self {
        Self {
            supervisor,
            registry,
            started: Instant::now(),
            shutdown,
        }
    }

    async fn list(&self) -> Response {
        let tools = self.supervisor.list().await;
        if tools.is_empty() {
            return Response::new("No tools configured");
        }

        let mut response = Response::new("Tools Status:");
        response.push(format!("{:<20} {:<10} {:<10}", "Name", "Status", "PID"));
        response.push("-".repeat(42));
        for tool in tools {
            response.push(format!("{:<20} {:<10} {:<10}", tool.name, tool.state, pid_text(&tool)));
        }
        response
    }

    async fn status(&self, name: &str) -> Result<Response, FrameError> {
        let tool = self.supervisor.status(name).await?;
        let subscriptions = self.registry.subscriptions_of(name);

        let mut response = Response::new("Tool Status:");
        response.push(format!("  Name:             {}", tool.name));
        response.push(format!("  Command:          {}", tool.command));
        response.push(format!("  Description:      {}", tool.description));
        response.push(format!("  Status:           {}", tool.state));
        response.push(format!("  PID:              {}", pid_text(&tool)));
        response.push(format!("  Autostart:        {}", yes_no(tool.autostart)));
        response.push(format!("  Restart on crash: {}", yes_no(tool.restart_on_crash)));
        response.push(format!("  Restarts:         {}", tool.restart_count));
        response.push(format!(
            "  Subscriptions:    {}",
            if subscriptions.is_empty() {
                "(none)".to_string()
            } else {
                subscriptions.into_iter().collect::<Vec<_>>().join(", ")
            }
        ));
        response.push(format!("  Events sent:      {}", tool.events_sent));
        response.push(format!("  Events received:  {}", tool.events_received));
        response.push(format!("  Events dropped:   {}", tool.events_dropped));
        if let Some(started) = tool.started_at {
            response.push(format!("  Started at:       {}", started.format("%Y-%m-%d %H:%M:%S UTC")));
        }
        if let Some(activity) = tool.last_activity {
            response.push(format!("  Last activity:    {}", activity.format("%Y-%m-%d %H:%M:%S UTC")));
        }
        if let Some(exit) = &tool.last_exit {
            response.push(format!("  Last exit:        {}", exit.summary));
        }
        Ok(response)
    }

    async fn start(&self, name: &str) -> Result<Response, FrameError> {
        let tool = self.supervisor.start(name).await.map_err(|e| match e {
            FrameError::InvalidState(_) => FrameError::InvalidState(format!("Tool '{}' is already running", name)),
            other => other,
        })?;
        Ok(Response::new(format!(
            "Success: Tool '{}' started\n  PID: {}\n  Status: {}",
            name,
            pid_text(&tool),
            tool.state
        )))
    }

    async fn stop(&self, name: &str) -> Result<Response, FrameError> {
        let current = self.supervisor.status(name).await?;
        if !current.state.is_live() {
            return Err(FrameError::InvalidState(format!("Tool '{}' is not running", name)));
        }
        self.supervisor.stop(name, self.supervisor.config().stop_timeout).await?;
        Ok(Response::new(format!("Success: Tool '{}' stopped", name)))
    }

    async fn restart(&self, name: &str) -> Result<Response, FrameError> {
        let tool = self.supervisor.restart(name).await?;
        Ok(Response::new(format!(
            "Success: Tool '{}' restarted\n  PID: {}",
            name,
            pid_text(&tool)
        )))
    }

    async fn subscribe(&self, tool: &str, event_type: &str) -> Result<Response, FrameError> {
        self.check_subscription_args(tool, event_type).await?;
        if self.registry.subscribe(tool, event_type) {
            info!("Subscribed {} to {}", tool, event_type);
            Ok(Response::new(format!("Success: Tool '{}' subscribed to '{}'", tool, event_type)))
        } else {
            Ok(Response::new(format!("Tool '{}' is already subscribed to '{}'", tool, event_type)))
        }
    }

    async fn unsubscribe(&self, tool: &str, event_type: &str) -> Result<Response, FrameError> {
        self.check_subscription_args(tool, event_type).await?;
        if self.registry.unsubscribe(tool, event_type) {
            info!("Unsubscribed {} from {}", tool, event_type);
            Ok(Response::new(format!(
                "Success: Tool '{}' unsubscribed from '{}'",
                tool, event_type
            )))
        } else {
            Err(FrameError::InvalidState(format!(
                "Tool '{}' is not subscribed to '{}'",
                tool, event_type
            )))
        }
    }

    async fn check_subscription_args(&self, tool: &str, event_type: &str) -> Result<(), FrameError> {
        if !self.supervisor.contains(tool).await {
            return Err(FrameError::ToolNotFound(tool.to_string()));
        }
        if event_type != WILDCARD && event_type.contains('|') {
            return Err(FrameError::Protocol(format!("Invalid event type '{}'", event_type)));
        }
        Ok(())
    }

    fn uptime(&self) -> Response {
        let secs = self.started.elapsed().as_secs();
        Response::new(format!(
            "Framework uptime: {}h {}m {}s",
            secs / 3600,
            (secs % 3600) / 60,
            secs % 60
        ))
    }
}

impl CommandHandler for ControlHandler {
    async fn handle(&self, command: ControlCommand) -> Response {
        let result = match &command {
            ControlCommand::List => Ok(self.list().await),
            ControlCommand::Status(name) => self.status(name).await,
            ControlCommand::Start(name) => self.start(name).await,
            ControlCommand::Stop(name) => self.stop(name).await,
            ControlCommand::Restart(name) => self.restart(name).await,
            ControlCommand::Subscribe { tool, event_type } => self.subscribe(tool, event_type).await,
            ControlCommand::Unsubscribe { tool, event_type } => self.unsubscribe(tool, event_type).await,
            ControlCommand::Shutdown => {
                info!("Shutdown requested over control socket");
                self.shutdown.cancel();
                Ok(Response::new(SHUTDOWN_MESSAGE))
            }
            ControlCommand::Help => Ok(Response::new(HELP_TEXT)),
            ControlCommand::Quit => Ok(Response::new("Goodbye")),
            ControlCommand::Uptime => Ok(self.uptime()),
            ControlCommand::Version => Ok(Response::new(format!(
                "Yuki-Frame version {}",
                env!("CARGO_PKG_VERSION")
            ))),
        };

        result.unwrap_or_else(|e| {
            if let FrameError::Spawn { reason, .. } = &e {
                return Response::error(format!("Failed to start tool '{}': {}", command_target(&command), reason));
            }
            Response::from_error(&e)
        })
    }
}

fn command_target(command: &ControlCommand) -> &str {
    match command {
        ControlCommand::Status(name)
        | ControlCommand::Start(name)
        | ControlCommand::Stop(name)
        | ControlCommand::Restart(name) => name,
        ControlCommand::Subscribe { tool, .. } | ControlCommand::Unsubscribe { tool, .. } => tool,
        _ => "",
    }
}

fn pid_text(tool: &ToolProcess) -> String {
    tool.pid.map_or_else(|| "-".to_string(), |pid| pid.to_string())
}

fn yes_no(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
