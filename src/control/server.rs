//! Control Socket Server - TCP listener for console clients
//!
//! Provides:
//! - TCP listener bound to the configured host/port
//! - One task per client session, capped at `max_clients`
//! - Idle timeout per session
//! - Cooperative shutdown: stop accepting, let sessions finish their current command

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use super::codec::{CommandLine, ControlCodec};
use super::handler::CommandHandler;
use super::protocol::{ControlCommand, MAX_COMMAND_LENGTH, Response};
use crate::config::FrameworkConfig;
use crate::error::{FrameError, Result};

/// How long shutdown waits for in-flight sessions
const SESSION_DRAIN: Duration = Duration::from_secs(5);

/// Configuration for the control server
#[derive(Debug, Clone)]
pub struct ControlServerConfig {
    /// `host:port` to bind
    pub addr: String,
    /// Maximum number of concurrent sessions
    pub max_clients: usize,
    /// Close sessions idle this long; `None` keeps them open
    pub idle_timeout: Option<Duration>,
    pub max_command_length: usize,
}

impl Default for ControlServerConfig {
    fn default() -> Self {
        Self::from(&FrameworkConfig::default())
    }
}

impl From<&FrameworkConfig> for ControlServerConfig {
    fn from(config: &FrameworkConfig) -> Self {
        Self {
            addr: config.control_addr(),
            max_clients: config.max_clients,
            idle_timeout: config.session_idle_timeout(),
            max_command_length: MAX_COMMAND_LENGTH,
        }
    }
}

impl ControlServerConfig {
    pub fn with_addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = addr.into();
        self
    }

    pub fn with_max_clients(mut self, max: usize) -> Self {
        self.max_clients = max;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }
}

/// Decrements the session count when a session ends
struct SessionSlot(Arc<AtomicUsize>);

impl Drop for SessionSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct ControlServer {
    config: ControlServerConfig,
    listener: TcpListener,
    sessions: Arc<AtomicUsize>,
}

impl ControlServer {
    /// Bind the listener. Failure here is fatal to startup.
    pub async fn bind(config: ControlServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(&config.addr)
            .await
            .map_err(|e| FrameError::Connection(format!("Failed to bind control socket {}: {}", config.addr, e)))?;
        let bound = listener.local_addr()?;
        info!("Control socket listening on {} ({})", bound, config.addr);
        Ok(Self {
            config,
            listener,
            sessions: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept sessions until `cancel` fires, then wait briefly for open
    /// sessions to finish their current command
    pub async fn run<H: CommandHandler + 'static>(self, handler: Arc<H>, cancel: CancellationToken) -> Result<()> {
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => {
                            while tasks.try_join_next().is_some() {}

                            if self.sessions.load(Ordering::SeqCst) >= self.config.max_clients {
                                warn!("Rejecting control client {}: too many clients", peer);
                                tasks.spawn(reject(stream));
                                continue;
                            }

                            self.sessions.fetch_add(1, Ordering::SeqCst);
                            let slot = SessionSlot(Arc::clone(&self.sessions));
                            let handler = Arc::clone(&handler);
                            let config = self.config.clone();
                            let cancel = cancel.clone();
                            tasks.spawn(async move {
                                let _slot = slot;
                                debug!("Control client connected: {}", peer);
                                if let Err(e) = handle_session(stream, handler, &config, cancel).await {
                                    debug!("Control session {} ended: {}", peer, e);
                                }
                                debug!("Control client disconnected: {}", peer);
                            });
                        }
                        Err(e) => warn!("Accept error: {}", e),
                    }
                }
            }
        }

        drop(self.listener);
        let drained = tokio::time::timeout(SESSION_DRAIN, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("Control sessions still open after {:?}, aborting", SESSION_DRAIN);
            tasks.abort_all();
        }
        info!("Control socket closed");
        Ok(())
    }
}

async fn reject(stream: TcpStream) {
    let mut framed = Framed::new(stream, ControlCodec::new());
    let _ = framed.send(Response::error("Too many clients")).await;
}

/// Serve one client until it quits, disconnects, idles out or shutdown begins
async fn handle_session<H: CommandHandler>(
    stream: TcpStream,
    handler: Arc<H>,
    config: &ControlServerConfig,
    cancel: CancellationToken,
) -> Result<()> {
    let mut framed = Framed::new(stream, ControlCodec::with_max_length(config.max_command_length));

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = next_line(&mut framed, config.idle_timeout) => next,
        };

        let line = match next {
            Err(_) => {
                framed.send(Response::error("Session idle timeout")).await?;
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => return Err(FrameError::Connection(e.to_string())),
            Ok(Some(Ok(CommandLine::Overlong))) => {
                let response = Response::error(format!(
                    "Command too long (max {} bytes)",
                    config.max_command_length
                ));
                framed.send(response).await?;
                continue;
            }
            Ok(Some(Ok(CommandLine::Line(line)))) => line,
        };

        if line.trim().is_empty() {
            continue;
        }

        let command = match line.parse::<ControlCommand>() {
            Ok(command) => command,
            Err(e) => {
                framed.send(Response::from_error(&e)).await?;
                continue;
            }
        };

        debug!("Control command: {}", command.keyword());
        let quit = command == ControlCommand::Quit;
        let response = handler.handle(command).await;
        framed.send(response).await?;
        if quit {
            break;
        }
    }
    Ok(())
}

type NextLine = Option<std::result::Result<CommandLine, std::io::Error>>;

async fn next_line(
    framed: &mut Framed<TcpStream, ControlCodec>,
    idle: Option<Duration>,
) -> std::result::Result<NextLine, tokio::time::error::Elapsed> {
    match idle {
        Some(idle) => tokio::time::timeout(idle, framed.next()).await,
        None => Ok(framed.next().await),
    }
}
