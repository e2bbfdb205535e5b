//! Event Router
//!
//! One reader task per tool output stream, one writer task per tool input
//! stream, plus a task forwarding each tool's stderr to the log. Readers parse
//! lines, look up recipients in a registry snapshot and push the line onto each
//! recipient's `Outbox`. The origin of an event is the tool whose pipe produced
//! it; the sender field on the wire is only logged.

pub mod outbox;

pub use outbox::{Outbox, Pushed};

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use futures::StreamExt;
use log::{debug, info, trace, warn};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use crate::config::QueuePolicy;
use crate::error::FrameError;
use crate::event::Event;
use crate::lines::{BoundedLine, BoundedLines};
use crate::registry::SubscriptionRegistry;
use crate::supervisor::ToolStats;

/// Longest line accepted from a tool's stdout or stderr
pub const MAX_EVENT_LENGTH: usize = 64 * 1024;

/// Pipes of a freshly spawned tool. Any of them may be absent.
pub struct ToolPipes<W, R, E> {
    pub stdin: Option<W>,
    pub stdout: Option<R>,
    pub stderr: Option<E>,
}

/// Queue settings for one destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSpec {
    pub capacity: usize,
    pub policy: QueuePolicy,
}

impl QueueSpec {
    pub fn new(capacity: usize, policy: QueuePolicy) -> Self {
        Self { capacity, policy }
    }
}

struct Attachment {
    outbox: Arc<Outbox>,
    writer_cancel: CancellationToken,
}

pub struct Router {
    registry: Arc<SubscriptionRegistry>,
    active: RwLock<HashMap<String, Attachment>>,
    started: watch::Sender<bool>,
    cancel: CancellationToken,
}

impl Router {
    /// Create a router. Nothing is read from any tool until `start`.
    pub fn new(registry: Arc<SubscriptionRegistry>, cancel: CancellationToken) -> Arc<Self> {
        let (started, _) = watch::channel(false);
        Arc::new(Self {
            registry,
            active: RwLock::new(HashMap::new()),
            started,
            cancel,
        })
    }

    /// Begin consuming tool output. Lines written before this wait in the pipes.
    pub fn start(&self) {
        self.started.send_replace(true);
        info!("Event router started");
    }

    /// Stop all reader and writer tasks and drop every destination
    pub fn stop(&self) {
        self.cancel.cancel();
        let drained: Vec<_> = self
            .active
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (_, attachment) in drained {
            attachment.outbox.close();
            attachment.writer_cancel.cancel();
        }
        info!("Event router stopped");
    }

    pub fn is_running(&self) -> bool {
        *self.started.borrow() && !self.cancel.is_cancelled()
    }

    /// Register a tool's pipes and spawn its reader, writer and stderr tasks
    pub fn attach<W, R, E>(
        self: &Arc<Self>,
        tool: &str,
        pipes: ToolPipes<W, R, E>,
        queue: QueueSpec,
        stats: Arc<ToolStats>,
    ) where
        W: AsyncWrite + Unpin + Send + 'static,
        R: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        if self.cancel.is_cancelled() {
            warn!("Router stopped, not attaching tool {}", tool);
            return;
        }

        self.detach(tool);

        if let Some(stdin) = pipes.stdin {
            let outbox = Arc::new(Outbox::new(tool, queue.capacity, queue.policy, Arc::clone(&stats)));
            let writer_cancel = self.cancel.child_token();
            tokio::spawn(write_loop(
                Arc::clone(&outbox),
                stdin,
                Arc::clone(&stats),
                writer_cancel.clone(),
            ));
            self.active
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(tool.to_string(), Attachment { outbox, writer_cancel });
        }

        if let Some(stdout) = pipes.stdout {
            tokio::spawn(read_loop(Arc::clone(self), tool.to_string(), stdout, Arc::clone(&stats)));
        }

        if let Some(stderr) = pipes.stderr {
            tokio::spawn(stderr_loop(tool.to_string(), stderr, stats, self.cancel.clone()));
        }

        debug!("Attached tool {} to router", tool);
    }

    /// Remove a tool from the active set. Events routed afterwards skip it.
    pub fn detach(&self, tool: &str) {
        let removed = self
            .active
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(tool);
        if let Some(attachment) = removed {
            attachment.outbox.close();
            attachment.writer_cancel.cancel();
            debug!("Detached tool {} from router", tool);
        }
    }

    pub fn is_attached(&self, tool: &str) -> bool {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(tool)
    }

    /// Lines waiting for a tool's writer
    pub fn queue_len(&self, tool: &str) -> Option<usize> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(tool)
            .map(|a| a.outbox.queued())
    }

    /// Route one line from `origin`. Never blocks.
    ///
    /// Returns the tools the line was queued for.
    pub fn route(&self, origin: &str, line: &str, stats: &ToolStats) -> Vec<String> {
        if line.trim().is_empty() {
            return Vec::new();
        }

        let event = match Event::parse(line) {
            Ok(event) => event,
            Err(e) => {
                stats.record_malformed();
                warn!("Dropping line from {}: {}", origin, e);
                return Vec::new();
            }
        };
        stats.record_sent();

        if event.sender != origin {
            debug!(
                "Tool {} emitted {} with sender field '{}'",
                origin, event.event_type, event.sender
            );
        }

        let recipients = self.registry.snapshot().recipients(&event.event_type, origin);
        let line = event.to_line();
        let active = self.active.read().unwrap_or_else(PoisonError::into_inner);

        let mut delivered = Vec::with_capacity(recipients.len());
        for dest in recipients {
            let Some(attachment) = active.get(&dest) else {
                trace!("{} not running, skipping {} from {}", dest, event.event_type, origin);
                continue;
            };
            match attachment.outbox.push(line.clone()) {
                Ok(Pushed::Queued) => delivered.push(dest),
                Ok(Pushed::Evicted(_)) => {
                    warn!("Queue full for {}, dropped oldest event", dest);
                    delivered.push(dest);
                }
                Err(e @ FrameError::Backpressure { .. }) => {
                    warn!("{}, dropped {} from {}", e, event.event_type, origin);
                }
                Err(e) => debug!("Skipping {}: {}", dest, e),
            }
        }

        trace!("Routed {} from {} to {:?}", event.event_type, origin, delivered);
        delivered
    }

    async fn wait_started(&self) -> bool {
        let mut started = self.started.subscribe();
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            res = started.wait_for(|s| *s) => res.is_ok(),
        }
    }
}

async fn read_loop<R>(router: Arc<Router>, tool: String, stdout: R, stats: Arc<ToolStats>)
where
    R: AsyncRead + Unpin,
{
    if !router.wait_started().await {
        return;
    }

    let mut lines = FramedRead::new(stdout, BoundedLines::new(MAX_EVENT_LENGTH));
    loop {
        let next = tokio::select! {
            _ = router.cancel.cancelled() => break,
            next = lines.next() => next,
        };
        match next {
            None => break,
            Some(Ok(BoundedLine::Line(line))) => {
                router.route(&tool, &line, &stats);
            }
            Some(Ok(BoundedLine::Overlong)) => {
                stats.record_malformed();
                let e = FrameError::MalformedEvent(format!("line longer than {} bytes", MAX_EVENT_LENGTH));
                warn!("Dropping line from {}: {}", tool, e);
            }
            Some(Err(e)) => {
                debug!("Read error on {} stdout: {}", tool, e);
                break;
            }
        }
    }
    debug!("Reader for {} finished", tool);
}

async fn write_loop<W>(outbox: Arc<Outbox>, mut stdin: W, stats: Arc<ToolStats>, cancel: CancellationToken)
where
    W: AsyncWrite + Unpin,
{
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = outbox.pop() => match line {
                Some(line) => line,
                None => break,
            },
        };

        let written = tokio::select! {
            _ = cancel.cancelled() => break,
            res = async {
                stdin.write_all(line.as_bytes()).await?;
                stdin.flush().await
            } => res,
        };

        match written {
            Ok(()) => stats.record_received(),
            Err(e) => {
                debug!("Write to {} failed: {}", outbox.tool(), e);
                outbox.close();
                break;
            }
        }
    }
    debug!("Writer for {} finished", outbox.tool());
}

async fn stderr_loop<E>(tool: String, stderr: E, stats: Arc<ToolStats>, cancel: CancellationToken)
where
    E: AsyncRead + Unpin,
{
    let mut lines = FramedRead::new(stderr, BoundedLines::new(MAX_EVENT_LENGTH));
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = lines.next() => next,
        };
        match next {
            None | Some(Err(_)) => break,
            Some(Ok(BoundedLine::Line(line))) => {
                if !line.is_empty() {
                    info!("[{}] {}", tool, line);
                }
                stats.touch();
            }
            Some(Ok(BoundedLine::Overlong)) => {
                warn!("[{}] stderr line longer than {} bytes dropped", tool, MAX_EVENT_LENGTH);
                stats.touch();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ToolDefinition;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, DuplexStream, duplex};

    type Pipes = ToolPipes<DuplexStream, DuplexStream, DuplexStream>;

    struct Endpoint {
        /// What the tool would read on its stdin
        input: DuplexStream,
        /// Where the tool would write its stdout
        output: DuplexStream,
        stats: Arc<ToolStats>,
    }

    fn endpoint(router: &Arc<Router>, name: &str, capacity: usize) -> Endpoint {
        endpoint_with(router, name, QueueSpec::new(capacity, QueuePolicy::DropNewest))
    }

    fn endpoint_with(router: &Arc<Router>, name: &str, queue: QueueSpec) -> Endpoint {
        let (stdin_router, stdin_tool) = duplex(4096);
        let (stdout_tool, stdout_router) = duplex(4096);
        let stats = Arc::new(ToolStats::new());
        let pipes: Pipes = ToolPipes {
            stdin: Some(stdin_router),
            stdout: Some(stdout_router),
            stderr: None,
        };
        router.attach(name, pipes, queue, Arc::clone(&stats));
        Endpoint {
            input: stdin_tool,
            output: stdout_tool,
            stats,
        }
    }

    fn router(defs: &[ToolDefinition]) -> Arc<Router> {
        let registry = Arc::new(SubscriptionRegistry::from_definitions(defs));
        Router::new(registry, CancellationToken::new())
    }

    async fn read_line(stream: &mut DuplexStream) -> String {
        let mut out = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut byte))
                .await
                .expect("timed out waiting for line")
                .unwrap();
            if n == 0 || byte[0] == b'\n' {
                break;
            }
            out.push(byte[0]);
        }
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn test_route_delivers_to_subscriber() {
        let router = router(&[
            ToolDefinition::new("sender", "sender"),
            ToolDefinition::new("receiver", "receiver").subscribe("MESSAGE"),
        ]);
        let sender = endpoint(&router, "sender", 8);
        let mut receiver = endpoint(&router, "receiver", 8);

        let delivered = router.route("sender", "MESSAGE|sender|hello\n", &sender.stats);
        assert_eq!(delivered, vec!["receiver"]);
        assert_eq!(read_line(&mut receiver.input).await, "MESSAGE|sender|hello");
        assert_eq!(sender.stats.events_sent(), 1);
    }

    #[tokio::test]
    async fn test_route_drops_malformed() {
        let router = router(&[ToolDefinition::new("receiver", "receiver").subscribe("*")]);
        let sender = endpoint(&router, "sender", 8);
        let _receiver = endpoint(&router, "receiver", 8);

        assert!(router.route("sender", "not an event", &sender.stats).is_empty());
        assert_eq!(sender.stats.malformed_lines(), 1);
        assert_eq!(sender.stats.events_sent(), 0);
    }

    #[tokio::test]
    async fn test_route_skips_detached_tool() {
        let router = router(&[ToolDefinition::new("receiver", "receiver").subscribe("ALERT")]);
        let sender = endpoint(&router, "sender", 8);
        let _receiver = endpoint(&router, "receiver", 8);
        router.detach("receiver");

        assert!(router.route("sender", "ALERT|sender|x", &sender.stats).is_empty());
        assert!(!router.is_attached("receiver"));
    }

    #[tokio::test]
    async fn test_route_ignores_claimed_sender() {
        let router = router(&[ToolDefinition::new("monitor", "monitor").subscribe("*")]);
        let monitor = endpoint(&router, "monitor", 8);

        // Claims to be someone else, but origin is still monitor
        let delivered = router.route("monitor", "STATUS|sender|spoof", &monitor.stats);
        assert!(delivered.is_empty());
    }

    #[tokio::test]
    async fn test_backpressure_isolated_per_destination() {
        let router = router(&[
            ToolDefinition::new("slow", "slow").subscribe("MESSAGE"),
            ToolDefinition::new("fast", "fast").subscribe("MESSAGE"),
        ]);
        let sender = endpoint(&router, "sender", 8);
        let slow = endpoint(&router, "slow", 1);
        let _fast = endpoint(&router, "fast", 100);

        // Writers do not run until this task yields, so queues only fill
        for i in 0..10 {
            let delivered = router.route("sender", &format!("MESSAGE|sender|{}", i), &sender.stats);
            if i == 0 {
                assert_eq!(delivered, vec!["fast", "slow"]);
            } else {
                assert_eq!(delivered, vec!["fast"]);
            }
        }
        assert_eq!(slow.stats.events_dropped(), 9);
        assert_eq!(router.queue_len("fast"), Some(10));
        assert_eq!(sender.stats.events_sent(), 10);
    }

    #[tokio::test]
    async fn test_drop_oldest_keeps_latest_events() {
        let router = router(&[ToolDefinition::new("lagging", "lagging").subscribe("STATUS")]);
        let sender = endpoint(&router, "sender", 8);
        let mut lagging = endpoint_with(&router, "lagging", QueueSpec::new(2, QueuePolicy::DropOldest));

        // Writers do not run until this task yields
        for i in 0..5 {
            let delivered = router.route("sender", &format!("STATUS|sender|{}", i), &sender.stats);
            assert_eq!(delivered, vec!["lagging"]);
        }
        assert_eq!(router.queue_len("lagging"), Some(2));
        assert_eq!(lagging.stats.events_dropped(), 3);

        assert_eq!(read_line(&mut lagging.input).await, "STATUS|sender|3");
        assert_eq!(read_line(&mut lagging.input).await, "STATUS|sender|4");
    }

    #[tokio::test]
    async fn test_overlong_line_dropped_and_reading_continues() {
        let router = router(&[ToolDefinition::new("receiver", "receiver").subscribe("MESSAGE")]);
        let mut sender = endpoint(&router, "sender", 8);
        let mut receiver = endpoint(&router, "receiver", 8);
        router.start();

        let flood = vec![b'x'; MAX_EVENT_LENGTH * 4];
        sender.output.write_all(&flood).await.unwrap();
        sender.output.write_all(b"\nMESSAGE|sender|after\n").await.unwrap();

        assert_eq!(read_line(&mut receiver.input).await, "MESSAGE|sender|after");
        assert_eq!(sender.stats.malformed_lines(), 1);
        assert_eq!(sender.stats.events_sent(), 1);
        router.stop();
    }

    #[tokio::test]
    async fn test_reader_waits_for_start() {
        let router = router(&[ToolDefinition::new("receiver", "receiver").subscribe("MESSAGE")]);
        let mut sender = endpoint(&router, "sender", 8);
        let mut receiver = endpoint(&router, "receiver", 8);

        sender.output.write_all(b"MESSAGE|sender|early\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sender.stats.events_sent(), 0);

        router.start();
        assert_eq!(read_line(&mut receiver.input).await, "MESSAGE|sender|early");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(receiver.stats.events_received(), 1);
        router.stop();
    }

    #[tokio::test]
    async fn test_stop_detaches_everything() {
        let router = router(&[]);
        let _a = endpoint(&router, "a", 8);
        let _b = endpoint(&router, "b", 8);
        router.start();
        assert!(router.is_running());

        router.stop();
        assert!(!router.is_running());
        assert!(!router.is_attached("a"));
        assert_eq!(router.queue_len("b"), None);
    }
}
