//! Bounded per-destination queue
//!
//! The router pushes without ever waiting; the destination's writer task pops.
//! When the queue is full the configured `QueuePolicy` decides which event is
//! lost, and the loss is charged to this destination only.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Notify;

use crate::config::QueuePolicy;
use crate::error::{FrameError, Result};
use crate::supervisor::ToolStats;

/// Result of a successful push
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pushed {
    Queued,
    /// Queued after evicting the oldest line
    Evicted(String),
}

#[derive(Debug)]
pub struct Outbox {
    tool: String,
    capacity: usize,
    policy: QueuePolicy,
    queue: Mutex<VecDeque<String>>,
    notify: Notify,
    closed: AtomicBool,
    stats: Arc<ToolStats>,
}

impl Outbox {
    pub fn new(tool: impl Into<String>, capacity: usize, policy: QueuePolicy, stats: Arc<ToolStats>) -> Self {
        let capacity = capacity.max(1);
        Self {
            tool: tool.into(),
            capacity,
            policy,
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            stats,
        }
    }

    pub fn tool(&self) -> &str {
        &self.tool
    }

    /// Enqueue a line without blocking
    pub fn push(&self, line: String) -> Result<Pushed> {
        if self.is_closed() {
            return Err(FrameError::InvalidState(format!("Outbox for '{}' is closed", self.tool)));
        }

        let pushed = {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            if queue.len() >= self.capacity {
                match self.policy {
                    QueuePolicy::DropNewest => {
                        self.stats.record_dropped();
                        return Err(FrameError::Backpressure {
                            tool: self.tool.clone(),
                        });
                    }
                    QueuePolicy::DropOldest => {
                        let evicted = queue.pop_front().unwrap_or_default();
                        self.stats.record_dropped();
                        queue.push_back(line);
                        Pushed::Evicted(evicted)
                    }
                }
            } else {
                queue.push_back(line);
                Pushed::Queued
            }
        };

        self.notify.notify_one();
        Ok(pushed)
    }

    /// Wait for the next line. Returns `None` once closed; queued lines are
    /// discarded on close.
    pub async fn pop(&self) -> Option<String> {
        loop {
            if self.is_closed() {
                return None;
            }
            if let Some(line) = self.queue.lock().unwrap_or_else(PoisonError::into_inner).pop_front() {
                return Some(line);
            }
            self.notify.notified().await;
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Lines waiting for the writer
    pub fn queued(&self) -> usize {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
