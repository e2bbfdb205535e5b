//! Subscription Registry
//!
//! Maps event type to the set of tool names that receive it. Readers take an
//! `Arc` snapshot of the whole table; writers clone, modify and swap it, so a
//! reader sees either the old table or the new one, never a mix.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use log::debug;

use crate::config::{ToolDefinition, WILDCARD};

/// Immutable subscription table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionTable {
    by_type: HashMap<String, BTreeSet<String>>,
    wildcard: BTreeSet<String>,
}

impl SubscriptionTable {
    /// Build a table from tool definitions
    pub fn from_definitions(defs: &[ToolDefinition]) -> Self {
        let mut table = Self::default();
        for def in defs {
            for event_type in &def.subscriptions {
                table.insert(&def.name, event_type);
            }
        }
        table
    }

    fn insert(&mut self, tool: &str, event_type: &str) -> bool {
        if event_type == WILDCARD {
            self.wildcard.insert(tool.to_string())
        } else {
            self.by_type
                .entry(event_type.to_string())
                .or_default()
                .insert(tool.to_string())
        }
    }

    fn remove(&mut self, tool: &str, event_type: &str) -> bool {
        if event_type == WILDCARD {
            return self.wildcard.remove(tool);
        }
        let Some(set) = self.by_type.get_mut(event_type) else {
            return false;
        };
        let removed = set.remove(tool);
        if set.is_empty() {
            self.by_type.remove(event_type);
        }
        removed
    }

    /// Every tool subscribed to `event_type`, directly or via wildcard
    pub fn subscribers_of(&self, event_type: &str) -> BTreeSet<String> {
        let mut out = self.wildcard.clone();
        if let Some(direct) = self.by_type.get(event_type) {
            out.extend(direct.iter().cloned());
        }
        out
    }

    /// Whether `tool` named `event_type` itself, not just through `*`
    pub fn is_direct(&self, tool: &str, event_type: &str) -> bool {
        self.by_type.get(event_type).is_some_and(|set| set.contains(tool))
    }

    /// Destinations for an event from `origin`.
    ///
    /// The origin is excluded unless it is directly subscribed to the type;
    /// a wildcard subscription never loops an event back to its source.
    pub fn recipients(&self, event_type: &str, origin: &str) -> Vec<String> {
        self.subscribers_of(event_type)
            .into_iter()
            .filter(|tool| tool != origin || self.is_direct(origin, event_type))
            .collect()
    }

    /// Event types a tool is subscribed to, wildcard included
    pub fn subscriptions_of(&self, tool: &str) -> BTreeSet<String> {
        let mut out: BTreeSet<String> = self
            .by_type
            .iter()
            .filter(|(_, tools)| tools.contains(tool))
            .map(|(event_type, _)| event_type.clone())
            .collect();
        if self.wildcard.contains(tool) {
            out.insert(WILDCARD.to_string());
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty() && self.wildcard.is_empty()
    }
}

/// Lock-protected owner of the current `SubscriptionTable`
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    table: RwLock<Arc<SubscriptionTable>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded from tool definitions
    pub fn from_definitions(defs: &[ToolDefinition]) -> Self {
        let registry = Self::new();
        registry.load(defs);
        registry
    }

    /// Replace the whole table with one built from `defs`
    pub fn load(&self, defs: &[ToolDefinition]) {
        let table = SubscriptionTable::from_definitions(defs);
        *self.table.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(table);
        debug!("Loaded subscriptions for {} tools", defs.len());
    }

    /// Current table; stays valid while the registry is mutated
    pub fn snapshot(&self) -> Arc<SubscriptionTable> {
        Arc::clone(&self.table.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Add a subscription. Returns false if it already existed.
    pub fn subscribe(&self, tool: &str, event_type: &str) -> bool {
        self.update(|table| table.insert(tool, event_type))
    }

    /// Remove a subscription. Returns false if it did not exist.
    pub fn unsubscribe(&self, tool: &str, event_type: &str) -> bool {
        self.update(|table| table.remove(tool, event_type))
    }

    pub fn subscribers_of(&self, event_type: &str) -> BTreeSet<String> {
        self.snapshot().subscribers_of(event_type)
    }

    pub fn subscriptions_of(&self, tool: &str) -> BTreeSet<String> {
        self.snapshot().subscriptions_of(tool)
    }

    fn update<F>(&self, f: F) -> bool
    where
        F: FnOnce(&mut SubscriptionTable) -> bool,
    {
        let mut guard = self.table.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = SubscriptionTable::clone(&guard);
        let changed = f(&mut next);
        if changed {
            *guard = Arc::new(next);
        }
        changed
    }
}
