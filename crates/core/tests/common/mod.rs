//! Shared test helpers for core integration tests.

#![allow(dead_code)]

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use trellis_core::descriptor::{Node, NodeKind};
use trellis_core::listener::{ResultSink, TestExecutionResult};

/// One event delivered to a [`RecordingSink`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Started,
    /// Result rendered through `Display` (`SUCCESS`, `FAILURE(..)`, `ABORTED`)
    Finished(String),
    Skipped(String),
}

/// Event plus the node it was reported for
#[derive(Debug, Clone)]
pub struct Recorded {
    pub kind: NodeKind,
    pub id: String,
    pub name: String,
    pub event: Event,
}

/// Sink keeping every event in delivery order
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<Recorded>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Recorded> {
        self.events.lock().clone()
    }

    /// Events of one node kind, in delivery order
    pub fn of_kind(&self, kind: NodeKind) -> Vec<Recorded> {
        self.events()
            .into_iter()
            .filter(|e| e.kind == kind)
            .collect()
    }

    /// Terminal event per node id of the given kind
    pub fn outcomes(&self, kind: NodeKind) -> HashMap<String, Event> {
        self.of_kind(kind)
            .into_iter()
            .filter(|e| e.event != Event::Started)
            .map(|e| (e.id, e.event))
            .collect()
    }

    /// Every node got `started` exactly once, followed by exactly one terminal event
    pub fn assert_well_formed(&self) {
        let mut per_node: HashMap<String, Vec<Event>> = HashMap::new();
        for recorded in self.events() {
            per_node.entry(recorded.id).or_default().push(recorded.event);
        }
        for (id, events) in per_node {
            assert_eq!(events.len(), 2, "node {} got events {:?}", id, events);
            assert_eq!(events[0], Event::Started, "node {} not started first", id);
            assert_ne!(events[1], Event::Started, "node {} started twice", id);
        }
    }

    fn push(&self, node: Node<'_>, event: Event) {
        self.events.lock().push(Recorded {
            kind: node.kind(),
            id: node.id().to_string(),
            name: node.display_name().to_string(),
            event,
        });
    }
}

impl ResultSink for RecordingSink {
    fn started(&self, node: Node<'_>) {
        self.push(node, Event::Started);
    }

    fn finished(&self, node: Node<'_>, result: &TestExecutionResult) {
        self.push(node, Event::Finished(result.to_string()));
    }

    fn skipped(&self, node: Node<'_>, reason: &str) {
        self.push(node, Event::Skipped(reason.to_string()));
    }
}

/// Thread-safe ordered log of lifecycle calls
#[derive(Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<String>>>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: impl Into<String>) {
        self.entries.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }

    /// Entries starting with `prefix`, in order
    pub fn with_prefix(&self, prefix: &str) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|e| e.starts_with(prefix))
            .collect()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.entries.lock().iter().filter(|e| *e == entry).count()
    }
}

pub fn is_success(event: &Event) -> bool {
    matches!(event, Event::Finished(result) if result == "SUCCESS")
}

pub fn is_failure(event: &Event) -> bool {
    matches!(event, Event::Finished(result) if result.starts_with("FAILURE"))
}
