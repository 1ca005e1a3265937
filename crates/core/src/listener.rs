//! Result reporting
//!
//! Every node of the test tree is reported to a [`ResultSink`]: `started` exactly
//! once, then exactly one of `finished` or `skipped`. Skipped nodes are started
//! first as well, so a consumer can rely on a uniform open/close pairing.
//!
//! Sinks provided here:
//! - [`ChainedResultSink`] fans events out to several sinks in order
//! - [`TracingResultSink`] logs events through `tracing`
//! - [`SummarySink`] folds events into a serializable [`RunSummary`]
//! - [`SilentSink`] discards events

use crate::collector::run_guarded;
use crate::descriptor::{Node, NodeKind, NodeStatus};
use crate::errors::Failure;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Terminal outcome of an executed node
#[derive(Debug, Clone)]
pub enum TestExecutionResult {
    Success,
    /// The node failed; the cause is the first failure recorded for it
    Failure(Failure),
    /// The node was interrupted by a stop request before all its children ran
    Aborted,
}

impl TestExecutionResult {
    pub fn is_success(&self) -> bool {
        matches!(self, TestExecutionResult::Success)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, TestExecutionResult::Failure(_))
    }

    pub fn failure(&self) -> Option<&Failure> {
        match self {
            TestExecutionResult::Failure(failure) => Some(failure),
            _ => None,
        }
    }

    /// Node status corresponding to this result
    pub fn status(&self) -> NodeStatus {
        match self {
            TestExecutionResult::Success => NodeStatus::Succeeded,
            TestExecutionResult::Failure(_) => NodeStatus::Failed,
            TestExecutionResult::Aborted => NodeStatus::Aborted,
        }
    }
}

impl fmt::Display for TestExecutionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestExecutionResult::Success => f.write_str("SUCCESS"),
            TestExecutionResult::Failure(failure) => write!(f, "FAILURE({})", failure),
            TestExecutionResult::Aborted => f.write_str("ABORTED"),
        }
    }
}

/// Receiver of per-node execution events
///
/// Sinks are called from worker threads concurrently and must synchronize
/// their own state.
pub trait ResultSink: Send + Sync {
    fn started(&self, node: Node<'_>);

    fn finished(&self, node: Node<'_>, result: &TestExecutionResult);

    fn skipped(&self, node: Node<'_>, reason: &str);
}

/// Sink that forwards every event to each inner sink in order
#[derive(Clone, Default)]
pub struct ChainedResultSink {
    sinks: Vec<Arc<dyn ResultSink>>,
}

impl ChainedResultSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn push(&mut self, sink: Arc<dyn ResultSink>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl ResultSink for ChainedResultSink {
    fn started(&self, node: Node<'_>) {
        for sink in &self.sinks {
            sink.started(node);
        }
    }

    fn finished(&self, node: Node<'_>, result: &TestExecutionResult) {
        for sink in &self.sinks {
            sink.finished(node, result);
        }
    }

    fn skipped(&self, node: Node<'_>, reason: &str) {
        for sink in &self.sinks {
            sink.skipped(node, reason);
        }
    }
}

/// Sink that logs every event
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingResultSink;

impl ResultSink for TracingResultSink {
    fn started(&self, node: Node<'_>) {
        debug!("Started {} {}", node.kind(), node.id());
    }

    fn finished(&self, node: Node<'_>, result: &TestExecutionResult) {
        match result {
            TestExecutionResult::Failure(failure) => {
                warn!("Failed {} {}: {}", node.kind(), node.id(), failure)
            }
            TestExecutionResult::Aborted => info!("Aborted {} {}", node.kind(), node.id()),
            TestExecutionResult::Success => debug!("Passed {} {}", node.kind(), node.id()),
        }
    }

    fn skipped(&self, node: Node<'_>, reason: &str) {
        info!("Skipped {} {}: {}", node.kind(), node.id(), reason);
    }
}

/// Sink that discards every event
#[derive(Debug, Clone, Copy, Default)]
pub struct SilentSink;

impl ResultSink for SilentSink {
    fn started(&self, _node: Node<'_>) {}

    fn finished(&self, _node: Node<'_>, _result: &TestExecutionResult) {}

    fn skipped(&self, _node: Node<'_>, _reason: &str) {}
}

/// Event counts for one node kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub started: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub aborted: usize,
    pub skipped: usize,
}

/// A failed node in a [`RunSummary`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedNode {
    pub unique_id: String,
    pub kind: NodeKind,
    pub message: String,
}

/// Summary of one engine run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub engine: StatusCounts,
    pub classes: StatusCounts,
    pub arguments: StatusCounts,
    pub methods: StatusCounts,
    /// Failed nodes in the order they finished
    pub failures: Vec<FailedNode>,
}

impl RunSummary {
    /// Counts for a node kind
    pub fn counts(&self, kind: NodeKind) -> &StatusCounts {
        match kind {
            NodeKind::Engine => &self.engine,
            NodeKind::Class => &self.classes,
            NodeKind::Argument => &self.arguments,
            NodeKind::Method => &self.methods,
        }
    }

    fn counts_mut(&mut self, kind: NodeKind) -> &mut StatusCounts {
        match kind {
            NodeKind::Engine => &mut self.engine,
            NodeKind::Class => &mut self.classes,
            NodeKind::Argument => &mut self.arguments,
            NodeKind::Method => &mut self.methods,
        }
    }

    /// Whether nothing failed, aborted or was skipped
    pub fn all_passed(&self) -> bool {
        [&self.engine, &self.classes, &self.arguments, &self.methods]
            .iter()
            .all(|c| c.failed == 0 && c.aborted == 0 && c.skipped == 0)
    }
}

/// Sink folding events into a [`RunSummary`]
#[derive(Debug, Default)]
pub struct SummarySink {
    summary: Mutex<RunSummary>,
}

impl SummarySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the summary so far
    pub fn summary(&self) -> RunSummary {
        self.summary.lock().clone()
    }
}

impl ResultSink for SummarySink {
    fn started(&self, node: Node<'_>) {
        self.summary.lock().counts_mut(node.kind()).started += 1;
    }

    fn finished(&self, node: Node<'_>, result: &TestExecutionResult) {
        let mut summary = self.summary.lock();
        let counts = summary.counts_mut(node.kind());
        match result {
            TestExecutionResult::Success => counts.succeeded += 1,
            TestExecutionResult::Aborted => counts.aborted += 1,
            TestExecutionResult::Failure(failure) => {
                counts.failed += 1;
                summary.failures.push(FailedNode {
                    unique_id: node.id().to_string(),
                    kind: node.kind(),
                    message: failure.to_string(),
                });
            }
        }
    }

    fn skipped(&self, node: Node<'_>, _reason: &str) {
        self.summary.lock().counts_mut(node.kind()).skipped += 1;
    }
}

/// Delivers events to the run's sink and keeps node metadata in step
pub(crate) struct Notifier {
    sink: Arc<dyn ResultSink>,
}

impl Notifier {
    pub(crate) fn new(sink: Arc<dyn ResultSink>) -> Self {
        Self { sink }
    }

    pub(crate) fn started(&self, node: Node<'_>) {
        node.metadata().mark_started();
        self.deliver("started", || self.sink.started(node));
    }

    pub(crate) fn finished(&self, node: Node<'_>, result: &TestExecutionResult) {
        node.metadata().mark_finished(result.status());
        self.deliver("finished", || self.sink.finished(node, result));
    }

    pub(crate) fn skipped(&self, node: Node<'_>, reason: &str) {
        node.metadata().mark_finished(NodeStatus::Skipped);
        self.deliver("skipped", || self.sink.skipped(node, reason));
    }

    /// Report `node` and all its descendants as skipped
    pub(crate) fn skip_tree(&self, node: Node<'_>, reason: &str) {
        self.started(node);
        for child in node.children() {
            self.skip_tree(child, reason);
        }
        self.skipped(node, reason);
    }

    /// Give every node in `node`'s subtree that is still open a terminal event
    ///
    /// Running nodes finish with `result`; nodes that never started are skipped.
    pub(crate) fn close_tree(&self, node: Node<'_>, result: &TestExecutionResult, reason: &str) {
        match node.metadata().status() {
            NodeStatus::Pending => self.skip_tree(node, reason),
            NodeStatus::Running => {
                for child in node.children() {
                    self.close_tree(child, result, reason);
                }
                self.finished(node, result);
            }
            _ => {}
        }
    }

    fn deliver<F: FnOnce()>(&self, event: &str, f: F) {
        let result = run_guarded(|| {
            f();
            Ok(())
        });
        if let Err(e) = result {
            error!("Result sink failed handling {} event: {:#}", event, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Configuration;
    use crate::descriptor::{Argument, ClassDefinition, EngineDescriptor, PhaseStep};

    fn tree() -> EngineDescriptor {
        EngineDescriptor::resolve(
            vec![ClassDefinition::new("Summary")
                .arguments(vec![Argument::of("a", 1), Argument::of("b", 2)])
                .test(PhaseStep::new("t", |_| Ok(())))],
            &Configuration::new(),
        )
    }

    #[test]
    fn test_summary_counts_by_kind() {
        let root = tree();
        let sink = SummarySink::new();
        let class = root.classes()[0].node();
        let arguments = class.children();

        sink.started(root.node());
        sink.started(class);
        sink.started(arguments[0]);
        sink.finished(arguments[0], &TestExecutionResult::Success);
        sink.started(arguments[1]);
        sink.finished(
            arguments[1],
            &TestExecutionResult::Failure(Failure::phase("before_all[x]", anyhow::anyhow!("x"))),
        );
        sink.finished(class, &TestExecutionResult::Success);
        sink.finished(root.node(), &TestExecutionResult::Aborted);

        let summary = sink.summary();
        assert_eq!(summary.arguments.started, 2);
        assert_eq!(summary.arguments.succeeded, 1);
        assert_eq!(summary.arguments.failed, 1);
        assert_eq!(summary.counts(NodeKind::Engine).aborted, 1);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(
            summary.failures[0].unique_id,
            "[engine:trellis]/[class:Summary]/[argument:1]"
        );
        assert!(!summary.all_passed());

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["failures"][0]["kind"], "argument");
        assert_eq!(json["arguments"]["failed"], 1);
    }

    #[test]
    fn test_chained_sink_fans_out() {
        let first = Arc::new(SummarySink::new());
        let second = Arc::new(SummarySink::new());
        let chained = ChainedResultSink::new()
            .with(first.clone())
            .with(second.clone())
            .with(Arc::new(TracingResultSink));
        assert_eq!(chained.len(), 3);

        let root = tree();
        chained.started(root.node());
        chained.skipped(root.node(), "stopped");

        for sink in [first, second] {
            let summary = sink.summary();
            assert_eq!(summary.engine.started, 1);
            assert_eq!(summary.engine.skipped, 1);
        }
    }

    struct Panicking;

    impl ResultSink for Panicking {
        fn started(&self, _node: Node<'_>) {
            panic!("sink exploded");
        }

        fn finished(&self, _node: Node<'_>, _result: &TestExecutionResult) {}

        fn skipped(&self, _node: Node<'_>, _reason: &str) {}
    }

    #[test]
    fn test_notifier_skip_tree_and_metadata() {
        let root = tree();
        let summary = Arc::new(SummarySink::new());
        let notifier = Notifier::new(summary.clone());

        notifier.skip_tree(root.classes()[0].node(), "setup failed");

        let summary = summary.summary();
        assert_eq!(summary.classes.skipped, 1);
        assert_eq!(summary.arguments.started, 2);
        assert_eq!(summary.arguments.skipped, 2);
        assert_eq!(summary.methods.skipped, 2);
        assert_eq!(root.classes()[0].metadata().status(), NodeStatus::Skipped);

        // A panicking sink does not take the notifier down
        let notifier = Notifier::new(Arc::new(Panicking));
        notifier.started(root.node());
        assert_eq!(root.metadata().status(), NodeStatus::Running);
    }

    #[test]
    fn test_result_status_and_display() {
        let failure =
            TestExecutionResult::Failure(Failure::phase("test[t]", anyhow::anyhow!("no")));
        assert_eq!(failure.status(), NodeStatus::Failed);
        assert!(failure.is_failure());
        assert_eq!(failure.to_string(), "FAILURE(test[t] failed: no)");
        assert_eq!(TestExecutionResult::Aborted.status(), NodeStatus::Aborted);
        assert!(TestExecutionResult::Success.is_success());
    }
}
