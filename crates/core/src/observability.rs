//! Observability utilities for standardized tracing spans and structured fields
//!
//! Every node execution runs inside a span named after its kind, carrying the
//! node's unique id; spans nest engine > class > argument > method.

use crate::descriptor::UniqueId;
use std::time::Instant;
use tracing::{span, Span};

/// Canonical span names
pub mod spans {
    pub const ENGINE_RUN: &str = "engine.run";
    pub const CLASS_EXECUTE: &str = "class.execute";
    pub const ARGUMENT_EXECUTE: &str = "argument.execute";
    pub const METHOD_EXECUTE: &str = "method.execute";
}

/// Common field names for structured logging
pub mod fields {
    pub const UNIQUE_ID: &str = "unique_id";
    pub const CLASS_COUNT: &str = "class_count";
    pub const ARGUMENT_PARALLELISM: &str = "argument_parallelism";
    pub const DURATION_MS: &str = "duration_ms";
}

/// Start a span for a whole engine run
pub fn engine_run_span(class_count: usize, version: &str) -> Span {
    span!(
        target: "trellis_core::observability",
        tracing::Level::INFO,
        spans::ENGINE_RUN,
        duration_ms = tracing::field::Empty,
        class_count = class_count,
        version = %version
    )
}

/// Start a span for one class execution
pub fn class_span(id: &UniqueId, argument_parallelism: usize) -> Span {
    span!(
        target: "trellis_core::observability",
        tracing::Level::INFO,
        spans::CLASS_EXECUTE,
        duration_ms = tracing::field::Empty,
        unique_id = %id,
        argument_parallelism = argument_parallelism
    )
}

/// Start a span for one argument execution
pub fn argument_span(id: &UniqueId) -> Span {
    span!(
        target: "trellis_core::observability",
        tracing::Level::DEBUG,
        spans::ARGUMENT_EXECUTE,
        duration_ms = tracing::field::Empty,
        unique_id = %id
    )
}

/// Start a span for one method execution
pub fn method_span(id: &UniqueId) -> Span {
    span!(
        target: "trellis_core::observability",
        tracing::Level::DEBUG,
        spans::METHOD_EXECUTE,
        duration_ms = tracing::field::Empty,
        unique_id = %id
    )
}

/// Entered span that records its duration on completion
///
/// Holds the span entered on the current thread, so it must not live across an
/// `.await`; async code instruments its futures with the plain span instead.
pub struct TimedSpan {
    span: Span,
    start_time: Instant,
    // Keep the span entered for the lifetime of TimedSpan
    _entered: tracing::span::EnteredSpan,
}

impl TimedSpan {
    /// Create a new timed span from an existing span
    pub fn new(span: Span) -> Self {
        let entered = span.clone().entered();
        Self {
            span,
            start_time: Instant::now(),
            _entered: entered,
        }
    }

    /// Complete the span and record duration
    pub fn complete(self) {
        let duration_ms = self.start_time.elapsed().as_millis() as u64;
        self.span.record(fields::DURATION_MS, duration_ms);
    }

    /// Get the underlying span for recording additional fields
    pub fn span(&self) -> &Span {
        &self.span
    }
}
