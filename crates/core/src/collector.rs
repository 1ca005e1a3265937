//! Failure collection for lifecycle phases
//!
//! A [`FailureCollector`] runs fallible units of work (user steps and interceptor
//! hooks), catching both returned errors and panics, and records each failure in
//! order. The first recorded failure is the one reported for the node; later ones
//! are logged so they are not lost.

use crate::errors::Failure;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{trace, warn};

/// Ordered record of failures produced while executing one phase or node
#[derive(Debug, Default, Clone)]
pub struct FailureCollector {
    entries: Vec<(String, Failure)>,
}

impl FailureCollector {
    /// Create an empty collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Run a user step, recording any error or panic
    ///
    /// Returns `true` if the step succeeded.
    pub fn execute<F>(&mut self, step: &str, f: F) -> bool
    where
        F: FnOnce() -> anyhow::Result<()>,
    {
        trace!("executing {}", step);
        match run_guarded(f) {
            Ok(()) => true,
            Err(cause) => {
                self.record(step, Failure::phase(step, cause));
                false
            }
        }
    }

    /// Run an interceptor hook, recording any error or panic as a hook failure
    pub fn execute_hook<F>(&mut self, interceptor: &str, hook: &'static str, f: F) -> bool
    where
        F: FnOnce() -> anyhow::Result<()>,
    {
        match run_guarded(f) {
            Ok(()) => true,
            Err(cause) => {
                warn!("Interceptor '{}' failed in {}: {:#}", interceptor, hook, cause);
                let source = format!("{}.{}", interceptor, hook);
                self.record(&source, Failure::hook(interceptor, hook, cause));
                false
            }
        }
    }

    /// Record an already-materialized failure
    pub fn record(&mut self, source: &str, failure: Failure) {
        if let Some((first_source, _)) = self.entries.first() {
            warn!(
                "Additional failure from {} (first failure came from {}): {}",
                source, first_source, failure
            );
        }
        self.entries.push((source.to_string(), failure));
    }

    /// Whether no failure has been recorded
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The first recorded failure, if any
    pub fn first(&self) -> Option<&Failure> {
        self.entries.first().map(|(_, failure)| failure)
    }

    /// All recorded failures in order
    pub fn failures(&self) -> impl Iterator<Item = &Failure> {
        self.entries.iter().map(|(_, failure)| failure)
    }

    /// Number of recorded failures
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Forget every recorded failure
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Consume the collector, yielding the first failure
    pub fn into_first(self) -> Option<Failure> {
        self.entries.into_iter().next().map(|(_, failure)| failure)
    }

    /// Consume the collector as a phase result
    pub fn into_result(self) -> Result<(), Failure> {
        match self.into_first() {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }
}

/// Run `f`, converting a panic into an error carrying the panic message
pub(crate) fn run_guarded<F>(f: F) -> anyhow::Result<()>
where
    F: FnOnce() -> anyhow::Result<()>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(anyhow::anyhow!("panicked: {}", panic_message(&*payload))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
