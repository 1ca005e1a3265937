//! Integration tests for logging and the tracing result sink
//!
//! Output is written to stderr and cannot be captured here; these tests check
//! that initialization is safe to repeat and that a logged run behaves exactly
//! like a silent one.

use std::sync::Arc;
use trellis_core::descriptor::{Argument, ClassDefinition, PhaseStep};
use trellis_core::engine::Engine;
use trellis_core::listener::{ChainedResultSink, SilentSink, TracingResultSink};
use trellis_core::logging;
use trellis_core::observability::spans;

#[test]
fn test_trellis_log_environment_variable() {
    std::env::set_var(logging::LOG_ENV, "trellis_core=trace");

    let result = logging::init(None);
    assert!(result.is_ok());

    std::env::remove_var(logging::LOG_ENV);
}

#[test]
fn test_logging_initialization_safety() {
    assert!(logging::init(Some("text")).is_ok());
    assert!(logging::init(Some("json")).is_ok());
    assert!(logging::is_initialized());
}

#[test]
fn test_span_names_are_stable() {
    assert_eq!(spans::ENGINE_RUN, "engine.run");
    assert_eq!(spans::CLASS_EXECUTE, "class.execute");
    assert_eq!(spans::ARGUMENT_EXECUTE, "argument.execute");
    assert_eq!(spans::METHOD_EXECUTE, "method.execute");
}

#[test]
fn test_run_with_logging_sinks() {
    let _ = logging::init(Some("json"));

    let sinks = ChainedResultSink::new()
        .with(Arc::new(TracingResultSink))
        .with(Arc::new(SilentSink));
    let class = ClassDefinition::new("Logged")
        .argument_parallelism(2)
        .arguments([Argument::of("x", 1), Argument::of("y", 2)])
        .test(PhaseStep::new("passes", |_| Ok(())))
        .test(PhaseStep::new("fails", |_| anyhow::bail!("logged failure")));

    let report = Engine::builder()
        .result_sink(Arc::new(sinks))
        .build()
        .unwrap()
        .execute(vec![class])
        .unwrap();

    assert!(report.result.is_success());
    assert_eq!(report.summary.methods.succeeded, 2);
    assert_eq!(report.summary.methods.failed, 2);
    assert_eq!(report.summary.failures.len(), 2);
}
