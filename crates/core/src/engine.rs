//! Engine entry point
//!
//! An [`Engine`] owns everything one run needs: the engine context, the
//! interceptor registry and the scheduler. Nothing is global, so several engines
//! may run side by side in one process.
//!
//! ```no_run
//! use trellis_core::context::ArgumentContext;
//! use trellis_core::descriptor::{Argument, ClassDefinition, PhaseStep};
//! use trellis_core::engine::Engine;
//!
//! let class = ClassDefinition::new("Arithmetic")
//!     .arguments((1..=3).map(|n| Argument::of(format!("n={}", n), n)))
//!     .test(PhaseStep::new("doubles", |ctx: &ArgumentContext| {
//!         let n = ctx.payload::<i32>()?;
//!         anyhow::ensure!(*n * 2 > *n, "doubling {} did not grow", n);
//!         Ok(())
//!     }));
//!
//! let report = Engine::builder().build()?.execute(vec![class])?;
//! assert!(report.is_success());
//! # Ok::<(), trellis_core::errors::TrellisError>(())
//! ```

use crate::collector::{run_guarded, FailureCollector};
use crate::config::Configuration;
use crate::context::EngineContext;
use crate::descriptor::{check_unique, Argument, ClassDefinition, EngineDescriptor};
use crate::errors::{Result, TrellisError};
use crate::interceptor::{ClassInterceptor, EngineInterceptor, InterceptorRegistry, ON_DESTROY};
use crate::lifecycle::{skip_class, SKIP_ENGINE_SETUP_FAILED};
use crate::listener::{ChainedResultSink, ResultSink, RunSummary, SummarySink, TestExecutionResult};
use crate::observability::{self, fields};
use crate::scheduler::{ScheduleOutcome, Scheduler, StopHandle};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn, Instrument, Span};

const ON_INITIALIZE: &str = "on_initialize";
const ON_TEST_DISCOVERY: &str = "on_test_discovery";

/// Builder for an [`Engine`]
#[derive(Default)]
pub struct EngineBuilder {
    configuration: Configuration,
    class_interceptors: Vec<Arc<dyn ClassInterceptor>>,
    engine_interceptors: Vec<Arc<dyn EngineInterceptor>>,
    sinks: Vec<Arc<dyn ResultSink>>,
    class_parallelism: Option<usize>,
    stop: Option<StopHandle>,
}

impl EngineBuilder {
    pub fn configuration(mut self, configuration: Configuration) -> Self {
        self.configuration = configuration;
        self
    }

    /// Add a global class interceptor candidate
    pub fn class_interceptor(mut self, interceptor: Arc<dyn ClassInterceptor>) -> Self {
        self.class_interceptors.push(interceptor);
        self
    }

    /// Add an engine interceptor candidate
    pub fn engine_interceptor(mut self, interceptor: Arc<dyn EngineInterceptor>) -> Self {
        self.engine_interceptors.push(interceptor);
        self
    }

    /// Add a sink; sinks receive events in the order they were added
    pub fn result_sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Override the configured class parallelism
    pub fn class_parallelism(mut self, class_parallelism: usize) -> Self {
        self.class_parallelism = Some(class_parallelism);
        self
    }

    pub fn stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = Some(stop);
        self
    }

    /// Build the engine; fails on an invalid interceptor filter expression
    pub fn build(self) -> Result<Engine> {
        let registry = Arc::new(InterceptorRegistry::new(
            &self.configuration,
            self.class_interceptors,
            self.engine_interceptors,
        )?);
        let context = Arc::new(EngineContext::new(self.configuration));

        let summary = Arc::new(SummarySink::new());
        let mut chained = ChainedResultSink::new().with(summary.clone());
        for sink in self.sinks {
            chained.push(sink);
        }

        let mut scheduler = Scheduler::new(context.clone(), registry.clone(), Arc::new(chained));
        if let Some(class_parallelism) = self.class_parallelism {
            scheduler = scheduler.with_class_parallelism(class_parallelism);
        }
        if let Some(stop) = self.stop {
            scheduler = scheduler.with_stop_handle(stop);
        }

        debug!(
            "Engine built (version {}, class parallelism {})",
            context.version(),
            scheduler.class_parallelism()
        );
        Ok(Engine {
            context,
            registry,
            scheduler,
            summary,
        })
    }
}

/// Outcome of a complete run
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Result of the engine root node
    pub result: TestExecutionResult,
    pub summary: RunSummary,
    /// The resolved tree, with per-node execution metadata
    pub root: Arc<EngineDescriptor>,
}

impl RunReport {
    /// Root succeeded and no node failed
    pub fn is_success(&self) -> bool {
        self.result.is_success() && self.summary.all_passed()
    }
}

/// One engine run
pub struct Engine {
    context: Arc<EngineContext>,
    registry: Arc<InterceptorRegistry>,
    scheduler: Scheduler,
    summary: Arc<SummarySink>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.context
    }

    pub fn registry(&self) -> &Arc<InterceptorRegistry> {
        &self.registry
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.scheduler.stop_handle()
    }

    /// Run on a dedicated multi-threaded runtime, blocking until done
    pub fn execute(self, definitions: Vec<ClassDefinition>) -> Result<RunReport> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .thread_name("trellis-worker")
            .enable_all()
            .build()
            .map_err(|e| TrellisError::Runtime(format!("Failed to build runtime: {}", e)))?;
        runtime.block_on(self.run(definitions))
    }

    /// Discover, schedule and tear down a run
    ///
    /// Fails with [`TrellisError::Discovery`] before any interceptor runs or any
    /// event is reported when two classes share a type name or two tests of a
    /// class share a name.
    pub async fn run(self, definitions: Vec<ClassDefinition>) -> Result<RunReport> {
        let span = observability::engine_run_span(definitions.len(), self.context.version());
        let start = Instant::now();
        let report = self.run_in_span(definitions).instrument(span.clone()).await;
        span.record(fields::DURATION_MS, start.elapsed().as_millis() as u64);
        report
    }

    async fn run_in_span(self, definitions: Vec<ClassDefinition>) -> Result<RunReport> {
        info!("Engine run starting with {} classes", definitions.len());
        check_unique(&definitions).map_err(|e| {
            error!("Rejecting discovery input: {}", e);
            TrellisError::from(e)
        })?;

        let (definitions, setup) = {
            let context = self.context.clone();
            let registry = self.registry.clone();
            blocking("Engine setup", move || {
                let mut collector = FailureCollector::new();
                let definitions = discover(&context, &registry, definitions, &mut collector);
                (definitions, collector)
            })
            .await?
        };

        let root = Arc::new(EngineDescriptor::resolve(
            definitions,
            self.context.configuration(),
        ));
        let notifier = self.scheduler.notifier().clone();
        notifier.started(root.node());

        let scheduled = if setup.is_empty() {
            self.scheduler.schedule(&root).await
        } else {
            warn!("Engine setup failed, skipping {} classes", root.classes().len());
            let root = root.clone();
            let notifier = notifier.clone();
            blocking("Class skip", move || {
                for class in root.classes() {
                    skip_class(class, &notifier, SKIP_ENGINE_SETUP_FAILED);
                }
            })
            .await?;
            Ok(ScheduleOutcome { interrupted: false })
        };

        let destroyed = {
            let context = self.context.clone();
            let registry = self.registry.clone();
            blocking("Engine teardown", move || destroy(&context, &registry)).await?
        };

        let stopped = self.scheduler.stop_handle().is_stop_requested();
        let result = match (setup.into_first(), destroyed.into_first(), &scheduled) {
            (Some(failure), _, _) | (None, Some(failure), _) => {
                TestExecutionResult::Failure(failure)
            }
            (None, None, Err(e)) => TestExecutionResult::Failure(crate::errors::Failure::phase(
                "schedule",
                anyhow::anyhow!("{}", e),
            )),
            (None, None, Ok(outcome)) if outcome.interrupted || stopped => {
                TestExecutionResult::Aborted
            }
            (None, None, Ok(_)) => TestExecutionResult::Success,
        };
        notifier.finished(root.node(), &result);
        scheduled?;

        let summary = self.summary.summary();
        info!(
            "Engine run finished: {} ({} methods succeeded, {} failed, {} skipped)",
            result,
            summary.methods.succeeded,
            summary.methods.failed,
            summary.methods.skipped
        );
        Ok(RunReport {
            result,
            summary,
            root,
        })
    }
}

/// Run `f` on a blocking worker inside the current span
async fn blocking<T, F>(what: &'static str, f: F) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let parent = Span::current();
    tokio::task::spawn_blocking(move || {
        let _enter = parent.enter();
        f()
    })
    .await
    .map_err(|e| {
        error!("{} task failed: {}", what, e);
        TrellisError::Runtime(format!("{} task failed: {}", what, e))
    })
}

/// Initialize engine interceptors and let them adjust discovered classes
///
/// Stops at the first failure; the caller skips every class in that case.
fn discover(
    context: &EngineContext,
    registry: &InterceptorRegistry,
    mut definitions: Vec<ClassDefinition>,
    collector: &mut FailureCollector,
) -> Vec<ClassDefinition> {
    let interceptors = registry.engine_interceptors();
    for interceptor in interceptors {
        if !collector.execute_hook(interceptor.name(), ON_INITIALIZE, || {
            interceptor.on_initialize(context)
        }) {
            return definitions;
        }
    }

    'discovery: for definition in definitions.iter_mut() {
        let discovered = definition.argument_list().to_vec();
        let mut failed = false;
        for interceptor in interceptors {
            if !collector.execute_hook(interceptor.name(), ON_TEST_DISCOVERY, || {
                interceptor.on_test_discovery(context, definition)
            }) {
                failed = true;
                break;
            }
        }
        release_removed(definition, &discovered);
        if failed {
            break 'discovery;
        }
    }
    definitions
}

/// Release arguments that discovery hooks removed from a definition
fn release_removed(definition: &ClassDefinition, discovered: &[Argument]) {
    let kept = definition.argument_list();
    for argument in discovered {
        if kept.iter().any(|k| k.same_as(argument)) {
            continue;
        }
        debug!(
            "Argument [{}] of {} removed during discovery",
            argument.name(),
            definition.type_name()
        );
        if let Err(e) = run_guarded(|| argument.release()) {
            warn!(
                "Failed to release removed argument [{}] of {}: {:#}",
                argument.name(),
                definition.type_name(),
                e
            );
        }
    }
}

/// Run every engine interceptor's destroy hook in reverse order, then clear the
/// engine store
fn destroy(context: &EngineContext, registry: &InterceptorRegistry) -> FailureCollector {
    let mut collector = FailureCollector::new();
    for interceptor in registry.engine_interceptors().iter().rev() {
        collector.execute_hook(interceptor.name(), ON_DESTROY, || {
            interceptor.on_destroy(context)
        });
    }
    let release_failures = context.store().clear();
    if release_failures > 0 {
        warn!(
            "Engine store clear had {} release failures",
            release_failures
        );
    }
    collector
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::keys;
    use crate::descriptor::{Argument, NodeStatus, PhaseStep};
    use crate::errors::{ConfigError, DiscoveryError};
    use crate::store::Releasable;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recorder {
        name: &'static str,
        order: i32,
        journal: Arc<Mutex<Vec<String>>>,
        fail_initialize: bool,
    }

    impl Recorder {
        fn new(name: &'static str, order: i32, journal: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name,
                order,
                journal: journal.clone(),
                fail_initialize: false,
            }
        }
    }

    impl EngineInterceptor for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        fn order(&self) -> i32 {
            self.order
        }

        fn on_initialize(&self, _engine: &EngineContext) -> anyhow::Result<()> {
            self.journal.lock().push(format!("{}.initialize", self.name));
            anyhow::ensure!(!self.fail_initialize, "{} refused to start", self.name);
            Ok(())
        }

        fn on_test_discovery(
            &self,
            _engine: &EngineContext,
            class: &mut ClassDefinition,
        ) -> anyhow::Result<()> {
            self.journal
                .lock()
                .push(format!("{}.discovery({})", self.name, class.type_name()));
            Ok(())
        }

        fn on_destroy(&self, _engine: &EngineContext) -> anyhow::Result<()> {
            self.journal.lock().push(format!("{}.destroy", self.name));
            Ok(())
        }
    }

    fn passing_class(name: &str) -> ClassDefinition {
        ClassDefinition::new(name)
            .argument(Argument::of("only", ()))
            .test(PhaseStep::new("passes", |_| Ok(())))
    }

    #[tokio::test]
    async fn test_engine_interceptor_order() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let engine = Engine::builder()
            .engine_interceptor(Arc::new(Recorder::new("second", 2, &journal)))
            .engine_interceptor(Arc::new(Recorder::new("first", 1, &journal)))
            .build()
            .unwrap();

        let report = engine.run(vec![passing_class("A")]).await.unwrap();

        assert!(report.is_success());
        assert_eq!(
            *journal.lock(),
            vec![
                "first.initialize",
                "second.initialize",
                "first.discovery(A)",
                "second.discovery(A)",
                "second.destroy",
                "first.destroy",
            ]
        );
        assert_eq!(report.root.metadata().status(), NodeStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_initialize_failure_skips_classes() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut failing = Recorder::new("broken", 0, &journal);
        failing.fail_initialize = true;
        let engine = Engine::builder()
            .engine_interceptor(Arc::new(failing))
            .build()
            .unwrap();

        let report = engine
            .run(vec![passing_class("A"), passing_class("B")])
            .await
            .unwrap();

        assert!(report.result.is_failure());
        assert_eq!(report.summary.classes.skipped, 2);
        assert_eq!(report.summary.methods.succeeded, 0);
        // Destroy still runs
        assert_eq!(*journal.lock(), vec!["broken.initialize", "broken.destroy"]);
    }

    #[tokio::test]
    async fn test_discovery_can_trim_arguments() {
        struct KeepFirst;
        impl EngineInterceptor for KeepFirst {
            fn name(&self) -> &str {
                "keep-first"
            }

            fn on_test_discovery(
                &self,
                _engine: &EngineContext,
                class: &mut ClassDefinition,
            ) -> anyhow::Result<()> {
                class.arguments_mut().truncate(1);
                class.set_display_name("Trimmed");
                Ok(())
            }
        }

        let class = ClassDefinition::new("Wide")
            .arguments((0..5).map(|i| Argument::of(i.to_string(), i)))
            .test(PhaseStep::new("passes", |_| Ok(())));
        let report = Engine::builder()
            .engine_interceptor(Arc::new(KeepFirst))
            .build()
            .unwrap()
            .run(vec![class])
            .await
            .unwrap();

        assert_eq!(report.summary.arguments.succeeded, 1);
        assert_eq!(report.root.classes()[0].display_name(), "Trimmed");
    }

    #[tokio::test]
    async fn test_trimmed_arguments_are_released() {
        struct KeepFirst;
        impl EngineInterceptor for KeepFirst {
            fn name(&self) -> &str {
                "keep-first"
            }

            fn on_test_discovery(
                &self,
                _engine: &EngineContext,
                class: &mut ClassDefinition,
            ) -> anyhow::Result<()> {
                class.arguments_mut().truncate(1);
                Ok(())
            }
        }

        struct Counted(Arc<AtomicUsize>);
        impl Releasable for Counted {
            fn release(&self) -> anyhow::Result<()> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let releases = Arc::new(AtomicUsize::new(0));
        let class = ClassDefinition::new("Wide")
            .arguments(
                (0..3).map(|i| Argument::releasable(i.to_string(), Counted(releases.clone()))),
            )
            .test(PhaseStep::new("passes", |_| Ok(())));
        let report = Engine::builder()
            .engine_interceptor(Arc::new(KeepFirst))
            .build()
            .unwrap()
            .run(vec![class])
            .await
            .unwrap();

        assert!(report.is_success());
        assert_eq!(report.summary.arguments.succeeded, 1);
        // Two released on removal, one after its argument ran
        assert_eq!(releases.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_duplicate_ids_are_rejected() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let result = Engine::builder()
            .engine_interceptor(Arc::new(Recorder::new("recording", 0, &journal)))
            .build()
            .unwrap()
            .run(vec![passing_class("Same"), passing_class("Same")])
            .await;
        assert!(matches!(
            result,
            Err(TrellisError::Discovery(DiscoveryError::DuplicateClass { .. }))
        ));
        assert!(journal.lock().is_empty());

        let twice = ClassDefinition::new("Twice")
            .argument(Argument::of("a", ()))
            .test(PhaseStep::new("same", |_| Ok(())))
            .test(PhaseStep::new("same", |_| Ok(())));
        let result = Engine::builder().build().unwrap().run(vec![twice]).await;
        match result {
            Err(TrellisError::Discovery(DiscoveryError::DuplicateTest { type_name, name })) => {
                assert_eq!((type_name.as_str(), name.as_str()), ("Twice", "same"));
            }
            other => panic!("unexpected {:?}", other.map(|r| r.result)),
        }
    }

    #[test]
    fn test_invalid_filter_fails_build() {
        let result = Engine::builder()
            .configuration(
                Configuration::new().with(keys::CLASS_INTERCEPTORS_INCLUDE_REGEX, "(unclosed"),
            )
            .build();

        assert!(matches!(
            result,
            Err(TrellisError::Config(ConfigError::InvalidRegex { .. }))
        ));
    }

    #[test]
    fn test_execute_on_own_runtime() {
        let report = Engine::builder()
            .class_parallelism(2)
            .build()
            .unwrap()
            .execute(vec![passing_class("A"), passing_class("B")])
            .unwrap();

        assert!(report.is_success());
        assert_eq!(report.summary.classes.succeeded, 2);
    }
}
