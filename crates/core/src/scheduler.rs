//! Two-level bounded scheduling of the test tree
//!
//! Classes run in a pool bounded by the class parallelism (default 1, so classes
//! run one after another). Inside a class, arguments run in a second pool bounded
//! by that class's argument parallelism. Methods of one argument always run
//! sequentially on the argument's worker.
//!
//! Pools are semaphores: a node is submitted only once a permit is available, so
//! submission blocks while the pool is full. User code runs on blocking worker
//! threads, never on the async executor.
//!
//! A stop request (see [`StopHandle`]) stops submission of new classes and
//! arguments. Nodes already submitted finish normally; the rest are reported
//! skipped, with their argument payloads still released.

use crate::context::EngineContext;
use crate::descriptor::{ArgumentDescriptor, ClassDescriptor, EngineDescriptor};
use crate::errors::{Failure, Result, TrellisError};
use crate::interceptor::InterceptorRegistry;
use crate::lifecycle::{
    execute_argument, skip_argument, skip_class, ClassExecution, SKIP_CLASS_SETUP_FAILED,
    SKIP_EXECUTION_STOPPED, SKIP_WORKER_LOST,
};
use crate::listener::{Notifier, ResultSink, TestExecutionResult};
use crate::observability;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinError;
use tracing::{debug, error, info, instrument, warn, Instrument, Span};

/// Cloneable handle requesting a graceful stop of a run
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    requested: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop submitting new classes and arguments
    pub fn request_stop(&self) {
        if !self.requested.swap(true, Ordering::SeqCst) {
            info!("Stop requested, no further classes or arguments will be submitted");
        }
    }

    pub fn is_stop_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

/// Outcome of scheduling a tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleOutcome {
    /// Some nodes were not submitted because a stop was requested
    pub interrupted: bool,
}

fn pool_size(parallelism: usize) -> usize {
    parallelism.clamp(1, Semaphore::MAX_PERMITS)
}

fn join_error(what: &str, e: JoinError) -> TrellisError {
    error!("{} task failed: {}", what, e);
    TrellisError::Runtime(format!("{} task failed: {}", what, e))
}

/// State shared by every class task
#[derive(Clone)]
struct Workers {
    engine: Arc<EngineContext>,
    registry: Arc<InterceptorRegistry>,
    notifier: Arc<Notifier>,
    stop: StopHandle,
}

impl Workers {
    /// Run one class; returns whether a stop request interrupted it
    async fn run_class(self, class: Arc<ClassDescriptor>) -> Result<bool> {
        self.notifier.started(class.node());
        let parent = Span::current();

        let setup = {
            let engine = self.engine.clone();
            let registry = self.registry.clone();
            let class = class.clone();
            let parent = parent.clone();
            tokio::task::spawn_blocking(move || {
                let _enter = parent.enter();
                ClassExecution::begin(&engine, &registry, class)
            })
            .await
        };
        let mut execution = match setup {
            Ok(execution) => execution,
            Err(e) => return Err(self.worker_lost(&class, "Class setup", e)),
        };

        // Teardown runs even when an argument worker was lost
        let body = if execution.is_ready() {
            match self.run_arguments(&execution).await {
                Ok(interrupted) => {
                    execution.arguments_executed(interrupted);
                    Ok(interrupted)
                }
                Err(e) => {
                    execution
                        .arguments_failed(Failure::phase("arguments", anyhow::anyhow!("{}", e)));
                    Err(e)
                }
            }
        } else {
            execution.arguments_skipped();
            self.skip_arguments(class.arguments().to_vec(), SKIP_CLASS_SETUP_FAILED)
                .await
                .map(|()| false)
        };

        let notifier = self.notifier.clone();
        let teardown = tokio::task::spawn_blocking(move || {
            let _enter = parent.enter();
            execution.finish(&notifier)
        })
        .await;
        match teardown {
            Ok(result) => debug!("Class {} finished: {}", class.id(), result),
            Err(e) => return body.and(Err(self.worker_lost(&class, "Class teardown", e))),
        }
        body
    }

    /// Close the class subtree after its worker task was lost
    fn worker_lost(&self, class: &ClassDescriptor, what: &str, e: JoinError) -> TrellisError {
        let error = join_error(what, e);
        let failure =
            TestExecutionResult::Failure(Failure::phase(what, anyhow::anyhow!("{}", error)));
        self.notifier
            .close_tree(class.node(), &failure, SKIP_WORKER_LOST);
        error
    }

    async fn run_arguments(&self, execution: &ClassExecution) -> Result<bool> {
        let class = execution.class();
        let permits = Arc::new(Semaphore::new(pool_size(class.argument_parallelism())));
        let mut handles = Vec::with_capacity(class.arguments().len());
        let mut unsubmitted = Vec::new();

        for argument in class.arguments() {
            if self.stop.is_stop_requested() {
                unsubmitted.push(argument.clone());
                continue;
            }
            let permit = permits.clone().acquire_owned().await.map_err(|e| {
                TrellisError::Runtime(format!("Argument pool closed: {}", e))
            })?;
            if self.stop.is_stop_requested() {
                drop(permit);
                unsubmitted.push(argument.clone());
                continue;
            }

            let context = execution.context().clone();
            let chain = execution.chain().clone();
            let notifier = self.notifier.clone();
            let argument = argument.clone();
            let parent = Span::current();
            let handle = {
                let argument = argument.clone();
                tokio::task::spawn_blocking(move || {
                    let _permit = permit;
                    let _enter = parent.enter();
                    execute_argument(&context, &chain, &argument, &notifier)
                })
            };
            handles.push((argument, handle));
        }

        let mut first_error = None;
        for (argument, handle) in handles {
            match handle.await {
                Ok(TestExecutionResult::Failure(failure)) => {
                    debug!("Argument failed: {}", failure);
                }
                Ok(_) => {}
                Err(e) => {
                    let error = join_error("Argument", e);
                    let failure = TestExecutionResult::Failure(Failure::phase(
                        "Argument",
                        anyhow::anyhow!("{}", error),
                    ));
                    self.notifier
                        .close_tree(argument.node(), &failure, SKIP_WORKER_LOST);
                    first_error.get_or_insert(error);
                }
            }
        }

        let interrupted = !unsubmitted.is_empty();
        if interrupted {
            info!(
                "Class {}: {} arguments not submitted after stop request",
                class.id(),
                unsubmitted.len()
            );
            self.skip_arguments(unsubmitted, SKIP_EXECUTION_STOPPED)
                .await?;
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(interrupted),
        }
    }

    async fn skip_arguments(
        &self,
        arguments: Vec<Arc<ArgumentDescriptor>>,
        reason: &'static str,
    ) -> Result<()> {
        let notifier = self.notifier.clone();
        tokio::task::spawn_blocking(move || {
            for argument in &arguments {
                skip_argument(argument, &notifier, reason);
            }
        })
        .await
        .map_err(|e| join_error("Argument skip", e))
    }
}

/// Executes a resolved tree with bounded class and argument pools
pub struct Scheduler {
    class_parallelism: usize,
    workers: Workers,
}

impl Scheduler {
    /// Create a scheduler; class parallelism comes from the engine configuration
    pub fn new(
        engine: Arc<EngineContext>,
        registry: Arc<InterceptorRegistry>,
        sink: Arc<dyn ResultSink>,
    ) -> Self {
        let class_parallelism = engine.configuration().class_parallelism();
        Self {
            class_parallelism,
            workers: Workers {
                engine,
                registry,
                notifier: Arc::new(Notifier::new(sink)),
                stop: StopHandle::new(),
            },
        }
    }

    /// Override the class parallelism (values below 1 become 1)
    pub fn with_class_parallelism(mut self, class_parallelism: usize) -> Self {
        if class_parallelism < 1 {
            warn!("class parallelism [0] less than [1], defaulting to [1]");
        }
        self.class_parallelism = class_parallelism.max(1);
        self
    }

    /// Use an externally created stop handle
    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.workers.stop = stop;
        self
    }

    pub fn class_parallelism(&self) -> usize {
        self.class_parallelism
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.workers.stop.clone()
    }

    pub(crate) fn notifier(&self) -> &Arc<Notifier> {
        &self.workers.notifier
    }

    /// Execute a tree including its root node events
    pub async fn execute(&self, root: &EngineDescriptor) -> Result<TestExecutionResult> {
        self.workers.notifier.started(root.node());
        let outcome = self.schedule(root).await;
        let result = match &outcome {
            Ok(ScheduleOutcome { interrupted: true }) => TestExecutionResult::Aborted,
            Ok(_) => TestExecutionResult::Success,
            Err(e) => TestExecutionResult::Failure(crate::errors::Failure::phase(
                "schedule",
                anyhow::anyhow!("{}", e),
            )),
        };
        self.workers.notifier.finished(root.node(), &result);
        outcome.map(|_| result)
    }

    /// Execute every class of the tree; the root node itself is not reported
    #[instrument(
        level = "info",
        skip_all,
        fields(classes = root.classes().len(), class_parallelism = self.class_parallelism)
    )]
    pub async fn schedule(&self, root: &EngineDescriptor) -> Result<ScheduleOutcome> {
        info!(
            "Scheduling {} classes with class parallelism {}",
            root.classes().len(),
            self.class_parallelism
        );
        let semaphore = Arc::new(Semaphore::new(pool_size(self.class_parallelism)));
        let mut handles = Vec::with_capacity(root.classes().len());
        let mut unsubmitted = Vec::new();

        for class in root.classes() {
            if self.workers.stop.is_stop_requested() {
                unsubmitted.push(class.clone());
                continue;
            }
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| TrellisError::Runtime(format!("Class pool closed: {}", e)))?;
            if self.workers.stop.is_stop_requested() {
                drop(permit);
                unsubmitted.push(class.clone());
                continue;
            }

            let workers = self.workers.clone();
            let class = class.clone();
            let span = observability::class_span(class.id(), class.argument_parallelism());
            handles.push(tokio::spawn(
                async move {
                    let _permit = permit;
                    workers.run_class(class).await
                }
                .instrument(span),
            ));
        }

        let mut interrupted = false;
        let mut first_error = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(class_interrupted)) => interrupted |= class_interrupted,
                Ok(Err(e)) => {
                    warn!("Class execution error: {}", e);
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    let error = join_error("Class", e);
                    first_error.get_or_insert(error);
                }
            }
        }

        if !unsubmitted.is_empty() {
            interrupted = true;
            info!(
                "{} classes not submitted after stop request",
                unsubmitted.len()
            );
            let notifier = self.workers.notifier.clone();
            tokio::task::spawn_blocking(move || {
                for class in &unsubmitted {
                    skip_class(class, &notifier, SKIP_EXECUTION_STOPPED);
                }
            })
            .await
            .map_err(|e| join_error("Class skip", e))?;
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(ScheduleOutcome { interrupted }),
        }
    }
}
