//! Lifecycle execution of class, argument and method nodes
//!
//! Each node is driven by a [`LifecycleRunner`] through
//! `Start -> Pre* -> Body* -> Post* -> End`. The runner records the first
//! failure across its transitions; that failure (or success) is the node's
//! single terminal outcome.
//!
//! Phase protocol per node:
//!
//! - class: instantiate, prepare | arguments | conclude, on_destroy, store clear
//! - argument: before-all | methods (sequential) | after-all, store clear, release
//! - method: before-each | test | after-each
//!
//! A failing pre stage skips the body (children are reported skipped) but the post
//! stage always runs. User code and interceptor hooks never unwind out of here:
//! errors and panics become [`Failure`] values attributed to the node.

use crate::collector::FailureCollector;
use crate::context::{ArgumentContext, ClassContext, EngineContext};
use crate::descriptor::{
    ArgumentDescriptor, ClassDescriptor, MethodDescriptor, PhaseStep, UniqueId,
};
use crate::errors::Failure;
use crate::interceptor::{InterceptorChain, InterceptorRegistry};
use crate::listener::{Notifier, TestExecutionResult};
use crate::observability::{self, TimedSpan};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

/// Skip reason for descendants of a class whose instantiate/prepare failed
pub const SKIP_CLASS_SETUP_FAILED: &str = "class setup failed";
/// Skip reason for methods of an argument whose before-all failed
pub const SKIP_BEFORE_ALL_FAILED: &str = "before-all failed";
/// Skip reason for nodes not submitted after a stop request
pub const SKIP_EXECUTION_STOPPED: &str = "execution stopped";
/// Skip reason for every class when engine interceptors failed to set up the run
pub const SKIP_ENGINE_SETUP_FAILED: &str = "engine setup failed";
/// Skip reason for nodes whose worker task was lost
pub const SKIP_WORKER_LOST: &str = "worker lost";

/// Lifecycle phases, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Instantiate,
    Prepare,
    BeforeAll,
    BeforeEach,
    Test,
    AfterEach,
    AfterAll,
    Conclude,
}

impl Phase {
    /// Get the phase name as string
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Instantiate => "instantiate",
            Phase::Prepare => "prepare",
            Phase::BeforeAll => "before_all",
            Phase::BeforeEach => "before_each",
            Phase::Test => "test",
            Phase::AfterEach => "after_each",
            Phase::AfterAll => "after_all",
            Phase::Conclude => "conclude",
        }
    }

    /// Name of the interceptor hook running before this phase
    pub fn pre_hook(&self) -> &'static str {
        match self {
            Phase::Instantiate => "pre_instantiate",
            Phase::Prepare => "pre_prepare",
            Phase::BeforeAll => "pre_before_all",
            Phase::BeforeEach => "pre_before_each",
            Phase::Test => "pre_test",
            Phase::AfterEach => "pre_after_each",
            Phase::AfterAll => "pre_after_all",
            Phase::Conclude => "pre_conclude",
        }
    }

    /// Name of the interceptor hook running after this phase
    pub fn post_hook(&self) -> &'static str {
        match self {
            Phase::Instantiate => "post_instantiate",
            Phase::Prepare => "post_prepare",
            Phase::BeforeAll => "post_before_all",
            Phase::BeforeEach => "post_before_each",
            Phase::Test => "post_test",
            Phase::AfterEach => "post_after_each",
            Phase::AfterAll => "post_after_all",
            Phase::Conclude => "post_conclude",
        }
    }

    /// All phases in execution order
    pub fn all() -> &'static [Phase] {
        &[
            Phase::Instantiate,
            Phase::Prepare,
            Phase::BeforeAll,
            Phase::BeforeEach,
            Phase::Test,
            Phase::AfterEach,
            Phase::AfterAll,
            Phase::Conclude,
        ]
    }
}

/// State of a [`LifecycleRunner`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerState {
    Start,
    PreSuccess,
    PreFailure,
    BodySuccess,
    BodyFailure,
    BodySkipped,
    PostSuccess,
    PostFailure,
    End,
}

/// State machine driving one node to a single terminal outcome
#[derive(Debug)]
pub struct LifecycleRunner {
    node: String,
    state: RunnerState,
    collector: FailureCollector,
    aborted: bool,
}

impl LifecycleRunner {
    pub fn new(node: &UniqueId) -> Self {
        Self {
            node: node.to_string(),
            state: RunnerState::Start,
            collector: FailureCollector::new(),
            aborted: false,
        }
    }

    pub fn state(&self) -> RunnerState {
        self.state
    }

    /// Record the pre stage; returns whether the body may run
    pub fn pre(&mut self, result: Result<(), Failure>) -> bool {
        let next = if result.is_ok() {
            RunnerState::PreSuccess
        } else {
            RunnerState::PreFailure
        };
        self.transition(&[RunnerState::Start], next, result);
        self.state == RunnerState::PreSuccess
    }

    /// Record the body stage
    pub fn body(&mut self, result: Result<(), Failure>) {
        let next = if result.is_ok() {
            RunnerState::BodySuccess
        } else {
            RunnerState::BodyFailure
        };
        self.transition(&[RunnerState::PreSuccess], next, result);
    }

    /// Record that the body did not run
    pub fn skip_body(&mut self) {
        self.transition(
            &[RunnerState::PreSuccess, RunnerState::PreFailure],
            RunnerState::BodySkipped,
            Ok(()),
        );
    }

    /// Record the post stage
    pub fn post(&mut self, result: Result<(), Failure>) {
        let next = if result.is_ok() {
            RunnerState::PostSuccess
        } else {
            RunnerState::PostFailure
        };
        self.transition(
            &[
                RunnerState::BodySuccess,
                RunnerState::BodyFailure,
                RunnerState::BodySkipped,
            ],
            next,
            result,
        );
    }

    /// Mark the node as interrupted by a stop request
    pub fn abort(&mut self) {
        self.aborted = true;
    }

    /// Finish the node (state `End`): the first recorded failure, else aborted,
    /// else success
    pub fn finish(self) -> TestExecutionResult {
        if self.state != RunnerState::PostSuccess && self.state != RunnerState::PostFailure {
            error!(
                "Lifecycle of {} finished from state {:?}",
                self.node, self.state
            );
        }
        trace!("{}: {:?} -> {:?}", self.node, self.state, RunnerState::End);
        match self.collector.into_first() {
            Some(failure) => TestExecutionResult::Failure(failure),
            None if self.aborted => TestExecutionResult::Aborted,
            None => TestExecutionResult::Success,
        }
    }

    fn transition(&mut self, from: &[RunnerState], to: RunnerState, result: Result<(), Failure>) {
        if !from.contains(&self.state) {
            error!(
                "Invalid lifecycle transition for {}: {:?} -> {:?}",
                self.node, self.state, to
            );
        }
        trace!("{}: {:?} -> {:?}", self.node, self.state, to);
        if let Err(failure) = result {
            self.collector.record(&self.node, failure);
        }
        self.state = to;
    }
}

/// Run user steps in order, stopping after the first failure
pub(crate) fn run_steps<C>(
    collector: &mut FailureCollector,
    phase: Phase,
    steps: &[PhaseStep<C>],
    context: &C,
) {
    for step in steps {
        let label = format!("{}[{}]", phase.as_str(), step.name());
        if !collector.execute(&label, || step.invoke(context)) {
            break;
        }
    }
}

/// One class execution, from instantiation through destruction
pub(crate) struct ClassExecution {
    class: Arc<ClassDescriptor>,
    context: Arc<ClassContext>,
    chain: InterceptorChain,
    runner: LifecycleRunner,
}

impl ClassExecution {
    /// Instantiate the test object and run the prepare phase
    pub(crate) fn begin(
        engine: &Arc<EngineContext>,
        registry: &InterceptorRegistry,
        class: Arc<ClassDescriptor>,
    ) -> Self {
        let context = Arc::new(ClassContext::new(engine.clone(), &class));
        let chain = registry.chain(class.type_name());
        let mut runner = LifecycleRunner::new(class.id());
        debug!(
            "Class {} interceptor chain: {:?}",
            class.id(),
            chain.names()
        );

        let instantiated = chain.run_phase(
            Phase::Instantiate,
            |i| i.pre_instantiate(engine, &class),
            |collector| {
                let created = collector.execute(Phase::Instantiate.as_str(), || {
                    let instance = class.instantiate(engine)?;
                    context.set_instance(Ok(instance));
                    Ok(())
                });
                if !created {
                    let message = collector
                        .first()
                        .map(|failure| failure.cause().to_string())
                        .unwrap_or_default();
                    context.set_instance(Err(message));
                }
            },
            |i, failure| i.post_instantiate(&context, failure),
        );

        let setup = match instantiated {
            Ok(()) if context.is_instantiated() => chain.run_phase(
                Phase::Prepare,
                |i| i.pre_prepare(&context),
                |collector| run_steps(collector, Phase::Prepare, class.prepare_steps(), &*context),
                |i, failure| i.post_prepare(&context, failure),
            ),
            Ok(()) => Err(Failure::phase(
                Phase::Instantiate.as_str(),
                anyhow::anyhow!("test instance was not created"),
            )),
            Err(failure) => Err(failure),
        };
        if let Err(failure) = &setup {
            warn!("Class {} setup failed: {}", class.id(), failure);
        }
        runner.pre(setup);

        Self {
            class,
            context,
            chain,
            runner,
        }
    }

    /// Whether instantiation and prepare succeeded
    pub(crate) fn is_ready(&self) -> bool {
        self.runner.state() == RunnerState::PreSuccess
    }

    pub(crate) fn class(&self) -> &Arc<ClassDescriptor> {
        &self.class
    }

    pub(crate) fn context(&self) -> &Arc<ClassContext> {
        &self.context
    }

    pub(crate) fn chain(&self) -> &InterceptorChain {
        &self.chain
    }

    /// Arguments ran; `interrupted` when a stop request left some unsubmitted
    pub(crate) fn arguments_executed(&mut self, interrupted: bool) {
        self.runner.body(Ok(()));
        if interrupted {
            self.runner.abort();
        }
    }

    pub(crate) fn arguments_failed(&mut self, failure: Failure) {
        self.runner.body(Err(failure));
    }

    pub(crate) fn arguments_skipped(&mut self) {
        self.runner.skip_body();
    }

    /// Conclude, destroy and report the class
    pub(crate) fn finish(mut self, notifier: &Notifier) -> TestExecutionResult {
        let context = &self.context;
        let concluded = if context.is_instantiated() {
            self.chain.run_phase(
                Phase::Conclude,
                |i| i.pre_conclude(context),
                |collector| {
                    run_steps(collector, Phase::Conclude, self.class.conclude_steps(), &**context)
                },
                |i, failure| i.post_conclude(context, failure),
            )
        } else {
            Ok(())
        };

        let destroyed = self.chain.destroy(context);
        let release_failures = context.store().clear();
        if release_failures > 0 {
            warn!(
                "Class {} store clear had {} release failures",
                self.class.id(),
                release_failures
            );
        }

        self.runner.post(concluded.and(destroyed));
        let result = self.runner.finish();
        notifier.finished(self.class.node(), &result);
        result
    }
}

/// Execute one argument: before-all, its methods, after-all, teardown
pub(crate) fn execute_argument(
    class_context: &Arc<ClassContext>,
    chain: &InterceptorChain,
    argument: &ArgumentDescriptor,
    notifier: &Notifier,
) -> TestExecutionResult {
    let timed = TimedSpan::new(observability::argument_span(argument.id()));

    notifier.started(argument.node());
    let context = ArgumentContext::new(class_context.clone());
    context.bind(argument.index(), argument.argument().clone());
    let mut runner = LifecycleRunner::new(argument.id());

    let before_all = chain.run_phase(
        Phase::BeforeAll,
        |i| i.pre_before_all(&context),
        |collector| {
            run_steps(
                collector,
                Phase::BeforeAll,
                argument.before_all_steps(),
                &context,
            )
        },
        |i, failure| i.post_before_all(&context, failure),
    );

    if runner.pre(before_all) {
        for method in argument.methods() {
            execute_method(chain, &context, method, notifier);
        }
        runner.body(Ok(()));
    } else {
        for method in argument.methods() {
            notifier.skip_tree(method.node(), SKIP_BEFORE_ALL_FAILED);
        }
        runner.skip_body();
    }

    let after_all = chain.run_phase(
        Phase::AfterAll,
        |i| i.pre_after_all(&context),
        |collector| {
            run_steps(
                collector,
                Phase::AfterAll,
                argument.after_all_steps(),
                &context,
            )
        },
        |i, failure| i.post_after_all(&context, failure),
    );
    runner.post(after_all);

    teardown_argument(&context, argument);
    let result = runner.finish();
    notifier.finished(argument.node(), &result);
    timed.complete();
    result
}

fn teardown_argument(context: &ArgumentContext, argument: &ArgumentDescriptor) {
    let release_failures = context.store().clear();
    if release_failures > 0 {
        warn!(
            "Argument {} store clear had {} release failures",
            argument.id(),
            release_failures
        );
    }
    release_argument(argument);
}

fn release_argument(argument: &ArgumentDescriptor) {
    if let Err(e) = crate::collector::run_guarded(|| argument.argument().release()) {
        warn!("Failed to release argument {}: {:#}", argument.id(), e);
    }
}

/// Execute one method: before-each, test, after-each
pub(crate) fn execute_method(
    chain: &InterceptorChain,
    context: &ArgumentContext,
    method: &MethodDescriptor,
    notifier: &Notifier,
) -> TestExecutionResult {
    let timed = TimedSpan::new(observability::method_span(method.id()));

    notifier.started(method.node());
    let mut runner = LifecycleRunner::new(method.id());

    let before_each = chain.run_phase(
        Phase::BeforeEach,
        |i| i.pre_before_each(context, method),
        |collector| {
            run_steps(
                collector,
                Phase::BeforeEach,
                method.before_each_steps(),
                context,
            )
        },
        |i, failure| i.post_before_each(context, method, failure),
    );

    if runner.pre(before_each) {
        let tested = chain.run_phase(
            Phase::Test,
            |i| i.pre_test(context, method),
            |collector| {
                run_steps(
                    collector,
                    Phase::Test,
                    std::slice::from_ref(method.test_step()),
                    context,
                )
            },
            |i, failure| i.post_test(context, method, failure),
        );
        runner.body(tested);
    } else {
        runner.skip_body();
    }

    let after_each = chain.run_phase(
        Phase::AfterEach,
        |i| i.pre_after_each(context, method),
        |collector| {
            run_steps(
                collector,
                Phase::AfterEach,
                method.after_each_steps(),
                context,
            )
        },
        |i, failure| i.post_after_each(context, method, failure),
    );
    runner.post(after_each);

    let result = runner.finish();
    notifier.finished(method.node(), &result);
    timed.complete();
    result
}

/// Report an argument and its methods skipped, still releasing its payload
pub(crate) fn skip_argument(argument: &ArgumentDescriptor, notifier: &Notifier, reason: &str) {
    notifier.started(argument.node());
    for method in argument.methods() {
        notifier.skip_tree(method.node(), reason);
    }
    release_argument(argument);
    notifier.skipped(argument.node(), reason);
}

/// Report a class and everything beneath it skipped, releasing argument payloads
pub(crate) fn skip_class(class: &ClassDescriptor, notifier: &Notifier, reason: &str) {
    notifier.started(class.node());
    for argument in class.arguments() {
        skip_argument(argument, notifier, reason);
    }
    notifier.skipped(class.node(), reason);
}
