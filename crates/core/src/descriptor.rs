//! Test tree: discovery input and the resolved descriptor tree
//!
//! Discovery hands the engine one [`ClassDefinition`] per test class. Definitions
//! are mutable until scheduling starts (engine interceptors may reorder or trim
//! their arguments), then resolve into an immutable tree:
//!
//! ```text
//! EngineDescriptor
//! └── ClassDescriptor            prepare / conclude
//!     └── ArgumentDescriptor     before-all / after-all (one per argument)
//!         └── MethodDescriptor   before-each / test / after-each (ascending order)
//! ```
//!
//! Only [`ExecutionMetadata`] changes once a tree is resolved.

use crate::config::{clamp_parallelism, Configuration};
use crate::context::{ArgumentContext, ClassContext, EngineContext};
use crate::errors::DiscoveryError;
use crate::lifecycle::Phase;
use crate::store::Releasable;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Display name and unique id segment of the engine root
pub const ENGINE_NAME: &str = "trellis";

/// Kind of a node in the test tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Engine,
    Class,
    Argument,
    Method,
}

impl NodeKind {
    /// Get the kind name as string
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Engine => "engine",
            NodeKind::Class => "class",
            NodeKind::Argument => "argument",
            NodeKind::Method => "method",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable node identifier: the path of `(kind, value)` segments from the root
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UniqueId {
    segments: Vec<(NodeKind, String)>,
}

impl UniqueId {
    /// Identifier of the engine root
    pub fn engine() -> Self {
        Self {
            segments: vec![(NodeKind::Engine, ENGINE_NAME.to_string())],
        }
    }

    /// Identifier of a child node
    pub fn child(&self, kind: NodeKind, value: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push((kind, value.into()));
        Self { segments }
    }

    /// Path segments from the root
    pub fn segments(&self) -> &[(NodeKind, String)] {
        &self.segments
    }

    /// Kind of the last segment
    pub fn kind(&self) -> NodeKind {
        self.segments
            .last()
            .map(|(kind, _)| *kind)
            .unwrap_or(NodeKind::Engine)
    }
}

impl fmt::Display for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (kind, value)) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            write!(f, "[{}:{}]", kind, value)?;
        }
        Ok(())
    }
}

type StepFn<C> = dyn Fn(&C) -> anyhow::Result<()> + Send + Sync;

/// One callable lifecycle or test step, resolved at discovery time
///
/// Steps within a phase run in ascending `order`, ties broken by declaration order.
pub struct PhaseStep<C> {
    name: String,
    order: i32,
    call: Arc<StepFn<C>>,
}

impl<C> PhaseStep<C> {
    /// Create a step with the default order (0)
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&C) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            order: 0,
            call: Arc::new(f),
        }
    }

    /// Set the explicit order value
    pub fn order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    /// Step name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Explicit order value
    pub fn explicit_order(&self) -> i32 {
        self.order
    }

    /// Invoke the step against its context
    pub fn invoke(&self, context: &C) -> anyhow::Result<()> {
        (self.call)(context)
    }
}

impl<C> Clone for PhaseStep<C> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            order: self.order,
            call: self.call.clone(),
        }
    }
}

impl<C> fmt::Debug for PhaseStep<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhaseStep")
            .field("name", &self.name)
            .field("order", &self.order)
            .finish()
    }
}

fn sort_steps<C>(mut steps: Vec<PhaseStep<C>>) -> Vec<PhaseStep<C>> {
    // Vec::sort_by_key is stable, so declaration order breaks ties
    steps.sort_by_key(|step| step.order);
    steps
}

struct ArgumentInner {
    name: String,
    payload: Arc<dyn Any + Send + Sync>,
    releasable: Option<Arc<dyn Releasable>>,
    released: AtomicBool,
}

/// One parameter value driving a run of a class's argument lifecycle
#[derive(Clone)]
pub struct Argument {
    inner: Arc<ArgumentInner>,
}

impl Argument {
    /// Create an argument with an opaque payload
    pub fn of<T: Any + Send + Sync>(name: impl Into<String>, payload: T) -> Self {
        Self {
            inner: Arc::new(ArgumentInner {
                name: name.into(),
                payload: Arc::new(payload),
                releasable: None,
                released: AtomicBool::new(false),
            }),
        }
    }

    /// Create an argument whose payload is released when the argument node ends
    pub fn releasable<T: Releasable + Any>(name: impl Into<String>, payload: T) -> Self {
        let payload = Arc::new(payload);
        Self {
            inner: Arc::new(ArgumentInner {
                name: name.into(),
                payload: payload.clone(),
                releasable: Some(payload),
                released: AtomicBool::new(false),
            }),
        }
    }

    /// Display name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Typed payload, `None` when the payload is of another type
    pub fn payload<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.inner.payload.clone().downcast::<T>().ok()
    }

    /// Whether the payload exposes the releasable capability
    pub fn is_releasable(&self) -> bool {
        self.inner.releasable.is_some()
    }

    /// Whether the payload has been released
    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::SeqCst)
    }

    /// Whether both handles refer to the same argument
    pub fn same_as(&self, other: &Argument) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Release the payload; subsequent calls are no-ops
    pub fn release(&self) -> anyhow::Result<()> {
        let Some(releasable) = &self.inner.releasable else {
            return Ok(());
        };
        if self.inner.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        trace!("releasing argument [{}]", self.inner.name);
        releasable.release()
    }
}

impl fmt::Debug for Argument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Argument")
            .field("name", &self.inner.name)
            .field("releasable", &self.is_releasable())
            .finish()
    }
}

/// Creates the single test instance of a class execution
pub type Instantiator =
    Arc<dyn Fn(&EngineContext) -> anyhow::Result<Arc<dyn Any + Send + Sync>> + Send + Sync>;

fn unit_instantiator() -> Instantiator {
    Arc::new(|_: &EngineContext| {
        let instance: Arc<dyn Any + Send + Sync> = Arc::new(());
        Ok(instance)
    })
}

/// Mutable description of one test class as produced by discovery
pub struct ClassDefinition {
    type_name: String,
    display_name: Option<String>,
    argument_parallelism: Option<i64>,
    instantiator: Option<Instantiator>,
    arguments: Vec<Argument>,
    prepare: Vec<PhaseStep<ClassContext>>,
    before_all: Vec<PhaseStep<ArgumentContext>>,
    before_each: Vec<PhaseStep<ArgumentContext>>,
    tests: Vec<PhaseStep<ArgumentContext>>,
    after_each: Vec<PhaseStep<ArgumentContext>>,
    after_all: Vec<PhaseStep<ArgumentContext>>,
    conclude: Vec<PhaseStep<ClassContext>>,
}

impl ClassDefinition {
    /// Create an empty definition for the given declaring type
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            display_name: None,
            argument_parallelism: None,
            instantiator: None,
            arguments: Vec::new(),
            prepare: Vec::new(),
            before_all: Vec::new(),
            before_each: Vec::new(),
            tests: Vec::new(),
            after_each: Vec::new(),
            after_all: Vec::new(),
            conclude: Vec::new(),
        }
    }

    pub fn display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    pub fn argument_parallelism(mut self, parallelism: i64) -> Self {
        self.argument_parallelism = Some(parallelism);
        self
    }

    /// Set the function creating the test instance
    ///
    /// Without one, the instance is the unit value.
    pub fn instantiate<T, F>(mut self, f: F) -> Self
    where
        T: Any + Send + Sync,
        F: Fn(&EngineContext) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.instantiator = Some(Arc::new(move |engine: &EngineContext| {
            let instance: Arc<dyn Any + Send + Sync> = Arc::new(f(engine)?);
            Ok(instance)
        }));
        self
    }

    pub fn argument(mut self, argument: Argument) -> Self {
        self.arguments.push(argument);
        self
    }

    pub fn arguments(mut self, arguments: impl IntoIterator<Item = Argument>) -> Self {
        self.arguments.extend(arguments);
        self
    }

    pub fn prepare(mut self, step: PhaseStep<ClassContext>) -> Self {
        self.prepare.push(step);
        self
    }

    pub fn before_all(mut self, step: PhaseStep<ArgumentContext>) -> Self {
        self.before_all.push(step);
        self
    }

    pub fn before_each(mut self, step: PhaseStep<ArgumentContext>) -> Self {
        self.before_each.push(step);
        self
    }

    pub fn test(mut self, step: PhaseStep<ArgumentContext>) -> Self {
        self.tests.push(step);
        self
    }

    pub fn after_each(mut self, step: PhaseStep<ArgumentContext>) -> Self {
        self.after_each.push(step);
        self
    }

    pub fn after_all(mut self, step: PhaseStep<ArgumentContext>) -> Self {
        self.after_all.push(step);
        self
    }

    pub fn conclude(mut self, step: PhaseStep<ClassContext>) -> Self {
        self.conclude.push(step);
        self
    }

    /// Declaring type name
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Effective display name (the type name unless overridden)
    pub fn name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.type_name)
    }

    pub fn set_display_name(&mut self, display_name: impl Into<String>) {
        self.display_name = Some(display_name.into());
    }

    /// Declared argument parallelism, if any
    pub fn declared_argument_parallelism(&self) -> Option<i64> {
        self.argument_parallelism
    }

    pub fn set_argument_parallelism(&mut self, parallelism: Option<i64>) {
        self.argument_parallelism = parallelism;
    }

    /// Arguments in discovery order
    pub fn argument_list(&self) -> &[Argument] {
        &self.arguments
    }

    /// Mutable access to the arguments, for reordering or trimming before scheduling
    pub fn arguments_mut(&mut self) -> &mut Vec<Argument> {
        &mut self.arguments
    }

    /// Resolve into an immutable class descriptor
    pub(crate) fn resolve(
        self,
        parent: &UniqueId,
        default_parallelism: Option<i64>,
    ) -> ClassDescriptor {
        let id = parent.child(NodeKind::Class, self.type_name.clone());
        let display_name = self
            .display_name
            .unwrap_or_else(|| self.type_name.clone());
        let argument_parallelism = self
            .argument_parallelism
            .or(default_parallelism)
            .map(|value| clamp_parallelism("argument", value))
            .unwrap_or(1);
        let type_name: Arc<str> = Arc::from(self.type_name);

        let before_all: Arc<[PhaseStep<ArgumentContext>]> = sort_steps(self.before_all).into();
        let after_all: Arc<[PhaseStep<ArgumentContext>]> = sort_steps(self.after_all).into();
        let before_each: Arc<[PhaseStep<ArgumentContext>]> = sort_steps(self.before_each).into();
        let after_each: Arc<[PhaseStep<ArgumentContext>]> = sort_steps(self.after_each).into();
        let tests = sort_steps(self.tests);

        let arguments = self
            .arguments
            .into_iter()
            .enumerate()
            .map(|(index, argument)| {
                let argument_id = id.child(NodeKind::Argument, index.to_string());
                let methods = tests
                    .iter()
                    .map(|test| {
                        Arc::new(MethodDescriptor {
                            id: argument_id.child(NodeKind::Method, test.name()),
                            type_name: type_name.clone(),
                            test: test.clone(),
                            before_each: before_each.clone(),
                            after_each: after_each.clone(),
                            metadata: ExecutionMetadata::default(),
                        })
                    })
                    .collect();
                Arc::new(ArgumentDescriptor {
                    id: argument_id,
                    type_name: type_name.clone(),
                    index,
                    argument,
                    before_all: before_all.clone(),
                    after_all: after_all.clone(),
                    methods,
                    metadata: ExecutionMetadata::default(),
                })
            })
            .collect::<Vec<_>>();

        debug!(
            "Resolved class {} with {} arguments, {} tests, argument parallelism {}",
            id,
            arguments.len(),
            tests.len(),
            argument_parallelism
        );

        let instantiator = self.instantiator.unwrap_or_else(unit_instantiator);

        ClassDescriptor {
            id,
            type_name,
            display_name,
            argument_parallelism,
            instantiator,
            prepare: sort_steps(self.prepare),
            conclude: sort_steps(self.conclude),
            arguments,
            metadata: ExecutionMetadata::default(),
        }
    }
}

impl fmt::Debug for ClassDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassDefinition")
            .field("type_name", &self.type_name)
            .field("display_name", &self.display_name)
            .field("argument_parallelism", &self.argument_parallelism)
            .field("arguments", &self.arguments)
            .field("tests", &self.tests)
            .finish_non_exhaustive()
    }
}

/// Execution status of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Not yet started
    #[default]
    Pending,
    /// Started, not yet finished
    Running,
    Succeeded,
    Failed,
    Aborted,
    Skipped,
}

impl NodeStatus {
    /// Get the status as string
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Running => "running",
            NodeStatus::Succeeded => "succeeded",
            NodeStatus::Failed => "failed",
            NodeStatus::Aborted => "aborted",
            NodeStatus::Skipped => "skipped",
        }
    }
}

/// Snapshot of a node's execution metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub status: NodeStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}

/// The only mutable part of a resolved node
#[derive(Debug, Default)]
pub struct ExecutionMetadata {
    state: Mutex<(ExecutionRecord, Option<Instant>)>,
}

impl ExecutionMetadata {
    pub(crate) fn mark_started(&self) {
        let mut state = self.state.lock();
        state.0.status = NodeStatus::Running;
        state.0.started_at = Some(Utc::now());
        state.1 = Some(Instant::now());
    }

    pub(crate) fn mark_finished(&self, status: NodeStatus) {
        let mut state = self.state.lock();
        let elapsed = state.1.map(|start| start.elapsed()).unwrap_or(Duration::ZERO);
        state.0.status = status;
        state.0.duration_ms = Some(elapsed.as_millis() as u64);
    }

    /// Current status
    pub fn status(&self) -> NodeStatus {
        self.state.lock().0.status
    }

    /// Copy of the current record
    pub fn record(&self) -> ExecutionRecord {
        self.state.lock().0.clone()
    }
}

/// Root of a resolved test tree
#[derive(Debug)]
pub struct EngineDescriptor {
    id: UniqueId,
    classes: Vec<Arc<ClassDescriptor>>,
    metadata: ExecutionMetadata,
}

/// Check that `definitions` resolve to unique ids
///
/// Class type names must be unique across the run, and test names unique within
/// a class.
pub fn check_unique(definitions: &[ClassDefinition]) -> Result<(), DiscoveryError> {
    let mut classes = HashSet::new();
    for definition in definitions {
        if !classes.insert(definition.type_name()) {
            return Err(DiscoveryError::DuplicateClass {
                type_name: definition.type_name().to_string(),
            });
        }
        let mut tests = HashSet::new();
        for test in &definition.tests {
            if !tests.insert(test.name()) {
                return Err(DiscoveryError::DuplicateTest {
                    type_name: definition.type_name().to_string(),
                    name: test.name().to_string(),
                });
            }
        }
    }
    Ok(())
}

impl EngineDescriptor {
    /// Resolve class definitions into a tree, in the given order
    ///
    /// Ids are unique only if the definitions pass [`check_unique`].
    pub fn resolve(definitions: Vec<ClassDefinition>, configuration: &Configuration) -> Self {
        let id = UniqueId::engine();
        let default_parallelism = configuration.default_argument_parallelism();
        let classes = definitions
            .into_iter()
            .map(|definition| Arc::new(definition.resolve(&id, default_parallelism)))
            .collect();
        Self {
            id,
            classes,
            metadata: ExecutionMetadata::default(),
        }
    }

    pub fn id(&self) -> &UniqueId {
        &self.id
    }

    pub fn classes(&self) -> &[Arc<ClassDescriptor>] {
        &self.classes
    }

    pub fn metadata(&self) -> &ExecutionMetadata {
        &self.metadata
    }

    pub fn node(&self) -> Node<'_> {
        Node::Engine(self)
    }
}

/// A resolved test class
pub struct ClassDescriptor {
    id: UniqueId,
    type_name: Arc<str>,
    display_name: String,
    argument_parallelism: usize,
    instantiator: Instantiator,
    prepare: Vec<PhaseStep<ClassContext>>,
    conclude: Vec<PhaseStep<ClassContext>>,
    arguments: Vec<Arc<ArgumentDescriptor>>,
    metadata: ExecutionMetadata,
}

impl ClassDescriptor {
    pub fn id(&self) -> &UniqueId {
        &self.id
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Effective argument parallelism (always at least 1)
    pub fn argument_parallelism(&self) -> usize {
        self.argument_parallelism
    }

    pub fn prepare_steps(&self) -> &[PhaseStep<ClassContext>] {
        &self.prepare
    }

    pub fn conclude_steps(&self) -> &[PhaseStep<ClassContext>] {
        &self.conclude
    }

    pub fn arguments(&self) -> &[Arc<ArgumentDescriptor>] {
        &self.arguments
    }

    pub fn metadata(&self) -> &ExecutionMetadata {
        &self.metadata
    }

    pub fn node(&self) -> Node<'_> {
        Node::Class(self)
    }

    pub(crate) fn instantiate(
        &self,
        engine: &EngineContext,
    ) -> anyhow::Result<Arc<dyn Any + Send + Sync>> {
        (self.instantiator)(engine)
    }
}

impl fmt::Debug for ClassDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassDescriptor")
            .field("id", &self.id.to_string())
            .field("argument_parallelism", &self.argument_parallelism)
            .field("prepare", &self.prepare)
            .field("conclude", &self.conclude)
            .field("arguments", &self.arguments)
            .finish_non_exhaustive()
    }
}

/// A resolved argument of a test class
#[derive(Debug)]
pub struct ArgumentDescriptor {
    id: UniqueId,
    type_name: Arc<str>,
    index: usize,
    argument: Argument,
    before_all: Arc<[PhaseStep<ArgumentContext>]>,
    after_all: Arc<[PhaseStep<ArgumentContext>]>,
    methods: Vec<Arc<MethodDescriptor>>,
    metadata: ExecutionMetadata,
}

impl ArgumentDescriptor {
    pub fn id(&self) -> &UniqueId {
        &self.id
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Index among sibling arguments
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn argument(&self) -> &Argument {
        &self.argument
    }

    pub fn before_all_steps(&self) -> &[PhaseStep<ArgumentContext>] {
        &self.before_all
    }

    pub fn after_all_steps(&self) -> &[PhaseStep<ArgumentContext>] {
        &self.after_all
    }

    /// Test methods in ascending order
    pub fn methods(&self) -> &[Arc<MethodDescriptor>] {
        &self.methods
    }

    pub fn metadata(&self) -> &ExecutionMetadata {
        &self.metadata
    }

    pub fn node(&self) -> Node<'_> {
        Node::Argument(self)
    }
}

/// A resolved test method of one argument
#[derive(Debug)]
pub struct MethodDescriptor {
    id: UniqueId,
    type_name: Arc<str>,
    test: PhaseStep<ArgumentContext>,
    before_each: Arc<[PhaseStep<ArgumentContext>]>,
    after_each: Arc<[PhaseStep<ArgumentContext>]>,
    metadata: ExecutionMetadata,
}

impl MethodDescriptor {
    pub fn id(&self) -> &UniqueId {
        &self.id
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Test method name
    pub fn name(&self) -> &str {
        self.test.name()
    }

    pub fn test_step(&self) -> &PhaseStep<ArgumentContext> {
        &self.test
    }

    pub fn before_each_steps(&self) -> &[PhaseStep<ArgumentContext>] {
        &self.before_each
    }

    pub fn after_each_steps(&self) -> &[PhaseStep<ArgumentContext>] {
        &self.after_each
    }

    pub fn metadata(&self) -> &ExecutionMetadata {
        &self.metadata
    }

    pub fn node(&self) -> Node<'_> {
        Node::Method(self)
    }
}

/// Borrowed, uniform view of any node in the tree
#[derive(Debug, Clone, Copy)]
pub enum Node<'a> {
    Engine(&'a EngineDescriptor),
    Class(&'a ClassDescriptor),
    Argument(&'a ArgumentDescriptor),
    Method(&'a MethodDescriptor),
}

impl<'a> Node<'a> {
    pub fn kind(&self) -> NodeKind {
        match self {
            Node::Engine(_) => NodeKind::Engine,
            Node::Class(_) => NodeKind::Class,
            Node::Argument(_) => NodeKind::Argument,
            Node::Method(_) => NodeKind::Method,
        }
    }

    pub fn id(&self) -> &'a UniqueId {
        match *self {
            Node::Engine(n) => &n.id,
            Node::Class(n) => &n.id,
            Node::Argument(n) => &n.id,
            Node::Method(n) => &n.id,
        }
    }

    pub fn display_name(&self) -> &'a str {
        match *self {
            Node::Engine(_) => ENGINE_NAME,
            Node::Class(n) => &n.display_name,
            Node::Argument(n) => n.argument.name(),
            Node::Method(n) => n.test.name(),
        }
    }

    /// Declaring type; `None` for the engine root
    pub fn type_name(&self) -> Option<&'a str> {
        match *self {
            Node::Engine(_) => None,
            Node::Class(n) => Some(&n.type_name),
            Node::Argument(n) => Some(&n.type_name),
            Node::Method(n) => Some(&n.type_name),
        }
    }

    /// Direct children in execution order
    pub fn children(&self) -> Vec<Node<'a>> {
        match *self {
            Node::Engine(n) => n.classes.iter().map(|c| Node::Class(c)).collect(),
            Node::Class(n) => n.arguments.iter().map(|a| Node::Argument(a)).collect(),
            Node::Argument(n) => n.methods.iter().map(|m| Node::Method(m)).collect(),
            Node::Method(_) => Vec::new(),
        }
    }

    pub fn metadata(&self) -> &'a ExecutionMetadata {
        match *self {
            Node::Engine(n) => &n.metadata,
            Node::Class(n) => &n.metadata,
            Node::Argument(n) => &n.metadata,
            Node::Method(n) => &n.metadata,
        }
    }

    /// Names of the resolved user steps of `phase` on this node, in execution order
    pub fn step_names(&self, phase: Phase) -> Vec<&'a str> {
        fn names<C>(steps: &[PhaseStep<C>]) -> Vec<&str> {
            steps.iter().map(PhaseStep::name).collect()
        }
        match (*self, phase) {
            (Node::Class(n), Phase::Prepare) => names(&n.prepare),
            (Node::Class(n), Phase::Conclude) => names(&n.conclude),
            (Node::Argument(n), Phase::BeforeAll) => names(&n.before_all),
            (Node::Argument(n), Phase::AfterAll) => names(&n.after_all),
            (Node::Method(n), Phase::BeforeEach) => names(&n.before_each),
            (Node::Method(n), Phase::Test) => vec![n.test.name()],
            (Node::Method(n), Phase::AfterEach) => names(&n.after_each),
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn noop(name: &str) -> PhaseStep<ArgumentContext> {
        PhaseStep::new(name, |_| Ok(()))
    }

    #[test]
    fn test_unique_id_display() {
        let id = UniqueId::engine()
            .child(NodeKind::Class, "CalculatorTest")
            .child(NodeKind::Argument, "0")
            .child(NodeKind::Method, "adds");
        assert_eq!(
            id.to_string(),
            "[engine:trellis]/[class:CalculatorTest]/[argument:0]/[method:adds]"
        );
        assert_eq!(id.kind(), NodeKind::Method);
        assert_eq!(id.segments().len(), 4);
    }

    #[test]
    fn test_methods_sorted_by_explicit_order() {
        let definition = ClassDefinition::new("Ordered")
            .argument(Argument::of("only", 1u8))
            .test(noop("two").order(2))
            .test(noop("zero").order(0))
            .test(noop("one").order(1));
        let class = definition.resolve(&UniqueId::engine(), None);

        let names: Vec<&str> = class.arguments()[0]
            .methods()
            .iter()
            .map(|m| m.name())
            .collect();
        assert_eq!(names, vec!["zero", "one", "two"]);
    }

    #[test]
    fn test_equal_order_keeps_declaration_order() {
        let definition = ClassDefinition::new("Ties")
            .argument(Argument::of("only", ()))
            .before_all(noop("b").order(1))
            .before_all(noop("a").order(1))
            .before_all(noop("first").order(-1));
        let class = definition.resolve(&UniqueId::engine(), None);
        let argument = &class.arguments()[0];

        assert_eq!(
            argument.node().step_names(Phase::BeforeAll),
            vec!["first", "b", "a"]
        );
    }

    #[test]
    fn test_children_match_arguments_and_methods() {
        let definition = ClassDefinition::new("Tree")
            .arguments(vec![Argument::of("a", 1), Argument::of("b", 2)])
            .test(noop("t1"))
            .test(noop("t2"));
        let engine = EngineDescriptor::resolve(vec![definition], &Configuration::new());

        let root = engine.node();
        let classes = root.children();
        assert_eq!(classes.len(), 1);
        let arguments = classes[0].children();
        assert_eq!(arguments.len(), 2);
        assert_eq!(arguments[1].display_name(), "b");
        assert_eq!(arguments[1].id().to_string(), "[engine:trellis]/[class:Tree]/[argument:1]");
        for argument in arguments {
            assert_eq!(argument.children().len(), 2);
            assert_eq!(argument.type_name(), Some("Tree"));
        }
        assert_eq!(root.type_name(), None);
    }

    #[test]
    fn test_check_unique() {
        let distinct = vec![
            ClassDefinition::new("A").test(noop("t")),
            ClassDefinition::new("B").test(noop("t")),
        ];
        assert!(check_unique(&distinct).is_ok());

        let classes = vec![ClassDefinition::new("A"), ClassDefinition::new("A")];
        assert_eq!(
            check_unique(&classes),
            Err(DiscoveryError::DuplicateClass {
                type_name: "A".to_string()
            })
        );

        let tests = vec![ClassDefinition::new("A").test(noop("t")).test(noop("t").order(1))];
        assert_eq!(
            check_unique(&tests),
            Err(DiscoveryError::DuplicateTest {
                type_name: "A".to_string(),
                name: "t".to_string()
            })
        );
    }

    #[test]
    fn test_argument_parallelism_resolution() {
        let declared = ClassDefinition::new("Declared")
            .argument_parallelism(3)
            .resolve(&UniqueId::engine(), Some(8));
        assert_eq!(declared.argument_parallelism(), 3);

        let defaulted = ClassDefinition::new("Defaulted").resolve(&UniqueId::engine(), Some(8));
        assert_eq!(defaulted.argument_parallelism(), 8);

        let clamped = ClassDefinition::new("Clamped")
            .argument_parallelism(0)
            .resolve(&UniqueId::engine(), None);
        assert_eq!(clamped.argument_parallelism(), 1);

        let unset = ClassDefinition::new("Unset").resolve(&UniqueId::engine(), None);
        assert_eq!(unset.argument_parallelism(), 1);
    }

    struct Connection {
        releases: Arc<AtomicUsize>,
    }

    impl Releasable for Connection {
        fn release(&self) -> anyhow::Result<()> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_argument_release_is_idempotent() {
        let releases = Arc::new(AtomicUsize::new(0));
        let argument = Argument::releasable(
            "db",
            Connection {
                releases: releases.clone(),
            },
        );
        assert!(argument.is_releasable());
        assert!(argument.payload::<Connection>().is_some());

        argument.release().unwrap();
        argument.clone().release().unwrap();
        assert!(argument.is_released());
        assert_eq!(releases.load(Ordering::SeqCst), 1);

        let plain = Argument::of("plain", "value");
        plain.release().unwrap();
        assert!(!plain.is_released());
        assert_eq!(plain.payload::<&str>().as_deref(), Some(&"value"));
        assert!(plain.payload::<String>().is_none());
    }

    #[test]
    fn test_execution_metadata_transitions() {
        let metadata = ExecutionMetadata::default();
        assert_eq!(metadata.status(), NodeStatus::Pending);

        metadata.mark_started();
        assert_eq!(metadata.status(), NodeStatus::Running);
        assert!(metadata.record().started_at.is_some());

        metadata.mark_finished(NodeStatus::Succeeded);
        let record = metadata.record();
        assert_eq!(record.status, NodeStatus::Succeeded);
        assert!(record.duration_ms.is_some());
    }
}
