//! Interceptors: cross-cutting hooks around every lifecycle phase
//!
//! ## Architecture
//!
//! - [`ClassInterceptor`] implementations get a `pre_*` and a `post_*` hook for each
//!   phase of a class, argument and method, plus `on_destroy` when a class ends
//! - [`EngineInterceptor`] implementations observe the run as a whole and may
//!   rewrite class definitions before scheduling starts
//! - [`InterceptorRegistry`] holds the global interceptors of one run (selected
//!   lazily and once: deduplicated by name, filtered by the include/exclude
//!   regexes from configuration, stably sorted by `order()`), plus interceptors
//!   registered for a single class
//! - [`InterceptorChain`] is the snapshot used for one class: global interceptors
//!   followed by the class-scoped ones. Pre hooks run forward, post hooks in reverse
//!
//! ## Phase protocol
//!
//! [`InterceptorChain::run_phase`] runs the pre hooks in order and stops at the
//! first failing one. User steps run only if every pre hook succeeded. Post hooks
//! then run for every interceptor in reverse order, each seeing the first
//! pre/body failure. A post hook failure takes precedence over the pre/body
//! failure; at most one failure is returned per phase.

use crate::collector::FailureCollector;
use crate::config::{keys, Configuration};
use crate::context::{ArgumentContext, ClassContext, EngineContext};
use crate::descriptor::{ClassDefinition, ClassDescriptor, MethodDescriptor};
use crate::errors::{ConfigError, Failure};
use crate::lifecycle::Phase;
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Hook name reported for `ClassInterceptor::on_destroy` failures
pub const ON_DESTROY: &str = "on_destroy";

/// Cross-cutting hooks around the phases of a test class
///
/// Every hook defaults to a no-op. A hook that returns an error (or panics) is
/// recorded as a [`Failure::Hook`] against the node being executed.
///
/// # Examples
///
/// ```rust
/// use trellis_core::context::ArgumentContext;
/// use trellis_core::descriptor::MethodDescriptor;
/// use trellis_core::errors::Failure;
/// use trellis_core::interceptor::ClassInterceptor;
///
/// struct Timing;
///
/// impl ClassInterceptor for Timing {
///     fn name(&self) -> &str { "timing" }
///
///     fn post_test(
///         &self,
///         _ctx: &ArgumentContext,
///         method: &MethodDescriptor,
///         failure: Option<&Failure>,
///     ) -> anyhow::Result<()> {
///         println!("{} passed: {}", method.name(), failure.is_none());
///         Ok(())
///     }
/// }
/// ```
#[allow(unused_variables)]
pub trait ClassInterceptor: Send + Sync {
    /// Unique name, used for deduplication and include/exclude filtering
    fn name(&self) -> &str;

    /// Explicit order; lower values run their pre hooks first
    fn order(&self) -> i32 {
        0
    }

    fn pre_instantiate(
        &self,
        engine: &EngineContext,
        class: &ClassDescriptor,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called after instantiation; `failure` is set when it failed
    fn post_instantiate(
        &self,
        ctx: &ClassContext,
        failure: Option<&Failure>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn pre_prepare(&self, ctx: &ClassContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn post_prepare(&self, ctx: &ClassContext, failure: Option<&Failure>) -> anyhow::Result<()> {
        Ok(())
    }

    fn pre_before_all(&self, ctx: &ArgumentContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn post_before_all(
        &self,
        ctx: &ArgumentContext,
        failure: Option<&Failure>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn pre_before_each(
        &self,
        ctx: &ArgumentContext,
        method: &MethodDescriptor,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn post_before_each(
        &self,
        ctx: &ArgumentContext,
        method: &MethodDescriptor,
        failure: Option<&Failure>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn pre_test(&self, ctx: &ArgumentContext, method: &MethodDescriptor) -> anyhow::Result<()> {
        Ok(())
    }

    fn post_test(
        &self,
        ctx: &ArgumentContext,
        method: &MethodDescriptor,
        failure: Option<&Failure>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn pre_after_each(
        &self,
        ctx: &ArgumentContext,
        method: &MethodDescriptor,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn post_after_each(
        &self,
        ctx: &ArgumentContext,
        method: &MethodDescriptor,
        failure: Option<&Failure>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn pre_after_all(&self, ctx: &ArgumentContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn post_after_all(
        &self,
        ctx: &ArgumentContext,
        failure: Option<&Failure>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn pre_conclude(&self, ctx: &ClassContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn post_conclude(&self, ctx: &ClassContext, failure: Option<&Failure>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Last hook of a class execution; always runs, in reverse chain order
    fn on_destroy(&self, ctx: &ClassContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Hooks around the whole run
#[allow(unused_variables)]
pub trait EngineInterceptor: Send + Sync {
    /// Unique name, used for deduplication and include/exclude filtering
    fn name(&self) -> &str;

    fn order(&self) -> i32 {
        0
    }

    /// Called once before discovery results are processed
    fn on_initialize(&self, engine: &EngineContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called per class before resolution; may reorder or trim arguments,
    /// rename the class or change its argument parallelism
    fn on_test_discovery(
        &self,
        engine: &EngineContext,
        class: &mut ClassDefinition,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called once after every class finished, in reverse order
    fn on_destroy(&self, engine: &EngineContext) -> anyhow::Result<()> {
        Ok(())
    }
}

trait Named {
    fn label(&self) -> &str;
    fn rank(&self) -> i32;
}

impl Named for dyn ClassInterceptor {
    fn label(&self) -> &str {
        self.name()
    }

    fn rank(&self) -> i32 {
        self.order()
    }
}

impl Named for dyn EngineInterceptor {
    fn label(&self) -> &str {
        self.name()
    }

    fn rank(&self) -> i32 {
        self.order()
    }
}

/// Include/exclude name filter
#[derive(Debug, Clone, Default)]
struct NameFilter {
    include: Option<Regex>,
    exclude: Option<Regex>,
}

impl NameFilter {
    fn from_configuration(
        configuration: &Configuration,
        include_key: &str,
        exclude_key: &str,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            include: configuration.regex(include_key)?,
            exclude: configuration.regex(exclude_key)?,
        })
    }

    fn accepts(&self, name: &str) -> bool {
        if let Some(include) = &self.include {
            if !include.is_match(name) {
                return false;
            }
        }
        if let Some(exclude) = &self.exclude {
            if exclude.is_match(name) {
                return false;
            }
        }
        true
    }
}

/// Candidates selected on first use
struct LazySelection<T: ?Sized> {
    kind: &'static str,
    filter: NameFilter,
    candidates: Mutex<Vec<Arc<T>>>,
    selected: OnceCell<Vec<Arc<T>>>,
}

impl<T: ?Sized + Named> LazySelection<T> {
    fn new(kind: &'static str, filter: NameFilter, candidates: Vec<Arc<T>>) -> Self {
        Self {
            kind,
            filter,
            candidates: Mutex::new(candidates),
            selected: OnceCell::new(),
        }
    }

    fn get(&self) -> &[Arc<T>] {
        self.selected.get_or_init(|| {
            let candidates = std::mem::take(&mut *self.candidates.lock());
            let mut seen = HashSet::new();
            let mut selected = Vec::new();
            for candidate in candidates {
                let name = candidate.label().to_string();
                if !seen.insert(name.clone()) {
                    warn!(
                        "{} interceptor '{}' already registered, ignoring duplicate",
                        self.kind, name
                    );
                    continue;
                }
                if !self.filter.accepts(&name) {
                    debug!("{} interceptor '{}' filtered out", self.kind, name);
                    continue;
                }
                selected.push(candidate);
            }
            selected.sort_by_key(|interceptor| interceptor.rank());
            info!("Loaded {} {} interceptors", selected.len(), self.kind);
            selected
        })
    }
}

/// Interceptors of one engine run
pub struct InterceptorRegistry {
    global: LazySelection<dyn ClassInterceptor>,
    engine: LazySelection<dyn EngineInterceptor>,
    class_scoped: RwLock<HashMap<String, Vec<Arc<dyn ClassInterceptor>>>>,
}

impl InterceptorRegistry {
    /// Create a registry from candidate interceptors
    ///
    /// Filters are compiled here so an invalid regex fails the run up front;
    /// selection itself happens on first use.
    pub fn new(
        configuration: &Configuration,
        class_candidates: Vec<Arc<dyn ClassInterceptor>>,
        engine_candidates: Vec<Arc<dyn EngineInterceptor>>,
    ) -> Result<Self, ConfigError> {
        let class_filter = NameFilter::from_configuration(
            configuration,
            keys::CLASS_INTERCEPTORS_INCLUDE_REGEX,
            keys::CLASS_INTERCEPTORS_EXCLUDE_REGEX,
        )?;
        let engine_filter = NameFilter::from_configuration(
            configuration,
            keys::ENGINE_INTERCEPTORS_INCLUDE_REGEX,
            keys::ENGINE_INTERCEPTORS_EXCLUDE_REGEX,
        )?;
        Ok(Self {
            global: LazySelection::new("class", class_filter, class_candidates),
            engine: LazySelection::new("engine", engine_filter, engine_candidates),
            class_scoped: RwLock::new(HashMap::new()),
        })
    }

    /// Selected global class interceptors, in order
    pub fn global_interceptors(&self) -> &[Arc<dyn ClassInterceptor>] {
        self.global.get()
    }

    /// Selected engine interceptors, in order
    pub fn engine_interceptors(&self) -> &[Arc<dyn EngineInterceptor>] {
        self.engine.get()
    }

    /// Register an interceptor for one class only
    pub fn register(&self, type_name: &str, interceptor: Arc<dyn ClassInterceptor>) {
        debug!(
            "Registering interceptor '{}' for class {}",
            interceptor.name(),
            type_name
        );
        self.class_scoped
            .write()
            .entry(type_name.to_string())
            .or_default()
            .push(interceptor);
    }

    /// Remove class-scoped interceptors by name, returning whether any was removed
    pub fn remove(&self, type_name: &str, name: &str) -> bool {
        let mut scoped = self.class_scoped.write();
        let Some(interceptors) = scoped.get_mut(type_name) else {
            return false;
        };
        let before = interceptors.len();
        interceptors.retain(|interceptor| interceptor.name() != name);
        before != interceptors.len()
    }

    /// Number of class-scoped interceptors for a class
    pub fn size(&self, type_name: &str) -> usize {
        self.class_scoped
            .read()
            .get(type_name)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Remove every class-scoped interceptor for a class
    pub fn clear(&self, type_name: &str) {
        self.class_scoped.write().remove(type_name);
    }

    /// Snapshot of the chain for a class: global then class-scoped interceptors
    pub fn chain(&self, type_name: &str) -> InterceptorChain {
        let mut interceptors = self.global_interceptors().to_vec();
        if let Some(scoped) = self.class_scoped.read().get(type_name) {
            interceptors.extend(scoped.iter().cloned());
        }
        InterceptorChain { interceptors }
    }
}

/// Interceptors applying to one class, fixed for the class's execution
#[derive(Clone, Default)]
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn ClassInterceptor>>,
}

impl InterceptorChain {
    /// Create a chain from an explicit list
    pub fn new(interceptors: Vec<Arc<dyn ClassInterceptor>>) -> Self {
        Self { interceptors }
    }

    pub fn forward(&self) -> impl Iterator<Item = &Arc<dyn ClassInterceptor>> {
        self.interceptors.iter()
    }

    pub fn reversed(&self) -> impl Iterator<Item = &Arc<dyn ClassInterceptor>> {
        self.interceptors.iter().rev()
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.interceptors.iter().map(|i| i.name()).collect()
    }

    /// Run one phase: pre hooks, then `body` if they all passed, then every post hook
    pub fn run_phase<Pre, Body, Post>(
        &self,
        phase: Phase,
        pre: Pre,
        body: Body,
        post: Post,
    ) -> Result<(), Failure>
    where
        Pre: Fn(&dyn ClassInterceptor) -> anyhow::Result<()>,
        Body: FnOnce(&mut FailureCollector),
        Post: Fn(&dyn ClassInterceptor, Option<&Failure>) -> anyhow::Result<()>,
    {
        trace!("phase {}: pre hooks", phase.as_str());
        let mut collector = FailureCollector::new();
        for interceptor in self.forward() {
            let passed = collector.execute_hook(interceptor.name(), phase.pre_hook(), || {
                pre(interceptor.as_ref())
            });
            if !passed {
                break;
            }
        }

        if collector.is_empty() {
            trace!("phase {}: body", phase.as_str());
            body(&mut collector);
        } else {
            debug!(
                "phase {}: skipping user steps after pre hook failure",
                phase.as_str()
            );
        }
        let failure = collector.into_first();

        trace!("phase {}: post hooks", phase.as_str());
        let mut post_collector = FailureCollector::new();
        for interceptor in self.reversed() {
            post_collector.execute_hook(interceptor.name(), phase.post_hook(), || {
                post(interceptor.as_ref(), failure.as_ref())
            });
        }

        match (post_collector.into_first(), failure) {
            (Some(post_failure), Some(failure)) => {
                warn!(
                    "phase {}: {} superseded by post hook failure",
                    phase.as_str(),
                    failure
                );
                Err(post_failure)
            }
            (Some(post_failure), None) => Err(post_failure),
            (None, Some(failure)) => Err(failure),
            (None, None) => Ok(()),
        }
    }

    /// Run `on_destroy` for every interceptor in reverse order
    pub fn destroy(&self, ctx: &ClassContext) -> Result<(), Failure> {
        let mut collector = FailureCollector::new();
        for interceptor in self.reversed() {
            collector.execute_hook(interceptor.name(), ON_DESTROY, || interceptor.on_destroy(ctx));
        }
        collector.into_result()
    }
}
