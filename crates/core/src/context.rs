//! Execution contexts handed to lifecycle steps and interceptors
//!
//! Contexts form a chain: every [`ArgumentContext`] links to the [`ClassContext`]
//! it runs under, which links to the run-wide [`EngineContext`]. Each level owns
//! its own [`ScopedStore`]. Accessors for state that only exists from a certain
//! lifecycle stage on return [`ContextError::NotAvailable`] before that stage.

use crate::config::Configuration;
use crate::descriptor::{Argument, ClassDescriptor};
use crate::errors::ContextError;
use crate::store::ScopedStore;
use once_cell::sync::OnceCell;
use std::any::{type_name, Any};
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Run-wide context
pub struct EngineContext {
    version: &'static str,
    configuration: Arc<Configuration>,
    store: ScopedStore,
}

impl EngineContext {
    pub fn new(configuration: Configuration) -> Self {
        Self {
            version: crate::version(),
            configuration: Arc::new(configuration),
            store: ScopedStore::new(),
        }
    }

    /// Engine version
    pub fn version(&self) -> &str {
        self.version
    }

    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    pub fn store(&self) -> &ScopedStore {
        &self.store
    }
}

impl fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineContext")
            .field("version", &self.version)
            .field("configuration", &self.configuration)
            .finish_non_exhaustive()
    }
}

type Instance = Result<Arc<dyn Any + Send + Sync>, String>;

/// Context of one class execution (one test instance)
pub struct ClassContext {
    engine: Arc<EngineContext>,
    type_name: String,
    display_name: String,
    argument_parallelism: usize,
    instance: OnceCell<Instance>,
    store: ScopedStore,
}

impl ClassContext {
    pub fn new(engine: Arc<EngineContext>, class: &ClassDescriptor) -> Self {
        Self {
            engine,
            type_name: class.type_name().to_string(),
            display_name: class.display_name().to_string(),
            argument_parallelism: class.argument_parallelism(),
            instance: OnceCell::new(),
            store: ScopedStore::new(),
        }
    }

    pub fn engine_context(&self) -> &Arc<EngineContext> {
        &self.engine
    }

    /// Declaring type name of the class
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn argument_parallelism(&self) -> usize {
        self.argument_parallelism
    }

    /// Configuration, delegated to the engine context
    pub fn configuration(&self) -> &Configuration {
        self.engine.configuration()
    }

    pub fn store(&self) -> &ScopedStore {
        &self.store
    }

    /// The untyped test instance
    pub fn test_instance_any(&self) -> Result<Arc<dyn Any + Send + Sync>, ContextError> {
        match self.instance.get() {
            None => Err(ContextError::NotAvailable {
                what: "test instance",
                stage: "instantiation",
            }),
            Some(Err(message)) => Err(ContextError::InstantiationFailed {
                type_name: self.type_name.clone(),
                message: message.clone(),
            }),
            Some(Ok(instance)) => Ok(instance.clone()),
        }
    }

    /// The test instance as its concrete type
    pub fn test_instance<T: Any + Send + Sync>(&self) -> Result<Arc<T>, ContextError> {
        self.test_instance_any()?
            .downcast::<T>()
            .map_err(|_| ContextError::TypeMismatch {
                what: "test instance",
                expected: type_name::<T>(),
            })
    }

    /// Whether instantiation completed successfully
    pub fn is_instantiated(&self) -> bool {
        matches!(self.instance.get(), Some(Ok(_)))
    }

    pub(crate) fn set_instance(&self, instance: Instance) {
        if self.instance.set(instance).is_err() {
            warn!("Test instance for {} already set, ignoring", self.type_name);
        }
    }
}

impl fmt::Debug for ClassContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassContext")
            .field("type_name", &self.type_name)
            .field("display_name", &self.display_name)
            .field("argument_parallelism", &self.argument_parallelism)
            .field("instantiated", &self.is_instantiated())
            .finish_non_exhaustive()
    }
}

/// Context of one argument's before-all through after-all span
pub struct ArgumentContext {
    class: Arc<ClassContext>,
    binding: OnceCell<(usize, Argument)>,
    store: ScopedStore,
}

impl ArgumentContext {
    pub fn new(class: Arc<ClassContext>) -> Self {
        Self {
            class,
            binding: OnceCell::new(),
            store: ScopedStore::new(),
        }
    }

    pub fn class_context(&self) -> &Arc<ClassContext> {
        &self.class
    }

    pub fn engine_context(&self) -> &Arc<EngineContext> {
        self.class.engine_context()
    }

    pub fn configuration(&self) -> &Configuration {
        self.class.configuration()
    }

    pub fn store(&self) -> &ScopedStore {
        &self.store
    }

    /// The current argument; bound when before-all begins
    pub fn argument(&self) -> Result<&Argument, ContextError> {
        self.binding
            .get()
            .map(|(_, argument)| argument)
            .ok_or(ContextError::NotAvailable {
                what: "argument",
                stage: "before-all",
            })
    }

    /// Index of the current argument among its siblings
    pub fn argument_index(&self) -> Result<usize, ContextError> {
        self.binding
            .get()
            .map(|(index, _)| *index)
            .ok_or(ContextError::NotAvailable {
                what: "argument index",
                stage: "before-all",
            })
    }

    /// The current argument's payload as its concrete type
    pub fn payload<T: Any + Send + Sync>(&self) -> Result<Arc<T>, ContextError> {
        self.argument()?
            .payload::<T>()
            .ok_or(ContextError::TypeMismatch {
                what: "argument payload",
                expected: type_name::<T>(),
            })
    }

    /// The class's test instance as its concrete type
    pub fn test_instance<T: Any + Send + Sync>(&self) -> Result<Arc<T>, ContextError> {
        self.class.test_instance::<T>()
    }

    pub(crate) fn bind(&self, index: usize, argument: Argument) {
        if self.binding.set((index, argument)).is_err() {
            warn!("Argument {} already bound, ignoring", index);
        }
    }
}

impl fmt::Debug for ArgumentContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArgumentContext")
            .field("class", &self.class.type_name)
            .field("argument", &self.binding.get())
            .finish_non_exhaustive()
    }
}
