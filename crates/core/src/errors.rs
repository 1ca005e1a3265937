//! Error types and handling
//!
//! This module provides the engine's error taxonomy. Programmer misuse of the
//! store/context API surfaces as [`StoreError`] or [`ContextError`] and is returned
//! to the caller. Failures of user code and interceptor hooks are captured as
//! [`Failure`] values, attributed to the node that produced them, and never cross
//! a node boundary. Engine-level setup problems are wrapped in [`TrellisError`].

use std::sync::Arc;
use thiserror::Error;

/// Scoped store misuse
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Key is the absent sentinel (empty or whitespace-only)
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Value stored under the key has a different type than requested
    #[error("Store value for key '{key}' is not of type {expected}")]
    TypeMismatch { key: String, expected: &'static str },
}

/// Context accessor misuse
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContextError {
    /// Accessor invoked before the owning node reached the required stage
    #[error("{what} is not available before {stage}")]
    NotAvailable {
        what: &'static str,
        stage: &'static str,
    },

    /// The test instance could not be created
    #[error("Test instance for {type_name} failed to instantiate: {message}")]
    InstantiationFailed { type_name: String, message: String },

    /// Value exists but has a different type than requested
    #[error("{what} is not of type {expected}")]
    TypeMismatch {
        what: &'static str,
        expected: &'static str,
    },
}

/// Discovery input that cannot form a tree with unique node ids
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    /// Two class definitions share a type name
    #[error("Duplicate test class '{type_name}'")]
    DuplicateClass { type_name: String },

    /// Two test steps of one class share a name
    #[error("Duplicate test '{name}' in class '{type_name}'")]
    DuplicateTest { type_name: String, name: String },
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A regular expression in the configuration failed to compile
    #[error("Invalid regular expression for {key}: {source}")]
    InvalidRegex {
        key: String,
        #[source]
        source: regex::Error,
    },
}

/// A recovered failure of user code or an interceptor hook
///
/// Failures are cheap to clone so the same cause can be handed to post hooks,
/// stored in node metadata and reported to every result sink.
#[derive(Error, Debug, Clone)]
pub enum Failure {
    /// A user lifecycle or test step returned an error or panicked
    #[error("{step} failed: {cause:#}")]
    Phase {
        step: String,
        cause: Arc<anyhow::Error>,
    },

    /// An interceptor's pre/post hook returned an error or panicked
    #[error("Interceptor '{interceptor}' failed in {hook}: {cause:#}")]
    Hook {
        interceptor: String,
        hook: &'static str,
        cause: Arc<anyhow::Error>,
    },
}

impl Failure {
    /// Create a phase failure for the named step
    pub fn phase(step: impl Into<String>, cause: anyhow::Error) -> Self {
        Failure::Phase {
            step: step.into(),
            cause: Arc::new(cause),
        }
    }

    /// Create a hook failure for the named interceptor and hook
    pub fn hook(interceptor: impl Into<String>, hook: &'static str, cause: anyhow::Error) -> Self {
        Failure::Hook {
            interceptor: interceptor.into(),
            hook,
            cause: Arc::new(cause),
        }
    }

    /// The underlying error
    pub fn cause(&self) -> &anyhow::Error {
        match self {
            Failure::Phase { cause, .. } | Failure::Hook { cause, .. } => cause,
        }
    }

    /// Whether this failure originated in an interceptor hook
    pub fn is_hook_failure(&self) -> bool {
        matches!(self, Failure::Hook { .. })
    }
}

/// Main error enum wrapping all domain-specific errors
#[derive(Error, Debug)]
pub enum TrellisError {
    /// Store misuse
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Context misuse
    #[error("Context error: {0}")]
    Context(#[from] ContextError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Invalid discovery input
    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    /// Async runtime could not be created or a worker task was lost
    #[error("Runtime error: {0}")]
    Runtime(String),
}

/// Convenience type alias for Results with TrellisError
pub type Result<T> = std::result::Result<T, TrellisError>;
