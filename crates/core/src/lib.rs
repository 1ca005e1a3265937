//! Core library for the Trellis test engine
//!
//! Trellis executes parameterized test classes: each class is instantiated once,
//! run against every argument it declares, and each argument runs the class's
//! test methods. Lifecycle phases around classes, arguments and methods can be
//! observed and vetoed by interceptors, and classes and arguments run in bounded
//! parallel pools.
//!
//! Entry point: [`engine::Engine`].

pub mod collector;
pub mod config;
pub mod context;
pub mod descriptor;
pub mod engine;
pub mod errors;
pub mod interceptor;
pub mod lifecycle;
pub mod listener;
pub mod logging;
pub mod observability;
pub mod scheduler;
pub mod store;

/// Get the version of the core library
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
