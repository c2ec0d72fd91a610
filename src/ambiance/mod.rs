//! Execution Context Module
//!
//! The ambiance is the identity-and-scope carrier passed to every engine
//! operation: tenant-scoped setup abstractions, the stack of nested scopes
//! currently executing, and the plan execution id.
//!
//! - [`context`]: The [`Ambiance`] itself
//! - [`level`]: Stack frames
//! - [`log_context`]: Diagnostic key/value sets

pub mod context;
pub mod level;
pub mod log_context;

pub use context::Ambiance;
pub use level::Level;
pub use log_context::LogContext;
