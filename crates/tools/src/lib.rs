//! Tool registry for localturn sessions.
//!
//! The registry maps tool names to async handlers and advertises their
//! definitions to the prompt renderer. Two built-ins ship with it:
//! - `echo`: returns its arguments unchanged
//! - `clock`: reports the current UTC time

pub mod builtin;
pub mod registry;

pub use registry::ToolRegistry;
