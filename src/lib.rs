//! sandjs - a sandboxed engine for a strict subset of JavaScript
//!
//! Source text is compiled in a single pass to bytecode and executed on
//! a stack-based virtual machine under configurable memory and
//! wall-clock budgets. Hosts supply code and optionally named globals,
//! receive results or structured errors, and are protected from runaway
//! or hostile programs by cooperative polling.
//!
//! # Example
//! ```
//! use sandjs::{Context, ContextConfig};
//! use std::time::Duration;
//!
//! let mut ctx = Context::with_config(ContextConfig {
//!     memory_limit: Some(16 << 20),
//!     time_limit: Some(Duration::from_millis(500)),
//!     ..Default::default()
//! }).unwrap();
//!
//! let result = ctx.eval("[1, 2, 3].map(function (x) { return x * x; }).join()").unwrap();
//! assert_eq!(result.as_str().unwrap(), "1,4,9");
//! ```

// Core modules
pub mod context;
pub mod error;
pub mod value;

// Parser and compiler
pub mod parser;

// Virtual machine
pub mod vm;

// Runtime support
pub mod runtime;

// Built-in objects
pub mod builtins;

// Regular expressions
pub mod regex;

// Utilities
pub mod util;

// Re-export the embedding surface
pub use context::{Context, ContextConfig};
pub use error::{Error, JsException};
pub use value::Value;
