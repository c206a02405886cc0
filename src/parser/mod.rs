//! Parser and compiler
//!
//! Source text goes in, bytecode comes out, in one pass.

pub mod compiler;
pub mod lexer;

pub use compiler::{compile, CompileError};
