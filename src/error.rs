//! Error types
//!
//! Two layers: `Error` is what the embedder sees from `Context::eval`,
//! `VmError` is the internal unwind signal threaded through the VM,
//! builtins, and the regex engine. Only `VmError::Throw` is observable
//! by user `try`/`catch`; the limit variants bypass every handler.

use crate::value::Value;
use std::fmt;
use thiserror::Error;

/// Errors reported to the embedder.
#[derive(Error, Debug)]
pub enum Error {
    /// The source failed to compile.
    #[error("syntax error: {message} (line {line}, column {column})")]
    Syntax {
        message: String,
        line: u32,
        column: u32,
    },

    /// User code threw a value no handler caught.
    #[error("uncaught exception: {0}")]
    Runtime(JsException),

    /// A regex literal or `RegExp` pattern failed to compile.
    #[error("invalid regular expression: {0}")]
    Regex(String),

    /// The regex backtrack stack exceeded its bound.
    #[error("regular expression stack overflow")]
    RegexStackOverflow,

    /// The regex matcher was aborted by the deadline or poll callback.
    #[error("regular expression timed out")]
    RegexTimeout,

    /// The context's byte budget was exhausted.
    #[error("memory limit exceeded")]
    MemoryLimit,

    /// The wall-clock limit elapsed or the host poll requested abort.
    #[error("time limit exceeded")]
    TimeLimit,
}

/// An uncaught exception, unpacked for the host.
///
/// `rendered` is the JS `ToString` of the thrown value; `name` and
/// `message` are read off error-shaped objects (`"Error"` and the
/// rendered form otherwise). `line`/`column` are stamped at throw time
/// from the source map, so a constructed-but-never-thrown error carries
/// none.
#[derive(Debug, Clone)]
pub struct JsException {
    pub name: String,
    pub message: String,
    pub rendered: String,
    pub line: Option<u32>,
    pub column: Option<u32>,
}

impl fmt::Display for JsException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rendered)?;
        if let Some(line) = self.line {
            match self.column {
                Some(column) => write!(f, " (line {}, column {})", line, column)?,
                None => write!(f, " (line {})", line)?,
            }
        }
        Ok(())
    }
}

/// Internal unwind signal.
#[derive(Debug)]
pub enum VmError {
    /// A thrown value, travelling up the exception tables.
    Throw(Value),
    MemoryLimit,
    TimeLimit,
    RegexStackOverflow,
    RegexTimeout,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exception_display_with_location() {
        let e = JsException {
            name: "TypeError".to_string(),
            message: "x is not a function".to_string(),
            rendered: "TypeError: x is not a function".to_string(),
            line: Some(3),
            column: Some(7),
        };
        assert_eq!(e.to_string(), "TypeError: x is not a function (line 3, column 7)");
    }

    #[test]
    fn test_exception_display_without_location() {
        let e = JsException {
            name: "Error".to_string(),
            message: "plain".to_string(),
            rendered: "plain".to_string(),
            line: None,
            column: None,
        };
        assert_eq!(e.to_string(), "plain");
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(Error::TimeLimit.to_string(), "time limit exceeded");
        assert_eq!(Error::MemoryLimit.to_string(), "memory limit exceeded");
        let s = Error::Syntax {
            message: "unexpected token".to_string(),
            line: 2,
            column: 5,
        };
        assert_eq!(s.to_string(), "syntax error: unexpected token (line 2, column 5)");
    }
}
