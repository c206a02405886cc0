//! Runtime support
//!
//! The object model backing the VM: property tables, strings, compiled
//! functions and closures.

pub mod function;
pub mod object;
pub mod property;
pub mod string;

pub use function::{Cell, Const, ExceptionEntry, FunctionBytecode, JsClosure, UpvalueSource};
pub use object::{JsObject, ObjRef, ObjectKind};
pub use string::JsString;
