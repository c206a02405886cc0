//! JavaScript object representation
//!
//! Every heap value is a `JsObject`: an ordered property map, a prototype
//! link, and a `kind` carrying any specialised body (array elements,
//! closure state, regex program, iteration state). Objects are shared by
//! reference; identity is pointer identity.

use crate::error::VmError;
use crate::regex::Regex;
use crate::runtime::function::JsClosure;
use crate::runtime::property::PropertyMap;
use crate::value::Value;
use crate::vm::interp::Vm;
use std::cell::RefCell;
use std::rc::Rc;

/// Shared reference to a heap object.
pub type ObjRef = Rc<RefCell<JsObject>>;

/// Native function implemented in the engine.
pub type BuiltinFn = fn(&mut Vm, Value, &[Value]) -> Result<Value, VmError>;

/// Function supplied by the embedder via `Context::set_function`.
pub type HostFn = dyn Fn(&[Value]) -> Result<Value, Value>;

/// The callable body of a native function object.
#[derive(Clone)]
pub enum NativeKind {
    /// Engine builtin with full VM access
    Builtin(BuiltinFn),
    /// Host callback; an `Err` value is thrown into the script
    Host(Rc<HostFn>),
}

/// A native (non-bytecode) function.
#[derive(Clone)]
pub struct NativeFunction {
    pub name: &'static str,
    pub kind: NativeKind,
}

impl std::fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NativeFunction({})", self.name)
    }
}

/// Snapshot iterator state for `for-in` / `for-of`.
#[derive(Debug, Clone)]
pub struct IterState {
    pub items: Vec<Value>,
    pub index: usize,
}

/// Specialised object body.
#[derive(Debug, Clone)]
pub enum ObjectKind {
    Plain,
    Array(Vec<Value>),
    Closure(JsClosure),
    Native(NativeFunction),
    /// Error-shaped object; name/message/lineNumber live in the props
    Error,
    /// Compiled regex program; source/flags/lastIndex live in the props
    Regexp(Rc<Regex>),
    /// Internal iteration snapshot (never visible to scripts)
    Iter(IterState),
}

/// A JavaScript object.
#[derive(Debug)]
pub struct JsObject {
    pub proto: Option<ObjRef>,
    pub props: PropertyMap,
    pub kind: ObjectKind,
}

impl JsObject {
    /// Create a plain object with the given prototype.
    pub fn new(proto: Option<ObjRef>) -> Self {
        JsObject {
            proto,
            props: PropertyMap::new(),
            kind: ObjectKind::Plain,
        }
    }

    /// Create an object with a specialised body.
    pub fn with_kind(proto: Option<ObjRef>, kind: ObjectKind) -> Self {
        JsObject {
            proto,
            props: PropertyMap::new(),
            kind,
        }
    }

    /// Whether this object can be invoked.
    pub fn is_callable(&self) -> bool {
        matches!(self.kind, ObjectKind::Closure(_) | ObjectKind::Native(_))
    }

    /// Whether this object is an array.
    pub fn is_array(&self) -> bool {
        matches!(self.kind, ObjectKind::Array(_))
    }

    /// Array elements, if this is an array.
    pub fn elements(&self) -> Option<&Vec<Value>> {
        match &self.kind {
            ObjectKind::Array(els) => Some(els),
            _ => None,
        }
    }

    /// Mutable array elements, if this is an array.
    pub fn elements_mut(&mut self) -> Option<&mut Vec<Value>> {
        match &mut self.kind {
            ObjectKind::Array(els) => Some(els),
            _ => None,
        }
    }

    /// Approximate heap footprint at creation time, for the memory budget.
    pub fn base_byte_size(&self) -> usize {
        let body = match &self.kind {
            ObjectKind::Array(els) => els.len() * std::mem::size_of::<Value>(),
            ObjectKind::Closure(c) => c.upvalues.len() * std::mem::size_of::<usize>(),
            _ => 0,
        };
        std::mem::size_of::<JsObject>() + body
    }
}

/// Wrap an object into a shared reference.
pub fn obj_ref(obj: JsObject) -> ObjRef {
    Rc::new(RefCell::new(obj))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_object() {
        let obj = JsObject::new(None);
        assert!(!obj.is_callable());
        assert!(!obj.is_array());
        assert!(obj.props.is_empty());
    }

    #[test]
    fn test_array_elements() {
        let mut obj = JsObject::with_kind(
            None,
            ObjectKind::Array(vec![Value::Number(1.0), Value::Number(2.0)]),
        );
        assert!(obj.is_array());
        assert_eq!(obj.elements().unwrap().len(), 2);
        obj.elements_mut().unwrap().push(Value::Number(3.0));
        assert_eq!(obj.elements().unwrap().len(), 3);
    }

    #[test]
    fn test_prototype_link() {
        let proto = obj_ref(JsObject::new(None));
        let child = JsObject::new(Some(Rc::clone(&proto)));
        assert!(Rc::ptr_eq(child.proto.as_ref().unwrap(), &proto));
    }
}
