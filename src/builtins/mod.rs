//! Built-in objects
//!
//! Prototype population for `Object`, `Array`, `String`, `Number`,
//! `Boolean`, `Function`, `Error` (and subtypes), `RegExp`, plus the
//! `Math`/`JSON` namespaces and global functions. A builtin is an object
//! whose callable slot is a host function over `(this, args, vm)`.

mod array;
mod error;
mod global;
mod json;
mod math;
mod number;
mod object;
mod regexp;
mod string;

use crate::error::VmError;
use crate::runtime::object::{
    obj_ref, BuiltinFn, JsObject, NativeFunction, NativeKind, ObjRef, ObjectKind,
};
use crate::value::Value;
use crate::vm::budget::MemoryBudget;
use std::rc::Rc;

/// The prototype objects of one context.
pub struct Realm {
    pub object_proto: ObjRef,
    pub function_proto: ObjRef,
    pub array_proto: ObjRef,
    pub string_proto: ObjRef,
    pub number_proto: ObjRef,
    pub boolean_proto: ObjRef,
    pub error_proto: ObjRef,
    pub type_error_proto: ObjRef,
    pub range_error_proto: ObjRef,
    pub reference_error_proto: ObjRef,
    pub syntax_error_proto: ObjRef,
    pub regexp_proto: ObjRef,
}

impl Realm {
    /// Prototype for an error kind by its `name`.
    pub fn error_proto_for(&self, name: &str) -> ObjRef {
        let proto = match name {
            "TypeError" => &self.type_error_proto,
            "RangeError" => &self.range_error_proto,
            "ReferenceError" => &self.reference_error_proto,
            "SyntaxError" => &self.syntax_error_proto,
            _ => &self.error_proto,
        };
        Rc::clone(proto)
    }
}

/// Build the realm and a global object populated with the standard
/// builtins.
pub fn install(memory: &MemoryBudget) -> Result<(Rc<Realm>, ObjRef), VmError> {
    // One lump charge for the fixed set of realm objects
    memory.charge(16 * 1024)?;

    let object_proto = obj_ref(JsObject::new(None));
    let function_proto = obj_ref(JsObject::new(Some(Rc::clone(&object_proto))));
    let array_proto = obj_ref(JsObject::new(Some(Rc::clone(&object_proto))));
    let string_proto = obj_ref(JsObject::new(Some(Rc::clone(&object_proto))));
    let number_proto = obj_ref(JsObject::new(Some(Rc::clone(&object_proto))));
    let boolean_proto = obj_ref(JsObject::new(Some(Rc::clone(&object_proto))));
    let error_proto = obj_ref(JsObject::new(Some(Rc::clone(&object_proto))));
    let type_error_proto = obj_ref(JsObject::new(Some(Rc::clone(&error_proto))));
    let range_error_proto = obj_ref(JsObject::new(Some(Rc::clone(&error_proto))));
    let reference_error_proto = obj_ref(JsObject::new(Some(Rc::clone(&error_proto))));
    let syntax_error_proto = obj_ref(JsObject::new(Some(Rc::clone(&error_proto))));
    let regexp_proto = obj_ref(JsObject::new(Some(Rc::clone(&object_proto))));

    let realm = Realm {
        object_proto: Rc::clone(&object_proto),
        function_proto,
        array_proto,
        string_proto,
        number_proto,
        boolean_proto,
        error_proto,
        type_error_proto,
        range_error_proto,
        reference_error_proto,
        syntax_error_proto,
        regexp_proto,
    };

    let global = obj_ref(JsObject::new(Some(object_proto)));

    object::install(&realm, &global);
    array::install(&realm, &global);
    string::install(&realm, &global);
    number::install(&realm, &global);
    math::install(&realm, &global);
    json::install(&realm, &global);
    error::install(&realm, &global);
    regexp::install(&realm, &global);
    global::install(&realm, &global);

    Ok((Rc::new(realm), global))
}

/// Create a native function value.
pub(crate) fn native_fn(realm: &Realm, name: &'static str, f: BuiltinFn) -> Value {
    let obj = JsObject::with_kind(
        Some(Rc::clone(&realm.function_proto)),
        ObjectKind::Native(NativeFunction {
            name,
            kind: NativeKind::Builtin(f),
        }),
    );
    Value::Object(obj_ref(obj))
}

/// Install a method on an object (non-enumerable, like the standard's
/// builtins).
pub(crate) fn define_method(realm: &Realm, target: &ObjRef, name: &'static str, f: BuiltinFn) {
    let func = native_fn(realm, name, f);
    target.borrow_mut().props.set_hidden(Rc::from(name), func);
}

/// Install a non-enumerable data property.
pub(crate) fn define_value(target: &ObjRef, name: &'static str, value: Value) {
    target.borrow_mut().props.set_hidden(Rc::from(name), value);
}

/// Argument accessor: missing arguments read as undefined.
pub(crate) fn arg(args: &[Value], index: usize) -> Value {
    args.get(index).cloned().unwrap_or(Value::Undefined)
}
