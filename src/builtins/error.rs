//! `Error` constructors and `Error.prototype`

use super::{arg, define_method, define_value, native_fn, Realm};
use crate::error::VmError;
use crate::runtime::object::{obj_ref, JsObject, ObjRef, ObjectKind};
use crate::value::{to_js_string, Value};
use crate::vm::interp::Vm;
use std::rc::Rc;

pub(super) fn install(realm: &Realm, global: &ObjRef) {
    define_value(&realm.error_proto, "name", Value::string("Error"));
    define_value(&realm.error_proto, "message", Value::string(""));
    define_method(realm, &realm.error_proto, "toString", error_to_string);

    install_ctor(realm, global, "Error", &realm.error_proto, error_ctor);
    install_ctor(
        realm,
        global,
        "TypeError",
        &realm.type_error_proto,
        type_error_ctor,
    );
    install_ctor(
        realm,
        global,
        "RangeError",
        &realm.range_error_proto,
        range_error_ctor,
    );
    install_ctor(
        realm,
        global,
        "ReferenceError",
        &realm.reference_error_proto,
        reference_error_ctor,
    );
    install_ctor(
        realm,
        global,
        "SyntaxError",
        &realm.syntax_error_proto,
        syntax_error_ctor,
    );
}

fn install_ctor(
    realm: &Realm,
    global: &ObjRef,
    name: &'static str,
    proto: &ObjRef,
    ctor_fn: crate::runtime::object::BuiltinFn,
) {
    define_value(proto, "name", Value::string(name));
    let ctor = native_fn(realm, name, ctor_fn);
    if let Value::Object(ctor_obj) = &ctor {
        define_value(ctor_obj, "prototype", Value::Object(Rc::clone(proto)));
        proto
            .borrow_mut()
            .props
            .set_hidden(Rc::from("constructor"), ctor.clone());
    }
    define_value(global, name, ctor);
}

fn construct_error(vm: &mut Vm, name: &str, args: &[Value]) -> Result<Value, VmError> {
    let proto = vm.realm.error_proto_for(name);
    let mut obj = JsObject::with_kind(Some(proto), ObjectKind::Error);
    vm.budget.memory.charge(obj.base_byte_size())?;
    match arg(args, 0) {
        Value::Undefined => {}
        message => {
            obj.props
                .set(Rc::from("message"), Value::string(&to_js_string(&message)));
        }
    }
    Ok(Value::Object(obj_ref(obj)))
}

fn error_ctor(vm: &mut Vm, _this: Value, args: &[Value]) -> Result<Value, VmError> {
    construct_error(vm, "Error", args)
}

fn type_error_ctor(vm: &mut Vm, _this: Value, args: &[Value]) -> Result<Value, VmError> {
    construct_error(vm, "TypeError", args)
}

fn range_error_ctor(vm: &mut Vm, _this: Value, args: &[Value]) -> Result<Value, VmError> {
    construct_error(vm, "RangeError", args)
}

fn reference_error_ctor(vm: &mut Vm, _this: Value, args: &[Value]) -> Result<Value, VmError> {
    construct_error(vm, "ReferenceError", args)
}

fn syntax_error_ctor(vm: &mut Vm, _this: Value, args: &[Value]) -> Result<Value, VmError> {
    construct_error(vm, "SyntaxError", args)
}

fn error_to_string(vm: &mut Vm, this: Value, _args: &[Value]) -> Result<Value, VmError> {
    let name = match vm.get_property(&this, "name")? {
        Value::Undefined => "Error".to_string(),
        v => to_js_string(&v),
    };
    let message = match vm.get_property(&this, "message")? {
        Value::Undefined => String::new(),
        v => to_js_string(&v),
    };
    let rendered = if message.is_empty() {
        name
    } else if name.is_empty() {
        message
    } else {
        format!("{}: {}", name, message)
    };
    vm.alloc_str(&rendered)
}
