//! `Object` constructor, statics, and `Object.prototype`

use super::{arg, define_method, define_value, native_fn, Realm};
use crate::error::VmError;
use crate::runtime::object::{ObjRef, ObjectKind};
use crate::value::{to_js_string, Value};
use crate::vm::interp::Vm;
use std::rc::Rc;

pub(super) fn install(realm: &Realm, global: &ObjRef) {
    let proto = &realm.object_proto;
    define_method(realm, proto, "hasOwnProperty", has_own_property);
    define_method(realm, proto, "toString", object_to_string);

    let ctor = native_fn(realm, "Object", object_ctor);
    if let Value::Object(ctor_obj) = &ctor {
        define_value(ctor_obj, "prototype", Value::Object(Rc::clone(proto)));
        define_method(realm, ctor_obj, "keys", object_keys);
        define_method(realm, ctor_obj, "values", object_values);
        define_method(realm, ctor_obj, "entries", object_entries);
        define_method(realm, ctor_obj, "assign", object_assign);
        define_method(realm, ctor_obj, "getPrototypeOf", object_get_prototype_of);
        define_method(realm, ctor_obj, "create", object_create);
    }
    define_value(global, "Object", ctor);
}

fn object_ctor(vm: &mut Vm, _this: Value, args: &[Value]) -> Result<Value, VmError> {
    match arg(args, 0) {
        Value::Undefined | Value::Null => Ok(Value::Object(vm.new_plain_object()?)),
        v => Ok(v),
    }
}

fn has_own_property(_vm: &mut Vm, this: Value, args: &[Value]) -> Result<Value, VmError> {
    let key = to_js_string(&arg(args, 0));
    match &this {
        Value::Object(obj) => {
            let b = obj.borrow();
            let found = b.props.has(&key)
                || match (b.elements(), key.parse::<usize>()) {
                    (Some(els), Ok(idx)) => idx < els.len(),
                    _ => false,
                };
            Ok(Value::Bool(found))
        }
        Value::String(s) => Ok(Value::Bool(
            key == "length" || key.parse::<usize>().is_ok_and(|i| i < s.len()),
        )),
        _ => Ok(Value::Bool(false)),
    }
}

fn object_to_string(_vm: &mut Vm, this: Value, _args: &[Value]) -> Result<Value, VmError> {
    let tag = match &this {
        Value::Object(obj) => match obj.borrow().kind {
            ObjectKind::Array(_) => "[object Array]",
            ObjectKind::Closure(_) | ObjectKind::Native(_) => "[object Function]",
            ObjectKind::Error => "[object Error]",
            ObjectKind::Regexp(_) => "[object RegExp]",
            _ => "[object Object]",
        },
        Value::Null => "[object Null]",
        Value::Undefined => "[object Undefined]",
        _ => "[object Object]",
    };
    Ok(Value::string(tag))
}

/// Own enumerable keys of an object, array indices included.
fn own_keys(target: &Value) -> Vec<String> {
    let mut keys = Vec::new();
    if let Value::Object(obj) = target {
        let b = obj.borrow();
        if let Some(elements) = b.elements() {
            for i in 0..elements.len() {
                keys.push(i.to_string());
            }
        }
        for key in b.props.keys() {
            keys.push(key.to_string());
        }
    }
    keys
}

fn object_keys(vm: &mut Vm, _this: Value, args: &[Value]) -> Result<Value, VmError> {
    let target = arg(args, 0);
    let mut out = Vec::new();
    for key in own_keys(&target) {
        out.push(vm.alloc_str(&key)?);
    }
    vm.new_array_value(out)
}

fn object_values(vm: &mut Vm, _this: Value, args: &[Value]) -> Result<Value, VmError> {
    let target = arg(args, 0);
    let mut out = Vec::new();
    for key in own_keys(&target) {
        out.push(vm.get_property(&target, &key)?);
    }
    vm.new_array_value(out)
}

fn object_entries(vm: &mut Vm, _this: Value, args: &[Value]) -> Result<Value, VmError> {
    let target = arg(args, 0);
    let mut out = Vec::new();
    for key in own_keys(&target) {
        let value = vm.get_property(&target, &key)?;
        let key_val = vm.alloc_str(&key)?;
        let pair = vm.new_array_value(vec![key_val, value])?;
        out.push(pair);
    }
    vm.new_array_value(out)
}

fn object_assign(vm: &mut Vm, _this: Value, args: &[Value]) -> Result<Value, VmError> {
    let target = arg(args, 0);
    if !target.is_object() {
        return Err(vm.type_error("Object.assign target must be an object"));
    }
    for source in args.iter().skip(1) {
        for key in own_keys(source) {
            let value = vm.get_property(source, &key)?;
            vm.set_property(&target, &key, value)?;
        }
    }
    Ok(target)
}

fn object_get_prototype_of(vm: &mut Vm, _this: Value, args: &[Value]) -> Result<Value, VmError> {
    match arg(args, 0) {
        Value::Object(obj) => {
            let proto = obj.borrow().proto.clone();
            Ok(proto.map(Value::Object).unwrap_or(Value::Null))
        }
        Value::String(_) => Ok(Value::Object(Rc::clone(&vm.realm.string_proto))),
        Value::Number(_) => Ok(Value::Object(Rc::clone(&vm.realm.number_proto))),
        Value::Bool(_) => Ok(Value::Object(Rc::clone(&vm.realm.boolean_proto))),
        _ => Err(vm.type_error("cannot read prototype of undefined or null")),
    }
}

fn object_create(vm: &mut Vm, _this: Value, args: &[Value]) -> Result<Value, VmError> {
    let proto = match arg(args, 0) {
        Value::Object(p) => Some(p),
        Value::Null => None,
        _ => return Err(vm.type_error("Object.create prototype must be an object or null")),
    };
    let obj = vm.new_object_with(proto, ObjectKind::Plain)?;
    Ok(Value::Object(obj))
}
