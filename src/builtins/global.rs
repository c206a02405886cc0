//! Global functions and remaining namespace objects

use super::{arg, define_method, define_value, number, Realm};
use crate::error::VmError;
use crate::runtime::object::{obj_ref, JsObject, ObjRef};
use crate::value::{to_js_string, to_number, Value};
use crate::vm::interp::Vm;
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

pub(super) fn install(realm: &Realm, global: &ObjRef) {
    // Function.prototype
    let fn_proto = &realm.function_proto;
    define_method(realm, fn_proto, "call", function_call);
    define_method(realm, fn_proto, "apply", function_apply);
    define_method(realm, fn_proto, "toString", function_to_string);

    // Value globals
    define_value(global, "undefined", Value::Undefined);
    define_value(global, "NaN", Value::Number(f64::NAN));
    define_value(global, "Infinity", Value::Number(f64::INFINITY));
    define_value(global, "globalThis", Value::Object(Rc::clone(global)));

    // Function globals
    define_method(realm, global, "parseInt", number::parse_int);
    define_method(realm, global, "parseFloat", number::parse_float);
    define_method(realm, global, "isNaN", global_is_nan);
    define_method(realm, global, "isFinite", global_is_finite);
    define_method(realm, global, "print", print);

    // console.log
    let console = obj_ref(JsObject::new(Some(Rc::clone(&realm.object_proto))));
    define_method(realm, &console, "log", print);
    define_value(global, "console", Value::Object(console));

    // Date.now only; everything else about dates is out of scope
    let date = obj_ref(JsObject::new(Some(Rc::clone(&realm.object_proto))));
    define_method(realm, &date, "now", date_now);
    define_value(global, "Date", Value::Object(date));
}

fn function_call(vm: &mut Vm, this: Value, args: &[Value]) -> Result<Value, VmError> {
    let bound_this = arg(args, 0);
    let rest = if args.is_empty() { &[] } else { &args[1..] };
    vm.call_function(&this, bound_this, rest)
}

fn function_apply(vm: &mut Vm, this: Value, args: &[Value]) -> Result<Value, VmError> {
    let bound_this = arg(args, 0);
    let call_args = match arg(args, 1) {
        Value::Undefined | Value::Null => Vec::new(),
        Value::Object(o) if o.borrow().is_array() => {
            o.borrow().elements().cloned().unwrap_or_default()
        }
        _ => return Err(vm.type_error("apply() arguments must be an array")),
    };
    vm.call_function(&this, bound_this, &call_args)
}

fn function_to_string(vm: &mut Vm, this: Value, _args: &[Value]) -> Result<Value, VmError> {
    vm.alloc_str(&to_js_string(&this))
}

fn global_is_nan(_vm: &mut Vm, _this: Value, args: &[Value]) -> Result<Value, VmError> {
    Ok(Value::Bool(to_number(&arg(args, 0)).is_nan()))
}

fn global_is_finite(_vm: &mut Vm, _this: Value, args: &[Value]) -> Result<Value, VmError> {
    Ok(Value::Bool(to_number(&arg(args, 0)).is_finite()))
}

fn print(_vm: &mut Vm, _this: Value, args: &[Value]) -> Result<Value, VmError> {
    let line = args
        .iter()
        .map(to_js_string)
        .collect::<Vec<_>>()
        .join(" ");
    println!("{}", line);
    Ok(Value::Undefined)
}

fn date_now(_vm: &mut Vm, _this: Value, _args: &[Value]) -> Result<Value, VmError> {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as f64)
        .unwrap_or(0.0);
    Ok(Value::Number(millis))
}
