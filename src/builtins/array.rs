//! `Array` constructor and `Array.prototype`

use super::{arg, define_method, define_value, native_fn, Realm};
use crate::error::VmError;
use crate::runtime::object::ObjRef;
use crate::value::{strict_equals, to_js_string, to_number, Value};
use crate::vm::interp::Vm;
use std::rc::Rc;

pub(super) fn install(realm: &Realm, global: &ObjRef) {
    let proto = &realm.array_proto;
    define_method(realm, proto, "push", push);
    define_method(realm, proto, "pop", pop);
    define_method(realm, proto, "shift", shift);
    define_method(realm, proto, "unshift", unshift);
    define_method(realm, proto, "join", join);
    define_method(realm, proto, "indexOf", index_of);
    define_method(realm, proto, "lastIndexOf", last_index_of);
    define_method(realm, proto, "includes", includes);
    define_method(realm, proto, "slice", slice);
    define_method(realm, proto, "concat", concat);
    define_method(realm, proto, "reverse", reverse);
    define_method(realm, proto, "map", map);
    define_method(realm, proto, "filter", filter);
    define_method(realm, proto, "forEach", for_each);
    define_method(realm, proto, "reduce", reduce);
    define_method(realm, proto, "find", find);
    define_method(realm, proto, "findIndex", find_index);
    define_method(realm, proto, "some", some);
    define_method(realm, proto, "every", every);
    define_method(realm, proto, "toString", to_string);

    let ctor = native_fn(realm, "Array", array_ctor);
    if let Value::Object(ctor_obj) = &ctor {
        define_value(ctor_obj, "prototype", Value::Object(Rc::clone(proto)));
        define_method(realm, ctor_obj, "isArray", is_array);
    }
    define_value(global, "Array", ctor);
}

/// The receiver as an array reference, or a TypeError.
fn this_array(vm: &mut Vm, this: &Value) -> Result<ObjRef, VmError> {
    match this {
        Value::Object(obj) if obj.borrow().is_array() => Ok(Rc::clone(obj)),
        _ => Err(vm.type_error("receiver is not an array")),
    }
}

fn elements(arr: &ObjRef) -> Vec<Value> {
    arr.borrow().elements().cloned().unwrap_or_default()
}

/// Relative index clamped into [0, len]: negative counts from the end.
fn clamp_index(value: &Value, len: usize) -> usize {
    let n = to_number(value);
    if n.is_nan() {
        return 0;
    }
    if n < 0.0 {
        let back = (-n) as usize;
        len.saturating_sub(back)
    } else {
        (n as usize).min(len)
    }
}

fn array_ctor(vm: &mut Vm, _this: Value, args: &[Value]) -> Result<Value, VmError> {
    if args.len() == 1 {
        if let Value::Number(n) = &args[0] {
            if n.fract() != 0.0 || *n < 0.0 || *n > u32::MAX as f64 {
                return Err(vm.range_error("invalid array length"));
            }
            return vm.new_array_value(vec![Value::Undefined; *n as usize]);
        }
    }
    vm.new_array_value(args.to_vec())
}

fn is_array(_vm: &mut Vm, _this: Value, args: &[Value]) -> Result<Value, VmError> {
    let is = matches!(&arg(args, 0), Value::Object(o) if o.borrow().is_array());
    Ok(Value::Bool(is))
}

fn push(vm: &mut Vm, this: Value, args: &[Value]) -> Result<Value, VmError> {
    let arr = this_array(vm, &this)?;
    vm.budget
        .memory
        .charge(args.len() * std::mem::size_of::<Value>())?;
    let mut b = arr.borrow_mut();
    let elements = b.elements_mut().expect("array");
    elements.extend_from_slice(args);
    Ok(Value::Number(elements.len() as f64))
}

fn pop(vm: &mut Vm, this: Value, _args: &[Value]) -> Result<Value, VmError> {
    let arr = this_array(vm, &this)?;
    let mut b = arr.borrow_mut();
    Ok(b.elements_mut()
        .expect("array")
        .pop()
        .unwrap_or(Value::Undefined))
}

fn shift(vm: &mut Vm, this: Value, _args: &[Value]) -> Result<Value, VmError> {
    let arr = this_array(vm, &this)?;
    let mut b = arr.borrow_mut();
    let elements = b.elements_mut().expect("array");
    if elements.is_empty() {
        Ok(Value::Undefined)
    } else {
        Ok(elements.remove(0))
    }
}

fn unshift(vm: &mut Vm, this: Value, args: &[Value]) -> Result<Value, VmError> {
    let arr = this_array(vm, &this)?;
    vm.budget
        .memory
        .charge(args.len() * std::mem::size_of::<Value>())?;
    let mut b = arr.borrow_mut();
    let elements = b.elements_mut().expect("array");
    for (i, v) in args.iter().enumerate() {
        elements.insert(i, v.clone());
    }
    Ok(Value::Number(elements.len() as f64))
}

fn join(vm: &mut Vm, this: Value, args: &[Value]) -> Result<Value, VmError> {
    let arr = this_array(vm, &this)?;
    let sep = match arg(args, 0) {
        Value::Undefined => ",".to_string(),
        v => to_js_string(&v),
    };
    let parts: Vec<String> = elements(&arr)
        .iter()
        .map(|v| {
            if v.is_nullish() {
                String::new()
            } else {
                to_js_string(v)
            }
        })
        .collect();
    vm.alloc_str(&parts.join(&sep))
}

fn to_string(vm: &mut Vm, this: Value, _args: &[Value]) -> Result<Value, VmError> {
    join(vm, this, &[])
}

fn index_of(vm: &mut Vm, this: Value, args: &[Value]) -> Result<Value, VmError> {
    let arr = this_array(vm, &this)?;
    let needle = arg(args, 0);
    let items = elements(&arr);
    let start = if args.len() > 1 {
        clamp_index(&args[1], items.len())
    } else {
        0
    };
    for (i, v) in items.iter().enumerate().skip(start) {
        if strict_equals(v, &needle) {
            return Ok(Value::Number(i as f64));
        }
    }
    Ok(Value::Number(-1.0))
}

fn last_index_of(vm: &mut Vm, this: Value, args: &[Value]) -> Result<Value, VmError> {
    let arr = this_array(vm, &this)?;
    let needle = arg(args, 0);
    let items = elements(&arr);
    for (i, v) in items.iter().enumerate().rev() {
        if strict_equals(v, &needle) {
            return Ok(Value::Number(i as f64));
        }
    }
    Ok(Value::Number(-1.0))
}

fn includes(vm: &mut Vm, this: Value, args: &[Value]) -> Result<Value, VmError> {
    let arr = this_array(vm, &this)?;
    let needle = arg(args, 0);
    let found = elements(&arr).iter().any(|v| {
        // SameValueZero: NaN finds NaN
        strict_equals(v, &needle)
            || matches!((v, &needle), (Value::Number(a), Value::Number(b)) if a.is_nan() && b.is_nan())
    });
    Ok(Value::Bool(found))
}

fn slice(vm: &mut Vm, this: Value, args: &[Value]) -> Result<Value, VmError> {
    let arr = this_array(vm, &this)?;
    let items = elements(&arr);
    let start = if args.is_empty() {
        0
    } else {
        clamp_index(&args[0], items.len())
    };
    let end = match args.get(1) {
        None | Some(Value::Undefined) => items.len(),
        Some(v) => clamp_index(v, items.len()),
    };
    let out = if start < end {
        items[start..end].to_vec()
    } else {
        Vec::new()
    };
    vm.new_array_value(out)
}

fn concat(vm: &mut Vm, this: Value, args: &[Value]) -> Result<Value, VmError> {
    let arr = this_array(vm, &this)?;
    let mut out = elements(&arr);
    for a in args {
        match a {
            Value::Object(o) if o.borrow().is_array() => {
                out.extend(o.borrow().elements().cloned().unwrap_or_default());
            }
            v => out.push(v.clone()),
        }
    }
    vm.new_array_value(out)
}

fn reverse(vm: &mut Vm, this: Value, _args: &[Value]) -> Result<Value, VmError> {
    let arr = this_array(vm, &this)?;
    arr.borrow_mut().elements_mut().expect("array").reverse();
    Ok(this)
}

/// Shared driver for the callback iterators.
fn each<F>(vm: &mut Vm, this: &Value, args: &[Value], mut f: F) -> Result<(), VmError>
where
    F: FnMut(&mut Vm, Value, usize) -> Result<bool, VmError>,
{
    let arr = this_array(vm, this)?;
    let callback = arg(args, 0);
    if !callback.is_callable() {
        return Err(vm.type_error("callback is not a function"));
    }
    let items = elements(&arr);
    for (i, item) in items.into_iter().enumerate() {
        let keep_going = {
            let call_args = [item.clone(), Value::Number(i as f64), this.clone()];
            let result = vm.call_function(&callback, Value::Undefined, &call_args)?;
            f(vm, result, i)?
        };
        if !keep_going {
            break;
        }
    }
    Ok(())
}

fn map(vm: &mut Vm, this: Value, args: &[Value]) -> Result<Value, VmError> {
    let mut out = Vec::new();
    each(vm, &this, args, |_vm, result, _i| {
        out.push(result);
        Ok(true)
    })?;
    vm.new_array_value(out)
}

fn filter(vm: &mut Vm, this: Value, args: &[Value]) -> Result<Value, VmError> {
    let arr = this_array(vm, &this)?;
    let items = elements(&arr);
    let mut out = Vec::new();
    each(vm, &this, args, |_vm, result, i| {
        if crate::value::to_boolean(&result) {
            out.push(items[i].clone());
        }
        Ok(true)
    })?;
    vm.new_array_value(out)
}

fn for_each(vm: &mut Vm, this: Value, args: &[Value]) -> Result<Value, VmError> {
    each(vm, &this, args, |_vm, _result, _i| Ok(true))?;
    Ok(Value::Undefined)
}

fn reduce(vm: &mut Vm, this: Value, args: &[Value]) -> Result<Value, VmError> {
    let arr = this_array(vm, &this)?;
    let callback = arg(args, 0);
    if !callback.is_callable() {
        return Err(vm.type_error("callback is not a function"));
    }
    let items = elements(&arr);
    let mut iter = items.into_iter().enumerate();
    let mut acc = match args.get(1) {
        Some(initial) => initial.clone(),
        None => match iter.next() {
            Some((_, first)) => first,
            None => return Err(vm.type_error("reduce of empty array with no initial value")),
        },
    };
    for (i, item) in iter {
        let call_args = [acc, item, Value::Number(i as f64), this.clone()];
        acc = vm.call_function(&callback, Value::Undefined, &call_args)?;
    }
    Ok(acc)
}

fn find(vm: &mut Vm, this: Value, args: &[Value]) -> Result<Value, VmError> {
    let arr = this_array(vm, &this)?;
    let items = elements(&arr);
    let mut found = Value::Undefined;
    each(vm, &this, args, |_vm, result, i| {
        if crate::value::to_boolean(&result) {
            found = items[i].clone();
            return Ok(false);
        }
        Ok(true)
    })?;
    Ok(found)
}

fn find_index(vm: &mut Vm, this: Value, args: &[Value]) -> Result<Value, VmError> {
    let mut found = -1.0;
    each(vm, &this, args, |_vm, result, i| {
        if crate::value::to_boolean(&result) {
            found = i as f64;
            return Ok(false);
        }
        Ok(true)
    })?;
    Ok(Value::Number(found))
}

fn some(vm: &mut Vm, this: Value, args: &[Value]) -> Result<Value, VmError> {
    let mut any = false;
    each(vm, &this, args, |_vm, result, _i| {
        if crate::value::to_boolean(&result) {
            any = true;
            return Ok(false);
        }
        Ok(true)
    })?;
    Ok(Value::Bool(any))
}

fn every(vm: &mut Vm, this: Value, args: &[Value]) -> Result<Value, VmError> {
    let mut all = true;
    each(vm, &this, args, |_vm, result, _i| {
        if !crate::value::to_boolean(&result) {
            all = false;
            return Ok(false);
        }
        Ok(true)
    })?;
    Ok(Value::Bool(all))
}
