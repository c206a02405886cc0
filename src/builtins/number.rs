//! `Number` constructor, statics, and `Number.prototype`

use super::{arg, define_method, define_value, native_fn, Realm};
use crate::error::VmError;
use crate::runtime::object::ObjRef;
use crate::util::dtoa;
use crate::value::{to_js_string, to_number, Value};
use crate::vm::interp::Vm;
use std::rc::Rc;

pub(super) fn install(realm: &Realm, global: &ObjRef) {
    let proto = &realm.number_proto;
    define_method(realm, proto, "toFixed", to_fixed);
    define_method(realm, proto, "toString", number_to_string);

    let ctor = native_fn(realm, "Number", number_ctor);
    if let Value::Object(ctor_obj) = &ctor {
        define_value(ctor_obj, "prototype", Value::Object(Rc::clone(proto)));
        define_method(realm, ctor_obj, "isNaN", is_nan);
        define_method(realm, ctor_obj, "isFinite", is_finite);
        define_method(realm, ctor_obj, "isInteger", is_integer);
        define_method(realm, ctor_obj, "parseInt", parse_int);
        define_method(realm, ctor_obj, "parseFloat", parse_float);
        define_value(ctor_obj, "MAX_SAFE_INTEGER", Value::Number(9007199254740991.0));
        define_value(ctor_obj, "MIN_SAFE_INTEGER", Value::Number(-9007199254740991.0));
        define_value(ctor_obj, "EPSILON", Value::Number(f64::EPSILON));
        define_value(ctor_obj, "NaN", Value::Number(f64::NAN));
        define_value(ctor_obj, "POSITIVE_INFINITY", Value::Number(f64::INFINITY));
        define_value(ctor_obj, "NEGATIVE_INFINITY", Value::Number(f64::NEG_INFINITY));
    }
    define_value(global, "Number", ctor);

    // Boolean is installed here as well: it shares the shape and has no
    // methods beyond toString
    let bool_proto = &realm.boolean_proto;
    define_method(realm, bool_proto, "toString", boolean_to_string);
    let bool_ctor = native_fn(realm, "Boolean", boolean_ctor);
    if let Value::Object(ctor_obj) = &bool_ctor {
        define_value(ctor_obj, "prototype", Value::Object(Rc::clone(bool_proto)));
    }
    define_value(global, "Boolean", bool_ctor);
}

fn number_ctor(_vm: &mut Vm, _this: Value, args: &[Value]) -> Result<Value, VmError> {
    Ok(Value::Number(match args.first() {
        None => 0.0,
        Some(v) => to_number(v),
    }))
}

fn boolean_ctor(_vm: &mut Vm, _this: Value, args: &[Value]) -> Result<Value, VmError> {
    Ok(Value::Bool(crate::value::to_boolean(&arg(args, 0))))
}

fn boolean_to_string(_vm: &mut Vm, this: Value, _args: &[Value]) -> Result<Value, VmError> {
    Ok(Value::string(&to_js_string(&this)))
}

fn is_nan(_vm: &mut Vm, _this: Value, args: &[Value]) -> Result<Value, VmError> {
    Ok(Value::Bool(
        matches!(arg(args, 0), Value::Number(n) if n.is_nan()),
    ))
}

fn is_finite(_vm: &mut Vm, _this: Value, args: &[Value]) -> Result<Value, VmError> {
    Ok(Value::Bool(
        matches!(arg(args, 0), Value::Number(n) if n.is_finite()),
    ))
}

fn is_integer(_vm: &mut Vm, _this: Value, args: &[Value]) -> Result<Value, VmError> {
    Ok(Value::Bool(
        matches!(arg(args, 0), Value::Number(n) if n.is_finite() && n.fract() == 0.0),
    ))
}

fn to_fixed(vm: &mut Vm, this: Value, args: &[Value]) -> Result<Value, VmError> {
    let n = to_number(&this);
    let digits = to_number(&arg(args, 0));
    if !(0.0..=100.0).contains(&digits) {
        return Err(vm.range_error("toFixed() digits argument out of range"));
    }
    vm.alloc_str(&dtoa::f64_to_fixed(n, digits as u32))
}

fn number_to_string(vm: &mut Vm, this: Value, args: &[Value]) -> Result<Value, VmError> {
    let n = to_number(&this);
    match args.first() {
        None | Some(Value::Undefined) => vm.alloc_str(&dtoa::f64_to_js_string(n)),
        Some(radix_arg) => {
            let radix = to_number(radix_arg);
            if !(2.0..=36.0).contains(&radix) {
                return Err(vm.range_error("toString() radix must be between 2 and 36"));
            }
            let radix = radix as u32;
            if radix == 10 {
                return vm.alloc_str(&dtoa::f64_to_js_string(n));
            }
            if !n.is_finite() {
                return vm.alloc_str(&dtoa::f64_to_js_string(n));
            }
            // Integer part only for non-decimal radixes; fractions are a
            // non-goal here
            let negative = n < 0.0;
            let mut int = n.abs().trunc() as u64;
            const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
            let mut buf = Vec::new();
            loop {
                buf.push(DIGITS[(int % radix as u64) as usize]);
                int /= radix as u64;
                if int == 0 {
                    break;
                }
            }
            if negative {
                buf.push(b'-');
            }
            buf.reverse();
            vm.alloc_str(std::str::from_utf8(&buf).unwrap_or("0"))
        }
    }
}

/// `parseInt(string, radix)` per the standard grammar: leading whitespace
/// and sign, optional 0x prefix, then digits of the radix.
pub(super) fn parse_int(_vm: &mut Vm, _this: Value, args: &[Value]) -> Result<Value, VmError> {
    let text = to_js_string(&arg(args, 0));
    let text = text.trim();
    let mut radix = to_number(&arg(args, 1)) as i64;

    let (sign, mut body) = match text.as_bytes().first() {
        Some(b'-') => (-1.0, &text[1..]),
        Some(b'+') => (1.0, &text[1..]),
        _ => (1.0, text),
    };

    if radix == 0 {
        if body.starts_with("0x") || body.starts_with("0X") {
            radix = 16;
            body = &body[2..];
        } else {
            radix = 10;
        }
    } else if radix == 16 && (body.starts_with("0x") || body.starts_with("0X")) {
        body = &body[2..];
    }
    if !(2..=36).contains(&radix) {
        return Ok(Value::Number(f64::NAN));
    }

    let mut value: f64 = 0.0;
    let mut any = false;
    for c in body.chars() {
        match c.to_digit(radix as u32) {
            Some(d) => {
                value = value * radix as f64 + d as f64;
                any = true;
            }
            None => break,
        }
    }
    if !any {
        return Ok(Value::Number(f64::NAN));
    }
    Ok(Value::Number(sign * value))
}

/// `parseFloat(string)`: longest valid decimal prefix.
pub(super) fn parse_float(_vm: &mut Vm, _this: Value, args: &[Value]) -> Result<Value, VmError> {
    let text = to_js_string(&arg(args, 0));
    let text = text.trim();
    let bytes = text.as_bytes();
    let mut end = 0;
    let mut seen_dot = false;
    let mut seen_exp = false;
    let mut seen_digit = false;
    if matches!(bytes.first(), Some(b'+') | Some(b'-')) {
        end = 1;
    }
    if text[end..].starts_with("Infinity") {
        let sign = if bytes.first() == Some(&b'-') { -1.0 } else { 1.0 };
        return Ok(Value::Number(sign * f64::INFINITY));
    }
    while end < bytes.len() {
        match bytes[end] {
            b'0'..=b'9' => seen_digit = true,
            b'.' if !seen_dot && !seen_exp => seen_dot = true,
            b'e' | b'E' if seen_digit && !seen_exp => {
                seen_exp = true;
                if matches!(bytes.get(end + 1), Some(b'+') | Some(b'-'))
                    && bytes.get(end + 2).is_some_and(|b| b.is_ascii_digit())
                {
                    end += 1;
                } else if !bytes.get(end + 1).is_some_and(|b| b.is_ascii_digit()) {
                    break;
                }
            }
            _ => break,
        }
        end += 1;
    }
    if !seen_digit {
        return Ok(Value::Number(f64::NAN));
    }
    Ok(Value::Number(text[..end].parse().unwrap_or(f64::NAN)))
}
