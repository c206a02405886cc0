//! `String` constructor and `String.prototype`

use super::{arg, define_method, define_value, native_fn, Realm};
use crate::error::VmError;
use crate::runtime::object::{ObjRef, ObjectKind};
use crate::runtime::string::JsString;
use crate::value::{to_js_string, to_number, Value};
use crate::vm::interp::Vm;
use std::rc::Rc;

pub(super) fn install(realm: &Realm, global: &ObjRef) {
    let proto = &realm.string_proto;
    define_method(realm, proto, "charAt", char_at);
    define_method(realm, proto, "charCodeAt", char_code_at);
    define_method(realm, proto, "indexOf", index_of);
    define_method(realm, proto, "lastIndexOf", last_index_of);
    define_method(realm, proto, "substring", substring);
    define_method(realm, proto, "slice", slice);
    define_method(realm, proto, "split", split);
    define_method(realm, proto, "toLowerCase", to_lower_case);
    define_method(realm, proto, "toUpperCase", to_upper_case);
    define_method(realm, proto, "trim", trim);
    define_method(realm, proto, "concat", concat);
    define_method(realm, proto, "repeat", repeat);
    define_method(realm, proto, "startsWith", starts_with);
    define_method(realm, proto, "endsWith", ends_with);
    define_method(realm, proto, "includes", includes);
    define_method(realm, proto, "replace", replace);
    define_method(realm, proto, "toString", to_string_method);

    let ctor = native_fn(realm, "String", string_ctor);
    if let Value::Object(ctor_obj) = &ctor {
        define_value(ctor_obj, "prototype", Value::Object(Rc::clone(proto)));
        define_method(realm, ctor_obj, "fromCharCode", from_char_code);
    }
    define_value(global, "String", ctor);
}

/// The receiver coerced to a string.
fn this_string(this: &Value) -> Rc<JsString> {
    match this {
        Value::String(s) => Rc::clone(s),
        v => Rc::new(JsString::from_str(&to_js_string(v))),
    }
}

/// Code-unit index from an argument, clamped into [0, len].
fn clamp_index(value: &Value, len: usize) -> usize {
    let n = to_number(value);
    if n.is_nan() {
        return 0;
    }
    if n < 0.0 {
        len.saturating_sub((-n) as usize)
    } else {
        (n as usize).min(len)
    }
}

fn string_ctor(vm: &mut Vm, _this: Value, args: &[Value]) -> Result<Value, VmError> {
    match args.first() {
        None => Ok(Value::string("")),
        Some(v) => vm.alloc_str(&to_js_string(v)),
    }
}

fn from_char_code(vm: &mut Vm, _this: Value, args: &[Value]) -> Result<Value, VmError> {
    let units: Vec<u16> = args.iter().map(|v| to_number(v) as i64 as u16).collect();
    vm.new_string_value(JsString::from_units(units))
}

fn to_string_method(_vm: &mut Vm, this: Value, _args: &[Value]) -> Result<Value, VmError> {
    Ok(Value::String(this_string(&this)))
}

fn char_at(vm: &mut Vm, this: Value, args: &[Value]) -> Result<Value, VmError> {
    let s = this_string(&this);
    let idx = to_number(&arg(args, 0));
    if idx < 0.0 || idx.is_nan() {
        return Ok(Value::string(""));
    }
    match s.char_at(idx as usize) {
        Some(c) => vm.new_string_value(c),
        None => Ok(Value::string("")),
    }
}

fn char_code_at(_vm: &mut Vm, this: Value, args: &[Value]) -> Result<Value, VmError> {
    let s = this_string(&this);
    let idx = to_number(&arg(args, 0));
    if idx < 0.0 || idx.is_nan() {
        return Ok(Value::Number(f64::NAN));
    }
    Ok(match s.char_code_at(idx as usize) {
        Some(u) => Value::Number(u as f64),
        None => Value::Number(f64::NAN),
    })
}

fn index_of(_vm: &mut Vm, this: Value, args: &[Value]) -> Result<Value, VmError> {
    let s = this_string(&this);
    let needle = JsString::from_str(&to_js_string(&arg(args, 0)));
    let from = clamp_index(&arg(args, 1), s.len());
    Ok(Value::Number(
        s.index_of(&needle, from).map(|i| i as f64).unwrap_or(-1.0),
    ))
}

fn last_index_of(_vm: &mut Vm, this: Value, args: &[Value]) -> Result<Value, VmError> {
    let s = this_string(&this);
    let needle = JsString::from_str(&to_js_string(&arg(args, 0)));
    Ok(Value::Number(
        s.last_index_of(&needle, s.len())
            .map(|i| i as f64)
            .unwrap_or(-1.0),
    ))
}

fn substring(vm: &mut Vm, this: Value, args: &[Value]) -> Result<Value, VmError> {
    let s = this_string(&this);
    let mut a = clamp_index(&arg(args, 0), s.len());
    let mut b = match args.get(1) {
        None | Some(Value::Undefined) => s.len(),
        Some(v) => clamp_index(v, s.len()),
    };
    // substring swaps out-of-order bounds
    if a > b {
        std::mem::swap(&mut a, &mut b);
    }
    vm.new_string_value(s.substring(a, b))
}

fn slice(vm: &mut Vm, this: Value, args: &[Value]) -> Result<Value, VmError> {
    let s = this_string(&this);
    let a = clamp_index(&arg(args, 0), s.len());
    let b = match args.get(1) {
        None | Some(Value::Undefined) => s.len(),
        Some(v) => clamp_index(v, s.len()),
    };
    if a >= b {
        return Ok(Value::string(""));
    }
    vm.new_string_value(s.substring(a, b))
}

fn to_lower_case(vm: &mut Vm, this: Value, _args: &[Value]) -> Result<Value, VmError> {
    let s = this_string(&this);
    vm.new_string_value(s.to_lower())
}

fn to_upper_case(vm: &mut Vm, this: Value, _args: &[Value]) -> Result<Value, VmError> {
    let s = this_string(&this);
    vm.new_string_value(s.to_upper())
}

fn trim(vm: &mut Vm, this: Value, _args: &[Value]) -> Result<Value, VmError> {
    let s = this_string(&this);
    vm.new_string_value(s.trim())
}

fn concat(vm: &mut Vm, this: Value, args: &[Value]) -> Result<Value, VmError> {
    let mut s = (*this_string(&this)).clone();
    for a in args {
        s = s.concat(&JsString::from_str(&to_js_string(a)));
    }
    vm.new_string_value(s)
}

fn repeat(vm: &mut Vm, this: Value, args: &[Value]) -> Result<Value, VmError> {
    let s = this_string(&this);
    let count = to_number(&arg(args, 0));
    if count < 0.0 || !count.is_finite() {
        return Err(vm.range_error("invalid repeat count"));
    }
    let count = count as usize;
    vm.budget.memory.charge(s.byte_size().saturating_mul(count))?;
    let mut units = Vec::with_capacity(s.len() * count);
    for _ in 0..count {
        units.extend_from_slice(s.units());
    }
    vm.new_string_value(JsString::from_units(units))
}

fn starts_with(_vm: &mut Vm, this: Value, args: &[Value]) -> Result<Value, VmError> {
    let s = this_string(&this);
    let needle = JsString::from_str(&to_js_string(&arg(args, 0)));
    let at = clamp_index(&arg(args, 1), s.len());
    Ok(Value::Bool(s.starts_with_at(&needle, at)))
}

fn ends_with(_vm: &mut Vm, this: Value, args: &[Value]) -> Result<Value, VmError> {
    let s = this_string(&this);
    let needle = JsString::from_str(&to_js_string(&arg(args, 0)));
    let end = match args.get(1) {
        None | Some(Value::Undefined) => s.len(),
        Some(v) => clamp_index(v, s.len()),
    };
    if needle.len() > end {
        return Ok(Value::Bool(false));
    }
    Ok(Value::Bool(s.starts_with_at(&needle, end - needle.len())))
}

fn includes(_vm: &mut Vm, this: Value, args: &[Value]) -> Result<Value, VmError> {
    let s = this_string(&this);
    let needle = JsString::from_str(&to_js_string(&arg(args, 0)));
    let from = clamp_index(&arg(args, 1), s.len());
    Ok(Value::Bool(s.index_of(&needle, from).is_some()))
}

fn split(vm: &mut Vm, this: Value, args: &[Value]) -> Result<Value, VmError> {
    let s = this_string(&this);
    let limit = match args.get(1) {
        None | Some(Value::Undefined) => usize::MAX,
        Some(v) => to_number(v) as usize,
    };

    let mut out: Vec<Value> = Vec::new();
    match arg(args, 0) {
        Value::Undefined => {
            out.push(Value::String(Rc::clone(&s)));
        }
        Value::Object(o) if matches!(o.borrow().kind, ObjectKind::Regexp(_)) => {
            let re = match &o.borrow().kind {
                ObjectKind::Regexp(re) => Rc::clone(re),
                _ => unreachable!(),
            };
            let mut last = 0usize;
            let mut pos = 0usize;
            while pos <= s.len() && out.len() < limit {
                let found = super::regexp::run_regex(vm, &re, s.units(), pos)?;
                let Some(m) = found else { break };
                let (start, end) = m.captures[0].expect("whole match");
                if end == start && start == last {
                    // Empty match making no progress
                    pos += 1;
                    continue;
                }
                out.push(vm.new_string_value(s.substring(last, start))?);
                last = end;
                pos = if end > pos { end } else { pos + 1 };
            }
            if out.len() < limit {
                out.push(vm.new_string_value(s.substring(last, s.len()))?);
            }
        }
        sep => {
            let sep = JsString::from_str(&to_js_string(&sep));
            if sep.is_empty() {
                for i in 0..s.len().min(limit) {
                    out.push(vm.new_string_value(s.substring(i, i + 1))?);
                }
            } else {
                let mut from = 0usize;
                while out.len() < limit {
                    match s.index_of(&sep, from) {
                        Some(at) => {
                            out.push(vm.new_string_value(s.substring(from, at))?);
                            from = at + sep.len();
                        }
                        None => {
                            out.push(vm.new_string_value(s.substring(from, s.len()))?);
                            break;
                        }
                    }
                }
            }
        }
    }
    vm.new_array_value(out)
}

/// `replace(pattern, replacement)`: string patterns replace the first
/// occurrence; regex patterns honour the `g` flag; the replacement may be
/// a string with `$&`/`$1..$9`/`$$` or a function.
fn replace(vm: &mut Vm, this: Value, args: &[Value]) -> Result<Value, VmError> {
    let s = this_string(&this);
    let replacement = arg(args, 1);

    match arg(args, 0) {
        Value::Object(o) if matches!(o.borrow().kind, ObjectKind::Regexp(_)) => {
            let re = match &o.borrow().kind {
                ObjectKind::Regexp(re) => Rc::clone(re),
                _ => unreachable!(),
            };
            let global = re.flags.contains(crate::regex::Flags::GLOBAL);
            let mut out: Vec<u16> = Vec::new();
            let mut last = 0usize;
            let mut pos = 0usize;
            loop {
                let found = super::regexp::run_regex(vm, &re, s.units(), pos)?;
                let Some(m) = found else { break };
                let (start, end) = m.captures[0].expect("whole match");
                out.extend_from_slice(&s.units()[last..start]);
                let rendered = render_replacement(vm, &replacement, &s, &m)?;
                out.extend_from_slice(rendered.units());
                last = end;
                pos = if end > start { end } else { end + 1 };
                if !global || pos > s.len() {
                    break;
                }
            }
            out.extend_from_slice(&s.units()[last.min(s.len())..]);
            vm.new_string_value(JsString::from_units(out))
        }
        pattern => {
            let pattern = JsString::from_str(&to_js_string(&pattern));
            match s.index_of(&pattern, 0) {
                None => Ok(Value::String(s)),
                Some(at) => {
                    let rendered = if replacement.is_callable() {
                        let matched = vm.new_string_value(pattern.clone())?;
                        let result = vm.call_function(
                            &replacement,
                            Value::Undefined,
                            &[matched, Value::Number(at as f64), Value::String(Rc::clone(&s))],
                        )?;
                        JsString::from_str(&to_js_string(&result))
                    } else {
                        expand_dollars(&to_js_string(&replacement), &s, at, at + pattern.len(), &[])
                    };
                    let mut units = s.units()[..at].to_vec();
                    units.extend_from_slice(rendered.units());
                    units.extend_from_slice(&s.units()[at + pattern.len()..]);
                    vm.new_string_value(JsString::from_units(units))
                }
            }
        }
    }
}

fn render_replacement(
    vm: &mut Vm,
    replacement: &Value,
    s: &JsString,
    m: &crate::regex::Match,
) -> Result<JsString, VmError> {
    let (start, end) = m.captures[0].expect("whole match");
    if replacement.is_callable() {
        let mut call_args: Vec<Value> = Vec::new();
        for span in &m.captures {
            call_args.push(match span {
                Some((a, b)) => vm.new_string_value(s.substring(*a, *b))?,
                None => Value::Undefined,
            });
        }
        call_args.push(Value::Number(start as f64));
        call_args.push(vm.new_string_value(s.clone())?);
        let result = vm.call_function(replacement, Value::Undefined, &call_args)?;
        return Ok(JsString::from_str(&to_js_string(&result)));
    }
    Ok(expand_dollars(
        &to_js_string(replacement),
        s,
        start,
        end,
        &m.captures[1..],
    ))
}

/// Expand `$$`, `$&`, and `$1..$9` in a replacement template.
fn expand_dollars(
    template: &str,
    s: &JsString,
    start: usize,
    end: usize,
    groups: &[Option<(usize, usize)>],
) -> JsString {
    let chars: Vec<char> = template.chars().collect();
    let mut out = String::new();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '$' && i + 1 < chars.len() {
            match chars[i + 1] {
                '$' => {
                    out.push('$');
                    i += 2;
                    continue;
                }
                '&' => {
                    out.push_str(&s.substring(start, end).to_rust_string());
                    i += 2;
                    continue;
                }
                c @ '1'..='9' => {
                    let idx = c.to_digit(10).expect("digit") as usize - 1;
                    if let Some(Some((a, b))) = groups.get(idx) {
                        out.push_str(&s.substring(*a, *b).to_rust_string());
                    }
                    i += 2;
                    continue;
                }
                _ => {}
            }
        }
        out.push(chars[i]);
        i += 1;
    }
    JsString::from_str(&out)
}
