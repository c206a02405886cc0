//! `RegExp` constructor and `RegExp.prototype`
//!
//! `test`/`exec` run the compiled program through the backtracking
//! matcher under the VM's poll contract, so a pathological pattern is
//! aborted by the same deadline as runaway bytecode. The abort is
//! reported as a regex timeout rather than a plain time limit, so
//! callers can tell pattern blowups apart.

use super::{arg, define_method, define_value, native_fn, Realm};
use crate::error::VmError;
use crate::regex::{Match, MatchConfig, MatchError, Regex};
use crate::runtime::object::{ObjRef, ObjectKind};
use crate::runtime::string::JsString;
use crate::value::{to_js_string, to_number, Value};
use crate::vm::interp::Vm;
use std::rc::Rc;

pub(super) fn install(realm: &Realm, global: &ObjRef) {
    let proto = &realm.regexp_proto;
    define_method(realm, proto, "test", regexp_test);
    define_method(realm, proto, "exec", regexp_exec);
    define_method(realm, proto, "toString", regexp_to_string);

    let ctor = native_fn(realm, "RegExp", regexp_ctor);
    if let Value::Object(ctor_obj) = &ctor {
        define_value(ctor_obj, "prototype", Value::Object(Rc::clone(proto)));
    }
    define_value(global, "RegExp", ctor);
}

fn regexp_ctor(vm: &mut Vm, _this: Value, args: &[Value]) -> Result<Value, VmError> {
    let (source, flags) = match arg(args, 0) {
        Value::Object(o) if matches!(o.borrow().kind, ObjectKind::Regexp(_)) => {
            let b = o.borrow();
            let ObjectKind::Regexp(re) = &b.kind else {
                unreachable!()
            };
            let flags = match arg(args, 1) {
                Value::Undefined => re.flag_str.clone(),
                v => to_js_string(&v),
            };
            (re.source.clone(), flags)
        }
        Value::Undefined => (String::new(), String::new()),
        pattern => {
            let flags = match arg(args, 1) {
                Value::Undefined => String::new(),
                v => to_js_string(&v),
            };
            (to_js_string(&pattern), flags)
        }
    };

    let compiled = Regex::compile(&source, &flags)
        .map_err(|e| vm.throw_error("SyntaxError", &e.message))?;
    vm.make_regexp_object(Rc::new(compiled))
}

/// The receiver's compiled program, or a TypeError.
fn this_regex(vm: &mut Vm, this: &Value) -> Result<(ObjRef, Rc<Regex>), VmError> {
    if let Value::Object(o) = this {
        let found = match &o.borrow().kind {
            ObjectKind::Regexp(re) => Some(Rc::clone(re)),
            _ => None,
        };
        if let Some(re) = found {
            return Ok((Rc::clone(o), re));
        }
    }
    Err(vm.type_error("receiver is not a RegExp"))
}

/// Run a compiled regex against code units under the VM's poll contract.
/// Matcher aborts translate into the uncatchable regex errors.
pub(super) fn run_regex(
    vm: &mut Vm,
    re: &Regex,
    input: &[u16],
    start: usize,
) -> Result<Option<Match>, VmError> {
    let guard = vm.budget.time_guard();
    let poll = move || guard.should_abort();
    let config = MatchConfig {
        stack_limit: vm.regex_stack_limit,
        poll_interval: vm.regex_poll_interval,
        step_limit: None,
        poll: Some(&poll),
    };
    re.exec(input, start, &config).map_err(|e| match e {
        MatchError::StackOverflow => VmError::RegexStackOverflow,
        MatchError::Timeout => VmError::RegexTimeout,
    })
}

fn last_index(vm: &mut Vm, obj: &ObjRef) -> Result<usize, VmError> {
    let v = vm.get_property(&Value::Object(Rc::clone(obj)), "lastIndex")?;
    let n = to_number(&v);
    if n.is_nan() || n < 0.0 {
        Ok(0)
    } else {
        Ok(n as usize)
    }
}

fn set_last_index(obj: &ObjRef, value: usize) {
    obj.borrow_mut()
        .props
        .set(Rc::from("lastIndex"), Value::Number(value as f64));
}

fn regexp_test(vm: &mut Vm, this: Value, args: &[Value]) -> Result<Value, VmError> {
    let result = regexp_exec(vm, this, args)?;
    Ok(Value::Bool(!result.is_null()))
}

fn regexp_exec(vm: &mut Vm, this: Value, args: &[Value]) -> Result<Value, VmError> {
    let (obj, re) = this_regex(vm, &this)?;
    let input = JsString::from_str(&to_js_string(&arg(args, 0)));

    let tracks_position = re.flags.contains(crate::regex::Flags::GLOBAL)
        || re.flags.contains(crate::regex::Flags::STICKY);
    let start = if tracks_position {
        last_index(vm, &obj)?
    } else {
        0
    };

    let found = run_regex(vm, &re, input.units(), start)?;
    let Some(m) = found else {
        if tracks_position {
            set_last_index(&obj, 0);
        }
        return Ok(Value::Null);
    };

    if tracks_position {
        let (_, end) = m.captures[0].expect("whole match");
        set_last_index(&obj, end);
    }

    // Result array: numbered captures plus index/input/groups
    let mut elements = Vec::with_capacity(m.captures.len());
    for span in &m.captures {
        elements.push(match span {
            Some((a, b)) => vm.new_string_value(input.substring(*a, *b))?,
            None => Value::Undefined,
        });
    }
    let result = vm.new_array_value(elements)?;
    if let Value::Object(arr) = &result {
        let mut b = arr.borrow_mut();
        b.props
            .set(Rc::from("index"), Value::Number(m.index as f64));
        b.props
            .set(Rc::from("input"), Value::String(Rc::new(input.clone())));
    }
    if !re.named_groups.is_empty() {
        let groups = vm.new_plain_object()?;
        for (name, idx) in &re.named_groups {
            let v = match m.captures.get(*idx).copied().flatten() {
                Some((a, b)) => vm.new_string_value(input.substring(a, b))?,
                None => Value::Undefined,
            };
            groups.borrow_mut().props.set(Rc::from(name.as_str()), v);
        }
        if let Value::Object(arr) = &result {
            arr.borrow_mut()
                .props
                .set(Rc::from("groups"), Value::Object(groups));
        }
    }
    Ok(result)
}

fn regexp_to_string(vm: &mut Vm, this: Value, _args: &[Value]) -> Result<Value, VmError> {
    let (_, re) = this_regex(vm, &this)?;
    vm.alloc_str(&format!("/{}/{}", re.source, re.flag_str))
}
