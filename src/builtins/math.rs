//! The `Math` namespace object

use super::{arg, define_method, define_value, Realm};
use crate::error::VmError;
use crate::runtime::object::{obj_ref, JsObject, ObjRef};
use crate::value::{to_number, Value};
use crate::vm::interp::Vm;
use std::cell::Cell;
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

pub(super) fn install(realm: &Realm, global: &ObjRef) {
    let math = obj_ref(JsObject::new(Some(Rc::clone(&realm.object_proto))));

    define_value(&math, "E", Value::Number(std::f64::consts::E));
    define_value(&math, "PI", Value::Number(std::f64::consts::PI));
    define_value(&math, "LN2", Value::Number(std::f64::consts::LN_2));
    define_value(&math, "LN10", Value::Number(std::f64::consts::LN_10));
    define_value(&math, "LOG2E", Value::Number(std::f64::consts::LOG2_E));
    define_value(&math, "LOG10E", Value::Number(std::f64::consts::LOG10_E));
    define_value(&math, "SQRT2", Value::Number(std::f64::consts::SQRT_2));
    define_value(&math, "SQRT1_2", Value::Number(std::f64::consts::FRAC_1_SQRT_2));

    define_method(realm, &math, "abs", |_, _, a| Ok(num1(a, f64::abs)));
    define_method(realm, &math, "floor", |_, _, a| Ok(num1(a, f64::floor)));
    define_method(realm, &math, "ceil", |_, _, a| Ok(num1(a, f64::ceil)));
    define_method(realm, &math, "round", |_, _, a| Ok(num1(a, js_round)));
    define_method(realm, &math, "trunc", |_, _, a| Ok(num1(a, f64::trunc)));
    define_method(realm, &math, "sign", |_, _, a| {
        Ok(num1(a, |x| {
            if x.is_nan() || x == 0.0 {
                x
            } else if x > 0.0 {
                1.0
            } else {
                -1.0
            }
        }))
    });
    define_method(realm, &math, "sqrt", |_, _, a| Ok(num1(a, f64::sqrt)));
    define_method(realm, &math, "cbrt", |_, _, a| Ok(num1(a, f64::cbrt)));
    define_method(realm, &math, "exp", |_, _, a| Ok(num1(a, f64::exp)));
    define_method(realm, &math, "log", |_, _, a| Ok(num1(a, f64::ln)));
    define_method(realm, &math, "log2", |_, _, a| Ok(num1(a, f64::log2)));
    define_method(realm, &math, "log10", |_, _, a| Ok(num1(a, f64::log10)));
    define_method(realm, &math, "sin", |_, _, a| Ok(num1(a, f64::sin)));
    define_method(realm, &math, "cos", |_, _, a| Ok(num1(a, f64::cos)));
    define_method(realm, &math, "tan", |_, _, a| Ok(num1(a, f64::tan)));
    define_method(realm, &math, "asin", |_, _, a| Ok(num1(a, f64::asin)));
    define_method(realm, &math, "acos", |_, _, a| Ok(num1(a, f64::acos)));
    define_method(realm, &math, "atan", |_, _, a| Ok(num1(a, f64::atan)));
    define_method(realm, &math, "atan2", |_, _, a| {
        Ok(Value::Number(to_number(&arg(a, 0)).atan2(to_number(&arg(a, 1)))))
    });
    define_method(realm, &math, "pow", |_, _, a| {
        Ok(Value::Number(to_number(&arg(a, 0)).powf(to_number(&arg(a, 1)))))
    });
    define_method(realm, &math, "hypot", |_, _, a| {
        let sum: f64 = a.iter().map(|v| to_number(v).powi(2)).sum();
        Ok(Value::Number(sum.sqrt()))
    });
    define_method(realm, &math, "min", math_min);
    define_method(realm, &math, "max", math_max);
    define_method(realm, &math, "random", math_random);

    define_value(global, "Math", Value::Object(math));
}

fn num1(args: &[Value], f: impl Fn(f64) -> f64) -> Value {
    Value::Number(f(to_number(&arg(args, 0))))
}

/// JS rounding: halves go toward positive infinity.
fn js_round(x: f64) -> f64 {
    if x.is_nan() || x.is_infinite() {
        return x;
    }
    let floored = x.floor();
    if x - floored >= 0.5 {
        floored + 1.0
    } else {
        floored
    }
}

fn math_min(_vm: &mut Vm, _this: Value, args: &[Value]) -> Result<Value, VmError> {
    let mut best = f64::INFINITY;
    for v in args {
        let n = to_number(v);
        if n.is_nan() {
            return Ok(Value::Number(f64::NAN));
        }
        if n < best {
            best = n;
        }
    }
    Ok(Value::Number(best))
}

fn math_max(_vm: &mut Vm, _this: Value, args: &[Value]) -> Result<Value, VmError> {
    let mut best = f64::NEG_INFINITY;
    for v in args {
        let n = to_number(v);
        if n.is_nan() {
            return Ok(Value::Number(f64::NAN));
        }
        if n > best {
            best = n;
        }
    }
    Ok(Value::Number(best))
}

thread_local! {
    /// xorshift64* state, seeded once per thread from the wall clock
    static RNG_STATE: Cell<u64> = Cell::new({
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0x9E3779B97F4A7C15);
        nanos | 1
    });
}

fn math_random(_vm: &mut Vm, _this: Value, _args: &[Value]) -> Result<Value, VmError> {
    let bits = RNG_STATE.with(|state| {
        let mut x = state.get();
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        state.set(x);
        x.wrapping_mul(0x2545F4914F6CDD1D)
    });
    // Upper 53 bits into [0, 1)
    Ok(Value::Number((bits >> 11) as f64 / (1u64 << 53) as f64))
}
