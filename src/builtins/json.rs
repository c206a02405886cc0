//! The `JSON` namespace: parse and stringify over engine values
//!
//! Implemented directly on the engine heap so parsed objects charge the
//! context's memory budget and stringification observes insertion order.

use super::{arg, define_method, define_value, Realm};
use crate::error::VmError;
use crate::runtime::object::{obj_ref, JsObject, ObjRef};
use crate::util::dtoa;
use crate::value::{to_js_string, Value};
use crate::vm::interp::Vm;
use std::rc::Rc;

pub(super) fn install(realm: &Realm, global: &ObjRef) {
    let json = obj_ref(JsObject::new(Some(Rc::clone(&realm.object_proto))));
    define_method(realm, &json, "parse", json_parse);
    define_method(realm, &json, "stringify", json_stringify);
    define_value(global, "JSON", Value::Object(json));
}

// =============================================================================
// parse
// =============================================================================

fn json_parse(vm: &mut Vm, _this: Value, args: &[Value]) -> Result<Value, VmError> {
    let text = to_js_string(&arg(args, 0));
    let mut parser = JsonParser {
        chars: text.chars().collect(),
        pos: 0,
    };
    let value = parser.parse_value(vm)?;
    parser.skip_whitespace();
    if parser.pos < parser.chars.len() {
        return Err(parser.error(vm, "unexpected trailing characters"));
    }
    Ok(value)
}

struct JsonParser {
    chars: Vec<char>,
    pos: usize,
}

impl JsonParser {
    fn error(&self, vm: &mut Vm, message: &str) -> VmError {
        vm.throw_error(
            "SyntaxError",
            &format!("JSON.parse: {} at position {}", message, self.pos),
        )
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn next(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(' ' | '\t' | '\n' | '\r')) {
            self.pos += 1;
        }
    }

    fn expect_literal(&mut self, vm: &mut Vm, literal: &str) -> Result<(), VmError> {
        for expected in literal.chars() {
            if self.next() != Some(expected) {
                return Err(self.error(vm, "invalid literal"));
            }
        }
        Ok(())
    }

    fn parse_value(&mut self, vm: &mut Vm) -> Result<Value, VmError> {
        self.skip_whitespace();
        match self.peek() {
            Some('{') => self.parse_object(vm),
            Some('[') => self.parse_array(vm),
            Some('"') => {
                let s = self.parse_string(vm)?;
                vm.alloc_str(&s)
            }
            Some('t') => {
                self.expect_literal(vm, "true")?;
                Ok(Value::Bool(true))
            }
            Some('f') => {
                self.expect_literal(vm, "false")?;
                Ok(Value::Bool(false))
            }
            Some('n') => {
                self.expect_literal(vm, "null")?;
                Ok(Value::Null)
            }
            Some(c) if c == '-' || c.is_ascii_digit() => self.parse_number(vm),
            _ => Err(self.error(vm, "unexpected character")),
        }
    }

    fn parse_object(&mut self, vm: &mut Vm) -> Result<Value, VmError> {
        self.next(); // {
        let obj = vm.new_plain_object()?;
        self.skip_whitespace();
        if self.peek() == Some('}') {
            self.next();
            return Ok(Value::Object(obj));
        }
        loop {
            self.skip_whitespace();
            if self.peek() != Some('"') {
                return Err(self.error(vm, "expected string key"));
            }
            let key = self.parse_string(vm)?;
            self.skip_whitespace();
            if self.next() != Some(':') {
                return Err(self.error(vm, "expected ':'"));
            }
            let value = self.parse_value(vm)?;
            vm.budget
                .memory
                .charge(key.len() + std::mem::size_of::<Value>())?;
            obj.borrow_mut().props.set(Rc::from(key.as_str()), value);
            self.skip_whitespace();
            match self.next() {
                Some(',') => continue,
                Some('}') => break,
                _ => return Err(self.error(vm, "expected ',' or '}'")),
            }
        }
        Ok(Value::Object(obj))
    }

    fn parse_array(&mut self, vm: &mut Vm) -> Result<Value, VmError> {
        self.next(); // [
        let mut elements = Vec::new();
        self.skip_whitespace();
        if self.peek() == Some(']') {
            self.next();
            return vm.new_array_value(elements);
        }
        loop {
            let value = self.parse_value(vm)?;
            elements.push(value);
            self.skip_whitespace();
            match self.next() {
                Some(',') => continue,
                Some(']') => break,
                _ => return Err(self.error(vm, "expected ',' or ']'")),
            }
        }
        vm.new_array_value(elements)
    }

    fn parse_string(&mut self, vm: &mut Vm) -> Result<String, VmError> {
        self.next(); // "
        let mut out = String::new();
        loop {
            match self.next() {
                None => return Err(self.error(vm, "unterminated string")),
                Some('"') => break,
                Some('\\') => match self.next() {
                    Some('"') => out.push('"'),
                    Some('\\') => out.push('\\'),
                    Some('/') => out.push('/'),
                    Some('b') => out.push('\u{8}'),
                    Some('f') => out.push('\u{c}'),
                    Some('n') => out.push('\n'),
                    Some('r') => out.push('\r'),
                    Some('t') => out.push('\t'),
                    Some('u') => {
                        let mut code = 0u32;
                        for _ in 0..4 {
                            let d = self
                                .next()
                                .and_then(|c| c.to_digit(16))
                                .ok_or_else(|| self.error(vm, "invalid unicode escape"))?;
                            code = code * 16 + d;
                        }
                        out.push(char::from_u32(code).unwrap_or('\u{FFFD}'));
                    }
                    _ => return Err(self.error(vm, "invalid escape")),
                },
                Some('\u{0}'..='\u{1f}') => {
                    return Err(self.error(vm, "control character in string"));
                }
                Some(c) => out.push(c),
            }
        }
        Ok(out)
    }

    fn parse_number(&mut self, vm: &mut Vm) -> Result<Value, VmError> {
        let start = self.pos;
        if self.peek() == Some('-') {
            self.next();
        }
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.next();
        }
        if self.peek() == Some('.') {
            self.next();
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.next();
            }
        }
        if matches!(self.peek(), Some('e' | 'E')) {
            self.next();
            if matches!(self.peek(), Some('+' | '-')) {
                self.next();
            }
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.next();
            }
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        text.parse::<f64>()
            .map(Value::Number)
            .map_err(|_| self.error(vm, "invalid number"))
    }
}

// =============================================================================
// stringify
// =============================================================================

fn json_stringify(vm: &mut Vm, _this: Value, args: &[Value]) -> Result<Value, VmError> {
    let value = arg(args, 0);
    let indent = match arg(args, 2) {
        Value::Number(n) if n >= 1.0 => " ".repeat((n as usize).min(10)),
        Value::String(s) => {
            let s = s.to_rust_string();
            s.chars().take(10).collect()
        }
        _ => String::new(),
    };
    let mut out = String::new();
    let mut seen: Vec<*const ()> = Vec::new();
    let produced = write_json(vm, &value, &indent, 0, &mut seen, &mut out)?;
    if !produced {
        return Ok(Value::Undefined);
    }
    vm.alloc_str(&out)
}

/// Serialize one value. Returns false for values JSON omits (undefined,
/// functions).
fn write_json(
    vm: &mut Vm,
    value: &Value,
    indent: &str,
    depth: usize,
    seen: &mut Vec<*const ()>,
    out: &mut String,
) -> Result<bool, VmError> {
    match value {
        Value::Undefined => Ok(false),
        Value::Null => {
            out.push_str("null");
            Ok(true)
        }
        Value::Bool(b) => {
            out.push_str(if *b { "true" } else { "false" });
            Ok(true)
        }
        Value::Number(n) => {
            if n.is_finite() {
                out.push_str(&dtoa::f64_to_js_string(*n));
            } else {
                out.push_str("null");
            }
            Ok(true)
        }
        Value::String(s) => {
            write_json_string(&s.to_rust_string(), out);
            Ok(true)
        }
        Value::Object(obj) => {
            if obj.borrow().is_callable() {
                return Ok(false);
            }
            let ptr = Rc::as_ptr(obj) as *const ();
            if seen.contains(&ptr) {
                return Err(vm.type_error("converting circular structure to JSON"));
            }
            seen.push(ptr);
            let result = write_json_object(vm, obj, indent, depth, seen, out);
            seen.pop();
            result?;
            Ok(true)
        }
    }
}

fn write_json_object(
    vm: &mut Vm,
    obj: &ObjRef,
    indent: &str,
    depth: usize,
    seen: &mut Vec<*const ()>,
    out: &mut String,
) -> Result<(), VmError> {
    let pretty = !indent.is_empty();
    let pad = |out: &mut String, level: usize| {
        if pretty {
            out.push('\n');
            for _ in 0..level {
                out.push_str(indent);
            }
        }
    };

    let is_array = obj.borrow().is_array();
    if is_array {
        let elements = obj.borrow().elements().cloned().unwrap_or_default();
        out.push('[');
        for (i, el) in elements.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            pad(out, depth + 1);
            if !write_json(vm, el, indent, depth + 1, seen, out)? {
                out.push_str("null");
            }
        }
        if !elements.is_empty() {
            pad(out, depth);
        }
        out.push(']');
        return Ok(());
    }

    let keys = obj.borrow().props.keys();
    out.push('{');
    let mut wrote = 0usize;
    for key in keys {
        let value = vm.get_property(&Value::Object(Rc::clone(obj)), &key)?;
        let mut piece = String::new();
        if !write_json(vm, &value, indent, depth + 1, seen, &mut piece)? {
            continue;
        }
        if wrote > 0 {
            out.push(',');
        }
        pad(out, depth + 1);
        write_json_string(&key, out);
        out.push(':');
        if pretty {
            out.push(' ');
        }
        out.push_str(&piece);
        wrote += 1;
    }
    if wrote > 0 {
        pad(out, depth);
    }
    out.push('}');
    Ok(())
}

fn write_json_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{8}' => out.push_str("\\b"),
            '\u{c}' => out.push_str("\\f"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_json_string_escapes() {
        let mut out = String::new();
        write_json_string("a\"b\\c\nd\u{1}", &mut out);
        assert_eq!(out, "\"a\\\"b\\\\c\\nd\\u0001\"");
    }
}
