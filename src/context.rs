//! JavaScript execution context
//!
//! The `Context` is the embedder's entry point: it owns the global
//! object, the realm's prototypes, and the byte budget, and evaluates
//! source under the configured limits. Each context is fully isolated;
//! the only process-level input is the monotonic clock.

use crate::builtins::{self, Realm};
use crate::error::{Error, JsException, VmError};
use crate::parser::{self, CompileError};
use crate::runtime::object::{
    obj_ref, JsObject, NativeFunction, NativeKind, ObjRef, ObjectKind,
};
use crate::value::{to_js_string, Value};
use crate::vm::budget::{Budget, MemoryBudget, PollFn};
use crate::vm::interp::Vm;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Context limits and tuning.
#[derive(Clone)]
pub struct ContextConfig {
    /// Byte budget for all allocations in the context (default unbounded)
    pub memory_limit: Option<usize>,
    /// Wall-clock limit per `eval` call (default unbounded)
    pub time_limit: Option<Duration>,
    /// Instructions (and regex steps) between budget polls
    pub poll_interval: u32,
    /// Backtrack stack bound for regex matching
    pub regex_stack_limit: usize,
    /// Optional host poll callback; a truthy return aborts execution
    pub poll_callback: Option<Rc<PollFn>>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        ContextConfig {
            memory_limit: None,
            time_limit: None,
            poll_interval: 100,
            regex_stack_limit: 10_000,
            poll_callback: None,
        }
    }
}

/// JavaScript execution context.
pub struct Context {
    config: ContextConfig,
    realm: Rc<Realm>,
    global: ObjRef,
    memory: MemoryBudget,
}

impl Context {
    /// Create a context with no limits.
    pub fn new() -> Self {
        Self::with_config(ContextConfig::default())
            .expect("an unbounded context cannot exhaust its budget at creation")
    }

    /// Create a context with the given limits.
    pub fn with_config(config: ContextConfig) -> Result<Self, Error> {
        let memory = MemoryBudget::new(config.memory_limit);
        let (realm, global) = builtins::install(&memory).map_err(map_vm_error)?;
        Ok(Context {
            config,
            realm,
            global,
            memory,
        })
    }

    /// Compile and run `source` as top-level code, returning the
    /// completion value (the value of the last expression statement).
    pub fn eval(&mut self, source: &str) -> Result<Value, Error> {
        let started = Instant::now();
        let program = parser::compile(source).map_err(|e| match e {
            CompileError::Syntax {
                message,
                line,
                column,
            } => Error::Syntax {
                message,
                line,
                column,
            },
            CompileError::Regex {
                message,
                line,
                column,
            } => Error::Regex(format!("{} (line {}, column {})", message, line, column)),
        })?;
        debug!(
            bytes = program.bytecode.len(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "compiled program"
        );

        let deadline = self.config.time_limit.map(|limit| Instant::now() + limit);
        let budget = Budget::new(
            deadline,
            self.config.poll_callback.clone(),
            self.config.poll_interval,
            self.memory.clone(),
        );
        let mut vm = Vm::new(Rc::clone(&self.global), Rc::clone(&self.realm), budget);
        vm.regex_stack_limit = self.config.regex_stack_limit;
        vm.regex_poll_interval = self.config.poll_interval;

        let result = vm.run_program(program);
        debug!(
            ok = result.is_ok(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "evaluation finished"
        );
        result.map_err(map_vm_error)
    }

    /// Read a property of the global object. Accessor globals read as
    /// undefined (running a getter needs an evaluation in flight).
    pub fn get(&self, name: &str) -> Value {
        self.global
            .borrow()
            .props
            .get(name)
            .and_then(|slot| slot.data())
            .unwrap_or(Value::Undefined)
    }

    /// Write a host value as a global.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) {
        self.global
            .borrow_mut()
            .props
            .set(Rc::from(name), value.into());
    }

    /// Expose a host function as a global. The callable re-enters host
    /// code synchronously; returning `Err(v)` throws `v` into the script.
    pub fn set_function<F>(&mut self, name: &'static str, f: F)
    where
        F: Fn(&[Value]) -> Result<Value, Value> + 'static,
    {
        let func = JsObject::with_kind(
            Some(Rc::clone(&self.realm.function_proto)),
            ObjectKind::Native(NativeFunction {
                name,
                kind: NativeKind::Host(Rc::new(f)),
            }),
        );
        self.global
            .borrow_mut()
            .props
            .set(Rc::from(name), Value::Object(obj_ref(func)));
    }

    /// Bytes currently accounted against the memory budget.
    pub fn memory_used(&self) -> usize {
        self.memory.used()
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// Map internal VM errors onto the embedder error type.
fn map_vm_error(e: VmError) -> Error {
    match e {
        VmError::Throw(value) => Error::Runtime(exception_from_value(&value)),
        VmError::MemoryLimit => Error::MemoryLimit,
        VmError::TimeLimit => Error::TimeLimit,
        VmError::RegexStackOverflow => Error::RegexStackOverflow,
        VmError::RegexTimeout => Error::RegexTimeout,
    }
}

fn exception_from_value(value: &Value) -> JsException {
    let rendered = to_js_string(value);
    let mut name = "Error".to_string();
    let mut message = rendered.clone();
    let mut line = None;
    let mut column = None;

    if let Value::Object(obj) = value {
        let b = obj.borrow();
        if matches!(b.kind, ObjectKind::Error) {
            if let Some(v) = b.props.get("name").and_then(|s| s.data()) {
                name = to_js_string(&v);
            }
            if let Some(v) = b.props.get("message").and_then(|s| s.data()) {
                message = to_js_string(&v);
            }
            if let Some(v) = b.props.get("lineNumber").and_then(|s| s.data()) {
                line = v.as_number().map(|n| n as u32);
            }
            if let Some(v) = b.props.get("columnNumber").and_then(|s| s.data()) {
                column = v.as_number().map(|n| n as u32);
            }
        }
    }

    JsException {
        name,
        message,
        rendered,
        line,
        column,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(source: &str) -> Value {
        let mut ctx = Context::new();
        ctx.eval(source)
            .unwrap_or_else(|e| panic!("eval failed for {:?}: {}", source, e))
    }

    // ---- The end-to-end scenarios ----

    #[test]
    fn test_scenario_addition() {
        assert_eq!(eval("1 + 2").as_number(), Some(3.0));
    }

    #[test]
    fn test_scenario_counter_closure() {
        let source =
            "function mk(){var c=0; return function(){return ++c;}} var f=mk(); f(); f(); f();";
        assert_eq!(eval(source).as_number(), Some(3.0));
    }

    #[test]
    fn test_scenario_filter_reduce() {
        let source = "[1,2,3,4].filter(function(x){return x%2===0;}).reduce(function(a,b){return a+b;},0)";
        assert_eq!(eval(source).as_number(), Some(6.0));
    }

    #[test]
    fn test_scenario_try_catch_finally() {
        let source = "var s=\"\"; try{s+=\"t\"; throw \"c\";}catch(e){s+=e;}finally{s+=\"f\";} s;";
        assert_eq!(eval(source).as_str().unwrap(), "tcf");
    }

    #[test]
    fn test_scenario_json_insertion_order() {
        assert_eq!(
            eval("JSON.stringify({a:1,b:[2,3]})").as_str().unwrap(),
            "{\"a\":1,\"b\":[2,3]}"
        );
    }

    #[test]
    fn test_scenario_regex_exec() {
        let source = "
            var m = /(\\w+)@(\\w+)/.exec(\"user@host\");
            m[0] + \"|\" + m[1] + \"|\" + m[2] + \"|\" + m.index;
        ";
        assert_eq!(eval(source).as_str().unwrap(), "user@host|user|host|0");
    }

    #[test]
    fn test_scenario_catastrophic_regex_times_out() {
        let mut ctx = Context::with_config(ContextConfig {
            time_limit: Some(Duration::from_millis(200)),
            ..Default::default()
        })
        .unwrap();
        let started = Instant::now();
        let result = ctx.eval("new RegExp(\"(a+)+b\").test(\"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\" + \"c\")");
        assert!(
            matches!(result, Err(Error::RegexTimeout)),
            "got {:?}",
            result.map(|v| v.to_string())
        );
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    // ---- Quantified properties ----

    #[test]
    fn test_parser_totality_on_deep_nesting() {
        let mut ctx = Context::new();
        for n in [1usize, 10, 100, 1000] {
            let parens = format!("{}1{}", "(".repeat(n), ")".repeat(n));
            assert_eq!(ctx.eval(&parens).unwrap().as_number(), Some(1.0), "depth {}", n);

            let brackets = format!("{}1{}", "[".repeat(n), "]".repeat(n));
            assert!(ctx.eval(&brackets).is_ok(), "depth {}", n);

            let blocks = format!("{}1;{}", "{".repeat(n), "}".repeat(n));
            assert_eq!(ctx.eval(&blocks).unwrap().as_number(), Some(1.0), "depth {}", n);
        }
        let chain = format!("var deep = {}0{}; deep{};", "[".repeat(1001), "]".repeat(1001), "[0]".repeat(1000));
        assert!(ctx.eval(&chain).is_ok());
    }

    #[test]
    fn test_json_round_trip() {
        let source = "
            var v = {n: null, t: true, f: false, num: 12.5, s: \"hi\",
                     arr: [1, [2, {x: 3}], \"z\"], obj: {a: {b: {c: 0}}}};
            var w = JSON.parse(JSON.stringify(v));
            JSON.stringify(v) === JSON.stringify(w);
        ";
        assert_eq!(eval(source).as_bool(), Some(true));
    }

    #[test]
    fn test_for_in_insertion_order() {
        let source = "
            var o = {}; o.z = 1; o.a = 2; o[\"0\"] = 3; o.m = 4;
            var keys = [];
            for (var k in o) { keys.push(k); }
            keys.join(\",\");
        ";
        assert_eq!(eval(source).as_str().unwrap(), "z,a,0,m");
    }

    #[test]
    fn test_closure_cell_identity() {
        let source = "
            function makeCounter() {
                var n = 0;
                return [function(){ return ++n; }, function(){ return ++n; }];
            }
            var first = makeCounter();
            var second = makeCounter();
            first[0](); first[1](); first[0]();
            second[0]();
            first[0]() * 10 + second[1]();
        ";
        // first's cell has been bumped 4 times, second's twice
        assert_eq!(eval(source).as_number(), Some(42.0));
    }

    #[test]
    fn test_try_finally_discipline() {
        let source = "
            var log = \"\";
            function run(mode) {
                try {
                    log += \"t\";
                    if (mode === 1) { throw \"x\"; }
                    if (mode === 2) { return \"r\"; }
                } catch (e) {
                    log += \"c\";
                } finally {
                    log += \"f\";
                }
                return \"n\";
            }
            run(0); run(1); run(2);
            log;
        ";
        assert_eq!(eval(source).as_str().unwrap(), "tftcftf");
    }

    #[test]
    fn test_uncaught_finally_still_runs() {
        let source = "
            var log = \"\";
            function boom() {
                try { throw \"up\"; } finally { log += \"f\"; }
            }
            try { boom(); } catch (e) { log += e; }
            log;
        ";
        assert_eq!(eval(source).as_str().unwrap(), "fup");
    }

    #[test]
    fn test_budget_enforcement() {
        let mut ctx = Context::with_config(ContextConfig {
            time_limit: Some(Duration::from_millis(50)),
            ..Default::default()
        })
        .unwrap();
        let started = Instant::now();
        // The limit error must not be observable by user code
        let result = ctx.eval("try { while(true){} } catch (e) { \"caught\"; }");
        assert!(matches!(result, Err(Error::TimeLimit)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_memory_limit() {
        let mut ctx = Context::with_config(ContextConfig {
            memory_limit: Some(512 * 1024),
            ..Default::default()
        })
        .unwrap();
        let result = ctx.eval(
            "var blocks = []; while (true) { blocks.push(\"block-\" + blocks.length); }",
        );
        assert!(matches!(result, Err(Error::MemoryLimit)));
    }

    // ---- Embedding surface ----

    #[test]
    fn test_get_set_globals() {
        let mut ctx = Context::new();
        ctx.set("limit", 10.0);
        ctx.set("label", "total");
        assert_eq!(
            ctx.eval("label + \": \" + (limit * 2)").unwrap().as_str().unwrap(),
            "total: 20"
        );
        ctx.eval("var answer = 42;").unwrap();
        assert_eq!(ctx.get("answer").as_number(), Some(42.0));
        assert!(ctx.get("nonexistent").is_undefined());
    }

    #[test]
    fn test_host_function_round_trip() {
        let mut ctx = Context::new();
        ctx.set_function("twice", |args| {
            let n = args.first().and_then(|v| v.as_number()).unwrap_or(0.0);
            Ok(Value::from(n * 2.0))
        });
        assert_eq!(ctx.eval("twice(21)").unwrap().as_number(), Some(42.0));
    }

    #[test]
    fn test_host_function_throws_into_script() {
        let mut ctx = Context::new();
        ctx.set_function("fail", |_args| Err(Value::from("host said no")));
        let v = ctx
            .eval("var got; try { fail(); } catch (e) { got = e; } got;")
            .unwrap();
        assert_eq!(v.as_str().unwrap(), "host said no");
    }

    #[test]
    fn test_syntax_error_carries_position() {
        let mut ctx = Context::new();
        match ctx.eval("var x = 1;\nvar = 2;") {
            Err(Error::Syntax { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected syntax error, got {:?}", other.map(|v| v.to_string())),
        }
    }

    #[test]
    fn test_runtime_error_carries_location_and_name() {
        let mut ctx = Context::new();
        match ctx.eval("var t = 1;\nnull.x;") {
            Err(Error::Runtime(e)) => {
                assert_eq!(e.name, "TypeError");
                assert_eq!(e.line, Some(2));
            }
            other => panic!("expected runtime error, got {:?}", other.map(|v| v.to_string())),
        }
    }

    #[test]
    fn test_invalid_regex_is_reported() {
        let mut ctx = Context::new();
        assert!(matches!(ctx.eval("/(/;"), Err(Error::Regex(_))));
    }

    #[test]
    fn test_state_persists_across_eval_calls() {
        let mut ctx = Context::new();
        ctx.eval("var count = 1; function bump() { return ++count; }")
            .unwrap();
        ctx.eval("bump(); bump();").unwrap();
        assert_eq!(ctx.eval("count").unwrap().as_number(), Some(3.0));
    }

    #[test]
    fn test_poll_callback_abort() {
        use std::cell::Cell;
        let calls = Rc::new(Cell::new(0u32));
        let seen = Rc::clone(&calls);
        let mut ctx = Context::with_config(ContextConfig {
            poll_callback: Some(Rc::new(move || {
                seen.set(seen.get() + 1);
                seen.get() > 5
            })),
            ..Default::default()
        })
        .unwrap();
        assert!(matches!(ctx.eval("while (true) {}"), Err(Error::TimeLimit)));
        assert!(calls.get() > 5);
    }

    // ---- Assorted language behaviour ----

    #[test]
    fn test_string_methods() {
        assert_eq!(eval("\"Hello World\".toUpperCase()").as_str().unwrap(), "HELLO WORLD");
        assert_eq!(eval("\"a,b,c\".split(\",\").length").as_number(), Some(3.0));
        assert_eq!(eval("\"  pad  \".trim()").as_str().unwrap(), "pad");
        assert_eq!(eval("\"abcdef\".slice(1, 3)").as_str().unwrap(), "bc");
        assert_eq!(eval("\"ha\".repeat(3)").as_str().unwrap(), "hahaha");
        assert_eq!(eval("\"x-y\".replace(\"-\", \"+\")").as_str().unwrap(), "x+y");
        assert_eq!(
            eval("\"a1b2\".replace(/\\d/g, \"#\")").as_str().unwrap(),
            "a#b#"
        );
        assert_eq!(
            eval("\"john smith\".replace(/(\\w+) (\\w+)/, \"$2 $1\")").as_str().unwrap(),
            "smith john"
        );
        assert_eq!(eval("\"abc\".charCodeAt(1)").as_number(), Some(98.0));
    }

    #[test]
    fn test_array_methods() {
        assert_eq!(eval("[3,1,2].indexOf(2)").as_number(), Some(2.0));
        assert_eq!(eval("[1,2,3].map(function(x){return x*x;}).join(\"-\")").as_str().unwrap(), "1-4-9");
        assert_eq!(eval("[1,2,3,4].some(function(x){return x>3;})").as_bool(), Some(true));
        assert_eq!(eval("[1,2,3,4].every(function(x){return x>0;})").as_bool(), Some(true));
        assert_eq!(eval("[[1],[2]].concat([3]).length").as_number(), Some(3.0));
        assert_eq!(eval("[1,2,3].reverse().join(\"\")").as_str().unwrap(), "321");
        assert_eq!(eval("[5,6].find(function(x){return x%2===0;})").as_number(), Some(6.0));
    }

    #[test]
    fn test_math_and_number() {
        assert_eq!(eval("Math.max(1, 5, 3)").as_number(), Some(5.0));
        assert_eq!(eval("Math.floor(2.7) + Math.ceil(2.1)").as_number(), Some(5.0));
        assert_eq!(eval("Math.round(2.5)").as_number(), Some(3.0));
        assert_eq!(eval("(1.005).toFixed(1)").as_str().unwrap(), "1.0");
        assert_eq!(eval("parseInt(\"0x1f\", 16)").as_number(), Some(31.0));
        assert_eq!(eval("parseInt(\"42px\")").as_number(), Some(42.0));
        assert_eq!(eval("parseFloat(\"2.5e1x\")").as_number(), Some(25.0));
        assert_eq!(eval("Number.isInteger(4) && !Number.isInteger(4.5)").as_bool(), Some(true));
        assert_eq!(eval("(255).toString(16)").as_str().unwrap(), "ff");
        assert_eq!(eval("var r = Math.random(); r >= 0 && r < 1").as_bool(), Some(true));
    }

    #[test]
    fn test_regexp_lastindex_with_global_flag() {
        let source = "
            var re = /\\d+/g;
            var s = \"a1b22c333\";
            var hits = [];
            var m;
            while ((m = re.exec(s)) !== null) { hits.push(m[0]); }
            hits.join(\",\");
        ";
        assert_eq!(eval(source).as_str().unwrap(), "1,22,333");
    }

    #[test]
    fn test_regexp_named_groups() {
        let source = "
            var m = /(?<y>\\d{4})-(?<m>\\d{2})/.exec(\"2024-06\");
            m.groups.y + \"/\" + m.groups.m;
        ";
        assert_eq!(eval(source).as_str().unwrap(), "2024/06");
    }

    #[test]
    fn test_date_now_monotonic_enough() {
        assert_eq!(eval("Date.now() > 1577836800000").as_bool(), Some(true));
    }

    #[test]
    fn test_object_statics() {
        assert_eq!(eval("Object.keys({x:1, y:2}).join()").as_str().unwrap(), "x,y");
        assert_eq!(eval("Object.values({x:1, y:2}).join()").as_str().unwrap(), "1,2");
        assert_eq!(
            eval("JSON.stringify(Object.entries({a:1}))").as_str().unwrap(),
            "[[\"a\",1]]"
        );
        assert_eq!(
            eval("var t = Object.assign({}, {a:1}, {b:2}); t.a + t.b").as_number(),
            Some(3.0)
        );
        assert_eq!(eval("({x:1}).hasOwnProperty(\"x\")").as_bool(), Some(true));
    }

    #[test]
    fn test_completion_value_rules() {
        assert!(eval("var x = 5;").is_undefined());
        assert_eq!(eval("var x = 5; x + 1;").as_number(), Some(6.0));
        assert_eq!(eval("if (true) { 7; }").as_number(), Some(7.0));
    }
}
