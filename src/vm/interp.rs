//! Bytecode interpreter
//!
//! Executes compiled functions on a stack machine. One operand stack is
//! shared by all frames, each frame owning the region above its base.
//! Exceptions unwind through the per-function exception tables; `finally`
//! blocks run as gosub subroutines whose `ret` re-dispatches the recorded
//! disposition. The budget is polled on an instruction counter.

use crate::builtins::Realm;
use crate::error::VmError;
use crate::regex::Regex;
use crate::runtime::function::{Cell, Const, FunctionBytecode, JsClosure, UpvalueSource};
use crate::runtime::object::{obj_ref, IterState, JsObject, NativeKind, ObjRef, ObjectKind};
use crate::runtime::property::PropSlot;
use crate::runtime::string::JsString;
use crate::value::{
    self, compare, loose_equals, strict_equals, to_array_index, to_boolean, to_int32, to_js_string,
    to_number, to_uint32, type_of, Value,
};
use crate::vm::budget::Budget;
use crate::vm::opcode::OpCode;
use std::cell::RefCell;
use std::cmp::Ordering;
use std::rc::Rc;

/// Maximum call frame depth; exceeding it raises a catchable RangeError.
const MAX_CALL_DEPTH: usize = 256;

/// A local slot: plain value, or a heap cell when the slot is captured by
/// an inner function.
#[derive(Debug, Clone)]
enum Slot {
    Plain(Value),
    Cell(Cell),
}

/// One call frame.
struct Frame {
    func: Rc<FunctionBytecode>,
    /// The closure object being executed (undefined for the program)
    func_obj: Value,
    pc: usize,
    /// Operand stack base for this frame
    base: usize,
    locals: Vec<Slot>,
    /// Full argument list, for the `arguments` object
    args: Vec<Value>,
    upvalues: Vec<Cell>,
    this_value: Value,
    is_ctor: bool,
}

enum Flow {
    Normal,
    Returned(Value),
}

/// The virtual machine for one evaluation.
pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<Frame>,
    pub global: ObjRef,
    pub realm: Rc<Realm>,
    pub budget: Budget,
    /// Backtrack stack bound for regexes run by this VM
    pub regex_stack_limit: usize,
    /// Matcher steps between polls
    pub regex_poll_interval: u32,
}

impl Vm {
    pub fn new(global: ObjRef, realm: Rc<Realm>, budget: Budget) -> Self {
        Vm {
            stack: Vec::with_capacity(64),
            frames: Vec::new(),
            global,
            realm,
            budget,
            regex_stack_limit: 10_000,
            regex_poll_interval: 100,
        }
    }

    /// Run a compiled program to completion.
    pub fn run_program(&mut self, func: Rc<FunctionBytecode>) -> Result<Value, VmError> {
        self.budget.memory.charge(func.byte_size())?;
        let depth = self.frames.len();
        self.push_frame(
            func,
            Value::Undefined,
            Vec::new(),
            Value::Undefined,
            Vec::new(),
            false,
        )?;
        self.run_until(depth)
    }

    // =========================================================================
    // Allocation helpers (all charge the memory budget)
    // =========================================================================

    pub fn new_plain_object(&mut self) -> Result<ObjRef, VmError> {
        let obj = JsObject::new(Some(Rc::clone(&self.realm.object_proto)));
        self.budget.memory.charge(obj.base_byte_size())?;
        Ok(obj_ref(obj))
    }

    pub fn new_object_with(
        &mut self,
        proto: Option<ObjRef>,
        kind: ObjectKind,
    ) -> Result<ObjRef, VmError> {
        let obj = JsObject::with_kind(proto, kind);
        self.budget.memory.charge(obj.base_byte_size())?;
        Ok(obj_ref(obj))
    }

    pub fn new_array_value(&mut self, elements: Vec<Value>) -> Result<Value, VmError> {
        let obj = self.new_object_with(
            Some(Rc::clone(&self.realm.array_proto)),
            ObjectKind::Array(elements),
        )?;
        Ok(Value::Object(obj))
    }

    pub fn new_string_value(&mut self, s: JsString) -> Result<Value, VmError> {
        self.budget.memory.charge(s.byte_size())?;
        Ok(Value::String(Rc::new(s)))
    }

    pub fn alloc_str(&mut self, s: &str) -> Result<Value, VmError> {
        self.new_string_value(JsString::from_str(s))
    }

    /// Build an error-shaped object of the given kind.
    pub fn make_error(&mut self, name: &str, message: &str) -> Value {
        let proto = self.realm.error_proto_for(name);
        let mut obj = JsObject::with_kind(Some(proto), ObjectKind::Error);
        // Error construction must succeed even at the memory limit; the
        // charge is attempted but the error object is always produced
        let _ = self.budget.memory.charge(obj.base_byte_size() + message.len());
        obj.props
            .set(Rc::from("name"), Value::string(name));
        obj.props
            .set(Rc::from("message"), Value::string(message));
        Value::Object(obj_ref(obj))
    }

    pub fn throw_error(&mut self, name: &str, message: &str) -> VmError {
        VmError::Throw(self.make_error(name, message))
    }

    pub fn type_error(&mut self, message: &str) -> VmError {
        self.throw_error("TypeError", message)
    }

    pub fn range_error(&mut self, message: &str) -> VmError {
        self.throw_error("RangeError", message)
    }

    pub fn reference_error(&mut self, message: &str) -> VmError {
        self.throw_error("ReferenceError", message)
    }

    // =========================================================================
    // Frames and calls
    // =========================================================================

    fn push_frame(
        &mut self,
        func: Rc<FunctionBytecode>,
        func_obj: Value,
        upvalues: Vec<Cell>,
        this_value: Value,
        args: Vec<Value>,
        is_ctor: bool,
    ) -> Result<(), VmError> {
        if self.frames.len() >= MAX_CALL_DEPTH {
            return Err(self.range_error("maximum call stack size exceeded"));
        }
        self.budget.memory.charge(
            func.local_count as usize * std::mem::size_of::<Slot>()
                + func.captured.len() * std::mem::size_of::<Value>(),
        )?;

        let mut locals = Vec::with_capacity(func.local_count as usize);
        for i in 0..func.local_count {
            let init = if (i as usize) < func.arg_count as usize {
                args.get(i as usize).cloned().unwrap_or(Value::Undefined)
            } else {
                Value::Undefined
            };
            if func.captured.binary_search(&i).is_ok() {
                locals.push(Slot::Cell(Rc::new(RefCell::new(init))));
            } else {
                locals.push(Slot::Plain(init));
            }
        }

        self.frames.push(Frame {
            func,
            func_obj,
            pc: 0,
            base: self.stack.len(),
            locals,
            args,
            upvalues,
            this_value,
            is_ctor,
        });
        Ok(())
    }

    /// Invoke a callable value. Closures run to completion on a nested
    /// dispatch loop; natives run inline.
    pub fn call_function(
        &mut self,
        func: &Value,
        this: Value,
        args: &[Value],
    ) -> Result<Value, VmError> {
        let Some(obj) = func.as_object() else {
            let shown = to_js_string(func);
            return Err(self.type_error(&format!("{} is not a function", shown)));
        };
        let kind = obj.borrow().kind.clone();
        match kind {
            ObjectKind::Closure(closure) => {
                let this = if closure.func.flags.arrow {
                    closure
                        .lexical_this
                        .as_deref()
                        .cloned()
                        .unwrap_or(Value::Undefined)
                } else {
                    this
                };
                let depth = self.frames.len();
                self.push_frame(
                    Rc::clone(&closure.func),
                    func.clone(),
                    closure.upvalues.clone(),
                    this,
                    args.to_vec(),
                    false,
                )?;
                self.run_until(depth)
            }
            ObjectKind::Native(native) => match native.kind {
                NativeKind::Builtin(f) => f(self, this, args),
                NativeKind::Host(f) => f(args).map_err(VmError::Throw),
            },
            _ => {
                let shown = to_js_string(func);
                Err(self.type_error(&format!("{} is not a function", shown)))
            }
        }
    }

    /// Construct with `new`.
    pub fn construct(&mut self, func: &Value, args: &[Value]) -> Result<Value, VmError> {
        let Some(obj) = func.as_object() else {
            return Err(self.type_error("not a constructor"));
        };
        let kind = obj.borrow().kind.clone();
        match kind {
            ObjectKind::Closure(closure) => {
                if closure.func.flags.arrow {
                    return Err(self.type_error("arrow functions cannot be constructed"));
                }
                let proto = match obj.borrow().props.get("prototype").and_then(|s| s.data()) {
                    Some(Value::Object(p)) => p,
                    _ => Rc::clone(&self.realm.object_proto),
                };
                let this_obj = self.new_object_with(Some(proto), ObjectKind::Plain)?;
                let this = Value::Object(this_obj);
                let depth = self.frames.len();
                self.push_frame(
                    Rc::clone(&closure.func),
                    func.clone(),
                    closure.upvalues.clone(),
                    this.clone(),
                    args.to_vec(),
                    true,
                )?;
                self.run_until(depth)
            }
            ObjectKind::Native(native) => match native.kind {
                NativeKind::Builtin(f) => f(self, Value::Undefined, args),
                NativeKind::Host(f) => f(args).map_err(VmError::Throw),
            },
            _ => Err(self.type_error("not a constructor")),
        }
    }

    // =========================================================================
    // Dispatch loop
    // =========================================================================

    fn run_until(&mut self, target_depth: usize) -> Result<Value, VmError> {
        loop {
            match self.exec_one(target_depth) {
                Ok(Flow::Normal) => {}
                Ok(Flow::Returned(v)) => return Ok(v),
                Err(VmError::Throw(v)) => self.unwind(v, target_depth)?,
                Err(e) => return Err(e),
            }
        }
    }

    /// Exception unwinding per the exception tables. Restores the operand
    /// stack depth recorded at region entry, then enters the catch or
    /// finally handler; frames without a handler are popped. Reaching
    /// `target_depth` re-raises to the calling native code.
    fn unwind(&mut self, mut value: Value, target_depth: usize) -> Result<(), VmError> {
        self.stamp_location(&mut value);
        loop {
            if self.frames.len() <= target_depth {
                return Err(VmError::Throw(value));
            }
            let frame = self.frames.last_mut().expect("frame");
            let pc = (frame.pc.saturating_sub(1)) as u32;
            if let Some(entry) = frame.func.handler_at(pc) {
                let entry = *entry;
                let floor = frame.base + entry.stack_depth as usize;
                if let Some(catch_pc) = entry.catch_pc {
                    frame.pc = catch_pc as usize;
                    self.stack.truncate(floor);
                    self.stack.push(value);
                    return Ok(());
                }
                if let Some(finally_pc) = entry.finally_pc {
                    frame.pc = finally_pc as usize;
                    self.stack.truncate(floor);
                    // Disposition: rethrow `value` when the finally ends
                    self.stack.push(value);
                    self.stack.push(Value::Number(-1.0));
                    return Ok(());
                }
            }
            let frame = self.frames.pop().expect("frame");
            self.stack.truncate(frame.base);
        }
    }

    /// Write the throw site onto error-shaped objects that lack one.
    fn stamp_location(&mut self, value: &mut Value) {
        let Some(frame) = self.frames.last() else {
            return;
        };
        let Value::Object(obj) = value else { return };
        let mut obj = obj.borrow_mut();
        if !matches!(obj.kind, ObjectKind::Error) {
            return;
        }
        if obj.props.has("lineNumber") {
            return;
        }
        let pc = frame.pc.saturating_sub(1) as u32;
        if let Some((line, column)) = frame.func.position_at(pc) {
            obj.props
                .set(Rc::from("lineNumber"), Value::Number(line as f64));
            obj.props
                .set(Rc::from("columnNumber"), Value::Number(column as f64));
        }
    }

    #[inline]
    fn pop(&mut self) -> Value {
        self.stack.pop().unwrap_or(Value::Undefined)
    }

    fn pop_args(&mut self, argc: usize) -> Vec<Value> {
        let at = self.stack.len().saturating_sub(argc);
        self.stack.split_off(at)
    }

    fn exec_one(&mut self, target_depth: usize) -> Result<Flow, VmError> {
        self.budget.tick()?;

        let frame_idx = self.frames.len() - 1;
        let func = Rc::clone(&self.frames[frame_idx].func);
        let code = &func.bytecode;
        let mut pc = self.frames[frame_idx].pc;

        if pc >= code.len() {
            return self.do_return(Value::Undefined, target_depth);
        }
        let Some(op) = OpCode::from_u8(code[pc]) else {
            return Err(self.type_error("corrupt bytecode"));
        };
        pc += 1;

        // Decode the operand
        let mut operand: i64 = 0;
        match op.format() {
            crate::vm::opcode::OpFormat::None => {}
            crate::vm::opcode::OpFormat::U8 => {
                operand = code[pc] as i64;
                pc += 1;
            }
            crate::vm::opcode::OpFormat::I8 | crate::vm::opcode::OpFormat::Label8 => {
                operand = code[pc] as i8 as i64;
                pc += 1;
            }
            crate::vm::opcode::OpFormat::U16 => {
                operand = u16::from_le_bytes([code[pc], code[pc + 1]]) as i64;
                pc += 2;
            }
            crate::vm::opcode::OpFormat::I16 => {
                operand = i16::from_le_bytes([code[pc], code[pc + 1]]) as i64;
                pc += 2;
            }
            crate::vm::opcode::OpFormat::Label => {
                operand =
                    i32::from_le_bytes([code[pc], code[pc + 1], code[pc + 2], code[pc + 3]]) as i64;
                pc += 4;
            }
        }
        self.frames[frame_idx].pc = pc;

        match op {
            OpCode::Invalid | OpCode::Nop | OpCode::Catch => {}

            // ---- Push values ----
            OpCode::PushConst | OpCode::PushConst8 => {
                let v = self.load_const(&func, operand as usize)?;
                self.stack.push(v);
            }
            OpCode::PushMinus1 => self.stack.push(Value::Number(-1.0)),
            OpCode::Push0 => self.stack.push(Value::Number(0.0)),
            OpCode::Push1 => self.stack.push(Value::Number(1.0)),
            OpCode::Push2 => self.stack.push(Value::Number(2.0)),
            OpCode::Push3 => self.stack.push(Value::Number(3.0)),
            OpCode::Push4 => self.stack.push(Value::Number(4.0)),
            OpCode::Push5 => self.stack.push(Value::Number(5.0)),
            OpCode::Push6 => self.stack.push(Value::Number(6.0)),
            OpCode::Push7 => self.stack.push(Value::Number(7.0)),
            OpCode::PushI8 | OpCode::PushI16 => self.stack.push(Value::Number(operand as f64)),
            OpCode::PushTrue => self.stack.push(Value::Bool(true)),
            OpCode::PushFalse => self.stack.push(Value::Bool(false)),
            OpCode::Null => self.stack.push(Value::Null),
            OpCode::Undefined => self.stack.push(Value::Undefined),
            OpCode::PushThis => {
                let v = self.frames[frame_idx].this_value.clone();
                self.stack.push(v);
            }
            OpCode::ThisFunc => {
                let v = self.frames[frame_idx].func_obj.clone();
                self.stack.push(v);
            }
            OpCode::Arguments => {
                let args = self.frames[frame_idx].args.clone();
                let arr = self.new_array_value(args)?;
                self.stack.push(arr);
            }
            OpCode::NewTarget => {
                let frame = &self.frames[frame_idx];
                let v = if frame.is_ctor {
                    frame.func_obj.clone()
                } else {
                    Value::Undefined
                };
                self.stack.push(v);
            }

            // ---- Stack manipulation ----
            OpCode::Drop => {
                self.pop();
            }
            OpCode::Nip => {
                let top = self.pop();
                self.pop();
                self.stack.push(top);
            }
            OpCode::Dup => {
                let top = self.stack.last().cloned().unwrap_or(Value::Undefined);
                self.stack.push(top);
            }
            OpCode::Dup1 => {
                let len = self.stack.len();
                let second = self.stack[len - 2].clone();
                self.stack.insert(len - 1, second);
            }
            OpCode::Dup2 => {
                let len = self.stack.len();
                let a = self.stack[len - 2].clone();
                let b = self.stack[len - 1].clone();
                self.stack.push(a);
                self.stack.push(b);
            }
            OpCode::Swap => {
                let len = self.stack.len();
                self.stack.swap(len - 1, len - 2);
            }
            OpCode::Rot3L => {
                let len = self.stack.len();
                let x = self.stack.remove(len - 3);
                self.stack.push(x);
            }
            OpCode::Insert2 => {
                let len = self.stack.len();
                let top = self.stack[len - 1].clone();
                self.stack.insert(len - 2, top);
            }
            OpCode::Insert3 => {
                let len = self.stack.len();
                let top = self.stack[len - 1].clone();
                self.stack.insert(len - 3, top);
            }
            OpCode::Perm3 => {
                let len = self.stack.len();
                self.stack.swap(len - 3, len - 2);
            }
            OpCode::Perm4 => {
                let len = self.stack.len();
                let a = self.stack.remove(len - 2);
                self.stack.insert(len - 4, a);
            }

            // ---- Locals ----
            OpCode::GetLoc | OpCode::GetLoc8 | OpCode::GetArg => {
                let v = self.read_local(frame_idx, operand as usize);
                self.stack.push(v);
            }
            OpCode::GetLoc0 => {
                let v = self.read_local(frame_idx, 0);
                self.stack.push(v);
            }
            OpCode::GetLoc1 => {
                let v = self.read_local(frame_idx, 1);
                self.stack.push(v);
            }
            OpCode::GetLoc2 => {
                let v = self.read_local(frame_idx, 2);
                self.stack.push(v);
            }
            OpCode::GetLoc3 => {
                let v = self.read_local(frame_idx, 3);
                self.stack.push(v);
            }
            OpCode::PutLoc | OpCode::PutLoc8 | OpCode::PutArg => {
                let v = self.pop();
                self.write_local(frame_idx, operand as usize, v);
            }
            OpCode::PutLoc0 => {
                let v = self.pop();
                self.write_local(frame_idx, 0, v);
            }
            OpCode::PutLoc1 => {
                let v = self.pop();
                self.write_local(frame_idx, 1, v);
            }
            OpCode::PutLoc2 => {
                let v = self.pop();
                self.write_local(frame_idx, 2, v);
            }
            OpCode::PutLoc3 => {
                let v = self.pop();
                self.write_local(frame_idx, 3, v);
            }
            OpCode::GetVarRef => {
                let v = self.frames[frame_idx].upvalues[operand as usize]
                    .borrow()
                    .clone();
                self.stack.push(v);
            }
            OpCode::PutVarRef => {
                let v = self.pop();
                *self.frames[frame_idx].upvalues[operand as usize].borrow_mut() = v;
            }

            // ---- Globals ----
            OpCode::GetGlobal => {
                let name = self.const_name(&func, operand as usize)?;
                let found = self.global.borrow().props.get(&name).cloned();
                match found {
                    Some(PropSlot::Data(v)) => self.stack.push(v),
                    Some(PropSlot::Accessor { getter, .. }) => {
                        let this = Value::Object(Rc::clone(&self.global));
                        let v = match getter {
                            Some(g) => self.call_function(&g, this, &[])?,
                            None => Value::Undefined,
                        };
                        self.stack.push(v);
                    }
                    None => {
                        return Err(self.reference_error(&format!("{} is not defined", name)));
                    }
                }
            }
            OpCode::PutGlobal => {
                let name = self.const_name(&func, operand as usize)?;
                let v = self.pop();
                let has = self.global.borrow().props.has(&name);
                if !has {
                    return Err(self.reference_error(&format!("{} is not defined", name)));
                }
                let setter = match self.global.borrow().props.get(&name) {
                    Some(PropSlot::Accessor { setter, .. }) => setter.clone(),
                    _ => None,
                };
                match setter {
                    Some(s) => {
                        let this = Value::Object(Rc::clone(&self.global));
                        self.call_function(&s, this, &[v])?;
                    }
                    None => {
                        self.global.borrow_mut().props.set(Rc::from(&*name), v);
                    }
                }
            }
            OpCode::DeclGlobal => {
                let name = self.const_name(&func, operand as usize)?;
                let v = self.pop();
                let mut global = self.global.borrow_mut();
                if !global.props.has(&name) {
                    global.props.set(Rc::from(&*name), v);
                }
            }
            OpCode::TypeofGlobal => {
                let name = self.const_name(&func, operand as usize)?;
                let found = self.global.borrow().props.get(&name).and_then(|s| s.data());
                let type_name = match &found {
                    Some(v) => type_of(v),
                    None => "undefined",
                };
                let v = self.alloc_str(type_name)?;
                self.stack.push(v);
            }

            // ---- Properties ----
            OpCode::GetField => {
                let name = self.const_name(&func, operand as usize)?;
                let obj = self.pop();
                let v = self.get_property(&obj, &name)?;
                self.stack.push(v);
            }
            OpCode::GetField2 => {
                let name = self.const_name(&func, operand as usize)?;
                let obj = self.pop();
                let v = self.get_property(&obj, &name)?;
                self.stack.push(obj);
                self.stack.push(v);
            }
            OpCode::PutField => {
                let name = self.const_name(&func, operand as usize)?;
                let v = self.pop();
                let obj = self.pop();
                self.set_property(&obj, &name, v)?;
            }
            OpCode::DefineField => {
                let name = self.const_name(&func, operand as usize)?;
                let v = self.pop();
                let obj = self.stack.last().cloned().unwrap_or(Value::Undefined);
                if let Value::Object(o) = obj {
                    o.borrow_mut().props.set(Rc::from(&*name), v);
                }
            }
            OpCode::DefineGetter | OpCode::DefineSetter => {
                let name = self.const_name(&func, operand as usize)?;
                let f = self.pop();
                let obj = self.stack.last().cloned().unwrap_or(Value::Undefined);
                if let Value::Object(o) = obj {
                    if matches!(op, OpCode::DefineGetter) {
                        o.borrow_mut()
                            .props
                            .define_accessor(Rc::from(&*name), Some(f), None);
                    } else {
                        o.borrow_mut()
                            .props
                            .define_accessor(Rc::from(&*name), None, Some(f));
                    }
                }
            }
            OpCode::GetArrayEl => {
                let key = self.pop();
                let obj = self.pop();
                let v = self.get_element(&obj, &key)?;
                self.stack.push(v);
            }
            OpCode::GetArrayEl2 => {
                let key = self.pop();
                let obj = self.pop();
                let v = self.get_element(&obj, &key)?;
                self.stack.push(obj);
                self.stack.push(v);
            }
            OpCode::PutArrayEl => {
                let v = self.pop();
                let key = self.pop();
                let obj = self.pop();
                self.set_element(&obj, &key, v)?;
            }
            OpCode::GetLength => {
                let obj = self.pop();
                let v = match &obj {
                    Value::String(s) => Value::Number(s.len() as f64),
                    Value::Object(o) if o.borrow().is_array() => {
                        let len = o.borrow().elements().map(|e| e.len()).unwrap_or(0);
                        Value::Number(len as f64)
                    }
                    _ => self.get_property(&obj, "length")?,
                };
                self.stack.push(v);
            }
            OpCode::SetProto => {
                let proto = self.pop();
                let obj = self.stack.last().cloned().unwrap_or(Value::Undefined);
                if let Value::Object(o) = obj {
                    match proto {
                        Value::Object(p) => o.borrow_mut().proto = Some(p),
                        Value::Null => o.borrow_mut().proto = None,
                        _ => {}
                    }
                }
            }

            // ---- Control flow ----
            OpCode::Goto | OpCode::Goto8 => {
                self.frames[frame_idx].pc = (pc as i64 + operand) as usize;
            }
            OpCode::IfTrue | OpCode::IfTrue8 => {
                let v = self.pop();
                if to_boolean(&v) {
                    self.frames[frame_idx].pc = (pc as i64 + operand) as usize;
                }
            }
            OpCode::IfFalse | OpCode::IfFalse8 => {
                let v = self.pop();
                if !to_boolean(&v) {
                    self.frames[frame_idx].pc = (pc as i64 + operand) as usize;
                }
            }
            OpCode::Gosub => {
                self.stack.push(Value::Undefined);
                self.stack.push(Value::Number(pc as f64));
                self.frames[frame_idx].pc = (pc as i64 + operand) as usize;
            }
            OpCode::Ret => {
                let marker = self.pop();
                let payload = self.pop();
                let resume = to_number(&marker);
                if resume >= 0.0 {
                    self.frames[frame_idx].pc = resume as usize;
                } else {
                    // Unwinding disposition: keep propagating the value
                    return Err(VmError::Throw(payload));
                }
            }
            OpCode::Call => {
                let args = self.pop_args(operand as usize);
                let f = self.pop();
                self.invoke(f, Value::Undefined, args, false)?;
            }
            OpCode::CallMethod => {
                let args = self.pop_args(operand as usize);
                let f = self.pop();
                let this = self.pop();
                self.invoke(f, this, args, false)?;
            }
            OpCode::CallConstructor => {
                let args = self.pop_args(operand as usize);
                let f = self.pop();
                let v = self.construct(&f, &args)?;
                self.stack.push(v);
            }
            OpCode::Return => {
                let v = self.pop();
                return self.do_return(v, target_depth);
            }
            OpCode::ReturnUndef => {
                return self.do_return(Value::Undefined, target_depth);
            }
            OpCode::Throw => {
                let v = self.pop();
                return Err(VmError::Throw(v));
            }

            // ---- Iteration ----
            OpCode::ForInStart => {
                let v = self.pop();
                let keys = self.enumerate_keys(&v)?;
                let iter = self.new_object_with(
                    None,
                    ObjectKind::Iter(IterState {
                        items: keys,
                        index: 0,
                    }),
                )?;
                self.stack.push(Value::Object(iter));
            }
            OpCode::ForOfStart => {
                let v = self.pop();
                let items = self.iterable_items(&v)?;
                let iter = self.new_object_with(
                    None,
                    ObjectKind::Iter(IterState { items, index: 0 }),
                )?;
                self.stack.push(Value::Object(iter));
            }
            OpCode::ForOfNext | OpCode::EnumNext => {
                let iter = self.stack.last().cloned().unwrap_or(Value::Undefined);
                let Some(obj) = iter.as_object() else {
                    return Err(self.type_error("iterator expected"));
                };
                let mut obj = obj.borrow_mut();
                let ObjectKind::Iter(state) = &mut obj.kind else {
                    return Err(self.type_error("iterator expected"));
                };
                if state.index < state.items.len() {
                    let item = state.items[state.index].clone();
                    state.index += 1;
                    drop(obj);
                    self.stack.push(item);
                    self.stack.push(Value::Bool(false));
                } else {
                    drop(obj);
                    self.stack.push(Value::Undefined);
                    self.stack.push(Value::Bool(true));
                }
            }

            // ---- Arithmetic ----
            OpCode::Add => {
                let b = self.pop();
                let a = self.pop();
                let v = value::js_add(&a, &b);
                if let Value::String(s) = &v {
                    self.budget.memory.charge(s.byte_size())?;
                }
                self.stack.push(v);
            }
            OpCode::Sub => self.numeric_binop(|a, b| a - b),
            OpCode::Mul => self.numeric_binop(|a, b| a * b),
            OpCode::Div => self.numeric_binop(|a, b| a / b),
            OpCode::Mod => self.numeric_binop(|a, b| a % b),
            OpCode::Pow => self.numeric_binop(f64::powf),
            OpCode::Neg => {
                let v = self.pop();
                self.stack.push(Value::Number(-to_number(&v)));
            }
            OpCode::Plus => {
                let v = self.pop();
                self.stack.push(Value::Number(to_number(&v)));
            }
            OpCode::Inc => {
                let v = self.pop();
                self.stack.push(Value::Number(to_number(&v) + 1.0));
            }
            OpCode::Dec => {
                let v = self.pop();
                self.stack.push(Value::Number(to_number(&v) - 1.0));
            }
            OpCode::PostInc => {
                let v = self.pop();
                let n = to_number(&v);
                self.stack.push(Value::Number(n));
                self.stack.push(Value::Number(n + 1.0));
            }
            OpCode::PostDec => {
                let v = self.pop();
                let n = to_number(&v);
                self.stack.push(Value::Number(n));
                self.stack.push(Value::Number(n - 1.0));
            }

            // ---- Bitwise ----
            OpCode::Shl => self.int_binop(|a, b| a.wrapping_shl(b as u32 & 31)),
            OpCode::Sar => self.int_binop(|a, b| a.wrapping_shr(b as u32 & 31)),
            OpCode::Shr => {
                let b = self.pop();
                let a = self.pop();
                let result = to_uint32(&a).wrapping_shr(to_uint32(&b) & 31);
                self.stack.push(Value::Number(result as f64));
            }
            OpCode::And => self.int_binop(|a, b| a & b),
            OpCode::Or => self.int_binop(|a, b| a | b),
            OpCode::Xor => self.int_binop(|a, b| a ^ b),
            OpCode::Not => {
                let v = self.pop();
                self.stack.push(Value::Number(!to_int32(&v) as f64));
            }

            // ---- Comparison ----
            OpCode::Lt => self.compare_op(|ord| ord == Ordering::Less),
            OpCode::Lte => self.compare_op(|ord| ord != Ordering::Greater),
            OpCode::Gt => self.compare_op(|ord| ord == Ordering::Greater),
            OpCode::Gte => self.compare_op(|ord| ord != Ordering::Less),
            OpCode::Eq => {
                let b = self.pop();
                let a = self.pop();
                self.stack.push(Value::Bool(loose_equals(&a, &b)));
            }
            OpCode::Neq => {
                let b = self.pop();
                let a = self.pop();
                self.stack.push(Value::Bool(!loose_equals(&a, &b)));
            }
            OpCode::StrictEq => {
                let b = self.pop();
                let a = self.pop();
                self.stack.push(Value::Bool(strict_equals(&a, &b)));
            }
            OpCode::StrictNeq => {
                let b = self.pop();
                let a = self.pop();
                self.stack.push(Value::Bool(!strict_equals(&a, &b)));
            }
            OpCode::LNot => {
                let v = self.pop();
                self.stack.push(Value::Bool(!to_boolean(&v)));
            }
            OpCode::TypeOf => {
                let v = self.pop();
                let s = self.alloc_str(type_of(&v))?;
                self.stack.push(s);
            }
            OpCode::Delete => {
                let key = self.pop();
                let obj = self.pop();
                let v = self.delete_property(&obj, &key)?;
                self.stack.push(Value::Bool(v));
            }
            OpCode::InstanceOf => {
                let ctor = self.pop();
                let v = self.pop();
                let result = self.instance_of(&v, &ctor)?;
                self.stack.push(Value::Bool(result));
            }
            OpCode::In => {
                let obj = self.pop();
                let key = self.pop();
                let Value::Object(o) = &obj else {
                    return Err(
                        self.type_error("cannot use 'in' operator on a non-object")
                    );
                };
                let found = if let Some(idx) = to_array_index(&key) {
                    let b = o.borrow();
                    match b.elements() {
                        Some(els) => idx < els.len(),
                        None => self.has_property(o, &to_js_string(&key)),
                    }
                } else {
                    self.has_property(o, &to_js_string(&key))
                };
                self.stack.push(Value::Bool(found));
            }

            // ---- Construction ----
            OpCode::Object => {
                let obj = self.new_plain_object()?;
                self.stack.push(Value::Object(obj));
            }
            OpCode::ArrayFrom => {
                let elements = self.pop_args(operand as usize);
                let arr = self.new_array_value(elements)?;
                self.stack.push(arr);
            }
            OpCode::FClosure | OpCode::FClosure8 => {
                let Const::Function(template) = &func.constants[operand as usize] else {
                    return Err(self.type_error("corrupt constant pool"));
                };
                let template = Rc::clone(template);
                let closure = self.make_closure(frame_idx, template)?;
                self.stack.push(closure);
            }
            OpCode::Regexp => {
                let Const::Regex(re) = &func.constants[operand as usize] else {
                    return Err(self.type_error("corrupt constant pool"));
                };
                let re = Rc::clone(re);
                let v = self.make_regexp_object(re)?;
                self.stack.push(v);
            }
        }

        Ok(Flow::Normal)
    }

    fn do_return(&mut self, value: Value, target_depth: usize) -> Result<Flow, VmError> {
        let frame = self.frames.pop().expect("frame");
        self.stack.truncate(frame.base);
        let out = if frame.is_ctor && !value.is_object() {
            frame.this_value
        } else {
            value
        };
        if self.frames.len() == target_depth {
            Ok(Flow::Returned(out))
        } else {
            self.stack.push(out);
            Ok(Flow::Normal)
        }
    }

    /// Call dispatch for the Call/CallMethod opcodes: closures continue on
    /// this dispatch loop, natives push their result directly.
    fn invoke(
        &mut self,
        f: Value,
        this: Value,
        args: Vec<Value>,
        _is_ctor: bool,
    ) -> Result<(), VmError> {
        let Some(obj) = f.as_object() else {
            let shown = to_js_string(&f);
            return Err(self.type_error(&format!("{} is not a function", shown)));
        };
        let kind = obj.borrow().kind.clone();
        match kind {
            ObjectKind::Closure(closure) => {
                let this = if closure.func.flags.arrow {
                    closure
                        .lexical_this
                        .as_deref()
                        .cloned()
                        .unwrap_or(Value::Undefined)
                } else {
                    this
                };
                self.push_frame(
                    Rc::clone(&closure.func),
                    f.clone(),
                    closure.upvalues.clone(),
                    this,
                    args,
                    false,
                )
            }
            ObjectKind::Native(native) => {
                let result = match native.kind {
                    NativeKind::Builtin(builtin) => builtin(self, this, &args)?,
                    NativeKind::Host(host) => host(&args).map_err(VmError::Throw)?,
                };
                self.stack.push(result);
                Ok(())
            }
            _ => {
                let shown = to_js_string(&f);
                Err(self.type_error(&format!("{} is not a function", shown)))
            }
        }
    }

    fn load_const(&mut self, func: &FunctionBytecode, idx: usize) -> Result<Value, VmError> {
        match func.constants.get(idx) {
            Some(Const::Number(n)) => Ok(Value::Number(*n)),
            Some(Const::String(s)) => Ok(Value::String(Rc::clone(s))),
            Some(Const::Function(_)) | Some(Const::Regex(_)) | None => {
                Err(self.type_error("corrupt constant pool"))
            }
        }
    }

    fn const_name(&mut self, func: &FunctionBytecode, idx: usize) -> Result<Rc<str>, VmError> {
        match func.constants.get(idx) {
            Some(Const::String(s)) => Ok(Rc::from(s.to_rust_string())),
            _ => Err(self.type_error("corrupt constant pool")),
        }
    }

    fn read_local(&self, frame_idx: usize, slot: usize) -> Value {
        match &self.frames[frame_idx].locals[slot] {
            Slot::Plain(v) => v.clone(),
            Slot::Cell(cell) => cell.borrow().clone(),
        }
    }

    fn write_local(&mut self, frame_idx: usize, slot: usize, value: Value) {
        match &mut self.frames[frame_idx].locals[slot] {
            Slot::Plain(v) => *v = value,
            Slot::Cell(cell) => *cell.borrow_mut() = value,
        }
    }

    fn numeric_binop(&mut self, f: impl Fn(f64, f64) -> f64) {
        let b = self.pop();
        let a = self.pop();
        self.stack.push(Value::Number(f(to_number(&a), to_number(&b))));
    }

    fn int_binop(&mut self, f: impl Fn(i32, i32) -> i32) {
        let b = self.pop();
        let a = self.pop();
        self.stack
            .push(Value::Number(f(to_int32(&a), to_int32(&b)) as f64));
    }

    fn compare_op(&mut self, f: impl Fn(Ordering) -> bool) {
        let b = self.pop();
        let a = self.pop();
        let result = compare(&a, &b).map(f).unwrap_or(false);
        self.stack.push(Value::Bool(result));
    }

    /// Build a closure object from a function template, resolving its
    /// upvalue sources against the creating frame.
    fn make_closure(
        &mut self,
        frame_idx: usize,
        template: Rc<FunctionBytecode>,
    ) -> Result<Value, VmError> {
        let mut upvalues = Vec::with_capacity(template.upvalues.len());
        for source in &template.upvalues {
            let cell = match source {
                UpvalueSource::ParentLocal(slot) => {
                    let frame = &mut self.frames[frame_idx];
                    match &frame.locals[*slot as usize] {
                        Slot::Cell(cell) => Rc::clone(cell),
                        Slot::Plain(v) => {
                            // Promote on demand so the frame and the
                            // closure share one cell
                            let cell = Rc::new(RefCell::new(v.clone()));
                            frame.locals[*slot as usize] = Slot::Cell(Rc::clone(&cell));
                            cell
                        }
                    }
                }
                UpvalueSource::ParentUpvalue(idx) => {
                    Rc::clone(&self.frames[frame_idx].upvalues[*idx as usize])
                }
            };
            upvalues.push(cell);
        }

        let lexical_this = if template.flags.arrow {
            Some(Box::new(self.frames[frame_idx].this_value.clone()))
        } else {
            None
        };
        let arrow = template.flags.arrow;
        let name = template.name.clone();
        let arg_count = template.arg_count;

        let closure = JsClosure {
            func: template,
            upvalues,
            lexical_this,
        };
        let func_obj = self.new_object_with(
            Some(Rc::clone(&self.realm.function_proto)),
            ObjectKind::Closure(closure),
        )?;
        {
            let mut b = func_obj.borrow_mut();
            b.props
                .set_hidden(Rc::from("name"), Value::string(name.as_deref().unwrap_or("")));
            b.props
                .set_hidden(Rc::from("length"), Value::Number(arg_count as f64));
        }
        if !arrow {
            let proto_obj = self.new_plain_object()?;
            proto_obj
                .borrow_mut()
                .props
                .set_hidden(Rc::from("constructor"), Value::Object(Rc::clone(&func_obj)));
            func_obj
                .borrow_mut()
                .props
                .set_hidden(Rc::from("prototype"), Value::Object(proto_obj));
        }
        Ok(Value::Object(func_obj))
    }

    /// Build a scripting-visible RegExp object around a compiled program.
    pub fn make_regexp_object(&mut self, re: Rc<Regex>) -> Result<Value, VmError> {
        self.budget.memory.charge(re.byte_size())?;
        let obj = self.new_object_with(
            Some(Rc::clone(&self.realm.regexp_proto)),
            ObjectKind::Regexp(Rc::clone(&re)),
        )?;
        {
            let mut b = obj.borrow_mut();
            let flags = re.flags;
            b.props
                .set_hidden(Rc::from("source"), Value::string(&re.source));
            b.props
                .set_hidden(Rc::from("flags"), Value::string(&re.flag_str));
            b.props.set_hidden(
                Rc::from("global"),
                Value::Bool(flags.contains(crate::regex::Flags::GLOBAL)),
            );
            b.props.set_hidden(
                Rc::from("ignoreCase"),
                Value::Bool(flags.contains(crate::regex::Flags::IGNORE_CASE)),
            );
            b.props.set_hidden(
                Rc::from("multiline"),
                Value::Bool(flags.contains(crate::regex::Flags::MULTILINE)),
            );
            b.props.set_hidden(
                Rc::from("dotAll"),
                Value::Bool(flags.contains(crate::regex::Flags::DOT_ALL)),
            );
            b.props.set_hidden(
                Rc::from("unicode"),
                Value::Bool(flags.contains(crate::regex::Flags::UNICODE)),
            );
            b.props.set_hidden(
                Rc::from("sticky"),
                Value::Bool(flags.contains(crate::regex::Flags::STICKY)),
            );
            b.props.set(Rc::from("lastIndex"), Value::Number(0.0));
        }
        Ok(Value::Object(obj))
    }

    // =========================================================================
    // Property access
    // =========================================================================

    /// Read a property, walking the prototype chain and invoking getters.
    /// Primitives route through their prototype objects.
    pub fn get_property(&mut self, target: &Value, key: &str) -> Result<Value, VmError> {
        match target {
            Value::Undefined | Value::Null => Err(self.type_error(&format!(
                "cannot read properties of {} (reading '{}')",
                to_js_string(target),
                key
            ))),
            Value::String(s) => {
                if key == "length" {
                    return Ok(Value::Number(s.len() as f64));
                }
                if let Ok(idx) = key.parse::<usize>() {
                    return Ok(match s.char_at(idx) {
                        Some(c) => self.new_string_value(c)?,
                        None => Value::Undefined,
                    });
                }
                let proto = Rc::clone(&self.realm.string_proto);
                self.lookup_chain(Some(proto), target, key)
            }
            Value::Number(_) => {
                let proto = Rc::clone(&self.realm.number_proto);
                self.lookup_chain(Some(proto), target, key)
            }
            Value::Bool(_) => {
                let proto = Rc::clone(&self.realm.boolean_proto);
                self.lookup_chain(Some(proto), target, key)
            }
            Value::Object(obj) => {
                {
                    let b = obj.borrow();
                    if let Some(elements) = b.elements() {
                        if key == "length" {
                            return Ok(Value::Number(elements.len() as f64));
                        }
                        if let Ok(idx) = key.parse::<usize>() {
                            return Ok(elements.get(idx).cloned().unwrap_or(Value::Undefined));
                        }
                    }
                }
                self.lookup_chain(Some(Rc::clone(obj)), target, key)
            }
        }
    }

    fn lookup_chain(
        &mut self,
        start: Option<ObjRef>,
        this: &Value,
        key: &str,
    ) -> Result<Value, VmError> {
        let mut cursor = start;
        let mut hops = 0;
        while let Some(obj) = cursor {
            if hops > 1000 {
                return Err(self.type_error("prototype chain too long"));
            }
            hops += 1;
            let slot = obj.borrow().props.get(key).cloned();
            match slot {
                Some(PropSlot::Data(v)) => return Ok(v),
                Some(PropSlot::Accessor { getter, .. }) => {
                    return match getter {
                        Some(g) => self.call_function(&g, this.clone(), &[]),
                        None => Ok(Value::Undefined),
                    };
                }
                None => cursor = obj.borrow().proto.clone(),
            }
        }
        Ok(Value::Undefined)
    }

    /// Write a property. Setters anywhere on the chain intercept; data
    /// properties are created or overwritten on the object itself.
    pub fn set_property(&mut self, target: &Value, key: &str, value: Value) -> Result<(), VmError> {
        let Value::Object(obj) = target else {
            return Err(self.type_error(&format!(
                "cannot set property '{}' on {}",
                key,
                type_of(target)
            )));
        };

        // Array specials
        if obj.borrow().is_array() {
            if key == "length" {
                let new_len = to_number(&value);
                if new_len < 0.0 || new_len.fract() != 0.0 {
                    return Err(self.range_error("invalid array length"));
                }
                let new_len = new_len as usize;
                let mut b = obj.borrow_mut();
                let elements = b.elements_mut().expect("array");
                if new_len < elements.len() {
                    elements.truncate(new_len);
                } else {
                    elements.resize(new_len, Value::Undefined);
                }
                return Ok(());
            }
            if let Ok(idx) = key.parse::<usize>() {
                return self.set_array_index(obj, idx, value);
            }
        }

        // Setter on the chain?
        let mut cursor = Some(Rc::clone(obj));
        while let Some(o) = cursor {
            let slot = o.borrow().props.get(key).cloned();
            match slot {
                Some(PropSlot::Accessor { setter, .. }) => {
                    return match setter {
                        Some(s) => {
                            self.call_function(&s, target.clone(), &[value])?;
                            Ok(())
                        }
                        // Missing setter: silent no-op write
                        None => Ok(()),
                    };
                }
                Some(PropSlot::Data(_)) => break,
                None => cursor = o.borrow().proto.clone(),
            }
        }

        self.budget.memory.charge(key.len() + std::mem::size_of::<Value>())?;
        obj.borrow_mut().props.set(Rc::from(key), value);
        Ok(())
    }

    fn set_array_index(&mut self, obj: &ObjRef, idx: usize, value: Value) -> Result<(), VmError> {
        let mut b = obj.borrow_mut();
        let elements = b.elements_mut().expect("array");
        match idx.cmp(&elements.len()) {
            Ordering::Less => {
                elements[idx] = value;
                Ok(())
            }
            Ordering::Equal => {
                drop(b);
                self.budget.memory.charge(std::mem::size_of::<Value>())?;
                obj.borrow_mut()
                    .elements_mut()
                    .expect("array")
                    .push(value);
                Ok(())
            }
            Ordering::Greater => {
                drop(b);
                Err(self.range_error("array index out of bounds (no holes)"))
            }
        }
    }

    pub fn get_element(&mut self, target: &Value, key: &Value) -> Result<Value, VmError> {
        if let Some(idx) = to_array_index(key) {
            match target {
                Value::Object(obj) => {
                    if let Some(elements) = obj.borrow().elements() {
                        return Ok(elements.get(idx).cloned().unwrap_or(Value::Undefined));
                    }
                }
                Value::String(s) => {
                    return Ok(match s.char_at(idx) {
                        Some(c) => self.new_string_value(c)?,
                        None => Value::Undefined,
                    });
                }
                _ => {}
            }
        }
        let key = to_js_string(key);
        self.get_property(target, &key)
    }

    pub fn set_element(&mut self, target: &Value, key: &Value, value: Value) -> Result<(), VmError> {
        if let Some(idx) = to_array_index(key) {
            if let Value::Object(obj) = target {
                if obj.borrow().is_array() {
                    return self.set_array_index(obj, idx, value);
                }
            }
        }
        let key = to_js_string(key);
        self.set_property(target, &key, value)
    }

    fn delete_property(&mut self, target: &Value, key: &Value) -> Result<bool, VmError> {
        let Value::Object(obj) = target else {
            return Ok(true);
        };
        if obj.borrow().is_array() && to_array_index(key).is_some() {
            return Err(self.type_error("cannot delete array elements"));
        }
        let key = to_js_string(key);
        obj.borrow_mut().props.delete(&key);
        Ok(true)
    }

    fn has_property(&self, obj: &ObjRef, key: &str) -> bool {
        let mut cursor = Some(Rc::clone(obj));
        let mut hops = 0;
        while let Some(o) = cursor {
            if hops > 1000 {
                return false;
            }
            hops += 1;
            if o.borrow().props.has(key) {
                return true;
            }
            cursor = o.borrow().proto.clone();
        }
        false
    }

    fn instance_of(&mut self, value: &Value, ctor: &Value) -> Result<bool, VmError> {
        let Some(ctor_obj) = ctor.as_object() else {
            return Err(self.type_error("right-hand side of 'instanceof' is not callable"));
        };
        if !ctor_obj.borrow().is_callable() {
            return Err(self.type_error("right-hand side of 'instanceof' is not callable"));
        }
        let proto = match ctor_obj.borrow().props.get("prototype").and_then(|s| s.data()) {
            Some(Value::Object(p)) => p,
            _ => return Ok(false),
        };
        let Value::Object(obj) = value else {
            return Ok(false);
        };
        let mut cursor = obj.borrow().proto.clone();
        let mut hops = 0;
        while let Some(o) = cursor {
            if Rc::ptr_eq(&o, &proto) {
                return Ok(true);
            }
            if hops > 1000 {
                return Ok(false);
            }
            hops += 1;
            cursor = o.borrow().proto.clone();
        }
        Ok(false)
    }

    /// `for-in` key snapshot: own enumerable keys in insertion order, then
    /// up the prototype chain skipping shadowed names.
    pub fn enumerate_keys(&mut self, target: &Value) -> Result<Vec<Value>, VmError> {
        let mut keys: Vec<Value> = Vec::new();
        let mut seen: Vec<Rc<str>> = Vec::new();
        let obj = match target {
            Value::Undefined | Value::Null => return Ok(keys),
            Value::String(s) => {
                for i in 0..s.len() {
                    keys.push(self.alloc_str(&i.to_string())?);
                }
                return Ok(keys);
            }
            Value::Object(obj) => obj,
            _ => return Ok(keys),
        };

        {
            let b = obj.borrow();
            if let Some(elements) = b.elements() {
                for i in 0..elements.len() {
                    keys.push(Value::string(&i.to_string()));
                }
            }
        }
        let mut cursor = Some(Rc::clone(obj));
        let mut hops = 0;
        while let Some(o) = cursor {
            if hops > 1000 {
                break;
            }
            hops += 1;
            for key in o.borrow().props.keys() {
                if !seen.iter().any(|k| *k == key) {
                    keys.push(Value::string(&key));
                    seen.push(key);
                }
            }
            cursor = o.borrow().proto.clone();
        }
        Ok(keys)
    }

    /// `for-of` snapshot: array elements or string code points.
    fn iterable_items(&mut self, target: &Value) -> Result<Vec<Value>, VmError> {
        match target {
            Value::Object(obj) => {
                let snapshot = obj.borrow().elements().cloned();
                match snapshot {
                    Some(elements) => Ok(elements),
                    None => Err(self.type_error("value is not iterable")),
                }
            }
            Value::String(s) => {
                let mut items = Vec::new();
                let units = s.units();
                let mut i = 0;
                while i < units.len() {
                    let unit = units[i];
                    let width = if (0xD800..0xDC00).contains(&unit)
                        && i + 1 < units.len()
                        && (0xDC00..0xE000).contains(&units[i + 1])
                    {
                        2
                    } else {
                        1
                    };
                    items.push(self.new_string_value(JsString::from_units(
                        units[i..i + width].to_vec(),
                    ))?);
                    i += width;
                }
                Ok(items)
            }
            _ => Err(self.type_error("value is not iterable")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtins;
    use crate::vm::budget::MemoryBudget;

    fn eval(source: &str) -> Result<Value, VmError> {
        let program = crate::parser::compile(source).expect("compile");
        let memory = MemoryBudget::new(None);
        let (realm, global) = builtins::install(&memory).expect("install");
        let budget = Budget::new(None, None, 100, memory);
        let mut vm = Vm::new(global, realm, budget);
        vm.run_program(program)
    }

    fn eval_ok(source: &str) -> Value {
        eval(source).unwrap_or_else(|e| panic!("eval failed for {:?}: {:?}", source, e))
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(eval_ok("1 + 2;").as_number(), Some(3.0));
        assert_eq!(eval_ok("10 % 3;").as_number(), Some(1.0));
        assert_eq!(eval_ok("2 ** 10;").as_number(), Some(1024.0));
        assert_eq!(eval_ok("1 / 0;").as_number(), Some(f64::INFINITY));
        assert!(eval_ok("0 / 0;").as_number().unwrap().is_nan());
    }

    #[test]
    fn test_add_duality() {
        assert_eq!(eval_ok("\"a\" + 1;").as_str().unwrap(), "a1");
        assert_eq!(eval_ok("1 + \"a\";").as_str().unwrap(), "1a");
        assert_eq!(eval_ok("1 + 2 + \"a\";").as_str().unwrap(), "3a");
    }

    #[test]
    fn test_bitwise_semantics() {
        assert_eq!(eval_ok("-1 >>> 0;").as_number(), Some(4294967295.0));
        assert_eq!(eval_ok("-1 >> 1;").as_number(), Some(-1.0));
        assert_eq!(eval_ok("1 << 31;").as_number(), Some(-2147483648.0));
        assert_eq!(eval_ok("5 & 3;").as_number(), Some(1.0));
    }

    #[test]
    fn test_locals_and_scopes() {
        assert_eq!(eval_ok("var x = 1; { let x = 2; } x;").as_number(), Some(1.0));
        assert_eq!(eval_ok("var x = 1; { let x = 2; x; }").as_number(), Some(2.0));
    }

    #[test]
    fn test_function_calls() {
        assert_eq!(
            eval_ok("function add(a, b) { return a + b; } add(add(1, 2), 3);").as_number(),
            Some(6.0)
        );
        assert_eq!(
            eval_ok("function f() { return arguments.length; } f(1, 2, 3);").as_number(),
            Some(3.0)
        );
    }

    #[test]
    fn test_closure_cells_shared() {
        let source = "
            function mk() {
                var c = 0;
                return function () { return ++c; };
            }
            var f = mk();
            f(); f(); f();
        ";
        assert_eq!(eval_ok(source).as_number(), Some(3.0));
    }

    #[test]
    fn test_closures_from_distinct_calls_do_not_share() {
        let source = "
            function mk() {
                var c = 0;
                return function () { return ++c; };
            }
            var a = mk();
            var b = mk();
            a(); a();
            b();
        ";
        assert_eq!(eval_ok(source).as_number(), Some(1.0));
    }

    #[test]
    fn test_two_closures_same_call_share() {
        let source = "
            function mk() {
                var c = 0;
                return [function () { return ++c; }, function () { return ++c; }];
            }
            var pair = mk();
            pair[0]();
            pair[1]();
        ";
        assert_eq!(eval_ok(source).as_number(), Some(2.0));
    }

    #[test]
    fn test_try_catch_finally_order() {
        let source = "
            var s = \"\";
            try { s += \"t\"; throw \"c\"; } catch (e) { s += e; } finally { s += \"f\"; }
            s;
        ";
        assert_eq!(eval_ok(source).as_str().unwrap(), "tcf");
    }

    #[test]
    fn test_finally_runs_on_return() {
        let source = "
            var log = \"\";
            function f() {
                try { return \"r\"; } finally { log += \"f\"; }
            }
            f() + log;
        ";
        assert_eq!(eval_ok(source).as_str().unwrap(), "rf");
    }

    #[test]
    fn test_uncaught_throw_escapes() {
        match eval("throw 42;") {
            Err(VmError::Throw(v)) => assert_eq!(v.as_number(), Some(42.0)),
            other => panic!("expected throw, got {:?}", other),
        }
    }

    #[test]
    fn test_nested_unwind_through_frames() {
        let source = "
            function inner() { throw \"boom\"; }
            function outer() { inner(); }
            var got = \"\";
            try { outer(); } catch (e) { got = e; }
            got;
        ";
        assert_eq!(eval_ok(source).as_str().unwrap(), "boom");
    }

    #[test]
    fn test_error_location_stamped_at_throw() {
        let source = "
            var line = 0;
            try {
                throw new Error(\"x\");
            } catch (e) { line = e.lineNumber; }
            line;
        ";
        assert_eq!(eval_ok(source).as_number(), Some(4.0));
    }

    #[test]
    fn test_for_in_insertion_order() {
        let source = "
            var o = {z: 1, a: 2, m: 3};
            var keys = \"\";
            for (var k in o) { keys += k; }
            keys;
        ";
        assert_eq!(eval_ok(source).as_str().unwrap(), "zam");
    }

    #[test]
    fn test_for_in_prototype_chain() {
        let source = "
            function Base() {}
            Base.prototype.b = 1;
            var o = new Base();
            o.a = 2;
            var keys = \"\";
            for (var k in o) { keys += k; }
            keys;
        ";
        assert_eq!(eval_ok(source).as_str().unwrap(), "ab");
    }

    #[test]
    fn test_for_of_and_break() {
        let source = "
            var total = 0;
            for (var v of [1, 2, 3, 4]) {
                if (v === 3) { break; }
                total += v;
            }
            total;
        ";
        assert_eq!(eval_ok(source).as_number(), Some(3.0));
    }

    #[test]
    fn test_switch_dispatch() {
        let source = "
            function pick(x) {
                var out = \"\";
                switch (x) {
                    case 1: out += \"one \";
                    case 2: out += \"two\"; break;
                    default: out = \"other\";
                }
                return out;
            }
            pick(1) + \"|\" + pick(2) + \"|\" + pick(9);
        ";
        assert_eq!(eval_ok(source).as_str().unwrap(), "one two|two|other");
    }

    #[test]
    fn test_constructor_and_instanceof() {
        let source = "
            function Point(x, y) { this.x = x; this.y = y; }
            Point.prototype.norm = function () { return this.x * this.x + this.y * this.y; };
            var p = new Point(3, 4);
            (p instanceof Point) && p.norm() === 25;
        ";
        assert_eq!(eval_ok(source).as_bool(), Some(true));
    }

    #[test]
    fn test_accessors() {
        let source = "
            var o = {
                _x: 1,
                get x() { return this._x; },
                set x(v) { this._x = v * 2; }
            };
            o.x = 21;
            o.x;
        ";
        assert_eq!(eval_ok(source).as_number(), Some(42.0));
    }

    #[test]
    fn test_undeclared_global_reference() {
        assert!(matches!(eval("missing;"), Err(VmError::Throw(_))));
        assert_eq!(eval_ok("typeof missing;").as_str().unwrap(), "undefined");
    }

    #[test]
    fn test_array_no_holes() {
        assert!(matches!(
            eval("var a = [1]; a[5] = 2;"),
            Err(VmError::Throw(_))
        ));
        // Appending at the end is allowed
        assert_eq!(eval_ok("var a = [1]; a[1] = 2; a.length;").as_number(), Some(2.0));
    }

    #[test]
    fn test_call_depth_limit() {
        let result = eval("function f() { return f(); } f();");
        assert!(matches!(result, Err(VmError::Throw(_))));
    }

    #[test]
    fn test_time_limit_uncatchable() {
        let program = crate::parser::compile("try { while (true) {} } catch (e) { 1; }")
            .expect("compile");
        let memory = MemoryBudget::new(None);
        let (realm, global) = builtins::install(&memory).expect("install");
        let deadline = std::time::Instant::now() + std::time::Duration::from_millis(30);
        let budget = Budget::new(Some(deadline), None, 100, memory);
        let mut vm = Vm::new(global, realm, budget);
        assert!(matches!(
            vm.run_program(program),
            Err(VmError::TimeLimit)
        ));
    }

    #[test]
    fn test_memory_limit_uncatchable() {
        let program = crate::parser::compile(
            "try { var a = []; while (true) { a[a.length] = \"xxxxxxxxxxxxxxxx\" + a.length; } } catch (e) { 1; }",
        )
        .expect("compile");
        let memory = MemoryBudget::new(Some(256 * 1024));
        let (realm, global) = builtins::install(&memory).expect("install");
        let budget = Budget::new(None, None, 100, memory);
        let mut vm = Vm::new(global, realm, budget);
        assert!(matches!(
            vm.run_program(program),
            Err(VmError::MemoryLimit)
        ));
    }

    #[test]
    fn test_poll_callback_aborts() {
        use std::cell::Cell as StdCell;
        let program = crate::parser::compile("while (true) {}").expect("compile");
        let memory = MemoryBudget::new(None);
        let (realm, global) = builtins::install(&memory).expect("install");
        let count = Rc::new(StdCell::new(0u32));
        let counter = Rc::clone(&count);
        let poll: Rc<dyn Fn() -> bool> = Rc::new(move || {
            counter.set(counter.get() + 1);
            counter.get() > 3
        });
        let budget = Budget::new(None, Some(poll), 100, memory);
        let mut vm = Vm::new(global, realm, budget);
        assert!(matches!(vm.run_program(program), Err(VmError::TimeLimit)));
        assert!(count.get() > 3);
    }

    #[test]
    fn test_optional_chaining_and_nullish() {
        assert_eq!(eval_ok("var a = null; a?.b;").is_undefined(), true);
        assert_eq!(eval_ok("var a = {b: 7}; a?.b;").as_number(), Some(7.0));
        assert_eq!(eval_ok("null ?? 5;").as_number(), Some(5.0));
        assert_eq!(eval_ok("0 ?? 5;").as_number(), Some(0.0));
    }

    #[test]
    fn test_template_literals() {
        assert_eq!(
            eval_ok("var x = 6; `got ${x * 7}!`;").as_str().unwrap(),
            "got 42!"
        );
    }

    #[test]
    fn test_arrow_lexical_this() {
        let source = "
            var o = {
                n: 10,
                collect: function () {
                    var f = () => this.n + 1;
                    return f();
                }
            };
            o.collect();
        ";
        assert_eq!(eval_ok(source).as_number(), Some(11.0));
    }

    #[test]
    fn test_deep_nesting_evaluates() {
        let parens = format!("{}1{};", "(".repeat(1000), ")".repeat(1000));
        assert_eq!(eval_ok(&parens).as_number(), Some(1.0));

        let blocks = format!("{}1;{}", "{".repeat(1000), "}".repeat(1000));
        assert_eq!(eval_ok(&blocks).as_number(), Some(1.0));

        let arrays = format!("var a = {}1{}; a.length;", "[".repeat(1000), "]".repeat(1000));
        assert_eq!(eval_ok(&arrays).as_number(), Some(1.0));

        let chain = format!("var a = {}0{}; a{};", "[".repeat(999), "]".repeat(999), "[0]".repeat(998));
        assert!(eval(&chain).is_ok());
    }

    #[test]
    fn test_post_and_pre_increment() {
        assert_eq!(eval_ok("var x = 5; x++;").as_number(), Some(5.0));
        assert_eq!(eval_ok("var x = 5; x++; x;").as_number(), Some(6.0));
        assert_eq!(eval_ok("var x = 5; ++x;").as_number(), Some(6.0));
        assert_eq!(eval_ok("var o = {n: 1}; o.n++; o.n;").as_number(), Some(2.0));
        assert_eq!(eval_ok("var a = [1]; a[0]++ + a[0];").as_number(), Some(3.0));
    }
}
