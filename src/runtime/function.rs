//! Compiled functions and closures
//!
//! A `FunctionBytecode` is the immutable output of the compiler: opcodes,
//! a constants pool, the exception table, the source map, and the upvalue
//! layout inner closures are built from. Closures pair a bytecode
//! reference with the captured cells.

use crate::regex::Regex;
use crate::runtime::string::JsString;
use crate::value::Value;
use std::cell::RefCell;
use std::rc::Rc;

/// A closure cell: one heap slot shared by every closure that captured a
/// given outer local. Mutation through any holder is visible to all.
pub type Cell = Rc<RefCell<Value>>;

/// Constant pool entry.
#[derive(Debug, Clone)]
pub enum Const {
    Number(f64),
    String(Rc<JsString>),
    Function(Rc<FunctionBytecode>),
    Regex(Rc<Regex>),
}

/// Where a closure's upvalue comes from when the closure is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpvalueSource {
    /// A cell-allocated local slot of the creating frame.
    ParentLocal(u16),
    /// An upvalue of the creating frame, shared onward.
    ParentUpvalue(u16),
}

/// One guarded range of the exception table.
///
/// On throw the innermost entry containing the failing pc is selected;
/// `stack_depth` is the operand depth at region entry, restored before
/// the handler runs.
#[derive(Debug, Clone, Copy)]
pub struct ExceptionEntry {
    pub start: u32,
    pub end: u32,
    pub catch_pc: Option<u32>,
    pub finally_pc: Option<u32>,
    pub stack_depth: u16,
}

/// Source map entry: first opcode offset at which `(line, column)` applies.
#[derive(Debug, Clone, Copy)]
pub struct LineEntry {
    pub pc: u32,
    pub line: u32,
    pub column: u32,
}

/// Function behaviour flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct FnFlags {
    /// Arrow function: lexical `this`, not constructible.
    pub arrow: bool,
}

/// A compiled function.
#[derive(Debug)]
pub struct FunctionBytecode {
    /// Function name (for errors and `toString`)
    pub name: Option<Rc<str>>,
    /// Number of declared parameters (occupying the first local slots)
    pub arg_count: u16,
    /// Total local slots, parameters included
    pub local_count: u16,
    pub flags: FnFlags,
    /// The compiled bytecode
    pub bytecode: Vec<u8>,
    /// Constant pool
    pub constants: Vec<Const>,
    /// Local slots captured by some inner function; cell-allocated at entry
    pub captured: Vec<u16>,
    /// Upvalue layout, resolved against the creating frame
    pub upvalues: Vec<UpvalueSource>,
    /// Guarded pc ranges for try/catch/finally
    pub exceptions: Vec<ExceptionEntry>,
    /// Source map (sorted by pc)
    pub line_table: Vec<LineEntry>,
}

impl FunctionBytecode {
    /// Approximate heap footprint, for the memory budget.
    pub fn byte_size(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.bytecode.len()
            + self.constants.len() * std::mem::size_of::<Const>()
            + self.exceptions.len() * std::mem::size_of::<ExceptionEntry>()
            + self.line_table.len() * std::mem::size_of::<LineEntry>()
    }

    /// Source position for a pc, from the source map.
    pub fn position_at(&self, pc: u32) -> Option<(u32, u32)> {
        if self.line_table.is_empty() {
            return None;
        }
        let idx = self
            .line_table
            .partition_point(|e| e.pc <= pc)
            .saturating_sub(1);
        self.line_table.get(idx).map(|e| (e.line, e.column))
    }

    /// Innermost exception-table entry covering `pc` that carries a
    /// catch or finally handler.
    ///
    /// Entries are recorded outermost-first, so the last match wins.
    pub fn handler_at(&self, pc: u32) -> Option<&ExceptionEntry> {
        self.exceptions
            .iter()
            .rev()
            .find(|e| {
                e.start <= pc
                    && pc < e.end
                    && (e.catch_pc.is_some() || e.finally_pc.is_some())
            })
    }
}

/// A JavaScript closure: bytecode plus captured cells.
#[derive(Debug, Clone)]
pub struct JsClosure {
    pub func: Rc<FunctionBytecode>,
    pub upvalues: Vec<Cell>,
    /// `this` captured at creation, for arrow functions only.
    pub lexical_this: Option<Box<Value>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_func() -> FunctionBytecode {
        FunctionBytecode {
            name: None,
            arg_count: 0,
            local_count: 0,
            flags: FnFlags::default(),
            bytecode: Vec::new(),
            constants: Vec::new(),
            captured: Vec::new(),
            upvalues: Vec::new(),
            exceptions: Vec::new(),
            line_table: Vec::new(),
        }
    }

    #[test]
    fn test_position_lookup() {
        let mut f = empty_func();
        f.line_table = vec![
            LineEntry { pc: 0, line: 1, column: 1 },
            LineEntry { pc: 10, line: 2, column: 5 },
            LineEntry { pc: 20, line: 7, column: 3 },
        ];
        assert_eq!(f.position_at(0), Some((1, 1)));
        assert_eq!(f.position_at(9), Some((1, 1)));
        assert_eq!(f.position_at(10), Some((2, 5)));
        assert_eq!(f.position_at(99), Some((7, 3)));
    }

    #[test]
    fn test_innermost_handler_wins() {
        let mut f = empty_func();
        f.exceptions = vec![
            ExceptionEntry { start: 0, end: 100, catch_pc: Some(100), finally_pc: None, stack_depth: 0 },
            ExceptionEntry { start: 10, end: 50, catch_pc: Some(50), finally_pc: None, stack_depth: 0 },
        ];
        assert_eq!(f.handler_at(20).unwrap().catch_pc, Some(50));
        assert_eq!(f.handler_at(60).unwrap().catch_pc, Some(100));
        assert!(f.handler_at(100).is_none());
    }

    #[test]
    fn test_cell_sharing() {
        let cell: Cell = Rc::new(RefCell::new(Value::Number(1.0)));
        let other = Rc::clone(&cell);
        *other.borrow_mut() = Value::Number(5.0);
        assert_eq!(cell.borrow().as_number(), Some(5.0));
    }
}
