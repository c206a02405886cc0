//! JavaScript compiler
//!
//! Generates bytecode from source code in a single pass: a predictive
//! recursive-descent parser that emits into a function builder as it
//! goes, with no intermediate tree for common forms. Expressions use
//! precedence climbing.
//!
//! The grammar's four unbounded self-similar forms (parenthesised
//! expression chains, nested blocks, nested array literals, and member
//! access chains) are parsed with explicit work stacks or loops so
//! nesting depth is bounded by the heap, not the host call stack.

use super::lexer::{Lexer, Token, TokenKind};
use crate::regex;
use crate::runtime::function::{
    Const, ExceptionEntry, FnFlags, FunctionBytecode, LineEntry, UpvalueSource,
};
use crate::runtime::string::JsString;
use crate::vm::opcode::OpCode;
use std::collections::BTreeSet;
use std::rc::Rc;

/// Maximum number of local variables per function
const MAX_LOCALS: usize = 65000;

/// Maximum number of constants per function
const MAX_CONSTANTS: usize = 65000;

/// Compilation error
#[derive(Debug)]
pub enum CompileError {
    Syntax {
        message: String,
        line: u32,
        column: u32,
    },
    Regex {
        message: String,
        line: u32,
        column: u32,
    },
}

impl CompileError {
    pub fn position(&self) -> (u32, u32) {
        match self {
            CompileError::Syntax { line, column, .. } => (*line, *column),
            CompileError::Regex { line, column, .. } => (*line, *column),
        }
    }
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompileError::Syntax {
                message,
                line,
                column,
            } => write!(f, "{} (line {}, column {})", message, line, column),
            CompileError::Regex {
                message,
                line,
                column,
            } => write!(
                f,
                "invalid regular expression: {} (line {}, column {})",
                message, line, column
            ),
        }
    }
}

impl std::error::Error for CompileError {}

/// Local variable info
#[derive(Debug, Clone)]
struct Local {
    name: Rc<str>,
    depth: u32,
    is_const: bool,
}

/// Resolved upvalue in the current function
#[derive(Debug, Clone)]
struct Upvalue {
    name: Rc<str>,
    source: UpvalueSource,
}

/// Jump patch location
#[derive(Debug, Clone, Copy)]
struct JumpPatch {
    offset: usize,
}

/// Where an identifier resolves to
#[derive(Debug, Clone)]
enum Binding {
    Local { slot: u16, is_const: bool },
    Upvalue(u16),
    /// The enclosing function expression's own name
    SelfFunc,
    Global(Rc<str>),
}

/// Per-loop compilation state (break/continue patching)
struct LoopCtx {
    break_jumps: Vec<JumpPatch>,
    continue_jumps: Vec<JumpPatch>,
    /// Backward continue target when known up front
    continue_target: Option<usize>,
    is_switch: bool,
    /// Enclosing finally regions at loop entry; exits gosub anything deeper
    finally_depth: usize,
}

/// An active try-with-finally region collecting gosub sites
struct FinallyScope {
    gosub_sites: Vec<JumpPatch>,
}

/// Bytecode under construction for one function
struct FuncBuilder {
    name: Option<Rc<str>>,
    arg_count: u16,
    flags: FnFlags,
    bytecode: Vec<u8>,
    constants: Vec<Const>,
    locals: Vec<Local>,
    max_locals: usize,
    scope_depth: u32,
    upvalues: Vec<Upvalue>,
    captured_slots: BTreeSet<u16>,
    exceptions: Vec<ExceptionEntry>,
    line_table: Vec<LineEntry>,
    loops: Vec<LoopCtx>,
    finally_stack: Vec<FinallyScope>,
    /// Values pinned on the operand stack across statements (for-in/for-of
    /// iterators, gosub resume pairs); recorded into exception entries
    stmt_depth: u16,
    /// Program (top-level) builder: vars become globals, expression
    /// statements feed the completion slot
    is_program: bool,
    completion_slot: Option<u16>,
    retval_slot: Option<u16>,
    /// Start offset of the most recently emitted opcode
    last_op: Option<(OpCode, usize)>,
}

impl FuncBuilder {
    fn new(name: Option<Rc<str>>, is_program: bool) -> Self {
        FuncBuilder {
            name,
            arg_count: 0,
            flags: FnFlags::default(),
            bytecode: Vec::new(),
            constants: Vec::new(),
            locals: Vec::new(),
            max_locals: 0,
            scope_depth: 0,
            upvalues: Vec::new(),
            captured_slots: BTreeSet::new(),
            exceptions: Vec::new(),
            line_table: Vec::new(),
            loops: Vec::new(),
            finally_stack: Vec::new(),
            stmt_depth: 0,
            is_program,
            completion_slot: None,
            retval_slot: None,
            last_op: None,
        }
    }

    fn find_local(&self, name: &str) -> Option<u16> {
        self.locals
            .iter()
            .enumerate()
            .rev()
            .find(|(_, l)| &*l.name == name)
            .map(|(i, _)| i as u16)
    }
}

/// Compiler state
pub struct Compiler<'a> {
    lexer: Lexer<'a>,
    current: Token,
    funcs: Vec<FuncBuilder>,
}

/// Compile a program to bytecode.
pub fn compile(source: &str) -> Result<Rc<FunctionBytecode>, CompileError> {
    Compiler::new(source)?.run()
}

impl<'a> Compiler<'a> {
    fn new(source: &'a str) -> Result<Self, CompileError> {
        let mut compiler = Compiler {
            lexer: Lexer::new(source),
            current: Token {
                kind: TokenKind::Eof,
                line: 1,
                column: 1,
                newline_before: false,
            },
            funcs: Vec::new(),
        };
        compiler.advance()?;
        Ok(compiler)
    }

    fn run(mut self) -> Result<Rc<FunctionBytecode>, CompileError> {
        self.funcs.push(FuncBuilder::new(None, true));
        let completion = self.declare_local("<completion>", false)?;
        self.fb().completion_slot = Some(completion);
        let retval = self.declare_local("<retval>", false)?;
        self.fb().retval_slot = Some(retval);

        // Hoist top-level var/function names onto the global object
        let hoisted = self.prescan_hoisted(false);
        let mut seen: Vec<Rc<str>> = Vec::new();
        for (name, _) in hoisted {
            if seen.iter().any(|n| *n == name) {
                continue;
            }
            seen.push(Rc::clone(&name));
            let idx = self.add_string_constant(&name);
            self.emit_op(OpCode::Undefined);
            self.emit_op(OpCode::DeclGlobal);
            self.emit_u16(idx);
        }

        while !self.check(&TokenKind::Eof) {
            self.statement()?;
        }

        self.emit_get_local(completion);
        self.emit_op(OpCode::Return);

        let builder = self.funcs.pop().expect("program builder");
        Ok(Rc::new(Self::finish(builder)))
    }

    fn finish(builder: FuncBuilder) -> FunctionBytecode {
        FunctionBytecode {
            name: builder.name,
            arg_count: builder.arg_count,
            local_count: builder.max_locals as u16,
            flags: builder.flags,
            bytecode: builder.bytecode,
            constants: builder.constants,
            captured: builder.captured_slots.into_iter().collect(),
            upvalues: builder.upvalues.into_iter().map(|u| u.source).collect(),
            // A catch-body range registered for a finally that never
            // materialised has no handler; drop it
            exceptions: builder
                .exceptions
                .into_iter()
                .filter(|e| e.catch_pc.is_some() || e.finally_pc.is_some())
                .collect(),
            line_table: builder.line_table,
        }
    }

    #[inline]
    fn fb(&mut self) -> &mut FuncBuilder {
        self.funcs.last_mut().expect("function builder")
    }

    #[inline]
    fn fb_ref(&self) -> &FuncBuilder {
        self.funcs.last().expect("function builder")
    }

    // =========================================================================
    // Token handling
    // =========================================================================

    fn advance(&mut self) -> Result<(), CompileError> {
        let token = self.lexer.next_token();
        if let TokenKind::Error(message) = &token.kind {
            return Err(CompileError::Syntax {
                message: message.clone(),
                line: token.line,
                column: token.column,
            });
        }
        self.current = token;
        Ok(())
    }

    fn check(&self, expected: &TokenKind) -> bool {
        std::mem::discriminant(&self.current.kind) == std::mem::discriminant(expected)
    }

    fn match_token(&mut self, expected: &TokenKind) -> Result<bool, CompileError> {
        if self.check(expected) {
            self.advance()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn expect(&mut self, expected: TokenKind) -> Result<(), CompileError> {
        if self.check(&expected) {
            self.advance()
        } else {
            Err(self.err(&format!(
                "expected {:?}, found {:?}",
                expected, self.current.kind
            )))
        }
    }

    /// Semicolon with automatic insertion: a real `;`, or a `}` / EOF /
    /// line break in front of the next token.
    fn expect_semicolon(&mut self) -> Result<(), CompileError> {
        if self.match_token(&TokenKind::Semicolon)? {
            return Ok(());
        }
        if self.check(&TokenKind::RBrace)
            || self.check(&TokenKind::Eof)
            || self.current.newline_before
        {
            return Ok(());
        }
        Err(self.err(&format!("expected ';', found {:?}", self.current.kind)))
    }

    fn err(&self, message: &str) -> CompileError {
        CompileError::Syntax {
            message: message.to_string(),
            line: self.current.line,
            column: self.current.column,
        }
    }

    /// Identifier-like binding name (contextual keywords allowed).
    fn ident_name(&mut self) -> Result<Rc<str>, CompileError> {
        let name: Rc<str> = match &self.current.kind {
            TokenKind::Ident(n) => Rc::from(n.as_str()),
            TokenKind::Of => Rc::from("of"),
            _ => return Err(self.err("expected identifier")),
        };
        self.advance()?;
        Ok(name)
    }

    /// Property name after `.` (keywords are valid property names).
    fn property_name(&mut self) -> Result<Rc<str>, CompileError> {
        let name = token_name(&self.current.kind)
            .ok_or_else(|| self.err("expected property name"))?;
        self.advance()?;
        Ok(name)
    }

    fn is_assignment_op(&self) -> bool {
        matches!(
            self.current.kind,
            TokenKind::Eq
                | TokenKind::PlusEq
                | TokenKind::MinusEq
                | TokenKind::StarEq
                | TokenKind::SlashEq
                | TokenKind::PercentEq
                | TokenKind::AmpEq
                | TokenKind::PipeEq
                | TokenKind::CaretEq
                | TokenKind::LtLtEq
                | TokenKind::GtGtEq
                | TokenKind::GtGtGtEq
                | TokenKind::StarStarEq
        )
    }

    // =========================================================================
    // Bytecode emission
    // =========================================================================

    fn emit_op(&mut self, op: OpCode) {
        let start = self.fb_ref().bytecode.len();
        let fb = self.fb();
        fb.bytecode.push(op as u8);
        fb.last_op = Some((op, start));
    }

    fn emit_u8(&mut self, byte: u8) {
        self.fb().bytecode.push(byte);
    }

    fn emit_u16(&mut self, val: u16) {
        self.fb().bytecode.extend_from_slice(&val.to_le_bytes());
    }

    fn emit_u32(&mut self, val: u32) {
        self.fb().bytecode.extend_from_slice(&val.to_le_bytes());
    }

    fn current_offset(&self) -> usize {
        self.fb_ref().bytecode.len()
    }

    /// Record the current token's source position in the line table.
    fn mark_position(&mut self) {
        let line = self.current.line;
        let column = self.current.column;
        let pc = self.current_offset() as u32;
        let fb = self.fb();
        if let Some(last) = fb.line_table.last() {
            if last.line == line && last.column == column {
                return;
            }
            if last.pc == pc {
                fb.line_table.pop();
            }
        }
        fb.line_table.push(LineEntry { pc, line, column });
    }

    /// Emit an integer constant, using the short opcodes when possible.
    fn emit_int(&mut self, val: i32) {
        match val {
            -1 => self.emit_op(OpCode::PushMinus1),
            0 => self.emit_op(OpCode::Push0),
            1 => self.emit_op(OpCode::Push1),
            2 => self.emit_op(OpCode::Push2),
            3 => self.emit_op(OpCode::Push3),
            4 => self.emit_op(OpCode::Push4),
            5 => self.emit_op(OpCode::Push5),
            6 => self.emit_op(OpCode::Push6),
            7 => self.emit_op(OpCode::Push7),
            v if (i8::MIN as i32..=i8::MAX as i32).contains(&v) => {
                self.emit_op(OpCode::PushI8);
                self.emit_u8(v as i8 as u8);
            }
            v if (i16::MIN as i32..=i16::MAX as i32).contains(&v) => {
                self.emit_op(OpCode::PushI16);
                self.emit_u16(v as i16 as u16);
            }
            v => {
                let idx = self.add_number_constant(v as f64);
                self.emit_const(idx);
            }
        }
    }

    /// Emit a number literal.
    fn emit_number(&mut self, n: f64) {
        let is_neg_zero = n == 0.0 && n.is_sign_negative();
        if n.fract() == 0.0
            && !is_neg_zero
            && (i16::MIN as f64..=i16::MAX as f64).contains(&n)
        {
            self.emit_int(n as i32);
        } else {
            let idx = self.add_number_constant(n);
            self.emit_const(idx);
        }
    }

    fn emit_const(&mut self, index: u16) {
        if index < 256 {
            self.emit_op(OpCode::PushConst8);
            self.emit_u8(index as u8);
        } else {
            self.emit_op(OpCode::PushConst);
            self.emit_u16(index);
        }
    }

    fn emit_string(&mut self, s: JsString) {
        let idx = self.add_constant_string(s);
        self.emit_const(idx);
    }

    fn emit_get_local(&mut self, index: u16) {
        match index {
            0 => self.emit_op(OpCode::GetLoc0),
            1 => self.emit_op(OpCode::GetLoc1),
            2 => self.emit_op(OpCode::GetLoc2),
            3 => self.emit_op(OpCode::GetLoc3),
            i if i < 256 && i >= self.fb_ref().arg_count => {
                self.emit_op(OpCode::GetLoc8);
                self.emit_u8(i as u8);
            }
            i if i < self.fb_ref().arg_count => {
                self.emit_op(OpCode::GetArg);
                self.emit_u16(i);
            }
            i => {
                self.emit_op(OpCode::GetLoc);
                self.emit_u16(i);
            }
        }
    }

    fn emit_set_local(&mut self, index: u16) {
        match index {
            0 => self.emit_op(OpCode::PutLoc0),
            1 => self.emit_op(OpCode::PutLoc1),
            2 => self.emit_op(OpCode::PutLoc2),
            3 => self.emit_op(OpCode::PutLoc3),
            i if i < 256 && i >= self.fb_ref().arg_count => {
                self.emit_op(OpCode::PutLoc8);
                self.emit_u8(i as u8);
            }
            i if i < self.fb_ref().arg_count => {
                self.emit_op(OpCode::PutArg);
                self.emit_u16(i);
            }
            i => {
                self.emit_op(OpCode::PutLoc);
                self.emit_u16(i);
            }
        }
    }

    /// Emit a forward jump with a 32-bit placeholder offset.
    fn emit_jump(&mut self, op: OpCode) -> JumpPatch {
        self.emit_op(op);
        let offset = self.current_offset();
        self.emit_u32(0);
        JumpPatch { offset }
    }

    /// Patch a forward jump to land at the current position.
    fn patch_jump(&mut self, patch: JumpPatch) {
        let target = self.current_offset() as i64;
        let from = (patch.offset + 4) as i64;
        let rel = (target - from) as i32;
        let bytes = rel.to_le_bytes();
        self.fb().bytecode[patch.offset..patch.offset + 4].copy_from_slice(&bytes);
    }

    /// Emit a backward jump; the target is known, so the one-byte form is
    /// used whenever the displacement fits a signed byte.
    fn emit_jump_back(&mut self, op: OpCode, target: usize) {
        let short = match op {
            OpCode::Goto => OpCode::Goto8,
            OpCode::IfTrue => OpCode::IfTrue8,
            OpCode::IfFalse => OpCode::IfFalse8,
            _ => op,
        };
        let short_rel = target as i64 - (self.current_offset() as i64 + 2);
        if short != op && (i8::MIN as i64..=i8::MAX as i64).contains(&short_rel) {
            self.emit_op(short);
            self.emit_u8(short_rel as i8 as u8);
        } else {
            self.emit_op(op);
            let rel = target as i64 - (self.current_offset() as i64 + 4);
            self.emit_u32(rel as i32 as u32);
        }
    }

    fn add_constant(&mut self, value: Const) -> u16 {
        let fb = self.fb();
        if fb.constants.len() >= MAX_CONSTANTS {
            // Reported on the next emit path that checks; index 0 keeps
            // the stream well-formed
            return 0;
        }
        fb.constants.push(value);
        (fb.constants.len() - 1) as u16
    }

    fn add_number_constant(&mut self, n: f64) -> u16 {
        let fb = self.fb();
        for (i, c) in fb.constants.iter().enumerate() {
            if let Const::Number(existing) = c {
                if existing.to_bits() == n.to_bits() {
                    return i as u16;
                }
            }
        }
        self.add_constant(Const::Number(n))
    }

    fn add_constant_string(&mut self, s: JsString) -> u16 {
        let fb = self.fb();
        for (i, c) in fb.constants.iter().enumerate() {
            if let Const::String(existing) = c {
                if **existing == s {
                    return i as u16;
                }
            }
        }
        self.add_constant(Const::String(Rc::new(s)))
    }

    fn add_string_constant(&mut self, s: &str) -> u16 {
        self.add_constant_string(JsString::from_str(s))
    }

    // =========================================================================
    // Variable handling
    // =========================================================================

    fn declare_local(&mut self, name: &str, is_const: bool) -> Result<u16, CompileError> {
        let fb = self.fb_ref();
        for local in fb.locals.iter().rev() {
            if local.depth < fb.scope_depth {
                break;
            }
            if &*local.name == name {
                return Err(self.err(&format!("identifier '{}' already declared", name)));
            }
        }
        if self.fb_ref().locals.len() >= MAX_LOCALS {
            return Err(self.err("too many local variables"));
        }
        let fb = self.fb();
        let index = fb.locals.len() as u16;
        let depth = fb.scope_depth;
        fb.locals.push(Local {
            name: Rc::from(name),
            depth,
            is_const,
        });
        if fb.locals.len() > fb.max_locals {
            fb.max_locals = fb.locals.len();
        }
        Ok(index)
    }

    fn begin_scope(&mut self) {
        self.fb().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let fb = self.fb();
        fb.scope_depth -= 1;
        while let Some(local) = fb.locals.last() {
            if local.depth <= fb.scope_depth {
                break;
            }
            fb.locals.pop();
        }
    }

    /// Resolve an identifier against the scope chain: local, the enclosing
    /// function's own name, upvalue, then global.
    fn resolve(&mut self, name: &str) -> Binding {
        let fb = self.fb_ref();
        if let Some(slot) = fb.find_local(name) {
            let is_const = fb.locals[slot as usize].is_const;
            return Binding::Local { slot, is_const };
        }
        if fb.name.as_deref() == Some(name) && !fb.is_program {
            return Binding::SelfFunc;
        }
        let top = self.funcs.len() - 1;
        match self.resolve_upvalue(top, name) {
            Some(idx) => Binding::Upvalue(idx),
            None => Binding::Global(Rc::from(name)),
        }
    }

    fn resolve_upvalue(&mut self, func_idx: usize, name: &str) -> Option<u16> {
        if func_idx == 0 {
            return None;
        }
        // Already resolved in this function?
        if let Some(i) = self.funcs[func_idx]
            .upvalues
            .iter()
            .position(|u| &*u.name == name)
        {
            return Some(i as u16);
        }
        let parent = func_idx - 1;
        if let Some(local_idx) = self.funcs[parent].find_local(name) {
            self.funcs[parent].captured_slots.insert(local_idx);
            return Some(self.add_upvalue(func_idx, name, UpvalueSource::ParentLocal(local_idx)));
        }
        let parent_up = self.resolve_upvalue(parent, name)?;
        Some(self.add_upvalue(func_idx, name, UpvalueSource::ParentUpvalue(parent_up)))
    }

    fn add_upvalue(&mut self, func_idx: usize, name: &str, source: UpvalueSource) -> u16 {
        let ups = &mut self.funcs[func_idx].upvalues;
        ups.push(Upvalue {
            name: Rc::from(name),
            source,
        });
        (ups.len() - 1) as u16
    }

    // =========================================================================
    // Hoisting prescan
    // =========================================================================

    /// Scan ahead over the current function body (or the whole program)
    /// collecting `var` and function-declaration names, without emitting
    /// anything. Nested function bodies are skipped; their declarations
    /// hoist when they are compiled.
    fn prescan_hoisted(&mut self, stop_at_rbrace: bool) -> Vec<(Rc<str>, bool)> {
        let state = self.lexer.save();
        let mut out: Vec<(Rc<str>, bool)> = Vec::new();
        let mut depth: i32 = 0;
        let mut skip_depths: Vec<i32> = Vec::new();
        let mut pending_function = false;
        let mut pending_arrow = false;
        let mut stmt_pos = true;
        let mut kind = self.current.kind.clone();

        'scan: loop {
            let arrow_body = pending_arrow;
            pending_arrow = false;
            match &kind {
                TokenKind::Eof => break,
                TokenKind::LBrace => {
                    if pending_function || arrow_body {
                        skip_depths.push(depth);
                        pending_function = false;
                    }
                    depth += 1;
                    stmt_pos = true;
                }
                TokenKind::RBrace => {
                    depth -= 1;
                    if stop_at_rbrace && depth < 0 {
                        break;
                    }
                    if skip_depths.last() == Some(&depth) {
                        skip_depths.pop();
                    }
                    stmt_pos = true;
                }
                TokenKind::Arrow => {
                    pending_arrow = true;
                    stmt_pos = false;
                }
                TokenKind::Function => {
                    let at_stmt = stmt_pos;
                    pending_function = true;
                    stmt_pos = false;
                    kind = self.lexer.next_token().kind;
                    if let TokenKind::Ident(n) = &kind {
                        if at_stmt && skip_depths.is_empty() {
                            out.push((Rc::from(n.as_str()), true));
                        }
                        kind = self.lexer.next_token().kind;
                    }
                    continue 'scan;
                }
                TokenKind::Var if skip_depths.is_empty() => {
                    kind = self.lexer.next_token().kind;
                    'decls: loop {
                        let name: Rc<str> = match &kind {
                            TokenKind::Ident(n) => Rc::from(n.as_str()),
                            TokenKind::Of => Rc::from("of"),
                            _ => break 'decls,
                        };
                        out.push((name, false));
                        // Skip the initializer up to `,` at this nesting level
                        let mut pd = 0i32;
                        let mut bd = 0i32;
                        let mut cd = 0i32;
                        loop {
                            kind = self.lexer.next_token().kind;
                            match &kind {
                                TokenKind::Eof => break 'scan,
                                TokenKind::LParen => pd += 1,
                                TokenKind::RParen => {
                                    pd -= 1;
                                    if pd < 0 {
                                        break 'decls;
                                    }
                                }
                                TokenKind::LBracket => bd += 1,
                                TokenKind::RBracket => bd -= 1,
                                TokenKind::LBrace => cd += 1,
                                TokenKind::RBrace => {
                                    cd -= 1;
                                    if cd < 0 {
                                        // Statement terminated by a block close
                                        continue 'scan;
                                    }
                                }
                                TokenKind::Semicolon if pd == 0 && bd == 0 && cd == 0 => {
                                    break 'decls;
                                }
                                TokenKind::In | TokenKind::Of
                                    if pd == 0 && bd == 0 && cd == 0 =>
                                {
                                    break 'decls;
                                }
                                TokenKind::Comma if pd == 0 && bd == 0 && cd == 0 => {
                                    kind = self.lexer.next_token().kind;
                                    continue 'decls;
                                }
                                _ => {}
                            }
                        }
                    }
                    stmt_pos = true;
                    continue 'scan;
                }
                TokenKind::Semicolon
                | TokenKind::Else
                | TokenKind::Do
                | TokenKind::Try
                | TokenKind::Finally
                | TokenKind::Colon
                | TokenKind::RParen => {
                    stmt_pos = true;
                }
                _ => {
                    stmt_pos = false;
                }
            }
            kind = self.lexer.next_token().kind;
        }

        self.lexer.restore(state);
        out
    }

    // =========================================================================
    // Statements
    // =========================================================================

    fn statement(&mut self) -> Result<(), CompileError> {
        self.mark_position();
        match self.current.kind {
            TokenKind::Var => self.var_statement(),
            TokenKind::Let | TokenKind::Const => self.let_statement(),
            TokenKind::If => self.if_statement(),
            TokenKind::While => self.while_statement(),
            TokenKind::Do => self.do_while_statement(),
            TokenKind::For => self.for_statement(),
            TokenKind::Switch => self.switch_statement(),
            TokenKind::Return => self.return_statement(),
            TokenKind::Break => self.break_statement(),
            TokenKind::Continue => self.continue_statement(),
            TokenKind::Throw => self.throw_statement(),
            TokenKind::Try => self.try_statement(),
            TokenKind::Function => self.function_declaration(),
            TokenKind::LBrace => self.block_statement(),
            TokenKind::Semicolon => self.advance(),
            TokenKind::Debugger => {
                self.advance()?;
                self.expect_semicolon()
            }
            _ => self.expression_statement(),
        }
    }

    /// Block statement. Directly nested blocks are consumed by the loop
    /// below, so `{{{...}}}` nesting costs heap, not host stack.
    fn block_statement(&mut self) -> Result<(), CompileError> {
        self.advance()?; // {
        self.begin_scope();
        let mut depth = 1usize;
        while depth > 0 {
            if self.check(&TokenKind::RBrace) {
                self.advance()?;
                self.end_scope();
                depth -= 1;
            } else if self.check(&TokenKind::LBrace) {
                self.advance()?;
                self.begin_scope();
                depth += 1;
            } else if self.check(&TokenKind::Eof) {
                return Err(self.err("unexpected end of input in block"));
            } else {
                self.statement()?;
            }
        }
        Ok(())
    }

    fn expression_statement(&mut self) -> Result<(), CompileError> {
        self.expression()?;
        self.expect_semicolon()?;
        if let Some(slot) = self.fb_ref().completion_slot {
            self.emit_set_local(slot);
        } else {
            self.emit_op(OpCode::Drop);
        }
        Ok(())
    }

    fn var_statement(&mut self) -> Result<(), CompileError> {
        self.advance()?; // var
        loop {
            let name = self.ident_name()?;
            self.var_declarator(&name)?;
            if !self.match_token(&TokenKind::Comma)? {
                break;
            }
        }
        self.expect_semicolon()
    }

    /// One `var` declarator; the name was hoisted by the prescan.
    fn var_declarator(&mut self, name: &str) -> Result<(), CompileError> {
        if self.match_token(&TokenKind::Eq)? {
            self.assignment_expr()?;
            self.store_binding(name)?;
        }
        Ok(())
    }

    fn store_binding(&mut self, name: &str) -> Result<(), CompileError> {
        match self.resolve(name) {
            Binding::Local { slot, .. } => self.emit_set_local(slot),
            Binding::Upvalue(idx) => {
                self.emit_op(OpCode::PutVarRef);
                self.emit_u16(idx);
            }
            Binding::SelfFunc | Binding::Global(_) => {
                let idx = self.add_string_constant(name);
                self.emit_op(OpCode::PutGlobal);
                self.emit_u16(idx);
            }
        }
        Ok(())
    }

    fn let_statement(&mut self) -> Result<(), CompileError> {
        let is_const = self.check(&TokenKind::Const);
        self.advance()?; // let/const
        loop {
            let name = self.ident_name()?;
            let slot = self.declare_local(&name, is_const)?;
            if self.match_token(&TokenKind::Eq)? {
                self.assignment_expr()?;
            } else {
                if is_const {
                    return Err(self.err("missing initializer in const declaration"));
                }
                self.emit_op(OpCode::Undefined);
            }
            self.emit_set_local(slot);
            if !self.match_token(&TokenKind::Comma)? {
                break;
            }
        }
        self.expect_semicolon()
    }

    fn if_statement(&mut self) -> Result<(), CompileError> {
        self.advance()?; // if
        self.expect(TokenKind::LParen)?;
        self.expression()?;
        self.expect(TokenKind::RParen)?;

        let then_jump = self.emit_jump(OpCode::IfFalse);
        self.statement()?;

        if self.check(&TokenKind::Else) {
            let else_jump = self.emit_jump(OpCode::Goto);
            self.patch_jump(then_jump);
            self.advance()?;
            self.statement()?;
            self.patch_jump(else_jump);
        } else {
            self.patch_jump(then_jump);
        }
        Ok(())
    }

    fn push_loop(&mut self, continue_target: Option<usize>, is_switch: bool) {
        let finally_depth = self.fb_ref().finally_stack.len();
        self.fb().loops.push(LoopCtx {
            break_jumps: Vec::new(),
            continue_jumps: Vec::new(),
            continue_target,
            is_switch,
            finally_depth,
        });
    }

    fn while_statement(&mut self) -> Result<(), CompileError> {
        self.advance()?; // while
        let loop_start = self.current_offset();
        self.expect(TokenKind::LParen)?;
        self.expression()?;
        self.expect(TokenKind::RParen)?;

        let exit_jump = self.emit_jump(OpCode::IfFalse);
        self.push_loop(Some(loop_start), false);
        self.statement()?;
        self.emit_jump_back(OpCode::Goto, loop_start);
        self.patch_jump(exit_jump);

        let ctx = self.fb().loops.pop().expect("loop context");
        for patch in ctx.break_jumps {
            self.patch_jump(patch);
        }
        Ok(())
    }

    fn do_while_statement(&mut self) -> Result<(), CompileError> {
        self.advance()?; // do
        let loop_start = self.current_offset();
        self.push_loop(None, false);
        self.statement()?;

        let continue_target = self.current_offset();
        self.expect(TokenKind::While)?;
        self.expect(TokenKind::LParen)?;
        self.expression()?;
        self.expect(TokenKind::RParen)?;
        self.emit_jump_back(OpCode::IfTrue, loop_start);
        self.match_token(&TokenKind::Semicolon)?;

        let ctx = self.fb().loops.pop().expect("loop context");
        for patch in ctx.break_jumps {
            self.patch_jump(patch);
        }
        for patch in ctx.continue_jumps {
            let target = continue_target as i64;
            let from = (patch.offset + 4) as i64;
            let rel = (target - from) as i32;
            let bytes = rel.to_le_bytes();
            self.fb().bytecode[patch.offset..patch.offset + 4].copy_from_slice(&bytes);
        }
        Ok(())
    }

    fn for_statement(&mut self) -> Result<(), CompileError> {
        self.advance()?; // for
        self.expect(TokenKind::LParen)?;
        self.begin_scope();

        // for-in / for-of detection
        if self.check(&TokenKind::Var)
            || self.check(&TokenKind::Let)
            || self.check(&TokenKind::Const)
        {
            let is_let = !self.check(&TokenKind::Var);
            let is_const = self.check(&TokenKind::Const);
            self.advance()?;
            let name = self.ident_name()?;
            if self.check(&TokenKind::In) || self.check(&TokenKind::Of) {
                let is_of = self.check(&TokenKind::Of);
                if is_let {
                    self.declare_local(&name, is_const)?;
                }
                let result = self.for_in_of_body(&name, is_of);
                self.end_scope();
                return result;
            }
            if is_let {
                let slot = self.declare_local(&name, is_const)?;
                if self.match_token(&TokenKind::Eq)? {
                    self.assignment_expr()?;
                } else {
                    self.emit_op(OpCode::Undefined);
                }
                self.emit_set_local(slot);
            } else {
                self.var_declarator(&name)?;
            }
            while self.match_token(&TokenKind::Comma)? {
                let name = self.ident_name()?;
                if is_let {
                    let slot = self.declare_local(&name, is_const)?;
                    if self.match_token(&TokenKind::Eq)? {
                        self.assignment_expr()?;
                    } else {
                        self.emit_op(OpCode::Undefined);
                    }
                    self.emit_set_local(slot);
                } else {
                    self.var_declarator(&name)?;
                }
            }
            self.expect(TokenKind::Semicolon)?;
        } else if !self.check(&TokenKind::Semicolon) {
            if let TokenKind::Ident(name) = self.current.kind.clone() {
                let state = self.lexer.save();
                let next = self.lexer.next_token();
                self.lexer.restore(state);
                if matches!(next.kind, TokenKind::In | TokenKind::Of) {
                    self.advance()?; // identifier
                    let is_of = self.check(&TokenKind::Of);
                    let result = self.for_in_of_body(&name, is_of);
                    self.end_scope();
                    return result;
                }
            }
            self.expression()?;
            self.emit_op(OpCode::Drop);
            self.expect(TokenKind::Semicolon)?;
        } else {
            self.advance()?; // ;
        }

        // Classic three-part loop, laid out with the update clause
        // compiled before the body behind a jump
        let loop_start = self.current_offset();
        let exit_jump = if !self.check(&TokenKind::Semicolon) {
            self.expression()?;
            self.expect(TokenKind::Semicolon)?;
            Some(self.emit_jump(OpCode::IfFalse))
        } else {
            self.advance()?;
            None
        };

        let continue_target = if !self.check(&TokenKind::RParen) {
            let body_jump = self.emit_jump(OpCode::Goto);
            let update_start = self.current_offset();
            self.expression()?;
            self.emit_op(OpCode::Drop);
            self.emit_jump_back(OpCode::Goto, loop_start);
            self.patch_jump(body_jump);
            update_start
        } else {
            loop_start
        };
        self.expect(TokenKind::RParen)?;

        self.push_loop(Some(continue_target), false);
        self.statement()?;
        self.emit_jump_back(OpCode::Goto, continue_target);

        if let Some(patch) = exit_jump {
            self.patch_jump(patch);
        }
        let ctx = self.fb().loops.pop().expect("loop context");
        for patch in ctx.break_jumps {
            self.patch_jump(patch);
        }
        self.end_scope();
        Ok(())
    }

    /// Shared tail of `for (x in obj)` / `for (x of obj)`: current token is
    /// the `in`/`of` keyword; the binding already exists.
    fn for_in_of_body(&mut self, name: &str, is_of: bool) -> Result<(), CompileError> {
        self.advance()?; // in/of
        self.expression()?;
        self.expect(TokenKind::RParen)?;

        self.emit_op(if is_of {
            OpCode::ForOfStart
        } else {
            OpCode::ForInStart
        });

        // stack: iter
        let loop_start = self.current_offset();
        self.emit_op(if is_of {
            OpCode::ForOfNext
        } else {
            OpCode::EnumNext
        });
        // stack: iter value done
        let done_jump = self.emit_jump(OpCode::IfTrue);
        self.store_binding(name)?;

        self.push_loop(Some(loop_start), false);
        self.fb().stmt_depth += 1;
        self.statement()?;
        self.fb().stmt_depth -= 1;
        self.emit_jump_back(OpCode::Goto, loop_start);

        self.patch_jump(done_jump);
        self.emit_op(OpCode::Drop); // leftover value slot
        let break_target = self.current_offset();
        self.emit_op(OpCode::Drop); // iterator

        let ctx = self.fb().loops.pop().expect("loop context");
        for patch in ctx.break_jumps {
            // Break still has the iterator on the stack: land on its drop
            let target = break_target as i64;
            let from = (patch.offset + 4) as i64;
            let rel = (target - from) as i32;
            let bytes = rel.to_le_bytes();
            self.fb().bytecode[patch.offset..patch.offset + 4].copy_from_slice(&bytes);
        }
        Ok(())
    }

    /// Switch with interleaved tests and bodies: each case emits its test
    /// in place; a failed test chains to the next test, a preceding body
    /// falls over the test into this body. A `default` body is skipped on
    /// the dispatch path and entered backward when every test fails.
    fn switch_statement(&mut self) -> Result<(), CompileError> {
        self.advance()?; // switch
        self.expect(TokenKind::LParen)?;
        self.begin_scope();
        let discr = self.declare_local("<switch>", false)?;
        self.expression()?;
        self.emit_set_local(discr);
        self.expect(TokenKind::RParen)?;
        self.expect(TokenKind::LBrace)?;

        self.push_loop(None, true);
        let mut pending_test: Option<JumpPatch> = None;
        let mut default_skip: Option<JumpPatch> = None;
        let mut default_pos: Option<usize> = None;
        let mut seen_any = false;

        while !self.check(&TokenKind::RBrace) {
            if self.check(&TokenKind::Case) {
                self.advance()?;
                let fall = if seen_any {
                    Some(self.emit_jump(OpCode::Goto))
                } else {
                    None
                };
                if let Some(patch) = pending_test.take() {
                    self.patch_jump(patch);
                }
                if let Some(patch) = default_skip.take() {
                    self.patch_jump(patch);
                }
                self.emit_get_local(discr);
                self.assignment_expr()?;
                self.expect(TokenKind::Colon)?;
                self.emit_op(OpCode::StrictEq);
                pending_test = Some(self.emit_jump(OpCode::IfFalse));
                if let Some(f) = fall {
                    self.patch_jump(f);
                }
                seen_any = true;
            } else if self.check(&TokenKind::Default) {
                self.advance()?;
                self.expect(TokenKind::Colon)?;
                let fall = if seen_any {
                    Some(self.emit_jump(OpCode::Goto))
                } else {
                    None
                };
                // Dispatch skips the default body; it is entered backward
                // after the last failed test
                default_skip = Some(self.emit_jump(OpCode::Goto));
                default_pos = Some(self.current_offset());
                if let Some(f) = fall {
                    self.patch_jump(f);
                }
                seen_any = true;
            } else if seen_any {
                self.statement()?;
            } else {
                return Err(self.err("expected 'case' or 'default'"));
            }
        }
        self.expect(TokenKind::RBrace)?;

        if let Some(patch) = pending_test.take() {
            match default_pos {
                Some(pos) => {
                    let done = self.emit_jump(OpCode::Goto);
                    self.patch_jump(patch);
                    self.emit_jump_back(OpCode::Goto, pos);
                    self.patch_jump(done);
                }
                None => self.patch_jump(patch),
            }
        } else if let (Some(patch), Some(pos)) = (default_skip.take(), default_pos) {
            // Only a default label: route the dispatch path into its body
            let done = self.emit_jump(OpCode::Goto);
            self.patch_jump(patch);
            self.emit_jump_back(OpCode::Goto, pos);
            self.patch_jump(done);
        }
        if let Some(patch) = default_skip.take() {
            self.patch_jump(patch);
        }

        let ctx = self.fb().loops.pop().expect("switch context");
        for patch in ctx.break_jumps {
            self.patch_jump(patch);
        }
        self.end_scope();
        Ok(())
    }

    fn return_statement(&mut self) -> Result<(), CompileError> {
        self.advance()?; // return
        let has_value = !(self.check(&TokenKind::Semicolon)
            || self.check(&TokenKind::RBrace)
            || self.check(&TokenKind::Eof)
            || self.current.newline_before);

        let finally_count = self.fb_ref().finally_stack.len();
        if finally_count == 0 {
            if has_value {
                self.expression()?;
                self.expect_semicolon()?;
                self.emit_op(OpCode::Return);
            } else {
                self.expect_semicolon()?;
                self.emit_op(OpCode::ReturnUndef);
            }
            return Ok(());
        }

        // Returning through finally regions: stash the value in the hidden
        // slot, run each enclosing finally, then return
        let retval = self.fb_ref().retval_slot.expect("retval slot");
        if has_value {
            self.expression()?;
        } else {
            self.emit_op(OpCode::Undefined);
        }
        self.expect_semicolon()?;
        self.emit_set_local(retval);
        for i in (0..finally_count).rev() {
            let patch = self.emit_jump(OpCode::Gosub);
            self.fb().finally_stack[i].gosub_sites.push(patch);
        }
        self.emit_get_local(retval);
        self.emit_op(OpCode::Return);
        Ok(())
    }

    fn break_statement(&mut self) -> Result<(), CompileError> {
        self.advance()?;
        self.expect_semicolon()?;
        let Some(loop_idx) = self.fb_ref().loops.len().checked_sub(1) else {
            return Err(self.err("'break' outside of loop or switch"));
        };
        let finally_depth = self.fb_ref().loops[loop_idx].finally_depth;
        self.emit_finally_exits(finally_depth)?;
        let patch = self.emit_jump(OpCode::Goto);
        self.fb().loops[loop_idx].break_jumps.push(patch);
        Ok(())
    }

    fn continue_statement(&mut self) -> Result<(), CompileError> {
        self.advance()?;
        self.expect_semicolon()?;
        let Some(loop_idx) = self
            .fb_ref()
            .loops
            .iter()
            .rposition(|ctx| !ctx.is_switch)
        else {
            return Err(self.err("'continue' outside of loop"));
        };
        let finally_depth = self.fb_ref().loops[loop_idx].finally_depth;
        self.emit_finally_exits(finally_depth)?;
        match self.fb_ref().loops[loop_idx].continue_target {
            Some(target) => self.emit_jump_back(OpCode::Goto, target),
            None => {
                let patch = self.emit_jump(OpCode::Goto);
                self.fb().loops[loop_idx].continue_jumps.push(patch);
            }
        }
        Ok(())
    }

    /// Gosub every finally region deeper than `depth`, innermost first.
    fn emit_finally_exits(&mut self, depth: usize) -> Result<(), CompileError> {
        let count = self.fb_ref().finally_stack.len();
        for i in (depth..count).rev() {
            let patch = self.emit_jump(OpCode::Gosub);
            self.fb().finally_stack[i].gosub_sites.push(patch);
        }
        Ok(())
    }

    fn throw_statement(&mut self) -> Result<(), CompileError> {
        self.advance()?; // throw
        if self.current.newline_before {
            return Err(self.err("no line break allowed after 'throw'"));
        }
        self.expression()?;
        self.expect_semicolon()?;
        self.emit_op(OpCode::Throw);
        Ok(())
    }

    fn try_statement(&mut self) -> Result<(), CompileError> {
        self.advance()?; // try
        if !self.check(&TokenKind::LBrace) {
            return Err(self.err("expected '{' after 'try'"));
        }

        let depth = self.fb_ref().stmt_depth;
        let try_entry = self.fb_ref().exceptions.len();
        let start = self.current_offset() as u32;
        self.fb().exceptions.push(ExceptionEntry {
            start,
            end: 0,
            catch_pc: None,
            finally_pc: None,
            stack_depth: depth,
        });

        // Peek at the clause structure: `finally` presence decides whether
        // exits must run a subroutine
        // (the clauses follow the block; the scope is registered eagerly
        // and dropped if no finally materialises; gosub sites can only
        // come from inside the blocks, which is where they are needed)
        self.fb().finally_stack.push(FinallyScope {
            gosub_sites: Vec::new(),
        });

        self.block_statement()?;
        let end = self.current_offset() as u32;
        self.fb().exceptions[try_entry].end = end;

        let normal_gosub = self.emit_jump(OpCode::Gosub);
        self.fb().finally_stack.last_mut().expect("finally scope")
            .gosub_sites
            .push(normal_gosub);
        let mut end_jumps = vec![self.emit_jump(OpCode::Goto)];

        let mut catch_entry: Option<usize> = None;
        if self.check(&TokenKind::Catch) {
            self.advance()?;
            let catch_pc = self.current_offset() as u32;
            self.fb().exceptions[try_entry].catch_pc = Some(catch_pc);
            self.emit_op(OpCode::Catch);

            self.begin_scope();
            if self.match_token(&TokenKind::LParen)? {
                let param = self.ident_name()?;
                let slot = self.declare_local(&param, false)?;
                self.expect(TokenKind::RParen)?;
                self.emit_set_local(slot);
            } else {
                self.emit_op(OpCode::Drop);
            }

            // The catch body gets its own guarded range so a finally still
            // runs when the handler itself throws
            let entry = self.fb_ref().exceptions.len();
            let body_start = self.current_offset() as u32;
            self.fb().exceptions.push(ExceptionEntry {
                start: body_start,
                end: 0,
                catch_pc: None,
                finally_pc: None,
                stack_depth: depth,
            });
            catch_entry = Some(entry);

            if !self.check(&TokenKind::LBrace) {
                return Err(self.err("expected '{' after 'catch'"));
            }
            self.block_statement()?;
            self.end_scope();
            let body_end = self.current_offset() as u32;
            self.fb().exceptions[entry].end = body_end;

            let catch_gosub = self.emit_jump(OpCode::Gosub);
            self.fb().finally_stack.last_mut().expect("finally scope")
                .gosub_sites
                .push(catch_gosub);
            end_jumps.push(self.emit_jump(OpCode::Goto));
        }

        let scope = self.fb().finally_stack.pop().expect("finally scope");
        if self.check(&TokenKind::Finally) {
            self.advance()?;
            let finally_pc = self.current_offset() as u32;
            self.fb().exceptions[try_entry].finally_pc = Some(finally_pc);
            if let Some(entry) = catch_entry {
                self.fb().exceptions[entry].finally_pc = Some(finally_pc);
            }
            for patch in scope.gosub_sites {
                self.patch_jump(patch);
            }
            if !self.check(&TokenKind::LBrace) {
                return Err(self.err("expected '{' after 'finally'"));
            }
            // The resume pair sits on the stack while the body runs
            self.fb().stmt_depth += 2;
            self.block_statement()?;
            self.fb().stmt_depth -= 2;
            self.emit_op(OpCode::Ret);
        } else {
            if catch_entry.is_none() {
                return Err(self.err("missing catch or finally after try"));
            }
            // No finally: the recorded gosubs collapse into jumps to a
            // stub subroutine that returns immediately
            for patch in scope.gosub_sites {
                self.patch_jump(patch);
            }
            self.emit_op(OpCode::Ret);
        }

        for patch in end_jumps {
            self.patch_jump(patch);
        }
        Ok(())
    }

    fn function_declaration(&mut self) -> Result<(), CompileError> {
        self.advance()?; // function
        let name = self.ident_name()?;
        self.function_rest(Some(Rc::clone(&name)))?;
        // The name was hoisted: a local slot inside functions, a global
        // property at the top level
        if !self.fb_ref().is_program {
            if self.fb_ref().find_local(&name).is_none() {
                self.declare_local(&name, false)?;
            }
        }
        self.store_binding(&name)?;
        Ok(())
    }

    /// Compile a function from its parameter list onward (current token is
    /// `(`), leaving a closure value on the stack.
    fn function_rest(&mut self, name: Option<Rc<str>>) -> Result<(), CompileError> {
        self.expect(TokenKind::LParen)?;
        let mut params: Vec<Rc<str>> = Vec::new();
        if !self.check(&TokenKind::RParen) {
            loop {
                params.push(self.ident_name()?);
                if !self.match_token(&TokenKind::Comma)? {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen)?;
        if !self.check(&TokenKind::LBrace) {
            return Err(self.err("expected '{' before function body"));
        }
        self.compile_function_body(name, params, false)
    }

    /// Compile a function body (current token is `{`, or an expression for
    /// arrow shorthand) into a new builder, then emit the closure.
    fn compile_function_body(
        &mut self,
        name: Option<Rc<str>>,
        params: Vec<Rc<str>>,
        arrow: bool,
    ) -> Result<(), CompileError> {
        let mut builder = FuncBuilder::new(name, false);
        builder.flags = FnFlags { arrow };
        builder.arg_count = params.len() as u16;
        self.funcs.push(builder);
        for p in &params {
            self.declare_local(p, false)?;
        }
        let retval = self.declare_local("<retval>", false)?;
        self.fb().retval_slot = Some(retval);

        if self.check(&TokenKind::LBrace) {
            self.advance()?; // {
            let hoisted = self.prescan_hoisted(true);
            for (hoisted_name, _) in hoisted {
                if self.fb_ref().find_local(&hoisted_name).is_none() {
                    self.declare_local(&hoisted_name, false)?;
                }
            }
            while !self.check(&TokenKind::RBrace) {
                if self.check(&TokenKind::Eof) {
                    return Err(self.err("unexpected end of input in function body"));
                }
                self.statement()?;
            }
            self.advance()?; // }
            self.emit_op(OpCode::ReturnUndef);
        } else {
            // Arrow expression body
            self.assignment_expr()?;
            self.emit_op(OpCode::Return);
        }

        let builder = self.funcs.pop().expect("function builder");
        let func = Rc::new(Self::finish(builder));
        let idx = self.add_constant(Const::Function(func));
        if idx < 256 {
            self.emit_op(OpCode::FClosure8);
            self.emit_u8(idx as u8);
        } else {
            self.emit_op(OpCode::FClosure);
            self.emit_u16(idx);
        }
        Ok(())
    }

    // =========================================================================
    // Expressions
    // =========================================================================

    /// Full expression including the comma operator.
    fn expression(&mut self) -> Result<(), CompileError> {
        self.assignment_expr()?;
        while self.check(&TokenKind::Comma) {
            self.advance()?;
            self.emit_op(OpCode::Drop);
            self.assignment_expr()?;
        }
        Ok(())
    }

    fn assignment_expr(&mut self) -> Result<(), CompileError> {
        self.parse_precedence(Precedence::Assignment)
    }

    fn parse_precedence(&mut self, min_prec: Precedence) -> Result<(), CompileError> {
        self.prefix_expr(min_prec <= Precedence::Assignment, true)?;
        self.infix_loop(min_prec)
    }

    /// Binary/ternary operator continuation with the lhs already on the
    /// stack.
    fn infix_loop(&mut self, min_prec: Precedence) -> Result<(), CompileError> {
        while let Some((prec, assoc)) = self.infix_precedence() {
            if prec < min_prec {
                break;
            }
            let op = self.current.kind.clone();
            self.advance()?;

            match op {
                TokenKind::Question => {
                    self.ternary_expr()?;
                    continue;
                }
                TokenKind::AmpAmp | TokenKind::PipePipe | TokenKind::QuestionQuestion => {
                    self.short_circuit_expr(&op, prec)?;
                    continue;
                }
                _ => {}
            }

            let next_prec = if assoc == Associativity::Right {
                prec
            } else {
                prec.next()
            };
            self.parse_precedence(next_prec)?;
            self.emit_binary_op(&op)?;
        }
        Ok(())
    }

    /// Expression continuation used inside parenthesised groups: operators
    /// and comma sequencing after a value is already on the stack.
    fn group_continuation(&mut self) -> Result<(), CompileError> {
        self.infix_loop(Precedence::Assignment)?;
        while self.check(&TokenKind::Comma) {
            self.advance()?;
            self.emit_op(OpCode::Drop);
            self.assignment_expr()?;
        }
        Ok(())
    }

    fn infix_precedence(&self) -> Option<(Precedence, Associativity)> {
        use Associativity::*;
        use Precedence::*;
        match &self.current.kind {
            TokenKind::Question => Some((Ternary, Right)),
            TokenKind::QuestionQuestion => Some((Nullish, Left)),
            TokenKind::PipePipe => Some((LogicalOr, Left)),
            TokenKind::AmpAmp => Some((LogicalAnd, Left)),
            TokenKind::Pipe => Some((BitwiseOr, Left)),
            TokenKind::Caret => Some((BitwiseXor, Left)),
            TokenKind::Amp => Some((BitwiseAnd, Left)),
            TokenKind::EqEq | TokenKind::BangEq | TokenKind::EqEqEq | TokenKind::BangEqEq => {
                Some((Equality, Left))
            }
            TokenKind::Lt
            | TokenKind::LtEq
            | TokenKind::Gt
            | TokenKind::GtEq
            | TokenKind::InstanceOf
            | TokenKind::In => Some((Relational, Left)),
            TokenKind::LtLt | TokenKind::GtGt | TokenKind::GtGtGt => Some((Shift, Left)),
            TokenKind::Plus | TokenKind::Minus => Some((Additive, Left)),
            TokenKind::Star | TokenKind::Slash | TokenKind::Percent => {
                Some((Multiplicative, Left))
            }
            TokenKind::StarStar => Some((Exponentiation, Right)),
            _ => None,
        }
    }

    fn ternary_expr(&mut self) -> Result<(), CompileError> {
        let else_jump = self.emit_jump(OpCode::IfFalse);
        self.assignment_expr()?;
        let end_jump = self.emit_jump(OpCode::Goto);
        self.expect(TokenKind::Colon)?;
        self.patch_jump(else_jump);
        self.assignment_expr()?;
        self.patch_jump(end_jump);
        Ok(())
    }

    fn short_circuit_expr(
        &mut self,
        op: &TokenKind,
        prec: Precedence,
    ) -> Result<(), CompileError> {
        match op {
            TokenKind::AmpAmp => {
                self.emit_op(OpCode::Dup);
                let end = self.emit_jump(OpCode::IfFalse);
                self.emit_op(OpCode::Drop);
                self.parse_precedence(prec.next())?;
                self.patch_jump(end);
            }
            TokenKind::PipePipe => {
                self.emit_op(OpCode::Dup);
                let end = self.emit_jump(OpCode::IfTrue);
                self.emit_op(OpCode::Drop);
                self.parse_precedence(prec.next())?;
                self.patch_jump(end);
            }
            TokenKind::QuestionQuestion => {
                // Loose equality against null matches exactly the nullish
                // pair
                self.emit_op(OpCode::Dup);
                self.emit_op(OpCode::Null);
                self.emit_op(OpCode::Eq);
                let end = self.emit_jump(OpCode::IfFalse);
                self.emit_op(OpCode::Drop);
                self.parse_precedence(prec.next())?;
                self.patch_jump(end);
            }
            _ => unreachable!(),
        }
        Ok(())
    }

    fn emit_binary_op(&mut self, op: &TokenKind) -> Result<(), CompileError> {
        let opcode = binary_opcode(op)
            .ok_or_else(|| self.err(&format!("unknown binary operator {:?}", op)))?;
        self.emit_op(opcode);
        Ok(())
    }

    fn prefix_expr(&mut self, can_assign: bool, allow_call: bool) -> Result<(), CompileError> {
        match self.current.kind.clone() {
            TokenKind::Number(n) => {
                self.advance()?;
                self.emit_number(n);
            }
            TokenKind::Str(units) => {
                self.advance()?;
                self.emit_string(JsString::from_units(units));
            }
            TokenKind::TemplateHead { cooked, has_subst } => {
                self.template_literal(cooked, has_subst)?;
            }
            TokenKind::True => {
                self.advance()?;
                self.emit_op(OpCode::PushTrue);
            }
            TokenKind::False => {
                self.advance()?;
                self.emit_op(OpCode::PushFalse);
            }
            TokenKind::Null => {
                self.advance()?;
                self.emit_op(OpCode::Null);
            }
            TokenKind::This => {
                self.advance()?;
                self.emit_op(OpCode::PushThis);
            }
            TokenKind::Ident(name) => {
                self.advance()?;
                if self.check(&TokenKind::Arrow) {
                    return self.arrow_function(vec![Rc::from(name.as_str())]);
                }
                if can_assign && self.is_assignment_op() {
                    self.ident_assignment(&name)?;
                } else {
                    self.load_identifier(&name)?;
                }
            }
            TokenKind::Slash | TokenKind::SlashEq => {
                let saw_eq = self.check(&TokenKind::SlashEq);
                let line = self.current.line;
                let column = self.current.column;
                let kind = self.lexer.scan_regex_tail(saw_eq);
                match kind {
                    TokenKind::Regex { pattern, flags } => {
                        let compiled = regex::Regex::compile(&pattern, &flags).map_err(|e| {
                            CompileError::Regex {
                                message: e.message,
                                line,
                                column,
                            }
                        })?;
                        let idx = self.add_constant(Const::Regex(Rc::new(compiled)));
                        self.emit_op(OpCode::Regexp);
                        self.emit_u16(idx);
                        self.advance()?;
                    }
                    TokenKind::Error(message) => {
                        return Err(CompileError::Syntax {
                            message,
                            line,
                            column,
                        });
                    }
                    _ => unreachable!(),
                }
            }
            TokenKind::LParen => {
                self.paren_group(can_assign)?;
            }
            TokenKind::LBracket => {
                self.array_literal()?;
            }
            TokenKind::LBrace => {
                self.object_literal()?;
            }
            TokenKind::Function => {
                self.advance()?;
                let name = if let TokenKind::Ident(_) = &self.current.kind {
                    Some(self.ident_name()?)
                } else {
                    None
                };
                self.function_rest(name)?;
            }
            TokenKind::New => {
                self.new_expression()?;
            }
            TokenKind::Minus => {
                self.advance()?;
                self.parse_precedence(Precedence::Unary)?;
                self.emit_op(OpCode::Neg);
            }
            TokenKind::Plus => {
                self.advance()?;
                self.parse_precedence(Precedence::Unary)?;
                self.emit_op(OpCode::Plus);
            }
            TokenKind::Bang => {
                self.advance()?;
                self.parse_precedence(Precedence::Unary)?;
                self.emit_op(OpCode::LNot);
            }
            TokenKind::Tilde => {
                self.advance()?;
                self.parse_precedence(Precedence::Unary)?;
                self.emit_op(OpCode::Not);
            }
            TokenKind::Void => {
                self.advance()?;
                self.parse_precedence(Precedence::Unary)?;
                self.emit_op(OpCode::Drop);
                self.emit_op(OpCode::Undefined);
            }
            TokenKind::TypeOf => {
                self.typeof_expr()?;
            }
            TokenKind::Delete => {
                self.delete_expr()?;
            }
            TokenKind::PlusPlus => {
                self.advance()?;
                self.prefix_incdec(OpCode::Inc)?;
            }
            TokenKind::MinusMinus => {
                self.advance()?;
                self.prefix_incdec(OpCode::Dec)?;
            }
            _ => {
                return Err(self.err(&format!("unexpected token {:?}", self.current.kind)));
            }
        }

        self.postfix_ops(can_assign, allow_call)
    }

    fn load_identifier(&mut self, name: &str) -> Result<(), CompileError> {
        match self.resolve(name) {
            Binding::Local { slot, .. } => self.emit_get_local(slot),
            Binding::Upvalue(idx) => {
                self.emit_op(OpCode::GetVarRef);
                self.emit_u16(idx);
            }
            Binding::SelfFunc => self.emit_op(OpCode::ThisFunc),
            Binding::Global(name) => {
                if &*name == "arguments" && !self.fb_ref().is_program {
                    self.emit_op(OpCode::Arguments);
                } else {
                    let idx = self.add_string_constant(&name);
                    self.emit_op(OpCode::GetGlobal);
                    self.emit_u16(idx);
                }
            }
        }
        Ok(())
    }

    fn ident_assignment(&mut self, name: &str) -> Result<(), CompileError> {
        let op = self.current.kind.clone();
        self.advance()?;
        let binding = self.resolve(name);
        if let Binding::Local { is_const: true, .. } = binding {
            return Err(self.err(&format!("assignment to constant '{}'", name)));
        }

        let compound = !matches!(op, TokenKind::Eq);
        if compound {
            match &binding {
                Binding::Local { slot, .. } => self.emit_get_local(*slot),
                Binding::Upvalue(idx) => {
                    self.emit_op(OpCode::GetVarRef);
                    self.emit_u16(*idx);
                }
                Binding::SelfFunc => self.emit_op(OpCode::ThisFunc),
                Binding::Global(name) => {
                    let idx = self.add_string_constant(name);
                    self.emit_op(OpCode::GetGlobal);
                    self.emit_u16(idx);
                }
            }
        }

        self.assignment_expr()?;
        if compound {
            self.emit_compound_op(&op)?;
        }

        // The assigned value is the expression result
        self.emit_op(OpCode::Dup);
        match binding {
            Binding::Local { slot, .. } => self.emit_set_local(slot),
            Binding::Upvalue(idx) => {
                self.emit_op(OpCode::PutVarRef);
                self.emit_u16(idx);
            }
            Binding::SelfFunc | Binding::Global(_) => {
                let idx = self.add_string_constant(name);
                self.emit_op(OpCode::PutGlobal);
                self.emit_u16(idx);
            }
        }
        Ok(())
    }

    fn emit_compound_op(&mut self, op: &TokenKind) -> Result<(), CompileError> {
        let opcode = match op {
            TokenKind::PlusEq => OpCode::Add,
            TokenKind::MinusEq => OpCode::Sub,
            TokenKind::StarEq => OpCode::Mul,
            TokenKind::SlashEq => OpCode::Div,
            TokenKind::PercentEq => OpCode::Mod,
            TokenKind::StarStarEq => OpCode::Pow,
            TokenKind::AmpEq => OpCode::And,
            TokenKind::PipeEq => OpCode::Or,
            TokenKind::CaretEq => OpCode::Xor,
            TokenKind::LtLtEq => OpCode::Shl,
            TokenKind::GtGtEq => OpCode::Sar,
            TokenKind::GtGtGtEq => OpCode::Shr,
            _ => return Err(self.err("invalid compound assignment")),
        };
        self.emit_op(opcode);
        Ok(())
    }

    fn typeof_expr(&mut self) -> Result<(), CompileError> {
        self.advance()?; // typeof
        if let TokenKind::Ident(name) = self.current.kind.clone() {
            self.advance()?;
            let starts_access = matches!(
                self.current.kind,
                TokenKind::Dot
                    | TokenKind::LBracket
                    | TokenKind::LParen
                    | TokenKind::QuestionDot
            );
            if !starts_access {
                match self.resolve(&name) {
                    Binding::Global(name) => {
                        // typeof of an undeclared name must not throw
                        let idx = self.add_string_constant(&name);
                        self.emit_op(OpCode::TypeofGlobal);
                        self.emit_u16(idx);
                    }
                    binding => {
                        self.load_resolved(&binding)?;
                        self.emit_op(OpCode::TypeOf);
                    }
                }
                return Ok(());
            }
            self.load_identifier(&name)?;
            self.postfix_ops(false, true)?;
            self.emit_op(OpCode::TypeOf);
            return Ok(());
        }
        self.parse_precedence(Precedence::Unary)?;
        self.emit_op(OpCode::TypeOf);
        Ok(())
    }

    fn load_resolved(&mut self, binding: &Binding) -> Result<(), CompileError> {
        match binding {
            Binding::Local { slot, .. } => self.emit_get_local(*slot),
            Binding::Upvalue(idx) => {
                self.emit_op(OpCode::GetVarRef);
                self.emit_u16(*idx);
            }
            Binding::SelfFunc => self.emit_op(OpCode::ThisFunc),
            Binding::Global(name) => {
                let name = Rc::clone(name);
                let idx = self.add_string_constant(&name);
                self.emit_op(OpCode::GetGlobal);
                self.emit_u16(idx);
            }
        }
        Ok(())
    }

    /// `delete expr`: rewrite the trailing property load into a delete.
    fn delete_expr(&mut self) -> Result<(), CompileError> {
        self.advance()?; // delete
        self.parse_precedence(Precedence::Unary)?;
        match self.fb_ref().last_op {
            Some((OpCode::GetField, start)) => {
                // Replace the load with a keyed delete
                let bytes = &self.fb_ref().bytecode[start + 1..start + 3];
                let name_idx = u16::from_le_bytes([bytes[0], bytes[1]]);
                self.fb().bytecode.truncate(start);
                self.emit_const(name_idx);
                self.emit_op(OpCode::Delete);
            }
            Some((OpCode::GetLength, start)) => {
                self.fb().bytecode.truncate(start);
                let name_idx = self.add_string_constant("length");
                self.emit_const(name_idx);
                self.emit_op(OpCode::Delete);
            }
            Some((OpCode::GetArrayEl, start)) => {
                self.fb().bytecode.truncate(start);
                self.emit_op(OpCode::Delete);
            }
            _ => {
                // Not a property reference: evaluate and yield true
                self.emit_op(OpCode::Drop);
                self.emit_op(OpCode::PushTrue);
            }
        }
        Ok(())
    }

    /// Prefix `++`/`--`: rewrite the just-compiled reference load.
    fn prefix_incdec(&mut self, op: OpCode) -> Result<(), CompileError> {
        self.parse_precedence(Precedence::Unary)?;
        match self.fb_ref().last_op {
            Some((OpCode::GetField, start)) => {
                let bytes = &self.fb_ref().bytecode[start + 1..start + 3];
                let name_idx = u16::from_le_bytes([bytes[0], bytes[1]]);
                self.fb().bytecode.truncate(start);
                self.emit_op(OpCode::Dup);
                self.emit_op(OpCode::GetField);
                self.emit_u16(name_idx);
                self.emit_op(op);
                self.emit_op(OpCode::Insert2);
                self.emit_op(OpCode::PutField);
                self.emit_u16(name_idx);
            }
            Some((OpCode::GetArrayEl, start)) => {
                self.fb().bytecode.truncate(start);
                self.emit_op(OpCode::Dup2);
                self.emit_op(OpCode::GetArrayEl);
                self.emit_op(op);
                self.emit_op(OpCode::Insert3);
                self.emit_op(OpCode::PutArrayEl);
            }
            Some((OpCode::GetLength, start)) => {
                let name_idx = self.add_string_constant("length");
                self.fb().bytecode.truncate(start);
                self.emit_op(OpCode::Dup);
                self.emit_op(OpCode::GetLength);
                self.emit_op(op);
                self.emit_op(OpCode::Insert2);
                self.emit_op(OpCode::PutField);
                self.emit_u16(name_idx);
            }
            Some((loc_op, start))
                if is_local_load(loc_op) =>
            {
                let slot = self.local_load_slot(loc_op, start);
                self.emit_op(op);
                self.emit_op(OpCode::Dup);
                self.emit_set_local(slot);
            }
            Some((OpCode::GetVarRef, start)) => {
                let bytes = &self.fb_ref().bytecode[start + 1..start + 3];
                let idx = u16::from_le_bytes([bytes[0], bytes[1]]);
                self.emit_op(op);
                self.emit_op(OpCode::Dup);
                self.emit_op(OpCode::PutVarRef);
                self.emit_u16(idx);
            }
            Some((OpCode::GetGlobal, start)) => {
                let bytes = &self.fb_ref().bytecode[start + 1..start + 3];
                let idx = u16::from_le_bytes([bytes[0], bytes[1]]);
                self.emit_op(op);
                self.emit_op(OpCode::Dup);
                self.emit_op(OpCode::PutGlobal);
                self.emit_u16(idx);
            }
            _ => return Err(self.err("invalid increment/decrement operand")),
        }
        Ok(())
    }

    /// Postfix `++`/`--` on the reference just compiled.
    fn postfix_incdec(&mut self, op: OpCode) -> Result<(), CompileError> {
        match self.fb_ref().last_op {
            Some((OpCode::GetField, start)) => {
                let bytes = &self.fb_ref().bytecode[start + 1..start + 3];
                let name_idx = u16::from_le_bytes([bytes[0], bytes[1]]);
                self.fb().bytecode.truncate(start);
                self.emit_op(OpCode::Dup);
                self.emit_op(OpCode::GetField);
                self.emit_u16(name_idx);
                self.emit_op(op);
                self.emit_op(OpCode::Perm3);
                self.emit_op(OpCode::PutField);
                self.emit_u16(name_idx);
            }
            Some((OpCode::GetArrayEl, start)) => {
                self.fb().bytecode.truncate(start);
                self.emit_op(OpCode::Dup2);
                self.emit_op(OpCode::GetArrayEl);
                self.emit_op(op);
                self.emit_op(OpCode::Perm4);
                self.emit_op(OpCode::PutArrayEl);
            }
            Some((OpCode::GetLength, start)) => {
                let name_idx = self.add_string_constant("length");
                self.fb().bytecode.truncate(start);
                self.emit_op(OpCode::Dup);
                self.emit_op(OpCode::GetLength);
                self.emit_op(op);
                self.emit_op(OpCode::Perm3);
                self.emit_op(OpCode::PutField);
                self.emit_u16(name_idx);
            }
            Some((loc_op, start)) if is_local_load(loc_op) => {
                let slot = self.local_load_slot(loc_op, start);
                self.emit_op(op);
                self.emit_set_local(slot);
            }
            Some((OpCode::GetVarRef, start)) => {
                let bytes = &self.fb_ref().bytecode[start + 1..start + 3];
                let idx = u16::from_le_bytes([bytes[0], bytes[1]]);
                self.emit_op(op);
                self.emit_op(OpCode::PutVarRef);
                self.emit_u16(idx);
            }
            Some((OpCode::GetGlobal, start)) => {
                let bytes = &self.fb_ref().bytecode[start + 1..start + 3];
                let idx = u16::from_le_bytes([bytes[0], bytes[1]]);
                self.emit_op(op);
                self.emit_op(OpCode::PutGlobal);
                self.emit_u16(idx);
            }
            _ => return Err(self.err("invalid increment/decrement operand")),
        }
        Ok(())
    }

    fn local_load_slot(&self, op: OpCode, start: usize) -> u16 {
        match op {
            OpCode::GetLoc0 => 0,
            OpCode::GetLoc1 => 1,
            OpCode::GetLoc2 => 2,
            OpCode::GetLoc3 => 3,
            OpCode::GetLoc8 => self.fb_ref().bytecode[start + 1] as u16,
            _ => {
                let bytes = &self.fb_ref().bytecode[start + 1..start + 3];
                u16::from_le_bytes([bytes[0], bytes[1]])
            }
        }
    }

    /// Postfix operators: member access chains, element access, calls,
    /// optional chaining, postfix increment/decrement. The loop makes
    /// `a[0][0]...` chains iterative.
    fn postfix_ops(&mut self, can_assign: bool, allow_call: bool) -> Result<(), CompileError> {
        loop {
            match self.current.kind.clone() {
                TokenKind::Dot => {
                    self.advance()?;
                    let name = self.property_name()?;
                    if can_assign && self.is_assignment_op() {
                        self.member_assignment(&name)?;
                    } else if self.check(&TokenKind::LParen) && allow_call {
                        let idx = self.add_string_constant(&name);
                        self.emit_op(OpCode::GetField2);
                        self.emit_u16(idx);
                        self.advance()?;
                        let argc = self.argument_list()?;
                        self.emit_op(OpCode::CallMethod);
                        self.emit_u16(argc);
                    } else if &*name == "length" {
                        self.emit_op(OpCode::GetLength);
                    } else {
                        let idx = self.add_string_constant(&name);
                        self.emit_op(OpCode::GetField);
                        self.emit_u16(idx);
                    }
                }
                TokenKind::LBracket => {
                    self.advance()?;
                    self.expression()?;
                    self.expect(TokenKind::RBracket)?;
                    if can_assign && self.is_assignment_op() {
                        self.element_assignment()?;
                    } else if self.check(&TokenKind::LParen) && allow_call {
                        self.emit_op(OpCode::GetArrayEl2);
                        self.advance()?;
                        let argc = self.argument_list()?;
                        self.emit_op(OpCode::CallMethod);
                        self.emit_u16(argc);
                    } else {
                        self.emit_op(OpCode::GetArrayEl);
                    }
                }
                TokenKind::LParen if allow_call => {
                    self.advance()?;
                    let argc = self.argument_list()?;
                    self.emit_op(OpCode::Call);
                    self.emit_u16(argc);
                }
                TokenKind::QuestionDot => {
                    self.advance()?;
                    self.optional_access(allow_call)?;
                }
                TokenKind::PlusPlus if !self.current.newline_before => {
                    self.advance()?;
                    self.postfix_incdec(OpCode::PostInc)?;
                }
                TokenKind::MinusMinus if !self.current.newline_before => {
                    self.advance()?;
                    self.postfix_incdec(OpCode::PostDec)?;
                }
                _ => break,
            }
        }
        Ok(())
    }

    /// `?.name`, `?.[expr]`, `?.(args)`: short-circuit to undefined on a
    /// nullish base.
    fn optional_access(&mut self, allow_call: bool) -> Result<(), CompileError> {
        self.emit_op(OpCode::Dup);
        self.emit_op(OpCode::Null);
        self.emit_op(OpCode::Eq);
        let nil_jump = self.emit_jump(OpCode::IfTrue);

        match self.current.kind.clone() {
            TokenKind::LBracket => {
                self.advance()?;
                self.expression()?;
                self.expect(TokenKind::RBracket)?;
                self.emit_op(OpCode::GetArrayEl);
            }
            TokenKind::LParen if allow_call => {
                self.advance()?;
                let argc = self.argument_list()?;
                self.emit_op(OpCode::Call);
                self.emit_u16(argc);
            }
            _ => {
                let name = self.property_name()?;
                if &*name == "length" {
                    self.emit_op(OpCode::GetLength);
                } else {
                    let idx = self.add_string_constant(&name);
                    self.emit_op(OpCode::GetField);
                    self.emit_u16(idx);
                }
            }
        }

        let end_jump = self.emit_jump(OpCode::Goto);
        self.patch_jump(nil_jump);
        self.emit_op(OpCode::Drop);
        self.emit_op(OpCode::Undefined);
        self.patch_jump(end_jump);
        Ok(())
    }

    /// `obj.name op= value` with the object on the stack.
    fn member_assignment(&mut self, name: &str) -> Result<(), CompileError> {
        let op = self.current.kind.clone();
        self.advance()?;
        let name_idx = self.add_string_constant(name);
        let compound = !matches!(op, TokenKind::Eq);
        if compound {
            self.emit_op(OpCode::Dup);
            self.emit_op(OpCode::GetField);
            self.emit_u16(name_idx);
            self.assignment_expr()?;
            self.emit_compound_op(&op)?;
        } else {
            self.assignment_expr()?;
        }
        self.emit_op(OpCode::Insert2);
        self.emit_op(OpCode::PutField);
        self.emit_u16(name_idx);
        Ok(())
    }

    /// `obj[key] op= value` with object and key on the stack.
    fn element_assignment(&mut self) -> Result<(), CompileError> {
        let op = self.current.kind.clone();
        self.advance()?;
        let compound = !matches!(op, TokenKind::Eq);
        if compound {
            self.emit_op(OpCode::Dup2);
            self.emit_op(OpCode::GetArrayEl);
            self.assignment_expr()?;
            self.emit_compound_op(&op)?;
        } else {
            self.assignment_expr()?;
        }
        self.emit_op(OpCode::Insert3);
        self.emit_op(OpCode::PutArrayEl);
        Ok(())
    }

    fn argument_list(&mut self) -> Result<u16, CompileError> {
        let mut count: u16 = 0;
        if !self.check(&TokenKind::RParen) {
            loop {
                self.assignment_expr()?;
                count += 1;
                if count > 255 {
                    return Err(self.err("too many arguments"));
                }
                if !self.match_token(&TokenKind::Comma)? {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen)?;
        Ok(count)
    }

    fn new_expression(&mut self) -> Result<(), CompileError> {
        self.advance()?; // new
        if self.match_token(&TokenKind::Dot)? {
            let name = self.ident_name()?;
            if &*name != "target" {
                return Err(self.err("expected 'new.target'"));
            }
            self.emit_op(OpCode::NewTarget);
            return Ok(());
        }
        // Callee is a member expression: calls bind to the `new`, not the
        // callee chain
        self.prefix_expr(false, false)?;
        let argc = if self.check(&TokenKind::LParen) {
            self.advance()?;
            self.argument_list()?
        } else {
            0
        };
        self.emit_op(OpCode::CallConstructor);
        self.emit_u16(argc);
        Ok(())
    }

    /// Parenthesised group (or arrow function parameter list). Chains of
    /// grouping parens are consumed by a counting loop, with operator
    /// continuations handled between the closes. The outermost close
    /// leaves trailing operators to the caller so the enclosing
    /// precedence context stays intact.
    fn paren_group(&mut self, can_assign: bool) -> Result<(), CompileError> {
        if self.arrow_params_ahead() {
            return self.arrow_from_parens();
        }
        let mut depth = 0usize;
        while self.check(&TokenKind::LParen) && !self.arrow_params_ahead() {
            self.advance()?;
            depth += 1;
        }
        if depth == 0 {
            // `(` opening arrow params; handled above, defensive here
            return self.arrow_from_parens();
        }
        self.expression()?;
        for i in 0..depth {
            self.expect(TokenKind::RParen)?;
            self.postfix_ops(can_assign, true)?;
            if i + 1 < depth {
                self.group_continuation()?;
            }
        }
        Ok(())
    }

    /// Decide whether the `(` at the current token starts an arrow
    /// function's parameter list, by scanning to its matching `)` and
    /// checking for `=>`. Only attempted when the next token could begin
    /// a parameter list, so `(((...` chains stay linear.
    fn arrow_params_ahead(&mut self) -> bool {
        if !self.check(&TokenKind::LParen) {
            return false;
        }
        let state = self.lexer.save();
        let first = self.lexer.next_token().kind;
        let plausible = matches!(first, TokenKind::Ident(_) | TokenKind::RParen | TokenKind::Of);
        if !plausible {
            self.lexer.restore(state);
            return false;
        }
        let mut depth = 1i32;
        let mut tok = first;
        loop {
            match tok {
                TokenKind::LParen => depth += 1,
                TokenKind::RParen => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
                TokenKind::Eof => {
                    self.lexer.restore(state);
                    return false;
                }
                _ => {}
            }
            tok = self.lexer.next_token().kind;
        }
        let arrow = matches!(self.lexer.next_token().kind, TokenKind::Arrow);
        self.lexer.restore(state);
        arrow
    }

    fn arrow_from_parens(&mut self) -> Result<(), CompileError> {
        self.advance()?; // (
        let mut params: Vec<Rc<str>> = Vec::new();
        if !self.check(&TokenKind::RParen) {
            loop {
                params.push(self.ident_name()?);
                if !self.match_token(&TokenKind::Comma)? {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen)?;
        self.arrow_function(params)
    }

    fn arrow_function(&mut self, params: Vec<Rc<str>>) -> Result<(), CompileError> {
        self.expect(TokenKind::Arrow)?;
        self.compile_function_body(None, params, true)
    }

    /// Array literal. An explicit stack of in-progress element counts
    /// makes `[[[...]]]` nesting iterative.
    fn array_literal(&mut self) -> Result<(), CompileError> {
        let mut counts: Vec<u16> = Vec::new();
        self.advance()?; // [
        counts.push(0);
        let mut have_value = false;

        loop {
            if have_value {
                // Element expression continuing from a completed nested
                // array value
                self.postfix_ops(false, true)?;
                self.infix_loop(Precedence::Assignment)?;
                have_value = false;
                *counts.last_mut().expect("array frame") += 1;
                if self.match_token(&TokenKind::Comma)? {
                    continue;
                }
                if !self.check(&TokenKind::RBracket) {
                    return Err(self.err("expected ',' or ']' in array literal"));
                }
                continue;
            }
            if self.check(&TokenKind::RBracket) {
                self.advance()?;
                let n = counts.pop().expect("array frame");
                self.emit_op(OpCode::ArrayFrom);
                self.emit_u16(n);
                if counts.is_empty() {
                    return Ok(());
                }
                have_value = true;
                continue;
            }
            if self.check(&TokenKind::LBracket) {
                self.advance()?;
                counts.push(0);
                continue;
            }
            if self.check(&TokenKind::Comma) {
                return Err(self.err("array holes are not supported"));
            }
            self.assignment_expr()?;
            *counts.last_mut().expect("array frame") += 1;
            if self.match_token(&TokenKind::Comma)? {
                continue;
            }
            if !self.check(&TokenKind::RBracket) {
                return Err(self.err("expected ',' or ']' in array literal"));
            }
        }
    }

    fn object_literal(&mut self) -> Result<(), CompileError> {
        self.advance()?; // {
        self.emit_op(OpCode::Object);

        while !self.check(&TokenKind::RBrace) {
            // Accessor?
            if let TokenKind::Ident(word) = self.current.kind.clone() {
                if (word == "get" || word == "set") && self.accessor_ahead() {
                    self.advance()?;
                    let name = self.literal_property_name()?;
                    let idx = self.add_string_constant(&name);
                    self.function_rest(Some(Rc::clone(&name)))?;
                    self.emit_op(if word == "get" {
                        OpCode::DefineGetter
                    } else {
                        OpCode::DefineSetter
                    });
                    self.emit_u16(idx);
                    if !self.match_token(&TokenKind::Comma)? {
                        break;
                    }
                    continue;
                }
            }

            if self.check(&TokenKind::LBracket) {
                // Computed key: duplicate the object so the store keeps it
                self.advance()?;
                self.emit_op(OpCode::Dup);
                self.assignment_expr()?;
                self.expect(TokenKind::RBracket)?;
                self.expect(TokenKind::Colon)?;
                self.assignment_expr()?;
                self.emit_op(OpCode::PutArrayEl);
            } else {
                let name = self.literal_property_name()?;
                let idx = self.add_string_constant(&name);
                if self.check(&TokenKind::LParen) {
                    // Method shorthand
                    self.function_rest(Some(Rc::clone(&name)))?;
                } else if self.match_token(&TokenKind::Colon)? {
                    self.assignment_expr()?;
                } else {
                    // Shorthand property
                    self.load_identifier(&name)?;
                }
                self.emit_op(OpCode::DefineField);
                self.emit_u16(idx);
            }

            if !self.match_token(&TokenKind::Comma)? {
                break;
            }
        }
        self.expect(TokenKind::RBrace)?;
        Ok(())
    }

    /// Is the token after `get`/`set` a property name (accessor syntax)
    /// rather than `:`/`,`/`(`/`}` (plain property named "get"/"set")?
    fn accessor_ahead(&mut self) -> bool {
        let state = self.lexer.save();
        let next = self.lexer.next_token().kind;
        self.lexer.restore(state);
        token_name(&next).is_some()
            || matches!(next, TokenKind::Str(_) | TokenKind::Number(_))
    }

    fn literal_property_name(&mut self) -> Result<Rc<str>, CompileError> {
        let name: Rc<str> = match &self.current.kind {
            TokenKind::Str(units) => Rc::from(JsString::from_units(units.clone()).to_rust_string()),
            TokenKind::Number(n) => Rc::from(crate::util::dtoa::f64_to_js_string(*n)),
            kind => token_name(kind).ok_or_else(|| self.err("expected property name"))?,
        };
        self.advance()?;
        Ok(name)
    }

    fn template_literal(&mut self, cooked: Vec<u16>, has_subst: bool) -> Result<(), CompileError> {
        self.emit_string(JsString::from_units(cooked));
        if !has_subst {
            return self.advance();
        }
        loop {
            self.advance()?; // past the chunk, into the expression
            self.expression()?;
            if !self.check(&TokenKind::RBrace) {
                return Err(self.err("expected '}' in template literal"));
            }
            // Concatenate the substitution (Add coerces via ToString)
            self.emit_op(OpCode::Add);
            let chunk = self.lexer.resume_template();
            if let TokenKind::Error(message) = &chunk.kind {
                return Err(CompileError::Syntax {
                    message: message.clone(),
                    line: chunk.line,
                    column: chunk.column,
                });
            }
            self.current = chunk;
            match self.current.kind.clone() {
                TokenKind::TemplateMiddle { cooked, has_subst } => {
                    self.emit_string(JsString::from_units(cooked));
                    self.emit_op(OpCode::Add);
                    if !has_subst {
                        return self.advance();
                    }
                }
                _ => return Err(self.err("malformed template literal")),
            }
        }
    }
}

/// Opcodes that load a local slot (for increment/decrement rewriting).
fn is_local_load(op: OpCode) -> bool {
    matches!(
        op,
        OpCode::GetLoc0
            | OpCode::GetLoc1
            | OpCode::GetLoc2
            | OpCode::GetLoc3
            | OpCode::GetLoc8
            | OpCode::GetLoc
            | OpCode::GetArg
    )
}

fn binary_opcode(op: &TokenKind) -> Option<OpCode> {
    Some(match op {
        TokenKind::Plus => OpCode::Add,
        TokenKind::Minus => OpCode::Sub,
        TokenKind::Star => OpCode::Mul,
        TokenKind::Slash => OpCode::Div,
        TokenKind::Percent => OpCode::Mod,
        TokenKind::StarStar => OpCode::Pow,
        TokenKind::Amp => OpCode::And,
        TokenKind::Pipe => OpCode::Or,
        TokenKind::Caret => OpCode::Xor,
        TokenKind::LtLt => OpCode::Shl,
        TokenKind::GtGt => OpCode::Sar,
        TokenKind::GtGtGt => OpCode::Shr,
        TokenKind::Lt => OpCode::Lt,
        TokenKind::LtEq => OpCode::Lte,
        TokenKind::Gt => OpCode::Gt,
        TokenKind::GtEq => OpCode::Gte,
        TokenKind::EqEq => OpCode::Eq,
        TokenKind::BangEq => OpCode::Neq,
        TokenKind::EqEqEq => OpCode::StrictEq,
        TokenKind::BangEqEq => OpCode::StrictNeq,
        TokenKind::InstanceOf => OpCode::InstanceOf,
        TokenKind::In => OpCode::In,
        _ => return None,
    })
}

/// Textual name for identifier-like tokens (keywords are valid property
/// names).
fn token_name(kind: &TokenKind) -> Option<Rc<str>> {
    let s = match kind {
        TokenKind::Ident(n) => return Some(Rc::from(n.as_str())),
        TokenKind::Break => "break",
        TokenKind::Case => "case",
        TokenKind::Catch => "catch",
        TokenKind::Const => "const",
        TokenKind::Continue => "continue",
        TokenKind::Debugger => "debugger",
        TokenKind::Default => "default",
        TokenKind::Delete => "delete",
        TokenKind::Do => "do",
        TokenKind::Else => "else",
        TokenKind::False => "false",
        TokenKind::Finally => "finally",
        TokenKind::For => "for",
        TokenKind::Function => "function",
        TokenKind::If => "if",
        TokenKind::In => "in",
        TokenKind::InstanceOf => "instanceof",
        TokenKind::Let => "let",
        TokenKind::New => "new",
        TokenKind::Null => "null",
        TokenKind::Of => "of",
        TokenKind::Return => "return",
        TokenKind::Switch => "switch",
        TokenKind::This => "this",
        TokenKind::Throw => "throw",
        TokenKind::True => "true",
        TokenKind::Try => "try",
        TokenKind::TypeOf => "typeof",
        TokenKind::Var => "var",
        TokenKind::Void => "void",
        TokenKind::While => "while",
        _ => return None,
    };
    Some(Rc::from(s))
}

/// Operator precedence levels (lowest to highest)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    Assignment,
    Ternary,
    Nullish,
    LogicalOr,
    LogicalAnd,
    BitwiseOr,
    BitwiseXor,
    BitwiseAnd,
    Equality,
    Relational,
    Shift,
    Additive,
    Multiplicative,
    Exponentiation,
    Unary,
    Postfix,
}

impl Precedence {
    fn next(self) -> Self {
        match self {
            Precedence::Assignment => Precedence::Ternary,
            Precedence::Ternary => Precedence::Nullish,
            Precedence::Nullish => Precedence::LogicalOr,
            Precedence::LogicalOr => Precedence::LogicalAnd,
            Precedence::LogicalAnd => Precedence::BitwiseOr,
            Precedence::BitwiseOr => Precedence::BitwiseXor,
            Precedence::BitwiseXor => Precedence::BitwiseAnd,
            Precedence::BitwiseAnd => Precedence::Equality,
            Precedence::Equality => Precedence::Relational,
            Precedence::Relational => Precedence::Shift,
            Precedence::Shift => Precedence::Additive,
            Precedence::Additive => Precedence::Multiplicative,
            Precedence::Multiplicative => Precedence::Exponentiation,
            Precedence::Exponentiation => Precedence::Unary,
            Precedence::Unary => Precedence::Postfix,
            Precedence::Postfix => Precedence::Postfix,
        }
    }
}

/// Operator associativity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Associativity {
    Left,
    Right,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compiles(source: &str) -> Rc<FunctionBytecode> {
        compile(source).unwrap_or_else(|e| panic!("compile failed for {:?}: {}", source, e))
    }

    #[test]
    fn test_compile_literals() {
        for src in ["42;", "3.14;", "\"hello\";", "true;", "null;", "[1,2];", "({a:1});"] {
            compiles(src);
        }
    }

    #[test]
    fn test_compile_small_integers() {
        let func = compiles("5;");
        assert_eq!(func.bytecode[0], OpCode::Push5 as u8);
    }

    #[test]
    fn test_compile_addition_order() {
        let func = compiles("1 + 2 * 3;");
        assert_eq!(func.bytecode[0], OpCode::Push1 as u8);
        assert_eq!(func.bytecode[1], OpCode::Push2 as u8);
        assert_eq!(func.bytecode[2], OpCode::Push3 as u8);
        assert_eq!(func.bytecode[3], OpCode::Mul as u8);
        assert_eq!(func.bytecode[4], OpCode::Add as u8);
    }

    #[test]
    fn test_compile_statements() {
        compiles("var x = 1; x = x + 1;");
        compiles("let y = 2; const z = 3;");
        compiles("if (1) { 2; } else { 3; }");
        compiles("while (0) { 1; }");
        compiles("do { 1; } while (0);");
        compiles("for (var i = 0; i < 10; i++) { i; }");
        compiles("for (var k in {a:1}) { k; }");
        compiles("for (var v of [1,2]) { v; }");
        compiles("switch (1) { case 1: 2; break; default: 3; }");
        compiles("try { 1; } catch (e) { 2; } finally { 3; }");
        compiles("function f(a, b) { return a + b; } f(1, 2);");
    }

    #[test]
    fn test_compile_functions_and_closures() {
        let func = compiles("function mk() { var c = 0; return function () { return ++c; }; }");
        // The program has one inner function constant
        let inner = func
            .constants
            .iter()
            .find_map(|c| match c {
                Const::Function(f) => Some(f),
                _ => None,
            })
            .expect("inner function");
        // `mk` cell-allocates `c` for the returned closure
        assert_eq!(inner.captured, vec![1]);
        let grandchild = inner
            .constants
            .iter()
            .find_map(|c| match c {
                Const::Function(f) => Some(f),
                _ => None,
            })
            .expect("closure function");
        assert_eq!(grandchild.upvalues, vec![UpvalueSource::ParentLocal(1)]);
    }

    #[test]
    fn test_compile_arrow_functions() {
        compiles("var f = x => x + 1;");
        compiles("var g = (a, b) => { return a * b; };");
        compiles("var h = () => 42;");
    }

    #[test]
    fn test_compile_member_forms() {
        compiles("a.b;var a;");
        compiles("var o = {}; o.x = 1; o.x += 2; o['y'] = 3; o.x++; --o.x; delete o.x;");
        compiles("var a = [[1],[2]]; a[0][0] = a[1][0]; a[0][0]++;");
    }

    #[test]
    fn test_compile_optional_and_nullish() {
        compiles("var a = null; a?.b; a ?? 1; a?.[0]; a?.();");
    }

    #[test]
    fn test_compile_templates() {
        compiles("var x = 1; `a${x}b${x + 1}`;");
        compiles("`plain`;");
    }

    #[test]
    fn test_compile_regex_literal() {
        let func = compiles("/ab+c/gi;");
        assert!(func
            .constants
            .iter()
            .any(|c| matches!(c, Const::Regex(_))));
    }

    #[test]
    fn test_invalid_regex_literal_is_compile_error() {
        assert!(matches!(
            compile("/(unclosed/;"),
            Err(CompileError::Regex { .. })
        ));
    }

    #[test]
    fn test_exception_table_registration() {
        let func = compiles("try { 1; } catch (e) { 2; }");
        assert_eq!(func.exceptions.len(), 1);
        assert!(func.exceptions[0].catch_pc.is_some());
        assert!(func.exceptions[0].finally_pc.is_none());

        let func = compiles("try { 1; } finally { 2; }");
        assert_eq!(func.exceptions.len(), 1);
        assert!(func.exceptions[0].catch_pc.is_none());
        assert!(func.exceptions[0].finally_pc.is_some());
    }

    #[test]
    fn test_deep_parens() {
        let src = format!("{}1{};", "(".repeat(1000), ")".repeat(1000));
        compiles(&src);
    }

    #[test]
    fn test_deep_blocks() {
        let src = format!("{}1;{}", "{".repeat(1000), "}".repeat(1000));
        compiles(&src);
    }

    #[test]
    fn test_deep_arrays() {
        let src = format!("{}1{};", "[".repeat(1000), "]".repeat(1000));
        compiles(&src);
    }

    #[test]
    fn test_deep_member_chain() {
        let src = format!("var a; a{};", "[0]".repeat(1000));
        compiles(&src);
    }

    #[test]
    fn test_syntax_error_positions() {
        match compile("var x = \n  @;") {
            Err(CompileError::Syntax { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected syntax error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_const_reassignment_rejected() {
        assert!(compile("const x = 1; x = 2;").is_err());
    }

    #[test]
    fn test_asi() {
        compiles("var x = 1\nvar y = 2\nx + y;");
        compiles("return\n");
    }
}
