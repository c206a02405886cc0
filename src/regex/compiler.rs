//! Regex pattern compiler
//!
//! Parses a pattern and emits instructions in one pass. Quantified atoms
//! are compiled by buffering the atom's instructions and re-emitting them
//! inside the loop scaffolding; `{n,m}` repetition expands to copies.
//! Quantifier bodies that can match empty get a guard register checked by
//! `CheckAdvance`, which defeats the `(a*)*` family of blowups.

use super::{Flags, Regex, RegexError, RegexOp};

/// Highest permitted `{n,m}` expansion, to bound program size.
const MAX_REPEAT: u32 = 1000;

struct PatternParser {
    chars: Vec<char>,
    pos: usize,
    flags: Flags,
    program: Vec<RegexOp>,
    group_count: u16,
    named_groups: Vec<(String, usize)>,
    register_count: usize,
}

/// Compile a pattern with already-parsed flags.
pub fn compile(pattern: &str, flags: Flags) -> Result<Regex, RegexError> {
    let mut parser = PatternParser {
        chars: pattern.chars().collect(),
        pos: 0,
        flags,
        program: Vec::new(),
        group_count: 0,
        named_groups: Vec::new(),
        register_count: 0,
    };

    parser.emit(RegexOp::SaveStart(0));
    parser.disjunction()?;
    if parser.pos < parser.chars.len() {
        // A stray `)` is the only way the parser stops early
        return Err(parser.error("unmatched ')'"));
    }
    parser.emit(RegexOp::SaveEnd(0));
    parser.emit(RegexOp::Match);

    Ok(Regex {
        source: pattern.to_string(),
        flag_str: String::new(),
        flags,
        program: parser.program,
        capture_count: parser.group_count as usize + 1,
        named_groups: parser.named_groups,
        register_count: parser.register_count,
    })
}

impl PatternParser {
    fn error(&self, message: &str) -> RegexError {
        RegexError {
            message: message.to_string(),
        }
    }

    #[inline]
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    #[inline]
    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    #[inline]
    fn next(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn emit(&mut self, op: RegexOp) -> usize {
        self.program.push(op);
        self.program.len() - 1
    }

    fn here(&self) -> u32 {
        self.program.len() as u32
    }

    fn patch(&mut self, idx: usize, target: u32) {
        match &mut self.program[idx] {
            RegexOp::SplitFirst(t) | RegexOp::SplitNext(t) | RegexOp::Jump(t) => *t = target,
            RegexOp::Look { end, .. } => *end = target,
            _ => {}
        }
    }

    fn alloc_register(&mut self) -> Result<u8, RegexError> {
        if self.register_count >= 255 {
            return Err(self.error("too many quantifier guard registers"));
        }
        let reg = self.register_count as u8;
        self.register_count += 1;
        Ok(reg)
    }

    /// `a|b|c`. Returns whether the whole disjunction can match empty.
    fn disjunction(&mut self) -> Result<bool, RegexError> {
        let mut jumps: Vec<usize> = Vec::new();
        let mut can_be_empty = false;
        loop {
            let split = if self.more_alternatives_ahead() {
                Some(self.emit(RegexOp::SplitFirst(0)))
            } else {
                None
            };
            let empty = self.alternative()?;
            can_be_empty |= empty;

            if self.peek() == Some('|') {
                self.next();
                jumps.push(self.emit(RegexOp::Jump(0)));
                if let Some(idx) = split {
                    let here = self.here();
                    self.patch(idx, here);
                }
            } else {
                // Alternative ended at `)` or end of pattern
                if let Some(idx) = split {
                    // A split was emitted but no `|` followed: the next
                    // alternative is empty, which always matches
                    let here = self.here();
                    self.patch(idx, here);
                }
                break;
            }
        }
        let end = self.here();
        for idx in jumps {
            self.patch(idx, end);
        }
        Ok(can_be_empty)
    }

    /// Whether a top-level `|` occurs before the group closes.
    fn more_alternatives_ahead(&self) -> bool {
        let mut depth = 0usize;
        let mut in_class = false;
        let mut i = self.pos;
        while let Some(&c) = self.chars.get(i) {
            match c {
                '\\' => i += 1,
                '[' if !in_class => in_class = true,
                ']' if in_class => in_class = false,
                '(' if !in_class => depth += 1,
                ')' if !in_class => {
                    if depth == 0 {
                        return false;
                    }
                    depth -= 1;
                }
                '|' if !in_class && depth == 0 => return true,
                _ => {}
            }
            i += 1;
        }
        false
    }

    /// A sequence of quantified terms.
    fn alternative(&mut self) -> Result<bool, RegexError> {
        let mut can_be_empty = true;
        loop {
            match self.peek() {
                None | Some('|') | Some(')') => break,
                _ => {}
            }
            can_be_empty &= self.term()?;
        }
        Ok(can_be_empty)
    }

    /// One atom with an optional quantifier.
    fn term(&mut self) -> Result<bool, RegexError> {
        let start = self.program.len();
        let atom_empty = self.atom()?;

        let (min, max) = match self.peek() {
            Some('*') => {
                self.next();
                (0, u32::MAX)
            }
            Some('+') => {
                self.next();
                (1, u32::MAX)
            }
            Some('?') => {
                self.next();
                (0, 1)
            }
            Some('{') if self.braced_quantifier_ahead() => self.braced_quantifier()?,
            _ => return Ok(atom_empty),
        };
        let greedy = if self.peek() == Some('?') {
            self.next();
            false
        } else {
            true
        };

        let body: Vec<RegexOp> = self.program.drain(start..).collect();
        self.quantify(&body, start, min, max, greedy, atom_empty)?;
        Ok(min == 0 || atom_empty)
    }

    /// Whether `{` starts a well-formed quantifier (otherwise it is a
    /// literal character).
    fn braced_quantifier_ahead(&self) -> bool {
        let mut i = self.pos + 1;
        let mut digits = 0;
        while let Some(&c) = self.chars.get(i) {
            match c {
                '0'..='9' => digits += 1,
                ',' if digits > 0 => {}
                '}' => return digits > 0,
                _ => return false,
            }
            i += 1;
        }
        false
    }

    fn braced_quantifier(&mut self) -> Result<(u32, u32), RegexError> {
        self.next(); // {
        let mut min = 0u32;
        let mut saw_digit = false;
        while let Some(c) = self.peek() {
            let Some(d) = c.to_digit(10) else { break };
            self.next();
            saw_digit = true;
            min = min.saturating_mul(10).saturating_add(d);
        }
        if !saw_digit {
            return Err(self.error("invalid quantifier"));
        }
        let max = if self.peek() == Some(',') {
            self.next();
            if self.peek() == Some('}') {
                u32::MAX
            } else {
                let mut max = 0u32;
                while let Some(c) = self.peek() {
                    let Some(d) = c.to_digit(10) else { break };
                    self.next();
                    max = max.saturating_mul(10).saturating_add(d);
                }
                max
            }
        } else {
            min
        };
        if self.next() != Some('}') {
            return Err(self.error("invalid quantifier"));
        }
        if max < min {
            return Err(self.error("quantifier range out of order"));
        }
        if min > MAX_REPEAT || (max != u32::MAX && max > MAX_REPEAT) {
            return Err(self.error("quantifier repetition too large"));
        }
        Ok((min, max))
    }

    /// Re-append a buffered atom, shifting its internal jump targets.
    fn append_body(&mut self, body: &[RegexOp], orig_start: usize) {
        let delta = self.program.len() as i64 - orig_start as i64;
        for op in body {
            let shifted = match op {
                RegexOp::Jump(t) => RegexOp::Jump((*t as i64 + delta) as u32),
                RegexOp::SplitFirst(t) => RegexOp::SplitFirst((*t as i64 + delta) as u32),
                RegexOp::SplitNext(t) => RegexOp::SplitNext((*t as i64 + delta) as u32),
                RegexOp::Look {
                    negative,
                    behind,
                    end,
                } => RegexOp::Look {
                    negative: *negative,
                    behind: *behind,
                    end: (*end as i64 + delta) as u32,
                },
                other => other.clone(),
            };
            self.program.push(shifted);
        }
    }

    /// Emit the loop scaffolding for a quantified atom.
    fn quantify(
        &mut self,
        body: &[RegexOp],
        orig_start: usize,
        min: u32,
        max: u32,
        greedy: bool,
        atom_empty: bool,
    ) -> Result<(), RegexError> {
        let unbounded = max == u32::MAX;

        // Required copies
        for _ in 0..min {
            self.append_body(body, orig_start);
        }

        if unbounded {
            self.star(body, orig_start, greedy, atom_empty)?;
        } else {
            // Bounded optional copies
            for _ in 0..(max - min) {
                self.optional(body, orig_start, greedy);
            }
        }
        Ok(())
    }

    fn optional(&mut self, body: &[RegexOp], orig_start: usize, greedy: bool) {
        let split = if greedy {
            self.emit(RegexOp::SplitFirst(0))
        } else {
            self.emit(RegexOp::SplitNext(0))
        };
        self.append_body(body, orig_start);
        let here = self.here();
        self.patch(split, here);
    }

    fn star(
        &mut self,
        body: &[RegexOp],
        orig_start: usize,
        greedy: bool,
        atom_empty: bool,
    ) -> Result<(), RegexError> {
        let loop_start = self.here();
        if atom_empty {
            let reg = self.alloc_register()?;
            self.emit(RegexOp::SetPos(reg));
            let split = if greedy {
                self.emit(RegexOp::SplitFirst(0))
            } else {
                self.emit(RegexOp::SplitNext(0))
            };
            self.append_body(body, orig_start);
            self.emit(RegexOp::CheckAdvance(reg));
            self.emit(RegexOp::Jump(loop_start));
            let here = self.here();
            self.patch(split, here);
        } else {
            let split = if greedy {
                self.emit(RegexOp::SplitFirst(0))
            } else {
                self.emit(RegexOp::SplitNext(0))
            };
            self.append_body(body, orig_start);
            self.emit(RegexOp::Jump(loop_start));
            let here = self.here();
            self.patch(split, here);
        }
        Ok(())
    }

    /// One atom. Returns whether it can match without consuming input.
    fn atom(&mut self) -> Result<bool, RegexError> {
        let Some(c) = self.next() else {
            return Ok(true);
        };
        match c {
            '.' => {
                if self.flags.contains(Flags::DOT_ALL) {
                    self.emit(RegexOp::AnyChar);
                } else {
                    self.emit(RegexOp::Dot);
                }
                Ok(false)
            }
            '^' => {
                if self.flags.contains(Flags::MULTILINE) {
                    self.emit(RegexOp::LineStartMulti);
                } else {
                    self.emit(RegexOp::LineStart);
                }
                Ok(true)
            }
            '$' => {
                if self.flags.contains(Flags::MULTILINE) {
                    self.emit(RegexOp::LineEndMulti);
                } else {
                    self.emit(RegexOp::LineEnd);
                }
                Ok(true)
            }
            '[' => {
                self.char_class()?;
                Ok(false)
            }
            '(' => self.group(),
            '\\' => self.escape(),
            '*' | '+' | '?' => Err(self.error("quantifier without a target")),
            ')' => {
                // Callers treat `)` as a terminator; reaching it here
                // means a stray close
                self.pos -= 1;
                Err(self.error("unmatched ')'"))
            }
            c => {
                self.emit_char(c as u32);
                Ok(false)
            }
        }
    }

    fn emit_char(&mut self, cp: u32) {
        if cp > 0xFFFF && !self.flags.contains(Flags::UNICODE) {
            // Without the u flag, astral characters match as their
            // surrogate pair of code units
            let c = cp - 0x10000;
            self.emit(RegexOp::Char(0xD800 + (c >> 10)));
            self.emit(RegexOp::Char(0xDC00 + (c & 0x3FF)));
        } else {
            self.emit(RegexOp::Char(cp));
        }
    }

    fn group(&mut self) -> Result<bool, RegexError> {
        // Group kind
        if self.peek() == Some('?') {
            match self.peek_at(1) {
                Some(':') => {
                    self.pos += 2;
                    let empty = self.disjunction()?;
                    self.expect_close()?;
                    Ok(empty)
                }
                Some('=') => {
                    self.pos += 2;
                    self.lookaround(false, false)
                }
                Some('!') => {
                    self.pos += 2;
                    self.lookaround(true, false)
                }
                Some('<') => match self.peek_at(2) {
                    Some('=') => {
                        self.pos += 3;
                        self.lookaround(false, true)
                    }
                    Some('!') => {
                        self.pos += 3;
                        self.lookaround(true, true)
                    }
                    _ => {
                        // Named capture group
                        self.pos += 2;
                        let mut name = String::new();
                        while let Some(c) = self.peek() {
                            if c == '>' {
                                break;
                            }
                            if !(c.is_ascii_alphanumeric() || c == '_' || c == '$') {
                                return Err(self.error("invalid capture group name"));
                            }
                            name.push(c);
                            self.next();
                        }
                        if name.is_empty() || self.next() != Some('>') {
                            return Err(self.error("invalid capture group name"));
                        }
                        if self.named_groups.iter().any(|(n, _)| *n == name) {
                            return Err(self.error("duplicate capture group name"));
                        }
                        self.capture_group(Some(name))
                    }
                },
                _ => Err(self.error("invalid group")),
            }
        } else {
            self.capture_group(None)
        }
    }

    fn capture_group(&mut self, name: Option<String>) -> Result<bool, RegexError> {
        self.group_count += 1;
        let idx = self.group_count;
        if let Some(name) = name {
            self.named_groups.push((name, idx as usize));
        }
        self.emit(RegexOp::SaveStart(idx));
        let empty = self.disjunction()?;
        self.expect_close()?;
        self.emit(RegexOp::SaveEnd(idx));
        Ok(empty)
    }

    fn lookaround(&mut self, negative: bool, behind: bool) -> Result<bool, RegexError> {
        let look = self.emit(RegexOp::Look {
            negative,
            behind,
            end: 0,
        });
        self.disjunction()?;
        self.expect_close()?;
        self.emit(RegexOp::LookEnd);
        let here = self.here();
        self.patch(look, here);
        Ok(true)
    }

    fn expect_close(&mut self) -> Result<(), RegexError> {
        if self.next() != Some(')') {
            Err(self.error("missing ')' in group"))
        } else {
            Ok(())
        }
    }

    fn escape(&mut self) -> Result<bool, RegexError> {
        let Some(c) = self.next() else {
            return Err(self.error("trailing backslash"));
        };
        match c {
            'd' => {
                self.emit(RegexOp::Digit);
                Ok(false)
            }
            'D' => {
                self.emit(RegexOp::NotDigit);
                Ok(false)
            }
            'w' => {
                self.emit(RegexOp::Word);
                Ok(false)
            }
            'W' => {
                self.emit(RegexOp::NotWord);
                Ok(false)
            }
            's' => {
                self.emit(RegexOp::Space);
                Ok(false)
            }
            'S' => {
                self.emit(RegexOp::NotSpace);
                Ok(false)
            }
            'b' => {
                self.emit(RegexOp::WordBoundary);
                Ok(true)
            }
            'B' => {
                self.emit(RegexOp::NotWordBoundary);
                Ok(true)
            }
            'k' => {
                if self.next() != Some('<') {
                    return Err(self.error("expected '<' after \\k"));
                }
                let mut name = String::new();
                while let Some(c) = self.peek() {
                    if c == '>' {
                        break;
                    }
                    name.push(c);
                    self.next();
                }
                if self.next() != Some('>') {
                    return Err(self.error("unterminated \\k<...> backreference"));
                }
                let idx = self
                    .named_groups
                    .iter()
                    .find(|(n, _)| *n == name)
                    .map(|(_, i)| *i)
                    .ok_or_else(|| self.error("backreference to unknown group name"))?;
                self.emit(RegexOp::Backref(idx as u16));
                Ok(true)
            }
            '1'..='9' => {
                let mut idx = c.to_digit(10).unwrap_or(0);
                while let Some(d) = self.peek().and_then(|c| c.to_digit(10)) {
                    let widened = idx * 10 + d;
                    if widened > u16::MAX as u32 {
                        break;
                    }
                    idx = widened;
                    self.next();
                }
                self.emit(RegexOp::Backref(idx as u16));
                Ok(true)
            }
            '0' => {
                self.emit_char(0);
                Ok(false)
            }
            'n' => {
                self.emit_char(0x0A);
                Ok(false)
            }
            'r' => {
                self.emit_char(0x0D);
                Ok(false)
            }
            't' => {
                self.emit_char(0x09);
                Ok(false)
            }
            'f' => {
                self.emit_char(0x0C);
                Ok(false)
            }
            'v' => {
                self.emit_char(0x0B);
                Ok(false)
            }
            'x' => {
                let cp = self.hex_digits(2)?;
                self.emit_char(cp);
                Ok(false)
            }
            'u' => {
                if self.flags.contains(Flags::UNICODE) && self.peek() == Some('{') {
                    self.next();
                    let mut cp = 0u32;
                    let mut digits = 0;
                    while let Some(c) = self.peek() {
                        if c == '}' {
                            break;
                        }
                        let d = c
                            .to_digit(16)
                            .ok_or_else(|| self.error("invalid unicode escape"))?;
                        cp = cp * 16 + d;
                        digits += 1;
                        if digits > 6 || cp > 0x10FFFF {
                            return Err(self.error("invalid unicode escape"));
                        }
                        self.next();
                    }
                    if self.next() != Some('}') || digits == 0 {
                        return Err(self.error("invalid unicode escape"));
                    }
                    self.emit_char(cp);
                } else {
                    let cp = self.hex_digits(4)?;
                    self.emit_char(cp);
                }
                Ok(false)
            }
            c if c.is_ascii_alphanumeric() => Err(self.error(&format!("invalid escape \\{}", c))),
            c => {
                // Identity escape for punctuation
                self.emit_char(c as u32);
                Ok(false)
            }
        }
    }

    fn hex_digits(&mut self, count: usize) -> Result<u32, RegexError> {
        let mut value = 0u32;
        for _ in 0..count {
            let d = self
                .next()
                .and_then(|c| c.to_digit(16))
                .ok_or_else(|| self.error("invalid hexadecimal escape"))?;
            value = value * 16 + d;
        }
        Ok(value)
    }

    /// `[...]` character class.
    fn char_class(&mut self) -> Result<(), RegexError> {
        let negated = if self.peek() == Some('^') {
            self.next();
            true
        } else {
            false
        };
        let mut ranges: Vec<(u32, u32)> = Vec::new();

        loop {
            let Some(c) = self.next() else {
                return Err(self.error("unterminated character class"));
            };
            if c == ']' {
                break;
            }
            let lo = if c == '\\' {
                match self.class_escape()? {
                    ClassItem::Char(cp) => cp,
                    ClassItem::Ranges(expanded) => {
                        ranges.extend_from_slice(&expanded);
                        continue;
                    }
                }
            } else {
                c as u32
            };

            // Range?
            if self.peek() == Some('-') && self.peek_at(1).is_some() && self.peek_at(1) != Some(']')
            {
                self.next(); // -
                let Some(c2) = self.next() else {
                    return Err(self.error("unterminated character class"));
                };
                let hi = if c2 == '\\' {
                    match self.class_escape()? {
                        ClassItem::Char(cp) => cp,
                        ClassItem::Ranges(_) => {
                            return Err(self.error("invalid range in character class"));
                        }
                    }
                } else {
                    c2 as u32
                };
                if hi < lo {
                    return Err(self.error("range out of order in character class"));
                }
                ranges.push((lo, hi));
            } else {
                ranges.push((lo, lo));
            }
        }

        self.emit(RegexOp::Class {
            ranges: ranges.into_boxed_slice(),
            negated,
        });
        Ok(())
    }

    fn class_escape(&mut self) -> Result<ClassItem, RegexError> {
        let Some(c) = self.next() else {
            return Err(self.error("trailing backslash in character class"));
        };
        let item = match c {
            'd' => ClassItem::Ranges(vec![('0' as u32, '9' as u32)]),
            'D' => ClassItem::Ranges(vec![(0, '0' as u32 - 1), ('9' as u32 + 1, 0x10FFFF)]),
            'w' => ClassItem::Ranges(vec![
                ('0' as u32, '9' as u32),
                ('A' as u32, 'Z' as u32),
                ('_' as u32, '_' as u32),
                ('a' as u32, 'z' as u32),
            ]),
            'W' => ClassItem::Ranges(vec![
                (0, '0' as u32 - 1),
                ('9' as u32 + 1, 'A' as u32 - 1),
                ('Z' as u32 + 1, '_' as u32 - 1),
                ('_' as u32 + 1, 'a' as u32 - 1),
                ('z' as u32 + 1, 0x10FFFF),
            ]),
            's' => ClassItem::Ranges(SPACE_RANGES.to_vec()),
            'S' => ClassItem::Ranges(vec![('!' as u32, '~' as u32)]),
            'n' => ClassItem::Char(0x0A),
            'r' => ClassItem::Char(0x0D),
            't' => ClassItem::Char(0x09),
            'f' => ClassItem::Char(0x0C),
            'v' => ClassItem::Char(0x0B),
            'b' => ClassItem::Char(0x08),
            '0' => ClassItem::Char(0),
            'x' => ClassItem::Char(self.hex_digits(2)?),
            'u' => ClassItem::Char(self.hex_digits(4)?),
            c => ClassItem::Char(c as u32),
        };
        Ok(item)
    }
}

enum ClassItem {
    Char(u32),
    Ranges(Vec<(u32, u32)>),
}

/// JS whitespace set for `\s`.
pub(crate) const SPACE_RANGES: &[(u32, u32)] = &[
    (0x09, 0x0D),
    (0x20, 0x20),
    (0xA0, 0xA0),
    (0x1680, 0x1680),
    (0x2000, 0x200A),
    (0x2028, 0x2029),
    (0x202F, 0x202F),
    (0x205F, 0x205F),
    (0x3000, 0x3000),
    (0xFEFF, 0xFEFF),
];

#[cfg(test)]
mod tests {
    use super::super::Regex;
    use super::*;

    fn compile_ok(pattern: &str) -> Regex {
        Regex::compile(pattern, "").unwrap_or_else(|e| panic!("{}: {}", pattern, e))
    }

    #[test]
    fn test_literal_sequence() {
        let re = compile_ok("abc");
        // SaveStart, a, b, c, SaveEnd, Match
        assert_eq!(re.program.len(), 6);
        assert!(matches!(re.program[1], RegexOp::Char(97)));
    }

    #[test]
    fn test_group_numbering() {
        let re = compile_ok("(a)(b(c))");
        assert_eq!(re.capture_count, 4);
    }

    #[test]
    fn test_named_groups() {
        let re = compile_ok("(?<year>\\d{4})-(?<month>\\d{2})");
        assert_eq!(
            re.named_groups,
            vec![("year".to_string(), 1), ("month".to_string(), 2)]
        );
        assert!(Regex::compile("(?<a>x)(?<a>y)", "").is_err());
    }

    #[test]
    fn test_empty_body_quantifier_gets_guard() {
        let re = compile_ok("(a*)*");
        assert!(re
            .program
            .iter()
            .any(|op| matches!(op, RegexOp::CheckAdvance(_))));
        assert!(re.register_count >= 1);
    }

    #[test]
    fn test_plain_star_has_no_guard() {
        let re = compile_ok("a*");
        assert!(!re
            .program
            .iter()
            .any(|op| matches!(op, RegexOp::CheckAdvance(_))));
    }

    #[test]
    fn test_braced_expansion() {
        let re = compile_ok("a{3}");
        let chars = re
            .program
            .iter()
            .filter(|op| matches!(op, RegexOp::Char(97)))
            .count();
        assert_eq!(chars, 3);
    }

    #[test]
    fn test_literal_brace_when_not_quantifier() {
        let re = compile_ok("a{x}");
        assert!(re
            .program
            .iter()
            .any(|op| matches!(op, RegexOp::Char(123))));
    }

    #[test]
    fn test_invalid_patterns() {
        for pattern in ["(a", "a)", "[a", "a{2,1}", "*a", "(?<>x)", "\\k<nope>"] {
            assert!(Regex::compile(pattern, "").is_err(), "{}", pattern);
        }
    }

    #[test]
    fn test_class_parsing() {
        let re = compile_ok("[a-z0-9_-]");
        match &re.program[1] {
            RegexOp::Class { ranges, negated } => {
                assert!(!negated);
                assert!(ranges.contains(&('a' as u32, 'z' as u32)));
                assert!(ranges.contains(&('-' as u32, '-' as u32)));
            }
            other => panic!("expected class, got {:?}", other),
        }
    }
}
