//! Regular expression engine
//!
//! Patterns compile to a small instruction set executed by a backtracking
//! matcher with an explicit, bounded backtrack stack. Quantifiers whose
//! bodies can match empty get zero-advance guard registers so patterns
//! like `(a*)*` terminate. The matcher polls a caller-supplied callback
//! on the same contract as the VM's budget.

mod compiler;
mod matcher;

pub use matcher::{Match, MatchConfig, MatchError};

use bitflags::bitflags;

bitflags! {
    /// Regex flag bits (`g i m s u y`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Flags: u8 {
        const GLOBAL      = 1 << 0;
        const IGNORE_CASE = 1 << 1;
        const MULTILINE   = 1 << 2;
        const DOT_ALL     = 1 << 3;
        const UNICODE     = 1 << 4;
        const STICKY      = 1 << 5;
    }
}

impl Flags {
    /// Parse a flag string, rejecting unknown or duplicate flags.
    pub fn parse(s: &str) -> Result<Flags, RegexError> {
        let mut flags = Flags::empty();
        for c in s.chars() {
            let bit = match c {
                'g' => Flags::GLOBAL,
                'i' => Flags::IGNORE_CASE,
                'm' => Flags::MULTILINE,
                's' => Flags::DOT_ALL,
                'u' => Flags::UNICODE,
                'y' => Flags::STICKY,
                _ => {
                    return Err(RegexError {
                        message: format!("invalid regular expression flag '{}'", c),
                    })
                }
            };
            if flags.contains(bit) {
                return Err(RegexError {
                    message: format!("duplicate regular expression flag '{}'", c),
                });
            }
            flags |= bit;
        }
        Ok(flags)
    }
}

/// Pattern compilation error.
#[derive(Debug, Clone)]
pub struct RegexError {
    pub message: String,
}

impl std::fmt::Display for RegexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for RegexError {}

/// One regex instruction. Jump targets are absolute program offsets.
#[derive(Debug, Clone)]
pub enum RegexOp {
    /// Literal code point
    Char(u32),
    /// `.` without the `s` flag (line terminators excluded)
    Dot,
    /// `.` with the `s` flag
    AnyChar,
    /// Character class
    Class {
        ranges: Box<[(u32, u32)]>,
        negated: bool,
    },
    Digit,
    NotDigit,
    Word,
    NotWord,
    Space,
    NotSpace,
    LineStart,
    LineStartMulti,
    LineEnd,
    LineEndMulti,
    WordBoundary,
    NotWordBoundary,
    Jump(u32),
    /// Try the following instruction first; the operand on backtrack
    SplitFirst(u32),
    /// Try the operand first; the following instruction on backtrack
    SplitNext(u32),
    SaveStart(u16),
    SaveEnd(u16),
    Backref(u16),
    /// Record the string position in a guard register
    SetPos(u8),
    /// Fail this path when the position has not advanced since `SetPos`
    CheckAdvance(u8),
    /// Lookaround: the sub-program runs from the next instruction up to
    /// the `LookEnd` just before `end`
    Look {
        negative: bool,
        behind: bool,
        end: u32,
    },
    LookEnd,
    Match,
}

/// A compiled regular expression.
#[derive(Debug)]
pub struct Regex {
    /// Pattern source, verbatim
    pub source: String,
    /// Flag string, verbatim
    pub flag_str: String,
    pub flags: Flags,
    pub(crate) program: Vec<RegexOp>,
    /// Number of capture slots, the whole match included
    pub capture_count: usize,
    /// Named-group table: name to capture index
    pub named_groups: Vec<(String, usize)>,
    pub(crate) register_count: usize,
}

impl Regex {
    /// Compile a pattern with the given flag string.
    pub fn compile(pattern: &str, flags: &str) -> Result<Regex, RegexError> {
        let parsed = Flags::parse(flags)?;
        compiler::compile(pattern, parsed).map(|mut regex| {
            regex.flag_str = flags.to_string();
            regex
        })
    }

    /// Search for a match at or after `start` (exactly at `start` when the
    /// pattern is sticky).
    pub fn exec(
        &self,
        input: &[u16],
        start: usize,
        config: &MatchConfig<'_>,
    ) -> Result<Option<Match>, MatchError> {
        matcher::exec(self, input, start, config)
    }

    /// Approximate heap footprint, for the memory budget.
    pub fn byte_size(&self) -> usize {
        std::mem::size_of::<Regex>()
            + self.source.len()
            + self.program.len() * std::mem::size_of::<RegexOp>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_parsing() {
        let f = Flags::parse("gi").unwrap();
        assert!(f.contains(Flags::GLOBAL));
        assert!(f.contains(Flags::IGNORE_CASE));
        assert!(!f.contains(Flags::STICKY));
        assert!(Flags::parse("x").is_err());
        assert!(Flags::parse("gg").is_err());
    }

    #[test]
    fn test_compile_preserves_source() {
        let re = Regex::compile("a+b", "gi").unwrap();
        assert_eq!(re.source, "a+b");
        assert_eq!(re.flag_str, "gi");
    }
}
