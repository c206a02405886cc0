//! Execution budgets
//!
//! Two cooperative limits protect the host: a wall-clock deadline checked
//! every `poll_interval` instructions (together with an optional host poll
//! callback), and a running byte budget decremented on each allocation.
//! Both raise uncatchable errors.

use crate::error::VmError;
use std::cell::Cell;
use std::rc::Rc;
use std::time::Instant;

/// Host poll callback; a truthy return aborts execution.
pub type PollFn = dyn Fn() -> bool;

/// Memory accounting shared between a `Context` and its evaluations.
///
/// Usage is approximate: each object, array, string, closure cell and
/// compiled function charges its estimated footprint when created.
#[derive(Clone)]
pub struct MemoryBudget {
    limit: Option<usize>,
    used: Rc<Cell<usize>>,
}

impl MemoryBudget {
    pub fn new(limit: Option<usize>) -> Self {
        MemoryBudget {
            limit,
            used: Rc::new(Cell::new(0)),
        }
    }

    /// Account for `bytes` of new allocation.
    pub fn charge(&self, bytes: usize) -> Result<(), VmError> {
        let used = self.used.get().saturating_add(bytes);
        self.used.set(used);
        match self.limit {
            Some(limit) if used > limit => Err(VmError::MemoryLimit),
            _ => Ok(()),
        }
    }

    /// Return `bytes` to the budget (explicit frees, e.g. array truncation).
    pub fn release(&self, bytes: usize) {
        self.used.set(self.used.get().saturating_sub(bytes));
    }

    /// Bytes currently accounted.
    pub fn used(&self) -> usize {
        self.used.get()
    }
}

/// A read-only view of the time limit, for the regex matcher's poll hook.
#[derive(Clone)]
pub struct TimeGuard {
    deadline: Option<Instant>,
    poll: Option<Rc<PollFn>>,
}

impl TimeGuard {
    /// Whether execution should abort now.
    pub fn should_abort(&self) -> bool {
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return true;
            }
        }
        if let Some(poll) = &self.poll {
            if poll() {
                return true;
            }
        }
        false
    }
}

/// Per-evaluation execution budget.
pub struct Budget {
    /// Absolute deadline, from the configured time limit
    deadline: Option<Instant>,
    /// Optional host poll callback
    poll: Option<Rc<PollFn>>,
    /// Instructions between polls
    poll_interval: u32,
    counter: u32,
    /// Shared byte accounting
    pub memory: MemoryBudget,
}

impl Budget {
    pub fn new(
        deadline: Option<Instant>,
        poll: Option<Rc<PollFn>>,
        poll_interval: u32,
        memory: MemoryBudget,
    ) -> Self {
        Budget {
            deadline,
            poll,
            poll_interval: poll_interval.max(1),
            counter: 0,
            memory,
        }
    }

    /// Per-instruction bookkeeping; polls every `poll_interval` ticks.
    #[inline]
    pub fn tick(&mut self) -> Result<(), VmError> {
        self.counter += 1;
        if self.counter >= self.poll_interval {
            self.counter = 0;
            self.poll_now()?;
        }
        Ok(())
    }

    /// Check the deadline and the host callback immediately.
    pub fn poll_now(&self) -> Result<(), VmError> {
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(VmError::TimeLimit);
            }
        }
        if let Some(poll) = &self.poll {
            if poll() {
                return Err(VmError::TimeLimit);
            }
        }
        Ok(())
    }

    /// Snapshot the time limit for the regex matcher.
    pub fn time_guard(&self) -> TimeGuard {
        TimeGuard {
            deadline: self.deadline,
            poll: self.poll.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_memory_budget() {
        let mem = MemoryBudget::new(Some(100));
        assert!(mem.charge(60).is_ok());
        assert!(mem.charge(60).is_err());
        mem.release(60);
        assert_eq!(mem.used(), 60);
        assert!(mem.charge(30).is_ok());
    }

    #[test]
    fn test_unlimited_memory() {
        let mem = MemoryBudget::new(None);
        assert!(mem.charge(usize::MAX / 2).is_ok());
    }

    #[test]
    fn test_deadline() {
        let mut budget = Budget::new(
            Some(Instant::now() - Duration::from_millis(1)),
            None,
            1,
            MemoryBudget::new(None),
        );
        assert!(matches!(budget.tick(), Err(VmError::TimeLimit)));
    }

    #[test]
    fn test_poll_callback_aborts() {
        let budget = Budget::new(None, Some(Rc::new(|| true)), 100, MemoryBudget::new(None));
        assert!(matches!(budget.poll_now(), Err(VmError::TimeLimit)));
        assert!(budget.time_guard().should_abort());
    }

    #[test]
    fn test_tick_polls_at_interval() {
        let mut budget = Budget::new(None, Some(Rc::new(|| true)), 3, MemoryBudget::new(None));
        assert!(budget.tick().is_ok());
        assert!(budget.tick().is_ok());
        assert!(budget.tick().is_err());
    }
}
