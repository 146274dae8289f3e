//! Scheduler Context
//!
//! Nodes need a [`Scheduler`] to coalesce their recomputation. Rather than a
//! hidden global, the scheduler is picked from a thread-local context stack:
//! code can enter a context for an explicit scheduler, and anything created
//! inside it uses that scheduler. Outside any context the thread's default
//! scheduler is used.
//!
//! Contexts nest; the innermost one wins.

use std::cell::{Cell, RefCell};

use super::scheduler::Scheduler;

thread_local! {
    static CONTEXT_STACK: RefCell<Vec<ContextEntry>> = const { RefCell::new(Vec::new()) };
    static DEFAULT_SCHEDULER: Scheduler = Scheduler::new();
    static NEXT_TOKEN: Cell<u64> = const { Cell::new(0) };
}

/// An entry in the context stack.
struct ContextEntry {
    token: u64,
    scheduler: Scheduler,
}

/// Guard that pops the context when dropped.
pub struct SchedulerContext {
    token: u64,
}

impl SchedulerContext {
    /// Make `scheduler` current until the returned guard is dropped.
    pub fn enter(scheduler: &Scheduler) -> Self {
        let token = NEXT_TOKEN.with(|next| {
            let token = next.get();
            next.set(token + 1);
            token
        });
        CONTEXT_STACK.with(|stack| {
            stack.borrow_mut().push(ContextEntry {
                token,
                scheduler: scheduler.clone(),
            });
        });

        Self { token }
    }

    /// Check if an explicit context is active.
    pub fn is_active() -> bool {
        CONTEXT_STACK.with(|stack| !stack.borrow().is_empty())
    }

    /// The scheduler new nodes should use on this thread.
    pub fn current() -> Scheduler {
        CONTEXT_STACK
            .with(|stack| stack.borrow().last().map(|entry| entry.scheduler.clone()))
            .unwrap_or_else(|| DEFAULT_SCHEDULER.with(Scheduler::clone))
    }
}

impl Drop for SchedulerContext {
    fn drop(&mut self) {
        CONTEXT_STACK.with(|stack| {
            let popped = stack.borrow_mut().pop();

            if let Some(entry) = popped {
                debug_assert_eq!(
                    entry.token, self.token,
                    "SchedulerContext dropped out of order"
                );
            }
        });
    }
}
