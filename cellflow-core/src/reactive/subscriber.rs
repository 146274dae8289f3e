//! Subscriber types for the reactive system.
//!
//! An [`Observer`] is the set of callbacks a caller hands to `subscribe`.
//! Once registered it lives in a [`SubscriberRecord`], which also remembers
//! the last value delivered to that particular subscriber so equal values are
//! never delivered twice in a row.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use tracing::trace;

use crate::error::EvalError;

/// Unique identifier for a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl SubscriberId {
    /// Generate a new unique subscriber ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

type NextFn = Box<dyn FnMut(&Value)>;
type ErrorFn = Box<dyn FnMut(&EvalError)>;
type CompleteFn = Box<dyn FnOnce()>;

/// Callbacks for the three delivery channels.
///
/// Only `next` is required. An observer without an error callback ignores
/// errors and stays subscribed.
pub struct Observer {
    next: NextFn,
    error: Option<ErrorFn>,
    complete: Option<CompleteFn>,
}

impl Observer {
    /// Create an observer that receives values.
    pub fn new<F>(next: F) -> Self
    where
        F: FnMut(&Value) + 'static,
    {
        Self {
            next: Box::new(next),
            error: None,
            complete: None,
        }
    }

    /// Attach an error callback.
    pub fn on_error<F>(mut self, error: F) -> Self
    where
        F: FnMut(&EvalError) + 'static,
    {
        self.error = Some(Box::new(error));
        self
    }

    /// Attach a completion callback.
    pub fn on_complete<F>(mut self, complete: F) -> Self
    where
        F: FnOnce() + 'static,
    {
        self.complete = Some(Box::new(complete));
        self
    }
}

impl fmt::Debug for Observer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observer")
            .field("error", &self.error.is_some())
            .field("complete", &self.complete.is_some())
            .finish_non_exhaustive()
    }
}

/// A single delivery.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Signal {
    Next(Value),
    Error(EvalError),
    Complete,
}

/// A registered observer plus its delivery bookkeeping.
pub(crate) struct SubscriberRecord {
    id: SubscriberId,
    next: RefCell<NextFn>,
    error: RefCell<Option<ErrorFn>>,
    complete: RefCell<Option<CompleteFn>>,
    last: RefCell<Option<Value>>,
    closed: Cell<bool>,
}

impl SubscriberRecord {
    pub(crate) fn new(observer: Observer) -> Self {
        Self {
            id: SubscriberId::new(),
            next: RefCell::new(observer.next),
            error: RefCell::new(observer.error),
            complete: RefCell::new(observer.complete),
            last: RefCell::new(None),
            closed: Cell::new(false),
        }
    }

    pub(crate) fn id(&self) -> SubscriberId {
        self.id
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.get()
    }

    pub(crate) fn close(&self) {
        self.closed.set(true);
    }

    pub(crate) fn handles_errors(&self) -> bool {
        self.error.borrow().is_some()
    }

    /// Deliver a signal, honouring the closed flag and per-subscriber dedup.
    pub(crate) fn dispatch(&self, signal: &Signal) {
        if self.closed.get() {
            return;
        }
        match signal {
            Signal::Next(value) => {
                if self.last.borrow().as_ref() == Some(value) {
                    trace!(subscriber = ?self.id, "skipping duplicate delivery");
                    return;
                }
                *self.last.borrow_mut() = Some(value.clone());
                match self.next.try_borrow_mut() {
                    Ok(mut next) => next(value),
                    Err(_) => trace!(subscriber = ?self.id, "re-entrant delivery dropped"),
                }
            }
            Signal::Error(err) => {
                // Error is terminal for this subscriber, so the callback can be taken.
                let on_error = self.error.borrow_mut().take();
                if let Some(mut on_error) = on_error {
                    self.closed.set(true);
                    on_error(err);
                }
            }
            Signal::Complete => {
                self.closed.set(true);
                let complete = self.complete.borrow_mut().take();
                if let Some(complete) = complete {
                    complete();
                }
            }
        }
    }
}

/// Handle returned by `subscribe`.
///
/// Dropping the handle keeps the subscription alive; call
/// [`Subscription::unsubscribe`] to stop deliveries.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce()>>,
}

impl Subscription {
    /// Wrap a cancellation callback.
    pub fn new<F>(cancel: F) -> Self
    where
        F: FnOnce() + 'static,
    {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A subscription that has nothing to cancel.
    pub fn empty() -> Self {
        Self { cancel: None }
    }

    /// Stop deliveries. Calling this more than once is harmless.
    pub fn unsubscribe(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    /// Whether `unsubscribe` has already run (or there was nothing to cancel).
    pub fn is_closed(&self) -> bool {
        self.cancel.is_none()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("closed", &self.is_closed())
            .finish()
    }
}
