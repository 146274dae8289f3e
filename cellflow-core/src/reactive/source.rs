//! Reactive Sources
//!
//! [`ReactiveSource`] is the capability every push-based value provider
//! implements: nodes, and foreign sources such as [`PushSource`]. The engine
//! only ever talks to upstream providers through this trait.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::{Stream, StreamExt};
use indexmap::IndexMap;
use serde_json::Value;
use tracing::debug;

use super::scheduler::Scheduler;
use super::subscriber::{Observer, Signal, SubscriberId, SubscriberRecord, Subscription};
use crate::error::EvalError;

/// Something that pushes values to subscribers.
pub trait ReactiveSource {
    /// Stable identity, used for de-duplication and dependency listings.
    fn identity(&self) -> String;

    /// The latest value, if any has been produced.
    fn current_value(&self) -> Option<Value>;

    /// Register an observer.
    ///
    /// Implementations deliver their current value synchronously when they
    /// have one.
    fn subscribe(&self, observer: Observer) -> Subscription;
}

impl<S: ReactiveSource + ?Sized> ReactiveSource for Rc<S> {
    fn identity(&self) -> String {
        (**self).identity()
    }

    fn current_value(&self) -> Option<Value> {
        (**self).current_value()
    }

    fn subscribe(&self, observer: Observer) -> Subscription {
        (**self).subscribe(observer)
    }
}

/// A hand-driven external push-source.
///
/// Values are delivered synchronously to every observer, which makes it a
/// stand-in for event emitters, channels or sockets living outside the
/// engine.
#[derive(Clone)]
pub struct PushSource(Rc<PushInner>);

struct PushInner {
    identity: String,
    value: RefCell<Option<Value>>,
    finished: Cell<bool>,
    observers: RefCell<IndexMap<SubscriberId, Rc<SubscriberRecord>>>,
}

impl PushSource {
    /// Create a source with a generated identity.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self::named(format!("source-{}", COUNTER.fetch_add(1, Ordering::Relaxed)))
    }

    /// Create a source with an explicit identity.
    pub fn named(identity: impl Into<String>) -> Self {
        Self(Rc::new(PushInner {
            identity: identity.into(),
            value: RefCell::new(None),
            finished: Cell::new(false),
            observers: RefCell::new(IndexMap::new()),
        }))
    }

    /// Forward every item of `stream` into a new source.
    ///
    /// The stream is driven by `scheduler`; the source finishes when the
    /// stream ends.
    pub fn from_stream<S>(scheduler: &Scheduler, stream: S) -> Self
    where
        S: Stream<Item = Result<Value, EvalError>> + 'static,
    {
        let source = Self::new();
        let weak = Rc::downgrade(&source.0);
        scheduler.spawn(async move {
            let mut stream = Box::pin(stream);
            while let Some(item) = stream.next().await {
                let Some(inner) = weak.upgrade() else { return };
                let source = PushSource(inner);
                match item {
                    Ok(value) => source.push(value),
                    Err(err) => source.fail(err),
                }
            }
            if let Some(inner) = weak.upgrade() {
                PushSource(inner).finish();
            }
        });
        source
    }

    /// Emit a value.
    pub fn push(&self, value: impl Into<Value>) {
        if self.0.finished.get() {
            return;
        }
        let value = value.into();
        *self.0.value.borrow_mut() = Some(value.clone());
        self.broadcast(&Signal::Next(value));
    }

    /// Emit an error.
    pub fn fail(&self, err: impl Into<EvalError>) {
        if self.0.finished.get() {
            return;
        }
        self.broadcast(&Signal::Error(err.into()));
    }

    /// Complete the source. Later pushes are ignored.
    pub fn finish(&self) {
        if self.0.finished.replace(true) {
            return;
        }
        debug!(source = %self.0.identity, "source finished");
        self.broadcast(&Signal::Complete);
        self.0.observers.borrow_mut().clear();
    }

    /// Number of registered observers.
    pub fn observer_count(&self) -> usize {
        self.0
            .observers
            .borrow()
            .values()
            .filter(|r| !r.is_closed())
            .count()
    }

    fn broadcast(&self, signal: &Signal) {
        let records: Vec<_> = self.0.observers.borrow().values().cloned().collect();
        for record in records {
            record.dispatch(signal);
        }
    }
}

impl Default for PushSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ReactiveSource for PushSource {
    fn identity(&self) -> String {
        self.0.identity.clone()
    }

    fn current_value(&self) -> Option<Value> {
        self.0.value.borrow().clone()
    }

    fn subscribe(&self, observer: Observer) -> Subscription {
        let record = Rc::new(SubscriberRecord::new(observer));
        if self.0.finished.get() {
            record.dispatch(&Signal::Complete);
            return Subscription::empty();
        }
        let id = record.id();
        self.0.observers.borrow_mut().insert(id, Rc::clone(&record));

        let current = self.current_value();
        if let Some(value) = current {
            record.dispatch(&Signal::Next(value));
        }

        let weak: Weak<PushInner> = Rc::downgrade(&self.0);
        Subscription::new(move || {
            record.close();
            if let Some(inner) = weak.upgrade() {
                inner.observers.borrow_mut().shift_remove(&id);
            }
        })
    }
}

impl fmt::Debug for PushSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushSource")
            .field("identity", &self.0.identity)
            .field("value", &self.0.value.borrow())
            .field("finished", &self.0.finished.get())
            .finish()
    }
}
