//! Update Scheduler
//!
//! The scheduler coalesces recomputation. When a node's input changes the
//! node is not evaluated on the spot; it is added to a pending set and a
//! single deferred drain is queued. When the drain runs, every pending node
//! is evaluated once. Nodes scheduled while the drain is running join the
//! same drain, so chains of dependents settle together.
//!
//! # Deferred Work
//!
//! The scheduler is also the engine's deferred execution primitive:
//!
//! - [`Scheduler::defer`] queues a unit of work to run after the current
//!   synchronous work. Deliveries to subscribers and drains use it.
//! - [`Scheduler::spawn`] registers a future, used for stream and future
//!   evaluation results.
//!
//! Nothing runs until the host drives the scheduler with [`Scheduler::flush`]
//! (synchronous, runs until idle or blocked on async work) or
//! [`Scheduler::settle`] (async, runs until all work has finished).
//!
//! A synchronous flush evaluates at most `flush_limit` nodes. Work beyond
//! that stays pending for the next flush, and [`Scheduler::try_flush`]
//! reports it as an error.
//!
//! # Batching
//!
//! [`Scheduler::batch`] suppresses drains while a closure runs, then performs
//! exactly one drain for everything the closure touched.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::future::{poll_fn, Future};
use std::rc::Rc;
use std::task::{Context, Poll};

use futures_util::future::LocalBoxFuture;
use futures_util::stream::FuturesUnordered;
use futures_util::task::noop_waker_ref;
use futures_util::{FutureExt, StreamExt};
use indexmap::IndexMap;
use tracing::{debug, trace, warn};

use super::context::SchedulerContext;
use super::node::Node;
use crate::config::SchedulerConfig;
use crate::error::{Error, Result};

type Task = Box<dyn FnOnce()>;
type Job = LocalBoxFuture<'static, ()>;

/// Coalescing update scheduler and deferred work queue.
///
/// Cloning is cheap; clones share the same queues.
#[derive(Clone)]
pub struct Scheduler(Rc<SchedulerInner>);

struct SchedulerInner {
    config: SchedulerConfig,

    /// Nodes awaiting recomputation, keyed by node serial.
    pending: RefCell<IndexMap<u64, Node>>,

    /// Whether a drain is already queued.
    drain_queued: Cell<bool>,

    /// Nesting depth of `batch` calls.
    batch_depth: Cell<usize>,

    /// Deferred units, run in FIFO order.
    tasks: RefCell<VecDeque<Task>>,

    /// Futures registered since the last poll.
    spawned: RefCell<Vec<Job>>,

    /// Futures being driven.
    in_flight: RefCell<FuturesUnordered<Job>>,

    /// Bumped whenever a task runs or a future finishes.
    progress: Cell<u64>,

    /// Evaluations left in the running flush. `None` outside a flush.
    budget: Cell<Option<usize>>,

    /// Set when a drain stopped because the budget ran out.
    exhausted: Cell<bool>,
}

impl Scheduler {
    /// Create a scheduler with default settings.
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    /// Create a scheduler with explicit settings.
    pub fn with_config(config: SchedulerConfig) -> Self {
        Self(Rc::new(SchedulerInner {
            config,
            pending: RefCell::new(IndexMap::new()),
            drain_queued: Cell::new(false),
            batch_depth: Cell::new(0),
            tasks: RefCell::new(VecDeque::new()),
            spawned: RefCell::new(Vec::new()),
            in_flight: RefCell::new(FuturesUnordered::new()),
            progress: Cell::new(0),
            budget: Cell::new(None),
            exhausted: Cell::new(false),
        }))
    }

    /// The scheduler of the innermost [`SchedulerContext`], or the thread default.
    pub fn current() -> Self {
        SchedulerContext::current()
    }

    /// Whether two handles refer to the same scheduler.
    pub fn ptr_eq(&self, other: &Scheduler) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.0.config
    }

    /// Queue `node` for recomputation.
    pub fn schedule_update(&self, node: &Node) {
        self.0
            .pending
            .borrow_mut()
            .entry(node.serial())
            .or_insert_with(|| node.clone());
        trace!(node = %node.identity(), "update scheduled");

        if self.is_batching() {
            return;
        }
        self.queue_drain();
    }

    fn queue_drain(&self) {
        if self.0.drain_queued.replace(true) {
            return;
        }
        let weak = Rc::downgrade(&self.0);
        self.defer(move || {
            if let Some(inner) = weak.upgrade() {
                Scheduler(inner).run_queued_drain();
            }
        });
    }

    /// Run `work` with drains suppressed, then drain once.
    ///
    /// Deliveries queued inside the batch are run before the batch closes so
    /// the dependents they schedule are part of the single drain.
    pub fn batch<R>(&self, work: impl FnOnce() -> R) -> R {
        let outermost = !self.is_batching();
        let result = {
            let _guard = BatchGuard::enter(self);
            let result = work();
            if outermost {
                self.run_tasks();
            }
            result
        };
        if outermost {
            self.drain();
        }
        result
    }

    /// Whether a batch is in progress.
    pub fn is_batching(&self) -> bool {
        self.0.batch_depth.get() > 0
    }

    /// Number of nodes waiting for a drain.
    pub fn pending_len(&self) -> usize {
        self.0.pending.borrow().len()
    }

    /// Whether `node` is waiting for a drain.
    pub fn is_pending(&self, node: &Node) -> bool {
        self.0.pending.borrow().contains_key(&node.serial())
    }

    /// Queue a unit of work to run after the current synchronous work.
    pub fn defer<F>(&self, task: F)
    where
        F: FnOnce() + 'static,
    {
        self.0.tasks.borrow_mut().push_back(Box::new(task));
    }

    /// Register a future to be driven by `flush`/`settle`.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + 'static,
    {
        self.0.spawned.borrow_mut().push(future.boxed_local());
    }

    /// Whether nothing is queued, pending or in flight.
    pub fn is_idle(&self) -> bool {
        !self.has_queued_work()
            && self.0.in_flight.borrow().is_empty()
            && self.0.pending.borrow().is_empty()
    }

    /// Run deferred work and ready async work until nothing more can run
    /// without waiting.
    ///
    /// Stopping at the flush limit is logged; see [`Scheduler::try_flush`].
    pub fn flush(&self) {
        if let Err(err) = self.try_flush() {
            warn!(%err, "flush stopped early");
        }
    }

    /// Like [`Scheduler::flush`], failing with [`Error::FlushLimit`] when more
    /// than `flush_limit` evaluations were needed. The remaining nodes stay
    /// pending and a later flush picks them up.
    pub fn try_flush(&self) -> Result<()> {
        let limit = self.0.config.flush_limit;
        let outer = self.0.budget.replace(Some(limit));
        self.0.exhausted.set(false);
        if !self.is_batching() && !self.0.pending.borrow().is_empty() {
            self.queue_drain();
        }

        let mut cx = Context::from_waker(noop_waker_ref());
        loop {
            let before = self.0.progress.get();
            if self.poll_work(&mut cx).is_ready() || self.0.progress.get() == before {
                break;
            }
        }

        self.0.budget.set(outer);
        if self.0.exhausted.replace(false) {
            return Err(Error::FlushLimit {
                limit,
                pending: self.pending_len(),
            });
        }
        Ok(())
    }

    /// Run until every deferred unit and every in-flight future has finished.
    ///
    /// Never resolves while a spawned stream is still open.
    pub async fn settle(&self) {
        poll_fn(|cx| self.poll_work(cx)).await
    }

    fn has_queued_work(&self) -> bool {
        !self.0.tasks.borrow().is_empty() || !self.0.spawned.borrow().is_empty()
    }

    fn run_tasks(&self) {
        loop {
            let task = self.0.tasks.borrow_mut().pop_front();
            let Some(task) = task else { break };
            task();
            self.0.progress.set(self.0.progress.get() + 1);
        }
    }

    fn poll_work(&self, cx: &mut Context<'_>) -> Poll<()> {
        loop {
            self.run_tasks();

            let polled = {
                let mut in_flight = self.0.in_flight.borrow_mut();
                in_flight.extend(self.0.spawned.borrow_mut().drain(..));
                in_flight.poll_next_unpin(cx)
            };

            match polled {
                Poll::Ready(Some(())) => {
                    self.0.progress.set(self.0.progress.get() + 1);
                }
                _ if self.has_queued_work() => {}
                Poll::Ready(None) => return Poll::Ready(()),
                Poll::Pending => return Poll::Pending,
            }
        }
    }

    fn run_queued_drain(&self) {
        if self.is_batching() {
            // The enclosing batch drains when it closes.
            self.0.drain_queued.set(false);
            return;
        }
        self.drain();
    }

    /// Evaluate pending nodes until the set is empty or the flush budget
    /// runs out.
    fn drain(&self) {
        let mut evaluated = 0usize;

        loop {
            if self.0.budget.get() == Some(0) {
                self.0.exhausted.set(true);
                break;
            }
            let next = self.0.pending.borrow_mut().shift_remove_index(0);
            let Some((_, node)) = next else { break };

            node.evaluate();
            evaluated += 1;
            if let Some(left) = self.0.budget.get() {
                self.0.budget.set(Some(left.saturating_sub(1)));
            }
        }

        self.0.drain_queued.set(false);
        if evaluated > 0 {
            debug!(evaluated, "drain finished");
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("pending", &self.pending_len())
            .field("batching", &self.is_batching())
            .field("queued_tasks", &self.0.tasks.borrow().len())
            .field("in_flight", &self.0.in_flight.borrow().len())
            .finish()
    }
}

/// Restores the batch depth even if the batched closure panics.
struct BatchGuard<'a> {
    scheduler: &'a Scheduler,
}

impl<'a> BatchGuard<'a> {
    fn enter(scheduler: &'a Scheduler) -> Self {
        let depth = &scheduler.0.batch_depth;
        depth.set(depth.get() + 1);
        Self { scheduler }
    }
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        let depth = &self.scheduler.0.batch_depth;
        depth.set(depth.get() - 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deferred_tasks_run_in_order_on_flush() {
        let scheduler = Scheduler::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        for i in 0..3 {
            let log = log.clone();
            scheduler.defer(move || log.borrow_mut().push(i));
        }

        assert!(log.borrow().is_empty());
        scheduler.flush();
        assert_eq!(*log.borrow(), vec![0, 1, 2]);
        assert!(scheduler.is_idle());
    }

    #[test]
    fn tasks_deferred_during_flush_also_run() {
        let scheduler = Scheduler::new();
        let ran = Rc::new(Cell::new(false));
        let (inner, flag) = (scheduler.clone(), ran.clone());
        scheduler.defer(move || inner.defer(move || flag.set(true)));

        scheduler.flush();
        assert!(ran.get());
    }

    #[test]
    fn scheduled_node_is_evaluated_once_per_drain() {
        let scheduler = Scheduler::new();
        let _ctx = SchedulerContext::enter(&scheduler);
        let calls = Rc::new(Cell::new(0));
        let counter = calls.clone();
        let node = Node::computed(json!(null), move |_| {
            counter.set(counter.get() + 1);
            json!(counter.get())
        });
        assert_eq!(calls.get(), 1);

        scheduler.schedule_update(&node);
        scheduler.schedule_update(&node);
        scheduler.schedule_update(&node);
        assert_eq!(scheduler.pending_len(), 1);

        scheduler.flush();
        assert_eq!(calls.get(), 2);
        assert_eq!(scheduler.pending_len(), 0);
    }

    #[test]
    fn batch_defers_until_closure_returns() {
        let scheduler = Scheduler::new();
        let _ctx = SchedulerContext::enter(&scheduler);
        let calls = Rc::new(Cell::new(0));
        let counter = calls.clone();
        let node = Node::computed(json!(null), move |_| {
            counter.set(counter.get() + 1);
            json!(null)
        });

        scheduler.batch(|| {
            scheduler.schedule_update(&node);
            scheduler.batch(|| scheduler.schedule_update(&node));
            assert!(scheduler.is_batching());
            assert_eq!(calls.get(), 1);
        });

        assert!(!scheduler.is_batching());
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn flush_limit_keeps_remaining_work_pending() {
        let scheduler = Scheduler::with_config(SchedulerConfig { flush_limit: 10 });
        let _ctx = SchedulerContext::enter(&scheduler);
        let calls = Rc::new(Cell::new(0));
        let nodes: Vec<Node> = (0..15)
            .map(|_| {
                let counter = calls.clone();
                Node::computed(json!(null), move |_| {
                    counter.set(counter.get() + 1);
                    json!(counter.get())
                })
            })
            .collect();
        calls.set(0);

        for node in &nodes {
            scheduler.schedule_update(node);
        }
        let err = scheduler.try_flush().unwrap_err();
        assert_eq!(err, Error::FlushLimit { limit: 10, pending: 5 });
        assert_eq!(calls.get(), 10);
        assert_eq!(scheduler.pending_len(), 5);

        scheduler.try_flush().unwrap();
        assert_eq!(calls.get(), 15);
        assert!(scheduler.is_idle());
    }

    #[test]
    fn flush_limit_stops_self_rescheduling_node() {
        let scheduler = Scheduler::with_config(SchedulerConfig { flush_limit: 10 });
        let _ctx = SchedulerContext::enter(&scheduler);
        let calls = Rc::new(Cell::new(0));
        let counter = calls.clone();
        let node = Node::computed(json!(null), move |_| {
            counter.set(counter.get() + 1);
            json!(counter.get())
        });
        node.add_dependency(&node).unwrap();
        let before = calls.get();

        assert!(matches!(
            scheduler.try_flush(),
            Err(Error::FlushLimit { limit: 10, .. })
        ));
        assert_eq!(calls.get(), before + 10);
        assert!(scheduler.is_pending(&node));

        scheduler.flush();
        assert_eq!(calls.get(), before + 20);
    }

    #[test]
    fn spawned_futures_are_driven() {
        let scheduler = Scheduler::new();
        let done = Rc::new(Cell::new(false));
        let flag = done.clone();
        scheduler.spawn(async move { flag.set(true) });

        assert!(!scheduler.is_idle());
        scheduler.flush();
        assert!(done.get());
        assert!(scheduler.is_idle());
    }

    #[tokio::test]
    async fn settle_waits_for_async_work() {
        let scheduler = Scheduler::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<u32>();
        let got = Rc::new(Cell::new(0));
        let sink = got.clone();
        scheduler.spawn(async move {
            sink.set(rx.await.unwrap_or_default());
        });

        scheduler.flush();
        assert_eq!(got.get(), 0);

        tx.send(7).unwrap();
        scheduler.settle().await;
        assert_eq!(got.get(), 7);
    }
}
