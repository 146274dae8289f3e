//! Node Implementation
//!
//! A [`Node`] is the unit of the engine: a cell holding a value. A node is
//! either *static* (its value is supplied with [`Node::set`]) or *computed*
//! (its value is produced by an evaluator over a dependency structure).
//!
//! # How Computed Nodes Work
//!
//! 1. On construction the dependency declaration is normalized, the node subscribes
//!    to every reactive leaf, and the evaluator runs once.
//!
//! 2. When a dependency delivers a new value, the subscription callback asks
//!    the [`Scheduler`] to recompute the node. The scheduler coalesces any
//!    number of such requests into one evaluation per drain.
//!
//! 3. Evaluation reads a same-shaped snapshot of the dependency values and
//!    hands it to the evaluator as a single [`Inputs`] argument. A plain
//!    result is compared with the previous one and delivered only if it
//!    differs. Stream and future results are driven by the scheduler.
//!
//! # Subscriptions
//!
//! Deliveries to subscribers are deferred units on the scheduler, and each
//! subscriber skips values equal to the last one it received. Upstream nodes
//! only hold weak references to their dependents, so dropping the last handle
//! to a node releases it even while it is subscribed to its inputs.

use std::cell::{OnceCell, RefCell};
use std::fmt;
use std::future::Future;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::future::LocalBoxFuture;
use futures_util::stream::{abortable, AbortHandle, LocalBoxStream};
use futures_util::{FutureExt, Stream, StreamExt};
use indexmap::IndexMap;
use serde_json::Value;
use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use super::args::{add_entries, remove_entries, DepArgs, DepTarget};
use super::deps::{extract_sources, normalize, read_values, Dep, Deps, Inputs, SourceLeaf};
use super::scheduler::Scheduler;
use super::source::ReactiveSource;
use super::subscriber::{Observer, Signal, SubscriberId, SubscriberRecord, Subscription};
use crate::error::{Error, EvalError, Result};

/// Counter for internal node serials.
static NODE_SERIAL: AtomicU64 = AtomicU64::new(0);

/// Evaluator function stored on computed nodes.
pub type Evaluator = Rc<dyn Fn(&Inputs) -> std::result::Result<Evaluation, EvalError>>;

/// What an evaluator produced.
pub enum Evaluation {
    /// A value available right away.
    Value(Value),
    /// A stream of values; each emission is delivered as it arrives.
    Stream(LocalBoxStream<'static, std::result::Result<Value, EvalError>>),
    /// A value available later.
    Future(LocalBoxFuture<'static, std::result::Result<Value, EvalError>>),
}

impl Evaluation {
    /// Box a stream result.
    pub fn stream<S>(stream: S) -> Self
    where
        S: Stream<Item = std::result::Result<Value, EvalError>> + 'static,
    {
        Evaluation::Stream(stream.boxed_local())
    }

    /// Box a future result.
    pub fn future<F>(future: F) -> Self
    where
        F: Future<Output = std::result::Result<Value, EvalError>> + 'static,
    {
        Evaluation::Future(future.boxed_local())
    }
}

impl From<Value> for Evaluation {
    fn from(value: Value) -> Self {
        Evaluation::Value(value)
    }
}

impl fmt::Debug for Evaluation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Evaluation::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Evaluation::Stream(_) => f.write_str("Stream"),
            Evaluation::Future(_) => f.write_str("Future"),
        }
    }
}

/// Return types accepted from evaluator closures.
pub trait IntoEvaluation {
    fn into_evaluation(self) -> std::result::Result<Evaluation, EvalError>;
}

impl IntoEvaluation for Value {
    fn into_evaluation(self) -> std::result::Result<Evaluation, EvalError> {
        Ok(Evaluation::Value(self))
    }
}

impl IntoEvaluation for Evaluation {
    fn into_evaluation(self) -> std::result::Result<Evaluation, EvalError> {
        Ok(self)
    }
}

impl IntoEvaluation for std::result::Result<Value, EvalError> {
    fn into_evaluation(self) -> std::result::Result<Evaluation, EvalError> {
        self.map(Evaluation::Value)
    }
}

impl IntoEvaluation for std::result::Result<Evaluation, EvalError> {
    fn into_evaluation(self) -> std::result::Result<Evaluation, EvalError> {
        self
    }
}

fn boxed_evaluator<F, R>(f: F) -> Evaluator
where
    F: Fn(&Inputs) -> R + 'static,
    R: IntoEvaluation,
{
    Rc::new(move |inputs: &Inputs| f(inputs).into_evaluation())
}

/// Whether a node has an evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Value supplied directly.
    Static,
    /// Value derived by an evaluator.
    Computed,
}

/// The first construction argument.
pub enum NodeInit {
    Value(Value),
    Evaluator(Evaluator),
    Source(Rc<dyn ReactiveSource>),
}

impl NodeInit {
    pub fn evaluator<F, R>(f: F) -> Self
    where
        F: Fn(&Inputs) -> R + 'static,
        R: IntoEvaluation,
    {
        NodeInit::Evaluator(boxed_evaluator(f))
    }
}

impl From<Value> for NodeInit {
    fn from(value: Value) -> Self {
        NodeInit::Value(value)
    }
}

/// Builder for nodes with an explicit identity or scheduler.
#[derive(Debug, Default)]
pub struct NodeBuilder {
    id: Option<String>,
    scheduler: Option<Scheduler>,
}

impl NodeBuilder {
    /// Use `id` as the node's identity instead of a generated one.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Schedule the node on `scheduler` instead of the current one.
    pub fn scheduler(mut self, scheduler: &Scheduler) -> Self {
        self.scheduler = Some(scheduler.clone());
        self
    }

    /// Validate the argument combination and build the node.
    pub fn create(self, init: NodeInit, deps: Option<Dep>) -> Result<Node> {
        match (init, deps) {
            (NodeInit::Evaluator(_), None) => Err(Error::MissingDependencies),
            (NodeInit::Value(_) | NodeInit::Source(_), Some(_)) => {
                Err(Error::UnexpectedDependencies)
            }
            (NodeInit::Evaluator(evaluator), Some(deps)) => Ok(self.build_computed(evaluator, deps)),
            (NodeInit::Value(value), None) => Ok(self.value(value)),
            (NodeInit::Source(source), None) => {
                let node = self.alloc(None);
                node.attach_source(source);
                Ok(node)
            }
        }
    }

    /// Build a static node.
    pub fn value(self, value: impl Into<Value>) -> Node {
        let node = self.alloc(None);
        node.0.state.borrow_mut().value = Some(value.into());
        node
    }

    /// Build a computed node and evaluate it once.
    pub fn computed<F, R>(self, deps: impl Into<Dep>, f: F) -> Node
    where
        F: Fn(&Inputs) -> R + 'static,
        R: IntoEvaluation,
    {
        self.build_computed(boxed_evaluator(f), deps.into())
    }

    /// Build a static node fed by `source`.
    pub fn source(self, source: impl ReactiveSource + 'static) -> Node {
        let node = self.alloc(None);
        node.attach_source(Rc::new(source));
        node
    }

    fn build_computed(self, evaluator: Evaluator, deps: Dep) -> Node {
        let node = self.alloc(Some(evaluator));
        node.0.state.borrow_mut().deps = normalize(deps);
        node.wire();
        node.evaluate();
        node
    }

    fn alloc(self, evaluator: Option<Evaluator>) -> Node {
        let identity = OnceCell::new();
        if let Some(id) = self.id {
            let _ = identity.set(id);
        }
        Node(Rc::new(NodeInner {
            serial: NODE_SERIAL.fetch_add(1, Ordering::Relaxed),
            identity,
            scheduler: self.scheduler.unwrap_or_else(Scheduler::current),
            evaluator,
            state: RefCell::new(NodeState::default()),
        }))
    }
}

/// A reactive cell.
///
/// Cloning is cheap; clones are handles to the same node.
#[derive(Clone)]
pub struct Node(Rc<NodeInner>);

struct NodeInner {
    serial: u64,
    identity: OnceCell<String>,
    scheduler: Scheduler,
    evaluator: Option<Evaluator>,
    state: RefCell<NodeState>,
}

#[derive(Default)]
struct NodeState {
    /// Last produced value.
    value: Option<Value>,

    /// Last plain evaluator result, for deep-equality dedup.
    last_raw: Option<Value>,

    deps: Deps,

    /// One subscription per extracted dependency source.
    dep_subscriptions: SmallVec<[Subscription; 4]>,

    /// Whether dependency subscriptions are established.
    wired: bool,

    /// Set while subscribing to dependencies, to ignore their initial deliveries.
    wiring: bool,

    subscribers: IndexMap<SubscriberId, Rc<SubscriberRecord>>,

    error: Option<EvalError>,

    completed: bool,

    async_pending: bool,

    /// Bumped on each evaluation; async results from older evaluations are dropped.
    generation: u64,

    stream_abort: Option<AbortHandle>,

    /// Direct subscription of a static node to a push-source.
    source_subscription: Option<Subscription>,
}

/// An in-flight future result together with the evaluation that started it.
struct PendingResult {
    generation: u64,
    future: LocalBoxFuture<'static, std::result::Result<Value, EvalError>>,
}

impl Node {
    /// Start building a node.
    pub fn builder() -> NodeBuilder {
        NodeBuilder::default()
    }

    /// Create a node from a construction argument and optional dependency declaration.
    pub fn create(init: NodeInit, deps: Option<Dep>) -> Result<Node> {
        NodeBuilder::default().create(init, deps)
    }

    /// Create a static node holding `value`.
    pub fn new(value: impl Into<Value>) -> Node {
        NodeBuilder::default().value(value)
    }

    /// Create a computed node.
    pub fn computed<F, R>(deps: impl Into<Dep>, f: F) -> Node
    where
        F: Fn(&Inputs) -> R + 'static,
        R: IntoEvaluation,
    {
        NodeBuilder::default().computed(deps, f)
    }

    /// Create a static node whose value follows `source`.
    pub fn from_source(source: impl ReactiveSource + 'static) -> Node {
        NodeBuilder::default().source(source)
    }

    /// The node's identity, generated on first use if none was given.
    pub fn identity(&self) -> String {
        self.0
            .identity
            .get_or_init(|| format!("node-{}", self.0.serial))
            .clone()
    }

    /// The current value, `None` before anything was produced.
    pub fn value(&self) -> Option<Value> {
        self.0.state.borrow().value.clone()
    }

    /// Whether the node is static or computed.
    pub fn kind(&self) -> NodeKind {
        if self.0.evaluator.is_some() {
            NodeKind::Computed
        } else {
            NodeKind::Static
        }
    }

    /// Whether the node has an evaluator.
    pub fn is_computed(&self) -> bool {
        self.kind() == NodeKind::Computed
    }

    /// The scheduler this node uses.
    pub fn scheduler(&self) -> &Scheduler {
        &self.0.scheduler
    }

    /// The last evaluation error, cleared by the next successful value.
    pub fn error_state(&self) -> Option<EvalError> {
        self.0.state.borrow().error.clone()
    }

    /// Whether [`Node::complete`] has been called.
    pub fn is_completed(&self) -> bool {
        self.0.state.borrow().completed
    }

    /// Whether a stream, future or push-source result is outstanding.
    pub fn is_async_pending(&self) -> bool {
        self.0.state.borrow().async_pending
    }

    /// Number of open subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.0
            .state
            .borrow()
            .subscribers
            .values()
            .filter(|r| !r.is_closed())
            .count()
    }

    /// Whether the node is currently subscribed to its dependencies.
    pub fn has_live_dependencies(&self) -> bool {
        self.0.state.borrow().wired
    }

    /// A copy of the normalized dependency structure.
    pub fn dependencies(&self) -> Deps {
        self.0.state.borrow().deps.clone()
    }

    /// Identities of every node and source this node depends on.
    pub fn list_dependencies(&self) -> Vec<String> {
        let sources = extract_sources(&self.0.state.borrow().deps);
        sources.iter().map(|leaf| leaf.identity()).collect()
    }

    /// Whether `other` is one of this node's reactive dependencies.
    pub fn depends_on(&self, other: &Node) -> bool {
        extract_sources(&self.0.state.borrow().deps)
            .iter()
            .any(|leaf| matches!(leaf, SourceLeaf::Node(node) if node == other))
    }

    /// Recompute the value. Does nothing on static or completed nodes.
    ///
    /// Evaluation errors are captured and delivered to subscribers rather
    /// than returned.
    pub fn evaluate(&self) {
        if let Some(PendingResult { generation, future }) = self.start_evaluation() {
            let weak = Rc::downgrade(&self.0);
            self.0.scheduler.spawn(async move {
                let result = future.await;
                if let Some(inner) = weak.upgrade() {
                    Node(inner).finish_async(generation, result);
                }
            });
        }
    }

    /// Forced recomputation: make sure dependency subscriptions are live,
    /// then evaluate.
    pub fn update(&self) {
        if !self.is_computed() {
            return;
        }
        self.ensure_wired();
        self.evaluate();
    }

    /// Like [`Node::update`], but a future result is awaited and applied
    /// before returning.
    pub async fn update_async(&self) {
        if !self.is_computed() {
            return;
        }
        self.ensure_wired();
        if let Some(PendingResult { generation, future }) = self.start_evaluation() {
            let result = future.await;
            self.finish_async(generation, result);
        }
    }

    /// Replace the value of a static node.
    pub fn set(&self, value: impl Into<Value>) -> Result<()> {
        self.ensure_settable()?;
        let previous = {
            let mut state = self.0.state.borrow_mut();
            state.async_pending = false;
            state.source_subscription.take()
        };
        if let Some(mut previous) = previous {
            previous.unsubscribe();
        }
        self.emit(value.into());
        Ok(())
    }

    /// Feed a static node from `source`, replacing any previous source.
    pub fn set_source(&self, source: impl ReactiveSource + 'static) -> Result<()> {
        self.ensure_settable()?;
        self.attach_source(Rc::new(source));
        Ok(())
    }

    /// Evaluate a computed node, or set a static one.
    pub fn next(&self, value: impl Into<Value>) -> Result<()> {
        if self.is_computed() {
            if self.is_completed() {
                return Err(Error::Completed(self.identity()));
            }
            self.evaluate();
            Ok(())
        } else {
            self.set(value)
        }
    }

    /// Register an observer.
    ///
    /// The observer synchronously receives the current value, or the pending
    /// error. A completed node signals completion right away.
    pub fn subscribe(&self, observer: Observer) -> Subscription {
        let record = Rc::new(SubscriberRecord::new(observer));
        let (initial, needs_wiring) = {
            let mut state = self.0.state.borrow_mut();
            if state.completed {
                drop(state);
                record.dispatch(&Signal::Complete);
                return Subscription::empty();
            }
            let initial = match &state.error {
                Some(err) => Some(Signal::Error(err.clone())),
                None => state.value.clone().map(Signal::Next),
            };
            let rejected = matches!(initial, Some(Signal::Error(_))) && record.handles_errors();
            if !rejected {
                state
                    .subscribers
                    .insert(record.id(), Rc::clone(&record));
            }
            (initial, !rejected && !state.wired && self.0.evaluator.is_some())
        };

        if let Some(signal) = &initial {
            record.dispatch(signal);
        }
        if record.is_closed() {
            return Subscription::empty();
        }
        if needs_wiring {
            self.wire();
            self.0.scheduler.schedule_update(self);
        }

        let weak = Rc::downgrade(&self.0);
        let id = record.id();
        Subscription::new(move || {
            record.close();
            if let Some(inner) = weak.upgrade() {
                Node(inner).remove_subscriber(id);
            }
        })
    }

    /// Add dependencies and re-evaluate.
    pub fn add_dependency(&self, args: impl Into<DepArgs>) -> Result<()> {
        self.ensure_computed()?;
        let current = self.dependencies();
        let updated = add_entries(current, args.into())?;
        self.replace_dependencies(updated);
        Ok(())
    }

    /// Remove dependencies and re-evaluate.
    pub fn remove_dependency(&self, target: impl Into<DepTarget>) -> Result<()> {
        self.ensure_computed()?;
        let current = self.dependencies();
        let updated = remove_entries(current, &target.into())?;
        self.replace_dependencies(updated);
        Ok(())
    }

    /// Rewrite the whole dependency structure and re-evaluate.
    pub fn update_dependencies<F>(&self, transform: F) -> Result<()>
    where
        F: FnOnce(Deps) -> Deps,
    {
        self.ensure_computed()?;
        let updated = transform(self.dependencies());
        self.replace_dependencies(updated);
        Ok(())
    }

    /// Put the node into the error state and notify subscribers.
    pub fn error(&self, err: impl Into<EvalError>) {
        self.fail(err.into());
    }

    /// Complete the node: notify subscribers once and release everything
    /// upstream. Later calls do nothing.
    pub fn complete(&self) {
        let (records, dep_subscriptions, source_subscription) = {
            let mut state = self.0.state.borrow_mut();
            if state.completed {
                return;
            }
            state.completed = true;
            state.async_pending = false;
            state.wired = false;
            state.generation += 1;
            if let Some(handle) = state.stream_abort.take() {
                handle.abort();
            }
            (
                std::mem::take(&mut state.subscribers),
                std::mem::take(&mut state.dep_subscriptions),
                state.source_subscription.take(),
            )
        };

        for mut subscription in dep_subscriptions.into_iter().chain(source_subscription) {
            subscription.unsubscribe();
        }
        debug!(node = %self.identity(), "node completed");

        for record in records.into_values().filter(|r| !r.is_closed()) {
            self.0
                .scheduler
                .defer(move || record.dispatch(&Signal::Complete));
        }
    }

    pub(crate) fn serial(&self) -> u64 {
        self.0.serial
    }

    pub(crate) fn as_ptr(&self) -> *const () {
        Rc::as_ptr(&self.0) as *const ()
    }

    fn ensure_settable(&self) -> Result<()> {
        if self.is_computed() {
            return Err(Error::SetComputed);
        }
        if self.is_completed() {
            return Err(Error::Completed(self.identity()));
        }
        Ok(())
    }

    fn ensure_computed(&self) -> Result<()> {
        if !self.is_computed() {
            return Err(Error::StaticDependencies);
        }
        if self.is_completed() {
            return Err(Error::Completed(self.identity()));
        }
        Ok(())
    }

    fn ensure_wired(&self) {
        let wired = {
            let state = self.0.state.borrow();
            state.wired || state.completed
        };
        if !wired {
            self.wire();
        }
    }

    fn replace_dependencies(&self, deps: Deps) {
        self.0.state.borrow_mut().deps = deps;
        self.wire();
        self.evaluate();
    }

    /// Subscribe to every dependency source, replacing earlier subscriptions.
    fn wire(&self) {
        let (sources, previous) = {
            let mut state = self.0.state.borrow_mut();
            state.wired = true;
            state.wiring = true;
            (
                extract_sources(&state.deps),
                std::mem::take(&mut state.dep_subscriptions),
            )
        };

        let mut subscriptions = SmallVec::new();
        for leaf in &sources {
            let weak = Rc::downgrade(&self.0);
            let observer = Observer::new(move |_| {
                if let Some(inner) = weak.upgrade() {
                    Node(inner).on_dependency_changed();
                }
            });
            subscriptions.push(leaf.as_source().subscribe(observer));
        }

        {
            let mut state = self.0.state.borrow_mut();
            state.wiring = false;
            state.dep_subscriptions = subscriptions;
        }
        // Old subscriptions go last so shared upstream nodes never see zero subscribers.
        for mut subscription in previous {
            subscription.unsubscribe();
        }
        trace!(node = %self.identity(), sources = sources.len(), "dependencies wired");
    }

    fn unwire(&self) {
        let subscriptions = {
            let mut state = self.0.state.borrow_mut();
            state.wired = false;
            std::mem::take(&mut state.dep_subscriptions)
        };
        for mut subscription in subscriptions {
            subscription.unsubscribe();
        }
        debug!(node = %self.identity(), "dependencies released");
    }

    fn on_dependency_changed(&self) {
        let ignore = match self.0.state.try_borrow() {
            Ok(state) => state.wiring || state.completed,
            Err(_) => true,
        };
        if !ignore {
            self.0.scheduler.schedule_update(self);
        }
    }

    fn remove_subscriber(&self, id: SubscriberId) {
        let release = {
            let mut state = self.0.state.borrow_mut();
            state.subscribers.shift_remove(&id);
            state.subscribers.retain(|_, record| !record.is_closed());
            state.subscribers.is_empty() && state.wired && self.0.evaluator.is_some()
        };
        if release {
            self.unwire();
        }
    }

    /// Run the evaluator. A future result is returned for the caller to drive.
    fn start_evaluation(&self) -> Option<PendingResult> {
        let evaluator = self.0.evaluator.as_ref()?;
        let deps = {
            let state = self.0.state.borrow();
            if state.completed {
                return None;
            }
            state.deps.clone()
        };

        let inputs = read_values(&deps);
        let generation = {
            let mut state = self.0.state.borrow_mut();
            state.generation += 1;
            state.generation
        };

        match evaluator(&inputs) {
            Ok(Evaluation::Value(value)) => {
                let changed = {
                    let mut state = self.0.state.borrow_mut();
                    if let Some(handle) = state.stream_abort.take() {
                        handle.abort();
                    }
                    state.async_pending = false;
                    if state.error.is_none() && state.last_raw.as_ref() == Some(&value) {
                        false
                    } else {
                        state.last_raw = Some(value.clone());
                        true
                    }
                };
                if changed {
                    self.emit(value);
                }
                None
            }
            Ok(Evaluation::Stream(stream)) => {
                self.start_stream(generation, stream);
                None
            }
            Ok(Evaluation::Future(future)) => {
                let mut state = self.0.state.borrow_mut();
                if let Some(handle) = state.stream_abort.take() {
                    handle.abort();
                }
                state.async_pending = true;
                state.last_raw = None;
                Some(PendingResult { generation, future })
            }
            Err(err) => {
                {
                    let mut state = self.0.state.borrow_mut();
                    if let Some(handle) = state.stream_abort.take() {
                        handle.abort();
                    }
                    state.async_pending = false;
                    state.last_raw = None;
                }
                self.fail(err);
                None
            }
        }
    }

    fn start_stream(
        &self,
        generation: u64,
        stream: LocalBoxStream<'static, std::result::Result<Value, EvalError>>,
    ) {
        let (mut stream, handle) = abortable(stream);
        let previous = {
            let mut state = self.0.state.borrow_mut();
            state.async_pending = true;
            state.last_raw = None;
            state.stream_abort.replace(handle)
        };
        if let Some(previous) = previous {
            previous.abort();
        }

        let weak: Weak<NodeInner> = Rc::downgrade(&self.0);
        self.0.scheduler.spawn(async move {
            while let Some(item) = stream.next().await {
                let Some(inner) = weak.upgrade() else { return };
                let node = Node(inner);
                match item {
                    Ok(value) => node.emit(value),
                    Err(err) => node.fail(err),
                }
            }
            if let Some(inner) = weak.upgrade() {
                let mut state = inner.state.borrow_mut();
                if state.generation == generation {
                    state.async_pending = false;
                }
            }
        });
    }

    fn finish_async(&self, generation: u64, result: std::result::Result<Value, EvalError>) {
        let current = {
            let mut state = self.0.state.borrow_mut();
            let current = !state.completed && state.generation == generation;
            if current {
                state.async_pending = false;
            }
            current
        };
        if !current {
            debug!(node = %self.identity(), generation, "discarding superseded async result");
            return;
        }
        match result {
            Ok(value) => self.emit(value),
            Err(err) => self.fail(err),
        }
    }

    fn attach_source(&self, source: Rc<dyn ReactiveSource>) {
        let previous = {
            let mut state = self.0.state.borrow_mut();
            state.async_pending = true;
            state.source_subscription.take()
        };
        if let Some(mut previous) = previous {
            previous.unsubscribe();
        }

        let weak = Rc::downgrade(&self.0);
        let on_next = weak.clone();
        let on_error = weak.clone();
        let observer = Observer::new(move |value| {
            if let Some(inner) = on_next.upgrade() {
                Node(inner).emit(value.clone());
            }
        })
        .on_error(move |err| {
            if let Some(inner) = on_error.upgrade() {
                Node(inner).fail(err.clone());
            }
        })
        .on_complete(move || {
            if let Some(inner) = weak.upgrade() {
                inner.state.borrow_mut().async_pending = false;
            }
        });

        let subscription = source.subscribe(observer);
        debug!(node = %self.identity(), source = %source.identity(), "source attached");
        self.0.state.borrow_mut().source_subscription = Some(subscription);
    }

    /// Store a new value and deliver it.
    fn emit(&self, value: Value) {
        {
            let mut state = self.0.state.borrow_mut();
            if state.completed {
                return;
            }
            state.value = Some(value.clone());
            state.error = None;
        }
        self.deliver(Signal::Next(value));
    }

    /// Store an error and deliver it.
    fn fail(&self, err: EvalError) {
        {
            let mut state = self.0.state.borrow_mut();
            if state.completed {
                return;
            }
            state.error = Some(err.clone());
        }
        warn!(node = %self.identity(), error = %err, "evaluation failed");
        self.deliver(Signal::Error(err));
    }

    /// Queue a delivery for every open subscriber.
    fn deliver(&self, signal: Signal) {
        let records: Vec<_> = {
            let mut state = self.0.state.borrow_mut();
            state.subscribers.retain(|_, record| !record.is_closed());
            state.subscribers.values().cloned().collect()
        };
        if records.is_empty() {
            return;
        }
        trace!(node = %self.identity(), subscribers = records.len(), "delivering");
        let signal = Rc::new(signal);
        for record in records {
            let signal = Rc::clone(&signal);
            self.0.scheduler.defer(move || record.dispatch(&signal));
        }
    }
}

impl Drop for NodeInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some(handle) = state.stream_abort.take() {
            handle.abort();
        }
        let subscriptions = std::mem::take(&mut state.dep_subscriptions);
        for mut subscription in subscriptions.into_iter().chain(state.source_subscription.take()) {
            subscription.unsubscribe();
        }
    }
}

impl ReactiveSource for Node {
    fn identity(&self) -> String {
        Node::identity(self)
    }

    fn current_value(&self) -> Option<Value> {
        self.value()
    }

    fn subscribe(&self, observer: Observer) -> Subscription {
        Node::subscribe(self, observer)
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Node {}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.0.state.try_borrow();
        let mut out = f.debug_struct("Node");
        out.field("identity", &self.identity())
            .field("kind", &self.kind());
        if let Ok(state) = state {
            out.field("value", &state.value)
                .field("error", &state.error)
                .field("completed", &state.completed)
                .field("subscribers", &state.subscribers.len());
        }
        out.finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::source::PushSource;
    use serde_json::json;
    use std::cell::Cell;

    fn sum(inputs: &Inputs) -> Value {
        json!(inputs.values().filter_map(Value::as_i64).sum::<i64>())
    }

    fn collect(node: &Node) -> (Rc<RefCell<Vec<Value>>>, Subscription) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let sub = node.subscribe(Observer::new(move |v| sink.borrow_mut().push(v.clone())));
        (seen, sub)
    }

    #[test]
    fn computed_node_evaluates_on_construction() {
        let a = Node::new(json!(1));
        let b = Node::new(json!(2));
        let c = Node::computed([&a, &b], sum);

        assert_eq!(c.value(), Some(json!(3)));
        assert_eq!(c.kind(), NodeKind::Computed);
        assert!(c.has_live_dependencies());
    }

    #[test]
    fn set_propagates_after_drain() {
        let scheduler = Scheduler::new();
        let a = Node::builder().scheduler(&scheduler).value(json!(1));
        let b = Node::builder().scheduler(&scheduler).value(json!(2));
        let c = Node::builder().scheduler(&scheduler).computed([&a, &b], sum);

        a.set(json!(10)).unwrap();
        assert_eq!(c.value(), Some(json!(3)));

        scheduler.flush();
        assert_eq!(c.value(), Some(json!(12)));
    }

    #[test]
    fn create_validates_arguments() {
        let err = Node::create(NodeInit::evaluator(|_: &Inputs| json!(1)), None).unwrap_err();
        assert_eq!(err, Error::MissingDependencies);

        let err = Node::create(json!(1).into(), Some(Dep::Static(json!(2)))).unwrap_err();
        assert_eq!(err, Error::UnexpectedDependencies);

        let node = Node::create(json!(5).into(), None).unwrap();
        assert_eq!(node.value(), Some(json!(5)));
    }

    #[test]
    fn setting_computed_node_fails() {
        let a = Node::new(json!(1));
        let c = Node::computed(&a, |i: &Inputs| i[0].clone());
        assert_eq!(c.set(json!(3)), Err(Error::SetComputed));
    }

    #[test]
    fn subscribe_delivers_current_value_first() {
        let a = Node::new(json!("x"));
        let (seen, _sub) = collect(&a);
        assert_eq!(*seen.borrow(), vec![json!("x")]);
    }

    #[test]
    fn identical_results_are_not_redelivered() {
        let scheduler = Scheduler::new();
        let a = Node::builder().scheduler(&scheduler).value(json!(4));
        let parity = Node::builder()
            .scheduler(&scheduler)
            .computed(&a, |i: &Inputs| json!(i[0].as_i64().unwrap_or(0) % 2 == 0));
        let (seen, _sub) = collect(&parity);

        parity.evaluate();
        parity.evaluate();
        a.set(json!(6)).unwrap();
        scheduler.flush();

        assert_eq!(*seen.borrow(), vec![json!(true)]);
    }

    #[test]
    fn evaluation_error_is_captured_and_cleared() {
        let scheduler = Scheduler::new();
        let a = Node::builder().scheduler(&scheduler).value(json!(0));
        let inverse = Node::builder().scheduler(&scheduler).computed(&a, |i: &Inputs| {
            match i[0].as_f64() {
                Some(x) if x != 0.0 => Ok(json!(1.0 / x)),
                _ => Err(EvalError::msg("division by zero")),
            }
        });
        assert_eq!(inverse.error_state(), Some(EvalError::msg("division by zero")));

        let errors = Rc::new(Cell::new(0));
        let count = errors.clone();
        let _late = inverse.subscribe(
            Observer::new(|_| {}).on_error(move |_| count.set(count.get() + 1)),
        );
        assert_eq!(errors.get(), 1);

        a.set(json!(4)).unwrap();
        scheduler.flush();
        assert_eq!(inverse.error_state(), None);
        assert_eq!(inverse.value(), Some(json!(0.25)));
    }

    #[test]
    fn error_does_not_reach_dependents() {
        let scheduler = Scheduler::new();
        let a = Node::builder().scheduler(&scheduler).value(json!(1));
        let b = Node::builder().scheduler(&scheduler).computed(&a, |i: &Inputs| i[0].clone());
        let c = Node::builder().scheduler(&scheduler).computed(&b, |i: &Inputs| i[0].clone());

        b.error(EvalError::msg("manual"));
        scheduler.flush();
        assert!(c.error_state().is_none());

        a.set(json!(2)).unwrap();
        scheduler.flush();
        scheduler.flush();
        assert_eq!(c.value(), Some(json!(2)));
    }

    #[test]
    fn last_unsubscribe_releases_dependencies() {
        let scheduler = Scheduler::new();
        let a = Node::builder().scheduler(&scheduler).value(json!(1));
        let c = Node::builder().scheduler(&scheduler).computed(&a, |i: &Inputs| i[0].clone());
        assert_eq!(a.subscriber_count(), 1);

        let (_seen, mut sub) = collect(&c);
        sub.unsubscribe();
        assert!(!c.has_live_dependencies());
        assert_eq!(a.subscriber_count(), 0);

        a.set(json!(5)).unwrap();
        scheduler.flush();
        assert_eq!(c.value(), Some(json!(1)));

        let (seen, _sub) = collect(&c);
        assert!(c.has_live_dependencies());
        scheduler.flush();
        assert_eq!(c.value(), Some(json!(5)));
        assert_eq!(*seen.borrow(), vec![json!(1), json!(5)]);
    }

    #[test]
    fn add_then_remove_restores_dependency_list() {
        let a = Node::new(json!(1));
        let b = Node::new(json!(2));
        let x = Node::new(json!(100));
        let c = Node::computed([&a, &b], sum);
        let before = c.list_dependencies();

        c.add_dependency(&x).unwrap();
        assert_eq!(c.value(), Some(json!(103)));
        assert_eq!(c.list_dependencies().len(), 3);

        c.remove_dependency(&x).unwrap();
        assert_eq!(c.list_dependencies(), before);
        assert_eq!(c.value(), Some(json!(3)));
    }

    #[test]
    fn named_dependencies_use_identity_as_key() {
        let price = Node::builder().id("price").value(json!(3));
        let qty = Node::builder().id("qty").value(json!(4));
        let total = Node::computed(Dep::named([("price", &price)]), |i: &Inputs| {
            json!(i["price"].as_i64().unwrap_or(0) * i["qty"].as_i64().unwrap_or(1))
        });
        assert_eq!(total.value(), Some(json!(3)));

        total.add_dependency(&qty).unwrap();
        assert_eq!(total.value(), Some(json!(12)));
        assert_eq!(total.list_dependencies(), vec!["price", "qty"]);

        total.remove_dependency("qty").unwrap();
        assert_eq!(total.value(), Some(json!(3)));
    }

    #[test]
    fn dependency_changes_rejected_on_static_node() {
        let a = Node::new(json!(1));
        let b = Node::new(json!(2));
        assert_eq!(a.add_dependency(&b), Err(Error::StaticDependencies));
        assert_eq!(a.remove_dependency(&b), Err(Error::StaticDependencies));
    }

    #[test]
    fn update_dependencies_rewrites_structure() {
        let a = Node::new(json!(1));
        let b = Node::new(json!(10));
        let c = Node::computed(&a, sum);

        c.update_dependencies(|deps| match deps {
            Deps::List(mut items) => {
                items.push(Dep::from(&b));
                Deps::List(items)
            }
            other => other,
        })
        .unwrap();

        assert_eq!(c.value(), Some(json!(11)));
        assert_eq!(c.list_dependencies(), vec![a.identity(), b.identity()]);
    }

    #[test]
    fn thunk_dependencies_are_pulled_each_evaluation() {
        let counter = Rc::new(Cell::new(0));
        let source = counter.clone();
        let c = Node::computed(
            Dep::thunk(move || json!(source.get())),
            |i: &Inputs| i[0].clone(),
        );
        assert_eq!(c.value(), Some(json!(0)));

        counter.set(9);
        c.evaluate();
        assert_eq!(c.value(), Some(json!(9)));
    }

    #[test]
    fn complete_notifies_once_and_freezes() {
        let scheduler = Scheduler::new();
        let a = Node::builder().scheduler(&scheduler).value(json!(1));
        let completions = Rc::new(Cell::new(0));
        let values = Rc::new(Cell::new(0));
        let (c, v) = (completions.clone(), values.clone());
        let _sub = a.subscribe(
            Observer::new(move |_| v.set(v.get() + 1)).on_complete(move || c.set(c.get() + 1)),
        );
        assert_eq!(values.get(), 1);

        a.complete();
        a.complete();
        assert!(matches!(a.set(json!(2)), Err(Error::Completed(_))));
        a.error(EvalError::msg("ignored"));
        scheduler.flush();

        assert_eq!(completions.get(), 1);
        assert_eq!(values.get(), 1);
        assert_eq!(a.value(), Some(json!(1)));

        let late = Rc::new(Cell::new(false));
        let flag = late.clone();
        let sub = a.subscribe(Observer::new(|_| {}).on_complete(move || flag.set(true)));
        assert!(late.get());
        assert!(sub.is_closed());
    }

    #[test]
    fn complete_releases_dependency_subscriptions() {
        let a = Node::new(json!(1));
        let c = Node::computed(&a, |i: &Inputs| i[0].clone());
        assert_eq!(a.subscriber_count(), 1);

        c.complete();
        assert_eq!(a.subscriber_count(), 0);
        assert!(!c.has_live_dependencies());
    }

    #[test]
    fn replacing_source_ignores_old_emissions() {
        let scheduler = Scheduler::new();
        let first = PushSource::new();
        let second = PushSource::new();
        let node = Node::builder().scheduler(&scheduler).source(first.clone());
        let (seen, _sub) = collect(&node);

        node.set_source(second.clone()).unwrap();
        first.push(1);
        second.push(2);
        first.push(3);
        scheduler.flush();

        assert_eq!(*seen.borrow(), vec![json!(2)]);
        assert_eq!(first.observer_count(), 0);
        assert!(node.is_async_pending());
    }

    #[test]
    fn set_cancels_source_subscription() {
        let source = PushSource::new();
        let node = Node::from_source(source.clone());
        node.set(json!("manual")).unwrap();
        source.push("ignored");
        assert_eq!(node.value(), Some(json!("manual")));
        assert!(!node.is_async_pending());
    }

    #[test]
    fn stream_results_deliver_each_emission() {
        let scheduler = Scheduler::new();
        let trigger = Node::builder().scheduler(&scheduler).value(json!(3));
        let counter = Node::builder().scheduler(&scheduler).computed(&trigger, |i: &Inputs| {
            let n = i[0].as_i64().unwrap_or(0);
            Evaluation::stream(futures_util::stream::iter((1..=n).map(|k| Ok(json!(k)))))
        });
        let (seen, _sub) = collect(&counter);
        assert!(counter.is_async_pending());

        scheduler.flush();
        assert_eq!(*seen.borrow(), vec![json!(1), json!(2), json!(3)]);
        assert!(!counter.is_async_pending());
    }

    #[test]
    fn new_stream_cancels_previous_stream() {
        let scheduler = Scheduler::new();
        let (old_tx, old_rx) = tokio::sync::mpsc::unbounded_channel::<Value>();
        let (new_tx, new_rx) = tokio::sync::mpsc::unbounded_channel::<Value>();
        let receivers = Rc::new(RefCell::new(vec![Some(old_rx), Some(new_rx)]));
        let which = Node::builder().scheduler(&scheduler).value(json!(0));
        let node = Node::builder().scheduler(&scheduler).computed(&which, move |i: &Inputs| {
            let index = i[0].as_u64().unwrap_or(0) as usize;
            match receivers.borrow_mut()[index].take() {
                Some(mut rx) => Evaluation::stream(futures_util::stream::poll_fn(move |cx| {
                    rx.poll_recv(cx).map(|item| item.map(Ok))
                })),
                None => Evaluation::Value(Value::Null),
            }
        });
        let (seen, _sub) = collect(&node);

        which.set(json!(1)).unwrap();
        scheduler.flush();
        let _ = old_tx.send(json!("old"));
        new_tx.send(json!("new")).unwrap();
        scheduler.flush();

        assert_eq!(*seen.borrow(), vec![json!("new")]);
        assert!(node.is_async_pending());
    }

    #[test]
    fn future_results_resolve_later() {
        let scheduler = Scheduler::new();
        let a = Node::builder().scheduler(&scheduler).value(json!(2));
        let doubled = Node::builder().scheduler(&scheduler).computed(&a, |i: &Inputs| {
            let x = i[0].as_i64().unwrap_or(0);
            Evaluation::future(async move { Ok(json!(x * 2)) })
        });
        assert_eq!(doubled.value(), None);
        assert!(doubled.is_async_pending());

        scheduler.flush();
        assert_eq!(doubled.value(), Some(json!(4)));
        assert!(!doubled.is_async_pending());
    }

    #[test]
    fn rejected_future_routes_to_error() {
        let scheduler = Scheduler::new();
        let a = Node::builder().scheduler(&scheduler).value(json!(1));
        let node = Node::builder().scheduler(&scheduler).computed(&a, |_: &Inputs| {
            Evaluation::future(async { Err(EvalError::msg("rejected")) })
        });

        scheduler.flush();
        assert_eq!(node.error_state(), Some(EvalError::msg("rejected")));
    }

    #[tokio::test]
    async fn superseded_future_result_is_discarded() {
        let scheduler = Scheduler::new();
        let a = Node::builder().scheduler(&scheduler).value(json!(0));
        let senders = Rc::new(RefCell::new(Vec::new()));
        let registry = senders.clone();
        let node = Node::builder().scheduler(&scheduler).computed(&a, move |_: &Inputs| {
            let (tx, rx) = tokio::sync::oneshot::channel::<Value>();
            registry.borrow_mut().push(tx);
            Evaluation::future(async move { rx.await.map_err(EvalError::from_error) })
        });

        a.set(json!(1)).unwrap();
        scheduler.flush();
        assert_eq!(senders.borrow().len(), 2);

        let mut pending: Vec<_> = senders.borrow_mut().drain(..).collect();
        let latest = pending.pop().unwrap();
        let stale = pending.pop().unwrap();
        latest.send(json!("latest")).unwrap();
        scheduler.flush();
        stale.send(json!("stale")).unwrap();
        scheduler.settle().await;

        assert_eq!(node.value(), Some(json!("latest")));
    }

    #[tokio::test]
    async fn update_async_awaits_future_result() {
        let scheduler = Scheduler::new();
        let a = Node::builder().scheduler(&scheduler).value(json!(5));
        let node = Node::builder().scheduler(&scheduler).computed(&a, |i: &Inputs| {
            let x = i[0].as_i64().unwrap_or(0);
            Evaluation::future(async move { Ok(json!(x + 1)) })
        });

        node.update_async().await;
        assert_eq!(node.value(), Some(json!(6)));
    }

    #[test]
    fn dropping_dependent_releases_upstream_record() {
        let a = Node::new(json!(1));
        let c = Node::computed(&a, |i: &Inputs| i[0].clone());
        assert_eq!(a.subscriber_count(), 1);
        drop(c);
        assert_eq!(a.subscriber_count(), 0);
    }

    #[test]
    fn push_source_leaf_drives_computed_node() {
        let scheduler = Scheduler::new();
        let feed = PushSource::named("feed");
        let a = Node::builder().id("a").scheduler(&scheduler).value(json!(1));
        let total = Node::builder()
            .scheduler(&scheduler)
            .computed(Dep::list([Dep::source(feed.clone()), Dep::from(&a)]), sum);
        assert_eq!(total.value(), Some(json!(1)));
        assert_eq!(total.list_dependencies(), vec!["feed", "a"]);
        assert_eq!(feed.observer_count(), 1);

        feed.push(5);
        scheduler.flush();
        assert_eq!(total.value(), Some(json!(6)));

        total.remove_dependency("feed").unwrap();
        assert_eq!(feed.observer_count(), 0);
        assert_eq!(total.value(), Some(json!(1)));

        feed.push(50);
        scheduler.flush();
        assert_eq!(total.value(), Some(json!(1)));
    }

    #[test]
    fn next_sets_static_and_reevaluates_computed() {
        let scheduler = Scheduler::new();
        let a = Node::builder().scheduler(&scheduler).value(json!(1));
        a.next(json!(2)).unwrap();
        assert_eq!(a.value(), Some(json!(2)));

        let calls = Rc::new(Cell::new(0));
        let tick = calls.clone();
        let c = Node::builder().scheduler(&scheduler).computed(&a, move |i: &Inputs| {
            tick.set(tick.get() + 1);
            json!(i[0].as_i64().unwrap_or(0) + tick.get())
        });
        assert_eq!(c.value(), Some(json!(3)));

        c.next(Value::Null).unwrap();
        assert_eq!(calls.get(), 2);
        assert_eq!(c.value(), Some(json!(4)));

        c.complete();
        assert!(matches!(c.next(Value::Null), Err(Error::Completed(_))));
        a.complete();
        assert!(matches!(a.next(json!(3)), Err(Error::Completed(_))));
    }

    #[test]
    fn create_from_source_follows_pushes() {
        let scheduler = Scheduler::new();
        let feed = PushSource::new();
        feed.push(7);
        let node = Node::builder()
            .scheduler(&scheduler)
            .create(NodeInit::Source(Rc::new(feed.clone())), None)
            .unwrap();
        assert_eq!(node.kind(), NodeKind::Static);
        assert_eq!(node.value(), Some(json!(7)));
        assert!(node.is_async_pending());

        feed.push(8);
        assert_eq!(node.value(), Some(json!(8)));
        feed.finish();
        assert!(!node.is_async_pending());

        let err = Node::create(
            NodeInit::Source(Rc::new(PushSource::new())),
            Some(Dep::Static(json!(1))),
        )
        .unwrap_err();
        assert_eq!(err, Error::UnexpectedDependencies);
    }

    #[test]
    fn closed_subscribers_do_not_hold_dependencies() {
        let scheduler = Scheduler::new();
        let a = Node::builder().scheduler(&scheduler).value(json!(1));
        let c = Node::builder().scheduler(&scheduler).computed(&a, |i: &Inputs| i[0].clone());
        let _failed = c.subscribe(Observer::new(|_| {}).on_error(|_| {}));
        let mut plain = c.subscribe(Observer::new(|_| {}));

        c.error(EvalError::msg("boom"));
        scheduler.flush();
        assert_eq!(c.subscriber_count(), 1);

        plain.unsubscribe();
        assert!(!c.has_live_dependencies());
        assert_eq!(a.subscriber_count(), 0);
    }
}
