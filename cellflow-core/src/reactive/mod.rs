//! Reactive Primitives
//!
//! This module implements the push-based half of the engine: nodes, their
//! dependency structures, subscriptions and the coalescing scheduler.
//!
//! # Concepts
//!
//! ## Nodes
//!
//! A [`Node`] holds a value. Static nodes are written with [`Node::set`];
//! computed nodes derive their value from an evaluator over a dependency
//! structure. A node can also be fed by an external [`ReactiveSource`].
//!
//! ## Dependency Structures
//!
//! A computed node declares its inputs as a [`Dep`] tree, which is
//! normalized into a positional list or a named map ([`Deps`]). The
//! evaluator always receives one same-shaped [`Inputs`] snapshot.
//!
//! ## Scheduling
//!
//! A changed input does not recompute its dependents on the spot. The
//! dependents are queued on a [`Scheduler`] and recomputed once per drain,
//! however many inputs changed in between. Deliveries to subscribers are
//! deferred units on the same scheduler.
//!
//! # Implementation Notes
//!
//! The engine is single-threaded (`Rc`/`RefCell`). Upstream nodes only hold
//! subscriber records whose callbacks capture weak references to their
//! dependents, so ownership always points upstream.

mod args;
mod context;
mod deps;
mod node;
mod scheduler;
mod source;
mod subscriber;

pub use args::{DepArgs, DepTarget};
pub use context::SchedulerContext;
pub use deps::{extract_sources, normalize, read_values, Dep, Deps, Inputs, SourceLeaf, Thunk};
pub use node::{
    Evaluation, Evaluator, IntoEvaluation, Node, NodeBuilder, NodeInit, NodeKind,
};
pub use scheduler::Scheduler;
pub use source::{PushSource, ReactiveSource};
pub use subscriber::{Observer, SubscriberId, Subscription};
