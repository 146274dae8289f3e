//! Cellflow Core
//!
//! This crate provides an incremental computation engine. It implements:
//!
//! - Reactive nodes (static values and computed values with dependencies)
//! - A coalescing update scheduler with batching
//! - An explicit dependency graph with cycle checks and topological updates
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `reactive`: nodes, dependency structures, subscriptions and scheduling
//! - `graph`: node registry, structural edges and traversal queries
//! - `config`: engine settings
//! - `error`: error types shared by both halves
//!
//! # Example
//!
//! ```rust
//! use cellflow_core::reactive::{Inputs, Node, Scheduler, SchedulerContext};
//! use serde_json::json;
//!
//! let scheduler = Scheduler::new();
//! let _ctx = SchedulerContext::enter(&scheduler);
//!
//! let a = Node::new(json!(1));
//! let b = Node::new(json!(2));
//! let c = Node::computed([&a, &b], |vals: &Inputs| {
//!     json!(vals[0].as_i64().unwrap_or(0) + vals[1].as_i64().unwrap_or(0))
//! });
//! assert_eq!(c.value(), Some(json!(3)));
//!
//! a.set(json!(10)).unwrap();
//! scheduler.flush();
//! assert_eq!(c.value(), Some(json!(12)));
//! ```

pub mod config;
pub mod error;
pub mod graph;
pub mod reactive;

pub use config::Config;
pub use error::{Error, EvalError, Result};
pub use graph::{Graph, NodeKey, NodeRef};
pub use reactive::{Dep, Inputs, Node, Observer, Scheduler, Subscription};
