//! Dependency Graph
//!
//! This module implements an explicit registry of nodes and the structural
//! edges between them.
//!
//! # Overview
//!
//! The graph is a directed acyclic graph (DAG) where:
//!
//! - Nodes are reactive [`Node`](crate::reactive::Node) handles, registered
//!   under an encoded [`NodeKey`]
//! - Edges represent dependencies: if B depends on A, there is an edge from A to B
//!
//! Edges alone carry no runtime propagation. Connecting into a computed node
//! adds the source to that node's dependencies, which is what wires the live
//! subscription.
//!
//! # Design Decisions
//!
//! 1. The graph owns structure and the node owns wiring. Graph operations
//!    are the only writer of a registered node's dependencies.
//!
//! 2. Nodes and edges live in insertion-ordered maps, so traversal and
//!    topological results are deterministic.
//!
//! 3. Cycles are rejected at `connect` time, before anything is mutated.
//!
//! 4. [`Graph::update`] is a deterministic alternative to subscription-driven
//!    propagation: it forces every computed node in topological order,
//!    whoever is currently subscribed.

mod key;
mod registry;
mod traverse;

pub use key::{KeyCodec, MsgPackCodec, NodeKey, NodeRef, Utf8Codec};
pub use registry::Graph;
