//! Error types.
//!
//! Two families of errors exist in the engine:
//!
//! - [`Error`] covers everything that is reported synchronously to the caller:
//!   invalid construction arguments, mutating a computed node, bad dependency
//!   arguments, unknown graph references, duplicate registration and cycles.
//! - [`EvalError`] is produced by evaluators (or by rejected async results).
//!   It is never returned to the caller of `evaluate`; it is stored on the
//!   node and delivered to subscribers through their error channel.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Synchronous usage, cycle and graph-consistency errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// An evaluator was supplied without a dependency declaration.
    #[error("computed nodes require a single dependency argument")]
    MissingDependencies,

    /// A static value or source was supplied together with a dependency declaration.
    #[error("static nodes do not accept a dependency argument")]
    UnexpectedDependencies,

    /// `set` was called on a node that has an evaluator.
    #[error("cannot manually set a computed node")]
    SetComputed,

    /// A dependency operation was attempted on a static node.
    #[error("cannot change the dependencies of a static node")]
    StaticDependencies,

    /// The arguments do not fit the node's dependency structure.
    #[error("invalid dependency arguments: {0}")]
    InvalidDependencyArgs(String),

    /// `remove_dependency` matched nothing.
    #[error("dependency not found: {0}")]
    DependencyNotFound(String),

    /// The node has completed and no longer accepts values.
    #[error("node {0} has completed")]
    Completed(String),

    /// A node with the same key is already registered.
    #[error("node {0} is already registered")]
    DuplicateNode(String),

    /// The reference does not resolve to a registered node.
    #[error("node {0} is not registered")]
    NodeNotFound(String),

    /// The edge does not exist.
    #[error("no edge from {source_id} to {target}")]
    EdgeNotFound { source_id: String, target: String },

    /// Inserting the edge would close a cycle.
    #[error("connecting {source_id} to {target} would create a cycle")]
    Cycle { source_id: String, target: String },

    /// Topological sort could not emit every node.
    #[error("graph contains a cycle: sorted {sorted} of {total} nodes")]
    ResidualCycle { sorted: usize, total: usize },

    /// The key codec failed to encode or decode a key.
    #[error("key codec error: {0}")]
    KeyCodec(String),

    /// A flush ran out of evaluations with nodes still pending.
    #[error("flush stopped after {limit} evaluations with {pending} nodes pending")]
    FlushLimit { limit: usize, pending: usize },

    /// Configuration could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// An error raised while evaluating a node.
///
/// Cloning is cheap so the same error can be delivered to every subscriber.
#[derive(Clone, PartialEq, Eq)]
pub struct EvalError {
    message: Arc<str>,
}

impl EvalError {
    /// Create an error from a message.
    pub fn msg(message: impl fmt::Display) -> Self {
        Self {
            message: message.to_string().into(),
        }
    }

    /// Capture any standard error, keeping its rendered message.
    pub fn from_error<E: std::error::Error>(err: E) -> Self {
        Self::msg(err)
    }

    /// The error message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Debug for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EvalError").field(&self.message).finish()
    }
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for EvalError {}

impl From<&str> for EvalError {
    fn from(message: &str) -> Self {
        Self::msg(message)
    }
}

impl From<String> for EvalError {
    fn from(message: String) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<Error> for EvalError {
    fn from(err: Error) -> Self {
        Self::from_error(err)
    }
}
