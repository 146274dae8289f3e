//! Graph Registry
//!
//! The [`Graph`] owns structural edges; each node owns its live
//! subscriptions. The graph only ever changes node wiring through the node's
//! own `add_dependency`/`remove_dependency`, so the two stay in step.

use indexmap::{IndexMap, IndexSet};
use tracing::debug;

use super::key::{KeyCodec, MsgPackCodec, NodeKey, NodeRef, Utf8Codec};
use crate::config::{GraphConfig, KeyEncoding};
use crate::error::{Error, Result};
use crate::reactive::Node;

/// A registry of nodes and the directed edges between them.
///
/// An edge `src -> tgt` means "tgt depends on src". The edge set is kept
/// acyclic.
pub struct Graph {
    pub(super) nodes: IndexMap<NodeKey, Node>,
    pub(super) edges: IndexMap<NodeKey, IndexSet<NodeKey>>,
    /// Registered key of each node, by node serial.
    node_keys: IndexMap<u64, NodeKey>,
    codec: Box<dyn KeyCodec>,
}

impl Graph {
    /// Create an empty graph with MessagePack keys.
    pub fn new() -> Self {
        Self::with_codec(MsgPackCodec)
    }

    /// Create an empty graph with a custom key codec.
    pub fn with_codec(codec: impl KeyCodec + 'static) -> Self {
        Self {
            nodes: IndexMap::new(),
            edges: IndexMap::new(),
            node_keys: IndexMap::new(),
            codec: Box::new(codec),
        }
    }

    pub fn with_config(config: &GraphConfig) -> Self {
        match config.key_encoding {
            KeyEncoding::MessagePack => Self::with_codec(MsgPackCodec),
            KeyEncoding::Utf8 => Self::with_codec(Utf8Codec),
        }
    }

    /// Resolve a reference into a key without requiring it to be registered.
    ///
    /// A registered node resolves to the key it was registered under, which
    /// may differ from its identity.
    pub fn key<'a>(&self, node: impl Into<NodeRef<'a>>) -> Result<NodeKey> {
        let node = node.into();
        if let NodeRef::Node(handle) = node {
            if let Some(key) = self.node_keys.get(&handle.serial()) {
                return Ok(key.clone());
            }
        }
        node.resolve(self.codec.as_ref())
    }

    /// Decode a key back into the identifier it was made from.
    pub fn decode_key(&self, key: &NodeKey) -> Result<String> {
        self.codec.decode(key)
    }

    /// Register `node` under its identity.
    pub fn add_node(&mut self, node: &Node) -> Result<NodeKey> {
        self.add_node_with_key(node, node)
    }

    /// Register `node` under an explicit key.
    ///
    /// A node can be registered once. Afterwards `&node` resolves to this key.
    pub fn add_node_with_key<'a>(
        &mut self,
        key: impl Into<NodeRef<'a>>,
        node: &Node,
    ) -> Result<NodeKey> {
        let key = self.key(key)?;
        if self.nodes.contains_key(&key) {
            return Err(Error::DuplicateNode(self.label(&key)));
        }
        if let Some(existing) = self.node_keys.get(&node.serial()) {
            return Err(Error::DuplicateNode(self.label(existing)));
        }
        debug!(key = %self.label(&key), "node registered");
        self.nodes.insert(key.clone(), node.clone());
        self.node_keys.insert(node.serial(), key.clone());
        Ok(key)
    }

    /// Unregister a node.
    ///
    /// Every computed node on the far side of an incident edge stops depending
    /// on it, and a computed node being removed stops depending on its
    /// registered inputs.
    pub fn remove_node<'a>(&mut self, node: impl Into<NodeRef<'a>>) -> Result<Node> {
        let key = self.registered(node)?;
        let removed = self.nodes[&key].clone();

        let targets: Vec<NodeKey> = self
            .edges
            .get(&key)
            .map(|targets| targets.iter().cloned().collect())
            .unwrap_or_default();
        for target in &targets {
            detach(&removed, &self.nodes[target])?;
        }
        for source in self.predecessor_keys(&key) {
            detach(&self.nodes[&source], &removed)?;
        }

        self.edges.shift_remove(&key);
        for targets in self.edges.values_mut() {
            targets.shift_remove(&key);
        }
        self.nodes.shift_remove(&key);
        self.node_keys.shift_remove(&removed.serial());
        debug!(key = %self.label(&key), edges = targets.len(), "node removed");
        Ok(removed)
    }

    /// Add the edge `source -> target`.
    ///
    /// Fails without touching anything if the edge would close a cycle. A
    /// computed target gains `source` as a dependency.
    pub fn connect<'a, 'b>(
        &mut self,
        source: impl Into<NodeRef<'a>>,
        target: impl Into<NodeRef<'b>>,
    ) -> Result<()> {
        let source = self.registered(source)?;
        let target = self.registered(target)?;
        if self.has_edge_keys(&source, &target) {
            return Ok(());
        }
        if self.reaches(&target, &source) {
            return Err(Error::Cycle {
                source_id: self.label(&source),
                target: self.label(&target),
            });
        }

        let (upstream, downstream) = (&self.nodes[&source], &self.nodes[&target]);
        if downstream.is_computed() && !downstream.depends_on(upstream) {
            downstream.add_dependency(upstream)?;
        }
        self.edges.entry(source.clone()).or_default().insert(target.clone());
        debug!(source = %self.label(&source), target = %self.label(&target), "connected");
        Ok(())
    }

    /// Remove the edge `source -> target`. A computed target stops depending
    /// on `source`.
    pub fn disconnect<'a, 'b>(
        &mut self,
        source: impl Into<NodeRef<'a>>,
        target: impl Into<NodeRef<'b>>,
    ) -> Result<()> {
        let source = self.registered(source)?;
        let target = self.registered(target)?;
        if !self.has_edge_keys(&source, &target) {
            return Err(Error::EdgeNotFound {
                source_id: self.label(&source),
                target: self.label(&target),
            });
        }

        detach(&self.nodes[&source], &self.nodes[&target])?;
        if let Some(targets) = self.edges.get_mut(&source) {
            targets.shift_remove(&target);
            if targets.is_empty() {
                self.edges.shift_remove(&source);
            }
        }
        debug!(source = %self.label(&source), target = %self.label(&target), "disconnected");
        Ok(())
    }

    /// Force every computed node to recompute, in topological order.
    pub fn update(&self) -> Result<()> {
        let order = self.topological_sort()?;
        for key in &order {
            let node = &self.nodes[key];
            if node.is_computed() {
                node.update();
            }
        }
        Ok(())
    }

    /// Like [`Graph::update`], awaiting each node's async result in turn.
    pub async fn update_async(&self) -> Result<()> {
        let order = self.topological_sort()?;
        for key in &order {
            let node = &self.nodes[key];
            if node.is_computed() {
                node.update_async().await;
            }
        }
        Ok(())
    }

    /// The node registered under a reference.
    pub fn node<'a>(&self, node: impl Into<NodeRef<'a>>) -> Option<&Node> {
        let key = self.key(node).ok()?;
        self.nodes.get(&key)
    }

    pub fn contains<'a>(&self, node: impl Into<NodeRef<'a>>) -> bool {
        self.node(node).is_some()
    }

    /// Registered keys in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &NodeKey> {
        self.nodes.keys()
    }

    /// Every edge as a `(source, target)` pair.
    pub fn edges(&self) -> impl Iterator<Item = (&NodeKey, &NodeKey)> {
        self.edges
            .iter()
            .flat_map(|(source, targets)| targets.iter().map(move |target| (source, target)))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Resolve a reference that must be registered.
    pub(super) fn registered<'a>(&self, node: impl Into<NodeRef<'a>>) -> Result<NodeKey> {
        let key = self.key(node)?;
        if !self.nodes.contains_key(&key) {
            return Err(Error::NodeNotFound(self.label(&key)));
        }
        Ok(key)
    }

    /// Human-readable form of a key for errors and logs.
    pub(super) fn label(&self, key: &NodeKey) -> String {
        self.codec
            .decode(key)
            .unwrap_or_else(|_| format!("{key:?}"))
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("nodes", &self.nodes.len())
            .field("edges", &self.edges().count())
            .finish()
    }
}

/// Make a computed `target` stop depending on `source`.
///
/// A dependency that was already dropped outside the graph is not an error.
fn detach(source: &Node, target: &Node) -> Result<()> {
    if !target.is_computed() || target.is_completed() || !target.depends_on(source) {
        return Ok(());
    }
    target.remove_dependency(source)
}
