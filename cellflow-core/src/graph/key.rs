//! Graph Keys
//!
//! The graph does not index nodes by their identity string directly. A
//! reference is first resolved into a [`NodeKey`] through a [`KeyCodec`], and
//! all equality checks happen on the encoded bytes.

use std::fmt;

use smallvec::SmallVec;

use crate::error::{Error, Result};
use crate::reactive::Node;

/// An encoded node key.
///
/// Short identifiers stay inline; longer ones spill to the heap.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey(SmallVec<[u8; 24]>);

impl NodeKey {
    /// Wrap already-encoded bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(SmallVec::from_slice(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(text) if text.chars().all(|c| !c.is_control()) => write!(f, "NodeKey({text:?})"),
            _ => write!(f, "NodeKey({:02x?})", self.0.as_slice()),
        }
    }
}

/// Turns identifiers into keys and back.
pub trait KeyCodec {
    fn encode(&self, id: &str) -> Result<NodeKey>;
    fn decode(&self, key: &NodeKey) -> Result<String>;
}

/// Opaque binary keys: the identifier serialized as a MessagePack string.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPackCodec;

impl KeyCodec for MsgPackCodec {
    fn encode(&self, id: &str) -> Result<NodeKey> {
        let bytes = rmp_serde::to_vec(id).map_err(|e| Error::KeyCodec(e.to_string()))?;
        Ok(NodeKey(SmallVec::from_vec(bytes)))
    }

    fn decode(&self, key: &NodeKey) -> Result<String> {
        rmp_serde::from_slice(key.as_bytes()).map_err(|e| Error::KeyCodec(e.to_string()))
    }
}

/// Keys that are the identifier's UTF-8 bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Utf8Codec;

impl KeyCodec for Utf8Codec {
    fn encode(&self, id: &str) -> Result<NodeKey> {
        Ok(NodeKey::from_bytes(id.as_bytes()))
    }

    fn decode(&self, key: &NodeKey) -> Result<String> {
        String::from_utf8(key.as_bytes().to_vec()).map_err(|e| Error::KeyCodec(e.to_string()))
    }
}

/// Something that names a node in a graph.
#[derive(Debug, Clone, Copy)]
pub enum NodeRef<'a> {
    /// A raw identifier, encoded before lookup.
    Id(&'a str),
    /// An already-encoded key.
    Key(&'a NodeKey),
    /// A node, looked up by the key it was registered under, or else its identity.
    Node(&'a Node),
}

impl NodeRef<'_> {
    /// Resolve into a key.
    pub fn resolve(&self, codec: &dyn KeyCodec) -> Result<NodeKey> {
        match self {
            NodeRef::Id(id) => codec.encode(id),
            NodeRef::Key(key) => Ok((*key).clone()),
            NodeRef::Node(node) => codec.encode(&node.identity()),
        }
    }
}

impl<'a> From<&'a str> for NodeRef<'a> {
    fn from(id: &'a str) -> Self {
        NodeRef::Id(id)
    }
}

impl<'a> From<&'a String> for NodeRef<'a> {
    fn from(id: &'a String) -> Self {
        NodeRef::Id(id)
    }
}

impl<'a> From<&'a NodeKey> for NodeRef<'a> {
    fn from(key: &'a NodeKey) -> Self {
        NodeRef::Key(key)
    }
}

impl<'a> From<&'a Node> for NodeRef<'a> {
    fn from(node: &'a Node) -> Self {
        NodeRef::Node(node)
    }
}
