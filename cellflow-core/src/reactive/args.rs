//! Dependency change arguments.
//!
//! `add_dependency` and `remove_dependency` accept several call shapes: a
//! single entry, a list of entries, a key with an entry, a map of keyed
//! entries, or a lone node whose identity doubles as its key. The shapes are
//! captured by [`DepArgs`] and [`DepTarget`] and applied to a [`Deps`]
//! structure here.

use indexmap::IndexMap;

use super::deps::{Dep, Deps};
use super::node::Node;
use crate::error::{Error, Result};

/// Entries to add to a dependency structure.
#[derive(Debug, Clone)]
pub enum DepArgs {
    /// Unkeyed entries. In a named structure every entry must be a node or
    /// source, whose identity becomes the key.
    Items(Vec<Dep>),
    /// Keyed entries. Only valid for named (or empty) structures.
    Named(IndexMap<String, Dep>),
}

impl From<Dep> for DepArgs {
    fn from(dep: Dep) -> Self {
        DepArgs::Items(vec![dep])
    }
}

impl From<Node> for DepArgs {
    fn from(node: Node) -> Self {
        DepArgs::Items(vec![Dep::Node(node)])
    }
}

impl From<&Node> for DepArgs {
    fn from(node: &Node) -> Self {
        DepArgs::Items(vec![Dep::from(node)])
    }
}

impl From<Vec<Dep>> for DepArgs {
    fn from(items: Vec<Dep>) -> Self {
        DepArgs::Items(items)
    }
}

impl From<Vec<Node>> for DepArgs {
    fn from(nodes: Vec<Node>) -> Self {
        DepArgs::Items(nodes.into_iter().map(Dep::Node).collect())
    }
}

impl<K: Into<String>, D: Into<Dep>> From<(K, D)> for DepArgs {
    fn from((key, dep): (K, D)) -> Self {
        DepArgs::Named(IndexMap::from([(key.into(), dep.into())]))
    }
}

impl From<IndexMap<String, Dep>> for DepArgs {
    fn from(entries: IndexMap<String, Dep>) -> Self {
        DepArgs::Named(entries)
    }
}

/// What to remove from a dependency structure.
#[derive(Debug, Clone)]
pub enum DepTarget {
    /// Every entry holding this node, however deeply nested.
    Node(Node),
    /// A key in a named structure, or a leaf identity in a positional one.
    Key(String),
    /// Several targets, removed in order.
    Many(Vec<DepTarget>),
}

impl DepTarget {
    fn describe(&self) -> String {
        match self {
            DepTarget::Node(node) => node.identity(),
            DepTarget::Key(key) => key.clone(),
            DepTarget::Many(targets) => targets
                .iter()
                .map(DepTarget::describe)
                .collect::<Vec<_>>()
                .join(", "),
        }
    }

    fn matches(&self, dep: &Dep) -> bool {
        match (self, dep) {
            (DepTarget::Node(node), Dep::Node(other)) => node == other,
            (DepTarget::Key(key), dep) => dep.leaf_identity().as_deref() == Some(key.as_str()),
            _ => false,
        }
    }
}

impl From<Node> for DepTarget {
    fn from(node: Node) -> Self {
        DepTarget::Node(node)
    }
}

impl From<&Node> for DepTarget {
    fn from(node: &Node) -> Self {
        DepTarget::Node(node.clone())
    }
}

impl From<&str> for DepTarget {
    fn from(key: &str) -> Self {
        DepTarget::Key(key.to_string())
    }
}

impl From<String> for DepTarget {
    fn from(key: String) -> Self {
        DepTarget::Key(key)
    }
}

impl From<Vec<Node>> for DepTarget {
    fn from(nodes: Vec<Node>) -> Self {
        DepTarget::Many(nodes.into_iter().map(DepTarget::Node).collect())
    }
}

impl From<Vec<DepTarget>> for DepTarget {
    fn from(targets: Vec<DepTarget>) -> Self {
        DepTarget::Many(targets)
    }
}

/// Add entries, keeping the structure's shape.
pub(crate) fn add_entries(deps: Deps, args: DepArgs) -> Result<Deps> {
    let empty = match &args {
        DepArgs::Items(items) => items.is_empty(),
        DepArgs::Named(entries) => entries.is_empty(),
    };
    if empty {
        return Err(Error::InvalidDependencyArgs("no dependencies given".into()));
    }

    match (deps, args) {
        (Deps::None, DepArgs::Items(items)) => Ok(Deps::List(canonical_items(items))),
        (Deps::None, DepArgs::Named(entries)) => Ok(Deps::Map(canonical_entries(entries))),
        (Deps::List(mut list), DepArgs::Items(items)) => {
            list.extend(canonical_items(items));
            Ok(Deps::List(list))
        }
        (Deps::List(_), DepArgs::Named(_)) => Err(Error::InvalidDependencyArgs(
            "positional dependencies cannot take keyed entries".into(),
        )),
        (Deps::Map(mut map), DepArgs::Named(entries)) => {
            map.extend(canonical_entries(entries));
            Ok(Deps::Map(map))
        }
        (Deps::Map(mut map), DepArgs::Items(items)) => {
            for item in items {
                let key = item.leaf_identity().ok_or_else(|| {
                    Error::InvalidDependencyArgs(format!(
                        "named dependencies need a key for {item:?}"
                    ))
                })?;
                map.insert(key, item.canonical());
            }
            Ok(Deps::Map(map))
        }
    }
}

/// Remove entries, failing if a target matches nothing.
///
/// Matching leaves are removed at any depth. A key target also removes the
/// top-level entry stored under that key.
pub(crate) fn remove_entries(deps: Deps, target: &DepTarget) -> Result<Deps> {
    if let DepTarget::Many(targets) = target {
        return targets.iter().try_fold(deps, remove_entries);
    }

    let not_found = || Error::DependencyNotFound(target.describe());
    match deps {
        Deps::None => Err(not_found()),
        Deps::List(mut list) => match prune_list(&mut list, target) {
            0 => Err(not_found()),
            _ => Ok(Deps::List(list)),
        },
        Deps::Map(mut map) => {
            let mut removed = 0;
            if let DepTarget::Key(key) = target {
                removed += usize::from(map.shift_remove(key).is_some());
            }
            removed += prune_map(&mut map, target);
            match removed {
                0 => Err(not_found()),
                _ => Ok(Deps::Map(map)),
            }
        }
    }
}

fn prune_list(items: &mut Vec<Dep>, target: &DepTarget) -> usize {
    let before = items.len();
    items.retain(|dep| !target.matches(dep));
    let removed = before - items.len();
    removed + items.iter_mut().map(|dep| prune_nested(dep, target)).sum::<usize>()
}

fn prune_map(map: &mut IndexMap<String, Dep>, target: &DepTarget) -> usize {
    let before = map.len();
    map.retain(|_, dep| !target.matches(dep));
    let removed = before - map.len();
    removed + map.values_mut().map(|dep| prune_nested(dep, target)).sum::<usize>()
}

fn prune_nested(dep: &mut Dep, target: &DepTarget) -> usize {
    match dep {
        Dep::List(items) => prune_list(items, target),
        Dep::Map(map) => prune_map(map, target),
        _ => 0,
    }
}

fn canonical_items(items: Vec<Dep>) -> Vec<Dep> {
    items.into_iter().map(Dep::canonical).collect()
}

fn canonical_entries(entries: IndexMap<String, Dep>) -> IndexMap<String, Dep> {
    entries
        .into_iter()
        .map(|(k, d)| (k, d.canonical()))
        .collect()
}
