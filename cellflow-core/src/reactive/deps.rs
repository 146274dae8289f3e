//! Dependency Structures
//!
//! A computed node declares its inputs as a [`Dep`]: a single node, a list,
//! a named map, nested combinations of those, external push-sources, nullary
//! functions or plain static values. Before use the declaration is normalized into a
//! [`Deps`] structure, which is always empty, a positional list or a named
//! map.
//!
//! Three operations work over a normalized structure:
//!
//! - [`normalize`] canonicalizes the shape.
//! - [`extract_sources`] collects the reactive leaves a node must subscribe to.
//! - [`read_values`] produces a same-shaped [`Inputs`] snapshot, calling every
//!   thunk leaf afresh.

use std::collections::HashSet;
use std::fmt;
use std::ops::Index;
use std::rc::Rc;

use indexmap::IndexMap;
use serde_json::Value;

use super::node::Node;
use super::source::ReactiveSource;

static NULL: Value = Value::Null;

/// A nullary function re-invoked on every read.
pub type Thunk = Rc<dyn Fn() -> Value>;

/// One entry of a dependency declaration.
#[derive(Clone)]
pub enum Dep {
    /// Another node.
    Node(Node),
    /// A foreign push-source.
    Source(Rc<dyn ReactiveSource>),
    /// A function pulled on demand.
    Thunk(Thunk),
    /// Plain data.
    Static(Value),
    /// Positional nesting.
    List(Vec<Dep>),
    /// Named nesting.
    Map(IndexMap<String, Dep>),
}

impl Dep {
    /// Wrap a function that is called each time the dependency is read.
    pub fn thunk<F>(f: F) -> Self
    where
        F: Fn() -> Value + 'static,
    {
        Dep::Thunk(Rc::new(f))
    }

    /// Wrap a foreign push-source.
    pub fn source<S>(source: S) -> Self
    where
        S: ReactiveSource + 'static,
    {
        Dep::Source(Rc::new(source))
    }

    /// Build a positional dependency list.
    pub fn list<I, D>(items: I) -> Self
    where
        I: IntoIterator<Item = D>,
        D: Into<Dep>,
    {
        Dep::List(items.into_iter().map(Into::into).collect())
    }

    /// Build a named dependency map.
    pub fn named<I, K, D>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, D)>,
        K: Into<String>,
        D: Into<Dep>,
    {
        Dep::Map(
            entries
                .into_iter()
                .map(|(k, d)| (k.into(), d.into()))
                .collect(),
        )
    }

    /// The node held by this entry, if it is a node leaf.
    pub fn as_node(&self) -> Option<&Node> {
        match self {
            Dep::Node(node) => Some(node),
            _ => None,
        }
    }

    /// Identity of a node or source leaf.
    pub(crate) fn leaf_identity(&self) -> Option<String> {
        match self {
            Dep::Node(node) => Some(node.identity()),
            Dep::Source(source) => Some(source.identity()),
            _ => None,
        }
    }

    /// Canonicalize a single entry, expanding static containers.
    pub(crate) fn canonical(self) -> Dep {
        match self {
            Dep::Static(Value::Array(items)) => {
                Dep::List(items.into_iter().map(|v| Dep::Static(v).canonical()).collect())
            }
            Dep::Static(Value::Object(map)) => Dep::Map(
                map.into_iter()
                    .map(|(k, v)| (k, Dep::Static(v).canonical()))
                    .collect(),
            ),
            Dep::List(items) => Dep::List(items.into_iter().map(Dep::canonical).collect()),
            Dep::Map(map) => Dep::Map(map.into_iter().map(|(k, d)| (k, d.canonical())).collect()),
            leaf => leaf,
        }
    }
}

impl fmt::Debug for Dep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dep::Node(node) => write!(f, "Node({})", node.identity()),
            Dep::Source(source) => write!(f, "Source({})", source.identity()),
            Dep::Thunk(_) => f.write_str("Thunk"),
            Dep::Static(value) => write!(f, "Static({value})"),
            Dep::List(items) => f.debug_list().entries(items).finish(),
            Dep::Map(map) => f.debug_map().entries(map).finish(),
        }
    }
}

impl From<Node> for Dep {
    fn from(node: Node) -> Self {
        Dep::Node(node)
    }
}

impl From<&Node> for Dep {
    fn from(node: &Node) -> Self {
        Dep::Node(node.clone())
    }
}

impl From<Value> for Dep {
    fn from(value: Value) -> Self {
        Dep::Static(value)
    }
}

impl From<Rc<dyn ReactiveSource>> for Dep {
    fn from(source: Rc<dyn ReactiveSource>) -> Self {
        Dep::Source(source)
    }
}

impl<T: Into<Dep>> From<Vec<T>> for Dep {
    fn from(items: Vec<T>) -> Self {
        Dep::list(items)
    }
}

impl<T: Into<Dep>, const N: usize> From<[T; N]> for Dep {
    fn from(items: [T; N]) -> Self {
        Dep::list(items)
    }
}

impl<T: Into<Dep>> From<IndexMap<String, T>> for Dep {
    fn from(map: IndexMap<String, T>) -> Self {
        Dep::named(map)
    }
}

/// A normalized dependency structure.
#[derive(Clone, Debug, Default)]
pub enum Deps {
    /// No dependencies.
    #[default]
    None,
    /// Positional dependencies.
    List(Vec<Dep>),
    /// Named dependencies.
    Map(IndexMap<String, Dep>),
}

impl Deps {
    /// Number of top-level entries.
    pub fn len(&self) -> usize {
        match self {
            Deps::None => 0,
            Deps::List(items) => items.len(),
            Deps::Map(map) => map.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate over the top-level entries.
    pub fn entries(&self) -> Box<dyn Iterator<Item = &Dep> + '_> {
        match self {
            Deps::None => Box::new(std::iter::empty()),
            Deps::List(items) => Box::new(items.iter()),
            Deps::Map(map) => Box::new(map.values()),
        }
    }
}

/// Canonicalize a raw dependency declaration.
///
/// Lists stay lists and maps stay maps. A lone leaf becomes a one-element
/// list and a top-level `null` means "no dependencies".
pub fn normalize(dep: impl Into<Dep>) -> Deps {
    match dep.into().canonical() {
        Dep::Static(Value::Null) => Deps::None,
        Dep::List(items) => Deps::List(items),
        Dep::Map(map) => Deps::Map(map),
        leaf => Deps::List(vec![leaf]),
    }
}

/// A reactive leaf found inside a dependency structure.
#[derive(Clone)]
pub enum SourceLeaf {
    Node(Node),
    Source(Rc<dyn ReactiveSource>),
}

impl SourceLeaf {
    pub fn identity(&self) -> String {
        match self {
            SourceLeaf::Node(node) => node.identity(),
            SourceLeaf::Source(source) => source.identity(),
        }
    }

    fn address(&self) -> *const () {
        match self {
            SourceLeaf::Node(node) => node.as_ptr(),
            SourceLeaf::Source(source) => Rc::as_ptr(source) as *const (),
        }
    }

    /// Borrow the leaf as a subscribable source.
    pub fn as_source(&self) -> &dyn ReactiveSource {
        match self {
            SourceLeaf::Node(node) => node,
            SourceLeaf::Source(source) => source.as_ref(),
        }
    }
}

impl fmt::Debug for SourceLeaf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceLeaf::Node(node) => write!(f, "Node({})", node.identity()),
            SourceLeaf::Source(source) => write!(f, "Source({})", source.identity()),
        }
    }
}

/// Collect every node and source leaf, de-duplicated by identity, in
/// first-seen order.
pub fn extract_sources(deps: &Deps) -> Vec<SourceLeaf> {
    fn walk(dep: &Dep, seen: &mut HashSet<*const ()>, out: &mut Vec<SourceLeaf>) {
        let leaf = match dep {
            Dep::Node(node) => SourceLeaf::Node(node.clone()),
            Dep::Source(source) => SourceLeaf::Source(Rc::clone(source)),
            Dep::List(items) => {
                items.iter().for_each(|d| walk(d, seen, out));
                return;
            }
            Dep::Map(map) => {
                map.values().for_each(|d| walk(d, seen, out));
                return;
            }
            Dep::Thunk(_) | Dep::Static(_) => return,
        };
        if seen.insert(leaf.address()) {
            out.push(leaf);
        }
    }

    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for dep in deps.entries() {
        walk(dep, &mut seen, &mut out);
    }
    out
}

fn read_dep(dep: &Dep) -> Value {
    match dep {
        Dep::Node(node) => node.value().unwrap_or(Value::Null),
        Dep::Source(source) => source.current_value().unwrap_or(Value::Null),
        Dep::Thunk(f) => f(),
        Dep::Static(value) => value.clone(),
        Dep::List(items) => Value::Array(items.iter().map(read_dep).collect()),
        Dep::Map(map) => Value::Object(map.iter().map(|(k, d)| (k.clone(), read_dep(d))).collect()),
    }
}

/// Snapshot the current values of a dependency structure.
pub fn read_values(deps: &Deps) -> Inputs {
    match deps {
        Deps::None => Inputs::None,
        Deps::List(items) => Inputs::Positional(items.iter().map(read_dep).collect()),
        Deps::Map(map) => Inputs::Named(map.iter().map(|(k, d)| (k.clone(), read_dep(d))).collect()),
    }
}

/// The single structured argument every evaluator receives.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Inputs {
    #[default]
    None,
    Positional(Vec<Value>),
    Named(IndexMap<String, Value>),
}

impl Inputs {
    /// Positional value at `index`.
    pub fn get(&self, index: usize) -> Option<&Value> {
        match self {
            Inputs::Positional(values) => values.get(index),
            _ => None,
        }
    }

    /// Named value for `key`.
    pub fn named(&self, key: &str) -> Option<&Value> {
        match self {
            Inputs::Named(values) => values.get(key),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Inputs::None => 0,
            Inputs::Positional(values) => values.len(),
            Inputs::Named(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate over the values in declaration order.
    pub fn values(&self) -> Box<dyn Iterator<Item = &Value> + '_> {
        match self {
            Inputs::None => Box::new(std::iter::empty()),
            Inputs::Positional(values) => Box::new(values.iter()),
            Inputs::Named(values) => Box::new(values.values()),
        }
    }

    /// Convert into a JSON value (`null`, array or object).
    pub fn to_value(&self) -> Value {
        match self {
            Inputs::None => Value::Null,
            Inputs::Positional(values) => Value::Array(values.clone()),
            Inputs::Named(values) => Value::Object(
                values.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            ),
        }
    }
}

impl Index<usize> for Inputs {
    type Output = Value;

    fn index(&self, index: usize) -> &Value {
        self.get(index).unwrap_or(&NULL)
    }
}

impl Index<&str> for Inputs {
    type Output = Value;

    fn index(&self, key: &str) -> &Value {
        self.named(key).unwrap_or(&NULL)
    }
}
