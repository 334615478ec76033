//! Immutable configuration snapshots and the atomic store holding the current one.

use crate::core::key;
use crate::error::{ConfigError, Result};
use crate::value::Value;
use arc_swap::ArcSwap;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// One immutable, fully-formed configuration state.
///
/// A snapshot is never mutated after it is published. Mutations build a new
/// candidate snapshot from the current one and swap it in wholesale, so a
/// reader holding an `Arc<Snapshot>` keeps a consistent view for as long as it
/// likes.
///
/// # Examples
///
/// ```rust
/// use hotswap_store::core::Snapshot;
/// use hotswap_store::value::Value;
///
/// let snapshot = Snapshot::from_value(Value::from_iter([(
///     "server",
///     Value::from_iter([("port", 8080)]),
/// )]))
/// .unwrap();
///
/// assert_eq!(snapshot.get("server.port"), Some(&Value::Integer(8080)));
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    root: BTreeMap<String, Value>,
}

impl Snapshot {
    /// Create an empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a snapshot from an already-decoded tree.
    ///
    /// The root must be a mapping (or `Null`, which yields an empty snapshot).
    /// Dotted keys inside the tree are expanded into nested paths.
    pub fn from_value(value: Value) -> Result<Self> {
        match normalize(value) {
            Value::Map(root) => Ok(Self { root }),
            Value::Null => Ok(Self::new()),
            other => Err(ConfigError::LoadError(format!(
                "configuration root must be a mapping, found {}",
                other.type_name()
            ))),
        }
    }

    /// Look up a dot-path key. Malformed keys never match.
    pub fn get(&self, key: &str) -> Option<&Value> {
        let segments = key::segments(key).ok()?;
        let (first, rest) = segments.split_first()?;
        let mut node = self.root.get(*first)?;
        for segment in rest {
            node = node.as_map()?.get(*segment)?;
        }
        Some(node)
    }

    /// Returns `true` if the key resolves to a value.
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Number of top-level entries.
    pub fn len(&self) -> usize {
        self.root.len()
    }

    /// Returns `true` if there are no entries.
    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Iterate over the top-level keys in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.root.keys().map(String::as_str)
    }

    /// Borrow the top-level mapping.
    pub fn as_map(&self) -> &BTreeMap<String, Value> {
        &self.root
    }

    /// Copy the whole tree into a [`Value::Map`].
    pub fn to_value(&self) -> Value {
        Value::Map(self.root.clone())
    }

    /// Flatten into a map keyed by every dot path, intermediate and leaf alike.
    pub fn flatten(&self) -> HashMap<String, Value> {
        let mut out = HashMap::new();
        for (key, value) in &self.root {
            value.flatten_into(key, &mut out);
        }
        out
    }

    /// Build a candidate with `key` replaced by `value`.
    ///
    /// Whatever was stored at `key` (leaf or subtree) is dropped first; a leaf
    /// sitting on a prefix of `key` is turned into a mapping. Mapping values are
    /// merged entry by entry so their sub-paths are addressable directly.
    pub(crate) fn with_value(&self, key: &str, value: impl Into<Value>) -> Result<Self> {
        let segments = key::segments(key)?;
        let mut root = self.root.clone();
        insert_path(&mut root, &segments, normalize(value.into()));
        Ok(Self { root })
    }

    /// Build a candidate with `key` and its subtree removed.
    pub(crate) fn without(&self, key: &str) -> Result<Self> {
        let segments = key::segments(key)?;
        let mut root = self.root.clone();
        remove_path(&mut root, &segments);
        Ok(Self { root })
    }

    /// A snapshot holding only the given field group.
    pub(crate) fn group(&self, group: &str) -> Self {
        let root = self
            .root
            .get(group)
            .map(|value| BTreeMap::from([(group.to_string(), value.clone())]))
            .unwrap_or_default();
        Self { root }
    }
}

fn insert_path(root: &mut BTreeMap<String, Value>, segments: &[&str], value: Value) {
    let Some((last, parents)) = segments.split_last() else {
        return;
    };

    let mut node = root;
    for segment in parents {
        let entry = node
            .entry((*segment).to_string())
            .or_insert_with(Value::map);
        if !matches!(entry, Value::Map(_)) {
            *entry = Value::map();
        }
        node = match entry {
            Value::Map(next) => next,
            _ => return,
        };
    }

    node.remove(*last);
    node.insert((*last).to_string(), value);
}

fn remove_path(root: &mut BTreeMap<String, Value>, segments: &[&str]) -> Option<Value> {
    let (last, parents) = segments.split_last()?;
    let mut node = root;
    for segment in parents {
        node = match node.get_mut(*segment)? {
            Value::Map(next) => next,
            _ => return None,
        };
    }
    node.remove(*last)
}

/// Expand dotted map keys into nested mappings, recursively.
fn normalize(value: Value) -> Value {
    match value {
        Value::Map(map) => {
            let mut out = BTreeMap::new();
            for (key, child) in map {
                let segments: Vec<&str> = key.split('.').filter(|s| !s.is_empty()).collect();
                if segments.is_empty() {
                    continue;
                }
                let child = normalize(child);
                if segments.len() == 1 {
                    // Merge so `{"b": {..}, "b.c": ..}` style inputs keep both halves.
                    match out.get_mut(segments[0]) {
                        Some(existing @ Value::Map(_)) => existing.merge(child),
                        _ => {
                            out.insert(segments[0].to_string(), child);
                        }
                    }
                } else {
                    insert_path(&mut out, &segments, child);
                }
            }
            Value::Map(out)
        }
        Value::List(items) => Value::List(items.into_iter().map(normalize).collect()),
        other => other,
    }
}

/// Holds the current [`Snapshot`] behind an atomic reference.
///
/// `load` never blocks; `replace` is a single pointer swap, so concurrent
/// readers see either the old or the new snapshot in full.
pub(crate) struct ValueStore {
    current: ArcSwap<Snapshot>,
}

impl ValueStore {
    pub(crate) fn new(initial: Snapshot) -> Self {
        Self {
            current: ArcSwap::from_pointee(initial),
        }
    }

    /// Current snapshot.
    pub(crate) fn load(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }

    /// Install `next`, returning the snapshot it replaced.
    pub(crate) fn replace(&self, next: Arc<Snapshot>) -> Arc<Snapshot> {
        self.current.swap(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Snapshot {
        Snapshot::from_value(Value::from_iter([
            (
                "a",
                Value::from_iter([
                    ("b", Value::from_iter([("e", 5)])),
                    ("z", Value::from("keep")),
                ]),
            ),
            ("server", Value::from_iter([("port", 8080)])),
        ]))
        .unwrap()
    }

    #[test]
    fn test_get_paths() {
        let snapshot = sample();
        assert_eq!(snapshot.get("server.port"), Some(&Value::Integer(8080)));
        assert!(snapshot.get("a.b").unwrap().as_map().is_some());
        assert!(snapshot.get("server.port.x").is_none());
        assert!(snapshot.get("missing").is_none());
        assert!(snapshot.get("").is_none());
    }

    #[test]
    fn test_prefix_replacement() {
        let next = sample()
            .with_value("a.b", Value::from_iter([("c", 1), ("d", 2)]))
            .unwrap();

        assert_eq!(next.get("a.b.c"), Some(&Value::Integer(1)));
        assert_eq!(next.get("a.b.d"), Some(&Value::Integer(2)));
        assert!(next.get("a.b.e").is_none());
        assert_eq!(next.get("a.z"), Some(&Value::from("keep")));
    }

    #[test]
    fn test_leaf_over_subtree_and_back() {
        let leaf = sample().with_value("a.b", 7).unwrap();
        assert_eq!(leaf.get("a.b"), Some(&Value::Integer(7)));
        assert!(leaf.get("a.b.e").is_none());

        let tree = leaf.with_value("a.b.c", 1).unwrap();
        assert_eq!(tree.get("a.b.c"), Some(&Value::Integer(1)));
        assert!(tree.get("a.b").unwrap().as_map().is_some());
    }

    #[test]
    fn test_dotted_keys_inside_value_expand() {
        let next = Snapshot::new()
            .with_value("db", Value::from_iter([("pool.size", 4), ("host", 1)]))
            .unwrap();
        assert_eq!(next.get("db.pool.size"), Some(&Value::Integer(4)));
        assert_eq!(next.get("db.host"), Some(&Value::Integer(1)));
    }

    #[test]
    fn test_with_value_is_pure() {
        let original = sample();
        let _ = original.with_value("server.port", 9090).unwrap();
        assert_eq!(original.get("server.port"), Some(&Value::Integer(8080)));
    }

    #[test]
    fn test_without() {
        let next = sample().without("a.b").unwrap();
        assert!(next.get("a.b").is_none());
        assert!(next.get("a.z").is_some());

        let unchanged = sample().without("nope.x").unwrap();
        assert_eq!(unchanged, sample());
    }

    #[test]
    fn test_group() {
        let group = sample().group("a");
        assert_eq!(group.len(), 1);
        assert!(group.get("a.z").is_some());
        assert!(group.get("server.port").is_none());
        assert!(sample().group("missing").is_empty());
    }

    #[test]
    fn test_invalid_key_rejected() {
        assert!(sample().with_value("a..b", 1).is_err());
        assert!(sample().without("").is_err());
    }

    #[test]
    fn test_root_must_be_map() {
        assert!(Snapshot::from_value(Value::from(3)).is_err());
        assert!(Snapshot::from_value(Value::Null).unwrap().is_empty());
    }

    #[test]
    fn test_value_store_swap() {
        let store = ValueStore::new(sample());
        let before = store.load();
        let next = Arc::new(before.with_value("server.port", 1).unwrap());

        let previous = store.replace(next);
        assert_eq!(previous.get("server.port"), Some(&Value::Integer(8080)));
        assert_eq!(store.load().get("server.port"), Some(&Value::Integer(1)));
        // Old readers keep their view.
        assert_eq!(before.get("server.port"), Some(&Value::Integer(8080)));
    }
}
