//! Structured keys and their canonical hashes.
//!
//! A key is an ordered list of JSON segments. Its identity is a canonical JSON
//! string in which object members are sorted by name, so two keys that are
//! deeply equal (ignoring member order) always address the same cache entry.
//!
//! ```
//! use query_engine::query_key;
//!
//! let a = query_key!["todo", { "id": 1, "done": false }];
//! let b = query_key!["todo", { "done": false, "id": 1 }];
//! assert_eq!(a.hash(), b.hash());
//! assert_eq!(a.hash(), r#"["todo",{"done":false,"id":1}]"#);
//! ```

use std::fmt::{self, Write as _};
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An ordered sequence of JSON-serializable segments identifying a query.
///
/// Mutations reuse the same type for their optional filter key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryKey(Vec<Value>);

/// Keys used to tag mutations for filtering.
pub type MutationKey = QueryKey;

impl QueryKey {
    #[must_use]
    pub const fn new(segments: Vec<Value>) -> Self {
        Self(segments)
    }

    #[must_use]
    pub fn segments(&self) -> &[Value] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Canonical identity string of this key.
    #[must_use]
    pub fn hash(&self) -> String {
        hash_key(self)
    }

    /// Returns `true` if `prefix` matches the leading segments of this key.
    #[must_use]
    pub fn starts_with(&self, prefix: &Self) -> bool {
        partial_match_key(self, prefix)
    }
}

impl Hash for QueryKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        hash_key(self).hash(state);
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hash_key(self))
    }
}

impl From<Vec<Value>> for QueryKey {
    fn from(segments: Vec<Value>) -> Self {
        Self(segments)
    }
}

impl From<&str> for QueryKey {
    fn from(segment: &str) -> Self {
        Self(vec![Value::from(segment)])
    }
}

impl From<String> for QueryKey {
    fn from(segment: String) -> Self {
        Self(vec![Value::from(segment)])
    }
}

/// Serializes `key` into its canonical identity string.
///
/// Object members are written in lexicographic order, arrays keep their order.
#[must_use]
pub fn hash_key(key: &QueryKey) -> String {
    let mut out = String::with_capacity(16 * key.len() + 2);
    out.push('[');
    for (index, segment) in key.0.iter().enumerate() {
        if index > 0 {
            out.push(',');
        }
        write_canonical(segment, &mut out);
    }
    out.push(']');
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(members) => {
            let mut names: Vec<&String> = members.keys().collect();
            names.sort();
            out.push('{');
            for (index, name) in names.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                // Writing into a String cannot fail.
                let _ = write!(out, "{}:", Value::from(name.as_str()));
                if let Some(member) = members.get(name) {
                    write_canonical(member, out);
                }
            }
            out.push('}');
        }
        scalar => {
            let _ = write!(out, "{scalar}");
        }
    }
}

/// Prefix match used by filters.
///
/// Every segment of `filter` must deep-equal the segment at the same position
/// in `candidate`; `candidate` may have additional trailing segments.
#[must_use]
pub fn partial_match_key(candidate: &QueryKey, filter: &QueryKey) -> bool {
    filter.len() <= candidate.len()
        && filter
            .0
            .iter()
            .zip(&candidate.0)
            .all(|(expected, actual)| crate::utils::deep_equal(expected, actual))
}

/// Builds a [`QueryKey`] from JSON-literal segments.
///
/// Each segment accepts anything [`serde_json::json!`] accepts as a single
/// token tree: literals, identifiers, `{...}` objects and `[...]` arrays.
/// Wrap other expressions in parentheses.
#[macro_export]
macro_rules! query_key {
    () => {
        $crate::key::QueryKey::default()
    };
    ($($segment:tt),+ $(,)?) => {
        $crate::key::QueryKey::new(vec![$($crate::__serde_json::json!($segment)),+])
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hash_is_order_independent_for_objects() {
        let a = QueryKey::new(vec![json!("todos"), json!({"page": 1, "filter": "all"})]);
        let b = QueryKey::new(vec![json!("todos"), json!({"filter": "all", "page": 1})]);
        assert_eq!(hash_key(&a), hash_key(&b));
        assert_eq!(a, b);
    }

    #[test]
    fn test_hash_keeps_array_order() {
        let a = query_key![[1, 2]];
        let b = query_key![[2, 1]];
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn test_hash_nested_objects_sorted() {
        let key = query_key![{"z": {"b": 1, "a": [ {"d": 1, "c": 2} ]}}];
        assert_eq!(key.hash(), r#"[{"z":{"a":[{"c":2,"d":1}],"b":1}}]"#);
    }

    #[test]
    fn test_hash_escapes_strings() {
        let key = query_key!["with \"quotes\""];
        assert_eq!(key.hash(), r#"["with \"quotes\""]"#);
    }

    #[test]
    fn test_hash_distinguishes_types() {
        assert_ne!(query_key![1].hash(), query_key!["1"].hash());
        assert_ne!(query_key![null].hash(), query_key![].hash());
    }

    #[test]
    fn test_partial_match_prefix() {
        let candidate = query_key!["todos", {"page": 1}, "extra"];
        assert!(partial_match_key(&candidate, &query_key!["todos"]));
        assert!(partial_match_key(&candidate, &query_key!["todos", {"page": 1}]));
        assert!(partial_match_key(&candidate, &query_key![]));
        assert!(!partial_match_key(&candidate, &query_key!["posts"]));
        assert!(!partial_match_key(&candidate, &query_key!["todos", {"page": 2}]));
    }

    #[test]
    fn test_partial_match_requires_full_segment_equality() {
        let candidate = query_key!["todos", {"page": 1, "size": 10}];
        assert!(!partial_match_key(&candidate, &query_key!["todos", {"page": 1}]));
    }

    #[test]
    fn test_partial_match_longer_filter() {
        let candidate = query_key!["todos"];
        assert!(!partial_match_key(&candidate, &query_key!["todos", 1]));
    }

    #[test]
    fn test_key_hash_trait_consistency() {
        use std::collections::HashSet;

        let mut set = HashSet::new();
        set.insert(query_key!["a", {"x": 1, "y": 2}]);
        assert!(set.contains(&query_key!["a", {"y": 2, "x": 1}]));
    }

    #[test]
    fn test_key_serde_transparent() {
        let key = query_key!["todo", 1];
        let json = serde_json::to_string(&key).expect("key should serialize");
        assert_eq!(json, r#"["todo",1]"#);
        let back: QueryKey = serde_json::from_str(&json).expect("key should deserialize");
        assert_eq!(back, key);
    }
}
