//! Hierarchical query keys.
//!
//! A [`QueryKey`] identifies a cached resource, e.g. `["marketplace", "user", "U123"]`.
//! Keys double as filters: a shorter key matches every key it is a prefix of,
//! which is how invalidation and realtime routing address whole families of
//! entries at once.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// A single scalar segment of a [`QueryKey`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeySegment {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl fmt::Display for KeySegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(i) => write!(f, "{}", i),
            Self::Str(s) => f.write_str(s),
        }
    }
}

impl From<&str> for KeySegment {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for KeySegment {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<&String> for KeySegment {
    fn from(value: &String) -> Self {
        Self::Str(value.clone())
    }
}

impl From<i64> for KeySegment {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for KeySegment {
    fn from(value: i32) -> Self {
        Self::Int(value as i64)
    }
}

impl From<bool> for KeySegment {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<uuid::Uuid> for KeySegment {
    fn from(value: uuid::Uuid) -> Self {
        Self::Str(value.to_string())
    }
}

/// Immutable, hierarchical identifier for a cached resource.
///
/// Equality and hashing are structural, so a `QueryKey` can be used directly
/// as a map key. [`QueryKey::matches`] implements prefix filtering.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryKey {
    segments: Vec<KeySegment>,
}

impl QueryKey {
    /// Build a key from anything that yields segments.
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<KeySegment>,
    {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    /// The empty key. As a filter it matches every key.
    pub fn root() -> Self {
        Self {
            segments: Vec::new(),
        }
    }

    pub fn segments(&self) -> &[KeySegment] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Return a new key with `segment` appended. The receiver is unchanged.
    pub fn child(&self, segment: impl Into<KeySegment>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self { segments }
    }

    /// Return the parent key, or `None` for the root.
    pub fn parent(&self) -> Option<Self> {
        if self.segments.is_empty() {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// True if every segment of `self` equals the corresponding segment of
    /// `other`, i.e. `self` is a prefix filter for `other`.
    pub fn matches(&self, other: &QueryKey) -> bool {
        self.segments.len() <= other.segments.len()
            && self
                .segments
                .iter()
                .zip(other.segments.iter())
                .all(|(a, b)| a == b)
    }

    /// Canonical text form used in logs and persisted snapshots.
    pub fn fingerprint(&self) -> String {
        serde_json::to_string(&self.segments).unwrap_or_else(|_| self.to_string())
    }

    /// Hex SHA-256 digest of the fingerprint. Safe to use as a file name.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.fingerprint().as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for segment in &self.segments {
            if !first {
                f.write_str("/")?;
            }
            write!(f, "{}", segment)?;
            first = false;
        }
        Ok(())
    }
}

impl<S: Into<KeySegment>> FromIterator<S> for QueryKey {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        Self::new(iter)
    }
}

impl<S: Into<KeySegment> + Clone, const N: usize> From<[S; N]> for QueryKey {
    fn from(value: [S; N]) -> Self {
        Self::new(value)
    }
}

/// Build a [`QueryKey`] from a list of segments.
///
/// ```
/// use stoop_core::query_key;
/// let key = query_key!["marketplace", "user", 42];
/// assert_eq!(key.len(), 3);
/// ```
#[macro_export]
macro_rules! query_key {
    () => {
        $crate::QueryKey::root()
    };
    ($($segment:expr),+ $(,)?) => {
        $crate::QueryKey::new(vec![$($crate::KeySegment::from($segment)),+])
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_prefix_matching() {
        let all = query_key!["marketplace"];
        let by_user = query_key!["marketplace", "user", "U123"];
        let other = query_key!["messages", "user", "U123"];

        assert!(all.matches(&by_user));
        assert!(by_user.matches(&by_user));
        assert!(!by_user.matches(&all));
        assert!(!all.matches(&other));
        assert!(QueryKey::root().matches(&other));
    }

    #[test]
    fn test_segment_types_are_distinct() {
        let a = query_key!["page", 1];
        let b = query_key!["page", "1"];
        assert_ne!(a, b);
        assert!(!a.matches(&b));
    }

    #[test]
    fn test_fingerprint_is_stable_json() {
        let key = query_key!["marketplace", "user", 7, true];
        assert_eq!(key.fingerprint(), r#"["marketplace","user",7,true]"#);
        let parsed: QueryKey = serde_json::from_str(&key.fingerprint()).unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn test_display_and_parent() {
        let key = query_key!["directory", "street", "elm"];
        assert_eq!(key.to_string(), "directory/street/elm");
        assert_eq!(key.parent(), Some(query_key!["directory", "street"]));
        assert_eq!(QueryKey::root().parent(), None);
        assert_eq!(query_key!["a"].child("b"), query_key!["a", "b"]);
    }

    #[test]
    fn test_digest_differs_per_key() {
        let a = query_key!["a"];
        let b = query_key!["b"];
        assert_eq!(a.digest().len(), 64);
        assert_ne!(a.digest(), b.digest());
    }

    proptest! {
        #[test]
        fn prop_every_prefix_matches(segments in proptest::collection::vec("[a-z]{1,6}", 0..6), cut in 0usize..6) {
            let key = QueryKey::new(segments.iter().map(String::as_str));
            let cut = cut.min(segments.len());
            let prefix = QueryKey::new(segments[..cut].iter().map(String::as_str));
            prop_assert!(prefix.matches(&key));
        }

        #[test]
        fn prop_matches_is_antisymmetric(a in proptest::collection::vec("[ab]", 0..4), b in proptest::collection::vec("[ab]", 0..4)) {
            let ka = QueryKey::new(a.iter().map(String::as_str));
            let kb = QueryKey::new(b.iter().map(String::as_str));
            if ka.matches(&kb) && kb.matches(&ka) {
                prop_assert_eq!(ka, kb);
            }
        }
    }
}
