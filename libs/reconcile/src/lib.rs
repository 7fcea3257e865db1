//! Desired-set reconciliation primitives.
//!
//! Route definitions carry no surrogate key: a route *is* its full value. This
//! library provides the helpers used to converge on such value-identified sets:
//!
//! - **Set diffing**: which members appeared and which disappeared between two
//!   snapshots of the same source.
//! - **Deduplication**: snapshots have set semantics, so repeated members
//!   collapse to the first occurrence.
//! - **Fingerprints**: a short, deterministic content hash used to name a
//!   value in logs and task identifiers.
//!
//! # Invariants
//!
//! - Diffing the same snapshot against itself yields no changes
//! - Output order follows input order (deterministic given the same inputs)
//! - Fingerprints ignore map key order

use std::collections::HashSet;
use std::hash::Hash;
use std::time::Duration;

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Default interval between reconciliation passes.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(10);

/// Changes between a previous and a current snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetDiff<T> {
    /// Members of the current snapshot with no equal member in the previous one.
    pub added: Vec<T>,

    /// Members of the previous snapshot with no equal member in the current one.
    pub removed: Vec<T>,
}

impl<T> SetDiff<T> {
    /// Returns true if nothing changed.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    /// Total number of changes.
    pub fn len(&self) -> usize {
        self.added.len() + self.removed.len()
    }
}

impl<T> Default for SetDiff<T> {
    fn default() -> Self {
        Self {
            added: Vec::new(),
            removed: Vec::new(),
        }
    }
}

/// Compute the difference between two snapshots using full value equality.
///
/// `added` keeps the order of `current`, `removed` keeps the order of
/// `previous`. Duplicates in either input are reported once.
pub fn diff_sets<T>(previous: &[T], current: &[T]) -> SetDiff<T>
where
    T: Eq + Hash + Clone,
{
    let previous_set: HashSet<&T> = previous.iter().collect();
    let current_set: HashSet<&T> = current.iter().collect();

    let added = dedup_preserving_order(
        current
            .iter()
            .filter(|item| !previous_set.contains(item))
            .cloned(),
    );
    let removed = dedup_preserving_order(
        previous
            .iter()
            .filter(|item| !current_set.contains(item))
            .cloned(),
    );

    SetDiff { added, removed }
}

/// Collapse equal members, keeping the first occurrence of each.
pub fn dedup_preserving_order<T, I>(items: I) -> Vec<T>
where
    T: Eq + Hash + Clone,
    I: IntoIterator<Item = T>,
{
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for item in items {
        if seen.insert(item.clone()) {
            out.push(item);
        }
    }
    out
}

/// A content fingerprint for deterministic naming.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint a JSON value through its canonical form.
    pub fn from_json(json: &serde_json::Value) -> Self {
        let canonical = canonical_json(json);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let result = hasher.finalize();
        Self(format!("sha256:{}", hex::encode(&result[..8]))) // First 8 bytes
    }

    /// Fingerprint any serializable value.
    ///
    /// Values that fail to serialize (non-string map keys, for instance)
    /// fingerprint as JSON `null`.
    pub fn of<T: Serialize>(value: &T) -> Self {
        let json = serde_json::to_value(value).unwrap_or(serde_json::Value::Null);
        Self::from_json(&json)
    }

    /// Get the fingerprint string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Produce canonical JSON (sorted keys, no extra whitespace).
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("{}:{}", quote(k), canonical_json(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        serde_json::Value::String(s) => quote(s),
        other => other.to_string(),
    }
}

fn quote(s: &str) -> String {
    // Serializing a plain string cannot fail.
    serde_json::to_string(s).unwrap_or_default()
}
