//! # Key Selection and Partitioning
//!
//! Decides which lane an event is routed to.
//!
//! ## Design
//!
//! Routing is split into two injected strategies:
//!
//! 1. A [`KeySelector`] extracts an ordered key vector from a row image. It is
//!    called on both images of an update, so it must depend on the row only.
//! 2. A [`Partitioner`] maps `(lane_count, event, key)` to a lane, or to `None`
//!    for "no preference", which routes to lane 0.
//!
//! Both are plain traits with blanket impls for closures, so callers can pass
//! either a struct or a function.
//!
//! ## Hash Function
//!
//! [`HashPartitioner`] uses `FxHash` for consistent, fast hashing, reduced to a
//! lane via modulo: `lane = hash(key) % lane_count`.

use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};

use fxhash::FxHasher;
use serde_json::Value;

use crate::event::{ChangeEvent, KeyVector, Row};

/// Lane used when a partitioner expresses no preference.
pub const DEFAULT_LANE: usize = 0;

/// Extracts partition key values from a row image.
pub trait KeySelector: Send + Sync {
    /// Selects the key vector for `row` of `event`.
    ///
    /// Must be deterministic and return the same vector for equal rows,
    /// whichever image (before or after) the row came from.
    fn select(&self, event: &ChangeEvent, row: &Row) -> KeyVector;

    /// Converts selected key values back to their source representation
    /// before they are handed to the partitioner.
    fn to_origin_values(&self, key: KeyVector) -> KeyVector {
        key
    }
}

impl<F> KeySelector for F
where
    F: Fn(&ChangeEvent, &Row) -> KeyVector + Send + Sync,
{
    fn select(&self, event: &ChangeEvent, row: &Row) -> KeyVector {
        self(event, row)
    }
}

/// Maps an event and its key to a lane.
pub trait Partitioner: Send + Sync {
    /// Returns the lane for `event`, or `None` for no preference.
    fn partition(&self, lane_count: usize, event: &ChangeEvent, key: &KeyVector) -> Option<usize>;
}

impl<F> Partitioner for F
where
    F: Fn(usize, &ChangeEvent, &KeyVector) -> Option<usize> + Send + Sync,
{
    fn partition(&self, lane_count: usize, event: &ChangeEvent, key: &KeyVector) -> Option<usize> {
        self(lane_count, event, key)
    }
}

/// Resolves a partitioner's answer to a concrete lane.
///
/// `None` maps to [`DEFAULT_LANE`]; partitioners that want an even spread for
/// keyless events should return a lane themselves. Out-of-range answers wrap
/// around.
#[must_use]
pub fn resolve_lane(choice: Option<usize>, lane_count: usize) -> usize {
    match choice {
        None => DEFAULT_LANE,
        Some(lane) if lane < lane_count => lane,
        Some(lane) => {
            tracing::debug!(lane, lane_count, "partitioner returned out-of-range lane, wrapping");
            lane % lane_count
        }
    }
}

/// Selects named fields from the row, in order.
///
/// Missing fields select `null`, so rows lacking the key still route
/// deterministically.
#[derive(Debug, Clone)]
pub struct FieldKeySelector {
    fields: Vec<String>,
}

impl FieldKeySelector {
    /// Creates a selector over the given field names.
    ///
    /// # Panics
    ///
    /// Panics if `fields` is empty.
    #[must_use]
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let fields: Vec<String> = fields.into_iter().map(Into::into).collect();
        assert!(!fields.is_empty(), "at least one key field is required");
        Self { fields }
    }
}

impl KeySelector for FieldKeySelector {
    fn select(&self, _event: &ChangeEvent, row: &Row) -> KeyVector {
        self.fields
            .iter()
            .map(|field| row.get(field).cloned().unwrap_or(Value::Null))
            .collect()
    }
}

/// Routes by `FxHash` of the key vector.
///
/// An empty key vector has no preference and lands on the default lane.
#[derive(Debug, Clone, Copy, Default)]
pub struct HashPartitioner;

impl HashPartitioner {
    /// Hashes a key vector.
    #[must_use]
    pub fn hash_key(key: &KeyVector) -> u64 {
        let mut hasher = FxHasher::default();
        for value in key {
            hash_value(&mut hasher, value);
        }
        hasher.finish()
    }
}

impl Partitioner for HashPartitioner {
    #[allow(clippy::cast_possible_truncation)]
    fn partition(&self, lane_count: usize, _event: &ChangeEvent, key: &KeyVector) -> Option<usize> {
        if key.is_empty() || lane_count == 0 {
            return None;
        }
        // Truncation is fine, only the modulo matters.
        Some((Self::hash_key(key) as usize) % lane_count)
    }
}

/// Spreads events evenly across lanes, ignoring keys.
///
/// Only suitable when per-key ordering does not matter downstream.
#[derive(Debug, Default)]
pub struct RoundRobinPartitioner {
    counter: AtomicUsize,
}

impl RoundRobinPartitioner {
    /// Creates a round-robin partitioner starting at lane 0.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Partitioner for RoundRobinPartitioner {
    fn partition(&self, lane_count: usize, _event: &ChangeEvent, _key: &KeyVector) -> Option<usize> {
        if lane_count == 0 {
            return None;
        }
        Some(self.counter.fetch_add(1, Ordering::Relaxed) % lane_count)
    }
}

fn hash_value(hasher: &mut FxHasher, value: &Value) {
    match value {
        Value::Null => 0xDEAD_BEEF_u64.hash(hasher),
        Value::Bool(b) => {
            1u8.hash(hasher);
            b.hash(hasher);
        }
        Value::Number(n) => {
            2u8.hash(hasher);
            if let Some(i) = n.as_i64() {
                i.hash(hasher);
            } else if let Some(u) = n.as_u64() {
                u.hash(hasher);
            } else if let Some(f) = n.as_f64() {
                f.to_bits().hash(hasher);
            }
        }
        Value::String(s) => {
            3u8.hash(hasher);
            s.hash(hasher);
        }
        Value::Array(items) => {
            4u8.hash(hasher);
            items.len().hash(hasher);
            for item in items {
                hash_value(hasher, item);
            }
        }
        Value::Object(_) => {
            // serde_json keeps object keys ordered, so the rendering is stable.
            5u8.hash(hasher);
            value.to_string().hash(hasher);
        }
    }
}
