//! Dirty-tracking property bag.
//!
//! Every entity's mutable state lives in one of these: a map of dotted
//! store keys (`"taskCounts.running"`, `"metrics"`) to JSON values. A `set`
//! of a key that already holds a *different* value is refused unless the
//! caller explicitly allows the overwrite; this is the engine's first line
//! of defense against events arriving out of causal order.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

/// A key is being set to a second, different value without an explicit
/// overwrite.
#[derive(Debug, Error)]
#[error("refusing to overwrite {key} on {entity}: {current} -> {proposed}")]
pub struct ConflictError {
    pub entity: String,
    pub key: String,
    pub current: Value,
    pub proposed: Value,
}

/// Pending mutations drained from a bag for one flush cycle.
#[derive(Debug, Default)]
pub struct PendingWrite {
    pub set: HashMap<String, Value>,
    pub unset: Vec<String>,
}

pub struct StateBag {
    label: Arc<str>,
    props: HashMap<String, Value>,
    staged: HashMap<String, Value>,
    deleted: HashSet<String>,
    dirty: bool,
}

impl StateBag {
    pub fn new(label: Arc<str>) -> Self {
        Self {
            label,
            props: HashMap::new(),
            staged: HashMap::new(),
            deleted: HashSet::new(),
            dirty: false,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.props.get(key)
    }

    /// Sets one key. Null values are skipped (absent wire fields stay
    /// absent). Re-setting the current value is a no-op; setting a present
    /// key to a different value requires `overwrite`. Returns whether the
    /// bag changed.
    pub fn set(&mut self, key: &str, value: Value, overwrite: bool) -> Result<bool, ConflictError> {
        if value.is_null() {
            return Ok(false);
        }

        if let Some(current) = self.props.get(key) {
            if *current == value {
                return Ok(false);
            }
            if !overwrite {
                return Err(ConflictError {
                    entity: self.label.to_string(),
                    key: key.to_string(),
                    current: current.clone(),
                    proposed: value,
                });
            }
        }

        self.put(key, value);
        Ok(true)
    }

    /// Batch form of [`set`](Self::set); same semantics per key.
    pub fn set_all<'a, I>(&mut self, entries: I, overwrite: bool) -> Result<bool, ConflictError>
    where
        I: IntoIterator<Item = (&'a str, Value)>,
    {
        let mut changed = false;
        for (key, value) in entries {
            changed |= self.set(key, value, overwrite)?;
        }
        Ok(changed)
    }

    /// Removes a key, staging a pending delete. No-op if absent.
    pub fn unset(&mut self, key: &str) -> bool {
        if self.props.remove(key).is_none() {
            return false;
        }
        self.staged.remove(key);
        self.deleted.insert(key.to_string());
        self.dirty = true;
        true
    }

    /// Adds `delta` to a numeric key, starting from 0 when absent.
    pub fn inc(&mut self, key: &str, delta: i64) {
        if delta == 0 {
            return;
        }
        let current = self.props.get(key).and_then(Value::as_i64).unwrap_or(0);
        self.put(key, Value::from(current.saturating_add(delta)));
    }

    /// Subtracts `delta` from a numeric key, starting from 0 when absent.
    pub fn dec(&mut self, key: &str, delta: i64) {
        self.inc(key, -delta);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Drains the pending write/delete sets and clears the dirty flag.
    /// Mutations after this call accumulate toward the next cycle.
    pub fn take_pending(&mut self) -> PendingWrite {
        self.dirty = false;
        PendingWrite {
            set: std::mem::take(&mut self.staged),
            unset: self.deleted.drain().collect(),
        }
    }

    fn put(&mut self, key: &str, value: Value) {
        self.deleted.remove(key);
        self.props.insert(key.to_string(), value.clone());
        self.staged.insert(key.to_string(), value);
        self.dirty = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bag() -> StateBag {
        StateBag::new(Arc::from("Stage[app-1:3]"))
    }

    #[test]
    fn test_set_same_value_is_noop() {
        let mut b = bag();
        assert!(b.set("status", json!("RUNNING"), false).expect("first set"));
        let pending = b.take_pending();
        assert_eq!(pending.set["status"], json!("RUNNING"));

        assert!(!b.set("status", json!("RUNNING"), false).expect("re-set"));
        assert!(!b.is_dirty());
        assert!(b.take_pending().set.is_empty());
    }

    #[test]
    fn test_set_different_value_conflicts() {
        let mut b = bag();
        b.set("jobId", json!(1), false).expect("first set");
        let err = b.set("jobId", json!(2), false).expect_err("conflict");
        assert_eq!(err.key, "jobId");
        assert_eq!(err.current, json!(1));
        assert_eq!(err.proposed, json!(2));
        assert_eq!(b.get("jobId"), Some(&json!(1)));
    }

    #[test]
    fn test_overwrite_stages_new_value() {
        let mut b = bag();
        b.set("status", json!("RUNNING"), false).expect("set");
        b.take_pending();
        b.set("status", json!("FAILED"), true).expect("overwrite");
        assert!(b.is_dirty());
        assert_eq!(b.take_pending().set["status"], json!("FAILED"));
    }

    #[test]
    fn test_null_value_is_skipped() {
        let mut b = bag();
        assert!(!b.set("time.end", Value::Null, false).expect("null set"));
        assert!(!b.is_dirty());
    }

    #[test]
    fn test_inc_dec_round_trip() {
        let mut b = bag();
        b.inc("taskCounts.running", 1);
        assert_eq!(b.get("taskCounts.running"), Some(&json!(1)));
        b.inc("taskCounts.running", 3);
        b.dec("taskCounts.running", 3);
        assert_eq!(b.get("taskCounts.running"), Some(&json!(1)));
        b.dec("taskCounts.running", 1);
        assert_eq!(b.get("taskCounts.running"), Some(&json!(0)));
    }

    #[test]
    fn test_inc_zero_is_noop() {
        let mut b = bag();
        b.inc("n", 0);
        assert!(!b.is_dirty());
        assert_eq!(b.get("n"), None);
    }

    #[test]
    fn test_unset_stages_delete() {
        let mut b = bag();
        b.set("reason", json!("lost"), false).expect("set");
        b.take_pending();
        assert!(b.unset("reason"));
        assert!(b.is_dirty());
        let pending = b.take_pending();
        assert!(pending.set.is_empty());
        assert_eq!(pending.unset, vec!["reason".to_string()]);
        assert!(!b.unset("reason"));
    }

    #[test]
    fn test_set_after_unset_clears_delete() {
        let mut b = bag();
        b.set("reason", json!("lost"), false).expect("set");
        b.take_pending();
        b.unset("reason");
        b.set("reason", json!("found"), false).expect("re-set");
        let pending = b.take_pending();
        assert!(pending.unset.is_empty());
        assert_eq!(pending.set["reason"], json!("found"));
    }
}
