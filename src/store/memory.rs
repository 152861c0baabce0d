//! In-process store backend.
//!
//! Applies upsert requests to a plain document map with the same
//! create-on-absent, merge-on-present semantics as the real store. Used by
//! the test suite and for running without a database; the optional write
//! gate lets tests hold a write in flight deterministically.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::Semaphore;

use super::{Collection, UpsertRequest};

#[derive(Default)]
struct Inner {
    docs: Mutex<HashMap<String, Map<String, Value>>>,
    writes: AtomicU64,
    gate: Option<Arc<Semaphore>>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose writes each consume one permit before applying.
    /// With zero permits a submitted write stays in flight until the
    /// caller adds one.
    pub fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let store = Self {
            inner: Arc::new(Inner {
                gate: Some(Arc::clone(&gate)),
                ..Inner::default()
            }),
        };
        (store, gate)
    }

    pub async fn upsert(&self, req: &UpsertRequest) -> Result<()> {
        if let Some(gate) = &self.inner.gate {
            gate.acquire().await.context("write gate closed")?.forget();
        }

        let key = doc_key(req.collection, &req.identity);
        let mut docs = self.inner.docs.lock();
        let doc = docs.entry(key).or_insert_with(|| {
            req.identity
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect()
        });
        for (k, v) in &req.set {
            doc.insert(k.clone(), v.clone());
        }
        for k in &req.unset {
            doc.remove(k);
        }
        drop(docs);

        self.inner.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Number of writes applied so far.
    pub fn write_count(&self) -> u64 {
        self.inner.writes.load(Ordering::Relaxed)
    }

    /// Fetches one document by identity. Keys are the dotted store paths.
    pub fn document(
        &self,
        collection: Collection,
        identity: &[(&'static str, Value)],
    ) -> Option<Map<String, Value>> {
        self.inner
            .docs
            .lock()
            .get(&doc_key(collection, identity))
            .cloned()
    }
}

fn doc_key(collection: Collection, identity: &[(&'static str, Value)]) -> String {
    let mut key = String::from(collection.name());
    for (k, v) in identity {
        key.push('|');
        key.push_str(k);
        key.push('=');
        key.push_str(&v.to_string());
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn request(set: Vec<(&str, Value)>, unset: Vec<&str>) -> UpsertRequest {
        UpsertRequest {
            collection: Collection::Jobs,
            identity: Arc::from(vec![("appId", json!("app-1")), ("jobId", json!(1))]),
            set: set.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
            unset: unset.into_iter().map(str::to_string).collect(),
            label: Arc::from("Job[app-1:1]"),
            origin: None,
        }
    }

    #[tokio::test]
    async fn test_upsert_creates_then_merges() {
        let store = MemoryStore::new();
        store
            .upsert(&request(vec![("status", json!("RUNNING"))], vec![]))
            .await
            .expect("first upsert");
        store
            .upsert(&request(
                vec![("taskCounts.num", json!(6))],
                vec!["status"],
            ))
            .await
            .expect("second upsert");

        let doc = store
            .document(
                Collection::Jobs,
                &[("appId", json!("app-1")), ("jobId", json!(1))],
            )
            .expect("doc exists");
        assert_eq!(doc["appId"], json!("app-1"));
        assert_eq!(doc["taskCounts.num"], json!(6));
        assert!(!doc.contains_key("status"));
        assert_eq!(store.write_count(), 2);
    }
}
