//! Persisted records: a property bag plus the identity and coalesced-flush
//! machinery that carries it into the store.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::state::bag::{ConflictError, StateBag};
use crate::store::{Collection, StoreWriter, UpsertRequest};

#[derive(Debug, Default)]
struct Gate {
    in_flight: bool,
    retry_pending: bool,
}

/// One store-backed record: an identity-key filter, a target collection and
/// a dirty-tracked bag of properties.
///
/// High-cardinality kinds (tasks, task attempts) are created rate-limited:
/// at most one upsert is in flight per record, and a flush issued while one
/// is outstanding only marks a retry. The store writer re-invokes
/// [`flush`](Self::flush) from the completion path, picking up whatever
/// accumulated meanwhile, so every mutation still reaches the store without
/// unbounded concurrent writes to one key.
pub struct Record {
    label: Arc<str>,
    collection: Collection,
    identity: Arc<[(&'static str, Value)]>,
    rate_limited: bool,
    bag: Mutex<StateBag>,
    gate: Mutex<Gate>,
}

impl Record {
    pub fn create(
        collection: Collection,
        label: String,
        identity: Vec<(&'static str, Value)>,
        rate_limited: bool,
    ) -> Arc<Self> {
        let label: Arc<str> = label.into();
        Arc::new(Self {
            bag: Mutex::new(StateBag::new(label.clone())),
            label,
            collection,
            identity: identity.into(),
            rate_limited,
            gate: Mutex::new(Gate::default()),
        })
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.bag.lock().get(key).cloned()
    }

    pub fn set(&self, key: &str, value: Value, overwrite: bool) -> Result<(), ConflictError> {
        self.bag.lock().set(key, value, overwrite).map(|_| ())
    }

    pub fn set_all<'a, I>(&self, entries: I, overwrite: bool) -> Result<(), ConflictError>
    where
        I: IntoIterator<Item = (&'a str, Value)>,
    {
        self.bag.lock().set_all(entries, overwrite).map(|_| ())
    }

    pub fn inc(&self, key: &str, delta: i64) {
        self.bag.lock().inc(key, delta);
    }

    pub fn dec(&self, key: &str, delta: i64) {
        self.bag.lock().dec(key, delta);
    }

    pub fn unset(&self, key: &str) {
        self.bag.lock().unset(key);
    }

    /// Builds one upsert from the pending mutations and hands it to the
    /// writer. No-op when clean. For a rate-limited record with a write
    /// already outstanding, marks a retry instead: the outstanding request
    /// captured everything dirty at its submit time, and the retry flush
    /// will carry the rest.
    pub fn flush(self: &Arc<Self>, writer: &StoreWriter) {
        let mut bag = self.bag.lock();
        if !bag.is_dirty() {
            return;
        }

        let origin = if self.rate_limited {
            let mut gate = self.gate.lock();
            if gate.in_flight {
                gate.retry_pending = true;
                return;
            }
            gate.in_flight = true;
            Some(Arc::clone(self))
        } else {
            None
        };

        let pending = bag.take_pending();
        drop(bag);

        writer.submit(UpsertRequest {
            collection: self.collection,
            identity: Arc::clone(&self.identity),
            set: pending.set,
            unset: pending.unset,
            label: Arc::clone(&self.label),
            origin,
        });
    }

    /// Invoked by the store writer when a rate-limited record's upsert
    /// finishes (successfully or not). Clears the in-flight gate and
    /// re-flushes if mutations piled up behind it.
    pub(crate) fn complete_flush(self: &Arc<Self>, writer: &StoreWriter) {
        let retry = {
            let mut gate = self.gate.lock();
            gate.in_flight = false;
            std::mem::take(&mut gate.retry_pending)
        };
        if retry {
            self.flush(writer);
        }
    }
}

/// The state-bag capability composed into every entity: either a record of
/// its own, or a sub-record bound into a parent record under a dotted key
/// prefix. A bound sub-record has no flush of its own; the parent's flush
/// already carries its fields.
#[derive(Clone)]
pub enum Props {
    Own(Arc<Record>),
    Bound {
        parent: Arc<Record>,
        prefix: Arc<str>,
    },
}

impl Props {
    pub fn bound(parent: Arc<Record>, prefix: String) -> Self {
        Self::Bound {
            parent,
            prefix: prefix.into(),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        match self {
            Self::Own(rec) => rec.get(key),
            Self::Bound { parent, prefix } => parent.get(&format!("{prefix}{key}")),
        }
    }

    pub fn set(&self, key: &str, value: Value, overwrite: bool) -> Result<(), ConflictError> {
        match self {
            Self::Own(rec) => rec.set(key, value, overwrite),
            Self::Bound { parent, prefix } => {
                parent.set(&format!("{prefix}{key}"), value, overwrite)
            }
        }
    }

    pub fn set_all<'a, I>(&self, entries: I, overwrite: bool) -> Result<(), ConflictError>
    where
        I: IntoIterator<Item = (&'a str, Value)>,
    {
        for (key, value) in entries {
            self.set(key, value, overwrite)?;
        }
        Ok(())
    }

    pub fn inc(&self, key: &str, delta: i64) {
        match self {
            Self::Own(rec) => rec.inc(key, delta),
            Self::Bound { parent, prefix } => parent.inc(&format!("{prefix}{key}"), delta),
        }
    }

    pub fn dec(&self, key: &str, delta: i64) {
        match self {
            Self::Own(rec) => rec.dec(key, delta),
            Self::Bound { parent, prefix } => parent.dec(&format!("{prefix}{key}"), delta),
        }
    }

    pub fn unset(&self, key: &str) {
        match self {
            Self::Own(rec) => rec.unset(key),
            Self::Bound { parent, prefix } => parent.unset(&format!("{prefix}{key}")),
        }
    }

    pub fn flush(&self, writer: &StoreWriter) {
        if let Self::Own(rec) = self {
            rec.flush(writer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::{Store, StoreWriter};
    use serde_json::json;
    use std::time::Duration;

    async fn wait_for_writes(store: &MemoryStore, n: u64) {
        for _ in 0..200 {
            if store.write_count() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "store never reached {n} writes (got {})",
            store.write_count()
        );
    }

    fn task_record() -> Arc<Record> {
        Record::create(
            Collection::Tasks,
            "Task[app-1:0:2]".to_string(),
            vec![
                ("appId", json!("app-1")),
                ("stageId", json!(0)),
                ("taskIndex", json!(2)),
            ],
            true,
        )
    }

    #[tokio::test]
    async fn test_flush_clean_record_is_noop() {
        let store = MemoryStore::new();
        let (writer, _task) = StoreWriter::spawn(Store::Memory(store.clone()), None);

        let rec = task_record();
        rec.flush(&writer);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_coalesced_flush_bounds_writes() {
        let (store, gate) = MemoryStore::gated();
        let (writer, _task) = StoreWriter::spawn(Store::Memory(store.clone()), None);

        let rec = task_record();
        rec.set("status", json!("RUNNING"), false).expect("set");
        rec.flush(&writer);

        // A burst of mutations and flushes while the first write is held.
        for i in 0..5 {
            rec.inc("n", 1);
            rec.set("last", json!(i), true).expect("set");
            rec.flush(&writer);
        }

        // Nothing has landed yet; the burst coalesced behind the gate.
        assert_eq!(store.write_count(), 0);

        gate.add_permits(1);
        wait_for_writes(&store, 1).await;

        gate.add_permits(1);
        wait_for_writes(&store, 2).await;

        // Exactly one follow-up write, carrying the union of the burst.
        gate.add_permits(8);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.write_count(), 2);

        let doc = store
            .document(
                Collection::Tasks,
                &[
                    ("appId", json!("app-1")),
                    ("stageId", json!(0)),
                    ("taskIndex", json!(2)),
                ],
            )
            .expect("doc exists");
        assert_eq!(doc["status"], json!("RUNNING"));
        assert_eq!(doc["n"], json!(5));
        assert_eq!(doc["last"], json!(4));
    }

    #[tokio::test]
    async fn test_non_rate_limited_record_flushes_per_call() {
        let store = MemoryStore::new();
        let (writer, _task) = StoreWriter::spawn(Store::Memory(store.clone()), None);

        let rec = Record::create(
            Collection::Jobs,
            "Job[app-1:7]".to_string(),
            vec![("appId", json!("app-1")), ("jobId", json!(7))],
            false,
        );
        rec.inc("stageCounts.running", 1);
        rec.flush(&writer);
        rec.inc("stageCounts.running", 1);
        rec.flush(&writer);

        wait_for_writes(&store, 2).await;
        let doc = store
            .document(
                Collection::Jobs,
                &[("appId", json!("app-1")), ("jobId", json!(7))],
            )
            .expect("doc exists");
        assert_eq!(doc["stageCounts.running"], json!(2));
    }

    #[tokio::test]
    async fn test_bound_props_write_through_parent() {
        let store = MemoryStore::new();
        let (writer, _task) = StoreWriter::spawn(Store::Memory(store.clone()), None);

        let stage = Record::create(
            Collection::Stages,
            "Stage[app-1:3]".to_string(),
            vec![("appId", json!("app-1")), ("stageId", json!(3))],
            false,
        );
        let task = Props::bound(Arc::clone(&stage), "tasks.2.".to_string());

        task.set("status", json!("RUNNING"), false).expect("set");
        task.inc("n", 1);
        assert_eq!(task.get("status"), Some(json!("RUNNING")));
        assert_eq!(stage.get("tasks.2.status"), Some(json!("RUNNING")));

        // A bound sub-record has no flush of its own.
        task.flush(&writer);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.write_count(), 0);

        stage.flush(&writer);
        wait_for_writes(&store, 1).await;
        let doc = store
            .document(
                Collection::Stages,
                &[("appId", json!("app-1")), ("stageId", json!(3))],
            )
            .expect("doc exists");
        assert_eq!(doc["tasks.2.status"], json!("RUNNING"));
        assert_eq!(doc["tasks.2.n"], json!(1));
    }
}
