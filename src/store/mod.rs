//! Store writer and backends.
//!
//! Entities persist as documents addressed by identity-key filters, one
//! collection per entity kind. The writer owns a queue of upsert requests;
//! each request runs on its own task so writes to different entities
//! proceed concurrently, while rate-limited records bound their own
//! concurrency through the flush gate (see [`crate::state::record`]).
//!
//! A failed upsert is logged and dropped: the pending data for that cycle
//! is lost, and the next dirtying event re-flushes the then-current state.

pub mod memory;
pub mod mongo;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

use crate::health::HealthMetrics;
use crate::state::record::Record;

use self::memory::MemoryStore;
use self::mongo::MongoStore;

/// Store collection per entity kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Applications,
    Environment,
    Jobs,
    Stages,
    StageAttempts,
    Tasks,
    TaskAttempts,
    Executors,
    Rdds,
}

impl Collection {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Applications => "applications",
            Self::Environment => "environment",
            Self::Jobs => "jobs",
            Self::Stages => "stages",
            Self::StageAttempts => "stage_attempts",
            Self::Tasks => "tasks",
            Self::TaskAttempts => "task_attempts",
            Self::Executors => "executors",
            Self::Rdds => "rdds",
        }
    }
}

/// One coalesced write cycle for one record: create-on-absent,
/// merge-on-present.
pub struct UpsertRequest {
    pub collection: Collection,
    pub identity: Arc<[(&'static str, Value)]>,
    pub set: HashMap<String, Value>,
    pub unset: Vec<String>,
    pub label: Arc<str>,
    /// Rate-limited records ride along for the completion callback.
    pub(crate) origin: Option<Arc<Record>>,
}

/// Storage backend. Enum dispatch keeps the async calls monomorphic.
#[derive(Clone)]
pub enum Store {
    Mongo(MongoStore),
    Memory(MemoryStore),
}

impl Store {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Mongo(_) => "mongo",
            Self::Memory(_) => "memory",
        }
    }

    pub async fn upsert(&self, req: &UpsertRequest) -> Result<()> {
        match self {
            Self::Mongo(s) => s.upsert(req).await,
            Self::Memory(s) => s.upsert(req).await,
        }
    }
}

/// Handle used by records to submit upsert requests. Cheap to clone.
#[derive(Clone)]
pub struct StoreWriter {
    tx: mpsc::UnboundedSender<UpsertRequest>,
}

impl StoreWriter {
    /// Spawns the dispatcher task. The returned handle resolves once every
    /// writer clone is dropped and all in-flight upserts have finished.
    pub fn spawn(store: Store, health: Option<Arc<HealthMetrics>>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<UpsertRequest>();
        // The dispatcher keeps only a weak handle; a strong one would keep
        // its own queue open forever.
        let weak = tx.downgrade();

        let task = tokio::spawn(async move {
            let tracker = TaskTracker::new();
            while let Some(req) = rx.recv().await {
                let store = store.clone();
                let weak = weak.clone();
                let health = health.clone();
                tracker.spawn(async move {
                    execute(store, weak, health, req).await;
                });
            }
            tracker.close();
            tracker.wait().await;
        });

        (Self { tx }, task)
    }

    pub(crate) fn submit(&self, req: UpsertRequest) {
        if self.tx.send(req).is_err() {
            warn!("store writer stopped, dropping upsert");
        }
    }
}

async fn execute(
    store: Store,
    weak: mpsc::WeakUnboundedSender<UpsertRequest>,
    health: Option<Arc<HealthMetrics>>,
    req: UpsertRequest,
) {
    match store.upsert(&req).await {
        Ok(()) => {
            if let Some(h) = &health {
                h.store_upserts.inc();
            }
            debug!(
                collection = req.collection.name(),
                entity = %req.label,
                "upserted",
            );
        }
        Err(e) => {
            if let Some(h) = &health {
                h.store_failures.inc();
            }
            error!(
                collection = req.collection.name(),
                entity = %req.label,
                error = %e,
                "store upsert failed, dropping cycle",
            );
        }
    }

    // Success or failure, a rate-limited record must be released so piled-up
    // mutations can flush.
    if let Some(origin) = req.origin {
        if let Some(tx) = weak.upgrade() {
            origin.complete_flush(&StoreWriter { tx });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_names() {
        assert_eq!(Collection::Applications.name(), "applications");
        assert_eq!(Collection::StageAttempts.name(), "stage_attempts");
        assert_eq!(Collection::TaskAttempts.name(), "task_attempts");
    }
}
