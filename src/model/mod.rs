//! The entity graph: typed, store-backed records for every domain entity,
//! resolved or created on demand from the identity fields events carry.
//!
//! Resolution never touches the store; entities live in in-memory
//! registries for the life of the process and persist opportunistically
//! through their records.

pub mod app;
pub mod executor;
pub mod job;
pub mod rdd;
pub mod stage;
pub mod status;
pub mod task;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::config::TaskRecordMode;
use crate::state::{ConflictError, Props};
use crate::store::StoreWriter;

pub use app::{Application, Environment};
pub use executor::Executor;
pub use job::Job;
pub use rdd::Rdd;
pub use stage::{Stage, StageAttempt};
pub use status::{Outcome, Status};
pub use task::{Task, TaskAttempt};

/// The state-bag capability shared by every entity type, composed by
/// delegation to its [`Props`].
pub trait Stateful {
    fn props(&self) -> &Props;

    fn get(&self, key: &str) -> Option<Value> {
        self.props().get(key)
    }

    fn set(&self, key: &str, value: Value, overwrite: bool) -> Result<(), ConflictError> {
        self.props().set(key, value, overwrite)
    }

    fn set_all<'a, I>(&self, entries: I, overwrite: bool) -> Result<(), ConflictError>
    where
        I: IntoIterator<Item = (&'a str, Value)>,
        Self: Sized,
    {
        self.props().set_all(entries, overwrite)
    }

    fn inc(&self, key: &str) {
        self.props().inc(key, 1);
    }

    fn inc_by(&self, key: &str, delta: i64) {
        self.props().inc(key, delta);
    }

    fn dec(&self, key: &str) {
        self.props().dec(key, 1);
    }

    fn dec_by(&self, key: &str, delta: i64) {
        self.props().dec(key, delta);
    }

    fn unset(&self, key: &str) {
        self.props().unset(key);
    }

    fn status(&self) -> Option<Status> {
        Status::from_value(self.get("status").as_ref())
    }

    fn flush(&self, writer: &StoreWriter) {
        self.props().flush(writer);
    }
}

/// Registry of monitored applications. Owned by the event processor;
/// everything below an application hangs off that application's own
/// registries.
pub struct EntityGraph {
    task_records: TaskRecordMode,
    apps: HashMap<String, Arc<Application>>,
}

impl EntityGraph {
    pub fn new(task_records: TaskRecordMode) -> Self {
        Self {
            task_records,
            apps: HashMap::new(),
        }
    }

    /// Resolves or creates the application for an event's `appId`.
    pub fn application(&mut self, app_id: &str) -> Arc<Application> {
        if let Some(app) = self.apps.get(app_id) {
            return Arc::clone(app);
        }
        let app = Application::new(app_id, self.task_records);
        self.apps.insert(app_id.to_string(), Arc::clone(&app));
        app
    }
}
