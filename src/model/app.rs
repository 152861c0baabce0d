//! Application: root of the entity hierarchy, plus its flat environment
//! record.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;

use crate::config::TaskRecordMode;
use crate::event::{process_time, ApplicationStart};
use crate::state::{ConflictError, Props, Record};
use crate::store::Collection;

use super::{Executor, Job, Rdd, Stage, Stateful};

pub struct Application {
    id: Arc<str>,
    props: Props,
    task_records: TaskRecordMode,
    jobs: Mutex<HashMap<i64, Arc<Job>>>,
    stages: Mutex<HashMap<i64, Arc<Stage>>>,
    executors: Mutex<HashMap<String, Arc<Executor>>>,
    rdds: Mutex<HashMap<i64, Arc<Rdd>>>,
    environment: Mutex<Option<Arc<Environment>>>,
    /// Stage id -> owning job id, registered at job start.
    stage_to_job: Mutex<HashMap<i64, i64>>,
    /// Task id -> (stage id, stage attempt id), registered at task start so
    /// result-fetch events can find their attempt.
    attempt_sites: Mutex<HashMap<i64, (i64, i64)>>,
}

impl Application {
    pub fn new(app_id: &str, task_records: TaskRecordMode) -> Arc<Self> {
        let id: Arc<str> = Arc::from(app_id);
        let record = Record::create(
            Collection::Applications,
            format!("Application[{id}]"),
            vec![("appId", json!(app_id))],
            false,
        );
        Arc::new(Self {
            id,
            props: Props::Own(record),
            task_records,
            jobs: Mutex::new(HashMap::new()),
            stages: Mutex::new(HashMap::new()),
            executors: Mutex::new(HashMap::new()),
            rdds: Mutex::new(HashMap::new()),
            environment: Mutex::new(None),
            stage_to_job: Mutex::new(HashMap::new()),
            attempt_sites: Mutex::new(HashMap::new()),
        })
    }

    pub fn id(&self) -> &Arc<str> {
        &self.id
    }

    pub fn apply_start(&self, e: &ApplicationStart) -> Result<(), ConflictError> {
        self.set_all(
            [
                ("name", json!(e.app_name)),
                ("user", json!(e.user)),
                ("time.start", process_time(e.timestamp)),
            ],
            false,
        )
    }

    pub fn job(&self, job_id: i64) -> Arc<Job> {
        Arc::clone(
            self.jobs
                .lock()
                .entry(job_id)
                .or_insert_with(|| Arc::new(Job::new(&self.id, job_id))),
        )
    }

    pub fn stage(&self, stage_id: i64) -> Arc<Stage> {
        Arc::clone(
            self.stages
                .lock()
                .entry(stage_id)
                .or_insert_with(|| Arc::new(Stage::new(&self.id, stage_id, self.task_records))),
        )
    }

    pub fn executor(&self, exec_id: &str) -> Arc<Executor> {
        Arc::clone(
            self.executors
                .lock()
                .entry(exec_id.to_string())
                .or_insert_with(|| Arc::new(Executor::new(&self.id, exec_id))),
        )
    }

    pub fn rdd(&self, rdd_id: i64) -> Arc<Rdd> {
        Arc::clone(
            self.rdds
                .lock()
                .entry(rdd_id)
                .or_insert_with(|| Arc::new(Rdd::new(&self.id, rdd_id))),
        )
    }

    pub fn environment(&self) -> Arc<Environment> {
        let mut slot = self.environment.lock();
        if let Some(env) = slot.as_ref() {
            return Arc::clone(env);
        }
        let env = Arc::new(Environment::new(&self.id));
        *slot = Some(Arc::clone(&env));
        env
    }

    pub fn link_stage(&self, stage_id: i64, job_id: i64) {
        self.stage_to_job.lock().insert(stage_id, job_id);
    }

    pub fn job_for_stage(&self, stage_id: i64) -> Option<Arc<Job>> {
        let job_id = *self.stage_to_job.lock().get(&stage_id)?;
        Some(self.job(job_id))
    }

    pub fn record_attempt_site(&self, task_id: i64, stage_id: i64, stage_attempt_id: i64) {
        self.attempt_sites
            .lock()
            .insert(task_id, (stage_id, stage_attempt_id));
    }

    pub fn attempt_site(&self, task_id: i64) -> Option<(i64, i64)> {
        self.attempt_sites.lock().get(&task_id).copied()
    }
}

impl Stateful for Application {
    fn props(&self) -> &Props {
        &self.props
    }
}

/// Flat per-application environment listing; not part of the status model.
pub struct Environment {
    props: Props,
}

impl Environment {
    fn new(app_id: &Arc<str>) -> Self {
        let record = Record::create(
            Collection::Environment,
            format!("Environment[{app_id}]"),
            vec![("appId", json!(app_id.as_ref()))],
            false,
        );
        Self {
            props: Props::Own(record),
        }
    }
}

impl Stateful for Environment {
    fn props(&self) -> &Props {
        &self.props
    }
}
