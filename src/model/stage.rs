//! Stages and their attempts.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;

use crate::config::TaskRecordMode;
use crate::event::{accumulables_map, process_time, StageInfo};
use crate::state::{ConflictError, Props, Record};
use crate::store::Collection;

use super::{Stateful, Task, TaskAttempt};

pub struct Stage {
    pub app_id: Arc<str>,
    pub id: i64,
    record: Arc<Record>,
    props: Props,
    task_records: TaskRecordMode,
    attempts: Mutex<HashMap<i64, Arc<StageAttempt>>>,
    tasks: Mutex<HashMap<i64, Arc<Task>>>,
}

impl Stage {
    pub(super) fn new(app_id: &Arc<str>, id: i64, task_records: TaskRecordMode) -> Self {
        let record = Record::create(
            Collection::Stages,
            format!("Stage[{app_id}:{id}]"),
            vec![("appId", json!(app_id.as_ref())), ("stageId", json!(id))],
            false,
        );
        Self {
            app_id: Arc::clone(app_id),
            id,
            props: Props::Own(Arc::clone(&record)),
            record,
            task_records,
            attempts: Mutex::new(HashMap::new()),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn attempt(&self, attempt_id: i64) -> Arc<StageAttempt> {
        Arc::clone(self.attempts.lock().entry(attempt_id).or_insert_with(|| {
            Arc::new(StageAttempt::new(
                &self.app_id,
                self.id,
                attempt_id,
                self.task_records,
            ))
        }))
    }

    /// The stable, index-identified task; survives attempt retries.
    pub fn task(&self, index: i64) -> Arc<Task> {
        Arc::clone(self.tasks.lock().entry(index).or_insert_with(|| {
            let props = match self.task_records {
                TaskRecordMode::Own => Props::Own(Record::create(
                    Collection::Tasks,
                    format!("Task[{}:{}:{index}]", self.app_id, self.id),
                    vec![
                        ("appId", json!(self.app_id.as_ref())),
                        ("stageId", json!(self.id)),
                        ("taskIndex", json!(index)),
                    ],
                    true,
                )),
                TaskRecordMode::Subrecord => {
                    Props::bound(Arc::clone(&self.record), format!("tasks.{index}."))
                }
            };
            Arc::new(Task::new(index, props))
        }))
    }

    pub fn apply_stage_info(&self, si: &StageInfo) -> Result<(), ConflictError> {
        apply_stage_info(&self.props, si)
    }
}

impl Stateful for Stage {
    fn props(&self) -> &Props {
        &self.props
    }
}

pub struct StageAttempt {
    pub app_id: Arc<str>,
    pub stage_id: i64,
    pub id: i64,
    record: Arc<Record>,
    props: Props,
    task_records: TaskRecordMode,
    task_attempts: Mutex<HashMap<i64, Arc<TaskAttempt>>>,
}

impl StageAttempt {
    fn new(app_id: &Arc<str>, stage_id: i64, id: i64, task_records: TaskRecordMode) -> Self {
        let record = Record::create(
            Collection::StageAttempts,
            format!("StageAttempt[{app_id}:{stage_id}.{id}]"),
            vec![
                ("appId", json!(app_id.as_ref())),
                ("stageId", json!(stage_id)),
                ("attemptId", json!(id)),
            ],
            false,
        );
        Self {
            app_id: Arc::clone(app_id),
            stage_id,
            id,
            props: Props::Own(Arc::clone(&record)),
            record,
            task_records,
            task_attempts: Mutex::new(HashMap::new()),
        }
    }

    /// The attempt identified by the wire's globally-unique task id.
    pub fn task_attempt(&self, task_id: i64) -> Arc<TaskAttempt> {
        Arc::clone(
            self.task_attempts
                .lock()
                .entry(task_id)
                .or_insert_with(|| {
                    let props = match self.task_records {
                        TaskRecordMode::Own => Props::Own(Record::create(
                            Collection::TaskAttempts,
                            format!(
                                "TaskAttempt[{}:{}.{}:{task_id}]",
                                self.app_id, self.stage_id, self.id
                            ),
                            vec![
                                ("appId", json!(self.app_id.as_ref())),
                                ("stageId", json!(self.stage_id)),
                                ("stageAttemptId", json!(self.id)),
                                ("taskAttemptId", json!(task_id)),
                            ],
                            true,
                        )),
                        TaskRecordMode::Subrecord => Props::bound(
                            Arc::clone(&self.record),
                            format!("taskAttempts.{task_id}."),
                        ),
                    };
                    Arc::new(TaskAttempt::new(task_id, props))
                }),
        )
    }

    pub fn apply_stage_info(&self, si: &StageInfo) -> Result<(), ConflictError> {
        apply_stage_info(&self.props, si)
    }
}

impl Stateful for StageAttempt {
    fn props(&self) -> &Props {
        &self.props
    }
}

/// Stage and stage-attempt records carry the same stage-info fields.
/// Timing, failure reason and accumulables may legitimately arrive more
/// than once with fresher values (a stage retry re-submits with new
/// times); name, details and task count are fixed.
fn apply_stage_info(props: &Props, si: &StageInfo) -> Result<(), ConflictError> {
    props.set_all(
        [
            ("name", json!(si.stage_name)),
            ("details", json!(si.details)),
            ("taskCounts.num", json!(si.num_tasks)),
        ],
        false,
    )?;
    props.set_all(
        [
            ("time.start", process_time(si.submission_time)),
            ("time.end", process_time(si.completion_time)),
            ("failureReason", json!(si.failure_reason)),
            ("accumulables", accumulables_map(si.accumulables.as_ref())),
        ],
        true,
    )
}
