//! Tasks and their attempts.
//!
//! A task is addressed by its stable in-stage index and outlives attempt
//! retries; its metrics hold the best-known snapshot across attempts. A
//! task attempt is one concrete execution, addressed by the wire's task id,
//! carrying that attempt's raw metrics.

use crate::event::{accumulables_map, process_time, TaskInfo};
use crate::state::{ConflictError, Props};

use super::Stateful;

pub struct Task {
    pub index: i64,
    props: Props,
}

impl Task {
    pub(super) fn new(index: i64, props: Props) -> Self {
        Self { index, props }
    }
}

impl Stateful for Task {
    fn props(&self) -> &Props {
        &self.props
    }
}

pub struct TaskAttempt {
    pub id: i64,
    props: Props,
}

impl TaskAttempt {
    pub(super) fn new(id: i64, props: Props) -> Self {
        Self { id, props }
    }

    pub fn apply_task_info(&self, ti: &TaskInfo) -> Result<(), ConflictError> {
        self.set_all(
            [
                ("time.start", process_time(ti.launch_time)),
                ("execId", serde_json::json!(ti.executor_id)),
                ("locality", serde_json::json!(ti.locality)),
                ("speculative", serde_json::json!(ti.speculative)),
                ("index", serde_json::json!(ti.index)),
                ("attempt", serde_json::json!(ti.attempt)),
                ("time.gettingResult", process_time(ti.getting_result_time)),
            ],
            false,
        )?;
        // Accumulables and the finish time may already have been set by an
        // earlier event for this attempt and then refreshed here.
        self.set_all(
            [
                ("accumulables", accumulables_map(ti.accumulables.as_ref())),
                ("time.end", process_time(ti.finish_time)),
            ],
            true,
        )
    }
}

impl Stateful for TaskAttempt {
    fn props(&self) -> &Props {
        &self.props
    }
}
