//! The event processor: one handler per listener event kind.
//!
//! Handlers resolve entities through the graph, apply status transitions
//! with paired counter updates, propagate metric deltas, and flush the
//! touched records. Handler bodies run to completion synchronously against
//! in-memory state; only the store flush is asynchronous.
//!
//! A property conflict (an immutable field re-set to a different value)
//! aborts the one event it occurred in; transitions outside the status
//! machine are logged with full identity and processing continues with the
//! per-event best-effort rule.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::config::TaskRecordMode;
use crate::event::{self, pairs, process_time, strip_key_spaces, ListenerEvent};
use crate::health::HealthMetrics;
use crate::metrics;
use crate::model::status::{plan, status_label, Outcome};
use crate::model::{EntityGraph, Executor, Stateful, Status};
use crate::state::{ConflictError, Props};
use crate::store::StoreWriter;

pub struct EventProcessor {
    graph: EntityGraph,
    writer: StoreWriter,
    health: Option<Arc<HealthMetrics>>,
}

impl EventProcessor {
    pub fn new(
        writer: StoreWriter,
        task_records: TaskRecordMode,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            graph: EntityGraph::new(task_records),
            writer,
            health,
        }
    }

    pub fn graph_mut(&mut self) -> &mut EntityGraph {
        &mut self.graph
    }

    /// Processes one event. Never panics or aborts the stream: a conflict
    /// is contained to this event and logged.
    pub fn handle(&mut self, event: &ListenerEvent) {
        if let Some(h) = &self.health {
            h.events_received.inc();
        }
        if let Err(e) = self.dispatch(event) {
            if let Some(h) = &self.health {
                h.conflicts.inc();
            }
            error!(event = event.kind(), error = %e, "event aborted by property conflict");
        }
    }

    fn dispatch(&mut self, event: &ListenerEvent) -> Result<(), ConflictError> {
        match event {
            ListenerEvent::ApplicationStart(e) => self.on_application_start(e),
            ListenerEvent::ApplicationEnd(e) => self.on_application_end(e),
            ListenerEvent::JobStart(e) => self.on_job_start(e),
            ListenerEvent::JobEnd(e) => self.on_job_end(e),
            ListenerEvent::StageSubmitted(e) => self.on_stage_submitted(e),
            ListenerEvent::StageCompleted(e) => self.on_stage_completed(e),
            ListenerEvent::TaskStart(e) => self.on_task_start(e),
            ListenerEvent::TaskGettingResult(e) => self.on_task_getting_result(e),
            ListenerEvent::TaskEnd(e) => self.on_task_end(e),
            ListenerEvent::EnvironmentUpdate(e) => self.on_environment_update(e),
            ListenerEvent::BlockManagerAdded(e) => self.on_block_manager_added(e),
            ListenerEvent::BlockManagerRemoved(e) => self.on_block_manager_removed(e),
            ListenerEvent::UnpersistRdd(e) => self.on_unpersist_rdd(e),
            ListenerEvent::ExecutorAdded(e) => self.on_executor_added(e),
            ListenerEvent::ExecutorRemoved(e) => self.on_executor_removed(e),
            ListenerEvent::LogStart(_) | ListenerEvent::ExecutorMetricsUpdate(_) => {
                debug!(event = event.kind(), "ignoring reserved event kind");
                Ok(())
            }
        }
    }

    fn anomaly(&self) {
        if let Some(h) = &self.health {
            h.anomalies.inc();
        }
    }

    fn on_application_start(&mut self, e: &event::ApplicationStart) -> Result<(), ConflictError> {
        let app = self.graph.application(&e.app_id);
        app.apply_start(e)?;
        app.flush(&self.writer);
        Ok(())
    }

    fn on_application_end(&mut self, e: &event::ApplicationEnd) -> Result<(), ConflictError> {
        let app = self.graph.application(&e.app_id);
        app.set("time.end", process_time(e.timestamp), false)?;
        app.flush(&self.writer);
        Ok(())
    }

    fn on_job_start(&mut self, e: &event::JobStart) -> Result<(), ConflictError> {
        let app = self.graph.application(&e.app_id);
        let job = app.job(e.job_id);

        let mut num_tasks = 0;
        for si in &e.stage_infos {
            let stage = app.stage(si.stage_id);
            stage.apply_stage_info(si)?;
            // A stage computed for an earlier job can be re-announced by a
            // later one; the link follows the latest announcement.
            stage.set("jobId", json!(e.job_id), true)?;
            app.link_stage(si.stage_id, e.job_id);
            stage.flush(&self.writer);

            let attempt = stage.attempt(si.stage_attempt_id);
            attempt.apply_stage_info(si)?;
            attempt.flush(&self.writer);

            for ri in &si.rdd_info {
                let rdd = app.rdd(ri.rdd_id);
                rdd.apply_rdd_info(ri)?;
                rdd.flush(&self.writer);
            }

            num_tasks += si.num_tasks;
        }

        job.set_all(
            [
                ("time.start", process_time(e.submission_time)),
                ("stageIDs", json!(e.stage_ids)),
                ("taskCounts.num", json!(num_tasks)),
                ("stageCounts.num", json!(e.stage_ids.len())),
                ("properties", json!(e.properties)),
            ],
            false,
        )?;
        job.flush(&self.writer);
        Ok(())
    }

    fn on_job_end(&mut self, e: &event::JobEnd) -> Result<(), ConflictError> {
        let app = self.graph.application(&e.app_id);
        let job = app.job(e.job_id);

        let succeeded = e
            .job_result
            .as_ref()
            .and_then(|r| r.get("Result"))
            .and_then(Value::as_str)
            == Some("JobSucceeded");
        job.set_all(
            [
                ("time.end", process_time(e.completion_time)),
                ("result", json!(e.job_result)),
                ("succeeded", json!(succeeded)),
                ("ended", json!(true)),
            ],
            false,
        )?;
        job.flush(&self.writer);

        // Stages announced at job start but never started are SKIPPED,
        // exactly once. A stage still mid-flight here is an upstream
        // ordering problem; it is reported, not corrected.
        for stage_id in job.stage_ids() {
            let stage = app.stage(stage_id);
            match stage.status() {
                None => {
                    stage.set("status", Status::Skipped.value(), false)?;
                    stage.flush(&self.writer);
                }
                Some(Status::Running) | Some(Status::Failed) => {
                    self.anomaly();
                    error!(
                        app = %app.id(),
                        job = job.id,
                        stage = stage_id,
                        status = status_label(stage.status()),
                        "stage not settled at job end",
                    );
                }
                Some(Status::Skipped) => {
                    debug!(
                        app = %app.id(),
                        job = job.id,
                        stage = stage_id,
                        "stage already skipped, nothing to do",
                    );
                }
                Some(Status::Succeeded) => {}
            }
        }
        Ok(())
    }

    fn on_stage_submitted(&mut self, e: &event::StageSubmitted) -> Result<(), ConflictError> {
        let app = self.graph.application(&e.app_id);
        let si = &e.stage_info;

        let stage = app.stage(si.stage_id);
        stage.apply_stage_info(si)?;

        let attempt = stage.attempt(si.stage_attempt_id);
        attempt.apply_stage_info(si)?;

        match attempt.status() {
            None => {
                attempt.set_all(
                    [("started", json!(true)), ("status", Status::Running.value())],
                    false,
                )?;
                stage.inc("attempts.num");
                stage.inc("attempts.running");
                // The stage follows its first attempt out of PENDING; a
                // retry brings a FAILED stage back to RUNNING. A stage that
                // already settled keeps its terminal status.
                match plan(stage.status(), Status::Running) {
                    Outcome::Start => stage.set("status", Status::Running.value(), false)?,
                    Outcome::Retry => stage.set("status", Status::Running.value(), true)?,
                    _ => {}
                }
                match app.job_for_stage(stage.id) {
                    Some(job) => {
                        job.inc("stageCounts.running");
                        job.flush(&self.writer);
                    }
                    None => {
                        warn!(
                            app = %app.id(),
                            stage = stage.id,
                            "stage submitted before any job announced it",
                        );
                    }
                }
            }
            Some(prev) => {
                self.anomaly();
                error!(
                    app = %app.id(),
                    stage = stage.id,
                    attempt = attempt.id,
                    status = %prev,
                    "re-submission of a stage attempt with an extant status",
                );
            }
        }

        stage.set("properties", json!(e.properties), false)?;
        stage.flush(&self.writer);
        attempt.flush(&self.writer);
        Ok(())
    }

    fn on_stage_completed(&mut self, e: &event::StageCompleted) -> Result<(), ConflictError> {
        let app = self.graph.application(&e.app_id);
        let si = &e.stage_info;

        let stage = app.stage(si.stage_id);
        stage.apply_stage_info(si)?;
        let prev_stage_status = stage.status();

        let attempt = stage.attempt(si.stage_attempt_id);
        let prev_attempt_status = attempt.status();
        let new_status = if si.failure_reason.is_some() {
            Status::Failed
        } else {
            Status::Succeeded
        };

        attempt.apply_stage_info(si)?;
        attempt.set("ended", json!(true), false)?;
        attempt.set("status", new_status.value(), true)?;

        let job = app.job_for_stage(stage.id);

        if prev_attempt_status == Some(Status::Running) {
            stage.dec("attempts.running");
            if let Some(job) = &job {
                job.dec("stageCounts.running");
            }
        } else {
            self.anomaly();
            error!(
                app = %app.id(),
                stage = stage.id,
                attempt = attempt.id,
                prev = status_label(prev_attempt_status),
                new = %new_status,
                "stage attempt completed without a running status",
            );
        }

        // A stage that already succeeded is settled: a further attempt
        // outcome updates the attempt record but not the stage or job.
        if prev_stage_status == Some(Status::Succeeded) {
            info!(
                app = %app.id(),
                stage = stage.id,
                attempt = attempt.id,
                outcome = %new_status,
                "ignoring attempt outcome for an already-succeeded stage",
            );
        } else {
            stage.set("status", new_status.value(), true)?;
            let counter = if new_status == Status::Succeeded {
                "succeeded"
            } else {
                "failed"
            };
            stage.inc(&format!("attempts.{counter}"));
            if let Some(job) = &job {
                job.inc(&format!("stageCounts.{counter}"));
            }
        }

        stage.flush(&self.writer);
        attempt.flush(&self.writer);
        if let Some(job) = &job {
            job.flush(&self.writer);
        }
        Ok(())
    }

    fn on_task_start(&mut self, e: &event::TaskStart) -> Result<(), ConflictError> {
        let app = self.graph.application(&e.app_id);
        let ti = &e.task_info;

        let stage = app.stage(e.stage_id);
        let attempt = stage.attempt(e.stage_attempt_id);
        let job = app.job_for_stage(stage.id);
        let executor = app.executor(ti.executor_id.as_deref().unwrap_or("unknown"));
        let task = stage.task(ti.index);
        let task_attempt = attempt.task_attempt(ti.task_id);
        app.record_attempt_site(ti.task_id, stage.id, attempt.id);

        task_attempt.apply_task_info(ti)?;

        let prev_task_status = task.status();
        let prev_attempt_status = task_attempt.status();

        if let Some(prev) = prev_attempt_status {
            self.anomaly();
            error!(
                app = %app.id(),
                stage = stage.id,
                stage_attempt = attempt.id,
                task = ti.index,
                task_attempt = ti.task_id,
                status = %prev,
                "task attempt started with an extant status",
            );
        } else {
            task_attempt.set("status", Status::Running.value(), false)?;
            attempt.inc("taskCounts.running");

            let prefix = Executor::stage_prefix(stage.id, attempt.id);
            executor.inc("taskCounts.running");
            executor.inc("taskCounts.num");
            executor.inc(&format!("{prefix}taskCounts.running"));
            executor.inc(&format!("{prefix}taskCounts.num"));

            // Task-level counters move only on the first attempt or a
            // retry of a failed task. A start against a running or
            // succeeded task is outside the machine.
            match plan(prev_task_status, Status::Running) {
                Outcome::Start => {
                    task.set("status", Status::Running.value(), false)?;
                    stage.inc("taskCounts.running");
                    if let Some(job) = &job {
                        job.inc("taskCounts.running");
                    }
                }
                Outcome::Retry => {
                    task.set("status", Status::Running.value(), true)?;
                    stage.dec("taskCounts.failed");
                    stage.inc("taskCounts.running");
                    if let Some(job) = &job {
                        job.dec("taskCounts.failed");
                        job.inc("taskCounts.running");
                    }
                }
                _ => {
                    self.anomaly();
                    error!(
                        app = %app.id(),
                        stage = stage.id,
                        task = ti.index,
                        task_attempt = ti.task_id,
                        status = status_label(prev_task_status),
                        "task attempt started while the task is not startable",
                    );
                }
            }
        }

        if let Some(job) = &job {
            job.flush(&self.writer);
        }
        stage.flush(&self.writer);
        attempt.flush(&self.writer);
        task.flush(&self.writer);
        task_attempt.flush(&self.writer);
        executor.flush(&self.writer);
        Ok(())
    }

    fn on_task_getting_result(
        &mut self,
        e: &event::TaskGettingResult,
    ) -> Result<(), ConflictError> {
        let app = self.graph.application(&e.app_id);
        let ti = &e.task_info;

        let Some((stage_id, stage_attempt_id)) = app.attempt_site(ti.task_id) else {
            self.anomaly();
            warn!(
                app = %app.id(),
                task_attempt = ti.task_id,
                "result fetch for a task attempt that never started",
            );
            return Ok(());
        };

        let task_attempt = app
            .stage(stage_id)
            .attempt(stage_attempt_id)
            .task_attempt(ti.task_id);
        task_attempt.apply_task_info(ti)?;
        task_attempt.flush(&self.writer);
        Ok(())
    }

    fn on_task_end(&mut self, e: &event::TaskEnd) -> Result<(), ConflictError> {
        let app = self.graph.application(&e.app_id);
        let ti = &e.task_info;

        let stage = app.stage(e.stage_id);
        let attempt = stage.attempt(e.stage_attempt_id);
        let job = app.job_for_stage(stage.id);
        let executor = app.executor(ti.executor_id.as_deref().unwrap_or("unknown"));
        let task = stage.task(ti.index);
        let task_attempt = attempt.task_attempt(ti.task_id);

        task.set("type", json!(e.task_type), false)?;
        let prev_task_status = task.status();
        let prev_task_metrics = task.get("metrics");

        let prev_attempt_status = task_attempt.status();
        let prev_attempt_metrics = task_attempt.get("metrics");

        if let Some(reason) = &e.task_end_reason {
            task_attempt.set("end", strip_key_spaces(reason), false)?;
        }
        task_attempt.apply_task_info(ti)?;

        // A present-but-empty metrics field is a zero tree, not absent.
        let new_metrics = e
            .task_metrics
            .as_ref()
            .map(strip_key_spaces)
            .unwrap_or_else(|| json!({}));
        task_attempt.set("metrics", new_metrics.clone(), true)?;

        // Attempt path: this attempt's delta versus its own previous
        // snapshot feeds the cumulative sums.
        let attempt_delta = metrics::sub(Some(&new_metrics), prev_attempt_metrics.as_ref());
        let exec_stage_metrics = format!(
            "{}metrics",
            Executor::stage_prefix(stage.id, attempt.id)
        );
        let mut broadcast: Vec<(&Props, &str)> = vec![
            (attempt.props(), "metrics"),
            (executor.props(), "metrics"),
            (executor.props(), exec_stage_metrics.as_str()),
        ];
        if let Some(job) = &job {
            broadcast.push((job.props(), "metrics"));
        }
        for (props, key) in broadcast {
            let sum = metrics::add(props.get(key).as_ref(), Some(&attempt_delta));
            props.set(key, sum, true)?;
        }

        // Task path: the best-known snapshot across attempts, whose delta
        // feeds the stage. Independent of the attempt path above.
        let new_task_metrics = metrics::max(prev_task_metrics.as_ref(), Some(&new_metrics));
        let task_delta = metrics::sub(Some(&new_task_metrics), prev_task_metrics.as_ref());
        task.set("metrics", new_task_metrics, true)?;
        let stage_sum = metrics::add(stage.get("metrics").as_ref(), Some(&task_delta));
        stage.set("metrics", stage_sum, true)?;

        let rdds = executor.update_blocks(&app, new_metrics.get("UpdatedBlocks"))?;

        let succeeded = !ti.failed.unwrap_or(false);
        let new_status = if succeeded {
            Status::Succeeded
        } else {
            Status::Failed
        };
        let counter = if succeeded {
            "taskCounts.succeeded"
        } else {
            "taskCounts.failed"
        };

        if prev_attempt_status == Some(Status::Running) {
            task_attempt.set("status", new_status.value(), true)?;
            attempt.dec("taskCounts.running");
            attempt.inc(counter);

            let prefix = Executor::stage_prefix(stage.id, attempt.id);
            executor.dec("taskCounts.running");
            executor.inc(counter);
            executor.dec(&format!("{prefix}taskCounts.running"));
            executor.inc(&format!("{prefix}{counter}"));

            match plan(prev_task_status, new_status) {
                Outcome::Finish(_) => {
                    task.set("status", new_status.value(), true)?;
                    stage.dec("taskCounts.running");
                    stage.inc(counter);
                    if let Some(job) = &job {
                        job.dec("taskCounts.running");
                        job.inc(counter);
                    }
                }
                Outcome::LateSuccess => {
                    task.set("status", new_status.value(), true)?;
                    stage.dec("taskCounts.failed");
                    stage.inc("taskCounts.succeeded");
                    if let Some(job) = &job {
                        job.dec("taskCounts.failed");
                        job.inc("taskCounts.succeeded");
                    }
                }
                Outcome::AlreadySucceeded => {
                    // A late outcome for a task that already succeeded
                    // (usually a lost speculative race) changes nothing.
                    self.anomaly();
                    info!(
                        app = %app.id(),
                        stage = stage.id,
                        task = ti.index,
                        task_attempt = ti.task_id,
                        outcome = %new_status,
                        "ignoring outcome for an already-succeeded task",
                    );
                }
                _ => {
                    self.anomaly();
                    error!(
                        app = %app.id(),
                        stage = stage.id,
                        task = ti.index,
                        task_attempt = ti.task_id,
                        prev = status_label(prev_task_status),
                        new = %new_status,
                        "task end outside the status machine",
                    );
                }
            }
        } else {
            self.anomaly();
            error!(
                app = %app.id(),
                stage = stage.id,
                stage_attempt = attempt.id,
                task = ti.index,
                task_attempt = ti.task_id,
                prev = status_label(prev_attempt_status),
                new = %new_status,
                "task end for an attempt that is not running",
            );
        }

        stage.flush(&self.writer);
        attempt.flush(&self.writer);
        task.flush(&self.writer);
        task_attempt.flush(&self.writer);
        executor.flush(&self.writer);
        if let Some(job) = &job {
            job.flush(&self.writer);
        }
        app.flush(&self.writer);
        for rdd in rdds {
            rdd.flush(&self.writer);
        }
        Ok(())
    }

    fn on_environment_update(&mut self, e: &event::EnvironmentUpdate) -> Result<(), ConflictError> {
        let app = self.graph.application(&e.app_id);
        let env = app.environment();
        // Listings are replaced wholesale on every update.
        env.set_all(
            [
                ("jvm", pairs(e.jvm_information.as_ref())),
                ("spark", pairs(e.spark_properties.as_ref())),
                ("system", pairs(e.system_properties.as_ref())),
                ("classpath", pairs(e.classpath_entries.as_ref())),
            ],
            true,
        )?;
        env.flush(&self.writer);
        Ok(())
    }

    fn on_block_manager_added(&mut self, e: &event::BlockManagerEvent) -> Result<(), ConflictError> {
        let app = self.graph.application(&e.app_id);
        let bm = &e.block_manager_id;
        let executor = app.executor(&bm.executor_id);

        executor.set_all(
            [
                ("maxMem", json!(e.maximum_memory)),
                ("time.start", process_time(e.timestamp)),
                ("host", json!(bm.host)),
                ("port", json!(bm.port)),
            ],
            true,
        )?;
        executor.flush(&self.writer);

        app.inc_by("maxMem", e.maximum_memory.unwrap_or(0));
        app.flush(&self.writer);
        Ok(())
    }

    fn on_block_manager_removed(
        &mut self,
        e: &event::BlockManagerEvent,
    ) -> Result<(), ConflictError> {
        let app = self.graph.application(&e.app_id);
        let bm = &e.block_manager_id;
        let executor = app.executor(&bm.executor_id);

        executor.set_all(
            [
                ("time.end", process_time(e.timestamp)),
                ("host", json!(bm.host)),
                ("port", json!(bm.port)),
            ],
            true,
        )?;
        executor.flush(&self.writer);

        let max_mem = executor
            .get("maxMem")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        app.dec_by("maxMem", max_mem);
        app.flush(&self.writer);
        Ok(())
    }

    fn on_unpersist_rdd(&mut self, e: &event::UnpersistRdd) -> Result<(), ConflictError> {
        let app = self.graph.application(&e.app_id);
        let rdd = app.rdd(e.rdd_id);
        rdd.set("unpersisted", json!(true), false)?;
        rdd.flush(&self.writer);
        Ok(())
    }

    fn on_executor_added(&mut self, e: &event::ExecutorAdded) -> Result<(), ConflictError> {
        let app = self.graph.application(&e.app_id);
        let ei = &e.executor_info;
        let executor = app.executor(&e.executor_id);

        executor.set_all(
            [
                ("time.start", process_time(e.timestamp)),
                ("host", json!(ei.host)),
                ("cores", json!(ei.total_cores)),
                ("urls", json!(ei.log_urls)),
            ],
            false,
        )?;
        executor.flush(&self.writer);

        app.inc("executors");
        app.flush(&self.writer);
        Ok(())
    }

    fn on_executor_removed(&mut self, e: &event::ExecutorRemoved) -> Result<(), ConflictError> {
        let app = self.graph.application(&e.app_id);
        let executor = app.executor(&e.executor_id);

        executor.set_all(
            [
                ("time.end", process_time(e.timestamp)),
                ("reason", json!(e.removed_reason)),
            ],
            false,
        )?;
        executor.flush(&self.writer);

        app.dec("executors");
        app.flush(&self.writer);
        Ok(())
    }
}
