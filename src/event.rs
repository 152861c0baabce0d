//! Listener event records.
//!
//! One decoded record per event on the relay stream. Field names follow the
//! Spark listener JSON wire format (`"Stage Infos"`, `"Task ID"`, ...); the
//! relay additionally stamps every event with the owning `appId`.

use serde::Deserialize;
use serde_json::{json, Map, Value};

/// A single decoded listener event, discriminated by the wire `Event` tag.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "Event")]
pub enum ListenerEvent {
    #[serde(rename = "SparkListenerApplicationStart")]
    ApplicationStart(ApplicationStart),
    #[serde(rename = "SparkListenerApplicationEnd")]
    ApplicationEnd(ApplicationEnd),
    #[serde(rename = "SparkListenerJobStart")]
    JobStart(JobStart),
    #[serde(rename = "SparkListenerJobEnd")]
    JobEnd(JobEnd),
    #[serde(rename = "SparkListenerStageSubmitted")]
    StageSubmitted(StageSubmitted),
    #[serde(rename = "SparkListenerStageCompleted")]
    StageCompleted(StageCompleted),
    #[serde(rename = "SparkListenerTaskStart")]
    TaskStart(TaskStart),
    #[serde(rename = "SparkListenerTaskGettingResult")]
    TaskGettingResult(TaskGettingResult),
    #[serde(rename = "SparkListenerTaskEnd")]
    TaskEnd(TaskEnd),
    #[serde(rename = "SparkListenerEnvironmentUpdate")]
    EnvironmentUpdate(EnvironmentUpdate),
    #[serde(rename = "SparkListenerBlockManagerAdded")]
    BlockManagerAdded(BlockManagerEvent),
    #[serde(rename = "SparkListenerBlockManagerRemoved")]
    BlockManagerRemoved(BlockManagerEvent),
    #[serde(rename = "SparkListenerUnpersistRDD")]
    UnpersistRdd(UnpersistRdd),
    #[serde(rename = "SparkListenerExecutorAdded")]
    ExecutorAdded(ExecutorAdded),
    #[serde(rename = "SparkListenerExecutorRemoved")]
    ExecutorRemoved(ExecutorRemoved),
    // Reserved: carried on the stream but intentionally not processed.
    #[serde(rename = "SparkListenerLogStart")]
    LogStart(Ignored),
    #[serde(rename = "SparkListenerExecutorMetricsUpdate")]
    ExecutorMetricsUpdate(Ignored),
}

impl ListenerEvent {
    /// Short kind label for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ApplicationStart(_) => "ApplicationStart",
            Self::ApplicationEnd(_) => "ApplicationEnd",
            Self::JobStart(_) => "JobStart",
            Self::JobEnd(_) => "JobEnd",
            Self::StageSubmitted(_) => "StageSubmitted",
            Self::StageCompleted(_) => "StageCompleted",
            Self::TaskStart(_) => "TaskStart",
            Self::TaskGettingResult(_) => "TaskGettingResult",
            Self::TaskEnd(_) => "TaskEnd",
            Self::EnvironmentUpdate(_) => "EnvironmentUpdate",
            Self::BlockManagerAdded(_) => "BlockManagerAdded",
            Self::BlockManagerRemoved(_) => "BlockManagerRemoved",
            Self::UnpersistRdd(_) => "UnpersistRDD",
            Self::ExecutorAdded(_) => "ExecutorAdded",
            Self::ExecutorRemoved(_) => "ExecutorRemoved",
            Self::LogStart(_) => "LogStart",
            Self::ExecutorMetricsUpdate(_) => "ExecutorMetricsUpdate",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApplicationStart {
    #[serde(rename = "appId")]
    pub app_id: String,
    #[serde(rename = "App Name", default)]
    pub app_name: Option<String>,
    #[serde(rename = "User", default)]
    pub user: Option<String>,
    #[serde(rename = "Timestamp", default)]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApplicationEnd {
    #[serde(rename = "appId")]
    pub app_id: String,
    #[serde(rename = "Timestamp", default)]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobStart {
    #[serde(rename = "appId")]
    pub app_id: String,
    #[serde(rename = "Job ID")]
    pub job_id: i64,
    #[serde(rename = "Submission Time", default)]
    pub submission_time: Option<i64>,
    #[serde(rename = "Stage Infos", default)]
    pub stage_infos: Vec<StageInfo>,
    #[serde(rename = "Stage IDs", default)]
    pub stage_ids: Vec<i64>,
    #[serde(rename = "Properties", default)]
    pub properties: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobEnd {
    #[serde(rename = "appId")]
    pub app_id: String,
    #[serde(rename = "Job ID")]
    pub job_id: i64,
    #[serde(rename = "Completion Time", default)]
    pub completion_time: Option<i64>,
    #[serde(rename = "Job Result", default)]
    pub job_result: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StageSubmitted {
    #[serde(rename = "appId")]
    pub app_id: String,
    #[serde(rename = "Stage Info")]
    pub stage_info: StageInfo,
    #[serde(rename = "Properties", default)]
    pub properties: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StageCompleted {
    #[serde(rename = "appId")]
    pub app_id: String,
    #[serde(rename = "Stage Info")]
    pub stage_info: StageInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskStart {
    #[serde(rename = "appId")]
    pub app_id: String,
    #[serde(rename = "Stage ID")]
    pub stage_id: i64,
    #[serde(rename = "Stage Attempt ID", default)]
    pub stage_attempt_id: i64,
    #[serde(rename = "Task Info")]
    pub task_info: TaskInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskGettingResult {
    #[serde(rename = "appId")]
    pub app_id: String,
    #[serde(rename = "Task Info")]
    pub task_info: TaskInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskEnd {
    #[serde(rename = "appId")]
    pub app_id: String,
    #[serde(rename = "Stage ID")]
    pub stage_id: i64,
    #[serde(rename = "Stage Attempt ID", default)]
    pub stage_attempt_id: i64,
    #[serde(rename = "Task Type", default)]
    pub task_type: Option<String>,
    #[serde(rename = "Task End Reason", default)]
    pub task_end_reason: Option<Value>,
    #[serde(rename = "Task Info")]
    pub task_info: TaskInfo,
    #[serde(rename = "Task Metrics", default)]
    pub task_metrics: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnvironmentUpdate {
    #[serde(rename = "appId")]
    pub app_id: String,
    #[serde(rename = "JVM Information", default)]
    pub jvm_information: Option<Value>,
    #[serde(rename = "Spark Properties", default)]
    pub spark_properties: Option<Value>,
    #[serde(rename = "System Properties", default)]
    pub system_properties: Option<Value>,
    #[serde(rename = "Classpath Entries", default)]
    pub classpath_entries: Option<Value>,
}

/// Shared by BlockManagerAdded and BlockManagerRemoved; the removal event
/// carries no `Maximum Memory`.
#[derive(Debug, Clone, Deserialize)]
pub struct BlockManagerEvent {
    #[serde(rename = "appId")]
    pub app_id: String,
    #[serde(rename = "Block Manager ID")]
    pub block_manager_id: BlockManagerId,
    #[serde(rename = "Maximum Memory", default)]
    pub maximum_memory: Option<i64>,
    #[serde(rename = "Timestamp", default)]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UnpersistRdd {
    #[serde(rename = "appId")]
    pub app_id: String,
    #[serde(rename = "RDD ID")]
    pub rdd_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorAdded {
    #[serde(rename = "appId")]
    pub app_id: String,
    #[serde(rename = "Timestamp", default)]
    pub timestamp: Option<i64>,
    #[serde(rename = "Executor ID")]
    pub executor_id: String,
    #[serde(rename = "Executor Info")]
    pub executor_info: ExecutorInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorRemoved {
    #[serde(rename = "appId")]
    pub app_id: String,
    #[serde(rename = "Timestamp", default)]
    pub timestamp: Option<i64>,
    #[serde(rename = "Executor ID")]
    pub executor_id: String,
    #[serde(rename = "Removed Reason", default)]
    pub removed_reason: Option<String>,
}

/// Payload of event kinds the engine receives but does not act on.
#[derive(Debug, Clone, Deserialize)]
pub struct Ignored {}

#[derive(Debug, Clone, Deserialize)]
pub struct StageInfo {
    #[serde(rename = "Stage ID")]
    pub stage_id: i64,
    #[serde(rename = "Stage Attempt ID", default)]
    pub stage_attempt_id: i64,
    #[serde(rename = "Stage Name", default)]
    pub stage_name: Option<String>,
    #[serde(rename = "Number of Tasks", default)]
    pub num_tasks: i64,
    #[serde(rename = "RDD Info", default)]
    pub rdd_info: Vec<RddInfo>,
    #[serde(rename = "Details", default)]
    pub details: Option<String>,
    #[serde(rename = "Submission Time", default)]
    pub submission_time: Option<i64>,
    #[serde(rename = "Completion Time", default)]
    pub completion_time: Option<i64>,
    #[serde(rename = "Failure Reason", default)]
    pub failure_reason: Option<String>,
    #[serde(rename = "Accumulables", default)]
    pub accumulables: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskInfo {
    #[serde(rename = "Task ID")]
    pub task_id: i64,
    #[serde(rename = "Index")]
    pub index: i64,
    #[serde(rename = "Attempt", default)]
    pub attempt: i64,
    #[serde(rename = "Launch Time", default)]
    pub launch_time: Option<i64>,
    #[serde(rename = "Executor ID", default)]
    pub executor_id: Option<String>,
    #[serde(rename = "Host", default)]
    pub host: Option<String>,
    #[serde(rename = "Locality", default)]
    pub locality: Option<String>,
    #[serde(rename = "Speculative", default)]
    pub speculative: Option<bool>,
    #[serde(rename = "Getting Result Time", default)]
    pub getting_result_time: Option<i64>,
    #[serde(rename = "Finish Time", default)]
    pub finish_time: Option<i64>,
    #[serde(rename = "Failed", default)]
    pub failed: Option<bool>,
    #[serde(rename = "Accumulables", default)]
    pub accumulables: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RddInfo {
    #[serde(rename = "RDD ID")]
    pub rdd_id: i64,
    #[serde(rename = "Name", default)]
    pub name: Option<String>,
    #[serde(rename = "Storage Level", default)]
    pub storage_level: Option<Value>,
    #[serde(rename = "Number of Partitions", default)]
    pub num_partitions: Option<i64>,
    #[serde(rename = "Number of Cached Partitions", default)]
    pub num_cached_partitions: Option<i64>,
    #[serde(rename = "Memory Size", default)]
    pub memory_size: Option<i64>,
    #[serde(rename = "Disk Size", default)]
    pub disk_size: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlockManagerId {
    #[serde(rename = "Executor ID")]
    pub executor_id: String,
    #[serde(rename = "Host", default)]
    pub host: Option<String>,
    #[serde(rename = "Port", default)]
    pub port: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorInfo {
    #[serde(rename = "Host", default)]
    pub host: Option<String>,
    #[serde(rename = "Total Cores", default)]
    pub total_cores: Option<i64>,
    #[serde(rename = "Log Urls", default)]
    pub log_urls: Option<Value>,
}

/// Collapses spaces out of every map key, recursively. The wire format uses
/// keys like `"Bytes Read"`; the store cannot address those with dotted
/// paths, so they are stored as `BytesRead`.
pub fn strip_key_spaces(value: &Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.iter().map(strip_key_spaces).collect()),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.replace(' ', ""), strip_key_spaces(v));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

/// Converts a property map into a list of `[key, value]` pairs. Environment
/// listings are stored this way.
pub fn pairs(value: Option<&Value>) -> Value {
    match value {
        Some(Value::Object(map)) => Value::Array(
            map.iter()
                .map(|(k, v)| json!([k, v]))
                .collect(),
        ),
        _ => json!([]),
    }
}

/// Maps a wire timestamp to a property value. Zero and absent timestamps
/// both mean "not yet known" and are skipped by the property bag.
pub fn process_time(t: Option<i64>) -> Value {
    match t {
        Some(ms) if ms != 0 => json!(ms),
        _ => Value::Null,
    }
}

/// Re-keys an accumulable list by accumulable id. Later events carry the
/// latest update/value for each id, so callers store this with overwrite.
pub fn accumulables_map(value: Option<&Value>) -> Value {
    let Some(Value::Array(items)) = value else {
        return Value::Null;
    };

    let mut out = Map::new();
    for item in items {
        let stripped = strip_key_spaces(item);
        let Some(id) = stripped.get("ID").and_then(Value::as_i64) else {
            continue;
        };
        let mut entry = Map::new();
        for (src, dst) in [("Name", "name"), ("Update", "update"), ("Value", "value")] {
            if let Some(v) = stripped.get(src) {
                entry.insert(dst.to_string(), v.clone());
            }
        }
        out.insert(id.to_string(), Value::Object(entry));
    }
    Value::Object(out)
}
