use std::sync::Arc;

use serde_json::json;

use crate::state::{Props, Record};
use crate::store::Collection;

use super::Stateful;

pub struct Job {
    pub app_id: Arc<str>,
    pub id: i64,
    props: Props,
}

impl Job {
    pub(super) fn new(app_id: &Arc<str>, id: i64) -> Self {
        let record = Record::create(
            Collection::Jobs,
            format!("Job[{app_id}:{id}]"),
            vec![("appId", json!(app_id.as_ref())), ("jobId", json!(id))],
            false,
        );
        Self {
            app_id: Arc::clone(app_id),
            id,
            props: Props::Own(record),
        }
    }

    /// Stage ids announced at job start. Absent until then.
    pub fn stage_ids(&self) -> Vec<i64> {
        self.get("stageIDs")
            .and_then(|v| {
                v.as_array()
                    .map(|ids| ids.iter().filter_map(serde_json::Value::as_i64).collect())
            })
            .unwrap_or_default()
    }
}

impl Stateful for Job {
    fn props(&self) -> &Props {
        &self.props
    }
}
