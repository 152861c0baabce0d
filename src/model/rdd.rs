use std::sync::Arc;

use serde_json::json;

use crate::event::{strip_key_spaces, RddInfo};
use crate::state::{ConflictError, Props, Record};
use crate::store::Collection;

use super::Stateful;

pub struct Rdd {
    pub app_id: Arc<str>,
    pub id: i64,
    props: Props,
}

impl Rdd {
    pub(super) fn new(app_id: &Arc<str>, id: i64) -> Self {
        let record = Record::create(
            Collection::Rdds,
            format!("RDD[{app_id}:{id}]"),
            vec![("appId", json!(app_id.as_ref())), ("rddId", json!(id))],
            false,
        );
        Self {
            app_id: Arc::clone(app_id),
            id,
            props: Props::Own(record),
        }
    }

    pub fn apply_rdd_info(&self, ri: &RddInfo) -> Result<(), ConflictError> {
        self.set_all(
            [
                ("name", json!(ri.name)),
                ("numPartitions", json!(ri.num_partitions)),
            ],
            false,
        )?;
        // Caching state changes as partitions materialize and evict.
        self.set_all(
            [
                (
                    "storageLevel",
                    ri.storage_level
                        .as_ref()
                        .map(strip_key_spaces)
                        .unwrap_or(serde_json::Value::Null),
                ),
                ("numCachedPartitions", json!(ri.num_cached_partitions)),
                ("memSize", json!(ri.memory_size)),
                ("diskSize", json!(ri.disk_size)),
            ],
            true,
        )
    }
}

impl Stateful for Rdd {
    fn props(&self) -> &Props {
        &self.props
    }
}
