//! Executors: worker processes running task attempts and holding cached
//! blocks. Each carries cumulative task counts and metrics plus a
//! per-stage-attempt breakdown under `stages.<stageId>.<attemptId>.*`.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::warn;

use crate::state::{ConflictError, Props, Record};
use crate::store::Collection;

use super::{Application, Rdd, Stateful};

pub struct Executor {
    pub app_id: Arc<str>,
    pub id: Arc<str>,
    props: Props,
}

impl Executor {
    pub(super) fn new(app_id: &Arc<str>, id: &str) -> Self {
        let record = Record::create(
            Collection::Executors,
            format!("Executor[{app_id}:{id}]"),
            vec![("appId", json!(app_id.as_ref())), ("execId", json!(id))],
            false,
        );
        Self {
            app_id: Arc::clone(app_id),
            id: Arc::from(id),
            props: Props::Own(record),
        }
    }

    /// Key prefix of this executor's per-stage-attempt breakdown.
    pub fn stage_prefix(stage_id: i64, stage_attempt_id: i64) -> String {
        format!("stages.{stage_id}.{stage_attempt_id}.")
    }

    /// Applies the `UpdatedBlocks` list from a task attempt's metrics to
    /// this executor and to the RDDs the blocks belong to. Returns the
    /// touched RDDs so the caller can flush them.
    pub fn update_blocks(
        &self,
        app: &Application,
        blocks: Option<&Value>,
    ) -> Result<Vec<Arc<Rdd>>, ConflictError> {
        let Some(Value::Array(entries)) = blocks else {
            return Ok(Vec::new());
        };

        let mut rdds = Vec::new();
        for entry in entries {
            let Some(block_id) = entry.get("BlockID").and_then(Value::as_str) else {
                warn!(
                    app = %self.app_id,
                    executor = %self.id,
                    "block update without a block id, skipping",
                );
                continue;
            };
            let status = entry.get("Status").cloned().unwrap_or(Value::Null);

            self.set(&format!("blocks.{block_id}"), status.clone(), true)?;

            if let Some(rdd_id) = rdd_block_id(block_id) {
                let rdd = app.rdd(rdd_id);
                rdd.set(&format!("blocks.{block_id}.{}", self.id), status, true)?;
                rdds.push(rdd);
            }
        }
        Ok(rdds)
    }
}

impl Stateful for Executor {
    fn props(&self) -> &Props {
        &self.props
    }
}

/// Parses the RDD id out of a block id like `rdd_12_3`.
fn rdd_block_id(block_id: &str) -> Option<i64> {
    block_id
        .strip_prefix("rdd_")?
        .split('_')
        .next()?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rdd_block_id() {
        assert_eq!(rdd_block_id("rdd_12_3"), Some(12));
        assert_eq!(rdd_block_id("rdd_0_0"), Some(0));
        assert_eq!(rdd_block_id("broadcast_4"), None);
        assert_eq!(rdd_block_id("rdd_x_1"), None);
    }
}
