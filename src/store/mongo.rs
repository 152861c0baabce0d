//! MongoDB store backend.

use anyhow::{Context, Result};
use mongodb::bson::{self, Bson, Document};
use mongodb::options::ClientOptions;
use mongodb::{Client, Database};
use serde_json::Value;

use crate::config::StoreConfig;

use super::UpsertRequest;

#[derive(Clone)]
pub struct MongoStore {
    db: Database,
}

impl MongoStore {
    pub async fn connect(cfg: &StoreConfig) -> Result<Self> {
        let mut options = ClientOptions::parse(&cfg.url)
            .await
            .context("parsing store url")?;
        options.connect_timeout = Some(cfg.connect_timeout);
        options.server_selection_timeout = Some(cfg.connect_timeout);
        let client = Client::with_options(options).context("building store client")?;
        Ok(Self {
            db: client.database(&cfg.database),
        })
    }

    /// One `update_one(filter, {$set, $unset})` with upsert semantics.
    /// Dotted keys in the pending-write set address nested fields, so the
    /// request maps onto the update document directly.
    pub async fn upsert(&self, req: &UpsertRequest) -> Result<()> {
        let mut filter = Document::new();
        for (k, v) in req.identity.iter() {
            filter.insert(*k, to_bson(v)?);
        }

        let mut update = Document::new();
        if !req.set.is_empty() {
            let mut set = Document::new();
            for (k, v) in &req.set {
                set.insert(k, to_bson(v)?);
            }
            update.insert("$set", set);
        }
        if !req.unset.is_empty() {
            let mut unset = Document::new();
            for k in &req.unset {
                unset.insert(k, Bson::Int32(1));
            }
            update.insert("$unset", unset);
        }
        if update.is_empty() {
            return Ok(());
        }

        self.db
            .collection::<Document>(req.collection.name())
            .update_one(filter, update)
            .upsert(true)
            .await
            .with_context(|| format!("upserting {}", req.label))?;
        Ok(())
    }
}

fn to_bson(v: &Value) -> Result<Bson> {
    bson::to_bson(v).context("encoding property value")
}
