//! Remote state ledger.
//!
//! One JSON document in the stage's state bucket records what each resource
//! reported after its last create or update.

use serde_json::{Value, json};
use stagehand_core::cloud::{ObjectStoreApi, PublicAccessBlock};
use stagehand_core::{Error, Result};
use std::sync::Arc;
use tracing::{debug, info};

use crate::storage::empty_and_delete_bucket;

pub const LEDGER_KEY: &str = "resources.json";
pub const LEDGER_VERSION: u64 = 1;

pub struct StateLedger {
    objects: Arc<dyn ObjectStoreApi>,
    bucket: String,
    region: String,
}

impl StateLedger {
    pub fn new(objects: Arc<dyn ObjectStoreApi>, bucket: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            objects,
            bucket: bucket.into(),
            region: region.into(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub async fn exists(&self) -> Result<bool> {
        self.objects.bucket_exists(&self.bucket).await
    }

    /// Create the bucket with every public access path blocked.
    pub async fn ensure_bucket(&self) -> Result<()> {
        if !self.exists().await? {
            info!(bucket = %self.bucket, "Creating state bucket");
            self.objects.create_bucket(&self.bucket, &self.region).await?;
        }
        self.objects
            .put_public_access_block(&self.bucket, PublicAccessBlock::all_blocked())
            .await
    }

    /// The current document, or an empty one.
    pub async fn load(&self) -> Result<Value> {
        if !self.exists().await? {
            return Ok(empty_document());
        }
        match self.objects.get_object(&self.bucket, LEDGER_KEY).await? {
            Some(raw) => match serde_json::from_slice(&raw)? {
                document @ Value::Object(_) => Ok(document),
                _ => Err(Error::InvalidState(format!(
                    "{}/{} is not a JSON object",
                    self.bucket, LEDGER_KEY
                ))),
            },
            None => Ok(empty_document()),
        }
    }

    /// Merge `partial` into `resources` and overwrite the document.
    pub async fn record(&self, partial: Value) -> Result<Value> {
        let mut document = self.load().await?;
        if !document.get("resources").is_some_and(Value::is_object) {
            document["resources"] = json!({});
        }
        deep_merge(&mut document["resources"], partial);

        let body = serde_json::to_vec_pretty(&document)?;
        self.objects
            .put_object(&self.bucket, LEDGER_KEY, body, Some("application/json"))
            .await?;
        debug!(bucket = %self.bucket, "Recorded resource state");
        Ok(document)
    }

    /// Delete every object version, then the bucket.
    pub async fn delete_bucket(&self) -> Result<()> {
        if !self.exists().await? {
            return Ok(());
        }
        info!(bucket = %self.bucket, "Deleting state bucket");
        empty_and_delete_bucket(self.objects.as_ref(), &self.bucket).await
    }
}

fn empty_document() -> Value {
    json!({ "version": LEDGER_VERSION, "resources": {} })
}

/// Objects merge key by key; anything else replaces the target.
pub fn deep_merge(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                match target.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (target, patch) => *target = patch,
    }
}
