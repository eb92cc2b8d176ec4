//! Object storage bucket with optional public-read directories.

use async_trait::async_trait;
use serde_json::{Value, json};
use stagehand_config::StorageConfig;
use stagehand_core::cloud::{ObjectStoreApi, PublicAccessBlock};
use stagehand_core::{Error, ResourceStatus, Result};
use tracing::info;

use crate::mediator::Mediator;
use crate::resource::{Resource, ResourceContext, ResourceKind};

pub const STORAGE: &str = "storage";

/// Versions removed per delete request.
const DELETE_BATCH: usize = 1000;

/// Remove every object version and delete marker, then the bucket itself.
pub(crate) async fn empty_and_delete_bucket(objects: &dyn ObjectStoreApi, bucket: &str) -> Result<()> {
    let versions = objects.list_object_versions(bucket).await?;
    for chunk in versions.chunks(DELETE_BATCH) {
        objects.delete_object_versions(bucket, chunk).await?;
    }
    objects.delete_bucket(bucket).await
}

pub struct ObjectStore {
    ctx: ResourceContext,
    storage: StorageConfig,
    bucket: String,
}

impl ObjectStore {
    pub fn new(ctx: &ResourceContext, storage: &StorageConfig) -> Result<Self> {
        let bucket = ctx
            .config
            .format_name("storage bucket-name-format", &storage.bucket_name_format)?;
        Ok(Self {
            ctx: ctx.clone(),
            storage: storage.clone(),
            bucket,
        })
    }

    pub fn bucket_name(&self) -> &str {
        &self.bucket
    }

    fn objects(&self) -> &dyn ObjectStoreApi {
        self.ctx.clients.objects.as_ref()
    }

    /// A bucket held by another account surfaces as `Conflict`.
    pub async fn exists(&self) -> Result<bool> {
        match self.objects().bucket_exists(&self.bucket).await {
            Ok(exists) => Ok(exists),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e @ Error::Conflict(_)) => Err(e),
            Err(e) => Err(Error::Conflict(format!(
                "bucket {} might be owned by another account ({}); try another prefix",
                self.bucket, e
            ))),
        }
    }

    fn expected_block(&self) -> PublicAccessBlock {
        if self.storage.public_dirs.is_empty() {
            PublicAccessBlock::all_blocked()
        } else {
            PublicAccessBlock::policy_allowed()
        }
    }

    /// Public-read policy for `public_dirs`, `None` when there are none.
    pub fn expected_policy(&self) -> Option<Value> {
        let resources: Vec<String> = self
            .storage
            .public_dirs
            .iter()
            .map(|dir| format!("arn:aws:s3:::{}/{}/*", self.bucket, dir.trim_matches('/')))
            .collect();
        let resource = match resources.as_slice() {
            [] => return None,
            [single] => json!(single),
            _ => json!(resources),
        };
        Some(json!({
            "Version": "2008-10-17",
            "Statement": [{
                "Sid": "PublicRead",
                "Effect": "Allow",
                "Principal": {"AWS": "*"},
                "Action": "s3:GetObject",
                "Resource": resource,
            }]
        }))
    }

    async fn block_drifted(&self) -> Result<bool> {
        let current = self.objects().get_public_access_block(&self.bucket).await?;
        Ok(current != Some(self.expected_block()))
    }

    async fn policy_drifted(&self) -> Result<bool> {
        let current = self.objects().get_bucket_policy(&self.bucket).await?;
        Ok(current != self.expected_policy())
    }

    async fn ensure_public_access_block(&self) -> Result<()> {
        if !self.block_drifted().await? {
            info!(bucket = %self.bucket, "Public access block is already configured");
            return Ok(());
        }
        info!(bucket = %self.bucket, "Updating public access block");
        self.objects()
            .put_public_access_block(&self.bucket, self.expected_block())
            .await
    }

    async fn ensure_policy(&self) -> Result<()> {
        if !self.policy_drifted().await? {
            info!(bucket = %self.bucket, "Bucket policy is already configured");
            return Ok(());
        }
        match self.expected_policy() {
            Some(policy) => {
                info!(bucket = %self.bucket, dirs = ?self.storage.public_dirs, "Updating bucket policy");
                self.objects().put_bucket_policy(&self.bucket, &policy).await
            }
            None => {
                info!(bucket = %self.bucket, "Deleting bucket policy");
                self.objects().delete_bucket_policy(&self.bucket).await
            }
        }
    }
}

#[async_trait]
impl Resource for ObjectStore {
    fn name(&self) -> String {
        STORAGE.to_string()
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Storage
    }

    fn description(&self) -> String {
        format!("Create bucket: {}", self.bucket)
    }

    async fn status(&self) -> Result<ResourceStatus> {
        if !self.exists().await? {
            return Ok(ResourceStatus::NoExist);
        }
        if self.block_drifted().await? || self.policy_drifted().await? {
            return Ok(ResourceStatus::RequireUpdate);
        }
        Ok(ResourceStatus::Completed)
    }

    async fn create(&self, _mediator: Option<&Mediator>) -> Result<()> {
        info!(bucket = %self.bucket, "Creating bucket");
        self.objects()
            .create_bucket(&self.bucket, &self.ctx.config.region)
            .await?;
        self.ensure_public_access_block().await?;
        self.ensure_policy().await
    }

    async fn update(&self, _mediator: Option<&Mediator>) -> Result<()> {
        self.ensure_public_access_block().await?;
        self.ensure_policy().await
    }

    async fn delete(&self) -> Result<()> {
        info!(bucket = %self.bucket, "Emptying and deleting bucket");
        empty_and_delete_bucket(self.objects(), &self.bucket).await
    }

    fn state_info(&self) -> Result<Value> {
        Ok(json!({ "storage": { "bucket_name": self.bucket } }))
    }

    async fn destroy_targets(&self) -> Result<Vec<String>> {
        if !self.exists().await? {
            return Ok(Vec::new());
        }
        Ok(vec![format!("bucket {} and every object in it", self.bucket)])
    }
}
