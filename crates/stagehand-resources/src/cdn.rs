//! CDN distribution in front of the origin bucket and the container APIs.

use async_trait::async_trait;
use serde_json::{Value, json};
use stagehand_config::render::{cdn_bucket_name, cdn_origin_path, cdn_stack_name, render_cdn};
use stagehand_config::{CdnConfig, CdnExports, RenderedTemplate, RouteConfig, StageConfig};
use stagehand_core::cloud::{ObjectStoreApi, PublicAccessBlock};
use stagehand_core::wait::PollConfig;
use stagehand_core::{Error, ResourceStatus, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::cdn_keys::{CdnSigningKeys, cdn_keys_resource_name};
use crate::container::{CONTAINER, ComputeContainer};
use crate::mediator::Mediator;
use crate::resource::{Resource, ResourceContext, ResourceKind};
use crate::stack::{Stack, TemplateSource};

const APPLY_POLL: PollConfig = PollConfig::secs(600, 10);
const POLICY_VERSION: &str = "2012-10-17";

pub fn cdn_resource_name(cdn: &str) -> String {
    format!("cdn:{}", cdn)
}

struct CdnSource {
    config: Arc<StageConfig>,
    cdn: CdnConfig,
    keys: Option<Arc<CdnSigningKeys>>,
    container: Option<Arc<ComputeContainer>>,
}

#[async_trait]
impl TemplateSource for CdnSource {
    async fn render(&self) -> Result<RenderedTemplate> {
        let key_group_id = match &self.keys {
            Some(keys) => keys.key_group_id().await?,
            None => None,
        };
        let api_domains = match &self.container {
            Some(container) => container.api_domains().await?,
            None => Default::default(),
        };
        let exports = CdnExports {
            key_group_id,
            api_domains,
        };
        Ok(render_cdn(&self.config, &self.cdn, &exports)?)
    }
}

/// Summary of one frontend upload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadReport {
    pub uploaded: Vec<String>,
    pub invalidation: Option<String>,
}

pub struct CdnDistribution {
    ctx: ResourceContext,
    cdn: CdnConfig,
    bucket: String,
    origin_path: String,
    keys: Option<Arc<CdnSigningKeys>>,
    container: Option<Arc<ComputeContainer>>,
    stack: Stack,
}

impl CdnDistribution {
    pub fn new(
        ctx: &ResourceContext,
        cdn: &CdnConfig,
        keys: Option<Arc<CdnSigningKeys>>,
        container: Option<Arc<ComputeContainer>>,
    ) -> Result<Self> {
        let source = CdnSource {
            config: ctx.config.clone(),
            cdn: cdn.clone(),
            keys: keys.clone(),
            container: container.clone(),
        };
        let stack = Stack::new(
            cdn_stack_name(&ctx.config, &cdn.name),
            ctx.clients.edge_stacks.clone(),
            Arc::new(source),
        );
        Ok(Self {
            ctx: ctx.clone(),
            cdn: cdn.clone(),
            bucket: cdn_bucket_name(&ctx.config, cdn)?,
            origin_path: cdn_origin_path(&ctx.config, cdn)?,
            keys,
            container,
            stack,
        })
    }

    pub fn bucket_name(&self) -> &str {
        &self.bucket
    }

    pub fn cdn_name(&self) -> &str {
        &self.cdn.name
    }

    fn objects(&self) -> &dyn ObjectStoreApi {
        self.ctx.clients.objects.as_ref()
    }

    async fn distribution_id(&self) -> Result<String> {
        self.stack
            .require_outputs()
            .await?
            .remove("DistributionId")
            .ok_or_else(|| {
                Error::NotReady(format!("distribution of cdn {} is not created yet", self.cdn.name))
            })
    }

    /// Statement granting the distribution read access to the origin path.
    async fn policy_statement(&self) -> Result<Value> {
        let account = self.ctx.clients.identity.account_id().await?;
        let distribution = self.distribution_id().await?;
        Ok(json!({
            "Sid": format!("AllowCloudFrontReadOnly{}", capitalize(&self.cdn.name)),
            "Effect": "Allow",
            "Principal": {"Service": "cloudfront.amazonaws.com"},
            "Action": "s3:GetObject",
            "Resource": format!("arn:aws:s3:::{}{}/*", self.bucket, self.origin_path),
            "Condition": {
                "StringEquals": {
                    "AWS:SourceArn": format!("arn:aws:cloudfront::{}:distribution/{}", account, distribution)
                }
            }
        }))
    }

    async fn ensure_origin_bucket(&self) -> Result<()> {
        if self.objects().bucket_exists(&self.bucket).await? {
            return Ok(());
        }
        info!(bucket = %self.bucket, "Creating origin bucket");
        self.objects()
            .create_bucket(&self.bucket, &self.ctx.config.region)
            .await?;
        self.objects()
            .put_public_access_block(&self.bucket, PublicAccessBlock::all_blocked())
            .await
    }

    async fn ensure_redirect_from(&self) -> Result<()> {
        if self.cdn.redirect_from.is_empty() {
            return Ok(());
        }
        let domain = self.cdn.domain.as_deref().ok_or_else(|| {
            Error::Configuration(format!("cdn {} needs a domain to redirect to", self.cdn.name))
        })?;
        for bucket in &self.cdn.redirect_from {
            if !self.objects().bucket_exists(bucket).await? {
                info!(bucket = %bucket, "Creating redirect bucket");
                self.objects()
                    .create_bucket(bucket, &self.ctx.config.region)
                    .await?;
            }
            if !self.objects().list_objects(bucket, "").await?.is_empty() {
                return Err(Error::Conflict(format!(
                    "redirect bucket {} must be empty",
                    bucket
                )));
            }
            self.objects().put_bucket_website_redirect(bucket, domain).await?;
        }
        Ok(())
    }

    async fn delete_redirect_from(&self) -> Result<()> {
        for bucket in &self.cdn.redirect_from {
            match self.objects().bucket_exists(bucket).await {
                Ok(true) => {
                    self.objects().delete_bucket_website(bucket).await?;
                    info!(bucket = %bucket, "Removed website redirect; delete the bucket manually");
                }
                Ok(false) => warn!(bucket = %bucket, "Redirect bucket does not exist"),
                Err(e) => warn!(bucket = %bucket, error = %e, "Redirect bucket may belong to another account"),
            }
        }
        Ok(())
    }

    async fn ensure_bucket_policy(&self) -> Result<()> {
        let statement = self.policy_statement().await?;
        let policy = match self.objects().get_bucket_policy(&self.bucket).await? {
            None => json!({ "Version": POLICY_VERSION, "Statement": [statement] }),
            Some(mut policy) => {
                if policy["Version"] != POLICY_VERSION {
                    return Err(Error::Conflict(format!(
                        "bucket policy of {} has version {}; update it manually",
                        self.bucket, policy["Version"]
                    )));
                }
                let statements = statements_mut(&mut policy, &self.bucket)?;
                if statements.contains(&statement) {
                    info!(bucket = %self.bucket, "Bucket policy is already configured");
                    return Ok(());
                }
                statements.push(statement);
                policy
            }
        };
        info!(bucket = %self.bucket, "Updating origin bucket policy");
        self.objects().put_bucket_policy(&self.bucket, &policy).await
    }

    async fn delete_bucket_policy_statement(&self) -> Result<()> {
        if !self.objects().bucket_exists(&self.bucket).await? {
            return Ok(());
        }
        let Some(mut policy) = self.objects().get_bucket_policy(&self.bucket).await? else {
            debug!(bucket = %self.bucket, "No bucket policy to clean up");
            return Ok(());
        };
        if policy["Version"] != POLICY_VERSION {
            warn!(bucket = %self.bucket, "Bucket policy version mismatch; check the policy manually");
            return Ok(());
        }
        let statement = self.policy_statement().await?;
        let statements = statements_mut(&mut policy, &self.bucket)?;
        let before = statements.len();
        statements.retain(|s| *s != statement);
        if statements.len() == before {
            warn!(bucket = %self.bucket, "Distribution statement not found; check the policy manually");
            return Ok(());
        }
        if statements.is_empty() {
            self.objects().delete_bucket_policy(&self.bucket).await
        } else {
            self.objects().put_bucket_policy(&self.bucket, &policy).await
        }
    }

    async fn apply(&self) -> Result<()> {
        self.ensure_origin_bucket().await?;
        self.ensure_redirect_from().await?;
        self.stack.clear_cache().await;
        if !self.stack.status().await?.exists() {
            self.stack.create().await?;
        } else if !self.stack.yaml_synced().await? {
            self.stack.update().await?;
        }
        info!(stack = %self.stack.name(), "Waiting for the distribution; this may take a few minutes");
        self.stack
            .wait_status(
                ResourceStatus::Completed,
                self.ctx.poll(APPLY_POLL),
                &[ResourceStatus::Failed],
            )
            .await?;
        self.ensure_bucket_policy().await
    }

    /// Upload every route's `upload-from` directory, then invalidate the cache.
    pub async fn upload(&self) -> Result<UploadReport> {
        let status = self.stack.status().await?;
        if status != ResourceStatus::Completed {
            return Err(Error::NotReady(format!(
                "cdn {} is {}, not COMPLETED",
                self.cdn.name, status
            )));
        }
        let mut report = UploadReport::default();
        for route in &self.cdn.routes {
            let Some(dir) = &route.upload_from else {
                continue;
            };
            let dir = self.ctx.config.resolve_path(dir);
            report
                .uploaded
                .extend(self.upload_dir(route, &dir).await?);
        }
        if report.uploaded.is_empty() {
            return Ok(report);
        }
        let distribution = self.distribution_id().await?;
        let id = self
            .ctx
            .clients
            .cdn
            .create_invalidation(&distribution, &["/*".to_string()])
            .await?;
        info!(distribution = %distribution, invalidation = %id, files = report.uploaded.len(), "Invalidated CDN cache");
        report.invalidation = Some(id);
        Ok(report)
    }

    async fn upload_dir(&self, route: &RouteConfig, dir: &Path) -> Result<Vec<String>> {
        if !dir.is_dir() {
            return Err(Error::Configuration(format!(
                "upload-from directory {} does not exist",
                dir.display()
            )));
        }
        let prefix = object_prefix(&self.origin_path, &route.path);
        let mut uploaded = Vec::new();
        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = entry.map_err(|e| Error::Io(e.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(dir) else {
                continue;
            };
            let relative = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let key = if prefix.is_empty() {
                relative
            } else {
                format!("{}/{}", prefix, relative)
            };
            let body = tokio::fs::read(entry.path()).await?;
            self.objects()
                .put_object(&self.bucket, &key, body, Some(content_type(&key).as_str()))
                .await?;
            debug!(bucket = %self.bucket, key = %key, "Uploaded");
            uploaded.push(key);
        }
        Ok(uploaded)
    }
}

fn statements_mut<'a>(policy: &'a mut Value, bucket: &str) -> Result<&'a mut Vec<Value>> {
    policy
        .get_mut("Statement")
        .and_then(Value::as_array_mut)
        .ok_or_else(|| Error::InvalidState(format!("bucket policy of {} has no statement list", bucket)))
}

fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Key prefix for a route: the origin path plus the route path without its glob.
fn object_prefix(origin_path: &str, route_path: &str) -> String {
    let route = route_path.trim_end_matches('*').trim_end_matches('/');
    format!("{}{}", origin_path.trim_end_matches('/'), route)
        .trim_start_matches('/')
        .to_string()
}

fn content_type(key: &str) -> String {
    mime_guess::from_path(key).first_or_octet_stream().to_string()
}

#[async_trait]
impl Resource for CdnDistribution {
    fn name(&self) -> String {
        cdn_resource_name(&self.cdn.name)
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Cdn
    }

    fn description(&self) -> String {
        format!(
            "Create distribution stack {} using bucket: {}",
            self.stack.name(),
            self.bucket
        )
    }

    fn requires(&self) -> Vec<String> {
        let mut requires = Vec::new();
        if self.container.is_some() {
            requires.push(CONTAINER.to_string());
        }
        if self.keys.is_some() {
            requires.push(cdn_keys_resource_name(&self.cdn.name));
        }
        requires
    }

    async fn status(&self) -> Result<ResourceStatus> {
        self.stack.status().await
    }

    async fn create(&self, _mediator: Option<&Mediator>) -> Result<()> {
        self.apply().await
    }

    async fn update(&self, _mediator: Option<&Mediator>) -> Result<()> {
        self.apply().await
    }

    async fn delete(&self) -> Result<()> {
        self.delete_redirect_from().await?;
        self.delete_bucket_policy_statement().await?;
        self.stack.delete().await?;
        self.stack
            .wait_status(ResourceStatus::NoExist, self.ctx.poll(APPLY_POLL), &[])
            .await?;
        warn!(bucket = %self.bucket, "Origin bucket is kept; delete it manually if no longer needed");
        Ok(())
    }

    fn state_info(&self) -> Result<Value> {
        let mut named = serde_json::Map::new();
        named.insert(self.cdn.name.clone(), json!({ "bucket_name": self.bucket }));
        Ok(json!({ "cdn": named }))
    }

    async fn destroy_targets(&self) -> Result<Vec<String>> {
        let mut targets = Vec::new();
        if self.stack.live_status().await?.exists() {
            targets.push(format!("distribution stack {}", self.stack.name()));
        }
        for bucket in &self.cdn.redirect_from {
            match self.objects().bucket_exists(bucket).await {
                Ok(true) => targets.push(format!("website redirect on bucket {}", bucket)),
                Ok(false) => {}
                Err(e) => warn!(bucket = %bucket, error = %e, "Cannot read redirect bucket"),
            }
        }
        Ok(targets)
    }

    fn stack(&self) -> Option<&Stack> {
        Some(&self.stack)
    }

    fn as_cdn(&self) -> Option<&CdnDistribution> {
        Some(self)
    }
}
