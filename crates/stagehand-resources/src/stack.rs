//! Declarative stacks.
//!
//! A [`Stack`] pairs a remote stack with the template it should be running.
//! Its status comes from the live lifecycle code plus an order-insensitive
//! diff between the rendered template and the last applied one.

use async_trait::async_trait;
use stagehand_config::RenderedTemplate;
use stagehand_core::cache::ReadCache;
use stagehand_core::cloud::{StackApi, StackDescription, StackRequest};
use stagehand_core::diff::{TemplateDiff, diff_templates};
use stagehand_core::status::{Classification, classify};
use stagehand_core::wait::{PollConfig, Probe, poll_until};
use stagehand_core::{Error, ResourceStatus, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

pub const CAPABILITY_NAMED_IAM: &str = "CAPABILITY_NAMED_IAM";

/// Produces the template of a stack on demand.
///
/// Rendering is deferred so values exported by other stacks are read when the
/// stack is reconciled.
#[async_trait]
pub trait TemplateSource: Send + Sync {
    async fn render(&self) -> Result<RenderedTemplate>;
}

/// A fixed template.
pub struct StaticTemplate(pub RenderedTemplate);

#[async_trait]
impl TemplateSource for StaticTemplate {
    async fn render(&self) -> Result<RenderedTemplate> {
        Ok(self.0.clone())
    }
}

pub struct Stack {
    name: String,
    api: Arc<dyn StackApi>,
    source: Arc<dyn TemplateSource>,
    capabilities: Vec<String>,
    description: ReadCache<Option<StackDescription>>,
    uploaded: ReadCache<Option<String>>,
    rendered: ReadCache<RenderedTemplate>,
}

impl Stack {
    pub fn new(name: impl Into<String>, api: Arc<dyn StackApi>, source: Arc<dyn TemplateSource>) -> Self {
        Self {
            name: name.into(),
            api,
            source,
            capabilities: Vec::new(),
            description: ReadCache::new(),
            uploaded: ReadCache::new(),
            rendered: ReadCache::new(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: &[&str]) -> Self {
        self.capabilities = capabilities.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn description(&self) -> Result<Option<StackDescription>> {
        self.description
            .get_or_try_load(|| self.api.describe_stack(&self.name))
            .await
    }

    async fn rendered(&self) -> Result<RenderedTemplate> {
        self.rendered.get_or_try_load(|| self.source.render()).await
    }

    /// The rendered template body.
    pub async fn yaml(&self) -> Result<String> {
        Ok(self.rendered().await?.body)
    }

    /// Output key -> export name declared by the rendered template.
    pub async fn exports(&self) -> Result<BTreeMap<String, String>> {
        Ok(self.rendered().await?.exports)
    }

    /// Template of the last applied version.
    pub async fn uploaded_yaml(&self) -> Result<Option<String>> {
        self.uploaded
            .get_or_try_load(|| self.api.get_template(&self.name))
            .await
    }

    pub async fn yaml_diff(&self) -> Result<TemplateDiff> {
        let uploaded = self.uploaded_yaml().await?;
        let rendered = self.yaml().await?;
        diff_templates(uploaded.as_deref(), &rendered)
    }

    pub async fn yaml_synced(&self) -> Result<bool> {
        Ok(self.yaml_diff().await?.is_empty())
    }

    async fn classification(&self) -> Result<Classification> {
        let description = self.description().await?;
        classify(
            description.as_ref().map(|d| d.status.as_str()),
            description.as_ref().is_some_and(|d| d.deletion_time.is_some()),
        )
    }

    pub async fn status(&self) -> Result<ResourceStatus> {
        match self.classification().await? {
            Classification::Settled(status) => Ok(status),
            drift => Ok(drift.resolve(self.yaml_synced().await?)),
        }
    }

    /// Status from the lifecycle code alone, for stacks managed elsewhere.
    pub async fn live_status(&self) -> Result<ResourceStatus> {
        Ok(self.classification().await?.resolve(true))
    }

    /// Status plus the provider's reason, when there is one.
    pub async fn status_detail(&self) -> Result<String> {
        let status = self.status().await?;
        let reason = self.description().await?.and_then(|d| d.status_reason);
        Ok(match reason {
            Some(reason) => format!("{} ({})", status, reason),
            None => status.to_string(),
        })
    }

    /// Outputs of the live stack; `None` when it does not exist.
    pub async fn outputs(&self) -> Result<Option<BTreeMap<String, String>>> {
        Ok(self.description().await?.map(|d| d.outputs))
    }

    /// Outputs of the live stack, `NotReady` when it does not exist.
    pub async fn require_outputs(&self) -> Result<BTreeMap<String, String>> {
        self.outputs()
            .await?
            .ok_or_else(|| Error::NotReady(format!("stack {} does not exist", self.name)))
    }

    /// Tags of the live stack; empty when it does not exist.
    pub async fn tags(&self) -> Result<BTreeMap<String, String>> {
        Ok(self.description().await?.map(|d| d.tags).unwrap_or_default())
    }

    pub async fn set_tags(&self, tags: &BTreeMap<String, String>) -> Result<()> {
        debug!(stack = %self.name, "Setting stack tags");
        self.api.set_stack_tags(&self.name, tags).await?;
        self.refresh().await;
        Ok(())
    }

    async fn request(&self) -> Result<StackRequest> {
        Ok(StackRequest {
            name: self.name.clone(),
            template: self.yaml().await?,
            capabilities: self.capabilities.clone(),
        })
    }

    pub async fn create(&self) -> Result<()> {
        let request = self.request().await?;
        info!(stack = %self.name, "Creating stack");
        self.api.create_stack(&request).await?;
        self.clear_cache().await;
        Ok(())
    }

    pub async fn update(&self) -> Result<()> {
        let request = self.request().await?;
        info!(stack = %self.name, "Updating stack");
        self.api.update_stack(&request).await?;
        self.clear_cache().await;
        Ok(())
    }

    pub async fn delete(&self) -> Result<()> {
        info!(stack = %self.name, "Deleting stack");
        self.api.delete_stack(&self.name).await?;
        self.clear_cache().await;
        Ok(())
    }

    /// Drop every cached read, the rendered template included.
    pub async fn clear_cache(&self) {
        self.refresh().await;
        self.rendered.invalidate().await;
    }

    /// Drop the cached remote reads.
    async fn refresh(&self) {
        self.description.invalidate().await;
        self.uploaded.invalidate().await;
    }

    /// Poll until the stack reaches `target`.
    ///
    /// Reaching any of `error_statuses` first is an error.
    pub async fn wait_status(
        &self,
        target: ResourceStatus,
        poll: PollConfig,
        error_statuses: &[ResourceStatus],
    ) -> Result<()> {
        let what = format!("stack {} to reach {}", self.name, target);
        poll_until(poll, &what, move || async move {
            self.refresh().await;
            let status = self.status().await?;
            if status == target {
                return Ok(Probe::Ready(()));
            }
            if error_statuses.contains(&status) {
                return Err(Error::UnexpectedStatus {
                    what: format!("stack {}", self.name),
                    status: status.to_string(),
                });
            }
            debug!(stack = %self.name, status = %status, "Waiting for stack");
            Ok(Probe::Pending(status.to_string()))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagehand_core::cloud::MemoryCloud;
    use std::time::Duration;

    const TEMPLATE: &str = "Resources:\n  Queue:\n    Type: AWS::SQS::Queue\n    Properties:\n      Tags:\n        - Key: a\n        - Key: b\n";
    const REORDERED: &str = "Resources:\n  Queue:\n    Properties:\n      Tags:\n        - Key: b\n        - Key: a\n    Type: AWS::SQS::Queue\n";

    fn fast() -> PollConfig {
        PollConfig::new(Duration::from_millis(100), Duration::from_millis(5))
    }

    fn stack(cloud: &MemoryCloud, body: &str) -> Stack {
        let template = RenderedTemplate {
            body: body.to_string(),
            exports: BTreeMap::new(),
        };
        Stack::new("dev-shop-queue", Arc::new(cloud.clone()), Arc::new(StaticTemplate(template)))
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let cloud = MemoryCloud::new();
        let stack = stack(&cloud, TEMPLATE);
        assert_eq!(stack.status().await.unwrap(), ResourceStatus::NoExist);
        assert!(stack.outputs().await.unwrap().is_none());
        assert!(!stack.yaml_synced().await.unwrap());

        stack.create().await.unwrap();
        stack
            .wait_status(ResourceStatus::Completed, fast(), &[ResourceStatus::Failed])
            .await
            .unwrap();
        assert!(stack.yaml_synced().await.unwrap());

        stack.delete().await.unwrap();
        stack
            .wait_status(ResourceStatus::NoExist, fast(), &[])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_drift_is_order_insensitive() {
        let cloud = MemoryCloud::new();
        stack(&cloud, TEMPLATE).create().await.unwrap();

        let reordered = stack(&cloud, REORDERED);
        assert_eq!(reordered.status().await.unwrap(), ResourceStatus::Completed);

        let changed = stack(&cloud, &TEMPLATE.replace("Key: b", "Key: c"));
        assert_eq!(changed.status().await.unwrap(), ResourceStatus::RequireUpdate);
        assert!(!changed.yaml_diff().await.unwrap().is_empty());
        assert_eq!(changed.live_status().await.unwrap(), ResourceStatus::Completed);

        changed.update().await.unwrap();
        assert_eq!(changed.status().await.unwrap(), ResourceStatus::Completed);
    }

    #[tokio::test]
    async fn test_wait_stops_on_error_status() {
        let cloud = MemoryCloud::new();
        let stack = stack(&cloud, TEMPLATE);
        stack.create().await.unwrap();
        cloud.set_stack_status("dev-shop-queue", "UPDATE_ROLLBACK_FAILED");

        let err = stack
            .wait_status(ResourceStatus::Completed, fast(), &[ResourceStatus::Failed])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnexpectedStatus { ref status, .. } if status == "FAILED"));
    }

    #[tokio::test]
    async fn test_wait_times_out_with_last_status() {
        let cloud = MemoryCloud::new();
        let stack = stack(&cloud, TEMPLATE);
        stack.create().await.unwrap();
        cloud.set_stack_status("dev-shop-queue", "UPDATE_IN_PROGRESS");

        let err = stack
            .wait_status(ResourceStatus::Completed, fast(), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { ref last, .. } if last == "PROGRESS"));
    }

    #[tokio::test]
    async fn test_unknown_status_fails_fast() {
        let cloud = MemoryCloud::new();
        let stack = stack(&cloud, TEMPLATE);
        stack.create().await.unwrap();
        cloud.set_stack_status("dev-shop-queue", "SOMETHING_ODD");
        assert!(matches!(stack.status().await, Err(Error::InvalidState(_))));
    }
}
