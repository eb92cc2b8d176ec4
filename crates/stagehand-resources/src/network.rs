//! Virtual network stack.

use async_trait::async_trait;
use serde_json::{Value, json};
use stagehand_config::render::render_network;
use stagehand_config::{NetworkConfig, RenderedTemplate, StageConfig};
use stagehand_core::wait::PollConfig;
use stagehand_core::{Error, ResourceStatus, Result};
use std::sync::Arc;
use tracing::{info, warn};

use crate::mediator::Mediator;
use crate::resource::{Resource, ResourceContext, ResourceKind};
use crate::stack::{Stack, TemplateSource};

pub const NETWORK: &str = "network";

const APPLY_POLL: PollConfig = PollConfig::secs(600, 10);
const DELETE_POLL: PollConfig = PollConfig::secs(300, 10);

/// Tag key prefix naming a stage that runs resources in the network.
pub const CONSUMER_TAG: &str = "stagehand:consumer:";

struct NetworkSource {
    config: Arc<StageConfig>,
    network: NetworkConfig,
}

#[async_trait]
impl TemplateSource for NetworkSource {
    async fn render(&self) -> Result<RenderedTemplate> {
        Ok(render_network(&self.config, &self.network)?)
    }
}

/// Network stack shared by every stage that selects the same reference.
///
/// Each stage that deploys against the network is recorded as a consumer
/// tag on the stack. Deleting only drops this stage's tag while another
/// consumer remains.
///
/// With `manage=false` the stack belongs to someone else: its status is read
/// and its consumer tag maintained, but it is never created, updated or
/// deleted.
pub struct VirtualNetwork {
    ctx: ResourceContext,
    network: NetworkConfig,
    stack: Stack,
}

impl VirtualNetwork {
    pub fn new(ctx: &ResourceContext, network: &NetworkConfig) -> Self {
        let source = NetworkSource {
            config: ctx.config.clone(),
            network: network.clone(),
        };
        let stack = Stack::new(
            ctx.config.network_stack_name(&network.reference),
            ctx.clients.stacks.clone(),
            Arc::new(source),
        );
        Self {
            ctx: ctx.clone(),
            network: network.clone(),
            stack,
        }
    }

    pub fn reference(&self) -> &str {
        &self.network.reference
    }

    pub fn stack_name(&self) -> &str {
        self.stack.name()
    }

    fn consumer_key(&self) -> String {
        format!("{}{}", CONSUMER_TAG, self.ctx.config.slug())
    }

    /// Stage slugs recorded as consumers.
    pub async fn consumers(&self) -> Result<Vec<String>> {
        Ok(self
            .stack
            .tags()
            .await?
            .keys()
            .filter_map(|key| key.strip_prefix(CONSUMER_TAG))
            .map(str::to_string)
            .collect())
    }

    /// Consumers other than this stage.
    pub async fn other_consumers(&self) -> Result<Vec<String>> {
        let slug = self.ctx.config.slug();
        Ok(self
            .consumers()
            .await?
            .into_iter()
            .filter(|c| *c != slug)
            .collect())
    }

    /// Record this stage as a consumer. Does nothing when the stack does not
    /// exist or already carries the tag.
    pub async fn add_consumer(&self) -> Result<()> {
        if self.stack.description().await?.is_none() {
            return Ok(());
        }
        let mut tags = self.stack.tags().await?;
        if tags.insert(self.consumer_key(), "true".to_string()).is_none() {
            info!(stack = %self.stack.name(), consumer = %self.ctx.config.slug(), "Recording network consumer");
            self.stack.set_tags(&tags).await?;
        }
        Ok(())
    }

    /// Drop this stage's consumer tag and return the consumers left.
    pub async fn release(&self) -> Result<Vec<String>> {
        let mut tags = self.stack.tags().await?;
        if tags.remove(&self.consumer_key()).is_some() {
            info!(stack = %self.stack.name(), consumer = %self.ctx.config.slug(), "Removing network consumer");
            self.stack.set_tags(&tags).await?;
        }
        self.other_consumers().await
    }

    /// Make sure the network is usable by a dependent.
    ///
    /// An external network must exist. A managed one that is still being
    /// applied is waited for; a missing one is created earlier in the same
    /// deploy.
    pub async fn require_usable(&self) -> Result<()> {
        if self.is_external() {
            return self.deploy_init().await;
        }
        match self.stack.status().await? {
            ResourceStatus::Progress => self.wait_applied().await,
            ResourceStatus::Failed => Err(Error::NotReady(format!(
                "network stack {} is in a failed state",
                self.stack.name()
            ))),
            _ => Ok(()),
        }
    }

    async fn wait_applied(&self) -> Result<()> {
        self.stack
            .wait_status(
                ResourceStatus::Completed,
                self.ctx.poll(APPLY_POLL),
                &[ResourceStatus::Failed],
            )
            .await
    }

    fn output(outputs: &std::collections::BTreeMap<String, String>, key: &str, stack: &str) -> Result<String> {
        outputs
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotReady(format!("stack {} has no output {}", stack, key)))
    }

    pub async fn vpc_id(&self) -> Result<String> {
        let outputs = self.stack.require_outputs().await?;
        Self::output(&outputs, "VpcId", self.stack.name())
    }

    pub async fn private_subnet_ids(&self) -> Result<Vec<String>> {
        let outputs = self.stack.require_outputs().await?;
        let joined = Self::output(&outputs, "PrivateSubnetIds", self.stack.name())?;
        Ok(joined
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn managed_only(&self, action: &str) -> Result<()> {
        if self.is_external() {
            return Err(Error::Configuration(format!(
                "network {} is managed elsewhere and cannot be {}",
                self.network.reference, action
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Resource for VirtualNetwork {
    fn name(&self) -> String {
        NETWORK.to_string()
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Network
    }

    fn description(&self) -> String {
        if self.is_external() {
            format!("Use external network stack: {}", self.stack.name())
        } else {
            format!("Create network stack: {}", self.stack.name())
        }
    }

    fn teardown_with_dependents(&self) -> bool {
        self.network.manage
    }

    fn is_external(&self) -> bool {
        !self.network.manage
    }

    async fn status(&self) -> Result<ResourceStatus> {
        if self.is_external() {
            self.stack.live_status().await
        } else {
            self.stack.status().await
        }
    }

    async fn deploy_init(&self) -> Result<()> {
        if self.is_external() && self.stack.live_status().await? == ResourceStatus::NoExist {
            return Err(Error::NotReady(format!(
                "external network stack {} does not exist",
                self.stack.name()
            )));
        }
        Ok(())
    }

    async fn create(&self, _mediator: Option<&Mediator>) -> Result<()> {
        self.managed_only("created")?;
        self.stack.create().await?;
        self.wait_applied().await?;
        self.add_consumer().await
    }

    async fn update(&self, _mediator: Option<&Mediator>) -> Result<()> {
        self.managed_only("updated")?;
        self.stack.update().await?;
        self.wait_applied().await?;
        self.add_consumer().await
    }

    async fn delete(&self) -> Result<()> {
        let others = self.release().await?;
        if self.is_external() {
            info!(stack = %self.stack.name(), "Leaving external network in place");
            return Ok(());
        }
        if !others.is_empty() {
            warn!(
                stack = %self.stack.name(),
                consumers = %others.join(", "),
                "Network is still used by other stages, not deleting"
            );
            return Ok(());
        }
        self.stack.delete().await?;
        self.stack
            .wait_status(ResourceStatus::NoExist, self.ctx.poll(DELETE_POLL), &[])
            .await
    }

    fn state_info(&self) -> Result<Value> {
        Ok(json!({
            "network": {
                "name": self.stack.name(),
                "managed": self.network.manage,
            }
        }))
    }

    async fn destroy_targets(&self) -> Result<Vec<String>> {
        if !self.status().await?.exists() {
            return Ok(Vec::new());
        }
        if !self.is_external() && self.other_consumers().await?.is_empty() {
            return Ok(vec![format!("network stack {}", self.stack.name())]);
        }
        let slug = self.ctx.config.slug();
        if self.consumers().await?.contains(&slug) {
            return Ok(vec![format!(
                "consumer tag {} on network stack {}",
                slug,
                self.stack.name()
            )]);
        }
        Ok(Vec::new())
    }

    fn stack(&self) -> Option<&Stack> {
        Some(&self.stack)
    }

    fn as_network(&self) -> Option<&VirtualNetwork> {
        Some(self)
    }
}
