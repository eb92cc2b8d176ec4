//! The resource contract.

use async_trait::async_trait;
use derive_more::Display;
use serde_json::Value;
use stagehand_config::StageConfig;
use stagehand_core::cloud::CloudClients;
use stagehand_core::wait::PollConfig;
use stagehand_core::{Error, ResourceStatus, Result};
use std::str::FromStr;
use std::sync::Arc;

use crate::cdn::CdnDistribution;
use crate::container::ComputeContainer;
use crate::mediator::Mediator;
use crate::network::VirtualNetwork;
use crate::stack::Stack;

/// Everything a resource needs to reach its remote state.
#[derive(Clone)]
pub struct ResourceContext {
    pub config: Arc<StageConfig>,
    pub clients: CloudClients,
    /// Divides every wait; 1 in production.
    pub poll_divisor: u32,
}

impl ResourceContext {
    pub fn new(config: StageConfig, clients: CloudClients) -> Self {
        Self {
            config: Arc::new(config),
            clients,
            poll_divisor: 1,
        }
    }

    pub fn with_poll_divisor(mut self, divisor: u32) -> Self {
        self.poll_divisor = divisor.max(1);
        self
    }

    pub fn poll(&self, base: PollConfig) -> PollConfig {
        base.scaled(self.poll_divisor)
    }

    pub fn prefix(&self) -> Result<String> {
        Ok(self.config.prefix()?)
    }
}

/// The eight resource families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum ResourceKind {
    #[display("network")]
    Network,
    #[display("container")]
    Container,
    #[display("storage")]
    Storage,
    #[display("managed-db")]
    ManagedDb,
    #[display("branched-db")]
    BranchedDb,
    #[display("distributed-sql")]
    DistributedSql,
    #[display("cdn")]
    Cdn,
    #[display("cdn-keys")]
    CdnKeys,
}

impl FromStr for ResourceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "network" | "vpc" => Ok(ResourceKind::Network),
            "container" | "compute" => Ok(ResourceKind::Container),
            "storage" => Ok(ResourceKind::Storage),
            "managed-db" => Ok(ResourceKind::ManagedDb),
            "branched-db" => Ok(ResourceKind::BranchedDb),
            "distributed-sql" => Ok(ResourceKind::DistributedSql),
            "cdn" => Ok(ResourceKind::Cdn),
            "cdn-keys" => Ok(ResourceKind::CdnKeys),
            other => Err(Error::Configuration(format!("unknown resource kind: {}", other))),
        }
    }
}

/// A remote resource reconciled by the orchestrator.
///
/// `status` is always recomputed from live state. `create` and `update` are
/// only called by the orchestrator after `status` said so.
#[async_trait]
pub trait Resource: Send + Sync {
    /// Unique name in the resource list, e.g. `cdn:web`.
    fn name(&self) -> String;

    fn kind(&self) -> ResourceKind;

    /// What `create` would do, for plans and prompts.
    fn description(&self) -> String;

    /// Names of the resources this one depends on.
    fn requires(&self) -> Vec<String> {
        Vec::new()
    }

    /// Torn down right after the last resource that requires it.
    fn teardown_with_dependents(&self) -> bool {
        false
    }

    /// Whether `create`/`update` receive the secrets mediator.
    fn uses_mediator(&self) -> bool {
        false
    }

    /// Managed elsewhere: never created or deleted.
    fn is_external(&self) -> bool {
        false
    }

    async fn status(&self) -> Result<ResourceStatus>;

    /// Checks run for every resource before anything is deployed.
    async fn deploy_init(&self) -> Result<()> {
        Ok(())
    }

    async fn create(&self, mediator: Option<&Mediator>) -> Result<()>;

    async fn update(&self, mediator: Option<&Mediator>) -> Result<()>;

    async fn delete(&self) -> Result<()>;

    /// Fragment merged into the state ledger after create/update.
    fn state_info(&self) -> Result<Value>;

    /// Human-readable parts that currently exist and `delete` would remove.
    async fn destroy_targets(&self) -> Result<Vec<String>>;

    /// The primary stack, for `yaml` and `yaml-diff`.
    fn stack(&self) -> Option<&Stack> {
        None
    }

    fn as_container(&self) -> Option<&ComputeContainer> {
        None
    }

    fn as_cdn(&self) -> Option<&CdnDistribution> {
        None
    }

    fn as_network(&self) -> Option<&VirtualNetwork> {
        None
    }
}

/// The mediator a resource needs, or a `Configuration` error.
pub(crate) fn require_mediator<'a>(name: &str, mediator: Option<&'a Mediator>) -> Result<&'a Mediator> {
    mediator.ok_or_else(|| Error::Configuration(format!("{} needs the secrets mediator", name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parsing() {
        assert_eq!("managed-db".parse::<ResourceKind>().unwrap(), ResourceKind::ManagedDb);
        assert_eq!("vpc".parse::<ResourceKind>().unwrap(), ResourceKind::Network);
        assert_eq!(ResourceKind::CdnKeys.to_string(), "cdn-keys");
        assert!(matches!(
            "queue".parse::<ResourceKind>(),
            Err(Error::Configuration(_))
        ));
    }
}
