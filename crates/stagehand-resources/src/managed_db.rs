//! Serverless Postgres cluster inside the stage's network.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use stagehand_config::ManagedDbConfig;
use stagehand_core::cloud::{DbCluster, DbClusterApi, DbClusterSpec};
use stagehand_core::wait::{PollConfig, Probe, poll_until};
use stagehand_core::{ResourceStatus, Result};
use std::sync::Arc;
use tracing::info;

use crate::mediator::Mediator;
use crate::network::{NETWORK, VirtualNetwork};
use crate::resource::{Resource, ResourceContext, ResourceKind};

pub const MANAGED_DB: &str = "managed-db";

const AVAILABLE_POLL: PollConfig = PollConfig::secs(1800, 15);
const DELETE_POLL: PollConfig = PollConfig::secs(600, 10);

pub struct ManagedDbCluster {
    ctx: ResourceContext,
    db: ManagedDbConfig,
    network: Arc<VirtualNetwork>,
    cluster_id: String,
}

impl ManagedDbCluster {
    pub fn new(ctx: &ResourceContext, db: &ManagedDbConfig, network: Arc<VirtualNetwork>) -> Self {
        Self {
            ctx: ctx.clone(),
            db: db.clone(),
            network,
            cluster_id: format!("{}-db", ctx.config.slug()),
        }
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    pub fn instance_id(&self) -> String {
        format!("{}-instance", self.cluster_id)
    }

    pub fn subnet_group_name(&self) -> String {
        format!("{}-subnets", self.cluster_id)
    }

    pub fn security_group_name(&self) -> String {
        format!("{}-sg", self.cluster_id)
    }

    fn api(&self) -> &dyn DbClusterApi {
        self.ctx.clients.db_clusters.as_ref()
    }

    async fn cluster(&self) -> Result<Option<DbCluster>> {
        self.api().describe_cluster(&self.cluster_id).await
    }

    fn scaling_matches(&self, cluster: &DbCluster) -> bool {
        cluster.min_capacity == self.db.min_capacity && cluster.max_capacity == self.db.max_capacity
    }

    async fn security_group_id(&self) -> Result<Option<String>> {
        let vpc_id = self.network.vpc_id().await?;
        self.api()
            .find_security_group(&self.security_group_name(), &vpc_id)
            .await
    }

    async fn wait_available(&self) -> Result<()> {
        poll_until(
            self.ctx.poll(AVAILABLE_POLL),
            &format!("cluster {} to become available", self.cluster_id),
            move || async move {
                match self.cluster().await? {
                    Some(cluster) if cluster.status == "available" => Ok(Probe::Ready(())),
                    Some(cluster) => Ok(Probe::Pending(cluster.status)),
                    None => Ok(Probe::Pending("absent".to_string())),
                }
            },
        )
        .await
    }

    async fn wait_instance_gone(&self) -> Result<()> {
        let instance = self.instance_id();
        let instance = instance.as_str();
        poll_until(
            self.ctx.poll(DELETE_POLL),
            &format!("instance {} to be deleted", instance),
            move || async move {
                match self.api().describe_instance(instance).await? {
                    Some(status) => Ok(Probe::Pending(status)),
                    None => Ok(Probe::Ready(())),
                }
            },
        )
        .await
    }

    async fn wait_cluster_gone(&self) -> Result<()> {
        poll_until(
            self.ctx.poll(DELETE_POLL),
            &format!("cluster {} to be deleted", self.cluster_id),
            move || async move {
                match self.cluster().await? {
                    Some(cluster) => Ok(Probe::Pending(cluster.status)),
                    None => Ok(Probe::Ready(())),
                }
            },
        )
        .await
    }
}

/// Map not-found to success.
fn ignore_missing(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

#[async_trait]
impl Resource for ManagedDbCluster {
    fn name(&self) -> String {
        MANAGED_DB.to_string()
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::ManagedDb
    }

    fn description(&self) -> String {
        format!("Create serverless Postgres cluster: {}", self.cluster_id)
    }

    fn requires(&self) -> Vec<String> {
        vec![NETWORK.to_string()]
    }

    fn teardown_with_dependents(&self) -> bool {
        true
    }

    async fn status(&self) -> Result<ResourceStatus> {
        let Some(cluster) = self.cluster().await? else {
            return Ok(ResourceStatus::NoExist);
        };
        Ok(match cluster.status.as_str() {
            "creating" | "modifying" | "deleting" | "backing-up" => ResourceStatus::Progress,
            "available" if self.scaling_matches(&cluster) => ResourceStatus::Completed,
            "available" => ResourceStatus::RequireUpdate,
            _ => ResourceStatus::Failed,
        })
    }

    async fn deploy_init(&self) -> Result<()> {
        self.network.require_usable().await
    }

    async fn create(&self, _mediator: Option<&Mediator>) -> Result<()> {
        let subnets = self.network.private_subnet_ids().await?;
        let vpc_id = self.network.vpc_id().await?;

        info!(name = %self.subnet_group_name(), "Creating subnet group");
        self.api()
            .create_subnet_group(&self.subnet_group_name(), &subnets)
            .await?;

        let security_group_id = match self.security_group_id().await? {
            Some(id) => id,
            None => {
                info!(name = %self.security_group_name(), vpc = %vpc_id, "Creating security group");
                self.api()
                    .create_security_group(&self.security_group_name(), &vpc_id)
                    .await?
            }
        };

        info!(cluster = %self.cluster_id, "Creating cluster");
        let spec = DbClusterSpec {
            id: self.cluster_id.clone(),
            engine_version: self.db.engine_version.clone(),
            database: self.db.database.clone(),
            master_username: self.db.master_username.clone(),
            subnet_group: self.subnet_group_name(),
            security_group_id,
            min_capacity: self.db.min_capacity,
            max_capacity: self.db.max_capacity,
        };
        self.api().create_cluster(&spec).await?;
        self.api()
            .create_instance(&self.cluster_id, &self.instance_id())
            .await?;
        self.wait_available().await
    }

    async fn update(&self, _mediator: Option<&Mediator>) -> Result<()> {
        info!(
            cluster = %self.cluster_id,
            min = self.db.min_capacity,
            max = self.db.max_capacity,
            "Updating cluster scaling"
        );
        self.api()
            .modify_cluster_scaling(&self.cluster_id, self.db.min_capacity, self.db.max_capacity)
            .await?;
        self.wait_available().await
    }

    async fn delete(&self) -> Result<()> {
        info!(instance = %self.instance_id(), "Deleting instance");
        ignore_missing(self.api().delete_instance(&self.instance_id()).await)?;
        self.wait_instance_gone().await?;

        let snapshot = format!("{}-final-{}", self.cluster_id, Utc::now().format("%Y%m%d%H%M%S"));
        info!(cluster = %self.cluster_id, snapshot = %snapshot, "Deleting cluster with final snapshot");
        ignore_missing(self.api().delete_cluster(&self.cluster_id, Some(&snapshot)).await)?;
        self.wait_cluster_gone().await?;

        if let Some(id) = self.security_group_id().await? {
            ignore_missing(self.api().delete_security_group(&id).await)?;
        }
        ignore_missing(self.api().delete_subnet_group(&self.subnet_group_name()).await)
    }

    fn state_info(&self) -> Result<Value> {
        Ok(json!({
            "managed-db": {
                "cluster_identifier": self.cluster_id,
                "security_group_name": self.security_group_name(),
            }
        }))
    }

    async fn destroy_targets(&self) -> Result<Vec<String>> {
        if self.cluster().await?.is_none() {
            return Ok(Vec::new());
        }
        Ok(vec![
            format!("database cluster {} (a final snapshot is kept)", self.cluster_id),
            format!("database instance {}", self.instance_id()),
        ])
    }
}
