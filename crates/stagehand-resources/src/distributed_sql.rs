//! Per-stage cluster on a serverless distributed SQL provider.

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::Rng;
use serde_json::{Value, json};
use stagehand_config::DistributedSqlConfig;
use stagehand_core::cloud::{ServerlessSqlApi, SqlCluster, SqlClusterRequest, SqlProject};
use stagehand_core::wait::{PollConfig, Probe, poll_until};
use stagehand_core::{Error, ResourceStatus, Result};
use tokio::sync::Mutex;
use tracing::info;

use crate::mediator::{DatabaseUrlSource, Mediator};
use crate::resource::{Resource, ResourceContext, ResourceKind};

pub const DISTRIBUTED_SQL: &str = "distributed-sql";

const ROOT_PASSWORD_LENGTH: usize = 24;
const ACTIVE_POLL: PollConfig = PollConfig::secs(300, 5);

fn generate_root_password() -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(ROOT_PASSWORD_LENGTH)
        .map(char::from)
        .collect()
}

pub struct DistributedSqlCluster {
    ctx: ResourceContext,
    sql: DistributedSqlConfig,
    cluster_name: String,
    /// Root password, known only after this instance set it.
    root_password: Mutex<Option<String>>,
}

impl DistributedSqlCluster {
    pub fn new(ctx: &ResourceContext, sql: &DistributedSqlConfig) -> Self {
        Self {
            ctx: ctx.clone(),
            sql: sql.clone(),
            cluster_name: ctx.config.slug(),
            root_password: Mutex::new(None),
        }
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    fn api(&self) -> &dyn ServerlessSqlApi {
        self.ctx.clients.serverless_sql.as_ref()
    }

    /// The configured project, or the account's only project.
    async fn project(&self) -> Result<Option<SqlProject>> {
        let projects = self.api().list_projects().await?;
        if let Some(wanted) = &self.sql.provider_project {
            return Ok(projects
                .into_iter()
                .find(|p| p.name == *wanted || p.id == *wanted));
        }
        match projects.len() {
            0 | 1 => Ok(projects.into_iter().next()),
            _ => {
                let names: Vec<_> = projects.iter().map(|p| p.name.as_str()).collect();
                Err(Error::Configuration(format!(
                    "several SQL projects found ({}); set provider-project",
                    names.join(", ")
                )))
            }
        }
    }

    async fn cluster(&self) -> Result<Option<SqlCluster>> {
        let Some(project) = self.project().await? else {
            return Ok(None);
        };
        Ok(self
            .api()
            .list_clusters(&project.id)
            .await?
            .into_iter()
            .find(|c| c.name == self.cluster_name))
    }

    async fn active_cluster(&self) -> Result<SqlCluster> {
        match self.cluster().await? {
            Some(cluster) if cluster.is_active() => Ok(cluster),
            Some(cluster) => Err(Error::NotReady(format!(
                "cluster {} is {}",
                self.cluster_name, cluster.state
            ))),
            None => Err(Error::NotReady(format!("cluster {} not found", self.cluster_name))),
        }
    }

    /// The root password, resetting it when this instance does not know it.
    async fn root_password(&self, cluster: &SqlCluster) -> Result<String> {
        let mut slot = self.root_password.lock().await;
        if let Some(password) = slot.as_ref() {
            return Ok(password.clone());
        }
        info!(cluster = %cluster.name, "Resetting root password");
        let password = generate_root_password();
        self.api().reset_root_password(&cluster.id, &password).await?;
        *slot = Some(password.clone());
        Ok(password)
    }

    async fn wait_active(&self) -> Result<SqlCluster> {
        poll_until(
            self.ctx.poll(ACTIVE_POLL),
            &format!("cluster {} to become active", self.cluster_name),
            move || async move {
                match self.cluster().await? {
                    Some(cluster) if cluster.is_active() => Ok(Probe::Ready(cluster)),
                    Some(cluster) => Ok(Probe::Pending(cluster.state)),
                    None => Ok(Probe::Pending("absent".to_string())),
                }
            },
        )
        .await
    }

    async fn ensure_cluster(&self) -> Result<SqlCluster> {
        if self.cluster().await?.is_none() {
            let project = self.project().await?.ok_or_else(|| {
                Error::NotReady("no SQL project exists in the provider account".to_string())
            })?;
            let password = generate_root_password();
            info!(cluster = %self.cluster_name, project = %project.name, "Creating SQL cluster");
            self.api()
                .create_cluster(&SqlClusterRequest {
                    project_id: project.id,
                    name: self.cluster_name.clone(),
                    region: self.sql.provider_region.clone(),
                    root_password: password.clone(),
                })
                .await?;
            *self.root_password.lock().await = Some(password);
        }
        self.wait_active().await
    }

    async fn ensure(&self) -> Result<()> {
        let cluster = self.ensure_cluster().await?;
        let password = self.root_password(&cluster).await?;
        info!(cluster = %cluster.name, database = %self.sql.database, "Ensuring database");
        self.api()
            .create_database(&cluster, &password, &self.sql.database)
            .await
    }
}

#[async_trait]
impl DatabaseUrlSource for DistributedSqlCluster {
    fn source_name(&self) -> &'static str {
        DISTRIBUTED_SQL
    }

    async fn database_url(&self) -> Result<String> {
        let cluster = self.active_cluster().await?;
        let password = self.root_password(&cluster).await?;
        Ok(format!(
            "mysql://{}:{}@{}:{}/{}",
            cluster.root_user(),
            password,
            cluster.host,
            cluster.port,
            self.sql.database
        ))
    }
}

#[async_trait]
impl Resource for DistributedSqlCluster {
    fn name(&self) -> String {
        DISTRIBUTED_SQL.to_string()
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::DistributedSql
    }

    fn description(&self) -> String {
        format!("Create SQL cluster {} and database {}", self.cluster_name, self.sql.database)
    }

    async fn status(&self) -> Result<ResourceStatus> {
        Ok(match self.cluster().await? {
            Some(cluster) if cluster.is_active() => ResourceStatus::Completed,
            _ => ResourceStatus::NoExist,
        })
    }

    async fn create(&self, _mediator: Option<&Mediator>) -> Result<()> {
        self.ensure().await
    }

    async fn update(&self, _mediator: Option<&Mediator>) -> Result<()> {
        self.ensure().await
    }

    async fn delete(&self) -> Result<()> {
        let Some(cluster) = self.cluster().await? else {
            info!(cluster = %self.cluster_name, "Cluster does not exist, nothing to delete");
            return Ok(());
        };
        info!(cluster = %cluster.name, id = %cluster.id, "Deleting SQL cluster");
        self.api().delete_cluster(&cluster.id).await?;
        *self.root_password.lock().await = None;
        Ok(())
    }

    fn state_info(&self) -> Result<Value> {
        Ok(json!({
            "distributed-sql": {
                "cluster": self.cluster_name,
                "database": self.sql.database,
            }
        }))
    }

    async fn destroy_targets(&self) -> Result<Vec<String>> {
        Ok(match self.cluster().await? {
            Some(cluster) => vec![format!("SQL cluster {} ({})", cluster.name, cluster.id)],
            None => Vec::new(),
        })
    }
}
