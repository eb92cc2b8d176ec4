//! A per-stage branch on a branching Postgres provider.
//!
//! The provider project is shared by every stage; each stage owns one branch
//! with a read-write endpoint, a role and a database owned by that role.

use async_trait::async_trait;
use serde_json::{Value, json};
use stagehand_config::BranchedDbConfig;
use stagehand_core::cloud::{BranchingDbApi, DbBranch, DbEndpoint, DbProject};
use stagehand_core::{Error, ResourceStatus, Result};
use tracing::info;

use crate::mediator::{DatabaseUrlSource, Mediator};
use crate::resource::{Resource, ResourceContext, ResourceKind};

pub const BRANCHED_DB: &str = "branched-db";

pub struct BranchedDb {
    ctx: ResourceContext,
    db: BranchedDbConfig,
}

impl BranchedDb {
    pub fn new(ctx: &ResourceContext, db: &BranchedDbConfig) -> Self {
        Self {
            ctx: ctx.clone(),
            db: db.clone(),
        }
    }

    fn api(&self) -> &dyn BranchingDbApi {
        self.ctx.clients.branching_db.as_ref()
    }

    async fn project(&self) -> Result<Option<DbProject>> {
        self.api().find_project(&self.db.project_name).await
    }

    async fn branch(&self, project: &DbProject) -> Result<Option<DbBranch>> {
        self.api().find_branch(&project.id, &self.db.branch).await
    }

    /// Project, branch and endpoint, as far as they exist.
    async fn locate(&self) -> Result<(Option<DbProject>, Option<DbBranch>, Option<DbEndpoint>)> {
        let Some(project) = self.project().await? else {
            return Ok((None, None, None));
        };
        let Some(branch) = self.branch(&project).await? else {
            return Ok((Some(project), None, None));
        };
        let endpoint = self.api().find_endpoint(&project.id, &branch.id).await?;
        Ok((Some(project), Some(branch), endpoint))
    }

    async fn ensure_project(&self) -> Result<DbProject> {
        if let Some(project) = self.project().await? {
            return Ok(project);
        }
        info!(
            project = %self.db.project_name,
            pg_version = self.db.pg_version,
            region = %self.db.provider_region,
            "Creating database project"
        );
        self.api()
            .create_project(&self.db.project_name, self.db.pg_version, &self.db.provider_region)
            .await
    }

    async fn ensure_branch(&self, project: &DbProject) -> Result<DbBranch> {
        let branch = match self.branch(project).await? {
            Some(branch) => branch,
            None => {
                info!(project = %project.name, branch = %self.db.branch, "Creating branch");
                self.api().create_branch(&project.id, &self.db.branch).await?
            }
        };
        if self.api().find_endpoint(&project.id, &branch.id).await?.is_none() {
            return Err(Error::InvalidState(format!(
                "branch {} has no read-write endpoint",
                branch.name
            )));
        }
        Ok(branch)
    }

    async fn ensure(&self) -> Result<()> {
        let project = self.ensure_project().await?;
        let branch = self.ensure_branch(&project).await?;

        if !self.api().role_exists(&project.id, &branch.id, &self.db.role).await? {
            info!(role = %self.db.role, "Creating role");
            self.api().create_role(&project.id, &branch.id, &self.db.role).await?;
        }
        if !self
            .api()
            .database_exists(&project.id, &branch.id, &self.db.database)
            .await?
        {
            info!(database = %self.db.database, owner = %self.db.role, "Creating database");
            self.api()
                .create_database(&project.id, &branch.id, &self.db.database, &self.db.role)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl DatabaseUrlSource for BranchedDb {
    fn source_name(&self) -> &'static str {
        BRANCHED_DB
    }

    async fn database_url(&self) -> Result<String> {
        let (Some(project), Some(branch), Some(endpoint)) = self.locate().await? else {
            return Err(Error::NotReady(format!(
                "branch {} has no endpoint yet",
                self.db.branch
            )));
        };
        if !self.api().role_exists(&project.id, &branch.id, &self.db.role).await? {
            return Err(Error::NotReady(format!("role {} does not exist yet", self.db.role)));
        }
        let password = self
            .api()
            .reveal_password(&project.id, &branch.id, &self.db.role)
            .await?;
        Ok(format!(
            "postgres://{}:{}@{}:5432/{}",
            self.db.role, password, endpoint.host, self.db.database
        ))
    }
}

#[async_trait]
impl Resource for BranchedDb {
    fn name(&self) -> String {
        BRANCHED_DB.to_string()
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::BranchedDb
    }

    fn description(&self) -> String {
        format!(
            "Create database project {}, branch {}, role and database",
            self.db.project_name, self.db.branch
        )
    }

    async fn status(&self) -> Result<ResourceStatus> {
        let (Some(project), Some(branch), Some(_)) = self.locate().await? else {
            return Ok(ResourceStatus::NoExist);
        };
        let role = self.api().role_exists(&project.id, &branch.id, &self.db.role).await?;
        let database = self
            .api()
            .database_exists(&project.id, &branch.id, &self.db.database)
            .await?;
        Ok(if role && database {
            ResourceStatus::Completed
        } else {
            ResourceStatus::NoExist
        })
    }

    async fn create(&self, _mediator: Option<&Mediator>) -> Result<()> {
        self.ensure().await
    }

    async fn update(&self, _mediator: Option<&Mediator>) -> Result<()> {
        self.ensure().await
    }

    async fn delete(&self) -> Result<()> {
        let (Some(project), Some(branch), endpoint) = self.locate().await? else {
            info!(branch = %self.db.branch, "Branch does not exist, nothing to delete");
            return Ok(());
        };
        if let Some(endpoint) = endpoint {
            info!(endpoint = %endpoint.id, "Deleting endpoint");
            self.api().delete_endpoint(&project.id, &endpoint.id).await?;
        }
        info!(branch = %branch.name, "Deleting branch");
        self.api().delete_branch(&project.id, &branch.id).await
    }

    fn state_info(&self) -> Result<Value> {
        Ok(json!({
            "branched-db": {
                "project": self.db.project_name,
                "branch": self.db.branch,
                "role": self.db.role,
                "database": self.db.database,
            }
        }))
    }

    async fn destroy_targets(&self) -> Result<Vec<String>> {
        Ok(match self.locate().await? {
            (Some(project), Some(branch), _) => vec![format!(
                "database branch {} of project {}",
                branch.name, project.name
            )],
            _ => Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{context, fixture_config};
    use stagehand_core::cloud::MemoryCloud;

    fn fixture(cloud: &MemoryCloud, stage: &str) -> BranchedDb {
        let ctx = context(cloud, fixture_config(stage));
        BranchedDb::new(&ctx, ctx.config.branched_db.as_ref().unwrap())
    }

    #[tokio::test]
    async fn test_create_and_url() {
        let cloud = MemoryCloud::new();
        let db = fixture(&cloud, "dev");
        assert_eq!(db.status().await.unwrap(), ResourceStatus::NoExist);
        assert!(db.database_url().await.unwrap_err().is_not_ready());

        db.create(None).await.unwrap();
        assert_eq!(db.status().await.unwrap(), ResourceStatus::Completed);

        let url = db.database_url().await.unwrap();
        assert!(url.starts_with("postgres://shop_dev:npg_"));
        assert!(url.ends_with(".neon.tech:5432/shop"));

        // Idempotent: nothing is created twice.
        db.update(None).await.unwrap();
        let creates = cloud
            .calls()
            .iter()
            .filter(|c| c.starts_with("branching.create"))
            .count();
        assert_eq!(creates, 4);
    }

    #[tokio::test]
    async fn test_stages_share_the_project() {
        let cloud = MemoryCloud::new();
        let dev = fixture(&cloud, "dev");
        let prod = fixture(&cloud, "prod");
        dev.create(None).await.unwrap();
        prod.create(None).await.unwrap();

        let projects = cloud
            .calls()
            .iter()
            .filter(|c| c.starts_with("branching.create_project"))
            .count();
        assert_eq!(projects, 1);

        dev.delete().await.unwrap();
        assert_eq!(dev.status().await.unwrap(), ResourceStatus::NoExist);
        assert!(dev.destroy_targets().await.unwrap().is_empty());
        assert_eq!(prod.status().await.unwrap(), ResourceStatus::Completed);

        let calls = cloud.calls();
        let endpoint = calls.iter().position(|c| c.starts_with("branching.delete_endpoint")).unwrap();
        let branch = calls.iter().position(|c| c.starts_with("branching.delete_branch")).unwrap();
        assert!(endpoint < branch);
    }
}
