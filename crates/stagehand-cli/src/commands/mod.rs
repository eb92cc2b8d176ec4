//! CLI command implementations.

pub mod deploy;
pub mod resource;
pub mod secrets;

use anyhow::{Context, Result};
use stagehand_config::{StageConfig, declared_stages, load_stage_config, parse_stage_config};
use stagehand_core::builder::Builder;
use stagehand_core::cloud::{CloudClients, MemoryBuilder, MemoryCloud};
use stagehand_engine::{DeployEvent, Orchestrator, stage_builder};
use stagehand_resources::ResourceContext;
use stagehand_resources::providers::{NeonClient, TidbClient};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Global flags shared by every command.
pub struct Settings {
    pub config: PathBuf,
    pub sandbox: PathBuf,
    pub live_db_providers: bool,
    pub real_builds: bool,
}

/// One stage wired to the sandbox control plane.
///
/// The sandbox state is written back by [`Session::finish`], whether the
/// command succeeded or not, so partial progress is kept.
pub struct Session {
    cloud: MemoryCloud,
    sandbox: PathBuf,
    pub orchestrator: Orchestrator,
}

impl Session {
    pub fn open(settings: &Settings, stage: &str) -> Result<Self> {
        let config = load_stage_config(&settings.config, stage)
            .with_context(|| format!("Failed to load {} for stage {}", settings.config.display(), stage))?;
        Self::open_with(settings, config)
    }

    pub fn open_with(settings: &Settings, config: StageConfig) -> Result<Self> {
        let cloud = MemoryCloud::load(&settings.sandbox)
            .with_context(|| format!("Failed to read sandbox {}", settings.sandbox.display()))?;
        debug!(sandbox = %settings.sandbox.display(), "Loaded sandbox");

        let clients = clients(settings, &config, &cloud)?;
        let ctx = ResourceContext::new(config, clients);
        let builder = if settings.real_builds {
            stage_builder(&ctx).context("Failed to create the image builder")?
        } else {
            sandbox_builder(&ctx, &cloud)
        };
        let orchestrator =
            Orchestrator::with_builder(ctx, builder).context("Failed to build the resource list")?;

        Ok(Self {
            cloud,
            sandbox: settings.sandbox.clone(),
            orchestrator,
        })
    }

    /// Report orchestrator progress on `tx`.
    pub fn with_events(mut self, tx: mpsc::Sender<DeployEvent>) -> Self {
        self.orchestrator = self.orchestrator.with_events(tx);
        self
    }

    pub fn context(&self) -> &ResourceContext {
        self.orchestrator.context()
    }

    /// Persist the sandbox, then hand back the command's result.
    pub fn finish<T>(self, result: Result<T>) -> Result<T> {
        self.cloud
            .save(&self.sandbox)
            .with_context(|| format!("Failed to write sandbox {}", self.sandbox.display()))?;
        result
    }
}

fn clients(settings: &Settings, config: &StageConfig, cloud: &MemoryCloud) -> Result<CloudClients> {
    let mut clients = CloudClients::from_memory(cloud);
    if !settings.live_db_providers {
        return Ok(clients);
    }
    if let Some(db) = &config.branched_db {
        info!(provider = "neon", "Using live branched-db provider");
        clients.branching_db = Arc::new(NeonClient::from_env(&db.api_key_env)?);
    }
    if let Some(sql) = &config.distributed_sql {
        info!(provider = "tidb", "Using live distributed-sql provider");
        clients.serverless_sql = Arc::new(TidbClient::from_env(&sql.public_key_env, &sql.private_key_env)?);
    }
    Ok(clients)
}

fn sandbox_builder(ctx: &ResourceContext, cloud: &MemoryCloud) -> Option<Arc<dyn Builder>> {
    ctx.config.container.as_ref().map(|container| {
        Arc::new(MemoryBuilder::new(cloud.clone(), container.build.backend)) as Arc<dyn Builder>
    })
}

/// Parse the project file and build the resource graph of each stage.
pub fn validate(settings: &Settings, stage: Option<&str>) -> Result<()> {
    let text = std::fs::read_to_string(&settings.config)
        .with_context(|| format!("Failed to read config file: {}", settings.config.display()))?;
    let stages = match stage {
        Some(stage) => vec![stage.to_string()],
        None => declared_stages(&text).context("Failed to parse the project file")?,
    };

    for stage in &stages {
        let order = validate_stage(&text, stage, &project_dir(&settings.config))
            .with_context(|| format!("Stage {} is invalid", stage))?;
        println!("{}: {}", stage, order.join(" -> "));
    }
    println!("Configuration is valid");
    Ok(())
}

/// Deploy order of one stage, built against an empty control plane.
fn validate_stage(text: &str, stage: &str, project_dir: &Path) -> Result<Vec<String>> {
    let config = parse_stage_config(text, stage, project_dir)?;
    let cloud = MemoryCloud::new();
    let ctx = ResourceContext::new(config, CloudClients::from_memory(&cloud));
    let builder = sandbox_builder(&ctx, &cloud);
    let orchestrator = Orchestrator::with_builder(ctx, builder)?;
    Ok(orchestrator.resources().iter().map(|r| r.name()).collect())
}

fn project_dir(config: &Path) -> PathBuf {
    config
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const PROJECT: &str = r#"
        project "shop"
        region "eu-west-1"
        stages "dev" "prod"

        storage {
            public-dirs "assets"
        }
        container {
            builder "local"
            handler "api" command="app.handler"
            secrets store="blob" {
                managed "SECRET_KEY" type="password"
            }
        }
    "#;

    pub(crate) fn settings(dir: &Path) -> Settings {
        let config = dir.join("stagehand.kdl");
        std::fs::write(&config, PROJECT).unwrap();
        Settings {
            config,
            sandbox: dir.join(".stagehand/sandbox.json"),
            live_db_providers: false,
            real_builds: false,
        }
    }

    #[test]
    fn test_validate_reports_deploy_order() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        let order = validate_stage(PROJECT, "dev", dir.path()).unwrap();
        assert_eq!(order, ["storage", "container"]);
        validate(&settings, None).unwrap();
    }

    #[test]
    fn test_validate_rejects_unknown_stage() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        assert!(validate(&settings, Some("qa")).is_err());
    }

    #[test]
    fn test_session_persists_sandbox() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        let session = Session::open(&settings, "dev").unwrap();
        assert_eq!(session.context().config.stage, "dev");
        session.finish(Ok(())).unwrap();
        assert!(settings.sandbox.exists());
    }

    #[test]
    fn test_project_dir_of_bare_file_name() {
        assert_eq!(project_dir(Path::new("stagehand.kdl")), PathBuf::from("."));
        assert_eq!(project_dir(Path::new("infra/stagehand.kdl")), PathBuf::from("infra"));
    }
}
