//! Stage orchestrator - reconciles every resource of a stage in dependency order.

use derive_more::Display;
use serde::Serialize;
use serde_json::Value;
use stagehand_builder::remote::BUILD_POLL;
use stagehand_builder::{BuilderDeps, create_builder};
use stagehand_core::builder::Builder;
use stagehand_core::{Error, ResourceStatus, Result};
use stagehand_resources::cdn::CdnDistribution;
use stagehand_resources::{
    BranchedDb, CdnSigningKeys, ComputeContainer, DistributedSqlCluster, ManagedDbCluster,
    Mediator, ObjectStore, Resource, ResourceContext, ResourceKind, StateLedger, UploadReport,
    VirtualNetwork,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::order::{destroy_order, topological_sort};

/// What deploy did with one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "kebab-case")]
pub enum DeployAction {
    #[display("create")]
    Create,
    #[display("update")]
    Update,
    /// Already in the wanted state, or in a state deploy does not act on.
    #[display("skip ({_0})")]
    Skip(ResourceStatus),
    /// Managed outside this project.
    #[display("external")]
    External,
}

/// Event emitted while deploying or destroying.
#[derive(Debug, Clone)]
pub enum DeployEvent {
    ResourceStarted { resource: String, action: DeployAction },
    ResourceCompleted { resource: String, action: DeployAction },
    ResourceFailed { resource: String, message: String },
    FrontendUploaded { cdn: String, files: usize },
    ResourceDeleted { resource: String },
    Finished { success: bool },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DeployReport {
    pub actions: Vec<(String, DeployAction)>,
}

impl DeployReport {
    pub fn action(&self, resource: &str) -> Option<DeployAction> {
        self.actions
            .iter()
            .find(|(name, _)| name == resource)
            .map(|(_, action)| *action)
    }
}

/// What `destroy` would remove, and what it leaves behind.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DestroyPlan {
    pub targets: Vec<String>,
    pub omitted: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DestroyReport {
    pub deleted: Vec<String>,
    pub skipped: Vec<String>,
}

/// The build backend a stage's container is configured with.
pub fn stage_builder(ctx: &ResourceContext) -> Result<Option<Arc<dyn Builder>>> {
    let Some(container) = &ctx.config.container else {
        return Ok(None);
    };
    let mut spec = container.build.clone();
    spec.context_dir = ctx.config.resolve_path(&spec.context_dir);
    let mut deps = BuilderDeps::new(
        ctx.clients.clone(),
        &ctx.config.region,
        &ctx.prefix()?,
        &ctx.config.state_bucket()?,
    );
    if ctx.poll_divisor > 1 {
        deps.poll = Some(ctx.poll(BUILD_POLL));
    }
    create_builder(&spec, deps).map(Some)
}

/// Every declared resource of the stage, in declared order, plus the
/// secrets mediator wired to the database URL sources.
pub fn resource_list(
    ctx: &ResourceContext,
    builder: Option<Arc<dyn Builder>>,
) -> Result<(Vec<Arc<dyn Resource>>, Option<Mediator>)> {
    let config = &ctx.config;
    let mut resources: Vec<Arc<dyn Resource>> = Vec::new();
    let mut mediator = Mediator::for_stage(ctx)?;

    let network = config
        .network
        .as_ref()
        .map(|n| Arc::new(VirtualNetwork::new(ctx, n)));
    if let Some(network) = &network {
        resources.push(network.clone());
    }

    if let Some(db) = &config.managed_db {
        let network = network.clone().ok_or_else(|| {
            Error::Configuration(format!("managed-db needs network {}", db.network))
        })?;
        resources.push(Arc::new(ManagedDbCluster::new(ctx, db, network)));
    }
    if let Some(db) = &config.branched_db {
        let db = Arc::new(BranchedDb::new(ctx, db));
        mediator = mediator.map(|m| m.with_url_source(db.clone()));
        resources.push(db);
    }
    if let Some(sql) = &config.distributed_sql {
        let sql = Arc::new(DistributedSqlCluster::new(ctx, sql));
        mediator = mediator.map(|m| m.with_url_source(sql.clone()));
        resources.push(sql);
    }
    if let Some(storage) = &config.storage {
        resources.push(Arc::new(ObjectStore::new(ctx, storage)?));
    }

    let mut keys = Vec::new();
    for cdn in config.cdns.iter().filter(|c| c.signing_key.is_some()) {
        let store = mediator.as_ref().map(|m| m.store().clone()).ok_or_else(|| {
            Error::Configuration(format!("cdn {} signs requests but there is no container", cdn.name))
        })?;
        let signing = Arc::new(CdnSigningKeys::new(ctx, cdn, store)?);
        keys.push((cdn.name.clone(), signing.clone()));
        resources.push(signing);
    }

    let container = match &config.container {
        Some(container) => {
            let builder = builder.ok_or_else(|| {
                Error::Configuration("container is declared but no builder was given".to_string())
            })?;
            let network = match &container.network {
                Some(reference) => Some(
                    network
                        .clone()
                        .filter(|n| n.reference() == reference)
                        .ok_or_else(|| {
                            Error::Configuration(format!("container needs network {}", reference))
                        })?,
                ),
                None => None,
            };
            let container = Arc::new(ComputeContainer::new(ctx, container, network, builder)?);
            resources.push(container.clone());
            Some(container)
        }
        None => None,
    };

    for cdn in &config.cdns {
        let signing = keys
            .iter()
            .find(|(name, _)| *name == cdn.name)
            .map(|(_, k)| k.clone());
        resources.push(Arc::new(CdnDistribution::new(
            ctx,
            cdn,
            signing,
            container.clone(),
        )?));
    }

    Ok((resources, mediator))
}

/// Reconciles one stage.
pub struct Orchestrator {
    ctx: ResourceContext,
    resources: Vec<Arc<dyn Resource>>,
    mediator: Option<Mediator>,
    ledger: StateLedger,
    events: Option<mpsc::Sender<DeployEvent>>,
}

impl Orchestrator {
    /// Orchestrator using the container's configured build backend.
    pub fn new(ctx: ResourceContext) -> Result<Self> {
        let builder = stage_builder(&ctx)?;
        Self::with_builder(ctx, builder)
    }

    pub fn with_builder(ctx: ResourceContext, builder: Option<Arc<dyn Builder>>) -> Result<Self> {
        let (declared, mediator) = resource_list(&ctx, builder)?;
        let resources = topological_sort(declared)?;
        let ledger = StateLedger::new(
            ctx.clients.objects.clone(),
            ctx.config.state_bucket()?,
            ctx.config.region.clone(),
        );
        Ok(Self {
            ctx,
            resources,
            mediator,
            ledger,
            events: None,
        })
    }

    /// Report progress on `tx` as well as in the logs.
    pub fn with_events(mut self, tx: mpsc::Sender<DeployEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn context(&self) -> &ResourceContext {
        &self.ctx
    }

    /// Resources in deploy order.
    pub fn resources(&self) -> &[Arc<dyn Resource>] {
        &self.resources
    }

    pub fn resource(&self, name: &str) -> Option<&Arc<dyn Resource>> {
        self.resources.iter().find(|r| r.name() == name)
    }

    pub fn resources_of_kind(&self, kind: ResourceKind) -> Vec<&Arc<dyn Resource>> {
        self.resources.iter().filter(|r| r.kind() == kind).collect()
    }

    pub fn mediator(&self) -> Option<&Mediator> {
        self.mediator.as_ref()
    }

    pub fn ledger(&self) -> &StateLedger {
        &self.ledger
    }

    async fn emit(&self, event: DeployEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event).await;
        }
    }

    fn mediator_for(&self, resource: &dyn Resource) -> Option<&Mediator> {
        if resource.uses_mediator() {
            self.mediator.as_ref()
        } else {
            None
        }
    }

    pub async fn statuses(&self) -> Result<Vec<(String, ResourceStatus)>> {
        let mut statuses = Vec::with_capacity(self.resources.len());
        for resource in &self.resources {
            statuses.push((resource.name(), resource.status().await?));
        }
        Ok(statuses)
    }

    /// Pre-flight checks of every resource, before anything changes.
    pub async fn deploy_init_all(&self) -> Result<()> {
        for resource in &self.resources {
            info!(resource = %resource.name(), "Checking");
            resource.deploy_init().await?;
        }
        Ok(())
    }

    /// Create or update every resource that needs it, in order.
    ///
    /// The first failure aborts the run.
    pub async fn deploy(&self) -> Result<DeployReport> {
        self.ledger.ensure_bucket().await?;
        let mut report = DeployReport::default();

        for resource in &self.resources {
            let name = resource.name();
            let deployed = match self.deploy_one(resource.as_ref()).await {
                Ok(action) => self.record_consumer(resource.as_ref()).await.map(|_| action),
                Err(e) => Err(e),
            };
            match deployed {
                Ok(action) => report.actions.push((name, action)),
                Err(e) => {
                    error!(resource = %name, error = %e, "Deploy failed");
                    self.emit(DeployEvent::ResourceFailed {
                        resource: name,
                        message: e.to_string(),
                    })
                    .await;
                    self.emit(DeployEvent::Finished { success: false }).await;
                    return Err(e);
                }
            }
        }

        self.emit(DeployEvent::Finished { success: true }).await;
        Ok(report)
    }

    async fn deploy_one(&self, resource: &dyn Resource) -> Result<DeployAction> {
        let name = resource.name();
        if resource.is_external() {
            info!(resource = %name, "Managed externally, skipping");
            return Ok(DeployAction::External);
        }

        let status = resource.status().await?;
        let action = match status {
            ResourceStatus::NoExist => DeployAction::Create,
            ResourceStatus::RequireUpdate => DeployAction::Update,
            other => {
                info!(resource = %name, status = %other, "Nothing to do");
                return Ok(DeployAction::Skip(other));
            }
        };

        info!(resource = %name, action = %action, "{}", resource.description());
        self.emit(DeployEvent::ResourceStarted {
            resource: name.clone(),
            action,
        })
        .await;

        let mediator = self.mediator_for(resource);
        match action {
            DeployAction::Create => resource.create(mediator).await?,
            _ => resource.update(mediator).await?,
        }
        self.ledger.record(resource.state_info()?).await?;

        info!(resource = %name, action = %action, "Done");
        self.emit(DeployEvent::ResourceCompleted {
            resource: name,
            action,
        })
        .await;
        Ok(action)
    }

    /// Tag every network this stage deploys against, skipped or not.
    async fn record_consumer(&self, resource: &dyn Resource) -> Result<()> {
        match resource.as_network() {
            Some(network) => network.add_consumer().await,
            None => Ok(()),
        }
    }

    fn cdns(&self) -> impl Iterator<Item = &CdnDistribution> {
        self.resources.iter().filter_map(|r| r.as_cdn())
    }

    /// Upload frontend files for every CDN that is deployed.
    pub async fn upload_frontend(&self) -> Result<Vec<(String, UploadReport)>> {
        let mut reports = Vec::new();
        for cdn in self.cdns() {
            let status = cdn.status().await?;
            if status != ResourceStatus::Completed {
                warn!(cdn = %cdn.cdn_name(), status = %status, "CDN is not deployed, skipping upload");
                continue;
            }
            let report = cdn.upload().await?;
            info!(cdn = %cdn.cdn_name(), files = report.uploaded.len(), "Uploaded frontend");
            self.emit(DeployEvent::FrontendUploaded {
                cdn: cdn.cdn_name().to_string(),
                files: report.uploaded.len(),
            })
            .await;
            reports.push((cdn.cdn_name().to_string(), report));
        }
        Ok(reports)
    }

    pub fn destroy_order(&self) -> Vec<Arc<dyn Resource>> {
        destroy_order(&self.resources)
    }

    pub async fn destroy_plan(&self, with_secrets: bool, with_state_bucket: bool) -> Result<DestroyPlan> {
        let mut plan = DestroyPlan::default();
        for resource in self.destroy_order() {
            if let Some(network) = resource.as_network() {
                let others = network.other_consumers().await?;
                if !others.is_empty() {
                    plan.omitted.push(format!(
                        "network stack {} (used by {})",
                        network.stack_name(),
                        others.join(", ")
                    ));
                }
            }
            if resource.is_external() {
                plan.omitted.push(format!("{} (managed externally)", resource.name()));
                if resource.as_network().is_some() {
                    plan.targets.extend(resource.destroy_targets().await?);
                }
                continue;
            }
            plan.targets.extend(resource.destroy_targets().await?);
        }

        let keys: Vec<&str> = self
            .mediator
            .iter()
            .flat_map(|m| m.managed())
            .map(|s| s.key.as_str())
            .collect();
        if !keys.is_empty() {
            let secrets = format!("managed secrets {}", keys.join(", "));
            if with_secrets {
                plan.targets.push(secrets);
            } else {
                plan.omitted.push(format!("{} (use --with-secrets)", secrets));
            }
        }

        if self.ledger.exists().await? {
            let bucket = format!("state bucket {}", self.ledger.bucket());
            if with_state_bucket {
                plan.targets.push(bucket);
            } else {
                plan.omitted.push(format!("{} (use --with-state-bucket)", bucket));
            }
        }
        Ok(plan)
    }

    /// Delete every resource in destroy order.
    pub async fn destroy(&self, with_secrets: bool, with_state_bucket: bool) -> Result<DestroyReport> {
        let mut report = DestroyReport::default();
        for resource in self.destroy_order() {
            let name = resource.name();
            if let Some(network) = resource.as_network() {
                let others = network.release().await?;
                if !others.is_empty() && !network.is_external() {
                    warn!(
                        resource = %name,
                        consumers = %others.join(", "),
                        "Network is still used by other stages, not deleting"
                    );
                    report.skipped.push(name);
                    continue;
                }
            }
            if resource.is_external() {
                info!(resource = %name, "Managed externally, not deleting");
                report.skipped.push(name);
                continue;
            }

            let status = resource.status().await?;
            if status.exists() {
                info!(resource = %name, status = %status, "Deleting");
                if let Err(e) = resource.delete().await {
                    error!(resource = %name, error = %e, "Delete failed");
                    self.emit(DeployEvent::ResourceFailed {
                        resource: name,
                        message: e.to_string(),
                    })
                    .await;
                    return Err(e);
                }
                report.deleted.push(name.clone());
                self.emit(DeployEvent::ResourceDeleted { resource: name.clone() }).await;
            } else {
                report.skipped.push(name.clone());
            }

            if let Some(container) = resource.as_container() {
                self.teardown_container(container, with_secrets).await?;
            }
        }

        if with_state_bucket {
            self.ledger.delete_bucket().await?;
        }
        self.emit(DeployEvent::Finished { success: true }).await;
        Ok(report)
    }

    /// Everything the container owns outside its stack.
    async fn teardown_container(&self, container: &ComputeContainer, with_secrets: bool) -> Result<()> {
        if container.repository_exists().await? {
            container.delete_repository().await?;
        }
        container.delete_builder().await?;
        if with_secrets {
            if let Some(mediator) = &self.mediator {
                info!("Deleting managed secrets");
                mediator.delete_managed_secrets().await?;
            }
        }
        Ok(())
    }

    /// The ledger document, for `status` output.
    pub async fn ledger_document(&self) -> Result<Value> {
        self.ledger.load().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagehand_config::{StageConfig, parse_stage_config};
    use stagehand_core::builder::BuildBackend;
    use stagehand_core::cloud::{CloudClients, MemoryBuilder, MemoryCloud};
    use std::path::Path;

    const SHOP: &str = r#"
        project "shop"
        region "us-east-1"
        stages "dev"

        storage
        container {
            handler "wsgi" command="app.wsgi"
            secrets store="blob" {
                managed "SECRET_KEY" type="password"
            }
        }
    "#;

    fn config(kdl: &str) -> StageConfig {
        parse_stage_config(kdl, "dev", Path::new("/srv/shop")).unwrap()
    }

    fn orchestrator(cloud: &MemoryCloud, kdl: &str) -> Orchestrator {
        let ctx = ResourceContext::new(config(kdl), CloudClients::from_memory(cloud)).with_poll_divisor(1000);
        let builder: Arc<dyn Builder> = Arc::new(MemoryBuilder::new(cloud.clone(), BuildBackend::Local));
        Orchestrator::with_builder(ctx, Some(builder)).unwrap()
    }

    fn names(resources: &[Arc<dyn Resource>]) -> Vec<String> {
        resources.iter().map(|r| r.name()).collect()
    }

    #[tokio::test]
    async fn test_deploy_storage_and_container() {
        let cloud = MemoryCloud::new();
        let orch = orchestrator(&cloud, SHOP);
        assert_eq!(names(orch.resources()), ["storage", "container"]);

        let (tx, mut rx) = mpsc::channel(64);
        let orch = orch.with_events(tx);
        orch.deploy_init_all().await.unwrap();
        let report = orch.deploy().await.unwrap();
        assert_eq!(report.action("storage"), Some(DeployAction::Create));
        assert_eq!(report.action("container"), Some(DeployAction::Create));

        let calls = cloud.calls();
        let bucket = calls
            .iter()
            .position(|c| c.starts_with("objects.create_bucket dev-shop-stagehand-dev-shop"))
            .unwrap();
        let push = calls.iter().position(|c| c.starts_with("registry.push")).unwrap();
        let stack = calls
            .iter()
            .position(|c| c == "stacks.create dev-shop-container")
            .unwrap();
        assert!(bucket < push && push < stack);

        let ledger = orch.ledger_document().await.unwrap();
        assert!(ledger["resources"]["storage"]["bucket_name"].is_string());
        assert!(ledger["resources"]["container"]["stack"].is_string());

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert!(matches!(events.last(), Some(DeployEvent::Finished { success: true })));

        // A second deploy finds nothing to do.
        let again = orch.deploy().await.unwrap();
        assert_eq!(
            again.action("storage"),
            Some(DeployAction::Skip(ResourceStatus::Completed))
        );
        assert_eq!(
            again.action("container"),
            Some(DeployAction::Skip(ResourceStatus::Completed))
        );
    }

    #[tokio::test]
    async fn test_first_failure_aborts() {
        let cloud = MemoryCloud::new();
        cloud.add_foreign_bucket("dev-shop-stagehand-dev-shop");
        let orch = orchestrator(&cloud, SHOP);
        assert!(matches!(orch.deploy().await, Err(Error::Conflict(_))));
        assert!(!cloud.calls().iter().any(|c| c.starts_with("registry.push")));
    }

    #[tokio::test]
    async fn test_destroy_plan_and_destroy() {
        let cloud = MemoryCloud::new();
        let orch = orchestrator(&cloud, SHOP);
        orch.deploy().await.unwrap();

        let plan = orch.destroy_plan(false, false).await.unwrap();
        assert!(plan.targets.iter().any(|t| t.contains("dev-shop-container")));
        assert!(plan.omitted.iter().any(|o| o.contains("SECRET_KEY")));
        assert!(plan.omitted.iter().any(|o| o.contains("state bucket")));

        let report = orch.destroy(true, true).await.unwrap();
        assert_eq!(report.deleted, ["container", "storage"]);
        assert!(!orch.ledger().exists().await.unwrap());
        for (name, status) in orch.statuses().await.unwrap() {
            assert_eq!(status, ResourceStatus::NoExist, "{} still exists", name);
        }
        let calls = cloud.calls();
        assert!(calls.iter().any(|c| c.starts_with("registry.delete_repository")));
        assert!(calls.iter().any(|c| c.starts_with("secrets.delete")));
    }

    const SHARED: &str = r#"
        project "shop"
        region "us-east-1"
        stages "dev" "prod"

        network "main" {
            zones "a" "c"
        }
        container network="main" {
            handler "wsgi" command="app.wsgi"
        }
    "#;

    fn stage_orchestrator(cloud: &MemoryCloud, kdl: &str, stage: &str) -> Orchestrator {
        let config = parse_stage_config(kdl, stage, Path::new("/srv/shop")).unwrap();
        let ctx = ResourceContext::new(config, CloudClients::from_memory(cloud)).with_poll_divisor(1000);
        let builder: Arc<dyn Builder> = Arc::new(MemoryBuilder::new(cloud.clone(), BuildBackend::Local));
        Orchestrator::with_builder(ctx, Some(builder)).unwrap()
    }

    #[tokio::test]
    async fn test_destroying_one_stage_keeps_a_shared_network() {
        let cloud = MemoryCloud::new();
        let dev = stage_orchestrator(&cloud, SHARED, "dev");
        let prod = stage_orchestrator(&cloud, SHARED, "prod");
        dev.deploy().await.unwrap();
        let report = prod.deploy().await.unwrap();
        assert_eq!(
            report.action("network"),
            Some(DeployAction::Skip(ResourceStatus::Completed))
        );

        let plan = dev.destroy_plan(false, false).await.unwrap();
        assert!(plan.targets.iter().any(|t| t.starts_with("consumer tag dev-shop")));
        assert!(plan.omitted.iter().any(|o| o.contains("used by prod-shop")));

        let report = dev.destroy(false, false).await.unwrap();
        assert_eq!(report.deleted, ["container"]);
        assert!(report.skipped.contains(&"network".to_string()));
        let statuses = prod.statuses().await.unwrap();
        assert!(statuses.iter().all(|(_, s)| *s == ResourceStatus::Completed));

        // The last stage using the network takes it down.
        let report = prod.destroy(false, false).await.unwrap();
        assert_eq!(report.deleted, ["container", "network"]);
        assert!(cloud.stack_names().is_empty());
    }

    #[tokio::test]
    async fn test_full_stage_resource_list() {
        let cloud = MemoryCloud::new();
        let kdl = r#"
            project "shop"
            region "us-east-1"
            stages "dev"

            network "main" {
                zones "a" "c"
            }
            managed-db network="main"
            storage
            container network="main" {
                handler "wsgi" command="app.wsgi"
                secrets {
                    managed "SIGNING_KEY" type="rsa-keypair" bits=1024
                }
            }
            cdn "web" {
                domain "www.example.com"
                certificate-arn "arn:aws:acm:us-east-1:123:certificate/abc"
                signing-key "SIGNING_KEY"
                route "/api/*" origin="container" handler="wsgi"
            }
        "#;
        let orch = orchestrator(&cloud, kdl);
        assert_eq!(
            names(orch.resources()),
            ["network", "managed-db", "storage", "cdn-keys:web", "container", "cdn:web"]
        );
        assert_eq!(
            names(&orch.destroy_order()),
            ["cdn:web", "container", "managed-db", "network", "cdn-keys:web", "storage"]
        );
        assert_eq!(orch.resources_of_kind(ResourceKind::Cdn).len(), 1);
    }

    #[tokio::test]
    async fn test_upload_skips_undeployed_cdn() {
        let cloud = MemoryCloud::new();
        let kdl = r#"
            project "shop"
            region "us-east-1"
            stages "dev"

            cdn "web" {
                domain "www.example.com"
                certificate-arn "arn:aws:acm:us-east-1:123:certificate/abc"
                route "/*" origin="storage" upload-from="frontend/dist"
            }
        "#;
        let orch = orchestrator(&cloud, kdl);
        assert!(orch.upload_frontend().await.unwrap().is_empty());
    }
}
