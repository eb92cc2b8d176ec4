//! Container image, handler functions and their stack.

use async_trait::async_trait;
use serde_json::{Value, json};
use stagehand_config::render::{
    container_output_key, container_stack_name, handler_function_name, render_container,
};
use stagehand_config::{ContainerConfig, RenderedTemplate, StageConfig};
use stagehand_core::builder::Builder;
use stagehand_core::cloud::{FunctionState, FunctionUpdate, RegistryApi};
use stagehand_core::wait::{PollConfig, Probe, poll_until};
use stagehand_core::{Error, ResourceStatus, Result};
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

use crate::branched_db::BRANCHED_DB;
use crate::distributed_sql::DISTRIBUTED_SQL;
use crate::managed_db::MANAGED_DB;
use crate::mediator::Mediator;
use crate::network::{NETWORK, VirtualNetwork};
use crate::resource::{Resource, ResourceContext, ResourceKind, require_mediator};
use crate::secrets::secret_location;
use crate::stack::{CAPABILITY_NAMED_IAM, Stack, TemplateSource};

pub const CONTAINER: &str = "container";

const APPLY_POLL: PollConfig = PollConfig::secs(600, 10);
const FUNCTION_POLL: PollConfig = PollConfig::secs(300, 5);

fn image_target(uri: &str, stage: &str) -> String {
    format!("{}:{}", uri, stage)
}

async fn repository_uri(registry: &dyn RegistryApi, name: &str) -> Result<String> {
    registry
        .describe_repository(name)
        .await?
        .map(|r| r.uri)
        .ok_or_else(|| Error::NotReady(format!("image repository {} does not exist", name)))
}

struct ContainerSource {
    config: Arc<StageConfig>,
    registry: Arc<dyn RegistryApi>,
    repository: String,
}

#[async_trait]
impl TemplateSource for ContainerSource {
    async fn render(&self) -> Result<RenderedTemplate> {
        let uri = repository_uri(self.registry.as_ref(), &self.repository).await?;
        let location = secret_location(&self.config)?;
        Ok(render_container(
            &self.config,
            &image_target(&uri, &self.config.stage),
            &location,
        )?)
    }
}

/// Handler functions running one image, fronted by HTTP APIs.
pub struct ComputeContainer {
    ctx: ResourceContext,
    container: ContainerConfig,
    network: Option<Arc<VirtualNetwork>>,
    builder: Arc<dyn Builder>,
    repository: String,
    image: OnceLock<String>,
    stack: Stack,
}

impl ComputeContainer {
    pub fn new(
        ctx: &ResourceContext,
        container: &ContainerConfig,
        network: Option<Arc<VirtualNetwork>>,
        builder: Arc<dyn Builder>,
    ) -> Result<Self> {
        let repository = ctx
            .config
            .format_name("container repository-name-format", &container.repository_name_format)?;
        let source = ContainerSource {
            config: ctx.config.clone(),
            registry: ctx.clients.registry.clone(),
            repository: repository.clone(),
        };
        let stack = Stack::new(
            container_stack_name(&ctx.config),
            ctx.clients.stacks.clone(),
            Arc::new(source),
        )
        .with_capabilities(&[CAPABILITY_NAMED_IAM]);
        Ok(Self {
            ctx: ctx.clone(),
            container: container.clone(),
            network,
            builder,
            repository,
            image: OnceLock::new(),
            stack,
        })
    }

    pub fn repository_name(&self) -> &str {
        &self.repository
    }

    pub fn builder(&self) -> &Arc<dyn Builder> {
        &self.builder
    }

    fn registry(&self) -> &dyn RegistryApi {
        self.ctx.clients.registry.as_ref()
    }

    fn function_names(&self) -> Vec<(String, String)> {
        self.container
            .handlers
            .iter()
            .map(|h| (h.name.clone(), handler_function_name(&self.ctx.config, &h.name)))
            .collect()
    }

    async fn handler_states(&self) -> Result<Vec<FunctionState>> {
        let mut states = Vec::new();
        for (_, function) in self.function_names() {
            if let Some(state) = self.ctx.clients.functions.describe_function(&function).await? {
                states.push(state);
            }
        }
        Ok(states)
    }

    /// Create the image repository when missing and return its URI.
    pub async fn ensure_repository(&self) -> Result<String> {
        let uri = match self.registry().describe_repository(&self.repository).await? {
            Some(repository) => repository.uri,
            None => {
                info!(repository = %self.repository, "Creating image repository");
                self.registry().create_repository(&self.repository).await?.uri
            }
        };
        let _ = self.image.set(image_target(&uri, &self.ctx.config.stage));
        Ok(uri)
    }

    async fn build_and_push(&self, uri: &str) -> Result<String> {
        let target = image_target(uri, &self.ctx.config.stage);
        let build = &self.container.build;
        info!(target = %target, builder = %self.builder.name(), "Building image");
        self.builder
            .build_and_push(&target, &build.dockerfile_path, &build.platform)
            .await?;
        Ok(target)
    }

    async fn wait_functions_updated(&self) -> Result<()> {
        poll_until(
            self.ctx.poll(FUNCTION_POLL),
            "handler functions to finish updating",
            move || async move {
                let states = self.handler_states().await?;
                if let Some(failed) = states.iter().find(|s| s.last_update == FunctionUpdate::Failed) {
                    return Err(Error::UnexpectedStatus {
                        what: format!("function {}", failed.name),
                        status: "FAILED".to_string(),
                    });
                }
                match states.iter().find(|s| s.last_update == FunctionUpdate::InProgress) {
                    Some(updating) => Ok(Probe::Pending(format!("{} updating", updating.name))),
                    None => Ok(Probe::Ready(())),
                }
            },
        )
        .await
    }

    /// Stack status, with a template that cannot be rendered counted as drift.
    async fn stack_status(&self) -> Result<ResourceStatus> {
        match self.stack.status().await {
            // The repository is gone; update recreates it.
            Err(e) if e.is_not_ready() => {
                info!(stack = %self.stack.name(), error = %e, "Container template cannot be rendered");
                Ok(ResourceStatus::RequireUpdate)
            }
            other => other,
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

    /// API domain per handler, from the stack outputs.
    pub async fn api_domains(&self) -> Result<BTreeMap<String, String>> {
        let outputs = self.stack.outputs().await?.unwrap_or_default();
        Ok(self
            .container
            .handlers
            .iter()
            .filter_map(|h| {
                outputs
                    .get(&container_output_key(&h.name))
                    .map(|domain| (h.name.clone(), domain.clone()))
            })
            .collect())
    }

    /// `https://` endpoint per handler that has one.
    pub async fn endpoints(&self) -> Result<BTreeMap<String, String>> {
        Ok(self
            .api_domains()
            .await?
            .into_iter()
            .map(|(handler, domain)| (handler, format!("https://{}", domain)))
            .collect())
    }

    pub async fn repository_exists(&self) -> Result<bool> {
        Ok(self.registry().describe_repository(&self.repository).await?.is_some())
    }

    /// Remove the image repository and every image in it.
    pub async fn delete_repository(&self) -> Result<()> {
        info!(repository = %self.repository, "Deleting image repository");
        match self.registry().delete_repository(&self.repository).await {
            Err(e) if e.is_not_found() => {
                debug!(repository = %self.repository, "Repository already gone");
                Ok(())
            }
            other => other,
        }
    }

    /// Tear down whatever the build backend keeps around.
    pub async fn delete_builder(&self) -> Result<()> {
        if !self.builder.has_resources().await? {
            return Ok(());
        }
        info!(builder = %self.builder.name(), "Deleting build resources");
        self.builder.delete().await
    }
}

#[async_trait]
impl Resource for ComputeContainer {
    fn name(&self) -> String {
        CONTAINER.to_string()
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Container
    }

    fn description(&self) -> String {
        format!(
            "Create stack: {}\nCreate image repository: {}",
            self.stack.name(),
            self.repository
        )
    }

    fn requires(&self) -> Vec<String> {
        let config = &self.ctx.config;
        let mut requires = Vec::new();
        if self.network.is_some() {
            requires.push(NETWORK.to_string());
        }
        if config.managed_db.is_some() {
            requires.push(MANAGED_DB.to_string());
        }
        if config.branched_db.is_some() {
            requires.push(BRANCHED_DB.to_string());
        }
        if config.distributed_sql.is_some() {
            requires.push(DISTRIBUTED_SQL.to_string());
        }
        requires
    }

    fn uses_mediator(&self) -> bool {
        true
    }

    async fn status(&self) -> Result<ResourceStatus> {
        let stack = self.stack_status().await?;
        let handlers = self.handler_states().await?;
        if stack == ResourceStatus::Failed
            || handlers.iter().any(|h| h.last_update == FunctionUpdate::Failed)
        {
            return Ok(ResourceStatus::Failed);
        }
        if stack == ResourceStatus::Progress
            || handlers.iter().any(|h| h.last_update == FunctionUpdate::InProgress)
        {
            return Ok(ResourceStatus::Progress);
        }
        if matches!(stack, ResourceStatus::NoExist | ResourceStatus::RequireUpdate) {
            return Ok(stack);
        }
        let digest = self
            .registry()
            .image_digest(&self.repository, &self.ctx.config.stage)
            .await?;
        if handlers.iter().any(|h| h.image_digest != digest) {
            return Ok(ResourceStatus::RequireUpdate);
        }
        Ok(ResourceStatus::Completed)
    }

    async fn deploy_init(&self) -> Result<()> {
        match &self.network {
            Some(network) => network.require_usable().await,
            None => Ok(()),
        }
    }

    async fn create(&self, mediator: Option<&Mediator>) -> Result<()> {
        let mediator = require_mediator(CONTAINER, mediator)?;
        let uri = self.ensure_repository().await?;
        self.build_and_push(&uri).await?;
        info!("Creating secrets");
        mediator.ensure().await?;
        self.stack.create().await?;
        self.wait_applied().await
    }

    async fn update(&self, mediator: Option<&Mediator>) -> Result<()> {
        let mediator = require_mediator(CONTAINER, mediator)?;
        let uri = self.ensure_repository().await?;
        let image = self.build_and_push(&uri).await?;
        mediator.ensure().await?;

        for (handler, function) in self.function_names() {
            match self
                .ctx
                .clients
                .functions
                .update_function_image(&function, &image)
                .await
            {
                Ok(()) => info!(handler = %handler, function = %function, "Pointed function at new image"),
                Err(e) if e.is_not_found() => {
                    info!(handler = %handler, function = %function, "Function not found, skipped")
                }
                Err(e) => return Err(e),
            }
        }
        self.wait_functions_updated().await?;

        self.stack.clear_cache().await;
        if !self.stack.yaml_synced().await? {
            self.stack.update().await?;
        }
        self.wait_applied().await
    }

    async fn delete(&self) -> Result<()> {
        self.stack.delete().await?;
        self.stack
            .wait_status(ResourceStatus::NoExist, self.ctx.poll(APPLY_POLL), &[])
            .await
    }

    fn state_info(&self) -> Result<Value> {
        Ok(json!({
            "container": {
                "stack": self.stack.name(),
                "repository": self.repository,
                "image": self.image.get(),
            }
        }))
    }

    async fn destroy_targets(&self) -> Result<Vec<String>> {
        let mut targets = Vec::new();
        if self.stack_status().await?.exists() {
            targets.push(format!("container stack {}", self.stack.name()));
        }
        if self.repository_exists().await? {
            targets.push(format!("image repository {}", self.repository));
        }
        if self.builder.has_resources().await? {
            targets.push(format!("{} build resources", self.builder.name()));
        }
        Ok(targets)
    }

    fn stack(&self) -> Option<&Stack> {
        Some(&self.stack)
    }

    fn as_container(&self) -> Option<&ComputeContainer> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{context, fixture_config};
    use stagehand_core::builder::BuildBackend;
    use stagehand_core::cloud::{FunctionApi, MemoryBuilder, MemoryCloud, RegistryApi};
    use stagehand_core::secret::SecretValue;

    struct Fixture {
        cloud: MemoryCloud,
        container: ComputeContainer,
        mediator: Mediator,
    }

    fn fixture_on(cloud: &MemoryCloud) -> ComputeContainer {
        let ctx = context(cloud, fixture_config("dev"));
        let network = ctx
            .config
            .network
            .as_ref()
            .map(|n| Arc::new(VirtualNetwork::new(&ctx, n)));
        let builder = Arc::new(MemoryBuilder::new(cloud.clone(), BuildBackend::Local));
        let config = ctx.config.container.clone().unwrap();
        ComputeContainer::new(&ctx, &config, network, builder).unwrap()
    }

    fn fixture() -> Fixture {
        let cloud = MemoryCloud::new();
        let ctx = context(&cloud, fixture_config("dev"));
        let container = fixture_on(&cloud);

        struct Url;
        #[async_trait]
        impl crate::mediator::DatabaseUrlSource for Url {
            fn source_name(&self) -> &'static str {
                "branched-db"
            }
            async fn database_url(&self) -> Result<String> {
                Ok("postgres://shop_dev:pw@ep:5432/shop".to_string())
            }
        }
        let mediator = Mediator::for_stage(&ctx)
            .unwrap()
            .unwrap()
            .with_url_source(Arc::new(Url));
        Fixture {
            cloud,
            container,
            mediator,
        }
    }

    #[tokio::test]
    async fn test_create_builds_and_applies() {
        let f = fixture();
        assert_eq!(f.container.status().await.unwrap(), ResourceStatus::NoExist);
        assert_eq!(
            f.container.requires(),
            vec!["network", "managed-db", "branched-db", "distributed-sql"]
        );
        assert!(matches!(
            f.container.create(None).await,
            Err(Error::Configuration(_))
        ));

        f.container.create(Some(&f.mediator)).await.unwrap();
        assert_eq!(f.container.status().await.unwrap(), ResourceStatus::Completed);

        let calls = f.cloud.calls();
        let push = calls.iter().position(|c| c.starts_with("registry.push")).unwrap();
        let secrets = calls.iter().position(|c| c.starts_with("secrets.create")).unwrap();
        let stack = calls.iter().position(|c| c == "stacks.create dev-shop-container").unwrap();
        assert!(push < secrets && secrets < stack);

        let stored = f.mediator.store().get_all().await.unwrap();
        assert!(matches!(stored.get("SIGNING_KEY"), Some(SecretValue::Map(_))));

        let info = f.container.state_info().unwrap();
        assert_eq!(info["container"]["stack"], "dev-shop-container");
        assert!(info["container"]["image"].as_str().unwrap().ends_with(":dev"));
        assert_eq!(f.container.api_domains().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_new_image_requires_update() {
        let f = fixture();
        f.container.create(Some(&f.mediator)).await.unwrap();

        let uri = f.container.ensure_repository().await.unwrap();
        f.cloud.push_image(&format!("{}:dev", uri)).unwrap();
        assert_eq!(f.container.status().await.unwrap(), ResourceStatus::RequireUpdate);

        f.cloud.clear_calls();
        f.container.update(Some(&f.mediator)).await.unwrap();
        assert_eq!(f.container.status().await.unwrap(), ResourceStatus::Completed);
        // The template did not change, so the stack is left alone.
        assert!(!f.cloud.calls().iter().any(|c| c.starts_with("stacks.update")));
    }

    #[tokio::test]
    async fn test_handler_state_wins_over_stack() {
        let f = fixture();
        f.container.create(Some(&f.mediator)).await.unwrap();

        f.cloud.set_function_update("dev-shop-wsgi", FunctionUpdate::InProgress);
        assert_eq!(f.container.status().await.unwrap(), ResourceStatus::Progress);
        f.cloud.set_function_update("dev-shop-wsgi", FunctionUpdate::Failed);
        assert_eq!(f.container.status().await.unwrap(), ResourceStatus::Failed);
        let state = f.cloud.describe_function("dev-shop-wsgi").await.unwrap().unwrap();
        assert_eq!(state.last_update, FunctionUpdate::Failed);
    }

    #[tokio::test]
    async fn test_missing_repository_is_drift() {
        let f = fixture();
        f.container.create(Some(&f.mediator)).await.unwrap();
        f.cloud
            .delete_repository(f.container.repository_name())
            .await
            .unwrap();

        let fresh = fixture_on(&f.cloud);
        assert_eq!(fresh.status().await.unwrap(), ResourceStatus::RequireUpdate);
        assert_eq!(
            fresh.destroy_targets().await.unwrap(),
            vec!["container stack dev-shop-container"]
        );

        fresh.update(Some(&f.mediator)).await.unwrap();
        assert!(fresh.repository_exists().await.unwrap());
        assert_eq!(fresh.status().await.unwrap(), ResourceStatus::Completed);
    }

    #[tokio::test]
    async fn test_teardown_pieces() {
        let f = fixture();
        f.container.create(Some(&f.mediator)).await.unwrap();
        assert_eq!(f.container.destroy_targets().await.unwrap().len(), 2);

        f.container.delete().await.unwrap();
        f.container.delete_repository().await.unwrap();
        f.container.delete_repository().await.unwrap();
        f.container.delete_builder().await.unwrap();
        assert_eq!(f.container.status().await.unwrap(), ResourceStatus::NoExist);
        assert!(f.container.destroy_targets().await.unwrap().is_empty());
    }
}
