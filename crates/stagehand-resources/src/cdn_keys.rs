//! Public key and key group used to verify signed CDN requests.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Value, json};
use stagehand_config::render::{cdn_keys_stack_name, render_cdn_keys, CDN_KEYS_OUTPUT};
use stagehand_config::{CdnConfig, RenderedTemplate, StageConfig};
use stagehand_core::secret::SecretStore;
use stagehand_core::wait::PollConfig;
use stagehand_core::{Error, ResourceStatus, Result};
use std::sync::Arc;
use tracing::{info, warn};

use crate::mediator::Mediator;
use crate::resource::{Resource, ResourceContext, ResourceKind, require_mediator};
use crate::stack::{Stack, TemplateSource};

const APPLY_POLL: PollConfig = PollConfig::secs(120, 5);

pub fn cdn_keys_resource_name(cdn: &str) -> String {
    format!("cdn-keys:{}", cdn)
}

/// The PEM public half of the signing key pair, if it was generated.
async fn public_key_pem(store: &dyn SecretStore, key: &str) -> Result<Option<String>> {
    let Some(value) = store.get(key).await? else {
        return Ok(None);
    };
    let Some(encoded) = value.get("pub") else {
        return Ok(None);
    };
    let raw = STANDARD
        .decode(encoded)
        .map_err(|e| Error::InvalidState(format!("public key of {} is not base64: {}", key, e)))?;
    let pem = String::from_utf8(raw)
        .map_err(|e| Error::InvalidState(format!("public key of {} is not UTF-8: {}", key, e)))?;
    Ok(Some(pem))
}

struct CdnKeysSource {
    config: Arc<StageConfig>,
    cdn: CdnConfig,
    signing_key: String,
    store: Arc<dyn SecretStore>,
}

#[async_trait]
impl TemplateSource for CdnKeysSource {
    async fn render(&self) -> Result<RenderedTemplate> {
        let pem = public_key_pem(self.store.as_ref(), &self.signing_key)
            .await?
            .ok_or_else(|| {
                Error::NotReady(format!("signing key {} has not been generated", self.signing_key))
            })?;
        Ok(render_cdn_keys(&self.config, &self.cdn, &pem)?)
    }
}

pub struct CdnSigningKeys {
    ctx: ResourceContext,
    cdn: String,
    signing_key: String,
    store: Arc<dyn SecretStore>,
    stack: Stack,
}

impl CdnSigningKeys {
    /// `store` must be the store the mediator writes to.
    pub fn new(ctx: &ResourceContext, cdn: &CdnConfig, store: Arc<dyn SecretStore>) -> Result<Self> {
        let signing_key = cdn.signing_key.clone().ok_or_else(|| {
            Error::Configuration(format!("cdn {} has no signing-key", cdn.name))
        })?;
        let source = CdnKeysSource {
            config: ctx.config.clone(),
            cdn: cdn.clone(),
            signing_key: signing_key.clone(),
            store: store.clone(),
        };
        let stack = Stack::new(
            cdn_keys_stack_name(&ctx.config, &cdn.name),
            ctx.clients.edge_stacks.clone(),
            Arc::new(source),
        );
        Ok(Self {
            ctx: ctx.clone(),
            cdn: cdn.name.clone(),
            signing_key,
            store,
            stack,
        })
    }

    /// Key group id once the stack is applied.
    pub async fn key_group_id(&self) -> Result<Option<String>> {
        Ok(self
            .stack
            .outputs()
            .await?
            .and_then(|mut outputs| outputs.remove(CDN_KEYS_OUTPUT)))
    }

    async fn apply(&self, mediator: Option<&Mediator>, exists: bool) -> Result<()> {
        require_mediator(&self.name(), mediator)?.ensure().await?;
        if public_key_pem(self.store.as_ref(), &self.signing_key).await?.is_none() {
            warn!(cdn = %self.cdn, key = %self.signing_key, "Signing key is missing, skipping key group");
            return Ok(());
        }
        self.stack.clear_cache().await;
        if exists {
            self.stack.update().await?;
        } else {
            self.stack.create().await?;
        }
        self.stack
            .wait_status(
                ResourceStatus::Completed,
                self.ctx.poll(APPLY_POLL),
                &[ResourceStatus::Failed],
            )
            .await
    }
}

#[async_trait]
impl Resource for CdnSigningKeys {
    fn name(&self) -> String {
        cdn_keys_resource_name(&self.cdn)
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::CdnKeys
    }

    fn description(&self) -> String {
        format!("Create signing key group stack: {}", self.stack.name())
    }

    fn uses_mediator(&self) -> bool {
        true
    }

    async fn status(&self) -> Result<ResourceStatus> {
        match self.stack.status().await {
            // The key pair is gone; regenerating it is an update.
            Err(e) if e.is_not_ready() => {
                info!(cdn = %self.cdn, error = %e, "Key group cannot be rendered");
                Ok(ResourceStatus::RequireUpdate)
            }
            other => other,
        }
    }

    async fn create(&self, mediator: Option<&Mediator>) -> Result<()> {
        self.apply(mediator, false).await
    }

    async fn update(&self, mediator: Option<&Mediator>) -> Result<()> {
        self.apply(mediator, true).await
    }

    async fn delete(&self) -> Result<()> {
        self.stack.delete().await?;
        self.stack
            .wait_status(ResourceStatus::NoExist, self.ctx.poll(APPLY_POLL), &[])
            .await
    }

    fn state_info(&self) -> Result<Value> {
        let mut info = serde_json::Map::new();
        info.insert(
            format!("cdn-keys-{}", self.cdn),
            json!({ "signing_key": self.signing_key }),
        );
        Ok(Value::Object(info))
    }

    async fn destroy_targets(&self) -> Result<Vec<String>> {
        if !self.stack.live_status().await?.exists() {
            return Ok(Vec::new());
        }
        Ok(vec![format!("signing key stack {}", self.stack.name())])
    }

    fn stack(&self) -> Option<&Stack> {
        Some(&self.stack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{context, fixture_config};
    use stagehand_core::cloud::MemoryCloud;

    #[tokio::test]
    async fn test_keys_follow_the_generated_pair() {
        let cloud = MemoryCloud::new();
        let ctx = context(&cloud, fixture_config("dev"));
        let mediator = Mediator::for_stage(&ctx).unwrap().unwrap();
        let cdn = ctx.config.cdn("web").unwrap().clone();
        let keys = CdnSigningKeys::new(&ctx, &cdn, mediator.store().clone()).unwrap();

        assert_eq!(keys.name(), "cdn-keys:web");
        assert_eq!(keys.status().await.unwrap(), ResourceStatus::NoExist);
        assert!(matches!(keys.create(None).await, Err(Error::Configuration(_))));

        // No URL source is registered, so DATABASE_URL cannot be derived.
        let result = keys.create(Some(&mediator)).await;
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[tokio::test]
    async fn test_create_and_rotate() {
        let cloud = MemoryCloud::new();
        let mut config = fixture_config("dev");
        if let Some(container) = config.container.as_mut() {
            container.secrets.managed.retain(|s| s.key != "DATABASE_URL");
        }
        let ctx = context(&cloud, config);
        let mediator = Mediator::for_stage(&ctx).unwrap().unwrap();
        let cdn = ctx.config.cdn("web").unwrap().clone();
        let keys = CdnSigningKeys::new(&ctx, &cdn, mediator.store().clone()).unwrap();

        keys.create(Some(&mediator)).await.unwrap();
        assert_eq!(keys.status().await.unwrap(), ResourceStatus::Completed);
        assert_eq!(
            keys.key_group_id().await.unwrap().as_deref(),
            Some("dev-shop-cdn-keys-web-KeyGroupId")
        );
        assert!(cloud.stack_names().contains(&"dev-shop-cdn-keys-web".to_string()));
        assert_eq!(
            keys.state_info().unwrap(),
            json!({"cdn-keys-web": {"signing_key": "SIGNING_KEY"}})
        );

        mediator.rotate(&["SIGNING_KEY".to_string()]).await.unwrap();
        keys.stack().unwrap().clear_cache().await;
        assert_eq!(keys.status().await.unwrap(), ResourceStatus::RequireUpdate);
        keys.update(Some(&mediator)).await.unwrap();
        assert_eq!(keys.status().await.unwrap(), ResourceStatus::Completed);

        keys.delete().await.unwrap();
        assert!(keys.destroy_targets().await.unwrap().is_empty());
    }
}
