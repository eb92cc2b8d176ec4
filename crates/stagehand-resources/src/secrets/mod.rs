//! Secret store backends.

pub mod blob;
pub mod parameter;

use stagehand_config::{SecretLocation, StageConfig};
use stagehand_core::cloud::CloudClients;
use stagehand_core::secret::{SecretStore, SecretStoreKind};
use stagehand_core::{Error, Result};
use std::sync::Arc;

pub use blob::BlobSecretStore;
pub use parameter::ParameterSecretStore;

/// Where the managed secrets of the stage's container live.
pub fn secret_location(config: &StageConfig) -> Result<SecretLocation> {
    let container = config
        .container
        .as_ref()
        .ok_or_else(|| Error::Configuration("no container is configured".to_string()))?;
    let secrets = &container.secrets;
    let key = config.format_name("secrets store-key-format", &secrets.store_key_format)?;
    Ok(SecretLocation {
        store: secrets.store,
        key,
    })
}

/// Open a store of the given kind.
pub fn create_store(
    kind: SecretStoreKind,
    key: &str,
    config: &StageConfig,
    clients: &CloudClients,
) -> Arc<dyn SecretStore> {
    match kind {
        SecretStoreKind::Blob => Arc::new(BlobSecretStore::new(
            clients.secret_blobs.clone(),
            key,
            config.stage.clone(),
            config.project.clone(),
        )),
        SecretStoreKind::Parameter => {
            Arc::new(ParameterSecretStore::new(clients.parameters.clone(), key))
        }
    }
}

/// The managed-secret store of the stage.
pub fn stage_store(config: &StageConfig, clients: &CloudClients) -> Result<Arc<dyn SecretStore>> {
    let location = secret_location(config)?;
    Ok(create_store(location.store, &location.key, config, clients))
}
