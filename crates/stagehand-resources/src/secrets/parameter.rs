//! Secret store with one parameter per key.
//!
//! String values live at `/{store_key}/{key}`; structured values are split
//! into `/{store_key}/{key}/{sub}`.

use async_trait::async_trait;
use stagehand_core::cache::ReadCache;
use stagehand_core::cloud::{MAX_PARAMETER_BATCH, ParameterApi};
use stagehand_core::secret::{SecretMap, SecretStore, SecretValue};
use stagehand_core::Result;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

pub struct ParameterSecretStore {
    api: Arc<dyn ParameterApi>,
    path: String,
    secrets: ReadCache<SecretMap>,
}

impl ParameterSecretStore {
    pub fn new(api: Arc<dyn ParameterApi>, store_key: &str) -> Self {
        Self {
            api,
            path: format!("/{}", store_key.trim_matches('/')),
            secrets: ReadCache::new(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn parameter_name(&self, key: &str) -> String {
        format!("{}/{}", self.path, key)
    }

    async fn parameter_names(&self) -> Result<Vec<String>> {
        Ok(self
            .api
            .get_parameters_by_path(&self.path)
            .await?
            .into_iter()
            .map(|p| p.name)
            .collect())
    }
}

#[async_trait]
impl SecretStore for ParameterSecretStore {
    fn name(&self) -> &'static str {
        "parameter"
    }

    fn location(&self) -> String {
        self.path.clone()
    }

    async fn get_all(&self) -> Result<SecretMap> {
        self.secrets
            .get_or_try_load(|| async {
                let prefix = format!("{}/", self.path);
                let mut secrets = SecretMap::new();
                for parameter in self.api.get_parameters_by_path(&self.path).await? {
                    let Some(relative) = parameter.name.strip_prefix(&prefix) else {
                        continue;
                    };
                    match relative.split_once('/') {
                        None => {
                            secrets.insert(relative.to_string(), SecretValue::String(parameter.value));
                        }
                        Some((key, sub)) => {
                            let entry = secrets
                                .entry(key.to_string())
                                .or_insert_with(|| SecretValue::Map(BTreeMap::new()));
                            match entry {
                                SecretValue::Map(parts) => {
                                    parts.insert(sub.to_string(), parameter.value);
                                }
                                SecretValue::String(_) => {
                                    warn!(parameter = %parameter.name, "Ignoring nested parameter under a plain secret");
                                }
                            }
                        }
                    }
                }
                Ok(secrets)
            })
            .await
    }

    async fn put_all(&self, secrets: SecretMap) -> Result<()> {
        info!(path = %self.path, count = secrets.len(), "Writing managed secrets");
        for (key, value) in &secrets {
            match value {
                SecretValue::String(value) => {
                    self.api.put_parameter(&self.parameter_name(key), value, true).await?;
                }
                SecretValue::Map(parts) => {
                    for (sub, value) in parts {
                        let name = format!("{}/{}", self.parameter_name(key), sub);
                        self.api.put_parameter(&name, value, true).await?;
                    }
                }
            }
        }
        self.secrets.invalidate().await;
        Ok(())
    }

    async fn delete_all(&self) -> Result<()> {
        let names = self.parameter_names().await?;
        info!(path = %self.path, count = names.len(), "Deleting managed secrets");
        for batch in names.chunks(MAX_PARAMETER_BATCH) {
            self.api.delete_parameters(batch).await?;
        }
        self.secrets.invalidate().await;
        Ok(())
    }

    async fn get_user_secret(&self, reference: &str) -> Result<Option<String>> {
        self.api.get_parameter(reference).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagehand_core::cloud::MemoryCloud;

    #[tokio::test]
    async fn test_structured_values_are_split() {
        let cloud = MemoryCloud::new();
        let store = ParameterSecretStore::new(Arc::new(cloud.clone()), "dev-shop");
        let secrets = SecretMap::from([
            ("SECRET_KEY".to_string(), SecretValue::String("s3cret".to_string())),
            (
                "SIGNING_KEY".to_string(),
                SecretValue::Map(BTreeMap::from([
                    ("pem".to_string(), "cHJpdg==".to_string()),
                    ("pub".to_string(), "cHVi".to_string()),
                ])),
            ),
        ]);
        store.put_all(secrets.clone()).await.unwrap();

        assert_eq!(
            cloud.get_parameter("/dev-shop/SIGNING_KEY/pub").await.unwrap().as_deref(),
            Some("cHVi")
        );
        assert!(
            cloud
                .calls()
                .contains(&"parameters.put /dev-shop/SECRET_KEY (SecureString)".to_string())
        );
        assert_eq!(store.get_all().await.unwrap(), secrets);
    }

    #[tokio::test]
    async fn test_delete_in_batches() {
        let cloud = MemoryCloud::new();
        let store = ParameterSecretStore::new(Arc::new(cloud.clone()), "/dev-shop/");
        assert_eq!(store.path(), "/dev-shop");

        let secrets: SecretMap = (0..23)
            .map(|i| (format!("KEY_{:02}", i), SecretValue::String(i.to_string())))
            .collect();
        store.put_all(secrets).await.unwrap();
        assert_eq!(store.get_all().await.unwrap().len(), 23);

        cloud.clear_calls();
        store.delete_all().await.unwrap();
        let deletes = cloud
            .calls()
            .iter()
            .filter(|c| c.starts_with("parameters.delete"))
            .count();
        assert_eq!(deletes, 3);
        assert!(store.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_user_secret_reads_parameter() {
        let cloud = MemoryCloud::new();
        cloud.put_parameter("/shared/stripe", "sk_test", true).await.unwrap();
        let store = ParameterSecretStore::new(Arc::new(cloud), "dev-shop");
        assert_eq!(
            store.get_user_secret("/shared/stripe").await.unwrap().as_deref(),
            Some("sk_test")
        );
    }
}
