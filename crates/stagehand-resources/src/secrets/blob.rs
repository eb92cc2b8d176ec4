//! Secret store backed by one structured secret.
//!
//! The secret holds a JSON document shared by every stage and project:
//!
//! ```json
//! { "dev": { "shop": { "SECRET_KEY": "...", "SIGNING_KEY": { "pem": "...", "pub": "..." } } } }
//! ```

use async_trait::async_trait;
use serde_json::{Map, Value};
use stagehand_core::cache::ReadCache;
use stagehand_core::cloud::SecretBlobApi;
use stagehand_core::secret::{SecretMap, SecretStore, SecretValue};
use stagehand_core::{Error, Result};
use std::sync::Arc;
use tracing::{debug, info};

type Document = Map<String, Value>;

pub struct BlobSecretStore {
    api: Arc<dyn SecretBlobApi>,
    secret_id: String,
    stage: String,
    project: String,
    document: ReadCache<Option<Document>>,
}

impl BlobSecretStore {
    pub fn new(
        api: Arc<dyn SecretBlobApi>,
        secret_id: impl Into<String>,
        stage: impl Into<String>,
        project: impl Into<String>,
    ) -> Self {
        Self {
            api,
            secret_id: secret_id.into(),
            stage: stage.into(),
            project: project.into(),
            document: ReadCache::new(),
        }
    }

    /// The whole document, `None` when the secret does not exist.
    async fn document(&self) -> Result<Option<Document>> {
        self.document
            .get_or_try_load(|| async {
                let Some(raw) = self.api.get_secret_string(&self.secret_id).await? else {
                    return Ok(None);
                };
                match serde_json::from_str::<Value>(&raw)? {
                    Value::Object(doc) => Ok(Some(doc)),
                    _ => Err(Error::InvalidState(format!(
                        "secret {} does not hold a JSON object",
                        self.secret_id
                    ))),
                }
            })
            .await
    }

    async fn write(&self, doc: Document, existed: bool) -> Result<()> {
        let body = serde_json::to_string(&Value::Object(doc))?;
        if existed {
            self.api.put_secret_value(&self.secret_id, &body).await?;
        } else {
            self.api.create_secret(&self.secret_id, &body).await?;
        }
        self.document.invalidate().await;
        Ok(())
    }
}

#[async_trait]
impl SecretStore for BlobSecretStore {
    fn name(&self) -> &'static str {
        "blob"
    }

    fn location(&self) -> String {
        format!("{} ({}/{})", self.secret_id, self.stage, self.project)
    }

    async fn get_all(&self) -> Result<SecretMap> {
        let Some(doc) = self.document().await? else {
            return Ok(SecretMap::new());
        };
        let Some(entries) = doc
            .get(&self.stage)
            .and_then(|stage| stage.get(&self.project))
            .and_then(Value::as_object)
        else {
            return Ok(SecretMap::new());
        };

        let mut secrets = SecretMap::new();
        for (key, value) in entries {
            let value: SecretValue = serde_json::from_value(value.clone())?;
            secrets.insert(key.clone(), value);
        }
        Ok(secrets)
    }

    async fn put_all(&self, secrets: SecretMap) -> Result<()> {
        // Other stages share the document: merge into a fresh read.
        self.document.invalidate().await;
        let current = self.document().await?;
        let existed = current.is_some();
        let mut doc = current.unwrap_or_default();

        let mut entries = Map::new();
        for (key, value) in &secrets {
            entries.insert(key.clone(), serde_json::to_value(value)?);
        }
        let stage = doc.entry(self.stage.clone()).or_insert(Value::Null);
        if !stage.is_object() {
            *stage = Value::Object(Map::new());
        }
        if let Some(stage) = stage.as_object_mut() {
            stage.insert(self.project.clone(), Value::Object(entries));
        }

        info!(secret = %self.secret_id, count = secrets.len(), "Writing managed secrets");
        self.write(doc, existed).await
    }

    async fn delete_all(&self) -> Result<()> {
        self.document.invalidate().await;
        let Some(mut doc) = self.document().await? else {
            debug!(secret = %self.secret_id, "Secret does not exist");
            return Ok(());
        };

        let mut stage_empty = false;
        if let Some(Value::Object(stage)) = doc.get_mut(&self.stage) {
            stage.remove(&self.project);
            stage_empty = stage.is_empty();
        }
        if stage_empty {
            doc.remove(&self.stage);
        }

        if doc.is_empty() {
            info!(secret = %self.secret_id, "Deleting secret");
            self.api.delete_secret(&self.secret_id).await?;
            self.document.invalidate().await;
            Ok(())
        } else {
            info!(secret = %self.secret_id, stage = %self.stage, "Removing managed secrets");
            self.write(doc, true).await
        }
    }

    async fn get_user_secret(&self, reference: &str) -> Result<Option<String>> {
        self.api.get_secret_string(reference).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagehand_core::cloud::MemoryCloud;
    use std::collections::BTreeMap;

    fn store(cloud: &MemoryCloud, stage: &str) -> BlobSecretStore {
        BlobSecretStore::new(Arc::new(cloud.clone()), "shop-secrets", stage, "shop")
    }

    fn secrets() -> SecretMap {
        SecretMap::from([
            ("SECRET_KEY".to_string(), SecretValue::String("s3cret".to_string())),
            (
                "SIGNING_KEY".to_string(),
                SecretValue::Map(BTreeMap::from([
                    ("pem".to_string(), "cHJpdg==".to_string()),
                    ("pub".to_string(), "cHVi".to_string()),
                ])),
            ),
        ])
    }

    #[tokio::test]
    async fn test_layout_is_stage_then_project() {
        let cloud = MemoryCloud::new();
        let dev = store(&cloud, "dev");
        dev.put_all(secrets()).await.unwrap();

        let raw = cloud.get_secret_string("shop-secrets").await.unwrap().unwrap();
        let doc: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(doc["dev"]["shop"]["SECRET_KEY"], "s3cret");
        assert_eq!(doc["dev"]["shop"]["SIGNING_KEY"]["pub"], "cHVi");
        assert_eq!(dev.get_all().await.unwrap(), secrets());
        assert_eq!(
            dev.get("SECRET_KEY").await.unwrap(),
            Some(SecretValue::String("s3cret".to_string()))
        );
    }

    #[tokio::test]
    async fn test_reads_are_cached_until_write() {
        let cloud = MemoryCloud::new();
        let dev = store(&cloud, "dev");
        assert!(dev.get_all().await.unwrap().is_empty());

        // Written behind the store's back: still served from the cache.
        store(&cloud, "dev").put_all(secrets()).await.unwrap();
        assert!(dev.get_all().await.unwrap().is_empty());

        dev.put_all(secrets()).await.unwrap();
        assert_eq!(dev.get_all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_delete_keeps_other_stages() {
        let cloud = MemoryCloud::new();
        let dev = store(&cloud, "dev");
        let prod = store(&cloud, "prod");
        dev.put_all(secrets()).await.unwrap();
        prod.put_all(secrets()).await.unwrap();

        dev.delete_all().await.unwrap();
        assert!(dev.get_all().await.unwrap().is_empty());
        assert_eq!(store(&cloud, "prod").get_all().await.unwrap().len(), 2);

        store(&cloud, "prod").delete_all().await.unwrap();
        assert!(cloud.get_secret_string("shop-secrets").await.unwrap().is_none());
        // Nothing left to delete.
        store(&cloud, "prod").delete_all().await.unwrap();
    }

    #[tokio::test]
    async fn test_user_secret_reads_raw_value() {
        let cloud = MemoryCloud::new();
        cloud.create_secret("stripe/key", "sk_test").await.unwrap();
        let dev = store(&cloud, "dev");
        assert_eq!(
            dev.get_user_secret("stripe/key").await.unwrap().as_deref(),
            Some("sk_test")
        );
        assert!(dev.get_user_secret("missing").await.unwrap().is_none());
    }
}
