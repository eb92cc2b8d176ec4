//! Managed secrets that need more than one resource to produce.
//!
//! The [`Mediator`] generates passwords and key pairs, reads connection URLs
//! from database resources, and writes everything it created back to the
//! stage's secret store in one read-modify-write.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::pkcs8::{EncodePublicKey, LineEnding};
use rsa::RsaPrivateKey;
use stagehand_config::SecretsConfig;
use stagehand_core::secret::{
    ManagedSecretKind, ManagedSecretSpec, SecretMap, SecretStore, SecretStoreKind, SecretValue,
    UserSecretSpec,
};
use stagehand_core::{Error, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::resource::ResourceContext;
use crate::secrets::{create_store, secret_location};

/// Default alphabet, compatible with web framework secret keys.
pub const DEFAULT_PASSWORD_CHARS: &str = "abcdefghijklmnopqrstuvwxyz0123456789!@#$%^&*(-_=+)";
pub const DEFAULT_PASSWORD_LENGTH: usize = 16;
pub const DEFAULT_RSA_BITS: usize = 2048;

/// A resource that can hand out a database connection URL.
#[async_trait]
pub trait DatabaseUrlSource: Send + Sync {
    /// Value of the `source` option that selects this resource.
    fn source_name(&self) -> &'static str;

    /// `NotReady` while the database cannot be reached yet.
    async fn database_url(&self) -> Result<String>;
}

/// What to do with a condition that is not necessarily fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorLevel {
    Ignore,
    Warning,
    Raise,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecretsReport {
    pub generated: Vec<String>,
    pub skipped: Vec<String>,
    pub warnings: Vec<String>,
}

impl SecretsReport {
    fn apply(&mut self, level: ErrorLevel, error: Error) -> Result<()> {
        match level {
            ErrorLevel::Ignore => Ok(()),
            ErrorLevel::Warning => {
                warn!("{}", error);
                self.warnings.push(error.to_string());
                Ok(())
            }
            ErrorLevel::Raise => Err(error),
        }
    }
}

pub struct Mediator {
    store: Arc<dyn SecretStore>,
    store_kind: SecretStoreKind,
    managed: Vec<ManagedSecretSpec>,
    user: Vec<UserSecretSpec>,
    user_stores: Vec<(SecretStoreKind, Arc<dyn SecretStore>)>,
    url_sources: Vec<(String, Arc<dyn DatabaseUrlSource>)>,
}

impl Mediator {
    pub fn new(store: Arc<dyn SecretStore>, secrets: &SecretsConfig) -> Self {
        Self {
            store,
            store_kind: secrets.store,
            managed: secrets.managed.clone(),
            user: secrets.user.clone(),
            user_stores: Vec::new(),
            url_sources: Vec::new(),
        }
    }

    /// Mediator of the stage's container, `None` when there is no container.
    pub fn for_stage(ctx: &ResourceContext) -> Result<Option<Self>> {
        let Some(container) = &ctx.config.container else {
            return Ok(None);
        };
        let location = secret_location(&ctx.config)?;
        let store = create_store(location.store, &location.key, &ctx.config, &ctx.clients);
        let mut mediator = Self::new(store, &container.secrets);
        for kind in [SecretStoreKind::Blob, SecretStoreKind::Parameter] {
            if kind != location.store {
                let other = create_store(kind, &location.key, &ctx.config, &ctx.clients);
                mediator = mediator.with_user_store(kind, other);
            }
        }
        Ok(Some(mediator))
    }

    /// Backend for user secrets that select a store other than the managed one.
    pub fn with_user_store(mut self, kind: SecretStoreKind, store: Arc<dyn SecretStore>) -> Self {
        self.user_stores.retain(|(k, _)| *k != kind);
        self.user_stores.push((kind, store));
        self
    }

    pub fn with_url_source(mut self, source: Arc<dyn DatabaseUrlSource>) -> Self {
        let name = source.source_name().to_string();
        self.url_sources.retain(|(n, _)| *n != name);
        self.url_sources.push((name, source));
        self
    }

    pub fn store(&self) -> &Arc<dyn SecretStore> {
        &self.store
    }

    pub fn managed(&self) -> &[ManagedSecretSpec] {
        &self.managed
    }

    /// Create missing managed secrets. Existing keys are left untouched.
    pub async fn ensure(&self) -> Result<SecretsReport> {
        self.ensure_managed_secrets(ErrorLevel::Ignore, ErrorLevel::Raise)
            .await
    }

    pub async fn ensure_managed_secrets_default(&self) -> Result<SecretsReport> {
        self.ensure_managed_secrets(ErrorLevel::Warning, ErrorLevel::Raise)
            .await
    }

    pub async fn ensure_managed_secrets(
        &self,
        on_exists: ErrorLevel,
        on_failure: ErrorLevel,
    ) -> Result<SecretsReport> {
        let mut report = SecretsReport::default();
        if self.managed.is_empty() {
            return Ok(report);
        }

        let existing = self.store.get_all().await?;
        let mut generated = SecretMap::new();
        for spec in &self.managed {
            if existing.contains_key(&spec.key) {
                report.apply(
                    on_exists,
                    Error::Conflict(format!(
                        "{} is already created; rotate it to refresh the value",
                        spec.key
                    )),
                )?;
                continue;
            }
            match self.generate(spec).await {
                Ok(value) => {
                    generated.insert(spec.key.clone(), value);
                    report.generated.push(spec.key.clone());
                }
                Err(e) if e.is_not_ready() => {
                    warn!(key = %spec.key, error = %e, "Skipping secret until its source is ready");
                    report.warnings.push(format!("{}: {}", spec.key, e));
                    report.skipped.push(spec.key.clone());
                }
                Err(e) => {
                    report.skipped.push(spec.key.clone());
                    report.apply(on_failure, e)?;
                }
            }
        }

        if !generated.is_empty() {
            let mut all = existing;
            all.extend(generated);
            self.store.put_all(all).await?;
            info!(store = %self.store.location(), keys = ?report.generated, "Stored generated secrets");
        }
        Ok(report)
    }

    /// Regenerate the named managed secrets, existing or not.
    pub async fn rotate(&self, keys: &[String]) -> Result<Vec<String>> {
        let mut rotated = SecretMap::new();
        for key in keys {
            let spec = self
                .managed
                .iter()
                .find(|s| &s.key == key)
                .ok_or_else(|| Error::Configuration(format!("{} is not a managed secret", key)))?;
            rotated.insert(key.clone(), self.generate(spec).await?);
        }
        if rotated.is_empty() {
            return Ok(Vec::new());
        }
        let names: Vec<String> = rotated.keys().cloned().collect();
        let mut all = self.store.get_all().await?;
        all.extend(rotated);
        self.store.put_all(all).await?;
        info!(store = %self.store.location(), keys = ?names, "Rotated secrets");
        Ok(names)
    }

    pub async fn delete_managed_secrets(&self) -> Result<()> {
        info!(store = %self.store.location(), "Deleting managed secrets");
        self.store.delete_all().await
    }

    fn user_store(&self, kind: Option<SecretStoreKind>) -> Result<&Arc<dyn SecretStore>> {
        let kind = kind.unwrap_or(self.store_kind);
        if kind == self.store_kind {
            return Ok(&self.store);
        }
        self.user_stores
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, store)| store)
            .ok_or_else(|| Error::Configuration(format!("no {} store is available", kind)))
    }

    /// Environment variables of every stored managed secret and user secret.
    pub async fn environment(&self) -> Result<BTreeMap<String, String>> {
        let stored = self.store.get_all().await?;
        let mut envs = BTreeMap::new();
        for spec in &self.managed {
            if let Some(value) = stored.get(&spec.key) {
                envs.extend(spec.environ(value)?);
            }
        }
        for spec in &self.user {
            let value = self
                .user_store(spec.store)?
                .get_user_secret(&spec.reference)
                .await?
                .ok_or_else(|| {
                    Error::Configuration(format!(
                        "user secret {} references {}, which does not exist",
                        spec.key, spec.reference
                    ))
                })?;
            envs.insert(spec.key.clone(), value);
        }
        Ok(envs)
    }

    async fn generate(&self, spec: &ManagedSecretSpec) -> Result<SecretValue> {
        match spec.kind {
            ManagedSecretKind::Password => generate_password(spec).map(SecretValue::String),
            ManagedSecretKind::RsaKeypair => generate_rsa_keypair(spec),
            ManagedSecretKind::DerivedDatabaseUrl => {
                let name = spec.option("source").unwrap_or("branched-db");
                let source = self
                    .url_sources
                    .iter()
                    .find(|(n, _)| n == name)
                    .map(|(_, s)| s)
                    .ok_or_else(|| {
                        Error::Configuration(format!(
                            "secret {} derives from {}, which is not configured",
                            spec.key, name
                        ))
                    })?;
                source.database_url().await.map(SecretValue::String)
            }
        }
    }
}

fn generate_password(spec: &ManagedSecretSpec) -> Result<String> {
    let length = spec.option_usize("length", DEFAULT_PASSWORD_LENGTH)?;
    let chars: Vec<char> = spec.option("chars").unwrap_or(DEFAULT_PASSWORD_CHARS).chars().collect();
    if chars.is_empty() {
        return Err(Error::Configuration(format!(
            "option chars of secret {} is empty",
            spec.key
        )));
    }
    let mut rng = OsRng;
    Ok((0..length)
        .filter_map(|_| chars.choose(&mut rng).copied())
        .collect())
}

/// Base64 PEM pair: `pem` is PKCS#1, `pub` is SubjectPublicKeyInfo.
fn generate_rsa_keypair(spec: &ManagedSecretSpec) -> Result<SecretValue> {
    let bits = spec.option_usize("bits", DEFAULT_RSA_BITS)?;
    let failed = |e: &dyn std::fmt::Display| {
        Error::InvalidState(format!("generating key pair {} failed: {}", spec.key, e))
    };
    let private = RsaPrivateKey::new(&mut OsRng, bits).map_err(|e| failed(&e))?;
    let pem = private.to_pkcs1_pem(LineEnding::LF).map_err(|e| failed(&e))?;
    let public = private
        .to_public_key()
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| failed(&e))?;
    Ok(SecretValue::Map(BTreeMap::from([
        ("pem".to_string(), STANDARD.encode(pem.as_bytes())),
        ("pub".to_string(), STANDARD.encode(public.as_bytes())),
    ])))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{context, fixture_config};
    use stagehand_core::cloud::{MemoryCloud, ParameterApi};

    struct FixedUrl(Result<String>);

    #[async_trait]
    impl DatabaseUrlSource for FixedUrl {
        fn source_name(&self) -> &'static str {
            "branched-db"
        }

        async fn database_url(&self) -> Result<String> {
            match &self.0 {
                Ok(url) => Ok(url.clone()),
                Err(e) => Err(Error::NotReady(e.to_string())),
            }
        }
    }

    fn mediator(cloud: &MemoryCloud, url: Result<String>) -> Mediator {
        let ctx = context(cloud, fixture_config("dev"));
        Mediator::for_stage(&ctx)
            .unwrap()
            .unwrap()
            .with_url_source(Arc::new(FixedUrl(url)))
    }

    #[tokio::test]
    async fn test_ensure_generates_each_kind_once() {
        let cloud = MemoryCloud::new();
        let url = "postgres://shop_dev:pw@ep.neon.tech:5432/shop".to_string();
        let mediator = mediator(&cloud, Ok(url.clone()));

        let report = mediator.ensure().await.unwrap();
        assert_eq!(report.generated, vec!["SECRET_KEY", "DATABASE_URL", "SIGNING_KEY"]);

        let stored = mediator.store().get_all().await.unwrap();
        let password = stored["SECRET_KEY"].as_string().unwrap();
        assert_eq!(password.len(), 50);
        assert!(password.chars().all(|c| DEFAULT_PASSWORD_CHARS.contains(c)));
        assert_eq!(stored["DATABASE_URL"], SecretValue::String(url));
        let public = STANDARD.decode(stored["SIGNING_KEY"].get("pub").unwrap()).unwrap();
        assert!(String::from_utf8(public).unwrap().starts_with("-----BEGIN PUBLIC KEY-----"));

        let again = mediator.ensure().await.unwrap();
        assert!(again.generated.is_empty());
        assert_eq!(mediator.store().get_all().await.unwrap(), stored);
    }

    #[tokio::test]
    async fn test_not_ready_source_is_skipped() {
        let cloud = MemoryCloud::new();
        let mediator = mediator(&cloud, Err(Error::NotReady("no endpoint".into())));

        let report = mediator.ensure_managed_secrets_default().await.unwrap();
        assert_eq!(report.skipped, vec!["DATABASE_URL"]);
        assert_eq!(report.warnings.len(), 1);
        assert!(!mediator.store().get_all().await.unwrap().contains_key("DATABASE_URL"));

        // Existing keys are reported as warnings on the next run.
        let report = mediator.ensure_managed_secrets_default().await.unwrap();
        assert_eq!(report.warnings.len(), 3);

        let raised = mediator
            .ensure_managed_secrets(ErrorLevel::Raise, ErrorLevel::Raise)
            .await;
        assert!(matches!(raised, Err(Error::Conflict(_))));
    }

    #[tokio::test]
    async fn test_rotate_replaces_only_named_keys() {
        let cloud = MemoryCloud::new();
        let mediator = mediator(&cloud, Ok("postgres://u:p@h:5432/d".to_string()));
        mediator.ensure().await.unwrap();
        let before = mediator.store().get_all().await.unwrap();

        let rotated = mediator.rotate(&["SECRET_KEY".to_string()]).await.unwrap();
        assert_eq!(rotated, vec!["SECRET_KEY"]);
        let after = mediator.store().get_all().await.unwrap();
        assert_ne!(after["SECRET_KEY"], before["SECRET_KEY"]);
        assert_eq!(after["SIGNING_KEY"], before["SIGNING_KEY"]);

        assert!(matches!(
            mediator.rotate(&["STRIPE_KEY".to_string()]).await,
            Err(Error::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_environment_expands_secrets() {
        let cloud = MemoryCloud::new();
        let mediator = mediator(&cloud, Ok("postgres://u:p@h:5432/d".to_string()));
        mediator.ensure().await.unwrap();

        assert!(matches!(
            mediator.environment().await,
            Err(Error::Configuration(_))
        ));
        cloud.put_parameter("stripe/key", "sk_test", true).await.unwrap();

        let envs = mediator.environment().await.unwrap();
        assert_eq!(envs["STRIPE_KEY"], "sk_test");
        assert_eq!(envs["DATABASE_URL"], "postgres://u:p@h:5432/d");
        assert!(envs.contains_key("SIGNING_KEY_PEM_BASE64"));
        assert!(envs.contains_key("SIGNING_KEY_PUB_BASE64"));

        mediator.delete_managed_secrets().await.unwrap();
        assert!(mediator.store().get_all().await.unwrap().is_empty());
    }

    #[test]
    fn test_empty_alphabet_is_rejected() {
        let spec = ManagedSecretSpec::new("K", ManagedSecretKind::Password).with_option("chars", "");
        assert!(matches!(generate_password(&spec), Err(Error::Configuration(_))));
    }
}
