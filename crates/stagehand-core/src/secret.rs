//! Secret storage abstraction.

use async_trait::async_trait;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::{Error, Result};

/// A secret value (a single string or key-value pairs).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SecretValue {
    /// A single secret string.
    String(String),
    /// A map of key-value pairs, e.g. the two halves of a key pair.
    Map(BTreeMap<String, String>),
}

impl SecretValue {
    /// Get the value as a string (returns first/only value for maps).
    pub fn as_string(&self) -> Option<&str> {
        match self {
            SecretValue::String(s) => Some(s),
            SecretValue::Map(m) => m.values().next().map(|s| s.as_str()),
        }
    }

    /// Get a specific key from a map secret.
    pub fn get(&self, key: &str) -> Option<&str> {
        match self {
            SecretValue::String(s) if key.is_empty() => Some(s),
            SecretValue::Map(m) => m.get(key).map(|s| s.as_str()),
            _ => None,
        }
    }
}

impl From<String> for SecretValue {
    fn from(value: String) -> Self {
        SecretValue::String(value)
    }
}

/// Managed secrets by key.
pub type SecretMap = BTreeMap<String, SecretValue>;

/// Where secrets live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum SecretStoreKind {
    /// One structured blob holding every stage and project.
    #[display("blob")]
    Blob,
    /// One parameter per key under a common path.
    #[display("parameter")]
    Parameter,
}

impl FromStr for SecretStoreKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "blob" | "sm" => Ok(SecretStoreKind::Blob),
            "parameter" | "ssm" => Ok(SecretStoreKind::Parameter),
            other => Err(Error::Configuration(format!(
                "unknown secret store: {}",
                other
            ))),
        }
    }
}

/// Kind of secret the engine generates itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum ManagedSecretKind {
    #[display("password")]
    Password,
    /// Connection URL read from a database resource.
    #[display("derived-database-url")]
    DerivedDatabaseUrl,
    #[display("rsa-keypair")]
    RsaKeypair,
}

impl FromStr for ManagedSecretKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "password" => Ok(ManagedSecretKind::Password),
            "derived-database-url" | "database-url" => Ok(ManagedSecretKind::DerivedDatabaseUrl),
            "rsa-keypair" | "rsa" => Ok(ManagedSecretKind::RsaKeypair),
            other => Err(Error::Configuration(format!(
                "unknown managed secret type: {}",
                other
            ))),
        }
    }
}

/// A secret generated and owned by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedSecretSpec {
    pub key: String,
    pub kind: ManagedSecretKind,
    pub options: BTreeMap<String, String>,
}

impl ManagedSecretSpec {
    pub fn new(key: impl Into<String>, kind: ManagedSecretKind) -> Self {
        Self {
            key: key.into(),
            kind,
            options: BTreeMap::new(),
        }
    }

    pub fn with_option(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(name.into(), value.into());
        self
    }

    pub fn option(&self, name: &str) -> Option<&str> {
        self.options.get(name).map(|s| s.as_str())
    }

    /// Read an integer option, falling back to `default` when unset.
    pub fn option_usize(&self, name: &str, default: usize) -> Result<usize> {
        match self.options.get(name) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|_| {
                Error::Configuration(format!(
                    "option {} of secret {} must be an integer, got {:?}",
                    name, self.key, raw
                ))
            }),
        }
    }

    /// Environment variables this secret expands to at runtime.
    pub fn environ(&self, value: &SecretValue) -> Result<BTreeMap<String, String>> {
        let mut envs = BTreeMap::new();
        match (self.kind, value) {
            (ManagedSecretKind::RsaKeypair, SecretValue::Map(parts)) => {
                let pem_suffix = self.option("pem-suffix").unwrap_or("_PEM_BASE64");
                let pub_suffix = self.option("pub-suffix").unwrap_or("_PUB_BASE64");
                if let Some(pem) = parts.get("pem") {
                    envs.insert(format!("{}{}", self.key, pem_suffix), pem.clone());
                }
                if let Some(public) = parts.get("pub") {
                    envs.insert(format!("{}{}", self.key, pub_suffix), public.clone());
                }
            }
            (_, SecretValue::String(s)) => {
                envs.insert(self.key.clone(), s.clone());
            }
            (kind, SecretValue::Map(_)) => {
                return Err(Error::InvalidState(format!(
                    "secret {} of type {} holds a structured value",
                    self.key, kind
                )));
            }
        }
        Ok(envs)
    }
}

/// A secret provided by the user and referenced by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSecretSpec {
    pub key: String,
    pub reference: String,
    /// Overrides the store of the managed secrets when set.
    pub store: Option<SecretStoreKind>,
}

/// Trait for secret storage backends.
///
/// A store holds the managed secrets of one stage and project.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Name of this backend.
    fn name(&self) -> &'static str;

    /// Human-readable location (secret id or parameter path).
    fn location(&self) -> String;

    /// Get every managed secret.
    async fn get_all(&self) -> Result<SecretMap>;

    /// Get one managed secret.
    async fn get(&self, key: &str) -> Result<Option<SecretValue>> {
        Ok(self.get_all().await?.remove(key))
    }

    /// Write the given secrets in a single operation.
    async fn put_all(&self, secrets: SecretMap) -> Result<()>;

    /// Delete every managed secret.
    async fn delete_all(&self) -> Result<()>;

    /// Read a user-provided secret by its external reference.
    async fn get_user_secret(&self, reference: &str) -> Result<Option<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_value_json_shape() {
        let plain = SecretValue::String("s3cret".into());
        assert_eq!(serde_json::to_string(&plain).unwrap(), "\"s3cret\"");

        let pair: SecretValue = serde_json::from_str(r#"{"pem":"a","pub":"b"}"#).unwrap();
        assert_eq!(pair.get("pub"), Some("b"));
        assert_eq!(pair.get("missing"), None);
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!(
            "password".parse::<ManagedSecretKind>().unwrap(),
            ManagedSecretKind::Password
        );
        assert_eq!(
            "rsa-keypair".parse::<ManagedSecretKind>().unwrap(),
            ManagedSecretKind::RsaKeypair
        );
        assert!("token".parse::<ManagedSecretKind>().is_err());
        assert_eq!(
            "ssm".parse::<SecretStoreKind>().unwrap(),
            SecretStoreKind::Parameter
        );
    }

    #[test]
    fn test_option_usize() {
        let spec = ManagedSecretSpec::new("SECRET_KEY", ManagedSecretKind::Password)
            .with_option("length", "50")
            .with_option("chars", "abc");
        assert_eq!(spec.option_usize("length", 16).unwrap(), 50);
        assert_eq!(spec.option_usize("missing", 16).unwrap(), 16);
        assert!(spec.option_usize("chars", 16).is_err());
    }

    #[test]
    fn test_rsa_environ_uses_suffixes() {
        let spec = ManagedSecretSpec::new("SIGNING", ManagedSecretKind::RsaKeypair)
            .with_option("pub-suffix", "_PUBLIC");
        let value = SecretValue::Map(BTreeMap::from([
            ("pem".to_string(), "PRIV".to_string()),
            ("pub".to_string(), "PUB".to_string()),
        ]));
        let envs = spec.environ(&value).unwrap();
        assert_eq!(envs.get("SIGNING_PEM_BASE64").map(String::as_str), Some("PRIV"));
        assert_eq!(envs.get("SIGNING_PUBLIC").map(String::as_str), Some("PUB"));
    }

    #[test]
    fn test_plain_environ() {
        let spec = ManagedSecretSpec::new("SECRET_KEY", ManagedSecretKind::Password);
        let envs = spec.environ(&SecretValue::String("x".into())).unwrap();
        assert_eq!(envs.len(), 1);
        assert_eq!(envs["SECRET_KEY"], "x");
    }
}
