//! Image builder abstraction.
//!
//! Builders produce a container image from a local build context and push it
//! to a registry. The backend is chosen purely from configuration.

use async_trait::async_trait;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;

use crate::{Error, Result};

/// Available build backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum BuildBackend {
    /// Local container engine.
    #[display("local")]
    Local,
    /// Managed remote build service.
    #[display("managed-remote")]
    ManagedRemote,
    /// External build service driven through its CLI.
    #[display("third-party")]
    ThirdParty,
}

impl FromStr for BuildBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" | "docker" => Ok(BuildBackend::Local),
            "managed-remote" | "codebuild" => Ok(BuildBackend::ManagedRemote),
            "third-party" | "depot" => Ok(BuildBackend::ThirdParty),
            other => Err(Error::Configuration(format!(
                "unknown build backend: {}",
                other
            ))),
        }
    }
}

/// How images for a compute resource are built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSpec {
    pub backend: BuildBackend,
    /// Dockerfile path relative to the context directory.
    pub dockerfile_path: String,
    /// Target platform, e.g. `linux/amd64`.
    pub platform: String,
    /// Build context directory.
    pub context_dir: PathBuf,
    /// Backend-specific options (project ids, tokens, ...).
    pub options: BTreeMap<String, String>,
}

impl BuildSpec {
    pub fn new(backend: BuildBackend) -> Self {
        Self {
            backend,
            dockerfile_path: "Dockerfile".to_string(),
            platform: "linux/amd64".to_string(),
            context_dir: PathBuf::from("."),
            options: BTreeMap::new(),
        }
    }

    pub fn option(&self, name: &str) -> Option<&str> {
        self.options.get(name).map(|s| s.as_str())
    }
}

/// Registry host of an image reference (`host/repo:tag` -> `host`).
pub fn registry_host(target: &str) -> &str {
    target.split('/').next().unwrap_or(target)
}

/// Trait for image builders.
#[async_trait]
pub trait Builder: Send + Sync {
    /// Name of this builder.
    fn name(&self) -> &'static str;

    fn backend(&self) -> BuildBackend;

    /// Build the image and push it as `target`.
    async fn build_and_push(&self, target: &str, dockerfile_path: &str, platform: &str)
    -> Result<()>;

    /// Whether backend-owned persistent resources exist.
    async fn has_resources(&self) -> Result<bool> {
        Ok(false)
    }

    /// Remove backend-owned persistent resources. Stateless backends do nothing.
    async fn delete(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_parsing() {
        assert_eq!("local".parse::<BuildBackend>().unwrap(), BuildBackend::Local);
        assert_eq!(
            "managed-remote".parse::<BuildBackend>().unwrap(),
            BuildBackend::ManagedRemote
        );
        assert_eq!(
            "depot".parse::<BuildBackend>().unwrap(),
            BuildBackend::ThirdParty
        );
        let err = "unknown".parse::<BuildBackend>().unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_registry_host() {
        assert_eq!(
            registry_host("123.dkr.ecr.us-east-1.amazonaws.com/app:dev"),
            "123.dkr.ecr.us-east-1.amazonaws.com"
        );
        assert_eq!(registry_host("app"), "app");
    }
}
