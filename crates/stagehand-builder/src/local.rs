//! Local container engine builder.

use async_trait::async_trait;
use bollard::Docker;
use bollard::auth::DockerCredentials;
use bollard::image::{BuildImageOptions, PushImageOptions};
use bytes::Bytes;
use futures::StreamExt;
use stagehand_core::builder::{BuildBackend, Builder};
use stagehand_core::cloud::RegistryApi;
use stagehand_core::{Error, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::archive::tar_context;
use crate::ignore::IgnoreRules;

/// Builds with the local Docker daemon and pushes to the registry.
pub struct LocalBuilder {
    docker: OnceCell<Docker>,
    registry: Arc<dyn RegistryApi>,
    context_dir: PathBuf,
}

impl LocalBuilder {
    pub fn new(registry: Arc<dyn RegistryApi>, context_dir: PathBuf) -> Self {
        Self {
            docker: OnceCell::new(),
            registry,
            context_dir,
        }
    }

    /// Create with a custom Docker client.
    pub fn with_client(docker: Docker, registry: Arc<dyn RegistryApi>, context_dir: PathBuf) -> Self {
        Self {
            docker: OnceCell::new_with(Some(docker)),
            registry,
            context_dir,
        }
    }

    async fn docker(&self) -> Result<&Docker> {
        self.docker
            .get_or_try_init(|| async {
                Docker::connect_with_local_defaults()
                    .map_err(|e| Error::Remote(format!("failed to connect to Docker: {}", e)))
            })
            .await
    }

    async fn build(&self, docker: &Docker, target: &str, dockerfile_path: &str, platform: &str) -> Result<()> {
        let rules = IgnoreRules::load(&self.context_dir)?;
        let context = tar_context(&self.context_dir, &rules)?;

        let options = BuildImageOptions {
            dockerfile: dockerfile_path.to_string(),
            t: target.to_string(),
            platform: platform.to_string(),
            rm: true,
            ..Default::default()
        };

        let mut stream = docker.build_image(options, None, Some(Bytes::from(context)));
        while let Some(result) = stream.next().await {
            let info = result.map_err(|e| Error::Remote(format!("image build failed: {}", e)))?;
            if let Some(detail) = info.error_detail {
                let message = detail.message.or(info.error).unwrap_or_default();
                return Err(Error::Remote(format!("image build failed: {}", message)));
            }
            if let Some(line) = info.stream {
                let line = line.trim_end();
                if !line.is_empty() {
                    debug!(target = %target, "{}", line);
                }
            }
        }
        Ok(())
    }

    async fn push(&self, docker: &Docker, target: &str) -> Result<()> {
        let (name, tag) = split_tag(target);
        let credentials = self.registry.credentials().await?;
        let credentials = DockerCredentials {
            username: Some(credentials.username),
            password: Some(credentials.password),
            serveraddress: Some(credentials.endpoint),
            ..Default::default()
        };

        let options = PushImageOptions { tag: tag.to_string() };
        let mut stream = docker.push_image(name, Some(options), Some(credentials));
        while let Some(result) = stream.next().await {
            let info = result.map_err(|e| Error::Remote(format!("image push failed: {}", e)))?;
            if let Some(error) = info.error {
                return Err(Error::Remote(format!("image push failed: {}", error)));
            }
            if let Some(status) = info.status {
                debug!(target = %target, status = %status, "Push progress");
            }
        }
        Ok(())
    }
}

/// `host/repo:tag` -> (`host/repo`, `tag`); a missing tag is `latest`.
pub fn split_tag(target: &str) -> (&str, &str) {
    let name_start = target.rfind('/').map(|i| i + 1).unwrap_or(0);
    match target[name_start..].rfind(':') {
        Some(i) => (&target[..name_start + i], &target[name_start + i + 1..]),
        None => (target, "latest"),
    }
}

#[async_trait]
impl Builder for LocalBuilder {
    fn name(&self) -> &'static str {
        "local"
    }

    fn backend(&self) -> BuildBackend {
        BuildBackend::Local
    }

    async fn build_and_push(&self, target: &str, dockerfile_path: &str, platform: &str) -> Result<()> {
        info!(target = %target, dockerfile = %dockerfile_path, platform = %platform, "Building image locally");
        let docker = self.docker().await?;
        self.build(docker, target, dockerfile_path, platform).await?;
        info!(target = %target, "Pushing image");
        self.push(docker, target).await?;
        info!(target = %target, "Image pushed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagehand_core::cloud::MemoryCloud;

    #[test]
    fn test_split_tag() {
        assert_eq!(
            split_tag("123.dkr.ecr.us-east-1.amazonaws.com/shop:dev"),
            ("123.dkr.ecr.us-east-1.amazonaws.com/shop", "dev")
        );
        assert_eq!(split_tag("localhost:5000/shop"), ("localhost:5000/shop", "latest"));
        assert_eq!(split_tag("shop:v1"), ("shop", "v1"));
    }

    #[test]
    fn test_connection_is_lazy() {
        let builder = LocalBuilder::new(Arc::new(MemoryCloud::new()), PathBuf::from("."));
        assert!(builder.docker.get().is_none());
        assert_eq!(builder.name(), "local");
    }

    #[tokio::test]
    #[ignore = "requires a running Docker daemon"]
    async fn test_build_with_docker() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM scratch\nCOPY Dockerfile /\n").unwrap();
        let builder = LocalBuilder::new(Arc::new(MemoryCloud::new()), dir.path().to_path_buf());
        let docker = builder.docker().await.unwrap();
        builder
            .build(docker, "stagehand-test:latest", "Dockerfile", "linux/amd64")
            .await
            .unwrap();
    }
}
