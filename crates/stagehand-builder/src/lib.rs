//! Container image build backends for stagehand.
//!
//! Provides [`Builder`] implementations:
//! - Local container engine (`local`)
//! - Managed remote build service (`managed-remote`)
//! - External build service CLI (`third-party`)

pub mod archive;
pub mod ignore;
pub mod local;
pub mod remote;
pub mod third_party;

use stagehand_core::builder::{BuildBackend, BuildSpec, Builder};
use stagehand_core::cloud::CloudClients;
use stagehand_core::wait::PollConfig;
use stagehand_core::Result;
use std::collections::BTreeMap;
use std::sync::Arc;

pub use local::LocalBuilder;
pub use remote::RemoteBuilder;
pub use third_party::ThirdPartyBuilder;

/// What a builder needs besides its [`BuildSpec`].
#[derive(Clone)]
pub struct BuilderDeps {
    pub clients: CloudClients,
    pub region: String,
    /// Resource name prefix of the stage.
    pub prefix: String,
    pub state_bucket: String,
    pub env: BTreeMap<String, String>,
    /// Overrides the remote build poll settings.
    pub poll: Option<PollConfig>,
}

impl BuilderDeps {
    pub fn new(clients: CloudClients, region: &str, prefix: &str, state_bucket: &str) -> Self {
        Self {
            clients,
            region: region.to_string(),
            prefix: prefix.to_string(),
            state_bucket: state_bucket.to_string(),
            env: std::env::vars().collect(),
            poll: None,
        }
    }
}

/// Select a builder for the configured backend.
pub fn create_builder(spec: &BuildSpec, deps: BuilderDeps) -> Result<Arc<dyn Builder>> {
    let builder: Arc<dyn Builder> = match spec.backend {
        BuildBackend::Local => Arc::new(LocalBuilder::new(
            deps.clients.registry.clone(),
            spec.context_dir.clone(),
        )),
        BuildBackend::ManagedRemote => {
            let builder = RemoteBuilder::new(
                deps.clients.identity.clone(),
                deps.clients.builds.clone(),
                deps.clients.objects.clone(),
                &deps.region,
                &deps.prefix,
                &deps.state_bucket,
                spec.context_dir.clone(),
                spec.option("compute-type"),
            )
            .with_permissions_boundary(spec.option("permissions-boundary"));
            Arc::new(match deps.poll {
                Some(poll) => builder.with_poll(poll),
                None => builder,
            })
        }
        BuildBackend::ThirdParty => Arc::new(ThirdPartyBuilder::from_spec(spec, &deps.env)),
    };
    Ok(builder)
}

/// Parse a backend name (aliases included) and select a builder.
pub fn create_builder_named(name: &str, spec: &BuildSpec, deps: BuilderDeps) -> Result<Arc<dyn Builder>> {
    let mut spec = spec.clone();
    spec.backend = name.parse()?;
    create_builder(&spec, deps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagehand_core::Error;
    use stagehand_core::cloud::MemoryCloud;

    fn deps() -> BuilderDeps {
        let cloud = MemoryCloud::new();
        BuilderDeps::new(
            CloudClients::from_memory(&cloud),
            "us-east-1",
            "dev-shop-stagehand-",
            "dev-shop-stagehand-state",
        )
    }

    #[test]
    fn test_builder_selection() {
        let spec = BuildSpec::new(BuildBackend::Local);
        assert_eq!(create_builder_named("local", &spec, deps()).unwrap().name(), "local");
        assert_eq!(create_builder_named("docker", &spec, deps()).unwrap().name(), "local");
        assert_eq!(
            create_builder_named("managed-remote", &spec, deps()).unwrap().name(),
            "managed-remote"
        );
        assert_eq!(
            create_builder_named("depot", &spec, deps()).unwrap().backend(),
            BuildBackend::ThirdParty
        );
    }

    #[tokio::test]
    async fn test_remote_options_reach_the_builder() {
        use stagehand_core::cloud::{ObjectStoreApi, RegistryApi};

        let cloud = MemoryCloud::new();
        cloud.create_bucket("dev-shop-stagehand-state", "us-east-1").await.unwrap();
        cloud.create_repository("dev-shop-container").await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM scratch\n").unwrap();

        let mut spec = BuildSpec::new(BuildBackend::ManagedRemote);
        spec.context_dir = dir.path().to_path_buf();
        let boundary = "arn:aws:iam::123456789012:policy/boundary";
        spec.options
            .insert("permissions-boundary".to_string(), boundary.to_string());
        let mut deps = BuilderDeps::new(
            CloudClients::from_memory(&cloud),
            "us-east-1",
            "dev-shop-stagehand-",
            "dev-shop-stagehand-state",
        );
        deps.poll = Some(PollConfig::new(
            std::time::Duration::from_millis(100),
            std::time::Duration::from_millis(5),
        ));

        let builder = create_builder(&spec, deps).unwrap();
        builder
            .build_and_push(
                "123456789012.dkr.ecr.us-east-1.amazonaws.com/dev-shop-container:dev",
                "Dockerfile",
                "linux/amd64",
            )
            .await
            .unwrap();
        assert_eq!(
            cloud
                .role_permissions_boundary("dev-shop-stagehand-build-role")
                .as_deref(),
            Some(boundary)
        );
    }

    #[test]
    fn test_unknown_backend_is_configuration_error() {
        let spec = BuildSpec::new(BuildBackend::Local);
        let err = create_builder_named("unknown", &spec, deps()).err().unwrap();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
