//! Single-resource commands.

use anyhow::{Context, Result, anyhow, bail};
use stagehand_config::{declared_stages, load_stage_config};
use stagehand_core::ResourceStatus;
use stagehand_resources::{Resource, ResourceKind, VirtualNetwork};
use std::sync::Arc;
use tracing::info;

use super::{Session, Settings};
use crate::ResourceOperation;

/// Which resource a command addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Stage { stage: String, name: Option<String> },
    /// A shared network, addressed by its reference.
    Reference(String),
}

impl Target {
    pub fn from_args(stage: Option<String>, reference: Option<String>, name: Option<String>) -> Result<Self> {
        match (stage, reference) {
            (Some(stage), None) => Ok(Target::Stage { stage, name }),
            (None, Some(reference)) => Ok(Target::Reference(reference)),
            (Some(_), Some(_)) => bail!("--stage and --ref are mutually exclusive"),
            (None, None) => bail!("either --stage or --ref is required"),
        }
    }
}

pub async fn run(
    settings: &Settings,
    kind: ResourceKind,
    operation: ResourceOperation,
    target: Target,
) -> Result<()> {
    let (session, resource) = match target {
        Target::Stage { stage, name } => {
            let session = Session::open(settings, &stage)?;
            let resource = select(&session, kind, name.as_deref())?;
            (session, resource)
        }
        Target::Reference(reference) => {
            if kind != ResourceKind::Network {
                bail!("--ref only addresses networks, not {}", kind);
            }
            shared_network(settings, &reference)?
        }
    };

    let result = apply(&session, resource.as_ref(), operation).await;
    session.finish(result)
}

/// The resource of `kind`, disambiguated by `name` when the stage has several.
fn select(session: &Session, kind: ResourceKind, name: Option<&str>) -> Result<Arc<dyn Resource>> {
    let candidates = session.orchestrator.resources_of_kind(kind);
    let matching: Vec<&Arc<dyn Resource>> = match name {
        Some(name) => {
            let qualified = format!("{}:{}", kind, name);
            candidates
                .into_iter()
                .filter(|r| r.name() == qualified || r.name() == name)
                .collect()
        }
        None => candidates,
    };

    match matching.as_slice() {
        [] => Err(anyhow!(
            "Stage {} has no {}{}",
            session.context().config.stage,
            kind,
            name.map(|n| format!(" named {}", n)).unwrap_or_default()
        )),
        [one] => Ok(Arc::clone(*one)),
        many => {
            let names: Vec<String> = many.iter().map(|r| r.name()).collect();
            bail!("Several {} resources ({}), pick one with --name", kind, names.join(", "))
        }
    }
}

/// The network of the first declared stage, re-pointed at `reference`.
fn shared_network(settings: &Settings, reference: &str) -> Result<(Session, Arc<dyn Resource>)> {
    let text = std::fs::read_to_string(&settings.config)
        .with_context(|| format!("Failed to read config file: {}", settings.config.display()))?;
    let stage = declared_stages(&text)?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("The project declares no stages"))?;
    let mut config = load_stage_config(&settings.config, &stage)?;
    let mut network = config
        .network
        .clone()
        .ok_or_else(|| anyhow!("The project declares no network"))?;
    network.reference = reference.to_string();
    // The network is the only resource addressed by reference.
    config.container = None;
    config.managed_db = None;
    config.cdns.clear();
    config.network = Some(network.clone());

    let session = Session::open_with(settings, config)?;
    let resource: Arc<dyn Resource> = Arc::new(VirtualNetwork::new(session.context(), &network));
    Ok((session, resource))
}

async fn apply(session: &Session, resource: &dyn Resource, operation: ResourceOperation) -> Result<()> {
    let name = resource.name();
    let orchestrator = &session.orchestrator;
    let mediator = if resource.uses_mediator() {
        orchestrator.mediator()
    } else {
        None
    };

    match operation {
        ResourceOperation::Status => {
            let status = resource.status().await?;
            println!("{}: {}", name, status);
            if let Some(stack) = resource.stack() {
                println!("{}", stack.status_detail().await?);
            }
        }
        ResourceOperation::Create | ResourceOperation::Update => {
            if resource.is_external() {
                bail!("{} is managed externally", name);
            }
            let status = resource.status().await?;
            let creating = operation == ResourceOperation::Create;
            match (creating, status) {
                (true, ResourceStatus::NoExist) => resource.create(mediator).await?,
                (true, other) => bail!("{} already exists ({}), use update", name, other),
                (false, ResourceStatus::NoExist) => bail!("{} does not exist, use create", name),
                (false, _) => resource.update(mediator).await?,
            }
            orchestrator.ledger().ensure_bucket().await?;
            orchestrator.ledger().record(resource.state_info()?).await?;
            info!(resource = %name, "Recorded state");
            println!("{}: {}", name, resource.status().await?);
        }
        ResourceOperation::Delete => {
            if resource.is_external() {
                bail!("{} is managed externally", name);
            }
            if resource.status().await?.exists() {
                resource.delete().await?;
                if resource.status().await?.exists() {
                    println!("Kept {}, it is still in use", name);
                } else {
                    println!("Deleted {}", name);
                }
            } else {
                println!("{} does not exist", name);
            }
        }
        ResourceOperation::Yaml => {
            let stack = resource
                .stack()
                .ok_or_else(|| anyhow!("{} has no template", name))?;
            print!("{}", stack.yaml().await?);
        }
        ResourceOperation::YamlDiff => {
            let stack = resource
                .stack()
                .ok_or_else(|| anyhow!("{} has no template", name))?;
            let diff = stack.yaml_diff().await?;
            if diff.is_empty() {
                println!("{} is in sync", name);
            } else {
                print!("{}", diff);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::tests::settings;

    #[test]
    fn test_target_from_args() {
        assert_eq!(
            Target::from_args(Some("dev".into()), None, Some("web".into())).unwrap(),
            Target::Stage {
                stage: "dev".into(),
                name: Some("web".into())
            }
        );
        assert_eq!(
            Target::from_args(None, Some("main".into()), None).unwrap(),
            Target::Reference("main".into())
        );
        assert!(Target::from_args(None, None, None).is_err());
    }

    #[tokio::test]
    async fn test_create_then_update_storage() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        let target = || Target::Stage {
            stage: "dev".into(),
            name: None,
        };

        assert!(run(&settings, ResourceKind::Storage, ResourceOperation::Update, target()).await.is_err());
        run(&settings, ResourceKind::Storage, ResourceOperation::Create, target()).await.unwrap();
        assert!(run(&settings, ResourceKind::Storage, ResourceOperation::Create, target()).await.is_err());
        run(&settings, ResourceKind::Storage, ResourceOperation::Update, target()).await.unwrap();

        let session = Session::open(&settings, "dev").unwrap();
        let ledger = session.orchestrator.ledger_document().await.unwrap();
        assert!(ledger["resources"]["storage"]["bucket_name"].is_string());
    }

    #[tokio::test]
    async fn test_missing_kind_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        let session = Session::open(&settings, "dev").unwrap();
        let err = select(&session, ResourceKind::Cdn, None).err().unwrap();
        assert!(err.to_string().contains("has no cdn"));
    }

    #[tokio::test]
    async fn test_ref_needs_a_declared_network() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        let target = Target::Reference("main".into());
        assert!(run(&settings, ResourceKind::Network, ResourceOperation::Status, target).await.is_err());
        let target = Target::Reference("main".into());
        assert!(run(&settings, ResourceKind::Storage, ResourceOperation::Status, target).await.is_err());
    }
}
