//! Whole-stage commands: deploy, destroy and status.

use anyhow::{Context, Result};
use dialoguer::Confirm;
use stagehand_engine::{DeployEvent, DeployReport, Orchestrator};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{Session, Settings};

/// Print orchestrator events as they arrive.
fn spawn_printer() -> (mpsc::Sender<DeployEvent>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel(64);
    let handle = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                DeployEvent::ResourceStarted { resource, action } => {
                    println!("▶ {} ({})", resource, action);
                }
                DeployEvent::ResourceCompleted { resource, action } => {
                    println!("✓ {} ({})", resource, action);
                }
                DeployEvent::ResourceFailed { resource, message } => {
                    println!("✗ {} failed: {}", resource, message);
                }
                DeployEvent::FrontendUploaded { cdn, files } => {
                    println!("✓ Uploaded {} files to {}", files, cdn);
                }
                DeployEvent::ResourceDeleted { resource } => {
                    println!("✓ Deleted {}", resource);
                }
                DeployEvent::Finished { success } => {
                    if success {
                        println!("\nDone");
                    } else {
                        println!("\nStopped after a failure");
                    }
                }
            }
        }
    });
    (tx, handle)
}

async fn run_deploy(orchestrator: &Orchestrator, skip_frontend: bool) -> Result<DeployReport> {
    orchestrator
        .deploy_init_all()
        .await
        .context("Pre-deploy checks failed")?;
    let report = orchestrator.deploy().await.context("Deploy failed")?;
    if !skip_frontend {
        orchestrator
            .upload_frontend()
            .await
            .context("Frontend upload failed")?;
    }
    Ok(report)
}

pub async fn deploy(settings: &Settings, stage: &str, skip_frontend: bool) -> Result<()> {
    let (tx, printer) = spawn_printer();
    let session = Session::open(settings, stage)?.with_events(tx);

    println!("Deploying stage {}\n", stage);
    let result = run_deploy(&session.orchestrator, skip_frontend).await;
    // Dropping the session closes the event channel.
    let report = session.finish(result);
    let _ = printer.await;

    for (resource, action) in &report?.actions {
        println!("  {:<24} {}", resource, action);
    }
    Ok(())
}

pub async fn destroy(
    settings: &Settings,
    stage: &str,
    with_secrets: bool,
    with_state_bucket: bool,
    yes: bool,
) -> Result<()> {
    let (tx, printer) = spawn_printer();
    let session = Session::open(settings, stage)?.with_events(tx);

    let plan = session
        .orchestrator
        .destroy_plan(with_secrets, with_state_bucket)
        .await
        .context("Failed to read the live state")?;
    if plan.targets.is_empty() {
        println!("Nothing to destroy in stage {}", stage);
        return session.finish(Ok(()));
    }

    println!("Destroying stage {} will delete:", stage);
    for target in &plan.targets {
        println!("  - {}", target);
    }
    if !plan.omitted.is_empty() {
        println!("and keep:");
        for omitted in &plan.omitted {
            println!("  - {}", omitted);
        }
    }

    if !yes {
        let confirmed = Confirm::new()
            .with_prompt(format!("Destroy stage {}?", stage))
            .default(false)
            .interact()
            .context("Failed to read confirmation")?;
        if !confirmed {
            println!("Aborted");
            return session.finish(Ok(()));
        }
    }

    let result = session
        .orchestrator
        .destroy(with_secrets, with_state_bucket)
        .await
        .context("Destroy failed");
    let report = session.finish(result);
    let _ = printer.await;

    let report = report?;
    println!(
        "Deleted {} resources, {} kept or already absent",
        report.deleted.len(),
        report.skipped.len()
    );
    Ok(())
}

pub async fn status(settings: &Settings, stage: &str, ledger: bool) -> Result<()> {
    let session = Session::open(settings, stage)?;
    let orchestrator = &session.orchestrator;
    let result = async {
        let statuses = orchestrator.statuses().await?;
        let document = if ledger {
            Some(orchestrator.ledger_document().await?)
        } else {
            None
        };
        Ok::<_, stagehand_core::Error>((statuses, document))
    }
    .await
    .context("Failed to read statuses");
    let (statuses, document) = session.finish(result)?;

    println!("Stage {}", stage);
    for (resource, status) in statuses {
        println!("  {:<24} {}", resource, status);
    }
    if let Some(document) = document {
        println!("{}", serde_json::to_string_pretty(&document)?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::tests::settings;
    use stagehand_core::cloud::MemoryCloud;

    #[tokio::test]
    async fn test_deploy_then_destroy_through_the_sandbox() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());

        deploy(&settings, "dev", true).await.unwrap();
        let cloud = MemoryCloud::load(&settings.sandbox).unwrap();
        assert!(cloud.stack_names().contains(&"dev-shop-container".to_string()));

        // A fresh session sees the persisted state.
        let session = Session::open(&settings, "dev").unwrap();
        let statuses = session.orchestrator.statuses().await.unwrap();
        assert!(statuses.iter().all(|(_, s)| s.exists()));
        session.finish(Ok(())).unwrap();

        destroy(&settings, "dev", true, false, true).await.unwrap();
        let cloud = MemoryCloud::load(&settings.sandbox).unwrap();
        assert!(!cloud.stack_names().contains(&"dev-shop-container".to_string()));
    }

    #[tokio::test]
    async fn test_stages_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        deploy(&settings, "dev", true).await.unwrap();

        let session = Session::open(&settings, "prod").unwrap();
        let statuses = session.orchestrator.statuses().await.unwrap();
        assert!(statuses.iter().all(|(_, s)| !s.exists()));
    }
}
