//! Managed secret commands.

use anyhow::{Result, anyhow};
use dialoguer::Confirm;
use stagehand_resources::Mediator;

use super::{Session, Settings};

fn mediator(session: &Session) -> Result<&Mediator> {
    session.orchestrator.mediator().ok_or_else(|| {
        anyhow!(
            "Stage {} has no container, so no managed secrets",
            session.context().config.stage
        )
    })
}

pub async fn ensure(settings: &Settings, stage: &str) -> Result<()> {
    let session = Session::open(settings, stage)?;
    let result = match mediator(&session) {
        Ok(m) => m.ensure_managed_secrets_default().await.map_err(Into::into),
        Err(e) => Err(e),
    };
    let report = session.finish(result)?;

    for key in &report.generated {
        println!("generated {}", key);
    }
    for key in &report.skipped {
        println!("kept      {}", key);
    }
    for warning in &report.warnings {
        println!("warning   {}", warning);
    }
    Ok(())
}

pub async fn rotate(settings: &Settings, stage: &str, keys: &[String]) -> Result<()> {
    let session = Session::open(settings, stage)?;
    let result = match mediator(&session) {
        Ok(m) => m.rotate(keys).await.map_err(Into::into),
        Err(e) => Err(e),
    };
    for key in session.finish(result)? {
        println!("rotated {}", key);
    }
    Ok(())
}

pub async fn delete(settings: &Settings, stage: &str, yes: bool) -> Result<()> {
    let session = Session::open(settings, stage)?;
    let location = mediator(&session)?.store().location();
    if !yes {
        let confirmed = Confirm::new()
            .with_prompt(format!("Delete every managed secret in {}?", location))
            .default(false)
            .interact()?;
        if !confirmed {
            println!("Aborted");
            return session.finish(Ok(()));
        }
    }
    let result = match mediator(&session) {
        Ok(m) => m.delete_managed_secrets().await.map_err(Into::into),
        Err(e) => Err(e),
    };
    session.finish(result)?;
    println!("Deleted managed secrets in {}", location);
    Ok(())
}

pub async fn list(settings: &Settings, stage: &str) -> Result<()> {
    let session = Session::open(settings, stage)?;
    let mediator = mediator(&session)?;
    let stored = mediator.store().get_all().await?;

    println!("{}", mediator.store().location());
    for spec in mediator.managed() {
        let state = if stored.contains_key(&spec.key) {
            "stored"
        } else {
            "missing"
        };
        println!("  {:<24} {:<22} {}", spec.key, spec.kind.to_string(), state);
    }
    Ok(())
}
