//! External build service driven through its CLI.

use async_trait::async_trait;
use stagehand_core::builder::{BuildBackend, BuildSpec, Builder};
use stagehand_core::{Error, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::info;

pub const PROGRAM: &str = "depot";

pub struct ThirdPartyBuilder {
    project_id: Option<String>,
    token: Option<String>,
    context_dir: PathBuf,
}

impl ThirdPartyBuilder {
    /// Settings come from the build options first, then the environment.
    pub fn from_spec(spec: &BuildSpec, env: &BTreeMap<String, String>) -> Self {
        let option_or_env = |option: &str, vars: &[&str]| {
            spec.option(option)
                .map(str::to_string)
                .or_else(|| vars.iter().find_map(|v| env.get(*v).cloned()))
                .filter(|v| !v.is_empty())
        };
        Self {
            project_id: option_or_env("project-id", &["DEPOT_PROJECT_ID"]),
            token: option_or_env("token", &["DEPOT_TOKEN", "DEPOT_API_KEY"]),
            context_dir: spec.context_dir.clone(),
        }
    }

    fn project_id(&self) -> Result<&str> {
        self.project_id.as_deref().ok_or_else(|| {
            Error::Configuration(
                "third-party builder needs a project-id option or DEPOT_PROJECT_ID".to_string(),
            )
        })
    }

    fn token(&self) -> Result<&str> {
        self.token.as_deref().ok_or_else(|| {
            Error::Configuration(
                "third-party builder needs a token option, DEPOT_TOKEN or DEPOT_API_KEY".to_string(),
            )
        })
    }

    pub fn args(&self, target: &str, dockerfile_path: &str, platform: &str) -> Result<Vec<String>> {
        Ok([
            "build",
            ".",
            "--file",
            dockerfile_path,
            "--tag",
            target,
            "--platform",
            platform,
            "--push",
            "--project",
            self.project_id()?,
        ]
        .into_iter()
        .map(str::to_string)
        .collect())
    }
}

#[async_trait]
impl Builder for ThirdPartyBuilder {
    fn name(&self) -> &'static str {
        "third-party"
    }

    fn backend(&self) -> BuildBackend {
        BuildBackend::ThirdParty
    }

    async fn build_and_push(&self, target: &str, dockerfile_path: &str, platform: &str) -> Result<()> {
        let args = self.args(target, dockerfile_path, platform)?;
        let token = self.token()?;
        info!(target = %target, project = ?self.project_id, "Building image with {}", PROGRAM);

        let status = Command::new(PROGRAM)
            .args(&args)
            .current_dir(&self.context_dir)
            .env("DEPOT_TOKEN", token)
            .status()
            .await
            .map_err(|e| Error::Remote(format!("failed to run {}: {}", PROGRAM, e)))?;
        if !status.success() {
            return Err(Error::Remote(format!("{} build exited with {}", PROGRAM, status)));
        }
        info!(target = %target, "Image pushed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> BuildSpec {
        BuildSpec::new(BuildBackend::ThirdParty)
    }

    #[test]
    fn test_args() {
        let mut spec = spec();
        spec.options.insert("project-id".into(), "abc123".into());
        let builder = ThirdPartyBuilder::from_spec(&spec, &BTreeMap::new());
        let args = builder.args("repo:dev", "Dockerfile", "linux/arm64").unwrap();
        assert_eq!(
            args.join(" "),
            "build . --file Dockerfile --tag repo:dev --platform linux/arm64 --push --project abc123"
        );
    }

    #[test]
    fn test_settings_fall_back_to_environment() {
        let env = BTreeMap::from([
            ("DEPOT_PROJECT_ID".to_string(), "p1".to_string()),
            ("DEPOT_API_KEY".to_string(), "k1".to_string()),
        ]);
        let builder = ThirdPartyBuilder::from_spec(&spec(), &env);
        assert_eq!(builder.project_id().unwrap(), "p1");
        assert_eq!(builder.token().unwrap(), "k1");
    }

    #[tokio::test]
    async fn test_missing_token_is_configuration_error() {
        let mut spec = spec();
        spec.options.insert("project-id".into(), "abc123".into());
        let builder = ThirdPartyBuilder::from_spec(&spec, &BTreeMap::new());
        let err = builder
            .build_and_push("repo:dev", "Dockerfile", "linux/amd64")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
