//! Managed remote build service builder.
//!
//! The build role and project are created on first use and live until
//! [`Builder::delete`]. Each build uploads the zipped context to the state
//! bucket, runs the build and removes the archive again.

use async_trait::async_trait;
use serde_json::{Value, json};
use stagehand_core::builder::{BuildBackend, Builder, registry_host};
use stagehand_core::cloud::{
    BuildInfo, BuildPhase, BuildProjectSpec, BuildServiceApi, BuildStatus, IdentityApi,
    ObjectStoreApi,
};
use stagehand_core::wait::{PollConfig, Probe, poll_until};
use stagehand_core::{Error, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use crate::archive::zip_context;
use crate::ignore::IgnoreRules;

pub const IMAGE_AMD64: &str = "aws/codebuild/amazonlinux-x86_64-standard:5.0";
pub const IMAGE_ARM64: &str = "aws/codebuild/amazonlinux-aarch64-standard:3.0";
pub const DEFAULT_COMPUTE_TYPE: &str = "BUILD_GENERAL1_MEDIUM";
pub const BUILD_POLL: PollConfig = PollConfig::secs(3600, 10);
const ROLE_POLICY_NAME: &str = "build-policy";

const BUILDSPEC: &str = "\
version: 0.2
phases:
  pre_build:
    commands:
      - >-
        aws ecr get-login-password --region $AWS_DEFAULT_REGION
        | docker login --username AWS --password-stdin $REGISTRY_HOST
  build:
    commands:
      - docker build -t $IMAGE_TAG -f $DOCKERFILE .
  post_build:
    commands:
      - docker push $IMAGE_TAG
";

pub struct RemoteBuilder {
    identity: Arc<dyn IdentityApi>,
    builds: Arc<dyn BuildServiceApi>,
    objects: Arc<dyn ObjectStoreApi>,
    region: String,
    state_bucket: String,
    context_dir: PathBuf,
    compute_type: String,
    project_name: String,
    role_name: String,
    permissions_boundary: Option<String>,
    poll: PollConfig,
}

impl RemoteBuilder {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identity: Arc<dyn IdentityApi>,
        builds: Arc<dyn BuildServiceApi>,
        objects: Arc<dyn ObjectStoreApi>,
        region: &str,
        prefix: &str,
        state_bucket: &str,
        context_dir: PathBuf,
        compute_type: Option<&str>,
    ) -> Self {
        Self {
            identity,
            builds,
            objects,
            region: region.to_string(),
            state_bucket: state_bucket.to_string(),
            context_dir,
            compute_type: compute_type.unwrap_or(DEFAULT_COMPUTE_TYPE).to_string(),
            project_name: format!("{}build", prefix),
            role_name: format!("{}build-role", prefix),
            permissions_boundary: None,
            poll: BUILD_POLL,
        }
    }

    pub fn with_poll(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    /// Policy ARN capping the build role it creates.
    pub fn with_permissions_boundary(mut self, boundary: Option<&str>) -> Self {
        self.permissions_boundary = boundary.map(str::to_string);
        self
    }

    pub fn project_name(&self) -> &str {
        &self.project_name
    }

    pub fn role_name(&self) -> &str {
        &self.role_name
    }

    pub fn source_key(&self) -> String {
        format!("build/{}/source.zip", self.project_name)
    }

    fn environment_for(platform: &str) -> (&'static str, &'static str) {
        if platform.contains("arm64") || platform.contains("aarch64") {
            ("ARM_CONTAINER", IMAGE_ARM64)
        } else {
            ("LINUX_CONTAINER", IMAGE_AMD64)
        }
    }

    fn role_policy(&self, account_id: &str) -> Value {
        json!({
            "Version": "2012-10-17",
            "Statement": [
                {
                    "Effect": "Allow",
                    "Action": ["ecr:GetAuthorizationToken"],
                    "Resource": "*"
                },
                {
                    "Effect": "Allow",
                    "Action": [
                        "ecr:BatchCheckLayerAvailability",
                        "ecr:GetDownloadUrlForLayer",
                        "ecr:BatchGetImage",
                        "ecr:PutImage",
                        "ecr:InitiateLayerUpload",
                        "ecr:UploadLayerPart",
                        "ecr:CompleteLayerUpload"
                    ],
                    "Resource": format!("arn:aws:ecr:{}:{}:repository/*", self.region, account_id)
                },
                {
                    "Effect": "Allow",
                    "Action": ["s3:GetObject", "s3:GetObjectVersion"],
                    "Resource": format!("arn:aws:s3:::{}/build/*", self.state_bucket)
                },
                {
                    "Effect": "Allow",
                    "Action": ["logs:CreateLogGroup", "logs:CreateLogStream", "logs:PutLogEvents"],
                    "Resource": format!(
                        "arn:aws:logs:{}:{}:log-group:/aws/codebuild/{}*",
                        self.region, account_id, self.project_name
                    )
                }
            ]
        })
    }

    async fn ensure_role(&self) -> Result<String> {
        if let Some(arn) = self.identity.get_role(&self.role_name).await? {
            return Ok(arn);
        }
        info!(
            role = %self.role_name,
            boundary = self.permissions_boundary.as_deref().unwrap_or("none"),
            "Creating build role"
        );
        let trust = json!({
            "Version": "2012-10-17",
            "Statement": [{
                "Effect": "Allow",
                "Principal": {"Service": "codebuild.amazonaws.com"},
                "Action": "sts:AssumeRole"
            }]
        });
        let arn = self
            .identity
            .create_role(&self.role_name, &trust, self.permissions_boundary.as_deref())
            .await?;
        let account_id = self.identity.account_id().await?;
        self.identity
            .put_role_policy(&self.role_name, ROLE_POLICY_NAME, &self.role_policy(&account_id))
            .await?;
        Ok(arn)
    }

    async fn ensure_project(&self, platform: &str, role_arn: &str) -> Result<()> {
        if self.builds.project_exists(&self.project_name).await? {
            return Ok(());
        }
        let (environment_type, image) = Self::environment_for(platform);
        info!(project = %self.project_name, image = %image, "Creating build project");
        self.builds
            .create_project(&BuildProjectSpec {
                name: self.project_name.clone(),
                service_role_arn: role_arn.to_string(),
                image: image.to_string(),
                compute_type: self.compute_type.clone(),
                environment_type: environment_type.to_string(),
                privileged: true,
                buildspec: BUILDSPEC.to_string(),
            })
            .await
    }

    async fn upload_source(&self) -> Result<()> {
        let rules = IgnoreRules::load(&self.context_dir)?;
        let archive = zip_context(&self.context_dir, &rules)?;
        info!(
            bucket = %self.state_bucket,
            key = %self.source_key(),
            size_kb = archive.len() / 1024,
            "Uploading build context"
        );
        self.objects
            .put_object(&self.state_bucket, &self.source_key(), archive, Some("application/zip"))
            .await
    }

    async fn run_build(&self, target: &str, dockerfile_path: &str) -> Result<BuildInfo> {
        let env = BTreeMap::from([
            ("IMAGE_TAG".to_string(), target.to_string()),
            ("DOCKERFILE".to_string(), dockerfile_path.to_string()),
            ("REGISTRY_HOST".to_string(), registry_host(target).to_string()),
        ]);
        let id = self
            .builds
            .start_build(&self.project_name, &self.state_bucket, &self.source_key(), &env)
            .await?;
        info!(build = %id, "Remote build started");

        let builds = &self.builds;
        let build_id = id.as_str();
        poll_until(self.poll, &format!("build {}", id), move || async move {
            let build = builds.get_build(build_id).await?;
            if build.status.is_terminal() {
                return Ok(Probe::Ready(build));
            }
            let observed = match build.phases.last() {
                Some(phase) => format!("{:?} in {}", build.status, describe_phase(phase)),
                None => format!("{:?}", build.status),
            };
            Ok(Probe::Pending(observed))
        })
        .await
    }
}

/// `NAME STATUS: message`, as far as the phase reports them.
fn describe_phase(phase: &BuildPhase) -> String {
    let mut text = phase.name.clone();
    if let Some(status) = &phase.status {
        text.push(' ');
        text.push_str(status);
    }
    if let Some(message) = phase.messages.first() {
        text.push_str(": ");
        text.push_str(message);
    }
    text
}

/// Log every phase that did not succeed and return their descriptions.
fn failed_phases(build: &BuildInfo) -> Vec<String> {
    let mut failed = Vec::new();
    for phase in &build.phases {
        let Some(status) = phase.status.as_deref() else {
            continue;
        };
        if status == "SUCCEEDED" {
            continue;
        }
        error!(
            build = %build.id,
            phase = %phase.name,
            status = %status,
            message = %phase.messages.first().map(String::as_str).unwrap_or(""),
            "Build phase failed"
        );
        failed.push(describe_phase(phase));
    }
    failed
}

#[async_trait]
impl Builder for RemoteBuilder {
    fn name(&self) -> &'static str {
        "managed-remote"
    }

    fn backend(&self) -> BuildBackend {
        BuildBackend::ManagedRemote
    }

    async fn build_and_push(&self, target: &str, dockerfile_path: &str, platform: &str) -> Result<()> {
        info!(target = %target, dockerfile = %dockerfile_path, platform = %platform, "Building image remotely");
        let role_arn = self.ensure_role().await?;
        self.ensure_project(platform, &role_arn).await?;
        self.upload_source().await?;

        let outcome = self.run_build(target, dockerfile_path).await;
        let cleanup = self.objects.delete_object(&self.state_bucket, &self.source_key()).await;
        let build = outcome?;
        cleanup?;

        match build.status {
            BuildStatus::Succeeded => {
                info!(build = %build.id, "Remote build finished");
                Ok(())
            }
            status => {
                let failed = failed_phases(&build);
                let mut message = format!("build {} ended with {:?}", build.id, status);
                if !failed.is_empty() {
                    message.push_str(": ");
                    message.push_str(&failed.join("; "));
                }
                Err(Error::Remote(message))
            }
        }
    }

    async fn has_resources(&self) -> Result<bool> {
        Ok(self.builds.project_exists(&self.project_name).await?
            || self.identity.get_role(&self.role_name).await?.is_some())
    }

    async fn delete(&self) -> Result<()> {
        if self.builds.project_exists(&self.project_name).await? {
            self.builds.delete_project(&self.project_name).await?;
            info!(project = %self.project_name, "Deleted build project");
        }
        if self.identity.get_role(&self.role_name).await?.is_some() {
            match self.identity.delete_role_policy(&self.role_name, ROLE_POLICY_NAME).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
            self.identity.delete_role(&self.role_name).await?;
            info!(role = %self.role_name, "Deleted build role");
        }
        Ok(())
    }
}
