//! In-memory control plane.
//!
//! `MemoryCloud` implements every client trait over one serialisable state.
//! Long-running operations settle immediately, every mutating call is logged
//! in order, and the whole state can be persisted to a JSON file so the CLI
//! can drive real flows without a provider account.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_yaml::Value as Yaml;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use super::*;
use crate::builder::{BuildBackend, Builder};
use crate::{Error, Result};

const ACCOUNT_ID: &str = "123456789012";
const DEFAULT_REGION: &str = "us-east-1";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct MemStack {
    status: String,
    template: String,
    outputs: BTreeMap<String, String>,
    functions: Vec<String>,
    #[serde(default)]
    tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct MemBucket {
    region: String,
    access_block: Option<PublicAccessBlock>,
    policy: Option<Value>,
    website_redirect: Option<String>,
    objects: BTreeMap<String, Vec<u8>>,
    versions: Vec<ObjectVersion>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct MemRepository {
    uri: String,
    images: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct MemRole {
    arn: String,
    policies: BTreeMap<String, Value>,
    #[serde(default)]
    permissions_boundary: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct MemBranch {
    name: String,
    endpoint: Option<DbEndpoint>,
    roles: BTreeMap<String, String>,
    databases: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct MemDbProject {
    name: String,
    region: String,
    pg_version: u32,
    branches: BTreeMap<String, MemBranch>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MemSqlCluster {
    project_id: String,
    cluster: SqlCluster,
    root_password: String,
    databases: BTreeSet<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CloudState {
    region: String,
    stacks: BTreeMap<String, MemStack>,
    edge_stacks: BTreeMap<String, MemStack>,
    buckets: BTreeMap<String, MemBucket>,
    foreign_buckets: BTreeSet<String>,
    repositories: BTreeMap<String, MemRepository>,
    functions: BTreeMap<String, FunctionState>,
    parameters: BTreeMap<String, String>,
    secret_blobs: BTreeMap<String, String>,
    roles: BTreeMap<String, MemRole>,
    build_projects: BTreeMap<String, BuildProjectSpec>,
    builds: BTreeMap<String, BuildInfo>,
    fail_next_build: bool,
    #[serde(default)]
    stall_next_build: bool,
    db_clusters: BTreeMap<String, DbCluster>,
    db_instances: BTreeMap<String, String>,
    db_snapshots: Vec<String>,
    subnet_groups: BTreeMap<String, Vec<String>>,
    security_groups: BTreeMap<String, (String, String)>,
    invalidations: Vec<(String, Vec<String>)>,
    db_projects: BTreeMap<String, MemDbProject>,
    sql_projects: Vec<SqlProject>,
    sql_clusters: BTreeMap<String, MemSqlCluster>,
    next_id: u64,
    calls: Vec<String>,
}

impl Default for CloudState {
    fn default() -> Self {
        Self {
            region: DEFAULT_REGION.to_string(),
            stacks: BTreeMap::new(),
            edge_stacks: BTreeMap::new(),
            buckets: BTreeMap::new(),
            foreign_buckets: BTreeSet::new(),
            repositories: BTreeMap::new(),
            functions: BTreeMap::new(),
            parameters: BTreeMap::new(),
            secret_blobs: BTreeMap::new(),
            roles: BTreeMap::new(),
            build_projects: BTreeMap::new(),
            builds: BTreeMap::new(),
            fail_next_build: false,
            stall_next_build: false,
            db_clusters: BTreeMap::new(),
            db_instances: BTreeMap::new(),
            db_snapshots: Vec::new(),
            subnet_groups: BTreeMap::new(),
            security_groups: BTreeMap::new(),
            invalidations: Vec::new(),
            db_projects: BTreeMap::new(),
            sql_projects: vec![SqlProject {
                id: "1000".to_string(),
                name: "default".to_string(),
            }],
            sql_clusters: BTreeMap::new(),
            next_id: 1,
            calls: Vec::new(),
        }
    }
}

impl CloudState {
    fn record(&mut self, call: String) {
        debug!(call = %call, "Control plane call");
        self.calls.push(call);
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn stacks_mut(&mut self, edge: bool) -> &mut BTreeMap<String, MemStack> {
        if edge {
            &mut self.edge_stacks
        } else {
            &mut self.stacks
        }
    }

    fn repository_uri(&self, name: &str) -> String {
        format!("{}.dkr.ecr.{}.amazonaws.com/{}", ACCOUNT_ID, self.region, name)
    }

    /// Digest currently tagged at `host/repo:tag`.
    fn digest_for_uri(&self, uri: &str) -> Option<String> {
        let (repo, tag) = split_image_uri(uri)?;
        self.repositories.get(repo)?.images.get(tag).cloned()
    }

    fn push_image(&mut self, target: &str) -> Result<String> {
        let (repo, tag) = split_image_uri(target)
            .ok_or_else(|| Error::Remote(format!("invalid image reference: {}", target)))?;
        let seq = self.next_id();
        let repository = self
            .repositories
            .get_mut(repo)
            .ok_or_else(|| Error::Remote(format!("repository {} does not exist", repo)))?;
        let digest = format!(
            "sha256:{}",
            hex::encode(Sha256::digest(format!("{}#{}", target, seq)))
        );
        repository.images.insert(tag.to_string(), digest.clone());
        self.record(format!("registry.push {}", target));
        Ok(digest)
    }

    fn bucket(&self, name: &str) -> Result<&MemBucket> {
        self.buckets
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("bucket {}", name)))
    }

    fn bucket_mut(&mut self, name: &str) -> Result<&mut MemBucket> {
        self.buckets
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(format!("bucket {}", name)))
    }

    fn branch_mut(&mut self, project_id: &str, branch_id: &str) -> Result<&mut MemBranch> {
        self.db_projects
            .get_mut(project_id)
            .and_then(|p| p.branches.get_mut(branch_id))
            .ok_or_else(|| Error::NotFound(format!("branch {}/{}", project_id, branch_id)))
    }

    /// Apply a template: outputs and the functions it declares.
    fn apply_template(&mut self, stack_name: &str, template: &str) -> Result<MemStack> {
        let doc: Yaml = serde_yaml::from_str(template)
            .map_err(|e| Error::Remote(format!("template validation failed: {}", e)))?;

        let mut outputs = BTreeMap::new();
        if let Some(Yaml::Mapping(entries)) = doc.get("Outputs") {
            for (key, output) in entries {
                let Some(key) = key.as_str() else { continue };
                let value = match output.get("Value") {
                    Some(Yaml::String(literal)) => literal.clone(),
                    _ => format!("{}-{}", stack_name, key),
                };
                outputs.insert(key.to_string(), value);
            }
        }

        let mut functions = Vec::new();
        if let Some(Yaml::Mapping(resources)) = doc.get("Resources") {
            for resource in resources.values() {
                if resource.get("Type").and_then(Yaml::as_str) != Some("AWS::Lambda::Function") {
                    continue;
                }
                let Some(props) = resource.get("Properties") else {
                    continue;
                };
                let name = props.get("FunctionName").and_then(Yaml::as_str);
                let image = props
                    .get("Code")
                    .and_then(|c| c.get("ImageUri"))
                    .and_then(Yaml::as_str);
                if let (Some(name), Some(image)) = (name, image) {
                    let state = FunctionState {
                        name: name.to_string(),
                        image_uri: image.to_string(),
                        image_digest: self.digest_for_uri(image),
                        last_update: FunctionUpdate::Successful,
                    };
                    self.functions.insert(name.to_string(), state);
                    functions.push(name.to_string());
                }
            }
        }

        Ok(MemStack {
            status: String::new(),
            template: template.to_string(),
            outputs,
            functions,
            tags: BTreeMap::new(),
        })
    }
}

fn split_image_uri(uri: &str) -> Option<(&str, &str)> {
    let (_, path) = uri.split_once('/')?;
    path.rsplit_once(':')
}

/// Shared in-memory control plane.
///
/// Clones share state. [`MemoryCloud::edge`] returns a handle whose
/// `StackApi` operates on the edge region.
#[derive(Debug, Clone, Default)]
pub struct MemoryCloud {
    state: Arc<Mutex<CloudState>>,
    edge: bool,
}

impl MemoryCloud {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_region(region: &str) -> Self {
        let cloud = Self::new();
        cloud.lock().region = region.to_string();
        cloud
    }

    /// Load persisted state, or start empty when the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let raw = std::fs::read_to_string(path)?;
        let state: CloudState = serde_json::from_str(&raw)?;
        Ok(Self {
            state: Arc::new(Mutex::new(state)),
            edge: false,
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(&*self.lock())?;
        std::fs::write(path, raw)?;
        Ok(())
    }

    /// Handle bound to the edge region.
    pub fn edge(&self) -> Self {
        Self {
            state: self.state.clone(),
            edge: true,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CloudState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Every mutating call so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Force a stack into a lifecycle code, in either region.
    pub fn set_stack_status(&self, name: &str, status: &str) {
        let mut state = self.lock();
        let target = if state.stacks.contains_key(name) {
            state.stacks.get_mut(name)
        } else {
            state.edge_stacks.get_mut(name)
        };
        match target {
            Some(stack) => stack.status = status.to_string(),
            None => {
                state.stacks.insert(
                    name.to_string(),
                    MemStack {
                        status: status.to_string(),
                        ..Default::default()
                    },
                );
            }
        }
    }

    /// Make the next remote build end in `FAILED`.
    pub fn fail_next_build(&self) {
        self.lock().fail_next_build = true;
    }

    /// Leave the next remote build running in its `BUILD` phase.
    pub fn stall_next_build(&self) {
        self.lock().stall_next_build = true;
    }

    pub fn role_permissions_boundary(&self, name: &str) -> Option<String> {
        self.lock()
            .roles
            .get(name)
            .and_then(|r| r.permissions_boundary.clone())
    }

    /// Push an image as the given `host/repo:tag`; returns the new digest.
    pub fn push_image(&self, target: &str) -> Result<String> {
        self.lock().push_image(target)
    }

    /// Register a bucket owned by another account.
    pub fn add_foreign_bucket(&self, name: &str) {
        self.lock().foreign_buckets.insert(name.to_string());
    }

    pub fn add_sql_project(&self, id: &str, name: &str) {
        self.lock().sql_projects.push(SqlProject {
            id: id.to_string(),
            name: name.to_string(),
        });
    }

    /// Put a function into the given update state.
    pub fn set_function_update(&self, name: &str, update: FunctionUpdate) {
        if let Some(function) = self.lock().functions.get_mut(name) {
            function.last_update = update;
        }
    }

    pub fn set_db_cluster_status(&self, id: &str, status: &str) {
        if let Some(cluster) = self.lock().db_clusters.get_mut(id) {
            cluster.status = status.to_string();
        }
    }

    pub fn set_sql_cluster_state(&self, id: &str, state: &str) {
        if let Some(cluster) = self.lock().sql_clusters.get_mut(id) {
            cluster.cluster.state = state.to_string();
        }
    }

    pub fn invalidations(&self) -> Vec<(String, Vec<String>)> {
        self.lock().invalidations.clone()
    }

    pub fn stack_names(&self) -> Vec<String> {
        let state = self.lock();
        state
            .stacks
            .keys()
            .chain(state.edge_stacks.keys())
            .cloned()
            .collect()
    }
}

#[async_trait]
impl StackApi for MemoryCloud {
    async fn describe_stack(&self, name: &str) -> Result<Option<StackDescription>> {
        let mut state = self.lock();
        Ok(state.stacks_mut(self.edge).get(name).map(|s| StackDescription {
            name: name.to_string(),
            status: s.status.clone(),
            status_reason: None,
            deletion_time: None,
            outputs: s.outputs.clone(),
            tags: s.tags.clone(),
        }))
    }

    async fn get_template(&self, name: &str) -> Result<Option<String>> {
        let mut state = self.lock();
        Ok(state
            .stacks_mut(self.edge)
            .get(name)
            .filter(|s| !s.template.is_empty())
            .map(|s| s.template.clone()))
    }

    async fn create_stack(&self, request: &StackRequest) -> Result<()> {
        let mut state = self.lock();
        if state.stacks_mut(self.edge).contains_key(&request.name) {
            return Err(Error::Conflict(format!(
                "stack {} already exists",
                request.name
            )));
        }
        let mut stack = state.apply_template(&request.name, &request.template)?;
        stack.status = "CREATE_COMPLETE".to_string();
        state.stacks_mut(self.edge).insert(request.name.clone(), stack);
        state.record(format!("stacks.create {}", request.name));
        Ok(())
    }

    async fn update_stack(&self, request: &StackRequest) -> Result<()> {
        let mut state = self.lock();
        if !state.stacks_mut(self.edge).contains_key(&request.name) {
            return Err(Error::Remote(format!(
                "stack {} does not exist",
                request.name
            )));
        }
        let tags = state
            .stacks_mut(self.edge)
            .get(&request.name)
            .map(|s| s.tags.clone())
            .unwrap_or_default();
        let mut stack = state.apply_template(&request.name, &request.template)?;
        stack.status = "UPDATE_COMPLETE".to_string();
        stack.tags = tags;
        state.stacks_mut(self.edge).insert(request.name.clone(), stack);
        state.record(format!("stacks.update {}", request.name));
        Ok(())
    }

    async fn delete_stack(&self, name: &str) -> Result<()> {
        let mut state = self.lock();
        if let Some(stack) = state.stacks_mut(self.edge).remove(name) {
            for function in stack.functions {
                state.functions.remove(&function);
            }
        }
        state.record(format!("stacks.delete {}", name));
        Ok(())
    }

    async fn set_stack_tags(&self, name: &str, tags: &BTreeMap<String, String>) -> Result<()> {
        let mut state = self.lock();
        let stack = state
            .stacks_mut(self.edge)
            .get_mut(name)
            .ok_or_else(|| Error::Remote(format!("stack {} does not exist", name)))?;
        stack.tags = tags.clone();
        state.record(format!("stacks.tag {}", name));
        Ok(())
    }
}

#[async_trait]
impl ObjectStoreApi for MemoryCloud {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        let state = self.lock();
        if state.foreign_buckets.contains(bucket) {
            return Err(Error::Conflict(format!(
                "bucket {} is owned by another account",
                bucket
            )));
        }
        Ok(state.buckets.contains_key(bucket))
    }

    async fn create_bucket(&self, bucket: &str, region: &str) -> Result<()> {
        let mut state = self.lock();
        if state.foreign_buckets.contains(bucket) || state.buckets.contains_key(bucket) {
            return Err(Error::Conflict(format!("bucket {} already exists", bucket)));
        }
        state.buckets.insert(
            bucket.to_string(),
            MemBucket {
                region: region.to_string(),
                ..Default::default()
            },
        );
        state.record(format!("objects.create_bucket {}", bucket));
        Ok(())
    }

    async fn get_public_access_block(&self, bucket: &str) -> Result<Option<PublicAccessBlock>> {
        Ok(self.lock().bucket(bucket)?.access_block)
    }

    async fn put_public_access_block(
        &self,
        bucket: &str,
        block: PublicAccessBlock,
    ) -> Result<()> {
        let mut state = self.lock();
        state.bucket_mut(bucket)?.access_block = Some(block);
        state.record(format!("objects.put_public_access_block {}", bucket));
        Ok(())
    }

    async fn get_bucket_policy(&self, bucket: &str) -> Result<Option<Value>> {
        Ok(self.lock().bucket(bucket)?.policy.clone())
    }

    async fn put_bucket_policy(&self, bucket: &str, policy: &Value) -> Result<()> {
        let mut state = self.lock();
        let target = state.bucket_mut(bucket)?;
        let blocked = target
            .access_block
            .is_some_and(|b| b.block_public_policy);
        if blocked && policy.to_string().contains("\"Principal\":\"*\"") {
            return Err(Error::Remote(format!(
                "public policies are blocked on bucket {}",
                bucket
            )));
        }
        target.policy = Some(policy.clone());
        state.record(format!("objects.put_bucket_policy {}", bucket));
        Ok(())
    }

    async fn delete_bucket_policy(&self, bucket: &str) -> Result<()> {
        let mut state = self.lock();
        state.bucket_mut(bucket)?.policy = None;
        state.record(format!("objects.delete_bucket_policy {}", bucket));
        Ok(())
    }

    async fn put_bucket_website_redirect(&self, bucket: &str, host: &str) -> Result<()> {
        let mut state = self.lock();
        state.bucket_mut(bucket)?.website_redirect = Some(host.to_string());
        state.record(format!("objects.put_bucket_website {} -> {}", bucket, host));
        Ok(())
    }

    async fn delete_bucket_website(&self, bucket: &str) -> Result<()> {
        let mut state = self.lock();
        state.bucket_mut(bucket)?.website_redirect = None;
        state.record(format!("objects.delete_bucket_website {}", bucket));
        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.lock().bucket(bucket)?.objects.get(key).cloned())
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        _content_type: Option<&str>,
    ) -> Result<()> {
        let mut state = self.lock();
        let version_id = format!("v{}", state.next_id());
        let target = state.bucket_mut(bucket)?;
        target.objects.insert(key.to_string(), body);
        target.versions.push(ObjectVersion {
            key: key.to_string(),
            version_id: Some(version_id),
            delete_marker: false,
        });
        state.record(format!("objects.put {}/{}", bucket, key));
        Ok(())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        let mut state = self.lock();
        let version_id = format!("v{}", state.next_id());
        let target = state.bucket_mut(bucket)?;
        if target.objects.remove(key).is_some() {
            target.versions.push(ObjectVersion {
                key: key.to_string(),
                version_id: Some(version_id),
                delete_marker: true,
            });
        }
        state.record(format!("objects.delete {}/{}", bucket, key));
        Ok(())
    }

    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .lock()
            .bucket(bucket)?
            .objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn list_object_versions(&self, bucket: &str) -> Result<Vec<ObjectVersion>> {
        Ok(self.lock().bucket(bucket)?.versions.clone())
    }

    async fn delete_object_versions(
        &self,
        bucket: &str,
        versions: &[ObjectVersion],
    ) -> Result<()> {
        let mut state = self.lock();
        let target = state.bucket_mut(bucket)?;
        target.versions.retain(|v| !versions.contains(v));
        let remaining: BTreeSet<String> = target.versions.iter().map(|v| v.key.clone()).collect();
        target.objects.retain(|k, _| remaining.contains(k));
        state.record(format!(
            "objects.delete_versions {} ({})",
            bucket,
            versions.len()
        ));
        Ok(())
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<()> {
        let mut state = self.lock();
        let target = state.bucket(bucket)?;
        if !target.objects.is_empty() || !target.versions.is_empty() {
            return Err(Error::Conflict(format!("bucket {} is not empty", bucket)));
        }
        state.buckets.remove(bucket);
        state.record(format!("objects.delete_bucket {}", bucket));
        Ok(())
    }
}

#[async_trait]
impl RegistryApi for MemoryCloud {
    async fn describe_repository(&self, name: &str) -> Result<Option<Repository>> {
        Ok(self.lock().repositories.get(name).map(|r| Repository {
            name: name.to_string(),
            uri: r.uri.clone(),
        }))
    }

    async fn create_repository(&self, name: &str) -> Result<Repository> {
        let mut state = self.lock();
        if state.repositories.contains_key(name) {
            return Err(Error::Conflict(format!("repository {} already exists", name)));
        }
        let uri = state.repository_uri(name);
        state.repositories.insert(
            name.to_string(),
            MemRepository {
                uri: uri.clone(),
                images: BTreeMap::new(),
            },
        );
        state.record(format!("registry.create_repository {}", name));
        Ok(Repository {
            name: name.to_string(),
            uri,
        })
    }

    async fn delete_repository(&self, name: &str) -> Result<()> {
        let mut state = self.lock();
        if state.repositories.remove(name).is_none() {
            return Err(Error::NotFound(format!("repository {}", name)));
        }
        state.record(format!("registry.delete_repository {}", name));
        Ok(())
    }

    async fn image_digest(&self, name: &str, tag: &str) -> Result<Option<String>> {
        Ok(self
            .lock()
            .repositories
            .get(name)
            .and_then(|r| r.images.get(tag).cloned()))
    }

    async fn credentials(&self) -> Result<RegistryCredentials> {
        let state = self.lock();
        Ok(RegistryCredentials {
            username: "AWS".to_string(),
            password: "sandbox-token".to_string(),
            endpoint: format!("https://{}.dkr.ecr.{}.amazonaws.com", ACCOUNT_ID, state.region),
        })
    }
}

#[async_trait]
impl FunctionApi for MemoryCloud {
    async fn describe_function(&self, name: &str) -> Result<Option<FunctionState>> {
        Ok(self.lock().functions.get(name).cloned())
    }

    async fn update_function_image(&self, name: &str, image_uri: &str) -> Result<()> {
        let mut state = self.lock();
        let digest = state.digest_for_uri(image_uri);
        let function = state
            .functions
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(format!("function {}", name)))?;
        function.image_uri = image_uri.to_string();
        function.image_digest = digest;
        function.last_update = FunctionUpdate::Successful;
        state.record(format!("functions.update_image {}", name));
        Ok(())
    }
}

#[async_trait]
impl ParameterApi for MemoryCloud {
    async fn get_parameters_by_path(&self, path: &str) -> Result<Vec<Parameter>> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        Ok(self
            .lock()
            .parameters
            .iter()
            .filter(|(name, _)| name.starts_with(&prefix))
            .map(|(name, value)| Parameter {
                name: name.clone(),
                value: value.clone(),
            })
            .collect())
    }

    async fn get_parameter(&self, name: &str) -> Result<Option<String>> {
        Ok(self.lock().parameters.get(name).cloned())
    }

    async fn put_parameter(&self, name: &str, value: &str, secure: bool) -> Result<()> {
        let mut state = self.lock();
        state.parameters.insert(name.to_string(), value.to_string());
        let kind = if secure { "SecureString" } else { "String" };
        state.record(format!("parameters.put {} ({})", name, kind));
        Ok(())
    }

    async fn delete_parameters(&self, names: &[String]) -> Result<()> {
        if names.len() > MAX_PARAMETER_BATCH {
            return Err(Error::Remote(format!(
                "at most {} parameters can be deleted per call, got {}",
                MAX_PARAMETER_BATCH,
                names.len()
            )));
        }
        let mut state = self.lock();
        for name in names {
            state.parameters.remove(name);
        }
        state.record(format!("parameters.delete {}", names.join(",")));
        Ok(())
    }
}

#[async_trait]
impl SecretBlobApi for MemoryCloud {
    async fn get_secret_string(&self, id: &str) -> Result<Option<String>> {
        Ok(self.lock().secret_blobs.get(id).cloned())
    }

    async fn create_secret(&self, id: &str, value: &str) -> Result<()> {
        let mut state = self.lock();
        if state.secret_blobs.contains_key(id) {
            return Err(Error::Conflict(format!("secret {} already exists", id)));
        }
        state.secret_blobs.insert(id.to_string(), value.to_string());
        state.record(format!("secrets.create {}", id));
        Ok(())
    }

    async fn put_secret_value(&self, id: &str, value: &str) -> Result<()> {
        let mut state = self.lock();
        let slot = state
            .secret_blobs
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("secret {}", id)))?;
        *slot = value.to_string();
        state.record(format!("secrets.put {}", id));
        Ok(())
    }

    async fn delete_secret(&self, id: &str) -> Result<()> {
        let mut state = self.lock();
        if state.secret_blobs.remove(id).is_none() {
            return Err(Error::NotFound(format!("secret {}", id)));
        }
        state.record(format!("secrets.delete {}", id));
        Ok(())
    }
}

#[async_trait]
impl IdentityApi for MemoryCloud {
    async fn account_id(&self) -> Result<String> {
        Ok(ACCOUNT_ID.to_string())
    }

    async fn get_role(&self, name: &str) -> Result<Option<String>> {
        Ok(self.lock().roles.get(name).map(|r| r.arn.clone()))
    }

    async fn create_role(
        &self,
        name: &str,
        _trust_policy: &Value,
        permissions_boundary: Option<&str>,
    ) -> Result<String> {
        let mut state = self.lock();
        let arn = format!("arn:aws:iam::{}:role/{}", ACCOUNT_ID, name);
        state.roles.insert(
            name.to_string(),
            MemRole {
                arn: arn.clone(),
                policies: BTreeMap::new(),
                permissions_boundary: permissions_boundary.map(str::to_string),
            },
        );
        state.record(format!("identity.create_role {}", name));
        Ok(arn)
    }

    async fn put_role_policy(&self, role: &str, policy_name: &str, policy: &Value) -> Result<()> {
        let mut state = self.lock();
        state
            .roles
            .get_mut(role)
            .ok_or_else(|| Error::NotFound(format!("role {}", role)))?
            .policies
            .insert(policy_name.to_string(), policy.clone());
        state.record(format!("identity.put_role_policy {}/{}", role, policy_name));
        Ok(())
    }

    async fn delete_role_policy(&self, role: &str, policy_name: &str) -> Result<()> {
        let mut state = self.lock();
        let removed = state
            .roles
            .get_mut(role)
            .and_then(|r| r.policies.remove(policy_name));
        if removed.is_none() {
            return Err(Error::NotFound(format!("policy {}/{}", role, policy_name)));
        }
        state.record(format!("identity.delete_role_policy {}/{}", role, policy_name));
        Ok(())
    }

    async fn delete_role(&self, name: &str) -> Result<()> {
        let mut state = self.lock();
        match state.roles.get(name) {
            None => return Err(Error::NotFound(format!("role {}", name))),
            Some(role) if !role.policies.is_empty() => {
                return Err(Error::Remote(format!(
                    "role {} still has inline policies",
                    name
                )));
            }
            Some(_) => {}
        }
        state.roles.remove(name);
        state.record(format!("identity.delete_role {}", name));
        Ok(())
    }
}

#[async_trait]
impl BuildServiceApi for MemoryCloud {
    async fn project_exists(&self, name: &str) -> Result<bool> {
        Ok(self.lock().build_projects.contains_key(name))
    }

    async fn create_project(&self, spec: &BuildProjectSpec) -> Result<()> {
        let mut state = self.lock();
        if !state.roles.values().any(|r| r.arn == spec.service_role_arn) {
            return Err(Error::Remote(format!(
                "service role {} does not exist",
                spec.service_role_arn
            )));
        }
        state.build_projects.insert(spec.name.clone(), spec.clone());
        state.record(format!("builds.create_project {}", spec.name));
        Ok(())
    }

    async fn delete_project(&self, name: &str) -> Result<()> {
        let mut state = self.lock();
        if state.build_projects.remove(name).is_none() {
            return Err(Error::NotFound(format!("build project {}", name)));
        }
        state.record(format!("builds.delete_project {}", name));
        Ok(())
    }

    async fn start_build(
        &self,
        project: &str,
        source_bucket: &str,
        source_key: &str,
        env: &BTreeMap<String, String>,
    ) -> Result<String> {
        let mut state = self.lock();
        if !state.build_projects.contains_key(project) {
            return Err(Error::Remote(format!("build project {} does not exist", project)));
        }
        if !state.bucket(source_bucket)?.objects.contains_key(source_key) {
            return Err(Error::Remote(format!(
                "build source {}/{} does not exist",
                source_bucket, source_key
            )));
        }
        let id = format!("{}:{}", project, state.next_id());
        state.record(format!("builds.start {}", id));

        let info = if std::mem::take(&mut state.stall_next_build) {
            BuildInfo {
                id: id.clone(),
                status: BuildStatus::InProgress,
                phases: vec![BuildPhase {
                    name: "BUILD".to_string(),
                    status: None,
                    messages: Vec::new(),
                }],
            }
        } else if std::mem::take(&mut state.fail_next_build) {
            BuildInfo {
                id: id.clone(),
                status: BuildStatus::Failed,
                phases: vec![BuildPhase {
                    name: "BUILD".to_string(),
                    status: Some("FAILED".to_string()),
                    messages: vec!["Error while executing command: docker build".to_string()],
                }],
            }
        } else {
            if let Some(tag) = env.get("IMAGE_TAG") {
                state.push_image(tag)?;
            }
            BuildInfo {
                id: id.clone(),
                status: BuildStatus::Succeeded,
                phases: Vec::new(),
            }
        };
        state.builds.insert(id.clone(), info);
        Ok(id)
    }

    async fn get_build(&self, id: &str) -> Result<BuildInfo> {
        self.lock()
            .builds
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("build {}", id)))
    }
}

#[async_trait]
impl DbClusterApi for MemoryCloud {
    async fn describe_cluster(&self, id: &str) -> Result<Option<DbCluster>> {
        Ok(self.lock().db_clusters.get(id).cloned())
    }

    async fn create_cluster(&self, spec: &DbClusterSpec) -> Result<()> {
        let mut state = self.lock();
        if !state.subnet_groups.contains_key(&spec.subnet_group) {
            return Err(Error::Remote(format!(
                "subnet group {} does not exist",
                spec.subnet_group
            )));
        }
        if !state.security_groups.contains_key(&spec.security_group_id) {
            return Err(Error::Remote(format!(
                "security group {} does not exist",
                spec.security_group_id
            )));
        }
        let endpoint = format!("{}.cluster.{}.rds.amazonaws.com", spec.id, state.region);
        state.db_clusters.insert(
            spec.id.clone(),
            DbCluster {
                id: spec.id.clone(),
                status: "available".to_string(),
                min_capacity: spec.min_capacity,
                max_capacity: spec.max_capacity,
                endpoint: Some(endpoint),
                port: 5432,
            },
        );
        state.record(format!("db.create_cluster {}", spec.id));
        Ok(())
    }

    async fn modify_cluster_scaling(&self, id: &str, min: f64, max: f64) -> Result<()> {
        let mut state = self.lock();
        let cluster = state
            .db_clusters
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("cluster {}", id)))?;
        cluster.min_capacity = min;
        cluster.max_capacity = max;
        state.record(format!("db.modify_cluster {}", id));
        Ok(())
    }

    async fn delete_cluster(&self, id: &str, final_snapshot_id: Option<&str>) -> Result<()> {
        let mut state = self.lock();
        if state.db_instances.contains_key(&format!("{}-instance", id)) {
            return Err(Error::Remote(format!("cluster {} still has instances", id)));
        }
        if state.db_clusters.remove(id).is_none() {
            return Err(Error::NotFound(format!("cluster {}", id)));
        }
        if let Some(snapshot) = final_snapshot_id {
            state.db_snapshots.push(snapshot.to_string());
        }
        state.record(format!("db.delete_cluster {}", id));
        Ok(())
    }

    async fn describe_instance(&self, id: &str) -> Result<Option<String>> {
        Ok(self.lock().db_instances.contains_key(id).then(|| "available".to_string()))
    }

    async fn create_instance(&self, cluster_id: &str, instance_id: &str) -> Result<()> {
        let mut state = self.lock();
        if !state.db_clusters.contains_key(cluster_id) {
            return Err(Error::Remote(format!("cluster {} does not exist", cluster_id)));
        }
        state
            .db_instances
            .insert(instance_id.to_string(), cluster_id.to_string());
        state.record(format!("db.create_instance {}", instance_id));
        Ok(())
    }

    async fn delete_instance(&self, id: &str) -> Result<()> {
        let mut state = self.lock();
        if state.db_instances.remove(id).is_none() {
            return Err(Error::NotFound(format!("instance {}", id)));
        }
        state.record(format!("db.delete_instance {}", id));
        Ok(())
    }

    async fn create_subnet_group(&self, name: &str, subnet_ids: &[String]) -> Result<()> {
        let mut state = self.lock();
        state
            .subnet_groups
            .insert(name.to_string(), subnet_ids.to_vec());
        state.record(format!("db.create_subnet_group {}", name));
        Ok(())
    }

    async fn delete_subnet_group(&self, name: &str) -> Result<()> {
        let mut state = self.lock();
        if state.subnet_groups.remove(name).is_none() {
            return Err(Error::NotFound(format!("subnet group {}", name)));
        }
        state.record(format!("db.delete_subnet_group {}", name));
        Ok(())
    }

    async fn find_security_group(&self, name: &str, vpc_id: &str) -> Result<Option<String>> {
        Ok(self
            .lock()
            .security_groups
            .iter()
            .find(|(_, (n, v))| n == name && v == vpc_id)
            .map(|(id, _)| id.clone()))
    }

    async fn create_security_group(&self, name: &str, vpc_id: &str) -> Result<String> {
        let mut state = self.lock();
        let id = format!("sg-{:08x}", state.next_id());
        state
            .security_groups
            .insert(id.clone(), (name.to_string(), vpc_id.to_string()));
        state.record(format!("db.create_security_group {}", name));
        Ok(id)
    }

    async fn delete_security_group(&self, id: &str) -> Result<()> {
        let mut state = self.lock();
        if state.security_groups.remove(id).is_none() {
            return Err(Error::NotFound(format!("security group {}", id)));
        }
        state.record(format!("db.delete_security_group {}", id));
        Ok(())
    }
}

#[async_trait]
impl CdnApi for MemoryCloud {
    async fn create_invalidation(
        &self,
        distribution_id: &str,
        paths: &[String],
    ) -> Result<String> {
        let mut state = self.lock();
        let id = format!("I{}", state.next_id());
        state
            .invalidations
            .push((distribution_id.to_string(), paths.to_vec()));
        state.record(format!("cdn.invalidate {} {}", distribution_id, paths.join(",")));
        Ok(id)
    }
}

#[async_trait]
impl BranchingDbApi for MemoryCloud {
    async fn find_project(&self, name: &str) -> Result<Option<DbProject>> {
        Ok(self
            .lock()
            .db_projects
            .iter()
            .find(|(_, p)| p.name == name)
            .map(|(id, p)| DbProject {
                id: id.clone(),
                name: p.name.clone(),
            }))
    }

    async fn create_project(
        &self,
        name: &str,
        pg_version: u32,
        region: &str,
    ) -> Result<DbProject> {
        let mut state = self.lock();
        let id = format!("proj-{}", state.next_id());
        state.db_projects.insert(
            id.clone(),
            MemDbProject {
                name: name.to_string(),
                region: region.to_string(),
                pg_version,
                branches: BTreeMap::new(),
            },
        );
        state.record(format!("branching.create_project {}", name));
        Ok(DbProject {
            id,
            name: name.to_string(),
        })
    }

    async fn find_branch(&self, project_id: &str, name: &str) -> Result<Option<DbBranch>> {
        Ok(self.lock().db_projects.get(project_id).and_then(|p| {
            p.branches
                .iter()
                .find(|(_, b)| b.name == name)
                .map(|(id, b)| DbBranch {
                    id: id.clone(),
                    name: b.name.clone(),
                })
        }))
    }

    async fn create_branch(&self, project_id: &str, name: &str) -> Result<DbBranch> {
        let mut state = self.lock();
        let branch_id = format!("br-{}", state.next_id());
        let endpoint_id = format!("ep-{}", state.next_id());
        let project = state
            .db_projects
            .get_mut(project_id)
            .ok_or_else(|| Error::NotFound(format!("project {}", project_id)))?;
        let host = format!("{}.{}.neon.tech", endpoint_id, project.region);
        project.branches.insert(
            branch_id.clone(),
            MemBranch {
                name: name.to_string(),
                endpoint: Some(DbEndpoint {
                    id: endpoint_id,
                    branch_id: branch_id.clone(),
                    host,
                }),
                ..Default::default()
            },
        );
        state.record(format!("branching.create_branch {}", name));
        Ok(DbBranch {
            id: branch_id,
            name: name.to_string(),
        })
    }

    async fn delete_branch(&self, project_id: &str, branch_id: &str) -> Result<()> {
        let mut state = self.lock();
        let removed = state
            .db_projects
            .get_mut(project_id)
            .and_then(|p| p.branches.remove(branch_id));
        if removed.is_none() {
            return Err(Error::NotFound(format!("branch {}", branch_id)));
        }
        state.record(format!("branching.delete_branch {}", branch_id));
        Ok(())
    }

    async fn find_endpoint(
        &self,
        project_id: &str,
        branch_id: &str,
    ) -> Result<Option<DbEndpoint>> {
        Ok(self
            .lock()
            .db_projects
            .get(project_id)
            .and_then(|p| p.branches.get(branch_id))
            .and_then(|b| b.endpoint.clone()))
    }

    async fn delete_endpoint(&self, project_id: &str, endpoint_id: &str) -> Result<()> {
        let mut state = self.lock();
        let project = state
            .db_projects
            .get_mut(project_id)
            .ok_or_else(|| Error::NotFound(format!("project {}", project_id)))?;
        let branch = project
            .branches
            .values_mut()
            .find(|b| b.endpoint.as_ref().is_some_and(|e| e.id == endpoint_id))
            .ok_or_else(|| Error::NotFound(format!("endpoint {}", endpoint_id)))?;
        branch.endpoint = None;
        state.record(format!("branching.delete_endpoint {}", endpoint_id));
        Ok(())
    }

    async fn role_exists(&self, project_id: &str, branch_id: &str, role: &str) -> Result<bool> {
        Ok(self
            .lock()
            .db_projects
            .get(project_id)
            .and_then(|p| p.branches.get(branch_id))
            .is_some_and(|b| b.roles.contains_key(role)))
    }

    async fn create_role(&self, project_id: &str, branch_id: &str, role: &str) -> Result<()> {
        let mut state = self.lock();
        let password = format!("npg_{:016x}", state.next_id() * 0x9e37_79b9);
        state
            .branch_mut(project_id, branch_id)?
            .roles
            .insert(role.to_string(), password);
        state.record(format!("branching.create_role {}", role));
        Ok(())
    }

    async fn reveal_password(
        &self,
        project_id: &str,
        branch_id: &str,
        role: &str,
    ) -> Result<String> {
        self.lock()
            .branch_mut(project_id, branch_id)?
            .roles
            .get(role)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("role {}", role)))
    }

    async fn database_exists(&self, project_id: &str, branch_id: &str, name: &str) -> Result<bool> {
        Ok(self
            .lock()
            .db_projects
            .get(project_id)
            .and_then(|p| p.branches.get(branch_id))
            .is_some_and(|b| b.databases.contains_key(name)))
    }

    async fn create_database(
        &self,
        project_id: &str,
        branch_id: &str,
        name: &str,
        owner: &str,
    ) -> Result<()> {
        let mut state = self.lock();
        let branch = state.branch_mut(project_id, branch_id)?;
        if !branch.roles.contains_key(owner) {
            return Err(Error::Remote(format!("role {} does not exist", owner)));
        }
        branch.databases.insert(name.to_string(), owner.to_string());
        state.record(format!("branching.create_database {}", name));
        Ok(())
    }
}

#[async_trait]
impl ServerlessSqlApi for MemoryCloud {
    async fn list_projects(&self) -> Result<Vec<SqlProject>> {
        Ok(self.lock().sql_projects.clone())
    }

    async fn list_clusters(&self, project_id: &str) -> Result<Vec<SqlCluster>> {
        Ok(self
            .lock()
            .sql_clusters
            .values()
            .filter(|c| c.project_id == project_id)
            .map(|c| c.cluster.clone())
            .collect())
    }

    async fn create_cluster(&self, request: &SqlClusterRequest) -> Result<()> {
        let mut state = self.lock();
        if !state.sql_projects.iter().any(|p| p.id == request.project_id) {
            return Err(Error::Remote(format!(
                "project {} does not exist",
                request.project_id
            )));
        }
        let seq = state.next_id();
        let id = format!("{}", 10_000 + seq);
        let region = request
            .region
            .rsplit('/')
            .next()
            .unwrap_or(&request.region)
            .to_string();
        let cluster = SqlCluster {
            id: id.clone(),
            name: request.name.clone(),
            state: "ACTIVE".to_string(),
            host: format!("gateway01.{}.prod.aws.tidbcloud.com", region),
            port: 4000,
            user_prefix: format!("{:x}", 0x2a00_0000 + seq),
        };
        state.sql_clusters.insert(
            id,
            MemSqlCluster {
                project_id: request.project_id.clone(),
                cluster,
                root_password: request.root_password.clone(),
                databases: BTreeSet::new(),
            },
        );
        state.record(format!("sql.create_cluster {}", request.name));
        Ok(())
    }

    async fn delete_cluster(&self, id: &str) -> Result<()> {
        let mut state = self.lock();
        if state.sql_clusters.remove(id).is_none() {
            return Err(Error::NotFound(format!("cluster {}", id)));
        }
        state.record(format!("sql.delete_cluster {}", id));
        Ok(())
    }

    async fn reset_root_password(&self, id: &str, password: &str) -> Result<()> {
        let mut state = self.lock();
        state
            .sql_clusters
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("cluster {}", id)))?
            .root_password = password.to_string();
        state.record(format!("sql.reset_root_password {}", id));
        Ok(())
    }

    async fn create_database(
        &self,
        cluster: &SqlCluster,
        password: &str,
        database: &str,
    ) -> Result<()> {
        let mut state = self.lock();
        let entry = state
            .sql_clusters
            .get_mut(&cluster.id)
            .ok_or_else(|| Error::Remote(format!("cluster {} is unreachable", cluster.id)))?;
        if entry.root_password != password {
            return Err(Error::Remote(format!(
                "access denied for user {}",
                cluster.root_user()
            )));
        }
        entry.databases.insert(database.to_string());
        state.record(format!("sql.create_database {}", database));
        Ok(())
    }
}

/// Builder that "pushes" straight into a [`MemoryCloud`] registry.
#[derive(Debug, Clone)]
pub struct MemoryBuilder {
    cloud: MemoryCloud,
    backend: BuildBackend,
}

impl MemoryBuilder {
    pub fn new(cloud: MemoryCloud, backend: BuildBackend) -> Self {
        Self { cloud, backend }
    }
}

#[async_trait]
impl Builder for MemoryBuilder {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn backend(&self) -> BuildBackend {
        self.backend
    }

    async fn build_and_push(
        &self,
        target: &str,
        dockerfile_path: &str,
        platform: &str,
    ) -> Result<()> {
        debug!(target = %target, dockerfile = %dockerfile_path, platform = %platform, "Sandbox build");
        self.cloud.push_image(target)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEMPLATE: &str = r#"
Resources:
  Api:
    Type: AWS::Lambda::Function
    Properties:
      FunctionName: dev-shop-wsgi
      Code:
        ImageUri: 123456789012.dkr.ecr.us-east-1.amazonaws.com/dev-shop-container:dev
Outputs:
  Domain:
    Value: !GetAtt Url.Domain
  Literal:
    Value: fixed
"#;

    fn request(name: &str) -> StackRequest {
        StackRequest {
            name: name.to_string(),
            template: TEMPLATE.to_string(),
            capabilities: vec![],
        }
    }

    #[tokio::test]
    async fn test_stack_lifecycle_and_outputs() {
        let cloud = MemoryCloud::new();
        cloud.create_repository("dev-shop-container").await.unwrap();
        let target = "123456789012.dkr.ecr.us-east-1.amazonaws.com/dev-shop-container:dev";
        let digest = cloud.push_image(target).unwrap();

        cloud.create_stack(&request("web")).await.unwrap();
        let described = cloud.describe_stack("web").await.unwrap().unwrap();
        assert_eq!(described.status, "CREATE_COMPLETE");
        assert_eq!(described.outputs["Domain"], "web-Domain");
        assert_eq!(described.outputs["Literal"], "fixed");

        let function = cloud.describe_function("dev-shop-wsgi").await.unwrap().unwrap();
        assert_eq!(function.image_digest, Some(digest));

        assert!(cloud.create_stack(&request("web")).await.is_err());
        cloud.delete_stack("web").await.unwrap();
        assert!(cloud.describe_stack("web").await.unwrap().is_none());
        assert!(cloud.describe_function("dev-shop-wsgi").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_tags_survive_update() {
        let cloud = MemoryCloud::new();
        assert!(cloud.set_stack_tags("web", &BTreeMap::new()).await.is_err());

        cloud.create_stack(&request("web")).await.unwrap();
        let tags = BTreeMap::from([("owner".to_string(), "dev-shop".to_string())]);
        cloud.set_stack_tags("web", &tags).await.unwrap();
        cloud.update_stack(&request("web")).await.unwrap();
        let described = cloud.describe_stack("web").await.unwrap().unwrap();
        assert_eq!(described.tags, tags);
    }

    #[tokio::test]
    async fn test_edge_region_is_separate() {
        let cloud = MemoryCloud::new();
        let edge = cloud.edge();
        edge.create_stack(&request("cdn")).await.unwrap();
        assert!(cloud.describe_stack("cdn").await.unwrap().is_none());
        assert!(edge.describe_stack("cdn").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_versioned_bucket_must_be_emptied() {
        let cloud = MemoryCloud::new();
        cloud.create_bucket("b", "us-east-1").await.unwrap();
        cloud.put_object("b", "k", b"v1".to_vec(), None).await.unwrap();
        cloud.delete_object("b", "k").await.unwrap();
        assert!(matches!(
            cloud.delete_bucket("b").await,
            Err(Error::Conflict(_))
        ));

        let versions = cloud.list_object_versions("b").await.unwrap();
        assert_eq!(versions.len(), 2);
        assert!(versions[1].delete_marker);
        cloud.delete_object_versions("b", &versions).await.unwrap();
        cloud.delete_bucket("b").await.unwrap();
        assert!(!cloud.bucket_exists("b").await.unwrap());
    }

    #[tokio::test]
    async fn test_foreign_bucket_is_conflict() {
        let cloud = MemoryCloud::new();
        cloud.add_foreign_bucket("taken");
        assert!(matches!(
            cloud.bucket_exists("taken").await,
            Err(Error::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_parameter_batch_limit() {
        let cloud = MemoryCloud::new();
        let names: Vec<String> = (0..11).map(|i| format!("/p/{}", i)).collect();
        assert!(cloud.delete_parameters(&names).await.is_err());
        assert!(cloud.delete_parameters(&names[..10]).await.is_ok());
    }

    #[tokio::test]
    async fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("sandbox.json");

        let cloud = MemoryCloud::new();
        cloud.put_parameter("/a/b", "c", true).await.unwrap();
        cloud.save(&path).unwrap();

        let loaded = MemoryCloud::load(&path).unwrap();
        assert_eq!(
            loaded.get_parameter("/a/b").await.unwrap().as_deref(),
            Some("c")
        );
        assert_eq!(loaded.calls(), vec!["parameters.put /a/b (SecureString)"]);

        let fresh = MemoryCloud::load(&dir.path().join("missing.json")).unwrap();
        assert!(fresh.calls().is_empty());
    }

    #[tokio::test]
    async fn test_sql_database_requires_current_password() {
        let cloud = MemoryCloud::new();
        ServerlessSqlApi::create_cluster(
            &cloud,
            &SqlClusterRequest {
                project_id: "1000".to_string(),
                name: "dev-shop".to_string(),
                region: "regions/aws-us-east-1".to_string(),
                root_password: "first".to_string(),
            },
        )
        .await
        .unwrap();
        let cluster = cloud.list_clusters("1000").await.unwrap().remove(0);
        assert!(cluster.is_active());
        assert!(
            ServerlessSqlApi::create_database(&cloud, &cluster, "wrong", "app")
                .await
                .is_err()
        );
        cloud.reset_root_password(&cluster.id, "second").await.unwrap();
        ServerlessSqlApi::create_database(&cloud, &cluster, "second", "app")
            .await
            .unwrap();
    }
}
