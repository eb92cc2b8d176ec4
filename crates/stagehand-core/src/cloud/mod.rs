//! Control-plane client traits.
//!
//! The engine never talks to a provider SDK directly. Each provider family is
//! reached through one of these traits; absence is reported as `Ok(None)` or
//! `Ok(false)`, anything else is an error that propagates unchanged.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::Result;

pub use memory::{MemoryBuilder, MemoryCloud};

// ============================================================================
// Stacks
// ============================================================================

/// Live descriptor of a stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackDescription {
    pub name: String,
    /// Raw lifecycle code, e.g. `CREATE_COMPLETE`.
    pub status: String,
    pub status_reason: Option<String>,
    pub deletion_time: Option<DateTime<Utc>>,
    pub outputs: BTreeMap<String, String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackRequest {
    pub name: String,
    pub template: String,
    pub capabilities: Vec<String>,
}

#[async_trait]
pub trait StackApi: Send + Sync {
    async fn describe_stack(&self, name: &str) -> Result<Option<StackDescription>>;

    /// Template body of the last applied version.
    async fn get_template(&self, name: &str) -> Result<Option<String>>;

    async fn create_stack(&self, request: &StackRequest) -> Result<()>;

    async fn update_stack(&self, request: &StackRequest) -> Result<()>;

    async fn delete_stack(&self, name: &str) -> Result<()>;

    /// Replace the tags of an existing stack, keeping its template.
    async fn set_stack_tags(&self, name: &str, tags: &BTreeMap<String, String>) -> Result<()>;
}

// ============================================================================
// Object storage
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicAccessBlock {
    pub block_public_acls: bool,
    pub ignore_public_acls: bool,
    pub block_public_policy: bool,
    pub restrict_public_buckets: bool,
}

impl PublicAccessBlock {
    pub const fn all_blocked() -> Self {
        Self {
            block_public_acls: true,
            ignore_public_acls: true,
            block_public_policy: true,
            restrict_public_buckets: true,
        }
    }

    /// ACLs blocked, bucket policies allowed to grant public reads.
    pub const fn policy_allowed() -> Self {
        Self {
            block_public_acls: true,
            ignore_public_acls: true,
            block_public_policy: false,
            restrict_public_buckets: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectVersion {
    pub key: String,
    pub version_id: Option<String>,
    pub delete_marker: bool,
}

#[async_trait]
pub trait ObjectStoreApi: Send + Sync {
    /// `Ok(false)` when the bucket does not exist; an error when it exists
    /// but belongs to someone else.
    async fn bucket_exists(&self, bucket: &str) -> Result<bool>;

    async fn create_bucket(&self, bucket: &str, region: &str) -> Result<()>;

    async fn get_public_access_block(&self, bucket: &str) -> Result<Option<PublicAccessBlock>>;

    async fn put_public_access_block(&self, bucket: &str, block: PublicAccessBlock)
    -> Result<()>;

    async fn get_bucket_policy(&self, bucket: &str) -> Result<Option<Value>>;

    async fn put_bucket_policy(&self, bucket: &str, policy: &Value) -> Result<()>;

    async fn delete_bucket_policy(&self, bucket: &str) -> Result<()>;

    async fn put_bucket_website_redirect(&self, bucket: &str, host: &str) -> Result<()>;

    async fn delete_bucket_website(&self, bucket: &str) -> Result<()>;

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>>;

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<()>;

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()>;

    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>>;

    /// Every object version and delete marker in the bucket.
    async fn list_object_versions(&self, bucket: &str) -> Result<Vec<ObjectVersion>>;

    async fn delete_object_versions(&self, bucket: &str, versions: &[ObjectVersion])
    -> Result<()>;

    async fn delete_bucket(&self, bucket: &str) -> Result<()>;
}

// ============================================================================
// Container registry and functions
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub name: String,
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryCredentials {
    pub username: String,
    pub password: String,
    pub endpoint: String,
}

#[async_trait]
pub trait RegistryApi: Send + Sync {
    async fn describe_repository(&self, name: &str) -> Result<Option<Repository>>;

    async fn create_repository(&self, name: &str) -> Result<Repository>;

    /// Delete the repository and every image in it.
    async fn delete_repository(&self, name: &str) -> Result<()>;

    /// `sha256:...` digest of the image tagged `tag`.
    async fn image_digest(&self, name: &str, tag: &str) -> Result<Option<String>>;

    async fn credentials(&self) -> Result<RegistryCredentials>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FunctionUpdate {
    Successful,
    InProgress,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionState {
    pub name: String,
    pub image_uri: String,
    pub image_digest: Option<String>,
    pub last_update: FunctionUpdate,
}

#[async_trait]
pub trait FunctionApi: Send + Sync {
    async fn describe_function(&self, name: &str) -> Result<Option<FunctionState>>;

    async fn update_function_image(&self, name: &str, image_uri: &str) -> Result<()>;
}

// ============================================================================
// Secret backends
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub value: String,
}

#[async_trait]
pub trait ParameterApi: Send + Sync {
    /// Every parameter below `path`, recursively.
    async fn get_parameters_by_path(&self, path: &str) -> Result<Vec<Parameter>>;

    async fn get_parameter(&self, name: &str) -> Result<Option<String>>;

    async fn put_parameter(&self, name: &str, value: &str, secure: bool) -> Result<()>;

    /// Delete up to [`MAX_PARAMETER_BATCH`] parameters.
    async fn delete_parameters(&self, names: &[String]) -> Result<()>;
}

pub const MAX_PARAMETER_BATCH: usize = 10;

#[async_trait]
pub trait SecretBlobApi: Send + Sync {
    async fn get_secret_string(&self, id: &str) -> Result<Option<String>>;

    async fn create_secret(&self, id: &str, value: &str) -> Result<()>;

    async fn put_secret_value(&self, id: &str, value: &str) -> Result<()>;

    async fn delete_secret(&self, id: &str) -> Result<()>;
}

// ============================================================================
// Identity
// ============================================================================

#[async_trait]
pub trait IdentityApi: Send + Sync {
    async fn account_id(&self) -> Result<String>;

    /// ARN of the role.
    async fn get_role(&self, name: &str) -> Result<Option<String>>;

    /// Create a role, optionally capped by a permissions boundary policy ARN.
    async fn create_role(
        &self,
        name: &str,
        trust_policy: &Value,
        permissions_boundary: Option<&str>,
    ) -> Result<String>;

    async fn put_role_policy(&self, role: &str, policy_name: &str, policy: &Value)
    -> Result<()>;

    async fn delete_role_policy(&self, role: &str, policy_name: &str) -> Result<()>;

    async fn delete_role(&self, name: &str) -> Result<()>;
}

// ============================================================================
// Remote builds
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildProjectSpec {
    pub name: String,
    pub service_role_arn: String,
    pub image: String,
    pub compute_type: String,
    pub environment_type: String,
    pub privileged: bool,
    pub buildspec: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildStatus {
    InProgress,
    Succeeded,
    Failed,
    Fault,
    Stopped,
    TimedOut,
}

impl BuildStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BuildStatus::InProgress)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildPhase {
    pub name: String,
    pub status: Option<String>,
    pub messages: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildInfo {
    pub id: String,
    pub status: BuildStatus,
    pub phases: Vec<BuildPhase>,
}

#[async_trait]
pub trait BuildServiceApi: Send + Sync {
    async fn project_exists(&self, name: &str) -> Result<bool>;

    async fn create_project(&self, spec: &BuildProjectSpec) -> Result<()>;

    async fn delete_project(&self, name: &str) -> Result<()>;

    /// Start a build from a zipped source at `bucket/key`; returns the build id.
    async fn start_build(
        &self,
        project: &str,
        source_bucket: &str,
        source_key: &str,
        env: &BTreeMap<String, String>,
    ) -> Result<String>;

    async fn get_build(&self, id: &str) -> Result<BuildInfo>;
}

// ============================================================================
// Managed database clusters
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DbCluster {
    pub id: String,
    pub status: String,
    pub min_capacity: f64,
    pub max_capacity: f64,
    pub endpoint: Option<String>,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DbClusterSpec {
    pub id: String,
    pub engine_version: String,
    pub database: String,
    pub master_username: String,
    pub subnet_group: String,
    pub security_group_id: String,
    pub min_capacity: f64,
    pub max_capacity: f64,
}

#[async_trait]
pub trait DbClusterApi: Send + Sync {
    async fn describe_cluster(&self, id: &str) -> Result<Option<DbCluster>>;

    async fn create_cluster(&self, spec: &DbClusterSpec) -> Result<()>;

    async fn modify_cluster_scaling(&self, id: &str, min: f64, max: f64) -> Result<()>;

    async fn delete_cluster(&self, id: &str, final_snapshot_id: Option<&str>) -> Result<()>;

    /// Status of a cluster instance.
    async fn describe_instance(&self, id: &str) -> Result<Option<String>>;

    async fn create_instance(&self, cluster_id: &str, instance_id: &str) -> Result<()>;

    async fn delete_instance(&self, id: &str) -> Result<()>;

    async fn create_subnet_group(&self, name: &str, subnet_ids: &[String]) -> Result<()>;

    /// Deleting a missing subnet group is `Error::NotFound`.
    async fn delete_subnet_group(&self, name: &str) -> Result<()>;

    async fn find_security_group(&self, name: &str, vpc_id: &str) -> Result<Option<String>>;

    async fn create_security_group(&self, name: &str, vpc_id: &str) -> Result<String>;

    async fn delete_security_group(&self, id: &str) -> Result<()>;
}

// ============================================================================
// CDN
// ============================================================================

#[async_trait]
pub trait CdnApi: Send + Sync {
    /// Returns the invalidation id.
    async fn create_invalidation(&self, distribution_id: &str, paths: &[String])
    -> Result<String>;
}

// ============================================================================
// Branching Postgres provider
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbProject {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbBranch {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbEndpoint {
    pub id: String,
    pub branch_id: String,
    pub host: String,
}

#[async_trait]
pub trait BranchingDbApi: Send + Sync {
    async fn find_project(&self, name: &str) -> Result<Option<DbProject>>;

    async fn create_project(&self, name: &str, pg_version: u32, region: &str)
    -> Result<DbProject>;

    async fn find_branch(&self, project_id: &str, name: &str) -> Result<Option<DbBranch>>;

    /// Create a branch together with its read-write endpoint.
    async fn create_branch(&self, project_id: &str, name: &str) -> Result<DbBranch>;

    async fn delete_branch(&self, project_id: &str, branch_id: &str) -> Result<()>;

    /// The read-write endpoint of a branch.
    async fn find_endpoint(&self, project_id: &str, branch_id: &str)
    -> Result<Option<DbEndpoint>>;

    async fn delete_endpoint(&self, project_id: &str, endpoint_id: &str) -> Result<()>;

    async fn role_exists(&self, project_id: &str, branch_id: &str, role: &str) -> Result<bool>;

    async fn create_role(&self, project_id: &str, branch_id: &str, role: &str) -> Result<()>;

    async fn reveal_password(&self, project_id: &str, branch_id: &str, role: &str)
    -> Result<String>;

    async fn database_exists(&self, project_id: &str, branch_id: &str, name: &str)
    -> Result<bool>;

    async fn create_database(
        &self,
        project_id: &str,
        branch_id: &str,
        name: &str,
        owner: &str,
    ) -> Result<()>;
}

// ============================================================================
// Serverless distributed SQL provider
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlProject {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlCluster {
    pub id: String,
    pub name: String,
    pub state: String,
    pub host: String,
    pub port: u16,
    pub user_prefix: String,
}

impl SqlCluster {
    pub fn is_active(&self) -> bool {
        self.state == "ACTIVE"
    }

    pub fn root_user(&self) -> String {
        format!("{}.root", self.user_prefix)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlClusterRequest {
    pub project_id: String,
    pub name: String,
    pub region: String,
    pub root_password: String,
}

#[async_trait]
pub trait ServerlessSqlApi: Send + Sync {
    async fn list_projects(&self) -> Result<Vec<SqlProject>>;

    async fn list_clusters(&self, project_id: &str) -> Result<Vec<SqlCluster>>;

    async fn create_cluster(&self, request: &SqlClusterRequest) -> Result<()>;

    async fn delete_cluster(&self, id: &str) -> Result<()>;

    async fn reset_root_password(&self, id: &str, password: &str) -> Result<()>;

    /// Run `CREATE DATABASE IF NOT EXISTS` as root.
    async fn create_database(&self, cluster: &SqlCluster, password: &str, database: &str)
    -> Result<()>;
}

// ============================================================================
// Bundle
// ============================================================================

/// Every client the engine needs, one per provider family.
#[derive(Clone)]
pub struct CloudClients {
    pub stacks: Arc<dyn StackApi>,
    /// Stacks in the global edge region (CDN and its keys).
    pub edge_stacks: Arc<dyn StackApi>,
    pub objects: Arc<dyn ObjectStoreApi>,
    pub registry: Arc<dyn RegistryApi>,
    pub functions: Arc<dyn FunctionApi>,
    pub parameters: Arc<dyn ParameterApi>,
    pub secret_blobs: Arc<dyn SecretBlobApi>,
    pub identity: Arc<dyn IdentityApi>,
    pub builds: Arc<dyn BuildServiceApi>,
    pub db_clusters: Arc<dyn DbClusterApi>,
    pub cdn: Arc<dyn CdnApi>,
    pub branching_db: Arc<dyn BranchingDbApi>,
    pub serverless_sql: Arc<dyn ServerlessSqlApi>,
}

impl CloudClients {
    /// Wire every client to one in-memory control plane.
    pub fn from_memory(cloud: &MemoryCloud) -> Self {
        let shared = Arc::new(cloud.clone());
        Self {
            stacks: shared.clone(),
            edge_stacks: Arc::new(cloud.edge()),
            objects: shared.clone(),
            registry: shared.clone(),
            functions: shared.clone(),
            parameters: shared.clone(),
            secret_blobs: shared.clone(),
            identity: shared.clone(),
            builds: shared.clone(),
            db_clusters: shared.clone(),
            cdn: shared.clone(),
            branching_db: shared.clone(),
            serverless_sql: shared,
        }
    }
}
