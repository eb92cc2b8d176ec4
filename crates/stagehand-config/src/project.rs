//! Project file parsing.
//!
//! A project file (`stagehand.kdl`) declares the resources of every stage.
//! Parsing selects one stage, applies its `stage` block on top of the
//! top-level nodes and resolves the result into a [`StageConfig`].

use kdl::{KdlDocument, KdlNode, KdlValue};
use serde::Serialize;
use stagehand_core::builder::{BuildBackend, BuildSpec};
use stagehand_core::secret::{
    ManagedSecretKind, ManagedSecretSpec, SecretStoreKind, UserSecretSpec,
};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::variables::VariableContext;
use crate::{ConfigError, ConfigResult};

pub const DEFAULT_FILE_NAME: &str = "stagehand.kdl";
pub const DEFAULT_NAMESPACE: &str = "stagehand";
pub const DEFAULT_PREFIX_TEMPLATE: &str = "{stage}-{project}-{namespace}-";
pub const DEFAULT_EDGE_REGION: &str = "us-east-1";

/// Fully resolved configuration of one stage.
#[derive(Debug, Clone, Serialize)]
pub struct StageConfig {
    pub stage: String,
    pub project: String,
    pub region: String,
    pub edge_region: String,
    pub namespace: String,
    pub prefix_template: String,
    pub stages: Vec<String>,
    /// Directory relative paths are resolved against.
    pub project_dir: PathBuf,
    pub network: Option<NetworkConfig>,
    pub managed_db: Option<ManagedDbConfig>,
    pub branched_db: Option<BranchedDbConfig>,
    pub distributed_sql: Option<DistributedSqlConfig>,
    pub storage: Option<StorageConfig>,
    pub container: Option<ContainerConfig>,
    pub cdns: Vec<CdnConfig>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkConfig {
    /// Shared reference name; the network is shared by every stage using it.
    pub reference: String,
    /// `false` for a network managed outside this project.
    pub manage: bool,
    pub cidr: String,
    pub zones: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagedDbConfig {
    pub network: String,
    pub min_capacity: f64,
    pub max_capacity: f64,
    pub engine_version: String,
    pub database: String,
    pub master_username: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BranchedDbConfig {
    pub pg_version: u32,
    pub provider_region: String,
    pub api_key_env: String,
    pub project_name: String,
    pub branch: String,
    pub role: String,
    pub database: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DistributedSqlConfig {
    pub provider_project: Option<String>,
    pub provider_region: String,
    pub database: String,
    pub public_key_env: String,
    pub private_key_env: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StorageConfig {
    pub public_dirs: Vec<String>,
    pub bucket_name_format: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HandlerConfig {
    pub name: String,
    pub command: String,
    pub timeout: u32,
    pub memory: u32,
    pub reserved_concurrency: Option<u32>,
    pub domain: Option<String>,
    pub certificate_arn: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SecretsConfig {
    pub store: SecretStoreKind,
    pub store_key_format: String,
    pub managed: Vec<ManagedSecretSpec>,
    pub user: Vec<UserSecretSpec>,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            store: SecretStoreKind::Blob,
            store_key_format: "{prefix}{stage}-{project}".to_string(),
            managed: Vec::new(),
            user: Vec::new(),
        }
    }
}

impl SecretsConfig {
    pub fn managed_spec(&self, key: &str) -> Option<&ManagedSecretSpec> {
        self.managed.iter().find(|s| s.key == key)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ContainerConfig {
    pub network: Option<String>,
    pub build: BuildSpec,
    pub repository_name_format: String,
    pub handlers: Vec<HandlerConfig>,
    pub env: BTreeMap<String, String>,
    pub secrets: SecretsConfig,
}

impl ContainerConfig {
    pub fn handler(&self, name: &str) -> Option<&HandlerConfig> {
        self.handlers.iter().find(|h| h.name == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RouteOrigin {
    Container,
    Storage,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteConfig {
    pub path: String,
    pub origin: RouteOrigin,
    pub handler: Option<String>,
    pub upload_from: Option<PathBuf>,
    pub spa: bool,
    pub signed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CdnConfig {
    pub name: String,
    pub domain: Option<String>,
    pub certificate_arn: Option<String>,
    pub signing_key: Option<String>,
    pub routes: Vec<RouteConfig>,
    pub redirect_from: Vec<String>,
    pub bucket_name_format: String,
    pub origin_path_format: String,
    pub fallback_html: String,
}

impl CdnConfig {
    pub fn has_signed_routes(&self) -> bool {
        self.routes.iter().any(|r| r.signed)
    }
}

impl StageConfig {
    /// Interpolation context for this stage, with the prefix resolved.
    pub fn variables(&self) -> ConfigResult<VariableContext> {
        let mut vars = VariableContext::new();
        vars.stage = self.stage.clone();
        vars.project = self.project.clone();
        vars.namespace = self.namespace.clone();
        vars.region = self.region.clone();
        vars.prefix = vars.format_name("prefix-template", &self.prefix_template)?;
        Ok(vars)
    }

    /// Resource name prefix, e.g. `dev-shop-stagehand-`.
    pub fn prefix(&self) -> ConfigResult<String> {
        Ok(self.variables()?.prefix)
    }

    /// `{stage}-{project}`.
    pub fn slug(&self) -> String {
        format!("{}-{}", self.stage, self.project)
    }

    pub fn state_bucket(&self) -> ConfigResult<String> {
        Ok(format!("{}state", self.prefix()?))
    }

    pub fn format_name(&self, field: &str, format: &str) -> ConfigResult<String> {
        self.variables()?.format_name(field, format)
    }

    pub fn network_stack_name(&self, reference: &str) -> String {
        format!("{}-{}-{}-vpc", self.namespace, reference, self.project)
    }

    pub fn cdn(&self, name: &str) -> Option<&CdnConfig> {
        self.cdns.iter().find(|c| c.name == name)
    }

    /// Resolve a path from the project file against the project directory.
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_dir.join(path)
        }
    }
}

/// Load and resolve a project file for one stage.
pub fn load_stage_config(path: &Path, stage: &str) -> ConfigResult<StageConfig> {
    let text = std::fs::read_to_string(path)?;
    let project_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    debug!(path = %path.display(), stage = %stage, "Loading project file");
    parse_stage_config(&text, stage, &project_dir)
}

/// Stages declared in a project file.
pub fn declared_stages(kdl: &str) -> ConfigResult<Vec<String>> {
    let doc: KdlDocument = kdl.parse()?;
    doc.nodes()
        .iter()
        .find(|n| n.name().value() == "stages")
        .map(get_all_string_args)
        .ok_or_else(|| ConfigError::MissingField("stages".to_string()))
}

/// Parse project file text and resolve it for one stage.
pub fn parse_stage_config(kdl: &str, stage: &str, project_dir: &Path) -> ConfigResult<StageConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let stages = doc
        .nodes()
        .iter()
        .find(|n| n.name().value() == "stages")
        .map(get_all_string_args)
        .ok_or_else(|| ConfigError::MissingField("stages".to_string()))?;
    if !stages.iter().any(|s| s == stage) {
        return Err(ConfigError::UnknownStage {
            stage: stage.to_string(),
            declared: stages,
        });
    }

    let nodes = overlay_stage(&doc, stage, &stages)?;

    let mut project = None;
    let mut region = None;
    let mut edge_region = DEFAULT_EDGE_REGION.to_string();
    let mut namespace = DEFAULT_NAMESPACE.to_string();
    let mut prefix_template = DEFAULT_PREFIX_TEMPLATE.to_string();

    for node in &nodes {
        match node.name().value() {
            "project" => project = get_first_string_arg(node),
            "region" => region = get_first_string_arg(node),
            "edge-region" => edge_region = require_arg(node, "edge-region")?,
            "namespace" => namespace = require_arg(node, "namespace")?,
            "prefix-template" => prefix_template = require_arg(node, "prefix-template")?,
            _ => {}
        }
    }

    let project = project.ok_or_else(|| ConfigError::MissingField("project".to_string()))?;
    let region = region.ok_or_else(|| ConfigError::MissingField("region".to_string()))?;

    let mut config = StageConfig {
        stage: stage.to_string(),
        project,
        region,
        edge_region,
        namespace,
        prefix_template,
        stages,
        project_dir: project_dir.to_path_buf(),
        network: None,
        managed_db: None,
        branched_db: None,
        distributed_sql: None,
        storage: None,
        container: None,
        cdns: Vec::new(),
    };
    let vars = config.variables()?;

    for node in &nodes {
        match node.name().value() {
            "network" => {
                if config.network.is_some() {
                    return Err(ConfigError::Duplicate("network".to_string()));
                }
                config.network = Some(parse_network(node)?);
            }
            "managed-db" => config.managed_db = Some(parse_managed_db(node)?),
            "branched-db" => config.branched_db = Some(parse_branched_db(node, &config)?),
            "distributed-sql" => {
                config.distributed_sql = Some(parse_distributed_sql(node, &config)?)
            }
            "storage" => config.storage = Some(parse_storage(node)),
            "container" => config.container = Some(parse_container(node, &vars)?),
            "cdn" => {
                let cdn = parse_cdn(node)?;
                if config.cdn(&cdn.name).is_some() {
                    return Err(ConfigError::Duplicate(format!("cdn {}", cdn.name)));
                }
                config.cdns.push(cdn);
            }
            _ => {} // Ignore unknown nodes
        }
    }

    validate_references(&mut config)?;
    Ok(config)
}

/// Top-level nodes with the selected stage block applied.
///
/// A child of `stage "<name>"` replaces the top-level node with the same
/// name and first argument, or is appended when there is none.
fn overlay_stage(doc: &KdlDocument, stage: &str, stages: &[String]) -> ConfigResult<Vec<KdlNode>> {
    let mut nodes: Vec<KdlNode> = Vec::new();
    let mut seen = BTreeSet::new();
    let mut overlays = Vec::new();

    for node in doc.nodes() {
        if node.name().value() == "stage" {
            let name = get_first_string_arg(node)
                .ok_or_else(|| ConfigError::MissingField("stage name".to_string()))?;
            if !stages.contains(&name) {
                return Err(ConfigError::InvalidReference(format!(
                    "stage block {} is not listed in stages",
                    name
                )));
            }
            if name == stage {
                overlays.push(node);
            }
            continue;
        }
        let key = node_key(node);
        if !seen.insert(key.clone()) {
            return Err(ConfigError::Duplicate(describe_key(&key)));
        }
        nodes.push(node.clone());
    }

    for overlay in overlays {
        let Some(children) = overlay.children() else {
            continue;
        };
        for child in children.nodes() {
            let key = node_key(child);
            match nodes.iter().position(|n| node_key(n) == key) {
                Some(index) => nodes[index] = child.clone(),
                None => nodes.push(child.clone()),
            }
        }
    }

    Ok(nodes)
}

fn node_key(node: &KdlNode) -> (String, Option<String>) {
    (node.name().value().to_string(), get_first_string_arg(node))
}

fn describe_key(key: &(String, Option<String>)) -> String {
    match &key.1 {
        Some(arg) => format!("{} {:?}", key.0, arg),
        None => key.0.clone(),
    }
}

fn parse_network(node: &KdlNode) -> ConfigResult<NetworkConfig> {
    let reference = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("network name".to_string()))?;
    let manage = get_bool_prop(node, "manage").unwrap_or(true);
    let mut cidr = "10.0.0.0/16".to_string();
    let mut zones = Vec::new();

    for child in child_nodes(node) {
        match child.name().value() {
            "cidr" => cidr = require_arg(child, "network cidr")?,
            "zones" => zones = get_all_string_args(child),
            _ => {}
        }
    }

    if manage && zones.is_empty() {
        zones = vec!["a".to_string(), "c".to_string()];
    }

    Ok(NetworkConfig {
        reference,
        manage,
        cidr,
        zones,
    })
}

fn parse_managed_db(node: &KdlNode) -> ConfigResult<ManagedDbConfig> {
    let network = get_string_prop(node, "network").unwrap_or_default();
    let mut config = ManagedDbConfig {
        network,
        min_capacity: 0.5,
        max_capacity: 2.0,
        engine_version: "16.4".to_string(),
        database: "app".to_string(),
        master_username: "postgres".to_string(),
    };

    for child in child_nodes(node) {
        match child.name().value() {
            "min-capacity" => config.min_capacity = require_number(child, "min-capacity")?,
            "max-capacity" => config.max_capacity = require_number(child, "max-capacity")?,
            "engine-version" => config.engine_version = require_arg(child, "engine-version")?,
            "database" => config.database = require_arg(child, "database")?,
            "master-username" => config.master_username = require_arg(child, "master-username")?,
            _ => {}
        }
    }

    if config.min_capacity > config.max_capacity {
        return Err(ConfigError::invalid(
            "managed-db capacity",
            format!(
                "min-capacity {} exceeds max-capacity {}",
                config.min_capacity, config.max_capacity
            ),
        ));
    }
    Ok(config)
}

fn parse_branched_db(node: &KdlNode, stage: &StageConfig) -> ConfigResult<BranchedDbConfig> {
    let mut config = BranchedDbConfig {
        pg_version: 15,
        provider_region: "aws-us-east-2".to_string(),
        api_key_env: "NEON_API_KEY".to_string(),
        project_name: stage.project.clone(),
        branch: stage.stage.clone(),
        role: format!("{}_{}", stage.project, stage.stage).replace('-', "_"),
        database: stage.project.replace('-', "_"),
    };

    for child in child_nodes(node) {
        match child.name().value() {
            "pg-version" => {
                config.pg_version = require_integer(child, "pg-version")?;
            }
            "provider-region" => config.provider_region = require_arg(child, "provider-region")?,
            "api-key-env" => config.api_key_env = require_arg(child, "api-key-env")?,
            "project-name" => config.project_name = require_arg(child, "project-name")?,
            "branch" => config.branch = require_arg(child, "branch")?,
            "role" => config.role = require_arg(child, "role")?,
            "database" => config.database = require_arg(child, "database")?,
            _ => {}
        }
    }
    Ok(config)
}

fn parse_distributed_sql(
    node: &KdlNode,
    stage: &StageConfig,
) -> ConfigResult<DistributedSqlConfig> {
    let mut config = DistributedSqlConfig {
        provider_project: None,
        provider_region: "regions/aws-us-east-1".to_string(),
        database: stage.project.replace('-', "_"),
        public_key_env: "TIDB_PUBLIC_KEY".to_string(),
        private_key_env: "TIDB_PRIVATE_KEY".to_string(),
    };

    for child in child_nodes(node) {
        match child.name().value() {
            "provider-project" => {
                config.provider_project = Some(require_arg(child, "provider-project")?)
            }
            "provider-region" => config.provider_region = require_arg(child, "provider-region")?,
            "database" => config.database = require_arg(child, "database")?,
            "public-key-env" => config.public_key_env = require_arg(child, "public-key-env")?,
            "private-key-env" => config.private_key_env = require_arg(child, "private-key-env")?,
            _ => {}
        }
    }
    Ok(config)
}

fn parse_storage(node: &KdlNode) -> StorageConfig {
    let mut config = StorageConfig {
        public_dirs: Vec::new(),
        bucket_name_format: "{prefix}{stage}-{project}".to_string(),
    };
    for child in child_nodes(node) {
        match child.name().value() {
            "public-dirs" => config.public_dirs = get_all_string_args(child),
            "bucket-name-format" => {
                if let Some(format) = get_first_string_arg(child) {
                    config.bucket_name_format = format;
                }
            }
            _ => {}
        }
    }
    config
}

fn parse_container(node: &KdlNode, vars: &VariableContext) -> ConfigResult<ContainerConfig> {
    let mut build = BuildSpec::new(BuildBackend::Local);
    let mut repository_name_format = "{prefix}{project}-container".to_string();
    let mut handlers: Vec<HandlerConfig> = Vec::new();
    let mut env = BTreeMap::new();
    let mut secrets = SecretsConfig::default();

    for child in child_nodes(node) {
        match child.name().value() {
            "dockerfile" => build.dockerfile_path = require_arg(child, "dockerfile")?,
            "platform" => build.platform = require_arg(child, "platform")?,
            "context" => build.context_dir = PathBuf::from(require_arg(child, "context")?),
            "repository-name-format" => {
                repository_name_format = require_arg(child, "repository-name-format")?
            }
            "builder" => {
                let backend = require_arg(child, "builder")?;
                build.backend = backend
                    .parse()
                    .map_err(|_| ConfigError::invalid("builder", format!("unknown builder {}", backend)))?;
                build.options = props_as_strings(child);
            }
            "handler" => {
                let handler = parse_handler(child)?;
                if handlers.iter().any(|h| h.name == handler.name) {
                    return Err(ConfigError::Duplicate(format!("handler {}", handler.name)));
                }
                handlers.push(handler);
            }
            "env" => {
                for entry in child_nodes(child) {
                    let key = entry.name().value().to_string();
                    if let Some(value) = get_first_string_arg(entry) {
                        env.insert(key, vars.interpolate(&value));
                    }
                }
            }
            "secrets" => secrets = parse_secrets(child)?,
            _ => {}
        }
    }

    if handlers.is_empty() {
        return Err(ConfigError::MissingField("container handler".to_string()));
    }

    Ok(ContainerConfig {
        network: get_string_prop(node, "network"),
        build,
        repository_name_format,
        handlers,
        env,
        secrets,
    })
}

fn parse_handler(node: &KdlNode) -> ConfigResult<HandlerConfig> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("handler name".to_string()))?;
    let command = get_string_prop(node, "command")
        .ok_or_else(|| ConfigError::MissingField(format!("command of handler {}", name)))?;
    let handler = HandlerConfig {
        timeout: get_integer_prop(node, "timeout", &name)?.unwrap_or(30),
        memory: get_integer_prop(node, "memory", &name)?.unwrap_or(512),
        reserved_concurrency: get_integer_prop(node, "reserved-concurrency", &name)?,
        domain: get_string_prop(node, "domain"),
        certificate_arn: get_string_prop(node, "certificate-arn"),
        name,
        command,
    };
    if handler.domain.is_some() && handler.certificate_arn.is_none() {
        return Err(ConfigError::MissingField(format!(
            "certificate-arn of handler {} (required with domain)",
            handler.name
        )));
    }
    Ok(handler)
}

fn parse_secrets(node: &KdlNode) -> ConfigResult<SecretsConfig> {
    let mut config = SecretsConfig::default();
    if let Some(store) = get_string_prop(node, "store") {
        config.store = parse_store(&store)?;
    }
    if let Some(format) = get_string_prop(node, "key-format") {
        config.store_key_format = format;
    }

    let mut keys = BTreeSet::new();
    for child in child_nodes(node) {
        let key = get_first_string_arg(child);
        match child.name().value() {
            "managed" => {
                let key = key.ok_or_else(|| ConfigError::MissingField("managed secret name".to_string()))?;
                let kind_name = get_string_prop(child, "type")
                    .ok_or_else(|| ConfigError::MissingField(format!("type of secret {}", key)))?;
                let kind: ManagedSecretKind = kind_name.parse().map_err(|_| {
                    ConfigError::invalid(
                        format!("type of secret {}", key),
                        format!("unknown secret type {}", kind_name),
                    )
                })?;
                let mut spec = ManagedSecretSpec::new(key.clone(), kind);
                spec.options = props_as_strings(child);
                spec.options.remove("type");
                if !keys.insert(key.clone()) {
                    return Err(ConfigError::Duplicate(format!("secret {}", key)));
                }
                config.managed.push(spec);
            }
            "user" => {
                let key = key.ok_or_else(|| ConfigError::MissingField("user secret name".to_string()))?;
                let reference = get_string_prop(child, "ref")
                    .ok_or_else(|| ConfigError::MissingField(format!("ref of secret {}", key)))?;
                let store = get_string_prop(child, "store")
                    .map(|s| parse_store(&s))
                    .transpose()?;
                if !keys.insert(key.clone()) {
                    return Err(ConfigError::Duplicate(format!("secret {}", key)));
                }
                config.user.push(UserSecretSpec {
                    key,
                    reference,
                    store,
                });
            }
            _ => {}
        }
    }
    Ok(config)
}

fn parse_store(name: &str) -> ConfigResult<SecretStoreKind> {
    name.parse()
        .map_err(|_| ConfigError::invalid("secrets store", format!("unknown store {}", name)))
}

fn parse_cdn(node: &KdlNode) -> ConfigResult<CdnConfig> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("cdn name".to_string()))?;
    let mut cdn = CdnConfig {
        name,
        domain: None,
        certificate_arn: None,
        signing_key: None,
        routes: Vec::new(),
        redirect_from: Vec::new(),
        bucket_name_format: "{prefix}{stage}-{project}-spa".to_string(),
        origin_path_format: "/{stage}".to_string(),
        fallback_html: "index.html".to_string(),
    };

    for child in child_nodes(node) {
        match child.name().value() {
            "domain" => cdn.domain = Some(require_arg(child, "cdn domain")?),
            "certificate-arn" => cdn.certificate_arn = Some(require_arg(child, "certificate-arn")?),
            "signing-key" => cdn.signing_key = Some(require_arg(child, "signing-key")?),
            "redirect-from" => cdn.redirect_from.extend(get_all_string_args(child)),
            "bucket-name-format" => cdn.bucket_name_format = require_arg(child, "bucket-name-format")?,
            "origin-path-format" => cdn.origin_path_format = require_arg(child, "origin-path-format")?,
            "fallback-html" => cdn.fallback_html = require_arg(child, "fallback-html")?,
            "route" => {
                let route = parse_route(child)?;
                if cdn.routes.iter().any(|r| r.path == route.path) {
                    return Err(ConfigError::Duplicate(format!(
                        "route {} of cdn {}",
                        route.path, cdn.name
                    )));
                }
                cdn.routes.push(route);
            }
            _ => {}
        }
    }

    let field = format!("cdn {}", cdn.name);
    if cdn.routes.is_empty() {
        return Err(ConfigError::MissingField(format!("route of {}", field)));
    }
    if cdn.domain.is_some() && cdn.certificate_arn.is_none() {
        return Err(ConfigError::MissingField(format!(
            "certificate-arn of {} (required with domain)",
            field
        )));
    }
    if !cdn.redirect_from.is_empty() && cdn.domain.is_none() {
        return Err(ConfigError::invalid(field, "redirect-from requires a domain"));
    }
    if !cdn.origin_path_format.is_empty() {
        if !cdn.origin_path_format.starts_with('/') {
            return Err(ConfigError::invalid(field, "origin-path-format must start with /"));
        }
        if cdn.origin_path_format.ends_with('/') {
            return Err(ConfigError::invalid(field, "origin-path-format must not end with /"));
        }
    }
    let combined = format!("{}{}", cdn.bucket_name_format, cdn.origin_path_format);
    let placeholders = VariableContext::placeholders(&combined);
    for required in ["stage", "project"] {
        if !placeholders.iter().any(|p| p == required) {
            return Err(ConfigError::invalid(
                field,
                format!(
                    "{{{}}} must appear in bucket-name-format or origin-path-format",
                    required
                ),
            ));
        }
    }
    Ok(cdn)
}

fn parse_route(node: &KdlNode) -> ConfigResult<RouteConfig> {
    let path = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("route path".to_string()))?;
    let origin = match get_string_prop(node, "origin").as_deref() {
        Some("container") => RouteOrigin::Container,
        Some("storage") | None => RouteOrigin::Storage,
        Some(other) => {
            return Err(ConfigError::invalid(
                format!("origin of route {}", path),
                format!("unknown origin {}", other),
            ));
        }
    };
    Ok(RouteConfig {
        handler: get_string_prop(node, "handler"),
        upload_from: get_string_prop(node, "upload-from").map(PathBuf::from),
        spa: get_bool_prop(node, "spa").unwrap_or(false),
        signed: get_bool_prop(node, "signed").unwrap_or(false),
        origin,
        path,
    })
}

/// Cross-node checks, run once every node is parsed.
fn validate_references(config: &mut StageConfig) -> ConfigResult<()> {
    let network_ref = config.network.as_ref().map(|n| n.reference.clone());
    let known_network = |name: &str| network_ref.as_deref() == Some(name);

    if let Some(db) = config.managed_db.as_mut() {
        if db.network.is_empty() {
            db.network = network_ref
                .clone()
                .ok_or_else(|| ConfigError::MissingField("network for managed-db".to_string()))?;
        } else if !known_network(&db.network) {
            return Err(ConfigError::InvalidReference(format!(
                "managed-db uses unknown network {}",
                db.network
            )));
        }
    }

    if let Some(container) = &config.container {
        if let Some(network) = &container.network {
            if !known_network(network) {
                return Err(ConfigError::InvalidReference(format!(
                    "container uses unknown network {}",
                    network
                )));
            }
        }
        for spec in &container.secrets.managed {
            if spec.kind != ManagedSecretKind::DerivedDatabaseUrl {
                continue;
            }
            let declared = match spec.option("source").unwrap_or("branched-db") {
                "branched-db" => config.branched_db.is_some(),
                "distributed-sql" => config.distributed_sql.is_some(),
                other => {
                    return Err(ConfigError::invalid(
                        format!("source of secret {}", spec.key),
                        format!("unknown database source {}", other),
                    ));
                }
            };
            if !declared {
                return Err(ConfigError::InvalidReference(format!(
                    "secret {} derives from a database that is not declared",
                    spec.key
                )));
            }
        }
    }

    for cdn in &config.cdns {
        if let Some(key) = &cdn.signing_key {
            let is_keypair = config
                .container
                .as_ref()
                .and_then(|c| c.secrets.managed_spec(key))
                .is_some_and(|s| s.kind == ManagedSecretKind::RsaKeypair);
            if !is_keypair {
                return Err(ConfigError::InvalidReference(format!(
                    "signing-key {} of cdn {} is not a managed rsa-keypair secret",
                    key, cdn.name
                )));
            }
        } else if cdn.has_signed_routes() {
            return Err(ConfigError::MissingField(format!(
                "signing-key of cdn {} (required by signed routes)",
                cdn.name
            )));
        }

        for route in &cdn.routes {
            if route.origin != RouteOrigin::Container {
                continue;
            }
            let container = config.container.as_ref().ok_or_else(|| {
                ConfigError::InvalidReference(format!(
                    "route {} of cdn {} targets the container, which is not declared",
                    route.path, cdn.name
                ))
            })?;
            let handler = route.handler.as_deref().ok_or_else(|| {
                ConfigError::MissingField(format!("handler of route {}", route.path))
            })?;
            if container.handler(handler).is_none() {
                return Err(ConfigError::InvalidReference(format!(
                    "route {} of cdn {} targets unknown handler {}",
                    route.path, cdn.name, handler
                )));
            }
        }
    }

    Ok(())
}

// Helper functions for extracting values from KDL nodes

fn child_nodes(node: &KdlNode) -> &[KdlNode] {
    node.children().map(|c| c.nodes()).unwrap_or(&[])
}

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_bool_prop(node: &KdlNode, name: &str) -> Option<bool> {
    node.get(name).and_then(|v| v.as_bool())
}

fn get_integer_prop(node: &KdlNode, name: &str, owner: &str) -> ConfigResult<Option<u32>> {
    match node.get(name) {
        None => Ok(None),
        Some(value) => value
            .as_integer()
            .and_then(|i| u32::try_from(i).ok())
            .map(Some)
            .ok_or_else(|| {
                ConfigError::invalid(
                    format!("{} of {}", name, owner),
                    format!("expected a positive integer, got {}", value),
                )
            }),
    }
}

fn require_arg(node: &KdlNode, field: &str) -> ConfigResult<String> {
    get_first_string_arg(node).ok_or_else(|| ConfigError::MissingField(field.to_string()))
}

fn first_arg_value(node: &KdlNode) -> Option<&KdlValue> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .map(|e| e.value())
}

fn require_number(node: &KdlNode, field: &str) -> ConfigResult<f64> {
    let value = first_arg_value(node).ok_or_else(|| ConfigError::MissingField(field.to_string()))?;
    value
        .as_float()
        .or_else(|| value.as_integer().map(|i| i as f64))
        .ok_or_else(|| ConfigError::invalid(field, format!("expected a number, got {}", value)))
}

fn require_integer(node: &KdlNode, field: &str) -> ConfigResult<u32> {
    let value = first_arg_value(node).ok_or_else(|| ConfigError::MissingField(field.to_string()))?;
    value
        .as_integer()
        .and_then(|i| u32::try_from(i).ok())
        .ok_or_else(|| ConfigError::invalid(field, format!("expected an integer, got {}", value)))
}

/// Every property of a node as strings; numbers and booleans are stringified.
fn props_as_strings(node: &KdlNode) -> BTreeMap<String, String> {
    node.entries()
        .iter()
        .filter_map(|e| {
            let name = e.name()?.value().to_string();
            let value = match e.value() {
                KdlValue::String(s) => s.clone(),
                other => other.to_string(),
            };
            Some((name, value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROJECT: &str = r#"
        project "shop"
        region "ap-northeast-1"
        stages "dev" "prod"

        network "main" {
            zones "a" "c"
        }
        storage {
            public-dirs "static"
        }
        branched-db {
            pg-version 16
        }
        container network="main" {
            dockerfile "Dockerfile"
            builder "local"
            handler "wsgi" command="app.wsgi" timeout=30 memory=1024
            env {
                APP_STAGE "${stage}"
            }
            secrets store="blob" {
                managed "SECRET_KEY" type="password" length=50
                managed "DATABASE_URL" type="derived-database-url"
                managed "SIGNING_KEY" type="rsa-keypair"
                user "STRIPE_KEY" ref="stripe/key" store="parameter"
            }
        }
        cdn "web" {
            domain "www.example.com"
            certificate-arn "arn:aws:acm:us-east-1:123:certificate/abc"
            signing-key "SIGNING_KEY"
            route "/api/*" origin="container" handler="wsgi"
            route "/*" origin="storage" upload-from="frontend/dist" spa=#true signed=#true
        }
        stage "prod" {
            container network="main" {
                builder "managed-remote"
                handler "wsgi" command="app.wsgi" memory=2048
                secrets {
                    managed "SIGNING_KEY" type="rsa-keypair"
                }
            }
        }
    "#;

    fn parse(stage: &str) -> ConfigResult<StageConfig> {
        parse_stage_config(PROJECT, stage, Path::new("/srv/shop"))
    }

    #[test]
    fn test_parse_dev_stage() {
        let config = parse("dev").unwrap();
        assert_eq!(config.project, "shop");
        assert_eq!(config.edge_region, "us-east-1");
        assert_eq!(config.slug(), "dev-shop");
        assert_eq!(config.prefix().unwrap(), "dev-shop-stagehand-");
        assert_eq!(config.state_bucket().unwrap(), "dev-shop-stagehand-state");
        assert_eq!(config.network_stack_name("main"), "stagehand-main-shop-vpc");

        let container = config.container.as_ref().unwrap();
        assert_eq!(container.build.backend, BuildBackend::Local);
        assert_eq!(container.handlers[0].memory, 1024);
        assert_eq!(container.env["APP_STAGE"], "dev");
        assert_eq!(container.secrets.managed.len(), 3);
        assert_eq!(
            container.secrets.managed[0].option("length"),
            Some("50")
        );
        assert_eq!(
            container.secrets.user[0].store,
            Some(SecretStoreKind::Parameter)
        );

        let db = config.branched_db.as_ref().unwrap();
        assert_eq!(db.pg_version, 16);
        assert_eq!(db.role, "shop_dev");
        assert_eq!(config.cdns[0].routes.len(), 2);
    }

    #[test]
    fn test_stage_block_replaces_node() {
        let config = parse("prod").unwrap();
        let container = config.container.as_ref().unwrap();
        assert_eq!(container.build.backend, BuildBackend::ManagedRemote);
        assert_eq!(container.handlers[0].memory, 2048);
        // Replaced wholesale, so the dev-only secrets are gone.
        assert_eq!(container.secrets.managed.len(), 1);
        assert!(container.env.is_empty());
    }

    #[test]
    fn test_unknown_stage() {
        assert!(matches!(
            parse("qa").unwrap_err(),
            ConfigError::UnknownStage { .. }
        ));
    }

    #[test]
    fn test_missing_project() {
        let err = parse_stage_config(
            r#"region "x"
               stages "dev""#,
            "dev",
            Path::new("."),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(f) if f == "project"));
    }

    #[test]
    fn test_unknown_network_reference() {
        let kdl = r#"
            project "shop"
            region "us-east-1"
            stages "dev"
            container network="other" {
                handler "wsgi" command="app.wsgi"
            }
        "#;
        let err = parse_stage_config(kdl, "dev", Path::new(".")).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidReference(_)));
    }

    #[test]
    fn test_signing_key_must_be_keypair() {
        let kdl = r#"
            project "shop"
            region "us-east-1"
            stages "dev"
            container {
                handler "wsgi" command="app.wsgi"
                secrets {
                    managed "SECRET_KEY" type="password"
                }
            }
            cdn "web" {
                signing-key "SECRET_KEY"
                route "/*" signed=#true
            }
        "#;
        let err = parse_stage_config(kdl, "dev", Path::new(".")).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidReference(_)));
    }

    #[test]
    fn test_route_to_unknown_handler() {
        let kdl = r#"
            project "shop"
            region "us-east-1"
            stages "dev"
            container {
                handler "wsgi" command="app.wsgi"
            }
            cdn "web" {
                route "/api/*" origin="container" handler="worker"
            }
        "#;
        let err = parse_stage_config(kdl, "dev", Path::new(".")).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidReference(_)));
    }

    #[test]
    fn test_derived_url_needs_database() {
        let kdl = r#"
            project "shop"
            region "us-east-1"
            stages "dev"
            container {
                handler "wsgi" command="app.wsgi"
                secrets {
                    managed "DATABASE_URL" type="derived-database-url" source="distributed-sql"
                }
            }
        "#;
        let err = parse_stage_config(kdl, "dev", Path::new(".")).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidReference(_)));
    }

    #[test]
    fn test_duplicate_top_level_node() {
        let kdl = r#"
            project "shop"
            region "us-east-1"
            stages "dev"
            cdn "web" { route "/*" }
            cdn "web" { route "/*" }
        "#;
        let err = parse_stage_config(kdl, "dev", Path::new(".")).unwrap_err();
        assert!(matches!(err, ConfigError::Duplicate(_)));
    }

    #[test]
    fn test_origin_path_validation() {
        let kdl = r#"
            project "shop"
            region "us-east-1"
            stages "dev"
            cdn "web" {
                origin-path-format "/static/"
                route "/*"
            }
        "#;
        let err = parse_stage_config(kdl, "dev", Path::new(".")).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_external_network_has_no_zones() {
        let kdl = r#"
            project "shop"
            region "us-east-1"
            stages "dev"
            network "shared" manage=#false
        "#;
        let config = parse_stage_config(kdl, "dev", Path::new(".")).unwrap();
        let network = config.network.unwrap();
        assert!(!network.manage);
        assert!(network.zones.is_empty());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_FILE_NAME);
        std::fs::write(&path, PROJECT).unwrap();

        let config = load_stage_config(&path, "dev").unwrap();
        assert_eq!(config.project_dir, dir.path());
        assert_eq!(
            config.resolve_path(Path::new("frontend/dist")),
            dir.path().join("frontend/dist")
        );
        assert_eq!(declared_stages(PROJECT).unwrap(), vec!["dev", "prod"]);
    }
}
