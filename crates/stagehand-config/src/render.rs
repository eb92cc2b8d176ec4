//! Infrastructure templates.
//!
//! Each stack has one askama template under `templates/` and one view struct.
//! Rendering turns a resolved [`StageConfig`] (plus values only known at
//! reconcile time) into template text and the export names it declares.

use askama::Template;
use std::collections::BTreeMap;

use crate::project::{CdnConfig, NetworkConfig, RouteConfig, RouteOrigin, StageConfig};
use crate::{ConfigError, ConfigResult};
use stagehand_core::secret::SecretStoreKind;

const CACHING_OPTIMIZED: &str = "658327ea-f89d-4fab-a63d-7e88639e58f6";
const CACHING_DISABLED: &str = "4135ea2d-6df8-44a3-9df3-4b5a84be39ad";
const ALL_VIEWER_EXCEPT_HOST: &str = "b689b0a8-53d0-40ab-baf2-68738e2966ac";

/// Rendered template body plus its exports (output key -> export name).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedTemplate {
    pub body: String,
    pub exports: BTreeMap<String, String>,
}

/// Drop lines that only exist for editor tooling.
pub fn strip_template_comments(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed == "#" || trimmed == "# prettier-ignore" {
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}

fn finish(body: String, exports: BTreeMap<String, String>) -> RenderedTemplate {
    RenderedTemplate {
        body: strip_template_comments(&body),
        exports,
    }
}

/// Double-quoted YAML scalar.
fn yaml_quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// CamelCase logical id from a handler or zone name.
pub fn logical_id(name: &str) -> String {
    name.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect()
}

// ============================================================================
// Network
// ============================================================================

struct ZoneView {
    suffix: String,
    availability_zone: String,
    public_cidr: String,
    private_cidr: String,
}

#[derive(Template)]
#[template(path = "network.yaml", escape = "none")]
struct NetworkTemplate {
    reference: String,
    project: String,
    region: String,
    stack_name: String,
    cidr: String,
    zones: Vec<ZoneView>,
}

/// First two octets of a `/16` block.
fn cidr_base(cidr: &str) -> ConfigResult<(u8, u8)> {
    let invalid = || ConfigError::invalid("network cidr", format!("{} is not an IPv4 /16 block", cidr));
    let (address, bits) = cidr.split_once('/').ok_or_else(invalid)?;
    if bits != "16" {
        return Err(invalid());
    }
    let octets: Vec<u8> = address
        .split('.')
        .map(|o| o.parse::<u8>())
        .collect::<Result<_, _>>()
        .map_err(|_| invalid())?;
    match octets.as_slice() {
        [a, b, 0, 0] => Ok((*a, *b)),
        _ => Err(invalid()),
    }
}

pub fn network_export_names(stack_name: &str) -> BTreeMap<String, String> {
    [
        ("VpcId", "vpc-id"),
        ("PublicSubnetIds", "public-subnet-ids"),
        ("PrivateSubnetIds", "private-subnet-ids"),
        ("DefaultSecurityGroup", "default-security-group"),
    ]
    .into_iter()
    .map(|(key, suffix)| (key.to_string(), format!("{}-{}", stack_name, suffix)))
    .collect()
}

pub fn render_network(config: &StageConfig, network: &NetworkConfig) -> ConfigResult<RenderedTemplate> {
    let stack_name = config.network_stack_name(&network.reference);
    let (a, b) = cidr_base(&network.cidr)?;
    if network.zones.len() > 64 {
        return Err(ConfigError::invalid("network zones", "at most 64 zones are supported"));
    }

    let zones = network
        .zones
        .iter()
        .enumerate()
        .map(|(i, zone)| ZoneView {
            suffix: logical_id(zone),
            availability_zone: format!("{}{}", config.region, zone),
            public_cidr: format!("{}.{}.{}.0/24", a, b, i * 2),
            private_cidr: format!("{}.{}.{}.0/24", a, b, i * 2 + 1),
        })
        .collect();

    let view = NetworkTemplate {
        reference: network.reference.clone(),
        project: config.project.clone(),
        region: config.region.clone(),
        cidr: network.cidr.clone(),
        zones,
        stack_name: stack_name.clone(),
    };
    Ok(finish(view.render()?, network_export_names(&stack_name)))
}

// ============================================================================
// Container
// ============================================================================

struct HandlerView {
    logical_id: String,
    function_name: String,
    command: String,
    timeout: u32,
    memory: u32,
    has_reserved_concurrency: bool,
    reserved_concurrency: u32,
    has_domain: bool,
    domain: String,
    certificate_arn: String,
    export_name: String,
}

struct EnvView {
    key: String,
    value: String,
}

struct StatementView {
    action: String,
    resource: String,
}

#[derive(Template)]
#[template(path = "container.yaml", escape = "none")]
struct ContainerTemplate {
    slug: String,
    image_uri: String,
    has_network: bool,
    network_stack: String,
    has_secret_statements: bool,
    secret_statements: Vec<StatementView>,
    handlers: Vec<HandlerView>,
    env: Vec<EnvView>,
}

pub fn container_stack_name(config: &StageConfig) -> String {
    format!("{}-container", config.slug())
}

/// Output key holding the API domain of a handler.
pub fn container_output_key(handler: &str) -> String {
    format!("{}ApiDomain", logical_id(handler))
}

pub fn container_export_name(config: &StageConfig, handler: &str) -> String {
    format!("{}-container-{}-api-domain", config.slug(), handler)
}

pub fn handler_function_name(config: &StageConfig, handler: &str) -> String {
    format!("{}-{}", config.slug(), handler)
}

/// Runtime locations of the secret store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretLocation {
    pub store: SecretStoreKind,
    pub key: String,
}

fn secret_statement(config: &StageConfig, store: SecretStoreKind, key: &str) -> StatementView {
    match store {
        SecretStoreKind::Blob => StatementView {
            action: yaml_quote("secretsmanager:GetSecretValue"),
            resource: yaml_quote(&format!(
                "arn:aws:secretsmanager:{}:*:secret:{}-*",
                config.region, key
            )),
        },
        SecretStoreKind::Parameter => StatementView {
            action: yaml_quote("ssm:GetParametersByPath"),
            resource: yaml_quote(&format!(
                "arn:aws:ssm:{}:*:parameter/{}/*",
                config.region,
                key.trim_start_matches('/')
            )),
        },
    }
}

pub fn render_container(
    config: &StageConfig,
    image_uri: &str,
    secrets: &SecretLocation,
) -> ConfigResult<RenderedTemplate> {
    let container = config
        .container
        .as_ref()
        .ok_or_else(|| ConfigError::MissingField("container".to_string()))?;

    let mut env = BTreeMap::new();
    env.insert("STAGEHAND_STAGE".to_string(), config.stage.clone());
    env.insert("STAGEHAND_PROJECT".to_string(), config.project.clone());
    env.insert("STAGEHAND_REGION".to_string(), config.region.clone());
    env.insert("STAGEHAND_SECRETS_STORE".to_string(), secrets.store.to_string());
    env.insert("STAGEHAND_SECRETS_KEY".to_string(), secrets.key.clone());
    env.extend(container.env.clone());

    let mut secret_statements = Vec::new();
    if !container.secrets.managed.is_empty() {
        secret_statements.push(secret_statement(config, secrets.store, &secrets.key));
    }
    for user in &container.secrets.user {
        let store = user.store.unwrap_or(container.secrets.store);
        secret_statements.push(secret_statement(config, store, &user.reference));
    }

    let handlers = container
        .handlers
        .iter()
        .map(|h| HandlerView {
            logical_id: logical_id(&h.name),
            function_name: handler_function_name(config, &h.name),
            command: yaml_quote(&h.command),
            timeout: h.timeout,
            memory: h.memory,
            has_reserved_concurrency: h.reserved_concurrency.is_some(),
            reserved_concurrency: h.reserved_concurrency.unwrap_or_default(),
            has_domain: h.domain.is_some(),
            domain: h.domain.clone().unwrap_or_default(),
            certificate_arn: h.certificate_arn.clone().unwrap_or_default(),
            export_name: container_export_name(config, &h.name),
        })
        .collect::<Vec<_>>();

    let exports = container
        .handlers
        .iter()
        .map(|h| (container_output_key(&h.name), container_export_name(config, &h.name)))
        .collect();

    let view = ContainerTemplate {
        slug: config.slug(),
        image_uri: image_uri.to_string(),
        has_network: container.network.is_some(),
        network_stack: container
            .network
            .as_deref()
            .map(|r| config.network_stack_name(r))
            .unwrap_or_default(),
        has_secret_statements: !secret_statements.is_empty(),
        secret_statements,
        handlers,
        env: env
            .into_iter()
            .map(|(key, value)| EnvView {
                key,
                value: yaml_quote(&value),
            })
            .collect(),
    };
    Ok(finish(view.render()?, exports))
}

// ============================================================================
// CDN signing keys
// ============================================================================

#[derive(Template)]
#[template(path = "cdn_keys.yaml", escape = "none")]
struct CdnKeysTemplate {
    name: String,
    slug: String,
    stack_name: String,
    export_name: String,
    key_lines: Vec<String>,
}

pub fn cdn_keys_stack_name(config: &StageConfig, cdn: &str) -> String {
    format!("{}-cdn-keys-{}", config.slug(), cdn)
}

pub const CDN_KEYS_OUTPUT: &str = "KeyGroupId";

pub fn render_cdn_keys(
    config: &StageConfig,
    cdn: &CdnConfig,
    public_key_pem: &str,
) -> ConfigResult<RenderedTemplate> {
    let stack_name = cdn_keys_stack_name(config, &cdn.name);
    let export_name = format!("{}-key-group-id", stack_name);
    let key_lines: Vec<String> = public_key_pem
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();
    if key_lines.is_empty() {
        return Err(ConfigError::invalid(
            format!("signing key of cdn {}", cdn.name),
            "public key is empty",
        ));
    }

    let view = CdnKeysTemplate {
        name: cdn.name.clone(),
        slug: config.slug(),
        stack_name: stack_name.clone(),
        export_name: export_name.clone(),
        key_lines,
    };
    let exports = BTreeMap::from([(CDN_KEYS_OUTPUT.to_string(), export_name)]);
    Ok(finish(view.render()?, exports))
}

// ============================================================================
// CDN distribution
// ============================================================================

/// Values from other stacks the distribution template needs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CdnExports {
    pub key_group_id: Option<String>,
    /// API domain per container handler.
    pub api_domains: BTreeMap<String, String>,
}

struct OriginView {
    id: String,
    domain: String,
}

struct BehaviorView {
    path: String,
    origin_id: String,
    cache_policy: String,
    has_request_policy: bool,
    request_policy: String,
    signed: bool,
}

#[derive(Template)]
#[template(path = "cdn.yaml", escape = "none")]
struct CdnTemplate {
    name: String,
    slug: String,
    stack_name: String,
    region: String,
    has_domain: bool,
    domain: String,
    certificate_arn: String,
    bucket: String,
    has_origin_path: bool,
    origin_path: String,
    fallback_html: String,
    api_origins: Vec<OriginView>,
    default_behavior: BehaviorView,
    has_behaviors: bool,
    behaviors: Vec<BehaviorView>,
    has_spa: bool,
    key_group_id: String,
}

pub fn cdn_stack_name(config: &StageConfig, cdn: &str) -> String {
    format!("{}-cdn-{}", config.slug(), cdn)
}

pub fn cdn_bucket_name(config: &StageConfig, cdn: &CdnConfig) -> ConfigResult<String> {
    config.format_name(&format!("bucket-name-format of cdn {}", cdn.name), &cdn.bucket_name_format)
}

pub fn cdn_origin_path(config: &StageConfig, cdn: &CdnConfig) -> ConfigResult<String> {
    config.format_name(&format!("origin-path-format of cdn {}", cdn.name), &cdn.origin_path_format)
}

fn origin_id(route: &RouteConfig) -> String {
    match (&route.origin, &route.handler) {
        (RouteOrigin::Container, Some(handler)) => format!("container-{}", handler),
        _ => "storage".to_string(),
    }
}

fn behavior(route: &RouteConfig) -> BehaviorView {
    let is_api = route.origin == RouteOrigin::Container;
    BehaviorView {
        path: yaml_quote(&route.path),
        origin_id: origin_id(route),
        cache_policy: if is_api { CACHING_DISABLED } else { CACHING_OPTIMIZED }.to_string(),
        has_request_policy: is_api,
        request_policy: ALL_VIEWER_EXCEPT_HOST.to_string(),
        signed: route.signed,
    }
}

pub fn render_cdn(
    config: &StageConfig,
    cdn: &CdnConfig,
    exports: &CdnExports,
) -> ConfigResult<RenderedTemplate> {
    let stack_name = cdn_stack_name(config, &cdn.name);

    let key_group_id = match (&exports.key_group_id, cdn.has_signed_routes()) {
        (Some(id), _) => id.clone(),
        (None, false) => String::new(),
        (None, true) => {
            return Err(ConfigError::InvalidReference(format!(
                "cdn {} has signed routes but its key group is not available",
                cdn.name
            )));
        }
    };

    let mut api_origins: Vec<OriginView> = Vec::new();
    for route in cdn.routes.iter().filter(|r| r.origin == RouteOrigin::Container) {
        let id = origin_id(route);
        if api_origins.iter().any(|o| o.id == id) {
            continue;
        }
        let handler = route.handler.as_deref().unwrap_or_default();
        let domain = exports.api_domains.get(handler).ok_or_else(|| {
            ConfigError::InvalidReference(format!(
                "cdn {} routes to handler {} whose API domain is not available",
                cdn.name, handler
            ))
        })?;
        api_origins.push(OriginView {
            id,
            domain: domain.clone(),
        });
    }

    let default_route = cdn
        .routes
        .iter()
        .find(|r| r.path == "/*")
        .or_else(|| cdn.routes.first())
        .ok_or_else(|| ConfigError::MissingField(format!("route of cdn {}", cdn.name)))?;
    let behaviors: Vec<BehaviorView> = cdn
        .routes
        .iter()
        .filter(|r| r.path != default_route.path)
        .map(behavior)
        .collect();

    let origin_path = cdn_origin_path(config, cdn)?;
    let view = CdnTemplate {
        name: cdn.name.clone(),
        slug: config.slug(),
        stack_name: stack_name.clone(),
        region: config.region.clone(),
        has_domain: cdn.domain.is_some(),
        domain: cdn.domain.clone().unwrap_or_default(),
        certificate_arn: cdn.certificate_arn.clone().unwrap_or_default(),
        bucket: cdn_bucket_name(config, cdn)?,
        has_origin_path: !origin_path.is_empty(),
        origin_path,
        fallback_html: cdn.fallback_html.clone(),
        api_origins,
        default_behavior: behavior(default_route),
        has_behaviors: !behaviors.is_empty(),
        behaviors,
        has_spa: cdn.routes.iter().any(|r| r.spa),
        key_group_id,
    };

    let exports = [
        ("DistributionId", "distribution-id"),
        ("DistributionArn", "distribution-arn"),
        ("DomainName", "domain-name"),
    ]
    .into_iter()
    .map(|(key, suffix)| (key.to_string(), format!("{}-{}", stack_name, suffix)))
    .collect();
    Ok(finish(view.render()?, exports))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::parse_stage_config;
    use serde_yaml::Value;
    use std::path::Path;

    const PROJECT: &str = r#"
        project "shop"
        region "ap-northeast-1"
        stages "dev"
        network "main" {
            zones "a" "c"
        }
        container network="main" {
            handler "wsgi" command="app.wsgi" reserved-concurrency=5
            handler "worker-queue" command="app.worker"
            env {
                GREETING "say \"hi\""
            }
            secrets store="parameter" {
                managed "SIGNING_KEY" type="rsa-keypair"
                user "STRIPE_KEY" ref="stripe-key"
            }
        }
        cdn "web" {
            signing-key "SIGNING_KEY"
            route "/api/*" origin="container" handler="wsgi"
            route "/*" upload-from="dist" spa=#true signed=#true
        }
    "#;

    fn config() -> StageConfig {
        parse_stage_config(PROJECT, "dev", Path::new(".")).unwrap()
    }

    fn parse(body: &str) -> Value {
        serde_yaml::from_str(body).unwrap()
    }

    #[test]
    fn test_strip_template_comments() {
        let text = "a: 1\n#\n  # prettier-ignore\n# real comment\nb: 2\n";
        assert_eq!(strip_template_comments(text), "a: 1\n# real comment\nb: 2\n");
    }

    #[test]
    fn test_logical_id() {
        assert_eq!(logical_id("wsgi"), "Wsgi");
        assert_eq!(logical_id("worker-queue"), "WorkerQueue");
        assert_eq!(logical_id("a"), "A");
    }

    #[test]
    fn test_render_network() {
        let config = config();
        let rendered = render_network(&config, config.network.as_ref().unwrap()).unwrap();
        let doc = parse(&rendered.body);

        let subnet = &doc["Resources"]["PrivateSubnetC"]["Properties"];
        assert_eq!(subnet["CidrBlock"].as_str(), Some("10.0.3.0/24"));
        assert_eq!(subnet["AvailabilityZone"].as_str(), Some("ap-northeast-1c"));
        assert_eq!(
            rendered.exports["PrivateSubnetIds"],
            "stagehand-main-shop-vpc-private-subnet-ids"
        );
        assert!(!rendered.body.contains("prettier-ignore"));
    }

    #[test]
    fn test_network_rejects_non_16_block() {
        let mut config = config();
        let mut network = config.network.take().unwrap();
        network.cidr = "10.0.0.0/24".to_string();
        assert!(render_network(&config, &network).is_err());
    }

    #[test]
    fn test_render_container() {
        let config = config();
        let location = SecretLocation {
            store: SecretStoreKind::Parameter,
            key: "dev-shop-stagehand-dev-shop".to_string(),
        };
        let rendered = render_container(&config, "repo/app:dev", &location).unwrap();
        let doc = parse(&rendered.body);

        let function = &doc["Resources"]["WsgiFunction"]["Properties"];
        assert_eq!(function["FunctionName"].as_str(), Some("dev-shop-wsgi"));
        assert_eq!(function["Code"]["ImageUri"].as_str(), Some("repo/app:dev"));
        assert_eq!(function["ReservedConcurrentExecutions"].as_u64(), Some(5));
        let vars = &function["Environment"]["Variables"];
        assert_eq!(vars["GREETING"].as_str(), Some("say \"hi\""));
        assert_eq!(vars["STAGEHAND_SECRETS_STORE"].as_str(), Some("parameter"));
        assert!(doc["Resources"]["WorkerQueueFunction"].is_mapping());
        assert!(
            doc["Resources"]["WorkerQueueFunction"]["Properties"]
                .get("ReservedConcurrentExecutions")
                .is_none()
        );

        assert_eq!(
            rendered.exports[&container_output_key("wsgi")],
            "dev-shop-container-wsgi-api-domain"
        );
        let statements = &doc["Resources"]["LambdaRole"]["Properties"]["Policies"][0]
            ["PolicyDocument"]["Statement"];
        assert_eq!(statements.as_sequence().map(|s| s.len()), Some(2));
    }

    #[test]
    fn test_render_cdn_keys() {
        let config = config();
        let pem = "-----BEGIN PUBLIC KEY-----\nMIIB\nIDAQ\n-----END PUBLIC KEY-----\n";
        let rendered = render_cdn_keys(&config, &config.cdns[0], pem).unwrap();
        let doc = parse(&rendered.body);
        let encoded = doc["Resources"]["PublicKey"]["Properties"]["PublicKeyConfig"]
            ["EncodedKey"]
            .as_str()
            .unwrap();
        assert_eq!(encoded, pem);
        assert_eq!(
            rendered.exports[CDN_KEYS_OUTPUT],
            "dev-shop-cdn-keys-web-key-group-id"
        );
    }

    #[test]
    fn test_render_cdn_requires_exports() {
        let config = config();
        let cdn = &config.cdns[0];
        assert!(render_cdn(&config, cdn, &CdnExports::default()).is_err());

        let exports = CdnExports {
            key_group_id: Some("kg-1".to_string()),
            api_domains: BTreeMap::from([("wsgi".to_string(), "abc.execute-api.com".to_string())]),
        };
        let rendered = render_cdn(&config, cdn, &exports).unwrap();
        let doc = parse(&rendered.body);
        let dist = &doc["Resources"]["Distribution"]["Properties"]["DistributionConfig"];

        assert_eq!(dist["Origins"][1]["DomainName"].as_str(), Some("abc.execute-api.com"));
        assert_eq!(dist["Origins"][0]["OriginPath"].as_str(), Some("/dev"));
        assert_eq!(
            dist["DefaultCacheBehavior"]["TrustedKeyGroups"][0].as_str(),
            Some("kg-1")
        );
        assert_eq!(dist["CacheBehaviors"][0]["PathPattern"].as_str(), Some("/api/*"));
        assert!(dist["CustomErrorResponses"].is_sequence());
        assert!(dist["ViewerCertificate"]["CloudFrontDefaultCertificate"].as_bool().unwrap());
    }
}
