//! Project configuration for stagehand.
//!
//! Parses `stagehand.kdl` project files into a per-stage [`StageConfig`] and
//! renders the infrastructure templates derived from it.

pub mod error;
pub mod project;
pub mod render;
pub mod variables;

pub use error::{ConfigError, ConfigResult};
pub use project::{
    BranchedDbConfig, CdnConfig, ContainerConfig, DistributedSqlConfig, HandlerConfig,
    ManagedDbConfig, NetworkConfig, RouteConfig, RouteOrigin, SecretsConfig, StageConfig,
    StorageConfig, declared_stages, load_stage_config, parse_stage_config,
};
pub use render::{CdnExports, RenderedTemplate, SecretLocation};
pub use variables::VariableContext;
