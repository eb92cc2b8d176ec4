//! Variable interpolation for project files.
//!
//! Two forms are supported:
//! - `${name}` inside free-form values (environment variables, paths):
//!   `${stage}`, `${project}`, `${namespace}`, `${region}`, `${prefix}`,
//!   `${env.VAR}`, `${date}`, `${timestamp}`. Unknown names are left as is.
//! - `{name}` inside name formats (`prefix-template`, bucket formats). Unknown
//!   names are an error since they would leak into resource names.

use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;

use crate::{ConfigError, ConfigResult};

static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*(?:\.[a-zA-Z_][a-zA-Z0-9_]*)?)\}").unwrap()
});

static FORMAT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([a-zA-Z_][a-zA-Z0-9_]*)\}").unwrap());

/// Values available to interpolation.
#[derive(Debug, Clone, Default)]
pub struct VariableContext {
    pub stage: String,
    pub project: String,
    pub namespace: String,
    pub region: String,
    /// Resolved resource name prefix; empty until the prefix itself is formatted.
    pub prefix: String,
    pub env: BTreeMap<String, String>,
}

impl VariableContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Populate `env` from the current process environment.
    pub fn populate_env(&mut self) {
        self.env.extend(std::env::vars());
    }

    pub fn resolve(&self, var_name: &str) -> Option<String> {
        let parts: Vec<&str> = var_name.split('.').collect();

        match parts.as_slice() {
            ["stage"] => Some(self.stage.clone()),
            ["project"] => Some(self.project.clone()),
            ["namespace"] => Some(self.namespace.clone()),
            ["region"] => Some(self.region.clone()),
            ["prefix"] if !self.prefix.is_empty() => Some(self.prefix.clone()),
            ["env", name] => self.env.get(*name).cloned(),
            ["timestamp"] => Some(chrono::Utc::now().timestamp().to_string()),
            ["date"] => Some(chrono::Utc::now().format("%Y-%m-%d").to_string()),
            _ => None,
        }
    }

    /// Replace every `${...}` reference that resolves.
    pub fn interpolate(&self, input: &str) -> String {
        VAR_REGEX
            .replace_all(input, |caps: &regex::Captures| {
                let var_name = &caps[1];
                self.resolve(var_name)
                    .unwrap_or_else(|| format!("${{{}}}", var_name))
            })
            .to_string()
    }

    pub fn interpolate_map(&self, map: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        map.iter()
            .map(|(k, v)| (k.clone(), self.interpolate(v)))
            .collect()
    }

    /// Expand a `{name}` format. `field` names the setting in errors.
    pub fn format_name(&self, field: &str, format: &str) -> ConfigResult<String> {
        let mut unknown = None;
        let out = FORMAT_REGEX.replace_all(format, |caps: &regex::Captures| {
            let var_name = &caps[1];
            match self.resolve(var_name) {
                Some(value) => value,
                None => {
                    unknown.get_or_insert_with(|| var_name.to_string());
                    String::new()
                }
            }
        });
        match unknown {
            Some(name) => Err(ConfigError::invalid(
                field,
                format!("unknown placeholder {{{}}} in {:?}", name, format),
            )),
            None => Ok(out.to_string()),
        }
    }

    /// Names of every `{name}` placeholder in a format.
    pub fn placeholders(format: &str) -> Vec<String> {
        FORMAT_REGEX
            .captures_iter(format)
            .map(|caps| caps[1].to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> VariableContext {
        let mut ctx = VariableContext::new();
        ctx.stage = "dev".into();
        ctx.project = "shop".into();
        ctx.namespace = "stagehand".into();
        ctx.region = "ap-northeast-1".into();
        ctx.env.insert("HOME".into(), "/home/app".into());
        ctx
    }

    #[test]
    fn test_interpolate_known_and_unknown() {
        let result = ctx().interpolate("${stage}/${env.HOME}/${missing}");
        assert_eq!(result, "dev//home/app/${missing}");
    }

    #[test]
    fn test_format_name() {
        let name = ctx()
            .format_name("prefix-template", "{stage}-{project}-{namespace}-")
            .unwrap();
        assert_eq!(name, "dev-shop-stagehand-");
    }

    #[test]
    fn test_format_prefix_requires_resolution() {
        let mut ctx = ctx();
        assert!(ctx.format_name("bucket", "{prefix}{stage}").is_err());
        ctx.prefix = "dev-shop-stagehand-".into();
        assert_eq!(
            ctx.format_name("bucket", "{prefix}{stage}-{project}").unwrap(),
            "dev-shop-stagehand-dev-shop"
        );
    }

    #[test]
    fn test_format_rejects_unknown_placeholder() {
        let err = ctx().format_name("bucket", "{stage}-{owner}").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
        assert!(err.to_string().contains("{owner}"));
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(
            VariableContext::placeholders("{prefix}{stage}-x"),
            vec!["prefix", "stage"]
        );
    }

    #[test]
    fn test_date() {
        let result = ctx().interpolate("${date}");
        assert_eq!(result.len(), 10);
        assert!(result.contains('-'));
    }
}
