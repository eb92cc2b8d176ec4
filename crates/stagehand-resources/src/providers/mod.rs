//! HTTP clients for the external database providers.

pub mod neon;
pub mod tidb;

pub use neon::NeonClient;
pub use tidb::TidbClient;

use stagehand_core::{Error, Result};

/// Read a credential from the environment.
pub(crate) fn credential_from_env(var: &str) -> Result<String> {
    match std::env::var(var) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(Error::Configuration(format!("environment variable {} is not set", var))),
    }
}

pub(crate) fn remote(context: &str, err: reqwest::Error) -> Error {
    Error::Remote(format!("{}: {}", context, err))
}
