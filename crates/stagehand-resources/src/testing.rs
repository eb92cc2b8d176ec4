//! Shared fixtures for resource tests.

use stagehand_config::{StageConfig, parse_stage_config};
use stagehand_core::cloud::{CloudClients, MemoryCloud};
use std::path::Path;

use crate::resource::ResourceContext;

pub(crate) const PROJECT: &str = r#"
    project "shop"
    region "us-east-1"
    stages "dev" "prod"

    network "main" {
        zones "a" "c"
    }
    managed-db network="main"
    branched-db {
        pg-version 16
    }
    distributed-sql {
        database "app"
    }
    storage {
        public-dirs "static"
    }
    container network="main" {
        dockerfile "Dockerfile"
        builder "local"
        handler "wsgi" command="app.wsgi" timeout=30 memory=1024
        secrets store="blob" {
            managed "SECRET_KEY" type="password" length=50
            managed "DATABASE_URL" type="derived-database-url"
            managed "SIGNING_KEY" type="rsa-keypair" bits=1024
            user "STRIPE_KEY" ref="stripe/key" store="parameter"
        }
    }
    cdn "web" {
        domain "www.example.com"
        certificate-arn "arn:aws:acm:us-east-1:123:certificate/abc"
        signing-key "SIGNING_KEY"
        redirect-from "example.com"
        route "/api/*" origin="container" handler="wsgi"
        route "/*" origin="storage" upload-from="frontend/dist" spa=#true signed=#true
    }
"#;

pub(crate) fn fixture_config(stage: &str) -> StageConfig {
    parse_stage_config(PROJECT, stage, Path::new("/srv/shop")).unwrap()
}

/// Context on a memory cloud with every wait shrunk a thousandfold.
pub(crate) fn context(cloud: &MemoryCloud, config: StageConfig) -> ResourceContext {
    ResourceContext::new(config, CloudClients::from_memory(cloud)).with_poll_divisor(1000)
}
