//! Branching Postgres provider over its v2 REST API.

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use stagehand_core::cloud::{BranchingDbApi, DbBranch, DbEndpoint, DbProject};
use stagehand_core::{Error, Result};
use std::time::Duration;
use tracing::{debug, info};

use super::{credential_from_env, remote};

pub const DEFAULT_BASE_URL: &str = "https://console.neon.tech/api/v2";

#[derive(Debug, Deserialize)]
struct Projects {
    #[serde(default)]
    projects: Vec<DbProject>,
}

#[derive(Debug, Deserialize)]
struct ProjectEnvelope {
    project: DbProject,
}

#[derive(Debug, Deserialize)]
struct Branches {
    #[serde(default)]
    branches: Vec<DbBranch>,
}

#[derive(Debug, Deserialize)]
struct BranchEnvelope {
    branch: DbBranch,
}

#[derive(Debug, Deserialize)]
struct Endpoint {
    id: String,
    branch_id: String,
    host: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct Endpoints {
    #[serde(default)]
    endpoints: Vec<Endpoint>,
}

#[derive(Debug, Deserialize)]
struct Database {
    name: String,
}

#[derive(Debug, Deserialize)]
struct Databases {
    #[serde(default)]
    databases: Vec<Database>,
}

#[derive(Debug, Deserialize)]
struct Password {
    password: String,
}

/// Pick the read-write endpoint of a branch.
fn read_write_endpoint(endpoints: Vec<Endpoint>, branch_id: &str) -> Option<DbEndpoint> {
    endpoints
        .into_iter()
        .find(|e| e.branch_id == branch_id && e.kind == "read_write")
        .map(|e| DbEndpoint {
            id: e.id,
            branch_id: e.branch_id,
            host: e.host,
        })
}

pub struct NeonClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl NeonClient {
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| remote("building HTTP client", e))?;
        Ok(Self {
            client,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
        })
    }

    /// Client authenticated with the key in `var`.
    pub fn from_env(var: &str) -> Result<Self> {
        Self::new(credential_from_env(var)?)
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    /// Send a request; `None` on 404.
    async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Option<T>> {
        let url = format!("{}/{}", self.base_url, path);
        if method == Method::GET {
            debug!(url = %url, "GET");
        } else {
            info!(method = %method, url = %url, "Calling database provider");
        }
        let mut request = self
            .client
            .request(method, &url)
            .bearer_auth(&self.api_key)
            .header("Accept", "application/json");
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await.map_err(|e| remote(&url, e))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(Error::Remote(format!("{} returned {}: {}", url, status, message)));
        }
        response.json().await.map(Some).map_err(|e| remote(&url, e))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        self.send(Method::GET, path, None).await
    }

    /// A mutating call; a 404 here is a real failure.
    async fn mutate<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<T> {
        self.send(method, path, body)
            .await?
            .ok_or_else(|| Error::NotFound(path.to_string()))
    }
}

#[async_trait]
impl BranchingDbApi for NeonClient {
    async fn find_project(&self, name: &str) -> Result<Option<DbProject>> {
        let projects: Option<Projects> = self.get("projects").await?;
        Ok(projects
            .into_iter()
            .flat_map(|p| p.projects)
            .find(|p| p.name == name))
    }

    async fn create_project(
        &self,
        name: &str,
        pg_version: u32,
        region: &str,
    ) -> Result<DbProject> {
        let body = json!({
            "project": { "name": name, "pg_version": pg_version, "region_id": region }
        });
        let created: ProjectEnvelope = self.mutate(Method::POST, "projects", Some(body)).await?;
        Ok(created.project)
    }

    async fn find_branch(&self, project_id: &str, name: &str) -> Result<Option<DbBranch>> {
        let branches: Option<Branches> =
            self.get(&format!("projects/{}/branches", project_id)).await?;
        Ok(branches
            .into_iter()
            .flat_map(|b| b.branches)
            .find(|b| b.name == name))
    }

    async fn create_branch(&self, project_id: &str, name: &str) -> Result<DbBranch> {
        let body = json!({
            "branch": { "name": name },
            "endpoints": [{ "type": "read_write" }],
        });
        let created: BranchEnvelope = self
            .mutate(Method::POST, &format!("projects/{}/branches", project_id), Some(body))
            .await?;
        Ok(created.branch)
    }

    async fn delete_branch(&self, project_id: &str, branch_id: &str) -> Result<()> {
        let _: Value = self
            .mutate(
                Method::DELETE,
                &format!("projects/{}/branches/{}", project_id, branch_id),
                None,
            )
            .await?;
        Ok(())
    }

    async fn find_endpoint(
        &self,
        project_id: &str,
        branch_id: &str,
    ) -> Result<Option<DbEndpoint>> {
        let endpoints: Option<Endpoints> =
            self.get(&format!("projects/{}/endpoints", project_id)).await?;
        Ok(endpoints.and_then(|e| read_write_endpoint(e.endpoints, branch_id)))
    }

    async fn delete_endpoint(&self, project_id: &str, endpoint_id: &str) -> Result<()> {
        let _: Value = self
            .mutate(
                Method::DELETE,
                &format!("projects/{}/endpoints/{}", project_id, endpoint_id),
                None,
            )
            .await?;
        Ok(())
    }

    async fn role_exists(&self, project_id: &str, branch_id: &str, role: &str) -> Result<bool> {
        let found: Option<Value> = self
            .get(&format!("projects/{}/branches/{}/roles/{}", project_id, branch_id, role))
            .await?;
        Ok(found.is_some())
    }

    async fn create_role(&self, project_id: &str, branch_id: &str, role: &str) -> Result<()> {
        let _: Value = self
            .mutate(
                Method::POST,
                &format!("projects/{}/branches/{}/roles", project_id, branch_id),
                Some(json!({ "role": { "name": role } })),
            )
            .await?;
        Ok(())
    }

    async fn reveal_password(
        &self,
        project_id: &str,
        branch_id: &str,
        role: &str,
    ) -> Result<String> {
        let path = format!(
            "projects/{}/branches/{}/roles/{}/reveal_password",
            project_id, branch_id, role
        );
        let revealed: Password = self.mutate(Method::GET, &path, None).await?;
        Ok(revealed.password)
    }

    async fn database_exists(&self, project_id: &str, branch_id: &str, name: &str) -> Result<bool> {
        let databases: Option<Databases> = self
            .get(&format!("projects/{}/branches/{}/databases", project_id, branch_id))
            .await?;
        Ok(databases
            .into_iter()
            .flat_map(|d| d.databases)
            .any(|d| d.name == name))
    }

    async fn create_database(
        &self,
        project_id: &str,
        branch_id: &str,
        name: &str,
        owner: &str,
    ) -> Result<()> {
        let _: Value = self
            .mutate(
                Method::POST,
                &format!("projects/{}/branches/{}/databases", project_id, branch_id),
                Some(json!({ "database": { "name": name, "owner_name": owner } })),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write_endpoint_is_picked() {
        let endpoints: Endpoints = serde_json::from_value(json!({
            "endpoints": [
                {"id": "ep-ro", "branch_id": "br-1", "host": "ro.neon.tech", "type": "read_only"},
                {"id": "ep-other", "branch_id": "br-2", "host": "x.neon.tech", "type": "read_write"},
                {"id": "ep-rw", "branch_id": "br-1", "host": "rw.neon.tech", "type": "read_write",
                 "autoscaling_limit_min_cu": 0.25}
            ]
        }))
        .unwrap();
        let endpoint = read_write_endpoint(endpoints.endpoints, "br-1").unwrap();
        assert_eq!(endpoint.id, "ep-rw");
        assert_eq!(endpoint.host, "rw.neon.tech");
    }

    #[test]
    fn test_listing_tolerates_missing_arrays() {
        let projects: Projects = serde_json::from_value(json!({})).unwrap();
        assert!(projects.projects.is_empty());
        let branches: Branches = serde_json::from_value(json!({
            "branches": [{"id": "br-1", "name": "dev", "primary": false}]
        }))
        .unwrap();
        assert_eq!(branches.branches[0].name, "dev");
    }

    #[test]
    fn test_base_url_is_normalized() {
        let client = NeonClient::new("key").unwrap().with_base_url("http://localhost:9000/");
        assert_eq!(client.base_url, "http://localhost:9000");
    }
}
