//! Serverless distributed SQL provider.
//!
//! The REST API authenticates with HTTP Digest; the database itself is created
//! over the MySQL protocol.

use async_trait::async_trait;
use rand::RngCore;
use rand::rngs::OsRng;
use regex::Regex;
use reqwest::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use sqlx::{Connection, MySqlConnection};
use stagehand_core::cloud::{ServerlessSqlApi, SqlCluster, SqlClusterRequest, SqlProject};
use stagehand_core::{Error, Result};
use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

use super::{credential_from_env, remote};

pub const SERVERLESS_BASE_URL: &str = "https://serverless.tidbapi.com/v1beta1";
pub const IAM_BASE_URL: &str = "https://iam.tidbapi.com/v1beta1";

static CHALLENGE_PARAM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(\w+)=(?:"([^"]*)"|([^,\s]*))"#).unwrap());

static DATABASE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_]+$").unwrap());

/// Parameters of a `WWW-Authenticate: Digest ...` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
struct DigestChallenge {
    realm: String,
    nonce: String,
    qop: Option<String>,
    opaque: Option<String>,
}

impl DigestChallenge {
    fn parse(header: &str) -> Result<Self> {
        let params = header
            .trim()
            .strip_prefix("Digest")
            .ok_or_else(|| Error::Remote(format!("unsupported auth challenge: {}", header)))?;
        let mut values: HashMap<String, String> = CHALLENGE_PARAM
            .captures_iter(params)
            .map(|c| {
                let value = c.get(2).or_else(|| c.get(3)).map_or("", |m| m.as_str());
                (c[1].to_lowercase(), value.to_string())
            })
            .collect();
        let nonce = values
            .remove("nonce")
            .ok_or_else(|| Error::Remote("digest challenge has no nonce".to_string()))?;
        Ok(Self {
            realm: values.remove("realm").unwrap_or_default(),
            nonce,
            // Only "auth" is supported among the offered qops.
            qop: values
                .remove("qop")
                .filter(|q| q.split(',').any(|v| v.trim() == "auth"))
                .map(|_| "auth".to_string()),
            opaque: values.remove("opaque"),
        })
    }

    /// The `Authorization` header answering this challenge.
    fn authorization(
        &self,
        username: &str,
        password: &str,
        method: &str,
        uri: &str,
        cnonce: &str,
    ) -> String {
        let nc = "00000001";
        let ha1 = digest_hex(&format!("{}:{}:{}", username, self.realm, password));
        let ha2 = digest_hex(&format!("{}:{}", method, uri));
        let response = match &self.qop {
            Some(qop) => digest_hex(&format!(
                "{}:{}:{}:{}:{}:{}",
                ha1, self.nonce, nc, cnonce, qop, ha2
            )),
            None => digest_hex(&format!("{}:{}:{}", ha1, self.nonce, ha2)),
        };

        let mut header = format!(
            r#"Digest username="{}", realm="{}", nonce="{}", uri="{}", response="{}", algorithm=MD5"#,
            username, self.realm, self.nonce, uri, response
        );
        if let Some(qop) = &self.qop {
            header.push_str(&format!(r#", qop={}, nc={}, cnonce="{}""#, qop, nc, cnonce));
        }
        if let Some(opaque) = &self.opaque {
            header.push_str(&format!(r#", opaque="{}""#, opaque));
        }
        header
    }
}

fn digest_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

fn client_nonce() -> String {
    let mut bytes = [0u8; 8];
    OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Path and query of `url`, the `uri` digest parameter.
fn request_uri(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}

#[derive(Debug, Deserialize)]
struct Project {
    id: Value,
    name: String,
}

#[derive(Debug, Deserialize)]
struct Projects {
    #[serde(default)]
    projects: Vec<Project>,
}

#[derive(Debug, Default, Deserialize)]
struct PublicEndpoint {
    #[serde(default)]
    host: String,
    port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
struct ClusterEndpoints {
    #[serde(default)]
    public: PublicEndpoint,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Cluster {
    cluster_id: Value,
    display_name: String,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    endpoints: ClusterEndpoints,
    #[serde(default)]
    user_prefix: String,
}

#[derive(Debug, Deserialize)]
struct Clusters {
    #[serde(default)]
    clusters: Vec<Cluster>,
}

/// Ids arrive as strings or numbers depending on the endpoint.
fn id_string(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl From<Cluster> for SqlCluster {
    fn from(c: Cluster) -> Self {
        SqlCluster {
            id: id_string(&c.cluster_id),
            name: c.display_name,
            state: c.state.unwrap_or_else(|| "UNKNOWN".to_string()),
            host: c.endpoints.public.host,
            port: c.endpoints.public.port.unwrap_or(4000),
            user_prefix: c.user_prefix,
        }
    }
}

/// Connection URL for the root user over TLS.
fn connection_url(cluster: &SqlCluster, password: &str) -> Result<Url> {
    let mut url = Url::parse(&format!("mysql://{}:{}", cluster.host, cluster.port))
        .map_err(|e| Error::InvalidState(format!("bad cluster host {}: {}", cluster.host, e)))?;
    let credentials = url
        .set_username(&cluster.root_user())
        .and_then(|_| url.set_password(Some(password)));
    if credentials.is_err() {
        return Err(Error::InvalidState(format!(
            "cannot put credentials into a URL for {}",
            cluster.host
        )));
    }
    url.query_pairs_mut().append_pair("ssl-mode", "required");
    Ok(url)
}

pub struct TidbClient {
    client: Client,
    serverless_url: String,
    iam_url: String,
    public_key: String,
    private_key: String,
}

impl TidbClient {
    pub fn new(public_key: impl Into<String>, private_key: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| remote("building HTTP client", e))?;
        Ok(Self {
            client,
            serverless_url: SERVERLESS_BASE_URL.to_string(),
            iam_url: IAM_BASE_URL.to_string(),
            public_key: public_key.into(),
            private_key: private_key.into(),
        })
    }

    pub fn from_env(public_key_var: &str, private_key_var: &str) -> Result<Self> {
        Self::new(
            credential_from_env(public_key_var)?,
            credential_from_env(private_key_var)?,
        )
    }

    async fn send_once(
        &self,
        method: &Method,
        url: &Url,
        body: Option<&Value>,
        authorization: Option<String>,
    ) -> Result<reqwest::Response> {
        let mut request = self.client.request(method.clone(), url.clone());
        if let Some(body) = body {
            request = request.json(body);
        }
        if let Some(authorization) = authorization {
            request = request.header(AUTHORIZATION, authorization);
        }
        request.send().await.map_err(|e| remote(url.as_str(), e))
    }

    /// Send with digest auth: an unauthenticated attempt, then the answer to
    /// the challenge it returns.
    async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        body: Option<Value>,
    ) -> Result<T> {
        let url = Url::parse(url).map_err(|e| Error::Configuration(format!("bad URL {}: {}", url, e)))?;
        if method == Method::GET {
            debug!(url = %url, "GET");
        } else {
            info!(method = %method, url = %url, "Calling SQL provider");
        }

        let mut response = self.send_once(&method, &url, body.as_ref(), None).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            let challenge = response
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|h| h.to_str().ok())
                .ok_or_else(|| Error::Remote(format!("{} rejected the request without a challenge", url)))?;
            let authorization = DigestChallenge::parse(challenge)?.authorization(
                &self.public_key,
                &self.private_key,
                method.as_str(),
                &request_uri(&url),
                &client_nonce(),
            );
            response = self
                .send_once(&method, &url, body.as_ref(), Some(authorization))
                .await?;
        }

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(Error::NotFound(url.to_string()));
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(Error::Remote(format!("{} returned {}: {}", url, status, message)));
        }
        response.json().await.map_err(|e| remote(url.as_str(), e))
    }
}

#[async_trait]
impl ServerlessSqlApi for TidbClient {
    async fn list_projects(&self) -> Result<Vec<SqlProject>> {
        let projects: Projects = self
            .send(Method::GET, &format!("{}/projects", self.iam_url), None)
            .await?;
        Ok(projects
            .projects
            .into_iter()
            .map(|p| SqlProject {
                id: id_string(&p.id),
                name: p.name,
            })
            .collect())
    }

    async fn list_clusters(&self, project_id: &str) -> Result<Vec<SqlCluster>> {
        let url = format!("{}/clusters?filter=projectId={}", self.serverless_url, project_id);
        let clusters: Clusters = self.send(Method::GET, &url, None).await?;
        Ok(clusters.clusters.into_iter().map(SqlCluster::from).collect())
    }

    async fn create_cluster(&self, request: &SqlClusterRequest) -> Result<()> {
        let body = json!({
            "displayName": request.name,
            "region": { "name": request.region },
            "rootPassword": request.root_password,
            "labels": { "tidb.cloud/project": request.project_id },
            "endpoints": {
                "public": {
                    "authorizedNetworks": [{
                        "startIpAddress": "0.0.0.0",
                        "endIpAddress": "255.255.255.255",
                        "displayName": "Allow all"
                    }]
                }
            }
        });
        let _: Value = self
            .send(Method::POST, &format!("{}/clusters", self.serverless_url), Some(body))
            .await?;
        Ok(())
    }

    async fn delete_cluster(&self, id: &str) -> Result<()> {
        let _: Value = self
            .send(Method::DELETE, &format!("{}/clusters/{}", self.serverless_url, id), None)
            .await?;
        Ok(())
    }

    async fn reset_root_password(&self, id: &str, password: &str) -> Result<()> {
        let _: Value = self
            .send(
                Method::PUT,
                &format!("{}/clusters/{}/password", self.serverless_url, id),
                Some(json!({ "password": password })),
            )
            .await?;
        Ok(())
    }

    async fn create_database(
        &self,
        cluster: &SqlCluster,
        password: &str,
        database: &str,
    ) -> Result<()> {
        if !DATABASE_NAME.is_match(database) {
            return Err(Error::Configuration(format!(
                "database name {:?} may only contain letters, digits and underscores",
                database
            )));
        }
        let url = connection_url(cluster, password)?;
        let mut conn = MySqlConnection::connect(url.as_str())
            .await
            .map_err(|e| Error::Remote(format!("connecting to {}: {}", cluster.host, e)))?;
        sqlx::query(&format!("CREATE DATABASE IF NOT EXISTS `{}`", database))
            .execute(&mut conn)
            .await
            .map_err(|e| Error::Remote(format!("creating database {}: {}", database, e)))?;
        conn.close()
            .await
            .map_err(|e| Error::Remote(format!("closing connection to {}: {}", cluster.host, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_answer_matches_rfc2617() {
        let challenge = DigestChallenge::parse(
            r#"Digest realm="testrealm@host.com", qop="auth,auth-int", nonce="dcd98b7102dd2f0e8b11d0f600bfb0c093", opaque="5ccc069c403ebaf9f0171e9517f40e41""#,
        )
        .unwrap();
        assert_eq!(challenge.realm, "testrealm@host.com");
        assert_eq!(challenge.qop.as_deref(), Some("auth"));

        let header = challenge.authorization(
            "Mufasa",
            "Circle Of Life",
            "GET",
            "/dir/index.html",
            "0a4f113b",
        );
        assert!(header.contains(r#"response="6629fae49393a05397450978507c4ef1""#));
        assert!(header.contains(r#"opaque="5ccc069c403ebaf9f0171e9517f40e41""#));
        assert!(header.contains("nc=00000001"));
    }

    #[test]
    fn test_challenge_without_nonce_is_rejected() {
        assert!(DigestChallenge::parse(r#"Digest realm="x""#).is_err());
        assert!(DigestChallenge::parse(r#"Bearer realm="x""#).is_err());
    }

    #[test]
    fn test_request_uri_keeps_query() {
        let url = Url::parse("https://serverless.tidbapi.com/v1beta1/clusters?filter=projectId=7").unwrap();
        assert_eq!(request_uri(&url), "/v1beta1/clusters?filter=projectId=7");
    }

    #[test]
    fn test_cluster_listing_is_mapped() {
        let clusters: Clusters = serde_json::from_value(json!({
            "clusters": [{
                "clusterId": 10423,
                "displayName": "dev-shop",
                "state": "ACTIVE",
                "userPrefix": "2a0f",
                "endpoints": {"public": {"host": "gateway01.prod.aws.tidbcloud.com", "port": 4000}}
            }, {
                "clusterId": "10424",
                "displayName": "prod-shop"
            }]
        }))
        .unwrap();
        let mapped: Vec<SqlCluster> = clusters.clusters.into_iter().map(SqlCluster::from).collect();
        assert_eq!(mapped[0].id, "10423");
        assert!(mapped[0].is_active());
        assert_eq!(mapped[0].root_user(), "2a0f.root");
        assert_eq!(mapped[1].id, "10424");
        assert_eq!(mapped[1].state, "UNKNOWN");
        assert_eq!(mapped[1].port, 4000);
    }

    #[test]
    fn test_connection_url_escapes_password() {
        let cluster = SqlCluster {
            id: "1".to_string(),
            name: "dev-shop".to_string(),
            state: "ACTIVE".to_string(),
            host: "gateway01.prod.aws.tidbcloud.com".to_string(),
            port: 4000,
            user_prefix: "2a0f".to_string(),
        };
        let url = connection_url(&cluster, "p@ss/word").unwrap();
        assert_eq!(url.username(), "2a0f.root");
        assert_eq!(url.password(), Some("p%40ss%2Fword"));
        assert_eq!(url.query(), Some("ssl-mode=required"));
    }
}
