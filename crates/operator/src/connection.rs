use anyhow::Context as _;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Registry connection kinds the operator knows how to turn into pull
/// credentials. Anything else deserializes to `Unknown` and fails the
/// reconcile as a hard error.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    Docker,
    Ecr,
    #[serde(other)]
    Unknown,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSpec {
    #[serde(rename = "type")]
    pub kind: ConnectionKind,
    /// Registry URI without a scheme, for example `registry.example.com/team`.
    pub uri: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub key_id: String,
    #[serde(default)]
    pub key_secret: String,
    #[serde(default)]
    pub region: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Connection {
    pub id: String,
    pub spec: ConnectionSpec,
}

/// Access to stored registry connections. The platform API owns them; the
/// operator only reads.
#[async_trait]
pub trait ConnectionStore: Send + Sync {
    async fn get(&self, id: &str) -> anyhow::Result<Connection>;
}

/// Connection store backed by the platform REST API.
pub struct HttpConnectionStore {
    base_url: String,
    token: String,
    client: reqwest::Client,
}

impl HttpConnectionStore {
    pub fn new(base_url: &str, token: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ConnectionStore for HttpConnectionStore {
    async fn get(&self, id: &str) -> anyhow::Result<Connection> {
        let url = format!("{}/api/v1/connection/{id}", self.base_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .with_context(|| format!("requesting connection {id}"))?;
        if !response.status().is_success() {
            anyhow::bail!("connection API returned {} for {id}", response.status());
        }
        response.json().await.with_context(|| format!("decoding connection {id}"))
    }
}
