use anyhow::Context as _;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::connection::ConnectionSpec;

/// Issues short-lived registry credentials for connections whose tokens
/// expire (cloud registries). The issuing protocol itself lives behind the
/// platform API; the operator treats it as a black box that may fail.
#[async_trait]
pub trait RegistryTokenIssuer: Send + Sync {
    async fn issue(&self, conn: &ConnectionSpec) -> anyhow::Result<(String, String)>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenRequest<'a> {
    uri: &'a str,
    key_id: &'a str,
    key_secret: &'a str,
    region: &'a str,
}

#[derive(Deserialize)]
struct TokenResponse {
    username: String,
    password: String,
}

pub struct HttpTokenIssuer {
    base_url: String,
    token: String,
    client: reqwest::Client,
}

impl HttpTokenIssuer {
    pub fn new(base_url: &str, token: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl RegistryTokenIssuer for HttpTokenIssuer {
    async fn issue(&self, conn: &ConnectionSpec) -> anyhow::Result<(String, String)> {
        let url = format!("{}/api/v1/registry/token", self.base_url);
        let request = TokenRequest {
            uri: &conn.uri,
            key_id: &conn.key_id,
            key_secret: &conn.key_secret,
            region: &conn.region,
        };
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&request)
            .send()
            .await
            .with_context(|| format!("requesting registry token for {}", conn.uri))?;
        if !response.status().is_success() {
            anyhow::bail!("token API returned {} for {}", response.status(), conn.uri);
        }
        let body: TokenResponse =
            response.json().await.with_context(|| format!("decoding token for {}", conn.uri))?;
        Ok((body.username, body.password))
    }
}

/// Registry URIs are stored without a scheme; prepend one so the URL parser
/// accepts them, then keep host and port for the dockercfg key.
pub fn registry_host(uri: &str) -> anyhow::Result<String> {
    let parsed = url::Url::parse(&format!("https://{uri}"))
        .with_context(|| format!("parsing registry URI {uri}"))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("registry URI {uri} has no host"))?;
    Ok(match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_is_extracted() {
        assert_eq!(registry_host("registry.example.com/team/repo").unwrap(), "registry.example.com");
    }

    #[test]
    fn port_is_preserved() {
        assert_eq!(registry_host("localhost:5000/repo").unwrap(), "localhost:5000");
    }

    #[test]
    fn empty_uri_is_an_error() {
        assert!(registry_host("").is_err());
    }
}
