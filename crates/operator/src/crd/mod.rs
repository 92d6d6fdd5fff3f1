pub mod deployment;
pub mod route;

use async_trait::async_trait;
use kube::Api;
use std::fmt;

use deployment::ModelDeployment;

/// Accumulates every violation found during admission validation so a caller
/// sees all problems at once instead of fixing them one by one.
#[derive(Debug, Default)]
pub struct ValidationErrors(Vec<String>);

impl ValidationErrors {
    pub fn push(&mut self, message: impl Into<String>) {
        self.0.push(message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn messages(&self) -> &[String] {
        &self.0
    }

    pub fn into_result(self) -> Result<(), ValidationErrors> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("; "))
    }
}

impl std::error::Error for ValidationErrors {}

/// Looks up a referenced model deployment during route validation. The
/// admission path binds this to the cluster; tests use an in-memory map.
#[async_trait]
pub trait DeploymentResolver: Send + Sync {
    async fn resolve(&self, name: &str) -> anyhow::Result<Option<ModelDeployment>>;
}

/// Cluster-backed resolver used by the admission layer.
pub struct KubeDeploymentResolver {
    api: Api<ModelDeployment>,
}

impl KubeDeploymentResolver {
    pub fn new(client: kube::Client, namespace: &str) -> Self {
        Self { api: Api::namespaced(client, namespace) }
    }
}

#[async_trait]
impl DeploymentResolver for KubeDeploymentResolver {
    async fn resolve(&self, name: &str) -> anyhow::Result<Option<ModelDeployment>> {
        Ok(self.api.get_opt(name).await?)
    }
}
