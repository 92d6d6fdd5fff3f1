pub mod deployment;
pub mod pull_secret;
pub mod route;

use std::sync::Arc;

use kube::Client;

use crate::config::OperatorConfig;
use crate::connection::{ConnectionStore, HttpConnectionStore};
use crate::registry::{HttpTokenIssuer, RegistryTokenIssuer};

/// Label stamped on every generated child so events on objects the substrate
/// creates on our behalf (deployments, revisions, endpoints) can be traced
/// back to the owning model deployment.
pub const MODEL_NAME_LABEL: &str = "modelplane.org/model-name";

/// Annotation on a default route recording which serving revision it was
/// synthesized against.
pub const LATEST_READY_REVISION_ANNOTATION: &str = "modelplane.org/latest-ready-revision";

/// Shared state handed to every reconcile invocation.
pub struct Context {
    pub client: Client,
    pub config: OperatorConfig,
    pub connections: Arc<dyn ConnectionStore>,
    pub issuer: Arc<dyn RegistryTokenIssuer>,
}

/// Starts the deployment and route controllers and runs them to completion.
/// Composition is explicit: everything a reconciler needs arrives through
/// the context, and adding a controller means adding it here.
pub async fn run(client: Client, config: OperatorConfig) -> anyhow::Result<()> {
    let connections: Arc<dyn ConnectionStore> =
        Arc::new(HttpConnectionStore::new(&config.api_url, &config.api_token));
    let issuer: Arc<dyn RegistryTokenIssuer> =
        Arc::new(HttpTokenIssuer::new(&config.api_url, &config.api_token));
    let ctx = Arc::new(Context { client, config, connections, issuer });

    futures::join!(deployment::run(ctx.clone()), route::run(ctx));
    Ok(())
}
