use kube::Client;
use tracing::info;
use tracing_subscriber::EnvFilter;

use modelplane_operator::config::OperatorConfig;
use modelplane_operator::controller;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = OperatorConfig::from_env();
    info!(
        namespace = %config.namespace,
        jwks_enabled = config.jwks.enabled,
        "starting modelplane operator"
    );

    let client = Client::try_default().await?;
    controller::run(client, config).await
}
