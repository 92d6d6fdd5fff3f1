//! Image pull credential sync. A deployment that references a registry
//! connection gets a dockercfg secret and a service account wired to it; the
//! serving revision then pulls through that account. Static docker
//! credentials are written as-is, expiring cloud registry tokens are
//! re-issued on a refresh clock recorded in the deployment's status.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use k8s_openapi::api::core::v1::{LocalObjectReference, Secret, ServiceAccount};
use k8s_openapi::ByteString;
use kube::api::{Api, Patch, PatchParams};
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::deployment::{owner_ref, Error};
use super::Context;
use crate::connection::{ConnectionKind, ConnectionSpec};
use crate::crd::deployment::ModelDeployment;
use crate::registry::registry_host;
use crate::sync;

pub const DOCKER_CONFIG_SECRET_KEY: &str = ".dockercfg";
const DOCKER_CONFIG_SECRET_TYPE: &str = "kubernetes.io/dockercfg";

pub fn pull_secret_name(model: &str) -> String {
    format!("{model}-registry")
}

/// One entry of a legacy dockercfg payload, keyed by registry host.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DockerCredentials {
    pub email: String,
    pub username: String,
    pub password: String,
}

/// An issued token is refreshed once its age reaches the refresh period.
/// A status without a rotation timestamp always refreshes.
pub fn needs_token_refresh(
    last_updated: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    refresh_period: ChronoDuration,
) -> bool {
    match last_updated {
        None => true,
        Some(last) => now.signed_duration_since(last) >= refresh_period,
    }
}

pub fn build_pull_secret(
    md: &ModelDeployment,
    namespace: &str,
    registry: &str,
    creds: &DockerCredentials,
) -> Result<Secret, Error> {
    let dockercfg = BTreeMap::from([(registry.to_string(), creds.clone())]);
    let payload = serde_json::to_vec(&dockercfg)?;
    Ok(Secret {
        metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
            name: Some(pull_secret_name(&md.name_any())),
            namespace: Some(namespace.to_string()),
            owner_references: Some(vec![owner_ref(md)?]),
            ..Default::default()
        },
        type_: Some(DOCKER_CONFIG_SECRET_TYPE.to_string()),
        data: Some(BTreeMap::from([(
            DOCKER_CONFIG_SECRET_KEY.to_string(),
            ByteString(payload),
        )])),
        ..Secret::default()
    })
}

pub fn build_service_account(
    md: &ModelDeployment,
    namespace: &str,
) -> Result<ServiceAccount, Error> {
    Ok(ServiceAccount {
        metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
            name: Some(pull_secret_name(&md.name_any())),
            namespace: Some(namespace.to_string()),
            owner_references: Some(vec![owner_ref(md)?]),
            ..Default::default()
        },
        image_pull_secrets: Some(vec![LocalObjectReference {
            name: pull_secret_name(&md.name_any()),
        }]),
        ..ServiceAccount::default()
    })
}

async fn sync_docker_credentials(
    ctx: &Context,
    md: &ModelDeployment,
    namespace: &str,
    conn: &ConnectionSpec,
    creds: DockerCredentials,
) -> Result<(), Error> {
    let registry = registry_host(&conn.uri).map_err(Error::RegistryUri)?;

    let mut secret = build_pull_secret(md, namespace, &registry, &creds)?;
    sync::store_hash(&mut secret)?;
    let secret_api: Api<Secret> = Api::namespaced(ctx.client.clone(), namespace);
    sync::sync_resource(&secret_api, &secret).await.map_err(Error::SyncSecret)?;

    let mut account = build_service_account(md, namespace)?;
    sync::store_hash(&mut account)?;
    let sa_api: Api<ServiceAccount> = Api::namespaced(ctx.client.clone(), namespace);
    sync::sync_resource(&sa_api, &account).await.map_err(Error::SyncServiceAccount)?;
    Ok(())
}

/// Entry point called from the deployment reconciler. No-op when the
/// deployment does not reference a pull connection.
pub async fn reconcile_pull_connection(
    ctx: &Context,
    md: &ModelDeployment,
    namespace: &str,
) -> Result<(), Error> {
    let Some(conn_id) =
        md.spec.image_pull_connection_id.as_deref().filter(|id| !id.is_empty())
    else {
        debug!(model = %md.name_any(), "no pull connection, skipping credential sync");
        return Ok(());
    };

    let connection = ctx.connections.get(conn_id).await.map_err(Error::Connection)?;
    match connection.spec.kind {
        ConnectionKind::Docker => {
            let creds = DockerCredentials {
                email: String::new(),
                username: connection.spec.username.clone(),
                password: connection.spec.password.clone(),
            };
            sync_docker_credentials(ctx, md, namespace, &connection.spec, creds).await
        }
        ConnectionKind::Ecr => {
            let refresh_period = ChronoDuration::from_std(ctx.config.creds_refresh_period)
                .unwrap_or_else(|_| ChronoDuration::hours(6));
            let last = md.status.as_ref().and_then(|s| s.last_creds_updated_time);
            if !needs_token_refresh(last, Utc::now(), refresh_period) {
                debug!(model = %md.name_any(), "registry token still fresh");
                return Ok(());
            }

            let (username, password) =
                ctx.issuer.issue(&connection.spec).await.map_err(Error::IssueToken)?;
            info!(model = %md.name_any(), connection = %conn_id, "registry token rotated");
            let creds = DockerCredentials { email: String::new(), username, password };
            sync_docker_credentials(ctx, md, namespace, &connection.spec, creds).await?;

            let api: Api<ModelDeployment> = Api::namespaced(ctx.client.clone(), namespace);
            let patch = serde_json::json!({ "status": { "lastCredsUpdatedTime": Utc::now() } });
            api.patch_status(&md.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
                .await
                .map_err(Error::UpdateStatus)?;
            Ok(())
        }
        ConnectionKind::Unknown => Err(Error::UnsupportedConnectionKind(conn_id.to_string())),
    }
}
