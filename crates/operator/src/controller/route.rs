//! Reconciler for model routes. A route compiles into a single mesh virtual
//! service with two HTTP branches: an exact match on the prefix rewritten to
//! the model info endpoint, and a prefix match on `{prefix}/api` rewritten to
//! the model API. Targets that are not ready yet are skipped rather than
//! failing the whole route, and the route requeues quickly until every
//! declared target routes traffic.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Resource, ResourceExt};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::Context;
use crate::crd::deployment::{ModelDeployment, ModelDeploymentState};
use crate::crd::route::{
    ModelDeploymentTarget, ModelRoute, ModelRouteState, ModelRouteStatus, MAX_WEIGHT,
};
use crate::istio::{
    Destination, HeaderOperations, Headers, HttpMatchRequest, HttpRetry, HttpRoute,
    HttpRouteDestination, HttpRewrite, PortSelector, StringMatch, VirtualService,
    VirtualServiceSpec,
};
use crate::sync;

/// Headers stamped on proxied requests so models can tell which revision and
/// namespace served them.
pub const MODEL_REVISION_HEADER: &str = "knative-serving-revision";
pub const MODEL_NAMESPACE_HEADER: &str = "knative-serving-namespace";

const EDGE_GATEWAY: &str = "edge";
const INFO_REWRITE: &str = "/api/model/info";
const API_REWRITE: &str = "/api";

const RETRY_ATTEMPTS: i32 = 30;
const RETRY_PER_TRY_TIMEOUT: &str = "1s";
const RETRY_ON: &str = "5xx,connect-failure,refused-stream";

const REQUEUE_DELAY: Duration = Duration::from_secs(1);
const ERROR_REQUEUE_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to get model route: {0}")]
    GetRoute(#[source] kube::Error),
    #[error("failed to resolve target deployment: {0}")]
    GetDeployment(#[source] kube::Error),
    #[error("failed to sync virtual service: {0}")]
    SyncVirtualService(#[source] kube::Error),
    #[error("failed to update status: {0}")]
    UpdateStatus(#[source] kube::Error),
    #[error("failed to serialize synthesized object: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("object is missing {0}")]
    MissingObjectKey(&'static str),
}

/// What a declared target currently looks like in the cluster.
#[derive(Debug, Clone, PartialEq)]
pub enum TargetHealth {
    /// No such model deployment exists.
    Missing,
    /// The deployment exists but is not serving yet.
    NotReady,
    Ready { service_url: String, revision: String },
}

pub fn classify(md: Option<&ModelDeployment>) -> TargetHealth {
    let Some(md) = md else { return TargetHealth::Missing };
    let Some(status) = md.status.as_ref() else { return TargetHealth::NotReady };
    match (&status.state, &status.service_url) {
        (Some(ModelDeploymentState::Ready), Some(service_url)) if !service_url.is_empty() => {
            TargetHealth::Ready {
                service_url: service_url.clone(),
                revision: status.last_revision_name.clone().unwrap_or_default(),
            }
        }
        _ => TargetHealth::NotReady,
    }
}

fn destination(service_url: &str, revision: &str, namespace: &str, weight: i32) -> HttpRouteDestination {
    HttpRouteDestination {
        destination: Destination {
            host: service_url.to_string(),
            port: Some(PortSelector { number: 80 }),
        },
        weight,
        headers: Some(Headers {
            request: Some(HeaderOperations {
                add: BTreeMap::from([
                    (MODEL_REVISION_HEADER.to_string(), revision.to_string()),
                    (MODEL_NAMESPACE_HEADER.to_string(), namespace.to_string()),
                ]),
            }),
        }),
    }
}

/// Mirroring is best effort. A mirror that exists but is not serving yet
/// keeps the route retrying until traffic can be shadowed; a mirror that
/// does not exist at all is ignored and never blocks readiness.
pub fn plan_mirror(health: TargetHealth) -> (Option<Destination>, bool) {
    match health {
        TargetHealth::Ready { service_url, .. } => (
            Some(Destination { host: service_url, port: Some(PortSelector { number: 80 }) }),
            false,
        ),
        TargetHealth::NotReady => (None, true),
        TargetHealth::Missing => (None, false),
    }
}

/// Turns resolved targets into route destinations. Missing or not-ready
/// targets are skipped so healthy ones keep receiving traffic; the second
/// return value says whether a retry is needed to pick up the rest.
pub fn plan_destinations(
    resolved: &[(ModelDeploymentTarget, TargetHealth)],
    namespace: &str,
    route: &str,
) -> (Vec<HttpRouteDestination>, bool) {
    let mut destinations = Vec::new();
    let mut needs_retry = false;
    for (target, health) in resolved {
        match health {
            TargetHealth::Missing => {
                warn!(%route, target = %target.name, "target model deployment not found, skipping");
                needs_retry = true;
            }
            TargetHealth::NotReady => {
                info!(%route, target = %target.name, "target model deployment not ready yet, skipping");
                needs_retry = true;
            }
            TargetHealth::Ready { service_url, revision } => {
                destinations.push(destination(
                    service_url,
                    revision,
                    namespace,
                    target.weight.unwrap_or(MAX_WEIGHT),
                ));
            }
        }
    }
    (destinations, needs_retry)
}

pub fn build_virtual_service(
    route: &ModelRoute,
    namespace: &str,
    destinations: Vec<HttpRouteDestination>,
    mirror: Option<Destination>,
) -> Result<VirtualService, Error> {
    let owner = route.controller_owner_ref(&()).ok_or(Error::MissingObjectKey(".metadata.uid"))?;
    let retries = HttpRetry {
        attempts: RETRY_ATTEMPTS,
        per_try_timeout: RETRY_PER_TRY_TIMEOUT.to_string(),
        retry_on: RETRY_ON.to_string(),
    };
    let prefix = &route.spec.url_prefix;
    let info_branch = HttpRoute {
        matches: vec![HttpMatchRequest { uri: Some(StringMatch::Exact(prefix.clone())) }],
        rewrite: Some(HttpRewrite { uri: INFO_REWRITE.to_string() }),
        route: destinations.clone(),
        mirror: mirror.clone(),
        retries: Some(retries.clone()),
    };
    let api_branch = HttpRoute {
        matches: vec![HttpMatchRequest { uri: Some(StringMatch::Prefix(format!("{prefix}/api"))) }],
        rewrite: Some(HttpRewrite { uri: API_REWRITE.to_string() }),
        route: destinations,
        mirror,
        retries: Some(retries),
    };
    Ok(VirtualService {
        metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
            name: Some(route.name_any()),
            namespace: Some(namespace.to_string()),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: VirtualServiceSpec {
            hosts: vec!["*".to_string()],
            gateways: vec![EDGE_GATEWAY.to_string()],
            http: vec![info_branch, api_branch],
        },
    })
}

/// Synthesizes and syncs the virtual service. Returns whether the route
/// still needs a retry to cover all declared targets.
async fn reconcile_virtual_service(
    ctx: &Context,
    route: &ModelRoute,
    namespace: &str,
) -> Result<bool, Error> {
    let name = route.name_any();
    let md_api: Api<ModelDeployment> = Api::namespaced(ctx.client.clone(), namespace);

    let mut resolved = Vec::with_capacity(route.spec.model_deployment_targets.len());
    for target in &route.spec.model_deployment_targets {
        let md = md_api.get_opt(&target.name).await.map_err(Error::GetDeployment)?;
        resolved.push((target.clone(), classify(md.as_ref())));
    }
    let (destinations, mut needs_retry) = plan_destinations(&resolved, namespace, &name);

    if destinations.is_empty() {
        info!(route = %name, "no ready targets, leaving virtual service untouched");
        return Ok(true);
    }

    let mirror = match route.spec.mirror.as_deref().filter(|m| !m.is_empty()) {
        None => None,
        Some(mirror_name) => {
            let md = md_api.get_opt(mirror_name).await.map_err(Error::GetDeployment)?;
            let health = classify(md.as_ref());
            match &health {
                TargetHealth::Missing => {
                    warn!(route = %name, mirror = %mirror_name, "mirror deployment not found, mirroring disabled");
                }
                TargetHealth::NotReady => {
                    info!(route = %name, mirror = %mirror_name, "mirror not ready yet");
                }
                TargetHealth::Ready { .. } => {}
            }
            let (destination, retry) = plan_mirror(health);
            needs_retry |= retry;
            destination
        }
    };

    let mut vs = build_virtual_service(route, namespace, destinations, mirror)?;
    sync::store_hash(&mut vs)?;
    let vs_api: Api<VirtualService> = Api::namespaced(ctx.client.clone(), namespace);
    sync::sync_resource(&vs_api, &vs).await.map_err(Error::SyncVirtualService)?;
    Ok(needs_retry)
}

pub async fn reconcile(route: Arc<ModelRoute>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = route.name_any();
    let namespace = route.namespace().ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let route_api: Api<ModelRoute> = Api::namespaced(ctx.client.clone(), &namespace);

    let route = match route_api.get_opt(&name).await.map_err(Error::GetRoute)? {
        Some(route) => route,
        None => {
            debug!(route = %name, "model route is gone, nothing to reconcile");
            return Ok(Action::await_change());
        }
    };

    debug!(route = %name, "reconciling model route");
    let needs_retry = reconcile_virtual_service(&ctx, &route, &namespace).await?;

    let status = ModelRouteStatus {
        edge_url: Some(format!("{}{}", ctx.config.edge_host, route.spec.url_prefix)),
        state: Some(if needs_retry { ModelRouteState::Processing } else { ModelRouteState::Ready }),
    };
    let patch = serde_json::json!({ "status": status });
    route_api
        .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .map_err(Error::UpdateStatus)?;

    if needs_retry {
        Ok(Action::requeue(REQUEUE_DELAY))
    } else {
        info!(route = %name, "model route is ready");
        Ok(Action::await_change())
    }
}

pub fn error_policy(route: Arc<ModelRoute>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(route = %route.name_any(), %error, "reconcile failed, backing off");
    Action::requeue(ERROR_REQUEUE_DELAY)
}

pub async fn run(ctx: Arc<Context>) {
    let client = ctx.client.clone();
    let namespace = ctx.config.namespace.clone();
    let routes = Api::<ModelRoute>::namespaced(client.clone(), &namespace);

    Controller::new(routes, watcher::Config::default())
        .owns(
            Api::<VirtualService>::namespaced(client.clone(), &namespace),
            watcher::Config::default(),
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((object, _)) => debug!(object = %object.name, "reconciled model route"),
                Err(error) => warn!(%error, "model route reconcile failed"),
            }
        })
        .await;
}
