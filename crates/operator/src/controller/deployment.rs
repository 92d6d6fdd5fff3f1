//! Reconciler for model deployments. Each tick synthesizes the full child
//! set (serving configuration, default route, plain service, optional pull
//! credentials and auth policy), pushes it through the change-suppression
//! layer, and derives the deployment's status from the backing replica set.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment as KubeDeployment;
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, Endpoints, HTTPGetAction, Probe, ResourceRequirements, Secret,
    Service, ServiceAccount, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::{Resource, ResourceExt};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::{pull_secret, Context, LATEST_READY_REVISION_ANNOTATION, MODEL_NAME_LABEL};
use crate::config::JwksConfig;
use crate::crd::deployment::{
    default_resources, ModelDeployment, ModelDeploymentState, ModelDeploymentStatus,
    ModelResources, ResourceList, DEFAULT_MAX_REPLICAS, DEFAULT_MIN_REPLICAS,
    DEFAULT_PROBE_INITIAL_DELAY,
};
use crate::crd::route::{
    ModelDeploymentTarget, ModelRoute, ModelRouteSpec, MAX_WEIGHT, SKIP_URL_VALIDATION_ANNOTATION,
    SKIP_URL_VALIDATION_VALUE,
};
use crate::crd::ValidationErrors;
use crate::istio::{
    Jwt, JwtTriggerRule, OriginAuthenticationMethod, Policy, PolicySpec, StringMatch,
    TargetSelector,
};
use crate::knative::{
    Configuration, ConfigurationSpec, Revision, RevisionPodSpec, RevisionTemplate, TemplateMeta,
    CONFIGURATION_GENERATION_LABEL,
};
use crate::sync;

/// Port every model container is expected to listen on.
pub const MODEL_PORT: i32 = 5000;
pub const HEALTHCHECK_PATH: &str = "/healthcheck";
/// Port the serving substrate's sidecar proxies model traffic through.
pub const PROXY_PORT: i32 = 8012;

const AUTOSCALING_TARGET_ANNOTATION: &str = "autoscaling.knative.dev/target";
const AUTOSCALING_CLASS_ANNOTATION: &str = "autoscaling.knative.dev/class";
const AUTOSCALING_METRIC_ANNOTATION: &str = "autoscaling.knative.dev/metric";
const AUTOSCALING_MIN_SCALE_ANNOTATION: &str = "autoscaling.knative.dev/minScale";
const AUTOSCALING_MAX_SCALE_ANNOTATION: &str = "autoscaling.knative.dev/maxScale";
const AUTOSCALING_TARGET: &str = "10";
const AUTOSCALING_CLASS: &str = "kpa.autoscaling.knative.dev";
const AUTOSCALING_METRIC: &str = "concurrency";

const REVISION_TIMEOUT_SECONDS: i64 = 15;

/// Only model invocations require a JWT; healthcheck and info stay open.
const AUTH_INCLUDED_PATH: &str = "/api/model/invoke";

const FOREGROUND_DELETION_FINALIZER: &str = "foregroundDeletion";

const REQUEUE_DELAY: Duration = Duration::from_secs(10);
const ERROR_REQUEUE_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to get model deployment: {0}")]
    GetDeployment(#[source] kube::Error),
    #[error("failed to sync authentication policy: {0}")]
    SyncPolicy(#[source] kube::Error),
    #[error("failed to sync serving configuration: {0}")]
    SyncConfiguration(#[source] kube::Error),
    #[error("failed to sync default route: {0}")]
    SyncRoute(#[source] kube::Error),
    #[error("failed to sync model service: {0}")]
    SyncService(#[source] kube::Error),
    #[error("failed to sync model endpoints: {0}")]
    SyncEndpoints(#[source] kube::Error),
    #[error("failed to sync pull secret: {0}")]
    SyncSecret(#[source] kube::Error),
    #[error("failed to sync service account: {0}")]
    SyncServiceAccount(#[source] kube::Error),
    #[error("failed to update status: {0}")]
    UpdateStatus(#[source] kube::Error),
    #[error("failed to clean up old revisions: {0}")]
    CleanupRevisions(#[source] kube::Error),
    #[error("failed to resolve pull connection: {0}")]
    Connection(#[source] anyhow::Error),
    #[error("failed to issue registry token: {0}")]
    IssueToken(#[source] anyhow::Error),
    #[error("failed to parse registry URI: {0}")]
    RegistryUri(#[source] anyhow::Error),
    #[error("connection {0} has an unsupported type")]
    UnsupportedConnectionKind(String),
    #[error("failed to serialize synthesized object: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("object is missing {0}")]
    MissingObjectKey(&'static str),
}

pub(crate) fn owner_ref(md: &ModelDeployment) -> Result<OwnerReference, Error> {
    md.controller_owner_ref(&()).ok_or(Error::MissingObjectKey(".metadata.uid"))
}

fn child_meta(md: &ModelDeployment, namespace: &str) -> Result<ObjectMeta, Error> {
    Ok(ObjectMeta {
        name: Some(md.name_any()),
        namespace: Some(namespace.to_string()),
        labels: Some(BTreeMap::from([(MODEL_NAME_LABEL.to_string(), md.name_any())])),
        owner_references: Some(vec![owner_ref(md)?]),
        ..ObjectMeta::default()
    })
}

fn probe(path: &str, initial_delay: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::Int(MODEL_PORT),
            ..HTTPGetAction::default()
        }),
        initial_delay_seconds: Some(initial_delay),
        period_seconds: Some(1),
        timeout_seconds: Some(1),
        failure_threshold: Some(15),
        ..Probe::default()
    }
}

fn quantities(list: Option<&ResourceList>) -> Option<BTreeMap<String, Quantity>> {
    let list = list?;
    let mut out = BTreeMap::new();
    if let Some(cpu) = &list.cpu {
        out.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if let Some(memory) = &list.memory {
        out.insert("memory".to_string(), Quantity(memory.clone()));
    }
    (!out.is_empty()).then_some(out)
}

pub fn to_k8s_resources(resources: &ModelResources) -> ResourceRequirements {
    ResourceRequirements {
        requests: quantities(resources.requests.as_ref()),
        limits: quantities(resources.limits.as_ref()),
        ..ResourceRequirements::default()
    }
}

pub fn build_model_container(md: &ModelDeployment) -> Container {
    let resources = md.spec.resources.clone().unwrap_or_else(default_resources);
    let liveness_delay =
        md.spec.liveness_probe_initial_delay.unwrap_or(DEFAULT_PROBE_INITIAL_DELAY);
    let readiness_delay =
        md.spec.readiness_probe_initial_delay.unwrap_or(DEFAULT_PROBE_INITIAL_DELAY);
    Container {
        name: "model".to_string(),
        image: Some(md.spec.image.clone()),
        ports: Some(vec![ContainerPort {
            name: Some("http1".to_string()),
            container_port: MODEL_PORT,
            protocol: Some("TCP".to_string()),
            ..ContainerPort::default()
        }]),
        liveness_probe: Some(probe(HEALTHCHECK_PATH, liveness_delay)),
        readiness_probe: Some(probe(HEALTHCHECK_PATH, readiness_delay)),
        resources: Some(to_k8s_resources(&resources)),
        ..Container::default()
    }
}

/// Synthesizes the serving configuration for a model. The revision template
/// carries the autoscaling annotations and the model-name label so every
/// revision and pod the substrate creates is traceable to the deployment.
pub fn build_configuration(
    md: &ModelDeployment,
    namespace: &str,
    service_account: Option<String>,
) -> Result<Configuration, Error> {
    let min_replicas = md.spec.min_replicas.unwrap_or(DEFAULT_MIN_REPLICAS);
    let max_replicas = md.spec.max_replicas.unwrap_or(DEFAULT_MAX_REPLICAS);
    let annotations = BTreeMap::from([
        (AUTOSCALING_TARGET_ANNOTATION.to_string(), AUTOSCALING_TARGET.to_string()),
        (AUTOSCALING_CLASS_ANNOTATION.to_string(), AUTOSCALING_CLASS.to_string()),
        (AUTOSCALING_METRIC_ANNOTATION.to_string(), AUTOSCALING_METRIC.to_string()),
        (AUTOSCALING_MIN_SCALE_ANNOTATION.to_string(), min_replicas.to_string()),
        (AUTOSCALING_MAX_SCALE_ANNOTATION.to_string(), max_replicas.to_string()),
    ]);
    Ok(Configuration {
        metadata: child_meta(md, namespace)?,
        spec: ConfigurationSpec {
            template: RevisionTemplate {
                metadata: TemplateMeta {
                    labels: BTreeMap::from([(MODEL_NAME_LABEL.to_string(), md.name_any())]),
                    annotations,
                },
                spec: RevisionPodSpec {
                    service_account_name: service_account,
                    timeout_seconds: Some(REVISION_TIMEOUT_SECONDS),
                    containers: vec![build_model_container(md)],
                },
            },
        },
        status: None,
    })
}

/// Every deployment gets a single-target route under the reserved `/model`
/// prefix. The skip-validation annotation exempts it from the reserved-prefix
/// check that applies to user-authored routes.
pub fn build_default_route(
    md: &ModelDeployment,
    namespace: &str,
    latest_ready: &str,
) -> Result<ModelRoute, Error> {
    let mut meta = child_meta(md, namespace)?;
    meta.annotations = Some(BTreeMap::from([
        (SKIP_URL_VALIDATION_ANNOTATION.to_string(), SKIP_URL_VALIDATION_VALUE.to_string()),
        (LATEST_READY_REVISION_ANNOTATION.to_string(), latest_ready.to_string()),
    ]));
    Ok(ModelRoute {
        metadata: meta,
        spec: ModelRouteSpec {
            url_prefix: format!("/model/{}", md.name_any()),
            mirror: None,
            model_deployment_targets: vec![ModelDeploymentTarget {
                name: md.name_any(),
                weight: Some(MAX_WEIGHT),
            }],
        },
        status: None,
    })
}

/// JWT authentication policy scoped to this model's pods via the model-name
/// label. Only the invocation path requires a token, which keeps probes, the
/// healthcheck and the info endpoint reachable.
pub fn build_auth_policy(
    md: &ModelDeployment,
    namespace: &str,
    jwks: &JwksConfig,
) -> Result<Policy, Error> {
    Ok(Policy {
        metadata: child_meta(md, namespace)?,
        spec: PolicySpec {
            targets: vec![TargetSelector {
                name: md.name_any(),
                labels: BTreeMap::from([(MODEL_NAME_LABEL.to_string(), md.name_any())]),
            }],
            origins: vec![OriginAuthenticationMethod {
                jwt: Jwt {
                    issuer: jwks.issuer.clone(),
                    jwks_uri: jwks.jwks_url.clone(),
                    trigger_rules: vec![JwtTriggerRule {
                        included_paths: vec![StringMatch::Prefix(AUTH_INCLUDED_PATH.to_string())],
                    }],
                },
            }],
            principal_binding: "USE_ORIGIN".to_string(),
        },
    })
}

/// Plain service in front of the model, selector-less: endpoints are copied
/// from the ready revision so in-cluster callers bypass the activator.
pub fn build_service(md: &ModelDeployment, namespace: &str) -> Result<Service, Error> {
    Ok(Service {
        metadata: child_meta(md, namespace)?,
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                port: 80,
                protocol: Some("TCP".to_string()),
                target_port: Some(IntOrString::Int(PROXY_PORT)),
                ..ServicePort::default()
            }]),
            ..ServiceSpec::default()
        }),
        status: None,
    })
}

pub fn build_endpoints(
    md: &ModelDeployment,
    namespace: &str,
    subsets: Option<Vec<k8s_openapi::api::core::v1::EndpointSubset>>,
) -> Result<Endpoints, Error> {
    Ok(Endpoints { metadata: child_meta(md, namespace)?, subsets })
}

/// A configuration is ready once the substrate reports a latest ready
/// revision that has caught up with the latest created one.
pub fn configuration_ready(cfg: &Configuration) -> Option<String> {
    let status = cfg.status.as_ref()?;
    let ready = status.latest_ready_revision_name.as_deref().filter(|r| !r.is_empty())?;
    match status.latest_created_revision_name.as_deref() {
        Some(created) if created != ready => None,
        _ => Some(ready.to_string()),
    }
}

/// The substrate names the backing deployment after the revision.
pub fn backing_deployment_name(revision: &str) -> String {
    format!("{revision}-deployment")
}

pub fn replicas_converged(status: &k8s_openapi::api::apps::v1::DeploymentStatus) -> bool {
    status.replicas.unwrap_or(0) == status.available_replicas.unwrap_or(0)
}

/// What a reconcile tick should do, derived purely from what the cluster
/// reports. The default route, service and endpoints are only synthesized
/// once the configuration has a ready revision.
#[derive(Debug, Clone, PartialEq)]
pub enum TickPhase {
    /// No ready revision yet: the configuration is the only child.
    AwaitRevision,
    Synthesize { latest_ready: String, rollout: Rollout },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rollout {
    /// The substrate has not created the revision's deployment yet.
    AwaitBackingDeployment,
    /// The backing deployment exists but replicas lag behind.
    Converging,
    Converged,
}

pub fn tick_phase(
    configuration: Option<&Configuration>,
    backing: Option<&KubeDeployment>,
) -> TickPhase {
    let Some(latest_ready) = configuration.and_then(configuration_ready) else {
        return TickPhase::AwaitRevision;
    };
    let rollout = match backing {
        None => Rollout::AwaitBackingDeployment,
        Some(deployment) => {
            let status = deployment.status.clone().unwrap_or_default();
            if replicas_converged(&status) {
                Rollout::Converged
            } else {
                Rollout::Converging
            }
        }
    };
    TickPhase::Synthesize { latest_ready, rollout }
}

/// Admission defaults and checks applied before any synthesis. An invalid
/// spec parks the deployment in the Failed state instead of producing
/// children from garbage values.
fn validated(md: &ModelDeployment, default_role: &str) -> Result<ModelDeployment, ValidationErrors> {
    let mut validated = md.clone();
    validated.validate_and_set_defaults(default_role)?;
    Ok(validated)
}

fn status_for(
    md: &ModelDeployment,
    state: ModelDeploymentState,
    latest_ready: Option<&str>,
    namespace: &str,
) -> ModelDeploymentStatus {
    let mut status = md.status.clone().unwrap_or_default();
    status.state = Some(state);
    if let Some(revision) = latest_ready.filter(|r| !r.is_empty()) {
        status.service_url =
            Some(format!("{}.{}.svc.cluster.local", md.name_any(), namespace));
        status.last_revision_name = Some(revision.to_string());
    }
    status
}

async fn patch_status(
    api: &Api<ModelDeployment>,
    name: &str,
    status: &ModelDeploymentStatus,
) -> Result<(), Error> {
    let patch = serde_json::json!({ "status": status });
    api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .map_err(Error::UpdateStatus)?;
    Ok(())
}

fn revision_generation(revision: &Revision) -> Option<i64> {
    revision.labels().get(CONFIGURATION_GENERATION_LABEL)?.parse().ok()
}

/// Deletes revisions of this model older than the latest ready one, compared
/// by the substrate's configuration-generation label. Revisions without the
/// label are left alone.
async fn cleanup_old_revisions(
    client: &kube::Client,
    namespace: &str,
    model: &str,
    latest_ready: &str,
) -> Result<(), Error> {
    let api: Api<Revision> = Api::namespaced(client.clone(), namespace);
    let latest = match api.get_opt(latest_ready).await.map_err(Error::CleanupRevisions)? {
        Some(revision) => revision,
        None => return Ok(()),
    };
    let Some(latest_generation) = revision_generation(&latest) else {
        warn!(%model, revision = %latest_ready, "latest revision has no generation label");
        return Ok(());
    };

    let selector = format!("{MODEL_NAME_LABEL}={model}");
    let revisions =
        api.list(&ListParams::default().labels(&selector)).await.map_err(Error::CleanupRevisions)?;
    for revision in revisions {
        let name = revision.name_any();
        let Some(generation) = revision_generation(&revision) else {
            warn!(%model, revision = %name, "revision has no generation label, skipping");
            continue;
        };
        if generation < latest_generation {
            info!(%model, revision = %name, "deleting superseded revision");
            api.delete(&name, &DeleteParams::default()).await.map_err(Error::CleanupRevisions)?;
        }
    }
    Ok(())
}

/// Services need their cluster IP carried over on replace; the API server
/// rejects an update that clears the immutable field.
async fn sync_service(api: &Api<Service>, candidate: &mut Service) -> Result<(), Error> {
    if let Some(found) = api.get_opt(&candidate.name_any()).await.map_err(Error::SyncService)? {
        let found_spec = found.spec.clone().unwrap_or_default();
        if let Some(spec) = candidate.spec.as_mut() {
            spec.cluster_ip = found_spec.cluster_ip;
            spec.cluster_ips = found_spec.cluster_ips;
        }
    }
    sync::store_hash(candidate)?;
    sync::sync_resource(api, candidate).await.map_err(Error::SyncService)?;
    Ok(())
}

/// Copies the endpoints of the ready revision's substrate-managed service
/// into the model's own service. Best effort: the revision endpoints may not
/// exist yet.
async fn sync_endpoints(
    client: &kube::Client,
    md: &ModelDeployment,
    namespace: &str,
    latest_ready: &str,
) -> Result<(), Error> {
    let api: Api<Endpoints> = Api::namespaced(client.clone(), namespace);
    let revision_endpoints = match api.get_opt(latest_ready).await.map_err(Error::SyncEndpoints)? {
        Some(endpoints) => endpoints,
        None => {
            debug!(model = %md.name_any(), revision = %latest_ready, "revision endpoints not published yet");
            return Ok(());
        }
    };
    let mut endpoints = build_endpoints(md, namespace, revision_endpoints.subsets)?;
    sync::store_hash(&mut endpoints)?;
    sync::sync_resource(&api, &endpoints).await.map_err(Error::SyncEndpoints)?;
    Ok(())
}

pub async fn reconcile(md: Arc<ModelDeployment>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = md.name_any();
    let namespace = md.namespace().ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let md_api: Api<ModelDeployment> = Api::namespaced(ctx.client.clone(), &namespace);

    // Re-read the object: the watch event may be stale by the time the
    // reconcile runs.
    let md = match md_api.get_opt(&name).await.map_err(Error::GetDeployment)? {
        Some(md) => md,
        None => {
            debug!(model = %name, "model deployment is gone, nothing to reconcile");
            return Ok(Action::await_change());
        }
    };

    if md.finalizers().iter().any(|f| f == FOREGROUND_DELETION_FINALIZER) {
        info!(model = %name, "cascading deletion in progress, skipping reconcile");
        return Ok(Action::await_change());
    }

    debug!(model = %name, "reconciling model deployment");

    // Defaults resolved here feed every builder below.
    let md = match validated(&md, &ctx.config.default_role_name) {
        Ok(md) => md,
        Err(error) => {
            warn!(model = %name, %error, "model deployment spec is invalid");
            let status = status_for(&md, ModelDeploymentState::Failed, None, &namespace);
            patch_status(&md_api, &name, &status).await?;
            return Ok(Action::await_change());
        }
    };

    pull_secret::reconcile_pull_connection(&ctx, &md, &namespace).await?;

    if ctx.config.jwks.enabled {
        let policy_api: Api<Policy> = Api::namespaced(ctx.client.clone(), &namespace);
        let mut policy = build_auth_policy(&md, &namespace, &ctx.config.jwks)?;
        sync::store_hash(&mut policy)?;
        sync::sync_resource(&policy_api, &policy).await.map_err(Error::SyncPolicy)?;
    }

    let service_account = md
        .spec
        .image_pull_connection_id
        .as_deref()
        .filter(|id| !id.is_empty())
        .map(|_| pull_secret::pull_secret_name(&name));

    let cfg_api: Api<Configuration> = Api::namespaced(ctx.client.clone(), &namespace);
    let mut configuration = build_configuration(&md, &namespace, service_account)?;
    sync::store_hash(&mut configuration)?;
    sync::sync_resource(&cfg_api, &configuration).await.map_err(Error::SyncConfiguration)?;

    let observed = cfg_api.get_opt(&name).await.map_err(Error::SyncConfiguration)?;
    let deployment_api: Api<KubeDeployment> = Api::namespaced(ctx.client.clone(), &namespace);
    let backing = match observed.as_ref().and_then(configuration_ready) {
        Some(revision) => deployment_api
            .get_opt(&backing_deployment_name(&revision))
            .await
            .map_err(Error::GetDeployment)?,
        None => None,
    };

    let TickPhase::Synthesize { latest_ready, rollout } =
        tick_phase(observed.as_ref(), backing.as_ref())
    else {
        info!(model = %name, "serving configuration has no ready revision yet");
        let status = status_for(&md, ModelDeploymentState::Processing, None, &namespace);
        patch_status(&md_api, &name, &status).await?;
        return Ok(Action::requeue(REQUEUE_DELAY));
    };

    let route_api: Api<ModelRoute> = Api::namespaced(ctx.client.clone(), &namespace);
    let mut route = build_default_route(&md, &namespace, &latest_ready)?;
    sync::store_hash(&mut route)?;
    sync::sync_resource(&route_api, &route).await.map_err(Error::SyncRoute)?;

    let service_api: Api<Service> = Api::namespaced(ctx.client.clone(), &namespace);
    let mut service = build_service(&md, &namespace)?;
    sync_service(&service_api, &mut service).await?;

    if let Err(error) = sync_endpoints(&ctx.client, &md, &namespace, &latest_ready).await {
        // Endpoints trail the revision; the next tick retries.
        warn!(model = %name, %error, "endpoints sync failed");
    }

    let mut status =
        status_for(&md, ModelDeploymentState::Processing, Some(&latest_ready), &namespace);
    if let Some(backing) = &backing {
        let backing_status = backing.status.clone().unwrap_or_default();
        status.deployment = Some(backing.name_any());
        status.replicas = Some(backing_status.replicas.unwrap_or(0));
        status.available_replicas = Some(backing_status.available_replicas.unwrap_or(0));
    }

    match rollout {
        Rollout::AwaitBackingDeployment => {
            info!(model = %name, revision = %latest_ready, "backing deployment not created yet");
            patch_status(&md_api, &name, &status).await?;
            Ok(Action::requeue(REQUEUE_DELAY))
        }
        Rollout::Converging => {
            info!(
                model = %name,
                replicas = status.replicas.unwrap_or(0),
                available = status.available_replicas.unwrap_or(0),
                "replicas not converged yet"
            );
            patch_status(&md_api, &name, &status).await?;
            Ok(Action::requeue(REQUEUE_DELAY))
        }
        Rollout::Converged => {
            status.state = Some(ModelDeploymentState::Ready);
            patch_status(&md_api, &name, &status).await?;
            info!(model = %name, revision = %latest_ready, "model deployment is ready");

            cleanup_old_revisions(&ctx.client, &namespace, &name, &latest_ready).await?;

            // Ready deployments wake up periodically so expiring registry
            // tokens get rotated even without cluster events.
            Ok(Action::requeue(ctx.config.token_verify_period))
        }
    }
}

pub fn error_policy(md: Arc<ModelDeployment>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(model = %md.name_any(), %error, "reconcile failed, backing off");
    Action::requeue(ERROR_REQUEUE_DELAY)
}

/// Maps an event on a label-tracked child (objects the substrate creates on
/// our behalf) back to the owning model deployment.
fn owner_by_label<K: Resource>(
    namespace: String,
) -> impl Fn(K) -> Option<ObjectRef<ModelDeployment>> {
    move |obj| {
        obj.labels()
            .get(MODEL_NAME_LABEL)
            .map(|model| ObjectRef::<ModelDeployment>::new(model).within(&namespace))
    }
}

pub async fn run(ctx: Arc<Context>) {
    let client = ctx.client.clone();
    let namespace = ctx.config.namespace.clone();
    let deployments = Api::<ModelDeployment>::namespaced(client.clone(), &namespace);
    let labeled = watcher::Config::default().labels(MODEL_NAME_LABEL);

    Controller::new(deployments, watcher::Config::default())
        .owns(
            Api::<Configuration>::namespaced(client.clone(), &namespace),
            watcher::Config::default(),
        )
        .owns(Api::<ModelRoute>::namespaced(client.clone(), &namespace), watcher::Config::default())
        .owns(Api::<Service>::namespaced(client.clone(), &namespace), watcher::Config::default())
        .owns(Api::<Secret>::namespaced(client.clone(), &namespace), watcher::Config::default())
        .owns(
            Api::<ServiceAccount>::namespaced(client.clone(), &namespace),
            watcher::Config::default(),
        )
        .watches(
            Api::<KubeDeployment>::namespaced(client.clone(), &namespace),
            labeled.clone(),
            owner_by_label(namespace.clone()),
        )
        .watches(
            Api::<Revision>::namespaced(client.clone(), &namespace),
            labeled.clone(),
            owner_by_label(namespace.clone()),
        )
        .watches(
            Api::<Endpoints>::namespaced(client.clone(), &namespace),
            labeled,
            owner_by_label(namespace.clone()),
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((object, _)) => debug!(object = %object.name, "reconciled model deployment"),
                Err(error) => warn!(%error, "model deployment reconcile failed"),
            }
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::deployment::ModelDeploymentSpec;
    use crate::knative::ConfigurationStatus;

    fn deployment(spec: ModelDeploymentSpec) -> ModelDeployment {
        let mut md = ModelDeployment::new("wine", spec);
        md.meta_mut().namespace = Some("modelplane".to_string());
        md.meta_mut().uid = Some("abc-123".to_string());
        md
    }

    fn valid_spec() -> ModelDeploymentSpec {
        ModelDeploymentSpec { image: "registry/wine:v1".into(), ..Default::default() }
    }

    #[test]
    fn model_container_wires_port_and_probes() {
        let md = deployment(ModelDeploymentSpec {
            liveness_probe_initial_delay: Some(7),
            ..valid_spec()
        });
        let container = build_model_container(&md);
        assert_eq!(container.ports.as_ref().unwrap()[0].container_port, MODEL_PORT);

        let liveness = container.liveness_probe.unwrap();
        assert_eq!(liveness.initial_delay_seconds, Some(7));
        assert_eq!(liveness.period_seconds, Some(1));
        assert_eq!(liveness.failure_threshold, Some(15));
        assert_eq!(
            liveness.http_get.unwrap().path.as_deref(),
            Some(HEALTHCHECK_PATH)
        );

        let readiness = container.readiness_probe.unwrap();
        assert_eq!(readiness.initial_delay_seconds, Some(DEFAULT_PROBE_INITIAL_DELAY));
    }

    #[test]
    fn resources_convert_to_quantities() {
        let requirements = to_k8s_resources(&default_resources());
        let requests = requirements.requests.unwrap();
        assert_eq!(requests["cpu"], Quantity("128m".into()));
        assert_eq!(requests["memory"], Quantity("128Mi".into()));
        let limits = requirements.limits.unwrap();
        assert_eq!(limits["cpu"], Quantity("256m".into()));
    }

    #[test]
    fn sparse_resource_lists_omit_empty_maps() {
        let requirements = to_k8s_resources(&ModelResources {
            requests: Some(ResourceList { cpu: Some("1".into()), memory: None }),
            limits: None,
        });
        assert_eq!(requirements.requests.unwrap().len(), 1);
        assert!(requirements.limits.is_none());
    }

    #[test]
    fn configuration_carries_autoscaling_bounds() {
        let md = deployment(ModelDeploymentSpec {
            min_replicas: Some(2),
            max_replicas: Some(5),
            ..valid_spec()
        });
        let cfg = build_configuration(&md, "modelplane", None).unwrap();
        let annotations = &cfg.spec.template.metadata.annotations;
        assert_eq!(annotations[AUTOSCALING_MIN_SCALE_ANNOTATION], "2");
        assert_eq!(annotations[AUTOSCALING_MAX_SCALE_ANNOTATION], "5");
        assert_eq!(annotations[AUTOSCALING_CLASS_ANNOTATION], AUTOSCALING_CLASS);
        assert_eq!(annotations[AUTOSCALING_METRIC_ANNOTATION], AUTOSCALING_METRIC);
        assert_eq!(cfg.spec.template.metadata.labels[MODEL_NAME_LABEL], "wine");
        assert_eq!(cfg.spec.template.spec.timeout_seconds, Some(REVISION_TIMEOUT_SECONDS));
        assert!(cfg.metadata.owner_references.is_some());
    }

    #[test]
    fn configuration_references_pull_service_account() {
        let md = deployment(ModelDeploymentSpec {
            image_pull_connection_id: Some("docker-hub".into()),
            ..valid_spec()
        });
        let cfg =
            build_configuration(&md, "modelplane", Some("wine-registry".into())).unwrap();
        assert_eq!(
            cfg.spec.template.spec.service_account_name.as_deref(),
            Some("wine-registry")
        );
    }

    #[test]
    fn default_route_targets_owner_with_full_weight() {
        let md = deployment(valid_spec());
        let route = build_default_route(&md, "modelplane", "wine-00002").unwrap();
        assert_eq!(route.spec.url_prefix, "/model/wine");
        assert_eq!(route.spec.model_deployment_targets.len(), 1);
        assert_eq!(route.spec.model_deployment_targets[0].weight, Some(MAX_WEIGHT));
        assert!(route.skips_url_validation());
        assert_eq!(
            route.annotations().get(LATEST_READY_REVISION_ANNOTATION).map(String::as_str),
            Some("wine-00002")
        );
    }

    #[test]
    fn auth_policy_guards_invocations_only() {
        let md = deployment(valid_spec());
        let jwks = JwksConfig {
            enabled: true,
            issuer: "https://auth.example.com".into(),
            jwks_url: "https://auth.example.com/jwks".into(),
        };
        let policy = build_auth_policy(&md, "modelplane", &jwks).unwrap();
        assert_eq!(policy.spec.targets[0].labels[MODEL_NAME_LABEL], "wine");
        let jwt = &policy.spec.origins[0].jwt;
        assert_eq!(jwt.issuer, "https://auth.example.com");
        // The info endpoint the route rewrites to must stay token-free.
        assert_eq!(
            jwt.trigger_rules[0].included_paths[0],
            StringMatch::Prefix("/api/model/invoke".into())
        );
        assert_eq!(policy.spec.principal_binding, "USE_ORIGIN");
    }

    #[test]
    fn service_targets_proxy_port() {
        let md = deployment(valid_spec());
        let service = build_service(&md, "modelplane").unwrap();
        let spec = service.spec.unwrap();
        let port = &spec.ports.unwrap()[0];
        assert_eq!(port.port, 80);
        assert_eq!(port.target_port, Some(IntOrString::Int(PROXY_PORT)));
        // Selector-less on purpose: endpoints are managed explicitly.
        assert!(spec.selector.is_none());
    }

    #[test]
    fn configuration_readiness_requires_caught_up_revision() {
        let md = deployment(valid_spec());
        let mut cfg = build_configuration(&md, "modelplane", None).unwrap();
        assert_eq!(configuration_ready(&cfg), None);

        cfg.status = Some(ConfigurationStatus {
            latest_created_revision_name: Some("wine-00002".into()),
            latest_ready_revision_name: Some("wine-00001".into()),
        });
        assert_eq!(configuration_ready(&cfg), None);

        cfg.status = Some(ConfigurationStatus {
            latest_created_revision_name: Some("wine-00002".into()),
            latest_ready_revision_name: Some("wine-00002".into()),
        });
        assert_eq!(configuration_ready(&cfg).as_deref(), Some("wine-00002"));
    }

    #[test]
    fn replica_convergence() {
        use k8s_openapi::api::apps::v1::DeploymentStatus;
        assert!(replicas_converged(&DeploymentStatus {
            replicas: Some(2),
            available_replicas: Some(2),
            ..DeploymentStatus::default()
        }));
        assert!(!replicas_converged(&DeploymentStatus {
            replicas: Some(2),
            available_replicas: Some(1),
            ..DeploymentStatus::default()
        }));
        // Scale to zero counts as converged.
        assert!(replicas_converged(&DeploymentStatus::default()));
    }

    #[test]
    fn status_includes_service_url_once_revision_is_known() {
        let md = deployment(valid_spec());
        let status =
            status_for(&md, ModelDeploymentState::Processing, Some("wine-00001"), "modelplane");
        assert_eq!(
            status.service_url.as_deref(),
            Some("wine.modelplane.svc.cluster.local")
        );
        assert_eq!(status.last_revision_name.as_deref(), Some("wine-00001"));

        let early = status_for(&md, ModelDeploymentState::Processing, None, "modelplane");
        assert_eq!(early.service_url, None);
    }

    #[test]
    fn backing_deployment_follows_revision_name() {
        assert_eq!(backing_deployment_name("wine-00003"), "wine-00003-deployment");
    }

    #[test]
    fn route_synthesis_waits_for_a_ready_revision() {
        let md = deployment(valid_spec());
        let cfg = build_configuration(&md, "modelplane", None).unwrap();
        // Freshly created configuration: no children beyond it may exist.
        assert_eq!(tick_phase(None, None), TickPhase::AwaitRevision);
        assert_eq!(tick_phase(Some(&cfg), None), TickPhase::AwaitRevision);

        let mut ready = cfg;
        ready.status = Some(ConfigurationStatus {
            latest_created_revision_name: Some("wine-00001".into()),
            latest_ready_revision_name: Some("wine-00001".into()),
        });
        assert_eq!(
            tick_phase(Some(&ready), None),
            TickPhase::Synthesize {
                latest_ready: "wine-00001".into(),
                rollout: Rollout::AwaitBackingDeployment,
            }
        );
    }

    #[test]
    fn rollout_tracks_backing_deployment_convergence() {
        use k8s_openapi::api::apps::v1::DeploymentStatus;

        let md = deployment(valid_spec());
        let mut cfg = build_configuration(&md, "modelplane", None).unwrap();
        cfg.status = Some(ConfigurationStatus {
            latest_created_revision_name: Some("wine-00002".into()),
            latest_ready_revision_name: Some("wine-00002".into()),
        });

        let backing = |replicas, available| KubeDeployment {
            status: Some(DeploymentStatus {
                replicas: Some(replicas),
                available_replicas: Some(available),
                ..DeploymentStatus::default()
            }),
            ..KubeDeployment::default()
        };

        assert_eq!(
            tick_phase(Some(&cfg), Some(&backing(2, 1))),
            TickPhase::Synthesize {
                latest_ready: "wine-00002".into(),
                rollout: Rollout::Converging,
            }
        );
        assert_eq!(
            tick_phase(Some(&cfg), Some(&backing(2, 2))),
            TickPhase::Synthesize {
                latest_ready: "wine-00002".into(),
                rollout: Rollout::Converged,
            }
        );
    }

    #[test]
    fn invalid_spec_fails_before_any_synthesis() {
        let md = deployment(ModelDeploymentSpec::default());
        assert!(validated(&md, "default").is_err());

        let md = deployment(valid_spec());
        let resolved = validated(&md, "default").unwrap();
        assert_eq!(resolved.spec.role_name.as_deref(), Some("default"));
        // Resolved defaults flow into the synthesized configuration.
        let cfg = build_configuration(&resolved, "modelplane", None).unwrap();
        let annotations = &cfg.spec.template.metadata.annotations;
        assert_eq!(annotations[AUTOSCALING_MIN_SCALE_ANNOTATION], "0");
        assert_eq!(annotations[AUTOSCALING_MAX_SCALE_ANNOTATION], "1");
    }
}
