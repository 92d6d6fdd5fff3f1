//! Change suppression for synthesized child objects. Every reconcile tick
//! rebuilds the desired object from scratch; a content hash stored in an
//! annotation decides whether the cluster actually needs a write.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use kube::api::{Api, PostParams};
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha512};
use std::fmt::Debug;
use tracing::{debug, info};

pub const LAST_APPLIED_HASH_ANNOTATION: &str = "operator.modelplane.org/last-applied-hash";

/// Outcome of comparing a freshly synthesized object with what the cluster
/// currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDecision {
    Create,
    Update,
    Skip,
}

/// Computes the content hash of `obj` and stores it in the last-applied-hash
/// annotation. Any previous hash annotation is stripped before hashing so the
/// digest only covers meaningful fields. Serialization is canonical: all maps
/// in synthesized objects are `BTreeMap`s and struct fields serialize in
/// declaration order, so semantically identical objects hash identically.
pub fn store_hash<K>(obj: &mut K) -> Result<(), serde_json::Error>
where
    K: Resource + Serialize,
{
    if let Some(annotations) = &mut obj.meta_mut().annotations {
        annotations.remove(LAST_APPLIED_HASH_ANNOTATION);
    }
    let payload = serde_json::to_vec(obj)?;
    let digest = BASE64.encode(Sha512::digest(&payload));
    obj.meta_mut()
        .annotations
        .get_or_insert_with(Default::default)
        .insert(LAST_APPLIED_HASH_ANNOTATION.to_string(), digest);
    Ok(())
}

fn stored_hash(obj: &impl Resource) -> Option<&String> {
    obj.meta().annotations.as_ref()?.get(LAST_APPLIED_HASH_ANNOTATION)
}

/// Two objects are considered equal when both carry the same stored hash.
/// A missing hash on either side forces an update.
pub fn hashes_equal(candidate: &impl Resource, observed: &impl Resource) -> bool {
    match (stored_hash(candidate), stored_hash(observed)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

pub fn decide<K: Resource>(candidate: &K, observed: Option<&K>) -> SyncDecision {
    match observed {
        None => SyncDecision::Create,
        Some(found) if hashes_equal(candidate, found) => SyncDecision::Skip,
        Some(_) => SyncDecision::Update,
    }
}

/// Creates or replaces `candidate` in the cluster, skipping the write when
/// the stored hash already matches. The caller must have called `store_hash`
/// on the candidate. Errors from the API are propagated unmodified; retry is
/// the dispatcher's job.
pub async fn sync_resource<K>(api: &Api<K>, candidate: &K) -> Result<SyncDecision, kube::Error>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Debug,
    K::DynamicType: Default,
{
    let kind = K::kind(&K::DynamicType::default()).to_string();
    let name = candidate.name_any();
    let observed = api.get_opt(&name).await?;
    match observed {
        None => {
            info!(%kind, %name, "creating synthesized object");
            api.create(&PostParams::default(), candidate).await?;
            Ok(SyncDecision::Create)
        }
        Some(found) if hashes_equal(candidate, &found) => {
            debug!(%kind, %name, "hashes equal, skipping update");
            Ok(SyncDecision::Skip)
        }
        Some(found) => {
            info!(%kind, %name, "hashes differ, updating synthesized object");
            let mut desired = candidate.clone();
            desired.meta_mut().resource_version = found.meta().resource_version.clone();
            api.replace(&name, &PostParams::default(), &desired).await?;
            Ok(SyncDecision::Update)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::route::{ModelDeploymentTarget, ModelRoute, ModelRouteSpec};

    fn sample_route() -> ModelRoute {
        ModelRoute::new(
            "wine",
            ModelRouteSpec {
                url_prefix: "/model/wine".into(),
                mirror: None,
                model_deployment_targets: vec![ModelDeploymentTarget {
                    name: "wine".into(),
                    weight: Some(100),
                }],
            },
        )
    }

    #[test]
    fn hash_is_stored_in_annotation() {
        let mut route = sample_route();
        store_hash(&mut route).unwrap();
        assert!(route.annotations().contains_key(LAST_APPLIED_HASH_ANNOTATION));
    }

    #[test]
    fn hashing_is_idempotent() {
        let mut first = sample_route();
        store_hash(&mut first).unwrap();
        // Re-hashing an object that already carries a hash must not change it.
        let mut second = first.clone();
        store_hash(&mut second).unwrap();
        assert_eq!(
            first.annotations().get(LAST_APPLIED_HASH_ANNOTATION),
            second.annotations().get(LAST_APPLIED_HASH_ANNOTATION),
        );
    }

    #[test]
    fn unchanged_object_skips_and_changed_object_updates() {
        let mut candidate = sample_route();
        store_hash(&mut candidate).unwrap();

        assert_eq!(decide(&candidate, None), SyncDecision::Create);

        let observed = candidate.clone();
        assert_eq!(decide(&candidate, Some(&observed)), SyncDecision::Skip);

        let mut changed = candidate.clone();
        changed.spec.url_prefix = "/model/wine-v2".into();
        store_hash(&mut changed).unwrap();
        assert_eq!(decide(&changed, Some(&observed)), SyncDecision::Update);
    }

    #[test]
    fn reconciling_twice_produces_no_second_write() {
        // Synthesize the same object twice, as two consecutive reconcile
        // ticks would, and count decisions that reach the API.
        let mut writes = 0;
        let mut cluster: Option<ModelRoute> = None;
        for _ in 0..2 {
            let mut candidate = sample_route();
            store_hash(&mut candidate).unwrap();
            match decide(&candidate, cluster.as_ref()) {
                SyncDecision::Create | SyncDecision::Update => {
                    writes += 1;
                    cluster = Some(candidate);
                }
                SyncDecision::Skip => {}
            }
        }
        assert_eq!(writes, 1);
    }

    #[test]
    fn missing_hash_on_observed_forces_update() {
        let mut candidate = sample_route();
        store_hash(&mut candidate).unwrap();
        let observed = sample_route();
        assert_eq!(decide(&candidate, Some(&observed)), SyncDecision::Update);
    }
}
