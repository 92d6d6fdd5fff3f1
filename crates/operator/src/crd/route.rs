use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{DeploymentResolver, ValidationErrors};

/// Routes created by the operator itself (the per-deployment default route)
/// carry this annotation so the reserved-prefix check does not reject them.
pub const SKIP_URL_VALIDATION_ANNOTATION: &str = "internal.modelplane.org/skip-url-validation";
pub const SKIP_URL_VALIDATION_VALUE: &str = "true";

/// Prefixes reserved for platform-generated routes.
pub const RESERVED_URL_PREFIXES: &[&str] = &["/model", "/feedback"];

pub const MAX_WEIGHT: i32 = 100;

const URL_PREFIX_EMPTY_ERROR: &str = "URL prefix must not be empty";
const URL_PREFIX_SLASH_ERROR: &str = "URL prefix must start with slash";
const EMPTY_TARGETS_ERROR: &str = "model deployment targets must contain at least one target";
const ONE_TARGET_WEIGHT_ERROR: &str =
    "it must have 100 weight or no value if there is only one target";
const MISSED_WEIGHT_ERROR: &str =
    "weights must be present if there are more than one model deployment targets";
const TOTAL_WEIGHT_ERROR: &str = "total target weight does not equal 100";

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelDeploymentTarget {
    /// Model deployment name.
    pub name: String,
    /// Percentage of traffic forwarded to this deployment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<i32>,
}

/// ModelRoute forwards weighted traffic from a URL prefix to one or more
/// model deployments, with an optional best-effort traffic mirror.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[kube(
    group = "modelplane.org",
    version = "v1alpha1",
    kind = "ModelRoute",
    namespaced,
    status = "ModelRouteStatus",
    shortname = "mr",
    printcolumn = r#"{"name":"Edge URL","type":"string","jsonPath":".status.edgeUrl"}"#,
    printcolumn = r#"{"name":"Mirror","type":"string","jsonPath":".spec.mirror"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ModelRouteSpec {
    /// URL prefix for the route, for example `/custom/test`. Must start with
    /// a slash; `/model` and `/feedback` are reserved for internal use.
    pub url_prefix: String,
    /// Deployment receiving a copy of the traffic without affecting the
    /// primary response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirror: Option<String>,
    #[serde(rename = "modelDeployments")]
    pub model_deployment_targets: Vec<ModelDeploymentTarget>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum ModelRouteState {
    Processing,
    Ready,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelRouteStatus {
    /// Externally resolvable URL of the route.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ModelRouteState>,
}

impl ModelRoute {
    pub fn skips_url_validation(&self) -> bool {
        self.annotations().get(SKIP_URL_VALIDATION_ANNOTATION).map(String::as_str)
            == Some(SKIP_URL_VALIDATION_VALUE)
    }

    /// Admission-time validation of the target-weight invariants. Resolution
    /// failures and weight violations are accumulated, not short-circuited,
    /// so a single response reports every problem. The route synthesizer
    /// trusts that stored specs have passed this check and does not
    /// re-validate weights.
    pub async fn validate_and_set_defaults(
        &mut self,
        resolver: &dyn DeploymentResolver,
    ) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::default();

        if self.spec.url_prefix.is_empty() {
            errors.push(URL_PREFIX_EMPTY_ERROR);
        } else if !self.spec.url_prefix.starts_with('/') {
            errors.push(URL_PREFIX_SLASH_ERROR);
        } else if !self.skips_url_validation() {
            for prefix in RESERVED_URL_PREFIXES {
                if self.spec.url_prefix.starts_with(prefix) {
                    errors.push(format!("the URL prefix {prefix} is reserved"));
                    break;
                }
            }
        }

        if let Some(mirror) = self.spec.mirror.as_deref().filter(|m| !m.is_empty()) {
            resolve_target(resolver, mirror, &mut errors).await;
        }

        match self.spec.model_deployment_targets.len() {
            0 => errors.push(EMPTY_TARGETS_ERROR),
            1 => {
                let target = &mut self.spec.model_deployment_targets[0];
                let name = target.name.clone();
                match target.weight {
                    None => target.weight = Some(MAX_WEIGHT),
                    Some(weight) if weight != MAX_WEIGHT => errors.push(ONE_TARGET_WEIGHT_ERROR),
                    Some(_) => {}
                }
                resolve_target(resolver, &name, &mut errors).await;
            }
            _ => {
                let mut weight_sum = 0;
                let mut weight_missing = false;
                for target in &self.spec.model_deployment_targets {
                    resolve_target(resolver, &target.name, &mut errors).await;
                    match target.weight {
                        None => weight_missing = true,
                        Some(weight) => weight_sum += weight,
                    }
                }
                if weight_missing {
                    errors.push(MISSED_WEIGHT_ERROR);
                }
                if weight_sum != MAX_WEIGHT {
                    errors.push(TOTAL_WEIGHT_ERROR);
                }
            }
        }

        errors.into_result()
    }
}

async fn resolve_target(resolver: &dyn DeploymentResolver, name: &str, errors: &mut ValidationErrors) {
    match resolver.resolve(name).await {
        Ok(Some(_)) => {}
        Ok(None) => errors.push(format!("model deployment {name} is not found")),
        Err(e) => errors.push(format!("resolving model deployment {name}: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::deployment::{ModelDeployment, ModelDeploymentSpec};
    use async_trait::async_trait;
    use std::collections::BTreeSet;

    struct FakeResolver(BTreeSet<String>);

    impl FakeResolver {
        fn with(names: &[&str]) -> Self {
            Self(names.iter().map(|n| n.to_string()).collect())
        }
    }

    #[async_trait]
    impl DeploymentResolver for FakeResolver {
        async fn resolve(&self, name: &str) -> anyhow::Result<Option<ModelDeployment>> {
            Ok(self.0.contains(name).then(|| {
                ModelDeployment::new(
                    name,
                    ModelDeploymentSpec { image: "registry/model:v1".into(), ..Default::default() },
                )
            }))
        }
    }

    fn route(prefix: &str, targets: Vec<ModelDeploymentTarget>) -> ModelRoute {
        ModelRoute::new(
            "test-route",
            ModelRouteSpec {
                url_prefix: prefix.into(),
                mirror: None,
                model_deployment_targets: targets,
            },
        )
    }

    fn target(name: &str, weight: Option<i32>) -> ModelDeploymentTarget {
        ModelDeploymentTarget { name: name.into(), weight }
    }

    #[tokio::test]
    async fn weights_summing_to_100_pass() {
        let resolver = FakeResolver::with(&["a", "b"]);
        let mut mr = route("/custom/x", vec![target("a", Some(60)), target("b", Some(40))]);
        mr.validate_and_set_defaults(&resolver).await.unwrap();
    }

    #[tokio::test]
    async fn weights_not_summing_to_100_fail() {
        let resolver = FakeResolver::with(&["a", "b"]);
        let mut mr = route("/custom/x", vec![target("a", Some(40)), target("b", Some(40))]);
        let err = mr.validate_and_set_defaults(&resolver).await.unwrap_err();
        assert!(err.to_string().contains("total target weight does not equal 100"));
    }

    #[tokio::test]
    async fn missing_weight_with_multiple_targets_fails() {
        let resolver = FakeResolver::with(&["a", "b"]);
        let mut mr = route("/custom/x", vec![target("a", Some(50)), target("b", None)]);
        let err = mr.validate_and_set_defaults(&resolver).await.unwrap_err();
        assert!(err.to_string().contains("weights must be present"));
    }

    #[tokio::test]
    async fn single_target_defaults_to_100() {
        let resolver = FakeResolver::with(&["a"]);
        let mut mr = route("/custom/x", vec![target("a", None)]);
        mr.validate_and_set_defaults(&resolver).await.unwrap();
        assert_eq!(mr.spec.model_deployment_targets[0].weight, Some(100));
    }

    #[tokio::test]
    async fn single_target_with_partial_weight_fails() {
        let resolver = FakeResolver::with(&["a"]);
        let mut mr = route("/custom/x", vec![target("a", Some(77))]);
        let err = mr.validate_and_set_defaults(&resolver).await.unwrap_err();
        assert!(err.to_string().contains("must have 100 weight"));
    }

    #[tokio::test]
    async fn empty_targets_fail() {
        let resolver = FakeResolver::with(&[]);
        let mut mr = route("/custom/x", vec![]);
        let err = mr.validate_and_set_defaults(&resolver).await.unwrap_err();
        assert!(err.to_string().contains("at least one target"));
    }

    #[tokio::test]
    async fn reserved_prefix_is_rejected() {
        let resolver = FakeResolver::with(&["a"]);
        let mut mr = route("/model/x", vec![target("a", None)]);
        let err = mr.validate_and_set_defaults(&resolver).await.unwrap_err();
        assert!(err.to_string().contains("/model"));
        assert!(err.to_string().contains("reserved"));
    }

    #[tokio::test]
    async fn skip_annotation_bypasses_reserved_prefix() {
        let resolver = FakeResolver::with(&["a"]);
        let mut mr = route("/model/x", vec![target("a", None)]);
        mr.annotations_mut().insert(
            SKIP_URL_VALIDATION_ANNOTATION.to_string(),
            SKIP_URL_VALIDATION_VALUE.to_string(),
        );
        mr.validate_and_set_defaults(&resolver).await.unwrap();
    }

    #[tokio::test]
    async fn prefix_without_slash_is_rejected() {
        let resolver = FakeResolver::with(&["a"]);
        let mut mr = route("custom/x", vec![target("a", None)]);
        let err = mr.validate_and_set_defaults(&resolver).await.unwrap_err();
        assert!(err.to_string().contains("start with slash"));
    }

    #[tokio::test]
    async fn unresolved_references_accumulate() {
        let resolver = FakeResolver::with(&[]);
        let mut mr = route("/custom/x", vec![target("a", Some(50)), target("b", Some(40))]);
        mr.spec.mirror = Some("ghost".into());
        let err = mr.validate_and_set_defaults(&resolver).await.unwrap_err();
        let rendered = err.to_string();
        assert!(rendered.contains("model deployment ghost is not found"));
        assert!(rendered.contains("model deployment a is not found"));
        assert!(rendered.contains("model deployment b is not found"));
        assert!(rendered.contains("total target weight does not equal 100"));
        assert_eq!(err.messages().len(), 4);
    }
}
