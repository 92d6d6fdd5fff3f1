use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::ValidationErrors;

pub const DEFAULT_MIN_REPLICAS: i32 = 0;
pub const DEFAULT_MAX_REPLICAS: i32 = 1;
pub const DEFAULT_PROBE_INITIAL_DELAY: i32 = 2;

const EMPTY_IMAGE_ERROR: &str = "the image parameter is empty";
const MIN_REPLICAS_ERROR: &str = "minimum number of replicas must not be less than 0";
const MAX_REPLICAS_ERROR: &str = "maximum number of replicas must not be less than 1";
const MIN_ABOVE_MAX_ERROR: &str =
    "minimum number of replicas must not be greater than maximum number of replicas";
const LIVENESS_PROBE_ERROR: &str = "liveness probe initial delay must be a positive number";
const READINESS_PROBE_ERROR: &str = "readiness probe initial delay must be a positive number";

/// Requested compute for a model container, converted to Kubernetes resource
/// requirements when the serving revision is synthesized.
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelResources {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<ResourceList>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceList>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct ResourceList {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

pub fn default_resources() -> ModelResources {
    ModelResources {
        requests: Some(ResourceList { cpu: Some("128m".into()), memory: Some("128Mi".into()) }),
        limits: Some(ResourceList { cpu: Some("256m".into()), memory: Some("256Mi".into()) }),
    }
}

/// ModelDeployment is a single served model: the operator turns it into a
/// Knative configuration, a default route and, optionally, pull credentials
/// and an authentication policy.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[kube(
    group = "modelplane.org",
    version = "v1alpha1",
    kind = "ModelDeployment",
    namespaced,
    status = "ModelDeploymentStatus",
    shortname = "md",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Model image","type":"string","jsonPath":".spec.image"}"#,
    printcolumn = r#"{"name":"Service URL","type":"string","jsonPath":".status.serviceURL"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ModelDeploymentSpec {
    /// Model Docker image.
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ModelResources>,
    /// Lower autoscaling bound. Defaults to 0 (scale to zero).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_replicas: Option<i32>,
    /// Upper autoscaling bound. Defaults to 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liveness_probe_initial_delay: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness_probe_initial_delay: Option<i32>,
    /// Role allowed to invoke the model when JWT authentication is enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_name: Option<String>,
    /// Identifier of the registry connection holding image pull credentials.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_connection_id: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum ModelDeploymentState {
    Processing,
    Ready,
    Failed,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelDeploymentStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ModelDeploymentState>,
    /// In-cluster address of the model service.
    #[serde(default, rename = "serviceURL", skip_serializing_if = "Option::is_none")]
    pub service_url: Option<String>,
    /// Name of the latest ready serving revision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_revision_name: Option<String>,
    /// Name of the Kubernetes deployment backing the ready revision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_replicas: Option<i32>,
    /// When the registry pull token was last rotated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_creds_updated_time: Option<DateTime<Utc>>,
}

impl ModelDeployment {
    /// Admission-time validation. Fills in defaults for omitted optional
    /// fields and accumulates every violation rather than failing fast.
    pub fn validate_and_set_defaults(&mut self, default_role: &str) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::default();

        if self.spec.image.is_empty() {
            errors.push(EMPTY_IMAGE_ERROR);
        }

        if self.spec.role_name.as_deref().map_or(true, str::is_empty) {
            self.spec.role_name = Some(default_role.to_string());
        }

        match self.spec.min_replicas {
            None => self.spec.min_replicas = Some(DEFAULT_MIN_REPLICAS),
            Some(min) if min < 0 => errors.push(MIN_REPLICAS_ERROR),
            Some(_) => {}
        }

        match self.spec.max_replicas {
            None => self.spec.max_replicas = Some(DEFAULT_MAX_REPLICAS),
            Some(max) if max < 1 => errors.push(MAX_REPLICAS_ERROR),
            Some(_) => {}
        }

        if let (Some(min), Some(max)) = (self.spec.min_replicas, self.spec.max_replicas) {
            if min > max {
                errors.push(MIN_ABOVE_MAX_ERROR);
            }
        }

        if self.spec.resources.is_none() {
            self.spec.resources = Some(default_resources());
        }

        match self.spec.liveness_probe_initial_delay {
            None => self.spec.liveness_probe_initial_delay = Some(DEFAULT_PROBE_INITIAL_DELAY),
            Some(delay) if delay <= 0 => errors.push(LIVENESS_PROBE_ERROR),
            Some(_) => {}
        }

        match self.spec.readiness_probe_initial_delay {
            None => self.spec.readiness_probe_initial_delay = Some(DEFAULT_PROBE_INITIAL_DELAY),
            Some(delay) if delay <= 0 => errors.push(READINESS_PROBE_ERROR),
            Some(_) => {}
        }

        errors.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployment(spec: ModelDeploymentSpec) -> ModelDeployment {
        ModelDeployment::new("wine", spec)
    }

    fn valid_spec() -> ModelDeploymentSpec {
        ModelDeploymentSpec { image: "registry/model:v1".into(), ..Default::default() }
    }

    #[test]
    fn defaults_are_applied() {
        let mut md = deployment(valid_spec());
        md.validate_and_set_defaults("default").unwrap();
        assert_eq!(md.spec.min_replicas, Some(0));
        assert_eq!(md.spec.max_replicas, Some(1));
        assert_eq!(md.spec.liveness_probe_initial_delay, Some(2));
        assert_eq!(md.spec.readiness_probe_initial_delay, Some(2));
        assert_eq!(md.spec.role_name.as_deref(), Some("default"));
        assert!(md.spec.resources.is_some());
    }

    #[test]
    fn empty_image_is_rejected() {
        let mut md = deployment(ModelDeploymentSpec::default());
        let err = md.validate_and_set_defaults("default").unwrap_err();
        assert!(err.to_string().contains("image parameter is empty"));
    }

    #[test]
    fn replica_bounds_are_checked() {
        let mut md = deployment(ModelDeploymentSpec {
            min_replicas: Some(-1),
            max_replicas: Some(0),
            ..valid_spec()
        });
        let err = md.validate_and_set_defaults("default").unwrap_err();
        assert_eq!(err.messages().len(), 2);
        assert!(err.to_string().contains("less than 0"));
        assert!(err.to_string().contains("less than 1"));
    }

    #[test]
    fn min_above_max_is_rejected() {
        let mut md = deployment(ModelDeploymentSpec {
            min_replicas: Some(3),
            max_replicas: Some(2),
            ..valid_spec()
        });
        let err = md.validate_and_set_defaults("default").unwrap_err();
        assert!(err.to_string().contains("greater than maximum"));
    }

    #[test]
    fn non_positive_probe_delays_are_rejected() {
        let mut md = deployment(ModelDeploymentSpec {
            liveness_probe_initial_delay: Some(0),
            readiness_probe_initial_delay: Some(-5),
            ..valid_spec()
        });
        let err = md.validate_and_set_defaults("default").unwrap_err();
        assert_eq!(err.messages().len(), 2);
    }

    #[test]
    fn explicit_role_is_preserved() {
        let mut md =
            deployment(ModelDeploymentSpec { role_name: Some("analyst".into()), ..valid_spec() });
        md.validate_and_set_defaults("default").unwrap();
        assert_eq!(md.spec.role_name.as_deref(), Some("analyst"));
    }
}
