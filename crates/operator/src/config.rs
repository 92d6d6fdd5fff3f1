use std::time::Duration;

/// JWT authentication settings for synthesized Istio policies.
#[derive(Debug, Clone)]
pub struct JwksConfig {
    pub enabled: bool,
    pub issuer: String,
    pub jwks_url: String,
}

/// Operator settings, resolved once at startup from the environment
/// (MODELPLANE_* variables with sensible in-cluster defaults).
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Namespace the operator manages and deploys models into.
    pub namespace: String,
    /// External host prepended to a route's URL prefix to form its edge URL.
    pub edge_host: String,
    /// Role assigned to deployments that do not declare one.
    pub default_role_name: String,
    /// Base URL of the platform API (connection storage, token issuing).
    pub api_url: String,
    pub api_token: String,
    pub jwks: JwksConfig,
    /// How long an issued registry token is considered fresh.
    pub creds_refresh_period: Duration,
    /// Cadence for re-verifying registry credentials on a Ready deployment.
    pub token_verify_period: Duration,
}

impl OperatorConfig {
    pub fn from_env() -> Self {
        Self {
            namespace: env_or("MODELPLANE_NAMESPACE", "modelplane"),
            edge_host: env_or("MODELPLANE_EDGE_HOST", "http://edge.modelplane.local"),
            default_role_name: env_or("MODELPLANE_DEFAULT_ROLE", "default"),
            api_url: env_or(
                "MODELPLANE_API_URL",
                "http://modelplane-api.modelplane.svc.cluster.local",
            ),
            api_token: env_or("MODELPLANE_API_TOKEN", ""),
            jwks: JwksConfig {
                enabled: env_or("MODELPLANE_JWKS_ENABLED", "false") == "true",
                issuer: env_or("MODELPLANE_JWKS_ISSUER", ""),
                jwks_url: env_or("MODELPLANE_JWKS_URL", ""),
            },
            creds_refresh_period: Duration::from_secs(env_secs(
                "MODELPLANE_CREDS_REFRESH_SECS",
                6 * 60 * 60,
            )),
            token_verify_period: Duration::from_secs(env_secs(
                "MODELPLANE_TOKEN_VERIFY_SECS",
                10 * 60,
            )),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).ok().filter(|v| !v.is_empty()).unwrap_or_else(|| default.to_string())
}

fn env_secs(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_env() {
        let cfg = OperatorConfig::from_env();
        assert_eq!(cfg.creds_refresh_period, Duration::from_secs(21600));
        assert_eq!(cfg.token_verify_period, Duration::from_secs(600));
        assert!(!cfg.jwks.enabled);
    }

    #[test]
    fn env_secs_rejects_garbage() {
        std::env::set_var("MODELPLANE_TEST_SECS", "not-a-number");
        assert_eq!(env_secs("MODELPLANE_TEST_SECS", 42), 42);
        std::env::remove_var("MODELPLANE_TEST_SECS");
    }
}
