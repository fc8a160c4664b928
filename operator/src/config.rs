//! Operator configuration: loaded from environment variables and validated
//! once at startup.

use std::time::Duration;

use crate::services::identity_service::KeycloakSettings;

/// Fixed delays and limits of the reconcile loops.
pub mod timings {
    use std::time::Duration;

    /// Retry interval while deletion cleanup is incomplete.
    pub const DELETE_RETRY: Duration = Duration::from_secs(15);
    /// Retry interval after a failed build or deploy.
    pub const STAGE_RETRY: Duration = Duration::from_secs(10);
    /// Retry interval after repository-provider or comment failures.
    pub const PROVIDER_RETRY: Duration = Duration::from_secs(60);
    /// Build completion check interval.
    pub const BUILD_POLL: Duration = Duration::from_secs(1);
    /// Retry interval after losing an optimistic-concurrency race.
    pub const CONFLICT_RETRY: Duration = Duration::from_secs(1);
    /// Hard limit on one build job, measured from its creation.
    pub const BUILD_TIMEOUT_MINUTES: i64 = 30;
    /// Finished build pods older than this are reaped.
    pub const POD_RETENTION_MINUTES: i64 = 10;
    /// Status comments older than this are deleted and reposted.
    pub const COMMENT_REFRESH_HOURS: i64 = 24;
    /// Built versions retained per instance.
    pub const BUILT_VERSION_LIMIT: usize = 10;
    /// Seconds a finished build job lingers before cluster garbage collection.
    pub const BUILD_JOB_TTL_SECS: u32 = 60;
}

const DEFAULT_GITHUB_API: &str = "https://api.github.com";
const DEFAULT_BUILD_IMAGE: &str = "gcr.io/kaniko-project/executor:v1.23.2";
const DEFAULT_AUTH_PROXY_IMAGE: &str = "quay.io/oauth2-proxy/oauth2-proxy:v7.6.0";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{group} is partially configured; missing {}", missing.join(", "))]
    Incomplete {
        group: &'static str,
        missing: Vec<&'static str>,
    },

    #[error("{var} has invalid value {value:?}")]
    Invalid { var: &'static str, value: String },

    #[error("DATABASE_URL is required unless the in-memory store is selected")]
    MissingDatabase,
}

#[derive(Clone, Debug)]
pub struct GithubSettings {
    pub api_url: String,
    /// Personal access token for API calls; empty means unauthenticated.
    pub token: String,
    /// Webhook secret for HMAC validation; empty disables validation.
    pub webhook_secret: String,
}

#[derive(Clone, Debug)]
pub struct AuthProxySettings {
    pub image: String,
    pub client_id: String,
    pub client_secret: String,
    pub issuer_url: String,
    pub cookie_secret: String,
}

#[derive(Clone, Debug)]
pub struct BuildConfig {
    pub image: String,
    /// Secret holding the registry push credentials.
    pub registry_secret: String,
    pub platform: String,
}

#[derive(Clone, Debug)]
pub struct OperatorConfig {
    pub database_url: Option<String>,
    /// Namespace every record and workload lives in.
    pub namespace: String,
    pub github: GithubSettings,
    pub auth_proxy: Option<AuthProxySettings>,
    pub keycloak: Option<KeycloakSettings>,
    pub build: BuildConfig,
    /// Concurrent reconciles per controller.
    pub workers: usize,
    pub environment_resync: Duration,
    pub instance_resync: Duration,
}

impl OperatorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| lookup(var).filter(|v| !v.is_empty());

        let github = GithubSettings {
            api_url: get("GITHUB_API_URL").unwrap_or_else(|| DEFAULT_GITHUB_API.to_string()),
            token: get("GITHUB_AUTH_TOKEN").unwrap_or_default(),
            webhook_secret: get("GITHUB_WEBHOOK_SECRET").unwrap_or_default(),
        };

        let auth_proxy = all_or_none(
            "auth proxy",
            [
                "AUTH_PROXY_CLIENT_ID",
                "AUTH_PROXY_CLIENT_SECRET",
                "AUTH_PROXY_ISSUER_URL",
                "AUTH_PROXY_COOKIE_SECRET",
            ],
            &get,
        )?
        .map(|[client_id, client_secret, issuer_url, cookie_secret]| AuthProxySettings {
            image: get("AUTH_PROXY_IMAGE").unwrap_or_else(|| DEFAULT_AUTH_PROXY_IMAGE.to_string()),
            client_id,
            client_secret,
            issuer_url,
            cookie_secret,
        });

        let keycloak = all_or_none(
            "keycloak",
            [
                "KEYCLOAK_URL",
                "KEYCLOAK_REALM",
                "KEYCLOAK_USERNAME",
                "KEYCLOAK_PASSWORD",
            ],
            &get,
        )?
        .map(|[url, realm, username, password]| KeycloakSettings {
            url,
            realm,
            username,
            password,
        });

        let build = BuildConfig {
            image: get("BUILD_IMAGE").unwrap_or_else(|| DEFAULT_BUILD_IMAGE.to_string()),
            registry_secret: get("BUILD_REGISTRY_SECRET").unwrap_or_else(|| "dockerhub".to_string()),
            platform: get("BUILD_PLATFORM").unwrap_or_else(|| "linux/amd64".to_string()),
        };

        let workers = parse_or("PREVIEW_WORKERS", 4, &get)?;
        if workers == 0 {
            return Err(ConfigError::Invalid {
                var: "PREVIEW_WORKERS",
                value: "0".to_string(),
            });
        }
        let environment_resync =
            Duration::from_secs(parse_or("PREVIEW_ENVIRONMENT_RESYNC_SECS", 60, &get)?);
        let instance_resync =
            Duration::from_secs(parse_or("PREVIEW_INSTANCE_RESYNC_SECS", 60, &get)?);

        if github.webhook_secret.is_empty() {
            tracing::warn!("GITHUB_WEBHOOK_SECRET not set -- webhook signature validation disabled");
        }
        if github.token.is_empty() {
            tracing::warn!("GITHUB_AUTH_TOKEN not set -- using unauthenticated GitHub API");
        }
        if auth_proxy.is_none() {
            tracing::warn!("Auth proxy not configured -- instances are served without authentication");
        }

        Ok(Self {
            database_url: get("DATABASE_URL"),
            namespace: get("PREVIEW_NAMESPACE").unwrap_or_else(|| "default".to_string()),
            github,
            auth_proxy,
            keycloak,
            build,
            workers,
            environment_resync,
            instance_resync,
        })
    }
}

/// All variables of a group set, none set, or a descriptive error.
fn all_or_none<const N: usize>(
    group: &'static str,
    vars: [&'static str; N],
    get: &impl Fn(&str) -> Option<String>,
) -> Result<Option<[String; N]>, ConfigError> {
    let values = vars.map(|var| get(var));
    let missing: Vec<&'static str> = vars
        .iter()
        .zip(values.iter())
        .filter(|(_, value)| value.is_none())
        .map(|(var, _)| *var)
        .collect();

    if missing.len() == N {
        return Ok(None);
    }
    if !missing.is_empty() {
        return Err(ConfigError::Incomplete { group, missing });
    }
    Ok(Some(values.map(Option::unwrap_or_default)))
}

fn parse_or<T: std::str::FromStr>(
    var: &'static str,
    default: T,
    get: &impl Fn(&str) -> Option<String>,
) -> Result<T, ConfigError> {
    match get(var) {
        None => Ok(default),
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<OperatorConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        OperatorConfig::from_lookup(|var| vars.get(var).cloned())
    }

    #[test]
    fn defaults_without_optional_groups() {
        let config = config(&[]).unwrap();
        assert_eq!(config.namespace, "default");
        assert_eq!(config.github.api_url, DEFAULT_GITHUB_API);
        assert!(config.auth_proxy.is_none());
        assert!(config.keycloak.is_none());
        assert_eq!(config.workers, 4);
        assert_eq!(config.build.registry_secret, "dockerhub");
    }

    #[test]
    fn partial_group_names_missing_variables() {
        let err = config(&[
            ("KEYCLOAK_URL", "https://id.example.com"),
            ("KEYCLOAK_REALM", "previews"),
        ])
        .unwrap_err();
        assert_eq!(
            err,
            ConfigError::Incomplete {
                group: "keycloak",
                missing: vec!["KEYCLOAK_USERNAME", "KEYCLOAK_PASSWORD"],
            }
        );
    }

    #[test]
    fn complete_proxy_group() {
        let config = config(&[
            ("AUTH_PROXY_CLIENT_ID", "id"),
            ("AUTH_PROXY_CLIENT_SECRET", "secret"),
            ("AUTH_PROXY_ISSUER_URL", "https://id.example.com/realms/x"),
            ("AUTH_PROXY_COOKIE_SECRET", "cookie"),
        ])
        .unwrap();
        let proxy = config.auth_proxy.unwrap();
        assert_eq!(proxy.client_secret, "secret");
        assert_eq!(proxy.image, DEFAULT_AUTH_PROXY_IMAGE);
    }

    #[test]
    fn invalid_numbers_are_fatal() {
        assert!(matches!(
            config(&[("PREVIEW_WORKERS", "many")]),
            Err(ConfigError::Invalid { var: "PREVIEW_WORKERS", .. })
        ));
        assert!(config(&[("PREVIEW_WORKERS", "0")]).is_err());
    }
}
