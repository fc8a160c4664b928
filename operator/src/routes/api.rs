//! Read-only status API for environments and their instances.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Error;
use crate::models::environment::EnvironmentPhase;
use crate::models::instance::{DesiredPhase, Phase};
use crate::models::{Environment, Instance, Labels, Resource};
use crate::naming;
use crate::store::Api;

/// JSON response for an environment.
#[derive(Debug, Serialize)]
pub struct EnvironmentJson {
    pub name: String,
    pub owner: String,
    pub display_name: String,
    pub organization: String,
    pub repository: String,
    pub phase: EnvironmentPhase,
    pub pull_requests: Vec<u64>,
    pub deleting: bool,
}

/// JSON response for an instance.
#[derive(Debug, Serialize)]
pub struct InstanceJson {
    pub name: String,
    pub target: String,
    pub commit: String,
    pub phase: Phase,
    pub desired_phase: DesiredPhase,
    pub public_url: String,
    pub message: Option<String>,
    pub last_built_at: Option<DateTime<Utc>>,
}

impl From<&Environment> for EnvironmentJson {
    fn from(env: &Environment) -> Self {
        Self {
            name: env.name().to_string(),
            owner: env.owner().to_string(),
            display_name: env.spec.display_name.clone(),
            organization: env.organization().to_string(),
            repository: env.repository().to_string(),
            phase: env.status.phase,
            pull_requests: env.status.pull_requests_detected.clone(),
            deleting: env.metadata.is_deleting(),
        }
    }
}

impl From<&Instance> for InstanceJson {
    fn from(instance: &Instance) -> Self {
        Self {
            name: instance.name().to_string(),
            target: instance.target().to_string(),
            commit: instance.commit_hash().to_string(),
            phase: instance.phase(),
            desired_phase: instance.spec.desired_phase,
            public_url: instance.status.public_facing_url.clone(),
            message: instance.status.message.clone(),
            last_built_at: instance
                .status
                .built_versions
                .iter()
                .map(|v| v.timestamp)
                .max(),
        }
    }
}

/// List environments, optionally restricted to one owner.
pub async fn list_environments(
    environments: &Api<Environment>,
    owner: Option<&str>,
) -> Result<Vec<EnvironmentJson>, Error> {
    let selector = match owner {
        Some(owner) => Labels::from([(naming::LABEL_OWNER.to_string(), owner.to_string())]),
        None => Labels::new(),
    };
    Ok(environments
        .list(&selector)
        .await?
        .iter()
        .map(EnvironmentJson::from)
        .collect())
}

/// Instances of one environment; `None` if the environment does not exist.
pub async fn list_instances(
    environments: &Api<Environment>,
    instances: &Api<Instance>,
    name: &str,
) -> Result<Option<Vec<InstanceJson>>, Error> {
    let Some(env) = environments.get_opt(name).await? else {
        return Ok(None);
    };
    Ok(Some(
        instances
            .list(&naming::environment_selector(&env))
            .await?
            .iter()
            .map(InstanceJson::from)
            .collect(),
    ))
}
