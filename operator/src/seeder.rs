//! Environment seeding from a JSON definition file.
//!
//! `preview-operator apply` reads an environment spec, names it after its
//! repository and writes it to the store. Re-applying the same file
//! updates the spec in place; status and finalizers are left alone.

use std::path::Path;

use anyhow::Context;

use crate::models::environment::EnvironmentSpec;
use crate::models::{Environment, ObjectMeta};
use crate::naming;
use crate::store::Api;

/// Parse an environment definition.
pub fn parse(json: &str) -> anyhow::Result<EnvironmentSpec> {
    let spec: EnvironmentSpec =
        serde_json::from_str(json).context("invalid environment definition")?;
    if spec.git_settings.organization.is_empty() || spec.git_settings.repository.is_empty() {
        anyhow::bail!("gitSettings.organization and gitSettings.repository are required");
    }
    Ok(spec)
}

pub async fn load(path: &Path) -> anyhow::Result<EnvironmentSpec> {
    let json = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    parse(&json)
}

/// Create or update the environment for `spec`, owned by `owner`.
pub async fn apply(
    environments: &Api<Environment>,
    spec: EnvironmentSpec,
    owner: &str,
) -> anyhow::Result<Environment> {
    let name = naming::environment_name(
        &spec.git_settings.organization,
        &spec.git_settings.repository,
    );
    let mut metadata = ObjectMeta::new(environments.namespace(), name);
    metadata
        .labels
        .insert(naming::LABEL_OWNER.to_string(), owner.to_string());

    let env = Environment {
        metadata,
        spec,
        status: Default::default(),
    };
    let stored = environments.create_or_replace(&env).await?;
    tracing::info!(
        environment = %stored.metadata.name,
        owner,
        version = stored.metadata.resource_version,
        "Environment applied"
    );
    Ok(stored)
}
