//! Environment: desired preview configuration for one repository.

use serde::{Deserialize, Serialize};

use super::meta::ObjectMeta;
use crate::naming;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    pub metadata: ObjectMeta,
    pub spec: EnvironmentSpec,
    #[serde(default)]
    pub status: EnvironmentStatus,
}

super::impl_resource!(Environment, super::Kind::Environment);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentSpec {
    pub git_settings: GitSettings,
    pub container_registry: ContainerRegistry,
    pub application_settings: ApplicationSettings,
    pub build_settings: BuildSettings,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub access_settings: AccessSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitSettings {
    pub organization: String,
    pub repository: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerRegistry {
    pub registry: String,
    pub repository: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSettings {
    /// Hostname the application is exposed on.
    pub ingress_hostname: String,
    /// Port the application listens on.
    pub port: u16,
    #[serde(default)]
    pub environment_variables: Vec<EnvironmentVariable>,
    /// Overrides the image's start command, split on whitespace.
    #[serde(default)]
    pub command: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentVariable {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildSettings {
    #[serde(default)]
    pub build_all_pull_requests: bool,
    #[serde(default)]
    pub build_all_branches: bool,
    /// Substring a branch (or, without build-all-PRs, a PR head ref) must contain.
    #[serde(default)]
    pub branch_wildcard: Option<String>,
    #[serde(default, rename = "dockerfile")]
    pub dockerfile_path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessSettings {
    #[serde(default)]
    pub users: Vec<UserAccess>,
    #[serde(default)]
    pub public_access: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserAccess {
    #[serde(default)]
    pub username: String,
    /// Identity-provider id of the user.
    pub user_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentStatus {
    #[serde(default, rename = "pullRequests")]
    pub pull_requests_detected: Vec<u64>,
    #[serde(default)]
    pub phase: EnvironmentPhase,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentPhase {
    #[default]
    Pending,
    Processing,
    Ready,
    Error,
}

impl Environment {
    /// Creator's external identity id, carried as the `owner` label.
    pub fn owner(&self) -> &str {
        self.metadata.label(naming::LABEL_OWNER).unwrap_or_default()
    }

    pub fn organization(&self) -> &str {
        &self.spec.git_settings.organization
    }

    pub fn repository(&self) -> &str {
        &self.spec.git_settings.repository
    }

    /// Stable identity used by instances to point back at this record.
    pub fn id(&self) -> String {
        self.metadata
            .uid
            .map(|uid| uid.to_string())
            .unwrap_or_default()
    }

    /// True when instances must be fronted by the authenticating proxy.
    pub fn requires_authentication(&self) -> bool {
        !self.spec.access_settings.public_access
    }
}
