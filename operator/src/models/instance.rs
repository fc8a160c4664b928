//! Instance: one ephemeral deployment of a branch or pull request.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::meta::ObjectMeta;
use crate::error::Error;
use crate::naming;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub metadata: ObjectMeta,
    pub spec: InstanceSpec,
    #[serde(default)]
    pub status: InstanceStatus,
}

super::impl_resource!(Instance, super::Kind::Instance);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSpec {
    pub instance_git_settings: InstanceGitSettings,
    #[serde(default)]
    pub desired_phase: DesiredPhase,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceGitSettings {
    #[serde(flatten)]
    pub target: GitTarget,
    /// Last known head commit; empty until first resolved.
    #[serde(default)]
    pub commit_hash: String,
}

/// Exactly one of a branch name or a pull request number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GitTarget {
    Branch(String),
    PullRequestNumber(u64),
}

impl GitTarget {
    /// Branch name or stringified pull request number.
    pub fn identifier(&self) -> String {
        match self {
            GitTarget::Branch(branch) => branch.clone(),
            GitTarget::PullRequestNumber(number) => number.to_string(),
        }
    }

    /// Token used when deriving the instance name; keeps branch `7` and PR 7 apart.
    pub fn name_token(&self) -> String {
        match self {
            GitTarget::Branch(branch) => branch.clone(),
            GitTarget::PullRequestNumber(number) => format!("pr-{number}"),
        }
    }

    /// Git ref the build fetches.
    pub fn git_ref(&self) -> String {
        match self {
            GitTarget::Branch(branch) => format!("refs/heads/{branch}"),
            GitTarget::PullRequestNumber(number) => format!("refs/pull/{number}/head"),
        }
    }

    pub fn pull_request(&self) -> Option<u64> {
        match self {
            GitTarget::PullRequestNumber(number) => Some(*number),
            GitTarget::Branch(_) => None,
        }
    }
}

impl fmt::Display for GitTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GitTarget::Branch(branch) => write!(f, "branch {branch}"),
            GitTarget::PullRequestNumber(number) => write!(f, "pull request #{number}"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredPhase {
    #[default]
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    Pending,
    Building,
    Deploying,
    Running,
    Failed,
    Stopped,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Pending => "pending",
            Phase::Building => "building",
            Phase::Deploying => "deploying",
            Phase::Running => "running",
            Phase::Failed => "failed",
            Phase::Stopped => "stopped",
        }
    }

    /// Edges the automatic lifecycle may record. `last_active` is the phase a
    /// failed instance returns to.
    pub fn is_lifecycle_edge(self, next: Phase, last_active: Option<Phase>) -> bool {
        use Phase::*;
        match (self, next) {
            (Pending, Building) | (Building, Deploying) | (Deploying, Running) => true,
            (Running, Pending) => true,
            (Failed, Failed) => false,
            (_, Failed) => self != Stopped,
            (Failed, to) => last_active.unwrap_or(Pending) == to,
            _ => false,
        }
    }

    /// Edges driven by the operator's desired phase.
    pub fn is_operator_edge(self, next: Phase) -> bool {
        matches!(
            (self, next),
            (from, Phase::Stopped) if from != Phase::Stopped
        ) || (self == Phase::Stopped && next == Phase::Pending)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
    #[serde(default)]
    pub phase: Phase,
    #[serde(default)]
    pub built_versions: Vec<BuiltVersion>,
    #[serde(default)]
    pub public_facing_url: String,
    /// Commit the live workloads were rolled out from.
    #[serde(default)]
    pub deployed_commit: String,
    /// Phase that failed; a failed instance re-enters it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_active_phase: Option<Phase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Earliest time a failed instance re-enters its last active phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuiltVersion {
    /// Commit hash the image was built from.
    pub tag: String,
    pub timestamp: DateTime<Utc>,
}

impl InstanceStatus {
    /// Move to `next` along a lifecycle edge.
    pub fn transition(&mut self, next: Phase) -> Result<(), Error> {
        if self.phase == next {
            return Ok(());
        }
        if !self.phase.is_lifecycle_edge(next, self.last_active_phase) {
            return Err(Error::IllegalTransition {
                from: self.phase,
                to: next,
            });
        }
        self.apply(next);
        Ok(())
    }

    /// Move to `next` along an operator edge (desired phase changes).
    pub fn transition_by_operator(&mut self, next: Phase) -> Result<(), Error> {
        if self.phase == next {
            return Ok(());
        }
        if !self.phase.is_operator_edge(next) {
            return Err(Error::IllegalTransition {
                from: self.phase,
                to: next,
            });
        }
        self.apply(next);
        self.last_active_phase = None;
        Ok(())
    }

    fn apply(&mut self, next: Phase) {
        if next == Phase::Failed {
            self.last_active_phase = Some(self.phase);
        } else {
            self.last_active_phase = None;
            self.message = None;
            self.retry_at = None;
        }
        self.phase = next;
    }

    /// Record a failure of the current phase, retried no earlier than `retry_at`.
    pub fn fail(&mut self, message: String, retry_at: DateTime<Utc>) -> Result<(), Error> {
        self.transition(Phase::Failed)?;
        self.message = Some(message);
        self.retry_at = Some(retry_at);
        Ok(())
    }

    /// Whether the live workloads serve `commit`.
    pub fn serves(&self, commit: &str) -> bool {
        !commit.is_empty() && self.deployed_commit == commit
    }

    pub fn has_built_version(&self, tag: &str) -> bool {
        !tag.is_empty() && self.built_versions.iter().any(|v| v.tag == tag)
    }

    /// Append a built version and evict the oldest entries beyond `keep`.
    pub fn record_built_version(&mut self, tag: &str, at: DateTime<Utc>, keep: usize) {
        self.built_versions.push(BuiltVersion {
            tag: tag.to_string(),
            timestamp: at,
        });

        if self.built_versions.len() > keep {
            self.built_versions.sort_by_key(|v| v.timestamp);
            let excess = self.built_versions.len() - keep;
            self.built_versions.drain(..excess);
        }
    }
}

impl Instance {
    pub fn owner(&self) -> &str {
        self.metadata.label(naming::LABEL_OWNER).unwrap_or_default()
    }

    /// Uid of the owning environment, from the back-reference label.
    pub fn environment_id(&self) -> &str {
        self.metadata
            .label(naming::LABEL_ENVIRONMENT)
            .unwrap_or_default()
    }

    pub fn target(&self) -> &GitTarget {
        &self.spec.instance_git_settings.target
    }

    pub fn commit_hash(&self) -> &str {
        &self.spec.instance_git_settings.commit_hash
    }

    pub fn phase(&self) -> Phase {
        self.status.phase
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn retention_evicts_oldest_timestamp() {
        let base = Utc::now();
        let mut status = InstanceStatus::default();

        // insertion order deliberately differs from timestamp order
        let offsets = [5i64, 0, 9, 3, 7, 1, 8, 2, 6, 4, 10];
        for (i, offset) in offsets.iter().enumerate() {
            status.record_built_version(&format!("c{i}"), base + Duration::minutes(*offset), 10);
        }

        assert_eq!(status.built_versions.len(), 10);
        // "c1" carries the oldest timestamp
        assert!(!status.has_built_version("c1"));
        assert!(status.has_built_version("c0"));
        assert!(status.has_built_version("c10"));
    }

    #[test]
    fn retention_keeps_everything_under_cap() {
        let mut status = InstanceStatus::default();
        for i in 0..3 {
            status.record_built_version(&format!("c{i}"), Utc::now(), 10);
        }
        assert_eq!(status.built_versions.len(), 3);
    }

    #[test]
    fn empty_commit_is_never_built() {
        let mut status = InstanceStatus::default();
        status.record_built_version("", Utc::now(), 10);
        assert!(!status.has_built_version(""));
    }

    #[test]
    fn lifecycle_edges() {
        use Phase::*;
        let allowed = [
            (Pending, Building),
            (Building, Deploying),
            (Deploying, Running),
            (Running, Pending),
        ];
        let all = [Pending, Building, Deploying, Running, Failed, Stopped];
        for from in all {
            for to in all {
                if from == to || to == Failed || from == Failed {
                    continue;
                }
                assert_eq!(
                    from.is_lifecycle_edge(to, None),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn failed_returns_only_to_last_active_phase() {
        let mut status = InstanceStatus {
            phase: Phase::Building,
            ..Default::default()
        };
        status.transition(Phase::Failed).unwrap();
        assert_eq!(status.last_active_phase, Some(Phase::Building));

        assert!(status.clone().transition(Phase::Deploying).is_err());
        assert!(status.clone().transition(Phase::Pending).is_err());

        status.transition(Phase::Building).unwrap();
        assert_eq!(status.phase, Phase::Building);
        assert_eq!(status.last_active_phase, None);
    }

    #[test]
    fn skipping_stages_is_rejected() {
        let mut status = InstanceStatus::default();
        assert!(matches!(
            status.transition(Phase::Running),
            Err(Error::IllegalTransition { .. })
        ));
        assert!(status.transition(Phase::Deploying).is_err());
    }

    #[test]
    fn operator_edges_stop_and_resume() {
        let mut status = InstanceStatus {
            phase: Phase::Running,
            ..Default::default()
        };
        status.transition_by_operator(Phase::Stopped).unwrap();
        assert!(status.transition(Phase::Pending).is_err());
        status.transition_by_operator(Phase::Pending).unwrap();
        assert_eq!(status.phase, Phase::Pending);
    }

    #[test]
    fn git_target_serializes_as_single_field() {
        let settings = InstanceGitSettings {
            target: GitTarget::PullRequestNumber(12),
            commit_hash: String::new(),
        };
        let json = serde_json::to_value(&settings).unwrap();
        assert_eq!(json["pullRequestNumber"], 12);
        assert!(json.get("branch").is_none());

        let back: InstanceGitSettings =
            serde_json::from_value(serde_json::json!({"branch": "feature/x", "commitHash": "abc"}))
                .unwrap();
        assert_eq!(back.target, GitTarget::Branch("feature/x".into()));
    }
}
