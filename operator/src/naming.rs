//! Deterministic names, labels, paths and image references.
//!
//! Everything here is pure: the same inputs always produce the same string,
//! which is what makes instance upserts and workload lookups idempotent.

use std::sync::LazyLock;

use regex::Regex;

use crate::models::environment::Environment;
use crate::models::instance::{GitTarget, Instance};
use crate::models::Labels;

/// Deletion guard attached to environments and instances.
pub const FINALIZER: &str = "coflnet.com.pr.env/finalizer";

pub const LABEL_OWNER: &str = "owner";
pub const LABEL_ENVIRONMENT: &str = "previewenvironment";
pub const LABEL_GIT_ORGANIZATION: &str = "git-organization";
pub const LABEL_GIT_REPOSITORY: &str = "git-repository";
pub const LABEL_IDENTIFIER: &str = "branch-or-pr";
pub const LABEL_APP: &str = "app";
pub const LABEL_INSTANCE: &str = "instance";
pub const LABEL_COMMIT: &str = "commit";
pub const LABEL_COMPONENT: &str = "component";
pub const LABEL_JOB_NAME: &str = "job-name";

pub const COMPONENT_BUILD: &str = "build";

const ENVIRONMENT_NAME_LIMIT: usize = 50;
const INSTANCE_NAME_SUFFIX: usize = 45;
const INSTANCE_PREFIX: &str = "pei-";
const BUILD_PREFIX: &str = "build-";

static INVALID_NAME_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9.-]").expect("valid name regex"));

/// Lower-case and replace anything outside `[a-z0-9.-]` (slashes included) with `-`.
pub fn sanitize(value: &str) -> String {
    INVALID_NAME_CHARS
        .replace_all(&value.to_lowercase(), "-")
        .into_owned()
}

/// Keep the last `limit` characters of an ASCII string.
fn keep_suffix(value: &str, limit: usize) -> &str {
    if value.len() > limit {
        &value[value.len() - limit..]
    } else {
        value
    }
}

/// Environment name for a repository: `{org}-{repo}`, at most 50 characters,
/// truncated from the front so the most specific part survives.
pub fn environment_name(organization: &str, repository: &str) -> String {
    let name = sanitize(&format!("{organization}-{repository}"));
    keep_suffix(&name, ENVIRONMENT_NAME_LIMIT).to_string()
}

/// Instance name derived from owner, environment, repository and branch/PR token.
pub fn instance_name(
    environment: &str,
    owner: &str,
    organization: &str,
    repository: &str,
    token: &str,
) -> String {
    let name = sanitize(&format!(
        "{INSTANCE_PREFIX}{owner}-{environment}-{organization}-{repository}-{token}"
    ));
    if name.len() > INSTANCE_NAME_SUFFIX {
        format!("{INSTANCE_PREFIX}{}", keep_suffix(&name, INSTANCE_NAME_SUFFIX))
    } else {
        name
    }
}

/// Instance name for `target` under `env`.
pub fn instance_name_for(env: &Environment, target: &GitTarget) -> String {
    instance_name(
        &env.metadata.name,
        env.owner(),
        env.organization(),
        env.repository(),
        &target.name_token(),
    )
}

pub fn auth_proxy_name(instance: &str) -> String {
    format!("{instance}-auth-proxy")
}

/// Build job name; reused for every build of the instance.
pub fn build_job_name(instance: &str) -> String {
    format!("{BUILD_PREFIX}{instance}")
}

pub fn tls_secret_name(name: &str) -> String {
    format!("{name}-tls")
}

/// Image reference for a commit of the environment's repository.
pub fn image_reference(env: &Environment, commit: &str) -> String {
    let registry = &env.spec.container_registry;
    format!(
        "{}/{}/pr-env:{}",
        registry.registry,
        registry.repository,
        sanitize(&format!(
            "{}-{}-{}",
            env.organization(),
            env.repository(),
            commit
        ))
    )
}

/// HTTP path the application is served under.
pub fn http_path(env: &Environment, instance: &Instance) -> String {
    format!(
        "/{}/{}/{}/{}",
        env.organization(),
        env.repository(),
        sanitize(&instance.target().identifier()),
        instance.commit_hash()
    )
}

pub fn auth_proxy_path(app_path: &str) -> String {
    format!("{app_path}/oauth2")
}

pub fn public_url(host: &str, path: &str) -> String {
    format!("https://{host}{path}")
}

/// Back-reference labels an instance carries to find its environment.
pub fn instance_labels(env: &Environment, target: &GitTarget) -> Labels {
    Labels::from([
        (LABEL_OWNER.to_string(), env.owner().to_string()),
        (LABEL_ENVIRONMENT.to_string(), env.id()),
        (
            LABEL_GIT_ORGANIZATION.to_string(),
            sanitize(env.organization()),
        ),
        (
            LABEL_GIT_REPOSITORY.to_string(),
            sanitize(env.repository()),
        ),
        (LABEL_IDENTIFIER.to_string(), sanitize(&target.identifier())),
    ])
}

/// Selector for every instance of a repository and branch/PR identifier.
pub fn repository_selector(organization: &str, repository: &str, identifier: &str) -> Labels {
    Labels::from([
        (LABEL_GIT_ORGANIZATION.to_string(), sanitize(organization)),
        (LABEL_GIT_REPOSITORY.to_string(), sanitize(repository)),
        (LABEL_IDENTIFIER.to_string(), sanitize(identifier)),
    ])
}

/// Selector for every instance belonging to an environment.
pub fn environment_selector(env: &Environment) -> Labels {
    Labels::from([
        (LABEL_OWNER.to_string(), env.owner().to_string()),
        (LABEL_ENVIRONMENT.to_string(), env.id()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn environment_name_keeps_most_specific_suffix() {
        assert_eq!(environment_name("Coflnet", "PR-Env"), "coflnet-pr-env");

        let long_repo = "r".repeat(60);
        let name = environment_name("org", &long_repo);
        assert_eq!(name.len(), 50);
        assert!(name.chars().all(|c| c == 'r'));
    }

    #[test]
    fn instance_name_is_deterministic_and_bounded() {
        let a = instance_name("env", "Owner", "Org", "Repo", "feature/Login");
        let b = instance_name("env", "Owner", "Org", "Repo", "feature/Login");
        assert_eq!(a, b);
        assert_eq!(a, "pei-owner-env-org-repo-feature-login");

        let long = instance_name(
            "some-environment-name",
            "0f6d7e1c-8a2b-4c3d-9e0f-123456789abc",
            "organization",
            "repository",
            "feature/very-long-branch-name",
        );
        assert_eq!(long.len(), INSTANCE_PREFIX.len() + INSTANCE_NAME_SUFFIX);
        assert!(long.starts_with("pei-"));
        assert!(long.ends_with("feature-very-long-branch-name"));
        assert!(!long.contains('/'));
    }

    #[test]
    fn pull_request_and_branch_names_differ() {
        let env = testing::environment("owner-1", "org", "repo");
        let pr = instance_name_for(&env, &GitTarget::PullRequestNumber(7));
        let branch = instance_name_for(&env, &GitTarget::Branch("7".into()));
        assert_ne!(pr, branch);
    }

    #[test]
    fn paths_and_images() {
        let env = testing::environment("owner-1", "Org", "repo");
        let instance = testing::instance(&env, GitTarget::Branch("feat/a".into()), "abc123");

        assert_eq!(http_path(&env, &instance), "/Org/repo/feat-a/abc123");
        assert_eq!(
            public_url("preview.example.com", &http_path(&env, &instance)),
            "https://preview.example.com/Org/repo/feat-a/abc123"
        );
        assert_eq!(auth_proxy_path("/a/b"), "/a/b/oauth2");
        assert_eq!(
            image_reference(&env, "abc123"),
            "registry.example.com/previews/pr-env:org-repo-abc123"
        );
    }
}
