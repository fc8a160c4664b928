//! Environment reconciler: derives the desired instance set from the
//! repository's open pull requests and branches, and cascades deletion.

use std::sync::Arc;

use async_trait::async_trait;

use super::{Action, Reconciler};
use crate::config::timings;
use crate::error::Error;
use crate::models::environment::{EnvironmentPhase, EnvironmentStatus};
use crate::models::instance::{
    DesiredPhase, GitTarget, InstanceGitSettings, InstanceSpec, InstanceStatus,
};
use crate::models::{Environment, Instance, ObjectMeta, Resource};
use crate::naming;
use crate::services::github_service::RepositoryProvider;
use crate::store::{Api, DeleteOutcome, StoreError};

pub struct EnvironmentReconciler {
    environments: Api<Environment>,
    instances: Api<Instance>,
    provider: Arc<dyn RepositoryProvider>,
}

/// What one detection pass found.
struct Detected {
    pull_requests: Vec<u64>,
    targets: Vec<GitTarget>,
}

impl EnvironmentReconciler {
    pub fn new(
        environments: Api<Environment>,
        instances: Api<Instance>,
        provider: Arc<dyn RepositoryProvider>,
    ) -> Self {
        Self {
            environments,
            instances,
            provider,
        }
    }

    async fn detect(&self, env: &Environment) -> Result<Detected, Error> {
        let (org, repo) = (env.organization(), env.repository());
        let settings = &env.spec.build_settings;
        let wildcard = settings
            .branch_wildcard
            .as_deref()
            .filter(|w| !w.is_empty());

        let open = self.provider.list_open_pull_requests(org, repo).await?;
        let mut pull_requests: Vec<u64> = open.iter().map(|pr| pr.number).collect();
        pull_requests.sort_unstable();

        let mut targets: Vec<GitTarget> = open
            .iter()
            .filter(|pr| {
                settings.build_all_pull_requests
                    || wildcard.map_or(true, |w| pr.head_ref.contains(w))
            })
            .map(|pr| GitTarget::PullRequestNumber(pr.number))
            .collect();

        if settings.build_all_branches {
            let branches = self.provider.list_branches(org, repo).await?;
            targets.extend(
                branches
                    .into_iter()
                    .filter(|b| wildcard.map_or(true, |w| b.contains(w)))
                    .map(GitTarget::Branch),
            );
        }

        Ok(Detected {
            pull_requests,
            targets,
        })
    }

    /// Create the instance for `target` unless one already exists. Existing
    /// instances are never reset. Targets whose names collide after
    /// sanitising share the first instance; returns whether one was created.
    async fn upsert_instance(&self, env: &Environment, target: GitTarget) -> Result<bool, Error> {
        let name = naming::instance_name_for(env, &target);
        if let Some(existing) = self.instances.get_opt(&name).await? {
            if existing.target() != &target {
                tracing::warn!(
                    environment = %env.name(),
                    instance = %name,
                    existing = %existing.target(),
                    target = %target,
                    "Instance name already taken by another target, skipping"
                );
            }
            return Ok(false);
        }

        let instance = Instance {
            metadata: ObjectMeta::new(env.namespace(), name.clone())
                .with_labels(naming::instance_labels(env, &target)),
            spec: InstanceSpec {
                instance_git_settings: InstanceGitSettings {
                    target,
                    commit_hash: String::new(),
                },
                desired_phase: DesiredPhase::Running,
            },
            status: InstanceStatus::default(),
        };

        match self.instances.create(&instance).await {
            Ok(_) => {
                tracing::info!(
                    environment = %env.name(),
                    instance = %name,
                    target = %instance.target(),
                    "Created instance"
                );
                Ok(true)
            }
            Err(StoreError::AlreadyExists { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_status(
        &self,
        env: &mut Environment,
        status: EnvironmentStatus,
    ) -> Result<(), Error> {
        if env.status != status {
            env.status = status;
            *env = self.environments.replace_status(env).await?;
        }
        Ok(())
    }

    /// Delete every owned instance; the guard goes once none remain.
    async fn finalize(&self, mut env: Environment) -> Result<Action, Error> {
        let name = env.name().to_string();
        let remaining = match self.delete_instances(&env).await {
            Ok(remaining) => remaining,
            Err(e) => {
                tracing::warn!(environment = %name, error = %e, "Instance cleanup failed");
                return Ok(Action::requeue(timings::DELETE_RETRY));
            }
        };
        if remaining > 0 {
            tracing::info!(environment = %name, remaining, "Waiting for instances to finish cleanup");
            return Ok(Action::requeue(timings::DELETE_RETRY));
        }

        if env.metadata.remove_finalizer(naming::FINALIZER) {
            self.environments.replace(&env).await?;
            tracing::info!(environment = %name, "Environment deleted");
        }
        Ok(Action::await_change())
    }

    /// Returns how many instances still exist.
    async fn delete_instances(&self, env: &Environment) -> Result<usize, Error> {
        let instances = self
            .instances
            .list(&naming::environment_selector(env))
            .await?;
        let mut remaining = 0;
        for instance in &instances {
            if instance.metadata.is_deleting() {
                remaining += 1;
                continue;
            }
            tracing::info!(environment = %env.name(), instance = %instance.name(), "Deleting instance");
            if self.instances.delete(instance.name()).await? == DeleteOutcome::Finalizing {
                remaining += 1;
            }
        }
        Ok(remaining)
    }
}

#[async_trait]
impl Reconciler for EnvironmentReconciler {
    type Object = Environment;
    const NAME: &'static str = "environment";

    async fn reconcile(&self, mut env: Environment) -> Result<Action, Error> {
        if env.metadata.is_deleting() {
            return self.finalize(env).await;
        }

        if env.metadata.add_finalizer(naming::FINALIZER) {
            env = self.environments.replace(&env).await?.ok_or_else(|| {
                StoreError::not_found(Environment::KIND, env.namespace(), env.name())
            })?;
        }

        let detected = match self.detect(&env).await {
            Ok(detected) => detected,
            Err(Error::Provider(e)) => {
                tracing::warn!(
                    environment = %env.name(),
                    org = %env.organization(),
                    repo = %env.repository(),
                    error = %e,
                    "Repository listing failed"
                );
                let status = EnvironmentStatus {
                    phase: EnvironmentPhase::Error,
                    ..env.status.clone()
                };
                self.update_status(&mut env, status).await?;
                return Ok(Action::requeue(timings::PROVIDER_RETRY));
            }
            Err(e) => return Err(e),
        };

        let mut created = 0;
        for target in detected.targets {
            if self.upsert_instance(&env, target).await? {
                created += 1;
            }
        }
        if created > 0 {
            crate::metrics::instances_created(created);
        }
        tracing::debug!(
            environment = %env.name(),
            pull_requests = ?detected.pull_requests,
            created,
            "Detection finished"
        );

        self.update_status(
            &mut env,
            EnvironmentStatus {
                pull_requests_detected: detected.pull_requests,
                phase: EnvironmentPhase::Ready,
            },
        )
        .await?;
        Ok(Action::await_change())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Labels;
    use crate::testing::Harness;

    #[tokio::test]
    async fn detection_is_idempotent() {
        let h = Harness::new();
        for n in 1..=3 {
            h.provider.open_pull_request(n, &format!("feature-{n}"), "sha").await;
        }
        let env = h.create_environment("org", "repo").await;
        let reconciler = h.environment_reconciler();

        reconciler.reconcile(env).await.unwrap();
        let first = h.instances.list(&Labels::new()).await.unwrap();
        assert_eq!(first.len(), 3);

        let env = h.environments.get("org-repo").await.unwrap();
        assert_eq!(env.status.pull_requests_detected, vec![1, 2, 3]);
        assert_eq!(env.status.phase, EnvironmentPhase::Ready);
        assert!(env.metadata.has_finalizer(naming::FINALIZER));

        reconciler.reconcile(env).await.unwrap();
        let second = h.instances.list(&Labels::new()).await.unwrap();
        assert_eq!(second.len(), 3);
        for (a, b) in first.iter().zip(&second) {
            assert_eq!(a.metadata.uid, b.metadata.uid);
            assert_eq!(a.metadata.resource_version, b.metadata.resource_version);
        }
    }

    #[tokio::test]
    async fn existing_instances_are_not_reset() {
        let h = Harness::new();
        h.provider.open_pull_request(5, "fix", "sha").await;
        let env = h.create_environment("org", "repo").await;
        let mut existing = h
            .create_instance(&env, GitTarget::PullRequestNumber(5), "old")
            .await;
        existing.status.phase = crate::models::Phase::Building;
        h.instances.replace_status(&existing).await.unwrap();

        h.environment_reconciler().reconcile(env).await.unwrap();

        let stored = h.instances.get(existing.name()).await.unwrap();
        assert_eq!(stored.commit_hash(), "old");
        assert_eq!(stored.phase(), crate::models::Phase::Building);
    }

    #[tokio::test]
    async fn branches_only_when_enabled_and_matching() {
        let h = Harness::new();
        h.provider.push_branch("main", "a").await;
        h.provider.push_branch("preview/login", "b").await;
        h.provider.push_branch("preview/signup", "c").await;

        let env = h.create_environment("org", "repo").await;
        h.environment_reconciler().reconcile(env).await.unwrap();
        assert!(h.instances.list(&Labels::new()).await.unwrap().is_empty());

        let mut env = h.environments.get("org-repo").await.unwrap();
        env.spec.build_settings.build_all_branches = true;
        env.spec.build_settings.branch_wildcard = Some("preview/".into());
        let env = h.environments.replace(&env).await.unwrap().unwrap();
        h.environment_reconciler().reconcile(env).await.unwrap();

        let mut branches: Vec<String> = h
            .instances
            .list(&Labels::new())
            .await
            .unwrap()
            .iter()
            .map(|i| i.target().identifier())
            .collect();
        branches.sort();
        assert_eq!(branches, vec!["preview/login", "preview/signup"]);
    }

    #[tokio::test]
    async fn colliding_branch_names_keep_first_instance() {
        let h = Harness::new();
        h.provider.push_branch("feat-a", "a").await;
        h.provider.push_branch("feat_a", "b").await;

        let mut env = crate::testing::environment("owner-1", "org", "repo");
        env.spec.build_settings.build_all_branches = true;
        let env = h.environments.create(&env).await.unwrap();
        let reconciler = h.environment_reconciler();
        reconciler.reconcile(env).await.unwrap();

        let instances = h.instances.list(&Labels::new()).await.unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].target(), &GitTarget::Branch("feat-a".into()));

        let env = h.environments.get("org-repo").await.unwrap();
        reconciler.reconcile(env).await.unwrap();
        let again = h.instances.list(&Labels::new()).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].metadata.resource_version, instances[0].metadata.resource_version);
        assert_eq!(
            h.environments.get("org-repo").await.unwrap().status.phase,
            EnvironmentPhase::Ready
        );
    }

    #[tokio::test]
    async fn wildcard_filters_pull_requests_without_build_all() {
        let h = Harness::new();
        h.provider.open_pull_request(1, "preview/a", "x").await;
        h.provider.open_pull_request(2, "chore/b", "y").await;

        let mut env = crate::testing::environment("owner-1", "org", "repo");
        env.spec.build_settings.build_all_pull_requests = false;
        env.spec.build_settings.branch_wildcard = Some("preview/".into());
        let env = h.environments.create(&env).await.unwrap();
        h.environment_reconciler().reconcile(env).await.unwrap();

        let instances = h.instances.list(&Labels::new()).await.unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].target(), &GitTarget::PullRequestNumber(1));
        // both are still reported as detected
        let env = h.environments.get("org-repo").await.unwrap();
        assert_eq!(env.status.pull_requests_detected, vec![1, 2]);
    }

    #[tokio::test]
    async fn provider_failure_marks_error_and_backs_off() {
        let h = Harness::new();
        h.provider.set_failing(true).await;
        let env = h.create_environment("org", "repo").await;

        let action = h.environment_reconciler().reconcile(env).await.unwrap();
        assert_eq!(action, Action::requeue(timings::PROVIDER_RETRY));
        let env = h.environments.get("org-repo").await.unwrap();
        assert_eq!(env.status.phase, EnvironmentPhase::Error);
    }

    #[tokio::test]
    async fn deletion_cascades_before_guard_release() {
        let h = Harness::new();
        h.provider.open_pull_request(1, "a", "sha-1").await;
        h.provider.open_pull_request(2, "b", "sha-2").await;
        let env = h.create_environment("org", "repo").await;
        let environments = h.environment_reconciler();
        let instances = h.instance_reconciler();
        environments.reconcile(env).await.unwrap();

        // bring both instances up so they own workloads
        for _ in 0..2 {
            for instance in h.instances.list(&Labels::new()).await.unwrap() {
                instances.reconcile(instance).await.unwrap();
            }
        }
        for instance in h.instances.list(&Labels::new()).await.unwrap() {
            h.finish_job(instance.name(), true).await;
        }
        for _ in 0..2 {
            for instance in h.instances.list(&Labels::new()).await.unwrap() {
                instances.reconcile(instance).await.unwrap();
            }
        }
        assert_eq!(h.deployments.list(&Labels::new()).await.unwrap().len(), 4);

        assert_eq!(
            h.environments.delete("org-repo").await.unwrap(),
            DeleteOutcome::Finalizing
        );
        let env = h.environments.get("org-repo").await.unwrap();
        let action = environments.reconcile(env).await.unwrap();
        assert_eq!(action, Action::requeue(timings::DELETE_RETRY));
        // guard still held while instances clean up
        assert!(h.environments.get_opt("org-repo").await.unwrap().is_some());

        for instance in h.instances.list(&Labels::new()).await.unwrap() {
            assert!(instance.metadata.is_deleting());
            instances.reconcile(instance).await.unwrap();
        }
        assert!(h.instances.list(&Labels::new()).await.unwrap().is_empty());
        assert!(h.deployments.list(&Labels::new()).await.unwrap().is_empty());
        assert!(h.ingresses.list(&Labels::new()).await.unwrap().is_empty());
        assert!(h.jobs.list(&Labels::new()).await.unwrap().is_empty());

        let env = h.environments.get("org-repo").await.unwrap();
        environments.reconcile(env).await.unwrap();
        assert!(h.environments.get_opt("org-repo").await.unwrap().is_none());
    }
}
