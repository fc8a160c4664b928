//! Instance lifecycle reconciler.
//!
//! Drives one instance through `Pending → Building → Deploying → Running`,
//! watches the running commit for drift, and retries failed stages after a
//! backoff recorded on the instance itself. Every status change is persisted
//! before the pass returns.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use super::{default_error_policy, Action, Reconciler};
use crate::config::timings;
use crate::error::Error;
use crate::models::instance::{DesiredPhase, GitTarget, Phase};
use crate::models::{Environment, Instance, Labels, Resource};
use crate::naming;
use crate::services::build_service::{BuildProgress, BuildService};
use crate::services::comment_service::CommentService;
use crate::services::deploy_service::DeployService;
use crate::services::github_service::{ProviderError, RepositoryProvider};
use crate::store::{Api, StoreError};

pub struct InstanceReconciler {
    instances: Api<Instance>,
    environments: Api<Environment>,
    provider: Arc<dyn RepositoryProvider>,
    builds: BuildService,
    deployer: DeployService,
    comments: CommentService,
}

impl InstanceReconciler {
    pub fn new(
        instances: Api<Instance>,
        environments: Api<Environment>,
        provider: Arc<dyn RepositoryProvider>,
        builds: BuildService,
        deployer: DeployService,
        comments: CommentService,
    ) -> Self {
        Self {
            instances,
            environments,
            provider,
            builds,
            deployer,
            comments,
        }
    }

    /// Owning environment, found through the back-reference labels.
    async fn find_environment(&self, instance: &Instance) -> Result<Environment, Error> {
        let selector = Labels::from([(
            naming::LABEL_OWNER.to_string(),
            instance.owner().to_string(),
        )]);
        self.environments
            .list(&selector)
            .await?
            .into_iter()
            .find(|env| env.id() == instance.environment_id())
            .ok_or_else(|| Error::EnvironmentNotFound {
                owner: instance.owner().to_string(),
                uid: instance.environment_id().to_string(),
            })
    }

    /// Head commit of the instance's target; `None` once the pull request is
    /// closed or merged, or the branch is gone.
    async fn resolve_head(
        &self,
        env: &Environment,
        instance: &Instance,
    ) -> Result<Option<String>, ProviderError> {
        let (org, repo) = (env.organization(), env.repository());
        match instance.target() {
            GitTarget::PullRequestNumber(number) => {
                let pr = self.provider.pull_request(org, repo, *number).await?;
                Ok((!pr.is_finished()).then_some(pr.head_sha))
            }
            GitTarget::Branch(branch) => match self.provider.branch_head(org, repo, branch).await {
                Ok(sha) => Ok(Some(sha)),
                Err(ProviderError::Status { status: 404, .. }) => Ok(None),
                Err(e) => Err(e),
            },
        }
    }

    async fn save_status(&self, instance: &mut Instance) -> Result<(), Error> {
        *instance = self.instances.replace_status(instance).await?;
        crate::metrics::phase_changed(instance.phase().as_str());
        tracing::info!(instance = %instance.name(), phase = %instance.phase(), "Phase changed");
        Ok(())
    }

    async fn save_spec(&self, instance: &Instance) -> Result<Instance, Error> {
        self.instances.replace(instance).await?.ok_or_else(|| {
            StoreError::not_found(Instance::KIND, instance.namespace(), instance.name()).into()
        })
    }

    /// Record a stage failure and schedule the retry.
    async fn fail(
        &self,
        mut instance: Instance,
        error: Error,
        retry: Duration,
    ) -> Result<Action, Error> {
        if error.is_conflict() || error.is_not_found() {
            return Err(error);
        }
        tracing::warn!(
            instance = %instance.name(),
            phase = %instance.phase(),
            error = %error,
            retry_secs = retry.as_secs(),
            "Stage failed"
        );
        let retry_at = Utc::now()
            + chrono::Duration::from_std(retry).unwrap_or_else(|_| chrono::Duration::zero());
        instance.status.fail(error.to_string(), retry_at)?;
        self.save_status(&mut instance).await?;
        Ok(Action::requeue(retry))
    }

    async fn pending(&self, env: &Environment, mut instance: Instance) -> Result<Action, Error> {
        if instance.commit_hash().is_empty() {
            match self.resolve_head(env, &instance).await {
                Ok(Some(head)) => {
                    tracing::info!(instance = %instance.name(), commit = %head, "Resolved head commit");
                    instance.spec.instance_git_settings.commit_hash = head;
                    instance = self.save_spec(&instance).await?;
                }
                Ok(None) => {
                    tracing::info!(instance = %instance.name(), "Target finished before first build");
                    return Ok(Action::await_change());
                }
                Err(e) => {
                    tracing::warn!(instance = %instance.name(), error = %e, "Resolving head commit failed");
                    return Ok(Action::requeue(timings::PROVIDER_RETRY));
                }
            }
        }

        if instance.status.has_built_version(instance.commit_hash()) {
            tracing::info!(
                instance = %instance.name(),
                commit = %instance.commit_hash(),
                "Image already built, skipping build"
            );
            instance.status.transition(Phase::Building)?;
            self.save_status(&mut instance).await?;
            instance.status.transition(Phase::Deploying)?;
            self.save_status(&mut instance).await?;
            return Ok(Action::requeue(Duration::ZERO));
        }

        self.building(env, instance).await
    }

    async fn building(&self, env: &Environment, mut instance: Instance) -> Result<Action, Error> {
        match self.builds.build(env, &mut instance).await {
            Ok(BuildProgress::InProgress) => Ok(Action::requeue(timings::BUILD_POLL)),
            Ok(BuildProgress::Complete) => Ok(Action::requeue(Duration::ZERO)),
            Err(e @ (Error::BuildFailed { .. } | Error::BuildTimeout { .. })) => {
                self.fail(instance, e, timings::STAGE_RETRY).await
            }
            Err(e) => Err(e),
        }
    }

    async fn deploying(&self, env: &Environment, mut instance: Instance) -> Result<Action, Error> {
        if let Err(e) = self.deployer.deploy(env, &mut instance).await {
            return self.fail(instance, e, timings::STAGE_RETRY).await;
        }
        if let Err(e) = self.comments.publish(env, &instance, Utc::now()).await {
            return self
                .fail(instance, e.into(), timings::PROVIDER_RETRY)
                .await;
        }
        instance.status.transition(Phase::Running)?;
        self.save_status(&mut instance).await?;
        Ok(Action::await_change())
    }

    async fn running(&self, env: &Environment, instance: Instance) -> Result<Action, Error> {
        match self.resolve_head(env, &instance).await {
            Ok(None) => {
                tracing::debug!(instance = %instance.name(), "Target finished, instance frozen");
                Ok(Action::await_change())
            }
            Ok(Some(head))
                if head == instance.commit_hash() && instance.status.serves(&head) =>
            {
                Ok(Action::await_change())
            }
            Ok(Some(head)) => {
                mark_stale(&self.instances, instance, &head).await?;
                Ok(Action::requeue(Duration::ZERO))
            }
            Err(e) => {
                tracing::warn!(instance = %instance.name(), error = %e, "Checking head commit failed");
                Ok(Action::requeue(timings::PROVIDER_RETRY))
            }
        }
    }

    async fn failed(&self, mut instance: Instance) -> Result<Action, Error> {
        let now = Utc::now();
        if let Some(retry_at) = instance.status.retry_at {
            if now < retry_at {
                let wait = (retry_at - now).to_std().unwrap_or(timings::STAGE_RETRY);
                return Ok(Action::requeue(wait));
            }
        }
        let resume = instance.status.last_active_phase.unwrap_or(Phase::Pending);
        tracing::info!(instance = %instance.name(), phase = %resume, "Retrying failed stage");
        instance.status.transition(resume)?;
        self.save_status(&mut instance).await?;
        Ok(Action::requeue(Duration::ZERO))
    }

    async fn stop(&self, mut instance: Instance) -> Result<Action, Error> {
        if instance.phase() == Phase::Stopped {
            return Ok(Action::await_change());
        }
        self.deployer.remove(instance.name()).await?;
        self.builds.cancel(instance.name()).await?;
        instance.status.transition_by_operator(Phase::Stopped)?;
        self.save_status(&mut instance).await?;
        Ok(Action::await_change())
    }

    /// Remove workloads and the build job, then release the guard.
    async fn finalize(&self, mut instance: Instance) -> Result<Action, Error> {
        let name = instance.name().to_string();
        let cleanup = async {
            self.deployer.remove(&name).await?;
            self.builds.cancel(&name).await?;
            Ok::<_, Error>(())
        };
        if let Err(e) = cleanup.await {
            tracing::warn!(instance = %name, error = %e, "Workload cleanup failed");
            return Ok(Action::requeue(timings::DELETE_RETRY));
        }
        if instance.metadata.remove_finalizer(naming::FINALIZER) {
            self.instances.replace(&instance).await?;
            tracing::info!(instance = %name, "Instance deleted");
        }
        Ok(Action::await_change())
    }
}

/// Record a new head commit on a running instance and send it back to
/// `Pending`. Also resends an instance whose recorded commit already moved
/// but whose workloads still serve an older one. Instances in any other
/// phase are left alone. Returns whether the instance changed.
pub async fn mark_stale(
    instances: &Api<Instance>,
    mut instance: Instance,
    head: &str,
) -> Result<bool, Error> {
    if instance.phase() != Phase::Running
        || (instance.commit_hash() == head && instance.status.serves(head))
    {
        return Ok(false);
    }
    tracing::info!(
        instance = %instance.name(),
        from = %instance.status.deployed_commit,
        to = %head,
        "New commit detected"
    );
    if instance.commit_hash() != head {
        instance.spec.instance_git_settings.commit_hash = head.to_string();
        instance = instances.replace(&instance).await?.ok_or_else(|| {
            StoreError::not_found(Instance::KIND, instance.namespace(), instance.name())
        })?;
    }
    instance.status.transition(Phase::Pending)?;
    instances.replace_status(&instance).await?;
    crate::metrics::phase_changed(Phase::Pending.as_str());
    Ok(true)
}

#[async_trait]
impl Reconciler for InstanceReconciler {
    type Object = Instance;
    const NAME: &'static str = "instance";

    async fn reconcile(&self, mut instance: Instance) -> Result<Action, Error> {
        if instance.metadata.is_deleting() {
            return self.finalize(instance).await;
        }
        if instance.metadata.add_finalizer(naming::FINALIZER) {
            instance = self.save_spec(&instance).await?;
        }

        let env = self.find_environment(&instance).await?;

        match instance.spec.desired_phase {
            DesiredPhase::Stopped => return self.stop(instance).await,
            DesiredPhase::Running if instance.phase() == Phase::Stopped => {
                instance.status.transition_by_operator(Phase::Pending)?;
                self.save_status(&mut instance).await?;
                return Ok(Action::requeue(Duration::ZERO));
            }
            DesiredPhase::Running => {}
        }

        match instance.phase() {
            Phase::Pending => self.pending(&env, instance).await,
            Phase::Building => self.building(&env, instance).await,
            Phase::Deploying => self.deploying(&env, instance).await,
            Phase::Running => self.running(&env, instance).await,
            Phase::Failed => self.failed(instance).await,
            Phase::Stopped => Ok(Action::await_change()),
        }
    }

    fn error_policy(&self, _instance: &Instance, error: &Error) -> Action {
        match error {
            Error::EnvironmentNotFound { .. } => Action::requeue(timings::PROVIDER_RETRY),
            _ => default_error_policy(error),
        }
    }
}
