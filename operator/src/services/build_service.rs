//! Build orchestration: one build job per instance, checked without blocking.
//!
//! Each call inspects the instance's build job and either reports progress,
//! records the finished image, or submits a new job. The caller requeues on
//! [`BuildProgress::InProgress`] instead of waiting.

use chrono::{DateTime, Duration, Utc};

use crate::config::{timings, BuildConfig};
use crate::error::Error;
use crate::models::instance::Phase;
use crate::models::workload::{
    Container, Job, JobSpec, JobStatus, KeyToPath, Pod, PodSpec, PodTemplate, SecretVolumeSource,
    Volume, VolumeMount,
};
use crate::models::{Environment, Instance, Labels, ObjectMeta, Resource};
use crate::naming;
use crate::store::{Api, DeleteOutcome};

const BUILDER_CONTAINER: &str = "kaniko";
const REGISTRY_VOLUME: &str = "registry-credentials";
const REGISTRY_MOUNT: &str = "/kaniko/.docker";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildProgress {
    /// A job for the current commit is queued or running.
    InProgress,
    /// The image exists; the instance is marked for deployment.
    Complete,
}

#[derive(Clone)]
pub struct BuildService {
    jobs: Api<Job>,
    pods: Api<Pod>,
    instances: Api<Instance>,
    config: BuildConfig,
}

impl BuildService {
    pub fn new(jobs: Api<Job>, pods: Api<Pod>, instances: Api<Instance>, config: BuildConfig) -> Self {
        Self {
            jobs,
            pods,
            instances,
            config,
        }
    }

    /// Advance the build of `instance`'s current commit. Status changes are
    /// persisted and written back into `instance`.
    pub async fn build(
        &self,
        env: &Environment,
        instance: &mut Instance,
    ) -> Result<BuildProgress, Error> {
        let job_name = naming::build_job_name(instance.name());
        let commit = instance.commit_hash().to_string();
        let now = Utc::now();

        if let Some(job) = self.jobs.get_opt(&job_name).await? {
            let same_commit = job.metadata.label(naming::LABEL_COMMIT) == Some(commit.as_str());

            if job.is_active() || job.is_queued() {
                let started = job
                    .status
                    .start_time
                    .or(job.metadata.creation_timestamp)
                    .unwrap_or(now);
                if now - started > Duration::minutes(timings::BUILD_TIMEOUT_MINUTES) {
                    tracing::warn!(job = %job_name, "Build job timed out, deleting");
                    self.jobs.delete(&job_name).await?;
                    return Err(Error::BuildTimeout {
                        job: job_name,
                        minutes: timings::BUILD_TIMEOUT_MINUTES,
                    });
                }
                tracing::debug!(job = %job_name, same_commit, "Build job still running");
                return Ok(BuildProgress::InProgress);
            }

            if same_commit && job.is_succeeded() {
                return self.finish(instance, &job, now).await;
            }

            if same_commit && job.is_failed() {
                tracing::warn!(job = %job_name, commit = %commit, "Build job failed");
                self.jobs.delete(&job_name).await?;
                return Err(Error::BuildFailed { job: job_name });
            }

            tracing::info!(job = %job_name, "Removing finished build job of an older commit");
            self.jobs.delete(&job_name).await?;
        }

        if instance.phase() != Phase::Building {
            instance.status.transition(Phase::Building)?;
            *instance = self.instances.replace_status(instance).await?;
            crate::metrics::phase_changed(Phase::Building.as_str());
        }

        let job = self.job_for(env, instance);
        tracing::info!(
            job = %job_name,
            instance = %instance.name(),
            commit = %commit,
            destination = %naming::image_reference(env, &commit),
            "Submitting build job"
        );
        match self.jobs.create(&job).await {
            Ok(_) => {}
            Err(crate::store::StoreError::AlreadyExists { .. }) => {
                tracing::debug!(job = %job_name, "Build job submitted concurrently");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(BuildProgress::InProgress)
    }

    async fn finish(
        &self,
        instance: &mut Instance,
        job: &Job,
        now: DateTime<Utc>,
    ) -> Result<BuildProgress, Error> {
        let commit = instance.commit_hash().to_string();
        if !instance.status.has_built_version(&commit) {
            instance
                .status
                .record_built_version(&commit, now, timings::BUILT_VERSION_LIMIT);
        }
        if instance.phase() != Phase::Building {
            instance.status.transition(Phase::Building)?;
        }
        instance.status.transition(Phase::Deploying)?;
        *instance = self.instances.replace_status(instance).await?;
        crate::metrics::phase_changed(Phase::Deploying.as_str());

        if let (Some(start), Some(end)) = (job.status.start_time, job.status.completion_time) {
            crate::metrics::build_duration((end - start).num_milliseconds() as f64 / 1000.0);
        }
        tracing::info!(instance = %instance.name(), commit = %commit, "Build finished");

        let pods = self.pods.clone();
        tokio::spawn(async move {
            if let Err(e) = reap_finished_pods(&pods, Utc::now()).await {
                tracing::warn!(error = %e, "Failed to reap finished build pods");
            }
        });

        Ok(BuildProgress::Complete)
    }

    /// Delete the build job of `instance`, if any.
    pub async fn cancel(&self, instance: &str) -> Result<DeleteOutcome, Error> {
        Ok(self.jobs.delete(&naming::build_job_name(instance)).await?)
    }

    /// Job that fetches the instance's ref pinned to its commit and pushes
    /// the commit's image.
    pub fn job_for(&self, env: &Environment, instance: &Instance) -> Job {
        let name = naming::build_job_name(instance.name());
        let commit = instance.commit_hash();
        let labels = Labels::from([
            (naming::LABEL_INSTANCE.to_string(), instance.name().to_string()),
            (naming::LABEL_COMMIT.to_string(), commit.to_string()),
            (
                naming::LABEL_COMPONENT.to_string(),
                naming::COMPONENT_BUILD.to_string(),
            ),
            (naming::LABEL_OWNER.to_string(), env.owner().to_string()),
        ]);
        let dockerfile = env
            .spec
            .build_settings
            .dockerfile_path
            .clone()
            .unwrap_or_else(|| "Dockerfile".to_string());

        let container = Container {
            name: BUILDER_CONTAINER.to_string(),
            image: self.config.image.clone(),
            args: vec![
                format!("--dockerfile={dockerfile}"),
                format!(
                    "--context=git://github.com/{}/{}.git#{}#{commit}",
                    env.organization(),
                    env.repository(),
                    instance.target().git_ref()
                ),
                format!("--destination={}", naming::image_reference(env, commit)),
                format!("--custom-platform={}", self.config.platform),
            ],
            volume_mounts: vec![VolumeMount {
                name: REGISTRY_VOLUME.to_string(),
                mount_path: REGISTRY_MOUNT.to_string(),
            }],
            ..Default::default()
        };

        let mut pod_labels = labels.clone();
        pod_labels.insert(naming::LABEL_JOB_NAME.to_string(), name.clone());

        Job {
            metadata: ObjectMeta::new(instance.namespace(), name).with_labels(labels),
            spec: JobSpec {
                ttl_seconds_after_finished: Some(timings::BUILD_JOB_TTL_SECS),
                template: PodTemplate {
                    labels: pod_labels,
                    spec: PodSpec {
                        containers: vec![container],
                        volumes: vec![Volume {
                            name: REGISTRY_VOLUME.to_string(),
                            secret: SecretVolumeSource {
                                secret_name: self.config.registry_secret.clone(),
                                items: vec![KeyToPath {
                                    key: ".dockerconfigjson".to_string(),
                                    path: "config.json".to_string(),
                                }],
                            },
                        }],
                        restart_policy: Some("OnFailure".to_string()),
                    },
                },
            },
            status: JobStatus::default(),
        }
    }
}

/// Delete finished build pods whose containers terminated before the
/// retention window.
pub async fn reap_finished_pods(pods: &Api<Pod>, now: DateTime<Utc>) -> Result<usize, Error> {
    let cutoff = now - Duration::minutes(timings::POD_RETENTION_MINUTES);
    let mut reaped = 0;

    for pod in pods.list(&Labels::new()).await? {
        if !pod.metadata.name.starts_with("build-") || !pod.is_finished() {
            continue;
        }
        let expired = pod
            .status
            .container_statuses
            .iter()
            .filter_map(|c| c.terminated.as_ref())
            .any(|t| t.finished_at < cutoff);
        if expired {
            pods.delete(&pod.metadata.name).await?;
            reaped += 1;
        }
    }

    if reaped > 0 {
        tracing::info!(reaped, "Reaped finished build pods");
    }
    Ok(reaped)
}
