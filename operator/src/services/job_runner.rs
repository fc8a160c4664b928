//! Local build job runner: executes queued build jobs with git and docker.
//!
//! Stands in for the cluster's job controller when the operator runs
//! against its own store. Picks the oldest queued build job, fetches the
//! pinned commit, builds and pushes the image, then records a terminated pod
//! and the job's outcome so the build service sees the same status a
//! cluster would report.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use tokio::process::Command;
use tokio::sync::watch;

use crate::config::timings;
use crate::error::Error;
use crate::models::workload::{
    ContainerStatus, ContainerTerminated, Job, Pod, PodPhase, PodSpec, PodStatus,
};
use crate::models::{Labels, ObjectMeta, Resource};
use crate::naming;
use crate::store::Api;

const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// What a build job asks for, read back from its builder arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildPlan {
    pub clone_url: String,
    pub git_ref: String,
    /// Commit the image must be built from; the ref tip when absent.
    pub commit: Option<String>,
    pub dockerfile: String,
    pub destination: String,
    pub platform: Option<String>,
}

impl BuildPlan {
    /// Parse the builder container's `--flag=value` arguments.
    pub fn from_job(job: &Job) -> Option<Self> {
        let container = job.spec.template.spec.containers.first()?;
        let flag = |name: &str| {
            container
                .args
                .iter()
                .find_map(|arg| arg.strip_prefix(name)?.strip_prefix('='))
                .map(str::to_string)
        };

        let context = flag("--context")?;
        let (repo, reference) = context.strip_prefix("git://")?.split_once('#')?;
        let (git_ref, commit) = match reference.split_once('#') {
            Some((git_ref, commit)) if !commit.is_empty() => (git_ref, Some(commit.to_string())),
            Some((git_ref, _)) => (git_ref, None),
            None => (reference, None),
        };
        Some(Self {
            clone_url: format!("https://{repo}"),
            git_ref: git_ref.to_string(),
            commit,
            dockerfile: flag("--dockerfile").unwrap_or_else(|| "Dockerfile".to_string()),
            destination: flag("--destination")?,
            platform: flag("--custom-platform"),
        })
    }
}

#[derive(Clone)]
pub struct JobRunner {
    jobs: Api<Job>,
    pods: Api<Pod>,
    workspace_dir: PathBuf,
}

impl JobRunner {
    pub fn new(jobs: Api<Job>, pods: Api<Pod>, workspace_dir: PathBuf) -> Self {
        Self {
            jobs,
            pods,
            workspace_dir,
        }
    }

    /// Run the poll loop until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(workspace = %self.workspace_dir.display(), "Build job runner started");

        loop {
            match self.run_next().await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => tracing::error!("Job runner poll error: {e}"),
            }
            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                _ = shutdown.changed() => break,
            }
        }
        tracing::info!("Build job runner stopped");
    }

    /// Oldest queued build job, if any.
    pub async fn next_queued(&self) -> Result<Option<Job>, Error> {
        let selector = Labels::from([(
            naming::LABEL_COMPONENT.to_string(),
            naming::COMPONENT_BUILD.to_string(),
        )]);
        Ok(self
            .jobs
            .list(&selector)
            .await?
            .into_iter()
            .filter(|job| job.is_queued() && !job.metadata.is_deleting())
            .min_by_key(|job| job.metadata.creation_timestamp))
    }

    /// Execute one queued job. Returns whether a job was picked up.
    pub async fn run_next(&self) -> Result<bool, Error> {
        let Some(mut job) = self.next_queued().await? else {
            return Ok(false);
        };

        job.status.active = 1;
        job.status.start_time = Some(Utc::now());
        // deleted since it was listed
        let mut job = match self.jobs.replace_status(&job).await {
            Ok(job) => job,
            Err(e) if e.is_not_found() => return Ok(true),
            Err(e) => return Err(e.into()),
        };

        tracing::info!(job = %job.name(), "Executing build job");
        let result = match BuildPlan::from_job(&job) {
            Some(plan) => self.execute(job.name(), &plan).await,
            None => Err("build job has no usable builder arguments".to_string()),
        };

        let exit_code = match &result {
            Ok(()) => 0,
            Err(reason) => {
                tracing::error!(job = %job.name(), "Build failed: {reason}");
                1
            }
        };
        self.record_pod(&job, exit_code).await?;

        job.status.active = 0;
        job.status.completion_time = Some(Utc::now());
        if exit_code == 0 {
            job.status.succeeded = 1;
        } else {
            job.status.failed = 1;
        }
        match self.jobs.replace_status(&job).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                tracing::info!(job = %job.name(), "Build job deleted while running");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(true)
    }

    async fn execute(&self, job: &str, plan: &BuildPlan) -> Result<(), String> {
        let work_dir = self.workspace_dir.join(job);
        if tokio::fs::try_exists(&work_dir).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&work_dir)
                .await
                .map_err(|e| format!("clearing workspace: {e}"))?;
        }
        tokio::fs::create_dir_all(&work_dir)
            .await
            .map_err(|e| format!("creating workspace: {e}"))?;

        let timeout = Duration::from_secs(timings::BUILD_TIMEOUT_MINUTES as u64 * 60);
        let outcome = tokio::time::timeout(timeout, async {
            run(&work_dir, "git", &["init", "--quiet"]).await?;
            run(&work_dir, "git", &["remote", "add", "origin", &plan.clone_url]).await?;
            let revision = plan.commit.as_deref().unwrap_or(&plan.git_ref);
            run(&work_dir, "git", &["fetch", "--depth", "1", "origin", revision]).await?;
            run(&work_dir, "git", &["checkout", "--quiet", "FETCH_HEAD"]).await?;

            let mut build: Vec<&str> = vec!["build", "-f", &plan.dockerfile, "-t", &plan.destination];
            if let Some(platform) = &plan.platform {
                build.extend(["--platform", platform.as_str()]);
            }
            build.push(".");
            run(&work_dir, "docker", &build).await?;
            run(&work_dir, "docker", &["push", &plan.destination]).await
        })
        .await;

        if let Err(e) = tokio::fs::remove_dir_all(&work_dir).await {
            tracing::warn!(job, "Failed to clean workspace: {e}");
        }

        match outcome {
            Ok(result) => result,
            Err(_) => Err(format!(
                "timed out after {} minutes",
                timings::BUILD_TIMEOUT_MINUTES
            )),
        }
    }

    /// Record the terminated builder pod so finished pods can be reaped.
    async fn record_pod(&self, job: &Job, exit_code: i32) -> Result<(), Error> {
        let mut labels = job.spec.template.labels.clone();
        labels.insert(naming::LABEL_JOB_NAME.to_string(), job.name().to_string());

        let pod = Pod {
            metadata: ObjectMeta::new(job.namespace(), format!("{}-run", job.name()))
                .with_labels(labels),
            spec: PodSpec {
                containers: job.spec.template.spec.containers.clone(),
                ..Default::default()
            },
            status: PodStatus {
                phase: if exit_code == 0 {
                    PodPhase::Succeeded
                } else {
                    PodPhase::Failed
                },
                container_statuses: job
                    .spec
                    .template
                    .spec
                    .containers
                    .iter()
                    .map(|c| ContainerStatus {
                        name: c.name.clone(),
                        terminated: Some(ContainerTerminated {
                            exit_code,
                            finished_at: Utc::now(),
                        }),
                    })
                    .collect(),
            },
        };
        let mut stored = self.pods.create_or_replace(&pod).await?;
        stored.status = pod.status;
        self.pods.replace_status(&stored).await?;
        Ok(())
    }
}

async fn run(dir: &Path, program: &str, args: &[&str]) -> Result<(), String> {
    let output = Command::new(program)
        .args(args)
        .current_dir(dir)
        .output()
        .await
        .map_err(|e| format!("{program} error: {e}"))?;

    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(format!("{program} {} failed: {stderr}", args.first().unwrap_or(&"")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::instance::GitTarget;
    use crate::testing::Harness;

    #[tokio::test]
    async fn plan_follows_builder_arguments() {
        let h = Harness::new();
        let env = h.create_environment("acme", "shop").await;
        let instance = h
            .create_instance(&env, GitTarget::PullRequestNumber(4), "abc123")
            .await;

        let plan = BuildPlan::from_job(&h.builds.job_for(&env, &instance)).unwrap();
        assert_eq!(plan.clone_url, "https://github.com/acme/shop.git");
        assert_eq!(plan.git_ref, GitTarget::PullRequestNumber(4).git_ref());
        assert_eq!(plan.commit.as_deref(), Some("abc123"));
        assert_eq!(plan.dockerfile, "Dockerfile");
        assert_eq!(plan.destination, naming::image_reference(&env, "abc123"));
        assert_eq!(plan.platform.as_deref(), Some("linux/amd64"));
    }

    #[tokio::test]
    async fn job_without_context_has_no_plan() {
        let h = Harness::new();
        let env = h.create_environment("acme", "shop").await;
        let instance = h
            .create_instance(&env, GitTarget::Branch("main".into()), "abc123")
            .await;
        let mut job = h.builds.job_for(&env, &instance);
        job.spec.template.spec.containers[0]
            .args
            .retain(|a| !a.starts_with("--context"));

        assert_eq!(BuildPlan::from_job(&job), None);
    }

    #[tokio::test]
    async fn unpinned_context_fetches_ref_tip() {
        let h = Harness::new();
        let env = h.create_environment("acme", "shop").await;
        let instance = h
            .create_instance(&env, GitTarget::Branch("main".into()), "abc123")
            .await;
        let mut job = h.builds.job_for(&env, &instance);
        for arg in &mut job.spec.template.spec.containers[0].args {
            if arg.starts_with("--context=") {
                *arg = "--context=git://github.com/acme/shop.git#refs/heads/main".to_string();
            }
        }

        let plan = BuildPlan::from_job(&job).unwrap();
        assert_eq!(plan.git_ref, "refs/heads/main");
        assert_eq!(plan.commit, None);
    }

    #[tokio::test]
    async fn picks_oldest_queued_build_job() {
        let h = Harness::new();
        let env = h.create_environment("acme", "shop").await;
        let first = h
            .create_instance(&env, GitTarget::PullRequestNumber(1), "aaa")
            .await;
        let second = h
            .create_instance(&env, GitTarget::PullRequestNumber(2), "bbb")
            .await;
        h.jobs.create(&h.builds.job_for(&env, &first)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        h.jobs.create(&h.builds.job_for(&env, &second)).await.unwrap();
        h.finish_job(first.name(), true).await;

        let runner = JobRunner::new(h.jobs.clone(), h.pods.clone(), PathBuf::from("/tmp"));
        let next = runner.next_queued().await.unwrap().unwrap();
        assert_eq!(next.name(), naming::build_job_name(second.name()));
    }

    #[tokio::test]
    async fn terminated_pod_is_recorded_for_reaping() {
        let h = Harness::new();
        let env = h.create_environment("acme", "shop").await;
        let instance = h
            .create_instance(&env, GitTarget::PullRequestNumber(1), "aaa")
            .await;
        let job = h.jobs.create(&h.builds.job_for(&env, &instance)).await.unwrap();

        let runner = JobRunner::new(h.jobs.clone(), h.pods.clone(), PathBuf::from("/tmp"));
        runner.record_pod(&job, 1).await.unwrap();

        let pod = h.pods.get(&format!("{}-run", job.name())).await.unwrap();
        assert!(pod.is_finished());
        assert_eq!(pod.status.phase, PodPhase::Failed);
        assert_eq!(
            pod.status.container_statuses[0]
                .terminated
                .as_ref()
                .map(|t| t.exit_code),
            Some(1)
        );
    }
}
