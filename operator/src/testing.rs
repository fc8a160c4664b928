//! Fixtures and in-process fakes for unit tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::{AuthProxySettings, BuildConfig};
use crate::controller::environment::EnvironmentReconciler;
use crate::controller::instance::InstanceReconciler;
use crate::models::environment::{
    AccessSettings, ApplicationSettings, BuildSettings, ContainerRegistry, EnvironmentSpec,
    EnvironmentStatus, GitSettings,
};
use crate::models::instance::{
    DesiredPhase, GitTarget, InstanceGitSettings, InstanceSpec, InstanceStatus,
};
use crate::models::workload::{Deployment, Ingress, Job, Pod, Service};
use crate::models::{Environment, Instance, ObjectMeta};
use crate::naming;
use crate::services::build_service::BuildService;
use crate::services::comment_service::CommentService;
use crate::services::deploy_service::DeployService;
use crate::services::github_service::{
    IssueComment, ProviderError, PullRequestState, PullRequestSummary, RepositoryProvider,
};
use crate::services::identity_service::{Group, IdentityError, IdentityProvider, User};
use crate::store::{Api, MemoryStore, ObjectStore};

pub const NAMESPACE: &str = "previews";

pub fn environment(owner: &str, org: &str, repo: &str) -> Environment {
    let mut metadata = ObjectMeta::new(NAMESPACE, naming::environment_name(org, repo));
    metadata.uid = Some(Uuid::new_v4());
    metadata
        .labels
        .insert(naming::LABEL_OWNER.to_string(), owner.to_string());

    Environment {
        metadata,
        spec: EnvironmentSpec {
            git_settings: GitSettings {
                organization: org.to_string(),
                repository: repo.to_string(),
            },
            container_registry: ContainerRegistry {
                registry: "registry.example.com".to_string(),
                repository: "previews".to_string(),
            },
            application_settings: ApplicationSettings {
                ingress_hostname: "preview.example.com".to_string(),
                port: 8080,
                environment_variables: Vec::new(),
                command: None,
            },
            build_settings: BuildSettings {
                build_all_pull_requests: true,
                ..Default::default()
            },
            display_name: format!("{org}/{repo}"),
            access_settings: AccessSettings::default(),
        },
        status: EnvironmentStatus::default(),
    }
}

pub fn instance(env: &Environment, target: GitTarget, commit: &str) -> Instance {
    let metadata = ObjectMeta::new(NAMESPACE, naming::instance_name_for(env, &target))
        .with_labels(naming::instance_labels(env, &target));
    Instance {
        metadata,
        spec: InstanceSpec {
            instance_git_settings: InstanceGitSettings {
                target,
                commit_hash: commit.to_string(),
            },
            desired_phase: DesiredPhase::Running,
        },
        status: InstanceStatus::default(),
    }
}

fn not_found(what: String) -> ProviderError {
    ProviderError::Status {
        url: what,
        status: 404,
        body: "Not Found".to_string(),
    }
}

// ── Repository provider ──

#[derive(Default)]
struct RepositoryState {
    open: Vec<PullRequestSummary>,
    pull_requests: HashMap<u64, PullRequestState>,
    branches: BTreeMap<String, String>,
    comments: HashMap<u64, Vec<IssueComment>>,
    next_comment_id: u64,
    clock: Option<DateTime<Utc>>,
    failing: bool,
}

/// Single-repository provider; organization and repository are ignored.
#[derive(Default)]
pub struct FakeRepository {
    state: Mutex<RepositoryState>,
}

impl FakeRepository {
    pub async fn open_pull_request(&self, number: u64, head_ref: &str, sha: &str) {
        let mut state = self.state.lock().await;
        state.open.retain(|pr| pr.number != number);
        state.open.push(PullRequestSummary {
            number,
            head_ref: head_ref.to_string(),
            head_sha: sha.to_string(),
        });
        state.pull_requests.insert(
            number,
            PullRequestState {
                head_sha: sha.to_string(),
                open: true,
                merged: false,
            },
        );
    }

    pub async fn merge_pull_request(&self, number: u64) {
        let mut state = self.state.lock().await;
        state.open.retain(|pr| pr.number != number);
        if let Some(pr) = state.pull_requests.get_mut(&number) {
            pr.open = false;
            pr.merged = true;
        }
    }

    pub async fn push_branch(&self, name: &str, sha: &str) {
        self.state
            .lock()
            .await
            .branches
            .insert(name.to_string(), sha.to_string());
    }

    pub async fn set_failing(&self, failing: bool) {
        self.state.lock().await.failing = failing;
    }

    /// Creation time stamped on new comments.
    pub async fn set_clock(&self, now: DateTime<Utc>) {
        self.state.lock().await.clock = Some(now);
    }

    pub async fn comments(&self, number: u64) -> Vec<IssueComment> {
        self.state
            .lock()
            .await
            .comments
            .get(&number)
            .cloned()
            .unwrap_or_default()
    }

    async fn check(&self) -> Result<(), ProviderError> {
        if self.state.lock().await.failing {
            return Err(ProviderError::Status {
                url: "https://api.github.test".to_string(),
                status: 502,
                body: "Bad Gateway".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RepositoryProvider for FakeRepository {
    async fn list_open_pull_requests(
        &self,
        _org: &str,
        _repo: &str,
    ) -> Result<Vec<PullRequestSummary>, ProviderError> {
        self.check().await?;
        Ok(self.state.lock().await.open.clone())
    }

    async fn list_branches(&self, _org: &str, _repo: &str) -> Result<Vec<String>, ProviderError> {
        self.check().await?;
        Ok(self.state.lock().await.branches.keys().cloned().collect())
    }

    async fn pull_request(
        &self,
        _org: &str,
        _repo: &str,
        number: u64,
    ) -> Result<PullRequestState, ProviderError> {
        self.check().await?;
        self.state
            .lock()
            .await
            .pull_requests
            .get(&number)
            .cloned()
            .ok_or_else(|| not_found(format!("pulls/{number}")))
    }

    async fn branch_head(
        &self,
        _org: &str,
        _repo: &str,
        branch: &str,
    ) -> Result<String, ProviderError> {
        self.check().await?;
        self.state
            .lock()
            .await
            .branches
            .get(branch)
            .cloned()
            .ok_or_else(|| not_found(format!("branches/{branch}")))
    }

    async fn list_comments(
        &self,
        _org: &str,
        _repo: &str,
        number: u64,
    ) -> Result<Vec<IssueComment>, ProviderError> {
        self.check().await?;
        Ok(self.comments(number).await)
    }

    async fn create_comment(
        &self,
        _org: &str,
        _repo: &str,
        number: u64,
        body: &str,
    ) -> Result<(), ProviderError> {
        self.check().await?;
        let mut state = self.state.lock().await;
        state.next_comment_id += 1;
        let comment = IssueComment {
            id: state.next_comment_id,
            body: body.to_string(),
            created_at: state.clock.unwrap_or_else(Utc::now),
        };
        state.comments.entry(number).or_default().push(comment);
        Ok(())
    }

    async fn delete_comment(&self, _org: &str, _repo: &str, id: u64) -> Result<(), ProviderError> {
        self.check().await?;
        let mut state = self.state.lock().await;
        for comments in state.comments.values_mut() {
            comments.retain(|c| c.id != id);
        }
        Ok(())
    }
}

// ── Identity provider ──

#[derive(Default)]
struct IdentityState {
    groups: Vec<Group>,
    memberships: Vec<(String, String)>,
    users: HashMap<u64, User>,
    installations: HashMap<String, u64>,
    failing: bool,
}

#[derive(Default)]
pub struct FakeIdentity {
    state: Mutex<IdentityState>,
}

impl FakeIdentity {
    pub async fn groups(&self) -> Vec<Group> {
        self.state.lock().await.groups.clone()
    }

    /// `(user id, group id)` pairs.
    pub async fn memberships(&self) -> Vec<(String, String)> {
        self.state.lock().await.memberships.clone()
    }

    pub async fn link_user(&self, github_id: u64, user_id: &str) {
        self.state.lock().await.users.insert(
            github_id,
            User {
                id: user_id.to_string(),
                username: format!("user-{github_id}"),
            },
        );
    }

    pub async fn set_failing(&self, failing: bool) {
        self.state.lock().await.failing = failing;
    }

    async fn check(&self) -> Result<(), IdentityError> {
        if self.state.lock().await.failing {
            return Err(IdentityError::Status {
                url: "https://id.example.test".to_string(),
                status: 503,
                body: "unavailable".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl IdentityProvider for FakeIdentity {
    async fn group_by_name(&self, name: &str) -> Result<Option<Group>, IdentityError> {
        self.check().await?;
        Ok(self
            .state
            .lock()
            .await
            .groups
            .iter()
            .find(|g| g.name == name)
            .cloned())
    }

    async fn create_group(&self, name: &str) -> Result<Group, IdentityError> {
        self.check().await?;
        let mut state = self.state.lock().await;
        let group = Group {
            id: format!("group-{}", state.groups.len() + 1),
            name: name.to_string(),
        };
        state.groups.push(group.clone());
        Ok(group)
    }

    async fn add_user_to_group(&self, user_id: &str, group_id: &str) -> Result<(), IdentityError> {
        self.check().await?;
        let mut state = self.state.lock().await;
        let pair = (user_id.to_string(), group_id.to_string());
        if !state.memberships.contains(&pair) {
            state.memberships.push(pair);
        }
        Ok(())
    }

    async fn user_by_github_id(&self, github_id: u64) -> Result<Option<User>, IdentityError> {
        self.check().await?;
        Ok(self.state.lock().await.users.get(&github_id).cloned())
    }

    async fn installation_id(&self, user_id: &str) -> Result<Option<u64>, IdentityError> {
        self.check().await?;
        Ok(self.state.lock().await.installations.get(user_id).copied())
    }

    async fn set_installation_id(
        &self,
        user_id: &str,
        installation_id: u64,
    ) -> Result<(), IdentityError> {
        self.check().await?;
        self.state
            .lock()
            .await
            .installations
            .insert(user_id.to_string(), installation_id);
        Ok(())
    }
}

// ── Harness ──

/// Memory store, typed APIs, fakes and services wired the way `main` wires them.
pub struct Harness {
    pub store: Arc<dyn ObjectStore>,
    pub environments: Api<Environment>,
    pub instances: Api<Instance>,
    pub jobs: Api<Job>,
    pub pods: Api<Pod>,
    pub deployments: Api<Deployment>,
    pub services: Api<Service>,
    pub ingresses: Api<Ingress>,
    pub provider: Arc<FakeRepository>,
    pub identity: Arc<FakeIdentity>,
    pub builds: BuildService,
    pub deployer: DeployService,
    pub comments: CommentService,
}

impl Harness {
    pub fn new() -> Self {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        let environments = Api::namespaced(store.clone(), NAMESPACE);
        let instances = Api::namespaced(store.clone(), NAMESPACE);
        let jobs = Api::namespaced(store.clone(), NAMESPACE);
        let pods = Api::namespaced(store.clone(), NAMESPACE);
        let deployments = Api::namespaced(store.clone(), NAMESPACE);
        let services = Api::namespaced(store.clone(), NAMESPACE);
        let ingresses = Api::namespaced(store.clone(), NAMESPACE);
        let provider = Arc::new(FakeRepository::default());
        let identity = Arc::new(FakeIdentity::default());

        let builds = BuildService::new(
            jobs.clone(),
            pods.clone(),
            instances.clone(),
            BuildConfig {
                image: "executor:test".to_string(),
                registry_secret: "dockerhub".to_string(),
                platform: "linux/amd64".to_string(),
            },
        );
        let deployer = DeployService::new(
            deployments.clone(),
            services.clone(),
            ingresses.clone(),
            instances.clone(),
            Some(AuthProxySettings {
                image: "oauth2-proxy:test".to_string(),
                client_id: "previews".to_string(),
                client_secret: "client-secret".to_string(),
                issuer_url: "https://id.example.com/realms/previews".to_string(),
                cookie_secret: "cookie-secret".to_string(),
            }),
            Some(identity.clone() as Arc<dyn IdentityProvider>),
        );
        let comments = CommentService::new(provider.clone());

        Self {
            store,
            environments,
            instances,
            jobs,
            pods,
            deployments,
            services,
            ingresses,
            provider,
            identity,
            builds,
            deployer,
            comments,
        }
    }

    pub fn environment_reconciler(&self) -> EnvironmentReconciler {
        EnvironmentReconciler::new(
            self.environments.clone(),
            self.instances.clone(),
            self.provider.clone(),
        )
    }

    pub fn instance_reconciler(&self) -> InstanceReconciler {
        InstanceReconciler::new(
            self.instances.clone(),
            self.environments.clone(),
            self.provider.clone(),
            self.builds.clone(),
            self.deployer.clone(),
            self.comments.clone(),
        )
    }

    /// Persist a fresh environment and return the stored copy.
    pub async fn create_environment(&self, org: &str, repo: &str) -> Environment {
        self.environments
            .create(&environment("owner-1", org, repo))
            .await
            .expect("create environment")
    }

    pub async fn create_instance(
        &self,
        env: &Environment,
        target: GitTarget,
        commit: &str,
    ) -> Instance {
        self.instances
            .create(&instance(env, target, commit))
            .await
            .expect("create instance")
    }

    /// Mark the instance's build job finished the way a job runner would.
    pub async fn finish_job(&self, instance: &str, succeeded: bool) {
        let mut job = self
            .jobs
            .get(&naming::build_job_name(instance))
            .await
            .expect("build job exists");
        let now = Utc::now();
        job.status.active = 0;
        job.status.start_time = Some(now);
        job.status.completion_time = Some(now);
        if succeeded {
            job.status.succeeded = 1;
        } else {
            job.status.failed = 1;
        }
        self.jobs.replace_status(&job).await.expect("update job");
    }
}
