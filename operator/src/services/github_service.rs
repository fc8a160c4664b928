//! GitHub integration: webhook validation, repository state, PR comments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const USER_AGENT: &str = "preview-operator";
const PAGE_SIZE: u32 = 100;

/// Validate a GitHub webhook signature (X-Hub-Signature-256).
pub fn validate_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    if secret.is_empty() {
        tracing::warn!("Webhook secret not configured, skipping validation");
        return true;
    }

    let sig = signature.strip_prefix("sha256=").unwrap_or(signature);
    let sig_bytes = match hex::decode(sig) {
        Ok(b) => b,
        Err(_) => return false,
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.update(payload);

    mac.verify_slice(&sig_bytes).is_ok()
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned {status}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },

    #[error("unexpected response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

// ── Repository state ──

/// An open pull request as seen by detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestSummary {
    pub number: u64,
    pub head_ref: String,
    pub head_sha: String,
}

/// Current head and lifecycle of one pull request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestState {
    pub head_sha: String,
    pub open: bool,
    pub merged: bool,
}

impl PullRequestState {
    /// Closed or merged pull requests are frozen.
    pub fn is_finished(&self) -> bool {
        !self.open || self.merged
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueComment {
    pub id: u64,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// Source-hosting operations the reconcilers depend on.
#[async_trait]
pub trait RepositoryProvider: Send + Sync {
    async fn list_open_pull_requests(
        &self,
        org: &str,
        repo: &str,
    ) -> Result<Vec<PullRequestSummary>, ProviderError>;

    async fn list_branches(&self, org: &str, repo: &str) -> Result<Vec<String>, ProviderError>;

    async fn pull_request(
        &self,
        org: &str,
        repo: &str,
        number: u64,
    ) -> Result<PullRequestState, ProviderError>;

    /// Head commit of a branch.
    async fn branch_head(&self, org: &str, repo: &str, branch: &str)
        -> Result<String, ProviderError>;

    async fn list_comments(
        &self,
        org: &str,
        repo: &str,
        number: u64,
    ) -> Result<Vec<IssueComment>, ProviderError>;

    async fn create_comment(
        &self,
        org: &str,
        repo: &str,
        number: u64,
        body: &str,
    ) -> Result<(), ProviderError>;

    async fn delete_comment(&self, org: &str, repo: &str, id: u64) -> Result<(), ProviderError>;
}

// ── REST client ──

#[derive(Deserialize)]
struct PullRequestJson {
    number: u64,
    state: String,
    #[serde(default)]
    merged: bool,
    head: HeadJson,
}

#[derive(Deserialize)]
struct HeadJson {
    #[serde(rename = "ref")]
    git_ref: String,
    sha: String,
}

#[derive(Deserialize)]
struct BranchJson {
    name: String,
    commit: CommitJson,
}

#[derive(Deserialize)]
struct CommitJson {
    sha: String,
}

#[derive(Deserialize)]
struct CommentJson {
    id: u64,
    #[serde(default)]
    body: String,
    created_at: DateTime<Utc>,
}

/// GitHub REST API client; unauthenticated when no token is configured.
#[derive(Clone)]
pub struct GithubClient {
    http: reqwest::Client,
    api_url: String,
    token: String,
}

impl GithubClient {
    pub fn new(api_url: &str, token: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_url: api_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> (String, reqwest::RequestBuilder) {
        let url = format!("{}{path}", self.api_url);
        let mut builder = self
            .http
            .request(method, &url)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", USER_AGENT);
        if !self.token.is_empty() {
            builder = builder.header("Authorization", format!("Bearer {}", self.token));
        }
        (url, builder)
    }

    async fn send(
        url: String,
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, ProviderError> {
        let resp = builder
            .send()
            .await
            .map_err(|source| ProviderError::Transport {
                url: url.clone(),
                source,
            })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Status { url, status, body });
        }
        Ok(resp)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ProviderError> {
        let (url, builder) = self.request(reqwest::Method::GET, path);
        let resp = Self::send(url.clone(), builder).await?;
        resp.json()
            .await
            .map_err(|source| ProviderError::Decode { url, source })
    }
}

#[async_trait]
impl RepositoryProvider for GithubClient {
    async fn list_open_pull_requests(
        &self,
        org: &str,
        repo: &str,
    ) -> Result<Vec<PullRequestSummary>, ProviderError> {
        let prs: Vec<PullRequestJson> = self
            .get_json(&format!(
                "/repos/{org}/{repo}/pulls?state=open&per_page={PAGE_SIZE}"
            ))
            .await?;

        Ok(prs
            .into_iter()
            .map(|pr| PullRequestSummary {
                number: pr.number,
                head_ref: pr.head.git_ref,
                head_sha: pr.head.sha,
            })
            .collect())
    }

    async fn list_branches(&self, org: &str, repo: &str) -> Result<Vec<String>, ProviderError> {
        let branches: Vec<BranchJson> = self
            .get_json(&format!("/repos/{org}/{repo}/branches?per_page={PAGE_SIZE}"))
            .await?;

        Ok(branches
            .into_iter()
            .map(|b| b.name)
            .filter(|name| !name.is_empty())
            .collect())
    }

    async fn pull_request(
        &self,
        org: &str,
        repo: &str,
        number: u64,
    ) -> Result<PullRequestState, ProviderError> {
        let pr: PullRequestJson = self
            .get_json(&format!("/repos/{org}/{repo}/pulls/{number}"))
            .await?;

        Ok(PullRequestState {
            head_sha: pr.head.sha,
            open: pr.state == "open",
            merged: pr.merged,
        })
    }

    async fn branch_head(
        &self,
        org: &str,
        repo: &str,
        branch: &str,
    ) -> Result<String, ProviderError> {
        let branch: BranchJson = self
            .get_json(&format!("/repos/{org}/{repo}/branches/{branch}"))
            .await?;
        Ok(branch.commit.sha)
    }

    async fn list_comments(
        &self,
        org: &str,
        repo: &str,
        number: u64,
    ) -> Result<Vec<IssueComment>, ProviderError> {
        let comments: Vec<CommentJson> = self
            .get_json(&format!(
                "/repos/{org}/{repo}/issues/{number}/comments?per_page={PAGE_SIZE}"
            ))
            .await?;

        Ok(comments
            .into_iter()
            .map(|c| IssueComment {
                id: c.id,
                body: c.body,
                created_at: c.created_at,
            })
            .collect())
    }

    async fn create_comment(
        &self,
        org: &str,
        repo: &str,
        number: u64,
        body: &str,
    ) -> Result<(), ProviderError> {
        let (url, builder) = self.request(
            reqwest::Method::POST,
            &format!("/repos/{org}/{repo}/issues/{number}/comments"),
        );
        Self::send(url, builder.json(&serde_json::json!({ "body": body }))).await?;
        Ok(())
    }

    async fn delete_comment(&self, org: &str, repo: &str, id: u64) -> Result<(), ProviderError> {
        let (url, builder) = self.request(
            reqwest::Method::DELETE,
            &format!("/repos/{org}/{repo}/issues/comments/{id}"),
        );
        Self::send(url, builder).await?;
        Ok(())
    }
}
