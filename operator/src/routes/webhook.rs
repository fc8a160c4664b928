//! GitHub webhook handler for push, pull request and installation events.
//!
//! Events only mark matching instances stale and schedule reconciles; the
//! reconcilers do the actual work, so redelivered events are harmless.

use axum::body::Bytes;
use axum::http::{HeaderMap, StatusCode};

use super::RouterState;
use crate::controller::instance::mark_stale;
use crate::models::instance::GitTarget;
use crate::models::{Instance, Labels, Resource};
use crate::naming;
use crate::services::github_service;

/// Handle an incoming GitHub webhook payload.
pub async fn handle_webhook(
    state: &RouterState,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<StatusCode, StatusCode> {
    let signature = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if !github_service::validate_signature(&state.webhook_secret, &body, signature) {
        tracing::warn!("Webhook signature validation failed");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let event_type = headers
        .get("x-github-event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown");

    let payload: serde_json::Value =
        serde_json::from_slice(&body).map_err(|_| StatusCode::BAD_REQUEST)?;

    match event_type {
        "push" => handle_push(state, &payload).await,
        "pull_request" => handle_pull_request(state, &payload).await,
        "installation" => handle_installation(state, &payload).await,
        "ping" => {
            tracing::info!("Received GitHub ping webhook");
            Ok(StatusCode::OK)
        }
        _ => {
            tracing::debug!("Ignoring webhook event: {}", event_type);
            Ok(StatusCode::OK)
        }
    }
}

/// `(organization, repository)` from `repository.full_name`.
fn repository(payload: &serde_json::Value) -> Option<(&str, &str)> {
    payload["repository"]["full_name"]
        .as_str()?
        .split_once('/')
        .filter(|(org, repo)| !org.is_empty() && !repo.is_empty())
}

async fn handle_push(
    state: &RouterState,
    payload: &serde_json::Value,
) -> Result<StatusCode, StatusCode> {
    let Some((org, repo)) = repository(payload) else {
        return Ok(StatusCode::OK);
    };
    let commit_sha = payload["after"].as_str().unwrap_or_default();
    let branch = payload["ref"]
        .as_str()
        .unwrap_or_default()
        .strip_prefix("refs/heads/")
        .unwrap_or_default();
    let deleted = payload["deleted"].as_bool().unwrap_or(false);

    if commit_sha.is_empty() || branch.is_empty() || deleted {
        return Ok(StatusCode::OK);
    }

    let target = GitTarget::Branch(branch.to_string());
    let touched = refresh_instances(state, org, repo, &target, commit_sha).await?;
    schedule_environments(state, org, repo).await?;

    tracing::info!(org, repo, branch, commit = commit_sha, touched, "Push received");
    Ok(StatusCode::ACCEPTED)
}

async fn handle_pull_request(
    state: &RouterState,
    payload: &serde_json::Value,
) -> Result<StatusCode, StatusCode> {
    let action = payload["action"].as_str().unwrap_or_default();
    if action != "opened" && action != "synchronize" && action != "reopened" {
        return Ok(StatusCode::OK);
    }

    let Some((org, repo)) = repository(payload) else {
        return Ok(StatusCode::OK);
    };
    let Some(number) = payload["number"].as_u64() else {
        return Ok(StatusCode::OK);
    };
    let commit_sha = payload["pull_request"]["head"]["sha"]
        .as_str()
        .unwrap_or_default();
    if commit_sha.is_empty() {
        return Ok(StatusCode::OK);
    }

    let target = GitTarget::PullRequestNumber(number);
    let touched = refresh_instances(state, org, repo, &target, commit_sha).await?;
    schedule_environments(state, org, repo).await?;

    tracing::info!(org, repo, pr = number, action, commit = commit_sha, touched, "Pull request event received");
    Ok(StatusCode::ACCEPTED)
}

/// Link the GitHub App installation to the sender's identity user.
async fn handle_installation(
    state: &RouterState,
    payload: &serde_json::Value,
) -> Result<StatusCode, StatusCode> {
    if payload["action"].as_str() != Some("created") {
        return Ok(StatusCode::OK);
    }
    let (Some(github_id), Some(installation_id)) = (
        payload["sender"]["id"].as_u64(),
        payload["installation"]["id"].as_u64(),
    ) else {
        return Err(StatusCode::BAD_REQUEST);
    };
    let Some(identity) = &state.identity else {
        tracing::warn!(installation_id, "Identity provider not configured, ignoring installation");
        return Ok(StatusCode::OK);
    };

    let user = identity.user_by_github_id(github_id).await.map_err(|e| {
        tracing::error!(github_id, error = %e, "Identity lookup failed");
        StatusCode::BAD_GATEWAY
    })?;
    let Some(user) = user else {
        tracing::info!(github_id, installation_id, "No identity user linked to installation sender");
        return Ok(StatusCode::OK);
    };

    identity
        .set_installation_id(&user.id, installation_id)
        .await
        .map_err(|e| {
            tracing::error!(user = %user.id, error = %e, "Failed to store installation id");
            StatusCode::BAD_GATEWAY
        })?;
    tracing::info!(user = %user.id, installation_id, "Installation linked");
    Ok(StatusCode::OK)
}

/// Mark running instances of `target` stale and schedule every match.
async fn refresh_instances(
    state: &RouterState,
    org: &str,
    repo: &str,
    target: &GitTarget,
    commit_sha: &str,
) -> Result<usize, StatusCode> {
    let selector = naming::repository_selector(org, repo, &target.identifier());
    let matches: Vec<Instance> = state
        .instances
        .list(&selector)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Listing instances failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .into_iter()
        .filter(|i| i.target() == target && !i.metadata.is_deleting())
        .collect();

    for instance in &matches {
        let name = instance.name().to_string();
        match mark_stale(&state.instances, instance.clone(), commit_sha).await {
            Ok(_) => {}
            // the reconciler picks the new head up itself
            Err(e) if e.is_conflict() || e.is_not_found() => {
                tracing::debug!(instance = %name, error = %e, "Instance changed concurrently");
            }
            Err(e) => {
                tracing::error!(instance = %name, error = %e, "Failed to mark instance stale");
                return Err(StatusCode::INTERNAL_SERVER_ERROR);
            }
        }
        state.instance_queue.enqueue(&name).await;
    }
    Ok(matches.len())
}

/// Schedule detection for every environment tracking the repository.
async fn schedule_environments(
    state: &RouterState,
    org: &str,
    repo: &str,
) -> Result<(), StatusCode> {
    let environments = state.environments.list(&Labels::new()).await.map_err(|e| {
        tracing::error!(error = %e, "Listing environments failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    for env in environments {
        if env.organization().eq_ignore_ascii_case(org)
            && env.repository().eq_ignore_ascii_case(repo)
        {
            state.environment_queue.enqueue(env.name()).await;
        }
    }
    Ok(())
}
