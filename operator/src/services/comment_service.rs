//! Status comment on the pull request an instance previews.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::config::timings;
use crate::models::{Environment, Instance};
use crate::services::github_service::{ProviderError, RepositoryProvider};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommentOutcome {
    Posted,
    /// An identical, recent comment already exists.
    Unchanged,
    /// An identical comment was too old; it was deleted and posted again.
    Refreshed,
}

#[derive(Clone)]
pub struct CommentService {
    provider: Arc<dyn RepositoryProvider>,
}

impl CommentService {
    pub fn new(provider: Arc<dyn RepositoryProvider>) -> Self {
        Self { provider }
    }

    /// Post the status comment for `instance` unless an identical one newer
    /// than the refresh window exists. Branch instances have nothing to
    /// comment on and return [`CommentOutcome::Unchanged`].
    pub async fn publish(
        &self,
        env: &Environment,
        instance: &Instance,
        now: DateTime<Utc>,
    ) -> Result<CommentOutcome, ProviderError> {
        let Some(number) = instance.target().pull_request() else {
            return Ok(CommentOutcome::Unchanged);
        };
        let (org, repo) = (env.organization(), env.repository());
        let body = status_message(instance);

        let existing = self
            .provider
            .list_comments(org, repo, number)
            .await?
            .into_iter()
            .find(|c| c.body == body);

        let outcome = match existing {
            Some(comment)
                if now - comment.created_at <= Duration::hours(timings::COMMENT_REFRESH_HOURS) =>
            {
                tracing::debug!(org, repo, pr = number, "Status comment already present");
                return Ok(CommentOutcome::Unchanged);
            }
            Some(comment) => {
                tracing::info!(org, repo, pr = number, comment = comment.id, "Refreshing stale status comment");
                self.provider.delete_comment(org, repo, comment.id).await?;
                CommentOutcome::Refreshed
            }
            None => CommentOutcome::Posted,
        };

        self.provider.create_comment(org, repo, number, &body).await?;
        crate::metrics::comment_posted();
        tracing::info!(org, repo, pr = number, url = %instance.status.public_facing_url, "Posted status comment");
        Ok(outcome)
    }
}

/// Comment body; identical for identical branch and URL so reposts dedupe.
pub fn status_message(instance: &Instance) -> String {
    format!(
        "Hello! This is an automated message from the Preview Environment Operator.\n\
         A preview environment was deployed for {}.\n\n\
         ---\n\n\
         You can check out a preview version of the changes here:\n\
         {}\n",
        instance.target(),
        instance.status.public_facing_url
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::instance::GitTarget;
    use crate::testing::{self, FakeRepository};

    fn setup() -> (Arc<FakeRepository>, CommentService, Environment, Instance) {
        let provider = Arc::new(FakeRepository::default());
        let service = CommentService::new(provider.clone());
        let env = testing::environment("owner-1", "org", "repo");
        let mut instance = testing::instance(&env, GitTarget::PullRequestNumber(7), "abc");
        instance.status.public_facing_url = "https://preview.example.com/org/repo/7/abc".into();
        (provider, service, env, instance)
    }

    #[tokio::test]
    async fn identical_comment_within_window_is_posted_once() {
        let (provider, service, env, instance) = setup();
        let now = Utc::now();

        assert_eq!(service.publish(&env, &instance, now).await.unwrap(), CommentOutcome::Posted);
        assert_eq!(
            service.publish(&env, &instance, now + Duration::hours(2)).await.unwrap(),
            CommentOutcome::Unchanged
        );
        assert_eq!(provider.comments(7).await.len(), 1);
    }

    #[tokio::test]
    async fn stale_comment_is_replaced() {
        let (provider, service, env, instance) = setup();
        let posted_at = Utc::now();
        provider.set_clock(posted_at).await;
        service.publish(&env, &instance, posted_at).await.unwrap();
        let first = provider.comments(7).await[0].id;

        let later = posted_at + Duration::hours(25);
        provider.set_clock(later).await;
        assert_eq!(
            service.publish(&env, &instance, later).await.unwrap(),
            CommentOutcome::Refreshed
        );

        let comments = provider.comments(7).await;
        assert_eq!(comments.len(), 1);
        assert_ne!(comments[0].id, first);
    }

    #[tokio::test]
    async fn branch_instances_are_not_commented() {
        let (provider, service, env, _) = setup();
        let instance = testing::instance(&env, GitTarget::Branch("main".into()), "abc");
        assert_eq!(
            service.publish(&env, &instance, Utc::now()).await.unwrap(),
            CommentOutcome::Unchanged
        );
        assert!(provider.comments(7).await.is_empty());
    }

    #[test]
    fn message_changes_with_url() {
        let env = testing::environment("owner-1", "org", "repo");
        let mut a = testing::instance(&env, GitTarget::PullRequestNumber(1), "a");
        let mut b = a.clone();
        a.status.public_facing_url = "https://h/a".into();
        b.status.public_facing_url = "https://h/b".into();
        assert_ne!(status_message(&a), status_message(&b));
        assert!(status_message(&a).contains("pull request #1"));
    }
}
