//! Identity provider: access groups and per-user GitHub installation ids.
//!
//! The Keycloak client logs in with admin credentials for every operation and
//! talks to the admin REST API of one realm.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const INSTALLATION_ID_ATTRIBUTE: &str = "githubInstallationId";
const GITHUB_IDP_ALIAS: &str = "github";
const ADMIN_CLIENT_ID: &str = "admin-cli";

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
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

    #[error("group {0} does not exist")]
    GroupMissing(String),

    #[error("user {user} has a malformed installation id {value:?}")]
    MalformedAttribute { user: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Group {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub username: String,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn group_by_name(&self, name: &str) -> Result<Option<Group>, IdentityError>;

    async fn create_group(&self, name: &str) -> Result<Group, IdentityError>;

    async fn add_user_to_group(&self, user_id: &str, group_id: &str) -> Result<(), IdentityError>;

    /// User linked to a GitHub account id through the identity broker.
    async fn user_by_github_id(&self, github_id: u64) -> Result<Option<User>, IdentityError>;

    async fn installation_id(&self, user_id: &str) -> Result<Option<u64>, IdentityError>;

    async fn set_installation_id(
        &self,
        user_id: &str,
        installation_id: u64,
    ) -> Result<(), IdentityError>;
}

/// Look up `name`, creating the group when it does not exist yet.
pub async fn ensure_group(
    identity: &dyn IdentityProvider,
    name: &str,
) -> Result<Group, IdentityError> {
    if let Some(group) = identity.group_by_name(name).await? {
        return Ok(group);
    }
    tracing::info!(group = %name, "Creating access group");
    identity.create_group(name).await
}

// ── Keycloak ──

#[derive(Debug, Clone)]
pub struct KeycloakSettings {
    pub url: String,
    pub realm: String,
    pub username: String,
    pub password: String,
}

#[derive(Clone)]
pub struct KeycloakClient {
    http: reqwest::Client,
    settings: KeycloakSettings,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Serialize)]
struct NewGroup<'a> {
    name: &'a str,
}

impl KeycloakClient {
    pub fn new(mut settings: KeycloakSettings) -> Self {
        settings.url = settings.url.trim_end_matches('/').to_string();
        Self {
            http: reqwest::Client::new(),
            settings,
        }
    }

    fn admin_url(&self, path: &str) -> String {
        format!(
            "{}/admin/realms/{}{path}",
            self.settings.url, self.settings.realm
        )
    }

    async fn send(
        url: &str,
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, IdentityError> {
        let resp = builder
            .send()
            .await
            .map_err(|source| IdentityError::Transport {
                url: url.to_string(),
                source,
            })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(IdentityError::Status {
                url: url.to_string(),
                status,
                body,
            });
        }
        Ok(resp)
    }

    async fn decode<T: DeserializeOwned>(
        url: &str,
        resp: reqwest::Response,
    ) -> Result<T, IdentityError> {
        resp.json().await.map_err(|source| IdentityError::Decode {
            url: url.to_string(),
            source,
        })
    }

    async fn admin_token(&self) -> Result<String, IdentityError> {
        let url = format!(
            "{}/realms/{}/protocol/openid-connect/token",
            self.settings.url, self.settings.realm
        );
        let builder = self.http.post(&url).form(&[
            ("grant_type", "password"),
            ("client_id", ADMIN_CLIENT_ID),
            ("username", self.settings.username.as_str()),
            ("password", self.settings.password.as_str()),
        ]);
        let resp = Self::send(&url, builder).await?;
        let token: TokenResponse = Self::decode(&url, resp).await?;
        Ok(token.access_token)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, IdentityError> {
        let token = self.admin_token().await?;
        let url = self.admin_url(path);
        let resp = Self::send(&url, self.http.get(&url).bearer_auth(token)).await?;
        Self::decode(&url, resp).await
    }

    async fn user_representation(&self, user_id: &str) -> Result<Value, IdentityError> {
        self.get_json(&format!("/users/{user_id}")).await
    }
}

#[async_trait]
impl IdentityProvider for KeycloakClient {
    async fn group_by_name(&self, name: &str) -> Result<Option<Group>, IdentityError> {
        let groups: Vec<Group> = self
            .get_json(&format!("/groups?search={name}&exact=true"))
            .await?;
        Ok(groups.into_iter().find(|g| g.name == name))
    }

    async fn create_group(&self, name: &str) -> Result<Group, IdentityError> {
        let token = self.admin_token().await?;
        let url = self.admin_url("/groups");
        Self::send(
            &url,
            self.http
                .post(&url)
                .bearer_auth(token)
                .json(&NewGroup { name }),
        )
        .await?;

        self.group_by_name(name)
            .await?
            .ok_or_else(|| IdentityError::GroupMissing(name.to_string()))
    }

    async fn add_user_to_group(&self, user_id: &str, group_id: &str) -> Result<(), IdentityError> {
        let token = self.admin_token().await?;
        let url = self.admin_url(&format!("/users/{user_id}/groups/{group_id}"));
        Self::send(&url, self.http.put(&url).bearer_auth(token)).await?;
        Ok(())
    }

    async fn user_by_github_id(&self, github_id: u64) -> Result<Option<User>, IdentityError> {
        let users: Vec<User> = self
            .get_json(&format!(
                "/users?idpUserId={github_id}&idpAlias={GITHUB_IDP_ALIAS}"
            ))
            .await?;
        Ok(users.into_iter().next())
    }

    async fn installation_id(&self, user_id: &str) -> Result<Option<u64>, IdentityError> {
        let user = self.user_representation(user_id).await?;
        let Some(value) = user["attributes"][INSTALLATION_ID_ATTRIBUTE][0].as_str() else {
            return Ok(None);
        };
        value
            .parse()
            .map(Some)
            .map_err(|_| IdentityError::MalformedAttribute {
                user: user_id.to_string(),
                value: value.to_string(),
            })
    }

    async fn set_installation_id(
        &self,
        user_id: &str,
        installation_id: u64,
    ) -> Result<(), IdentityError> {
        let mut user = self.user_representation(user_id).await?;
        if !user["attributes"].is_object() {
            user["attributes"] = serde_json::json!({});
        }
        user["attributes"][INSTALLATION_ID_ATTRIBUTE] =
            serde_json::json!([installation_id.to_string()]);

        tracing::info!(user = %user_id, installation_id, "Updating identity user");
        let token = self.admin_token().await?;
        let url = self.admin_url(&format!("/users/{user_id}"));
        Self::send(&url, self.http.put(&url).bearer_auth(token).json(&user)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeIdentity;

    #[tokio::test]
    async fn ensure_group_creates_once() {
        let identity = FakeIdentity::default();
        let first = ensure_group(&identity, "pei-a").await.unwrap();
        let second = ensure_group(&identity, "pei-a").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(identity.groups().await.len(), 1);
    }
}
