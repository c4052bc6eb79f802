//! Adapter over the relational record of truth, spoken to through its
//! PostgREST-style REST surface. Two handles exist: the **tenant** handle
//! authenticates with the anon key plus the acting user's bearer token and
//! is subject to row-level policies; the **admin** handle uses the
//! service-role key and bypasses them (fan-out queries only).

pub mod geofences;
pub mod ghost_modes;
pub mod memberships;

use std::time::Duration;

use serde::de::DeserializeOwned;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("repository not configured")]
    NotConfigured,
    #[error("repository transport error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("repository returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("repository payload decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default)]
pub struct RepoConfig {
    pub url: Option<String>,
    pub anon_key: Option<String>,
    pub service_key: Option<String>,
}

#[derive(Clone)]
pub struct RepoHandle {
    http: reqwest::Client,
    base: String,
    api_key: String,
}

impl RepoHandle {
    fn new(base: &str, api_key: &str) -> Result<Self, RepoError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            base: base.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    /// `GET /rest/v1/<table>?<query>`, decoding the row array. A bearer of
    /// `None` authenticates as the handle's own key.
    pub(crate) async fn select<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &str,
        bearer: Option<&str>,
    ) -> Result<Vec<T>, RepoError> {
        let url = format!("{}/rest/v1/{table}?{query}", self.base);
        let response = self
            .http
            .get(&url)
            .header("apikey", &self.api_key)
            .bearer_auth(bearer.unwrap_or(&self.api_key))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RepoError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }

    /// `POST /rest/v1/<table>` upsert with merge-duplicates semantics.
    pub(crate) async fn upsert(
        &self,
        table: &str,
        on_conflict: &str,
        body: &serde_json::Value,
        bearer: Option<&str>,
    ) -> Result<(), RepoError> {
        let url = format!("{}/rest/v1/{table}?on_conflict={on_conflict}", self.base);
        let response = self
            .http
            .post(&url)
            .header("apikey", &self.api_key)
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .bearer_auth(bearer.unwrap_or(&self.api_key))
            .json(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RepoError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct Repository {
    admin: Option<RepoHandle>,
    tenant: Option<RepoHandle>,
}

impl Repository {
    /// Build whatever handles the configuration allows. Missing URL or keys
    /// leave the corresponding handle absent; queries against an absent
    /// handle surface [`RepoError::NotConfigured`].
    pub fn new(config: &RepoConfig) -> Result<Self, RepoError> {
        let Some(url) = config.url.as_deref().filter(|url| !url.is_empty()) else {
            tracing::warn!("repository URL not configured; reads degrade to empty results");
            return Ok(Self::default());
        };
        let admin = match config.service_key.as_deref().filter(|key| !key.is_empty()) {
            Some(key) => Some(RepoHandle::new(url, key)?),
            None => None,
        };
        let tenant = match config.anon_key.as_deref().filter(|key| !key.is_empty()) {
            Some(key) => Some(RepoHandle::new(url, key)?),
            None => None,
        };
        Ok(Self { admin, tenant })
    }

    pub fn configured(&self) -> bool {
        self.admin.is_some() || self.tenant.is_some()
    }

    /// Service-role handle for fan-out queries (membership, geofences).
    pub fn admin(&self) -> Result<&RepoHandle, RepoError> {
        self.admin.as_ref().ok_or(RepoError::NotConfigured)
    }

    /// Row-level-authorized handle for operations initiated by a user.
    pub fn tenant(&self) -> Result<&RepoHandle, RepoError> {
        self.tenant.as_ref().ok_or(RepoError::NotConfigured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconfigured_repository_has_no_handles() {
        let repo = Repository::new(&RepoConfig::default()).unwrap();
        assert!(!repo.configured());
        assert!(matches!(repo.admin(), Err(RepoError::NotConfigured)));
        assert!(matches!(repo.tenant(), Err(RepoError::NotConfigured)));
    }

    #[test]
    fn partial_configuration_builds_partial_handles() {
        let repo = Repository::new(&RepoConfig {
            url: Some("https://records.example.com/".into()),
            anon_key: None,
            service_key: Some("service-key".into()),
        })
        .unwrap();
        assert!(repo.configured());
        assert!(repo.admin().is_ok());
        assert!(matches!(repo.tenant(), Err(RepoError::NotConfigured)));
    }
}
