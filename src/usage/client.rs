use super::{parse_usage_response, UsageSnapshot};
use crate::config::ProviderConfig;
use crate::credentials::{CredentialRecord, SESSION_COOKIE_NAME};
use crate::error::UsageError;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::Deserialize;
use tracing::debug;

/// Organization entry returned by the organizations endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct Organization {
    pub uuid: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// One-shot usage fetch, abstracted so the polling controller can be
/// driven by a fake in tests.
#[async_trait]
pub trait UsageFetcher: Send + Sync {
    /// Fetches the current usage for `credentials`.
    ///
    /// `None` fails with [`UsageError::NoCredentials`] before any I/O.
    async fn fetch(
        &self,
        credentials: Option<&CredentialRecord>,
    ) -> Result<UsageSnapshot, UsageError>;
}

/// HTTP client for the provider's usage API.
///
/// Stateless apart from the connection pool: credentials are passed in on
/// every call and never retained.
pub struct UsageClient {
    http_client: Client,
    base_url: String,
    /// `base_url` parsed; request paths are appended to it segment by segment
    api_root: Url,
}

impl UsageClient {
    /// Create a client using the configured base URL.
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        Self::with_base_url(config, &config.base_url)
    }

    /// Create a client with a custom base URL (for testing with a mock server).
    pub fn with_base_url(config: &ProviderConfig, base_url: &str) -> Result<Self> {
        let base_url = base_url.trim_end_matches('/');
        let api_root =
            Url::parse(base_url).with_context(|| format!("Invalid base URL: {}", base_url))?;
        if api_root.cannot_be_a_base() {
            bail!("Base URL cannot carry a path: {}", base_url);
        }

        let http_client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http_client,
            base_url: base_url.to_string(),
            api_root,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// GET `/api/organizations/{org}/usage` with the session cookie.
    pub async fn fetch(
        &self,
        credentials: Option<&CredentialRecord>,
    ) -> Result<UsageSnapshot, UsageError> {
        let credentials = credentials.ok_or(UsageError::NoCredentials)?;

        let url = self.endpoint(&[
            "api",
            "organizations",
            credentials.organization_id.as_str(),
            "usage",
        ]);
        debug!(organization_id = %credentials.organization_id, "Fetching usage");

        let response = self
            .request(url, &credentials.session_key)
            .send()
            .await?;

        check_response_status(response.status())?;
        let body = response.bytes().await?;
        parse_usage_response(&body, Utc::now())
    }

    /// Lists the organizations visible to `session_key`.
    pub async fn list_organizations(
        &self,
        session_key: &str,
    ) -> Result<Vec<Organization>, UsageError> {
        let session_key = session_key.trim();
        if session_key.is_empty() {
            return Err(UsageError::NoCredentials);
        }

        let url = self.endpoint(&["api", "organizations"]);
        let response = self.request(url, session_key).send().await?;

        check_response_status(response.status())?;
        let body = response.bytes().await?;
        serde_json::from_slice::<Vec<Organization>>(&body)
            .map_err(|e| UsageError::Decode(e.to_string()))
    }

    /// The first organization's id, which is treated as the active one.
    pub async fn resolve_organization(&self, session_key: &str) -> Result<String, UsageError> {
        self.list_organizations(session_key)
            .await?
            .into_iter()
            .map(|org| org.uuid)
            .find(|uuid| !uuid.trim().is_empty())
            .ok_or_else(|| UsageError::Decode("no organizations returned".to_string()))
    }

    /// Appends `segments` to the base URL, percent-encoding each one, so an
    /// id containing `/`, `?` or `#` stays a single path segment.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.api_root.clone();
        // Always Ok: `with_base_url` rejects cannot-be-a-base URLs
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    /// Builds a GET carrying the same headers the provider's web app sends.
    fn request(&self, url: Url, session_key: &str) -> RequestBuilder {
        self.http_client
            .get(url)
            .header("accept", "*/*")
            .header("accept-language", "en-US,en;q=0.9")
            .header("content-type", "application/json")
            .header("anthropic-client-platform", "web_claude_ai")
            .header("anthropic-client-version", "1.0.0")
            .header("origin", self.base_url.as_str())
            .header("referer", format!("{}/settings/usage", self.base_url))
            .header("sec-fetch-dest", "empty")
            .header("sec-fetch-mode", "cors")
            .header("sec-fetch-site", "same-origin")
            .header("cookie", format!("{}={}", SESSION_COOKIE_NAME, session_key))
    }
}

#[async_trait]
impl UsageFetcher for UsageClient {
    async fn fetch(
        &self,
        credentials: Option<&CredentialRecord>,
    ) -> Result<UsageSnapshot, UsageError> {
        UsageClient::fetch(self, credentials).await
    }
}

/// Maps the response status onto the usage error taxonomy.
///
/// - 401/403 → `Unauthorized` (session expired or revoked)
/// - Other non-2xx → `UnexpectedStatus`
fn check_response_status(status: StatusCode) -> Result<(), UsageError> {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(UsageError::Unauthorized),
        s if !s.is_success() => Err(UsageError::UnexpectedStatus(s.as_u16())),
        _ => Ok(()),
    }
}
