//! Remote API contracts for the YouTube Reporting and Data APIs, plus their HTTP clients.
//!
//! Every remote operation the pipeline needs sits behind its own narrow trait so that the
//! orchestrator can be driven by canned doubles in tests.

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ytr_core::{Channel, ReportDescriptor, Video, VideoCategory, Watermark};
use ytr_storage::{ByteRange, FetchError, RangeChunk};

pub mod auth;
pub mod data;
pub mod reporting;

pub use auth::{OAuthCredentialsProvider, StaticTokenProvider, StoredCredentials};
pub use data::{list_all_channels, list_categories_for, list_videos_in_batches, YouTubeDataClient};
pub use reporting::{list_reports, YouTubeReportingClient};

pub const CRATE_NAME: &str = "ytr-reporting";

pub const REPORTING_SERVICE: &str = "youtubereporting";
pub const DATA_SERVICE: &str = "youtube";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("credentials unavailable: {0}")]
    MissingCredentials(String),
    #[error("invalid credentials in {path}: {message}")]
    InvalidCredentials { path: String, message: String },
    #[error("token refresh failed: {0}")]
    Refresh(#[source] FetchError),
    #[error("persisting refreshed credentials failed: {0:#}")]
    Persist(#[source] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum RemoteApiError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("unexpected response from {endpoint}: {message}")]
    Protocol { endpoint: String, message: String },
}

impl RemoteApiError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Fetch(err) => err.is_retryable(),
            Self::Protocol { .. } => false,
        }
    }
}

/// Which remote API a handle is requested for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub service_name: String,
    pub api_version: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub base_url: Option<String>,
}

impl ServiceSpec {
    pub fn new(service_name: &str, api_version: &str, scopes: Vec<String>) -> Self {
        Self {
            service_name: service_name.to_string(),
            api_version: api_version.to_string(),
            scopes,
            base_url: None,
        }
    }

    pub fn resolved_base_url(&self) -> String {
        match &self.base_url {
            Some(url) if url.ends_with('/') => url.clone(),
            Some(url) => format!("{url}/"),
            None => default_base_url(&self.service_name, &self.api_version),
        }
    }
}

pub fn default_base_url(service_name: &str, api_version: &str) -> String {
    match service_name {
        REPORTING_SERVICE => format!("https://youtubereporting.googleapis.com/{api_version}/"),
        DATA_SERVICE => format!("https://www.googleapis.com/youtube/{api_version}/"),
        other => format!("https://{other}.googleapis.com/{api_version}/"),
    }
}

/// Authenticated capability for one remote API.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiHandle {
    pub service_name: String,
    pub api_version: String,
    pub base_url: String,
    pub access_token: String,
}

impl std::fmt::Debug for ApiHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiHandle")
            .field("service_name", &self.service_name)
            .field("api_version", &self.api_version)
            .field("base_url", &self.base_url)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

#[async_trait]
pub trait CapabilityProvider: Send + Sync {
    async fn authenticate(&self, service: &ServiceSpec) -> Result<ApiHandle, AuthError>;
}

/// One page of a token-paginated listing.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_page_token: Option<String>,
}

/// Position in a token-paginated listing. A token handed out twice means the remote is
/// cycling, which is reported as a protocol error instead of looping forever.
#[derive(Debug)]
pub(crate) struct PageCursor {
    endpoint: &'static str,
    current: Option<String>,
    seen: HashSet<String>,
}

impl PageCursor {
    pub(crate) fn new(endpoint: &'static str) -> Self {
        Self {
            endpoint,
            current: None,
            seen: HashSet::new(),
        }
    }

    pub(crate) fn token(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Moves to `next`; `Ok(false)` once the listing is exhausted.
    pub(crate) fn advance(&mut self, next: Option<String>) -> Result<bool, RemoteApiError> {
        let Some(next) = next else {
            return Ok(false);
        };
        if !self.seen.insert(next.clone()) {
            return Err(RemoteApiError::Protocol {
                endpoint: self.endpoint.to_string(),
                message: format!("page token {next:?} was already returned"),
            });
        }
        self.current = Some(next);
        Ok(true)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogQuery {
    pub job_id: String,
    pub content_owner_id: String,
    pub created_after: Watermark,
}

#[async_trait]
pub trait ReportCatalog: Send + Sync {
    async fn list_page(
        &self,
        query: &CatalogQuery,
        page_token: Option<&str>,
    ) -> Result<Page<ReportDescriptor>, RemoteApiError>;
}

#[async_trait]
pub trait ReportDownloader: Send + Sync {
    /// One round-trip of a possibly multi-request download.
    async fn fetch_chunk(
        &self,
        download_url: &str,
        range: ByteRange,
    ) -> Result<RangeChunk, RemoteApiError>;
}

#[async_trait]
pub trait MetadataApi: Send + Sync {
    async fn list_channels_page(
        &self,
        content_owner_id: &str,
        page_token: Option<&str>,
    ) -> Result<Page<Channel>, RemoteApiError>;

    /// At most [`data::MAX_IDS_PER_REQUEST`] ids per call.
    async fn list_videos(
        &self,
        content_owner_id: &str,
        ids: &[String],
    ) -> Result<Vec<Video>, RemoteApiError>;

    async fn list_categories(&self, ids: &[String]) -> Result<Vec<VideoCategory>, RemoteApiError>;
}
