//! OAuth2 capability providers for Google APIs.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;
use ytr_storage::HttpFetcher;

use crate::{ApiHandle, AuthError, CapabilityProvider, ServiceSpec};

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const EXPIRY_MARGIN_SECS: i64 = 60;

/// Hands out a fixed bearer token, e.g. one minted by `gcloud auth print-access-token`.
#[derive(Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl CapabilityProvider for StaticTokenProvider {
    async fn authenticate(&self, service: &ServiceSpec) -> Result<ApiHandle, AuthError> {
        if self.token.trim().is_empty() {
            return Err(AuthError::MissingCredentials("empty static access token".into()));
        }
        Ok(handle_for(service, self.token.clone()))
    }
}

fn handle_for(service: &ServiceSpec, access_token: String) -> ApiHandle {
    ApiHandle {
        service_name: service.service_name.clone(),
        api_version: service.api_version.clone(),
        base_url: service.resolved_base_url(),
        access_token,
    }
}

#[derive(Debug, Deserialize)]
struct ClientSecretsFile {
    installed: Option<ClientSecrets>,
    web: Option<ClientSecrets>,
}

#[derive(Debug, Clone, Deserialize)]
struct ClientSecrets {
    client_id: String,
    client_secret: String,
    #[serde(default)]
    token_uri: Option<String>,
}

/// Authorized-user credentials persisted between runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCredentials {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl StoredCredentials {
    /// Access token still valid past the safety margin and granted for every scope.
    /// Credentials that never recorded scopes are trusted for any scope.
    pub fn usable_token(&self, scopes: &[String], now: DateTime<Utc>) -> Option<&str> {
        let token = self.access_token.as_deref().filter(|t| !t.is_empty())?;
        let expires_at = self.expires_at?;
        if expires_at <= now + Duration::seconds(EXPIRY_MARGIN_SECS) {
            return None;
        }
        if !self.scopes.is_empty() && !scopes.iter().all(|s| self.scopes.contains(s)) {
            return None;
        }
        Some(token)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

/// Installed-app OAuth2 flow backed by a client secrets file and a stored credentials file.
/// Refreshes expired tokens; the interactive consent step is not performed here.
pub struct OAuthCredentialsProvider {
    client_secrets_file: PathBuf,
    credentials_file: PathBuf,
    http: Arc<HttpFetcher>,
    refresh_lock: Mutex<()>,
}

impl OAuthCredentialsProvider {
    pub fn new(
        client_secrets_file: impl Into<PathBuf>,
        credentials_file: impl Into<PathBuf>,
        http: Arc<HttpFetcher>,
    ) -> Self {
        Self {
            client_secrets_file: client_secrets_file.into(),
            credentials_file: credentials_file.into(),
            http,
            refresh_lock: Mutex::new(()),
        }
    }

    async fn load_credentials(&self) -> Result<StoredCredentials, AuthError> {
        let text = match fs::read_to_string(&self.credentials_file).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(AuthError::MissingCredentials(format!(
                    "no stored credentials at {}; complete the OAuth consent flow first",
                    self.credentials_file.display()
                )))
            }
            Err(err) => {
                return Err(AuthError::InvalidCredentials {
                    path: self.credentials_file.display().to_string(),
                    message: err.to_string(),
                })
            }
        };
        serde_json::from_str(&text).map_err(|e| AuthError::InvalidCredentials {
            path: self.credentials_file.display().to_string(),
            message: e.to_string(),
        })
    }

    async fn load_client_secrets(&self) -> Result<ClientSecrets, AuthError> {
        let invalid = |message: String| AuthError::InvalidCredentials {
            path: self.client_secrets_file.display().to_string(),
            message,
        };
        let text = fs::read_to_string(&self.client_secrets_file)
            .await
            .map_err(|e| invalid(e.to_string()))?;
        let file: ClientSecretsFile =
            serde_json::from_str(&text).map_err(|e| invalid(e.to_string()))?;
        file.installed
            .or(file.web)
            .ok_or_else(|| invalid("expected an \"installed\" or \"web\" client".into()))
    }

    async fn refresh(
        &self,
        mut credentials: StoredCredentials,
        scopes: &[String],
    ) -> Result<StoredCredentials, AuthError> {
        let refresh_token = credentials.refresh_token.clone().ok_or_else(|| {
            AuthError::MissingCredentials(format!(
                "credentials in {} carry no refresh token",
                self.credentials_file.display()
            ))
        })?;
        let secrets = self.load_client_secrets().await?;
        let token_uri = secrets
            .token_uri
            .clone()
            .unwrap_or_else(|| DEFAULT_TOKEN_URI.to_string());

        let response: TokenResponse = self
            .http
            .post_form(
                "oauth2",
                &token_uri,
                &[
                    ("client_id", secrets.client_id.as_str()),
                    ("client_secret", secrets.client_secret.as_str()),
                    ("refresh_token", refresh_token.as_str()),
                    ("grant_type", "refresh_token"),
                ],
            )
            .await
            .map_err(AuthError::Refresh)?;

        credentials.access_token = Some(response.access_token);
        credentials.expires_at =
            Some(Utc::now() + Duration::seconds(response.expires_in.unwrap_or(3600)));
        if let Some(rotated) = response.refresh_token {
            credentials.refresh_token = Some(rotated);
        }
        match response.scope {
            Some(granted) => {
                credentials.scopes = granted.split_whitespace().map(str::to_string).collect();
            }
            None => {
                for scope in scopes {
                    if !credentials.scopes.contains(scope) {
                        credentials.scopes.push(scope.clone());
                    }
                }
            }
        }

        persist_credentials(&self.credentials_file, &credentials)
            .await
            .map_err(AuthError::Persist)?;
        info!(path = %self.credentials_file.display(), "refreshed OAuth access token");
        Ok(credentials)
    }
}

#[async_trait]
impl CapabilityProvider for OAuthCredentialsProvider {
    async fn authenticate(&self, service: &ServiceSpec) -> Result<ApiHandle, AuthError> {
        let _guard = self.refresh_lock.lock().await;
        let credentials = self.load_credentials().await?;
        if let Some(token) = credentials.usable_token(&service.scopes, Utc::now()) {
            return Ok(handle_for(service, token.to_string()));
        }

        let refreshed = self.refresh(credentials, &service.scopes).await?;
        match refreshed.usable_token(&service.scopes, Utc::now()) {
            Some(token) => Ok(handle_for(service, token.to_string())),
            None => Err(AuthError::MissingCredentials(format!(
                "refreshed token does not grant {:?}",
                service.scopes
            ))),
        }
    }
}

async fn persist_credentials(path: &Path, credentials: &StoredCredentials) -> anyhow::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let temp_path = parent.join(format!(".credentials.{}.tmp", Uuid::new_v4()));
    let body = serde_json::to_vec_pretty(credentials).context("serializing credentials")?;

    let mut file = fs::File::create(&temp_path)
        .await
        .with_context(|| format!("creating {}", temp_path.display()))?;
    file.write_all(&body)
        .await
        .with_context(|| format!("writing {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| format!("replacing {}", path.display()));
    }
    Ok(())
}
