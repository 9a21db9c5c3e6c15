//! Credential probing via Application Default Credentials.
//!
//! Credentials are resolved in order:
//! 1. `GOOGLE_APPLICATION_CREDENTIALS` file
//! 2. gcloud well-known file (`application_default_credentials.json`)
//! 3. Metadata server (GCE, Cloud Run)

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;
use tracing::debug;

use crate::error::{Error, Result};
use crate::gcp::metadata::MetadataClient;

/// OAuth scope requested for every token.
pub const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// A usable access token plus whatever project the credentials point at.
#[derive(Clone)]
pub struct AccessGrant {
    pub access_token: String,
    pub project_id: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for AccessGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessGrant")
            .field("access_token", &"<redacted>")
            .field("project_id", &self.project_id)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Something that can produce an authenticated grant for the control plane.
#[async_trait]
pub trait CredentialProbe: Send + Sync {
    async fn authenticate(&self) -> Result<AccessGrant>;
}

/// Credentials file contents, keyed by the `type` field.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum CredentialsFile {
    ServiceAccount {
        client_email: String,
        private_key: String,
        #[serde(default)]
        private_key_id: Option<String>,
        #[serde(default)]
        project_id: Option<String>,
        #[serde(default = "default_token_uri")]
        token_uri: String,
    },
    AuthorizedUser {
        client_id: String,
        client_secret: String,
        refresh_token: String,
        #[serde(default)]
        quota_project_id: Option<String>,
        #[serde(default = "default_token_uri")]
        token_uri: String,
    },
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

#[derive(Debug, Serialize)]
struct JwtClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Application Default Credentials probe.
pub struct AdcProbe {
    client: reqwest::Client,
    metadata: MetadataClient,
    credentials_file: Option<PathBuf>,
}

impl AdcProbe {
    /// Probe following the standard lookup order.
    pub fn new() -> Result<Self> {
        Ok(Self {
            client: token_client()?,
            metadata: MetadataClient::new()?,
            credentials_file: None,
        })
    }

    /// Probe pinned to a specific credentials file.
    pub fn with_credentials_file(path: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            credentials_file: Some(path.into()),
            ..Self::new()?
        })
    }

    fn locate_credentials_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.credentials_file {
            return Some(path.clone());
        }
        if let Some(path) = std::env::var_os("GOOGLE_APPLICATION_CREDENTIALS") {
            if !path.is_empty() {
                return Some(PathBuf::from(path));
            }
        }
        well_known_file().filter(|p| p.is_file())
    }

    async fn exchange(&self, file: CredentialsFile) -> Result<AccessGrant> {
        match file {
            CredentialsFile::ServiceAccount {
                client_email,
                private_key,
                private_key_id,
                project_id,
                token_uri,
            } => {
                let now = Utc::now();
                let claims = JwtClaims {
                    iss: &client_email,
                    scope: CLOUD_PLATFORM_SCOPE,
                    aud: &token_uri,
                    iat: now.timestamp(),
                    exp: (now + Duration::hours(1)).timestamp(),
                };
                let mut header = Header::new(Algorithm::RS256);
                header.kid = private_key_id;
                let key = EncodingKey::from_rsa_pem(private_key.as_bytes())?;
                let assertion = jsonwebtoken::encode(&header, &claims, &key)?;

                let token = self
                    .request_token(
                        &token_uri,
                        &[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())],
                    )
                    .await?;
                Ok(grant(token, project_id))
            }
            CredentialsFile::AuthorizedUser {
                client_id,
                client_secret,
                refresh_token,
                quota_project_id,
                token_uri,
            } => {
                let token = self
                    .request_token(
                        &token_uri,
                        &[
                            ("grant_type", "refresh_token"),
                            ("client_id", client_id.as_str()),
                            ("client_secret", client_secret.as_str()),
                            ("refresh_token", refresh_token.as_str()),
                        ],
                    )
                    .await?;
                Ok(grant(token, quota_project_id))
            }
        }
    }

    async fn request_token(&self, token_uri: &str, form: &[(&str, &str)]) -> Result<TokenResponse> {
        let response = self.client.post(token_uri).form(form).send().await?;

        let status = response.status();
        if !status.is_success() {
            let status_text = status.canonical_reason().unwrap_or("Unknown");
            let body = response.text().await.unwrap_or_default();
            return Err(Error::api(status.as_u16(), status_text, body));
        }

        response
            .json()
            .await
            .map_err(|e| Error::CredentialResolution(format!("Malformed token response: {}", e)))
    }
}

#[async_trait]
impl CredentialProbe for AdcProbe {
    async fn authenticate(&self) -> Result<AccessGrant> {
        if let Some(path) = self.locate_credentials_file() {
            debug!("Using credentials file {}", path.display());
            let file = read_credentials_file(&path).await?;
            return self.exchange(file).await;
        }

        debug!("No credentials file, trying the metadata server");
        let token = self.metadata.access_token().await.map_err(|e| {
            Error::CredentialResolution(format!(
                "No credentials file found and metadata server unavailable: {}",
                e
            ))
        })?;
        let project_id = self.metadata.project_id().await.ok();

        Ok(grant(
            TokenResponse {
                access_token: token.access_token,
                expires_in: token.expires_in,
            },
            project_id,
        ))
    }
}

fn token_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(10))
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))
}

fn grant(token: TokenResponse, project_id: Option<String>) -> AccessGrant {
    AccessGrant {
        access_token: token.access_token,
        project_id,
        expires_at: token
            .expires_in
            .map(|secs| Utc::now() + Duration::seconds(secs)),
    }
}

/// Location of the file written by `gcloud auth application-default login`.
fn well_known_file() -> Option<PathBuf> {
    #[cfg(windows)]
    let base = dirs::config_dir();
    #[cfg(not(windows))]
    let base = dirs::home_dir().map(|h| h.join(".config"));

    base.map(|dir| dir.join("gcloud").join("application_default_credentials.json"))
}

async fn read_credentials_file(path: &std::path::Path) -> Result<CredentialsFile> {
    let content = fs::read_to_string(path).await.map_err(|e| {
        Error::CredentialResolution(format!("Cannot read {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::CredentialResolution(format!(
            "Unsupported credentials file {}: {}",
            path.display(),
            e
        ))
    })
}
