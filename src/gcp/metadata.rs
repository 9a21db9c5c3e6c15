//! Hosting-environment detection through the GCE / Cloud Run metadata server.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::error::{Error, Result};

/// Default metadata server root.
const METADATA_ROOT: &str = "http://metadata.google.internal/computeMetadata/v1";

/// Environment variable overriding the metadata host (`host[:port]`).
const METADATA_HOST_ENV: &str = "GCE_METADATA_HOST";

/// What the hosting environment says about where we run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostEnvironment {
    pub project: Option<String>,
    pub region: Option<String>,
}

/// Probe for hosting-environment defaults. Never fails: `None` means "not on GCP".
#[async_trait]
pub trait EnvironmentProbe: Send + Sync {
    async fn detect(&self) -> Option<HostEnvironment>;
}

/// OAuth token as served by the metadata server.
#[derive(Debug, Clone, Deserialize)]
pub struct MetadataToken {
    pub access_token: String,
    #[serde(default)]
    pub expires_in: Option<i64>,
}

/// Client for the metadata server.
#[derive(Debug, Clone)]
pub struct MetadataClient {
    client: reqwest::Client,
    root: String,
}

impl MetadataClient {
    /// Create a client honouring `GCE_METADATA_HOST`.
    pub fn new() -> Result<Self> {
        let root = match std::env::var(METADATA_HOST_ENV) {
            Ok(host) if !host.is_empty() => format!("http://{}/computeMetadata/v1", host),
            _ => METADATA_ROOT.to_string(),
        };
        Self::with_root(root)
    }

    /// Create a client against an explicit root URL.
    pub fn with_root(root: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(1500))
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            root: root.into().trim_end_matches('/').to_string(),
        })
    }

    async fn get_text(&self, path: &str) -> Result<String> {
        let url = format!("{}/{}", self.root, path);
        let response = self
            .client
            .get(&url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let status_text = status.canonical_reason().unwrap_or("Unknown");
            return Err(Error::api(status.as_u16(), status_text, url));
        }
        Ok(response.text().await?.trim().to_string())
    }

    /// Project id of the hosting project.
    pub async fn project_id(&self) -> Result<String> {
        self.get_text("project/project-id").await
    }

    /// Region of the instance. Cloud Run serves `instance/region`, GCE only `instance/zone`.
    pub async fn region(&self) -> Result<String> {
        match self.get_text("instance/region").await {
            Ok(path) => Ok(last_segment(&path).to_string()),
            Err(_) => {
                let zone_path = self.get_text("instance/zone").await?;
                zone_to_region(last_segment(&zone_path))
                    .ok_or_else(|| Error::Internal(format!("Unrecognised zone: {}", zone_path)))
            }
        }
    }

    /// Access token for the attached service account.
    pub async fn access_token(&self) -> Result<MetadataToken> {
        let body = self
            .get_text("instance/service-accounts/default/token")
            .await?;
        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl EnvironmentProbe for MetadataClient {
    async fn detect(&self) -> Option<HostEnvironment> {
        let project = match self.project_id().await {
            Ok(project) => project,
            Err(e) => {
                debug!("Metadata server not reachable: {}", e);
                return None;
            }
        };
        let region = self.region().await.ok();
        debug!("Detected GCP environment: project={}, region={:?}", project, region);

        Some(HostEnvironment {
            project: Some(project),
            region,
        })
    }
}

/// Probe for callers that never want host detection.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoEnvironment;

#[async_trait]
impl EnvironmentProbe for NoEnvironment {
    async fn detect(&self) -> Option<HostEnvironment> {
        None
    }
}

fn last_segment(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// `us-central1-a` -> `us-central1`.
fn zone_to_region(zone: &str) -> Option<String> {
    let (region, suffix) = zone.rsplit_once('-')?;
    if region.is_empty() || suffix.is_empty() {
        return None;
    }
    Some(region.to_string())
}
