//! Capability resolution.
//!
//! Decides, once per protocol server, whether tools run locally through the
//! `gcloud` CLI or proxy to the Google Cloud control plane. Resolution never
//! fails: anything that goes wrong while probing credentials downgrades the
//! server to the local tool set.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::gcp::{AccessGrant, ApiEndpoints, CloudApiClient, CredentialProbe, EnvironmentProbe, GcloudRunner};

/// Region used when neither configuration nor the host supplies one.
pub const DEFAULT_REGION: &str = "us-central1";

/// Upper bound on a single credential probe.
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// Environment-level defaults, read once at start-up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CloudDefaults {
    pub project_id: Option<String>,
    pub region: Option<String>,
    pub service_name: Option<String>,
    pub skip_iam_check: bool,
}

/// Immutable per-server view of where tools operate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityContext {
    pub project_id: Option<String>,
    pub region: String,
    pub service_name: Option<String>,
    pub skip_iam_check: bool,
    pub credentials_available: bool,
}

/// What a local tool set needs.
#[derive(Debug, Clone)]
pub struct LocalCapabilities {
    pub gcloud: GcloudRunner,
}

/// What a remote tool set needs: a control-plane client holding the probed token.
#[derive(Debug, Clone)]
pub struct RemoteCapabilities {
    pub client: CloudApiClient,
}

/// Which tool registry variant a server binds to.
#[derive(Debug, Clone)]
pub enum CapabilitySource {
    Local(LocalCapabilities),
    Remote(RemoteCapabilities),
}

/// Tag of a [`CapabilitySource`], cheap to compare and log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Local,
    Remote,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote => write!(f, "remote"),
        }
    }
}

impl CapabilitySource {
    pub fn kind(&self) -> SourceKind {
        match self {
            Self::Local(_) => SourceKind::Local,
            Self::Remote(_) => SourceKind::Remote,
        }
    }

    pub fn is_remote(&self) -> bool {
        self.kind() == SourceKind::Remote
    }
}

/// Output of [`CapabilityResolver::resolve`].
#[derive(Debug, Clone)]
pub struct CapabilityResolution {
    pub context: CapabilityContext,
    pub source: CapabilitySource,
}

/// Probes credentials and the hosting environment for each new server.
pub struct CapabilityResolver {
    defaults: CloudDefaults,
    credentials: Arc<dyn CredentialProbe>,
    environment: Arc<dyn EnvironmentProbe>,
    gcloud: GcloudRunner,
    endpoints: ApiEndpoints,
    probe_timeout: Duration,
}

impl CapabilityResolver {
    pub fn new(
        defaults: CloudDefaults,
        credentials: Arc<dyn CredentialProbe>,
        environment: Arc<dyn EnvironmentProbe>,
    ) -> Self {
        Self {
            defaults,
            credentials,
            environment,
            gcloud: GcloudRunner::default(),
            endpoints: ApiEndpoints::default(),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    /// Runner handed to the local tool set.
    pub fn with_gcloud(mut self, gcloud: GcloudRunner) -> Self {
        self.gcloud = gcloud;
        self
    }

    /// Control-plane endpoints handed to the remote tool set.
    pub fn with_endpoints(mut self, endpoints: ApiEndpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn gcloud(&self) -> &GcloudRunner {
        &self.gcloud
    }

    /// Resolve capabilities. Probes afresh on every call and never fails.
    pub async fn resolve(&self) -> CapabilityResolution {
        let host = self.environment.detect().await.unwrap_or_default();

        let project_id = self.defaults.project_id.clone().or(host.project);
        let region = self
            .defaults
            .region
            .clone()
            .or(host.region)
            .unwrap_or_else(|| DEFAULT_REGION.to_string());

        match self.connect_remote(project_id.clone()).await {
            Ok((client, project)) => {
                info!("Authenticated with GCP project: {}", project);
                info!(
                    "Using remote GCP tools for project: {}, region: {}",
                    project, region
                );
                CapabilityResolution {
                    context: self.context(Some(project), region, true),
                    source: CapabilitySource::Remote(RemoteCapabilities { client }),
                }
            }
            Err(e) => {
                warn!("Could not authenticate with GCP ({}). Using local tools.", e);
                CapabilityResolution {
                    context: self.context(project_id, region, false),
                    source: CapabilitySource::Local(LocalCapabilities {
                        gcloud: self.gcloud.clone(),
                    }),
                }
            }
        }
    }

    /// Everything the remote tool set needs; any failure here means local tools.
    async fn connect_remote(&self, project_id: Option<String>) -> Result<(CloudApiClient, String)> {
        let (grant, project) = self.authenticate(project_id).await?;
        let client = CloudApiClient::new(self.endpoints.clone(), grant.access_token)?;
        Ok((client, project))
    }

    /// Obtain a grant and settle on a project: explicit/host value first, then the probe's.
    async fn authenticate(&self, project_id: Option<String>) -> Result<(AccessGrant, String)> {
        let grant = tokio::time::timeout(self.probe_timeout, self.credentials.authenticate())
            .await
            .map_err(|_| Error::Timeout {
                seconds: self.probe_timeout.as_secs(),
            })??;

        let project = project_id
            .or_else(|| grant.project_id.clone())
            .ok_or_else(|| {
                Error::CredentialResolution("unable to determine a project id".to_string())
            })?;

        Ok((grant, project))
    }

    fn context(
        &self,
        project_id: Option<String>,
        region: String,
        credentials_available: bool,
    ) -> CapabilityContext {
        CapabilityContext {
            project_id,
            region,
            service_name: self.defaults.service_name.clone(),
            skip_iam_check: self.defaults.skip_iam_check,
            credentials_available,
        }
    }
}
