//! Cloud Run tool sets.
//!
//! Both variants expose the same five tools; they differ only in the
//! [`CloudRunBackend`] the tools call:
//!
//! - `local` - shells out to the `gcloud` CLI (argv only, never a shell)
//! - `remote` - calls the Google Cloud REST control plane with a probed token
//! - `cloud_run` - the tool handlers themselves

pub mod cloud_run;
pub mod local;
pub mod remote;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use std::sync::{Arc, OnceLock};

use crate::capabilities::{CapabilityContext, LocalCapabilities, RemoteCapabilities, SourceKind};
use crate::error::{Error, Result};
use crate::mcp::handler::ToolRegistry;

pub use local::LocalBackend;
pub use remote::RemoteBackend;

/// Permission a deploy needs on the target project.
pub const DEPLOY_PERMISSION: &str = "run.services.create";

/// Where a tool call operates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub project: Option<String>,
    pub region: String,
}

impl Target {
    /// Reject project or region values that are not plain Google Cloud identifiers.
    pub fn validate(&self) -> Result<()> {
        if let Some(project) = &self.project {
            check("project", project, project_pattern())?;
        }
        check("region", &self.region, region_pattern())
    }
}

/// Cloud Run service names: lowercase letters, digits and hyphens, starting
/// with a letter, at most 63 characters.
fn service_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z]([-a-z0-9]{0,61}[a-z0-9])?$").expect("service name pattern is valid"))
}

/// Project ids, optionally domain-scoped (`example.com:my-project`).
fn project_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([a-z0-9][-a-z0-9.]*[a-z0-9]:)?[a-z]([-a-z0-9]{0,61}[a-z0-9])?$").expect("project pattern is valid"))
}

/// `us-central1`, `europe-west4`, `northamerica-northeast2`, ...
fn region_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z]+(-[a-z]+)+[0-9]+$").expect("region pattern is valid"))
}

fn check(what: &str, value: &str, pattern: &Regex) -> Result<()> {
    if pattern.is_match(value) {
        Ok(())
    } else {
        Err(Error::InvalidToolArguments(format!("Invalid {}: {:?}", what, value)))
    }
}

/// Reject anything that is not a valid Cloud Run service name.
pub fn validate_service_name(service: &str) -> Result<()> {
    check("service name", service, service_pattern())
}

/// Operations behind the Cloud Run tools.
#[async_trait]
pub trait CloudRunBackend: Send + Sync {
    fn kind(&self) -> SourceKind;

    async fn list_projects(&self) -> Result<Value>;

    async fn list_services(&self, target: &Target) -> Result<Value>;

    async fn get_service(&self, target: &Target, service: &str) -> Result<Value>;

    /// Most recent log entries of `service`, newest first.
    async fn service_logs(&self, target: &Target, service: &str, limit: u32) -> Result<Value>;

    /// Fail with `PermissionDenied` unless the caller may deploy to the target project.
    async fn check_deploy_permissions(&self, target: &Target) -> Result<()>;

    async fn deploy_image(&self, target: &Target, service: &str, image: &str) -> Result<Value>;
}

/// Logging filter selecting one Cloud Run service's entries.
pub fn service_log_filter(target: &Target, service: &str) -> String {
    format!(
        "resource.type=\"cloud_run_revision\" AND resource.labels.service_name=\"{}\" AND resource.labels.location=\"{}\"",
        quote_filter_value(service),
        quote_filter_value(&target.region)
    )
}

/// Escape a value for use inside a double-quoted Logging filter string.
fn quote_filter_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Register the tools backed by the local `gcloud` CLI.
pub fn register_local_tools(
    registry: &mut ToolRegistry,
    context: CapabilityContext,
    local: LocalCapabilities,
) {
    let backend: Arc<dyn CloudRunBackend> = Arc::new(LocalBackend::new(local.gcloud));
    register_cloud_run_tools(registry, backend, context);
}

/// Register the tools backed by the REST control plane.
pub fn register_remote_tools(
    registry: &mut ToolRegistry,
    context: CapabilityContext,
    remote: RemoteCapabilities,
) {
    let backend: Arc<dyn CloudRunBackend> = Arc::new(RemoteBackend::new(remote.client));
    register_cloud_run_tools(registry, backend, context);
}

fn register_cloud_run_tools(
    registry: &mut ToolRegistry,
    backend: Arc<dyn CloudRunBackend>,
    context: CapabilityContext,
) {
    let context = Arc::new(context);

    registry.register(cloud_run::ListProjectsTool::new(backend.clone()));
    registry.register(cloud_run::ListServicesTool::new(backend.clone(), context.clone()));
    registry.register(cloud_run::GetServiceTool::new(backend.clone(), context.clone()));
    registry.register(cloud_run::GetServiceLogTool::new(backend.clone(), context.clone()));
    registry.register(cloud_run::DeployContainerImageTool::new(backend, context));
}
