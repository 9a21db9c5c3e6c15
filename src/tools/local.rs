//! Tool backend driving the local `gcloud` CLI.

use async_trait::async_trait;
use serde_json::Value;

use crate::capabilities::SourceKind;
use crate::error::Result;
use crate::gcp::GcloudRunner;
use crate::tools::{service_log_filter, CloudRunBackend, Target};

/// Runs every operation as a `gcloud ... --format=json` invocation.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    gcloud: GcloudRunner,
}

impl LocalBackend {
    pub fn new(gcloud: GcloudRunner) -> Self {
        Self { gcloud }
    }
}

/// Build an argv: command words, flags, target flags, JSON output, then
/// `--` and the positional arguments so none of them can be read as a flag.
fn command(words: &[&str], flags: &[String], target: Option<&Target>, positionals: &[&str]) -> Vec<String> {
    let mut args: Vec<String> = words.iter().map(|w| w.to_string()).collect();
    args.extend(flags.iter().cloned());
    if let Some(target) = target {
        args.push(format!("--region={}", target.region));
        if let Some(project) = &target.project {
            args.push(format!("--project={}", project));
        }
    }
    args.push("--format=json".to_string());
    if !positionals.is_empty() {
        args.push("--".to_string());
        args.extend(positionals.iter().map(|p| p.to_string()));
    }
    args
}

#[async_trait]
impl CloudRunBackend for LocalBackend {
    fn kind(&self) -> SourceKind {
        SourceKind::Local
    }

    async fn list_projects(&self) -> Result<Value> {
        self.gcloud.run_json(&command(&["projects", "list"], &[], None, &[])).await
    }

    async fn list_services(&self, target: &Target) -> Result<Value> {
        self.gcloud
            .run_json(&command(&["run", "services", "list"], &[], Some(target), &[]))
            .await
    }

    async fn get_service(&self, target: &Target, service: &str) -> Result<Value> {
        self.gcloud
            .run_json(&command(&["run", "services", "describe"], &[], Some(target), &[service]))
            .await
    }

    async fn service_logs(&self, target: &Target, service: &str, limit: u32) -> Result<Value> {
        let filter = service_log_filter(target, service);
        let mut flags = vec![format!("--limit={}", limit)];
        if let Some(project) = &target.project {
            flags.push(format!("--project={}", project));
        }
        self.gcloud
            .run_json(&command(&["logging", "read"], &flags, None, &[filter.as_str()]))
            .await
    }

    /// `gcloud run deploy` reports missing permissions itself.
    async fn check_deploy_permissions(&self, _target: &Target) -> Result<()> {
        Ok(())
    }

    async fn deploy_image(&self, target: &Target, service: &str, image: &str) -> Result<Value> {
        let flags = [format!("--image={}", image), "--quiet".to_string()];
        self.gcloud
            .run_json(&command(&["run", "deploy"], &flags, Some(target), &[service]))
            .await
    }
}
