//! Tool backend proxying to the Google Cloud control plane.

use async_trait::async_trait;
use serde_json::Value;

use crate::capabilities::SourceKind;
use crate::error::{Error, Result};
use crate::gcp::CloudApiClient;
use crate::tools::{service_log_filter, validate_service_name, CloudRunBackend, Target, DEPLOY_PERMISSION};

#[derive(Debug, Clone)]
pub struct RemoteBackend {
    client: CloudApiClient,
}

impl RemoteBackend {
    pub fn new(client: CloudApiClient) -> Self {
        Self { client }
    }
}

/// Project of a validated target; the values end up in URL paths.
fn project(target: &Target) -> Result<&str> {
    target.validate()?;
    target
        .project
        .as_deref()
        .ok_or_else(|| Error::InvalidToolArguments("project is required".to_string()))
}

#[async_trait]
impl CloudRunBackend for RemoteBackend {
    fn kind(&self) -> SourceKind {
        SourceKind::Remote
    }

    async fn list_projects(&self) -> Result<Value> {
        self.client.list_projects().await
    }

    async fn list_services(&self, target: &Target) -> Result<Value> {
        self.client.list_services(project(target)?, &target.region).await
    }

    async fn get_service(&self, target: &Target, service: &str) -> Result<Value> {
        validate_service_name(service)?;
        self.client
            .get_service(project(target)?, &target.region, service)
            .await
    }

    async fn service_logs(&self, target: &Target, service: &str, limit: u32) -> Result<Value> {
        validate_service_name(service)?;
        let filter = service_log_filter(target, service);
        self.client
            .list_log_entries(project(target)?, &filter, limit)
            .await
    }

    async fn check_deploy_permissions(&self, target: &Target) -> Result<()> {
        let granted = self
            .client
            .test_iam_permissions(project(target)?, &[DEPLOY_PERMISSION])
            .await?;

        if granted.iter().any(|p| p == DEPLOY_PERMISSION) {
            Ok(())
        } else {
            Err(Error::PermissionDenied(vec![DEPLOY_PERMISSION.to_string()]))
        }
    }

    async fn deploy_image(&self, target: &Target, service: &str, image: &str) -> Result<Value> {
        validate_service_name(service)?;
        self.client
            .deploy_image(project(target)?, &target.region, service, image)
            .await
    }
}
