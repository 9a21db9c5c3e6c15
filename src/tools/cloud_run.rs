//! Cloud Run tools.
//!
//! Project, region and service arguments fall back to the server's
//! [`CapabilityContext`] when omitted.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::capabilities::CapabilityContext;
use crate::error::{Error, Result};
use crate::mcp::handler::{
    error_result, get_int_arg, get_optional_string_arg, get_string_arg, success_result, ToolHandler,
};
use crate::mcp::protocol::{Tool, ToolResult};
use crate::tools::{validate_service_name, CloudRunBackend, Target};

/// Log entries returned when `limit` is omitted.
const DEFAULT_LOG_LIMIT: i64 = 50;
const MAX_LOG_LIMIT: i64 = 1000;

fn target(args: &HashMap<String, Value>, context: &CapabilityContext) -> Result<Target> {
    let target = Target {
        project: get_optional_string_arg(args, "project").or_else(|| context.project_id.clone()),
        region: get_optional_string_arg(args, "region").unwrap_or_else(|| context.region.clone()),
    };
    target.validate()?;
    Ok(target)
}

fn service_name(args: &HashMap<String, Value>, context: &CapabilityContext) -> Result<String> {
    let service = get_optional_string_arg(args, "service")
        .or_else(|| context.service_name.clone())
        .ok_or_else(|| Error::InvalidToolArguments("Missing required argument: service".to_string()))?;
    validate_service_name(&service)?;
    Ok(service)
}

fn json_result(value: &Value) -> Result<ToolResult> {
    Ok(success_result(serde_json::to_string_pretty(value)?))
}

fn location_properties() -> Value {
    json!({
        "project": {
            "type": "string",
            "description": "Google Cloud project ID (defaults to the server's project)"
        },
        "region": {
            "type": "string",
            "description": "Cloud Run region (defaults to the server's region)"
        }
    })
}

fn schema(mut properties: Value, required: &[&str]) -> Value {
    if let (Some(props), Value::Object(location)) = (properties.as_object_mut(), location_properties()) {
        props.extend(location);
    }
    json!({
        "type": "object",
        "properties": properties,
        "required": required
    })
}

/// List the Google Cloud projects the caller can see.
pub struct ListProjectsTool {
    backend: Arc<dyn CloudRunBackend>,
}

impl ListProjectsTool {
    pub fn new(backend: Arc<dyn CloudRunBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl ToolHandler for ListProjectsTool {
    fn definition(&self) -> Tool {
        Tool {
            name: "list_projects".to_string(),
            description: "List the Google Cloud projects you have access to.".to_string(),
            input_schema: json!({ "type": "object", "properties": {} }),
        }
    }

    async fn execute(&self, _args: HashMap<String, Value>) -> Result<ToolResult> {
        match self.backend.list_projects().await {
            Ok(projects) => json_result(&projects),
            Err(e) => Ok(error_result(format!("Failed to list projects: {}", e))),
        }
    }
}

/// List Cloud Run services in a project and region.
pub struct ListServicesTool {
    backend: Arc<dyn CloudRunBackend>,
    context: Arc<CapabilityContext>,
}

impl ListServicesTool {
    pub fn new(backend: Arc<dyn CloudRunBackend>, context: Arc<CapabilityContext>) -> Self {
        Self { backend, context }
    }
}

#[async_trait]
impl ToolHandler for ListServicesTool {
    fn definition(&self) -> Tool {
        Tool {
            name: "list_services".to_string(),
            description: "List the Cloud Run services in a project and region.".to_string(),
            input_schema: schema(json!({}), &[]),
        }
    }

    async fn execute(&self, args: HashMap<String, Value>) -> Result<ToolResult> {
        let target = target(&args, &self.context)?;
        match self.backend.list_services(&target).await {
            Ok(services) => json_result(&services),
            Err(e) => Ok(error_result(format!("Failed to list services: {}", e))),
        }
    }
}

/// Describe one Cloud Run service, including its URL and latest revision.
pub struct GetServiceTool {
    backend: Arc<dyn CloudRunBackend>,
    context: Arc<CapabilityContext>,
}

impl GetServiceTool {
    pub fn new(backend: Arc<dyn CloudRunBackend>, context: Arc<CapabilityContext>) -> Self {
        Self { backend, context }
    }
}

#[async_trait]
impl ToolHandler for GetServiceTool {
    fn definition(&self) -> Tool {
        Tool {
            name: "get_service".to_string(),
            description: "Get details for a Cloud Run service, including its URL.".to_string(),
            input_schema: schema(
                json!({
                    "service": {
                        "type": "string",
                        "description": "Name of the Cloud Run service"
                    }
                }),
                &[],
            ),
        }
    }

    async fn execute(&self, args: HashMap<String, Value>) -> Result<ToolResult> {
        let service = service_name(&args, &self.context)?;
        let target = target(&args, &self.context)?;
        match self.backend.get_service(&target, &service).await {
            Ok(details) => json_result(&details),
            Err(e) => Ok(error_result(format!("Failed to get service {}: {}", service, e))),
        }
    }
}

/// Fetch recent log entries for a Cloud Run service.
pub struct GetServiceLogTool {
    backend: Arc<dyn CloudRunBackend>,
    context: Arc<CapabilityContext>,
}

impl GetServiceLogTool {
    pub fn new(backend: Arc<dyn CloudRunBackend>, context: Arc<CapabilityContext>) -> Self {
        Self { backend, context }
    }
}

#[async_trait]
impl ToolHandler for GetServiceLogTool {
    fn definition(&self) -> Tool {
        Tool {
            name: "get_service_log".to_string(),
            description: "Get the most recent log entries of a Cloud Run service.".to_string(),
            input_schema: schema(
                json!({
                    "service": {
                        "type": "string",
                        "description": "Name of the Cloud Run service"
                    },
                    "limit": {
                        "type": "integer",
                        "description": "Maximum number of entries (default: 50)"
                    }
                }),
                &[],
            ),
        }
    }

    async fn execute(&self, args: HashMap<String, Value>) -> Result<ToolResult> {
        let service = service_name(&args, &self.context)?;
        let target = target(&args, &self.context)?;
        let limit = get_int_arg(&args, "limit", DEFAULT_LOG_LIMIT).clamp(1, MAX_LOG_LIMIT) as u32;

        match self.backend.service_logs(&target, &service, limit).await {
            Ok(entries) => json_result(&entries),
            Err(e) => Ok(error_result(format!("Failed to read logs for {}: {}", service, e))),
        }
    }
}

/// Deploy a container image to Cloud Run, creating the service if needed.
pub struct DeployContainerImageTool {
    backend: Arc<dyn CloudRunBackend>,
    context: Arc<CapabilityContext>,
}

impl DeployContainerImageTool {
    pub fn new(backend: Arc<dyn CloudRunBackend>, context: Arc<CapabilityContext>) -> Self {
        Self { backend, context }
    }
}

#[async_trait]
impl ToolHandler for DeployContainerImageTool {
    fn definition(&self) -> Tool {
        Tool {
            name: "deploy_container_image".to_string(),
            description: "Deploy a container image to Cloud Run. Creates the service if it does not exist, otherwise rolls out a new revision.".to_string(),
            input_schema: schema(
                json!({
                    "image": {
                        "type": "string",
                        "description": "Container image URL, e.g. us-docker.pkg.dev/cloudrun/container/hello"
                    },
                    "service": {
                        "type": "string",
                        "description": "Name of the Cloud Run service (defaults to the server's default service name)"
                    }
                }),
                &["image"],
            ),
        }
    }

    async fn execute(&self, args: HashMap<String, Value>) -> Result<ToolResult> {
        let image = get_string_arg(&args, "image")?;
        let service = service_name(&args, &self.context)?;
        let target = target(&args, &self.context)?;

        if !self.context.skip_iam_check {
            if let Err(e) = self.backend.check_deploy_permissions(&target).await {
                return Ok(error_result(format!("IAM check failed: {}", e)));
            }
        }

        match self.backend.deploy_image(&target, &service, &image).await {
            Ok(operation) => json_result(&operation),
            Err(e) => Ok(error_result(format!("Failed to deploy {}: {}", service, e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::SourceKind;
    use std::sync::Mutex;

    /// Records calls and answers from canned values.
    #[derive(Default)]
    struct FakeBackend {
        calls: Mutex<Vec<String>>,
        deny_deploy: bool,
    }

    impl FakeBackend {
        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CloudRunBackend for FakeBackend {
        fn kind(&self) -> SourceKind {
            SourceKind::Local
        }

        async fn list_projects(&self) -> Result<Value> {
            self.record("list_projects".to_string());
            Ok(json!([{ "projectId": "demo" }]))
        }

        async fn list_services(&self, target: &Target) -> Result<Value> {
            self.record(format!("list_services {:?} {}", target.project, target.region));
            Ok(json!([]))
        }

        async fn get_service(&self, target: &Target, service: &str) -> Result<Value> {
            self.record(format!("get_service {} {}", target.region, service));
            Err(Error::api(404, "Not Found", "no such service"))
        }

        async fn service_logs(&self, _target: &Target, service: &str, limit: u32) -> Result<Value> {
            self.record(format!("service_logs {} {}", service, limit));
            Ok(json!({ "entries": [] }))
        }

        async fn check_deploy_permissions(&self, _target: &Target) -> Result<()> {
            self.record("check_deploy_permissions".to_string());
            if self.deny_deploy {
                Err(Error::PermissionDenied(vec!["run.services.create".to_string()]))
            } else {
                Ok(())
            }
        }

        async fn deploy_image(&self, _target: &Target, service: &str, image: &str) -> Result<Value> {
            self.record(format!("deploy_image {} {}", service, image));
            Ok(json!({ "name": "operations/1" }))
        }
    }

    fn context(skip_iam_check: bool) -> Arc<CapabilityContext> {
        Arc::new(CapabilityContext {
            project_id: Some("demo".to_string()),
            region: "us-central1".to_string(),
            service_name: Some("default-svc".to_string()),
            skip_iam_check,
            credentials_available: false,
        })
    }

    fn args(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn text(result: &ToolResult) -> &str {
        let crate::mcp::protocol::ContentBlock::Text { text } = &result.content[0];
        text
    }

    #[tokio::test]
    async fn test_arguments_fall_back_to_context() {
        let backend = Arc::new(FakeBackend::default());
        let tool = ListServicesTool::new(backend.clone(), context(true));

        tool.execute(HashMap::new()).await.unwrap();
        tool.execute(args(&[("project", json!("other")), ("region", json!("europe-west1"))]))
            .await
            .unwrap();

        assert_eq!(
            backend.calls(),
            vec![
                "list_services Some(\"demo\") us-central1",
                "list_services Some(\"other\") europe-west1"
            ]
        );
    }

    #[tokio::test]
    async fn test_backend_error_is_error_result() {
        let backend = Arc::new(FakeBackend::default());
        let tool = GetServiceTool::new(backend.clone(), context(true));

        let result = tool.execute(HashMap::new()).await.unwrap();
        assert!(result.is_error);
        assert!(text(&result).contains("default-svc"));
    }

    #[tokio::test]
    async fn test_log_limit_is_clamped() {
        let backend = Arc::new(FakeBackend::default());
        let tool = GetServiceLogTool::new(backend.clone(), context(true));

        tool.execute(args(&[("service", json!("api"))])).await.unwrap();
        tool.execute(args(&[("service", json!("api")), ("limit", json!(100_000))]))
            .await
            .unwrap();

        assert_eq!(backend.calls(), vec!["service_logs api 50", "service_logs api 1000"]);
    }

    #[tokio::test]
    async fn test_deploy_skips_iam_check_when_configured() {
        let backend = Arc::new(FakeBackend::default());
        let tool = DeployContainerImageTool::new(backend.clone(), context(true));

        let result = tool
            .execute(args(&[("image", json!("gcr.io/demo/app"))]))
            .await
            .unwrap();
        assert!(!result.is_error);
        assert_eq!(backend.calls(), vec!["deploy_image default-svc gcr.io/demo/app"]);
    }

    #[tokio::test]
    async fn test_deploy_denied_by_iam_check() {
        let backend = Arc::new(FakeBackend {
            deny_deploy: true,
            ..Default::default()
        });
        let tool = DeployContainerImageTool::new(backend.clone(), context(false));

        let result = tool
            .execute(args(&[("image", json!("gcr.io/demo/app")), ("service", json!("web"))]))
            .await
            .unwrap();
        assert!(result.is_error);
        assert!(text(&result).contains("IAM check failed"));
        assert_eq!(backend.calls(), vec!["check_deploy_permissions"]);
    }

    #[tokio::test]
    async fn test_deploy_requires_image() {
        let backend = Arc::new(FakeBackend::default());
        let tool = DeployContainerImageTool::new(backend, context(true));
        let err = tool.execute(HashMap::new()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidToolArguments(_)));
    }

    #[tokio::test]
    async fn test_malformed_names_never_reach_backend() {
        let backend = Arc::new(FakeBackend::default());
        let get = GetServiceTool::new(backend.clone(), context(true));
        let logs = GetServiceLogTool::new(backend.clone(), context(true));
        let deploy = DeployContainerImageTool::new(backend.clone(), context(true));

        for service in [
            "--impersonate-service-account=evil@x.iam.gserviceaccount.com",
            "x\" OR resource.type!=\"none",
            "../../v1/projects/other",
        ] {
            let err = get.execute(args(&[("service", json!(service))])).await.unwrap_err();
            assert!(matches!(err, Error::InvalidToolArguments(_)));
            let err = logs.execute(args(&[("service", json!(service))])).await.unwrap_err();
            assert!(matches!(err, Error::InvalidToolArguments(_)));
            let err = deploy
                .execute(args(&[("image", json!("gcr.io/demo/app")), ("service", json!(service))]))
                .await
                .unwrap_err();
            assert!(matches!(err, Error::InvalidToolArguments(_)));
        }

        let list = ListServicesTool::new(backend.clone(), context(true));
        let err = list
            .execute(args(&[("region", json!("us-central1/../../v1"))]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidToolArguments(_)));
        let err = list
            .execute(args(&[("project", json!("--impersonate-service-account=x"))]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidToolArguments(_)));

        assert!(backend.calls().is_empty());
    }

    #[test]
    fn test_schemas_include_location() {
        let tool = DeployContainerImageTool::new(Arc::new(FakeBackend::default()), context(true));
        let definition = tool.definition();
        assert!(definition.input_schema["properties"]["project"].is_object());
        assert!(definition.input_schema["properties"]["region"].is_object());
        assert_eq!(definition.input_schema["required"], json!(["image"]));
    }
}
