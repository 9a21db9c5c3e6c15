//! HTTP client for the Google Cloud control plane.
//!
//! Thin wrappers over the Cloud Run Admin v2, Resource Manager v1 and
//! Logging v2 REST APIs, authenticated with a bearer token.

use reqwest::{Client, Method, Response, StatusCode};
use serde::Serialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::gcp::retry::{retry_api, BackoffParams};
use crate::VERSION;

/// Base URLs of the APIs the remote tools talk to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiEndpoints {
    pub run: String,
    pub resource_manager: String,
    pub logging: String,
}

impl Default for ApiEndpoints {
    fn default() -> Self {
        Self {
            run: "https://run.googleapis.com".to_string(),
            resource_manager: "https://cloudresourcemanager.googleapis.com".to_string(),
            logging: "https://logging.googleapis.com".to_string(),
        }
    }
}

impl ApiEndpoints {
    /// All three APIs served from one root; used against emulators and fakes.
    pub fn single(root: impl Into<String>) -> Self {
        let root = root.into().trim_end_matches('/').to_string();
        Self {
            run: root.clone(),
            resource_manager: root.clone(),
            logging: root,
        }
    }
}

fn user_agent() -> String {
    format!("cloud-run-mcp/{} (rust)", VERSION)
}

/// Authenticated control-plane client.
#[derive(Debug, Clone)]
pub struct CloudApiClient {
    client: Client,
    endpoints: ApiEndpoints,
    access_token: String,
    backoff: BackoffParams,
}

impl CloudApiClient {
    /// Create a new API client. Every endpoint must be an absolute URL.
    pub fn new(endpoints: ApiEndpoints, access_token: impl Into<String>) -> Result<Self> {
        for root in [&endpoints.run, &endpoints.resource_manager, &endpoints.logging] {
            reqwest::Url::parse(root)
                .map_err(|e| Error::Config(format!("Invalid API endpoint {}: {}", root, e)))?;
        }

        let client = Client::builder()
            .user_agent(user_agent())
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoints,
            access_token: access_token.into(),
            backoff: BackoffParams::default(),
        })
    }

    /// Replace the retry policy.
    pub fn with_backoff(mut self, backoff: BackoffParams) -> Self {
        self.backoff = backoff;
        self
    }

    async fn send<B: Serialize>(&self, method: Method, url: &str, body: Option<&B>) -> Result<Response> {
        let mut request = self
            .client
            .request(method, url)
            .bearer_auth(&self.access_token)
            .header("X-Request-Id", Uuid::new_v4().to_string());
        if let Some(body) = body {
            request = request.json(body);
        }
        Ok(request.send().await?)
    }

    /// Make an authenticated request and decode the JSON body.
    async fn request<B: Serialize>(&self, method: Method, url: &str, body: Option<&B>) -> Result<Value> {
        retry_api(
            || async {
                let response = self.send(method.clone(), url, body).await?;
                handle_response(response).await
            },
            &self.backoff,
        )
        .await
    }

    // ===== Resource Manager =====

    /// Projects visible to the caller.
    pub async fn list_projects(&self) -> Result<Value> {
        let url = format!("{}/v1/projects", self.endpoints.resource_manager);
        self.request::<()>(Method::GET, &url, None).await
    }

    /// Subset of `permissions` the caller holds on `project`.
    pub async fn test_iam_permissions(&self, project: &str, permissions: &[&str]) -> Result<Vec<String>> {
        let url = format!(
            "{}/v1/projects/{}:testIamPermissions",
            self.endpoints.resource_manager, project
        );
        let body = json!({ "permissions": permissions });
        let response = self.request(Method::POST, &url, Some(&body)).await?;

        Ok(response["permissions"]
            .as_array()
            .map(|granted| {
                granted
                    .iter()
                    .filter_map(|p| p.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default())
    }

    // ===== Cloud Run =====

    fn services_url(&self, project: &str, region: &str) -> String {
        format!(
            "{}/v2/projects/{}/locations/{}/services",
            self.endpoints.run, project, region
        )
    }

    /// Services in a project/region.
    pub async fn list_services(&self, project: &str, region: &str) -> Result<Value> {
        let url = self.services_url(project, region);
        self.request::<()>(Method::GET, &url, None).await
    }

    /// A single service.
    pub async fn get_service(&self, project: &str, region: &str, service: &str) -> Result<Value> {
        let url = format!("{}/{}", self.services_url(project, region), service);
        self.request::<()>(Method::GET, &url, None).await
    }

    /// Create the service, or roll out a new revision if it already exists.
    pub async fn deploy_image(
        &self,
        project: &str,
        region: &str,
        service: &str,
        image: &str,
    ) -> Result<Value> {
        let body = json!({
            "template": {
                "containers": [{ "image": image }]
            }
        });

        match self.get_service(project, region, service).await {
            Ok(_) => {
                let url = format!("{}/{}", self.services_url(project, region), service);
                self.request(Method::PATCH, &url, Some(&body)).await
            }
            Err(Error::Api { status: 404, .. }) => {
                let url = format!(
                    "{}?serviceId={}",
                    self.services_url(project, region),
                    service
                );
                self.request(Method::POST, &url, Some(&body)).await
            }
            Err(e) => Err(e),
        }
    }

    // ===== Logging =====

    /// Most recent log entries matching `filter`, newest first.
    pub async fn list_log_entries(&self, project: &str, filter: &str, limit: u32) -> Result<Value> {
        let url = format!("{}/v2/entries:list", self.endpoints.logging);
        let body = json!({
            "resourceNames": [format!("projects/{}", project)],
            "filter": filter,
            "orderBy": "timestamp desc",
            "pageSize": limit,
        });
        self.request(Method::POST, &url, Some(&body)).await
    }
}

/// Map non-2xx statuses onto `Error::Api`, otherwise decode JSON.
async fn handle_response(response: Response) -> Result<Value> {
    let status = response.status();

    if !status.is_success() {
        let status_text = status.canonical_reason().unwrap_or("Unknown");
        let body = response.text().await.unwrap_or_default();
        return Err(Error::api(status.as_u16(), status_text, body));
    }

    if status == StatusCode::NO_CONTENT {
        return Ok(Value::Null);
    }

    response
        .json()
        .await
        .map_err(|e| Error::Internal(format!("Failed to parse response: {}", e)))
}
