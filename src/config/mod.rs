//! Configuration management for the Cloud Run MCP server.

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::capabilities::CloudDefaults;
use crate::error::{Error, Result};

/// Command-line arguments for the Cloud Run MCP server.
#[derive(Parser, Debug, Clone)]
#[command(name = "cloud-run-mcp")]
#[command(author = "Cloud Run MCP Contributors")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "MCP server for deploying and inspecting Cloud Run services")]
pub struct Args {
    /// HTTP port
    #[arg(short, long, default_value = "3000", env = "PORT")]
    pub port: u16,

    /// Address to bind
    #[arg(long, default_value = "0.0.0.0", env = "HOST")]
    pub host: String,

    /// Google Cloud project (overrides the detected one)
    #[arg(long, env = "GOOGLE_CLOUD_PROJECT")]
    pub project: Option<String>,

    /// Google Cloud region (overrides the detected one)
    #[arg(long, env = "GOOGLE_CLOUD_REGION")]
    pub region: Option<String>,

    /// Service name used when a tool call names none
    #[arg(long, env = "DEFAULT_SERVICE_NAME")]
    pub default_service_name: Option<String>,

    /// Only the literal "false" turns the IAM pre-check on
    #[arg(long, default_value = "true", env = "SKIP_IAM_CHECK")]
    pub skip_iam_check: String,

    /// gcloud binary used by local tools
    #[arg(long, default_value = "gcloud", env = "GCLOUD_PATH")]
    pub gcloud_path: PathBuf,

    /// Serve POST /ask for allow-listed read-only gcloud commands
    #[arg(long, env = "ENABLE_COMMAND_ENDPOINT")]
    pub enable_command_endpoint: bool,

    /// Enable metrics collection and GET /metrics
    #[arg(long, env = "MCP_METRICS")]
    pub metrics: bool,

    /// Enable debug logging
    #[arg(short, long, env = "MCP_DEBUG")]
    pub debug: bool,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    /// HTTP port
    pub port: u16,
    /// Bind address
    pub host: String,
    /// Explicit project override
    pub project: Option<String>,
    /// Explicit region override
    pub region: Option<String>,
    /// Default deploy target
    pub default_service_name: Option<String>,
    /// Whether tools skip the IAM pre-check
    pub skip_iam_check: bool,
    /// gcloud binary
    pub gcloud_path: PathBuf,
    /// POST /ask enabled
    pub enable_command_endpoint: bool,
    /// Metrics enabled
    pub metrics: bool,
    /// Debug mode
    pub debug: bool,
}

/// Any value but the literal `"false"` skips the check.
fn skip_iam_check(raw: &str) -> bool {
    raw != "false"
}

impl From<Args> for Config {
    fn from(args: Args) -> Self {
        Self {
            port: args.port,
            host: args.host,
            project: args.project.filter(|p| !p.is_empty()),
            region: args.region.filter(|r| !r.is_empty()),
            default_service_name: args.default_service_name.filter(|s| !s.is_empty()),
            skip_iam_check: skip_iam_check(&args.skip_iam_check),
            gcloud_path: args.gcloud_path,
            enable_command_endpoint: args.enable_command_endpoint,
            metrics: args.metrics,
            debug: args.debug,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3000,
            host: "0.0.0.0".to_string(),
            project: None,
            region: None,
            default_service_name: None,
            skip_iam_check: true,
            gcloud_path: PathBuf::from("gcloud"),
            enable_command_endpoint: false,
            metrics: false,
            debug: false,
        }
    }
}

impl Config {
    /// Environment-level defaults for the capability resolver.
    pub fn cloud_defaults(&self) -> CloudDefaults {
        CloudDefaults {
            project_id: self.project.clone(),
            region: self.region.clone(),
            service_name: self.default_service_name.clone(),
            skip_iam_check: self.skip_iam_check,
        }
    }

    /// Socket address to listen on.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| Error::Config(format!("invalid listen address {}:{}: {}", self.host, self.port, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> Args {
        Args {
            port: 8080,
            host: "127.0.0.1".to_string(),
            project: Some("demo".to_string()),
            region: Some("europe-west1".to_string()),
            default_service_name: Some("web".to_string()),
            skip_iam_check: "true".to_string(),
            gcloud_path: PathBuf::from("/usr/bin/gcloud"),
            enable_command_endpoint: false,
            metrics: true,
            debug: false,
        }
    }

    #[test]
    fn test_skip_iam_check_only_false_enables() {
        assert!(!skip_iam_check("false"));
        for raw in ["true", "False", "0", "no", ""] {
            assert!(skip_iam_check(raw), "{raw:?}");
        }
    }

    #[test]
    fn test_config_default_values() {
        let config = Config::default();

        assert_eq!(config.port, 3000);
        assert_eq!(config.host, "0.0.0.0");
        assert!(config.skip_iam_check);
        assert!(!config.enable_command_endpoint);
        assert!(!config.metrics);
        assert_eq!(config.gcloud_path, PathBuf::from("gcloud"));
    }

    #[test]
    fn test_args_to_config() {
        let config: Config = args().into();

        assert_eq!(config.port, 8080);
        assert_eq!(config.project.as_deref(), Some("demo"));
        assert!(config.skip_iam_check);
        assert!(config.metrics);

        let strict: Config = Args {
            skip_iam_check: "false".to_string(),
            project: Some(String::new()),
            ..args()
        }
        .into();
        assert!(!strict.skip_iam_check);
        assert_eq!(strict.project, None);
    }

    #[test]
    fn test_cloud_defaults() {
        let config: Config = args().into();
        let defaults = config.cloud_defaults();

        assert_eq!(defaults.project_id.as_deref(), Some("demo"));
        assert_eq!(defaults.region.as_deref(), Some("europe-west1"));
        assert_eq!(defaults.service_name.as_deref(), Some("web"));
        assert!(defaults.skip_iam_check);
    }

    #[test]
    fn test_listen_addr() {
        let config: Config = args().into();
        assert_eq!(config.listen_addr().unwrap().to_string(), "127.0.0.1:8080");

        let bad = Config {
            host: "not a host".to_string(),
            ..Config::default()
        };
        assert!(matches!(bad.listen_addr(), Err(Error::Config(_))));
    }

    #[test]
    fn test_parse_flags() {
        let args = Args::try_parse_from([
            "cloud-run-mcp",
            "--port",
            "9000",
            "--project",
            "cli-project",
            "--skip-iam-check",
            "false",
            "--enable-command-endpoint",
        ])
        .unwrap();
        let config: Config = args.into();

        assert_eq!(config.port, 9000);
        assert_eq!(config.project.as_deref(), Some("cli-project"));
        assert!(!config.skip_iam_check);
        assert!(config.enable_command_endpoint);
    }

    #[test]
    fn test_config_serialization() {
        let config = Config {
            port: 8080,
            debug: true,
            ..Config::default()
        };

        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"port\":8080"));
        assert!(json.contains("\"debug\":true"));

        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
