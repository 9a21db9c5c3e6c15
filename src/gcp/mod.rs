//! Google Cloud collaborators.
//!
//! # Architecture
//!
//! - `credentials` - Application Default Credentials probe
//! - `metadata` - hosting-environment detection via the metadata server
//! - `api_client` - authenticated REST client for the control plane
//! - `retry` - exponential backoff for transient failures
//! - `gcloud` - local CLI runner and the allow-listed command interface

pub mod api_client;
pub mod credentials;
pub mod gcloud;
pub mod metadata;
pub mod retry;

pub use api_client::{ApiEndpoints, CloudApiClient};
pub use credentials::{AccessGrant, AdcProbe, CredentialProbe};
pub use gcloud::{AllowedCommand, CommandOutput, GcloudRunner};
pub use metadata::{EnvironmentProbe, HostEnvironment, MetadataClient, NoEnvironment};
