//! Compute Engine address lookup

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use et_core::traits::AddressResolver;
use et_core::{CredentialSource, InstanceRef, ResolveError};

use crate::auth::TokenSource;
use crate::http::{self, ApiError};

/// Compute Engine API root
pub const COMPUTE_BASE_URL: &str = "https://compute.googleapis.com/compute/v1";

impl From<ApiError> for ResolveError {
    fn from(e: ApiError) -> Self {
        match e {
            ApiError::Request(msg) | ApiError::Decode(msg) => ResolveError::Lookup(msg),
            ApiError::Status { status, body } => {
                ResolveError::Lookup(format!("HTTP {}: {}", status, body))
            }
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Instance {
    network_interfaces: Vec<NetworkInterface>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct NetworkInterface {
    access_configs: Vec<AccessConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AccessConfig {
    #[serde(rename = "natIP")]
    nat_ip: Option<String>,
}

impl Instance {
    /// First external address across all interfaces
    fn external_address(&self) -> Option<&str> {
        self.network_interfaces
            .iter()
            .flat_map(|nic| nic.access_configs.iter())
            .find_map(|config| config.nat_ip.as_deref().filter(|ip| !ip.is_empty()))
    }
}

/// Resolves instances to their external IP via `instances.get`
pub struct ComputeResolver {
    client: Client,
    tokens: TokenSource,
    project: Option<String>,
    zone: Option<String>,
    base_url: String,
}

impl ComputeResolver {
    /// Create a resolver; `project`/`zone` fill in whatever an instance leaves unset
    pub fn new(
        credentials: CredentialSource,
        project: Option<String>,
        zone: Option<String>,
    ) -> Result<Self, ResolveError> {
        Ok(Self {
            client: http::client()?,
            tokens: TokenSource::new(credentials)
                .map_err(|e| ResolveError::Lookup(e.to_string()))?,
            project,
            zone,
            base_url: COMPUTE_BASE_URL.to_string(),
        })
    }

    /// Talk to a different API root
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl AddressResolver for ComputeResolver {
    async fn resolve(&self, instance: &InstanceRef) -> Result<String, ResolveError> {
        let project = instance
            .project
            .as_deref()
            .or(self.project.as_deref())
            .ok_or_else(|| ResolveError::MissingScope(format!("no project for {}", instance.name)))?;
        let zone = instance
            .zone
            .as_deref()
            .or(self.zone.as_deref())
            .ok_or_else(|| ResolveError::MissingScope(format!("no zone for {}", instance.name)))?;

        let token = self
            .tokens
            .token(&self.client)
            .await
            .map_err(|e| ResolveError::Lookup(e.to_string()))?;
        let url = format!(
            "{}/projects/{}/zones/{}/instances/{}",
            self.base_url, project, zone, instance.name
        );

        let found: Instance = http::send_json(self.client.get(url).bearer_auth(token)).await?;
        let address = found
            .external_address()
            .ok_or_else(|| ResolveError::NoAddress(instance.to_string()))?;

        tracing::debug!("{} has external address {}", instance, address);
        Ok(address.to_string())
    }
}
