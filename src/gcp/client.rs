//! GCP Client
//!
//! Client handle for the GCP tables. Combines the HTTP client, the
//! configured projects and the service endpoints, and pins itself to one
//! project per partition.

use super::http::{ApiError, GcpHttpClient};
use crate::client::ClientMeta;
use crate::config::GcpConfig;
use crate::multiplex::{Partition, PROJECT};
use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Base URL per GCP service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    urls: BTreeMap<String, String>,
}

impl Default for Endpoints {
    fn default() -> Self {
        let urls = [
            ("compute", "https://compute.googleapis.com/compute/v1"),
            ("storage", "https://storage.googleapis.com/storage/v1"),
            ("iam", "https://iam.googleapis.com/v1"),
            ("resourcemanager", "https://cloudresourcemanager.googleapis.com/v1"),
        ]
        .into_iter()
        .map(|(service, url)| (service.to_string(), url.to_string()))
        .collect();

        Self { urls }
    }
}

impl Endpoints {
    pub fn get(&self, service: &str) -> Option<&str> {
        self.urls.get(service).map(|s| s.as_str())
    }

    /// Point `service` at another base URL (an emulator, a test server)
    pub fn set(&mut self, service: &str, url: &str) -> Result<()> {
        let parsed = url::Url::parse(url).with_context(|| format!("Invalid endpoint URL for {}: {}", service, url))?;
        if !self.urls.contains_key(service) {
            anyhow::bail!("Unknown GCP service: {}", service);
        }
        self.urls
            .insert(service.to_string(), parsed.as_str().trim_end_matches('/').to_string());
        Ok(())
    }

    /// Point every known service at one base URL
    pub fn all(url: &str) -> Result<Self> {
        let mut endpoints = Self::default();
        let services: Vec<String> = endpoints.urls.keys().cloned().collect();
        for service in services {
            endpoints.set(&service, url)?;
        }
        Ok(endpoints)
    }
}

/// GCP client handle
#[derive(Clone)]
pub struct GcpClient {
    http: GcpHttpClient,
    token: Option<Arc<str>>,
    projects: Arc<[String]>,
    endpoints: Arc<Endpoints>,
    partition: Partition,
}

impl GcpClient {
    pub fn new(projects: Vec<String>, token: Option<String>) -> Result<Self> {
        Ok(Self {
            http: GcpHttpClient::new()?,
            token: token.map(Arc::from),
            projects: projects.into(),
            endpoints: Arc::new(Endpoints::default()),
            partition: Partition::default(),
        })
    }

    pub fn from_config(config: &GcpConfig) -> Result<Self> {
        let mut endpoints = Endpoints::default();
        for (service, url) in &config.endpoints {
            endpoints.set(service, url)?;
        }
        Ok(Self::new(config.projects.clone(), config.access_token())?.with_endpoints(endpoints))
    }

    pub fn with_endpoints(mut self, endpoints: Endpoints) -> Self {
        self.endpoints = Arc::new(endpoints);
        self
    }

    pub fn projects(&self) -> &[String] {
        &self.projects
    }

    /// Project this handle is pinned to
    pub fn project(&self) -> Option<&str> {
        self.partition.get(PROJECT)
    }

    /// Full URL of `path` under `service`
    pub fn url(&self, service: &str, path: &str) -> Result<String> {
        let base = self
            .endpoints
            .get(service)
            .with_context(|| format!("Unknown GCP service: {}", service))?;
        Ok(format!("{}/{}", base, path.trim_start_matches('/')))
    }

    pub async fn get(&self, url: &str, query: &[(&str, &str)]) -> Result<Value> {
        self.http.get(url, query, self.token.as_deref()).await
    }
}

impl ClientMeta for GcpClient {
    fn id(&self) -> String {
        match self.project() {
            Some(project) => format!("gcp:{}", project),
            None => "gcp".to_string(),
        }
    }

    fn partition(&self) -> &Partition {
        &self.partition
    }

    fn with_partition(&self, partition: &Partition) -> Result<Self> {
        let project = partition
            .get(PROJECT)
            .with_context(|| format!("partition {} has no project", partition))?;
        if !self.projects.iter().any(|p| p == project) {
            anyhow::bail!("project {} is not configured", project);
        }

        let mut pinned = self.clone();
        pinned.partition = partition.clone();
        Ok(pinned)
    }

    fn dimension_values(&self, dimension: &str) -> Vec<String> {
        match dimension {
            PROJECT => self.projects.to_vec(),
            _ => Vec::new(),
        }
    }

    fn is_not_found(&self, err: &anyhow::Error) -> bool {
        err.chain()
            .filter_map(|e| e.downcast_ref::<ApiError>())
            .any(ApiError::is_not_found)
    }
}
