//! Multiplexing
//!
//! A multiplexer expands one logical table into independent partitions,
//! one fetch invocation per partition (account x region, project, ...).

use crate::client::ClientMeta;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;

pub const ACCOUNT: &str = "account";
pub const REGION: &str = "region";
pub const PROJECT: &str = "project";

/// Unit of parallel fetch work: a set of named dimension values
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Partition {
    dims: BTreeMap<String, String>,
}

impl Partition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, dimension: &str, value: &str) -> Self {
        self.dims.insert(dimension.to_string(), value.to_string());
        self
    }

    pub fn get(&self, dimension: &str) -> Option<&str> {
        self.dims.get(dimension).map(|s| s.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.dims.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.dims.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.dims.is_empty() {
            return f.write_str("default");
        }
        let mut first = true;
        for (k, v) in &self.dims {
            if !first {
                f.write_str(",")?;
            }
            write!(f, "{}={}", k, v)?;
            first = false;
        }
        Ok(())
    }
}

/// Expands a table into partitions
pub trait Multiplexer<C>: Send + Sync {
    fn partitions(&self, client: &C) -> Vec<Partition>;
}

/// Single partition, used for tables without a multiplexer
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMultiplex;

impl<C: ClientMeta> Multiplexer<C> for NoMultiplex {
    fn partitions(&self, _client: &C) -> Vec<Partition> {
        vec![Partition::default()]
    }
}

/// Cross product of configured dimension values
#[derive(Debug, Clone)]
pub struct DimensionMultiplexer {
    dimensions: Vec<String>,
    service: Option<String>,
}

impl DimensionMultiplexer {
    pub fn new<I, S>(dimensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            dimensions: dimensions.into_iter().map(Into::into).collect(),
            service: None,
        }
    }

    /// account x region
    pub fn account_region() -> Self {
        Self::new([ACCOUNT, REGION])
    }

    pub fn project() -> Self {
        Self::new([PROJECT])
    }

    /// Only keep partitions where `service` is enabled
    pub fn for_service(mut self, service: &str) -> Self {
        self.service = Some(service.to_string());
        self
    }

    pub fn dimensions(&self) -> &[String] {
        &self.dimensions
    }
}

impl<C: ClientMeta> Multiplexer<C> for DimensionMultiplexer {
    fn partitions(&self, client: &C) -> Vec<Partition> {
        let mut partitions = vec![Partition::default()];

        for dim in &self.dimensions {
            let values = client.dimension_values(dim);
            partitions = partitions
                .iter()
                .flat_map(|p| values.iter().map(move |v| p.clone().with(dim, v)))
                .collect();
        }

        let mut seen = HashSet::new();
        partitions.retain(|p| seen.insert(p.clone()));

        if let Some(service) = &self.service {
            partitions.retain(|p| {
                let enabled = client.service_enabled(p, service);
                if !enabled {
                    tracing::debug!("service {} disabled for {}, skipping", service, p);
                }
                enabled
            });
        }

        partitions
    }
}
