//! GCP REST source
//!
//! A concrete client handle and a set of GCP tables that run on the sync
//! engine.
//!
//! # Module Structure
//!
//! - [`client`] - Client handle pinned to one project per partition
//! - [`definitions`] - Tables declared in embedded JSON
//! - [`http`] - HTTP utilities for REST API calls
//!
//! # Example
//!
//! ```ignore
//! let client = GcpClient::new(vec!["my-project".into()], token)?;
//! let registry = gcp::registry()?;
//! let tables = registry.select(&["gcp_compute_*".into()], &[])?;
//! let summary = Engine::default().sync(&client, &tables, sink).await?;
//! ```

pub mod client;
pub mod definitions;
pub mod http;

pub use client::{Endpoints, GcpClient};
pub use http::ApiError;

use crate::registry::TableRegistry;
use anyhow::Result;

/// Registry of every GCP table
pub fn registry() -> Result<TableRegistry<GcpClient>> {
    let tables = definitions::definitions()?
        .iter()
        .map(definitions::build_table)
        .collect::<Vec<_>>();
    Ok(TableRegistry::new(tables)?)
}
