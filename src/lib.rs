//! tablesync - resolve cloud API resources into typed rows
//!
//! Tables are declared as a forest of schemas with resolvers. The
//! [`Engine`] fans every root table out into partitions, fetches items
//! concurrently with bounded parallelism, resolves each item into a row and
//! recurses into child tables. Rows stream into a [`RowSink`].

pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod gcp;
pub mod multiplex;
pub mod registry;
pub mod schema;
pub mod sink;

pub use client::ClientMeta;
pub use config::SyncConfig;
pub use engine::{Engine, EngineConfig, RetryPolicy, SyncContext, SyncSummary};
pub use error::{NotFound, SyncError};
pub use multiplex::{DimensionMultiplexer, Multiplexer, Partition};
pub use registry::TableRegistry;
pub use sink::{JsonLinesSink, MemorySink, Row, RowSink};
