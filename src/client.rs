//! Client handle
//!
//! The engine never looks up shared client state implicitly. Every resolver
//! receives the typed client handle for the partition it runs in.

use crate::multiplex::Partition;

/// Typed client handle passed to every resolver.
///
/// Implementations are cheap to clone (typically a few `Arc`s and strings)
/// and are shared read-only across all concurrent resolvers of a sync.
pub trait ClientMeta: Clone + Send + Sync + 'static {
    /// Short identifier used in logs, e.g. `gcp:my-project`
    fn id(&self) -> String;

    /// Partition this handle is pinned to. Unpinned handles return an
    /// empty partition.
    fn partition(&self) -> &Partition;

    /// Derive a handle pinned to `partition`
    fn with_partition(&self, partition: &Partition) -> anyhow::Result<Self>;

    /// Configured values for a multiplex dimension (`account`, `region`,
    /// `project`, ...)
    fn dimension_values(&self, _dimension: &str) -> Vec<String> {
        Vec::new()
    }

    /// Whether `service` is available in `partition`. Multiplexers declared
    /// for a service skip partitions where this returns false.
    fn service_enabled(&self, _partition: &Partition, _service: &str) -> bool {
        true
    }

    /// Whether `err` is an API "not found" response
    fn is_not_found(&self, _err: &anyhow::Error) -> bool {
        false
    }
}
