use crate::schema::{Resource, ResourceArena};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Per-sync context handed to every resolver.
///
/// Carries the sync-scoped cancellation token, the resource arena used for
/// parent lookups and the timestamp stamped on every row.
#[derive(Debug, Clone)]
pub struct SyncContext {
    cancel: CancellationToken,
    arena: Arc<ResourceArena>,
    sync_time: DateTime<Utc>,
}

impl SyncContext {
    pub fn new() -> Self {
        Self::with_cancel(CancellationToken::new())
    }

    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            arena: Arc::new(ResourceArena::new()),
            sync_time: Utc::now(),
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn arena(&self) -> &ResourceArena {
        &self.arena
    }

    /// Parent of `resource`, if it has one and it is still being traversed
    pub fn parent_of(&self, resource: &Resource) -> Option<Arc<Resource>> {
        self.arena.get(resource.parent_id()?)
    }

    pub fn sync_time(&self) -> DateTime<Utc> {
        self.sync_time
    }
}

impl Default for SyncContext {
    fn default() -> Self {
        Self::new()
    }
}
