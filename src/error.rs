//! Error taxonomy
//!
//! Row-local and table-local failures are collected into the
//! [`SyncSummary`](crate::engine::SyncSummary); only [`SyncError`] aborts a
//! sync.

use crate::client::ClientMeta;
use crate::engine::SyncSummary;
use std::time::Duration;

/// Fatal sync failure. Carries the partial summary of the work that
/// completed before the sync was aborted.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("sync cancelled")]
    Cancelled { summary: Box<SyncSummary> },

    #[error("sync timed out after {timeout:?}")]
    Timeout {
        timeout: Duration,
        summary: Box<SyncSummary>,
    },

    #[error("row sink failed: {source:#}")]
    Sink {
        #[source]
        source: anyhow::Error,
        summary: Box<SyncSummary>,
    },
}

impl SyncError {
    pub fn summary(&self) -> &SyncSummary {
        match self {
            Self::Cancelled { summary } => summary,
            Self::Timeout { summary, .. } => summary,
            Self::Sink { summary, .. } => summary,
        }
    }
}

/// Resolvers return this when a dependent lookup found nothing.
///
/// List and get APIs are eventually consistent: an item returned by a list
/// call may already be gone when its detail is fetched. The engine drops
/// such items without recording an error.
#[derive(Debug, Clone, thiserror::Error)]
#[error("not found: {0}")]
pub struct NotFound(pub String);

/// Returned by the resource sender once the sync has been cancelled
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Whether `err` (or anything in its chain) is a "not found" response
pub fn is_not_found<C: ClientMeta>(client: &C, err: &anyhow::Error) -> bool {
    err.chain().any(|e| e.is::<NotFound>()) || client.is_not_found(err)
}

pub fn is_cancelled(err: &anyhow::Error) -> bool {
    err.chain().any(|e| e.is::<Cancelled>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_cancelled_detected_through_context() {
        let err: anyhow::Error = Err::<(), _>(Cancelled)
            .context("sending page")
            .unwrap_err();
        assert!(is_cancelled(&err));
        assert!(!is_cancelled(&anyhow::anyhow!("boom")));
    }
}
