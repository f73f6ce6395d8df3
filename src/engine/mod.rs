//! Resolution engine
//!
//! Walks a forest of tables, expands every root table into partitions via
//! its multiplexer, runs one fetch invocation per partition and recurses
//! into child tables for every resolved row.
//!
//! # Failure classes
//!
//! - Row-local: a column or pre/post resolver failed. Recorded, traversal
//!   continues.
//! - Table-local: a fetch resolver failed. Recorded for that partition,
//!   siblings continue.
//! - Fatal: cancellation, timeout or sink failure. All in-flight work is
//!   dropped and [`SyncError`] is returned.
//!
//! # Example
//!
//! ```ignore
//! let engine = Engine::new(EngineConfig::default());
//! let sink = MemorySink::new();
//! let summary = engine.sync(&client, registry.roots(), sink.clone()).await?;
//! println!("{}", summary);
//! ```

mod context;
mod report;
mod resolve;
mod retry;
mod sender;

pub use context::SyncContext;
pub use report::{RowError, SyncSummary, TableError};
pub use retry::RetryPolicy;
pub use sender::ResourceSender;

use crate::client::ClientMeta;
use crate::error::SyncError;
use crate::multiplex::Partition;
use crate::schema::Table;
use crate::sink::{Row, RowSink};
use report::Report;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum in-flight fetch invocations per relation depth
    pub concurrency: usize,
    /// Capacity of each fetch invocation's item channel
    pub channel_buffer: usize,
    /// Capacity of the channel feeding the sink writer
    pub sink_buffer: usize,
    /// Abort the sync once this much time has passed
    pub timeout: Option<Duration>,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            channel_buffer: 64,
            sink_buffer: 1024,
            timeout: None,
            retry: RetryPolicy::default(),
        }
    }
}

/// Shared by every worker of one sync
pub(crate) struct SyncState {
    pub(crate) ctx: SyncContext,
    pub(crate) report: Arc<Report>,
    /// One semaphore per relation depth
    pub(crate) limits: Vec<Semaphore>,
    pub(crate) rows: mpsc::Sender<Row>,
    pub(crate) config: EngineConfig,
}

enum Fatal {
    Timeout(Duration),
    Sink(anyhow::Error),
}

/// First fatal error wins
#[derive(Default)]
struct FatalSlot(Mutex<Option<Fatal>>);

impl FatalSlot {
    fn set(&self, fatal: Fatal) {
        let mut slot = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(fatal);
        }
    }

    fn take(&self) -> Option<Fatal> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Engine {
    config: EngineConfig,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Sync `tables` and stream their rows into `sink`
    pub async fn sync<C, S>(
        &self,
        client: &C,
        tables: &[Arc<Table<C>>],
        sink: S,
    ) -> Result<SyncSummary, SyncError>
    where
        C: ClientMeta,
        S: RowSink + 'static,
    {
        self.sync_with_cancel(client, tables, sink, CancellationToken::new())
            .await
    }

    /// Like [`Engine::sync`], stopping early once `cancel` fires
    pub async fn sync_with_cancel<C, S>(
        &self,
        client: &C,
        tables: &[Arc<Table<C>>],
        sink: S,
        cancel: CancellationToken,
    ) -> Result<SyncSummary, SyncError>
    where
        C: ClientMeta,
        S: RowSink + 'static,
    {
        let started = Instant::now();
        // Internal fatal errors cancel this sync without touching the
        // caller's token.
        let token = cancel.child_token();
        let report = Arc::new(Report::default());
        let fatal = Arc::new(FatalSlot::default());

        let (rows_tx, rows_rx) = mpsc::channel(self.config.sink_buffer.max(1));
        let writer = tokio::spawn(write_rows(
            sink,
            rows_rx,
            Arc::clone(&report),
            Arc::clone(&fatal),
            token.clone(),
        ));

        let max_depth = tables.iter().map(|t| relation_depth(t)).max().unwrap_or(0);
        let concurrency = self.config.concurrency.max(1);
        let state = Arc::new(SyncState {
            ctx: SyncContext::with_cancel(token.clone()),
            report: Arc::clone(&report),
            limits: (0..=max_depth).map(|_| Semaphore::new(concurrency)).collect(),
            rows: rows_tx,
            config: self.config.clone(),
        });

        tracing::info!(
            "starting sync of {} tables for {} (concurrency {})",
            tables.len(),
            client.id(),
            concurrency
        );

        let mut tasks = JoinSet::new();
        for table in tables {
            let partitions = match &table.multiplex {
                Some(multiplexer) => multiplexer.partitions(client),
                None => vec![Partition::default()],
            };
            if partitions.is_empty() {
                tracing::debug!("no partitions for {}, skipping", table.name);
                continue;
            }

            for partition in partitions {
                let pinned = if table.multiplex.is_none() {
                    client.clone()
                } else {
                    match client.with_partition(&partition) {
                        Ok(pinned) => pinned,
                        Err(err) => {
                            report.table_error(TableError {
                                table: table.name.clone(),
                                partition,
                                error: format!("{:#}", err),
                            });
                            continue;
                        }
                    }
                };

                let state = Arc::clone(&state);
                let table = Arc::clone(table);
                tasks.spawn(async move {
                    resolve::resolve_table(&state, &table, &pinned, None, 0).await;
                });
            }
        }

        let deadline = async {
            match self.config.timeout {
                Some(timeout) => {
                    tokio::time::sleep(timeout).await;
                    timeout
                }
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = drain(&mut tasks) => {}
            _ = token.cancelled() => {}
            timeout = deadline => {
                tracing::error!("sync timed out after {:?}", timeout);
                fatal.set(Fatal::Timeout(timeout));
                token.cancel();
            }
        }

        if token.is_cancelled() {
            tasks.shutdown().await;
        }

        // Dropping the last state handle closes the row channel and lets
        // the writer finish.
        drop(state);
        if let Err(err) = writer.await {
            fatal.set(Fatal::Sink(anyhow::anyhow!("row writer failed: {}", err)));
        }

        let summary = report.summary(started.elapsed());
        tracing::info!("sync finished: {}", summary);

        match fatal.take() {
            Some(Fatal::Sink(source)) => Err(SyncError::Sink {
                source,
                summary: Box::new(summary),
            }),
            Some(Fatal::Timeout(timeout)) => Err(SyncError::Timeout {
                timeout,
                summary: Box::new(summary),
            }),
            None if token.is_cancelled() => Err(SyncError::Cancelled {
                summary: Box::new(summary),
            }),
            None => Ok(summary),
        }
    }
}

async fn drain(tasks: &mut JoinSet<()>) {
    while let Some(joined) = tasks.join_next().await {
        if let Err(err) = joined {
            if !err.is_cancelled() {
                tracing::error!("sync task failed: {}", err);
            }
        }
    }
}

/// Single writer: serializes all sink writes
async fn write_rows<S: RowSink>(
    mut sink: S,
    mut rows: mpsc::Receiver<Row>,
    report: Arc<Report>,
    fatal: Arc<FatalSlot>,
    cancel: CancellationToken,
) {
    while let Some(row) = rows.recv().await {
        if let Err(err) = sink.write(row).await {
            tracing::error!("row sink failed: {:#}", err);
            fatal.set(Fatal::Sink(err));
            cancel.cancel();
            return;
        }
        report.row_emitted();
    }

    if let Err(err) = sink.flush().await {
        tracing::error!("row sink flush failed: {:#}", err);
        fatal.set(Fatal::Sink(err));
    }
}

fn relation_depth<C: ClientMeta>(table: &Table<C>) -> usize {
    table
        .relations
        .iter()
        .map(|child| 1 + relation_depth(child))
        .max()
        .unwrap_or(0)
}
