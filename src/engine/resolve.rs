//! Per-table resolution loop
//!
//! One call to [`resolve_table`] is one fetch invocation: the table's fetch
//! resolver produces items into a bounded channel while this loop consumes
//! them in order, turning each into a row and recursing into child tables.

use super::report::{RowError, TableError};
use super::sender::ResourceSender;
use super::SyncState;
use crate::client::ClientMeta;
use crate::error::{is_cancelled, is_not_found, Cancelled};
use crate::schema::value::convert;
use crate::schema::{Cell, Resource, Table};
use crate::sink::Row;
use anyhow::Result;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tracing::Instrument;

/// Fetch and resolve `table` for one partition (root tables) or one parent
/// row (child tables).
pub(crate) fn resolve_table<'a, C: ClientMeta>(
    state: &'a SyncState,
    table: &'a Arc<Table<C>>,
    client: &'a C,
    parent: Option<&'a Arc<Resource>>,
    depth: usize,
) -> BoxFuture<'a, ()> {
    let span = tracing::debug_span!(
        "fetch",
        table = %table.name,
        partition = %client.partition(),
        depth
    );

    async move {
        let ctx = &state.ctx;
        if ctx.is_cancelled() {
            return;
        }

        let Some(limit) = state.limits.get(depth) else {
            tracing::error!("no concurrency limit configured for depth {}", depth);
            return;
        };

        let (tx, mut rx) = mpsc::channel(state.config.channel_buffer.max(1));

        let producer = fetch_with_retry(state, table, client, parent.map(|p| p.as_ref()), limit, tx);

        let consumer = async move {
            let mut resolved = 0usize;
            while let Some(item) = rx.recv().await {
                if ctx.is_cancelled() {
                    break;
                }
                resolve_item(state, table, client, parent, depth, item).await;
                resolved += 1;
            }
            resolved
        };

        // A panic anywhere in this invocation (fetch, pre/post or column
        // resolvers) fails this table for this partition only. Child tables
        // catch their own panics, so a parent never unwinds through them.
        let joined = AssertUnwindSafe(async { tokio::join!(producer, consumer) })
            .catch_unwind()
            .await;
        let (result, resolved) = match joined {
            Ok(joined) => joined,
            Err(payload) => {
                state.report.table_error(TableError {
                    table: table.name.clone(),
                    partition: client.partition().clone(),
                    error: format!("resolver panicked: {}", panic_message(payload.as_ref())),
                });
                return;
            }
        };

        match result {
            Ok(()) => {
                tracing::debug!("fetched {} resources", resolved);
                state.report.fetch_completed(&table.name);
            }
            Err(_) if ctx.is_cancelled() => {}
            Err(err) if is_cancelled(&err) => {}
            Err(err) if parent.is_some() && is_not_found(client, &err) => {
                tracing::debug!("parent resource not found: {:#}", err);
                state.report.fetch_completed(&table.name);
            }
            Err(err) => state.report.table_error(TableError {
                table: table.name.clone(),
                partition: client.partition().clone(),
                error: format!("{:#}", err),
            }),
        }
    }
    .instrument(span)
    .boxed()
}

async fn fetch_with_retry<C: ClientMeta>(
    state: &SyncState,
    table: &Table<C>,
    client: &C,
    parent: Option<&Resource>,
    limit: &Semaphore,
    tx: mpsc::Sender<Value>,
) -> Result<()> {
    let ctx = &state.ctx;
    let policy = &state.config.retry;
    let mut attempt = 1;

    loop {
        // The permit covers one fetch attempt. Children run at the next
        // depth, so a producer blocked on a full channel never starves them,
        // and a partition waiting out its backoff frees its slot.
        let permit = tokio::select! {
            _ = ctx.cancel_token().cancelled() => return Err(Cancelled.into()),
            permit = limit.acquire() => permit.map_err(|_| Cancelled)?,
        };

        let sender = ResourceSender::new(tx.clone(), ctx.cancel_token().clone());
        let result = tokio::select! {
            _ = ctx.cancel_token().cancelled() => return Err(Cancelled.into()),
            result = table.resolver.fetch(ctx, client, parent, sender.clone()) => result,
        };
        drop(permit);

        let err = match result {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };

        if attempt >= policy.max_attempts
            || sender.sent() > 0
            || is_cancelled(&err)
            || is_not_found(client, &err)
        {
            return Err(err);
        }

        let delay = policy.backoff(attempt);
        tracing::warn!(
            "fetch attempt {}/{} failed, retrying in {:?}: {:#}",
            attempt,
            policy.max_attempts,
            delay,
            err
        );

        tokio::select! {
            _ = ctx.cancel_token().cancelled() => return Err(Cancelled.into()),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg
    } else {
        "unknown panic"
    }
}

/// Turn one raw item into a row, emit it and resolve its children
async fn resolve_item<C: ClientMeta>(
    state: &SyncState,
    table: &Arc<Table<C>>,
    client: &C,
    parent: Option<&Arc<Resource>>,
    depth: usize,
    item: Value,
) {
    let ctx = &state.ctx;
    let row_error = |column: Option<&str>, error: String| {
        state.report.row_error(RowError {
            table: table.name.clone(),
            partition: client.partition().clone(),
            column: column.map(str::to_string),
            error,
        })
    };

    let mut resource = Resource::new(
        ctx.arena().allocate(),
        &table.name,
        parent.map(|p| p.id()),
        item,
    );

    if let Some(pre) = &table.pre_resource_resolver {
        if let Err(err) = pre.resolve(ctx, client, &mut resource).await {
            if ctx.is_cancelled() || is_cancelled(&err) {
                return;
            }
            if is_not_found(client, &err) {
                tracing::debug!("dropping item, detail not found: {:#}", err);
                state.report.item_dropped();
                return;
            }
            row_error(None, format!("pre-resource resolver: {:#}", err));
            state.report.row_rejected();
            return;
        }
    }

    for column in &table.columns {
        if ctx.is_cancelled() {
            return;
        }

        let cell = match column.resolve(ctx, client, &resource).await {
            Ok(value) => match convert(value, column.column_type) {
                Ok(cell) => cell,
                Err(err) => {
                    row_error(Some(&column.name), err.to_string());
                    Cell::Null
                }
            },
            Err(err) if is_cancelled(&err) => return,
            Err(err) => {
                row_error(Some(&column.name), format!("{:#}", err));
                Cell::Null
            }
        };
        resource.set(&column.name, cell);
    }

    if let Some(post) = &table.post_resource_resolver {
        if let Err(err) = post.resolve(ctx, client, &mut resource).await {
            if ctx.is_cancelled() || is_cancelled(&err) {
                return;
            }
            row_error(None, format!("post-resource resolver: {:#}", err));
        }
    }

    let missing: Vec<&str> = table
        .columns
        .iter()
        .filter(|c| c.is_required() && resource.get(&c.name).map_or(true, Cell::is_null))
        .map(|c| c.name.as_str())
        .collect();
    if !missing.is_empty() {
        row_error(None, format!("required columns are null: {}", missing.join(", ")));
        state.report.row_rejected();
        return;
    }

    let row = Row {
        table: table.name.clone(),
        partition: client.partition().clone(),
        id: resource.row_id(),
        parent_id: parent.map(|p| p.row_id()),
        sync_time: ctx.sync_time(),
        values: table
            .columns
            .iter()
            .map(|c| {
                let cell = resource.get(&c.name).cloned().unwrap_or(Cell::Null);
                (c.name.clone(), cell)
            })
            .collect(),
    };

    if ctx.is_cancelled() || state.rows.send(row).await.is_err() {
        return;
    }

    if table.relations.is_empty() {
        return;
    }

    let resource = ctx.arena().insert(resource);
    let children = table
        .relations
        .iter()
        .map(|child| resolve_table(state, child, client, Some(&resource), depth + 1));
    join_all(children).await;
    ctx.arena().remove(resource.id());
}
