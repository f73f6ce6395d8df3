//! Row sinks
//!
//! The engine funnels every finished row through a single writer task, so a
//! sink never sees concurrent writes.

use crate::multiplex::Partition;
use crate::schema::Cell;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

/// A fully resolved row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Row {
    pub table: String,
    pub partition: Partition,
    #[serde(rename = "_cq_id")]
    pub id: Uuid,
    #[serde(rename = "_cq_parent_id")]
    pub parent_id: Option<Uuid>,
    #[serde(rename = "_cq_sync_time")]
    pub sync_time: DateTime<Utc>,
    /// One value per declared column, in declaration order
    #[serde(serialize_with = "serialize_values")]
    pub values: Vec<(String, Cell)>,
}

impl Row {
    pub fn get(&self, column: &str) -> Option<&Cell> {
        self.values
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, cell)| cell)
    }
}

fn serialize_values<S: Serializer>(values: &[(String, Cell)], serializer: S) -> Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(Some(values.len()))?;
    for (name, cell) in values {
        map.serialize_entry(name, cell)?;
    }
    map.end()
}

/// Consumer of finished rows
#[async_trait]
pub trait RowSink: Send {
    async fn write(&mut self, row: Row) -> Result<()>;

    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Collects rows in memory. Clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    rows: Arc<Mutex<Vec<Row>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> Vec<Row> {
        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn rows_for(&self, table: &str) -> Vec<Row> {
        self.rows()
            .into_iter()
            .filter(|r| r.table == table)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RowSink for MemorySink {
    async fn write(&mut self, row: Row) -> Result<()> {
        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(row);
        Ok(())
    }
}

/// Writes one JSON object per line
pub struct JsonLinesSink<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> RowSink for JsonLinesSink<W> {
    async fn write(&mut self, row: Row) -> Result<()> {
        let mut line = serde_json::to_vec(&row).context("Failed to serialize row")?;
        line.push(b'\n');
        self.writer
            .write_all(&line)
            .await
            .context("Failed to write row")?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.writer.flush().await.context("Failed to flush rows")
    }
}
