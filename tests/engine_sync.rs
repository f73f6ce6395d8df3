//! Integration tests for the sync engine
//!
//! A scripted client and scripted resolvers drive the engine through
//! multiplexing, pagination, relations, error classification and
//! cancellation.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tablesync::engine::ResourceSender;
use tablesync::multiplex::{ACCOUNT, REGION};
use tablesync::schema::{
    Cell, Column, ColumnResolver, ColumnType, ParentColumnResolver, PartitionResolver,
    PostResourceResolver, PreResourceResolver, Resource, Table, TableResolver,
};
use tablesync::{
    ClientMeta, DimensionMultiplexer, Engine, EngineConfig, MemorySink, NotFound, Partition,
    RetryPolicy, Row, RowSink, SyncContext, SyncError,
};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Default)]
struct MockClient {
    accounts: Vec<String>,
    regions: Vec<String>,
    /// (region, service) pairs where the service is disabled
    disabled: Vec<(String, String)>,
    /// Pinning to this region fails
    broken_region: Option<String>,
    partition: Partition,
}

impl MockClient {
    fn with_dims(accounts: &[&str], regions: &[&str]) -> Self {
        Self {
            accounts: accounts.iter().map(|s| s.to_string()).collect(),
            regions: regions.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }
}

impl ClientMeta for MockClient {
    fn id(&self) -> String {
        format!("mock:{}", self.partition)
    }

    fn partition(&self) -> &Partition {
        &self.partition
    }

    fn with_partition(&self, partition: &Partition) -> Result<Self> {
        if let Some(broken) = &self.broken_region {
            if partition.get(REGION) == Some(broken.as_str()) {
                anyhow::bail!("region {} is not enabled for this account", broken);
            }
        }
        let mut pinned = self.clone();
        pinned.partition = partition.clone();
        Ok(pinned)
    }

    fn dimension_values(&self, dimension: &str) -> Vec<String> {
        match dimension {
            ACCOUNT => self.accounts.clone(),
            REGION => self.regions.clone(),
            _ => Vec::new(),
        }
    }

    fn service_enabled(&self, partition: &Partition, service: &str) -> bool {
        !self
            .disabled
            .iter()
            .any(|(region, s)| partition.get(REGION) == Some(region.as_str()) && s == service)
    }
}

fn id_of(item: &Value) -> String {
    match &item["id"] {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Serves `pages` behind a continuation token, like a list API
struct TokenPages {
    pages: Vec<Vec<Value>>,
    requests: Arc<AtomicUsize>,
}

impl TokenPages {
    fn new(pages: Vec<Vec<Value>>) -> Self {
        Self {
            pages,
            requests: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl TableResolver<MockClient> for TokenPages {
    async fn fetch(
        &self,
        _ctx: &SyncContext,
        _client: &MockClient,
        _parent: Option<&Resource>,
        res: ResourceSender,
    ) -> Result<()> {
        let mut token = String::new();
        loop {
            let index: usize = if token.is_empty() {
                0
            } else {
                token.trim_start_matches("page-").parse()?
            };
            self.requests.fetch_add(1, Ordering::SeqCst);

            let next = if index + 1 < self.pages.len() {
                format!("page-{}", index + 1)
            } else {
                String::new()
            };
            res.send_all(self.pages[index].clone()).await?;
            tokio::task::yield_now().await;

            if next.is_empty() {
                break;
            }
            token = next;
        }
        Ok(())
    }
}

/// One item per partition
struct PerPartition;

#[async_trait]
impl TableResolver<MockClient> for PerPartition {
    async fn fetch(
        &self,
        _ctx: &SyncContext,
        client: &MockClient,
        _parent: Option<&Resource>,
        res: ResourceSender,
    ) -> Result<()> {
        res.send(json!({ "id": client.partition().to_string() })).await?;
        Ok(())
    }
}

/// `count` items per parent row, ids derived from the parent's id
struct Children {
    count: usize,
}

#[async_trait]
impl TableResolver<MockClient> for Children {
    async fn fetch(
        &self,
        _ctx: &SyncContext,
        _client: &MockClient,
        parent: Option<&Resource>,
        res: ResourceSender,
    ) -> Result<()> {
        let parent_id = parent.map(|p| id_of(&p.item)).unwrap_or_default();
        for i in 0..self.count {
            res.send(json!({ "id": format!("{}/{}", parent_id, i) })).await?;
        }
        Ok(())
    }
}

/// Fails with a plain error
struct Denied;

#[async_trait]
impl TableResolver<MockClient> for Denied {
    async fn fetch(
        &self,
        _ctx: &SyncContext,
        _client: &MockClient,
        _parent: Option<&Resource>,
        _res: ResourceSender,
    ) -> Result<()> {
        anyhow::bail!("AccessDenied: not authorized to perform this operation")
    }
}

/// Fails with "not found"
struct Gone;

#[async_trait]
impl TableResolver<MockClient> for Gone {
    async fn fetch(
        &self,
        _ctx: &SyncContext,
        _client: &MockClient,
        _parent: Option<&Resource>,
        _res: ResourceSender,
    ) -> Result<()> {
        Err(NotFound("parent was deleted".to_string()).into())
    }
}

/// Fails the first `failures` calls, then emits one item
struct Flaky {
    failures: usize,
    emit_before_failing: bool,
    calls: Arc<AtomicUsize>,
}

impl Flaky {
    fn new(failures: usize, emit_before_failing: bool) -> Self {
        Self {
            failures,
            emit_before_failing,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl TableResolver<MockClient> for Flaky {
    async fn fetch(
        &self,
        _ctx: &SyncContext,
        _client: &MockClient,
        _parent: Option<&Resource>,
        res: ResourceSender,
    ) -> Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            if self.emit_before_failing {
                res.send(json!({ "id": format!("partial-{}", call) })).await?;
            }
            anyhow::bail!("503 service unavailable");
        }
        res.send(json!({ "id": "ok" })).await?;
        Ok(())
    }
}

/// Emits forever
struct Endless;

#[async_trait]
impl TableResolver<MockClient> for Endless {
    async fn fetch(
        &self,
        _ctx: &SyncContext,
        _client: &MockClient,
        _parent: Option<&Resource>,
        res: ResourceSender,
    ) -> Result<()> {
        let mut n = 0u64;
        loop {
            res.send(json!({ "id": n })).await?;
            n += 1;
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

/// Tracks how many fetches run at once
struct Gauge {
    current: Arc<AtomicUsize>,
    max: Arc<AtomicUsize>,
}

#[async_trait]
impl TableResolver<MockClient> for Gauge {
    async fn fetch(
        &self,
        _ctx: &SyncContext,
        client: &MockClient,
        _parent: Option<&Resource>,
        res: ResourceSender,
    ) -> Result<()> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        res.send(json!({ "id": client.partition().to_string() })).await?;
        Ok(())
    }
}

struct Panics;

#[async_trait]
impl TableResolver<MockClient> for Panics {
    async fn fetch(
        &self,
        _ctx: &SyncContext,
        _client: &MockClient,
        _parent: Option<&Resource>,
        _res: ResourceSender,
    ) -> Result<()> {
        panic!("resolver bug")
    }
}

/// Column resolver with a bug
struct PanickingColumn;

#[async_trait]
impl ColumnResolver<MockClient> for PanickingColumn {
    async fn resolve(
        &self,
        _ctx: &SyncContext,
        _client: &MockClient,
        _resource: &Resource,
        _column: &Column<MockClient>,
    ) -> Result<Value> {
        panic!("column bug")
    }
}

/// Fails the first call of every partition, logging each outcome
#[derive(Default)]
struct FailsFirstPerPartition {
    seen: Mutex<HashSet<String>>,
    events: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl TableResolver<MockClient> for FailsFirstPerPartition {
    async fn fetch(
        &self,
        _ctx: &SyncContext,
        client: &MockClient,
        _parent: Option<&Resource>,
        res: ResourceSender,
    ) -> Result<()> {
        let partition = client.partition().to_string();
        let first = self.seen.lock().unwrap().insert(partition.clone());
        if first {
            self.events.lock().unwrap().push(format!("fail {}", partition));
            anyhow::bail!("503 service unavailable");
        }
        self.events.lock().unwrap().push(format!("ok {}", partition));
        res.send(json!({ "id": partition })).await?;
        Ok(())
    }
}

/// Detail lookup that reports odd ids as deleted
struct DropOdd;

#[async_trait]
impl PreResourceResolver<MockClient> for DropOdd {
    async fn resolve(&self, _ctx: &SyncContext, _client: &MockClient, resource: &mut Resource) -> Result<()> {
        let id = resource.item["id"].as_i64().unwrap_or_default();
        if id % 2 == 1 {
            return Err(NotFound(format!("item {}", id)).into());
        }
        resource.item["detail"] = json!(format!("detail of {}", id));
        Ok(())
    }
}

struct BrokenColumn;

#[async_trait]
impl ColumnResolver<MockClient> for BrokenColumn {
    async fn resolve(
        &self,
        _ctx: &SyncContext,
        _client: &MockClient,
        _resource: &Resource,
        _column: &Column<MockClient>,
    ) -> Result<Value> {
        anyhow::bail!("tag lookup failed")
    }
}

/// Derives `label` from the already-resolved `id`
struct Label;

#[async_trait]
impl PostResourceResolver<MockClient> for Label {
    async fn resolve(&self, _ctx: &SyncContext, _client: &MockClient, resource: &mut Resource) -> Result<()> {
        let id = resource
            .get("id")
            .and_then(Cell::as_str)
            .unwrap_or_default()
            .to_uppercase();
        resource.set("label", Cell::String(id));
        Ok(())
    }
}

struct FailingSink;

#[async_trait]
impl RowSink for FailingSink {
    async fn write(&mut self, _row: Row) -> Result<()> {
        anyhow::bail!("disk full")
    }
}

fn table<R: TableResolver<MockClient> + 'static>(name: &str, resolver: R) -> Table<MockClient> {
    Table::new(name, resolver).column(Column::new("id", ColumnType::String).primary_key())
}

fn ids(rows: &[Row]) -> Vec<String> {
    rows.iter()
        .map(|r| r.get("id").and_then(Cell::as_str).unwrap_or_default().to_string())
        .collect()
}

mod traversal {
    use super::*;

    #[tokio::test]
    async fn test_table_without_multiplexer_fetches_once() {
        let resolver = TokenPages::new(vec![vec![json!({"id": "a"})]]);
        let requests = Arc::clone(&resolver.requests);
        let tables = vec![Arc::new(table("items", resolver))];
        let sink = MemorySink::new();

        let summary = Engine::default()
            .sync(&MockClient::with_dims(&["a1", "a2"], &["r1"]), &tables, sink.clone())
            .await
            .unwrap();

        assert_eq!(requests.load(Ordering::SeqCst), 1);
        assert_eq!(summary.fetches_completed, 1);
        assert_eq!(summary.tables_synced, 1);
        assert_eq!(sink.rows()[0].partition, Partition::default());
    }

    #[tokio::test]
    async fn test_three_pages_emitted_once_in_order() {
        let resolver = TokenPages::new(vec![
            vec![json!({"id": "1"}), json!({"id": "2"})],
            vec![json!({"id": "3"})],
            vec![json!({"id": "4"}), json!({"id": "5"})],
        ]);
        let requests = Arc::clone(&resolver.requests);
        let tables = vec![Arc::new(table("items", resolver))];
        let sink = MemorySink::new();

        let summary = Engine::default()
            .sync(&MockClient::default(), &tables, sink.clone())
            .await
            .unwrap();

        assert_eq!(requests.load(Ordering::SeqCst), 3);
        assert_eq!(ids(&sink.rows()), vec!["1", "2", "3", "4", "5"]);
        assert_eq!(summary.rows_emitted, 5);
        assert!(!summary.has_errors());
    }

    #[tokio::test]
    async fn test_order_preserved_with_tiny_channel() {
        let pages = (0..20)
            .map(|p| (0..5).map(|i| json!({"id": format!("{:03}", p * 5 + i)})).collect())
            .collect();
        let tables = vec![Arc::new(table("items", TokenPages::new(pages)))];
        let sink = MemorySink::new();
        let engine = Engine::new(EngineConfig {
            channel_buffer: 1,
            ..Default::default()
        });

        engine
            .sync(&MockClient::default(), &tables, sink.clone())
            .await
            .unwrap();

        let got = ids(&sink.rows());
        let mut sorted = got.clone();
        sorted.sort();
        assert_eq!(got.len(), 100);
        assert_eq!(got, sorted);
    }

    #[tokio::test]
    async fn test_children_link_to_parent_rows() {
        let root = table("brokers", TokenPages::new(vec![vec![json!({"id": "b1"}), json!({"id": "b2"})]]))
            .relation(
                table("broker_users", Children { count: 3 })
                    .column(Column::new("broker_id", ColumnType::String).resolver(ParentColumnResolver::new("id"))),
            );
        let tables = vec![Arc::new(root)];
        let sink = MemorySink::new();

        let summary = Engine::default()
            .sync(&MockClient::default(), &tables, sink.clone())
            .await
            .unwrap();

        let parents = sink.rows_for("brokers");
        let children = sink.rows_for("broker_users");
        assert_eq!(parents.len(), 2);
        assert_eq!(children.len(), 6);
        assert_eq!(summary.tables_synced, 2);
        assert_eq!(summary.fetches_completed, 3);

        for child in &children {
            let broker_id = child.get("broker_id").and_then(Cell::as_str).unwrap();
            let parent = parents
                .iter()
                .find(|p| p.get("id").and_then(Cell::as_str) == Some(broker_id))
                .unwrap();
            assert_eq!(child.parent_id, Some(parent.id));
            assert!(child.get("id").and_then(Cell::as_str).unwrap().starts_with(broker_id));
        }

        // every row of one sync shares the sync time
        assert!(sink.rows().iter().all(|r| r.sync_time == parents[0].sync_time));
    }

    #[tokio::test]
    async fn test_deep_relations_do_not_deadlock_at_concurrency_one() {
        let root = table("a", TokenPages::new(vec![(0..5).map(|i| json!({"id": i})).collect()])).relation(
            table("b", Children { count: 3 })
                .relation(table("c", Children { count: 2 }))
                .relation(table("d", Children { count: 1 })),
        );
        let tables = vec![Arc::new(root)];
        let sink = MemorySink::new();
        let engine = Engine::new(EngineConfig {
            concurrency: 1,
            channel_buffer: 1,
            sink_buffer: 1,
            ..Default::default()
        });

        let summary = tokio::time::timeout(
            Duration::from_secs(10),
            engine.sync(&MockClient::default(), &tables, sink.clone()),
        )
        .await
        .expect("sync should not deadlock")
        .unwrap();

        assert_eq!(sink.rows_for("a").len(), 5);
        assert_eq!(sink.rows_for("b").len(), 15);
        assert_eq!(sink.rows_for("c").len(), 30);
        assert_eq!(sink.rows_for("d").len(), 15);
        assert_eq!(summary.rows_emitted, 65);
    }

    #[tokio::test]
    async fn test_post_resource_resolver_fills_columns() {
        let t = table("items", TokenPages::new(vec![vec![json!({"id": "abc"})]]))
            .column(Column::new("label", ColumnType::String))
            .post_resource_resolver(Label);
        let sink = MemorySink::new();

        Engine::default()
            .sync(&MockClient::default(), &[Arc::new(t)], sink.clone())
            .await
            .unwrap();

        let row = &sink.rows()[0];
        assert_eq!(row.get("label"), Some(&Cell::String("ABC".to_string())));
        assert_eq!(row.values.len(), 2);
    }
}

mod multiplexing {
    use super::*;

    fn partitioned(name: &str) -> Table<MockClient> {
        table(name, PerPartition)
            .column(Column::new("account_id", ColumnType::String).resolver(PartitionResolver::new(ACCOUNT)))
            .column(Column::new("region", ColumnType::String).resolver(PartitionResolver::new(REGION)))
            .multiplex(DimensionMultiplexer::account_region())
    }

    #[tokio::test]
    async fn test_cross_product_is_deduplicated() {
        let client = MockClient::with_dims(&["a1", "a2"], &["r1", "r2", "r3", "r1"]);
        let sink = MemorySink::new();

        let summary = Engine::default()
            .sync(&client, &[Arc::new(partitioned("instances"))], sink.clone())
            .await
            .unwrap();

        let rows = sink.rows();
        assert_eq!(rows.len(), 6);
        assert_eq!(summary.fetches_completed, 6);

        let mut partitions: Vec<String> = rows.iter().map(|r| r.partition.to_string()).collect();
        partitions.sort();
        partitions.dedup();
        assert_eq!(partitions.len(), 6);

        for row in &rows {
            assert_eq!(row.get("account_id").and_then(Cell::as_str), row.partition.get(ACCOUNT));
            assert_eq!(row.get("region").and_then(Cell::as_str), row.partition.get(REGION));
        }
    }

    #[tokio::test]
    async fn test_disabled_service_partitions_are_skipped() {
        let mut client = MockClient::with_dims(&["a1", "a2"], &["r1", "r2", "r3"]);
        client.disabled.push(("r2".to_string(), "mq".to_string()));
        let t = table("brokers", PerPartition).multiplex(DimensionMultiplexer::account_region().for_service("mq"));
        let sink = MemorySink::new();

        Engine::default()
            .sync(&client, &[Arc::new(t)], sink.clone())
            .await
            .unwrap();

        let rows = sink.rows();
        assert_eq!(rows.len(), 4);
        assert!(rows.iter().all(|r| r.partition.get(REGION) != Some("r2")));
    }

    #[tokio::test]
    async fn test_no_partitions_skips_table() {
        let client = MockClient::with_dims(&[], &["r1"]);
        let sink = MemorySink::new();

        let summary = Engine::default()
            .sync(&client, &[Arc::new(partitioned("instances"))], sink.clone())
            .await
            .unwrap();

        assert!(sink.is_empty());
        assert_eq!(summary.fetches_completed, 0);
        assert!(!summary.has_errors());
    }

    #[tokio::test]
    async fn test_partition_pin_failure_is_table_error() {
        let mut client = MockClient::with_dims(&["a1", "a2"], &["r1", "r2", "r3"]);
        client.broken_region = Some("r2".to_string());
        let sink = MemorySink::new();

        let summary = Engine::default()
            .sync(&client, &[Arc::new(partitioned("instances"))], sink.clone())
            .await
            .unwrap();

        assert_eq!(sink.len(), 4);
        assert_eq!(summary.table_errors.len(), 2);
        assert!(summary
            .table_errors
            .iter()
            .all(|e| e.partition.get(REGION) == Some("r2") && e.table == "instances"));
    }

    #[tokio::test]
    async fn test_concurrency_limit_is_respected() {
        let max = Arc::new(AtomicUsize::new(0));
        let gauge = Gauge {
            current: Arc::new(AtomicUsize::new(0)),
            max: Arc::clone(&max),
        };
        let client = MockClient::with_dims(&["a1", "a2"], &["r1", "r2", "r3", "r4"]);
        let t = table("hosts", gauge).multiplex(DimensionMultiplexer::account_region());
        let sink = MemorySink::new();
        let engine = Engine::new(EngineConfig {
            concurrency: 2,
            ..Default::default()
        });

        engine.sync(&client, &[Arc::new(t)], sink.clone()).await.unwrap();

        assert_eq!(sink.len(), 8);
        assert!(max.load(Ordering::SeqCst) <= 2);
        assert!(max.load(Ordering::SeqCst) >= 1);
    }
}

mod errors {
    use super::*;

    #[tokio::test]
    async fn test_column_error_keeps_other_columns_and_children() {
        let root = table("brokers", TokenPages::new(vec![vec![json!({"id": "b1", "name": "primary"})]]))
            .column(Column::new("tags", ColumnType::Json).resolver(BrokenColumn))
            .column(Column::new("name", ColumnType::String))
            .relation(table("broker_users", Children { count: 2 }));
        let sink = MemorySink::new();

        let summary = Engine::default()
            .sync(&MockClient::default(), &[Arc::new(root)], sink.clone())
            .await
            .unwrap();

        let parents = sink.rows_for("brokers");
        assert_eq!(parents.len(), 1);
        assert_eq!(parents[0].get("tags"), Some(&Cell::Null));
        assert_eq!(parents[0].get("name"), Some(&Cell::String("primary".to_string())));
        assert_eq!(sink.rows_for("broker_users").len(), 2);

        assert_eq!(summary.row_errors.len(), 1);
        assert_eq!(summary.row_errors[0].column.as_deref(), Some("tags"));
        assert!(summary.table_errors.is_empty());
    }

    #[tokio::test]
    async fn test_conversion_error_is_row_local() {
        let t = table("items", TokenPages::new(vec![vec![json!({"id": "x", "count": "many"})]]))
            .column(Column::new("count", ColumnType::Int));
        let sink = MemorySink::new();

        let summary = Engine::default()
            .sync(&MockClient::default(), &[Arc::new(t)], sink.clone())
            .await
            .unwrap();

        assert_eq!(sink.rows()[0].get("count"), Some(&Cell::Null));
        assert_eq!(summary.row_errors[0].column.as_deref(), Some("count"));
    }

    #[tokio::test]
    async fn test_pre_resolver_not_found_drops_item_silently() {
        let t = table("instances", TokenPages::new(vec![(1..=4).map(|i| json!({"id": i})).collect()]))
            .column(Column::new("detail", ColumnType::String))
            .pre_resource_resolver(DropOdd)
            .relation(table("volumes", Children { count: 1 }));
        let sink = MemorySink::new();

        let summary = Engine::default()
            .sync(&MockClient::default(), &[Arc::new(t)], sink.clone())
            .await
            .unwrap();

        let rows = sink.rows_for("instances");
        assert_eq!(ids(&rows), vec!["2", "4"]);
        assert_eq!(rows[0].get("detail"), Some(&Cell::String("detail of 2".to_string())));
        assert_eq!(sink.rows_for("volumes").len(), 2);
        assert_eq!(summary.items_dropped, 2);
        assert!(!summary.has_errors());
    }

    #[tokio::test]
    async fn test_not_found_benign_for_children_only() {
        let root = table("brokers", TokenPages::new(vec![vec![json!({"id": "b1"})]]))
            .relation(table("broker_users", Gone));
        let sink = MemorySink::new();

        let summary = Engine::default()
            .sync(&MockClient::default(), &[Arc::new(root)], sink.clone())
            .await
            .unwrap();
        assert_eq!(sink.len(), 1);
        assert!(!summary.has_errors());

        let summary = Engine::default()
            .sync(&MockClient::default(), &[Arc::new(table("brokers", Gone))], MemorySink::new())
            .await
            .unwrap();
        assert_eq!(summary.table_errors.len(), 1);
    }

    #[tokio::test]
    async fn test_null_primary_key_rejects_row_and_children() {
        let root = table(
            "instances",
            TokenPages::new(vec![vec![json!({"id": "i-1"}), json!({"name": "no id"}), json!({"id": "i-3"})]]),
        )
        .column(Column::new("name", ColumnType::String))
        .relation(table("volumes", Children { count: 2 }));
        let sink = MemorySink::new();

        let summary = Engine::default()
            .sync(&MockClient::default(), &[Arc::new(root)], sink.clone())
            .await
            .unwrap();

        assert_eq!(ids(&sink.rows_for("instances")), vec!["i-1", "i-3"]);
        assert_eq!(sink.rows_for("volumes").len(), 4);
        assert!(sink
            .rows()
            .iter()
            .all(|r| r.get("id").is_some_and(|c| !c.is_null())));
        assert_eq!(summary.rows_rejected, 1);
        assert_eq!(summary.row_errors.len(), 1);
        assert!(summary.row_errors[0].error.contains("id"));
    }

    #[tokio::test]
    async fn test_table_error_does_not_stop_siblings() {
        let tables = vec![
            Arc::new(table("denied", Denied)),
            Arc::new(table("allowed", TokenPages::new(vec![vec![json!({"id": "a"})]]))),
        ];
        let sink = MemorySink::new();

        let summary = Engine::default()
            .sync(&MockClient::default(), &tables, sink.clone())
            .await
            .unwrap();

        assert_eq!(ids(&sink.rows()), vec!["a"]);
        assert_eq!(summary.table_errors.len(), 1);
        assert_eq!(summary.table_errors[0].table, "denied");
        assert!(summary.table_errors[0].error.contains("AccessDenied"));
        assert_eq!(summary.fetches_failed, 1);
        assert_eq!(summary.tables_synced, 1);
    }

    #[tokio::test]
    async fn test_panicking_resolver_is_table_error() {
        let tables = vec![
            Arc::new(table("buggy", Panics)),
            Arc::new(table("fine", TokenPages::new(vec![vec![json!({"id": "f"})]]))),
        ];
        let sink = MemorySink::new();

        let summary = Engine::default()
            .sync(&MockClient::default(), &tables, sink.clone())
            .await
            .unwrap();

        assert_eq!(sink.len(), 1);
        assert_eq!(summary.table_errors.len(), 1);
        assert_eq!(summary.table_errors[0].table, "buggy");
    }

    #[tokio::test]
    async fn test_panicking_child_fails_only_its_own_table() {
        let root = table(
            "brokers",
            TokenPages::new(vec![vec![json!({"id": "b1"}), json!({"id": "b2"}), json!({"id": "b3"})]]),
        )
        .relation(table("broker_users", Panics))
        .relation(table("broker_configs", Children { count: 1 }));
        let sink = MemorySink::new();

        let summary = Engine::default()
            .sync(&MockClient::default(), &[Arc::new(root)], sink.clone())
            .await
            .unwrap();

        assert_eq!(ids(&sink.rows_for("brokers")), vec!["b1", "b2", "b3"]);
        assert_eq!(sink.rows_for("broker_configs").len(), 3);
        assert_eq!(summary.table_errors.len(), 3);
        assert!(summary.table_errors.iter().all(|e| e.table == "broker_users"));
        assert!(summary.table_errors[0].error.contains("resolver bug"));
    }

    #[tokio::test]
    async fn test_panicking_child_column_keeps_parent_rows() {
        let root = table("brokers", TokenPages::new(vec![vec![json!({"id": "b1"}), json!({"id": "b2"})]]))
            .relation(
                table("broker_tags", Children { count: 2 })
                    .column(Column::new("value", ColumnType::String).resolver(PanickingColumn)),
            );
        let sink = MemorySink::new();

        let summary = Engine::default()
            .sync(&MockClient::default(), &[Arc::new(root)], sink.clone())
            .await
            .unwrap();

        assert_eq!(ids(&sink.rows_for("brokers")), vec!["b1", "b2"]);
        assert!(sink.rows_for("broker_tags").is_empty());
        assert_eq!(summary.table_errors.len(), 2);
        assert!(summary.table_errors.iter().all(|e| e.table == "broker_tags"));
    }
}

mod retries {
    use super::*;

    fn engine(max_attempts: u32) -> Engine {
        Engine::new(EngineConfig {
            retry: RetryPolicy {
                max_attempts,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(5),
                multiplier: 2.0,
            },
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_no_retries_by_default() {
        let flaky = Flaky::new(1, false);
        let calls = Arc::clone(&flaky.calls);
        let sink = MemorySink::new();

        let summary = Engine::default()
            .sync(&MockClient::default(), &[Arc::new(table("items", flaky))], sink.clone())
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(sink.is_empty());
        assert_eq!(summary.table_errors.len(), 1);
    }

    #[tokio::test]
    async fn test_retry_recovers_when_nothing_was_emitted() {
        let flaky = Flaky::new(2, false);
        let calls = Arc::clone(&flaky.calls);
        let sink = MemorySink::new();

        let summary = engine(3)
            .sync(&MockClient::default(), &[Arc::new(table("items", flaky))], sink.clone())
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(ids(&sink.rows()), vec!["ok"]);
        assert!(!summary.has_errors());
    }

    #[tokio::test]
    async fn test_no_retry_after_items_were_emitted() {
        let flaky = Flaky::new(2, true);
        let calls = Arc::clone(&flaky.calls);
        let sink = MemorySink::new();

        let summary = engine(3)
            .sync(&MockClient::default(), &[Arc::new(table("items", flaky))], sink.clone())
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(ids(&sink.rows()), vec!["partial-1"]);
        assert_eq!(summary.table_errors.len(), 1);
    }

    #[tokio::test]
    async fn test_backoff_releases_concurrency_slot() {
        let resolver = FailsFirstPerPartition::default();
        let events = Arc::clone(&resolver.events);
        let client = MockClient::with_dims(&["a1"], &["r1", "r2"]);
        let t = table("hosts", resolver).multiplex(DimensionMultiplexer::account_region());
        let sink = MemorySink::new();
        let engine = Engine::new(EngineConfig {
            concurrency: 1,
            retry: RetryPolicy {
                max_attempts: 2,
                initial_backoff: Duration::from_millis(200),
                max_backoff: Duration::from_millis(200),
                multiplier: 1.0,
            },
            ..Default::default()
        });

        let summary = engine.sync(&client, &[Arc::new(t)], sink.clone()).await.unwrap();

        assert_eq!(sink.len(), 2);
        assert!(!summary.has_errors());
        // the second partition fetches while the first waits out its backoff
        let events = events.lock().unwrap().clone();
        assert_eq!(events.len(), 4);
        assert!(events[0].starts_with("fail") && events[1].starts_with("fail"), "{:?}", events);
    }
}

mod fatal {
    use super::*;

    #[tokio::test]
    async fn test_cancellation_returns_promptly() {
        let client = MockClient::with_dims(&["a1"], &["r1", "r2"]);
        let t = table("stream", Endless)
            .multiplex(DimensionMultiplexer::account_region())
            .relation(table("children", Children { count: 2 }));
        let sink = MemorySink::new();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            Engine::default().sync_with_cancel(&client, &[Arc::new(t)], sink.clone(), cancel),
        )
        .await
        .expect("sync should return promptly after cancellation");

        let err = result.unwrap_err();
        assert!(matches!(err, SyncError::Cancelled { .. }));
        assert_eq!(err.summary().rows_emitted, sink.len() as u64);

        // nothing is written after the sync returned
        let emitted = sink.len();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(sink.len(), emitted);
    }

    #[tokio::test]
    async fn test_timeout_is_fatal() {
        let engine = Engine::new(EngineConfig {
            timeout: Some(Duration::from_millis(50)),
            ..Default::default()
        });

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            engine.sync(&MockClient::default(), &[Arc::new(table("stream", Endless))], MemorySink::new()),
        )
        .await
        .expect("timeout should end the sync");

        assert!(matches!(result, Err(SyncError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_sink_failure_is_fatal() {
        let tables = vec![Arc::new(table("stream", Endless))];

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            Engine::default().sync(&MockClient::default(), &tables, FailingSink),
        )
        .await
        .expect("sink failure should end the sync");

        match result {
            Err(SyncError::Sink { source, summary }) => {
                assert!(source.to_string().contains("disk full"));
                assert_eq!(summary.rows_emitted, 0);
            }
            other => panic!("expected sink error, got {:?}", other.map(|s| s.rows_emitted)),
        }
    }

    #[tokio::test]
    async fn test_external_token_is_not_cancelled_by_internal_failure() {
        let cancel = CancellationToken::new();
        let _ = Engine::default()
            .sync_with_cancel(
                &MockClient::default(),
                &[Arc::new(table("stream", Endless))],
                FailingSink,
                cancel.clone(),
            )
            .await;
        assert!(!cancel.is_cancelled());
    }
}
