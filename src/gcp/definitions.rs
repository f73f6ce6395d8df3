//! Table definitions - GCP tables declared in JSON
//!
//! Every table is a list call (optionally followed by a per-item detail
//! call) against one GCP service. The definitions are embedded in the
//! binary and turned into [`Table`]s by [`build_table`].

use super::client::GcpClient;
use crate::client::ClientMeta;
use crate::engine::{ResourceSender, SyncContext};
use crate::multiplex::{DimensionMultiplexer, PROJECT};
use crate::schema::value::lookup;
use crate::schema::{
    Column, ColumnType, ParentColumnResolver, PartitionResolver, PathResolver, PreResourceResolver,
    Resource, Table, TableResolver,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

const TABLES_JSON: &str = include_str!("tables.json");

/// Column definition from JSON
#[derive(Debug, Clone, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default)]
    pub description: String,
    /// Dotted path into the item. Defaults to the camelCase column name.
    #[serde(default)]
    pub path: Option<String>,
    /// Copy this column of the parent row
    #[serde(default)]
    pub parent_column: Option<String>,
    /// Value of a partition dimension (`project`)
    #[serde(default)]
    pub partition: Option<String>,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default)]
    pub not_null: bool,
}

/// Table definition from JSON
#[derive(Debug, Clone, Deserialize)]
pub struct TableDef {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Endpoint key, see [`Endpoints`](super::client::Endpoints)
    pub service: String,
    /// Path template of the list call
    pub list_path: String,
    /// Where the items sit in a list response
    #[serde(default)]
    pub response_path: String,
    /// Per-scope key of aggregated list responses (`instances`, `disks`)
    #[serde(default)]
    pub aggregated: Option<String>,
    /// Path template of the per-item detail call
    #[serde(default)]
    pub detail_path: Option<String>,
    /// One partition per configured project. Root tables only.
    #[serde(default)]
    pub multiplex: bool,
    pub columns: Vec<ColumnDef>,
    #[serde(default)]
    pub relations: Vec<TableDef>,
}

/// Parse the embedded table definitions
pub fn definitions() -> Result<Vec<TableDef>> {
    serde_json::from_str(TABLES_JSON).context("Failed to parse embedded table definitions")
}

pub fn build_table(def: &TableDef) -> Table<GcpClient> {
    let mut table = Table::new(
        &def.name,
        ListResolver {
            service: def.service.clone(),
            path: def.list_path.clone(),
            response_path: def.response_path.clone(),
            aggregated: def.aggregated.clone(),
        },
    )
    .description(&def.description)
    .columns(def.columns.iter().map(build_column));

    if let Some(path) = &def.detail_path {
        table = table.pre_resource_resolver(DetailResolver {
            service: def.service.clone(),
            path: path.clone(),
        });
    }

    if def.multiplex {
        table = table.multiplex(DimensionMultiplexer::project());
    }

    for child in &def.relations {
        table = table.relation(build_table(child));
    }
    table
}

fn build_column(def: &ColumnDef) -> Column<GcpClient> {
    let mut column = Column::new(&def.name, def.column_type).description(&def.description);

    if let Some(path) = &def.path {
        column = column.resolver(PathResolver::new(path));
    } else if let Some(parent) = &def.parent_column {
        column = column.resolver(ParentColumnResolver::new(parent));
    } else if let Some(dimension) = &def.partition {
        column = column.resolver(PartitionResolver::new(dimension));
    }

    if def.primary_key {
        column = column.primary_key();
    }
    if def.not_null {
        column = column.not_null();
    }
    column
}

/// Lists a collection, following `nextPageToken`
struct ListResolver {
    service: String,
    path: String,
    response_path: String,
    aggregated: Option<String>,
}

#[async_trait]
impl TableResolver<GcpClient> for ListResolver {
    async fn fetch(
        &self,
        _ctx: &SyncContext,
        client: &GcpClient,
        parent: Option<&Resource>,
        res: ResourceSender,
    ) -> Result<()> {
        let path = render(&self.path, client, parent, None)?;
        let url = client.url(&self.service, &path)?;
        let mut page_token: Option<String> = None;

        loop {
            let query: Vec<(&str, &str)> = match &page_token {
                Some(token) => vec![("pageToken", token.as_str())],
                None => Vec::new(),
            };
            let response = client.get(&url, &query).await?;

            let items = extract_items(&response, &self.response_path, self.aggregated.as_deref());
            tracing::debug!("{}: page with {} items", client.id(), items.len());
            res.send_all(items).await?;

            page_token = response
                .get("nextPageToken")
                .and_then(Value::as_str)
                .filter(|t| !t.is_empty())
                .map(str::to_string);
            if page_token.is_none() {
                break;
            }
        }

        Ok(())
    }
}

/// Replaces a listed item with its full detail
struct DetailResolver {
    service: String,
    path: String,
}

#[async_trait]
impl PreResourceResolver<GcpClient> for DetailResolver {
    async fn resolve(&self, _ctx: &SyncContext, client: &GcpClient, resource: &mut Resource) -> Result<()> {
        let path = render(&self.path, client, None, Some(&resource.item))?;
        let url = client.url(&self.service, &path)?;
        resource.item = client.get(&url, &[]).await?;
        Ok(())
    }
}

/// Items of a list response. Aggregated responses map scopes
/// (`zones/us-central1-a`) to `{"<key>": [...]}` and are flattened.
fn extract_items(response: &Value, path: &str, aggregated: Option<&str>) -> Vec<Value> {
    let Some(found) = lookup(response, path) else {
        return Vec::new();
    };

    match (aggregated, found) {
        (Some(key), Value::Object(scopes)) => scopes
            .values()
            .filter_map(|scope| scope.get(key).and_then(Value::as_array))
            .flatten()
            .cloned()
            .collect(),
        (Some(_), _) => Vec::new(),
        (None, Value::Array(items)) => items.clone(),
        (None, Value::Null) => Vec::new(),
        (None, item) => vec![item.clone()],
    }
}

/// Fill `{project}`, `{parent.<path>}` and `{item.<path>}` placeholders.
/// Values are percent-encoded.
fn render(template: &str, client: &GcpClient, parent: Option<&Resource>, item: Option<&Value>) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let end = rest[start..]
            .find('}')
            .map(|i| start + i)
            .with_context(|| format!("Unclosed placeholder in {}", template))?;
        let key = &rest[start + 1..end];
        let value = placeholder(key, client, parent, item)
            .with_context(|| format!("No value for {{{}}} in {}", key, template))?;
        out.push_str(&urlencoding::encode(&value));
        rest = &rest[end + 1..];
    }

    out.push_str(rest);
    Ok(out)
}

fn placeholder(key: &str, client: &GcpClient, parent: Option<&Resource>, item: Option<&Value>) -> Option<String> {
    let value = match key.split_once('.') {
        None if key == PROJECT => return client.project().map(str::to_string),
        Some(("parent", path)) => lookup(&parent?.item, path)?,
        Some(("item", path)) => lookup(item?, path)?,
        _ => return None,
    };

    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
