//! Column definitions and column resolvers

use super::resource::Resource;
use super::value::{lookup, lower_camel_case, ColumnType};
use crate::client::ClientMeta;
use crate::engine::SyncContext;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Produces the raw value of one column for one resource.
///
/// Invoked once per row per column. May issue further API calls (tags,
/// policies). The returned JSON is converted to the column's type by the
/// engine.
#[async_trait]
pub trait ColumnResolver<C: ClientMeta>: Send + Sync {
    async fn resolve(
        &self,
        ctx: &SyncContext,
        client: &C,
        resource: &Resource,
        column: &Column<C>,
    ) -> Result<Value>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ColumnCreationOptions {
    pub primary_key: bool,
    pub not_null: bool,
}

pub struct Column<C: ClientMeta> {
    pub name: String,
    pub column_type: ColumnType,
    pub description: String,
    /// Falls back to reading the item field named after the column
    pub resolver: Option<Arc<dyn ColumnResolver<C>>>,
    pub options: ColumnCreationOptions,
}

impl<C: ClientMeta> Column<C> {
    pub fn new(name: &str, column_type: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            column_type,
            description: String::new(),
            resolver: None,
            options: ColumnCreationOptions::default(),
        }
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn resolver<R: ColumnResolver<C> + 'static>(mut self, resolver: R) -> Self {
        self.resolver = Some(Arc::new(resolver));
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.options.primary_key = true;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.options.not_null = true;
        self
    }

    /// Column must hold a value for the row to be emitted
    pub fn is_required(&self) -> bool {
        self.options.primary_key || self.options.not_null
    }

    pub(crate) async fn resolve(
        &self,
        ctx: &SyncContext,
        client: &C,
        resource: &Resource,
    ) -> Result<Value> {
        match &self.resolver {
            Some(resolver) => resolver.resolve(ctx, client, resource, self).await,
            None => Ok(default_value(resource, &self.name)),
        }
    }
}

impl<C: ClientMeta> Clone for Column<C> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            column_type: self.column_type,
            description: self.description.clone(),
            resolver: self.resolver.clone(),
            options: self.options,
        }
    }
}

impl<C: ClientMeta> fmt::Debug for Column<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Column")
            .field("name", &self.name)
            .field("column_type", &self.column_type)
            .field("options", &self.options)
            .field("custom_resolver", &self.resolver.is_some())
            .finish()
    }
}

/// Value of the item field named after the column: lowerCamelCase first,
/// then the literal column name.
fn default_value(resource: &Resource, column: &str) -> Value {
    lookup(&resource.item, &lower_camel_case(column))
        .or_else(|| lookup(&resource.item, column))
        .cloned()
        .unwrap_or(Value::Null)
}

/// Reads a dotted path from the raw item
#[derive(Debug, Clone)]
pub struct PathResolver {
    path: String,
}

impl PathResolver {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
        }
    }
}

#[async_trait]
impl<C: ClientMeta> ColumnResolver<C> for PathResolver {
    async fn resolve(
        &self,
        _ctx: &SyncContext,
        _client: &C,
        resource: &Resource,
        _column: &Column<C>,
    ) -> Result<Value> {
        Ok(lookup(&resource.item, &self.path)
            .cloned()
            .unwrap_or(Value::Null))
    }
}

/// Copies an already-resolved column of the parent row
#[derive(Debug, Clone)]
pub struct ParentColumnResolver {
    column: String,
}

impl ParentColumnResolver {
    pub fn new(column: &str) -> Self {
        Self {
            column: column.to_string(),
        }
    }
}

#[async_trait]
impl<C: ClientMeta> ColumnResolver<C> for ParentColumnResolver {
    async fn resolve(
        &self,
        ctx: &SyncContext,
        _client: &C,
        resource: &Resource,
        _column: &Column<C>,
    ) -> Result<Value> {
        let Some(parent) = ctx.parent_of(resource) else {
            return Ok(Value::Null);
        };
        Ok(parent
            .get(&self.column)
            .map(|cell| cell.to_json())
            .unwrap_or(Value::Null))
    }
}

/// Value of a multiplex dimension of the current partition
/// (account id, region, project)
#[derive(Debug, Clone)]
pub struct PartitionResolver {
    dimension: String,
}

impl PartitionResolver {
    pub fn new(dimension: &str) -> Self {
        Self {
            dimension: dimension.to_string(),
        }
    }
}

#[async_trait]
impl<C: ClientMeta> ColumnResolver<C> for PartitionResolver {
    async fn resolve(
        &self,
        _ctx: &SyncContext,
        client: &C,
        _resource: &Resource,
        _column: &Column<C>,
    ) -> Result<Value> {
        Ok(client
            .partition()
            .get(&self.dimension)
            .map(|v| Value::String(v.to_string()))
            .unwrap_or(Value::Null))
    }
}

#[derive(Debug, Clone)]
pub struct ConstantResolver(pub Value);

#[async_trait]
impl<C: ClientMeta> ColumnResolver<C> for ConstantResolver {
    async fn resolve(
        &self,
        _ctx: &SyncContext,
        _client: &C,
        _resource: &Resource,
        _column: &Column<C>,
    ) -> Result<Value> {
        Ok(self.0.clone())
    }
}
