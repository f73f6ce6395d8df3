//! Table definitions
//!
//! A [`Table`] bundles a schema with the resolvers that populate it. Tables
//! form a forest through `relations`: every child table is fetched once per
//! row of its parent, with that row's resource as the parent.

use super::column::Column;
use super::resource::Resource;
use crate::client::ClientMeta;
use crate::engine::{ResourceSender, SyncContext};
use crate::multiplex::Multiplexer;
use anyhow::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// Fetches raw items for a table.
///
/// Paginated APIs are paged by the resolver itself: request, emit the page,
/// follow the continuation token until it comes back empty. Items go out
/// through `res`, whose bounded channel applies backpressure.
#[async_trait]
pub trait TableResolver<C: ClientMeta>: Send + Sync {
    async fn fetch(
        &self,
        ctx: &SyncContext,
        client: &C,
        parent: Option<&Resource>,
        res: ResourceSender,
    ) -> Result<()>;
}

/// Enriches or replaces a raw item before its columns are resolved, e.g.
/// fetching the full detail of an item returned by a list call.
///
/// Returning [`NotFound`](crate::error::NotFound) drops the item silently.
#[async_trait]
pub trait PreResourceResolver<C: ClientMeta>: Send + Sync {
    async fn resolve(&self, ctx: &SyncContext, client: &C, resource: &mut Resource) -> Result<()>;
}

/// Runs after every column has been resolved, before the row is validated
/// and emitted.
#[async_trait]
pub trait PostResourceResolver<C: ClientMeta>: Send + Sync {
    async fn resolve(&self, ctx: &SyncContext, client: &C, resource: &mut Resource) -> Result<()>;
}

pub struct Table<C: ClientMeta> {
    pub name: String,
    pub description: String,
    pub columns: Vec<Column<C>>,
    pub resolver: Arc<dyn TableResolver<C>>,
    pub pre_resource_resolver: Option<Arc<dyn PreResourceResolver<C>>>,
    pub post_resource_resolver: Option<Arc<dyn PostResourceResolver<C>>>,
    /// `None` means a single, unpinned partition
    pub multiplex: Option<Arc<dyn Multiplexer<C>>>,
    pub relations: Vec<Arc<Table<C>>>,
}

impl<C: ClientMeta> Table<C> {
    pub fn new<R: TableResolver<C> + 'static>(name: &str, resolver: R) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            columns: Vec::new(),
            resolver: Arc::new(resolver),
            pre_resource_resolver: None,
            post_resource_resolver: None,
            multiplex: None,
            relations: Vec::new(),
        }
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn column(mut self, column: Column<C>) -> Self {
        self.columns.push(column);
        self
    }

    pub fn columns<I: IntoIterator<Item = Column<C>>>(mut self, columns: I) -> Self {
        self.columns.extend(columns);
        self
    }

    pub fn pre_resource_resolver<R: PreResourceResolver<C> + 'static>(mut self, resolver: R) -> Self {
        self.pre_resource_resolver = Some(Arc::new(resolver));
        self
    }

    pub fn post_resource_resolver<R: PostResourceResolver<C> + 'static>(mut self, resolver: R) -> Self {
        self.post_resource_resolver = Some(Arc::new(resolver));
        self
    }

    pub fn multiplex<M: Multiplexer<C> + 'static>(mut self, multiplexer: M) -> Self {
        self.multiplex = Some(Arc::new(multiplexer));
        self
    }

    pub fn relation(mut self, table: Table<C>) -> Self {
        self.relations.push(Arc::new(table));
        self
    }

    pub fn get_column(&self, name: &str) -> Option<&Column<C>> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn primary_keys(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.options.primary_key)
            .map(|c| c.name.as_str())
            .collect()
    }

    /// This table and all descendants, parents before children
    pub fn flatten(table: &Arc<Self>) -> Vec<Arc<Table<C>>> {
        let mut out = vec![Arc::clone(table)];
        for child in &table.relations {
            out.extend(Table::flatten(child));
        }
        out
    }
}

impl<C: ClientMeta> Clone for Table<C> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            description: self.description.clone(),
            columns: self.columns.clone(),
            resolver: Arc::clone(&self.resolver),
            pre_resource_resolver: self.pre_resource_resolver.clone(),
            post_resource_resolver: self.post_resource_resolver.clone(),
            multiplex: self.multiplex.clone(),
            relations: self.relations.clone(),
        }
    }
}

impl<C: ClientMeta> fmt::Debug for Table<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.name)
            .field("columns", &self.columns)
            .field("multiplexed", &self.multiplex.is_some())
            .field(
                "relations",
                &self.relations.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}
