//! Runtime resources
//!
//! A [`Resource`] wraps one raw item while it is being turned into a row.
//! Parents are referenced by [`ResourceId`] through the sync-wide
//! [`ResourceArena`] instead of by live reference: a resource is inserted
//! into the arena once its row is complete and removed once every
//! descendant has been resolved.

use super::value::Cell;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(u64);

impl ResourceId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One raw item plus the row values resolved for it so far
#[derive(Debug, Clone)]
pub struct Resource {
    id: ResourceId,
    parent: Option<ResourceId>,
    table: String,
    row_id: Uuid,
    /// Raw item. Pre-resource resolvers may replace it.
    pub item: Value,
    values: Vec<(String, Cell)>,
}

impl Resource {
    pub fn new(id: ResourceId, table: &str, parent: Option<ResourceId>, item: Value) -> Self {
        Self {
            id,
            parent,
            table: table.to_string(),
            row_id: Uuid::new_v4(),
            item,
            values: Vec::new(),
        }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn parent_id(&self) -> Option<ResourceId> {
        self.parent
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Identifier of the row this resource produces (`_cq_id`)
    pub fn row_id(&self) -> Uuid {
        self.row_id
    }

    pub fn get(&self, column: &str) -> Option<&Cell> {
        self.values
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, cell)| cell)
    }

    /// Set a column value, replacing any earlier value for the same column
    pub fn set(&mut self, column: &str, cell: Cell) {
        match self.values.iter_mut().find(|(name, _)| name == column) {
            Some((_, existing)) => *existing = cell,
            None => self.values.push((column.to_string(), cell)),
        }
    }

    pub fn values(&self) -> &[(String, Cell)] {
        &self.values
    }
}

/// Sync-wide store of resources that currently have children in flight
#[derive(Debug, Default)]
pub struct ResourceArena {
    next: AtomicU64,
    live: RwLock<HashMap<ResourceId, Arc<Resource>>>,
}

impl ResourceArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&self) -> ResourceId {
        ResourceId(self.next.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub fn insert(&self, resource: Resource) -> Arc<Resource> {
        let resource = Arc::new(resource);
        self.live
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(resource.id(), Arc::clone(&resource));
        resource
    }

    pub fn get(&self, id: ResourceId) -> Option<Arc<Resource>> {
        self.live
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    pub fn remove(&self, id: ResourceId) -> Option<Arc<Resource>> {
        self.live
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }

    /// Number of live resources
    pub fn len(&self) -> usize {
        self.live.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
