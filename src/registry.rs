//! Table Registry
//!
//! Holds the table forest built at startup and answers lookups and table
//! selection. Read-only once constructed.

use crate::client::ClientMeta;
use crate::schema::Table;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("table name must not be empty")]
    EmptyTableName,
    #[error("duplicate table name: {0}")]
    DuplicateTable(String),
    #[error("table {0} has no columns")]
    NoColumns(String),
    #[error("table {table} has a column with an empty name")]
    EmptyColumnName { table: String },
    #[error("table {table} declares column {column} more than once")]
    DuplicateColumn { table: String, column: String },
    #[error("table {table} is a child of {parent}; select {parent} instead")]
    ChildTableSelected { table: String, parent: String },
    #[error("no tables match {0:?}")]
    NoMatch(String),
}

pub struct TableRegistry<C: ClientMeta> {
    roots: Vec<Arc<Table<C>>>,
    by_name: HashMap<String, Arc<Table<C>>>,
    parents: HashMap<String, String>,
}

impl<C: ClientMeta> TableRegistry<C> {
    /// Build a registry from root tables, validating the whole forest
    pub fn new<I>(tables: I) -> Result<Self, RegistryError>
    where
        I: IntoIterator<Item = Table<C>>,
    {
        let mut registry = Self {
            roots: Vec::new(),
            by_name: HashMap::new(),
            parents: HashMap::new(),
        };

        for table in tables {
            let table = Arc::new(table);
            registry.index(&table, None)?;
            registry.roots.push(table);
        }

        Ok(registry)
    }

    fn index(&mut self, table: &Arc<Table<C>>, parent: Option<&str>) -> Result<(), RegistryError> {
        validate(table)?;
        if self.by_name.contains_key(&table.name) {
            return Err(RegistryError::DuplicateTable(table.name.clone()));
        }
        self.by_name.insert(table.name.clone(), Arc::clone(table));
        if let Some(parent) = parent {
            self.parents.insert(table.name.clone(), parent.to_string());
        }

        for child in &table.relations {
            self.index(child, Some(&table.name))?;
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Table<C>>> {
        self.by_name.get(name)
    }

    pub fn roots(&self) -> &[Arc<Table<C>>] {
        &self.roots
    }

    /// Parent table name of a child table
    pub fn parent_of(&self, name: &str) -> Option<&str> {
        self.parents.get(name).map(|s| s.as_str())
    }

    /// Every table, parents before children
    pub fn flatten(&self) -> Vec<Arc<Table<C>>> {
        self.roots.iter().flat_map(Table::flatten).collect()
    }

    /// Total number of tables including children
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Select root tables matching `include` (glob patterns, `*` wildcard),
    /// minus anything matching `skip`. Skipped child tables are pruned from
    /// the returned copies.
    pub fn select(&self, include: &[String], skip: &[String]) -> Result<Vec<Arc<Table<C>>>, RegistryError> {
        let mut selected = Vec::new();
        let mut seen = HashSet::new();

        for pattern in include {
            let mut matched = false;

            for root in &self.roots {
                if glob_match(pattern, &root.name) {
                    matched = true;
                    if seen.insert(root.name.clone()) {
                        selected.push(Arc::clone(root));
                    }
                }
            }

            if !matched {
                // Naming a child table directly is a configuration mistake
                if let Some(parent) = self.parent_of(pattern) {
                    return Err(RegistryError::ChildTableSelected {
                        table: pattern.clone(),
                        parent: self.root_of(parent).to_string(),
                    });
                }
                return Err(RegistryError::NoMatch(pattern.clone()));
            }
        }

        // Keep registration order regardless of pattern order
        let order: HashMap<&str, usize> = self
            .roots
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name.as_str(), i))
            .collect();
        selected.sort_by_key(|t| order.get(t.name.as_str()).copied().unwrap_or(usize::MAX));

        Ok(selected
            .into_iter()
            .filter(|t| !skip.iter().any(|p| glob_match(p, &t.name)))
            .map(|t| prune(&t, skip))
            .collect())
    }

    fn root_of<'a>(&'a self, mut name: &'a str) -> &'a str {
        while let Some(parent) = self.parent_of(name) {
            name = parent;
        }
        name
    }
}

fn validate<C: ClientMeta>(table: &Table<C>) -> Result<(), RegistryError> {
    if table.name.is_empty() {
        return Err(RegistryError::EmptyTableName);
    }
    if table.columns.is_empty() {
        return Err(RegistryError::NoColumns(table.name.clone()));
    }

    let mut names = HashSet::new();
    for column in &table.columns {
        if column.name.is_empty() {
            return Err(RegistryError::EmptyColumnName {
                table: table.name.clone(),
            });
        }
        if !names.insert(column.name.as_str()) {
            return Err(RegistryError::DuplicateColumn {
                table: table.name.clone(),
                column: column.name.clone(),
            });
        }
    }
    Ok(())
}

/// Copy of `table` without relations matching `skip`
fn prune<C: ClientMeta>(table: &Arc<Table<C>>, skip: &[String]) -> Arc<Table<C>> {
    let skipped = |t: &Table<C>| skip.iter().any(|p| glob_match(p, &t.name));
    if !Table::flatten(table).iter().skip(1).any(|t| skipped(t.as_ref())) {
        return Arc::clone(table);
    }

    let mut copy = Table::clone(table);
    copy.relations = table
        .relations
        .iter()
        .filter(|child| !skipped(child.as_ref()))
        .map(|child| prune(child, skip))
        .collect();
    Arc::new(copy)
}

/// Glob match supporting `*` (any run of characters)
pub fn glob_match(pattern: &str, name: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == name;
    }

    let first = parts[0];
    let last = parts[parts.len() - 1];
    if !name.starts_with(first) || name.len() < first.len() + last.len() || !name.ends_with(last) {
        return false;
    }

    let mut rest = &name[first.len()..name.len() - last.len()];
    for part in &parts[1..parts.len() - 1] {
        match rest.find(part) {
            Some(idx) => rest = &rest[idx + part.len()..],
            None => return false,
        }
    }
    true
}
