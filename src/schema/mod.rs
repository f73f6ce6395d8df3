//! Declarative table schema
//!
//! - [`value`] - column types, typed cells and JSON conversion
//! - [`column`] - column definitions and built-in column resolvers
//! - [`table`] - tables and the fetch / pre / post resource resolver traits
//! - [`resource`] - runtime resources and the resource arena

pub mod column;
pub mod resource;
pub mod table;
pub mod value;

pub use column::{
    Column, ColumnCreationOptions, ColumnResolver, ConstantResolver, ParentColumnResolver,
    PartitionResolver, PathResolver,
};
pub use resource::{Resource, ResourceArena, ResourceId};
pub use table::{PostResourceResolver, PreResourceResolver, Table, TableResolver};
pub use value::{Cell, ColumnType, ConversionError};
