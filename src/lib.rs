//! relsql - relation-aware queries and schema reconciliation over SQL
//!
//! relsql maps declared entity types onto tables, runs parameterized
//! queries that follow declared relations, and assembles the flat result
//! rows back into nested object graphs.
//!
//! # Architecture
//!
//! - **Schema registry**: entity types, fields, indexes and relations are
//!   declared on a [`SchemaBuilder`] and resolved once by `build()`
//! - **Join planner**: the relations joined by a query form a rooted graph;
//!   the planner orders it leaves first and assigns table aliases
//! - **Two execution strategies**: one `select` with `left join`s, or one
//!   batched `select` per level; both assemble the same graph
//! - **Schema reconciliation**: declared columns and indexes are diffed
//!   against the PostgreSQL catalog and the difference emitted as DDL
//!
//! # Example
//!
//! ```rust,no_run
//! use relsql::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let mut builder = Schema::builder();
//!     builder.register(
//!         EntityBuilder::new("author")
//!             .field(FieldDescriptor::new("id", ColumnType::Integer).not_null())
//!             .field(FieldDescriptor::new("name", ColumnType::Text))
//!             .relation(RelationDecl::has_many("books", "book.author_id")),
//!     )?;
//!     builder.register(
//!         EntityBuilder::new("book")
//!             .field(FieldDescriptor::new("id", ColumnType::Integer).not_null())
//!             .field(FieldDescriptor::new("author_id", ColumnType::Integer))
//!             .field(FieldDescriptor::new("title", ColumnType::Text)),
//!     )?;
//!     let schema = builder.build()?;
//!
//!     #[cfg(feature = "sqlite")]
//!     {
//!         let mut backend = SqliteBackend::memory().await?;
//!         let authors = schema
//!             .query("author")?
//!             .join(schema.relation_id("author", "books")?)
//!             .where_clause(schema.field("author", "name")?.eq("Le Guin"))
//!             .get(&mut backend)
//!             .await?;
//!
//!         for author in &authors {
//!             println!("{}", serde_json::to_string(author.as_ref())?);
//!         }
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! # Backend Support
//!
//! Enable backends via Cargo features:
//!
//! ```toml
//! [dependencies]
//! relsql = { version = "0.1", features = ["postgres", "sqlite"] }
//! ```
//!
//! Reconciliation reads `information_schema` and `pg_indexes`, so
//! [`migrate`](migrate::migrate) needs a PostgreSQL backend.

pub mod assemble;
pub mod backend;
pub mod builder;
pub mod config;
pub mod error;
pub mod exec;
pub mod migrate;
pub mod planner;
pub mod predicate;
pub mod relation;
pub mod schema;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(test)]
pub(crate) mod testing;

pub use assemble::{Instance, Record, Related};
pub use backend::{DatabaseBackend, QueryResult, QueryRow, Transaction};
pub use builder::{OnConflict, Query, SortDirection};
pub use config::DatabaseConfig;
pub use error::{QueryError, Result};
pub use exec::Strategy;
pub use planner::{JoinPlan, JoinRequest};
pub use predicate::{Comparator, FieldRef, LogicalOp, Predicate};
pub use relation::{Cardinality, RelationDecl, RelationDescriptor, RelationId};
pub use schema::{
    ColumnType, EntityBuilder, EntityId, EntityType, FieldDescriptor, IndexDescriptor, Schema,
    SchemaBuilder,
};

#[cfg(feature = "postgres")]
pub use postgres::PostgresBackend;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteBackend;

/// Prelude for common imports
pub mod prelude {
    pub use crate::assemble::{Instance, Related};
    pub use crate::backend::{DatabaseBackend, QueryResult, QueryRow};
    pub use crate::builder::{OnConflict, Query, SortDirection};
    pub use crate::config::DatabaseConfig;
    pub use crate::error::{QueryError, Result};
    pub use crate::exec::Strategy;
    pub use crate::predicate::Predicate;
    pub use crate::relation::RelationDecl;
    pub use crate::schema::{ColumnType, EntityBuilder, FieldDescriptor, IndexDescriptor, Schema};

    #[cfg(feature = "postgres")]
    pub use crate::postgres::PostgresBackend;

    #[cfg(feature = "sqlite")]
    pub use crate::sqlite::SqliteBackend;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_exports() {
        let _schema = Schema::builder();
        let _ty = ColumnType::Text;
        let _op = Comparator::Eq;
        let _strategy = Strategy::default();
        assert_eq!(SortDirection::default(), SortDirection::Asc);
    }
}
