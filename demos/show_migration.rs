//! Print the DDL that reconciles a small schema against an empty database,
//! followed by the joined select for a nested query.
//!
//! ```text
//! cargo run --example show_migration
//! ```

use async_trait::async_trait;
use relsql::migrate;
use relsql::prelude::*;
use serde_json::Value;

/// Backend whose catalog is empty: every table looks missing.
struct EmptyCatalog;

#[async_trait]
impl DatabaseBackend for EmptyCatalog {
    async fn execute(&mut self, _sql: &str, _args: &[Value]) -> Result<u64> {
        Ok(0)
    }

    async fn query(&mut self, _sql: &str, _args: &[Value]) -> Result<QueryResult> {
        Ok(Vec::new())
    }

    async fn begin_transaction(&mut self) -> Result<()> {
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        Ok(())
    }

    fn is_connected(&self) -> bool {
        true
    }
}

fn schema() -> Result<Schema> {
    let mut builder = Schema::builder();
    builder.register(
        EntityBuilder::new("author")
            .table("authors")
            .field(FieldDescriptor::new("id", ColumnType::Uuid).not_null())
            .field(FieldDescriptor::new("name", ColumnType::Varchar).length(128).not_null())
            .field(FieldDescriptor::new("joined", ColumnType::Timestamp))
            .index(IndexDescriptor::primary_key("primary_key", vec!["id"]))
            .index(IndexDescriptor::new("name_index", vec!["name"]).unique())
            .relation(RelationDecl::has_many("books", "book.author_id")),
    )?;
    builder.register(
        EntityBuilder::new("book")
            .table("books")
            .field(FieldDescriptor::new("id", ColumnType::Uuid).not_null())
            .field(FieldDescriptor::new("author_id", ColumnType::Uuid).not_null())
            .field(FieldDescriptor::new("title", ColumnType::Text))
            .field(FieldDescriptor::new("pages", ColumnType::Integer))
            .index(IndexDescriptor::primary_key("primary_key", vec!["id"]))
            .index(IndexDescriptor::new("author_index", vec!["author_id"]))
            .relation(RelationDecl::belongs_to("author", "book.author_id", "author")),
    )?;
    builder.build()
}

#[tokio::main]
async fn main() -> Result<()> {
    let schema = schema()?;

    println!("-- migration");
    for statement in migrate::migrate(&mut EmptyCatalog, &schema, false).await? {
        println!("{};", statement);
    }

    let (sql, args) = schema
        .query("author")?
        .join(schema.relation_id("author", "books")?)
        .where_clause(schema.field("author", "name")?.eq("Ursula K. Le Guin"))
        .order(vec![schema.field("author", "joined")?], SortDirection::Desc)
        .alias_seed(7)
        .to_sql()?;

    println!();
    println!("-- nested query");
    println!("{}", sql);
    println!("-- args: {}", Value::Array(args));

    Ok(())
}
