use crate::backend::{DatabaseBackend, QueryResult, QueryRow};
use crate::config::DatabaseConfig;
use crate::error::{QueryError, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgRow, Postgres};
use sqlx::query::Query;
use sqlx::{Column, Row};

pub struct PostgresBackend {
    pool: PgPool,
    /// Connection pinned between `begin_transaction` and commit/rollback.
    transaction: Option<PoolConnection<Postgres>>,
}

impl PostgresBackend {
    /// Create a new PostgreSQL backend with connection pool
    pub async fn new(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await?;

        Ok(Self {
            pool,
            transaction: None,
        })
    }

    /// Connect using `config`, installing the uuid extension when asked to.
    pub async fn with_config(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .min_connections(config.min_connections)
            .connect(&config.url())
            .await
            .map_err(|e| QueryError::Connection(format!("{}: {}", config.name, e)))?;

        let mut backend = Self {
            pool,
            transaction: None,
        };
        if config.create_uuid_extension {
            backend
                .execute(r#"create extension if not exists "uuid-ossp""#, &[])
                .await?;
        }

        Ok(backend)
    }

    /// Convert PostgreSQL row to QueryRow
    fn convert_row(row: &PgRow) -> QueryRow {
        let mut query_row = QueryRow::new();

        for column in row.columns() {
            let column_name = column.name();

            if let Ok(Some(value)) = row.try_get::<Option<String>, _>(column_name) {
                query_row.insert(column_name, Value::String(value));
            } else if let Ok(Some(value)) = row.try_get::<Option<uuid::Uuid>, _>(column_name) {
                query_row.insert(column_name, Value::String(value.to_string()));
            } else if let Ok(Some(value)) = row.try_get::<Option<i64>, _>(column_name) {
                query_row.insert(column_name, Value::Number(value.into()));
            } else if let Ok(Some(value)) = row.try_get::<Option<i32>, _>(column_name) {
                query_row.insert(column_name, Value::Number(value.into()));
            } else if let Ok(Some(value)) = row.try_get::<Option<f64>, _>(column_name) {
                if let Some(num) = serde_json::Number::from_f64(value) {
                    query_row.insert(column_name, Value::Number(num));
                }
            } else if let Ok(Some(value)) = row.try_get::<Option<bool>, _>(column_name) {
                query_row.insert(column_name, Value::Bool(value));
            } else if let Ok(Some(value)) =
                row.try_get::<Option<chrono::NaiveDateTime>, _>(column_name)
            {
                query_row.insert(column_name, Value::String(value.to_string()));
            } else if let Ok(Some(value)) =
                row.try_get::<Option<rust_decimal::Decimal>, _>(column_name)
            {
                match value.to_string().parse::<serde_json::Number>() {
                    Ok(num) => query_row.insert(column_name, Value::Number(num)),
                    Err(_) => query_row.insert(column_name, Value::String(value.to_string())),
                }
            } else if let Ok(Some(value)) = row.try_get::<Option<Value>, _>(column_name) {
                query_row.insert(column_name, value);
            } else {
                query_row.insert(column_name, Value::Null);
            }
        }

        query_row
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &'q Value,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => query.bind(i),
            None => query.bind(n.as_f64()),
        },
        Value::String(s) => query.bind(s.as_str()),
        other => query.bind(other.to_string()),
    }
}

fn prepare<'q>(sql: &'q str, args: &'q [Value]) -> Query<'q, Postgres, PgArguments> {
    args.iter().fold(sqlx::query(sql), bind_value)
}

#[async_trait]
impl DatabaseBackend for PostgresBackend {
    async fn execute(&mut self, sql: &str, args: &[Value]) -> Result<u64> {
        tracing::debug!(sql = %sql, args = args.len(), "running sql");
        let query = prepare(sql, args);
        let result = match self.transaction.as_mut() {
            Some(conn) => query.execute(&mut **conn).await?,
            None => query.execute(&self.pool).await?,
        };
        Ok(result.rows_affected())
    }

    async fn query(&mut self, sql: &str, args: &[Value]) -> Result<QueryResult> {
        tracing::debug!(sql = %sql, args = args.len(), "running sql");
        let query = prepare(sql, args);
        let rows = match self.transaction.as_mut() {
            Some(conn) => query.fetch_all(&mut **conn).await?,
            None => query.fetch_all(&self.pool).await?,
        };

        Ok(rows.iter().map(Self::convert_row).collect())
    }

    async fn begin_transaction(&mut self) -> Result<()> {
        if self.transaction.is_some() {
            return Err(QueryError::Transaction(
                "Already in transaction".to_string(),
            ));
        }

        let mut conn = self.pool.acquire().await?;
        sqlx::query("begin").execute(&mut *conn).await?;
        self.transaction = Some(conn);
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        let Some(mut conn) = self.transaction.take() else {
            return Err(QueryError::Transaction("Not in transaction".to_string()));
        };

        sqlx::query("commit").execute(&mut *conn).await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        let Some(mut conn) = self.transaction.take() else {
            return Err(QueryError::Transaction("Not in transaction".to_string()));
        };

        sqlx::query("rollback").execute(&mut *conn).await?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.pool.is_closed()
    }

    fn typed_parameters(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate;
    use crate::schema::{ColumnType, EntityBuilder, FieldDescriptor, IndexDescriptor, Schema};
    use serde_json::json;

    fn config() -> DatabaseConfig {
        DatabaseConfig::new("relsql_test").credentials("relsql_test", "relsql_test")
    }

    #[tokio::test]
    #[ignore] // Requires PostgreSQL running
    async fn test_postgres_connection() {
        let backend = PostgresBackend::with_config(&config()).await;
        assert!(backend.is_ok());
    }

    #[tokio::test]
    #[ignore] // Requires PostgreSQL running
    async fn test_postgres_query() {
        let mut backend = PostgresBackend::with_config(&config()).await.unwrap();

        backend
            .execute("create temporary table test_table (id bigint primary key, name text)", &[])
            .await
            .unwrap();
        backend
            .execute("insert into test_table (id, name) values ($1, $2)", &[json!(1), json!("Alice")])
            .await
            .unwrap();

        let results = backend
            .query("select * from test_table where id = $1", &[json!(1)])
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].get_i64("id"), Some(1));
        assert_eq!(results[0].get_string("name"), Some("Alice".to_string()));
    }

    #[tokio::test]
    #[ignore] // Requires PostgreSQL running
    async fn test_postgres_migrate_is_idempotent() {
        let mut backend = PostgresBackend::with_config(&config()).await.unwrap();
        backend
            .execute(r#"drop table if exists "reconciled""#, &[])
            .await
            .unwrap();

        let mut builder = Schema::builder();
        builder
            .register(
                EntityBuilder::new("reconciled")
                    .field(FieldDescriptor::new("id", ColumnType::Uuid).not_null())
                    .field(FieldDescriptor::new("dt", ColumnType::Timestamp))
                    .field(FieldDescriptor::new("name", ColumnType::Varchar).length(64))
                    .index(IndexDescriptor::primary_key("primary_key", vec!["id"]))
                    .index(IndexDescriptor::new("name_index", vec!["name"]).unique()),
            )
            .unwrap();
        let schema = builder.build().unwrap();

        let applied = migrate::migrate(&mut backend, &schema, true).await.unwrap();
        assert!(!applied.is_empty());
        assert!(migrate::migrate(&mut backend, &schema, false).await.unwrap().is_empty());
    }
    #[tokio::test]
    #[ignore] // Requires PostgreSQL running
    async fn test_postgres_numeric_decodes() {
        let mut backend = PostgresBackend::with_config(&config()).await.unwrap();
        let rows = backend
            .query("select 12.50::numeric as price, null::numeric as missing", &[])
            .await
            .unwrap();

        assert_eq!(rows[0].value("price"), Some(&json!(12.5)));
        assert_eq!(rows[0].value("missing"), None);
    }

    #[tokio::test]
    #[ignore] // Requires PostgreSQL running
    async fn test_postgres_binds_by_column_type() {
        let mut backend = PostgresBackend::with_config(&config()).await.unwrap();
        backend
            .execute(r#"drop table if exists "typed_params""#, &[])
            .await
            .unwrap();
        backend
            .execute(
                r#"create table "typed_params" ("id" uuid primary key, "label" text, "at" timestamp)"#,
                &[],
            )
            .await
            .unwrap();

        let mut builder = Schema::builder();
        builder
            .register(
                EntityBuilder::new("typed_params")
                    .field(FieldDescriptor::new("id", ColumnType::Uuid).not_null())
                    .field(FieldDescriptor::new("label", ColumnType::Text))
                    .field(FieldDescriptor::new("at", ColumnType::Timestamp)),
            )
            .unwrap();
        let schema = builder.build().unwrap();

        let id = "3b33518d-a8b5-4a06-ad32-a5bfe0893a4a";
        let record = [
            ("id".to_string(), json!(id)),
            ("label".to_string(), json!(id)),
            ("at".to_string(), json!("2024-05-01 12:00:00")),
        ]
        .into_iter()
        .collect();
        let query = schema.query("typed_params").unwrap();
        query.create_one(&mut backend, record, None).await.unwrap();

        let label = schema.field("typed_params", "label").unwrap();
        let at = schema.field("typed_params", "at").unwrap();
        let found = schema
            .query("typed_params")
            .unwrap()
            .where_clause(label.eq(id) & at.gt("2024-01-01 00:00:00"))
            .get(&mut backend)
            .await
            .unwrap();

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].get("label"), Some(&json!(id)));
    }
}
