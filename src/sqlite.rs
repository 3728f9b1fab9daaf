use crate::backend::{DatabaseBackend, QueryResult, QueryRow};
use crate::config::DatabaseConfig;
use crate::error::{QueryError, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::pool::PoolConnection;
use sqlx::query::Query;
use sqlx::sqlite::{
    Sqlite, SqliteArguments, SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Column, Row};
use std::str::FromStr;

pub struct SqliteBackend {
    pool: SqlitePool,
    /// Connection pinned between `begin_transaction` and commit/rollback.
    transaction: Option<PoolConnection<Sqlite>>,
}

impl SqliteBackend {
    /// Create a new SQLite backend with connection pool
    pub async fn new(url: &str) -> Result<Self> {
        Self::with_config(url, &DatabaseConfig::default()).await
    }

    /// Open `url` with the pool sizing from `config`.
    pub async fn with_config(url: &str, config: &DatabaseConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);

        let memory = url.contains(":memory:");
        let pool = SqlitePoolOptions::new()
            // every connection to `:memory:` is a separate database
            .max_connections(if memory { 1 } else { config.pool_size })
            .min_connections(if memory { 1 } else { config.min_connections })
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Ok(Self {
            pool,
            transaction: None,
        })
    }

    /// Create an in-memory SQLite database
    pub async fn memory() -> Result<Self> {
        Self::new("sqlite::memory:").await
    }

    /// Create a file-based SQLite database
    pub async fn file(path: &str) -> Result<Self> {
        Self::new(&format!("sqlite://{}", path)).await
    }

    /// Convert SQLite row to QueryRow
    fn convert_row(row: &SqliteRow) -> QueryRow {
        let mut query_row = QueryRow::new();

        for column in row.columns() {
            let column_name = column.name();

            // Check for NULL explicitly first
            if let Ok(Some(value)) = row.try_get::<Option<i64>, _>(column_name) {
                query_row.insert(column_name, Value::Number(value.into()));
            } else if let Ok(Some(value)) = row.try_get::<Option<f64>, _>(column_name) {
                if let Some(num) = serde_json::Number::from_f64(value) {
                    query_row.insert(column_name, Value::Number(num));
                }
            } else if let Ok(Some(value)) = row.try_get::<Option<String>, _>(column_name) {
                query_row.insert(column_name, Value::String(value));
            } else if let Ok(Some(value)) = row.try_get::<Option<bool>, _>(column_name) {
                query_row.insert(column_name, Value::Bool(value));
            } else {
                query_row.insert(column_name, Value::Null);
            }
        }

        query_row
    }

    /// Names of all user tables
    pub async fn list_tables(&mut self) -> Result<Vec<String>> {
        let rows = self
            .query(
                "select name from sqlite_master where type = 'table' and name not like 'sqlite_%' order by name",
                &[],
            )
            .await?;

        Ok(rows.iter().filter_map(|row| row.get_string("name")).collect())
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

fn bind_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &'q Value,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
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

fn prepare<'q>(sql: &'q str, args: &'q [Value]) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    args.iter().fold(sqlx::query(sql), bind_value)
}

#[async_trait]
impl DatabaseBackend for SqliteBackend {
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
}
