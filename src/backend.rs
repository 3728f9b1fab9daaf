use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

/// Row from a query result, keyed by the (possibly alias-qualified) column
/// label the statement selected it under.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryRow {
    pub columns: HashMap<String, Value>,
}

impl QueryRow {
    pub fn new() -> Self {
        Self {
            columns: HashMap::new(),
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.columns.insert(key.into(), value);
    }

    /// Value stored under `key`. A missing column reads as `None`, the same
    /// as an SQL null.
    pub fn value(&self, key: &str) -> Option<&Value> {
        self.columns.get(key).filter(|v| !v.is_null())
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.columns
            .get(key)
            .and_then(|v| v.as_str().map(String::from))
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.columns.get(key).and_then(|v| v.as_i64())
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for QueryRow {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        Self {
            columns: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

/// Result of a query
pub type QueryResult = Vec<QueryRow>;

/// Database backend trait
///
/// Arguments are bound positionally to `$1..$n` placeholders; they are never
/// interpolated into the statement text.
#[async_trait]
pub trait DatabaseBackend: Send + Sync {
    /// Execute a SQL statement (no results)
    async fn execute(&mut self, sql: &str, args: &[Value]) -> Result<u64>;

    /// Query and return results
    async fn query(&mut self, sql: &str, args: &[Value]) -> Result<QueryResult>;

    /// Begin a transaction
    async fn begin_transaction(&mut self) -> Result<()>;

    /// Commit the current transaction
    async fn commit(&mut self) -> Result<()>;

    /// Rollback the current transaction
    async fn rollback(&mut self) -> Result<()>;

    /// Check if connected
    fn is_connected(&self) -> bool;

    /// Whether statements should cast each placeholder to its column type
    /// (`$1::uuid`). Servers that type parameters strictly need this, since
    /// every string argument is bound as text.
    fn typed_parameters(&self) -> bool {
        false
    }
}

/// Transaction guard. End it with `commit` or `rollback`; dropping the guard
/// leaves the transaction open on the backend.
pub struct Transaction<'a, B: DatabaseBackend> {
    backend: &'a mut B,
}

impl<'a, B: DatabaseBackend> Transaction<'a, B> {
    pub async fn new(backend: &'a mut B) -> Result<Self> {
        backend.begin_transaction().await?;
        Ok(Self { backend })
    }

    pub async fn commit(self) -> Result<()> {
        self.backend.commit().await
    }

    pub async fn rollback(self) -> Result<()> {
        self.backend.rollback().await
    }

    /// The backend, for running queries inside the transaction.
    pub fn backend(&mut self) -> &mut B {
        self.backend
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockBackend;
    use serde_json::json;

    #[test]
    fn test_row_null_reads_as_missing() {
        let row: QueryRow = [("a", json!(1)), ("b", Value::Null)].into_iter().collect();
        assert_eq!(row.value("a"), Some(&json!(1)));
        assert_eq!(row.value("b"), None);
        assert_eq!(row.value("c"), None);
        assert_eq!(row.get_i64("a"), Some(1));
        assert_eq!(row.get_string("a"), None);
    }

    #[tokio::test]
    async fn test_transaction_commit() {
        let mut backend = MockBackend::new();
        let mut tx = Transaction::new(&mut backend).await.unwrap();
        assert!(tx.backend().in_transaction);
        tx.backend().execute("delete from t", &[]).await.unwrap();
        tx.commit().await.unwrap();

        assert!(!backend.in_transaction);
        assert_eq!(backend.executed, vec!["delete from t"]);
    }

    #[tokio::test]
    async fn test_transaction_rollback() {
        let mut backend = MockBackend::new();
        let tx = Transaction::new(&mut backend).await.unwrap();
        tx.rollback().await.unwrap();
        assert!(!backend.in_transaction);
    }
}
