use crate::backend::{DatabaseBackend, QueryResult, QueryRow};
use crate::error::{QueryError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;

/// Backend that records every statement and answers queries from a queue of
/// canned results (empty once the queue runs out).
#[derive(Debug, Default)]
pub(crate) struct MockBackend {
    /// Every statement with its arguments, queries included.
    pub statements: Vec<(String, Vec<Value>)>,
    /// Statements sent through `execute`.
    pub executed: Vec<String>,
    pub in_transaction: bool,
    /// Reported by `typed_parameters`.
    pub typed: bool,
    pub(crate) results: VecDeque<QueryResult>,
    pub(crate) fail_on: Option<String>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_result(&mut self, rows: QueryResult) {
        self.results.push_back(rows);
    }

    /// Fail any `execute` whose SQL contains `needle`.
    pub fn fail_on(&mut self, needle: impl Into<String>) {
        self.fail_on = Some(needle.into());
    }

    pub fn row(pairs: &[(&str, Value)]) -> QueryRow {
        pairs.iter().map(|(k, v)| (*k, v.clone())).collect()
    }
}

#[async_trait]
impl DatabaseBackend for MockBackend {
    async fn execute(&mut self, sql: &str, args: &[Value]) -> Result<u64> {
        self.statements.push((sql.to_string(), args.to_vec()));
        if let Some(needle) = &self.fail_on {
            if sql.contains(needle.as_str()) {
                return Err(QueryError::Database(format!("rejected: {}", sql)));
            }
        }
        self.executed.push(sql.to_string());
        Ok(1)
    }

    async fn query(&mut self, sql: &str, args: &[Value]) -> Result<QueryResult> {
        self.statements.push((sql.to_string(), args.to_vec()));
        Ok(self.results.pop_front().unwrap_or_default())
    }

    async fn begin_transaction(&mut self) -> Result<()> {
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.in_transaction = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.in_transaction = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn typed_parameters(&self) -> bool {
        self.typed
    }
}
