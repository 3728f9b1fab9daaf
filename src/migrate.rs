//! Schema reconciliation against the PostgreSQL catalog.
//!
//! Declared entity metadata is compared with what `information_schema` and
//! `pg_indexes` report, and the difference is expressed as DDL. Running the
//! statements and reconciling again yields no statements.

use crate::backend::{DatabaseBackend, QueryRow};
use crate::error::{QueryError, Result};
use crate::predicate::quote;
use crate::schema::{ColumnType, EntityType, FieldDescriptor, IndexDescriptor, Schema};
use serde_json::Value;

const COLUMNS_SQL: &str = "select column_name::text as column_name, data_type::text as data_type, \
     character_maximum_length::integer as character_maximum_length, \
     column_default::text as column_default, is_nullable::text as is_nullable \
     from information_schema.columns where table_name::text = $1 order by ordinal_position";

const PRIMARY_KEY_SQL: &str = "select tablename::text as tablename, indexname::text as indexname, \
     indexdef::text as indexdef from pg_indexes \
     where tablename::text = $1 and indexname like '%_pkey'";

const INDEXES_SQL: &str = "select tablename::text as tablename, indexname::text as indexname, \
     indexdef::text as indexdef from pg_indexes \
     where tablename::text = $1 and indexname not like '%_pkey' order by indexname";

const TABLES_SQL: &str =
    "select tablename::text as tablename from pg_tables where schemaname = 'public' order by tablename";

/// A column as the catalog reports it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveColumn {
    pub name: String,
    pub data_type: String,
    pub length: Option<i64>,
    pub default: Option<String>,
    pub nullable: bool,
}

impl LiveColumn {
    fn from_row(row: &QueryRow) -> Self {
        Self {
            name: row.get_string("column_name").unwrap_or_default(),
            data_type: row.get_string("data_type").unwrap_or_default(),
            length: row.get_i64("character_maximum_length"),
            default: row.get_string("column_default"),
            nullable: row.get_string("is_nullable").as_deref() == Some("YES"),
        }
    }

    fn matches(&self, field: &FieldDescriptor) -> bool {
        self.data_type == field.ty.to_sql()
            && self.length == field.length
            && self.default == field.default
            && self.nullable == field.nullable
    }
}

/// An index as `pg_indexes` reports it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveIndex {
    pub name: String,
    pub definition: String,
}

impl LiveIndex {
    fn from_row(row: &QueryRow) -> Self {
        Self {
            name: row.get_string("indexname").unwrap_or_default(),
            definition: row.get_string("indexdef").unwrap_or_default(),
        }
    }

    /// Columns of the last parenthesized list in the definition.
    fn columns(&self) -> Vec<String> {
        let Some(open) = self.definition.rfind('(') else {
            return Vec::new();
        };
        let rest = &self.definition[open + 1..];
        let inner = rest.split(')').next().unwrap_or(rest);
        inner
            .split(',')
            .map(|c| c.trim().trim_matches('"').to_string())
            .filter(|c| !c.is_empty())
            .collect()
    }
}

/// Catalog state of one table. A table with no columns does not exist.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveTable {
    pub columns: Vec<LiveColumn>,
    pub primary_key: Option<LiveIndex>,
    pub indexes: Vec<LiveIndex>,
}

impl LiveTable {
    pub fn exists(&self) -> bool {
        !self.columns.is_empty()
    }

    fn column(&self, name: &str) -> Option<&LiveColumn> {
        self.columns.iter().find(|c| c.name == name)
    }

    fn index(&self, name: &str) -> Option<&LiveIndex> {
        self.indexes.iter().find(|i| i.name == name)
    }
}

/// Read the catalog state of `table`.
pub async fn introspect<B: DatabaseBackend>(backend: &mut B, table: &str) -> Result<LiveTable> {
    let args = [Value::String(table.to_string())];

    let columns = backend.query(COLUMNS_SQL, &args).await?;
    let primary_key = backend.query(PRIMARY_KEY_SQL, &args).await?;
    let indexes = backend.query(INDEXES_SQL, &args).await?;

    Ok(LiveTable {
        columns: columns.iter().map(LiveColumn::from_row).collect(),
        primary_key: primary_key.first().map(LiveIndex::from_row),
        indexes: indexes.iter().map(LiveIndex::from_row).collect(),
    })
}

fn column_type(field: &FieldDescriptor) -> String {
    match field.length {
        Some(length) => format!("{} ({})", field.ty.to_sql(), length),
        None => field.ty.to_sql().to_string(),
    }
}

/// Nullability and default statements that follow an add or a type change.
fn constraint_statements(table: &str, field: &FieldDescriptor) -> [String; 2] {
    let alter = format!("alter table {} alter column {}", quote(table), quote(&field.name));
    let nullable = if field.nullable {
        format!("{} drop not null", alter)
    } else {
        format!("{} set not null", alter)
    };
    let default = match &field.default {
        Some(expr) => format!("{} set default {}", alter, expr),
        None => format!("{} drop default", alter),
    };
    [nullable, default]
}

fn alter_column(table: &str, field: &FieldDescriptor) -> Vec<String> {
    let mut statement = format!(
        "alter table {} alter column {} type {}",
        quote(table),
        quote(&field.name),
        column_type(field)
    );
    if field.ty == ColumnType::Uuid {
        statement.push_str(&format!(" using {}::uuid", quote(&field.name)));
    }

    let mut statements = vec![statement];
    statements.extend(constraint_statements(table, field));
    statements
}

fn add_column(table: &str, field: &FieldDescriptor) -> Vec<String> {
    let mut statements = vec![format!(
        "alter table {} add column {} {}",
        quote(table),
        quote(&field.name),
        column_type(field)
    )];
    statements.extend(constraint_statements(table, field));
    statements
}

/// Fields in the order new columns are added: identity, then the first
/// timestamp, then the rest as declared.
fn add_order(entity: &EntityType) -> Vec<&FieldDescriptor> {
    let mut fields: Vec<&FieldDescriptor> = entity.fields.iter().collect();

    if let Some(pos) = fields.iter().position(|f| f.name == entity.identity) {
        let identity = fields.remove(pos);
        fields.insert(0, identity);
    }
    if let Some(pos) = fields
        .iter()
        .skip(1)
        .position(|f| f.ty == ColumnType::Timestamp)
    {
        let timestamp = fields.remove(pos + 1);
        fields.insert(1, timestamp);
    }

    fields
}

/// `field` as the catalog reports it once applied. Primary key columns are
/// always not null.
fn applied_field(entity: &EntityType, field: &FieldDescriptor) -> FieldDescriptor {
    let mut field = field.clone();
    if entity
        .primary_key()
        .is_some_and(|pk| pk.columns.contains(&field.name))
    {
        field.nullable = false;
    }
    field
}

/// Column DDL bringing `live` in line with `entity`.
pub fn column_statements(entity: &EntityType, live: &LiveTable) -> Vec<String> {
    let table = entity.table.as_str();
    let mut statements = Vec::new();

    if !live.exists() {
        statements.push(format!("create table {} ()", quote(table)));
    }

    for column in &live.columns {
        if let Some(field) = entity.field(&column.name) {
            let field = applied_field(entity, field);
            if !column.matches(&field) {
                statements.extend(alter_column(table, &field));
            }
        }
    }

    for column in &live.columns {
        if entity.field(&column.name).is_none() {
            statements.push(format!(
                "alter table {} drop column {}",
                quote(table),
                quote(&column.name)
            ));
        }
    }

    for field in add_order(entity) {
        if live.column(&field.name).is_none() {
            statements.extend(add_column(table, &applied_field(entity, field)));
        }
    }

    statements
}

fn create_index(table: &str, index: &IndexDescriptor) -> String {
    format!(
        "create {}index {} on {} using btree ({})",
        if index.unique { "unique " } else { "" },
        quote(&index.qualified_name(table)),
        quote(table),
        index.columns.iter().map(|c| quote(c)).collect::<Vec<_>>().join(", ")
    )
}

/// Lowercased, unquoted definition without a schema on the indexed table.
fn normalize_definition(definition: &str) -> String {
    let lowered = definition.to_lowercase().replace('"', "");
    match lowered.split_once(" on ") {
        Some((head, tail)) => {
            let tail = match tail.split_once(' ') {
                Some((target, rest)) => {
                    let target = target.rsplit('.').next().unwrap_or(target);
                    format!("{} {}", target, rest)
                }
                None => tail.to_string(),
            };
            format!("{} on {}", head, tail)
        }
        None => lowered,
    }
}

/// Primary key and secondary index DDL bringing `live` in line with `entity`.
pub fn index_statements(entity: &EntityType, live: &LiveTable) -> Vec<String> {
    let table = entity.table.as_str();
    let mut statements = Vec::new();

    let drop_pkey = format!(
        "alter table {} drop constraint if exists {}",
        quote(table),
        quote(&format!("{}_pkey", table))
    );
    let declared_pkey = entity.primary_key();
    match (&live.primary_key, declared_pkey) {
        (Some(_), None) => statements.push(drop_pkey),
        (None, Some(declared)) => statements.push(add_primary_key(table, declared)),
        (Some(existing), Some(declared)) if existing.columns() != declared.columns => {
            statements.push(drop_pkey);
            statements.push(add_primary_key(table, declared));
        }
        _ => {}
    }

    let declared: Vec<&IndexDescriptor> = entity.indexes.iter().filter(|i| !i.primary_key).collect();
    let declared_named = |name: &str| {
        declared
            .iter()
            .copied()
            .find(|i| i.qualified_name(table) == name)
    };

    for existing in &live.indexes {
        if let Some(index) = declared_named(&existing.name) {
            let wanted = create_index(table, index);
            if normalize_definition(&wanted) != normalize_definition(&existing.definition) {
                statements.push(format!("drop index {}", quote(&existing.name)));
                statements.push(wanted);
            }
        }
    }

    for existing in &live.indexes {
        if declared_named(&existing.name).is_none() {
            statements.push(format!("drop index {}", quote(&existing.name)));
        }
    }

    for index in &declared {
        if live.index(&index.qualified_name(table)).is_none() {
            statements.push(create_index(table, index));
        }
    }

    statements
}

fn add_primary_key(table: &str, index: &IndexDescriptor) -> String {
    format!(
        "alter table {} add primary key ({})",
        quote(table),
        index.columns.iter().map(|c| quote(c)).collect::<Vec<_>>().join(", ")
    )
}

async fn apply<B: DatabaseBackend>(backend: &mut B, statements: &[String]) -> Result<()> {
    for statement in statements {
        backend
            .execute(statement, &[])
            .await
            .map_err(|e| QueryError::Migration(format!("{}: {}", statement, e)))?;
        tracing::info!(sql = %statement, "applied");
    }
    tracing::info!(count = statements.len(), "migration applied");
    Ok(())
}

/// Diff every entity in `schema` against the live catalog. Column
/// statements for all entities come first, then index statements. With
/// `execute` set the statements are applied in order and the first failure
/// is returned; statements already applied stay applied.
pub async fn migrate<B: DatabaseBackend>(
    backend: &mut B,
    schema: &Schema,
    execute: bool,
) -> Result<Vec<String>> {
    let mut columns = Vec::new();
    let mut indexes = Vec::new();

    for entity in schema.entities() {
        let live = introspect(backend, &entity.table).await?;
        columns.extend(column_statements(entity, &live));
        indexes.extend(index_statements(entity, &live));
    }

    let mut statements = columns;
    statements.extend(indexes);
    tracing::debug!(count = statements.len(), execute, "reconciled schema");

    if execute && !statements.is_empty() {
        apply(backend, &statements).await?;
    }

    Ok(statements)
}

/// Drop every table in the `public` schema. Destroys all data.
pub async fn drop_all_tables<B: DatabaseBackend>(
    backend: &mut B,
    execute: bool,
) -> Result<Vec<String>> {
    let tables = backend.query(TABLES_SQL, &[]).await?;
    let statements: Vec<String> = tables
        .iter()
        .filter_map(|row| row.get_string("tablename"))
        .map(|table| format!("drop table {}", quote(&table)))
        .collect();

    if execute && !statements.is_empty() {
        apply(backend, &statements).await?;
    }

    Ok(statements)
}
