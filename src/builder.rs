use crate::assemble::{read_record, Instance, Record};
use crate::backend::{DatabaseBackend, QueryResult};
use crate::error::{QueryError, Result};
use crate::exec::{Fetch, Strategy};
use crate::planner::{self, JoinPlan};
use crate::predicate::{quote, Aliases, FieldRef, Params, Predicate};
use crate::relation::RelationId;
use crate::schema::{ColumnType, EntityId, EntityType, Schema};
use indexmap::IndexMap;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::Value;
use std::fmt;
use std::fmt::Write;
use std::sync::Arc;

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl fmt::Display for SortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortDirection::Asc => write!(f, "asc"),
            SortDirection::Desc => write!(f, "desc"),
        }
    }
}

/// Upsert target for [`Query::create`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnConflict {
    pub columns: Vec<String>,
    /// Columns overwritten on conflict. `None` means every inserted column.
    pub update: Option<Vec<String>>,
}

impl OnConflict {
    pub fn new(columns: Vec<impl Into<String>>) -> Self {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            update: None,
        }
    }

    pub fn update(mut self, columns: Vec<impl Into<String>>) -> Self {
        self.update = Some(columns.into_iter().map(Into::into).collect());
        self
    }
}

/// Query against one entity type
#[derive(Debug, Clone)]
pub struct Query<'s> {
    schema: &'s Schema,
    entity: EntityId,
    predicate: Option<Predicate>,
    joins: Vec<RelationId>,
    order: Option<(Vec<FieldRef>, SortDirection)>,
    limit: Option<usize>,
    strategy: Strategy,
    alias_seed: Option<u64>,
}

impl Schema {
    /// Start a query against the entity registered as `entity`
    pub fn query(&self, entity: &str) -> Result<Query<'_>> {
        Query::new(self, entity)
    }
}

impl<'s> Query<'s> {
    pub fn new(schema: &'s Schema, entity: &str) -> Result<Self> {
        Ok(Self {
            schema,
            entity: schema.entity_named(entity)?.id,
            predicate: None,
            joins: Vec::new(),
            order: None,
            limit: None,
            strategy: Strategy::default(),
            alias_seed: None,
        })
    }

    fn entity(&self) -> &'s EntityType {
        self.schema.entity(self.entity)
    }

    /// Set the WHERE predicate
    pub fn where_clause(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    /// Add an AND predicate to the existing WHERE
    pub fn and_where(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(match self.predicate.take() {
            Some(existing) => existing.and(predicate),
            None => predicate,
        });
        self
    }

    /// Follow a relation; the related instances are attached to the results
    pub fn join(mut self, relation: RelationId) -> Self {
        self.joins.push(relation);
        self
    }

    /// Add ORDER BY over `fields`, all in `direction`
    pub fn order(mut self, fields: Vec<FieldRef>, direction: SortDirection) -> Self {
        self.order = Some((fields, direction));
        self
    }

    /// Set LIMIT. With joins under the single-statement strategy this counts
    /// distinct root instances.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Seed join alias generation, making the generated SQL reproducible.
    pub fn alias_seed(mut self, seed: u64) -> Self {
        self.alias_seed = Some(seed);
        self
    }

    pub fn plan(&self) -> Result<JoinPlan> {
        let mut rng = match self.alias_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        planner::plan(self.schema, self.entity, &self.joins, &mut rng)
    }

    fn fetch<'a>(&'a self, plan: &'a JoinPlan, typed: bool) -> Fetch<'a> {
        Fetch {
            schema: self.schema,
            plan,
            predicate: self.predicate.as_ref(),
            order: self.order.as_ref().map(|(f, d)| (f.as_slice(), *d)),
            limit: self.limit,
            typed,
        }
    }

    /// SQL of the single-statement form of this query, with its arguments.
    pub fn to_sql(&self) -> Result<(String, Vec<Value>)> {
        let plan = self.plan()?;
        self.fetch(&plan, false).joined_sql()
    }

    /// Fetch matching instances with their joined relations
    pub async fn get<B: DatabaseBackend>(&self, backend: &mut B) -> Result<Vec<Arc<Instance>>> {
        let plan = self.plan()?;
        self.fetch(&plan, backend.typed_parameters())
            .run(backend, self.strategy)
            .await
    }

    /// First instance [`get`](Self::get) would return
    pub async fn get_one<B: DatabaseBackend>(
        &self,
        backend: &mut B,
    ) -> Result<Option<Arc<Instance>>> {
        Ok(self.get(backend).await?.into_iter().next())
    }

    fn returning(&self) -> String {
        let entity = self.entity();
        entity
            .fields
            .iter()
            .map(|f| {
                format!(
                    "{} as {}",
                    quote(&f.name),
                    quote(&format!("{}.{}", entity.table, f.name))
                )
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn instances(&self, rows: QueryResult) -> Vec<Arc<Instance>> {
        let entity = self.entity();
        rows.iter()
            .filter_map(|row| read_record(entity, &entity.table, row))
            .map(|fields| {
                Arc::new(Instance {
                    entity: entity.name.clone(),
                    fields,
                    relations: IndexMap::new(),
                })
            })
            .collect()
    }

    fn column_type(&self, column: &str) -> ColumnType {
        self.entity().field(column).map_or(ColumnType::Text, |f| f.ty)
    }

    fn check_columns<'a>(&self, columns: impl IntoIterator<Item = &'a String>) -> Result<()> {
        let entity = self.entity();
        for column in columns {
            if entity.field(column).is_none() {
                return Err(QueryError::shape(format!(
                    "{} has no field {}",
                    entity.name, column
                )));
            }
        }
        Ok(())
    }

    pub fn insert_sql(
        &self,
        records: &[Record],
        on_conflict: Option<&OnConflict>,
    ) -> Result<(String, Vec<Value>)> {
        self.insert_statement(records, on_conflict, Params::default())
    }

    fn insert_statement(
        &self,
        records: &[Record],
        on_conflict: Option<&OnConflict>,
        mut params: Params,
    ) -> Result<(String, Vec<Value>)> {
        let Some(first) = records.first() else {
            return Err(QueryError::shape("insert needs at least one record"));
        };

        let mut columns: Vec<&String> = first.keys().collect();
        columns.sort();
        if columns.is_empty() {
            return Err(QueryError::shape("insert records have no columns"));
        }
        self.check_columns(columns.iter().copied())?;

        let mut tuples = Vec::with_capacity(records.len());
        for record in records {
            if record.len() != columns.len() || columns.iter().any(|c| !record.contains_key(*c)) {
                return Err(QueryError::shape(
                    "insert records must all have the same columns",
                ));
            }
            let placeholders = columns
                .iter()
                .map(|c| params.push(record[*c].clone(), self.column_type(c)))
                .collect::<Vec<_>>()
                .join(", ");
            tuples.push(format!("({})", placeholders));
        }

        let mut sql = format!(
            "insert into {} ({}) values {}",
            quote(&self.entity().table),
            columns.iter().map(|c| quote(c)).collect::<Vec<_>>().join(", "),
            tuples.join(", ")
        );

        if let Some(conflict) = on_conflict {
            self.check_columns(&conflict.columns)?;
            let update: Vec<&String> = match &conflict.update {
                Some(update) => update.iter().collect(),
                None => columns.clone(),
            };
            self.check_columns(update.iter().copied())?;

            write!(
                sql,
                " on conflict ({})",
                conflict.columns.iter().map(|c| quote(c)).collect::<Vec<_>>().join(", ")
            )
            .ok();
            if update.is_empty() {
                sql.push_str(" do nothing");
            } else {
                let sets = update
                    .iter()
                    .map(|c| format!("{} = excluded.{}", quote(c), quote(c)))
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(sql, " do update set {}", sets).ok();
            }
        }

        write!(sql, " returning {}", self.returning()).ok();
        Ok((sql, params.values))
    }

    /// Insert `records`, returning the stored rows (server defaults filled
    /// in). Every record must carry the same columns.
    pub async fn create<B: DatabaseBackend>(
        &self,
        backend: &mut B,
        records: Vec<Record>,
        on_conflict: Option<OnConflict>,
    ) -> Result<Vec<Arc<Instance>>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let params = Params::new(backend.typed_parameters());
        let (sql, args) = self.insert_statement(&records, on_conflict.as_ref(), params)?;
        let rows = backend.query(&sql, &args).await?;
        Ok(self.instances(rows))
    }

    /// Insert a single record
    pub async fn create_one<B: DatabaseBackend>(
        &self,
        backend: &mut B,
        record: Record,
        on_conflict: Option<OnConflict>,
    ) -> Result<Option<Arc<Instance>>> {
        Ok(self
            .create(backend, vec![record], on_conflict)
            .await?
            .into_iter()
            .next())
    }

    fn required_predicate(&self, operation: &str) -> Result<&Predicate> {
        self.predicate.as_ref().ok_or_else(|| {
            QueryError::shape(format!(
                "{} on {} requires a where clause",
                operation,
                self.entity().name
            ))
        })
    }

    pub fn update_sql(&self, values: &Record) -> Result<(String, Vec<Value>)> {
        self.update_statement(values, Params::default())
    }

    fn update_statement(&self, values: &Record, mut params: Params) -> Result<(String, Vec<Value>)> {
        let predicate = self.required_predicate("update")?;
        if values.is_empty() {
            return Err(QueryError::shape("update needs at least one value"));
        }
        self.check_columns(values.keys())?;

        let sets = values
            .iter()
            .map(|(column, value)| {
                let p = params.push(value.clone(), self.column_type(column));
                format!("{} = {}", quote(column), p)
            })
            .collect::<Vec<_>>()
            .join(", ");

        let mut sql = format!("update {} set {} where ", quote(&self.entity().table), sets);
        predicate.write_sql(&Aliases::new(), &mut sql, &mut params)?;
        write!(sql, " returning {}", self.returning()).ok();
        Ok((sql, params.values))
    }

    /// Set `values` on every matching row, returning the updated rows
    pub async fn update<B: DatabaseBackend>(
        &self,
        backend: &mut B,
        values: Record,
    ) -> Result<Vec<Arc<Instance>>> {
        let params = Params::new(backend.typed_parameters());
        let (sql, args) = self.update_statement(&values, params)?;
        let rows = backend.query(&sql, &args).await?;
        Ok(self.instances(rows))
    }

    pub fn delete_sql(&self) -> Result<(String, Vec<Value>)> {
        self.delete_statement(Params::default())
    }

    fn delete_statement(&self, mut params: Params) -> Result<(String, Vec<Value>)> {
        let predicate = self.required_predicate("delete")?;
        let mut sql = format!("delete from {} where ", quote(&self.entity().table));
        predicate.write_sql(&Aliases::new(), &mut sql, &mut params)?;
        Ok((sql, params.values))
    }

    /// Delete every matching row, returning the affected count
    pub async fn delete<B: DatabaseBackend>(&self, backend: &mut B) -> Result<u64> {
        let (sql, args) = self.delete_statement(Params::new(backend.typed_parameters()))?;
        backend.execute(&sql, &args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relation::RelationDecl;
    use crate::schema::{ColumnType, EntityBuilder, FieldDescriptor};
    use crate::testing::MockBackend;
    use serde_json::json;

    fn schema() -> Schema {
        let mut builder = Schema::builder();
        builder
            .register(
                EntityBuilder::new("user")
                    .table("users")
                    .field(FieldDescriptor::new("id", ColumnType::Uuid))
                    .field(FieldDescriptor::new("name", ColumnType::Text))
                    .relation(RelationDecl::has_many("posts", "post.user_id")),
            )
            .unwrap();
        builder
            .register(
                EntityBuilder::new("post")
                    .table("posts")
                    .field(FieldDescriptor::new("id", ColumnType::Uuid))
                    .field(FieldDescriptor::new("user_id", ColumnType::Uuid))
                    .field(FieldDescriptor::new("title", ColumnType::Text)),
            )
            .unwrap();
        builder.build().unwrap()
    }

    fn record(pairs: &[(&str, Value)]) -> Record {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_select_basic() {
        let schema = schema();
        let (sql, args) = schema.query("user").unwrap().to_sql().unwrap();
        assert_eq!(
            sql,
            r#"select "users"."id" as "users.id", "users"."name" as "users.name" from "users""#
        );
        assert!(args.is_empty());
    }

    #[test]
    fn test_select_where_order_limit() {
        let schema = schema();
        let name = schema.field("user", "name").unwrap();
        let id = schema.field("user", "id").unwrap();
        let (sql, args) = schema
            .query("user")
            .unwrap()
            .where_clause(name.eq("Alice"))
            .and_where(id.is_not_null())
            .order(vec![name, id], SortDirection::Desc)
            .limit(10)
            .to_sql()
            .unwrap();

        assert_eq!(
            sql,
            concat!(
                r#"select "users"."id" as "users.id", "users"."name" as "users.name" from "users" "#,
                r#"where ("users"."name" = $1 and "users"."id" is not null) "#,
                r#"order by "users"."name" desc, "users"."id" desc limit 10"#
            )
        );
        assert_eq!(args, vec![json!("Alice")]);
    }

    #[test]
    fn test_seeded_aliases_are_stable() {
        let schema = schema();
        let posts = schema.relation_id("user", "posts").unwrap();
        let query = schema.query("user").unwrap().join(posts).alias_seed(11);

        let (first, _) = query.to_sql().unwrap();
        let (second, _) = query.to_sql().unwrap();
        assert_eq!(first, second);

        let alias = query.plan().unwrap().joins[0].alias.clone();
        assert!(first.contains(&format!(
            r#"left join "posts" as "{a}" on "users"."id" = "{a}"."user_id""#,
            a = alias
        )));
    }

    #[test]
    fn test_insert_many() {
        let schema = schema();
        let records = vec![
            record(&[("name", json!("a")), ("id", json!("u1"))]),
            record(&[("id", json!("u2")), ("name", json!("b"))]),
        ];
        let (sql, args) = schema
            .query("user")
            .unwrap()
            .insert_sql(&records, None)
            .unwrap();

        assert_eq!(
            sql,
            concat!(
                r#"insert into "users" ("id", "name") values ($1, $2), ($3, $4) "#,
                r#"returning "id" as "users.id", "name" as "users.name""#
            )
        );
        assert_eq!(args, vec![json!("u1"), json!("a"), json!("u2"), json!("b")]);
    }

    #[test]
    fn test_insert_on_conflict() {
        let schema = schema();
        let records = vec![record(&[("id", json!("u1")), ("name", json!("a"))])];
        let query = schema.query("user").unwrap();

        let (sql, _) = query
            .insert_sql(&records, Some(&OnConflict::new(vec!["id"])))
            .unwrap();
        assert!(sql.contains(
            r#" on conflict ("id") do update set "id" = excluded."id", "name" = excluded."name" returning"#
        ));

        let (sql, _) = query
            .insert_sql(&records, Some(&OnConflict::new(vec!["id"]).update(vec!["name"])))
            .unwrap();
        assert!(sql.contains(r#" on conflict ("id") do update set "name" = excluded."name" returning"#));
    }

    #[test]
    fn test_insert_mismatched_records() {
        let schema = schema();
        let records = vec![
            record(&[("id", json!("u1")), ("name", json!("a"))]),
            record(&[("id", json!("u2"))]),
        ];
        let err = schema
            .query("user")
            .unwrap()
            .insert_sql(&records, None)
            .unwrap_err();
        assert!(matches!(err, QueryError::Shape(_)));
    }

    #[test]
    fn test_update() {
        let schema = schema();
        let id = schema.field("user", "id").unwrap();
        let (sql, args) = schema
            .query("user")
            .unwrap()
            .where_clause(id.eq("u1"))
            .update_sql(&record(&[("name", json!("Alice"))]))
            .unwrap();

        assert_eq!(
            sql,
            concat!(
                r#"update "users" set "name" = $1 where "users"."id" = $2 "#,
                r#"returning "id" as "users.id", "name" as "users.name""#
            )
        );
        assert_eq!(args, vec![json!("Alice"), json!("u1")]);
    }

    #[test]
    fn test_delete() {
        let schema = schema();
        let id = schema.field("user", "id").unwrap();
        let (sql, args) = schema
            .query("user")
            .unwrap()
            .where_clause(id.eq("u1") | id.eq("u2"))
            .delete_sql()
            .unwrap();

        assert_eq!(
            sql,
            r#"delete from "users" where ("users"."id" = $1 or "users"."id" = $2)"#
        );
        assert_eq!(args, vec![json!("u1"), json!("u2")]);
    }

    #[test]
    fn test_update_and_delete_require_predicate() {
        let schema = schema();
        let query = schema.query("user").unwrap();
        assert!(matches!(query.delete_sql(), Err(QueryError::Shape(_))));
        assert!(matches!(
            query.update_sql(&record(&[("name", json!("x"))])),
            Err(QueryError::Shape(_))
        ));
    }

    #[test]
    fn test_unknown_entity() {
        let schema = schema();
        assert!(matches!(schema.query("nope"), Err(QueryError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_create_empty_skips_round_trip() {
        let schema = schema();
        let mut backend = MockBackend::new();
        let created = schema
            .query("user")
            .unwrap()
            .create(&mut backend, vec![], None)
            .await
            .unwrap();
        assert!(created.is_empty());
        assert!(backend.statements.is_empty());
    }

    #[tokio::test]
    async fn test_create_returns_rows() {
        let schema = schema();
        let mut backend = MockBackend::new();
        backend.push_result(vec![MockBackend::row(&[
            ("users.id", json!("generated")),
            ("users.name", json!("Alice")),
        ])]);

        let created = schema
            .query("user")
            .unwrap()
            .create_one(&mut backend, record(&[("name", json!("Alice"))]), None)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(created.get("id"), Some(&json!("generated")));
        assert_eq!(backend.statements[0].1, vec![json!("Alice")]);
    }

    #[tokio::test]
    async fn test_typed_backend_casts_placeholders() {
        let schema = schema();
        let id = schema.field("user", "id").unwrap();
        let mut backend = MockBackend {
            typed: true,
            ..MockBackend::new()
        };

        let query = schema.query("user").unwrap();
        query
            .create_one(&mut backend, record(&[("id", json!("u1")), ("name", json!("a"))]), None)
            .await
            .unwrap();

        let query = query.where_clause(id.eq("u1"));
        query.update(&mut backend, record(&[("name", json!("b"))])).await.unwrap();
        query.delete(&mut backend).await.unwrap();
        query.get(&mut backend).await.unwrap();

        let sql: Vec<&str> = backend.statements.iter().map(|(sql, _)| sql.as_str()).collect();
        assert!(sql[0].contains(r#"values ($1::uuid, $2::text)"#));
        assert!(sql[1].contains(r#"set "name" = $1::text where "users"."id" = $2::uuid"#));
        assert!(sql[2].ends_with(r#"where "users"."id" = $1::uuid"#));
        assert!(sql[3].ends_with(r#"where "users"."id" = $1::uuid"#));

        // rendered SQL stays untyped
        let (plain, _) = query.delete_sql().unwrap();
        assert!(plain.ends_with("= $1"));
    }

    #[tokio::test]
    async fn test_get_one() {
        let schema = schema();
        let mut backend = MockBackend::new();
        backend.push_result(vec![
            MockBackend::row(&[("users.id", json!("u1")), ("users.name", json!("a"))]),
            MockBackend::row(&[("users.id", json!("u2")), ("users.name", json!("b"))]),
        ]);

        let one = schema
            .query("user")
            .unwrap()
            .get_one(&mut backend)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(one.get("name"), Some(&json!("a")));

        let none = schema
            .query("user")
            .unwrap()
            .get_one(&mut backend)
            .await
            .unwrap();
        assert!(none.is_none());
    }
}
