use crate::assemble::{read_record, Instance, Staging};
use crate::backend::DatabaseBackend;
use crate::builder::SortDirection;
use crate::error::Result;
use crate::planner::JoinPlan;
use crate::predicate::{quote, FieldRef, Params, Predicate};
use crate::schema::{ColumnType, EntityId, EntityType, Schema};
use indexmap::IndexMap;
use serde_json::Value;
use std::collections::HashSet;
use std::fmt::Write;
use std::sync::Arc;

/// How a query with joins is turned into statements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// One `select` with a `left join` per relation.
    #[default]
    SingleStatement,
    /// One `select` per level, children fetched by `in (...)` over the
    /// parent values already in hand.
    PerLevel,
}

/// Everything a fetch needs besides the backend.
pub(crate) struct Fetch<'a> {
    pub schema: &'a Schema,
    pub plan: &'a JoinPlan,
    pub predicate: Option<&'a Predicate>,
    pub order: Option<(&'a [FieldRef], SortDirection)>,
    pub limit: Option<usize>,
    /// Render `$n::type` placeholders.
    pub typed: bool,
}

/// `"alias"."col" as "alias.col"` for every field of `entity`.
pub(crate) fn select_list(entity: &EntityType, alias: &str) -> Vec<String> {
    entity
        .fields
        .iter()
        .map(|field| {
            format!(
                "{}.{} as {}",
                quote(alias),
                quote(&field.name),
                quote(&format!("{}.{}", alias, field.name))
            )
        })
        .collect()
}

impl<'a> Fetch<'a> {
    fn root(&self) -> &'a EntityType {
        self.schema.entity(self.plan.root)
    }

    fn params(&self) -> Params {
        Params::new(self.typed)
    }

    /// Whether the predicate or the order names a joined entity, so the
    /// per-level fetches must go through the joins too.
    pub(crate) fn filters_joined(&self) -> bool {
        let root = self.plan.root;
        let in_predicate = self
            .predicate
            .is_some_and(|p| p.fields().iter().any(|f| f.entity != root));
        let in_order = self
            .order
            .is_some_and(|(fields, _)| fields.iter().any(|f| f.entity != root));
        in_predicate || in_order
    }

    /// ` left join ...` for every join, parents before children.
    fn join_clauses(&self) -> String {
        let mut joins = String::new();
        for j in self.plan.fetch_order() {
            let relation = self.plan.relation(self.schema, j);
            let child = self.schema.entity(relation.child().entity);
            let alias = self.plan.alias_of(j);
            write!(
                joins,
                " left join {} as {} on {}.{} = {}.{}",
                quote(&child.table),
                quote(alias),
                quote(self.plan.parent_alias(j)),
                quote(&relation.parent().column),
                quote(alias),
                quote(&relation.child().column)
            )
            .ok();
        }
        joins
    }

    fn write_where(&self, sql: &mut String, params: &mut Params) -> Result<()> {
        if let Some(predicate) = self.predicate {
            sql.push_str(" where ");
            predicate.write_sql(&self.plan.aliases, sql, params)?;
        }
        Ok(())
    }

    fn write_order(&self, sql: &mut String) {
        if let Some((fields, direction)) = self.order {
            if !fields.is_empty() {
                let terms = fields
                    .iter()
                    .map(|f| format!("{} {}", f.qualified(&self.plan.aliases), direction))
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(sql, " order by {}", terms).ok();
            }
        }
    }

    fn write_limit(&self, sql: &mut String) {
        if let Some(limit) = self.limit {
            write!(sql, " limit {}", limit).ok();
        }
    }

    /// The one statement of the single-statement strategy.
    pub(crate) fn joined_sql(&self) -> Result<(String, Vec<Value>)> {
        let root = self.root();
        let mut columns = select_list(root, &root.table);
        for j in self.plan.fetch_order() {
            let child = self.plan.relation(self.schema, j).child().entity;
            columns.extend(select_list(self.schema.entity(child), self.plan.alias_of(j)));
        }

        let mut sql = format!(
            "select {} from {}{}",
            columns.join(", "),
            quote(&root.table),
            self.join_clauses()
        );
        let mut params = self.params();
        self.write_where(&mut sql, &mut params)?;
        self.write_order(&mut sql);
        if self.plan.joins.is_empty() {
            self.write_limit(&mut sql);
        }
        Ok((sql, params.values))
    }

    /// Root fetch of the per-level strategy. With `through_joins` the root
    /// rows come from the joined statement and repeat; the limit is applied
    /// after they fold.
    pub(crate) fn root_sql(&self, through_joins: bool) -> Result<(String, Vec<Value>)> {
        let root = self.root();
        let joins = if through_joins {
            self.join_clauses()
        } else {
            String::new()
        };
        let mut sql = format!(
            "select {} from {}{}",
            select_list(root, &root.table).join(", "),
            quote(&root.table),
            joins
        );
        let mut params = self.params();
        self.write_where(&mut sql, &mut params)?;
        self.write_order(&mut sql);
        if !through_joins {
            self.write_limit(&mut sql);
        }
        Ok((sql, params.values))
    }

    fn column_type(&self, entity: EntityId, column: &str) -> ColumnType {
        self.schema
            .entity(entity)
            .field(column)
            .map_or(ColumnType::Text, |f| f.ty)
    }

    /// Batched fetch of the children of `join` whose join column is one of
    /// `values`. With `through_joins` the children are read from the joined
    /// statement, so the predicate and order apply to them as well.
    pub(crate) fn child_sql(
        &self,
        join: usize,
        values: Vec<Value>,
        through_joins: bool,
    ) -> Result<(String, Vec<Value>)> {
        let relation = self.plan.relation(self.schema, join);
        let child = self.schema.entity(relation.child().entity);
        let alias = self.plan.alias_of(join);
        let ty = self.column_type(child.id, &relation.child().column);
        let column = format!("{}.{}", quote(alias), quote(&relation.child().column));
        let mut params = self.params();

        if !through_joins {
            let placeholders = values
                .into_iter()
                .map(|v| params.push(v, ty))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "select {} from {} as {} where {} in ({})",
                select_list(child, alias).join(", "),
                quote(&child.table),
                quote(alias),
                column,
                placeholders
            );
            return Ok((sql, params.values));
        }

        let mut sql = format!(
            "select {} from {}{}",
            select_list(child, alias).join(", "),
            quote(&self.root().table),
            self.join_clauses()
        );
        self.write_where(&mut sql, &mut params)?;
        let placeholders = values
            .into_iter()
            .map(|v| params.push(v, ty))
            .collect::<Vec<_>>()
            .join(", ");
        let keyword = if self.predicate.is_some() { "and" } else { "where" };
        write!(sql, " {} {} in ({})", keyword, column, placeholders).ok();
        self.write_order(&mut sql);
        Ok((sql, params.values))
    }

    pub(crate) async fn run<B: DatabaseBackend>(
        &self,
        backend: &mut B,
        strategy: Strategy,
    ) -> Result<Vec<Arc<Instance>>> {
        tracing::trace!(
            entity = %self.root().name,
            ?strategy,
            joins = self.plan.joins.len(),
            "fetching"
        );

        match strategy {
            Strategy::SingleStatement => self.single_statement(backend).await,
            Strategy::PerLevel => self.per_level(backend).await,
        }
    }

    async fn single_statement<B: DatabaseBackend>(
        &self,
        backend: &mut B,
    ) -> Result<Vec<Arc<Instance>>> {
        let (sql, args) = self.joined_sql()?;
        let rows = backend.query(&sql, &args).await?;

        let root = self.root();
        let mut staging = Staging::new(self.schema, self.plan);
        for row in &rows {
            let Some(record) = read_record(root, &root.table, row) else {
                continue;
            };
            staging.add_root(record);

            for &j in &self.plan.order {
                let relation = self.plan.relation(self.schema, j);
                let child = self.schema.entity(relation.child().entity);
                let Some(record) = read_record(child, self.plan.alias_of(j), row) else {
                    continue;
                };
                let parent_key = format!("{}.{}", self.plan.parent_alias(j), relation.parent_id());
                if let Some(parent_value) = row.value(&parent_key) {
                    staging.link(j, parent_value, record);
                }
            }
        }

        if !self.plan.joins.is_empty() {
            if let Some(limit) = self.limit {
                staging.truncate_roots(limit);
            }
        }

        Ok(staging.assemble())
    }

    async fn per_level<B: DatabaseBackend>(&self, backend: &mut B) -> Result<Vec<Arc<Instance>>> {
        let root = self.root();
        let through_joins = self.filters_joined();
        let (sql, args) = self.root_sql(through_joins)?;
        let rows = backend.query(&sql, &args).await?;

        let mut staging = Staging::new(self.schema, self.plan);
        for row in &rows {
            if let Some(record) = read_record(root, &root.table, row) {
                staging.add_root(record);
            }
        }
        if through_joins {
            if let Some(limit) = self.limit {
                staging.limit_roots(limit);
            }
        }

        for j in self.plan.fetch_order() {
            let relation = self.plan.relation(self.schema, j);
            let parent = relation.parent();
            let child = self.schema.entity(relation.child().entity);

            // (join value, parent dedup value) of every staged parent
            let parents: Vec<(Value, Value)> = staging
                .records_of(parent.entity)
                .filter_map(|record| {
                    let value = record.get(&parent.column).filter(|v| !v.is_null())?;
                    let id = record.get(relation.parent_id()).cloned().unwrap_or(Value::Null);
                    Some((value.clone(), id))
                })
                .collect();

            let mut seen = HashSet::new();
            let values: Vec<Value> = parents
                .iter()
                .filter(|(value, _)| seen.insert(value.to_string()))
                .map(|(value, _)| value.clone())
                .collect();

            if values.is_empty() {
                tracing::trace!(relation = %relation.name, "no parent values, skipping fetch");
                continue;
            }

            let (sql, args) = self.child_sql(j, values, through_joins)?;
            let rows = backend.query(&sql, &args).await?;

            let mut by_value: IndexMap<String, Vec<_>> = IndexMap::new();
            for row in &rows {
                if let Some(record) = read_record(child, self.plan.alias_of(j), row) {
                    let value = record
                        .get(&relation.child().column)
                        .cloned()
                        .unwrap_or(Value::Null);
                    by_value.entry(value.to_string()).or_default().push(record);
                }
            }

            for (value, parent_id) in &parents {
                for record in by_value.get(&value.to_string()).into_iter().flatten() {
                    staging.link(j, parent_id, record.clone());
                }
            }
        }

        Ok(staging.assemble())
    }
}
