use crate::error::{QueryError, Result};
use crate::predicate::Aliases;
use crate::relation::{RelationDescriptor, RelationId};
use crate::schema::{EntityId, Schema};
use rand::Rng;
use std::collections::{HashMap, HashSet};

const ALIAS_LEN: usize = 5;
const ALIAS_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// One relation traversal requested by a query, under its own table alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub relation: RelationId,
    pub alias: String,
}

/// Fetch plan for one query.
#[derive(Debug, Clone)]
pub struct JoinPlan {
    pub root: EntityId,
    /// Joins in request order.
    pub joins: Vec<JoinRequest>,
    /// Indexes into `joins`, leaves first. Every join appears after the joins
    /// hanging off its child entity.
    pub order: Vec<usize>,
    /// For each child entity, the joins that reach it.
    pub child_joins: HashMap<EntityId, Vec<usize>>,
    /// Alias of every entity involved; the root is known by its table name.
    /// An entity reached by several joins resolves to the first one.
    pub aliases: Aliases,
    /// Alias of the parent side of each join, parallel to `joins`.
    parent_aliases: Vec<String>,
}

impl JoinPlan {
    pub fn relation<'s>(&self, schema: &'s Schema, join: usize) -> &'s RelationDescriptor {
        schema.relation(self.joins[join].relation)
    }

    pub fn parent_alias(&self, join: usize) -> &str {
        &self.parent_aliases[join]
    }

    pub fn alias_of(&self, join: usize) -> &str {
        &self.joins[join].alias
    }

    /// Joins parents first, the order their child rows can be fetched in.
    pub fn fetch_order(&self) -> impl Iterator<Item = usize> + '_ {
        self.order.iter().rev().copied()
    }

    /// Joins whose parent side is `entity`.
    pub fn joins_from<'a>(
        &'a self,
        schema: &'a Schema,
        entity: EntityId,
    ) -> impl Iterator<Item = usize> + 'a {
        (0..self.joins.len()).filter(move |&j| self.relation(schema, j).owner == entity)
    }
}

/// Plan the joins of a query rooted at `root`.
pub fn plan(
    schema: &Schema,
    root: EntityId,
    relations: &[RelationId],
    rng: &mut impl Rng,
) -> Result<JoinPlan> {
    let mut seen = HashSet::new();
    if let Some(dup) = relations.iter().find(|r| !seen.insert(**r)) {
        let rel = schema.relation(*dup);
        return Err(QueryError::config(format!(
            "Relation {}.{} joined twice",
            schema.entity(rel.owner).name,
            rel.name
        )));
    }

    // parent -> joins, child -> joins
    let mut forward: HashMap<EntityId, Vec<usize>> = HashMap::new();
    let mut reverse: HashMap<EntityId, Vec<usize>> = HashMap::new();
    let mut touched = vec![root];

    for (j, id) in relations.iter().enumerate() {
        let rel = schema.relation(*id);
        let (parent, child) = (rel.parent().entity, rel.child().entity);
        forward.entry(parent).or_default().push(j);
        reverse.entry(child).or_default().push(j);
        for entity in [parent, child] {
            if !touched.contains(&entity) {
                touched.push(entity);
            }
        }
    }

    let roots: Vec<EntityId> = touched
        .iter()
        .copied()
        .filter(|e| !reverse.contains_key(e))
        .collect();

    let describe = |ids: &[EntityId]| {
        ids.iter()
            .map(|e| schema.entity(*e).name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    };

    match roots.as_slice() {
        [only] if *only == root => {}
        [] => {
            return Err(QueryError::config(format!(
                "Join graph around {} has no root; it contains a cycle",
                schema.entity(root).name
            )))
        }
        [only] => {
            return Err(QueryError::config(format!(
                "Join graph is rooted at {}, not at the queried {}",
                schema.entity(*only).name,
                schema.entity(root).name
            )))
        }
        many => {
            return Err(QueryError::config(format!(
                "Join graph has several roots: {}",
                describe(many)
            )))
        }
    }

    for (parent, joins) in &forward {
        let introduced = reverse.get(parent).map_or(0, Vec::len);
        if introduced > 1 {
            let rel = schema.relation(relations[joins[0]]);
            return Err(QueryError::config(format!(
                "Join {}.{} is ambiguous: {} is reached by {} joins",
                schema.entity(*parent).name,
                rel.name,
                schema.entity(*parent).name,
                introduced
            )));
        }
    }

    let mut order = Vec::with_capacity(relations.len());
    let mut on_path = HashSet::new();
    post_order(schema, root, relations, &forward, &mut on_path, &mut order)?;

    if order.len() != relations.len() {
        return Err(QueryError::config(format!(
            "Join graph rooted at {} is not connected",
            schema.entity(root).name
        )));
    }

    let mut taken: HashSet<String> = schema.entities().map(|e| e.table.to_lowercase()).collect();
    let joins: Vec<JoinRequest> = relations
        .iter()
        .map(|id| JoinRequest {
            relation: *id,
            alias: generate_alias(rng, &mut taken),
        })
        .collect();

    let mut aliases = Aliases::new();
    aliases.insert(root, schema.entity(root).table.clone());
    for join in &joins {
        let child = schema.relation(join.relation).child().entity;
        aliases.entry(child).or_insert_with(|| join.alias.clone());
    }

    let parent_aliases = joins
        .iter()
        .map(|join| {
            let parent = schema.relation(join.relation).parent().entity;
            aliases[&parent].clone()
        })
        .collect();

    tracing::trace!(
        root = %schema.entity(root).name,
        order = ?order.iter().map(|j| &schema.relation(relations[*j]).name).collect::<Vec<_>>(),
        "planned joins"
    );

    Ok(JoinPlan {
        root,
        joins,
        order,
        child_joins: reverse,
        aliases,
        parent_aliases,
    })
}

fn post_order(
    schema: &Schema,
    entity: EntityId,
    relations: &[RelationId],
    forward: &HashMap<EntityId, Vec<usize>>,
    on_path: &mut HashSet<EntityId>,
    order: &mut Vec<usize>,
) -> Result<()> {
    if !on_path.insert(entity) {
        return Err(QueryError::config(format!(
            "Join graph contains a cycle through {}",
            schema.entity(entity).name
        )));
    }

    for &j in forward.get(&entity).into_iter().flatten() {
        let child = schema.relation(relations[j]).child().entity;
        post_order(schema, child, relations, forward, on_path, order)?;
        order.push(j);
    }

    on_path.remove(&entity);
    Ok(())
}

/// Five random letters not yet in `taken` (compared case-insensitively).
fn generate_alias(rng: &mut impl Rng, taken: &mut HashSet<String>) -> String {
    loop {
        let alias: String = (0..ALIAS_LEN)
            .map(|_| ALIAS_CHARS[rng.random_range(0..ALIAS_CHARS.len())] as char)
            .collect();
        if taken.insert(alias.to_lowercase()) {
            return alias;
        }
    }
}
