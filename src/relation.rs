use crate::error::{QueryError, Result};
use crate::schema::{EntityId, Schema};
use std::fmt;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelationId(pub usize);

/// Relationship shape between two entity types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    /// Many-to-one. The owner holds the foreign key.
    BelongsTo,
    /// One-to-many. The target holds the foreign key.
    HasMany,
    /// One-to-one. The target holds the foreign key.
    HasOne,
}

impl Cardinality {
    pub fn is_many(&self) -> bool {
        matches!(self, Cardinality::HasMany)
    }
}

impl fmt::Display for Cardinality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cardinality::BelongsTo => write!(f, "belongs_to"),
            Cardinality::HasMany => write!(f, "has_many"),
            Cardinality::HasOne => write!(f, "has_one"),
        }
    }
}

/// Unresolved reference to `entity.column`; a bare `entity` means its
/// identity column. Resolution happens when the schema is built, so the
/// referenced entity may be registered after the one declaring the relation.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ColumnPath {
    entity: String,
    column: Option<String>,
}

impl ColumnPath {
    fn parse(path: &str) -> Self {
        match path.split_once('.') {
            Some((entity, column)) => Self {
                entity: entity.to_string(),
                column: Some(column.to_string()),
            },
            None => Self {
                entity: path.to_string(),
                column: None,
            },
        }
    }

    fn resolve(&self, schema: &Schema) -> Result<Endpoint> {
        let entity = schema.entity_named(&self.entity)?;
        let column = self.column.as_ref().unwrap_or(&entity.identity);

        if entity.field(column).is_none() {
            return Err(QueryError::config(format!(
                "Relation endpoint {}.{} is not a declared field",
                entity.name, column
            )));
        }

        Ok(Endpoint {
            entity: entity.id,
            column: column.clone(),
        })
    }
}

/// Declared form of a relation, attached to its owner through
/// [`EntityBuilder::relation`](crate::schema::EntityBuilder::relation).
#[derive(Debug, Clone)]
pub struct RelationDecl {
    name: String,
    cardinality: Cardinality,
    foreign_key: ColumnPath,
    referenced: Option<ColumnPath>,
    parent_id: Option<String>,
    child_id: Option<String>,
}

impl RelationDecl {
    fn new(name: impl Into<String>, cardinality: Cardinality, foreign_key: &str) -> Self {
        Self {
            name: name.into(),
            cardinality,
            foreign_key: ColumnPath::parse(foreign_key),
            referenced: None,
            parent_id: None,
            child_id: None,
        }
    }

    /// `foreign_key` is `owner.column`, `target` is `entity` or
    /// `entity.column`.
    pub fn belongs_to(name: impl Into<String>, foreign_key: &str, target: &str) -> Self {
        Self::new(name, Cardinality::BelongsTo, foreign_key).referencing(target)
    }

    /// `foreign_key` is `target.column`; it references the owner's identity
    /// unless [`referencing`](Self::referencing) says otherwise.
    pub fn has_many(name: impl Into<String>, foreign_key: &str) -> Self {
        Self::new(name, Cardinality::HasMany, foreign_key)
    }

    pub fn has_one(name: impl Into<String>, foreign_key: &str) -> Self {
        Self::new(name, Cardinality::HasOne, foreign_key)
    }

    /// Column the foreign key points at.
    pub fn referencing(mut self, path: &str) -> Self {
        self.referenced = Some(ColumnPath::parse(path));
        self
    }

    /// Column identifying parent instances when grouping children.
    pub fn parent_id(mut self, column: impl Into<String>) -> Self {
        self.parent_id = Some(column.into());
        self
    }

    /// Column identifying child instances when deduplicating them.
    pub fn child_id(mut self, column: impl Into<String>) -> Self {
        self.child_id = Some(column.into());
        self
    }

    pub(crate) fn resolve(
        self,
        id: RelationId,
        owner: EntityId,
        schema: &Schema,
    ) -> Result<RelationDescriptor> {
        let owner_entity = schema.entity(owner);
        let foreign_key = self.foreign_key.resolve(schema)?;

        let (parent, child) = match self.cardinality {
            Cardinality::BelongsTo => {
                let referenced = self.referenced.as_ref().ok_or_else(|| {
                    QueryError::config(format!(
                        "Relation {}.{} has no target",
                        owner_entity.name, self.name
                    ))
                })?;
                (foreign_key, referenced.resolve(schema)?)
            }
            Cardinality::HasMany | Cardinality::HasOne => {
                let referenced = match &self.referenced {
                    Some(path) => path.resolve(schema)?,
                    None => Endpoint {
                        entity: owner,
                        column: owner_entity.identity.clone(),
                    },
                };
                (referenced, foreign_key)
            }
        };

        if parent.entity != owner {
            return Err(QueryError::config(format!(
                "Relation {}.{} ({}) does not start at {}",
                owner_entity.name, self.name, self.cardinality, owner_entity.name
            )));
        }

        let parent_id = self
            .parent_id
            .unwrap_or_else(|| schema.entity(parent.entity).identity.clone());
        let child_id = self
            .child_id
            .unwrap_or_else(|| schema.entity(child.entity).identity.clone());

        for (endpoint, column) in [(&parent, &parent_id), (&child, &child_id)] {
            let entity = schema.entity(endpoint.entity);
            if entity.field(column).is_none() {
                return Err(QueryError::config(format!(
                    "Relation {}.{} dedup column {}.{} is not a declared field",
                    owner_entity.name, self.name, entity.name, column
                )));
            }
        }

        Ok(RelationDescriptor {
            id,
            name: self.name,
            cardinality: self.cardinality,
            owner,
            parent,
            child,
            parent_id,
            child_id,
        })
    }
}

/// Resolved (entity, column) side of a relation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub entity: EntityId,
    pub column: String,
}

/// A resolved relation. The parent is always the owner, the instance that
/// receives the relation attribute; the child is the joined entity.
#[derive(Debug, Clone)]
pub struct RelationDescriptor {
    pub id: RelationId,
    pub name: String,
    pub cardinality: Cardinality,
    pub owner: EntityId,
    parent: Endpoint,
    child: Endpoint,
    parent_id: String,
    child_id: String,
}

impl RelationDescriptor {
    pub fn parent(&self) -> &Endpoint {
        &self.parent
    }

    pub fn child(&self) -> &Endpoint {
        &self.child
    }

    pub fn parent_id(&self) -> &str {
        &self.parent_id
    }

    pub fn child_id(&self) -> &str {
        &self.child_id
    }
}
