use crate::error::{QueryError, Result};
use crate::predicate::FieldRef;
use crate::relation::{RelationDecl, RelationDescriptor, RelationId};
use std::collections::{HashMap, HashSet};

/// Column types understood by the reconciler, spelled the way the catalog
/// reports them in `information_schema.columns.data_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    BigInt,
    Boolean,
    Integer,
    Numeric,
    Text,
    Timestamp,
    Uuid,
    Varchar,
}

impl ColumnType {
    pub fn to_sql(&self) -> &'static str {
        match self {
            ColumnType::BigInt => "bigint",
            ColumnType::Boolean => "boolean",
            ColumnType::Integer => "integer",
            ColumnType::Numeric => "numeric",
            ColumnType::Text => "text",
            ColumnType::Timestamp => "timestamp without time zone",
            ColumnType::Uuid => "uuid",
            ColumnType::Varchar => "character varying",
        }
    }

    /// Type name for a `$n::type` parameter cast.
    pub fn cast_name(&self) -> &'static str {
        match self {
            ColumnType::Timestamp => "timestamp",
            ColumnType::Varchar => "varchar",
            other => other.to_sql(),
        }
    }

    /// Default expression a new field of this type starts with.
    fn implicit_default(&self) -> Option<&'static str> {
        match self {
            ColumnType::Timestamp => Some("now()"),
            ColumnType::Uuid => Some("uuid_generate_v1mc()"),
            _ => None,
        }
    }
}

/// One declared column
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: String,
    pub ty: ColumnType,
    pub nullable: bool,
    pub default: Option<String>,
    pub length: Option<i64>,
}

impl FieldDescriptor {
    /// A nullable field with the type's implicit default (`now()` for
    /// timestamps, `uuid_generate_v1mc()` for uuids, none otherwise).
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
            nullable: true,
            default: ty.implicit_default().map(String::from),
            length: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn default(mut self, expr: impl Into<String>) -> Self {
        self.default = Some(expr.into());
        self
    }

    pub fn no_default(mut self) -> Self {
        self.default = None;
        self
    }

    pub fn length(mut self, length: i64) -> Self {
        self.length = Some(length);
        self
    }
}

/// One declared index. The catalog name is derived as `<table>__<name>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDescriptor {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
    pub primary_key: bool,
}

impl IndexDescriptor {
    pub fn new(name: impl Into<String>, columns: Vec<impl Into<String>>) -> Self {
        Self {
            name: name.into(),
            columns: columns.into_iter().map(Into::into).collect(),
            unique: false,
            primary_key: false,
        }
    }

    pub fn primary_key(name: impl Into<String>, columns: Vec<impl Into<String>>) -> Self {
        Self {
            primary_key: true,
            ..Self::new(name, columns)
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn qualified_name(&self, table: &str) -> String {
        format!("{}__{}", table, self.name)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(pub usize);

/// A registered entity type: one table, its ordered field table, indexes and
/// the relations declared on it.
#[derive(Debug, Clone)]
pub struct EntityType {
    pub id: EntityId,
    pub name: String,
    pub table: String,
    /// Column identifying a row; the default dedup id on both relation sides.
    pub identity: String,
    pub fields: Vec<FieldDescriptor>,
    pub indexes: Vec<IndexDescriptor>,
    pub relations: Vec<RelationId>,
}

impl EntityType {
    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn primary_key(&self) -> Option<&IndexDescriptor> {
        self.indexes.iter().find(|i| i.primary_key)
    }
}

/// Declaration of one entity type, consumed by [`SchemaBuilder::register`].
#[derive(Debug, Clone)]
pub struct EntityBuilder {
    name: String,
    table: Option<String>,
    identity: String,
    fields: Vec<FieldDescriptor>,
    indexes: Vec<IndexDescriptor>,
    relations: Vec<RelationDecl>,
}

impl EntityBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: None,
            identity: "id".to_string(),
            fields: Vec::new(),
            indexes: Vec::new(),
            relations: Vec::new(),
        }
    }

    /// Table name; defaults to the entity name.
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn identity(mut self, column: impl Into<String>) -> Self {
        self.identity = column.into();
        self
    }

    pub fn field(mut self, field: FieldDescriptor) -> Self {
        self.fields.push(field);
        self
    }

    pub fn index(mut self, index: IndexDescriptor) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn relation(mut self, relation: RelationDecl) -> Self {
        self.relations.push(relation);
        self
    }
}

/// Two-phase registry: entity types are registered in any order, then
/// `build` resolves relation endpoints against the complete set.
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    entities: Vec<EntityBuilder>,
}

impl SchemaBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entity type
    pub fn register(&mut self, entity: EntityBuilder) -> Result<()> {
        if self.entities.iter().any(|e| e.name == entity.name) {
            return Err(QueryError::config(format!(
                "Entity {} already registered",
                entity.name
            )));
        }

        self.entities.push(entity);
        Ok(())
    }

    pub fn build(self) -> Result<Schema> {
        let mut entities = Vec::with_capacity(self.entities.len());
        let mut by_name = HashMap::new();
        let mut declared = Vec::new();

        for (i, builder) in self.entities.into_iter().enumerate() {
            let id = EntityId(i);
            let entity = EntityType {
                id,
                table: builder.table.unwrap_or_else(|| builder.name.clone()),
                name: builder.name,
                identity: builder.identity,
                fields: builder.fields,
                indexes: builder.indexes,
                relations: Vec::new(),
            };
            verify_entity(&entity)?;

            by_name.insert(entity.name.clone(), id);
            declared.extend(builder.relations.into_iter().map(|r| (id, r)));
            entities.push(entity);
        }

        let mut schema = Schema {
            entities,
            relations: Vec::new(),
            by_name,
        };

        for (owner, decl) in declared {
            let id = RelationId(schema.relations.len());
            let relation = decl.resolve(id, owner, &schema)?;

            let entity = &mut schema.entities[owner.0];
            if entity
                .relations
                .iter()
                .any(|r| schema.relations[r.0].name == relation.name)
            {
                return Err(QueryError::config(format!(
                    "Relation {}.{} declared twice",
                    entity.name, relation.name
                )));
            }
            if entity.field(&relation.name).is_some() {
                return Err(QueryError::config(format!(
                    "Relation {}.{} shadows a field",
                    entity.name, relation.name
                )));
            }

            entity.relations.push(id);
            schema.relations.push(relation);
        }

        Ok(schema)
    }
}

fn verify_entity(entity: &EntityType) -> Result<()> {
    let mut names = HashSet::new();
    for field in &entity.fields {
        if !names.insert(field.name.as_str()) {
            return Err(QueryError::config(format!(
                "Field {}.{} declared twice",
                entity.name, field.name
            )));
        }
    }

    if entity.field(&entity.identity).is_none() {
        return Err(QueryError::config(format!(
            "Identity column {}.{} is not a declared field",
            entity.name, entity.identity
        )));
    }

    let mut index_names = HashSet::new();
    for index in &entity.indexes {
        if !index_names.insert(index.name.as_str()) {
            return Err(QueryError::config(format!(
                "Index {}.{} declared twice",
                entity.name, index.name
            )));
        }
        if index.columns.is_empty() {
            return Err(QueryError::config(format!(
                "Index {}.{} has no columns",
                entity.name, index.name
            )));
        }
        if let Some(column) = index.columns.iter().find(|c| entity.field(c).is_none()) {
            return Err(QueryError::config(format!(
                "Index {}.{} references unknown column {}",
                entity.name, index.name, column
            )));
        }
    }

    if entity.indexes.iter().filter(|i| i.primary_key).count() > 1 {
        return Err(QueryError::config(format!(
            "Entity {} declares more than one primary key",
            entity.name
        )));
    }

    Ok(())
}

/// Read-only registry of entity types and relations.
#[derive(Debug, Clone)]
pub struct Schema {
    entities: Vec<EntityType>,
    relations: Vec<RelationDescriptor>,
    by_name: HashMap<String, EntityId>,
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::new()
    }

    /// Entity types in registration order
    pub fn entities(&self) -> impl Iterator<Item = &EntityType> {
        self.entities.iter()
    }

    pub fn entity(&self, id: EntityId) -> &EntityType {
        &self.entities[id.0]
    }

    pub fn entity_id(&self, name: &str) -> Option<EntityId> {
        self.by_name.get(name).copied()
    }

    pub fn entity_named(&self, name: &str) -> Result<&EntityType> {
        self.entity_id(name)
            .map(|id| self.entity(id))
            .ok_or_else(|| QueryError::config(format!("Unknown entity {}", name)))
    }

    pub fn relation(&self, id: RelationId) -> &RelationDescriptor {
        &self.relations[id.0]
    }

    /// Look up the relation `name` declared on `entity`.
    pub fn relation_id(&self, entity: &str, name: &str) -> Result<RelationId> {
        let owner = self.entity_named(entity)?;
        owner
            .relations
            .iter()
            .copied()
            .find(|id| self.relation(*id).name == name)
            .ok_or_else(|| QueryError::config(format!("Unknown relation {}.{}", entity, name)))
    }

    /// Reference to a declared field, for predicates and ordering.
    pub fn field(&self, entity: &str, column: &str) -> Result<FieldRef> {
        let owner = self.entity_named(entity)?;
        let field = owner.field(column).ok_or_else(|| {
            QueryError::config(format!("Unknown field {}.{}", entity, column))
        })?;

        Ok(FieldRef {
            entity: owner.id,
            table: owner.table.clone(),
            column: column.to_string(),
            ty: field.ty,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity_a() -> EntityBuilder {
        EntityBuilder::new("a")
            .field(FieldDescriptor::new("id", ColumnType::Uuid).not_null())
            .field(FieldDescriptor::new("foo", ColumnType::Text))
            .index(IndexDescriptor::new("foo_index", vec!["foo"]))
            .index(IndexDescriptor::primary_key("primary_key", vec!["id"]))
    }

    #[test]
    fn test_registration() {
        let mut builder = SchemaBuilder::new();
        builder.register(entity_a()).unwrap();
        let schema = builder.build().unwrap();

        let a = schema.entity_named("a").unwrap();
        assert_eq!(a.table, "a");
        assert_eq!(a.identity, "id");
        assert_eq!(a.fields.len(), 2);
        assert_eq!(a.primary_key().unwrap().columns, vec!["id".to_string()]);
        assert_eq!(a.indexes[0].qualified_name(&a.table), "a__foo_index");
    }

    #[test]
    fn test_implicit_defaults() {
        let id = FieldDescriptor::new("id", ColumnType::Uuid);
        assert_eq!(id.default.as_deref(), Some("uuid_generate_v1mc()"));

        let dt = FieldDescriptor::new("dt", ColumnType::Timestamp);
        assert_eq!(dt.default.as_deref(), Some("now()"));

        let foo = FieldDescriptor::new("foo", ColumnType::Text);
        assert_eq!(foo.default, None);
        assert!(foo.nullable);

        let bare = FieldDescriptor::new("id", ColumnType::Uuid).no_default();
        assert_eq!(bare.default, None);
    }

    #[test]
    fn test_duplicate_entity() {
        let mut builder = SchemaBuilder::new();
        builder.register(entity_a()).unwrap();
        assert!(matches!(
            builder.register(entity_a()),
            Err(QueryError::Configuration(_))
        ));
    }

    #[test]
    fn test_duplicate_field() {
        let mut builder = SchemaBuilder::new();
        builder
            .register(entity_a().field(FieldDescriptor::new("foo", ColumnType::Integer)))
            .unwrap();
        assert!(matches!(builder.build(), Err(QueryError::Configuration(_))));
    }

    #[test]
    fn test_missing_identity() {
        let mut builder = SchemaBuilder::new();
        builder
            .register(EntityBuilder::new("x").field(FieldDescriptor::new("foo", ColumnType::Text)))
            .unwrap();
        assert!(matches!(builder.build(), Err(QueryError::Configuration(_))));
    }

    #[test]
    fn test_two_primary_keys() {
        let mut builder = SchemaBuilder::new();
        builder
            .register(entity_a().index(IndexDescriptor::primary_key("other", vec!["foo"])))
            .unwrap();
        assert!(matches!(builder.build(), Err(QueryError::Configuration(_))));
    }

    #[test]
    fn test_index_unknown_column() {
        let mut builder = SchemaBuilder::new();
        builder
            .register(entity_a().index(IndexDescriptor::new("bar_index", vec!["bar"])))
            .unwrap();
        assert!(matches!(builder.build(), Err(QueryError::Configuration(_))));
    }

    #[test]
    fn test_field_lookup() {
        let mut builder = SchemaBuilder::new();
        builder.register(entity_a().table("a_table")).unwrap();
        let schema = builder.build().unwrap();

        let foo = schema.field("a", "foo").unwrap();
        assert_eq!(foo.table, "a_table");
        assert_eq!(foo.column, "foo");
        assert!(schema.field("a", "nope").is_err());
        assert!(schema.field("b", "foo").is_err());
    }
}
