use crate::backend::QueryRow;
use crate::planner::JoinPlan;
use crate::schema::{EntityId, EntityType, Schema};
use indexmap::IndexMap;
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Field values of one row for one entity, in declaration order.
pub type Record = IndexMap<String, Value>;

/// Value of a relation attribute on an assembled instance
#[derive(Debug, Clone, PartialEq)]
pub enum Related {
    One(Option<Arc<Instance>>),
    Many(Vec<Arc<Instance>>),
}

impl Serialize for Related {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Related::One(Some(instance)) => instance.as_ref().serialize(serializer),
            Related::One(None) => serializer.serialize_none(),
            Related::Many(instances) => {
                let items: Vec<&Instance> = instances.iter().map(Arc::as_ref).collect();
                items.serialize(serializer)
            }
        }
    }
}

/// One assembled object: its fields plus the relations joined by the query.
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    pub entity: String,
    pub fields: Record,
    pub relations: IndexMap<String, Related>,
}

impl Instance {
    /// Field value; `None` for fields not declared on the entity.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Target of a to-one relation. `None` when nothing matched or the
    /// relation was not joined.
    pub fn one(&self, relation: &str) -> Option<&Arc<Instance>> {
        match self.relations.get(relation) {
            Some(Related::One(target)) => target.as_ref(),
            _ => None,
        }
    }

    /// Children of a to-many relation, empty when nothing matched or the
    /// relation was not joined.
    pub fn many(&self, relation: &str) -> &[Arc<Instance>] {
        match self.relations.get(relation) {
            Some(Related::Many(children)) => children,
            _ => &[],
        }
    }

    pub fn to_json(&self) -> crate::Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

impl Serialize for Instance {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len() + self.relations.len()))?;
        for (name, value) in &self.fields {
            map.serialize_entry(name, value)?;
        }
        for (name, related) in &self.relations {
            map.serialize_entry(name, related)?;
        }
        map.end()
    }
}

/// Read `entity`'s fields from `row`, where they were selected as
/// `alias.column`. Returns `None` when every field is null or absent, which is
/// how an unmatched `LEFT JOIN` side shows up.
pub fn read_record(entity: &EntityType, alias: &str, row: &QueryRow) -> Option<Record> {
    let mut empty = true;
    let record: Record = entity
        .fields
        .iter()
        .map(|field| {
            let value = row
                .value(&format!("{}.{}", alias, field.name))
                .cloned()
                .unwrap_or(Value::Null);
            empty &= value.is_null();
            (field.name.clone(), value)
        })
        .collect();

    (!empty).then_some(record)
}

fn value_key(record: &Record, column: &str) -> Option<String> {
    record
        .get(column)
        .filter(|v| !v.is_null())
        .map(Value::to_string)
}

/// Rows of one query collected per entity, with the parent/child links each
/// join produced. Filled by either execution strategy, then assembled.
pub(crate) struct Staging<'a> {
    schema: &'a Schema,
    plan: &'a JoinPlan,
    records: IndexMap<(EntityId, String), Record>,
    roots: Vec<String>,
    root_keys: HashSet<String>,
    /// Per join: parent dedup value -> child dedup value -> child record key.
    links: Vec<HashMap<String, IndexMap<String, String>>>,
    synthetic: usize,
}

impl<'a> Staging<'a> {
    pub(crate) fn new(schema: &'a Schema, plan: &'a JoinPlan) -> Self {
        Self {
            schema,
            plan,
            records: IndexMap::new(),
            roots: Vec::new(),
            root_keys: HashSet::new(),
            links: vec![HashMap::new(); plan.joins.len()],
            synthetic: 0,
        }
    }

    fn next_synthetic(&mut self) -> String {
        self.synthetic += 1;
        format!("#{}", self.synthetic)
    }

    /// Store a record, keyed by its identity. The first copy of an identity
    /// wins. A null identity never merges with another row.
    fn stage(&mut self, entity: EntityId, record: Record) -> String {
        let schema = self.schema;
        let identity = &schema.entity(entity).identity;
        let key = match value_key(&record, identity) {
            Some(key) => key,
            None => self.next_synthetic(),
        };
        self.records.entry((entity, key.clone())).or_insert(record);
        key
    }

    /// Add one root row. With joins in play, rows repeating a root identity
    /// fold into the first one.
    pub(crate) fn add_root(&mut self, record: Record) {
        let key = if self.plan.joins.is_empty() {
            let key = self.next_synthetic();
            self.records.insert((self.plan.root, key.clone()), record);
            key
        } else {
            self.stage(self.plan.root, record)
        };

        if self.root_keys.insert(key.clone()) {
            self.roots.push(key);
        }
    }

    /// Attach `child` under the parent whose `parent_id` column is
    /// `parent_value`, at most once per child dedup id.
    pub(crate) fn link(&mut self, join: usize, parent_value: &Value, child: Record) {
        if parent_value.is_null() {
            return;
        }

        let (schema, plan) = (self.schema, self.plan);
        let relation = plan.relation(schema, join);
        let child_entity = relation.child().entity;
        let dedup = value_key(&child, relation.child_id());
        let key = self.stage(child_entity, child);
        let dedup = dedup.unwrap_or_else(|| key.clone());

        self.links[join]
            .entry(parent_value.to_string())
            .or_default()
            .entry(dedup)
            .or_insert(key);
    }

    /// Staged records of `entity`, in staging order.
    pub(crate) fn records_of(&self, entity: EntityId) -> impl Iterator<Item = &Record> + '_ {
        self.records
            .iter()
            .filter(move |((e, _), _)| *e == entity)
            .map(|(_, record)| record)
    }

    pub(crate) fn truncate_roots(&mut self, limit: usize) {
        self.roots.truncate(limit);
    }

    /// Keep the first `limit` roots and forget the records of the rest.
    /// Only meaningful before any join has been linked.
    pub(crate) fn limit_roots(&mut self, limit: usize) {
        let root = self.plan.root;
        let dropped = self.roots.split_off(limit.min(self.roots.len()));
        for key in dropped {
            self.records.shift_remove(&(root, key));
        }
    }

    pub(crate) fn assemble(self) -> Vec<Arc<Instance>> {
        let mut memo = HashMap::new();
        self.roots
            .iter()
            .map(|key| self.build(self.plan.root, key, &mut memo))
            .collect()
    }

    fn build(
        &self,
        entity: EntityId,
        key: &str,
        memo: &mut HashMap<(EntityId, String), Arc<Instance>>,
    ) -> Arc<Instance> {
        if let Some(instance) = memo.get(&(entity, key.to_string())) {
            return instance.clone();
        }

        let ty = self.schema.entity(entity);
        let fields = self
            .records
            .get(&(entity, key.to_string()))
            .cloned()
            .unwrap_or_default();

        let mut relations = IndexMap::new();
        for join in self.plan.joins_from(self.schema, entity) {
            let relation = self.plan.relation(self.schema, join);
            let child_entity = relation.child().entity;

            let children: Vec<Arc<Instance>> = value_key(&fields, relation.parent_id())
                .and_then(|parent| self.links[join].get(&parent))
                .into_iter()
                .flat_map(|children| children.values())
                .map(|child_key| self.build(child_entity, child_key, memo))
                .collect();

            let related = if relation.cardinality.is_many() {
                Related::Many(children)
            } else {
                Related::One(children.into_iter().next())
            };
            relations.insert(relation.name.clone(), related);
        }

        let instance = Arc::new(Instance {
            entity: ty.name.clone(),
            fields,
            relations,
        });
        memo.insert((entity, key.to_string()), instance.clone());
        instance
    }
}
