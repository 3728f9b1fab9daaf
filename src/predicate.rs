use crate::error::{QueryError, Result};
use crate::schema::{ColumnType, EntityId};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::fmt::Write;
use std::ops::{BitAnd, BitOr};

/// Alias each entity is known by in one statement. Entities without an entry
/// are referenced by their table name.
pub type Aliases = HashMap<EntityId, String>;

/// Double-quote an identifier.
pub fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Comparison operators for WHERE clauses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Eq,
    Ne,
    Lt,
    Gt,
    In,
    Is,
    IsNot,
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Comparator::Eq => write!(f, "="),
            Comparator::Ne => write!(f, "!="),
            Comparator::Lt => write!(f, "<"),
            Comparator::Gt => write!(f, ">"),
            Comparator::In => write!(f, "in"),
            Comparator::Is => write!(f, "is"),
            Comparator::IsNot => write!(f, "is not"),
        }
    }
}

/// Logical operators for combining predicates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

impl fmt::Display for LogicalOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogicalOp::And => write!(f, "and"),
            LogicalOp::Or => write!(f, "or"),
        }
    }
}

/// A declared column of an entity, as used in predicates and ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRef {
    pub entity: EntityId,
    pub table: String,
    pub column: String,
    pub ty: ColumnType,
}

impl FieldRef {
    /// `"alias"."column"`
    pub fn qualified(&self, aliases: &Aliases) -> String {
        let alias = aliases.get(&self.entity).unwrap_or(&self.table);
        format!("{}.{}", quote(alias), quote(&self.column))
    }

    pub fn compare(&self, op: Comparator, value: impl Into<Value>) -> Predicate {
        let value = value.into();
        let op = match (op, &value) {
            (Comparator::Eq, Value::Null) => Comparator::Is,
            (Comparator::Ne, Value::Null) => Comparator::IsNot,
            (op, _) => op,
        };

        Predicate::Compare {
            field: self.clone(),
            op,
            value,
        }
    }

    pub fn eq(&self, value: impl Into<Value>) -> Predicate {
        self.compare(Comparator::Eq, value)
    }

    pub fn ne(&self, value: impl Into<Value>) -> Predicate {
        self.compare(Comparator::Ne, value)
    }

    pub fn lt(&self, value: impl Into<Value>) -> Predicate {
        self.compare(Comparator::Lt, value)
    }

    pub fn gt(&self, value: impl Into<Value>) -> Predicate {
        self.compare(Comparator::Gt, value)
    }

    /// Membership test; `values` must be a JSON array when serialized.
    pub fn is_in(&self, values: impl Into<Value>) -> Predicate {
        self.compare(Comparator::In, values)
    }

    pub fn is_null(&self) -> Predicate {
        self.compare(Comparator::Is, Value::Null)
    }

    pub fn is_not_null(&self) -> Predicate {
        self.compare(Comparator::IsNot, Value::Null)
    }
}

/// WHERE predicate tree
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Compare {
        field: FieldRef,
        op: Comparator,
        value: Value,
    },
    Compound {
        op: LogicalOp,
        left: Box<Predicate>,
        right: Box<Predicate>,
    },
}

impl Predicate {
    pub fn and(self, other: Predicate) -> Predicate {
        Predicate::Compound {
            op: LogicalOp::And,
            left: Box::new(self),
            right: Box::new(other),
        }
    }

    pub fn or(self, other: Predicate) -> Predicate {
        Predicate::Compound {
            op: LogicalOp::Or,
            left: Box::new(self),
            right: Box::new(other),
        }
    }

    /// Serialize to a fragment with `$n` placeholders and the arguments they
    /// bind, in placeholder order.
    pub fn to_sql(&self, aliases: &Aliases) -> Result<(String, Vec<Value>)> {
        let mut sql = String::new();
        let mut params = Params::default();
        self.write_sql(aliases, &mut sql, &mut params)?;
        Ok((sql, params.values))
    }

    /// Every field the predicate compares, left to right.
    pub fn fields(&self) -> Vec<&FieldRef> {
        match self {
            Predicate::Compare { field, .. } => vec![field],
            Predicate::Compound { left, right, .. } => {
                let mut fields = left.fields();
                fields.extend(right.fields());
                fields
            }
        }
    }

    /// Append to a statement under construction. Placeholders continue from
    /// the arguments already in `params`.
    pub(crate) fn write_sql(
        &self,
        aliases: &Aliases,
        sql: &mut String,
        params: &mut Params,
    ) -> Result<()> {
        match self {
            Predicate::Compare { field, op, value } => {
                let column = field.qualified(aliases);
                match (op, value) {
                    (Comparator::Is | Comparator::IsNot, Value::Null) => {
                        write!(sql, "{} {} null", column, op).ok();
                    }
                    (Comparator::Is | Comparator::IsNot, _) => {
                        return Err(QueryError::shape(format!(
                            "'{}' compares {} against a non-null value",
                            op, column
                        )));
                    }
                    (Comparator::In, Value::Array(values)) if values.is_empty() => {
                        sql.push_str("false");
                    }
                    (Comparator::In, Value::Array(values)) => {
                        let placeholders = values
                            .iter()
                            .map(|v| params.push(v.clone(), field.ty))
                            .collect::<Vec<_>>()
                            .join(", ");
                        write!(sql, "{} in ({})", column, placeholders).ok();
                    }
                    (Comparator::In, other) => {
                        return Err(QueryError::shape(format!(
                            "'in' on {} expects a list, got {}",
                            column, other
                        )));
                    }
                    (op, value) => {
                        let p = params.push(value.clone(), field.ty);
                        write!(sql, "{} {} {}", column, op, p).ok();
                    }
                }
            }
            Predicate::Compound { op, left, right } => {
                sql.push('(');
                left.write_sql(aliases, sql, params)?;
                write!(sql, " {} ", op).ok();
                right.write_sql(aliases, sql, params)?;
                sql.push(')');
            }
        }

        Ok(())
    }
}

impl BitAnd for Predicate {
    type Output = Predicate;

    fn bitand(self, rhs: Predicate) -> Predicate {
        self.and(rhs)
    }
}

impl BitOr for Predicate {
    type Output = Predicate;

    fn bitor(self, rhs: Predicate) -> Predicate {
        self.or(rhs)
    }
}

/// Arguments of one statement under construction.
#[derive(Debug, Default)]
pub(crate) struct Params {
    pub values: Vec<Value>,
    /// Render `$n::type` so the server converts text arguments to the
    /// column's type.
    typed: bool,
}

impl Params {
    pub fn new(typed: bool) -> Self {
        Self {
            values: Vec::new(),
            typed,
        }
    }

    /// Bind `value` for a column of type `ty` and return its placeholder.
    pub fn push(&mut self, value: Value, ty: ColumnType) -> String {
        self.values.push(value);
        if self.typed {
            format!("${}::{}", self.values.len(), ty.cast_name())
        } else {
            format!("${}", self.values.len())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn id() -> FieldRef {
        FieldRef {
            entity: EntityId(0),
            table: "a".to_string(),
            column: "id".to_string(),
            ty: ColumnType::Integer,
        }
    }

    #[test]
    fn test_single_comparison() {
        let (sql, args) = id().eq(1).to_sql(&Aliases::new()).unwrap();
        assert_eq!(sql, r#""a"."id" = $1"#);
        assert_eq!(args, vec![json!(1)]);

        let (sql, _) = id().lt(1).to_sql(&Aliases::new()).unwrap();
        assert_eq!(sql, r#""a"."id" < $1"#);

        let (sql, _) = id().gt(1).to_sql(&Aliases::new()).unwrap();
        assert_eq!(sql, r#""a"."id" > $1"#);
    }

    #[test]
    fn test_or() {
        let (sql, args) = (id().eq(1) | id().eq(2)).to_sql(&Aliases::new()).unwrap();
        assert_eq!(sql, r#"("a"."id" = $1 or "a"."id" = $2)"#);
        assert_eq!(args, vec![json!(1), json!(2)]);
    }

    #[test]
    fn test_and() {
        let (sql, args) = (id().eq(1) & id().eq(2)).to_sql(&Aliases::new()).unwrap();
        assert_eq!(sql, r#"("a"."id" = $1 and "a"."id" = $2)"#);
        assert_eq!(args, vec![json!(1), json!(2)]);
    }

    #[test]
    fn test_nested_parens() {
        let predicate = id().eq(1) | (id().eq(2) & id().eq(3));
        let (sql, args) = predicate.to_sql(&Aliases::new()).unwrap();
        assert_eq!(
            sql,
            r#"("a"."id" = $1 or ("a"."id" = $2 and "a"."id" = $3))"#
        );
        assert_eq!(args, vec![json!(1), json!(2), json!(3)]);
    }

    #[test]
    fn test_in_expands_without_dedup() {
        let (sql, args) = id().is_in(json!([1, 2, 2])).to_sql(&Aliases::new()).unwrap();
        assert_eq!(sql, r#""a"."id" in ($1, $2, $3)"#);
        assert_eq!(args, vec![json!(1), json!(2), json!(2)]);
    }

    #[test]
    fn test_in_empty() {
        let (sql, args) = id().is_in(json!([])).to_sql(&Aliases::new()).unwrap();
        assert_eq!(sql, "false");
        assert!(args.is_empty());
    }

    #[test]
    fn test_in_requires_list() {
        let err = id().is_in(5).to_sql(&Aliases::new()).unwrap_err();
        assert!(matches!(err, QueryError::Shape(_)));
    }

    #[test]
    fn test_null_rewrites() {
        let (sql, args) = id().eq(Value::Null).to_sql(&Aliases::new()).unwrap();
        assert_eq!(sql, r#""a"."id" is null"#);
        assert!(args.is_empty());

        let (sql, args) = id().ne(Value::Null).to_sql(&Aliases::new()).unwrap();
        assert_eq!(sql, r#""a"."id" is not null"#);
        assert!(args.is_empty());

        assert_eq!(id().is_null(), id().eq(Value::Null));
    }

    #[test]
    fn test_alias_resolution() {
        let mut aliases = Aliases::new();
        aliases.insert(EntityId(0), "VAqPT".to_string());
        let (sql, _) = id().eq("x").to_sql(&aliases).unwrap();
        assert_eq!(sql, r#""VAqPT"."id" = $1"#);
    }

    #[test]
    fn test_placeholders_continue() {
        let mut sql = String::new();
        let mut params = Params::default();
        params.push(json!("already bound"), ColumnType::Text);
        (id().eq(1) | id().eq(2))
            .write_sql(&Aliases::new(), &mut sql, &mut params)
            .unwrap();
        assert_eq!(sql, r#"("a"."id" = $2 or "a"."id" = $3)"#);
        assert_eq!(params.values.len(), 3);
    }

    #[test]
    fn test_typed_placeholders() {
        let uuid = FieldRef {
            column: "ref".to_string(),
            ty: ColumnType::Uuid,
            ..id()
        };
        let mut sql = String::new();
        let mut params = Params::new(true);
        (uuid.eq("3b33518d-a8b5-4a06-ad32-a5bfe0893a4a") | id().is_in(json!([1, 2])))
            .write_sql(&Aliases::new(), &mut sql, &mut params)
            .unwrap();
        assert_eq!(
            sql,
            r#"("a"."ref" = $1::uuid or "a"."id" in ($2::integer, $3::integer))"#
        );
        assert_eq!(params.values.len(), 3);
    }

    #[test]
    fn test_fields_in_order() {
        let foo = FieldRef {
            column: "foo".to_string(),
            ..id()
        };
        let predicate = id().eq(1) | (foo.eq(2) & id().is_null());
        let columns: Vec<&str> = predicate.fields().iter().map(|f| f.column.as_str()).collect();
        assert_eq!(columns, vec!["id", "foo", "id"]);
    }

    #[test]
    fn test_quote_escapes() {
        assert_eq!(quote("plain"), r#""plain""#);
        assert_eq!(quote(r#"we"ird"#), r#""we""ird""#);
    }
}
