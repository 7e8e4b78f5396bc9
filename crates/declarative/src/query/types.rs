//! Query building blocks: operators, column references, conditions, ordering.

use std::fmt;

use crate::error::{ModelError, ModelResult};
use crate::registry::Registry;
use crate::schema::SqlDialect;
use crate::value::DatabaseValue;

/// Query operator types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOperator {
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
    Like,
    NotLike,
    ILike,
    NotILike,
}

impl fmt::Display for QueryOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryOperator::Equal => write!(f, "="),
            QueryOperator::NotEqual => write!(f, "!="),
            QueryOperator::GreaterThan => write!(f, ">"),
            QueryOperator::GreaterThanOrEqual => write!(f, ">="),
            QueryOperator::LessThan => write!(f, "<"),
            QueryOperator::LessThanOrEqual => write!(f, "<="),
            QueryOperator::Like => write!(f, "LIKE"),
            QueryOperator::NotLike => write!(f, "NOT LIKE"),
            QueryOperator::ILike => write!(f, "ILIKE"),
            QueryOperator::NotILike => write!(f, "NOT ILIKE"),
        }
    }
}

/// Order by direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderDirection {
    Asc,
    Desc,
}

impl fmt::Display for OrderDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderDirection::Asc => write!(f, "ASC"),
            OrderDirection::Desc => write!(f, "DESC"),
        }
    }
}

/// Join types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    Left,
}

impl fmt::Display for JoinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinType::Inner => write!(f, "INNER JOIN"),
            JoinType::Left => write!(f, "LEFT OUTER JOIN"),
        }
    }
}

/// A column, optionally qualified by table name or alias.
///
/// Unqualified references are bound to the owning model's table when used
/// inside that model's search configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnRef {
    pub table: Option<String>,
    pub column: String,
}

/// Unqualified column reference.
pub fn col(column: &str) -> ColumnRef {
    ColumnRef {
        table: None,
        column: column.to_string(),
    }
}

impl ColumnRef {
    pub fn new(table: &str, column: &str) -> Self {
        Self {
            table: Some(table.to_string()),
            column: column.to_string(),
        }
    }

    fn compare<V: Into<DatabaseValue>>(&self, op: QueryOperator, value: V) -> Condition {
        Condition::Compare {
            column: self.clone(),
            op,
            value: value.into(),
        }
    }

    pub fn eq<V: Into<DatabaseValue>>(&self, value: V) -> Condition {
        let value = value.into();
        if value.is_null() {
            return self.is_null();
        }
        self.compare(QueryOperator::Equal, value)
    }

    pub fn ne<V: Into<DatabaseValue>>(&self, value: V) -> Condition {
        let value = value.into();
        if value.is_null() {
            return self.is_not_null();
        }
        self.compare(QueryOperator::NotEqual, value)
    }

    pub fn gt<V: Into<DatabaseValue>>(&self, value: V) -> Condition {
        self.compare(QueryOperator::GreaterThan, value)
    }

    pub fn ge<V: Into<DatabaseValue>>(&self, value: V) -> Condition {
        self.compare(QueryOperator::GreaterThanOrEqual, value)
    }

    pub fn lt<V: Into<DatabaseValue>>(&self, value: V) -> Condition {
        self.compare(QueryOperator::LessThan, value)
    }

    pub fn le<V: Into<DatabaseValue>>(&self, value: V) -> Condition {
        self.compare(QueryOperator::LessThanOrEqual, value)
    }

    pub fn like(&self, pattern: &str) -> Condition {
        self.compare(QueryOperator::Like, pattern)
    }

    pub fn not_like(&self, pattern: &str) -> Condition {
        self.compare(QueryOperator::NotLike, pattern)
    }

    pub fn ilike(&self, pattern: &str) -> Condition {
        self.compare(QueryOperator::ILike, pattern)
    }

    pub fn not_ilike(&self, pattern: &str) -> Condition {
        self.compare(QueryOperator::NotILike, pattern)
    }

    pub fn startswith(&self, prefix: &str) -> Condition {
        self.like(&format!("{}%", prefix))
    }

    pub fn endswith(&self, suffix: &str) -> Condition {
        self.like(&format!("%{}", suffix))
    }

    pub fn contains(&self, fragment: &str) -> Condition {
        self.like(&format!("%{}%", fragment))
    }

    pub fn icontains(&self, fragment: &str) -> Condition {
        self.ilike(&format!("%{}%", fragment))
    }

    pub fn in_<I, V>(&self, values: I) -> Condition
    where
        I: IntoIterator<Item = V>,
        V: Into<DatabaseValue>,
    {
        Condition::InList {
            column: self.clone(),
            values: values.into_iter().map(Into::into).collect(),
            negated: false,
        }
    }

    pub fn not_in<I, V>(&self, values: I) -> Condition
    where
        I: IntoIterator<Item = V>,
        V: Into<DatabaseValue>,
    {
        Condition::InList {
            column: self.clone(),
            values: values.into_iter().map(Into::into).collect(),
            negated: true,
        }
    }

    pub fn is_null(&self) -> Condition {
        Condition::Null {
            column: self.clone(),
            negated: false,
        }
    }

    pub fn is_not_null(&self) -> Condition {
        Condition::Null {
            column: self.clone(),
            negated: true,
        }
    }

    pub fn asc(&self) -> OrderBy {
        OrderBy {
            column: self.clone(),
            direction: OrderDirection::Asc,
        }
    }

    pub fn desc(&self) -> OrderBy {
        OrderBy {
            column: self.clone(),
            direction: OrderDirection::Desc,
        }
    }

    pub(crate) fn render(&self, dialect: SqlDialect) -> String {
        match &self.table {
            Some(table) => format!("{}.{}", dialect.quote(table), dialect.quote(&self.column)),
            None => dialect.quote(&self.column),
        }
    }
}

impl From<&str> for ColumnRef {
    fn from(column: &str) -> Self {
        col(column)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub column: ColumnRef,
    pub direction: OrderDirection,
}

/// Filter expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Compare {
        column: ColumnRef,
        op: QueryOperator,
        value: DatabaseValue,
    },
    InList {
        column: ColumnRef,
        values: Vec<DatabaseValue>,
        negated: bool,
    },
    Null {
        column: ColumnRef,
        negated: bool,
    },
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Not(Box<Condition>),
    /// `EXISTS` over a relationship of `owner` (a mapper name), with an
    /// optional criterion on the related rows
    Related {
        owner: Option<String>,
        relationship: String,
        criterion: Option<Box<Condition>>,
    },
    /// Literal SQL with `?` placeholders
    Raw {
        sql: String,
        params: Vec<DatabaseValue>,
    },
}

/// Conjunction of conditions.
pub fn and_<I: IntoIterator<Item = Condition>>(conditions: I) -> Condition {
    Condition::And(conditions.into_iter().collect())
}

/// Disjunction of conditions.
pub fn or_<I: IntoIterator<Item = Condition>>(conditions: I) -> Condition {
    Condition::Or(conditions.into_iter().collect())
}

pub fn not_(condition: Condition) -> Condition {
    Condition::Not(Box::new(condition))
}

/// Rows where a relationship has at least one related row matching `criterion`.
pub fn exists(relationship: &str, criterion: Option<Condition>) -> Condition {
    Condition::Related {
        owner: None,
        relationship: relationship.to_string(),
        criterion: criterion.map(Box::new),
    }
}

impl Condition {
    pub fn raw(sql: &str, params: Vec<DatabaseValue>) -> Self {
        Condition::Raw {
            sql: sql.to_string(),
            params,
        }
    }

    pub fn and(self, other: Condition) -> Condition {
        match self {
            Condition::And(mut items) => {
                items.push(other);
                Condition::And(items)
            }
            first => Condition::And(vec![first, other]),
        }
    }

    pub fn or(self, other: Condition) -> Condition {
        match self {
            Condition::Or(mut items) => {
                items.push(other);
                Condition::Or(items)
            }
            first => Condition::Or(vec![first, other]),
        }
    }

    /// Bind unqualified columns to `table` and owner-less relationship
    /// conditions to the mapper named `owner`.
    pub fn qualify(mut self, table: &str, owner: &str) -> Self {
        self.qualify_in_place(table, owner);
        self
    }

    fn qualify_in_place(&mut self, table: &str, owner: &str) {
        match self {
            Condition::Compare { column, .. }
            | Condition::InList { column, .. }
            | Condition::Null { column, .. } => {
                if column.table.is_none() {
                    column.table = Some(table.to_string());
                }
            }
            Condition::And(items) | Condition::Or(items) => {
                for item in items {
                    item.qualify_in_place(table, owner);
                }
            }
            Condition::Not(inner) => inner.qualify_in_place(table, owner),
            Condition::Related { owner: slot, .. } => {
                if slot.is_none() {
                    *slot = Some(owner.to_string());
                }
            }
            Condition::Raw { .. } => {}
        }
    }

    pub(crate) fn render(&self, w: &mut SqlWriter, registry: &Registry) -> ModelResult<()> {
        match self {
            Condition::Compare { column, op, value } => {
                let column_sql = column.render(w.dialect);
                match op {
                    QueryOperator::ILike | QueryOperator::NotILike if !w.dialect.supports_ilike() => {
                        let negation = if *op == QueryOperator::NotILike { "NOT " } else { "" };
                        w.push(&format!("lower({}) {}LIKE lower(", column_sql, negation));
                        w.push_param(value.clone());
                        w.push(")");
                    }
                    _ => {
                        w.push(&format!("{} {} ", column_sql, op));
                        w.push_param(value.clone());
                    }
                }
            }
            Condition::InList { column, values, negated } => {
                if values.is_empty() {
                    w.push(if *negated { "1 = 1" } else { "1 = 0" });
                    return Ok(());
                }
                w.push(&column.render(w.dialect));
                w.push(if *negated { " NOT IN (" } else { " IN (" });
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        w.push(", ");
                    }
                    w.push_param(value.clone());
                }
                w.push(")");
            }
            Condition::Null { column, negated } => {
                w.push(&column.render(w.dialect));
                w.push(if *negated { " IS NOT NULL" } else { " IS NULL" });
            }
            Condition::And(items) | Condition::Or(items) => {
                let is_and = matches!(self, Condition::And(_));
                if items.is_empty() {
                    w.push(if is_and { "1 = 1" } else { "1 = 0" });
                    return Ok(());
                }
                let joiner = if is_and { " AND " } else { " OR " };
                w.push("(");
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        w.push(joiner);
                    }
                    item.render(w, registry)?;
                }
                w.push(")");
            }
            Condition::Not(inner) => {
                w.push("NOT (");
                inner.render(w, registry)?;
                w.push(")");
            }
            Condition::Related { owner, relationship, criterion } => {
                let owner_name = owner.as_deref().ok_or_else(|| {
                    ModelError::Configuration(format!(
                        "relationship condition '{}' has no owning model",
                        relationship
                    ))
                })?;
                let owner_mapper = registry.mapper(owner_name)?;
                let resolved = owner_mapper.resolve_relationship(relationship)?;
                let owner_table = owner_mapper.table().name.clone();
                let target_table = resolved.target.table().name.clone();

                w.push(&format!("EXISTS (SELECT 1 FROM {} WHERE ", w.dialect.quote(&target_table)));
                for (i, (owner_column, related_column)) in resolved.pairs.iter().enumerate() {
                    if i > 0 {
                        w.push(" AND ");
                    }
                    w.push(&format!(
                        "{} = {}",
                        ColumnRef::new(&target_table, related_column).render(w.dialect),
                        ColumnRef::new(&owner_table, owner_column).render(w.dialect)
                    ));
                }
                if let Some(criterion) = criterion {
                    w.push(" AND ");
                    let criterion = criterion
                        .as_ref()
                        .clone()
                        .qualify(&target_table, resolved.target.name());
                    criterion.render(w, registry)?;
                }
                w.push(")");
            }
            Condition::Raw { sql, params } => {
                let mut remaining = params.iter();
                for ch in sql.chars() {
                    if ch == '?' {
                        let value = remaining.next().ok_or_else(|| {
                            ModelError::Validation(format!("not enough parameters for '{}'", sql))
                        })?;
                        w.push_param(value.clone());
                    } else {
                        w.sql.push(ch);
                    }
                }
            }
        }
        Ok(())
    }
}

/// SQL text plus positional parameters being assembled.
#[derive(Debug, Clone)]
pub struct SqlWriter {
    pub(crate) sql: String,
    pub(crate) params: Vec<DatabaseValue>,
    pub(crate) dialect: SqlDialect,
}

impl SqlWriter {
    pub fn new(dialect: SqlDialect) -> Self {
        Self {
            sql: String::new(),
            params: Vec::new(),
            dialect,
        }
    }

    pub fn push(&mut self, fragment: &str) {
        self.sql.push_str(fragment);
    }

    pub fn push_param(&mut self, value: DatabaseValue) {
        let placeholder = self.dialect.parameter_placeholder(self.params.len());
        self.params.push(value);
        self.sql.push_str(&placeholder);
    }

    pub fn finish(self) -> (String, Vec<DatabaseValue>) {
        (self.sql, self.params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(condition: &Condition, dialect: SqlDialect) -> (String, Vec<DatabaseValue>) {
        let registry = Registry::new();
        let mut w = SqlWriter::new(dialect);
        condition.render(&mut w, &registry).unwrap();
        w.finish()
    }

    #[test]
    fn test_compare_and_placeholders() {
        let condition = and_([
            ColumnRef::new("foo", "string").eq("a"),
            ColumnRef::new("foo", "number").gt(3),
        ]);
        let (sql, params) = render(&condition, SqlDialect::PostgreSQL);
        assert_eq!(sql, "(\"foo\".\"string\" = $1 AND \"foo\".\"number\" > $2)");
        assert_eq!(params, vec![DatabaseValue::from("a"), DatabaseValue::Int64(3)]);
    }

    #[test]
    fn test_eq_null_becomes_is_null() {
        let (sql, params) = render(&col("string").eq(None::<String>), SqlDialect::SQLite);
        assert_eq!(sql, "\"string\" IS NULL");
        assert!(params.is_empty());
    }

    #[test]
    fn test_ilike_per_dialect() {
        let condition = col("string").icontains("ab");
        let (sql, _) = render(&condition, SqlDialect::PostgreSQL);
        assert_eq!(sql, "\"string\" ILIKE $1");

        let (sql, params) = render(&condition, SqlDialect::SQLite);
        assert_eq!(sql, "lower(\"string\") LIKE lower($1)");
        assert_eq!(params, vec![DatabaseValue::from("%ab%")]);
    }

    #[test]
    fn test_in_list_and_empty_groups() {
        let (sql, _) = render(&col("n").in_([1, 2]), SqlDialect::SQLite);
        assert_eq!(sql, "\"n\" IN ($1, $2)");

        let (sql, _) = render(&col("n").in_(Vec::<i64>::new()), SqlDialect::SQLite);
        assert_eq!(sql, "1 = 0");

        let (sql, _) = render(&or_([]), SqlDialect::SQLite);
        assert_eq!(sql, "1 = 0");
    }

    #[test]
    fn test_not_and_raw() {
        let condition = not_(Condition::raw("length(\"string\") > ? AND ? = 1", vec![2.into(), 1.into()]));
        let (sql, params) = render(&condition, SqlDialect::SQLite);
        assert_eq!(sql, "NOT (length(\"string\") > $1 AND $2 = 1)");
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn test_qualify_only_fills_missing_tables() {
        let condition = and_([col("a").eq(1), ColumnRef::new("other", "b").eq(2), exists("bars", None)])
            .qualify("foo", "Foo");
        match condition {
            Condition::And(items) => {
                assert!(matches!(&items[0], Condition::Compare { column, .. } if column.table.as_deref() == Some("foo")));
                assert!(matches!(&items[1], Condition::Compare { column, .. } if column.table.as_deref() == Some("other")));
                assert!(matches!(&items[2], Condition::Related { owner, .. } if owner.as_deref() == Some("Foo")));
            }
            other => panic!("unexpected condition {:?}", other),
        }
    }

    #[test]
    fn test_chaining_flattens() {
        let condition = col("a").eq(1).and(col("b").eq(2)).and(col("c").eq(3));
        assert!(matches!(condition, Condition::And(ref items) if items.len() == 3));
    }
}
