//! Search filter factories.
//!
//! A model's advanced and simple search configurations map field names to
//! [`SearchFilter`]s. Each filter turns a search value into an optional
//! [`Condition`]; `None` means the value does not constrain the query.
//!
//! Column references are usually left unqualified (`col("email")`), in which
//! case they bind to the table of the model the configuration belongs to.
//!
//! ```ignore
//! let config = SearchConfig::new()
//!     .filter("email", search::icontains("email"))
//!     .filter("bar_number", search::any_("bars", search::eq("number")))
//!     .filter("status", search::eqenum::<OrderStatus>("status"));
//! ```
//!
//! Factories come in pairs: `<base>` builds the comparison and `not<base>`
//! negates it.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde_json::Value as JsonValue;

use crate::enum_type::DeclarativeEnum;
use crate::query::types::{not_, ColumnRef, Condition};
use crate::value::DatabaseValue;

type FilterFn = dyn Fn(&JsonValue) -> Option<Condition> + Send + Sync;

/// Turns a search value into an optional condition.
#[derive(Clone)]
pub struct SearchFilter(Arc<FilterFn>);

impl SearchFilter {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&JsonValue) -> Option<Condition> + Send + Sync + 'static,
    {
        SearchFilter(Arc::new(f))
    }

    pub fn call(&self, value: &JsonValue) -> Option<Condition> {
        (self.0)(value)
    }

    /// Filter producing the negation of this one.
    pub fn negate(&self) -> Self {
        let inner = self.clone();
        SearchFilter::new(move |value| inner.call(value).map(not_))
    }
}

impl fmt::Debug for SearchFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SearchFilter(..)")
    }
}

/// Ordered field name to filter mapping.
#[derive(Debug, Clone, Default)]
pub struct SearchConfig {
    filters: Vec<(String, SearchFilter)>,
}

impl SearchConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the filter for `field`.
    pub fn filter(mut self, field: &str, filter: SearchFilter) -> Self {
        match self.filters.iter_mut().find(|(name, _)| name == field) {
            Some(entry) => entry.1 = filter,
            None => self.filters.push((field.to_string(), filter)),
        }
        self
    }

    pub fn get(&self, field: &str) -> Option<&SearchFilter> {
        self.filters
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, filter)| filter)
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.filters.iter().map(|(name, _)| name.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SearchFilter)> {
        self.filters.iter().map(|(name, filter)| (name.as_str(), filter))
    }

    /// Conditions for every configured field present in `search`, in
    /// configuration order.
    pub fn conditions(&self, search: &serde_json::Map<String, JsonValue>) -> Vec<Condition> {
        self.filters
            .iter()
            .filter_map(|(name, filter)| search.get(name).and_then(|value| filter.call(value)))
            .collect()
    }
}

fn text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn scalar(value: &JsonValue) -> DatabaseValue {
    DatabaseValue::from_json(value.clone())
}

fn column_filter<C, F>(column: C, compare: F) -> SearchFilter
where
    C: Into<ColumnRef>,
    F: Fn(&ColumnRef, &JsonValue) -> Condition + Send + Sync + 'static,
{
    let column = column.into();
    SearchFilter::new(move |value| Some(compare(&column, value)))
}

macro_rules! search_factories {
    ($($name:ident / $negated:ident => |$column:ident, $value:ident| $body:expr;)*) => {
        $(
            pub fn $name<C: Into<ColumnRef>>(column: C) -> SearchFilter {
                column_filter(column, |$column, $value| $body)
            }

            pub fn $negated<C: Into<ColumnRef>>(column: C) -> SearchFilter {
                $name(column).negate()
            }
        )*
    };
}

search_factories! {
    like / notlike => |column, value| column.like(&text(value));
    ilike / notilike => |column, value| column.ilike(&text(value));
    startswith / notstartswith => |column, value| column.startswith(&text(value));
    endswith / notendswith => |column, value| column.endswith(&text(value));
    contains / notcontains => |column, value| column.contains(&text(value));
    icontains / noticontains => |column, value| column.icontains(&text(value));
    eq / noteq => |column, value| column.eq(scalar(value));
    gt / notgt => |column, value| column.gt(scalar(value));
    ge / notge => |column, value| column.ge(scalar(value));
    lt / notlt => |column, value| column.lt(scalar(value));
    le / notle => |column, value| column.le(scalar(value));
}

/// Membership; a scalar value is treated as a one element list.
pub fn in_<C: Into<ColumnRef>>(column: C) -> SearchFilter {
    column_filter(column, |column, value| match value {
        JsonValue::Array(items) => column.in_(items.iter().map(scalar)),
        other => column.in_([scalar(other)]),
    })
}

pub fn notin_<C: Into<ColumnRef>>(column: C) -> SearchFilter {
    in_(column).negate()
}

fn relationship_filter(relationship: &str, column_operator: SearchFilter) -> SearchFilter {
    let relationship = relationship.to_string();
    SearchFilter::new(move |value| {
        Some(Condition::Related {
            owner: None,
            relationship: relationship.clone(),
            criterion: column_operator.call(value).map(Box::new),
        })
    })
}

/// Some row of a collection relationship matches `column_operator`.
pub fn any_(relationship: &str, column_operator: SearchFilter) -> SearchFilter {
    relationship_filter(relationship, column_operator)
}

pub fn notany_(relationship: &str, column_operator: SearchFilter) -> SearchFilter {
    any_(relationship, column_operator).negate()
}

/// The related row of a scalar relationship matches `column_operator`.
pub fn has(relationship: &str, column_operator: SearchFilter) -> SearchFilter {
    relationship_filter(relationship, column_operator)
}

pub fn nothas(relationship: &str, column_operator: SearchFilter) -> SearchFilter {
    has(relationship, column_operator).negate()
}

struct EnumFilter<E> {
    column: ColumnRef,
    _enum: PhantomData<fn() -> E>,
}

impl<E: DeclarativeEnum> EnumFilter<E> {
    fn symbol_value(value: &JsonValue) -> Option<&'static str> {
        value
            .as_str()
            .and_then(|raw| E::from_string(raw).ok())
            .map(|symbol| symbol.value())
    }

    fn eq(&self, value: &JsonValue) -> Option<Condition> {
        Self::symbol_value(value).map(|symbol| self.column.eq(symbol))
    }

    fn in_(&self, value: &JsonValue) -> Option<Condition> {
        let values: Option<Vec<&'static str>> = match value {
            JsonValue::Array(items) => items.iter().map(Self::symbol_value).collect(),
            other => Self::symbol_value(other).map(|symbol| vec![symbol]),
        };
        values.map(|values| self.column.in_(values))
    }
}

/// Equality against an enum symbol value. Unknown values yield no condition.
pub fn eqenum<E: DeclarativeEnum, C: Into<ColumnRef>>(column: C) -> SearchFilter {
    let filter = EnumFilter::<E> {
        column: column.into(),
        _enum: PhantomData,
    };
    SearchFilter::new(move |value| filter.eq(value))
}

pub fn noteqenum<E: DeclarativeEnum, C: Into<ColumnRef>>(column: C) -> SearchFilter {
    eqenum::<E, C>(column).negate()
}

/// Membership in a list of enum symbol values. Any unknown value yields no
/// condition.
pub fn inenum<E: DeclarativeEnum, C: Into<ColumnRef>>(column: C) -> SearchFilter {
    let filter = EnumFilter::<E> {
        column: column.into(),
        _enum: PhantomData,
    };
    SearchFilter::new(move |value| filter.in_(value))
}

pub fn notinenum<E: DeclarativeEnum, C: Into<ColumnRef>>(column: C) -> SearchFilter {
    inenum::<E, C>(column).negate()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::declarative_enum;
    use crate::query::types::{col, QueryOperator};
    use serde_json::json;

    declarative_enum! {
        pub enum Color {
            Red = ("r", "Red"),
            Blue = ("b", "Blue"),
        }
    }

    #[test]
    fn test_string_factories() {
        assert_eq!(like("s").call(&json!("a%")), Some(col("s").like("a%")));
        assert_eq!(startswith("s").call(&json!("ab")), Some(col("s").like("ab%")));
        assert_eq!(endswith("s").call(&json!("ab")), Some(col("s").like("%ab")));
        assert_eq!(contains("s").call(&json!("ab")), Some(col("s").like("%ab%")));
        assert_eq!(icontains("s").call(&json!("AB")), Some(col("s").ilike("%AB%")));
    }

    #[test]
    fn test_negated_factories_wrap_in_not() {
        let condition = notcontains("s").call(&json!("ab")).unwrap();
        assert_eq!(condition, not_(col("s").like("%ab%")));

        let condition = notgt("n").call(&json!(3)).unwrap();
        assert_eq!(condition, not_(col("n").gt(3)));
    }

    #[test]
    fn test_comparison_uses_json_scalars() {
        match le("n").call(&json!(2.5)).unwrap() {
            Condition::Compare { op, value, .. } => {
                assert_eq!(op, QueryOperator::LessThanOrEqual);
                assert_eq!(value, DatabaseValue::Float64(2.5));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_in_accepts_scalar_or_list() {
        assert_eq!(in_("n").call(&json!([1, 2])), Some(col("n").in_([1, 2])));
        assert_eq!(in_("n").call(&json!(1)), Some(col("n").in_([1])));
        assert_eq!(notin_("n").call(&json!([1])), Some(not_(col("n").in_([1]))));
    }

    #[test]
    fn test_relationship_factories() {
        let condition = any_("bars", eq("string")).call(&json!("x")).unwrap();
        assert_eq!(
            condition,
            Condition::Related {
                owner: None,
                relationship: "bars".to_string(),
                criterion: Some(Box::new(col("string").eq("x"))),
            }
        );
        assert!(matches!(
            nothas("foo", eq("n")).call(&json!(1)),
            Some(Condition::Not(_))
        ));
    }

    #[test]
    fn test_enum_factories() {
        assert_eq!(eqenum::<Color, _>("color").call(&json!("r")), Some(col("color").eq("r")));
        assert_eq!(eqenum::<Color, _>("color").call(&json!("x")), None);
        assert_eq!(noteqenum::<Color, _>("color").call(&json!("x")), None);
        assert_eq!(
            inenum::<Color, _>("color").call(&json!(["r", "b"])),
            Some(col("color").in_(["r", "b"]))
        );
        assert_eq!(inenum::<Color, _>("color").call(&json!("b")), Some(col("color").in_(["b"])));
        assert_eq!(inenum::<Color, _>("color").call(&json!(["r", "x"])), None);
    }

    #[test]
    fn test_config_conditions_follow_configuration_order() {
        let config = SearchConfig::new()
            .filter("a", eq("a"))
            .filter("b", eq("b"))
            .filter("a", gt("a"));

        let search = json!({"b": 1, "a": 2, "c": 3});
        let conditions = config.conditions(search.as_object().unwrap());
        assert_eq!(conditions, vec![col("a").gt(2), col("b").eq(1)]);
        assert_eq!(config.fields().collect::<Vec<_>>(), vec!["a", "b"]);
    }
}
