//! Model registration.
//!
//! A [`Registry`] plays the role of a declarative base: it owns the root
//! declaration every model implicitly inherits, the table metadata and the
//! mappers produced by [`Registry::register`].

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value as JsonValue;

use crate::declarative::{
    camel_to_snake, linearize, merge_declarative_args, should_generate_tablename, ModelBuilder,
    ModelDeclaration,
};
use crate::error::{ModelError, ModelResult};
use crate::events::registrar::register_events;
use crate::events::EventDispatcher;
use crate::mapper::{Mapper, Polymorphic};
use crate::query::types::{ColumnRef, OrderBy, OrderDirection};
use crate::schema::{Column, MetaData, Table};
use crate::value::DatabaseValue;

/// Name of the default root declaration.
pub const DEFAULT_BASE_NAME: &str = "Model";

pub(crate) struct RegistryInner {
    base: Arc<ModelDeclaration>,
    mappers: DashMap<String, Arc<Mapper>>,
    order: RwLock<Vec<String>>,
    metadata: RwLock<MetaData>,
}

/// Shared handle to a set of mapped models.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::with_base(ModelBuilder::abstract_model(DEFAULT_BASE_NAME).declare())
    }

    /// Use `base` as the root declaration. Its global fragments, columns,
    /// methods and events are inherited by every registered model.
    pub fn with_base(base: Arc<ModelDeclaration>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                base,
                mappers: DashMap::new(),
                order: RwLock::new(Vec::new()),
                metadata: RwLock::new(MetaData::new()),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<RegistryInner>) -> Self {
        Self { inner }
    }

    pub fn base(&self) -> &Arc<ModelDeclaration> {
        &self.inner.base
    }

    pub fn mapper(&self, name: &str) -> ModelResult<Arc<Mapper>> {
        self.inner
            .mappers
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ModelError::Unmapped(format!("model '{}' is not registered", name)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.mappers.contains_key(name)
    }

    /// Mappers in registration order.
    pub fn mappers(&self) -> Vec<Arc<Mapper>> {
        self.inner
            .order
            .read()
            .iter()
            .filter_map(|name| self.mapper(name).ok())
            .collect()
    }

    /// Snapshot of the table metadata.
    pub fn metadata(&self) -> MetaData {
        self.inner.metadata.read().clone()
    }

    /// Map a model declaration.
    ///
    /// Merges inherited table and mapper arguments, decides the table (own,
    /// generated from the name, or shared with a mapped parent), collects
    /// inherited members and binds declared event listeners.
    pub fn register(&self, decl: Arc<ModelDeclaration>) -> ModelResult<Arc<Mapper>> {
        if !decl.is_model() {
            return Err(ModelError::Configuration(format!(
                "'{}' is not a model declaration and cannot be mapped",
                decl.name()
            )));
        }
        if self.contains(decl.name()) {
            return Err(ModelError::Configuration(format!(
                "model '{}' is already registered",
                decl.name()
            )));
        }

        let mro = linearize(&decl, Some(&self.inner.base))?;
        let table_args = merge_declarative_args(
            &mro,
            &decl,
            ModelDeclaration::table_args,
            ModelDeclaration::local_table_args,
        )?;
        let mapper_args = merge_declarative_args(
            &mro,
            &decl,
            ModelDeclaration::mapper_args,
            ModelDeclaration::local_mapper_args,
        )?;
        let concrete = mapper_args
            .option("concrete")
            .and_then(JsonValue::as_bool)
            .unwrap_or(false);

        let parent = self.mapped_parent(&decl, &mro)?;
        let own_columns = collect_columns(&decl, &mro);
        let bind_key = mro.iter().find_map(|d| d.bind_key.clone());

        let tablename = decl.tablename.clone().or_else(|| {
            should_generate_tablename(&decl, concrete).then(|| camel_to_snake(decl.name()))
        });

        let (table, inherits) = match (&decl.table, tablename, &parent) {
            (Some(table), _, _) => {
                let mut table = table.clone();
                if let Some(key) = &bind_key {
                    table.set_bind_key(key);
                }
                (table, None)
            }
            (None, Some(name), _) => {
                let mut columns = match (&parent, concrete) {
                    (Some(parent), true) => parent.table.columns.clone(),
                    _ => Vec::new(),
                };
                merge_columns(&mut columns, own_columns);
                let mut table = Table::from_call_args(&name, columns, table_args.clone().into_call_args())?;
                if let Some(key) = &bind_key {
                    table.set_bind_key(key);
                }
                (table, None)
            }
            (None, None, Some(parent)) => {
                let mut table = self
                    .inner
                    .metadata
                    .read()
                    .table(&parent.table.name)
                    .cloned()
                    .unwrap_or_else(|| parent.table.clone());
                for column in own_columns {
                    if table.column(&column.name).is_none() {
                        table.columns.push(column);
                    }
                }
                (table, Some(parent.name.clone()))
            }
            (None, None, None) => {
                return Err(ModelError::Configuration(format!(
                    "model '{}' has no table: declare a tablename, a table or a primary key column",
                    decl.name()
                )))
            }
        };

        let relationships = collect_by_name(&mro, |d| &d.relationships, |r| r.name.as_str());
        let methods = collect_by_name(&mro, |d| &d.methods, |m| m.name.as_str());
        let hybrids = collect_by_name(&mro, |d| &d.hybrids, |h| h.name.as_str());
        let advanced_search = mro.iter().find_map(|d| d.advanced_search.clone());
        let simple_search = mro.iter().find_map(|d| d.simple_search.clone());
        let strict_update_fields = mro
            .iter()
            .find_map(|d| d.strict_update_fields.clone())
            .unwrap_or_else(|| table.columns.iter().map(|c| c.name.clone()).collect());
        let order_by = parse_order_by(&table, mapper_args.option("order_by"))?;
        let polymorphic = parse_polymorphic(&table, &mapper_args.options)?;

        let mut mapper = Mapper {
            name: decl.name().to_string(),
            declaration: Arc::clone(&decl),
            mro: mro.clone(),
            table,
            inherits,
            relationships,
            methods,
            hybrids,
            table_args,
            mapper_args,
            dispatcher: EventDispatcher::new(),
            events: Default::default(),
            advanced_search,
            simple_search,
            strict_update_fields,
            order_by,
            polymorphic,
            registry: Arc::downgrade(&self.inner),
        };
        mapper.events = register_events(&mapper, &mro)?;

        {
            let mut metadata = self.inner.metadata.write();
            match &mapper.inherits {
                Some(_) => metadata.extend_table(&mapper.table.name, &mapper.table.columns)?,
                None => metadata.add_table(mapper.table.clone())?,
            }
        }

        let mapper = Arc::new(mapper);
        match self.inner.mappers.entry(mapper.name.clone()) {
            Entry::Occupied(_) => {
                return Err(ModelError::Configuration(format!(
                    "model '{}' is already registered",
                    mapper.name
                )))
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&mapper));
            }
        }
        self.inner.order.write().push(mapper.name.clone());

        tracing::debug!(
            model = mapper.name(),
            table = %mapper.table.name,
            inherits = mapper.inherits().unwrap_or(""),
            columns = mapper.table.columns.len(),
            relationships = mapper.relationships.len(),
            "registered model"
        );
        Ok(mapper)
    }

    fn mapped_parent(
        &self,
        decl: &Arc<ModelDeclaration>,
        mro: &[Arc<ModelDeclaration>],
    ) -> ModelResult<Option<Arc<Mapper>>> {
        let Some(ancestor) = mro.iter().skip(1).find(|d| d.is_model()) else {
            return Ok(None);
        };
        match self.inner.mappers.get(ancestor.name()) {
            Some(entry) if Arc::ptr_eq(entry.value().declaration_arc(), ancestor) => {
                Ok(Some(Arc::clone(entry.value())))
            }
            _ => Err(ModelError::Configuration(format!(
                "'{}' inherits from '{}', which must be registered first",
                decl.name(),
                ancestor.name()
            ))),
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("base", &self.inner.base.name())
            .field("models", &*self.inner.order.read())
            .finish()
    }
}

/// Columns declared on the model and its unmapped ancestors, evaluated
/// against the model. Later declarations replace earlier ones by name.
fn collect_columns(decl: &Arc<ModelDeclaration>, mro: &[Arc<ModelDeclaration>]) -> Vec<Column> {
    let mut columns = Vec::new();
    for ancestor in mro.iter().rev() {
        if ancestor.is_model() && !Arc::ptr_eq(ancestor, decl) {
            continue;
        }
        merge_columns(
            &mut columns,
            ancestor.columns.iter().map(|c| c.resolve(decl)).collect(),
        );
    }
    columns
}

fn merge_columns(columns: &mut Vec<Column>, overrides: Vec<Column>) {
    for column in overrides {
        match columns.iter_mut().find(|c| c.name == column.name) {
            Some(existing) => *existing = column,
            None => columns.push(column),
        }
    }
}

/// Members from every declaration in the ancestry, most derived winning.
fn collect_by_name<T, F, K>(mro: &[Arc<ModelDeclaration>], members: F, key: K) -> Vec<T>
where
    T: Clone,
    F: Fn(&ModelDeclaration) -> &Vec<T>,
    K: Fn(&T) -> &str,
{
    let mut out: Vec<T> = Vec::new();
    for ancestor in mro.iter().rev() {
        for member in members(ancestor) {
            match out.iter().position(|existing| key(existing) == key(member)) {
                Some(index) => out[index] = member.clone(),
                None => out.push(member.clone()),
            }
        }
    }
    out
}

/// `order_by` accepts a column name or a list of them; `-name` or
/// `name desc` sorts descending.
fn parse_order_by(table: &Table, option: Option<&JsonValue>) -> ModelResult<Vec<OrderBy>> {
    let entries: Vec<&str> = match option {
        None | Some(JsonValue::Null) => return Ok(Vec::new()),
        Some(JsonValue::String(entry)) => vec![entry.as_str()],
        Some(JsonValue::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str().ok_or_else(|| {
                    ModelError::Configuration(format!("invalid order_by entry {}", item))
                })
            })
            .collect::<ModelResult<_>>()?,
        Some(other) => {
            return Err(ModelError::Configuration(format!("invalid order_by option {}", other)))
        }
    };

    entries
        .into_iter()
        .map(|entry| {
            let entry = entry.trim();
            let (name, direction) = match entry.strip_prefix('-') {
                Some(rest) => (rest.trim(), OrderDirection::Desc),
                None => match entry.split_once(char::is_whitespace) {
                    Some((name, dir)) if dir.trim().eq_ignore_ascii_case("desc") => {
                        (name, OrderDirection::Desc)
                    }
                    Some((name, dir)) if dir.trim().eq_ignore_ascii_case("asc") => {
                        (name, OrderDirection::Asc)
                    }
                    Some(_) => {
                        return Err(ModelError::Configuration(format!(
                            "invalid order_by entry '{}'",
                            entry
                        )))
                    }
                    None => (entry, OrderDirection::Asc),
                },
            };
            if table.column(name).is_none() {
                return Err(ModelError::Configuration(format!(
                    "order_by column '{}' is not a column of '{}'",
                    name, table.name
                )));
            }
            Ok(OrderBy {
                column: ColumnRef::new(&table.name, name),
                direction,
            })
        })
        .collect()
}

fn parse_polymorphic(
    table: &Table,
    options: &crate::declarative::ArgOptions,
) -> ModelResult<Option<Polymorphic>> {
    let Some(column) = options.get("polymorphic_on").and_then(JsonValue::as_str) else {
        return Ok(None);
    };
    if table.column(column).is_none() {
        return Err(ModelError::Configuration(format!(
            "polymorphic_on column '{}' is not a column of '{}'",
            column, table.name
        )));
    }
    let identity = options
        .get("polymorphic_identity")
        .cloned()
        .map(DatabaseValue::from_json);
    Ok(Some(Polymorphic {
        column: column.to_string(),
        identity,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::declarative::{ArgOptions, ConfigFragment};
    use crate::schema::{Index, Relationship, TableArg};
    use serde_json::json;

    fn opts(pairs: &[(&str, JsonValue)]) -> ArgOptions {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_register_generates_tablename() {
        let registry = Registry::new();
        let mapper = ModelBuilder::model("UserAccount")
            .column(Column::integer("id").primary_key())
            .register(&registry)
            .unwrap();

        assert_eq!(mapper.table().name, "user_account");
        assert_eq!(mapper.mro().last().unwrap().name(), DEFAULT_BASE_NAME);
        assert!(registry.metadata().table("user_account").is_some());
    }

    #[test]
    fn test_table_args_merge_scenario() {
        let registry = Registry::new();
        let base = ModelBuilder::abstract_model("Base")
            .table_args(ConfigFragment::with_options(
                vec![TableArg::from(Index::new("a", ["name"]))],
                opts(&[("mysql_foo", json!("bar"))]),
            ))
            .declare();
        let mapper = ModelBuilder::model("Widget")
            .base(&base)
            .column(Column::integer("id").primary_key())
            .column(Column::string("name"))
            .local_table_args(ConfigFragment::with_options(
                vec![TableArg::from(Index::new("b", ["name"]))],
                opts(&[("mysql_foo", json!("baz"))]),
            ))
            .register(&registry)
            .unwrap();

        assert_eq!(
            mapper.table_args().positional,
            vec![
                TableArg::from(Index::new("a", ["name"])),
                TableArg::from(Index::new("b", ["name"]))
            ]
        );
        assert_eq!(mapper.table_args().options, opts(&[("mysql_foo", json!("baz"))]));
        assert_eq!(mapper.table().args.len(), 2);
        assert_eq!(mapper.table().options.get("mysql_foo"), Some(&json!("baz")));
    }

    #[test]
    fn test_local_args_not_inherited() {
        let registry = Registry::new();
        let base = ModelBuilder::abstract_model("Base")
            .local_mapper_args(opts(&[("order_by", json!("id"))]))
            .declare();
        let mapper = ModelBuilder::model("Thing")
            .base(&base)
            .column(Column::integer("id").primary_key())
            .register(&registry)
            .unwrap();

        assert!(mapper.mapper_args().is_empty());
        assert!(mapper.default_order_by().is_empty());
    }

    #[test]
    fn test_mixin_columns_and_overrides() {
        let registry = Registry::new();
        let mixin = ModelBuilder::mixin("Named")
            .column(Column::string("name"))
            .column(Column::integer("rank"))
            .declare();
        let mapper = ModelBuilder::model("Player")
            .base(&mixin)
            .column(Column::integer("id").primary_key())
            .column(Column::integer("rank").not_null())
            .register(&registry)
            .unwrap();

        assert_eq!(mapper.columns(), vec!["name", "rank", "id"]);
        assert!(!mapper.column("rank").unwrap().nullable);
    }

    #[test]
    fn test_single_table_inheritance() {
        let registry = Registry::new();
        let parent = ModelBuilder::model("Employee")
            .column(Column::integer("id").primary_key())
            .column(Column::string("kind"))
            .mapper_args(opts(&[("polymorphic_on", json!("kind")), ("polymorphic_identity", json!("employee"))]))
            .register(&registry)
            .unwrap();
        let child = ModelBuilder::model("Manager")
            .inherits(&parent)
            .column(Column::string("office"))
            .mapper_args(opts(&[("polymorphic_identity", json!("manager"))]))
            .register(&registry)
            .unwrap();

        assert_eq!(child.table().name, "employee");
        assert_eq!(child.inherits(), Some("Employee"));
        assert_eq!(child.columns(), vec!["id", "kind", "office"]);
        assert_eq!(parent.columns(), vec!["id", "kind"]);
        assert_eq!(
            child.polymorphic(),
            Some(&Polymorphic {
                column: "kind".to_string(),
                identity: Some(DatabaseValue::from("manager")),
            })
        );
        let metadata = registry.metadata();
        assert_eq!(metadata.tables().len(), 1);
        assert!(metadata.table("employee").unwrap().column("office").is_some());
    }

    #[test]
    fn test_concrete_inheritance_copies_columns() {
        let registry = Registry::new();
        let parent = ModelBuilder::model("Account")
            .column(Column::integer("id").primary_key())
            .column(Column::string("owner"))
            .register(&registry)
            .unwrap();
        let child = ModelBuilder::model("SavingsAccount")
            .inherits(&parent)
            .column(Column::float("rate"))
            .local_mapper_args(opts(&[("concrete", json!(true))]))
            .register(&registry)
            .unwrap();

        assert_eq!(child.table().name, "savings_account");
        assert_eq!(child.columns(), vec!["id", "owner", "rate"]);
        assert!(child.inherits().is_none());
    }

    #[test]
    fn test_registration_errors() {
        let registry = Registry::new();
        let mixin = ModelBuilder::mixin("M").declare();
        assert!(matches!(registry.register(mixin), Err(ModelError::Configuration(_))));

        let loose = ModelBuilder::model("Loose").column(Column::string("name"));
        assert!(matches!(loose.register(&registry), Err(ModelError::Configuration(_))));

        ModelBuilder::model("Foo")
            .column(Column::integer("id").primary_key())
            .register(&registry)
            .unwrap();
        let again = ModelBuilder::model("Foo").column(Column::integer("id").primary_key());
        assert!(matches!(again.register(&registry), Err(ModelError::Configuration(_))));

        assert!(matches!(registry.mapper("Nope"), Err(ModelError::Unmapped(_))));
    }

    #[test]
    fn test_order_by_option() {
        let registry = Registry::new();
        let mapper = ModelBuilder::model("Ranked")
            .column(Column::integer("id").primary_key())
            .column(Column::integer("score"))
            .mapper_args(opts(&[("order_by", json!(["-score", "id asc"]))]))
            .register(&registry)
            .unwrap();

        let order: Vec<(String, OrderDirection)> = mapper
            .default_order_by()
            .iter()
            .map(|o| (o.column.column.clone(), o.direction))
            .collect();
        assert_eq!(
            order,
            vec![
                ("score".to_string(), OrderDirection::Desc),
                ("id".to_string(), OrderDirection::Asc)
            ]
        );

        let bad = ModelBuilder::model("Bad")
            .column(Column::integer("id").primary_key())
            .mapper_args(opts(&[("order_by", json!("missing"))]));
        assert!(bad.register(&registry).is_err());
    }

    #[test]
    fn test_bind_key_recorded_in_table_info() {
        let registry = Registry::new();
        let mapper = ModelBuilder::model("Report")
            .bind_key("reporting")
            .column(Column::integer("id").primary_key())
            .register(&registry)
            .unwrap();

        assert_eq!(mapper.bind_key(), Some("reporting"));
        assert_eq!(registry.metadata().tables_for_bind(Some("reporting")).len(), 1);
    }

    #[test]
    fn test_relationship_resolution() {
        let registry = Registry::new();
        let foo = ModelBuilder::model("Foo")
            .column(Column::integer("_id").primary_key())
            .relationship(Relationship::has_many("bars", "Bar"))
            .register(&registry)
            .unwrap();

        assert!(matches!(foo.resolve_relationship("bars"), Err(ModelError::Unmapped(_))));

        ModelBuilder::model("Bar")
            .column(Column::integer("_id").primary_key())
            .column(Column::integer("foo_id").foreign_key("foo._id"))
            .register(&registry)
            .unwrap();

        let resolved = foo.resolve_relationship("bars").unwrap();
        assert_eq!(resolved.target.name(), "Bar");
        assert_eq!(resolved.pairs, vec![("_id".to_string(), "foo_id".to_string())]);
        assert_eq!(foo.attrs(), vec!["_id", "bars"]);
    }
}
