//! Relationship and column loading.
//!
//! A query's load directives are folded into a [`LoadTree`] over
//! relationship names. Relationships populated from the query's own joined
//! rows are marked with the reference (table or alias) they were selected
//! under; every other eager relationship is loaded afterwards with batched
//! `IN` statements over the owners' join keys.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use sqlx::any::AnyRow;

use crate::error::{ModelError, ModelResult};
use crate::events::EventKind;
use crate::mapper::Mapper;
use crate::record::{Record, Related};
use crate::schema::{Column, LoadStrategy};
use crate::session::Session;
use crate::value::{decode_column, DatabaseValue};

use super::builder::{SelectField, SelectStatement};
use super::types::{and_, or_, ColumnRef, Condition};

/// Upper bound on owner keys per batched statement.
pub const MAX_BATCH_SIZE: usize = 500;

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Which columns of an entity are selected.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColumnLoad {
    only: Option<BTreeSet<String>>,
    deferred: BTreeSet<String>,
    undeferred: BTreeSet<String>,
    groups: BTreeSet<String>,
}

impl ColumnLoad {
    pub fn load_only<I, S>(&mut self, columns: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.only = Some(columns.into_iter().map(|c| c.as_ref().to_string()).collect());
    }

    pub fn defer(&mut self, column: &str) {
        self.undeferred.remove(column);
        self.deferred.insert(column.to_string());
    }

    pub fn undefer(&mut self, column: &str) {
        self.deferred.remove(column);
        self.undeferred.insert(column.to_string());
    }

    pub fn undefer_group(&mut self, group: &str) {
        self.groups.insert(group.to_string());
    }

    fn includes(&self, column: &Column) -> bool {
        if column.primary_key {
            return true;
        }
        if let Some(only) = &self.only {
            return only.contains(&column.name);
        }
        if self.deferred.contains(&column.name) {
            return false;
        }
        if column.deferred {
            let group_undeferred = column
                .group
                .as_ref()
                .map_or(false, |group| self.groups.contains(group));
            return group_undeferred || self.undeferred.contains(&column.name);
        }
        true
    }

    /// Columns of `mapper` to select, in table order.
    pub(crate) fn columns(&self, mapper: &Mapper) -> Vec<Column> {
        mapper
            .table()
            .columns
            .iter()
            .filter(|c| self.includes(c))
            .cloned()
            .collect()
    }

    /// Reject column names the mapper does not have.
    pub(crate) fn validate(&self, mapper: &Mapper) -> ModelResult<()> {
        let named = self
            .only
            .iter()
            .flatten()
            .chain(&self.deferred)
            .chain(&self.undeferred);
        for name in named {
            if mapper.column(name).is_none() {
                return Err(ModelError::UnknownAttribute {
                    model: mapper.name().to_string(),
                    attribute: name.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Query-level loading instruction, applied in order.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum LoadDirective {
    /// Apply a strategy to every relationship along a path
    Strategy { path: Vec<String>, strategy: LoadStrategy },
    /// Populate a path from joined rows selected under `references`
    Contains { path: Vec<String>, references: Vec<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct LoadNode {
    pub strategy: LoadStrategy,
    /// Reference the relationship was selected under when populated from
    /// the query's joins
    pub reference: Option<String>,
    pub children: LoadTree,
}

pub(crate) type LoadTree = BTreeMap<String, LoadNode>;

/// Relationships loaded by default: eager `lazy` settings, followed into
/// targets without revisiting a model already on the path.
fn default_tree(mapper: &Mapper, visiting: &mut Vec<String>) -> ModelResult<LoadTree> {
    let mut tree = LoadTree::new();
    visiting.push(mapper.name().to_string());
    for relationship in mapper.relationship_defs() {
        let strategy = relationship.lazy;
        if strategy == LoadStrategy::NoLoad {
            tree.insert(
                relationship.name.clone(),
                LoadNode {
                    strategy,
                    reference: None,
                    children: LoadTree::new(),
                },
            );
        } else if strategy.is_eager() && !visiting.contains(&relationship.target) {
            let target = mapper.registry()?.mapper(&relationship.target)?;
            let children = default_tree(&target, visiting)?;
            tree.insert(
                relationship.name.clone(),
                LoadNode {
                    strategy,
                    reference: None,
                    children,
                },
            );
        }
    }
    visiting.pop();
    Ok(tree)
}

/// Node for `name` under `tree`, created from the target's defaults.
fn node_for<'t>(tree: &'t mut LoadTree, owner: &Mapper, name: &str) -> ModelResult<(&'t mut LoadNode, Arc<Mapper>)> {
    let relationship = owner.relationship(name).ok_or_else(|| ModelError::UnknownAttribute {
        model: owner.name().to_string(),
        attribute: name.to_string(),
    })?;
    let target = owner.registry()?.mapper(&relationship.target)?;
    if !tree.contains_key(name) {
        let mut visiting = vec![owner.name().to_string()];
        let children = default_tree(&target, &mut visiting)?;
        tree.insert(
            name.to_string(),
            LoadNode {
                strategy: relationship.lazy,
                reference: None,
                children,
            },
        );
    }
    let node = tree
        .get_mut(name)
        .ok_or_else(|| ModelError::Configuration(format!("load path '{}' vanished", name)))?;
    Ok((node, target))
}

pub(crate) fn build_tree(mapper: &Arc<Mapper>, directives: &[LoadDirective]) -> ModelResult<LoadTree> {
    let mut tree = default_tree(mapper, &mut Vec::new())?;

    for directive in directives {
        let (path, strategy, references) = match directive {
            LoadDirective::Strategy { path, strategy } => (path, *strategy, None),
            LoadDirective::Contains { path, references } => (path, LoadStrategy::Joined, Some(references)),
        };

        let mut owner = Arc::clone(mapper);
        let mut level = &mut tree;
        for (depth, name) in path.iter().enumerate() {
            let (node, target) = node_for(level, &owner, name)?;
            node.strategy = strategy;
            node.reference = references.and_then(|r| r.get(depth).cloned());
            if !strategy.is_eager() {
                node.children.clear();
            }
            owner = target;
            level = &mut node.children;
        }
    }
    Ok(tree)
}

/// Result label of a column selected under `reference`.
pub(crate) fn label(reference: &str, column: &str) -> String {
    format!("{}__{}", reference, column)
}

pub(crate) fn select_fields(reference: &str, columns: &[Column]) -> Vec<SelectField> {
    columns
        .iter()
        .map(|c| SelectField::labelled(ColumnRef::new(reference, &c.name), &label(reference, &c.name)))
        .collect()
}

/// Decode the labelled columns of one entity from a row.
pub(crate) fn decode_entity(
    row: &AnyRow,
    reference: &str,
    columns: &[Column],
) -> ModelResult<BTreeMap<String, DatabaseValue>> {
    columns
        .iter()
        .map(|c| {
            decode_column(row, &label(reference, &c.name), &c.column_type).map(|v| (c.name.clone(), v))
        })
        .collect()
}

/// Fire `load` for a record and everything already attached to it.
pub(crate) fn fire_load(record: &mut Record) -> ModelResult<()> {
    let mapper = Arc::clone(record.mapper());
    mapper.dispatcher().dispatch_instance(EventKind::Load, &mapper, record)?;

    let names: Vec<String> = mapper.relationships().into_iter().map(str::to_string).collect();
    for name in names {
        match record.related_mut(&name) {
            Some(Related::Many(items)) => {
                for item in items.iter_mut() {
                    fire_load(item)?;
                }
            }
            Some(Related::One(Some(item))) => fire_load(item)?,
            _ => {}
        }
    }
    Ok(())
}

/// Filter and single-entity statement over `target` restricted to `keys`.
fn batch_statement(target: &Mapper, related_columns: &[&str], keys: &[Vec<DatabaseValue>]) -> SelectStatement {
    let table = &target.table().name;
    let columns = ColumnLoad::default().columns(target);

    let key_filter = if related_columns.len() == 1 {
        ColumnRef::new(table, related_columns[0]).in_(keys.iter().map(|k| k[0].clone()))
    } else {
        or_(keys.iter().map(|key| {
            and_(
                related_columns
                    .iter()
                    .zip(key)
                    .map(|(column, value)| ColumnRef::new(table, column).eq(value.clone())),
            )
        }))
    };

    let mut statement = SelectStatement::new(table).where_condition(key_filter);
    statement.select_fields = select_fields(table, &columns);
    if let Some(condition) = polymorphic_filter(target) {
        statement.where_conditions.push(condition);
    }
    statement.order_by = target.default_order_by().to_vec();
    statement
}

/// Discriminator filter for a mapper sharing its parent's table.
pub(crate) fn polymorphic_filter(mapper: &Mapper) -> Option<Condition> {
    mapper.inherits()?;
    let polymorphic = mapper.polymorphic()?;
    let identity = polymorphic.identity.clone()?;
    Some(ColumnRef::new(&mapper.table().name, &polymorphic.column).eq(identity))
}

fn key_of(record: &Record, columns: &[&str]) -> Option<Vec<DatabaseValue>> {
    columns
        .iter()
        .map(|c| Some(record.value(c)).filter(|v| !v.is_null()))
        .collect()
}

async fn fetch_related(
    session: &mut Session,
    target: &Arc<Mapper>,
    related_columns: &[&str],
    keys: &[Vec<DatabaseValue>],
) -> ModelResult<Vec<Record>> {
    let registry = target.registry()?;
    let bind = target.bind_key();
    let dialect = session.dialect(bind)?;
    let columns = ColumnLoad::default().columns(target);
    let table = target.table().name.clone();

    let mut loaded = Vec::new();
    for chunk in keys.chunks(MAX_BATCH_SIZE) {
        let statement = batch_statement(target, related_columns, chunk);
        let (sql, params) = statement.to_sql_with_params(dialect, &registry)?;
        let rows = session.fetch_rows(bind, &sql, &params).await?;
        for row in &rows {
            let values = decode_entity(row, &table, &columns)?;
            let mut record = Record::loaded(Arc::clone(target), values);
            fire_load(&mut record)?;
            loaded.push(record);
        }
    }
    Ok(loaded)
}

/// Load the relationships of `tree` onto `records`, recursively.
pub(crate) fn load_tree<'a>(
    session: &'a mut Session,
    mapper: Arc<Mapper>,
    records: &'a mut [Record],
    tree: &'a LoadTree,
) -> BoxFuture<'a, ModelResult<()>> {
    Box::pin(async move {
        if records.is_empty() {
            return Ok(());
        }

        for (name, node) in tree {
            let resolved = mapper.resolve_relationship(name)?;
            let collection = resolved.is_collection();

            match node.strategy {
                LoadStrategy::Lazy => continue,
                LoadStrategy::NoLoad => {
                    for record in records.iter_mut() {
                        record.ensure_related_loaded(name, collection);
                    }
                    continue;
                }
                _ => {}
            }

            if node.reference.is_some() {
                if !node.children.is_empty() {
                    load_attached(session, &resolved.target, records, name, &node.children).await?;
                }
                continue;
            }

            let owner_columns = resolved.owner_columns();
            let related_columns = resolved.related_columns();

            let mut keys: Vec<Vec<DatabaseValue>> = Vec::new();
            for record in records.iter() {
                if let Some(key) = key_of(record, &owner_columns) {
                    if !keys.contains(&key) {
                        keys.push(key);
                    }
                }
            }

            let mut children = if keys.is_empty() {
                Vec::new()
            } else {
                fetch_related(session, &resolved.target, &related_columns, &keys).await?
            };
            load_tree(&mut *session, Arc::clone(&resolved.target), &mut children, &node.children).await?;

            for record in records.iter_mut() {
                let key = key_of(record, &owner_columns);
                let matching: Vec<Record> = match &key {
                    Some(key) => children
                        .iter()
                        .filter(|child| key_of(child, &related_columns).as_ref() == Some(key))
                        .cloned()
                        .collect(),
                    None => Vec::new(),
                };
                let related = if collection {
                    Related::Many(matching)
                } else {
                    Related::One(matching.into_iter().next().map(Box::new))
                };
                record.set_loaded_related(name, related);
            }

            tracing::debug!(
                relationship = %name,
                owners = records.len(),
                loaded = children.len(),
                "eager loaded relationship"
            );
        }
        Ok(())
    })
}

/// Continue loading below records that were attached from joined rows.
async fn load_attached(
    session: &mut Session,
    target: &Arc<Mapper>,
    records: &mut [Record],
    name: &str,
    children_tree: &LoadTree,
) -> ModelResult<()> {
    let mut shapes: Vec<(bool, usize)> = Vec::with_capacity(records.len());
    let mut flat: Vec<Record> = Vec::new();
    for record in records.iter_mut() {
        match record.related_mut(name) {
            Some(Related::Many(items)) => {
                shapes.push((true, items.len()));
                flat.append(items);
            }
            Some(Related::One(slot)) => match slot.take() {
                Some(item) => {
                    shapes.push((false, 1));
                    flat.push(*item);
                }
                None => shapes.push((false, 0)),
            },
            None => shapes.push((false, 0)),
        }
    }

    load_tree(session, Arc::clone(target), &mut flat, children_tree).await?;

    let mut loaded = flat.into_iter();
    for (record, (many, count)) in records.iter_mut().zip(shapes) {
        if count == 0 {
            continue;
        }
        match record.related_mut(name) {
            Some(Related::Many(items)) if many => items.extend(loaded.by_ref().take(count)),
            Some(Related::One(slot)) => *slot = loaded.next().map(Box::new),
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::declarative::ModelBuilder;
    use crate::registry::Registry;
    use crate::schema::Relationship;

    fn registry() -> (Registry, Arc<Mapper>) {
        let registry = Registry::new();
        let foo = ModelBuilder::model("Foo")
            .column(Column::integer("_id").primary_key())
            .column(Column::string("string"))
            .column(Column::text("notes").deferred().group("extra"))
            .relationship(Relationship::has_many("bars", "Bar").lazy(LoadStrategy::Joined))
            .relationship(Relationship::has_one("baz", "Baz"))
            .register(&registry)
            .unwrap();
        ModelBuilder::model("Bar")
            .column(Column::integer("_id").primary_key())
            .column(Column::integer("foo_id").foreign_key("foo._id"))
            .relationship(Relationship::belongs_to("foo", "Foo").lazy(LoadStrategy::Joined))
            .register(&registry)
            .unwrap();
        ModelBuilder::model("Baz")
            .column(Column::integer("_id").primary_key())
            .column(Column::integer("foo_id").foreign_key("foo._id"))
            .register(&registry)
            .unwrap();
        (registry, foo)
    }

    fn names(columns: Vec<Column>) -> Vec<String> {
        columns.into_iter().map(|c| c.name).collect()
    }

    #[test]
    fn test_deferred_columns_and_groups() {
        let (_registry, foo) = registry();
        let mut load = ColumnLoad::default();
        assert_eq!(names(load.columns(&foo)), vec!["_id", "string"]);

        load.undefer_group("extra");
        assert_eq!(names(load.columns(&foo)), vec!["_id", "string", "notes"]);

        load.defer("string");
        assert_eq!(names(load.columns(&foo)), vec!["_id", "notes"]);

        let mut only = ColumnLoad::default();
        only.load_only(["string"]);
        assert_eq!(names(only.columns(&foo)), vec!["_id", "string"]);

        let mut unknown = ColumnLoad::default();
        unknown.defer("nope");
        assert!(unknown.validate(&foo).is_err());
    }

    #[test]
    fn test_default_tree_stops_at_cycles() {
        let (_registry, foo) = registry();
        let tree = build_tree(&foo, &[]).unwrap();
        let bars = tree.get("bars").unwrap();
        assert_eq!(bars.strategy, LoadStrategy::Joined);
        assert!(bars.children.is_empty());
        assert!(!tree.contains_key("baz"));
    }

    #[test]
    fn test_directives_override_defaults() {
        let (_registry, foo) = registry();
        let directives = vec![
            LoadDirective::Strategy {
                path: vec!["bars".to_string()],
                strategy: LoadStrategy::Lazy,
            },
            LoadDirective::Strategy {
                path: vec!["baz".to_string()],
                strategy: LoadStrategy::SelectIn,
            },
        ];
        let tree = build_tree(&foo, &directives).unwrap();
        assert_eq!(tree.get("bars").unwrap().strategy, LoadStrategy::Lazy);
        assert_eq!(tree.get("baz").unwrap().strategy, LoadStrategy::SelectIn);

        let contains = vec![LoadDirective::Contains {
            path: vec!["bars".to_string(), "foo".to_string()],
            references: vec!["b".to_string(), "foo".to_string()],
        }];
        let tree = build_tree(&foo, &contains).unwrap();
        let bars = tree.get("bars").unwrap();
        assert_eq!(bars.reference.as_deref(), Some("b"));
        assert_eq!(bars.children.get("foo").unwrap().reference.as_deref(), Some("foo"));

        let bad = vec![LoadDirective::Strategy {
            path: vec!["nope".to_string()],
            strategy: LoadStrategy::Joined,
        }];
        assert!(matches!(build_tree(&foo, &bad), Err(ModelError::UnknownAttribute { .. })));
    }
}
