//! Model instances.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::error::{ModelError, ModelResult};
use crate::mapper::Mapper;
use crate::schema::ColumnType;
use crate::session::Session;
use crate::value::DatabaseValue;

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// Loaded value of a relationship attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum Related {
    One(Option<Box<Record>>),
    Many(Vec<Record>),
}

impl Related {
    fn to_json(&self) -> JsonValue {
        match self {
            Related::One(Some(record)) => JsonValue::Object(record.to_dict()),
            Related::One(None) => JsonValue::Null,
            Related::Many(records) => {
                JsonValue::Array(records.iter().map(|r| JsonValue::Object(r.to_dict())).collect())
            }
        }
    }
}

/// Attributes that can merge a nested dict into themselves instead of
/// being replaced.
pub trait Updatable {
    fn update_from(&mut self, data: &JsonMap<String, JsonValue>) -> ModelResult<()>;
}

impl Updatable for Record {
    fn update_from(&mut self, data: &JsonMap<String, JsonValue>) -> ModelResult<()> {
        self.update(data, false)
    }
}

impl Updatable for JsonValue {
    fn update_from(&mut self, data: &JsonMap<String, JsonValue>) -> ModelResult<()> {
        match self {
            JsonValue::Object(map) => {
                for (key, value) in data {
                    map.insert(key.clone(), value.clone());
                }
                Ok(())
            }
            other => Err(ModelError::Validation(format!("cannot merge a dict into {}", other))),
        }
    }
}

/// An instance of a mapped model.
///
/// Holds only what has been loaded or assigned: unloaded columns are absent
/// rather than null, and relationships appear once loaded or assigned.
#[derive(Clone)]
pub struct Record {
    mapper: Arc<Mapper>,
    values: BTreeMap<String, DatabaseValue>,
    related: BTreeMap<String, Related>,
    identity: Option<Vec<DatabaseValue>>,
    modified: BTreeSet<String>,
    instance_id: u64,
}

impl Record {
    pub fn new(mapper: Arc<Mapper>) -> Self {
        Self {
            mapper,
            values: BTreeMap::new(),
            related: BTreeMap::new(),
            identity: None,
            modified: BTreeSet::new(),
            instance_id: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Construct and populate from a JSON object, as `update` would.
    pub fn from_json(mapper: Arc<Mapper>, data: &JsonValue) -> ModelResult<Self> {
        let mut record = Self::new(mapper);
        match data {
            JsonValue::Object(map) => record.update(map, false)?,
            JsonValue::Null => {}
            other => {
                return Err(ModelError::Validation(format!(
                    "'{}' must be built from an object, got {}",
                    record.mapper.name(),
                    other
                )))
            }
        }
        Ok(record)
    }

    /// A persistent instance built from loaded column values.
    pub(crate) fn loaded(mapper: Arc<Mapper>, values: BTreeMap<String, DatabaseValue>) -> Self {
        let mut record = Self::new(mapper);
        record.identity = record.mapper.identity_of(&values);
        record.values = values;
        record
    }

    pub fn mapper(&self) -> &Arc<Mapper> {
        &self.mapper
    }

    pub fn model_name(&self) -> &str {
        self.mapper.name()
    }

    /// Process-unique id of this in-memory instance.
    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    /// Primary key values of the persisted row.
    pub fn identity(&self) -> Option<&[DatabaseValue]> {
        self.identity.as_deref()
    }

    pub fn is_persistent(&self) -> bool {
        self.identity.is_some()
    }

    pub fn is_modified(&self) -> bool {
        !self.modified.is_empty()
    }

    pub fn modified(&self) -> impl Iterator<Item = &str> {
        self.modified.iter().map(String::as_str)
    }

    pub fn values(&self) -> &BTreeMap<String, DatabaseValue> {
        &self.values
    }

    pub fn get(&self, name: &str) -> Option<&DatabaseValue> {
        self.values.get(name)
    }

    /// Column value, null when not loaded.
    pub fn value(&self, name: &str) -> DatabaseValue {
        self.values.get(name).cloned().unwrap_or(DatabaseValue::Null)
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.values.contains_key(name) || self.related.contains_key(name)
    }

    /// Assign a column, firing `set` listeners.
    pub fn set<V: Into<DatabaseValue>>(&mut self, name: &str, value: V) -> ModelResult<()> {
        let column_type = self.column_type(name)?;
        let mut value = value.into().coerce(&column_type)?;
        let old = self.value(name);

        let mapper = Arc::clone(&self.mapper);
        mapper.dispatcher().dispatch_set(&mapper, self, name, &mut value, &old)?;

        self.values.insert(name.to_string(), value);
        self.modified.insert(name.to_string());
        Ok(())
    }

    fn column_type(&self, name: &str) -> ModelResult<ColumnType> {
        self.mapper
            .column(name)
            .map(|c| c.column_type.clone())
            .ok_or_else(|| self.unknown(name))
    }

    fn unknown(&self, name: &str) -> ModelError {
        ModelError::UnknownAttribute {
            model: self.mapper.name().to_string(),
            attribute: name.to_string(),
        }
    }

    fn ensure_relationship(&self, name: &str, collection: bool) -> ModelResult<()> {
        match self.mapper.relationship(name) {
            Some(relationship) if relationship.is_collection() == collection => Ok(()),
            Some(_) => Err(ModelError::Validation(format!(
                "'{}.{}' is {}a collection",
                self.mapper.name(),
                name,
                if collection { "not " } else { "" }
            ))),
            None => Err(self.unknown(name)),
        }
    }

    pub fn related(&self, name: &str) -> Option<&Related> {
        self.related.get(name)
    }

    pub fn related_mut(&mut self, name: &str) -> Option<&mut Related> {
        self.related.get_mut(name)
    }

    /// Loaded record of a scalar relationship.
    pub fn related_one(&self, name: &str) -> Option<&Record> {
        match self.related.get(name) {
            Some(Related::One(Some(record))) => Some(record),
            _ => None,
        }
    }

    /// Loaded records of a collection; empty when not loaded.
    pub fn related_many(&self, name: &str) -> &[Record] {
        match self.related.get(name) {
            Some(Related::Many(records)) => records,
            _ => &[],
        }
    }

    /// Assign a scalar relationship, firing `set` listeners with the related
    /// record as a JSON value.
    pub fn set_related(&mut self, name: &str, record: Option<Record>) -> ModelResult<()> {
        self.ensure_relationship(name, false)?;
        let mut value = record
            .as_ref()
            .map(|r| DatabaseValue::Json(JsonValue::Object(r.to_dict())))
            .unwrap_or(DatabaseValue::Null);
        let old = self
            .related
            .get(name)
            .map(|r| DatabaseValue::Json(r.to_json()))
            .unwrap_or(DatabaseValue::Null);

        let mapper = Arc::clone(&self.mapper);
        mapper.dispatcher().dispatch_set(&mapper, self, name, &mut value, &old)?;

        self.related
            .insert(name.to_string(), Related::One(record.map(Box::new)));
        Ok(())
    }

    /// Replace a collection.
    pub fn set_many(&mut self, name: &str, records: Vec<Record>) -> ModelResult<()> {
        self.ensure_relationship(name, true)?;
        self.related.insert(name.to_string(), Related::Many(Vec::new()));
        for record in records {
            self.append(name, record)?;
        }
        Ok(())
    }

    /// Append to a collection, firing `append` listeners.
    pub fn append(&mut self, name: &str, mut child: Record) -> ModelResult<()> {
        self.ensure_relationship(name, true)?;
        let mapper = Arc::clone(&self.mapper);
        mapper.dispatcher().dispatch_append(&mapper, self, name, &mut child)?;

        match self
            .related
            .entry(name.to_string())
            .or_insert_with(|| Related::Many(Vec::new()))
        {
            Related::Many(records) => records.push(child),
            slot => *slot = Related::Many(vec![child]),
        }
        Ok(())
    }

    /// Remove the record at `index` from a collection, firing `remove`
    /// listeners.
    pub fn remove(&mut self, name: &str, index: usize) -> ModelResult<Record> {
        self.ensure_relationship(name, true)?;
        let child = match self.related.get_mut(name) {
            Some(Related::Many(records)) if index < records.len() => records.remove(index),
            _ => {
                return Err(ModelError::Validation(format!(
                    "'{}.{}' has no item at index {}",
                    self.mapper.name(),
                    name,
                    index
                )))
            }
        };
        let mapper = Arc::clone(&self.mapper);
        mapper.dispatcher().dispatch_remove(&mapper, self, name, &child)?;
        Ok(child)
    }

    /// Computed value of a hybrid attribute.
    pub fn hybrid(&self, name: &str) -> ModelResult<DatabaseValue> {
        self.mapper
            .hybrid(name)
            .map(|hybrid| hybrid.get(self))
            .ok_or_else(|| self.unknown(name))
    }

    /// Update from a dict of values.
    ///
    /// Keys that are not mapped attributes are ignored, as are keys outside
    /// the model's strict update fields when `strict` is set. A dict value
    /// merges into an [`Updatable`] attribute (a loaded related record or a
    /// JSON object column). An empty dict for a relationship clears it.
    pub fn update(&mut self, data: &JsonMap<String, JsonValue>, strict: bool) -> ModelResult<()> {
        let mapper = Arc::clone(&self.mapper);
        for (key, value) in data {
            if strict && !mapper.strict_update_fields().iter().any(|f| f == key) {
                continue;
            }

            if mapper.column(key).is_some() {
                self.update_column(key, value)?;
            } else if let Some(relationship) = mapper.relationship(key) {
                if relationship.is_collection() {
                    self.update_collection(key, value)?;
                } else {
                    self.update_scalar_relationship(key, value)?;
                }
            }
        }
        Ok(())
    }

    fn update_column(&mut self, key: &str, value: &JsonValue) -> ModelResult<()> {
        if let (JsonValue::Object(patch), Some(DatabaseValue::Json(current))) = (value, self.values.get(key)) {
            if current.is_object() {
                let mut merged = current.clone();
                merged.update_from(patch)?;
                return self.set(key, DatabaseValue::Json(merged));
            }
        }
        let column_type = self.column_type(key)?;
        let coerced = DatabaseValue::coerce_json(value, &column_type)?;
        self.set(key, coerced)
    }

    fn update_scalar_relationship(&mut self, key: &str, value: &JsonValue) -> ModelResult<()> {
        match value {
            JsonValue::Object(patch) if patch.is_empty() => self.set_related(key, None),
            JsonValue::Object(patch) => {
                if let Some(Related::One(Some(existing))) = self.related.get_mut(key) {
                    return existing.update_from(patch);
                }
                let target = self.mapper.resolve_relationship(key)?.target;
                let record = Record::from_json(target, value)?;
                self.set_related(key, Some(record))
            }
            JsonValue::Null => self.set_related(key, None),
            other => Err(ModelError::Validation(format!(
                "'{}.{}' expects an object, got {}",
                self.mapper.name(),
                key,
                other
            ))),
        }
    }

    fn update_collection(&mut self, key: &str, value: &JsonValue) -> ModelResult<()> {
        match value {
            JsonValue::Array(items) => {
                let target = self.mapper.resolve_relationship(key)?.target;
                let records = items
                    .iter()
                    .map(|item| Record::from_json(Arc::clone(&target), item))
                    .collect::<ModelResult<Vec<_>>>()?;
                self.set_many(key, records)
            }
            JsonValue::Null => self.set_many(key, Vec::new()),
            other => Err(ModelError::Validation(format!(
                "'{}.{}' expects a list, got {}",
                self.mapper.name(),
                key,
                other
            ))),
        }
    }

    /// Loaded columns and relationships, recursively. Nothing is loaded on
    /// demand.
    pub fn to_dict(&self) -> JsonMap<String, JsonValue> {
        let mut out = JsonMap::new();
        for (name, value) in &self.values {
            out.insert(name.clone(), value.to_json());
        }
        for (name, related) in &self.related {
            out.insert(name.clone(), related.to_json());
        }
        out
    }

    /// `<Model(col=value, ...)>` over the mapped columns.
    pub fn repr(&self) -> String {
        let values: Vec<String> = self
            .mapper
            .columns()
            .into_iter()
            .map(|name| format!("{}={}", name, self.value(name)))
            .collect();
        format!("<{}({})>", self.mapper.name(), values.join(", "))
    }

    pub async fn flush(&mut self, session: &mut Session) -> ModelResult<()> {
        session.flush_record(self).await
    }

    /// Queue this instance for deletion.
    pub fn delete(self, session: &mut Session) -> &mut Session {
        session.delete(self)
    }

    pub fn expire(&mut self, session: &mut Session) -> ModelResult<()> {
        session.expire(self)
    }

    pub async fn refresh(&mut self, session: &mut Session) -> ModelResult<()> {
        session.refresh(self).await
    }

    pub fn expunge(&self, session: &mut Session) {
        session.expunge(self)
    }

    pub(crate) fn set_loaded(&mut self, values: BTreeMap<String, DatabaseValue>) {
        self.identity = self.mapper.identity_of(&values);
        self.values = values;
        self.modified.clear();
    }

    pub(crate) fn set_loaded_related(&mut self, name: &str, related: Related) {
        self.related.insert(name.to_string(), related);
    }

    /// Mark a relationship loaded with nothing in it, keeping anything
    /// already attached.
    pub(crate) fn ensure_related_loaded(&mut self, name: &str, collection: bool) {
        self.related.entry(name.to_string()).or_insert_with(|| {
            if collection {
                Related::Many(Vec::new())
            } else {
                Related::One(None)
            }
        });
    }

    /// Attach a loaded child, reusing an already attached record with the
    /// same identity, and return the attached record.
    pub(crate) fn attach_loaded(&mut self, name: &str, collection: bool, child: Record) -> &mut Record {
        let slot = self.related.entry(name.to_string()).or_insert_with(|| {
            if collection {
                Related::Many(Vec::new())
            } else {
                Related::One(None)
            }
        });
        match slot {
            Related::Many(items) => {
                let position = child
                    .identity()
                    .and_then(|identity| items.iter().position(|r| r.identity() == Some(identity)));
                let index = match position {
                    Some(index) => index,
                    None => {
                        items.push(child);
                        items.len() - 1
                    }
                };
                &mut items[index]
            }
            Related::One(existing) => {
                if existing
                    .as_ref()
                    .map_or(false, |current| current.identity() != child.identity())
                {
                    *existing = None;
                }
                let attached = existing.get_or_insert_with(|| Box::new(child));
                &mut **attached
            }
        }
    }

    pub(crate) fn take_related(&mut self) -> BTreeMap<String, Related> {
        std::mem::take(&mut self.related)
    }

    pub(crate) fn restore_related(&mut self, related: BTreeMap<String, Related>) {
        self.related = related;
    }

    /// Drop loaded state except the primary key.
    pub(crate) fn clear_loaded(&mut self) {
        let pk: Vec<String> = self.mapper.primary_key().iter().map(|c| c.name.clone()).collect();
        self.values.retain(|name, _| pk.contains(name));
        self.related.clear();
        self.modified.clear();
    }

    pub(crate) fn mark_deleted(&mut self) {
        self.identity = None;
    }

    /// Assign without firing events or marking the attribute modified.
    pub(crate) fn set_raw(&mut self, name: &str, value: DatabaseValue) {
        self.values.insert(name.to_string(), value);
    }

    pub(crate) fn mark_modified(&mut self, name: &str) {
        self.modified.insert(name.to_string());
    }

    pub(crate) fn modified_values(&self) -> Vec<(String, DatabaseValue)> {
        self.modified
            .iter()
            .filter_map(|name| self.values.get(name).map(|v| (name.clone(), v.clone())))
            .collect()
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.mapper.name() == other.mapper.name()
            && self.values == other.values
            && self.related == other.related
            && self.identity == other.identity
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("model", &self.mapper.name())
            .field("values", &self.values)
            .field("related", &self.related)
            .field("identity", &self.identity)
            .finish()
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::declarative::ModelBuilder;
    use crate::events::{ListenOptions, EventKind, listener};
    use crate::registry::Registry;
    use crate::schema::{Column, Relationship};
    use serde_json::json;

    fn models() -> (Registry, Arc<Mapper>, Arc<Mapper>) {
        let registry = Registry::new();
        let foo = ModelBuilder::model("Foo")
            .column(Column::integer("_id").primary_key())
            .column(Column::string("string"))
            .column(Column::integer("number"))
            .column(Column::json("data"))
            .relationship(Relationship::has_many("bars", "Bar"))
            .relationship(Relationship::has_one("baz", "Baz"))
            .strict_update_fields(["string"])
            .register(&registry)
            .unwrap();
        let bar = ModelBuilder::model("Bar")
            .column(Column::integer("_id").primary_key())
            .column(Column::string("string"))
            .column(Column::integer("foo_id").foreign_key("foo._id"))
            .register(&registry)
            .unwrap();
        ModelBuilder::model("Baz")
            .column(Column::integer("_id").primary_key())
            .column(Column::string("string"))
            .column(Column::integer("foo_id").foreign_key("foo._id"))
            .register(&registry)
            .unwrap();
        (registry, foo, bar)
    }

    #[test]
    fn test_from_json_and_to_dict_subset() {
        let (_registry, foo, _) = models();
        let data = json!({"string": "a", "number": 3, "unknown": true});
        let record = foo.from_json(&data).unwrap();

        let dict = record.to_dict();
        assert_eq!(dict.get("string"), Some(&json!("a")));
        assert_eq!(dict.get("number"), Some(&json!(3)));
        assert!(!dict.contains_key("unknown"));
        assert!(!record.is_persistent());
        assert!(record.is_modified());
    }

    #[test]
    fn test_nested_relationships_and_empty_dict() {
        let (_registry, foo, _) = models();
        let mut record = foo
            .from_json(&json!({
                "string": "a",
                "bars": [{"string": "b1"}, {"string": "b2"}],
                "baz": {"string": "z"}
            }))
            .unwrap();

        assert_eq!(record.related_many("bars").len(), 2);
        assert_eq!(record.related_one("baz").unwrap().value("string"), DatabaseValue::from("z"));

        record.update(json!({"baz": {"string": "zz"}}).as_object().unwrap(), false).unwrap();
        assert_eq!(record.related_one("baz").unwrap().value("string"), DatabaseValue::from("zz"));

        record.update(json!({"baz": {}}).as_object().unwrap(), false).unwrap();
        assert!(record.related_one("baz").is_none());
        assert_eq!(record.to_dict().get("baz"), Some(&JsonValue::Null));
    }

    #[test]
    fn test_strict_update_limits_fields() {
        let (_registry, foo, _) = models();
        let mut record = foo.new_record();
        record
            .update(json!({"string": "a", "number": 1}).as_object().unwrap(), true)
            .unwrap();
        assert_eq!(record.value("string"), DatabaseValue::from("a"));
        assert!(record.get("number").is_none());
    }

    #[test]
    fn test_json_column_merges_dicts() {
        let (_registry, foo, _) = models();
        let mut record = foo.from_json(&json!({"data": {"a": 1, "b": 2}})).unwrap();
        record.update(json!({"data": {"b": 3}}).as_object().unwrap(), false).unwrap();
        assert_eq!(record.value("data"), DatabaseValue::Json(json!({"a": 1, "b": 3})));
    }

    #[test]
    fn test_set_coerces_and_rejects_unknown() {
        let (_registry, foo, _) = models();
        let mut record = foo.new_record();
        record.set("number", "42").unwrap();
        assert_eq!(record.value("number"), DatabaseValue::Int64(42));
        assert!(matches!(
            record.set("nope", 1),
            Err(ModelError::UnknownAttribute { .. })
        ));
    }

    #[test]
    fn test_set_listener_with_retval_rewrites_value() {
        let (_registry, foo, _) = models();
        foo.listen(
            EventKind::Set,
            Some("string"),
            listener(|ctx| {
                if let Some(value) = ctx.value_mut() {
                    *value = DatabaseValue::from(value.as_str().unwrap_or("").to_uppercase());
                }
                Ok(())
            }),
            ListenOptions::default().retval(),
        )
        .unwrap();

        let mut record = foo.new_record();
        record.set("string", "abc").unwrap();
        assert_eq!(record.value("string"), DatabaseValue::from("ABC"));
    }

    #[test]
    fn test_append_and_remove() {
        let (_registry, foo, bar) = models();
        let mut record = foo.new_record();
        record.append("bars", bar.from_json(&json!({"string": "x"})).unwrap()).unwrap();
        record.append("bars", bar.from_json(&json!({"string": "y"})).unwrap()).unwrap();

        let removed = record.remove("bars", 0).unwrap();
        assert_eq!(removed.value("string"), DatabaseValue::from("x"));
        assert_eq!(record.related_many("bars").len(), 1);
        assert!(record.remove("bars", 5).is_err());
        assert!(record.append("baz", bar.new_record()).is_err());
    }

    #[test]
    fn test_repr_and_equality() {
        let (_registry, foo, _) = models();
        let a = foo.from_json(&json!({"string": "a", "number": 1})).unwrap();
        let b = foo.from_json(&json!({"string": "a", "number": 1})).unwrap();

        assert_eq!(a.repr(), "<Foo(_id=None, string='a', number=1, data=None)>");
        assert_eq!(a, b);
        assert_ne!(a.instance_id(), b.instance_id());
    }
}
