//! Finalized mapped models.

use std::fmt;
use std::sync::{Arc, Weak};

use serde_json::Value as JsonValue;

use crate::declarative::{MapperArg, MergedArgs, ModelDeclaration};
use crate::error::{ModelError, ModelResult};
use crate::events::registrar::EventRegistry;
use crate::events::{EventContext, EventDispatcher, EventKind, EventPayload, ListenOptions, ListenerFn, Method};
use crate::query::types::{and_, or_, ColumnRef, Condition, OrderBy};
use crate::query::Query;
use crate::record::Record;
use crate::registry::{Registry, RegistryInner};
use crate::schema::{Column, Relationship, ResolvedRelationship, Table, TableArg};
use crate::search::SearchConfig;
use crate::session::Session;
use crate::value::DatabaseValue;

pub type HybridGetter = Arc<dyn Fn(&Record) -> DatabaseValue + Send + Sync>;

/// Computed attribute exposed as a descriptor.
#[derive(Clone)]
pub struct Hybrid {
    pub name: String,
    getter: HybridGetter,
}

impl Hybrid {
    pub fn new<F>(name: &str, getter: F) -> Self
    where
        F: Fn(&Record) -> DatabaseValue + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            getter: Arc::new(getter),
        }
    }

    pub fn get(&self, record: &Record) -> DatabaseValue {
        (self.getter)(record)
    }
}

impl fmt::Debug for Hybrid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hybrid").field("name", &self.name).finish()
    }
}

/// Discriminator of a single-table inheritance hierarchy.
#[derive(Debug, Clone, PartialEq)]
pub struct Polymorphic {
    pub column: String,
    pub identity: Option<DatabaseValue>,
}

/// A registered model: its table, relationships, merged arguments and
/// bound event listeners.
pub struct Mapper {
    pub(crate) name: String,
    pub(crate) declaration: Arc<ModelDeclaration>,
    pub(crate) mro: Vec<Arc<ModelDeclaration>>,
    pub(crate) table: Table,
    /// Mapped parent whose table this model shares
    pub(crate) inherits: Option<String>,
    pub(crate) relationships: Vec<Relationship>,
    pub(crate) methods: Vec<Method>,
    pub(crate) hybrids: Vec<Hybrid>,
    pub(crate) table_args: MergedArgs<TableArg>,
    pub(crate) mapper_args: MergedArgs<MapperArg>,
    pub(crate) dispatcher: EventDispatcher,
    pub(crate) events: EventRegistry,
    pub(crate) advanced_search: Option<SearchConfig>,
    pub(crate) simple_search: Option<SearchConfig>,
    pub(crate) strict_update_fields: Vec<String>,
    pub(crate) order_by: Vec<OrderBy>,
    pub(crate) polymorphic: Option<Polymorphic>,
    pub(crate) registry: Weak<RegistryInner>,
}

impl Mapper {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn declaration(&self) -> &ModelDeclaration {
        &self.declaration
    }

    pub fn declaration_arc(&self) -> &Arc<ModelDeclaration> {
        &self.declaration
    }

    /// Linearized ancestry, this model first.
    pub fn mro(&self) -> &[Arc<ModelDeclaration>] {
        &self.mro
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    /// Name of the mapped parent when the table is shared with it.
    pub fn inherits(&self) -> Option<&str> {
        self.inherits.as_deref()
    }

    pub fn bind_key(&self) -> Option<&str> {
        self.table.bind_key()
    }

    pub fn table_args(&self) -> &MergedArgs<TableArg> {
        &self.table_args
    }

    pub fn mapper_args(&self) -> &MergedArgs<MapperArg> {
        &self.mapper_args
    }

    pub fn polymorphic(&self) -> Option<&Polymorphic> {
        self.polymorphic.as_ref()
    }

    /// Mapped attribute names: columns then relationships.
    pub fn attrs(&self) -> Vec<&str> {
        self.columns()
            .into_iter()
            .chain(self.relationships.iter().map(|r| r.name.as_str()))
            .collect()
    }

    /// Every descriptor: mapped attributes then hybrids.
    pub fn descriptors(&self) -> Vec<&str> {
        self.attrs()
            .into_iter()
            .chain(self.hybrids.iter().map(|h| h.name.as_str()))
            .collect()
    }

    pub fn relationships(&self) -> Vec<&str> {
        self.relationships.iter().map(|r| r.name.as_str()).collect()
    }

    pub fn relationship(&self, name: &str) -> Option<&Relationship> {
        self.relationships.iter().find(|r| r.name == name)
    }

    pub fn relationship_defs(&self) -> &[Relationship] {
        &self.relationships
    }

    /// Columns as references bound to this model's table.
    pub fn column_attrs(&self) -> Vec<ColumnRef> {
        self.table
            .columns
            .iter()
            .map(|c| ColumnRef::new(&self.table.name, &c.name))
            .collect()
    }

    pub fn columns(&self) -> Vec<&str> {
        self.table.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.table.column(name)
    }

    pub fn primary_key(&self) -> Vec<&Column> {
        self.table.primary_key()
    }

    /// A column reference qualified with this model's table.
    pub fn col(&self, name: &str) -> ColumnRef {
        ColumnRef::new(&self.table.name, name)
    }

    pub fn hybrid(&self, name: &str) -> Option<&Hybrid> {
        self.hybrids.iter().find(|h| h.name == name)
    }

    pub fn method(&self, name: &str) -> Option<&Method> {
        self.methods.iter().find(|m| m.name == name)
    }

    /// Call a declared method directly, outside of event dispatch.
    pub fn call_method(&self, name: &str, kind: EventKind, target: &mut Record) -> ModelResult<()> {
        let method = self.method(name).ok_or_else(|| ModelError::UnknownAttribute {
            model: self.name.clone(),
            attribute: name.to_string(),
        })?;
        let mut ctx = EventContext {
            kind,
            mapper: self,
            target,
            attribute: None,
            payload: EventPayload::Instance,
        };
        method.call(&mut ctx)?;
        Ok(())
    }

    pub fn strict_update_fields(&self) -> &[String] {
        &self.strict_update_fields
    }

    /// Default ordering from the `order_by` mapper option.
    pub fn default_order_by(&self) -> &[OrderBy] {
        &self.order_by
    }

    /// Specs bound at registration, grouped by declared event name.
    pub fn events(&self) -> &EventRegistry {
        &self.events
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    /// Subscribe a listener at runtime.
    pub fn listen(
        &self,
        kind: EventKind,
        attribute: Option<&str>,
        listener: ListenerFn,
        options: ListenOptions,
    ) -> ModelResult<u64> {
        crate::events::registrar::validate_target(self, kind, attribute)?;
        Ok(self.dispatcher.listen(kind, attribute, listener, options))
    }

    pub fn remove_listener(&self, id: u64) -> bool {
        self.dispatcher.remove(id)
    }

    pub fn advanced_search_config(&self) -> Option<&SearchConfig> {
        self.advanced_search.as_ref()
    }

    pub fn simple_search_config(&self) -> Option<&SearchConfig> {
        self.simple_search.as_ref()
    }

    /// AND of the advanced search filters matching keys of `search`.
    pub fn advanced_search(&self, search: &serde_json::Map<String, JsonValue>) -> Option<Condition> {
        let config = self.advanced_search.as_ref().filter(|c| !c.is_empty())?;
        let filters = config.conditions(search);
        if filters.is_empty() {
            return None;
        }
        Some(and_(filters).qualify(&self.table.name, &self.name))
    }

    /// Every whitespace separated term must match at least one simple search
    /// field.
    pub fn simple_search(&self, search: &str) -> Option<Condition> {
        let config = self.simple_search.as_ref().filter(|c| !c.is_empty())?;

        let mut search_filters = Vec::new();
        for term in search.split_whitespace() {
            let search_dict: serde_json::Map<String, JsonValue> = config
                .fields()
                .map(|field| (field.to_string(), JsonValue::String(term.to_string())))
                .collect();
            let term_filters = config.conditions(&search_dict);
            if !term_filters.is_empty() {
                search_filters.push(or_(term_filters));
            }
        }

        if search_filters.is_empty() {
            return None;
        }
        Some(and_(search_filters).qualify(&self.table.name, &self.name))
    }

    pub fn registry(&self) -> ModelResult<Registry> {
        self.registry
            .upgrade()
            .map(Registry::from_inner)
            .ok_or_else(|| ModelError::Unmapped(format!("registry of '{}' was dropped", self.name)))
    }

    /// Resolve a relationship's target mapper and join columns.
    pub fn resolve_relationship(&self, name: &str) -> ModelResult<ResolvedRelationship> {
        let relationship = self.relationship(name).ok_or_else(|| ModelError::UnknownAttribute {
            model: self.name.clone(),
            attribute: name.to_string(),
        })?;
        let target = self.registry()?.mapper(&relationship.target)?;
        let pairs = relationship.join_pairs(&self.table, &target.table)?;
        Ok(ResolvedRelationship {
            relationship: relationship.clone(),
            target,
            pairs,
        })
    }

    /// A new transient instance.
    pub fn new_record(self: &Arc<Self>) -> Record {
        Record::new(Arc::clone(self))
    }

    /// A transient instance populated from `data`.
    pub fn from_json(self: &Arc<Self>, data: &JsonValue) -> ModelResult<Record> {
        Record::from_json(Arc::clone(self), data)
    }

    pub fn query(self: &Arc<Self>) -> Query {
        Query::new(Arc::clone(self))
    }

    /// Load by primary key.
    pub async fn get<V: Into<DatabaseValue>>(
        self: &Arc<Self>,
        session: &mut Session,
        id: V,
    ) -> ModelResult<Option<Record>> {
        self.query().get(session, id).await
    }

    pub(crate) fn identity_of(&self, values: &std::collections::BTreeMap<String, DatabaseValue>) -> Option<Vec<DatabaseValue>> {
        let pk = self.primary_key();
        if pk.is_empty() {
            return None;
        }
        pk.iter()
            .map(|c| values.get(&c.name).filter(|v| !v.is_null()).cloned())
            .collect()
    }
}

impl fmt::Debug for Mapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mapper")
            .field("name", &self.name)
            .field("table", &self.table.name)
            .field("inherits", &self.inherits)
            .field("relationships", &self.relationships())
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}
