//! Unit of work over one or more engines.
//!
//! A [`Session`] queues new and deleted records, writes them on `flush`, and
//! keeps one open transaction per bind until `commit` or `rollback`.
//! Transactions begin lazily, on the first statement routed to a bind.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::{Map as JsonMap, Value as JsonValue};
use sqlx::any::AnyRow;
use sqlx::{Any, Transaction};
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::engine::{Engine, Engines};
use crate::error::{ModelError, ModelResult};
use crate::events::EventKind;
use crate::mapper::Mapper;
use crate::query::builder::{DeleteStatement, InsertStatement, SelectStatement, UpdateStatement};
use crate::query::loading::{self, BoxFuture, ColumnLoad, LoadNode, LoadTree};
use crate::query::types::{and_, ColumnRef};
use crate::query::Query;
use crate::record::{Record, Related};
use crate::registry::Registry;
use crate::schema::{Column, LoadStrategy, RelationshipType, SqlDialect};
use crate::value::{bind_all, decode_column, decode_untyped_row, DatabaseValue};

/// Anything `add` and `delete` accept: a record, or any nesting of
/// vectors, arrays, options and tuples of records.
pub trait IntoInstances {
    fn into_instances(self, out: &mut Vec<Record>);
}

impl IntoInstances for Record {
    fn into_instances(self, out: &mut Vec<Record>) {
        out.push(self);
    }
}

impl<T: IntoInstances> IntoInstances for Vec<T> {
    fn into_instances(self, out: &mut Vec<Record>) {
        for item in self {
            item.into_instances(out);
        }
    }
}

impl<T: IntoInstances, const N: usize> IntoInstances for [T; N] {
    fn into_instances(self, out: &mut Vec<Record>) {
        for item in self {
            item.into_instances(out);
        }
    }
}

impl<T: IntoInstances> IntoInstances for Option<T> {
    fn into_instances(self, out: &mut Vec<Record>) {
        if let Some(item) = self {
            item.into_instances(out);
        }
    }
}

macro_rules! tuple_instances {
    ($($name:ident),+) => {
        impl<$($name: IntoInstances),+> IntoInstances for ($($name,)+) {
            #[allow(non_snake_case)]
            fn into_instances(self, out: &mut Vec<Record>) {
                let ($($name,)+) = self;
                $($name.into_instances(out);)+
            }
        }
    };
}

tuple_instances!(A, B);
tuple_instances!(A, B, C);
tuple_instances!(A, B, C, D);

pub struct Session {
    engines: Engines,
    registry: Registry,
    config: SessionConfig,
    transactions: HashMap<Option<String>, Transaction<'static, Any>>,
    new: Vec<Record>,
    deleted: Vec<Record>,
}

impl Session {
    pub fn new(engines: Engines, registry: Registry, config: SessionConfig) -> Self {
        Self {
            engines,
            registry,
            config,
            transactions: HashMap::new(),
            new: Vec::new(),
            deleted: Vec::new(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn engines(&self) -> &Engines {
        &self.engines
    }

    pub fn autoflush(&self) -> bool {
        self.config.autoflush
    }

    pub fn set_autoflush(&mut self, autoflush: bool) {
        self.config.autoflush = autoflush;
    }

    /// Records queued by `add` and not yet flushed.
    pub fn pending(&self) -> &[Record] {
        &self.new
    }

    /// Records queued by `delete` and not yet flushed.
    pub fn deleted(&self) -> &[Record] {
        &self.deleted
    }

    /// Whether a transaction is open on `bind`.
    pub fn in_transaction(&self, bind: Option<&str>) -> bool {
        self.transactions.contains_key(&bind.map(str::to_string))
    }

    /// Engine serving a mapper's bind key, or the default engine.
    pub fn get_bind(&self, mapper: Option<&Mapper>) -> ModelResult<&Engine> {
        self.engines.get(mapper.and_then(|m| m.bind_key()))
    }

    /// Query over a registered model.
    pub fn query(&self, model: &str) -> ModelResult<Query> {
        Ok(self.registry.mapper(model)?.query())
    }

    pub fn add<I: IntoInstances>(&mut self, instances: I) -> &mut Self {
        instances.into_instances(&mut self.new);
        self
    }

    pub fn delete<I: IntoInstances>(&mut self, instances: I) -> &mut Self {
        instances.into_instances(&mut self.deleted);
        self
    }

    /// Add and commit. Returns the saved records.
    pub async fn add_commit<I: IntoInstances>(&mut self, instances: I) -> ModelResult<Vec<Record>> {
        self.add(instances);
        self.commit().await
    }

    pub async fn delete_commit<I: IntoInstances>(&mut self, instances: I) -> ModelResult<()> {
        self.delete(instances);
        self.commit().await.map(|_| ())
    }

    /// Write queued records and deletions. Returns the saved records.
    ///
    /// A failed flush rolls back every open transaction and requeues the
    /// whole batch as it was before the flush, so a retry writes each row
    /// once. Earlier uncommitted flushes are rolled back with it.
    pub async fn flush(&mut self) -> ModelResult<Vec<Record>> {
        let queued = std::mem::take(&mut self.new);
        let deleted = std::mem::take(&mut self.deleted);

        match self.write_queued(queued.clone(), deleted.clone()).await {
            Ok(saved) => Ok(saved),
            Err(err) => {
                warn!("Flush failed, rolling back: {}", err);
                self.new = queued;
                self.deleted = deleted;
                if let Err(rollback_err) = self.rollback_transactions().await {
                    warn!("Rollback after failed flush also failed: {}", rollback_err);
                }
                Err(err)
            }
        }
    }

    async fn write_queued(&mut self, mut pending: Vec<Record>, mut deleted: Vec<Record>) -> ModelResult<Vec<Record>> {
        for record in pending.iter_mut() {
            self.save(record).await?;
        }
        for record in deleted.iter_mut() {
            self.delete_row(record).await?;
        }

        if !pending.is_empty() || !deleted.is_empty() {
            debug!("Flushed {} saved and {} deleted record(s)", pending.len(), deleted.len());
        }
        Ok(pending)
    }

    /// Save one record and its loaded relationships in place.
    pub async fn flush_record(&mut self, record: &mut Record) -> ModelResult<()> {
        self.save(record).await
    }

    pub(crate) async fn autoflush_pending(&mut self) -> ModelResult<()> {
        if self.config.autoflush && (!self.new.is_empty() || !self.deleted.is_empty()) {
            self.flush().await?;
        }
        Ok(())
    }

    /// Flush, then commit every open transaction.
    pub async fn commit(&mut self) -> ModelResult<Vec<Record>> {
        let saved = self.flush().await?;
        let transactions: Vec<_> = self.transactions.drain().collect();
        for (bind, tx) in transactions {
            tx.commit().await?;
            debug!("Committed transaction on bind {:?}", bind);
        }
        Ok(saved)
    }

    /// Commit the open transaction on one bind, leaving queued work alone.
    pub(crate) async fn commit_bind(&mut self, bind: Option<&str>) -> ModelResult<()> {
        if let Some(tx) = self.transactions.remove(&bind.map(str::to_string)) {
            tx.commit().await?;
            debug!("Committed transaction on bind {:?}", bind);
        }
        Ok(())
    }

    /// Discard queued work and roll back every open transaction.
    pub async fn rollback(&mut self) -> ModelResult<()> {
        self.new.clear();
        self.deleted.clear();
        self.rollback_transactions().await
    }

    async fn rollback_transactions(&mut self) -> ModelResult<()> {
        let transactions: Vec<_> = self.transactions.drain().collect();
        for (bind, tx) in transactions {
            tx.rollback().await?;
            debug!("Rolled back transaction on bind {:?}", bind);
        }
        Ok(())
    }

    /// Release every connection, rolling back anything uncommitted.
    pub async fn close(&mut self) -> ModelResult<()> {
        if !self.new.is_empty() || !self.deleted.is_empty() {
            warn!(
                "Closing session with {} pending and {} deleted record(s) unflushed",
                self.new.len(),
                self.deleted.len()
            );
        }
        self.rollback().await
    }

    /// Reload a persistent record's columns from the database. Loaded
    /// relationships are discarded.
    pub async fn refresh(&mut self, record: &mut Record) -> ModelResult<()> {
        let mapper = Arc::clone(record.mapper());
        let identity = persisted_identity(record, "refreshed")?;
        let table = mapper.table().name.clone();
        let columns = ColumnLoad::default().columns(&mapper);

        let key = mapper
            .primary_key()
            .iter()
            .zip(identity)
            .map(|(column, value)| ColumnRef::new(&table, &column.name).eq(value))
            .collect::<Vec<_>>();
        let mut statement = SelectStatement::new(&table).where_condition(and_(key));
        statement.select_fields = loading::select_fields(&table, &columns);

        let bind = mapper.bind_key();
        let dialect = self.dialect(bind)?;
        let (sql, params) = statement.to_sql_with_params(dialect, &self.registry)?;
        let rows = self.fetch_rows(bind, &sql, &params).await?;
        let row = rows.first().ok_or_else(|| ModelError::NotFound(table.clone()))?;

        record.set_loaded(loading::decode_entity(row, &table, &columns)?);
        record.restore_related(BTreeMap::new());
        mapper.dispatcher().dispatch_instance(EventKind::Refresh, &mapper, record)?;
        Ok(())
    }

    /// Drop a persistent record's loaded state except its primary key.
    pub fn expire(&mut self, record: &mut Record) -> ModelResult<()> {
        persisted_identity(record, "expired")?;
        record.clear_loaded();
        let mapper = Arc::clone(record.mapper());
        mapper.dispatcher().dispatch_instance(EventKind::Expire, &mapper, record)?;
        Ok(())
    }

    /// Remove a record from the queues without writing it.
    pub fn expunge(&mut self, record: &Record) {
        let id = record.instance_id();
        self.new.retain(|r| r.instance_id() != id);
        self.deleted.retain(|r| r.instance_id() != id);
    }

    /// Load one relationship of a record with a single statement.
    pub async fn load_relationship(&mut self, record: &mut Record, name: &str) -> ModelResult<()> {
        let mapper = Arc::clone(record.mapper());
        mapper.resolve_relationship(name)?;

        let mut tree = LoadTree::new();
        tree.insert(
            name.to_string(),
            LoadNode {
                strategy: LoadStrategy::SelectIn,
                reference: None,
                children: LoadTree::new(),
            },
        );
        loading::load_tree(self, mapper, std::slice::from_mut(record), &tree).await
    }

    /// Run a statement on a bind and return the number of affected rows.
    pub async fn execute(&mut self, sql: &str, params: &[DatabaseValue], bind: Option<&str>) -> ModelResult<u64> {
        let engine = self.engines.get(bind)?.clone();
        engine.log_statement(sql, params);
        let tx = self.transaction(&engine, bind).await?;
        let result = bind_all(sqlx::query(sql), params).execute(&mut **tx).await?;
        Ok(result.rows_affected())
    }

    /// Run a query on a bind and return each row as a JSON object.
    pub async fn fetch_all(
        &mut self,
        sql: &str,
        params: &[DatabaseValue],
        bind: Option<&str>,
    ) -> ModelResult<Vec<JsonMap<String, JsonValue>>> {
        let rows = self.fetch_rows(bind, sql, params).await?;
        rows.iter().map(decode_untyped_row).collect()
    }

    pub(crate) fn dialect(&self, bind: Option<&str>) -> ModelResult<SqlDialect> {
        Ok(self.engines.get(bind)?.dialect())
    }

    pub(crate) async fn fetch_rows(
        &mut self,
        bind: Option<&str>,
        sql: &str,
        params: &[DatabaseValue],
    ) -> ModelResult<Vec<AnyRow>> {
        let engine = self.engines.get(bind)?.clone();
        engine.log_statement(sql, params);
        let tx = self.transaction(&engine, bind).await?;
        let rows = bind_all(sqlx::query(sql), params).fetch_all(&mut **tx).await?;
        Ok(rows)
    }

    async fn transaction(
        &mut self,
        engine: &Engine,
        bind: Option<&str>,
    ) -> ModelResult<&mut Transaction<'static, Any>> {
        match self.transactions.entry(bind.map(str::to_string)) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let tx = engine.begin().await?;
                if engine.echo() {
                    info!(target: "elif_declarative::engine", "BEGIN ({})", engine.display_url());
                }
                Ok(entry.insert(tx))
            }
        }
    }

    /// Save a record graph: many-to-one parents first, then the record,
    /// then its one-to-many and one-to-one children.
    fn save<'a>(&'a mut self, record: &'a mut Record) -> BoxFuture<'a, ModelResult<()>> {
        Box::pin(async move {
            let mut related = record.take_related();
            let result = self.save_graph(record, &mut related).await;
            record.restore_related(related);
            result
        })
    }

    async fn save_graph(&mut self, record: &mut Record, related: &mut BTreeMap<String, Related>) -> ModelResult<()> {
        let mapper = Arc::clone(record.mapper());

        for (name, slot) in related.iter_mut() {
            if !is_relationship(&mapper, name, true) {
                continue;
            }
            if let Related::One(Some(parent)) = slot {
                self.save(parent).await?;
                let resolved = mapper.resolve_relationship(name)?;
                for (owner, referenced) in &resolved.pairs {
                    copy_key(parent, referenced, record, owner);
                }
            }
        }

        if record.is_persistent() {
            self.update_row(record).await?;
        } else {
            self.insert_row(record).await?;
        }

        for (name, slot) in related.iter_mut() {
            if !is_relationship(&mapper, name, false) {
                continue;
            }
            let resolved = mapper.resolve_relationship(name)?;
            let children: Vec<&mut Record> = match slot {
                Related::Many(items) => items.iter_mut().collect(),
                Related::One(Some(child)) => vec![&mut **child],
                Related::One(None) => Vec::new(),
            };
            for child in children {
                for (owner, foreign) in &resolved.pairs {
                    copy_key(record, owner, child, foreign);
                }
                self.save(child).await?;
            }
        }
        Ok(())
    }

    async fn insert_row(&mut self, record: &mut Record) -> ModelResult<()> {
        let mapper = Arc::clone(record.mapper());
        mapper.dispatcher().dispatch_instance(EventKind::BeforeInsert, &mapper, record)?;

        if let Some(polymorphic) = mapper.polymorphic() {
            if let Some(identity) = &polymorphic.identity {
                if record.value(&polymorphic.column).is_null() {
                    record.set_raw(&polymorphic.column, identity.clone());
                }
            }
        }

        let table = mapper.table();
        let values = table
            .columns
            .iter()
            .filter_map(|column| match record.get(&column.name) {
                Some(value) if value.is_null() && column.primary_key && column.is_autoincrement(table) => None,
                Some(value) => Some((column.name.clone(), value.clone())),
                None => column.default.clone().map(|value| (column.name.clone(), value)),
            })
            .collect();
        let statement = InsertStatement {
            table: table.name.clone(),
            values,
            returning: table.columns.iter().map(|c| c.name.clone()).collect(),
        };

        let bind = mapper.bind_key();
        let (sql, params) = statement.to_sql_with_params(self.dialect(bind)?);
        let rows = self.fetch_rows(bind, &sql, &params).await?;
        let row = rows
            .first()
            .ok_or_else(|| ModelError::Database(format!("insert into '{}' returned no row", table.name)))?;
        record.set_loaded(decode_row(row, &table.columns)?);

        mapper.dispatcher().dispatch_instance(EventKind::AfterInsert, &mapper, record)?;
        Ok(())
    }

    async fn update_row(&mut self, record: &mut Record) -> ModelResult<()> {
        if !record.is_modified() {
            return Ok(());
        }
        let mapper = Arc::clone(record.mapper());
        mapper.dispatcher().dispatch_instance(EventKind::BeforeUpdate, &mapper, record)?;

        let table = mapper.table();
        let statement = UpdateStatement {
            table: table.name.clone(),
            values: record.modified_values(),
            key: primary_key_values(&mapper, record)?,
            returning: table.columns.iter().map(|c| c.name.clone()).collect(),
        };

        let bind = mapper.bind_key();
        let (sql, params) = statement.to_sql_with_params(self.dialect(bind)?);
        let rows = self.fetch_rows(bind, &sql, &params).await?;
        let row = rows.first().ok_or_else(|| ModelError::NotFound(table.name.clone()))?;
        record.set_loaded(decode_row(row, &table.columns)?);

        mapper.dispatcher().dispatch_instance(EventKind::AfterUpdate, &mapper, record)?;
        Ok(())
    }

    async fn delete_row(&mut self, record: &mut Record) -> ModelResult<()> {
        let mapper = Arc::clone(record.mapper());
        let key = primary_key_values(&mapper, record)?;
        mapper.dispatcher().dispatch_instance(EventKind::BeforeDelete, &mapper, record)?;

        let statement = DeleteStatement {
            table: mapper.table().name.clone(),
            key,
        };
        let bind = mapper.bind_key();
        let (sql, params) = statement.to_sql_with_params(self.dialect(bind)?);
        self.execute(&sql, &params, bind).await?;

        mapper.dispatcher().dispatch_instance(EventKind::AfterDelete, &mapper, record)?;
        record.mark_deleted();
        Ok(())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("engines", &self.engines)
            .field("autoflush", &self.config.autoflush)
            .field("transactions", &self.transactions.keys().collect::<Vec<_>>())
            .field("new", &self.new.len())
            .field("deleted", &self.deleted.len())
            .finish()
    }
}

fn is_relationship(mapper: &Mapper, name: &str, many_to_one: bool) -> bool {
    mapper
        .relationship(name)
        .map_or(false, |r| (r.relationship_type == RelationshipType::BelongsTo) == many_to_one)
}

/// Copy `from.source` into `to.target` when it differs.
fn copy_key(from: &Record, source: &str, to: &mut Record, target: &str) {
    let value = from.value(source);
    if to.value(target) != value {
        to.set_raw(target, value);
        to.mark_modified(target);
    }
}

fn persisted_identity(record: &Record, action: &str) -> ModelResult<Vec<DatabaseValue>> {
    record.identity().map(<[DatabaseValue]>::to_vec).ok_or_else(|| {
        ModelError::Validation(format!(
            "instance of '{}' is not persisted and cannot be {}",
            record.model_name(),
            action
        ))
    })
}

fn primary_key_values(mapper: &Mapper, record: &Record) -> ModelResult<Vec<(String, DatabaseValue)>> {
    let identity = persisted_identity(record, "written by key")?;
    Ok(mapper
        .primary_key()
        .iter()
        .map(|c| c.name.clone())
        .zip(identity)
        .collect())
}

fn decode_row(row: &AnyRow, columns: &[Column]) -> ModelResult<BTreeMap<String, DatabaseValue>> {
    columns
        .iter()
        .map(|c| decode_column(row, &c.name, &c.column_type).map(|v| (c.name.clone(), v)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagerConfig;
    use crate::declarative::ModelBuilder;

    fn session() -> (Session, Arc<Mapper>) {
        let registry = Registry::new();
        let mapper = ModelBuilder::model("Foo")
            .column(Column::integer("_id").primary_key())
            .register(&registry)
            .unwrap();
        let engines = Engines::from_config(&ManagerConfig::default()).unwrap();
        (Session::new(engines, registry, SessionConfig::default()), mapper)
    }

    #[tokio::test]
    async fn test_add_flattens_nested_instances() {
        let (mut session, foo) = session();
        session
            .add(foo.new_record())
            .add(vec![foo.new_record(), foo.new_record()])
            .add((foo.new_record(), [foo.new_record()], Some(vec![foo.new_record()])))
            .add(Option::<Record>::None);
        assert_eq!(session.pending().len(), 6);
    }

    #[tokio::test]
    async fn test_expunge_removes_by_instance() {
        let (mut session, foo) = session();
        let kept = foo.new_record();
        let dropped = foo.new_record();
        let dropped_copy = dropped.clone();
        session.add((kept, dropped));
        session.expunge(&dropped_copy);
        assert_eq!(session.pending().len(), 1);
    }

    #[tokio::test]
    async fn test_transient_records_cannot_expire_or_refresh() {
        let (mut session, foo) = session();
        let mut record = foo.new_record();
        assert!(matches!(session.expire(&mut record), Err(ModelError::Validation(_))));
        assert!(matches!(session.refresh(&mut record).await, Err(ModelError::Validation(_))));
    }

    #[tokio::test]
    async fn test_get_bind_routes_by_bind_key() {
        let (session, foo) = session();
        assert!(session.get_bind(Some(&foo)).is_ok());
        assert!(session.get_bind(None).is_ok());
        assert!(matches!(session.engines().get(Some("nope")), Err(ModelError::UnboundBindKey(_))));
    }
}
