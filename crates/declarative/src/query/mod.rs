//! Model queries.
//!
//! A [`Query`] is a detached, cloneable description of a select over one
//! mapped model. It is executed by passing the session to one of the async
//! terminal methods, so the same query can be re-run (for counting or
//! paging) without rebuilding it.
//!
//! ```ignore
//! let rows = foo
//!     .query()
//!     .join_eager(&["bars"], None)
//!     .filter(bar.col("string").eq("a"))
//!     .order_by(foo.col("_id").desc())
//!     .all(&mut session)
//!     .await?;
//! ```

pub mod builder;
pub mod loading;
pub mod pagination;
pub mod types;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map as JsonMap, Value as JsonValue};
use sqlx::any::AnyRow;

use crate::error::{ModelError, ModelResult};
use crate::mapper::Mapper;
use crate::model::Model;
use crate::record::Record;
use crate::schema::{Column, ColumnType, LoadStrategy, ResolvedRelationship, SqlDialect};
use crate::session::Session;
use crate::value::{decode_column, DatabaseValue};

pub use builder::{
    DeleteStatement, InsertStatement, JoinClause, JoinOn, SelectField, SelectStatement, UpdateStatement,
};
pub use loading::ColumnLoad;
pub use pagination::{Pagination, DEFAULT_PER_PAGE};
pub use types::{
    and_, col, exists, not_, or_, ColumnRef, Condition, JoinType, OrderBy, OrderDirection, QueryOperator,
    SqlWriter,
};

use loading::{LoadDirective, LoadTree};

#[derive(Debug, Clone)]
enum JoinTarget {
    /// Chain of relationships from the queried model; the alias names the
    /// first hop
    Path {
        path: Vec<String>,
        alias: Option<String>,
        eager: bool,
    },
    /// Another model joined on an explicit or inferred condition
    Entity {
        mapper: Arc<Mapper>,
        on: Option<Condition>,
    },
}

#[derive(Debug, Clone)]
struct QueryJoin {
    target: JoinTarget,
    join_type: JoinType,
}

/// One relationship hop of a join path.
struct JoinStep {
    resolved: ResolvedRelationship,
    from_reference: String,
    reference: String,
}

/// Entity populated from joined columns.
struct ContainsStep {
    relationship: String,
    collection: bool,
    mapper: Arc<Mapper>,
    reference: String,
    columns: Vec<Column>,
}

/// Everything needed to run the query once.
struct Plan {
    statement: SelectStatement,
    columns: Vec<Column>,
    contains: Vec<Vec<ContainsStep>>,
    tree: LoadTree,
}

/// Select over a mapped model.
#[derive(Debug, Clone)]
pub struct Query {
    mapper: Arc<Mapper>,
    filters: Vec<Condition>,
    /// `None` falls back to the mapper's default ordering
    order_by: Option<Vec<OrderBy>>,
    limit: Option<i64>,
    offset: Option<i64>,
    distinct: bool,
    joins: Vec<QueryJoin>,
    directives: Vec<LoadDirective>,
    columns: ColumnLoad,
}

fn owned_path(path: &[&str]) -> Vec<String> {
    path.iter().map(|s| s.to_string()).collect()
}

impl Query {
    pub fn new(mapper: Arc<Mapper>) -> Self {
        Self {
            mapper,
            filters: Vec::new(),
            order_by: None,
            limit: None,
            offset: None,
            distinct: false,
            joins: Vec::new(),
            directives: Vec::new(),
            columns: ColumnLoad::default(),
        }
    }

    /// The queried model.
    pub fn mapper(&self) -> &Arc<Mapper> {
        &self.mapper
    }

    pub fn filter(mut self, condition: Condition) -> Self {
        self.filters.push(condition);
        self
    }

    /// Equality filters on the most recently joined entity, or on the
    /// queried model when nothing is joined.
    pub fn filter_by<I, K, V>(mut self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<DatabaseValue>,
    {
        let reference = self.last_join_reference();
        for (key, value) in pairs {
            self.filters.push(ColumnRef::new(&reference, key.as_ref()).eq(value));
        }
        self
    }

    fn last_join_reference(&self) -> String {
        let fallback = self.mapper.table().name.clone();
        match self.joins.last().map(|j| &j.target) {
            Some(JoinTarget::Path { .. }) => self
                .join_steps()
                .ok()
                .and_then(|steps| steps.last().map(|s| s.reference.clone()))
                .unwrap_or(fallback),
            Some(JoinTarget::Entity { mapper, .. }) => mapper.table().name.clone(),
            None => fallback,
        }
    }

    /// Append an ordering term.
    pub fn order_by(mut self, order: OrderBy) -> Self {
        let mut current = self.order_by.take().unwrap_or_default();
        current.push(order);
        self.order_by = Some(current);
        self
    }

    /// Drop every ordering, including the model's default.
    pub fn order_by_none(mut self) -> Self {
        self.order_by = Some(Vec::new());
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: i64) -> Self {
        self.offset = Some(offset.max(0));
        self
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    fn push_path_join(mut self, path: &[&str], alias: Option<&str>, join_type: JoinType, eager: bool) -> Self {
        self.joins.push(QueryJoin {
            target: JoinTarget::Path {
                path: owned_path(path),
                alias: alias.map(str::to_string),
                eager,
            },
            join_type,
        });
        self
    }

    /// Inner join along a relationship path.
    pub fn join(self, path: &[&str]) -> Self {
        self.push_path_join(path, None, JoinType::Inner, false)
    }

    /// Inner join along a relationship path, naming the first hop `alias`.
    pub fn join_as(self, alias: &str, path: &[&str]) -> Self {
        self.push_path_join(path, Some(alias), JoinType::Inner, false)
    }

    pub fn outerjoin(self, path: &[&str]) -> Self {
        self.push_path_join(path, None, JoinType::Left, false)
    }

    pub fn outerjoin_as(self, alias: &str, path: &[&str]) -> Self {
        self.push_path_join(path, Some(alias), JoinType::Left, false)
    }

    /// Join another model. Without `on`, the condition is taken from a
    /// relationship of the queried model targeting it.
    pub fn join_entity(mut self, mapper: &Arc<Mapper>, on: Option<Condition>) -> Self {
        self.joins.push(QueryJoin {
            target: JoinTarget::Entity {
                mapper: Arc::clone(mapper),
                on,
            },
            join_type: JoinType::Inner,
        });
        self
    }

    pub fn outerjoin_entity(mut self, mapper: &Arc<Mapper>, on: Option<Condition>) -> Self {
        self.joins.push(QueryJoin {
            target: JoinTarget::Entity {
                mapper: Arc::clone(mapper),
                on,
            },
            join_type: JoinType::Left,
        });
        self
    }

    /// Join along a path and populate each relationship on it from the
    /// joined rows.
    pub fn join_eager(self, path: &[&str], alias: Option<&str>) -> Self {
        self.push_path_join(path, alias, JoinType::Inner, true)
    }

    pub fn outerjoin_eager(self, path: &[&str], alias: Option<&str>) -> Self {
        self.push_path_join(path, alias, JoinType::Left, true)
    }

    fn load(mut self, path: &[&str], strategy: LoadStrategy) -> Self {
        self.directives.push(LoadDirective::Strategy {
            path: owned_path(path),
            strategy,
        });
        self
    }

    pub fn joinedload(self, path: &[&str]) -> Self {
        self.load(path, LoadStrategy::Joined)
    }

    pub fn immediateload(self, path: &[&str]) -> Self {
        self.load(path, LoadStrategy::Immediate)
    }

    pub fn subqueryload(self, path: &[&str]) -> Self {
        self.load(path, LoadStrategy::Subquery)
    }

    pub fn selectinload(self, path: &[&str]) -> Self {
        self.load(path, LoadStrategy::SelectIn)
    }

    pub fn lazyload(self, path: &[&str]) -> Self {
        self.load(path, LoadStrategy::Lazy)
    }

    pub fn noload(self, path: &[&str]) -> Self {
        self.load(path, LoadStrategy::NoLoad)
    }

    /// Select only these columns (plus the primary key).
    pub fn load_only(mut self, columns: &[&str]) -> Self {
        self.columns.load_only(columns.iter().copied());
        self
    }

    pub fn defer(mut self, columns: &[&str]) -> Self {
        for column in columns {
            self.columns.defer(column);
        }
        self
    }

    pub fn undefer(mut self, columns: &[&str]) -> Self {
        for column in columns {
            self.columns.undefer(column);
        }
        self
    }

    pub fn undefer_group(mut self, group: &str) -> Self {
        self.columns.undefer_group(group);
        self
    }

    /// Limit and offset selecting one page. A negative page size counts
    /// as zero.
    pub fn page(self, page: i64, per_page: Option<i64>) -> Self {
        let per_page = per_page.unwrap_or(DEFAULT_PER_PAGE).max(0);
        self.limit(per_page)
            .offset(page.saturating_sub(1).saturating_mul(per_page))
    }

    /// Models selected by this query.
    pub fn entities(&self) -> Vec<Arc<Mapper>> {
        vec![Arc::clone(&self.mapper)]
    }

    /// Models brought in by joins, in join order.
    pub fn join_entities(&self) -> ModelResult<Vec<Arc<Mapper>>> {
        let mut entities: Vec<Arc<Mapper>> = Vec::new();
        let mut push = |mapper: &Arc<Mapper>| {
            if !entities.iter().any(|m| m.name() == mapper.name()) {
                entities.push(Arc::clone(mapper));
            }
        };
        for join in &self.joins {
            match &join.target {
                JoinTarget::Path { path, alias, .. } => {
                    for step in self.resolve_path(path, alias.as_deref())? {
                        push(&step.resolved.target);
                    }
                }
                JoinTarget::Entity { mapper, .. } => push(mapper),
            }
        }
        Ok(entities)
    }

    pub fn all_entities(&self) -> ModelResult<Vec<Arc<Mapper>>> {
        let mut entities = self.entities();
        entities.extend(self.join_entities()?);
        Ok(entities)
    }

    /// AND of each entity's advanced search.
    pub fn advanced_search(self, search: &JsonMap<String, JsonValue>) -> ModelResult<Self> {
        let filters: Vec<Condition> = self
            .all_entities()?
            .iter()
            .filter_map(|mapper| mapper.advanced_search(search))
            .collect();
        Ok(if filters.is_empty() { self } else { self.filter(and_(filters)) })
    }

    /// OR of each entity's simple search.
    pub fn simple_search(self, search: &str) -> ModelResult<Self> {
        let filters: Vec<Condition> = self
            .all_entities()?
            .iter()
            .filter_map(|mapper| mapper.simple_search(search))
            .collect();
        Ok(if filters.is_empty() { self } else { self.filter(or_(filters)) })
    }

    /// Simple and advanced search plus limit and offset in one call.
    pub fn search(
        self,
        search_string: Option<&str>,
        search_dict: Option<&JsonMap<String, JsonValue>>,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> ModelResult<Self> {
        let mut query = self;
        if let Some(search_string) = search_string {
            query = query.simple_search(search_string)?;
        }
        if let Some(search_dict) = search_dict {
            query = query.advanced_search(search_dict)?;
        }
        if let Some(limit) = limit {
            query = query.limit(limit);
        }
        if let Some(offset) = offset {
            query = query.offset(offset);
        }
        Ok(query)
    }

    fn resolve_path(&self, path: &[String], alias: Option<&str>) -> ModelResult<Vec<JoinStep>> {
        let mut steps = Vec::with_capacity(path.len());
        let mut owner = Arc::clone(&self.mapper);
        let mut from_reference = self.mapper.table().name.clone();
        for (depth, name) in path.iter().enumerate() {
            let resolved = owner.resolve_relationship(name)?;
            let reference = match alias {
                Some(alias) if depth == 0 => alias.to_string(),
                _ => resolved.target.table().name.clone(),
            };
            owner = Arc::clone(&resolved.target);
            steps.push(JoinStep {
                resolved,
                from_reference: std::mem::replace(&mut from_reference, reference.clone()),
                reference,
            });
        }
        Ok(steps)
    }

    fn join_steps(&self) -> ModelResult<Vec<JoinStep>> {
        match self.joins.last().map(|j| &j.target) {
            Some(JoinTarget::Path { path, alias, .. }) => self.resolve_path(path, alias.as_deref()),
            _ => Ok(Vec::new()),
        }
    }

    /// Join condition from a relationship of the queried model targeting
    /// `target`.
    fn entity_join(&self, target: &Arc<Mapper>) -> ModelResult<JoinOn> {
        let relationship = self
            .mapper
            .relationship_defs()
            .iter()
            .find(|r| r.target == target.name())
            .ok_or_else(|| {
                ModelError::Configuration(format!(
                    "no relationship from '{}' to '{}'; pass an explicit join condition",
                    self.mapper.name(),
                    target.name()
                ))
            })?;
        let resolved = self.mapper.resolve_relationship(&relationship.name)?;
        let owner_table = &self.mapper.table().name;
        let target_table = &target.table().name;
        Ok(JoinOn::Columns(
            resolved
                .pairs
                .iter()
                .map(|(owner, related)| {
                    (ColumnRef::new(owner_table, owner), ColumnRef::new(target_table, related))
                })
                .collect(),
        ))
    }

    fn plan(&self) -> ModelResult<Plan> {
        self.columns.validate(&self.mapper)?;

        let table = self.mapper.table().name.clone();
        let columns = self.columns.columns(&self.mapper);

        let mut statement = SelectStatement::new(&table);
        statement.distinct = self.distinct;
        statement.select_fields = loading::select_fields(&table, &columns);

        let mut contains = Vec::new();
        let mut directives = self.directives.clone();

        for join in &self.joins {
            match &join.target {
                JoinTarget::Path { path, alias, eager } => {
                    let steps = self.resolve_path(path, alias.as_deref())?;
                    for step in &steps {
                        if statement.has_reference(&step.reference) {
                            continue;
                        }
                        let target_table = step.resolved.target.table().name.clone();
                        let pairs = step
                            .resolved
                            .pairs
                            .iter()
                            .map(|(owner, related)| {
                                (
                                    ColumnRef::new(&step.from_reference, owner),
                                    ColumnRef::new(&step.reference, related),
                                )
                            })
                            .collect();
                        statement.joins.push(JoinClause {
                            join_type: join.join_type,
                            alias: (step.reference != target_table).then(|| step.reference.clone()),
                            table: target_table,
                            on: JoinOn::Columns(pairs),
                        });
                    }

                    if *eager {
                        let mut populated = Vec::with_capacity(steps.len());
                        for step in steps {
                            let step_columns = ColumnLoad::default().columns(&step.resolved.target);
                            statement
                                .select_fields
                                .extend(loading::select_fields(&step.reference, &step_columns));
                            populated.push(ContainsStep {
                                relationship: step.resolved.name().to_string(),
                                collection: step.resolved.is_collection(),
                                mapper: Arc::clone(&step.resolved.target),
                                reference: step.reference,
                                columns: step_columns,
                            });
                        }
                        directives.push(LoadDirective::Contains {
                            path: path.clone(),
                            references: populated.iter().map(|s| s.reference.clone()).collect(),
                        });
                        contains.push(populated);
                    }
                }
                JoinTarget::Entity { mapper, on } => {
                    let on = match on {
                        Some(condition) => JoinOn::Condition(condition.clone()),
                        None => self.entity_join(mapper)?,
                    };
                    statement.joins.push(JoinClause {
                        join_type: join.join_type,
                        table: mapper.table().name.clone(),
                        alias: None,
                        on,
                    });
                }
            }
        }

        statement.where_conditions = self.filters.clone();
        if let Some(condition) = loading::polymorphic_filter(&self.mapper) {
            statement.where_conditions.push(condition);
        }
        statement.order_by = self
            .order_by
            .clone()
            .unwrap_or_else(|| self.mapper.default_order_by().to_vec());
        statement.limit_count = self.limit;
        statement.offset_value = self.offset;

        let tree = loading::build_tree(&self.mapper, &directives)?;
        Ok(Plan {
            statement,
            columns,
            contains,
            tree,
        })
    }

    /// The select statement this query runs.
    pub fn statement(&self) -> ModelResult<SelectStatement> {
        Ok(self.plan()?.statement)
    }

    /// Rendered SQL and parameters for `dialect`.
    pub fn to_sql(&self, dialect: SqlDialect) -> ModelResult<(String, Vec<DatabaseValue>)> {
        let registry = self.mapper.registry()?;
        self.statement()?.to_sql_with_params(dialect, &registry)
    }

    fn hydrate(&self, rows: &[AnyRow], plan: &Plan) -> ModelResult<Vec<Record>> {
        let table = &self.mapper.table().name;
        let mut records: Vec<Record> = Vec::with_capacity(rows.len());
        let mut positions: HashMap<String, usize> = HashMap::new();

        for row in rows {
            let values = loading::decode_entity(row, table, &plan.columns)?;
            let record = Record::loaded(Arc::clone(&self.mapper), values);

            let identity_key = record.identity().map(|identity| format!("{:?}", identity));
            let position = match identity_key {
                Some(key) if !plan.contains.is_empty() => match positions.get(&key).copied() {
                    Some(position) => position,
                    None => {
                        records.push(record);
                        positions.insert(key, records.len() - 1);
                        records.len() - 1
                    }
                },
                _ => {
                    records.push(record);
                    records.len() - 1
                }
            };

            for path in &plan.contains {
                let mut current: &mut Record = &mut records[position];
                for step in path {
                    let values = loading::decode_entity(row, &step.reference, &step.columns)?;
                    if step.mapper.identity_of(&values).is_none() {
                        current.ensure_related_loaded(&step.relationship, step.collection);
                        break;
                    }
                    let child = Record::loaded(Arc::clone(&step.mapper), values);
                    current = current.attach_loaded(&step.relationship, step.collection, child);
                }
            }
        }
        Ok(records)
    }

    async fn execute(&self, session: &mut Session) -> ModelResult<Vec<Record>> {
        session.autoflush_pending().await?;

        let plan = self.plan()?;
        let registry = self.mapper.registry()?;
        let bind = self.mapper.bind_key();
        let dialect = session.dialect(bind)?;
        let (sql, params) = plan.statement.to_sql_with_params(dialect, &registry)?;

        let rows = session.fetch_rows(bind, &sql, &params).await?;
        let mut records = self.hydrate(&rows, &plan)?;
        for record in records.iter_mut() {
            loading::fire_load(record)?;
        }
        loading::load_tree(session, Arc::clone(&self.mapper), &mut records, &plan.tree).await?;
        Ok(records)
    }

    pub async fn all(&self, session: &mut Session) -> ModelResult<Vec<Record>> {
        self.execute(session).await
    }

    pub async fn first(&self, session: &mut Session) -> ModelResult<Option<Record>> {
        let records = self.clone().limit(1).execute(session).await?;
        Ok(records.into_iter().next())
    }

    /// Exactly one result.
    pub async fn one(&self, session: &mut Session) -> ModelResult<Record> {
        let mut records = self.execute(session).await?;
        match records.len() {
            0 => Err(ModelError::NotFound(self.mapper.table().name.clone())),
            1 => Ok(records.remove(0)),
            _ => Err(ModelError::MultipleResultsFound(self.mapper.table().name.clone())),
        }
    }

    /// Load by a single-column primary key.
    pub async fn get<V: Into<DatabaseValue>>(&self, session: &mut Session, id: V) -> ModelResult<Option<Record>> {
        self.get_by_identity(session, vec![id.into()]).await
    }

    /// Load by primary key values in key column order.
    pub async fn get_by_identity(
        &self,
        session: &mut Session,
        identity: Vec<DatabaseValue>,
    ) -> ModelResult<Option<Record>> {
        let pk: Vec<String> = self.mapper.primary_key().iter().map(|c| c.name.clone()).collect();
        if pk.len() != identity.len() {
            return Err(ModelError::Validation(format!(
                "'{}' has {} primary key column(s), got {} value(s)",
                self.mapper.name(),
                pk.len(),
                identity.len()
            )));
        }
        let table = self.mapper.table().name.clone();
        let mut query = self.clone();
        for (column, value) in pk.iter().zip(identity) {
            query = query.filter(ColumnRef::new(&table, column).eq(value));
        }
        query.first(session).await
    }

    /// Number of rows the query returns.
    pub async fn count(&self, session: &mut Session) -> ModelResult<i64> {
        session.autoflush_pending().await?;

        let registry = self.mapper.registry()?;
        let bind = self.mapper.bind_key();
        let dialect = session.dialect(bind)?;
        let (sql, params) = self.plan()?.statement.to_count_sql(dialect, &registry)?;

        let rows = session.fetch_rows(bind, &sql, &params).await?;
        let row = rows
            .first()
            .ok_or_else(|| ModelError::Database("count returned no rows".to_string()))?;
        let count = decode_column(row, "count", &ColumnType::BigInteger)?;
        Ok(count.as_i64().unwrap_or(0))
    }

    /// Whether the query matches any row.
    pub async fn exists(&self, session: &mut Session) -> ModelResult<bool> {
        session.autoflush_pending().await?;

        let registry = self.mapper.registry()?;
        let bind = self.mapper.bind_key();
        let dialect = session.dialect(bind)?;
        let mut statement = self.plan()?.statement;
        statement.select_fields = vec![SelectField::Expr("1".to_string())];
        statement.order_by.clear();
        let (sql, params) = statement.to_exists_sql(dialect, &registry)?;

        let rows = session.fetch_rows(bind, &sql, &params).await?;
        let value = match rows.first() {
            Some(row) => decode_column(row, "anon_1", &ColumnType::Boolean)?,
            None => DatabaseValue::Bool(false),
        };
        Ok(value.as_bool().unwrap_or(false))
    }

    /// Apply `f` to every result.
    pub async fn map<T, F>(&self, session: &mut Session, f: F) -> ModelResult<Vec<T>>
    where
        F: FnMut(Record) -> T,
    {
        Ok(self.all(session).await?.into_iter().map(f).collect())
    }

    /// Left fold over the results.
    pub async fn reduce<T, F>(&self, session: &mut Session, initial: T, f: F) -> ModelResult<T>
    where
        F: FnMut(T, Record) -> T,
    {
        Ok(self.all(session).await?.into_iter().fold(initial, f))
    }

    /// Fold over the results in reverse order.
    pub async fn reduce_right<T, F>(&self, session: &mut Session, initial: T, f: F) -> ModelResult<T>
    where
        F: FnMut(T, Record) -> T,
    {
        Ok(self.all(session).await?.into_iter().rev().fold(initial, f))
    }

    /// One attribute of every result; null where the attribute is absent.
    pub async fn pluck(&self, session: &mut Session, attribute: &str) -> ModelResult<Vec<DatabaseValue>> {
        let records = self.all(session).await?;
        Ok(records
            .iter()
            .map(|record| match record.get(attribute) {
                Some(value) => value.clone(),
                None => record.hybrid(attribute).unwrap_or(DatabaseValue::Null),
            })
            .collect())
    }

    /// Results converted into a typed model.
    pub async fn all_as<T: Model>(&self, session: &mut Session) -> ModelResult<Vec<T>> {
        self.all(session)
            .await?
            .iter()
            .map(T::from_record)
            .collect()
    }

    /// Fetch one page. `page < 1`, or an empty page past the first, is an
    /// error when `error_out` is set.
    pub async fn paginate(
        &self,
        session: &mut Session,
        page: i64,
        per_page: Option<i64>,
        error_out: bool,
    ) -> ModelResult<Pagination> {
        if error_out && page < 1 {
            return Err(ModelError::IndexOutOfRange { page });
        }

        let per_page = per_page.unwrap_or(DEFAULT_PER_PAGE).max(0);
        let items = self.clone().page(page, Some(per_page)).all(session).await?;

        if items.is_empty() && page != 1 && error_out {
            return Err(ModelError::IndexOutOfRange { page });
        }

        // First page short of a full page already holds everything
        let total = if page == 1 && (items.len() as i64) < per_page {
            items.len() as i64
        } else {
            self.clone().order_by_none().count(session).await?
        };

        Ok(Pagination::new(self.clone(), page, per_page, total, items))
    }
}
