//! Tables, positional table constructs and the metadata collection.

use std::collections::{BTreeSet, HashMap};

use serde_json::Value as JsonValue;

use crate::declarative::args::{ArgOptions, FragmentEntry};
use crate::error::{ModelError, ModelResult};
use crate::schema::{Column, ColumnType, SqlDialect};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Index {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

impl Index {
    pub fn new<I, S>(name: &str, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.to_string(),
            columns: columns.into_iter().map(Into::into).collect(),
            unique: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueConstraint {
    pub name: Option<String>,
    pub columns: Vec<String>,
}

impl UniqueConstraint {
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: None,
            columns: columns.into_iter().map(Into::into).collect(),
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckConstraint {
    pub name: Option<String>,
    pub expression: String,
}

impl CheckConstraint {
    pub fn new(expression: &str) -> Self {
        Self {
            name: None,
            expression: expression.to_string(),
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }
}

/// Positional table argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableArg {
    Index(Index),
    Unique(UniqueConstraint),
    Check(CheckConstraint),
}

impl From<Index> for TableArg {
    fn from(index: Index) -> Self {
        TableArg::Index(index)
    }
}

impl From<UniqueConstraint> for TableArg {
    fn from(constraint: UniqueConstraint) -> Self {
        TableArg::Unique(constraint)
    }
}

impl From<CheckConstraint> for TableArg {
    fn from(constraint: CheckConstraint) -> Self {
        TableArg::Check(constraint)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    pub name: String,
    pub columns: Vec<Column>,
    pub args: Vec<TableArg>,
    pub options: ArgOptions,
}

impl Table {
    pub fn new(name: &str, columns: Vec<Column>) -> Self {
        Self {
            name: name.to_string(),
            columns,
            args: Vec::new(),
            options: ArgOptions::new(),
        }
    }

    /// Build a table from constructor-style arguments: positional items with
    /// an optional options map as the final element.
    pub fn from_call_args(
        name: &str,
        columns: Vec<Column>,
        call_args: Vec<FragmentEntry<TableArg>>,
    ) -> ModelResult<Self> {
        let mut table = Self::new(name, columns);
        let count = call_args.len();
        for (position, entry) in call_args.into_iter().enumerate() {
            match entry {
                FragmentEntry::Arg(arg) => table.args.push(arg),
                FragmentEntry::Options(options) if position + 1 == count => table.options = options,
                FragmentEntry::Options(_) => {
                    return Err(ModelError::Configuration(format!(
                        "table '{}' options must be the last constructor argument",
                        name
                    )))
                }
            }
        }
        Ok(table)
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn primary_key(&self) -> Vec<&Column> {
        self.columns.iter().filter(|c| c.primary_key).collect()
    }

    /// Bind key stored in the table info (`info.bind_key`) or at the top level.
    pub fn bind_key(&self) -> Option<&str> {
        self.options
            .get("info")
            .and_then(|info| info.get("bind_key"))
            .or_else(|| self.options.get("bind_key"))
            .and_then(JsonValue::as_str)
    }

    pub(crate) fn set_bind_key(&mut self, bind_key: &str) {
        let info = self
            .options
            .entry("info".to_string())
            .or_insert_with(|| JsonValue::Object(serde_json::Map::new()));
        if let JsonValue::Object(map) = info {
            map.insert("bind_key".to_string(), JsonValue::String(bind_key.to_string()));
        }
    }

    /// Tables referenced through foreign keys, excluding self references.
    pub fn dependencies(&self) -> BTreeSet<String> {
        self.columns
            .iter()
            .filter_map(|c| c.foreign_key.as_ref())
            .map(|fk| fk.table.clone())
            .filter(|table| table != &self.name)
            .collect()
    }

    fn column_ddl(&self, column: &Column, dialect: SqlDialect, single_pk: bool) -> String {
        let mut ddl = dialect.quote(&column.name);
        ddl.push(' ');

        if column.is_autoincrement(self) {
            match dialect {
                SqlDialect::SQLite => ddl.push_str("INTEGER PRIMARY KEY"),
                SqlDialect::PostgreSQL => {
                    ddl.push_str(match column.column_type {
                        ColumnType::BigInteger => "BIGSERIAL PRIMARY KEY",
                        _ => "SERIAL PRIMARY KEY",
                    });
                }
            }
        } else {
            ddl.push_str(&column.column_type.ddl(dialect));
            if column.primary_key && single_pk {
                ddl.push_str(" PRIMARY KEY");
            } else if !column.nullable {
                ddl.push_str(" NOT NULL");
            }
        }

        if column.unique && !column.primary_key {
            ddl.push_str(" UNIQUE");
        }
        if let Some(default) = &column.default {
            ddl.push_str(" DEFAULT ");
            ddl.push_str(&default.to_sql_literal());
        }
        if let Some(fk) = &column.foreign_key {
            ddl.push_str(&format!(
                " REFERENCES {} ({})",
                dialect.quote(&fk.table),
                dialect.quote(&fk.column)
            ));
            if let Some(action) = &fk.on_delete {
                ddl.push_str(" ON DELETE ");
                ddl.push_str(action);
            }
        }
        ddl
    }

    /// `CREATE TABLE` followed by its `CREATE INDEX` statements.
    pub fn create_statements(&self, dialect: SqlDialect) -> Vec<String> {
        let pk_columns: Vec<&Column> = self.primary_key();
        let single_pk = pk_columns.len() == 1;

        let mut definitions: Vec<String> = self
            .columns
            .iter()
            .map(|column| self.column_ddl(column, dialect, single_pk))
            .collect();

        if pk_columns.len() > 1 {
            let names: Vec<String> = pk_columns.iter().map(|c| dialect.quote(&c.name)).collect();
            definitions.push(format!("PRIMARY KEY ({})", names.join(", ")));
        }

        let mut constraint_names = BTreeSet::new();
        for column in &self.columns {
            if let ColumnType::Enum(enum_type) = &column.column_type {
                let mut name = enum_type.constraint_name();
                if !constraint_names.insert(name.clone()) {
                    name = format!("{}_{}", name, column.name);
                    constraint_names.insert(name.clone());
                }
                let values: Vec<String> = enum_type
                    .values
                    .iter()
                    .map(|v| format!("'{}'", v.replace('\'', "''")))
                    .collect();
                definitions.push(format!(
                    "CONSTRAINT {} CHECK ({} IN ({}))",
                    dialect.quote(&name),
                    dialect.quote(&column.name),
                    values.join(", ")
                ));
            }
        }

        let mut indexes = Vec::new();
        for arg in &self.args {
            match arg {
                TableArg::Unique(unique) => {
                    let columns: Vec<String> = unique.columns.iter().map(|c| dialect.quote(c)).collect();
                    let prefix = unique
                        .name
                        .as_ref()
                        .map(|n| format!("CONSTRAINT {} ", dialect.quote(n)))
                        .unwrap_or_default();
                    definitions.push(format!("{}UNIQUE ({})", prefix, columns.join(", ")));
                }
                TableArg::Check(check) => {
                    let prefix = check
                        .name
                        .as_ref()
                        .map(|n| format!("CONSTRAINT {} ", dialect.quote(n)))
                        .unwrap_or_default();
                    definitions.push(format!("{}CHECK ({})", prefix, check.expression));
                }
                TableArg::Index(index) if !index.columns.is_empty() => {
                    indexes.push(self.index_ddl(&index.name, &index.columns, index.unique, dialect));
                }
                TableArg::Index(_) => {}
            }
        }

        for column in self.columns.iter().filter(|c| c.index) {
            let name = format!("ix_{}_{}", self.name, column.name);
            indexes.push(self.index_ddl(&name, std::slice::from_ref(&column.name), false, dialect));
        }

        let mut statements = vec![format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            dialect.quote(&self.name),
            definitions.join(", ")
        )];
        statements.extend(indexes);
        statements
    }

    fn index_ddl(&self, name: &str, columns: &[String], unique: bool, dialect: SqlDialect) -> String {
        let columns: Vec<String> = columns.iter().map(|c| dialect.quote(c)).collect();
        format!(
            "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
            if unique { "UNIQUE " } else { "" },
            dialect.quote(name),
            dialect.quote(&self.name),
            columns.join(", ")
        )
    }

    pub fn drop_statement(&self, dialect: SqlDialect) -> String {
        format!("DROP TABLE IF EXISTS {}", dialect.quote(&self.name))
    }
}

/// Collection of every table registered through a registry.
#[derive(Debug, Clone, Default)]
pub struct MetaData {
    tables: Vec<Table>,
}

impl MetaData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a table. Re-adding an identical definition is a no-op.
    pub fn add_table(&mut self, table: Table) -> ModelResult<()> {
        match self.tables.iter().find(|t| t.name == table.name) {
            Some(existing) if existing == &table => Ok(()),
            Some(_) => Err(ModelError::Configuration(format!(
                "table '{}' is already defined for this metadata",
                table.name
            ))),
            None => {
                self.tables.push(table);
                Ok(())
            }
        }
    }

    /// Append columns to an existing table (single-table inheritance).
    pub(crate) fn extend_table(&mut self, name: &str, columns: &[Column]) -> ModelResult<()> {
        let table = self
            .tables
            .iter_mut()
            .find(|t| t.name == name)
            .ok_or_else(|| ModelError::Configuration(format!("unknown table '{}'", name)))?;
        for column in columns {
            if table.column(&column.name).is_none() {
                table.columns.push(column.clone());
            }
        }
        Ok(())
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn tables(&self) -> &[Table] {
        &self.tables
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Tables in dependency order (referenced tables first).
    ///
    /// Cycles fall back to registration order for the tables involved.
    pub fn sorted_tables(&self) -> Vec<&Table> {
        let names: BTreeSet<&str> = self.tables.iter().map(|t| t.name.as_str()).collect();
        let mut remaining: HashMap<&str, BTreeSet<String>> = self
            .tables
            .iter()
            .map(|t| {
                let deps = t
                    .dependencies()
                    .into_iter()
                    .filter(|d| names.contains(d.as_str()))
                    .collect();
                (t.name.as_str(), deps)
            })
            .collect();

        let mut sorted: Vec<&Table> = Vec::with_capacity(self.tables.len());
        while sorted.len() < self.tables.len() {
            let ready: Vec<&Table> = self
                .tables
                .iter()
                .filter(|t| {
                    remaining
                        .get(t.name.as_str())
                        .map(|deps| deps.is_empty())
                        .unwrap_or(false)
                })
                .collect();

            let batch = if ready.is_empty() {
                self.tables
                    .iter()
                    .filter(|t| remaining.contains_key(t.name.as_str()))
                    .take(1)
                    .collect()
            } else {
                ready
            };

            for table in batch {
                remaining.remove(table.name.as_str());
                for deps in remaining.values_mut() {
                    deps.remove(&table.name);
                }
                sorted.push(table);
            }
        }
        sorted
    }

    /// Tables routed to a bind key (`None` is the default bind).
    pub fn tables_for_bind(&self, bind: Option<&str>) -> Vec<&Table> {
        self.sorted_tables()
            .into_iter()
            .filter(|t| t.bind_key() == bind)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn foo_table() -> Table {
        Table::new(
            "foo",
            vec![
                Column::integer("_id").primary_key(),
                Column::string("string").index(),
                Column::integer("number").default_value(3),
            ],
        )
    }

    #[test]
    fn test_from_call_args_takes_trailing_options() {
        let mut options = ArgOptions::new();
        options.insert("comment".to_string(), serde_json::json!("foo table"));
        let table = Table::from_call_args(
            "foo",
            vec![Column::integer("_id").primary_key()],
            vec![
                FragmentEntry::Arg(Index::new("a", Vec::<String>::new()).into()),
                FragmentEntry::Options(options.clone()),
            ],
        )
        .unwrap();

        assert_eq!(table.args.len(), 1);
        assert_eq!(table.options, options);
    }

    #[test]
    fn test_from_call_args_rejects_leading_options() {
        let result = Table::from_call_args(
            "foo",
            vec![],
            vec![
                FragmentEntry::Options(ArgOptions::new()),
                FragmentEntry::Arg(Index::new("a", ["x"]).into()),
            ],
        );
        assert!(matches!(result, Err(ModelError::Configuration(_))));
    }

    #[test]
    fn test_create_statements_sqlite() {
        let statements = foo_table().create_statements(SqlDialect::SQLite);
        assert_eq!(
            statements[0],
            "CREATE TABLE IF NOT EXISTS \"foo\" (\"_id\" INTEGER PRIMARY KEY, \"string\" VARCHAR, \"number\" INTEGER DEFAULT 3)"
        );
        assert_eq!(
            statements[1],
            "CREATE INDEX IF NOT EXISTS \"ix_foo_string\" ON \"foo\" (\"string\")"
        );
    }

    #[test]
    fn test_create_statements_postgres_serial() {
        let statements = foo_table().create_statements(SqlDialect::PostgreSQL);
        assert!(statements[0].contains("\"_id\" SERIAL PRIMARY KEY"));
    }

    #[test]
    fn test_composite_primary_key() {
        let table = Table::new(
            "pair",
            vec![
                Column::integer("a").primary_key(),
                Column::integer("b").primary_key(),
            ],
        );
        let ddl = &table.create_statements(SqlDialect::SQLite)[0];
        assert!(ddl.contains("\"a\" INTEGER NOT NULL"));
        assert!(ddl.contains("PRIMARY KEY (\"a\", \"b\")"));
    }

    #[test]
    fn test_bind_key_from_info() {
        let mut table = foo_table();
        assert_eq!(table.bind_key(), None);
        table.set_bind_key("reports");
        assert_eq!(table.bind_key(), Some("reports"));
    }

    #[test]
    fn test_sorted_tables_dependency_order() {
        let mut metadata = MetaData::new();
        metadata
            .add_table(Table::new(
                "bar",
                vec![
                    Column::integer("_id").primary_key(),
                    Column::integer("foo_id").foreign_key("foo._id"),
                ],
            ))
            .unwrap();
        metadata.add_table(foo_table()).unwrap();

        let order: Vec<&str> = metadata.sorted_tables().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(order, vec!["foo", "bar"]);
    }

    #[test]
    fn test_add_table_conflict() {
        let mut metadata = MetaData::new();
        metadata.add_table(foo_table()).unwrap();
        metadata.add_table(foo_table()).unwrap();
        let conflict = metadata.add_table(Table::new("foo", vec![]));
        assert!(conflict.is_err());
    }
}
