//! Column definitions and column types.

use std::fmt;
use std::sync::Arc;

use crate::declarative::tablename::camel_to_snake;
use crate::declarative::ModelDeclaration;
use crate::schema::SqlDialect;
use crate::value::DatabaseValue;

/// Storage type of a column
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnType {
    Integer,
    BigInteger,
    Float,
    Boolean,
    String(Option<u32>),
    Text,
    Json,
    Binary,
    DateTime,
    Uuid,
    Enum(EnumColumnType),
}

/// Enum column: stores the symbol value and constrains it to the known values.
#[derive(Debug, Clone, PartialEq)]
pub struct EnumColumnType {
    pub name: String,
    pub values: Vec<String>,
}

impl EnumColumnType {
    pub fn new<I, S>(name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.to_string(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// `ck_` followed by the snake-cased type name.
    pub fn constraint_name(&self) -> String {
        format!("ck_{}", camel_to_snake(&self.name))
    }

    fn max_len(&self) -> usize {
        self.values.iter().map(|v| v.len()).max().unwrap_or(1).max(1)
    }
}

impl ColumnType {
    pub fn is_integer(&self) -> bool {
        matches!(self, ColumnType::Integer | ColumnType::BigInteger)
    }

    pub(crate) fn ddl(&self, dialect: SqlDialect) -> String {
        match (self, dialect) {
            (ColumnType::Integer, _) => "INTEGER".to_string(),
            (ColumnType::BigInteger, _) => "BIGINT".to_string(),
            (ColumnType::Float, SqlDialect::SQLite) => "REAL".to_string(),
            (ColumnType::Float, SqlDialect::PostgreSQL) => "DOUBLE PRECISION".to_string(),
            // SQLite's declared BOOLEAN has no `Any` mapping
            (ColumnType::Boolean, SqlDialect::SQLite) => "INTEGER".to_string(),
            (ColumnType::Boolean, SqlDialect::PostgreSQL) => "BOOLEAN".to_string(),
            (ColumnType::String(Some(len)), _) => format!("VARCHAR({})", len),
            (ColumnType::String(None), _) => "VARCHAR".to_string(),
            (ColumnType::Text, _) | (ColumnType::Json, _) | (ColumnType::DateTime, _) => {
                "TEXT".to_string()
            }
            (ColumnType::Binary, SqlDialect::SQLite) => "BLOB".to_string(),
            (ColumnType::Binary, SqlDialect::PostgreSQL) => "BYTEA".to_string(),
            (ColumnType::Uuid, _) => "VARCHAR(36)".to_string(),
            (ColumnType::Enum(enum_type), _) => format!("VARCHAR({})", enum_type.max_len()),
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Integer => write!(f, "integer"),
            ColumnType::BigInteger => write!(f, "big integer"),
            ColumnType::Float => write!(f, "float"),
            ColumnType::Boolean => write!(f, "boolean"),
            ColumnType::String(_) => write!(f, "string"),
            ColumnType::Text => write!(f, "text"),
            ColumnType::Json => write!(f, "json"),
            ColumnType::Binary => write!(f, "binary"),
            ColumnType::DateTime => write!(f, "datetime"),
            ColumnType::Uuid => write!(f, "uuid"),
            ColumnType::Enum(enum_type) => write!(f, "{} enum", enum_type.name),
        }
    }
}

/// Column-level foreign key, written as `table.column`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    pub table: String,
    pub column: String,
    pub on_delete: Option<String>,
}

impl ForeignKey {
    pub fn parse(target: &str) -> Option<Self> {
        let (table, column) = target.rsplit_once('.')?;
        if table.is_empty() || column.is_empty() {
            return None;
        }
        Some(Self {
            table: table.to_string(),
            column: column.to_string(),
            on_delete: None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub column_type: ColumnType,
    pub primary_key: bool,
    pub nullable: bool,
    pub unique: bool,
    pub index: bool,
    pub default: Option<DatabaseValue>,
    pub foreign_key: Option<ForeignKey>,
    pub deferred: bool,
    pub group: Option<String>,
}

impl Column {
    pub fn new(name: &str, column_type: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            column_type,
            primary_key: false,
            nullable: true,
            unique: false,
            index: false,
            default: None,
            foreign_key: None,
            deferred: false,
            group: None,
        }
    }

    pub fn integer(name: &str) -> Self {
        Self::new(name, ColumnType::Integer)
    }

    pub fn big_integer(name: &str) -> Self {
        Self::new(name, ColumnType::BigInteger)
    }

    pub fn float(name: &str) -> Self {
        Self::new(name, ColumnType::Float)
    }

    pub fn boolean(name: &str) -> Self {
        Self::new(name, ColumnType::Boolean)
    }

    pub fn string(name: &str) -> Self {
        Self::new(name, ColumnType::String(None))
    }

    pub fn varchar(name: &str, len: u32) -> Self {
        Self::new(name, ColumnType::String(Some(len)))
    }

    pub fn text(name: &str) -> Self {
        Self::new(name, ColumnType::Text)
    }

    pub fn json(name: &str) -> Self {
        Self::new(name, ColumnType::Json)
    }

    pub fn binary(name: &str) -> Self {
        Self::new(name, ColumnType::Binary)
    }

    pub fn datetime(name: &str) -> Self {
        Self::new(name, ColumnType::DateTime)
    }

    pub fn uuid(name: &str) -> Self {
        Self::new(name, ColumnType::Uuid)
    }

    pub fn enumeration(name: &str, enum_type: EnumColumnType) -> Self {
        Self::new(name, ColumnType::Enum(enum_type))
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn index(mut self) -> Self {
        self.index = true;
        self
    }

    pub fn default_value<V: Into<DatabaseValue>>(mut self, value: V) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Reference another table's column, given as `table.column`.
    ///
    /// A malformed target is kept as a table-only reference to the primary
    /// key named `id`.
    pub fn foreign_key(mut self, target: &str) -> Self {
        self.foreign_key = Some(ForeignKey::parse(target).unwrap_or_else(|| ForeignKey {
            table: target.to_string(),
            column: "id".to_string(),
            on_delete: None,
        }));
        self
    }

    pub fn on_delete(mut self, action: &str) -> Self {
        if let Some(fk) = self.foreign_key.as_mut() {
            fk.on_delete = Some(action.to_string());
        }
        self
    }

    /// Exclude from the default column load.
    pub fn deferred(mut self) -> Self {
        self.deferred = true;
        self
    }

    /// Deferred as part of a named group, undeferred together.
    pub fn group(mut self, group: &str) -> Self {
        self.deferred = true;
        self.group = Some(group.to_string());
        self
    }

    /// Single integer primary keys are generated by the database.
    pub(crate) fn is_autoincrement(&self, table: &crate::schema::Table) -> bool {
        self.primary_key
            && self.column_type.is_integer()
            && table.columns.iter().filter(|c| c.primary_key).count() == 1
    }
}

pub type ColumnFactory = Arc<dyn Fn(&ModelDeclaration) -> Column + Send + Sync>;

/// A column as declared on a model or mixin.
///
/// `Declared` columns are produced per concrete model, so every subclass gets
/// its own copy (and the factory can read the subclass name).
#[derive(Clone)]
pub enum ColumnDecl {
    Static(Column),
    Declared(ColumnFactory),
}

impl ColumnDecl {
    pub fn declared<F>(factory: F) -> Self
    where
        F: Fn(&ModelDeclaration) -> Column + Send + Sync + 'static,
    {
        ColumnDecl::Declared(Arc::new(factory))
    }

    pub fn resolve(&self, cls: &ModelDeclaration) -> Column {
        match self {
            ColumnDecl::Static(column) => column.clone(),
            ColumnDecl::Declared(factory) => factory(cls),
        }
    }
}

impl From<Column> for ColumnDecl {
    fn from(column: Column) -> Self {
        ColumnDecl::Static(column)
    }
}

impl fmt::Debug for ColumnDecl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnDecl::Static(column) => f.debug_tuple("Static").field(column).finish(),
            ColumnDecl::Declared(_) => f.write_str("Declared(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_builder() {
        let column = Column::integer("_id").primary_key();
        assert!(column.primary_key);
        assert!(!column.nullable);

        let column = Column::string("title").group("body");
        assert!(column.deferred);
        assert_eq!(column.group.as_deref(), Some("body"));
    }

    #[test]
    fn test_foreign_key_parse() {
        let column = Column::integer("foo_id").foreign_key("foo._id");
        let fk = column.foreign_key.unwrap();
        assert_eq!(fk.table, "foo");
        assert_eq!(fk.column, "_id");

        assert!(ForeignKey::parse("foo").is_none());
    }

    #[test]
    fn test_enum_constraint_name() {
        let enum_type = EnumColumnType::new("OrderStatus", ["p", "s", "c"]);
        assert_eq!(enum_type.constraint_name(), "ck_order_status");
        assert_eq!(ColumnType::Enum(enum_type).ddl(SqlDialect::SQLite), "VARCHAR(1)");
    }

    #[test]
    fn test_column_type_ddl() {
        assert_eq!(ColumnType::Float.ddl(SqlDialect::PostgreSQL), "DOUBLE PRECISION");
        assert_eq!(ColumnType::String(Some(50)).ddl(SqlDialect::SQLite), "VARCHAR(50)");
        assert_eq!(ColumnType::Binary.ddl(SqlDialect::PostgreSQL), "BYTEA");
        assert_eq!(ColumnType::Boolean.ddl(SqlDialect::SQLite), "INTEGER");
        assert_eq!(ColumnType::Boolean.ddl(SqlDialect::PostgreSQL), "BOOLEAN");
    }
}
