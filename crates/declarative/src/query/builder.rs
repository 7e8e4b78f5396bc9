//! SQL statement assembly.
//!
//! Statements are plain data until rendered: [`SelectStatement`] and the DML
//! statements produce SQL text plus positional parameters for a dialect.

use crate::error::ModelResult;
use crate::registry::Registry;
use crate::schema::SqlDialect;
use crate::value::DatabaseValue;

use super::types::{ColumnRef, Condition, JoinType, OrderBy, SqlWriter};

/// One entry of a select list.
#[derive(Debug, Clone, PartialEq)]
pub enum SelectField {
    /// A column, optionally labelled `AS label`
    Column { column: ColumnRef, label: Option<String> },
    /// A literal expression such as `1` or `COUNT(*)`
    Expr(String),
}

impl SelectField {
    pub fn labelled(column: ColumnRef, label: &str) -> Self {
        SelectField::Column {
            column,
            label: Some(label.to_string()),
        }
    }

    fn render(&self, dialect: SqlDialect) -> String {
        match self {
            SelectField::Column { column, label: Some(label) } => {
                format!("{} AS {}", column.render(dialect), dialect.quote(label))
            }
            SelectField::Column { column, label: None } => column.render(dialect),
            SelectField::Expr(expr) => expr.clone(),
        }
    }
}

/// How a joined table is attached.
#[derive(Debug, Clone, PartialEq)]
pub enum JoinOn {
    /// `left = right` pairs joined with `AND`
    Columns(Vec<(ColumnRef, ColumnRef)>),
    Condition(Condition),
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinClause {
    pub join_type: JoinType,
    pub table: String,
    pub alias: Option<String>,
    pub on: JoinOn,
}

impl JoinClause {
    /// Name the joined table is addressed by in the statement.
    pub fn reference(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.table)
    }
}

/// A `SELECT` over one table with joins.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectStatement {
    pub distinct: bool,
    pub select_fields: Vec<SelectField>,
    pub from_table: String,
    pub joins: Vec<JoinClause>,
    pub where_conditions: Vec<Condition>,
    pub order_by: Vec<OrderBy>,
    pub limit_count: Option<i64>,
    pub offset_value: Option<i64>,
}

impl SelectStatement {
    pub fn new(table: &str) -> Self {
        Self {
            from_table: table.to_string(),
            ..Self::default()
        }
    }

    pub fn select(mut self, field: SelectField) -> Self {
        self.select_fields.push(field);
        self
    }

    pub fn where_condition(mut self, condition: Condition) -> Self {
        self.where_conditions.push(condition);
        self
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by.push(order);
        self
    }

    pub fn limit(mut self, count: i64) -> Self {
        self.limit_count = Some(count);
        self
    }

    /// Whether a table or alias is already part of the `FROM` clause.
    pub fn has_reference(&self, name: &str) -> bool {
        self.from_table == name || self.joins.iter().any(|j| j.reference() == name)
    }

    /// Generate SQL with parameter placeholders and return the parameters
    pub fn to_sql_with_params(
        &self,
        dialect: SqlDialect,
        registry: &Registry,
    ) -> ModelResult<(String, Vec<DatabaseValue>)> {
        let mut w = SqlWriter::new(dialect);
        self.write_to(&mut w, registry)?;
        Ok(w.finish())
    }

    /// `SELECT COUNT(*)` over this statement as a subquery.
    pub fn to_count_sql(
        &self,
        dialect: SqlDialect,
        registry: &Registry,
    ) -> ModelResult<(String, Vec<DatabaseValue>)> {
        let mut w = SqlWriter::new(dialect);
        w.push("SELECT COUNT(*) AS \"count\" FROM (");
        self.write_to(&mut w, registry)?;
        w.push(") AS anon_1");
        Ok(w.finish())
    }

    /// `SELECT EXISTS (...)` over this statement.
    pub fn to_exists_sql(
        &self,
        dialect: SqlDialect,
        registry: &Registry,
    ) -> ModelResult<(String, Vec<DatabaseValue>)> {
        let mut w = SqlWriter::new(dialect);
        w.push("SELECT EXISTS (");
        self.write_to(&mut w, registry)?;
        w.push(") AS anon_1");
        Ok(w.finish())
    }

    pub(crate) fn write_to(&self, w: &mut SqlWriter, registry: &Registry) -> ModelResult<()> {
        let dialect = w.dialect;

        // SELECT clause
        if self.distinct {
            w.push("SELECT DISTINCT ");
        } else {
            w.push("SELECT ");
        }

        if self.select_fields.is_empty() {
            w.push("*");
        } else {
            let fields: Vec<String> = self.select_fields.iter().map(|f| f.render(dialect)).collect();
            w.push(&fields.join(", "));
        }

        // FROM clause
        w.push(" FROM ");
        w.push(&dialect.quote(&self.from_table));

        // JOIN clauses
        for join in &self.joins {
            w.push(" ");
            w.push(&join.join_type.to_string());
            w.push(" ");
            w.push(&dialect.quote(&join.table));
            if let Some(alias) = &join.alias {
                w.push(" AS ");
                w.push(&dialect.quote(alias));
            }
            w.push(" ON ");
            match &join.on {
                JoinOn::Columns(pairs) => {
                    for (i, (left, right)) in pairs.iter().enumerate() {
                        if i > 0 {
                            w.push(" AND ");
                        }
                        w.push(&format!("{} = {}", left.render(dialect), right.render(dialect)));
                    }
                }
                JoinOn::Condition(condition) => condition.render(w, registry)?,
            }
        }

        // WHERE clause
        if !self.where_conditions.is_empty() {
            w.push(" WHERE ");
            for (i, condition) in self.where_conditions.iter().enumerate() {
                if i > 0 {
                    w.push(" AND ");
                }
                condition.render(w, registry)?;
            }
        }

        if !self.order_by.is_empty() {
            let order: Vec<String> = self
                .order_by
                .iter()
                .map(|o| format!("{} {}", o.column.render(dialect), o.direction))
                .collect();
            w.push(" ORDER BY ");
            w.push(&order.join(", "));
        }

        match (self.limit_count, self.offset_value) {
            (Some(limit), offset) => {
                w.push(&format!(" LIMIT {}", limit));
                if let Some(offset) = offset {
                    w.push(&format!(" OFFSET {}", offset));
                }
            }
            // SQLite only accepts OFFSET after a LIMIT
            (None, Some(offset)) => match dialect {
                SqlDialect::SQLite => w.push(&format!(" LIMIT -1 OFFSET {}", offset)),
                SqlDialect::PostgreSQL => w.push(&format!(" OFFSET {}", offset)),
            },
            (None, None) => {}
        }
        Ok(())
    }
}

fn write_key(w: &mut SqlWriter, key: &[(String, DatabaseValue)]) {
    w.push(" WHERE ");
    for (i, (column, value)) in key.iter().enumerate() {
        if i > 0 {
            w.push(" AND ");
        }
        w.push(&format!("{} = ", w.dialect.quote(column)));
        w.push_param(value.clone());
    }
}

fn write_returning(w: &mut SqlWriter, returning: &[String]) {
    if returning.is_empty() {
        return;
    }
    let columns: Vec<String> = returning.iter().map(|c| w.dialect.quote(c)).collect();
    w.push(" RETURNING ");
    w.push(&columns.join(", "));
}

/// `INSERT INTO ... VALUES ... RETURNING ...`
#[derive(Debug, Clone, PartialEq)]
pub struct InsertStatement {
    pub table: String,
    pub values: Vec<(String, DatabaseValue)>,
    pub returning: Vec<String>,
}

impl InsertStatement {
    pub fn to_sql_with_params(&self, dialect: SqlDialect) -> (String, Vec<DatabaseValue>) {
        let mut w = SqlWriter::new(dialect);
        w.push(&format!("INSERT INTO {}", dialect.quote(&self.table)));

        if self.values.is_empty() {
            w.push(" DEFAULT VALUES");
        } else {
            let columns: Vec<String> = self.values.iter().map(|(c, _)| dialect.quote(c)).collect();
            w.push(&format!(" ({}) VALUES (", columns.join(", ")));
            for (i, (_, value)) in self.values.iter().enumerate() {
                if i > 0 {
                    w.push(", ");
                }
                w.push_param(value.clone());
            }
            w.push(")");
        }

        write_returning(&mut w, &self.returning);
        w.finish()
    }
}

/// `UPDATE ... SET ... WHERE <key> RETURNING ...`
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateStatement {
    pub table: String,
    pub values: Vec<(String, DatabaseValue)>,
    pub key: Vec<(String, DatabaseValue)>,
    pub returning: Vec<String>,
}

impl UpdateStatement {
    pub fn to_sql_with_params(&self, dialect: SqlDialect) -> (String, Vec<DatabaseValue>) {
        let mut w = SqlWriter::new(dialect);
        w.push(&format!("UPDATE {} SET ", dialect.quote(&self.table)));
        for (i, (column, value)) in self.values.iter().enumerate() {
            if i > 0 {
                w.push(", ");
            }
            w.push(&format!("{} = ", dialect.quote(column)));
            w.push_param(value.clone());
        }
        write_key(&mut w, &self.key);
        write_returning(&mut w, &self.returning);
        w.finish()
    }
}

/// `DELETE FROM ... WHERE <key>`
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteStatement {
    pub table: String,
    pub key: Vec<(String, DatabaseValue)>,
}

impl DeleteStatement {
    pub fn to_sql_with_params(&self, dialect: SqlDialect) -> (String, Vec<DatabaseValue>) {
        let mut w = SqlWriter::new(dialect);
        w.push(&format!("DELETE FROM {}", dialect.quote(&self.table)));
        write_key(&mut w, &self.key);
        w.finish()
    }
}
