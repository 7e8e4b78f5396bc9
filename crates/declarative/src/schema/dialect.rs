use crate::error::{ModelError, ModelResult};

/// SQL dialect enumeration for generating database-specific SQL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlDialect {
    PostgreSQL,
    SQLite,
}

impl SqlDialect {
    /// Detect the dialect from a connection URL scheme.
    pub fn from_url(database_url: &str) -> ModelResult<Self> {
        let scheme = database_url
            .split_once(':')
            .map(|(scheme, _)| scheme.to_ascii_lowercase())
            .ok_or_else(|| {
                ModelError::Configuration(format!("invalid database url '{}'", database_url))
            })?;

        match scheme.as_str() {
            "sqlite" => Ok(SqlDialect::SQLite),
            "postgres" | "postgresql" => Ok(SqlDialect::PostgreSQL),
            other => Err(ModelError::Configuration(format!(
                "unsupported database scheme '{}'",
                other
            ))),
        }
    }

    /// Positional placeholder; both dialects accept `$N` through sqlx.
    pub fn parameter_placeholder(&self, index: usize) -> String {
        format!("${}", index + 1)
    }

    /// Quote an identifier, doubling embedded quotes.
    pub fn quote(&self, identifier: &str) -> String {
        format!("\"{}\"", identifier.replace('"', "\"\""))
    }

    pub fn supports_ilike(&self) -> bool {
        matches!(self, SqlDialect::PostgreSQL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dialect_from_url() {
        assert_eq!(SqlDialect::from_url("sqlite::memory:").unwrap(), SqlDialect::SQLite);
        assert_eq!(
            SqlDialect::from_url("postgresql://localhost/app").unwrap(),
            SqlDialect::PostgreSQL
        );
        assert!(SqlDialect::from_url("mysql://localhost/app").is_err());
        assert!(SqlDialect::from_url("nonsense").is_err());
    }

    #[test]
    fn test_quote_and_placeholder() {
        let dialect = SqlDialect::SQLite;
        assert_eq!(dialect.quote("foo"), "\"foo\"");
        assert_eq!(dialect.quote("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(dialect.parameter_placeholder(0), "$1");
    }
}
