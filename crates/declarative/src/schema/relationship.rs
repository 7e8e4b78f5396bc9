//! Relationship metadata between mapped models.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{ModelError, ModelResult};
use crate::mapper::Mapper;
use crate::schema::Table;

/// Defines the type of relationship between models
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelationshipType {
    /// One-to-one, foreign key on the related table
    HasOne,
    /// One-to-many, foreign key on the related table
    HasMany,
    /// Many-to-one, foreign key on this table
    BelongsTo,
}

impl RelationshipType {
    /// Returns true if this relationship returns a collection
    pub fn is_collection(self) -> bool {
        matches!(self, Self::HasMany)
    }
}

/// How a relationship is populated when its owner is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadStrategy {
    /// Not loaded unless requested
    Lazy,
    /// Loaded eagerly alongside the owning rows
    Joined,
    /// Loaded eagerly with a second statement over the owning keys
    Subquery,
    /// Loaded eagerly with `IN` over the owning keys
    SelectIn,
    /// Loaded eagerly, one statement per owner
    Immediate,
    /// Never loaded; reads as empty
    NoLoad,
}

impl LoadStrategy {
    pub fn is_eager(self) -> bool {
        matches!(self, Self::Joined | Self::Subquery | Self::SelectIn | Self::Immediate)
    }
}

impl fmt::Display for LoadStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoadStrategy::Lazy => "select",
            LoadStrategy::Joined => "joined",
            LoadStrategy::Subquery => "subquery",
            LoadStrategy::SelectIn => "selectin",
            LoadStrategy::Immediate => "immediate",
            LoadStrategy::NoLoad => "noload",
        };
        f.write_str(name)
    }
}

impl FromStr for LoadStrategy {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "select" | "lazy" | "dynamic" => Ok(LoadStrategy::Lazy),
            "joined" => Ok(LoadStrategy::Joined),
            "subquery" => Ok(LoadStrategy::Subquery),
            "selectin" => Ok(LoadStrategy::SelectIn),
            "immediate" => Ok(LoadStrategy::Immediate),
            "noload" => Ok(LoadStrategy::NoLoad),
            other => Err(ModelError::Configuration(format!(
                "unknown loader strategy '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Relationship {
    pub name: String,
    /// Name of the related mapped model
    pub target: String,
    pub relationship_type: RelationshipType,
    /// Foreign key column: on this table for `BelongsTo`, on the related one otherwise
    pub foreign_key: Option<String>,
    pub lazy: LoadStrategy,
}

impl Relationship {
    pub fn new(name: &str, target: &str, relationship_type: RelationshipType) -> Self {
        Self {
            name: name.to_string(),
            target: target.to_string(),
            relationship_type,
            foreign_key: None,
            lazy: LoadStrategy::Lazy,
        }
    }

    pub fn has_many(name: &str, target: &str) -> Self {
        Self::new(name, target, RelationshipType::HasMany)
    }

    pub fn has_one(name: &str, target: &str) -> Self {
        Self::new(name, target, RelationshipType::HasOne)
    }

    pub fn belongs_to(name: &str, target: &str) -> Self {
        Self::new(name, target, RelationshipType::BelongsTo)
    }

    pub fn foreign_key(mut self, column: &str) -> Self {
        self.foreign_key = Some(column.to_string());
        self
    }

    pub fn lazy(mut self, strategy: LoadStrategy) -> Self {
        self.lazy = strategy;
        self
    }

    pub fn is_collection(&self) -> bool {
        self.relationship_type.is_collection()
    }

    /// Column pairs `(owner column, related column)` that join the two tables.
    pub(crate) fn join_pairs(&self, owner: &Table, related: &Table) -> ModelResult<Vec<(String, String)>> {
        let (fk_table, referenced) = match self.relationship_type {
            RelationshipType::BelongsTo => (owner, related),
            RelationshipType::HasMany | RelationshipType::HasOne => (related, owner),
        };

        let fk_columns: Vec<_> = match &self.foreign_key {
            Some(name) => vec![fk_table.column(name).ok_or_else(|| {
                ModelError::Configuration(format!(
                    "relationship '{}' names foreign key '{}' which is not a column of '{}'",
                    self.name, name, fk_table.name
                ))
            })?],
            None => fk_table
                .columns
                .iter()
                .filter(|c| {
                    c.foreign_key
                        .as_ref()
                        .map(|fk| fk.table == referenced.name)
                        .unwrap_or(false)
                })
                .collect(),
        };

        if fk_columns.is_empty() {
            return Err(ModelError::Configuration(format!(
                "could not determine join condition for relationship '{}': no foreign key from '{}' to '{}'",
                self.name, fk_table.name, referenced.name
            )));
        }

        let referenced_pk = referenced.primary_key();
        let mut pairs = Vec::with_capacity(fk_columns.len());
        for (position, column) in fk_columns.iter().enumerate() {
            let referenced_column = match &column.foreign_key {
                Some(fk) if fk.table == referenced.name => fk.column.clone(),
                _ => referenced_pk
                    .get(position)
                    .map(|c| c.name.clone())
                    .ok_or_else(|| {
                        ModelError::Configuration(format!(
                            "relationship '{}' has no primary key on '{}' to join against",
                            self.name, referenced.name
                        ))
                    })?,
            };
            let pair = match self.relationship_type {
                RelationshipType::BelongsTo => (column.name.clone(), referenced_column),
                _ => (referenced_column, column.name.clone()),
            };
            pairs.push(pair);
        }
        Ok(pairs)
    }
}

/// A relationship with its related mapper and join columns resolved.
#[derive(Debug, Clone)]
pub struct ResolvedRelationship {
    pub relationship: Relationship,
    pub target: Arc<Mapper>,
    /// `(owner column, related column)`
    pub pairs: Vec<(String, String)>,
}

impl ResolvedRelationship {
    pub fn name(&self) -> &str {
        &self.relationship.name
    }

    pub fn is_collection(&self) -> bool {
        self.relationship.is_collection()
    }

    pub fn relationship_type(&self) -> RelationshipType {
        self.relationship.relationship_type
    }

    pub fn owner_columns(&self) -> Vec<&str> {
        self.pairs.iter().map(|(owner, _)| owner.as_str()).collect()
    }

    pub fn related_columns(&self) -> Vec<&str> {
        self.pairs.iter().map(|(_, related)| related.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Column;

    fn foo() -> Table {
        Table::new("foo", vec![Column::integer("_id").primary_key()])
    }

    fn bar() -> Table {
        Table::new(
            "bar",
            vec![
                Column::integer("_id").primary_key(),
                Column::integer("foo_id").foreign_key("foo._id"),
            ],
        )
    }

    #[test]
    fn test_has_many_pairs_inferred() {
        let rel = Relationship::has_many("bars", "Bar");
        let pairs = rel.join_pairs(&foo(), &bar()).unwrap();
        assert_eq!(pairs, vec![("_id".to_string(), "foo_id".to_string())]);
    }

    #[test]
    fn test_belongs_to_pairs_inferred() {
        let rel = Relationship::belongs_to("foo", "Foo");
        let pairs = rel.join_pairs(&bar(), &foo()).unwrap();
        assert_eq!(pairs, vec![("foo_id".to_string(), "_id".to_string())]);
    }

    #[test]
    fn test_missing_foreign_key_is_configuration_error() {
        let rel = Relationship::has_many("bars", "Bar");
        let result = rel.join_pairs(&foo(), &foo());
        assert!(matches!(result, Err(ModelError::Configuration(_))));

        let rel = Relationship::has_many("bars", "Bar").foreign_key("missing");
        assert!(rel.join_pairs(&foo(), &bar()).is_err());
    }

    #[test]
    fn test_load_strategy_parse() {
        assert_eq!("joined".parse::<LoadStrategy>().unwrap(), LoadStrategy::Joined);
        assert_eq!("dynamic".parse::<LoadStrategy>().unwrap(), LoadStrategy::Lazy);
        assert!("eventually".parse::<LoadStrategy>().is_err());
        assert!(LoadStrategy::SelectIn.is_eager());
        assert!(!LoadStrategy::NoLoad.is_eager());
    }
}
