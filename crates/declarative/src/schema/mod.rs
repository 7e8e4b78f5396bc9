//! Table schema: columns, tables, constraints and relationships.

pub mod column;
pub mod dialect;
pub mod relationship;
pub mod table;

pub use column::{Column, ColumnDecl, ColumnType, EnumColumnType, ForeignKey};
pub use dialect::SqlDialect;
pub use relationship::{LoadStrategy, Relationship, RelationshipType, ResolvedRelationship};
pub use table::{CheckConstraint, Index, MetaData, Table, TableArg, UniqueConstraint};
