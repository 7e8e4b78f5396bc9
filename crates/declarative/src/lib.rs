//! # elif-declarative: declarative models for elif.rs
//!
//! A declarative layer over `sqlx`: model declarations that merge inherited
//! table and mapper arguments, lifecycle events bound from declarations,
//! records with `update`/`to_dict`, a query with eager loading, pagination
//! and search filters, declarative enums, and a session manager with
//! multiple database binds.

pub mod config;
pub mod declarative;
pub mod engine;
pub mod enum_type;
pub mod error;
pub mod event_error;
pub mod events;
pub mod manager;
pub mod mapper;
pub mod model;
pub mod query;
pub mod record;
pub mod registry;
pub mod schema;
pub mod search;
pub mod session;
pub mod value;

// Re-export core traits and types
pub use config::{ConfigError, ManagerConfig, SessionConfig};
pub use declarative::{
    merge_declarative_args, ArgOptions, ConfigFragment, DeclarationKind, FragmentEntry, MergedArgs,
    ModelBuilder, ModelDeclaration,
};
pub use engine::{Engine, Engines, PoolConfig, PoolError};
pub use enum_type::DeclarativeEnum;
pub use error::{ModelError, ModelResult};
pub use event_error::EventError;
pub use events::{EventContext, EventDecorator, EventKind, ListenOptions, ListenerFn};
pub use manager::Manager;
pub use mapper::{Hybrid, Mapper};
pub use model::Model;
pub use query::{and_, col, not_, or_, ColumnRef, Condition, OrderBy, Pagination, Query, DEFAULT_PER_PAGE};
pub use record::{Record, Related, Updatable};
pub use registry::Registry;
pub use schema::{Column, ColumnType, LoadStrategy, MetaData, Relationship, RelationshipType, SqlDialect, Table};
pub use search::{SearchConfig, SearchFilter};
pub use session::{IntoInstances, Session};
pub use value::DatabaseValue;

#[doc(hidden)]
pub mod __private {
    pub use serde;
}
