//! Declarative model declarations.
//!
//! A [`ModelDeclaration`] is the static description of a model, mixin or
//! abstract base: its columns, relationships, methods, event mapping and
//! inheritable configuration fragments. Declarations are built with
//! [`ModelBuilder`] and turned into a [`Mapper`](crate::mapper::Mapper) by
//! [`Registry::register`](crate::registry::Registry::register).
//!
//! ```ignore
//! let timestamps = ModelBuilder::mixin("Timestamps")
//!     .column(Column::datetime("created_at"))
//!     .declare();
//!
//! let user = ModelBuilder::model("UserAccount")
//!     .base(&timestamps)
//!     .column(Column::integer("id").primary_key())
//!     .column(Column::string("name"))
//!     .register(&registry)?;
//!
//! assert_eq!(user.table().name, "user_account");
//! ```

pub mod args;
pub mod mro;
pub mod tablename;

use std::fmt;
use std::sync::Arc;

use serde_json::Value as JsonValue;

use crate::error::ModelResult;
use crate::events::{ListenerDecl, Method};
use crate::mapper::{Hybrid, Mapper};
use crate::registry::Registry;
use crate::schema::{ColumnDecl, Relationship, Table, TableArg};
use crate::search::SearchConfig;

pub use args::{merge_declarative_args, ArgOptions, ConfigFragment, FragmentEntry, MergedArgs};
pub use mro::linearize;
pub use tablename::{camel_to_snake, should_generate_tablename};

/// Positional mapper arguments carry plain JSON values.
pub type MapperArg = JsonValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclarationKind {
    /// Contributes members to models; never mapped and never inherits the
    /// registry base implicitly
    Mixin,
    /// Inheritable base that is not mapped itself
    Abstract,
    /// Mapped to a table when registered
    Model,
}

/// Static description of a model class.
pub struct ModelDeclaration {
    pub(crate) name: String,
    pub(crate) kind: DeclarationKind,
    pub(crate) bases: Vec<Arc<ModelDeclaration>>,
    pub(crate) tablename: Option<String>,
    pub(crate) table: Option<Table>,
    pub(crate) columns: Vec<ColumnDecl>,
    pub(crate) relationships: Vec<Relationship>,
    pub(crate) hybrids: Vec<Hybrid>,
    pub(crate) methods: Vec<Method>,
    pub(crate) events: Vec<(Vec<String>, Vec<ListenerDecl>)>,
    pub(crate) table_args: Option<ConfigFragment<TableArg>>,
    pub(crate) local_table_args: Option<ConfigFragment<TableArg>>,
    pub(crate) mapper_args: Option<ConfigFragment<MapperArg>>,
    pub(crate) local_mapper_args: Option<ConfigFragment<MapperArg>>,
    pub(crate) advanced_search: Option<SearchConfig>,
    pub(crate) simple_search: Option<SearchConfig>,
    pub(crate) bind_key: Option<String>,
    pub(crate) strict_update_fields: Option<Vec<String>>,
}

impl ModelDeclaration {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> DeclarationKind {
        self.kind
    }

    pub fn bases(&self) -> &[Arc<ModelDeclaration>] {
        &self.bases
    }

    pub fn is_abstract(&self) -> bool {
        self.kind == DeclarationKind::Abstract
    }

    pub fn is_mixin(&self) -> bool {
        self.kind == DeclarationKind::Mixin
    }

    pub fn is_model(&self) -> bool {
        self.kind == DeclarationKind::Model
    }

    /// Whether any column declared directly here is a primary key once
    /// evaluated against `cls`.
    pub fn declares_primary_key(&self, cls: &ModelDeclaration) -> bool {
        self.columns.iter().any(|column| column.resolve(cls).primary_key)
    }

    /// Whether the declaration names or is mapped to a table of its own.
    pub fn provides_table(&self) -> bool {
        self.tablename.is_some() || self.table.is_some() || self.is_model()
    }

    pub fn table_args(&self) -> Option<&ConfigFragment<TableArg>> {
        self.table_args.as_ref()
    }

    pub fn local_table_args(&self) -> Option<&ConfigFragment<TableArg>> {
        self.local_table_args.as_ref()
    }

    pub fn mapper_args(&self) -> Option<&ConfigFragment<MapperArg>> {
        self.mapper_args.as_ref()
    }

    pub fn local_mapper_args(&self) -> Option<&ConfigFragment<MapperArg>> {
        self.local_mapper_args.as_ref()
    }

    pub fn methods(&self) -> &[Method] {
        &self.methods
    }
}

impl fmt::Debug for ModelDeclaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bases: Vec<&str> = self.bases.iter().map(|b| b.name()).collect();
        f.debug_struct("ModelDeclaration")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("bases", &bases)
            .field("tablename", &self.tablename)
            .field("columns", &self.columns)
            .field("relationships", &self.relationships)
            .finish_non_exhaustive()
    }
}

/// Fluent builder for [`ModelDeclaration`].
pub struct ModelBuilder {
    decl: ModelDeclaration,
}

impl ModelBuilder {
    fn new(name: &str, kind: DeclarationKind) -> Self {
        Self {
            decl: ModelDeclaration {
                name: name.to_string(),
                kind,
                bases: Vec::new(),
                tablename: None,
                table: None,
                columns: Vec::new(),
                relationships: Vec::new(),
                hybrids: Vec::new(),
                methods: Vec::new(),
                events: Vec::new(),
                table_args: None,
                local_table_args: None,
                mapper_args: None,
                local_mapper_args: None,
                advanced_search: None,
                simple_search: None,
                bind_key: None,
                strict_update_fields: None,
            },
        }
    }

    /// A mapped model.
    pub fn model(name: &str) -> Self {
        Self::new(name, DeclarationKind::Model)
    }

    /// An abstract base: inherited like a model, never mapped.
    pub fn abstract_model(name: &str) -> Self {
        Self::new(name, DeclarationKind::Abstract)
    }

    pub fn mixin(name: &str) -> Self {
        Self::new(name, DeclarationKind::Mixin)
    }

    /// Add a base. Bases are listed in declaration order.
    pub fn base(mut self, base: &Arc<ModelDeclaration>) -> Self {
        self.decl.bases.push(Arc::clone(base));
        self
    }

    /// Inherit from an already registered model.
    pub fn inherits(self, parent: &Mapper) -> Self {
        let parent = Arc::clone(parent.declaration_arc());
        self.base(&parent)
    }

    pub fn tablename(mut self, name: &str) -> Self {
        self.decl.tablename = Some(name.to_string());
        self
    }

    /// Map onto an explicitly constructed table.
    pub fn table(mut self, table: Table) -> Self {
        self.decl.table = Some(table);
        self
    }

    pub fn column<C: Into<ColumnDecl>>(mut self, column: C) -> Self {
        self.decl.columns.push(column.into());
        self
    }

    pub fn relationship(mut self, relationship: Relationship) -> Self {
        self.decl.relationships.push(relationship);
        self
    }

    pub fn hybrid(mut self, hybrid: Hybrid) -> Self {
        self.decl.hybrids.push(hybrid);
        self
    }

    pub fn method(mut self, method: Method) -> Self {
        self.decl.methods.push(method);
        self
    }

    /// Class-level event mapping entry: one or more event names bound to one
    /// or more listeners.
    pub fn events<N, S, L, D>(mut self, names: N, listeners: L) -> Self
    where
        N: IntoIterator<Item = S>,
        S: Into<String>,
        L: IntoIterator<Item = D>,
        D: Into<ListenerDecl>,
    {
        self.decl.events.push((
            names.into_iter().map(Into::into).collect(),
            listeners.into_iter().map(Into::into).collect(),
        ));
        self
    }

    /// Table arguments inherited by subclasses.
    pub fn table_args<F: Into<ConfigFragment<TableArg>>>(mut self, fragment: F) -> Self {
        self.decl.table_args = Some(fragment.into());
        self
    }

    /// Table arguments for this declaration only.
    pub fn local_table_args<F: Into<ConfigFragment<TableArg>>>(mut self, fragment: F) -> Self {
        self.decl.local_table_args = Some(fragment.into());
        self
    }

    pub fn mapper_args<F: Into<ConfigFragment<MapperArg>>>(mut self, fragment: F) -> Self {
        self.decl.mapper_args = Some(fragment.into());
        self
    }

    pub fn local_mapper_args<F: Into<ConfigFragment<MapperArg>>>(mut self, fragment: F) -> Self {
        self.decl.local_mapper_args = Some(fragment.into());
        self
    }

    pub fn advanced_search(mut self, config: SearchConfig) -> Self {
        self.decl.advanced_search = Some(config);
        self
    }

    pub fn simple_search(mut self, config: SearchConfig) -> Self {
        self.decl.simple_search = Some(config);
        self
    }

    /// Route the model's table to a named database bind.
    pub fn bind_key(mut self, key: &str) -> Self {
        self.decl.bind_key = Some(key.to_string());
        self
    }

    /// Fields `update(.., strict = true)` may touch. Defaults to the columns.
    pub fn strict_update_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.decl.strict_update_fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Finish the declaration without mapping it.
    pub fn declare(self) -> Arc<ModelDeclaration> {
        Arc::new(self.decl)
    }

    /// Finish the declaration and map it in `registry`.
    pub fn register(self, registry: &Registry) -> ModelResult<Arc<Mapper>> {
        registry.register(self.declare())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Column;

    #[test]
    fn test_kinds() {
        let mixin = ModelBuilder::mixin("M").declare();
        let base = ModelBuilder::abstract_model("B").declare();
        let model = ModelBuilder::model("Foo").base(&mixin).base(&base).declare();

        assert!(mixin.is_mixin());
        assert!(base.is_abstract());
        assert!(model.is_model());
        assert!(model.provides_table());
        assert!(!base.provides_table());
        assert_eq!(model.bases().len(), 2);
    }

    #[test]
    fn test_declares_primary_key_evaluates_declared_columns() {
        let mixin = ModelBuilder::mixin("Keyed")
            .column(ColumnDecl::declared(|cls| {
                let column = Column::integer("id");
                if cls.name() == "Foo" {
                    column.primary_key()
                } else {
                    column
                }
            }))
            .declare();
        let foo = ModelBuilder::model("Foo").declare();
        let bar = ModelBuilder::model("Bar").declare();

        assert!(mixin.declares_primary_key(&foo));
        assert!(!mixin.declares_primary_key(&bar));
    }

    #[test]
    fn test_events_mapping_accepts_names_and_callables() {
        let decl = ModelBuilder::model("Foo")
            .events(["before_insert", "before_update"], ["stamp"])
            .events(["after_insert"], [ListenerDecl::callable(|_ctx| Ok(()))])
            .declare();

        assert_eq!(decl.events.len(), 2);
        assert_eq!(decl.events[0].0, vec!["before_insert", "before_update"]);
        assert_eq!(decl.events[1].1.len(), 1);
    }
}
