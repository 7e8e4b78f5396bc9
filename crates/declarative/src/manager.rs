//! Manager - registry, engines and a default session in one place
//!
//! ```ignore
//! let config = ManagerConfig::with_uri("sqlite::memory:").bind("reports", "sqlite::memory:");
//! let mut db = Manager::new(Some(registry), config)?;
//! db.create_all().await?;
//!
//! db.add(foo.from_json(&json!({"string": "a"}))?);
//! let saved = db.commit().await?;
//! ```

use std::ops::{Deref, DerefMut};

use tracing::{debug, info};

use crate::config::ManagerConfig;
use crate::engine::{Engine, Engines};
use crate::error::{ModelError, ModelResult};
use crate::registry::Registry;
use crate::schema::MetaData;
use crate::session::Session;

pub struct Manager {
    registry: Registry,
    config: ManagerConfig,
    engines: Engines,
    session: Session,
}

impl Manager {
    /// Build a manager over `registry`, or over a fresh registry with the
    /// default base when none is given.
    pub fn new(registry: Option<Registry>, config: ManagerConfig) -> ModelResult<Self> {
        let registry = registry.unwrap_or_default();
        let engines = Self::init_engine(&config)?;
        let session = Session::new(engines.clone(), registry.clone(), config.session.clone());

        info!(
            "Database manager initialized ({} model(s), {} bind(s))",
            registry.mappers().len(),
            engines.keys().len()
        );

        Ok(Self {
            registry,
            config,
            engines,
            session,
        })
    }

    /// Manager configured from `DATABASE_*` environment variables.
    pub fn from_env(registry: Option<Registry>) -> ModelResult<Self> {
        Self::new(registry, ManagerConfig::from_env()?)
    }

    /// Engines for every URI in `config`.
    pub fn init_engine(config: &ManagerConfig) -> ModelResult<Engines> {
        Engines::from_config(config)
    }

    /// A new session over this manager's engines, independent of the one
    /// the manager derefs to.
    pub fn init_session(&self) -> Session {
        Session::new(self.engines.clone(), self.registry.clone(), self.config.session.clone())
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn session(&mut self) -> &mut Session {
        &mut self.session
    }

    /// The default engine.
    pub fn engine(&self) -> ModelResult<&Engine> {
        self.engines.get(None)
    }

    pub fn get_engine(&self, bind: Option<&str>) -> ModelResult<&Engine> {
        self.engines.get(bind)
    }

    /// Engines by bind key, excluding the default engine.
    pub fn binds(&self) -> &std::collections::BTreeMap<String, Engine> {
        self.engines.binds()
    }

    /// Table metadata of the mapped models.
    pub fn metadata(&self) -> ModelResult<MetaData> {
        let metadata = self.registry.metadata();
        if metadata.is_empty() {
            return Err(ModelError::Unmapped(
                "no tables are mapped on the declarative base".to_string(),
            ));
        }
        Ok(metadata)
    }

    /// Fail when a mapped table routes to a bind with no engine.
    fn check_binds(&self) -> ModelResult<MetaData> {
        let metadata = self.metadata()?;
        for table in metadata.tables() {
            self.engines.get(table.bind_key())?;
        }
        Ok(metadata)
    }

    /// Create the tables of every bind.
    ///
    /// Nothing is created when a table's bind key has no engine.
    pub async fn create_all(&mut self) -> ModelResult<()> {
        self.check_binds()?;
        for bind in self.engines.keys() {
            self.create_all_in(bind.as_deref()).await?;
        }
        Ok(())
    }

    /// Create the tables routed to one bind.
    pub async fn create_all_in(&mut self, bind: Option<&str>) -> ModelResult<()> {
        let metadata = self.metadata()?;
        let dialect = self.engines.get(bind)?.dialect();

        let tables = metadata.tables_for_bind(bind);
        for table in &tables {
            for statement in table.create_statements(dialect) {
                self.session.execute(&statement, &[], bind).await?;
            }
        }
        self.session.commit_bind(bind).await?;

        debug!("Created {} table(s) on bind {:?}", tables.len(), bind);
        Ok(())
    }

    /// Drop the tables of every bind.
    pub async fn drop_all(&mut self) -> ModelResult<()> {
        self.check_binds()?;
        for bind in self.engines.keys() {
            self.drop_all_in(bind.as_deref()).await?;
        }
        Ok(())
    }

    /// Drop the tables routed to one bind, dependents first.
    pub async fn drop_all_in(&mut self, bind: Option<&str>) -> ModelResult<()> {
        let metadata = self.metadata()?;
        let dialect = self.engines.get(bind)?.dialect();

        let tables = metadata.tables_for_bind(bind);
        for table in tables.iter().rev() {
            self.session.execute(&table.drop_statement(dialect), &[], bind).await?;
        }
        self.session.commit_bind(bind).await?;

        debug!("Dropped {} table(s) on bind {:?}", tables.len(), bind);
        Ok(())
    }

    /// Roll back the session and close every pool.
    pub async fn dispose(&mut self) -> ModelResult<()> {
        self.session.close().await?;
        self.engines.close().await;
        Ok(())
    }
}

impl Deref for Manager {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.session
    }
}

impl DerefMut for Manager {
    fn deref_mut(&mut self) -> &mut Session {
        &mut self.session
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("engines", &self.engines)
            .field("session", &self.session)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::declarative::ModelBuilder;
    use crate::schema::Column;

    #[tokio::test]
    async fn test_empty_registry_is_unmapped() {
        let mut manager = Manager::new(None, ManagerConfig::default()).unwrap();
        assert!(matches!(manager.metadata(), Err(ModelError::Unmapped(_))));
        assert!(matches!(manager.create_all().await, Err(ModelError::Unmapped(_))));
    }

    #[tokio::test]
    async fn test_engine_accessors() {
        let config = ManagerConfig::default().bind("reports", "sqlite::memory:");
        let manager = Manager::new(None, config).unwrap();
        assert!(manager.engine().is_ok());
        assert!(manager.get_engine(Some("reports")).is_ok());
        assert!(matches!(manager.get_engine(Some("nope")), Err(ModelError::UnboundBindKey(_))));
        assert_eq!(manager.binds().len(), 1);

        let unbound = Manager::new(
            None,
            ManagerConfig {
                database_uri: None,
                ..ManagerConfig::default()
            },
        )
        .unwrap();
        assert!(matches!(unbound.engine(), Err(ModelError::UnboundExecution)));
    }

    #[tokio::test]
    async fn test_create_all_then_query() {
        let registry = Registry::new();
        let foo = ModelBuilder::model("Foo")
            .column(Column::integer("_id").primary_key())
            .column(Column::string("string"))
            .register(&registry)
            .unwrap();

        let mut manager = Manager::new(Some(registry), ManagerConfig::default()).unwrap();
        manager.create_all().await.unwrap();
        assert_eq!(foo.query().count(&mut manager).await.unwrap(), 0);

        manager.drop_all().await.unwrap();
    }

    #[tokio::test]
    async fn test_create_all_rejects_unbound_bind_key() {
        let registry = Registry::new();
        let foo = ModelBuilder::model("Foo")
            .column(Column::integer("_id").primary_key())
            .register(&registry)
            .unwrap();
        ModelBuilder::model("Report")
            .bind_key("reports")
            .column(Column::integer("_id").primary_key())
            .register(&registry)
            .unwrap();

        let mut manager = Manager::new(Some(registry), ManagerConfig::default()).unwrap();
        assert!(matches!(
            manager.create_all().await,
            Err(ModelError::UnboundBindKey(key)) if key == "reports"
        ));
        assert!(matches!(manager.drop_all().await, Err(ModelError::UnboundBindKey(_))));

        // The default bind was left untouched
        let rows = manager
            .fetch_all("SELECT name FROM sqlite_master WHERE type = 'table'", &[], None)
            .await
            .unwrap();
        assert!(rows.is_empty());
        assert!(foo.query().count(&mut manager).await.is_err());
    }
}
