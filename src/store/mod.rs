// ============================================================================
// Store
// ============================================================================
//
// Process-wide entry point. Holds the connection factory, dialect, content
// serializer, index registry and id sequences; all of it is immutable once
// built and shared by sessions through an Arc.
//
// ============================================================================

pub mod config;
pub mod id_generator;

pub use config::StoreConfig;
pub use id_generator::IdGenerator;

use crate::connection::{Connection, ConnectionFactory, InMemoryDB, Select, Statement};
use crate::content::{ContentSerializer, JsonContentSerializer};
use crate::core::Result;
use crate::dialect::{Dialect, SqliteDialect};
use crate::index::layout::ID;
use crate::index::{IndexDefinition, IndexRegistry, IntoIndexDefinition, StoreLayout};
use crate::session::Session;
use std::sync::Arc;
use tracing::{Level, event};

pub(crate) struct StoreInner {
    pub(crate) factory: Arc<dyn ConnectionFactory>,
    pub(crate) dialect: Arc<dyn Dialect>,
    pub(crate) serializer: Arc<dyn ContentSerializer>,
    pub(crate) config: StoreConfig,
    pub(crate) registry: IndexRegistry,
    pub(crate) layout: StoreLayout,
    pub(crate) ids: IdGenerator,
}

impl StoreInner {
    /// Move every id sequence past the highest committed `Id` of its table
    pub(crate) async fn sync_ids(&self, connection: &mut dyn Connection) -> Result<()> {
        for table in self.ids.tables() {
            let rows = connection.query(&Select::from(table).max(ID).into()).await?;
            let max = rows
                .first()
                .and_then(|row| row.first())
                .and_then(|value| value.as_i64())
                .unwrap_or(0);
            self.ids.advance(table, max)?;
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    pub fn builder(factory: impl ConnectionFactory + 'static) -> StoreBuilder {
        StoreBuilder {
            factory: Arc::new(factory),
            dialect: Arc::new(SqliteDialect),
            serializer: Arc::new(JsonContentSerializer::new()),
            config: StoreConfig::default(),
            definitions: Vec::new(),
        }
    }

    /// Builder over a fresh in-memory backend
    pub fn in_memory() -> StoreBuilder {
        Self::builder(InMemoryDB::new())
    }

    pub fn create_session(&self) -> Session {
        Session::new(Arc::clone(&self.inner))
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &IndexRegistry {
        &self.inner.registry
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.inner.layout
    }

    pub fn dialect(&self) -> &dyn Dialect {
        self.inner.dialect.as_ref()
    }

    /// DDL for every table of the store, in the store's dialect
    pub fn schema_script(&self) -> Result<Vec<String>> {
        let schemas = self.inner.layout.schemas(&self.inner.registry)?;
        Ok(schemas
            .iter()
            .flat_map(|schema| self.inner.dialect.schema_script(schema))
            .collect())
    }
}

pub struct StoreBuilder {
    factory: Arc<dyn ConnectionFactory>,
    dialect: Arc<dyn Dialect>,
    serializer: Arc<dyn ContentSerializer>,
    config: StoreConfig,
    definitions: Vec<Result<IndexDefinition>>,
}

impl StoreBuilder {
    pub fn dialect(mut self, dialect: impl Dialect + 'static) -> Self {
        self.dialect = Arc::new(dialect);
        self
    }

    pub fn serializer(mut self, serializer: impl ContentSerializer + 'static) -> Self {
        self.serializer = Arc::new(serializer);
        self
    }

    pub fn config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Register an index. Definition errors surface from [`build`](Self::build).
    pub fn register(mut self, index: impl IntoIndexDefinition) -> Self {
        self.definitions.push(index.into_definition());
        self
    }

    /// Create missing tables and seed id sequences
    pub async fn build(self) -> Result<Store> {
        let config = self.config.clone();
        config.scope(self.build_inner()).await
    }

    async fn build_inner(self) -> Result<Store> {
        let layout = StoreLayout::new(self.config.table_prefix.as_str())?;
        let mut registry = IndexRegistry::new();
        for definition in self.definitions {
            registry.register(definition?)?;
        }

        let mut connection = self.factory.connect().await?;
        for schema in layout.schemas(&registry)? {
            for sql in self.dialect.schema_script(&schema) {
                event!(Level::DEBUG, sql = %sql, "ensure table");
            }
            connection
                .execute(&Statement::CreateTable {
                    schema,
                    if_not_exists: true,
                })
                .await?;
        }

        let ids = IdGenerator::new(layout.identity_tables(&registry));
        let inner = StoreInner {
            factory: self.factory,
            dialect: self.dialect,
            serializer: self.serializer,
            config: self.config,
            registry,
            layout,
            ids,
        };
        inner.sync_ids(connection.as_mut()).await?;

        event!(
            Level::INFO,
            dialect = inner.dialect.name(),
            indexes = inner.registry.len(),
            prefix = inner.layout.prefix(),
            "store ready"
        );

        Ok(Store {
            inner: Arc::new(inner),
        })
    }
}
