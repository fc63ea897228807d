use std::sync::Arc;
use std::time::Duration;

use crate::config::EngineConfig;
use crate::db::cache::{Cache, MemoryCache, NullCache};
use crate::db::connectors::DriverConnector;
use crate::db::entity::EntityStore;
use crate::db::join_killer::JoinKiller;
use crate::db::query::Query;
use crate::db::router::ConnectionRouter;
use crate::db::schema::{DefinitionSource, DefinitionStore};
use crate::db::sync::{MySqlTarget, SyncOptions, Synchronizer};
use crate::error::DbError;

/// Everything a caller needs to talk to the configured databases: the
/// definitions, the server pools and the cache.
pub struct Engine {
    definitions: DefinitionStore,
    router: ConnectionRouter,
    cache: Box<dyn Cache>,
    default_ttl: Duration,
}

impl Engine {
    pub fn new(definitions: DefinitionStore, router: ConnectionRouter, cache: Box<dyn Cache>) -> Self {
        Self {
            definitions,
            router,
            cache,
            default_ttl: Duration::from_secs(300),
        }
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Build an engine backed by the real drivers.
    pub fn from_config(config: &EngineConfig) -> Result<Self, DbError> {
        let definitions = DefinitionStore::new(DefinitionSource::File(config.definitions.clone()));
        let router = ConnectionRouter::new(config.servers.clone(), Arc::new(DriverConnector));
        let cache: Box<dyn Cache> = if config.cache.enabled {
            Box::new(MemoryCache::new())
        } else {
            Box::new(NullCache)
        };
        log::info!(
            "Engine ready: {} servers, cache {}",
            config.servers.len(),
            if config.cache.enabled { "on" } else { "off" }
        );
        Ok(Self::new(definitions, router, cache).with_default_ttl(config.cache.default_ttl()))
    }

    pub fn definitions(&self) -> &DefinitionStore {
        &self.definitions
    }

    pub fn router(&self) -> &ConnectionRouter {
        &self.router
    }

    pub fn cache(&self) -> &dyn Cache {
        self.cache.as_ref()
    }

    pub fn query(&self, schema: &str, sql: &str) -> Query<'_> {
        Query::new(&self.router, schema, sql)
    }

    /// A query whose result is kept in the cache under `key`.
    pub fn cached_query(&self, schema: &str, sql: &str, key: &str) -> Query<'_> {
        Query::new(&self.router, schema, sql).with_cache(self.cache.as_ref(), key, self.default_ttl)
    }

    pub fn join_killer(&self, schema: &str, sql: &str) -> Result<JoinKiller<'_>, DbError> {
        JoinKiller::new(&self.router, schema, sql)
    }

    pub fn entities(&self) -> EntityStore<'_> {
        EntityStore::new(&self.router, &self.definitions, self.cache.as_ref())
    }

    /// A synchronizer reconciling every definition against its MySQL master.
    pub fn synchronizer(&self, options: SyncOptions) -> Result<Synchronizer<MySqlTarget<'_>>, DbError> {
        Ok(Synchronizer::new(
            self.definitions.all()?,
            MySqlTarget::new(&self.router),
            options,
        ))
    }
}
