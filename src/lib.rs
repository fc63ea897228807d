//! Schema-driven synchronization and query engine.
//!
//! Schema definitions describe each entity type's table. From them the
//! crate reconciles a live MySQL schema, routes statements to master or
//! slave pools, runs deferred queries with in-memory filtering and sorting,
//! decomposes simple joins into single-table statements, and loads entities
//! through a read-through cache.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod util;

pub use config::{CacheConfig, EngineConfig};
pub use db::cache::{Cache, MemoryCache, NullCache};
pub use db::connectors::{Role, ServerDescriptor};
pub use db::entity::{Entity, EntityStore};
pub use db::join_killer::JoinKiller;
pub use db::query::{Comparator, Direction, Filter, Query, QueryBatch, Sort};
pub use db::router::ConnectionRouter;
pub use db::schema::{ColumnDefinition, ColumnType, DefinitionStore, SchemaDefinition};
pub use db::sync::{SyncOptions, SyncOutcome, SyncReport, Synchronizer};
pub use engine::Engine;
pub use error::DbError;
