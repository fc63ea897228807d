use std::collections::HashMap;
use std::sync::Arc;

use super::Entity;
use crate::db::cache::{is_tombstone, tombstone, Cache, ENTITY_TTL};
use crate::db::query::{as_id, Query};
use crate::db::router::ConnectionRouter;
use crate::db::schema::{DefinitionStore, Row, SchemaDefinition, PRIMARY_KEY};
use crate::error::DbError;

/// Cache key of a point lookup: `{table}_{column}:{value}`.
pub fn cache_key(table: &str, column: &str, value: &serde_json::Value) -> String {
    let value = match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    format!("{}_{}:{}", table, column, value)
}

fn id_key(table: &str, id: i64) -> String {
    cache_key(table, PRIMARY_KEY, &serde_json::Value::from(id))
}

fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

fn now() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Read-through identity layer: loads, saves and deletes entities, keeping
/// the cache in step.
pub struct EntityStore<'a> {
    router: &'a ConnectionRouter,
    definitions: &'a DefinitionStore,
    cache: &'a dyn Cache,
}

impl<'a> EntityStore<'a> {
    pub fn new(router: &'a ConnectionRouter, definitions: &'a DefinitionStore, cache: &'a dyn Cache) -> Self {
        Self {
            router,
            definitions,
            cache,
        }
    }

    /// An empty, unsaved entity of the given type.
    pub fn create(&self, type_name: &str) -> Result<Entity, DbError> {
        Ok(Entity::new(self.definitions.get(type_name)?))
    }

    /// Load one entity by id or by a unique indexed column.
    pub fn get(
        &self,
        type_name: &str,
        value: impl Into<serde_json::Value>,
        column: &str,
    ) -> Result<Option<Entity>, DbError> {
        let definition = self.definitions.get(type_name)?;
        let value = value.into();
        if column == PRIMARY_KEY {
            return match as_id(&value) {
                Some(id) => self.load(&definition, id),
                None => Ok(None),
            };
        }

        let lookup = definition.columns.get(column);
        if !lookup.map_or(false, |c| c.indexed && c.unique) {
            return Err(DbError::InvalidLookupColumn {
                table: definition.table.clone(),
                column: column.to_string(),
            });
        }

        let sql = format!(
            "SELECT {} FROM {} WHERE {} = :value",
            quote_ident(PRIMARY_KEY),
            quote_ident(&definition.table),
            quote_ident(column)
        );
        let key = cache_key(&definition.table, column, &value);
        let mut query = Query::new(self.router, &definition.schema, &sql).with_cache(self.cache, &key, ENTITY_TTL);
        query.bind("value", value)?;

        match query.fetch_value()?.as_ref().and_then(as_id) {
            Some(id) => self.load(&definition, id),
            None => Ok(None),
        }
    }

    pub fn get_by_id(&self, type_name: &str, id: i64) -> Result<Option<Entity>, DbError> {
        let definition = self.definitions.get(type_name)?;
        self.load(&definition, id)
    }

    fn load(&self, definition: &Arc<SchemaDefinition>, id: i64) -> Result<Option<Entity>, DbError> {
        let key = id_key(&definition.table, id);
        let row = match self.cache.get(&key)? {
            Some(hit) if is_tombstone(&hit) => {
                log::debug!("cache tombstone: {}", key);
                return Ok(None);
            }
            Some(serde_json::Value::Object(row)) => {
                log::debug!("cache hit: {}", key);
                row
            }
            _ => {
                let sql = format!(
                    "SELECT * FROM {} WHERE {} = :id",
                    quote_ident(&definition.table),
                    quote_ident(PRIMARY_KEY)
                );
                let mut query = Query::new(self.router, &definition.schema, &sql);
                query.bind("id", id)?;
                let Some(row) = query.fetch_row()? else {
                    return Ok(None);
                };
                self.cache
                    .set(&key, serde_json::Value::Object(row.clone()), ENTITY_TTL)?;
                row
            }
        };

        let entity = Entity::from_row(Arc::clone(definition), row);
        Ok(Some(entity).filter(|e| !e.is_soft_deleted()))
    }

    /// Load several entities by id in one cache round-trip and at most one
    /// query. The result lines up with `ids`; absent and soft-deleted rows
    /// are `None` and remembered as such.
    pub fn get_many(&self, type_name: &str, ids: &[i64]) -> Result<Vec<Option<Entity>>, DbError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let definition = self.definitions.get(type_name)?;
        let table = definition.table.as_str();

        let keys: Vec<String> = ids.iter().map(|id| id_key(table, *id)).collect();
        let cached = self.cache.get_multi(&keys)?;

        let mut found: HashMap<i64, Option<Row>> = HashMap::new();
        let mut missing: Vec<i64> = Vec::new();
        for (id, key) in ids.iter().zip(&keys) {
            match cached.get(key).cloned().flatten() {
                Some(hit) if is_tombstone(&hit) => {
                    found.insert(*id, None);
                }
                Some(serde_json::Value::Object(row)) => {
                    found.insert(*id, Some(row));
                }
                _ => {
                    if !missing.contains(id) {
                        missing.push(*id);
                    }
                }
            }
        }
        log::debug!(
            "{}: {} of {} ids served from cache",
            table,
            ids.len() - missing.len(),
            ids.len()
        );

        if !missing.is_empty() {
            let list = missing.iter().map(i64::to_string).collect::<Vec<_>>().join(", ");
            let sql = format!(
                "SELECT * FROM {} WHERE {} IN ({})",
                quote_ident(table),
                quote_ident(PRIMARY_KEY),
                list
            );
            let rows = Query::new(self.router, &definition.schema, &sql).fetch_rows()?;
            for row in rows {
                let Some(id) = row.get(PRIMARY_KEY).and_then(as_id) else {
                    continue;
                };
                let entity = Entity::from_row(Arc::clone(&definition), row.clone());
                if entity.is_soft_deleted() {
                    continue;
                }
                self.cache
                    .set(&id_key(table, id), serde_json::Value::Object(row.clone()), ENTITY_TTL)?;
                found.insert(id, Some(row));
            }
            for id in &missing {
                if !found.contains_key(id) {
                    self.cache.set(&id_key(table, *id), tombstone(), ENTITY_TTL)?;
                    found.insert(*id, None);
                }
            }
        }

        Ok(ids
            .iter()
            .map(|id| {
                found
                    .get(id)
                    .cloned()
                    .flatten()
                    .map(|row| Entity::from_row(Arc::clone(&definition), row))
                    .filter(|e| !e.is_soft_deleted())
            })
            .collect())
    }

    /// Insert or update, then refresh the cache. A saved entity with no
    /// changes is left alone.
    pub fn save(&self, entity: &mut Entity) -> Result<(), DbError> {
        if entity.id().is_some() && !entity.is_dirty() {
            return Ok(());
        }
        let definition = Arc::clone(entity.definition());

        for (name, column) in definition.data_columns() {
            if entity.has_value(name) {
                continue;
            }
            let value = match &column.default {
                Some(_) if column.defaults_to_now() => serde_json::Value::String(now()),
                Some(default) => default.clone(),
                None => continue,
            };
            entity.fill(name, value);
            entity.mark_dirty(name);
        }

        let dirty: Vec<String> = entity.dirty_fields().map(String::from).collect();
        let table = quote_ident(&definition.table);

        match entity.id() {
            None => {
                let sql = if dirty.is_empty() {
                    format!("INSERT INTO {} ({}) VALUES (NULL)", table, quote_ident(PRIMARY_KEY))
                } else {
                    format!(
                        "INSERT INTO {} ({}) VALUES ({})",
                        table,
                        dirty.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", "),
                        dirty.iter().map(|c| format!(":{}", c)).collect::<Vec<_>>().join(", ")
                    )
                };
                let mut query = Query::new(self.router, &definition.schema, &sql);
                for column in &dirty {
                    query.bind(column, entity.fields()[column.as_str()].clone())?;
                }
                let id = query.last_insert_id()?;
                entity.assign_id(id);
                log::debug!("Inserted {} #{}", definition.table, id);
            }
            Some(id) => {
                let sql = format!(
                    "UPDATE {} SET {} WHERE {} = :id",
                    table,
                    dirty
                        .iter()
                        .map(|c| format!("{} = :{}", quote_ident(c), c))
                        .collect::<Vec<_>>()
                        .join(", "),
                    quote_ident(PRIMARY_KEY)
                );
                let mut query = Query::new(self.router, &definition.schema, &sql);
                for column in &dirty {
                    query.bind(column, entity.fields()[column.as_str()].clone())?;
                }
                query.bind("id", id)?;
                query.execute()?;
                log::debug!("Updated {} #{} ({})", definition.table, id, dirty.join(", "));
            }
        }

        let Some(id) = entity.id() else {
            return Err(DbError::Query(format!("no id after saving into {}", definition.table)));
        };
        for column in &dirty {
            let unique = definition
                .columns
                .get(column)
                .map_or(false, |c| c.indexed && c.unique);
            if unique {
                let key = cache_key(&definition.table, column, &entity.fields()[column.as_str()]);
                self.cache.set(&key, serde_json::Value::from(id), ENTITY_TTL)?;
            }
        }
        self.cache.set(
            &id_key(&definition.table, id),
            serde_json::Value::Object(entity.to_row()),
            ENTITY_TTL,
        )?;
        entity.clear_dirty();
        Ok(())
    }

    /// Delete the row and remember the id as gone. Returns `false` for an
    /// entity that was never saved.
    pub fn delete(&self, entity: &Entity) -> Result<bool, DbError> {
        let Some(id) = entity.id() else {
            return Ok(false);
        };
        let definition = entity.definition();
        let sql = format!(
            "DELETE FROM {} WHERE {} = :id",
            quote_ident(&definition.table),
            quote_ident(PRIMARY_KEY)
        );
        let mut query = Query::new(self.router, &definition.schema, &sql);
        query.bind("id", id)?;
        query.execute()?;
        // Unique-column lookup keys are left to resolve to the id; the
        // tombstone below turns them into misses.
        self.cache.set(&id_key(&definition.table, id), tombstone(), ENTITY_TTL)?;
        log::debug!("Deleted {} #{}", definition.table, id);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::cache::MemoryCache;
    use crate::db::connectors::sqlite::SqliteConnection;
    use crate::db::connectors::{
        Connection, Connector, DatabaseEngine, Role, ServerDescriptor, SharedConnection, Statement,
    };
    use crate::db::schema::{ColumnDefinition, ColumnType};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Shares one in-memory database across roles and counts prepared statements.
    struct CountingConnection {
        inner: SqliteConnection,
        prepared: AtomicUsize,
    }

    impl Connection for CountingConnection {
        fn prepare(&self, sql: &str) -> Result<Box<dyn Statement>, DbError> {
            self.prepared.fetch_add(1, Ordering::SeqCst);
            self.inner.prepare(sql)
        }

        fn engine(&self) -> DatabaseEngine {
            DatabaseEngine::Sqlite
        }
    }

    struct SharedConnector(Arc<CountingConnection>);

    impl Connector for SharedConnector {
        fn connect(&self, _server: &ServerDescriptor) -> Result<SharedConnection, DbError> {
            let conn: SharedConnection = self.0.clone();
            Ok(conn)
        }
    }

    struct Fixture {
        conn: Arc<CountingConnection>,
        router: ConnectionRouter,
        definitions: DefinitionStore,
        cache: MemoryCache,
    }

    impl Fixture {
        fn new() -> Self {
            let inner = SqliteConnection::from_connection(rusqlite::Connection::open_in_memory().unwrap());
            inner
                .execute_batch(
                    "CREATE TABLE users (
                        id INTEGER PRIMARY KEY AUTOINCREMENT,
                        email TEXT NOT NULL UNIQUE,
                        name TEXT,
                        status TEXT NOT NULL DEFAULT 'new',
                        created_at TEXT,
                        is_deleted INTEGER NOT NULL DEFAULT 0
                    );
                    INSERT INTO users (email, name) VALUES ('a@x.io', 'alice'), ('b@x.io', 'bob');
                    INSERT INTO users (email, name, is_deleted) VALUES ('c@x.io', 'carol', 1);",
                )
                .unwrap();
            let conn = Arc::new(CountingConnection {
                inner,
                prepared: AtomicUsize::new(0),
            });
            let router = ConnectionRouter::new(
                vec![
                    ServerDescriptor::new("app", "sqlite::memory:", Role::Master),
                    ServerDescriptor::new("app", "sqlite::memory:", Role::Slave),
                ],
                Arc::new(SharedConnector(conn.clone())),
            );
            let definitions = DefinitionStore::from_definitions(vec![SchemaDefinition::new(
                "User", "app", "users",
            )
            .column("email", ColumnDefinition::varchar(120).unique())
            .column("name", ColumnDefinition::varchar(100).nullable().indexed())
            .column("status", ColumnDefinition::enumeration(&["new", "active"]).with_default("new"))
            .column(
                "created_at",
                ColumnDefinition::new(ColumnType::Datetime).with_default("NOW"),
            )
            .column("is_deleted", ColumnDefinition::new(ColumnType::TinyInt).with_default(0))]);
            Self {
                conn,
                router,
                definitions,
                cache: MemoryCache::new(),
            }
        }

        fn store(&self) -> EntityStore<'_> {
            EntityStore::new(&self.router, &self.definitions, &self.cache)
        }

        fn queries(&self) -> usize {
            self.conn.prepared.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_get_by_id_reads_through_cache() {
        let fx = Fixture::new();
        let store = fx.store();

        let alice = store.get("User", 1, "id").unwrap().unwrap();
        assert_eq!(alice.get("name").unwrap(), Some(json!("alice")));
        assert!(fx.cache.get("users_id:1").unwrap().is_some());

        let before = fx.queries();
        let again = store.get_by_id("User", 1).unwrap().unwrap();
        assert_eq!(again.fields(), alice.fields());
        assert_eq!(fx.queries(), before);
    }

    #[test]
    fn test_missing_and_soft_deleted_rows() {
        let fx = Fixture::new();
        let store = fx.store();
        assert!(store.get_by_id("User", 99).unwrap().is_none());
        assert!(fx.cache.get("users_id:99").unwrap().is_none(), "single miss is not remembered");
        assert!(store.get_by_id("User", 3).unwrap().is_none());
    }

    #[test]
    fn test_lookup_by_unique_column() {
        let fx = Fixture::new();
        let store = fx.store();

        let bob = store.get("User", "b@x.io", "email").unwrap().unwrap();
        assert_eq!(bob.id(), Some(2));
        assert_eq!(fx.cache.get("users_email:b@x.io").unwrap(), Some(json!(2)));

        assert!(matches!(
            store.get("User", "bob", "name"),
            Err(DbError::InvalidLookupColumn { .. })
        ));
        assert!(matches!(
            store.get("User", "x", "nope"),
            Err(DbError::InvalidLookupColumn { .. })
        ));
    }

    #[test]
    fn test_get_many_preserves_order_and_remembers_misses() {
        let fx = Fixture::new();
        let store = fx.store();

        let found = store.get_many("User", &[2, 42, 1, 3]).unwrap();
        let ids: Vec<Option<i64>> = found.iter().map(|e| e.as_ref().and_then(Entity::id)).collect();
        assert_eq!(ids, vec![Some(2), None, Some(1), None]);
        assert!(is_tombstone(&fx.cache.get("users_id:42").unwrap().unwrap()));
        assert!(is_tombstone(&fx.cache.get("users_id:3").unwrap().unwrap()));

        let before = fx.queries();
        let again = store.get_many("User", &[2, 42, 1, 3]).unwrap();
        assert_eq!(again.iter().filter(|e| e.is_some()).count(), 2);
        assert_eq!(fx.queries(), before);

        assert!(store.get_many("User", &[]).unwrap().is_empty());
    }

    #[test]
    fn test_insert_fills_defaults() {
        let fx = Fixture::new();
        let store = fx.store();

        let mut user = store.create("User").unwrap();
        user.set("email", "d@x.io").unwrap();
        store.save(&mut user).unwrap();

        assert_eq!(user.id(), Some(4));
        assert!(!user.is_dirty());
        assert_eq!(user.get("status").unwrap(), Some(json!("new")));
        let created = user.get("created_at").unwrap().unwrap();
        assert_eq!(created.as_str().unwrap().len(), "2024-01-01 00:00:00".len());

        assert_eq!(fx.cache.get("users_email:d@x.io").unwrap(), Some(json!(4)));
        assert_eq!(fx.cache.get("users_id:4").unwrap().unwrap()["email"], json!("d@x.io"));

        let mut count = Query::new(&fx.router, "app", "SELECT COUNT(*) FROM users WHERE email = 'd@x.io'");
        assert_eq!(count.fetch_value().unwrap(), Some(json!(1)));
    }

    #[test]
    fn test_update_writes_dirty_columns_only() {
        let fx = Fixture::new();
        let store = fx.store();

        let mut alice = store.get_by_id("User", 1).unwrap().unwrap();
        let before = fx.queries();
        store.save(&mut alice).unwrap();
        assert_eq!(fx.queries(), before, "clean entity is not written");

        alice.set("email", "alice@x.io").unwrap();
        store.save(&mut alice).unwrap();
        assert_eq!(fx.queries(), before + 1);
        assert_eq!(fx.cache.get("users_email:alice@x.io").unwrap(), Some(json!(1)));

        let reloaded = store.get("User", "alice@x.io", "email").unwrap().unwrap();
        assert_eq!(reloaded.id(), Some(1));
        assert_eq!(reloaded.get("name").unwrap(), Some(json!("alice")));
    }

    #[test]
    fn test_delete_leaves_tombstone() {
        let fx = Fixture::new();
        let store = fx.store();

        let bob = store.get_by_id("User", 2).unwrap().unwrap();
        assert!(store.delete(&bob).unwrap());
        assert!(is_tombstone(&fx.cache.get("users_id:2").unwrap().unwrap()));

        let before = fx.queries();
        assert!(store.get_by_id("User", 2).unwrap().is_none());
        assert_eq!(fx.queries(), before);

        assert!(!store.delete(&store.create("User").unwrap()).unwrap());
    }
}
