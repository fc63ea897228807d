pub mod mysql;
pub mod sqlite;

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::db::schema::Row;
use crate::error::DbError;

/// Supported database engines
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DatabaseEngine {
    MySql,
    Sqlite,
}

impl DatabaseEngine {
    /// Infer the engine from a DSN: `mysql://...` is MySQL, anything else
    /// (`sqlite://path`, `sqlite::memory:`, a bare path) is SQLite.
    pub fn from_dsn(dsn: &str) -> Self {
        if dsn.trim_start().to_ascii_lowercase().starts_with("mysql:") {
            DatabaseEngine::MySql
        } else {
            DatabaseEngine::Sqlite
        }
    }
}

impl std::fmt::Display for DatabaseEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatabaseEngine::MySql => write!(f, "MySQL"),
            DatabaseEngine::Sqlite => write!(f, "SQLite"),
        }
    }
}

/// Whether a server takes writes or serves reads.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Master,
    Slave,
}

impl Role {
    /// Classify a statement: reads go to a slave, everything else to the master.
    ///
    /// A statement is a read when, after an optional leading `/* ... */`
    /// comment, it starts with `SELECT`.
    pub fn for_sql(sql: &str) -> Self {
        let mut rest = sql.trim_start();
        if let Some(after_open) = rest.strip_prefix("/*") {
            rest = match after_open.find("*/") {
                Some(end) => after_open[end + 2..].trim_start(),
                None => "",
            };
        }
        let is_select = rest
            .get(..6)
            .map(|head| head.eq_ignore_ascii_case("select"))
            .unwrap_or(false);
        if is_select {
            Role::Slave
        } else {
            Role::Master
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Master => write!(f, "MASTER"),
            Role::Slave => write!(f, "SLAVE"),
        }
    }
}

fn default_weight() -> u32 {
    1
}

/// One server in a (schema, role) pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerDescriptor {
    pub schema: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    pub dsn: String,
    pub role: Role,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

impl ServerDescriptor {
    pub fn new(schema: &str, dsn: &str, role: Role) -> Self {
        Self {
            schema: schema.to_string(),
            host: None,
            port: None,
            dsn: dsn.to_string(),
            role,
            weight: 1,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight.max(1);
        self
    }

    pub fn engine(&self) -> DatabaseEngine {
        DatabaseEngine::from_dsn(&self.dsn)
    }
}

/// A prepared statement.
///
/// Placeholders are named (`:name`). Rows are returned as ordered JSON maps.
pub trait Statement: Send {
    /// Bind a value to a placeholder, with or without the leading colon.
    fn bind_value(&mut self, placeholder: &str, value: &serde_json::Value) -> Result<(), DbError>;

    /// Run the statement with the bound values.
    fn execute(&mut self) -> Result<bool, DbError>;

    /// Next row of the result, if any.
    fn fetch(&mut self) -> Result<Option<Row>, DbError>;

    /// All remaining rows.
    fn fetch_all(&mut self) -> Result<Vec<Row>, DbError>;

    /// Id generated by the last INSERT on this statement's connection.
    fn last_insert_id(&self) -> Result<i64, DbError>;

    /// Number of projected columns of the result.
    fn column_count(&self) -> usize;

    /// Rows changed by an INSERT, UPDATE or DELETE.
    fn rows_affected(&self) -> u64;

    /// Start executing without waiting for the result. Returns `false` when
    /// the driver cannot execute asynchronously; the caller then falls back
    /// to [`Statement::execute`].
    fn dispatch(&mut self) -> Result<bool, DbError> {
        Ok(false)
    }

    /// Whether a dispatched statement has completed.
    fn poll(&mut self) -> Result<bool, DbError> {
        Ok(true)
    }
}

/// An open database connection.
pub trait Connection: Send + Sync {
    fn prepare(&self, sql: &str) -> Result<Box<dyn Statement>, DbError>;

    fn engine(&self) -> DatabaseEngine;

    /// Whether statements from this connection support `dispatch`/`poll`.
    fn supports_async(&self) -> bool {
        false
    }
}

pub type SharedConnection = Arc<dyn Connection>;

/// Opens connections to servers.
pub trait Connector: Send + Sync {
    fn connect(&self, server: &ServerDescriptor) -> Result<SharedConnection, DbError>;
}

/// Connector that picks the driver from the server's DSN.
#[derive(Debug, Default, Clone, Copy)]
pub struct DriverConnector;

impl Connector for DriverConnector {
    fn connect(&self, server: &ServerDescriptor) -> Result<SharedConnection, DbError> {
        let connection: SharedConnection = match server.engine() {
            DatabaseEngine::MySql => Arc::new(mysql::MySqlConnection::open(server)?),
            DatabaseEngine::Sqlite => Arc::new(sqlite::SqliteConnection::open(server)?),
        };
        log::debug!(
            "Connected to {} server for schema '{}' ({})",
            server.engine(),
            server.schema,
            server.role
        );
        Ok(connection)
    }
}

/// Strip the leading colon of a placeholder name.
pub(crate) fn placeholder_name(placeholder: &str) -> &str {
    placeholder.strip_prefix(':').unwrap_or(placeholder)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_is_read() {
        assert_eq!(Role::for_sql("SELECT * FROM users"), Role::Slave);
        assert_eq!(Role::for_sql("  select id from t"), Role::Slave);
    }

    #[test]
    fn test_leading_comment_is_skipped() {
        assert_eq!(Role::for_sql("/* hint */ SELECT 1"), Role::Slave);
        assert_eq!(Role::for_sql("/* SELECT */ UPDATE t SET a = 1"), Role::Master);
    }

    #[test]
    fn test_everything_else_is_write() {
        assert_eq!(Role::for_sql("INSERT INTO t (a) VALUES (1)"), Role::Master);
        assert_eq!(Role::for_sql("SHOW TABLES"), Role::Master);
        assert_eq!(Role::for_sql("SEL"), Role::Master);
        assert_eq!(Role::for_sql("/* unterminated"), Role::Master);
    }

    #[test]
    fn test_engine_from_dsn() {
        assert_eq!(DatabaseEngine::from_dsn("mysql://root@localhost/app"), DatabaseEngine::MySql);
        assert_eq!(DatabaseEngine::from_dsn("/tmp/app.db"), DatabaseEngine::Sqlite);
        assert_eq!(DatabaseEngine::from_dsn("sqlite::memory:"), DatabaseEngine::Sqlite);
    }

    #[test]
    fn test_descriptor_defaults() {
        let json = r#"{ "schema": "app", "dsn": "mysql://db1/app", "role": "SLAVE" }"#;
        let server: ServerDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(server.weight, 1);
        assert_eq!(server.role, Role::Slave);
        assert_eq!(server.engine(), DatabaseEngine::MySql);
    }
}
