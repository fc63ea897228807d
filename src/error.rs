use thiserror::Error;

use crate::db::connectors::Role;

/// Errors raised by the engine.
///
/// Every fallible operation returns this type. "Not found" is never an
/// error: lookups return `Option` instead.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("No servers found for schema '{schema}' with role {role}")]
    NoServersFound { schema: String, role: Role },

    #[error("Placeholder '{0}' is already bound")]
    DuplicateBind(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Unsupported query: {0}")]
    UnsupportedQuery(String),

    #[error("Dependency cycle between: {}", .0.join(", "))]
    Cycle(Vec<String>),

    #[error("Column '{column}' of table '{table}' is not a unique index and cannot be used for lookup")]
    InvalidLookupColumn { table: String, column: String },

    #[error("Unknown field '{field}' for table '{table}'")]
    UnknownField { table: String, field: String },

    #[error("The id of a '{table}' entity cannot change once assigned")]
    ImmutableId { table: String },

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Sync failed on table '{table}': {source}")]
    Sync {
        table: String,
        #[source]
        source: Box<DbError>,
    },
}

impl DbError {
    pub(crate) fn sync(table: impl Into<String>, source: DbError) -> Self {
        DbError::Sync {
            table: table.into(),
            source: Box::new(source),
        }
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(e: rusqlite::Error) -> Self {
        DbError::Query(e.to_string())
    }
}

impl From<mysql_async::Error> for DbError {
    fn from(e: mysql_async::Error) -> Self {
        DbError::Query(e.to_string())
    }
}

impl From<serde_json::Error> for DbError {
    fn from(e: serde_json::Error) -> Self {
        DbError::Configuration(e.to_string())
    }
}
