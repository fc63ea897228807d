use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::ToSql;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{placeholder_name, Connection, DatabaseEngine, ServerDescriptor, Statement};
use crate::db::schema::Row;
use crate::error::DbError;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite connection using rusqlite
pub struct SqliteConnection {
    conn: Arc<Mutex<rusqlite::Connection>>,
}

impl SqliteConnection {
    /// Open the database named by the server's DSN.
    ///
    /// Accepts `sqlite::memory:`, `sqlite://<path>` or a bare file path.
    pub fn open(server: &ServerDescriptor) -> Result<Self, DbError> {
        let dsn = server.dsn.trim();
        let conn = if dsn == "sqlite::memory:" || dsn == ":memory:" {
            rusqlite::Connection::open_in_memory()?
        } else {
            let path = dsn.strip_prefix("sqlite://").unwrap_or(dsn);
            rusqlite::Connection::open(path)?
        };
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: rusqlite::Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Run a batch of semicolon-separated statements, such as a schema script.
    pub fn execute_batch(&self, sql: &str) -> Result<(), DbError> {
        let conn = lock(&self.conn)?;
        conn.execute_batch(sql)?;
        Ok(())
    }
}

impl Connection for SqliteConnection {
    fn prepare(&self, sql: &str) -> Result<Box<dyn Statement>, DbError> {
        // Compile once up front so syntax errors surface at prepare time.
        lock(&self.conn)?.prepare(sql)?;
        Ok(Box::new(SqliteStatement {
            conn: Arc::clone(&self.conn),
            sql: sql.to_string(),
            params: Vec::new(),
            columns: Vec::new(),
            rows: VecDeque::new(),
            last_insert_id: 0,
            rows_affected: 0,
        }))
    }

    fn engine(&self) -> DatabaseEngine {
        DatabaseEngine::Sqlite
    }
}

struct SqliteStatement {
    conn: Arc<Mutex<rusqlite::Connection>>,
    sql: String,
    params: Vec<(String, SqlValue)>,
    columns: Vec<String>,
    rows: VecDeque<Row>,
    last_insert_id: i64,
    rows_affected: u64,
}

impl Statement for SqliteStatement {
    fn bind_value(&mut self, placeholder: &str, value: &serde_json::Value) -> Result<(), DbError> {
        let name = format!(":{}", placeholder_name(placeholder));
        let value = json_to_sql(value);
        match self.params.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.params.push((name, value)),
        }
        Ok(())
    }

    fn execute(&mut self) -> Result<bool, DbError> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(&self.sql)?;
        let bound: Vec<(&str, &dyn ToSql)> = self
            .params
            .iter()
            .map(|(name, value)| (name.as_str(), value as &dyn ToSql))
            .collect();

        self.columns = stmt.column_names().into_iter().map(String::from).collect();
        self.rows.clear();

        if self.columns.is_empty() {
            self.rows_affected = stmt.execute(bound.as_slice())? as u64;
        } else {
            let mut rows = stmt.query(bound.as_slice())?;
            while let Some(row) = rows.next()? {
                let mut record = Row::new();
                for (idx, column) in self.columns.iter().enumerate() {
                    record.insert(column.clone(), sql_to_json(row.get_ref(idx)?));
                }
                self.rows.push_back(record);
            }
            self.rows_affected = 0;
        }

        self.last_insert_id = conn.last_insert_rowid();
        Ok(true)
    }

    fn fetch(&mut self) -> Result<Option<Row>, DbError> {
        Ok(self.rows.pop_front())
    }

    fn fetch_all(&mut self) -> Result<Vec<Row>, DbError> {
        Ok(self.rows.drain(..).collect())
    }

    fn last_insert_id(&self) -> Result<i64, DbError> {
        Ok(self.last_insert_id)
    }

    fn column_count(&self) -> usize {
        self.columns.len()
    }

    fn rows_affected(&self) -> u64 {
        self.rows_affected
    }
}

fn lock(
    conn: &Mutex<rusqlite::Connection>,
) -> Result<std::sync::MutexGuard<'_, rusqlite::Connection>, DbError> {
    conn.lock()
        .map_err(|e| DbError::Query(format!("SQLite connection lock poisoned: {}", e)))
}

fn json_to_sql(value: &serde_json::Value) -> SqlValue {
    match value {
        serde_json::Value::Null => SqlValue::Null,
        serde_json::Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else {
                SqlValue::Real(n.as_f64().unwrap_or_default())
            }
        }
        serde_json::Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn sql_to_json(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        ValueRef::Text(bytes) => serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => serde_json::Value::String(hex::encode(bytes)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn memory() -> SqliteConnection {
        let conn = SqliteConnection::from_connection(rusqlite::Connection::open_in_memory().unwrap());
        conn.execute_batch(
            "CREATE TABLE people (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT, age INTEGER, avatar BLOB);",
        )
        .unwrap();
        conn
    }

    #[test]
    fn test_insert_and_select() {
        let conn = memory();

        let mut insert = conn
            .prepare("INSERT INTO people (name, age, avatar) VALUES (:name, :age, x'0aff')")
            .unwrap();
        insert.bind_value(":name", &json!("Alice")).unwrap();
        insert.bind_value("age", &json!(31)).unwrap();
        assert!(insert.execute().unwrap());
        assert_eq!(insert.last_insert_id().unwrap(), 1);
        assert_eq!(insert.rows_affected(), 1);

        let mut select = conn.prepare("SELECT id, name, age, avatar FROM people").unwrap();
        select.execute().unwrap();
        assert_eq!(select.column_count(), 4);
        let row = select.fetch().unwrap().unwrap();
        assert_eq!(row["id"], json!(1));
        assert_eq!(row["name"], json!("Alice"));
        assert_eq!(row["age"], json!(31));
        assert_eq!(row["avatar"], json!("0aff"));
        assert!(select.fetch().unwrap().is_none());
    }

    #[test]
    fn test_rebinding_replaces_value() {
        let conn = memory();
        let mut insert = conn.prepare("INSERT INTO people (name) VALUES (:name)").unwrap();
        insert.bind_value("name", &json!("first")).unwrap();
        insert.bind_value("name", &json!("second")).unwrap();
        insert.execute().unwrap();

        let mut select = conn.prepare("SELECT name FROM people").unwrap();
        select.execute().unwrap();
        assert_eq!(select.fetch_all().unwrap()[0]["name"], json!("second"));
    }

    #[test]
    fn test_syntax_error_at_prepare() {
        let conn = memory();
        assert!(matches!(conn.prepare("SELEC nonsense"), Err(DbError::Query(_))));
    }

    #[test]
    fn test_open_from_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.db");
        let server = ServerDescriptor::new(
            "app",
            &format!("sqlite://{}", path.display()),
            crate::db::connectors::Role::Master,
        );
        let conn = SqliteConnection::open(&server).unwrap();
        assert_eq!(conn.engine(), DatabaseEngine::Sqlite);
        assert!(path.exists());
    }
}
