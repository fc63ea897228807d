use mysql_async::consts::ColumnType;
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, Opts, OptsBuilder, Params, Row as MySqlRow, Value as MySqlValue};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::{placeholder_name, Connection, DatabaseEngine, ServerDescriptor, Statement};
use crate::db::schema::Row;
use crate::error::DbError;

/// MySQL connection using mysql_async.
///
/// The engine is synchronous, so each connection drives its own
/// current-thread runtime and blocks on every round-trip.
pub struct MySqlConnection {
    session: Arc<Session>,
}

struct Session {
    runtime: tokio::runtime::Runtime,
    conn: Mutex<Conn>,
}

impl MySqlConnection {
    pub fn open(server: &ServerDescriptor) -> Result<Self, DbError> {
        let opts = Opts::from_url(&server.dsn).map_err(|e| {
            DbError::Configuration(format!(
                "invalid MySQL DSN for schema '{}': {}",
                server.schema, e
            ))
        })?;
        let mut builder = OptsBuilder::from_opts(opts);
        if let Some(host) = &server.host {
            builder = builder.ip_or_hostname(host.clone());
        }
        if let Some(port) = server.port {
            builder = builder.tcp_port(port);
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| DbError::Query(format!("failed to start MySQL runtime: {}", e)))?;
        let conn = runtime.block_on(Conn::new(builder))?;

        Ok(Self {
            session: Arc::new(Session {
                runtime,
                conn: Mutex::new(conn),
            }),
        })
    }
}

impl Connection for MySqlConnection {
    fn prepare(&self, sql: &str) -> Result<Box<dyn Statement>, DbError> {
        Ok(Box::new(MySqlStatement {
            session: Arc::clone(&self.session),
            sql: sql.to_string(),
            params: Vec::new(),
            column_count: 0,
            rows: VecDeque::new(),
            last_insert_id: 0,
            rows_affected: 0,
        }))
    }

    fn engine(&self) -> DatabaseEngine {
        DatabaseEngine::MySql
    }
}

struct MySqlStatement {
    session: Arc<Session>,
    sql: String,
    params: Vec<(String, MySqlValue)>,
    column_count: usize,
    rows: VecDeque<Row>,
    last_insert_id: i64,
    rows_affected: u64,
}

impl Statement for MySqlStatement {
    fn bind_value(&mut self, placeholder: &str, value: &serde_json::Value) -> Result<(), DbError> {
        let name = placeholder_name(placeholder).to_string();
        let value = json_to_mysql(value);
        match self.params.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.params.push((name, value)),
        }
        Ok(())
    }

    fn execute(&mut self) -> Result<bool, DbError> {
        let session = Arc::clone(&self.session);
        let mut conn = session
            .conn
            .lock()
            .map_err(|e| DbError::Query(format!("MySQL connection lock poisoned: {}", e)))?;

        let rows: Vec<MySqlRow> = if self.params.is_empty() {
            session.runtime.block_on(conn.query(self.sql.as_str()))?
        } else {
            let params = Params::from(self.params.clone());
            session.runtime.block_on(conn.exec(self.sql.as_str(), params))?
        };

        self.last_insert_id = conn.last_insert_id().map(|id| id as i64).unwrap_or(0);
        self.rows_affected = conn.affected_rows();
        self.column_count = rows.first().map(|r| r.columns_ref().len()).unwrap_or(0);
        self.rows = rows.iter().map(row_to_map).collect();
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
        self.column_count
    }

    fn rows_affected(&self) -> u64 {
        self.rows_affected
    }
}

fn json_to_mysql(value: &serde_json::Value) -> MySqlValue {
    match value {
        serde_json::Value::Null => MySqlValue::NULL,
        serde_json::Value::Bool(b) => MySqlValue::Int(i64::from(*b)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                MySqlValue::Int(i)
            } else if let Some(u) = n.as_u64() {
                MySqlValue::UInt(u)
            } else {
                MySqlValue::Double(n.as_f64().unwrap_or_default())
            }
        }
        serde_json::Value::String(s) => MySqlValue::Bytes(s.as_bytes().to_vec()),
        other => MySqlValue::Bytes(other.to_string().into_bytes()),
    }
}

/// Convert a mysql_async row into our Row type
fn row_to_map(row: &MySqlRow) -> Row {
    let mut map = Row::new();
    for (idx, col) in row.columns_ref().iter().enumerate() {
        let value = row
            .as_ref(idx)
            .map(|v| mysql_to_json(v, col.column_type()))
            .unwrap_or(serde_json::Value::Null);
        map.insert(col.name_str().into_owned(), value);
    }
    map
}

/// Convert a single column value to serde_json::Value.
///
/// The text protocol returns numbers as bytes; the column type decides how
/// they are parsed back.
fn mysql_to_json(value: &MySqlValue, column_type: ColumnType) -> serde_json::Value {
    match value {
        MySqlValue::NULL => serde_json::Value::Null,
        MySqlValue::Int(i) => serde_json::json!(i),
        MySqlValue::UInt(u) => serde_json::json!(u),
        MySqlValue::Float(f) => serde_json::json!(f),
        MySqlValue::Double(d) => serde_json::json!(d),
        MySqlValue::Bytes(bytes) => {
            let text = String::from_utf8_lossy(bytes).into_owned();
            match column_type {
                ColumnType::MYSQL_TYPE_TINY
                | ColumnType::MYSQL_TYPE_SHORT
                | ColumnType::MYSQL_TYPE_INT24
                | ColumnType::MYSQL_TYPE_LONG
                | ColumnType::MYSQL_TYPE_LONGLONG => text
                    .parse::<i64>()
                    .map(serde_json::Value::from)
                    .unwrap_or(serde_json::Value::String(text)),
                ColumnType::MYSQL_TYPE_FLOAT
                | ColumnType::MYSQL_TYPE_DOUBLE
                | ColumnType::MYSQL_TYPE_DECIMAL
                | ColumnType::MYSQL_TYPE_NEWDECIMAL => text
                    .parse::<f64>()
                    .ok()
                    .and_then(serde_json::Number::from_f64)
                    .map(serde_json::Value::Number)
                    .unwrap_or(serde_json::Value::String(text)),
                _ => serde_json::Value::String(text),
            }
        }
        MySqlValue::Date(year, month, day, hour, minute, second, _) => serde_json::Value::String(
            format!(
                "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                year, month, day, hour, minute, second
            ),
        ),
        MySqlValue::Time(negative, days, hours, minutes, seconds, _) => {
            let total_hours = u32::from(*hours) + days * 24;
            serde_json::Value::String(format!(
                "{}{:02}:{:02}:{:02}",
                if *negative { "-" } else { "" },
                total_hours,
                minutes,
                seconds
            ))
        }
    }
}
