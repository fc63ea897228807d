pub mod batch;
pub mod filter;
pub mod sort;

pub use batch::QueryBatch;
pub use filter::{Comparator, Filter, Pattern};
pub use sort::{Direction, Sort, SortSpec};

use indexmap::IndexMap;
use std::time::Duration;

use super::cache::Cache;
use super::connectors::{placeholder_name, SharedConnection, Statement};
use super::router::ConnectionRouter;
use super::schema::{Row, PRIMARY_KEY};
use crate::error::DbError;

struct CacheBinding<'a> {
    cache: &'a dyn Cache,
    key: String,
    ttl: Duration,
}

/// A parameterized statement with deferred execution.
///
/// Nothing touches the database until the first `execute` or fetch. The
/// statement runs at most once; later calls reuse its result.
pub struct Query<'a> {
    router: &'a ConnectionRouter,
    schema: String,
    sql: String,
    params: IndexMap<String, serde_json::Value>,
    connection: Option<SharedConnection>,
    statement: Option<Box<dyn Statement>>,
    executed: bool,
    filter: Option<Filter>,
    sort: Option<Sort>,
    cache: Option<CacheBinding<'a>>,
}

impl<'a> Query<'a> {
    pub fn new(router: &'a ConnectionRouter, schema: &str, sql: &str) -> Self {
        Self {
            router,
            schema: schema.to_string(),
            sql: sql.to_string(),
            params: IndexMap::new(),
            connection: None,
            statement: None,
            executed: false,
            filter: None,
            sort: None,
            cache: None,
        }
    }

    /// Serve fetches from `cache` under `key`, storing the unfiltered result
    /// for `ttl` on a miss.
    pub fn with_cache(mut self, cache: &'a dyn Cache, key: &str, ttl: Duration) -> Self {
        self.cache = Some(CacheBinding {
            cache,
            key: key.to_string(),
            ttl,
        });
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn is_executed(&self) -> bool {
        self.executed
    }

    pub fn params(&self) -> &IndexMap<String, serde_json::Value> {
        &self.params
    }

    /// Bind a named placeholder. Each placeholder may be bound once.
    pub fn bind(
        &mut self,
        placeholder: &str,
        value: impl Into<serde_json::Value>,
    ) -> Result<&mut Self, DbError> {
        let key = format!(":{}", placeholder_name(placeholder));
        if self.params.contains_key(&key) {
            return Err(DbError::DuplicateBind(key));
        }
        self.params.insert(key, value.into());
        Ok(self)
    }

    /// The query's post-fetch filter, created on first use.
    pub fn filter(&mut self) -> &mut Filter {
        self.filter.get_or_insert_with(Filter::new)
    }

    /// The query's post-fetch sort, created on first use.
    pub fn sort(&mut self) -> &mut Sort {
        self.sort.get_or_insert_with(Sort::new)
    }

    /// Open the connection, prepare the statement and bind every parameter.
    /// Returns whether the statement can be dispatched without blocking.
    pub(crate) fn prepare(&mut self) -> Result<bool, DbError> {
        if self.statement.is_none() {
            let connection = self.router.connection_for(&self.schema, &self.sql)?;
            let mut statement = connection.prepare(&self.sql)?;
            for (placeholder, value) in &self.params {
                statement.bind_value(placeholder, value)?;
            }
            self.connection = Some(connection);
            self.statement = Some(statement);
        }
        Ok(self
            .connection
            .as_ref()
            .map(|c| c.supports_async())
            .unwrap_or(false))
    }

    /// Run the statement. Only the first call reaches the database.
    pub fn execute(&mut self) -> Result<bool, DbError> {
        if self.executed {
            return Ok(true);
        }
        self.prepare()?;
        let ok = self.statement_mut()?.execute()?;
        self.executed = true;
        log::debug!("[{}] executed: {}", self.schema, self.sql);
        Ok(ok)
    }

    /// Start the statement without waiting. `false` means the driver
    /// declined and the statement has not run.
    pub(crate) fn dispatch(&mut self) -> Result<bool, DbError> {
        if self.executed {
            return Ok(false);
        }
        self.prepare()?;
        self.statement_mut()?.dispatch()
    }

    /// Check a dispatched statement; marks the query executed once done.
    pub(crate) fn poll(&mut self) -> Result<bool, DbError> {
        if self.executed {
            return Ok(true);
        }
        let done = self.statement_mut()?.poll()?;
        if done {
            self.executed = true;
            log::debug!("[{}] completed: {}", self.schema, self.sql);
        }
        Ok(done)
    }

    fn statement_mut(&mut self) -> Result<&mut Box<dyn Statement>, DbError> {
        self.statement
            .as_mut()
            .ok_or_else(|| DbError::Query(format!("statement not prepared: {}", self.sql)))
    }

    fn cached(&self) -> Result<Option<serde_json::Value>, DbError> {
        match &self.cache {
            Some(binding) => {
                let hit = binding.cache.get(&binding.key)?;
                if hit.is_some() {
                    log::debug!("cache hit: {}", binding.key);
                }
                Ok(hit)
            }
            None => Ok(None),
        }
    }

    fn store(&self, value: &serde_json::Value) -> Result<(), DbError> {
        if let Some(binding) = &self.cache {
            binding.cache.set(&binding.key, value.clone(), binding.ttl)?;
        }
        Ok(())
    }

    /// First column of the first row.
    pub fn fetch_value(&mut self) -> Result<Option<serde_json::Value>, DbError> {
        if let Some(hit) = self.cached()? {
            return Ok(Some(hit).filter(|v| !v.is_null()));
        }
        self.execute()?;
        let value = self
            .statement_mut()?
            .fetch()?
            .and_then(|row| row.into_iter().next().map(|(_, v)| v));
        self.store(value.as_ref().unwrap_or(&serde_json::Value::Null))?;
        Ok(value)
    }

    /// Next row of the result.
    pub fn fetch_row(&mut self) -> Result<Option<Row>, DbError> {
        if let Some(hit) = self.cached()? {
            return Ok(match hit {
                serde_json::Value::Object(row) => Some(row),
                _ => None,
            });
        }
        self.execute()?;
        let row = self.statement_mut()?.fetch()?;
        self.store(
            &row.clone()
                .map(serde_json::Value::Object)
                .unwrap_or(serde_json::Value::Null),
        )?;
        Ok(row)
    }

    /// All rows as records, without collapsing or post-processing.
    pub fn fetch_rows(&mut self) -> Result<Vec<Row>, DbError> {
        self.execute()?;
        self.statement_mut()?.fetch_all()
    }

    /// All rows, filtered then sorted.
    ///
    /// When exactly one column is projected, each row collapses to its
    /// scalar value.
    pub fn fetch_all(&mut self) -> Result<Vec<serde_json::Value>, DbError> {
        let raw = match self.cached()? {
            Some(serde_json::Value::Array(values)) => values,
            _ => {
                self.execute()?;
                let statement = self.statement_mut()?;
                let single_column = statement.column_count() == 1;
                let rows = statement.fetch_all()?;
                let values: Vec<serde_json::Value> = rows
                    .into_iter()
                    .map(|row| {
                        if single_column {
                            row.into_iter()
                                .next()
                                .map(|(_, v)| v)
                                .unwrap_or(serde_json::Value::Null)
                        } else {
                            serde_json::Value::Object(row)
                        }
                    })
                    .collect();
                self.store(&serde_json::Value::Array(values.clone()))?;
                values
            }
        };

        let filtered = match &self.filter {
            Some(filter) => filter.apply(raw),
            None => raw,
        };
        Ok(match &self.sort {
            Some(sort) => sort.apply(filtered),
            None => filtered,
        })
    }

    /// Integer ids of the result: scalar rows as-is, records by their `id`.
    pub fn fetch_ids(&mut self) -> Result<Vec<i64>, DbError> {
        Ok(self
            .fetch_all()?
            .iter()
            .filter_map(|value| match value {
                serde_json::Value::Object(row) => row.get(PRIMARY_KEY).and_then(as_id),
                scalar => as_id(scalar),
            })
            .collect())
    }

    pub fn last_insert_id(&mut self) -> Result<i64, DbError> {
        self.execute()?;
        self.statement_mut()?.last_insert_id()
    }

    pub fn rows_affected(&mut self) -> Result<u64, DbError> {
        self.execute()?;
        Ok(self.statement_mut()?.rows_affected())
    }
}

/// Read an integer id from a JSON value.
pub(crate) fn as_id(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
