use super::Query;
use crate::error::DbError;

/// Queries executed together when the driver can run them without blocking.
///
/// With fewer than two queries, or any connection lacking non-blocking
/// support, every query simply runs in turn.
#[derive(Default)]
pub struct QueryBatch<'q, 'a> {
    queries: Vec<&'q mut Query<'a>>,
}

impl<'q, 'a> QueryBatch<'q, 'a> {
    pub fn new() -> Self {
        Self { queries: Vec::new() }
    }

    pub fn add(&mut self, query: &'q mut Query<'a>) -> &mut Self {
        self.queries.push(query);
        self
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    /// Execute every registered query.
    pub fn execute(&mut self) -> Result<(), DbError> {
        if self.queries.len() < 2 {
            return self.execute_each();
        }

        let mut all_async = true;
        for query in self.queries.iter_mut() {
            all_async &= query.prepare()?;
        }
        if !all_async {
            log::debug!("Batch of {} queries runs sequentially", self.queries.len());
            return self.execute_each();
        }

        let mut pending: Vec<usize> = Vec::with_capacity(self.queries.len());
        for (idx, query) in self.queries.iter_mut().enumerate() {
            if query.dispatch()? {
                pending.push(idx);
            } else {
                query.execute()?;
            }
        }

        while !pending.is_empty() {
            let mut still_running = Vec::with_capacity(pending.len());
            for idx in pending {
                if !self.queries[idx].poll()? {
                    still_running.push(idx);
                }
            }
            pending = still_running;
            if !pending.is_empty() {
                std::thread::yield_now();
            }
        }
        Ok(())
    }

    fn execute_each(&mut self) -> Result<(), DbError> {
        for query in self.queries.iter_mut() {
            query.execute()?;
        }
        Ok(())
    }

    /// Execute the batch and collect each query's `fetch_all`, in
    /// registration order.
    pub fn fetch_all(&mut self) -> Result<Vec<Vec<serde_json::Value>>, DbError> {
        self.execute()?;
        self.queries.iter_mut().map(|q| q.fetch_all()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connectors::{
        Connection, Connector, DatabaseEngine, Role, ServerDescriptor, SharedConnection, Statement,
    };
    use crate::db::router::ConnectionRouter;
    use crate::db::schema::Row;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Driver whose statements finish after a statement-specific number of
    /// polls. Each statement returns one row holding its SQL text.
    struct PollingConnection {
        nonblocking: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    struct PollingStatement {
        sql: String,
        polls_left: usize,
        log: Arc<Mutex<Vec<String>>>,
        rows: Vec<Row>,
    }

    impl PollingStatement {
        fn finish(&mut self) {
            let mut row = Row::new();
            row.insert("sql".to_string(), json!(self.sql));
            row.insert("n".to_string(), json!(1));
            self.rows = vec![row];
        }
    }

    impl Statement for PollingStatement {
        fn bind_value(&mut self, _placeholder: &str, _value: &serde_json::Value) -> Result<(), DbError> {
            Ok(())
        }

        fn execute(&mut self) -> Result<bool, DbError> {
            self.log.lock().unwrap().push(format!("execute {}", self.sql));
            self.finish();
            Ok(true)
        }

        fn fetch(&mut self) -> Result<Option<Row>, DbError> {
            Ok(self.rows.pop())
        }

        fn fetch_all(&mut self) -> Result<Vec<Row>, DbError> {
            Ok(std::mem::take(&mut self.rows))
        }

        fn last_insert_id(&self) -> Result<i64, DbError> {
            Ok(0)
        }

        fn column_count(&self) -> usize {
            2
        }

        fn rows_affected(&self) -> u64 {
            0
        }

        fn dispatch(&mut self) -> Result<bool, DbError> {
            self.log.lock().unwrap().push(format!("dispatch {}", self.sql));
            Ok(true)
        }

        fn poll(&mut self) -> Result<bool, DbError> {
            if self.polls_left == 0 {
                self.log.lock().unwrap().push(format!("done {}", self.sql));
                self.finish();
                return Ok(true);
            }
            self.polls_left -= 1;
            Ok(false)
        }
    }

    impl Connection for PollingConnection {
        fn prepare(&self, sql: &str) -> Result<Box<dyn Statement>, DbError> {
            // "SELECT 3" needs three polls.
            let polls_left = sql.trim_start_matches("SELECT ").parse().unwrap_or(0);
            Ok(Box::new(PollingStatement {
                sql: sql.to_string(),
                polls_left,
                log: Arc::clone(&self.log),
                rows: Vec::new(),
            }))
        }

        fn engine(&self) -> DatabaseEngine {
            DatabaseEngine::MySql
        }

        fn supports_async(&self) -> bool {
            self.nonblocking
        }
    }

    struct PollingConnector {
        nonblocking: bool,
        log: Arc<Mutex<Vec<String>>>,
        opened: AtomicUsize,
    }

    impl Connector for PollingConnector {
        fn connect(&self, _server: &ServerDescriptor) -> Result<SharedConnection, DbError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(PollingConnection {
                nonblocking: self.nonblocking,
                log: Arc::clone(&self.log),
            }))
        }
    }

    fn router(nonblocking: bool) -> (ConnectionRouter, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let connector = PollingConnector {
            nonblocking,
            log: Arc::clone(&log),
            opened: AtomicUsize::new(0),
        };
        let router = ConnectionRouter::new(
            vec![ServerDescriptor::new("app", "mysql://db/app", Role::Slave)],
            Arc::new(connector),
        );
        (router, log)
    }

    #[test]
    fn test_async_batch_keeps_registration_order() {
        let (router, log) = router(true);
        let mut slow = Query::new(&router, "app", "SELECT 3");
        let mut fast = Query::new(&router, "app", "SELECT 0");

        let results = {
            let mut batch = QueryBatch::new();
            batch.add(&mut slow).add(&mut fast);
            batch.fetch_all().unwrap()
        };

        assert_eq!(results[0][0]["sql"], json!("SELECT 3"));
        assert_eq!(results[1][0]["sql"], json!("SELECT 0"));
        assert!(slow.is_executed() && fast.is_executed());

        let log = log.lock().unwrap();
        assert_eq!(log[0], "dispatch SELECT 3");
        assert_eq!(log[1], "dispatch SELECT 0");
        // The fast query is reaped before the slow one.
        assert_eq!(log[2], "done SELECT 0");
        assert_eq!(log[3], "done SELECT 3");
    }

    #[test]
    fn test_blocking_driver_runs_sequentially() {
        let (router, log) = router(false);
        let mut first = Query::new(&router, "app", "SELECT 2");
        let mut second = Query::new(&router, "app", "SELECT 1");
        let mut batch = QueryBatch::new();
        batch.add(&mut first).add(&mut second);
        batch.execute().unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["execute SELECT 2".to_string(), "execute SELECT 1".to_string()]
        );
    }

    #[test]
    fn test_single_query_never_dispatches() {
        let (router, log) = router(true);
        let mut only = Query::new(&router, "app", "SELECT 5");
        let mut batch = QueryBatch::new();
        batch.add(&mut only);
        batch.execute().unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["execute SELECT 5".to_string()]);
    }
}
