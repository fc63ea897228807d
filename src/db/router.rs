use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::connectors::{Connector, Role, ServerDescriptor, SharedConnection};
use crate::error::DbError;
use crate::util::pick_weighted;

/// Routes statements to a server pool by (schema, role) and keeps one open
/// connection per pair.
pub struct ConnectionRouter {
    servers: Vec<ServerDescriptor>,
    connector: Arc<dyn Connector>,
    connections: Mutex<HashMap<(String, Role), SharedConnection>>,
}

impl ConnectionRouter {
    pub fn new(servers: Vec<ServerDescriptor>, connector: Arc<dyn Connector>) -> Self {
        Self {
            servers,
            connector,
            connections: Mutex::new(HashMap::new()),
        }
    }

    pub fn servers(&self) -> &[ServerDescriptor] {
        &self.servers
    }

    fn candidates(&self, schema: &str, role: Role) -> Vec<&ServerDescriptor> {
        self.servers
            .iter()
            .filter(|s| s.schema == schema && s.role == role)
            .collect()
    }

    /// Choose one server for (schema, role).
    pub fn pick_server(&self, schema: &str, role: Role) -> Result<ServerDescriptor, DbError> {
        let candidates = self.candidates(schema, role);
        let weights: Vec<u32> = candidates.iter().map(|s| s.weight).collect();
        pick_weighted(&weights)
            .map(|idx| candidates[idx].clone())
            .ok_or_else(|| DbError::NoServersFound {
                schema: schema.to_string(),
                role,
            })
    }

    /// The cached connection for (schema, role), opening one on first use.
    ///
    /// A server that fails to connect is logged and dropped from this
    /// attempt's pool; the call fails only when no server is left.
    pub fn get_connection(&self, schema: &str, role: Role) -> Result<SharedConnection, DbError> {
        let key = (schema.to_string(), role);
        let mut connections = self
            .connections
            .lock()
            .map_err(|e| DbError::Query(format!("connection cache lock poisoned: {}", e)))?;
        if let Some(conn) = connections.get(&key) {
            return Ok(Arc::clone(conn));
        }

        let mut pool = self.candidates(schema, role);
        while !pool.is_empty() {
            let weights: Vec<u32> = pool.iter().map(|s| s.weight).collect();
            let Some(idx) = pick_weighted(&weights) else {
                break;
            };
            let server = pool.remove(idx);
            match self.connector.connect(server) {
                Ok(conn) => {
                    log::debug!("Opened {} connection for schema '{}'", role, schema);
                    connections.insert(key, Arc::clone(&conn));
                    return Ok(conn);
                }
                Err(e) => {
                    log::warn!(
                        "Skipping {} server for schema '{}' ({}): {}",
                        role,
                        schema,
                        server.host.as_deref().unwrap_or(&server.dsn),
                        e
                    );
                }
            }
        }

        Err(DbError::NoServersFound {
            schema: schema.to_string(),
            role,
        })
    }

    /// Connection for a statement, routed by its read/write classification.
    pub fn connection_for(&self, schema: &str, sql: &str) -> Result<SharedConnection, DbError> {
        self.get_connection(schema, Role::for_sql(sql))
    }
}
