use crate::client::connection::ClientConnection;
use crate::error::RemoteError;
use sfdb_common::Config;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tracing::debug;

/// Routes clients to a shared connection per endpoint.
///
/// Catalogue and store proxies talking to the same server share one
/// control+data pair; the connection dies with its last client (the
/// registry only holds weak references).
#[derive(Default)]
pub struct ClientConnectionRouter {
    connections: Mutex<HashMap<String, Weak<ClientConnection>>>,
}

impl ClientConnectionRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// An existing live connection to `endpoint`, or a freshly dialed one.
    pub async fn connection(
        &self,
        endpoint: &str,
        config: &Config,
    ) -> Result<Arc<ClientConnection>, RemoteError> {
        {
            let connections = self
                .connections
                .lock()
                .map_err(|_| RemoteError::transport(endpoint, "router state poisoned"))?;
            if let Some(existing) = connections.get(endpoint).and_then(Weak::upgrade) {
                if !existing.is_closed() {
                    debug!(endpoint, "reusing connection");
                    return Ok(existing);
                }
            }
        }

        let connection = ClientConnection::connect(endpoint, config).await?;
        let mut connections = self
            .connections
            .lock()
            .map_err(|_| RemoteError::transport(endpoint, "router state poisoned"))?;
        connections.insert(endpoint.to_string(), Arc::downgrade(&connection));
        Ok(connection)
    }

    /// Drops the registry entry for a dead endpoint.
    pub fn deregister(&self, endpoint: &str) {
        if let Ok(mut connections) = self.connections.lock() {
            connections.remove(endpoint);
        }
    }
}
