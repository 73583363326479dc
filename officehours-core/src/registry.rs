// ABOUTME: Registry of live servers keyed by community id.
// ABOUTME: Explicit object passed to whoever needs lookup; unregistering shuts the server down.

use crate::ids::ServerId;
use crate::server::Server;
use std::collections::HashMap;
use std::sync::RwLock;

/// Central registry for all active servers.
#[derive(Default)]
pub struct ServerRegistry {
    servers: RwLock<HashMap<ServerId, Server>>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a server. A previous server with the same id is replaced
    /// and returned; the caller decides whether to shut it down.
    pub fn register(&self, server: Server) -> Option<Server> {
        let id = server.id().clone();
        tracing::debug!(server_id = %id, "Registering server");
        self.servers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, server)
    }

    pub fn get(&self, id: &ServerId) -> Option<Server> {
        self.servers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    pub fn server_ids(&self) -> Vec<ServerId> {
        let mut ids: Vec<ServerId> = self
            .servers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.servers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove a server, shut it down, and announce its deletion to its extensions
    pub async fn unregister(&self, id: &ServerId) -> Option<Server> {
        let server = self
            .servers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)?;
        server.shutdown().await;
        Some(server)
    }

    /// Shut down every registered server and clear the registry
    pub async fn shutdown_all(&self) {
        let servers: Vec<Server> = self
            .servers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, server)| server)
            .collect();
        for server in servers {
            server.shutdown().await;
        }
    }
}
