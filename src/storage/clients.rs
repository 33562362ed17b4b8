//! Client registry: per-connected-client bookkeeping of what it has open
//! and locked, used to drive the disconnect cascade (spec §4.6).

use super::table::ShardedTable;
use super::ClientId;

/// Shard count for the client registry. Unlike the file table (sized from
/// `max_locks`), the registry's concurrency need scales with connection
/// churn rather than file count, so a small fixed fan-out is enough.
const CLIENT_SHARDS: usize = 16;

#[derive(Debug, Default)]
pub struct ClientState {
    opened: Vec<String>,
    locked: Vec<String>,
}

impl ClientState {
    pub fn opened(&self) -> &[String] {
        &self.opened
    }

    pub fn locked(&self) -> &[String] {
        &self.locked
    }

    pub fn add_opened(&mut self, path: &str) {
        if !self.opened.iter().any(|p| p == path) {
            self.opened.push(path.to_string());
        }
    }

    pub fn remove_opened(&mut self, path: &str) {
        self.opened.retain(|p| p != path);
    }

    pub fn add_locked(&mut self, path: &str) {
        if !self.locked.iter().any(|p| p == path) {
            self.locked.push(path.to_string());
        }
    }

    pub fn remove_locked(&mut self, path: &str) {
        self.locked.retain(|p| p != path);
    }

    pub fn is_empty(&self) -> bool {
        self.opened.is_empty() && self.locked.is_empty()
    }
}

pub struct ClientRegistry {
    table: ShardedTable<ClientId, ClientState>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self { table: ShardedTable::new(CLIENT_SHARDS) }
    }

    pub fn register(&self, client: ClientId) {
        let guard = self.table.lock(&client);
        guard.insert(client, ClientState::default());
    }

    /// Removes the client entry. Per spec's invariant, both lists must be
    /// empty by the time the disconnect cascade calls this.
    pub fn unregister(&self, client: ClientId) {
        let guard = self.table.lock(&client);
        guard.remove(&client);
    }

    pub fn with_mut<R>(&self, client: ClientId, f: impl FnOnce(&mut ClientState) -> R) -> Option<R> {
        let guard = self.table.lock(&client);
        guard.with_mut(&client, f)
    }

    pub fn with<R>(&self, client: ClientId, f: impl FnOnce(&ClientState) -> R) -> Option<R> {
        let guard = self.table.lock(&client);
        guard.with(&client, f)
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}
