//! Per-file state: the thing a [`super::table::ShardedTable`] shard stores.

use std::collections::VecDeque;
use std::time::Instant;

use crate::storage::ClientId;

/// A single stored file and everything the request handlers need to know
/// about its current openers, lock, and usage.
#[derive(Debug)]
pub struct FileEntry {
    pub path: String,
    payload: Vec<u8>,
    lock_holder: Option<ClientId>,
    /// Client allowed to perform the file's first `write`, granted at
    /// create+lock. Cleared on first successful write, on close by the
    /// authorized client, or on unlock by the authorized client (see
    /// DESIGN.md Open Question: write-authorization reset rule).
    write_authorized: Option<ClientId>,
    openers: Vec<ClientId>,
    waiters: VecDeque<ClientId>,
    created_at: Instant,
    last_use: Instant,
    use_count: u64,
    /// Monotonic creation order, used by FIFO eviction and read-N instead
    /// of re-deriving it from the aggregate's insertion-order list on every
    /// comparison.
    pub sequence: u64,
}

impl FileEntry {
    pub fn new(path: String, payload: Vec<u8>, sequence: u64) -> Self {
        let now = Instant::now();
        Self {
            path,
            payload,
            lock_holder: None,
            write_authorized: None,
            openers: Vec::new(),
            waiters: VecDeque::new(),
            created_at: now,
            last_use: now,
            use_count: 0,
            sequence,
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn clone_payload(&self) -> Vec<u8> {
        self.payload.clone()
    }

    pub fn lock_holder(&self) -> Option<ClientId> {
        self.lock_holder
    }

    pub fn is_locked(&self) -> bool {
        self.lock_holder.is_some()
    }

    pub fn is_locked_by_other(&self, client: ClientId) -> bool {
        matches!(self.lock_holder, Some(holder) if holder != client)
    }

    pub fn is_opener(&self, client: ClientId) -> bool {
        self.openers.contains(&client)
    }

    pub fn add_opener(&mut self, client: ClientId) {
        if !self.openers.contains(&client) {
            self.openers.push(client);
        }
    }

    pub fn remove_opener(&mut self, client: ClientId) {
        self.openers.retain(|&c| c != client);
    }

    pub fn openers(&self) -> &[ClientId] {
        &self.openers
    }

    pub fn grant_lock(&mut self, client: ClientId) {
        self.lock_holder = Some(client);
    }

    pub fn clear_lock(&mut self) {
        self.lock_holder = None;
    }

    pub fn enqueue_waiter(&mut self, client: ClientId) {
        self.waiters.push_back(client);
    }

    pub fn pop_waiter(&mut self) -> Option<ClientId> {
        self.waiters.pop_front()
    }

    pub fn remove_waiter(&mut self, client: ClientId) {
        self.waiters.retain(|&c| c != client);
    }

    pub fn waiters(&self) -> &VecDeque<ClientId> {
        &self.waiters
    }

    pub fn grant_write_authorization(&mut self, client: ClientId) {
        self.write_authorized = Some(client);
    }

    pub fn is_write_authorized(&self, client: ClientId) -> bool {
        self.write_authorized == Some(client)
    }

    pub fn clear_write_authorization_if(&mut self, client: ClientId) {
        if self.write_authorized == Some(client) {
            self.write_authorized = None;
        }
    }

    /// Replaces the payload wholesale (`write`), clearing write
    /// authorization and bumping usage stats.
    pub fn replace_payload(&mut self, payload: Vec<u8>, client: ClientId) {
        self.payload = payload;
        self.clear_write_authorization_if(client);
        self.touch();
    }

    /// Appends to the payload (`append`), bumping usage stats.
    pub fn append_payload(&mut self, extra: &[u8]) {
        self.payload.extend_from_slice(extra);
        self.touch();
    }

    pub fn touch(&mut self) {
        self.last_use = Instant::now();
        self.use_count = self.use_count.saturating_add(1);
    }

    pub fn use_count(&self) -> u64 {
        self.use_count
    }

    pub fn last_use(&self) -> Instant {
        self.last_use
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Halves every counter a scaling pass touches, preserving relative
    /// order while keeping `use_count` away from overflow (spec §4.5).
    pub fn shrink_use_count(&mut self) {
        self.use_count /= 2;
    }
}
