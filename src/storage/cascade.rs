//! Disconnect cascade: when a client's connection drops, every file it
//! had open is closed and every lock it held is released, each release
//! handed off to the next FIFO waiter (spec §4.6).
//!
//! Driven by an explicit work queue of paths rather than a recursive
//! per-file helper, so a client that had thousands of files open cannot
//! blow the stack of the thread running the cascade.

use std::collections::{HashSet, VecDeque};

use crate::wire::{Response, ResponseCode};

use super::handlers::PendingReply;
use super::handoff::{self, HandoffResult};
use super::{ClientId, StorageEngine};

/// Tears down everything `client` held, returning the handoffs its
/// releases produced. No-op if `client` was never registered (already
/// cleaned up, or never opened anything).
pub fn disconnect(engine: &StorageEngine, client: ClientId) -> Vec<PendingReply> {
    let mut notifications = Vec::new();

    let Some((opened, locked)) = engine
        .clients()
        .with(client, |state| (state.opened().to_vec(), state.locked().to_vec()))
    else {
        return notifications;
    };

    let mut pending: VecDeque<String> = opened
        .into_iter()
        .chain(locked)
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();

    while let Some(path) = pending.pop_front() {
        let guard = engine.files().lock(&path);
        guard.with_mut(&path, |entry| {
            entry.remove_opener(client);
            if entry.lock_holder() == Some(client) {
                if let HandoffResult::Granted(next) = handoff::release_and_handoff(entry) {
                    notifications.push(PendingReply {
                        client: next,
                        response: Response::Code(ResponseCode::Ok),
                    });
                    engine.clients().with_mut(next, |s| s.add_locked(&path));
                }
            } else {
                entry.remove_waiter(client);
            }
        });
    }

    engine.clients().unregister(client);
    notifications
}
