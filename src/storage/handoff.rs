//! Lock handoff: when a lock holder releases a file (`unlock`, `close`, or
//! disconnect), the next FIFO waiter — if any — is granted the lock
//! in-place rather than being woken to race for it (spec §4.4).

use super::entry::FileEntry;
use super::ClientId;

/// Outcome of releasing a file's lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffResult {
    /// No one was waiting; the file is now unlocked.
    NoWaiters,
    /// `ClientId` was popped off the waiter queue and granted the lock and
    /// write authorization. The caller is responsible for notifying that
    /// client's suspended connection that it may proceed.
    Granted(ClientId),
}

/// Releases `entry`'s lock and hands it to the next waiter, if any. Must
/// be called with the entry's shard lock held.
pub fn release_and_handoff(entry: &mut FileEntry) -> HandoffResult {
    entry.clear_lock();
    match entry.pop_waiter() {
        Some(next) => {
            entry.grant_lock(next);
            entry.grant_write_authorization(next);
            HandoffResult::Granted(next)
        }
        None => HandoffResult::NoWaiters,
    }
}
