//! The nine request handlers, each implementing one request code's exact
//! response-code contract (spec §4.3).
//!
//! Every handler follows the same lock order: storage aggregate mutex,
//! then at most one file-shard mutex at a time, then (only for
//! bookkeeping at the very end) a client-registry shard mutex. None of
//! them recurse into each other; lock handoff and eviction are plain
//! function calls against an already-held shard guard.

use crate::wire::{EvictedFile, Outcome, Request, RequestCode, Response, ResponseCode};

use super::entry::FileEntry;
use super::handoff::{self, HandoffResult};
use super::{ClientId, EvictionReason, StorageEngine};

/// A reply owed to some *other* client than the one whose request is being
/// handled right now — produced when a lock handoff grants a suspended
/// waiter its lock (`Response::Code(Ok)`), or when removing a file denies
/// every waiter still queued on it (`Response::Code(OperationNotPermitted)`).
/// The caller (the net layer) is responsible for writing `response` to
/// `client`'s socket and re-arming its fd.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingReply {
    pub client: ClientId,
    pub response: Response,
}

/// A handler's result: the reply (or suspension) for the calling client,
/// plus any lock handoffs to notify other, previously-suspended clients
/// about.
pub struct Handled {
    pub outcome: Outcome,
    pub notifications: Vec<PendingReply>,
}

impl Handled {
    fn reply(code: ResponseCode) -> Self {
        Self { outcome: Outcome::Reply(Response::Code(code)), notifications: Vec::new() }
    }

    fn reply_with(response: Response) -> Self {
        Self { outcome: Outcome::Reply(response), notifications: Vec::new() }
    }

    fn suspended() -> Self {
        Self { outcome: Outcome::Suspended, notifications: Vec::new() }
    }
}

/// Dispatches one parsed, validated request to the storage engine.
pub fn dispatch(engine: &StorageEngine, client: ClientId, request: Request) -> Handled {
    match request.code {
        RequestCode::OpenNoFlags | RequestCode::OpenCreate | RequestCode::OpenLock | RequestCode::OpenCreateLock => {
            handle_open(engine, client, &request)
        }
        RequestCode::Write => handle_write(engine, client, &request),
        RequestCode::Append => handle_append(engine, client, &request),
        RequestCode::Read => handle_read(engine, client, &request),
        RequestCode::ReadN => handle_read_n(engine, client, &request),
        RequestCode::Lock => handle_lock(engine, client, &request),
        RequestCode::Unlock => handle_unlock(engine, client, &request),
        RequestCode::Remove => handle_remove(engine, client, &request),
        RequestCode::Close => handle_close(engine, client, &request),
    }
}

fn path_of(request: &Request) -> &str {
    request.path.as_deref().expect("path-bearing request code")
}

fn handle_open(engine: &StorageEngine, client: ClientId, request: &Request) -> Handled {
    let code = request.code;
    let path = path_of(request);
    let wants_create = code.wants_create();
    let wants_lock = code.wants_lock();

    let guard = engine.files().lock(&path.to_string());

    if guard.contains(&path.to_string()) {
        if wants_create {
            return Handled::reply(ResponseCode::FileAlreadyExists);
        }

        let already_open = guard.with(&path.to_string(), |e| e.is_opener(client)).unwrap_or(false);
        if already_open {
            return Handled::reply(ResponseCode::FileAlreadyOpen);
        }

        if wants_lock {
            let locked_by_other = guard
                .with(&path.to_string(), |e| e.is_locked_by_other(client))
                .unwrap_or(false);
            if locked_by_other {
                guard.with_mut(&path.to_string(), |e| {
                    e.add_opener(client);
                    e.enqueue_waiter(client);
                });
                engine.clients().with_mut(client, |s| s.add_opened(path));
                return Handled::suspended();
            }
        }

        guard.with_mut(&path.to_string(), |e| {
            e.add_opener(client);
            if wants_lock {
                e.grant_lock(client);
            }
        });
        engine.clients().with_mut(client, |s| s.add_opened(path));
        if wants_lock {
            engine.clients().with_mut(client, |s| s.add_locked(path));
        }
        return Handled::reply(ResponseCode::Ok);
    }

    if !wants_create {
        return Handled::reply(ResponseCode::FileNotExists);
    }

    drop(guard);

    let mut aggregate = engine.lock_aggregate();
    if let Err(()) = engine.evict_until(&mut aggregate, 0, path, EvictionReason::Create) {
        return Handled::reply(ResponseCode::CouldNotEvict);
    }
    let sequence = engine.next_sequence();
    let guard = engine.files().lock(&path.to_string());
    let mut entry = FileEntry::new(path.to_string(), Vec::new(), sequence);
    entry.add_opener(client);
    if wants_lock {
        entry.grant_lock(client);
        entry.grant_write_authorization(client);
    }
    guard.insert(path.to_string(), entry);
    engine.register_new(&mut aggregate, path, 0);
    drop(aggregate);

    engine.clients().with_mut(client, |s| s.add_opened(path));
    if wants_lock {
        engine.clients().with_mut(client, |s| s.add_locked(path));
    }
    Handled::reply(ResponseCode::Ok)
}

fn handle_read(engine: &StorageEngine, client: ClientId, request: &Request) -> Handled {
    let path = path_of(request);
    let guard = engine.files().lock(&path.to_string());
    if !guard.contains(&path.to_string()) {
        return Handled::reply(ResponseCode::FileNotExists);
    }
    let is_opener = guard.with(&path.to_string(), |e| e.is_opener(client)).unwrap_or(false);
    if !is_opener {
        return Handled::reply(ResponseCode::OperationNotPermitted);
    }
    let payload = guard
        .with_mut(&path.to_string(), |e| {
            e.touch();
            e.clone_payload()
        })
        .unwrap_or_default();
    Handled::reply_with(Response::Content(payload))
}

/// `n <= 0` selects every eligible file; `n > 0` selects the first `n`
/// eligible files by creation order. A file is eligible only if its
/// lock-holder is either none or the requesting client (spec §4.3
/// read-N) — files another client holds locked are skipped and do not
/// count against the `n` budget. Unlike `read`, this does not require the
/// caller to have opened each file — it is a bulk snapshot operation.
fn handle_read_n(engine: &StorageEngine, client: ClientId, request: &Request) -> Handled {
    let n = request.n.unwrap_or(0);
    let limit = if n <= 0 { usize::MAX } else { n as usize };

    let paths: Vec<String> = {
        let aggregate = engine.lock_aggregate();
        aggregate.order.iter().cloned().collect()
    };

    let mut selection = Vec::new();
    for path in paths {
        if selection.len() >= limit {
            break;
        }
        let guard = engine.files().lock(&path);
        let eligible = guard.with(&path, |e| !e.is_locked_by_other(client)).unwrap_or(false);
        if !eligible {
            continue;
        }
        if let Some(payload) = guard.with_mut(&path, |e| {
            e.touch();
            e.clone_payload()
        }) {
            selection.push((path, payload));
        }
    }
    Handled::reply_with(Response::Selection(selection))
}

fn handle_write(engine: &StorageEngine, client: ClientId, request: &Request) -> Handled {
    mutate_payload(engine, client, request, Mutation::Replace)
}

fn handle_append(engine: &StorageEngine, client: ClientId, request: &Request) -> Handled {
    mutate_payload(engine, client, request, Mutation::Append)
}

enum Mutation {
    Replace,
    Append,
}

/// `write`'s gate: only the client holding write authorization (granted at
/// create+lock, carried across a lock handoff, cleared on first write or
/// by close/unlock) may perform it — lock ownership alone is not enough.
fn may_write(entry: &FileEntry, client: ClientId) -> bool {
    entry.is_write_authorized(client)
}

/// `append`'s gate: caller must be an opener, and if the file is locked
/// the lock must be caller's (the safer superset of the two incompatible
/// source sketches — see DESIGN.md Open Question).
fn may_append(entry: &FileEntry, client: ClientId) -> bool {
    entry.is_opener(client) && (!entry.is_locked() || entry.lock_holder() == Some(client))
}

fn mutate_payload(engine: &StorageEngine, client: ClientId, request: &Request, mutation: Mutation) -> Handled {
    let path = path_of(request);
    let content = request.content.as_deref().unwrap_or(&[]);

    let guard = engine.files().lock(&path.to_string());
    if !guard.contains(&path.to_string()) {
        return Handled::reply(ResponseCode::FileNotExists);
    }
    let permitted = guard
        .with(&path.to_string(), |e| match mutation {
            Mutation::Replace => may_write(e, client),
            Mutation::Append => may_append(e, client),
        })
        .unwrap_or(false);
    if !permitted {
        return Handled::reply(ResponseCode::OperationNotPermitted);
    }

    let old_size = guard.with(&path.to_string(), |e| e.len()).unwrap_or(0);
    let new_size = match mutation {
        Mutation::Replace => content.len(),
        Mutation::Append => old_size + content.len(),
    };
    let growth = new_size.saturating_sub(old_size);
    drop(guard);

    let mut aggregate = engine.lock_aggregate();
    let evicted = match engine.evict_until(&mut aggregate, growth, path, EvictionReason::Mutate) {
        Ok(evicted) => evicted,
        Err(()) => return Handled::reply(ResponseCode::CouldNotEvict),
    };

    let guard = engine.files().lock(&path.to_string());
    let Some(applied_old_size) = guard.with(&path.to_string(), |e| e.len()) else {
        // Evicted out from under us while the aggregate lock was briefly
        // released; surface as a fresh miss rather than silently no-op.
        return Handled::reply(ResponseCode::FileNotExists);
    };
    guard.with_mut(&path.to_string(), |e| match mutation {
        Mutation::Replace => e.replace_payload(content.to_vec(), client),
        Mutation::Append => e.append_payload(content),
    });
    let applied_new_size = guard.with(&path.to_string(), |e| e.len()).unwrap_or(applied_old_size);
    aggregate.record_resize(applied_old_size, applied_new_size);
    drop(aggregate);
    drop(guard);

    engine.rescale_use_counts_if_needed();

    let evicted_files: Vec<EvictedFile> = evicted;
    Handled::reply_with(Response::Evicted(evicted_files))
}

fn handle_lock(engine: &StorageEngine, client: ClientId, request: &Request) -> Handled {
    let path = path_of(request);
    let guard = engine.files().lock(&path.to_string());
    if !guard.contains(&path.to_string()) {
        return Handled::reply(ResponseCode::FileNotExists);
    }
    let is_opener = guard.with(&path.to_string(), |e| e.is_opener(client)).unwrap_or(false);
    if !is_opener {
        return Handled::reply(ResponseCode::OperationNotPermitted);
    }

    let holder = guard.with(&path.to_string(), |e| e.lock_holder()).unwrap();
    if holder == Some(client) {
        return Handled::reply(ResponseCode::FileAlreadyLocked);
    }
    if holder.is_some() {
        guard.with_mut(&path.to_string(), |e| e.enqueue_waiter(client));
        return Handled::suspended();
    }

    guard.with_mut(&path.to_string(), |e| e.grant_lock(client));
    engine.clients().with_mut(client, |s| s.add_locked(path));
    Handled::reply(ResponseCode::Ok)
}

fn handle_unlock(engine: &StorageEngine, client: ClientId, request: &Request) -> Handled {
    let path = path_of(request);
    let guard = engine.files().lock(&path.to_string());
    if !guard.contains(&path.to_string()) {
        return Handled::reply(ResponseCode::FileNotExists);
    }
    let is_holder = guard.with(&path.to_string(), |e| e.lock_holder() == Some(client)).unwrap_or(false);
    if !is_holder {
        return Handled::reply(ResponseCode::OperationNotPermitted);
    }

    let handoff = guard.with_mut(&path.to_string(), |e| handoff::release_and_handoff(e)).unwrap();
    guard.with_mut(&path.to_string(), |e| e.clear_write_authorization_if(client));
    engine.clients().with_mut(client, |s| s.remove_locked(path));

    let mut notifications = Vec::new();
    if let HandoffResult::Granted(next) = handoff {
        engine.clients().with_mut(next, |s| s.add_locked(path));
        notifications.push(PendingReply { client: next, response: Response::Code(ResponseCode::Ok) });
    }

    Handled { outcome: Outcome::Reply(Response::Code(ResponseCode::Ok)), notifications }
}

fn handle_close(engine: &StorageEngine, client: ClientId, request: &Request) -> Handled {
    let path = path_of(request);
    let guard = engine.files().lock(&path.to_string());
    if !guard.contains(&path.to_string()) {
        return Handled::reply(ResponseCode::FileNotExists);
    }
    let was_opener = guard.with(&path.to_string(), |e| e.is_opener(client)).unwrap_or(false);
    if !was_opener {
        return Handled::reply(ResponseCode::OperationNotPermitted);
    }

    let held_lock = guard.with(&path.to_string(), |e| e.lock_holder() == Some(client)).unwrap_or(false);
    let mut notifications = Vec::new();
    guard.with_mut(&path.to_string(), |e| e.remove_opener(client));
    if held_lock {
        let handoff = guard.with_mut(&path.to_string(), |e| handoff::release_and_handoff(e)).unwrap();
        guard.with_mut(&path.to_string(), |e| e.clear_write_authorization_if(client));
        if let HandoffResult::Granted(next) = handoff {
            engine.clients().with_mut(next, |s| s.add_locked(path));
            notifications.push(PendingReply { client: next, response: Response::Code(ResponseCode::Ok) });
        }
    } else {
        guard.with_mut(&path.to_string(), |e| e.remove_waiter(client));
    }

    engine.clients().with_mut(client, |s| {
        s.remove_opened(path);
        s.remove_locked(path);
    });

    Handled { outcome: Outcome::Reply(Response::Code(ResponseCode::Ok)), notifications }
}

fn handle_remove(engine: &StorageEngine, client: ClientId, request: &Request) -> Handled {
    let path = path_of(request);
    let mut aggregate = engine.lock_aggregate();
    let guard = engine.files().lock(&path.to_string());
    if !guard.contains(&path.to_string()) {
        return Handled::reply(ResponseCode::FileNotExists);
    }
    let holds_lock = guard.with(&path.to_string(), |e| e.lock_holder() == Some(client)).unwrap_or(false);
    if !holds_lock {
        return Handled::reply(ResponseCode::OperationNotPermitted);
    }

    let removed = guard.remove(&path.to_string()).unwrap();
    engine.forget_order(&mut aggregate, path);
    aggregate.record_remove(removed.len());
    drop(aggregate);
    drop(guard);

    // The file is gone: every waiter still queued on its lock is denied
    // rather than left to hang forever (spec §4.3 remove).
    let notifications = removed
        .waiters()
        .iter()
        .map(|&waiter| PendingReply {
            client: waiter,
            response: Response::Code(ResponseCode::OperationNotPermitted),
        })
        .collect();
    for &waiter in removed.waiters() {
        engine.clients().with_mut(waiter, |s| s.remove_opened(path));
    }
    engine.clients().with_mut(client, |s| {
        s.remove_opened(path);
        s.remove_locked(path);
    });

    Handled { outcome: Outcome::Reply(Response::Code(ResponseCode::Ok)), notifications }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::wire::RequestCode;

    fn open_req(code: RequestCode, path: &str) -> Request {
        Request { code, path: Some(path.to_string()), content: None, n: None }
    }

    fn write_req(path: &str, content: &[u8]) -> Request {
        Request { code: RequestCode::Write, path: Some(path.to_string()), content: Some(content.to_vec()), n: None }
    }

    fn read_n_req(n: i32) -> Request {
        Request { code: RequestCode::ReadN, path: None, content: None, n: Some(n) }
    }

    #[test]
    fn open_create_lock_then_write_then_read() {
        let engine = StorageEngine::new(&Config::default());
        let client = ClientId(1);

        let handled = dispatch(&engine, client, open_req(RequestCode::OpenCreateLock, "/a"));
        assert!(matches!(handled.outcome, Outcome::Reply(Response::Code(ResponseCode::Ok))));

        let handled = dispatch(&engine, client, write_req("/a", b"hello"));
        assert!(matches!(handled.outcome, Outcome::Reply(Response::Evicted(ref v)) if v.is_empty()));

        let handled = dispatch(&engine, client, open_req(RequestCode::Read, "/a"));
        match handled.outcome {
            Outcome::Reply(Response::Content(bytes)) => assert_eq!(bytes, b"hello"),
            _ => panic!("expected content reply"),
        }
    }

    #[test]
    fn open_create_rejects_duplicate_create() {
        let engine = StorageEngine::new(&Config::default());
        let client = ClientId(1);
        dispatch(&engine, client, open_req(RequestCode::OpenCreate, "/a"));
        let handled = dispatch(&engine, ClientId(2), open_req(RequestCode::OpenCreate, "/a"));
        assert!(matches!(handled.outcome, Outcome::Reply(Response::Code(ResponseCode::FileAlreadyExists))));
    }

    /// A create-flavored open on a path the caller already has open is
    /// still `FILE_ALREADY_EXISTS`, not `FILE_ALREADY_OPEN` — spec §4.3
    /// gates "already open" behind "non-create".
    #[test]
    fn open_create_on_already_open_path_is_still_already_exists() {
        let engine = StorageEngine::new(&Config::default());
        let client = ClientId(1);
        dispatch(&engine, client, open_req(RequestCode::OpenCreate, "/a"));
        let handled = dispatch(&engine, client, open_req(RequestCode::OpenCreate, "/a"));
        assert!(matches!(handled.outcome, Outcome::Reply(Response::Code(ResponseCode::FileAlreadyExists))));
    }

    #[test]
    fn second_locker_suspends_and_first_unlock_hands_off() {
        let engine = StorageEngine::new(&Config::default());
        let a = ClientId(1);
        let b = ClientId(2);
        dispatch(&engine, a, open_req(RequestCode::OpenCreateLock, "/a"));
        dispatch(&engine, b, open_req(RequestCode::OpenNoFlags, "/a"));

        let handled = dispatch(&engine, b, open_req(RequestCode::Lock, "/a"));
        assert!(matches!(handled.outcome, Outcome::Suspended));

        let handled = dispatch(&engine, a, open_req(RequestCode::Unlock, "/a"));
        assert_eq!(
            handled.notifications,
            vec![PendingReply { client: b, response: Response::Code(ResponseCode::Ok) }]
        );
    }

    #[test]
    fn write_without_lock_or_authorization_is_forbidden() {
        let engine = StorageEngine::new(&Config::default());
        let owner = ClientId(1);
        let intruder = ClientId(2);
        dispatch(&engine, owner, open_req(RequestCode::OpenCreateLock, "/a"));
        dispatch(&engine, intruder, open_req(RequestCode::OpenNoFlags, "/a"));
        let handled = dispatch(&engine, intruder, write_req("/a", b"x"));
        assert!(matches!(handled.outcome, Outcome::Reply(Response::Code(ResponseCode::OperationNotPermitted))));
    }

    /// A file locked by another client is skipped, and does not consume the
    /// `n` budget — with `n=1`, the locked `/a` is passed over and `/b`
    /// still fills the single slot (spec §4.3 read-N eligibility).
    #[test]
    fn read_n_skips_files_locked_by_other_clients() {
        let engine = StorageEngine::new(&Config::default());
        let locker = ClientId(1);
        let reader = ClientId(2);
        dispatch(&engine, locker, open_req(RequestCode::OpenCreateLock, "/a"));
        dispatch(&engine, locker, write_req("/a", b"secret"));
        dispatch(&engine, reader, open_req(RequestCode::OpenCreate, "/b"));
        dispatch(&engine, reader, write_req("/b", b"public"));

        let handled = dispatch(&engine, reader, read_n_req(1));
        match handled.outcome {
            Outcome::Reply(Response::Selection(selection)) => {
                assert_eq!(selection.len(), 1);
                assert_eq!(selection[0].0, "/b");
            }
            _ => panic!("expected selection reply"),
        }
    }

    /// `n == 0` selects every eligible file, not an empty selection.
    #[test]
    fn read_n_zero_returns_all_eligible_files() {
        let engine = StorageEngine::new(&Config::default());
        let client = ClientId(1);
        dispatch(&engine, client, open_req(RequestCode::OpenCreate, "/a"));
        dispatch(&engine, client, write_req("/a", b"one"));
        dispatch(&engine, client, open_req(RequestCode::OpenCreate, "/b"));
        dispatch(&engine, client, write_req("/b", b"two"));

        let handled = dispatch(&engine, client, read_n_req(0));
        match handled.outcome {
            Outcome::Reply(Response::Selection(selection)) => assert_eq!(selection.len(), 2),
            _ => panic!("expected selection reply"),
        }
    }

    #[test]
    fn remove_locked_by_other_client_is_forbidden() {
        let engine = StorageEngine::new(&Config::default());
        let owner = ClientId(1);
        let intruder = ClientId(2);
        dispatch(&engine, owner, open_req(RequestCode::OpenCreateLock, "/a"));
        let handled = dispatch(&engine, intruder, open_req(RequestCode::Remove, "/a"));
        assert!(matches!(handled.outcome, Outcome::Reply(Response::Code(ResponseCode::OperationNotPermitted))));
    }
}
