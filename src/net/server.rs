//! Master/worker event loop (spec §4.7, §4.8).
//!
//! One master thread owns the listener and a `libc::poll` watch set over
//! (listen fd, signal self-pipe, worker-completion self-pipe, idle client
//! fds). On a readable client it drops that fd from the watch set and
//! hands the connection to the thread pool; a worker reads exactly one
//! request, dispatches it to the storage engine, writes the response, and
//! reports back over the worker-completion pipe so the master can re-arm
//! the fd (or close it on disconnect).
//!
//! The wire-level spec imagines the worker writing a raw fd back to the
//! master down that pipe. This implementation writes a signed client id
//! instead (positive: re-arm, negative: disconnect) and looks the
//! corresponding fd up in the connection table — Rust's ownership model
//! makes handing a raw fd across threads without a type to answer for its
//! lifetime its own hazard, and the client id is already the thing every
//! other subsystem keys on. See DESIGN.md.

use std::collections::{HashMap, VecDeque};
use std::io::{self, ErrorKind, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::Config;
use crate::error::ServerError;
use crate::logging::{request_code_name, LogRecord, RequestLogger};
use crate::net::pool::{self, SubmitOutcome, ThreadPool};
use crate::net::signal::{ShutdownKind, SignalChannel};
use crate::storage::cascade;
use crate::storage::handlers::{self, PendingReply};
use crate::storage::{ClientId, ClientIdAllocator, StorageEngine};
use crate::wire::codec::{self, ProtocolError};
use crate::wire::{Outcome, Response, ResponseCode};

/// State shared between the master thread and every worker task. Cheap to
/// clone (it's an `Arc`); each submitted task captures its own clone.
struct Shared {
    engine: StorageEngine,
    logger: RequestLogger,
    connections: Mutex<HashMap<u64, UnixStream>>,
    notify_write: Mutex<UnixStream>,
    max_bytes: usize,
}

/// The master/worker server: bind with [`Server::bind`], then run the
/// event loop to completion with [`Server::run`].
pub struct Server {
    listener: UnixListener,
    socket_path: PathBuf,
    shared: Arc<Shared>,
    pool: ThreadPool,
    signals: SignalChannel,
    notify_read: UnixStream,
    notify_leftover: Vec<u8>,
    ids: ClientIdAllocator,
}

impl Server {
    pub fn bind(config: &Config) -> Result<Self, ServerError> {
        let _ = std::fs::remove_file(&config.socket_path);
        let listener = UnixListener::bind(&config.socket_path).map_err(|source| ServerError::Bind {
            path: config.socket_path.clone(),
            source,
        })?;
        listener.set_nonblocking(true)?;

        let signals = SignalChannel::install().map_err(ServerError::Signal)?;

        let (notify_write, notify_read) = UnixStream::pair()?;
        notify_read.set_nonblocking(true)?;

        let logger = RequestLogger::open(&config.log_file_path).map_err(|e| ServerError::Bind {
            path: config.log_file_path.clone(),
            source: io::Error::new(ErrorKind::Other, e),
        })?;

        let shared = Arc::new(Shared {
            engine: StorageEngine::new(config),
            logger,
            connections: Mutex::new(HashMap::with_capacity(config.expected_clients)),
            notify_write: Mutex::new(notify_write),
            max_bytes: config.max_bytes,
        });

        let pool = ThreadPool::new(config.n_workers, config.dim_workers_queue);

        Ok(Self {
            listener,
            socket_path: PathBuf::from(&config.socket_path),
            shared,
            pool,
            signals,
            notify_read,
            notify_leftover: Vec::new(),
            ids: ClientIdAllocator::new(),
        })
    }

    pub fn stats(&self) -> crate::storage::Stats {
        self.shared.engine.stats()
    }

    pub fn resident_paths(&self) -> Vec<String> {
        self.shared.engine.resident_paths()
    }

    /// Runs the master loop until a shutdown signal fully drains the
    /// server. Returns once every connection is closed and the pool has
    /// joined.
    pub fn run(mut self) -> Result<(), ServerError> {
        let mut idle_fds: Vec<RawFd> = Vec::new();
        let mut accepting = true;
        let mut shutdown_now = false;
        let mut connected_count: usize = 0;

        loop {
            if shutdown_now {
                break;
            }

            let mut pollfds: Vec<libc::pollfd> = Vec::new();
            if accepting {
                pollfds.push(make_pollfd(self.listener.as_raw_fd()));
            }
            pollfds.push(make_pollfd(self.signals.fd()));
            pollfds.push(make_pollfd(self.notify_read.as_raw_fd()));
            let base = pollfds.len();
            for &fd in &idle_fds {
                pollfds.push(make_pollfd(fd));
            }

            let n = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, -1) };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == ErrorKind::Interrupted {
                    continue;
                }
                return Err(ServerError::Io(err));
            }

            let mut idx = 0;
            if accepting {
                if pollfds[idx].revents & libc::POLLIN != 0 {
                    connected_count += self.accept_ready(&mut idle_fds)?;
                }
                idx += 1;
            }

            if pollfds[idx].revents & libc::POLLIN != 0 {
                if let Some(kind) = self.read_signal()? {
                    match kind {
                        ShutdownKind::Graceful => {
                            log::info!("graceful shutdown requested, draining {connected_count} clients");
                            accepting = false;
                            if connected_count == 0 {
                                shutdown_now = true;
                            }
                        }
                        ShutdownKind::Immediate => {
                            log::info!("immediate shutdown requested");
                            shutdown_now = true;
                        }
                    }
                }
            }
            idx += 1;

            if pollfds[idx].revents & libc::POLLIN != 0 {
                for event in self.drain_notify()? {
                    match event {
                        NotifyEvent::Rearm(client) => {
                            if let Some(fd) = self.fd_for(client) {
                                idle_fds.push(fd);
                            }
                        }
                        NotifyEvent::Disconnect(client) => {
                            self.close_connection(client);
                            connected_count = connected_count.saturating_sub(1);
                            log::info!("CLOSED_CONNECTION client={}", client.0);
                            if !accepting && connected_count == 0 {
                                shutdown_now = true;
                            }
                        }
                    }
                }
            }

            let mut still_idle = Vec::with_capacity(idle_fds.len());
            for (i, &fd) in idle_fds.iter().enumerate() {
                let revents = pollfds[base + i].revents;
                if revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0 {
                    self.dispatch_ready(fd);
                } else {
                    still_idle.push(fd);
                }
            }
            idle_fds = still_idle;
        }

        self.teardown(shutdown_now);
        Ok(())
    }

    /// Accepts every currently-pending connection (the listener is
    /// non-blocking), registering each with the storage engine's client
    /// registry and the connection table. Returns how many were accepted.
    fn accept_ready(&mut self, idle_fds: &mut Vec<RawFd>) -> Result<usize, ServerError> {
        let mut accepted = 0;
        loop {
            match self.listener.accept() {
                Ok((stream, _addr)) => {
                    stream.set_nonblocking(false).ok();
                    let client = self.ids.allocate();
                    self.shared.engine.clients().register(client);
                    let fd = stream.as_raw_fd();
                    self.shared.connections.lock().insert(client.0, stream);
                    idle_fds.push(fd);
                    accepted += 1;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(ServerError::Io(e)),
            }
        }
        Ok(accepted)
    }

    fn read_signal(&mut self) -> Result<Option<ShutdownKind>, ServerError> {
        let mut buf = [0u8; 1];
        match (&self.signals.read).read(&mut buf) {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(crate::net::signal::decode(buf[0]))),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(ServerError::Io(e)),
        }
    }

    fn drain_notify(&mut self) -> Result<Vec<NotifyEvent>, ServerError> {
        let mut chunk = [0u8; 256];
        loop {
            match self.notify_read.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => self.notify_leftover.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(ServerError::Io(e)),
            }
        }

        let mut events = Vec::new();
        while self.notify_leftover.len() >= 8 {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&self.notify_leftover[..8]);
            self.notify_leftover.drain(..8);
            let value = i64::from_ne_bytes(raw);
            let client = ClientId(value.unsigned_abs());
            events.push(if value >= 0 { NotifyEvent::Rearm(client) } else { NotifyEvent::Disconnect(client) });
        }
        Ok(events)
    }

    fn fd_for(&self, client: ClientId) -> Option<RawFd> {
        self.shared.connections.lock().get(&client.0).map(|s| s.as_raw_fd())
    }

    fn close_connection(&self, client: ClientId) {
        self.shared.connections.lock().remove(&client.0);
    }

    /// A client fd became readable: remove it from the watch set (the
    /// caller already excluded it from `idle_fds`) and hand it to the
    /// pool. A full queue is handled synchronously right here by the
    /// master, per spec §4.7.
    fn dispatch_ready(&mut self, fd: RawFd) {
        let Some(client) = self.client_for_fd(fd) else { return };
        let Some(stream) = self.clone_stream(client) else { return };
        let shared = Arc::clone(&self.shared);

        match self.pool.try_submit(move || serve_one(shared, client, stream)) {
            SubmitOutcome::Accepted => {}
            SubmitOutcome::RejectedFull | SubmitOutcome::Closed => {
                self.handle_backpressure(client);
            }
        }
    }

    fn client_for_fd(&self, fd: RawFd) -> Option<ClientId> {
        self.shared
            .connections
            .lock()
            .iter()
            .find(|(_, s)| s.as_raw_fd() == fd)
            .map(|(&id, _)| ClientId(id))
    }

    fn clone_stream(&self, client: ClientId) -> Option<UnixStream> {
        self.shared.connections.lock().get(&client.0).and_then(|s| s.try_clone().ok())
    }

    /// Pool was full: the master itself reads and discards the pending
    /// request's framing, replies `TEMPORARILY_UNAVAILABLE`, and re-arms
    /// (or, on send failure, cascades the disconnect) — spec §4.7.
    fn handle_backpressure(&mut self, client: ClientId) {
        let Some(mut stream) = self.clone_stream(client) else { return };
        let parsed = codec::read_request(&mut stream, self.shared.max_bytes);
        log_record(
            &self.shared,
            &LogRecord {
                thread_id: pool::current_worker_id(),
                operation: "BACKPRESSURE",
                outcome: ResponseCode::TemporarilyUnavailable.as_log_str(),
                client_id: client,
                file: None,
                bytes_processed: 0,
                curr_files: self.shared.engine.stats().current_files,
                curr_bytes: self.shared.engine.stats().current_bytes,
                curr_clients: self.shared.connections.lock().len(),
            },
        );
        match parsed {
            Ok(_) => {
                if codec::write_code(&mut stream, ResponseCode::TemporarilyUnavailable).is_ok() {
                    notify_event(&self.shared, client, true);
                } else {
                    notify_event(&self.shared, client, false);
                }
            }
            Err(_) => notify_event(&self.shared, client, false),
        }
    }

    fn teardown(self, immediate: bool) {
        let _ = std::fs::remove_file(&self.socket_path);
        if immediate {
            log::warn!("aborting outstanding client connections for immediate shutdown");
        }
        let shared = Arc::clone(&self.shared);
        self.pool.shutdown();
        report_stats(&shared);
    }
}

/// Appends one audit row, downgrading a sink failure to a warning rather
/// than letting it take the connection down (spec §9).
fn log_record(shared: &Arc<Shared>, rec: &LogRecord<'_>) {
    if let Err(e) = shared.logger.record(rec) {
        log::warn!("request logger write failed: {e}");
    }
}

fn report_stats(shared: &Arc<Shared>) {
    let stats = shared.engine.stats();
    println!("peak_file_count={}", stats.peak_files);
    println!("peak_byte_count={}", stats.peak_bytes);
    println!("evictions={}", stats.evictions);
    println!("resident_files={}", shared.engine.resident_paths().join(","));
}

enum NotifyEvent {
    Rearm(ClientId),
    Disconnect(ClientId),
}

fn make_pollfd(fd: RawFd) -> libc::pollfd {
    libc::pollfd { fd, events: libc::POLLIN, revents: 0 }
}

/// Writes one signed client id to the worker-completion pipe: positive to
/// re-arm, negative to signal disconnect.
fn notify_event(shared: &Arc<Shared>, client: ClientId, healthy: bool) {
    let value: i64 = if healthy { client.0 as i64 } else { -(client.0 as i64) };
    let mut writer = shared.notify_write.lock();
    let _ = writer.write_all(&value.to_ne_bytes());
}

/// Drives the disconnect cascade to completion for `client` and delivers
/// every lock handoff / denial it produces, iteratively (a work queue, not
/// recursion, per spec §4.6 point 5) so a long chain of dead clients
/// cannot blow the stack.
fn run_disconnect_cascade(shared: &Arc<Shared>, client: ClientId) {
    shared.connections.lock().remove(&client.0);
    let notifications = cascade::disconnect(&shared.engine, client);
    deliver_notifications(shared, notifications);
    notify_event(shared, client, false);
}

/// Delivers every `PendingReply` to its target client's socket, re-arming
/// it on success or cascading its own disconnect on failure — chained
/// failures are pushed back onto the same queue instead of recursing.
fn deliver_notifications(shared: &Arc<Shared>, initial: Vec<PendingReply>) {
    let mut queue: VecDeque<PendingReply> = initial.into();
    while let Some(notif) = queue.pop_front() {
        let stream = shared.connections.lock().get(&notif.client.0).and_then(|s| s.try_clone().ok());
        let delivered = match stream {
            Some(mut s) => codec::write_response(&mut s, &notif.response).is_ok(),
            None => false,
        };

        let operation = if notif.response == Response::Code(ResponseCode::Ok) {
            "OP_SUSPENDED"
        } else {
            "OP_DENIED"
        };
        log_record(
            shared,
            &LogRecord {
                thread_id: pool::current_worker_id(),
                operation,
                outcome: notif.response.code().as_log_str(),
                client_id: notif.client,
                file: None,
                bytes_processed: 0,
                curr_files: shared.engine.stats().current_files,
                curr_bytes: shared.engine.stats().current_bytes,
                curr_clients: shared.connections.lock().len(),
            },
        );

        if delivered {
            notify_event(shared, notif.client, true);
        } else {
            shared.connections.lock().remove(&notif.client.0);
            let more = cascade::disconnect(&shared.engine, notif.client);
            notify_event(shared, notif.client, false);
            queue.extend(more);
        }
    }
}

/// The body of one worker task: read exactly one request off `stream`,
/// dispatch it, and report the outcome. Runs entirely on a pool thread;
/// never blocks on anything but this one client's socket and the
/// storage engine's own (short-held) locks.
fn serve_one(shared: Arc<Shared>, client: ClientId, mut stream: UnixStream) {
    let parsed = match codec::read_request(&mut stream, shared.max_bytes) {
        Ok(parsed) => parsed,
        Err(_) => {
            run_disconnect_cascade(&shared, client);
            return;
        }
    };

    let request = match parsed {
        Ok(request) => request,
        Err(ProtocolError(code)) => {
            let _ = codec::write_code(&mut stream, code);
            log_record(
                &shared,
                &LogRecord {
                    thread_id: pool::current_worker_id(),
                    operation: "PROTOCOL_ERROR",
                    outcome: code.as_log_str(),
                    client_id: client,
                    file: None,
                    bytes_processed: 0,
                    curr_files: shared.engine.stats().current_files,
                    curr_bytes: shared.engine.stats().current_bytes,
                    curr_clients: shared.connections.lock().len(),
                },
            );
            // Protocol errors close the connection after the code is sent
            // (spec §7): resync on a badly-framed stream is unsafe.
            run_disconnect_cascade(&shared, client);
            return;
        }
    };

    let operation = request_code_name(request.code);
    let path = request.path.clone();
    let handled = handlers::dispatch(&shared.engine, client, request);

    match handled.outcome {
        Outcome::Suspended => {
            log_record(
                &shared,
                &LogRecord {
                    thread_id: pool::current_worker_id(),
                    operation,
                    outcome: "CLIENT_IS_WAITING",
                    client_id: client,
                    file: path.as_deref(),
                    bytes_processed: 0,
                    curr_files: shared.engine.stats().current_files,
                    curr_bytes: shared.engine.stats().current_bytes,
                    curr_clients: shared.connections.lock().len(),
                },
            );
        }
        Outcome::Reply(response) => {
            let bytes_processed = response_bytes(&response);
            let send_result = codec::write_response(&mut stream, &response);
            log_record(
                &shared,
                &LogRecord {
                    thread_id: pool::current_worker_id(),
                    operation,
                    outcome: response.code().as_log_str(),
                    client_id: client,
                    file: path.as_deref(),
                    bytes_processed,
                    curr_files: shared.engine.stats().current_files,
                    curr_bytes: shared.engine.stats().current_bytes,
                    curr_clients: shared.connections.lock().len(),
                },
            );
            if send_result.is_ok() {
                notify_event(&shared, client, true);
            } else {
                shared.connections.lock().remove(&client.0);
                let more = cascade::disconnect(&shared.engine, client);
                notify_event(&shared, client, false);
                deliver_notifications(&shared, more);
                return;
            }
        }
    }

    deliver_notifications(&shared, handled.notifications);
}

fn response_bytes(response: &Response) -> usize {
    match response {
        Response::Code(_) => 0,
        Response::Content(bytes) => bytes.len(),
        Response::Selection(items) => items.iter().map(|(_, c)| c.len()).sum(),
        Response::Evicted(items) => items.iter().map(|e| e.payload.len()).sum(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_bytes_counts_payloads() {
        assert_eq!(response_bytes(&Response::Content(vec![1, 2, 3])), 3);
        assert_eq!(response_bytes(&Response::Code(ResponseCode::Ok)), 0);
    }
}
