//! End-to-end protocol tests: a real [`Server`] listening on a temp Unix
//! socket, driven by plain [`UnixStream`] clients speaking the wire format
//! by hand (there is no client library — the protocol is the contract).

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use nexa_storaged::config::Config;
use nexa_storaged::net::server::Server;

const OPEN_NO_FLAGS: u32 = 1;
const OPEN_CREATE: u32 = 2;
const OPEN_CREATE_LOCK: u32 = 4;
const WRITE: u32 = 5;
const READ: u32 = 7;
const LOCK: u32 = 9;
const UNLOCK: u32 = 10;
const CLOSE: u32 = 12;

const OK: u32 = 0;

fn encode_request(code: u32, path: Option<&str>, content: Option<&[u8]>) -> Vec<u8> {
    let mut buf = code.to_ne_bytes().to_vec();
    if let Some(p) = path {
        let mut bytes = p.as_bytes().to_vec();
        bytes.push(0);
        buf.extend_from_slice(&(bytes.len() as u64).to_ne_bytes());
        buf.extend_from_slice(&bytes);
    }
    if let Some(c) = content {
        buf.extend_from_slice(&(c.len() as u64).to_ne_bytes());
        buf.extend_from_slice(c);
    }
    buf
}

fn read_u32(stream: &mut UnixStream) -> u32 {
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).unwrap();
    u32::from_ne_bytes(buf)
}

fn read_u64(stream: &mut UnixStream) -> u64 {
    let mut buf = [0u8; 8];
    stream.read_exact(&mut buf).unwrap();
    u64::from_ne_bytes(buf)
}

fn read_bytes(stream: &mut UnixStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).unwrap();
    buf
}

/// Reads one `(code, content)` reply where `code == OK` is followed by a
/// single content frame (the shape `read` and `write`/`append` share on
/// success, minus `write`'s count prefix — callers pick the right reader).
fn read_code(stream: &mut UnixStream) -> u32 {
    read_u32(stream)
}

fn read_content_reply(stream: &mut UnixStream) -> (u32, Vec<u8>) {
    let code = read_u32(stream);
    if code != OK {
        return (code, Vec::new());
    }
    let len = read_u64(stream);
    (code, read_bytes(stream, len as usize))
}

/// Reads an `Evicted`-shaped reply: code, then a count, then that many
/// (path, content) pairs.
fn read_evicted_reply(stream: &mut UnixStream) -> (u32, Vec<(String, Vec<u8>)>) {
    let code = read_u32(stream);
    if code != OK {
        return (code, Vec::new());
    }
    let count = read_u32(stream);
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let path_len = read_u64(stream);
        let mut path_bytes = read_bytes(stream, path_len as usize);
        path_bytes.pop(); // trailing NUL
        let path = String::from_utf8(path_bytes).unwrap();
        let content_len = read_u64(stream);
        let content = read_bytes(stream, content_len as usize);
        out.push((path, content));
    }
    (code, out)
}

struct Harness {
    socket_path: String,
}

impl Harness {
    fn start(configure: impl FnOnce(&mut Config)) -> Self {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let dir = std::env::temp_dir();
        let unique = format!(
            "nexa-storaged-test-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let socket_path = dir.join(format!("{unique}.sock")).to_string_lossy().into_owned();
        let log_file_path = dir.join(format!("{unique}.csv")).to_string_lossy().into_owned();

        let mut config = Config { socket_path: socket_path.clone(), log_file_path, ..Config::default() };
        configure(&mut config);

        let server = Server::bind(&config).expect("bind test server");
        std::thread::spawn(move || {
            let _ = server.run();
        });

        // Give the master thread a moment to reach its poll loop before the
        // first client connects.
        std::thread::sleep(Duration::from_millis(50));
        Self { socket_path }
    }

    fn connect(&self) -> UnixStream {
        for _ in 0..20 {
            if let Ok(stream) = UnixStream::connect(&self.socket_path) {
                stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
                return stream;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        panic!("could not connect to test server at {}", self.socket_path);
    }
}

#[test]
fn open_create_lock_write_read_round_trip() {
    let harness = Harness::start(|_| {});
    let mut client = harness.connect();

    client.write_all(&encode_request(OPEN_CREATE_LOCK, Some("/greeting"), None)).unwrap();
    assert_eq!(read_code(&mut client), OK);

    client.write_all(&encode_request(WRITE, Some("/greeting"), Some(b"hello"))).unwrap();
    let (code, evicted) = read_evicted_reply(&mut client);
    assert_eq!(code, OK);
    assert!(evicted.is_empty());

    client.write_all(&encode_request(READ, Some("/greeting"), None)).unwrap();
    let (code, content) = read_content_reply(&mut client);
    assert_eq!(code, OK);
    assert_eq!(content, b"hello");
}

#[test]
fn second_open_of_same_path_is_rejected_as_already_open() {
    let harness = Harness::start(|_| {});
    let mut client = harness.connect();

    client.write_all(&encode_request(OPEN_CREATE, Some("/a"), None)).unwrap();
    assert_eq!(read_code(&mut client), OK);

    client.write_all(&encode_request(OPEN_NO_FLAGS, Some("/a"), None)).unwrap();
    const FILE_ALREADY_OPEN: u32 = 7;
    assert_eq!(read_code(&mut client), FILE_ALREADY_OPEN);
}

/// max_file_num=2, max_bytes=10: client A writes a 7-byte file, client B
/// writes a 9-byte file. 7 + 9 exceeds the 10-byte budget, so the FIFO
/// policy evicts A's (oldest) file and hands its payload back to B.
#[test]
fn fifo_eviction_returns_evicted_payload_when_budget_is_exceeded() {
    let harness = Harness::start(|c| {
        c.max_file_num = 2;
        c.max_bytes = 10;
    });

    let mut a = harness.connect();
    a.write_all(&encode_request(OPEN_CREATE_LOCK, Some("/a"), None)).unwrap();
    assert_eq!(read_code(&mut a), OK);
    a.write_all(&encode_request(WRITE, Some("/a"), Some(&[1u8; 7]))).unwrap();
    let (code, evicted) = read_evicted_reply(&mut a);
    assert_eq!(code, OK);
    assert!(evicted.is_empty());
    // A locked file is never evicted; release the lock so /a is an eviction
    // candidate once /b needs the room.
    a.write_all(&encode_request(UNLOCK, Some("/a"), None)).unwrap();
    assert_eq!(read_code(&mut a), OK);

    let mut b = harness.connect();
    b.write_all(&encode_request(OPEN_CREATE_LOCK, Some("/b"), None)).unwrap();
    assert_eq!(read_code(&mut b), OK);
    b.write_all(&encode_request(WRITE, Some("/b"), Some(&[2u8; 9]))).unwrap();
    let (code, evicted) = read_evicted_reply(&mut b);
    assert_eq!(code, OK);
    assert_eq!(evicted.len(), 1);
    assert_eq!(evicted[0].0, "/a");
    assert_eq!(evicted[0].1, vec![1u8; 7]);
}

/// A locks and writes, B opens the same file and requests the lock (gets
/// suspended, no reply yet); A unlocks, which hands the lock to B and
/// delivers B its own `OK` asynchronously on B's own socket.
#[test]
fn lock_release_hands_off_to_fifo_waiter() {
    let harness = Harness::start(|_| {});

    let mut a = harness.connect();
    a.write_all(&encode_request(OPEN_CREATE_LOCK, Some("/shared"), None)).unwrap();
    assert_eq!(read_code(&mut a), OK);

    let mut b = harness.connect();
    b.write_all(&encode_request(OPEN_NO_FLAGS, Some("/shared"), None)).unwrap();
    assert_eq!(read_code(&mut b), OK);

    b.write_all(&encode_request(LOCK, Some("/shared"), None)).unwrap();
    // B is now suspended: nothing to read yet. Give the master loop a beat
    // before A releases the lock.
    std::thread::sleep(Duration::from_millis(50));

    a.write_all(&encode_request(UNLOCK, Some("/shared"), None)).unwrap();
    assert_eq!(read_code(&mut a), OK);

    // B's suspended `lock` request now resolves asynchronously.
    assert_eq!(read_code(&mut b), OK);
}

/// A locks a file and disconnects without unlocking; B, queued behind A's
/// lock, receives the handoff once the disconnect cascade runs.
#[test]
fn disconnect_while_holding_lock_hands_off_to_waiter() {
    let harness = Harness::start(|_| {});

    let mut a = harness.connect();
    a.write_all(&encode_request(OPEN_CREATE_LOCK, Some("/owned"), None)).unwrap();
    assert_eq!(read_code(&mut a), OK);

    let mut b = harness.connect();
    b.write_all(&encode_request(OPEN_NO_FLAGS, Some("/owned"), None)).unwrap();
    assert_eq!(read_code(&mut b), OK);
    b.write_all(&encode_request(LOCK, Some("/owned"), None)).unwrap();

    std::thread::sleep(Duration::from_millis(50));
    drop(a);

    assert_eq!(read_code(&mut b), OK);
}

/// `unlock` with no other waiter queued must clear the releasing client's
/// write authorization along with the lock itself — otherwise a client
/// that unlocked a file it no longer owns could still write to it.
#[test]
fn unlock_without_waiters_clears_write_authorization() {
    let harness = Harness::start(|_| {});

    let mut a = harness.connect();
    a.write_all(&encode_request(OPEN_CREATE_LOCK, Some("/solo"), None)).unwrap();
    assert_eq!(read_code(&mut a), OK);
    a.write_all(&encode_request(UNLOCK, Some("/solo"), None)).unwrap();
    assert_eq!(read_code(&mut a), OK);

    const OPERATION_NOT_PERMITTED: u32 = 9;
    a.write_all(&encode_request(WRITE, Some("/solo"), Some(b"late"))).unwrap();
    assert_eq!(read_code(&mut a), OPERATION_NOT_PERMITTED);
}
