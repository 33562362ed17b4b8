//! Dedicated signal-handling thread.
//!
//! `SIGHUP` requests a graceful drain (`SHUT_DOWN`); `SIGINT`/`SIGQUIT`
//! request an immediate stop (`SHUT_DOWN_NOW`) — spec §5. Signal delivery
//! itself stays off any thread that runs async-signal-unsafe code
//! (allocation, locking) by routing through `signal-hook`'s own self-pipe
//! internally and writing a single byte into ours, which the master event
//! loop polls alongside the listener and worker fds.

use std::io::{self, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::thread;

use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT};
use signal_hook::iterator::Signals;

/// Why the master loop is unwinding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownKind {
    /// `SHUT_DOWN`: stop accepting new connections, let in-flight requests
    /// finish, then exit.
    Graceful,
    /// `SHUT_DOWN_NOW`: stop immediately.
    Immediate,
}

/// Read end of the self-pipe the signal thread writes into. One byte per
/// delivered signal: `0` for graceful, `1` for immediate.
pub struct SignalChannel {
    pub read: UnixStream,
    _handle: thread::JoinHandle<()>,
}

impl SignalChannel {
    pub fn install() -> io::Result<Self> {
        let (read_half, mut write_half) = UnixStream::pair()?;
        read_half.set_nonblocking(true)?;
        let mut signals = Signals::new([SIGHUP, SIGINT, SIGQUIT])?;

        let handle = thread::Builder::new()
            .name("signal-handler".to_string())
            .spawn(move || {
                for signal in signals.forever() {
                    let byte: u8 = match signal {
                        SIGINT | SIGQUIT => 1,
                        SIGHUP => 0,
                        _ => continue,
                    };
                    let immediate = byte == 1;
                    if write_half.write_all(&[byte]).is_err() {
                        return;
                    }
                    if immediate {
                        return;
                    }
                }
            })?;

        Ok(Self { read: read_half, _handle: handle })
    }

    pub fn fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }
}

/// Decodes one byte read off the self-pipe into the shutdown it requests.
pub fn decode(byte: u8) -> ShutdownKind {
    if byte == 1 {
        ShutdownKind::Immediate
    } else {
        ShutdownKind::Graceful
    }
}
