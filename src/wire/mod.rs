//! Wire protocol: request/response codes and framing.
//!
//! A request is `code:u32` optionally followed by a path frame, a content
//! frame, and/or an `n:i32`, in that order. A path frame is `len:u64` then
//! `len` NUL-terminated bytes; a content frame is `len:u64` then `len` bytes.
//! All integers are fixed-width, native byte order — the protocol is
//! local-socket only.

pub mod codec;

use std::convert::TryFrom;

/// Client-to-server request codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RequestCode {
    OpenNoFlags = 1,
    OpenCreate = 2,
    OpenLock = 3,
    OpenCreateLock = 4,
    Write = 5,
    Append = 6,
    Read = 7,
    ReadN = 8,
    Lock = 9,
    Unlock = 10,
    Remove = 11,
    Close = 12,
}

impl TryFrom<u32> for RequestCode {
    type Error = ();

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::OpenNoFlags,
            2 => Self::OpenCreate,
            3 => Self::OpenLock,
            4 => Self::OpenCreateLock,
            5 => Self::Write,
            6 => Self::Append,
            7 => Self::Read,
            8 => Self::ReadN,
            9 => Self::Lock,
            10 => Self::Unlock,
            11 => Self::Remove,
            12 => Self::Close,
            _ => return Err(()),
        })
    }
}

impl RequestCode {
    pub fn has_path(self) -> bool {
        !matches!(self, Self::ReadN)
    }

    pub fn has_content(self) -> bool {
        matches!(self, Self::Write | Self::Append)
    }

    pub fn has_n(self) -> bool {
        matches!(self, Self::ReadN)
    }

    pub fn wants_create(self) -> bool {
        matches!(self, Self::OpenCreate | Self::OpenCreateLock)
    }

    pub fn wants_lock(self) -> bool {
        matches!(self, Self::OpenLock | Self::OpenCreateLock)
    }
}

/// Server-to-client response codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ResponseCode {
    Ok = 0,
    NotRecognizedOp = 1,
    TooLongPath = 2,
    InvalidPath = 3,
    TooLongContent = 4,
    FileNotExists = 5,
    FileAlreadyExists = 6,
    FileAlreadyOpen = 7,
    FileAlreadyLocked = 8,
    OperationNotPermitted = 9,
    CouldNotEvict = 10,
    TemporarilyUnavailable = 11,
}

impl ResponseCode {
    /// Protocol errors close the connection after the code is sent; every
    /// other response code leaves the connection open.
    pub fn is_protocol_error(self) -> bool {
        matches!(
            self,
            Self::NotRecognizedOp | Self::TooLongPath | Self::InvalidPath | Self::TooLongContent
        )
    }

    pub fn as_log_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::NotRecognizedOp => "NOT_RECOGNIZED_OP",
            Self::TooLongPath => "TOO_LONG_PATH",
            Self::InvalidPath => "INVALID_PATH",
            Self::TooLongContent => "TOO_LONG_CONTENT",
            Self::FileNotExists => "FILE_NOT_EXISTS",
            Self::FileAlreadyExists => "FILE_ALREADY_EXISTS",
            Self::FileAlreadyOpen => "FILE_ALREADY_OPEN",
            Self::FileAlreadyLocked => "FILE_ALREADY_LOCKED",
            Self::OperationNotPermitted => "OPERATION_NOT_PERMITTED",
            Self::CouldNotEvict => "COULD_NOT_EVICT",
            Self::TemporarilyUnavailable => "TEMPORARILY_UNAVAILABLE",
        }
    }
}

/// A parsed, validated request ready for dispatch to the storage engine.
#[derive(Debug, Clone)]
pub struct Request {
    pub code: RequestCode,
    pub path: Option<String>,
    pub content: Option<Vec<u8>>,
    pub n: Option<i32>,
}

/// A single evicted file handed back to the client so it can persist the
/// rescued payload, per spec's write/append/eviction contract.
#[derive(Debug, Clone, PartialEq)]
pub struct EvictedFile {
    pub path: String,
    pub payload: Vec<u8>,
}

/// Everything a handler can produce for a single request.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// A bare response code, no payload.
    Code(ResponseCode),
    /// `OK` followed by one content frame (`read`).
    Content(Vec<u8>),
    /// `OK`, a count, then `count` (path, content) pairs (`read-N`).
    Selection(Vec<(String, Vec<u8>)>),
    /// `OK`, a count, then `count` (path, content) pairs of evicted files
    /// (`write`/`append`).
    Evicted(Vec<EvictedFile>),
}

impl Response {
    pub fn code(&self) -> ResponseCode {
        match self {
            Response::Code(code) => *code,
            Response::Content(_) | Response::Selection(_) | Response::Evicted(_) => {
                ResponseCode::Ok
            }
        }
    }
}

/// Outcome of dispatching a request to the storage engine.
pub enum Outcome {
    /// Send `response` back to the requesting client now.
    Reply(Response),
    /// The request enqueued the caller on a lock waiter queue; no reply is
    /// sent until a later handoff or the disconnect cascade resolves it.
    Suspended,
}
