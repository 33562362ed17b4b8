//! Append-only CSV request logger — the external audit trail clients and
//! operators can tail, distinct from the process's own `log`/`env_logger`
//! diagnostics (spec §6).
//!
//! Column order matches spec §6 exactly: `time,thread_id,operation,outcome,
//! client_id,file,bytes_processed,curr_files,curr_bytes,curr_clients`.
//! `thread_id` 0 is reserved for the master; workers stamp their own id
//! (see [`crate::net::pool::current_worker_id`]). Every handler call
//! produces exactly one row, including the deferred-reply markers
//! `CLIENT_IS_WAITING` (suspended on a contended lock) and `OP_SUSPENDED`
//! (a handoff resolved a suspension) spec §4.3/§4.4 call out by name.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::error::StorageError;
use crate::storage::ClientId;
use crate::wire::RequestCode;

const HEADER: &str =
    "time,thread_id,operation,outcome,client_id,file,bytes_processed,curr_files,curr_bytes,curr_clients";

/// One audit-trail record. Built by the net layer once a handler has run
/// (or once a suspension/handoff/backpressure event needs logging) and
/// handed to [`RequestLogger::record`].
pub struct LogRecord<'a> {
    pub thread_id: u32,
    pub operation: &'a str,
    pub outcome: &'a str,
    pub client_id: ClientId,
    pub file: Option<&'a str>,
    pub bytes_processed: usize,
    pub curr_files: usize,
    pub curr_bytes: usize,
    pub curr_clients: usize,
}

pub struct RequestLogger {
    writer: Mutex<BufWriter<File>>,
}

impl RequestLogger {
    /// Opens (creating if needed) the CSV sink, writing the header line
    /// only the first time the file is created — re-opening an existing
    /// log on restart must not duplicate it.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path_ref = path.as_ref();
        let is_new = !path_ref.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path_ref)
            .map_err(StorageError::LoggerWrite)?;
        let mut writer = BufWriter::new(file);
        if is_new {
            writeln!(writer, "{HEADER}").map_err(StorageError::LoggerWrite)?;
            writer.flush().map_err(StorageError::LoggerWrite)?;
        }
        Ok(Self { writer: Mutex::new(writer) })
    }

    /// Appends one record. A failed write is surfaced to the caller as an
    /// `Err` but must never be treated as fatal (spec §9: "a failed write
    /// is surfaced as a warning, never fatal") — callers log it via `log::warn!`
    /// and carry on.
    pub fn record(&self, rec: &LogRecord<'_>) -> Result<(), StorageError> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let mut writer = self.writer.lock();
        writeln!(
            writer,
            "{timestamp},{},{},{},{},{},{},{},{},{}",
            rec.thread_id,
            rec.operation,
            rec.outcome,
            rec.client_id.0,
            rec.file.unwrap_or(""),
            rec.bytes_processed,
            rec.curr_files,
            rec.curr_bytes,
            rec.curr_clients,
        )
        .map_err(StorageError::LoggerWrite)?;
        writer.flush().map_err(StorageError::LoggerWrite)
    }
}

pub fn request_code_name(code: RequestCode) -> &'static str {
    match code {
        RequestCode::OpenNoFlags => "OPEN",
        RequestCode::OpenCreate => "OPEN_CREATE",
        RequestCode::OpenLock => "OPEN_LOCK",
        RequestCode::OpenCreateLock => "OPEN_CREATE_LOCK",
        RequestCode::Write => "WRITE",
        RequestCode::Append => "APPEND",
        RequestCode::Read => "READ",
        RequestCode::ReadN => "READ_N",
        RequestCode::Lock => "LOCK",
        RequestCode::Unlock => "UNLOCK",
        RequestCode::Remove => "REMOVE",
        RequestCode::Close => "CLOSE",
    }
}
