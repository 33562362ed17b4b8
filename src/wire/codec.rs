//! Framing primitives: fixed-width integers and length-prefixed frames,
//! with transparent retry-on-partial and `EINTR` handling.

use std::io::{self, ErrorKind, Read, Write};

use super::{Request, RequestCode, Response, ResponseCode};

/// Maximum path length accepted from a client, matching the host's
/// filesystem path limit.
pub const MAX_PATH_LEN: usize = libc::PATH_MAX as usize;

/// A request that failed validation before it ever reached the storage
/// engine. Carries the code the server must send, and whether the
/// connection must be closed afterward (true for every variant here, per
/// spec's protocol-error policy).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolError(pub ResponseCode);

/// Reads the full `buf.len()` bytes, retrying on `Interrupted` and
/// surfacing a clean [`WireError::Reset`](crate::error::WireError::Reset)
/// on premature EOF via `UnexpectedEof`.
fn read_full(stream: &mut impl Read, buf: &mut [u8]) -> io::Result<()> {
    let mut read = 0;
    while read < buf.len() {
        match stream.read(&mut buf[read..]) {
            Ok(0) => {
                return Err(io::Error::new(ErrorKind::UnexpectedEof, "peer closed stream"))
            }
            Ok(n) => read += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Writes the full buffer, retrying on `Interrupted`.
fn write_full(stream: &mut impl Write, buf: &[u8]) -> io::Result<()> {
    let mut written = 0;
    while written < buf.len() {
        match stream.write(&buf[written..]) {
            Ok(0) => {
                return Err(io::Error::new(ErrorKind::WriteZero, "failed to write whole buffer"))
            }
            Ok(n) => written += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn read_u32(stream: &mut impl Read) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    read_full(stream, &mut buf)?;
    Ok(u32::from_ne_bytes(buf))
}

fn read_u64(stream: &mut impl Read) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    read_full(stream, &mut buf)?;
    Ok(u64::from_ne_bytes(buf))
}

fn read_i32(stream: &mut impl Read) -> io::Result<i32> {
    let mut buf = [0u8; 4];
    read_full(stream, &mut buf)?;
    Ok(i32::from_ne_bytes(buf))
}

fn write_u32(stream: &mut impl Write, value: u32) -> io::Result<()> {
    write_full(stream, &value.to_ne_bytes())
}

fn write_u64(stream: &mut impl Write, value: u64) -> io::Result<()> {
    write_full(stream, &value.to_ne_bytes())
}

/// Validates a decoded path per spec §6: NUL-terminated in the frame
/// (stripped here), non-empty, starts with `/`, no `,`, within the host
/// path length limit.
fn validate_path(raw: Vec<u8>) -> Result<String, ProtocolError> {
    if raw.is_empty() || *raw.last().unwrap() != 0 {
        return Err(ProtocolError(ResponseCode::InvalidPath));
    }
    let body = &raw[..raw.len() - 1];
    if body.len() > MAX_PATH_LEN {
        return Err(ProtocolError(ResponseCode::TooLongPath));
    }
    let text = std::str::from_utf8(body).map_err(|_| ProtocolError(ResponseCode::InvalidPath))?;
    if !text.starts_with('/') || text.contains(',') || text.is_empty() {
        return Err(ProtocolError(ResponseCode::InvalidPath));
    }
    Ok(text.to_string())
}

fn read_path_frame(stream: &mut impl Read) -> Result<String, ProtocolError> {
    let len = read_u64(stream).map_err(|_| ProtocolError(ResponseCode::InvalidPath))?;
    if len == 0 {
        return Err(ProtocolError(ResponseCode::InvalidPath));
    }
    let mut buf = vec![0u8; len as usize];
    read_full(stream, &mut buf).map_err(|_| ProtocolError(ResponseCode::InvalidPath))?;
    validate_path(buf)
}

fn read_content_frame(
    stream: &mut impl Read,
    max_bytes: usize,
) -> Result<Vec<u8>, ProtocolError> {
    let len = read_u64(stream).map_err(|_| ProtocolError(ResponseCode::TooLongContent))?;
    if len as usize > max_bytes {
        return Err(ProtocolError(ResponseCode::TooLongContent));
    }
    let mut buf = vec![0u8; len as usize];
    read_full(stream, &mut buf).map_err(|_| ProtocolError(ResponseCode::TooLongContent))?;
    Ok(buf)
}

fn write_path_frame(stream: &mut impl Write, path: &str) -> io::Result<()> {
    let mut bytes = path.as_bytes().to_vec();
    bytes.push(0);
    write_u64(stream, bytes.len() as u64)?;
    write_full(stream, &bytes)
}

fn write_content_frame(stream: &mut impl Write, content: &[u8]) -> io::Result<()> {
    write_u64(stream, content.len() as u64)?;
    write_full(stream, content)
}

/// Reads and validates one request. `Ok(Err(protocol_error))` means the
/// frame parsed far enough to know the response code to send, after which
/// the caller must close the connection. `Err(io_error)` means the stream
/// itself is gone (disconnect cascade).
pub fn read_request(
    stream: &mut impl Read,
    max_bytes: usize,
) -> io::Result<Result<Request, ProtocolError>> {
    let raw_code = read_u32(stream)?;
    let Ok(code) = RequestCode::try_from(raw_code) else {
        return Ok(Err(ProtocolError(ResponseCode::NotRecognizedOp)));
    };

    let mut path = None;
    if code.has_path() {
        match read_path_frame(stream) {
            Ok(p) => path = Some(p),
            Err(e) => return Ok(Err(e)),
        }
    }

    let mut content = None;
    if code.has_content() {
        match read_content_frame(stream, max_bytes) {
            Ok(c) => content = Some(c),
            Err(e) => return Ok(Err(e)),
        }
    }

    let n = if code.has_n() { Some(read_i32(stream)?) } else { None };

    Ok(Ok(Request { code, path, content, n }))
}

/// Writes a response in full, including any trailing content/selection
/// frames the given variant requires.
pub fn write_response(stream: &mut impl Write, response: &Response) -> io::Result<()> {
    write_u32(stream, response.code() as u32)?;
    match response {
        Response::Code(_) => {}
        Response::Content(bytes) => write_content_frame(stream, bytes)?,
        Response::Selection(items) => {
            write_u32(stream, items.len() as u32)?;
            for (path, content) in items {
                write_path_frame(stream, path)?;
                write_content_frame(stream, content)?;
            }
        }
        Response::Evicted(items) => {
            write_u32(stream, items.len() as u32)?;
            for item in items {
                write_path_frame(stream, &item.path)?;
                write_content_frame(stream, &item.payload)?;
            }
        }
    }
    Ok(())
}

/// Writes a bare response code, used for protocol-error replies before the
/// connection is closed.
pub fn write_code(stream: &mut impl Write, code: ResponseCode) -> io::Result<()> {
    write_u32(stream, code as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn encode_request(code: u32, path: Option<&str>, content: Option<&[u8]>, n: Option<i32>) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&code.to_ne_bytes());
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
        if let Some(n) = n {
            buf.extend_from_slice(&n.to_ne_bytes());
        }
        buf
    }

    #[test]
    fn round_trips_open_create_lock() {
        let bytes = encode_request(RequestCode::OpenCreateLock as u32, Some("/a"), None, None);
        let mut cursor = Cursor::new(bytes);
        let request = read_request(&mut cursor, 1_000_000).unwrap().unwrap();
        assert_eq!(request.code, RequestCode::OpenCreateLock);
        assert_eq!(request.path.as_deref(), Some("/a"));
    }

    #[test]
    fn round_trips_write_with_content() {
        let bytes = encode_request(RequestCode::Write as u32, Some("/a"), Some(b"hello"), None);
        let mut cursor = Cursor::new(bytes);
        let request = read_request(&mut cursor, 1_000_000).unwrap().unwrap();
        assert_eq!(request.content.as_deref(), Some(&b"hello"[..]));
    }

    #[test]
    fn round_trips_readn_with_n() {
        let bytes = encode_request(RequestCode::ReadN as u32, None, None, Some(-1));
        let mut cursor = Cursor::new(bytes);
        let request = read_request(&mut cursor, 1_000_000).unwrap().unwrap();
        assert_eq!(request.n, Some(-1));
        assert!(request.path.is_none());
    }

    #[test]
    fn rejects_unrecognized_code() {
        let bytes = 9999u32.to_ne_bytes().to_vec();
        let mut cursor = Cursor::new(bytes);
        let outcome = read_request(&mut cursor, 1_000_000).unwrap();
        assert_eq!(outcome.unwrap_err(), ProtocolError(ResponseCode::NotRecognizedOp));
    }

    #[test]
    fn rejects_path_without_leading_slash() {
        let bytes = encode_request(RequestCode::OpenNoFlags as u32, Some("nope"), None, None);
        let mut cursor = Cursor::new(bytes);
        let outcome = read_request(&mut cursor, 1_000_000).unwrap();
        assert_eq!(outcome.unwrap_err(), ProtocolError(ResponseCode::InvalidPath));
    }

    #[test]
    fn rejects_path_with_comma() {
        let bytes = encode_request(RequestCode::OpenNoFlags as u32, Some("/a,b"), None, None);
        let mut cursor = Cursor::new(bytes);
        let outcome = read_request(&mut cursor, 1_000_000).unwrap();
        assert_eq!(outcome.unwrap_err(), ProtocolError(ResponseCode::InvalidPath));
    }

    #[test]
    fn rejects_content_over_cap() {
        let bytes = encode_request(RequestCode::Write as u32, Some("/a"), Some(&[0u8; 16]), None);
        let mut cursor = Cursor::new(bytes);
        let outcome = read_request(&mut cursor, 8).unwrap();
        assert_eq!(outcome.unwrap_err(), ProtocolError(ResponseCode::TooLongContent));
    }

    #[test]
    fn writes_content_response() {
        let mut buf = Vec::new();
        write_response(&mut buf, &Response::Content(b"hi".to_vec())).unwrap();
        let mut cursor = Cursor::new(buf);
        assert_eq!(read_u32(&mut cursor).unwrap(), ResponseCode::Ok as u32);
        assert_eq!(read_u64(&mut cursor).unwrap(), 2);
    }
}
