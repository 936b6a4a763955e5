//! The file handler.
//!
//! Serves static files for GET, HEAD and POST, and replaces or deletes them for
//! PUT and DELETE where the location allows it. A response starts out as one
//! virtual packet covering the whole file. Unless the send connector transmits it
//! by reference, the handler reads the file in pieces sized to what the next queue
//! accepts.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::BytesMut;
use http::header::{self, HeaderValue};
use http::{Method, StatusCode};
use tracing::{debug, trace};

use crate::conn::{FileInfo, HttpConn};
use crate::host::LocationFlags;
use crate::packet::Packet;
use crate::queue::QueueId;
use crate::stage::{FILE_HANDLER, SEND_CONNECTOR, Stage, StageDef, StageFlags, defaults};

pub(crate) struct FileHandler;

impl Stage for FileHandler {
    fn open(&self, conn: &mut HttpConn, q: QueueId) {
        defaults::open(conn, q);
        if conn.is_error() {
            return;
        }
        let method = conn.rx().method().clone();
        if method == Method::PUT || method == Method::DELETE {
            let allowed = conn.rx().location().is_some_and(|location| location.flags().contains(LocationFlags::PUT_DELETE));
            if allowed {
                conn.tx_mut().omit_body();
                conn.tx_mut().set_length(0);
            } else {
                conn.error(StatusCode::METHOD_NOT_ALLOWED, &format!("Method {method} is not enabled for {}", conn.rx().path()));
            }
            return;
        }
        open_for_read(conn);
    }

    fn start(&self, conn: &mut HttpConn, q: QueueId) {
        match conn.rx().method().clone() {
            Method::PUT => start_put(conn),
            Method::DELETE => delete(conn),
            _ => {
                let length = conn.tx().entity_length();
                if !conn.tx().is_no_body()
                    && let Ok(length) = usize::try_from(length)
                    && length > 0
                {
                    conn.put(q, Packet::entity(0, length));
                }
            }
        }
    }

    fn process(&self, conn: &mut HttpConn, _q: QueueId) {
        conn.finalize();
    }

    fn incoming_data(&self, conn: &mut HttpConn, _q: QueueId, packet: Packet) {
        if conn.is_error() || conn.rx().method() != Method::PUT {
            return;
        }
        let (Some(file), Some(content)) = (conn.tx.file.as_mut(), packet.content()) else {
            return;
        };
        if let Err(e) = file.write_all(content) {
            let message = format!("Cannot write {}: {e}", conn.rx().path());
            conn.error(StatusCode::INTERNAL_SERVER_ERROR, &message);
        }
    }

    fn outgoing_service(&self, conn: &mut HttpConn, q: QueueId) {
        let by_reference = conn.tx().connector().is_some_and(|connector| connector.name() == SEND_CONNECTOR);
        while let Some(mut packet) = conn.queues_mut().get_packet(q) {
            if packet.is_virtual() && !by_reference {
                conn.queues_mut().resize_packet(q, &mut packet, 0);
                if let Err(e) = fill(conn, &mut packet) {
                    conn.error(StatusCode::SERVICE_UNAVAILABLE, &format!("Cannot read {}: {e}", conn.rx().path()));
                    return;
                }
            }
            if !conn.queues_mut().will_next_accept(q, &mut packet) {
                conn.queues_mut().put_back(q, packet);
                return;
            }
            conn.put_next(q, packet);
        }
    }
}

fn open_for_read(conn: &mut HttpConn) {
    let Some(info) = conn.tx().file_info().filter(|info| info.is_file).cloned() else {
        conn.error(StatusCode::NOT_FOUND, &format!("Cannot find {}", conn.rx().uri().path()));
        return;
    };
    if info.size > conn.limits().transmission_body_size {
        let message = format!("Response entity of {} bytes is too big. Limit {}", info.size, conn.limits().transmission_body_size);
        conn.error(StatusCode::PAYLOAD_TOO_LARGE, &message);
        return;
    }
    if let Some(modified) = info.modified
        && let Ok(value) = HeaderValue::from_str(&httpdate::fmt_http_date(modified))
    {
        conn.tx_mut().set_header(header::LAST_MODIFIED, value);
    }
    if !check_conditions(conn, &info) {
        return;
    }

    if conn.tx().is_no_body() || conn.tx().connector().is_some_and(|connector| connector.name() == SEND_CONNECTOR) {
        return;
    }
    let Some(filename) = conn.tx().filename().map(std::path::Path::to_path_buf) else {
        return;
    };
    match File::open(&filename) {
        Ok(file) => conn.tx.file = Some(file),
        Err(e) => {
            debug!(file = %filename.display(), cause = %e, "cannot open file");
            conn.error(StatusCode::NOT_FOUND, &format!("Cannot open {}", conn.rx().uri().path()));
        }
    }
}

/// Applies the conditional request headers. Returns false when the response is decided.
fn check_conditions(conn: &mut HttpConn, info: &FileInfo) -> bool {
    let conditions = conn.rx().conditions().clone();
    if conditions.is_empty() {
        return true;
    }
    let etag = conn.tx().etag().unwrap_or_default().to_string();
    let matches = |tags: &Vec<String>| tags.iter().any(|tag| tag == "*" || *tag == etag);

    if let Some(tags) = &conditions.if_match
        && !matches(tags)
    {
        conn.error(StatusCode::PRECONDITION_FAILED, "Precondition failed");
        return false;
    }

    let not_modified = match (&conditions.if_none_match, conditions.if_modified_since) {
        (Some(tags), _) => matches(tags),
        (None, Some(since)) => info.modified.is_some_and(|modified| seconds(modified) <= seconds(since)),
        (None, None) => false,
    };
    let method = conn.rx().method().clone();
    if not_modified && (method == Method::GET || method == Method::HEAD) {
        trace!(etag = %etag, "not modified");
        conn.tx_mut().set_status(StatusCode::NOT_MODIFIED);
        conn.tx_mut().omit_body();
        conn.rx.clear_ranges();
        return false;
    }

    if let Some(validator) = &conditions.if_range {
        let current = if validator.starts_with('"') || validator.starts_with("W/") {
            validator.trim_start_matches("W/") == etag
        } else {
            let since = httpdate::parse_http_date(validator).ok();
            matches!((info.modified, since), (Some(modified), Some(since)) if seconds(modified) <= seconds(since))
        };
        if !current {
            debug!(validator = %validator, "if-range does not match, sending the full entity");
            conn.rx.clear_ranges();
        }
    }
    true
}

fn seconds(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).map_or(0, |since| since.as_secs())
}

fn start_put(conn: &mut HttpConn) {
    let Some(filename) = conn.tx().filename().map(std::path::Path::to_path_buf) else {
        conn.error(StatusCode::INTERNAL_SERVER_ERROR, "No file for the request");
        return;
    };
    let existed = conn.tx().file_info().is_some_and(|info| info.is_file);
    match OpenOptions::new().write(true).create(true).truncate(true).open(&filename) {
        Ok(file) => {
            debug!(file = %filename.display(), existed, "replacing file");
            conn.tx.file = Some(file);
            conn.tx_mut().set_status(if existed { StatusCode::NO_CONTENT } else { StatusCode::CREATED });
        }
        Err(e) => {
            let status = if e.kind() == io::ErrorKind::NotFound { StatusCode::NOT_FOUND } else { StatusCode::INTERNAL_SERVER_ERROR };
            conn.error(status, &format!("Cannot create {}: {e}", conn.rx().path()));
        }
    }
}

fn delete(conn: &mut HttpConn) {
    let target = conn.tx().filename().filter(|_| conn.tx().file_info().is_some_and(|info| info.is_file)).map(std::path::Path::to_path_buf);
    let Some(filename) = target else {
        conn.error(StatusCode::NOT_FOUND, &format!("Cannot find {}", conn.rx().uri().path()));
        return;
    };
    match fs::remove_file(&filename) {
        Ok(()) => {
            debug!(file = %filename.display(), "deleted file");
            conn.tx_mut().set_status(StatusCode::NO_CONTENT);
        }
        Err(e) => conn.error(StatusCode::INTERNAL_SERVER_ERROR, &format!("Cannot delete {}: {e}", conn.rx().path())),
    }
}

/// Opens the response file unless it is open already.
pub(crate) fn ensure_open(conn: &mut HttpConn) -> io::Result<&File> {
    if conn.tx.file.is_none() {
        let filename = conn.tx().filename().ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no file for the request"))?;
        let file = File::open(filename)?;
        conn.tx.file = Some(file);
    }
    conn.tx.file.as_ref().ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
}

/// Reads the file region of a virtual packet into it.
pub(crate) fn fill(conn: &mut HttpConn, packet: &mut Packet) -> io::Result<()> {
    let file = ensure_open(conn)?;
    let mut buf = BytesMut::zeroed(packet.len());
    read_at(file, &mut buf, packet.entity_pos())?;
    trace!(pos = packet.entity_pos(), len = buf.len(), "read file region");
    packet.fill(buf);
    Ok(())
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], pos: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, pos)
}

#[cfg(not(unix))]
fn read_at(mut file: &File, buf: &mut [u8], pos: u64) -> io::Result<()> {
    use std::io::{Read, Seek, SeekFrom};
    file.seek(SeekFrom::Start(pos))?;
    file.read_exact(buf)
}

pub(crate) fn definition() -> StageDef {
    let flags = StageFlags::HANDLER | StageFlags::GET | StageFlags::HEAD | StageFlags::POST | StageFlags::PUT | StageFlags::DELETE | StageFlags::VERIFY_ENTITY;
    StageDef::new(FILE_HANDLER, flags, Arc::new(FileHandler))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{Host, Location};
    use crate::limits::Limits;
    use crate::testing::{MemTransport, TempDir, drive, engine_for, engine_with, serve, split_response};
    use indoc::formatdoc;

    fn put_delete_engine(root: &std::path::Path) -> Arc<crate::engine::HttpEngine> {
        let host = Host::builder("localhost", root).location(Location::new("/").put_delete(true)).build().unwrap();
        engine_with(host, Limits::default())
    }

    #[test]
    fn serves_file_with_validators() {
        let dir = TempDir::new("file-get");
        dir.write("hello.txt", "hello world");
        let response = serve(&engine_for(dir.path()), "GET /hello.txt HTTP/1.1\r\nHost: localhost\r\n\r\n");
        let (head, body) = split_response(&response);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("content-length: 11"));
        assert!(head.contains("content-type: text/plain"));
        assert!(head.contains("accept-ranges: bytes"));
        assert!(head.contains("last-modified: "));
        assert!(head.contains("etag: \"b-"));
        assert_eq!(body, "hello world");
    }

    #[test]
    fn head_sends_length_without_body() {
        let dir = TempDir::new("file-head");
        dir.write("hello.txt", "hello world");
        let response = serve(&engine_for(dir.path()), "HEAD /hello.txt HTTP/1.1\r\nHost: localhost\r\n\r\n");
        let (head, body) = split_response(&response);
        assert!(head.contains("content-length: 11"));
        assert_eq!(body, "");
    }

    #[test]
    fn large_file_through_net_connector() {
        let dir = TempDir::new("file-large");
        let content: Vec<u8> = (0..300_000u32).map(|i| (i % 253) as u8).collect();
        dir.write("big.bin", &content);
        let transport = MemTransport::new();
        transport.set_secure(true);
        transport.push_input("GET /big.bin HTTP/1.1\r\nHost: localhost\r\n\r\n");
        let mut conn = HttpConn::new(engine_for(dir.path()), transport.clone());
        drive(&mut conn, &transport);

        let output = transport.output();
        let split = output.windows(4).position(|window| window == b"\r\n\r\n").unwrap();
        assert_eq!(&output[split + 4..], &content[..]);
    }

    #[test]
    fn if_none_match_gives_not_modified() {
        let dir = TempDir::new("file-inm");
        let path = dir.write("a.txt", "abc");
        let etag = FileInfo::stat(&path).unwrap().etag();
        let request = formatdoc! {"
            GET /a.txt HTTP/1.1\r
            If-None-Match: {etag}\r
            \r
        "};
        let response = serve(&engine_for(dir.path()), &request);
        let (head, body) = split_response(&response);
        assert!(head.starts_with("HTTP/1.1 304 Not Modified\r\n"), "{head}");
        assert!(!head.contains("content-length"));
        assert_eq!(body, "");
    }

    #[test]
    fn if_match_mismatch_fails_precondition() {
        let dir = TempDir::new("file-im");
        dir.write("a.txt", "abc");
        let response = serve(&engine_for(dir.path()), "GET /a.txt HTTP/1.1\r\nIf-Match: \"nope\"\r\n\r\n");
        assert!(response.starts_with("HTTP/1.1 412 Precondition Failed\r\n"));
    }

    #[test]
    fn stale_if_range_sends_full_entity() {
        let dir = TempDir::new("file-if-range");
        dir.write("a.txt", "0123456789");
        let response = serve(&engine_for(dir.path()), "GET /a.txt HTTP/1.1\r\nRange: bytes=0-1\r\nIf-Range: \"old\"\r\n\r\n");
        let (head, body) = split_response(&response);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
        assert_eq!(body, "0123456789");
    }

    #[test]
    fn put_creates_then_replaces() {
        let dir = TempDir::new("file-put");
        let engine = put_delete_engine(dir.path());

        let response = serve(&engine, "PUT /new.txt HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello");
        assert!(response.starts_with("HTTP/1.1 201 Created\r\n"), "{response}");
        assert_eq!(fs::read_to_string(dir.path().join("new.txt")).unwrap(), "hello");

        let response = serve(&engine, "PUT /new.txt HTTP/1.1\r\nContent-Length: 3\r\n\r\nbye");
        assert!(response.starts_with("HTTP/1.1 204 No Content\r\n"), "{response}");
        assert_eq!(fs::read_to_string(dir.path().join("new.txt")).unwrap(), "bye");
    }

    #[test]
    fn put_with_chunked_body() {
        let dir = TempDir::new("file-put-chunked");
        let engine = put_delete_engine(dir.path());
        let response = serve(&engine, "PUT /c.txt HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n");
        assert!(response.starts_with("HTTP/1.1 201 Created\r\n"), "{response}");
        assert_eq!(fs::read_to_string(dir.path().join("c.txt")).unwrap(), "hello world");
    }

    #[test]
    fn delete_removes_file() {
        let dir = TempDir::new("file-delete");
        dir.write("gone.txt", "x");
        let engine = put_delete_engine(dir.path());

        let response = serve(&engine, "DELETE /gone.txt HTTP/1.1\r\n\r\n");
        assert!(response.starts_with("HTTP/1.1 204 No Content\r\n"), "{response}");
        assert!(!dir.path().join("gone.txt").exists());

        let response = serve(&engine, "DELETE /gone.txt HTTP/1.1\r\n\r\n");
        assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"), "{response}");
    }

    #[test]
    fn put_needs_permission() {
        let dir = TempDir::new("file-put-denied");
        let response = serve(&engine_for(dir.path()), "PUT /x.txt HTTP/1.1\r\nContent-Length: 1\r\n\r\nx");
        assert!(response.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"), "{response}");
        assert!(!dir.path().join("x.txt").exists());
    }
}
