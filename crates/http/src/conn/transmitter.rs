//! The response side of a connection.
//!
//! Stages fill in the [`Transmitter`] while the response moves down the pipeline:
//! status, headers, the entity length, the chunking decision. The header block is
//! only serialized when the connector first sees the header packet, so filters can
//! still change the framing after the handler is done.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use http::header::{self, HeaderName, HeaderValue};
use http::{HeaderMap, Method, StatusCode};
use tokio_util::codec::Encoder;
use tracing::{error, trace};

use crate::codec::{HeaderEncoder, ResponseHead};
use crate::conn::HttpConn;
use crate::date;
use crate::packet::Packet;
use crate::protocol::status;
use crate::stage::{StageDef, StageFlags};
use crate::utils::{escape_html, flags};

flags! {
    pub struct TxFlags: u8 {
        /// Body data is discarded, only the header block goes out.
        const NO_BODY = 0x1;
        const HEADERS_CREATED = 0x2;
        const DONT_CACHE = 0x4;
        const FINALIZED = 0x8;
        const WRITE_COMPLETE = 0x10;
    }
}

/// File metadata captured when a request is mapped to the file system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub size: u64,
    pub modified: Option<SystemTime>,
    pub is_file: bool,
    pub is_dir: bool,
}

impl FileInfo {
    /// `None` when the path does not exist or cannot be read.
    pub fn stat(path: &Path) -> Option<FileInfo> {
        let metadata = fs::metadata(path).ok()?;
        Some(FileInfo { size: metadata.len(), modified: metadata.modified().ok(), is_file: metadata.is_file(), is_dir: metadata.is_dir() })
    }

    /// Weak validator derived from size and modification time.
    pub fn etag(&self) -> String {
        let mtime = self.modified.and_then(|modified| modified.duration_since(UNIX_EPOCH).ok()).map_or(0, |since| since.as_secs());
        format!("\"{:x}-{:x}\"", self.size, mtime)
    }
}

#[derive(Debug)]
pub struct Transmitter {
    status: StatusCode,
    headers: HeaderMap,
    pub(crate) length: i64,
    pub(crate) entity_length: i64,
    pub(crate) chunk_size: i64,
    pub(crate) flags: TxFlags,
    pub(crate) alt_body: Option<String>,
    etag: Option<String>,
    pub(crate) extension: Option<String>,
    pub(crate) filename: Option<PathBuf>,
    pub(crate) file_info: Option<FileInfo>,
    pub(crate) file: Option<File>,
    pub(crate) handler: Option<Arc<StageDef>>,
    pub(crate) connector: Option<Arc<StageDef>>,
    pub(crate) range_boundary: Option<String>,
    pub(crate) trace_methods: StageFlags,
    pub(crate) bytes_written: u64,
}

impl Default for Transmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl Transmitter {
    pub(crate) fn new() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            length: -1,
            entity_length: -1,
            chunk_size: -1,
            flags: TxFlags::empty(),
            alt_body: None,
            etag: None,
            extension: None,
            filename: None,
            file_info: None,
            file: None,
            handler: None,
            connector: None,
            range_boundary: None,
            trace_methods: StageFlags::empty(),
            bytes_written: 0,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Replaces any value of `name`.
    pub fn set_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.headers.insert(name, value);
    }

    pub fn add_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.headers.append(name, value);
    }

    /// Body length to announce, `-1` when unknown.
    pub fn length(&self) -> i64 {
        self.length
    }

    pub fn set_length(&mut self, length: i64) {
        self.length = length;
    }

    /// Length of the underlying entity before ranges are applied.
    pub fn entity_length(&self) -> i64 {
        self.entity_length
    }

    pub fn set_entity_length(&mut self, length: i64) {
        self.entity_length = length;
    }

    /// Chunk size of a chunked response: `-1` undecided, `0` not chunked.
    pub fn chunk_size(&self) -> i64 {
        self.chunk_size
    }

    pub fn set_chunk_size(&mut self, chunk_size: i64) {
        self.chunk_size = chunk_size;
    }

    pub fn omit_body(&mut self) {
        self.flags.insert(TxFlags::NO_BODY);
    }

    pub fn is_no_body(&self) -> bool {
        self.flags.contains(TxFlags::NO_BODY)
    }

    pub fn dont_cache(&mut self) {
        self.flags.insert(TxFlags::DONT_CACHE);
    }

    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    pub fn set_etag(&mut self, etag: impl Into<String>) {
        self.etag = Some(etag.into());
    }

    pub fn extension(&self) -> Option<&str> {
        self.extension.as_deref()
    }

    pub fn filename(&self) -> Option<&Path> {
        self.filename.as_deref()
    }

    pub fn file_info(&self) -> Option<&FileInfo> {
        self.file_info.as_ref()
    }

    pub fn handler(&self) -> Option<&Arc<StageDef>> {
        self.handler.as_ref()
    }

    pub fn connector(&self) -> Option<&Arc<StageDef>> {
        self.connector.as_ref()
    }

    pub fn alt_body(&self) -> Option<&str> {
        self.alt_body.as_deref()
    }

    pub fn range_boundary(&self) -> Option<&str> {
        self.range_boundary.as_deref()
    }

    /// Method bits of the handler that would have served an OPTIONS or TRACE request.
    pub fn trace_methods(&self) -> StageFlags {
        self.trace_methods
    }

    pub fn headers_created(&self) -> bool {
        self.flags.contains(TxFlags::HEADERS_CREATED)
    }

    pub fn is_finalized(&self) -> bool {
        self.flags.contains(TxFlags::FINALIZED)
    }

    /// True once the end of the response went out, or nothing more will.
    pub fn is_write_complete(&self) -> bool {
        self.flags.contains(TxFlags::WRITE_COMPLETE)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub(crate) fn set_write_complete(&mut self) {
        self.flags.insert(TxFlags::WRITE_COMPLETE);
    }

    /// Records the file a request maps to. Regular files set the entity length and
    /// the etag; without ranges they also set the response length.
    pub(crate) fn set_file(&mut self, filename: PathBuf, info: Option<FileInfo>, has_ranges: bool) {
        if let Some(info) = info.as_ref().filter(|info| info.is_file) {
            let size = i64::try_from(info.size).unwrap_or(i64::MAX);
            self.entity_length = size;
            if !has_ranges {
                self.length = size;
            }
            self.etag = Some(info.etag());
        }
        self.filename = Some(filename);
        self.file_info = info;
    }
}

impl HttpConn {
    /// Serializes the response header block into the header packet.
    ///
    /// Runs once, when the connector first sees the header packet. An alt body is
    /// appended to the header block unless the request is a HEAD.
    pub(crate) fn write_headers(&mut self, packet: &mut Packet) {
        if self.tx.headers_created() {
            return;
        }
        self.tx.flags.insert(TxFlags::HEADERS_CREATED);
        let method = self.rx.method().clone();

        if !self.is_error() {
            if method == Method::TRACE && self.limits.enable_trace_method {
                self.tx.alt_body = Some(format!("{} {} {}\r\n", method, self.rx.uri(), self.rx.protocol()));
                self.tx.headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("message/http"));
            } else if method == Method::OPTIONS {
                let allow = allow_methods(self.tx.trace_methods, self.limits.enable_trace_method);
                if let Ok(value) = HeaderValue::from_str(&allow) {
                    self.tx.headers.insert(header::ALLOW, value);
                }
                self.tx.length = 0;
            }
        }

        self.add_standard_headers();
        self.add_length_headers();
        self.add_keep_alive_headers();

        let head = ResponseHead { version: self.rx.version(), status: self.tx.status, headers: &self.tx.headers, terminate: self.tx.chunk_size <= 0 };
        let Some(dst) = packet.content_mut() else {
            return;
        };
        if let Err(e) = HeaderEncoder.encode(head, dst) {
            error!(cause = %e, "failed to encode response header");
            self.mark_closing();
            return;
        }
        if let Some(alt_body) = &self.tx.alt_body
            && method != Method::HEAD
        {
            dst.extend_from_slice(alt_body.as_bytes());
        }
        trace!(status = self.tx.status.as_u16(), bytes = dst.len(), "response header created");
    }

    fn add_standard_headers(&mut self) {
        let tx = &mut self.tx;
        tx.headers.insert(header::DATE, date::http_date());
        if let Ok(server) = HeaderValue::from_str(self.engine.server_name()) {
            tx.headers.insert(header::SERVER, server);
        }
        if tx.flags.contains(TxFlags::DONT_CACHE) {
            tx.headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        }
        if let Some(etag) = tx.etag.as_deref().and_then(|etag| HeaderValue::from_str(etag).ok()) {
            tx.headers.insert(header::ETAG, etag);
        }
        let serves_file = tx.file_info.as_ref().is_some_and(|info| info.is_file);
        if serves_file && (tx.status == StatusCode::OK || tx.status == StatusCode::PARTIAL_CONTENT) {
            tx.headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        }

        if tx.alt_body.is_some() {
            tx.headers.entry(header::CONTENT_TYPE).or_insert(HeaderValue::from_static("text/html"));
        } else if let Some(boundary) = &tx.range_boundary {
            if let Ok(value) = HeaderValue::from_str(&format!("multipart/byteranges; boundary={boundary}")) {
                tx.headers.insert(header::CONTENT_TYPE, value);
            }
        } else if !tx.headers.contains_key(header::CONTENT_TYPE)
            && let Some(mime) = tx.extension.as_deref().and_then(|ext| self.host.as_ref().and_then(|host| host.mime_type(ext)))
            && let Ok(value) = HeaderValue::from_str(mime.as_ref())
        {
            tx.headers.insert(header::CONTENT_TYPE, value);
        }

        if tx.status == StatusCode::PARTIAL_CONTENT
            && tx.range_boundary.is_none()
            && let Some([range]) = self.rx.ranges()
            && let Ok(value) = HeaderValue::from_str(&format!("bytes {}-{}/{}", range.start, range.last(), tx.entity_length))
        {
            tx.headers.insert(header::CONTENT_RANGE, value);
        }
    }

    fn add_length_headers(&mut self) {
        let tx = &mut self.tx;
        if status::forbids_body(tx.status) {
            tx.headers.remove(header::CONTENT_LENGTH);
            tx.headers.remove(header::TRANSFER_ENCODING);
            if tx.chunk_size > 0 {
                tx.chunk_size = 0;
            }
        } else if let Some(alt_body) = &tx.alt_body {
            tx.headers.insert(header::CONTENT_LENGTH, HeaderValue::from(alt_body.len()));
            tx.chunk_size = -1;
        } else if tx.chunk_size > 0 {
            tx.headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        } else if tx.length >= 0 {
            tx.headers.insert(header::CONTENT_LENGTH, HeaderValue::from(tx.length));
        } else {
            // Close delimited
            self.keep_alive_count = 0;
        }
    }

    fn add_keep_alive_headers(&mut self) {
        self.keep_alive_count -= 1;
        let conn_error = self.is_conn_error();
        let headers = &mut self.tx.headers;
        if self.keep_alive_count > 0 && !conn_error {
            headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
            let params = format!("timeout={}, max={}", self.limits.inactivity_timeout().as_secs(), self.keep_alive_count);
            if let Ok(value) = HeaderValue::from_str(&params) {
                headers.insert(HeaderName::from_static("keep-alive"), value);
            }
        } else {
            headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
        }
    }

    /// Redirects the client to `target` with a short HTML body.
    ///
    /// Relative targets are made absolute with the request's `Host` header.
    pub fn redirect(&mut self, status: StatusCode, target: &str) {
        let location = match self.rx.host() {
            Some(host) if !target.contains("://") => {
                let scheme = if self.is_secure() { "https" } else { "http" };
                let slash = if target.starts_with('/') { "" } else { "/" };
                format!("{scheme}://{host}{slash}{target}")
            }
            _ => target.to_string(),
        };
        trace!(status = status.as_u16(), location = %location, "redirect");

        self.tx.status = status;
        if let Ok(value) = HeaderValue::from_str(&location) {
            self.tx.headers.insert(header::LOCATION, value);
        }
        self.tx.alt_body = Some(format!(
            "<!DOCTYPE html>\r\n<html><head><title>{reason}</title></head>\r\n<body><h1>{reason}</h1>\r\n<p>The document has moved <a href=\"{href}\">here</a>.</p></body></html>\r\n",
            reason = status::reason(status),
            href = escape_html(&location),
        ));
        self.tx.omit_body();
    }

    /// Completes the response by queueing the end packet. Calling it again has no effect.
    pub fn finalize(&mut self) {
        if self.tx.is_finalized() {
            return;
        }
        let Some(writeq) = self.writeq() else {
            return;
        };
        self.tx.flags.insert(TxFlags::FINALIZED);
        self.queues.put_for_service(writeq, Packet::end(), true);
        self.service_queues();
    }
}

/// The `Allow` header value for an OPTIONS response.
fn allow_methods(methods: StageFlags, trace_enabled: bool) -> String {
    let mut allow = String::from("OPTIONS");
    if trace_enabled {
        allow.push_str(",TRACE");
    }
    let named = [(StageFlags::GET, "GET"), (StageFlags::HEAD, "HEAD"), (StageFlags::POST, "POST"), (StageFlags::PUT, "PUT"), (StageFlags::DELETE, "DELETE")];
    for (flag, name) in named {
        if methods.contains(flag) {
            allow.push(',');
            allow.push_str(name);
        }
    }
    allow
}
