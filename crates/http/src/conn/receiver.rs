//! The request side of a connection.
//!
//! [`Receiver`] interprets the parsed request header: method, normalised path,
//! body framing, ranges, conditional headers and keep-alive hints. The body itself
//! is read by [`HttpConn::process_content`] and flows up the receive chain as
//! packets.

use std::sync::Arc;
use std::time::SystemTime;

use http::{HeaderMap, Method, Request, StatusCode, Uri, Version, header};
use tracing::{debug, trace};

use crate::conn::{ConnState, HttpConn};
use crate::host::{Alias, DirBlock, Location};
use crate::limits::Limits;
use crate::packet::Packet;
use crate::protocol::range::{self, ByteRange};
use crate::protocol::{BodyFraming, RequestHeader, status};
use crate::stage::StageFlags;

/// A problem found while interpreting an otherwise well formed header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Rejection {
    pub(crate) status: StatusCode,
    pub(crate) message: String,
    /// The connection cannot be reused after this response.
    pub(crate) fatal: bool,
}

/// Conditional request headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Conditions {
    pub if_modified_since: Option<SystemTime>,
    pub if_none_match: Option<Vec<String>>,
    pub if_match: Option<Vec<String>>,
    pub if_range: Option<String>,
}

impl Conditions {
    fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            if_modified_since: header_text(headers, header::IF_MODIFIED_SINCE).and_then(|value| httpdate::parse_http_date(value).ok()),
            if_none_match: header_text(headers, header::IF_NONE_MATCH).map(etag_list),
            if_match: header_text(headers, header::IF_MATCH).map(etag_list),
            if_range: header_text(headers, header::IF_RANGE).map(|value| value.trim().to_string()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.if_modified_since.is_none() && self.if_none_match.is_none() && self.if_match.is_none() && self.if_range.is_none()
    }
}

fn header_text(headers: &HeaderMap, name: header::HeaderName) -> Option<&str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn etag_list(value: &str) -> Vec<String> {
    value.split(',').map(|tag| tag.trim().trim_start_matches("W/").to_string()).filter(|tag| !tag.is_empty()).collect()
}

#[derive(Debug)]
pub struct Receiver {
    header: RequestHeader,
    method_flag: Option<StageFlags>,
    path: String,
    extension: Option<String>,
    host_name: Option<String>,
    framing: BodyFraming,
    pub(crate) remaining_content: u64,
    pub(crate) received_content: u64,
    pub(crate) chunk_eof: bool,
    pub(crate) read_complete: bool,
    pub(crate) ranges: Option<Vec<ByteRange>>,
    conditions: Conditions,
    expect_continue: bool,
    keep_alive_hint: Option<i32>,
    pub(crate) alias: Option<Arc<Alias>>,
    pub(crate) location: Option<Arc<Location>>,
    pub(crate) dir: Option<Arc<DirBlock>>,
}

impl Receiver {
    /// Interprets a parsed header. The receiver is usable even when a rejection is returned.
    pub(crate) fn new(header: RequestHeader, framing: BodyFraming, limits: &Limits) -> (Self, Option<Rejection>) {
        let mut rejection = None;
        let mut reject = |status: StatusCode, message: String, fatal: bool| {
            rejection.get_or_insert(Rejection { status, message, fatal });
        };

        let method_flag = StageFlags::from_method(header.method());
        if method_flag.is_none() {
            reject(StatusCode::METHOD_NOT_ALLOWED, format!("Unknown method {}", header.method()), true);
        }

        let path = match normalize_path(header.uri().path()) {
            Some(path) => path,
            None => {
                reject(StatusCode::BAD_REQUEST, format!("Bad URL path {}", header.uri().path()), true);
                "/".to_string()
            }
        };

        if let BodyFraming::Length(length) = framing
            && length >= limits.receive_body_size
        {
            reject(StatusCode::PAYLOAD_TOO_LARGE, format!("Request content length {length} is too big. Limit {}", limits.receive_body_size), true);
        }

        let ranges = match header.header_str(header::RANGE) {
            Some(value) => {
                let ranges = range::parse_ranges(value);
                if ranges.is_none() {
                    reject(StatusCode::RANGE_NOT_SATISFIABLE, format!("Bad range {value}"), false);
                }
                ranges
            }
            None => None,
        };

        let remaining_content = match framing {
            BodyFraming::Length(length) => length,
            BodyFraming::Chunked | BodyFraming::UntilClose => u64::MAX,
            BodyFraming::Empty => 0,
        };

        let receiver = Self {
            method_flag,
            extension: extension_of(&path),
            path,
            host_name: header.header_str(header::HOST).map(strip_port).map(str::to_ascii_lowercase),
            framing,
            remaining_content,
            received_content: 0,
            chunk_eof: false,
            read_complete: remaining_content == 0,
            ranges,
            conditions: Conditions::from_headers(header.headers()),
            expect_continue: header.header_str(header::EXPECT).is_some_and(|value| value.eq_ignore_ascii_case("100-continue")),
            keep_alive_hint: keep_alive_hint(&header),
            alias: None,
            location: None,
            dir: None,
            header,
        };
        (receiver, rejection)
    }

    /// A `GET /` request standing in for a header that could not be parsed.
    pub(crate) fn synthesized() -> Self {
        let request = Request::builder().method(Method::GET).uri("/").version(Version::HTTP_11).body(()).unwrap_or_default();
        let (receiver, _) = Self::new(RequestHeader::from(request), BodyFraming::Empty, &Limits::default());
        receiver
    }

    pub fn method(&self) -> &Method {
        self.header.method()
    }

    /// The method bit, `None` for methods the engine does not serve.
    pub fn method_flag(&self) -> Option<StageFlags> {
        self.method_flag
    }

    pub fn uri(&self) -> &Uri {
        self.header.uri()
    }

    pub fn version(&self) -> Version {
        self.header.version()
    }

    pub fn protocol(&self) -> &'static str {
        if self.version() == Version::HTTP_10 { "HTTP/1.0" } else { "HTTP/1.1" }
    }

    pub fn headers(&self) -> &HeaderMap {
        self.header.headers()
    }

    pub fn header_str(&self, name: impl header::AsHeaderName) -> Option<&str> {
        self.header.header_str(name)
    }

    /// The decoded and normalised request path.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> Option<&str> {
        self.uri().query()
    }

    /// Extension of the last path segment, alphanumeric characters only.
    pub fn extension(&self) -> Option<&str> {
        self.extension.as_deref()
    }

    /// The `Host` header as sent, port included.
    pub fn host(&self) -> Option<&str> {
        self.header.header_str(header::HOST)
    }

    /// The lower cased host name without port.
    pub fn host_name(&self) -> Option<&str> {
        self.host_name.as_deref()
    }

    pub fn framing(&self) -> BodyFraming {
        self.framing
    }

    pub fn is_chunked(&self) -> bool {
        self.framing.is_chunked()
    }

    /// True when body bytes follow the header block.
    pub fn has_body(&self) -> bool {
        !self.framing.is_empty()
    }

    pub fn received_content(&self) -> u64 {
        self.received_content
    }

    pub fn is_read_complete(&self) -> bool {
        self.read_complete
    }

    pub fn ranges(&self) -> Option<&[ByteRange]> {
        self.ranges.as_deref()
    }

    pub fn conditions(&self) -> &Conditions {
        &self.conditions
    }

    pub fn expects_continue(&self) -> bool {
        self.expect_continue
    }

    pub fn alias(&self) -> Option<&Arc<Alias>> {
        self.alias.as_ref()
    }

    pub fn location(&self) -> Option<&Arc<Location>> {
        self.location.as_ref()
    }

    pub fn dir(&self) -> Option<&Arc<DirBlock>> {
        self.dir.as_ref()
    }

    /// Rewrites the path for an internal redirect.
    pub(crate) fn set_path(&mut self, path: String) {
        self.extension = extension_of(&path);
        self.path = path;
    }

    pub(crate) fn clear_ranges(&mut self) {
        self.ranges = None;
    }

    pub(crate) fn keep_alive_hint(&self) -> Option<i32> {
        self.keep_alive_hint
    }
}

/// Keep-alive budget implied by the request: `-1` to close, `0` for a last request.
fn keep_alive_hint(header: &RequestHeader) -> Option<i32> {
    let has_token = |token: &str| {
        header.headers().get_all(header::CONNECTION).iter().filter_map(|value| value.to_str().ok()).flat_map(|value| value.split(',')).any(|t| t.trim().eq_ignore_ascii_case(token))
    };
    if has_token("close") {
        return Some(-1);
    }
    if header.version() == Version::HTTP_10 && !has_token("keep-alive") {
        return Some(0);
    }
    let last = header
        .header_str("keep-alive")
        .is_some_and(|value| value.split(',').any(|param| param.trim().strip_prefix("max=").is_some_and(|max| max.trim() == "1")));
    if last { Some(0) } else { None }
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return host.find(']').map_or(host, |end| &host[..=end]);
    }
    host.rsplit_once(':').map_or(host, |(name, _)| name)
}

fn extension_of(path: &str) -> Option<String> {
    let segment = path.rsplit('/').next()?;
    let (_, extension) = segment.rsplit_once('.')?;
    let extension: String = extension.chars().take_while(char::is_ascii_alphanumeric).collect();
    if extension.is_empty() { None } else { Some(extension.to_ascii_lowercase()) }
}

/// Percent-decodes a request path and resolves `.` and `..` segments.
///
/// Duplicate slashes collapse and a trailing slash is kept. Returns `None` for
/// bad escapes, non UTF-8 paths, embedded NULs and paths escaping the root.
pub(crate) fn normalize_path(raw: &str) -> Option<String> {
    let decoded = String::from_utf8(percent_decode(raw.as_bytes())?).ok()?;
    if !decoded.starts_with('/') || decoded.contains('\0') {
        return None;
    }

    let mut segments = Vec::new();
    for segment in decoded.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop()?;
            }
            segment => segments.push(segment),
        }
    }

    let trailing = decoded.ends_with('/') || decoded.ends_with("/.") || decoded.ends_with("/..");
    let mut path = String::with_capacity(decoded.len());
    for segment in &segments {
        path.push('/');
        path.push_str(segment);
    }
    if path.is_empty() || trailing {
        path.push('/');
    }
    Some(path)
}

fn percent_decode(bytes: &[u8]) -> Option<Vec<u8>> {
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut iter = bytes.iter();
    while let Some(&b) = iter.next() {
        if b == b'%' {
            let hi = hex_value(*iter.next()?)?;
            let lo = hex_value(*iter.next()?)?;
            decoded.push(hi << 4 | lo);
        } else {
            decoded.push(b);
        }
    }
    Some(decoded)
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

impl HttpConn {
    /// Moves buffered body bytes into the receive chain.
    ///
    /// Plain bodies are cut at the declared length so bytes of a pipelined request
    /// stay in the input buffer. Chunked bodies are handed to the chunk filter as
    /// they arrive and the filter gives back what follows the last chunk.
    pub(crate) fn process_content(&mut self) -> bool {
        let Some(rx_head) = self.pipeline.as_ref().and_then(|pipeline| pipeline.rx_head) else {
            self.rx.read_complete = true;
            self.set_state(ConnState::Process);
            return true;
        };

        if self.rx.is_chunked() {
            if !self.rx.read_complete && !self.input.is_empty() {
                let data = self.input.split();
                trace!(bytes = data.len(), "chunked body input");
                self.put(rx_head, Packet::from_bytes(data));
            }
        } else if !self.rx.read_complete {
            let available = u64::try_from(self.input.len()).unwrap_or(u64::MAX);
            let take = self.rx.remaining_content.min(available);
            if take > 0 {
                let data = self.input.split_to(usize::try_from(take).unwrap_or(usize::MAX));
                self.rx.remaining_content -= take;
                self.rx.received_content += take;
                if self.rx.received_content >= self.limits.receive_body_size {
                    let message = format!("Request body is too big. Limit {}", self.limits.receive_body_size);
                    self.conn_error(StatusCode::PAYLOAD_TOO_LARGE, &message);
                    return true;
                }
                self.put(rx_head, Packet::from_bytes(data));
            }
            let until_close_done = self.rx.framing == BodyFraming::UntilClose && self.is_peer_closed() && self.input.is_empty();
            if self.rx.remaining_content == 0 || until_close_done {
                self.rx.remaining_content = 0;
                self.rx.read_complete = true;
                self.put(rx_head, Packet::end());
            }
        }
        self.service_queues();

        if self.state >= ConnState::Error {
            return true;
        }
        if self.rx.read_complete {
            debug!(received = self.rx.received_content, "request body complete");
            self.set_state(ConnState::Process);
            return true;
        }
        if self.is_peer_closed() {
            self.conn_error(status::local(status::COMMS_ERROR), "Connection lost before the request body was received");
            return true;
        }
        false
    }
}
