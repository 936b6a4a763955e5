//! HTTP header decoder implementation for parsing HTTP request headers
//!
//! This module decodes the request line and header block of a request from raw bytes
//! into a [`RequestHeader`] and determines how the request body is framed.
//!
//! # Features
//!
//! - Efficient zero-copy header parsing using `httparse`
//! - Support for HTTP/1.0 and HTTP/1.1
//! - Memory safety through `MaybeUninit` for header allocation
//! - Header size, header count and URI length limits taken from [`Limits`]
//! - Body framing selection based on `Content-Length` and `Transfer-Encoding`
//!
//! # Implementation Details
//!
//! The decoder works in multiple stages:
//!
//! 1. Parse raw bytes using `httparse`
//! 2. Record header name/value byte ranges
//! 3. Convert to typed `http::Request` structure
//! 4. Determine the body framing based on headers
//!
//! The implementation uses an index-based approach to avoid copying header data,
//! recording the byte ranges of header names and values for efficient conversion
//! to the final header structure.

use std::mem::MaybeUninit;

use bytes::BytesMut;
use http::{HeaderName, HeaderValue, Method, Request};
use httparse::{Error, Status};
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::ensure;
use crate::limits::Limits;
use crate::protocol::{BodyFraming, ParseError, RequestHeader};

/// Upper bound of header lines the decoder can record, whatever the limits say.
const MAX_HEADER_NUM: usize = 64;

/// Decoder for HTTP request headers implementing the [`Decoder`] trait.
///
/// This decoder parses raw bytes into a structured [`RequestHeader`] and determines the
/// [`BodyFraming`] based on the Content-Length and Transfer-Encoding headers.
#[derive(Debug, Clone, Copy)]
pub struct HeaderDecoder {
    max_header_bytes: usize,
    max_header_num: usize,
    max_uri_len: usize,
}

impl HeaderDecoder {
    pub fn new(limits: &Limits) -> Self {
        Self {
            max_header_bytes: limits.header_size,
            max_header_num: limits.header_count.min(MAX_HEADER_NUM),
            max_uri_len: limits.uri_size,
        }
    }
}

impl Default for HeaderDecoder {
    fn default() -> Self {
        Self::new(&Limits::default())
    }
}

impl Decoder for HeaderDecoder {
    type Item = (RequestHeader, BodyFraming);
    type Error = ParseError;

    /// Attempts to decode HTTP headers from the provided bytes buffer.
    ///
    /// # Returns
    ///
    /// - `Ok(Some((header, framing)))` if a complete header was successfully parsed
    /// - `Ok(None)` if more data is needed
    /// - `Err(ParseError)` if parsing failed
    ///
    /// # Errors
    ///
    /// Returns `ParseError` if:
    /// - The number of headers exceeds the configured count
    /// - The total header size exceeds the configured size
    /// - The request target is longer than the configured URI size
    /// - The HTTP version is not supported
    /// - Headers contain invalid characters
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Fast path: a valid request needs at least "GET / HTTP/1.1\r\n\r\n"
        if src.len() < 14 {
            return Ok(None);
        }

        let mut req = httparse::Request::new(&mut []);
        // SAFETY: an array of `MaybeUninit` needs no initialization
        let mut headers: [MaybeUninit<httparse::Header>; MAX_HEADER_NUM] = unsafe { MaybeUninit::uninit().assume_init() };

        let parsed_result = req.parse_with_uninit_headers(src, &mut headers).map_err(|e| match e {
            Error::TooManyHeaders => ParseError::too_many_headers(self.max_header_num),
            e => ParseError::invalid_header(e.to_string()),
        });

        match parsed_result? {
            Status::Complete(body_offset) => {
                trace!(header_size = body_offset, "parsed request header");
                ensure!(body_offset <= self.max_header_bytes, ParseError::too_large_header(body_offset, self.max_header_bytes));

                let header_count = req.headers.len();
                ensure!(header_count <= self.max_header_num, ParseError::too_many_headers(self.max_header_num));

                let mut header_index: [HeaderIndex; MAX_HEADER_NUM] = EMPTY_HEADER_INDEX_ARRAY;
                HeaderIndex::record(src, req.headers, &mut header_index);

                let version = match req.version {
                    Some(0) => http::Version::HTTP_10,
                    Some(1) => http::Version::HTTP_11,
                    _ => return Err(ParseError::InvalidVersion(req.version)),
                };

                let method = req.method.ok_or(ParseError::InvalidMethod)?;
                let path = req.path.ok_or(ParseError::InvalidUri)?;
                ensure!(path.len() <= self.max_uri_len, ParseError::uri_too_long(path.len(), self.max_uri_len));

                let mut header_builder = Request::builder()
                    .method(Method::from_bytes(method.as_bytes()).map_err(|_| ParseError::InvalidMethod)?)
                    .uri(path)
                    .version(version);

                let headers = header_builder.headers_mut().ok_or(ParseError::InvalidUri)?;
                headers.reserve(header_count);

                let header_bytes = src.split_to(body_offset).freeze();
                for index in &header_index[..header_count] {
                    let name = HeaderName::from_bytes(&header_bytes[index.name.0..index.name.1])
                        .map_err(|e| ParseError::invalid_header(e.to_string()))?;

                    // SAFETY: httparse verified the value only holds visible ASCII and whitespace
                    let value = unsafe { HeaderValue::from_maybe_shared_unchecked(header_bytes.slice(index.value.0..index.value.1)) };

                    headers.append(name, value);
                }

                let header = RequestHeader::from(header_builder.body(()).map_err(|_| ParseError::InvalidUri)?);
                let framing = parse_framing(&header)?;

                Ok(Some((header, framing)))
            }
            Status::Partial => {
                ensure!(src.len() <= self.max_header_bytes, ParseError::too_large_header(src.len(), self.max_header_bytes));
                Ok(None)
            }
        }
    }
}

/// Stores the byte range positions of a header's name and value within the original buffer.
#[derive(Clone, Copy)]
struct HeaderIndex {
    name: (usize, usize),
    value: (usize, usize),
}

const EMPTY_HEADER_INDEX: HeaderIndex = HeaderIndex { name: (0, 0), value: (0, 0) };

const EMPTY_HEADER_INDEX_ARRAY: [HeaderIndex; MAX_HEADER_NUM] = [EMPTY_HEADER_INDEX; MAX_HEADER_NUM];

impl HeaderIndex {
    /// Records the byte positions of header names and values from the parsed headers.
    fn record(bytes: &[u8], headers: &[httparse::Header<'_>], indices: &mut [HeaderIndex]) {
        let bytes_ptr = bytes.as_ptr() as usize;
        for (header, indices) in headers.iter().zip(indices.iter_mut()) {
            let name_start = header.name.as_ptr() as usize - bytes_ptr;
            let name_end = name_start + header.name.len();
            indices.name = (name_start, name_end);
            let value_start = header.value.as_ptr() as usize - bytes_ptr;
            let value_end = value_start + header.value.len();
            indices.value = (value_start, value_end);
        }
    }
}

/// Determines how the request body is framed.
///
/// refer: <https://www.rfc-editor.org/rfc/rfc9112.html#name-message-body-length>
///
/// # Errors
///
/// Returns `ParseError` if:
/// - Both Content-Length and Transfer-Encoding headers are present
/// - Content-Length is repeated with different values or is not a number
fn parse_framing(header: &RequestHeader) -> Result<BodyFraming, ParseError> {
    let te_header = header.headers().get(http::header::TRANSFER_ENCODING);
    let mut cl_values = header.headers().get_all(http::header::CONTENT_LENGTH).iter();
    let cl_header = cl_values.next();

    match (te_header, cl_header) {
        (None, None) => {
            let is_upload = matches!(header.method(), &Method::POST | &Method::PUT);
            if is_upload && header.version() == http::Version::HTTP_10 {
                Ok(BodyFraming::UntilClose)
            } else {
                Ok(BodyFraming::Empty)
            }
        }

        (te_value @ Some(_), None) => {
            if is_chunked(te_value) {
                Ok(BodyFraming::Chunked)
            } else {
                Err(ParseError::invalid_header("unsupported transfer-encoding"))
            }
        }

        (None, Some(cl_value)) => {
            if cl_values.any(|other| other != cl_value) {
                return Err(ParseError::invalid_content_length("conflicting content-length values"));
            }

            let cl_str = cl_value.to_str().map_err(|_| ParseError::invalid_content_length("value can't to_str"))?;

            let length =
                cl_str.trim().parse::<u64>().map_err(|_| ParseError::invalid_content_length(format!("value {cl_str} is not u64")))?;

            Ok(BodyFraming::Length(length))
        }

        (Some(_), Some(_)) => Err(ParseError::invalid_content_length("transfer_encoding and content_length both present in headers")),
    }
}

/// Checks if the Transfer-Encoding header indicates chunked encoding.
///
/// According to RFC 7230, chunked must be the last encoding if present.
fn is_chunked(header_value: Option<&HeaderValue>) -> bool {
    const CHUNKED: &[u8] = b"chunked";
    if let Some(value) = header_value
        && let Some(bytes) = value.as_bytes().rsplit(|b| *b == b',').next()
    {
        return bytes.trim_ascii().eq_ignore_ascii_case(CHUNKED);
    }
    false
}
