//! HTTP request header handling.
//!
//! This module wraps the standard `http::Request<()>` produced by the header decoder
//! so the receiver can keep the parsed request line and header map without copying.

use http::request::Parts;
use http::{HeaderMap, Method, Request, Uri, Version};

/// Represents a parsed HTTP request header.
#[derive(Debug)]
pub struct RequestHeader {
    inner: Request<()>,
}

impl AsRef<Request<()>> for RequestHeader {
    fn as_ref(&self) -> &Request<()> {
        &self.inner
    }
}

impl AsMut<Request<()>> for RequestHeader {
    fn as_mut(&mut self) -> &mut Request<()> {
        &mut self.inner
    }
}

impl RequestHeader {
    /// Consumes the header and returns the inner `Request<()>`.
    pub fn into_inner(self) -> Request<()> {
        self.inner
    }

    /// Returns a reference to the request's HTTP method.
    pub fn method(&self) -> &Method {
        self.inner.method()
    }

    /// Returns a reference to the request's URI.
    pub fn uri(&self) -> &Uri {
        self.inner.uri()
    }

    /// Returns the request's HTTP version.
    pub fn version(&self) -> Version {
        self.inner.version()
    }

    /// Returns a reference to the request's headers.
    pub fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    /// Returns a header value as a string, if present and visible ASCII.
    pub fn header_str(&self, name: impl http::header::AsHeaderName) -> Option<&str> {
        self.inner.headers().get(name).and_then(|value| value.to_str().ok())
    }
}

/// Converts request parts into a `RequestHeader`.
impl From<Parts> for RequestHeader {
    #[inline]
    fn from(parts: Parts) -> Self {
        Self { inner: Request::from_parts(parts, ()) }
    }
}

/// Converts a bodyless request into a `RequestHeader`.
impl From<Request<()>> for RequestHeader {
    #[inline]
    fn from(inner: Request<()>) -> Self {
        Self { inner }
    }
}

#[cfg(test)]
mod tests {
    use http::header;

    use super::*;

    #[test]
    fn exposes_request_line_and_headers() {
        let request = Request::builder()
            .method(Method::POST)
            .uri("/upload?name=a")
            .version(Version::HTTP_10)
            .header(header::HOST, "example.com")
            .body(())
            .unwrap();

        let header = RequestHeader::from(request);
        assert_eq!(header.method(), &Method::POST);
        assert_eq!(header.uri().path(), "/upload");
        assert_eq!(header.uri().query(), Some("name=a"));
        assert_eq!(header.version(), Version::HTTP_10);
        assert_eq!(header.header_str(header::HOST), Some("example.com"));
        assert_eq!(header.header_str(header::ACCEPT), None);
    }
}
