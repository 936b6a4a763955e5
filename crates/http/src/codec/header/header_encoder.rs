//! HTTP header encoder for serializing response headers
//!
//! The transmitter builds the final header map just before the connector's first
//! write and hands it to [`HeaderEncoder`] together with the status line. The
//! result becomes the content of the header packet.
//!
//! When the body is chunked the blank line ending the header block is not written
//! here: the first chunk prefix (`"\r\n%x\r\n"`) supplies it.

use std::io::Write;

use bytes::{BufMut, BytesMut};
use http::{HeaderMap, StatusCode, Version};
use tokio_util::codec::Encoder;
use tracing::error;

use crate::codec::FastWrite;
use crate::protocol::{SendError, status};

/// Initial buffer size allocated for header serialization
const INIT_HEADER_SIZE: usize = 1024;

/// Everything needed to write a response header block.
#[derive(Debug)]
pub struct ResponseHead<'a> {
    pub version: Version,
    pub status: StatusCode,
    pub headers: &'a HeaderMap,
    /// Write the blank line that terminates the header block.
    pub terminate: bool,
}

/// Encoder for HTTP response headers implementing the [`Encoder`] trait.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeaderEncoder;

impl<'a> Encoder<ResponseHead<'a>> for HeaderEncoder {
    type Error = SendError;

    /// Encodes the status line and header fields into `dst`.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP version is neither HTTP/1.0 nor HTTP/1.1.
    fn encode(&mut self, head: ResponseHead<'a>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let protocol = match head.version {
            Version::HTTP_10 => "HTTP/1.0",
            Version::HTTP_11 => "HTTP/1.1",
            v => {
                error!(http_version = ?v, "unsupported http version");
                return Err(SendError::invalid_body(format!("unsupported http version {v:?}")));
            }
        };

        dst.reserve(INIT_HEADER_SIZE);
        write!(FastWrite(dst), "{} {} {}\r\n", protocol, head.status.as_str(), status::reason(head.status))?;

        for (header_name, header_value) in head.headers.iter() {
            dst.put_slice(header_name.as_ref());
            dst.put_slice(b": ");
            dst.put_slice(header_value.as_ref());
            dst.put_slice(b"\r\n");
        }

        if head.terminate {
            dst.put_slice(b"\r\n");
        }
        Ok(())
    }
}
