//! HTTP codec module for the wire formats the pipeline speaks
//!
//! The pipeline moves packets, not parsed messages, so the codecs here work on the
//! edges only:
//!
//! - [`header`]: [`HeaderDecoder`] turns the request header block into a
//!   [`RequestHeader`](crate::protocol::RequestHeader) plus its body framing, and
//!   [`HeaderEncoder`] serializes the status line and response headers into the
//!   header packet
//! - [`body`]: [`ChunkedDecoder`] and [`ChunkedEncoder`] implement the chunked
//!   transfer coding used by the chunk filter
//!
//! All of them implement the `tokio_util::codec` traits, so they can also be used
//! with a `Framed` transport outside the engine.
//!
//! # Example
//!
//! ```
//! use bytes::BytesMut;
//! use pipe_http::codec::HeaderDecoder;
//! use pipe_http::Limits;
//! use tokio_util::codec::Decoder;
//!
//! let mut buf = BytesMut::from("GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n");
//! let (header, framing) = HeaderDecoder::new(&Limits::default()).decode(&mut buf).unwrap().unwrap();
//! assert_eq!(header.uri().path(), "/index.html");
//! assert!(framing.is_empty());
//! ```

use std::io;

use bytes::{BufMut, BytesMut};

pub mod body;
pub mod header;

pub use body::{ChunkFrame, ChunkedDecoder, ChunkedEncoder};
pub use header::{HeaderDecoder, HeaderEncoder, ResponseHead};

/// `io::Write` adapter over a `BytesMut` so `write!` can format straight into it.
pub(crate) struct FastWrite<'a>(pub(crate) &'a mut BytesMut);

impl io::Write for FastWrite<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.put_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
