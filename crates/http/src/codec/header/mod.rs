//! HTTP header processing module for encoding and decoding headers
//!
//! # Components
//!
//! - [`HeaderDecoder`]: Decodes HTTP request headers from raw bytes
//!   - Supports HTTP/1.0 and HTTP/1.1 request lines
//!   - Enforces the header size, header count and URI length limits
//!   - Determines the request body framing
//!
//! - [`HeaderEncoder`]: Encodes the response status line and headers
//!   - Optionally leaves the header block open for a chunked body

mod header_decoder;
mod header_encoder;

pub use header_decoder::HeaderDecoder;
pub use header_encoder::HeaderEncoder;
pub use header_encoder::ResponseHead;
