//! Chunked transfer coding.
//!
//! - [`ChunkedDecoder`]: decodes chunked request bodies for the chunk filter's receive side
//! - [`ChunkedEncoder`]: produces the chunk size prefixes for the chunk filter's transmit side
//!
//! Bodies with a declared `Content-Length` need no codec: the receiver slices them
//! straight out of its input buffer.

mod chunked_decoder;
mod chunked_encoder;

pub use chunked_decoder::ChunkedDecoder;
pub use chunked_encoder::ChunkFrame;
pub use chunked_encoder::ChunkedEncoder;
