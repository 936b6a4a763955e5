//! Framing for chunked response bodies.
//!
//! The chunk filter does not copy body bytes. It only asks this encoder for the
//! prefix that goes in front of each data packet. The header block is left open
//! by the transmitter when chunking, so every prefix starts with the CRLF that
//! closes the previous part.

use std::io::Write;

use bytes::BytesMut;
use tokio_util::codec::Encoder;

use crate::codec::FastWrite;
use crate::protocol::SendError;

/// What the next prefix introduces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkFrame {
    /// A data chunk of the given size.
    Data(usize),
    /// The terminating zero sized chunk.
    Last,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChunkedEncoder {
    eof: bool,
    chunks: usize,
}

impl ChunkedEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_finished(&self) -> bool {
        self.eof
    }

    /// Number of data chunks framed so far.
    pub fn chunks(&self) -> usize {
        self.chunks
    }
}

impl Encoder<ChunkFrame> for ChunkedEncoder {
    type Error = SendError;

    fn encode(&mut self, frame: ChunkFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if self.eof {
            return Err(SendError::invalid_body("chunked body already terminated"));
        }

        match frame {
            // an empty chunk would terminate the body
            ChunkFrame::Data(0) => Ok(()),
            ChunkFrame::Data(size) => {
                self.chunks += 1;
                write!(FastWrite(dst), "\r\n{size:x}\r\n")?;
                Ok(())
            }
            ChunkFrame::Last => {
                self.eof = true;
                dst.extend_from_slice(b"\r\n0\r\n\r\n");
                Ok(())
            }
        }
    }
}
