//! Decoder for chunked request bodies.
//!
//! The chunk filter feeds the bytes that follow a request header into this decoder
//! until it reports [`PayloadItem::Eof`]. Anything left in the buffer after that
//! belongs to the next pipelined request.
//!
//! Chunk extensions and trailer fields are consumed and dropped.
//!
//! See [RFC 9112 Section 7.1](https://www.rfc-editor.org/rfc/rfc9112#section-7.1).

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::protocol::{ParseError, PayloadItem};

/// Position inside the chunked framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Frame {
    /// Hex digits of a chunk size.
    SizeDigits,
    /// Blanks between the size and an extension or the CR.
    SizeBlanks,
    /// A chunk extension, skipped up to the CR.
    Extension,
    /// The LF closing a size line.
    SizeLf,
    /// Payload bytes of the current chunk.
    Payload,
    PayloadCr,
    PayloadLf,
    /// Start of a trailer field or of the final CRLF.
    TrailerStart,
    /// Inside a trailer field.
    TrailerField,
    /// The LF closing a trailer field.
    TrailerLf,
    /// The LF closing the body.
    FinalLf,
    Done,
}

/// Incremental decoder for a chunked request body.
///
/// The decoder keeps its position between calls, so a body may arrive split at any
/// byte. `max_chunk` bounds the size of the chunks handed out: one large chunk on
/// the wire becomes several packets in the receive queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkedDecoder {
    frame: Frame,
    /// Payload bytes of the current chunk not yet handed out.
    pending: u64,
    max_chunk: usize,
    decoded: u64,
    /// Framing and payload bytes consumed so far.
    consumed: u64,
}

impl ChunkedDecoder {
    /// Creates a decoder positioned before the size line of the first chunk.
    pub fn new() -> Self {
        Self::with_max_chunk(usize::MAX)
    }

    pub fn with_max_chunk(max_chunk: usize) -> Self {
        Self { frame: Frame::SizeDigits, pending: 0, max_chunk: max_chunk.max(1), decoded: 0, consumed: 0 }
    }

    /// True once the terminating zero sized chunk and its trailers were consumed.
    pub fn is_complete(&self) -> bool {
        self.frame == Frame::Done
    }

    /// Body bytes decoded so far.
    pub fn decoded(&self) -> u64 {
        self.decoded
    }

    fn bad(&self, reason: &'static str) -> ParseError {
        ParseError::bad_chunk(self.consumed, reason)
    }

    /// Hands out up to `max_chunk` payload bytes of the current chunk.
    fn take_payload(&mut self, src: &mut BytesMut) -> PayloadItem {
        let len = usize::try_from(self.pending).unwrap_or(usize::MAX).min(src.len()).min(self.max_chunk);
        self.pending -= len as u64;
        self.consumed += len as u64;
        self.decoded += len as u64;
        if self.pending == 0 {
            self.frame = Frame::PayloadCr;
        }
        trace!(len, pending = self.pending, "chunk payload");
        PayloadItem::Chunk(src.split_to(len).freeze())
    }

    /// Moves past one framing byte.
    fn advance(&mut self, byte: u8) -> Result<Frame, ParseError> {
        let next = match (self.frame, byte) {
            (Frame::SizeDigits | Frame::SizeBlanks, b'\r') => Frame::SizeLf,
            (Frame::SizeDigits | Frame::SizeBlanks, b'\t' | b' ') => Frame::SizeBlanks,
            (Frame::SizeDigits | Frame::SizeBlanks, b';') => Frame::Extension,
            (Frame::SizeDigits, digit) => {
                let value = hex_value(digit).ok_or_else(|| self.bad("chunk size is not hexadecimal"))?;
                let pending = self.pending.checked_mul(16).and_then(|size| size.checked_add(value)).ok_or_else(|| self.bad("chunk size overflows"))?;
                self.pending = pending;
                Frame::SizeDigits
            }
            (Frame::SizeBlanks, _) => return Err(self.bad("digit after blanks in chunk size")),
            (Frame::Extension, b'\r') => Frame::SizeLf,
            (Frame::Extension, b'\n') => return Err(self.bad("bare LF in chunk extension")),
            (Frame::Extension, _) => Frame::Extension,
            (Frame::SizeLf, b'\n') if self.pending == 0 => Frame::TrailerStart,
            (Frame::SizeLf, b'\n') => Frame::Payload,
            (Frame::SizeLf, _) => return Err(self.bad("chunk size line not ended by CRLF")),
            (Frame::PayloadCr, b'\r') => Frame::PayloadLf,
            (Frame::PayloadLf, b'\n') => Frame::SizeDigits,
            (Frame::PayloadCr | Frame::PayloadLf, _) => return Err(self.bad("chunk payload not ended by CRLF")),
            (Frame::TrailerStart, b'\r') => Frame::FinalLf,
            (Frame::TrailerStart | Frame::TrailerField, b'\r') => Frame::TrailerLf,
            (Frame::TrailerStart | Frame::TrailerField, _) => Frame::TrailerField,
            (Frame::TrailerLf, b'\n') => Frame::TrailerStart,
            (Frame::TrailerLf, _) => return Err(self.bad("trailer field not ended by CRLF")),
            (Frame::FinalLf, b'\n') => Frame::Done,
            (Frame::FinalLf, _) => return Err(self.bad("chunked body not ended by CRLF")),
            (Frame::Payload | Frame::Done, _) => self.frame,
        };
        self.consumed += 1;
        Ok(next)
    }
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn hex_value(byte: u8) -> Option<u64> {
    char::from(byte).to_digit(16).map(u64::from)
}

impl Decoder for ChunkedDecoder {
    type Item = PayloadItem;
    type Error = ParseError;

    /// Returns the next run of body bytes, [`PayloadItem::Eof`] after the last chunk,
    /// or `None` when `src` ends inside the framing.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.frame {
                Frame::Done => {
                    trace!(decoded = self.decoded, "chunked body complete");
                    return Ok(Some(PayloadItem::Eof));
                }
                _ if src.is_empty() => return Ok(None),
                Frame::Payload => return Ok(Some(self.take_payload(src))),
                _ => {
                    let byte = src.get_u8();
                    self.frame = self.advance(byte)?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn decode_all(decoder: &mut ChunkedDecoder, buffer: &mut BytesMut) -> (Vec<u8>, bool) {
        let mut body = Vec::new();
        while let Some(item) = decoder.decode(buffer).unwrap() {
            match item {
                PayloadItem::Chunk(bytes) => body.extend_from_slice(&bytes),
                PayloadItem::Eof => return (body, true),
            }
        }
        (body, false)
    }

    #[test]
    fn decodes_single_chunk() {
        let mut buffer = BytesMut::from(&b"10\r\n1234567890abcdef\r\n0\r\n\r\n"[..]);
        let mut decoder = ChunkedDecoder::new();

        let item = decoder.decode(&mut buffer).unwrap().unwrap();
        assert!(item.is_chunk());
        assert_eq!(item.as_bytes().unwrap(), &Bytes::from_static(b"1234567890abcdef"));

        assert!(decoder.decode(&mut buffer).unwrap().unwrap().is_eof());
        assert!(decoder.is_complete());
        assert_eq!(decoder.decoded(), 16);
    }

    #[test]
    fn decodes_several_chunks() {
        let mut buffer = BytesMut::from(&b"4\r\nWiki\r\n5\r\npedia\r\nA\r\n in chunks\r\n0\r\n\r\n"[..]);
        let (body, eof) = decode_all(&mut ChunkedDecoder::new(), &mut buffer);
        assert!(eof);
        assert_eq!(body, b"Wikipedia in chunks");
    }

    #[test]
    fn skips_extensions_and_trailers() {
        let mut buffer = BytesMut::from(&b"5 ;name=value\r\nhello\r\n0\r\nExpires: never\r\nX-Sum: 1\r\n\r\n"[..]);
        let (body, eof) = decode_all(&mut ChunkedDecoder::new(), &mut buffer);
        assert!(eof);
        assert_eq!(body, b"hello");
    }

    #[test]
    fn leaves_pipelined_bytes() {
        let mut buffer = BytesMut::from(&b"3\r\nabc\r\n0\r\n\r\nGET / HTTP/1.1\r\n"[..]);
        let (body, eof) = decode_all(&mut ChunkedDecoder::new(), &mut buffer);
        assert!(eof);
        assert_eq!(body, b"abc");
        assert_eq!(&buffer[..], b"GET / HTTP/1.1\r\n");
    }

    #[test]
    fn resumes_at_any_byte() {
        let wire = b"5\r\nhello\r\n0\r\n\r\n";
        let mut decoder = ChunkedDecoder::new();
        let mut buffer = BytesMut::new();
        let mut body = Vec::new();
        let mut eof = false;
        for byte in wire {
            buffer.extend_from_slice(&[*byte]);
            while let Some(item) = decoder.decode(&mut buffer).unwrap() {
                match item {
                    PayloadItem::Chunk(bytes) => body.extend_from_slice(&bytes),
                    PayloadItem::Eof => {
                        eof = true;
                        break;
                    }
                }
            }
        }
        assert!(eof);
        assert_eq!(body, b"hello");
    }

    #[test]
    fn bounds_chunk_size() {
        let mut data = format!("{:x}\r\n", 100).into_bytes();
        data.extend(vec![b'A'; 100]);
        data.extend(b"\r\n0\r\n\r\n");
        let mut buffer = BytesMut::from(&data[..]);
        let mut decoder = ChunkedDecoder::with_max_chunk(32);

        let mut sizes = Vec::new();
        while let Some(PayloadItem::Chunk(bytes)) = decoder.decode(&mut buffer).unwrap() {
            sizes.push(bytes.len());
        }
        assert_eq!(sizes, vec![32, 32, 32, 4]);
        assert!(decoder.is_complete());
    }

    #[test]
    fn reports_where_framing_breaks() {
        let mut buffer = BytesMut::from(&b"xyz\r\n"[..]);
        assert!(matches!(ChunkedDecoder::new().decode(&mut buffer), Err(ParseError::BadChunk { offset: 0, .. })));

        let mut buffer = BytesMut::from(&b"5\r\nhelloBad"[..]);
        let mut decoder = ChunkedDecoder::new();
        assert!(decoder.decode(&mut buffer).unwrap().unwrap().is_chunk());
        assert!(matches!(decoder.decode(&mut buffer), Err(ParseError::BadChunk { offset: 8, .. })));

        let mut buffer = BytesMut::from(&b"5 5\r\n"[..]);
        assert!(ChunkedDecoder::new().decode(&mut buffer).is_err());

        let mut buffer = BytesMut::from(&b"ffffffffffffffffff\r\n"[..]);
        let error = ChunkedDecoder::new().decode(&mut buffer).unwrap_err();
        assert_eq!(error.to_string(), "bad chunk framing at body byte 16: chunk size overflows");
    }
}
