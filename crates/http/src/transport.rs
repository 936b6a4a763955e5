//! The byte stream a connection reads requests from and writes responses to.
//!
//! The engine never blocks and never awaits: every call on a [`Transport`] must
//! return `WouldBlock` instead of waiting. The embedding server decides when to
//! call the connection again.

use std::fs::File;
use std::io::{self, IoSlice, Read, Seek, SeekFrom};

use bytes::BytesMut;

/// Largest file region copied per call by the default [`Transport::send_file`].
const SEND_FILE_BUFFER: usize = 64 * 1024;

pub trait Transport: Send {
    /// Reads whatever is available into `buf`. `Ok(0)` means the peer closed.
    fn read_buf(&mut self, buf: &mut BytesMut) -> io::Result<usize>;

    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize>;

    /// Writes `head` followed by `len` bytes of `file` starting at `offset`.
    ///
    /// Returns the bytes written, counting `head` first. The default copies the
    /// file region through a bounded buffer; transports that can hand the file to
    /// the kernel override it.
    fn send_file(&mut self, head: &[IoSlice<'_>], file: &File, offset: u64, len: usize) -> io::Result<usize> {
        let head_len: usize = head.iter().map(|slice| slice.len()).sum();
        let mut written = 0;
        if head_len > 0 {
            written = self.write_vectored(head)?;
            if written < head_len || len == 0 {
                return Ok(written);
            }
        }

        let mut buf = vec![0u8; len.min(SEND_FILE_BUFFER)];
        let mut reader = file;
        let read = match reader.seek(SeekFrom::Start(offset)).and_then(|_| reader.read(&mut buf)) {
            Ok(0) if written == 0 => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(read) => read,
            Err(_) if written > 0 => return Ok(written),
            Err(e) => return Err(e),
        };
        if read == 0 {
            return Ok(written);
        }

        match self.write_vectored(&[IoSlice::new(&buf[..read])]) {
            Ok(n) => Ok(written + n),
            Err(_) if written > 0 => Ok(written),
            Err(e) => Err(e),
        }
    }

    /// True when the stream is encrypted. Encrypted streams cannot send files by reference.
    fn is_secure(&self) -> bool {
        false
    }

    fn shutdown(&mut self) -> io::Result<()> {
        Ok(())
    }
}
