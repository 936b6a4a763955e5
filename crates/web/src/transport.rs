#[cfg(target_os = "linux")]
use std::fs::File;
use std::io::{self, IoSlice};
use std::sync::Arc;

use bytes::BytesMut;
use pipe_http::Transport;
use tokio::net::TcpStream;
#[cfg(target_os = "linux")]
use tracing::trace;

/// A tokio [`TcpStream`] as seen by the engine.
///
/// Every call is a non-blocking `try_*` call; the driver awaits readiness on
/// its own handle to the same stream.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    stream: Arc<TcpStream>,
}

impl TcpTransport {
    pub fn new(stream: Arc<TcpStream>) -> Self {
        Self { stream }
    }

    pub fn stream(&self) -> &Arc<TcpStream> {
        &self.stream
    }
}

impl Transport for TcpTransport {
    fn read_buf(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        self.stream.try_read_buf(buf)
    }

    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        self.stream.try_write_vectored(bufs)
    }

    /// Writes `head` and hands the file region to the kernel with `sendfile(2)`.
    #[cfg(target_os = "linux")]
    fn send_file(&mut self, head: &[IoSlice<'_>], file: &File, offset: u64, len: usize) -> io::Result<usize> {
        use std::os::fd::AsRawFd;
        use tokio::io::Interest;

        let head_len: usize = head.iter().map(|slice| slice.len()).sum();
        let mut written = 0;
        if head_len > 0 {
            written = self.stream.try_write_vectored(head)?;
            if written < head_len || len == 0 {
                return Ok(written);
            }
        }

        let mut offset = libc::off_t::try_from(offset).map_err(|_overflow| io::Error::from(io::ErrorKind::InvalidInput))?;
        let socket = self.stream.as_raw_fd();
        let sent = self.stream.try_io(Interest::WRITABLE, || {
            // SAFETY: both descriptors stay open for the duration of the call and
            // `offset` is a valid, exclusively borrowed off_t.
            let sent = unsafe { libc::sendfile(socket, file.as_raw_fd(), &raw mut offset, len) };
            usize::try_from(sent).map_err(|_negative| io::Error::last_os_error())
        });
        match sent {
            Ok(sent) => {
                trace!(sent, len, "sendfile");
                Ok(written + sent)
            }
            Err(_) if written > 0 => Ok(written),
            Err(e) => Err(e),
        }
    }

    fn shutdown(&mut self) -> io::Result<()> {
        shutdown_socket(&self.stream)
    }
}

#[cfg(target_os = "linux")]
fn shutdown_socket(stream: &TcpStream) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    // SAFETY: the descriptor is owned by `stream`, which outlives the call.
    let result = unsafe { libc::shutdown(stream.as_raw_fd(), libc::SHUT_RDWR) };
    if result == 0 { Ok(()) } else { Err(io::Error::last_os_error()) }
}

/// Without `shutdown(2)` the socket closes when the last handle is dropped.
#[cfg(not(target_os = "linux"))]
fn shutdown_socket(_stream: &TcpStream) -> io::Result<()> {
    Ok(())
}
