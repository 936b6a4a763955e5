//! Test support: an in-memory transport, temporary document roots and a driver
//! loop standing in for the embedding server.

use std::collections::VecDeque;
use std::fs;
use std::io::{self, IoSlice};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::BytesMut;

use tokio_util::codec::Decoder;

use crate::codec::ChunkedDecoder;
use crate::conn::{HttpConn, Wants};
use crate::engine::HttpEngine;
use crate::host::{Host, Location};
use crate::limits::Limits;
use crate::protocol::PayloadItem;
use crate::stage::{Stage, StageFlags, StageRegistry};
use crate::transport::Transport;

#[derive(Debug, Default)]
struct MemState {
    input: VecDeque<Vec<u8>>,
    eof: bool,
    output: Vec<u8>,
    write_budget: Option<usize>,
    read_error: Option<io::ErrorKind>,
    write_error: Option<io::ErrorKind>,
    secure: bool,
    shut_down: bool,
    writes: usize,
}

/// A scripted transport. Clones share state, so a test keeps one clone to feed
/// input and inspect output while the connection owns the other.
#[derive(Debug, Clone, Default)]
pub(crate) struct MemTransport {
    state: Arc<Mutex<MemState>>,
}

impl MemTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut MemState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    /// Queues bytes delivered by one `read_buf` call.
    pub(crate) fn push_input(&self, bytes: impl AsRef<[u8]>) {
        self.with(|state| state.input.push_back(bytes.as_ref().to_vec()));
    }

    /// Reads return `Ok(0)` once the queued input is consumed.
    pub(crate) fn close_input(&self) {
        self.with(|state| state.eof = true);
    }

    /// Total bytes accepted before writes return `WouldBlock`. `None` is unlimited.
    pub(crate) fn set_write_budget(&self, budget: Option<usize>) {
        self.with(|state| state.write_budget = budget);
    }

    pub(crate) fn fail_reads(&self, kind: io::ErrorKind) {
        self.with(|state| state.read_error = Some(kind));
    }

    pub(crate) fn fail_writes(&self, kind: io::ErrorKind) {
        self.with(|state| state.write_error = Some(kind));
    }

    pub(crate) fn set_secure(&self, secure: bool) {
        self.with(|state| state.secure = secure);
    }

    pub(crate) fn output(&self) -> Vec<u8> {
        self.with(|state| state.output.clone())
    }

    pub(crate) fn output_string(&self) -> String {
        String::from_utf8_lossy(&self.output()).into_owned()
    }

    pub(crate) fn take_output(&self) -> String {
        let output = self.with(|state| std::mem::take(&mut state.output));
        String::from_utf8_lossy(&output).into_owned()
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.with(|state| state.shut_down)
    }

    pub(crate) fn write_calls(&self) -> usize {
        self.with(|state| state.writes)
    }

    fn has_input(&self) -> bool {
        self.with(|state| !state.input.is_empty() || state.eof || state.read_error.is_some())
    }

    fn can_write(&self) -> bool {
        self.with(|state| state.write_error.is_some() || state.write_budget != Some(0))
    }
}

impl Transport for MemTransport {
    fn read_buf(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        self.with(|state| {
            if let Some(kind) = state.read_error.take() {
                return Err(kind.into());
            }
            match state.input.pop_front() {
                Some(chunk) => {
                    buf.extend_from_slice(&chunk);
                    Ok(chunk.len())
                }
                None if state.eof => Ok(0),
                None => Err(io::ErrorKind::WouldBlock.into()),
            }
        })
    }

    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        self.with(|state| {
            state.writes += 1;
            if let Some(kind) = state.write_error.take() {
                return Err(kind.into());
            }
            let total: usize = bufs.iter().map(|buf| buf.len()).sum();
            let allowed = state.write_budget.map_or(total, |budget| budget.min(total));
            if allowed == 0 && total > 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let mut left = allowed;
            for buf in bufs {
                let n = left.min(buf.len());
                state.output.extend_from_slice(&buf[..n]);
                left -= n;
            }
            if let Some(budget) = &mut state.write_budget {
                *budget -= allowed;
            }
            Ok(allowed)
        })
    }

    fn is_secure(&self) -> bool {
        self.with(|state| state.secure)
    }

    fn shutdown(&mut self) -> io::Result<()> {
        self.with(|state| state.shut_down = true);
        Ok(())
    }
}

/// Calls the connection the way a server would until it waits on something the
/// transport cannot provide.
pub(crate) fn drive(conn: &mut HttpConn, transport: &MemTransport) {
    for _ in 0..100_000 {
        match conn.wants() {
            Wants::Read if transport.has_input() => conn.on_readable(),
            Wants::Write if transport.can_write() => conn.on_writable(),
            _ => return,
        }
    }
    panic!("connection did not settle");
}

/// Serves `request` on a fresh connection and returns everything written.
pub(crate) fn serve(engine: &Arc<HttpEngine>, request: &str) -> String {
    String::from_utf8_lossy(&serve_bytes(engine, request)).into_owned()
}

pub(crate) fn serve_bytes(engine: &Arc<HttpEngine>, request: &str) -> Vec<u8> {
    let transport = MemTransport::new();
    transport.push_input(request);
    let mut conn = HttpConn::new(Arc::clone(engine), transport.clone());
    drive(&mut conn, &transport);
    transport.output()
}

/// An engine serving `root` with the default location set.
pub(crate) fn engine_for(root: &Path) -> Arc<HttpEngine> {
    engine_with(Host::builder("localhost", root).build().unwrap(), Limits::default())
}

pub(crate) fn engine_with(host: Host, limits: Limits) -> Arc<HttpEngine> {
    HttpEngine::builder().server_name("pipe-test").limits(limits).default_host(host).build().unwrap()
}

/// An engine whose root location is served by `stage`, registered as a virtual handler.
pub(crate) fn engine_with_handler(root: &Path, name: &str, stage: Arc<dyn Stage>) -> Arc<HttpEngine> {
    let registry = StageRegistry::builder().builtins().handler(name, StageFlags::HANDLER | StageFlags::ALL | StageFlags::VIRTUAL, stage).build().unwrap();
    let host = Host::builder("localhost", root).location(Location::new("/").handler(name)).build().unwrap();
    HttpEngine::builder().server_name("pipe-test").registry(Arc::new(registry)).default_host(host).build().unwrap()
}

/// Decodes a complete chunked body.
pub(crate) fn dechunk(body: &[u8]) -> Vec<u8> {
    let mut src = BytesMut::from(body);
    let mut decoder = ChunkedDecoder::new();
    let mut decoded = Vec::new();
    loop {
        match decoder.decode(&mut src).unwrap() {
            Some(PayloadItem::Chunk(bytes)) => decoded.extend_from_slice(&bytes),
            Some(PayloadItem::Eof) => break,
            None => panic!("chunked body is truncated"),
        }
    }
    assert!(src.is_empty(), "bytes after the last chunk");
    decoded
}

/// Splits a response into its head and body at the first blank line.
pub(crate) fn split_response(response: &str) -> (&str, &str) {
    response.split_once("\r\n\r\n").unwrap_or((response, ""))
}

/// A directory under the system temp dir, removed on drop.
#[derive(Debug)]
pub(crate) struct TempDir {
    path: PathBuf,
}

impl TempDir {
    pub(crate) fn new(name: &str) -> Self {
        static NEXT: AtomicUsize = AtomicUsize::new(0);
        let unique = NEXT.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!("pipe-http-{name}-{}-{unique}", std::process::id()));
        let _ = fs::remove_dir_all(&path);
        fs::create_dir_all(&path).unwrap();
        Self { path }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn write(&self, name: &str, contents: impl AsRef<[u8]>) -> PathBuf {
        let path = self.path.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, contents).unwrap();
        path
    }

    pub(crate) fn mkdir(&self, name: &str) -> PathBuf {
        let path = self.path.join(name);
        fs::create_dir_all(&path).unwrap();
        path
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}
