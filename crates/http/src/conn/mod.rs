//! The connection state machine.
//!
//! An [`HttpConn`] owns everything one client connection needs: the transport,
//! the input buffer, the [`Receiver`] and [`Transmitter`] of the current request
//! and the queues of its pipeline. It never blocks. The embedding server asks
//! [`HttpConn::wants`] what to wait for and reports readiness back through the
//! `on_*` event methods, which advance the state machine as far as the available
//! input and output allow.
//!
//! # States
//!
//! ```text
//! Begin -> Started -> [Wait] -> Parsed -> [Content] -> Process -> Running -> Complete
//!                                 \__________________________________/
//!                                          any -> Error -> Complete
//! ```
//!
//! After `Complete` the connection either returns to `Begin` for the next request
//! on a kept-alive connection or closes. States never move backwards within a
//! request, and every transition is reported to the engine's
//! [`StateListener`](crate::StateListener)s.

use std::fmt;
use std::io::{self, IoSlice};
use std::sync::Arc;
use std::time::Instant;

use bytes::{Buf, Bytes, BytesMut};
use http::{StatusCode, Version};
use tokio_util::codec::Decoder;
use tracing::{debug, error, info, trace, warn};

use crate::codec::HeaderDecoder;
use crate::engine::HttpEngine;
use crate::host::Host;
use crate::limits::Limits;
use crate::matcher;
use crate::packet::Packet;
use crate::pipeline::{self, Pipeline};
use crate::protocol::status;
use crate::queue::{Direction, QueueFlags, QueueId, Queues};
use crate::transport::Transport;
use crate::utils::{escape_html, flags};

mod receiver;
mod transmitter;
mod worker;

pub use receiver::{Conditions, Receiver};
pub use transmitter::{FileInfo, Transmitter};
pub use worker::{WorkerEvent, WorkerMessage, WorkerOutput};

use worker::WorkerChannel;

/// Request processing states, in the order a request moves through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnState {
    /// Waiting for the first byte of a request.
    Begin,
    /// Part of a request line has arrived.
    Started,
    /// The request line is complete, the header block is not.
    Wait,
    Parsed,
    /// Reading the request body.
    Content,
    Process,
    Running,
    Error,
    Complete,
}

/// What the connection waits for before it can make progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wants {
    Read,
    Write,
    /// Waiting on a worker or the deadline only.
    Idle,
    Close,
}

flags! {
    pub(crate) struct ConnFlags: u8 {
        const ERROR = 0x1;
        const CONN_ERROR = 0x2;
        const WRITE_BLOCKED = 0x4;
        const PEER_CLOSED = 0x8;
        const CLOSING = 0x10;
        const CLOSED = 0x20;
        const SERVICING = 0x40;
    }
}

pub struct HttpConn {
    pub(crate) engine: Arc<HttpEngine>,
    pub(crate) limits: Limits,
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) state: ConnState,
    flags: ConnFlags,
    pub(crate) input: BytesMut,
    pub(crate) rx: Receiver,
    pub(crate) tx: Transmitter,
    pub(crate) queues: Queues,
    pub(crate) pipeline: Option<Pipeline>,
    pub(crate) keep_alive_count: i32,
    pub(crate) host: Option<Arc<Host>>,
    secure: bool,
    started: Instant,
    last_activity: Instant,
    seqno: u64,
    worker: WorkerChannel,
    decoder: HeaderDecoder,
    /// Unsent rest of an interim `100 Continue` response.
    interim: Option<Bytes>,
}

impl HttpConn {
    pub fn new(engine: Arc<HttpEngine>, transport: impl Transport + 'static) -> Self {
        let limits = engine.limits().clone();
        let now = Instant::now();
        Self {
            decoder: HeaderDecoder::new(&limits),
            keep_alive_count: limits.keep_alive_count,
            input: BytesMut::with_capacity(limits.buffer_size),
            host: engine.default_host().cloned(),
            secure: transport.is_secure(),
            transport: Box::new(transport),
            state: ConnState::Begin,
            flags: ConnFlags::empty(),
            rx: Receiver::synthesized(),
            tx: Transmitter::new(),
            queues: Queues::new(),
            pipeline: None,
            started: now,
            last_activity: now,
            seqno: 0,
            worker: WorkerChannel::new(),
            interim: None,
            engine,
            limits,
        }
    }

    pub fn engine(&self) -> &Arc<HttpEngine> {
        &self.engine
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn rx(&self) -> &Receiver {
        &self.rx
    }

    pub fn tx(&self) -> &Transmitter {
        &self.tx
    }

    pub fn tx_mut(&mut self) -> &mut Transmitter {
        &mut self.tx
    }

    pub fn queues(&self) -> &Queues {
        &self.queues
    }

    pub fn queues_mut(&mut self) -> &mut Queues {
        &mut self.queues
    }

    /// The host serving the current request.
    pub fn host(&self) -> Option<&Arc<Host>> {
        self.host.as_ref()
    }

    /// Selects the host for the current request. Listeners call this at [`ConnState::Parsed`].
    pub fn set_host(&mut self, host: Arc<Host>) {
        self.host = Some(host);
    }

    /// The handler's transmit queue.
    pub fn writeq(&self) -> Option<QueueId> {
        self.pipeline.as_ref().map(|pipeline| pipeline.writeq)
    }

    /// The handler's receive queue, present when the request has a body.
    pub fn readq(&self) -> Option<QueueId> {
        self.pipeline.as_ref().and_then(|pipeline| pipeline.readq)
    }

    pub fn is_error(&self) -> bool {
        self.flags.contains(ConnFlags::ERROR)
    }

    pub fn is_conn_error(&self) -> bool {
        self.flags.contains(ConnFlags::CONN_ERROR)
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn is_closing(&self) -> bool {
        self.flags.contains(ConnFlags::CLOSING)
    }

    pub fn is_closed(&self) -> bool {
        self.flags.contains(ConnFlags::CLOSED)
    }

    pub fn is_peer_closed(&self) -> bool {
        self.flags.contains(ConnFlags::PEER_CLOSED)
    }

    pub fn is_write_blocked(&self) -> bool {
        self.flags.contains(ConnFlags::WRITE_BLOCKED)
    }

    /// Requests left on this connection before it closes.
    pub fn keep_alive_count(&self) -> i32 {
        self.keep_alive_count
    }

    /// Number of the current request on this connection, starting at 1.
    pub fn seqno(&self) -> u64 {
        self.seqno
    }

    /// Hands `packet` to the data callback of the stage owning `q`.
    pub fn put(&mut self, q: QueueId, packet: Packet) {
        let ops = Arc::clone(self.queues[q].stage().ops());
        match self.queues[q].direction() {
            Direction::Transmit => ops.outgoing_data(self, q, packet),
            Direction::Receive => ops.incoming_data(self, q, packet),
        }
    }

    /// Hands `packet` to the queue after `q`. On the last queue it is kept on `q`.
    pub fn put_next(&mut self, q: QueueId, packet: Packet) {
        match self.queues[q].next() {
            Some(next) => self.put(next, packet),
            None => self.queues.put_for_service(q, packet, false),
        }
    }

    /// Runs the service routines of scheduled queues until the schedule is empty.
    ///
    /// Calls made while servicing return at once; the running loop picks up
    /// whatever they scheduled.
    pub fn service_queues(&mut self) {
        if self.flags.contains(ConnFlags::SERVICING) {
            return;
        }
        self.flags.insert(ConnFlags::SERVICING);
        while let Some(q) = self.queues.next_scheduled() {
            if self.queues[q].flags.contains(QueueFlags::DISABLED) {
                continue;
            }
            let ops = Arc::clone(self.queues[q].stage().ops());
            self.queues[q].flags.insert(QueueFlags::SERVICING);
            trace!(stage = self.queues[q].stage().name(), count = self.queues[q].count(), "service queue");
            match self.queues[q].direction() {
                Direction::Transmit => ops.outgoing_service(self, q),
                Direction::Receive => ops.incoming_service(self, q),
            }
            if self.queues.is_empty() {
                break;
            }
            let queue = &mut self.queues[q];
            queue.flags.remove(QueueFlags::SERVICING);
            queue.flags.insert(QueueFlags::SERVICED);
            if queue.flags.contains(QueueFlags::RESERVICE) {
                queue.flags.remove(QueueFlags::RESERVICE);
                self.queues.schedule(q);
            }
        }
        self.flags.remove(ConnFlags::SERVICING);
    }

    /// Fails the current request with `status`.
    ///
    /// The first error of a request wins. Before the response header is written
    /// the response becomes an HTML error page. Afterwards the queued body still
    /// goes out with its framing intact and the connection closes once the
    /// response ends.
    pub fn error(&mut self, status: StatusCode, message: &str) {
        if self.is_error() {
            debug!(status = status.as_u16(), message, "request already failed");
            return;
        }
        warn!(status = status.as_u16(), uri = %self.rx.uri(), message, "request error");
        self.flags.insert(ConnFlags::ERROR);
        self.tx.set_status(status);

        if self.tx.headers_created() {
            // Packets already in flight keep their framing; the close ends the response.
            self.keep_alive_count = -1;
        } else {
            self.tx.alt_body = Some(format!("<h2>Access Error: {} -- {}</h2>\r\n<p>{}</p>\r\n", status.as_u16(), status::reason(status), escape_html(message)));
            if let Some(pipeline) = &self.pipeline {
                for &q in &pipeline.tx_chain {
                    self.queues.discard(q, true);
                }
            }
            self.tx.omit_body();
        }
        if !self.rx.read_complete {
            // The unread body would be taken for the next request.
            self.keep_alive_count = -1;
        }
        if self.state > ConnState::Parsed && self.state < ConnState::Error {
            self.set_state(ConnState::Error);
        }
    }

    /// Fails the request and closes the connection after the response.
    pub fn conn_error(&mut self, status: StatusCode, message: &str) {
        self.flags.insert(ConnFlags::CONN_ERROR);
        self.keep_alive_count = -1;
        self.error(status, message);
    }

    /// Runs `job` on a blocking worker thread.
    ///
    /// The job reports through its [`WorkerOutput`]; the events are applied when
    /// the driver passes them to [`HttpConn::on_worker_event`]. Without a tokio
    /// runtime the job runs inline and its events are applied before returning.
    pub fn run_on_worker<F>(&mut self, job: F)
    where
        F: FnOnce(WorkerOutput) + Send + 'static,
    {
        let output = self.worker.output(self.seqno);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                trace!(seqno = self.seqno, "job handed to worker");
                drop(handle.spawn_blocking(move || job(output)));
            }
            Err(_no_runtime) => {
                job(output);
                while let Some(message) = self.worker.try_next() {
                    self.apply_worker_event(message);
                }
            }
        }
    }

    /// Waits for the next event posted by a worker job.
    pub async fn next_worker_event(&mut self) -> Option<WorkerMessage> {
        self.worker.next().await
    }

    /// Reads what the transport has and processes it.
    pub fn on_readable(&mut self) {
        if self.is_closed() {
            return;
        }
        self.last_activity = Instant::now();
        self.input.reserve(self.limits.buffer_size);
        match self.transport.read_buf(&mut self.input) {
            Ok(0) => {
                trace!(seqno = self.seqno, "peer closed");
                self.flags.insert(ConnFlags::PEER_CLOSED);
            }
            Ok(n) => trace!(bytes = n, "read"),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => return,
            Err(e) => self.io_failure(&e),
        }
        self.advance();
    }

    /// Resumes output after the transport became writable again.
    pub fn on_writable(&mut self) {
        if self.is_closed() {
            return;
        }
        self.last_activity = Instant::now();
        self.flags.remove(ConnFlags::WRITE_BLOCKED);
        self.worker.set_write_blocked(false);
        if !self.flush_interim() {
            return;
        }
        if let Some(connector_q) = self.pipeline.as_ref().map(|pipeline| pipeline.connector_q) {
            self.queues.enable(connector_q);
        }
        self.service_queues();
        self.advance();
    }

    /// Applies an event posted by a worker job.
    pub fn on_worker_event(&mut self, message: WorkerMessage) {
        self.last_activity = Instant::now();
        self.apply_worker_event(message);
        self.advance();
    }

    /// Fails the connection once its deadline has passed.
    pub fn on_timeout(&mut self) {
        if self.is_closed() {
            return;
        }
        if self.state == ConnState::Begin && self.input.is_empty() {
            debug!(seqno = self.seqno, "idle connection expired");
            self.close();
            return;
        }
        warn!(state = ?self.state, uri = %self.rx.uri(), "request timed out");
        self.flags.insert(ConnFlags::CLOSING | ConnFlags::CONN_ERROR);
        self.keep_alive_count = -1;
        self.set_state(ConnState::Error);
        self.set_state(ConnState::Complete);
        self.close();
    }

    pub fn wants(&self) -> Wants {
        if self.is_closed() {
            return Wants::Close;
        }
        if self.is_write_blocked() {
            return Wants::Write;
        }
        match self.state {
            ConnState::Begin | ConnState::Started | ConnState::Wait | ConnState::Content if !self.is_peer_closed() => Wants::Read,
            _ => Wants::Idle,
        }
    }

    /// When [`HttpConn::on_timeout`] is due.
    ///
    /// Between requests only the inactivity timeout applies. While a request is
    /// in progress the request timeout also applies.
    pub fn expire(&self) -> Instant {
        let inactive = self.last_activity + self.limits.inactivity_timeout();
        if self.state == ConnState::Begin { inactive } else { inactive.min(self.started + self.limits.request_timeout()) }
    }

    pub(crate) fn set_state(&mut self, state: ConnState) {
        if state <= self.state {
            return;
        }
        debug!(from = ?self.state, to = ?state, seqno = self.seqno, "state changed");
        self.state = state;
        self.notify(state);
    }

    fn notify(&mut self, state: ConnState) {
        let engine = Arc::clone(&self.engine);
        for listener in engine.listeners() {
            listener.state_changed(self, state);
        }
    }

    pub(crate) fn mark_closing(&mut self) {
        self.flags.insert(ConnFlags::CLOSING);
    }

    pub(crate) fn mark_write_blocked(&mut self) {
        self.flags.insert(ConnFlags::WRITE_BLOCKED);
        self.worker.set_write_blocked(true);
    }

    /// Abandons the request after the transport failed.
    ///
    /// Queued output is dropped and nothing more is written.
    pub(crate) fn io_failure(&mut self, cause: &io::Error) {
        error!(cause = %cause, seqno = self.seqno, "connection i/o failed");
        self.flags.insert(ConnFlags::CLOSING | ConnFlags::CONN_ERROR | ConnFlags::ERROR);
        self.keep_alive_count = -1;
        for q in self.queues.ids() {
            self.queues.discard(q, true);
        }
        self.tx.set_write_complete();
        if self.state < ConnState::Parsed {
            self.close();
        } else {
            self.set_state(ConnState::Error);
        }
    }

    fn apply_worker_event(&mut self, message: WorkerMessage) {
        if message.seqno != self.seqno || self.pipeline.is_none() || self.is_closed() {
            trace!(seqno = message.seqno, "dropping stale worker event");
            return;
        }
        match message.event {
            WorkerEvent::Write(bytes) => {
                if let Some(writeq) = self.writeq()
                    && !self.tx.is_finalized()
                {
                    self.put(writeq, Packet::data(&bytes));
                }
            }
            WorkerEvent::Finalize => self.finalize(),
            WorkerEvent::Error(status, message) => self.error(status, &message),
        }
        self.service_queues();
    }

    /// Runs the state machine until it needs an event.
    fn advance(&mut self) {
        loop {
            if self.is_closed() {
                return;
            }
            let progressed = match self.state {
                ConnState::Begin | ConnState::Started | ConnState::Wait => self.parse_incoming(),
                ConnState::Parsed => self.start_pipeline(),
                ConnState::Content => self.process_content(),
                ConnState::Process => self.process_pipeline(),
                ConnState::Running => self.service_pipeline(),
                ConnState::Error => self.service_error(),
                ConnState::Complete => self.process_completion(),
            };
            if !progressed {
                return;
            }
        }
    }

    fn parse_incoming(&mut self) -> bool {
        if self.state == ConnState::Begin {
            let blank = self.input.iter().take_while(|b| matches!(b, b'\r' | b'\n')).count();
            self.input.advance(blank);
            if self.input.is_empty() {
                if self.is_peer_closed() {
                    self.close();
                }
                return false;
            }
            self.seqno += 1;
            self.started = Instant::now();
            self.set_state(ConnState::Started);
        }

        match self.decoder.decode(&mut self.input) {
            Ok(Some((header, framing))) => {
                let (rx, rejection) = Receiver::new(header, framing, &self.limits);
                self.rx = rx;
                if let Some(hint) = self.rx.keep_alive_hint() {
                    self.keep_alive_count = self.keep_alive_count.min(hint);
                }
                debug!(method = %self.rx.method(), uri = %self.rx.uri(), seqno = self.seqno, "request parsed");
                if let Some(rejection) = rejection {
                    if rejection.fatal {
                        self.conn_error(rejection.status, &rejection.message);
                    } else {
                        self.error(rejection.status, &rejection.message);
                    }
                }
                self.set_state(ConnState::Parsed);
                true
            }
            Ok(None) => {
                if self.state == ConnState::Started && self.input.windows(2).any(|pair| pair == b"\r\n") {
                    self.set_state(ConnState::Wait);
                }
                if self.is_peer_closed() {
                    debug!(buffered = self.input.len(), "peer closed inside a request header");
                    self.close();
                }
                false
            }
            Err(e) => {
                self.rx = Receiver::synthesized();
                self.input.clear();
                self.conn_error(e.status(), &e.to_string());
                self.set_state(ConnState::Parsed);
                true
            }
        }
    }

    fn start_pipeline(&mut self) -> bool {
        let handler = matcher::match_handler(self);
        pipeline::create(self, handler);
        if !self.is_error() {
            pipeline::start(self);
        }
        if self.is_error() {
            self.set_state(ConnState::Error);
        } else if self.rx.read_complete {
            self.set_state(ConnState::Process);
        } else {
            if self.rx.expects_continue() && self.rx.version() == Version::HTTP_11 {
                self.write_continue();
            }
            self.set_state(ConnState::Content);
        }
        true
    }

    fn write_continue(&mut self) {
        const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";
        self.interim = Some(Bytes::from_static(CONTINUE));
        self.flush_interim();
    }

    /// Writes what is left of the interim response. Returns true once nothing is left.
    ///
    /// Until then the connection is write blocked and no other response bytes go out.
    pub(crate) fn flush_interim(&mut self) -> bool {
        while let Some(pending) = self.interim.as_mut() {
            let written = self.transport.write_vectored(&[IoSlice::new(pending)]);
            match written {
                Ok(0) => {
                    self.mark_write_blocked();
                    return false;
                }
                Ok(n) => {
                    pending.advance(n.min(pending.len()));
                    if pending.is_empty() {
                        trace!("sent 100 continue");
                        self.interim = None;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    trace!(left = pending.len(), "100 continue blocked");
                    self.mark_write_blocked();
                    return false;
                }
                Err(e) => {
                    self.interim = None;
                    self.io_failure(&e);
                    return false;
                }
            }
        }
        true
    }

    fn process_pipeline(&mut self) -> bool {
        pipeline::process(self);
        self.set_state(ConnState::Running);
        if let Some(writeq) = self.writeq() {
            self.queues.schedule(writeq);
        }
        self.service_queues();
        true
    }

    fn service_pipeline(&mut self) -> bool {
        self.service_queues();
        if self.tx.is_write_complete() {
            self.set_state(ConnState::Complete);
            return true;
        }
        false
    }

    fn service_error(&mut self) -> bool {
        if self.pipeline.is_some() && !self.is_closing() {
            if self.tx.is_finalized() {
                self.service_queues();
            } else {
                self.finalize();
            }
        }
        if self.pipeline.is_none() || self.tx.is_write_complete() || self.is_closing() {
            self.set_state(ConnState::Complete);
            return true;
        }
        false
    }

    fn process_completion(&mut self) -> bool {
        info!(
            method = %self.rx.method(),
            uri = %self.rx.uri(),
            status = self.tx.status().as_u16(),
            bytes = self.tx.bytes_written(),
            elapsed = ?self.started.elapsed(),
            "request complete"
        );
        pipeline::destroy(self);

        let peer_gone = self.is_peer_closed() && self.input.is_empty();
        if self.keep_alive_count <= 0 || self.is_conn_error() || self.is_closing() || peer_gone {
            self.close();
            return false;
        }
        self.reset_for_next_request();
        true
    }

    fn reset_for_next_request(&mut self) {
        self.rx = Receiver::synthesized();
        self.tx = Transmitter::new();
        self.flags.remove(ConnFlags::ERROR);
        self.host = self.engine.default_host().cloned();
        self.last_activity = Instant::now();
        self.state = ConnState::Begin;
        debug!(seqno = self.seqno, keep_alive = self.keep_alive_count, buffered = self.input.len(), "ready for next request");
        self.notify(ConnState::Begin);
    }

    fn close(&mut self) {
        if self.is_closed() {
            return;
        }
        self.flags.insert(ConnFlags::CLOSED);
        pipeline::destroy(self);
        if let Err(e) = self.transport.shutdown() {
            debug!(cause = %e, "transport shutdown failed");
        }
        debug!(seqno = self.seqno, "connection closed");
    }
}

impl fmt::Debug for HttpConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpConn")
            .field("state", &self.state)
            .field("flags", &self.flags)
            .field("seqno", &self.seqno)
            .field("keep_alive_count", &self.keep_alive_count)
            .field("buffered", &self.input.len())
            .field("host", &self.host.as_ref().map(|host| host.name()))
            .finish()
    }
}
