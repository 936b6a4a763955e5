//! Handing blocking work to a worker thread.
//!
//! A handler that must block (a slow backend, a large computation) runs the work
//! through [`HttpConn::run_on_worker`](super::HttpConn::run_on_worker). The job
//! gets a [`WorkerOutput`] and reports back with [`WorkerEvent`]s. Events are
//! applied by the connection's own task through
//! [`HttpConn::on_worker_event`](super::HttpConn::on_worker_event), so queues are
//! never touched from the worker thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http::StatusCode;
use tokio::sync::mpsc;

/// What a worker job asks its connection to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// Send response body bytes.
    Write(Bytes),
    /// The response is complete.
    Finalize,
    /// Fail the request.
    Error(StatusCode, String),
}

/// A [`WorkerEvent`] tagged with the request that produced it.
#[derive(Debug)]
pub struct WorkerMessage {
    pub(crate) seqno: u64,
    pub(crate) event: WorkerEvent,
}

impl WorkerMessage {
    pub fn event(&self) -> &WorkerEvent {
        &self.event
    }
}

/// The worker side of the hand-back channel.
#[derive(Debug, Clone)]
pub struct WorkerOutput {
    seqno: u64,
    sender: mpsc::UnboundedSender<WorkerMessage>,
    write_blocked: Arc<AtomicBool>,
}

impl WorkerOutput {
    /// Returns false when the connection is gone.
    pub fn write(&self, bytes: impl Into<Bytes>) -> bool {
        self.send(WorkerEvent::Write(bytes.into()))
    }

    pub fn finalize(&self) -> bool {
        self.send(WorkerEvent::Finalize)
    }

    pub fn error(&self, status: StatusCode, message: impl Into<String>) -> bool {
        self.send(WorkerEvent::Error(status, message.into()))
    }

    /// True while the connection waits for the peer to accept more output.
    pub fn write_blocked(&self) -> bool {
        self.write_blocked.load(Ordering::Acquire)
    }

    fn send(&self, event: WorkerEvent) -> bool {
        self.sender.send(WorkerMessage { seqno: self.seqno, event }).is_ok()
    }
}

#[derive(Debug)]
pub(crate) struct WorkerChannel {
    sender: mpsc::UnboundedSender<WorkerMessage>,
    receiver: mpsc::UnboundedReceiver<WorkerMessage>,
    write_blocked: Arc<AtomicBool>,
}

impl WorkerChannel {
    pub(crate) fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self { sender, receiver, write_blocked: Arc::new(AtomicBool::new(false)) }
    }

    pub(crate) fn output(&self, seqno: u64) -> WorkerOutput {
        WorkerOutput { seqno, sender: self.sender.clone(), write_blocked: Arc::clone(&self.write_blocked) }
    }

    pub(crate) fn try_next(&mut self) -> Option<WorkerMessage> {
        self.receiver.try_recv().ok()
    }

    pub(crate) async fn next(&mut self) -> Option<WorkerMessage> {
        self.receiver.recv().await
    }

    pub(crate) fn set_write_blocked(&self, blocked: bool) {
        self.write_blocked.store(blocked, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_posts_tagged_events() {
        let mut channel = WorkerChannel::new();
        let output = channel.output(7);
        assert!(output.write("abc"));
        assert!(output.error(StatusCode::BAD_GATEWAY, "backend down"));
        assert!(output.finalize());

        let first = channel.try_next().unwrap();
        assert_eq!(first.seqno, 7);
        assert_eq!(first.event(), &WorkerEvent::Write(Bytes::from_static(b"abc")));
        assert_eq!(channel.try_next().unwrap().event, WorkerEvent::Error(StatusCode::BAD_GATEWAY, "backend down".into()));
        assert_eq!(channel.try_next().unwrap().event, WorkerEvent::Finalize);
        assert!(channel.try_next().is_none());
    }

    #[test]
    fn write_blocked_is_shared() {
        let channel = WorkerChannel::new();
        let output = channel.output(1);
        assert!(!output.write_blocked());
        channel.set_write_blocked(true);
        assert!(output.write_blocked());
    }

    #[test]
    fn sending_after_close_reports_false() {
        let channel = WorkerChannel::new();
        let output = channel.output(1);
        drop(channel);
        assert!(!output.finalize());
    }
}
