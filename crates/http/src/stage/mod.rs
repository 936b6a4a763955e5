//! Stages: the reusable behaviours a pipeline is built from.
//!
//! A [`Stage`] is a handler, a filter or a connector. Its callbacks run against the
//! connection and the [`QueueId`] of the queue the stage instance owns in the
//! current pipeline. Stages hold no per request state themselves; anything a stage
//! needs between callbacks goes into its queue with [`Queue::set_data`](crate::queue::Queue::set_data).
//!
//! [`StageDef`] is the immutable, shareable template describing a stage: its name,
//! its [`StageFlags`], an optional extension set and the callbacks. Templates are
//! collected in a [`StageRegistry`] which is frozen before any connection is served.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use http::Method;

use crate::conn::HttpConn;
use crate::packet::Packet;
use crate::queue::{Direction, QueueId};
use crate::utils::flags;

pub mod defaults;
mod registry;

pub use registry::{StageRegistry, StageRegistryBuilder, global, install};

pub const PASS_HANDLER: &str = "passHandler";
pub const FILE_HANDLER: &str = "fileHandler";
pub const DIR_HANDLER: &str = "dirHandler";
pub const CHUNK_FILTER: &str = "chunkFilter";
pub const RANGE_FILTER: &str = "rangeFilter";
pub const NET_CONNECTOR: &str = "netConnector";
pub const SEND_CONNECTOR: &str = "sendConnector";

flags! {
    /// Capability bits of a stage: the methods it serves, its role and behaviour hints.
    pub struct StageFlags: u32 {
        const GET = 0x1;
        const HEAD = 0x2;
        const POST = 0x4;
        const PUT = 0x8;
        const DELETE = 0x10;
        const OPTIONS = 0x20;
        const TRACE = 0x40;
        const ALL = 0x7f;

        const HANDLER = 0x100;
        const FILTER = 0x200;
        const CONNECTOR = 0x400;
        const MODULE = 0x800;

        /// Wants query and form variables.
        const VARS = 0x1000;
        /// Wants an environment built from the request.
        const ENV_VARS = 0x2000;
        /// Wants path info split off the script name.
        const PATH_INFO = 0x4000;
        /// Serves resources that do not map to the file system.
        const VIRTUAL = 0x8000;
        /// Wants directories redirected to their index.
        const AUTO_DIR = 0x10000;
        /// Requires the mapped file to exist.
        const VERIFY_ENTITY = 0x20000;
        /// Runs its blocking work on a worker thread.
        const THREAD = 0x40000;
    }
}

impl StageFlags {
    /// The method bit for a request method, `None` for methods the engine does not know.
    pub fn from_method(method: &Method) -> Option<StageFlags> {
        let flag = match *method {
            Method::GET => Self::GET,
            Method::HEAD => Self::HEAD,
            Method::POST => Self::POST,
            Method::PUT => Self::PUT,
            Method::DELETE => Self::DELETE,
            Method::OPTIONS => Self::OPTIONS,
            Method::TRACE => Self::TRACE,
            _ => return None,
        };
        Some(flag)
    }

    pub fn methods(self) -> StageFlags {
        self & Self::ALL
    }
}

/// Callbacks of a pipeline stage.
///
/// Every callback has a default. Data callbacks default to the routines in
/// [`defaults`], which forward packets downstream under flow control.
/// `outgoing_service` and `incoming_service` may be called again at any time,
/// including when there is nothing to do.
#[allow(unused_variables, reason = "default callbacks ignore their arguments")]
pub trait Stage: Send + Sync {
    /// Custom match run during handler selection and filter insertion.
    fn matches(&self, conn: &HttpConn, stage: &StageDef, direction: Direction) -> bool {
        true
    }

    /// Called once the pipeline is wired.
    fn open(&self, conn: &mut HttpConn, q: QueueId) {
        defaults::open(conn, q)
    }

    /// Called after the request headers are parsed and the pipeline is open.
    fn start(&self, conn: &mut HttpConn, q: QueueId) {}

    /// Called once all input has been received. Handlers must eventually finalize.
    fn process(&self, conn: &mut HttpConn, q: QueueId) {}

    /// Called when the pipeline is torn down.
    fn close(&self, conn: &mut HttpConn, q: QueueId) {}

    fn incoming_data(&self, conn: &mut HttpConn, q: QueueId, packet: Packet) {
        defaults::incoming_data(conn, q, packet)
    }

    fn incoming_service(&self, conn: &mut HttpConn, q: QueueId) {
        defaults::service(conn, q)
    }

    fn outgoing_data(&self, conn: &mut HttpConn, q: QueueId, packet: Packet) {
        defaults::outgoing_data(conn, q, packet)
    }

    fn outgoing_service(&self, conn: &mut HttpConn, q: QueueId) {
        defaults::service(conn, q)
    }
}

/// An immutable stage template.
pub struct StageDef {
    name: String,
    flags: StageFlags,
    extensions: Option<HashSet<String>>,
    ops: Arc<dyn Stage>,
}

impl StageDef {
    pub fn new(name: impl Into<String>, flags: StageFlags, ops: Arc<dyn Stage>) -> Self {
        Self { name: name.into(), flags, extensions: None, ops }
    }

    /// Restricts the stage to responses whose file extension is in `extensions`.
    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extensions = Some(extensions.into_iter().map(Into::into).collect());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn flags(&self) -> StageFlags {
        self.flags
    }

    pub fn ops(&self) -> &Arc<dyn Stage> {
        &self.ops
    }

    pub fn extensions(&self) -> Option<&HashSet<String>> {
        self.extensions.as_ref()
    }

    /// True when the stage has no extension set or `extension` is in it.
    pub fn accepts_extension(&self, extension: Option<&str>) -> bool {
        match (&self.extensions, extension) {
            (None, _) => true,
            (Some(set), Some(extension)) => set.contains(extension),
            (Some(_), None) => false,
        }
    }

    pub fn is_handler(&self) -> bool {
        self.flags.contains(StageFlags::HANDLER)
    }

    pub fn is_filter(&self) -> bool {
        self.flags.contains(StageFlags::FILTER)
    }

    pub fn is_connector(&self) -> bool {
        self.flags.contains(StageFlags::CONNECTOR)
    }

    /// A shallow copy under a new name sharing the same callbacks.
    pub(crate) fn clone_as(&self, name: impl Into<String>) -> Self {
        Self { name: name.into(), flags: self.flags, extensions: self.extensions.clone(), ops: Arc::clone(&self.ops) }
    }
}

impl fmt::Debug for StageDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageDef").field("name", &self.name).field("flags", &self.flags).field("extensions", &self.extensions).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    impl Stage for Noop {}

    #[test]
    fn method_bits() {
        assert_eq!(StageFlags::from_method(&Method::GET), Some(StageFlags::GET));
        assert_eq!(StageFlags::from_method(&Method::TRACE), Some(StageFlags::TRACE));
        assert_eq!(StageFlags::from_method(&Method::CONNECT), None);
        assert!(StageFlags::ALL.contains(StageFlags::DELETE | StageFlags::OPTIONS));
        assert_eq!((StageFlags::HANDLER | StageFlags::GET).methods(), StageFlags::GET);
    }

    #[test]
    fn extension_binding() {
        let stage = StageDef::new("gzipFilter", StageFlags::FILTER, Arc::new(Noop));
        assert!(stage.accepts_extension(None));

        let bound = stage.clone_as("cssGzipFilter").with_extensions(["css", "js"]);
        assert_eq!(bound.name(), "cssGzipFilter");
        assert!(bound.accepts_extension(Some("css")));
        assert!(!bound.accepts_extension(Some("html")));
        assert!(!bound.accepts_extension(None));
        assert!(Arc::ptr_eq(stage.ops(), bound.ops()));
    }
}
