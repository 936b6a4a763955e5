//! The pass handler.
//!
//! Serves responses whose content is already decided before the pipeline runs:
//! error pages, redirects, OPTIONS and TRACE. The transmitter builds the body from
//! its alt body when the header is written, so the handler only has to finish.

use std::sync::Arc;

use crate::conn::HttpConn;
use crate::queue::QueueId;
use crate::stage::{PASS_HANDLER, Stage, StageDef, StageFlags};

pub(crate) struct PassHandler;

impl Stage for PassHandler {
    fn open(&self, conn: &mut HttpConn, q: QueueId) {
        let size = usize::try_from(conn.limits().transmission_body_size).unwrap_or(usize::MAX);
        conn.queues_mut()[q].set_limits(size, size);
    }

    fn process(&self, conn: &mut HttpConn, _q: QueueId) {
        conn.finalize();
    }
}

pub(crate) fn definition() -> StageDef {
    StageDef::new(PASS_HANDLER, StageFlags::HANDLER | StageFlags::ALL | StageFlags::VIRTUAL, Arc::new(PassHandler))
}
