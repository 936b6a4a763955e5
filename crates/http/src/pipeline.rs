//! Wiring a request pipeline.
//!
//! A pipeline is the handler, the filters the location selects and a connector,
//! each instantiated as a queue per direction in the connection's arena. The
//! transmit chain always exists and always ends in a connector. The receive chain
//! only exists when the request carries a body.

use std::sync::Arc;

use http::StatusCode;
use tracing::{debug, warn};

use crate::conn::HttpConn;
use crate::packet::Packet;
use crate::queue::{Direction, QueueFlags, QueueId};
use crate::stage::{CHUNK_FILTER, StageDef};

/// The queue ids of the current request's pipeline.
#[derive(Debug)]
pub(crate) struct Pipeline {
    pub(crate) handler: Arc<StageDef>,
    /// The handler's transmit queue.
    pub(crate) writeq: QueueId,
    /// The connector's transmit queue.
    pub(crate) connector_q: QueueId,
    /// The handler's receive queue.
    pub(crate) readq: Option<QueueId>,
    /// First receive queue, where body bytes enter.
    pub(crate) rx_head: Option<QueueId>,
    pub(crate) tx_chain: Vec<QueueId>,
    pub(crate) rx_chain: Vec<QueueId>,
}

impl Pipeline {
    fn queues(&self) -> Vec<QueueId> {
        self.tx_chain.iter().chain(&self.rx_chain).copied().collect()
    }
}

/// Builds and opens the pipeline for the current request.
pub(crate) fn create(conn: &mut HttpConn, handler: Arc<StageDef>) {
    let registry = Arc::clone(conn.engine.registry());
    let location = conn.rx.location.clone();
    let size = conn.limits.stage_buffer_size;
    conn.tx.handler = Some(Arc::clone(&handler));

    let mut tx_stages = vec![Arc::clone(&handler)];
    for name in location.iter().flat_map(|location| location.output_filter_names()) {
        let Some(filter) = registry.get(name) else {
            warn!(filter = %name, "output filter is not registered");
            continue;
        };
        if filter.accepts_extension(conn.tx.extension()) && filter.ops().matches(conn, &filter, Direction::Transmit) {
            tx_stages.push(filter);
        }
    }
    let connector = conn.tx.connector.clone().unwrap_or_else(|| Arc::clone(conn.engine.net_connector()));
    conn.tx.connector = Some(Arc::clone(&connector));
    tx_stages.push(connector);

    let mut rx_stages = Vec::new();
    if !conn.rx.read_complete && !conn.is_error() {
        rx_stages.push(Arc::clone(conn.engine.net_connector()));
        for name in location.iter().flat_map(|location| location.input_filter_names()) {
            let Some(filter) = registry.get(name) else {
                warn!(filter = %name, "input filter is not registered");
                continue;
            };
            if filter.ops().matches(conn, &filter, Direction::Receive) {
                rx_stages.push(filter);
            }
        }
        if conn.rx.is_chunked() && !rx_stages.iter().any(|stage| stage.name() == CHUNK_FILTER) {
            match registry.get(CHUNK_FILTER) {
                Some(chunk) => rx_stages.insert(1, chunk),
                None => conn.conn_error(StatusCode::NOT_IMPLEMENTED, "Chunked request bodies are not supported"),
            }
        }
        rx_stages.push(Arc::clone(&handler));
        if conn.is_error() {
            rx_stages.clear();
        }
    }

    conn.queues.clear();
    let tx_chain = add_chain(conn, &tx_stages, Direction::Transmit, size);
    let rx_chain = add_chain(conn, &rx_stages, Direction::Receive, size);
    for &rq in &rx_chain {
        let paired = tx_chain.iter().copied().find(|&tq| Arc::ptr_eq(conn.queues[tq].stage(), conn.queues[rq].stage()));
        if let Some(tq) = paired {
            conn.queues.pair(tq, rq);
        }
    }

    let writeq = tx_chain[0];
    let connector_q = tx_chain[tx_chain.len() - 1];
    conn.queues.put_for_service(writeq, Packet::header(), false);
    debug!(
        handler = handler.name(),
        tx = ?tx_chain.iter().map(|&q| conn.queues[q].stage().name()).collect::<Vec<_>>(),
        rx = ?rx_chain.iter().map(|&q| conn.queues[q].stage().name()).collect::<Vec<_>>(),
        "pipeline created"
    );

    let pipeline = Pipeline { handler, writeq, connector_q, readq: rx_chain.last().copied(), rx_head: rx_chain.first().copied(), tx_chain, rx_chain };
    let queues = pipeline.queues();
    conn.pipeline = Some(pipeline);

    for q in queues {
        let pair_open = conn.queues[q].pair().is_some_and(|pair| conn.queues[pair].flags.contains(QueueFlags::OPEN));
        if pair_open {
            continue;
        }
        conn.queues[q].flags.insert(QueueFlags::OPEN);
        let ops = Arc::clone(conn.queues[q].stage().ops());
        ops.open(conn, q);
    }
}

fn add_chain(conn: &mut HttpConn, stages: &[Arc<StageDef>], direction: Direction, size: usize) -> Vec<QueueId> {
    let chain: Vec<QueueId> = stages.iter().map(|stage| conn.queues.add(Arc::clone(stage), direction, size)).collect();
    for link in chain.windows(2) {
        conn.queues.link(link[0], link[1]);
    }
    chain
}

/// Calls `start` once per stage instance.
pub(crate) fn start(conn: &mut HttpConn) {
    let Some(queues) = conn.pipeline.as_ref().map(Pipeline::queues) else {
        return;
    };
    for q in queues {
        let pair_started = conn.queues[q].pair().is_some_and(|pair| conn.queues[pair].flags.contains(QueueFlags::STARTED));
        if pair_started || !conn.queues[q].flags.contains(QueueFlags::OPEN) {
            continue;
        }
        conn.queues[q].flags.insert(QueueFlags::STARTED);
        let ops = Arc::clone(conn.queues[q].stage().ops());
        ops.start(conn, q);
        if conn.is_error() {
            return;
        }
    }
}

/// Tells the handler all input has arrived.
pub(crate) fn process(conn: &mut HttpConn) {
    let Some((writeq, ops)) = conn.pipeline.as_ref().map(|pipeline| (pipeline.writeq, Arc::clone(pipeline.handler.ops()))) else {
        return;
    };
    ops.process(conn, writeq);
}

/// Closes every opened stage and releases the queues.
pub(crate) fn destroy(conn: &mut HttpConn) {
    let Some(queues) = conn.pipeline.as_ref().map(Pipeline::queues) else {
        return;
    };
    for q in queues {
        if !conn.queues[q].flags.contains(QueueFlags::OPEN) {
            continue;
        }
        conn.queues[q].flags.remove(QueueFlags::OPEN);
        let ops = Arc::clone(conn.queues[q].stage().ops());
        ops.close(conn, q);
    }
    conn.pipeline = None;
    conn.queues.clear();
    conn.tx.file = None;
}
