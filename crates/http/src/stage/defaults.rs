//! Default stage routines.
//!
//! [`Stage`](super::Stage) implementations fall back to these, and custom stages
//! can call them to keep the standard behaviour around their own logic.

use crate::conn::{ConnState, HttpConn};
use crate::packet::Packet;
use crate::queue::QueueId;
use crate::stage::StageFlags;

/// Clamps the queue's packet size to the transmit chunk size when one is set.
pub fn open(conn: &mut HttpConn, q: QueueId) {
    let chunk_size = conn.tx().chunk_size();
    let queue = &mut conn.queues_mut()[q];
    queue.packet_size = match usize::try_from(chunk_size) {
        Ok(chunk_size) if chunk_size > 0 => queue.max.min(chunk_size),
        _ => queue.max,
    };
}

/// Queues the packet for service.
///
/// Output of a handler is not scheduled before the connection is running, so a
/// handler can queue its whole response from `start` or `process` first.
pub fn outgoing_data(conn: &mut HttpConn, q: QueueId, packet: Packet) {
    let is_handler = conn.queues()[q].stage().flags().contains(StageFlags::HANDLER);
    let schedule = !(is_handler && conn.state() < ConnState::Running);
    conn.queues_mut().put_for_service(q, packet, schedule);
}

/// Forwards the packet, or collects the body when this is the last receive queue.
///
/// On the last queue body data is joined into one packet and the zero length end
/// packet is queued behind it.
pub fn incoming_data(conn: &mut HttpConn, q: QueueId, packet: Packet) {
    if conn.queues()[q].next().is_some() {
        conn.put_next(q, packet);
    } else if !packet.is_empty() {
        conn.queues_mut().join_for_service(q, packet, false);
    } else {
        conn.queues_mut().put_for_service(q, packet, false);
    }
}

/// Moves packets downstream until the queue is empty or the next queue is full.
pub fn service(conn: &mut HttpConn, q: QueueId) {
    while let Some(mut packet) = conn.queues_mut().get_packet(q) {
        if !conn.queues_mut().will_next_accept(q, &mut packet) {
            conn.queues_mut().put_back(q, packet);
            return;
        }
        conn.put_next(q, packet);
    }
}
