//! The range filter.
//!
//! Cuts the requested byte ranges out of the entity stream. One range becomes a
//! plain `206` body with a `Content-Range` header. Several ranges become a
//! `multipart/byteranges` body whose part headers travel as packet prefixes and
//! whose closing boundary is a data packet of its own. The
//! length of the multipart body is computed up front so the response is never
//! chunked.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::BytesMut;
use http::StatusCode;
use tracing::{debug, trace};

use crate::conn::HttpConn;
use crate::packet::{Packet, PacketFlags};
use crate::protocol::range::{ByteRange, fix_ranges};
use crate::queue::{Direction, QueueFlags, QueueId};
use crate::stage::{RANGE_FILTER, Stage, StageDef, StageFlags, defaults};

pub(crate) struct RangeFilter;

/// Progress through the selected ranges.
#[derive(Debug)]
struct RangeState {
    ranges: Vec<ByteRange>,
    current: usize,
    /// Entity offset of the next byte coming down the queue.
    pos: i64,
    boundary: Option<String>,
    entity_length: i64,
    trailer_sent: bool,
}

impl RangeState {
    fn part_header(&self, range: &ByteRange) -> Option<BytesMut> {
        self.boundary.as_deref().map(|boundary| BytesMut::from(part_header(boundary, range, self.entity_length).as_bytes()))
    }
}

impl Stage for RangeFilter {
    fn matches(&self, conn: &HttpConn, _stage: &StageDef, direction: Direction) -> bool {
        direction == Direction::Transmit && conn.rx().ranges().is_some()
    }

    fn outgoing_service(&self, conn: &mut HttpConn, q: QueueId) {
        if !conn.queues()[q].flags.contains(QueueFlags::SERVICED)
            && let Some(state) = select_ranges(conn)
        {
            conn.queues_mut()[q].set_data(state);
        }
        let Some(mut state) = conn.queues_mut()[q].take_data::<RangeState>() else {
            defaults::service(conn, q);
            return;
        };

        while let Some(mut packet) = conn.queues_mut().get_packet(q) {
            if packet.is_end()
                && !state.trailer_sent
                && let Some(boundary) = &state.boundary
            {
                // The closing boundary is body data queued ahead of the end packet.
                let mut closing = Packet::data(trailer(boundary).as_bytes());
                closing.flags.insert(PacketFlags::RANGE);
                conn.queues_mut().put_back(q, packet);
                conn.queues_mut().put_back(q, closing);
                state.trailer_sent = true;
                continue;
            }
            let trailing = state.current >= state.ranges.len() && packet.flags.contains(PacketFlags::RANGE);
            if packet.is_data() && !packet.is_empty() && !trailing {
                let Some(range) = state.ranges.get(state.current).copied() else {
                    state.pos += packet.len() as i64;
                    continue;
                };
                let end = state.pos + packet.len() as i64;
                if end <= range.start {
                    state.pos = end;
                    continue;
                }
                if state.pos < range.start {
                    let skip = usize::try_from(range.start - state.pos).unwrap_or(0);
                    state.pos = range.start;
                    if let Some(tail) = packet.split(skip) {
                        packet = tail;
                    }
                }
                let keep = usize::try_from(range.end - state.pos).unwrap_or(0);
                if let Some(tail) = packet.split(keep) {
                    conn.queues_mut().put_back(q, tail);
                }
                if state.pos == range.start {
                    packet.prefix = state.part_header(&range);
                }
                packet.flags.insert(PacketFlags::RANGE);
            }

            if !conn.queues_mut().will_next_accept(q, &mut packet) {
                conn.queues_mut().put_back(q, packet);
                break;
            }
            if packet.is_data() {
                state.pos += packet.len() as i64;
                if state.ranges.get(state.current).is_some_and(|range| state.pos >= range.end) {
                    state.current += 1;
                }
            }
            conn.put_next(q, packet);
        }
        conn.queues_mut()[q].set_data(state);
    }
}

/// Resolves the request ranges against the entity and sets up the `206` response.
///
/// Returns `None` when the full entity should be sent instead.
fn select_ranges(conn: &mut HttpConn) -> Option<RangeState> {
    let entity_length = conn.tx().entity_length();
    if conn.is_error() || conn.tx().status() != StatusCode::OK {
        return None;
    }
    let fixed = conn.rx().ranges().map(<[ByteRange]>::to_vec).and_then(|mut ranges| fix_ranges(&mut ranges, entity_length).then_some(ranges));
    let Some(ranges) = fixed else {
        debug!(entity_length, "ranges do not apply, sending the full entity");
        conn.rx.clear_ranges();
        if entity_length >= 0 {
            conn.tx_mut().set_length(entity_length);
        }
        return None;
    };

    conn.tx_mut().set_status(StatusCode::PARTIAL_CONTENT);
    let boundary = if let [range] = ranges.as_slice() {
        conn.tx_mut().set_length(range.len() as i64);
        None
    } else {
        let boundary = make_boundary(conn.seqno());
        let parts: usize = ranges.iter().map(|range| part_header(&boundary, range, entity_length).len() + range.len() as usize).sum();
        let length = parts + trailer(&boundary).len();
        conn.tx_mut().set_length(length as i64);
        conn.tx.range_boundary = Some(boundary.clone());
        Some(boundary)
    };
    trace!(ranges = ranges.len(), length = conn.tx().length(), "serving byte ranges");
    conn.rx.ranges = Some(ranges.clone());
    Some(RangeState { ranges, current: 0, pos: 0, boundary, entity_length, trailer_sent: false })
}

fn make_boundary(seqno: u64) -> String {
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |since| since.subsec_nanos());
    format!("{:08X}{:08X}", nanos, seqno as u32)
}

fn part_header(boundary: &str, range: &ByteRange, entity_length: i64) -> String {
    format!("\r\n--{boundary}\r\nContent-Range: bytes {}-{}/{entity_length}\r\n\r\n", range.start, range.last())
}

fn trailer(boundary: &str) -> String {
    format!("\r\n--{boundary}--\r\n")
}

pub(crate) fn definition() -> StageDef {
    StageDef::new(RANGE_FILTER, StageFlags::FILTER, Arc::new(RangeFilter))
}
