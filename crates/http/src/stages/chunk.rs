//! The chunk filter.
//!
//! On output it decides the body framing the first time it is serviced. A response
//! that is already complete at that point gets a `Content-Length` instead of being
//! chunked. Otherwise data packets are cut to the chunk size and each gets its chunk
//! header as a prefix, so the body bytes are never copied.
//!
//! On input it decodes a chunked request body and hands the remainder of the buffer,
//! the start of the next pipelined request, back to the connection.

use std::sync::Arc;

use bytes::BytesMut;
use http::StatusCode;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, trace, warn};

use crate::codec::{ChunkFrame, ChunkedDecoder, ChunkedEncoder};
use crate::conn::HttpConn;
use crate::packet::Packet;
use crate::protocol::PayloadItem;
use crate::queue::{Direction, QueueFlags, QueueId};
use crate::stage::{CHUNK_FILTER, Stage, StageDef, StageFlags, defaults};

pub(crate) struct ChunkFilter;

impl Stage for ChunkFilter {
    fn matches(&self, conn: &HttpConn, _stage: &StageDef, direction: Direction) -> bool {
        match direction {
            Direction::Transmit => conn.tx().length() <= 0,
            Direction::Receive => conn.rx().is_chunked(),
        }
    }

    fn outgoing_service(&self, conn: &mut HttpConn, q: QueueId) {
        if !conn.queues()[q].flags.contains(QueueFlags::SERVICED) {
            choose_framing(conn, q);
        }
        let Some(size) = usize::try_from(conn.tx().chunk_size()).ok().filter(|size| *size > 0) else {
            defaults::service(conn, q);
            return;
        };

        let mut encoder = conn.queues_mut()[q].take_data::<ChunkedEncoder>().map_or_else(ChunkedEncoder::new, |encoder| *encoder);
        while let Some(mut packet) = conn.queues_mut().get_packet(q) {
            if packet.is_data() {
                fold_framing(&mut packet);
                if let Some(tail) = packet.split(size) {
                    conn.queues_mut().put_back(q, tail);
                }
            }
            if !conn.queues_mut().will_next_accept(q, &mut packet) {
                conn.queues_mut().put_back(q, packet);
                break;
            }
            frame(&mut encoder, &mut packet);
            conn.put_next(q, packet);
        }
        conn.queues_mut()[q].set_data(encoder);
    }

    fn incoming_data(&self, conn: &mut HttpConn, q: QueueId, mut packet: Packet) {
        if conn.rx.chunk_eof {
            return;
        }
        let Some(mut input) = packet.take_content() else {
            return;
        };
        let max_chunk = conn.queues()[q].packet_size;
        let mut decoder = conn.queues_mut()[q].take_data::<ChunkedDecoder>().map_or_else(|| ChunkedDecoder::with_max_chunk(max_chunk), |decoder| *decoder);

        loop {
            match decoder.decode(&mut input) {
                Ok(Some(PayloadItem::Chunk(bytes))) => {
                    conn.rx.received_content += bytes.len() as u64;
                    if conn.rx.received_content >= conn.limits().receive_body_size {
                        let message = format!("Request body is too big. Limit {}", conn.limits().receive_body_size);
                        conn.conn_error(StatusCode::PAYLOAD_TOO_LARGE, &message);
                        return;
                    }
                    conn.put_next(q, Packet::from_bytes(BytesMut::from(&bytes[..])));
                }
                Ok(Some(PayloadItem::Eof)) => {
                    debug!(received = conn.rx.received_content, leftover = input.len(), "chunked request body complete");
                    input.unsplit(conn.input.split());
                    conn.input = input;
                    conn.rx.chunk_eof = true;
                    conn.rx.remaining_content = 0;
                    conn.rx.read_complete = true;
                    conn.put_next(q, Packet::end());
                    return;
                }
                Ok(None) => break,
                Err(e) => {
                    conn.conn_error(StatusCode::BAD_REQUEST, &format!("Bad chunked request body: {e}"));
                    return;
                }
            }
        }
        conn.queues_mut()[q].set_data(decoder);
    }
}

/// Decides between a known length and chunking on the first service.
fn choose_framing(conn: &mut HttpConn, q: QueueId) {
    let queue = &conn.queues()[q];
    let complete = queue.last().is_some_and(Packet::is_end);
    let (count, max) = (queue.count(), queue.max);
    let tx = conn.tx();

    if tx.chunk_size() > 0 {
        trace!(chunk_size = tx.chunk_size(), "chunking requested by handler");
    } else if tx.length() >= 0 {
        conn.tx_mut().set_chunk_size(0);
    } else if complete {
        trace!(length = count, "whole response queued, not chunking");
        conn.tx_mut().set_length(i64::try_from(count).unwrap_or(i64::MAX));
        conn.tx_mut().set_chunk_size(0);
    } else if tx.is_no_body() {
        conn.tx_mut().set_chunk_size(0);
    } else {
        let chunk_size = conn.limits().chunk_size.min(max);
        trace!(chunk_size, "chunking response");
        conn.tx_mut().set_chunk_size(i64::try_from(chunk_size).unwrap_or(i64::MAX));
    }
}

/// Moves framing added by an earlier stage into the content so the chunk covers it.
fn fold_framing(packet: &mut Packet) {
    if (packet.prefix.is_none() && packet.suffix.is_none()) || packet.is_virtual() {
        return;
    }
    let Some(content) = packet.take_content() else {
        return;
    };
    let mut joined = packet.prefix.take().unwrap_or_default();
    joined.extend_from_slice(&content);
    if let Some(suffix) = packet.suffix.take() {
        joined.extend_from_slice(&suffix);
    }
    packet.fill(joined);
}

fn frame(encoder: &mut ChunkedEncoder, packet: &mut Packet) {
    let frame = if packet.is_end() {
        ChunkFrame::Last
    } else if packet.is_data() && !packet.is_empty() {
        ChunkFrame::Data(packet.len())
    } else {
        return;
    };
    let mut prefix = BytesMut::new();
    match encoder.encode(frame, &mut prefix) {
        Ok(()) => packet.prefix = Some(prefix),
        Err(e) => warn!(cause = %e, "cannot frame chunk"),
    }
}

pub(crate) fn definition() -> StageDef {
    StageDef::new(CHUNK_FILTER, StageFlags::FILTER, Arc::new(ChunkFilter))
}
