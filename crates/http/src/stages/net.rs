//! The net connector.
//!
//! The last transmit stage. It serializes the response header when the header
//! packet reaches it, gathers the framing and content of queued packets into one
//! vectored write and drops what the transport accepted. When the transport
//! would block the queue is disabled until [`HttpConn::on_writable`] enables it
//! again.
//!
//! [`prepare`], [`gather`] and [`after_write`] are shared with the send connector.

use std::io::{self, IoSlice};
use std::sync::Arc;

use http::StatusCode;
use tracing::trace;

use crate::conn::HttpConn;
use crate::packet::Packet;
use crate::queue::{Queue, QueueId};
use crate::stage::{NET_CONNECTOR, Stage, StageDef, StageFlags};
use crate::stages::file;

pub(crate) struct NetConnector;

impl Stage for NetConnector {
    fn outgoing_service(&self, conn: &mut HttpConn, q: QueueId) {
        if !prepare(conn, q) {
            return;
        }
        while !conn.queues[q].is_empty() {
            if conn.queues[q].first().is_some_and(|packet| packet.is_virtual() && !packet.is_empty()) && !fill_head(conn, q) {
                return;
            }
            let max_iovec = conn.limits.max_iovec.max(1);
            let outcome = {
                let gathered = gather(&conn.queues[q], max_iovec);
                (conn.transport.write_vectored(&gathered.slices), gathered.total)
            };
            if !after_write(conn, q, outcome) {
                return;
            }
        }
    }
}

/// Reads the file region of a virtual head packet, at most one packet size at a time.
fn fill_head(conn: &mut HttpConn, q: QueueId) -> bool {
    let Some(mut packet) = conn.queues.get_packet(q) else {
        return true;
    };
    let packet_size = conn.queues[q].packet_size.max(1);
    if let Some(tail) = packet.split(packet_size) {
        conn.queues.put_back(q, tail);
    }
    let filled = file::fill(conn, &mut packet);
    conn.queues.put_back(q, packet);
    match filled {
        Ok(()) => true,
        Err(e) => {
            conn.error(StatusCode::SERVICE_UNAVAILABLE, &format!("Cannot read {}: {e}", conn.rx().path()));
            conn.io_failure(&e);
            false
        }
    }
}

/// Slices of the queued packets ready for one write.
#[derive(Debug)]
pub(super) struct Gathered<'a> {
    pub(super) slices: Vec<IoSlice<'a>>,
    /// Bytes in `slices`.
    pub(super) total: usize,
    /// File region of the first virtual packet, which follows the slices.
    pub(super) region: Option<(u64, usize)>,
}

/// Collects up to `max_iovec` slices in wire order, stopping at the first virtual packet.
pub(super) fn gather(queue: &Queue, max_iovec: usize) -> Gathered<'_> {
    let mut gathered = Gathered { slices: Vec::with_capacity(max_iovec.min(64)), total: 0, region: None };
    for packet in queue.packets() {
        if packet.is_virtual() && !packet.is_empty() {
            if let Some(prefix) = packet.prefix.as_deref().filter(|prefix| !prefix.is_empty()) {
                if gathered.slices.len() == max_iovec {
                    return gathered;
                }
                gathered.total += prefix.len();
                gathered.slices.push(IoSlice::new(prefix));
            }
            gathered.region = Some((packet.entity_pos(), packet.len()));
            return gathered;
        }
        let content = packet.content().map(|content| &content[..]);
        for part in [packet.prefix.as_deref(), content, packet.suffix.as_deref()].into_iter().flatten() {
            if part.is_empty() {
                continue;
            }
            if gathered.slices.len() == max_iovec {
                return gathered;
            }
            gathered.total += part.len();
            gathered.slices.push(IoSlice::new(part));
        }
    }
    gathered
}

/// Writes the header block and applies the response framing decisions to the queue.
///
/// Returns false when nothing should be written.
pub(super) fn prepare(conn: &mut HttpConn, q: QueueId) -> bool {
    if conn.is_closing() {
        drain(conn, q);
        return false;
    }
    if !conn.flush_interim() {
        if !conn.is_closing() {
            conn.queues.disable(q);
        }
        return false;
    }
    if !conn.tx.headers_created()
        && conn.queues[q].first().is_some_and(Packet::is_header)
        && let Some(mut packet) = conn.queues.get_packet(q)
    {
        conn.write_headers(&mut packet);
        conn.queues.put_back(q, packet);
        if conn.is_closing() {
            drain(conn, q);
            return false;
        }
    }
    if conn.tx.is_no_body() {
        conn.queues.discard(q, true);
    }
    if conn.tx.chunk_size() <= 0 {
        for packet in conn.queues[q].packets_mut().filter(|packet| packet.is_end()) {
            packet.prefix = None;
        }
    }
    true
}

fn drain(conn: &mut HttpConn, q: QueueId) {
    while conn.queues.get_packet(q).is_some() {}
    conn.tx.set_write_complete();
}

/// Accounts a write. Returns true when writing should continue.
pub(super) fn after_write(conn: &mut HttpConn, q: QueueId, (result, total): (io::Result<usize>, usize)) -> bool {
    match result {
        Ok(0) if total > 0 => {
            blocked(conn, q);
            false
        }
        Ok(written) => {
            trace!(written, total, "wrote response bytes");
            account(conn, q, written);
            true
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            blocked(conn, q);
            false
        }
        Err(e) if e.kind() == io::ErrorKind::Interrupted => true,
        Err(e) => {
            conn.io_failure(&e);
            false
        }
    }
}

fn blocked(conn: &mut HttpConn, q: QueueId) {
    trace!(queued = conn.queues[q].count(), "transport full");
    conn.mark_write_blocked();
    conn.queues.disable(q);
}

/// Drops `written` wire bytes from the head of the queue.
///
/// Packets written in full are removed, zero length ones included, and the end
/// packet marks the response as written.
fn account(conn: &mut HttpConn, q: QueueId, written: usize) {
    conn.tx.bytes_written += written as u64;
    let mut left = written;
    while let Some(wire_len) = conn.queues[q].first().map(Packet::wire_len) {
        if wire_len > left {
            if left > 0 {
                conn.queues.consume_head(q, left);
            }
            return;
        }
        left -= wire_len;
        if conn.queues.get_packet(q).is_some_and(|packet| packet.is_end()) {
            conn.tx.set_write_complete();
        }
    }
}

pub(crate) fn definition() -> StageDef {
    StageDef::new(NET_CONNECTOR, StageFlags::CONNECTOR, Arc::new(NetConnector))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::Wants;
    use crate::queue::{Direction, Queues};
    use crate::testing::{MemTransport, TempDir, drive, engine_for, engine_with_handler, serve_bytes, split_response};
    use bytes::BytesMut;

    fn queue_of(packets: Vec<Packet>) -> (Queues, QueueId) {
        let mut queues = Queues::new();
        let q = queues.add(Arc::new(definition()), Direction::Transmit, 1024);
        for packet in packets {
            queues.put_for_service(q, packet, false);
        }
        (queues, q)
    }

    fn framed(prefix: &str, content: &str) -> Packet {
        let mut packet = Packet::data(content.as_bytes());
        packet.prefix = Some(BytesMut::from(prefix));
        packet
    }

    #[test]
    fn gathers_in_wire_order() {
        let (queues, q) = queue_of(vec![framed("<", "ab"), Packet::data(b""), framed("#", "cd"), Packet::end()]);
        let gathered = gather(&queues[q], 24);
        let bytes: Vec<u8> = gathered.slices.iter().flat_map(|slice| slice.to_vec()).collect();
        assert_eq!(bytes, b"<ab#cd");
        assert_eq!(gathered.total, 6);
        assert!(gathered.region.is_none());
    }

    #[test]
    fn gather_respects_max_iovec() {
        let (queues, q) = queue_of(vec![framed("1", "a"), framed("2", "b")]);
        let gathered = gather(&queues[q], 3);
        assert_eq!(gathered.slices.len(), 3);
        assert_eq!(gathered.total, 3);
    }

    #[test]
    fn gather_stops_at_virtual_region() {
        let mut entity = Packet::entity(40, 100);
        entity.prefix = Some(BytesMut::from("--"));
        let (queues, q) = queue_of(vec![Packet::data(b"head"), entity, Packet::data(b"tail")]);
        let gathered = gather(&queues[q], 24);
        assert_eq!(gathered.slices.len(), 2);
        assert_eq!(gathered.total, 6);
        assert_eq!(gathered.region, Some((40, 100)));
    }

    fn blocked_get(budget: usize) -> (HttpConn, MemTransport, Vec<u8>, TempDir) {
        let dir = TempDir::new("net-blocked");
        let content: Vec<u8> = (0..100_000u32).map(|i| (i % 241) as u8).collect();
        dir.write("big.bin", &content);
        let transport = MemTransport::new();
        transport.set_secure(true);
        transport.set_write_budget(Some(budget));
        transport.push_input("GET /big.bin HTTP/1.1\r\nHost: localhost\r\n\r\n");
        let mut conn = HttpConn::new(engine_for(dir.path()), transport.clone());
        drive(&mut conn, &transport);
        (conn, transport, content, dir)
    }

    #[test]
    fn resumes_after_transport_blocks() {
        let (mut conn, transport, content, _dir) = blocked_get(5000);
        assert_eq!(conn.wants(), Wants::Write);
        assert_eq!(transport.output().len(), 5000);

        transport.set_write_budget(None);
        drive(&mut conn, &transport);
        let output = transport.output();
        let split = output.windows(4).position(|window| window == b"\r\n\r\n").unwrap();
        assert_eq!(&output[split + 4..], &content[..]);
        assert_eq!(conn.wants(), Wants::Read);
    }

    /// Queues five 100 byte packets, each filled with its own index.
    struct FivePackets;

    impl Stage for FivePackets {
        fn process(&self, conn: &mut HttpConn, q: QueueId) {
            for index in 0..5u8 {
                conn.put(q, Packet::data(&[b'0' + index; 100]));
            }
            conn.finalize();
        }
    }

    #[test]
    fn full_socket_resumes_with_the_remaining_packets() {
        let dir = TempDir::new("net-five");
        let engine = engine_with_handler(dir.path(), "five", Arc::new(FivePackets));
        let complete = serve_bytes(&engine, "GET /x HTTP/1.1\r\n\r\n");
        let head_len = complete.windows(4).position(|window| window == b"\r\n\r\n").unwrap() + 4;
        let expected = &complete[head_len..];
        assert_eq!(expected.len(), 500);

        let transport = MemTransport::new();
        transport.set_write_budget(Some(head_len + 300));
        transport.push_input("GET /x HTTP/1.1\r\n\r\n");
        let mut conn = HttpConn::new(engine, transport.clone());
        drive(&mut conn, &transport);
        assert_eq!(conn.wants(), Wants::Write);
        assert_eq!(&transport.output()[head_len..], &expected[..300]);

        transport.set_write_budget(None);
        drive(&mut conn, &transport);
        let output = transport.output();
        let body = &output[head_len..];
        assert_eq!(body, expected);
        let checksum = |bytes: &[u8]| bytes.iter().map(|byte| u64::from(*byte)).sum::<u64>();
        assert_eq!(checksum(body), checksum(expected));
        assert_eq!(conn.wants(), Wants::Read);
    }

    #[test]
    fn write_failure_closes_connection() {
        let dir = TempDir::new("net-fail");
        dir.write("a.txt", "abc");
        let transport = MemTransport::new();
        transport.set_secure(true);
        transport.fail_writes(io::ErrorKind::ConnectionReset);
        transport.push_input("GET /a.txt HTTP/1.1\r\n\r\n");
        let mut conn = HttpConn::new(engine_for(dir.path()), transport.clone());
        drive(&mut conn, &transport);

        assert!(conn.is_closed());
        assert!(transport.is_shut_down());
        assert!(transport.output().is_empty());
    }

    #[test]
    fn head_discards_body() {
        let dir = TempDir::new("net-head");
        dir.write("a.txt", "abc");
        let transport = MemTransport::new();
        transport.set_secure(true);
        transport.push_input("HEAD /a.txt HTTP/1.1\r\n\r\n");
        let mut conn = HttpConn::new(engine_for(dir.path()), transport.clone());
        drive(&mut conn, &transport);
        assert_eq!(conn.wants(), Wants::Read);

        let output = transport.output_string();
        let (head, body) = split_response(&output);
        assert!(head.contains("content-length: 3"));
        assert_eq!(body, "");
    }
}
