//! The send connector.
//!
//! Transmits static files without reading them into packets. Queued packets stay
//! virtual all the way down; each write hands the framing in front of a file
//! region and the region itself to [`Transport::send_file`](crate::Transport::send_file).
//! The matcher only selects this connector for unfiltered, unencrypted file
//! responses.

use std::sync::Arc;

use http::StatusCode;
use tracing::trace;

use crate::conn::HttpConn;
use crate::queue::QueueId;
use crate::stage::{SEND_CONNECTOR, Stage, StageDef, StageFlags};
use crate::stages::file;
use crate::stages::net::{after_write, gather, prepare};

pub(crate) struct SendConnector;

impl Stage for SendConnector {
    fn open(&self, conn: &mut HttpConn, q: QueueId) {
        let size = usize::try_from(conn.limits().transmission_body_size).unwrap_or(usize::MAX);
        conn.queues_mut()[q].set_limits(size, size);
    }

    fn outgoing_service(&self, conn: &mut HttpConn, q: QueueId) {
        if !prepare(conn, q) {
            return;
        }
        while !conn.queues[q].is_empty() {
            let has_region = conn.queues[q].packets().any(|packet| packet.is_virtual() && !packet.is_empty());
            if has_region && let Err(e) = file::ensure_open(conn) {
                conn.error(StatusCode::SERVICE_UNAVAILABLE, &format!("Cannot open {}: {e}", conn.rx().path()));
                conn.io_failure(&e);
                return;
            }

            let max_iovec = conn.limits.max_iovec.max(1);
            let outcome = {
                let gathered = gather(&conn.queues[q], max_iovec);
                match (gathered.region, conn.tx.file.as_ref()) {
                    (Some((pos, len)), Some(file)) => {
                        trace!(pos, len, head = gathered.total, "send file region");
                        (conn.transport.send_file(&gathered.slices, file, pos, len), gathered.total + len)
                    }
                    _ => (conn.transport.write_vectored(&gathered.slices), gathered.total),
                }
            };
            if !after_write(conn, q, outcome) {
                return;
            }
        }
    }
}

pub(crate) fn definition() -> StageDef {
    StageDef::new(SEND_CONNECTOR, StageFlags::CONNECTOR, Arc::new(SendConnector))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::Wants;
    use crate::testing::{MemTransport, TempDir, drive, engine_for, split_response};

    fn content() -> Vec<u8> {
        (0..200_000u32).map(|i| (i % 239) as u8).collect()
    }

    #[test]
    fn sends_file_by_reference() {
        let dir = TempDir::new("send");
        dir.write("big.bin", content());
        let transport = MemTransport::new();
        transport.push_input("GET /big.bin HTTP/1.1\r\nHost: localhost\r\n\r\n");
        let mut conn = HttpConn::new(engine_for(dir.path()), transport.clone());
        drive(&mut conn, &transport);

        let output = transport.output();
        let split = output.windows(4).position(|window| window == b"\r\n\r\n").unwrap();
        assert!(String::from_utf8_lossy(&output[..split]).contains("content-length: 200000"));
        assert_eq!(&output[split + 4..], &content()[..]);
        assert_eq!(conn.wants(), Wants::Read);
    }

    #[test]
    fn resumes_region_after_blocking() {
        let dir = TempDir::new("send-blocked");
        dir.write("big.bin", content());
        let transport = MemTransport::new();
        transport.set_write_budget(Some(70_000));
        transport.push_input("GET /big.bin HTTP/1.1\r\n\r\n");
        let mut conn = HttpConn::new(engine_for(dir.path()), transport.clone());
        drive(&mut conn, &transport);
        assert_eq!(conn.wants(), Wants::Write);

        transport.set_write_budget(None);
        drive(&mut conn, &transport);
        let output = transport.output();
        let split = output.windows(4).position(|window| window == b"\r\n\r\n").unwrap();
        assert_eq!(&output[split + 4..], &content()[..]);
    }

    #[test]
    fn empty_file() {
        let dir = TempDir::new("send-empty");
        dir.write("empty.txt", "");
        let transport = MemTransport::new();
        transport.push_input("GET /empty.txt HTTP/1.1\r\n\r\n");
        let mut conn = HttpConn::new(engine_for(dir.path()), transport.clone());
        drive(&mut conn, &transport);

        let output = transport.output_string();
        let (head, body) = split_response(&output);
        assert!(head.contains("content-length: 0"));
        assert_eq!(body, "");
        assert_eq!(conn.wants(), Wants::Read);
    }
}
