use std::hint::black_box;
use std::io::{self, IoSlice};
use std::path::PathBuf;
use std::sync::Arc;

use bytes::BytesMut;
use criterion::{Criterion, criterion_group, criterion_main};
use http::{HeaderMap, HeaderValue, StatusCode, Version, header};
use pipe_http::codec::{ChunkFrame, ChunkedEncoder, HeaderDecoder, HeaderEncoder, ResponseHead};
use pipe_http::{Host, HttpConn, HttpEngine, Limits, Transport, Wants};
use tokio_util::codec::{Decoder, Encoder};

// In-memory transport: one scripted read, writes are counted and dropped
struct MockIO {
    request: Option<&'static [u8]>,
    written: usize,
}

impl MockIO {
    fn new(request: &'static [u8]) -> Self {
        Self { request: Some(request), written: 0 }
    }
}

impl Transport for MockIO {
    fn read_buf(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        match self.request.take() {
            Some(request) => {
                buf.extend_from_slice(request);
                Ok(request.len())
            }
            None => Ok(0),
        }
    }

    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        let total = bufs.iter().map(|buf| buf.len()).sum();
        self.written += total;
        Ok(total)
    }
}

fn bench_header_decoder(c: &mut Criterion) {
    let request = b"GET /index.html HTTP/1.1\r\nHost: localhost\r\nAccept: */*\r\nRange: bytes=0-99\r\n\r\n";
    let limits = Limits::default();

    c.bench_function("decode_request_header", |b| {
        b.iter(|| {
            let mut decoder = HeaderDecoder::new(&limits);
            let mut bytes = BytesMut::from(&request[..]);
            black_box(decoder.decode(&mut bytes).unwrap());
        });
    });
}

fn bench_header_encoder(c: &mut Criterion) {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/html"));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(1024));
    headers.insert(header::ETAG, HeaderValue::from_static("\"400-5f3a\""));

    c.bench_function("encode_response_header", |b| {
        b.iter(|| {
            let mut bytes = BytesMut::new();
            let head = ResponseHead { version: Version::HTTP_11, status: StatusCode::OK, headers: &headers, terminate: true };
            HeaderEncoder.encode(head, &mut bytes).unwrap();
            black_box(bytes);
        });
    });
}

fn bench_chunk_framing(c: &mut Criterion) {
    c.bench_function("frame_chunks", |b| {
        b.iter(|| {
            let mut encoder = ChunkedEncoder::new();
            let mut bytes = BytesMut::with_capacity(512);
            for _ in 0..32 {
                encoder.encode(ChunkFrame::Data(8192), &mut bytes).unwrap();
            }
            encoder.encode(ChunkFrame::Last, &mut bytes).unwrap();
            black_box(bytes);
        });
    });
}

fn bench_static_file(c: &mut Criterion) {
    let root: PathBuf = std::env::temp_dir().join(format!("pipe-http-bench-{}", std::process::id()));
    std::fs::create_dir_all(&root).unwrap();
    std::fs::write(root.join("index.html"), vec![b'x'; 16 * 1024]).unwrap();

    let host = Host::builder("localhost", &root).build().unwrap();
    let engine = HttpEngine::builder().default_host(host).build().unwrap();

    c.bench_function("serve_static_file", |b| {
        b.iter(|| {
            let mut conn = HttpConn::new(Arc::clone(&engine), MockIO::new(b"GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n"));
            while conn.wants() == Wants::Read {
                conn.on_readable();
            }
            black_box(conn.state());
        });
    });

    c.bench_function("serve_byte_ranges", |b| {
        b.iter(|| {
            let request = b"GET /index.html HTTP/1.1\r\nHost: localhost\r\nRange: bytes=0-99,1000-1999,-512\r\n\r\n";
            let mut conn = HttpConn::new(Arc::clone(&engine), MockIO::new(request));
            while conn.wants() == Wants::Read {
                conn.on_readable();
            }
            black_box(conn.state());
        });
    });

    let _ = std::fs::remove_dir_all(&root);
}

criterion_group!(benches, bench_header_decoder, bench_header_encoder, bench_chunk_framing, bench_static_file);
criterion_main!(benches);
