//! The pipeline engine of an embeddable HTTP/1.x server
//!
//! This crate turns a byte stream into HTTP responses without owning a socket, a
//! thread or an event loop. An embedding server accepts connections, wraps each
//! one in a [`Transport`] and feeds readiness events to an [`HttpConn`]. The
//! connection parses requests, selects a handler and streams the response through
//! a pipeline of stages.
//!
//! # Features
//!
//! - HTTP/1.0 and HTTP/1.1 with keep-alive and pipelined requests
//! - Chunked transfer coding in both directions
//! - Single and multipart byte ranges
//! - Conditional requests with `ETag` and `Last-Modified` validators
//! - Static files served by reference through [`Transport::send_file`]
//! - Directory listings, `PUT` and `DELETE` for locations that allow them
//! - Flow control between stages with high and low water marks
//! - Blocking handler work handed to a worker thread
//!
//! # Example
//!
//! ```no_run
//! use std::io::{self, IoSlice, Read, Write};
//! use std::net::TcpListener;
//!
//! use bytes::BytesMut;
//! use pipe_http::{Host, HttpConn, HttpEngine, Transport, Wants};
//!
//! struct Blocking(std::net::TcpStream);
//!
//! impl Transport for Blocking {
//!     fn read_buf(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
//!         let mut chunk = [0u8; 8192];
//!         let n = self.0.read(&mut chunk)?;
//!         buf.extend_from_slice(&chunk[..n]);
//!         Ok(n)
//!     }
//!
//!     fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
//!         self.0.write_vectored(bufs)
//!     }
//! }
//!
//! let host = Host::builder("localhost", "/srv/www").build().unwrap();
//! let engine = HttpEngine::builder().default_host(host).build().unwrap();
//! let listener = TcpListener::bind("127.0.0.1:8080").unwrap();
//! for stream in listener.incoming() {
//!     let mut conn = HttpConn::new(engine.clone(), Blocking(stream.unwrap()));
//!     loop {
//!         match conn.wants() {
//!             Wants::Read => conn.on_readable(),
//!             Wants::Write => conn.on_writable(),
//!             Wants::Idle | Wants::Close => break,
//!         }
//!     }
//! }
//! ```
//!
//! # Architecture
//!
//! - [`packet`]: [`Packet`], the unit of data moving through a pipeline
//! - [`queue`]: [`Queue`](queue::Queue), one per stage instance and direction, with
//!   flow control and a service schedule
//! - [`stage`]: the [`Stage`] callbacks, [`StageDef`] templates and the
//!   [`StageRegistry`]
//! - [`conn`]: [`HttpConn`], the per connection state machine with its
//!   [`Receiver`] and [`Transmitter`]
//! - [`host`]: [`Host`], [`Location`], [`Alias`] and [`DirBlock`] route requests
//!   to stages and files
//! - [`engine`]: [`HttpEngine`], the frozen process wide configuration
//! - [`codec`] and [`protocol`]: the wire formats and protocol types
//!
//! The built in stages are the pass, file and directory handlers, the chunk and
//! range filters and the net and send connectors.
//!
//! # Error Handling
//!
//! Request failures never surface as Rust errors. They become HTTP error
//! responses through [`HttpConn::error`] and [`HttpConn::conn_error`]. Errors
//! that do surface come from assembling the engine:
//!
//! - [`protocol::ConfigError`]: registry, host and engine assembly errors
//! - [`protocol::ParseError`]: request header errors, mapped to a status
//!
//! # Logging
//!
//! The engine logs through `tracing`: one `info` event per completed request,
//! `warn` for request errors and `debug`/`trace` for state transitions, pipeline
//! wiring and queue servicing.

pub mod codec;
pub mod conn;
pub mod engine;
pub mod host;
pub mod limits;
pub mod packet;
pub mod protocol;
pub mod queue;
pub mod stage;
pub mod transport;

mod date;
mod matcher;
mod pipeline;
mod stages;
mod utils;

#[cfg(test)]
mod testing;

pub(crate) use utils::ensure;

pub use conn::{ConnState, HttpConn, Receiver, Transmitter, Wants, WorkerEvent, WorkerOutput};
pub use engine::{HttpEngine, HttpEngineBuilder, StateListener};
pub use host::{Alias, DirBlock, Host, HostBuilder, Location};
pub use limits::Limits;
pub use packet::Packet;
pub use queue::{Direction, QueueId};
pub use stage::{Stage, StageDef, StageFlags, StageRegistry};
pub use transport::Transport;
