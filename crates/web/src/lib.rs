//! The tokio host for the [`pipe_http`] engine.
//!
//! pipe-http owns the request pipeline but never touches a socket. This crate
//! supplies the rest of a static file server:
//!
//! - [`Server`] binds TCP listeners and drives one [`pipe_http::HttpConn`] per
//!   accepted connection with [`serve_connection`].
//! - [`TcpTransport`] implements [`pipe_http::Transport`] over a tokio
//!   `TcpStream`, with `sendfile(2)` on Linux.
//! - [`VirtualHosts`] picks the host of each request from its `Host` header.
//! - [`ServerConfig`] reads all of the above from a JSON document.
//!
//! # Example
//!
//! ```no_run
//! use pipe_http::Host;
//! use pipe_web::Server;
//!
//! #[tokio::main]
//! async fn main() {
//!     let server = Server::builder()
//!         .address("127.0.0.1:8080")
//!         .host(Host::builder("*", "/srv/www").build().unwrap())
//!         .build()
//!         .unwrap();
//!
//!     server.start().await;
//! }
//! ```

pub mod config;
mod server;
mod transport;
mod vhost;

pub use config::ServerConfig;
pub use server::{BoundServer, Server, ServerBuildError, ServerBuilder, serve_connection};
pub use transport::TcpTransport;
pub use vhost::VirtualHosts;
