//! The tokio server: accept loop and per connection driver.

use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use pipe_http::protocol::ConfigError;
use pipe_http::stage::{self, StageRegistry};
use pipe_http::{Host, HttpConn, HttpEngine, Limits, StateListener, Wants};
use thiserror::Error;
use tokio::io::{Interest, Ready};
use tokio::net::{TcpListener, TcpStream};
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

use crate::config::ServerConfig;
use crate::transport::TcpTransport;
use crate::vhost::VirtualHosts;

pub struct ServerBuilder {
    address: Vec<SocketAddr>,
    address_error: Option<io::Error>,
    hosts: Vec<Host>,
    listeners: Vec<Arc<dyn StateListener>>,
    registry: Option<Arc<StageRegistry>>,
    limits: Limits,
    server_name: Option<String>,
    log_level: Level,
    config_error: Option<ConfigError>,
}

impl fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("address", &self.address)
            .field("hosts", &self.hosts.len())
            .field("listeners", &self.listeners.len())
            .field("log_level", &self.log_level)
            .finish_non_exhaustive()
    }
}

impl ServerBuilder {
    fn new() -> Self {
        Self {
            address: Vec::new(),
            address_error: None,
            hosts: Vec::new(),
            listeners: Vec::new(),
            registry: None,
            limits: Limits::default(),
            server_name: None,
            log_level: Level::INFO,
            config_error: None,
        }
    }

    pub fn address<A: ToSocketAddrs>(mut self, address: A) -> Self {
        match address.to_socket_addrs() {
            Ok(addrs) => self.address.extend(addrs),
            Err(e) => self.address_error = Some(e),
        }
        self
    }

    /// Takes the addresses, limits, server name, log level and hosts of `config`.
    pub fn config(mut self, config: &ServerConfig) -> Self {
        for listen in &config.listen {
            self = self.address(listen.as_str());
        }
        self.limits = config.limits.clone();
        self.server_name.clone_from(&config.server_name);
        match config.log_level().and_then(|level| Ok((level, config.hosts()?))) {
            Ok((level, hosts)) => {
                self.log_level = level;
                self.hosts.extend(hosts);
            }
            Err(e) => self.config_error = Some(e),
        }
        self
    }

    /// Adds a virtual host. A host named `*` answers requests no other host claims.
    pub fn host(mut self, host: Host) -> Self {
        self.hosts.push(host);
        self
    }

    /// Adds a listener notified after the virtual host is selected.
    pub fn listener(mut self, listener: Arc<dyn StateListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn registry(mut self, registry: Arc<StageRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn server_name(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = Some(server_name.into());
        self
    }

    pub fn log_level(mut self, level: Level) -> Self {
        self.log_level = level;
        self
    }

    pub fn build(self) -> Result<Server, ServerBuildError> {
        if let Some(e) = self.config_error {
            return Err(e.into());
        }
        if let Some(source) = self.address_error {
            return Err(ServerBuildError::InvalidAddress { source });
        }
        if self.address.is_empty() {
            return Err(ServerBuildError::MissingAddress);
        }
        if self.hosts.is_empty() {
            return Err(ServerBuildError::MissingHost);
        }

        let registry = self.registry.or_else(stage::global).unwrap_or_else(|| Arc::new(StageRegistry::with_builtins()));
        for host in &self.hosts {
            host.validate(&registry)?;
        }

        let mut engine = HttpEngine::builder().registry(registry).limits(self.limits).listener(Arc::new(VirtualHosts::new(self.hosts)));
        for listener in self.listeners {
            engine = engine.listener(listener);
        }
        if let Some(server_name) = self.server_name {
            engine = engine.server_name(server_name);
        }
        Ok(Server { address: self.address, engine: engine.build()?, log_level: self.log_level })
    }
}

#[derive(Error, Debug)]
pub enum ServerBuildError {
    #[error("address must be set")]
    MissingAddress,
    #[error("invalid address: {source}")]
    InvalidAddress { source: io::Error },
    #[error("at least one host must be configured")]
    MissingHost,
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug)]
pub struct Server {
    address: Vec<SocketAddr>,
    engine: Arc<HttpEngine>,
    log_level: Level,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    pub fn engine(&self) -> &Arc<HttpEngine> {
        &self.engine
    }

    /// Installs the log subscriber, binds and serves until the process exits.
    pub async fn start(self) {
        let subscriber = FmtSubscriber::builder().with_max_level(self.log_level).finish();
        if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
            warn!(cause = %e, "log subscriber already installed");
        }

        let bound = match self.bind().await {
            Ok(bound) => bound,
            Err(e) => {
                error!(cause = %e, "bind server error");
                return;
            }
        };
        bound.run().await;
    }

    pub async fn bind(self) -> io::Result<BoundServer> {
        let listener = TcpListener::bind(self.address.as_slice()).await?;
        info!(address = %listener.local_addr()?, "start listening");
        Ok(BoundServer { listener, engine: self.engine })
    }
}

/// A server whose listener is bound.
#[derive(Debug)]
pub struct BoundServer {
    listener: TcpListener,
    engine: Arc<HttpEngine>,
}

impl BoundServer {
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections forever, serving each on its own task.
    pub async fn run(self) {
        loop {
            let (tcp_stream, remote_addr) = match self.listener.accept().await {
                Ok(stream_and_addr) => stream_and_addr,
                Err(e) => {
                    warn!(cause = %e, "failed to accept");
                    continue;
                }
            };
            debug!(peer = %remote_addr, "accepted connection");

            let engine = Arc::clone(&self.engine);
            tokio::spawn(async move {
                serve_connection(engine, tcp_stream).await;
                debug!(peer = %remote_addr, "connection finished");
            });
        }
    }
}

/// Drives one connection until it closes.
///
/// Waits for whatever [`HttpConn::wants`] asks for, a worker event or the
/// connection deadline, and passes the first of them to the connection.
pub async fn serve_connection(engine: Arc<HttpEngine>, tcp_stream: TcpStream) {
    if let Err(e) = tcp_stream.set_nodelay(true) {
        debug!(cause = %e, "failed to set TCP_NODELAY");
    }
    let stream = Arc::new(tcp_stream);
    let mut conn = HttpConn::new(engine, TcpTransport::new(Arc::clone(&stream)));

    loop {
        let wants = conn.wants();
        let interest = match wants {
            Wants::Read => Some(Interest::READABLE),
            Wants::Write => Some(Interest::WRITABLE),
            Wants::Idle => None,
            Wants::Close => break,
        };
        let deadline = tokio::time::Instant::from_std(conn.expire());

        tokio::select! {
            ready = readiness(&stream, interest) => match ready {
                Ok(_) if wants == Wants::Read => conn.on_readable(),
                Ok(_) => conn.on_writable(),
                Err(e) => {
                    error!(cause = %e, "socket readiness failed");
                    break;
                }
            },
            Some(message) = conn.next_worker_event() => conn.on_worker_event(message),
            () = tokio::time::sleep_until(deadline) => conn.on_timeout(),
        }
    }
}

async fn readiness(stream: &TcpStream, interest: Option<Interest>) -> io::Result<Ready> {
    match interest {
        Some(interest) => stream.ready(interest).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::config::DEFAULT_HOST;

    struct Docs(PathBuf);

    impl Docs {
        fn new(name: &str) -> Self {
            let path = std::env::temp_dir().join(format!("pipe-web-server-{name}-{}", std::process::id()));
            std::fs::create_dir_all(&path).unwrap();
            Self(path)
        }
    }

    impl Drop for Docs {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.0);
        }
    }

    async fn start(docs: &Docs) -> SocketAddr {
        let server = Server::builder().address("127.0.0.1:0").host(Host::builder(DEFAULT_HOST, &docs.0).build().unwrap()).build().unwrap();
        let bound = server.bind().await.unwrap();
        let addr = bound.local_addr().unwrap();
        tokio::spawn(bound.run());
        addr
    }

    async fn round_trip(addr: SocketAddr, request: &str) -> Vec<u8> {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = Vec::new();
        tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut response)).await.unwrap().unwrap();
        response
    }

    fn body(response: &[u8]) -> &[u8] {
        let split = response.windows(4).position(|window| window == b"\r\n\r\n").unwrap();
        &response[split + 4..]
    }

    #[tokio::test]
    async fn serves_static_files_over_tcp() {
        let docs = Docs::new("tcp");
        std::fs::write(docs.0.join("hello.txt"), "hello over tcp").unwrap();
        let addr = start(&docs).await;

        let response = round_trip(addr, "GET /hello.txt HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n").await;
        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{text}");
        assert!(text.contains("content-length: 14"));
        assert_eq!(body(&response), b"hello over tcp");

        let response = round_trip(addr, "GET /nope.txt HTTP/1.0\r\n\r\n").await;
        assert!(response.starts_with(b"HTTP/1.0 404 Not Found\r\n"));
    }

    #[tokio::test]
    async fn large_file_is_sent_completely() {
        let docs = Docs::new("tcp-large");
        let content: Vec<u8> = (0..3_000_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(docs.0.join("big.bin"), &content).unwrap();
        let addr = start(&docs).await;

        let response = round_trip(addr, "GET /big.bin HTTP/1.1\r\nConnection: close\r\n\r\n").await;
        assert_eq!(body(&response), &content[..]);
    }

    #[test]
    fn build_errors() {
        let docs = Docs::new("build");
        let host = || Host::builder(DEFAULT_HOST, &docs.0).build().unwrap();

        assert!(matches!(Server::builder().host(host()).build(), Err(ServerBuildError::MissingAddress)));
        assert!(matches!(Server::builder().address("127.0.0.1:0").build(), Err(ServerBuildError::MissingHost)));
        assert!(matches!(Server::builder().address("not an address").host(host()).build(), Err(ServerBuildError::InvalidAddress { .. })));

        let unknown_stage = Host::builder("a", &docs.0).location(pipe_http::Location::new("/").handler("nopeHandler")).build().unwrap();
        assert!(matches!(Server::builder().address("127.0.0.1:0").host(unknown_stage).build(), Err(ServerBuildError::Config(_))));

        let config = ServerConfig::from_json_str(r#"{ "log_level": "loud", "hosts": [{ "name": "*" }] }"#).unwrap();
        assert!(matches!(Server::builder().config(&config).build(), Err(ServerBuildError::Config(_))));
    }

    #[test]
    fn builds_from_config() {
        let config = ServerConfig::from_json_str(r#"{ "listen": ["127.0.0.1:0"], "server_name": "edge", "hosts": [{ "name": "*", "document_root": "/srv" }] }"#).unwrap();
        let server = Server::builder().config(&config).build().unwrap();
        assert_eq!(server.engine().server_name(), "edge");
        assert_eq!(server.engine().listeners().len(), 1);
    }
}
