//! The process wide engine shared by every connection.
//!
//! [`HttpEngine`] bundles the frozen [`StageRegistry`], the default [`Limits`],
//! the server name, the [`StateListener`]s and an optional default [`Host`]. It is
//! read only once built and connections hold it through an `Arc`.

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::conn::{ConnState, HttpConn};
use crate::host::Host;
use crate::limits::Limits;
use crate::protocol::ConfigError;
use crate::stage::{self, StageDef, StageFlags, StageRegistry};

/// Observer of connection state transitions.
///
/// Listeners run synchronously on the connection's task for every transition,
/// so they may inspect and modify the connection. Selecting the [`Host`] of a
/// request at [`ConnState::Parsed`] is the typical use.
#[cfg_attr(test, mockall::automock)]
pub trait StateListener: Send + Sync {
    fn state_changed(&self, conn: &mut HttpConn, state: ConnState);
}

pub struct HttpEngine {
    registry: Arc<StageRegistry>,
    limits: Limits,
    server_name: String,
    listeners: Vec<Arc<dyn StateListener>>,
    default_host: Option<Arc<Host>>,
    pass_handler: Arc<StageDef>,
    net_connector: Arc<StageDef>,
    send_connector: Option<Arc<StageDef>>,
}

impl HttpEngine {
    pub fn builder() -> HttpEngineBuilder {
        HttpEngineBuilder::new()
    }

    pub fn registry(&self) -> &Arc<StageRegistry> {
        &self.registry
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn listeners(&self) -> &[Arc<dyn StateListener>] {
        &self.listeners
    }

    /// The host used when no listener selects one.
    pub fn default_host(&self) -> Option<&Arc<Host>> {
        self.default_host.as_ref()
    }

    pub fn pass_handler(&self) -> &Arc<StageDef> {
        &self.pass_handler
    }

    pub fn net_connector(&self) -> &Arc<StageDef> {
        &self.net_connector
    }

    pub fn send_connector(&self) -> Option<&Arc<StageDef>> {
        self.send_connector.as_ref()
    }
}

impl fmt::Debug for HttpEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpEngine")
            .field("stages", &self.registry.len())
            .field("limits", &self.limits)
            .field("server_name", &self.server_name)
            .field("listeners", &self.listeners.len())
            .field("default_host", &self.default_host.as_ref().map(|host| host.name()))
            .finish()
    }
}

pub struct HttpEngineBuilder {
    registry: Option<Arc<StageRegistry>>,
    limits: Limits,
    server_name: String,
    listeners: Vec<Arc<dyn StateListener>>,
    default_host: Option<Host>,
}

impl HttpEngineBuilder {
    fn new() -> Self {
        Self {
            registry: None,
            limits: Limits::default(),
            server_name: concat!("pipe-http/", env!("CARGO_PKG_VERSION")).to_string(),
            listeners: Vec::new(),
            default_host: None,
        }
    }

    /// Uses `registry` instead of a registry holding the built in stages.
    pub fn registry(mut self, registry: Arc<StageRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn server_name(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = server_name.into();
        self
    }

    pub fn listener(mut self, listener: Arc<dyn StateListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn default_host(mut self, host: Host) -> Self {
        self.default_host = Some(host);
        self
    }

    /// Freezes the engine.
    ///
    /// # Errors
    ///
    /// Fails when the registry lacks the pass handler or the net connector, or
    /// when the default host names stages the registry does not know.
    pub fn build(self) -> Result<Arc<HttpEngine>, ConfigError> {
        let registry = match self.registry {
            Some(registry) => registry,
            None => stage::global().unwrap_or_else(|| Arc::new(StageRegistry::with_builtins())),
        };

        let pass_handler = registry.get_role(stage::PASS_HANDLER, StageFlags::HANDLER, "handler")?;
        let net_connector = registry.get_role(stage::NET_CONNECTOR, StageFlags::CONNECTOR, "connector")?;
        let send_connector = registry.get(stage::SEND_CONNECTOR).filter(|stage| stage.is_connector());

        if let Some(host) = &self.default_host {
            host.validate(&registry)?;
        }
        debug!(stages = registry.len(), server_name = %self.server_name, "engine built");

        Ok(Arc::new(HttpEngine {
            registry,
            limits: self.limits,
            server_name: self.server_name,
            listeners: self.listeners,
            default_host: self.default_host.map(Arc::new),
            pass_handler,
            net_connector,
            send_connector,
        }))
    }
}
