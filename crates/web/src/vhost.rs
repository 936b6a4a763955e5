//! Name based virtual hosting.

use std::collections::HashMap;
use std::sync::Arc;

use http::StatusCode;
use pipe_http::{ConnState, Host, HttpConn, StateListener};
use tracing::{debug, trace};

use crate::config::DEFAULT_HOST;

/// Selects the [`Host`] of each request from its `Host` header.
///
/// Hosts are found by name or by server name. Requests naming no known host go
/// to the default host, the one named `*`, and fail with `404` when there is none.
#[derive(Debug, Default)]
pub struct VirtualHosts {
    by_name: HashMap<String, Arc<Host>>,
    default: Option<Arc<Host>>,
}

impl VirtualHosts {
    pub fn new(hosts: impl IntoIterator<Item = Host>) -> Self {
        let mut vhosts = Self::default();
        for host in hosts {
            let host = Arc::new(host);
            if host.name() == DEFAULT_HOST {
                vhosts.default = Some(Arc::clone(&host));
                continue;
            }
            if let Some(server_name) = host.server_name() {
                vhosts.by_name.insert(server_name.to_ascii_lowercase(), Arc::clone(&host));
            }
            vhosts.by_name.insert(host.name().to_ascii_lowercase(), host);
        }
        vhosts
    }

    pub fn len(&self) -> usize {
        self.by_name.len() + usize::from(self.default.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn resolve(&self, name: Option<&str>) -> Option<&Arc<Host>> {
        name.and_then(|name| self.by_name.get(name)).or(self.default.as_ref())
    }
}

impl StateListener for VirtualHosts {
    fn state_changed(&self, conn: &mut HttpConn, state: ConnState) {
        if state != ConnState::Parsed {
            return;
        }
        let name = conn.rx().host_name().map(str::to_string);
        match self.resolve(name.as_deref()) {
            Some(host) => {
                trace!(host = host.name(), "virtual host selected");
                conn.set_host(Arc::clone(host));
            }
            None => {
                debug!(host = name.as_deref(), "no virtual host");
                conn.error(StatusCode::NOT_FOUND, &format!("No host {}", name.as_deref().unwrap_or("")));
            }
        }
    }
}
