//! JSON server configuration.
//!
//! A [`ServerConfig`] describes the listen addresses, the log level, the engine
//! [`Limits`] and the virtual hosts. Every field has a default, so a document
//! only needs the parts it changes:
//!
//! ```json
//! {
//!   "listen": ["0.0.0.0:8080"],
//!   "hosts": [
//!     {
//!       "name": "*",
//!       "document_root": "/srv/www",
//!       "locations": [{ "prefix": "/files", "auto_index": true }]
//!     }
//!   ]
//! }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use http::StatusCode;
use pipe_http::protocol::ConfigError;
use pipe_http::{Alias, DirBlock, Host, Limits, Location};
use serde::Deserialize;
use tracing::Level;

/// Name of the host that answers requests no other host claims.
pub const DEFAULT_HOST: &str = "*";

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: Vec<String>,
    /// One of `trace`, `debug`, `info`, `warn` and `error`.
    pub log_level: String,
    pub server_name: Option<String>,
    pub limits: Limits,
    pub hosts: Vec<HostConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { listen: vec!["127.0.0.1:8080".to_string()], log_level: "info".to_string(), server_name: None, limits: Limits::default(), hosts: Vec::new() }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HostConfig {
    pub name: String,
    pub document_root: PathBuf,
    pub server_name: Option<String>,
    pub index: Option<String>,
    pub aliases: Vec<AliasConfig>,
    pub redirects: Vec<RedirectConfig>,
    pub locations: Vec<LocationConfig>,
    pub dirs: Vec<DirConfig>,
    /// Extension to content type.
    pub mime_types: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct AliasConfig {
    pub prefix: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RedirectConfig {
    pub prefix: String,
    #[serde(default = "default_redirect_status")]
    pub status: u16,
    pub target: String,
}

fn default_redirect_status() -> u16 {
    302
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LocationConfig {
    pub prefix: String,
    pub handler: Option<String>,
    pub default_handler: Option<String>,
    /// Extension to handler name.
    pub extension_handlers: BTreeMap<String, String>,
    pub match_handlers: Option<Vec<String>>,
    pub input_filters: Option<Vec<String>>,
    pub output_filters: Option<Vec<String>>,
    pub connector: Option<String>,
    pub put_delete: bool,
    pub auto_index: bool,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct DirConfig {
    pub path: PathBuf,
    #[serde(default = "default_index")]
    pub index: String,
}

fn default_index() -> String {
    "index.html".to_string()
}

impl ServerConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::invalid(format!("server configuration: {e}")))
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)?;
        serde_json::from_str(&json).map_err(|e| ConfigError::invalid(format!("{}: {e}", path.display())))
    }

    pub fn log_level(&self) -> Result<Level, ConfigError> {
        Level::from_str(&self.log_level).map_err(|_unknown| ConfigError::invalid(format!("unknown log level {}", self.log_level)))
    }

    /// Builds the host tables.
    pub fn hosts(&self) -> Result<Vec<Host>, ConfigError> {
        self.hosts.iter().map(HostConfig::build).collect()
    }
}

impl HostConfig {
    pub fn build(&self) -> Result<Host, ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::invalid("host without a name"));
        }
        let mut builder = Host::builder(self.name.as_str(), self.document_root.as_path());
        if let Some(server_name) = &self.server_name {
            builder = builder.server_name(server_name.as_str());
        }
        if let Some(index) = &self.index {
            builder = builder.index(index.as_str());
        }
        for alias in &self.aliases {
            builder = builder.alias(Alias::new(alias.prefix.as_str(), alias.path.as_path()));
        }
        for redirect in &self.redirects {
            let status = StatusCode::from_u16(redirect.status)
                .ok()
                .filter(StatusCode::is_redirection)
                .ok_or_else(|| ConfigError::invalid(format!("redirect {} has status {}", redirect.prefix, redirect.status)))?;
            builder = builder.alias(Alias::redirect(redirect.prefix.as_str(), status, redirect.target.as_str()));
        }
        for location in &self.locations {
            builder = builder.location(location.build());
        }
        for dir in &self.dirs {
            builder = builder.dir(DirBlock::new(dir.path.as_path(), dir.index.as_str()));
        }
        for (extension, content_type) in &self.mime_types {
            builder = builder.mime_type(extension.as_str(), content_type.as_str());
        }
        builder.build()
    }
}

impl LocationConfig {
    fn build(&self) -> Location {
        let mut location = Location::new(self.prefix.as_str()).put_delete(self.put_delete).auto_index(self.auto_index);
        if let Some(handler) = &self.handler {
            location = location.handler(handler.as_str());
        }
        if let Some(handler) = &self.default_handler {
            location = location.default_handler(handler.as_str());
        }
        for (extension, handler) in &self.extension_handlers {
            location = location.extension_handler(extension.as_str(), handler.as_str());
        }
        if let Some(names) = &self.match_handlers {
            location = location.match_handlers(names);
        }
        if let Some(names) = &self.input_filters {
            location = location.input_filters(names);
        }
        if let Some(names) = &self.output_filters {
            location = location.output_filters(names);
        }
        if let Some(connector) = &self.connector {
            location = location.connector(connector.as_str());
        }
        location
    }
}
