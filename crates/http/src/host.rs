//! Host tables: the resolved configuration a request is matched against.
//!
//! A [`Host`] maps request paths to file system paths through [`Alias`]es, to
//! stage selections through [`Location`]s and to index settings through
//! [`DirBlock`]s. Each table is searched by longest prefix and always has a root
//! entry, so every lookup returns something.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use http::StatusCode;
use mime::Mime;

use crate::protocol::ConfigError;
use crate::stage::{self, StageFlags, StageRegistry};
use crate::utils::flags;

flags! {
    pub struct LocationFlags: u8 {
        /// PUT and DELETE may modify files under this location.
        const PUT_DELETE = 0x1;
        /// Directories without an index are listed.
        const AUTO_INDEX = 0x2;
    }
}

/// Stage selection for a URL prefix.
#[derive(Debug, Clone)]
pub struct Location {
    prefix: String,
    handler: Option<String>,
    extensions: HashMap<String, String>,
    match_handlers: Vec<String>,
    input_filters: Vec<String>,
    output_filters: Vec<String>,
    connector: Option<String>,
    flags: LocationFlags,
}

impl Location {
    /// A location with the standard stage set: the file handler by default, the
    /// directory handler as custom matcher, the range and chunk output filters and
    /// the chunk input filter.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            handler: None,
            extensions: HashMap::from([(String::new(), stage::FILE_HANDLER.to_string())]),
            match_handlers: vec![stage::DIR_HANDLER.to_string()],
            input_filters: vec![stage::CHUNK_FILTER.to_string()],
            output_filters: vec![stage::RANGE_FILTER.to_string(), stage::CHUNK_FILTER.to_string()],
            connector: None,
            flags: LocationFlags::empty(),
        }
    }

    /// Serve every request under this location with `name`.
    pub fn handler(mut self, name: impl Into<String>) -> Self {
        self.handler = Some(name.into());
        self
    }

    /// Serve files with `extension` with `name`. The empty extension sets the default handler.
    pub fn extension_handler(mut self, extension: impl Into<String>, name: impl Into<String>) -> Self {
        self.extensions.insert(extension.into(), name.into());
        self
    }

    pub fn default_handler(self, name: impl Into<String>) -> Self {
        self.extension_handler("", name)
    }

    pub fn match_handlers<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.match_handlers = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn input_filters<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.input_filters = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn output_filters<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_filters = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn connector(mut self, name: impl Into<String>) -> Self {
        self.connector = Some(name.into());
        self
    }

    pub fn put_delete(mut self, enabled: bool) -> Self {
        self.flags.set(LocationFlags::PUT_DELETE, enabled);
        self
    }

    pub fn auto_index(mut self, enabled: bool) -> Self {
        self.flags.set(LocationFlags::AUTO_INDEX, enabled);
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn explicit_handler(&self) -> Option<&str> {
        self.handler.as_deref()
    }

    pub fn handler_for_extension(&self, extension: &str) -> Option<&str> {
        self.extensions.get(extension).map(String::as_str)
    }

    pub fn custom_match_handlers(&self) -> &[String] {
        &self.match_handlers
    }

    pub fn input_filter_names(&self) -> &[String] {
        &self.input_filters
    }

    pub fn output_filter_names(&self) -> &[String] {
        &self.output_filters
    }

    pub fn connector_name(&self) -> Option<&str> {
        self.connector.as_deref()
    }

    pub fn flags(&self) -> LocationFlags {
        self.flags
    }

    fn validate(&self, registry: &StageRegistry) -> Result<(), ConfigError> {
        let handlers = self.handler.iter().chain(self.extensions.values()).chain(&self.match_handlers);
        for name in handlers {
            registry.get_role(name, StageFlags::HANDLER, "handler")?;
        }
        for name in self.input_filters.iter().chain(&self.output_filters) {
            registry.get_role(name, StageFlags::FILTER, "filter")?;
        }
        Ok(())
    }
}

/// Maps a URL prefix to a file system path, or redirects it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alias {
    prefix: String,
    path: PathBuf,
    redirect: Option<(StatusCode, String)>,
}

impl Alias {
    pub fn new(prefix: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self { prefix: prefix.into(), path: path.into(), redirect: None }
    }

    pub fn redirect(prefix: impl Into<String>, status: StatusCode, target: impl Into<String>) -> Self {
        Self { prefix: prefix.into(), path: PathBuf::new(), redirect: Some((status, target.into())) }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn redirect_target(&self) -> Option<(StatusCode, &str)> {
        self.redirect.as_ref().map(|(status, target)| (*status, target.as_str()))
    }

    /// The file a request path maps to under this alias.
    pub fn map(&self, request_path: &str) -> PathBuf {
        let rest = request_path.strip_prefix(&self.prefix).unwrap_or(request_path).trim_start_matches('/');
        if rest.is_empty() { self.path.clone() } else { self.path.join(rest) }
    }
}

/// Settings for a directory tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirBlock {
    path: PathBuf,
    index: String,
}

impl DirBlock {
    pub fn new(path: impl Into<PathBuf>, index: impl Into<String>) -> Self {
        Self { path: path.into(), index: index.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn index(&self) -> &str {
        &self.index
    }
}

#[derive(Debug)]
pub struct Host {
    name: String,
    document_root: PathBuf,
    server_name: Option<String>,
    aliases: Vec<Arc<Alias>>,
    root_alias: Arc<Alias>,
    locations: Vec<Arc<Location>>,
    root_location: Arc<Location>,
    dirs: Vec<Arc<DirBlock>>,
    root_dir: Arc<DirBlock>,
    mime_types: HashMap<String, Mime>,
}

impl Host {
    pub fn builder(name: impl Into<String>, document_root: impl Into<PathBuf>) -> HostBuilder {
        HostBuilder::new(name, document_root)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn document_root(&self) -> &Path {
        &self.document_root
    }

    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }

    pub fn alias_for(&self, path: &str) -> Arc<Alias> {
        let alias = self.aliases.iter().find(|alias| path.starts_with(alias.prefix.as_str()));
        Arc::clone(alias.unwrap_or(&self.root_alias))
    }

    pub fn location_for(&self, path: &str) -> Arc<Location> {
        let location = self.locations.iter().find(|location| path.starts_with(location.prefix.as_str()));
        Arc::clone(location.unwrap_or(&self.root_location))
    }

    pub fn dir_for(&self, filename: &Path) -> Arc<DirBlock> {
        let dir = self.dirs.iter().find(|dir| filename.starts_with(&dir.path));
        Arc::clone(dir.unwrap_or(&self.root_dir))
    }

    /// The content type for a file extension.
    pub fn mime_type(&self, extension: &str) -> Option<Mime> {
        let extension = extension.to_ascii_lowercase();
        self.mime_types.get(&extension).cloned().or_else(|| default_mime_type(&extension))
    }

    /// Checks that every stage named by a location is registered with the right role.
    pub fn validate(&self, registry: &StageRegistry) -> Result<(), ConfigError> {
        for location in self.locations.iter().chain(std::iter::once(&self.root_location)) {
            location.validate(registry)?;
        }
        Ok(())
    }
}

pub struct HostBuilder {
    name: String,
    document_root: PathBuf,
    server_name: Option<String>,
    aliases: Vec<Alias>,
    locations: Vec<Location>,
    dirs: Vec<DirBlock>,
    index: String,
    mime_types: Vec<(String, String)>,
}

impl HostBuilder {
    fn new(name: impl Into<String>, document_root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            document_root: document_root.into(),
            server_name: None,
            aliases: Vec::new(),
            locations: Vec::new(),
            dirs: Vec::new(),
            index: "index.html".to_string(),
            mime_types: Vec::new(),
        }
    }

    pub fn server_name(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = Some(server_name.into());
        self
    }

    pub fn alias(mut self, alias: Alias) -> Self {
        self.aliases.push(alias);
        self
    }

    pub fn location(mut self, location: Location) -> Self {
        self.locations.push(location);
        self
    }

    pub fn dir(mut self, dir: DirBlock) -> Self {
        self.dirs.push(dir);
        self
    }

    /// Index file of the document root.
    pub fn index(mut self, index: impl Into<String>) -> Self {
        self.index = index.into();
        self
    }

    pub fn mime_type(mut self, extension: impl Into<String>, content_type: impl Into<String>) -> Self {
        self.mime_types.push((extension.into(), content_type.into()));
        self
    }

    pub fn build(self) -> Result<Host, ConfigError> {
        let mut mime_types = HashMap::new();
        for (extension, content_type) in self.mime_types {
            let mime = content_type.parse::<Mime>().map_err(|e| ConfigError::invalid(format!("mime type {content_type}: {e}")))?;
            mime_types.insert(extension.trim_start_matches('.').to_ascii_lowercase(), mime);
        }

        let (root_alias, mut aliases) = split_root(self.aliases, |alias| alias.prefix == "/", || Alias::new("/", &self.document_root));
        aliases.sort_by_key(|alias| std::cmp::Reverse(alias.prefix.len()));

        let (root_location, mut locations) = split_root(self.locations, |location| location.prefix == "/", || Location::new("/"));
        locations.sort_by_key(|location| std::cmp::Reverse(location.prefix.len()));

        let document_root = self.document_root.clone();
        let index = self.index;
        let (root_dir, mut dirs) = split_root(self.dirs, |dir| dir.path == document_root, || DirBlock::new(&document_root, index));
        dirs.sort_by_key(|dir| std::cmp::Reverse(dir.path.components().count()));

        Ok(Host {
            name: self.name,
            document_root: self.document_root,
            server_name: self.server_name,
            aliases,
            root_alias,
            locations,
            root_location,
            dirs,
            root_dir,
            mime_types,
        })
    }
}

/// Separates the root entry from the others, creating a default one if missing.
fn split_root<T>(entries: Vec<T>, is_root: impl Fn(&T) -> bool, default: impl FnOnce() -> T) -> (Arc<T>, Vec<Arc<T>>) {
    let mut root = None;
    let mut rest = Vec::with_capacity(entries.len());
    for entry in entries {
        if root.is_none() && is_root(&entry) {
            root = Some(Arc::new(entry));
        } else {
            rest.push(Arc::new(entry));
        }
    }
    (root.unwrap_or_else(|| Arc::new(default())), rest)
}

fn default_mime_type(extension: &str) -> Option<Mime> {
    let mime = match extension {
        "html" | "htm" => mime::TEXT_HTML,
        "txt" => mime::TEXT_PLAIN,
        "css" => mime::TEXT_CSS,
        "csv" => mime::TEXT_CSV,
        "xml" => mime::TEXT_XML,
        "js" => mime::APPLICATION_JAVASCRIPT,
        "json" => mime::APPLICATION_JSON,
        "pdf" => mime::APPLICATION_PDF,
        "png" => mime::IMAGE_PNG,
        "jpg" | "jpeg" => mime::IMAGE_JPEG,
        "gif" => mime::IMAGE_GIF,
        "svg" => mime::IMAGE_SVG,
        "bmp" => mime::IMAGE_BMP,
        "woff" => mime::FONT_WOFF,
        "woff2" => mime::FONT_WOFF2,
        "bin" => mime::APPLICATION_OCTET_STREAM,
        _ => return None,
    };
    Some(mime)
}
