//! Handler selection.
//!
//! Runs once per request after the `Parsed` notification, when the host is known.
//! It resolves the alias, location and directory block, maps the request to a file,
//! handles directory requests, picks the handler and finally the connector. Every
//! failure is answered by the pass handler, so a pipeline can always be built.

use std::path::Path;
use std::sync::Arc;

use http::{Method, StatusCode};
use tracing::{debug, warn};

use crate::conn::{FileInfo, HttpConn};
use crate::host::{Alias, Host, Location};
use crate::queue::Direction;
use crate::stage::{FILE_HANDLER, StageDef, StageFlags};

/// Internal rewrites allowed before a request is failed.
const MAX_REWRITE: usize = 10;

enum DirAction {
    /// The path was rewritten to the index; match again.
    Rewrite,
    Redirect,
    /// Serve the directory with the selected handler.
    Keep,
}

/// Selects the handler of the current request and records the connector in the transmitter.
pub(crate) fn match_handler(conn: &mut HttpConn) -> Arc<StageDef> {
    let pass = Arc::clone(conn.engine.pass_handler());
    let handler = select_handler(conn).unwrap_or_else(|| Arc::clone(&pass));
    let handler = finish(conn, handler, pass);
    choose_connector(conn, &handler);
    debug!(
        path = conn.rx.path(),
        handler = handler.name(),
        connector = conn.tx.connector().map(|connector| connector.name()),
        "handler selected"
    );
    handler
}

fn select_handler(conn: &mut HttpConn) -> Option<Arc<StageDef>> {
    let Some(host) = conn.host.clone() else {
        conn.error(StatusCode::NOT_FOUND, "No host to serve the request");
        return None;
    };
    if conn.is_error() {
        conn.rx.location = Some(host.location_for(conn.rx.path()));
        return None;
    }

    for _ in 0..MAX_REWRITE {
        let path = conn.rx.path().to_string();
        let alias = host.alias_for(&path);
        conn.rx.alias = Some(Arc::clone(&alias));
        if let Some((status, target)) = alias.redirect_target() {
            conn.redirect(status, target);
            return None;
        }
        let location = host.location_for(&path);
        conn.rx.location = Some(Arc::clone(&location));

        let explicit = match location.explicit_handler() {
            Some(name) => match conn.engine.registry().get(name) {
                Some(handler) => Some(handler),
                None => {
                    conn.error(StatusCode::INTERNAL_SERVER_ERROR, &format!("Handler {name} is not registered"));
                    return None;
                }
            },
            None => None,
        };
        if let Some(handler) = &explicit {
            if !supports_method(conn, handler) {
                conn.error(StatusCode::METHOD_NOT_ALLOWED, &format!("Method {} is not supported by {}", conn.rx.method(), handler.name()));
                return None;
            }
            if handler.flags().contains(StageFlags::VIRTUAL) {
                return explicit;
            }
        }

        map_to_file(conn, &host, &alias, &path);
        if conn.tx.file_info().is_some_and(|info| info.is_dir) {
            match process_directory(conn, &path) {
                DirAction::Rewrite => continue,
                DirAction::Redirect => return None,
                DirAction::Keep => {}
            }
        }

        let handler = match explicit {
            Some(handler) => handler,
            None => lookup_handler(conn, &location)?,
        };
        if handler.flags().contains(StageFlags::VERIFY_ENTITY) && conn.tx.file_info().is_none() && *conn.rx.method() != Method::PUT {
            conn.error(StatusCode::NOT_FOUND, &format!("Cannot find {}", conn.rx.uri().path()));
            return None;
        }
        return Some(handler);
    }

    conn.error(StatusCode::INTERNAL_SERVER_ERROR, "Too many request rewrites");
    None
}

/// Finds the handler of a location by extension, custom match, then the default.
fn lookup_handler(conn: &mut HttpConn, location: &Location) -> Option<Arc<StageDef>> {
    let registry = Arc::clone(conn.engine.registry());

    let by_extension = conn.rx.extension().and_then(|extension| location.handler_for_extension(extension)).and_then(|name| registry.get(name));
    if let Some(handler) = by_extension.filter(|handler| check_stage(conn, handler)) {
        return Some(handler);
    }
    for name in location.custom_match_handlers() {
        if let Some(handler) = registry.get(name).filter(|handler| check_stage(conn, handler)) {
            return Some(handler);
        }
    }
    match location.handler_for_extension("").and_then(|name| registry.get(name)) {
        Some(handler) if supports_method(conn, &handler) => Some(handler),
        Some(handler) => {
            conn.error(StatusCode::METHOD_NOT_ALLOWED, &format!("Method {} is not supported by {}", conn.rx.method(), handler.name()));
            None
        }
        None => {
            conn.error(StatusCode::INTERNAL_SERVER_ERROR, &format!("No handler for {}", conn.rx.path()));
            None
        }
    }
}

fn supports_method(conn: &HttpConn, handler: &StageDef) -> bool {
    let method = conn.rx.method();
    if *method == Method::OPTIONS || *method == Method::TRACE {
        return true;
    }
    conn.rx.method_flag().is_some_and(|flag| handler.flags().contains(flag))
}

fn check_stage(conn: &HttpConn, handler: &StageDef) -> bool {
    supports_method(conn, handler) && handler.ops().matches(conn, handler, Direction::Transmit)
}

fn map_to_file(conn: &mut HttpConn, host: &Host, alias: &Alias, path: &str) {
    let filename = alias.map(path);
    conn.rx.dir = Some(host.dir_for(&filename));
    let info = FileInfo::stat(&filename);
    let has_ranges = conn.rx.ranges().is_some();
    conn.tx.extension = conn.rx.extension().map(str::to_string);
    conn.tx.set_file(filename, info, has_ranges);
}

fn process_directory(conn: &mut HttpConn, path: &str) -> DirAction {
    let index = conn.rx.dir().map(|dir| dir.index().to_string()).unwrap_or_default();
    let has_index = !index.is_empty() && conn.tx.filename().is_some_and(|dir| index_exists(dir, &index));
    if has_index {
        let rewritten = if path.ends_with('/') { format!("{path}{index}") } else { format!("{path}/{index}") };
        debug!(from = path, to = %rewritten, "directory index rewrite");
        conn.rx.set_path(rewritten);
        return DirAction::Rewrite;
    }
    if !path.ends_with('/') {
        let target = match conn.rx.query() {
            Some(query) => format!("{}/?{}", conn.rx.uri().path(), query),
            None => format!("{}/", conn.rx.uri().path()),
        };
        conn.redirect(StatusCode::MOVED_PERMANENTLY, &target);
        return DirAction::Redirect;
    }
    DirAction::Keep
}

fn index_exists(dir: &Path, index: &str) -> bool {
    dir.join(index).exists()
}

/// Applies the method and error overrides that force the pass handler.
fn finish(conn: &mut HttpConn, handler: Arc<StageDef>, pass: Arc<StageDef>) -> Arc<StageDef> {
    let method = conn.rx.method().clone();
    if method == Method::OPTIONS || method == Method::TRACE {
        conn.tx.trace_methods = handler.flags().methods();
        if method == Method::TRACE && !conn.limits.enable_trace_method {
            conn.error(StatusCode::NOT_ACCEPTABLE, "The TRACE method is disabled on this server");
        }
        return pass;
    }
    if conn.is_error() || conn.tx.is_no_body() {
        return pass;
    }
    if method == Method::HEAD {
        conn.tx.omit_body();
    }
    handler
}

fn choose_connector(conn: &mut HttpConn, handler: &StageDef) {
    let registry = Arc::clone(conn.engine.registry());
    if let Some(name) = conn.rx.location().and_then(|location| location.connector_name()) {
        match registry.get(name).filter(|stage| stage.is_connector()) {
            Some(connector) => {
                conn.tx.connector = Some(connector);
                return;
            }
            None => warn!(connector = name, "connector is not registered, using the net connector"),
        }
    }

    let zero_copy = handler.name() == FILE_HANDLER && conn.rx.ranges().is_none() && !conn.is_secure() && conn.tx.chunk_size() <= 0;
    let connector = match conn.engine.send_connector() {
        Some(send) if zero_copy => Arc::clone(send),
        _ => Arc::clone(conn.engine.net_connector()),
    };
    conn.tx.connector = Some(connector);
}
