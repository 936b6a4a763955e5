//! The directory handler: HTML listings for locations with auto indexing.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use http::StatusCode;
use http::header::{self, HeaderValue};

use crate::conn::HttpConn;
use crate::host::LocationFlags;
use crate::packet::Packet;
use crate::queue::{Direction, QueueId};
use crate::stage::{DIR_HANDLER, Stage, StageDef, StageFlags};
use crate::utils::escape_html;

pub(crate) struct DirHandler;

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Entry {
    name: String,
    is_dir: bool,
    size: u64,
}

impl Stage for DirHandler {
    fn matches(&self, conn: &HttpConn, _stage: &StageDef, _direction: Direction) -> bool {
        conn.tx().file_info().is_some_and(|info| info.is_dir)
            && conn.rx().location().is_some_and(|location| location.flags().contains(LocationFlags::AUTO_INDEX))
            && conn.rx().path().ends_with('/')
    }

    fn start(&self, conn: &mut HttpConn, _q: QueueId) {
        conn.tx_mut().dont_cache();
        conn.tx_mut().set_header(header::CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8"));
    }

    fn process(&self, conn: &mut HttpConn, q: QueueId) {
        let Some(dir) = conn.tx().filename().map(Path::to_path_buf) else {
            conn.error(StatusCode::NOT_FOUND, "No directory to list");
            return;
        };
        match read_entries(&dir) {
            Ok(entries) => {
                let listing = render(conn.rx().path(), &entries);
                conn.put(q, Packet::data(listing.as_bytes()));
                conn.finalize();
            }
            Err(e) => conn.error(StatusCode::FORBIDDEN, &format!("Cannot list {}: {e}", conn.rx().path())),
        }
    }
}

fn read_entries(dir: &Path) -> std::io::Result<Vec<Entry>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        entries.push(Entry { name, is_dir: metadata.is_dir(), size: metadata.len() });
    }
    entries.sort();
    Ok(entries)
}

fn render(path: &str, entries: &[Entry]) -> String {
    let title = escape_html(path);
    let mut html = format!("<!DOCTYPE html>\r\n<html><head><title>Index of {title}</title></head>\r\n<body><h1>Index of {title}</h1>\r\n<ul>\r\n");
    if path != "/" {
        html.push_str("<li><a href=\"../\">Parent Directory</a></li>\r\n");
    }
    for entry in entries {
        let name = escape_html(&entry.name);
        let slash = if entry.is_dir { "/" } else { "" };
        let size = if entry.is_dir { String::from("-") } else { entry.size.to_string() };
        html.push_str(&format!("<li><a href=\"{name}{slash}\">{name}{slash}</a> {size}</li>\r\n"));
    }
    html.push_str("</ul></body></html>\r\n");
    html
}

pub(crate) fn definition() -> StageDef {
    StageDef::new(DIR_HANDLER, StageFlags::HANDLER | StageFlags::GET | StageFlags::HEAD, Arc::new(DirHandler))
}
