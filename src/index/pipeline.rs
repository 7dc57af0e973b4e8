//! Streaming extraction of index values from an XML document. The file is
//! processed as a flat event stream with a stack of element names and one
//! text buffer per open element, so memory stays bounded however large the
//! document is.

use std::path::Path;

use log::debug;
use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::Result;
use crate::index::{IndexDef, Value};

/// Runs the document at `file` against `defs` and returns the extracted
/// `(index name, value)` pairs in document order.
pub(crate) fn extract(defs: &[IndexDef], file: &Path) -> Result<Vec<(String, Value)>> {
    let mut out = Vec::new();
    if defs.is_empty() {
        return Ok(out);
    }

    let mut reader = Reader::from_file(file)?;
    let mut buf = Vec::new();
    let mut elements: Vec<String> = Vec::new();
    let mut texts: Vec<String> = Vec::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(start) => {
                elements.push(local_name(start.local_name().as_ref()));
                texts.push(String::new());
            }
            Event::Text(text) => {
                if let Some(current) = texts.last_mut() {
                    current.push_str(&text.unescape()?);
                }
            }
            Event::CData(data) => {
                if let Some(current) = texts.last_mut() {
                    current.push_str(&String::from_utf8_lossy(&data.into_inner()));
                }
            }
            Event::End(_) => close_element(defs, &mut elements, &mut texts, &mut out),
            Event::Empty(start) => {
                elements.push(local_name(start.local_name().as_ref()));
                texts.push(String::new());
                close_element(defs, &mut elements, &mut texts, &mut out);
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

fn close_element(
    defs: &[IndexDef],
    elements: &mut Vec<String>,
    texts: &mut Vec<String>,
    out: &mut Vec<(String, Value)>,
) {
    let path = format!("/{}", elements.join("/"));
    let text = texts.pop().unwrap_or_default();
    elements.pop();

    let text = text.trim();
    if text.is_empty() {
        return;
    }
    for def in defs {
        if !path_matches(&path, &def.path) {
            continue;
        }
        match Value::coerce(text, def.value_type) {
            Some(value) => out.push((def.name.clone(), value)),
            None => debug!(
                "dropping value {:?} at {}: not a valid {:?}",
                text, path, def.value_type
            ),
        }
    }
}

/// A definition path matches exactly, or by suffix when it starts with `//`.
fn path_matches(current: &str, pattern: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix('/') {
        if pattern.starts_with("//") {
            return current.ends_with(suffix);
        }
    }
    current == pattern
}

fn local_name(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).into_owned()
}
