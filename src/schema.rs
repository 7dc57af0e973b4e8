//! The validation seam. Real XML Schema processing is a consumer concern;
//! the engine only needs a `(file, uri, required) -> ok | error` service and
//! somewhere to remember which schema document owns which target namespace.
//! The built-in [`SchemaRegistry`] checks well-formedness and namespace
//! registration; a full validator can be plugged in through [`Validator`].

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::RwLock;

use log::{debug, warn};
use quick_xml::events::Event;
use quick_xml::Reader;

use crate::codec;
use crate::error::{Error, Result};

const SCHEMAS_FILE: &str = "schemas.dbx";
const SCHEMAS_VERSION: u8 = 1;

/// External validation service consulted before XML content is accepted.
pub trait Validator: Send + Sync {
    /// Checks the file that is about to become the content of `uri`.
    /// `required` is true under `ValidationMode::On`: the document must have
    /// a known schema. Under `Auto` validation is best-effort.
    fn validate(&self, file: &Path, uri: &str, required: bool) -> Result<()>;
}

/// Maps schema target namespaces to the id of the schema document that
/// declared them, persisted in `schemas.dbx`.
#[derive(Debug, Default)]
pub(crate) struct SchemaRegistry {
    namespaces: RwLock<BTreeMap<String, u32>>,
}

impl SchemaRegistry {
    pub fn new() -> SchemaRegistry {
        SchemaRegistry::default()
    }

    pub fn register(&self, namespace: &str, document: u32) {
        debug!("schema namespace {:?} registered by document {}", namespace, document);
        self.namespaces.write().unwrap().insert(namespace.to_owned(), document);
    }

    pub fn is_registered(&self, namespace: &str) -> bool {
        self.namespaces.read().unwrap().contains_key(namespace)
    }

    /// Drops registrations owned by a deleted schema document.
    pub fn forget_document(&self, document: u32) {
        self.namespaces.write().unwrap().retain(|_, id| *id != document);
    }

    pub fn load(&self, dir: &Path, document_exists: impl Fn(u32) -> bool) -> Result<()> {
        let path = dir.join(SCHEMAS_FILE);
        if !path.exists() {
            return Ok(());
        }
        let mut r = BufReader::new(File::open(path)?);
        let version = codec::read_u8(&mut r)?;
        if version != SCHEMAS_VERSION {
            return Err(Error::catalog(format!("unsupported schemas version {}", version)));
        }
        let count = codec::read_u32(&mut r)?;
        let mut namespaces = self.namespaces.write().unwrap();
        for _ in 0..count {
            let namespace = codec::read_string(&mut r)?;
            let document = codec::read_u32(&mut r)?;
            if document_exists(document) {
                namespaces.insert(namespace, document);
            } else {
                warn!(
                    "dropping schema namespace {:?}: document {} no longer exists",
                    namespace, document
                );
            }
        }
        Ok(())
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        let namespaces = self.namespaces.read().unwrap();
        let mut w = BufWriter::new(File::create(dir.join(SCHEMAS_FILE))?);
        codec::write_u8(&mut w, SCHEMAS_VERSION)?;
        codec::write_u32(&mut w, namespaces.len() as u32)?;
        for (namespace, document) in namespaces.iter() {
            codec::write_string(&mut w, namespace)?;
            codec::write_u32(&mut w, *document)?;
        }
        w.flush()?;
        Ok(())
    }
}

impl Validator for SchemaRegistry {
    fn validate(&self, file: &Path, uri: &str, required: bool) -> Result<()> {
        let namespace = match root_namespace(file) {
            Ok(namespace) => namespace,
            Err(e) => {
                return Err(Error::InvalidDocument { uri: uri.to_owned(), reason: e.to_string() })
            }
        };
        // well-formedness applies to every validated document
        if let Err(e) = check_well_formed(file) {
            return Err(Error::InvalidDocument { uri: uri.to_owned(), reason: e.to_string() });
        }
        if required {
            let known = namespace.as_deref().map_or(false, |ns| self.is_registered(ns));
            if !known {
                return Err(Error::InvalidDocument {
                    uri: uri.to_owned(),
                    reason: match namespace {
                        Some(ns) => format!("no schema registered for namespace {:?}", ns),
                        None => "document declares no namespace".to_owned(),
                    },
                });
            }
        }
        Ok(())
    }
}

fn check_well_formed(file: &Path) -> Result<()> {
    let mut reader = Reader::from_file(file)?;
    let mut buf = Vec::new();
    loop {
        if let Event::Eof = reader.read_event_into(&mut buf)? {
            return Ok(());
        }
        buf.clear();
    }
}

/// The default (`xmlns`) namespace declared on the root element, read from
/// the first start event only; the rest of the file is never touched.
pub(crate) fn root_namespace(file: &Path) -> Result<Option<String>> {
    root_attribute(file, b"xmlns")
}

/// The `targetNamespace` a schema document declares on its root element.
pub(crate) fn target_namespace(file: &Path) -> Result<Option<String>> {
    root_attribute(file, b"targetNamespace")
}

fn root_attribute(file: &Path, key: &[u8]) -> Result<Option<String>> {
    let mut reader = Reader::from_file(file)?;
    let mut buf = Vec::new();
    loop {
        let start = match reader.read_event_into(&mut buf)? {
            Event::Start(start) => start,
            Event::Empty(start) => start,
            Event::Eof => return Ok(None),
            _ => {
                buf.clear();
                continue;
            }
        };
        for attr in start.attributes() {
            let attr = attr.map_err(quick_xml::Error::from)?;
            if attr.key.as_ref() == key {
                return Ok(Some(attr.unescape_value()?.into_owned()));
            }
        }
        return Ok(None);
    }
}
