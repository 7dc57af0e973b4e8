use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::Arc;

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use log::debug;
use tempfile::NamedTempFile;

use crate::common::{now_millis, CompressionMode, MediaType, ValidationMode};
use crate::database::DbInner;
use crate::error::{Error, Result};
use crate::index::pipeline;
use crate::index::Value;
use crate::lock::ReadGuard;
use crate::schema;
use crate::schema::Validator;
use crate::store::ExtentReader;
use crate::tree::{Collection, DocumentNode};

/// Handle to one document. Cheap to clone; content operations coordinate
/// with other threads through the per-entity lock manager.
#[derive(Clone)]
pub struct Document {
    pub(crate) db: Arc<DbInner>,
    pub(crate) id: u32,
}

impl Document {
    pub(crate) fn new(db: Arc<DbInner>, id: u32) -> Document {
        Document { db, id }
    }

    fn node(&self) -> Result<Arc<DocumentNode>> {
        self.db.check_alive()?;
        self.db.document_node(self.id)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> Result<String> {
        Ok(self.node()?.name.clone())
    }

    pub fn uri(&self) -> Result<String> {
        self.node()?;
        self.db.document_uri(self.id)
    }

    pub fn parent(&self) -> Result<Collection> {
        let node = self.node()?;
        Ok(Collection::new(self.db.clone(), node.parent))
    }

    pub fn media_type(&self) -> Result<MediaType> {
        Ok(self.node()?.state.read().unwrap().media)
    }

    pub fn created(&self) -> Result<i64> {
        Ok(self.node()?.state.read().unwrap().created)
    }

    pub fn modified(&self) -> Result<i64> {
        Ok(self.node()?.state.read().unwrap().modified)
    }

    /// Byte length of the content before compression.
    pub fn original_length(&self) -> Result<u64> {
        Ok(self.node()?.state.read().unwrap().original_length)
    }

    /// Byte length actually occupied in the content store.
    pub fn stored_length(&self) -> Result<u64> {
        let node = self.node()?;
        self.db
            .store
            .length(node.id)
            .ok_or_else(|| Error::NotFound(format!("content entry {}", node.id)))
    }

    /// The compression the stored bytes were written with.
    pub fn compression(&self) -> Result<CompressionMode> {
        Ok(self.node()?.state.read().unwrap().compression)
    }

    /// Replaces the document content with the bytes of `file`.
    ///
    /// The write pipeline validates XML against the effective validation
    /// mode, registers schema namespaces, compresses according to the
    /// effective compression mode, stores the bytes, and re-indexes the
    /// original (uncompressed) content. Temporary files are removed on every
    /// exit path.
    pub fn set_content(&self, file: &Path) -> Result<()> {
        let node = self.node()?;
        let uri = self.db.document_uri(self.id)?;

        let meta = fs::metadata(file)
            .map_err(|e| Error::InvalidArgument(format!("unreadable content file: {}", e)))?;
        if !meta.is_file() {
            return Err(Error::InvalidArgument(format!(
                "{} is not a regular file",
                file.display()
            )));
        }
        let original_length = meta.len();
        let media = node.state.read().unwrap().media;

        match media {
            MediaType::Xml => {
                let mode = self.db.effective_validation(node.parent);
                if mode != ValidationMode::Off {
                    let required = mode == ValidationMode::On;
                    match &self.db.validator {
                        Some(validator) => validator.validate(file, &uri, required)?,
                        None => self.db.schemas.validate(file, &uri, required)?,
                    }
                }
            }
            MediaType::Schema => match schema::target_namespace(file)? {
                Some(namespace) => self.db.schemas.register(&namespace, self.id),
                None => {
                    if self.db.effective_validation(node.parent) == ValidationMode::On {
                        return Err(Error::InvalidDocument {
                            uri,
                            reason: "schema declares no target namespace".to_owned(),
                        });
                    }
                    debug!("schema {} declares no target namespace", uri);
                }
            },
            _ => {}
        }

        let mode = self.db.effective_compression(node.parent);
        let compressed = match mode {
            CompressionMode::None => None,
            CompressionMode::Deflate => Some(deflate_to_temp(&self.db.dir, file)?),
        };
        let stored_path = compressed.as_ref().map(NamedTempFile::path).unwrap_or(file);

        // fixed order: parent collection first, then the document
        let parent = self.db.collection_node(node.parent)?;
        let _collection_guard = self.db.locks.write(node.parent);
        let _document_guard = self.db.locks.write(self.id);

        self.db.store.store_file(self.id, stored_path).map_err(|e| match e {
            Error::ContentStore { source, .. } => {
                Error::ContentStore { context: uri.clone(), source }
            }
            other => other,
        })?;

        if media == MediaType::Xml {
            let defs = self.db.effective_indices(node.parent)?;
            parent.state.write().unwrap().values.remove_document(self.id);
            if !defs.is_empty() {
                let extracted = pipeline::extract(&defs, file)?;
                let mut state = parent.state.write().unwrap();
                for (key, value) in extracted {
                    state.values.add(&key, value, self.id);
                }
            }
        }

        let mut state = node.state.write().unwrap();
        state.original_length = original_length;
        state.compression = mode;
        state.modified = now_millis();
        Ok(())
    }

    /// Streams new content through a temporary file; the document changes
    /// only when [`ContentWriter::commit`] runs.
    pub fn content_writer(&self) -> Result<ContentWriter> {
        self.node()?;
        let file = NamedTempFile::new_in(&self.db.dir)?;
        Ok(ContentWriter { document: self.clone(), file })
    }

    /// Opens the stored content for reading, transparently inflating
    /// DEFLATE-compressed documents. The document's read lock is held until
    /// the returned reader is dropped.
    pub fn content(&self) -> Result<ContentReader> {
        let node = self.node()?;
        let guard = self.db.locks.read(self.id);
        let stream = self.db.store.retrieve(self.id).map_err(|e| match e {
            Error::ContentStore { source, .. } => Error::ContentStore {
                context: self.db.document_uri(self.id).unwrap_or_default(),
                source,
            },
            other => other,
        })?;
        let mode = node.state.read().unwrap().compression;
        let inner = match mode {
            CompressionMode::None => Inner::Plain(stream),
            CompressionMode::Deflate => Inner::Deflate(DeflateDecoder::new(stream)),
        };
        Ok(ContentReader { inner, _guard: guard })
    }

    /// Reads the whole content into memory.
    pub fn content_to_vec(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.content()?.read_to_end(&mut out)?;
        Ok(out)
    }

    /// Records a manual index value for this document on the parent
    /// collection, replacing any earlier value under the same key.
    pub fn set_key(&self, name: &str, value: Value) -> Result<()> {
        let node = self.node()?;
        if name.trim().is_empty() {
            return Err(Error::InvalidArgument("empty index key name".to_owned()));
        }
        let parent = self.db.collection_node(node.parent)?;
        let _guard = self.db.locks.write(node.parent);
        parent.state.write().unwrap().values.replace(name, value, self.id);
        Ok(())
    }
}

fn deflate_to_temp(dir: &Path, src: &Path) -> Result<NamedTempFile> {
    let tmp = NamedTempFile::new_in(dir)?;
    let mut encoder = DeflateEncoder::new(tmp, Compression::default());
    io::copy(&mut File::open(src)?, &mut encoder)?;
    let mut tmp = encoder.finish()?;
    tmp.flush()?;
    Ok(tmp)
}

enum Inner {
    Plain(ExtentReader),
    Deflate(DeflateDecoder<ExtentReader>),
}

/// Content stream returned by [`Document::content`]. Dropping it releases
/// the document's read lock.
pub struct ContentReader {
    inner: Inner,
    _guard: ReadGuard,
}

impl ContentReader {
    /// Stored bytes left to read; for compressed documents this counts the
    /// compressed stream, not the inflated output.
    pub fn remaining(&self) -> u64 {
        match &self.inner {
            Inner::Plain(stream) => stream.remaining(),
            Inner::Deflate(decoder) => decoder.get_ref().remaining(),
        }
    }
}

impl Read for ContentReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.inner {
            Inner::Plain(stream) => stream.read(buf),
            Inner::Deflate(decoder) => decoder.read(buf),
        }
    }
}

/// Buffers writes into a temporary file next to the database files;
/// `commit` runs the regular content pipeline. Dropping without committing
/// discards the buffered bytes along with the temporary file.
pub struct ContentWriter {
    document: Document,
    file: NamedTempFile,
}

impl ContentWriter {
    pub fn commit(mut self) -> Result<()> {
        self.file.flush()?;
        self.document.set_content(self.file.path())
    }
}

impl Write for ContentWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}
