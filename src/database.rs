use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_skiplist::SkipMap;
use fs2::FileExt;
use log::{error, info, warn};

use crate::catalog;
use crate::common::{now_millis, CompressionMode, Inheritable, ValidationMode};
use crate::error::{Error, Result};
use crate::ident::IdAllocator;
use crate::index::IndexDef;
use crate::lock::LockManager;
use crate::query::{DocFunction, QueryProcessor};
use crate::schema::{SchemaRegistry, Validator};
use crate::store::ContentStore;
use crate::tree::{Collection, CollectionNode, Document, DocumentNode};

const LOCK_FILE: &str = "db.lock";
const ENV_DIR: &str = "XANTIPPE_DB";

/// An embedded hierarchical document database rooted in one directory.
///
/// ```no_run
/// # fn main() -> xantippe::Result<()> {
/// use xantippe::Database;
///
/// let db = Database::open("./data");
/// db.start()?;
/// let data = db.root()?.create_collection("data")?;
/// data.create_document("notes.txt")?;
/// db.shutdown()?;
/// # Ok(())
/// # }
/// ```
pub struct Database {
    dir: PathBuf,
    validator: Option<Arc<dyn Validator>>,
    query: Arc<dyn QueryProcessor>,
    inner: Mutex<Option<Arc<DbInner>>>,
}

impl Database {
    /// Binds a database to a directory without touching the filesystem;
    /// everything happens at [`Database::start`].
    pub fn open(dir: impl Into<PathBuf>) -> Database {
        Database {
            dir: dir.into(),
            validator: None,
            query: Arc::new(DocFunction),
            inner: Mutex::new(None),
        }
    }

    /// Binds to the directory named by the `XANTIPPE_DB` environment
    /// variable.
    pub fn from_env() -> Result<Database> {
        match std::env::var_os(ENV_DIR) {
            Some(dir) => Ok(Database::open(PathBuf::from(dir))),
            None => Err(Error::InvalidArgument(format!("{} is not set", ENV_DIR))),
        }
    }

    /// Replaces the built-in schema-registry validation with an external
    /// validator. Takes effect at the next `start`.
    pub fn set_validator(&mut self, validator: Arc<dyn Validator>) {
        self.validator = Some(validator);
    }

    /// Replaces the built-in `doc()` query processor. Takes effect
    /// immediately.
    pub fn set_query_processor(&mut self, query: Arc<dyn QueryProcessor>) {
        self.query = query;
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Loads the catalog and takes an exclusive advisory lock on the data
    /// directory. Fails with `AlreadyRunning` if this or any other process
    /// holds the directory.
    pub fn start(&self) -> Result<()> {
        let mut slot = self.inner.lock().unwrap();
        if slot.is_some() {
            return Err(Error::AlreadyRunning(self.dir.display().to_string()));
        }
        fs::create_dir_all(&self.dir)?;

        let lock_file = File::create(self.dir.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(Error::AlreadyRunning(self.dir.display().to_string()));
        }

        let store = ContentStore::open(&self.dir)?;
        let collections = SkipMap::new();
        let documents = SkipMap::new();
        let next_id = catalog::load_metadata(&self.dir)?;
        let loaded_root = catalog::load_tree(&self.dir, &collections, &documents)?;

        let (ids, root_id) = match loaded_root {
            Some(root_id) => {
                let next = next_id.unwrap_or_else(|| {
                    let max = highest_live_id(&collections, &documents);
                    warn!("metadata file missing, resuming ids after {}", max);
                    max + 1
                });
                (IdAllocator::new(next), root_id)
            }
            None => {
                let ids = IdAllocator::new(next_id.unwrap_or(1));
                let root_id = ids.next();
                let root = CollectionNode::new(
                    root_id,
                    None,
                    String::new(),
                    now_millis(),
                    Inheritable::Set(ValidationMode::Off),
                    Inheritable::Set(CompressionMode::None),
                );
                collections.insert(root_id, Arc::new(root));
                info!("created fresh root collection with id {}", root_id);
                (ids, root_id)
            }
        };
        normalize_root_modes(&collections, root_id);
        catalog::load_index_values(&self.dir, &collections, &documents)?;

        let schemas = SchemaRegistry::new();
        schemas.load(&self.dir, |id| documents.contains_key(&id))?;

        *slot = Some(Arc::new(DbInner {
            dir: self.dir.clone(),
            alive: AtomicBool::new(true),
            lock_file: Mutex::new(Some(lock_file)),
            ids,
            locks: LockManager::new(),
            store,
            schemas,
            validator: self.validator.clone(),
            collections,
            documents,
            root_id,
        }));
        info!("database started at {}", self.dir.display());
        Ok(())
    }

    /// Saves the catalog and releases the directory. Catalog write failures
    /// are logged; OS resources are released regardless.
    pub fn shutdown(&self) -> Result<()> {
        let mut slot = self.inner.lock().unwrap();
        let inner = slot.take().ok_or(Error::NotRunning)?;
        inner.alive.store(false, Ordering::SeqCst);

        if let Err(e) = inner.schemas.save(&inner.dir) {
            error!("failed to save schema registry: {}", e);
        }
        if let Err(e) = catalog::save_index_values(&inner.dir, &inner.collections) {
            error!("failed to save index values: {}", e);
        }
        if let Err(e) =
            catalog::save_tree(&inner.dir, inner.root_id, &inner.collections, &inner.documents)
        {
            error!("failed to save collection tree: {}", e);
        }
        if let Err(e) = catalog::save_metadata(&inner.dir, inner.ids.peek()) {
            error!("failed to save metadata: {}", e);
        }
        if let Err(e) = inner.store.sync() {
            error!("failed to sync the content store: {}", e);
        }
        if let Some(lock_file) = inner.lock_file.lock().unwrap().take() {
            let _ = lock_file.unlock();
        }
        info!("database at {} shut down", inner.dir.display());
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().unwrap().is_some()
    }

    fn running(&self) -> Result<Arc<DbInner>> {
        self.inner.lock().unwrap().clone().ok_or(Error::NotRunning)
    }

    /// The root collection, URI `/`.
    pub fn root(&self) -> Result<Collection> {
        let inner = self.running()?;
        let root_id = inner.root_id;
        Ok(Collection::new(inner, root_id))
    }

    /// Resolves a collection URI such as `/data/foo`. Empty segments between
    /// slashes are skipped.
    pub fn collection(&self, uri: &str) -> Result<Collection> {
        let inner = self.running()?;
        let id = resolve_collection(&inner, uri)?;
        Ok(Collection::new(inner, id))
    }

    /// Resolves a document URI; the last segment names the document.
    pub fn document(&self, uri: &str) -> Result<Document> {
        let inner = self.running()?;
        let id = resolve_document(&inner, uri)?;
        Ok(Document::new(inner, id))
    }

    pub fn exists(&self, uri: &str) -> Result<bool> {
        Ok(self.is_collection(uri)? || self.is_document(uri)?)
    }

    pub fn is_collection(&self, uri: &str) -> Result<bool> {
        let inner = self.running()?;
        match resolve_collection(&inner, uri) {
            Ok(_) => Ok(true),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn is_document(&self, uri: &str) -> Result<bool> {
        let inner = self.running()?;
        match resolve_document(&inner, uri) {
            Ok(_) => Ok(true),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Runs query text through the configured processor and returns the
    /// result as a byte stream.
    pub fn execute_query(&self, query: &str) -> Result<impl Read> {
        self.running()?;
        let bytes = self.query.execute(self, query)?;
        Ok(Cursor::new(bytes))
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if self.is_running() {
            if let Err(e) = self.shutdown() {
                error!("shutdown on drop failed: {}", e);
            }
        }
    }
}

fn highest_live_id(
    collections: &SkipMap<u32, Arc<CollectionNode>>,
    documents: &SkipMap<u32, Arc<DocumentNode>>,
) -> u32 {
    let collections_max = collections.back().map(|e| *e.key()).unwrap_or(0);
    let documents_max = documents.back().map(|e| *e.key()).unwrap_or(0);
    collections_max.max(documents_max)
}

/// The root must carry explicit modes; a legacy catalog that says otherwise
/// is repaired on load.
fn normalize_root_modes(collections: &SkipMap<u32, Arc<CollectionNode>>, root_id: u32) {
    if let Some(entry) = collections.get(&root_id) {
        let mut state = entry.value().state.write().unwrap();
        if state.validation.is_inherit() {
            warn!("root collection had an inherited validation mode, forcing off");
            state.validation = Inheritable::Set(ValidationMode::Off);
        }
        if state.compression.is_inherit() {
            warn!("root collection had an inherited compression mode, forcing none");
            state.compression = Inheritable::Set(CompressionMode::None);
        }
    }
}

fn split_segments<'a>(uri: &'a str) -> Result<Vec<&'a str>> {
    if !uri.starts_with('/') {
        return Err(Error::InvalidArgument(format!("uri {:?} must start with '/'", uri)));
    }
    Ok(uri.split('/').filter(|segment| !segment.is_empty()).collect())
}

fn resolve_collection(inner: &Arc<DbInner>, uri: &str) -> Result<u32> {
    let segments = split_segments(uri)?;
    let mut current = inner.root_id;
    for segment in segments {
        let node = inner.collection_node(current)?;
        let state = node.state.read().unwrap();
        current = *state
            .children
            .get(segment)
            .ok_or_else(|| Error::NotFound(uri.to_owned()))?;
    }
    Ok(current)
}

fn resolve_document(inner: &Arc<DbInner>, uri: &str) -> Result<u32> {
    let mut segments = split_segments(uri)?;
    let name = segments
        .pop()
        .ok_or_else(|| Error::InvalidArgument(format!("uri {:?} names no document", uri)))?;

    let mut current = inner.root_id;
    for segment in segments {
        let node = inner.collection_node(current)?;
        let state = node.state.read().unwrap();
        current = *state
            .children
            .get(segment)
            .ok_or_else(|| Error::NotFound(uri.to_owned()))?;
    }
    let node = inner.collection_node(current)?;
    let state = node.state.read().unwrap();
    state
        .documents
        .get(name)
        .copied()
        .ok_or_else(|| Error::NotFound(uri.to_owned()))
}

/// Shared engine state behind every handle. Handles keep it alive after
/// shutdown, but every operation re-checks the `alive` flag first.
pub(crate) struct DbInner {
    pub dir: PathBuf,
    alive: AtomicBool,
    lock_file: Mutex<Option<File>>,
    pub ids: IdAllocator,
    pub locks: LockManager,
    pub store: ContentStore,
    pub schemas: SchemaRegistry,
    pub validator: Option<Arc<dyn Validator>>,
    pub collections: SkipMap<u32, Arc<CollectionNode>>,
    pub documents: SkipMap<u32, Arc<DocumentNode>>,
    pub root_id: u32,
}

impl DbInner {
    pub fn check_alive(&self) -> Result<()> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::NotRunning)
        }
    }

    pub fn collection_node(&self, id: u32) -> Result<Arc<CollectionNode>> {
        self.collections
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::NotFound(format!("collection {}", id)))
    }

    pub fn document_node(&self, id: u32) -> Result<Arc<DocumentNode>> {
        self.documents
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::NotFound(format!("document {}", id)))
    }

    pub fn collection_uri(&self, id: u32) -> Result<String> {
        let mut segments = Vec::new();
        let mut node = self.collection_node(id)?;
        while let Some(parent) = node.parent {
            segments.push(node.name.clone());
            node = self.collection_node(parent)?;
        }
        if segments.is_empty() {
            return Ok("/".to_owned());
        }
        segments.reverse();
        Ok(format!("/{}", segments.join("/")))
    }

    pub fn document_uri(&self, id: u32) -> Result<String> {
        let node = self.document_node(id)?;
        self.child_uri(node.parent, &node.name)
    }

    pub fn child_uri(&self, parent: u32, name: &str) -> Result<String> {
        let base = self.collection_uri(parent)?;
        if base == "/" {
            Ok(format!("/{}", name))
        } else {
            Ok(format!("{}/{}", base, name))
        }
    }

    /// Walks the parent chain until a collection carries an explicit
    /// validation mode. An inheriting root violates an invariant; resolution
    /// falls back to `Off`.
    pub fn effective_validation(&self, id: u32) -> ValidationMode {
        let mut current = id;
        loop {
            let node = match self.collection_node(current) {
                Ok(node) => node,
                Err(_) => return ValidationMode::Off,
            };
            match node.state.read().unwrap().validation {
                Inheritable::Set(mode) => return mode,
                Inheritable::Inherit => match node.parent {
                    Some(parent) => current = parent,
                    None => {
                        warn!("root collection inherits validation, resolving to off");
                        return ValidationMode::Off;
                    }
                },
            };
        }
    }

    pub fn effective_compression(&self, id: u32) -> CompressionMode {
        let mut current = id;
        loop {
            let node = match self.collection_node(current) {
                Ok(node) => node,
                Err(_) => return CompressionMode::None,
            };
            match node.state.read().unwrap().compression {
                Inheritable::Set(mode) => return mode,
                Inheritable::Inherit => match node.parent {
                    Some(parent) => current = parent,
                    None => {
                        warn!("root collection inherits compression, resolving to none");
                        return CompressionMode::None;
                    }
                },
            };
        }
    }

    /// Own and inherited index definitions, in name order. Names are unique
    /// across the chain, enforced at `add_index`.
    pub fn effective_indices(&self, id: u32) -> Result<Vec<IndexDef>> {
        let mut merged: BTreeMap<String, IndexDef> = BTreeMap::new();
        let mut current = Some(id);
        while let Some(collection) = current {
            let node = self.collection_node(collection)?;
            let state = node.state.read().unwrap();
            for (name, def) in state.indices.iter() {
                merged.entry(name.clone()).or_insert_with(|| def.clone());
            }
            current = node.parent;
        }
        Ok(merged.into_values().collect())
    }

    /// Unregisters a document everywhere but the parent's name map, which
    /// the caller already maintains.
    pub fn drop_document(&self, id: u32) {
        self.documents.remove(&id);
        self.schemas.forget_document(id);
        if let Err(e) = self.store.delete(id) {
            warn!("content entry {} was already gone: {}", id, e);
        }
    }

    /// Recursively deletes a collection that is no longer reachable from
    /// its parent.
    pub fn drop_collection_tree(&self, id: u32) -> Result<()> {
        let node = self.collection_node(id)?;
        let (children, documents) = {
            let _guard = self.locks.write(id);
            let mut state = node.state.write().unwrap();
            state.values.clear();
            state.indices.clear();
            (std::mem::take(&mut state.children), std::mem::take(&mut state.documents))
        };
        for (_, doc_id) in documents {
            let guard = self.locks.write(doc_id);
            self.drop_document(doc_id);
            drop(guard);
            self.locks.remove(doc_id);
        }
        for (_, child_id) in children {
            self.drop_collection_tree(child_id)?;
        }
        self.collections.remove(&id);
        self.locks.remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::Write;
    use std::thread;

    use crossbeam_utils::sync::WaitGroup;
    use tempfile::TempDir;

    use super::*;
    use crate::common::MediaType;
    use crate::index::{IndexType, Key, Value};

    fn started(dir: &TempDir) -> Database {
        let db = Database::open(dir.path());
        db.start().unwrap();
        db
    }

    fn write_file(staging: &TempDir, name: &str, bytes: &[u8]) -> PathBuf {
        let path = staging.path().join(name);
        fs::write(&path, bytes).unwrap();
        path
    }

    /// 313 bytes of XML beginning with `<?xml`.
    fn xml_payload() -> Vec<u8> {
        let payload =
            format!("<?xml version=\"1.0\"?>\n<Doc><Pad>{}</Pad></Doc>\n", "x".repeat(268));
        assert_eq!(payload.len(), 313);
        payload.into_bytes()
    }

    fn header_doc(staging: &TempDir, name: &str, id: u32, doc_type: &str) -> PathBuf {
        write_file(
            staging,
            name,
            format!("<Doc><Header><Id>{}</Id><Type>{}</Type></Header></Doc>", id, doc_type)
                .as_bytes(),
        )
    }

    #[test]
    fn tree_creation_and_uri_resolution() {
        let dir = TempDir::new().unwrap();
        let db = started(&dir);

        let data = db.root().unwrap().create_collection("data").unwrap();
        data.create_collection("foo").unwrap();

        let foo = db.collection("/data/foo").unwrap();
        assert_eq!(foo.uri().unwrap(), "/data/foo");
        assert_eq!(foo.parent().unwrap().unwrap().uri().unwrap(), "/data");
        assert_eq!(db.root().unwrap().uri().unwrap(), "/");
        // empty segments between slashes are skipped
        assert_eq!(db.collection("//data//foo/").unwrap().uri().unwrap(), "/data/foo");

        assert!(matches!(db.collection("/data/bar"), Err(Error::NotFound(_))));
        assert!(matches!(db.collection("data"), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn write_and_read_roundtrip_without_compression() {
        let dir = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let db = started(&dir);

        let foo = db
            .root()
            .unwrap()
            .create_collection("data")
            .unwrap()
            .create_collection("foo")
            .unwrap();
        let doc = foo.create_document("Foo-0001.xml").unwrap();
        assert_eq!(doc.media_type().unwrap(), MediaType::Xml);

        let payload = xml_payload();
        doc.set_content(&write_file(&staging, "src.xml", &payload)).unwrap();

        let read = doc.content_to_vec().unwrap();
        assert_eq!(read.len(), 313);
        assert_eq!(&read[..5], b"<?xml");
        assert_eq!(read, payload);
        assert_eq!(doc.original_length().unwrap(), 313);
        assert_eq!(doc.stored_length().unwrap(), 313);
        assert_eq!(doc.compression().unwrap(), CompressionMode::None);
    }

    #[test]
    fn compressed_documents_read_back_transparently() {
        let dir = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let db = started(&dir);

        let data = db.root().unwrap().create_collection("data").unwrap();
        data.set_compression_mode(Inheritable::Set(CompressionMode::Deflate)).unwrap();

        let payload = xml_payload();
        let doc = data.create_document("Foo-0001.xml").unwrap();
        doc.set_content(&write_file(&staging, "src.xml", &payload)).unwrap();

        assert_eq!(doc.compression().unwrap(), CompressionMode::Deflate);
        assert_eq!(doc.original_length().unwrap(), payload.len() as u64);
        assert!(doc.stored_length().unwrap() < payload.len() as u64);
        assert_eq!(doc.content_to_vec().unwrap(), payload);

        // documents in a child collection inherit the mode
        let sub = data.create_collection("sub").unwrap();
        assert_eq!(sub.effective_compression_mode().unwrap(), CompressionMode::Deflate);
    }

    #[test]
    fn indexed_documents_are_found_by_typed_key() {
        let dir = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let db = started(&dir);

        let data = db.root().unwrap().create_collection("data").unwrap();
        data.add_index("DocumentId", "//Header/Id", IndexType::Integer).unwrap();

        for (name, id) in [("one.xml", 1), ("two.xml", 2)] {
            let doc = data.create_document(name).unwrap();
            doc.set_content(&header_doc(&staging, name, id, "Foo")).unwrap();
        }

        let hits = data
            .find_documents(&[Key::new("DocumentId", Value::Integer(2))], true)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].uri().unwrap(), "/data/two.xml");

        // integer key 3 matches nothing
        let hits = data
            .find_documents(&[Key::new("DocumentId", Value::Integer(3))], true)
            .unwrap();
        assert!(hits.is_empty());

        // empty key sets are rejected
        assert!(matches!(data.find_documents(&[], true), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn conjunction_intersects_key_sets() {
        let dir = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let db = started(&dir);

        let data = db.root().unwrap().create_collection("data").unwrap();
        data.add_index("DocumentId", "//Header/Id", IndexType::Integer).unwrap();
        data.add_index("DocumentType", "//Header/Type", IndexType::String).unwrap();

        for (name, id, doc_type) in
            [("a.xml", 1, "Foo"), ("b.xml", 2, "Foo"), ("c.xml", 2, "Bar")]
        {
            let doc = data.create_document(name).unwrap();
            doc.set_content(&header_doc(&staging, name, id, doc_type)).unwrap();
        }

        let keys = [
            Key::new("DocumentId", Value::Integer(2)),
            Key::new("DocumentType", Value::String("Foo".to_owned())),
        ];
        let hits = data.find_documents(&keys, true).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].uri().unwrap(), "/data/b.xml");

        let none = data
            .find_documents(&[Key::new("DocumentType", Value::String("NonExisting".into()))], true)
            .unwrap();
        assert!(none.is_empty());

        // a key name with no index anywhere empties the conjunction
        let none = data
            .find_documents(
                &[
                    Key::new("DocumentId", Value::Integer(2)),
                    Key::new("Unknown", Value::Integer(2)),
                ],
                true,
            )
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn recursive_query_unions_subtrees() {
        let dir = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let db = started(&dir);

        let data = db.root().unwrap().create_collection("data").unwrap();
        data.add_index("DocumentId", "//Header/Id", IndexType::Integer).unwrap();

        let doc = data.create_document("top.xml").unwrap();
        doc.set_content(&header_doc(&staging, "top.xml", 7, "Foo")).unwrap();

        let sub = data.create_collection("sub").unwrap();
        let doc = sub.create_document("nested.xml").unwrap();
        doc.set_content(&header_doc(&staging, "nested.xml", 7, "Foo")).unwrap();

        let key = [Key::new("DocumentId", Value::Integer(7))];
        let scoped: Vec<String> = data
            .find_documents(&key, false)
            .unwrap()
            .iter()
            .map(|d| d.uri().unwrap())
            .collect();
        assert_eq!(scoped, vec!["/data/top.xml"]);

        let recursive: Vec<String> = data
            .find_documents(&key, true)
            .unwrap()
            .iter()
            .map(|d| d.uri().unwrap())
            .collect();
        assert_eq!(recursive, vec!["/data/sub/nested.xml", "/data/top.xml"]);

        // recursive equals the union of the per-subtree scoped queries
        let mut union: Vec<String> = data
            .find_documents(&key, false)
            .unwrap()
            .iter()
            .chain(sub.find_documents(&key, false).unwrap().iter())
            .map(|d| d.uri().unwrap())
            .collect();
        union.sort();
        assert_eq!(recursive, union);
    }

    #[test]
    fn rewriting_a_document_replaces_its_index_values() {
        let dir = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let db = started(&dir);

        let data = db.root().unwrap().create_collection("data").unwrap();
        data.add_index("DocumentId", "//Header/Id", IndexType::Integer).unwrap();

        let doc = data.create_document("a.xml").unwrap();
        doc.set_content(&header_doc(&staging, "a.xml", 1, "Foo")).unwrap();
        doc.set_content(&header_doc(&staging, "a2.xml", 2, "Foo")).unwrap();

        let old = data.find_documents(&[Key::new("DocumentId", Value::Integer(1))], false);
        assert!(old.unwrap().is_empty());
        let new = data.find_documents(&[Key::new("DocumentId", Value::Integer(2))], false);
        assert_eq!(new.unwrap().len(), 1);
    }

    #[test]
    fn manual_keys_behave_like_extracted_values() {
        let dir = TempDir::new().unwrap();
        let db = started(&dir);

        let data = db.root().unwrap().create_collection("data").unwrap();
        let doc = data.create_document("blob.bin").unwrap();
        assert_eq!(doc.media_type().unwrap(), MediaType::Binary);

        doc.set_key("Owner", Value::String("amy".into())).unwrap();
        let hits = data
            .find_documents(&[Key::new("Owner", Value::String("amy".into()))], false)
            .unwrap();
        assert_eq!(hits.len(), 1);

        // replaced, not accumulated
        doc.set_key("Owner", Value::String("beth".into())).unwrap();
        let hits = data
            .find_documents(&[Key::new("Owner", Value::String("amy".into()))], false)
            .unwrap();
        assert!(hits.is_empty());

        assert!(doc.set_key("  ", Value::Integer(1)).is_err());
    }

    #[test]
    fn catalog_survives_restart() {
        let dir = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let payload = xml_payload();

        {
            let db = started(&dir);
            let data = db.root().unwrap().create_collection("data").unwrap();
            data.add_index("DocumentId", "//Header/Id", IndexType::Integer).unwrap();
            data.create_collection("foo")
                .unwrap()
                .create_document("Foo-0001.xml")
                .unwrap()
                .set_content(&write_file(&staging, "src.xml", &payload))
                .unwrap();
            for (name, id) in [("one.xml", 1), ("two.xml", 2)] {
                let doc = data.create_document(name).unwrap();
                doc.set_content(&header_doc(&staging, name, id, "Foo")).unwrap();
            }
            db.shutdown().unwrap();
        }

        let db = started(&dir);
        // scenario 2 again, without re-inserting
        let doc = db.document("/data/foo/Foo-0001.xml").unwrap();
        assert_eq!(doc.media_type().unwrap(), MediaType::Xml);
        assert_eq!(doc.original_length().unwrap(), 313);
        assert_eq!(doc.content_to_vec().unwrap(), payload);

        // scenario 4 again, from the persisted index values
        let hits = db
            .collection("/data")
            .unwrap()
            .find_documents(&[Key::new("DocumentId", Value::Integer(2))], true)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].uri().unwrap(), "/data/two.xml");

        // the index definition itself is back too
        let defs = db.collection("/data").unwrap().indices().unwrap();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "DocumentId");
        assert_eq!(defs[0].path, "//Header/Id");

        // ids never restart below what was handed out
        let next = db.root().unwrap().create_collection("later").unwrap().id();
        assert!(next > hits[0].id());
    }

    #[test]
    fn lifecycle_is_idempotency_checked() {
        let dir = TempDir::new().unwrap();
        let db = Database::open(dir.path());

        assert!(!db.is_running());
        assert!(matches!(db.root(), Err(Error::NotRunning)));
        assert!(matches!(db.shutdown(), Err(Error::NotRunning)));

        db.start().unwrap();
        assert!(db.is_running());
        assert!(matches!(db.start(), Err(Error::AlreadyRunning(_))));

        // a second instance on the same directory is locked out
        let other = Database::open(dir.path());
        assert!(matches!(other.start(), Err(Error::AlreadyRunning(_))));

        // stale handles fail once the database is gone
        let root = db.root().unwrap();
        db.shutdown().unwrap();
        assert!(matches!(root.name(), Err(Error::NotRunning)));

        // and the directory is free again
        other.start().unwrap();
        other.shutdown().unwrap();
    }

    #[test]
    fn uri_predicates_classify_resources() {
        let dir = TempDir::new().unwrap();
        let db = started(&dir);

        let data = db.root().unwrap().create_collection("data").unwrap();
        data.create_document("a.txt").unwrap();

        assert!(db.is_collection("/data").unwrap());
        assert!(!db.is_document("/data").unwrap());
        assert!(db.is_document("/data/a.txt").unwrap());
        assert!(!db.is_collection("/data/a.txt").unwrap());
        assert!(db.exists("/data").unwrap());
        assert!(db.exists("/data/a.txt").unwrap());
        assert!(!db.exists("/data/missing").unwrap());
    }

    #[test]
    fn deletions_release_names_and_extents() {
        let dir = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let db = started(&dir);

        let data = db.root().unwrap().create_collection("data").unwrap();
        let doc = data.create_document("a.txt").unwrap();
        doc.set_content(&write_file(&staging, "a.txt", b"some text")).unwrap();

        data.delete_document("a.txt").unwrap();
        assert!(!db.exists("/data/a.txt").unwrap());
        assert!(matches!(doc.name(), Err(Error::NotFound(_))));
        // the name is reusable, the id is not
        let again = data.create_document("a.txt").unwrap();
        assert!(again.id() > doc.id());

        let sub = data.create_collection("sub").unwrap();
        sub.create_document("deep.txt")
            .unwrap()
            .set_content(&write_file(&staging, "deep.txt", b"deep"))
            .unwrap();
        data.delete_collection("sub").unwrap();
        assert!(!db.exists("/data/sub").unwrap());
        assert!(!db.exists("/data/sub/deep.txt").unwrap());
        assert!(matches!(data.delete_collection("sub"), Err(Error::NotFound(_))));
    }

    #[test]
    fn sibling_names_are_unique() {
        let dir = TempDir::new().unwrap();
        let db = started(&dir);

        let data = db.root().unwrap().create_collection("data").unwrap();
        data.create_document("thing").unwrap();
        assert!(matches!(data.create_document("thing"), Err(Error::AlreadyExists(_))));
        assert!(matches!(data.create_collection("thing"), Err(Error::AlreadyExists(_))));
        assert!(matches!(data.create_collection(""), Err(Error::InvalidArgument(_))));
        assert!(matches!(data.create_collection("a/b"), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn content_writer_commits_through_the_pipeline() {
        let dir = TempDir::new().unwrap();
        let db = started(&dir);

        let data = db.root().unwrap().create_collection("data").unwrap();
        let doc = data.create_document("streamed.txt").unwrap();

        let mut writer = doc.content_writer().unwrap();
        writer.write_all(b"written in ").unwrap();
        writer.write_all(b"two parts").unwrap();
        writer.commit().unwrap();

        assert_eq!(doc.content_to_vec().unwrap(), b"written in two parts");

        // dropping without commit leaves the content alone
        let mut writer = doc.content_writer().unwrap();
        writer.write_all(b"abandoned").unwrap();
        drop(writer);
        assert_eq!(doc.content_to_vec().unwrap(), b"written in two parts");
    }

    #[test]
    fn doc_queries_stream_document_content() {
        let dir = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let db = started(&dir);

        let data = db.root().unwrap().create_collection("data").unwrap();
        let doc = data.create_document("a.xml").unwrap();
        doc.set_content(&header_doc(&staging, "a.xml", 1, "Foo")).unwrap();

        let mut out = Vec::new();
        db.execute_query("doc(\"/data/a.xml\")").unwrap().read_to_end(&mut out).unwrap();
        assert_eq!(out, doc.content_to_vec().unwrap());

        assert!(matches!(db.execute_query(""), Err(Error::InvalidArgument(_))));
        assert!(matches!(db.execute_query("1 + 1"), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn required_validation_gates_xml_writes() {
        let dir = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let db = started(&dir);

        let data = db.root().unwrap().create_collection("data").unwrap();
        data.set_validation_mode(Inheritable::Set(ValidationMode::On)).unwrap();

        let doc = data.create_document("a.xml").unwrap();
        let unknown = write_file(
            &staging,
            "a.xml",
            br#"<Doc xmlns="urn:example:orders"><Id>1</Id></Doc>"#,
        );
        assert!(matches!(doc.set_content(&unknown), Err(Error::InvalidDocument { .. })));

        // registering the schema makes the same write acceptable
        let schema = data.create_document("orders.xsd").unwrap();
        assert_eq!(schema.media_type().unwrap(), MediaType::Schema);
        schema
            .set_content(&write_file(
                &staging,
                "orders.xsd",
                br#"<schema targetNamespace="urn:example:orders"/>"#,
            ))
            .unwrap();
        doc.set_content(&unknown).unwrap();

        // root stays explicit
        let root = db.root().unwrap();
        assert!(root.set_validation_mode(Inheritable::Inherit).is_err());
    }

    #[test]
    fn concurrent_readers_never_observe_torn_content() {
        let dir = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let db = Arc::new(Database::open(dir.path()));
        db.start().unwrap();

        let data = db.root().unwrap().create_collection("data").unwrap();
        let doc = data.create_document("conc.txt").unwrap();

        let a = write_file(&staging, "a.txt", &[b'A'; 2048]);
        let b = write_file(&staging, "b.txt", &[b'B'; 4096]);
        doc.set_content(&a).unwrap();

        let wg = WaitGroup::new();
        let mut handles = Vec::new();
        for worker in 0..4 {
            let db = Arc::clone(&db);
            let wg = wg.clone();
            let (a, b) = (a.clone(), b.clone());
            handles.push(thread::spawn(move || {
                let doc = db.document("/data/conc.txt").unwrap();
                drop(wg);
                for round in 0..10 {
                    let content = doc.content_to_vec().unwrap();
                    match content.len() {
                        2048 => assert!(content.iter().all(|byte| *byte == b'A')),
                        4096 => assert!(content.iter().all(|byte| *byte == b'B')),
                        other => panic!("torn read of {} bytes", other),
                    }
                    let src = if (worker + round) % 2 == 0 { &a } else { &b };
                    doc.set_content(src).unwrap();
                }
            }));
        }
        wg.wait();
        for handle in handles {
            handle.join().unwrap();
        }
        db.shutdown().unwrap();
    }
}
