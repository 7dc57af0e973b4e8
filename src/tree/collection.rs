use std::collections::BTreeSet;
use std::sync::Arc;

use log::debug;

use crate::common::{
    now_millis, CompressionMode, Inheritable, MediaType, ValidationMode,
};
use crate::database::DbInner;
use crate::error::{Error, Result};
use crate::index::{IndexDef, IndexType, Key, Value};
use crate::tree::{CollectionNode, Document, DocumentNode};

/// Handle to one collection in the tree. Handles are cheap to clone and
/// stay valid across threads; operations fail with `NotRunning` after the
/// database they belong to has been shut down.
#[derive(Clone)]
pub struct Collection {
    pub(crate) db: Arc<DbInner>,
    pub(crate) id: u32,
}

impl Collection {
    pub(crate) fn new(db: Arc<DbInner>, id: u32) -> Collection {
        Collection { db, id }
    }

    fn node(&self) -> Result<Arc<CollectionNode>> {
        self.db.check_alive()?;
        self.db.collection_node(self.id)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> Result<String> {
        Ok(self.node()?.name.clone())
    }

    /// Absolute URI of this collection; the root is `/`.
    pub fn uri(&self) -> Result<String> {
        self.node()?;
        self.db.collection_uri(self.id)
    }

    pub fn parent(&self) -> Result<Option<Collection>> {
        let node = self.node()?;
        Ok(node.parent.map(|id| Collection::new(self.db.clone(), id)))
    }

    pub fn created(&self) -> Result<i64> {
        Ok(self.node()?.state.read().unwrap().created)
    }

    pub fn modified(&self) -> Result<i64> {
        Ok(self.node()?.state.read().unwrap().modified)
    }

    /// The mode as configured on this collection, which may defer to the
    /// parent. Use [`Collection::effective_validation_mode`] for the
    /// resolved value.
    pub fn validation_mode(&self) -> Result<Inheritable<ValidationMode>> {
        Ok(self.node()?.state.read().unwrap().validation)
    }

    pub fn effective_validation_mode(&self) -> Result<ValidationMode> {
        self.node()?;
        Ok(self.db.effective_validation(self.id))
    }

    pub fn set_validation_mode(&self, mode: Inheritable<ValidationMode>) -> Result<()> {
        let node = self.node()?;
        if node.parent.is_none() && mode.is_inherit() {
            return Err(Error::InvalidArgument(
                "the root collection cannot inherit its validation mode".to_owned(),
            ));
        }
        let _guard = self.db.locks.write(self.id);
        let mut state = node.state.write().unwrap();
        state.validation = mode;
        state.modified = now_millis();
        Ok(())
    }

    pub fn compression_mode(&self) -> Result<Inheritable<CompressionMode>> {
        Ok(self.node()?.state.read().unwrap().compression)
    }

    pub fn effective_compression_mode(&self) -> Result<CompressionMode> {
        self.node()?;
        Ok(self.db.effective_compression(self.id))
    }

    pub fn set_compression_mode(&self, mode: Inheritable<CompressionMode>) -> Result<()> {
        let node = self.node()?;
        if node.parent.is_none() && mode.is_inherit() {
            return Err(Error::InvalidArgument(
                "the root collection cannot inherit its compression mode".to_owned(),
            ));
        }
        let _guard = self.db.locks.write(self.id);
        let mut state = node.state.write().unwrap();
        state.compression = mode;
        state.modified = now_millis();
        Ok(())
    }

    /// Creates a child collection. New collections inherit both modes until
    /// configured otherwise.
    pub fn create_collection(&self, name: &str) -> Result<Collection> {
        let node = self.node()?;
        validate_name(name)?;
        let _guard = self.db.locks.write(self.id);
        let mut state = node.state.write().unwrap();
        if state.children.contains_key(name) || state.documents.contains_key(name) {
            return Err(Error::AlreadyExists(self.missing_uri(name)));
        }
        let id = self.db.ids.next();
        let child = CollectionNode::new(
            id,
            Some(self.id),
            name.to_owned(),
            now_millis(),
            Inheritable::Inherit,
            Inheritable::Inherit,
        );
        self.db.collections.insert(id, Arc::new(child));
        state.children.insert(name.to_owned(), id);
        state.modified = now_millis();
        debug!("collection {} created with id {}", name, id);
        Ok(Collection::new(self.db.clone(), id))
    }

    /// Creates an empty document, inferring the media type from the name's
    /// extension.
    pub fn create_document(&self, name: &str) -> Result<Document> {
        self.create_document_as(name, MediaType::from_name(name))
    }

    pub fn create_document_as(&self, name: &str, media: MediaType) -> Result<Document> {
        let node = self.node()?;
        validate_name(name)?;
        let _guard = self.db.locks.write(self.id);
        let mut state = node.state.write().unwrap();
        if state.children.contains_key(name) || state.documents.contains_key(name) {
            return Err(Error::AlreadyExists(self.missing_uri(name)));
        }
        let id = self.db.ids.next();
        self.db.store.create(id)?;
        let doc = DocumentNode::new(id, self.id, name.to_owned(), media, now_millis());
        self.db.documents.insert(id, Arc::new(doc));
        state.documents.insert(name.to_owned(), id);
        state.modified = now_millis();
        debug!("document {} created with id {}", name, id);
        Ok(Document::new(self.db.clone(), id))
    }

    /// Child collection by name.
    pub fn collection(&self, name: &str) -> Result<Collection> {
        let node = self.node()?;
        let state = node.state.read().unwrap();
        match state.children.get(name) {
            Some(id) => Ok(Collection::new(self.db.clone(), *id)),
            None => Err(Error::NotFound(self.missing_uri(name))),
        }
    }

    /// Child document by name.
    pub fn document(&self, name: &str) -> Result<Document> {
        let node = self.node()?;
        let state = node.state.read().unwrap();
        match state.documents.get(name) {
            Some(id) => Ok(Document::new(self.db.clone(), *id)),
            None => Err(Error::NotFound(self.missing_uri(name))),
        }
    }

    fn missing_uri(&self, name: &str) -> String {
        self.db.child_uri(self.id, name).unwrap_or_else(|_| name.to_owned())
    }

    /// Child collections in name order.
    pub fn collections(&self) -> Result<Vec<Collection>> {
        let node = self.node()?;
        let state = node.state.read().unwrap();
        Ok(state
            .children
            .values()
            .map(|id| Collection::new(self.db.clone(), *id))
            .collect())
    }

    /// Child documents in name order.
    pub fn documents(&self) -> Result<Vec<Document>> {
        let node = self.node()?;
        let state = node.state.read().unwrap();
        Ok(state
            .documents
            .values()
            .map(|id| Document::new(self.db.clone(), *id))
            .collect())
    }

    /// Defines an index on this collection. The name must be unused across
    /// the whole inheritance chain, since descendants see inherited indices
    /// next to their own.
    pub fn add_index(&self, name: &str, path: &str, value_type: IndexType) -> Result<()> {
        let node = self.node()?;
        if name.trim().is_empty() {
            return Err(Error::InvalidArgument("empty index name".to_owned()));
        }
        if path.trim().is_empty() || !path.starts_with('/') {
            return Err(Error::InvalidArgument(format!("invalid index path {:?}", path)));
        }
        let _guard = self.db.locks.write(self.id);
        if self.db.effective_indices(self.id)?.iter().any(|def| def.name == name) {
            return Err(Error::AlreadyExists(format!("index {}", name)));
        }
        let id = self.db.ids.next();
        let mut state = node.state.write().unwrap();
        state.indices.insert(
            name.to_owned(),
            IndexDef { id, name: name.to_owned(), path: path.to_owned(), value_type },
        );
        state.modified = now_millis();
        Ok(())
    }

    /// Indices defined directly on this collection, in name order.
    pub fn indices(&self) -> Result<Vec<IndexDef>> {
        let node = self.node()?;
        let state = node.state.read().unwrap();
        Ok(state.indices.values().cloned().collect())
    }

    /// Indices visible here: own definitions plus everything inherited from
    /// ancestors, in name order.
    pub fn inherited_indices(&self) -> Result<Vec<IndexDef>> {
        self.node()?;
        self.db.effective_indices(self.id)
    }

    /// Records an index value for a document of this collection. Also the
    /// callback the indexing pipeline feeds.
    pub fn add_index_value(&self, key: &str, value: Value, document: u32) -> Result<()> {
        let node = self.node()?;
        if key.trim().is_empty() {
            return Err(Error::InvalidArgument("empty index key name".to_owned()));
        }
        let _guard = self.db.locks.write(self.id);
        node.state.write().unwrap().values.add(key, value, document);
        Ok(())
    }

    /// Deletes a child collection and, recursively, everything below it.
    /// Content extents of deleted documents become free space.
    pub fn delete_collection(&self, name: &str) -> Result<()> {
        let node = self.node()?;
        let _guard = self.db.locks.write(self.id);
        let child_id = {
            let mut state = node.state.write().unwrap();
            let id = state
                .children
                .remove(name)
                .ok_or_else(|| Error::NotFound(self.missing_uri(name)))?;
            state.modified = now_millis();
            id
        };
        self.db.drop_collection_tree(child_id)
    }

    /// Deletes a child document and releases its content extent.
    pub fn delete_document(&self, name: &str) -> Result<()> {
        let node = self.node()?;
        let _guard = self.db.locks.write(self.id);
        let doc_id = {
            let mut state = node.state.write().unwrap();
            let id = state
                .documents
                .remove(name)
                .ok_or_else(|| Error::NotFound(self.missing_uri(name)))?;
            state.modified = now_millis();
            id
        };
        // wait out readers before the content goes away
        let doc_guard = self.db.locks.write(doc_id);
        self.db.drop_document(doc_id);
        drop(doc_guard);
        self.db.locks.remove(doc_id);
        Ok(())
    }

    /// Documents matching every key, optionally across the whole subtree,
    /// ordered by absolute URI.
    pub fn find_documents(&self, keys: &[Key], recursive: bool) -> Result<Vec<Document>> {
        self.node()?;
        if keys.is_empty() {
            return Err(Error::InvalidArgument("empty query key set".to_owned()));
        }
        let mut ids = BTreeSet::new();
        self.collect_matches(self.id, keys, recursive, &mut ids)?;

        let mut found: Vec<(String, Document)> = Vec::with_capacity(ids.len());
        for id in ids {
            found.push((self.db.document_uri(id)?, Document::new(self.db.clone(), id)));
        }
        found.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(found.into_iter().map(|(_, doc)| doc).collect())
    }

    fn collect_matches(
        &self,
        collection: u32,
        keys: &[Key],
        recursive: bool,
        out: &mut BTreeSet<u32>,
    ) -> Result<()> {
        let node = self.db.collection_node(collection)?;
        let children: Vec<u32> = {
            let _guard = self.db.locks.read(collection);
            let state = node.state.read().unwrap();

            let mut matched: Option<BTreeSet<u32>> = None;
            for key in keys {
                let hits = state.values.lookup(&key.name, &key.value);
                matched = Some(match matched {
                    None => hits,
                    Some(prev) => prev.intersection(&hits).copied().collect(),
                });
                if matched.as_ref().map_or(false, BTreeSet::is_empty) {
                    break;
                }
            }

            // stale index entries may cite documents that left the
            // collection; they never reach the result
            let members: BTreeSet<u32> = state.documents.values().copied().collect();
            out.extend(
                matched.unwrap_or_default().into_iter().filter(|id| members.contains(id)),
            );
            state.children.values().copied().collect()
        };

        if recursive {
            for child in children {
                self.collect_matches(child, keys, recursive, out)?;
            }
        }
        Ok(())
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidArgument("empty name".to_owned()));
    }
    if name.contains('/') {
        return Err(Error::InvalidArgument(format!("name {:?} contains '/'", name)));
    }
    Ok(())
}
