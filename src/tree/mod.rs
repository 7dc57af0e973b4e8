//! The collection/document tree. Nodes are shared through the database's id
//! registries; the public [`Collection`] and [`Document`] handles pair a
//! node id with the database context, so the tree itself holds no back
//! references and relationships stay id-based.

use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::common::{CompressionMode, Inheritable, MediaType, ValidationMode};
use crate::index::{IndexDef, IndexValues};

mod collection;
mod document;

pub use collection::Collection;
pub use document::{ContentReader, ContentWriter, Document};

pub(crate) struct CollectionNode {
    pub id: u32,
    pub parent: Option<u32>,
    pub name: String,
    pub state: RwLock<CollectionState>,
}

pub(crate) struct CollectionState {
    pub created: i64,
    pub modified: i64,
    pub validation: Inheritable<ValidationMode>,
    pub compression: Inheritable<CompressionMode>,
    /// Child collections and documents by name; names share one namespace
    /// within a parent so URIs resolve unambiguously.
    pub children: BTreeMap<String, u32>,
    pub documents: BTreeMap<String, u32>,
    pub indices: BTreeMap<String, IndexDef>,
    pub values: IndexValues,
}

impl CollectionNode {
    pub fn new(
        id: u32,
        parent: Option<u32>,
        name: String,
        created: i64,
        validation: Inheritable<ValidationMode>,
        compression: Inheritable<CompressionMode>,
    ) -> CollectionNode {
        CollectionNode {
            id,
            parent,
            name,
            state: RwLock::new(CollectionState {
                created,
                modified: created,
                validation,
                compression,
                children: BTreeMap::new(),
                documents: BTreeMap::new(),
                indices: BTreeMap::new(),
                values: IndexValues::default(),
            }),
        }
    }
}

pub(crate) struct DocumentNode {
    pub id: u32,
    pub parent: u32,
    pub name: String,
    pub state: RwLock<DocumentState>,
}

pub(crate) struct DocumentState {
    pub media: MediaType,
    pub created: i64,
    pub modified: i64,
    /// Length before compression; what `stored_length` would be under
    /// `CompressionMode::None`.
    pub original_length: u64,
    /// Resolved at write time and kept on the document, so content reads
    /// decompress correctly even after the collection is reconfigured.
    pub compression: CompressionMode,
}

impl DocumentNode {
    pub fn new(id: u32, parent: u32, name: String, media: MediaType, created: i64) -> DocumentNode {
        DocumentNode {
            id,
            parent,
            name,
            state: RwLock::new(DocumentState {
                media,
                created,
                modified: created,
                original_length: 0,
                compression: CompressionMode::None,
            }),
        }
    }
}
