//! Catalog persistence. The tree, its metadata and the index values live in
//! three binary files next to the content store, written at shutdown and
//! read back at start. Integers are big-endian, strings length-prefixed
//! UTF-8, timestamps milliseconds since the epoch; each file leads with a
//! format version byte.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;

use crossbeam_skiplist::SkipMap;
use log::warn;

use crate::codec;
use crate::common::{
    compression_from_tag, compression_tag, validation_from_tag, validation_tag, CompressionMode,
    Inheritable, MediaType,
};
use crate::error::{Error, Result};
use crate::index::{IndexDef, IndexType, Value};
use crate::tree::{CollectionNode, CollectionState, DocumentNode};

const METADATA_FILE: &str = "metadata.dbx";
const COLLECTIONS_FILE: &str = "collections.dbx";
const INDICES_FILE: &str = "indices.dbx";
const CATALOG_VERSION: u8 = 1;

type Collections = SkipMap<u32, Arc<CollectionNode>>;
type Documents = SkipMap<u32, Arc<DocumentNode>>;

/// `next_id` from the metadata file, or `None` on a fresh directory.
pub(crate) fn load_metadata(dir: &Path) -> Result<Option<u32>> {
    let path = dir.join(METADATA_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let mut r = BufReader::new(File::open(path)?);
    check_version(&mut r, "metadata")?;
    Ok(Some(codec::read_u32(&mut r)?))
}

pub(crate) fn save_metadata(dir: &Path, next_id: u32) -> Result<()> {
    let mut w = BufWriter::new(File::create(dir.join(METADATA_FILE))?);
    codec::write_u8(&mut w, CATALOG_VERSION)?;
    codec::write_u32(&mut w, next_id)?;
    w.flush()?;
    Ok(())
}

/// Loads the collection tree into the registries and returns the root id,
/// or `None` on a fresh directory.
pub(crate) fn load_tree(
    dir: &Path,
    collections: &Collections,
    documents: &Documents,
) -> Result<Option<u32>> {
    let path = dir.join(COLLECTIONS_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let mut r = BufReader::new(File::open(path)?);
    check_version(&mut r, "collections")?;
    let root = read_collection(&mut r, None, collections, documents)?;
    Ok(Some(root))
}

/// Writes the tree depth-first from the root.
pub(crate) fn save_tree(
    dir: &Path,
    root: u32,
    collections: &Collections,
    documents: &Documents,
) -> Result<()> {
    let mut w = BufWriter::new(File::create(dir.join(COLLECTIONS_FILE))?);
    codec::write_u8(&mut w, CATALOG_VERSION)?;
    write_collection(&mut w, root, collections, documents)?;
    w.flush()?;
    Ok(())
}

fn write_collection(
    w: &mut impl Write,
    id: u32,
    collections: &Collections,
    documents: &Documents,
) -> Result<()> {
    let node = collections
        .get(&id)
        .map(|entry| entry.value().clone())
        .ok_or_else(|| Error::catalog(format!("collection {} missing from the registry", id)))?;
    let state = node.state.read().unwrap();

    codec::write_u32(w, node.id)?;
    codec::write_string(w, &node.name)?;
    codec::write_i64(w, state.created)?;
    codec::write_i64(w, state.modified)?;
    codec::write_u8(w, validation_tag(state.validation))?;
    codec::write_u8(w, compression_tag(state.compression))?;

    codec::write_u32(w, state.indices.len() as u32)?;
    for def in state.indices.values() {
        codec::write_u32(w, def.id)?;
        codec::write_string(w, &def.name)?;
        codec::write_string(w, &def.path)?;
        codec::write_u8(w, def.value_type.tag())?;
    }

    codec::write_u32(w, state.documents.len() as u32)?;
    for doc_id in state.documents.values() {
        let doc = documents
            .get(doc_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::catalog(format!("document {} missing from the registry", doc_id)))?;
        let doc_state = doc.state.read().unwrap();
        codec::write_u32(w, doc.id)?;
        codec::write_string(w, &doc.name)?;
        codec::write_u8(w, doc_state.media.tag())?;
        codec::write_i64(w, doc_state.created)?;
        codec::write_i64(w, doc_state.modified)?;
        codec::write_u64(w, doc_state.original_length)?;
        codec::write_u8(w, compression_tag(Inheritable::Set(doc_state.compression)))?;
    }

    let children: Vec<u32> = state.children.values().copied().collect();
    codec::write_u32(w, children.len() as u32)?;
    drop(state);
    for child in children {
        write_collection(w, child, collections, documents)?;
    }
    Ok(())
}

fn read_collection(
    r: &mut impl Read,
    parent: Option<u32>,
    collections: &Collections,
    documents: &Documents,
) -> Result<u32> {
    let id = codec::read_u32(r)?;
    let name = codec::read_string(r)?;
    let created = codec::read_i64(r)?;
    let modified = codec::read_i64(r)?;
    let validation = validation_from_tag(codec::read_u8(r)?)?;
    let compression = compression_from_tag(codec::read_u8(r)?)?;

    let node = CollectionNode::new(id, parent, name, created, validation, compression);
    {
        let mut state = node.state.write().unwrap();
        state.modified = modified;

        let index_count = codec::read_u32(r)?;
        for _ in 0..index_count {
            let def_id = codec::read_u32(r)?;
            let def_name = codec::read_string(r)?;
            let path = codec::read_string(r)?;
            let value_type = IndexType::from_tag(codec::read_u8(r)?)?;
            state.indices.insert(
                def_name.clone(),
                IndexDef { id: def_id, name: def_name, path, value_type },
            );
        }

        let document_count = codec::read_u32(r)?;
        for _ in 0..document_count {
            let doc_id = codec::read_u32(r)?;
            let doc_name = codec::read_string(r)?;
            let media = MediaType::from_tag(codec::read_u8(r)?)?;
            let doc_created = codec::read_i64(r)?;
            let doc_modified = codec::read_i64(r)?;
            let original_length = codec::read_u64(r)?;
            let doc_compression = document_compression(codec::read_u8(r)?)?;

            let doc = DocumentNode::new(doc_id, id, doc_name.clone(), media, doc_created);
            {
                let mut doc_state = doc.state.write().unwrap();
                doc_state.modified = doc_modified;
                doc_state.original_length = original_length;
                doc_state.compression = doc_compression;
            }
            documents.insert(doc_id, Arc::new(doc));
            state.documents.insert(doc_name, doc_id);
        }
    }
    collections.insert(id, Arc::new(node));

    let child_count = codec::read_u32(r)?;
    let mut children = Vec::with_capacity(child_count as usize);
    for _ in 0..child_count {
        let child = read_collection(r, Some(id), collections, documents)?;
        children.push(child);
    }
    // child names are re-derived from the children themselves
    if let Some(entry) = collections.get(&id) {
        let node = entry.value();
        let mut state = node.state.write().unwrap();
        for child in children {
            if let Some(child_entry) = collections.get(&child) {
                state.children.insert(child_entry.value().name.clone(), child);
            }
        }
    }
    Ok(id)
}

fn document_compression(tag: u8) -> Result<CompressionMode> {
    match compression_from_tag(tag)? {
        Inheritable::Set(mode) => Ok(mode),
        Inheritable::Inherit => {
            Err(Error::catalog("a document cannot inherit its compression mode".to_owned()))
        }
    }
}

/// Loads the per-collection index value dumps, dropping entries whose
/// document no longer exists.
pub(crate) fn load_index_values(
    dir: &Path,
    collections: &Collections,
    documents: &Documents,
) -> Result<()> {
    let path = dir.join(INDICES_FILE);
    if !path.exists() {
        return Ok(());
    }
    let mut r = BufReader::new(File::open(path)?);
    check_version(&mut r, "indices")?;

    let collection_count = codec::read_u32(&mut r)?;
    for _ in 0..collection_count {
        let id = codec::read_u32(&mut r)?;
        let node = collections.get(&id).map(|entry| entry.value().clone());
        if node.is_none() {
            warn!("index values reference unknown collection {}", id);
        }
        let key_count = codec::read_u32(&mut r)?;
        for _ in 0..key_count {
            let key = codec::read_string(&mut r)?;
            let value_count = codec::read_u32(&mut r)?;
            for _ in 0..value_count {
                let value = read_value(&mut r)?;
                let doc_count = codec::read_u32(&mut r)?;
                for _ in 0..doc_count {
                    let doc_id = codec::read_u32(&mut r)?;
                    if !documents.contains_key(&doc_id) {
                        warn!(
                            "dropping index value for {:?}: document {} no longer exists",
                            key, doc_id
                        );
                        continue;
                    }
                    if let Some(node) = &node {
                        node.state.write().unwrap().values.add(&key, value.clone(), doc_id);
                    }
                }
            }
        }
    }
    Ok(())
}

pub(crate) fn save_index_values(dir: &Path, collections: &Collections) -> Result<()> {
    let mut dumps: Vec<(u32, Arc<CollectionNode>)> = Vec::new();
    for entry in collections.iter() {
        if !entry.value().state.read().unwrap().values.is_empty() {
            dumps.push((*entry.key(), entry.value().clone()));
        }
    }

    let mut w = BufWriter::new(File::create(dir.join(INDICES_FILE))?);
    codec::write_u8(&mut w, CATALOG_VERSION)?;
    codec::write_u32(&mut w, dumps.len() as u32)?;
    for (id, node) in dumps {
        let state = node.state.read().unwrap();
        codec::write_u32(&mut w, id)?;
        write_values(&mut w, &state)?;
    }
    w.flush()?;
    Ok(())
}

fn write_values(w: &mut impl Write, state: &CollectionState) -> Result<()> {
    let keys: Vec<_> = state.values.iter().collect();
    codec::write_u32(w, keys.len() as u32)?;
    for (key, values) in keys {
        codec::write_string(w, key)?;
        codec::write_u32(w, values.len() as u32)?;
        for (value, ids) in values {
            write_value(w, value)?;
            codec::write_u32(w, ids.len() as u32)?;
            for id in ids {
                codec::write_u32(w, *id)?;
            }
        }
    }
    Ok(())
}

fn write_value(w: &mut impl Write, value: &Value) -> Result<()> {
    match value {
        Value::String(v) => {
            codec::write_u8(w, IndexType::String.tag())?;
            codec::write_string(w, v)
        }
        Value::Integer(v) => {
            codec::write_u8(w, IndexType::Integer.tag())?;
            codec::write_i32(w, *v)
        }
        Value::Long(v) => {
            codec::write_u8(w, IndexType::Long.tag())?;
            codec::write_i64(w, *v)
        }
        Value::Float(v) => {
            codec::write_u8(w, IndexType::Float.tag())?;
            codec::write_f32(w, *v)
        }
        Value::Double(v) => {
            codec::write_u8(w, IndexType::Double.tag())?;
            codec::write_f64(w, *v)
        }
    }
}

fn read_value(r: &mut impl Read) -> Result<Value> {
    match IndexType::from_tag(codec::read_u8(r)?)? {
        IndexType::String => Ok(Value::String(codec::read_string(r)?)),
        IndexType::Integer => Ok(Value::Integer(codec::read_i32(r)?)),
        IndexType::Long => Ok(Value::Long(codec::read_i64(r)?)),
        IndexType::Float => Ok(Value::Float(codec::read_f32(r)?)),
        IndexType::Double => Ok(Value::Double(codec::read_f64(r)?)),
        IndexType::Date => Err(Error::catalog("date index values are not supported".to_owned())),
    }
}

fn check_version(r: &mut impl Read, file: &str) -> Result<()> {
    let version = codec::read_u8(r)?;
    if version != CATALOG_VERSION {
        return Err(Error::catalog(format!("unsupported {} version {}", file, version)));
    }
    Ok(())
}
