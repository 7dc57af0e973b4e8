//! The on-disk content store. Document bytes live in one flat blob file,
//! `contents.dbx`; an in-memory map from document id to (offset, length)
//! extent is the allocation table, persisted to `documents.dbx` on `sync`.
//! Placement is first-fit over the gaps left by deleted extents; the file is
//! never compacted.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use log::debug;

use crate::codec;
use crate::error::{Error, Result};

const BLOB_FILE: &str = "contents.dbx";
const FAT_FILE: &str = "documents.dbx";
const FAT_VERSION: u8 = 1;

/// One stored region of the blob file. `length` is the stored (possibly
/// compressed) byte count, not the document's original length.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Extent {
    offset: u64,
    length: u64,
}

pub(crate) struct ContentStore {
    dir: PathBuf,
    blob: Mutex<File>,
    entries: RwLock<BTreeMap<u32, Extent>>,
}

impl ContentStore {
    /// Opens the store in `dir`, creating the blob file if needed and
    /// reloading the allocation table written by the last `sync`.
    pub fn open(dir: &Path) -> Result<ContentStore> {
        fs::create_dir_all(dir)?;
        let blob = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(dir.join(BLOB_FILE))?;
        let entries = load_fat(&dir.join(FAT_FILE))?;
        debug!("content store opened with {} entries", entries.len());
        Ok(ContentStore {
            dir: dir.to_path_buf(),
            blob: Mutex::new(blob),
            entries: RwLock::new(entries),
        })
    }

    /// Reserves an empty entry for a new document id.
    pub fn create(&self, id: u32) -> Result<()> {
        let mut entries = self.entries.write().unwrap();
        if entries.contains_key(&id) {
            return Err(Error::AlreadyExists(format!("content entry {}", id)));
        }
        entries.insert(id, Extent { offset: 0, length: 0 });
        Ok(())
    }

    /// Stores `len` bytes from `src` under `id`, choosing a fresh first-fit
    /// placement. An existing extent for `id` is dropped first.
    pub fn store<R: Read>(&self, id: u32, src: &mut R, len: u64) -> Result<u64> {
        let offset = {
            let mut entries = self.entries.write().unwrap();
            let offset = first_fit(&entries, id, len);
            entries.insert(id, Extent { offset, length: len });
            offset
        };
        if let Err(e) = self.write_extent(offset, src, len) {
            // keep the entry alive but empty, as if freshly created
            self.entries.write().unwrap().insert(id, Extent { offset: 0, length: 0 });
            return Err(Error::store(format!("content entry {}", id), e));
        }
        Ok(len)
    }

    /// Stores a whole file under `id`.
    pub fn store_file(&self, id: u32, src: &Path) -> Result<u64> {
        let len = fs::metadata(src)?.len();
        let mut reader = File::open(src)?;
        self.store(id, &mut reader, len)
    }

    fn write_extent<R: Read>(&self, offset: u64, src: &mut R, len: u64) -> io::Result<()> {
        let mut blob = self.blob.lock().unwrap();
        blob.seek(SeekFrom::Start(offset))?;
        let written = io::copy(&mut src.take(len), &mut *blob)?;
        if written != len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("expected {} content bytes, got {}", len, written),
            ));
        }
        blob.flush()
    }

    /// Opens a seekable stream over the stored bytes of `id`. The stream
    /// carries its own file handle, so dropping it never disturbs the
    /// store's handle or other streams.
    pub fn retrieve(&self, id: u32) -> Result<ExtentReader> {
        let extent = self
            .entries
            .read()
            .unwrap()
            .get(&id)
            .copied()
            .ok_or_else(|| Error::NotFound(format!("content entry {}", id)))?;
        let file = File::open(self.dir.join(BLOB_FILE))
            .map_err(|e| Error::store(format!("content entry {}", id), e))?;
        Ok(ExtentReader { file, start: extent.offset, length: extent.length, pos: 0 })
    }

    /// Stored length of `id`, if the entry exists.
    pub fn length(&self, id: u32) -> Option<u64> {
        self.entries.read().unwrap().get(&id).map(|e| e.length)
    }

    pub fn exists(&self, id: u32) -> bool {
        self.entries.read().unwrap().contains_key(&id)
    }

    pub fn size(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    /// Drops the entry for `id`; its extent becomes free space.
    pub fn delete(&self, id: u32) -> Result<()> {
        let mut entries = self.entries.write().unwrap();
        entries
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("content entry {}", id)))
    }

    /// Truncates the blob file and forgets every entry.
    pub fn delete_all(&self) -> Result<()> {
        let mut entries = self.entries.write().unwrap();
        self.blob.lock().unwrap().set_len(0)?;
        entries.clear();
        drop(entries);
        self.sync()
    }

    /// Rewrites the allocation table from memory and flushes the blob file.
    pub fn sync(&self) -> Result<()> {
        let entries = self.entries.read().unwrap();
        let tmp = self.dir.join(format!("{}.tmp", FAT_FILE));
        {
            let mut w = BufWriter::new(File::create(&tmp)?);
            codec::write_u8(&mut w, FAT_VERSION)?;
            codec::write_u32(&mut w, entries.len() as u32)?;
            for (id, extent) in entries.iter() {
                codec::write_u32(&mut w, *id)?;
                codec::write_u64(&mut w, extent.offset)?;
                codec::write_u64(&mut w, extent.length)?;
            }
            w.flush()?;
        }
        fs::rename(&tmp, self.dir.join(FAT_FILE))?;
        self.blob.lock().unwrap().sync_all()?;
        Ok(())
    }

    #[cfg(test)]
    fn extents(&self) -> Vec<(u64, u64)> {
        let mut v: Vec<(u64, u64)> = self
            .entries
            .read()
            .unwrap()
            .values()
            .filter(|e| e.length > 0)
            .map(|e| (e.offset, e.length))
            .collect();
        v.sort_unstable();
        v
    }
}

/// First gap between live extents that holds `needed` bytes; appends past
/// the last extent when none fits. The extent currently owned by `id` does
/// not count, it is being replaced.
fn first_fit(entries: &BTreeMap<u32, Extent>, id: u32, needed: u64) -> u64 {
    let mut extents: Vec<Extent> = entries
        .iter()
        .filter(|(eid, e)| **eid != id && e.length > 0)
        .map(|(_, e)| *e)
        .collect();
    extents.sort_by_key(|e| e.offset);

    let mut cursor = 0u64;
    for extent in extents {
        if extent.offset.saturating_sub(cursor) >= needed {
            return cursor;
        }
        cursor = extent.offset + extent.length;
    }
    cursor
}

fn load_fat(path: &Path) -> Result<BTreeMap<u32, Extent>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let mut r = BufReader::new(File::open(path)?);
    let version = codec::read_u8(&mut r)?;
    if version != FAT_VERSION {
        return Err(Error::catalog(format!("unsupported content table version {}", version)));
    }
    let count = codec::read_u32(&mut r)?;
    let mut entries = BTreeMap::new();
    for _ in 0..count {
        let id = codec::read_u32(&mut r)?;
        let offset = codec::read_u64(&mut r)?;
        let length = codec::read_u64(&mut r)?;
        entries.insert(id, Extent { offset, length });
    }
    Ok(entries)
}

/// A bounded, seekable view of one extent. Reads position the underlying
/// handle on every call, so concurrent streams never share a cursor.
pub struct ExtentReader {
    file: File,
    start: u64,
    length: u64,
    pos: u64,
}

impl ExtentReader {
    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Bytes left before the end of the extent.
    pub fn remaining(&self) -> u64 {
        self.length.saturating_sub(self.pos)
    }
}

impl Read for ExtentReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.remaining();
        if remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let want = (buf.len() as u64).min(remaining) as usize;
        self.file.seek(SeekFrom::Start(self.start + self.pos))?;
        let n = self.file.read(&mut buf[..want])?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for ExtentReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => n as i128,
            SeekFrom::Current(d) => self.pos as i128 + d as i128,
            SeekFrom::End(d) => self.length as i128 + d as i128,
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of content",
            ));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }
}
