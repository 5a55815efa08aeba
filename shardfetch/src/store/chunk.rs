//! Chunked durable storage in an embedded database.
//!
//! The in-flight file is stored as numbered chunks of at most `chunk_limit`
//! bytes each, keeping every value under the storage engine's size ceiling.
//!
//! # Layout
//!
//! - tree `chunks`: big-endian part index, big-endian offset in part → payload
//! - tree `meta`: `owner` → big-endian task id
//!
//! Each append lands as new records and never rewrites stored ones, so the
//! bytes written stay proportional to the file size. A chunk is the run of
//! records sharing a part index, concatenated in offset order.
//!
//! Chunks are numbered contiguously from 0 and every chunk except the last
//! holds exactly `chunk_limit` bytes. Only the last chunk is ever appended
//! to; once full it is never touched again.

use std::ops::Bound;
use std::path::Path;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{BodySink, ByteChunks};
use crate::error::{StoreError, StoreResult};
use crate::task::TaskId;

/// Largest chunk payload: 4 KiB of headroom below 2^31 - 1 bytes.
pub const CHUNK_LIMIT: u32 = i32::MAX as u32 - 4096;

const CHUNKS_TREE: &str = "chunks";
const META_TREE: &str = "meta";
const OWNER_KEY: &[u8] = b"owner";

type RecordKey = [u8; 8];

/// Chunk count and last chunk size of a file of `size` bytes.
///
/// The last chunk holds `size % limit` bytes, or a full `limit` when the
/// size divides evenly.
pub fn chunk_layout(size: u64, limit: u32) -> (u64, u32) {
    if size == 0 || limit == 0 {
        return (0, 0);
    }
    let limit = u64::from(limit);
    let count = size.div_ceil(limit);
    let last = size - (count - 1) * limit;
    (count, last as u32)
}

/// Position of the append cursor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Cursor {
    parts: u32,
    last_size: u32,
}

impl Cursor {
    fn total(&self, limit: u32) -> u64 {
        match self.parts {
            0 => 0,
            parts => u64::from(parts - 1) * u64::from(limit) + u64::from(self.last_size),
        }
    }
}

fn record_key(part: u32, offset: u32) -> RecordKey {
    let mut key = [0u8; 8];
    key[..4].copy_from_slice(&part.to_be_bytes());
    key[4..].copy_from_slice(&offset.to_be_bytes());
    key
}

fn parse_record_key(key: &[u8]) -> Option<(u32, u32)> {
    let key: RecordKey = key.try_into().ok()?;
    let part = u32::from_be_bytes([key[0], key[1], key[2], key[3]]);
    let offset = u32::from_be_bytes([key[4], key[5], key[6], key[7]]);
    Some((part, offset))
}

fn malformed_key(key: &[u8]) -> StoreError {
    StoreError::Corrupt(format!("malformed chunk key {:?}", key))
}

/// Recomputes the cursor from the stored records, checking the layout.
fn scan_layout(chunks: &sled::Tree, limit: u32) -> StoreResult<Cursor> {
    let mut cursor = Cursor::default();
    for entry in chunks.iter() {
        let (key, value) = entry?;
        let (part, offset) = parse_record_key(&key).ok_or_else(|| malformed_key(&key))?;

        let opens_part = part == cursor.parts;
        if opens_part {
            if offset != 0 {
                return Err(StoreError::Corrupt(format!(
                    "chunk {} starts at offset {}",
                    part, offset
                )));
            }
            if cursor.parts > 0 && cursor.last_size != limit {
                return Err(StoreError::Corrupt(format!(
                    "chunk {} holds {} bytes but is followed by chunk {}",
                    part - 1,
                    cursor.last_size,
                    part
                )));
            }
        } else if cursor.parts == 0 || part != cursor.parts - 1 {
            return Err(StoreError::Corrupt(format!(
                "expected chunk {}, found chunk {}",
                cursor.parts, part
            )));
        } else if offset != cursor.last_size {
            return Err(StoreError::Corrupt(format!(
                "chunk {} has a gap at offset {}, record starts at {}",
                part, cursor.last_size, offset
            )));
        }

        let end = u64::from(offset) + value.len() as u64;
        if end > u64::from(limit) {
            return Err(StoreError::Corrupt(format!(
                "chunk {} holds {} bytes, limit is {}",
                part, end, limit
            )));
        }
        if opens_part {
            cursor.parts += 1;
        }
        cursor.last_size = end as u32;
    }
    Ok(cursor)
}

/// Durable chunked store for the in-flight file.
pub struct ChunkStore {
    db: sled::Db,
    chunks: sled::Tree,
    meta: sled::Tree,
    chunk_limit: u32,
    cursor: Mutex<Cursor>,
    owner: Mutex<Option<TaskId>>,
}

impl ChunkStore {
    /// Opens (or creates) a store at `path` with the default chunk limit.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        Self::open_with_limit(path, CHUNK_LIMIT)
    }

    /// Opens (or creates) a store at `path` with a custom chunk limit.
    ///
    /// A stored chunk set that does not fit the layout for `chunk_limit` is
    /// discarded.
    pub fn open_with_limit(path: impl AsRef<Path>, chunk_limit: u32) -> StoreResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db, chunk_limit)
    }

    /// Creates a store that lives only as long as the value.
    pub fn temporary(chunk_limit: u32) -> StoreResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db, chunk_limit)
    }

    fn from_db(db: sled::Db, chunk_limit: u32) -> StoreResult<Self> {
        if chunk_limit == 0 || chunk_limit > CHUNK_LIMIT {
            return Err(StoreError::InvalidChunkLimit(chunk_limit));
        }

        let chunks = db.open_tree(CHUNKS_TREE)?;
        let meta = db.open_tree(META_TREE)?;
        let owner = meta.get(OWNER_KEY)?.and_then(|v| TaskId::from_key(&v));

        let store = Self {
            db,
            chunks,
            meta,
            chunk_limit,
            cursor: Mutex::new(Cursor::default()),
            owner: Mutex::new(owner),
        };

        match scan_layout(&store.chunks, chunk_limit) {
            Ok(cursor) => *store.cursor.lock() = cursor,
            Err(StoreError::Corrupt(reason)) => {
                warn!(reason = %reason, "Discarding inconsistent chunk set");
                store.reset()?;
            }
            Err(e) => return Err(e),
        }

        debug!(
            owner = ?owner,
            chunks = store.chunk_count(),
            records = store.record_count(),
            bytes = store.current_size(),
            "Opened chunk store"
        );
        Ok(store)
    }

    /// Maximum payload of a single chunk.
    pub fn chunk_limit(&self) -> u32 {
        self.chunk_limit
    }

    /// Number of stored chunks.
    pub fn chunk_count(&self) -> u32 {
        self.cursor.lock().parts
    }

    /// Number of stored records across all chunks.
    pub fn record_count(&self) -> usize {
        self.chunks.len()
    }

    /// Bytes the database occupies on disk.
    pub fn size_on_disk(&self) -> StoreResult<u64> {
        Ok(self.db.size_on_disk()?)
    }

    /// `(part index, size)` of every stored chunk, in order.
    pub fn chunk_sizes(&self) -> StoreResult<Vec<(u32, u32)>> {
        let mut sizes: Vec<(u32, u32)> = Vec::new();
        for entry in self.chunks.iter() {
            let (key, value) = entry?;
            let (part, _) = parse_record_key(&key).ok_or_else(|| malformed_key(&key))?;
            match sizes.last_mut() {
                Some((last, size)) if *last == part => *size += value.len() as u32,
                _ => sizes.push((part, value.len() as u32)),
            }
        }
        Ok(sizes)
    }

    fn write_parts(&self, start: Cursor, bytes: &[u8]) -> StoreResult<Cursor> {
        let mut batch = sled::Batch::default();
        let mut next = start;
        let mut remaining = bytes;
        while !remaining.is_empty() {
            if next.parts == 0 || next.last_size == self.chunk_limit {
                next.parts += 1;
                next.last_size = 0;
            }
            let room = (self.chunk_limit - next.last_size) as usize;
            let (head, tail) = remaining.split_at(room.min(remaining.len()));
            batch.insert(&record_key(next.parts - 1, next.last_size)[..], head);
            next.last_size += head.len() as u32;
            remaining = tail;
        }
        self.chunks.apply_batch(batch)?;
        self.db.flush()?;
        Ok(next)
    }
}

impl BodySink for ChunkStore {
    fn bind(&self, task: TaskId) -> StoreResult<bool> {
        let mut owner = self.owner.lock();
        if *owner == Some(task) {
            return Ok(true);
        }
        if self.current_size() > 0 {
            debug!(previous = ?*owner, task = %task, "Chunk set belongs to another task, discarding");
        }
        self.reset()?;
        self.meta.insert(OWNER_KEY, &task.to_key()[..])?;
        self.db.flush()?;
        *owner = Some(task);
        Ok(false)
    }

    fn owner(&self) -> Option<TaskId> {
        *self.owner.lock()
    }

    fn append(&self, bytes: &[u8]) -> StoreResult<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let mut cursor = self.cursor.lock();
        match self.write_parts(*cursor, bytes) {
            Ok(next) => {
                *cursor = next;
                Ok(())
            }
            Err(e) => {
                // The batch may have landed without its flush; trust only what is stored.
                if let Ok(actual) = scan_layout(&self.chunks, self.chunk_limit) {
                    *cursor = actual;
                }
                Err(e)
            }
        }
    }

    fn current_size(&self) -> u64 {
        self.cursor.lock().total(self.chunk_limit)
    }

    fn reset(&self) -> StoreResult<()> {
        let mut cursor = self.cursor.lock();
        self.chunks.clear()?;
        self.db.flush()?;
        *cursor = Cursor::default();
        Ok(())
    }

    fn materialize(&self) -> StoreResult<ByteChunks> {
        Ok(Box::new(ChunkReader {
            chunks: self.chunks.clone(),
            after: None,
            remaining: self.current_size(),
        }))
    }
}

/// Reads records back one at a time in key order.
struct ChunkReader {
    chunks: sled::Tree,
    after: Option<RecordKey>,
    remaining: u64,
}

impl ChunkReader {
    fn read_next(&mut self) -> StoreResult<Bytes> {
        let entry = match self.after {
            Some(key) => self.chunks.range((Bound::Excluded(key), Bound::Unbounded)).next(),
            None => self.chunks.iter().next(),
        };
        let Some(entry) = entry else {
            return Err(StoreError::Corrupt(format!(
                "chunk set ends {} bytes short",
                self.remaining
            )));
        };
        let (key, value) = entry?;
        self.after = Some(key[..].try_into().map_err(|_| malformed_key(&key))?);

        let take = value.len().min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
        self.remaining -= take as u64;
        Ok(Bytes::copy_from_slice(&value[..take]))
    }
}

impl Iterator for ChunkReader {
    type Item = StoreResult<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let item = self.read_next();
        if item.is_err() {
            self.remaining = 0;
        }
        Some(item)
    }
}
