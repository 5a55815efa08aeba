//! Flat-file body sink.
//!
//! Writes the in-flight archive to `download.part` in the sink directory,
//! with the owning task recorded in `download.owner`. Every append is
//! followed by `sync_data`, so the file length is a safe resume offset.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use parking_lot::Mutex;

use super::{BodySink, ByteChunks};
use crate::error::{StoreError, StoreResult};
use crate::task::TaskId;

/// Buffer size for reading the file back (64KB).
const BUFFER_SIZE: usize = 64 * 1024;

const PART_FILE: &str = "download.part";
const OWNER_FILE: &str = "download.owner";

struct FileState {
    file: File,
    len: u64,
    owner: Option<TaskId>,
}

/// Body sink writing to a single partial file.
pub struct FileSink {
    part_path: PathBuf,
    owner_path: PathBuf,
    state: Mutex<FileState>,
}

impl FileSink {
    /// Opens (or creates) the sink in `dir`.
    pub fn open(dir: impl AsRef<Path>) -> StoreResult<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;

        let part_path = dir.join(PART_FILE);
        let owner_path = dir.join(OWNER_FILE);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&part_path)
            .map_err(|e| StoreError::io(&part_path, e))?;
        let len = file
            .metadata()
            .map_err(|e| StoreError::io(&part_path, e))?
            .len();

        let owner = match fs::read_to_string(&owner_path) {
            Ok(text) => text.trim().parse::<u32>().ok().map(TaskId::new),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(StoreError::io(&owner_path, e)),
        };

        Ok(Self {
            part_path,
            owner_path,
            state: Mutex::new(FileState { file, len, owner }),
        })
    }

    /// Path of the partial file.
    pub fn part_path(&self) -> &Path {
        &self.part_path
    }

    fn write_owner(&self, task: TaskId) -> StoreResult<()> {
        let mut file =
            File::create(&self.owner_path).map_err(|e| StoreError::io(&self.owner_path, e))?;
        file.write_all(task.to_string().as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(|e| StoreError::io(&self.owner_path, e))
    }

    fn truncate(&self, state: &mut FileState) -> StoreResult<()> {
        state
            .file
            .set_len(0)
            .and_then(|_| state.file.sync_all())
            .map_err(|e| StoreError::io(&self.part_path, e))?;
        state.len = 0;
        Ok(())
    }
}

impl BodySink for FileSink {
    fn bind(&self, task: TaskId) -> StoreResult<bool> {
        let mut state = self.state.lock();
        if state.owner == Some(task) {
            return Ok(true);
        }
        self.truncate(&mut state)?;
        self.write_owner(task)?;
        state.owner = Some(task);
        Ok(false)
    }

    fn owner(&self) -> Option<TaskId> {
        self.state.lock().owner
    }

    fn append(&self, bytes: &[u8]) -> StoreResult<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock();
        let written = state
            .file
            .write_all(bytes)
            .and_then(|_| state.file.sync_data());
        match written {
            Ok(()) => {
                state.len += bytes.len() as u64;
                Ok(())
            }
            Err(e) => {
                // A short write may have landed; the file length is authoritative.
                if let Ok(meta) = state.file.metadata() {
                    state.len = meta.len();
                }
                Err(StoreError::io(&self.part_path, e))
            }
        }
    }

    fn current_size(&self) -> u64 {
        self.state.lock().len
    }

    fn reset(&self) -> StoreResult<()> {
        let mut state = self.state.lock();
        self.truncate(&mut state)
    }

    fn materialize(&self) -> StoreResult<ByteChunks> {
        let len = self.current_size();
        let file = File::open(&self.part_path).map_err(|e| StoreError::io(&self.part_path, e))?;
        Ok(Box::new(FileReader {
            file,
            path: self.part_path.clone(),
            remaining: len,
        }))
    }
}

/// Reads the partial file in fixed-size blocks.
struct FileReader {
    file: File,
    path: PathBuf,
    remaining: u64,
}

impl Iterator for FileReader {
    type Item = StoreResult<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let want = (BUFFER_SIZE as u64).min(self.remaining) as usize;
        let mut buffer = vec![0u8; want];
        match self.file.read(&mut buffer) {
            Ok(0) => {
                self.remaining = 0;
                Some(Err(StoreError::Corrupt(format!(
                    "{} is shorter than its recorded length",
                    self.path.display()
                ))))
            }
            Ok(read) => {
                buffer.truncate(read);
                self.remaining -= read as u64;
                Some(Ok(Bytes::from(buffer)))
            }
            Err(e) => {
                self.remaining = 0;
                Some(Err(StoreError::io(&self.path, e)))
            }
        }
    }
}
