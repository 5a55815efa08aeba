//! Durable storage for the in-flight archive.
//!
//! A [`BodySink`] accepts the response body of the active download. Every
//! `append` is durable before it returns, so the sink's size is always a
//! trustworthy resume offset after a pause, disconnect or crash.
//!
//! Two sinks are provided:
//! - [`ChunkStore`]: the file is split into bounded records in an embedded
//!   database (the default)
//! - [`FileSink`]: the file is written to a flat `.part` file
//!
//! A sink holds one file at a time. It remembers which task that file
//! belongs to; binding a different task discards the old bytes.

mod chunk;
mod file;

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{StoreError, StoreResult};
use crate::task::TaskId;

pub use chunk::{chunk_layout, ChunkStore, CHUNK_LIMIT};
pub use file::FileSink;

/// Lazy sequence of file content, in order.
pub type ByteChunks = Box<dyn Iterator<Item = StoreResult<Bytes>> + Send>;

/// Append/resume-capable storage for one in-flight file.
pub trait BodySink: Send + Sync + 'static {
    /// Associates the sink with `task`.
    ///
    /// Returns `true` if bytes already stored for that task were kept, and
    /// `false` if the sink was reset for a new owner.
    fn bind(&self, task: TaskId) -> StoreResult<bool>;

    /// The task the stored bytes belong to.
    fn owner(&self) -> Option<TaskId>;

    /// Durably appends `bytes` to the end of the file.
    fn append(&self, bytes: &[u8]) -> StoreResult<()>;

    /// Number of bytes durably stored.
    fn current_size(&self) -> u64;

    /// Discards every stored byte.
    fn reset(&self) -> StoreResult<()>;

    /// Reads the stored file back in order.
    ///
    /// Each call starts a fresh pass over the content.
    fn materialize(&self) -> StoreResult<ByteChunks>;
}

/// Which sink backs downloads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SinkKind {
    /// Bounded records in an embedded database.
    #[default]
    Chunked,
    /// A flat partial file.
    File,
}

impl std::str::FromStr for SinkKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "chunked" | "chunks" | "database" => Ok(Self::Chunked),
            "file" => Ok(Self::File),
            other => Err(format!("unknown sink kind '{}'", other)),
        }
    }
}

/// Opens the sink selected by `kind` under `dir`.
pub fn open_sink(kind: SinkKind, dir: &Path, chunk_limit: u32) -> StoreResult<Arc<dyn BodySink>> {
    Ok(match kind {
        SinkKind::Chunked => Arc::new(ChunkStore::open_with_limit(dir, chunk_limit)?),
        SinkKind::File => Arc::new(FileSink::open(dir)?),
    })
}

/// Runs a sink operation on the blocking thread pool.
pub(crate) async fn blocking<T, F>(sink: &Arc<dyn BodySink>, op: F) -> StoreResult<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn BodySink) -> StoreResult<T> + Send + 'static,
{
    let sink = Arc::clone(sink);
    tokio::task::spawn_blocking(move || op(sink.as_ref()))
        .await
        .map_err(|e| StoreError::Worker(e.to_string()))?
}

/// Collects a materialized file into memory.
pub fn read_all(content: ByteChunks) -> StoreResult<Vec<u8>> {
    let mut out = Vec::new();
    for chunk in content {
        out.extend_from_slice(&chunk?);
    }
    Ok(out)
}
