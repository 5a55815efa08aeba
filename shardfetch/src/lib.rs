//! shardfetch - Resumable, crash-safe downloads of ledger history shards
//!
//! This library fetches large shard archives from remote servers one at a
//! time. Every received buffer is durably stored before the next read is
//! issued, so a download survives network interruption, explicit pause and
//! process crash alike and always resumes from the last stored byte.
//!
//! # Architecture
//!
//! ```text
//! TaskCoordinator ──► TaskQueue (sled: task table)
//!        │
//!        ▼
//! DownloadEngine (single-run strand, pause/resume/stop)
//!        │
//!        ▼
//!     Session ──► Transport (HTTP/1.1 + TLS)
//!        │
//!        ▼
//!   BodySink ──► ChunkStore (sled: chunk table) | FileSink
//!        │
//!        ▼
//! ArchiveImporter (validation + import, external)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use shardfetch::{DirectoryImporter, DownloaderConfig, TaskCoordinator};
//!
//! let config = DownloaderConfig::new("/var/lib/shardfetch");
//! let importer = Arc::new(DirectoryImporter::new("/var/lib/shards"));
//! let coordinator = TaskCoordinator::with_reqwest(config, importer)?;
//!
//! coordinator.add(5, "https://example.com/5.tar.lz4");
//! coordinator.start();
//! coordinator.wait_idle().await;
//! ```

pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod import;
pub mod logging;
pub mod policy;
pub mod queue;
pub mod session;
pub mod state;
pub mod store;
pub mod task;
pub mod transport;

pub use config::DownloaderConfig;
pub use coordinator::{CoordinatorEvent, TaskCoordinator};
pub use engine::DownloadEngine;
pub use error::{
    CoordinatorError, EngineError, RegistrationError, SessionError, StoreError, TransportError,
    ValidationError,
};
pub use import::{ArchiveImporter, DirectoryImporter};
pub use policy::{RetryPolicy, ValidationPolicy};
pub use queue::TaskQueue;
pub use session::{SessionOutcome, SessionState};
pub use state::DownloadState;
pub use store::{BodySink, ByteChunks, ChunkStore, FileSink, SinkKind, CHUNK_LIMIT};
pub use task::{Task, TaskId, TaskStatus};
pub use transport::{MemoryResource, MemoryTransport, ReqwestTransport, Transport};
