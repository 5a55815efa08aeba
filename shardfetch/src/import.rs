//! Hand-off of completed archives.
//!
//! Once every byte of an archive is stored, the coordinator passes the
//! materialized content to an [`ArchiveImporter`]. The importer validates
//! it and moves it into permanent storage; only after it succeeds is the
//! task removed from the queue. A crash in between means the same archive
//! is handed over again on restart, so importers must tolerate repeats.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::error::ValidationError;
use crate::store::ByteChunks;
use crate::task::{Task, TaskId};

/// File extension of imported archives.
pub const ARCHIVE_EXTENSION: &str = "tar.lz4";

/// Validates and imports completed archives.
///
/// Called from a blocking worker thread.
pub trait ArchiveImporter: Send + Sync + 'static {
    /// Validates `content` as the archive of `task` and imports it.
    fn validate_and_import(&self, task: &Task, content: ByteChunks) -> Result<(), ValidationError>;
}

impl<F> ArchiveImporter for F
where
    F: Fn(&Task, ByteChunks) -> Result<(), ValidationError> + Send + Sync + 'static,
{
    fn validate_and_import(&self, task: &Task, content: ByteChunks) -> Result<(), ValidationError> {
        self(task, content)
    }
}

/// Lowercase hex SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Importer writing archives into a directory.
///
/// Each archive is written to a temporary file in the target directory,
/// hashed while it is written, and renamed to `<task id>.tar.lz4` once its
/// digest has been checked. Importing the same task again replaces the
/// file.
#[derive(Debug, Clone)]
pub struct DirectoryImporter {
    dir: PathBuf,
    expected: HashMap<TaskId, String>,
}

impl DirectoryImporter {
    /// Creates an importer writing into `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            expected: HashMap::new(),
        }
    }

    /// Requires the archive of `task` to have SHA-256 digest `hex`.
    pub fn with_expected_digest(mut self, task: TaskId, hex: impl Into<String>) -> Self {
        self.expected.insert(task, hex.into().to_ascii_lowercase());
        self
    }

    /// Directory archives are imported into.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Final location of the archive of `task`.
    pub fn archive_path(&self, task: TaskId) -> PathBuf {
        self.dir.join(format!("{}.{}", task, ARCHIVE_EXTENSION))
    }

    fn write_temp(&self, task: &Task, content: ByteChunks) -> Result<(NamedTempFile, String), ValidationError> {
        let failed = |reason: String| ValidationError::ImportFailed {
            task: task.id,
            reason,
        };

        fs::create_dir_all(&self.dir)
            .map_err(|e| failed(format!("cannot create {}: {}", self.dir.display(), e)))?;
        let mut file = NamedTempFile::new_in(&self.dir)
            .map_err(|e| failed(format!("cannot create temporary file: {}", e)))?;

        let mut hasher = Sha256::new();
        let mut written: u64 = 0;
        for chunk in content {
            let chunk = chunk?;
            hasher.update(&chunk);
            file.write_all(&chunk)
                .map_err(|e| failed(format!("write failed: {}", e)))?;
            written += chunk.len() as u64;
        }
        file.as_file()
            .sync_all()
            .map_err(|e| failed(format!("sync failed: {}", e)))?;

        debug!(task = %task.id, bytes = written, "Archive written to temporary file");
        Ok((file, format!("{:x}", hasher.finalize())))
    }
}

impl ArchiveImporter for DirectoryImporter {
    fn validate_and_import(&self, task: &Task, content: ByteChunks) -> Result<(), ValidationError> {
        let (file, actual) = self.write_temp(task, content)?;

        if let Some(expected) = self.expected.get(&task.id) {
            if *expected != actual {
                // Dropping the temporary file removes it.
                return Err(ValidationError::ChecksumMismatch {
                    task: task.id,
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        let target = self.archive_path(task.id);
        file.persist(&target)
            .map_err(|e| ValidationError::ImportFailed {
                task: task.id,
                reason: format!("cannot move archive to {}: {}", target.display(), e.error),
            })?;

        info!(task = %task.id, path = %target.display(), sha256 = %actual, "Archive imported");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{StoreError, StoreResult};
    use bytes::Bytes;
    use reqwest::Url;

    fn task(id: u32) -> Task {
        let url = Url::parse(&format!("https://example.com/{}.tar.lz4", id)).unwrap();
        Task::new(TaskId::new(id), url)
    }

    fn content(parts: &[&'static [u8]]) -> ByteChunks {
        let parts: Vec<StoreResult<Bytes>> = parts.iter().map(|p| Ok(Bytes::from_static(*p))).collect();
        Box::new(parts.into_iter())
    }

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_import_writes_archive() {
        let dir = tempfile::tempdir().unwrap();
        let importer = DirectoryImporter::new(dir.path().join("shards"));

        importer
            .validate_and_import(&task(4), content(&[b"hello ", b"world"]))
            .unwrap();

        let path = importer.archive_path(TaskId::new(4));
        assert!(path.ends_with("4.tar.lz4"));
        assert_eq!(fs::read(path).unwrap(), b"hello world");
    }

    #[test]
    fn test_expected_digest_is_checked() {
        let dir = tempfile::tempdir().unwrap();
        let importer = DirectoryImporter::new(dir.path())
            .with_expected_digest(TaskId::new(1), sha256_hex(b"good").to_uppercase())
            .with_expected_digest(TaskId::new(2), sha256_hex(b"good"));

        importer.validate_and_import(&task(1), content(&[b"good"])).unwrap();

        let err = importer
            .validate_and_import(&task(2), content(&[b"bad"]))
            .unwrap_err();
        assert!(matches!(err, ValidationError::ChecksumMismatch { task, .. } if task == TaskId::new(2)));
        assert!(!importer.archive_path(TaskId::new(2)).exists());

        // Only the imported archive is left behind.
        let entries = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn test_reimport_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let importer = DirectoryImporter::new(dir.path());

        importer.validate_and_import(&task(9), content(&[b"abc"])).unwrap();
        importer.validate_and_import(&task(9), content(&[b"abc"])).unwrap();

        assert_eq!(fs::read(importer.archive_path(TaskId::new(9))).unwrap(), b"abc");
    }

    #[test]
    fn test_read_error_aborts_import() {
        let dir = tempfile::tempdir().unwrap();
        let importer = DirectoryImporter::new(dir.path());
        let broken: ByteChunks = Box::new(
            vec![
                Ok(Bytes::from_static(b"abc")),
                Err(StoreError::Corrupt("chunk 1 is missing".to_string())),
            ]
            .into_iter(),
        );

        let err = importer.validate_and_import(&task(3), broken).unwrap_err();
        assert!(matches!(err, ValidationError::Store(_)));
        assert!(!importer.archive_path(TaskId::new(3)).exists());
    }

    #[test]
    fn test_closure_importer() {
        let importer = |task: &Task, chunks: ByteChunks| -> Result<(), ValidationError> {
            let data = crate::store::read_all(chunks)?;
            if data.is_empty() {
                return Err(ValidationError::ImportFailed {
                    task: task.id,
                    reason: "empty archive".to_string(),
                });
            }
            Ok(())
        };

        assert!(importer.validate_and_import(&task(1), content(&[b"x"])).is_ok());
        assert!(importer.validate_and_import(&task(1), content(&[])).is_err());
    }
}
