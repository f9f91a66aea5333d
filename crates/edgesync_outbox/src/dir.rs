//! Directory-backed storage.
//!
//! ```text
//! <outbox_path>/
//! ├─ LOCK                          # Advisory lock for single-writer
//! ├─ <edge-uuid>.log               # Event log of one edge
//! ├─ <edge-uuid>.downlink.cursor   # Last delivered sequence id
//! └─ <edge-uuid>.uplink.cursor     # Last applied uplink batch id
//! ```
//!
//! The LOCK file ensures only one process drives the outbox at a time.

use crate::backend::LogBackend;
use crate::cursor::Direction;
use crate::error::{StorageError, StorageResult};
use crate::file::{sync_parent, FileBackend};
use crate::record::compute_crc32;
use crate::storage::OutboxStorage;
use edgesync_protocol::EdgeId;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const LOG_EXTENSION: &str = "log";
const CURSOR_SIZE: usize = 12;

/// Outbox storage rooted at a directory.
///
/// Holds an exclusive lock on the directory for its whole lifetime.
#[derive(Debug)]
pub struct DirStorage {
    path: PathBuf,
    _lock_file: File,
}

impl DirStorage {
    /// Opens or creates an outbox directory.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory doesn't exist and `create_if_missing` is false
    /// - Another process holds the lock (returns `Locked`)
    /// - I/O errors occur
    pub fn open(path: &Path, create_if_missing: bool) -> StorageResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(StorageError::InvalidPath {
                    path: path.to_path_buf(),
                    reason: "directory does not exist".into(),
                });
            }
        }

        if !path.is_dir() {
            return Err(StorageError::InvalidPath {
                path: path.to_path_buf(),
                reason: "not a directory".into(),
            });
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(StorageError::Locked(path.to_path_buf()));
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns the directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of an edge's log file.
    #[must_use]
    pub fn log_path(&self, edge: EdgeId) -> PathBuf {
        self.path.join(format!("{edge}.{LOG_EXTENSION}"))
    }

    /// Path of a cursor file.
    #[must_use]
    pub fn cursor_path(&self, edge: EdgeId, direction: Direction) -> PathBuf {
        self.path
            .join(format!("{edge}.{}.cursor", direction.as_str()))
    }
}

fn remove_if_exists(path: &Path) -> StorageResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

impl OutboxStorage for DirStorage {
    fn open_log(&self, edge: EdgeId) -> StorageResult<Box<dyn LogBackend>> {
        let path = self.log_path(edge);
        let created = !path.exists();
        let backend = FileBackend::open(&path)?;
        if created {
            sync_parent(&path)?;
        }
        Ok(Box::new(backend))
    }

    fn load_cursor(&self, edge: EdgeId, direction: Direction) -> StorageResult<Option<u64>> {
        let path = self.cursor_path(edge, direction);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if data.len() != CURSOR_SIZE {
            return Err(StorageError::corrupted(format!(
                "cursor file {} has {} bytes",
                path.display(),
                data.len()
            )));
        }
        let (value, crc) = data.split_at(8);
        let stored = u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]);
        let computed = compute_crc32(value);
        if stored != computed {
            return Err(StorageError::ChecksumMismatch {
                offset: 0,
                expected: stored,
                actual: computed,
            });
        }
        let mut position = [0u8; 8];
        position.copy_from_slice(value);
        Ok(Some(u64::from_le_bytes(position)))
    }

    /// Writes `<cursor>.tmp`, syncs it, renames it into place and syncs the
    /// directory.
    fn store_cursor(&self, edge: EdgeId, direction: Direction, position: u64) -> StorageResult<()> {
        let path = self.cursor_path(edge, direction);
        let temp_path = path.with_extension("cursor.tmp");

        let value = position.to_le_bytes();
        let mut data = Vec::with_capacity(CURSOR_SIZE);
        data.extend_from_slice(&value);
        data.extend_from_slice(&compute_crc32(&value).to_le_bytes());

        let mut file = File::create(&temp_path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, &path)?;
        sync_parent(&path)?;
        Ok(())
    }

    fn list_edges(&self) -> StorageResult<Vec<EdgeId>> {
        let mut edges = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(LOG_EXTENSION) {
                continue;
            }
            if let Some(edge) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<EdgeId>().ok())
            {
                edges.push(edge);
            }
        }
        edges.sort();
        Ok(edges)
    }

    fn remove_edge(&self, edge: EdgeId) -> StorageResult<()> {
        remove_if_exists(&self.log_path(edge))?;
        for direction in [Direction::Downlink, Direction::Uplink] {
            remove_if_exists(&self.cursor_path(edge, direction))?;
        }
        sync_parent(&self.log_path(edge))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_directory() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("outbox");

        let storage = DirStorage::open(&path, true).unwrap();
        assert!(path.is_dir());
        assert!(path.join(LOCK_FILE).exists());
        assert_eq!(storage.path(), path);
    }

    #[test]
    fn open_fails_if_missing_and_no_create() {
        let temp = tempdir().unwrap();
        let result = DirStorage::open(&temp.path().join("nope"), false);
        assert!(matches!(result, Err(StorageError::InvalidPath { .. })));
    }

    #[test]
    fn lock_prevents_second_open() {
        let temp = tempdir().unwrap();
        let _first = DirStorage::open(temp.path(), true).unwrap();
        let second = DirStorage::open(temp.path(), true);
        assert!(matches!(second, Err(StorageError::Locked(_))));
    }

    #[test]
    fn lock_released_on_drop() {
        let temp = tempdir().unwrap();
        drop(DirStorage::open(temp.path(), true).unwrap());
        assert!(DirStorage::open(temp.path(), true).is_ok());
    }

    #[test]
    fn cursor_round_trip() {
        let temp = tempdir().unwrap();
        let storage = DirStorage::open(temp.path(), true).unwrap();
        let edge = EdgeId::new();

        assert_eq!(storage.load_cursor(edge, Direction::Downlink).unwrap(), None);
        storage.store_cursor(edge, Direction::Downlink, 41).unwrap();
        storage.store_cursor(edge, Direction::Downlink, 42).unwrap();
        assert_eq!(
            storage.load_cursor(edge, Direction::Downlink).unwrap(),
            Some(42)
        );
        assert_eq!(storage.load_cursor(edge, Direction::Uplink).unwrap(), None);
    }

    #[test]
    fn corrupted_cursor_is_detected() {
        let temp = tempdir().unwrap();
        let storage = DirStorage::open(temp.path(), true).unwrap();
        let edge = EdgeId::new();
        storage.store_cursor(edge, Direction::Downlink, 7).unwrap();

        let path = storage.cursor_path(edge, Direction::Downlink);
        let mut data = fs::read(&path).unwrap();
        data[0] ^= 0xff;
        fs::write(&path, data).unwrap();

        assert!(storage.load_cursor(edge, Direction::Downlink).is_err());
    }

    #[test]
    fn lists_and_removes_edges() {
        let temp = tempdir().unwrap();
        let storage = DirStorage::open(temp.path(), true).unwrap();
        let a = EdgeId::new();
        let b = EdgeId::new();
        storage.open_log(a).unwrap();
        storage.open_log(b).unwrap();
        storage.store_cursor(a, Direction::Downlink, 1).unwrap();

        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(storage.list_edges().unwrap(), expected);

        storage.remove_edge(a).unwrap();
        assert_eq!(storage.list_edges().unwrap(), vec![b]);
        assert!(!storage.cursor_path(a, Direction::Downlink).exists());
    }
}
