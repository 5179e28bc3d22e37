//! Content-addressed blob storage.
//!
//! Raw documents and every derived artifact (page images, per-page OCR
//! text, assembled text) live here, addressed by the SHA-256 of their
//! bytes:
//!
//! ```text
//! <root>/objects/ba/7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad
//! ```
//!
//! Writes are idempotent and atomic. A second `put` of the same bytes is a
//! no-op; a `put` whose hash already exists with *different* bytes on disk
//! is reported as corruption, which the pipeline treats as fatal.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::StorageError;
use crate::models::ContentHash;

const TEMP_PREFIX: &str = ".incoming-";

#[derive(Debug, Clone)]
pub struct ContentStore {
    objects: PathBuf,
}

/// Result of a full store scan.
#[derive(Debug, Default)]
pub struct StoreReport {
    pub objects_checked: u64,
    pub corrupt: Vec<String>,
}

impl ContentStore {
    pub fn open(objects: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let objects = objects.into();
        fs::create_dir_all(&objects)?;
        Ok(Self { objects })
    }

    pub fn root(&self) -> &Path {
        &self.objects
    }

    fn object_path(&self, hash: &ContentHash) -> PathBuf {
        let (prefix, rest) = hash.as_str().split_at(2);
        self.objects.join(prefix).join(rest)
    }

    pub fn exists(&self, hash: &ContentHash) -> bool {
        self.object_path(hash).is_file()
    }

    pub fn put(&self, bytes: &[u8]) -> Result<ContentHash, StorageError> {
        let hash = ContentHash::compute(bytes);
        let path = self.object_path(&hash);

        if path.is_file() {
            self.check_existing(&hash, &path, bytes)?;
            return Ok(hash);
        }

        let dir = match path.parent() {
            Some(dir) => dir.to_path_buf(),
            None => self.objects.clone(),
        };
        fs::create_dir_all(&dir)?;

        let mut tmp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(&dir)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;

        match tmp.persist_noclobber(&path) {
            Ok(_) => {}
            // Lost a race with a concurrent writer; the winner must hold the same bytes.
            Err(e) if e.error.kind() == ErrorKind::AlreadyExists => {
                self.check_existing(&hash, &path, bytes)?;
                return Ok(hash);
            }
            Err(e) => return Err(StorageError::IoFailure(e.error)),
        }
        sync_dir(&dir)?;

        tracing::debug!(hash = %hash.short(), size = bytes.len(), "stored object");
        Ok(hash)
    }

    fn check_existing(
        &self,
        hash: &ContentHash,
        path: &Path,
        bytes: &[u8],
    ) -> Result<(), StorageError> {
        let existing = fs::read(path)?;
        if existing != bytes {
            return Err(StorageError::CorruptionDetected {
                content_hash: hash.to_string(),
                detail: "stored bytes differ from bytes being written".to_string(),
            });
        }
        Ok(())
    }

    /// Read an object back, re-hashing it on the way out.
    pub fn get(&self, hash: &ContentHash) -> Result<Vec<u8>, StorageError> {
        let path = self.object_path(hash);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StorageError::NotFound(hash.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let actual = ContentHash::compute(&bytes);
        if &actual != hash {
            return Err(StorageError::CorruptionDetected {
                content_hash: hash.to_string(),
                detail: format!("content hashes to {}", actual),
            });
        }
        Ok(bytes)
    }

    /// Re-hash every stored object.
    pub fn verify(&self) -> Result<StoreReport, StorageError> {
        let mut report = StoreReport::default();

        for entry in WalkDir::new(&self.objects).min_depth(2).max_depth(2) {
            let entry = entry.map_err(|e| {
                StorageError::IoFailure(
                    e.into_io_error()
                        .unwrap_or_else(|| std::io::Error::other("walk failed")),
                )
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(TEMP_PREFIX) {
                continue;
            }
            let prefix = entry
                .path()
                .parent()
                .and_then(|p| p.file_name())
                .map(|p| p.to_string_lossy().to_string())
                .unwrap_or_default();

            report.objects_checked += 1;
            let expected = format!("{}{}", prefix, name);
            let bytes = fs::read(entry.path())?;
            let actual = ContentHash::compute(&bytes);
            if actual.as_str() != expected {
                tracing::error!(expected = %expected, actual = %actual, "corrupt object");
                report.corrupt.push(expected);
            }
        }

        Ok(report)
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<(), StorageError> {
    fs::File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<(), StorageError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, ContentStore) {
        let tmp = TempDir::new().unwrap();
        let store = ContentStore::open(tmp.path().join("objects")).unwrap();
        (tmp, store)
    }

    #[test]
    fn put_get_exists() {
        let (_tmp, store) = store();
        let hash = store.put(b"page one").unwrap();
        assert!(store.exists(&hash));
        assert_eq!(store.get(&hash).unwrap(), b"page one");
    }

    #[test]
    fn put_is_idempotent() {
        let (_tmp, store) = store();
        let a = store.put(b"same").unwrap();
        let b = store.put(b"same").unwrap();
        assert_eq!(a, b);
        assert_eq!(store.verify().unwrap().objects_checked, 1);
    }

    #[test]
    fn missing_object_is_not_found() {
        let (_tmp, store) = store();
        let hash = ContentHash::compute(b"never stored");
        assert!(matches!(store.get(&hash), Err(StorageError::NotFound(_))));
    }

    #[test]
    fn tampered_object_detected_on_get_and_put() {
        let (_tmp, store) = store();
        let hash = store.put(b"original").unwrap();
        fs::write(store.object_path(&hash), b"tampered").unwrap();

        let err = store.get(&hash).unwrap_err();
        assert!(err.is_fatal());

        let err = store.put(b"original").unwrap_err();
        assert!(matches!(err, StorageError::CorruptionDetected { .. }));

        let report = store.verify().unwrap();
        assert_eq!(report.corrupt, vec![hash.to_string()]);
    }

    #[test]
    fn no_temp_files_left_behind() {
        let (_tmp, store) = store();
        store.put(b"x").unwrap();
        let leftovers = WalkDir::new(store.root())
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(TEMP_PREFIX))
            .count();
        assert_eq!(leftovers, 0);
    }
}
