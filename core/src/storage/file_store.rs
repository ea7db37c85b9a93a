//! Immutable data file storage

use bytes::Bytes;
use dashmap::DashMap;
use memmap2::Mmap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::ids::FileRef;

const FILE_EXTENSION: &str = "lkdf";

#[derive(Error, Debug)]
pub enum FileStoreError {
    #[error("file not found: {0}")]
    NotFound(String),

    #[error("invalid file reference: {0}")]
    InvalidRef(String),

    #[error("file store unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type FileStoreResult<T> = Result<T, FileStoreError>;

/// Storage for immutable data files.
///
/// Files are never rewritten once `put` returns; a reference stays valid
/// until the file is deleted by garbage collection.
pub trait FileStore: Send + Sync {
    /// Store `data` for `table` and return its reference
    fn put(&self, table: &str, data: Bytes) -> FileStoreResult<FileRef>;

    fn get(&self, file: &FileRef) -> FileStoreResult<Bytes>;

    /// Delete a file, returning its size if it existed
    fn delete(&self, file: &FileRef) -> FileStoreResult<Option<u64>>;

    fn exists(&self, file: &FileRef) -> FileStoreResult<bool>;

    /// All files currently stored
    fn list(&self) -> FileStoreResult<Vec<FileRef>>;
}

fn new_file_ref(table: &str) -> FileStoreResult<FileRef> {
    if table.is_empty() || table.contains(['/', '\\']) || table.starts_with('.') {
        return Err(FileStoreError::InvalidRef(table.to_string()));
    }
    Ok(FileRef(format!(
        "{}/{}.{}",
        table,
        Uuid::new_v4().simple(),
        FILE_EXTENSION
    )))
}

/// In-memory file store
#[derive(Default)]
pub struct MemoryFileStore {
    files: DashMap<FileRef, Bytes>,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl FileStore for MemoryFileStore {
    fn put(&self, table: &str, data: Bytes) -> FileStoreResult<FileRef> {
        let file = new_file_ref(table)?;
        self.files.insert(file.clone(), data);
        Ok(file)
    }

    fn get(&self, file: &FileRef) -> FileStoreResult<Bytes> {
        self.files
            .get(file)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| FileStoreError::NotFound(file.to_string()))
    }

    fn delete(&self, file: &FileRef) -> FileStoreResult<Option<u64>> {
        Ok(self.files.remove(file).map(|(_, data)| data.len() as u64))
    }

    fn exists(&self, file: &FileRef) -> FileStoreResult<bool> {
        Ok(self.files.contains_key(file))
    }

    fn list(&self) -> FileStoreResult<Vec<FileRef>> {
        let mut files: Vec<FileRef> = self.files.iter().map(|e| e.key().clone()).collect();
        files.sort();
        Ok(files)
    }
}

/// File store backed by a local directory: `<root>/<table>/<uuid>.lkdf`
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    /// Create a new local file store, creating the root directory if needed
    pub fn new<P: AsRef<Path>>(root: P) -> FileStoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, file: &FileRef) -> FileStoreResult<PathBuf> {
        let valid = file
            .as_str()
            .split('/')
            .all(|part| !part.is_empty() && part != "." && part != "..");
        if !valid || file.as_str().split('/').count() != 2 {
            return Err(FileStoreError::InvalidRef(file.to_string()));
        }
        Ok(self.root.join(file.as_str()))
    }
}

impl FileStore for LocalFileStore {
    fn put(&self, table: &str, data: Bytes) -> FileStoreResult<FileRef> {
        let file = new_file_ref(table)?;
        let path = self.path_for(&file)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Write to a temp name first so a crash never leaves a truncated data file
        let tmp = path.with_extension("tmp");
        {
            let mut out = OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&tmp)?;
            out.write_all(&data)?;
            out.sync_all()?;
        }
        fs::rename(&tmp, &path)?;

        debug!(file = %file, size = data.len(), "Stored data file");
        Ok(file)
    }

    fn get(&self, file: &FileRef) -> FileStoreResult<Bytes> {
        let path = self.path_for(file)?;
        let handle = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FileStoreError::NotFound(file.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        if handle.metadata()?.len() == 0 {
            return Ok(Bytes::new());
        }

        // SAFETY: data files are written once under a temp name and renamed into
        // place; nothing writes to them afterwards.
        let mmap = unsafe { Mmap::map(&handle) }?;
        Ok(Bytes::copy_from_slice(&mmap))
    }

    fn delete(&self, file: &FileRef) -> FileStoreResult<Option<u64>> {
        let path = self.path_for(file)?;
        let size = match fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match fs::remove_file(&path) {
            Ok(()) => Ok(Some(size)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self, file: &FileRef) -> FileStoreResult<bool> {
        Ok(self.path_for(file)?.is_file())
    }

    fn list(&self) -> FileStoreResult<Vec<FileRef>> {
        let mut files = Vec::new();
        for table_dir in fs::read_dir(&self.root)? {
            let table_dir = table_dir?;
            if !table_dir.file_type()?.is_dir() {
                continue;
            }
            let table = table_dir.file_name().to_string_lossy().into_owned();
            for entry in fs::read_dir(table_dir.path())? {
                let entry = entry?;
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some(FILE_EXTENSION) {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().into_owned();
                files.push(FileRef(format!("{table}/{name}")));
            }
        }
        files.sort();
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(store: &dyn FileStore) {
        let a = store.put("orders", Bytes::from_static(b"first")).unwrap();
        let b = store.put("orders", Bytes::from_static(b"second")).unwrap();
        assert_ne!(a, b);
        assert_eq!(store.get(&a).unwrap(), Bytes::from_static(b"first"));
        assert!(store.exists(&b).unwrap());
        assert_eq!(store.list().unwrap().len(), 2);

        assert_eq!(store.delete(&a).unwrap(), Some(5));
        assert_eq!(store.delete(&a).unwrap(), None);
        assert!(matches!(store.get(&a), Err(FileStoreError::NotFound(_))));
        assert_eq!(store.list().unwrap(), vec![b]);
    }

    #[test]
    fn test_memory_store() {
        exercise(&MemoryFileStore::new());
    }

    #[test]
    fn test_local_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFileStore::new(dir.path()).unwrap();
        exercise(&store);
    }

    #[test]
    fn test_rejects_path_escape() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFileStore::new(dir.path()).unwrap();
        assert!(store.put("../etc", Bytes::new()).is_err());
        assert!(matches!(
            store.get(&FileRef("../../secret".into())),
            Err(FileStoreError::InvalidRef(_))
        ));
    }
}
