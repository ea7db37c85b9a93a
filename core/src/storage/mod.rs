//! Data file storage: the file store and the on-disk data file format

pub mod datafile;
pub mod file_store;

pub use datafile::{DataFileError, EncodedFile, decode_rows, encode_rows};
pub use file_store::{FileStore, FileStoreError, FileStoreResult, LocalFileStore, MemoryFileStore};
