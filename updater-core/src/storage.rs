//! Removable storage gateway
//!
//! The installer only ever sees logical card paths such as `/firmware.bin`.
//! [`FsStorage`] maps them onto a mount point so the same code runs against
//! the FAT volume the firmware mounts at `/sdcard` and against a temporary
//! directory on the host.

use std::fs::{self, File};
use std::io::Read;
use std::path::PathBuf;

use crate::error::StorageError;

/// A staged firmware image opened for reading
pub struct UpdateImage<R> {
    pub path: String,
    pub len: u64,
    pub reader: R,
}

impl<R> std::fmt::Debug for UpdateImage<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateImage")
            .field("path", &self.path)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

pub trait RemovableStorage {
    type Reader: Read;

    fn exists(&self, path: &str) -> bool;

    fn open_read(&self, path: &str) -> Result<UpdateImage<Self::Reader>, StorageError>;

    fn rename(&mut self, from: &str, to: &str) -> Result<(), StorageError>;

    fn remove(&mut self, path: &str) -> Result<(), StorageError>;
}

/// Storage backed by `std::fs` below a mount point
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Map a logical card path onto the mount point
    pub fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

impl RemovableStorage for FsStorage {
    type Reader = File;

    fn exists(&self, path: &str) -> bool {
        self.resolve(path).is_file()
    }

    fn open_read(&self, path: &str) -> Result<UpdateImage<File>, StorageError> {
        let full = self.resolve(path);
        let file = File::open(&full).map_err(|e| StorageError::new("open", path, e))?;
        let len = file
            .metadata()
            .map_err(|e| StorageError::new("stat", path, e))?
            .len();

        Ok(UpdateImage {
            path: path.to_string(),
            len,
            reader: file,
        })
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<(), StorageError> {
        fs::rename(self.resolve(from), self.resolve(to))
            .map_err(|e| StorageError::new("rename", from, e))
    }

    fn remove(&mut self, path: &str) -> Result<(), StorageError> {
        fs::remove_file(self.resolve(path)).map_err(|e| StorageError::new("remove", path, e))
    }
}
