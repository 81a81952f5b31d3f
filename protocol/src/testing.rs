//! Helpers compartidos por los tests del crate.

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{CommitError, Result};
use crate::fs::{FileStatus, FileSystem, LocalFileSystem};

/// `LocalFileSystem` que hace fallar los próximos N renames con un error de
/// E/S (transitorio), sin mover nada.
#[derive(Debug, Default)]
pub struct FlakyFileSystem {
    inner: LocalFileSystem,
    failing_renames: AtomicU32,
}

impl FlakyFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_renames(&self, n: u32) {
        self.failing_renames.store(n, Ordering::SeqCst);
    }
}

impl FileSystem for FlakyFileSystem {
    fn mkdirs(&self, path: &Path) -> Result<()> {
        self.inner.mkdirs(path)
    }

    fn create(&self, path: &Path, contents: &[u8], overwrite: bool) -> Result<()> {
        self.inner.create(path, contents, overwrite)
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        self.inner.read(path)
    }

    fn rename(&self, src: &Path, dst: &Path) -> Result<bool> {
        let consumed = self
            .failing_renames
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if consumed {
            return Err(CommitError::io(
                "rename",
                src,
                io::Error::new(io::ErrorKind::TimedOut, "falla inyectada"),
            ));
        }
        self.inner.rename(src, dst)
    }

    fn delete(&self, path: &Path, recursive: bool) -> Result<bool> {
        self.inner.delete(path, recursive)
    }

    fn exists(&self, path: &Path) -> Result<bool> {
        self.inner.exists(path)
    }

    fn is_dir(&self, path: &Path) -> Result<bool> {
        self.inner.is_dir(path)
    }

    fn list_status(&self, path: &Path) -> Result<Vec<FileStatus>> {
        self.inner.list_status(path)
    }
}
