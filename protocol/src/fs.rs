use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::error::{CommitError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStatus {
    pub path: PathBuf,
    pub is_dir: bool,
    pub len: u64,
}

impl FileStatus {
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

/// Capacidad de filesystem que consume el protocolo.
///
/// Todas las operaciones son bloqueantes. `rename` se asume atómico para un
/// único path y nunca reemplaza un destino existente: devuelve `false` si el
/// origen no existe o si el destino ya existe.
pub trait FileSystem: Send + Sync + fmt::Debug {
    fn mkdirs(&self, path: &Path) -> Result<()>;

    /// Crea `path` (y sus padres) con `contents`. Con `overwrite = false`
    /// falla si el archivo ya existe.
    fn create(&self, path: &Path, contents: &[u8], overwrite: bool) -> Result<()>;

    fn read(&self, path: &Path) -> Result<Vec<u8>>;

    fn rename(&self, src: &Path, dst: &Path) -> Result<bool>;

    /// Devuelve `false` si no había nada que borrar.
    fn delete(&self, path: &Path, recursive: bool) -> Result<bool>;

    fn exists(&self, path: &Path) -> Result<bool>;

    fn is_dir(&self, path: &Path) -> Result<bool>;

    /// Hijos directos de un directorio, ordenados por path. Si `path` es un
    /// archivo devuelve su propio status.
    fn list_status(&self, path: &Path) -> Result<Vec<FileStatus>>;
}

/// Archivos "ocultos" (markers, staging, _temporary): empiezan con `_` o `.`.
pub fn is_hidden(name: &str) -> bool {
    name.starts_with('_') || name.starts_with('.')
}

/// Recorre recursivamente `root` y devuelve todos los archivos (no dirs).
/// Con `skip_hidden` se saltan archivos y subárboles ocultos.
pub fn walk_files(fs: &dyn FileSystem, root: &Path, skip_hidden: bool) -> Result<Vec<FileStatus>> {
    let mut out = Vec::new();
    if !fs.exists(root)? {
        return Ok(out);
    }

    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for status in fs.list_status(&dir)? {
            if skip_hidden && is_hidden(&status.name()) {
                continue;
            }
            if status.is_dir {
                pending.push(status.path);
            } else {
                out.push(status);
            }
        }
    }

    out.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(out)
}

/// Path relativo con `/` como separador, para mensajes y resúmenes.
pub fn relative_path(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join("/")
}

/// Filesystem local sobre `std::fs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFileSystem;

impl LocalFileSystem {
    fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| CommitError::io("mkdirs", parent, e))?;
            }
        }
        Ok(())
    }
}

impl FileSystem for LocalFileSystem {
    fn mkdirs(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path).map_err(|e| CommitError::io("mkdirs", path, e))
    }

    fn create(&self, path: &Path, contents: &[u8], overwrite: bool) -> Result<()> {
        Self::ensure_parent(path)?;

        let mut options = OpenOptions::new();
        options.write(true);
        if overwrite {
            options.create(true).truncate(true);
        } else {
            options.create_new(true);
        }

        let mut file = options
            .open(path)
            .map_err(|e| CommitError::io("create", path, e))?;
        file.write_all(contents)
            .and_then(|_| file.flush())
            .map_err(|e| CommitError::io("create", path, e))
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        fs::read(path).map_err(|e| CommitError::io("read", path, e))
    }

    fn rename(&self, src: &Path, dst: &Path) -> Result<bool> {
        if !self.exists(src)? || self.exists(dst)? {
            return Ok(false);
        }
        fs::rename(src, dst).map_err(|e| CommitError::io("rename", src, e))?;
        Ok(true)
    }

    fn delete(&self, path: &Path, recursive: bool) -> Result<bool> {
        let meta = match fs::symlink_metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(CommitError::io("delete", path, e)),
        };

        let res = if meta.is_dir() {
            if recursive {
                fs::remove_dir_all(path)
            } else {
                fs::remove_dir(path)
            }
        } else {
            fs::remove_file(path)
        };

        match res {
            Ok(()) => Ok(true),
            // otro proceso lo borró entre el stat y el remove
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CommitError::io("delete", path, e)),
        }
    }

    fn exists(&self, path: &Path) -> Result<bool> {
        path.try_exists()
            .map_err(|e| CommitError::io("exists", path, e))
    }

    fn is_dir(&self, path: &Path) -> Result<bool> {
        match fs::metadata(path) {
            Ok(meta) => Ok(meta.is_dir()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CommitError::io("stat", path, e)),
        }
    }

    fn list_status(&self, path: &Path) -> Result<Vec<FileStatus>> {
        let meta = fs::metadata(path).map_err(|e| CommitError::io("list", path, e))?;
        if !meta.is_dir() {
            return Ok(vec![FileStatus {
                path: path.to_path_buf(),
                is_dir: false,
                len: meta.len(),
            }]);
        }

        let mut out = Vec::new();
        for entry in fs::read_dir(path).map_err(|e| CommitError::io("list", path, e))? {
            let entry = entry.map_err(|e| CommitError::io("list", path, e))?;
            let meta = entry
                .metadata()
                .map_err(|e| CommitError::io("list", entry.path(), e))?;
            out.push(FileStatus {
                path: entry.path(),
                is_dir: meta.is_dir(),
                len: if meta.is_dir() { 0 } else { meta.len() },
            });
        }
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }
}
