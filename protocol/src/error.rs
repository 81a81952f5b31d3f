use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::dispatch::Capability;
use crate::task::TaskId;

pub type Result<T> = std::result::Result<T, CommitError>;

/// Errores del protocolo de commit.
///
/// Sólo `Io` se considera transitorio: es lo único que el loop de reintentos
/// de `commit_job` vuelve a intentar.
#[derive(Debug, Error)]
pub enum CommitError {
    /// Falla de E/S contra el filesystem (rename, delete, create...).
    #[error("fallo transitorio de E/S en {op} sobre {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("setup del job falló: {message}")]
    Setup {
        message: String,
        #[source]
        source: Option<Box<CommitError>>,
    },

    #[error("commit de la tarea {task_id} (attempt {attempt}) falló: {source}")]
    TaskCommit {
        task_id: TaskId,
        attempt: u32,
        #[source]
        source: Box<CommitError>,
    },

    /// Se agotaron los intentos de commit_job o el error no era reintentable.
    #[error("commit del job falló tras {attempts} intento(s): {source}")]
    TerminalCommit {
        attempts: u32,
        /// Mensaje de cada intento fallido, en orden; el último es `source`.
        failures: Vec<String>,
        #[source]
        source: Box<CommitError>,
    },

    #[error("el committer `{committer}` no expone la capacidad {capability}")]
    CapabilityNotFound {
        capability: Capability,
        committer: String,
    },

    #[error("no se pudo construir el protocolo de commit: {0}")]
    Construction(String),

    #[error("estado inválido: {0}")]
    InvalidState(String),

    #[error("argumento inválido: {0}")]
    InvalidArgument(String),

    /// Dos tareas intentaron publicar el mismo archivo final.
    #[error("conflicto al mergear: {} ya existe", path.display())]
    MergeConflict { path: PathBuf },

    #[error("digest distinto para {}: esperado {expected}, encontrado {actual}", path.display())]
    DigestMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("mensaje de commit inválido: {0}")]
    Message(#[from] serde_json::Error),
}

impl CommitError {
    pub fn io(op: &'static str, path: impl AsRef<Path>, source: io::Error) -> Self {
        Self::Io {
            op,
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn setup(message: impl Into<String>, source: CommitError) -> Self {
        Self::Setup {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io { .. })
    }

    /// Causa original cuando el error viene envuelto por el loop de reintentos.
    pub fn root_cause(&self) -> &CommitError {
        match self {
            Self::TerminalCommit { source, .. } | Self::TaskCommit { source, .. } => {
                source.root_cause()
            }
            other => other,
        }
    }
}
