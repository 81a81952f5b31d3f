//! Resolución de capacidades opcionales sobre el committer subyacente.
//!
//! Un committer concreto se modela como una cadena de capas (la más
//! específica primero, después sus ancestros). Cada capa puede exponer o no
//! cada capacidad; `resolve` recorre la cadena y devuelve la primera que la
//! tenga. Si ninguna la tiene, falla con `CapabilityNotFound`: no hay un
//! comportamiento por defecto razonable para, por ejemplo, "qué significa
//! mergear".

use std::fmt;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{CommitError, Result};
use crate::task::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    AlgorithmVersion,
    MergePaths,
    CommittedTaskPaths,
    Cleanup,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::AlgorithmVersion => "algorithm_version",
            Capability::MergePaths => "merge_paths",
            Capability::CommittedTaskPaths => "committed_task_paths",
            Capability::Cleanup => "cleanup",
        };
        f.write_str(name)
    }
}

/// Mueve recursivamente `from` dentro de `to`.
pub trait MergePaths {
    fn merge_paths(&self, from: &Path, to: &Path) -> Result<()>;
}

/// Output que un attempt dejó comprometido en staging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedTaskPath {
    pub task_id: TaskId,
    pub attempt: u32,
    pub path: PathBuf,
}

/// Enumera los paths de attempts ya comprometidos. Puede haber más de uno
/// por tarea si un attempt tardío también llegó a commit_task.
pub trait CommittedTaskPaths {
    fn committed_task_paths(&self) -> Result<Vec<CommittedTaskPath>>;
}

pub trait CleanupJob {
    /// Borra los directorios de attempts que nunca se comprometieron.
    fn cleanup_task_attempts(&self) -> Result<()>;

    /// Borra toda la estructura de staging del job.
    fn cleanup_job(&self) -> Result<()>;
}

/// Una capa en la jerarquía de un committer subyacente.
pub trait CommitterLayer: Send + Sync + fmt::Debug {
    /// Identidad de la implementación; los hooks post-commit se eligen por este nombre.
    fn name(&self) -> &str;

    fn parent(&self) -> Option<&dyn CommitterLayer> {
        None
    }

    fn try_algorithm_version(&self) -> Option<u8> {
        None
    }

    fn try_merge_paths(&self) -> Option<&dyn MergePaths> {
        None
    }

    fn try_committed_task_paths(&self) -> Option<&dyn CommittedTaskPaths> {
        None
    }

    fn try_cleanup(&self) -> Option<&dyn CleanupJob> {
        None
    }
}

/// Recorre `layer` y sus ancestros y devuelve el primer `Some` de `probe`.
pub fn resolve<'a, T>(
    layer: &'a dyn CommitterLayer,
    capability: Capability,
    probe: impl Fn(&'a dyn CommitterLayer) -> Option<T>,
) -> Result<T> {
    let mut current = Some(layer);
    while let Some(candidate) = current {
        if let Some(found) = probe(candidate) {
            debug!(
                "capacidad {} resuelta en `{}` (pedida a `{}`)",
                capability,
                candidate.name(),
                layer.name()
            );
            return Ok(found);
        }
        current = candidate.parent();
    }

    Err(CommitError::CapabilityNotFound {
        capability,
        committer: layer.name().to_string(),
    })
}

/// Primera capa (la propia o un ancestro) para la que `pred` es true.
pub fn find_layer<'a>(
    layer: &'a dyn CommitterLayer,
    pred: impl Fn(&dyn CommitterLayer) -> bool,
) -> Option<&'a dyn CommitterLayer> {
    let mut current = Some(layer);
    while let Some(candidate) = current {
        if pred(candidate) {
            return Some(candidate);
        }
        current = candidate.parent();
    }
    None
}

pub fn algorithm_version(layer: &dyn CommitterLayer) -> Result<u8> {
    resolve(layer, Capability::AlgorithmVersion, |l| l.try_algorithm_version())
}

pub fn merger(layer: &dyn CommitterLayer) -> Result<&dyn MergePaths> {
    resolve(layer, Capability::MergePaths, |l| l.try_merge_paths())
}

pub fn committed_task_paths(layer: &dyn CommitterLayer) -> Result<&dyn CommittedTaskPaths> {
    resolve(layer, Capability::CommittedTaskPaths, |l| {
        l.try_committed_task_paths()
    })
}

pub fn cleaner(layer: &dyn CommitterLayer) -> Result<&dyn CleanupJob> {
    resolve(layer, Capability::Cleanup, |l| l.try_cleanup())
}
