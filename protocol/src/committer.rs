//! Committers subyacentes: el de archivos (algoritmo v1/v2) y el de parquet.
//!
//! Layout bajo el output `<out>` del committer:
//!   <out>/_temporary/0                                 job attempt
//!   <out>/_temporary/0/_temporary/attempt_<job>_<t>_<a> task attempt (escritura)
//!   <out>/_temporary/0/task_<job>_<t>_<a>              attempt comprometido (v1)

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::{Configuration, ALGORITHM_VERSION_KEY, DEFAULT_ALGORITHM_VERSION};
use crate::dispatch::{
    CleanupJob, CommittedTaskPath, CommittedTaskPaths, CommitterLayer, MergePaths,
};
use crate::error::{CommitError, Result};
use crate::fs::{is_hidden, FileSystem};
use crate::job::JobId;
use crate::task::{TaskAttemptContext, TaskId};

pub const PENDING_DIR_NAME: &str = "_temporary";
pub const SUCCEEDED_FILE_NAME: &str = "_SUCCESS";
const APP_ATTEMPT_ID: u32 = 0;

pub const FILE_COMMITTER_NAME: &str = "mapreduce";
pub const PARQUET_COMMITTER_NAME: &str = "parquet";

/// API estable de un committer subyacente. Las capacidades que cambiaron
/// entre versiones (versión de algoritmo, merge, cleanup...) NO están acá:
/// se piden vía `dispatch`.
pub trait OutputCommitter: CommitterLayer {
    fn as_layer(&self) -> &dyn CommitterLayer;

    fn output_path(&self) -> &Path;

    /// Dir donde el attempt escribe sus archivos.
    fn work_path(&self, task: &TaskAttemptContext) -> PathBuf;

    fn setup_job(&self) -> Result<()>;

    fn setup_task(&self, task: &TaskAttemptContext) -> Result<()>;

    fn needs_task_commit(&self, task: &TaskAttemptContext) -> Result<bool>;

    fn commit_task(&self, task: &TaskAttemptContext) -> Result<()>;

    fn abort_task(&self, task: &TaskAttemptContext) -> Result<()>;

    fn abort_job(&self) -> Result<()>;
}

/// Crea el committer de un job: (fs, job id, output del committer, conf).
pub type CommitterFactory = Arc<
    dyn Fn(Arc<dyn FileSystem>, &str, &Path, &Configuration) -> Result<Box<dyn OutputCommitter>>
        + Send
        + Sync,
>;

pub fn file_output_committer_factory() -> CommitterFactory {
    Arc::new(
        |fs: Arc<dyn FileSystem>,
         job_id: &str,
         output: &Path,
         conf: &Configuration|
         -> Result<Box<dyn OutputCommitter>> {
            Ok(Box::new(FileOutputCommitter::new(fs, job_id, output, conf)?))
        },
    )
}

pub fn parquet_output_committer_factory() -> CommitterFactory {
    Arc::new(
        |fs: Arc<dyn FileSystem>,
         job_id: &str,
         output: &Path,
         conf: &Configuration|
         -> Result<Box<dyn OutputCommitter>> {
            Ok(Box::new(ParquetOutputCommitter::new(fs, job_id, output, conf)?))
        },
    )
}

/// Mueve `from` dentro de `to`:
/// - archivo → destino inexistente: rename
/// - archivo → destino existente: `MergeConflict`, nunca se descarta nada
/// - dir → destino inexistente: rename del dir completo
/// - dir → dir: recursivo, y al final se borra el origen vacío
///
/// Un origen que ya no existe (lo movió un intento anterior) se saltea, así
/// que es seguro re-ejecutarlo.
pub fn merge_paths(fs: &dyn FileSystem, from: &Path, to: &Path) -> Result<()> {
    if !fs.exists(from)? {
        debug!("merge: {} ya no existe, nada que mover", from.display());
        return Ok(());
    }

    let from_is_dir = fs.is_dir(from)?;
    let to_exists = fs.exists(to)?;

    if !to_exists {
        if let Some(parent) = to.parent() {
            fs.mkdirs(parent)?;
        }
        if !fs.rename(from, to)? {
            return Err(CommitError::io(
                "rename",
                from,
                io::Error::other(format!("no se pudo mover a {}", to.display())),
            ));
        }
        debug!("merge: {} -> {}", from.display(), to.display());
        return Ok(());
    }

    if !from_is_dir || !fs.is_dir(to)? {
        return Err(CommitError::MergeConflict {
            path: to.to_path_buf(),
        });
    }

    for child in fs.list_status(from)? {
        merge_paths(fs, &child.path, &to.join(child.name()))?;
    }
    fs.delete(from, true)?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct FileOutputCommitter {
    fs: Arc<dyn FileSystem>,
    job_id: JobId,
    output_path: PathBuf,
    algorithm_version: u8,
}

impl FileOutputCommitter {
    pub fn new(
        fs: Arc<dyn FileSystem>,
        job_id: &str,
        output_path: &Path,
        conf: &Configuration,
    ) -> Result<Self> {
        let version = conf.get_u32(ALGORITHM_VERSION_KEY, DEFAULT_ALGORITHM_VERSION);
        let algorithm_version = match version {
            1 => 1,
            2 => 2,
            other => {
                return Err(CommitError::Construction(format!(
                    "{ALGORITHM_VERSION_KEY} sólo acepta 1 o 2, vino {other}"
                )))
            }
        };

        Ok(Self {
            fs,
            job_id: job_id.to_string(),
            output_path: output_path.to_path_buf(),
            algorithm_version,
        })
    }

    pub fn pending_path(&self) -> PathBuf {
        self.output_path.join(PENDING_DIR_NAME)
    }

    pub fn job_attempt_path(&self) -> PathBuf {
        self.pending_path().join(APP_ATTEMPT_ID.to_string())
    }

    fn pending_task_attempts_path(&self) -> PathBuf {
        self.job_attempt_path().join(PENDING_DIR_NAME)
    }

    pub fn task_attempt_path(&self, task: &TaskAttemptContext) -> PathBuf {
        self.pending_task_attempts_path().join(task.attempt_id())
    }

    pub fn committed_task_path(&self, task_id: TaskId, attempt: u32) -> PathBuf {
        self.job_attempt_path()
            .join(format!("task_{}_{:06}_{}", self.job_id, task_id, attempt))
    }

    /// Inversa de `committed_task_path` sobre el nombre del dir.
    fn parse_committed_name(&self, name: &str) -> Option<(TaskId, u32)> {
        let rest = name.strip_prefix("task_")?.strip_prefix(self.job_id.as_str())?;
        let (task_id, attempt) = rest.strip_prefix('_')?.split_once('_')?;
        Some((task_id.parse().ok()?, attempt.parse().ok()?))
    }
}

impl CommitterLayer for FileOutputCommitter {
    fn name(&self) -> &str {
        FILE_COMMITTER_NAME
    }

    fn try_algorithm_version(&self) -> Option<u8> {
        Some(self.algorithm_version)
    }

    fn try_merge_paths(&self) -> Option<&dyn MergePaths> {
        Some(self)
    }

    fn try_committed_task_paths(&self) -> Option<&dyn CommittedTaskPaths> {
        Some(self)
    }

    fn try_cleanup(&self) -> Option<&dyn CleanupJob> {
        Some(self)
    }
}

impl MergePaths for FileOutputCommitter {
    fn merge_paths(&self, from: &Path, to: &Path) -> Result<()> {
        merge_paths(self.fs.as_ref(), from, to)
    }
}

impl CommittedTaskPaths for FileOutputCommitter {
    fn committed_task_paths(&self) -> Result<Vec<CommittedTaskPath>> {
        let job_attempt = self.job_attempt_path();
        if !self.fs.exists(&job_attempt)? {
            return Ok(Vec::new());
        }

        let mut committed = Vec::new();
        for status in self.fs.list_status(&job_attempt)? {
            let name = status.name();
            if !status.is_dir || is_hidden(&name) {
                continue;
            }
            match self.parse_committed_name(&name) {
                Some((task_id, attempt)) => committed.push(CommittedTaskPath {
                    task_id,
                    attempt,
                    path: status.path,
                }),
                None => warn!("{} no es un attempt comprometido, se ignora", status.path.display()),
            }
        }
        committed.sort_by_key(|c| (c.task_id, c.attempt));
        Ok(committed)
    }
}

impl CleanupJob for FileOutputCommitter {
    fn cleanup_task_attempts(&self) -> Result<()> {
        if self.fs.delete(&self.pending_task_attempts_path(), true)? {
            debug!("borrados attempts pendientes del job {}", self.job_id);
        }
        Ok(())
    }

    fn cleanup_job(&self) -> Result<()> {
        self.fs.delete(&self.pending_path(), true)?;
        Ok(())
    }
}

impl OutputCommitter for FileOutputCommitter {
    fn as_layer(&self) -> &dyn CommitterLayer {
        self
    }

    fn output_path(&self) -> &Path {
        &self.output_path
    }

    fn work_path(&self, task: &TaskAttemptContext) -> PathBuf {
        self.task_attempt_path(task)
    }

    fn setup_job(&self) -> Result<()> {
        let path = self.job_attempt_path();
        self.fs.mkdirs(&path)?;
        debug!("job attempt path creado en {}", path.display());
        Ok(())
    }

    fn setup_task(&self, _task: &TaskAttemptContext) -> Result<()> {
        // el dir del attempt se crea recién cuando se escribe el primer archivo
        Ok(())
    }

    fn needs_task_commit(&self, task: &TaskAttemptContext) -> Result<bool> {
        self.fs.exists(&self.task_attempt_path(task))
    }

    fn commit_task(&self, task: &TaskAttemptContext) -> Result<()> {
        let attempt_path = self.task_attempt_path(task);
        if !self.fs.exists(&attempt_path)? {
            warn!("{} no tiene output para comprometer", task.attempt_id());
            return Ok(());
        }

        if self.algorithm_version == 1 {
            let committed = self.committed_task_path(task.task_id(), task.attempt());
            // resto de un commit_task interrumpido del mismo attempt
            if self.fs.delete(&committed, true)? {
                warn!("reemplazando {} de un commit anterior", committed.display());
            }
            if let Some(parent) = committed.parent() {
                self.fs.mkdirs(parent)?;
            }
            if !self.fs.rename(&attempt_path, &committed)? {
                return Err(CommitError::io(
                    "rename",
                    &attempt_path,
                    io::Error::other(format!("no se pudo mover a {}", committed.display())),
                ));
            }
            info!(
                "{} comprometido en {}",
                task.attempt_id(),
                committed.display()
            );
        } else {
            merge_paths(self.fs.as_ref(), &attempt_path, &self.output_path)?;
            self.fs.delete(&attempt_path, true)?;
            info!(
                "{} mergeado directo en {}",
                task.attempt_id(),
                self.output_path.display()
            );
        }
        Ok(())
    }

    fn abort_task(&self, task: &TaskAttemptContext) -> Result<()> {
        self.fs.delete(&self.task_attempt_path(task), true)?;
        Ok(())
    }

    fn abort_job(&self) -> Result<()> {
        self.cleanup_job()
    }
}

/// Committer de parquet: hijo de `FileOutputCommitter` que no redefine nada.
/// Existe para que el hook de resumen se elija por identidad.
#[derive(Debug, Clone)]
pub struct ParquetOutputCommitter {
    inner: FileOutputCommitter,
}

impl ParquetOutputCommitter {
    pub fn new(
        fs: Arc<dyn FileSystem>,
        job_id: &str,
        output_path: &Path,
        conf: &Configuration,
    ) -> Result<Self> {
        Ok(Self {
            inner: FileOutputCommitter::new(fs, job_id, output_path, conf)?,
        })
    }
}

impl CommitterLayer for ParquetOutputCommitter {
    fn name(&self) -> &str {
        PARQUET_COMMITTER_NAME
    }

    fn parent(&self) -> Option<&dyn CommitterLayer> {
        Some(&self.inner)
    }
}

impl OutputCommitter for ParquetOutputCommitter {
    fn as_layer(&self) -> &dyn CommitterLayer {
        self
    }

    fn output_path(&self) -> &Path {
        self.inner.output_path()
    }

    fn work_path(&self, task: &TaskAttemptContext) -> PathBuf {
        self.inner.work_path(task)
    }

    fn setup_job(&self) -> Result<()> {
        self.inner.setup_job()
    }

    fn setup_task(&self, task: &TaskAttemptContext) -> Result<()> {
        self.inner.setup_task(task)
    }

    fn needs_task_commit(&self, task: &TaskAttemptContext) -> Result<bool> {
        self.inner.needs_task_commit(task)
    }

    fn commit_task(&self, task: &TaskAttemptContext) -> Result<()> {
        self.inner.commit_task(task)
    }

    fn abort_task(&self, task: &TaskAttemptContext) -> Result<()> {
        self.inner.abort_task(task)
    }

    fn abort_job(&self) -> Result<()> {
        self.inner.abort_job()
    }
}
