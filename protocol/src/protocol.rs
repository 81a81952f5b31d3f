use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::fs::FileSystem;
use crate::job::JobContext;
use crate::job_commit::JobCommitReport;
use crate::message::TaskCommitMessage;
use crate::task::TaskAttemptContext;

/// Contrato entre el driver (operaciones de job) y los executors
/// (operaciones de tarea).
///
/// Las operaciones de job toman `&mut self`: una instancia por job, manejada
/// por un único hilo del driver. Las de tarea toman `&self` y guardan todo su
/// estado en el `TaskAttemptContext` del attempt, así que pueden correr en
/// paralelo sin sincronización.
///
/// `abort_task` y `abort_job` son best-effort: nada en el protocolo depende de
/// que se llamen, y nunca devuelven error.
pub trait FileCommitProtocol: Send + Sync + fmt::Debug {
    /// Una vez, en el driver, antes de cualquier operación de tarea.
    fn setup_job(&mut self, job: &JobContext) -> Result<()>;

    /// Una vez por attempt, en el executor, antes de pedir archivos.
    fn setup_task(&self, task: &mut TaskAttemptContext) -> Result<()>;

    /// Path temporal para un archivo nuevo del attempt. `dir` es un hint de
    /// partición relativo al output; la extensión se conserva tal cual.
    ///
    /// Dos attempts vivos nunca reciben el mismo path para el mismo
    /// `(dir, ext)`. Dentro de un mismo attempt es el llamador quien tiene que
    /// variar `ext`.
    fn new_task_temp_file(
        &self,
        task: &mut TaskAttemptContext,
        dir: Option<&str>,
        ext: &str,
    ) -> Result<PathBuf>;

    /// Igual que `new_task_temp_file` pero el destino final es `abs_dir`,
    /// fuera del árbol de output.
    fn new_task_temp_file_abs_path(
        &self,
        task: &mut TaskAttemptContext,
        abs_dir: &Path,
        ext: &str,
    ) -> Result<PathBuf>;

    /// A lo sumo una vez por attempt, después de `setup_task`. Si falla, el
    /// attempt se considera fallido y su mensaje no entra en `commit_job`.
    fn commit_task(&self, task: &mut TaskAttemptContext) -> Result<TaskCommitMessage>;

    fn abort_task(&self, task: &mut TaskAttemptContext);

    /// Una vez, en el driver, con los mensajes de todas las tareas que forman
    /// parte del resultado (en cualquier orden).
    fn commit_job(
        &mut self,
        job: &JobContext,
        messages: &[TaskCommitMessage],
    ) -> Result<JobCommitReport>;

    /// No garantiza borrar output que ya era visible.
    fn abort_job(&mut self, job: &JobContext);

    fn file_system(&self) -> &dyn FileSystem;

    fn delete_with_job(&self, path: &Path, recursive: bool) -> Result<bool> {
        self.file_system().delete(path, recursive)
    }

    /// Se llama en el driver apenas se observa cada commit de tarea, antes de
    /// `commit_job`. Sólo para bookkeeping.
    fn on_task_commit(&mut self, _message: &TaskCommitMessage) {}
}
