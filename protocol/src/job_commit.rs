//! Finalización de un job: merge del output de las tareas, reintentos,
//! marker `_SUCCESS`, verificación de digests y hooks post-commit.

use std::collections::BTreeSet;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::committer::SUCCEEDED_FILE_NAME;
use crate::config::{
    Configuration, COMMIT_JOB_MAX_ATTEMPTS_KEY, DEFAULT_COMMIT_JOB_MAX_ATTEMPTS,
    MARK_SUCCESSFUL_JOBS_KEY, VERIFY_DIGESTS_KEY,
};
use crate::dispatch::{self, CleanupJob, CommittedTaskPaths, CommitterLayer, MergePaths};
use crate::error::{CommitError, Result};
use crate::fs::FileSystem;
use crate::hooks::PostCommitHooks;
use crate::message::{sorted_summaries, TaskCommitMessage};
use crate::task::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobCommitSettings {
    /// Nunca menor a 1.
    pub max_attempts: u32,
    pub mark_success: bool,
    pub verify_digests: bool,
}

impl JobCommitSettings {
    pub fn from_conf(conf: &Configuration) -> Self {
        let max_attempts = conf.get_u32(COMMIT_JOB_MAX_ATTEMPTS_KEY, DEFAULT_COMMIT_JOB_MAX_ATTEMPTS);
        if max_attempts == 0 {
            warn!("{} = 0, se usa 1", COMMIT_JOB_MAX_ATTEMPTS_KEY);
        }
        Self {
            max_attempts: max_attempts.max(1),
            mark_success: conf.get_bool(MARK_SUCCESSFUL_JOBS_KEY, true),
            verify_digests: conf.get_bool(VERIFY_DIGESTS_KEY, false),
        }
    }
}

/// Resultado de un commit_job exitoso.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobCommitReport {
    /// Intentos usados (0 si no había output que finalizar).
    pub attempts: u32,
    /// Un mensaje por cada intento fallido, en orden.
    pub failed_attempts: Vec<String>,
    pub algorithm_version: Option<u8>,
    pub committed_tasks: usize,
    pub marker_written: bool,
    pub verified_files: usize,
    pub post_commit_hook: Option<String>,
}

/// Entrada del algoritmo. Se arma una por job en el driver.
#[derive(Debug, Clone, Copy)]
pub struct JobCommit<'a> {
    pub job_id: &'a str,
    pub fs: &'a dyn FileSystem,
    pub committer: Option<&'a dyn CommitterLayer>,
    /// Output del committer; `None` significa "nada que finalizar".
    pub output_path: Option<&'a Path>,
    pub conf: &'a Configuration,
    pub hooks: &'a PostCommitHooks,
}

/// Capacidades resueltas una sola vez, antes del loop de reintentos.
struct Resolved<'a> {
    version: u8,
    merger: &'a dyn MergePaths,
    task_paths: &'a dyn CommittedTaskPaths,
    cleaner: &'a dyn CleanupJob,
}

impl<'a> JobCommit<'a> {
    /// Commit completo sobre el output del committer: `commit_output` y
    /// después el marker.
    pub fn run(&self, messages: &[TaskCommitMessage]) -> Result<JobCommitReport> {
        let mut report = self.commit_output(messages)?;
        if let Some(output) = self.output_path {
            self.mark_success(&mut report, output)?;
        }
        Ok(report)
    }

    /// Merge de los attempts aceptados con reintentos, verificación de digests
    /// y hook post-commit. No escribe el marker: eso lo hace `mark_success`
    /// cuando el caller terminó de publicar todo lo demás.
    pub fn commit_output(&self, messages: &[TaskCommitMessage]) -> Result<JobCommitReport> {
        let Some(output) = self.output_path else {
            warn!(
                "job {} sin output path: commit_job no tiene nada que finalizar",
                self.job_id
            );
            return Ok(JobCommitReport::default());
        };
        let committer = self.committer.ok_or_else(|| {
            CommitError::InvalidState(format!(
                "job {} tiene output {} pero no committer (¿falta setup_job?)",
                self.job_id,
                output.display()
            ))
        })?;

        let settings = JobCommitSettings::from_conf(self.conf);
        let resolved = Resolved {
            version: dispatch::algorithm_version(committer)?,
            merger: dispatch::merger(committer)?,
            task_paths: dispatch::committed_task_paths(committer)?,
            cleaner: dispatch::cleaner(committer)?,
        };

        let summaries = sorted_summaries(messages);
        let accepted: BTreeSet<(TaskId, u32)> = summaries
            .iter()
            .map(|s| (s.task_id, s.attempt))
            .collect();
        info!(
            "commit del job {} en {} (algoritmo v{}, {} mensajes, {} con archivos)",
            self.job_id,
            output.display(),
            resolved.version,
            messages.len(),
            summaries.len()
        );

        let mut report = JobCommitReport {
            algorithm_version: Some(resolved.version),
            committed_tasks: messages.len(),
            ..JobCommitReport::default()
        };

        let mut attempt: u32 = 1;
        loop {
            match self.merge_accepted(&resolved, output, &accepted) {
                Ok(()) => break,
                Err(err) if err.is_retryable() && attempt < settings.max_attempts => {
                    warn!(
                        "commit del job {}: intento {}/{} falló, reintentando: {}",
                        self.job_id, attempt, settings.max_attempts, err
                    );
                    report.failed_attempts.push(err.to_string());
                    attempt += 1;
                }
                Err(err) => {
                    warn!(
                        "commit del job {}: intento {}/{} falló, sin más reintentos: {}",
                        self.job_id, attempt, settings.max_attempts, err
                    );
                    let mut failures = report.failed_attempts;
                    failures.push(err.to_string());
                    return Err(CommitError::TerminalCommit {
                        attempts: attempt,
                        failures,
                        source: Box::new(err),
                    });
                }
            }
        }
        report.attempts = attempt;

        if settings.verify_digests {
            report.verified_files = verify_digests(self.fs, output, messages)?;
        }

        if let Some(hook) = self.hooks.lookup(committer) {
            info!("corriendo hook post-commit {} para {}", hook.name(), committer.name());
            hook.after_commit(self.fs, output, self.conf)?;
            report.post_commit_hook = Some(hook.name().to_string());
        }

        info!(
            "output del job {} comprometido en {} intento(s)",
            self.job_id, report.attempts
        );
        Ok(report)
    }

    /// Escribe `_SUCCESS` en `dir`. Con v2 se pisa uno previo; con v1 sólo
    /// se crea si falta.
    pub fn mark_success(&self, report: &mut JobCommitReport, dir: &Path) -> Result<()> {
        if !JobCommitSettings::from_conf(self.conf).mark_success {
            return Ok(());
        }

        let marker = dir.join(SUCCEEDED_FILE_NAME);
        if report.algorithm_version == Some(2) {
            self.fs.create(&marker, b"", true)?;
        } else if !self.fs.exists(&marker)? {
            self.fs.create(&marker, b"", false)?;
        }
        report.marker_written = true;
        debug!("marker escrito en {}", marker.display());
        Ok(())
    }

    /// Un intento: merge de los attempts aceptados + cleanup. Se puede
    /// re-ejecutar sin rollback: lo que ya se movió simplemente no se
    /// encuentra de nuevo. Lo comprometido por attempts no aceptados se
    /// borra con el cleanup sin publicarse.
    fn merge_accepted(
        &self,
        resolved: &Resolved<'_>,
        output: &Path,
        accepted: &BTreeSet<(TaskId, u32)>,
    ) -> Result<()> {
        if resolved.version == 2 {
            // las tareas ya escribieron en el destino; quedan los attempts
            // huérfanos y lo que haya quedado comprometido en staging
            resolved.cleaner.cleanup_task_attempts()?;
        }
        for committed in resolved.task_paths.committed_task_paths()? {
            if !accepted.contains(&(committed.task_id, committed.attempt)) {
                warn!(
                    "descartando {}: el attempt {} de la tarea {} no fue aceptado",
                    committed.path.display(),
                    committed.attempt,
                    committed.task_id
                );
                continue;
            }
            debug!("merge de {} en {}", committed.path.display(), output.display());
            resolved.merger.merge_paths(&committed.path, output)?;
        }
        resolved.cleaner.cleanup_job()
    }
}

/// Relee cada archivo con md5 registrado y compara. Devuelve cuántos se verificaron.
fn verify_digests(fs: &dyn FileSystem, output: &Path, messages: &[TaskCommitMessage]) -> Result<usize> {
    let mut verified = 0;
    for summary in sorted_summaries(messages) {
        for file in &summary.files {
            let Some(expected) = &file.md5 else {
                continue;
            };
            let path = output.join(&file.relative_path);
            let actual = format!("{:x}", md5::compute(fs.read(&path)?));
            if &actual != expected {
                return Err(CommitError::DigestMismatch {
                    path,
                    expected: expected.clone(),
                    actual,
                });
            }
            verified += 1;
        }
    }
    Ok(verified)
}
