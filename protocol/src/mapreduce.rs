//! Protocolo de commit sobre un committer de la familia map-reduce.
//!
//! Con dynamic partition overwrite el committer escribe en un staging dir
//! propio del job (`<out>/.spark-staging-<job>`) y recién en `commit_job` cada
//! partición tocada reemplaza a la del output final.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::committer::{CommitterFactory, OutputCommitter, SUCCEEDED_FILE_NAME};
use crate::config::VERIFY_DIGESTS_KEY;
use crate::error::{CommitError, Result};
use crate::fs::{relative_path, walk_files, FileSystem};
use crate::hooks::PostCommitHooks;
use crate::job::{JobContext, JobState};
use crate::job_commit::{JobCommit, JobCommitReport};
use crate::message::{CommittedFile, FileCommitSummary, TaskCommitMessage};
use crate::protocol::FileCommitProtocol;
use crate::registry::ProtocolArgs;
use crate::task::{TaskAttemptContext, TaskState};

const STAGING_DIR_PREFIX: &str = ".spark-staging-";

pub struct MapReduceCommitProtocol {
    args: ProtocolArgs,
    fs: Arc<dyn FileSystem>,
    committer_factory: CommitterFactory,
    hooks: Arc<PostCommitHooks>,

    state: JobState,
    /// Committer del job; existe desde `setup_job` si hay output path.
    committer: Option<Box<dyn OutputCommitter>>,
    observed_partitions: BTreeSet<String>,
    observed_commits: usize,
}

impl fmt::Debug for MapReduceCommitProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapReduceCommitProtocol")
            .field("args", &self.args)
            .field("state", &self.state)
            .field("committer", &self.committer.as_ref().map(|c| c.name().to_string()))
            .field("observed_commits", &self.observed_commits)
            .finish()
    }
}

impl MapReduceCommitProtocol {
    pub fn new(
        args: ProtocolArgs,
        fs: Arc<dyn FileSystem>,
        committer_factory: CommitterFactory,
        hooks: Arc<PostCommitHooks>,
    ) -> Self {
        Self {
            args,
            fs,
            committer_factory,
            hooks,
            state: JobState::Uninitialized,
            committer: None,
            observed_partitions: BTreeSet::new(),
            observed_commits: 0,
        }
    }

    pub fn args(&self) -> &ProtocolArgs {
        &self.args
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn observed_partitions(&self) -> &BTreeSet<String> {
        &self.observed_partitions
    }

    pub fn observed_commits(&self) -> usize {
        self.observed_commits
    }

    pub fn staging_dir(&self) -> Option<PathBuf> {
        self.args
            .output_path
            .as_ref()
            .map(|out| out.join(format!("{STAGING_DIR_PREFIX}{}", self.args.job_id)))
    }

    /// Dónde escribe el committer: el staging dir con particiones dinámicas,
    /// el output final si no.
    fn committer_output(&self) -> Option<PathBuf> {
        if self.args.dynamic_partition_overwrite {
            self.staging_dir()
        } else {
            self.args.output_path.clone()
        }
    }

    fn build_committer(&self, job: &JobContext) -> Result<Option<Box<dyn OutputCommitter>>> {
        let Some(output) = self.committer_output() else {
            return Ok(None);
        };
        let committer =
            (self.committer_factory)(self.fs.clone(), self.args.job_id.as_str(), &output, &job.conf)?;
        Ok(Some(committer))
    }

    fn check_job_id(&self, job: &JobContext) -> Result<()> {
        if job.job_id != self.args.job_id {
            return Err(CommitError::InvalidArgument(format!(
                "el protocolo es del job {}, no de {}",
                self.args.job_id, job.job_id
            )));
        }
        Ok(())
    }

    fn file_name(task: &TaskAttemptContext, ext: &str) -> String {
        format!("part-{:05}-{}{}", task.task_id(), task.job_id(), ext)
    }

    /// Mueve `from` a `to` reemplazando lo que haya en `to`.
    fn move_replacing(&self, from: &Path, to: &Path) -> Result<()> {
        if self.fs.exists(to)? {
            self.delete_with_job(to, true)?;
        }
        if let Some(parent) = to.parent() {
            self.fs.mkdirs(parent)?;
        }
        if !self.fs.rename(from, to)? {
            return Err(CommitError::io(
                "rename",
                from,
                io::Error::other(format!("no se pudo mover a {}", to.display())),
            ));
        }
        Ok(())
    }

    fn commit_task_files(&self, task: &TaskAttemptContext) -> Result<TaskCommitMessage> {
        let Some(committer) = self.build_committer(task.job())? else {
            return Ok(TaskCommitMessage::Empty);
        };

        let verify = task.job().conf.get_bool(VERIFY_DIGESTS_KEY, false);
        let work_path = committer.work_path(task);
        let mut files = Vec::new();
        for status in walk_files(self.fs.as_ref(), &work_path, false)? {
            let md5 = if verify {
                Some(format!("{:x}", md5::compute(self.fs.read(&status.path)?)))
            } else {
                None
            };
            files.push(CommittedFile {
                relative_path: relative_path(&work_path, &status.path),
                len: status.len,
                md5,
            });
        }

        if committer.needs_task_commit(task)? {
            committer.commit_task(task)?;
        } else {
            debug!("{} no escribió nada, no hay nada que comprometer", task.attempt_id());
        }

        Ok(TaskCommitMessage::FileOutput(FileCommitSummary {
            task_id: task.task_id(),
            attempt: task.attempt(),
            committed_at: Utc::now(),
            files,
            added_abs_path_files: task
                .added_abs_path_files
                .iter()
                .map(|(staged, dst)| {
                    (
                        staged.to_string_lossy().to_string(),
                        dst.to_string_lossy().to_string(),
                    )
                })
                .collect(),
            partitions: task.partitions.clone(),
        }))
    }

    /// Lo que va después del algoritmo genérico: archivos con path absoluto,
    /// reemplazo de particiones y borrado del staging dir.
    fn finish_commit(&self, messages: &[TaskCommitMessage]) -> Result<()> {
        let (Some(output), Some(staging)) = (self.args.output_path.as_ref(), self.staging_dir())
        else {
            return Ok(());
        };

        let mut abs_files = BTreeMap::new();
        let mut partitions = self.observed_partitions.clone();
        for summary in messages.iter().filter_map(|m| m.file_summary()) {
            abs_files.extend(summary.added_abs_path_files.iter());
            partitions.extend(summary.partitions.iter().cloned());
        }

        for (staged, dst) in abs_files {
            let (staged, dst) = (Path::new(staged), Path::new(dst));
            if !self.fs.exists(staged)? {
                warn!("{} no existe, se saltea", staged.display());
                continue;
            }
            self.move_replacing(staged, dst)?;
            debug!("{} -> {}", staged.display(), dst.display());
        }

        if self.args.dynamic_partition_overwrite {
            for partition in &partitions {
                let from = staging.join(partition);
                if !self.fs.exists(&from)? {
                    debug!("partición {partition} sin archivos en staging");
                    continue;
                }
                self.move_replacing(&from, &output.join(partition))?;
                info!("partición {partition} reemplazada");
            }
            // los resúmenes del hook quedaron en la raíz del staging
            let root_files = if self.fs.exists(&staging)? {
                self.fs.list_status(&staging)?
            } else {
                Vec::new()
            };
            for status in root_files {
                if !status.is_dir {
                    self.move_replacing(&status.path, &output.join(status.name()))?;
                }
            }
        }

        self.fs.delete(&staging, true)?;
        Ok(())
    }
}

impl FileCommitProtocol for MapReduceCommitProtocol {
    fn setup_job(&mut self, job: &JobContext) -> Result<()> {
        self.state.expect(JobState::Uninitialized, "setup_job")?;
        self.check_job_id(job)?;

        let Some(output) = self.args.output_path.clone() else {
            warn!("job {} sin output path: no hay nada que preparar", job.job_id);
            self.state = JobState::SetUp;
            return Ok(());
        };

        if self.args.overwrite && !self.args.dynamic_partition_overwrite {
            let target = match self.args.static_partition_prefix() {
                Some(prefix) if self.args.insert_into_relation => output.join(prefix),
                _ => output.clone(),
            };
            if self
                .delete_with_job(&target, true)
                .map_err(|e| CommitError::setup("no se pudo borrar el destino previo", e))?
            {
                info!("overwrite: borrado {}", target.display());
            }
        }

        let committer = self
            .build_committer(job)
            .map_err(|e| CommitError::setup("no se pudo crear el committer", e))?
            .ok_or_else(|| CommitError::InvalidState("sin output para el committer".into()))?;
        committer
            .setup_job()
            .map_err(|e| CommitError::setup("setup del committer falló", e))?;

        info!(
            "job {} listo: committer {} escribiendo en {}",
            job.job_id,
            committer.name(),
            committer.output_path().display()
        );
        self.committer = Some(committer);
        self.state = JobState::SetUp;
        Ok(())
    }

    fn setup_task(&self, task: &mut TaskAttemptContext) -> Result<()> {
        task.expect_state(TaskState::Uninitialized, "setup_task")?;
        self.check_job_id(task.job())?;

        if let Some(committer) = self.build_committer(task.job())? {
            committer
                .setup_task(task)
                .map_err(|e| CommitError::setup(format!("setup de {}", task.attempt_id()), e))?;
        }
        task.state = TaskState::SetUp;
        debug!("{} listo", task.attempt_id());
        Ok(())
    }

    fn new_task_temp_file(
        &self,
        task: &mut TaskAttemptContext,
        dir: Option<&str>,
        ext: &str,
    ) -> Result<PathBuf> {
        task.expect_state(TaskState::SetUp, "new_task_temp_file")?;

        if let Some(dir) = dir {
            let valid = Path::new(dir)
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
            if !valid || dir.is_empty() {
                return Err(CommitError::InvalidArgument(format!(
                    "dir de partición inválido: {dir:?}"
                )));
            }
        }
        if self.args.dynamic_partition_overwrite && dir.is_none() {
            return Err(CommitError::InvalidArgument(
                "con dynamic partition overwrite cada archivo necesita una partición".into(),
            ));
        }

        let committer = self.build_committer(task.job())?.ok_or_else(|| {
            CommitError::InvalidState(format!("job {} no tiene output path", task.job_id()))
        })?;

        let mut path = committer.work_path(task);
        if let Some(dir) = dir {
            path.push(dir);
            if self.args.dynamic_partition_overwrite {
                task.partitions.insert(dir.to_string());
            }
        }
        path.push(Self::file_name(task, ext));
        debug!("{} escribe en {}", task.attempt_id(), path.display());
        Ok(path)
    }

    fn new_task_temp_file_abs_path(
        &self,
        task: &mut TaskAttemptContext,
        abs_dir: &Path,
        ext: &str,
    ) -> Result<PathBuf> {
        task.expect_state(TaskState::SetUp, "new_task_temp_file_abs_path")?;
        if !abs_dir.is_absolute() {
            return Err(CommitError::InvalidArgument(format!(
                "{} no es un path absoluto",
                abs_dir.display()
            )));
        }
        let staging = self.staging_dir().ok_or_else(|| {
            CommitError::InvalidState(format!("job {} no tiene output path", task.job_id()))
        })?;

        let file_name = Self::file_name(task, ext);
        let staged = staging.join(format!("{}-{}", Uuid::new_v4(), file_name));
        task.added_abs_path_files
            .insert(staged.clone(), abs_dir.join(file_name));
        Ok(staged)
    }

    fn commit_task(&self, task: &mut TaskAttemptContext) -> Result<TaskCommitMessage> {
        task.expect_state(TaskState::SetUp, "commit_task")?;

        let message = self
            .commit_task_files(task)
            .map_err(|e| CommitError::TaskCommit {
                task_id: task.task_id(),
                attempt: task.attempt(),
                source: Box::new(e),
            })?;
        task.state = TaskState::Committed;
        info!("{} comprometido", task.attempt_id());
        Ok(message)
    }

    fn abort_task(&self, task: &mut TaskAttemptContext) {
        match task.state() {
            TaskState::Committed => {
                warn!("abort_task de {} ya comprometido, se ignora", task.attempt_id());
                return;
            }
            TaskState::Aborted => return,
            TaskState::Uninitialized | TaskState::SetUp => {}
        }

        match self.build_committer(task.job()) {
            Ok(Some(committer)) => {
                if let Err(err) = committer.abort_task(task) {
                    warn!("abort de {} falló: {}", task.attempt_id(), err);
                }
            }
            Ok(None) => {}
            Err(err) => warn!("abort de {}: sin committer: {}", task.attempt_id(), err),
        }
        for staged in task.added_abs_path_files.keys() {
            if let Err(err) = self.fs.delete(staged, false) {
                warn!("no se pudo borrar {}: {}", staged.display(), err);
            }
        }
        task.state = TaskState::Aborted;
        info!("{} abortado", task.attempt_id());
    }

    fn commit_job(
        &mut self,
        job: &JobContext,
        messages: &[TaskCommitMessage],
    ) -> Result<JobCommitReport> {
        self.state.expect(JobState::SetUp, "commit_job")?;
        self.check_job_id(job)?;

        let output = self.committer_output();
        let commit = JobCommit {
            job_id: &job.job_id,
            fs: self.fs.as_ref(),
            committer: self.committer.as_deref().map(|c| c.as_layer()),
            output_path: output.as_deref(),
            conf: &job.conf,
            hooks: &self.hooks,
        };

        // el marker va último: si algo falla antes, `_SUCCESS` no aparece
        let result = commit.commit_output(messages).and_then(|mut report| {
            self.finish_commit(messages)?;
            if let Some(final_output) = &self.args.output_path {
                commit.mark_success(&mut report, final_output)?;
            }
            Ok(report)
        });
        match result {
            Ok(report) => {
                self.state = JobState::Committed;
                Ok(report)
            }
            Err(err) => {
                self.state = JobState::CommitFailed;
                Err(err)
            }
        }
    }

    fn abort_job(&mut self, job: &JobContext) {
        match self.state {
            JobState::Committed => {
                warn!("abort_job de {} ya comprometido, se ignora", job.job_id);
                return;
            }
            JobState::Aborted => return,
            JobState::Uninitialized | JobState::SetUp | JobState::CommitFailed => {}
        }

        if let Some(committer) = &self.committer {
            if let Err(err) = committer.abort_job() {
                warn!("abort del committer de {} falló: {}", job.job_id, err);
            }
        }
        if let Some(output) = &self.args.output_path {
            if let Err(err) = self.fs.delete(&output.join(SUCCEEDED_FILE_NAME), false) {
                warn!("no se pudo borrar el marker de {}: {}", job.job_id, err);
            }
        }
        if let Some(staging) = self.staging_dir() {
            if let Err(err) = self.fs.delete(&staging, true) {
                warn!("no se pudo borrar {}: {}", staging.display(), err);
            }
        }
        self.state = JobState::Aborted;
        info!("job {} abortado", job.job_id);
    }

    fn file_system(&self) -> &dyn FileSystem {
        self.fs.as_ref()
    }

    fn on_task_commit(&mut self, message: &TaskCommitMessage) {
        if let Some(summary) = message.file_summary() {
            self.observed_partitions
                .extend(summary.partitions.iter().cloned());
        }
        self.observed_commits += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::committer::{file_output_committer_factory, parquet_output_committer_factory};
    use crate::config::{
        Configuration, ALGORITHM_VERSION_KEY, COMMIT_JOB_MAX_ATTEMPTS_KEY, MARK_SUCCESSFUL_JOBS_KEY,
    };
    use crate::fs::LocalFileSystem;
    use crate::hooks::METADATA_FILE_NAME;
    use crate::testing::FlakyFileSystem;

    fn protocol(fs: Arc<dyn FileSystem>, args: ProtocolArgs) -> MapReduceCommitProtocol {
        MapReduceCommitProtocol::new(
            args,
            fs,
            file_output_committer_factory(),
            Arc::new(PostCommitHooks::with_defaults()),
        )
    }

    fn local(out: &Path) -> MapReduceCommitProtocol {
        protocol(
            Arc::new(LocalFileSystem),
            ProtocolArgs::new("job1", Some(out.to_path_buf())),
        )
    }

    /// setup_task + un archivo con `body` + commit_task, en el attempt 0.
    fn run_task(
        p: &MapReduceCommitProtocol,
        job: &JobContext,
        task_id: u32,
        dir: Option<&str>,
        body: &str,
    ) -> TaskCommitMessage {
        run_attempt(p, job, task_id, 0, dir, body)
    }

    fn run_attempt(
        p: &MapReduceCommitProtocol,
        job: &JobContext,
        task_id: u32,
        attempt: u32,
        dir: Option<&str>,
        body: &str,
    ) -> TaskCommitMessage {
        let mut task = TaskAttemptContext::new(job.clone(), task_id, attempt);
        p.setup_task(&mut task).unwrap();
        let path = p.new_task_temp_file(&mut task, dir, ".out").unwrap();
        p.file_system().create(&path, body.as_bytes(), false).unwrap();
        p.commit_task(&mut task).unwrap()
    }

    fn output_files(out: &Path) -> Vec<String> {
        walk_files(&LocalFileSystem, out, false)
            .unwrap()
            .iter()
            .map(|s| relative_path(out, &s.path))
            .collect()
    }

    #[test]
    fn dos_attempts_vivos_nunca_comparten_path() {
        let tmp = tempfile::tempdir().unwrap();
        let p = local(tmp.path());
        let job = JobContext::new("job1", Configuration::new());

        let mut paths = BTreeSet::new();
        for (task_id, attempt) in [(0, 0), (0, 1), (1, 0)] {
            let mut task = TaskAttemptContext::new(job.clone(), task_id, attempt);
            p.setup_task(&mut task).unwrap();
            let path = p.new_task_temp_file(&mut task, Some("part"), ".out").unwrap();
            assert!(path.to_string_lossy().ends_with(".out"));
            assert!(path.parent().unwrap().ends_with("part"));
            assert!(paths.insert(path));
        }
    }

    #[test]
    fn escenario_a_dos_tareas_dos_archivos() {
        let tmp = tempfile::tempdir().unwrap();
        let mut p = local(tmp.path());
        let job = JobContext::new("job1", Configuration::new());
        p.setup_job(&job).unwrap();

        let messages = vec![
            run_task(&p, &job, 0, Some("part"), "a"),
            run_task(&p, &job, 1, Some("part"), "b"),
        ];
        let report = p.commit_job(&job, &messages).unwrap();

        assert_eq!(report.algorithm_version, Some(1));
        assert_eq!(
            output_files(tmp.path()),
            vec!["_SUCCESS", "part/part-00000-job1.out", "part/part-00001-job1.out"]
        );
        assert_eq!(
            std::fs::read(tmp.path().join("part/part-00001-job1.out")).unwrap(),
            b"b"
        );
        assert_eq!(p.state(), JobState::Committed);
    }

    #[test]
    fn escenario_b_attempt_caido_no_aparece_en_el_output() {
        for version in [1, 2] {
            let tmp = tempfile::tempdir().unwrap();
            let mut p = local(tmp.path());
            let job = JobContext::new(
                "job1",
                Configuration::new().with(ALGORITHM_VERSION_KEY, version),
            );
            p.setup_job(&job).unwrap();

            // se cae después de escribir, sin commit ni abort
            let mut crashed = TaskAttemptContext::new(job.clone(), 1, 0);
            p.setup_task(&mut crashed).unwrap();
            let path = p.new_task_temp_file(&mut crashed, None, ".out").unwrap();
            p.file_system().create(&path, b"basura", false).unwrap();

            let messages = vec![run_task(&p, &job, 0, None, "ok")];
            p.commit_job(&job, &messages).unwrap();

            assert_eq!(
                output_files(tmp.path()),
                vec!["_SUCCESS", "part-00000-job1.out"],
                "v{version}"
            );
        }
    }

    #[test]
    fn escenario_c_dos_fallas_y_exito_al_tercer_intento() {
        let tmp = tempfile::tempdir().unwrap();
        let flaky = Arc::new(FlakyFileSystem::new());
        let mut p = protocol(
            flaky.clone(),
            ProtocolArgs::new("job1", Some(tmp.path().to_path_buf())),
        );
        let job = JobContext::new(
            "job1",
            Configuration::new().with(COMMIT_JOB_MAX_ATTEMPTS_KEY, 3),
        );
        p.setup_job(&job).unwrap();
        let messages = vec![
            run_task(&p, &job, 0, None, "a"),
            run_task(&p, &job, 1, None, "b"),
        ];

        flaky.fail_next_renames(2);
        let report = p.commit_job(&job, &messages).unwrap();

        assert_eq!(report.attempts, 3);
        assert_eq!(report.failed_attempts.len(), 2);
        assert!(report.marker_written);
        assert!(tmp.path().join(SUCCEEDED_FILE_NAME).exists());
        assert_eq!(output_files(tmp.path()).len(), 3);
    }

    #[test]
    fn commit_job_fallido_deja_el_job_en_commit_failed() {
        let tmp = tempfile::tempdir().unwrap();
        let flaky = Arc::new(FlakyFileSystem::new());
        let mut p = protocol(
            flaky.clone(),
            ProtocolArgs::new("job1", Some(tmp.path().to_path_buf())),
        );
        let job = JobContext::new("job1", Configuration::new());
        p.setup_job(&job).unwrap();
        let messages = vec![run_task(&p, &job, 0, None, "a")];

        flaky.fail_next_renames(1);
        let err = p.commit_job(&job, &messages).unwrap_err();
        assert!(matches!(err, CommitError::TerminalCommit { attempts: 1, .. }));
        assert_eq!(p.state(), JobState::CommitFailed);

        // sólo queda abortar
        assert!(matches!(
            p.commit_job(&job, &messages),
            Err(CommitError::InvalidState(_))
        ));
        p.abort_job(&job);
        assert_eq!(p.state(), JobState::Aborted);
        assert!(!tmp.path().join(SUCCEEDED_FILE_NAME).exists());
    }

    #[test]
    fn abort_job_nunca_deja_marker() {
        let tmp = tempfile::tempdir().unwrap();
        let mut p = local(tmp.path());
        let job = JobContext::new("job1", Configuration::new());
        p.setup_job(&job).unwrap();
        run_task(&p, &job, 0, None, "a");
        // marker de una corrida anterior
        LocalFileSystem
            .create(&tmp.path().join(SUCCEEDED_FILE_NAME), b"", false)
            .unwrap();

        p.abort_job(&job);

        assert!(!tmp.path().join(SUCCEEDED_FILE_NAME).exists());
        assert!(!tmp.path().join("_temporary").exists());
        assert!(matches!(
            p.commit_job(&job, &[]),
            Err(CommitError::InvalidState(_))
        ));
    }

    #[test]
    fn abort_job_despues_del_commit_se_ignora() {
        let tmp = tempfile::tempdir().unwrap();
        let mut p = local(tmp.path());
        let job = JobContext::new("job1", Configuration::new());
        p.setup_job(&job).unwrap();
        p.commit_job(&job, &[]).unwrap();

        p.abort_job(&job);
        assert_eq!(p.state(), JobState::Committed);
        assert!(tmp.path().join(SUCCEEDED_FILE_NAME).exists());
    }

    #[test]
    fn el_orden_de_las_operaciones_se_respeta() {
        let tmp = tempfile::tempdir().unwrap();
        let mut p = local(tmp.path());
        let job = JobContext::new("job1", Configuration::new());

        assert!(matches!(
            p.commit_job(&job, &[]),
            Err(CommitError::InvalidState(_))
        ));

        let mut task = TaskAttemptContext::new(job.clone(), 0, 0);
        assert!(p.new_task_temp_file(&mut task, None, ".out").is_err());
        assert!(p.commit_task(&mut task).is_err());

        p.setup_job(&job).unwrap();
        assert!(p.setup_job(&job).is_err());

        p.setup_task(&mut task).unwrap();
        assert!(p.setup_task(&mut task).is_err());
        p.commit_task(&mut task).unwrap();
        assert!(matches!(
            p.commit_task(&mut task),
            Err(CommitError::InvalidState(_))
        ));

        // un abort tardío no deshace el commit
        p.abort_task(&mut task);
        assert_eq!(task.state(), TaskState::Committed);
    }

    #[test]
    fn otro_job_id_es_rechazado() {
        let tmp = tempfile::tempdir().unwrap();
        let mut p = local(tmp.path());
        let other = JobContext::new("job2", Configuration::new());
        assert!(matches!(
            p.setup_job(&other),
            Err(CommitError::InvalidArgument(_))
        ));
    }

    #[test]
    fn abort_task_descarta_el_output_del_attempt() {
        let tmp = tempfile::tempdir().unwrap();
        let mut p = local(tmp.path());
        let job = JobContext::new("job1", Configuration::new());
        p.setup_job(&job).unwrap();

        let mut task = TaskAttemptContext::new(job.clone(), 3, 0);
        p.setup_task(&mut task).unwrap();
        let path = p.new_task_temp_file(&mut task, None, ".out").unwrap();
        p.file_system().create(&path, b"x", false).unwrap();
        let abs = tmp.path().join("abs");
        let staged = p.new_task_temp_file_abs_path(&mut task, &abs, ".out").unwrap();
        p.file_system().create(&staged, b"y", false).unwrap();

        p.abort_task(&mut task);

        assert_eq!(task.state(), TaskState::Aborted);
        assert!(!path.exists());
        assert!(!staged.exists());
        p.commit_job(&job, &[]).unwrap();
        assert_eq!(output_files(tmp.path()), vec!["_SUCCESS"]);
    }

    #[test]
    fn sin_output_path_todo_es_no_op() {
        let mut p = protocol(Arc::new(LocalFileSystem), ProtocolArgs::new("job1", None));
        let job = JobContext::new("job1", Configuration::new());
        p.setup_job(&job).unwrap();

        let mut task = TaskAttemptContext::new(job.clone(), 0, 0);
        p.setup_task(&mut task).unwrap();
        assert!(matches!(
            p.new_task_temp_file(&mut task, None, ".out"),
            Err(CommitError::InvalidState(_))
        ));
        assert_eq!(p.commit_task(&mut task).unwrap(), TaskCommitMessage::Empty);

        let report = p.commit_job(&job, &[TaskCommitMessage::Empty]).unwrap();
        assert_eq!(report.attempts, 0);
        assert!(!report.marker_written);
    }

    #[test]
    fn marker_deshabilitado() {
        let tmp = tempfile::tempdir().unwrap();
        let mut p = local(tmp.path());
        let job = JobContext::new(
            "job1",
            Configuration::new().with(MARK_SUCCESSFUL_JOBS_KEY, false),
        );
        p.setup_job(&job).unwrap();
        let messages = vec![run_task(&p, &job, 0, None, "a")];
        p.commit_job(&job, &messages).unwrap();
        assert_eq!(output_files(tmp.path()), vec!["part-00000-job1.out"]);
    }

    #[test]
    fn particiones_dinamicas_reemplazan_solo_lo_tocado() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path();
        let fs = LocalFileSystem;
        fs.create(&out.join("p=a").join("viejo.out"), b"viejo", false)
            .unwrap();
        fs.create(&out.join("p=b").join("intacto.out"), b"b", false)
            .unwrap();

        let mut p = protocol(
            Arc::new(LocalFileSystem),
            ProtocolArgs {
                dynamic_partition_overwrite: true,
                overwrite: true,
                ..ProtocolArgs::new("job1", Some(out.to_path_buf()))
            },
        );
        let job = JobContext::new("job1", Configuration::new());
        p.setup_job(&job).unwrap();

        let messages = vec![
            run_task(&p, &job, 0, Some("p=a"), "nuevo"),
            run_task(&p, &job, 1, Some("p=c"), "c"),
        ];
        for m in &messages {
            p.on_task_commit(m);
        }
        assert_eq!(p.observed_commits(), 2);
        assert_eq!(
            p.observed_partitions().iter().cloned().collect::<Vec<_>>(),
            vec!["p=a", "p=c"]
        );

        p.commit_job(&job, &messages).unwrap();

        assert_eq!(
            output_files(out),
            vec![
                "_SUCCESS",
                "p=a/part-00000-job1.out",
                "p=b/intacto.out",
                "p=c/part-00001-job1.out",
            ]
        );
        assert!(!p.staging_dir().unwrap().exists());
    }

    #[test]
    fn particiones_dinamicas_exigen_un_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let p = protocol(
            Arc::new(LocalFileSystem),
            ProtocolArgs {
                dynamic_partition_overwrite: true,
                ..ProtocolArgs::new("job1", Some(tmp.path().to_path_buf()))
            },
        );
        let job = JobContext::new("job1", Configuration::new());
        let mut task = TaskAttemptContext::new(job, 0, 0);
        p.setup_task(&mut task).unwrap();
        assert!(matches!(
            p.new_task_temp_file(&mut task, None, ".out"),
            Err(CommitError::InvalidArgument(_))
        ));
        assert!(matches!(
            p.new_task_temp_file(&mut task, Some("../fuera"), ".out"),
            Err(CommitError::InvalidArgument(_))
        ));
    }

    #[test]
    fn archivos_con_path_absoluto_se_mueven_en_commit_job() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("out");
        let abs = tmp.path().join("externo");
        LocalFileSystem
            .create(&abs.join("part-00000-job1.out"), b"viejo", false)
            .unwrap();

        let mut p = local(&out);
        let job = JobContext::new("job1", Configuration::new());
        p.setup_job(&job).unwrap();

        let mut task = TaskAttemptContext::new(job.clone(), 0, 0);
        p.setup_task(&mut task).unwrap();
        let staged = p.new_task_temp_file_abs_path(&mut task, &abs, ".out").unwrap();
        assert!(staged.starts_with(p.staging_dir().unwrap()));
        assert!(p
            .new_task_temp_file_abs_path(&mut task, Path::new("relativo"), ".out")
            .is_err());
        p.file_system().create(&staged, b"nuevo", false).unwrap();
        let message = p.commit_task(&mut task).unwrap();
        assert_eq!(
            message.file_summary().unwrap().added_abs_path_files.len(),
            1
        );

        p.commit_job(&job, &[message]).unwrap();

        assert_eq!(
            std::fs::read(abs.join("part-00000-job1.out")).unwrap(),
            b"nuevo"
        );
        assert!(!p.staging_dir().unwrap().exists());
    }

    #[test]
    fn overwrite_de_particion_estatica_borra_solo_ese_prefijo() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path();
        let fs = LocalFileSystem;
        fs.create(&out.join("anio=2023").join("x.out"), b"1", false)
            .unwrap();
        fs.create(&out.join("anio=2024").join("x.out"), b"2", false)
            .unwrap();

        let mut p = local(out);
        p.args = ProtocolArgs {
            overwrite: true,
            insert_into_relation: true,
            static_partitions: vec![("anio".into(), "2024".into())],
            ..ProtocolArgs::new("job1", Some(out.to_path_buf()))
        };
        let job = JobContext::new("job1", Configuration::new());
        p.setup_job(&job).unwrap();

        assert!(out.join("anio=2023").join("x.out").exists());
        assert!(!out.join("anio=2024").exists());
    }

    #[test]
    fn digests_detectan_cambios_entre_commits() {
        let tmp = tempfile::tempdir().unwrap();
        let mut p = local(tmp.path());
        let job = JobContext::new(
            "job1",
            Configuration::new().with(crate::config::VERIFY_DIGESTS_KEY, true),
        );
        p.setup_job(&job).unwrap();
        let mut message = run_task(&p, &job, 0, None, "hola");
        assert!(message.file_summary().unwrap().files[0].md5.is_some());

        if let TaskCommitMessage::FileOutput(summary) = &mut message {
            summary.files[0].md5 = Some("0".repeat(32));
        }
        let err = p.commit_job(&job, &[message]).unwrap_err();
        assert!(matches!(err, CommitError::DigestMismatch { .. }));
        assert_eq!(p.state(), JobState::CommitFailed);
        // sin abort_job de por medio: el marker nunca llegó a escribirse
        assert!(!tmp.path().join(SUCCEEDED_FILE_NAME).exists());
    }

    #[test]
    fn un_fallo_moviendo_archivos_absolutos_no_deja_marker() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("out");
        // el "dir" destino es un archivo: el move final no puede crear el padre
        let abs = tmp.path().join("externo");
        LocalFileSystem.create(&abs, b"soy un archivo", false).unwrap();

        let mut p = local(&out);
        let job = JobContext::new("job1", Configuration::new());
        p.setup_job(&job).unwrap();
        let mut task = TaskAttemptContext::new(job.clone(), 0, 0);
        p.setup_task(&mut task).unwrap();
        let staged = p.new_task_temp_file_abs_path(&mut task, &abs, ".out").unwrap();
        p.file_system().create(&staged, b"x", false).unwrap();
        let message = p.commit_task(&mut task).unwrap();

        assert!(p.commit_job(&job, &[message]).is_err());
        assert_eq!(p.state(), JobState::CommitFailed);
        assert!(!out.join(SUCCEEDED_FILE_NAME).exists());
    }

    #[test]
    fn un_attempt_tardio_no_se_publica() {
        let tmp = tempfile::tempdir().unwrap();
        let mut p = local(tmp.path());
        let job = JobContext::new("job1", Configuration::new());
        p.setup_job(&job).unwrap();

        let accepted = run_attempt(&p, &job, 0, 0, None, "aceptado");
        // el attempt relanzado también llega a commit_task, pero el driver
        // ya aceptó el primero y descarta su mensaje
        run_attempt(&p, &job, 0, 1, None, "tardio");
        p.commit_job(&job, &[accepted]).unwrap();

        assert_eq!(output_files(tmp.path()), vec!["_SUCCESS", "part-00000-job1.out"]);
        assert_eq!(
            std::fs::read(tmp.path().join("part-00000-job1.out")).unwrap(),
            b"aceptado"
        );
        assert!(!tmp.path().join("_temporary").exists());
    }

    #[test]
    fn parquet_escribe_el_resumen_despues_del_merge() {
        let tmp = tempfile::tempdir().unwrap();
        let mut p = MapReduceCommitProtocol::new(
            ProtocolArgs::new("job1", Some(tmp.path().to_path_buf())),
            Arc::new(LocalFileSystem),
            parquet_output_committer_factory(),
            Arc::new(PostCommitHooks::with_defaults()),
        );
        let job = JobContext::new("job1", Configuration::new());
        p.setup_job(&job).unwrap();
        let messages = vec![run_task(&p, &job, 0, None, "a")];

        let report = p.commit_job(&job, &messages).unwrap();

        assert_eq!(report.post_commit_hook.as_deref(), Some("parquet-summary"));
        assert!(tmp.path().join(METADATA_FILE_NAME).exists());
    }
}
