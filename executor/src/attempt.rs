use std::path::Path;

use anyhow::{Context, Result};
use tracing::{info, warn};

use commit_protocol::{
    task::TaskAssignment, wordcount::wordcount_bytes, CommitProtocolRegistry, FileCommitProtocol,
    TaskAttemptContext, TaskCommitMessage,
};

/// Lo que se le reporta al driver.
#[derive(Debug)]
pub struct AttemptOutcome {
    pub message: Option<TaskCommitMessage>,
    pub error: Option<String>,
}

impl AttemptOutcome {
    pub fn success(&self) -> bool {
        self.message.is_some()
    }

    fn failed(err: anyhow::Error) -> Self {
        Self {
            message: None,
            error: Some(format!("{err:#}")),
        }
    }
}

/// Corre un attempt completo (bloqueante). Si algo falla, el attempt se aborta.
pub fn run_attempt(registry: &CommitProtocolRegistry, task: &TaskAssignment) -> AttemptOutcome {
    let protocol = match registry
        .instantiate(&task.protocol)
        .context("no se pudo construir el protocolo del job")
    {
        Ok(p) => p,
        Err(err) => return AttemptOutcome::failed(err),
    };

    let mut ctx = TaskAttemptContext::new(task.job.clone(), task.task_id, task.attempt);
    match execute(protocol.as_ref(), &mut ctx, task) {
        Ok(message) => {
            info!("{} comprometido", ctx.attempt_id());
            AttemptOutcome {
                message: Some(message),
                error: None,
            }
        }
        Err(err) => {
            warn!("{} falló: {:#}", ctx.attempt_id(), err);
            protocol.abort_task(&mut ctx);
            AttemptOutcome::failed(err)
        }
    }
}

fn execute(
    protocol: &dyn FileCommitProtocol,
    ctx: &mut TaskAttemptContext,
    task: &TaskAssignment,
) -> Result<TaskCommitMessage> {
    protocol.setup_task(ctx)?;

    let fs = protocol.file_system();
    let input = fs
        .read(Path::new(&task.input_path))
        .with_context(|| format!("leyendo {}", task.input_path))?;
    let counts = wordcount_bytes(&input);

    let path = protocol.new_task_temp_file(ctx, task.partition_dir.as_deref(), ".csv")?;
    fs.create(&path, &counts, false)
        .with_context(|| format!("escribiendo {}", path.display()))?;

    Ok(protocol.commit_task(ctx)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use commit_protocol::{
        Configuration, JobContext, LocalFileSystem, ProtocolArgs, ProtocolSpec,
    };
    use std::sync::Arc;

    fn assignment(input: &Path, out: &Path, partition_dir: Option<&str>) -> TaskAssignment {
        TaskAssignment {
            job: JobContext::new("job1", Configuration::new()),
            task_id: 0,
            attempt: 0,
            input_path: input.to_string_lossy().to_string(),
            partition_dir: partition_dir.map(str::to_string),
            protocol: ProtocolSpec {
                name: "sql-mapreduce".into(),
                args: ProtocolArgs::new("job1", Some(out.to_path_buf())),
            },
        }
    }

    #[test]
    fn attempt_exitoso_queda_visible_despues_del_commit_del_job() {
        let tmp = tempfile::tempdir().unwrap();
        let input = tmp.path().join("a.txt");
        let out = tmp.path().join("out");
        std::fs::write(&input, "hola Hola mundo").unwrap();
        let registry = CommitProtocolRegistry::with_defaults(Arc::new(LocalFileSystem));
        let task = assignment(&input, &out, Some("fuente=a"));

        let mut driver_side = registry.instantiate(&task.protocol).unwrap();
        driver_side.setup_job(&task.job).unwrap();

        let outcome = run_attempt(&registry, &task);
        assert!(outcome.success(), "{:?}", outcome.error);
        // todavía en staging
        assert!(!out.join("fuente=a").exists());

        let message = outcome.message.unwrap();
        driver_side.commit_job(&task.job, &[message]).unwrap();

        let csv = std::fs::read_to_string(out.join("fuente=a").join("part-00000-job1.csv")).unwrap();
        assert_eq!(csv, "hola,2\nmundo,1\n");
        assert!(out.join("_SUCCESS").exists());
    }

    #[test]
    fn entrada_faltante_falla_y_no_deja_basura() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("out");
        let registry = CommitProtocolRegistry::with_defaults(Arc::new(LocalFileSystem));
        let task = assignment(&tmp.path().join("no_existe.txt"), &out, None);

        let outcome = run_attempt(&registry, &task);

        assert!(!outcome.success());
        assert!(outcome.error.unwrap().contains("no_existe.txt"));
        assert!(!out.join("_temporary").exists());
    }
}
