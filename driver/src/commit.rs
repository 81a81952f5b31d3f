//! Operaciones de job del driver: corren en un hilo bloqueante con el
//! protocolo sacado del `JobEntry` y lo devuelven al terminar.

use chrono::Utc;
use tracing::{error, info, warn};

use commit_protocol::{
    job::JobStatus, CommitError, FileCommitProtocol, JobContext, JobId, TaskCommitMessage,
};

use crate::state::{lock, AppState};

/// Saca el protocolo del job para usarlo fuera del lock.
fn take_protocol(
    state: &AppState,
    job_id: &JobId,
) -> Option<(Box<dyn FileCommitProtocol>, JobContext, Vec<TaskCommitMessage>)> {
    let mut jobs = lock(&state.jobs);
    let entry = jobs.get_mut(job_id)?;
    let Some(protocol) = entry.protocol.take() else {
        warn!("job {}: el protocolo ya está en uso", job_id);
        return None;
    };
    let messages = entry.messages.values().cloned().collect();
    Some((protocol, entry.context.clone(), messages))
}

fn drop_queued_tasks(state: &AppState, job_id: &JobId) {
    let mut queue = lock(&state.tasks_queue);
    queue.retain(|t| t.job_id() != job_id);
}

/// commit_job con los mensajes aceptados. Si falla, el job se aborta.
pub async fn commit_job(state: AppState, job_id: JobId) {
    let Some((mut protocol, context, messages)) = take_protocol(&state, &job_id) else {
        return;
    };
    info!("job {}: commit con {} mensajes", job_id, messages.len());

    let res = tokio::task::spawn_blocking(move || {
        let result = protocol.commit_job(&context, &messages);
        if result.is_err() {
            protocol.abort_job(&context);
        }
        (protocol, result)
    })
    .await;

    let mut jobs = lock(&state.jobs);
    let Some(entry) = jobs.get_mut(&job_id) else {
        return;
    };
    entry.info.finished_at = Some(Utc::now());

    match res {
        Ok((protocol, Ok(report))) => {
            entry.protocol = Some(protocol);
            entry.info.status = JobStatus::Succeeded;
            entry.info.commit_attempts = Some(report.attempts);
            info!(
                "job {} comprometido (intentos={}, marker={}, hook={:?})",
                job_id, report.attempts, report.marker_written, report.post_commit_hook
            );
        }
        Ok((protocol, Err(err))) => {
            entry.protocol = Some(protocol);
            entry.info.status = JobStatus::Failed;
            if let CommitError::TerminalCommit {
                attempts, failures, ..
            } = &err
            {
                entry.info.commit_attempts = Some(*attempts);
                for (n, failure) in failures.iter().enumerate() {
                    warn!("job {}: intento de commit {}: {}", job_id, n + 1, failure);
                }
            }
            error!("job {}: commit falló: {}", job_id, err);
            entry.info.error = Some(err.to_string());
        }
        Err(join_err) => {
            entry.info.status = JobStatus::Failed;
            error!("job {}: el hilo de commit terminó mal: {}", job_id, join_err);
            entry.info.error = Some(format!("commit interrumpido: {join_err}"));
        }
    }
}

/// Marca el job como fallido y llama a abort_job (best-effort).
pub async fn abort_job(state: AppState, job_id: JobId, reason: String) {
    {
        let mut jobs = lock(&state.jobs);
        let Some(entry) = jobs.get_mut(&job_id) else {
            return;
        };
        if entry.info.status.is_finished() {
            return;
        }
        entry.info.status = JobStatus::Failed;
        entry.info.finished_at = Some(Utc::now());
        entry.info.error = Some(reason.clone());
    }
    drop_queued_tasks(&state, &job_id);
    warn!("abortando job {}: {}", job_id, reason);

    let Some((mut protocol, context, _)) = take_protocol(&state, &job_id) else {
        return;
    };
    let res = tokio::task::spawn_blocking(move || {
        protocol.abort_job(&context);
        protocol
    })
    .await;

    match res {
        Ok(protocol) => {
            if let Some(entry) = lock(&state.jobs).get_mut(&job_id) {
                entry.protocol = Some(protocol);
            }
        }
        Err(join_err) => error!("job {}: abort interrumpido: {}", job_id, join_err),
    }
}
