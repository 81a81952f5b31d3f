use std::{
    collections::HashSet,
    time::{Duration, SystemTime},
};

use tracing::{info, warn};

use commit_protocol::{task::TaskAssignment, JobId};

use crate::commit;
use crate::state::{lock, AppState};

/// Loop de tolerancia a fallos: cada 5s marca executors muertos y reencola
/// sus attempts en vuelo con `attempt + 1`.
pub async fn monitor_executors(state: AppState) {
    loop {
        tokio::time::sleep(Duration::from_secs(5)).await;
        for (job_id, reason) in sweep_once(&state, SystemTime::now()) {
            tokio::spawn(commit::abort_job(state.clone(), job_id, reason));
        }
    }
}

/// Una pasada. Devuelve los jobs que hay que abortar porque una tarea se
/// quedó sin attempts.
pub fn sweep_once(state: &AppState, now: SystemTime) -> Vec<(JobId, String)> {
    let timeout = state.config.executor_dead_timeout;

    let mut dead: HashSet<String> = HashSet::new();
    {
        let mut executors = lock(&state.executors);
        for (id, meta) in executors.iter_mut() {
            if meta.dead {
                continue;
            }
            if let Ok(elapsed) = now.duration_since(meta.last_heartbeat) {
                if elapsed > timeout {
                    meta.dead = true;
                    warn!("executor {} sin heartbeat hace {:?}, se marca muerto", id, elapsed);
                    dead.insert(id.clone());
                }
            }
        }
    }

    if dead.is_empty() {
        return Vec::new();
    }

    // un attempt huérfano puede seguir vivo y llegar a commit_task; su reporte
    // ya no está en in_flight y el driver lo rechaza. Con v1 ese output queda
    // en staging y commit_job lo descarta; con v2 commit_task escribe directo
    // en el destino
    let mut to_requeue: Vec<TaskAssignment> = Vec::new();
    let mut to_abort: Vec<(JobId, String)> = Vec::new();
    {
        let mut in_flight = lock(&state.in_flight);
        in_flight.retain(|_, inflight| {
            if !dead.contains(&inflight.executor_id) {
                return true;
            }
            let mut task = inflight.task.clone();
            if task.attempt + 1 < state.config.max_task_attempts {
                task.attempt += 1;
                to_requeue.push(task);
            } else {
                to_abort.push((
                    task.job_id().clone(),
                    format!(
                        "tarea {} perdida con el executor {} y sin attempts",
                        task.task_id, inflight.executor_id
                    ),
                ));
            }
            false
        });
    }

    if !to_requeue.is_empty() {
        let mut jobs = lock(&state.jobs);
        let mut queue = lock(&state.tasks_queue);
        for task in to_requeue {
            if let Some(entry) = jobs.get_mut(task.job_id()) {
                if !entry.is_active() {
                    continue;
                }
                entry.info.retries += 1;
            }
            info!(
                "reencolando tarea {} del job {} como attempt {}",
                task.task_id,
                task.job_id(),
                task.attempt
            );
            queue.push_back(task);
        }
    }

    to_abort
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{DriverConfig, ExecutorMeta, InFlight};
    use commit_protocol::{
        registry::ProtocolSpec, CommitProtocolRegistry, Configuration, JobContext,
        LocalFileSystem, ProtocolArgs,
    };
    use std::sync::Arc;

    fn state(max_task_attempts: u32) -> AppState {
        AppState::new(
            DriverConfig {
                bind_addr: "127.0.0.1:0".into(),
                data_dir: "/tmp".into(),
                max_task_attempts,
                executor_dead_timeout: Duration::from_secs(20),
            },
            CommitProtocolRegistry::with_defaults(Arc::new(LocalFileSystem)),
        )
    }

    fn in_flight(state: &AppState, executor: &str, last_heartbeat: SystemTime) {
        lock(&state.executors).insert(
            executor.to_string(),
            ExecutorMeta {
                hostname: "h".into(),
                last_heartbeat,
                dead: false,
                max_concurrency: 1,
                tasks_started: 1,
                tasks_committed: 0,
                tasks_failed: 0,
                total_task_time_ms: 0,
            },
        );
        let task = TaskAssignment {
            job: JobContext::new("job1", Configuration::new()),
            task_id: 0,
            attempt: 0,
            input_path: "/in/a.txt".into(),
            partition_dir: None,
            protocol: ProtocolSpec {
                name: "sql-mapreduce".into(),
                args: ProtocolArgs::new("job1", None),
            },
        };
        lock(&state.in_flight).insert(
            task.key(),
            InFlight {
                task,
                executor_id: executor.to_string(),
                started_at: last_heartbeat,
            },
        );
    }

    #[test]
    fn executor_muerto_reencola_con_el_siguiente_attempt() {
        let state = state(3);
        let now = SystemTime::now();
        in_flight(&state, "e1", now - Duration::from_secs(60));

        let to_abort = sweep_once(&state, now);

        assert!(to_abort.is_empty());
        assert!(lock(&state.executors)["e1"].dead);
        assert!(lock(&state.in_flight).is_empty());
        let queue = lock(&state.tasks_queue);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].attempt, 1);
    }

    #[test]
    fn executor_vivo_no_se_toca() {
        let state = state(3);
        let now = SystemTime::now();
        in_flight(&state, "e1", now - Duration::from_secs(1));

        assert!(sweep_once(&state, now).is_empty());
        assert!(!lock(&state.executors)["e1"].dead);
        assert_eq!(lock(&state.in_flight).len(), 1);
    }

    #[test]
    fn sin_attempts_restantes_se_aborta_el_job() {
        let state = state(1);
        let now = SystemTime::now();
        in_flight(&state, "e1", now - Duration::from_secs(60));

        let to_abort = sweep_once(&state, now);

        assert_eq!(to_abort.len(), 1);
        assert_eq!(to_abort[0].0, "job1");
        assert!(lock(&state.tasks_queue).is_empty());
    }
}
