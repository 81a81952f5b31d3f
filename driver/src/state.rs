use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, SystemTime},
};

use commit_protocol::{
    executor::ExecutorId,
    job::{JobInfo, JobStatus},
    task::{AttemptKey, TaskAssignment},
    CommitProtocolRegistry, FileCommitProtocol, JobContext, JobId, TaskCommitMessage, TaskId,
};

/// Config del proceso, leída de variables de entorno.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub bind_addr: String,
    pub data_dir: PathBuf,
    /// Intentos por tarea antes de abortar el job.
    pub max_task_attempts: u32,
    pub executor_dead_timeout: Duration,
}

impl DriverConfig {
    pub fn from_env() -> Self {
        let max_task_attempts = std::env::var("MAX_TASK_ATTEMPTS")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(3)
            .max(1);
        Self {
            bind_addr: std::env::var("DRIVER_BIND_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            data_dir: PathBuf::from(
                std::env::var("DATA_DIR").unwrap_or_else(|_| "/data".to_string()),
            ),
            max_task_attempts,
            executor_dead_timeout: Duration::from_secs(20),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<DriverConfig>,
    pub registry: Arc<CommitProtocolRegistry>,
    pub jobs: Arc<Mutex<HashMap<JobId, JobEntry>>>,
    pub executors: Arc<Mutex<HashMap<ExecutorId, ExecutorMeta>>>,
    // tareas pendientes de asignar
    pub tasks_queue: Arc<Mutex<VecDeque<TaskAssignment>>>,
    // attempts ya asignados pero no reportados
    pub in_flight: Arc<Mutex<HashMap<AttemptKey, InFlight>>>,
}

impl AppState {
    pub fn new(config: DriverConfig, registry: CommitProtocolRegistry) -> Self {
        Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            jobs: Arc::new(Mutex::new(HashMap::new())),
            executors: Arc::new(Mutex::new(HashMap::new())),
            tasks_queue: Arc::new(Mutex::new(VecDeque::new())),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

/// Lock que ignora el envenenamiento: las secciones críticas son inserts y
/// updates de un solo paso.
pub fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct JobEntry {
    pub info: JobInfo,
    pub context: JobContext,
    /// Protocolo del job. `None` mientras corre un commit/abort en un hilo bloqueante.
    pub protocol: Option<Box<dyn FileCommitProtocol>>,
    /// Mensaje del primer attempt exitoso de cada tarea.
    pub messages: BTreeMap<TaskId, TaskCommitMessage>,
}

impl JobEntry {
    pub fn all_tasks_committed(&self) -> bool {
        self.messages.len() as u32 == self.info.total_tasks
    }

    pub fn is_active(&self) -> bool {
        matches!(self.info.status, JobStatus::Accepted | JobStatus::Running)
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorMeta {
    pub hostname: String,
    pub last_heartbeat: SystemTime,
    pub dead: bool,
    pub max_concurrency: u32,

    // Métricas
    pub tasks_started: u64,
    pub tasks_committed: u64,
    pub tasks_failed: u64,
    pub total_task_time_ms: u64,
}

#[derive(Debug, Clone)]
pub struct InFlight {
    pub task: TaskAssignment,
    pub executor_id: ExecutorId,
    pub started_at: SystemTime,
}
