use std::{
    collections::{BTreeMap, HashMap},
    path::{Path as FsPath, PathBuf},
    time::SystemTime,
};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use glob::glob;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use commit_protocol::{
    committer::SUCCEEDED_FILE_NAME,
    executor::{
        ExecutorId, ExecutorMetrics, ExecutorRegisterRequest, ExecutorRegisterResponse,
        HeartbeatRequest, HeartbeatResponse, TaskAssignmentRequest, TaskAssignmentResponse,
        TaskCompleteRequest, TaskCompleteResponse,
    },
    fs::{relative_path, walk_files},
    job::{JobInfo, JobRequest, JobStatus},
    results::JobResults,
    task::{AttemptKey, TaskAssignment},
    CommitError, JobContext, ProtocolArgs, ProtocolSpec, TaskCommitMessage,
};

use crate::commit;
use crate::state::{lock, AppState, ExecutorMeta, InFlight, JobEntry};

type ApiError = (StatusCode, String);

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/jobs", post(create_job))
        .route("/api/v1/jobs/:id", get(get_job))
        .route("/api/v1/jobs/:id/results", get(get_job_results))
        .route("/api/v1/executors", get(list_executors))
        .route("/api/v1/executors/register", post(register_executor))
        .route("/api/v1/executors/heartbeat", post(executor_heartbeat))
        .route("/api/v1/tasks/next", post(assign_task))
        .route("/api/v1/tasks/complete", post(complete_task))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn construction_status(err: &CommitError) -> StatusCode {
    match err {
        CommitError::Construction(_) | CommitError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// "fuente=<stem>" para el archivo de entrada, sin separadores de path.
fn partition_dir(column: &str, input: &FsPath) -> String {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
        .replace(['/', '\\', '='], "_");
    format!("{column}={stem}")
}

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

// Crea un job, instancia su protocolo, corre setup_job y encola una tarea por archivo de entrada
async fn create_job(
    State(state): State<AppState>,
    Json(req): Json<JobRequest>,
) -> Result<Json<JobInfo>, ApiError> {
    let job_id = uuid::Uuid::new_v4().to_string();
    let output_dir = req
        .output_dir
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(|| state.config.data_dir.join("output").join(&job_id));

    let pattern = glob(&req.input_glob).map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            format!("input_glob inválido: {e}"),
        )
    })?;
    let mut inputs: Vec<PathBuf> = pattern.flatten().filter(|p| p.is_file()).collect();
    inputs.sort();

    let spec = ProtocolSpec {
        name: req.committer.clone(),
        args: ProtocolArgs {
            job_id: job_id.clone(),
            output_path: Some(output_dir.clone()),
            dynamic_partition_overwrite: req.dynamic_partition_overwrite,
            insert_into_relation: req.insert_into_relation,
            overwrite: req.overwrite,
            static_partitions: req.static_partitions.clone(),
        },
    };
    let context = JobContext::new(job_id.clone(), req.conf.clone());

    let mut protocol = state
        .registry
        .instantiate(&spec)
        .map_err(|e| (construction_status(&e), e.to_string()))?;

    // setup_job toca el filesystem
    let setup_ctx = context.clone();
    let (protocol, setup) = tokio::task::spawn_blocking(move || {
        let res = protocol.setup_job(&setup_ctx);
        (protocol, res)
    })
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    if let Err(err) = setup {
        warn!("setup del job {} falló: {}", job_id, err);
        return Err((construction_status(&err), err.to_string()));
    }

    let tasks: Vec<TaskAssignment> = inputs
        .iter()
        .enumerate()
        .map(|(i, input)| TaskAssignment {
            job: context.clone(),
            task_id: i as u32,
            attempt: 0,
            input_path: input.to_string_lossy().to_string(),
            partition_dir: req
                .partition_by
                .as_deref()
                .map(|col| partition_dir(col, input)),
            protocol: spec.clone(),
        })
        .collect();

    let info = JobInfo {
        id: job_id.clone(),
        name: req.name,
        status: JobStatus::Accepted,
        committer: req.committer,
        input_glob: req.input_glob,
        output_dir: output_dir.to_string_lossy().to_string(),

        submitted_at: Utc::now(),
        started_at: None,
        finished_at: None,
        total_tasks: tasks.len() as u32,
        committed_tasks: 0,
        failed_attempts: 0,
        retries: 0,
        commit_attempts: None,
        error: None,
    };

    {
        let mut jobs = lock(&state.jobs);
        jobs.insert(
            job_id.clone(),
            JobEntry {
                info: info.clone(),
                context,
                protocol: Some(protocol),
                messages: BTreeMap::new(),
            },
        );
    }

    info!(
        "job {} creado: {} tareas, committer {}, output {}",
        job_id,
        tasks.len(),
        info.committer,
        info.output_dir
    );

    if tasks.is_empty() {
        // sin tareas igual hay que limpiar y dejar el marker
        if let Some(entry) = lock(&state.jobs).get_mut(&job_id) {
            entry.info.status = JobStatus::Committing;
        }
        tokio::spawn(commit::commit_job(state.clone(), job_id));
    } else {
        let mut queue = lock(&state.tasks_queue);
        queue.extend(tasks);
    }

    Ok(Json(info))
}

// Devuelve info básica de un job
async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobInfo>, StatusCode> {
    let jobs = lock(&state.jobs);
    jobs.get(&id)
        .map(|entry| Json(entry.info.clone()))
        .ok_or(StatusCode::NOT_FOUND)
}

// Lista los archivos visibles en el output de un job
async fn get_job_results(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobResults>, ApiError> {
    let (fs, output_dir) = {
        let jobs = lock(&state.jobs);
        let entry = jobs
            .get(&id)
            .ok_or((StatusCode::NOT_FOUND, format!("job {id} no existe")))?;
        (state.registry.file_system(), entry.info.output_dir.clone())
    };

    let listing = tokio::task::spawn_blocking(move || {
        let root = FsPath::new(&output_dir);
        let files: Vec<String> = walk_files(fs.as_ref(), root, true)?
            .iter()
            .map(|s| relative_path(root, &s.path))
            .collect();
        let marker = fs.exists(&root.join(SUCCEEDED_FILE_NAME))?;
        Ok::<_, CommitError>((output_dir, files, marker))
    })
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    let (output_dir, files, success_marker) =
        listing.map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(JobResults {
        job_id: id,
        output_dir,
        files,
        success_marker,
    }))
}

// Registra un executor nuevo
async fn register_executor(
    State(state): State<AppState>,
    Json(req): Json<ExecutorRegisterRequest>,
) -> Json<ExecutorRegisterResponse> {
    let executor_id = uuid::Uuid::new_v4().to_string();

    {
        let mut executors = lock(&state.executors);
        executors.insert(
            executor_id.clone(),
            ExecutorMeta {
                hostname: req.hostname,
                last_heartbeat: SystemTime::now(),
                dead: false,
                max_concurrency: req.max_concurrency.max(1),

                tasks_started: 0,
                tasks_committed: 0,
                tasks_failed: 0,
                total_task_time_ms: 0,
            },
        );
    }

    info!(
        "executor registrado: {} (max_concurrency={})",
        executor_id, req.max_concurrency
    );
    Json(ExecutorRegisterResponse { executor_id })
}

// Heartbeat de executor
async fn executor_heartbeat(
    State(state): State<AppState>,
    Json(req): Json<HeartbeatRequest>,
) -> Result<Json<HeartbeatResponse>, StatusCode> {
    let mut executors = lock(&state.executors);
    match executors.get_mut(&req.executor_id) {
        // un executor dado por muerto no vuelve: sus attempts ya se reencolaron
        Some(meta) if !meta.dead => {
            meta.last_heartbeat = SystemTime::now();
            Ok(Json(HeartbeatResponse { ok: true }))
        }
        _ => Err(StatusCode::NOT_FOUND),
    }
}

// Asigna el siguiente attempt en cola (si hay y el executor tiene lugar)
async fn assign_task(
    State(state): State<AppState>,
    Json(req): Json<TaskAssignmentRequest>,
) -> Json<TaskAssignmentResponse> {
    let max_for_executor = {
        let executors = lock(&state.executors);
        match executors.get(&req.executor_id) {
            Some(meta) if !meta.dead => meta.max_concurrency,
            _ => {
                warn!("executor {} desconocido o muerto pidió tarea", req.executor_id);
                return Json(TaskAssignmentResponse { task: None });
            }
        }
    };

    let active_for_executor = {
        let in_flight = lock(&state.in_flight);
        in_flight
            .values()
            .filter(|entry| entry.executor_id == req.executor_id)
            .count() as u32
    };

    if active_for_executor >= max_for_executor {
        debug!(
            "executor {} ya tiene {}/{} attempts en vuelo",
            req.executor_id, active_for_executor, max_for_executor
        );
        return Json(TaskAssignmentResponse { task: None });
    }

    let Some(task) = lock(&state.tasks_queue).pop_front() else {
        return Json(TaskAssignmentResponse { task: None });
    };

    info!(
        "asignando tarea {} attempt {} (job={}, input={}) al executor {}",
        task.task_id,
        task.attempt,
        task.job_id(),
        task.input_path,
        req.executor_id,
    );

    lock(&state.in_flight).insert(
        task.key(),
        InFlight {
            task: task.clone(),
            executor_id: req.executor_id.clone(),
            started_at: SystemTime::now(),
        },
    );

    {
        let mut jobs = lock(&state.jobs);
        if let Some(entry) = jobs.get_mut(task.job_id()) {
            if entry.info.status == JobStatus::Accepted {
                entry.info.status = JobStatus::Running;
                entry.info.started_at = Some(Utc::now());
            }
        }
    }

    if let Some(meta) = lock(&state.executors).get_mut(&req.executor_id) {
        meta.tasks_started += 1;
    }

    Json(TaskAssignmentResponse { task: Some(task) })
}

/// Qué hacer después de registrar el resultado de un attempt.
enum Followup {
    Nothing,
    Commit,
    Abort(String),
}

// El executor reporta el resultado de un attempt
async fn complete_task(
    State(state): State<AppState>,
    Json(req): Json<TaskCompleteRequest>,
) -> Result<Json<TaskCompleteResponse>, StatusCode> {
    let key = AttemptKey {
        job_id: req.job_id.clone(),
        task_id: req.task_id,
        attempt: req.attempt,
    };

    // attempt desconocido, duplicado o de un executor dado por muerto
    let inflight = lock(&state.in_flight).remove(&key).ok_or_else(|| {
        warn!(
            "ignorando resultado de tarea {} attempt {} (job {}): no está en vuelo",
            req.task_id, req.attempt, req.job_id
        );
        StatusCode::NOT_FOUND
    })?;

    record_executor_metrics(&state, &inflight, req.success);

    let (accepted, followup) = if req.success {
        accept_commit(&state, &req)
    } else {
        handle_failure(&state, inflight.task, req.error.as_deref())
    };

    match followup {
        Followup::Nothing => {}
        Followup::Commit => {
            tokio::spawn(commit::commit_job(state.clone(), req.job_id.clone()));
        }
        Followup::Abort(reason) => {
            tokio::spawn(commit::abort_job(state.clone(), req.job_id.clone(), reason));
        }
    }

    Ok(Json(TaskCompleteResponse { accepted }))
}

fn record_executor_metrics(state: &AppState, inflight: &InFlight, success: bool) {
    let duration_ms = inflight
        .started_at
        .elapsed()
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);

    let mut executors = lock(&state.executors);
    if let Some(meta) = executors.get_mut(&inflight.executor_id) {
        meta.total_task_time_ms += duration_ms;
        if success {
            meta.tasks_committed += 1;
        } else {
            meta.tasks_failed += 1;
        }
    }
}

/// Sólo el primer attempt exitoso de cada tarea entra en el commit del job.
fn accept_commit(state: &AppState, req: &TaskCompleteRequest) -> (bool, Followup) {
    let mut jobs = lock(&state.jobs);
    let Some(entry) = jobs.get_mut(&req.job_id) else {
        return (false, Followup::Nothing);
    };
    if !entry.is_active() {
        debug!("job {} ya no está activo, se descarta el attempt", req.job_id);
        return (false, Followup::Nothing);
    }
    if entry.messages.contains_key(&req.task_id) {
        debug!(
            "tarea {} del job {} ya tiene un attempt aceptado",
            req.task_id, req.job_id
        );
        return (false, Followup::Nothing);
    }

    let message = req.message.clone().unwrap_or(TaskCommitMessage::Empty);
    if let Some(protocol) = entry.protocol.as_mut() {
        protocol.on_task_commit(&message);
    }
    entry.messages.insert(req.task_id, message);
    entry.info.committed_tasks += 1;

    if entry.all_tasks_committed() {
        entry.info.status = JobStatus::Committing;
        (true, Followup::Commit)
    } else {
        (true, Followup::Nothing)
    }
}

fn handle_failure(
    state: &AppState,
    mut task: TaskAssignment,
    error: Option<&str>,
) -> (bool, Followup) {
    let mut jobs = lock(&state.jobs);
    let Some(entry) = jobs.get_mut(task.job_id()) else {
        return (false, Followup::Nothing);
    };
    if !entry.is_active() {
        return (false, Followup::Nothing);
    }
    entry.info.failed_attempts += 1;
    warn!(
        "tarea {} attempt {} del job {} falló: {}",
        task.task_id,
        task.attempt,
        task.job_id(),
        error.unwrap_or("sin detalle")
    );

    if task.attempt + 1 < state.config.max_task_attempts {
        entry.info.retries += 1;
        task.attempt += 1;
        drop(jobs);
        lock(&state.tasks_queue).push_back(task);
        (true, Followup::Nothing)
    } else {
        let reason = format!(
            "tarea {} agotó {} attempts: {}",
            task.task_id,
            state.config.max_task_attempts,
            error.unwrap_or("sin detalle")
        );
        (true, Followup::Abort(reason))
    }
}

async fn list_executors(State(state): State<AppState>) -> Json<Vec<ExecutorMetrics>> {
    let now = SystemTime::now();

    // attempts activos por executor (desde in_flight)
    let mut active_by_executor: HashMap<ExecutorId, u32> = HashMap::new();
    for inf in lock(&state.in_flight).values() {
        *active_by_executor.entry(inf.executor_id.clone()).or_insert(0) += 1;
    }

    let executors = lock(&state.executors);
    let mut out: Vec<ExecutorMetrics> = executors
        .iter()
        .map(|(id, meta)| ExecutorMetrics {
            executor_id: id.clone(),
            hostname: meta.hostname.clone(),
            dead: meta.dead,
            max_concurrency: meta.max_concurrency,
            last_heartbeat_secs_ago: now
                .duration_since(meta.last_heartbeat)
                .unwrap_or_default()
                .as_secs(),
            active_tasks: active_by_executor.get(id).copied().unwrap_or(0),
            tasks_started: meta.tasks_started,
            tasks_committed: meta.tasks_committed,
            tasks_failed: meta.tasks_failed,
            avg_task_ms: if meta.tasks_committed > 0 {
                Some(meta.total_task_time_ms as f64 / meta.tasks_committed as f64)
            } else {
                None
            },
        })
        .collect();
    out.sort_by(|a, b| a.executor_id.cmp(&b.executor_id));

    Json(out)
}
