use std::{env, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use reqwest::Client;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use commit_protocol::{
    executor::{
        ExecutorId, ExecutorRegisterRequest, ExecutorRegisterResponse, HeartbeatRequest,
        TaskAssignmentRequest, TaskAssignmentResponse, TaskCompleteRequest, TaskCompleteResponse,
    },
    task::TaskAssignment,
    CommitProtocolRegistry, LocalFileSystem,
};

use crate::attempt::run_attempt;

const DEFAULT_EXECUTOR_CONCURRENCY: u32 = 2;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub driver_url: String,
    pub max_concurrency: u32,
}

impl ExecutorConfig {
    pub fn from_env() -> Self {
        Self {
            driver_url: env::var("DRIVER_URL")
                .unwrap_or_else(|_| "http://localhost:8080".to_string()),
            max_concurrency: env::var("EXECUTOR_CONCURRENCY")
                .ok()
                .and_then(|s| s.parse::<u32>().ok())
                .unwrap_or(DEFAULT_EXECUTOR_CONCURRENCY)
                .max(1),
        }
    }
}

/// Loop principal del executor.
/// - Se registra en el driver.
/// - Manda heartbeats periódicos.
/// - Pide attempts mientras tenga slots libres y corre cada uno en un hilo bloqueante.
pub async fn run(config: ExecutorConfig) -> Result<()> {
    let client = Client::new();
    let base_url = config.driver_url.clone();
    let registry = Arc::new(CommitProtocolRegistry::with_defaults(Arc::new(
        LocalFileSystem,
    )));

    let hostname = hostname::get()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();

    let ExecutorRegisterResponse { executor_id } = client
        .post(format!("{}/api/v1/executors/register", base_url))
        .json(&ExecutorRegisterRequest {
            hostname,
            max_concurrency: config.max_concurrency,
        })
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .with_context(|| format!("no se pudo registrar contra {base_url}"))?
        .json::<ExecutorRegisterResponse>()
        .await?;

    info!(
        "executor {} registrado con concurrency={} contra {}",
        executor_id, config.max_concurrency, base_url
    );

    tokio::spawn(heartbeat_loop(
        client.clone(),
        base_url.clone(),
        executor_id.clone(),
    ));

    let sem = Arc::new(Semaphore::new(config.max_concurrency as usize));

    loop {
        // sin slots libres no se piden attempts
        let permit = match sem.clone().try_acquire_owned() {
            Ok(p) => p,
            Err(_) => {
                sleep(Duration::from_millis(500)).await;
                continue;
            }
        };

        let assignment = match request_task(&client, &base_url, &executor_id).await {
            Ok(a) => a,
            Err(err) => {
                warn!("no se pudo pedir tarea: {:#}", err);
                drop(permit);
                sleep(Duration::from_secs(2)).await;
                continue;
            }
        };

        let Some(task) = assignment.task else {
            drop(permit);
            debug!("executor {} pidió tarea pero no hay", executor_id);
            sleep(Duration::from_secs(1)).await;
            continue;
        };

        info!(
            "tarea {} attempt {} del job {} (input={})",
            task.task_id,
            task.attempt,
            task.job_id(),
            task.input_path
        );

        let client = client.clone();
        let base_url = base_url.clone();
        let executor_id = executor_id.clone();
        let registry = registry.clone();
        tokio::spawn(async move {
            let report = execute_and_report(&client, &base_url, &executor_id, registry, task).await;
            if let Err(err) = report {
                warn!("no se pudo reportar el attempt: {:#}", err);
            }
            // libera el slot
            drop(permit);
        });
    }
}

async fn heartbeat_loop(client: Client, base_url: String, executor_id: ExecutorId) {
    let url = format!("{}/api/v1/executors/heartbeat", base_url);
    loop {
        let res = client
            .post(&url)
            .json(&HeartbeatRequest {
                executor_id: executor_id.clone(),
            })
            .send()
            .await
            .and_then(|r| r.error_for_status());
        if let Err(err) = res {
            warn!("heartbeat falló: {}", err);
        }
        sleep(HEARTBEAT_INTERVAL).await;
    }
}

async fn request_task(
    client: &Client,
    base_url: &str,
    executor_id: &ExecutorId,
) -> Result<TaskAssignmentResponse> {
    let resp = client
        .post(format!("{}/api/v1/tasks/next", base_url))
        .json(&TaskAssignmentRequest {
            executor_id: executor_id.clone(),
        })
        .send()
        .await?
        .error_for_status()?;
    Ok(resp.json().await?)
}

async fn execute_and_report(
    client: &Client,
    base_url: &str,
    executor_id: &ExecutorId,
    registry: Arc<CommitProtocolRegistry>,
    task: TaskAssignment,
) -> Result<()> {
    let assignment = task.clone();
    let outcome = tokio::task::spawn_blocking(move || run_attempt(&registry, &assignment))
        .await
        .context("el hilo del attempt terminó mal")?;

    let resp = client
        .post(format!("{}/api/v1/tasks/complete", base_url))
        .json(&TaskCompleteRequest {
            executor_id: executor_id.clone(),
            job_id: task.job_id().clone(),
            task_id: task.task_id,
            attempt: task.attempt,
            success: outcome.success(),
            message: outcome.message,
            error: outcome.error,
        })
        .send()
        .await?;

    if resp.status() == reqwest::StatusCode::NOT_FOUND {
        // el driver ya reasignó la tarea (nos dio por muertos)
        warn!(
            "el driver descartó la tarea {} attempt {}",
            task.task_id, task.attempt
        );
        return Ok(());
    }
    let TaskCompleteResponse { accepted } = resp
        .error_for_status()?
        .json::<TaskCompleteResponse>()
        .await?;
    if !accepted {
        info!(
            "tarea {} attempt {}: el driver ya tenía otro resultado",
            task.task_id, task.attempt
        );
    }
    Ok(())
}
