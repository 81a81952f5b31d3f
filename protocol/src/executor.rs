use serde::{Deserialize, Serialize};

use crate::job::JobId;
use crate::message::TaskCommitMessage;
use crate::task::{TaskAssignment, TaskId};

pub type ExecutorId = String;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorRegisterRequest {
    pub hostname: String,
    pub max_concurrency: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorRegisterResponse {
    pub executor_id: ExecutorId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub executor_id: ExecutorId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub ok: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssignmentRequest {
    pub executor_id: ExecutorId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssignmentResponse {
    pub task: Option<TaskAssignment>,
}

/// Resultado de un attempt. `message` sólo viene si `commit_task` anduvo.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCompleteRequest {
    pub executor_id: ExecutorId,
    pub job_id: JobId,
    pub task_id: TaskId,
    pub attempt: u32,
    pub success: bool,
    #[serde(default)]
    pub message: Option<TaskCommitMessage>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCompleteResponse {
    /// false si el driver descartó el attempt (duplicado o de un executor muerto)
    pub accepted: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ExecutorMetrics {
    pub executor_id: ExecutorId,
    pub hostname: String,
    pub dead: bool,
    pub max_concurrency: u32,
    pub last_heartbeat_secs_ago: u64,
    pub active_tasks: u32,
    pub tasks_started: u64,
    pub tasks_committed: u64,
    pub tasks_failed: u64,
    pub avg_task_ms: Option<f64>,
}
