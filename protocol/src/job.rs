use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Configuration;
use crate::error::{CommitError, Result};

pub type JobId = String;

/// Contexto de un job: id + configuración. Lo comparten driver y executors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobContext {
    pub job_id: JobId,
    #[serde(default)]
    pub conf: Configuration,
}

impl JobContext {
    pub fn new(job_id: impl Into<JobId>, conf: Configuration) -> Self {
        Self {
            job_id: job_id.into(),
            conf,
        }
    }
}

/// Estado de una instancia de protocolo (una por job).
///
/// `Uninitialized → SetUp → {Committed | Aborted}`. Si `commit_job` falla el
/// job queda en `CommitFailed` y sólo se permite `abort_job`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Uninitialized,
    SetUp,
    CommitFailed,
    Committed,
    Aborted,
}

impl JobState {
    pub(crate) fn expect(self, expected: JobState, op: &str) -> Result<()> {
        if self == expected {
            Ok(())
        } else {
            Err(CommitError::InvalidState(format!(
                "{op} requiere job en {expected:?}, está en {self:?}"
            )))
        }
    }
}

/* --------- API del driver --------- */

fn default_committer() -> String {
    "sql-mapreduce".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub name: String,

    /// Patrón de archivos de entrada, ej: "/data/input/*.txt". Una tarea por archivo.
    pub input_glob: String,

    /// Directorio final de salida; si falta el driver usa `<DATA_DIR>/output/<job_id>`.
    #[serde(default)]
    pub output_dir: Option<String>,

    /// Nombre del protocolo en el registry ("sql-mapreduce", "sql-parquet", "mapreduce").
    #[serde(default = "default_committer")]
    pub committer: String,

    /// Columna de partición: cada tarea escribe en `<col>=<nombre del archivo>`.
    #[serde(default)]
    pub partition_by: Option<String>,

    #[serde(default)]
    pub dynamic_partition_overwrite: bool,

    #[serde(default)]
    pub insert_into_relation: bool,

    #[serde(default)]
    pub overwrite: bool,

    #[serde(default)]
    pub static_partitions: Vec<(String, String)>,

    #[serde(default)]
    pub conf: Configuration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Accepted,
    Running,
    Committing,
    Failed,
    Succeeded,
}

impl JobStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, JobStatus::Failed | JobStatus::Succeeded)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: JobId,
    pub name: String,
    pub status: JobStatus,
    pub committer: String,

    pub input_glob: String,
    pub output_dir: String,

    /// -------- Métricas del job --------
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub total_tasks: u32,
    pub committed_tasks: u32,
    pub failed_attempts: u32,
    pub retries: u32,

    /// Intentos que necesitó commit_job (None hasta que corre).
    pub commit_attempts: Option<u32>,
    pub error: Option<String>,
}
