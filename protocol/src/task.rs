use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{CommitError, Result};
use crate::job::{JobContext, JobId};
use crate::registry::ProtocolSpec;

/// Índice de la tarea dentro del job (también es el "split" del nombre de archivo).
pub type TaskId = u32;

/// `Uninitialized → SetUp → {Committed | Aborted}` por attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Uninitialized,
    SetUp,
    Committed,
    Aborted,
}

/// Estado de un attempt de tarea. Lo posee el executor que lo corre, así que
/// los attempts concurrentes nunca comparten nada en memoria.
#[derive(Debug, Clone)]
pub struct TaskAttemptContext {
    job: JobContext,
    task_id: TaskId,
    attempt: u32,
    pub(crate) state: TaskState,
    /// staged → destino final, para archivos con path absoluto.
    pub(crate) added_abs_path_files: BTreeMap<PathBuf, PathBuf>,
    /// Particiones (dirs relativos) escritas con dynamic partition overwrite.
    pub(crate) partitions: BTreeSet<String>,
}

impl TaskAttemptContext {
    pub fn new(job: JobContext, task_id: TaskId, attempt: u32) -> Self {
        Self {
            job,
            task_id,
            attempt,
            state: TaskState::Uninitialized,
            added_abs_path_files: BTreeMap::new(),
            partitions: BTreeSet::new(),
        }
    }

    pub fn job(&self) -> &JobContext {
        &self.job
    }

    pub fn job_id(&self) -> &JobId {
        &self.job.job_id
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Id único del attempt: embebe job, tarea y número de intento.
    pub fn attempt_id(&self) -> String {
        format!(
            "attempt_{}_{:06}_{}",
            self.job.job_id, self.task_id, self.attempt
        )
    }

    pub(crate) fn expect_state(&self, expected: TaskState, op: &str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(CommitError::InvalidState(format!(
                "{op} requiere {} en {expected:?}, está en {:?}",
                self.attempt_id(),
                self.state
            )))
        }
    }
}

/* --------- Asignación de tareas (driver → executor) --------- */

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub job: JobContext,
    pub task_id: TaskId,
    pub attempt: u32,

    /// Ruta del archivo de entrada
    pub input_path: String,
    /// Dir relativo (partición) donde escribir, ej: "fuente=a"
    pub partition_dir: Option<String>,

    /// Cómo reconstruir el protocolo del job en el executor
    pub protocol: ProtocolSpec,
}

impl TaskAssignment {
    pub fn job_id(&self) -> &JobId {
        &self.job.job_id
    }

    pub fn key(&self) -> AttemptKey {
        AttemptKey {
            job_id: self.job.job_id.clone(),
            task_id: self.task_id,
            attempt: self.attempt,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AttemptKey {
    pub job_id: JobId,
    pub task_id: TaskId,
    pub attempt: u32,
}
