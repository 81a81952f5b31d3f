use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::task::TaskId;

/// Lo que devuelve `commit_task` y consume `commit_job`.
///
/// El protocolo no lo interpreta: sólo el committer que lo produjo sabe qué
/// hay adentro. Se trata como un conjunto, el orden de llegada no importa.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum TaskCommitMessage {
    /// Nada que reportar.
    #[default]
    Empty,
    /// Payload de un committer que esta versión no conoce.
    Opaque(Vec<u8>),
    FileOutput(FileCommitSummary),
}

impl TaskCommitMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn file_summary(&self) -> Option<&FileCommitSummary> {
        match self {
            TaskCommitMessage::FileOutput(summary) => Some(summary),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCommitSummary {
    pub task_id: TaskId,
    pub attempt: u32,
    pub committed_at: DateTime<Utc>,

    /// Archivos comprometidos, relativos al output del committer.
    pub files: Vec<CommittedFile>,

    /// staged → destino final (archivos con path absoluto).
    #[serde(default)]
    pub added_abs_path_files: BTreeMap<String, String>,

    /// Particiones tocadas (sólo con dynamic partition overwrite).
    #[serde(default)]
    pub partitions: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedFile {
    pub relative_path: String,
    pub len: u64,
    /// md5 en hex; sólo si la verificación de digests está activa.
    #[serde(default)]
    pub md5: Option<String>,
}

/// Resúmenes de archivo ordenados por tarea, para que los logs sean estables
/// sin importar el orden en que llegaron los mensajes.
pub fn sorted_summaries(messages: &[TaskCommitMessage]) -> Vec<&FileCommitSummary> {
    let mut out: Vec<&FileCommitSummary> =
        messages.iter().filter_map(|m| m.file_summary()).collect();
    out.sort_by_key(|s| (s.task_id, s.attempt));
    out
}
