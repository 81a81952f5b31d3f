use serde::{Deserialize, Serialize};

use crate::job::JobId;

/// Lo que quedó visible en el output de un job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResults {
    pub job_id: JobId,
    /// Directorio final del job
    pub output_dir: String,
    /// Archivos de datos, relativos a output_dir (sin markers ni ocultos)
    pub files: Vec<String>,
    /// Si existe `<output_dir>/_SUCCESS`
    pub success_marker: bool,
}
