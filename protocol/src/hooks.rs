use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::committer::PARQUET_COMMITTER_NAME;
use crate::config::{Configuration, PARQUET_SUMMARY_LEVEL_KEY};
use crate::dispatch::{find_layer, CommitterLayer};
use crate::error::Result;
use crate::fs::{relative_path, walk_files, FileSystem};

pub const METADATA_FILE_NAME: &str = "_metadata";
pub const COMMON_METADATA_FILE_NAME: &str = "_common_metadata";

/// Rutina que corre después del merge genérico, sólo para ciertos committers
/// (se elige por el nombre de la capa, no por la interfaz).
pub trait PostCommitHook: Send + Sync {
    fn name(&self) -> &str;

    fn after_commit(&self, fs: &dyn FileSystem, output_path: &Path, conf: &Configuration)
        -> Result<()>;
}

/// Hooks registrados por nombre de committer.
#[derive(Default, Clone)]
pub struct PostCommitHooks {
    by_committer: HashMap<String, Arc<dyn PostCommitHook>>,
}

impl fmt::Debug for PostCommitHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.by_committer.keys().collect();
        names.sort();
        f.debug_struct("PostCommitHooks")
            .field("committers", &names)
            .finish()
    }
}

impl PostCommitHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Con el hook de resumen de parquet ya registrado.
    pub fn with_defaults() -> Self {
        let mut hooks = Self::new();
        hooks.register(PARQUET_COMMITTER_NAME, Arc::new(ParquetSummaryHook));
        hooks
    }

    pub fn register(&mut self, committer: impl Into<String>, hook: Arc<dyn PostCommitHook>) {
        self.by_committer.insert(committer.into(), hook);
    }

    /// Busca un hook para la capa o cualquiera de sus ancestros.
    pub fn lookup(&self, committer: &dyn CommitterLayer) -> Option<Arc<dyn PostCommitHook>> {
        let layer = find_layer(committer, |l| self.by_committer.contains_key(l.name()))?;
        self.by_committer.get(layer.name()).cloned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryLevel {
    All,
    CommonOnly,
    None,
}

impl SummaryLevel {
    pub fn from_conf(conf: &Configuration) -> Self {
        let raw = conf.get_or(PARQUET_SUMMARY_LEVEL_KEY, "ALL");
        match raw.trim().to_ascii_uppercase().as_str() {
            "ALL" => SummaryLevel::All,
            "COMMON_ONLY" => SummaryLevel::CommonOnly,
            "NONE" => SummaryLevel::None,
            other => {
                warn!("{} inválido: {:?}, usando ALL", PARQUET_SUMMARY_LEVEL_KEY, other);
                SummaryLevel::All
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct SummaryFile {
    path: String,
    len: u64,
}

#[derive(Debug, Serialize)]
struct MetadataSummary {
    version: u32,
    created_by: &'static str,
    file_count: usize,
    total_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    files: Option<Vec<SummaryFile>>,
}

/// Escribe `_metadata` (con la lista de archivos) y/o `_common_metadata`
/// (sólo totales) en la raíz del output, según `parquet.summary.metadata.level`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParquetSummaryHook;

impl PostCommitHook for ParquetSummaryHook {
    fn name(&self) -> &str {
        "parquet-summary"
    }

    fn after_commit(
        &self,
        fs: &dyn FileSystem,
        output_path: &Path,
        conf: &Configuration,
    ) -> Result<()> {
        let level = SummaryLevel::from_conf(conf);
        if level == SummaryLevel::None {
            return Ok(());
        }

        let files: Vec<SummaryFile> = walk_files(fs, output_path, true)?
            .into_iter()
            .map(|s| SummaryFile {
                path: relative_path(output_path, &s.path),
                len: s.len,
            })
            .collect();
        let total_bytes = files.iter().map(|f| f.len).sum();
        let file_count = files.len();

        let common = MetadataSummary {
            version: 1,
            created_by: "commit-protocol",
            file_count,
            total_bytes,
            files: None,
        };
        // se pisa siempre: commit_job puede reintentar
        fs.create(
            &output_path.join(COMMON_METADATA_FILE_NAME),
            &serde_json::to_vec_pretty(&common)?,
            true,
        )?;

        if level == SummaryLevel::All {
            let full = MetadataSummary {
                files: Some(files),
                ..common
            };
            fs.create(
                &output_path.join(METADATA_FILE_NAME),
                &serde_json::to_vec_pretty(&full)?,
                true,
            )?;
        }

        info!(
            "resumen parquet escrito en {} ({} archivos, nivel {:?})",
            output_path.display(),
            file_count,
            level
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::committer::{FileOutputCommitter, ParquetOutputCommitter};
    use crate::fs::LocalFileSystem;

    fn write_output(root: &Path) {
        let fs = LocalFileSystem;
        fs.create(&root.join("part-00000-j.parquet"), b"abcd", false)
            .unwrap();
        fs.create(&root.join("p=1").join("part-00001-j.parquet"), b"ef", false)
            .unwrap();
        fs.create(&root.join("_SUCCESS"), b"", false).unwrap();
    }

    #[test]
    fn lookup_elige_por_identidad_del_committer() {
        let tmp = tempfile::tempdir().unwrap();
        let conf = Configuration::new();
        let hooks = PostCommitHooks::with_defaults();

        let parquet =
            ParquetOutputCommitter::new(Arc::new(LocalFileSystem), "j", tmp.path(), &conf).unwrap();
        let plain =
            FileOutputCommitter::new(Arc::new(LocalFileSystem), "j", tmp.path(), &conf).unwrap();

        let hook = hooks.lookup(&parquet).unwrap();
        assert_eq!(hook.name(), "parquet-summary");
        assert!(hooks.lookup(&plain).is_none());
    }

    #[test]
    fn nivel_all_escribe_ambos_resumenes() {
        let tmp = tempfile::tempdir().unwrap();
        write_output(tmp.path());

        ParquetSummaryHook
            .after_commit(&LocalFileSystem, tmp.path(), &Configuration::new())
            .unwrap();

        let full: serde_json::Value = serde_json::from_slice(
            &std::fs::read(tmp.path().join(METADATA_FILE_NAME)).unwrap(),
        )
        .unwrap();
        assert_eq!(full["file_count"], 2);
        assert_eq!(full["total_bytes"], 6);
        assert_eq!(full["files"][0]["path"], "p=1/part-00001-j.parquet");

        let common: serde_json::Value = serde_json::from_slice(
            &std::fs::read(tmp.path().join(COMMON_METADATA_FILE_NAME)).unwrap(),
        )
        .unwrap();
        assert!(common.get("files").is_none());
    }

    #[test]
    fn common_only_y_none_respetan_la_configuracion() {
        let tmp = tempfile::tempdir().unwrap();
        write_output(tmp.path());

        let conf = Configuration::new().with(PARQUET_SUMMARY_LEVEL_KEY, "common_only");
        ParquetSummaryHook
            .after_commit(&LocalFileSystem, tmp.path(), &conf)
            .unwrap();
        assert!(tmp.path().join(COMMON_METADATA_FILE_NAME).exists());
        assert!(!tmp.path().join(METADATA_FILE_NAME).exists());

        let other = tempfile::tempdir().unwrap();
        write_output(other.path());
        let conf = Configuration::new().with(PARQUET_SUMMARY_LEVEL_KEY, "NONE");
        ParquetSummaryHook
            .after_commit(&LocalFileSystem, other.path(), &conf)
            .unwrap();
        assert!(!other.path().join(COMMON_METADATA_FILE_NAME).exists());
    }
}
