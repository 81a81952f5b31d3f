use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::committer::{file_output_committer_factory, parquet_output_committer_factory};
use crate::error::{CommitError, Result};
use crate::fs::FileSystem;
use crate::hooks::PostCommitHooks;
use crate::job::JobId;
use crate::mapreduce::MapReduceCommitProtocol;
use crate::protocol::FileCommitProtocol;

pub const SQL_MAPREDUCE_PROTOCOL: &str = "sql-mapreduce";
pub const SQL_PARQUET_PROTOCOL: &str = "sql-parquet";
pub const MAPREDUCE_PROTOCOL: &str = "mapreduce";

/// Argumentos de construcción de un protocolo (la forma extendida).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolArgs {
    pub job_id: JobId,
    pub output_path: Option<PathBuf>,
    #[serde(default)]
    pub dynamic_partition_overwrite: bool,
    #[serde(default)]
    pub insert_into_relation: bool,
    #[serde(default)]
    pub overwrite: bool,
    /// Pares columna=valor fijos del insert, en orden.
    #[serde(default)]
    pub static_partitions: Vec<(String, String)>,
}

impl ProtocolArgs {
    pub fn new(job_id: impl Into<JobId>, output_path: Option<PathBuf>) -> Self {
        Self {
            job_id: job_id.into(),
            output_path,
            ..Self::default()
        }
    }

    /// `col1=v1/col2=v2`, o `None` si no hay particiones estáticas.
    pub fn static_partition_prefix(&self) -> Option<String> {
        if self.static_partitions.is_empty() {
            return None;
        }
        Some(
            self.static_partitions
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("/"),
        )
    }

    /// true si algo de la forma extendida fue pedido.
    fn uses_extended_shape(&self) -> bool {
        self.dynamic_partition_overwrite
            || self.insert_into_relation
            || self.overwrite
            || !self.static_partitions.is_empty()
    }
}

/// Lo necesario para reconstruir el protocolo de un job en otro proceso.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolSpec {
    pub name: String,
    pub args: ProtocolArgs,
}

/// Forma básica: (job id, output path).
pub type BasicCtor = Arc<
    dyn Fn(Arc<dyn FileSystem>, &str, Option<&Path>) -> Result<Box<dyn FileCommitProtocol>>
        + Send
        + Sync,
>;

/// Forma extendida: todos los `ProtocolArgs`.
pub type ExtendedCtor = Arc<
    dyn Fn(Arc<dyn FileSystem>, &ProtocolArgs) -> Result<Box<dyn FileCommitProtocol>>
        + Send
        + Sync,
>;

#[derive(Clone, Default)]
struct Constructors {
    extended: Option<ExtendedCtor>,
    basic: Option<BasicCtor>,
}

/// Protocolos de commit disponibles, por nombre.
#[derive(Clone)]
pub struct CommitProtocolRegistry {
    fs: Arc<dyn FileSystem>,
    ctors: BTreeMap<String, Constructors>,
}

impl fmt::Debug for CommitProtocolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommitProtocolRegistry")
            .field("fs", &self.fs)
            .field("protocols", &self.names())
            .finish()
    }
}

impl CommitProtocolRegistry {
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self {
            fs,
            ctors: BTreeMap::new(),
        }
    }

    /// `sql-mapreduce` y `sql-parquet` (forma extendida) y `mapreduce`
    /// (sólo forma básica).
    pub fn with_defaults(fs: Arc<dyn FileSystem>) -> Self {
        let hooks = Arc::new(PostCommitHooks::with_defaults());
        let mut registry = Self::new(fs);

        let h = hooks.clone();
        registry.register_extended(
            SQL_MAPREDUCE_PROTOCOL,
            Arc::new(
                move |fs: Arc<dyn FileSystem>,
                      args: &ProtocolArgs|
                      -> Result<Box<dyn FileCommitProtocol>> {
                    Ok(Box::new(MapReduceCommitProtocol::new(
                        args.clone(),
                        fs,
                        file_output_committer_factory(),
                        h.clone(),
                    )))
                },
            ),
        );

        let h = hooks.clone();
        registry.register_extended(
            SQL_PARQUET_PROTOCOL,
            Arc::new(
                move |fs: Arc<dyn FileSystem>,
                      args: &ProtocolArgs|
                      -> Result<Box<dyn FileCommitProtocol>> {
                    Ok(Box::new(MapReduceCommitProtocol::new(
                        args.clone(),
                        fs,
                        parquet_output_committer_factory(),
                        h.clone(),
                    )))
                },
            ),
        );

        registry.register_basic(
            MAPREDUCE_PROTOCOL,
            Arc::new(
                move |fs: Arc<dyn FileSystem>,
                      job_id: &str,
                      output: Option<&Path>|
                      -> Result<Box<dyn FileCommitProtocol>> {
                    Ok(Box::new(MapReduceCommitProtocol::new(
                        ProtocolArgs::new(job_id, output.map(Path::to_path_buf)),
                        fs,
                        file_output_committer_factory(),
                        hooks.clone(),
                    )))
                },
            ),
        );

        registry
    }

    pub fn register_basic(&mut self, name: impl Into<String>, ctor: BasicCtor) {
        self.ctors.entry(name.into()).or_default().basic = Some(ctor);
    }

    pub fn register_extended(&mut self, name: impl Into<String>, ctor: ExtendedCtor) {
        self.ctors.entry(name.into()).or_default().extended = Some(ctor);
    }

    pub fn names(&self) -> Vec<&str> {
        self.ctors.keys().map(String::as_str).collect()
    }

    pub fn file_system(&self) -> Arc<dyn FileSystem> {
        self.fs.clone()
    }

    /// Prueba la forma extendida y si no existe cae a la básica. Con la
    /// básica no hay forma de pedir dynamic partition overwrite, así que en
    /// ese caso es error.
    pub fn instantiate(&self, spec: &ProtocolSpec) -> Result<Box<dyn FileCommitProtocol>> {
        let ctors = self.ctors.get(&spec.name).ok_or_else(|| {
            CommitError::Construction(format!(
                "protocolo desconocido `{}` (disponibles: {})",
                spec.name,
                self.names().join(", ")
            ))
        })?;

        if let Some(extended) = &ctors.extended {
            debug!("instanciando `{}` con la forma extendida", spec.name);
            return extended(self.fs.clone(), &spec.args);
        }

        let Some(basic) = &ctors.basic else {
            return Err(CommitError::Construction(format!(
                "`{}` no tiene constructor registrado",
                spec.name
            )));
        };

        if spec.args.dynamic_partition_overwrite {
            return Err(CommitError::Construction(format!(
                "`{}` no soporta dynamic partition overwrite",
                spec.name
            )));
        }
        if spec.args.uses_extended_shape() {
            warn!(
                "`{}` sólo tiene la forma básica: se ignoran overwrite/insert/particiones estáticas",
                spec.name
            );
        }
        debug!("instanciando `{}` con la forma básica", spec.name);
        basic(
            self.fs.clone(),
            spec.args.job_id.as_str(),
            spec.args.output_path.as_deref(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::LocalFileSystem;

    fn spec(name: &str, dynamic: bool) -> ProtocolSpec {
        ProtocolSpec {
            name: name.to_string(),
            args: ProtocolArgs {
                dynamic_partition_overwrite: dynamic,
                ..ProtocolArgs::new("job1", Some(PathBuf::from("/tmp/out")))
            },
        }
    }

    #[test]
    fn defaults_registra_los_tres_protocolos() {
        let registry = CommitProtocolRegistry::with_defaults(Arc::new(LocalFileSystem));
        assert_eq!(
            registry.names(),
            vec![MAPREDUCE_PROTOCOL, SQL_MAPREDUCE_PROTOCOL, SQL_PARQUET_PROTOCOL]
        );
        for name in registry.names() {
            assert!(registry.instantiate(&spec(name, false)).is_ok(), "{name}");
        }
    }

    #[test]
    fn nombre_desconocido_es_error_de_construccion() {
        let registry = CommitProtocolRegistry::with_defaults(Arc::new(LocalFileSystem));
        let err = registry.instantiate(&spec("s3a", false)).unwrap_err();
        assert!(matches!(err, CommitError::Construction(_)));
    }

    #[test]
    fn dynamic_overwrite_con_forma_basica_falla() {
        let registry = CommitProtocolRegistry::with_defaults(Arc::new(LocalFileSystem));
        let err = registry
            .instantiate(&spec(MAPREDUCE_PROTOCOL, true))
            .unwrap_err();
        assert!(matches!(err, CommitError::Construction(_)));
        assert!(registry
            .instantiate(&spec(SQL_MAPREDUCE_PROTOCOL, true))
            .is_ok());
    }

    #[test]
    fn la_forma_extendida_tiene_prioridad() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = CommitProtocolRegistry::with_defaults(Arc::new(LocalFileSystem));
        let seen = calls.clone();
        registry.register_extended(
            MAPREDUCE_PROTOCOL,
            Arc::new(
                move |fs: Arc<dyn FileSystem>,
                      args: &ProtocolArgs|
                      -> Result<Box<dyn FileCommitProtocol>> {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(Box::new(MapReduceCommitProtocol::new(
                        args.clone(),
                        fs,
                        file_output_committer_factory(),
                        Arc::new(PostCommitHooks::new()),
                    )))
                },
            ),
        );

        registry.instantiate(&spec(MAPREDUCE_PROTOCOL, true)).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn prefijo_de_particiones_estaticas() {
        let mut args = ProtocolArgs::new("j", None);
        assert_eq!(args.static_partition_prefix(), None);
        args.static_partitions = vec![
            ("anio".into(), "2024".into()),
            ("mes".into(), "05".into()),
        ];
        assert_eq!(args.static_partition_prefix().as_deref(), Some("anio=2024/mes=05"));
    }
}
