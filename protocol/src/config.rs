use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Versión del algoritmo del committer subyacente (1 = stage + merge, 2 = escritura directa).
pub const ALGORITHM_VERSION_KEY: &str = "mapreduce.fileoutputcommitter.algorithm.version";
/// Si es true, commit_job escribe `<output>/_SUCCESS`.
pub const MARK_SUCCESSFUL_JOBS_KEY: &str = "mapreduce.fileoutputcommitter.marksuccessfuljobs";
/// Máximo de intentos del merge + cleanup en commit_job.
pub const COMMIT_JOB_MAX_ATTEMPTS_KEY: &str = "spark.commit.job.maxAttempts";
/// Si es true, las tareas guardan el md5 de cada archivo y commit_job lo verifica.
pub const VERIFY_DIGESTS_KEY: &str = "spark.commit.verifyDigests";
/// ALL, COMMON_ONLY o NONE.
pub const PARQUET_SUMMARY_LEVEL_KEY: &str = "parquet.summary.metadata.level";

pub const DEFAULT_ALGORITHM_VERSION: u32 = 1;
pub const DEFAULT_COMMIT_JOB_MAX_ATTEMPTS: u32 = 1;

/// Configuración clave→valor de un job.
///
/// Los getters tipados nunca fallan: si el valor no se puede parsear se
/// loguea un warning y se usa el default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Configuration {
    entries: BTreeMap<String, String>,
}

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl ToString) -> &mut Self {
        self.entries.insert(key.into(), value.to_string());
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.set(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key).map(|v| v.trim().to_ascii_lowercase()) {
            None => default,
            Some(v) if v == "true" => true,
            Some(v) if v == "false" => false,
            Some(v) => {
                warn!("valor inválido para {}: {:?}, usando {}", key, v, default);
                default
            }
        }
    }

    pub fn get_u32(&self, key: &str, default: u32) -> u32 {
        self.get_parsed(key, default)
    }

    fn get_parsed<T>(&self, key: &str, default: T) -> T
    where
        T: FromStr + Copy + std::fmt::Display,
    {
        match self.get(key) {
            None => default,
            Some(raw) => raw.trim().parse::<T>().unwrap_or_else(|_| {
                warn!("valor inválido para {}: {:?}, usando {}", key, raw, default);
                default
            }),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Configuration {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Parsea pares `clave=valor` (formato de la CLI).
pub fn parse_key_value(raw: &str) -> Option<(String, String)> {
    let (k, v) = raw.split_once('=')?;
    let k = k.trim();
    if k.is_empty() {
        return None;
    }
    Some((k.to_string(), v.trim().to_string()))
}
