use std::{
    collections::HashSet,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    error::MuxError,
    rotation::{RotationEntry, RotationTable},
    supervisor::SupervisorConfig,
    worker::WorkerSpec,
};

pub const ENDPOINT_KEY: &str = "MCP_ENDPOINT";
pub const GRACE_MS_KEY: &str = "TOOLMUX_GRACE_MS";
pub const ROTATION_SECS_KEY: &str = "TOOLMUX_ROTATION_SECS";
pub const ROTATION_GAP_SECS_KEY: &str = "TOOLMUX_ROTATION_GAP_SECS";

pub const DEFAULT_GRACE_MS: u64 = 3_000;
pub const DEFAULT_ROTATION_SECS: u64 = 300;
pub const DEFAULT_ROTATION_GAP_SECS: u64 = 5;

/// Read-only key/value source for settings.
#[async_trait]
pub trait ConfigManagerType: Send + Sync {
    async fn keys(&self) -> Vec<String>;
    async fn get(&self, key: &str) -> Option<String>;
}

/// Process environment, after an optional `.env` file has been merged in.
#[derive(Clone, Debug)]
pub struct EnvConfigManager;

impl EnvConfigManager {
    /// Variables already set in the environment win over the file.
    pub fn new(env_file: PathBuf) -> Self {
        if env_file.exists() {
            match dotenvy::from_path(&env_file) {
                Ok(()) => info!("Loaded .env from {}", env_file.display()),
                Err(e) => warn!("could not parse {}: {e}", env_file.display()),
            }
        } else {
            info!("no env file at {}, using the process environment", env_file.display());
        }
        Self
    }
}

#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn keys(&self) -> Vec<String> {
        env::vars().map(|(k, _)| k).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MapConfigManager {
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, key: &str, value: &str) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&self, key: &str, value: &str) {
        self.map.insert(key.to_string(), value.to_string());
    }

    pub fn del(&self, key: &str) {
        self.map.remove(key);
    }
}

#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn keys(&self) -> Vec<String> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }
}

/// One row of the worker table as written in a workers file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerEntry {
    pub name: String,
    pub command: Vec<String>,
    /// Rotation mode only; falls back to the default duration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<u64>,
}

impl WorkerEntry {
    pub fn spec(&self) -> WorkerSpec {
        WorkerSpec::new(self.name.clone(), self.command.iter().cloned())
    }
}

#[derive(Debug, Deserialize)]
struct WorkersFile {
    workers: Vec<WorkerEntry>,
}

/// The tool adapters shipped with the original deployment.
pub fn default_workers() -> Vec<WorkerEntry> {
    [
        ("calculator", "calculator.py"),
        ("VnExpress", "VnExpress.py"),
        ("dantri_news", "dantri_news.py"),
    ]
    .into_iter()
    .map(|(name, script)| WorkerEntry {
        name: name.to_string(),
        command: vec!["python".to_string(), script.to_string()],
        duration_secs: None,
    })
    .collect()
}

pub fn parse_workers(yaml: &str) -> Result<Vec<WorkerEntry>, MuxError> {
    let file: WorkersFile = serde_yaml_bw::from_str(yaml)
        .map_err(|e| MuxError::Config(format!("invalid workers file: {e}")))?;
    Ok(file.workers)
}

pub fn load_workers(path: &Path) -> Result<Vec<WorkerEntry>, MuxError> {
    let yaml = fs::read_to_string(path)
        .map_err(|e| MuxError::Config(format!("cannot read {}: {e}", path.display())))?;
    let workers = parse_workers(&yaml)?;
    info!(path = %path.display(), count = workers.len(), "loaded worker table");
    Ok(workers)
}

/// At least one worker. Names are non-empty and unique, commands non-empty,
/// and a per-worker duration is never zero.
pub fn validate_workers(workers: &[WorkerEntry]) -> Result<(), MuxError> {
    if workers.is_empty() {
        return Err(MuxError::Config("no workers configured".to_string()));
    }
    let mut seen = HashSet::new();
    for w in workers {
        if w.name.trim().is_empty() {
            return Err(MuxError::Config("worker with an empty name".to_string()));
        }
        if w.command.first().is_none_or(|program| program.trim().is_empty()) {
            return Err(MuxError::Config(format!(
                "worker `{}` has an empty command",
                w.name
            )));
        }
        if w.duration_secs == Some(0) {
            return Err(MuxError::Config(format!(
                "worker `{}` has a zero duration",
                w.name
            )));
        }
        if !seen.insert(w.name.as_str()) {
            return Err(MuxError::Config(format!(
                "worker `{}` is configured twice",
                w.name
            )));
        }
    }
    Ok(())
}

/// Values given on the command line. They beat the environment.
#[derive(Debug, Clone, Default)]
pub struct SettingsOverrides {
    pub grace_ms: Option<u64>,
    pub rotation_secs: Option<u64>,
    pub rotation_gap_secs: Option<u64>,
}

/// Everything both modes need, resolved and validated.
#[derive(Debug, Clone)]
pub struct MuxSettings {
    pub endpoint: String,
    pub grace_period: Duration,
    pub rotation_duration: Duration,
    pub rotation_gap: Duration,
    pub workers: Vec<WorkerEntry>,
}

impl MuxSettings {
    pub async fn load(
        source: &dyn ConfigManagerType,
        workers: Vec<WorkerEntry>,
        overrides: &SettingsOverrides,
    ) -> Result<Self, MuxError> {
        let endpoint = source
            .get(ENDPOINT_KEY)
            .await
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| MuxError::Config(format!("{ENDPOINT_KEY} is not set")))?;

        validate_workers(&workers)?;

        let grace_ms = resolve(source, GRACE_MS_KEY, overrides.grace_ms, DEFAULT_GRACE_MS).await?;
        let rotation_secs = resolve(
            source,
            ROTATION_SECS_KEY,
            overrides.rotation_secs,
            DEFAULT_ROTATION_SECS,
        )
        .await?;
        if rotation_secs == 0 {
            return Err(MuxError::Config(format!(
                "{ROTATION_SECS_KEY} must be at least 1"
            )));
        }
        let gap_secs = resolve(
            source,
            ROTATION_GAP_SECS_KEY,
            overrides.rotation_gap_secs,
            DEFAULT_ROTATION_GAP_SECS,
        )
        .await?;

        Ok(Self {
            endpoint,
            grace_period: Duration::from_millis(grace_ms),
            rotation_duration: Duration::from_secs(rotation_secs),
            rotation_gap: Duration::from_secs(gap_secs),
            workers,
        })
    }

    pub fn worker_specs(&self) -> Vec<WorkerSpec> {
        self.workers.iter().map(WorkerEntry::spec).collect()
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            workers: self.worker_specs(),
            grace_period: self.grace_period,
        }
    }

    pub fn rotation_table(&self) -> Result<RotationTable, MuxError> {
        RotationTable::new(
            self.workers
                .iter()
                .map(|w| {
                    let duration = w
                        .duration_secs
                        .map(Duration::from_secs)
                        .unwrap_or(self.rotation_duration);
                    RotationEntry::new(w.spec(), duration)
                })
                .collect(),
        )
    }
}

async fn resolve(
    source: &dyn ConfigManagerType,
    key: &str,
    flag: Option<u64>,
    default: u64,
) -> Result<u64, MuxError> {
    if let Some(value) = flag {
        return Ok(value);
    }
    match source.get(key).await {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| MuxError::Config(format!("{key} must be a whole number, got `{raw}`"))),
    }
}
