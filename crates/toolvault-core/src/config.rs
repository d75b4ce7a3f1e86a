//! Runtime configuration for the vault.
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! `TOOLVAULT_*` environment variables. Binaries apply their own CLI flags
//! last.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{VaultError, VaultResult};

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    pub engine: EngineConfig,
    pub runtime: RuntimeConfig,
    pub storage: StorageConfig,
}

/// Scheduling, timeout and retry policy of the execution engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Executions allowed to run at once across all tools.
    pub max_concurrent_executions: usize,
    /// How long an invocation may wait for admission before `SandboxBusy`.
    pub admission_timeout_ms: u64,
    /// Used when neither the request nor the manifest names a timeout.
    pub default_timeout_secs: u64,
    /// Upper bound for any per-request timeout.
    pub max_timeout_secs: u64,
    /// stdout/stderr are each truncated to this many bytes.
    pub max_output_bytes: usize,
    /// Retries after a `SandboxUnavailable` platform error.
    pub platform_retries: u32,
    /// Base delay for exponential backoff between platform retries.
    pub backoff_base_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_executions: 4,
            admission_timeout_ms: 30_000,
            default_timeout_secs: 30,
            max_timeout_secs: 3_600,
            max_output_bytes: 1024 * 1024,
            platform_retries: 2,
            backoff_base_ms: 500,
        }
    }
}

impl EngineConfig {
    pub fn admission_timeout(&self) -> Duration {
        Duration::from_millis(self.admission_timeout_ms)
    }
}

/// Container runtime settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Docker-compatible CLI binary.
    pub docker_bin: String,
    /// Non-root `uid:gid` the tool runs as.
    pub user: String,
    pub pids_limit: u32,
    pub tmpfs_size_mb: u64,
    /// Bridge network used for `isolated-bridge` grants.
    pub bridge_network: String,
    /// Host directory holding one sub-directory per tool volume.
    pub volume_root: PathBuf,
    /// How often a running container's CPU and memory are sampled.
    pub stats_interval_ms: u64,
}

impl RuntimeConfig {
    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms.max(50))
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            docker_bin: "docker".to_string(),
            user: "65534:65534".to_string(),
            pids_limit: 64,
            tmpfs_size_mb: 64,
            bridge_network: "toolvault-isolated".to_string(),
            volume_root: PathBuf::from(".toolvault/volumes"),
            stats_interval_ms: 1_000,
        }
    }
}

/// Where the durable store lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Explicit SurrealDB endpoint (`mem://`, `surrealkv://path`, `ws://host`).
    /// When unset the store falls back to the environment, then `local_path`.
    pub url: Option<String>,
    pub local_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            url: None,
            local_path: toolvault_state::DEFAULT_LOCAL_PATH.to_string(),
        }
    }
}

impl VaultConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(text: &str) -> VaultResult<Self> {
        toml::from_str(text).map_err(|e| VaultError::Config(e.to_string()))
    }

    /// Load from a TOML file. A missing file yields the defaults.
    pub fn from_file(path: &Path) -> VaultResult<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_toml_str(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(VaultError::Config(format!("{}: {e}", path.display()))),
        }
    }

    /// Defaults, then `path` if given, then the process environment.
    pub fn load(path: Option<&Path>) -> VaultResult<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_env_from(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay `TOOLVAULT_*` variables read through `lookup`.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> VaultResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, raw: String) -> VaultResult<T> {
            raw.trim()
                .parse()
                .map_err(|_| VaultError::Config(format!("{key}: cannot parse '{raw}'")))
        }

        if let Some(v) = lookup("TOOLVAULT_MAX_CONCURRENT") {
            self.engine.max_concurrent_executions = parse("TOOLVAULT_MAX_CONCURRENT", v)?;
        }
        if let Some(v) = lookup("TOOLVAULT_ADMISSION_TIMEOUT_MS") {
            self.engine.admission_timeout_ms = parse("TOOLVAULT_ADMISSION_TIMEOUT_MS", v)?;
        }
        if let Some(v) = lookup("TOOLVAULT_DEFAULT_TIMEOUT_SECS") {
            self.engine.default_timeout_secs = parse("TOOLVAULT_DEFAULT_TIMEOUT_SECS", v)?;
        }
        if let Some(v) = lookup("TOOLVAULT_MAX_OUTPUT_BYTES") {
            self.engine.max_output_bytes = parse("TOOLVAULT_MAX_OUTPUT_BYTES", v)?;
        }
        if let Some(v) = lookup("TOOLVAULT_PLATFORM_RETRIES") {
            self.engine.platform_retries = parse("TOOLVAULT_PLATFORM_RETRIES", v)?;
        }
        if let Some(v) = lookup("TOOLVAULT_DOCKER_BIN") {
            self.runtime.docker_bin = v;
        }
        if let Some(v) = lookup("TOOLVAULT_BRIDGE_NETWORK") {
            self.runtime.bridge_network = v;
        }
        if let Some(v) = lookup("TOOLVAULT_VOLUME_ROOT") {
            self.runtime.volume_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("TOOLVAULT_DB_URL") {
            self.storage.url = Some(v);
        }
        if let Some(v) = lookup("TOOLVAULT_DB_PATH") {
            self.storage.local_path = v;
        }
        Ok(())
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> VaultResult<()> {
        if self.engine.max_concurrent_executions == 0 {
            return Err(VaultError::Config(
                "engine.max_concurrent_executions must be at least 1".into(),
            ));
        }
        if self.engine.default_timeout_secs == 0
            || self.engine.default_timeout_secs > self.engine.max_timeout_secs
        {
            return Err(VaultError::Config(format!(
                "engine.default_timeout_secs must be within 1..={}",
                self.engine.max_timeout_secs
            )));
        }
        if self.runtime.docker_bin.trim().is_empty() {
            return Err(VaultError::Config("runtime.docker_bin is empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = VaultConfig::default();
        config.validate().unwrap();
        assert_eq!(config.engine.max_concurrent_executions, 4);
        assert_eq!(config.runtime.user, "65534:65534");
        assert!(config.storage.url.is_none());
    }

    #[test]
    fn test_partial_toml_keeps_other_defaults() {
        let config = VaultConfig::from_toml_str(
            r#"
            [engine]
            max_concurrent_executions = 8

            [runtime]
            bridge_network = "tools-net"
            "#,
        )
        .unwrap();
        assert_eq!(config.engine.max_concurrent_executions, 8);
        assert_eq!(config.engine.admission_timeout_ms, 30_000);
        assert_eq!(config.runtime.bridge_network, "tools-net");
        assert_eq!(config.runtime.docker_bin, "docker");
    }

    #[test]
    fn test_env_overrides_file() {
        let env: HashMap<&str, &str> = [
            ("TOOLVAULT_MAX_CONCURRENT", "2"),
            ("TOOLVAULT_DB_URL", "mem://"),
        ]
        .into_iter()
        .collect();
        let mut config = VaultConfig::default();
        config
            .apply_env_from(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.engine.max_concurrent_executions, 2);
        assert_eq!(config.storage.url.as_deref(), Some("mem://"));
    }

    #[test]
    fn test_bad_env_value_is_config_error() {
        let mut config = VaultConfig::default();
        let err = config
            .apply_env_from(|k| (k == "TOOLVAULT_PLATFORM_RETRIES").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, VaultError::Config(_)));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut config = VaultConfig::default();
        config.engine.max_concurrent_executions = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = VaultConfig::from_file(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, VaultConfig::default());
    }
}
