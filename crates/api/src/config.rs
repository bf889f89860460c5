use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use courier_ingest::CommitPolicy;
use serde::{Deserialize, Serialize};

pub const DEFAULT_LOG_PATH: &str = "courier.log";
pub const DEFAULT_RESULT_PATH: &str = "dispatch.txt";
pub const DEFAULT_SINK_TIMEOUT_MS: u64 = 5_000;

/// Runtime configuration. Paths are not checked here; a bad path fails at first write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourierConfig {
    pub log_path: PathBuf,
    pub result_path: PathBuf,
    pub sink_timeout: Duration,
    pub commit_policy: CommitPolicy,
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self {
            log_path: PathBuf::from(DEFAULT_LOG_PATH),
            result_path: PathBuf::from(DEFAULT_RESULT_PATH),
            sink_timeout: Duration::from_millis(DEFAULT_SINK_TIMEOUT_MS),
            commit_policy: CommitPolicy::default(),
        }
    }
}

impl CourierConfig {
    /// Read `COURIER_*` variables, falling back to defaults for unset ones.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable variable source.
    pub fn from_lookup<F>(get: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        if let Some(p) = get("COURIER_LOG_PATH") { cfg.log_path = PathBuf::from(p); }
        if let Some(p) = get("COURIER_RESULT_PATH") { cfg.result_path = PathBuf::from(p); }
        if let Some(ms) = get("COURIER_SINK_TIMEOUT_MS") {
            let ms: u64 = ms.trim().parse().with_context(|| format!("parsing COURIER_SINK_TIMEOUT_MS={}", ms))?;
            if ms == 0 {
                return Err(anyhow!("COURIER_SINK_TIMEOUT_MS must be greater than zero"));
            }
            cfg.sink_timeout = Duration::from_millis(ms);
        }
        if let Some(p) = get("COURIER_COMMIT") {
            cfg.commit_policy = p.parse().map_err(|e: String| anyhow!(e)).context("parsing COURIER_COMMIT")?;
        }
        Ok(cfg)
    }
}
