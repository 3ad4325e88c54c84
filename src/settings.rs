use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::lease_timing::MAX_EXPONENT;
use crate::retry::RetryPolicy;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub lease: LeaseConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Where the shared work item documents live.
#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_backend")]
    pub backend: Backend,
    /// Filesystem path or object store URL. Ignored by the `memory` backend.
    #[serde(default = "default_store_path")]
    pub path: String,
    /// SlateDB memtable flush interval; SlateDB's default when unset.
    #[serde(default)]
    pub flush_interval_ms: Option<u64>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: default_store_path(),
            flush_interval_ms: None,
        }
    }
}

fn default_backend() -> Backend {
    Backend::Fs
}

fn default_store_path() -> String {
    "/tmp/shardlease-coordination".to_string()
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Process-local map, not shared with other workers.
    Memory,
    /// SlateDB on the local filesystem.
    Fs,
    /// SlateDB on an in-memory object store.
    SlateMemory,
    /// SlateDB on any object store URL it can resolve (s3://, gs://, ...).
    Url,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LeaseConfig {
    #[serde(default = "default_base_lease_ms")]
    pub base_lease_ms: u64,
    /// Renew once less than this fraction of the lease remains.
    #[serde(default = "default_renew_margin")]
    pub renew_margin: f64,
    #[serde(default = "default_scan_page_size")]
    pub scan_page_size: usize,
    /// Exponent newly seeded items start from. Zero pins them at the base
    /// lease, since the exponent can never drop below zero.
    #[serde(default = "default_initial_lease_exponent")]
    pub initial_lease_exponent: u32,
    #[serde(default)]
    pub store_retry: RetryPolicy,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            base_lease_ms: default_base_lease_ms(),
            renew_margin: default_renew_margin(),
            scan_page_size: default_scan_page_size(),
            initial_lease_exponent: default_initial_lease_exponent(),
            store_retry: RetryPolicy::default(),
        }
    }
}

impl LeaseConfig {
    pub fn base_lease(&self) -> Duration {
        Duration::from_millis(self.base_lease_ms)
    }
}

fn default_base_lease_ms() -> u64 {
    60_000
}

fn default_renew_margin() -> f64 {
    0.5
}

fn default_scan_page_size() -> usize {
    100
}

fn default_initial_lease_exponent() -> u32 {
    1
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Persist the cursor after this many sink batches.
    #[serde(default = "default_checkpoint_every_batches")]
    pub checkpoint_every_batches: usize,
    #[serde(default)]
    pub failure_log: FailureLogConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            checkpoint_every_batches: default_checkpoint_every_batches(),
            failure_log: FailureLogConfig::default(),
        }
    }
}

fn default_batch_size() -> usize {
    500
}

fn default_checkpoint_every_batches() -> usize {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct FailureLogConfig {
    /// Request/response bodies in failure logs are cut to this many characters.
    #[serde(default = "default_max_body_chars")]
    pub max_body_chars: usize,
    /// Emit one log line per failed document in addition to the batch summary.
    #[serde(default)]
    pub log_each_failure: bool,
}

impl Default for FailureLogConfig {
    fn default() -> Self {
        Self {
            max_body_chars: default_max_body_chars(),
            log_each_failure: false,
        }
    }
}

fn default_max_body_chars() -> usize {
    512
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    /// Sleep between scans when every remaining item is leased by someone else.
    #[serde(default = "default_idle_backoff_ms")]
    pub idle_backoff_ms: u64,
    /// Stop after this many consecutive cycles without claimable work.
    #[serde(default)]
    pub max_idle_cycles: Option<u32>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            idle_backoff_ms: default_idle_backoff_ms(),
            max_idle_cycles: None,
        }
    }
}

fn default_idle_backoff_ms() -> u64 {
    5_000
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let data = fs::read_to_string(p)?;
                Self::from_toml(&data)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn from_toml(data: &str) -> anyhow::Result<Self> {
        let cfg: Self = toml::from_str(data)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.lease.base_lease_ms == 0 {
            anyhow::bail!("lease.base_lease_ms must be greater than zero");
        }
        if !(0.0..1.0).contains(&self.lease.renew_margin) {
            anyhow::bail!("lease.renew_margin must be in [0, 1)");
        }
        if self.lease.scan_page_size == 0 {
            anyhow::bail!("lease.scan_page_size must be greater than zero");
        }
        if self.lease.initial_lease_exponent > MAX_EXPONENT {
            anyhow::bail!("lease.initial_lease_exponent must be at most {MAX_EXPONENT}");
        }
        if self.pipeline.batch_size == 0 {
            anyhow::bail!("pipeline.batch_size must be greater than zero");
        }
        if self.pipeline.checkpoint_every_batches == 0 {
            anyhow::bail!("pipeline.checkpoint_every_batches must be greater than zero");
        }
        Ok(())
    }
}
