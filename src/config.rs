//! TOML configuration.
//!
//! One [`Config`] is loaded at startup and handed to every component at
//! construction; no component reads paths or tunables from globals.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub vault: VaultConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub converter: ConverterConfig,
    #[serde(default)]
    pub ocr: OcrConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct VaultConfig {
    /// Everything the vault writes lives under this directory.
    pub root_path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Abort assembly when a page is missing instead of inserting a gap marker.
    #[serde(default = "default_true")]
    pub strict_page_policy: bool,
    /// Refuse to index documents that contain low-confidence pages.
    #[serde(default)]
    pub block_low_confidence: bool,
    #[serde(default = "default_low_confidence_threshold")]
    pub low_confidence_threshold: f32,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            retry_budget: default_retry_budget(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            strict_page_policy: true,
            block_low_confidence: false,
            low_confidence_threshold: default_low_confidence_threshold(),
            workers: default_workers(),
            lease_ttl_secs: default_lease_ttl_secs(),
        }
    }
}

fn default_retry_budget() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_backoff_max_ms() -> u64 {
    30_000
}
fn default_true() -> bool {
    true
}
fn default_low_confidence_threshold() -> f32 {
    0.6
}
fn default_workers() -> usize {
    4
}
fn default_lease_ttl_secs() -> u64 {
    900
}

/// Per-stage time budgets, in seconds.
#[derive(Debug, Deserialize, Clone)]
pub struct TimeoutConfig {
    #[serde(default = "default_fetch_secs")]
    pub fetch_secs: u64,
    #[serde(default = "default_convert_secs")]
    pub convert_secs: u64,
    #[serde(default = "default_ocr_secs")]
    pub ocr_secs: u64,
    #[serde(default = "default_index_secs")]
    pub index_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            fetch_secs: default_fetch_secs(),
            convert_secs: default_convert_secs(),
            ocr_secs: default_ocr_secs(),
            index_secs: default_index_secs(),
        }
    }
}

fn default_fetch_secs() -> u64 {
    60
}
fn default_convert_secs() -> u64 {
    300
}
fn default_ocr_secs() -> u64 {
    120
}
fn default_index_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct FetchConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            max_bytes: default_max_bytes(),
        }
    }
}

fn default_user_agent() -> String {
    format!("custody-vault/{}", env!("CARGO_PKG_VERSION"))
}
fn default_max_bytes() -> u64 {
    256 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConverterConfig {
    #[serde(default = "default_pdftoppm")]
    pub pdftoppm: String,
    #[serde(default = "default_dpi")]
    pub dpi: u32,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            pdftoppm: default_pdftoppm(),
            dpi: default_dpi(),
        }
    }
}

fn default_pdftoppm() -> String {
    "pdftoppm".to_string()
}
fn default_dpi() -> u32 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct OcrConfig {
    #[serde(default = "default_tesseract")]
    pub tesseract: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_psm")]
    pub psm: u8,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            tesseract: default_tesseract(),
            language: default_language(),
            psm: default_psm(),
        }
    }
}

fn default_tesseract() -> String {
    "tesseract".to_string()
}
fn default_language() -> String {
    "eng".to_string()
}
fn default_psm() -> u8 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive; `RUST_LOG` wins when set.
    #[serde(default = "default_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
        }
    }
}

fn default_filter() -> String {
    "info".to_string()
}

impl Config {
    /// Config rooted at `root` with every other option defaulted.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            vault: VaultConfig {
                root_path: root.into(),
            },
            pipeline: PipelineConfig::default(),
            timeouts: TimeoutConfig::default(),
            fetch: FetchConfig::default(),
            converter: ConverterConfig::default(),
            ocr: OcrConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    pub fn objects_dir(&self) -> PathBuf {
        self.vault.root_path.join("objects")
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.vault.root_path.join("ledger.sqlite")
    }

    pub fn index_path(&self) -> PathBuf {
        self.vault.root_path.join("index.sqlite")
    }
}

impl PipelineConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.vault.root_path.as_os_str().is_empty() {
        anyhow::bail!("vault.root_path must not be empty");
    }

    let p = &config.pipeline;
    if p.retry_budget == 0 {
        anyhow::bail!("pipeline.retry_budget must be >= 1");
    }
    if p.workers == 0 {
        anyhow::bail!("pipeline.workers must be >= 1");
    }
    if !(0.0..=1.0).contains(&p.low_confidence_threshold) {
        anyhow::bail!("pipeline.low_confidence_threshold must be in [0.0, 1.0]");
    }
    if p.backoff_max_ms < p.backoff_base_ms {
        anyhow::bail!("pipeline.backoff_max_ms must be >= pipeline.backoff_base_ms");
    }

    if !(72..=1200).contains(&config.converter.dpi) {
        anyhow::bail!("converter.dpi must be in 72..=1200");
    }
    if config.converter.pdftoppm.trim().is_empty() {
        anyhow::bail!("converter.pdftoppm must name a binary");
    }
    if config.ocr.tesseract.trim().is_empty() {
        anyhow::bail!("ocr.tesseract must name a binary");
    }
    if config.fetch.max_bytes == 0 {
        anyhow::bail!("fetch.max_bytes must be > 0");
    }

    Ok(())
}
