// src/config.rs
//
// Pipeline configuration: TOML file + env overrides, with sane defaults so
// the service boots in fixture mode with no file at all.
//
// Resolution order for the file:
// 1) $ENA_CONFIG_PATH
// 2) config/pipeline.toml
// 3) built-in defaults (all four sources, fixture mode)

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::{env, fs};

use crate::model::SourceKind;

const ENV_CONFIG_PATH: &str = "ENA_CONFIG_PATH";
const ENV_DATA_DIR: &str = "ENA_DATA_DIR";
const ENV_BIND_ADDR: &str = "ENA_BIND_ADDR";

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_bind_addr() -> String {
    "0.0.0.0:8000".to_string()
}
fn default_true() -> bool {
    true
}
fn default_cadence_secs() -> u64 {
    3600
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_page_limit() -> u32 {
    10
}
fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_malformed_threshold() -> f64 {
    0.10
}
fn default_analysis_poll_secs() -> u64 {
    300
}
fn default_analysis_grace_secs() -> u64 {
    21_600
}
fn default_narrative_api_key() -> String {
    "ENV".to_string()
}
fn default_narrative_model() -> String {
    "claude-sonnet-4-5".to_string()
}
fn default_narrative_max_tokens() -> u32 {
    1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Artifacts and the ledger database live under this directory.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Fraction of malformed rows tolerated before a batch is rejected
    /// as schema drift. Inclusive bound; 0.10 means "up to 10%".
    #[serde(default = "default_malformed_threshold")]
    pub malformed_row_threshold: f64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        ValidationConfig {
            malformed_row_threshold: default_malformed_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// How often the scheduler checks for a closed period.
    #[serde(default = "default_analysis_poll_secs")]
    pub poll_secs: u64,
    /// After a period closes, how long to wait for missing coverage
    /// before publishing a partial report anyway.
    #[serde(default = "default_analysis_grace_secs")]
    pub grace_secs: u64,
    #[serde(default)]
    pub narrative: NarrativeConfig,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        AnalysisConfig {
            poll_secs: default_analysis_poll_secs(),
            grace_secs: default_analysis_grace_secs(),
            narrative: NarrativeConfig::default(),
        }
    }
}

/// External narrative service. Mirrors the source adapters: disabled or
/// missing `base_url` keeps report generation quantitative-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NarrativeConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_narrative_model")]
    pub model: String,
    /// "ENV" means: read the key from $NARRATIVE_API_KEY at client build time.
    #[serde(default = "default_narrative_api_key")]
    pub api_key: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_narrative_max_tokens")]
    pub max_tokens: u32,
}

impl Default for NarrativeConfig {
    fn default() -> Self {
        NarrativeConfig {
            enabled: false,
            base_url: None,
            model: default_narrative_model(),
            api_key: default_narrative_api_key(),
            timeout_secs: default_timeout_secs(),
            max_tokens: default_narrative_max_tokens(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    pub kind: SourceKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cadence_secs")]
    pub cadence_secs: u64,
    /// HTTP endpoint; `None` runs the adapter in fixture mode.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Name of the env var holding the API key, if the endpoint needs one.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Pagination budget per run; exceeding it truncates the batch.
    #[serde(default = "default_page_limit")]
    pub page_limit: u32,
    /// Minimum gap between consecutive page requests.
    #[serde(default)]
    pub min_request_gap_ms: u64,
    /// Market/weather: regions to query.
    #[serde(default)]
    pub regions: Vec<String>,
    /// Economic: indicator ids to query.
    #[serde(default)]
    pub indicators: Vec<String>,
    /// News: feed URLs (fixture mode uses built-in samples).
    #[serde(default)]
    pub feeds: Vec<String>,
}

impl PipelineConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.as_ref().display()))?;
        let cfg: PipelineConfig = toml::from_str(&data)
            .with_context(|| format!("parsing config {}", path.as_ref().display()))?;
        cfg.finalize()
    }

    /// Env-path first, then `config/pipeline.toml`, then built-in defaults.
    pub fn load_default() -> Result<Self> {
        if let Ok(p) = env::var(ENV_CONFIG_PATH) {
            let pb = PathBuf::from(p);
            if pb.exists() {
                return Self::load_from_file(&pb);
            }
            return Err(anyhow!("{ENV_CONFIG_PATH} points to non-existent path"));
        }
        let default_p = PathBuf::from("config/pipeline.toml");
        if default_p.exists() {
            return Self::load_from_file(&default_p);
        }
        PipelineConfig::builtin_defaults().finalize()
    }

    /// All four sources, fixture mode, hourly cadence.
    pub fn builtin_defaults() -> Self {
        let source = |id: &str, kind: SourceKind| SourceConfig {
            id: id.to_string(),
            kind,
            enabled: true,
            cadence_secs: default_cadence_secs(),
            base_url: None,
            api_key_env: None,
            timeout_secs: default_timeout_secs(),
            page_limit: default_page_limit(),
            min_request_gap_ms: 0,
            regions: Vec::new(),
            indicators: Vec::new(),
            feeds: Vec::new(),
        };
        PipelineConfig {
            data_dir: default_data_dir(),
            bind_addr: default_bind_addr(),
            retry: RetryConfig::default(),
            validation: ValidationConfig::default(),
            analysis: AnalysisConfig::default(),
            sources: vec![
                source("market", SourceKind::Market),
                source("weather", SourceKind::Weather),
                source("economic", SourceKind::Economic),
                source("news", SourceKind::News),
            ],
        }
    }

    /// Apply env overrides and sanitize. Rejects configs the scheduler
    /// cannot run (duplicate ids, zero attempts, zero cadence).
    fn finalize(mut self) -> Result<Self> {
        if let Ok(dir) = env::var(ENV_DATA_DIR) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Ok(addr) = env::var(ENV_BIND_ADDR) {
            self.bind_addr = addr;
        }

        let mut seen = HashSet::new();
        for s in &self.sources {
            if s.id.trim().is_empty() {
                return Err(anyhow!("source with empty id"));
            }
            if !seen.insert(s.id.clone()) {
                return Err(anyhow!("duplicate source id: {}", s.id));
            }
            if s.cadence_secs == 0 {
                return Err(anyhow!("source {} has zero cadence", s.id));
            }
            if s.page_limit == 0 {
                return Err(anyhow!("source {} has zero page limit", s.id));
            }
        }

        if self.retry.max_attempts == 0 {
            return Err(anyhow!("retry.max_attempts must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.validation.malformed_row_threshold) {
            self.validation.malformed_row_threshold = default_malformed_threshold();
        }
        if self.analysis.poll_secs == 0 {
            self.analysis.poll_secs = default_analysis_poll_secs();
        }
        Ok(self)
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join("ledger.db")
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.data_dir.join("artifacts")
    }

    /// Enabled sources only; the scheduler and coverage both use this view.
    pub fn enabled_sources(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

impl NarrativeConfig {
    /// Resolve the "ENV" sentinel. Missing key with `enabled = true` is a
    /// config error; a disabled narrative never reads the env.
    pub fn resolved_api_key(&self) -> Result<Option<String>> {
        if !self.enabled {
            return Ok(None);
        }
        if self.api_key.trim().eq_ignore_ascii_case("env") {
            let key = env::var("NARRATIVE_API_KEY")
                .map_err(|_| anyhow!("Missing NARRATIVE_API_KEY env var"))?;
            return Ok(Some(key));
        }
        Ok(Some(self.api_key.clone()))
    }
}
