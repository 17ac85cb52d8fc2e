use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use pulse_adapters::{AdapterError, BackoffPolicy, LlmClientConfig};
use pulse_core::Platform;
use serde::Deserialize;

use crate::prompts::PromptTuning;
use crate::sample::{DEFAULT_MIN_PER_BUCKET, DEFAULT_TARGET_SIZE};

pub const DEFAULT_CONFIG_PATH: &str = "pulse.yaml";

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,
    pub app: AppConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub sampling: SamplingConfig,
    pub llm: LlmConfig,
    #[serde(default)]
    pub email: EmailConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub name: String,
    #[serde(default)]
    pub ios_app_id: Option<String>,
    #[serde(default)]
    pub android_package: Option<String>,
}

impl AppConfig {
    /// Store identifier fixture bundles for `platform` must carry.
    pub fn store_id(&self, platform: Platform) -> Option<&str> {
        match platform {
            Platform::Ios => self.ios_app_id.as_deref(),
            Platform::Android => self.android_package.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub platform: Platform,
    /// Captured scraper export; relative paths resolve against the config file.
    pub path: PathBuf,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SamplingConfig {
    #[serde(default = "default_target_size")]
    pub target_size: usize,
    #[serde(default = "default_min_per_bucket")]
    pub min_per_bucket: usize,
    /// Ingestion order across platforms; the deduplicator keeps the first seen.
    #[serde(default = "default_precedence")]
    pub platform_precedence: Vec<Platform>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            target_size: default_target_size(),
            min_per_bucket: default_min_per_bucket(),
            platform_precedence: default_precedence(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    pub model: String,
    #[serde(default = "default_api_key_env_var")]
    pub api_key_env_var: String,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_llm_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmailConfig {
    #[serde(default)]
    pub recipient: Option<String>,
    #[serde(default = "default_sender")]
    pub sender: String,
    /// Spool directory for outgoing `.eml` files; relative to `data_root`.
    #[serde(default = "default_outbox_dir")]
    pub outbox_dir: PathBuf,
    #[serde(default)]
    pub draft_only: bool,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            recipient: None,
            sender: default_sender(),
            outbox_dir: default_outbox_dir(),
            draft_only: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    /// Six-field cron expression (seconds first), UTC.
    #[serde(default = "default_cron")]
    pub cron: String,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            cron: default_cron(),
        }
    }
}

fn default_data_root() -> PathBuf {
    PathBuf::from("./data")
}
fn default_true() -> bool {
    true
}
fn default_target_size() -> usize {
    DEFAULT_TARGET_SIZE
}
fn default_min_per_bucket() -> usize {
    DEFAULT_MIN_PER_BUCKET
}
fn default_precedence() -> Vec<Platform> {
    vec![Platform::Ios, Platform::Android]
}
fn default_llm_base_url() -> String {
    "https://api.groq.com/openai/v1".to_string()
}
fn default_api_key_env_var() -> String {
    "GROQ_API_KEY".to_string()
}
fn default_llm_timeout_secs() -> u64 {
    60
}
fn default_llm_max_retries() -> usize {
    2
}
fn default_temperature() -> f32 {
    0.2
}
fn default_max_tokens() -> u32 {
    2048
}
fn default_sender() -> String {
    "pulse@localhost".to_string()
}
fn default_outbox_dir() -> PathBuf {
    PathBuf::from("outbox")
}
fn default_cron() -> String {
    "0 0 7 * * Mon".to_string()
}

impl PipelineConfig {
    pub fn from_yaml_str(text: &str, base_dir: &Path) -> Result<Self> {
        let mut config: PipelineConfig =
            serde_yaml::from_str(text).context("parsing pipeline config yaml")?;
        for source in &mut config.sources {
            if source.path.is_relative() {
                source.path = base_dir.join(&source.path);
            }
        }
        Ok(config)
    }

    /// Read and parse `path` without validating; see [`Self::load_with_overrides`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading pipeline config {}", path.display()))?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_yaml_str(&text, base_dir).with_context(|| format!("loading {}", path.display()))
    }

    /// Load `path`, apply overrides from `lookup`, then validate the result.
    pub fn load_with_overrides(
        path: impl AsRef<Path>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let path = path.as_ref();
        let mut config = Self::load(path)?;
        config.apply_overrides(lookup);
        config
            .validate()
            .with_context(|| format!("validating {}", path.display()))?;
        Ok(config)
    }

    /// Load `PULSE_CONFIG` (default `pulse.yaml`) with environment overrides.
    pub fn from_env() -> Result<Self> {
        let path = std::env::var("PULSE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_with_overrides(&path, |key| std::env::var(key).ok())
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(root) = lookup("PULSE_DATA_ROOT").filter(|v| !v.trim().is_empty()) {
            self.data_root = PathBuf::from(root);
        }
        if let Some(recipient) = lookup("PULSE_EMAIL_RECIPIENT").filter(|v| !v.trim().is_empty()) {
            self.email.recipient = Some(recipient);
        }
        if let Some(flag) = lookup("PULSE_DRAFT_ONLY") {
            self.email.draft_only = matches!(flag.as_str(), "1" | "true" | "TRUE" | "True");
        }
    }

    /// Collect every problem before failing so misconfiguration surfaces at startup.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        if self.app.name.trim().is_empty() {
            problems.push("app.name is empty".to_string());
        }
        if !self.sources.iter().any(|s| s.enabled) {
            problems.push("no enabled sources".to_string());
        }
        if self.sampling.target_size == 0 {
            problems.push("sampling.target_size must be positive".to_string());
        }
        for platform in [Platform::Ios, Platform::Android] {
            if self.sources.iter().any(|s| s.platform == platform)
                && !self.sampling.platform_precedence.contains(&platform)
            {
                problems.push(format!("sampling.platform_precedence is missing `{platform}`"));
            }
        }
        if self.llm.model.trim().is_empty() {
            problems.push("llm.model is empty".to_string());
        }
        if self.llm.base_url.trim().is_empty() {
            problems.push("llm.base_url is empty".to_string());
        }
        if self.llm.api_key_env_var.trim().is_empty() {
            problems.push("llm.api_key_env_var is empty".to_string());
        }
        if let Some(recipient) = &self.email.recipient {
            if !recipient.contains('@') {
                problems.push(format!("email.recipient `{recipient}` is not an address"));
            }
        }
        if self.schedule.cron.split_whitespace().count() != 6 {
            problems.push(format!(
                "schedule.cron `{}` must have six fields (sec min hour dom mon dow)",
                self.schedule.cron
            ));
        }
        if !problems.is_empty() {
            bail!("pipeline config is invalid:\n  - {}", problems.join("\n  - "));
        }
        Ok(())
    }

    /// Enabled sources, ordered by platform precedence (stable within a platform).
    pub fn ordered_sources(&self) -> Vec<&SourceConfig> {
        let mut sources: Vec<_> = self.sources.iter().filter(|s| s.enabled).collect();
        sources.sort_by_key(|s| {
            self.sampling
                .platform_precedence
                .iter()
                .position(|p| *p == s.platform)
                .unwrap_or(usize::MAX)
        });
        sources
    }

    pub fn outbox_dir(&self) -> PathBuf {
        if self.email.outbox_dir.is_absolute() {
            self.email.outbox_dir.clone()
        } else {
            self.data_root.join(&self.email.outbox_dir)
        }
    }

    pub fn prompt_tuning(&self) -> PromptTuning {
        PromptTuning {
            temperature: self.llm.temperature,
            max_tokens: self.llm.max_tokens,
        }
    }

    pub fn llm_client_config(&self) -> Result<LlmClientConfig, AdapterError> {
        let api_key = std::env::var(&self.llm.api_key_env_var)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| AdapterError::MissingCredential(self.llm.api_key_env_var.clone()))?;
        Ok(LlmClientConfig {
            base_url: self.llm.base_url.clone(),
            api_key,
            model: self.llm.model.clone(),
            timeout: Duration::from_secs(self.llm.timeout_secs),
            backoff: BackoffPolicy {
                max_retries: self.llm.max_retries,
                ..BackoffPolicy::default()
            },
        })
    }
}
