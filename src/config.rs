//! Layered configuration for testsmith.
//!
//! Settings are read from `testsmith.toml`, then overridden by environment
//! variables, then by CLI flags. A missing file yields the defaults.
//!
//! # Configuration File Format
//!
//! ```toml
//! [queue]
//! max_concurrent = 2
//! average_run_seconds = 120
//!
//! [healing]
//! enabled = true
//! max_attempts = 3
//! failure_sample = 3
//!
//! [execution]
//! runs_dir = "/tmp/testsmith_runs"
//! python = "python3"
//! allow_headed = true
//!
//! [llm]
//! endpoint = "http://localhost:11434"
//! timeout_secs = 120
//!
//! [llm.models]
//! story = ["qwen2.5:14b", "qwen2.5:7b"]
//! code = ["qwen2.5-coder:14b", "qwen2.5:7b"]
//!
//! [store]
//! path = ".testsmith/runs.db"
//!
//! [logging]
//! level = "info"
//! json = false
//!
//! [presets.deep]
//! depth = 3
//! timeout_secs = 900
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::pipeline::PipelineSettings;
use crate::pipeline::models::{Preset, PresetLimits};
use crate::services::llm::ModelTask;

pub const CONFIG_FILE_NAME: &str = "testsmith.toml";

/// Above this many concurrent runs a local browser host tends to thrash.
const RECOMMENDED_MAX_CONCURRENT: usize = 3;

// ── Sections ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueSection {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_average_run_seconds")]
    pub average_run_seconds: u64,
}

fn default_max_concurrent() -> usize {
    2
}

fn default_average_run_seconds() -> u64 {
    120
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            average_run_seconds: default_average_run_seconds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealingSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Failing tests shown to the fix collaborator per attempt.
    #[serde(default = "default_failure_sample")]
    pub failure_sample: usize,
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    3
}

fn default_failure_sample() -> usize {
    3
}

impl Default for HealingSection {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: default_max_attempts(),
            failure_sample: default_failure_sample(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionSection {
    #[serde(default = "default_runs_dir")]
    pub runs_dir: PathBuf,
    #[serde(default = "default_python")]
    pub python: String,
    /// When false, headed requests run headless.
    #[serde(default = "default_true")]
    pub allow_headed: bool,
}

fn default_runs_dir() -> PathBuf {
    std::env::temp_dir().join("testsmith_runs")
}

fn default_python() -> String {
    "python3".to_string()
}

impl Default for ExecutionSection {
    fn default() -> Self {
        Self {
            runs_dir: default_runs_dir(),
            python: default_python(),
            allow_headed: true,
        }
    }
}

/// Ordered fallback model lists, one per generation task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelsSection {
    #[serde(default = "default_story_models")]
    pub story: Vec<String>,
    #[serde(default = "default_scenario_models")]
    pub scenarios: Vec<String>,
    #[serde(default = "default_code_models")]
    pub code: Vec<String>,
    #[serde(default = "default_healing_models")]
    pub healing: Vec<String>,
}

fn models(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

fn default_story_models() -> Vec<String> {
    models(&["qwen2.5:14b", "qwen2.5:7b", "deepseek-r1:14b"])
}

fn default_scenario_models() -> Vec<String> {
    models(&["qwen2.5:14b", "qwen2.5:7b"])
}

fn default_code_models() -> Vec<String> {
    models(&["qwen2.5-coder:14b", "qwen2.5:7b"])
}

fn default_healing_models() -> Vec<String> {
    models(&["qwen2.5-coder:14b", "qwen2.5:14b"])
}

impl Default for ModelsSection {
    fn default() -> Self {
        Self {
            story: default_story_models(),
            scenarios: default_scenario_models(),
            code: default_code_models(),
            healing: default_healing_models(),
        }
    }
}

impl ModelsSection {
    pub fn for_task(&self, task: ModelTask) -> &[String] {
        match task {
            ModelTask::Story => &self.story,
            ModelTask::Scenarios => &self.scenarios,
            ModelTask::Code => &self.code,
            ModelTask::Healing => &self.healing,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmSection {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub models: ModelsSection,
}

fn default_endpoint() -> String {
    "http://localhost:11434".to_string()
}

fn default_llm_timeout() -> u64 {
    120
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            timeout_secs: default_llm_timeout(),
            models: ModelsSection::default(),
        }
    }
}

impl LlmSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreSection {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

fn default_store_path() -> PathBuf {
    PathBuf::from(".testsmith").join("runs.db")
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    /// Directory for a daily-rolling log file. Unset means stderr only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            directory: None,
        }
    }
}

/// Partial override of a preset's built-in limits.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PresetOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depth: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl PresetOverride {
    fn apply(&self, mut limits: PresetLimits) -> PresetLimits {
        if let Some(depth) = self.depth {
            limits.depth = depth;
        }
        if let Some(page_limit) = self.page_limit {
            limits.page_limit = page_limit;
        }
        if let Some(timeout) = self.timeout_secs {
            limits.timeout_secs = timeout;
        }
        limits
    }
}

// ── Settings ─────────────────────────────────────────────────────────

/// The complete testsmith.toml structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Settings {
    #[serde(default)]
    pub queue: QueueSection,
    #[serde(default)]
    pub healing: HealingSection,
    #[serde(default)]
    pub execution: ExecutionSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub presets: BTreeMap<String, PresetOverride>,
}

impl Settings {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse testsmith.toml")
    }

    /// Returns default configuration if the file doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// `./testsmith.toml` if present, else the user config directory's copy,
    /// else `./testsmith.toml` (which may not exist).
    pub fn default_path() -> PathBuf {
        let local = PathBuf::from(CONFIG_FILE_NAME);
        if local.exists() {
            return local;
        }
        if let Some(user) = dirs::config_dir().map(|d| d.join("testsmith").join(CONFIG_FILE_NAME))
            && user.exists()
        {
            return user;
        }
        local
    }

    /// Resolve the file, load it, and apply environment overrides.
    pub fn resolve(explicit: Option<&Path>) -> Result<(Self, PathBuf)> {
        let path = match explicit {
            Some(p) => p.to_path_buf(),
            None => Self::default_path(),
        };
        let mut settings = if explicit.is_some() {
            Self::load(&path)?
        } else {
            Self::load_or_default(&path)?
        };
        settings.apply_env()?;
        Ok((settings, path))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(path, self.to_toml()?)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize testsmith.toml")
    }

    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("TESTSMITH_MAX_CONCURRENT") {
            self.queue.max_concurrent = v
                .trim()
                .parse()
                .with_context(|| format!("Invalid TESTSMITH_MAX_CONCURRENT '{}'", v))?;
        }
        if let Some(v) = lookup("TESTSMITH_MAX_HEAL_ATTEMPTS") {
            self.healing.max_attempts = v
                .trim()
                .parse()
                .with_context(|| format!("Invalid TESTSMITH_MAX_HEAL_ATTEMPTS '{}'", v))?;
        }
        if let Some(v) = lookup("TESTSMITH_RUNS_DIR") {
            self.execution.runs_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("OLLAMA_HTTP") {
            self.llm.endpoint = v;
        }
        if let Some(v) = lookup("TESTSMITH_DB") {
            self.store.path = PathBuf::from(v);
        }
        if let Some(v) = lookup("TESTSMITH_JSON_LOGS") {
            self.logging.json = matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes");
        }
        Ok(())
    }

    /// Errors for settings that cannot run; warnings for ones that can.
    pub fn validate(&self) -> Result<Vec<String>> {
        if self.queue.max_concurrent == 0 {
            anyhow::bail!("queue.max_concurrent must be at least 1");
        }
        if self.llm.endpoint.trim().is_empty() {
            anyhow::bail!("llm.endpoint must not be empty");
        }
        for task in ModelTask::ALL {
            if self.llm.models.for_task(task).is_empty() {
                anyhow::bail!("llm.models.{} must list at least one model", task.as_str());
            }
        }

        let mut warnings = Vec::new();
        if self.queue.max_concurrent > RECOMMENDED_MAX_CONCURRENT {
            warnings.push(format!(
                "queue.max_concurrent = {} exceeds the recommended {}; browser runs may contend for resources",
                self.queue.max_concurrent, RECOMMENDED_MAX_CONCURRENT
            ));
        }
        if self.healing.failure_sample == 0 {
            warnings.push("healing.failure_sample = 0; fixes will be requested without failures".into());
        }
        for name in self.presets.keys() {
            if name.parse::<Preset>().is_err() {
                warnings.push(format!(
                    "Unknown preset '{}' (expected quick, balanced or deep)",
                    name
                ));
            }
        }
        Ok(warnings)
    }

    /// Preset limits with file overrides applied over the built-ins.
    pub fn presets(&self) -> HashMap<Preset, PresetLimits> {
        [Preset::Quick, Preset::Balanced, Preset::Deep]
            .into_iter()
            .map(|preset| {
                let limits = match self.presets.get(preset.as_str()) {
                    Some(over) => over.apply(preset.default_limits()),
                    None => preset.default_limits(),
                };
                (preset, limits)
            })
            .collect()
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            runs_dir: self.execution.runs_dir.clone(),
            presets: self.presets(),
            failure_sample: self.healing.failure_sample,
            allow_headed: self.execution.allow_headed,
        }
    }

    pub fn average_run(&self) -> Duration {
        Duration::from_secs(self.queue.average_run_seconds)
    }
}
