use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Opaque run identifier, assigned at enqueue time.
pub type RunId = String;

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

// ── Enumerations ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Headless,
    Headed,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Headless => "headless",
            Self::Headed => "headed",
        }
    }

    pub fn is_headed(&self) -> bool {
        matches!(self, Self::Headed)
    }
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "headless" => Ok(Self::Headless),
            "headed" => Ok(Self::Headed),
            _ => Err(format!("Invalid execution mode: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Preset {
    Quick,
    #[default]
    Balanced,
    Deep,
}

impl Preset {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Quick => "quick",
            Self::Balanced => "balanced",
            Self::Deep => "deep",
        }
    }

    /// Built-in crawl and execution limits for the preset.
    pub fn default_limits(&self) -> PresetLimits {
        match self {
            Self::Quick => PresetLimits {
                depth: 1,
                page_limit: 5,
                timeout_secs: 180,
            },
            Self::Balanced => PresetLimits {
                depth: 1,
                page_limit: 15,
                timeout_secs: 300,
            },
            Self::Deep => PresetLimits {
                depth: 2,
                page_limit: 30,
                timeout_secs: 600,
            },
        }
    }
}

impl FromStr for Preset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "quick" => Ok(Self::Quick),
            "balanced" => Ok(Self::Balanced),
            "deep" => Ok(Self::Deep),
            _ => Err(format!("Invalid preset: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresetLimits {
    pub depth: u32,
    pub page_limit: u32,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StorySource {
    UserProvided,
    AiGenerated,
    Fallback,
}

impl StorySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserProvided => "user_provided",
            Self::AiGenerated => "ai_generated",
            Self::Fallback => "fallback",
        }
    }
}

// ── Run input ────────────────────────────────────────────────────────

/// What a caller asks the queue to run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRequest {
    pub url: String,
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default)]
    pub preset: Preset,
    #[serde(default)]
    pub story: Option<String>,
    pub auto_heal: bool,
    pub max_heal_attempts: u32,
}

impl RunRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            mode: ExecutionMode::default(),
            preset: Preset::default(),
            story: None,
            auto_heal: true,
            max_heal_attempts: 3,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        let url = self.url.trim();
        if url.is_empty() {
            return Err("target URL is empty".to_string());
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(format!("target URL must be http(s): {}", url));
        }
        Ok(())
    }
}

// ── Phase data ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ElementDescriptor {
    pub tag: String,
    pub selector: String,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscoveredPage {
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub elements: Vec<ElementDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DiscoveryOutput {
    pub pages: Vec<DiscoveredPage>,
}

impl DiscoveryOutput {
    /// Single bare entry for the target, used when discovery degrades.
    pub fn fallback(url: &str) -> Self {
        Self {
            pages: vec![DiscoveredPage {
                url: url.to_string(),
                title: None,
                elements: Vec::new(),
            }],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn element_count(&self) -> usize {
        self.pages.iter().map(|p| p.elements.len()).sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Scenario {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default)]
    pub validations: Vec<String>,
}

impl Scenario {
    /// The conservative "page loads" scenario.
    pub fn fallback(url: &str) -> Self {
        Self {
            id: "fallback_1".to_string(),
            name: "Basic Page Load Test".to_string(),
            steps: vec![format!("Navigate to {}", url), "Verify page loads".to_string()],
            validations: vec!["Page loads successfully".to_string()],
        }
    }
}

/// One generated test file. `sha256` identifies the content that was written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestArtifact {
    pub scenario_id: String,
    /// Path relative to the suite directory.
    pub file: PathBuf,
    pub sha256: String,
    pub bytes: usize,
    /// True when the deterministic template was written instead of model output.
    #[serde(default)]
    pub fallback: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneratedSuite {
    pub dir: PathBuf,
    pub artifacts: Vec<TestArtifact>,
}

impl GeneratedSuite {
    pub fn path_of(&self, artifact: &TestArtifact) -> PathBuf {
        self.dir.join(&artifact.file)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TestOutcome {
    Passed,
    Failed,
    Skipped,
    Error,
}

impl TestOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Error => "error",
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Error)
    }
}

impl FromStr for TestOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "passed" | "xpassed" => Ok(Self::Passed),
            "failed" => Ok(Self::Failed),
            "skipped" | "xfailed" => Ok(Self::Skipped),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid test outcome: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestRecord {
    /// Harness node id, e.g. `tests/test_login.py::test_login`.
    pub node_id: String,
    pub outcome: TestOutcome,
    #[serde(default)]
    pub message: Option<String>,
}

impl TestRecord {
    /// File name of the artifact this test lives in.
    pub fn artifact_file(&self) -> Option<PathBuf> {
        let file_part = self.node_id.split("::").next()?;
        Path::new(file_part).file_name().map(PathBuf::from)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ExecutionSummary {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ExecutionOutcome {
    pub summary: ExecutionSummary,
    #[serde(default)]
    pub tests: Vec<TestRecord>,
    #[serde(default)]
    pub duration_secs: f64,
}

impl ExecutionOutcome {
    pub fn failing(&self) -> Vec<&TestRecord> {
        self.tests.iter().filter(|t| t.outcome.is_failure()).collect()
    }

    /// Failure count as reported by the harness summary.
    pub fn failed_count(&self) -> u32 {
        self.summary.failed
    }
}

// ── Healing data ─────────────────────────────────────────────────────

/// A proposed replacement for one test artifact. Lives for one attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Suggestion {
    /// Artifact path relative to the suite directory.
    pub target: PathBuf,
    pub replacement: String,
    pub issue: String,
    /// Confidence in [0, 1].
    pub confidence: f64,
}

impl Suggestion {
    pub fn new(
        target: impl Into<PathBuf>,
        replacement: impl Into<String>,
        issue: impl Into<String>,
        confidence: f64,
    ) -> Self {
        let confidence = if confidence.is_nan() {
            0.0
        } else {
            confidence.clamp(0.0, 1.0)
        };
        Self {
            target: target.into(),
            replacement: replacement.into(),
            issue: issue.into(),
            confidence,
        }
    }
}

/// The part of a suggestion kept in the attempt record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SuggestionSummary {
    pub target: PathBuf,
    pub issue: String,
    pub confidence: f64,
}

impl From<&Suggestion> for SuggestionSummary {
    fn from(s: &Suggestion) -> Self {
        Self {
            target: s.target.clone(),
            issue: s.issue.clone(),
            confidence: s.confidence,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum PatchOutcome {
    Applied,
    /// Validation failed; the snapshot was restored before anything ran.
    Rejected { reason: String },
    /// Writing the patch failed part-way; the snapshot was restored.
    RolledBack { reason: String },
}

impl PatchOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealingAttempt {
    /// 1-based attempt number.
    pub attempt: u32,
    pub suggestion: SuggestionSummary,
    pub patch: PatchOutcome,
    /// Re-run summary; absent when the patch never reached execution.
    #[serde(default)]
    pub rerun: Option<ExecutionSummary>,
    pub started_at: String,
}

// ── Queue views ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueTicket {
    pub run_id: RunId,
    /// 1-based position among waiting runs.
    pub position: usize,
    pub estimated_wait_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueSnapshot {
    pub max_concurrent: usize,
    pub active_count: usize,
    pub queued_count: usize,
    pub dispatcher_running: bool,
    pub active_run_ids: Vec<RunId>,
}

// ── Run Context ──────────────────────────────────────────────────────

/// The record threaded through one run's lifecycle.
///
/// Owned by exactly one writer at a time: the queue while the run waits,
/// then the pipeline executing it. Status changes go through
/// [`RunContext::transition`], which refuses to leave a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunContext {
    pub run_id: RunId,
    pub request: RunRequest,

    pub status: RunStatus,
    pub phase: String,
    #[serde(default)]
    pub error_message: Option<String>,

    #[serde(default)]
    pub discovery: Option<DiscoveryOutput>,
    #[serde(default)]
    pub story: Option<String>,
    #[serde(default)]
    pub story_source: Option<StorySource>,
    #[serde(default)]
    pub scenarios: Vec<Scenario>,
    #[serde(default)]
    pub suite: Option<GeneratedSuite>,
    #[serde(default)]
    pub execution: Option<ExecutionOutcome>,

    pub healing_attempts: u32,
    pub is_healed: bool,
    #[serde(default)]
    pub healing_log: Vec<HealingAttempt>,

    pub created_at: String,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub finished_at: Option<String>,
}

impl RunContext {
    pub fn new(run_id: impl Into<RunId>, request: RunRequest) -> Self {
        Self {
            run_id: run_id.into(),
            request,
            status: RunStatus::Queued,
            phase: "queued".to_string(),
            error_message: None,
            discovery: None,
            story: None,
            story_source: None,
            scenarios: Vec::new(),
            suite: None,
            execution: None,
            healing_attempts: 0,
            is_healed: false,
            healing_log: Vec::new(),
            created_at: now_rfc3339(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to `next`. Returns false (and changes nothing) once terminal.
    pub fn transition(&mut self, next: RunStatus) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        if next == RunStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now_rfc3339());
        }
        if next.is_terminal() {
            self.finished_at = Some(now_rfc3339());
        }
        self.status = next;
        true
    }

    pub fn fail(&mut self, message: impl Into<String>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.error_message = Some(message.into());
        self.transition(RunStatus::Failed)
    }

    pub fn cancel(&mut self, message: impl Into<String>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.error_message = Some(message.into());
        self.phase = "cancelled".to_string();
        self.transition(RunStatus::Cancelled)
    }

    pub fn complete(&mut self) -> bool {
        self.transition(RunStatus::Completed)
    }

    /// Full recovery: sets `is_healed` together with `completed`.
    pub fn mark_healed(&mut self) -> bool {
        if self.transition(RunStatus::Completed) {
            self.is_healed = true;
            true
        } else {
            false
        }
    }

    pub fn heal_budget_remaining(&self) -> u32 {
        self.request
            .max_heal_attempts
            .saturating_sub(self.healing_attempts)
    }

    /// Append an attempt record and consume one unit of budget.
    /// Refuses once the budget is spent.
    pub fn record_attempt(&mut self, attempt: HealingAttempt) -> bool {
        if self.heal_budget_remaining() == 0 {
            return false;
        }
        self.healing_attempts += 1;
        self.healing_log.push(attempt);
        true
    }

    pub fn failed_test_count(&self) -> u32 {
        self.execution.as_ref().map(|e| e.failed_count()).unwrap_or(0)
    }

    pub fn passed_test_count(&self) -> u32 {
        self.execution.as_ref().map(|e| e.summary.passed).unwrap_or(0)
    }

    pub fn pages_count(&self) -> usize {
        self.discovery.as_ref().map(|d| d.pages.len()).unwrap_or(0)
    }

    pub fn elements_count(&self) -> usize {
        self.discovery.as_ref().map(|d| d.element_count()).unwrap_or(0)
    }
}
