use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::pipeline::collaborators::ExecutionService;
use crate::pipeline::models::{ExecutionOutcome, ExecutionSummary, TestOutcome, TestRecord};
use crate::util::truncate_chars;

const PYTEST_INI: &str = "[pytest]
asyncio_mode = auto
asyncio_default_fixture_loop_scope = function
addopts = -v --tb=short
markers =
    asyncio: mark test as async
";

const REPORT_FILE: &str = "report.json";
const MAX_MESSAGE_CHARS: usize = 2000;

// ── pytest-json-report format ────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct Report {
    #[serde(default)]
    summary: ReportSummary,
    #[serde(default)]
    tests: Vec<ReportTest>,
    #[serde(default)]
    collectors: Vec<ReportCollector>,
    #[serde(default)]
    duration: f64,
}

/// Keys with a zero count are omitted by the plugin.
#[derive(Debug, Default, Deserialize)]
struct ReportSummary {
    #[serde(default)]
    total: u32,
    #[serde(default)]
    passed: u32,
    #[serde(default)]
    failed: u32,
    #[serde(default)]
    skipped: u32,
    #[serde(default)]
    error: u32,
    #[serde(default)]
    xfailed: u32,
    #[serde(default)]
    xpassed: u32,
}

#[derive(Debug, Deserialize)]
struct ReportTest {
    nodeid: String,
    outcome: String,
    #[serde(default)]
    setup: Option<ReportStage>,
    #[serde(default)]
    call: Option<ReportStage>,
    #[serde(default)]
    teardown: Option<ReportStage>,
}

#[derive(Debug, Deserialize)]
struct ReportStage {
    #[serde(default)]
    longrepr: Option<serde_json::Value>,
    #[serde(default)]
    crash: Option<ReportCrash>,
}

#[derive(Debug, Deserialize)]
struct ReportCrash {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReportCollector {
    nodeid: String,
    outcome: String,
    #[serde(default)]
    longrepr: Option<serde_json::Value>,
}

impl ReportStage {
    fn message(&self) -> Option<String> {
        let longrepr = self.longrepr.as_ref().and_then(|v| match v {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Null => None,
            other => Some(other.to_string()),
        });
        longrepr
            .or_else(|| self.crash.as_ref().and_then(|c| c.message.clone()))
            .filter(|m| !m.trim().is_empty())
    }
}

impl ReportTest {
    fn into_record(self) -> TestRecord {
        let message = [&self.call, &self.setup, &self.teardown]
            .into_iter()
            .flatten()
            .find_map(ReportStage::message)
            .map(|m| truncate_chars(&m, MAX_MESSAGE_CHARS));
        TestRecord {
            outcome: self.outcome.parse().unwrap_or(TestOutcome::Error),
            node_id: self.nodeid,
            message,
        }
    }
}

/// Fold a pytest-json-report document into an execution outcome.
///
/// Errored tests count as failures. So do files that failed to collect
/// (syntax errors, bad imports), which never appear under `tests`.
pub fn parse_report(json: &str) -> Result<ExecutionOutcome> {
    let report: Report = serde_json::from_str(json).context("Failed to parse pytest report")?;

    let broken_files: Vec<TestRecord> = report
        .collectors
        .into_iter()
        .filter(|c| c.outcome == "failed" && c.nodeid.ends_with(".py"))
        .map(|c| TestRecord {
            node_id: c.nodeid,
            outcome: TestOutcome::Error,
            message: c.longrepr.map(|v| match v {
                serde_json::Value::String(s) => truncate_chars(&s, MAX_MESSAGE_CHARS),
                other => other.to_string(),
            }),
        })
        .collect();

    let s = &report.summary;
    let broken = broken_files.len() as u32;
    let mut tests: Vec<TestRecord> = report.tests.into_iter().map(ReportTest::into_record).collect();
    let listed = tests.len() as u32;
    tests.extend(broken_files);

    let summary = ExecutionSummary {
        total: s.total.max(listed) + broken,
        passed: s.passed + s.xpassed,
        failed: s.failed + s.error + broken,
        skipped: s.skipped + s.xfailed,
    };

    Ok(ExecutionOutcome {
        summary,
        tests,
        duration_secs: report.duration,
    })
}

/// Runs a generated suite with pytest and the json-report plugin.
///
/// The suite's parent directory is the working directory; it receives a
/// `pytest.ini`, the JSON report and an `artifacts/` directory that tests
/// find through `ARTIFACTS_DIR`.
pub struct PytestRunner {
    python: String,
}

impl PytestRunner {
    pub fn new(python: impl Into<String>) -> Self {
        Self {
            python: python.into(),
        }
    }
}

#[async_trait]
impl ExecutionService for PytestRunner {
    async fn execute(
        &self,
        artifact_dir: &Path,
        headed: bool,
        limit: Duration,
    ) -> Result<ExecutionOutcome> {
        if !artifact_dir.is_dir() {
            anyhow::bail!("Tests directory not found: {}", artifact_dir.display());
        }
        let work_dir = artifact_dir.parent().unwrap_or(artifact_dir);
        let artifacts = work_dir.join("artifacts");
        std::fs::create_dir_all(&artifacts)
            .with_context(|| format!("Failed to create {}", artifacts.display()))?;
        std::fs::write(work_dir.join("pytest.ini"), PYTEST_INI).context("Failed to write pytest.ini")?;

        let report_path = work_dir.join(REPORT_FILE);
        if report_path.exists() {
            std::fs::remove_file(&report_path).context("Failed to remove stale report")?;
        }

        info!(dir = %artifact_dir.display(), headed, timeout_secs = limit.as_secs(), "running pytest");
        let started = Instant::now();
        let child = Command::new(&self.python)
            .arg("-m")
            .arg("pytest")
            .arg(artifact_dir)
            .arg("-q")
            .arg("--json-report")
            .arg(format!("--json-report-file={}", report_path.display()))
            .current_dir(work_dir)
            .env("ARTIFACTS_DIR", &artifacts)
            .env("HEADED", if headed { "1" } else { "0" })
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start test harness: {}", self.python))?;

        let output = match timeout(limit, child.wait_with_output()).await {
            Ok(result) => result.context("Failed to wait for test harness")?,
            Err(_) => anyhow::bail!("Test execution timed out after {}s", limit.as_secs()),
        };

        for line in String::from_utf8_lossy(&output.stdout).lines().filter(|l| !l.trim().is_empty()) {
            debug!(target: "testsmith::pytest", "{}", line);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        for line in stderr.lines().filter(|l| !l.trim().is_empty()) {
            warn!(target: "testsmith::pytest", "{}", line);
        }

        if !report_path.exists() {
            anyhow::bail!(
                "Report file not generated (exit {}): {}",
                output.status,
                truncate_chars(stderr.trim(), 500)
            );
        }
        let json = std::fs::read_to_string(&report_path)
            .with_context(|| format!("Failed to read {}", report_path.display()))?;
        let mut outcome = parse_report(&json)?;
        if outcome.duration_secs == 0.0 {
            outcome.duration_secs = started.elapsed().as_secs_f64();
        }
        info!(
            passed = outcome.summary.passed,
            failed = outcome.summary.failed,
            skipped = outcome.summary.skipped,
            "pytest finished"
        );
        Ok(outcome)
    }
}
