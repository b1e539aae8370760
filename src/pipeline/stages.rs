//! Stage functions. Each one folds a collaborator result into the context.
//!
//! Upstream stages never halt on a degraded collaborator: they substitute a
//! conservative output and report `degraded`. An `Err` from a stage always
//! halts the run; only fatal conditions are returned that way.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{info, instrument, warn};

use super::collaborators::{CodeGenService, DiscoveryService, ExecutionService, NarrativeService, ScenarioService};
use super::models::{
    DiscoveryOutput, ExecutionOutcome, GeneratedSuite, PresetLimits, RunContext, Scenario,
    StorySource, TestArtifact,
};
use super::patch::{check_test_source, content_digest};
use crate::errors::StageError;
use crate::util::{slugify, strip_code_fences, trim_to_first_import};

/// User narratives at or below this length are treated as hints.
pub const MIN_USER_STORY_CHARS: usize = 20;

const MAX_FILE_SLUG: usize = 50;

/// Playwright plumbing a generated pytest file needs on top of the shared
/// structural check.
const PLAYWRIGHT_MARKERS: [&str; 4] = [
    "import pytest",
    "async_playwright",
    "@pytest.mark.asyncio",
    "launch(",
];

const FALLBACK_TEST_TEMPLATE: &str = r#"import os

import pytest
from playwright.async_api import async_playwright

HEADED = os.getenv("HEADED", "0") == "1"
ARTIFACTS_DIR = os.getenv("ARTIFACTS_DIR", "artifacts")


@pytest.mark.asyncio
async def test___SLUG__():
    """__NAME__"""
    async with async_playwright() as p:
        browser = await p.chromium.launch(headless=not HEADED)
        page = await browser.new_page()
        try:
            response = await page.goto("__URL__", wait_until="domcontentloaded", timeout=30000)
            assert response is not None
            assert response.ok, f"unexpected status {response.status}"
            assert await page.title() is not None
        except Exception:
            os.makedirs(ARTIFACTS_DIR, exist_ok=True)
            await page.screenshot(path=os.path.join(ARTIFACTS_DIR, "__SLUG__.png"))
            raise
        finally:
            await browser.close()
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StageReport {
    /// The stage substituted fallback output.
    pub degraded: bool,
}

impl StageReport {
    pub fn produced() -> Self {
        Self { degraded: false }
    }

    pub fn degraded() -> Self {
        Self { degraded: true }
    }
}

pub type StageResult = Result<StageReport, StageError>;

/// Classify a collaborator error: fatal ones propagate, the rest become
/// `Ok(reason)` for the caller to log before falling back.
fn absorb(err: anyhow::Error, as_degraded: fn(String) -> StageError) -> Result<StageError, StageError> {
    let typed = StageError::classify(err, as_degraded);
    if typed.is_fatal() { Err(typed) } else { Ok(typed) }
}

// ── discovery ────────────────────────────────────────────────────────

#[instrument(skip_all, fields(run_id = %ctx.run_id))]
pub async fn discover(
    ctx: &mut RunContext,
    service: &dyn DiscoveryService,
    limits: PresetLimits,
) -> StageResult {
    let url = ctx.request.url.clone();
    let degraded_reason = match service.discover(&url, limits.depth, limits.page_limit).await {
        Ok(output) if !output.is_empty() => {
            info!(
                pages = output.pages.len(),
                elements = output.element_count(),
                "discovery finished"
            );
            ctx.discovery = Some(output);
            return Ok(StageReport::produced());
        }
        Ok(_) => StageError::DiscoveryDegraded("no pages discovered".to_string()),
        Err(e) => absorb(e, StageError::DiscoveryDegraded)?,
    };
    warn!(reason = %degraded_reason, "discovery degraded, continuing with the target page only");
    ctx.discovery = Some(DiscoveryOutput::fallback(&url));
    Ok(StageReport::degraded())
}

// ── story ────────────────────────────────────────────────────────────

pub fn minimal_story(url: &str) -> String {
    format!("Test the website at {}. Verify basic functionality.", url)
}

pub fn fallback_story(url: &str, pages: usize) -> String {
    format!(
        "Test the website at {}. Verify that {} pages load correctly and that their main interactive elements respond.",
        url, pages
    )
}

#[instrument(skip_all, fields(run_id = %ctx.run_id))]
pub async fn derive_story(ctx: &mut RunContext, service: &dyn NarrativeService) -> StageResult {
    let url = ctx.request.url.clone();
    let user_text = ctx
        .request
        .story
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    if let Some(story) = user_text.as_ref().filter(|s| s.chars().count() > MIN_USER_STORY_CHARS) {
        ctx.story = Some(story.clone());
        ctx.story_source = Some(StorySource::UserProvided);
        return Ok(StageReport::produced());
    }

    let discovery = ctx.discovery.clone().unwrap_or_default();
    if discovery.element_count() == 0 {
        ctx.story = Some(minimal_story(&url));
        ctx.story_source = Some(StorySource::Fallback);
        return Ok(StageReport::degraded());
    }

    let reason = match service.derive_story(&discovery, user_text.as_deref()).await {
        Ok(story) if !story.trim().is_empty() => {
            ctx.story = Some(story.trim().to_string());
            ctx.story_source = Some(StorySource::AiGenerated);
            return Ok(StageReport::produced());
        }
        Ok(_) => StageError::GenerationUnavailable("empty narrative".to_string()),
        Err(e) => absorb(e, StageError::GenerationUnavailable)?,
    };
    warn!(%reason, "narrative unavailable, using fallback story");
    ctx.story = Some(fallback_story(&url, discovery.pages.len()));
    ctx.story_source = Some(StorySource::Fallback);
    Ok(StageReport::degraded())
}

// ── scenarios ────────────────────────────────────────────────────────

fn normalize_scenarios(scenarios: Vec<Scenario>) -> Vec<Scenario> {
    scenarios
        .into_iter()
        .enumerate()
        .map(|(i, mut s)| {
            if s.id.trim().is_empty() {
                s.id = format!("scenario_{}", i + 1);
            }
            if s.name.trim().is_empty() {
                s.name = format!("Scenario {}", i + 1);
            }
            s
        })
        .collect()
}

#[instrument(skip_all, fields(run_id = %ctx.run_id))]
pub async fn derive_scenarios(ctx: &mut RunContext, service: &dyn ScenarioService) -> StageResult {
    let url = ctx.request.url.clone();
    let story = ctx.story.clone().unwrap_or_else(|| minimal_story(&url));
    let discovery = ctx.discovery.clone().unwrap_or_default();

    let reason = match service.derive_scenarios(&story, &discovery).await {
        Ok(list) if !list.is_empty() => {
            info!(count = list.len(), "scenarios derived");
            ctx.scenarios = normalize_scenarios(list);
            return Ok(StageReport::produced());
        }
        Ok(_) => StageError::GenerationUnavailable("no scenarios derived".to_string()),
        Err(e) => absorb(e, StageError::GenerationUnavailable)?,
    };
    warn!(%reason, "falling back to the page-load scenario");
    ctx.scenarios = vec![Scenario::fallback(&url)];
    Ok(StageReport::degraded())
}

// ── codegen ──────────────────────────────────────────────────────────

/// Suite directory for a run: `<runs_dir>/<run_id>/generator/tests`.
pub fn suite_dir(runs_dir: &Path, run_id: &str) -> PathBuf {
    runs_dir.join(run_id).join("generator").join("tests")
}

/// The healing loop's structural check plus the Playwright markers.
pub fn validate_generated_test(code: &str) -> Result<(), String> {
    let cleaned = check_test_source(code)?;
    match PLAYWRIGHT_MARKERS.iter().find(|m| !cleaned.contains(**m)) {
        Some(missing) => Err(format!("missing `{}`", missing)),
        None => Ok(()),
    }
}

pub fn clean_generated(raw: &str) -> String {
    trim_to_first_import(&strip_code_fences(raw)).trim().to_string() + "\n"
}

pub fn fallback_test(scenario: &Scenario, url: &str) -> String {
    let slug = match slugify(&scenario.name, MAX_FILE_SLUG) {
        s if s.is_empty() => "page_load".to_string(),
        s => s,
    };
    FALLBACK_TEST_TEMPLATE
        .replace("__SLUG__", &slug)
        .replace("__NAME__", &scenario.name.replace('"', "'"))
        .replace("__URL__", &url.replace('\\', "\\\\").replace('"', "\\\""))
}

/// `test_<slug>.py`, with a numeric suffix when the name is taken.
pub fn unique_file_name(name: &str, taken: &mut HashSet<String>) -> String {
    let slug = match slugify(name, MAX_FILE_SLUG) {
        s if s.is_empty() => "scenario".to_string(),
        s => s,
    };
    let mut candidate = format!("test_{}.py", slug);
    let mut n = 2;
    while taken.contains(&candidate) {
        candidate = format!("test_{}_{}.py", slug, n);
        n += 1;
    }
    taken.insert(candidate.clone());
    candidate
}

#[instrument(skip_all, fields(run_id = %ctx.run_id))]
pub async fn generate_suite(
    ctx: &mut RunContext,
    service: &dyn CodeGenService,
    runs_dir: &Path,
) -> StageResult {
    let url = ctx.request.url.clone();
    let dir = suite_dir(runs_dir, &ctx.run_id);
    prepare_dir(&dir).map_err(|e| {
        StageError::ExecutionInfrastructureFailure(format!(
            "cannot prepare artifact directory {}: {}",
            dir.display(),
            e
        ))
    })?;

    let mut taken = HashSet::new();
    let mut artifacts = Vec::new();
    for scenario in &ctx.scenarios {
        let (code, fallback) = match service.generate_test(scenario, &url).await {
            Ok(raw) => {
                let code = clean_generated(&raw);
                match validate_generated_test(&code) {
                    Ok(()) => (code, false),
                    Err(reason) => {
                        warn!(scenario = %scenario.name, %reason, "generated test rejected, using template");
                        (fallback_test(scenario, &url), true)
                    }
                }
            }
            Err(e) => {
                let reason = absorb(e, StageError::GenerationUnavailable)?;
                warn!(scenario = %scenario.name, %reason, "generation failed, using template");
                (fallback_test(scenario, &url), true)
            }
        };

        let file = unique_file_name(&scenario.name, &mut taken);
        if let Err(e) = std::fs::write(dir.join(&file), &code) {
            warn!(%file, error = %e, "failed to write test artifact");
            continue;
        }
        artifacts.push(TestArtifact {
            scenario_id: scenario.id.clone(),
            file: PathBuf::from(file),
            sha256: content_digest(&code),
            bytes: code.len(),
            fallback,
        });
    }

    if artifacts.is_empty() {
        return Err(StageError::GenerationUnavailable("No tests generated".to_string()));
    }

    let degraded = artifacts.iter().any(|a| a.fallback);
    info!(count = artifacts.len(), degraded, "test suite written");
    ctx.suite = Some(GeneratedSuite { dir, artifacts });
    Ok(StageReport { degraded })
}

fn prepare_dir(dir: &Path) -> std::io::Result<()> {
    if dir.exists() {
        std::fs::remove_dir_all(dir)?;
    }
    std::fs::create_dir_all(dir)
}

// ── execute ──────────────────────────────────────────────────────────

/// Run the suite. The caller folds the outcome into the context, since a
/// re-run after healing is folded differently from the first run.
#[instrument(skip_all, fields(run_id = %ctx.run_id))]
pub async fn execute(
    ctx: &RunContext,
    service: &dyn ExecutionService,
    limits: PresetLimits,
    allow_headed: bool,
) -> Result<ExecutionOutcome, StageError> {
    let suite = ctx.suite.as_ref().ok_or_else(|| {
        StageError::ExecutionInfrastructureFailure("no generated suite to execute".to_string())
    })?;
    let headed = allow_headed && ctx.request.mode.is_headed();
    let outcome = service
        .execute(&suite.dir, headed, Duration::from_secs(limits.timeout_secs))
        .await
        .map_err(|e| match StageError::classify(e, StageError::ExecutionInfrastructureFailure) {
            infra @ StageError::ExecutionInfrastructureFailure(_) => infra,
            StageError::QueueCancelled => StageError::QueueCancelled,
            other => StageError::ExecutionInfrastructureFailure(other.to_string()),
        })?;
    info!(
        passed = outcome.summary.passed,
        failed = outcome.summary.failed,
        skipped = outcome.summary.skipped,
        "suite executed"
    );
    Ok(outcome)
}
