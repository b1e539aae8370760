//! End-to-end tests for the run pipeline and the run queue.
//!
//! Every collaborator is scripted, so these tests exercise the state
//! machine, the healing loop and admission control without a browser,
//! a model endpoint or a network.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::Semaphore;

use testsmith::errors::{QueueError, StageError};
use testsmith::pipeline::collaborators::{
    ArtifactSource, CodeGenService, Collaborators, DiscoveryService, ExecutionService,
    NarrativeService, ScenarioService,
};
use testsmith::pipeline::db::{RunDb, RunStore};
use testsmith::pipeline::events::ProgressEvent;
use testsmith::pipeline::machine::CancellationFlag;
use testsmith::pipeline::models::{
    DiscoveredPage, DiscoveryOutput, ElementDescriptor, ExecutionOutcome, ExecutionSummary,
    PatchOutcome, RunContext, RunRequest, RunStatus, Scenario, StorySource, Suggestion,
    TestOutcome, TestRecord,
};
use testsmith::pipeline::patch::content_digest;
use testsmith::pipeline::sink::{MemorySink, StateSink};
use testsmith::pipeline::{Pipeline, PipelineSettings, RunQueueManager};

const TARGET: &str = "https://shop.example.com";
const TEST_FILE: &str = "test_login_flow.py";
const NODE_ID: &str = "tests/test_login_flow.py::test_login_flow";

const GOOD_TEST: &str = r##"import pytest
from playwright.async_api import async_playwright


@pytest.mark.asyncio
async def test_login_flow():
    async with async_playwright() as p:
        browser = await p.chromium.launch()
        page = await browser.new_page()
        await page.goto("https://shop.example.com")
        await page.click("#login")
        await browser.close()
"##;

const FIXED_TEST: &str = r##"import pytest
from playwright.async_api import async_playwright


@pytest.mark.asyncio
async def test_login_flow():
    async with async_playwright() as p:
        browser = await p.chromium.launch()
        page = await browser.new_page()
        await page.goto("https://shop.example.com")
        await page.wait_for_selector("#login", timeout=10000)
        await page.click("#login")
        await browser.close()
"##;

// =============================================================================
// Scripted collaborators
// =============================================================================

#[derive(Clone, Copy)]
enum DiscoveryMode {
    Healthy,
    Broken,
    Unreachable,
}

struct StaticDiscovery {
    mode: DiscoveryMode,
    started: Mutex<Vec<String>>,
    gate: Option<Arc<Semaphore>>,
}

impl StaticDiscovery {
    fn new(mode: DiscoveryMode) -> Self {
        Self {
            mode,
            started: Mutex::new(Vec::new()),
            gate: None,
        }
    }

    /// Blocks every discovery until the returned semaphore gets permits.
    fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let discovery = Self {
            gate: Some(gate.clone()),
            ..Self::new(DiscoveryMode::Healthy)
        };
        (discovery, gate)
    }

    fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }
}

#[async_trait]
impl DiscoveryService for StaticDiscovery {
    async fn discover(&self, url: &str, _depth: u32, _page_limit: u32) -> Result<DiscoveryOutput> {
        self.started.lock().unwrap().push(url.to_string());
        if let Some(gate) = &self.gate {
            gate.acquire().await?.forget();
        }
        match self.mode {
            DiscoveryMode::Healthy => Ok(DiscoveryOutput {
                pages: vec![DiscoveredPage {
                    url: url.to_string(),
                    title: Some("Shop".into()),
                    elements: vec![
                        ElementDescriptor {
                            tag: "button".into(),
                            selector: "#login".into(),
                            text: Some("Log in".into()),
                        },
                        ElementDescriptor {
                            tag: "input".into(),
                            selector: "input[name=\"email\"]".into(),
                            text: None,
                        },
                    ],
                }],
            }),
            DiscoveryMode::Broken => anyhow::bail!("unexpected markup on root page"),
            DiscoveryMode::Unreachable => Err(anyhow::Error::new(
                StageError::CollaboratorUnreachable(format!("connection refused by {}", url)),
            )),
        }
    }
}

struct FixedNarrative;

#[async_trait]
impl NarrativeService for FixedNarrative {
    async fn derive_story(&self, _discovery: &DiscoveryOutput, _hint: Option<&str>) -> Result<String> {
        Ok("A returning shopper logs in with email and password and sees their basket.".into())
    }
}

struct FixedScenarios;

#[async_trait]
impl ScenarioService for FixedScenarios {
    async fn derive_scenarios(&self, _narrative: &str, _discovery: &DiscoveryOutput) -> Result<Vec<Scenario>> {
        Ok(vec![Scenario {
            id: "scenario_1".into(),
            name: "Login flow".into(),
            steps: vec!["Open the shop".into(), "Click log in".into()],
            validations: vec!["Login form is visible".into()],
        }])
    }
}

struct ScriptedCodegen {
    fixes: Vec<Suggestion>,
    fix_calls: AtomicUsize,
}

impl ScriptedCodegen {
    fn new(fixes: Vec<Suggestion>) -> Self {
        Self {
            fixes,
            fix_calls: AtomicUsize::new(0),
        }
    }

    fn fix_calls(&self) -> usize {
        self.fix_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CodeGenService for ScriptedCodegen {
    async fn generate_test(&self, _scenario: &Scenario, _url: &str) -> Result<String> {
        Ok(format!("```python\n{}```", GOOD_TEST))
    }

    async fn suggest_fix(&self, failing: &[TestRecord], artifacts: &[ArtifactSource]) -> Result<Vec<Suggestion>> {
        self.fix_calls.fetch_add(1, Ordering::SeqCst);
        assert!(!failing.is_empty(), "healing must only ask about failing tests");
        assert!(artifacts.iter().any(|a| a.file == Path::new(TEST_FILE)));
        Ok(self.fixes.clone())
    }
}

/// Replays scripted outcomes in order, repeating the last one.
struct ScriptedExecutor {
    script: Mutex<VecDeque<Result<ExecutionOutcome, String>>>,
    calls: AtomicUsize,
    running: AtomicUsize,
    peak: AtomicUsize,
    hold: Duration,
}

impl ScriptedExecutor {
    fn new(script: Vec<Result<ExecutionOutcome, String>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            hold: Duration::ZERO,
        }
    }

    fn holding(mut self, hold: Duration) -> Self {
        self.hold = hold;
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExecutionService for ScriptedExecutor {
    async fn execute(&self, artifact_dir: &Path, _headed: bool, _timeout: Duration) -> Result<ExecutionOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert!(artifact_dir.join(TEST_FILE).is_file());

        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.hold.is_zero() {
            tokio::time::sleep(self.hold).await;
        }
        self.running.fetch_sub(1, Ordering::SeqCst);

        let next = {
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                script.pop_front()
            } else {
                script.front().cloned()
            }
        };
        match next {
            Some(Ok(outcome)) => Ok(outcome),
            Some(Err(reason)) => anyhow::bail!(reason),
            None => anyhow::bail!("executor script is empty"),
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn outcome(passed: u32, failed: u32) -> ExecutionOutcome {
    let mut tests = Vec::new();
    for _ in 0..passed {
        tests.push(TestRecord {
            node_id: NODE_ID.into(),
            outcome: TestOutcome::Passed,
            message: None,
        });
    }
    for _ in 0..failed {
        tests.push(TestRecord {
            node_id: NODE_ID.into(),
            outcome: TestOutcome::Failed,
            message: Some("TimeoutError: waiting for selector \"#login\"".into()),
        });
    }
    ExecutionOutcome {
        summary: ExecutionSummary {
            total: passed + failed,
            passed,
            failed,
            skipped: 0,
        },
        tests,
        duration_secs: 1.5,
    }
}

fn good_fix() -> Suggestion {
    Suggestion::new(TEST_FILE, FIXED_TEST, "login button renders late", 0.8)
}

struct Harness {
    _runs: TempDir,
    pipeline: Arc<Pipeline>,
    sink: Arc<MemorySink>,
    discovery: Arc<StaticDiscovery>,
    codegen: Arc<ScriptedCodegen>,
    executor: Arc<ScriptedExecutor>,
}

impl Harness {
    fn new(discovery: StaticDiscovery, codegen: ScriptedCodegen, executor: ScriptedExecutor) -> Self {
        let sink = Arc::new(MemorySink::new());
        Self::with_sink(discovery, codegen, executor, sink.clone(), sink)
    }

    fn with_sink(
        discovery: StaticDiscovery,
        codegen: ScriptedCodegen,
        executor: ScriptedExecutor,
        memory: Arc<MemorySink>,
        sink: Arc<dyn StateSink>,
    ) -> Self {
        let runs = TempDir::new().unwrap();
        let discovery = Arc::new(discovery);
        let codegen = Arc::new(codegen);
        let executor = Arc::new(executor);
        let collaborators = Collaborators {
            discovery: discovery.clone(),
            narrative: Arc::new(FixedNarrative),
            scenarios: Arc::new(FixedScenarios),
            codegen: codegen.clone(),
            executor: executor.clone(),
            sink,
        };
        let settings = PipelineSettings {
            runs_dir: runs.path().to_path_buf(),
            ..PipelineSettings::default()
        };
        Self {
            _runs: runs,
            pipeline: Arc::new(Pipeline::new(collaborators, settings)),
            sink: memory,
            discovery,
            codegen,
            executor,
        }
    }

    fn healthy(fixes: Vec<Suggestion>, script: Vec<Result<ExecutionOutcome, String>>) -> Self {
        Self::new(
            StaticDiscovery::new(DiscoveryMode::Healthy),
            ScriptedCodegen::new(fixes),
            ScriptedExecutor::new(script),
        )
    }

    async fn run(&self, request: RunRequest) -> RunContext {
        let ctx = RunContext::new("run-under-test", request);
        self.pipeline.run(ctx, &CancellationFlag::new()).await
    }
}

fn request(max_heal_attempts: u32) -> RunRequest {
    RunRequest {
        max_heal_attempts,
        ..RunRequest::new(TARGET)
    }
}

fn stage_completions(events: &[ProgressEvent]) -> Vec<(String, bool)> {
    events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::StageCompleted { stage, degraded } => Some((stage.clone(), *degraded)),
            _ => None,
        })
        .collect()
}

async fn settle<F: Fn() -> bool>(check: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("condition never held");
}

// =============================================================================
// Pipeline: happy path and degradation
// =============================================================================

mod pipeline_flow {
    use super::*;

    #[tokio::test]
    async fn test_passing_suite_completes_without_healing() {
        let h = Harness::healthy(vec![good_fix()], vec![Ok(outcome(1, 0))]);
        let ctx = h.run(request(3)).await;

        assert_eq!(ctx.status, RunStatus::Completed);
        assert_eq!(ctx.phase, "completed");
        assert!(!ctx.is_healed);
        assert_eq!(ctx.healing_attempts, 0);
        assert_eq!(ctx.story_source, Some(StorySource::AiGenerated));
        assert_eq!(h.codegen.fix_calls(), 0);
        assert_eq!(h.executor.calls(), 1);

        let suite = ctx.suite.as_ref().unwrap();
        assert_eq!(suite.artifacts.len(), 1);
        assert_eq!(suite.artifacts[0].file, Path::new(TEST_FILE));
        assert!(!suite.artifacts[0].fallback);
        let written = std::fs::read_to_string(suite.dir.join(TEST_FILE)).unwrap();
        assert!(written.starts_with("import pytest"), "code fences must be stripped");

        let stages: Vec<String> = stage_completions(&h.sink.events_for(&ctx.run_id))
            .into_iter()
            .map(|(stage, _)| stage)
            .collect();
        assert_eq!(stages, ["discovery", "story", "scenarios", "codegen", "execute"]);
    }

    #[tokio::test]
    async fn test_user_story_is_used_verbatim() {
        let h = Harness::healthy(vec![], vec![Ok(outcome(1, 0))]);
        let story = "Customers search for a red scarf and add it to the basket.";
        let ctx = h
            .run(RunRequest {
                story: Some(story.to_string()),
                ..request(3)
            })
            .await;

        assert_eq!(ctx.status, RunStatus::Completed);
        assert_eq!(ctx.story.as_deref(), Some(story));
        assert_eq!(ctx.story_source, Some(StorySource::UserProvided));
    }

    #[tokio::test]
    async fn test_broken_discovery_degrades_but_run_continues() {
        let h = Harness::new(
            StaticDiscovery::new(DiscoveryMode::Broken),
            ScriptedCodegen::new(vec![]),
            ScriptedExecutor::new(vec![Ok(outcome(1, 0))]),
        );
        let ctx = h.run(request(3)).await;

        assert_eq!(ctx.status, RunStatus::Completed);
        let discovery = ctx.discovery.as_ref().unwrap();
        assert_eq!(discovery.pages.len(), 1);
        assert_eq!(discovery.pages[0].url, TARGET);
        assert_eq!(ctx.story_source, Some(StorySource::Fallback));

        let completions = stage_completions(&h.sink.events_for(&ctx.run_id));
        assert_eq!(completions[0], ("discovery".to_string(), true));
    }

    #[tokio::test]
    async fn test_unreachable_target_fails_before_execution() {
        let h = Harness::new(
            StaticDiscovery::new(DiscoveryMode::Unreachable),
            ScriptedCodegen::new(vec![]),
            ScriptedExecutor::new(vec![Ok(outcome(1, 0))]),
        );
        let ctx = h.run(request(3)).await;

        assert_eq!(ctx.status, RunStatus::Failed);
        assert!(ctx.error_message.as_deref().unwrap().contains("unreachable"));
        assert!(ctx.suite.is_none());
        assert_eq!(h.executor.calls(), 0);
    }

    #[tokio::test]
    async fn test_harness_failure_fails_run_without_healing() {
        let h = Harness::healthy(
            vec![good_fix()],
            vec![Err("python interpreter not found".to_string())],
        );
        let ctx = h.run(request(3)).await;

        assert_eq!(ctx.status, RunStatus::Failed);
        assert_eq!(ctx.healing_attempts, 0);
        assert!(ctx.error_message.as_deref().unwrap().contains("python interpreter not found"));
        assert_eq!(h.codegen.fix_calls(), 0);
    }

    #[tokio::test]
    async fn test_failures_without_auto_heal_complete() {
        let h = Harness::healthy(vec![good_fix()], vec![Ok(outcome(0, 2))]);
        let ctx = h
            .run(RunRequest {
                auto_heal: false,
                ..request(3)
            })
            .await;

        assert_eq!(ctx.status, RunStatus::Completed);
        assert_eq!(ctx.failed_test_count(), 2);
        assert!(!ctx.is_healed);
        assert_eq!(h.codegen.fix_calls(), 0);
        assert_eq!(h.executor.calls(), 1);
    }

    #[tokio::test]
    async fn test_run_finished_is_the_last_event() {
        let h = Harness::healthy(vec![], vec![Ok(outcome(1, 0))]);
        let ctx = h.run(request(3)).await;

        let events = h.sink.events_for(&ctx.run_id);
        assert!(matches!(events.first(), Some(ProgressEvent::RunStarted)));
        match events.last() {
            Some(ProgressEvent::RunFinished { status, is_healed, .. }) => {
                assert_eq!(*status, RunStatus::Completed);
                assert!(!is_healed);
            }
            other => panic!("Expected RunFinished, got {:?}", other),
        }
        let last_delta = h.sink.deltas().last().cloned().unwrap();
        assert_eq!(last_delta.1.status, Some(RunStatus::Completed));
    }
}

// =============================================================================
// Pipeline: healing loop
// =============================================================================

mod healing {
    use super::*;

    #[tokio::test]
    async fn test_heals_on_second_rerun() {
        let h = Harness::healthy(
            vec![good_fix()],
            vec![Ok(outcome(0, 1)), Ok(outcome(0, 1)), Ok(outcome(1, 0))],
        );
        let ctx = h.run(request(2)).await;

        assert_eq!(ctx.status, RunStatus::Completed);
        assert!(ctx.is_healed);
        assert_eq!(ctx.healing_attempts, 2);
        assert_eq!(ctx.healing_log.len(), 2);
        assert_eq!(ctx.healing_log[0].attempt, 1);
        assert_eq!(ctx.healing_log[1].attempt, 2);
        assert!(ctx.healing_log.iter().all(|a| a.patch == PatchOutcome::Applied));
        assert_eq!(ctx.healing_log[0].rerun.map(|s| s.failed), Some(1));
        assert_eq!(ctx.healing_log[1].rerun.map(|s| s.failed), Some(0));
        assert_eq!(h.executor.calls(), 3);

        let suite = ctx.suite.as_ref().unwrap();
        let on_disk = std::fs::read_to_string(suite.dir.join(TEST_FILE)).unwrap();
        assert_eq!(on_disk.trim(), FIXED_TEST.trim());
        assert_eq!(suite.artifacts[0].sha256, content_digest(&on_disk));

        let heal_events = h
            .sink
            .events_for(&ctx.run_id)
            .into_iter()
            .filter(|e| matches!(e, ProgressEvent::HealingAttempted { .. }))
            .count();
        assert_eq!(heal_events, 2);
    }

    #[tokio::test]
    async fn test_exhausted_budget_fails_run() {
        let h = Harness::healthy(vec![good_fix()], vec![Ok(outcome(0, 1))]);
        let ctx = h.run(request(1)).await;

        assert_eq!(ctx.status, RunStatus::Failed);
        assert!(!ctx.is_healed);
        assert_eq!(ctx.healing_attempts, 1);
        let message = ctx.error_message.as_deref().unwrap();
        assert!(message.contains("Healing exhausted"), "{}", message);
        assert_eq!(h.executor.calls(), 2);
    }

    #[tokio::test]
    async fn test_attempts_never_exceed_budget() {
        for max in 0..=3 {
            let h = Harness::healthy(vec![good_fix()], vec![Ok(outcome(0, 1))]);
            let ctx = h.run(request(max)).await;

            assert_eq!(ctx.status, RunStatus::Failed, "max {}", max);
            assert_eq!(ctx.healing_attempts, max);
            assert_eq!(ctx.healing_log.len() as u32, max);
            assert_eq!(h.codegen.fix_calls() as u32, max);
            assert_eq!(h.executor.calls() as u32, max + 1);
        }
    }

    #[tokio::test]
    async fn test_no_suggestions_fails_without_consuming_budget() {
        let h = Harness::healthy(vec![], vec![Ok(outcome(0, 1))]);
        let ctx = h.run(request(3)).await;

        assert_eq!(ctx.status, RunStatus::Failed);
        assert_eq!(ctx.healing_attempts, 0);
        assert!(ctx.healing_log.is_empty());
        assert!(ctx.error_message.as_deref().unwrap().contains("no suggestions"));
        assert_eq!(h.codegen.fix_calls(), 1);
    }

    #[tokio::test]
    async fn test_most_confident_suggestion_wins() {
        let weak = Suggestion::new(TEST_FILE, "x = 1\n", "guess", 0.2);
        let h = Harness::healthy(
            vec![weak, good_fix()],
            vec![Ok(outcome(0, 1)), Ok(outcome(1, 0))],
        );
        let ctx = h.run(request(3)).await;

        assert!(ctx.is_healed);
        assert_eq!(ctx.healing_log[0].suggestion.confidence, 0.8);
    }

    #[tokio::test]
    async fn test_invalid_patch_leaves_suite_untouched() {
        let no_entry = Suggestion::new(TEST_FILE, "print('no tests here')\n", "rewrite", 0.9);
        let h = Harness::healthy(vec![no_entry], vec![Ok(outcome(0, 1))]);
        let ctx = h.run(request(1)).await;

        assert_eq!(ctx.status, RunStatus::Failed);
        assert_eq!(ctx.healing_attempts, 1);
        assert!(matches!(ctx.healing_log[0].patch, PatchOutcome::Rejected { .. }));
        assert!(ctx.healing_log[0].rerun.is_none());
        assert_eq!(h.executor.calls(), 1, "a rejected patch is never executed");

        let suite = ctx.suite.as_ref().unwrap();
        let on_disk = std::fs::read_to_string(suite.dir.join(TEST_FILE)).unwrap();
        assert_eq!(content_digest(&on_disk), suite.artifacts[0].sha256);
        let generator_dir = suite.dir.parent().unwrap();
        assert!(!generator_dir.join("tests_backup_attempt_1").exists());
    }

    #[tokio::test]
    async fn test_patch_escaping_suite_is_rejected() {
        let escape = Suggestion::new("../../evil.py", FIXED_TEST, "move file", 0.9);
        let h = Harness::healthy(vec![escape], vec![Ok(outcome(0, 1))]);
        let ctx = h.run(request(1)).await;

        assert!(matches!(ctx.healing_log[0].patch, PatchOutcome::Rejected { .. }));
        let suite = ctx.suite.as_ref().unwrap();
        assert!(!suite.dir.parent().unwrap().parent().unwrap().join("evil.py").exists());
    }

    #[tokio::test]
    async fn test_harness_failure_on_rerun_still_counts_attempt() {
        let h = Harness::healthy(
            vec![good_fix()],
            vec![Ok(outcome(0, 1)), Err("browser crashed".to_string())],
        );
        let ctx = h.run(request(3)).await;

        assert_eq!(ctx.status, RunStatus::Failed);
        assert_eq!(ctx.healing_attempts, 1);
        assert!(ctx.error_message.as_deref().unwrap().contains("browser crashed"));
    }
}

// =============================================================================
// Persistence through the run store
// =============================================================================

mod persistence {
    use super::*;

    #[tokio::test]
    async fn test_store_records_final_state_and_events() {
        let store = Arc::new(RunStore::new(RunDb::new_in_memory().unwrap()));
        let h = Harness::with_sink(
            StaticDiscovery::new(DiscoveryMode::Healthy),
            ScriptedCodegen::new(vec![good_fix()]),
            ScriptedExecutor::new(vec![Ok(outcome(0, 1)), Ok(outcome(1, 0))]),
            Arc::new(MemorySink::new()),
            store.clone(),
        );
        let ctx = h.run(request(3)).await;
        assert!(ctx.is_healed);

        let record = store.get_run(&ctx.run_id).await.unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Completed);
        assert_eq!(record.healing_attempts, 1);
        assert!(record.is_healed);
        assert_eq!(record.url, TARGET);
        assert_eq!(record.pages_count, Some(1));
        assert_eq!(record.elements_count, Some(2));
        assert_eq!(record.context.unwrap().healing_log.len(), 1);

        let run_id = ctx.run_id.clone();
        let events = store
            .handle()
            .call(move |db| db.list_events(&run_id))
            .await
            .unwrap();
        assert_eq!(events.first().map(|e| e.event_type.as_str()), Some("RunStarted"));
        assert_eq!(events.last().map(|e| e.event_type.as_str()), Some("RunFinished"));
    }
}

// =============================================================================
// Run queue
// =============================================================================

mod queue {
    use super::*;

    fn queue_of(h: &Harness, max_concurrent: usize) -> RunQueueManager {
        RunQueueManager::new(h.pipeline.clone(), max_concurrent, Duration::from_secs(120))
    }

    fn url(i: usize) -> String {
        format!("https://site-{}.example.com", i)
    }

    #[tokio::test]
    async fn test_tickets_report_position_and_wait() {
        let (discovery, gate) = StaticDiscovery::gated();
        let h = Harness::new(
            discovery,
            ScriptedCodegen::new(vec![]),
            ScriptedExecutor::new(vec![Ok(outcome(1, 0))]),
        );
        let queue = queue_of(&h, 1);

        let first = queue.enqueue(RunRequest::new(url(1))).await.unwrap();
        let second = queue.enqueue(RunRequest::new(url(2))).await.unwrap();
        assert_eq!(first.position, 1);
        assert_eq!(first.estimated_wait_seconds, 0);
        assert_eq!(second.position, 2);
        assert_eq!(second.estimated_wait_seconds, 120);

        let queued = h.sink.events_for(&second.run_id);
        assert!(matches!(queued[0], ProgressEvent::RunQueued { position: 2, .. }));

        settle(|| queue.status().active_count == 1).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(h.discovery.started(), vec![url(1)], "second run must wait for a slot");
        assert_eq!(queue.status().queued_count, 1);

        gate.add_permits(2);
        assert_eq!(queue.wait(&first.run_id).await.unwrap().status, RunStatus::Completed);
        assert_eq!(queue.wait(&second.run_id).await.unwrap().status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_runs_start_in_fifo_order() {
        let h = Harness::healthy(vec![], vec![Ok(outcome(1, 0))]);
        let queue = queue_of(&h, 1);

        let mut ids = Vec::new();
        for i in 0..4 {
            ids.push(queue.enqueue(RunRequest::new(url(i))).await.unwrap().run_id);
        }
        for id in &ids {
            queue.wait(id).await.unwrap();
        }

        let expected: Vec<String> = (0..4).map(url).collect();
        assert_eq!(h.discovery.started(), expected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrency_never_exceeds_limit() {
        let h = Harness::new(
            StaticDiscovery::new(DiscoveryMode::Healthy),
            ScriptedCodegen::new(vec![]),
            ScriptedExecutor::new(vec![Ok(outcome(1, 0))]).holding(Duration::from_millis(50)),
        );
        let queue = queue_of(&h, 2);

        let mut ids = Vec::new();
        for i in 0..5 {
            ids.push(queue.enqueue(RunRequest::new(url(i))).await.unwrap().run_id);
        }
        for id in &ids {
            let ctx = tokio::time::timeout(Duration::from_secs(10), queue.wait(id))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(ctx.status, RunStatus::Completed);
        }

        assert_eq!(h.executor.calls(), 5);
        assert!(h.executor.peak() <= 2, "peak concurrency was {}", h.executor.peak());
        assert_eq!(queue.status().active_count, 0);
    }

    #[tokio::test]
    async fn test_cancel_queued_run_never_starts() {
        let (discovery, gate) = StaticDiscovery::gated();
        let h = Harness::new(
            discovery,
            ScriptedCodegen::new(vec![]),
            ScriptedExecutor::new(vec![Ok(outcome(1, 0))]),
        );
        let queue = queue_of(&h, 1);

        let running = queue.enqueue(RunRequest::new(url(1))).await.unwrap();
        let waiting = queue.enqueue(RunRequest::new(url(2))).await.unwrap();
        settle(|| queue.status().active_count == 1).await;

        assert!(queue.cancel(&waiting.run_id).await);
        let cancelled = queue.wait(&waiting.run_id).await.unwrap();
        assert_eq!(cancelled.status, RunStatus::Cancelled);
        assert!(cancelled.started_at.is_none());

        gate.add_permits(1);
        assert_eq!(queue.wait(&running.run_id).await.unwrap().status, RunStatus::Completed);
        assert_eq!(h.discovery.started(), vec![url(1)]);
        assert!(!queue.cancel(&waiting.run_id).await, "terminal runs cannot be cancelled again");
    }

    #[tokio::test]
    async fn test_cancel_running_run_stops_at_stage_boundary() {
        let (discovery, gate) = StaticDiscovery::gated();
        let h = Harness::new(
            discovery,
            ScriptedCodegen::new(vec![]),
            ScriptedExecutor::new(vec![Ok(outcome(1, 0))]),
        );
        let queue = queue_of(&h, 1);

        let ticket = queue.enqueue(RunRequest::new(url(1))).await.unwrap();
        settle(|| h.discovery.started().len() == 1).await;

        assert!(queue.cancel(&ticket.run_id).await);
        gate.add_permits(1);

        let ctx = queue.wait(&ticket.run_id).await.unwrap();
        assert_eq!(ctx.status, RunStatus::Cancelled);
        assert!(ctx.started_at.is_some());
        assert!(ctx.suite.is_none());
        assert_eq!(h.executor.calls(), 0);
    }

    #[tokio::test]
    async fn test_cancel_during_final_execute_is_observed() {
        let h = Harness::new(
            StaticDiscovery::new(DiscoveryMode::Healthy),
            ScriptedCodegen::new(vec![]),
            ScriptedExecutor::new(vec![Ok(outcome(1, 0))]).holding(Duration::from_millis(200)),
        );
        let queue = queue_of(&h, 1);

        let ticket = queue.enqueue(RunRequest::new(url(1))).await.unwrap();
        settle(|| h.executor.calls() == 1).await;
        assert!(queue.cancel(&ticket.run_id).await);

        let ctx = queue.wait(&ticket.run_id).await.unwrap();
        assert_eq!(ctx.status, RunStatus::Cancelled);
        assert_eq!(ctx.phase, "cancelled");
        assert!(ctx.execution.is_some(), "the in-flight call still finishes");
        assert!(!queue.cancel(&ticket.run_id).await);

        let finished = h.sink.events_for(&ticket.run_id);
        assert!(matches!(
            finished.last(),
            Some(ProgressEvent::RunFinished { status: RunStatus::Cancelled, .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_during_final_rerun_is_observed() {
        let h = Harness::new(
            StaticDiscovery::new(DiscoveryMode::Healthy),
            ScriptedCodegen::new(vec![good_fix()]),
            ScriptedExecutor::new(vec![Ok(outcome(0, 1))]).holding(Duration::from_millis(150)),
        );
        let queue = queue_of(&h, 1);

        let ticket = queue
            .enqueue(RunRequest {
                max_heal_attempts: 1,
                ..RunRequest::new(url(1))
            })
            .await
            .unwrap();
        settle(|| h.executor.calls() == 2).await;
        assert!(queue.cancel(&ticket.run_id).await);

        let ctx = queue.wait(&ticket.run_id).await.unwrap();
        assert_eq!(ctx.status, RunStatus::Cancelled);
        assert_eq!(ctx.healing_attempts, 1);
        assert!(!ctx.is_healed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_terminal_runs_leave_active_set_before_wait_returns() {
        let h = Harness::healthy(vec![], vec![Ok(outcome(1, 0))]);
        let queue = queue_of(&h, 2);

        for i in 0..20 {
            let ticket = queue.enqueue(RunRequest::new(url(i))).await.unwrap();
            let ctx = tokio::time::timeout(Duration::from_secs(5), queue.wait(&ticket.run_id))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(ctx.status, RunStatus::Completed);

            let snapshot = queue.status();
            assert!(!snapshot.active_run_ids.contains(&ticket.run_id), "trial {}", i);
            assert_eq!(snapshot.active_count, 0, "trial {}", i);
            assert!(!queue.cancel(&ticket.run_id).await, "trial {}", i);
        }
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_runs() {
        let (discovery, gate) = StaticDiscovery::gated();
        let h = Harness::new(
            discovery,
            ScriptedCodegen::new(vec![]),
            ScriptedExecutor::new(vec![Ok(outcome(1, 0))]),
        );
        let queue = queue_of(&h, 1);

        let running = queue.enqueue(RunRequest::new(url(1))).await.unwrap();
        let waiting = queue.enqueue(RunRequest::new(url(2))).await.unwrap();
        settle(|| queue.status().active_count == 1).await;

        assert_eq!(queue.shutdown().await, 1);
        assert!(matches!(
            queue.enqueue(RunRequest::new(url(3))).await,
            Err(QueueError::ShutDown)
        ));
        assert_eq!(queue.wait(&waiting.run_id).await.unwrap().status, RunStatus::Cancelled);

        gate.add_permits(1);
        assert_eq!(queue.wait(&running.run_id).await.unwrap().status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_unknown_runs_and_bad_requests() {
        let h = Harness::healthy(vec![], vec![Ok(outcome(1, 0))]);
        let queue = queue_of(&h, 2);

        assert!(!queue.cancel("no-such-run").await);
        assert!(queue.context("no-such-run").is_none());
        assert!(matches!(
            queue.wait("no-such-run").await,
            Err(QueueError::RunNotFound { .. })
        ));
        assert!(matches!(
            queue.enqueue(RunRequest::new("ftp://files.example.com")).await,
            Err(QueueError::BadRequest(_))
        ));
        assert_eq!(queue.status().queued_count, 0);
    }

    #[tokio::test]
    async fn test_zero_limit_is_clamped_to_one() {
        let h = Harness::healthy(vec![], vec![Ok(outcome(1, 0))]);
        let queue = queue_of(&h, 0);
        assert_eq!(queue.status().max_concurrent, 1);

        let ticket = queue.enqueue(RunRequest::new(url(1))).await.unwrap();
        assert_eq!(queue.wait(&ticket.run_id).await.unwrap().status, RunStatus::Completed);
    }
}
