//! Model-backed narrative, scenario and code services.
//!
//! Each service builds a prompt, asks a [`TextModel`] and parses the
//! answer. Parsing is lenient on framing (code fences, prose around JSON)
//! and strict on content: an answer that cannot be parsed is an error the
//! calling stage turns into its fallback.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use super::llm::{ModelTask, TextModel};
use crate::pipeline::collaborators::{
    ArtifactSource, CodeGenService, NarrativeService, ScenarioService,
};
use crate::pipeline::models::{DiscoveryOutput, Scenario, Suggestion, TestRecord};
use crate::util::{extract_json_object, strip_code_fences, truncate_chars};

const MAX_PROMPT_ELEMENTS: usize = 40;
const MAX_FAILURE_MESSAGE_CHARS: usize = 500;
const MAX_SOURCE_CHARS: usize = 4000;
const CODE_BLOCK_CONFIDENCE: f64 = 0.5;

fn describe_discovery(discovery: &DiscoveryOutput) -> String {
    let mut out = String::new();
    let mut listed = 0;
    for page in &discovery.pages {
        out.push_str(&format!(
            "Page: {} ({})\n",
            page.url,
            page.title.as_deref().unwrap_or("untitled")
        ));
        for el in &page.elements {
            if listed >= MAX_PROMPT_ELEMENTS {
                break;
            }
            out.push_str(&format!(
                "  - <{}> {} {}\n",
                el.tag,
                el.selector,
                el.text.as_deref().unwrap_or("")
            ));
            listed += 1;
        }
    }
    out
}

// ── Narrative ────────────────────────────────────────────────────────

pub struct LlmNarrator {
    model: Arc<dyn TextModel>,
}

impl LlmNarrator {
    pub fn new(model: Arc<dyn TextModel>) -> Self {
        Self { model }
    }
}

pub fn story_prompt(discovery: &DiscoveryOutput, user_hint: Option<&str>) -> String {
    let mut prompt = String::from(
        "You are a QA engineer. Write a short user story (3-6 sentences) describing \
         what an end-to-end browser test of this website should cover.\n\n",
    );
    prompt.push_str(&describe_discovery(discovery));
    if let Some(hint) = user_hint.filter(|h| !h.trim().is_empty()) {
        prompt.push_str(&format!("\nThe user is especially interested in: {}\n", hint.trim()));
    }
    prompt.push_str("\nRespond with the story text only.");
    prompt
}

#[async_trait]
impl NarrativeService for LlmNarrator {
    async fn derive_story(
        &self,
        discovery: &DiscoveryOutput,
        user_hint: Option<&str>,
    ) -> Result<String> {
        let text = self
            .model
            .complete(ModelTask::Story, &story_prompt(discovery, user_hint))
            .await?;
        let story = strip_code_fences(&text);
        if story.is_empty() {
            anyhow::bail!("model returned an empty story");
        }
        Ok(story)
    }
}

// ── Scenarios ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ScenarioList {
    #[serde(default)]
    scenarios: Vec<RawScenario>,
}

#[derive(Debug, Deserialize)]
struct RawScenario {
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    steps: Vec<String>,
    #[serde(default, alias = "expected", alias = "assertions")]
    validations: Vec<String>,
}

pub struct LlmScenarioWriter {
    model: Arc<dyn TextModel>,
}

impl LlmScenarioWriter {
    pub fn new(model: Arc<dyn TextModel>) -> Self {
        Self { model }
    }
}

pub fn scenario_prompt(narrative: &str, discovery: &DiscoveryOutput) -> String {
    format!(
        "Convert this user story into concrete browser test scenarios.\n\n\
         Story:\n{}\n\nDiscovered UI:\n{}\n\
         Return JSON only, in this shape:\n\
         {{\"scenarios\": [{{\"id\": \"login_1\", \"name\": \"...\", \
         \"steps\": [\"...\"], \"validations\": [\"...\"]}}]}}",
        narrative,
        describe_discovery(discovery)
    )
}

/// Scenarios from a model answer. Unnamed entries are dropped.
pub fn parse_scenarios(text: &str) -> Result<Vec<Scenario>> {
    let json = extract_json_object(text).context("no JSON object in scenario answer")?;
    let list: ScenarioList = serde_json::from_str(&json).context("malformed scenario JSON")?;
    Ok(list
        .scenarios
        .into_iter()
        .filter(|s| !s.name.trim().is_empty())
        .map(|s| Scenario {
            id: s.id.trim().to_string(),
            name: s.name.trim().to_string(),
            steps: s.steps,
            validations: s.validations,
        })
        .collect())
}

#[async_trait]
impl ScenarioService for LlmScenarioWriter {
    async fn derive_scenarios(
        &self,
        narrative: &str,
        discovery: &DiscoveryOutput,
    ) -> Result<Vec<Scenario>> {
        let text = self
            .model
            .complete(ModelTask::Scenarios, &scenario_prompt(narrative, discovery))
            .await?;
        parse_scenarios(&text)
    }
}

// ── Code ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SuggestionList {
    #[serde(default)]
    suggestions: Vec<RawSuggestion>,
}

#[derive(Debug, Deserialize)]
struct RawSuggestion {
    #[serde(default, alias = "file")]
    target: Option<String>,
    #[serde(default)]
    issue: String,
    #[serde(default, alias = "content", alias = "replacement")]
    fix: String,
    #[serde(default)]
    confidence: Option<f64>,
}

pub struct LlmCodeWriter {
    model: Arc<dyn TextModel>,
}

impl LlmCodeWriter {
    pub fn new(model: Arc<dyn TextModel>) -> Self {
        Self { model }
    }
}

pub fn test_prompt(scenario: &Scenario, url: &str) -> String {
    let steps = scenario
        .steps
        .iter()
        .enumerate()
        .map(|(i, s)| format!("{}. {}", i + 1, s))
        .collect::<Vec<_>>()
        .join("\n");
    let checks = scenario
        .validations
        .iter()
        .map(|v| format!("- {}", v))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "Write one pytest test using playwright.async_api for this scenario.\n\n\
         URL: {url}\nScenario: {name}\nSteps:\n{steps}\nValidations:\n{checks}\n\n\
         Rules:\n\
         - start with `import pytest` and `from playwright.async_api import async_playwright`\n\
         - decorate the test with `@pytest.mark.asyncio` and define it as `async def test_...`\n\
         - launch the browser with `headless=os.environ.get(\"HEADED\") != \"1\"`\n\
         - save a screenshot into the ARTIFACTS_DIR environment directory\n\
         - return only Python code",
        url = url,
        name = scenario.name,
        steps = steps,
        checks = checks,
    )
}

pub fn fix_prompt(failing: &[TestRecord], artifacts: &[ArtifactSource]) -> String {
    let failures = failing
        .iter()
        .map(|t| {
            format!(
                "Test: {}\nOutcome: {}\nError: {}",
                t.node_id,
                t.outcome.as_str(),
                truncate_chars(t.message.as_deref().unwrap_or("no message"), MAX_FAILURE_MESSAGE_CHARS)
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n");
    let sources = artifacts
        .iter()
        .map(|a| {
            format!(
                "File: {}\n```python\n{}\n```",
                a.file.display(),
                truncate_chars(&a.content, MAX_SOURCE_CHARS)
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n");
    format!(
        "These generated browser tests are failing.\n\n{}\n\nSources:\n{}\n\n\
         For each file you can repair, return JSON only:\n\
         {{\"suggestions\": [{{\"target\": \"<file name>\", \"issue\": \"<what is wrong>\", \
         \"fix\": \"<complete corrected file content>\", \"confidence\": 0.0}}]}}",
        failures, sources
    )
}

/// The file a bare code-block answer most likely replaces.
fn default_target(failing: &[TestRecord], artifacts: &[ArtifactSource]) -> Option<PathBuf> {
    failing
        .iter()
        .find_map(TestRecord::artifact_file)
        .or_else(|| artifacts.first().map(|a| a.file.clone()))
}

/// Suggestions from a model answer: the JSON list when present, else a
/// single medium-confidence suggestion built from a code block.
pub fn parse_suggestions(
    text: &str,
    failing: &[TestRecord],
    artifacts: &[ArtifactSource],
) -> Vec<Suggestion> {
    let fallback_target = default_target(failing, artifacts);

    let parsed = extract_json_object(text)
        .and_then(|json| serde_json::from_str::<SuggestionList>(&json).ok());
    if let Some(list) = parsed.filter(|l| !l.suggestions.is_empty()) {
        return list
            .suggestions
            .into_iter()
            .filter_map(|raw| {
                let target = raw
                    .target
                    .filter(|t| !t.trim().is_empty())
                    .map(PathBuf::from)
                    .or_else(|| fallback_target.clone())?;
                let fix = strip_code_fences(&raw.fix);
                if fix.is_empty() {
                    return None;
                }
                let issue = if raw.issue.trim().is_empty() {
                    "unspecified".to_string()
                } else {
                    raw.issue
                };
                Some(Suggestion::new(
                    target,
                    fix,
                    issue,
                    raw.confidence.unwrap_or(CODE_BLOCK_CONFIDENCE),
                ))
            })
            .collect();
    }

    if text.contains("```")
        && let Some(target) = fallback_target
    {
        let code = strip_code_fences(text);
        if !code.is_empty() {
            debug!(target = %target.display(), "using bare code block as suggestion");
            return vec![Suggestion::new(
                target,
                code,
                "Test failures detected",
                CODE_BLOCK_CONFIDENCE,
            )];
        }
    }
    Vec::new()
}

#[async_trait]
impl CodeGenService for LlmCodeWriter {
    async fn generate_test(&self, scenario: &Scenario, url: &str) -> Result<String> {
        self.model
            .complete(ModelTask::Code, &test_prompt(scenario, url))
            .await
    }

    async fn suggest_fix(
        &self,
        failing: &[TestRecord],
        artifacts: &[ArtifactSource],
    ) -> Result<Vec<Suggestion>> {
        let text = self
            .model
            .complete(ModelTask::Healing, &fix_prompt(failing, artifacts))
            .await?;
        let suggestions = parse_suggestions(&text, failing, artifacts);
        if suggestions.is_empty() {
            warn!(chars = text.len(), "healing answer held no usable suggestion");
        }
        Ok(suggestions)
    }
}
