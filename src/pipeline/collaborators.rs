use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use super::models::{DiscoveryOutput, ExecutionOutcome, Scenario, Suggestion, TestRecord};
use super::sink::StateSink;

/// Crawls the target and describes its interactive elements.
/// Real implementation: `services::discovery::HttpCrawler`.
#[async_trait]
pub trait DiscoveryService: Send + Sync {
    async fn discover(&self, url: &str, depth: u32, page_limit: u32) -> Result<DiscoveryOutput>;
}

/// Turns discovery output (and an optional user hint) into a test narrative.
#[async_trait]
pub trait NarrativeService: Send + Sync {
    async fn derive_story(
        &self,
        discovery: &DiscoveryOutput,
        user_hint: Option<&str>,
    ) -> Result<String>;
}

#[async_trait]
pub trait ScenarioService: Send + Sync {
    async fn derive_scenarios(
        &self,
        narrative: &str,
        discovery: &DiscoveryOutput,
    ) -> Result<Vec<Scenario>>;
}

/// Source of a test artifact, handed to `suggest_fix` for context.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactSource {
    pub file: PathBuf,
    pub content: String,
}

/// Writes tests and proposes fixes for failing ones.
#[async_trait]
pub trait CodeGenService: Send + Sync {
    async fn generate_test(&self, scenario: &Scenario, url: &str) -> Result<String>;

    /// Suggestions in the order they were produced. Ranking is the
    /// healing loop's job.
    async fn suggest_fix(
        &self,
        failing: &[TestRecord],
        artifacts: &[ArtifactSource],
    ) -> Result<Vec<Suggestion>>;
}

/// Runs a suite. Test failures are a normal `Ok` outcome; `Err` means the
/// harness itself could not run.
#[async_trait]
pub trait ExecutionService: Send + Sync {
    async fn execute(
        &self,
        artifact_dir: &Path,
        headed: bool,
        timeout: Duration,
    ) -> Result<ExecutionOutcome>;
}

/// Every collaborator a pipeline needs.
#[derive(Clone)]
pub struct Collaborators {
    pub discovery: Arc<dyn DiscoveryService>,
    pub narrative: Arc<dyn NarrativeService>,
    pub scenarios: Arc<dyn ScenarioService>,
    pub codegen: Arc<dyn CodeGenService>,
    pub executor: Arc<dyn ExecutionService>,
    pub sink: Arc<dyn StateSink>,
}
