//! Concrete collaborators behind the pipeline's service traits.

pub mod discovery;
pub mod generation;
pub mod llm;
pub mod runner;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::config::Settings;
use crate::pipeline::collaborators::Collaborators;
use crate::pipeline::sink::StateSink;

const CRAWL_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Wire the real crawler, model-backed generators and pytest runner.
pub fn build_collaborators(settings: &Settings, sink: Arc<dyn StateSink>) -> Result<Collaborators> {
    let model: Arc<dyn llm::TextModel> = Arc::new(llm::OllamaClient::new(&settings.llm)?);
    Ok(Collaborators {
        discovery: Arc::new(discovery::HttpCrawler::new(CRAWL_REQUEST_TIMEOUT)?),
        narrative: Arc::new(generation::LlmNarrator::new(model.clone())),
        scenarios: Arc::new(generation::LlmScenarioWriter::new(model.clone())),
        codegen: Arc::new(generation::LlmCodeWriter::new(model)),
        executor: Arc::new(runner::PytestRunner::new(settings.execution.python.clone())),
        sink,
    })
}
