//! The State Sink seam: where runs report persistent state and live progress.
//!
//! Calls are fire-and-forget. Implementations log their own failures and
//! never hand an error back to the pipeline.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::events::ProgressEvent;
use super::models::{RunContext, RunStatus, StorySource};

/// Partial run state. `None` fields are left untouched by the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ContextDelta {
    pub status: Option<RunStatus>,
    pub phase: Option<String>,
    pub error_message: Option<String>,
    pub story_source: Option<StorySource>,
    pub pages_count: Option<usize>,
    pub elements_count: Option<usize>,
    pub healing_attempts: Option<u32>,
    pub is_healed: Option<bool>,
    /// Full context, written whenever the owner has one to hand.
    pub snapshot: Option<Box<RunContext>>,
}

impl ContextDelta {
    pub fn from_context(ctx: &RunContext) -> Self {
        Self {
            status: Some(ctx.status),
            phase: Some(ctx.phase.clone()),
            error_message: ctx.error_message.clone(),
            story_source: ctx.story_source,
            pages_count: ctx.discovery.as_ref().map(|_| ctx.pages_count()),
            elements_count: ctx.discovery.as_ref().map(|_| ctx.elements_count()),
            healing_attempts: Some(ctx.healing_attempts),
            is_healed: Some(ctx.is_healed),
            snapshot: Some(Box::new(ctx.clone())),
        }
    }

    pub fn status(status: RunStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

#[async_trait]
pub trait StateSink: Send + Sync {
    async fn persist(&self, run_id: &str, delta: ContextDelta);
    async fn notify(&self, run_id: &str, event: ProgressEvent);
}

/// Forwards every call to each inner sink in order.
pub struct FanoutSink {
    sinks: Vec<Arc<dyn StateSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn StateSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl StateSink for FanoutSink {
    async fn persist(&self, run_id: &str, delta: ContextDelta) {
        for sink in &self.sinks {
            sink.persist(run_id, delta.clone()).await;
        }
    }

    async fn notify(&self, run_id: &str, event: ProgressEvent) {
        for sink in &self.sinks {
            sink.notify(run_id, event.clone()).await;
        }
    }
}

/// Records everything in memory. Used by tests and dry runs.
#[derive(Default)]
pub struct MemorySink {
    deltas: Mutex<Vec<(String, ContextDelta)>>,
    events: Mutex<Vec<(String, ProgressEvent)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deltas(&self) -> Vec<(String, ContextDelta)> {
        self.deltas.lock().map(|d| d.clone()).unwrap_or_default()
    }

    pub fn events(&self) -> Vec<(String, ProgressEvent)> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn events_for(&self, run_id: &str) -> Vec<ProgressEvent> {
        self.events()
            .into_iter()
            .filter(|(id, _)| id == run_id)
            .map(|(_, ev)| ev)
            .collect()
    }
}

#[async_trait]
impl StateSink for MemorySink {
    async fn persist(&self, run_id: &str, delta: ContextDelta) {
        if let Ok(mut deltas) = self.deltas.lock() {
            deltas.push((run_id.to_string(), delta));
        }
    }

    async fn notify(&self, run_id: &str, event: ProgressEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push((run_id.to_string(), event));
        }
    }
}
