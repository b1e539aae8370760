use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::models::{ExecutionSummary, RunId, RunStatus};
use super::sink::{ContextDelta, StateSink};

// ── Progress event types ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum ProgressEvent {
    RunQueued {
        position: usize,
        estimated_wait_seconds: u64,
    },
    RunStarted,
    StageStarted {
        stage: String,
    },
    StageCompleted {
        stage: String,
        /// True when the stage substituted fallback output.
        degraded: bool,
    },
    TestsExecuted {
        summary: ExecutionSummary,
    },
    HealingAttempted {
        attempt: u32,
        target: String,
        outcome: String,
    },
    RunFinished {
        status: RunStatus,
        is_healed: bool,
        error_message: Option<String>,
    },
    Log {
        level: String,
        message: String,
    },
}

impl ProgressEvent {
    pub fn log(level: &str, message: impl Into<String>) -> Self {
        Self::Log {
            level: level.to_string(),
            message: message.into(),
        }
    }

    /// The serde tag, used as the stored event type.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RunQueued { .. } => "RunQueued",
            Self::RunStarted => "RunStarted",
            Self::StageStarted { .. } => "StageStarted",
            Self::StageCompleted { .. } => "StageCompleted",
            Self::TestsExecuted { .. } => "TestsExecuted",
            Self::HealingAttempted { .. } => "HealingAttempted",
            Self::RunFinished { .. } => "RunFinished",
            Self::Log { .. } => "Log",
        }
    }
}

/// An event addressed to one run, as delivered to live subscribers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunEvent {
    pub run_id: RunId,
    pub at: String,
    pub event: ProgressEvent,
}

/// Serialise and send an event to all subscribers.
pub fn broadcast_message(tx: &broadcast::Sender<String>, msg: &RunEvent) {
    match serde_json::to_string(msg) {
        Ok(json) => {
            // No receivers is fine: nobody is watching.
            let _ = tx.send(json);
        }
        Err(e) => tracing::warn!(error = %e, "failed to serialise progress event"),
    }
}

/// Live progress notifier over a `broadcast` channel. Ignores persistence.
#[derive(Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<String>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl StateSink for BroadcastNotifier {
    async fn persist(&self, _run_id: &str, _delta: ContextDelta) {}

    async fn notify(&self, run_id: &str, event: ProgressEvent) {
        let msg = RunEvent {
            run_id: run_id.to_string(),
            at: super::models::now_rfc3339(),
            event,
        };
        broadcast_message(&self.tx, &msg);
    }
}
