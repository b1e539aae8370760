//! The pipeline state machine.
//!
//! ```text
//! discovery → story → scenarios → codegen → execute ─┬─> done
//!                                              ^      │
//!                                              └─heal ┘
//! ```
//!
//! `heal → execute` is the only cycle. The branch out of `execute` is
//! [`should_heal`], evaluated fresh on every visit. A heal attempt whose
//! patch was rolled back skips the re-run and goes straight to the branch.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{error, info, warn};

use super::collaborators::Collaborators;
use super::events::ProgressEvent;
use super::healing::{self, AttemptResult, HealingLoop};
use super::models::{PatchOutcome, Preset, PresetLimits, RunContext, RunStatus};
use super::sink::{ContextDelta, StateSink};
use super::stages::{self, StageReport};
use crate::errors::StageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Discovery,
    Story,
    Scenarios,
    Codegen,
    Execute,
    Heal,
    Done,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovery => "discovery",
            Self::Story => "story",
            Self::Scenarios => "scenarios",
            Self::Codegen => "codegen",
            Self::Execute => "execute",
            Self::Heal => "heal",
            Self::Done => "done",
        }
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single branch point: heal iff healing is enabled, tests failed, and
/// budget remains.
pub fn should_heal(ctx: &RunContext) -> bool {
    ctx.request.auto_heal
        && ctx.failed_test_count() > 0
        && ctx.healing_attempts < ctx.request.max_heal_attempts
}

fn branch(ctx: &RunContext) -> PipelineState {
    if should_heal(ctx) {
        PipelineState::Heal
    } else {
        PipelineState::Done
    }
}

pub fn next_state(current: PipelineState, ctx: &RunContext) -> PipelineState {
    if ctx.is_terminal() {
        return PipelineState::Done;
    }
    match current {
        PipelineState::Discovery => PipelineState::Story,
        PipelineState::Story => PipelineState::Scenarios,
        PipelineState::Scenarios => PipelineState::Codegen,
        PipelineState::Codegen => PipelineState::Execute,
        PipelineState::Execute => branch(ctx),
        PipelineState::Heal if healing::awaiting_rerun(ctx) => PipelineState::Execute,
        PipelineState::Heal => branch(ctx),
        PipelineState::Done => PipelineState::Done,
    }
}

/// Settle a run that reached `done` without a terminal status.
pub fn finalize(ctx: &mut RunContext) {
    if ctx.is_terminal() {
        return;
    }
    let remaining = ctx.failed_test_count();
    if remaining > 0 && ctx.request.auto_heal {
        let err = StageError::HealingExhausted {
            attempts: ctx.healing_attempts,
            remaining_failures: remaining,
        };
        ctx.fail(err.to_string());
    } else {
        ctx.complete();
    }
}

/// Shared cooperative cancellation flag, checked between stages.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub runs_dir: PathBuf,
    pub presets: HashMap<Preset, PresetLimits>,
    pub failure_sample: usize,
    pub allow_headed: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            runs_dir: std::env::temp_dir().join("testsmith_runs"),
            presets: HashMap::new(),
            failure_sample: 3,
            allow_headed: true,
        }
    }
}

impl PipelineSettings {
    pub fn limits(&self, preset: Preset) -> PresetLimits {
        self.presets
            .get(&preset)
            .copied()
            .unwrap_or_else(|| preset.default_limits())
    }
}

/// Observer of a run's context as the pipeline advances it.
pub type Publish<'a> = dyn Fn(&RunContext) + Send + Sync + 'a;

/// Drives one Run Context from `discovery` to a terminal status.
pub struct Pipeline {
    collaborators: Collaborators,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(collaborators: Collaborators, settings: PipelineSettings) -> Self {
        Self {
            collaborators,
            settings,
        }
    }

    pub fn sink(&self) -> &Arc<dyn StateSink> {
        &self.collaborators.sink
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Run to completion without an external observer.
    pub async fn run(&self, ctx: RunContext, cancel: &CancellationFlag) -> RunContext {
        self.drive(ctx, cancel, &|_: &RunContext| {}).await
    }

    /// Run to completion, handing the context to `publish` after every state
    /// change. Never fails: every outcome is a terminal status on the
    /// returned context.
    ///
    /// `publish` sees a terminal context exactly once, as the last call,
    /// after the final state is persisted and `RunFinished` is sent.
    pub async fn drive(
        &self,
        mut ctx: RunContext,
        cancel: &CancellationFlag,
        publish: &Publish<'_>,
    ) -> RunContext {
        let run_id = ctx.run_id.clone();
        let sink = self.collaborators.sink.clone();

        if cancel.is_cancelled() {
            ctx.cancel("cancelled before start");
        } else {
            ctx.transition(RunStatus::Running);
            ctx.phase = "starting".to_string();
            info!(run_id = %run_id, url = %ctx.request.url, preset = ctx.request.preset.as_str(), "run started");
            self.checkpoint(&ctx, publish).await;
            sink.notify(&run_id, ProgressEvent::RunStarted).await;
        }

        let mut state = PipelineState::Discovery;
        while state != PipelineState::Done && !ctx.is_terminal() {
            if cancel.is_cancelled() {
                info!(run_id = %run_id, stage = %state, "cancellation observed");
                ctx.cancel(StageError::QueueCancelled.to_string());
                break;
            }

            ctx.phase = state.as_str().to_string();
            sink.notify(
                &run_id,
                ProgressEvent::StageStarted {
                    stage: state.to_string(),
                },
            )
            .await;

            match self.step(state, &mut ctx).await {
                Ok(report) => {
                    sink.notify(
                        &run_id,
                        ProgressEvent::StageCompleted {
                            stage: state.to_string(),
                            degraded: report.degraded,
                        },
                    )
                    .await;
                }
                Err(err) => {
                    error!(run_id = %run_id, stage = %state, error = %err, "stage halted the run");
                    match err.terminal_status() {
                        Some(RunStatus::Cancelled) => ctx.cancel(err.to_string()),
                        _ => ctx.fail(err.to_string()),
                    };
                }
            }

            self.checkpoint(&ctx, publish).await;
            state = next_state(state, &ctx);
        }

        // The last stage may have been in flight when the flag was raised.
        if !ctx.is_terminal() && cancel.is_cancelled() {
            info!(run_id = %run_id, "cancellation observed after the final stage");
            ctx.cancel(StageError::QueueCancelled.to_string());
        }

        finalize(&mut ctx);
        ctx.phase = ctx.status.as_str().to_string();
        self.checkpoint(&ctx, publish).await;
        sink.notify(
            &run_id,
            ProgressEvent::RunFinished {
                status: ctx.status,
                is_healed: ctx.is_healed,
                error_message: ctx.error_message.clone(),
            },
        )
        .await;
        info!(
            run_id = %run_id,
            status = ctx.status.as_str(),
            healing_attempts = ctx.healing_attempts,
            is_healed = ctx.is_healed,
            "run finished"
        );
        publish(&ctx);
        ctx
    }

    /// Persist every state; publish only while the run is still live.
    async fn checkpoint(&self, ctx: &RunContext, publish: &Publish<'_>) {
        self.collaborators
            .sink
            .persist(&ctx.run_id, ContextDelta::from_context(ctx))
            .await;
        if !ctx.is_terminal() {
            publish(ctx);
        }
    }

    async fn step(&self, state: PipelineState, ctx: &mut RunContext) -> Result<StageReport, StageError> {
        let c = &self.collaborators;
        let limits = self.settings.limits(ctx.request.preset);
        match state {
            PipelineState::Discovery => stages::discover(ctx, c.discovery.as_ref(), limits).await,
            PipelineState::Story => stages::derive_story(ctx, c.narrative.as_ref()).await,
            PipelineState::Scenarios => stages::derive_scenarios(ctx, c.scenarios.as_ref()).await,
            PipelineState::Codegen => {
                stages::generate_suite(ctx, c.codegen.as_ref(), &self.settings.runs_dir).await
            }
            PipelineState::Execute => {
                let outcome =
                    stages::execute(ctx, c.executor.as_ref(), limits, self.settings.allow_headed)
                        .await?;
                c.sink
                    .notify(
                        &ctx.run_id,
                        ProgressEvent::TestsExecuted {
                            summary: outcome.summary,
                        },
                    )
                    .await;
                if healing::awaiting_rerun(ctx) {
                    let verdict = healing::assess_rerun(ctx, outcome);
                    info!(run_id = %ctx.run_id, ?verdict, attempt = ctx.healing_attempts, "re-run assessed");
                } else {
                    ctx.execution = Some(outcome);
                }
                Ok(StageReport::produced())
            }
            PipelineState::Heal => {
                let result = HealingLoop::new(c.codegen.as_ref(), self.settings.failure_sample)
                    .attempt(ctx)
                    .await?;
                if let Some(last) = ctx.healing_log.last() {
                    let outcome = match &last.patch {
                        PatchOutcome::Applied => "applied".to_string(),
                        PatchOutcome::Rejected { reason } => format!("rejected: {}", reason),
                        PatchOutcome::RolledBack { reason } => {
                            format!("rolled back: {}", reason)
                        }
                    };
                    c.sink
                        .notify(
                            &ctx.run_id,
                            ProgressEvent::HealingAttempted {
                                attempt: last.attempt,
                                target: last.suggestion.target.display().to_string(),
                                outcome,
                            },
                        )
                        .await;
                }
                if let AttemptResult::RolledBack(_) = &result {
                    warn!(run_id = %ctx.run_id, attempt = ctx.healing_attempts, "heal attempt was a no-op");
                }
                Ok(StageReport {
                    degraded: result != AttemptResult::Applied,
                })
            }
            PipelineState::Done => Ok(StageReport::produced()),
        }
    }
}
