//! The healing loop. Entered from the `heal` branch of the state machine.
//!
//! One attempt takes a small sample of failing tests and asks the code
//! generator for fixes. The most confident fix is applied behind a snapshot.
//! The machine then re-executes the suite and [`assess_rerun`] decides
//! whether the run converged. Budget accounting lives on the context:
//! [`RunContext::record_attempt`] consumes exactly one unit per attempt.

use std::collections::BTreeSet;
use std::path::PathBuf;

use tracing::{info, instrument, warn};

use super::collaborators::{ArtifactSource, CodeGenService};
use super::models::{
    ExecutionOutcome, HealingAttempt, PatchOutcome, RunContext, Suggestion, SuggestionSummary,
    TestRecord, now_rfc3339,
};
use super::patch::{Snapshot, apply_with_rollback, content_digest};
use crate::errors::StageError;

/// How a finished attempt left the suite.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptResult {
    /// The patch was written; the suite needs a re-run.
    Applied,
    /// The patch was refused and the snapshot restored.
    RolledBack(PatchOutcome),
}

/// Verdict after re-running a patched suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convergence {
    Healed,
    Improved,
    NoImprovement,
}

/// Order by descending confidence. Equal confidence keeps receipt order.
pub fn rank_suggestions(mut suggestions: Vec<Suggestion>) -> Vec<Suggestion> {
    suggestions.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    suggestions
}

pub fn sample_failures(outcome: &ExecutionOutcome, limit: usize) -> Vec<TestRecord> {
    outcome
        .failing()
        .into_iter()
        .take(limit.max(1))
        .cloned()
        .collect()
}

/// True while the newest attempt has been applied but not re-run.
pub fn awaiting_rerun(ctx: &RunContext) -> bool {
    ctx.healing_log
        .last()
        .map(|a| a.patch.is_applied() && a.rerun.is_none())
        .unwrap_or(false)
}

pub struct HealingLoop<'a> {
    codegen: &'a dyn CodeGenService,
    failure_sample: usize,
}

impl<'a> HealingLoop<'a> {
    pub fn new(codegen: &'a dyn CodeGenService, failure_sample: usize) -> Self {
        Self {
            codegen,
            failure_sample,
        }
    }

    /// Run one attempt up to (not including) the re-execution.
    ///
    /// Returns `HealingExhausted` before asking for fixes or touching the
    /// suite when no budget remains, and `GenerationUnavailable` without
    /// touching the budget when the generator fails or has no suggestions.
    #[instrument(skip_all, fields(run_id = %ctx.run_id, attempt = ctx.healing_attempts + 1))]
    pub async fn attempt(&self, ctx: &mut RunContext) -> Result<AttemptResult, StageError> {
        let (Some(outcome), Some(suite)) = (ctx.execution.as_ref(), ctx.suite.as_ref()) else {
            return Err(StageError::GenerationUnavailable(
                "nothing to heal: suite was never executed".to_string(),
            ));
        };

        if ctx.heal_budget_remaining() == 0 {
            return Err(StageError::HealingExhausted {
                attempts: ctx.healing_attempts,
                remaining_failures: ctx.failed_test_count(),
            });
        }

        let failing = sample_failures(outcome, self.failure_sample);
        let artifacts = collect_sources(&suite.dir, &failing, suite.artifacts.iter().map(|a| a.file.clone()));

        let suggestions = self
            .codegen
            .suggest_fix(&failing, &artifacts)
            .await
            .map_err(|e| StageError::classify(e, StageError::GenerationUnavailable))?;
        let Some(best) = rank_suggestions(suggestions).into_iter().next() else {
            return Err(StageError::GenerationUnavailable(
                "fix generator returned no suggestions".to_string(),
            ));
        };

        let attempt_no = ctx.healing_attempts + 1;
        let suite_dir = suite.dir.clone();
        let backup_dir = suite_dir.with_file_name(format!("tests_backup_attempt_{}", attempt_no));
        let started_at = now_rfc3339();

        let infra = |e: anyhow::Error| StageError::ExecutionInfrastructureFailure(format!("{:#}", e));
        let snapshot = Snapshot::capture(&suite_dir, &backup_dir).map_err(infra)?;
        let patch = apply_with_rollback(&suite_dir, &best, &snapshot).map_err(infra)?;
        if let Err(e) = snapshot.discard() {
            warn!(error = %e, "failed to remove healing backup");
        }

        match &patch {
            PatchOutcome::Applied => {
                info!(target_file = %best.target.display(), confidence = best.confidence, "patch applied");
                refresh_digest(ctx, &best);
            }
            PatchOutcome::Rejected { reason } | PatchOutcome::RolledBack { reason } => {
                warn!(target_file = %best.target.display(), %reason, "patch rolled back");
            }
        }

        // Budget was checked before the snapshot; nothing else consumes it.
        ctx.record_attempt(HealingAttempt {
            attempt: attempt_no,
            suggestion: SuggestionSummary::from(&best),
            patch: patch.clone(),
            rerun: None,
            started_at,
        });

        Ok(match patch {
            PatchOutcome::Applied => AttemptResult::Applied,
            other => AttemptResult::RolledBack(other),
        })
    }
}

/// Fold a re-run into the context and decide whether the run converged.
/// The re-run becomes the run's current execution outcome either way.
pub fn assess_rerun(ctx: &mut RunContext, rerun: ExecutionOutcome) -> Convergence {
    let prior_failures = ctx.failed_test_count();
    if let Some(last) = ctx.healing_log.last_mut() {
        last.rerun = Some(rerun.summary);
    }
    let failed = rerun.summary.failed;
    let passed = rerun.summary.passed;
    ctx.execution = Some(rerun);

    if failed == 0 && passed > 0 {
        ctx.mark_healed();
        Convergence::Healed
    } else if failed < prior_failures {
        Convergence::Improved
    } else {
        Convergence::NoImprovement
    }
}

/// Sources of the artifacts the failing tests live in, falling back to the
/// whole suite when no failure names a file.
fn collect_sources(
    suite_dir: &std::path::Path,
    failing: &[TestRecord],
    all: impl Iterator<Item = PathBuf>,
) -> Vec<ArtifactSource> {
    let mut files: BTreeSet<PathBuf> = failing.iter().filter_map(|t| t.artifact_file()).collect();
    if files.is_empty() {
        files = all.collect();
    }
    files
        .into_iter()
        .filter_map(|file| {
            let content = std::fs::read_to_string(suite_dir.join(&file)).ok()?;
            Some(ArtifactSource { file, content })
        })
        .collect()
}

fn refresh_digest(ctx: &mut RunContext, applied: &Suggestion) {
    let Some(suite) = ctx.suite.as_mut() else {
        return;
    };
    let name = applied.target.file_name().map(PathBuf::from);
    for artifact in suite.artifacts.iter_mut() {
        if Some(&artifact.file) == name.as_ref() || artifact.file == applied.target {
            if let Ok(body) = std::fs::read_to_string(suite.dir.join(&artifact.file)) {
                artifact.sha256 = content_digest(&body);
                artifact.bytes = body.len();
            }
        }
    }
}
