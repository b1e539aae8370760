//! Queue and drive runs, streaming progress (`testsmith run`).

use std::sync::Arc;

use anyhow::Result;
use console::style;
use tokio::sync::broadcast;

use testsmith::config::Settings;
use testsmith::pipeline::db::RunStore;
use testsmith::pipeline::events::{BroadcastNotifier, ProgressEvent, RunEvent};
use testsmith::pipeline::models::{ExecutionMode, Preset, RunContext, RunRequest, RunStatus};
use testsmith::pipeline::sink::{FanoutSink, StateSink};
use testsmith::pipeline::{Pipeline, RunQueueManager};
use testsmith::services::build_collaborators;

const EVENT_BUFFER: usize = 256;

pub struct RunOptions {
    pub urls: Vec<String>,
    pub preset: Preset,
    pub headed: bool,
    pub story: Option<String>,
    pub no_heal: bool,
    pub max_heal_attempts: Option<u32>,
    pub max_concurrent: Option<usize>,
}

impl RunOptions {
    fn request(&self, url: &str, settings: &Settings) -> RunRequest {
        RunRequest {
            url: url.to_string(),
            mode: if self.headed {
                ExecutionMode::Headed
            } else {
                ExecutionMode::Headless
            },
            preset: self.preset,
            story: self.story.clone(),
            auto_heal: settings.healing.enabled && !self.no_heal,
            max_heal_attempts: self
                .max_heal_attempts
                .unwrap_or(settings.healing.max_attempts),
        }
    }
}

fn short_id(run_id: &str) -> &str {
    run_id.get(..8).unwrap_or(run_id)
}

fn styled_status(status: RunStatus) -> console::StyledObject<&'static str> {
    let s = style(status.as_str());
    match status {
        RunStatus::Completed => s.green().bold(),
        RunStatus::Failed => s.red().bold(),
        RunStatus::Cancelled => s.yellow().bold(),
        RunStatus::Queued | RunStatus::Running => s.dim(),
    }
}

fn render_event(msg: &RunEvent) -> Option<String> {
    let id = style(short_id(&msg.run_id)).cyan();
    let line = match &msg.event {
        ProgressEvent::RunQueued {
            position,
            estimated_wait_seconds,
        } => format!("{} queued at position {} (~{}s)", id, position, estimated_wait_seconds),
        ProgressEvent::RunStarted => format!("{} started", id),
        ProgressEvent::StageStarted { stage } => format!("{} {} ...", id, stage),
        ProgressEvent::StageCompleted { stage, degraded } => {
            if *degraded {
                format!("{} {} {}", id, stage, style("degraded (fallback used)").yellow())
            } else {
                format!("{} {} {}", id, stage, style("done").dim())
            }
        }
        ProgressEvent::TestsExecuted { summary } => format!(
            "{} tests: {} passed, {} failed, {} skipped",
            id,
            style(summary.passed).green(),
            style(summary.failed).red(),
            summary.skipped
        ),
        ProgressEvent::HealingAttempted {
            attempt,
            target,
            outcome,
        } => format!(
            "{} {} attempt {} on {}: {}",
            id,
            style("heal").magenta(),
            attempt,
            target,
            outcome
        ),
        ProgressEvent::RunFinished { status, .. } => {
            format!("{} finished: {}", id, styled_status(*status))
        }
        ProgressEvent::Log { level, message } if level != "debug" => {
            format!("{} {}", id, style(message).dim())
        }
        ProgressEvent::Log { .. } => return None,
    };
    Some(line)
}

async fn print_progress(mut rx: broadcast::Receiver<String>) {
    loop {
        match rx.recv().await {
            Ok(json) => {
                if let Ok(msg) = serde_json::from_str::<RunEvent>(&json)
                    && let Some(line) = render_event(&msg)
                {
                    println!("  {}", line);
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                println!("  {}", style(format!("({} progress events skipped)", n)).dim());
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn print_summary(runs: &[RunContext]) {
    println!();
    println!("{}", style("Summary").bold());
    for ctx in runs {
        let mut line = format!(
            "  {}  {:<9}  {}  passed {} failed {}",
            style(short_id(&ctx.run_id)).cyan(),
            styled_status(ctx.status),
            ctx.request.url,
            ctx.passed_test_count(),
            ctx.failed_test_count(),
        );
        if ctx.healing_attempts > 0 {
            line.push_str(&format!(
                "  heals {}{}",
                ctx.healing_attempts,
                if ctx.is_healed { " (healed)" } else { "" }
            ));
        }
        println!("{}", line);
        if let Some(err) = &ctx.error_message {
            println!("      {} {}", style("Error:").red().bold(), err);
        }
        if let Some(suite) = &ctx.suite {
            println!("      {}", style(suite.dir.display()).dim());
        }
    }
    println!();
}

pub async fn cmd_run(mut settings: Settings, options: RunOptions) -> Result<()> {
    if let Some(k) = options.max_concurrent {
        settings.queue.max_concurrent = k;
    }
    for warning in settings.validate()? {
        println!("{} {}", style("⚠").yellow(), warning);
    }

    let store = RunStore::open(&settings.store.path)?;
    let recovered = store.recover_interrupted().await?;
    if recovered > 0 {
        tracing::info!(recovered, "marked interrupted runs as failed");
    }

    let notifier = BroadcastNotifier::new(EVENT_BUFFER);
    let printer = tokio::spawn(print_progress(notifier.subscribe()));
    let sinks: Vec<Arc<dyn StateSink>> = vec![Arc::new(store), Arc::new(notifier)];
    let sink: Arc<dyn StateSink> = Arc::new(FanoutSink::new(sinks));

    let collaborators = build_collaborators(&settings, sink)?;
    let pipeline = Arc::new(Pipeline::new(collaborators, settings.pipeline_settings()));
    let queue = RunQueueManager::new(
        pipeline,
        settings.queue.max_concurrent,
        settings.average_run(),
    );

    println!();
    println!("{}", style("testsmith").bold().cyan());
    let mut run_ids = Vec::new();
    for url in &options.urls {
        let ticket = queue.enqueue(options.request(url, &settings)).await?;
        println!(
            "  {} {} (position {}, ~{}s wait)",
            style(short_id(&ticket.run_id)).cyan(),
            url,
            ticket.position,
            ticket.estimated_wait_seconds
        );
        run_ids.push(ticket.run_id);
    }
    println!();

    let interrupt = {
        let queue = queue.clone();
        let run_ids = run_ids.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                println!("{}", style("Interrupted, cancelling runs...").yellow());
                queue.shutdown().await;
                for id in &run_ids {
                    queue.cancel(id).await;
                }
            }
        })
    };

    let results = futures::future::join_all(run_ids.iter().map(|id| queue.wait(id))).await;
    interrupt.abort();
    printer.abort();

    let mut finished = Vec::new();
    for result in results {
        finished.push(result?);
    }
    print_summary(&finished);

    let incomplete = finished
        .iter()
        .filter(|ctx| ctx.status != RunStatus::Completed)
        .count();
    if incomplete > 0 {
        anyhow::bail!("{} of {} runs did not complete", incomplete, finished.len());
    }
    Ok(())
}
