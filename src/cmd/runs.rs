//! Stored run inspection (`testsmith runs`).

use anyhow::{Context, Result};
use console::style;

use testsmith::config::Settings;
use testsmith::pipeline::db::{RunRecord, RunStore};
use testsmith::pipeline::events::ProgressEvent;

use super::super::RunsCommands;

fn status_cell(record: &RunRecord) -> String {
    let s = style(record.status.as_str());
    let s = match record.status.as_str() {
        "completed" => s.green(),
        "failed" => s.red(),
        "cancelled" => s.yellow(),
        _ => s.dim(),
    };
    s.to_string()
}

async fn find_run(store: &RunStore, id_or_prefix: &str) -> Result<RunRecord> {
    if let Some(record) = store.get_run(id_or_prefix).await? {
        return Ok(record);
    }
    let matches: Vec<RunRecord> = store
        .list_runs(usize::MAX >> 1)
        .await?
        .into_iter()
        .filter(|r| r.run_id.starts_with(id_or_prefix))
        .collect();
    match matches.len() {
        0 => anyhow::bail!("No run matching '{}'", id_or_prefix),
        1 => Ok(matches.into_iter().next().context("run vanished")?),
        n => anyhow::bail!("'{}' is ambiguous ({} runs match)", id_or_prefix, n),
    }
}

pub async fn cmd_runs(settings: &Settings, command: RunsCommands) -> Result<()> {
    let path = &settings.store.path;
    if !path.exists() {
        println!("No runs recorded yet ({} does not exist).", path.display());
        return Ok(());
    }
    let store = RunStore::open(path)?;

    match command {
        RunsCommands::List { limit } => {
            let runs = store.list_runs(limit).await?;
            if runs.is_empty() {
                println!("No runs recorded yet.");
                return Ok(());
            }
            println!();
            for run in &runs {
                println!(
                    "  {}  {:<20}  {:<10}  heals {}{}  {}",
                    style(&run.run_id).cyan(),
                    run.created_at,
                    status_cell(run),
                    run.healing_attempts,
                    if run.is_healed { " (healed)" } else { "" },
                    run.url
                );
            }
            println!();
        }
        RunsCommands::Show { run_id } => {
            let run = find_run(&store, &run_id).await?;
            println!();
            println!("{} {}", style("Run").bold(), style(&run.run_id).cyan());
            println!("  url:       {}", run.url);
            println!("  status:    {}", status_cell(&run));
            println!("  phase:     {}", run.phase);
            if let Some(source) = &run.story_source {
                println!("  story:     {}", source);
            }
            if let (Some(pages), Some(elements)) = (run.pages_count, run.elements_count) {
                println!("  discovery: {} pages, {} elements", pages, elements);
            }
            println!(
                "  healing:   {} attempts{}",
                run.healing_attempts,
                if run.is_healed { ", healed" } else { "" }
            );
            if let Some(err) = &run.error_message {
                println!("  {} {}", style("error:").red().bold(), err);
            }
            if let Some(ctx) = &run.context {
                if let Some(exec) = &ctx.execution {
                    let s = exec.summary;
                    println!(
                        "  tests:     {} total, {} passed, {} failed, {} skipped",
                        s.total, s.passed, s.failed, s.skipped
                    );
                }
                for attempt in &ctx.healing_log {
                    println!(
                        "    attempt {}: {} ({:.2}) -> {:?}",
                        attempt.attempt,
                        attempt.suggestion.target.display(),
                        attempt.suggestion.confidence,
                        attempt.patch
                    );
                }
            }

            let run_id = run.run_id.clone();
            let events = store.handle().call(move |db| db.list_events(&run_id)).await?;
            if !events.is_empty() {
                println!();
                println!("{}", style("Events").bold());
                for ev in events {
                    let detail = serde_json::from_str::<ProgressEvent>(&ev.payload)
                        .ok()
                        .and_then(|e| serde_json::to_value(e).ok())
                        .and_then(|v| v.get("data").map(|d| d.to_string()))
                        .unwrap_or_default();
                    println!(
                        "  {}  {:<16} {}",
                        style(&ev.created_at).dim(),
                        ev.event_type,
                        detail
                    );
                }
            }
            println!();
        }
    }

    Ok(())
}
