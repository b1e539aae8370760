//! Admission control over concurrently executing pipelines.
//!
//! Waiting runs sit in a FIFO. A single dispatcher task takes a semaphore
//! permit, pops the head and spawns a pipeline that holds the permit until
//! the run is terminal. While a run waits the queue owns its context. Once
//! dispatched the pipeline owns it and the queue keeps only the id and a
//! cancellation flag. Readers see contexts through `watch` channels.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::{Semaphore, watch};
use tracing::{debug, info, warn};

use super::events::ProgressEvent;
use super::machine::{CancellationFlag, Pipeline};
use super::models::{QueueSnapshot, QueueTicket, RunContext, RunId, RunRequest};
use super::sink::ContextDelta;
use crate::errors::QueueError;

struct QueueEntry {
    run_id: RunId,
    context: RunContext,
    enqueued_at: Instant,
    publisher: watch::Sender<RunContext>,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<QueueEntry>,
    active: HashMap<RunId, CancellationFlag>,
    dispatcher_running: bool,
    shut_down: bool,
}

struct Inner {
    max_concurrent: usize,
    average_run: Duration,
    semaphore: Arc<Semaphore>,
    state: Mutex<QueueState>,
    views: Mutex<HashMap<RunId, watch::Receiver<RunContext>>>,
    pipeline: Arc<Pipeline>,
}

impl Inner {
    fn state(&self) -> Result<MutexGuard<'_, QueueState>, QueueError> {
        self.state
            .lock()
            .map_err(|e| QueueError::Other(anyhow::anyhow!("queue lock poisoned: {}", e)))
    }

    fn views(&self) -> Result<MutexGuard<'_, HashMap<RunId, watch::Receiver<RunContext>>>, QueueError> {
        self.views
            .lock()
            .map_err(|e| QueueError::Other(anyhow::anyhow!("run view lock poisoned: {}", e)))
    }
}

/// Cheap to clone; all clones share one queue.
#[derive(Clone)]
pub struct RunQueueManager {
    inner: Arc<Inner>,
}

/// Linear wait estimate for a 1-based queue position.
pub fn estimate_wait(position: usize, average_run: Duration) -> u64 {
    (position.saturating_sub(1) as u64).saturating_mul(average_run.as_secs())
}

impl RunQueueManager {
    /// `max_concurrent` is clamped to at least 1.
    pub fn new(pipeline: Arc<Pipeline>, max_concurrent: usize, average_run: Duration) -> Self {
        let max_concurrent = max_concurrent.max(1);
        info!(max_concurrent, "run queue initialised");
        Self {
            inner: Arc::new(Inner {
                max_concurrent,
                average_run,
                semaphore: Arc::new(Semaphore::new(max_concurrent)),
                state: Mutex::new(QueueState::default()),
                views: Mutex::new(HashMap::new()),
                pipeline,
            }),
        }
    }

    /// Append a run and start the dispatcher if it is idle.
    pub async fn enqueue(&self, request: RunRequest) -> Result<QueueTicket, QueueError> {
        request.validate().map_err(QueueError::BadRequest)?;

        let run_id = uuid::Uuid::new_v4().to_string();
        let context = RunContext::new(run_id.clone(), request);
        let (publisher, view) = watch::channel(context.clone());
        let persisted = ContextDelta::from_context(&context);

        let (position, start_dispatcher) = {
            let mut state = self.inner.state()?;
            if state.shut_down {
                return Err(QueueError::ShutDown);
            }
            self.inner.views()?.insert(run_id.clone(), view);
            state.pending.push_back(QueueEntry {
                run_id: run_id.clone(),
                context,
                enqueued_at: Instant::now(),
                publisher,
            });
            let start = !state.dispatcher_running;
            state.dispatcher_running = true;
            (state.pending.len(), start)
        };

        if start_dispatcher {
            tokio::spawn(dispatch_loop(self.inner.clone()));
        }

        let ticket = QueueTicket {
            run_id: run_id.clone(),
            position,
            estimated_wait_seconds: estimate_wait(position, self.inner.average_run),
        };
        info!(run_id = %run_id, position, wait_secs = ticket.estimated_wait_seconds, "run queued");

        let sink = self.inner.pipeline.sink();
        sink.persist(&run_id, persisted).await;
        sink.notify(
            &run_id,
            ProgressEvent::RunQueued {
                position,
                estimated_wait_seconds: ticket.estimated_wait_seconds,
            },
        )
        .await;
        Ok(ticket)
    }

    /// Cancel a run. Queued runs are dropped without ever starting; running
    /// runs are flagged and stop once their current stage returns. Returns
    /// false for unknown or already-terminal runs: a run leaves the active
    /// set before its terminal context is published.
    pub async fn cancel(&self, run_id: &str) -> bool {
        let removed = {
            let Ok(mut state) = self.inner.state() else {
                return false;
            };
            match state.pending.iter().position(|e| e.run_id == run_id) {
                Some(idx) => state.pending.remove(idx),
                None => {
                    return match state.active.get(run_id) {
                        Some(flag) => {
                            flag.cancel();
                            info!(run_id, "running run flagged for cancellation");
                            true
                        }
                        None => false,
                    };
                }
            }
        };

        let Some(mut entry) = removed else {
            return false;
        };
        entry.context.cancel("cancelled while queued");
        entry.publisher.send_replace(entry.context.clone());
        info!(
            run_id,
            waited_ms = entry.enqueued_at.elapsed().as_millis() as u64,
            "queued run cancelled"
        );

        let sink = self.inner.pipeline.sink();
        sink.persist(run_id, ContextDelta::from_context(&entry.context)).await;
        sink.notify(
            run_id,
            ProgressEvent::RunFinished {
                status: entry.context.status,
                is_healed: false,
                error_message: entry.context.error_message.clone(),
            },
        )
        .await;
        true
    }

    pub fn status(&self) -> QueueSnapshot {
        match self.inner.state() {
            Ok(state) => {
                let mut active_run_ids: Vec<RunId> = state.active.keys().cloned().collect();
                active_run_ids.sort();
                QueueSnapshot {
                    max_concurrent: self.inner.max_concurrent,
                    active_count: state.active.len(),
                    queued_count: state.pending.len(),
                    dispatcher_running: state.dispatcher_running,
                    active_run_ids,
                }
            }
            Err(e) => {
                warn!(error = %e, "queue status unavailable");
                QueueSnapshot {
                    max_concurrent: self.inner.max_concurrent,
                    active_count: 0,
                    queued_count: 0,
                    dispatcher_running: false,
                    active_run_ids: Vec::new(),
                }
            }
        }
    }

    /// Current context of a run, as last published by its owner.
    pub fn context(&self, run_id: &str) -> Option<RunContext> {
        let views = self.inner.views().ok()?;
        views.get(run_id).map(|rx| rx.borrow().clone())
    }

    /// Wait until a run reaches a terminal status.
    pub async fn wait(&self, run_id: &str) -> Result<RunContext, QueueError> {
        let mut rx = {
            let views = self.inner.views()?;
            views.get(run_id).cloned().ok_or_else(|| QueueError::RunNotFound {
                run_id: run_id.to_string(),
            })?
        };
        let ctx = rx
            .wait_for(|c| c.is_terminal())
            .await
            .map_err(|_| QueueError::Other(anyhow::anyhow!("run {} lost its owner", run_id)))?;
        Ok(ctx.clone())
    }

    /// Stop admitting runs and cancel everything still waiting.
    pub async fn shutdown(&self) -> usize {
        let drained: Vec<RunId> = match self.inner.state() {
            Ok(mut state) => {
                state.shut_down = true;
                state.pending.iter().map(|e| e.run_id.clone()).collect()
            }
            Err(_) => Vec::new(),
        };
        let mut cancelled = 0;
        for run_id in drained {
            if self.cancel(&run_id).await {
                cancelled += 1;
            }
        }
        info!(cancelled, "run queue shut down");
        cancelled
    }
}

async fn dispatch_loop(inner: Arc<Inner>) {
    debug!("dispatcher started");
    loop {
        let permit = match inner.semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };

        let next = match inner.state() {
            Ok(mut state) => match state.pending.pop_front() {
                Some(entry) => {
                    let flag = CancellationFlag::new();
                    state.active.insert(entry.run_id.clone(), flag.clone());
                    Some((entry, flag))
                }
                None => {
                    state.dispatcher_running = false;
                    None
                }
            },
            Err(e) => {
                warn!(error = %e, "dispatcher stopping");
                None
            }
        };
        let Some((entry, flag)) = next else {
            break;
        };

        debug!(run_id = %entry.run_id, "dispatching run");
        let inner = inner.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let QueueEntry {
                run_id,
                context,
                publisher,
                ..
            } = entry;
            // Leave the active set before readers can see the terminal
            // context, so `wait` never returns while the run still counts.
            let publish = |ctx: &RunContext| {
                if ctx.is_terminal() {
                    match inner.state() {
                        Ok(mut state) => {
                            state.active.remove(&run_id);
                        }
                        Err(e) => warn!(run_id = %run_id, error = %e, "could not release active slot"),
                    }
                }
                publisher.send_replace(ctx.clone());
            };
            inner.pipeline.drive(context, &flag, &publish).await;
        });
    }
    debug!("dispatcher idle");
}
