//! Run pipeline: discovery to healed test suite.
//!
//! ## Overview
//!
//! A run takes a URL through five generation stages and an optional
//! healing loop. Runs are admitted by a bounded FIFO queue, threaded
//! through a state machine, and report progress to a State Sink.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐ enqueue ┌─────────────────────────────────────────────────┐
//! │  caller  │ ──────> │  queue.rs  (RunQueueManager, semaphore + FIFO)  │
//! │  (CLI)   │ <────── │         │                                       │
//! └──────────┘  wait   │         │ Pipeline::drive()                     │
//!                      │         v                                       │
//!                      │  machine.rs  (PipelineState, next_state)        │
//!                      │         │                                       │
//!                      │         │ one stage per state                   │
//!                      │         v                                       │
//!                      │  stages.rs   (fallbacks per stage)              │
//!                      │  healing.rs  (HealingLoop, assess_rerun)        │
//!                      │         │                                       │
//!                      │         v                                       │
//!                      │  patch.rs    (Snapshot, apply_with_rollback)    │
//!                      └─────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module          | Responsibility                                        |
//! |-----------------|-------------------------------------------------------|
//! | `models`        | `RunContext`, `RunRequest`, stage artifacts           |
//! | `collaborators` | Traits for discovery, generation and execution        |
//! | `sink`          | `StateSink` trait, `ContextDelta`, fan-out and memory |
//! | `events`        | `ProgressEvent` + `broadcast_message()` helper        |
//! | `db`            | SQLite run store via `DbHandle`                       |

pub mod collaborators;
pub mod db;
pub mod events;
pub mod healing;
pub mod machine;
pub mod models;
pub mod patch;
pub mod queue;
pub mod sink;
pub mod stages;

pub use collaborators::Collaborators;
pub use machine::{Pipeline, PipelineSettings, PipelineState};
pub use models::{RunContext, RunRequest, RunStatus};
pub use queue::RunQueueManager;
