//! # Convoy scheduler
//!
//! The periodic detection and timing engine. Each tick evaluates every
//! active runbook in isolation: runs its membership query, detects new
//! batches, diffs membership of existing ones, publishes `phase-due` for
//! due phases, and walks in-flight batches across runbook version
//! transitions. A cross-runbook sweep emits `poll-check` for polling steps.
//!
//! Exactly one scheduler runs at a time; singleton deployment is an
//! operational guarantee, not enforced here.

pub mod config;
pub mod detect;
pub mod scheduler;

pub use config::SchedulerConfig;
pub use detect::{group_rows, parse_batch_time, round_to_nearest_5m};
pub use scheduler::Scheduler;
