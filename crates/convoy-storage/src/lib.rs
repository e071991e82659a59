//! PostgreSQL state store for convoy
//!
//! Seven tables hold the ground truth (runbooks, automation settings,
//! batches, members, phase/step/init executions); the [`Database`] facade
//! exposes CRUD plus the guarded-update primitives every concurrent handler
//! relies on. Schema migrations live in `migrations/` and also create the
//! bus tables consumed by `convoy-bus`.

pub mod models;
pub mod repositories;

pub use models::*;
pub use repositories::{retry_after, Database};
