//! Task coordination and session telemetry engine.
//!
//! Coordinates long-running tasks delegated to an external [`Worker`],
//! tracks their lifecycle in a SQLite-backed record store, maintains
//! per-session usage telemetry, and delivers at most one user-facing
//! notification per terminal task observation, coalesced into batches.
//!
//! Wiring order: open a [`Store`], build [`TaskManager`] /
//! [`SessionStore`] / [`MetricsEngine`] over it, hand a [`CompletionBus`]
//! sender to a [`TaskWatcher`], and drive submissions through a
//! [`Dispatcher`].

pub mod core;
pub mod logging;

pub use crate::core::dispatch::{Dispatcher, Worker, WorkerOutput};
pub use crate::core::error::EngineError;
pub use crate::core::events::{CompletionBus, CompletionEvent, Notifier, batch_summary};
pub use crate::core::metrics::{MetricsEngine, format_rate_limit_status, format_usage_summary};
pub use crate::core::sessions::{SessionRecord, SessionStore};
pub use crate::core::store::Store;
pub use crate::core::tasks::{HistoryEntry, TaskManager, TaskRecord, TaskStatus};
pub use crate::core::watcher::TaskWatcher;
pub use crate::logging::init_logging;
