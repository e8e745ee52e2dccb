pub mod dispatch;
pub mod error;
pub mod events;
pub mod metrics;
pub mod sessions;
pub mod store;
pub mod tasks;
pub mod watcher;
