use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::EngineError;
use super::events::{CompletionEvent, condense_preview};
use super::tasks::{TaskManager, TaskRecord};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

type ErrorCallback = Arc<dyn Fn(&EngineError) + Send + Sync>;

/// Signature of a terminal observation. A change in status, terminal
/// timestamp, or history length marks a *new* observation worth reporting.
fn completion_signature(record: &TaskRecord) -> String {
    let timestamp = record
        .latest_entry()
        .map(|entry| entry.timestamp.as_str())
        .unwrap_or("unknown");
    format!(
        "{}|{}|{}",
        record.status.as_str(),
        timestamp,
        record.history.len()
    )
}

/// One polling pass over a task snapshot. Terminal tasks whose signature
/// differs from the last-seen baseline produce an event and become the new
/// baseline. On the bootstrap pass signatures are seeded without emitting,
/// so tasks already finished before the watcher started are not re-announced.
pub fn scan_tasks(
    records: &[TaskRecord],
    seen: &mut HashMap<String, String>,
    bootstrap: bool,
) -> Vec<CompletionEvent> {
    let mut events = Vec::new();
    for record in records {
        if !record.status.is_terminal() {
            continue;
        }
        let signature = completion_signature(record);
        let known = seen.get(&record.id) == Some(&signature);
        seen.insert(record.id.clone(), signature);
        if known || bootstrap {
            continue;
        }
        events.push(CompletionEvent {
            task_id: record.id.clone(),
            status: record.status,
            timestamp: record.latest_entry().map(|entry| entry.timestamp.clone()),
            result_preview: record.result.as_deref().map(condense_preview),
        });
    }
    events
}

/// Periodic poller that turns terminal task transitions into completion
/// events.
///
/// The signature map is owned by the polling task; there is no shared
/// global state. Tick errors go to the registered callback (or a log line)
/// and never stop the loop.
pub struct TaskWatcher {
    tasks: Arc<TaskManager>,
    events: mpsc::UnboundedSender<CompletionEvent>,
    interval: Duration,
    on_error: Option<ErrorCallback>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl TaskWatcher {
    pub fn new(tasks: Arc<TaskManager>, events: mpsc::UnboundedSender<CompletionEvent>) -> Self {
        Self {
            tasks,
            events,
            interval: DEFAULT_POLL_INTERVAL,
            on_error: None,
            cancel: CancellationToken::new(),
            handle: None,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&EngineError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }

    /// Spawn the polling loop. Idempotent: a second call while running is a
    /// no-op. The first tick is the bootstrap pass and emits nothing.
    pub fn start(&mut self) {
        if self.handle.is_some() {
            return;
        }
        let tasks = self.tasks.clone();
        let events = self.events.clone();
        let on_error = self.on_error.clone();
        let cancel = self.cancel.clone();
        let interval = self.interval;

        self.handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut seen: HashMap<String, String> = HashMap::new();
            let mut bootstrap = true;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                match tasks.list_tasks(None, None).await {
                    Ok(records) => {
                        for event in scan_tasks(&records, &mut seen, bootstrap) {
                            debug!("Task {} reached {}", event.task_id, event.status.as_str());
                            if events.send(event).is_err() {
                                // no consumer left; nothing to report to
                                return;
                            }
                        }
                    }
                    Err(error) => match &on_error {
                        Some(callback) => callback(&error),
                        None => warn!("Task poll failed: {error}"),
                    },
                }
                // one pass is enough to seed, even a failed one
                bootstrap = false;
            }
        }));
    }

    /// Cancel the polling loop without waiting for an in-flight tick.
    /// Idempotent.
    pub fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for TaskWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
