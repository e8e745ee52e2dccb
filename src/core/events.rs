use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::tasks::{TaskManager, TaskStatus};

const PREVIEW_MAX_CHARS: usize = 360;

/// One observed terminal transition, handed from the watcher to the
/// notification consumer.
#[derive(Debug, Clone)]
pub struct CompletionEvent {
    pub task_id: String,
    pub status: TaskStatus,
    pub timestamp: Option<String>,
    pub result_preview: Option<String>,
}

/// Sink for completion batches. Failures are logged and never fatal.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, batch: Vec<CompletionEvent>) -> anyhow::Result<()>;
}

/// Single-consumer coalescing queue over an unbounded channel.
///
/// Producers hand events off without blocking. The consumer waits for the
/// first event, drains whatever else is already queued, and invokes the
/// notifier once per batch, so several tasks finishing within one polling
/// interval produce a single consolidated notification. Events sent before
/// the consumer starts sit in the channel and are delivered once it does.
pub struct CompletionBus {
    tx: mpsc::UnboundedSender<CompletionEvent>,
    rx: Option<mpsc::UnboundedReceiver<CompletionEvent>>,
    cancel: CancellationToken,
    consumer: Option<JoinHandle<()>>,
}

impl CompletionBus {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Some(rx),
            cancel: CancellationToken::new(),
            consumer: None,
        }
    }

    /// Producer handle. Sends never block; an event sent after the bus is
    /// dropped is silently discarded.
    pub fn sender(&self) -> mpsc::UnboundedSender<CompletionEvent> {
        self.tx.clone()
    }

    /// Spawn the consumer task. Idempotent: a second call is a no-op.
    pub fn start(&mut self, notifier: Arc<dyn Notifier>) {
        let Some(mut rx) = self.rx.take() else {
            return;
        };
        let cancel = self.cancel.clone();
        self.consumer = Some(tokio::spawn(async move {
            loop {
                let first = tokio::select! {
                    _ = cancel.cancelled() => return,
                    event = rx.recv() => match event {
                        Some(event) => event,
                        None => return,
                    },
                };

                let mut batch = vec![first];
                while let Ok(event) = rx.try_recv() {
                    batch.push(event);
                }
                debug!("Delivering completion batch of {}", batch.len());

                // cancellation abandons the batch rather than flushing it
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    result = notifier.notify(batch) => {
                        if let Err(error) = result {
                            warn!("Completion notifier failed: {error:#}");
                        }
                    }
                }
            }
        }));
    }

    /// Stop the consumer. Idempotent; does not wait for an in-flight
    /// notification.
    pub fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(consumer) = self.consumer.take() {
            consumer.abort();
        }
    }
}

impl Default for CompletionBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CompletionBus {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Collapse whitespace and cap the text for inclusion in a notification.
pub fn condense_preview(text: &str) -> String {
    let condensed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if condensed.chars().count() <= PREVIEW_MAX_CHARS {
        return condensed;
    }
    let clipped: String = condensed.chars().take(PREVIEW_MAX_CHARS).collect();
    format!("{clipped}...")
}

/// Render one consolidated human-readable update for a batch, looking up
/// each task's owner and error detail from the record store.
pub async fn batch_summary(tasks: &TaskManager, batch: &[CompletionEvent]) -> String {
    let mut lines = Vec::new();
    for event in batch {
        let record = match tasks.get_task(&event.task_id).await {
            Ok(record) => record,
            Err(error) => {
                warn!("Failed to load task {} for summary: {error}", event.task_id);
                None
            }
        };
        let owner = record
            .as_ref()
            .map(|r| r.owner.clone())
            .unwrap_or_else(|| "unknown".to_string());

        let phrase = match event.status {
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::NotStarted | TaskStatus::InProgress => "changed status",
        };
        let detail = match event.status {
            TaskStatus::Failed => record
                .as_ref()
                .and_then(|r| r.error.as_deref())
                .map(condense_preview),
            _ => event
                .result_preview
                .as_deref()
                .or(record.as_ref().and_then(|r| r.result.as_deref()))
                .map(condense_preview),
        };

        let mut line = format!("Task {} from {owner} {phrase}", event.task_id);
        if let Some(timestamp) = &event.timestamp {
            line.push_str(&format!(" at {timestamp}"));
        }
        match detail.filter(|d| !d.is_empty()) {
            Some(detail) => line.push_str(&format!(": {detail}")),
            None => line.push('.'),
        }
        lines.push(line);
    }
    lines.join("\n")
}
