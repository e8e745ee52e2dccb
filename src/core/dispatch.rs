use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::error::Result;
use super::metrics::MetricsEngine;
use super::tasks::TaskManager;

const RAW_PREVIEW_MAX_CHARS: usize = 500;

/// Output of one worker execution: the text to report plus the raw
/// structured payload the metrics engine mines for usage signals.
#[derive(Debug, Clone)]
pub struct WorkerOutput {
    pub output: String,
    pub raw: Value,
}

/// External executor of delegated prompts. May take arbitrarily long;
/// a returned error becomes a `failed` task transition.
#[async_trait]
pub trait Worker: Send + Sync {
    async fn execute(&self, prompt: &str) -> anyhow::Result<WorkerOutput>;
}

/// Thin orchestration over TaskManager, the worker, and the metrics
/// engine: create the record, hand the prompt to the worker outside any
/// lock, and fold the outcome back into the record and the session.
pub struct Dispatcher {
    tasks: Arc<TaskManager>,
    metrics: Arc<MetricsEngine>,
    worker: Arc<dyn Worker>,
    worker_name: String,
    running: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl Dispatcher {
    pub fn new(
        tasks: Arc<TaskManager>,
        metrics: Arc<MetricsEngine>,
        worker: Arc<dyn Worker>,
        worker_name: impl Into<String>,
    ) -> Self {
        Self {
            tasks,
            metrics,
            worker,
            worker_name: worker_name.into(),
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Create a task for the prompt, mark it dispatched, and run the
    /// worker in the background. Returns the task id immediately.
    pub async fn submit(&self, session_id: &str, prompt: &str) -> Result<String> {
        let task_id = self
            .tasks
            .add_task(&self.worker_name, prompt, None)
            .await?;
        self.tasks
            .update_status(
                &task_id,
                "in_progress",
                Some("Task dispatched to worker"),
                None,
                None,
                None,
            )
            .await?;
        info!("Dispatched task {task_id} for session {session_id}");

        let tasks = self.tasks.clone();
        let metrics = self.metrics.clone();
        let worker = self.worker.clone();
        let running = self.running.clone();
        let id = task_id.clone();
        let session = session_id.to_string();
        let prompt = prompt.to_string();

        // insert under the same lock the bookkeeping task removes under,
        // so a fast completion cannot race its own registration
        let mut handles = self.running.lock().await;
        let handle = tokio::spawn(async move {
            let inner = {
                let tasks = tasks.clone();
                let id = id.clone();
                tokio::spawn(
                    async move { run_task(tasks, metrics, worker, &id, &session, &prompt).await },
                )
            };
            if let Err(join_error) = inner.await {
                warn!("Worker task for {id} aborted: {join_error}");
                let error = format!("worker task aborted: {join_error}");
                if let Err(store_error) = tasks
                    .update_status(&id, "failed", None, None, Some(&error), None)
                    .await
                {
                    warn!("Failed to record aborted task {id}: {store_error}");
                }
            }
            running.lock().await.remove(&id);
        });
        handles.insert(task_id.clone(), handle);
        Ok(task_id)
    }

    /// Await the background completion of a submitted task. Mostly useful
    /// in tests and shutdown paths; unknown ids and tasks that already
    /// finished return immediately.
    pub async fn wait_for(&self, task_id: &str) {
        let handle = self.running.lock().await.remove(task_id);
        if let Some(handle) = handle {
            if let Err(error) = handle.await {
                warn!("Completion handler for {task_id} aborted: {error}");
            }
        }
    }
}

/// Run the worker and fold its outcome back into the task record and the
/// session telemetry. Store errors are logged; the background path never
/// propagates them.
async fn run_task(
    tasks: Arc<TaskManager>,
    metrics: Arc<MetricsEngine>,
    worker: Arc<dyn Worker>,
    task_id: &str,
    session_id: &str,
    prompt: &str,
) {
    match worker.execute(prompt).await {
        Ok(output) => {
            let mut metadata = Map::new();
            metadata.insert(
                "raw_result_preview".to_string(),
                json!(clip(&output.output, RAW_PREVIEW_MAX_CHARS)),
            );
            if let Err(error) = tasks
                .update_status(
                    task_id,
                    "completed",
                    Some("Worker finished"),
                    Some(&output.output),
                    None,
                    Some(metadata),
                )
                .await
            {
                warn!("Failed to mark task {task_id} completed: {error}");
            }
            let warning = metrics
                .record_activity(session_id, prompt, &output.output, &output.raw, "task")
                .await;
            if let Some(warning) = warning {
                if let Err(error) = tasks.append_note(task_id, &warning).await {
                    warn!("Failed to append usage warning to task {task_id}: {error}");
                }
            }
        }
        Err(worker_error) => {
            let error = format!("{worker_error:#}");
            warn!("Task {task_id} failed: {error}");
            if let Err(store_error) = tasks
                .update_status(task_id, "failed", None, None, Some(&error), None)
                .await
            {
                warn!("Failed to mark task {task_id} failed: {store_error}");
            }
        }
    }
}

fn clip(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        text.chars().take(max_chars).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::EngineError;
    use crate::core::sessions::SessionStore;
    use crate::core::store::Store;
    use crate::core::tasks::TaskStatus;

    struct ScriptedWorker {
        output: String,
        raw: Value,
    }

    #[async_trait]
    impl Worker for ScriptedWorker {
        async fn execute(&self, _prompt: &str) -> anyhow::Result<WorkerOutput> {
            Ok(WorkerOutput {
                output: self.output.clone(),
                raw: self.raw.clone(),
            })
        }
    }

    struct FailingWorker;

    #[async_trait]
    impl Worker for FailingWorker {
        async fn execute(&self, _prompt: &str) -> anyhow::Result<WorkerOutput> {
            anyhow::bail!("backend unavailable")
        }
    }

    struct PanickingWorker;

    #[async_trait]
    impl Worker for PanickingWorker {
        async fn execute(&self, _prompt: &str) -> anyhow::Result<WorkerOutput> {
            panic!("worker blew up")
        }
    }

    fn dispatcher(worker: Arc<dyn Worker>) -> (Arc<Dispatcher>, Arc<SessionStore>) {
        let store = Store::open_in_memory().unwrap();
        let tasks = Arc::new(TaskManager::new(&store));
        let sessions = Arc::new(SessionStore::new(&store));
        let metrics = Arc::new(MetricsEngine::new(sessions.clone()));
        (
            Arc::new(Dispatcher::new(tasks, metrics, worker, "codex")),
            sessions,
        )
    }

    #[tokio::test]
    async fn successful_run_completes_task_and_records_metrics() {
        let worker = Arc::new(ScriptedWorker {
            output: "all done".to_string(),
            raw: json!({"usage": {"delta_tokens": 11}}),
        });
        let (dispatcher, sessions) = dispatcher(worker);

        let id = dispatcher.submit("s1", "fix the bug").await.unwrap();
        dispatcher.wait_for(&id).await;

        let record = dispatcher.tasks.get_task(&id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.result.as_deref(), Some("all done"));
        assert_eq!(record.owner, "codex");
        assert_eq!(record.metadata["raw_result_preview"], json!("all done"));

        let metrics = sessions.get_metrics("s1").await.unwrap().unwrap();
        assert_eq!(metrics["last_task_tokens"], 11);
        assert_eq!(metrics["token_usage"]["total_tokens"], 11);
        let session = sessions.get_session("s1").await.unwrap().unwrap();
        assert_eq!(session.metadata["tasks"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn worker_error_marks_task_failed() {
        let (dispatcher, _) = dispatcher(Arc::new(FailingWorker));
        let id = dispatcher.submit("s1", "doomed").await.unwrap();
        dispatcher.wait_for(&id).await;

        let record = dispatcher.tasks.get_task(&id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert!(record.error.as_deref().unwrap().contains("backend unavailable"));
    }

    #[tokio::test]
    async fn worker_panic_marks_task_failed() {
        let (dispatcher, _) = dispatcher(Arc::new(PanickingWorker));
        let id = dispatcher.submit("s1", "kaboom").await.unwrap();
        dispatcher.wait_for(&id).await;

        let record = dispatcher.tasks.get_task(&id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert!(record.error.as_deref().unwrap().contains("aborted"));
    }

    #[tokio::test]
    async fn crossing_threshold_appends_warning_note() {
        let worker = Arc::new(ScriptedWorker {
            output: "done".to_string(),
            raw: json!({"usage": {"five_hour": {"used": 85, "limit": 100}, "delta_tokens": 85}}),
        });
        let (dispatcher, _) = dispatcher(worker);

        let id = dispatcher.submit("s1", "big job").await.unwrap();
        dispatcher.wait_for(&id).await;

        let record = dispatcher.tasks.get_task(&id).await.unwrap().unwrap();
        let note = record
            .history
            .iter()
            .filter_map(|entry| entry.note.as_deref())
            .find(|note| note.starts_with("Warning:"))
            .unwrap();
        assert!(note.contains("5-hour"));
    }

    #[tokio::test]
    async fn fire_and_forget_submission_does_not_retain_handles() {
        let worker = Arc::new(ScriptedWorker {
            output: "done".to_string(),
            raw: json!({}),
        });
        let (dispatcher, _) = dispatcher(worker);

        // never call wait_for: the bookkeeping task cleans up after itself
        let id = dispatcher.submit("s1", "quick job").await.unwrap();
        for _ in 0..400 {
            let completed = dispatcher.tasks.task_status(&id).await.unwrap()
                == Some(TaskStatus::Completed);
            if completed && dispatcher.running.lock().await.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(
            dispatcher.tasks.task_status(&id).await.unwrap(),
            Some(TaskStatus::Completed)
        );
        assert!(dispatcher.running.lock().await.is_empty());
    }

    #[tokio::test]
    async fn submit_rejects_empty_prompt() {
        let (dispatcher, _) = dispatcher(Arc::new(FailingWorker));
        assert!(matches!(
            dispatcher.submit("s1", "").await,
            Err(EngineError::InvalidArgument(_))
        ));
    }
}
