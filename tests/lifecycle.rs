//! End-to-end flow: dispatch through worker completion, background
//! watching, and coalesced notification.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;

use taskwarden::core::metrics::MetricsEngine;
use taskwarden::core::sessions::SessionStore;
use taskwarden::core::tasks::TaskManager;
use taskwarden::core::watcher::TaskWatcher;
use taskwarden::{
    CompletionBus, CompletionEvent, Dispatcher, Notifier, Store, TaskStatus, Worker, WorkerOutput,
    batch_summary,
};

struct EchoWorker;

#[async_trait]
impl Worker for EchoWorker {
    async fn execute(&self, prompt: &str) -> anyhow::Result<WorkerOutput> {
        Ok(WorkerOutput {
            output: format!("handled: {prompt}"),
            raw: json!({"usage": {"delta_tokens": 10}}),
        })
    }
}

struct CollectingNotifier {
    tx: mpsc::UnboundedSender<Vec<CompletionEvent>>,
}

#[async_trait]
impl Notifier for CollectingNotifier {
    async fn notify(&self, batch: Vec<CompletionEvent>) -> anyhow::Result<()> {
        self.tx.send(batch)?;
        Ok(())
    }
}

#[tokio::test]
async fn dispatch_watch_notify_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path().join("engine.db")).unwrap();
    let tasks = Arc::new(TaskManager::new(&store));
    let sessions = Arc::new(SessionStore::new(&store));
    let metrics = Arc::new(MetricsEngine::new(sessions.clone()));
    let dispatcher = Arc::new(Dispatcher::new(
        tasks.clone(),
        metrics,
        Arc::new(EchoWorker),
        "codex",
    ));

    sessions.ensure_session("s1", Some("main")).await.unwrap();

    // finished before the watcher ever runs: must never be announced
    let pre_existing = tasks.add_task("codex", "old work", None).await.unwrap();
    tasks
        .update_status(&pre_existing, "completed", None, Some("stale"), None, None)
        .await
        .unwrap();

    let mut bus = CompletionBus::new();
    let (batch_tx, mut batch_rx) = mpsc::unbounded_channel();
    bus.start(Arc::new(CollectingNotifier { tx: batch_tx }));

    let mut watcher =
        TaskWatcher::new(tasks.clone(), bus.sender()).with_interval(Duration::from_millis(25));
    watcher.start();
    // give the bootstrap tick time to seed the pre-existing signature
    tokio::time::sleep(Duration::from_millis(80)).await;

    let first = dispatcher.submit("s1", "fix the parser").await.unwrap();
    let second = dispatcher.submit("s1", "update the docs").await.unwrap();
    dispatcher.wait_for(&first).await;
    dispatcher.wait_for(&second).await;

    let mut events = Vec::new();
    while events.len() < 2 {
        let batch = timeout(Duration::from_secs(5), batch_rx.recv())
            .await
            .expect("watcher should report both completions")
            .expect("bus should stay open");
        events.extend(batch);
    }
    watcher.stop();
    bus.stop();

    assert_eq!(events.len(), 2, "each completion is announced exactly once");
    assert!(events.iter().all(|event| event.task_id != pre_existing));
    assert!(events.iter().all(|event| event.status == TaskStatus::Completed));
    let ids: Vec<&str> = events.iter().map(|event| event.task_id.as_str()).collect();
    assert!(ids.contains(&first.as_str()));
    assert!(ids.contains(&second.as_str()));

    let summary = batch_summary(&tasks, &events).await;
    assert!(summary.contains("handled: fix the parser"));
    assert!(summary.contains("from codex completed"));

    // telemetry accumulated across both tasks
    let session_metrics = sessions.get_metrics("s1").await.unwrap().unwrap();
    assert_eq!(session_metrics["token_usage"]["total_tokens"], 20);
    assert_eq!(session_metrics["last_task_tokens"], 10);
    let session = sessions.get_session("s1").await.unwrap().unwrap();
    assert_eq!(session.metadata["tasks"].as_array().unwrap().len(), 2);

    // no further announcements once everything is seen
    match timeout(Duration::from_millis(150), batch_rx.recv()).await {
        Err(_) | Ok(None) => {}
        Ok(Some(batch)) => panic!("unexpected extra batch: {batch:?}"),
    }
}
