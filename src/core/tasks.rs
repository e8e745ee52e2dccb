use std::sync::Arc;

use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use super::error::{EngineError, Result};
use super::store::{Store, now_iso};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    NotStarted,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::NotStarted => "not_started",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "not_started" => Some(TaskStatus::NotStarted),
            "in_progress" => Some(TaskStatus::InProgress),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    /// Terminal states accept re-entry so a retried task id can be observed
    /// and reported again once its history grows.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

fn parse_status(value: &str) -> Result<TaskStatus> {
    TaskStatus::parse(value).ok_or_else(|| EngineError::InvalidStatus(value.to_string()))
}

/// One audit entry. The first entry records creation; the list never shrinks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl HistoryEntry {
    fn new(status: Option<&str>, note: Option<&str>) -> Self {
        Self {
            timestamp: now_iso(),
            status: status.filter(|s| !s.is_empty()).map(str::to_string),
            note: note.filter(|n| !n.is_empty()).map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub owner: String,
    pub description: String,
    pub status: TaskStatus,
    pub created_at: String,
    pub updated_at: String,
    pub result: Option<String>,
    pub error: Option<String>,
    pub metadata: Map<String, Value>,
    pub history: Vec<HistoryEntry>,
}

impl TaskRecord {
    pub fn latest_entry(&self) -> Option<&HistoryEntry> {
        self.history.last()
    }
}

/// CRUD and status transitions over task records.
///
/// Every mutation is serialized through the store's connection mutex; reads
/// observe a consistent snapshot. No lock is held across external calls.
pub struct TaskManager {
    db: Arc<Mutex<Connection>>,
}

impl TaskManager {
    pub fn new(store: &Store) -> Self {
        Self { db: store.handle() }
    }

    /// Create a task in `not_started` with a one-entry history and return
    /// its generated id.
    pub async fn add_task(
        &self,
        owner: &str,
        description: &str,
        metadata: Option<Map<String, Value>>,
    ) -> Result<String> {
        if owner.is_empty() {
            return Err(EngineError::InvalidArgument(
                "owner must be provided".to_string(),
            ));
        }
        if description.is_empty() {
            return Err(EngineError::InvalidArgument(
                "description must be provided".to_string(),
            ));
        }

        let id = uuid::Uuid::new_v4().simple().to_string();
        let now = now_iso();
        let history = vec![HistoryEntry::new(
            Some(TaskStatus::NotStarted.as_str()),
            Some("Task created"),
        )];

        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO tasks (id, owner, description, status, created_at, updated_at, result, error, metadata, history)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5, NULL, NULL, ?6, ?7)",
            params![
                id,
                owner,
                description,
                TaskStatus::NotStarted.as_str(),
                now,
                serde_json::to_string(&metadata.unwrap_or_default())?,
                serde_json::to_string(&history)?,
            ],
        )?;
        Ok(id)
    }

    /// Transition a task to the named status, appending a history entry.
    ///
    /// `result`/`error` are only written when supplied; stale values from an
    /// earlier terminal attempt persist unless deliberately overwritten.
    /// The metadata patch is a shallow merge. An unrecognized status name
    /// fails before any mutation.
    pub async fn update_status(
        &self,
        task_id: &str,
        status: &str,
        note: Option<&str>,
        result: Option<&str>,
        error: Option<&str>,
        metadata_patch: Option<Map<String, Value>>,
    ) -> Result<()> {
        let status = parse_status(status)?;
        let db = self.db.lock().await;
        let mut record = load_record(&db, task_id)?
            .ok_or_else(|| EngineError::NotFound(format!("task {task_id}")))?;

        record.status = status;
        record.updated_at = now_iso();
        if let Some(result) = result {
            record.result = Some(result.to_string());
        }
        if let Some(error) = error {
            record.error = Some(error.to_string());
        }
        if let Some(patch) = metadata_patch {
            for (key, value) in patch {
                record.metadata.insert(key, value);
            }
        }
        record
            .history
            .push(HistoryEntry::new(Some(status.as_str()), note));

        write_record(&db, &record)
    }

    /// Append a free-form note without changing status. Empty notes are a
    /// no-op.
    pub async fn append_note(&self, task_id: &str, note: &str) -> Result<()> {
        if note.is_empty() {
            return Ok(());
        }
        let db = self.db.lock().await;
        let mut record = load_record(&db, task_id)?
            .ok_or_else(|| EngineError::NotFound(format!("task {task_id}")))?;
        record.updated_at = now_iso();
        record
            .history
            .push(HistoryEntry::new(Some(record.status.as_str()), Some(note)));
        write_record(&db, &record)
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        let db = self.db.lock().await;
        load_record(&db, task_id)
    }

    /// Snapshot of all tasks, optionally filtered by owner or status name.
    pub async fn list_tasks(
        &self,
        owner: Option<&str>,
        status: Option<&str>,
    ) -> Result<Vec<TaskRecord>> {
        let status = status.map(parse_status).transpose()?;
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT id, owner, description, status, created_at, updated_at, result, error, metadata, history
             FROM tasks ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map([], row_to_raw)?;
        let mut out = Vec::new();
        for row in rows {
            let record = parse_raw(row?)?;
            if let Some(owner) = owner {
                if record.owner != owner {
                    continue;
                }
            }
            if let Some(status) = status {
                if record.status != status {
                    continue;
                }
            }
            out.push(record);
        }
        Ok(out)
    }

    /// Latest history entry for a task, used for status queries and by the
    /// completion watcher.
    pub async fn latest_entry(&self, task_id: &str) -> Result<Option<HistoryEntry>> {
        Ok(self
            .get_task(task_id)
            .await?
            .and_then(|record| record.history.last().cloned()))
    }

    /// Current status of a task, if it exists.
    pub async fn task_status(&self, task_id: &str) -> Result<Option<TaskStatus>> {
        Ok(self.get_task(task_id).await?.map(|record| record.status))
    }

    /// Final output of a completed task, if any. Returns None for tasks in
    /// any other state.
    pub async fn task_result(&self, task_id: &str) -> Result<Option<String>> {
        Ok(self
            .get_task(task_id)
            .await?
            .filter(|record| record.status == TaskStatus::Completed)
            .and_then(|record| record.result))
    }

    /// Bulk cleanup: removes completed records only. Returns the number of
    /// rows deleted.
    pub async fn clear_completed(&self) -> Result<usize> {
        let db = self.db.lock().await;
        let deleted = db.execute(
            "DELETE FROM tasks WHERE status = ?1",
            params![TaskStatus::Completed.as_str()],
        )?;
        Ok(deleted)
    }
}

type RawTask = (
    String,
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    String,
    String,
);

fn row_to_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawTask> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
    ))
}

fn parse_raw(raw: RawTask) -> Result<TaskRecord> {
    let (id, owner, description, status, created_at, updated_at, result, error, metadata, history) =
        raw;
    Ok(TaskRecord {
        id,
        owner,
        description,
        status: parse_status(&status)?,
        created_at,
        updated_at,
        result,
        error,
        metadata: serde_json::from_str(&metadata)?,
        history: serde_json::from_str(&history)?,
    })
}

fn load_record(db: &Connection, task_id: &str) -> Result<Option<TaskRecord>> {
    let mut stmt = db.prepare(
        "SELECT id, owner, description, status, created_at, updated_at, result, error, metadata, history
         FROM tasks WHERE id = ?1 LIMIT 1",
    )?;
    let mut rows = stmt.query(params![task_id])?;
    if let Some(row) = rows.next()? {
        Ok(Some(parse_raw(row_to_raw(row)?)?))
    } else {
        Ok(None)
    }
}

fn write_record(db: &Connection, record: &TaskRecord) -> Result<()> {
    db.execute(
        "UPDATE tasks
         SET status = ?1, updated_at = ?2, result = ?3, error = ?4, metadata = ?5, history = ?6
         WHERE id = ?7",
        params![
            record.status.as_str(),
            record.updated_at,
            record.result,
            record.error,
            serde_json::to_string(&record.metadata)?,
            serde_json::to_string(&record.history)?,
            record.id,
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager() -> TaskManager {
        TaskManager::new(&Store::open_in_memory().unwrap())
    }

    #[tokio::test]
    async fn add_task_starts_not_started_with_one_history_entry() {
        let tasks = manager();
        let id = tasks.add_task("codex", "fix bug", None).await.unwrap();
        let record = tasks.get_task(&id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::NotStarted);
        assert_eq!(record.history.len(), 1);
        assert_eq!(record.history[0].status.as_deref(), Some("not_started"));
        assert_eq!(record.history[0].note.as_deref(), Some("Task created"));
    }

    #[tokio::test]
    async fn add_task_ids_are_unique() {
        let tasks = manager();
        let a = tasks.add_task("codex", "one", None).await.unwrap();
        let b = tasks.add_task("codex", "two", None).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn add_task_rejects_empty_fields() {
        let tasks = manager();
        assert!(matches!(
            tasks.add_task("", "desc", None).await,
            Err(EngineError::InvalidArgument(_))
        ));
        assert!(matches!(
            tasks.add_task("codex", "", None).await,
            Err(EngineError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn full_progression_records_three_history_entries() {
        let tasks = manager();
        let id = tasks.add_task("codex", "fix bug", None).await.unwrap();
        tasks
            .update_status(&id, "in_progress", Some("started"), None, None, None)
            .await
            .unwrap();
        tasks
            .update_status(&id, "completed", None, Some("done"), None, None)
            .await
            .unwrap();

        let record = tasks.get_task(&id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.result.as_deref(), Some("done"));
        assert_eq!(record.history.len(), 3);
    }

    #[tokio::test]
    async fn invalid_status_fails_without_mutation() {
        let tasks = manager();
        let id = tasks.add_task("codex", "task", None).await.unwrap();
        let err = tasks
            .update_status(&id, "paused", None, None, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidStatus(_)));
        let record = tasks.get_task(&id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::NotStarted);
        assert_eq!(record.history.len(), 1);
    }

    #[tokio::test]
    async fn update_unknown_task_is_not_found() {
        let tasks = manager();
        assert!(matches!(
            tasks
                .update_status("missing", "completed", None, None, None, None)
                .await,
            Err(EngineError::NotFound(_))
        ));
        assert!(matches!(
            tasks.append_note("missing", "note").await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn metadata_patch_is_shallow_merge() {
        let tasks = manager();
        let mut meta = Map::new();
        meta.insert("a".to_string(), json!({"nested": 1}));
        meta.insert("b".to_string(), json!(2));
        let id = tasks.add_task("codex", "task", Some(meta)).await.unwrap();

        let mut patch = Map::new();
        patch.insert("a".to_string(), json!({"other": 3}));
        patch.insert("c".to_string(), json!(4));
        tasks
            .update_status(&id, "in_progress", None, None, None, Some(patch))
            .await
            .unwrap();

        let record = tasks.get_task(&id).await.unwrap().unwrap();
        // shallow: "a" was replaced wholesale, not merged
        assert_eq!(record.metadata["a"], json!({"other": 3}));
        assert_eq!(record.metadata["b"], json!(2));
        assert_eq!(record.metadata["c"], json!(4));
    }

    #[tokio::test]
    async fn append_note_keeps_status_and_grows_history() {
        let tasks = manager();
        let id = tasks.add_task("codex", "task", None).await.unwrap();
        tasks.append_note(&id, "progress update").await.unwrap();
        let record = tasks.get_task(&id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::NotStarted);
        assert_eq!(record.history.len(), 2);
        assert_eq!(record.history[1].note.as_deref(), Some("progress update"));

        // empty note is a no-op
        tasks.append_note(&id, "").await.unwrap();
        let record = tasks.get_task(&id).await.unwrap().unwrap();
        assert_eq!(record.history.len(), 2);
    }

    #[tokio::test]
    async fn list_tasks_filters_by_owner_and_status() {
        let tasks = manager();
        let a = tasks.add_task("codex", "one", None).await.unwrap();
        tasks.add_task("git", "two", None).await.unwrap();
        tasks
            .update_status(&a, "completed", None, Some("ok"), None, None)
            .await
            .unwrap();

        assert_eq!(tasks.list_tasks(None, None).await.unwrap().len(), 2);
        assert_eq!(tasks.list_tasks(Some("codex"), None).await.unwrap().len(), 1);
        let completed = tasks.list_tasks(None, Some("completed")).await.unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].id, a);
        assert!(matches!(
            tasks.list_tasks(None, Some("bogus")).await,
            Err(EngineError::InvalidStatus(_))
        ));
    }

    #[tokio::test]
    async fn clear_completed_removes_only_completed() {
        let tasks = manager();
        let done = tasks.add_task("codex", "done", None).await.unwrap();
        let failed = tasks.add_task("codex", "broken", None).await.unwrap();
        tasks
            .update_status(&done, "completed", None, None, None, None)
            .await
            .unwrap();
        tasks
            .update_status(&failed, "failed", None, None, Some("boom"), None)
            .await
            .unwrap();

        assert_eq!(tasks.clear_completed().await.unwrap(), 1);
        assert!(tasks.get_task(&done).await.unwrap().is_none());
        assert!(tasks.get_task(&failed).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn task_result_only_for_completed() {
        let tasks = manager();
        let id = tasks.add_task("codex", "task", None).await.unwrap();
        assert_eq!(
            tasks.task_status(&id).await.unwrap(),
            Some(TaskStatus::NotStarted)
        );
        assert!(tasks.task_status("missing").await.unwrap().is_none());
        assert!(tasks.task_result(&id).await.unwrap().is_none());
        tasks
            .update_status(&id, "failed", None, None, Some("boom"), None)
            .await
            .unwrap();
        assert!(tasks.task_result(&id).await.unwrap().is_none());
        tasks
            .update_status(&id, "completed", None, Some("output"), None, None)
            .await
            .unwrap();
        assert_eq!(
            tasks.task_result(&id).await.unwrap().as_deref(),
            Some("output")
        );
    }

    #[tokio::test]
    async fn stale_error_persists_across_retry_unless_overwritten() {
        let tasks = manager();
        let id = tasks.add_task("codex", "task", None).await.unwrap();
        tasks
            .update_status(&id, "failed", None, None, Some("first failure"), None)
            .await
            .unwrap();
        tasks
            .update_status(&id, "completed", None, Some("recovered"), None, None)
            .await
            .unwrap();
        let record = tasks.get_task(&id).await.unwrap().unwrap();
        assert_eq!(record.result.as_deref(), Some("recovered"));
        // the earlier error is kept until a caller overwrites it deliberately
        assert_eq!(record.error.as_deref(), Some("first failure"));
    }
}
