use std::sync::Arc;

use rusqlite::{Connection, params};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::warn;

use super::error::Result;
use super::store::{Store, now_iso};

pub const USAGE_WINDOWS: [&str; 2] = ["five_hour", "weekly"];

pub fn default_metrics() -> Value {
    json!({
        "token_usage": {
            "total_tokens": 0,
            "five_hour": { "used": 0, "limit": null, "remaining": null, "last_updated": null },
            "weekly":    { "used": 0, "limit": null, "remaining": null, "last_updated": null },
            "warnings":  { "five_hour": [], "weekly": [] },
        },
        "last_task_tokens": 0,
        "rate_limits": {},
    })
}

pub fn default_settings() -> Value {
    json!({
        "approval_policy": "never",
        "model": "default",
    })
}

fn default_metadata() -> Value {
    json!({
        "tasks": [],
        "metrics": default_metrics(),
        "settings": default_settings(),
    })
}

/// Recursively merge `updates` into `target`: nested objects merge
/// key-by-key, every other value overwrites.
pub fn deep_merge(target: &mut Value, updates: &Value) {
    match (target, updates) {
        (Value::Object(target), Value::Object(updates)) => {
            for (key, value) in updates {
                match target.get_mut(key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        deep_merge(existing, value);
                    }
                    _ => {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, updates) => *target = updates.clone(),
    }
}

/// Normalize session metadata to the canonical shape. Usage payloads arrive
/// with inconsistent shapes, so every read path back-fills absent or
/// ill-typed fields; callers never need null-checks on
/// `metrics.token_usage.*`.
fn normalize_metadata(metadata: &mut Value) {
    let Value::Object(map) = metadata else {
        *metadata = default_metadata();
        return;
    };

    if !map.get("tasks").is_some_and(Value::is_array) {
        map.insert("tasks".to_string(), json!([]));
    }

    let metrics = map.entry("metrics").or_insert_with(default_metrics);
    match metrics {
        Value::Object(metrics_map) => {
            if let Value::Object(defaults) = default_metrics() {
                for (key, default_value) in defaults {
                    let matches_kind = metrics_map
                        .get(&key)
                        .is_some_and(|value| same_json_kind(value, &default_value));
                    if !matches_kind {
                        metrics_map.insert(key, default_value);
                    }
                }
            }
            if let Some(token_usage) = metrics_map.get_mut("token_usage") {
                normalize_token_usage(token_usage);
            }
        }
        _ => *metrics = default_metrics(),
    }

    let settings = map.entry("settings").or_insert_with(default_settings);
    match settings {
        Value::Object(settings_map) => {
            if let Value::Object(defaults) = default_settings() {
                for (key, default_value) in defaults {
                    settings_map.entry(key).or_insert(default_value);
                }
            }
        }
        _ => *settings = default_settings(),
    }
}

fn normalize_token_usage(token_usage: &mut Value) {
    let defaults = default_metrics();
    let usage_defaults = &defaults["token_usage"];
    let Value::Object(usage) = token_usage else {
        *token_usage = usage_defaults.clone();
        return;
    };

    if !usage.get("total_tokens").is_some_and(Value::is_number) {
        usage.insert("total_tokens".to_string(), json!(0));
    }
    for window in USAGE_WINDOWS {
        match usage.get_mut(window) {
            Some(Value::Object(existing)) => {
                if let Some(window_defaults) = usage_defaults[window].as_object() {
                    for (key, default_value) in window_defaults {
                        existing
                            .entry(key.clone())
                            .or_insert_with(|| default_value.clone());
                    }
                }
            }
            _ => {
                usage.insert(window.to_string(), usage_defaults[window].clone());
            }
        }
    }

    let warnings = usage
        .entry("warnings")
        .or_insert_with(|| json!({ "five_hour": [], "weekly": [] }));
    if !warnings.is_object() {
        *warnings = json!({ "five_hour": [], "weekly": [] });
    }
    if let Value::Object(warnings) = warnings {
        for window in USAGE_WINDOWS {
            if !warnings.get(window).is_some_and(Value::is_array) {
                warnings.insert(window.to_string(), json!([]));
            }
        }
    }
}

fn same_json_kind(a: &Value, b: &Value) -> bool {
    matches!(
        (a, b),
        (Value::Null, Value::Null)
            | (Value::Bool(_), Value::Bool(_))
            | (Value::Number(_), Value::Number(_))
            | (Value::String(_), Value::String(_))
            | (Value::Array(_), Value::Array(_))
            | (Value::Object(_), Value::Object(_))
    )
}

#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub session_id: String,
    pub branch_name: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub metadata: Value,
}

/// Persistent store tracking sessions and their metadata (activity log,
/// settings, usage metrics).
pub struct SessionStore {
    db: Arc<Mutex<Connection>>,
}

impl SessionStore {
    pub fn new(store: &Store) -> Self {
        Self { db: store.handle() }
    }

    /// Create the session if it does not exist; otherwise refresh it. An
    /// existing branch is only replaced when a new one is supplied.
    pub async fn ensure_session(
        &self,
        session_id: &str,
        branch_name: Option<&str>,
    ) -> Result<SessionRecord> {
        let now = now_iso();
        let db = self.db.lock().await;
        if let Some(existing) = load_row(&db, session_id)? {
            let branch = branch_name
                .map(str::to_string)
                .or(existing.branch_name.clone());
            db.execute(
                "UPDATE sessions SET branch_name = ?1, updated_at = ?2 WHERE session_id = ?3",
                params![branch, now, session_id],
            )?;
            let mut metadata = existing.metadata;
            normalize_metadata(&mut metadata);
            return Ok(SessionRecord {
                session_id: session_id.to_string(),
                branch_name: branch,
                created_at: existing.created_at,
                updated_at: now,
                metadata,
            });
        }

        let metadata = default_metadata();
        db.execute(
            "INSERT INTO sessions (session_id, branch_name, metadata, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![session_id, branch_name, metadata.to_string(), now],
        )?;
        Ok(SessionRecord {
            session_id: session_id.to_string(),
            branch_name: branch_name.map(str::to_string),
            created_at: now.clone(),
            updated_at: now,
            metadata,
        })
    }

    pub async fn session_exists(&self, session_id: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare("SELECT 1 FROM sessions WHERE session_id = ?1")?;
        let mut rows = stmt.query(params![session_id])?;
        Ok(rows.next()?.is_some())
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let db = self.db.lock().await;
        let Some(mut record) = load_row(&db, session_id)? else {
            return Ok(None);
        };
        normalize_metadata(&mut record.metadata);
        Ok(Some(record))
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT session_id, branch_name, metadata, created_at, updated_at
             FROM sessions ORDER BY updated_at DESC",
        )?;
        let rows = stmt.query_map([], row_to_raw)?;
        let mut out = Vec::new();
        for row in rows {
            let mut record = parse_raw(row?)?;
            normalize_metadata(&mut record.metadata);
            out.push(record);
        }
        Ok(out)
    }

    pub async fn update_branch(&self, session_id: &str, branch_name: &str) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE sessions SET branch_name = ?1, updated_at = ?2 WHERE session_id = ?3",
            params![branch_name, now_iso(), session_id],
        )?;
        Ok(())
    }

    /// Append an activity entry (`task`, `directive`, `configuration`,
    /// `session_rename`, ...) to the session's log, creating the session
    /// row if needed.
    pub async fn append_entry(
        &self,
        session_id: &str,
        prompt: &str,
        result: Option<&str>,
        entry_type: &str,
        extra: Option<Value>,
    ) -> Result<()> {
        let now = now_iso();
        let mut entry = json!({
            "prompt": prompt,
            "result": result,
            "timestamp": now,
            "type": entry_type,
        });
        if let Some(extra) = extra {
            entry["extra"] = extra;
        }
        self.mutate_metadata(session_id, &now, |metadata| {
            if let Some(entries) = metadata["tasks"].as_array_mut() {
                entries.push(entry);
            }
        })
        .await
    }

    /// Shallow merge into `metadata.settings`.
    pub async fn update_settings(&self, session_id: &str, patch: Value) -> Result<()> {
        let now = now_iso();
        self.mutate_metadata(session_id, &now, |metadata| {
            if let (Some(settings), Some(patch)) =
                (metadata["settings"].as_object_mut(), patch.as_object())
            {
                for (key, value) in patch {
                    settings.insert(key.clone(), value.clone());
                }
            }
        })
        .await
    }

    /// Deep merge into `metadata.metrics`: nested maps merge key-by-key,
    /// scalar leaves overwrite.
    pub async fn update_metrics(&self, session_id: &str, patch: Value) -> Result<()> {
        let now = now_iso();
        self.mutate_metadata(session_id, &now, |metadata| {
            deep_merge(&mut metadata["metrics"], &patch);
        })
        .await
    }

    /// Record that a usage threshold has been communicated for a window.
    /// Idempotent: each threshold appears at most once, lists stay sorted.
    /// Unknown window names are ignored.
    pub async fn record_usage_warning(
        &self,
        session_id: &str,
        window: &str,
        threshold: u32,
    ) -> Result<()> {
        if !USAGE_WINDOWS.contains(&window) {
            return Ok(());
        }
        let now = now_iso();
        self.mutate_metadata(session_id, &now, |metadata| {
            let Some(levels) =
                metadata["metrics"]["token_usage"]["warnings"][window].as_array_mut()
            else {
                return;
            };
            if !levels.iter().any(|level| level == &json!(threshold)) {
                levels.push(json!(threshold));
                levels.sort_by_key(|level| level.as_u64().unwrap_or(u64::MAX));
            }
        })
        .await
    }

    pub async fn get_metrics(&self, session_id: &str) -> Result<Option<Value>> {
        Ok(self
            .get_session(session_id)
            .await?
            .map(|record| record.metadata["metrics"].clone()))
    }

    pub async fn get_settings(&self, session_id: &str) -> Result<Option<Value>> {
        Ok(self
            .get_session(session_id)
            .await?
            .map(|record| record.metadata["settings"].clone()))
    }

    /// Repoint a session's primary key. Returns false when the target id is
    /// taken or the source does not exist; all other fields are preserved.
    pub async fn rename_session(&self, old_id: &str, new_id: &str) -> Result<bool> {
        if old_id == new_id {
            return Ok(true);
        }
        let updated = {
            let db = self.db.lock().await;
            let mut stmt = db.prepare("SELECT 1 FROM sessions WHERE session_id = ?1")?;
            let mut rows = stmt.query(params![new_id])?;
            if rows.next()?.is_some() {
                return Ok(false);
            }
            drop(rows);
            drop(stmt);
            db.execute(
                "UPDATE sessions SET session_id = ?1, updated_at = ?2 WHERE session_id = ?3",
                params![new_id, now_iso(), old_id],
            )?
        };
        if updated == 0 {
            return Ok(false);
        }
        let note = format!("Session renamed from {old_id} to {new_id}");
        if let Err(error) = self
            .append_entry(new_id, &note, None, "session_rename", None)
            .await
        {
            warn!("Failed to log rename of session {new_id}: {error}");
        }
        Ok(true)
    }

    /// Load-or-default, normalize, apply the mutation, and persist. Creates
    /// the session row when missing so telemetry writes never require a
    /// prior ensure call.
    async fn mutate_metadata<F>(&self, session_id: &str, now: &str, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut Value),
    {
        let db = self.db.lock().await;
        let (mut metadata, created_at, branch_name) = match load_row(&db, session_id)? {
            Some(record) => (record.metadata, record.created_at, record.branch_name),
            None => (default_metadata(), now.to_string(), None),
        };
        normalize_metadata(&mut metadata);
        mutate(&mut metadata);

        db.execute(
            "INSERT OR IGNORE INTO sessions (session_id, branch_name, metadata, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![session_id, branch_name, metadata.to_string(), created_at, now],
        )?;
        db.execute(
            "UPDATE sessions SET metadata = ?1, updated_at = ?2 WHERE session_id = ?3",
            params![metadata.to_string(), now, session_id],
        )?;
        Ok(())
    }
}

type RawSession = (String, Option<String>, String, String, String);

fn row_to_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawSession> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
    ))
}

fn parse_raw(raw: RawSession) -> Result<SessionRecord> {
    let (session_id, branch_name, metadata, created_at, updated_at) = raw;
    Ok(SessionRecord {
        session_id,
        branch_name,
        created_at,
        updated_at,
        metadata: serde_json::from_str(&metadata)?,
    })
}

fn load_row(db: &Connection, session_id: &str) -> Result<Option<SessionRecord>> {
    let mut stmt = db.prepare(
        "SELECT session_id, branch_name, metadata, created_at, updated_at
         FROM sessions WHERE session_id = ?1 LIMIT 1",
    )?;
    let mut rows = stmt.query(params![session_id])?;
    if let Some(row) = rows.next()? {
        Ok(Some(parse_raw(row_to_raw(row)?)?))
    } else {
        Ok(None)
    }
}
