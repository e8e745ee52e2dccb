use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::warn;

use super::sessions::{SessionStore, USAGE_WINDOWS, deep_merge};
use super::store::now_iso;

pub const DEFAULT_WARNING_THRESHOLDS: [u32; 3] = [80, 90, 95];

const WINDOW_LABELS: [(&str, &str); 2] = [("five_hour", "5-hour"), ("weekly", "weekly")];

/// Rough token estimate for texts whose usage the worker did not report:
/// one token per four characters, never negative.
pub fn estimate_tokens(texts: &[&str]) -> i64 {
    let combined: Vec<&str> = texts.iter().copied().filter(|t| !t.is_empty()).collect();
    if combined.is_empty() {
        return 0;
    }
    let len = combined.join(" ").chars().count();
    len.div_ceil(4) as i64
}

/// Flatten every numeric leaf of an arbitrary JSON tree into
/// `(dot/bracket path, value)` pairs, in document order.
pub fn flatten_numeric(data: &Value, prefix: &str, out: &mut Vec<(String, f64)>) {
    match data {
        Value::Object(map) => {
            for (key, value) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten_numeric(value, &path, out);
            }
        }
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                flatten_numeric(item, &format!("{prefix}[{index}]"), out);
            }
        }
        Value::Number(n) => {
            if let Some(value) = n.as_f64() {
                out.push((prefix.to_string(), value));
            }
        }
        _ => {}
    }
}

/// Best-effort signal search: term sets are tried in order, and within a
/// set the first flattened path containing every term (case-insensitive)
/// wins. The upstream payload shape is not contractually fixed.
pub fn find_by_terms(entries: &[(String, f64)], term_sets: &[&[&str]]) -> Option<f64> {
    for terms in term_sets {
        for (path, value) in entries {
            let path = path.to_lowercase();
            if terms.iter().all(|term| path.contains(term)) {
                return Some(*value);
            }
        }
    }
    None
}

#[derive(Debug, Default, Clone)]
pub struct WindowSignals {
    pub used: Option<i64>,
    pub limit: Option<i64>,
    pub remaining: Option<i64>,
}

impl WindowSignals {
    fn is_empty(&self) -> bool {
        self.used.is_none() && self.limit.is_none() && self.remaining.is_none()
    }
}

/// Usage signals recovered from one worker result payload.
#[derive(Debug, Default, Clone)]
pub struct UsageSignals {
    pub total_tokens: Option<i64>,
    pub delta_tokens: Option<i64>,
    pub five_hour: WindowSignals,
    pub weekly: WindowSignals,
    pub rate_limits: Option<Value>,
    pub snapshot: Option<Value>,
}

/// Extract usage signals from a raw worker payload. Sub-objects under the
/// well-known keys are deep-merged into one working document, its numeric
/// leaves are flattened, and each signal is looked up by substring term
/// sets. Never errors; absent signals stay `None`.
pub fn extract_usage(raw: &Value) -> UsageSignals {
    let mut combined = json!({});
    let mut rate_limits = json!({});
    for key in ["metrics", "usage", "usage_metrics", "token_usage", "rate_limits", "metadata"] {
        let Some(payload) = raw.get(key).filter(|v| v.is_object()) else {
            continue;
        };
        if payload.as_object().is_some_and(|m| m.is_empty()) {
            continue;
        }
        deep_merge(&mut combined, payload);
        if key == "rate_limits" {
            deep_merge(&mut rate_limits, payload);
        }
    }

    let mut flat = Vec::new();
    flatten_numeric(&combined, "", &mut flat);

    let window = |terms: &[&[&str]]| find_by_terms(&flat, terms).map(|v| v as i64);

    let five_hour = WindowSignals {
        used: window(&[&["five", "hour", "used"], &["5", "hour", "used"]]),
        limit: window(&[&["five", "hour", "limit"], &["5", "hour", "limit"]]),
        remaining: window(&[&["five", "hour", "remaining"], &["5", "hour", "remaining"]]),
    };
    let weekly = WindowSignals {
        used: window(&[&["week", "used"]]),
        limit: window(&[&["week", "limit"]]),
        remaining: window(&[&["week", "remaining"]]),
    };

    UsageSignals {
        total_tokens: window(&[&["total", "token"]]),
        delta_tokens: window(&[&["delta", "token"], &["tokens", "used"], &["used", "token"]]),
        five_hour,
        weekly,
        rate_limits: rate_limits
            .as_object()
            .filter(|m| !m.is_empty())
            .map(|_| rate_limits.clone()),
        snapshot: combined
            .as_object()
            .filter(|m| !m.is_empty())
            .map(|_| combined.clone()),
    }
}

/// Build the metrics patch and activity-entry extra for one completed
/// interaction, against the session's existing metrics document.
pub fn prepare_update(
    existing_metrics: &Value,
    prompt: &str,
    output: &str,
    raw: &Value,
) -> (Value, Value) {
    let signals = extract_usage(raw);
    let delta = signals
        .delta_tokens
        .filter(|d| *d >= 0)
        .unwrap_or_else(|| estimate_tokens(&[prompt, output]));

    let existing_usage = &existing_metrics["token_usage"];
    let previous_total = existing_usage["total_tokens"].as_i64().unwrap_or(0);
    let new_total = signals.total_tokens.unwrap_or(previous_total + delta);

    let mut token_usage_update = json!({ "total_tokens": new_total });
    for (window_name, signals) in [("five_hour", &signals.five_hour), ("weekly", &signals.weekly)] {
        let mut update = serde_json::Map::new();
        if let Some(used) = signals.used {
            update.insert("used".to_string(), json!(used));
        }
        if let Some(limit) = signals.limit {
            update.insert("limit".to_string(), json!(limit));
        }
        if let Some(remaining) = signals.remaining {
            update.insert("remaining".to_string(), json!(remaining));
        }
        // no reported figure for this window: keep accumulating locally
        if !update.contains_key("used") {
            if let Some(previous_used) = existing_usage[window_name]["used"].as_i64() {
                update.insert("used".to_string(), json!(previous_used + delta));
            }
        }
        if !update.is_empty() {
            update.insert("last_updated".to_string(), json!(now_iso()));
            token_usage_update[window_name] = Value::Object(update);
        }
    }

    let mut metrics_update = json!({
        "token_usage": token_usage_update,
        "last_task_tokens": delta,
    });
    let mut entry_extra = json!({ "tokens_used": delta });
    if let Some(rate_limits) = signals.rate_limits {
        metrics_update["rate_limits"] = rate_limits.clone();
        entry_extra["rate_limits"] = rate_limits;
    }
    if let Some(snapshot) = signals.snapshot {
        metrics_update["last_snapshot"] = snapshot;
    }

    (metrics_update, entry_extra)
}

fn window_percent(window: &Value) -> Option<(f64, i64, i64)> {
    let used = window["used"].as_i64().filter(|u| *u > 0)?;
    let limit = window["limit"].as_i64().filter(|l| *l > 0)?;
    Some((used as f64 / limit as f64 * 100.0, used, limit))
}

/// Spoken-style summary of a session's normalized metrics document.
pub fn format_usage_summary(metrics: &Value) -> String {
    let token_usage = &metrics["token_usage"];
    let mut parts = Vec::new();
    if let Some(total) = token_usage["total_tokens"].as_i64() {
        parts.push(format!("Total tokens used: {total}."));
    }
    if let Some(last) = metrics["last_task_tokens"].as_i64() {
        parts.push(format!("Last task consumed approximately {last} tokens."));
    }
    for (window_name, label) in WINDOW_LABELS {
        let window = &token_usage[window_name];
        if let Some((percent, used, limit)) = window_percent(window) {
            let remaining = window["remaining"]
                .as_i64()
                .map(|r| format!(", {r} remaining"))
                .unwrap_or_default();
            parts.push(format!(
                "{label} window usage: {used} of {limit} tokens ({percent:.1}% used{remaining})."
            ));
        } else if let Some(used) = window["used"].as_i64().filter(|u| *u > 0) {
            parts.push(format!("{label} window usage: {used} tokens consumed."));
        }
    }
    if parts.is_empty() {
        return "I do not have token utilization metrics for this session yet.".to_string();
    }
    parts.join(" ")
}

/// Per-window rate-limit status, one sentence per window.
pub fn format_rate_limit_status(metrics: &Value) -> String {
    let token_usage = &metrics["token_usage"];
    let mut lines = Vec::new();
    for (window_name, label) in WINDOW_LABELS {
        let window = &token_usage[window_name];
        if let Some((percent, used, limit)) = window_percent(window) {
            let remaining = window["remaining"]
                .as_i64()
                .map(|r| format!(" with {r} tokens remaining"))
                .unwrap_or_default();
            lines.push(format!(
                "{} window usage is at {percent:.1}% ({used} of {limit} tokens used{remaining}).",
                capitalize(label)
            ));
        } else {
            lines.push(format!(
                "{} utilization details are not available yet.",
                capitalize(label)
            ));
        }
    }
    lines.join(" ")
}

fn capitalize(label: &str) -> String {
    let mut chars = label.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Aggregates per-task usage into session metrics and raises utilization
/// warnings when a window crosses a configured threshold.
///
/// The per-session warning cache mirrors the persisted warning lists so a
/// threshold is announced once per session, not once per process.
pub struct MetricsEngine {
    sessions: Arc<SessionStore>,
    thresholds: Vec<u32>,
    warned: Mutex<HashMap<String, HashMap<String, Vec<u32>>>>,
}

impl MetricsEngine {
    pub fn new(sessions: Arc<SessionStore>) -> Self {
        Self::with_thresholds(sessions, DEFAULT_WARNING_THRESHOLDS.to_vec())
    }

    pub fn with_thresholds(sessions: Arc<SessionStore>, thresholds: Vec<u32>) -> Self {
        Self {
            sessions,
            thresholds,
            warned: Mutex::new(HashMap::new()),
        }
    }

    /// Fold one completed interaction into the session's metrics, log the
    /// activity entry, and return a warning message if a utilization
    /// threshold was newly crossed. Never fails: storage errors are logged
    /// and the foreground path continues.
    pub async fn record_activity(
        &self,
        session_id: &str,
        prompt: &str,
        output: &str,
        raw: &Value,
        entry_type: &str,
    ) -> Option<String> {
        let existing = match self.sessions.get_metrics(session_id).await {
            Ok(metrics) => metrics.unwrap_or_else(|| json!({})),
            Err(error) => {
                warn!("Failed to read metrics for session {session_id}: {error}");
                json!({})
            }
        };
        let (metrics_update, entry_extra) = prepare_update(&existing, prompt, output, raw);

        if let Err(error) = self.sessions.update_metrics(session_id, metrics_update).await {
            warn!("Failed to update metrics for session {session_id}: {error}");
        }
        if let Err(error) = self
            .sessions
            .append_entry(session_id, prompt, Some(output), entry_type, Some(entry_extra))
            .await
        {
            warn!("Failed to record activity for session {session_id}: {error}");
        }

        self.refresh_warning_cache(session_id).await;
        self.check_warnings(session_id).await
    }

    /// Re-seed the in-process cache from the persisted warning lists.
    async fn refresh_warning_cache(&self, session_id: &str) {
        let metrics = match self.sessions.get_metrics(session_id).await {
            Ok(Some(metrics)) => metrics,
            Ok(None) => return,
            Err(error) => {
                warn!("Failed to refresh warning cache for session {session_id}: {error}");
                return;
            }
        };
        let mut warned = self.warned.lock().await;
        let entry = warned.entry(session_id.to_string()).or_default();
        for window in USAGE_WINDOWS {
            let persisted: Vec<u32> = metrics["token_usage"]["warnings"][window]
                .as_array()
                .map(|levels| {
                    levels
                        .iter()
                        .filter_map(|level| level.as_u64().map(|l| l as u32))
                        .collect()
                })
                .unwrap_or_default();
            entry.insert(window.to_string(), persisted);
        }
    }

    /// Check every window against the configured thresholds. Per window,
    /// only the first threshold not already announced is reported in one
    /// call, so a large jump does not produce a stack of messages at once.
    pub async fn check_warnings(&self, session_id: &str) -> Option<String> {
        let metrics = match self.sessions.get_metrics(session_id).await {
            Ok(metrics) => metrics?,
            Err(error) => {
                warn!("Failed to read metrics for session {session_id}: {error}");
                return None;
            }
        };

        let mut warned = self.warned.lock().await;
        let cache = warned.entry(session_id.to_string()).or_default();
        let mut messages = Vec::new();

        for (window_name, label) in WINDOW_LABELS {
            let Some((percent, used, limit)) =
                window_percent(&metrics["token_usage"][window_name])
            else {
                continue;
            };
            let triggered = cache.entry(window_name.to_string()).or_default();
            for &threshold in &self.thresholds {
                if percent >= threshold as f64 && !triggered.contains(&threshold) {
                    if let Err(error) = self
                        .sessions
                        .record_usage_warning(session_id, window_name, threshold)
                        .await
                    {
                        warn!(
                            "Failed to persist usage warning {threshold}% for {window_name}: {error}"
                        );
                    }
                    triggered.push(threshold);
                    messages.push(format!(
                        "Warning: {label} token usage reached {percent:.1}% ({used} of {limit} tokens)."
                    ));
                    break;
                }
            }
        }

        if messages.is_empty() {
            None
        } else {
            Some(messages.join(" "))
        }
    }
}
