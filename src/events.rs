//! Event Model
//!
//! Immutable records of observed hook invocations from the coding agent,
//! plus the queue entry wrapper that carries processing priority.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Monotone id state: high bits hold the last-used millisecond timestamp,
/// low bits a per-millisecond counter.
static ID_STATE: AtomicU64 = AtomicU64::new(0);

/// Which hook produced the event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PreTool,
    PostTool,
    PostToolFailure,
    UserPrompt,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::PreTool => "pre_tool",
            EventKind::PostTool => "post_tool",
            EventKind::PostToolFailure => "post_tool_failure",
            EventKind::UserPrompt => "user_prompt",
        }
    }
}

/// Processing priority assigned at ingest
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

/// One observed hook invocation. Never mutated after ingest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotone, lexically sortable id assigned at ingest
    pub event_id: String,
    pub session_id: String,
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    /// Opaque tool arguments; consumers validate only the fields they need
    #[serde(default)]
    pub tool_args: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Tool outcome reported by post_tool hooks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    pub ts_ns: i64,
    /// Hook name that produced this event
    pub source: String,
    /// Assigned by the ingest scorer, 0.0 - 1.0
    #[serde(default)]
    pub importance: f64,
}

impl Event {
    pub fn new(kind: EventKind, session_id: impl Into<String>) -> Self {
        Self {
            event_id: next_event_id(),
            session_id: session_id.into(),
            kind,
            tool: None,
            tool_args: Map::new(),
            text: None,
            success: None,
            ts_ns: now_ns(),
            source: "observe".to_string(),
            importance: 0.0,
        }
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = Some(tool.into());
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_arg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.tool_args.insert(key.into(), value);
        self
    }

    pub fn with_importance(mut self, importance: f64) -> Self {
        self.importance = importance.clamp(0.0, 1.0);
        self
    }

    /// Whether the event carries an explicit memory marker in its text
    pub fn has_memory_marker(&self) -> bool {
        let Some(text) = &self.text else {
            return false;
        };
        let lower = text.to_lowercase();
        ["remember", "always", "never", "important:"]
            .iter()
            .any(|m| lower.contains(m))
    }

    /// Queue priority derived from the event kind
    pub fn priority(&self) -> Priority {
        match self.kind {
            EventKind::PostToolFailure => Priority::High,
            EventKind::UserPrompt if self.has_memory_marker() => Priority::High,
            EventKind::UserPrompt => Priority::Medium,
            EventKind::PreTool => Priority::Medium,
            EventKind::PostTool => Priority::Low,
        }
    }
}

/// An event paired with its processing priority. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub event: Event,
    pub priority: Priority,
}

impl QueueEntry {
    pub fn new(event: Event) -> Self {
        let priority = event.priority();
        Self { event, priority }
    }
}

/// Nanoseconds since the epoch
pub fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}

/// Generate the next event id: 12 hex chars of millisecond timestamp
/// followed by a 5 hex char sequence counter. Lexicographic order matches
/// creation order within a process.
pub fn next_event_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;

    let mut seq;
    loop {
        let prev = ID_STATE.load(Ordering::SeqCst);
        let prev_millis = prev >> 20;
        let prev_seq = prev & 0xF_FFFF;
        // Clamp to the last-seen timestamp so ids stay monotone across
        // clock steps backwards.
        let ts = millis.max(prev_millis);
        seq = if ts == prev_millis { prev_seq + 1 } else { 0 };
        let next = (ts << 20) | (seq & 0xF_FFFF);
        if ID_STATE
            .compare_exchange(prev, next, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return format!("{:012x}{:05x}", ts, seq & 0xF_FFFF);
        }
    }
}
