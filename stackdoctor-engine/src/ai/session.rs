//! Multi-turn conversation sessions.
//!
//! Sessions are created on first use, serialized under their own mutex,
//! and expired after a TTL of inactivity. History compression triggers
//! when a session exceeds `2 × max_turns` turns: the first turn is kept,
//! a summary system turn is inserted, and the last `max_turns − 1` turns
//! follow.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: content.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: content.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::System,
            content: content.into(),
            metadata: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSession {
    pub id: String,
    pub history: Vec<Turn>,
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
    pub last_active: DateTime<Utc>,
}

impl ConversationSession {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            history: Vec::new(),
            context: HashMap::new(),
            last_active: Utc::now(),
        }
    }
}

pub struct MultiTurnManager {
    sessions: DashMap<String, Arc<Mutex<ConversationSession>>>,
    max_turns: usize,
    ttl: Duration,
}

impl MultiTurnManager {
    pub fn new(max_turns: usize, ttl: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            max_turns: max_turns.max(2),
            ttl,
        }
    }

    /// Fetch or create the session. The returned handle serializes all
    /// access to this session.
    pub fn session(&self, id: &str) -> Arc<Mutex<ConversationSession>> {
        self.sessions
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ConversationSession::new(id))))
            .clone()
    }

    /// Append a turn, compressing history when it grows beyond
    /// `2 × max_turns`.
    pub async fn append(&self, id: &str, turn: Turn) {
        let session = self.session(id);
        let mut session = session.lock().await;
        session.history.push(turn);
        session.last_active = Utc::now();

        if session.history.len() > 2 * self.max_turns {
            compress(&mut session.history, self.max_turns);
            tracing::debug!(session = id, turns = session.history.len(), "session history compressed");
        }
    }

    pub async fn history(&self, id: &str) -> Vec<Turn> {
        let session = self.session(id);
        let session = session.lock().await;
        session.history.clone()
    }

    /// Drop sessions idle longer than the TTL. Returns how many were
    /// removed.
    pub fn expire_idle(&self) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::hours(1));
        let before = self.sessions.len();
        self.sessions.retain(|_, session| {
            // A locked session is in use; keep it regardless.
            match session.try_lock() {
                Ok(session) => session.last_active >= cutoff,
                Err(_) => true,
            }
        });
        before - self.sessions.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

/// Keep the first turn, insert a summary system turn, keep the last
/// `max_turns − 1` turns.
fn compress(history: &mut Vec<Turn>, max_turns: usize) {
    if history.len() <= max_turns {
        return;
    }
    let first = history[0].clone();
    let tail_start = history.len() - (max_turns - 1);
    let compressed_range = &history[1..tail_start];

    let mut summary = format!(
        "Earlier conversation ({} turns) summarized: ",
        compressed_range.len()
    );
    for turn in compressed_range {
        let snippet: String = turn.content.chars().take(60).collect();
        summary.push_str(&format!("[{:?}] {snippet}; ", turn.role));
    }

    let tail: Vec<Turn> = history[tail_start..].to_vec();
    let mut rebuilt = Vec::with_capacity(max_turns + 1);
    rebuilt.push(first);
    rebuilt.push(Turn::system(summary));
    rebuilt.extend(tail);
    *history = rebuilt;
}
