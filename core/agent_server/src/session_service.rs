//! Conversation-scoped message history with bounded context building and
//! JSON-file persistence (single document, atomic rewrite).

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use shared_types::{ChatMessage, Role, Session, SessionId, SessionSummary};

/// On-disk document: `{"sessions": [...]}`.
#[derive(Serialize, Deserialize, Default)]
struct SessionDocument {
    sessions: Vec<Session>,
}

pub struct SessionService {
    sessions: Mutex<HashMap<SessionId, Session>>,
    storage_path: PathBuf,
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

impl SessionService {
    /// Open the store at `storage_path`. A missing or corrupted file starts
    /// the store empty; corruption is logged, never raised.
    pub fn new(storage_path: PathBuf) -> Self {
        let sessions = match fs::read_to_string(&storage_path) {
            Ok(body) => match serde_json::from_str::<SessionDocument>(&body) {
                Ok(doc) => doc
                    .sessions
                    .into_iter()
                    .map(|s| (s.id.clone(), s))
                    .collect(),
                Err(e) => {
                    warn!(
                        path = %storage_path.display(),
                        error = %e,
                        "session file corrupted, starting empty"
                    );
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };

        Self {
            sessions: Mutex::new(sessions),
            storage_path,
        }
    }

    /// Return the session for `id`, allocating it on first mention. A `None`
    /// id allocates a fresh UUID-keyed session.
    pub fn get_or_create(&self, id: Option<&str>) -> Session {
        let mut sessions = self.sessions.lock().expect("session lock poisoned");
        let key = match id {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => Uuid::new_v4().to_string(),
        };

        sessions
            .entry(key.clone())
            .or_insert_with(|| {
                let now = now_secs();
                Session {
                    id: key,
                    created_at: now,
                    updated_at: now,
                    messages: Vec::new(),
                    metadata: None,
                }
            })
            .clone()
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        self.sessions
            .lock()
            .expect("session lock poisoned")
            .get(id)
            .cloned()
    }

    /// Append one message; creates the session on first mention. Returns the
    /// stored message. The append and the persistence happen under the same
    /// lock, which keeps per-session message order causal.
    pub fn append(&self, id: &str, role: Role, content: impl Into<String>) -> ChatMessage {
        let message = ChatMessage {
            role,
            content: content.into(),
            timestamp: now_secs(),
        };

        {
            let mut sessions = self.sessions.lock().expect("session lock poisoned");
            let session = sessions.entry(id.to_string()).or_insert_with(|| Session {
                id: id.to_string(),
                created_at: message.timestamp,
                updated_at: message.timestamp,
                messages: Vec::new(),
                metadata: None,
            });
            session.messages.push(message.clone());
            session.updated_at = message.timestamp;

            self.persist_locked(&sessions);
        }

        message
    }

    /// Append a user/assistant exchange in one locked operation.
    pub fn store_exchange(&self, id: &str, user: &str, assistant: &str) {
        let mut sessions = self.sessions.lock().expect("session lock poisoned");
        let now = now_secs();
        let session = sessions.entry(id.to_string()).or_insert_with(|| Session {
            id: id.to_string(),
            created_at: now,
            updated_at: now,
            messages: Vec::new(),
            metadata: None,
        });
        session.messages.push(ChatMessage {
            role: Role::User,
            content: user.to_string(),
            timestamp: now,
        });
        session.messages.push(ChatMessage {
            role: Role::Assistant,
            content: assistant.to_string(),
            timestamp: now_secs(),
        });
        session.updated_at = session
            .messages
            .last()
            .map(|m| m.timestamp)
            .unwrap_or(now);

        self.persist_locked(&sessions);
    }

    /// Last `limit` messages of a session, oldest first. Unknown sessions
    /// yield an empty list.
    pub fn recent(&self, id: &str, limit: usize) -> Vec<ChatMessage> {
        let sessions = self.sessions.lock().expect("session lock poisoned");
        match sessions.get(id) {
            Some(session) => {
                let skip = session.messages.len().saturating_sub(limit);
                session.messages[skip..].to_vec()
            }
            None => Vec::new(),
        }
    }

    /// Concatenate the last `limit` messages as `"User: …\nAssistant: …"`.
    /// Returns `None` when there is nothing to build from.
    pub fn build_context(&self, id: &str, limit: usize) -> Option<String> {
        let recent = self.recent(id, limit);
        if recent.is_empty() {
            return None;
        }
        Some(
            recent
                .iter()
                .map(|m| format!("{}: {}", m.role, m.content))
                .collect::<Vec<_>>()
                .join("\n"),
        )
    }

    /// Sessions ordered by `updated_at` descending.
    pub fn list(&self) -> Vec<SessionSummary> {
        let sessions = self.sessions.lock().expect("session lock poisoned");
        let mut summaries: Vec<SessionSummary> = sessions
            .values()
            .map(|s| SessionSummary {
                id: s.id.clone(),
                created_at: s.created_at,
                updated_at: s.updated_at,
                message_count: s.messages.len(),
            })
            .collect();
        summaries.sort_by(|a, b| {
            b.updated_at
                .partial_cmp(&a.updated_at)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        summaries
    }

    pub fn delete(&self, id: &str) -> bool {
        let mut sessions = self.sessions.lock().expect("session lock poisoned");
        let removed = sessions.remove(id).is_some();
        if removed {
            self.persist_locked(&sessions);
        }
        removed
    }

    pub fn clear_all(&self) -> usize {
        let mut sessions = self.sessions.lock().expect("session lock poisoned");
        let count = sessions.len();
        sessions.clear();
        self.persist_locked(&sessions);
        count
    }

    /// Force a save of the current state.
    pub fn save(&self) {
        let sessions = self.sessions.lock().expect("session lock poisoned");
        self.persist_locked(&sessions);
    }

    /// Write-then-rename so readers never observe a partial document.
    fn persist_locked(&self, sessions: &HashMap<SessionId, Session>) {
        let mut all: Vec<Session> = sessions.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        let doc = SessionDocument { sessions: all };

        let body = match serde_json::to_string_pretty(&doc) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "failed to serialize sessions");
                return;
            }
        };

        if let Some(parent) = self.storage_path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                warn!(error = %e, "failed to create session storage dir");
                return;
            }
        }

        let tmp = self.storage_path.with_extension("json.tmp");
        if let Err(e) = fs::write(&tmp, body).and_then(|_| fs::rename(&tmp, &self.storage_path)) {
            warn!(
                path = %self.storage_path.display(),
                error = %e,
                "failed to persist sessions"
            );
        }
    }
}
