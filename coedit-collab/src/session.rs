//! Per-document session state: CRDT replica, roster, language.
//!
//! A session is mutated by one writer at a time. The registry hands it out
//! as [`SharedSession`], whose mutex is that single-writer discipline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;

use coedit_core::{CrdtEngine, EngineKind, Snapshot};

/// Site id of the server-side replica of every document.
pub const SERVER_SITE_ID: &str = "server";

/// Language tag of a freshly created document.
pub const DEFAULT_LANGUAGE: &str = "typescript";

pub type SharedSession = Arc<Mutex<DocumentSession>>;

/// Cursor colors handed out to users.
pub const USER_COLORS: [&str; 8] = [
    "#3b82f6", // blue
    "#22c55e", // green
    "#a855f7", // purple
    "#f97316", // orange
    "#ec4899", // pink
    "#14b8a6", // teal
    "#eab308", // yellow
    "#ef4444", // red
];

/// Stable color for a user id: the same id always maps to the same entry.
pub fn color_for(user_id: &str) -> &'static str {
    let sum: u32 = user_id.encode_utf16().map(u32::from).sum();
    USER_COLORS[sum as usize % USER_COLORS.len()]
}

/// Editor cursor in line/column coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorPosition {
    pub line_number: u32,
    pub column: u32,
}

/// A connected user. Lives as long as its connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    pub color: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorPosition>,
}

impl User {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            color: color_for(&id).to_string(),
            id,
            name: name.into(),
            cursor: None,
        }
    }
}

/// Everything a joining client needs to build its replica.
#[derive(Debug, Clone)]
pub struct InitState {
    pub snapshot: Snapshot,
    pub users: Vec<User>,
    pub language: String,
    pub engine: EngineKind,
}

pub struct DocumentSession {
    doc_id: String,
    engine: Box<dyn CrdtEngine>,
    users: HashMap<String, User>,
    /// Live connections per user id. A user stays on the roster until the
    /// last of them leaves.
    connections: HashMap<String, usize>,
    language: String,
    last_access: Instant,
}

impl DocumentSession {
    pub fn new(doc_id: impl Into<String>, engine: EngineKind) -> Self {
        Self {
            doc_id: doc_id.into(),
            engine: engine.create(SERVER_SITE_ID),
            users: HashMap::new(),
            connections: HashMap::new(),
            language: DEFAULT_LANGUAGE.to_string(),
            last_access: Instant::now(),
        }
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub fn engine(&self) -> &dyn CrdtEngine {
        self.engine.as_ref()
    }

    pub fn engine_mut(&mut self) -> &mut dyn CrdtEngine {
        self.engine.as_mut()
    }

    /// Add a connection for `user`, replacing any roster entry with the
    /// same id. Returns the replaced entry.
    pub fn add_user(&mut self, user: User) -> Option<User> {
        self.touch();
        *self.connections.entry(user.id.clone()).or_insert(0) += 1;
        self.users.insert(user.id.clone(), user)
    }

    /// Drop one connection of `user_id`. The user leaves the roster, and is
    /// returned, only when that was its last connection.
    pub fn remove_user(&mut self, user_id: &str) -> Option<User> {
        self.touch();
        let count = self.connections.get_mut(user_id)?;
        *count -= 1;
        if *count > 0 {
            return None;
        }
        self.connections.remove(user_id);
        self.users.remove(user_id)
    }

    /// Number of live connections of `user_id`.
    pub fn connection_count(&self, user_id: &str) -> usize {
        self.connections.get(user_id).copied().unwrap_or(0)
    }

    /// Rename a user. Returns the updated user, or `None` if unknown.
    pub fn rename_user(&mut self, user_id: &str, name: impl Into<String>) -> Option<User> {
        self.touch();
        let user = self.users.get_mut(user_id)?;
        user.name = name.into();
        Some(user.clone())
    }

    pub fn update_cursor(&mut self, user_id: &str, cursor: CursorPosition) -> bool {
        self.touch();
        match self.users.get_mut(user_id) {
            Some(user) => {
                user.cursor = Some(cursor);
                true
            }
            None => false,
        }
    }

    pub fn set_language(&mut self, language: impl Into<String>) {
        self.touch();
        self.language = language.into();
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn user(&self, user_id: &str) -> Option<&User> {
        self.users.get(user_id)
    }

    /// Roster snapshot.
    pub fn users(&self) -> Vec<User> {
        self.users.values().cloned().collect()
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn has_users(&self) -> bool {
        !self.users.is_empty()
    }

    /// Record activity.
    pub fn touch(&mut self) {
        self.last_access = Instant::now();
    }

    pub fn last_access(&self) -> Instant {
        self.last_access
    }

    /// Whether the session has been idle for longer than `ttl`.
    pub fn is_expired(&self, ttl: Duration) -> bool {
        self.last_access.elapsed() > ttl
    }

    /// UTF-8 size of the visible text.
    pub fn content_size_bytes(&self) -> usize {
        self.engine.content_bytes()
    }

    pub fn init_state(&self) -> InitState {
        InitState {
            snapshot: self.engine.snapshot(),
            users: self.users(),
            language: self.language.clone(),
            engine: self.engine.kind(),
        }
    }
}

impl std::fmt::Debug for DocumentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentSession")
            .field("doc_id", &self.doc_id)
            .field("engine", &self.engine.kind())
            .field("users", &self.users.len())
            .field("language", &self.language)
            .finish()
    }
}
