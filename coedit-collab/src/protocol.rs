//! JSON wire protocol between editors and the sync server.
//!
//! Every frame is a text WebSocket message holding one envelope:
//! ```text
//! { "type": "<kebab-case name>", "payload": <type-specific>, ...extra }
//! ```
//! Only `init` carries fields beside `payload` (`users`, `language`,
//! `crdtEngine`). CRDT payloads are engine specific and opaque here.

use serde::{Deserialize, Serialize};

use coedit_core::{DeleteOp, EngineKind, InsertOp, Snapshot};

use crate::session::{CursorPosition, InitState, User};

/// Close code sent when a connection is refused on policy grounds.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// Close code sent when connection setup fails on the server.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Username used when the handshake does not carry one.
pub const DEFAULT_USERNAME: &str = "Anonymous";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenamePayload {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguagePayload {
    pub language: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserLeftPayload {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorUpdatePayload {
    pub user_id: String,
    pub cursor: CursorPosition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    DocumentLimit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

/// Messages an editor sends to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    CrdtInsert { payload: InsertOp },
    CrdtDelete { payload: DeleteOp },
    ClientRename { payload: RenamePayload },
    ClientCursor { payload: CursorPosition },
    ClientLanguage { payload: LanguagePayload },
}

/// Messages the server sends to editors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    Init {
        payload: Snapshot,
        users: Vec<User>,
        language: String,
        #[serde(rename = "crdtEngine")]
        crdt_engine: EngineKind,
    },
    Error { payload: ErrorPayload },
    UserJoin { payload: User },
    UserLeave { payload: UserLeftPayload },
    UserRename { payload: User },
    CursorUpdate { payload: CursorUpdatePayload },
    LanguageChange { payload: LanguagePayload },
    CrdtInsert { payload: InsertOp },
    CrdtDelete { payload: DeleteOp },
}

impl ClientMessage {
    pub fn insert(op: InsertOp) -> Self {
        Self::CrdtInsert { payload: op }
    }

    pub fn delete(op: DeleteOp) -> Self {
        Self::CrdtDelete { payload: op }
    }

    pub fn rename(name: impl Into<String>) -> Self {
        Self::ClientRename {
            payload: RenamePayload { name: name.into() },
        }
    }

    pub fn cursor(line_number: u32, column: u32) -> Self {
        Self::ClientCursor {
            payload: CursorPosition { line_number, column },
        }
    }

    pub fn language(language: impl Into<String>) -> Self {
        Self::ClientLanguage {
            payload: LanguagePayload {
                language: language.into(),
            },
        }
    }

    /// Wire name of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CrdtInsert { .. } => "crdt-insert",
            Self::CrdtDelete { .. } => "crdt-delete",
            Self::ClientRename { .. } => "client-rename",
            Self::ClientCursor { .. } => "client-cursor",
            Self::ClientLanguage { .. } => "client-language",
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

impl ServerMessage {
    pub fn init(state: InitState) -> Self {
        Self::Init {
            payload: state.snapshot,
            users: state.users,
            language: state.language,
            crdt_engine: state.engine,
        }
    }

    pub fn document_limit(max: usize) -> Self {
        Self::Error {
            payload: ErrorPayload {
                code: ErrorCode::DocumentLimit,
                message: format!("Server document limit of {max} reached, try again later"),
            },
        }
    }

    pub fn user_join(user: User) -> Self {
        Self::UserJoin { payload: user }
    }

    pub fn user_leave(id: impl Into<String>) -> Self {
        Self::UserLeave {
            payload: UserLeftPayload { id: id.into() },
        }
    }

    pub fn user_rename(user: User) -> Self {
        Self::UserRename { payload: user }
    }

    pub fn cursor_update(user_id: impl Into<String>, cursor: CursorPosition) -> Self {
        Self::CursorUpdate {
            payload: CursorUpdatePayload {
                user_id: user_id.into(),
                cursor,
            },
        }
    }

    pub fn language_change(language: impl Into<String>) -> Self {
        Self::LanguageChange {
            payload: LanguagePayload {
                language: language.into(),
            },
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Query parameters of the WebSocket upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeParams {
    pub doc_id: String,
    pub user_id: String,
    pub username: String,
}

impl HandshakeParams {
    pub fn new(
        doc_id: impl Into<String>,
        user_id: impl Into<String>,
        username: impl Into<String>,
    ) -> Self {
        Self {
            doc_id: doc_id.into(),
            user_id: user_id.into(),
            username: username.into(),
        }
    }

    /// Parse `docId`, `userId` and the optional `username` from a query string.
    pub fn from_query(query: &str) -> Result<Self, ProtocolError> {
        let mut doc_id = None;
        let mut user_id = None;
        let mut username = None;
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "docId" => doc_id = Some(value.into_owned()),
                "userId" => user_id = Some(value.into_owned()),
                "username" => username = Some(value.into_owned()),
                _ => {}
            }
        }

        let doc_id = doc_id
            .filter(|v| !v.is_empty())
            .ok_or(ProtocolError::MissingParameter("docId"))?;
        let user_id = user_id
            .filter(|v| !v.is_empty())
            .ok_or(ProtocolError::MissingParameter("userId"))?;
        let username = username
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_USERNAME.to_string());

        Ok(Self {
            doc_id,
            user_id,
            username,
        })
    }

    pub fn to_query(&self) -> String {
        url::form_urlencoded::Serializer::new(String::new())
            .append_pair("docId", &self.doc_id)
            .append_pair("userId", &self.user_id)
            .append_pair("username", &self.username)
            .finish()
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("missing query parameter '{0}'")]
    MissingParameter(&'static str),
    #[error("connection closed")]
    ConnectionClosed,
}
