//! Process-wide map of live documents.
//!
//! Bounded by `max_documents`. Empty documents that have been idle past the
//! TTL are swept on a fixed interval.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use coedit_core::{EngineKind, InsertOp};

use crate::config::CollabConfig;
use crate::session::{DocumentSession, SharedSession};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("document limit reached ({max} documents)")]
    DocumentLimit { max: usize },
}

pub struct DocumentRegistry {
    sessions: RwLock<HashMap<String, SharedSession>>,
    engine: EngineKind,
    max_documents: usize,
    max_document_bytes: usize,
    idle_ttl: Duration,
    sweep_interval: Duration,
}

impl DocumentRegistry {
    pub fn new(config: &CollabConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            engine: config.engine,
            max_documents: config.max_documents,
            max_document_bytes: config.max_document_bytes,
            idle_ttl: config.idle_ttl,
            sweep_interval: config.sweep_interval,
        }
    }

    /// Return the session for `doc_id`, creating it if there is room.
    pub async fn get_or_create(&self, doc_id: &str) -> Result<SharedSession, RegistryError> {
        // Fast path: read lock. The sweeper needs the write lock, so touching
        // here keeps the session alive until the caller gets to lock it.
        if let Some(session) = self.sessions.read().await.get(doc_id) {
            if let Ok(mut s) = session.try_lock() {
                s.touch();
            }
            return Ok(session.clone());
        }

        let mut sessions = self.sessions.write().await;
        // Double-check after acquiring write lock
        if let Some(session) = sessions.get(doc_id) {
            return Ok(session.clone());
        }
        if sessions.len() >= self.max_documents {
            log::warn!(
                "Refusing document {doc_id}: limit of {} documents reached",
                self.max_documents
            );
            return Err(RegistryError::DocumentLimit {
                max: self.max_documents,
            });
        }

        let session = Arc::new(Mutex::new(DocumentSession::new(doc_id, self.engine)));
        sessions.insert(doc_id.to_string(), session.clone());
        log::info!("Created document {doc_id} ({} engine)", self.engine);
        Ok(session)
    }

    pub async fn get(&self, doc_id: &str) -> Option<SharedSession> {
        self.sessions.read().await.get(doc_id).cloned()
    }

    /// Whether `doc_id` may still grow. Unknown documents are within limits.
    ///
    /// Locks the session: callers already holding it should use
    /// [`DocumentRegistry::within_size_limit`] instead.
    pub async fn check_size(&self, doc_id: &str) -> bool {
        match self.get(doc_id).await {
            Some(session) => self.within_size_limit(&*session.lock().await),
            None => true,
        }
    }

    pub fn within_size_limit(&self, session: &DocumentSession) -> bool {
        session.content_size_bytes() < self.max_document_bytes
    }

    /// Whether `op` may be applied to `session`: the document is below its
    /// limit and the most text the op can carry still fits.
    pub fn admits_insert(&self, session: &DocumentSession, op: &InsertOp) -> bool {
        let size = session.content_size_bytes();
        size < self.max_document_bytes && op.content_bound() <= self.max_document_bytes - size
    }

    /// Remove every session with an empty roster that has been idle past the
    /// TTL. Sessions locked by a writer are in use and skipped.
    pub async fn sweep(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        let ttl = self.idle_ttl;

        sessions.retain(|doc_id, session| match session.try_lock() {
            Ok(s) if !s.has_users() && s.is_expired(ttl) => {
                log::debug!("Sweeping idle document {doc_id}");
                false
            }
            _ => true,
        });

        let removed = before - sessions.len();
        if removed > 0 {
            log::info!("Swept {removed} idle documents, {} remain", sessions.len());
        }
        removed
    }

    /// Run [`DocumentRegistry::sweep`] every `sweep_interval` until the handle
    /// is aborted.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let period = self.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                registry.sweep().await;
            }
        })
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn document_ids(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    pub fn engine(&self) -> EngineKind {
        self.engine
    }

    pub fn max_documents(&self) -> usize {
        self.max_documents
    }

    pub fn max_document_bytes(&self) -> usize {
        self.max_document_bytes
    }
}
