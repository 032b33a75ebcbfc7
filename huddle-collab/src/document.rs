//! Document registry: one canonical CRDT replica per open file.
//!
//! ```text
//!                  attach ──► get_or_create(key) ──► DocumentSession
//!                                                    ├─ replica: Mutex<Doc>   (one critical section per key)
//!                                                    ├─ members: BroadcastGroup
//!                                                    ├─ awareness: AwarenessTable
//!                                                    └─ eviction timer (grace period)
//!
//! apply_update ──► lock replica ──► merge ──► broadcast to members except origin
//! detach (last) ──► schedule eviction ──► [grace] ──► close group ──► persist if dirty ──► drop
//! ```
//!
//! Admission to a session happens while the replica is locked, so a new
//! member's snapshot contains exactly the updates merged before it joined
//! and it receives every update merged afterwards. Lock order is replica,
//! then awareness table, then broadcast group. Store calls run on the
//! blocking pool with no session lock held.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{GetString, ReadTxn, StateVector, Text, Transact, Update, WriteTxn};

use crate::awareness::{self, AwarenessTable};
use crate::broadcast::{BroadcastGroup, GroupClosed};
use crate::connection::ConnectionHandle;
use crate::error::CollabError;
use crate::protocol::{ConnectionId, DocumentKey, PeerAwareness, ServerEvent};
use crate::storage::{FileStore, StoreError};

/// Name of the shared text type holding file content.
pub const TEXT_NAME: &str = "content";

/// Canonical replica of one document.
struct Replica {
    doc: yrs::Doc,
    loaded: bool,
}

impl Replica {
    fn new() -> Self {
        Self {
            doc: yrs::Doc::new(),
            loaded: false,
        }
    }

    /// Seed from persisted content. Only the first call has any effect.
    fn load(&mut self, content: Option<&str>) {
        if self.loaded {
            return;
        }
        {
            let mut txn = self.doc.transact_mut();
            let text = txn.get_or_insert_text(TEXT_NAME);
            if let Some(content) = content.filter(|c| !c.is_empty()) {
                text.insert(&mut txn, 0, content);
            }
        }
        self.loaded = true;
    }

    /// Merge an update. Returns false when it changed nothing already known.
    fn merge(&mut self, update: Update) -> Result<bool, CollabError> {
        let mut txn = self.doc.transact_mut();
        let before = txn.state_vector();
        let covered = update
            .state_vector()
            .iter()
            .all(|(client, clock)| before.get(client) >= *clock);
        // Only updates whose blocks are all known can be no-ops; deletions
        // are detected by comparing content.
        let before_text = covered.then(|| text_of(&txn));

        txn.apply_update(update)
            .map_err(|e| CollabError::MalformedUpdate(e.to_string()))?;

        Ok(match before_text {
            None => true,
            Some(text) => txn.state_vector() != before || text_of(&txn) != text,
        })
    }

    fn encode_state(&self) -> Vec<u8> {
        self.doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }

    fn encode_diff(&self, state_vector: &[u8]) -> Result<Vec<u8>, CollabError> {
        let remote = StateVector::decode_v1(state_vector)
            .map_err(|e| CollabError::MalformedUpdate(format!("state vector: {e}")))?;
        Ok(self.doc.transact().encode_diff_v1(&remote))
    }

    fn state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    fn content(&self) -> String {
        text_of(&self.doc.transact())
    }
}

fn text_of<T: ReadTxn>(txn: &T) -> String {
    txn.get_text(TEXT_NAME)
        .map(|text| text.get_string(txn))
        .unwrap_or_default()
}

/// Live in-memory state of one open document.
pub struct DocumentSession {
    key: DocumentKey,
    replica: Mutex<Replica>,
    members: BroadcastGroup,
    awareness: AwarenessTable,
    eviction: StdMutex<Option<JoinHandle<()>>>,
    dirty: AtomicBool,
}

impl DocumentSession {
    fn new(key: DocumentKey) -> Self {
        Self {
            key,
            replica: Mutex::new(Replica::new()),
            members: BroadcastGroup::new(),
            awareness: AwarenessTable::new(),
            eviction: StdMutex::new(None),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn members(&self) -> &BroadcastGroup {
        &self.members
    }

    pub fn awareness(&self) -> &AwarenessTable {
        &self.awareness
    }

    /// Merged changes not yet handed to the file store.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Current text content.
    pub async fn content(&self) -> String {
        self.replica.lock().await.content()
    }

    /// Full state as a v1 update.
    pub async fn snapshot(&self) -> Vec<u8> {
        self.replica.lock().await.encode_state()
    }

    /// Encoded state vector of the canonical replica.
    pub async fn state_vector(&self) -> Vec<u8> {
        self.replica.lock().await.state_vector()
    }

    pub fn eviction_pending(&self) -> bool {
        self.eviction
            .lock()
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }

    fn cancel_eviction(&self) {
        if let Ok(mut slot) = self.eviction.lock() {
            if let Some(timer) = slot.take() {
                timer.abort();
                log::debug!("Cancelled eviction of {}", self.key);
            }
        }
    }

    /// Claim the pending eviction. False if it was cancelled meanwhile.
    fn take_eviction(&self) -> bool {
        self.eviction
            .lock()
            .map(|mut slot| slot.take().is_some())
            .unwrap_or(false)
    }
}

/// Handed to the caller of [`DocumentRegistry::attach`].
pub struct Attachment {
    pub session: Arc<DocumentSession>,
    /// Full state to adopt as the local replica.
    pub snapshot: Vec<u8>,
    /// Awareness of the other members.
    pub awareness: Vec<PeerAwareness>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Merged and queued for this many peers.
    Applied { delivered: usize },
    /// Already known; state unchanged and nothing relayed.
    Duplicate,
}

/// Registry counters.
#[derive(Debug, Clone, Default)]
pub struct RegistryStats {
    pub active_sessions: usize,
    pub updates_applied: u64,
    pub duplicate_updates: u64,
    pub rejected_updates: u64,
    pub files_persisted: u64,
    pub persist_failures: u64,
    pub sessions_evicted: u64,
}

#[derive(Default)]
struct AtomicRegistryStats {
    updates_applied: AtomicU64,
    duplicate_updates: AtomicU64,
    rejected_updates: AtomicU64,
    files_persisted: AtomicU64,
    persist_failures: AtomicU64,
    sessions_evicted: AtomicU64,
}

pub struct DocumentRegistry {
    sessions: RwLock<HashMap<DocumentKey, Arc<DocumentSession>>>,
    store: Arc<dyn FileStore>,
    grace_period: Duration,
    max_update_bytes: usize,
    stats: AtomicRegistryStats,
}

impl DocumentRegistry {
    pub fn new(store: Arc<dyn FileStore>, grace_period: Duration, max_update_bytes: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            store,
            grace_period,
            max_update_bytes,
            stats: AtomicRegistryStats::default(),
        }
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    async fn get_or_create(&self, key: &DocumentKey) -> Arc<DocumentSession> {
        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(key) {
                return session.clone();
            }
        }

        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get(key) {
            return session.clone();
        }
        let session = Arc::new(DocumentSession::new(key.clone()));
        sessions.insert(key.clone(), session.clone());
        log::info!("Opened document session {key}");
        session
    }

    /// Open (or join) the session for `key` and register `conn` in it.
    /// The `document-snapshot` is queued to `conn` during admission, ahead
    /// of every update merged after it.
    pub async fn attach(
        self: &Arc<Self>,
        key: &DocumentKey,
        conn: &Arc<ConnectionHandle>,
    ) -> Result<Attachment, CollabError> {
        loop {
            let session = self.get_or_create(key).await;

            if !session.replica.lock().await.loaded {
                match self.load_content(key).await {
                    // A concurrent attach may have seeded it meanwhile; load is then a no-op.
                    Ok(content) => session.replica.lock().await.load(content.as_deref()),
                    Err(e) => {
                        log::error!("Failed to load {key}: {e}");
                        if session.members.is_empty().await {
                            self.schedule_eviction(&session);
                        }
                        return Err(CollabError::Storage(e));
                    }
                }
            }

            let replica = session.replica.lock().await;
            let snapshot = replica.encode_state();
            let admitted = session
                .awareness
                .admit(&session.members, conn, |awareness| ServerEvent::DocumentSnapshot {
                    project_id: key.project_id.clone(),
                    file_path: key.file_path.clone(),
                    state: snapshot.clone(),
                    awareness,
                })
                .await;
            drop(replica);

            match admitted {
                Ok(awareness) => {
                    session.cancel_eviction();
                    log::debug!("{} attached to {key}", conn.id());
                    return Ok(Attachment {
                        session,
                        snapshot,
                        awareness,
                    });
                }
                // Lost the race with eviction; the next lookup creates a fresh session.
                Err(GroupClosed) => tokio::task::yield_now().await,
            }
        }
    }

    async fn load_content(&self, key: &DocumentKey) -> Result<Option<String>, StoreError> {
        let store = self.store.clone();
        let key = key.clone();
        tokio::task::spawn_blocking(move || store.load(&key))
            .await
            .map_err(|e| StoreError::IoError(format!("load task failed: {e}")))?
    }

    /// Merge `update` from `origin` and relay it to the other members.
    pub async fn apply_update(
        &self,
        session: &DocumentSession,
        origin: &ConnectionId,
        update: &[u8],
    ) -> Result<UpdateOutcome, CollabError> {
        if update.len() > self.max_update_bytes {
            self.stats.rejected_updates.fetch_add(1, Ordering::Relaxed);
            return Err(CollabError::MalformedUpdate(format!(
                "update of {} bytes exceeds limit of {}",
                update.len(),
                self.max_update_bytes
            )));
        }

        let mut replica = session.replica.lock().await;
        if !session.members.contains(origin).await {
            return Err(CollabError::NotAttached(session.key.clone()));
        }
        // The decoded update is not Send; no await until it is merged.
        let changed = Update::decode_v1(update)
            .map_err(|e| CollabError::MalformedUpdate(e.to_string()))
            .and_then(|decoded| replica.merge(decoded))
            .inspect_err(|_| {
                self.stats.rejected_updates.fetch_add(1, Ordering::Relaxed);
            })?;
        if !changed {
            self.stats.duplicate_updates.fetch_add(1, Ordering::Relaxed);
            log::trace!("Duplicate update from {origin} on {}", session.key);
            return Ok(UpdateOutcome::Duplicate);
        }
        session.dirty.store(true, Ordering::Release);
        self.stats.updates_applied.fetch_add(1, Ordering::Relaxed);

        let event = ServerEvent::DocumentUpdate {
            project_id: session.key.project_id.clone(),
            file_path: session.key.file_path.clone(),
            origin: *origin,
            update: update.to_vec(),
        };
        // Relay under the replica lock so peers see updates in merge order.
        let delivered = session.members.broadcast(event, Some(*origin)).await;
        Ok(UpdateOutcome::Applied { delivered })
    }

    /// Updates the caller is missing, given its encoded state vector.
    pub async fn diff(
        &self,
        session: &DocumentSession,
        state_vector: &[u8],
    ) -> Result<Vec<u8>, CollabError> {
        session.replica.lock().await.encode_diff(state_vector)
    }

    /// Remove `conn` from the session. The last member out starts the
    /// eviction timer. Returns false if `conn` was not a member.
    pub async fn detach(self: &Arc<Self>, session: &Arc<DocumentSession>, conn: &ConnectionId) -> bool {
        awareness::clear(session, conn).await;
        let Some(dismissal) = session.members.dismiss(conn, |_| None).await else {
            return false;
        };
        log::debug!("{conn} detached from {}", session.key);
        if dismissal.remaining == 0 {
            self.schedule_eviction(session);
        }
        true
    }

    fn schedule_eviction(self: &Arc<Self>, session: &Arc<DocumentSession>) {
        let Ok(mut slot) = session.eviction.lock() else {
            return;
        };
        if let Some(previous) = slot.take() {
            previous.abort();
        }

        let registry = Arc::downgrade(self);
        let target = Arc::downgrade(session);
        let grace = self.grace_period;
        // Stored while the slot is held, so the timer always finds itself.
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let (Some(registry), Some(session)) = (registry.upgrade(), target.upgrade()) else {
                return;
            };
            if session.take_eviction() {
                registry.evict_if_idle(&session).await;
            }
        }));
        log::debug!("Scheduled eviction of {} in {grace:?}", session.key);
    }

    /// Drop an empty session, persisting unsaved changes first.
    async fn evict_if_idle(&self, session: &Arc<DocumentSession>) -> bool {
        if !session.members.close_if_empty().await {
            return false;
        }
        if session.is_dirty() {
            if let Err(e) = self.persist(session).await {
                log::error!("Evicting {} with unsaved changes: {e}", session.key);
            }
        }

        let mut sessions = self.sessions.write().await;
        if sessions
            .get(&session.key)
            .is_some_and(|current| Arc::ptr_eq(current, session))
        {
            sessions.remove(&session.key);
        }
        self.stats.sessions_evicted.fetch_add(1, Ordering::Relaxed);
        log::info!("Evicted idle session {}", session.key);
        true
    }

    /// Write the session's current content to the file store.
    pub async fn persist(&self, session: &DocumentSession) -> Result<(), StoreError> {
        let content = {
            let replica = session.replica.lock().await;
            session.dirty.store(false, Ordering::Release);
            replica.content()
        };
        let store = self.store.clone();
        let key = session.key.clone();
        let saved = tokio::task::spawn_blocking(move || store.save(&key, &content))
            .await
            .map_err(|e| StoreError::IoError(format!("save task failed: {e}")))
            .and_then(|result| result);
        match saved {
            Ok(()) => {
                self.stats.files_persisted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                session.dirty.store(true, Ordering::Release);
                self.stats.persist_failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Persist every dirty session. Returns how many were written.
    pub async fn flush_dirty(&self) -> usize {
        let dirty: Vec<Arc<DocumentSession>> = {
            let sessions = self.sessions.read().await;
            sessions.values().filter(|s| s.is_dirty()).cloned().collect()
        };
        let mut written = 0;
        for session in dirty {
            match self.persist(&session).await {
                Ok(()) => written += 1,
                Err(e) => log::error!("Periodic save of {} failed: {e}", session.key),
            }
        }
        if written > 0 {
            log::debug!("Flushed {written} dirty documents");
        }
        written
    }

    pub async fn session(&self, key: &DocumentKey) -> Option<Arc<DocumentSession>> {
        self.sessions.read().await.get(key).cloned()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn stats(&self) -> RegistryStats {
        RegistryStats {
            active_sessions: self.session_count().await,
            updates_applied: self.stats.updates_applied.load(Ordering::Relaxed),
            duplicate_updates: self.stats.duplicate_updates.load(Ordering::Relaxed),
            rejected_updates: self.stats.rejected_updates.load(Ordering::Relaxed),
            files_persisted: self.stats.files_persisted.load(Ordering::Relaxed),
            persist_failures: self.stats.persist_failures.load(Ordering::Relaxed),
            sessions_evicted: self.stats.sessions_evicted.load(Ordering::Relaxed),
        }
    }
}
