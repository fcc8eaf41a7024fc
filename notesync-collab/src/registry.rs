//! Document Registry: process-wide map from document name to live replica.
//!
//! ```text
//!   join("doc-A") ──► get_or_create ──► attach ──► Receiver<Relayed>
//!                          │               │
//!                          ▼               ▼
//!                  ┌──────────────────────────────┐
//!                  │ entries: name → DocumentEntry │  (one tokio Mutex)
//!                  └──────────────────────────────┘
//!                          ▲               ▲
//!   detach("doc-A") ───────┘               └── eviction task (after grace)
//! ```
//!
//! `get_or_create`, `attach`, `detach` and `evict` all run inside the same
//! lock with no suspension point in the critical section, so a document is
//! never created twice and never evicted while a session is attached.
//!
//! Each attach bumps the entry's epoch. A scheduled eviction carries the
//! entry and the epoch it saw, and is a no-op if the name now maps to a
//! different entry or any attach happened since.

use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::awareness::AwarenessStates;
use crate::broadcast::{BroadcastGroup, Relayed};
use crate::config::ServerConfig;
use crate::document::ReplicatedDocument;
use crate::error::{CollabError, Result};
use crate::protocol::PeerInfo;
use crate::store::DocumentStore;

/// Attempts `join` makes before giving up on a contended name.
const MAX_JOIN_ATTEMPTS: usize = 8;

/// Registry tuning, usually derived from [`ServerConfig`].
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub broadcast_capacity: usize,
    pub eviction_grace: Duration,
    pub max_sessions_per_document: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

impl From<&ServerConfig> for RegistryConfig {
    fn from(config: &ServerConfig) -> Self {
        Self {
            broadcast_capacity: config.broadcast_capacity,
            eviction_grace: config.eviction_grace(),
            max_sessions_per_document: config.max_sessions_per_document,
        }
    }
}

/// One live document: replica, attached sessions, presence.
pub struct DocumentEntry {
    name: String,
    document: ReplicatedDocument,
    group: BroadcastGroup,
    awareness: Mutex<AwarenessStates>,
    epoch: AtomicU64,
}

impl DocumentEntry {
    fn new(name: &str, broadcast_capacity: usize) -> Self {
        Self {
            name: name.to_string(),
            document: ReplicatedDocument::new(name),
            group: BroadcastGroup::new(broadcast_capacity),
            awareness: Mutex::new(AwarenessStates::new()),
            epoch: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn document(&self) -> &ReplicatedDocument {
        &self.document
    }

    pub fn group(&self) -> &BroadcastGroup {
        &self.group
    }

    pub fn awareness(&self) -> MutexGuard<'_, AwarenessStates> {
        self.awareness.lock()
    }

    pub fn session_count(&self) -> usize {
        self.group.session_count()
    }
}

impl std::fmt::Debug for DocumentEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentEntry")
            .field("name", &self.name)
            .field("sessions", &self.session_count())
            .finish_non_exhaustive()
    }
}

type EntryMap = HashMap<String, Arc<DocumentEntry>>;

struct RegistryInner {
    entries: tokio::sync::Mutex<EntryMap>,
    config: RegistryConfig,
    store: Option<Arc<dyn DocumentStore>>,
    documents_created: AtomicU64,
    documents_evicted: AtomicU64,
}

/// The registry. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct DocumentRegistry {
    inner: Arc<RegistryInner>,
}

impl DocumentRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self::build(config, None)
    }

    /// Registry that seeds new documents from, and saves evicted ones to, `store`.
    pub fn with_store(config: RegistryConfig, store: Arc<dyn DocumentStore>) -> Self {
        Self::build(config, Some(store))
    }

    fn build(config: RegistryConfig, store: Option<Arc<dyn DocumentStore>>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                entries: tokio::sync::Mutex::new(HashMap::new()),
                config,
                store,
                documents_created: AtomicU64::new(0),
                documents_evicted: AtomicU64::new(0),
            }),
        }
    }

    /// Return the entry for `name`, creating it if absent.
    ///
    /// A freshly created entry has no sessions; it is evicted after the grace
    /// period unless something attaches first. With a zero grace period it
    /// stays until its last session detaches or `evict` is called.
    pub async fn get_or_create(&self, name: &str) -> Arc<DocumentEntry> {
        let mut entries = self.inner.entries.lock().await;
        if let Some(entry) = entries.get(name) {
            return entry.clone();
        }

        let entry = Arc::new(DocumentEntry::new(name, self.inner.config.broadcast_capacity));
        self.seed_from_store(&entry);
        entries.insert(name.to_string(), entry.clone());
        self.inner.documents_created.fetch_add(1, Ordering::Relaxed);
        log::info!("Created document '{name}' ({} live)", entries.len());
        drop(entries);

        if !self.inner.config.eviction_grace.is_zero() {
            self.schedule_eviction(&entry, 0);
        }
        entry
    }

    /// Attach a session to `entry`, which must still be the registered entry
    /// for `name`.
    ///
    /// Fails with `RegistryRaceDetected` if the entry was evicted (and maybe
    /// replaced) since it was looked up.
    pub async fn attach(
        &self,
        name: &str,
        entry: &Arc<DocumentEntry>,
        info: PeerInfo,
    ) -> Result<broadcast::Receiver<Relayed>> {
        let entries = self.inner.entries.lock().await;
        match entries.get(name) {
            Some(current) if Arc::ptr_eq(current, entry) => {}
            _ => return Err(CollabError::RegistryRaceDetected(name.to_string())),
        }

        let limit = self.inner.config.max_sessions_per_document;
        if entry.session_count() >= limit {
            return Err(CollabError::DocumentFull { name: name.to_string(), limit });
        }

        entry.epoch.fetch_add(1, Ordering::SeqCst);
        let session_id = info.session_id;
        let rx = entry.group.add_session(info);
        log::info!(
            "Session {session_id} attached to '{name}' ({} sessions)",
            entry.session_count()
        );
        Ok(rx)
    }

    /// `get_or_create` followed by `attach`, retrying on a registry race.
    pub async fn join(
        &self,
        name: &str,
        info: PeerInfo,
    ) -> Result<(Arc<DocumentEntry>, broadcast::Receiver<Relayed>)> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let entry = self.get_or_create(name).await;
            match self.attach(name, &entry, info.clone()).await {
                Ok(rx) => return Ok((entry, rx)),
                Err(CollabError::RegistryRaceDetected(_)) if attempts < MAX_JOIN_ATTEMPTS => {
                    log::debug!("Registry race on '{name}', retrying (attempt {attempts})");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Remove a session from `name`. Returns whether it was attached.
    ///
    /// Emptying the session set schedules eviction, or evicts on the spot
    /// when the grace period is zero.
    pub async fn detach(&self, name: &str, session_id: &Uuid) -> bool {
        let mut entries = self.inner.entries.lock().await;
        let Some(entry) = entries.get(name).cloned() else {
            return false;
        };
        if entry.group.remove_session(session_id).is_none() {
            return false;
        }
        log::info!(
            "Session {session_id} detached from '{name}' ({} sessions)",
            entry.session_count()
        );

        if entry.group.is_empty() {
            if self.inner.config.eviction_grace.is_zero() {
                self.evict_locked(&mut entries, name, None);
            } else {
                let epoch = entry.epoch.load(Ordering::SeqCst);
                drop(entries);
                self.schedule_eviction(&entry, epoch);
            }
        }
        true
    }

    /// Remove `name` if no session is attached. Returns whether it was removed.
    pub async fn evict(&self, name: &str) -> bool {
        let mut entries = self.inner.entries.lock().await;
        self.evict_locked(&mut entries, name, None)
    }

    pub async fn get(&self, name: &str) -> Option<Arc<DocumentEntry>> {
        self.inner.entries.lock().await.get(name).cloned()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.inner.entries.lock().await.contains_key(name)
    }

    pub async fn document_count(&self) -> usize {
        self.inner.entries.lock().await.len()
    }

    pub async fn active_documents(&self) -> Vec<String> {
        self.inner.entries.lock().await.keys().cloned().collect()
    }

    /// Replicas constructed over the registry's lifetime.
    pub fn documents_created(&self) -> u64 {
        self.inner.documents_created.load(Ordering::Relaxed)
    }

    pub fn documents_evicted(&self) -> u64 {
        self.inner.documents_evicted.load(Ordering::Relaxed)
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    fn seed_from_store(&self, entry: &DocumentEntry) {
        let Some(store) = &self.inner.store else {
            return;
        };
        match store.load_document(&entry.name) {
            Ok(Some(snapshot)) => match entry.document.load_snapshot(&snapshot) {
                Ok(()) => log::info!("Loaded snapshot for '{}'", entry.name),
                Err(e) => log::error!("Discarding unreadable snapshot for '{}': {e}", entry.name),
            },
            Ok(None) => {}
            Err(e) => log::error!("Failed to load '{}': {e}", entry.name),
        }
    }

    /// Evict under an already-held lock. With `expected`, only evict if
    /// `name` still maps to that entry and no attach happened since the
    /// epoch was observed.
    fn evict_locked(
        &self,
        entries: &mut EntryMap,
        name: &str,
        expected: Option<(&Arc<DocumentEntry>, u64)>,
    ) -> bool {
        let Some(entry) = entries.get(name) else {
            return false;
        };
        if !entry.group.is_empty() {
            log::debug!("Eviction of '{name}' skipped: sessions attached");
            return false;
        }
        if let Some((scheduled, epoch)) = expected {
            if !Arc::ptr_eq(entry, scheduled) {
                log::debug!("Eviction of '{name}' skipped: entry replaced");
                return false;
            }
            if entry.epoch.load(Ordering::SeqCst) != epoch {
                log::debug!("Eviction of '{name}' skipped: re-attached during grace");
                return false;
            }
        }

        if let Some(store) = &self.inner.store {
            if let Err(e) = store.save_document(name, &entry.document.encode_state()) {
                log::error!("Failed to save '{name}' before eviction: {e}");
            }
        }
        entries.remove(name);
        self.inner.documents_evicted.fetch_add(1, Ordering::Relaxed);
        log::info!("Evicted document '{name}' ({} live)", entries.len());
        true
    }

    fn schedule_eviction(&self, entry: &Arc<DocumentEntry>, epoch: u64) {
        let registry = self.clone();
        let scheduled: Weak<DocumentEntry> = Arc::downgrade(entry);
        let grace = self.inner.config.eviction_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            // Gone already: evicted and released by everyone.
            let Some(scheduled) = scheduled.upgrade() else {
                return;
            };
            let mut entries = registry.inner.entries.lock().await;
            registry.evict_locked(&mut entries, &scheduled.name, Some((&scheduled, epoch)));
        });
    }
}
