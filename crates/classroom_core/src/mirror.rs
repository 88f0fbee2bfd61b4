//! crates/classroom_core/src/mirror.rs
//!
//! Keeps the local cache and the remote document store eventually consistent.
//!
//! Reads always go through the local cache. Writes land locally first, then
//! queue a remote operation on an explicit pending-write queue that a
//! background writer drains with exponential backoff. Remote snapshots
//! replace local collections, except for records whose local write has not
//! been acknowledged yet and is newer than the incoming copy.

use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::{
    ACHIEVEMENTS, ALBUM, ANNOUNCEMENTS, APPLICATIONS, CAMPAIGNS, SCHEDULE, SETTINGS, USERS,
};
use crate::ports::{
    record_id, record_path, record_version, records_from_children, LocalCacheStore, PortError,
    PortResult, RemoteDocumentStore,
};

//=========================================================================================
// Mirrored Keys
//=========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    /// An ordered list of records unique by `id`.
    Collection,
    /// Exactly one document stored directly at the key.
    Singleton,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MirroredKey {
    pub name: &'static str,
    pub kind: KeyKind,
}

impl MirroredKey {
    pub const fn collection(name: &'static str) -> Self {
        Self { name, kind: KeyKind::Collection }
    }

    pub const fn singleton(name: &'static str) -> Self {
        Self { name, kind: KeyKind::Singleton }
    }
}

/// Keys pushed to an uninitialized remote and kept subscribed afterwards.
pub const MIRRORED_KEYS: &[MirroredKey] = &[
    MirroredKey::collection(USERS),
    MirroredKey::collection(ANNOUNCEMENTS),
    MirroredKey::collection(SCHEDULE),
    MirroredKey::singleton(SETTINGS),
    MirroredKey::collection(ALBUM),
    MirroredKey::collection(ACHIEVEMENTS),
    MirroredKey::collection(CAMPAIGNS),
];

/// Applications are reconciled separately but subscribed like any other key.
pub const APPLICATIONS_KEY: MirroredKey = MirroredKey::collection(APPLICATIONS);

//=========================================================================================
// Pending Writes
//=========================================================================================

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt after `attempts` consecutive failures.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempts.saturating_sub(1));
        self.base.saturating_mul(factor).min(self.max)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum WriteOp {
    Set(Value),
    Update(Value),
    Remove,
}

/// An unacknowledged remote write.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingWrite {
    pub collection: String,
    pub id: Option<String>,
    pub op: WriteOp,
    pub version: u64,
    pub attempts: u32,
    pub last_error: Option<String>,
    #[serde(skip)]
    pub not_before: Instant,
}

impl PendingWrite {
    pub fn path(&self) -> String {
        match &self.id {
            Some(id) => record_path(&self.collection, id),
            None => self.collection.clone(),
        }
    }

    fn is_removal(&self) -> bool {
        matches!(self.op, WriteOp::Remove)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    WriteAcknowledged {
        collection: String,
        id: Option<String>,
        version: u64,
    },
    /// `retryable` is set for applications, whose failures the UI offers to
    /// retry by hand.
    WriteFailed {
        collection: String,
        id: Option<String>,
        attempts: u32,
        error: String,
        retryable: bool,
    },
    SnapshotApplied {
        collection: String,
        records: usize,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootstrapReport {
    /// The remote had no users and was seeded from the local cache.
    pub seeded_remote: bool,
    pub pushed_records: usize,
    /// Applications pushed by the reconciliation pass.
    pub reconciled: Vec<String>,
}

//=========================================================================================
// Mirror Synchronizer
//=========================================================================================

pub struct MirrorSynchronizer {
    local: Arc<dyn LocalCacheStore>,
    remote: Arc<dyn RemoteDocumentStore>,
    /// Keyed by store path; at most one queued write per record.
    pending: Mutex<BTreeMap<String, PendingWrite>>,
    /// Serializes read-modify-write cycles on the local cache.
    local_guard: Mutex<()>,
    wake: Notify,
    events: broadcast::Sender<SyncEvent>,
    retry: RetryPolicy,
    /// Set once `bootstrap` has completed against the remote.
    bootstrapped: AtomicBool,
}

impl MirrorSynchronizer {
    pub fn new(
        local: Arc<dyn LocalCacheStore>,
        remote: Arc<dyn RemoteDocumentStore>,
        retry: RetryPolicy,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            local,
            remote,
            pending: Mutex::new(BTreeMap::new()),
            local_guard: Mutex::new(()),
            wake: Notify::new(),
            events,
            retry,
            bootstrapped: AtomicBool::new(false),
        }
    }

    pub fn local(&self) -> &dyn LocalCacheStore {
        self.local.as_ref()
    }

    pub fn remote(&self) -> &Arc<dyn RemoteDocumentStore> {
        &self.remote
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn records(&self, collection: &str) -> Vec<Value> {
        self.local.get_collection(collection)
    }

    pub fn find_record(&self, collection: &str, id: &str) -> Option<Value> {
        self.records(collection)
            .into_iter()
            .find(|r| record_id(r) == Some(id))
    }

    fn lock_local(&self) -> MutexGuard<'_, ()> {
        self.local_guard.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_pending(&self) -> MutexGuard<'_, BTreeMap<String, PendingWrite>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: SyncEvent) {
        // No receivers is fine; events are advisory.
        let _ = self.events.send(event);
    }

    //-------------------------------------------------------------------------------------
    // Write protocol
    //-------------------------------------------------------------------------------------

    /// Inserts or replaces a record locally, stamps its version and queues a
    /// full remote overwrite. Returns the stored record.
    pub fn put_record(&self, collection: &str, record: Value) -> PortResult<Value> {
        let id = record_id(&record)
            .map(str::to_string)
            .ok_or_else(|| PortError::Unexpected(format!("record in '{}' has no id", collection)))?;

        let _guard = self.lock_local();
        let records = self.local.get_collection(collection);
        let position = records.iter().position(|r| record_id(r) == Some(id.as_str()));
        self.store_locked(collection, &id, records, position, record)
    }

    /// Loads, changes and stores one record while holding the local guard, so
    /// concurrent read-modify-write cycles on the same record cannot interleave.
    /// Returns `Ok(None)` when the record is unknown; `change` must not write
    /// through the mirror.
    pub fn update_record<E>(
        &self,
        collection: &str,
        id: &str,
        change: impl FnOnce(Value) -> Result<Value, E>,
    ) -> Result<Option<Value>, E>
    where
        E: From<PortError>,
    {
        let _guard = self.lock_local();
        let records = self.local.get_collection(collection);
        let Some(position) = records.iter().position(|r| record_id(r) == Some(id)) else {
            return Ok(None);
        };
        let updated = change(records[position].clone())?;
        if record_id(&updated) != Some(id) {
            return Err(PortError::Unexpected(format!("update of '{}/{}' changed its id", collection, id)).into());
        }
        Ok(Some(self.store_locked(collection, id, records, Some(position), updated)?))
    }

    /// Stamps the next version onto `record`, writes the collection and queues
    /// the remote overwrite. Callers hold the local guard.
    fn store_locked(
        &self,
        collection: &str,
        id: &str,
        mut records: Vec<Value>,
        position: Option<usize>,
        mut record: Value,
    ) -> PortResult<Value> {
        let version = position.map(|i| record_version(&records[i])).unwrap_or(0) + 1;
        if let Value::Object(fields) = &mut record {
            fields.insert("version".to_string(), Value::from(version));
        }
        match position {
            Some(i) => records[i] = record.clone(),
            None => records.push(record.clone()),
        }
        self.local.set_collection(collection, records)?;
        self.enqueue(collection, Some(id), WriteOp::Set(record.clone()), version);
        Ok(record)
    }

    /// Shallow-merges `partial` into an existing record and queues a remote
    /// merge of the same fields. Returns `None` when the record is unknown.
    pub fn merge_record(&self, collection: &str, id: &str, partial: Value) -> PortResult<Option<Value>> {
        let Value::Object(mut changes) = partial else {
            return Err(PortError::Unexpected("partial update must be an object".to_string()));
        };
        changes.remove("id");

        let _guard = self.lock_local();
        let mut records = self.local.get_collection(collection);
        let Some(position) = records.iter().position(|r| record_id(r) == Some(id)) else {
            return Ok(None);
        };
        let version = record_version(&records[position]) + 1;
        changes.insert("version".to_string(), Value::from(version));
        if let Value::Object(fields) = &mut records[position] {
            for (key, value) in &changes {
                fields.insert(key.clone(), value.clone());
            }
        }
        let merged = records[position].clone();
        self.local.set_collection(collection, records)?;
        self.enqueue(collection, Some(id), WriteOp::Update(Value::Object(changes)), version);
        Ok(Some(merged))
    }

    /// Removes a record locally and queues the remote removal. An id unknown to
    /// the local cache is a no-op and returns `false`.
    pub fn remove_record(&self, collection: &str, id: &str) -> PortResult<bool> {
        let _guard = self.lock_local();
        let mut records = self.local.get_collection(collection);
        let before = records.len();
        let version = records
            .iter()
            .find(|r| record_id(r) == Some(id))
            .map(record_version)
            .unwrap_or(0)
            + 1;
        records.retain(|r| record_id(r) != Some(id));
        if records.len() == before {
            return Ok(false);
        }
        self.local.set_collection(collection, records)?;
        self.enqueue(collection, Some(id), WriteOp::Remove, version);
        Ok(true)
    }

    pub fn put_singleton(&self, key: &str, mut value: Value) -> PortResult<Value> {
        let _guard = self.lock_local();
        let version = self.local.get_singleton(key).as_ref().map(record_version).unwrap_or(0) + 1;
        if let Value::Object(fields) = &mut value {
            fields.insert("version".to_string(), Value::from(version));
        }
        self.local.set_singleton(key, value.clone())?;
        self.enqueue(key, None, WriteOp::Set(value.clone()), version);
        Ok(value)
    }

    fn enqueue(&self, collection: &str, id: Option<&str>, op: WriteOp, version: u64) {
        let path = match id {
            Some(id) => record_path(collection, id),
            None => collection.to_string(),
        };
        let mut pending = self.lock_pending();
        match pending.get_mut(&path) {
            Some(queued) => {
                queued.op = coalesce(std::mem::replace(&mut queued.op, WriteOp::Remove), op);
                queued.version = version;
                queued.attempts = 0;
                queued.not_before = Instant::now();
            }
            None => {
                pending.insert(
                    path,
                    PendingWrite {
                        collection: collection.to_string(),
                        id: id.map(str::to_string),
                        op,
                        version,
                        attempts: 0,
                        last_error: None,
                        not_before: Instant::now(),
                    },
                );
            }
        }
        drop(pending);
        self.wake.notify_one();
    }

    //-------------------------------------------------------------------------------------
    // Pending queue draining
    //-------------------------------------------------------------------------------------

    pub fn pending(&self) -> Vec<PendingWrite> {
        self.lock_pending().values().cloned().collect()
    }

    /// Attempts every due write once. Returns how many were acknowledged.
    pub async fn flush(&self) -> usize {
        let now = Instant::now();
        let due: Vec<PendingWrite> = self
            .lock_pending()
            .values()
            .filter(|w| w.not_before <= now)
            .cloned()
            .collect();

        let mut acknowledged = 0;
        for write in due {
            if self.attempt(write).await {
                acknowledged += 1;
            }
        }
        acknowledged
    }

    /// Re-attempts the queued write for `path` immediately, ignoring its
    /// backoff. Returns `None` when nothing is queued for that path.
    pub async fn retry(&self, path: &str) -> Option<bool> {
        let write = self.lock_pending().get(path.trim_matches('/')).cloned()?;
        Some(self.attempt(write).await)
    }

    async fn attempt(&self, write: PendingWrite) -> bool {
        let path = write.path();
        let result = match &write.op {
            WriteOp::Set(value) => self.remote.set_data(&path, value.clone()).await,
            WriteOp::Update(partial) => self.remote.update_data(&path, partial.clone()).await,
            WriteOp::Remove => self.remote.remove_data(&path).await,
        };

        match result {
            Ok(()) => {
                {
                    let mut pending = self.lock_pending();
                    if pending.get(&path).is_some_and(|q| q.version == write.version) {
                        pending.remove(&path);
                    }
                }
                debug!(path = %path, version = write.version, "Remote write acknowledged");
                self.emit(SyncEvent::WriteAcknowledged {
                    collection: write.collection,
                    id: write.id,
                    version: write.version,
                });
                true
            }
            Err(e) => {
                let attempts = {
                    let mut pending = self.lock_pending();
                    match pending.get_mut(&path) {
                        Some(queued) if queued.version == write.version => {
                            queued.attempts += 1;
                            queued.last_error = Some(e.to_string());
                            queued.not_before = Instant::now() + self.retry.delay_for(queued.attempts);
                            queued.attempts
                        }
                        _ => write.attempts + 1,
                    }
                };
                warn!(path = %path, attempts, error = %e, "Remote write failed; queued for retry");
                self.emit(SyncEvent::WriteFailed {
                    retryable: write.collection == APPLICATIONS,
                    collection: write.collection,
                    id: write.id,
                    attempts,
                    error: e.to_string(),
                });
                false
            }
        }
    }

    /// Drains the pending queue until `cancel` fires, sleeping until the next
    /// write is due or a new write is queued.
    pub async fn run_writer(self: Arc<Self>, cancel: CancellationToken) {
        info!("Mirror writer started.");
        loop {
            self.flush().await;

            let idle = self
                .lock_pending()
                .values()
                .map(|w| w.not_before.saturating_duration_since(Instant::now()))
                .min()
                .unwrap_or(self.retry.max);

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(idle) => {}
            }
        }
        let left = self.lock_pending().len();
        info!(pending = left, "Mirror writer stopped.");
    }

    //-------------------------------------------------------------------------------------
    // Startup
    //-------------------------------------------------------------------------------------

    /// Seeds an uninitialized remote from the local cache, then reconciles
    /// applications. Listeners are installed separately via `spawn_listeners`,
    /// which retries this until it succeeds.
    pub async fn bootstrap(&self) -> PortResult<BootstrapReport> {
        let remote_users = self.remote.get_all(USERS).await?;
        let mut report = BootstrapReport::default();

        if remote_users.is_empty() {
            info!("Remote store has no users; pushing local collections.");
            report.seeded_remote = true;
            for key in MIRRORED_KEYS {
                report.pushed_records += self.push_key(key).await;
            }
        }

        report.reconciled = self.reconcile_applications().await?;
        self.bootstrapped.store(true, Ordering::Release);
        info!(
            seeded = report.seeded_remote,
            pushed = report.pushed_records,
            reconciled = report.reconciled.len(),
            "Mirror bootstrap complete."
        );
        Ok(report)
    }

    async fn push_key(&self, key: &MirroredKey) -> usize {
        let mut pushed = 0;
        match key.kind {
            KeyKind::Collection => {
                for record in self.local.get_collection(key.name) {
                    let Some(id) = record_id(&record).map(str::to_string) else {
                        warn!(collection = key.name, "Skipping local record without id");
                        continue;
                    };
                    if self.push_now(key.name, Some(&id), record).await {
                        pushed += 1;
                    }
                }
            }
            KeyKind::Singleton => {
                if let Some(value) = self.local.get_singleton(key.name) {
                    if self.push_now(key.name, None, value).await {
                        pushed += 1;
                    }
                }
            }
        }
        pushed
    }

    /// Writes directly to the remote; a failure falls back to the queue.
    async fn push_now(&self, collection: &str, id: Option<&str>, value: Value) -> bool {
        let path = match id {
            Some(id) => record_path(collection, id),
            None => collection.to_string(),
        };
        match self.remote.set_data(&path, value.clone()).await {
            Ok(()) => true,
            Err(e) => {
                warn!(path = %path, error = %e, "Initial push failed; queued for retry");
                let version = record_version(&value);
                self.enqueue(collection, id, WriteOp::Set(value), version);
                false
            }
        }
    }

    /// Pushes every local application missing from the remote. Returns the ids
    /// that reached the remote.
    pub async fn reconcile_applications(&self) -> PortResult<Vec<String>> {
        let remote_ids: HashSet<String> = self
            .remote
            .get_all(APPLICATIONS)
            .await?
            .iter()
            .filter_map(|r| record_id(r).map(str::to_string))
            .collect();

        let mut pushed = Vec::new();
        for record in self.local.get_collection(APPLICATIONS) {
            let Some(id) = record_id(&record).map(str::to_string) else {
                continue;
            };
            if remote_ids.contains(&id) {
                continue;
            }
            if self.push_now(APPLICATIONS, Some(&id), record).await {
                info!(application_id = %id, "Reconciled application missing from remote");
                pushed.push(id);
            }
        }
        Ok(pushed)
    }

    /// Installs one listener per mirrored key plus applications. No snapshot is
    /// applied until `bootstrap` has succeeded, retrying it with backoff while
    /// the remote is unreachable. Each listener resubscribes after a dropped
    /// stream until `cancel` fires.
    pub fn spawn_listeners(self: &Arc<Self>, cancel: &CancellationToken) -> JoinHandle<()> {
        let mirror = Arc::clone(self);
        let cancel = cancel.child_token();
        tokio::spawn(async move {
            if !mirror.await_bootstrap(&cancel).await {
                return;
            }
            let listeners = MIRRORED_KEYS
                .iter()
                .chain(std::iter::once(&APPLICATIONS_KEY))
                .map(|key| mirror.listen(*key, cancel.clone()));
            futures::future::join_all(listeners).await;
        })
    }

    /// Returns `false` if cancelled before the bootstrap went through.
    async fn await_bootstrap(&self, cancel: &CancellationToken) -> bool {
        let mut failures = 0;
        while !self.bootstrapped.load(Ordering::Acquire) {
            let Err(e) = self.bootstrap().await else {
                break;
            };
            failures += 1;
            let delay = self.retry.delay_for(failures);
            warn!(attempts = failures, error = %e, ?delay, "Mirror bootstrap failed; retrying");
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        !cancel.is_cancelled()
    }

    async fn listen(&self, key: MirroredKey, cancel: CancellationToken) {
        while !cancel.is_cancelled() {
            // Local-only applications have no pending write guarding them, so
            // they reach the remote before any snapshot can replace the cache.
            let reconciled = if key == APPLICATIONS_KEY {
                self.reconcile_applications().await.map(|_| ())
            } else {
                Ok(())
            };
            let subscribed = match reconciled {
                Ok(()) => self.remote.subscribe(key.name).await,
                Err(e) => Err(e),
            };
            match subscribed {
                Ok(mut snapshots) => loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        next = snapshots.next() => match next {
                            Some(snapshot) => {
                                if let Err(e) = self.apply_snapshot(&key, snapshot) {
                                    warn!(key = key.name, error = %e, "Failed to apply remote snapshot");
                                }
                            }
                            None => {
                                warn!(key = key.name, "Remote subscription ended; resubscribing");
                                break;
                            }
                        }
                    }
                },
                Err(e) => warn!(key = key.name, error = %e, "Failed to subscribe to remote"),
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.retry.max) => {}
            }
        }
    }

    /// Replaces the local copy of `key` with a remote snapshot, keeping local
    /// records whose unacknowledged write is newer than the incoming copy.
    pub fn apply_snapshot(&self, key: &MirroredKey, snapshot: Option<Value>) -> PortResult<usize> {
        let _guard = self.lock_local();
        let guards: BTreeMap<String, (u64, bool)> = self
            .lock_pending()
            .values()
            .filter(|w| w.collection == key.name)
            .map(|w| (w.id.clone().unwrap_or_default(), (w.version, w.is_removal())))
            .collect();

        match key.kind {
            KeyKind::Singleton => {
                let Some(incoming) = snapshot else {
                    return Ok(0);
                };
                if let Some((version, _)) = guards.get("") {
                    if record_version(&incoming) < *version {
                        debug!(key = key.name, "Ignoring stale singleton snapshot");
                        return Ok(0);
                    }
                }
                self.local.set_singleton(key.name, incoming)?;
                self.emit(SyncEvent::SnapshotApplied {
                    collection: key.name.to_string(),
                    records: 1,
                });
                Ok(1)
            }
            KeyKind::Collection => {
                let incoming = snapshot.as_ref().map(records_from_children).unwrap_or_default();
                let local = self.local.get_collection(key.name);
                let local_copy = |id: &str| local.iter().find(|r| record_id(r) == Some(id)).cloned();

                let mut seen = HashSet::new();
                let mut merged = Vec::with_capacity(incoming.len());
                for record in incoming {
                    let Some(id) = record_id(&record).map(str::to_string) else {
                        continue;
                    };
                    seen.insert(id.clone());
                    match guards.get(&id) {
                        Some((_, true)) => {}
                        Some((version, false)) if record_version(&record) < *version => {
                            debug!(key = key.name, id = %id, "Keeping newer local record over stale snapshot");
                            merged.extend(local_copy(&id));
                        }
                        _ => merged.push(record),
                    }
                }
                for (id, (_, removed)) in &guards {
                    if !removed && !seen.contains(id) {
                        merged.extend(local_copy(id));
                    }
                }

                let count = merged.len();
                self.local.set_collection(key.name, merged)?;
                self.emit(SyncEvent::SnapshotApplied {
                    collection: key.name.to_string(),
                    records: count,
                });
                Ok(count)
            }
        }
    }
}

fn coalesce(queued: WriteOp, next: WriteOp) -> WriteOp {
    match (queued, next) {
        (WriteOp::Set(mut base), WriteOp::Update(partial)) => {
            merge_into(&mut base, partial);
            WriteOp::Set(base)
        }
        (WriteOp::Update(mut base), WriteOp::Update(partial)) => {
            merge_into(&mut base, partial);
            WriteOp::Update(base)
        }
        (_, next) => next,
    }
}

fn merge_into(base: &mut Value, partial: Value) {
    if let (Value::Object(fields), Value::Object(changes)) = (base, partial) {
        for (key, value) in changes {
            fields.insert(key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryCache, InMemoryRemote};
    use serde_json::json;

    fn setup(retry: RetryPolicy) -> (Arc<MirrorSynchronizer>, Arc<InMemoryCache>, Arc<InMemoryRemote>) {
        let cache = Arc::new(InMemoryCache::new());
        let remote = Arc::new(InMemoryRemote::new());
        let mirror = Arc::new(MirrorSynchronizer::new(cache.clone(), remote.clone(), retry));
        (mirror, cache, remote)
    }

    fn immediate() -> RetryPolicy {
        RetryPolicy {
            base: Duration::ZERO,
            max: Duration::ZERO,
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            base: Duration::from_millis(100),
            max: Duration::from_millis(500),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_put_record_writes_locally_before_remote() {
        let (mirror, cache, remote) = setup(immediate());
        let stored = mirror
            .put_record(ANNOUNCEMENTS, json!({"id": "a1", "title": "Quiz"}))
            .unwrap();
        assert_eq!(stored["version"], 1);
        assert_eq!(cache.get_collection(ANNOUNCEMENTS).len(), 1);
        assert!(remote.get_one("announcements/a1").await.unwrap().is_none());

        assert_eq!(mirror.flush().await, 1);
        let pushed = remote.get_one("announcements/a1").await.unwrap().unwrap();
        assert_eq!(pushed["title"], "Quiz");
        assert!(mirror.pending().is_empty());
    }

    #[tokio::test]
    async fn test_failed_write_stays_queued_and_raises_retryable_event() {
        let (mirror, cache, remote) = setup(immediate());
        let mut events = mirror.subscribe_events();
        remote.set_offline(true);

        mirror.put_record(APPLICATIONS, json!({"id": "x", "status": "pending"})).unwrap();
        assert_eq!(mirror.flush().await, 0);

        // The local write is never rolled back.
        assert_eq!(cache.get_collection(APPLICATIONS).len(), 1);
        let pending = mirror.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 1);
        assert!(pending[0].last_error.is_some());
        match events.try_recv().unwrap() {
            SyncEvent::WriteFailed { retryable, id, .. } => {
                assert!(retryable);
                assert_eq!(id.as_deref(), Some("x"));
            }
            other => panic!("unexpected event {:?}", other),
        }

        remote.set_offline(false);
        assert_eq!(mirror.retry("applications/x").await, Some(true));
        assert!(mirror.pending().is_empty());
        assert!(remote.get_one("applications/x").await.unwrap().is_some());
        assert_eq!(mirror.retry("applications/x").await, None);
    }

    #[tokio::test]
    async fn test_queued_writes_coalesce_per_record() {
        let (mirror, _cache, remote) = setup(immediate());
        mirror.put_record(USERS, json!({"id": "u", "name": "Ana"})).unwrap();
        mirror.merge_record(USERS, "u", json!({"active": true})).unwrap();
        assert_eq!(mirror.pending().len(), 1);

        mirror.flush().await;
        assert_eq!(remote.write_count(), 1);
        let user = remote.get_one("users/u").await.unwrap().unwrap();
        assert_eq!(user["name"], "Ana");
        assert_eq!(user["active"], true);
        assert_eq!(user["version"], 2);
    }

    #[tokio::test]
    async fn test_merge_unknown_record_is_noop() {
        let (mirror, _cache, _remote) = setup(immediate());
        assert!(mirror.merge_record(USERS, "ghost", json!({"a": 1})).unwrap().is_none());
        assert!(mirror.pending().is_empty());
    }

    #[tokio::test]
    async fn test_stale_snapshot_does_not_clobber_unacknowledged_write() {
        let (mirror, cache, remote) = setup(immediate());
        remote
            .set_data("applications/a", json!({"status": "pending", "version": 1}))
            .await
            .unwrap();
        cache
            .set_collection(APPLICATIONS, vec![json!({"id": "a", "status": "pending", "version": 1})])
            .unwrap();

        mirror
            .put_record(APPLICATIONS, json!({"id": "a", "status": "verifying"}))
            .unwrap();

        // The remote still holds version 1 when its snapshot arrives.
        let stale = remote.get_one(APPLICATIONS).await.unwrap();
        mirror.apply_snapshot(&APPLICATIONS_KEY, stale).unwrap();
        assert_eq!(cache.get_collection(APPLICATIONS)[0]["status"], "verifying");

        // Once acknowledged, remote is authoritative again.
        mirror.flush().await;
        remote
            .update_data("applications/a", json!({"status": "approved", "version": 3}))
            .await
            .unwrap();
        let fresh = remote.get_one(APPLICATIONS).await.unwrap();
        mirror.apply_snapshot(&APPLICATIONS_KEY, fresh).unwrap();
        assert_eq!(cache.get_collection(APPLICATIONS)[0]["status"], "approved");
    }

    #[tokio::test]
    async fn test_snapshot_keeps_unpushed_records_and_drops_pending_removals() {
        let (mirror, cache, remote) = setup(immediate());
        remote.set_data("users/old", json!({"name": "Old"})).await.unwrap();
        remote.set_data("users/gone", json!({"name": "Gone"})).await.unwrap();
        cache
            .set_collection(USERS, vec![json!({"id": "gone", "name": "Gone"})])
            .unwrap();

        mirror.put_record(USERS, json!({"id": "new", "name": "New"})).unwrap();
        mirror.remove_record(USERS, "gone").unwrap();

        let snapshot = remote.get_one(USERS).await.unwrap();
        mirror
            .apply_snapshot(&MirroredKey::collection(USERS), snapshot)
            .unwrap();

        let mut ids: Vec<String> = cache
            .get_collection(USERS)
            .iter()
            .filter_map(|r| record_id(r).map(str::to_string))
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["new".to_string(), "old".to_string()]);
    }

    #[tokio::test]
    async fn test_bootstrap_seeds_empty_remote() {
        let (mirror, cache, remote) = setup(immediate());
        cache
            .set_collection(USERS, vec![json!({"id": "CS2A-1", "name": "Ana"})])
            .unwrap();
        cache
            .set_collection(SCHEDULE, vec![json!({"id": "s1", "day": "Mon"})])
            .unwrap();
        cache.set_singleton(SETTINGS, json!({"maxAttempts": 5})).unwrap();

        let report = mirror.bootstrap().await.unwrap();

        assert!(report.seeded_remote);
        assert_eq!(report.pushed_records, 3);
        assert!(remote.get_one("users/CS2A-1").await.unwrap().is_some());
        assert_eq!(remote.get_one(SETTINGS).await.unwrap().unwrap()["maxAttempts"], 5);
    }

    #[tokio::test]
    async fn test_bootstrap_skips_seed_when_remote_has_users() {
        let (mirror, cache, remote) = setup(immediate());
        remote.set_data("users/r", json!({"name": "Remote"})).await.unwrap();
        cache
            .set_collection(SCHEDULE, vec![json!({"id": "s1", "day": "Mon"})])
            .unwrap();

        let report = mirror.bootstrap().await.unwrap();

        assert!(!report.seeded_remote);
        assert!(remote.get_one("schedule/s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reconciliation_pushes_missing_applications() {
        let (mirror, cache, remote) = setup(immediate());
        remote.set_data("applications/known", json!({"status": "pending"})).await.unwrap();
        let offline_submission = json!({"id": "local-only", "status": "pending", "studentId": "2025-00046"});
        cache
            .set_collection(
                APPLICATIONS,
                vec![json!({"id": "known", "status": "pending"}), offline_submission.clone()],
            )
            .unwrap();

        let pushed = mirror.reconcile_applications().await.unwrap();

        assert_eq!(pushed, vec!["local-only".to_string()]);
        let stored = remote.get_one("applications/local-only").await.unwrap().unwrap();
        assert_eq!(stored, offline_submission);
    }

    #[tokio::test]
    async fn test_listeners_mirror_remote_changes_into_cache() {
        let (mirror, cache, remote) = setup(immediate());
        let cancel = CancellationToken::new();
        let listeners = mirror.spawn_listeners(&cancel);

        remote.set_data("album/p1", json!({"url": "https://x/p1.png"})).await.unwrap();

        let mut events = mirror.subscribe_events();
        let deadline = Instant::now() + Duration::from_secs(2);
        while cache.get_collection(ALBUM).is_empty() && Instant::now() < deadline {
            let _ = tokio::time::timeout(Duration::from_millis(50), events.recv()).await;
        }
        assert_eq!(cache.get_collection(ALBUM)[0]["id"], "p1");

        cancel.cancel();
        listeners.await.unwrap();
    }

    fn application_ids(cache: &InMemoryCache) -> Vec<String> {
        let mut ids: Vec<String> = cache
            .get_collection(APPLICATIONS)
            .iter()
            .filter_map(|r| record_id(r).map(str::to_string))
            .collect();
        ids.sort();
        ids
    }

    #[tokio::test]
    async fn test_offline_startup_keeps_local_only_applications() {
        let (mirror, cache, remote) = setup(RetryPolicy {
            base: Duration::from_millis(5),
            max: Duration::from_millis(20),
        });
        remote.set_data("applications/known", json!({"status": "pending"})).await.unwrap();
        cache
            .set_collection(
                APPLICATIONS,
                vec![json!({"id": "offline-sub", "status": "pending", "version": 1})],
            )
            .unwrap();
        remote.set_offline(true);

        assert!(mirror.bootstrap().await.is_err());
        let cancel = CancellationToken::new();
        let listeners = mirror.spawn_listeners(&cancel);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(application_ids(&cache), vec!["offline-sub".to_string()]);

        remote.set_offline(false);
        let deadline = Instant::now() + Duration::from_secs(2);
        while application_ids(&cache).len() < 2 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(
            application_ids(&cache),
            vec!["known".to_string(), "offline-sub".to_string()]
        );
        let pushed = remote.get_one("applications/offline-sub").await.unwrap().unwrap();
        assert_eq!(pushed["status"], "pending");

        cancel.cancel();
        listeners.await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_unknown_record_queues_nothing() {
        let (mirror, _cache, remote) = setup(immediate());
        remote.set_data("applications/x", json!({"status": "pending"})).await.unwrap();

        assert!(!mirror.remove_record(APPLICATIONS, "x").unwrap());
        assert!(mirror.pending().is_empty());
        mirror.flush().await;
        assert!(remote.get_one("applications/x").await.unwrap().is_some());
    }

    #[test]
    fn test_concurrent_updates_to_one_record_are_serialized() {
        let (mirror, cache, _remote) = setup(immediate());
        mirror.put_record(APPLICATIONS, json!({"id": "a", "marks": []})).unwrap();

        std::thread::scope(|scope| {
            for worker in 0..4 {
                let mirror = &mirror;
                scope.spawn(move || {
                    for round in 0..25 {
                        mirror
                            .update_record(APPLICATIONS, "a", |mut record| {
                                if let Some(Value::Array(marks)) = record.get_mut("marks") {
                                    marks.push(json!(format!("{}-{}", worker, round)));
                                }
                                Ok::<_, PortError>(record)
                            })
                            .unwrap()
                            .unwrap();
                    }
                });
            }
        });

        let stored = &cache.get_collection(APPLICATIONS)[0];
        assert_eq!(stored["marks"].as_array().unwrap().len(), 100);
        assert_eq!(stored["version"], 101);
        assert_eq!(mirror.pending().len(), 1);
    }

    #[test]
    fn test_update_record_unknown_id_or_id_change() {
        let (mirror, _cache, _remote) = setup(immediate());
        let missing = mirror.update_record(APPLICATIONS, "ghost", Ok::<_, PortError>);
        assert!(missing.unwrap().is_none());

        mirror.put_record(APPLICATIONS, json!({"id": "a"})).unwrap();
        let renamed = mirror.update_record(APPLICATIONS, "a", |_| Ok::<_, PortError>(json!({"id": "b"})));
        assert!(renamed.is_err());
        assert_eq!(mirror.find_record(APPLICATIONS, "a").unwrap()["version"], 1);
    }
}
