//! In-memory store.
//!
//! # Responsibilities
//! - Hold persisted rows per entity type, versioned for optimistic concurrency
//! - Track entity state per session (`MemoryStore`)
//! - Flush pending changes atomically
//! - Inject faults and latency so retry behaviour can be exercised
//!
//! # Design Decisions
//! - `MemoryDatabase` is a cheap clonable handle; sessions share it
//! - One write lock per flush; checks run before any row is touched
//! - Faults are consumed one per flush attempt, FIFO

use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use crate::config::ConnectionConfig;
use crate::store::{Entity, EntityState, FlushError, Store, Tracking};

/// SQL Server's primary key violation code.
const DUPLICATE_KEY: i32 = 2627;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// A persisted row and the version it was last written at.
#[derive(Debug, Clone)]
struct Row<T> {
    value: T,
    version: u64,
}

struct Table<T: Entity> {
    rows: HashMap<T::Key, Row<T>>,
}

impl<T: Entity> Default for Table<T> {
    fn default() -> Self {
        Self {
            rows: HashMap::new(),
        }
    }
}

/// All tables, keyed by entity type.
#[derive(Default)]
struct Tables {
    by_type: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Tables {
    fn table<T: Entity>(&self) -> Option<&Table<T>> {
        self.by_type
            .get(&TypeId::of::<T>())
            .and_then(|t| t.downcast_ref::<Table<T>>())
    }

    fn table_mut<T: Entity>(&mut self) -> &mut Table<T> {
        self.by_type
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Box::new(Table::<T>::default()))
            .downcast_mut::<Table<T>>()
            .expect("table registered under its own TypeId")
    }

    fn row<T: Entity>(&self, key: &T::Key) -> Option<&Row<T>> {
        self.table::<T>().and_then(|t| t.rows.get(key))
    }
}

struct DatabaseInner {
    tables: RwLock<Tables>,
    faults: Mutex<VecDeque<FlushError>>,
    flush_calls: AtomicU32,
    latency_ms: AtomicU64,
    last_version: AtomicU64,
}

/// Shared in-memory database.
#[derive(Clone)]
pub struct MemoryDatabase {
    inner: Arc<DatabaseInner>,
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDatabase")
            .field("flush_calls", &self.flush_calls())
            .field("queued_faults", &self.queued_faults())
            .finish()
    }
}

impl MemoryDatabase {
    /// Create an empty database.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DatabaseInner {
                tables: RwLock::new(Tables::default()),
                faults: Mutex::new(VecDeque::new()),
                flush_calls: AtomicU32::new(0),
                latency_ms: AtomicU64::new(0),
                last_version: AtomicU64::new(0),
            }),
        }
    }

    fn next_version(&self) -> u64 {
        self.inner.last_version.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Write a row directly, bypassing any session. Returns its version.
    pub fn insert_row<T: Entity>(&self, value: T) -> u64 {
        let version = self.next_version();
        let mut tables = write(&self.inner.tables);
        tables
            .table_mut::<T>()
            .rows
            .insert(value.key(), Row { value, version });
        version
    }

    /// Read a persisted row.
    pub fn get<T: Entity>(&self, key: &T::Key) -> Option<T> {
        read(&self.inner.tables).row::<T>(key).map(|r| r.value.clone())
    }

    /// Version a row was last written at.
    pub fn version<T: Entity>(&self, key: &T::Key) -> Option<u64> {
        read(&self.inner.tables).row::<T>(key).map(|r| r.version)
    }

    /// All persisted rows of `T`, in no particular order.
    pub fn rows<T: Entity>(&self) -> Vec<T> {
        self.versioned_rows::<T>().into_iter().map(|(v, _)| v).collect()
    }

    fn versioned_rows<T: Entity>(&self) -> Vec<(T, u64)> {
        read(&self.inner.tables)
            .table::<T>()
            .map(|t| {
                t.rows
                    .values()
                    .map(|r| (r.value.clone(), r.version))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of persisted rows of `T`.
    pub fn len<T: Entity>(&self) -> usize {
        read(&self.inner.tables)
            .table::<T>()
            .map_or(0, |t| t.rows.len())
    }

    /// Delete a row directly, bypassing any session.
    pub fn remove_row<T: Entity>(&self, key: &T::Key) -> bool {
        write(&self.inner.tables)
            .table_mut::<T>()
            .rows
            .remove(key)
            .is_some()
    }

    /// Bump a row's version as a concurrent writer would.
    pub fn touch<T: Entity>(&self, key: &T::Key) -> bool {
        let version = self.next_version();
        let mut tables = write(&self.inner.tables);
        match tables.table_mut::<T>().rows.get_mut(key) {
            Some(row) => {
                row.version = version;
                true
            }
            None => false,
        }
    }

    /// Queue a fault for the next flush attempt.
    pub fn inject_fault(&self, fault: FlushError) {
        lock(&self.inner.faults).push_back(fault);
    }

    /// Queue `count` copies of `fault`.
    pub fn fail_next(&self, count: usize, fault: FlushError) {
        let mut faults = lock(&self.inner.faults);
        for _ in 0..count {
            faults.push_back(fault.clone());
        }
    }

    /// Drop all queued faults.
    pub fn clear_faults(&self) {
        lock(&self.inner.faults).clear();
    }

    pub fn queued_faults(&self) -> usize {
        lock(&self.inner.faults).len()
    }

    /// Number of flushes attempted against this database, failed ones included.
    pub fn flush_calls(&self) -> u32 {
        self.inner.flush_calls.load(Ordering::SeqCst)
    }

    /// Delay applied to every flush.
    pub fn set_latency(&self, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.inner.latency_ms.store(ms, Ordering::SeqCst);
    }

    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.inner.latency_ms.load(Ordering::SeqCst))
    }

    fn begin_flush(&self) -> Option<FlushError> {
        self.inner.flush_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.inner.faults).pop_front()
    }

    /// Run `f` under the write lock with a fresh commit version.
    fn commit<F>(&self, f: F) -> Result<(usize, u64), FlushError>
    where
        F: FnOnce(&mut Tables, u64) -> Result<usize, FlushError>,
    {
        let mut tables = write(&self.inner.tables);
        let version = self.next_version();
        let written = f(&mut tables, version)?;
        Ok((written, version))
    }
}

struct TrackedEntry<T> {
    current: T,
    /// Snapshot taken at load or last successful flush.
    original: Option<T>,
    /// Row version observed at load or last successful flush.
    version: Option<u64>,
    state: EntityState,
}

impl<T: Entity> TrackedEntry<T> {
    fn is_dirty(&self) -> bool {
        self.state.is_pending()
            || (self.state == EntityState::Persisted
                && self.original.as_ref() != Some(&self.current))
    }
}

struct EntitySet<T: Entity> {
    entries: HashMap<T::Key, TrackedEntry<T>>,
}

impl<T: Entity> Default for EntitySet<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

/// Type-erased view of an `EntitySet` used while flushing.
trait TrackedSet: Send {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn detect_changes(&mut self);
    fn pending(&self) -> usize;
    fn validate(&self) -> Result<(), FlushError>;
    fn check(&self, tables: &Tables) -> Result<(), FlushError>;
    fn apply(&self, tables: &mut Tables, version: u64) -> usize;
    fn accept(&mut self, version: u64);
    fn len(&self) -> usize;
}

impl<T: Entity> TrackedSet for EntitySet<T> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn detect_changes(&mut self) {
        for (key, entry) in self.entries.iter_mut() {
            if entry.state == EntityState::Persisted && entry.is_dirty() {
                tracing::trace!(table = T::TABLE, key = ?key, "Detected modification");
                entry.state = EntityState::PendingUpdate;
            }
        }
    }

    fn pending(&self) -> usize {
        self.entries.values().filter(|e| e.is_dirty()).count()
    }

    fn validate(&self) -> Result<(), FlushError> {
        for (key, entry) in &self.entries {
            if !matches!(entry.state, EntityState::PendingInsert | EntityState::PendingUpdate) {
                continue;
            }
            if let Err(violations) = entry.current.validate() {
                return Err(FlushError::Validation {
                    table: T::TABLE,
                    key: format!("{:?}", key),
                    violations,
                });
            }
        }
        Ok(())
    }

    fn check(&self, tables: &Tables) -> Result<(), FlushError> {
        for (key, entry) in &self.entries {
            let row = tables.row::<T>(key);
            match entry.state {
                EntityState::PendingInsert => {
                    if row.is_some() {
                        return Err(FlushError::Database {
                            code: DUPLICATE_KEY,
                            message: format!(
                                "Violation of PRIMARY KEY constraint on {}: duplicate key {:?}",
                                T::TABLE,
                                key
                            ),
                        });
                    }
                }
                EntityState::PendingUpdate | EntityState::PendingDelete => {
                    let matches = match (row, entry.version) {
                        (None, _) => false,
                        (Some(_), None) => true,
                        (Some(row), Some(seen)) => row.version == seen,
                    };
                    if !matches {
                        return Err(FlushError::Concurrency {
                            table: T::TABLE,
                            key: format!("{:?}", key),
                            expected: 1,
                            affected: 0,
                        });
                    }
                }
                EntityState::Persisted | EntityState::Unattached => {}
            }
        }
        Ok(())
    }

    fn apply(&self, tables: &mut Tables, version: u64) -> usize {
        let table = tables.table_mut::<T>();
        let mut written = 0;
        for (key, entry) in &self.entries {
            match entry.state {
                EntityState::PendingInsert | EntityState::PendingUpdate => {
                    table.rows.insert(
                        key.clone(),
                        Row {
                            value: entry.current.clone(),
                            version,
                        },
                    );
                    written += 1;
                }
                EntityState::PendingDelete => {
                    if table.rows.remove(key).is_some() {
                        written += 1;
                    }
                }
                EntityState::Persisted | EntityState::Unattached => {}
            }
        }
        written
    }

    fn accept(&mut self, version: u64) {
        self.entries
            .retain(|_, entry| entry.state != EntityState::PendingDelete);
        for entry in self.entries.values_mut() {
            if entry.state.is_pending() {
                entry.state = EntityState::Persisted;
                entry.original = Some(entry.current.clone());
                entry.version = Some(version);
            }
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[derive(Default)]
struct Tracker {
    sets: BTreeMap<TypeId, Box<dyn TrackedSet>>,
}

impl Tracker {
    fn set<T: Entity>(&self) -> Option<&EntitySet<T>> {
        self.sets
            .get(&TypeId::of::<T>())
            .and_then(|s| s.as_any().downcast_ref::<EntitySet<T>>())
    }

    fn set_mut<T: Entity>(&mut self) -> &mut EntitySet<T> {
        self.sets
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Box::new(EntitySet::<T>::default()))
            .as_any_mut()
            .downcast_mut::<EntitySet<T>>()
            .expect("entity set registered under its own TypeId")
    }
}

/// One change-tracking session over a `MemoryDatabase`.
pub struct MemoryStore {
    db: MemoryDatabase,
    tracker: Mutex<Tracker>,
    command_timeout: Option<Duration>,
}

impl MemoryStore {
    /// Open a session.
    pub fn new(db: MemoryDatabase) -> Self {
        Self {
            db,
            tracker: Mutex::new(Tracker::default()),
            command_timeout: None,
        }
    }

    /// Open a session configured by `config`. A zero timeout means none.
    pub fn from_config(db: MemoryDatabase, config: &ConnectionConfig) -> Self {
        let store = Self::new(db);
        match config.command_timeout_ms {
            0 => store,
            ms => store.with_command_timeout(Duration::from_millis(ms)),
        }
    }

    /// Fail flushes whose latency exceeds `timeout` with `FlushError::Timeout`.
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = Some(timeout);
        self
    }

    pub fn database(&self) -> &MemoryDatabase {
        &self.db
    }

    /// Number of entities tracked, in any state.
    pub fn tracked_count(&self) -> usize {
        lock(&self.tracker).sets.values().map(|s| s.len()).sum()
    }

    /// Latency the next flush will incur, or the timeout it will hit.
    fn flush_delay(&self) -> (Duration, Option<FlushError>) {
        let latency = self.db.latency();
        match self.command_timeout {
            Some(timeout) if latency > timeout => {
                (timeout, Some(FlushError::Timeout { elapsed: timeout }))
            }
            _ => (latency, None),
        }
    }

    fn flush(&self, timed_out: Option<FlushError>) -> Result<usize, FlushError> {
        let mut tracker = lock(&self.tracker);

        for set in tracker.sets.values_mut() {
            set.detect_changes();
        }
        let pending: usize = tracker.sets.values().map(|s| s.pending()).sum();
        for set in tracker.sets.values() {
            set.validate()?;
        }

        if let Some(fault) = self.db.begin_flush() {
            tracing::debug!(error = %fault, "Flush failed with injected fault");
            return Err(fault);
        }
        if let Some(timeout) = timed_out {
            return Err(timeout);
        }
        if pending == 0 {
            return Ok(0);
        }

        let (written, version) = self.db.commit(|tables, version| {
            for set in tracker.sets.values() {
                set.check(tables)?;
            }
            Ok(tracker
                .sets
                .values()
                .map(|set| set.apply(tables, version))
                .sum())
        })?;

        for set in tracker.sets.values_mut() {
            set.accept(version);
        }

        tracing::debug!(written, version, "Flush committed");
        Ok(written)
    }
}

impl Store for MemoryStore {
    fn entry<T: Entity>(&self, entity: &T) -> EntityState {
        lock(&self.tracker)
            .set::<T>()
            .and_then(|s| s.entries.get(&entity.key()))
            .map_or(EntityState::Unattached, |e| e.state)
    }

    fn set_state<T: Entity>(&self, entity: &T, state: EntityState) {
        let mut tracker = lock(&self.tracker);
        let set = tracker.set_mut::<T>();
        let key = entity.key();

        if state == EntityState::Unattached {
            set.entries.remove(&key);
            return;
        }

        match set.entries.get_mut(&key) {
            Some(entry) => {
                entry.current = entity.clone();
                entry.state = state;
            }
            None => {
                let original = (state == EntityState::Persisted).then(|| entity.clone());
                set.entries.insert(
                    key,
                    TrackedEntry {
                        current: entity.clone(),
                        original,
                        version: None,
                        state,
                    },
                );
            }
        }
    }

    fn add<T: Entity>(&self, entity: &T) {
        self.set_state(entity, EntityState::PendingInsert);
    }

    fn any<T: Entity>(&self, predicate: &(dyn Fn(&T) -> bool + Sync)) -> Result<bool, FlushError> {
        Ok(read(&self.db.inner.tables)
            .table::<T>()
            .is_some_and(|t| t.rows.values().any(|r| predicate(&r.value))))
    }

    fn load<T: Entity>(&self, tracking: Tracking) -> Result<Vec<T>, FlushError> {
        let rows = self.db.versioned_rows::<T>();
        if tracking == Tracking::NoTracking {
            return Ok(rows.into_iter().map(|(value, _)| value).collect());
        }

        let mut tracker = lock(&self.tracker);
        let set = tracker.set_mut::<T>();
        Ok(rows
            .into_iter()
            .map(|(value, version)| {
                set.entries
                    .entry(value.key())
                    .or_insert_with(|| TrackedEntry {
                        current: value.clone(),
                        original: Some(value.clone()),
                        version: Some(version),
                        state: EntityState::Persisted,
                    })
                    .current
                    .clone()
            })
            .collect())
    }

    fn refresh<T: Entity>(&self, entity: &T) -> bool {
        let mut tracker = lock(&self.tracker);
        match tracker.set_mut::<T>().entries.get_mut(&entity.key()) {
            Some(entry) => {
                entry.current = entity.clone();
                true
            }
            None => false,
        }
    }

    fn pending_changes(&self) -> usize {
        lock(&self.tracker).sets.values().map(|s| s.pending()).sum()
    }

    fn save_changes(&self) -> Result<usize, FlushError> {
        let (delay, timed_out) = self.flush_delay();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        self.flush(timed_out)
    }

    fn save_changes_async(&self) -> impl std::future::Future<Output = Result<usize, FlushError>> + Send {
        async move {
            let (delay, timed_out) = self.flush_delay();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            self.flush(timed_out)
        }
    }
}
