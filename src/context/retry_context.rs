//! Retry-wrapped persistence context.
//!
//! # Responsibilities
//! - Stage inserts, updates and deletes on the underlying store session
//! - Run every flush through the context's retry policy
//! - Reject overlapping operations and use after dispose
//!
//! # Design Decisions
//! - Only the flush is retried; staging happens once, before the first attempt
//! - One policy per context, fixed at construction
//! - No locks: a busy flag fails overlapping calls fast

use std::sync::atomic::{AtomicBool, Ordering};

use uuid::Uuid;

use crate::config::StoreConfig;
use crate::context::guard::OperationGuard;
use crate::context::query::{Query, ReadonlyQuery};
use crate::error::{ContextError, ContextResult};
use crate::observability::metrics;
use crate::resilience::cancel::CancelToken;
use crate::resilience::retries::RetryPolicy;
use crate::store::{Entity, EntityState, Store, Tracking};

/// Persistence façade whose flushes are retried on transient failures.
pub struct RetryContext<S: Store> {
    id: Uuid,
    store: S,
    policy: RetryPolicy,
    busy: AtomicBool,
    disposed: AtomicBool,
}

impl<S: Store> RetryContext<S> {
    /// Create a context with the default exponential policy.
    pub fn new(store: S) -> Self {
        Self::with_policy(store, RetryPolicy::default())
    }

    /// Create a context with a custom policy.
    pub fn with_policy(store: S, policy: RetryPolicy) -> Self {
        let id = Uuid::new_v4();
        tracing::debug!(context = %id, max_attempts = policy.max_attempts(), "Context created");
        Self {
            id,
            store,
            policy,
            busy: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }

    /// Create a context whose policy comes from `config.retries`.
    pub fn from_config(store: S, config: &StoreConfig) -> Self {
        Self::with_policy(store, RetryPolicy::from_config(&config.retries))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Mark the context unusable. Later operations fail with `InvalidOperation`.
    pub fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            tracing::debug!(context = %self.id, "Context disposed");
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Consume the context and return its store session.
    pub fn into_store(self) -> S {
        self.store
    }

    fn begin(&self, operation: &str) -> ContextResult<OperationGuard<'_>> {
        if self.is_disposed() {
            return Err(ContextError::InvalidOperation(format!(
                "{} called on a disposed context",
                operation
            )));
        }
        OperationGuard::acquire(&self.busy, operation)
    }

    fn check_key<T: Entity>(entity: &T) -> ContextResult<()> {
        entity.validate_key().map_err(ContextError::Argument)
    }

    /// State of `entity` in this context. Inspection stays available after
    /// `dispose` and while another operation is in flight.
    pub fn entry_state<T: Entity>(&self, entity: &T) -> EntityState {
        self.store.entry(entity)
    }

    /// Entries the next flush would write. Available after `dispose`.
    pub fn pending_changes(&self) -> usize {
        self.store.pending_changes()
    }

    // --- Staging ---

    fn attach<T: Entity>(&self, entity: &T) {
        if self.store.entry(entity) == EntityState::Unattached {
            self.store.add(entity);
            tracing::trace!(context = %self.id, table = T::TABLE, key = ?entity.key(), "Staged insert");
        }
    }

    fn stage_save<T: Entity>(&self, entity: &T) {
        if self.store.entry(entity) == EntityState::Unattached {
            self.store.add(entity);
        } else {
            self.store.refresh(entity);
        }
    }

    fn stage_delete<T: Entity>(&self, entity: &T) {
        self.store.set_state(entity, EntityState::PendingDelete);
        tracing::trace!(context = %self.id, table = T::TABLE, key = ?entity.key(), "Staged delete");
    }

    fn stage_save_or_update<T, P>(&self, entity: &T, identity: &P) -> ContextResult<()>
    where
        T: Entity,
        P: Fn(&T) -> bool + Sync,
    {
        self.stage_save(entity);
        let exists = self
            .store
            .any::<T>(identity)
            .map_err(|e| ContextError::from_flush(1, e))?;
        if exists {
            self.store.set_state(entity, EntityState::PendingUpdate);
            tracing::trace!(context = %self.id, table = T::TABLE, key = ?entity.key(), "Existing row found, staged update");
        }
        Ok(())
    }

    pub(crate) fn refresh_tracked<T: Entity>(&self, entity: &T) -> ContextResult<()> {
        let _guard = self.begin("modify")?;
        if !self.store.refresh(entity) {
            return Err(ContextError::InvalidOperation(format!(
                "{} {:?} is no longer tracked by this context",
                T::TABLE,
                entity.key()
            )));
        }
        Ok(())
    }

    /// Stage `entity` for insert unless it is already tracked. No flush.
    pub fn add<T: Entity>(&self, entity: &T) -> ContextResult<()> {
        let _guard = self.begin("add")?;
        Self::check_key(entity)?;
        self.attach(entity);
        Ok(())
    }

    /// Stage every untracked entity for insert. No flush.
    pub fn add_many<'e, T, I>(&self, entities: I) -> ContextResult<()>
    where
        T: Entity,
        I: IntoIterator<Item = &'e T>,
    {
        let _guard = self.begin("add_many")?;
        let entities: Vec<&T> = entities.into_iter().collect();
        for entity in &entities {
            Self::check_key(*entity)?;
        }
        for entity in entities {
            self.attach(entity);
        }
        Ok(())
    }

    /// Stage `entity` for delete, whatever its current state. No flush.
    pub fn remove<T: Entity>(&self, entity: &T) -> ContextResult<()> {
        let _guard = self.begin("remove")?;
        Self::check_key(entity)?;
        self.stage_delete(entity);
        Ok(())
    }

    // --- Flushing ---

    fn flush(&self) -> ContextResult<usize> {
        let pending = self.store.pending_changes();
        metrics::record_pending_changes(pending);
        let written = self
            .policy
            .execute(|| self.store.save_changes())
            .inspect_err(|e| tracing::debug!(context = %self.id, error = %e, "Flush failed"))?;
        tracing::debug!(context = %self.id, pending, written, "Flush complete");
        Ok(written)
    }

    async fn flush_async(&self, cancel: Option<&CancelToken>) -> ContextResult<usize> {
        let pending = self.store.pending_changes();
        metrics::record_pending_changes(pending);
        let store = &self.store;
        let written = self
            .policy
            .execute_async(move || store.save_changes_async(), cancel)
            .await
            .inspect_err(|e| tracing::debug!(context = %self.id, error = %e, "Flush failed"))?;
        tracing::debug!(context = %self.id, pending, written, "Flush complete");
        Ok(written)
    }

    /// Flush all pending changes through the retry policy.
    pub fn execute_save_changes(&self) -> ContextResult<usize> {
        let _guard = self.begin("execute_save_changes")?;
        self.flush()
    }

    /// Asynchronously flush all pending changes through the retry policy.
    pub async fn execute_save_changes_async(&self, cancel: Option<&CancelToken>) -> ContextResult<usize> {
        let _guard = self.begin("execute_save_changes_async")?;
        self.flush_async(cancel).await
    }

    /// Stage `entity` for delete and flush. Returns rows written.
    pub fn delete<T: Entity>(&self, entity: &T) -> ContextResult<usize> {
        let _guard = self.begin("delete")?;
        Self::check_key(entity)?;
        self.stage_delete(entity);
        self.flush()
    }

    pub async fn delete_async<T: Entity>(
        &self,
        entity: &T,
        cancel: Option<&CancelToken>,
    ) -> ContextResult<usize> {
        let _guard = self.begin("delete_async")?;
        Self::check_key(entity)?;
        self.stage_delete(entity);
        self.flush_async(cancel).await
    }

    /// Stage `entity` for insert if untracked, then flush. Returns rows written.
    pub fn save<T: Entity>(&self, entity: &T) -> ContextResult<usize> {
        let _guard = self.begin("save")?;
        Self::check_key(entity)?;
        self.stage_save(entity);
        self.flush()
    }

    pub async fn save_async<T: Entity>(
        &self,
        entity: &T,
        cancel: Option<&CancelToken>,
    ) -> ContextResult<usize> {
        let _guard = self.begin("save_async")?;
        Self::check_key(entity)?;
        self.stage_save(entity);
        self.flush_async(cancel).await
    }

    /// Insert `entity`, or update it if a persisted row matches `identity`.
    pub fn save_or_update<T, P>(&self, entity: &T, identity: P) -> ContextResult<usize>
    where
        T: Entity,
        P: Fn(&T) -> bool + Sync,
    {
        let _guard = self.begin("save_or_update")?;
        Self::check_key(entity)?;
        self.stage_save_or_update(entity, &identity)?;
        self.flush()
    }

    pub async fn save_or_update_async<T, P>(
        &self,
        entity: &T,
        identity: P,
        cancel: Option<&CancelToken>,
    ) -> ContextResult<usize>
    where
        T: Entity,
        P: Fn(&T) -> bool + Sync,
    {
        let _guard = self.begin("save_or_update_async")?;
        Self::check_key(entity)?;
        self.stage_save_or_update(entity, &identity)?;
        self.flush_async(cancel).await
    }

    // --- Queries ---

    /// Load every row of `T`, tracked by this context.
    pub fn query<T: Entity>(&self) -> ContextResult<Query<'_, T, S>> {
        let _guard = self.begin("query")?;
        let rows = self
            .store
            .load::<T>(Tracking::Tracked)
            .map_err(|e| ContextError::from_flush(1, e))?;
        Ok(Query::new(self, rows))
    }

    /// Load every row of `T` as detached copies.
    pub fn readonly_query<T: Entity>(&self) -> ContextResult<ReadonlyQuery<T>> {
        let _guard = self.begin("readonly_query")?;
        let rows = self
            .store
            .load::<T>(Tracking::NoTracking)
            .map_err(|e| ContextError::from_flush(1, e))?;
        Ok(ReadonlyQuery::new(rows))
    }
}

impl<S: Store> std::fmt::Debug for RetryContext<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryContext")
            .field("id", &self.id)
            .field("policy", &self.policy)
            .field("busy", &self.busy.load(Ordering::Relaxed))
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
