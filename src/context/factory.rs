//! Context factory with hot-swappable retry policy.

use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::mpsc;

use crate::config::watcher::ConfigWatcher;
use crate::config::{RetryConfig, StoreConfig};
use crate::context::retry_context::RetryContext;
use crate::resilience::retries::RetryPolicy;
use crate::store::Store;

/// Builds one `RetryContext` per unit of work.
///
/// The policy can be replaced at runtime; contexts already created keep
/// the policy they were built with.
pub struct ContextFactory<S, F>
where
    S: Store,
    F: Fn() -> S,
{
    open: F,
    policy: ArcSwap<RetryPolicy>,
}

impl<S, F> ContextFactory<S, F>
where
    S: Store,
    F: Fn() -> S,
{
    /// `open` creates a fresh store session for each context.
    pub fn new(open: F, policy: RetryPolicy) -> Self {
        Self {
            open,
            policy: ArcSwap::from_pointee(policy),
        }
    }

    pub fn from_config(open: F, config: &StoreConfig) -> Self {
        Self::new(open, RetryPolicy::from_config(&config.retries))
    }

    /// Open a new session and wrap it in a context.
    pub fn create(&self) -> RetryContext<S> {
        let policy = self.policy.load_full();
        RetryContext::with_policy((self.open)(), RetryPolicy::clone(&policy))
    }

    /// Policy new contexts will receive.
    pub fn policy(&self) -> Arc<RetryPolicy> {
        self.policy.load_full()
    }

    pub fn set_policy(&self, policy: RetryPolicy) {
        self.policy.store(Arc::new(policy));
    }

    /// Swap in a policy built from `config`.
    pub fn reload(&self, config: &RetryConfig) {
        self.set_policy(RetryPolicy::from_config(config));
        tracing::info!(
            strategy = %config.strategy,
            max_attempts = config.max_attempts,
            "Retry policy reloaded"
        );
    }

    /// Apply config updates until the sender side closes.
    pub async fn follow(&self, mut updates: mpsc::UnboundedReceiver<StoreConfig>) {
        while let Some(config) = updates.recv().await {
            self.reload(&config.retries);
        }
        tracing::debug!("Config update channel closed");
    }

    /// Reload the policy whenever the config file at `path` changes.
    /// Runs until the future is dropped; fails only if watching cannot start.
    pub async fn follow_file(&self, path: &Path) -> Result<(), notify::Error> {
        let (watcher, updates) = ConfigWatcher::new(path);
        let _handle = watcher.run()?;
        self.follow(updates).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryDatabase, MemoryStore};

    #[tokio::test]
    async fn test_reload_affects_new_contexts_only() {
        let db = MemoryDatabase::new();
        let factory = ContextFactory::new(move || MemoryStore::new(db.clone()), RetryPolicy::no_retry());
        let before = factory.create();

        let (tx, rx) = mpsc::unbounded_channel();
        let mut config = StoreConfig::default();
        config.retries.max_attempts = 4;
        tx.send(config).unwrap();
        drop(tx);
        factory.follow(rx).await;

        let after = factory.create();
        assert_eq!(before.policy().max_attempts(), 1);
        assert_eq!(after.policy().max_attempts(), 4);
        assert_ne!(before.id(), after.id());
    }
}
