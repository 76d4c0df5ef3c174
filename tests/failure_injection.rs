//! Failure injection tests for the retry-wrapped context.

use std::sync::atomic::Ordering;
use std::time::Duration;

use retry_store::config::parse_config;
use retry_store::{
    CancelSource, ContextError, ContextFactory, EntityState, FlushError, MemoryDatabase,
    MemoryStore, RetryContext, RetryPolicy, RetryStrategy,
};

mod common;
use common::{counting_policy, disconnected, order, setup, Order};

#[test]
fn test_recovers_after_two_failures() {
    let db = MemoryDatabase::new();
    let context = RetryContext::with_policy(
        MemoryStore::new(db.clone()),
        RetryPolicy::new(
            retry_store::resilience::SqlTransientDetection::default(),
            RetryStrategy::fixed(3, Duration::from_millis(1)),
        ),
    );
    db.fail_next(2, disconnected());

    let written = context.save(&order("o-1", "ada", 1200)).unwrap();

    assert_eq!(written, 1);
    assert_eq!(db.flush_calls(), 3);
    assert_eq!(db.len::<Order>(), 1);
}

#[test]
fn test_succeeds_on_last_attempt() {
    for attempts in 1..=6 {
        let (policy, retries) = counting_policy(attempts);
        let db = MemoryDatabase::new();
        let context = RetryContext::with_policy(MemoryStore::new(db.clone()), policy);
        db.fail_next(attempts as usize - 1, disconnected());

        assert_eq!(context.save(&order("o-1", "ada", 1)).unwrap(), 1);
        assert_eq!(db.flush_calls(), attempts);
        assert_eq!(retries.load(Ordering::SeqCst), attempts - 1);
    }
}

#[test]
fn test_exhaustion_reports_attempts_and_last_error() {
    let (db, context) = setup(4);
    db.fail_next(3, disconnected());
    db.inject_fault(FlushError::Timeout {
        elapsed: Duration::from_secs(30),
    });

    let err = context.save(&order("o-1", "ada", 1)).unwrap_err();

    match err {
        ContextError::Persistence { attempts, source } => {
            assert_eq!(attempts, 4);
            assert!(matches!(source, FlushError::Timeout { .. }));
        }
        other => panic!("expected persistence error, got {:?}", other),
    }
    assert_eq!(db.flush_calls(), 4);
    assert_eq!(db.len::<Order>(), 0);
}

#[test]
fn test_failed_flush_can_be_resent() {
    let (db, context) = setup(2);
    let o = order("o-1", "ada", 1);
    db.fail_next(2, disconnected());

    assert!(context.save(&o).is_err());
    assert_eq!(context.entry_state(&o), EntityState::PendingInsert);

    assert_eq!(context.execute_save_changes().unwrap(), 1);
    assert_eq!(db.len::<Order>(), 1);
}

#[test]
fn test_permanent_database_error_is_not_retried() {
    let (db, context) = setup(5);
    db.inject_fault(FlushError::Database {
        code: 547,
        message: "foreign key constraint".into(),
    });

    let err = context.save(&order("o-1", "ada", 1)).unwrap_err();

    assert!(matches!(
        err,
        ContextError::Persistence {
            attempts: 1,
            source: FlushError::Database { code: 547, .. }
        }
    ));
    assert_eq!(db.flush_calls(), 1);
}

#[test]
fn test_transient_database_code_is_retried() {
    let (db, context) = setup(3);
    db.inject_fault(FlushError::Database {
        code: 1205,
        message: "deadlock victim".into(),
    });

    assert_eq!(context.save(&order("o-1", "ada", 1)).unwrap(), 1);
    assert_eq!(db.flush_calls(), 2);
}

#[test]
fn test_validation_is_not_retried() {
    let (db, context) = setup(5);
    let err = context.save(&order("o-1", "", 1)).unwrap_err();

    assert!(matches!(err, ContextError::Validation { .. }));
    assert!(!err.is_retryable_by_caller());
    assert_eq!(db.flush_calls(), 0);
}

#[test]
fn test_no_retry_policy_makes_one_attempt() {
    let db = MemoryDatabase::new();
    let context = RetryContext::with_policy(MemoryStore::new(db.clone()), RetryPolicy::no_retry());
    db.inject_fault(disconnected());

    assert!(context.save(&order("o-1", "ada", 1)).is_err());
    assert_eq!(db.flush_calls(), 1);
}

#[test]
fn test_command_timeout_is_transient() {
    let db = MemoryDatabase::new();
    db.set_latency(Duration::from_millis(20));
    let store = MemoryStore::new(db.clone()).with_command_timeout(Duration::from_millis(5));
    let context = RetryContext::with_policy(store, common::quick_policy(2));

    let err = context.save(&order("o-1", "ada", 1)).unwrap_err();

    assert!(matches!(
        err,
        ContextError::Persistence {
            attempts: 2,
            source: FlushError::Timeout { .. }
        }
    ));
    assert_eq!(db.len::<Order>(), 0);
}

#[tokio::test]
async fn test_async_save_recovers() {
    let (db, context) = setup(3);
    db.fail_next(2, disconnected());

    assert_eq!(context.save_async(&order("o-1", "ada", 1), None).await.unwrap(), 1);
    assert_eq!(db.flush_calls(), 3);
}

#[tokio::test]
async fn test_async_save_or_update_and_delete() {
    let (db, context) = setup(2);
    db.insert_row(order("o-1", "ada", 1));

    let updated = order("o-1", "ada", 42);
    let written = context
        .save_or_update_async(&updated, |row: &Order| row.id == "o-1", None)
        .await
        .unwrap();
    assert_eq!(written, 1);
    assert_eq!(db.len::<Order>(), 1);

    db.inject_fault(disconnected());
    assert_eq!(context.delete_async(&updated, None).await.unwrap(), 1);
    assert_eq!(db.len::<Order>(), 0);
}

#[tokio::test]
async fn test_cancel_before_first_attempt_skips_flush() {
    let (db, context) = setup(3);
    let source = CancelSource::new();
    source.cancel();
    let token = source.token();

    let err = context
        .save_async(&order("o-1", "ada", 1), Some(&token))
        .await
        .unwrap_err();

    assert_eq!(err, ContextError::Cancelled { attempts: 0 });
    assert_eq!(db.flush_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_backoff() {
    let db = MemoryDatabase::new();
    let policy = RetryPolicy::new(
        retry_store::resilience::SqlTransientDetection::default(),
        RetryStrategy::fixed(5, Duration::from_secs(60)),
    );
    let context = RetryContext::with_policy(MemoryStore::new(db.clone()), policy);
    db.fail_next(5, disconnected());

    let source = CancelSource::new();
    let token = source.token();
    let save = context.execute_save_changes_async(Some(&token));
    let cancel = async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        source.cancel();
    };

    let (result, ()) = tokio::join!(save, cancel);

    assert_eq!(result.unwrap_err(), ContextError::Cancelled { attempts: 1 });
    assert_eq!(db.flush_calls(), 1);
}

#[tokio::test]
async fn test_overlapping_operations_are_rejected() {
    let (db, context) = setup(1);
    db.set_latency(Duration::from_millis(50));

    let o1 = order("o-1", "ada", 1);
    let o2 = order("o-2", "bob", 2);
    let first = context.save_async(&o1, None);
    let second = async {
        tokio::time::sleep(Duration::from_millis(5)).await;
        context.save_async(&o2, None).await
    };

    let (first, second) = tokio::join!(first, second);

    assert_eq!(first.unwrap(), 1);
    assert!(matches!(second, Err(ContextError::InvalidOperation(_))));
    assert_eq!(db.len::<Order>(), 1);

    // The guard is released once the first call finishes.
    assert_eq!(context.save_async(&o2, None).await.unwrap(), 1);
}

#[test]
fn test_factory_contexts_share_database() {
    let db = MemoryDatabase::new();
    let factory = ContextFactory::new(|| MemoryStore::new(db.clone()), common::quick_policy(3));

    let writer = factory.create();
    writer.save(&order("o-1", "ada", 1)).unwrap();

    let reader = factory.create();
    let rows = reader.readonly_query::<Order>().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(reader.entry_state(&order("o-1", "ada", 1)), EntityState::Unattached);
}

#[test]
fn test_factory_reload_changes_budget() {
    let db = MemoryDatabase::new();
    let factory = ContextFactory::new(|| MemoryStore::new(db.clone()), common::quick_policy(1));

    db.inject_fault(disconnected());
    assert!(factory.create().save(&order("o-1", "ada", 1)).is_err());

    let config = parse_config(
        r#"
        [retries]
        strategy = "fixed"
        max_attempts = 3
        base_delay_ms = 0
        fast_first_retry = false
        "#,
    )
    .unwrap();
    factory.reload(&config.retries);

    db.fail_next(2, disconnected());
    assert_eq!(factory.create().save(&order("o-1", "ada", 1)).unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_config_file_change_reaches_factory() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.toml");
    std::fs::write(&path, "[retries]\nmax_attempts = 2\n").unwrap();

    let db = MemoryDatabase::new();
    let factory = ContextFactory::new(|| MemoryStore::new(db.clone()), common::quick_policy(2));
    let before = factory.create();

    let seen = std::sync::Mutex::new(Vec::new());
    let rewrite_and_wait = async {
        // Rewrites truncate first; none of them may surface as a default config.
        for _ in 0..20 {
            std::fs::write(&path, "[retries]\nmax_attempts = 5\n").unwrap();
        }
        loop {
            let attempts = factory.policy().max_attempts();
            seen.lock().unwrap().push(attempts);
            if attempts == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };

    tokio::time::timeout(Duration::from_secs(10), async {
        tokio::select! {
            biased;
            started = factory.follow_file(&path) => panic!("watcher stopped: {:?}", started),
            () = rewrite_and_wait => {}
        }
    })
    .await
    .unwrap();

    assert_eq!(factory.create().policy().max_attempts(), 5);
    assert_eq!(before.policy().max_attempts(), 2);
    assert!(seen.lock().unwrap().iter().all(|n| *n == 2 || *n == 5));
}
