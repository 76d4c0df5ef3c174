//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use retry_store::resilience::SqlTransientDetection;
use retry_store::{
    Entity, FlushError, MemoryDatabase, MemoryStore, RetryContext, RetryPolicy, RetryStrategy,
    Violation,
};

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub id: String,
    pub customer: String,
    pub total_cents: u64,
}

impl Entity for Order {
    type Key = String;
    const TABLE: &'static str = "orders";

    fn key(&self) -> String {
        self.id.clone()
    }

    fn validate(&self) -> Result<(), Vec<Violation>> {
        let mut violations = Vec::new();
        if self.customer.is_empty() {
            violations.push(Violation::new("customer", "must not be empty"));
        }
        if self.total_cents == 0 {
            violations.push(Violation::new("total_cents", "must be positive"));
        }
        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }

    fn validate_key(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("order id must not be empty".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Customer {
    pub id: u32,
    pub email: String,
}

impl Entity for Customer {
    type Key = u32;
    const TABLE: &'static str = "customers";

    fn key(&self) -> u32 {
        self.id
    }
}

pub fn order(id: &str, customer: &str, total_cents: u64) -> Order {
    Order {
        id: id.to_string(),
        customer: customer.to_string(),
        total_cents,
    }
}

pub fn customer(id: u32, email: &str) -> Customer {
    Customer {
        id,
        email: email.to_string(),
    }
}

pub fn disconnected() -> FlushError {
    FlushError::Disconnected {
        message: "connection reset by peer".to_string(),
    }
}

/// Fixed-interval policy with SQL transient detection and no wait.
pub fn quick_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(
        SqlTransientDetection::default(),
        RetryStrategy::fixed(max_attempts, Duration::ZERO),
    )
}

/// `quick_policy` that also counts retries.
pub fn counting_policy(max_attempts: u32) -> (RetryPolicy, Arc<AtomicU32>) {
    let retries = Arc::new(AtomicU32::new(0));
    let counter = retries.clone();
    let policy = quick_policy(max_attempts).with_retry_listener(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    (policy, retries)
}

/// A fresh database and a context over it.
pub fn setup(max_attempts: u32) -> (MemoryDatabase, RetryContext<MemoryStore>) {
    let db = MemoryDatabase::new();
    let context = RetryContext::with_policy(MemoryStore::new(db.clone()), quick_policy(max_attempts));
    (db, context)
}
