//! retry-store demo runner.
//!
//! Saves a batch of entities through `RetryContext` over the in-memory
//! store while transient faults are injected, then prints a JSON summary.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use serde::Serialize;

use retry_store::config::{load_config, StoreConfig};
use retry_store::observability::{logging, metrics};
use retry_store::{ContextFactory, Entity, FlushError, MemoryDatabase, MemoryStore, RetryPolicy, Violation};

#[derive(Parser)]
#[command(name = "retry-store")]
#[command(about = "Exercise the retry-wrapped store against injected faults", long_about = None)]
struct Cli {
    /// TOML config file (defaults apply when omitted).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Transient faults injected before each save.
    #[arg(short, long, default_value_t = 2)]
    fail: usize,

    /// Number of entities to save.
    #[arg(short, long, default_value_t = 3)]
    entities: u64,

    /// Reload the retry policy while the batch runs when the config file changes.
    #[arg(short, long, requires = "config")]
    watch: bool,
}

#[derive(Debug, Clone, PartialEq)]
struct Order {
    id: u64,
    customer: String,
    total_cents: u64,
}

impl Entity for Order {
    type Key = u64;
    const TABLE: &'static str = "orders";

    fn key(&self) -> u64 {
        self.id
    }

    fn validate(&self) -> Result<(), Vec<Violation>> {
        if self.customer.is_empty() {
            return Err(vec![Violation::new("customer", "must not be empty")]);
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct SaveReport {
    id: u64,
    written: usize,
    elapsed_ms: u128,
}

#[derive(Serialize)]
struct Summary {
    store: String,
    strategy: String,
    max_attempts: u32,
    saves: Vec<SaveReport>,
    retries: u32,
    flush_calls: u32,
    rows: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => StoreConfig::default(),
    };

    logging::init(&config.observability)?;
    tracing::info!(store = %config.store.name, "retry-store v0.1.0 starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr)?,
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let db = MemoryDatabase::new();
    db.set_latency(Duration::from_millis(config.store.simulated_latency_ms));

    let retries = Arc::new(AtomicU32::new(0));
    let counter = retries.clone();
    let policy = RetryPolicy::from_config(&config.retries).with_retry_listener(move |_| {
        counter.fetch_add(1, Ordering::Relaxed);
    });
    let factory = ContextFactory::new(|| MemoryStore::from_config(db.clone(), &config.store), policy);

    let batch = async {
        let mut saves = Vec::new();
        for id in 1..=cli.entities {
            db.fail_next(
                cli.fail,
                FlushError::Disconnected {
                    message: "injected connection reset".to_string(),
                },
            );

            let context = factory.create();
            let order = Order {
                id,
                customer: format!("customer-{}", id),
                total_cents: id * 1250,
            };

            let started = Instant::now();
            let written = context.save_async(&order, None).await?;
            saves.push(SaveReport {
                id,
                written,
                elapsed_ms: started.elapsed().as_millis(),
            });
        }
        Ok::<_, retry_store::ContextError>(saves)
    };

    let saves = match cli.config.as_deref().filter(|_| cli.watch) {
        Some(path) => {
            tokio::select! {
                biased;
                watching = factory.follow_file(path) => {
                    watching?;
                    return Err("config watcher stopped".into());
                }
                saves = batch => saves?,
            }
        }
        None => batch.await?,
    };

    let summary = Summary {
        store: config.store.name.clone(),
        strategy: config.retries.strategy.clone(),
        max_attempts: factory.policy().max_attempts(),
        saves,
        retries: retries.load(Ordering::Relaxed),
        flush_calls: db.flush_calls(),
        rows: db.len::<Order>(),
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);

    tracing::info!("Done");
    Ok(())
}
