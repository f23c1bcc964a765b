//! Shared utilities for integration tests.
//!
//! Every test runs a `Client` over its own `InMemoryStore`, keeping a second
//! handle to the store for inspection and fault injection.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use esclient::{Client, ClientSettings, Event, InMemoryStore};
use serde_json::json;

/// How long asynchronous expectations may take before a test fails.
pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

/// A client over a fresh in-memory store, plus a handle to that store.
pub fn memory_client() -> (Client, InMemoryStore) {
    let store = InMemoryStore::new();
    let client = Client::with_connection(Arc::new(store.clone()), ClientSettings::default())
        .expect("worker pool should start");
    (client, store)
}

/// Events with the given types, each carrying its index as `i`.
pub fn events_of(types: &[&str]) -> Vec<Event> {
    types
        .iter()
        .enumerate()
        .map(|(i, t)| Event::new(*t, json!({ "i": i })))
        .collect()
}

/// `count` events alternating between `even` and `odd` types.
pub fn alternating(count: usize) -> Vec<Event> {
    (0..count)
        .map(|i| {
            let event_type = if i % 2 == 0 { "even" } else { "odd" };
            Event::new(event_type, json!({ "i": i }))
        })
        .collect()
}

/// Poll `check` until it returns true or `SETTLE_TIMEOUT` passes.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + SETTLE_TIMEOUT;
    while !check().await {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
