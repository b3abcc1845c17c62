//! Memcached Store Integration Tests
//!
//! These tests require a running Memcached instance and skip themselves
//! when none is reachable.
//!
//! ```bash
//! docker run --rm -p 11211:11211 memcached:1.6
//! cargo test --features memcached --test memcached_integration_test
//! ```
//!
//! **Note:** Tests use unique key prefixes per test to avoid conflicts when run in parallel.
//!
//! ## Environment Variables
//!
//! - `TEST_MEMCACHED_URL`: Memcached server address (default: "localhost:11211")

#![cfg(feature = "memcached")]

use cache_shield::backend::{CacheStore, MemcachedConfig, MemcachedStore};
use cache_shield::lock::InMemoryLock;
use cache_shield::{CacheService, CacheValue, EngineConfig, Error};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

fn get_memcached_url() -> String {
    env::var("TEST_MEMCACHED_URL").unwrap_or_else(|_| "localhost:11211".to_string())
}

/// Memcached keys may not contain whitespace or control characters, so
/// the UUID is used in its simple form.
fn unique_test_key(base: &str) -> String {
    let uuid = uuid::Uuid::now_v7();
    format!("test_{}_{}", uuid.simple(), base.replace(':', "_"))
}

async fn create_test_store() -> Option<MemcachedStore> {
    let config = MemcachedConfig {
        servers: vec![get_memcached_url()],
        connection_timeout: Duration::from_secs(5),
        pool_size: 32, // Increased for parallel test execution
    };
    let store = MemcachedStore::new(config).await.ok()?;
    match store.health_check().await {
        Ok(true) => Some(store),
        _ => {
            println!("⚠️  Memcached not available, skipping test");
            None
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Product {
    id: u64,
    title: String,
}

impl CacheValue for Product {}

#[tokio::test]
async fn test_memcached_set_get_delete() {
    let Some(store) = create_test_store().await else {
        return;
    };

    let key = unique_test_key("basic");
    store
        .set(&key, "hello".to_string(), Some(Duration::from_secs(30)))
        .await
        .expect("SET should succeed");
    assert_eq!(store.get(&key).await.unwrap().as_deref(), Some("hello"));

    store.delete(&key).await.expect("DELETE should succeed");
    assert_eq!(store.get(&key).await.unwrap(), None);
}

#[tokio::test]
async fn test_memcached_tombstone_distinct_from_absent() {
    let Some(store) = create_test_store().await else {
        return;
    };

    let key = unique_test_key("tomb");
    store
        .set(&key, String::new(), Some(Duration::from_secs(30)))
        .await
        .unwrap();

    assert_eq!(store.get(&key).await.unwrap(), Some(String::new()));
    assert_eq!(store.get(&unique_test_key("absent")).await.unwrap(), None);
}

#[tokio::test]
async fn test_memcached_ttl_expiration() {
    let Some(store) = create_test_store().await else {
        return;
    };

    let key = unique_test_key("ttl");
    store
        .set(&key, "soon gone".to_string(), Some(Duration::from_secs(1)))
        .await
        .unwrap();
    assert!(store.exists(&key).await.unwrap());

    // Memcached expiry has one-second resolution.
    tokio::time::sleep(Duration::from_millis(2100)).await;
    assert!(!store.exists(&key).await.unwrap());
}

#[tokio::test]
async fn test_memcached_pass_through_negative_caching() {
    let Some(store) = create_test_store().await else {
        return;
    };
    let cache = CacheService::new(store, InMemoryLock::new(), EngineConfig::default())
        .expect("service should start");

    let prefix = unique_test_key("product_");
    let found: Option<Product> = cache
        .query_with_pass_through(
            &prefix,
            404u64,
            |_id: u64| async { Ok::<_, Error>(None) },
            Duration::from_secs(30),
        )
        .await
        .unwrap();
    assert!(found.is_none());

    let stored = cache.store().get(&format!("{}404", prefix)).await.unwrap();
    assert_eq!(stored, Some(String::new()));

    cache.shutdown().await;
}
