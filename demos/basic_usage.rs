//! Basic usage example of the cache-aside strategies.

use cache_shield::backend::InMemoryStore;
use cache_shield::lock::InMemoryLock;
use cache_shield::{
    error::Result, observability::CounterMetrics, CacheService, CacheStrategy, CacheValue,
    EngineConfig,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Example value: Shop
#[derive(Clone, Serialize, Deserialize, Debug)]
struct Shop {
    id: u64,
    name: String,
    city: String,
    rating: f64,
}

impl CacheValue for Shop {}

/// Mock table that simulates database access
async fn find_shop(id: u64) -> Result<Option<Shop>> {
    println!("  [DB] Fetching shop: {}", id);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let shop = match id {
        1 => Some(Shop {
            id,
            name: "Corner Noodles".to_string(),
            city: "Hangzhou".to_string(),
            rating: 4.6,
        }),
        2 => Some(Shop {
            id,
            name: "Night Market Tea".to_string(),
            city: "Taipei".to_string(),
            rating: 4.8,
        }),
        _ => None,
    };

    Ok(shop)
}

async fn all_shops() -> Result<Option<Vec<Shop>>> {
    println!("  [DB] Fetching all shops");
    let mut shops = Vec::new();
    for id in [1, 2] {
        shops.extend(find_shop(id).await?);
    }
    Ok(Some(shops))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Debug)
        .try_init()
        .ok();

    println!("\n=== cache-shield - Basic Example ===\n");

    // 1. Initialize the service
    println!("1. Initializing in-memory store and lock...");
    let metrics = Arc::new(CounterMetrics::new());
    let cache = CacheService::with_metrics(
        InMemoryStore::new(),
        InMemoryLock::new(),
        EngineConfig::default().with_null_ttl(Duration::from_secs(30)),
        metrics.clone(),
    )?;
    println!("   ✓ Cache service ready\n");

    // 2. Pass-through: miss then hit
    println!("2. Pass-through, first and second request for shop 1:");
    for _ in 0..2 {
        if let Some(shop) = cache
            .query_with_pass_through("cache:shop:", 1u64, find_shop, Duration::from_secs(1800))
            .await?
        {
            println!("   ✓ {} in {} ({:.1})", shop.name, shop.city, shop.rating);
        }
    }
    println!();

    // 3. Pass-through: unknown id is negative-cached
    println!("3. Pass-through for missing shop 404 (asked twice):");
    for _ in 0..2 {
        let shop = cache
            .query_with_pass_through("cache:shop:", 404u64, find_shop, Duration::from_secs(1800))
            .await?;
        assert!(shop.is_none());
    }
    println!("   ✓ Database asked once, tombstone answered the second time\n");

    // 4. Mutex: concurrent misses share one load
    println!("4. Mutex, 8 concurrent requests for shop 2:");
    let mut handles = Vec::new();
    for _ in 0..8 {
        let cache = cache.clone();
        handles.push(tokio::spawn(async move {
            cache
                .query_with_mutex("cache:shop:", 2u64, find_shop, Duration::from_secs(1800))
                .await
        }));
    }
    for handle in handles {
        if let Ok(Ok(Some(shop))) = handle.await {
            println!("   ✓ {}", shop.name);
        }
    }
    println!();

    // 5. Logical expiry: pre-warm, then read
    println!("5. Logical expiry for the shop list:");
    let shops = all_shops().await?.unwrap_or_default();
    cache
        .set_with_logical_expire("cache:shops:all", &shops, Duration::from_secs(60))
        .await?;
    let listed = cache
        .query_with_logical_expire_list_without_args(
            "cache:shops:all",
            all_shops,
            Duration::from_secs(60),
        )
        .await?;
    println!(
        "   ✓ {} shops served from the warm entry\n",
        listed.map(|shops| shops.len()).unwrap_or(0)
    );

    // 6. Strategy chosen at runtime
    println!("6. Strategy from configuration:");
    let strategy: CacheStrategy = "mutex".parse()?;
    let shop = cache
        .query(strategy, "cache:shop:", 1u64, find_shop, Duration::from_secs(1800))
        .await?;
    println!("   ✓ {} answered with {}\n", strategy, shop.map(|s| s.name).unwrap_or_default());

    cache.shutdown().await;

    let snapshot = metrics.snapshot();
    println!("=== Metrics ===");
    println!(
        "   hits {} / misses {} / null hits {} / loads {}",
        snapshot.hits, snapshot.misses, snapshot.null_hits, snapshot.loads
    );
    println!("\n=== Example Complete ===\n");

    Ok(())
}
