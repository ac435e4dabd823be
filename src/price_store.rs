// Process-wide shared state, threaded explicitly through every task
//
// The price store is written by exactly one task (the tick writer) and read
// by every client fan-out loop. A read-preferring RwLock over the whole map
// gives each 100ms diff cycle a consistent snapshot across all pairs.

use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::config::Config;
use crate::programs::ProgramRegistry;

/// asset_id → pair → latest price.
pub type PriceMap = HashMap<i64, HashMap<String, f64>>;

#[derive(Debug, Default)]
pub struct PriceStore {
    inner: RwLock<PriceMap>,
}

impl PriceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, asset_id: i64, pair: &str, price: f64) {
        let mut map = self.inner.write().await;
        map.entry(asset_id).or_default().insert(pair.to_string(), price);
    }

    pub async fn get(&self, asset_id: i64, pair: &str) -> Option<f64> {
        let map = self.inner.read().await;
        map.get(&asset_id).and_then(|pairs| pairs.get(pair)).copied()
    }

    /// Clone of the full map, taken under one read guard.
    pub async fn snapshot(&self) -> PriceMap {
        self.inner.read().await.clone()
    }
}

/// Everything the long-running tasks and the façade share.
pub struct CoreState {
    pub config: Config,
    pub registry: RwLock<ProgramRegistry>,
    pub price_store: PriceStore,
}

impl CoreState {
    pub fn new(config: Config, registry: ProgramRegistry) -> Self {
        Self {
            config,
            registry: RwLock::new(registry),
            price_store: PriceStore::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_then_get() {
        let store = PriceStore::new();
        store.set(1, "WSOL-USDC", 101.5).await;
        assert_eq!(store.get(1, "WSOL-USDC").await, Some(101.5));
        assert_eq!(store.get(1, "HNT-USDC").await, None);
        assert_eq!(store.get(2, "WSOL-USDC").await, None);
    }

    #[tokio::test]
    async fn test_snapshot_is_detached() {
        let store = PriceStore::new();
        store.set(1, "WSOL-USDC", 100.0).await;

        let snapshot = store.snapshot().await;
        store.set(1, "WSOL-USDC", 200.0).await;

        assert_eq!(snapshot[&1]["WSOL-USDC"], 100.0);
        assert_eq!(store.get(1, "WSOL-USDC").await, Some(200.0));
    }

    #[tokio::test]
    async fn test_latest_write_wins() {
        let store = PriceStore::new();
        for price in [1.0, 2.0, 3.0] {
            store.set(7, "HNT-WSOL", price).await;
        }
        assert_eq!(store.get(7, "HNT-WSOL").await, Some(3.0));
    }
}
