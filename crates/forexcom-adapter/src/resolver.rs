//! Symbol Resolver - market name <-> market id
//!
//! Streaming items are keyed by market id (`PRICE.<id>`) while callers and
//! records speak market names. The resolver caches both directions per
//! client instance and asks the trading API only on a miss.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use crate::rest::RestClient;

/// Source of market metadata behind the cache
#[async_trait]
pub trait MarketLookup: Send + Sync {
    async fn market_id(&self, name: &str) -> Result<i64>;
    async fn market_name(&self, market_id: i64) -> Result<String>;
}

#[async_trait]
impl MarketLookup for RestClient {
    async fn market_id(&self, name: &str) -> Result<i64> {
        self.get_market_id(name).await
    }

    async fn market_name(&self, market_id: i64) -> Result<String> {
        self.get_market_name(market_id).await
    }
}

#[derive(Default)]
struct SymbolCache {
    ids: HashMap<String, i64>,
    names: HashMap<i64, String>,
}

impl SymbolCache {
    fn insert(&mut self, name: &str, market_id: i64) {
        self.ids.insert(name.to_string(), market_id);
        self.names.insert(market_id, name.to_string());
    }
}

/// Cached market name/id resolution
pub struct SymbolResolver {
    lookup: Arc<dyn MarketLookup>,
    cache: RwLock<SymbolCache>,
}

impl SymbolResolver {
    pub fn new(lookup: Arc<dyn MarketLookup>) -> Self {
        Self { lookup, cache: RwLock::new(SymbolCache::default()) }
    }

    /// Market id for `name`, asking the server on a cache miss
    pub async fn symbol_id(&self, name: &str) -> Result<i64> {
        if let Some(id) = self.cached_id(name) {
            return Ok(id);
        }
        debug!("Getting symbol id for {} from server", name);
        let market_id = self.lookup.market_id(name).await?;
        self.write().insert(name, market_id);
        Ok(market_id)
    }

    /// Market name for `market_id`, asking the server on a cache miss
    pub async fn symbol_name(&self, market_id: i64) -> Result<String> {
        if let Some(name) = self.cached_name(market_id) {
            return Ok(name);
        }
        debug!("Getting symbol name for {} from server", market_id);
        let name = self.lookup.market_name(market_id).await?;
        self.write().insert(&name, market_id);
        Ok(name)
    }

    /// Cache-only lookup, usable from listener callbacks
    pub fn cached_name(&self, market_id: i64) -> Option<String> {
        self.read().names.get(&market_id).cloned()
    }

    pub fn cached_id(&self, name: &str) -> Option<i64> {
        self.read().ids.get(name).copied()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, SymbolCache> {
        self.cache.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, SymbolCache> {
        self.cache.write().unwrap_or_else(|e| e.into_inner())
    }
}
