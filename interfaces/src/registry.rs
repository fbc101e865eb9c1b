//! Cloud/local capability registry.
//!
//! Generalizes the tagged-variant pattern: no inheritance tree, a flat enum
//! wrapping whichever trait object a logical service happens to provide, and
//! two maps (`cloud`, `local`) keyed by service name.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::capability::{Cache, Compute, Llm, Search, Storage};
use crate::ServiceMode;

/// A single capability instance, tagged by which trait it implements.
#[derive(Clone)]
pub enum Capability {
    Search(Arc<dyn Search>),
    Cache(Arc<dyn Cache>),
    Storage(Arc<dyn Storage>),
    Compute(Arc<dyn Compute>),
    Llm(Arc<dyn Llm>),
}

impl Capability {
    pub fn as_search(&self) -> Option<Arc<dyn Search>> {
        match self {
            Capability::Search(s) => Some(s.clone()),
            _ => None,
        }
    }

    pub fn as_cache(&self) -> Option<Arc<dyn Cache>> {
        match self {
            Capability::Cache(c) => Some(c.clone()),
            _ => None,
        }
    }

    pub fn as_storage(&self) -> Option<Arc<dyn Storage>> {
        match self {
            Capability::Storage(s) => Some(s.clone()),
            _ => None,
        }
    }

    pub fn as_compute(&self) -> Option<Arc<dyn Compute>> {
        match self {
            Capability::Compute(c) => Some(c.clone()),
            _ => None,
        }
    }

    pub fn as_llm(&self) -> Option<Arc<dyn Llm>> {
        match self {
            Capability::Llm(l) => Some(l.clone()),
            _ => None,
        }
    }
}

/// Cloud/local capability lookup for every logical service.
///
/// One entry per `(service, mode)`. `has` and `get` are the two operations
/// the fallback coordinator needs: deciding whether a mode switch is legal,
/// and binding to the chosen capability.
pub struct ServiceRegistry {
    cloud: RwLock<HashMap<String, Capability>>,
    local: RwLock<HashMap<String, Capability>>,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            cloud: RwLock::new(HashMap::new()),
            local: RwLock::new(HashMap::new()),
        }
    }

    fn table(&self, mode: ServiceMode) -> &RwLock<HashMap<String, Capability>> {
        match mode {
            ServiceMode::Cloud => &self.cloud,
            ServiceMode::Local => &self.local,
        }
    }

    pub async fn register(&self, service: &str, mode: ServiceMode, capability: Capability) {
        tracing::debug!(service, mode = %mode, "registering capability");
        self.table(mode).write().await.insert(service.to_string(), capability);
    }

    pub async fn has(&self, service: &str, mode: ServiceMode) -> bool {
        self.table(mode).read().await.contains_key(service)
    }

    pub async fn get(&self, service: &str, mode: ServiceMode) -> Option<Capability> {
        self.table(mode).read().await.get(service).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::InMemoryCache;

    #[tokio::test]
    async fn registry_reports_presence_per_mode() {
        let registry = ServiceRegistry::new();
        registry
            .register("cache", ServiceMode::Local, Capability::Cache(Arc::new(InMemoryCache::new())))
            .await;

        assert!(registry.has("cache", ServiceMode::Local).await);
        assert!(!registry.has("cache", ServiceMode::Cloud).await);
        assert!(registry.get("cache", ServiceMode::Cloud).await.is_none());
        assert!(registry.get("cache", ServiceMode::Local).await.is_some());
    }
}
