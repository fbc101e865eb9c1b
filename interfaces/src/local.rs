//! In-memory local stand-ins for the capability traits.
//!
//! These back the demo binary and the integration tests; they are not
//! adapters in their own right, just enough of an implementation to exercise
//! the registry and the coordinator without a real cloud dependency.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::capability::{Cache, CapabilityResult, Compute, Search, Storage};

#[derive(Default)]
pub struct InMemorySearch {
    documents: Mutex<HashMap<String, Vec<(String, Value)>>>,
}

impl InMemorySearch {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(tenant: &str) -> String {
        tenant.to_string()
    }
}

#[async_trait]
impl Search for InMemorySearch {
    async fn index_document(&self, tenant: &str, id: &str, document: Value) -> CapabilityResult<()> {
        let mut documents = self.documents.lock().unwrap();
        documents.entry(Self::key(tenant)).or_default().push((id.to_string(), document));
        Ok(())
    }

    async fn search(&self, tenant: &str, query: &str) -> CapabilityResult<Vec<Value>> {
        let documents = self.documents.lock().unwrap();
        Ok(documents
            .get(&Self::key(tenant))
            .into_iter()
            .flatten()
            .filter(|(_, doc)| doc.to_string().contains(query))
            .map(|(_, doc)| doc.clone())
            .collect())
    }

    async fn hybrid_search(&self, tenant: &str, query: &str) -> CapabilityResult<Vec<Value>> {
        self.search(tenant, query).await
    }

    async fn delete_document(&self, tenant: &str, id: &str) -> CapabilityResult<()> {
        let mut documents = self.documents.lock().unwrap();
        if let Some(docs) = documents.get_mut(&Self::key(tenant)) {
            docs.retain(|(doc_id, _)| doc_id != id);
        }
        Ok(())
    }
}

struct CacheRecord {
    value: Value,
    expires_at: Option<std::time::Instant>,
}

#[derive(Default)]
pub struct InMemoryCache {
    entries: Mutex<HashMap<(String, String), CacheRecord>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Cache for InMemoryCache {
    async fn get(&self, tenant: &str, key: &str) -> CapabilityResult<Option<Value>> {
        let mut entries = self.entries.lock().unwrap();
        let map_key = (tenant.to_string(), key.to_string());
        if let Some(record) = entries.get(&map_key) {
            if record.expires_at.map(|at| at <= std::time::Instant::now()).unwrap_or(false) {
                entries.remove(&map_key);
                return Ok(None);
            }
            return Ok(Some(record.value.clone()));
        }
        Ok(None)
    }

    async fn set(&self, tenant: &str, key: &str, value: Value, ttl: Option<Duration>) -> CapabilityResult<()> {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            (tenant.to_string(), key.to_string()),
            CacheRecord { value, expires_at: ttl.map(|d| std::time::Instant::now() + d) },
        );
        Ok(())
    }

    async fn delete(&self, tenant: &str, key: &str) -> CapabilityResult<()> {
        self.entries.lock().unwrap().remove(&(tenant.to_string(), key.to_string()));
        Ok(())
    }

    async fn exists(&self, tenant: &str, key: &str) -> CapabilityResult<bool> {
        Ok(self.get(tenant, key).await?.is_some())
    }
}

#[derive(Default)]
pub struct InMemoryStorage {
    objects: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn put_object(&self, tenant: &str, key: &str, bytes: Vec<u8>) -> CapabilityResult<()> {
        self.objects.lock().unwrap().insert((tenant.to_string(), key.to_string()), bytes);
        Ok(())
    }

    async fn get_object(&self, tenant: &str, key: &str) -> CapabilityResult<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(&(tenant.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| crate::capability::CapabilityError::Unsupported(format!("no object {key}")))
    }

    async fn delete_object(&self, tenant: &str, key: &str) -> CapabilityResult<()> {
        self.objects.lock().unwrap().remove(&(tenant.to_string(), key.to_string()));
        Ok(())
    }

    async fn list_objects(&self, tenant: &str, prefix: &str) -> CapabilityResult<Vec<String>> {
        let objects = self.objects.lock().unwrap();
        Ok(objects
            .keys()
            .filter(|(t, key)| t == tenant && key.starts_with(prefix))
            .map(|(_, key)| key.clone())
            .collect())
    }
}

#[derive(Default)]
pub struct InMemoryCompute;

impl InMemoryCompute {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Compute for InMemoryCompute {
    async fn invoke(&self, _tenant: &str, name: &str, payload: Value, _run_async: bool) -> CapabilityResult<Value> {
        Ok(serde_json::json!({ "invoked": name, "echo": payload }))
    }

    async fn schedule(&self, _tenant: &str, _config: Value) -> CapabilityResult<String> {
        Ok(uuid::Uuid::new_v4().to_string())
    }

    async fn status(&self, _tenant: &str, id: &str) -> CapabilityResult<Value> {
        Ok(serde_json::json!({ "id": id, "status": "completed" }))
    }
}
