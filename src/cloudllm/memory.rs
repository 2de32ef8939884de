//! The Memory Collaborator (§6.2): an optional, scoped key/value and search
//! surface the engine serializes access to per run.
//!
//! Grounded in `planner.rs`'s `MemoryStore` trait (the minimal async
//! get/put/search shape) and backed, for the reference implementation, by
//! `thought_chain.rs`'s hash-chained `.jsonl` persistence — the concrete
//! durable-memory pattern the teacher ships.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::cloudllm::error::DynError;
use crate::cloudllm::thought_chain::{ThoughtChain, ThoughtType};

/// A single entry returned by [`Memory::search`].
#[derive(Debug, Clone)]
pub struct MemoryEntry {
    pub key: String,
    pub value: serde_json::Value,
    pub score: f64,
}

/// The Memory Collaborator contract. All methods are scoped by an opaque
/// `user_scope` string (e.g. a user or session id) so one Memory instance
/// can safely back multiple concurrent runs.
#[async_trait]
pub trait Memory: Send + Sync {
    async fn get(&self, key: &str, user_scope: &str) -> Result<Option<serde_json::Value>, DynError>;
    async fn put(&self, key: &str, value: serde_json::Value, user_scope: &str) -> Result<(), DynError>;
    async fn search(&self, query: &str, k: usize, user_scope: &str) -> Result<Vec<MemoryEntry>, DynError>;
}

/// Default no-op implementation, mirroring `planner.rs`'s `NoopMemory`: a
/// zero-cost opt-out for runs that don't need durable memory.
pub struct NoopMemory;

#[async_trait]
impl Memory for NoopMemory {
    async fn get(&self, _key: &str, _user_scope: &str) -> Result<Option<serde_json::Value>, DynError> {
        Ok(None)
    }

    async fn put(&self, _key: &str, _value: serde_json::Value, _user_scope: &str) -> Result<(), DynError> {
        Ok(())
    }

    async fn search(&self, _query: &str, _k: usize, _user_scope: &str) -> Result<Vec<MemoryEntry>, DynError> {
        Ok(Vec::new())
    }
}

/// A durable `Memory` implementation backed by one `ThoughtChain` per
/// `user_scope`, persisted under `storage_dir`. `get`/`put` address a
/// thought by its chain index (encoded as the key); `search` performs a
/// substring match over thought content, scoring by occurrence count — a
/// simple stand-in until a richer strategy is configured.
pub struct ThoughtChainMemory {
    storage_dir: PathBuf,
    chains: RwLock<std::collections::HashMap<String, Arc<RwLock<ThoughtChain>>>>,
}

impl ThoughtChainMemory {
    pub fn new(storage_dir: PathBuf) -> Self {
        Self { storage_dir, chains: RwLock::new(std::collections::HashMap::new()) }
    }

    async fn chain_for(&self, user_scope: &str) -> Result<Arc<RwLock<ThoughtChain>>, DynError> {
        if let Some(chain) = self.chains.read().await.get(user_scope) {
            return Ok(chain.clone());
        }
        let mut chains = self.chains.write().await;
        if let Some(chain) = chains.get(user_scope) {
            return Ok(chain.clone());
        }
        let chain = ThoughtChain::open(&self.storage_dir, user_scope, user_scope, None, None)?;
        let handle = Arc::new(RwLock::new(chain));
        chains.insert(user_scope.to_string(), handle.clone());
        Ok(handle)
    }
}

#[async_trait]
impl Memory for ThoughtChainMemory {
    async fn get(&self, key: &str, user_scope: &str) -> Result<Option<serde_json::Value>, DynError> {
        let index: u64 = match key.parse() {
            Ok(i) => i,
            Err(_) => return Ok(None),
        };
        let chain = self.chain_for(user_scope).await?;
        let chain = chain.read().await;
        Ok(chain
            .thoughts()
            .iter()
            .find(|t| t.index == index)
            .map(|t| serde_json::json!({ "content": t.content, "thought_type": t.thought_type })))
    }

    async fn put(&self, _key: &str, value: serde_json::Value, user_scope: &str) -> Result<(), DynError> {
        let chain = self.chain_for(user_scope).await?;
        let mut chain = chain.write().await;
        let content = value.to_string();
        chain.append(user_scope, ThoughtType::Finding, &content)?;
        Ok(())
    }

    async fn search(&self, query: &str, k: usize, user_scope: &str) -> Result<Vec<MemoryEntry>, DynError> {
        let chain = self.chain_for(user_scope).await?;
        let chain = chain.read().await;
        let needle = query.to_lowercase();
        let mut results: Vec<MemoryEntry> = chain
            .thoughts()
            .iter()
            .filter_map(|t| {
                let haystack = t.content.to_lowercase();
                let occurrences = haystack.matches(&needle).count();
                if occurrences == 0 {
                    return None;
                }
                Some(MemoryEntry {
                    key: t.index.to_string(),
                    value: serde_json::json!({ "content": t.content }),
                    score: occurrences as f64,
                })
            })
            .collect();
        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap());
        results.truncate(k);
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_memory_returns_empty() {
        let memory = NoopMemory;
        assert!(memory.get("k", "scope").await.unwrap().is_none());
        assert!(memory.search("q", 5, "scope").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn thought_chain_memory_put_then_search() {
        let dir = tempfile::tempdir().unwrap();
        let memory = ThoughtChainMemory::new(dir.path().to_path_buf());
        memory.put("ignored", serde_json::json!("the quick brown fox"), "u1").await.unwrap();
        memory.put("ignored", serde_json::json!("a slow turtle"), "u1").await.unwrap();
        let results = memory.search("quick", 5, "u1").await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].value["content"].as_str().unwrap().contains("quick"));
    }

    #[tokio::test]
    async fn thought_chain_memory_get_by_index() {
        let dir = tempfile::tempdir().unwrap();
        let memory = ThoughtChainMemory::new(dir.path().to_path_buf());
        memory.put("ignored", serde_json::json!("first thought"), "u1").await.unwrap();
        let got = memory.get("0", "u1").await.unwrap();
        assert!(got.is_some());
    }
}
