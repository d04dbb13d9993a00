//! Adapter registry (C12): durable metadata about every adapter ever seen,
//! independent of which base-model session currently has it loaded/enabled.
//! Backed by an abstract key-value store with an in-memory LRU cache in
//! front of it, the way `model::loader`'s shard loaders abstract over
//! OPFS/HTTP without the rest of the crate caring which one is in play.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use lru::LruCache;
use serde::{Deserialize, Serialize};

use crate::error::{LoomError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Opfs,
    Indexeddb,
    Url,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterRegistryEntry {
    pub id: String,
    pub name: String,
    pub version: String,
    pub base_model: String,
    pub rank: u32,
    pub alpha: f32,
    pub target_modules: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub storage_type: StorageType,
    pub manifest_path: String,
    #[serde(default)]
    pub weights_path: Option<String>,
    #[serde(default)]
    pub weights_size: Option<u64>,
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub manifest_json: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Stamped by `register`; preserved by `import_from_json` in merge mode.
    #[serde(default)]
    pub registered_at: u64,
    /// Touched by every `get`.
    #[serde(default)]
    pub last_accessed_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortBy {
    Name,
    Rank,
    Alpha,
    RegisteredAt,
    LastAccessedAt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

impl Default for SortOrder {
    fn default() -> Self {
        SortOrder::Ascending
    }
}

/// `list`'s filter/sort/paging query. The filter across fields is
/// conjunctive; `target_modules` is a superset predicate (the entry must
/// contain every requested module); `tags` is an intersection predicate (the
/// entry must share at least one requested tag). Sorting is lexicographic on
/// strings, numeric on numbers, and stable on ties (`Vec::sort_by` is a
/// stable sort).
#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    pub base_model: Option<String>,
    pub target_modules: Vec<String>,
    pub tags: Vec<String>,
    pub sort_by: Option<SortBy>,
    pub sort_order: SortOrder,
    pub limit: Option<usize>,
    pub offset: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ImportOptions {
    /// Replace an existing entry wholesale (fresh `registeredAt`), rather
    /// than skipping it. Ignored when `merge` is also set.
    pub overwrite: bool,
    /// Keep the existing entry's `registeredAt` and deep-merge `metadata`
    /// instead of replacing the entry outright.
    pub merge: bool,
}

fn now_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// Abstract durable storage a registry sits on top of. Implementations are
/// expected to be backed by OPFS, IndexedDB, or a plain filesystem directory
/// depending on the host environment; none of that is this crate's concern.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get_all(&self) -> Result<Vec<AdapterRegistryEntry>>;
    async fn get(&self, id: &str) -> Result<Option<AdapterRegistryEntry>>;
    async fn set(&self, entry: &AdapterRegistryEntry) -> Result<()>;
    async fn delete(&self, id: &str) -> Result<()>;
    async fn clear(&self) -> Result<()>;
}

/// An `AdapterRegistryEntry` store with an LRU read cache in front of an
/// abstract `KvStore`. Writes go through to the store immediately; the
/// registry never assumes the store itself caches anything.
pub struct AdapterRegistry {
    store: Box<dyn KvStore>,
    cache: Mutex<LruCache<String, AdapterRegistryEntry>>,
}

impl AdapterRegistry {
    pub fn new(store: Box<dyn KvStore>, cache_capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(cache_capacity).unwrap_or(NonZeroUsize::new(1).unwrap());
        Self {
            store,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    async fn write_through(&self, entry: AdapterRegistryEntry) -> Result<()> {
        self.store.set(&entry).await?;
        self.cache.lock().unwrap().put(entry.id.clone(), entry);
        Ok(())
    }

    /// Upserts the entry, stamping `registeredAt=now, lastAccessedAt=now`.
    pub async fn register(&self, mut entry: AdapterRegistryEntry) -> Result<()> {
        let now = now_millis();
        entry.registered_at = now;
        entry.last_accessed_at = now;
        self.write_through(entry).await
    }

    /// Looks up an entry, touching (and persisting) `lastAccessedAt=now`.
    pub async fn get(&self, id: &str) -> Result<Option<AdapterRegistryEntry>> {
        let cached = self.cache.lock().unwrap().get(id).cloned();
        let entry = match cached {
            Some(e) => Some(e),
            None => self.store.get(id).await?,
        };
        let Some(mut entry) = entry else {
            return Ok(None);
        };
        entry.last_accessed_at = now_millis();
        self.write_through(entry.clone()).await?;
        Ok(Some(entry))
    }

    /// Filters (conjunctively), sorts, and pages the full entry set per
    /// `query`. Does not touch `lastAccessedAt` — listing is not an access.
    pub async fn list(&self, query: &ListQuery) -> Result<Vec<AdapterRegistryEntry>> {
        let mut entries = self.store.get_all().await?;

        entries.retain(|e| {
            if let Some(ref base_model) = query.base_model {
                if &e.base_model != base_model {
                    return false;
                }
            }
            if !query.target_modules.is_empty()
                && !query.target_modules.iter().all(|m| e.target_modules.contains(m))
            {
                return false;
            }
            if !query.tags.is_empty() && !query.tags.iter().any(|t| e.tags.contains(t)) {
                return false;
            }
            true
        });

        if let Some(sort_by) = query.sort_by {
            entries.sort_by(|a, b| {
                let ordering = match sort_by {
                    SortBy::Name => a.name.cmp(&b.name),
                    SortBy::Rank => a.rank.cmp(&b.rank),
                    SortBy::Alpha => a.alpha.total_cmp(&b.alpha),
                    SortBy::RegisteredAt => a.registered_at.cmp(&b.registered_at),
                    SortBy::LastAccessedAt => a.last_accessed_at.cmp(&b.last_accessed_at),
                };
                match query.sort_order {
                    SortOrder::Ascending => ordering,
                    SortOrder::Descending => ordering.reverse(),
                }
            });
        }

        let offset = query.offset.min(entries.len());
        let mut entries = entries.split_off(offset);
        if let Some(limit) = query.limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    /// Shallow-merges `patch` into the entry's `metadata` and stamps
    /// `metadata.updatedAt=now`. Does not touch `registeredAt`.
    pub async fn update_metadata(
        &self,
        id: &str,
        patch: serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        let mut entry = self.get(id).await?.ok_or_else(|| LoomError::NotFound(id.to_string()))?;
        for (k, v) in patch {
            entry.metadata.insert(k, v);
        }
        entry.metadata.insert("updatedAt".to_string(), serde_json::json!(now_millis()));
        self.write_through(entry).await
    }

    pub async fn unregister(&self, id: &str) -> Result<()> {
        self.store.delete(id).await?;
        self.cache.lock().unwrap().pop(id);
        Ok(())
    }

    pub async fn export_to_json(&self) -> Result<String> {
        let entries = self.store.get_all().await?;
        Ok(serde_json::to_string_pretty(&entries)?)
    }

    /// `merge` preserves the existing entry's `registeredAt` and deep-merges
    /// `metadata`; `overwrite` (when `merge` is not set) replaces an existing
    /// entry wholesale with a fresh `registeredAt`; neither flag skips
    /// entries that already exist, only inserting genuinely new ones.
    pub async fn import_from_json(&self, json: &str, opts: ImportOptions) -> Result<usize> {
        let entries: Vec<AdapterRegistryEntry> = serde_json::from_str(json)?;
        let mut count = 0;
        for mut entry in entries {
            match self.store.get(&entry.id).await? {
                Some(existing) if opts.merge => {
                    entry.registered_at = existing.registered_at;
                    let mut merged = existing.metadata;
                    for (k, v) in entry.metadata {
                        merged.insert(k, v);
                    }
                    entry.metadata = merged;
                    self.write_through(entry).await?;
                    count += 1;
                }
                Some(_) if opts.overwrite => {
                    self.register(entry).await?;
                    count += 1;
                }
                Some(_) => {}
                None => {
                    self.write_through(entry).await?;
                    count += 1;
                }
            }
        }
        Ok(count)
    }
}

/// A plain in-process store, useful for tests and for hosts with no durable
/// backing store of their own.
#[derive(Default)]
pub struct MemoryKvStore {
    data: Mutex<HashMap<String, AdapterRegistryEntry>>,
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get_all(&self) -> Result<Vec<AdapterRegistryEntry>> {
        Ok(self.data.lock().unwrap().values().cloned().collect())
    }

    async fn get(&self, id: &str) -> Result<Option<AdapterRegistryEntry>> {
        Ok(self.data.lock().unwrap().get(id).cloned())
    }

    async fn set(&self, entry: &AdapterRegistryEntry) -> Result<()> {
        self.data.lock().unwrap().insert(entry.id.clone(), entry.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.data.lock().unwrap().remove(id);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.data.lock().unwrap().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str) -> AdapterRegistryEntry {
        AdapterRegistryEntry {
            id: id.into(),
            name: id.into(),
            version: "1.0.0".into(),
            base_model: "base".into(),
            rank: 8,
            alpha: 16.0,
            target_modules: vec!["q_proj".into()],
            tags: Vec::new(),
            storage_type: StorageType::Opfs,
            manifest_path: format!("/adapters/{id}.json"),
            weights_path: None,
            weights_size: None,
            checksum: None,
            manifest_json: None,
            metadata: serde_json::Map::new(),
            registered_at: 0,
            last_accessed_at: 0,
        }
    }

    #[tokio::test]
    async fn register_then_get_round_trips() {
        let registry = AdapterRegistry::new(Box::new(MemoryKvStore::default()), 8);
        registry.register(entry("a")).await.unwrap();
        let got = registry.get("a").await.unwrap().unwrap();
        assert_eq!(got.id, "a");
    }

    #[tokio::test]
    async fn register_stamps_registered_and_accessed_timestamps() {
        let registry = AdapterRegistry::new(Box::new(MemoryKvStore::default()), 8);
        registry.register(entry("a")).await.unwrap();
        let got = registry.get("a").await.unwrap().unwrap();
        assert!(got.registered_at > 0);
        assert!(got.last_accessed_at > 0);
    }

    #[tokio::test]
    async fn list_applies_conjunctive_filter() {
        let registry = AdapterRegistry::new(Box::new(MemoryKvStore::default()), 8);
        let mut a = entry("a");
        a.base_model = "llama".into();
        a.target_modules = vec!["q_proj".into(), "v_proj".into()];
        a.tags = vec!["chat".into()];
        let mut b = entry("b");
        b.base_model = "llama".into();
        b.target_modules = vec!["q_proj".into()];
        b.tags = vec!["code".into()];
        let mut c = entry("c");
        c.base_model = "other".into();
        c.target_modules = vec!["q_proj".into(), "v_proj".into()];
        c.tags = vec!["chat".into()];
        registry.register(a).await.unwrap();
        registry.register(b).await.unwrap();
        registry.register(c).await.unwrap();

        let query = ListQuery {
            base_model: Some("llama".into()),
            target_modules: vec!["v_proj".into()],
            tags: vec!["chat".into()],
            ..Default::default()
        };
        let got = registry.list(&query).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].id, "a");
    }

    #[tokio::test]
    async fn list_sorts_and_pages() {
        let registry = AdapterRegistry::new(Box::new(MemoryKvStore::default()), 8);
        for (id, rank) in [("a", 16u32), ("b", 8), ("c", 32)] {
            let mut e = entry(id);
            e.rank = rank;
            registry.register(e).await.unwrap();
        }
        let query = ListQuery {
            sort_by: Some(SortBy::Rank),
            sort_order: SortOrder::Ascending,
            limit: Some(2),
            ..Default::default()
        };
        let got = registry.list(&query).await.unwrap();
        assert_eq!(got.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(), vec!["b", "a"]);
    }

    #[tokio::test]
    async fn update_metadata_merges_and_stamps_updated_at() {
        let registry = AdapterRegistry::new(Box::new(MemoryKvStore::default()), 8);
        registry.register(entry("a")).await.unwrap();
        let mut patch = serde_json::Map::new();
        patch.insert("note".to_string(), serde_json::json!("hello"));
        registry.update_metadata("a", patch).await.unwrap();
        let got = registry.get("a").await.unwrap().unwrap();
        assert_eq!(got.metadata.get("note"), Some(&serde_json::json!("hello")));
        assert!(got.metadata.contains_key("updatedAt"));
    }

    #[tokio::test]
    async fn update_metadata_requires_existing_entry() {
        let registry = AdapterRegistry::new(Box::new(MemoryKvStore::default()), 8);
        let err = registry.update_metadata("missing", serde_json::Map::new()).await.unwrap_err();
        assert!(matches!(err, LoomError::NotFound(_)));
    }

    #[tokio::test]
    async fn export_then_import_preserves_entries() {
        let registry = AdapterRegistry::new(Box::new(MemoryKvStore::default()), 8);
        registry.register(entry("a")).await.unwrap();
        registry.register(entry("b")).await.unwrap();
        let json = registry.export_to_json().await.unwrap();

        let other = AdapterRegistry::new(Box::new(MemoryKvStore::default()), 8);
        let count = other.import_from_json(&json, ImportOptions::default()).await.unwrap();
        assert_eq!(count, 2);
        assert!(other.get("b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn import_merge_preserves_registered_at_and_merges_metadata() {
        let registry = AdapterRegistry::new(Box::new(MemoryKvStore::default()), 8);
        registry.register(entry("a")).await.unwrap();
        let original = registry.get("a").await.unwrap().unwrap();

        let mut incoming = entry("a");
        incoming.registered_at = 999_999_999;
        incoming.metadata.insert("note".to_string(), serde_json::json!("new"));
        let json = serde_json::to_string(&vec![incoming]).unwrap();

        registry.import_from_json(&json, ImportOptions { merge: true, overwrite: false }).await.unwrap();
        let got = registry.get("a").await.unwrap().unwrap();
        assert_eq!(got.registered_at, original.registered_at);
        assert_eq!(got.metadata.get("note"), Some(&serde_json::json!("new")));
    }

    #[tokio::test]
    async fn import_without_overwrite_or_merge_skips_existing() {
        let registry = AdapterRegistry::new(Box::new(MemoryKvStore::default()), 8);
        registry.register(entry("a")).await.unwrap();

        let mut incoming = entry("a");
        incoming.name = "renamed".into();
        let json = serde_json::to_string(&vec![incoming]).unwrap();

        let count = registry.import_from_json(&json, ImportOptions::default()).await.unwrap();
        assert_eq!(count, 0);
        let got = registry.get("a").await.unwrap().unwrap();
        assert_eq!(got.name, "a");
    }
}
