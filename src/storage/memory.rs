use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use parking_lot::Mutex;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::core::AccessRecord;
use crate::error::{IndexError, Result};
use crate::index::ContentDocument;
use crate::stats::{CollectionStats, StorageReport};
use crate::storage::segment::{compare_hits, Segment, SortedHit};
use crate::storage::{
    AccessUpdate, BulkItem, BulkResponse, IndexedDocument, ItemFailure, Mapping, SearchBackend,
    SearchHit, SearchRequest, SearchResponse, StoredPair, VersionRef,
};

#[derive(Debug, Default)]
struct CollectionStore {
    mapping: Mapping,
    content: HashMap<String, Arc<ContentDocument>>,
    access: HashMap<String, AccessRecord>,
    /// 上次 refresh 之后的写入次数
    pending: u64,
}

/// 进程内后端：primary 状态 realtime 可读，搜索走 refresh 时切换的只读段
///
/// 锁顺序：`refresh_gate` → `primary` 分片；同一时刻不持有 `primary` 的两个引用。
pub struct MemoryBackend {
    primary: DashMap<String, CollectionStore>,
    /// key → collection
    routes: DashMap<String, String>,
    /// logical key → 所有已存版本的 key
    logical: DashMap<String, BTreeSet<String>>,
    searchable: ArcSwap<HashMap<String, Arc<Segment>>>,
    refresh_gate: Mutex<()>,
    /// 单个 collection 累计写入达到阈值后自动 refresh；0 表示关闭
    auto_refresh_writes: AtomicU64,
    bulk_writes: AtomicU64,
    access_updates: AtomicU64,
    refreshes: AtomicU64,
}

/// snapshot 的持久化形态；content 以 JSON 字节保存（payload 是任意 JSON）
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BackendImage {
    pub collections: Vec<CollectionImage>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CollectionImage {
    pub name: String,
    pub mapping: Mapping,
    pub content: Vec<Vec<u8>>,
    pub access: Vec<AccessRecord>,
}

impl BackendImage {
    pub fn doc_count(&self) -> usize {
        self.collections.iter().map(|c| c.content.len()).sum()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            primary: DashMap::new(),
            routes: DashMap::new(),
            logical: DashMap::new(),
            searchable: ArcSwap::from_pointee(HashMap::new()),
            refresh_gate: Mutex::new(()),
            auto_refresh_writes: AtomicU64::new(0),
            bulk_writes: AtomicU64::new(0),
            access_updates: AtomicU64::new(0),
            refreshes: AtomicU64::new(0),
        }
    }

    pub fn with_auto_refresh(self, writes: u64) -> Self {
        self.auto_refresh_writes.store(writes, Ordering::Relaxed);
        self
    }

    fn route(&self, key: &str) -> Option<String> {
        self.routes.get(key).map(|r| r.value().clone())
    }

    fn maybe_auto_refresh(&self, collection: &str) -> Result<()> {
        let threshold = self.auto_refresh_writes.load(Ordering::Relaxed);
        if threshold == 0 {
            return Ok(());
        }
        let pending = self
            .primary
            .get(collection)
            .map(|s| s.pending)
            .unwrap_or(0);
        if pending >= threshold {
            tracing::debug!(
                "Auto refresh {}: {} pending writes >= {}",
                collection,
                pending,
                threshold
            );
            self.refresh(Some(collection))?;
        }
        Ok(())
    }

    fn rebuild_segment(&self, name: &str) -> Option<Segment> {
        let (mapping, mut entries) = {
            let mut store = self.primary.get_mut(name)?;
            store.pending = 0;
            let entries: Vec<_> = store
                .content
                .iter()
                .map(|(k, c)| (k.clone(), c.clone(), store.access.get(k).cloned()))
                .collect();
            (store.mapping.clone(), entries)
        };
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Some(Segment::build(name, &mapping, entries))
    }

    /// 导出 primary 状态
    pub fn export(&self) -> Result<BackendImage> {
        let mut collections = Vec::new();
        for entry in self.primary.iter() {
            let store = entry.value();
            let mut keys: Vec<&String> = store.content.keys().collect();
            keys.sort();
            let mut content = Vec::with_capacity(keys.len());
            for k in keys {
                if let Some(doc) = store.content.get(k) {
                    content.push(serde_json::to_vec(doc.as_ref())?);
                }
            }
            let mut access: Vec<AccessRecord> = store.access.values().cloned().collect();
            access.sort_by(|a, b| a.guid.cmp(&b.guid));
            collections.push(CollectionImage {
                name: entry.key().clone(),
                mapping: store.mapping.clone(),
                content,
                access,
            });
        }
        collections.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(BackendImage { collections })
    }

    /// 从 image 重建（含路由与版本索引），并立即 refresh
    pub fn from_image(image: BackendImage) -> Result<Self> {
        let backend = Self::new();
        for col in image.collections {
            let mut store = CollectionStore {
                mapping: col.mapping,
                ..CollectionStore::default()
            };
            for bytes in &col.content {
                let doc: ContentDocument = serde_json::from_slice(bytes)?;
                let key = doc.guid.to_string();
                backend.routes.insert(key.clone(), col.name.clone());
                backend
                    .logical
                    .entry(doc.logical.clone())
                    .or_default()
                    .insert(key.clone());
                store.content.insert(key, Arc::new(doc));
            }
            for rec in col.access {
                let key = rec.guid.to_string();
                backend.routes.insert(key.clone(), col.name.clone());
                backend
                    .logical
                    .entry(rec.logical.clone())
                    .or_default()
                    .insert(key.clone());
                store.access.insert(key, rec);
            }
            backend.primary.insert(col.name, store);
        }
        backend.refresh(None)?;
        Ok(backend)
    }
}

impl SearchBackend for MemoryBackend {
    fn ensure_collection(&self, name: &str, mapping: &Mapping) -> Result<()> {
        let mut store = self
            .primary
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::info!("Created collection {} ({} keys)", name, mapping.keys.len());
                CollectionStore {
                    mapping: mapping.clone(),
                    ..CollectionStore::default()
                }
            });
        if store.mapping.merge(mapping) {
            tracing::debug!("Extended mapping of {}", name);
        }
        Ok(())
    }

    fn collections(&self) -> Result<Vec<(String, Mapping)>> {
        let mut out: Vec<(String, Mapping)> = self
            .primary
            .iter()
            .map(|e| (e.key().clone(), e.value().mapping.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    fn bulk_upsert(&self, collection: &str, docs: Vec<IndexedDocument>) -> Result<BulkResponse> {
        let mut items = Vec::with_capacity(docs.len());
        {
            let mut store = self.primary.get_mut(collection).ok_or_else(|| {
                IndexError::backend(format!("collection {} does not exist", collection))
            })?;
            for doc in docs {
                let key = doc.key();
                if let Some(other) = self.route(&key) {
                    if other != collection {
                        items.push(BulkItem {
                            key,
                            error: Some(ItemFailure::Conflict { collection: other }),
                        });
                        continue;
                    }
                }
                self.logical
                    .entry(doc.content.logical.clone())
                    .or_default()
                    .insert(key.clone());
                self.routes.insert(key.clone(), collection.to_string());
                store.content.insert(key.clone(), Arc::new(doc.content));
                store.access.insert(key.clone(), doc.access);
                store.pending += 1;
                items.push(BulkItem { key, error: None });
            }
        }
        self.bulk_writes.fetch_add(1, Ordering::Relaxed);
        self.maybe_auto_refresh(collection)?;
        Ok(BulkResponse { items })
    }

    fn update_access(
        &self,
        key: &str,
        mutate: &dyn Fn(&mut AccessRecord) -> bool,
    ) -> Result<AccessUpdate> {
        let collection = self.route(key).ok_or_else(|| IndexError::NotFound {
            guid: key.to_string(),
        })?;
        let changed = {
            let mut store =
                self.primary
                    .get_mut(&collection)
                    .ok_or_else(|| IndexError::InconsistentState {
                        guid: key.to_string(),
                        detail: "routed to a missing collection",
                    })?;
            let has_content = store.content.contains_key(key);
            match store.access.get_mut(key) {
                Some(rec) => {
                    let changed = mutate(rec);
                    if changed {
                        store.pending += 1;
                    }
                    changed
                }
                None if has_content => {
                    return Err(IndexError::InconsistentState {
                        guid: key.to_string(),
                        detail: "content document without access document",
                    })
                }
                None => {
                    return Err(IndexError::NotFound {
                        guid: key.to_string(),
                    })
                }
            }
        };
        if !changed {
            return Ok(AccessUpdate::Unchanged);
        }
        self.access_updates.fetch_add(1, Ordering::Relaxed);
        self.maybe_auto_refresh(&collection)?;
        Ok(AccessUpdate::Updated)
    }

    fn versions_of(&self, logical: &str) -> Result<Vec<VersionRef>> {
        let keys: Vec<String> = match self.logical.get(logical) {
            Some(set) => set.iter().cloned().collect(),
            None => return Ok(Vec::new()),
        };
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(collection) = self.route(&key) else {
                continue;
            };
            let Some(store) = self.primary.get(&collection) else {
                continue;
            };
            let found = match (store.access.get(&key), store.content.get(&key)) {
                (Some(a), _) => Some(VersionRef {
                    guid: a.guid.clone(),
                    version: a.version,
                    members: a.members().collect(),
                    latest: a.latest,
                    latest_in: a.latest_in.clone(),
                    has_access: true,
                }),
                (None, Some(c)) => Some(VersionRef {
                    guid: c.guid.clone(),
                    version: c.guid.version(),
                    members: BTreeSet::new(),
                    latest: false,
                    latest_in: BTreeSet::new(),
                    has_access: false,
                }),
                (None, None) => None,
            };
            drop(store);
            out.extend(found);
        }
        out.sort_by(|a, b| a.version.cmp(&b.version).then_with(|| a.guid.cmp(&b.guid)));
        Ok(out)
    }

    fn get(&self, keys: &[String]) -> Result<Vec<StoredPair>> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let collection = self.route(key);
            let (content, access) = match collection
                .as_ref()
                .and_then(|c| self.primary.get(c))
            {
                Some(store) => (
                    store.content.get(key).map(|c| c.as_ref().clone()),
                    store.access.get(key).cloned(),
                ),
                None => (None, None),
            };
            out.push(StoredPair {
                key: key.clone(),
                collection,
                content,
                access,
            });
        }
        Ok(out)
    }

    fn remove(&self, keys: &[String]) -> Result<usize> {
        let mut removed = 0;
        for key in keys {
            let Some((_, collection)) = self.routes.remove(key) else {
                continue;
            };
            let logical = match self.primary.get_mut(&collection) {
                Some(mut store) => {
                    let content = store.content.remove(key);
                    let access = store.access.remove(key);
                    if content.is_some() || access.is_some() {
                        store.pending += 1;
                        removed += 1;
                    }
                    content
                        .map(|c| c.logical.clone())
                        .or_else(|| access.map(|a| a.logical))
                }
                None => None,
            };
            if let Some(logical) = logical {
                let now_empty = match self.logical.get_mut(&logical) {
                    Some(mut set) => {
                        set.remove(key);
                        set.is_empty()
                    }
                    None => false,
                };
                if now_empty {
                    self.logical.remove_if(&logical, |_, set| set.is_empty());
                }
            }
        }
        Ok(removed)
    }

    fn search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        let snapshot = self.searchable.load_full();
        let want_hits = request.size > 0;

        let partials: Vec<(String, u64, Vec<SortedHit>)> = request
            .targets
            .par_iter()
            .map(|target| {
                let Some(seg) = snapshot.get(&target.collection) else {
                    return (target.collection.clone(), 0, Vec::new());
                };
                let bits = seg.eval(&target.query);
                let hits = if want_hits {
                    seg.collect(&bits, &request.sort)
                } else {
                    Vec::new()
                };
                (target.collection.clone(), bits.len(), hits)
            })
            .collect();

        let mut response = SearchResponse::default();
        let mut merged: Vec<SortedHit> = Vec::new();
        for (collection, count, hits) in partials {
            response.total += count;
            *response.per_collection.entry(collection).or_insert(0) += count;
            merged.extend(hits);
        }
        if want_hits {
            merged.par_sort_by(|a, b| compare_hits(a, b, &request.sort));
            response.hits = merged
                .into_iter()
                .skip(request.from)
                .take(request.size)
                .map(|h| SearchHit {
                    collection: h.collection,
                    key: h.key,
                })
                .collect();
        }
        Ok(response)
    }

    fn refresh(&self, collection: Option<&str>) -> Result<()> {
        let _gate = self.refresh_gate.lock();
        let current = self.searchable.load_full();
        let names: Vec<String> = match collection {
            Some(name) => vec![name.to_string()],
            None => self
                .primary
                .iter()
                .filter(|e| e.value().pending > 0 || !current.contains_key(e.key()))
                .map(|e| e.key().clone())
                .collect(),
        };
        if names.is_empty() {
            return Ok(());
        }

        let mut next: HashMap<String, Arc<Segment>> = current.as_ref().clone();
        for name in &names {
            match self.rebuild_segment(name) {
                Some(seg) => {
                    tracing::debug!("Refreshed {}: {} docs", name, seg.len());
                    next.insert(name.clone(), Arc::new(seg));
                }
                None => {
                    next.remove(name);
                }
            }
        }
        self.searchable.store(Arc::new(next));
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn stats(&self) -> StorageReport {
        let snapshot = self.searchable.load();
        let mut collections: Vec<CollectionStats> = self
            .primary
            .iter()
            .map(|e| {
                let store = e.value();
                let seg = snapshot.get(e.key());
                CollectionStats {
                    name: e.key().clone(),
                    docs: store.content.len(),
                    access_docs: store.access.len(),
                    pending: store.pending,
                    searchable_docs: seg.map(|s| s.len()).unwrap_or(0),
                    distinct_terms: seg.map(|s| s.distinct_terms()).unwrap_or(0),
                    postings: seg.map(|s| s.postings()).unwrap_or(0),
                    postings_bytes: seg.map(|s| s.postings_bytes()).unwrap_or(0),
                }
            })
            .collect();
        collections.sort_by(|a, b| a.name.cmp(&b.name));
        StorageReport {
            collections,
            bulk_writes: self.bulk_writes.load(Ordering::Relaxed),
            access_updates: self.access_updates.load(Ordering::Relaxed),
            refreshes: self.refreshes.load(Ordering::Relaxed),
        }
    }
}
