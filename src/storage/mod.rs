pub mod memory;
mod segment;
pub mod snapshot;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::core::{AccessRecord, Guid, IndexingRule, KeywordKind, SearchObjectType};
use crate::error::Result;
use crate::index::ContentDocument;
use crate::query::{Field, Query};
use crate::stats::StorageReport;

pub use memory::MemoryBackend;
pub use snapshot::SnapshotStore;

/// 一个 collection 的 key → kind 映射；由规则推出，只增不改
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    pub object_type: SearchObjectType,
    pub keys: BTreeMap<String, KeywordKind>,
}

impl Mapping {
    pub fn from_rules(object_type: &SearchObjectType, rules: &[IndexingRule]) -> Self {
        let mut keys = BTreeMap::new();
        for rule in rules {
            keys.entry(rule.key_name.clone()).or_insert(rule.kind);
        }
        Self {
            object_type: object_type.clone(),
            keys,
        }
    }

    pub fn kind(&self, key: &str) -> Option<KeywordKind> {
        self.keys.get(key).copied()
    }

    /// 补充缺失的 key；已有 key 的 kind 冲突时保留旧值。返回是否有新增
    pub fn merge(&mut self, other: &Mapping) -> bool {
        let mut changed = false;
        for (key, kind) in &other.keys {
            match self.keys.get(key) {
                None => {
                    self.keys.insert(key.clone(), *kind);
                    changed = true;
                }
                Some(existing) if existing != kind => {
                    tracing::warn!(
                        "Mapping conflict on {}.{}: keeping {:?}, ignoring {:?}",
                        self.object_type,
                        key,
                        existing,
                        kind
                    );
                }
                Some(_) => {}
            }
        }
        changed
    }
}

/// 同一 key 下的一对文档
#[derive(Clone, Debug, PartialEq)]
pub struct IndexedDocument {
    pub content: ContentDocument,
    pub access: AccessRecord,
}

impl IndexedDocument {
    pub fn key(&self) -> String {
        self.content.guid.to_string()
    }
}

/// 单条写入被拒的原因
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ItemFailure {
    /// 同一 identity 已存于另一个 collection
    Conflict { collection: String },
}

impl std::fmt::Display for ItemFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ItemFailure::Conflict { collection } => {
                write!(f, "identity already stored in {}", collection)
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BulkItem {
    pub key: String,
    pub error: Option<ItemFailure>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BulkResponse {
    pub items: Vec<BulkItem>,
}

impl BulkResponse {
    pub fn errors(&self) -> impl Iterator<Item = &BulkItem> {
        self.items.iter().filter(|i| i.error.is_some())
    }
}

/// 某个逻辑对象的一个已存版本
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionRef {
    pub guid: Guid,
    pub version: u32,
    /// home ∪ 共享 container；缺访问文档时为空
    pub members: BTreeSet<u64>,
    pub latest: bool,
    pub latest_in: BTreeSet<u64>,
    pub has_access: bool,
}

/// realtime 读：两半可能各自缺失
#[derive(Clone, Debug, PartialEq)]
pub struct StoredPair {
    pub key: String,
    pub collection: Option<String>,
    pub content: Option<ContentDocument>,
    pub access: Option<AccessRecord>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SortKey {
    pub field: Field,
    pub ascending: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SearchTarget {
    pub collection: String,
    pub query: Query,
}

/// `size == 0` 表示只计数
#[derive(Clone, Debug, PartialEq)]
pub struct SearchRequest {
    pub targets: Vec<SearchTarget>,
    pub sort: Vec<SortKey>,
    pub from: usize,
    pub size: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchHit {
    pub collection: String,
    pub key: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SearchResponse {
    pub total: u64,
    pub hits: Vec<SearchHit>,
    pub per_collection: BTreeMap<String, u64>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AccessUpdate {
    Updated,
    Unchanged,
}

/// 文档存储 + 搜索后端的抽象
///
/// ## 契约
/// - 写入（`bulk_upsert` / `update_access` / `remove`）立即对 `get` / `versions_of` 可见。
/// - `search` 只看到最近一次 `refresh` 之后的状态（near-real-time）。
/// - `update_access` 是单文档原子的 read-modify-write。
pub trait SearchBackend: Send + Sync {
    fn ensure_collection(&self, name: &str, mapping: &Mapping) -> Result<()>;

    fn collections(&self) -> Result<Vec<(String, Mapping)>>;

    /// 单条失败只体现在对应 item 上，不影响其余
    fn bulk_upsert(&self, collection: &str, docs: Vec<IndexedDocument>) -> Result<BulkResponse>;

    /// `mutate` 返回 true 表示有修改
    fn update_access(
        &self,
        key: &str,
        mutate: &dyn Fn(&mut AccessRecord) -> bool,
    ) -> Result<AccessUpdate>;

    fn versions_of(&self, logical: &str) -> Result<Vec<VersionRef>>;

    fn get(&self, keys: &[String]) -> Result<Vec<StoredPair>>;

    /// 返回实际删除的数量
    fn remove(&self, keys: &[String]) -> Result<usize>;

    fn search(&self, request: &SearchRequest) -> Result<SearchResponse>;

    /// `None` 表示刷新全部 collection
    fn refresh(&self, collection: Option<&str>) -> Result<()>;

    fn stats(&self) -> StorageReport;
}
