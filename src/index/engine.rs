use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::EngineConfig;
use crate::core::{
    AccessFilter, AccessMutation, AccessRecord, Guid, IndexingRule, ObjectLookupProvider,
    ParsedRecord, SearchObjectType, SourceData, TypeRuleProvider,
};
use crate::error::{FailedIdentity, IndexError, Result};
use crate::index::document::{build, values_at, ObjectData};
use crate::query::compiler::{compile, compile_ids, compile_sort};
use crate::query::{FoundHits, MatchFilter, Pagination, PostProcessing, SortField, SortingRule};
use crate::stats::EngineReport;
use crate::storage::{
    AccessUpdate, IndexedDocument, ItemFailure, Mapping, SearchBackend, SearchHit, SearchRequest,
    SearchTarget, VersionRef,
};

/// 逻辑对象锁的分段数
const LOGICAL_LOCK_STRIPES: usize = 64;

/// 一次 index 请求（也是 `load` 命令的 JSON-lines 行格式）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexRequest {
    pub guid: Guid,
    pub object_type: SearchObjectType,
    #[serde(default)]
    pub record: ParsedRecord,
    pub source: SourceData,
    /// 毫秒时间戳
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub is_public: bool,
}

/// 批量 index 结果：逐对象隔离，失败不影响其余对象
#[derive(Debug, Default)]
pub struct BatchReport {
    pub indexed: Vec<Guid>,
    pub failed: Vec<FailedIdentity>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MutationReport {
    pub changed: Vec<Guid>,
    /// 已处于目标状态（幂等 no-op）
    pub unchanged: Vec<Guid>,
}

#[derive(Debug, Default)]
struct EngineCounters {
    indexed: AtomicU64,
    index_failures: AtomicU64,
    searches: AtomicU64,
    access_mutations: AtomicU64,
}

/// 索引引擎：文档构建、版本折叠、授权查询、访问账本变更
///
/// 同一逻辑对象上的写入（index、账本变更、purge）经分段锁串行化，
/// 读-改-写的账本字段与折叠结果不会被并发写覆盖；不同逻辑对象之间互不阻塞。
/// 后端写入在 `refresh` 之前不保证对搜索可见（realtime 读 `get_objects_by_ids` 除外）。
pub struct IndexEngine {
    backend: Arc<dyn SearchBackend>,
    config: EngineConfig,
    lookup: Option<Arc<dyn ObjectLookupProvider>>,
    rules: Option<Arc<dyn TypeRuleProvider>>,
    counters: EngineCounters,
    /// 按逻辑 key 的 hash 分段；同一时刻只持有一段
    logical_locks: Vec<Mutex<()>>,
}

impl IndexEngine {
    pub fn new(backend: Arc<dyn SearchBackend>, config: EngineConfig) -> Self {
        Self {
            backend,
            config,
            lookup: None,
            rules: None,
            counters: EngineCounters::default(),
            logical_locks: (0..LOGICAL_LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn with_lookup(mut self, lookup: Arc<dyn ObjectLookupProvider>) -> Self {
        self.lookup = Some(lookup);
        self
    }

    pub fn with_type_rules(mut self, rules: Arc<dyn TypeRuleProvider>) -> Self {
        self.rules = Some(rules);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// 一个 type+version 一个 collection
    pub fn collection_name(&self, object_type: &SearchObjectType) -> String {
        format!(
            "{}{}_{}",
            self.config.index_prefix,
            object_type.name.to_lowercase(),
            object_type.version
        )
    }

    // ---------------------------------------------------------------
    // 写入
    // ---------------------------------------------------------------

    pub fn index_object(&self, req: &IndexRequest, rules: &[IndexingRule]) -> Result<Guid> {
        let result = self.index_inner(req, rules);
        match &result {
            Ok(_) => {
                self.counters.indexed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.counters.index_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(guid = %req.guid, kind = %e.kind(), "Index failed: {}", e);
            }
        }
        result
    }

    fn index_inner(&self, req: &IndexRequest, rules: &[IndexingRule]) -> Result<Guid> {
        let ty = &req.object_type;
        if rules.is_empty() {
            return Err(IndexError::UnknownType {
                type_name: ty.name.clone(),
                version: ty.version,
            });
        }
        let collection = self.collection_name(ty);
        self.backend
            .ensure_collection(&collection, &Mapping::from_rules(ty, rules))?;

        let record = self.project_lookups(req, rules)?;
        let (content, mut access) = build(
            &record,
            ty,
            &req.guid,
            &req.source,
            req.timestamp,
            req.is_public,
            rules,
        );

        let key = req.guid.to_string();
        let logical = req.guid.logical_key();
        let version = req.guid.version();
        // lookup 可能回调引擎，必须在取锁之前完成
        let _guard = self.lock_logical(&logical);

        // 重复 index 同一 identity：保留已有的共享与 tombstone
        if let Some(prev) = self.backend.get(std::slice::from_ref(&key))?.pop() {
            if let Some(other) = prev.collection.as_deref().filter(|c| *c != collection) {
                return Err(IndexError::Conflict {
                    guid: key,
                    detail: format!("identity already stored in {}", other),
                });
            }
            match (prev.content.is_some(), prev.access) {
                (_, Some(old)) => {
                    access.shares = old.shares;
                    access.external_public = old.external_public;
                    access.deleted = old.deleted;
                }
                (true, None) => {
                    tracing::warn!(guid = %key, "Content without access document, rebuilding ledger");
                }
                (false, None) => {}
            }
        }

        let others: Vec<VersionRef> = self
            .stored_versions(&logical)?
            .into_iter()
            .filter(|v| v.version != version)
            .collect();
        let members: BTreeSet<u64> = access.members().collect();
        let claimed = claimable(&others, version, &members);
        access.latest = others.iter().all(|v| v.version < version);
        access.latest_in = claimed.clone();

        let resp = self
            .backend
            .bulk_upsert(&collection, vec![IndexedDocument { content, access }])?;
        match resp.items.as_slice() {
            [item] if item.key == key => match &item.error {
                Some(failure @ ItemFailure::Conflict { .. }) => {
                    return Err(IndexError::Conflict {
                        guid: key,
                        detail: failure.to_string(),
                    })
                }
                None => {}
            },
            items => {
                return Err(IndexError::backend(format!(
                    "malformed bulk response for {}: {} items",
                    key,
                    items.len()
                )))
            }
        }

        self.settle(&others, version, &claimed)?;
        tracing::debug!(guid = %key, collection = %collection, "Indexed object");
        Ok(req.guid.clone())
    }

    /// 规则声明了 lookup 的 key：解析引用对象并把其 `target_key` 的值复制进来
    fn project_lookups(&self, req: &IndexRequest, rules: &[IndexingRule]) -> Result<ParsedRecord> {
        let mut record = req.record.clone();
        let lookups: Vec<(&IndexingRule, &crate::core::KeyLookup)> = rules
            .iter()
            .filter_map(|r| r.lookup.as_ref().map(|l| (r, l)))
            .collect();
        if lookups.is_empty() {
            return Ok(record);
        }
        let Some(provider) = self.lookup.as_ref() else {
            tracing::warn!(
                guid = %req.guid,
                "{} lookup keys declared but no lookup provider configured, skipping",
                lookups.len()
            );
            return Ok(record);
        };

        for (rule, lookup) in lookups {
            let raw: Vec<Value> = match record.keywords.get(&lookup.ref_key) {
                Some(v) => v.clone(),
                None => {
                    let mut found = Vec::new();
                    values_at(&record.data, &lookup.ref_key, &mut found);
                    found.into_iter().cloned().collect()
                }
            };
            let mut refs = BTreeSet::new();
            for v in &raw {
                if let Some(s) = v.as_str() {
                    refs.insert(s.parse::<Guid>()?);
                }
            }
            if refs.is_empty() {
                continue;
            }

            let resolved = provider.resolve_refs(std::slice::from_ref(&req.guid), &refs)?;
            let objects = provider.lookup_by_guid(&resolved)?;
            for obj in objects.values() {
                let Some(value) = obj
                    .key_props
                    .as_ref()
                    .and_then(|props| props.get(&lookup.target_key))
                else {
                    continue;
                };
                if !value.is_empty() {
                    record = record.with_key(&rule.key_name, value.as_str());
                }
            }
        }
        Ok(record)
    }

    fn lock_logical(&self, logical: &str) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        logical.hash(&mut hasher);
        let stripe = (hasher.finish() % self.logical_locks.len() as u64) as usize;
        self.logical_locks[stripe].lock()
    }

    fn stored_versions(&self, logical: &str) -> Result<Vec<VersionRef>> {
        Ok(self
            .backend
            .versions_of(logical)?
            .into_iter()
            .filter(|v| v.has_access)
            .collect())
    }

    /// `version` 认领 `containers` 中没有更高版本成员的那些（share 与重复 share 都会重新认领）
    fn claim_latest(&self, logical: &str, version: u32, containers: &BTreeSet<u64>) -> Result<()> {
        let versions = self.stored_versions(logical)?;
        let claimed = claimable(&versions, version, containers);
        self.settle(&versions, version, &claimed)
    }

    /// 把 `claimed` 记到 `version` 上，更低版本让出这些 container；`latest` 按全局最大版本重写。
    /// 调用方持有该逻辑对象的锁。
    fn settle(&self, versions: &[VersionRef], version: u32, claimed: &BTreeSet<u64>) -> Result<()> {
        let max = versions
            .iter()
            .map(|v| v.version)
            .fold(version, u32::max);
        for v in versions {
            let latest = v.version == max;
            let unchanged = latest == v.latest
                && (v.version > version
                    || (v.version == version && claimed.is_subset(&v.latest_in))
                    || (v.version < version && v.latest_in.is_disjoint(claimed)));
            if unchanged {
                continue;
            }
            let key = v.guid.to_string();
            let update = |rec: &mut AccessRecord| {
                let mut latest_in = rec.latest_in.clone();
                if rec.version == version {
                    latest_in.extend(claimed.iter().copied());
                } else if rec.version < version {
                    latest_in.retain(|c| !claimed.contains(c));
                }
                rec.set_collapse(latest, latest_in)
            };
            match self.backend.update_access(&key, &update) {
                Ok(_) => {}
                Err(e) if e.is_retriable() => return Err(e),
                Err(e) => tracing::warn!(guid = %key, "Collapse update skipped: {}", e),
            }
        }
        Ok(())
    }

    /// 被删版本腾出的 container 交给其中版本最高的剩余成员
    fn release_latest(&self, logical: &str, vacated: &BTreeSet<u64>) -> Result<()> {
        let versions = self.stored_versions(logical)?;
        let Some(max) = versions.iter().map(|v| v.version).max() else {
            return Ok(());
        };
        self.settle(&versions, max, &BTreeSet::new())?;
        for v in &versions {
            let candidates: BTreeSet<u64> = vacated.intersection(&v.members).copied().collect();
            let gained = claimable(&versions, v.version, &candidates);
            if !gained.is_empty() {
                self.settle(&versions, v.version, &gained)?;
            }
        }
        Ok(())
    }

    /// 批量 index：规则来自 TypeRuleProvider；整批超过上限直接拒绝
    pub fn index_objects(&self, batch: &[IndexRequest]) -> Result<BatchReport> {
        if batch.len() > self.config.max_bulk_docs {
            return Err(IndexError::BatchTooLarge {
                size: batch.len(),
                limit: self.config.max_bulk_docs,
            });
        }
        let mut report = BatchReport::default();
        for req in batch {
            let rules: Arc<[IndexingRule]> = self
                .rules
                .as_ref()
                .and_then(|p| p.indexing_rules(&req.object_type))
                .unwrap_or_else(|| Arc::from(Vec::new()));
            match self.index_object(req, &rules) {
                Ok(guid) => report.indexed.push(guid),
                Err(cause) => report.failed.push(FailedIdentity {
                    guid: req.guid.clone(),
                    cause,
                }),
            }
        }
        tracing::info!(
            "Indexed batch: {} ok, {} failed",
            report.indexed.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// 硬删除内容 + 访问文档；被删版本为最新的 container 由剩余版本中的最高成员接替
    pub fn purge(&self, ids: &[Guid]) -> Result<usize> {
        let mut by_logical: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for id in ids {
            by_logical
                .entry(id.logical_key())
                .or_default()
                .push(id.to_string());
        }
        let mut removed = 0;
        for (logical, keys) in &by_logical {
            let _guard = self.lock_logical(logical);
            let vacated: BTreeSet<u64> = self
                .backend
                .get(keys)?
                .into_iter()
                .filter_map(|p| p.access)
                .flat_map(|a| a.latest_in)
                .collect();
            removed += self.backend.remove(keys)?;
            self.release_latest(logical, &vacated)?;
        }
        tracing::info!("Purged {} of {} identities", removed, ids.len());
        Ok(removed)
    }

    /// 同步屏障：之前的写入对之后的查询可见
    pub fn refresh(&self, object_type: Option<&SearchObjectType>) -> Result<()> {
        match object_type {
            Some(ty) => self.backend.refresh(Some(&self.collection_name(ty))),
            None => self.backend.refresh(None),
        }
    }

    pub fn refresh_index_by_type(&self, object_type: &SearchObjectType) -> Result<()> {
        self.refresh(Some(object_type))
    }

    // ---------------------------------------------------------------
    // 读取
    // ---------------------------------------------------------------

    /// realtime 读，不做授权过滤（内部 / 抽取流水线使用）
    pub fn get_objects_by_ids(
        &self,
        ids: &[Guid],
        post_processing: Option<&PostProcessing>,
    ) -> Result<Vec<ObjectData>> {
        let pp = post_processing.copied().unwrap_or_default();
        let keys: Vec<String> = ids.iter().map(Guid::to_string).collect();
        let mut out = Vec::with_capacity(ids.len());
        for pair in self.backend.get(&keys)? {
            match (pair.content, pair.access) {
                (Some(content), Some(_)) => out.push(ObjectData::hydrate(&content, &pp)),
                (None, None) => {
                    tracing::debug!(guid = %pair.key, "Object not indexed, skipping");
                }
                (Some(_), None) => {
                    return Err(IndexError::InconsistentState {
                        guid: pair.key,
                        detail: "content document without access document",
                    })
                }
                (None, Some(_)) => {
                    return Err(IndexError::InconsistentState {
                        guid: pair.key,
                        detail: "access document without content document",
                    })
                }
            }
        }
        Ok(out)
    }

    /// 按 identity 取回，经过与搜索相同的授权子句
    pub fn get_objects(
        &self,
        ids: &[Guid],
        authz: &AccessFilter,
        post_processing: Option<&PostProcessing>,
    ) -> Result<Vec<ObjectData>> {
        let query = compile_ids(ids, authz);
        if query.is_match_none() {
            return Ok(Vec::new());
        }
        self.counters.searches.fetch_add(1, Ordering::Relaxed);
        let targets: Vec<SearchTarget> = self
            .own_collections()?
            .into_iter()
            .map(|(collection, _)| SearchTarget {
                collection,
                query: query.clone(),
            })
            .collect();
        let resp = self.backend.search(&SearchRequest {
            targets,
            sort: compile_sort(&[]),
            from: 0,
            size: ids.len(),
        })?;
        let visible = hits_to_guids(&resp.hits)?;
        self.get_objects_by_ids(&visible, post_processing)
    }

    pub fn check_identities_exist(&self, ids: &[Guid]) -> Result<BTreeMap<Guid, bool>> {
        let keys: Vec<String> = ids.iter().map(Guid::to_string).collect();
        let pairs = self.backend.get(&keys)?;
        Ok(ids
            .iter()
            .cloned()
            .zip(pairs.into_iter().map(|p| p.content.is_some()))
            .collect())
    }

    fn own_collections(&self) -> Result<Vec<(String, Mapping)>> {
        Ok(self
            .backend
            .collections()?
            .into_iter()
            .filter(|(name, _)| name.starts_with(&self.config.index_prefix))
            .collect())
    }

    /// 每个 collection 按自身 mapping 编译；必然为空的目标直接跳过
    fn targets(
        &self,
        types: Option<&[String]>,
        filter: &MatchFilter,
        authz: &AccessFilter,
    ) -> Result<Vec<(SearchTarget, SearchObjectType)>> {
        let mut out = Vec::new();
        for (collection, mapping) in self.own_collections()? {
            if let Some(types) = types {
                if !types.iter().any(|t| *t == mapping.object_type.name) {
                    continue;
                }
            }
            let query = compile(filter, authz, &mapping);
            if query.is_match_none() {
                continue;
            }
            out.push((SearchTarget { collection, query }, mapping.object_type));
        }
        Ok(out)
    }

    /// 每个类型名下可见逻辑对象的数量（跨类型版本聚合，零计数不返回）
    pub fn search_types(
        &self,
        filter: &MatchFilter,
        authz: &AccessFilter,
    ) -> Result<BTreeMap<String, u64>> {
        self.counters.searches.fetch_add(1, Ordering::Relaxed);
        let (targets, types): (Vec<_>, Vec<_>) = self.targets(None, filter, authz)?.into_iter().unzip();
        let type_of: BTreeMap<String, String> = targets
            .iter()
            .zip(&types)
            .map(|(t, ty)| (t.collection.clone(), ty.name.clone()))
            .collect();
        let resp = self.backend.search(&SearchRequest {
            targets,
            sort: Vec::new(),
            from: 0,
            size: 0,
        })?;

        let mut out = BTreeMap::new();
        for (collection, count) in resp.per_collection {
            if count == 0 {
                continue;
            }
            if let Some(name) = type_of.get(&collection) {
                *out.entry(name.clone()).or_insert(0) += count;
            }
        }
        Ok(out)
    }

    /// 指定类型（所有类型版本）的全部命中 identity
    pub fn search_ids(
        &self,
        type_name: &str,
        filter: &MatchFilter,
        sort: &[SortingRule],
        authz: &AccessFilter,
    ) -> Result<Vec<Guid>> {
        self.counters.searches.fetch_add(1, Ordering::Relaxed);
        let types = [type_name.to_string()];
        let targets = self
            .targets(Some(&types), filter, authz)?
            .into_iter()
            .map(|(t, _)| t)
            .collect();
        let resp = self.backend.search(&SearchRequest {
            targets,
            sort: compile_sort(sort),
            from: 0,
            size: usize::MAX,
        })?;
        hits_to_guids(&resp.hits)
    }

    /// 分页搜索；`post_processing` 为 None 时只返回 identity
    pub fn search_objects(
        &self,
        types: Option<&[String]>,
        filter: &MatchFilter,
        sort: &[SortingRule],
        authz: &AccessFilter,
        page: Option<Pagination>,
        post_processing: Option<&PostProcessing>,
    ) -> Result<FoundHits> {
        let page = page.unwrap_or(Pagination::new(0, self.config.default_page_size));
        if page.count > self.config.max_page_size {
            return Err(IndexError::InvalidQuery(format!(
                "page size {} exceeds limit {}",
                page.count, self.config.max_page_size
            )));
        }
        self.counters.searches.fetch_add(1, Ordering::Relaxed);

        let targets = self
            .targets(types, filter, authz)?
            .into_iter()
            .map(|(t, _)| t)
            .collect();
        let resp = self.backend.search(&SearchRequest {
            targets,
            sort: compile_sort(sort),
            from: page.start,
            size: page.count,
        })?;
        let guids = hits_to_guids(&resp.hits)?;
        let objects = match post_processing {
            Some(pp) if pp.hydrates() => Some(self.get_objects_by_ids(&guids, Some(pp))?),
            _ => None,
        };
        let sorting = if sort.is_empty() {
            vec![SortingRule::by(SortField::Guid, true)]
        } else {
            sort.to_vec()
        };
        tracing::debug!(
            "Search page {}+{}: {} of {} hits",
            page.start,
            page.count,
            guids.len(),
            resp.total
        );
        Ok(FoundHits {
            pagination: page,
            sorting,
            total: resp.total,
            guids,
            objects,
        })
    }

    // ---------------------------------------------------------------
    // 访问账本变更
    // ---------------------------------------------------------------

    /// 逐 identity 独立应用，不跨 identity 事务化
    fn mutate(&self, ids: &[Guid], m: AccessMutation) -> Result<MutationReport> {
        let mut report = MutationReport::default();
        let mut failed = Vec::new();
        for id in ids {
            match self.mutate_one(id, &m) {
                Ok(AccessUpdate::Updated) => report.changed.push(id.clone()),
                Ok(AccessUpdate::Unchanged) => report.unchanged.push(id.clone()),
                Err(cause) => failed.push(FailedIdentity {
                    guid: id.clone(),
                    cause,
                }),
            }
        }
        self.counters
            .access_mutations
            .fetch_add(report.changed.len() as u64, Ordering::Relaxed);

        tracing::debug!(
            "{:?}: {} changed, {} unchanged, {} failed",
            m,
            report.changed.len(),
            report.unchanged.len(),
            failed.len()
        );
        let done: Vec<Guid> = report
            .changed
            .iter()
            .chain(report.unchanged.iter())
            .cloned()
            .collect();
        IndexError::collect_batch(done, failed)?;
        Ok(report)
    }

    fn mutate_one(&self, id: &Guid, m: &AccessMutation) -> Result<AccessUpdate> {
        let logical = id.logical_key();
        let _guard = self.lock_logical(&logical);
        let outcome = self.backend.update_access(&id.to_string(), &|rec| rec.apply(m))?;
        // unshare 只撤回本版本（在 apply 里完成），不把 container 交还给旧版本
        if let AccessMutation::Share { container, .. } = *m {
            self.claim_latest(&logical, id.version(), &BTreeSet::from([container]))?;
        }
        Ok(outcome)
    }

    fn mutate_all_versions(&self, id: &Guid, m: AccessMutation) -> Result<MutationReport> {
        let versions = self.backend.versions_of(&id.logical_key())?;
        if versions.is_empty() {
            return Err(IndexError::not_found(id));
        }
        let ids: Vec<Guid> = versions.into_iter().map(|v| v.guid).collect();
        self.mutate(&ids, m)
    }

    pub fn share(&self, ids: &[Guid], container: u64, container_is_public: bool) -> Result<MutationReport> {
        self.mutate(
            ids,
            AccessMutation::Share {
                container,
                public: container_is_public,
            },
        )
    }

    pub fn unshare(&self, ids: &[Guid], container: u64) -> Result<MutationReport> {
        self.mutate(ids, AccessMutation::Unshare { container })
    }

    pub fn publish(&self, ids: &[Guid]) -> Result<MutationReport> {
        self.mutate(ids, AccessMutation::Publish)
    }

    pub fn unpublish(&self, ids: &[Guid]) -> Result<MutationReport> {
        self.mutate(ids, AccessMutation::Unpublish)
    }

    pub fn publish_all_versions(&self, id: &Guid) -> Result<MutationReport> {
        self.mutate_all_versions(id, AccessMutation::Publish)
    }

    pub fn unpublish_all_versions(&self, id: &Guid) -> Result<MutationReport> {
        self.mutate_all_versions(id, AccessMutation::Unpublish)
    }

    pub fn publish_externally(&self, ids: &[Guid], container: u64) -> Result<MutationReport> {
        self.mutate(ids, AccessMutation::PublishExternally { container })
    }

    pub fn unpublish_externally(&self, ids: &[Guid], container: u64) -> Result<MutationReport> {
        self.mutate(ids, AccessMutation::UnpublishExternally { container })
    }

    pub fn delete_all_versions(&self, id: &Guid) -> Result<MutationReport> {
        self.mutate_all_versions(id, AccessMutation::Delete)
    }

    pub fn undelete_all_versions(&self, id: &Guid) -> Result<MutationReport> {
        self.mutate_all_versions(id, AccessMutation::Undelete)
    }

    pub fn stats(&self) -> EngineReport {
        EngineReport {
            storage: self.backend.stats(),
            objects_indexed: self.counters.indexed.load(Ordering::Relaxed),
            index_failures: self.counters.index_failures.load(Ordering::Relaxed),
            searches: self.counters.searches.load(Ordering::Relaxed),
            access_mutations: self.counters.access_mutations.load(Ordering::Relaxed),
            process_rss_bytes: EngineReport::read_process_rss(),
        }
    }
}

/// `containers` 中没有比 `version` 更高的版本作为成员的那些
fn claimable(versions: &[VersionRef], version: u32, containers: &BTreeSet<u64>) -> BTreeSet<u64> {
    containers
        .iter()
        .copied()
        .filter(|c| {
            !versions
                .iter()
                .any(|v| v.version > version && v.members.contains(c))
        })
        .collect()
}

fn hits_to_guids(hits: &[SearchHit]) -> Result<Vec<Guid>> {
    hits.iter().map(|h| h.key.parse()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{KeywordKind, StaticTypeRules};
    use crate::error::ErrorKind;
    use crate::query::MatchValue;
    use crate::stats::StorageReport;
    use crate::storage::{
        AccessUpdate, BulkResponse, MemoryBackend, SearchResponse, StoredPair, VersionRef,
    };
    use proptest::prelude::*;
    use serde_json::json;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    fn g(s: &str) -> Guid {
        s.parse().unwrap()
    }

    fn engine() -> IndexEngine {
        IndexEngine::new(Arc::new(MemoryBackend::new()), EngineConfig::default())
    }

    fn request(guid: &Guid, ty: &SearchObjectType, data: Value, is_public: bool) -> IndexRequest {
        IndexRequest {
            guid: guid.clone(),
            object_type: ty.clone(),
            record: ParsedRecord::new(data),
            source: SourceData::new("obj.1", "creator"),
            timestamp: 0,
            is_public,
        }
    }

    fn index(e: &IndexEngine, guid: &str, ty: &SearchObjectType, data: Value, rules: &[IndexingRule]) {
        e.index_object(&request(&g(guid), ty, data, false), rules)
            .unwrap();
    }

    fn ft(text: &str) -> MatchFilter {
        MatchFilter::create().with_full_text_in_all(text)
    }

    fn lookup(key: &str, value: impl Into<crate::query::Scalar>) -> MatchFilter {
        MatchFilter::create().with_lookup_in_key(key, MatchValue::value(value))
    }

    fn members(ids: &[u64]) -> AccessFilter {
        AccessFilter::create().with_containers(ids.iter().copied())
    }

    /// refresh 后搜索，结果按字符串集合返回
    fn found(e: &IndexEngine, ty: &str, filter: &MatchFilter, authz: &AccessFilter) -> BTreeSet<String> {
        e.refresh(None).unwrap();
        e.search_ids(ty, filter, &[], authz)
            .unwrap()
            .into_iter()
            .map(|g| g.to_string())
            .collect()
    }

    fn set(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn simple() -> (SearchObjectType, Vec<IndexingRule>) {
        (
            SearchObjectType::new("Simple", 1),
            vec![IndexingRule::from_path("prop1").full_text()],
        )
    }

    #[test]
    fn default_view_returns_latest_version_only() {
        let e = engine();
        let (ty, rules) = simple();
        index(&e, "CTR:1/1/1", &ty, json!({"prop1": "abc 123"}), &rules);
        index(&e, "CTR:1/1/2", &ty, json!({"prop1": "abc 124"}), &rules);

        assert_eq!(found(&e, "Simple", &ft("abc"), &members(&[1])), set(&["CTR:1/1/2"]));
        let history = members(&[1]).with_all_history(true);
        assert_eq!(
            found(&e, "Simple", &ft("abc"), &history),
            set(&["CTR:1/1/1", "CTR:1/1/2"])
        );
        // 只在旧版本中出现的内容：默认视图不可见，all-history 可见
        assert!(found(&e, "Simple", &ft("123"), &members(&[1])).is_empty());
        assert_eq!(found(&e, "Simple", &ft("123"), &history), set(&["CTR:1/1/1"]));
    }

    #[test]
    fn multiword_full_text_is_conjunctive() {
        let e = engine();
        let (ty, rules) = simple();
        index(&e, "WS:2/1/1", &ty, json!({"prop1": "abc 123"}), &rules);
        index(&e, "WS:2/2/1", &ty, json!({"prop1": "abd"}), &rules);
        index(&e, "WS:2/3/1", &ty, json!({"prop1": "ABC 124"}), &rules);

        assert_eq!(found(&e, "Simple", &ft("abc 124"), &members(&[2])), set(&["WS:2/3/1"]));
        assert_eq!(
            found(&e, "Simple", &ft("abc"), &members(&[2])),
            set(&["WS:2/1/1", "WS:2/3/1"])
        );
        assert!(found(&e, "Simple", &ft("abc abd"), &members(&[2])).is_empty());
        assert!(found(&e, "Simple", &ft("abc"), &members(&[3])).is_empty());
    }

    #[test]
    fn shared_version_visible_to_container_members() {
        let e = engine();
        let (ty, rules) = simple();
        index(&e, "CTR:1/1/1", &ty, json!({"prop1": "abc 123"}), &rules);
        index(&e, "CTR:1/1/2", &ty, json!({"prop1": "abc 124"}), &rules);

        e.share(&[g("CTR:1/1/1")], 11, false).unwrap();
        assert_eq!(found(&e, "Simple", &ft("abc"), &members(&[11])), set(&["CTR:1/1/1"]));
        assert!(found(&e, "Simple", &ft("abc"), &AccessFilter::create().with_public(true)).is_empty());
        // 其它版本的可见性不受影响
        assert_eq!(found(&e, "Simple", &ft("abc"), &members(&[1])), set(&["CTR:1/1/2"]));

        // 更新版本也进入 11 后，11 内折叠到新版本
        e.share(&[g("CTR:1/1/2")], 11, false).unwrap();
        assert_eq!(found(&e, "Simple", &ft("abc"), &members(&[11])), set(&["CTR:1/1/2"]));

        // 撤销新版本的共享不会把 11 交还给旧版本
        e.unshare(&[g("CTR:1/1/2")], 11).unwrap();
        assert!(found(&e, "Simple", &ft("abc"), &members(&[11])).is_empty());
        // 旧版本重复 share 会重新认领 11
        let report = e.share(&[g("CTR:1/1/1")], 11, false).unwrap();
        assert_eq!(report.unchanged, vec![g("CTR:1/1/1")]);
        assert_eq!(found(&e, "Simple", &ft("abc"), &members(&[11])), set(&["CTR:1/1/1"]));
        e.unshare(&[g("CTR:1/1/1")], 11).unwrap();
        assert!(found(&e, "Simple", &ft("abc"), &members(&[11])).is_empty());
        assert_eq!(found(&e, "Simple", &ft("abc"), &members(&[1])), set(&["CTR:1/1/2"]));
    }

    #[test]
    fn integer_lookup_across_versions_and_shares() {
        let e = engine();
        let ty = SearchObjectType::new("Sharable", 1);
        let rules = vec![IndexingRule::from_path("prop2").kind(KeywordKind::Integer)];
        index(&e, "WS:10/1/1", &ty, json!({"prop2": 123}), &rules);
        index(&e, "WS:10/1/2", &ty, json!({"prop2": 124}), &rules);
        index(&e, "WS:10/1/3", &ty, json!({"prop2": 125}), &rules);

        assert!(found(&e, "Sharable", &lookup("prop2", 123), &members(&[10])).is_empty());
        assert_eq!(found(&e, "Sharable", &lookup("prop2", 125), &members(&[10])), set(&["WS:10/1/3"]));
        assert_eq!(
            found(
                &e,
                "Sharable",
                &lookup("prop2", "124"),
                &members(&[10]).with_all_history(true)
            ),
            set(&["WS:10/1/2"])
        );

        let af11 = members(&[11]);
        e.share(&[g("WS:10/1/1")], 11, false).unwrap();
        assert_eq!(found(&e, "Sharable", &lookup("prop2", 123), &af11), set(&["WS:10/1/1"]));
        assert_eq!(found(&e, "Sharable", &lookup("prop2", 125), &members(&[10])), set(&["WS:10/1/3"]));
        assert!(found(&e, "Sharable", &lookup("prop2", 124), &af11).is_empty());
        assert!(found(&e, "Sharable", &lookup("prop2", 125), &af11).is_empty());

        e.share(&[g("WS:10/1/2")], 11, false).unwrap();
        assert!(found(&e, "Sharable", &lookup("prop2", 123), &af11).is_empty());
        assert_eq!(found(&e, "Sharable", &lookup("prop2", 124), &af11), set(&["WS:10/1/2"]));
        assert!(found(&e, "Sharable", &lookup("prop2", 125), &af11).is_empty());

        e.unshare(&[g("WS:10/1/2")], 11).unwrap();
        for v in [123, 124, 125] {
            assert!(found(&e, "Sharable", &lookup("prop2", v), &af11).is_empty(), "{v}");
        }

        e.share(&[g("WS:10/1/1")], 11, false).unwrap();
        e.share(&[g("WS:10/1/2")], 12, false).unwrap();
        let both = members(&[11, 12]);
        assert_eq!(found(&e, "Sharable", &lookup("prop2", 123), &both), set(&["WS:10/1/1"]));
        assert_eq!(found(&e, "Sharable", &lookup("prop2", 124), &both), set(&["WS:10/1/2"]));
        assert!(found(&e, "Sharable", &lookup("prop2", 125), &both).is_empty());

        e.unshare(&[g("WS:10/1/1")], 11).unwrap();
        assert!(found(&e, "Sharable", &lookup("prop2", 123), &both).is_empty());
        assert_eq!(found(&e, "Sharable", &lookup("prop2", 124), &both), set(&["WS:10/1/2"]));
        assert!(found(&e, "Sharable", &lookup("prop2", 125), &both).is_empty());

        e.unshare(&[g("WS:10/1/2")], 12).unwrap();
        for v in [123, 124, 125] {
            assert!(found(&e, "Sharable", &lookup("prop2", v), &both).is_empty(), "{v}");
        }
    }

    #[test]
    fn publish_is_version_scoped() {
        let e = engine();
        let ty = SearchObjectType::new("Publishable", 1);
        let rules = vec![IndexingRule::from_path("prop3").full_text()];
        index(&e, "WS:20/1/1", &ty, json!({"prop3": "private gggg"}), &rules);
        e.index_object(
            &request(&g("WS:20/2/1"), &ty, json!({"prop3": "public gggg"}), true),
            &rules,
        )
        .unwrap();

        let public = AccessFilter::create().with_public(true);
        let key = |v: &str| MatchFilter::create().with_full_text_in_key("prop3", v);
        assert!(found(&e, "Publishable", &key("private"), &public).is_empty());
        assert_eq!(
            found(&e, "Publishable", &key("private"), &members(&[20]).with_public(true)),
            set(&["WS:20/1/1"])
        );
        assert_eq!(
            found(&e, "Publishable", &key("public"), &members(&[21]).with_public(true)),
            set(&["WS:20/2/1"])
        );

        e.publish(&[g("WS:20/1/1")]).unwrap();
        assert_eq!(found(&e, "Publishable", &key("private"), &public), set(&["WS:20/1/1"]));
        e.unpublish(&[g("WS:20/1/1")]).unwrap();
        assert!(found(&e, "Publishable", &key("private"), &public).is_empty());
        e.unpublish(&[g("WS:20/2/1")]).unwrap();
        assert!(found(&e, "Publishable", &key("public"), &public).is_empty());
        assert_eq!(
            found(&e, "Publishable", &key("public"), &members(&[20])),
            set(&["WS:20/2/1"])
        );
    }

    #[test]
    fn external_publication_is_independent_of_sharing() {
        let e = engine();
        let ty = SearchObjectType::new("ShareAndPublic", 1);
        let rules = vec![IndexingRule::from_path("prop4").kind(KeywordKind::Integer)];
        index(&e, "WS:30/1/1", &ty, json!({"prop4": 123}), &rules);
        let id = g("WS:30/1/1");
        let public = AccessFilter::create().with_public(true);
        let q = lookup("prop4", 123);

        assert_eq!(found(&e, "ShareAndPublic", &q, &members(&[30])), set(&["WS:30/1/1"]));
        assert!(found(&e, "ShareAndPublic", &q, &public).is_empty());

        e.share(&[id.clone()], 31, true).unwrap();
        assert_eq!(found(&e, "ShareAndPublic", &q, &public), set(&["WS:30/1/1"]));
        e.unshare(&[id.clone()], 31).unwrap();
        assert!(found(&e, "ShareAndPublic", &q, &public).is_empty());

        e.share(&[id.clone()], 31, false).unwrap();
        assert!(found(&e, "ShareAndPublic", &q, &public).is_empty());
        e.publish_externally(&[id.clone()], 31).unwrap();
        assert_eq!(found(&e, "ShareAndPublic", &q, &public), set(&["WS:30/1/1"]));

        // 取消共享不影响外部公开
        e.unshare(&[id.clone()], 31).unwrap();
        assert_eq!(found(&e, "ShareAndPublic", &q, &public), set(&["WS:30/1/1"]));
        e.unpublish_externally(&[id], 31).unwrap();
        assert!(found(&e, "ShareAndPublic", &q, &public).is_empty());
    }

    #[test]
    fn delete_and_undelete_all_versions() {
        let e = engine();
        let ty = SearchObjectType::new("DelUndel", 1);
        let rules = vec![IndexingRule::from_path("myprop").full_text()];
        index(&e, "WS:100/2/1", &ty, json!({"myprop": "some stuff"}), &rules);
        index(&e, "WS:100/2/2", &ty, json!({"myprop": "some other stuff"}), &rules);

        let q = MatchFilter::create().with_full_text_in_key("myprop", "some");
        let latest = members(&[100]);
        let history = members(&[100]).with_all_history(true);
        assert_eq!(found(&e, "DelUndel", &q, &latest), set(&["WS:100/2/2"]));

        let report = e.delete_all_versions(&g("WS:100/2/1")).unwrap();
        assert_eq!(report.changed.len(), 2);
        e.refresh_index_by_type(&ty).unwrap();
        assert!(found(&e, "DelUndel", &q, &latest).is_empty());
        // 现有行为：all-history 下 tombstone 不过滤
        assert_eq!(
            found(&e, "DelUndel", &q, &history),
            set(&["WS:100/2/1", "WS:100/2/2"])
        );

        e.undelete_all_versions(&g("WS:100/2/1")).unwrap();
        assert_eq!(found(&e, "DelUndel", &q, &latest), set(&["WS:100/2/2"]));
        assert!(matches!(
            e.delete_all_versions(&g("WS:100/9/1")),
            Err(IndexError::NotFound { .. })
        ));
    }

    #[test]
    fn publish_all_versions_covers_every_version() {
        let e = engine();
        let (ty, rules) = simple();
        index(&e, "WS:5/1/1", &ty, json!({"prop1": "data"}), &rules);
        index(&e, "WS:5/1/2", &ty, json!({"prop1": "data"}), &rules);
        let public = AccessFilter::create().with_public(true);

        e.publish_all_versions(&g("WS:5/1/2")).unwrap();
        assert_eq!(found(&e, "Simple", &ft("data"), &public), set(&["WS:5/1/2"]));
        assert_eq!(
            found(&e, "Simple", &ft("data"), &public.clone().with_all_history(true)),
            set(&["WS:5/1/1", "WS:5/1/2"])
        );

        let again = e.publish_all_versions(&g("WS:5/1/1")).unwrap();
        assert!(again.changed.is_empty());
        assert_eq!(again.unchanged.len(), 2);

        e.unpublish_all_versions(&g("WS:5/1/1")).unwrap();
        assert!(found(&e, "Simple", &ft("data"), &public.with_all_history(true)).is_empty());
    }

    #[test]
    fn numeric_ranges_intersect_numerically() {
        let e = engine();
        let ty = SearchObjectType::new("Ranges", 1);
        let rules = vec![
            IndexingRule::from_path("k1").kind(KeywordKind::Integer),
            IndexingRule::from_path("k2").kind(KeywordKind::Double),
        ];
        index(&e, "WS:7/1/1", &ty, json!({"k1": 9, "k2": 1.5}), &rules);
        index(&e, "WS:7/2/1", &ty, json!({"k1": 10, "k2": 2.5}), &rules);
        index(&e, "WS:7/3/1", &ty, json!({"k1": 100, "k2": 2.0}), &rules);
        index(&e, "WS:7/4/1", &ty, json!({"k1": "20", "k2": "2.2"}), &rules);

        let q = MatchFilter::create()
            .with_lookup_in_key("k1", MatchValue::range(9, 20))
            .with_lookup_in_key("k2", MatchValue::range(2.0, 3.0));
        assert_eq!(found(&e, "Ranges", &q, &members(&[7])), set(&["WS:7/2/1", "WS:7/4/1"]));

        let open = MatchFilter::create().with_lookup_in_key("k1", MatchValue::at_least(50));
        assert_eq!(found(&e, "Ranges", &open, &members(&[7])), set(&["WS:7/3/1"]));
        let bad = MatchFilter::create().with_lookup_in_key("k1", MatchValue::range("x", 20));
        assert!(found(&e, "Ranges", &bad, &members(&[7])).is_empty());
    }

    #[test]
    fn search_types_aggregates_versions_and_omits_zero() {
        let e = engine();
        let rules = vec![IndexingRule::from_path("name").full_text()];
        let v1 = SearchObjectType::new("Genome", 1);
        let v2 = SearchObjectType::new("Genome", 2);
        let other = SearchObjectType::new("Assembly", 1);
        index(&e, "WS:1/1/1", &v1, json!({"name": "coli"}), &rules);
        index(&e, "WS:1/2/1", &v2, json!({"name": "coli k12"}), &rules);
        index(&e, "WS:1/3/1", &other, json!({"name": "contigs"}), &rules);
        e.refresh(None).unwrap();

        let counts = e.search_types(&ft("coli"), &members(&[1])).unwrap();
        assert_eq!(counts, BTreeMap::from([("Genome".to_string(), 2)]));
        let all = e.search_types(&MatchFilter::create(), &members(&[1])).unwrap();
        assert_eq!(all.get("Assembly"), Some(&1));
        assert!(e.search_types(&ft("coli"), &members(&[9])).unwrap().is_empty());
    }

    #[test]
    fn search_objects_pages_sorts_and_hydrates() {
        let e = engine();
        let ty = SearchObjectType::new("Paged", 1);
        let rules = vec![
            IndexingRule::from_path("name").full_text(),
            IndexingRule::from_path("size").kind(KeywordKind::Integer),
        ];
        for (i, size) in [(1, 30), (2, 10), (3, 20)] {
            index(
                &e,
                &format!("WS:4/{}/1", i),
                &ty,
                json!({"name": "item", "size": size}),
                &rules,
            );
        }
        e.refresh(None).unwrap();
        let authz = members(&[4]);
        let sort = [SortingRule::by_key("size", true)];

        let page = e
            .search_objects(
                None,
                &ft("item"),
                &sort,
                &authz,
                Some(Pagination::new(1, 2)),
                Some(&PostProcessing::default()),
            )
            .unwrap();
        assert_eq!(page.total, 3);
        let ids: Vec<String> = page.guids.iter().map(|g| g.to_string()).collect();
        assert_eq!(ids, vec!["WS:4/3/1", "WS:4/1/1"]);
        let objects = page.objects.unwrap();
        assert_eq!(objects[0].key_props.as_ref().unwrap()["size"], "20");

        let ids_only = e
            .search_objects(None, &ft("item"), &[], &authz, None, None)
            .unwrap();
        assert!(ids_only.objects.is_none());
        assert_eq!(ids_only.sorting, vec![SortingRule::by(SortField::Guid, true)]);
        assert_eq!(ids_only.guids[0].to_string(), "WS:4/1/1");
        let explicit = e
            .search_objects(None, &ft("item"), &[], &authz, None, Some(&PostProcessing::ids_only()))
            .unwrap();
        assert!(explicit.objects.is_none());
        assert_eq!(explicit.guids, ids_only.guids);

        let err = e
            .search_objects(None, &ft("item"), &[], &authz, Some(Pagination::new(0, 1_000_000)), None)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidQuery);
    }

    #[test]
    fn object_filters_name_timestamp_and_sub_objects() {
        let e = engine();
        let ty = SearchObjectType::new("GenomeFeature", 1);
        let rules = vec![IndexingRule::from_path("function").full_text()];
        let parent = g("WS:8/1/1");
        let feature = parent
            .sub_object(vec!["feature".into()], Some("f1".into()))
            .unwrap();
        let mut req = request(&parent, &ty, json!({"function": "kinase"}), false);
        req.source = SourceData::new("GCF_000005845", "creator");
        req.timestamp = 1_000;
        e.index_object(&req, &rules).unwrap();
        let mut req = request(&feature, &ty, json!({"function": "kinase"}), false);
        req.timestamp = 5_000;
        e.index_object(&req, &rules).unwrap();

        let authz = members(&[8]);
        assert_eq!(found(&e, "GenomeFeature", &ft("kinase"), &authz).len(), 2);
        let top = ft("kinase").with_exclude_sub_objects(true);
        assert_eq!(found(&e, "GenomeFeature", &top, &authz), set(&["WS:8/1/1"]));
        let named = MatchFilter::create().with_object_name("gcf_000005845");
        assert_eq!(found(&e, "GenomeFeature", &named, &authz), set(&["WS:8/1/1"]));
        let recent = MatchFilter::create().with_timestamp(Some(2_000), None);
        assert_eq!(
            found(&e, "GenomeFeature", &recent, &authz),
            set(&["WS:8/1/1:feature/f1"])
        );

        let objs = e
            .get_objects_by_ids(&[feature.clone()], Some(&PostProcessing::default()))
            .unwrap();
        assert_eq!(objs[0].parent_guid, Some(parent));
    }

    #[test]
    fn get_objects_applies_authorization() {
        let e = engine();
        let (ty, rules) = simple();
        index(&e, "WS:1/1/1", &ty, json!({"prop1": "a"}), &rules);
        index(&e, "WS:2/1/1", &ty, json!({"prop1": "b"}), &rules);
        e.refresh(None).unwrap();
        let ids = [g("WS:1/1/1"), g("WS:2/1/1"), g("WS:3/1/1")];

        let visible = e.get_objects(&ids, &members(&[1]), None).unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].guid, ids[0]);
        assert_eq!(visible[0].data, Some(json!({"prop1": "a"})));

        // 内部读不做授权，缺失的 identity 被跳过
        assert_eq!(e.get_objects_by_ids(&ids, None).unwrap().len(), 2);
        let exists = e.check_identities_exist(&ids).unwrap();
        assert_eq!(exists[&ids[1]], true);
        assert_eq!(exists[&ids[2]], false);
    }

    #[test]
    fn reindex_keeps_ledger_and_is_idempotent() {
        let e = engine();
        let (ty, rules) = simple();
        index(&e, "WS:1/1/1", &ty, json!({"prop1": "abc"}), &rules);
        e.share(&[g("WS:1/1/1")], 50, false).unwrap();
        index(&e, "WS:1/1/1", &ty, json!({"prop1": "abc"}), &rules);

        assert_eq!(found(&e, "Simple", &ft("abc"), &members(&[50])), set(&["WS:1/1/1"]));
        assert_eq!(e.stats().storage.total_docs(), 1);
        let again = e.share(&[g("WS:1/1/1")], 50, false).unwrap();
        assert_eq!(again.unchanged, vec![g("WS:1/1/1")]);
    }

    #[test]
    fn purge_promotes_previous_version() {
        let e = engine();
        let (ty, rules) = simple();
        index(&e, "WS:1/1/1", &ty, json!({"prop1": "abc"}), &rules);
        index(&e, "WS:1/1/2", &ty, json!({"prop1": "abc"}), &rules);
        assert_eq!(e.purge(&[g("WS:1/1/2")]).unwrap(), 1);
        assert_eq!(found(&e, "Simple", &ft("abc"), &members(&[1])), set(&["WS:1/1/1"]));
        assert_eq!(
            found(&e, "Simple", &ft("abc"), &AccessFilter::create().with_admin(true)),
            set(&["WS:1/1/1"])
        );
    }

    #[test]
    fn purge_hands_over_only_vacated_containers() {
        let e = engine();
        let (ty, rules) = simple();
        index(&e, "WS:1/1/1", &ty, json!({"prop1": "abc"}), &rules);
        index(&e, "WS:1/1/2", &ty, json!({"prop1": "abc"}), &rules);
        e.share(&[g("WS:1/1/1")], 11, false).unwrap();
        e.share(&[g("WS:1/1/2")], 11, false).unwrap();
        e.unshare(&[g("WS:1/1/2")], 11).unwrap();
        index(&e, "WS:1/1/3", &ty, json!({"prop1": "abc"}), &rules);
        assert!(found(&e, "Simple", &ft("abc"), &members(&[11])).is_empty());

        e.purge(&[g("WS:1/1/3")]).unwrap();
        assert_eq!(found(&e, "Simple", &ft("abc"), &members(&[1])), set(&["WS:1/1/2"]));
        // 11 不在被删版本腾出的 container 里
        assert!(found(&e, "Simple", &ft("abc"), &members(&[11])).is_empty());
    }

    #[test]
    fn same_identity_under_another_type_is_conflict() {
        let backend = Arc::new(FlakyBackend::new());
        let e = IndexEngine::new(backend.clone(), EngineConfig::default());
        let (ty, rules) = simple();
        index(&e, "WS:1/1/1", &ty, json!({"prop1": "abc"}), &rules);

        let other = request(&g("WS:1/1/1"), &SearchObjectType::new("Other", 1), json!({"prop1": "abc"}), false);
        let err = e.index_object(&other, &rules).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(!err.is_retriable());

        // 读不到已存记录时，由后端的单条拒绝给出同样的分类
        backend.blind_get.store(true, Ordering::Relaxed);
        let err = e.index_object(&other, &rules).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(!err.is_retriable());
        backend.blind_get.store(false, Ordering::Relaxed);

        assert_eq!(found(&e, "Simple", &ft("abc"), &members(&[1])), set(&["WS:1/1/1"]));
        assert!(found(&e, "Other", &ft("abc"), &members(&[1])).is_empty());
    }

    #[test]
    fn share_waits_for_concurrent_index_of_same_object() {
        let backend = Arc::new(FlakyBackend::new());
        let e = IndexEngine::new(backend.clone(), EngineConfig::default());
        let (ty, rules) = simple();
        index(&e, "WS:1/1/1", &ty, json!({"prop1": "abc"}), &rules);

        let (paused_tx, paused_rx) = std::sync::mpsc::channel();
        let (resume_tx, resume_rx) = std::sync::mpsc::channel::<()>();
        *backend.on_versions.lock() = Some(Box::new(move || {
            let _ = paused_tx.send(());
            let _ = resume_rx.recv_timeout(Duration::from_secs(5));
        }));

        let v2 = request(&g("WS:1/1/2"), &ty, json!({"prop1": "abc"}), false);
        std::thread::scope(|scope| {
            let indexer = scope.spawn(|| e.index_object(&v2, &rules));
            paused_rx
                .recv_timeout(Duration::from_secs(5))
                .expect("indexer reached the version read");
            let sharer = scope.spawn(|| e.share(&[g("WS:1/1/1")], 11, false));
            std::thread::sleep(Duration::from_millis(50));
            assert!(!sharer.is_finished());
            let _ = resume_tx.send(());
            indexer.join().unwrap().unwrap();
            sharer.join().unwrap().unwrap();
        });

        let stored = e.backend.get(&["WS:1/1/1".to_string()]).unwrap();
        let v1 = stored[0].access.as_ref().unwrap();
        assert_eq!(v1.shares, BTreeMap::from([(11, false)]));
        assert_eq!(v1.latest_in, BTreeSet::from([11]));
        assert_eq!(found(&e, "Simple", &ft("abc"), &members(&[11])), set(&["WS:1/1/1"]));
        assert_eq!(found(&e, "Simple", &ft("abc"), &members(&[1])), set(&["WS:1/1/2"]));
    }

    #[test]
    fn collapse_failure_is_reported_per_identity() {
        let backend = Arc::new(FlakyBackend::new());
        let e = IndexEngine::new(backend.clone(), EngineConfig::default());
        let (ty, rules) = simple();
        index(&e, "WS:1/1/1", &ty, json!({"prop1": "abc"}), &rules);
        index(&e, "WS:1/2/1", &ty, json!({"prop1": "abc"}), &rules);

        *backend.failing_logical.lock() = Some("WS:1/2".to_string());
        match e.share(&[g("WS:1/1/1"), g("WS:1/2/1")], 11, false) {
            Err(IndexError::PartialBatchFailure { succeeded, failed }) => {
                assert_eq!(succeeded, vec![g("WS:1/1/1")]);
                assert_eq!(failed.len(), 1);
                assert_eq!(failed[0].guid, g("WS:1/2/1"));
                assert!(failed[0].cause.is_retriable());
            }
            other => panic!("expected partial failure, got {:?}", other),
        }
        assert_eq!(found(&e, "Simple", &ft("abc"), &members(&[11])), set(&["WS:1/1/1"]));

        // 重试同一 share 会补上折叠
        *backend.failing_logical.lock() = None;
        let report = e.share(&[g("WS:1/2/1")], 11, false).unwrap();
        assert_eq!(report.unchanged, vec![g("WS:1/2/1")]);
        assert_eq!(
            found(&e, "Simple", &ft("abc"), &members(&[11])),
            set(&["WS:1/1/1", "WS:1/2/1"])
        );
    }

    #[test]
    fn mutation_failures_are_reported_per_identity() {
        let e = engine();
        let (ty, rules) = simple();
        index(&e, "WS:1/1/1", &ty, json!({"prop1": "abc"}), &rules);

        let single = e.share(&[g("WS:9/9/9")], 11, false).unwrap_err();
        assert_eq!(single.kind(), ErrorKind::NotFound);

        match e.publish(&[g("WS:1/1/1"), g("WS:9/9/9")]) {
            Err(IndexError::PartialBatchFailure { succeeded, failed }) => {
                assert_eq!(succeeded, vec![g("WS:1/1/1")]);
                assert_eq!(failed.len(), 1);
                assert_eq!(failed[0].guid, g("WS:9/9/9"));
                assert_eq!(failed[0].cause.kind(), ErrorKind::NotFound);
            }
            other => panic!("expected partial failure, got {:?}", other),
        }
        // 成功的那一半已生效
        assert_eq!(
            found(&e, "Simple", &ft("abc"), &AccessFilter::create().with_public(true)),
            set(&["WS:1/1/1"])
        );
    }

    #[test]
    fn batch_isolates_unknown_types_and_enforces_limit() {
        let rules = StaticTypeRules::new().with_type(
            SearchObjectType::new("Simple", 1),
            vec![IndexingRule::from_path("prop1").full_text()],
        );
        let e = IndexEngine::new(
            Arc::new(MemoryBackend::new()),
            EngineConfig {
                max_bulk_docs: 2,
                ..EngineConfig::default()
            },
        )
        .with_type_rules(Arc::new(rules));

        let ok = request(&g("WS:1/1/1"), &SearchObjectType::new("Simple", 1), json!({"prop1": "x"}), false);
        let unknown = request(&g("WS:1/2/1"), &SearchObjectType::new("Simple", 2), json!({}), false);
        let report = e.index_objects(&[ok.clone(), unknown.clone()]).unwrap();
        assert_eq!(report.indexed, vec![g("WS:1/1/1")]);
        assert_eq!(report.failed[0].cause.kind(), ErrorKind::UnknownType);
        assert!(!report.failed[0].cause.is_retriable());

        let err = e.index_objects(&[ok.clone(), unknown, ok]).unwrap_err();
        assert!(matches!(err, IndexError::BatchTooLarge { size: 3, limit: 2 }));
        assert_eq!(e.stats().index_failures, 1);
    }

    struct AssemblyLookup;

    impl ObjectLookupProvider for AssemblyLookup {
        fn resolve_refs(&self, caller_path: &[Guid], refs: &BTreeSet<Guid>) -> Result<BTreeSet<Guid>> {
            assert!(!caller_path.is_empty());
            Ok(refs.clone())
        }

        fn lookup_by_guid(&self, guids: &BTreeSet<Guid>) -> Result<BTreeMap<Guid, ObjectData>> {
            Ok(guids
                .iter()
                .map(|g| {
                    let obj = ObjectData {
                        guid: g.clone(),
                        parent_guid: None,
                        object_type: None,
                        source: None,
                        timestamp: None,
                        data: None,
                        parent_data: None,
                        key_props: Some(BTreeMap::from([(
                            "name".to_string(),
                            format!("assembly {}", g.object()),
                        )])),
                    };
                    (g.clone(), obj)
                })
                .collect())
        }
    }

    fn lookup_rules() -> Vec<IndexingRule> {
        vec![IndexingRule::from_path("assembly_ref")
            .key_name("assembly_name")
            .full_text()
            .lookup("assembly_ref", "name")]
    }

    #[test]
    fn lookup_keys_are_projected_from_referenced_objects() {
        let e = engine().with_lookup(Arc::new(AssemblyLookup));
        let ty = SearchObjectType::new("Genome", 1);
        index(&e, "WS:1/1/1", &ty, json!({"assembly_ref": "WS:1/9/1"}), &lookup_rules());

        let q = MatchFilter::create().with_full_text_in_key("assembly_name", "assembly 9");
        assert_eq!(found(&e, "Genome", &q, &members(&[1])), set(&["WS:1/1/1"]));

        let err = e
            .index_object(
                &request(&g("WS:1/2/1"), &ty, json!({"assembly_ref": "not-an-id"}), false),
                &lookup_rules(),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedIdentity);
    }

    #[test]
    fn lookup_without_provider_is_skipped() {
        let e = engine();
        let ty = SearchObjectType::new("Genome", 1);
        index(&e, "WS:1/1/1", &ty, json!({"assembly_ref": "WS:1/9/1"}), &lookup_rules());
        let objs = e.get_objects_by_ids(&[g("WS:1/1/1")], None).unwrap();
        assert!(objs[0].key_props.as_ref().unwrap().is_empty());
    }

    type Hook = Box<dyn FnOnce() + Send>;

    /// 可切换故障的后端包装
    struct FlakyBackend {
        inner: MemoryBackend,
        down: AtomicBool,
        empty_bulk: AtomicBool,
        /// realtime 读一律返回“未存储”
        blind_get: AtomicBool,
        /// 该逻辑对象的版本读取失败
        failing_logical: Mutex<Option<String>>,
        /// 下一次版本读取前执行一次
        on_versions: Mutex<Option<Hook>>,
    }

    impl FlakyBackend {
        fn new() -> Self {
            Self {
                inner: MemoryBackend::new(),
                down: AtomicBool::new(false),
                empty_bulk: AtomicBool::new(false),
                blind_get: AtomicBool::new(false),
                failing_logical: Mutex::new(None),
                on_versions: Mutex::new(None),
            }
        }
    }

    impl SearchBackend for FlakyBackend {
        fn ensure_collection(&self, name: &str, mapping: &Mapping) -> Result<()> {
            self.inner.ensure_collection(name, mapping)
        }

        fn collections(&self) -> Result<Vec<(String, Mapping)>> {
            self.inner.collections()
        }

        fn bulk_upsert(&self, collection: &str, docs: Vec<IndexedDocument>) -> Result<BulkResponse> {
            if self.down.load(Ordering::Relaxed) {
                return Err(IndexError::backend("connection refused"));
            }
            if self.empty_bulk.load(Ordering::Relaxed) {
                return Ok(BulkResponse::default());
            }
            self.inner.bulk_upsert(collection, docs)
        }

        fn update_access(
            &self,
            key: &str,
            mutate: &dyn Fn(&mut crate::core::AccessRecord) -> bool,
        ) -> Result<AccessUpdate> {
            self.inner.update_access(key, mutate)
        }

        fn versions_of(&self, logical: &str) -> Result<Vec<VersionRef>> {
            let hook = self.on_versions.lock().take();
            if let Some(hook) = hook {
                hook();
            }
            if self.failing_logical.lock().as_deref() == Some(logical) {
                return Err(IndexError::backend("read timed out"));
            }
            self.inner.versions_of(logical)
        }

        fn get(&self, keys: &[String]) -> Result<Vec<StoredPair>> {
            if self.blind_get.load(Ordering::Relaxed) {
                return Ok(keys
                    .iter()
                    .map(|key| StoredPair {
                        key: key.clone(),
                        collection: None,
                        content: None,
                        access: None,
                    })
                    .collect());
            }
            self.inner.get(keys)
        }

        fn remove(&self, keys: &[String]) -> Result<usize> {
            self.inner.remove(keys)
        }

        fn search(&self, request: &SearchRequest) -> Result<SearchResponse> {
            self.inner.search(request)
        }

        fn refresh(&self, collection: Option<&str>) -> Result<()> {
            self.inner.refresh(collection)
        }

        fn stats(&self) -> StorageReport {
            self.inner.stats()
        }
    }

    #[test]
    fn backend_faults_are_retriable() {
        let backend = Arc::new(FlakyBackend::new());
        let e = IndexEngine::new(backend.clone(), EngineConfig::default());
        let (ty, rules) = simple();
        let req = request(&g("WS:1/1/1"), &ty, json!({"prop1": "abc"}), false);

        backend.down.store(true, Ordering::Relaxed);
        let err = e.index_object(&req, &rules).unwrap_err();
        assert!(err.is_retriable());

        backend.down.store(false, Ordering::Relaxed);
        backend.empty_bulk.store(true, Ordering::Relaxed);
        let err = e.index_object(&req, &rules).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackendUnavailable);

        backend.empty_bulk.store(false, Ordering::Relaxed);
        assert_eq!(e.index_object(&req, &rules).unwrap(), g("WS:1/1/1"));
    }

    #[test]
    fn unknown_type_is_fatal() {
        let e = engine();
        let err = e
            .index_object(
                &request(&g("WS:1/1/1"), &SearchObjectType::new("Nope", 3), json!({}), false),
                &[],
            )
            .unwrap_err();
        assert!(matches!(
            err,
            IndexError::UnknownType { ref type_name, version: 3 } if type_name == "Nope"
        ));
    }

    /// 随机操作序列；容器号与版本号取小范围，制造足够多的版本与共享重叠
    #[derive(Clone, Debug)]
    enum Op {
        Index { id: (u64, u64, u32), public: bool },
        Share { id: (u64, u64, u32), to: u64, public: bool },
        Unshare { id: (u64, u64, u32), from: u64 },
        PublishExternally { id: (u64, u64, u32), to: u64 },
        DeleteAll { id: (u64, u64, u32) },
    }

    fn op_sequences(with_unshare: bool) -> impl Strategy<Value = Vec<Op>> {
        let id = (1u64..3, 1u64..3, 1u32..4);
        let container = 1u64..5;
        let base = prop_oneof![
            4 => (id.clone(), any::<bool>()).prop_map(|(id, public)| Op::Index { id, public }),
            3 => (id.clone(), container.clone(), any::<bool>())
                .prop_map(|(id, to, public)| Op::Share { id, to, public }),
            1 => (id.clone(), container.clone()).prop_map(|(id, to)| Op::PublishExternally { id, to }),
            1 => id.clone().prop_map(|id| Op::DeleteAll { id }),
        ]
        .boxed();
        let op = if with_unshare {
            prop_oneof![
                5 => base,
                2 => (id, container).prop_map(|(id, from)| Op::Unshare { id, from }),
            ]
            .boxed()
        } else {
            base
        };
        prop::collection::vec(op, 1..20)
    }

    /// 测试侧独立维护的账本，只记录原始输入
    #[derive(Clone, Debug, Default)]
    struct ModelRecord {
        shares: BTreeMap<u64, bool>,
        published: bool,
        external: BTreeSet<u64>,
        deleted: bool,
    }

    #[derive(Debug, Default)]
    struct Model {
        records: BTreeMap<Guid, ModelRecord>,
    }

    impl Model {
        fn members(g: &Guid, r: &ModelRecord) -> BTreeSet<u64> {
            std::iter::once(g.container())
                .chain(r.shares.keys().copied())
                .collect()
        }

        fn exposed(r: &ModelRecord) -> bool {
            r.published || r.shares.values().any(|p| *p) || !r.external.is_empty()
        }

        fn visible(g: &Guid, r: &ModelRecord, authz: &AccessFilter) -> bool {
            authz.admin
                || Self::members(g, r).iter().any(|c| authz.containers.contains(c))
                || (authz.public && Self::exposed(r))
        }

        fn newer(&self, g: &Guid) -> impl Iterator<Item = (&Guid, &ModelRecord)> + '_ {
            let g = g.clone();
            self.records
                .iter()
                .filter(move |(h, _)| h.same_logical_object(&g) && h.version() > g.version())
        }

        /// 没有 unshare 时，默认视图 = 每个调用方 container 内版本最高的成员，admin 与 public 路径看全局最大版本
        fn admitted_by_default_view(&self, g: &Guid, r: &ModelRecord, authz: &AccessFilter) -> bool {
            if r.deleted {
                return false;
            }
            let is_max = self.newer(g).next().is_none();
            if authz.admin {
                return is_max;
            }
            let members = Self::members(g, r);
            let newest_member = authz.containers.iter().any(|c| {
                members.contains(c)
                    && !self
                        .newer(g)
                        .any(|(h, hr)| Self::members(h, hr).contains(c))
            });
            newest_member || (authz.public && is_max && Self::exposed(r))
        }

        fn versions_of(&self, g: &Guid) -> Vec<Guid> {
            self.records
                .keys()
                .filter(|h| h.same_logical_object(g))
                .cloned()
                .collect()
        }
    }

    fn replay(ops: &[Op]) -> (IndexEngine, Model) {
        let e = engine();
        let (ty, rules) = simple();
        let mut model = Model::default();
        let guid = |(c, o, v): (u64, u64, u32)| Guid::new("WS", c, o, v).unwrap();
        for op in ops {
            match op {
                Op::Index { id, public } => {
                    let g = guid(*id);
                    e.index_object(&request(&g, &ty, json!({"prop1": "abc"}), *public), &rules)
                        .unwrap();
                    model.records.entry(g).or_default().published = *public;
                }
                Op::Share { id, to, public } => {
                    let g = guid(*id);
                    let res = e.share(&[g.clone()], *to, *public);
                    match model.records.get_mut(&g) {
                        Some(r) => {
                            res.unwrap();
                            r.shares.insert(*to, *public);
                        }
                        None => assert_eq!(res.unwrap_err().kind(), ErrorKind::NotFound),
                    }
                }
                Op::Unshare { id, from } => {
                    let g = guid(*id);
                    let res = e.unshare(&[g.clone()], *from);
                    match model.records.get_mut(&g) {
                        Some(r) => {
                            res.unwrap();
                            r.shares.remove(from);
                        }
                        None => assert_eq!(res.unwrap_err().kind(), ErrorKind::NotFound),
                    }
                }
                Op::PublishExternally { id, to } => {
                    let g = guid(*id);
                    let res = e.publish_externally(&[g.clone()], *to);
                    match model.records.get_mut(&g) {
                        Some(r) => {
                            res.unwrap();
                            r.external.insert(*to);
                        }
                        None => assert_eq!(res.unwrap_err().kind(), ErrorKind::NotFound),
                    }
                }
                Op::DeleteAll { id } => {
                    let g = guid(*id);
                    let versions = model.versions_of(&g);
                    let res = e.delete_all_versions(&g);
                    if versions.is_empty() {
                        assert_eq!(res.unwrap_err().kind(), ErrorKind::NotFound);
                    } else {
                        res.unwrap();
                        for v in versions {
                            if let Some(r) = model.records.get_mut(&v) {
                                r.deleted = true;
                            }
                        }
                    }
                }
            }
        }
        e.refresh(None).unwrap();
        (e, model)
    }

    fn searched(e: &IndexEngine, authz: &AccessFilter) -> BTreeSet<Guid> {
        e.search_ids("Simple", &ft("abc"), &[], authz)
            .unwrap()
            .into_iter()
            .collect()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn all_history_view_matches_membership_and_exposure(
            ops in op_sequences(true),
            containers in prop::collection::btree_set(1u64..5, 0..3),
            admin in any::<bool>(),
            public in any::<bool>(),
        ) {
            let (e, model) = replay(&ops);
            let authz = AccessFilter { admin, containers, public, all_history: true };
            let expected: BTreeSet<Guid> = model
                .records
                .iter()
                .filter(|(g, r)| Model::visible(g, r, &authz))
                .map(|(g, _)| g.clone())
                .collect();
            prop_assert_eq!(searched(&e, &authz), expected);
        }

        #[test]
        fn default_view_returns_newest_member_per_container(
            ops in op_sequences(false),
            containers in prop::collection::btree_set(1u64..5, 0..3),
            admin in any::<bool>(),
            public in any::<bool>(),
        ) {
            let (e, model) = replay(&ops);
            let authz = AccessFilter { admin, containers, public, all_history: false };
            let expected: BTreeSet<Guid> = model
                .records
                .iter()
                .filter(|(g, r)| model.admitted_by_default_view(g, r, &authz))
                .map(|(g, _)| g.clone())
                .collect();
            prop_assert_eq!(searched(&e, &authz), expected);
        }
    }
}
