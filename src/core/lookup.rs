use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::core::{Guid, IndexingRule, SearchObjectType};
use crate::error::Result;
use crate::index::ObjectData;

/// 抽取流水线注入的跨对象解析能力
///
/// 仅在 index 时、规则声明了 lookup key 的情况下被调用；查询期从不回调。
pub trait ObjectLookupProvider: Send + Sync {
    /// 确保被引用对象已被 index，返回规范化后的引用（可能补全版本）
    fn resolve_refs(&self, caller_path: &[Guid], refs: &BTreeSet<Guid>) -> Result<BTreeSet<Guid>>;

    fn lookup_by_guid(&self, guids: &BTreeSet<Guid>) -> Result<BTreeMap<Guid, ObjectData>>;
}

/// 类型规则来源；返回 None 表示该 type/version 未注册
pub trait TypeRuleProvider: Send + Sync {
    fn indexing_rules(&self, object_type: &SearchObjectType) -> Option<Arc<[IndexingRule]>>;
}

/// 进程内固定的规则表
#[derive(Clone, Debug, Default)]
pub struct StaticTypeRules {
    rules: HashMap<SearchObjectType, Arc<[IndexingRule]>>,
}

impl StaticTypeRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_type(mut self, object_type: SearchObjectType, rules: Vec<IndexingRule>) -> Self {
        self.rules.insert(object_type, rules.into());
        self
    }

    pub fn types(&self) -> impl Iterator<Item = &SearchObjectType> {
        self.rules.keys()
    }
}

impl TypeRuleProvider for StaticTypeRules {
    fn indexing_rules(&self, object_type: &SearchObjectType) -> Option<Arc<[IndexingRule]>> {
        self.rules.get(object_type).cloned()
    }
}
