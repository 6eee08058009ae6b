use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::Guid;
use crate::index::ObjectData;
use crate::query::ast::Scalar;

/// 单个 key 上的约束：精确值，或闭区间 `[min, max]`
#[derive(Clone, Debug, PartialEq)]
pub enum MatchValue {
    Value(Scalar),
    Range {
        min: Option<Scalar>,
        max: Option<Scalar>,
    },
}

impl MatchValue {
    pub fn value(v: impl Into<Scalar>) -> Self {
        MatchValue::Value(v.into())
    }

    pub fn range(min: impl Into<Scalar>, max: impl Into<Scalar>) -> Self {
        MatchValue::Range {
            min: Some(min.into()),
            max: Some(max.into()),
        }
    }

    pub fn at_least(min: impl Into<Scalar>) -> Self {
        MatchValue::Range {
            min: Some(min.into()),
            max: None,
        }
    }

    pub fn at_most(max: impl Into<Scalar>) -> Self {
        MatchValue::Range {
            min: None,
            max: Some(max.into()),
        }
    }
}

/// 内容过滤条件；各子句之间为合取
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MatchFilter {
    pub full_text_in_all: Option<String>,
    pub full_text_in_keys: BTreeMap<String, String>,
    pub object_name: Option<String>,
    pub lookup_in_keys: BTreeMap<String, MatchValue>,
    /// 毫秒时间戳闭区间
    pub timestamp: Option<(Option<i64>, Option<i64>)>,
    pub exclude_sub_objects: bool,
}

impl MatchFilter {
    pub fn create() -> Self {
        Self::default()
    }

    pub fn with_full_text_in_all(mut self, text: &str) -> Self {
        self.full_text_in_all = Some(text.to_string());
        self
    }

    pub fn with_full_text_in_key(mut self, key: &str, text: &str) -> Self {
        self.full_text_in_keys
            .insert(key.to_string(), text.to_string());
        self
    }

    pub fn with_object_name(mut self, text: &str) -> Self {
        self.object_name = Some(text.to_string());
        self
    }

    /// 同一 key 只保留一个约束（后写覆盖）
    pub fn with_lookup_in_key(mut self, key: &str, value: MatchValue) -> Self {
        self.lookup_in_keys.insert(key.to_string(), value);
        self
    }

    pub fn with_timestamp(mut self, min: Option<i64>, max: Option<i64>) -> Self {
        self.timestamp = Some((min, max));
        self
    }

    pub fn with_exclude_sub_objects(mut self, exclude: bool) -> Self {
        self.exclude_sub_objects = exclude;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    Key(String),
    Timestamp,
    ObjectName,
    Guid,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortingRule {
    pub field: SortField,
    pub ascending: bool,
}

impl SortingRule {
    pub fn by_key(key: &str, ascending: bool) -> Self {
        Self {
            field: SortField::Key(key.to_string()),
            ascending,
        }
    }

    pub fn by(field: SortField, ascending: bool) -> Self {
        Self { field, ascending }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub start: usize,
    pub count: usize,
}

impl Pagination {
    pub fn new(start: usize, count: usize) -> Self {
        Self { start, count }
    }
}

/// 结果水合开关；默认全部包含
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostProcessing {
    pub object_info: bool,
    pub object_data: bool,
    pub object_keys: bool,
}

impl Default for PostProcessing {
    fn default() -> Self {
        Self {
            object_info: true,
            object_data: true,
            object_keys: true,
        }
    }
}

impl PostProcessing {
    pub fn ids_only() -> Self {
        Self {
            object_info: false,
            object_data: false,
            object_keys: false,
        }
    }

    pub fn hydrates(&self) -> bool {
        self.object_info || self.object_data || self.object_keys
    }
}

/// 一页搜索结果
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FoundHits {
    pub pagination: Pagination,
    pub sorting: Vec<SortingRule>,
    pub total: u64,
    pub guids: Vec<Guid>,
    pub objects: Option<Vec<ObjectData>>,
}
