use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 可搜索类型 + 类型版本；每个组合对应后端一个 collection
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SearchObjectType {
    pub name: String,
    pub version: u32,
}

impl SearchObjectType {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

impl fmt::Display for SearchObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.name, self.version)
    }
}

/// 抽取 key 的值类型：全文 vs 精确/可范围比较
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum KeywordKind {
    FullText,
    #[default]
    Keyword,
    Integer,
    Double,
    Boolean,
}

impl KeywordKind {
    pub fn is_numeric(self) -> bool {
        matches!(self, KeywordKind::Integer | KeywordKind::Double)
    }
}

/// 跨对象投影：`ref_key` 的值是被引用对象的 identity，取其 `target_key` 的值
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyLookup {
    pub ref_key: String,
    pub target_key: String,
}

/// 单条索引规则（外部提供，加载后不可变）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexingRule {
    pub path: String,
    pub key_name: String,
    #[serde(default)]
    pub kind: KeywordKind,
    #[serde(default)]
    pub from_parent: bool,
    #[serde(default)]
    pub lookup: Option<KeyLookup>,
}

impl IndexingRule {
    /// key 名默认取 path 的末段
    pub fn from_path(path: &str) -> Self {
        let key_name = path
            .rsplit('/')
            .find(|s| !s.is_empty())
            .unwrap_or(path)
            .to_string();
        Self {
            path: path.to_string(),
            key_name,
            kind: KeywordKind::Keyword,
            from_parent: false,
            lookup: None,
        }
    }

    pub fn full_text(mut self) -> Self {
        self.kind = KeywordKind::FullText;
        self
    }

    pub fn kind(mut self, kind: KeywordKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn key_name(mut self, name: &str) -> Self {
        self.key_name = name.to_string();
        self
    }

    pub fn from_parent(mut self) -> Self {
        self.from_parent = true;
        self
    }

    pub fn lookup(mut self, ref_key: &str, target_key: &str) -> Self {
        self.lookup = Some(KeyLookup {
            ref_key: ref_key.to_string(),
            target_key: target_key.to_string(),
        });
        self
    }
}

/// 抽取流水线产出的一条记录：key → 有序值集合（可多值）+ 原始 payload
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedRecord {
    #[serde(default)]
    pub keywords: BTreeMap<String, Vec<Value>>,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub parent_data: Option<Value>,
}

impl ParsedRecord {
    pub fn new(data: Value) -> Self {
        Self {
            keywords: BTreeMap::new(),
            data,
            parent_data: None,
        }
    }

    /// 追加一个值；同一 key 内按插入顺序去重
    pub fn with_key(mut self, key: &str, value: impl Into<Value>) -> Self {
        let value = value.into();
        let values = self.keywords.entry(key.to_string()).or_default();
        if !values.contains(&value) {
            values.push(value);
        }
        self
    }

    pub fn with_parent_data(mut self, parent: Value) -> Self {
        self.parent_data = Some(parent);
        self
    }
}

/// 来源信息（provenance）
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceData {
    pub object_name: String,
    pub creator: String,
    #[serde(default)]
    pub copier: Option<String>,
    #[serde(default)]
    pub module: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub commit_hash: Option<String>,
    #[serde(default)]
    pub module_version: Option<String>,
    #[serde(default)]
    pub md5: Option<String>,
}

impl SourceData {
    pub fn new(object_name: &str, creator: &str) -> Self {
        Self {
            object_name: object_name.to_string(),
            creator: creator.to_string(),
            ..Self::default()
        }
    }
}
