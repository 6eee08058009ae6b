use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{
    AccessRecord, Guid, IndexingRule, KeywordKind, ParsedRecord, SearchObjectType, SourceData,
};
use crate::query::PostProcessing;

/// 持久化的可搜索投影；同一 identity 再次 index 会整体覆盖
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContentDocument {
    pub guid: Guid,
    pub logical: String,
    pub object_type: SearchObjectType,
    pub source: SourceData,
    /// 毫秒时间戳
    pub timestamp: i64,
    pub data: Value,
    pub parent_data: Option<Value>,
    pub keys: BTreeMap<String, Vec<Value>>,
}

impl ContentDocument {
    pub fn is_sub_object(&self) -> bool {
        self.guid.is_sub_object()
    }

    /// 多值 key 以 ", " 连接
    pub fn key_props(&self) -> BTreeMap<String, String> {
        self.keys
            .iter()
            .map(|(k, vs)| {
                let rendered: Vec<String> = vs
                    .iter()
                    .filter_map(crate::index::analyzer::value_text)
                    .collect();
                (k.clone(), rendered.join(", "))
            })
            .collect()
    }
}

/// 按规则声明的 kind 规整值：数字字符串 → 数字，"true"/"false" → 布尔
fn coerce(kind: KeywordKind, v: &Value) -> Value {
    match (kind, v) {
        (KeywordKind::Integer, Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| v.clone()),
        (KeywordKind::Double, Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| v.clone()),
        (KeywordKind::Boolean, Value::String(s)) => match s.trim() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => v.clone(),
        },
        (KeywordKind::FullText | KeywordKind::Keyword, Value::Number(_) | Value::Bool(_)) => {
            Value::String(crate::index::analyzer::value_text(v).unwrap_or_default())
        }
        _ => v.clone(),
    }
}

/// `a/b/c` 路径取值；途经数组时逐元素展开
pub(crate) fn values_at<'a>(v: &'a Value, path: &str, out: &mut Vec<&'a Value>) {
    let segs: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    walk(v, &segs, out);
}

fn walk<'a>(v: &'a Value, segs: &[&str], out: &mut Vec<&'a Value>) {
    match (v, segs.split_first()) {
        (Value::Array(items), _) => {
            for item in items {
                walk(item, segs, out);
            }
        }
        (_, None) => out.push(v),
        (Value::Object(map), Some((head, rest))) => {
            if let Some(child) = map.get(*head) {
                walk(child, rest, out);
            }
        }
        _ => {}
    }
}

/// 抽取记录 → (内容文档, 访问记录)；确定性，不做任何外部调用
///
/// 只保留规则声明过的 key；未声明的抽取结果直接丢弃。
/// 记录里没有预抽取值的 key 按规则 path 从 data（`from_parent` 时为 parent_data）取值。
pub fn build(
    record: &ParsedRecord,
    object_type: &SearchObjectType,
    guid: &Guid,
    source: &SourceData,
    timestamp: i64,
    is_public: bool,
    rules: &[IndexingRule],
) -> (ContentDocument, AccessRecord) {
    let mut keys: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    for rule in rules {
        let extracted: Vec<Value>;
        let values: &[Value] = match record.keywords.get(&rule.key_name) {
            Some(v) => v,
            // lookup key 的值只来自投影，不按 path 取
            None if rule.lookup.is_some() => continue,
            None => {
                let root = if rule.from_parent {
                    record.parent_data.as_ref()
                } else {
                    Some(&record.data)
                };
                let mut found = Vec::new();
                if let Some(root) = root {
                    values_at(root, &rule.path, &mut found);
                }
                extracted = found.into_iter().cloned().collect();
                &extracted
            }
        };
        let slot = keys.entry(rule.key_name.clone()).or_default();
        for v in values {
            if v.is_null() {
                continue;
            }
            let v = coerce(rule.kind, v);
            if !slot.contains(&v) {
                slot.push(v);
            }
        }
        if slot.is_empty() {
            keys.remove(&rule.key_name);
        }
    }

    let content = ContentDocument {
        guid: guid.clone(),
        logical: guid.logical_key(),
        object_type: object_type.clone(),
        source: source.clone(),
        timestamp,
        data: record.data.clone(),
        parent_data: record.parent_data.clone(),
        keys,
    };
    let access = AccessRecord::new(guid, is_public);
    (content, access)
}

/// 水合后的对象；未请求的部分为 None
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObjectData {
    pub guid: Guid,
    pub parent_guid: Option<Guid>,
    pub object_type: Option<SearchObjectType>,
    pub source: Option<SourceData>,
    pub timestamp: Option<i64>,
    pub data: Option<Value>,
    pub parent_data: Option<Value>,
    pub key_props: Option<BTreeMap<String, String>>,
}

impl ObjectData {
    pub fn hydrate(doc: &ContentDocument, pp: &PostProcessing) -> Self {
        Self {
            guid: doc.guid.clone(),
            parent_guid: doc.is_sub_object().then(|| doc.guid.parent()),
            object_type: pp.object_info.then(|| doc.object_type.clone()),
            source: pp.object_info.then(|| doc.source.clone()),
            timestamp: pp.object_info.then_some(doc.timestamp),
            data: pp.object_data.then(|| doc.data.clone()),
            parent_data: if pp.object_data {
                doc.parent_data.clone()
            } else {
                None
            },
            key_props: pp.object_keys.then(|| doc.key_props()),
        }
    }
}
