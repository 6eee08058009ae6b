use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 访问文档上的可查询字段
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AccessField {
    /// home ∪ 共享 container
    Members,
    PublicShares,
    SelfPublished,
    ExternalPublic,
    Deleted,
    Latest,
    /// 该版本为最新版本的 container
    LatestIn,
}

/// 后端字段命名空间：抽取 key、系统字段、访问字段
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Field {
    Key(String),
    /// 所有全文 key 的虚拟合并字段
    AllText,
    ObjectName,
    Timestamp,
    Creator,
    SubObject,
    Guid,
    Logical,
    Access(AccessField),
}

impl Field {
    pub fn key(name: &str) -> Self {
        Field::Key(name.to_string())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Scalar {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
}

impl Scalar {
    /// 精确匹配使用的规范化 term
    pub fn term(&self) -> String {
        match self {
            Scalar::Int(v) => v.to_string(),
            Scalar::Float(v) => v.to_string(),
            Scalar::Str(s) => s.clone(),
            Scalar::Bool(b) => b.to_string(),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        let v = match self {
            Scalar::Int(v) => *v as f64,
            Scalar::Float(v) => *v,
            Scalar::Str(s) => s.trim().parse::<f64>().ok()?,
            Scalar::Bool(_) => return None,
        };
        v.is_finite().then_some(v)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Scalar::Bool(b) => Some(*b),
            Scalar::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Scalar::Int(_) | Scalar::Float(_))
    }

    /// JSON 标量 → Scalar；数组/对象不是可索引值
    pub fn from_json(v: &Value) -> Option<Self> {
        match v {
            Value::Bool(b) => Some(Scalar::Bool(*b)),
            Value::Number(n) => n
                .as_i64()
                .map(Scalar::Int)
                .or_else(|| n.as_f64().map(Scalar::Float)),
            Value::String(s) => Some(Scalar::Str(s.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.term())
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Scalar::Int(v)
    }
}

impl From<i32> for Scalar {
    fn from(v: i32) -> Self {
        Scalar::Int(v as i64)
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Scalar::Float(v)
    }
}

impl From<bool> for Scalar {
    fn from(v: bool) -> Self {
        Scalar::Bool(v)
    }
}

impl From<&str> for Scalar {
    fn from(v: &str) -> Self {
        Scalar::Str(v.to_string())
    }
}

impl From<String> for Scalar {
    fn from(v: String) -> Self {
        Scalar::Str(v)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct BoolQuery {
    pub must: Vec<Query>,
    /// 非空时至少命中一个
    pub should: Vec<Query>,
    pub must_not: Vec<Query>,
}

/// 后端无关的复合查询
#[derive(Clone, Debug, PartialEq)]
pub enum Query {
    MatchAll,
    MatchNone,
    Term { field: Field, value: Scalar },
    Terms { field: Field, values: Vec<Scalar> },
    /// 闭区间，任一端可缺省
    Range {
        field: Field,
        min: Option<Scalar>,
        max: Option<Scalar>,
    },
    /// 已分词的 token，全部出现才算命中
    Text { field: Field, tokens: Vec<String> },
    Exists { field: Field },
    Bool(BoolQuery),
}

impl Query {
    pub fn and(must: Vec<Query>) -> Self {
        Query::Bool(BoolQuery {
            must,
            ..BoolQuery::default()
        })
    }

    pub fn or(should: Vec<Query>) -> Self {
        if should.is_empty() {
            return Query::MatchNone;
        }
        Query::Bool(BoolQuery {
            should,
            ..BoolQuery::default()
        })
    }

    pub fn term(field: Field, value: impl Into<Scalar>) -> Self {
        Query::Term {
            field,
            value: value.into(),
        }
    }

    /// 结构上必然为空（用于短路，不做完整化简）
    pub fn is_match_none(&self) -> bool {
        match self {
            Query::MatchNone => true,
            Query::Bool(b) => b.must.iter().any(Query::is_match_none),
            _ => false,
        }
    }
}
