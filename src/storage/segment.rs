use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;

use roaring::RoaringBitmap;
use serde_json::Value;

use crate::core::{AccessRecord, Guid, KeywordKind};
use crate::index::analyzer::{tokenize, value_text};
use crate::index::ContentDocument;
use crate::query::{AccessField, BoolQuery, Field, Query, Scalar};
use crate::storage::{Mapping, SortKey};

/// 数值 key：整数保留 i64 精度，跨变体按真实数值比较
///
/// -0.0 归一为 0.0；NaN 不会入索引，比较时排在最后。
#[derive(Copy, Clone, Debug)]
pub enum NumKey {
    Int(i64),
    Float(f64),
}

impl NumKey {
    fn float(v: f64) -> Option<Self> {
        v.is_finite()
            .then_some(NumKey::Float(if v == 0.0 { 0.0 } else { v }))
    }

    /// 字符串先按整数解析，再按浮点解析
    pub fn from_scalar(s: &Scalar) -> Option<Self> {
        match s {
            Scalar::Int(v) => Some(NumKey::Int(*v)),
            Scalar::Float(v) => Self::float(*v),
            Scalar::Str(s) => {
                let s = s.trim();
                match s.parse::<i64>() {
                    Ok(v) => Some(NumKey::Int(v)),
                    Err(_) => s.parse::<f64>().ok().and_then(Self::float),
                }
            }
            Scalar::Bool(_) => None,
        }
    }

    fn from_json(v: &Value) -> Option<Self> {
        Scalar::from_json(v).as_ref().and_then(Self::from_scalar)
    }
}

/// i64 与 f64 的精确比较（不经过 i64 → f64 的有损转换）
fn cmp_int_float(i: i64, f: f64) -> Ordering {
    if f.is_nan() {
        return Ordering::Less;
    }
    // 2^63
    if f >= 9_223_372_036_854_775_808.0 {
        return Ordering::Less;
    }
    if f < -9_223_372_036_854_775_808.0 {
        return Ordering::Greater;
    }
    let whole = f.trunc();
    match i.cmp(&(whole as i64)) {
        Ordering::Equal => 0.0f64.total_cmp(&(f - whole)),
        other => other,
    }
}

impl PartialEq for NumKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for NumKey {}

impl PartialOrd for NumKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NumKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (*self, *other) {
            (NumKey::Int(a), NumKey::Int(b)) => a.cmp(&b),
            (NumKey::Float(a), NumKey::Float(b)) => a.total_cmp(&b),
            (NumKey::Int(a), NumKey::Float(b)) => cmp_int_float(a, b),
            (NumKey::Float(a), NumKey::Int(b)) => cmp_int_float(b, a).reverse(),
        }
    }
}

/// 排序值；不同变体之间按变体顺序比较
#[derive(Clone, Debug, PartialEq)]
pub enum SortValue {
    Num(NumKey),
    Str(String),
    Id(Guid),
}

impl SortValue {
    fn rank(&self) -> u8 {
        match self {
            SortValue::Num(_) => 0,
            SortValue::Str(_) => 1,
            SortValue::Id(_) => 2,
        }
    }

    pub fn compare(&self, other: &Self) -> Ordering {
        match (self, other) {
            (SortValue::Num(a), SortValue::Num(b)) => a.cmp(b),
            (SortValue::Str(a), SortValue::Str(b)) => a.cmp(b),
            (SortValue::Id(a), SortValue::Id(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }

    fn from_json(v: &Value) -> Option<Self> {
        match v {
            Value::Number(_) => NumKey::from_json(v).map(SortValue::Num),
            other => value_text(other).map(SortValue::Str),
        }
    }
}

/// 命中 + 预取的排序值
#[derive(Clone, Debug)]
pub struct SortedHit {
    pub collection: String,
    pub key: String,
    pub values: Vec<Option<SortValue>>,
}

/// 多键排序；缺值永远排在最后，最终按 key 升序打破平局
pub fn compare_hits(a: &SortedHit, b: &SortedHit, sort: &[SortKey]) -> Ordering {
    for (i, sk) in sort.iter().enumerate() {
        let ord = match (a.values.get(i).and_then(Option::as_ref), b.values.get(i).and_then(Option::as_ref)) {
            (Some(x), Some(y)) => {
                let o = x.compare(y);
                if sk.ascending {
                    o
                } else {
                    o.reverse()
                }
            }
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.key.cmp(&b.key)
}

/// 单个 collection 的只读可搜索快照（refresh 时整体重建后原子替换）
#[derive(Debug, Default)]
pub struct Segment {
    name: String,
    keys: Vec<String>,
    docs: Vec<Arc<ContentDocument>>,
    exact: HashMap<Field, BTreeMap<String, RoaringBitmap>>,
    text: HashMap<Field, HashMap<String, RoaringBitmap>>,
    numeric: HashMap<Field, BTreeMap<NumKey, RoaringBitmap>>,
    present: HashMap<Field, RoaringBitmap>,
    all: RoaringBitmap,
}

impl Segment {
    pub fn empty(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn build(
        name: &str,
        mapping: &Mapping,
        entries: Vec<(String, Arc<ContentDocument>, Option<AccessRecord>)>,
    ) -> Self {
        let mut seg = Segment::empty(name);
        for (key, doc, access) in entries {
            let Ok(id) = u32::try_from(seg.docs.len()) else {
                tracing::warn!("Segment {} exceeded u32 doc ids, truncating", name);
                break;
            };
            seg.index_content(id, mapping, &doc);
            if let Some(access) = access.as_ref() {
                seg.index_access(id, access);
            }
            seg.all.insert(id);
            seg.keys.push(key);
            seg.docs.push(doc);
        }
        seg
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    fn add_exact(&mut self, id: u32, field: Field, term: String) {
        self.present.entry(field.clone()).or_default().insert(id);
        self.exact
            .entry(field)
            .or_default()
            .entry(term)
            .or_default()
            .insert(id);
    }

    fn add_tokens(&mut self, id: u32, field: Field, text: &str) {
        let tokens = tokenize(text);
        if tokens.is_empty() {
            return;
        }
        self.present.entry(field.clone()).or_default().insert(id);
        let postings = self.text.entry(field).or_default();
        for tok in tokens {
            postings.entry(tok).or_default().insert(id);
        }
    }

    fn add_number(&mut self, id: u32, field: Field, v: NumKey) {
        self.numeric
            .entry(field)
            .or_default()
            .entry(v)
            .or_default()
            .insert(id);
    }

    fn index_content(&mut self, id: u32, mapping: &Mapping, doc: &ContentDocument) {
        self.add_exact(id, Field::Guid, doc.guid.to_string());
        self.add_exact(id, Field::Logical, doc.logical.clone());
        self.add_exact(id, Field::Creator, doc.source.creator.clone());
        self.add_exact(id, Field::SubObject, doc.is_sub_object().to_string());
        self.add_tokens(id, Field::ObjectName, &doc.source.object_name);
        self.present.entry(Field::Timestamp).or_default().insert(id);
        self.add_number(id, Field::Timestamp, NumKey::Int(doc.timestamp));

        for (key, values) in &doc.keys {
            let field = Field::key(key);
            let kind = mapping.kind(key).unwrap_or_default();
            for v in values {
                match kind {
                    KeywordKind::FullText => {
                        if let Some(text) = value_text(v) {
                            self.add_tokens(id, field.clone(), &text);
                            self.add_tokens(id, Field::AllText, &text);
                        }
                    }
                    KeywordKind::Integer | KeywordKind::Double => {
                        let Some(scalar) = Scalar::from_json(v) else {
                            continue;
                        };
                        if let Some(n) = NumKey::from_scalar(&scalar) {
                            self.add_number(id, field.clone(), n);
                        }
                        self.add_exact(id, field.clone(), scalar.term());
                    }
                    KeywordKind::Keyword | KeywordKind::Boolean => {
                        if let Some(term) = value_text(v) {
                            self.add_exact(id, field.clone(), term);
                        }
                    }
                }
            }
        }
    }

    fn index_access(&mut self, id: u32, access: &AccessRecord) {
        let members: Vec<u64> = access.members().collect();
        for c in members {
            self.add_exact(id, Field::Access(AccessField::Members), c.to_string());
        }
        let public: Vec<u64> = access.public_shares().collect();
        for c in public {
            self.add_exact(id, Field::Access(AccessField::PublicShares), c.to_string());
        }
        for c in &access.latest_in {
            self.add_exact(id, Field::Access(AccessField::LatestIn), c.to_string());
        }
        for c in &access.external_public {
            self.add_exact(id, Field::Access(AccessField::ExternalPublic), c.to_string());
        }
        self.add_exact(
            id,
            Field::Access(AccessField::SelfPublished),
            access.self_published.to_string(),
        );
        self.add_exact(
            id,
            Field::Access(AccessField::Deleted),
            access.deleted.to_string(),
        );
        self.add_exact(
            id,
            Field::Access(AccessField::Latest),
            access.latest.to_string(),
        );
    }

    pub fn eval(&self, query: &Query) -> RoaringBitmap {
        match query {
            Query::MatchAll => self.all.clone(),
            Query::MatchNone => RoaringBitmap::new(),
            Query::Term { field, value } => self.term(field, value),
            Query::Terms { field, values } => {
                let mut out = RoaringBitmap::new();
                for v in values {
                    out |= self.term(field, v);
                }
                out
            }
            Query::Range { field, min, max } => self.range(field, min.as_ref(), max.as_ref()),
            Query::Text { field, tokens } => self.text_match(field, tokens),
            Query::Exists { field } => self.present.get(field).cloned().unwrap_or_default(),
            Query::Bool(b) => self.eval_bool(b),
        }
    }

    fn eval_bool(&self, b: &BoolQuery) -> RoaringBitmap {
        let mut acc = self.all.clone();
        for q in &b.must {
            if acc.is_empty() {
                return acc;
            }
            acc &= self.eval(q);
        }
        if !b.should.is_empty() {
            let mut any = RoaringBitmap::new();
            for q in &b.should {
                any |= self.eval(q);
            }
            acc &= any;
        }
        for q in &b.must_not {
            if acc.is_empty() {
                break;
            }
            acc -= self.eval(q);
        }
        acc
    }

    fn term(&self, field: &Field, value: &Scalar) -> RoaringBitmap {
        if value.is_numeric() {
            if let (Some(n), Some(nums)) = (NumKey::from_scalar(value), self.numeric.get(field)) {
                return nums.get(&n).cloned().unwrap_or_default();
            }
        }
        self.exact
            .get(field)
            .and_then(|terms| terms.get(&value.term()))
            .cloned()
            .unwrap_or_default()
    }

    fn range(&self, field: &Field, min: Option<&Scalar>, max: Option<&Scalar>) -> RoaringBitmap {
        let numeric_bounds = min.map_or(true, Scalar::is_numeric) && max.map_or(true, Scalar::is_numeric);
        let mut out = RoaringBitmap::new();
        if numeric_bounds {
            if let Some(nums) = self.numeric.get(field) {
                let lo = match min.and_then(NumKey::from_scalar) {
                    Some(v) => Bound::Included(v),
                    None if min.is_some() => return out,
                    None => Bound::Unbounded,
                };
                let hi = match max.and_then(NumKey::from_scalar) {
                    Some(v) => Bound::Included(v),
                    None if max.is_some() => return out,
                    None => Bound::Unbounded,
                };
                if let (Bound::Included(a), Bound::Included(b)) = (&lo, &hi) {
                    if a > b {
                        return out;
                    }
                }
                for bits in nums.range((lo, hi)).map(|(_, b)| b) {
                    out |= bits;
                }
                return out;
            }
        }

        let Some(terms) = self.exact.get(field) else {
            return out;
        };
        let lo = min.map_or(Bound::Unbounded, |v| Bound::Included(v.term()));
        let hi = max.map_or(Bound::Unbounded, |v| Bound::Included(v.term()));
        if let (Bound::Included(a), Bound::Included(b)) = (&lo, &hi) {
            if a > b {
                return out;
            }
        }
        for bits in terms.range::<String, _>((lo, hi)).map(|(_, b)| b) {
            out |= bits;
        }
        out
    }

    fn text_match(&self, field: &Field, tokens: &[String]) -> RoaringBitmap {
        if tokens.is_empty() {
            return self.all.clone();
        }
        let Some(postings) = self.text.get(field) else {
            return RoaringBitmap::new();
        };
        let mut acc: Option<RoaringBitmap> = None;
        for tok in tokens {
            let Some(bits) = postings.get(tok) else {
                return RoaringBitmap::new();
            };
            acc = Some(match acc {
                None => bits.clone(),
                Some(mut a) => {
                    a &= bits;
                    a
                }
            });
        }
        acc.unwrap_or_default()
    }

    fn sort_value(&self, doc: &ContentDocument, sk: &SortKey) -> Option<SortValue> {
        match &sk.field {
            Field::Guid => Some(SortValue::Id(doc.guid.clone())),
            Field::Timestamp => Some(SortValue::Num(NumKey::Int(doc.timestamp))),
            Field::ObjectName => Some(SortValue::Str(doc.source.object_name.clone())),
            Field::Creator => Some(SortValue::Str(doc.source.creator.clone())),
            Field::Logical => Some(SortValue::Str(doc.logical.clone())),
            // 多值 key：升序取最小，降序取最大
            Field::Key(k) => {
                let candidates = doc.keys.get(k)?.iter().filter_map(SortValue::from_json);
                if sk.ascending {
                    candidates.min_by(|a, b| a.compare(b))
                } else {
                    candidates.max_by(|a, b| a.compare(b))
                }
            }
            _ => None,
        }
    }

    pub fn collect(&self, bits: &RoaringBitmap, sort: &[SortKey]) -> Vec<SortedHit> {
        bits.iter()
            .filter_map(|id| {
                let idx = id as usize;
                let doc = self.docs.get(idx)?;
                Some(SortedHit {
                    collection: self.name.clone(),
                    key: self.keys.get(idx)?.clone(),
                    values: sort.iter().map(|sk| self.sort_value(doc, sk)).collect(),
                })
            })
            .collect()
    }

    pub fn distinct_terms(&self) -> usize {
        self.exact.values().map(BTreeMap::len).sum::<usize>()
            + self.text.values().map(HashMap::len).sum::<usize>()
    }

    pub fn postings(&self) -> u64 {
        self.exact
            .values()
            .flat_map(|m| m.values())
            .chain(self.text.values().flat_map(|m| m.values()))
            .map(RoaringBitmap::len)
            .sum()
    }

    pub fn postings_bytes(&self) -> u64 {
        self.exact
            .values()
            .flat_map(|m| m.values())
            .chain(self.text.values().flat_map(|m| m.values()))
            .chain(self.numeric.values().flat_map(|m| m.values()))
            .map(|b| b.serialized_size() as u64)
            .sum()
    }
}
