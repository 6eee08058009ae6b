use crate::core::{AccessFilter, Guid, KeywordKind};
use crate::index::analyzer::tokenize;
use crate::query::ast::{AccessField, BoolQuery, Field, Query, Scalar};
use crate::query::filter::{MatchFilter, MatchValue, SortField, SortingRule};
use crate::storage::{Mapping, SortKey};

/// 内容过滤 + 授权 → 针对单个 collection 的复合查询
///
/// 可见性与版本折叠作为合取子句编进同一个查询，分页与计数因此在授权之后计算。
pub fn compile(filter: &MatchFilter, authz: &AccessFilter, mapping: &Mapping) -> Query {
    let mut must = compile_content(filter, mapping);
    let access = compile_access(authz);
    must.extend(access.must);
    finish(BoolQuery {
        must,
        should: Vec::new(),
        must_not: access.must_not,
    })
}

/// 按 identity 精确取回，同样受授权约束
pub fn compile_ids(ids: &[Guid], authz: &AccessFilter) -> Query {
    if ids.is_empty() {
        return Query::MatchNone;
    }
    let access = compile_access(authz);
    let mut must = vec![Query::Terms {
        field: Field::Guid,
        values: ids.iter().map(|g| Scalar::Str(g.to_string())).collect(),
    }];
    must.extend(access.must);
    finish(BoolQuery {
        must,
        should: Vec::new(),
        must_not: access.must_not,
    })
}

fn finish(b: BoolQuery) -> Query {
    let q = Query::Bool(b);
    if q.is_match_none() {
        Query::MatchNone
    } else {
        q
    }
}

fn container_terms(field: AccessField, authz: &AccessFilter) -> Option<Query> {
    (!authz.containers.is_empty()).then(|| Query::Terms {
        field: Field::Access(field),
        values: authz
            .containers
            .iter()
            .map(|c| Scalar::Str(c.to_string()))
            .collect(),
    })
}

fn public_exposure() -> Query {
    Query::or(vec![
        Query::term(Field::Access(AccessField::SelfPublished), true),
        Query::Exists {
            field: Field::Access(AccessField::PublicShares),
        },
        Query::Exists {
            field: Field::Access(AccessField::ExternalPublic),
        },
    ])
}

/// 授权 + 版本折叠子句（与 `AccessRecord::admits` 一一对应）
pub fn compile_access(authz: &AccessFilter) -> BoolQuery {
    let mut b = BoolQuery::default();
    let latest = || Query::term(Field::Access(AccessField::Latest), true);

    if authz.all_history {
        if !authz.admin {
            let mut should: Vec<Query> = container_terms(AccessField::Members, authz)
                .into_iter()
                .collect();
            if authz.public {
                should.push(public_exposure());
            }
            b.must.push(Query::or(should));
        }
        return b;
    }

    b.must_not
        .push(Query::term(Field::Access(AccessField::Deleted), true));
    if authz.admin {
        b.must.push(latest());
        return b;
    }
    let mut should: Vec<Query> = container_terms(AccessField::LatestIn, authz)
        .into_iter()
        .collect();
    if authz.public {
        should.push(Query::and(vec![latest(), public_exposure()]));
    }
    b.must.push(Query::or(should));
    b
}

fn text(field: Field, s: &str) -> Option<Query> {
    let tokens = tokenize(s);
    (!tokens.is_empty()).then_some(Query::Text { field, tokens })
}

/// 整数保持 i64，不经过 f64，避免 2^53 以上的值被合并
fn numeric(kind: KeywordKind, v: &Scalar) -> Option<Scalar> {
    match v {
        Scalar::Int(i) => return Some(Scalar::Int(*i)),
        Scalar::Str(s) => {
            if let Ok(i) = s.trim().parse::<i64>() {
                return Some(Scalar::Int(i));
            }
        }
        Scalar::Float(_) | Scalar::Bool(_) => {}
    }
    let n = v.as_f64()?;
    Some(if kind == KeywordKind::Integer && n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Scalar::Int(n as i64)
    } else {
        Scalar::Float(n)
    })
}

fn compile_lookup(key: &str, value: &MatchValue, mapping: &Mapping) -> Query {
    let Some(kind) = mapping.kind(key) else {
        return Query::MatchNone;
    };
    let field = Field::key(key);
    match value {
        MatchValue::Value(v) => match kind {
            KeywordKind::FullText => text(field, &v.term()).unwrap_or(Query::MatchAll),
            KeywordKind::Integer | KeywordKind::Double => match numeric(kind, v) {
                Some(n) => Query::Term { field, value: n },
                None => Query::MatchNone,
            },
            KeywordKind::Boolean => match v.as_bool() {
                Some(b) => Query::term(field, b),
                None => Query::MatchNone,
            },
            KeywordKind::Keyword => Query::Term {
                field,
                value: Scalar::Str(v.term()),
            },
        },
        MatchValue::Range { min: None, max: None } => Query::Exists { field },
        MatchValue::Range { min, max } => match kind {
            KeywordKind::FullText | KeywordKind::Boolean => Query::MatchNone,
            KeywordKind::Integer | KeywordKind::Double => {
                let lo = match min {
                    Some(v) => match numeric(kind, v) {
                        Some(n) => Some(n),
                        None => return Query::MatchNone,
                    },
                    None => None,
                };
                let hi = match max {
                    Some(v) => match numeric(kind, v) {
                        Some(n) => Some(n),
                        None => return Query::MatchNone,
                    },
                    None => None,
                };
                Query::Range {
                    field,
                    min: lo,
                    max: hi,
                }
            }
            KeywordKind::Keyword => Query::Range {
                field,
                min: min.as_ref().map(|v| Scalar::Str(v.term())),
                max: max.as_ref().map(|v| Scalar::Str(v.term())),
            },
        },
    }
}

pub fn compile_content(filter: &MatchFilter, mapping: &Mapping) -> Vec<Query> {
    let mut must = Vec::new();
    if let Some(q) = filter
        .full_text_in_all
        .as_deref()
        .and_then(|s| text(Field::AllText, s))
    {
        must.push(q);
    }
    for (key, s) in &filter.full_text_in_keys {
        must.push(compile_lookup(key, &MatchValue::value(s.as_str()), mapping));
    }
    if let Some(q) = filter
        .object_name
        .as_deref()
        .and_then(|s| text(Field::ObjectName, s))
    {
        must.push(q);
    }
    for (key, value) in &filter.lookup_in_keys {
        must.push(compile_lookup(key, value, mapping));
    }
    if let Some((min, max)) = filter.timestamp {
        if min.is_some() || max.is_some() {
            must.push(Query::Range {
                field: Field::Timestamp,
                min: min.map(Scalar::Int),
                max: max.map(Scalar::Int),
            });
        }
    }
    if filter.exclude_sub_objects {
        must.push(Query::term(Field::SubObject, false));
    }
    must
}

/// 未指定排序时按 guid 升序
pub fn compile_sort(rules: &[SortingRule]) -> Vec<SortKey> {
    if rules.is_empty() {
        return vec![SortKey {
            field: Field::Guid,
            ascending: true,
        }];
    }
    rules
        .iter()
        .map(|r| SortKey {
            field: match &r.field {
                SortField::Key(k) => Field::key(k),
                SortField::Timestamp => Field::Timestamp,
                SortField::ObjectName => Field::ObjectName,
                SortField::Guid => Field::Guid,
            },
            ascending: r.ascending,
        })
        .collect()
}
