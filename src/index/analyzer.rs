use serde_json::Value;
use unicode_normalization::UnicodeNormalization;

/// 全文分词：NFC → 小写 → 按非字母数字切分（保留 `_`），按首次出现去重
///
/// 索引侧与查询侧必须共用这一实现，否则 token 精确匹配会失配。
pub fn tokenize(text: &str) -> Vec<String> {
    let normalized: String = text.nfc().collect::<String>().to_lowercase();
    let mut out: Vec<String> = Vec::new();
    for tok in normalized.split(|c: char| !(c.is_alphanumeric() || c == '_')) {
        if tok.is_empty() {
            continue;
        }
        if !out.iter().any(|t| t == tok) {
            out.push(tok.to_string());
        }
    }
    out
}

/// 标量 JSON 值的文本形式；数组/对象不参与分词
pub fn value_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
