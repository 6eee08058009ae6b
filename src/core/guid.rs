use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::IndexError;

/// `CODE:container/object/version[:seg(.seg)*[/local_id]]`
fn grammar() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^([A-Z][A-Z0-9]*):(\d+)/(\d+)/(\d+)(?::([A-Za-z0-9_\-]+(?:\.[A-Za-z0-9_\-]+)*)(?:/(.+))?)?$",
        )
        .expect("identity grammar is a valid regex")
    })
}

/// 对象 / 对象版本 / 子对象的全局标识（GUID）
///
/// 同一逻辑对象的所有版本共享 `logical_key()`；版本号由上游分配，这里只做解析与比较。
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Guid {
    code: String,
    container: u64,
    object: u64,
    version: u32,
    sub_path: Vec<String>,
    local_id: Option<String>,
}

impl Guid {
    pub fn new(code: &str, container: u64, object: u64, version: u32) -> Result<Self, IndexError> {
        let g = Self {
            code: code.to_string(),
            container,
            object,
            version,
            sub_path: Vec::new(),
            local_id: None,
        };
        // 走一遍 grammar，保证 render/parse 可逆
        g.to_string().parse()
    }

    /// 派生子对象 identity：`sub_path` 为有序的类型化路径段，`local_id` 区分同路径下的重复子对象
    pub fn sub_object(
        &self,
        sub_path: Vec<String>,
        local_id: Option<String>,
    ) -> Result<Self, IndexError> {
        let g = Self {
            sub_path,
            local_id,
            ..self.parent()
        };
        g.to_string().parse()
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn container(&self) -> u64 {
        self.container
    }

    pub fn object(&self) -> u64 {
        self.object
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn sub_path(&self) -> &[String] {
        &self.sub_path
    }

    pub fn local_id(&self) -> Option<&str> {
        self.local_id.as_deref()
    }

    pub fn is_sub_object(&self) -> bool {
        !self.sub_path.is_empty()
    }

    /// 去掉子对象部分，得到父记录 identity（同一版本）
    pub fn parent(&self) -> Self {
        Self {
            code: self.code.clone(),
            container: self.container,
            object: self.object,
            version: self.version,
            sub_path: Vec::new(),
            local_id: None,
        }
    }

    /// 忽略版本号的渲染形式，作为“同一逻辑对象”的检索 term
    pub fn logical_key(&self) -> String {
        let mut out = format!("{}:{}/{}", self.code, self.container, self.object);
        self.push_sub(&mut out);
        out
    }

    pub fn same_logical_object(&self, other: &Guid) -> bool {
        self.code == other.code
            && self.container == other.container
            && self.object == other.object
            && self.sub_path == other.sub_path
            && self.local_id == other.local_id
    }

    fn push_sub(&self, out: &mut String) {
        if self.sub_path.is_empty() {
            return;
        }
        out.push(':');
        out.push_str(&self.sub_path.join("."));
        if let Some(local) = &self.local_id {
            out.push('/');
            out.push_str(local);
        }
    }
}

/// 每个逻辑对象保留最大版本，结果按 identity 排序
pub fn latest_of<'a>(ids: impl IntoIterator<Item = &'a Guid>) -> Vec<Guid> {
    let mut best: BTreeMap<String, &Guid> = BTreeMap::new();
    for id in ids {
        best.entry(id.logical_key())
            .and_modify(|cur| {
                if id.version > cur.version {
                    *cur = id;
                }
            })
            .or_insert(id);
    }
    let mut out: Vec<Guid> = best.into_values().cloned().collect();
    out.sort();
    out
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = format!(
            "{}:{}/{}/{}",
            self.code, self.container, self.object, self.version
        );
        self.push_sub(&mut out);
        f.write_str(&out)
    }
}

impl FromStr for Guid {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = |reason| IndexError::MalformedIdentity {
            input: s.to_string(),
            reason,
        };
        let caps = grammar()
            .captures(s)
            .ok_or_else(|| malformed("does not match CODE:container/object/version[:sub]"))?;

        let num = |i: usize| caps.get(i).map(|m| m.as_str()).unwrap_or_default();
        let container: u64 = num(2)
            .parse()
            .map_err(|_| malformed("container id out of range"))?;
        let object: u64 = num(3)
            .parse()
            .map_err(|_| malformed("object id out of range"))?;
        let version: u32 = num(4)
            .parse()
            .map_err(|_| malformed("version out of range"))?;
        if container == 0 || object == 0 || version == 0 {
            return Err(malformed("ids and version must be positive"));
        }

        let sub_path = caps
            .get(5)
            .map(|m| m.as_str().split('.').map(str::to_string).collect())
            .unwrap_or_default();
        let local_id = caps.get(6).map(|m| m.as_str().to_string());

        Ok(Self {
            code: num(1).to_string(),
            container,
            object,
            version,
            sub_path,
            local_id,
        })
    }
}

impl TryFrom<String> for Guid {
    type Error = IndexError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Guid> for String {
    fn from(g: Guid) -> Self {
        g.to_string()
    }
}
