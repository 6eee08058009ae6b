use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::core::Guid;

/// 每个 identity 一份的访问账本：可见性的唯一事实来源
///
/// `latest` / `latest_in` 是版本折叠的派生字段：index 与 share 时由引擎认领，unshare 时只撤回本版本。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRecord {
    pub guid: Guid,
    pub logical: String,
    pub version: u32,
    /// identity 自带的 container（隐式成员关系）
    pub home: u64,
    /// container → 授权方 container 自身是否为 public
    pub shares: BTreeMap<u64, bool>,
    pub self_published: bool,
    /// data palette 式的外部公开声明
    pub external_public: BTreeSet<u64>,
    pub deleted: bool,
    /// 该逻辑对象所有已存版本中的最大版本
    pub latest: bool,
    /// 该版本在其中为最新版本的 container（⊆ members）
    pub latest_in: BTreeSet<u64>,
}

/// 访问账本上的单项变更；所有变更幂等且可逆
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AccessMutation {
    Share { container: u64, public: bool },
    Unshare { container: u64 },
    Publish,
    Unpublish,
    PublishExternally { container: u64 },
    UnpublishExternally { container: u64 },
    Delete,
    Undelete,
}

impl AccessRecord {
    pub fn new(guid: &Guid, self_published: bool) -> Self {
        Self {
            guid: guid.clone(),
            logical: guid.logical_key(),
            version: guid.version(),
            home: guid.container(),
            shares: BTreeMap::new(),
            self_published,
            external_public: BTreeSet::new(),
            deleted: false,
            latest: true,
            latest_in: BTreeSet::from([guid.container()]),
        }
    }

    /// 返回 true 表示记录被修改
    pub fn apply(&mut self, m: &AccessMutation) -> bool {
        match *m {
            AccessMutation::Share { container, public } => {
                self.shares.insert(container, public) != Some(public)
            }
            AccessMutation::Unshare { container } => {
                let removed = self.shares.remove(&container).is_some();
                // 不回退给旧版本：撤销共享后该 container 内不再有此对象的最新版本
                if removed && container != self.home {
                    self.latest_in.remove(&container);
                }
                removed
            }
            AccessMutation::Publish => !std::mem::replace(&mut self.self_published, true),
            AccessMutation::Unpublish => std::mem::replace(&mut self.self_published, false),
            AccessMutation::PublishExternally { container } => {
                self.external_public.insert(container)
            }
            AccessMutation::UnpublishExternally { container } => {
                self.external_public.remove(&container)
            }
            AccessMutation::Delete => !std::mem::replace(&mut self.deleted, true),
            AccessMutation::Undelete => std::mem::replace(&mut self.deleted, false),
        }
    }

    /// 写入折叠结果；返回是否有变化
    pub fn set_collapse(&mut self, latest: bool, latest_in: BTreeSet<u64>) -> bool {
        let changed = self.latest != latest || self.latest_in != latest_in;
        self.latest = latest;
        self.latest_in = latest_in;
        changed
    }

    /// home ∪ 显式共享的 container
    pub fn members(&self) -> impl Iterator<Item = u64> + '_ {
        std::iter::once(self.home).chain(self.shares.keys().copied())
    }

    /// 授权方本身是 public container 的共享
    pub fn public_shares(&self) -> impl Iterator<Item = u64> + '_ {
        self.shares
            .iter()
            .filter_map(|(c, public)| public.then_some(*c))
    }

    /// 可见性谓词（不含版本折叠与 tombstone）
    pub fn visible(&self, filter: &AccessFilter) -> bool {
        if filter.admin {
            return true;
        }
        if self.members().any(|c| filter.containers.contains(&c)) {
            return true;
        }
        filter.public && self.publicly_exposed()
    }

    fn publicly_exposed(&self) -> bool {
        self.self_published
            || self.public_shares().next().is_some()
            || !self.external_public.is_empty()
    }

    /// 可见性 + 版本折叠 + tombstone
    ///
    /// 默认视图按访问路径折叠：成员路径看 `latest_in`，admin 与 public 路径看全局 `latest`。
    /// all-history 下每个版本独立判定，tombstone 不生效。
    pub fn admits(&self, filter: &AccessFilter) -> bool {
        if filter.all_history {
            return self.visible(filter);
        }
        if self.deleted {
            return false;
        }
        if filter.admin {
            return self.latest;
        }
        self.latest_in.iter().any(|c| filter.containers.contains(c))
            || (filter.public && self.latest && self.publicly_exposed())
    }
}

/// 调用方的授权上下文：成员关系由上游提供，这里只当作不透明输入
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccessFilter {
    pub admin: bool,
    pub containers: BTreeSet<u64>,
    pub public: bool,
    pub all_history: bool,
}

impl AccessFilter {
    pub fn create() -> Self {
        Self::default()
    }

    pub fn with_admin(mut self, admin: bool) -> Self {
        self.admin = admin;
        self
    }

    pub fn with_containers(mut self, ids: impl IntoIterator<Item = u64>) -> Self {
        self.containers.extend(ids);
        self
    }

    pub fn with_public(mut self, public: bool) -> Self {
        self.public = public;
        self
    }

    pub fn with_all_history(mut self, all_history: bool) -> Self {
        self.all_history = all_history;
        self
    }
}
