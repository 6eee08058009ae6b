use std::fmt;

/// 后端存储统计
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StorageReport {
    pub collections: Vec<CollectionStats>,
    /// bulk 请求次数（不是文档数）
    pub bulk_writes: u64,
    /// 实际发生修改的访问更新次数
    pub access_updates: u64,
    pub refreshes: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CollectionStats {
    pub name: String,
    /// primary 中的内容文档数
    pub docs: usize,
    pub access_docs: usize,
    /// 尚未 refresh 的写入
    pub pending: u64,
    pub searchable_docs: usize,
    /// 精确 + 全文 term 数量
    pub distinct_terms: usize,
    pub postings: u64,
    /// posting bitmap 序列化大小
    pub postings_bytes: u64,
}

impl StorageReport {
    pub fn total_docs(&self) -> usize {
        self.collections.iter().map(|c| c.docs).sum()
    }
}

/// 引擎级统计（含后端）
#[derive(Clone, Debug, Default)]
pub struct EngineReport {
    pub storage: StorageReport,
    pub objects_indexed: u64,
    pub index_failures: u64,
    pub searches: u64,
    pub access_mutations: u64,
    /// 进程级 RSS（从 /proc/self/statm 读取）
    pub process_rss_bytes: u64,
}

impl EngineReport {
    /// 从 /proc/self/statm 读取进程 RSS；非 Linux 返回 0
    pub fn read_process_rss() -> u64 {
        std::fs::read_to_string("/proc/self/statm")
            .ok()
            .and_then(|s| {
                // statm 格式: size resident shared text lib data dt (单位: 页)
                let parts: Vec<&str> = s.split_whitespace().collect();
                parts.get(1)?.parse::<u64>().ok()
            })
            .map(|pages| pages * 4096)
            .unwrap_or(0)
    }
}

pub fn human_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;
    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

impl fmt::Display for EngineReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "╔══════════════════════════════════════════════════╗")?;
        writeln!(f, "║           scidex Engine Report                   ║")?;
        writeln!(f, "╠══════════════════════════════════════════════════╣")?;
        writeln!(
            f,
            "║ Process RSS: {:>35} ║",
            human_bytes(self.process_rss_bytes)
        )?;
        writeln!(
            f,
            "║   indexed:      {:>10}  failed: {:>10}   ║",
            self.objects_indexed, self.index_failures
        )?;
        writeln!(
            f,
            "║   searches:     {:>10}  mutations: {:>7}   ║",
            self.searches, self.access_mutations
        )?;
        writeln!(
            f,
            "║   bulk writes:  {:>10}  refreshes: {:>7}   ║",
            self.storage.bulk_writes, self.storage.refreshes
        )?;
        for c in &self.storage.collections {
            writeln!(f, "╠──────────────────────────────────────────────────╣")?;
            writeln!(f, "║ {:<48} ║", c.name)?;
            writeln!(
                f,
                "║   docs:         {:>10}  access: {:>10}   ║",
                c.docs, c.access_docs
            )?;
            writeln!(
                f,
                "║   searchable:   {:>10}  pending: {:>9}   ║",
                c.searchable_docs, c.pending
            )?;
            writeln!(
                f,
                "║   terms:        {:>10}                       ║",
                c.distinct_terms
            )?;
            writeln!(
                f,
                "║   postings:     {:>10}  ({:>10})          ║",
                c.postings,
                human_bytes(c.postings_bytes)
            )?;
        }
        writeln!(f, "╚══════════════════════════════════════════════════╝")?;
        Ok(())
    }
}
