use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// 引擎运行参数；core 只接收已解析好的值
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// collection 名前缀
    pub index_prefix: String,
    /// 单批最大文档数，超出直接拒绝
    pub max_bulk_docs: usize,
    pub default_page_size: usize,
    pub max_page_size: usize,
    /// 后端累计多少次写入后自动 refresh；0 表示只在显式 refresh 时可见
    pub auto_refresh_writes: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            index_prefix: String::new(),
            max_bulk_docs: 10_000,
            default_page_size: 50,
            max_page_size: 10_000,
            auto_refresh_writes: 0,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub snapshot_path: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// EnvFilter 语法；`RUST_LOG` 优先
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub storage: StorageConfig,
    pub log: LogConfig,
}

impl AppConfig {
    /// 文件不存在时返回默认配置
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("scidex")
            .join("config.toml")
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.storage.snapshot_path.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("scidex")
                .join("index.db")
        })
    }

    fn validate(&self) -> anyhow::Result<()> {
        let e = &self.engine;
        if e.max_bulk_docs == 0 {
            anyhow::bail!("engine.max_bulk_docs must be > 0");
        }
        if e.default_page_size == 0 || e.default_page_size > e.max_page_size {
            anyhow::bail!(
                "engine.default_page_size must be in 1..={} (got {})",
                e.max_page_size,
                e.default_page_size
            );
        }
        Ok(())
    }
}
