use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use scidex::config::AppConfig;
use scidex::core::{AccessFilter, IndexingRule, SearchObjectType, StaticTypeRules};
use scidex::index::{IndexEngine, IndexRequest};
use scidex::query::{MatchFilter, MatchValue, Pagination, PostProcessing, Scalar};
use scidex::storage::{MemoryBackend, SnapshotStore};

#[derive(Parser, Debug)]
#[command(name = "scidex", version, about = "Versioned, access-controlled search index")]
struct Cli {
    /// 配置文件（默认 ~/.config/scidex/config.toml）
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 导入 JSON-lines 请求并保存 snapshot
    Load {
        file: PathBuf,
        /// 类型规则（JSON 数组：[{object_type, rules}]）
        #[arg(long)]
        rules: PathBuf,
    },
    Search {
        #[command(flatten)]
        filter: FilterArgs,
        #[arg(long = "type")]
        types: Vec<String>,
        #[arg(long, default_value_t = 0)]
        start: usize,
        #[arg(long)]
        count: Option<usize>,
        /// 同时返回对象内容（info / data / keys）
        #[arg(long)]
        hydrate: bool,
    },
    Types {
        #[command(flatten)]
        filter: FilterArgs,
    },
    Stats,
}

#[derive(Args, Debug)]
struct FilterArgs {
    #[arg(long)]
    text: Option<String>,
    /// k=v 或 k=min..max（任一端可省略）
    #[arg(long = "key", value_parser = parse_key)]
    keys: Vec<(String, MatchValue)>,
    #[arg(long = "container")]
    containers: Vec<u64>,
    #[arg(long)]
    public: bool,
    #[arg(long)]
    admin: bool,
    #[arg(long)]
    all_history: bool,
}

impl FilterArgs {
    fn filter(&self) -> MatchFilter {
        let mut f = MatchFilter::create();
        if let Some(text) = &self.text {
            f = f.with_full_text_in_all(text);
        }
        for (key, value) in &self.keys {
            f = f.with_lookup_in_key(key, value.clone());
        }
        f
    }

    fn authz(&self) -> AccessFilter {
        AccessFilter::create()
            .with_containers(self.containers.iter().copied())
            .with_public(self.public)
            .with_admin(self.admin)
            .with_all_history(self.all_history)
    }
}

fn parse_key(s: &str) -> Result<(String, MatchValue), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected k=v, got {:?}", s))?;
    if key.is_empty() {
        return Err(format!("empty key in {:?}", s));
    }
    let bound = |v: &str| (!v.is_empty()).then(|| Scalar::from(v));
    let value = match value.split_once("..") {
        Some((lo, hi)) => MatchValue::Range {
            min: bound(lo),
            max: bound(hi),
        },
        None => MatchValue::value(value),
    };
    Ok((key.to_string(), value))
}

#[derive(Deserialize)]
struct TypeRules {
    object_type: SearchObjectType,
    rules: Vec<IndexingRule>,
}

fn load_rules(path: &Path) -> anyhow::Result<StaticTypeRules> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading rules {}", path.display()))?;
    let entries: Vec<TypeRules> = serde_json::from_str(&content)
        .with_context(|| format!("parsing rules {}", path.display()))?;
    Ok(entries
        .into_iter()
        .fold(StaticTypeRules::new(), |acc, e| acc.with_type(e.object_type, e.rules)))
}

fn read_requests(path: &Path) -> anyhow::Result<Vec<IndexRequest>> {
    let file =
        std::fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut out = Vec::new();
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("reading {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let req: IndexRequest = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: bad request", path.display(), n + 1))?;
        out.push(req);
    }
    Ok(out)
}

fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(AppConfig::default_path);
    let config = AppConfig::load_from(&config_path)?;
    init_tracing(&config.log.filter);

    let store = SnapshotStore::new(config.snapshot_path());
    let backend = match store.load_if_valid()? {
        Some(image) => {
            info!("Loaded snapshot: {} docs", image.doc_count());
            MemoryBackend::from_image(image)?
        }
        None => MemoryBackend::new(),
    }
    .with_auto_refresh(config.engine.auto_refresh_writes);
    let backend = Arc::new(backend);
    let engine = IndexEngine::new(backend.clone(), config.engine.clone());

    match cli.command {
        Command::Load { file, rules } => {
            let engine = engine.with_type_rules(Arc::new(load_rules(&rules)?));
            let requests = read_requests(&file)?;
            let (mut indexed, mut failed) = (0usize, 0usize);
            for chunk in requests.chunks(config.engine.max_bulk_docs) {
                let report = engine.index_objects(chunk)?;
                indexed += report.indexed.len();
                for f in &report.failed {
                    warn!(guid = %f.guid, "Skipped: {}", f.cause);
                }
                failed += report.failed.len();
            }
            engine.refresh(None)?;
            store.write_atomic(&backend.export()?)?;
            info!(path = %store.path().display(), "Snapshot saved");
            println!(
                "{}",
                serde_json::json!({ "indexed": indexed, "failed": failed })
            );
        }
        Command::Search {
            filter,
            types,
            start,
            count,
            hydrate,
        } => {
            engine.refresh(None)?;
            let page = Pagination::new(start, count.unwrap_or(config.engine.default_page_size));
            let types = (!types.is_empty()).then_some(types.as_slice());
            let post = if hydrate {
                PostProcessing::default()
            } else {
                PostProcessing::ids_only()
            };
            let hits = engine.search_objects(
                types,
                &filter.filter(),
                &[],
                &filter.authz(),
                Some(page),
                Some(&post),
            )?;
            println!("{}", serde_json::to_string_pretty(&hits)?);
        }
        Command::Types { filter } => {
            engine.refresh(None)?;
            let counts = engine.search_types(&filter.filter(), &filter.authz())?;
            println!("{}", serde_json::to_string_pretty(&counts)?);
        }
        Command::Stats => {
            engine.refresh(None)?;
            println!("{}", engine.stats());
        }
    }
    Ok(())
}
