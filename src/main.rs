use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use hyperdns::config::{load_config, LookupConfig, ResolveOptions};
use hyperdns::dns::{CachedLookup, JsonFileCache, KeyResolver};

/// 将 hyper/dat/cabal/ara 名称解析为 key
#[derive(Parser, Debug)]
#[command(name = "hyperdns", version)]
struct Args {
    /// YAML 配置文件
    #[arg(short, long)]
    config: Option<String>,

    /// 覆盖默认协议
    #[arg(short, long)]
    protocol: Option<String>,

    /// 不抓取 /.well-known 文档
    #[arg(long)]
    no_well_known: bool,

    /// 解析所有已注册协议，逐行输出 `name schema key`
    #[arg(long)]
    all: bool,

    /// JSON 持久化缓存文件
    #[arg(long)]
    cache_file: Option<String>,

    /// 名称或 url
    #[arg(required = true)]
    names: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => {
            let config = load_config(path)?;
            info!(path = %path, "config loaded");
            config
        }
        None => LookupConfig::default(),
    };
    if let Some(protocol) = args.protocol {
        config.protocol = protocol;
    }
    if args.no_well_known {
        config.no_well_known = true;
    }

    let resolver = match &args.cache_file {
        Some(path) => CachedLookup::with_persistent(config, Arc::new(JsonFileCache::new(path)))?,
        None => CachedLookup::new(config)?,
    };

    let opts = ResolveOptions::default();
    let mut failed = false;
    for name in &args.names {
        let result = if args.all {
            resolver.resolve(name, &opts).await.map(|keys| {
                let mut keys: Vec<_> = keys.into_iter().collect();
                keys.sort();
                for (schema, key) in keys {
                    println!("{} {} {}", name, schema, key.as_deref().unwrap_or("-"));
                }
            })
        } else {
            resolver.resolve_name(name, &opts).await.map(|key| println!("{} {}", name, key))
        };
        if let Err(e) = result {
            error!(name = %name, kind = e.kind().as_str(), "{}", e);
            failed = true;
        }
    }
    resolver.close().await;

    if failed {
        std::process::exit(1);
    }
    Ok(())
}
