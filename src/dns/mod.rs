pub mod cache;
pub mod context;
pub mod doh;
pub mod lookup;
pub mod persist;
pub mod system;
pub mod well_known;

use std::collections::HashMap;
use std::future::Future;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::common::error::{Error, Result};
use crate::config::ResolveOptions;
use crate::url::KeyUrl;

pub use cache::{CacheEntry, CachedLookup, LookupHandle};
pub use lookup::{Lookup, Target};
pub use persist::{JsonFileCache, PersistentCache, StoredEntry};
pub use system::{HickoryTxtResolver, SystemTxtResolver};

/// 名称到 key 的解析器 trait
#[async_trait]
pub trait KeyResolver: Send + Sync {
    /// 实例默认协议
    fn protocol(&self) -> &str;

    fn has_protocol(&self, schema: &str) -> bool;

    /// 按指定协议解析名称或原始 key
    async fn resolve_protocol(&self, protocol: &str, name: &str, opts: &ResolveOptions) -> Result<String>;

    /// 按 `opts.protocols`（缺省为全部协议）分别解析，单个协议失败记为 `None`。
    /// 所有协议都没有结果时返回错误。
    async fn resolve(&self, name: &str, opts: &ResolveOptions) -> Result<HashMap<String, Option<String>>>;

    /// 按实例默认协议解析
    async fn resolve_name(&self, name: &str, opts: &ResolveOptions) -> Result<String> {
        self.resolve_protocol(self.protocol(), name, opts).await
    }

    /// 解析 url 的 host 并替换为 key，版本、端口、路径等原样保留。
    /// scheme 不是已注册协议的 url 原样返回。
    async fn resolve_url(&self, url: &str, opts: &ResolveOptions) -> Result<KeyUrl> {
        let parsed = KeyUrl::parse(url)?;
        let schema = parsed
            .schema()
            .unwrap_or_else(|| self.protocol())
            .to_string();
        if !self.has_protocol(&schema) {
            return Ok(parsed);
        }
        let key = self.resolve_protocol(&schema, &parsed.hostname, opts).await?;
        let mut resolved = parsed.with_hostname(&key);
        resolved.protocol = format!("{}:", schema);
        Ok(resolved)
    }
}

/// 至少有一个协议解析出 key，否则 `RecordNotFound`
pub(crate) fn found_keys(
    name: &str,
    keys: HashMap<String, Option<String>>,
) -> Result<HashMap<String, Option<String>>> {
    if keys.values().all(Option::is_none) {
        return Err(Error::RecordNotFound(name.to_string()));
    }
    Ok(keys)
}

/// 取消信号触发时立即返回 `Error::Aborted`，并丢弃进行中的请求
pub(crate) async fn with_signal<T, F>(signal: Option<&CancellationToken>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match signal {
        Some(token) => {
            tokio::select! {
                biased;
                _ = token.cancelled() => Err(Error::Aborted),
                res = fut => res,
            }
        }
        None => fut.await,
    }
}
