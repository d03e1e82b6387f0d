use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures_util::future::{self, BoxFuture, FutureExt, Shared};
use tracing::{debug, warn};

use crate::common::error::{Error, Result};
use crate::config::{LookupConfig, ResolveOptions};

use super::lookup::{Lookup, Target};
use super::persist::{PersistentCache, StoredEntry};
use super::{found_keys, with_signal, KeyResolver};

/// 当前 epoch 毫秒
pub fn now_ms() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
        * 1000.0
}

/// 缓存条目：整体替换，不逐字段修改
///
/// `keys` 中的 `None` 记录已知的解析失败。
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub name: String,
    pub keys: HashMap<String, Option<String>>,
    /// epoch 毫秒
    pub expires: f64,
}

impl CacheEntry {
    pub fn is_fresh(&self, now: f64) -> bool {
        self.expires > now
    }

    /// `None`: 没有该协议的记录；`Some(None)`: 已知失败
    pub fn key(&self, protocol: &str) -> Option<Option<&str>> {
        self.keys.get(protocol).map(|k| k.as_deref())
    }
}

type SharedLookup = Shared<BoxFuture<'static, Result<CacheEntry>>>;

/// (协议集合, 域名)；单协议时协议集合就是协议名
type InFlightKey = (String, String);

/// 进行中的解析，同名并发调用拿到的是同一个句柄
///
/// 每个句柄都算一个等待者。最后一个等待者在完成前被丢弃时，解析随之取消，
/// 登记项立即移除。
pub struct LookupHandle {
    shared: SharedLookup,
    waiter: Option<Waiter>,
}

#[derive(Clone)]
struct Waiter {
    inner: Arc<CachedInner>,
    key: InFlightKey,
    id: u64,
}

impl LookupHandle {
    fn ready(entry: CacheEntry) -> Self {
        Self {
            shared: future::ready(Ok(entry)).boxed().shared(),
            waiter: None,
        }
    }

    pub fn ptr_eq(&self, other: &LookupHandle) -> bool {
        self.shared.ptr_eq(&other.shared)
    }
}

impl Clone for LookupHandle {
    fn clone(&self) -> Self {
        if let Some(waiter) = &self.waiter {
            waiter.inner.join(&waiter.key, waiter.id);
        }
        Self {
            shared: self.shared.clone(),
            waiter: self.waiter.clone(),
        }
    }
}

impl Drop for LookupHandle {
    fn drop(&mut self) {
        if let Some(waiter) = self.waiter.take() {
            waiter.inner.leave(&waiter.key, waiter.id);
        }
    }
}

impl Future for LookupHandle {
    type Output = Result<CacheEntry>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.shared).poll(cx)
    }
}

struct Flight {
    id: u64,
    shared: SharedLookup,
    waiters: usize,
}

/// 内存缓存，超过上限时先清过期条目，再按最近使用顺序淘汰
struct MemoryCache {
    entries: HashMap<String, CacheEntry>,
    order: VecDeque<String>,
    max_entries: usize,
}

impl MemoryCache {
    fn new(max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            max_entries,
        }
    }

    fn touch(&mut self, name: &str) {
        if let Some(pos) = self.order.iter().position(|n| n == name) {
            self.order.remove(pos);
        }
        self.order.push_back(name.to_string());
    }

    fn get(&mut self, name: &str) -> Option<CacheEntry> {
        let entry = self.entries.get(name).cloned()?;
        self.touch(name);
        Some(entry)
    }

    fn peek(&self, name: &str) -> Option<&CacheEntry> {
        self.entries.get(name)
    }

    fn insert(&mut self, entry: CacheEntry, now: f64) {
        let name = entry.name.clone();
        self.entries.insert(name.clone(), entry);
        self.touch(&name);
        self.evict_if_needed(now);
    }

    fn evict_if_needed(&mut self, now: f64) {
        if self.entries.len() <= self.max_entries {
            return;
        }
        // 先清理过期条目
        self.retain_fresh(now);
        while self.entries.len() > self.max_entries {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            debug!(name = %oldest, "evicting least recently used entry");
            self.entries.remove(&oldest);
        }
    }

    fn remove(&mut self, name: &str) {
        self.entries.remove(name);
        self.order.retain(|n| n != name);
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    fn retain_fresh(&mut self, now: f64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_fresh(now));
        let entries = &self.entries;
        self.order.retain(|n| entries.contains_key(n));
        before - self.entries.len()
    }
}

/// 带 TTL 缓存、持久化缓存与并发去重的解析器
#[derive(Clone)]
pub struct CachedLookup {
    inner: Arc<CachedInner>,
}

struct CachedInner {
    lookup: Lookup,
    persistent: Option<Arc<dyn PersistentCache>>,
    cache: Mutex<MemoryCache>,
    /// 并发去重：(协议集合, 名称) -> 进行中的解析
    in_flight: Mutex<HashMap<InFlightKey, Flight>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl CachedLookup {
    pub fn new(config: LookupConfig) -> Result<Self> {
        Ok(Self::from_lookup(Lookup::new(config)?, None))
    }

    pub fn with_persistent(config: LookupConfig, persistent: Arc<dyn PersistentCache>) -> Result<Self> {
        Ok(Self::from_lookup(Lookup::new(config)?, Some(persistent)))
    }

    pub fn from_lookup(lookup: Lookup, persistent: Option<Arc<dyn PersistentCache>>) -> Self {
        let max_entries = lookup.config().max_entries;
        Self {
            inner: Arc::new(CachedInner {
                lookup,
                persistent,
                cache: Mutex::new(MemoryCache::new(max_entries)),
                in_flight: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn lookup(&self) -> &Lookup {
        &self.inner.lookup
    }

    /// 取得（或加入）某个名称的单协议解析句柄
    ///
    /// 句柄本身不带取消信号，`opts.signal` 由调用方在等待句柄时自行套用。
    pub fn handle(&self, protocol: &str, name: &str, opts: &ResolveOptions) -> Result<LookupHandle> {
        match self.inner.lookup.target(protocol, name)? {
            Target::Key(key) => Ok(LookupHandle::ready(CacheEntry {
                name: key.clone(),
                keys: HashMap::from([(protocol.to_string(), Some(key))]),
                expires: f64::MAX,
            })),
            Target::Domain(domain) => Ok(self.flight(vec![protocol.to_string()], domain, opts)),
        }
    }

    /// 检查与登记在同一把锁内完成，中间没有挂起点
    fn flight(&self, schemas: Vec<String>, domain: String, opts: &ResolveOptions) -> LookupHandle {
        let key = (schemas.join(","), domain);
        let mut in_flight = self.inner.in_flight();
        if let Some(flight) = in_flight.get_mut(&key) {
            debug!(protocols = %key.0, name = %key.1, "joining in-flight lookup");
            flight.waiters += 1;
            return LookupHandle {
                shared: flight.shared.clone(),
                waiter: Some(Waiter {
                    inner: self.inner.clone(),
                    id: flight.id,
                    key,
                }),
            };
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let inner = self.inner.clone();
        let opts = ResolveOptions {
            signal: None,
            ..opts.clone()
        };
        let task_key = key.clone();
        let task = async move {
            let result = inner.resolve_entry(&schemas, &task_key.1, &opts).await;
            // 在结果对外可见之前移除，调用方不会看到残留的进行中条目
            inner.finish(&task_key, id);
            result
        };
        let shared = task.boxed().shared();
        in_flight.insert(
            key.clone(),
            Flight {
                id,
                shared: shared.clone(),
                waiters: 1,
            },
        );
        LookupHandle {
            shared,
            waiter: Some(Waiter {
                inner: self.inner.clone(),
                key,
                id,
            }),
        }
    }

    /// 解析并返回完整的缓存条目
    pub async fn lookup_entry(&self, protocol: &str, name: &str, opts: &ResolveOptions) -> Result<CacheEntry> {
        let handle = self.handle(protocol, name, opts)?;
        with_signal(opts.signal.as_ref(), handle).await
    }

    /// 进行中的解析数量
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight().len()
    }

    pub fn is_in_flight(&self, name: &str) -> bool {
        let name = self.cache_name(name);
        self.inner.in_flight().keys().any(|(_, n)| *n == name)
    }

    /// 内存缓存中的条目（不论是否过期，不影响淘汰顺序）
    pub fn cached(&self, name: &str) -> Option<CacheEntry> {
        let name = self.cache_name(name);
        self.inner.memory().peek(&name).cloned()
    }

    /// 内存缓存条目数
    pub fn cached_len(&self) -> usize {
        self.inner.memory().entries.len()
    }

    /// 移除单个名称
    pub async fn clear_name(&self, name: &str) {
        let name = self.cache_name(name);
        self.inner.memory().remove(&name);
        if let Some(persistent) = &self.inner.persistent {
            if let Err(e) = persistent.clear_name(&name).await {
                warn!(name = %name, error = %e, "persistent cache clear_name failed");
            }
        }
    }

    /// 清空全部缓存
    pub async fn clear(&self) {
        self.inner.memory().clear();
        if let Some(persistent) = &self.inner.persistent {
            if let Err(e) = persistent.clear().await {
                warn!(error = %e, "persistent cache clear failed");
            }
        }
    }

    /// 只移除已过期的内存条目；持久化缓存自行清理
    pub async fn flush(&self) {
        let removed = self.inner.memory().retain_fresh(now_ms());
        debug!(removed = removed, "flushed expired cache entries");
        if let Some(persistent) = &self.inner.persistent {
            if let Err(e) = persistent.flush().await {
                warn!(error = %e, "persistent cache flush failed");
            }
        }
    }

    /// 可重复调用，持久化缓存只会被关闭一次
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(persistent) = &self.inner.persistent {
            if let Err(e) = persistent.close().await {
                warn!(error = %e, "persistent cache close failed");
            }
        }
    }

    /// 缓存使用规范化后的域名作为键
    fn cache_name(&self, name: &str) -> String {
        match self.inner.lookup.target(self.protocol(), name) {
            Ok(Target::Domain(domain)) => domain,
            _ => name.to_string(),
        }
    }
}

impl CachedInner {
    fn in_flight(&self) -> MutexGuard<'_, HashMap<InFlightKey, Flight>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn memory(&self) -> MutexGuard<'_, MemoryCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn join(&self, key: &InFlightKey, id: u64) {
        if let Some(flight) = self.in_flight().get_mut(key) {
            if flight.id == id {
                flight.waiters += 1;
            }
        }
    }

    /// 最后一个等待者离开时移除登记项，未完成的解析随之丢弃
    fn leave(&self, key: &InFlightKey, id: u64) {
        let abandoned = {
            let mut in_flight = self.in_flight();
            match in_flight.get_mut(key) {
                Some(flight) if flight.id == id => {
                    flight.waiters = flight.waiters.saturating_sub(1);
                    if flight.waiters == 0 {
                        in_flight.remove(key)
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };
        if abandoned.is_some() {
            debug!(protocols = %key.0, name = %key.1, "all callers left, dropping lookup");
        }
    }

    fn finish(&self, key: &InFlightKey, id: u64) {
        let mut in_flight = self.in_flight();
        if in_flight.get(key).is_some_and(|flight| flight.id == id) {
            in_flight.remove(key);
        }
    }

    async fn resolve_entry(&self, schemas: &[String], domain: &str, opts: &ResolveOptions) -> Result<CacheEntry> {
        let now = now_ms();

        if !opts.ignore_cache {
            let cached = self.memory().get(domain);
            if let Some(entry) = cached {
                if entry.is_fresh(now) && usable(&entry, schemas, opts) {
                    debug!(name = domain, "cache hit");
                    return Ok(entry);
                }
            }

            if let Some(entry) = self.read_persistent(schemas, domain, now).await {
                if entry.is_fresh(now) && usable(&entry, schemas, opts) {
                    debug!(name = domain, "persistent cache hit");
                    self.memory().insert(entry.clone(), now);
                    return Ok(entry);
                }
                debug!(name = domain, "persistent cache entry not usable");
            }
        }

        let config = self.lookup.config();
        let answers = self.lookup.lookup_protocols(schemas, domain, opts).await?;
        // 多个协议有结果时取最短的 TTL
        let ttl = answers
            .values()
            .flatten()
            .map(|answer| answer.ttl.unwrap_or(config.ttl))
            .reduce(f64::min);
        let ttl = match (ttl, config.negative_ttl) {
            (Some(ttl), _) => ttl,
            (None, Some(negative_ttl)) => negative_ttl,
            (None, None) => return Err(Error::RecordNotFound(domain.to_string())),
        };

        let ttl = clamp_ttl(ttl, config.min_ttl, config.max_ttl);
        let now = now_ms();
        let entry = CacheEntry {
            name: domain.to_string(),
            keys: answers
                .into_iter()
                .map(|(schema, answer)| (schema, answer.map(|a| a.key)))
                .collect(),
            expires: now + ttl * 1000.0,
        };
        debug!(name = domain, ttl = ttl, "caching lookup result");

        self.memory().insert(entry.clone(), now);
        if let Some(persistent) = &self.persistent {
            if let Err(e) = persistent.write(&entry).await {
                warn!(name = domain, error = %e, "persistent cache write failed");
            }
        }
        Ok(entry)
    }

    /// 读取并校验持久化条目；读取错误与不合法的条目都按未命中处理
    async fn read_persistent(&self, schemas: &[String], domain: &str, now: f64) -> Option<CacheEntry> {
        let persistent = self.persistent.as_ref()?;
        let stored = match persistent.read(domain).await {
            Ok(Some(stored)) => stored,
            Ok(None) => return None,
            Err(e) => {
                warn!(name = domain, error = %e, "persistent cache read failed");
                return None;
            }
        };
        if !self.is_valid(schemas, &stored, now) {
            debug!(name = domain, "discarding invalid persistent cache entry");
            return None;
        }
        Some(CacheEntry {
            name: domain.to_string(),
            keys: stored.keys,
            expires: stored.expires,
        })
    }

    /// `expires` 有限且不超过 max-ttl；已注册协议的非空 key 必须符合协议格式；
    /// 每个目标协议都必须有记录（key 或已知失败）
    fn is_valid(&self, schemas: &[String], stored: &StoredEntry, now: f64) -> bool {
        if !stored.expires.is_finite() {
            return false;
        }
        if stored.expires > now + self.lookup.config().max_ttl * 1000.0 {
            return false;
        }
        if !schemas.iter().all(|schema| stored.keys.contains_key(schema)) {
            return false;
        }
        stored.keys.iter().all(|(schema, key)| match (self.lookup.registry().get(schema), key) {
            (Some(handler), Some(key)) => handler.is_key(key),
            _ => true,
        })
    }
}

/// 条目中每个目标协议都有记录；全部是失败记录时仅在未设置
/// `ignore_cached_miss` 时可用
fn usable(entry: &CacheEntry, schemas: &[String], opts: &ResolveOptions) -> bool {
    let mut found = false;
    for schema in schemas {
        match entry.key(schema) {
            Some(Some(_)) => found = true,
            Some(None) => {}
            None => return false,
        }
    }
    found || !opts.ignore_cached_miss
}

pub fn clamp_ttl(ttl: f64, min_ttl: f64, max_ttl: f64) -> f64 {
    ttl.max(min_ttl).min(max_ttl)
}

#[async_trait]
impl KeyResolver for CachedLookup {
    fn protocol(&self) -> &str {
        &self.inner.lookup.config().protocol
    }

    fn has_protocol(&self, schema: &str) -> bool {
        self.inner.lookup.registry().contains(schema)
    }

    async fn resolve(&self, name: &str, opts: &ResolveOptions) -> Result<HashMap<String, Option<String>>> {
        let lookup = &self.inner.lookup;
        let schemas = lookup.protocols(opts)?;
        let Some(domain) = lookup.domain_for(&schemas, name)? else {
            // 输入本身是 key，不经过缓存
            return lookup.resolve(name, opts).await;
        };

        let handle = self.flight(schemas.clone(), domain, opts);
        let entry = with_signal(opts.signal.as_ref(), handle).await?;
        let keys = schemas
            .into_iter()
            .map(|schema| {
                let key = entry.keys.get(&schema).cloned().flatten();
                (schema, key)
            })
            .collect();
        found_keys(name, keys)
    }

    async fn resolve_protocol(&self, protocol: &str, name: &str, opts: &ResolveOptions) -> Result<String> {
        let entry = self.lookup_entry(protocol, name, opts).await?;
        match entry.key(protocol) {
            Some(Some(key)) => Ok(key.to_string()),
            _ => Err(Error::RecordNotFound(name.to_string())),
        }
    }
}
