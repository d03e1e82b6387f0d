use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use super::cache::{now_ms, CacheEntry};

/// 持久化缓存中的一条记录
///
/// `keys` 中的 `None` 表示已知的解析失败，与缺失不同。`expires` 为 epoch 毫秒。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEntry {
    pub keys: HashMap<String, Option<String>>,
    pub expires: f64,
}

/// 可插拔的持久化缓存
///
/// 每个方法都有空实现，后端只需实现自己支持的操作。`read` 返回的记录由
/// 调用方校验，后端无需关心格式是否合法；任何错误都会被当作未命中处理。
/// 过期清理由后端在 `flush` 中自行完成。
#[async_trait]
pub trait PersistentCache: Send + Sync {
    async fn read(&self, _name: &str) -> Result<Option<StoredEntry>> {
        Ok(None)
    }

    async fn write(&self, _entry: &CacheEntry) -> Result<()> {
        Ok(())
    }

    async fn clear_name(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// JSON 文件持久化缓存
///
/// 首次访问时加载，每次修改后整体写回（先写临时文件再原子重命名）。
/// `close` 之后再次访问会重新加载。
/// 文件格式：`{"example.com": {"keys": {"hyper": "…"}, "expires": 1700000000000}}`
#[derive(Debug)]
pub struct JsonFileCache {
    path: PathBuf,
    state: Mutex<Option<HashMap<String, StoredEntry>>>,
}

impl JsonFileCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<HashMap<String, StoredEntry>> {
        if !tokio::fs::try_exists(&self.path).await? {
            debug!(path = %self.path.display(), "cache file not found, starting empty");
            return Ok(HashMap::new());
        }
        let content = tokio::fs::read_to_string(&self.path).await?;
        let entries: HashMap<String, StoredEntry> = serde_json::from_str(&content)?;
        debug!(path = %self.path.display(), entries = entries.len(), "loaded cache file");
        Ok(entries)
    }

    async fn save(&self, entries: &HashMap<String, StoredEntry>) -> Result<()> {
        let content = serde_json::to_string(entries)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// 在已加载的状态上执行修改并写回
    async fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut HashMap<String, StoredEntry>) + Send,
    {
        let mut state = self.state.lock().await;
        if state.is_none() {
            *state = Some(self.load().await?);
        }
        if let Some(entries) = state.as_mut() {
            f(entries);
            self.save(entries).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl PersistentCache for JsonFileCache {
    async fn read(&self, name: &str) -> Result<Option<StoredEntry>> {
        let mut state = self.state.lock().await;
        if state.is_none() {
            *state = Some(self.load().await?);
        }
        Ok(state.as_ref().and_then(|entries| entries.get(name).cloned()))
    }

    async fn write(&self, entry: &CacheEntry) -> Result<()> {
        let stored = StoredEntry {
            keys: entry.keys.clone(),
            expires: entry.expires,
        };
        let name = entry.name.clone();
        self.update(move |entries| {
            entries.insert(name, stored);
        })
        .await
    }

    async fn clear_name(&self, name: &str) -> Result<()> {
        self.update(|entries| {
            entries.remove(name);
        })
        .await
    }

    async fn clear(&self) -> Result<()> {
        self.update(|entries| entries.clear()).await
    }

    async fn flush(&self) -> Result<()> {
        let now = now_ms();
        self.update(move |entries| entries.retain(|_, e| e.expires > now))
            .await
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(entries) = state.take() {
            self.save(&entries).await?;
        }
        Ok(())
    }
}
