use anyhow::Result;
use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use tokio::sync::OnceCell;
use tracing::debug;

/// 系统 DNS 兜底：所有 DoH 服务都失败后使用
#[async_trait]
pub trait SystemTxtResolver: Send + Sync {
    /// 返回域名下的原始 TXT 字符串
    async fn resolve_txt(&self, domain: &str) -> Result<Vec<String>>;
}

/// 基于 hickory-resolver 的系统 TXT 解析器（读取系统 DNS 配置，首次使用时创建）
pub struct HickoryTxtResolver {
    resolver: OnceCell<TokioAsyncResolver>,
}

impl HickoryTxtResolver {
    pub fn new() -> Self {
        Self {
            resolver: OnceCell::new(),
        }
    }

    async fn resolver(&self) -> Result<&TokioAsyncResolver> {
        Ok(self
            .resolver
            .get_or_try_init(|| async { TokioAsyncResolver::tokio_from_system_conf() })
            .await?)
    }
}

impl Default for HickoryTxtResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SystemTxtResolver for HickoryTxtResolver {
    async fn resolve_txt(&self, domain: &str) -> Result<Vec<String>> {
        let resolver = self.resolver().await?;
        // 末尾加点，避免追加 search 域
        let fqdn = format!("{}.", domain.trim_end_matches('.'));
        let lookup = resolver.txt_lookup(fqdn).await?;
        let records: Vec<String> = lookup
            .iter()
            .map(|txt| {
                txt.txt_data()
                    .iter()
                    .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
                    .collect::<String>()
            })
            .collect();
        debug!(domain = domain, count = records.len(), "system TXT resolved");
        Ok(records)
    }
}

/// 不做任何查询的兜底解析器
pub struct NoSystemResolver;

#[async_trait]
impl SystemTxtResolver for NoSystemResolver {
    async fn resolve_txt(&self, _domain: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}
