use async_trait::async_trait;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::common::error::Result;
use crate::common::http::Transport;
use crate::protocol::Answer;

use super::doh::DohChain;
use super::system::SystemTxtResolver;
use super::well_known::WellKnownFetcher;

/// 协议解析时可用的网络能力
#[async_trait]
pub trait ResolveContext: Send + Sync {
    /// 查询 TXT 记录并用 `txt_regex` 的捕获组提取 key
    async fn dns_txt_record(&self, domain: &str, txt_regex: &Regex) -> Result<Option<Answer>>;

    /// 抓取 `/.well-known/<schema>` 文档
    async fn fetch_well_known(
        &self,
        domain: &str,
        schema: &str,
        key_regex: &Regex,
        redirects: usize,
    ) -> Result<Option<Answer>>;

    fn well_known_enabled(&self) -> bool {
        true
    }
}

/// 单次解析的上下文，取消信号会传递到其中每一次网络请求
pub struct HttpResolveContext<'a> {
    pub transport: &'a dyn Transport,
    pub system: &'a dyn SystemTxtResolver,
    pub providers: &'a [String],
    pub user_agent: &'a str,
    pub cors_warning: bool,
    pub well_known: bool,
    pub signal: Option<&'a CancellationToken>,
}

#[async_trait]
impl ResolveContext for HttpResolveContext<'_> {
    async fn dns_txt_record(&self, domain: &str, txt_regex: &Regex) -> Result<Option<Answer>> {
        DohChain {
            transport: self.transport,
            system: self.system,
            providers: self.providers,
            user_agent: self.user_agent,
        }
        .resolve_txt(domain, txt_regex, self.signal)
        .await
    }

    async fn fetch_well_known(
        &self,
        domain: &str,
        schema: &str,
        key_regex: &Regex,
        redirects: usize,
    ) -> Result<Option<Answer>> {
        WellKnownFetcher {
            transport: self.transport,
            cors_warning: self.cors_warning,
        }
        .fetch(domain, schema, key_regex, redirects, self.signal)
        .await
    }

    fn well_known_enabled(&self) -> bool {
        self.well_known
    }
}
