use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use tracing::debug;

use crate::common::error::{Error, Result};
use crate::common::http::{ReqwestTransport, Transport};
use crate::config::{LookupConfig, ResolveOptions};
use crate::protocol::{Answer, Protocol, ProtocolRegistry};
use crate::url::KeyUrl;

use super::context::HttpResolveContext;
use super::system::{HickoryTxtResolver, SystemTxtResolver};
use super::{found_keys, KeyResolver};

/// 名称校验后的解析目标
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// 输入本身就是 key，无需网络
    Key(String),
    /// 需要解析的域名（已小写、去掉末尾的点）
    Domain(String),
}

/// 无缓存的解析引擎
///
/// 构造时校验配置，key / TXT 格式有误时在任何网络请求之前就失败。
pub struct Lookup {
    config: LookupConfig,
    providers: Vec<String>,
    registry: ProtocolRegistry,
    transport: Arc<dyn Transport>,
    system: Arc<dyn SystemTxtResolver>,
}

impl Lookup {
    /// reqwest 传输层 + 系统 DNS 兜底
    pub fn new(config: LookupConfig) -> Result<Self> {
        let transport = ReqwestTransport::new().map_err(|e| Error::Http(e.to_string()))?;
        Self::with_parts(
            config,
            ProtocolRegistry::default(),
            Arc::new(transport),
            Arc::new(HickoryTxtResolver::new()),
        )
    }

    pub fn with_parts(
        config: LookupConfig,
        mut registry: ProtocolRegistry,
        transport: Arc<dyn Transport>,
        system: Arc<dyn SystemTxtResolver>,
    ) -> Result<Self> {
        config.validate()?;

        let mut protocol = registry
            .get(&config.protocol)
            .cloned()
            .ok_or_else(|| Error::Argument(format!("unknown protocol '{}'", config.protocol)))?;
        // key-regex / txt-regex 只覆盖实例默认协议
        if let Some(key_regex) = config.key_pattern()? {
            protocol = protocol.with_key_regex(key_regex)?;
        }
        if let Some(txt_regex) = config.txt_pattern()? {
            protocol = protocol.with_txt_regex(txt_regex)?;
        }
        registry.register(protocol);

        Ok(Self {
            providers: config.providers(),
            config,
            registry,
            transport,
            system,
        })
    }

    pub fn config(&self) -> &LookupConfig {
        &self.config
    }

    pub fn registry(&self) -> &ProtocolRegistry {
        &self.registry
    }

    pub fn protocol_for(&self, schema: &str) -> Result<&Protocol> {
        self.registry
            .get(schema)
            .ok_or_else(|| Error::Argument(format!("unknown protocol '{}'", schema)))
    }

    /// 校验输入：原始 key、完整 url 或 FQDN
    pub fn target(&self, protocol: &str, name: &str) -> Result<Target> {
        let handler = self.protocol_for(protocol)?;
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::Argument("name must not be empty".into()));
        }
        if let Some(key) = handler.match_key(name) {
            return Ok(Target::Key(key));
        }

        let url = KeyUrl::parse(name)?;
        if let Some(key) = handler.match_key(&url.hostname) {
            return Ok(Target::Key(key));
        }

        let domain = url.hostname.trim_end_matches('.').to_ascii_lowercase();
        if domain == "localhost" && self.config.allow_localhost {
            return Ok(Target::Domain(domain));
        }
        if !is_fqdn(&domain) {
            return Err(Error::NotFqdn(name.to_string()));
        }
        Ok(Target::Domain(domain))
    }

    /// 单协议解析，`Ok(None)` 表示所有途径都没有结果
    pub async fn lookup(&self, protocol: &str, name: &str, opts: &ResolveOptions) -> Result<Option<Answer>> {
        match self.target(protocol, name)? {
            Target::Key(key) => Ok(Some(Answer { key, ttl: None })),
            Target::Domain(domain) => self.lookup_domain(protocol, &domain, opts).await,
        }
    }

    /// 本次调用涉及的协议：`opts.protocols` 去重排序，缺省为全部已注册协议
    pub fn protocols(&self, opts: &ResolveOptions) -> Result<Vec<String>> {
        let Some(requested) = &opts.protocols else {
            return Ok(self.registry.schemas().into_iter().map(str::to_string).collect());
        };
        if requested.is_empty() {
            return Err(Error::Argument("protocol list must not be empty".into()));
        }
        let mut schemas = Vec::with_capacity(requested.len());
        for schema in requested {
            self.protocol_for(schema)?;
            if !schemas.contains(schema) {
                schemas.push(schema.clone());
            }
        }
        schemas.sort();
        Ok(schemas)
    }

    /// 多协议解析时的缓存名：任一协议把输入当作 key 时返回 `None`（不走缓存）
    pub fn domain_for(&self, schemas: &[String], name: &str) -> Result<Option<String>> {
        let mut domain = None;
        let mut first_error = None;
        for schema in schemas {
            match self.target(schema, name) {
                Ok(Target::Key(_)) => return Ok(None),
                Ok(Target::Domain(d)) => domain = Some(d),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        match (domain, first_error) {
            (Some(domain), _) => Ok(Some(domain)),
            (None, Some(e)) => Err(e),
            (None, None) => Err(Error::Argument("protocol list must not be empty".into())),
        }
    }

    /// 各协议并发解析，互不影响
    ///
    /// 单个协议出错（包括重定向超限）记为 `None`；取消会立即返回 `Aborted`。
    /// 所有协议都没有结果且至少一个出错时，返回第一个错误。
    pub async fn lookup_protocols(
        &self,
        schemas: &[String],
        name: &str,
        opts: &ResolveOptions,
    ) -> Result<HashMap<String, Option<Answer>>> {
        let attempts = schemas.iter().map(|schema| async move {
            let answer = match self.target(schema, name) {
                Ok(Target::Key(key)) => Ok(Some(Answer { key, ttl: None })),
                Ok(Target::Domain(domain)) => self.lookup_domain(schema, &domain, opts).await,
                Err(e) => Err(e),
            };
            (schema.clone(), answer)
        });

        let mut answers = HashMap::with_capacity(schemas.len());
        let mut first_error = None;
        for (schema, answer) in join_all(attempts).await {
            match answer {
                Ok(answer) => {
                    answers.insert(schema, answer);
                }
                Err(Error::Aborted) => return Err(Error::Aborted),
                Err(e) => {
                    debug!(protocol = %schema, name = name, error = %e, "protocol attempt failed");
                    first_error.get_or_insert(e);
                    answers.insert(schema, None);
                }
            }
        }

        if answers.values().all(Option::is_none) {
            if let Some(e) = first_error {
                return Err(e);
            }
        }
        Ok(answers)
    }

    /// 对已校验过的域名执行网络解析
    pub async fn lookup_domain(
        &self,
        protocol: &str,
        domain: &str,
        opts: &ResolveOptions,
    ) -> Result<Option<Answer>> {
        let handler = self.protocol_for(protocol)?;
        let ctx = HttpResolveContext {
            transport: self.transport.as_ref(),
            system: self.system.as_ref(),
            providers: &self.providers,
            user_agent: &self.config.user_agent,
            cors_warning: self.config.cors_warning,
            well_known: !opts.no_well_known.unwrap_or(self.config.no_well_known),
            signal: opts.signal.as_ref(),
        };
        let answer = handler.resolve(&ctx, domain).await?;
        debug!(
            protocol = protocol,
            domain = domain,
            found = answer.is_some(),
            "lookup finished"
        );
        Ok(answer)
    }
}

#[async_trait]
impl KeyResolver for Lookup {
    fn protocol(&self) -> &str {
        &self.config.protocol
    }

    fn has_protocol(&self, schema: &str) -> bool {
        self.registry.contains(schema)
    }

    async fn resolve(&self, name: &str, opts: &ResolveOptions) -> Result<HashMap<String, Option<String>>> {
        let schemas = self.protocols(opts)?;
        let answers = self.lookup_protocols(&schemas, name, opts).await?;
        found_keys(
            name,
            answers
                .into_iter()
                .map(|(schema, answer)| (schema, answer.map(|a| a.key)))
                .collect(),
        )
    }

    async fn resolve_protocol(&self, protocol: &str, name: &str, opts: &ResolveOptions) -> Result<String> {
        self.lookup(protocol, name, opts)
            .await?
            .map(|answer| answer.key)
            .ok_or_else(|| Error::RecordNotFound(name.to_string()))
    }
}

/// 至少两段、每段非空且只含字母数字、`-`、`_`
fn is_fqdn(domain: &str) -> bool {
    let labels: Vec<&str> = domain.split('.').collect();
    labels.len() >= 2
        && labels.iter().all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && label
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        })
}
