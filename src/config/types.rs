use regex::Regex;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::common::error::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LookupConfig {
    /// 实例默认协议
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// 优先使用的 DoH 服务，缺省为 `doh_lookups` 的第一个
    #[serde(default)]
    pub doh_lookup: Option<String>,
    #[serde(default = "default_doh_lookups")]
    pub doh_lookups: Vec<String>,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// 覆盖协议自带的 key 格式，必须含捕获组
    #[serde(default)]
    pub key_regex: Option<String>,
    /// 覆盖协议自带的 TXT 格式，必须含捕获组
    #[serde(default)]
    pub txt_regex: Option<String>,
    /// 记录没有 TTL 时使用（秒）
    #[serde(default = "default_ttl")]
    pub ttl: f64,
    #[serde(default = "default_min_ttl")]
    pub min_ttl: f64,
    #[serde(default = "default_max_ttl")]
    pub max_ttl: f64,
    /// 设置后解析失败也会缓存（秒）
    #[serde(default)]
    pub negative_ttl: Option<f64>,
    #[serde(default = "default_true")]
    pub cors_warning: bool,
    #[serde(default)]
    pub no_well_known: bool,
    #[serde(default)]
    pub allow_localhost: bool,
    /// 内存缓存条目上限，超出时先清过期再淘汰最久未用
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            protocol: default_protocol(),
            doh_lookup: None,
            doh_lookups: default_doh_lookups(),
            user_agent: default_user_agent(),
            key_regex: None,
            txt_regex: None,
            ttl: default_ttl(),
            min_ttl: default_min_ttl(),
            max_ttl: default_max_ttl(),
            negative_ttl: None,
            cors_warning: true,
            no_well_known: false,
            allow_localhost: false,
            max_entries: default_max_entries(),
        }
    }
}

impl LookupConfig {
    pub fn validate(&self) -> Result<()> {
        if self.protocol.is_empty() {
            return Err(Error::Argument("protocol must not be empty".into()));
        }
        if self.providers().is_empty() {
            return Err(Error::Argument("at least one DoH provider is required".into()));
        }
        for provider in self.providers() {
            let url = reqwest::Url::parse(&provider)
                .map_err(|e| Error::Argument(format!("invalid DoH provider '{}': {}", provider, e)))?;
            if !matches!(url.scheme(), "https" | "http") {
                return Err(Error::Argument(format!(
                    "DoH provider '{}' must be an http(s) url",
                    provider
                )));
            }
        }
        self.key_pattern()?;
        self.txt_pattern()?;

        for (name, value) in [("ttl", self.ttl), ("min-ttl", self.min_ttl), ("max-ttl", self.max_ttl)] {
            check_seconds(name, value)?;
        }
        if let Some(negative) = self.negative_ttl {
            check_seconds("negative-ttl", negative)?;
        }
        if self.max_entries == 0 {
            return Err(Error::Argument("max-entries must be at least 1".into()));
        }
        if self.min_ttl > self.max_ttl {
            return Err(Error::Argument(format!(
                "min-ttl ({}) is larger than max-ttl ({})",
                self.min_ttl, self.max_ttl
            )));
        }
        Ok(())
    }

    /// 实际查询顺序：`doh_lookup` 在前，其余按 `doh_lookups` 顺序
    pub fn providers(&self) -> Vec<String> {
        let mut providers = Vec::with_capacity(self.doh_lookups.len() + 1);
        if let Some(active) = &self.doh_lookup {
            providers.push(active.clone());
        }
        for provider in &self.doh_lookups {
            if !providers.contains(provider) {
                providers.push(provider.clone());
            }
        }
        providers
    }

    pub fn key_pattern(&self) -> Result<Option<Regex>> {
        compile_pattern("key-regex", self.key_regex.as_deref())
    }

    pub fn txt_pattern(&self) -> Result<Option<Regex>> {
        compile_pattern("txt-regex", self.txt_regex.as_deref())
    }
}

fn compile_pattern(name: &str, pattern: Option<&str>) -> Result<Option<Regex>> {
    let Some(pattern) = pattern else {
        return Ok(None);
    };
    let regex = Regex::new(pattern)
        .map_err(|e| Error::Argument(format!("invalid {} '{}': {}", name, pattern, e)))?;
    if regex.captures_len() < 2 {
        return Err(Error::Argument(format!(
            "{} '{}' needs a capture group for the key",
            name, pattern
        )));
    }
    Ok(Some(regex))
}

fn check_seconds(name: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(Error::Argument(format!(
            "{} must be a non-negative number of seconds, got {}",
            name, value
        )));
    }
    Ok(())
}

fn default_protocol() -> String {
    "hyper".to_string()
}

fn default_doh_lookups() -> Vec<String> {
    vec![
        "https://cloudflare-dns.com:443/dns-query".to_string(),
        "https://dns.google:443/resolve".to_string(),
        "https://dns.quad9.net:5053/dns-query".to_string(),
    ]
}

fn default_user_agent() -> String {
    format!("hyperdns/{}", env!("CARGO_PKG_VERSION"))
}

fn default_ttl() -> f64 {
    3600.0
}

fn default_min_ttl() -> f64 {
    30.0
}

fn default_max_ttl() -> f64 {
    7.0 * 24.0 * 3600.0
}

fn default_max_entries() -> usize {
    1000
}

fn default_true() -> bool {
    true
}

/// 单次调用的选项
#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    /// 完全绕过内存与持久缓存（结果仍会写回）
    pub ignore_cache: bool,
    /// 不接受缓存中记录的失败结果
    pub ignore_cached_miss: bool,
    /// 覆盖实例的 `no_well_known`
    pub no_well_known: Option<bool>,
    /// `resolve` 要查询的协议，缺省为全部已注册协议
    pub protocols: Option<Vec<String>>,
    /// 只作用于本次调用；合并到同一次解析的其他调用不受影响
    pub signal: Option<CancellationToken>,
}

impl ResolveOptions {
    pub fn with_signal(signal: CancellationToken) -> Self {
        Self {
            signal: Some(signal),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = LookupConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.providers(), config.doh_lookups);
        assert_eq!(config.min_ttl, 30.0);
        assert_eq!(config.max_ttl, 604800.0);
    }

    #[test]
    fn active_provider_is_tried_first() {
        let config = LookupConfig {
            doh_lookup: Some("https://dns.google:443/resolve".into()),
            ..Default::default()
        };
        let providers = config.providers();
        assert_eq!(providers[0], "https://dns.google:443/resolve");
        assert_eq!(providers.len(), 3);
    }

    #[test]
    fn regex_without_capture_group_is_rejected() {
        let config = LookupConfig {
            key_regex: Some("abcd".into()),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Argument(_))));
        let config = LookupConfig {
            txt_regex: Some("(".into()),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Argument(_))));
    }

    #[test]
    fn ttl_bounds_are_checked() {
        let config = LookupConfig {
            min_ttl: 10.0,
            max_ttl: 5.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        let config = LookupConfig {
            ttl: f64::NAN,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn max_entries_must_be_positive() {
        let config = LookupConfig {
            max_entries: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Argument(_))));
        assert_eq!(LookupConfig::default().max_entries, 1000);
    }

    #[test]
    fn bad_provider_is_rejected() {
        let config = LookupConfig {
            doh_lookups: vec!["ftp://dns.example".into()],
            ..Default::default()
        };
        assert!(config.validate().is_err());
        let config = LookupConfig {
            doh_lookups: vec![],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn yaml_config() {
        let yaml = r#"
protocol: cabal
min-ttl: 0
doh-lookups:
  - https://dns.example/query
cors-warning: false
max-entries: 16
"#;
        let config: LookupConfig = serde_yml::from_str(yaml).unwrap();
        assert_eq!(config.protocol, "cabal");
        assert_eq!(config.min_ttl, 0.0);
        assert_eq!(config.ttl, 3600.0);
        assert!(!config.cors_warning);
        assert_eq!(config.max_entries, 16);
        assert_eq!(config.providers(), vec!["https://dns.example/query".to_string()]);
    }
}
