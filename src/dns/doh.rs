use std::cmp::Ordering;

use regex::Regex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::common::error::{Error, Result};
use crate::common::http::Transport;
use crate::protocol::{capture_key, Answer};

use super::system::SystemTxtResolver;
use super::with_signal;

const DNS_JSON: &str = "application/dns-json";

/// DoH 解析链：按顺序尝试各 DoH 服务，全部失败后走一次系统 DNS
pub struct DohChain<'a> {
    pub transport: &'a dyn Transport,
    pub system: &'a dyn SystemTxtResolver,
    pub providers: &'a [String],
    pub user_agent: &'a str,
}

impl DohChain<'_> {
    /// `Ok(None)` 表示所有来源都没有可用记录；只有取消会返回错误
    pub async fn resolve_txt(
        &self,
        domain: &str,
        txt_regex: &Regex,
        signal: Option<&CancellationToken>,
    ) -> Result<Option<Answer>> {
        let domain = domain.trim_end_matches('.');

        for provider in self.providers {
            match with_signal(signal, self.query(provider, domain, txt_regex)).await {
                Ok(Some(answer)) => {
                    debug!(domain = domain, provider = %provider, "DoH TXT resolved");
                    return Ok(Some(answer));
                }
                Ok(None) => {
                    debug!(domain = domain, provider = %provider, "DoH provider had no usable answer");
                }
                Err(Error::Aborted) => return Err(Error::Aborted),
                Err(e) => {
                    debug!(domain = domain, provider = %provider, error = %e, "DoH provider failed");
                }
            }
        }

        debug!(domain = domain, "all DoH providers failed, using system DNS");
        let records = with_signal(signal, async {
            self.system
                .resolve_txt(domain)
                .await
                .map_err(|e| Error::Http(e.to_string()))
        })
        .await;
        match records {
            Ok(records) => Ok(best_answer(
                records
                    .iter()
                    .filter_map(|data| capture_key(txt_regex, data))
                    .map(|key| Answer { key, ttl: None }),
            )),
            Err(Error::Aborted) => Err(Error::Aborted),
            Err(e) => {
                debug!(domain = domain, error = %e, "system DNS fallback failed");
                Ok(None)
            }
        }
    }

    async fn query(&self, provider: &str, domain: &str, txt_regex: &Regex) -> Result<Option<Answer>> {
        let url = doh_url(provider, domain);
        let response = self
            .transport
            .get(&url, &[("user-agent", self.user_agent), ("accept", DNS_JSON)])
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        if !response.is_success() {
            return Err(Error::Http(format!("HTTP {} from {}", response.status, url)));
        }
        let body = response
            .json()
            .map_err(|e| Error::Http(format!("invalid DoH response from {}: {}", url, e)))?;
        Ok(select_answer(&body, txt_regex))
    }
}

/// `<provider>?name=<domain>.&type=TXT`
pub fn doh_url(provider: &str, domain: &str) -> String {
    let sep = if provider.contains('?') { '&' } else { '?' };
    format!("{}{}name={}.&type=TXT", provider, sep, domain)
}

/// 从 DoH JSON 中挑出最大的合法 key；非对象、缺少 data、不匹配的条目都会被忽略
pub fn select_answer(body: &Value, txt_regex: &Regex) -> Option<Answer> {
    let answers = body.get("Answer")?.as_array()?;
    best_answer(answers.iter().filter_map(|entry| {
        let entry = entry.as_object()?;
        let data = entry.get("data")?.as_str()?;
        let key = capture_key(txt_regex, data)?;
        let ttl = entry.get("TTL").and_then(Value::as_f64);
        Some(Answer { key, ttl })
    }))
}

fn best_answer(answers: impl Iterator<Item = Answer>) -> Option<Answer> {
    answers.max_by(|a, b| compare_keys(&a.key, &b.key))
}

/// 先比长度再比字典序，对等长 hex key 即数值大小
pub fn compare_keys(a: &str, b: &str) -> Ordering {
    a.len()
        .cmp(&b.len())
        .then_with(|| a.to_ascii_lowercase().cmp(&b.to_ascii_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::http::HttpResponse;
    use crate::protocol::ProtocolRegistry;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::Mutex;

    const KEY: &str = "14bc77d788fdaf07b89b28e9d276e47f2e44011f4adb981921056e1b3b40e99e";

    fn txt_regex() -> Regex {
        ProtocolRegistry::default()
            .get("hyper")
            .unwrap()
            .txt_regex()
            .clone()
    }

    fn key(n: u8) -> String {
        format!("{:064x}", n)
    }

    /// 按 provider 前缀返回预设响应
    struct MockTransport {
        routes: Vec<(String, std::result::Result<HttpResponse, String>)>,
        urls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn get(&self, url: &str, headers: &[(&str, &str)]) -> anyhow::Result<HttpResponse> {
            assert!(headers.contains(&("accept", DNS_JSON)));
            self.urls.lock().unwrap().push(url.to_string());
            for (prefix, res) in &self.routes {
                if url.starts_with(prefix.as_str()) {
                    return res.clone().map_err(|e| anyhow::anyhow!(e));
                }
            }
            anyhow::bail!("no route for {}", url)
        }
    }

    struct MockSystem {
        records: Vec<String>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SystemTxtResolver for MockSystem {
        async fn resolve_txt(&self, _domain: &str) -> anyhow::Result<Vec<String>> {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(self.records.clone())
        }
    }

    fn system(records: Vec<String>) -> MockSystem {
        MockSystem {
            records,
            calls: AtomicUsize::new(0),
        }
    }

    #[test]
    fn doh_url_format() {
        assert_eq!(
            doh_url("https://dns.example/query", "hello.com"),
            "https://dns.example/query?name=hello.com.&type=TXT"
        );
        assert_eq!(
            doh_url("https://dns.example/q?ct=1", "hello.com"),
            "https://dns.example/q?ct=1&name=hello.com.&type=TXT"
        );
    }

    #[test]
    fn largest_key_wins_regardless_of_order() {
        let body = json!({ "Answer": [
            { "data": format!("datkey={}", key(3)), "TTL": 30 },
            { "data": format!("datkey={}", key(1)) },
            { "data": format!("datkey={}", key(2)) },
        ]});
        let answer = select_answer(&body, &txt_regex()).unwrap();
        assert_eq!(answer.key, key(3));
        assert_eq!(answer.ttl, Some(30.0));
    }

    #[test]
    fn unusable_answers_are_ignored() {
        let body = json!({ "Answer": [
            null, "hello", {}, { "data": 5 }, { "data": "something else " },
            { "data": format!("datkey={}", KEY) },
        ]});
        let answer = select_answer(&body, &txt_regex()).unwrap();
        assert_eq!(answer, Answer { key: KEY.into(), ttl: None });

        assert!(select_answer(&json!({}), &txt_regex()).is_none());
        assert!(select_answer(&json!(1), &txt_regex()).is_none());
        assert!(select_answer(&json!({ "Answer": [{}] }), &txt_regex()).is_none());
    }

    #[tokio::test]
    async fn failing_providers_advance_to_next() {
        let ok_body = json!({ "Answer": [{ "data": format!("datkey={}", KEY), "TTL": 10 }] }).to_string();
        let transport = MockTransport {
            routes: vec![
                ("https://a/".into(), Err("connection refused".into())),
                ("https://b/".into(), Ok(HttpResponse::new(400, "not found"))),
                ("https://c/".into(), Ok(HttpResponse::new(200, "not json"))),
                ("https://d/".into(), Ok(HttpResponse::new(200, "{}"))),
                ("https://e/".into(), Ok(HttpResponse::new(200, ok_body))),
            ],
            urls: Mutex::new(Vec::new()),
        };
        let system = system(vec![]);
        let providers: Vec<String> = ["a", "b", "c", "d", "e"]
            .iter()
            .map(|p| format!("https://{}/query", p))
            .collect();
        let chain = DohChain {
            transport: &transport,
            system: &system,
            providers: &providers,
            user_agent: "test",
        };
        let answer = chain.resolve_txt("hello.com", &txt_regex(), None).await.unwrap();
        assert_eq!(answer, Some(Answer { key: KEY.into(), ttl: Some(10.0) }));
        assert_eq!(transport.urls.lock().unwrap().len(), 5);
        assert_eq!(system.calls.load(AtomicOrdering::SeqCst), 0);
    }

    #[tokio::test]
    async fn system_fallback_used_once_when_all_fail() {
        let transport = MockTransport {
            routes: vec![],
            urls: Mutex::new(Vec::new()),
        };
        let providers = vec!["https://a/query".to_string(), "https://b/query".to_string()];

        let found = system(vec!["v=spf1".into(), format!("datkey={}", KEY)]);
        let chain = DohChain {
            transport: &transport,
            system: &found,
            providers: &providers,
            user_agent: "test",
        };
        let answer = chain.resolve_txt("hello.com", &txt_regex(), None).await.unwrap();
        assert_eq!(answer, Some(Answer { key: KEY.into(), ttl: None }));
        assert_eq!(found.calls.load(AtomicOrdering::SeqCst), 1);

        let empty = system(vec![]);
        let chain = DohChain {
            system: &empty,
            ..chain
        };
        assert_eq!(chain.resolve_txt("hello.com", &txt_regex(), None).await.unwrap(), None);
    }

    #[tokio::test]
    async fn cancelled_signal_aborts() {
        let transport = MockTransport {
            routes: vec![],
            urls: Mutex::new(Vec::new()),
        };
        let system = system(vec![]);
        let providers = vec!["https://a/query".to_string()];
        let chain = DohChain {
            transport: &transport,
            system: &system,
            providers: &providers,
            user_agent: "test",
        };
        let token = CancellationToken::new();
        token.cancel();
        let err = chain
            .resolve_txt("hello.com", &txt_regex(), Some(&token))
            .await
            .unwrap_err();
        assert_eq!(err, Error::Aborted);
        assert!(transport.urls.lock().unwrap().is_empty());
    }
}
