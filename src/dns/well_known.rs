use regex::Regex;
use reqwest::Url;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::common::error::{Error, Result};
use crate::common::http::Transport;
use crate::protocol::{capture_key, Answer};

use super::with_signal;

const CORS_HEADER: &str = "access-control-allow-origin";

/// `https://<domain>/.well-known/<schema>` 文档抓取
///
/// 文档首行是 key，其后为 `key=value` 行，其中 `ttl=<秒>` 设置 TTL。
pub struct WellKnownFetcher<'a> {
    pub transport: &'a dyn Transport,
    pub cors_warning: bool,
}

impl WellKnownFetcher<'_> {
    pub async fn fetch(
        &self,
        domain: &str,
        schema: &str,
        key_regex: &Regex,
        redirects: usize,
        signal: Option<&CancellationToken>,
    ) -> Result<Option<Answer>> {
        let start = well_known_url(domain, schema);
        let mut url = start.clone();
        let mut followed = 0;

        loop {
            let response = with_signal(signal, async {
                self.transport
                    .get(&url, &[("accept", "text/plain")])
                    .await
                    .map_err(|e| Error::Http(e.to_string()))
            })
            .await?;

            if response.is_redirect() {
                let location = response
                    .location()
                    .ok_or_else(|| Error::Http(format!("redirect without location from {}", url)))?;
                if followed >= redirects {
                    return Err(Error::RedirectLimit {
                        url: start,
                        limit: redirects,
                    });
                }
                followed += 1;
                let next = Url::parse(&url)
                    .and_then(|base| base.join(location))
                    .map_err(|e| Error::Http(format!("bad redirect '{}': {}", location, e)))?;
                debug!(from = %url, to = %next, followed = followed, "following well-known redirect");
                url = next.to_string();
                continue;
            }

            if !response.is_success() {
                debug!(url = %url, status = response.status, "no well-known document");
                return Ok(None);
            }

            if self.cors_warning && response.header(CORS_HEADER).is_none() {
                warn!(
                    url = %url,
                    "well-known response is missing the 'access-control-allow-origin: *' header, browsers will not be able to resolve it"
                );
            }

            return Ok(parse_document(&response.body, key_regex));
        }
    }
}

pub fn well_known_url(domain: &str, schema: &str) -> String {
    format!("https://{}/.well-known/{}", domain.trim_end_matches('.'), schema)
}

/// 解析 well-known 文档；无法解析的 ttl 行会被忽略
pub fn parse_document(body: &str, key_regex: &Regex) -> Option<Answer> {
    let mut lines = body.lines();
    let key = capture_key(key_regex, lines.next()?.trim())?;

    let mut ttl = None;
    for line in lines {
        let Some((name, value)) = line.split_once('=') else {
            continue;
        };
        if name.trim() != "ttl" {
            continue;
        }
        match value.trim().parse::<f64>() {
            Ok(secs) if secs.is_finite() && secs >= 0.0 => ttl = Some(secs),
            _ => debug!(value = value, "ignoring invalid ttl in well-known document"),
        }
    }

    Some(Answer { key, ttl })
}
