//! well-known 文档回退

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;

use hyperdns::common::http::{HttpResponse, Transport};
use hyperdns::dns::cache::now_ms;
use hyperdns::dns::system::NoSystemResolver;
use hyperdns::dns::{CachedLookup, KeyResolver, Lookup};
use hyperdns::{Error, LookupConfig, ProtocolRegistry, ResolveOptions};

const KEY: &str = "14bc77d788fdaf07b89b28e9d276e47f2e44011f4adb981921056e1b3b40e99e";

/// DoH 请求一律返回空答案，well-known 按 url 查表
struct Site {
    pages: HashMap<String, HttpResponse>,
    hits: Mutex<Vec<String>>,
}

#[async_trait]
impl Transport for Site {
    async fn get(&self, url: &str, _headers: &[(&str, &str)]) -> Result<HttpResponse> {
        self.hits.lock().unwrap().push(url.to_string());
        if url.starts_with("https://doh.test/") {
            return Ok(HttpResponse::new(200, r#"{"Status":3}"#));
        }
        Ok(self
            .pages
            .get(url)
            .cloned()
            .unwrap_or_else(|| HttpResponse::new(404, "not found")))
    }
}

fn site(pages: Vec<(&str, HttpResponse)>) -> Arc<Site> {
    Arc::new(Site {
        pages: pages.into_iter().map(|(u, r)| (u.to_string(), r)).collect(),
        hits: Mutex::new(Vec::new()),
    })
}

fn resolver(site: Arc<Site>, config: LookupConfig) -> CachedLookup {
    let config = LookupConfig {
        doh_lookups: vec!["https://doh.test/dns-query".into()],
        allow_localhost: true,
        min_ttl: 0.0,
        ..config
    };
    let lookup = Lookup::with_parts(config, ProtocolRegistry::default(), site, Arc::new(NoSystemResolver)).unwrap();
    CachedLookup::from_lookup(lookup, None)
}

fn document(body: String) -> HttpResponse {
    HttpResponse::new(200, body).with_header("Access-Control-Allow-Origin", "*")
}

#[tokio::test]
async fn document_ttl_is_used() {
    let site = site(vec![(
        "https://localhost/.well-known/dat",
        document(format!("dat://{}\nttl=10\n", KEY)),
    )]);
    let dns = resolver(site.clone(), LookupConfig::default());

    let before = now_ms();
    let entry = dns
        .lookup_entry("hyper", "localhost", &ResolveOptions::default())
        .await
        .unwrap();
    assert_eq!(entry.key("hyper"), Some(Some(KEY)));
    assert!(entry.expires >= before + 10_000.0);
    assert!(entry.expires <= now_ms() + 10_000.0);

    let hits = site.hits.lock().unwrap().clone();
    assert_eq!(hits.len(), 2);
    assert!(hits[0].starts_with("https://doh.test/dns-query?name=localhost."));
    assert_eq!(hits[1], "https://localhost/.well-known/dat");
}

#[tokio::test]
async fn invalid_ttl_falls_back_to_default() {
    let site = site(vec![(
        "https://localhost/.well-known/cabal",
        document(format!("cabal:{}\nttl=soon\n", KEY)),
    )]);
    let dns = resolver(
        site,
        LookupConfig {
            ttl: 120.0,
            ..Default::default()
        },
    );

    let before = now_ms();
    let entry = dns
        .lookup_entry("cabal", "localhost", &ResolveOptions::default())
        .await
        .unwrap();
    assert_eq!(entry.key("cabal"), Some(Some(KEY)));
    assert!(entry.expires >= before + 120_000.0);
}

#[tokio::test]
async fn redirects_are_followed() {
    let site = site(vec![
        (
            "https://foo.com/.well-known/dat",
            HttpResponse::new(302, "").with_header("Location", "https://bar.com/.well-known/dat"),
        ),
        ("https://bar.com/.well-known/dat", document(KEY.to_string())),
    ]);
    let dns = resolver(site, LookupConfig::default());
    assert_eq!(dns.resolve_name("foo.com", &ResolveOptions::default()).await.unwrap(), KEY);
}

#[tokio::test]
async fn redirect_loops_fail() {
    let site = site(vec![(
        "https://foo.com/.well-known/dat",
        HttpResponse::new(301, "").with_header("Location", "/.well-known/dat"),
    )]);
    let dns = resolver(site.clone(), LookupConfig::default());

    let err = dns.resolve_name("foo.com", &ResolveOptions::default()).await.unwrap_err();
    assert!(matches!(err, Error::RedirectLimit { limit: 6, .. }));
    // 1 次 DoH + 首次请求 + 6 次跟随
    assert_eq!(site.hits.lock().unwrap().len(), 8);
    assert_eq!(dns.in_flight(), 0);
}

#[tokio::test]
async fn well_known_can_be_disabled_per_call() {
    let site = site(vec![("https://foo.com/.well-known/dat", document(KEY.to_string()))]);
    let dns = resolver(site.clone(), LookupConfig::default());

    let opts = ResolveOptions {
        no_well_known: Some(true),
        ..Default::default()
    };
    let err = dns.resolve_name("foo.com", &opts).await.unwrap_err();
    assert_eq!(err, Error::RecordNotFound("foo.com".into()));
    assert_eq!(site.hits.lock().unwrap().len(), 1);

    assert_eq!(dns.resolve_name("foo.com", &ResolveOptions::default()).await.unwrap(), KEY);
}

#[tokio::test]
async fn redirect_loop_only_fails_its_own_protocol() {
    // hyper 与 dat 共用 /.well-known/dat，这里陷入重定向循环；cabal 正常
    let site = site(vec![
        (
            "https://foo.com/.well-known/dat",
            HttpResponse::new(301, "").with_header("Location", "/.well-known/dat"),
        ),
        ("https://foo.com/.well-known/cabal", document(format!("cabal://{}", KEY))),
    ]);
    let dns = resolver(site, LookupConfig::default());

    let keys = dns.resolve("foo.com", &ResolveOptions::default()).await.unwrap();
    assert_eq!(keys.len(), 4);
    assert_eq!(keys["cabal"].as_deref(), Some(KEY));
    assert_eq!(keys["hyper"], None);
    assert_eq!(keys["dat"], None);
    assert_eq!(keys["ara"], None);

    // 整个结果作为一条缓存记录
    let entry = dns.cached("foo.com").unwrap();
    assert_eq!(entry.keys.len(), 4);
    assert_eq!(entry.key("hyper"), Some(None));
    assert_eq!(dns.in_flight(), 0);
}

#[tokio::test]
async fn redirect_loop_alone_surfaces_the_error() {
    let site = site(vec![(
        "https://foo.com/.well-known/dat",
        HttpResponse::new(301, "").with_header("Location", "/.well-known/dat"),
    )]);
    let dns = resolver(site, LookupConfig::default());
    let opts = ResolveOptions {
        protocols: Some(vec!["hyper".into(), "dat".into()]),
        ..Default::default()
    };
    let err = dns.resolve("foo.com", &opts).await.unwrap_err();
    assert!(matches!(err, Error::RedirectLimit { .. }));
    assert!(dns.cached("foo.com").is_none());
}
