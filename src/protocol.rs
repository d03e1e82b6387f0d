//! Protocol registry: key syntax and key-extraction rules per schema.
//!
//! A protocol is plain data (`schema`, key pattern, TXT pattern, well-known
//! document name) resolved by one shared routine. New protocols are added with
//! [`ProtocolRegistry::register`].

use std::collections::HashMap;

use regex::Regex;
use tracing::debug;

use crate::common::error::{Error, Result};
use crate::dns::context::ResolveContext;

/// Maximum redirects followed while fetching a well-known document.
pub const WELL_KNOWN_REDIRECTS: usize = 6;

const HEX_KEY: &str = "[0-9a-f]{64}";

/// A candidate answer. `ttl == None` means the source carried no TTL and the
/// caller applies its configured default.
#[derive(Debug, Clone, PartialEq)]
pub struct Answer {
    pub key: String,
    pub ttl: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct Protocol {
    schema: String,
    key_regex: Regex,
    txt_regex: Regex,
    well_known: String,
}

impl Protocol {
    /// Build a protocol from explicit patterns. Both patterns must carry a
    /// capture group holding the key.
    pub fn new(schema: &str, key_regex: Regex, txt_regex: Regex) -> Result<Self> {
        if schema.is_empty() {
            return Err(Error::Argument("protocol schema must not be empty".into()));
        }
        require_capture(&key_regex, "key")?;
        require_capture(&txt_regex, "txt")?;
        Ok(Self {
            schema: schema.to_string(),
            key_regex,
            txt_regex,
            well_known: schema.to_string(),
        })
    }

    /// `<schema>key=<64 hex>` TXT records, keys optionally written as
    /// `<schema>:<key>` or `<schema>://<key>`.
    pub fn keyed(schema: &str) -> Result<Self> {
        Self::keyed_with_aliases(schema, &[])
    }

    /// Like [`Protocol::keyed`] but also accepting `<alias>key=` TXT records
    /// and `<alias>://` key prefixes.
    pub fn keyed_with_aliases(schema: &str, aliases: &[&str]) -> Result<Self> {
        let schemas = std::iter::once(schema)
            .chain(aliases.iter().copied())
            .map(regex::escape)
            .collect::<Vec<_>>();
        let prefixes = schemas
            .iter()
            .map(|s| format!("{}key", s))
            .collect::<Vec<_>>()
            .join("|");
        let schemas = schemas.join("|");
        let key_regex = Regex::new(&format!("(?i)^(?:(?:{schemas}):)?(?://)?({HEX_KEY})$"))?;
        let txt_regex = Regex::new(&format!(
            r#"(?i)^\s*"?(?:{prefixes})=({HEX_KEY})"?\s*$"#
        ))?;
        Self::new(schema, key_regex, txt_regex)
    }

    /// `did:<schema>:<64 hex>` style protocols.
    pub fn did(schema: &str) -> Result<Self> {
        let escaped = regex::escape(schema);
        let key_regex = Regex::new(&format!("(?i)^(?:did:{escaped}:)?({HEX_KEY})$"))?;
        let txt_regex = Regex::new(&format!(
            r#"(?i)^\s*"?did:{escaped}:({HEX_KEY})"?\s*$"#
        ))?;
        Self::new(schema, key_regex, txt_regex)
    }

    /// Publish the well-known document under a different name than the schema.
    pub fn with_well_known(mut self, name: &str) -> Self {
        self.well_known = name.to_string();
        self
    }

    pub fn with_key_regex(mut self, key_regex: Regex) -> Result<Self> {
        require_capture(&key_regex, "key")?;
        self.key_regex = key_regex;
        Ok(self)
    }

    pub fn with_txt_regex(mut self, txt_regex: Regex) -> Result<Self> {
        require_capture(&txt_regex, "txt")?;
        self.txt_regex = txt_regex;
        Ok(self)
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn key_regex(&self) -> &Regex {
        &self.key_regex
    }

    pub fn txt_regex(&self) -> &Regex {
        &self.txt_regex
    }

    pub fn well_known(&self) -> &str {
        &self.well_known
    }

    /// Extract the key if `input` already is one.
    pub fn match_key(&self, input: &str) -> Option<String> {
        capture_key(&self.key_regex, input)
    }

    pub fn is_key(&self, input: &str) -> bool {
        self.match_key(input).is_some()
    }

    /// Resolve a name or raw key: raw key first, then DNS TXT, then the
    /// well-known document. `Ok(None)` means every step came back empty.
    pub async fn resolve(&self, ctx: &dyn ResolveContext, name: &str) -> Result<Option<Answer>> {
        if let Some(key) = self.match_key(name) {
            return Ok(Some(Answer { key, ttl: None }));
        }

        if let Some(answer) = ctx.dns_txt_record(name, &self.txt_regex).await? {
            return Ok(Some(answer));
        }

        if !ctx.well_known_enabled() {
            debug!(protocol = %self.schema, name = name, "well-known lookup disabled");
            return Ok(None);
        }

        ctx.fetch_well_known(name, &self.well_known, &self.key_regex, WELL_KNOWN_REDIRECTS)
            .await
    }
}

/// First capture group of `regex` in `input`.
pub fn capture_key(regex: &Regex, input: &str) -> Option<String> {
    regex
        .captures(input)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

fn require_capture(regex: &Regex, what: &str) -> Result<()> {
    // captures_len counts the whole match as group 0
    if regex.captures_len() < 2 {
        return Err(Error::Argument(format!(
            "{} regex '{}' needs a capture group for the key",
            what,
            regex.as_str()
        )));
    }
    Ok(())
}

/// Named set of protocols.
#[derive(Debug, Clone)]
pub struct ProtocolRegistry {
    protocols: HashMap<String, Protocol>,
}

impl ProtocolRegistry {
    pub fn empty() -> Self {
        Self {
            protocols: HashMap::new(),
        }
    }

    /// Register a protocol, returning the one it replaced.
    pub fn register(&mut self, protocol: Protocol) -> Option<Protocol> {
        self.protocols
            .insert(protocol.schema().to_string(), protocol)
    }

    pub fn get(&self, schema: &str) -> Option<&Protocol> {
        self.protocols.get(schema)
    }

    pub fn contains(&self, schema: &str) -> bool {
        self.protocols.contains_key(schema)
    }

    pub fn schemas(&self) -> Vec<&str> {
        let mut schemas: Vec<&str> = self.protocols.keys().map(|k| k.as_str()).collect();
        schemas.sort_unstable();
        schemas
    }
}

impl Default for ProtocolRegistry {
    /// hyper, dat, cabal and ara.
    fn default() -> Self {
        let mut registry = Self::empty();
        let builtins = [
            // hyper still uses the dat-era TXT record and well-known document
            Protocol::keyed_with_aliases("hyper", &["dat"]).map(|p| p.with_well_known("dat")),
            Protocol::keyed("dat"),
            Protocol::keyed("cabal"),
            Protocol::did("ara"),
        ];
        for protocol in builtins.into_iter().flatten() {
            registry.register(protocol);
        }
        registry
    }
}
