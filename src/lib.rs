pub mod common;
pub mod config;
pub mod dns;
pub mod protocol;
pub mod url;

pub use common::error::{Error, ErrorKind, Result};
pub use config::{LookupConfig, ResolveOptions};
pub use dns::{CachedLookup, JsonFileCache, KeyResolver, Lookup, PersistentCache};
pub use protocol::{Protocol, ProtocolRegistry};
pub use url::KeyUrl;
