pub mod types;

use anyhow::Result;
use std::path::Path;

pub use types::{LookupConfig, ResolveOptions};

/// 读取并校验 YAML 配置文件
pub fn load_config(path: &str) -> Result<LookupConfig> {
    let content = std::fs::read_to_string(Path::new(path))?;
    let config: LookupConfig = serde_yml::from_str(&content)?;
    config.validate()?;
    Ok(config)
}
