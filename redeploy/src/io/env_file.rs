//! Dotenv-style configuration source for the worker.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

const PLACEHOLDER_HEADER: &str = "# Generated by redeploy: the configuration file was missing.\n\
# Fill in every value below, then run the deployment again.\n";

/// Parse `path` into an ordered key/value map.
pub fn read_env_file(path: &Path) -> Result<BTreeMap<String, String>> {
    let iter =
        dotenvy::from_path_iter(path).with_context(|| format!("open {}", path.display()))?;
    let mut values = BTreeMap::new();
    for item in iter {
        let (key, value) = item.with_context(|| format!("parse {}", path.display()))?;
        values.insert(key, value);
    }
    Ok(values)
}

/// Write a file declaring every key with an empty value.
pub fn write_placeholder_env(path: &Path, keys: &[String]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let mut buf = String::from(PLACEHOLDER_HEADER);
    for key in keys {
        buf.push_str(key);
        buf.push_str("=\n");
    }
    fs::write(path, buf).with_context(|| format!("write {}", path.display()))
}
