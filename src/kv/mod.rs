// Module: Kv
// Client seam for the external key-value store consumed by the eager
// resolution phase. The surrounding system wires the real client; the
// in-memory implementation backs tests and file-fed CLI runs.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

/// External key-value store client.
///
/// Values are raw strings or JSON-encoded documents; the resolver decodes
/// and descends as needed.
#[async_trait]
pub trait KvClient: Send + Sync {
    async fn get(&self, key: &str) -> Result<String>;
    async fn lindex(&self, key: &str, index: usize) -> Result<String>;
}

#[derive(Debug, Clone)]
enum Entry {
    Plain(String),
    List(Vec<String>),
}

/// In-memory implementation of [`KvClient`].
#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.entries
            .write()
            .await
            .insert(key.into(), Entry::Plain(value.into()));
    }

    pub async fn set_list(&self, key: impl Into<String>, values: Vec<String>) {
        self.entries
            .write()
            .await
            .insert(key.into(), Entry::List(values));
    }

    /// Loads entries from a JSON object file. String fields become plain
    /// entries, arrays become lists, anything else is stored as its JSON
    /// representation.
    pub async fn load_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read key-value data file {:?}", path))?;
        let doc: Value = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse key-value data file {:?}", path))?;

        let map = doc
            .as_object()
            .ok_or_else(|| anyhow!("Key-value data file {:?} must be a JSON object", path))?;

        let kv = Self::new();
        for (key, value) in map {
            match value {
                Value::String(s) => kv.set(key.clone(), s.clone()).await,
                Value::Array(items) => {
                    let list = items
                        .iter()
                        .map(|item| match item {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        })
                        .collect();
                    kv.set_list(key.clone(), list).await;
                }
                other => kv.set(key.clone(), other.to_string()).await,
            }
        }
        Ok(kv)
    }
}

#[async_trait]
impl KvClient for MemoryKv {
    async fn get(&self, key: &str) -> Result<String> {
        match self.entries.read().await.get(key) {
            Some(Entry::Plain(value)) => Ok(value.clone()),
            Some(Entry::List(_)) => Err(anyhow!("key '{}' holds a list, use an index", key)),
            None => Err(anyhow!("key '{}' not found", key)),
        }
    }

    async fn lindex(&self, key: &str, index: usize) -> Result<String> {
        match self.entries.read().await.get(key) {
            Some(Entry::List(values)) => values.get(index).cloned().ok_or_else(|| {
                anyhow!(
                    "index {} out of bounds for key '{}' ({} elements)",
                    index,
                    key,
                    values.len()
                )
            }),
            Some(Entry::Plain(_)) => Err(anyhow!("key '{}' is not a list", key)),
            None => Err(anyhow!("key '{}' not found", key)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_plain_value() {
        let kv = MemoryKv::new();
        kv.set("env:base_url", "https://staging.example.com").await;
        assert_eq!(
            kv.get("env:base_url").await.unwrap(),
            "https://staging.example.com"
        );
    }

    #[tokio::test]
    async fn get_missing_key_fails() {
        let kv = MemoryKv::new();
        assert!(kv.get("nope").await.is_err());
    }

    #[tokio::test]
    async fn lindex_reads_list_positions() {
        let kv = MemoryKv::new();
        kv.set_list(
            "accounts",
            vec!["alice".to_string(), "bob".to_string()],
        )
        .await;
        assert_eq!(kv.lindex("accounts", 0).await.unwrap(), "alice");
        assert_eq!(kv.lindex("accounts", 1).await.unwrap(), "bob");
        assert!(kv.lindex("accounts", 2).await.is_err());
    }

    #[tokio::test]
    async fn lindex_on_plain_value_fails() {
        let kv = MemoryKv::new();
        kv.set("single", "value").await;
        assert!(kv.lindex("single", 0).await.is_err());
    }
}
