//! Persistent configuration store boundary.
//!
//! The engine only needs three operations: load everything at startup, and
//! record each successful add/remove so a restart reconstructs the same
//! registry. [`YamlConfigStore`] is the file-backed implementation: a YAML
//! map from server name to its config.

use std::{collections::BTreeMap, path::PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{
    config::ServerConfig,
    error::{GatewayError, GatewayResult},
};

#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// All persisted `(name, config)` pairs.
    async fn load_all(&self) -> GatewayResult<Vec<(String, ServerConfig)>>;

    async fn record_add(&self, name: &str, config: &ServerConfig) -> GatewayResult<()>;

    async fn record_remove(&self, name: &str) -> GatewayResult<()>;
}

/// YAML-file store. A missing file reads as an empty registry.
pub struct YamlConfigStore {
    path: PathBuf,
    /// Serializes the read-modify-write cycles of `record_add` and
    /// `record_remove`; without it two concurrent records can lose one
    /// of the updates.
    write_lock: Mutex<()>,
}

impl YamlConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    async fn read_map(&self) -> GatewayResult<BTreeMap<String, ServerConfig>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => serde_yaml::from_str(&content)
                .map_err(|e| GatewayError::Store(format!("parse {}: {}", self.path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(GatewayError::Store(format!(
                "read {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    async fn write_map(&self, map: &BTreeMap<String, ServerConfig>) -> GatewayResult<()> {
        let content = serde_yaml::to_string(map)
            .map_err(|e| GatewayError::Store(format!("serialize config: {}", e)))?;
        tokio::fs::write(&self.path, content)
            .await
            .map_err(|e| GatewayError::Store(format!("write {}: {}", self.path.display(), e)))
    }
}

#[async_trait]
impl ConfigStore for YamlConfigStore {
    async fn load_all(&self) -> GatewayResult<Vec<(String, ServerConfig)>> {
        Ok(self.read_map().await?.into_iter().collect())
    }

    async fn record_add(&self, name: &str, config: &ServerConfig) -> GatewayResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut map = self.read_map().await?;
        map.insert(name.to_string(), config.clone());
        self.write_map(&map).await
    }

    async fn record_remove(&self, name: &str) -> GatewayResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut map = self.read_map().await?;
        map.remove(name);
        self.write_map(&map).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn stdio_config(command: &str) -> ServerConfig {
        ServerConfig::Stdio {
            command: command.to_string(),
            args: vec!["--stdio".to_string()],
            envs: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = YamlConfigStore::new(dir.path().join("servers.yaml"));
        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_add_remove_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = YamlConfigStore::new(dir.path().join("servers.yaml"));

        store.record_add("files", &stdio_config("mcp-files")).await.unwrap();
        store
            .record_add(
                "search",
                &ServerConfig::Streamable {
                    url: "https://example.com/mcp".to_string(),
                    headers: HashMap::new(),
                },
            )
            .await
            .unwrap();

        let mut loaded = store.load_all().await.unwrap();
        loaded.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].0, "files");
        assert!(matches!(loaded[0].1, ServerConfig::Stdio { .. }));
        assert!(matches!(loaded[1].1, ServerConfig::Streamable { .. }));

        store.record_remove("files").await.unwrap();
        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].0, "search");
    }

    #[tokio::test]
    async fn test_concurrent_records_lose_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = YamlConfigStore::new(dir.path().join("servers.yaml"));

        let files_config = stdio_config("mcp-files");
        let search_config = stdio_config("mcp-search");
        let (a, b) = tokio::join!(
            store.record_add("files", &files_config),
            store.record_add("search", &search_config),
        );
        a.unwrap();
        b.unwrap();

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 2);
    }

    #[tokio::test]
    async fn test_record_add_replaces_existing_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = YamlConfigStore::new(dir.path().join("servers.yaml"));

        store.record_add("files", &stdio_config("old-cmd")).await.unwrap();
        store.record_add("files", &stdio_config("new-cmd")).await.unwrap();

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        match &loaded[0].1 {
            ServerConfig::Stdio { command, .. } => assert_eq!(command, "new-cmd"),
            _ => panic!("expected stdio config"),
        }
    }

    #[tokio::test]
    async fn test_corrupt_file_surfaces_store_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("servers.yaml");
        tokio::fs::write(&path, ":: not yaml ::[").await.unwrap();

        let store = YamlConfigStore::new(path);
        assert!(matches!(
            store.load_all().await.unwrap_err(),
            GatewayError::Store(_)
        ));
    }
}
