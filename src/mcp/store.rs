//! Server Registry: the durable name → descriptor mapping.
//!
//! The core only ever calls [`ServerRegistry::list`], once per turn, and works
//! from that snapshot. Writes come from the settings surface and are validated
//! here before they touch the backing store.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::BridgeError;
use crate::mcp::config::{ServerDescriptor, ServerMap, validate_server_name};

/// Injected registry capability.
#[async_trait]
pub trait ServerRegistry: Send + Sync + std::fmt::Debug {
    /// Snapshot of every configured server.
    async fn list(&self) -> Result<ServerMap, BridgeError>;

    /// Add or replace an entry.
    async fn add(&self, name: &str, descriptor: ServerDescriptor) -> Result<(), BridgeError>;

    /// Remove an entry. Returns whether it existed.
    async fn remove(&self, name: &str) -> Result<bool, BridgeError>;
}

fn check_entry(name: &str, descriptor: &ServerDescriptor) -> Result<(), BridgeError> {
    validate_server_name(name)?;
    descriptor.validate(name)
}

/// Registry held in process memory.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    servers: RwLock<ServerMap>,
}

impl MemoryRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_servers(servers: ServerMap) -> Self {
        Self {
            servers: RwLock::new(servers),
        }
    }

    fn poisoned<T>(err: std::sync::PoisonError<T>) -> BridgeError {
        BridgeError::Storage(format!("registry lock poisoned: {err}"))
    }
}

#[async_trait]
impl ServerRegistry for MemoryRegistry {
    async fn list(&self) -> Result<ServerMap, BridgeError> {
        let guard = self.servers.read().map_err(Self::poisoned)?;
        Ok(guard.clone())
    }

    async fn add(&self, name: &str, descriptor: ServerDescriptor) -> Result<(), BridgeError> {
        check_entry(name, &descriptor)?;
        let mut guard = self.servers.write().map_err(Self::poisoned)?;
        guard.insert(name.to_string(), descriptor);
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<bool, BridgeError> {
        let mut guard = self.servers.write().map_err(Self::poisoned)?;
        Ok(guard.remove(name).is_some())
    }
}

/// Registry backed by a JSON file with a top-level `mcpServers` object.
///
/// Other top-level keys in the file are preserved on write. A missing file
/// reads as an empty registry.
#[derive(Debug)]
pub struct FileRegistry {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_document(&self) -> Result<serde_json::Map<String, serde_json::Value>, BridgeError> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(serde_json::Map::new());
            }
            Err(e) => {
                return Err(BridgeError::Storage(format!(
                    "failed to read {}: {e}",
                    self.path.display()
                )));
            }
        };
        if text.trim().is_empty() {
            return Ok(serde_json::Map::new());
        }
        match serde_json::from_str::<serde_json::Value>(&text) {
            Ok(serde_json::Value::Object(map)) => Ok(map),
            Ok(_) => Err(BridgeError::Storage(format!(
                "{} is not a JSON object",
                self.path.display()
            ))),
            Err(e) => Err(BridgeError::Storage(format!(
                "failed to parse {}: {e}",
                self.path.display()
            ))),
        }
    }

    /// The raw `mcpServers` object. Absent or `null` reads as empty.
    fn raw_servers(
        &self,
        doc: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<serde_json::Map<String, serde_json::Value>, BridgeError> {
        match doc.get("mcpServers") {
            None | Some(serde_json::Value::Null) => Ok(serde_json::Map::new()),
            Some(serde_json::Value::Object(map)) => Ok(map.clone()),
            Some(_) => Err(BridgeError::Storage(format!(
                "mcpServers in {} is not a JSON object",
                self.path.display()
            ))),
        }
    }

    /// Parse entries one by one. An unreadable entry is logged and skipped
    /// so the others stay usable.
    fn servers_of(
        &self,
        doc: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<ServerMap, BridgeError> {
        let mut servers = ServerMap::new();
        for (name, raw) in self.raw_servers(doc)? {
            match read_entry(&name, raw) {
                Ok(descriptor) => {
                    servers.insert(name, descriptor);
                }
                Err(err) => tracing::warn!(
                    server = %name,
                    path = %self.path.display(),
                    error = %err,
                    "Skipping unreadable MCP server entry"
                ),
            }
        }
        Ok(servers)
    }

    async fn write_document(
        &self,
        mut doc: serde_json::Map<String, serde_json::Value>,
        servers: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), BridgeError> {
        doc.insert("mcpServers".to_string(), serde_json::Value::Object(servers));
        let text = serde_json::to_string_pretty(&serde_json::Value::Object(doc))
            .map_err(|e| BridgeError::Storage(format!("failed to encode registry: {e}")))?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, text)
            .await
            .map_err(|e| BridgeError::Storage(format!("failed to write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| {
            BridgeError::Storage(format!("failed to replace {}: {e}", self.path.display()))
        })
    }
}

/// Read one stored entry. Hand-edited files often leave out `env` on a
/// process entry, so it defaults to empty here; the write path still
/// requires it.
fn read_entry(name: &str, mut raw: serde_json::Value) -> Result<ServerDescriptor, BridgeError> {
    if let serde_json::Value::Object(entry) = &mut raw
        && entry.contains_key("command")
    {
        entry
            .entry("env")
            .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
    }
    ServerDescriptor::from_value(name, raw)
}

#[async_trait]
impl ServerRegistry for FileRegistry {
    async fn list(&self) -> Result<ServerMap, BridgeError> {
        let doc = self.read_document().await?;
        self.servers_of(&doc)
    }

    async fn add(&self, name: &str, descriptor: ServerDescriptor) -> Result<(), BridgeError> {
        check_entry(name, &descriptor)?;
        let _guard = self.write_lock.lock().await;
        let value = serde_json::to_value(&descriptor)
            .map_err(|e| BridgeError::Storage(format!("failed to encode registry: {e}")))?;
        let doc = self.read_document().await?;
        // Work on the raw entries so ones this process cannot read survive the write.
        let mut servers = self.raw_servers(&doc)?;
        servers.insert(name.to_string(), value);
        self.write_document(doc, servers).await?;
        tracing::info!(server = %name, path = %self.path.display(), "MCP server saved");
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<bool, BridgeError> {
        let _guard = self.write_lock.lock().await;
        let doc = self.read_document().await?;
        let mut servers = self.raw_servers(&doc)?;
        let existed = servers.remove(name).is_some();
        if existed {
            self.write_document(doc, servers).await?;
            tracing::info!(server = %name, path = %self.path.display(), "MCP server removed");
        }
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn echo() -> ServerDescriptor {
        ServerDescriptor::Process {
            command: "echo".into(),
            args: vec!["hi".into()],
            env: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_memory_registry_crud() {
        let registry = MemoryRegistry::new();
        registry.add("x", echo()).await.unwrap();
        assert_eq!(registry.list().await.unwrap().get("x"), Some(&echo()));

        assert!(registry.remove("x").await.unwrap());
        assert!(!registry.remove("x").await.unwrap());
        assert!(registry.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_invalid_entries_before_storing() {
        let registry = MemoryRegistry::new();
        let err = registry.add("", echo()).await.unwrap_err();
        assert!(matches!(err, BridgeError::Config { .. }));

        let bad = ServerDescriptor::Network { url: "nope".into() };
        assert!(registry.add("web", bad).await.is_err());
        assert!(registry.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_registry_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FileRegistry::new(dir.path().join("mcp.json"));
        assert!(registry.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_registry_preserves_other_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "theme": "dark", "mcpServers": {} }"#).unwrap();

        let registry = FileRegistry::new(&path);
        registry.add("x", echo()).await.unwrap();

        let doc: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(doc["theme"], "dark");
        assert_eq!(doc["mcpServers"]["x"]["command"], "echo");

        // A fresh handle sees the persisted entry.
        let reopened = FileRegistry::new(&path);
        assert_eq!(reopened.list().await.unwrap().get("x"), Some(&echo()));

        assert!(reopened.remove("x").await.unwrap());
        assert!(registry.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_registry_reports_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = FileRegistry::new(&path).list().await.unwrap_err();
        assert!(matches!(err, BridgeError::Storage(_)));
    }

    #[tokio::test]
    async fn test_file_registry_skips_bad_entries_and_keeps_good_ones() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp.json");
        std::fs::write(
            &path,
            r#"{ "mcpServers": {
                "good": { "command": "echo", "args": ["hi"], "env": {} },
                "noenv": { "command": "npx", "args": ["-y", "@mcpcentral/mcp-time"] },
                "broken": { "args": [] },
                "badurl": { "url": "ftp://example.com" }
            } }"#,
        )
        .unwrap();

        let registry = FileRegistry::new(&path);
        let servers = registry.list().await.unwrap();
        assert_eq!(
            servers.keys().map(String::as_str).collect::<Vec<_>>(),
            ["good", "noenv"]
        );
        assert_eq!(servers.get("good"), Some(&echo()));
        assert!(matches!(
            servers.get("noenv"),
            Some(ServerDescriptor::Process { env, .. }) if env.is_empty()
        ));

        // Writes leave entries they cannot read untouched.
        let web = ServerDescriptor::Network {
            url: "https://example.com/mcp".into(),
        };
        registry.add("web", web).await.unwrap();
        assert!(registry.remove("good").await.unwrap());
        let doc: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(doc["mcpServers"]["broken"], serde_json::json!({ "args": [] }));
        assert!(doc["mcpServers"]["noenv"].get("env").is_none());
        assert!(doc["mcpServers"].get("good").is_none());
        assert_eq!(doc["mcpServers"]["web"]["url"], "https://example.com/mcp");
    }

    #[tokio::test]
    async fn test_file_registry_rejects_non_object_server_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp.json");
        std::fs::write(&path, r#"{ "mcpServers": ["echo"] }"#).unwrap();
        let err = FileRegistry::new(&path).list().await.unwrap_err();
        assert!(matches!(err, BridgeError::Storage(_)));
    }
}
