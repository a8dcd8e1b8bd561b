//! In-memory template provider

use super::Source;
use crate::ast::AstKey;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

struct Entry {
    body: Vec<u8>,
    updated: SystemTime,
}

/// Template provider backed by a shared in-memory table. Updating an entry
/// refreshes its timestamp, which drives the auto-update path.
#[derive(Clone, Default)]
pub struct MemorySource {
    templates: Arc<RwLock<HashMap<String, Entry>>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a template body.
    pub fn insert(&self, name: impl Into<String>, body: impl Into<Vec<u8>>) {
        if let Ok(mut templates) = self.templates.write() {
            templates.insert(
                name.into(),
                Entry {
                    body: body.into(),
                    updated: SystemTime::now(),
                },
            );
        }
    }

    pub fn remove(&self, name: &str) -> bool {
        self.templates
            .write()
            .map(|mut templates| templates.remove(name).is_some())
            .unwrap_or(false)
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, Entry>>> {
        self.templates
            .read()
            .map_err(|_| Error::unknown("memory source lock poisoned"))
    }
}

#[async_trait]
impl Source for MemorySource {
    async fn file(&self, key: &AstKey, _escape: bool) -> Result<(String, Vec<u8>)> {
        let templates = self.read()?;
        let entry = templates
            .get(&key.name)
            .ok_or_else(|| Error::NoTemplateExists(key.name.clone()))?;
        Ok((key.name.clone(), entry.body.clone()))
    }

    async fn timestamp(&self, key: &AstKey) -> Result<SystemTime> {
        let templates = self.read()?;
        templates
            .get(&key.name)
            .map(|e| e.updated)
            .ok_or_else(|| Error::NoTemplateExists(key.name.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_and_read() {
        let source = MemorySource::new();
        source.insert("index", "Hello");
        let (name, bytes) = source
            .file(&AstKey::searched("index"), false)
            .await
            .unwrap();
        assert_eq!(name, "index");
        assert_eq!(bytes, b"Hello");
    }

    #[tokio::test]
    async fn test_missing_template() {
        let source = MemorySource::new();
        let error = source
            .file(&AstKey::searched("absent"), false)
            .await
            .unwrap_err();
        assert!(matches!(error, Error::NoTemplateExists(name) if name == "absent"));
    }

    #[tokio::test]
    async fn test_update_refreshes_timestamp() {
        let source = MemorySource::new();
        source.insert("index", "v1");
        let first = source
            .timestamp(&AstKey::searched("index"))
            .await
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        source.insert("index", "v2");
        let second = source
            .timestamp(&AstKey::searched("index"))
            .await
            .unwrap();
        assert!(second > first);
    }
}
